//! Source URL handling for the feed converter

use crate::error::{FeedError, FeedResult};
use std::path::Path;
use std::sync::LazyLock;

const STREAM_SUFFIX: &str = ".stream";

/// Stream names become directory names, so only plain path-safe characters pass
static STREAM_NAME_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]*$")
        .expect("stream name regex is a compile-time constant and always valid")
});

fn invalid(url: &str, reason: &str) -> FeedError {
    FeedError::InvalidSourceUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

/// Derive the stream name: the last path segment with its `.stream` suffix removed
///
/// `rtsp://host/path/mystream.stream` yields `mystream`.
pub fn parse_stream_name(source_url: &str) -> FeedResult<String> {
    let url = url::Url::parse(source_url).map_err(|e| invalid(source_url, &e.to_string()))?;
    if url.host_str().is_none() {
        return Err(invalid(source_url, "missing host"));
    }

    let last_segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    let name = last_segment
        .strip_suffix(STREAM_SUFFIX)
        .ok_or_else(|| invalid(source_url, "path must end in <name>.stream"))?;

    if !STREAM_NAME_REGEX.is_match(name) {
        return Err(invalid(source_url, "stream name contains unsupported characters"));
    }
    Ok(name.to_string())
}

/// Expand the whitespace-separated argument template
///
/// Arguments are passed to the converter directly, never through a shell.
#[must_use]
pub fn render_pipeline(template: &str, source_url: &str, output_dir: &Path) -> Vec<String> {
    let output_dir = output_dir.to_string_lossy();
    template
        .split_whitespace()
        .map(|arg| {
            arg.replace("{source_url}", source_url)
                .replace("{output_dir}", &output_dir)
        })
        .collect()
}
