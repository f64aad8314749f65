use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Invalid source URL {url}: {reason}")]
    InvalidSourceUrl { url: String, reason: String },

    #[error("Feed slot busy: stream {stream_name} is running")]
    Busy { stream_name: String },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;
