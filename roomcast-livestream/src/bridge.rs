// External feed bridge
//
// Supervises the single converter process that turns a pull-based source
// (RTSP) into a segmented playlist on disk. The slot holds at most one
// running feed per server instance; a second ingest either replaces the
// running feed or is rejected, depending on `SlotPolicy`.
//
// Lifecycle:
// - ingest: parse stream name, prepare output dir, spawn, supervise
// - release_for: owner disconnected, graceful termination
// - natural exit: supervisor clears the slot and records the exit status

use crate::error::{FeedError, FeedResult};
use crate::source::{parse_stream_name, render_pipeline};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What happens when a feed is requested while another one is running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotPolicy {
    /// Terminate the running feed, then start the new one
    #[default]
    Replace,
    /// Refuse the new feed with `FeedError::Busy`
    Reject,
}

#[derive(Debug, Clone)]
pub struct FeedBridgeConfig {
    /// Converter executable
    pub program: String,
    /// Whitespace-separated argument template with `{source_url}` / `{output_dir}`
    pub pipeline: String,
    /// Parent of the per-stream output directories
    pub files_dir: PathBuf,
    /// How long the converter gets to exit after SIGINT before it is killed
    pub terminate_grace: Duration,
    pub policy: SlotPolicy,
}

impl Default for FeedBridgeConfig {
    fn default() -> Self {
        Self {
            program: "gst-launch-1.0".to_string(),
            pipeline: "rtspsrc location={source_url} protocols=tcp is-live=true ! rtph264depay ! avdec_h264 \
                       ! x264enc speed-preset=ultrafast tune=zerolatency byte-stream=true bitrate=3000 threads=1 \
                       ! mpegtsmux ! hlssink max-files=10 playlist-location={output_dir}/playlist.m3u8 \
                       location={output_dir}/segment%05d.ts target-duration=10"
                .to_string(),
            files_dir: PathBuf::from("./files"),
            terminate_grace: Duration::from_secs(5),
            policy: SlotPolicy::Replace,
        }
    }
}

/// A started feed, as reported back to the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSession {
    pub stream_name: String,
    pub source_url: String,
    pub output_dir: PathBuf,
}

/// Observable state of the bridge slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum FeedStatus {
    Idle,
    #[serde(rename_all = "camelCase")]
    Running {
        stream_name: String,
        source_url: String,
        owner: String,
        pid: Option<u32>,
        started_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Exited {
        stream_name: String,
        code: Option<i32>,
        success: bool,
        finished_at: DateTime<Utc>,
    },
}

struct ActiveFeed {
    generation: u64,
    owner: String,
    stream_name: String,
    stop: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

impl ActiveFeed {
    /// Ask the supervisor to terminate the process and wait until it is gone
    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.supervisor.await {
            error!(stream = %self.stream_name, error = %e, "Feed supervisor task failed");
        }
    }
}

/// Single-slot supervisor for the external converter process
pub struct FeedBridge {
    config: FeedBridgeConfig,
    slot: Mutex<Option<ActiveFeed>>,
    /// Serializes ingest/release so a replacement never overlaps its predecessor
    ops: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    status_tx: watch::Sender<FeedStatus>,
}

impl FeedBridge {
    #[must_use]
    pub fn new(config: FeedBridgeConfig) -> Arc<Self> {
        let (status_tx, _) = watch::channel(FeedStatus::Idle);
        Arc::new(Self {
            config,
            slot: Mutex::new(None),
            ops: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            status_tx,
        })
    }

    #[must_use]
    pub fn files_dir(&self) -> &Path {
        &self.config.files_dir
    }

    #[must_use]
    pub fn status(&self) -> FeedStatus {
        self.status_tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<FeedStatus> {
        self.status_tx.subscribe()
    }

    /// Start converting `source_url` on behalf of `owner`
    ///
    /// The URL is validated before anything touches the filesystem.
    pub async fn ingest(self: &Arc<Self>, owner: &str, source_url: &str) -> FeedResult<FeedSession> {
        let stream_name = parse_stream_name(source_url)?;
        let _ops = self.ops.lock().await;

        let previous = {
            let mut slot = self.slot.lock();
            match (slot.as_ref(), self.config.policy) {
                (Some(active), SlotPolicy::Reject) => {
                    return Err(FeedError::Busy {
                        stream_name: active.stream_name.clone(),
                    });
                }
                _ => slot.take(),
            }
        };
        if let Some(previous) = previous {
            info!(
                stream = %previous.stream_name,
                replacement = %stream_name,
                "Replacing running feed"
            );
            previous.stop().await;
        }

        let output_dir = self.config.files_dir.join(&stream_name);
        tokio::fs::create_dir_all(&output_dir).await?;

        let args = render_pipeline(&self.config.pipeline, source_url, &output_dir);
        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FeedError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_output(stream_name.clone(), Stream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_output(stream_name.clone(), Stream::Stderr, stderr));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (stop_tx, stop_rx) = oneshot::channel();

        {
            // Holding the slot while spawning keeps a fast exit from finishing
            // before the feed is registered.
            let mut slot = self.slot.lock();
            let supervisor = tokio::spawn(supervise(
                Arc::downgrade(self),
                generation,
                stream_name.clone(),
                child,
                stop_rx,
                self.config.terminate_grace,
            ));
            *slot = Some(ActiveFeed {
                generation,
                owner: owner.to_string(),
                stream_name: stream_name.clone(),
                stop: Some(stop_tx),
                supervisor,
            });
            self.status_tx.send_replace(FeedStatus::Running {
                stream_name: stream_name.clone(),
                source_url: source_url.to_string(),
                owner: owner.to_string(),
                pid,
                started_at: Utc::now(),
            });
        }

        info!(
            stream = %stream_name,
            owner = %owner,
            pid = ?pid,
            output_dir = %output_dir.display(),
            "Feed started"
        );

        Ok(FeedSession {
            stream_name,
            source_url: source_url.to_string(),
            output_dir,
        })
    }

    /// Terminate the running feed if `owner` started it
    ///
    /// Returns false when the slot is empty or owned by someone else.
    pub async fn release_for(&self, owner: &str) -> bool {
        let _ops = self.ops.lock().await;
        let active = {
            let mut slot = self.slot.lock();
            if slot.as_ref().is_some_and(|active| active.owner == owner) {
                slot.take()
            } else {
                None
            }
        };

        match active {
            Some(active) => {
                info!(stream = %active.stream_name, owner = %owner, "Stopping feed for disconnected owner");
                active.stop().await;
                true
            }
            None => false,
        }
    }

    /// Terminate whatever is running
    pub async fn shutdown(&self) {
        let _ops = self.ops.lock().await;
        let active = self.slot.lock().take();
        if let Some(active) = active {
            info!(stream = %active.stream_name, "Stopping feed for shutdown");
            active.stop().await;
        }
    }

    fn finish(&self, generation: u64, stream_name: String, exit: &std::io::Result<ExitStatus>) {
        let mut slot = self.slot.lock();
        match slot.as_ref().map(|active| active.generation) {
            Some(current) if current == generation => {
                slot.take();
            }
            // A newer feed owns the slot and its status
            Some(_) => return,
            None => {}
        }

        let (code, success) = match exit {
            Ok(status) => (status.code(), status.success()),
            Err(_) => (None, false),
        };
        self.status_tx.send_replace(FeedStatus::Exited {
            stream_name,
            code,
            success,
            finished_at: Utc::now(),
        });
    }
}

async fn supervise(
    bridge: Weak<FeedBridge>,
    generation: u64,
    stream_name: String,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    grace: Duration,
) {
    let exit = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => terminate(&mut child, grace, &stream_name).await,
    };

    match &exit {
        Ok(status) if status.success() => info!(stream = %stream_name, "Feed process exited"),
        Ok(status) => warn!(stream = %stream_name, code = ?status.code(), "Feed process exited abnormally"),
        Err(e) => error!(stream = %stream_name, error = %e, "Failed to wait for feed process"),
    }

    if let Some(bridge) = bridge.upgrade() {
        bridge.finish(generation, stream_name, &exit);
    }
}

async fn terminate(
    child: &mut Child,
    grace: Duration,
    stream_name: &str,
) -> std::io::Result<ExitStatus> {
    send_interrupt(child, stream_name);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(stream = %stream_name, grace = ?grace, "Feed process ignored SIGINT, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

/// SIGINT lets the converter flush the playlist before exiting
#[cfg(unix)]
fn send_interrupt(child: &mut Child, stream_name: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        // Already reaped
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGINT) {
        warn!(stream = %stream_name, pid, error = %e, "Failed to signal feed process");
    }
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child, stream_name: &str) {
    if let Err(e) = child.start_kill() {
        warn!(stream = %stream_name, error = %e, "Failed to stop feed process");
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn log_output<R>(stream_name: String, which: Stream, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match which {
                Stream::Stdout => debug!(stream = %stream_name, "{line}"),
                Stream::Stderr => warn!(stream = %stream_name, "{line}"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(stream = %stream_name, error = %e, "Feed output closed");
                break;
            }
        }
    }
}
