//! Persistent RTSP capture.
//!
//! Opening an RTSP session costs seconds, so the stream stays open across
//! scheduler ticks. An `ffmpeg` child decodes the stream at a low sample rate
//! into scaled raw RGB frames on stdout; a reader task keeps only the newest
//! one. Grabbing a frame therefore always yields the latest buffered picture,
//! never a backlog.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::RgbFrame;
use super::AcquireError;

/// Anything that hands out decoded frames one at a time
#[async_trait]
pub trait FrameFeed: Send {
    /// Wait up to `wait` for a frame newer than the last one returned
    async fn next_frame(&mut self, wait: Duration) -> Result<RgbFrame, AcquireError>;
}

/// Pull frames until one passes the row-variation check.
///
/// A closed stream ends the attempt immediately; timeouts and corrupt frames
/// use up one of `retries` attempts.
pub async fn grab_clean_frame<F: FrameFeed + ?Sized>(
    feed: &mut F,
    retries: u32,
    threshold: f64,
    wait: Duration,
) -> Result<RgbFrame, AcquireError> {
    let attempts = retries.max(1);
    let mut last_error = AcquireError::Timeout(wait);

    for attempt in 1..=attempts {
        match feed.next_frame(wait).await {
            Ok(frame) => {
                let score = frame.variation();
                if score >= threshold {
                    return Ok(frame);
                }
                debug!(attempt, score, threshold, "Discarding truncated frame");
                last_error = AcquireError::Corrupt {
                    score,
                    threshold,
                    attempts,
                };
            }
            Err(AcquireError::StreamClosed) => return Err(AcquireError::StreamClosed),
            Err(e) => {
                debug!(attempt, error = %e, "No frame from stream");
                last_error = e;
            }
        }
    }

    Err(last_error)
}

// ============================================================================
// ffmpeg-backed feed
// ============================================================================

type Latest = Option<Arc<Vec<u8>>>;

pub struct FfmpegFeed {
    child: Child,
    frames: watch::Receiver<Latest>,
    reader: JoinHandle<()>,
    width: u32,
    height: u32,
}

impl FfmpegFeed {
    pub fn spawn(url: &str, width: u32, height: u32, fps: u32) -> Result<Self, AcquireError> {
        let filter = format!("fps={},scale={}:{}", fps.max(1), width, height);

        let mut child = Command::new("ffmpeg")
            .args(["-nostdin", "-loglevel", "error", "-rtsp_transport", "tcp", "-i", url])
            .args(["-an", "-vf", &filter, "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(AcquireError::Spawn)?;

        let stdout = child.stdout.take().ok_or(AcquireError::StreamClosed)?;
        let (tx, rx) = watch::channel(None);
        let reader = tokio::spawn(read_frames(stdout, RgbFrame::byte_len(width, height), tx));

        Ok(Self {
            child,
            frames: rx,
            reader,
            width,
            height,
        })
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for FfmpegFeed {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Overwrite the shared slot with each complete frame; exits when ffmpeg does
async fn read_frames(mut stdout: ChildStdout, frame_len: usize, tx: watch::Sender<Latest>) {
    loop {
        let mut buf = vec![0u8; frame_len];
        if stdout.read_exact(&mut buf).await.is_err() {
            break;
        }
        if tx.send(Some(Arc::new(buf))).is_err() {
            break;
        }
    }
}

#[async_trait]
impl FrameFeed for FfmpegFeed {
    async fn next_frame(&mut self, wait: Duration) -> Result<RgbFrame, AcquireError> {
        match tokio::time::timeout(wait, self.frames.changed()).await {
            Err(_) => Err(AcquireError::Timeout(wait)),
            Ok(Err(_)) => Err(AcquireError::StreamClosed),
            Ok(Ok(())) => {
                let latest = self.frames.borrow_and_update().clone();
                let pixels = latest.ok_or(AcquireError::Timeout(wait))?;
                Ok(RgbFrame {
                    width: self.width,
                    height: self.height,
                    pixels: pixels.to_vec(),
                })
            }
        }
    }
}

// ============================================================================
// Channel source
// ============================================================================

/// RTSP source for one channel; reopens the stream after it dies
pub struct RtspSource {
    url: String,
    fps: u32,
    open_timeout: Duration,
    feed: Option<FfmpegFeed>,
}

impl RtspSource {
    pub fn new(url: impl Into<String>, fps: u32, open_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            fps: fps.max(1),
            open_timeout,
            feed: None,
        }
    }

    fn frame_wait(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps)).max(Duration::from_millis(100))
    }

    pub async fn grab(
        &mut self,
        width: u32,
        height: u32,
        retries: u32,
        threshold: f64,
    ) -> Result<RgbFrame, AcquireError> {
        if let Some(feed) = self.feed.as_mut() {
            if !feed.is_alive() {
                warn!(url = %self.url, "RTSP decoder exited, reopening");
                self.feed = None;
            }
        }

        let fresh = self.feed.is_none();
        if fresh {
            info!(url = %self.url, "Opening RTSP stream");
            self.feed = Some(FfmpegFeed::spawn(&self.url, width, height, self.fps)?);
        }

        // Connecting and buffering the first frame takes far longer than one frame period
        let wait = if fresh { self.open_timeout } else { self.frame_wait() };
        let Some(feed) = self.feed.as_mut() else {
            return Err(AcquireError::StreamClosed);
        };

        let result = grab_clean_frame(feed, retries, threshold, wait).await;
        if matches!(result, Err(AcquireError::StreamClosed)) {
            self.feed = None;
        }
        result
    }
}
