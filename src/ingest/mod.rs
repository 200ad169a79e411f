//! Frame acquisition for channel workers.
//!
//! Each channel URL maps to one [`FrameSource`]:
//!
//! 1. **file://**: read the file on every poll
//! 2. **http(s)://**: GET a snapshot with a bounded timeout
//! 3. **rtsp://**: a persistent decoder kept open across polls, with
//!    truncated-frame detection and bounded retry
//!
//! Whatever the transport, the result is validated against a small set of
//! codecs and re-encoded as a JPEG of the channel's configured size.

pub mod fetch;
pub mod frame;
pub mod rtsp;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::TimingSettings;
use crate::domain::{ChannelConfig, SourceKind};

pub use frame::{row_variation, RgbFrame};
pub use rtsp::{grab_clean_frame, FfmpegFeed, FrameFeed, RtspSource};

/// Per-tick acquisition failures
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("Unsupported source URL: {0}")]
    UnsupportedScheme(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Source returned no data")]
    Empty,

    #[error("Not an accepted image format: {0:?}")]
    UnsupportedFormat(Option<image::ImageFormat>),

    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode JPEG: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Raw frame shorter than {expected} bytes")]
    ShortFrame { expected: usize },

    #[error("Failed to start stream decoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("No frame within {0:?}")]
    Timeout(Duration),

    #[error("Frame rejected as truncated (score {score:.3} < {threshold:.3}) after {attempts} attempts")]
    Corrupt {
        score: f64,
        threshold: f64,
        attempts: u32,
    },
}

impl AcquireError {
    /// Errors that retrying next tick cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, AcquireError::Spawn(_) | AcquireError::UnsupportedScheme(_))
    }
}

/// Transport for one channel, created once per worker
pub enum FrameSource {
    File(PathBuf),
    Http { client: reqwest::Client, url: String },
    Rtsp(RtspSource),
}

impl FrameSource {
    pub fn for_channel(channel: &ChannelConfig, timing: &TimingSettings) -> Result<Self, AcquireError> {
        match channel.source_kind() {
            SourceKind::File => Ok(FrameSource::File(fetch::file_url_path(&channel.source_url))),
            SourceKind::Http => Ok(FrameSource::Http {
                client: fetch::http_client(timing.http_timeout())?,
                url: channel.source_url.clone(),
            }),
            SourceKind::Rtsp => Ok(FrameSource::Rtsp(RtspSource::new(
                channel.source_url.clone(),
                timing.rtsp_sample_fps,
                timing.http_timeout(),
            ))),
            SourceKind::Unsupported => Err(AcquireError::UnsupportedScheme(channel.source_url.clone())),
        }
    }

    /// One validated JPEG at the channel's size and quality
    pub async fn acquire(&mut self, channel: &ChannelConfig) -> Result<Vec<u8>, AcquireError> {
        let (w, h, q) = (channel.width, channel.height, channel.jpeg_quality);
        match self {
            FrameSource::File(path) => {
                let bytes = fetch::read_file(path).await?;
                frame::normalize(&bytes, w, h, q)
            }
            FrameSource::Http { client, url } => {
                let bytes = fetch::get_bytes(client, url).await?;
                frame::normalize(&bytes, w, h, q)
            }
            FrameSource::Rtsp(source) => {
                let raw = source
                    .grab(w, h, channel.rtsp_retry_count, channel.rtsp_corruption_threshold)
                    .await?;
                frame::normalize_raw(raw, w, h, q)
            }
        }
    }
}
