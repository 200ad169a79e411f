//! Video channel definitions (one accepted `sources.json` generation).

use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_DIVISOR: u32 = 2;
pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_HEIGHT: u32 = 768;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
pub const DEFAULT_RTSP_RETRIES: u32 = 5;
pub const DEFAULT_RTSP_THRESHOLD: f64 = 0.2;

/// One configured video channel, with all defaults filled in.
///
/// Serialized with the same keys as a `sources.json` entry so the supervisor
/// can hand it to a worker process verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Stable identity; also the channel directory name
    #[serde(rename = "channel")]
    pub id: String,

    /// Spoken name ("front porch")
    #[serde(rename = "name")]
    pub display_name: String,

    #[serde(rename = "url")]
    pub source_url: String,

    /// Poll every N scheduler ticks
    #[serde(rename = "upd_int")]
    pub poll_divisor: u32,

    #[serde(rename = "img_w")]
    pub width: u32,

    #[serde(rename = "img_h")]
    pub height: u32,

    #[serde(rename = "img_q")]
    pub jpeg_quality: u8,

    #[serde(rename = "rtsp_bf_retries")]
    pub rtsp_retry_count: u32,

    /// Minimum row-variation score for an RTSP frame to be accepted
    #[serde(rename = "rtsp_bf_thresh")]
    pub rtsp_corruption_threshold: f64,
}

impl ChannelConfig {
    /// A channel with default acquisition parameters
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            source_url: source_url.into(),
            poll_divisor: DEFAULT_POLL_DIVISOR,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            rtsp_retry_count: DEFAULT_RTSP_RETRIES,
            rtsp_corruption_threshold: DEFAULT_RTSP_THRESHOLD,
        }
    }

    pub fn source_kind(&self) -> SourceKind {
        SourceKind::from_url(&self.source_url)
    }

    /// Whether this channel polls on the given scheduler tick.
    ///
    /// `offset` staggers channels that share a divisor.
    pub fn is_due(&self, tick: u64, offset: u64) -> bool {
        let divisor = u64::from(self.poll_divisor.max(1));
        (tick + offset) % divisor == 0
    }
}

/// Acquisition transport derived from the URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Http,
    Rtsp,
    Unsupported,
}

impl SourceKind {
    pub fn from_url(url: &str) -> Self {
        let lower = url.trim().to_ascii_lowercase();
        if lower.starts_with("file://") {
            SourceKind::File
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceKind::Http
        } else if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else {
            SourceKind::Unsupported
        }
    }
}

/// One accepted generation of channel definitions
#[derive(Debug, Clone, PartialEq)]
pub struct SourcesConfig {
    pub version: u64,
    pub channels: Vec<ChannelConfig>,
}

impl SourcesConfig {
    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }
}
