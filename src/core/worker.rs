//! One channel's capture loop.
//!
//! A worker runs as its own OS process so a wedged capture library cannot
//! take anything else down with it. It shares nothing with the supervisor
//! except three files in its channel directory: the image slot it publishes
//! to, the heartbeat it stamps every tick, and the `image.off` gate it obeys.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::paths::{HEARTBEAT_FILE, IMAGE_OFF_FILE, IMAGE_SLOT_FILE};
use crate::config::TimingSettings;
use crate::domain::{ChannelConfig, ImageRecord};
use crate::ingest::{AcquireError, FrameSource};

use super::handoff;
use super::shutdown::shutdown_signal;

/// What one scheduler tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// `image.off` present
    Disabled,
    /// Not this channel's turn
    NotDue,
    Published,
    /// Acquisition or publish failed; retried next due tick
    Failed,
}

pub struct ChannelWorker {
    channel: ChannelConfig,
    offset: u64,
    slot: PathBuf,
    off_marker: PathBuf,
    heartbeat: PathBuf,
    source: FrameSource,
    failing: bool,
}

impl ChannelWorker {
    /// Worker publishing into `<image_root>/<channel id>/`
    pub fn new(channel: ChannelConfig, offset: u64, image_root: &Path, timing: &TimingSettings) -> Result<Self> {
        let source = FrameSource::for_channel(&channel, timing)
            .with_context(|| format!("Channel '{}' has no usable source", channel.id))?;
        let channel_dir = image_root.join(&channel.id);
        Ok(Self::with_source(channel, offset, &channel_dir, source))
    }

    /// Worker with an explicit source, publishing into `channel_dir`
    pub fn with_source(channel: ChannelConfig, offset: u64, channel_dir: &Path, source: FrameSource) -> Self {
        Self {
            channel,
            offset,
            slot: channel_dir.join(IMAGE_SLOT_FILE),
            off_marker: channel_dir.join(IMAGE_OFF_FILE),
            heartbeat: channel_dir.join(HEARTBEAT_FILE),
            source,
            failing: false,
        }
    }

    pub fn channel(&self) -> &ChannelConfig {
        &self.channel
    }

    /// Run one scheduler tick.
    ///
    /// Only fatal acquisition errors are returned; everything else is logged
    /// and reported as [`TickOutcome::Failed`].
    #[instrument(skip(self), fields(channel = %self.channel.id))]
    pub async fn tick(&mut self, iteration: u64) -> Result<TickOutcome, AcquireError> {
        // Stamped before any gate so a disabled or slow channel still looks alive
        if let Err(e) = handoff::write_heartbeat(&self.heartbeat, iteration) {
            debug!(error = %e, "Heartbeat not written");
        }

        if handoff::marker_present(&self.off_marker) {
            return Ok(TickOutcome::Disabled);
        }

        if !self.channel.is_due(iteration, self.offset) {
            return Ok(TickOutcome::NotDue);
        }

        let jpeg = match self.source.acquire(&self.channel).await {
            Ok(jpeg) => jpeg,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.note_failure(&e);
                return Ok(TickOutcome::Failed);
            }
        };

        let record = ImageRecord {
            channel_id: self.channel.id.clone(),
            display_name: self.channel.display_name.clone(),
            image_bytes: jpeg,
            capture_time: Utc::now(),
            iteration,
        };

        if let Err(e) = handoff::publish_json(&self.slot, &record) {
            self.note_failure(&e);
            return Ok(TickOutcome::Failed);
        }

        if self.failing {
            info!(iteration, "Channel recovered");
            self.failing = false;
        }
        Ok(TickOutcome::Published)
    }

    fn note_failure(&mut self, error: &dyn std::fmt::Display) {
        if self.failing {
            debug!(error = %error, "Still failing");
        } else {
            warn!(error = %error, "Frame acquisition failed");
            self.failing = true;
        }
    }

    /// Tick until SIGTERM / Ctrl+C or a fatal acquisition error
    pub async fn run(mut self, tick_every: Duration) -> Result<()> {
        let mut interval = tokio::time::interval(tick_every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        info!(channel = %self.channel.id, offset = self.offset, "Worker started");

        let mut iteration: u64 = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(channel = %self.channel.id, "Worker stopping");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            self.tick(iteration)
                .await
                .with_context(|| format!("Worker for channel '{}' cannot continue", self.channel.id))?;
            iteration += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn write_png(path: &Path) {
        let mut png = Cursor::new(Vec::new());
        RgbImage::from_pixel(16, 12, image::Rgb([1, 2, 3]))
            .write_to(&mut png, ImageFormat::Png)
            .unwrap();
        std::fs::write(path, png.into_inner()).unwrap();
    }

    fn file_worker(temp: &TempDir, divisor: u32) -> (ChannelWorker, PathBuf, PathBuf) {
        let picture = temp.path().join("cam.png");
        write_png(&picture);

        let image_root = temp.path().join("images");
        std::fs::create_dir_all(image_root.join("porch")).unwrap();

        let mut channel = ChannelConfig::new("porch", "front porch", format!("file://{}", picture.display()));
        channel.poll_divisor = divisor;
        channel.width = 8;
        channel.height = 6;

        let worker = ChannelWorker::new(channel, 0, &image_root, &TimingSettings::default()).unwrap();
        (worker, image_root.join("porch"), picture)
    }

    #[tokio::test]
    async fn test_tick_publishes_image_record() {
        let temp = TempDir::new().unwrap();
        let (mut worker, dir, _) = file_worker(&temp, 1);

        assert_eq!(worker.tick(7).await.unwrap(), TickOutcome::Published);

        let record: ImageRecord = handoff::claim_json(&dir.join(IMAGE_SLOT_FILE)).unwrap().unwrap();
        assert_eq!(record.channel_id, "porch");
        assert_eq!(record.iteration, 7);
        assert_eq!(image::guess_format(&record.image_bytes).unwrap(), ImageFormat::Jpeg);
        assert_eq!(handoff::read_heartbeat(&dir.join(HEARTBEAT_FILE)), Some(7));
    }

    #[tokio::test]
    async fn test_divisor_gates_polling_but_not_heartbeat() {
        let temp = TempDir::new().unwrap();
        let (mut worker, dir, _) = file_worker(&temp, 3);

        assert_eq!(worker.tick(1).await.unwrap(), TickOutcome::NotDue);
        assert_eq!(handoff::read_heartbeat(&dir.join(HEARTBEAT_FILE)), Some(1));
        assert!(!dir.join(IMAGE_SLOT_FILE).exists());

        assert_eq!(worker.tick(3).await.unwrap(), TickOutcome::Published);
    }

    #[tokio::test]
    async fn test_off_marker_disables_channel() {
        let temp = TempDir::new().unwrap();
        let (mut worker, dir, _) = file_worker(&temp, 1);
        handoff::set_marker(&dir.join(IMAGE_OFF_FILE)).unwrap();

        assert_eq!(worker.tick(0).await.unwrap(), TickOutcome::Disabled);
        assert!(!dir.join(IMAGE_SLOT_FILE).exists());
        assert_eq!(handoff::read_heartbeat(&dir.join(HEARTBEAT_FILE)), Some(0));
    }

    #[tokio::test]
    async fn test_bad_frames_fail_softly_then_recover() {
        let temp = TempDir::new().unwrap();
        let (mut worker, dir, picture) = file_worker(&temp, 1);

        std::fs::write(&picture, b"<html>camera offline</html>").unwrap();
        assert_eq!(worker.tick(0).await.unwrap(), TickOutcome::Failed);
        assert!(worker.failing);

        write_png(&picture);
        assert_eq!(worker.tick(1).await.unwrap(), TickOutcome::Published);
        assert!(!worker.failing);
        assert!(dir.join(IMAGE_SLOT_FILE).exists());
    }
}
