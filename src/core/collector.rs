//! Dataset archiver.
//!
//! Claims images from every channel and keeps them as numbered JPEG files
//! under `<data>/dataset/<cid>/`. It consumes the same slots as the event
//! engine, so the two must not run against one data directory at once.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::paths::DataLayout;
use crate::domain::ImageRecord;

use super::handoff;
use super::shutdown::shutdown_signal;

/// `<iter:05>.jpg`
pub fn dataset_file_name(iteration: u64) -> String {
    format!("{:05}.jpg", iteration)
}

pub struct DatasetCollector {
    layout: DataLayout,
}

impl DatasetCollector {
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    /// Claim one image per channel; returns the files written
    pub fn collect_once(&self) -> Vec<PathBuf> {
        let mut stored = Vec::new();

        for channel in handoff::list_subdirs(&self.layout.image_root()) {
            let image: ImageRecord = match handoff::claim_json(&self.layout.image_slot(&channel)) {
                Ok(Some(image)) => image,
                Ok(None) => continue,
                Err(e) => {
                    warn!(channel = %channel, "Discarding unreadable image: {}", e);
                    continue;
                }
            };

            let dir = self.layout.dataset_root().join(&channel);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                warn!(channel = %channel, "Failed to create {}: {}", dir.display(), e);
                continue;
            }

            let target = dir.join(dataset_file_name(image.iteration));
            match handoff::publish_bytes(&target, &image.image_bytes) {
                Ok(()) => {
                    debug!(channel = %channel, iter = image.iteration, "Image archived");
                    stored.push(target);
                }
                Err(e) => warn!(channel = %channel, "Failed to archive image: {}", e),
            }
        }
        stored
    }

    pub async fn run(self, every: Duration) -> Result<()> {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        info!(dataset = %self.layout.dataset_root().display(), "Dataset collector started");

        let mut total = 0usize;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            total += self.collect_once().len();
        }

        info!(images = total, "Dataset collector stopped");
        Ok(())
    }
}
