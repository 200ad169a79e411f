//! Per-object, per-service rule evaluation.
//!
//! Every cycle the engine claims the newest image of each channel, asks the
//! model once per object whether that object is visible, and turns a positive
//! answer into one event record per eligible service:
//!
//! ```text
//! images/<cid>/image.json ──claim──▶ detect(object) ──▶ events/<cid>/<obj>/<svc>.json
//!                                                                      └─ <svc>.jpg
//! ```
//!
//! Records are never deleted on a negative answer; they persist as "last
//! known location" until they age out. Age-out and off markers are enforced
//! on every cycle, whether or not the channel delivered an image.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{locator_for, ObjectLocator};
use crate::config::paths::{
    event_record_file, event_snapshot_file, service_off_marker, DataLayout, OBJECT_FILE,
};
use crate::config::ModelSettings;
use crate::domain::{EventRecord, ImageRecord, ObjectConfig, ObjectDescriptor, ObjectsConfig, ServiceConfig};

use super::config_store::ConfigStore;
use super::handoff;
use super::shutdown::shutdown_signal;
use super::template;

/// Builds the model backend for a selector; `None` when it is unknown
pub type LocatorFactory = Box<dyn Fn(&str) -> Option<Arc<dyn ObjectLocator>> + Send + Sync>;

/// What one engine cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Version of a newly applied objects generation
    pub applied_version: Option<u64>,
    /// Event channel directories removed because their image channel is gone
    pub orphans_removed: Vec<String>,
    /// Channels an image was claimed from
    pub channels_claimed: Vec<String>,
    /// Model invocations
    pub detections: usize,
    pub records_written: usize,
    /// Records deleted for age, off markers or skip lists
    pub records_pruned: usize,
}

pub struct EventEngine {
    store: ConfigStore<ObjectsConfig>,
    layout: DataLayout,
    factory: LocatorFactory,
    generation: Option<Arc<ObjectsConfig>>,
    locator: Option<Arc<dyn ObjectLocator>>,
    /// (channel, object) pairs whose descriptor this generation has ensured
    descriptors: HashSet<(String, String)>,
    manage_gates: bool,
}

impl EventEngine {
    pub fn new(store: ConfigStore<ObjectsConfig>, layout: DataLayout, factory: LocatorFactory) -> Self {
        Self {
            store,
            layout,
            factory,
            generation: None,
            locator: None,
            descriptors: HashSet::new(),
            manage_gates: true,
        }
    }

    /// Engine whose backends are built from `settings`
    pub fn with_model_settings(store: ConfigStore<ObjectsConfig>, layout: DataLayout, settings: ModelSettings) -> Self {
        Self::new(store, layout, Box::new(move |selector: &str| locator_for(selector, &settings)))
    }

    /// Whether `image.off` gates follow service state
    pub fn manage_channel_gates(mut self, enabled: bool) -> Self {
        self.manage_gates = enabled;
        self
    }

    pub fn generation(&self) -> Option<Arc<ObjectsConfig>> {
        self.generation.clone()
    }

    /// One full evaluation pass over all channels
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        if let Some(config) = self.store.try_reload() {
            self.apply(config.clone());
            report.applied_version = Some(config.version);
        }

        report.orphans_removed = self.collect_orphans();

        let Some(generation) = self.generation.clone() else {
            return report;
        };

        if let Some(locator) = self.locator.clone() {
            for channel in handoff::list_subdirs(&self.layout.image_root()) {
                let slot = self.layout.image_slot(&channel);
                let image: ImageRecord = match handoff::claim_json(&slot) {
                    Ok(Some(image)) => image,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(channel = %channel, "Discarding unreadable image: {}", e);
                        continue;
                    }
                };
                report.channels_claimed.push(channel.clone());

                for object in &generation.objects {
                    self.evaluate(&channel, &image, object, locator.as_ref(), &mut report)
                        .await;
                }
            }
        }

        self.sweep(&generation, &mut report);

        if self.manage_gates {
            sync_channel_gates(&self.layout);
        }

        report
    }

    /// New generation: drop every event directory and all derived state
    fn apply(&mut self, config: Arc<ObjectsConfig>) {
        info!(
            version = config.version,
            objects = config.objects.len(),
            model = %config.model_selector,
            "Applying objects config"
        );

        let event_root = self.layout.event_root();
        if let Err(e) = handoff::reset_dir(&event_root) {
            error!("Failed to rebuild event root {}: {}", event_root.display(), e);
        }

        self.descriptors.clear();
        self.locator = (self.factory)(&config.model_selector);
        if self.locator.is_none() {
            error!(model = %config.model_selector, "No model backend; objects ignored until the next config");
        }
        self.generation = Some(config);
    }

    /// Remove event channels whose image channel no longer exists
    fn collect_orphans(&mut self) -> Vec<String> {
        let live: HashSet<String> = handoff::list_subdirs(&self.layout.image_root()).into_iter().collect();
        let event_root = self.layout.event_root();

        let mut removed = Vec::new();
        for channel in handoff::list_subdirs(&event_root) {
            if live.contains(&channel) {
                continue;
            }
            match std::fs::remove_dir_all(event_root.join(&channel)) {
                Ok(()) => {
                    info!(channel = %channel, "Removed events of deleted channel");
                    self.descriptors.retain(|(c, _)| c != &channel);
                    removed.push(channel);
                }
                Err(e) => warn!(channel = %channel, "Failed to remove orphaned events: {}", e),
            }
        }
        removed
    }

    #[instrument(skip_all, fields(channel = %channel, object = %object.obj_id))]
    async fn evaluate(
        &mut self,
        channel: &str,
        image: &ImageRecord,
        object: &ObjectConfig,
        locator: &dyn ObjectLocator,
        report: &mut CycleReport,
    ) {
        let dir = self.layout.object_dir(channel, &object.obj_id);
        if !self.ensure_descriptor(channel, &image.display_name, object, &dir) {
            return;
        }

        let eligible = prune_records(&dir, channel, object, report);
        if eligible.is_empty() {
            return;
        }

        report.detections += 1;
        let detection = locator
            .detect(&image.image_bytes, &object.description, &image.display_name)
            .await;
        if !detection.present {
            return;
        }
        debug!(location = ?detection.location, "Object detected");

        let now = Utc::now();
        for service in eligible {
            let name = service.service.as_str();
            let record = EventRecord {
                service: service.service,
                channel_display_name: image.display_name.clone(),
                report_time: now,
                rendered_message: template::render_detection(
                    &service.message_template,
                    object.canonical_name(),
                    &image.display_name,
                    detection.location.as_deref(),
                ),
                mute_seconds: service.mute_seconds,
            };

            if let Err(e) = handoff::publish_bytes(&event_snapshot_file(&dir, name), &image.image_bytes) {
                warn!(service = name, "Failed to store snapshot: {}", e);
            }
            match handoff::publish_json(&event_record_file(&dir, name), &record) {
                Ok(()) => report.records_written += 1,
                Err(e) => warn!(service = name, "Failed to publish event: {}", e),
            }
        }
    }

    /// Prune pairs whose channel had no image this cycle
    fn sweep(&self, generation: &ObjectsConfig, report: &mut CycleReport) {
        let event_root = self.layout.event_root();
        for channel in handoff::list_subdirs(&event_root) {
            if report.channels_claimed.contains(&channel) {
                continue;
            }
            for object in &generation.objects {
                let dir = event_root.join(&channel).join(&object.obj_id);
                if dir.is_dir() {
                    prune_records(&dir, &channel, object, report);
                }
            }
        }
    }

    /// Create `obj.json` (and default-off markers) the first time a pair is seen
    fn ensure_descriptor(&mut self, channel: &str, channel_name: &str, object: &ObjectConfig, dir: &Path) -> bool {
        let key = (channel.to_string(), object.obj_id.clone());
        if self.descriptors.contains(&key) {
            return true;
        }

        let descriptor_path = dir.join(OBJECT_FILE);
        if !descriptor_path.exists() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Failed to create {}: {}", dir.display(), e);
                return false;
            }

            let descriptor = ObjectDescriptor::for_channel(object, channel, channel_name);
            if let Err(e) = handoff::publish_json(&descriptor_path, &descriptor) {
                warn!("Failed to write descriptor: {}", e);
                return false;
            }

            for service in object.services.iter().filter(|s| s.default_off) {
                let marker = service_off_marker(dir, service.service.as_str());
                if let Err(e) = handoff::set_marker(&marker) {
                    warn!(service = %service.service, "Failed to seed off marker: {}", e);
                }
            }
        }

        self.descriptors.insert(key);
        true
    }

    /// Cycle until SIGTERM / Ctrl+C
    pub async fn run(mut self, every: Duration) -> Result<()> {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        info!(data = %self.layout.root().display(), "Event engine started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            let report = self.run_cycle().await;
            if report.records_written > 0 || report.records_pruned > 0 {
                debug!(
                    written = report.records_written,
                    pruned = report.records_pruned,
                    "Cycle complete"
                );
            }
        }

        info!("Event engine stopped");
        Ok(())
    }
}

/// Delete records that are switched off, skipped on `channel` or aged out.
///
/// Returns the services still eligible for a new record.
fn prune_records<'a>(
    dir: &Path,
    channel: &str,
    object: &'a ObjectConfig,
    report: &mut CycleReport,
) -> Vec<&'a ServiceConfig> {
    let mut eligible = Vec::new();
    for service in &object.services {
        let name = service.service.as_str();
        let record_path = event_record_file(dir, name);

        if handoff::marker_present(&service_off_marker(dir, name)) || service.skips(channel) {
            if record_path.exists() {
                remove_record(&record_path, name, report);
            }
            continue;
        }

        if let Some(age) = handoff::file_age(&record_path) {
            if age >= Duration::from_secs(service.age_out_seconds) {
                debug!(channel, object = %object.obj_id, service = name, age = ?age, "Record aged out");
                remove_record(&record_path, name, report);
            }
        }
        eligible.push(service);
    }
    eligible
}

fn remove_record(path: &Path, service: &str, report: &mut CycleReport) {
    match handoff::remove_if_present(path) {
        Ok(()) => report.records_pruned += 1,
        Err(e) => warn!(service, "Failed to prune record: {}", e),
    }
}

/// Write `image.off` for channels on which every tracked service is off,
/// remove it everywhere else
pub fn sync_channel_gates(layout: &DataLayout) {
    for channel in handoff::list_subdirs(&layout.image_root()) {
        let marker = layout.image_off_marker(&channel);
        let result = if channel_fully_off(layout, &channel) {
            handoff::set_marker(&marker)
        } else {
            handoff::clear_marker(&marker)
        };
        if let Err(e) = result {
            warn!(channel = %channel, "Failed to update channel gate: {}", e);
        }
    }
}

/// True when the channel has descriptors and none of their services is on.
///
/// A channel without descriptors is never gated; otherwise it could never
/// produce the image that creates them.
pub fn channel_fully_off(layout: &DataLayout, channel: &str) -> bool {
    let channel_dir = layout.event_root().join(channel);
    let mut seen_any = false;

    for obj_id in handoff::list_subdirs(&channel_dir) {
        let dir = channel_dir.join(&obj_id);
        let Ok(Some(descriptor)) = handoff::read_json::<ObjectDescriptor>(&dir.join(OBJECT_FILE)) else {
            continue;
        };
        seen_any = true;

        let active = descriptor
            .enabled_services
            .iter()
            .any(|s| !handoff::marker_present(&service_off_marker(&dir, s.as_str())));
        if active {
            return false;
        }
    }

    seen_any
}
