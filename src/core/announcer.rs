//! Alert delivery with a mute window.
//!
//! The engine keeps overwriting `alert.json` while an object stays visible.
//! For each new record the announcer:
//!
//! 1. claims `alert.json` (rename to a private path)
//! 2. reads the `report_time` of the previous `alert_done.json`, if any
//! 3. renames the claimed record over `alert_done.json`
//! 4. delivers the message unless the previous report is younger than
//!    the record's `mute_time`
//!
//! `alert_done.json` is the only mute state. If delivery fails it is removed
//! so the next alert is delivered rather than muted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::adapters::Notifier;
use crate::config::paths::{done_marker_file, event_record_file, DataLayout, OBJECT_FILE};
use crate::domain::{EventRecord, ObjectDescriptor, ServiceKind};

use super::handoff::{self, HandoffError};
use super::shutdown::shutdown_signal;
use super::template;

/// What happened to one alert record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    /// No unclaimed alert (or another announcer took it)
    Nothing,
    Delivered,
    /// Inside the mute window; recorded but not announced
    Muted,
    /// Every notifier failed; the mute clock was reset
    DeliveryFailed,
    /// Record could not be parsed and was dropped
    Discarded,
}

/// Apply the dedup state machine to one `<channel>/<object>` directory
pub async fn process_alert(
    object_dir: &Path,
    notifier: &dyn Notifier,
    now: DateTime<Utc>,
) -> Result<AlertOutcome, HandoffError> {
    let service = ServiceKind::Alert.as_str();
    let record_path = event_record_file(object_dir, service);
    let done_path = done_marker_file(object_dir, service);

    let Some(claimed) = handoff::claim_path(&record_path)? else {
        return Ok(AlertOutcome::Nothing);
    };

    let record: EventRecord = match std::fs::read(&claimed)
        .map_err(|e| e.to_string())
        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
    {
        Ok(record) => record,
        Err(e) => {
            warn!(dir = %object_dir.display(), "Dropping unreadable alert: {}", e);
            let _ = std::fs::remove_file(&claimed);
            return Ok(AlertOutcome::Discarded);
        }
    };

    let previous = match handoff::read_json::<EventRecord>(&done_path) {
        Ok(done) => done.map(|d| d.report_time),
        Err(e) => {
            debug!("Ignoring unreadable done marker: {}", e);
            None
        }
    };

    let muted = previous
        .map(|at| (now - at).num_seconds() < record.mute_seconds as i64)
        .unwrap_or(false);

    std::fs::rename(&claimed, &done_path).map_err(|source| HandoffError::Io {
        path: done_path.clone(),
        source,
    })?;

    if muted {
        debug!(dir = %object_dir.display(), "Alert muted");
        return Ok(AlertOutcome::Muted);
    }

    let reference = reference_name(object_dir);
    let message = template::render_delivery(&record.rendered_message, &reference, record.report_time, now);

    match notifier.deliver(&message).await {
        Ok(()) => {
            info!(object = %reference, channel = %record.channel_display_name, "Alert announced");
            Ok(AlertOutcome::Delivered)
        }
        Err(e) => {
            warn!(object = %reference, "Alert not delivered: {:#}", e);
            handoff::remove_if_present(&done_path)?;
            Ok(AlertOutcome::DeliveryFailed)
        }
    }
}

/// Canonical object name from the descriptor, else the directory name
fn reference_name(object_dir: &Path) -> String {
    match handoff::read_json::<ObjectDescriptor>(&object_dir.join(OBJECT_FILE)) {
        Ok(Some(descriptor)) => descriptor.canonical_name().to_string(),
        _ => object_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Tallies from one pass over the event tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceSummary {
    pub delivered: usize,
    pub muted: usize,
    pub failed: usize,
}

impl AnnounceSummary {
    fn add(&mut self, outcome: AlertOutcome) {
        match outcome {
            AlertOutcome::Delivered => self.delivered += 1,
            AlertOutcome::Muted => self.muted += 1,
            AlertOutcome::DeliveryFailed => self.failed += 1,
            AlertOutcome::Nothing | AlertOutcome::Discarded => {}
        }
    }
}

pub struct Announcer<N> {
    layout: DataLayout,
    notifier: N,
}

impl<N: Notifier> Announcer<N> {
    pub fn new(layout: DataLayout, notifier: N) -> Self {
        Self { layout, notifier }
    }

    /// Directories currently holding an unclaimed alert
    fn pending_alerts(&self) -> Vec<PathBuf> {
        let event_root = self.layout.event_root();
        let alert = ServiceKind::Alert.as_str();

        handoff::list_subdirs(&event_root)
            .into_iter()
            .flat_map(|channel| {
                let channel_dir = event_root.join(channel);
                handoff::list_subdirs(&channel_dir)
                    .into_iter()
                    .map(move |obj| channel_dir.join(obj))
            })
            .filter(|dir| event_record_file(dir, alert).exists())
            .collect()
    }

    async fn handle(&self, dir: &Path, summary: &mut AnnounceSummary) {
        match process_alert(dir, &self.notifier, Utc::now()).await {
            Ok(outcome) => summary.add(outcome),
            Err(e) => warn!(dir = %dir.display(), "Alert handling failed: {}", e),
        }
    }

    /// Process every pending alert once
    pub async fn scan_once(&self) -> AnnounceSummary {
        let mut summary = AnnounceSummary::default();
        for dir in self.pending_alerts() {
            self.handle(&dir, &mut summary).await;
        }
        summary
    }

    /// React to filesystem events, with a periodic rescan as a backstop.
    ///
    /// The engine deletes and recreates the event tree on every objects
    /// config change, so the watch is placed on the data root.
    pub async fn run(self, rescan_every: Duration) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(Duration::from_millis(250), move |res: DebounceEventResult| {
            let _ = tx.send(res);
        })?;
        debouncer
            .watcher()
            .watch(self.layout.root(), RecursiveMode::Recursive)?;

        let mut rescan = tokio::time::interval(rescan_every);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        info!(
            root = %self.layout.root().display(),
            notifiers = ?self.notifier.name(),
            "Announcer watching for alerts"
        );

        let event_root = self.layout.event_root();
        let alert_file = format!("{}.json", ServiceKind::Alert.as_str());

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = rescan.tick() => {
                    self.scan_once().await;
                }
                Some(events) = rx.recv() => {
                    let events = match events {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("Watcher error: {:?}", e);
                            continue;
                        }
                    };

                    let mut summary = AnnounceSummary::default();
                    for event in events {
                        let path = event.path;
                        let is_alert = path.starts_with(&event_root)
                            && path.file_name().map(|n| n == alert_file.as_str()).unwrap_or(false);
                        if !is_alert || !path.exists() {
                            continue;
                        }
                        if let Some(dir) = path.parent() {
                            self.handle(dir, &mut summary).await;
                        }
                    }
                }
            }
        }

        info!("Announcer stopped");
        Ok(())
    }
}
