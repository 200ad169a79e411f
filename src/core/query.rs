//! Questions answered from the event tree.
//!
//! Front ends (the CLI, a voice assistant) never talk to the engine; they
//! read descriptors and records straight from `<data>/events`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::config::paths::{event_record_file, service_off_marker, DataLayout, OBJECT_FILE};
use crate::domain::{EventRecord, ObjectDescriptor, ServiceKind};

use super::handoff::{self, HandoffError};
use super::template;

/// Spoken object names that select every object
pub const ANY_OBJECT: [&str; 2] = ["everything", "anything"];

/// Spoken channel names that select every channel
pub const ANY_CHANNEL: [&str; 2] = ["all", "everywhere"];

fn is_any(spoken: &str, wildcards: &[&str]) -> bool {
    let spoken = spoken.trim();
    wildcards.iter().any(|w| w.eq_ignore_ascii_case(spoken))
}

/// "a", "a and b", "a, b and c"
pub fn nice_list<S: AsRef<str>>(items: &[S]) -> String {
    match items {
        [] => String::new(),
        [only] => only.as_ref().to_string(),
        [head @ .., last] => {
            let head: Vec<&str> = head.iter().map(|s| s.as_ref()).collect();
            format!("{} and {}", head.join(", "), last.as_ref())
        }
    }
}

/// One `<channel>/<object>` directory with a readable descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPair {
    pub dir: PathBuf,
    pub descriptor: ObjectDescriptor,
}

impl TrackedPair {
    /// Configured for this channel and not switched off
    pub fn service_on(&self, service: ServiceKind) -> bool {
        self.descriptor.enabled_services.contains(&service)
            && !handoff::marker_present(&service_off_marker(&self.dir, service.as_str()))
    }
}

/// Every channel x object pair, ordered by channel id then object id
pub fn tracked_pairs(layout: &DataLayout) -> Vec<TrackedPair> {
    let event_root = layout.event_root();
    let mut pairs = Vec::new();

    for channel in handoff::list_subdirs(&event_root) {
        let channel_dir = event_root.join(&channel);
        for obj_id in handoff::list_subdirs(&channel_dir) {
            let dir = channel_dir.join(&obj_id);
            if let Ok(Some(descriptor)) = handoff::read_json::<ObjectDescriptor>(&dir.join(OBJECT_FILE)) {
                pairs.push(TrackedPair { dir, descriptor });
            }
        }
    }
    pairs
}

/// Answer to "where did you last see X"
#[derive(Debug, Clone, PartialEq)]
pub enum WhereIs {
    NothingTracked,
    NotTracking { asked: String, tracked: Vec<String> },
    NotSeen { asked: String },
    /// Rendered messages, newest first
    Seen(Vec<String>),
}

impl fmt::Display for WhereIs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WhereIs::NothingTracked => write!(
                f,
                "Watchman is not tracking anything, please check the system configuration."
            ),
            WhereIs::NotTracking { asked, tracked } => write!(
                f,
                "Watchman is tracking {}. Watchman is not tracking {}. Please repeat your question.",
                nice_list(tracked.as_slice()),
                asked
            ),
            WhereIs::NotSeen { asked } => write!(f, "Watchman did not see {} recently.", asked),
            WhereIs::Seen(messages) => f.write_str(&messages.join(". ")),
        }
    }
}

/// Newest location record of every object answering to `spoken`
pub fn where_is(layout: &DataLayout, spoken: &str, now: DateTime<Utc>) -> WhereIs {
    let asked = spoken.trim().to_string();
    let wildcard = is_any(&asked, &ANY_OBJECT);

    let pairs: Vec<TrackedPair> = tracked_pairs(layout)
        .into_iter()
        .filter(|p| p.descriptor.enabled_services.contains(&ServiceKind::Location))
        .collect();

    if pairs.is_empty() {
        return WhereIs::NothingTracked;
    }

    let matching: Vec<&TrackedPair> = pairs
        .iter()
        .filter(|p| wildcard || p.descriptor.answers_to(&asked))
        .collect();

    if matching.is_empty() {
        let tracked: BTreeSet<String> = pairs
            .iter()
            .map(|p| p.descriptor.canonical_name().to_string())
            .collect();
        return WhereIs::NotTracking {
            asked,
            tracked: tracked.into_iter().collect(),
        };
    }

    let location = ServiceKind::Location.as_str();
    let mut newest: HashMap<&str, (EventRecord, &str)> = HashMap::new();
    for pair in matching {
        let Ok(Some(record)) = handoff::read_json::<EventRecord>(&event_record_file(&pair.dir, location)) else {
            continue;
        };
        let descriptor = &pair.descriptor;
        let newer = newest
            .get(descriptor.obj_id.as_str())
            .map(|(seen, _)| record.report_time > seen.report_time)
            .unwrap_or(true);
        if newer {
            newest.insert(descriptor.obj_id.as_str(), (record, descriptor.canonical_name()));
        }
    }

    if newest.is_empty() {
        return WhereIs::NotSeen { asked };
    }

    let mut found: Vec<(EventRecord, &str)> = newest.into_values().collect();
    found.sort_by(|a, b| b.0.report_time.cmp(&a.0.report_time));

    WhereIs::Seen(
        found
            .into_iter()
            .map(|(record, canonical)| {
                let reference = if wildcard { canonical } else { asked.as_str() };
                template::render_delivery(&record.rendered_message, reference, record.report_time, now)
            })
            .collect(),
    )
}

/// One active service, the objects it covers and the channels covering
/// exactly that object set
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCoverage {
    pub service: ServiceKind,
    pub objects: Vec<String>,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub objects: Vec<String>,
    pub channels: Vec<String>,
    pub coverage: Vec<ServiceCoverage>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.objects.is_empty() {
            return write!(f, "Watchman is not tracking anything.");
        }
        write!(
            f,
            "Watchman is tracking {} on {}.",
            nice_list(self.objects.as_slice()),
            nice_list(self.channels.as_slice())
        )?;
        if self.coverage.is_empty() {
            return write!(f, " Every service is off.");
        }
        for line in &self.coverage {
            write!(
                f,
                " {} is on for {} on {}.",
                line.service,
                nice_list(line.objects.as_slice()),
                nice_list(line.channels.as_slice())
            )?;
        }
        Ok(())
    }
}

/// Tracked objects, channels and active services (dataset capture excluded)
pub fn status(layout: &DataLayout) -> StatusReport {
    let pairs = tracked_pairs(layout);

    let objects: BTreeSet<String> = pairs
        .iter()
        .map(|p| p.descriptor.canonical_name().to_string())
        .collect();
    let channels: BTreeSet<String> = pairs.iter().map(|p| p.descriptor.channel_name.clone()).collect();

    let mut coverage = Vec::new();
    for service in ServiceKind::ALL.into_iter().filter(|s| *s != ServiceKind::Dataset) {
        let mut per_channel: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for pair in pairs.iter().filter(|p| p.service_on(service)) {
            per_channel
                .entry(pair.descriptor.channel_name.as_str())
                .or_default()
                .insert(pair.descriptor.canonical_name().to_string());
        }

        let mut by_objects: BTreeMap<Vec<String>, Vec<String>> = BTreeMap::new();
        for (channel, objs) in per_channel {
            by_objects
                .entry(objs.into_iter().collect())
                .or_default()
                .push(channel.to_string());
        }

        coverage.extend(by_objects.into_iter().map(|(objects, channels)| ServiceCoverage {
            service,
            objects,
            channels,
        }));
    }

    StatusReport {
        objects: objects.into_iter().collect(),
        channels: channels.into_iter().collect(),
        coverage,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Switch::On => f.write_str("enabled"),
            Switch::Off => f.write_str("disabled"),
        }
    }
}

/// Result of a service switch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceChange {
    /// Pairs that match the selection and carry the service
    pub matched: usize,
    /// Pairs whose off marker actually flipped
    pub changed: usize,
}

/// Turn `service` on or off for the matching pairs.
///
/// `None` (or a wildcard such as `everything` / `all`) selects every object
/// or channel. Channel names match the display name or the channel id.
/// Channel gates are not touched; see `engine::sync_channel_gates`.
pub fn set_service_state(
    layout: &DataLayout,
    service: ServiceKind,
    switch: Switch,
    object: Option<&str>,
    channel: Option<&str>,
) -> Result<ServiceChange, HandoffError> {
    let object = object.filter(|o| !is_any(o, &ANY_OBJECT));
    let channel = channel.map(str::trim).filter(|c| !is_any(c, &ANY_CHANNEL));

    let mut change = ServiceChange::default();
    for pair in tracked_pairs(layout) {
        let descriptor = &pair.descriptor;
        if !descriptor.enabled_services.contains(&service) {
            continue;
        }
        if object.map(|o| !descriptor.answers_to(o)).unwrap_or(false) {
            continue;
        }
        let channel_matches = channel
            .map(|c| descriptor.channel_name.eq_ignore_ascii_case(c) || descriptor.channel_id == c)
            .unwrap_or(true);
        if !channel_matches {
            continue;
        }

        change.matched += 1;
        let marker = service_off_marker(&pair.dir, service.as_str());
        let was_off = handoff::marker_present(&marker);
        match switch {
            Switch::On if was_off => {
                handoff::clear_marker(&marker)?;
                change.changed += 1;
            }
            Switch::Off if !was_off => {
                handoff::set_marker(&marker)?;
                change.changed += 1;
            }
            _ => {}
        }
    }
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn descriptor(obj: &str, names: &[&str], cid: &str, cname: &str, svcs: &[ServiceKind]) -> ObjectDescriptor {
        ObjectDescriptor {
            obj_id: obj.to_string(),
            names: names.iter().map(|n| n.to_string()).collect(),
            description: format!("a {}", obj),
            enabled_services: svcs.to_vec(),
            channel_id: cid.to_string(),
            channel_name: cname.to_string(),
        }
    }

    fn place(layout: &DataLayout, d: &ObjectDescriptor) -> PathBuf {
        let dir = layout.object_dir(&d.channel_id, &d.obj_id);
        std::fs::create_dir_all(&dir).unwrap();
        handoff::publish_json(&dir.join(OBJECT_FILE), d).unwrap();
        dir
    }

    fn location_record(dir: &std::path::Path, cname: &str, msg: &str, at: DateTime<Utc>) {
        let record = EventRecord {
            service: ServiceKind::Location,
            channel_display_name: cname.to_string(),
            report_time: at,
            rendered_message: msg.to_string(),
            mute_seconds: 0,
        };
        handoff::publish_json(&event_record_file(dir, "location"), &record).unwrap();
    }

    #[test]
    fn test_nice_list() {
        assert_eq!(nice_list::<&str>(&[]), "");
        assert_eq!(nice_list(&["cat"]), "cat");
        assert_eq!(nice_list(&["cat", "dog"]), "cat and dog");
        assert_eq!(nice_list(&["cat", "dog", "car"]), "cat, dog and car");
    }

    #[test]
    fn test_where_is_answers() {
        let temp = TempDir::new().unwrap();
        let layout = DataLayout::new(temp.path());
        let now = Utc::now();

        assert_eq!(where_is(&layout, "cat", now), WhereIs::NothingTracked);

        let loc = [ServiceKind::Location];
        let porch = place(&layout, &descriptor("cat", &["cat", "kitty"], "ch1", "porch", &loc));
        let yard = place(&layout, &descriptor("cat", &["cat", "kitty"], "ch2", "yard", &loc));
        place(&layout, &descriptor("dog", &["dog"], "ch1", "porch", &loc));

        let answer = where_is(&layout, "car", now);
        assert_eq!(
            answer.to_string(),
            "Watchman is tracking cat and dog. Watchman is not tracking car. Please repeat your question."
        );

        assert_eq!(where_is(&layout, "dog", now).to_string(), "Watchman did not see dog recently.");

        location_record(&porch, "porch", "I saw [OBJECT] [TIMEAGO] ago on porch", now - Duration::seconds(600));
        location_record(&yard, "yard", "I saw [OBJECT] [TIMEAGO] ago in yard", now - Duration::seconds(120));

        let answer = where_is(&layout, "Kitty", now);
        assert_eq!(answer, WhereIs::Seen(vec!["I saw Kitty 2 minutes ago in yard".to_string()]));
    }

    #[test]
    fn test_where_is_everything_uses_canonical_names() {
        let temp = TempDir::new().unwrap();
        let layout = DataLayout::new(temp.path());
        let now = Utc::now();
        let loc = [ServiceKind::Location];

        let cat = place(&layout, &descriptor("cat", &["cat"], "ch1", "porch", &loc));
        let dog = place(&layout, &descriptor("dog", &["dog"], "ch1", "porch", &loc));
        location_record(&cat, "porch", "[OBJECT] on porch", now - Duration::seconds(30));
        location_record(&dog, "porch", "[OBJECT] on porch", now - Duration::seconds(5));

        assert_eq!(where_is(&layout, "everything", now).to_string(), "dog on porch. cat on porch");
    }

    #[test]
    fn test_status_groups_channels() {
        let temp = TempDir::new().unwrap();
        let layout = DataLayout::new(temp.path());
        let both = [ServiceKind::Location, ServiceKind::Alert, ServiceKind::Dataset];

        place(&layout, &descriptor("cat", &["cat"], "ch1", "porch", &both));
        place(&layout, &descriptor("cat", &["cat"], "ch2", "yard", &both));
        let muted = place(&layout, &descriptor("dog", &["dog"], "ch2", "yard", &both));
        handoff::set_marker(&service_off_marker(&muted, "alert")).unwrap();

        let report = status(&layout);
        assert_eq!(report.objects, vec!["cat", "dog"]);
        assert_eq!(report.channels, vec!["porch", "yard"]);
        assert_eq!(
            report.coverage,
            vec![
                ServiceCoverage {
                    service: ServiceKind::Location,
                    objects: vec!["cat".into()],
                    channels: vec!["porch".into()],
                },
                ServiceCoverage {
                    service: ServiceKind::Location,
                    objects: vec!["cat".into(), "dog".into()],
                    channels: vec!["yard".into()],
                },
                ServiceCoverage {
                    service: ServiceKind::Alert,
                    objects: vec!["cat".into()],
                    channels: vec!["porch".into(), "yard".into()],
                },
            ]
        );
    }

    #[test]
    fn test_service_switch() {
        let temp = TempDir::new().unwrap();
        let layout = DataLayout::new(temp.path());
        let svcs = [ServiceKind::Location, ServiceKind::Alert];

        let porch = place(&layout, &descriptor("cat", &["cat"], "ch1", "Porch", &svcs));
        let yard = place(&layout, &descriptor("cat", &["cat"], "ch2", "Yard", &svcs));
        place(&layout, &descriptor("dog", &["dog"], "ch2", "Yard", &[ServiceKind::Location]));

        let change = set_service_state(&layout, ServiceKind::Alert, Switch::Off, None, Some("all")).unwrap();
        assert_eq!(change, ServiceChange { matched: 2, changed: 2 });
        assert!(porch.join("alert.off").exists());
        assert!(yard.join("alert.off").exists());

        let change =
            set_service_state(&layout, ServiceKind::Alert, Switch::On, Some("cat"), Some("porch")).unwrap();
        assert_eq!(change, ServiceChange { matched: 1, changed: 1 });
        assert!(!porch.join("alert.off").exists());

        let change = set_service_state(&layout, ServiceKind::Alert, Switch::Off, Some("cat"), Some("ch2")).unwrap();
        assert_eq!(change, ServiceChange { matched: 1, changed: 0 });
    }
}
