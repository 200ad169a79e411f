//! Event Engine Integration Tests
//!
//! Rule evaluation against a scripted model: record writing, default-off
//! services, skip lists, age-out, orphan collection and channel gates.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use filetime::FileTime;
use tempfile::TempDir;

use watchman::adapters::{Detection, ObjectLocator};
use watchman::config::paths::{event_record_file, service_off_marker, DataLayout, OBJECT_FILE};
use watchman::core::handoff;
use watchman::core::{query, ConfigStore, EventEngine};
use watchman::domain::{EventRecord, ImageRecord, ObjectDescriptor, ObjectsConfig, ServiceKind};

/// Answers every question with whatever the test last set
struct Scripted {
    answer: Mutex<Detection>,
    calls: AtomicUsize,
}

impl Scripted {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(Detection::absent()),
            calls: AtomicUsize::new(0),
        })
    }

    fn set(&self, answer: Detection) {
        *self.answer.lock().unwrap() = answer;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectLocator for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn detect(&self, _image: &[u8], _object: &str, _channel: &str) -> Detection {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.lock().unwrap().clone()
    }
}

struct Fixture {
    _temp: TempDir,
    layout: DataLayout,
    model: Arc<Scripted>,
    engine: EventEngine,
}

impl Fixture {
    fn new(channels: &[&str]) -> Self {
        let temp = TempDir::new().unwrap();
        let layout = DataLayout::new(temp.path());
        for channel in channels {
            std::fs::create_dir_all(layout.channel_dir(channel)).unwrap();
        }
        std::fs::create_dir_all(layout.config_dir()).unwrap();

        let model = Scripted::new();
        let for_factory = model.clone();
        let engine = EventEngine::new(
            ConfigStore::<ObjectsConfig>::new(layout.objects_file()),
            layout.clone(),
            Box::new(move |selector: &str| {
                if selector == "scripted" {
                    let locator: Arc<dyn ObjectLocator> = for_factory.clone();
                    Some(locator)
                } else {
                    None
                }
            }),
        );

        Self {
            _temp: temp,
            layout,
            model,
            engine,
        }
    }

    fn objects(&self, doc: serde_json::Value) {
        std::fs::write(self.layout.objects_file(), serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    fn frame(&self, channel: &str, iteration: u64) {
        let record = ImageRecord {
            channel_id: channel.to_string(),
            display_name: format!("{} camera", channel),
            image_bytes: vec![0xFF, 0xD8, iteration as u8, 0xFF, 0xD9],
            capture_time: Utc::now(),
            iteration,
        };
        handoff::publish_json(&self.layout.image_slot(channel), &record).unwrap();
    }

    fn record(&self, channel: &str, obj: &str, service: &str) -> PathBuf {
        event_record_file(&self.layout.object_dir(channel, obj), service)
    }
}

fn cat_objects(version: u64) -> serde_json::Value {
    serde_json::json!({
        "version": version,
        "model": "scripted",
        "objects": [{
            "obj_id": "cat",
            "names": ["cat", "kitty"],
            "desc": "a grey cat",
            "obj_svcs": [
                {
                    "osvc_name": "location",
                    "msgtpl": "I saw [OBJNAME] [TIMEAGO] ago on the [CHANNEL]. [LOCATION]",
                    "age_out": 10,
                    "def_off": false
                },
                {
                    "osvc_name": "alert",
                    "msgtpl": "[OBJNAME] is on the [CHANNEL]",
                    "age_out": 3600,
                    "def_off": true,
                    "mute_time": 60
                }
            ]
        }]
    })
}

fn backdate(path: &PathBuf, seconds: u64) {
    let then = SystemTime::now() - Duration::from_secs(seconds);
    filetime::set_file_mtime(path, FileTime::from_system_time(then)).unwrap();
}

#[tokio::test]
async fn test_detection_writes_record_and_descriptor() {
    let mut fx = Fixture::new(&["porch"]);
    fx.objects(cat_objects(1));
    fx.frame("porch", 4);
    fx.model.set(Detection::present(Some("on the bench".to_string())));

    let report = fx.engine.run_cycle().await;
    assert_eq!(report.applied_version, Some(1));
    assert_eq!(report.channels_claimed, vec!["porch".to_string()]);
    assert_eq!(report.detections, 1);
    assert_eq!(report.records_written, 1);
    assert!(!fx.layout.image_slot("porch").exists());

    let dir = fx.layout.object_dir("porch", "cat");
    let descriptor: ObjectDescriptor = handoff::read_json(&dir.join(OBJECT_FILE)).unwrap().unwrap();
    assert_eq!(descriptor.channel_name, "porch camera");
    assert_eq!(descriptor.enabled_services, vec![ServiceKind::Location, ServiceKind::Alert]);

    let record: EventRecord = handoff::read_json(&fx.record("porch", "cat", "location")).unwrap().unwrap();
    assert_eq!(record.service, ServiceKind::Location);
    assert_eq!(record.rendered_message, "I saw cat [TIMEAGO] ago on the porch camera. on the bench");
    assert_eq!(std::fs::read(dir.join("location.jpg")).unwrap(), vec![0xFF, 0xD8, 4, 0xFF, 0xD9]);

    // Alert starts switched off
    assert!(service_off_marker(&dir, "alert").exists());
    assert!(!fx.record("porch", "cat", "alert").exists());

    // No new image, no work
    let report = fx.engine.run_cycle().await;
    assert!(report.channels_claimed.is_empty());
    assert_eq!(fx.model.calls(), 1);
}

#[tokio::test]
async fn test_negative_answer_keeps_record_until_age_out() {
    let mut fx = Fixture::new(&["porch"]);
    fx.objects(cat_objects(1));
    fx.frame("porch", 1);
    fx.model.set(Detection::present(None));
    fx.engine.run_cycle().await;

    let location = fx.record("porch", "cat", "location");
    assert!(location.exists());

    fx.model.set(Detection::absent());
    fx.frame("porch", 2);
    let report = fx.engine.run_cycle().await;
    assert_eq!(report.records_pruned, 0);
    assert!(location.exists());

    backdate(&location, 20);
    fx.frame("porch", 3);
    let report = fx.engine.run_cycle().await;
    assert_eq!(report.records_pruned, 1);
    assert_eq!(report.detections, 1);
    assert!(!location.exists());
}

#[tokio::test]
async fn test_aged_record_is_replaced_by_fresh_detection() {
    let mut fx = Fixture::new(&["porch"]);
    fx.objects(cat_objects(1));
    fx.frame("porch", 1);
    fx.model.set(Detection::present(None));
    fx.engine.run_cycle().await;

    let location = fx.record("porch", "cat", "location");
    backdate(&location, 20);
    fx.frame("porch", 2);
    let report = fx.engine.run_cycle().await;

    assert_eq!(report.records_pruned, 1);
    assert_eq!(report.records_written, 1);
    assert!(handoff::file_age(&location).unwrap() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_off_marker_deletes_record_and_skips_model() {
    let mut fx = Fixture::new(&["porch"]);
    fx.objects(cat_objects(1));
    fx.frame("porch", 1);
    fx.model.set(Detection::present(None));
    fx.engine.run_cycle().await;
    assert_eq!(fx.model.calls(), 1);

    let dir = fx.layout.object_dir("porch", "cat");
    handoff::set_marker(&service_off_marker(&dir, "location")).unwrap();

    fx.frame("porch", 2);
    let report = fx.engine.run_cycle().await;
    assert_eq!(report.records_pruned, 1);
    assert_eq!(report.detections, 0);
    assert_eq!(fx.model.calls(), 1);
    assert!(!fx.record("porch", "cat", "location").exists());
}

#[tokio::test]
async fn test_skipped_channel_gets_no_records() {
    let mut fx = Fixture::new(&["porch", "yard"]);
    fx.objects(serde_json::json!({
        "version": 1,
        "model": "scripted",
        "objects": [{
            "obj_id": "car",
            "names": ["car"],
            "desc": "a red car",
            "obj_svcs": [{
                "osvc_name": "location",
                "msgtpl": "[OBJNAME] on [CHANNEL]",
                "age_out": 600,
                "def_off": false,
                "skip_ch": ["yard"]
            }]
        }]
    }));
    fx.frame("porch", 1);
    fx.frame("yard", 1);
    fx.model.set(Detection::present(None));

    let report = fx.engine.run_cycle().await;
    assert_eq!(report.channels_claimed.len(), 2);
    assert_eq!(report.detections, 1);
    assert!(fx.record("porch", "car", "location").exists());
    assert!(!fx.record("yard", "car", "location").exists());

    let yard: ObjectDescriptor = handoff::read_json(&fx.layout.object_dir("yard", "car").join(OBJECT_FILE))
        .unwrap()
        .unwrap();
    assert!(yard.enabled_services.is_empty());
}

#[tokio::test]
async fn test_orphaned_event_channels_are_removed() {
    let mut fx = Fixture::new(&["porch"]);
    fx.objects(cat_objects(1));
    fx.engine.run_cycle().await;

    let orphan = fx.layout.object_dir("garage", "cat");
    std::fs::create_dir_all(&orphan).unwrap();
    std::fs::create_dir_all(fx.layout.event_root().join("porch")).unwrap();

    let report = fx.engine.run_cycle().await;
    assert_eq!(report.orphans_removed, vec!["garage".to_string()]);
    assert!(!fx.layout.event_root().join("garage").exists());
    assert!(fx.layout.event_root().join("porch").exists());
}

#[tokio::test]
async fn test_new_generation_resets_event_tree() {
    let mut fx = Fixture::new(&["porch"]);
    fx.objects(cat_objects(1));
    fx.frame("porch", 1);
    fx.model.set(Detection::present(None));
    fx.engine.run_cycle().await;
    assert!(fx.record("porch", "cat", "location").exists());

    fx.objects(cat_objects(2));
    let report = fx.engine.run_cycle().await;
    assert_eq!(report.applied_version, Some(2));
    assert!(!fx.layout.object_dir("porch", "cat").exists());

    // Descriptors come back with the next image
    fx.frame("porch", 2);
    fx.engine.run_cycle().await;
    assert!(fx.layout.object_dir("porch", "cat").join(OBJECT_FILE).exists());
}

#[tokio::test]
async fn test_unknown_model_leaves_images_unclaimed() {
    let mut fx = Fixture::new(&["porch"]);
    let mut doc = cat_objects(1);
    doc["model"] = serde_json::json!("nonexistent");
    fx.objects(doc);
    fx.frame("porch", 1);

    let report = fx.engine.run_cycle().await;
    assert_eq!(report.applied_version, Some(1));
    assert!(report.channels_claimed.is_empty());
    assert!(fx.layout.image_slot("porch").exists());
}

#[tokio::test]
async fn test_channel_gate_follows_service_state() {
    let mut fx = Fixture::new(&["porch"]);
    fx.objects(serde_json::json!({
        "version": 1,
        "model": "scripted",
        "objects": [{
            "obj_id": "cat",
            "names": ["cat"],
            "desc": "a grey cat",
            "obj_svcs": [{
                "osvc_name": "alert",
                "msgtpl": "[OBJNAME] on [CHANNEL]",
                "age_out": 600,
                "def_off": true,
                "mute_time": 30
            }]
        }]
    }));

    // No descriptors yet: never gated
    fx.engine.run_cycle().await;
    assert!(!fx.layout.image_off_marker("porch").exists());

    fx.frame("porch", 1);
    fx.engine.run_cycle().await;
    assert!(fx.layout.image_off_marker("porch").exists());

    let change = query::set_service_state(&fx.layout, ServiceKind::Alert, query::Switch::On, Some("cat"), None).unwrap();
    assert_eq!(change.changed, 1);

    fx.engine.run_cycle().await;
    assert!(!fx.layout.image_off_marker("porch").exists());
}

#[tokio::test]
async fn test_where_is_reads_engine_output() {
    let mut fx = Fixture::new(&["porch"]);
    fx.objects(cat_objects(1));
    fx.frame("porch", 1);
    fx.model.set(Detection::present(Some("under the table".to_string())));
    fx.engine.run_cycle().await;

    let answer = query::where_is(&fx.layout, "Kitty", Utc::now()).to_string();
    assert!(answer.starts_with("I saw cat "), "{}", answer);
    assert!(answer.ends_with("ago on the porch camera. under the table"), "{}", answer);
}

#[tokio::test]
async fn test_quiet_channel_records_still_age_out() {
    let mut fx = Fixture::new(&["porch"]);
    fx.objects(cat_objects(1));
    fx.frame("porch", 1);
    fx.model.set(Detection::present(None));
    fx.engine.run_cycle().await;

    let location = fx.record("porch", "cat", "location");
    assert!(location.exists());

    // The camera stops delivering images
    let report = fx.engine.run_cycle().await;
    assert!(report.channels_claimed.is_empty());
    assert_eq!(report.records_pruned, 0);
    assert!(location.exists());

    backdate(&location, 20);
    let report = fx.engine.run_cycle().await;
    assert!(report.channels_claimed.is_empty());
    assert_eq!(report.detections, 0);
    assert_eq!(report.records_pruned, 1);
    assert!(!location.exists());
    assert_eq!(
        query::where_is(&fx.layout, "cat", Utc::now()).to_string(),
        "Watchman did not see cat recently."
    );
}

#[tokio::test]
async fn test_quiet_channel_honors_off_marker() {
    let mut fx = Fixture::new(&["porch"]);
    fx.objects(cat_objects(1));
    fx.frame("porch", 1);
    fx.model.set(Detection::present(None));
    fx.engine.run_cycle().await;

    let dir = fx.layout.object_dir("porch", "cat");
    handoff::set_marker(&service_off_marker(&dir, "location")).unwrap();

    let report = fx.engine.run_cycle().await;
    assert!(report.channels_claimed.is_empty());
    assert_eq!(report.records_pruned, 1);
    assert!(!fx.record("porch", "cat", "location").exists());
    assert_eq!(fx.model.calls(), 1);
}
