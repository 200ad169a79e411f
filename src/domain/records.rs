//! Records exchanged between processes through the data directory.
//!
//! All of them are JSON files that are only ever replaced wholesale (temp file
//! then rename), never edited in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::objects::{ObjectConfig, ServiceKind};

/// One captured frame, published into a channel's handoff slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    #[serde(rename = "cid")]
    pub channel_id: String,

    #[serde(rename = "name")]
    pub display_name: String,

    /// JPEG bytes (base64 on disk)
    #[serde(rename = "data", with = "base64_bytes")]
    pub image_bytes: Vec<u8>,

    #[serde(rename = "time", with = "epoch_seconds")]
    pub capture_time: DateTime<Utc>,

    /// Worker scheduler tick that produced the frame
    #[serde(rename = "iter")]
    pub iteration: u64,
}

/// `obj.json`: what a channel x object directory tracks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub obj_id: String,
    pub names: Vec<String>,
    #[serde(rename = "desc")]
    pub description: String,
    #[serde(rename = "svcs")]
    pub enabled_services: Vec<ServiceKind>,
    #[serde(rename = "cid")]
    pub channel_id: String,
    #[serde(rename = "cname")]
    pub channel_name: String,
}

impl ObjectDescriptor {
    /// Descriptor for an object as seen from one channel; services skipping
    /// the channel are not listed.
    pub fn for_channel(object: &ObjectConfig, channel_id: &str, channel_name: &str) -> Self {
        Self {
            obj_id: object.obj_id.clone(),
            names: object.names.clone(),
            description: object.description.clone(),
            enabled_services: object
                .services
                .iter()
                .filter(|s| !s.skips(channel_id))
                .map(|s| s.service)
                .collect(),
            channel_id: channel_id.to_string(),
            channel_name: channel_name.to_string(),
        }
    }

    pub fn canonical_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.obj_id)
    }

    /// Case-insensitive match against any spoken name
    pub fn answers_to(&self, spoken: &str) -> bool {
        let spoken = spoken.trim();
        self.names.iter().any(|n| n.eq_ignore_ascii_case(spoken))
    }
}

/// `<service>.json`: the latest positive detection for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "svc")]
    pub service: ServiceKind,

    #[serde(rename = "cname")]
    pub channel_display_name: String,

    #[serde(rename = "time", with = "epoch_seconds")]
    pub report_time: DateTime<Utc>,

    /// Template with detection-time tokens substituted; delivery-time tokens remain
    #[serde(rename = "msg")]
    pub rendered_message: String,

    #[serde(rename = "mute_time", default)]
    pub mute_seconds: u64,
}

impl EventRecord {
    /// Seconds since the detection, never negative
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.report_time).num_seconds().max(0)
    }
}

/// Vec<u8> as a base64 string
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Timestamps as fractional Unix seconds
mod epoch_seconds {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        let secs = time.timestamp_micros() as f64 / 1_000_000.0;
        serializer.serialize_f64(secs)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() {
            return Err(serde::de::Error::custom("timestamp is not finite"));
        }
        let micros = (secs * 1_000_000.0).round() as i64;
        Utc.timestamp_micros(micros)
            .single()
            .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::objects::ServiceConfig;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_image_record_wire_format() {
        let record = ImageRecord {
            channel_id: "porch".to_string(),
            display_name: "front porch".to_string(),
            image_bytes: vec![0xff, 0xd8, 0xff],
            capture_time: Utc.timestamp_opt(1_700_000_000, 500_000_000).unwrap(),
            iteration: 42,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["cid"], "porch");
        assert_eq!(json["data"], "/9j/");
        assert_eq!(json["time"], 1_700_000_000.5);
        assert_eq!(json["iter"], 42);

        let parsed: ImageRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_descriptor_omits_skipped_services() {
        let object = ObjectConfig {
            obj_id: "cat".to_string(),
            names: vec!["cat".to_string(), "kitty".to_string()],
            description: "a cat".to_string(),
            services: vec![
                ServiceConfig {
                    service: ServiceKind::Location,
                    message_template: String::new(),
                    age_out_seconds: 10,
                    default_off: false,
                    skip_channels: vec![],
                    mute_seconds: 0,
                },
                ServiceConfig {
                    service: ServiceKind::Alert,
                    message_template: String::new(),
                    age_out_seconds: 10,
                    default_off: false,
                    skip_channels: vec!["garage".to_string()],
                    mute_seconds: 60,
                },
            ],
        };

        let porch = ObjectDescriptor::for_channel(&object, "porch", "front porch");
        let garage = ObjectDescriptor::for_channel(&object, "garage", "garage");

        assert_eq!(porch.enabled_services, vec![ServiceKind::Location, ServiceKind::Alert]);
        assert_eq!(garage.enabled_services, vec![ServiceKind::Location]);
        assert!(porch.answers_to("Kitty"));
        assert!(!porch.answers_to("dog"));
    }

    #[test]
    fn test_event_age_never_negative() {
        let now = Utc::now();
        let record = EventRecord {
            service: ServiceKind::Alert,
            channel_display_name: "porch".to_string(),
            report_time: now + Duration::seconds(5),
            rendered_message: "cat".to_string(),
            mute_seconds: 60,
        };
        assert_eq!(record.age_seconds(now), 0);
        assert_eq!(record.age_seconds(now + Duration::seconds(65)), 60);
    }
}
