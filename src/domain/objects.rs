//! Objects of interest and the services attached to them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Model backend used when `objects.json` does not name one
pub const DEFAULT_MODEL: &str = "ollama-simple";

/// A reporting behavior configured per object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// "Where did you last see X" answers
    Location,
    /// Pushed announcements with a mute window
    Alert,
    /// Image capture for fine tuning
    Dataset,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::Location, ServiceKind::Alert, ServiceKind::Dataset];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Location => "location",
            ServiceKind::Alert => "alert",
            ServiceKind::Dataset => "dataset",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown service: {}", s))
    }
}

/// One service of an object (`obj_svcs` entry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "osvc_name")]
    pub service: ServiceKind,

    /// Message with `[OBJNAME]`, `[CHANNEL]`, `[LOCATION]`, `[TIMEAGO]`, `[OBJECT]` tokens
    #[serde(rename = "msgtpl")]
    pub message_template: String,

    /// Records older than this are pruned
    #[serde(rename = "age_out")]
    pub age_out_seconds: u64,

    /// New channel x object pairs start with this service switched off
    #[serde(rename = "def_off")]
    pub default_off: bool,

    #[serde(rename = "skip_ch", default)]
    pub skip_channels: Vec<String>,

    /// Alert only; zero for other services
    #[serde(rename = "mute_time", default)]
    pub mute_seconds: u64,
}

impl ServiceConfig {
    pub fn skips(&self, channel_id: &str) -> bool {
        self.skip_channels.iter().any(|c| c == channel_id)
    }
}

/// One object of interest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub obj_id: String,

    /// Spoken names, the first one is canonical
    pub names: Vec<String>,

    /// Text handed to the model
    #[serde(rename = "desc")]
    pub description: String,

    #[serde(rename = "obj_svcs")]
    pub services: Vec<ServiceConfig>,
}

impl ObjectConfig {
    pub fn canonical_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.obj_id)
    }
}

/// One accepted generation of object definitions
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectsConfig {
    pub version: u64,
    pub model_selector: String,
    pub objects: Vec<ObjectConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_kind_round_trip_names() {
        for kind in ServiceKind::ALL {
            assert_eq!(kind.as_str().parse::<ServiceKind>().unwrap(), kind);
        }
        assert!("sms".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn test_service_entry_defaults() {
        let svc: ServiceConfig = serde_json::from_value(serde_json::json!({
            "osvc_name": "location",
            "msgtpl": "I saw [OBJNAME] on the [CHANNEL] camera",
            "age_out": 10800,
            "def_off": false
        }))
        .unwrap();

        assert_eq!(svc.service, ServiceKind::Location);
        assert!(svc.skip_channels.is_empty());
        assert_eq!(svc.mute_seconds, 0);
        assert!(!svc.skips("porch"));
    }
}
