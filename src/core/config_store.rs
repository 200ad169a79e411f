//! Versioned configuration documents.
//!
//! `sources.json` and `objects.json` are edited by an external UI that bumps a
//! `version` counter on every save. A [`ConfigStore`] re-reads its document on
//! demand and hands out a new immutable snapshot only when the version is
//! strictly greater than the one it already holds. Everything else (missing
//! file, bad JSON, missing version, stale version) is "no update".
//!
//! Malformed entries inside the channel/object lists are dropped one by one
//! with a warning; the rest of the document still applies.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use jsonschema::JSONSchema;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::objects::{ObjectConfig, ObjectsConfig, DEFAULT_MODEL};
use crate::domain::sources::{
    ChannelConfig, SourceKind, SourcesConfig, DEFAULT_HEIGHT, DEFAULT_JPEG_QUALITY, DEFAULT_POLL_DIVISOR,
    DEFAULT_RTSP_RETRIES, DEFAULT_RTSP_THRESHOLD, DEFAULT_WIDTH,
};

const VERSION_KEY: &str = "version";

/// Reasons a reload produced no update
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {path} on line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Malformed config {0}: document is empty or not an object")]
    Empty(PathBuf),

    #[error("Malformed config {0}: no integer \"version\" key found")]
    MissingVersion(PathBuf),

    #[error("Version {found} is not newer than {current}")]
    NotNewer { current: u64, found: u64 },
}

/// A configuration document with a monotonic version
pub trait VersionedDocument: Sized + Send + Sync {
    /// Name used in log lines
    const KIND: &'static str;

    fn version(&self) -> u64;

    /// Normalize a document whose version has already been accepted.
    ///
    /// Returns the config plus one warning per dropped or repaired entry.
    fn from_document(version: u64, doc: &Map<String, Value>) -> (Self, Vec<String>);
}

/// Holds the current generation of one document
pub struct ConfigStore<C> {
    path: PathBuf,
    current: Option<Arc<C>>,
    warnings: Vec<String>,
    last_failure: Option<String>,
}

impl<C: VersionedDocument> ConfigStore<C> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
            warnings: Vec::new(),
            last_failure: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Currently held generation
    pub fn current(&self) -> Option<Arc<C>> {
        self.current.clone()
    }

    pub fn current_version(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.version())
    }

    /// Entry-level warnings from the last accepted generation
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Return a new snapshot if the document on disk has a higher version
    pub fn try_reload(&mut self) -> Option<Arc<C>> {
        match self.check() {
            Ok(config) => {
                self.last_failure = None;
                Some(config)
            }
            Err(ConfigError::NotNewer { .. }) => None,
            Err(e) => {
                // Same broken file is re-read every poll; log it once
                let message = e.to_string();
                if self.last_failure.as_deref() != Some(message.as_str()) {
                    match e {
                        ConfigError::Read { ref source, .. }
                            if source.kind() == std::io::ErrorKind::NotFound =>
                        {
                            debug!(kind = C::KIND, "{}", message)
                        }
                        _ => warn!(kind = C::KIND, "{}", message),
                    }
                    self.last_failure = Some(message);
                }
                None
            }
        }
    }

    /// Like [`try_reload`](Self::try_reload) but reports why nothing changed
    pub fn check(&mut self) -> Result<Arc<C>, ConfigError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;

        let value: Value = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: self.path.clone(),
            line: e.line(),
            message: e.to_string(),
        })?;

        let doc = match value {
            Value::Object(map) if !map.is_empty() => map,
            _ => return Err(ConfigError::Empty(self.path.clone())),
        };

        let version = doc
            .get(VERSION_KEY)
            .and_then(Value::as_u64)
            .ok_or_else(|| ConfigError::MissingVersion(self.path.clone()))?;

        if let Some(current) = self.current_version() {
            if version <= current {
                return Err(ConfigError::NotNewer {
                    current,
                    found: version,
                });
            }
        }

        let (config, warnings) = C::from_document(version, &doc);
        for w in &warnings {
            warn!(kind = C::KIND, version, "{}", w);
        }
        info!(kind = C::KIND, version, "Accepted new config generation");

        let config = Arc::new(config);
        self.current = Some(config.clone());
        self.warnings = warnings;
        Ok(config)
    }
}

// ============================================================================
// Entry helpers
// ============================================================================

fn required_str(entry: &Map<String, Value>, key: &str) -> Result<String, String> {
    match entry.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(format!("\"{}\" must be a string, got {}", key, other)),
        None => Err(format!("no \"{}\" key", key)),
    }
}

/// Integers, or strings holding integers (the UI has written both)
fn optional_u64(entry: &Map<String, Value>, key: &str) -> Result<Option<u64>, String> {
    match entry.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("cannot convert \"{}\" value {} to a non-negative integer", key, n)),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| format!("cannot convert \"{}\" value \"{}\" to int", key, s)),
        Some(other) => Err(format!("\"{}\" must be an integer, got {}", key, other)),
    }
}

fn optional_f64(entry: &Map<String, Value>, key: &str) -> Result<Option<f64>, String> {
    match entry.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| format!("\"{}\" is not a finite number", key)),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("cannot convert \"{}\" value \"{}\" to float", key, s)),
        Some(other) => Err(format!("\"{}\" must be a number, got {}", key, other)),
    }
}

/// Ids become directory names
fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && !id.contains('/')
        && !id.contains('\\')
        && id.trim() == id
}

fn list_entries<'a>(doc: &'a Map<String, Value>, key: &str, warnings: &mut Vec<String>) -> &'a [Value] {
    match doc.get(key) {
        None => &[],
        Some(Value::Array(items)) => items,
        Some(_) => {
            warnings.push(format!("\"{}\" is not a list, ignoring it", key));
            &[]
        }
    }
}

// ============================================================================
// sources.json
// ============================================================================

fn parse_channel(entry: &Value) -> Result<(ChannelConfig, Vec<String>), String> {
    let entry = entry.as_object().ok_or("entry is not an object")?;
    let mut notes = Vec::new();

    let id = required_str(entry, "channel")?;
    if !valid_id(&id) {
        return Err(format!("channel id \"{}\" is not a usable directory name", id));
    }
    let source_url = required_str(entry, "url")?;
    if SourceKind::from_url(&source_url) == SourceKind::Unsupported {
        return Err(format!("channel \"{}\": unsupported source URL \"{}\"", id, source_url));
    }
    let display_name = required_str(entry, "name")?;

    let mut poll_divisor = optional_u64(entry, "upd_int")?.unwrap_or(u64::from(DEFAULT_POLL_DIVISOR));
    if poll_divisor < 1 {
        notes.push(format!("channel \"{}\": upd_int 0 clamped to 1", id));
        poll_divisor = 1;
    }

    let width = optional_u64(entry, "img_w")?.unwrap_or(u64::from(DEFAULT_WIDTH));
    let height = optional_u64(entry, "img_h")?.unwrap_or(u64::from(DEFAULT_HEIGHT));
    if width == 0 || height == 0 || width > 16384 || height > 16384 {
        return Err(format!("image size {}x{} out of range", width, height));
    }

    let quality = optional_u64(entry, "img_q")?.unwrap_or(u64::from(DEFAULT_JPEG_QUALITY));
    if !(1..=100).contains(&quality) {
        return Err(format!("img_q {} is not within 1..=100", quality));
    }

    let retries = optional_u64(entry, "rtsp_bf_retries")?.unwrap_or(u64::from(DEFAULT_RTSP_RETRIES));
    let threshold = optional_f64(entry, "rtsp_bf_thresh")?.unwrap_or(DEFAULT_RTSP_THRESHOLD);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(format!("rtsp_bf_thresh {} is not within 0..=1", threshold));
    }

    let channel = ChannelConfig {
        id,
        display_name,
        source_url,
        poll_divisor: poll_divisor.min(u64::from(u32::MAX)) as u32,
        width: width as u32,
        height: height as u32,
        jpeg_quality: quality as u8,
        rtsp_retry_count: retries.min(u64::from(u32::MAX)) as u32,
        rtsp_corruption_threshold: threshold,
    };
    Ok((channel, notes))
}

impl VersionedDocument for SourcesConfig {
    const KIND: &'static str = "sources";

    fn version(&self) -> u64 {
        self.version
    }

    fn from_document(version: u64, doc: &Map<String, Value>) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let mut seen = HashSet::new();
        let mut channels = Vec::new();

        let entries = list_entries(doc, "channels", &mut warnings).to_vec();
        for (idx, entry) in entries.iter().enumerate() {
            match parse_channel(entry) {
                Ok((channel, notes)) => {
                    warnings.extend(notes);
                    if !seen.insert(channel.id.clone()) {
                        warnings.push(format!("duplicate channel \"{}\" in entry {}, dropped", channel.id, idx));
                        continue;
                    }
                    channels.push(channel);
                }
                Err(reason) => warnings.push(format!("channels entry {} dropped: {}", idx, reason)),
            }
        }

        (SourcesConfig { version, channels }, warnings)
    }
}

// ============================================================================
// objects.json
// ============================================================================

fn object_schema_value() -> Value {
    serde_json::json!({
        "type": "object",
        "required": ["obj_id", "names", "desc", "obj_svcs"],
        "properties": {
            "obj_id": { "type": "string", "pattern": "^[^./\\\\][^/\\\\]*$" },
            "names": {
                "type": "array",
                "minItems": 1,
                "items": { "type": "string", "minLength": 1 }
            },
            "desc": { "type": "string" },
            "obj_svcs": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["osvc_name", "msgtpl", "age_out", "def_off"],
                    "properties": {
                        "osvc_name": { "enum": ["location", "alert", "dataset"] },
                        "msgtpl": { "type": "string" },
                        "age_out": { "type": "integer", "minimum": 0 },
                        "def_off": { "type": "boolean" },
                        "skip_ch": { "type": "array", "items": { "type": "string" } },
                        "mute_time": { "type": "integer", "minimum": 0 }
                    }
                }
            }
        }
    })
}

fn object_schema() -> Result<&'static JSONSchema, &'static str> {
    static SCHEMA: OnceLock<Result<JSONSchema, String>> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            let value = object_schema_value();
            JSONSchema::compile(&value).map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| e.as_str())
}

/// Schema check first, then typed decoding
fn parse_object(entry: &Value) -> Result<ObjectConfig, String> {
    let schema = object_schema().map_err(|e| format!("object schema unusable: {}", e))?;
    if let Err(errors) = schema.validate(entry) {
        let reasons: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(reasons.join("; "));
    }

    let object: ObjectConfig = serde_json::from_value(entry.clone()).map_err(|e| e.to_string())?;

    let mut services = HashSet::new();
    for svc in &object.services {
        if !services.insert(svc.service) {
            return Err(format!("service \"{}\" configured twice", svc.service));
        }
    }
    Ok(object)
}

impl VersionedDocument for ObjectsConfig {
    const KIND: &'static str = "objects";

    fn version(&self) -> u64 {
        self.version
    }

    fn from_document(version: u64, doc: &Map<String, Value>) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();

        let model_selector = match doc.get("model") {
            Some(Value::String(m)) if !m.trim().is_empty() => m.trim().to_string(),
            None => DEFAULT_MODEL.to_string(),
            Some(other) => {
                warnings.push(format!("\"model\" {} is not a name, using {}", other, DEFAULT_MODEL));
                DEFAULT_MODEL.to_string()
            }
        };

        let mut seen = HashSet::new();
        let mut objects = Vec::new();
        let entries = list_entries(doc, "objects", &mut warnings).to_vec();
        for (idx, entry) in entries.iter().enumerate() {
            match parse_object(entry) {
                Ok(object) => {
                    if !seen.insert(object.obj_id.clone()) {
                        warnings.push(format!("duplicate object \"{}\" in entry {}, dropped", object.obj_id, idx));
                        continue;
                    }
                    objects.push(object);
                }
                Err(reason) => warnings.push(format!("error in JSON for object {}: {}", idx, reason)),
            }
        }

        (
            ObjectsConfig {
                version,
                model_selector,
                objects,
            },
            warnings,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_channel_defaults_filled() {
        let (cfg, warnings) = SourcesConfig::from_document(
            1,
            &doc(json!({
                "version": 1,
                "channels": [{ "channel": "porch", "name": "front porch", "url": "http://cam/snap" }]
            })),
        );

        assert!(warnings.is_empty());
        let ch = &cfg.channels[0];
        assert_eq!(ch.poll_divisor, DEFAULT_POLL_DIVISOR);
        assert_eq!((ch.width, ch.height), (DEFAULT_WIDTH, DEFAULT_HEIGHT));
        assert_eq!(ch.jpeg_quality, DEFAULT_JPEG_QUALITY);
        assert_eq!(ch.rtsp_retry_count, DEFAULT_RTSP_RETRIES);
    }

    #[test]
    fn test_bad_channel_entries_dropped() {
        let (cfg, warnings) = SourcesConfig::from_document(
            3,
            &doc(json!({
                "version": 3,
                "channels": [
                    { "channel": "porch", "name": "porch", "url": "http://a", "upd_int": "3" },
                    { "name": "no id", "url": "http://b" },
                    { "channel": "yard", "name": "yard", "url": "http://c", "upd_int": "soon" },
                    { "channel": "porch", "name": "again", "url": "http://d" },
                    { "channel": "../etc", "name": "escape", "url": "http://e" },
                    { "channel": "shed", "name": "shed", "url": "http://f", "upd_int": 0 },
                    { "channel": "barn", "name": "barn", "url": "ftp://g/snap.jpg" },
                    "not an object"
                ]
            })),
        );

        let ids: Vec<&str> = cfg.channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["porch", "shed"]);
        assert_eq!(cfg.channels[0].poll_divisor, 3);
        assert_eq!(cfg.channels[1].poll_divisor, 1);
        assert_eq!(warnings.len(), 7);
    }

    #[test]
    fn test_channels_not_a_list() {
        let (cfg, warnings) =
            SourcesConfig::from_document(1, &doc(json!({ "version": 1, "channels": "porch" })));
        assert!(cfg.channels.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_object_schema_rejects_bad_service() {
        let (cfg, warnings) = ObjectsConfig::from_document(
            1,
            &doc(json!({
                "version": 1,
                "objects": [
                    {
                        "obj_id": "cat", "names": ["cat"], "desc": "a cat",
                        "obj_svcs": [{ "osvc_name": "location", "msgtpl": "[OBJNAME]", "age_out": 10, "def_off": false }]
                    },
                    {
                        "obj_id": "dog", "names": ["dog"], "desc": "a dog",
                        "obj_svcs": [{ "osvc_name": "sms", "msgtpl": "x", "age_out": 10, "def_off": false }]
                    },
                    {
                        "obj_id": "car", "names": [], "desc": "a car", "obj_svcs": []
                    }
                ]
            })),
        );

        assert_eq!(cfg.model_selector, DEFAULT_MODEL);
        assert_eq!(cfg.objects.len(), 1);
        assert_eq!(cfg.objects[0].obj_id, "cat");
        assert_eq!(warnings.len(), 2);
    }
}
