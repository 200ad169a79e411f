//! Canonical on-disk layout shared by every watchman process.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use watchman::config::paths::DataLayout;
//!
//! let layout = DataLayout::new("/var/lib/watchman");
//! let slot = layout.image_slot("porch");
//! ```
//!
//! ## Path Ownership
//!
//! | Location | Writer | Reader |
//! |----------|--------|--------|
//! | `sysconfig/*.json` | config UI | supervisor, engine |
//! | `images/<cid>/image.json` | channel worker | engine (claims) |
//! | `images/<cid>/iteration.txt` | channel worker | supervisor |
//! | `images/<cid>/image.off` | engine (gates) | channel worker |
//! | `events/<cid>/<obj>/*` | engine | announcer, query tools |

use std::path::{Path, PathBuf};

// ============================================================================
// Directory names
// ============================================================================

/// Versioned config documents live here
pub const CONFIG_DIR: &str = "sysconfig";

/// Channel image slots
pub const IMAGE_DIR: &str = "images";

/// Per channel x object event records
pub const EVENT_DIR: &str = "events";

/// Archived frames written by the dataset collector
pub const DATASET_DIR: &str = "dataset";

// ============================================================================
// File names
// ============================================================================

pub const SOURCES_FILE: &str = "sources.json";
pub const OBJECTS_FILE: &str = "objects.json";

/// Current image record of a channel (the handoff slot)
pub const IMAGE_SLOT_FILE: &str = "image.json";

/// Presence disables polling of a channel
pub const IMAGE_OFF_FILE: &str = "image.off";

/// Worker heartbeat (last scheduler tick number)
pub const HEARTBEAT_FILE: &str = "iteration.txt";

/// Object descriptor in a channel x object directory
pub const OBJECT_FILE: &str = "obj.json";

/// Suffix of the alert done marker (`alert_done.json`)
pub const DONE_SUFFIX: &str = "_done";

/// Resolved directory tree under one data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    pub fn sources_file(&self) -> PathBuf {
        self.config_dir().join(SOURCES_FILE)
    }

    pub fn objects_file(&self) -> PathBuf {
        self.config_dir().join(OBJECTS_FILE)
    }

    pub fn image_root(&self) -> PathBuf {
        self.root.join(IMAGE_DIR)
    }

    pub fn event_root(&self) -> PathBuf {
        self.root.join(EVENT_DIR)
    }

    pub fn dataset_root(&self) -> PathBuf {
        self.root.join(DATASET_DIR)
    }

    pub fn channel_dir(&self, channel_id: &str) -> PathBuf {
        self.image_root().join(channel_id)
    }

    pub fn image_slot(&self, channel_id: &str) -> PathBuf {
        self.channel_dir(channel_id).join(IMAGE_SLOT_FILE)
    }

    pub fn image_off_marker(&self, channel_id: &str) -> PathBuf {
        self.channel_dir(channel_id).join(IMAGE_OFF_FILE)
    }

    pub fn heartbeat_file(&self, channel_id: &str) -> PathBuf {
        self.channel_dir(channel_id).join(HEARTBEAT_FILE)
    }

    /// `<event_root>/<channel>/<object>`
    pub fn object_dir(&self, channel_id: &str, obj_id: &str) -> PathBuf {
        self.event_root().join(channel_id).join(obj_id)
    }
}

/// `<service>.json` inside an object directory
pub fn event_record_file(object_dir: &Path, service: &str) -> PathBuf {
    object_dir.join(format!("{}.json", service))
}

/// `<service>.off` inside an object directory
pub fn service_off_marker(object_dir: &Path, service: &str) -> PathBuf {
    object_dir.join(format!("{}.off", service))
}

/// `<service>.jpg` snapshot of the frame that triggered the record
pub fn event_snapshot_file(object_dir: &Path, service: &str) -> PathBuf {
    object_dir.join(format!("{}.jpg", service))
}

/// `<service>_done.json` marker left behind by the announcer
pub fn done_marker_file(object_dir: &Path, service: &str) -> PathBuf {
    object_dir.join(format!("{}{}.json", service, DONE_SUFFIX))
}

/// Directory names starting with a dot are scratch space, never channels or objects
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

// ============================================================================
// Tests
// ============================================================================
