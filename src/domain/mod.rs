//! Domain types for watchman.
//!
//! This module contains the core data structures:
//! - Sources: video channel definitions
//! - Objects: objects of interest and their services
//! - Records: image, descriptor and event files exchanged between processes

pub mod objects;
pub mod records;
pub mod sources;

// Re-export commonly used types
pub use objects::{ObjectConfig, ObjectsConfig, ServiceConfig, ServiceKind, DEFAULT_MODEL};
pub use records::{EventRecord, ImageRecord, ObjectDescriptor};
pub use sources::{ChannelConfig, SourceKind, SourcesConfig};
