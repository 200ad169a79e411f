//! watchman - camera watcher and object event pipeline
//!
//! Keeps one worker process alive per configured video channel, turns the
//! frames they capture into per-object events with a vision model, and hands
//! those events to front ends (voice assistant, alert announcer).
//!
//! # Architecture
//!
//! Every stage is a separate loop that talks to the others only through the
//! data directory:
//! - Workers publish `images/<cid>/image.json` and a heartbeat
//! - The supervisor restarts workers that exit or stop beating
//! - The engine claims images and writes `events/<cid>/<obj>/<svc>.json`
//! - The announcer claims alerts and delivers them outside a mute window
//!
//! Files are only ever replaced by rename and consumed by rename, so no
//! locks are needed between processes.
//!
//! # Modules
//!
//! - `adapters`: Vision model backends and alert notifiers
//! - `core`: Config store, handoff protocol, worker, supervisor, engine, announcer
//! - `domain`: Channel/object config and the records on disk
//! - `ingest`: Frame acquisition from files, HTTP and RTSP
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Supervisor and engine in one process
//! watchman run
//!
//! # Alerts, in another
//! WATCHMAN_ALERT_SCRIPT=/usr/local/bin/say watchman announcer
//!
//! # Ask
//! watchman where cat
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;

// Re-export main types at crate root for convenience
pub use core::{Announcer, ChannelSupervisor, ChannelWorker, ConfigStore, EventEngine};
pub use domain::{ChannelConfig, EventRecord, ImageRecord, ObjectConfig, ObjectDescriptor, ServiceKind};
