//! Core pipeline logic.
//!
//! This module contains:
//! - ConfigStore: versioned, validated config snapshots
//! - Handoff: atomic publish/claim through well-known files
//! - Worker / Supervisor: per-channel acquisition and hang recovery
//! - Engine: per-object, per-service rule evaluation
//! - Announcer: alert delivery with a mute window
//! - Query / Collector: front-end questions and dataset capture

pub mod announcer;
pub mod collector;
pub mod config_store;
pub mod engine;
pub mod handoff;
pub mod query;
pub mod shutdown;
pub mod supervisor;
pub mod template;
pub mod worker;

// Re-export commonly used types
pub use announcer::{process_alert, AlertOutcome, AnnounceSummary, Announcer};
pub use collector::DatasetCollector;
pub use config_store::{ConfigError, ConfigStore, VersionedDocument};
pub use engine::{channel_fully_off, sync_channel_gates, CycleReport, EventEngine, LocatorFactory};
pub use handoff::HandoffError;
pub use query::{set_service_state, status, where_is, ServiceChange, StatusReport, Switch, WhereIs};
pub use shutdown::shutdown_signal;
pub use supervisor::{ChannelSupervisor, PollReport, ProcessLauncher, WorkerLauncher, WorkerProcess};
pub use worker::{ChannelWorker, TickOutcome};
