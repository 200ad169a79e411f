//! Keeps one worker process alive per configured channel.
//!
//! The supervisor never talks to its workers. It learns whether a worker is
//! alive from two places only: the OS (has the process exited?) and the
//! worker's heartbeat file (has the tick number moved?). A worker whose
//! heartbeat stays unchanged for `stall_polls` consecutive polls is treated
//! as deadlocked, stopped and replaced.
//!
//! A worker that keeps exiting before its heartbeat ever moves is restarted
//! with an exponentially growing pause, capped at [`MAX_RESTART_BACKOFF_POLLS`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::paths::HEARTBEAT_FILE;
use crate::config::TimingSettings;
use crate::domain::{ChannelConfig, SourcesConfig};

use super::config_store::ConfigStore;
use super::handoff;
use super::shutdown::shutdown_signal;

// ============================================================================
// Worker process abstraction
// ============================================================================

/// A running worker as seen by the supervisor
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    fn is_running(&mut self) -> bool;

    /// Ask the worker to stop, then kill it once `grace` has elapsed
    async fn terminate(&mut self, grace: Duration);
}

/// Starts workers
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        channel: &ChannelConfig,
        offset: u64,
        image_root: &Path,
    ) -> Result<Box<dyn WorkerProcess>>;
}

/// Launches `<program> worker ...` child processes
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Re-invoke the running binary
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate the watchman binary")?;
        Ok(Self::new(program))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        channel: &ChannelConfig,
        offset: u64,
        image_root: &Path,
    ) -> Result<Box<dyn WorkerProcess>> {
        let channel_json = serde_json::to_string(channel)?;

        let child = Command::new(&self.program)
            .arg("worker")
            .args(["--channel", &channel_json])
            .args(["--offset", &offset.to_string()])
            .arg("--image-root")
            .arg(image_root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker for channel '{}'", channel.id))?;

        Ok(Box::new(ChildWorker { child }))
    }
}

struct ChildWorker {
    child: Child,
}

impl ChildWorker {
    #[cfg(unix)]
    fn request_stop(&mut self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(pid, "SIGTERM not delivered: {}", std::io::Error::last_os_error());
            }
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }

        if !grace.is_zero() {
            self.request_stop();
            if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                return;
            }
            warn!(pid = ?self.child.id(), "Worker ignored SIGTERM, killing");
        }

        if let Err(e) = self.child.kill().await {
            warn!(pid = ?self.child.id(), "Failed to kill worker: {}", e);
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Longest pause, in polls, between restarts of a crash-looping worker
pub const MAX_RESTART_BACKOFF_POLLS: u32 = 60;

/// Polls to wait before the next restart after `exits` consecutive failures
fn restart_backoff(exits: u32) -> u32 {
    if exits == 0 {
        return 0;
    }
    let doubled = (1u32 << (exits - 1).min(16)) - 1;
    doubled.min(MAX_RESTART_BACKOFF_POLLS)
}

/// Supervisor-owned record of one channel's worker
pub struct WorkerHandle {
    pub channel_id: String,
    channel: ChannelConfig,
    offset: u64,
    process: Option<Box<dyn WorkerProcess>>,
    pub last_seen_iteration: Option<u64>,
    pub stagnant_polls: u32,
    /// Exits and failed launches since the heartbeat last advanced
    pub consecutive_exits: u32,
    backoff_polls: u32,
}

impl WorkerHandle {
    fn new(channel: ChannelConfig, offset: u64) -> Self {
        Self {
            channel_id: channel.id.clone(),
            channel,
            offset,
            process: None,
            last_seen_iteration: None,
            stagnant_polls: 0,
            consecutive_exits: 0,
            backoff_polls: 0,
        }
    }

    /// Count a failure and schedule the pause before the next launch
    fn record_failure(&mut self) {
        self.consecutive_exits = self.consecutive_exits.saturating_add(1);
        self.backoff_polls = restart_backoff(self.consecutive_exits);
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.id())
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn is_running(&mut self) -> bool {
        self.process.as_mut().map(|p| p.is_running()).unwrap_or(false)
    }
}

/// What one reconciliation poll changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    /// Version of a newly applied sources generation
    pub applied_version: Option<u64>,
    /// Channels whose worker was (re)started because it was not running
    pub started: Vec<String>,
    /// Channels whose restart is postponed after repeated exits
    pub backing_off: Vec<String>,
    /// Channels whose worker was replaced after its heartbeat stalled
    pub hung: Vec<String>,
}

pub struct ChannelSupervisor<L> {
    store: ConfigStore<SourcesConfig>,
    image_root: PathBuf,
    launcher: L,
    workers: Vec<WorkerHandle>,
    stall_polls: u32,
    grace: Duration,
}

impl<L: WorkerLauncher> ChannelSupervisor<L> {
    pub fn new(store: ConfigStore<SourcesConfig>, image_root: impl Into<PathBuf>, launcher: L, timing: &TimingSettings) -> Self {
        Self {
            store,
            image_root: image_root.into(),
            launcher,
            workers: Vec::new(),
            stall_polls: timing.stall_polls.max(1),
            grace: timing.terminate_grace(),
        }
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn current_config(&self) -> Option<Arc<SourcesConfig>> {
        self.store.current()
    }

    fn heartbeat_path(&self, channel_id: &str) -> PathBuf {
        self.image_root.join(channel_id).join(HEARTBEAT_FILE)
    }

    /// One reconciliation pass: config, exits, then heartbeats
    pub async fn poll_once(&mut self) -> PollReport {
        let mut report = PollReport::default();

        if let Some(config) = self.store.try_reload() {
            self.apply(&config).await;
            report.applied_version = Some(config.version);
            return report;
        }

        let mut checked = vec![true; self.workers.len()];
        for idx in 0..self.workers.len() {
            if self.workers[idx].is_running() {
                continue;
            }
            checked[idx] = false;

            let handle = &mut self.workers[idx];
            let id = handle.channel_id.clone();
            if handle.process.take().is_some() {
                handle.record_failure();
                warn!(
                    channel = %id,
                    exits = handle.consecutive_exits,
                    backoff_polls = handle.backoff_polls,
                    "Worker exited"
                );
            }

            if handle.backoff_polls > 0 {
                handle.backoff_polls -= 1;
                report.backing_off.push(id);
                continue;
            }

            self.restart(idx).await;
            report.started.push(id);
        }

        for idx in 0..self.workers.len() {
            if !checked[idx] || !self.check_heartbeat(idx) {
                continue;
            }
            let id = self.workers[idx].channel_id.clone();
            error!(
                channel = %id,
                last_iteration = ?self.workers[idx].last_seen_iteration,
                polls = self.stall_polls,
                "Worker heartbeat stalled, respawning"
            );
            if let Some(process) = self.workers[idx].process.as_mut() {
                process.terminate(self.grace).await;
            }
            self.restart(idx).await;
            report.hung.push(id);
        }

        report
    }

    /// Update stagnation counters; true when the worker is hung
    fn check_heartbeat(&mut self, idx: usize) -> bool {
        let beat = handoff::read_heartbeat(&self.heartbeat_path(&self.workers[idx].channel_id));
        let handle = &mut self.workers[idx];

        if beat.is_some() && beat != handle.last_seen_iteration {
            handle.last_seen_iteration = beat;
            handle.stagnant_polls = 0;
            handle.consecutive_exits = 0;
            return false;
        }

        handle.stagnant_polls += 1;
        handle.stagnant_polls >= self.stall_polls
    }

    /// Replace the generation: stop everything, rebuild the image tree, start fresh
    async fn apply(&mut self, config: &SourcesConfig) {
        info!(version = config.version, channels = config.channels.len(), "Applying sources config");
        self.teardown().await;

        if let Err(e) = handoff::reset_dir(&self.image_root) {
            error!("Failed to rebuild image root {}: {}", self.image_root.display(), e);
        }

        for (idx, channel) in config.channels.iter().enumerate() {
            let dir = self.image_root.join(&channel.id);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                error!(channel = %channel.id, "Failed to create {}: {}", dir.display(), e);
                continue;
            }
            self.workers.push(WorkerHandle::new(channel.clone(), idx as u64));
        }

        for idx in 0..self.workers.len() {
            self.restart(idx).await;
        }
    }

    /// Launch a fresh process into an existing handle
    async fn restart(&mut self, idx: usize) {
        let heartbeat = self.heartbeat_path(&self.workers[idx].channel_id);
        let _ = handoff::remove_if_present(&heartbeat);

        let handle = &mut self.workers[idx];
        handle.process = None;
        handle.last_seen_iteration = None;
        handle.stagnant_polls = 0;

        match self.launcher.launch(&handle.channel, handle.offset, &self.image_root).await {
            Ok(process) => {
                info!(channel = %handle.channel_id, pid = ?process.id(), "Worker started");
                handle.process = Some(process);
            }
            Err(e) => {
                handle.record_failure();
                error!(
                    channel = %handle.channel_id,
                    backoff_polls = handle.backoff_polls,
                    "Failed to start worker: {:#}",
                    e
                );
            }
        }
    }

    /// Stop every worker concurrently, each with its own grace period
    pub async fn teardown(&mut self) {
        let mut stopping = JoinSet::new();
        let grace = self.grace;
        for handle in self.workers.drain(..) {
            if let Some(mut process) = handle.process {
                stopping.spawn(async move { process.terminate(grace).await });
            }
        }
        while stopping.join_next().await.is_some() {}
    }

    /// Poll until SIGTERM / Ctrl+C, then stop all workers
    pub async fn run(mut self, poll_every: Duration) -> Result<()> {
        let mut interval = tokio::time::interval(poll_every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        info!(image_root = %self.image_root.display(), "Supervisor started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            self.poll_once().await;
        }

        info!("Stopping {} worker(s)", self.workers.len());
        self.teardown().await;
        Ok(())
    }
}
