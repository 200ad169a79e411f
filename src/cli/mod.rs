//! Command-line interface for watchman.
//!
//! Provides the long-running loops (supervisor, workers, engine, announcer,
//! dataset collector) and the one-shot query commands.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use crate::adapters::NotifierSet;
use crate::config::{self, ResolvedConfig};
use crate::core::{
    query, set_service_state, status, sync_channel_gates, where_is, Announcer, ChannelSupervisor, ChannelWorker,
    ConfigStore, DatasetCollector, EventEngine, ProcessLauncher, Switch, VersionedDocument,
};
use crate::domain::{ChannelConfig, ObjectsConfig, ServiceKind, SourcesConfig};

/// watchman - camera watcher and object event pipeline
#[derive(Parser, Debug)]
#[command(name = "watchman")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the channel supervisor and the event engine together
    Run,

    /// Run the channel supervisor only
    Imager,

    /// Run one channel worker (spawned by the supervisor)
    #[command(hide = true)]
    Worker {
        /// Channel definition as JSON
        #[arg(long)]
        channel: String,

        /// Scheduler stagger offset
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Directory holding the channel directories
        #[arg(long)]
        image_root: PathBuf,
    },

    /// Run the event engine only
    Engine,

    /// Deliver alerts as they appear
    Announcer {
        /// Seconds between full rescans of the event tree
        #[arg(long, default_value = "5")]
        rescan_secs: u64,
    },

    /// Where was an object last seen?
    Where {
        /// Object name ("everything" for all objects)
        #[arg(required = true, num_args = 1..)]
        object: Vec<String>,
    },

    /// List tracked objects, channels and active services
    Status,

    /// Switch a service on or off
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },

    /// Archive images as a numbered dataset (do not run alongside the engine)
    Collect,

    /// Show resolved configuration
    Config {
        /// Also validate sources.json and objects.json
        #[arg(long)]
        check: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ServiceCommands {
    /// Remove the off marker
    Enable(ServiceArgs),

    /// Write the off marker
    Disable(ServiceArgs),
}

#[derive(Args, Debug)]
pub struct ServiceArgs {
    /// location, alert or dataset
    pub service: ServiceKind,

    /// Object name (default: every object)
    #[arg(long)]
    pub object: Option<String>,

    /// Channel name or id (default: every channel)
    #[arg(long)]
    pub channel: Option<String>,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run => run_all().await,
            Commands::Imager => run_imager().await,
            Commands::Worker {
                channel,
                offset,
                image_root,
            } => run_worker(&channel, offset, image_root).await,
            Commands::Engine => run_engine().await,
            Commands::Announcer { rescan_secs } => run_announcer(rescan_secs).await,
            Commands::Where { object } => show_where(&object.join(" ")),
            Commands::Status => show_status(),
            Commands::Service { command } => match command {
                ServiceCommands::Enable(args) => switch_service(args, Switch::On),
                ServiceCommands::Disable(args) => switch_service(args, Switch::Off),
            },
            Commands::Collect => run_collector().await,
            Commands::Config { check } => show_config(check),
        }
    }
}

fn build_supervisor(cfg: &ResolvedConfig) -> Result<ChannelSupervisor<ProcessLauncher>> {
    let layout = cfg.layout();
    std::fs::create_dir_all(layout.image_root())
        .with_context(|| format!("Failed to create {}", layout.image_root().display()))?;

    Ok(ChannelSupervisor::new(
        ConfigStore::<SourcesConfig>::new(layout.sources_file()),
        layout.image_root(),
        ProcessLauncher::current_exe()?,
        &cfg.timing,
    ))
}

fn build_engine(cfg: &ResolvedConfig) -> Result<EventEngine> {
    let layout = cfg.layout();
    std::fs::create_dir_all(layout.event_root())
        .with_context(|| format!("Failed to create {}", layout.event_root().display()))?;

    Ok(EventEngine::with_model_settings(
        ConfigStore::<ObjectsConfig>::new(layout.objects_file()),
        layout,
        cfg.model.clone(),
    )
    .manage_channel_gates(cfg.manage_channel_gates))
}

async fn run_all() -> Result<()> {
    let cfg = config::config()?;
    let supervisor = build_supervisor(cfg)?;
    let engine = build_engine(cfg)?;

    let (imager, events) = tokio::join!(
        supervisor.run(cfg.timing.supervisor_poll()),
        engine.run(cfg.timing.engine_interval())
    );
    imager?;
    events
}

async fn run_imager() -> Result<()> {
    let cfg = config::config()?;
    build_supervisor(cfg)?.run(cfg.timing.supervisor_poll()).await
}

async fn run_worker(channel_json: &str, offset: u64, image_root: PathBuf) -> Result<()> {
    let cfg = config::config()?;
    let channel: ChannelConfig =
        serde_json::from_str(channel_json).context("Worker was given an invalid channel definition")?;

    let worker = ChannelWorker::new(channel, offset, &image_root, &cfg.timing)?;
    worker.run(cfg.timing.scheduler_tick()).await
}

async fn run_engine() -> Result<()> {
    let cfg = config::config()?;
    build_engine(cfg)?.run(cfg.timing.engine_interval()).await
}

async fn run_announcer(rescan_secs: u64) -> Result<()> {
    let cfg = config::config()?;
    let notifiers = NotifierSet::from_settings(&cfg.notify, cfg.timing.http_timeout())?;
    if notifiers.is_empty() {
        anyhow::bail!("No notifier configured (set WATCHMAN_ALERT_SCRIPT or WATCHMAN_NOTIFY_URL)");
    }

    let layout = cfg.layout();
    std::fs::create_dir_all(layout.event_root())
        .with_context(|| format!("Failed to create {}", layout.event_root().display()))?;

    println!("Delivering alerts via {}", notifiers.names().join(", "));
    Announcer::new(layout, notifiers)
        .run(Duration::from_secs(rescan_secs.max(1)))
        .await
}

async fn run_collector() -> Result<()> {
    let cfg = config::config()?;
    DatasetCollector::new(cfg.layout())
        .run(cfg.timing.engine_interval())
        .await
}

fn show_where(object: &str) -> Result<()> {
    let layout = config::layout()?;
    println!("{}", where_is(&layout, object, Utc::now()));
    Ok(())
}

fn show_status() -> Result<()> {
    let layout = config::layout()?;
    let report = status(&layout);
    println!("{}", report);

    let pairs = query::tracked_pairs(&layout);
    if !pairs.is_empty() {
        println!();
        println!("{:<16} {:<20} {:<16} SERVICES", "CHANNEL", "NAME", "OBJECT");
        println!("{}", "-".repeat(72));
        for pair in pairs {
            let services: Vec<String> = pair
                .descriptor
                .enabled_services
                .iter()
                .map(|s| if pair.service_on(*s) { s.to_string() } else { format!("{}(off)", s) })
                .collect();
            println!(
                "{:<16} {:<20} {:<16} {}",
                pair.descriptor.channel_id,
                pair.descriptor.channel_name,
                pair.descriptor.obj_id,
                services.join(" ")
            );
        }
    }
    Ok(())
}

fn switch_service(args: ServiceArgs, switch: Switch) -> Result<()> {
    let cfg = config::config()?;
    let layout = cfg.layout();

    let change = set_service_state(
        &layout,
        args.service,
        switch,
        args.object.as_deref(),
        args.channel.as_deref(),
    )?;

    if change.matched == 0 {
        println!("No tracked object has the {} service for that selection.", args.service);
        return Ok(());
    }

    if cfg.manage_channel_gates {
        sync_channel_gates(&layout);
    }

    println!(
        "{} {} on {} of {} matching channel/object pairs.",
        args.service, switch, change.changed, change.matched
    );
    Ok(())
}

fn check_document<C: VersionedDocument>(path: PathBuf) {
    let mut store = ConfigStore::<C>::new(path);
    match store.check() {
        Ok(doc) => {
            println!("  {}: version {} OK", store.path().display(), doc.version());
            for warning in store.warnings() {
                println!("    warning: {}", warning);
            }
        }
        Err(e) => println!("  {}: {}", store.path().display(), e),
    }
}

fn show_config(check: bool) -> Result<()> {
    let cfg = config::config()?;
    let layout = cfg.layout();

    println!("╔═══════════════════════════════════════════════════════════════╗");
    println!("  Watchman Configuration");
    println!("╚═══════════════════════════════════════════════════════════════╝");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Data:     {}", layout.root().display());
    println!("  Sources:  {}", layout.sources_file().display());
    println!("  Objects:  {}", layout.objects_file().display());
    println!("  Images:   {}", layout.image_root().display());
    println!("  Events:   {}", layout.event_root().display());
    println!("  Dataset:  {}", layout.dataset_root().display());
    println!();
    println!("Timing:");
    println!("  Scheduler tick:    {}ms", cfg.timing.scheduler_tick_ms);
    println!("  Supervisor poll:   {}ms", cfg.timing.supervisor_poll_ms);
    println!("  Stall polls:       {}", cfg.timing.stall_polls);
    println!("  Terminate grace:   {}s", cfg.timing.terminate_grace_secs);
    println!("  Engine interval:   {}ms", cfg.timing.engine_interval_ms);
    println!("  HTTP timeout:      {}s", cfg.timing.http_timeout_secs);
    println!("  RTSP sample rate:  {} fps", cfg.timing.rtsp_sample_fps);
    println!();
    println!("Model:");
    println!("  Host:  {}", cfg.model.host);
    println!("  Name:  {}", cfg.model.name);
    println!();
    println!("Notify:");
    println!("  Script:   {}", cfg.notify.script.as_deref().unwrap_or("(none)"));
    println!("  Webhook:  {}", cfg.notify.url.as_deref().unwrap_or("(none)"));
    println!("  Channel gates managed: {}", cfg.manage_channel_gates);

    if check {
        println!();
        println!("Documents:");
        check_document::<SourcesConfig>(layout.sources_file());
        check_document::<ObjectsConfig>(layout.objects_file());
    }

    Ok(())
}
