//! Runtime settings for watchman processes.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (WATCHMAN_DATA_DIR, WATCHMAN_MODEL_HOST, ...)
//! 2. Config file (.watchman/config.yaml)
//! 3. Defaults (~/.watchman)
//!
//! Config file discovery:
//! - Searches current directory and parents for .watchman/config.yaml
//! - `data_dir` in the config file is relative to the project root (parent of .watchman/)
//!
//! The channel and object definitions are NOT part of these settings; they are
//! versioned JSON documents under `<data>/sysconfig` handled by
//! [`crate::core::ConfigStore`].

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use self::paths::DataLayout;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub data_dir: Option<String>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    pub manage_channel_gates: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimingConfig {
    pub scheduler_tick_ms: Option<u64>,
    pub supervisor_poll_ms: Option<u64>,
    pub stall_polls: Option<u32>,
    pub terminate_grace_secs: Option<u64>,
    pub engine_interval_ms: Option<u64>,
    pub http_timeout_secs: Option<u64>,
    pub rtsp_sample_fps: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConfig {
    pub host: Option<String>,
    pub name: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    pub script: Option<String>,
    pub url: Option<String>,
    pub access_code: Option<String>,
}

/// Loop cadences and liveness limits
#[derive(Debug, Clone, Serialize)]
pub struct TimingSettings {
    /// Worker scheduler tick; channel intervals are multiples of this
    pub scheduler_tick_ms: u64,
    pub supervisor_poll_ms: u64,
    /// Consecutive unchanged heartbeats before a worker is declared hung
    pub stall_polls: u32,
    pub terminate_grace_secs: u64,
    pub engine_interval_ms: u64,
    pub http_timeout_secs: u64,
    pub rtsp_sample_fps: u32,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            scheduler_tick_ms: 1000,
            supervisor_poll_ms: 1000,
            stall_polls: 30,
            terminate_grace_secs: 5,
            engine_interval_ms: 500,
            http_timeout_secs: 10,
            rtsp_sample_fps: 5,
        }
    }
}

impl TimingSettings {
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn supervisor_poll(&self) -> Duration {
        Duration::from_millis(self.supervisor_poll_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    pub fn engine_interval(&self) -> Duration {
        Duration::from_millis(self.engine_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Where the vision model is served
#[derive(Debug, Clone, Serialize)]
pub struct ModelSettings {
    pub host: String,
    pub name: String,
    pub timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            name: "llama3.2-vision:11b-instruct-fp16".to_string(),
            timeout_secs: 120,
        }
    }
}

/// Announcer delivery targets (either may be absent)
#[derive(Debug, Clone, Default, Serialize)]
pub struct NotifySettings {
    pub script: Option<String>,
    pub url: Option<String>,
    pub access_code: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to the shared data directory
    pub data_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub timing: TimingSettings,
    pub model: ModelSettings,
    pub notify: NotifySettings,
    /// Engine writes/removes `image.off` gates from service state
    pub manage_channel_gates: bool,
}

impl ResolvedConfig {
    /// Settings rooted at an explicit data directory, everything else default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            config_file: None,
            timing: TimingSettings::default(),
            model: ModelSettings::default(),
            notify: NotifySettings::default(),
            manage_channel_gates: true,
        }
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".watchman").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Merge file values over defaults, then environment over both
fn resolve(file: ConfigFile, config_file: Option<PathBuf>, default_data: PathBuf) -> ResolvedConfig {
    let base_dir = config_file
        .as_deref()
        .and_then(|p| p.parent()) // .watchman/
        .and_then(|p| p.parent()) // project root
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let data_dir = if let Some(env_data) = env_nonempty("WATCHMAN_DATA_DIR") {
        PathBuf::from(env_data)
    } else if let Some(ref data) = file.data_dir {
        resolve_path(&base_dir, data)
    } else {
        default_data
    };

    let defaults = TimingSettings::default();
    let t = file.timing;
    let timing = TimingSettings {
        scheduler_tick_ms: t.scheduler_tick_ms.unwrap_or(defaults.scheduler_tick_ms),
        supervisor_poll_ms: t.supervisor_poll_ms.unwrap_or(defaults.supervisor_poll_ms),
        stall_polls: t.stall_polls.unwrap_or(defaults.stall_polls),
        terminate_grace_secs: t.terminate_grace_secs.unwrap_or(defaults.terminate_grace_secs),
        engine_interval_ms: t.engine_interval_ms.unwrap_or(defaults.engine_interval_ms),
        http_timeout_secs: t.http_timeout_secs.unwrap_or(defaults.http_timeout_secs),
        rtsp_sample_fps: t.rtsp_sample_fps.unwrap_or(defaults.rtsp_sample_fps).max(1),
    };

    let model_defaults = ModelSettings::default();
    let model = ModelSettings {
        host: env_nonempty("WATCHMAN_MODEL_HOST")
            .or(file.model.host)
            .unwrap_or(model_defaults.host),
        name: file.model.name.unwrap_or(model_defaults.name),
        timeout_secs: file.model.timeout_secs.unwrap_or(model_defaults.timeout_secs),
    };

    let notify = NotifySettings {
        script: env_nonempty("WATCHMAN_ALERT_SCRIPT").or(file.notify.script),
        url: env_nonempty("WATCHMAN_NOTIFY_URL").or(file.notify.url),
        access_code: env_nonempty("WATCHMAN_NOTIFY_CODE").or(file.notify.access_code),
    };

    ResolvedConfig {
        data_dir,
        config_file,
        timing,
        model,
        notify,
        manage_channel_gates: file.manage_channel_gates.unwrap_or(true),
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_data = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".watchman");

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(file, config_file, default_data))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the resolved data layout
pub fn layout() -> Result<DataLayout> {
    Ok(config()?.layout())
}
