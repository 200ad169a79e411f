//! Alert delivery.
//!
//! A message is handed to every configured notifier; delivery counts as done
//! if at least one of them succeeds.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::NotifySettings;

/// Trait for alert delivery mechanisms
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, message: &str) -> Result<()>;
}

/// Runs `<script> "<message>"`; success is exit status 0
pub struct ScriptNotifier {
    program: PathBuf,
    limit: Duration,
}

impl ScriptNotifier {
    pub fn new(program: impl Into<PathBuf>, limit: Duration) -> Self {
        Self {
            program: program.into(),
            limit,
        }
    }
}

#[async_trait]
impl Notifier for ScriptNotifier {
    fn name(&self) -> &str {
        "script"
    }

    async fn deliver(&self, message: &str) -> Result<()> {
        let child = Command::new(&self.program)
            .arg(message)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run alert script {}", self.program.display()))?;

        let output = timeout(self.limit, child.wait_with_output())
            .await
            .with_context(|| format!("Alert script timed out after {:?}", self.limit))?
            .context("Failed to wait for alert script")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Alert script failed with exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    notification: &'a str,
    access_code: &'a str,
}

/// POSTs `{notification, accessCode}`; success is any 2xx
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    access_code: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, access_code: impl Into<String>, limit: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(limit)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            access_code: access_code.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, message: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookBody {
                notification: message,
                access_code: &self.access_code,
            })
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Notification endpoint returned {}", status);
        }
        Ok(())
    }
}

/// Fan-out over all configured notifiers
#[derive(Default)]
pub struct NotifierSet {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifiers.push(Box::new(notifier));
        self
    }

    pub fn from_settings(settings: &NotifySettings, limit: Duration) -> Result<Self> {
        let mut set = Self::new();
        if let Some(ref script) = settings.script {
            set = set.with(ScriptNotifier::new(script, limit));
        }
        if let Some(ref url) = settings.url {
            let code = settings.access_code.clone().unwrap_or_default();
            set = set.with(WebhookNotifier::new(url, code, limit)?);
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.notifiers.iter().map(|n| n.name()).collect()
    }
}

#[async_trait]
impl Notifier for NotifierSet {
    fn name(&self) -> &str {
        "all"
    }

    async fn deliver(&self, message: &str) -> Result<()> {
        if self.notifiers.is_empty() {
            anyhow::bail!("No notifier configured");
        }

        let mut delivered = false;
        for notifier in &self.notifiers {
            match notifier.deliver(message).await {
                Ok(()) => {
                    debug!(notifier = notifier.name(), "Alert delivered");
                    delivered = true;
                }
                Err(e) => warn!(notifier = notifier.name(), "Alert delivery failed: {:#}", e),
            }
        }

        if !delivered {
            anyhow::bail!("Every notifier failed");
        }
        Ok(())
    }
}
