//! Adapter interfaces for external systems.
//!
//! Two collaborators sit outside the pipeline:
//! - object locators (vision models), selected by the `model` field of
//!   `objects.json`
//! - notifiers, which deliver alert messages for the announcer

pub mod notify;
pub mod ollama;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::error;

use crate::config::ModelSettings;

pub use notify::{Notifier, NotifierSet, ScriptNotifier, WebhookNotifier};
pub use ollama::{OllamaClient, OllamaComplex, OllamaSimple};

/// Model verdict for one object in one image
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub present: bool,
    /// Free-text location, when the backend produces one
    pub location: Option<String>,
}

impl Detection {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn present(location: Option<String>) -> Self {
        Self {
            present: true,
            location,
        }
    }
}

/// Trait for vision model backends
#[async_trait]
pub trait ObjectLocator: Send + Sync {
    /// Name the backend is selected by in config
    fn name(&self) -> &str;

    /// Is the described object in the image?
    ///
    /// Never fails: transport or model errors are logged and reported as
    /// absent.
    async fn detect(&self, image: &[u8], object_description: &str, channel_description: &str) -> Detection;
}

/// Backend names accepted in `objects.json`
pub const MODEL_NAMES: [&str; 2] = [OllamaSimple::NAME, OllamaComplex::NAME];

/// Build the backend named by `selector`
pub fn build_locator(selector: &str, settings: &ModelSettings) -> Result<Arc<dyn ObjectLocator>> {
    match selector {
        OllamaSimple::NAME => Ok(Arc::new(OllamaSimple::new(OllamaClient::new(settings)?))),
        OllamaComplex::NAME => Ok(Arc::new(OllamaComplex::new(OllamaClient::new(settings)?))),
        other => anyhow::bail!(
            "Unknown model '{}' (available: {})",
            other,
            MODEL_NAMES.join(", ")
        ),
    }
}

/// Like [`build_locator`] but logs and returns `None` on failure
pub fn locator_for(selector: &str, settings: &ModelSettings) -> Option<Arc<dyn ObjectLocator>> {
    build_locator(selector, settings)
        .map_err(|e| error!("Model backend unavailable: {:#}", e))
        .ok()
}
