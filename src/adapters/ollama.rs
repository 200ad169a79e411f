//! Vision model backends served by an Ollama-compatible `/api/generate`.
//!
//! Two strategies share one HTTP client:
//! - `ollama-simple`: one yes/no question about the object
//! - `ollama-complex`: a yes/no question that also names the camera, then
//!   (only on "yes") a second pass asking where the object is

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Detection, ObjectLocator};
use crate::config::ModelSettings;

const SYSTEM_PROMPT: &str = "You are a helpful, concise assistant for locating objects in an image";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    images: [&'a str; 1],
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

/// Llama 3.2 vision chat framing around a single user turn
fn framed_prompt(question: &str) -> String {
    format!(
        "<|begin_of_text|><|start_header_id|>system<|end_header_id|>{}<|eot_id|>\
         <|start_header_id|>user<|end_header_id|><|image|>{}<|eot_id|>\
         <|start_header_id|>assistant<|end_header_id|>",
        SYSTEM_PROMPT, question
    )
}

fn says_yes(answer: &str) -> bool {
    answer.to_lowercase().contains("yes")
}

/// Thin client for `POST {host}/api/generate`
#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaClient {
    pub fn new(settings: &ModelSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build model HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", settings.host.trim_end_matches('/')),
            model: settings.name.clone(),
        })
    }

    /// Ask one question about one image; returns the model's answer text
    pub async fn ask(&self, image_b64: &str, question: &str) -> Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: framed_prompt(question),
            images: [image_b64],
            stream: false,
            options: GenerateOptions { temperature: 0.0 },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to reach model server at {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Model server returned {}: {}", status, body.trim());
        }

        let result: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse model response")?;

        if !result.done {
            anyhow::bail!("Model response incomplete");
        }
        Ok(result.response)
    }
}

/// Single pass: "Is there X on the image?"
pub struct OllamaSimple {
    client: OllamaClient,
}

impl OllamaSimple {
    pub const NAME: &'static str = "ollama-simple";

    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }

    async fn locate(&self, image_b64: &str, object: &str) -> Result<Detection> {
        let question = format!("Is there {} on the image? Answer strictly Yes or No", object);
        let answer = self.client.ask(image_b64, &question).await?;
        debug!(model = Self::NAME, answer = %answer.trim(), "Presence answer");

        Ok(if says_yes(&answer) {
            Detection::present(None)
        } else {
            Detection::absent()
        })
    }
}

#[async_trait]
impl ObjectLocator for OllamaSimple {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn detect(&self, image: &[u8], object_description: &str, _channel_description: &str) -> Detection {
        let encoded = STANDARD.encode(image);
        self.locate(&encoded, object_description)
            .await
            .unwrap_or_else(|e| {
                warn!(model = Self::NAME, "Detection failed: {:#}", e);
                Detection::absent()
            })
    }
}

/// Two passes: presence (with camera context), then location
pub struct OllamaComplex {
    client: OllamaClient,
}

impl OllamaComplex {
    pub const NAME: &'static str = "ollama-complex";

    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }

    async fn locate(&self, image_b64: &str, object: &str, channel: &str) -> Result<Detection> {
        let question = format!(
            "Is there {} on this image of the {}? Answer strictly Yes or No.",
            object, channel
        );
        let answer = self.client.ask(image_b64, &question).await?;
        if !says_yes(&answer) {
            return Ok(Detection::absent());
        }

        let question = format!(
            "Where is the {} in the image? Answer strictly with its **Location**",
            object
        );
        let location = self.client.ask(image_b64, &question).await?;
        let location = location.trim().to_lowercase();
        debug!(model = Self::NAME, location = %location, "Location answer");

        Ok(Detection::present(Some(location).filter(|l| !l.is_empty())))
    }
}

#[async_trait]
impl ObjectLocator for OllamaComplex {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn detect(&self, image: &[u8], object_description: &str, channel_description: &str) -> Detection {
        let encoded = STANDARD.encode(image);
        self.locate(&encoded, object_description, channel_description)
            .await
            .unwrap_or_else(|e| {
                warn!(model = Self::NAME, "Detection failed: {:#}", e);
                Detection::absent()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_framing() {
        let prompt = framed_prompt("Is there a cat on the image?");
        assert!(prompt.starts_with("<|begin_of_text|>"));
        assert!(prompt.contains("<|image|>Is there a cat on the image?<|eot_id|>"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>"));
    }

    #[test]
    fn test_answer_parsing() {
        assert!(says_yes("Yes."));
        assert!(says_yes(" YES"));
        assert!(!says_yes("No"));
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let settings = ModelSettings {
            host: "http://gpu-box:11434/".to_string(),
            ..ModelSettings::default()
        };
        let client = OllamaClient::new(&settings).unwrap();
        assert_eq!(client.endpoint, "http://gpu-box:11434/api/generate");
    }

    #[tokio::test]
    async fn test_unreachable_server_degrades_to_absent() {
        let settings = ModelSettings {
            host: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..ModelSettings::default()
        };
        let locator = OllamaSimple::new(OllamaClient::new(&settings).unwrap());
        let detection = locator.detect(b"jpeg", "a cat", "porch").await;
        assert_eq!(detection, Detection::absent());
    }
}
