use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ChatMessage, CompletionRequest, Engine, LoadProgress, ProgressFn, Runtime};
use crate::cache::CacheProbe;

const PULL_PATH: &str = "/api/pull";
const GENERATE_PATH: &str = "/api/generate";
const CHAT_PATH: &str = "/api/chat";
const TAGS_PATH: &str = "/api/tags";

/// Share of the progress bar given to the download; the rest is loading.
const PULL_SHARE: f64 = 0.9;
const LOADING_FRACTION: f64 = 0.95;
const DEFAULT_KEEP_ALIVE: &str = "30m";

/// A runtime backed by a local Ollama daemon.
pub struct OllamaRuntime {
    client: reqwest::Client,
    base_url: String,
    keep_alive: String,
}

impl OllamaRuntime {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: normalize_base(base_url.into()),
            keep_alive: DEFAULT_KEEP_ALIVE.to_string(),
        }
    }

    /// How long the daemon keeps weights resident between requests.
    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = keep_alive.into();
        self
    }

    async fn pull(&self, model: &str, on_progress: &ProgressFn) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}{PULL_PATH}", self.base_url))
            .json(&PullRequest {
                model,
                stream: true,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Ollama pull failed ({}): {}", status, api_error(&text));
        }

        let mut tracker = PullTracker::default();
        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if let Some(tick) = tracker.apply(&String::from_utf8_lossy(&line))? {
                    on_progress(tick);
                }
            }
        }
        if let Some(tick) = tracker.apply(&String::from_utf8_lossy(&buf))? {
            on_progress(tick);
        }
        Ok(())
    }

    async fn load(&self, model: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}{GENERATE_PATH}", self.base_url))
            .json(&GenerateRequest {
                model,
                keep_alive: serde_json::Value::String(self.keep_alive.clone()),
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Ollama failed to load {} ({}): {}", model, status, api_error(&text));
        }
        Ok(())
    }
}

#[async_trait]
impl Runtime for OllamaRuntime {
    async fn create(&self, model: &str, on_progress: ProgressFn) -> Result<Arc<dyn Engine>> {
        self.pull(model, &on_progress).await?;
        on_progress(LoadProgress::new(LOADING_FRACTION, "loading model into memory"));
        self.load(model).await?;

        Ok(Arc::new(OllamaEngine {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            model: model.to_string(),
            keep_alive: self.keep_alive.clone(),
        }))
    }
}

/// A model resident in the Ollama daemon.
pub struct OllamaEngine {
    client: reqwest::Client,
    base_url: String,
    model: String,
    keep_alive: String,
}

#[async_trait]
impl Engine for OllamaEngine {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            stream: false,
            keep_alive: &self.keep_alive,
            options: ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
                frequency_penalty: request.frequency_penalty,
                presence_penalty: request.presence_penalty,
            },
        };

        let resp = self
            .client
            .post(format!("{}{CHAT_PATH}", self.base_url))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Ollama chat error ({}): {}", status, api_error(&text));
        }

        let api_resp: ChatResponse = resp.json().await?;
        Ok(api_resp.message.content)
    }

    async fn unload(&self) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}{GENERATE_PATH}", self.base_url))
            .json(&GenerateRequest {
                model: &self.model,
                keep_alive: serde_json::Value::from(0),
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Ollama failed to unload {} ({}): {}", self.model, status, api_error(&text));
        }
        Ok(())
    }
}

/// Checks the daemon's local model list.
pub struct OllamaCacheProbe {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaCacheProbe {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: normalize_base(base_url.into()),
        }
    }
}

#[async_trait]
impl CacheProbe for OllamaCacheProbe {
    async fn lookup(&self, model: &str) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{}{TAGS_PATH}", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("Ollama tags request failed ({})", resp.status());
        }
        let tags: TagsResponse = resp.json().await?;
        let tagged = format!("{model}:latest");
        Ok(tags
            .models
            .iter()
            .any(|m| m.name == model || m.name == tagged))
    }
}

fn normalize_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

/// Pull the `error` field out of an Ollama error body, falling back to the raw text.
fn api_error(text: &str) -> String {
    serde_json::from_str::<ErrorBody>(text)
        .map(|body| body.error)
        .unwrap_or_else(|_| text.trim().to_string())
}

/// Turns pull stream lines into progress ticks.
#[derive(Default)]
struct PullTracker {
    last_fraction: f64,
}

impl PullTracker {
    fn apply(&mut self, line: &str) -> Result<Option<LoadProgress>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let event: PullEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, line, "skipping unparseable pull line");
                return Ok(None);
            }
        };
        if let Some(error) = event.error {
            bail!("{error}");
        }

        if let (Some(completed), Some(total)) = (event.completed, event.total) {
            if total > 0 {
                self.last_fraction = completed as f64 / total as f64 * PULL_SHARE;
            }
        }
        if event.status.as_deref() == Some("success") {
            self.last_fraction = PULL_SHARE;
        }

        Ok(Some(LoadProgress::new(
            self.last_fraction,
            event.status.unwrap_or_default(),
        )))
    }
}

// --- API types ---

#[derive(Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    keep_alive: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    keep_alive: &'a str,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct PullEvent {
    status: Option<String>,
    completed: Option<u64>,
    total: Option<u64>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_scales_download_into_pull_share() {
        let mut tracker = PullTracker::default();
        let tick = tracker
            .apply(r#"{"status":"pulling abc","completed":50,"total":100}"#)
            .unwrap()
            .unwrap();
        assert!((tick.fraction - 0.45).abs() < 1e-9);
        assert_eq!(tick.text, "pulling abc");
    }

    #[test]
    fn tracker_keeps_last_fraction_for_status_only_lines() {
        let mut tracker = PullTracker::default();
        tracker
            .apply(r#"{"status":"pulling abc","completed":10,"total":10}"#)
            .unwrap();
        let tick = tracker
            .apply(r#"{"status":"verifying sha256 digest"}"#)
            .unwrap()
            .unwrap();
        assert!((tick.fraction - PULL_SHARE).abs() < 1e-9);
    }

    #[test]
    fn tracker_surfaces_error_lines() {
        let mut tracker = PullTracker::default();
        let err = tracker
            .apply(r#"{"error":"pull model manifest: file does not exist"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("file does not exist"));
    }

    #[test]
    fn tracker_ignores_blank_and_garbage_lines() {
        let mut tracker = PullTracker::default();
        assert!(tracker.apply("   ").unwrap().is_none());
        assert!(tracker.apply("not json").unwrap().is_none());
    }

    #[test]
    fn tracker_zero_total_does_not_divide() {
        let mut tracker = PullTracker::default();
        let tick = tracker
            .apply(r#"{"status":"pulling abc","completed":0,"total":0}"#)
            .unwrap()
            .unwrap();
        assert_eq!(tick.fraction, 0.0);
    }

    #[test]
    fn api_error_prefers_error_field() {
        assert_eq!(api_error(r#"{"error":"boom"}"#), "boom");
        assert_eq!(api_error(" plain text "), "plain text");
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        assert_eq!(
            normalize_base("http://localhost:11434/".to_string()),
            "http://localhost:11434"
        );
    }

    #[test]
    fn chat_options_skip_missing_penalties() {
        let options = ChatOptions {
            temperature: 0.0,
            num_predict: 10,
            frequency_penalty: None,
            presence_penalty: None,
        };
        let json = serde_json::to_value(&options).unwrap();
        assert!(json.get("frequency_penalty").is_none());
        assert_eq!(json["num_predict"], 10);
    }
}
