pub mod mock;
pub mod ollama;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Who said a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A completion request against a loaded engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>, max_tokens: u32, temperature: f32) -> Self {
        Self {
            messages,
            max_tokens,
            temperature,
            frequency_penalty: None,
            presence_penalty: None,
        }
    }

    pub fn with_penalties(mut self, frequency: f32, presence: f32) -> Self {
        self.frequency_penalty = Some(frequency);
        self.presence_penalty = Some(presence);
        self
    }
}

/// A progress tick reported by the runtime while creating an engine.
///
/// `fraction` is nominally 0.0..=1.0 but is not trusted: it may be
/// non-finite, out of range, or move backwards between ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    pub fraction: f64,
    pub text: String,
}

impl LoadProgress {
    pub fn new(fraction: f64, text: impl Into<String>) -> Self {
        Self {
            fraction,
            text: text.into(),
        }
    }

    pub fn percent(&self) -> u8 {
        if !self.fraction.is_finite() {
            return 0;
        }
        (self.fraction.clamp(0.0, 1.0) * 100.0).round() as u8
    }
}

/// Callback invoked on every runtime progress tick.
pub type ProgressFn = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// Factory for engines. Creation may download and compile model assets.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn create(&self, model: &str, on_progress: ProgressFn) -> Result<Arc<dyn Engine>>;
}

/// A loaded model that can answer prompts.
#[async_trait]
pub trait Engine: Send + Sync {
    fn model_id(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
    async fn unload(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rounds_fraction() {
        assert_eq!(LoadProgress::new(0.424, "").percent(), 42);
        assert_eq!(LoadProgress::new(1.0, "").percent(), 100);
    }

    #[test]
    fn percent_tolerates_garbage() {
        assert_eq!(LoadProgress::new(f64::NAN, "").percent(), 0);
        assert_eq!(LoadProgress::new(-3.0, "").percent(), 0);
        assert_eq!(LoadProgress::new(7.5, "").percent(), 100);
    }

    #[test]
    fn roles_serialize_lowercase() {
        let msg = ChatMessage::new(Role::Assistant, "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
    }
}
