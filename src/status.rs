//! Engine state and the status values broadcast to the supervising process.

use serde::{Deserialize, Serialize};

/// Lifecycle of the single local-inference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Error,
    Unloading,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "not_initialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Unloading => "unloading",
        }
    }
}

/// Phase shown to the user while a model is being brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Queued,
    Downloading,
    Loading,
    Ready,
    Error,
}

/// One status-change event. `percent` is 0..=100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub status: ProgressStatus,
    #[serde(rename = "progress")]
    pub percent: u8,
    pub message: String,
    pub model_id: String,
}

impl ProgressReport {
    pub fn new(
        status: ProgressStatus,
        percent: u8,
        message: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            status,
            percent: percent.min(100),
            message: message.into(),
            model_id: model_id.into(),
        }
    }
}

/// Point-in-time view of the engine manager, readable without locking it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub state: EngineState,
    pub model_id: Option<String>,
    /// Unix millis of the last request that touched the engine.
    pub last_activity: Option<i64>,
}

impl EngineStatus {
    pub fn is_ready(&self) -> bool {
        self.state == EngineState::Ready
    }

    pub fn is_initializing(&self) -> bool {
        self.state == EngineState::Initializing
    }
}

/// Periodic liveness announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub alive: bool,
    pub engine_ready: bool,
    pub model_id: Option<String>,
}

impl From<&EngineStatus> for Heartbeat {
    fn from(status: &EngineStatus) -> Self {
        Self {
            alive: true,
            engine_ready: status.is_ready(),
            model_id: status.model_id.clone(),
        }
    }
}
