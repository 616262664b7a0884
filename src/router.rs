//! Message router: the single entry point for inbound requests.
//!
//! A message is a JSON object with an `action` and a `target`. Messages for
//! another target are ignored (`None`); everything addressed to us gets
//! exactly one typed response, failures included.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::EngineManager;
use crate::error::ProcessError;
use crate::processor::chat::chat;
use crate::processor::grouping::{TabDescriptor, TabGroup, group_tabs};
use crate::runtime::{ChatMessage, CompletionRequest, Role};

const WARMUP_PROMPT: &str = "Hi";

/// An inbound request, keyed by its `action` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    Init {
        #[serde(default)]
        model_id: Option<String>,
    },
    GroupTabs {
        tabs: Vec<TabDescriptor>,
    },
    Chat {
        messages: Vec<ChatMessage>,
    },
    GetStatus,
    #[serde(rename_all = "camelCase")]
    Warmup {
        #[serde(default)]
        model_id: Option<String>,
    },
    Ping,
    Unload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupsReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<TabGroup>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub ready: bool,
    pub model_id: Option<String>,
    pub initializing: bool,
    pub last_activity_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarmupReply {
    pub success: bool,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pong {
    pub pong: bool,
    pub ready: bool,
}

/// One response per handled request. Serializes as the bare inner object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ack(Ack),
    Groups(GroupsReply),
    Chat(ChatReply),
    Status(StatusReply),
    Warmup(WarmupReply),
    Pong(Pong),
}

impl Response {
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Ack(Ack {
            success: false,
            error: Some(error.into()),
        })
    }
}

pub struct Router {
    manager: EngineManager,
    target: String,
}

impl Router {
    pub fn new(manager: EngineManager, target: impl Into<String>) -> Self {
        Self {
            manager,
            target: target.into(),
        }
    }

    pub fn manager(&self) -> &EngineManager {
        &self.manager
    }

    /// Route a raw message. `None` means it was addressed to someone else.
    pub async fn route(&self, message: &Value) -> Option<Response> {
        let target = message.get("target").and_then(Value::as_str);
        if target != Some(self.target.as_str()) {
            debug!(?target, "ignoring message for another target");
            return None;
        }

        match Request::deserialize(message) {
            Ok(request) => Some(self.handle(request).await),
            Err(e) => {
                let action = message.get("action").and_then(Value::as_str);
                warn!(?action, error = %e, "rejected request");
                Some(Response::failure(match action {
                    Some(action) if !is_known_action(action) => {
                        format!("unknown action: {action}")
                    }
                    _ => format!("invalid request: {e}"),
                }))
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Init { model_id } => {
                let outcome = self.manager.ensure_ready(model_id.as_deref()).await;
                Response::Ack(Ack {
                    success: outcome.is_ok(),
                    error: outcome.err().map(|e| e.to_string()),
                })
            }
            Request::GroupTabs { tabs } => {
                Response::Groups(match group_tabs(&self.manager, &tabs).await {
                    Ok(groups) => GroupsReply {
                        success: true,
                        groups: Some(groups),
                        error: None,
                    },
                    Err(e) => GroupsReply {
                        success: false,
                        groups: None,
                        error: Some(failure_message(&e)),
                    },
                })
            }
            Request::Chat { messages } => Response::Chat(match chat(&self.manager, &messages).await {
                Ok(response) => ChatReply {
                    success: true,
                    response: Some(response),
                    error: None,
                },
                Err(e) => ChatReply {
                    success: false,
                    response: None,
                    error: Some(failure_message(&e)),
                },
            }),
            Request::GetStatus => {
                let status = self.manager.status();
                Response::Status(StatusReply {
                    ready: status.is_ready(),
                    model_id: status.model_id.clone(),
                    initializing: status.is_initializing(),
                    last_activity_timestamp: status.last_activity,
                })
            }
            Request::Warmup { model_id } => Response::Warmup(self.warmup(model_id.as_deref()).await),
            Request::Ping => Response::Pong(Pong {
                pong: true,
                ready: self.manager.status().is_ready(),
            }),
            Request::Unload => {
                self.manager.unload().await;
                Response::Ack(Ack {
                    success: true,
                    error: None,
                })
            }
        }
    }

    async fn warmup(&self, model_id: Option<&str>) -> WarmupReply {
        if let Err(e) = self.manager.ensure_ready(model_id).await {
            return WarmupReply {
                success: false,
                ready: false,
                error: Some(e.to_string()),
            };
        }

        let probe = CompletionRequest::new(vec![ChatMessage::new(Role::User, WARMUP_PROMPT)], 1, 0.0);
        if let Err(e) = self.manager.complete(&probe).await {
            warn!(error = %format!("{e:#}"), "warmup completion failed");
        }

        WarmupReply {
            success: true,
            ready: self.manager.status().is_ready(),
            error: None,
        }
    }
}

/// Initialization failures keep their fixed caller-facing text; the cause is logged.
fn failure_message(err: &ProcessError) -> String {
    if let ProcessError::Init(cause) = err {
        warn!(error = %cause, "request failed: engine not ready");
    }
    err.to_string()
}

fn is_known_action(action: &str) -> bool {
    matches!(
        action,
        "init" | "group-tabs" | "chat" | "get-status" | "warmup" | "ping" | "unload"
    )
}
