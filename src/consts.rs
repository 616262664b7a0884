//! Project-wide constants.

use std::path::PathBuf;
use std::time::Duration;

/// Model loaded when a request does not name one.
pub const DEFAULT_MODEL: &str = "qwen2.5:1.5b";

/// Default address of the local Ollama daemon.
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Router discriminator; messages addressed to another target are ignored.
pub const DEFAULT_TARGET: &str = "offscreen";

/// Period between liveness heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Token floor for grouping completions.
pub const GROUPING_MIN_TOKENS: u32 = 1500;

/// Extra tokens granted per tab in a grouping request.
pub const GROUPING_TOKENS_PER_TAB: u32 = 50;

/// Group names are cut to this many characters before being returned.
pub const GROUP_NAME_MAX_CHARS: usize = 8;

/// Token budget for one chat turn.
pub const CHAT_MAX_TOKENS: u32 = 512;

pub const CHAT_TEMPERATURE: f32 = 0.7;
pub const CHAT_FREQUENCY_PENALTY: f32 = 0.5;
pub const CHAT_PRESENCE_PENALTY: f32 = 0.3;

/// Substituted when the chat reply is empty after repetition suppression.
pub const CHAT_FALLBACK_REPLY: &str =
    "I'm sorry, I couldn't come up with a response. Could you rephrase that?";

/// Default database path: `~/.tabloom/tabloom.db`.
/// Holds the persisted engine status and user preferences.
pub fn default_db_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tabloom").join("tabloom.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consts_are_non_empty() {
        assert!(!DEFAULT_MODEL.is_empty());
        assert!(!DEFAULT_TARGET.is_empty());
        assert!(!CHAT_FALLBACK_REPLY.trim().is_empty());
    }

    #[test]
    fn default_db_path_lives_under_dot_dir() {
        if let Some(path) = default_db_path() {
            assert!(path.ends_with(".tabloom/tabloom.db"));
        }
    }
}
