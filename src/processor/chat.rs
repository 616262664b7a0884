//! Conversational replies with repetition suppression.

use std::collections::HashSet;

use crate::consts::{
    CHAT_FALLBACK_REPLY, CHAT_FREQUENCY_PENALTY, CHAT_MAX_TOKENS, CHAT_PRESENCE_PENALTY,
    CHAT_TEMPERATURE,
};
use crate::engine::EngineManager;
use crate::error::ProcessError;
use crate::runtime::{ChatMessage, CompletionRequest};

/// Lines shorter than this (after trimming) never count as repetition.
const MIN_SIGNAL_CHARS: usize = 5;

/// Output is cut once more than this many repeats arrive back to back.
const MAX_CONSECUTIVE_REPEATS: usize = 2;

pub async fn chat(manager: &EngineManager, messages: &[ChatMessage]) -> Result<String, ProcessError> {
    manager.ensure_ready(None).await.map_err(ProcessError::Init)?;

    let request = CompletionRequest::new(messages.to_vec(), CHAT_MAX_TOKENS, CHAT_TEMPERATURE)
        .with_penalties(CHAT_FREQUENCY_PENALTY, CHAT_PRESENCE_PENALTY);
    let raw = manager
        .complete(&request)
        .await
        .map_err(|e| ProcessError::Inference(format!("{e:#}")))?;

    let reply = suppress_repetition(&raw);
    if reply.is_empty() {
        tracing::debug!("empty reply after repetition suppression; using fallback");
        return Ok(CHAT_FALLBACK_REPLY.to_string());
    }
    Ok(reply)
}

/// Cut a reply that has started looping.
///
/// Lines are compared trimmed and case-folded. Short lines pass through
/// untouched and neither extend nor break a run of repeats. Kept lines keep
/// their original endings.
pub fn suppress_repetition(text: &str) -> String {
    let mut seen: HashSet<String> = HashSet::new();
    let mut streak = 0usize;
    let mut kept: Vec<&str> = Vec::new();

    for line in text.split_inclusive('\n') {
        let key = line.trim().to_lowercase();
        if key.chars().count() < MIN_SIGNAL_CHARS {
            kept.push(line);
            continue;
        }

        if seen.insert(key) {
            streak = 0;
        } else {
            streak += 1;
            if streak > MAX_CONSECUTIVE_REPEATS {
                tracing::debug!(kept = kept.len(), "reply started repeating; truncating");
                break;
            }
        }
        kept.push(line);
    }

    kept.concat().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_repeats_keep_through_second_repeat() {
        let text = "The sky is blue.\nThe sky is blue.\nThe sky is blue.\nThe sky is blue.";
        assert_eq!(
            suppress_repetition(text),
            "The sky is blue.\nThe sky is blue.\nThe sky is blue."
        );
    }

    #[test]
    fn comparison_ignores_case_and_padding() {
        let text = "Hello there\n  hello THERE \nHELLO there\nhello there\nafter";
        assert_eq!(suppress_repetition(text).lines().count(), 3);
    }

    #[test]
    fn short_lines_are_never_repetition() {
        let text = "ok\nok\nok\nok\nok\n---\n---\n---\n---";
        assert_eq!(suppress_repetition(text), text);
    }

    #[test]
    fn fresh_line_resets_the_streak() {
        let text = "alpha line\nalpha line\nalpha line\nbeta line\nalpha line\ngamma line";
        assert_eq!(suppress_repetition(text), text);
    }

    #[test]
    fn unique_text_is_untouched() {
        let text = "First point here.\n\nSecond point here.";
        assert_eq!(suppress_repetition(text), text);
    }

    #[test]
    fn crlf_endings_survive() {
        let text = "First point here.\r\nSecond point here.\r\nSecond point here.";
        assert_eq!(suppress_repetition(text), text);

        let looping = "Again and again\r\nAgain and again\r\nAgain and again\r\nAgain and again\r\n";
        assert_eq!(
            suppress_repetition(looping),
            "Again and again\r\nAgain and again\r\nAgain and again"
        );
    }

    #[test]
    fn whitespace_only_reply_becomes_empty() {
        assert_eq!(suppress_repetition("  \n\n \t"), "");
    }
}
