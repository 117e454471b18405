#![forbid(unsafe_code)]

// Rate and abuse guard - per-connection chat throttling and inbound payload
// inspection. Both run in the connection loop before any handler sees the
// message.

use crate::error::{ChatError, ChatResult};
use crate::sanitize::MAX_MSG_LEN;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Minimum gap between chat messages from one connection. Faster messages
/// are dropped silently: no queue, no error to the sender.
pub const MIN_CHAT_INTERVAL: Duration = Duration::from_millis(500);

/// Per-connection chat flood guard.
#[derive(Debug, Default)]
pub struct FloodGuard {
    last_message: Option<Instant>,
}

impl FloodGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a chat message arriving at `now` may proceed, and
    /// records it as the latest accepted message.
    pub fn allow(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_message {
            if now.duration_since(last) < MIN_CHAT_INTERVAL {
                return false;
            }
        }
        self.last_message = Some(now);
        true
    }
}

/// Inspects a raw chat payload before dispatch.
///
/// Only the server may originate the structured "media" chat shape, so any
/// non-string payload is rejected outright. Oversize strings are rejected
/// here at twice the normal chat cap, so a payload can't dodge the
/// sanitizer's length check by arriving at a different layer.
pub fn inspect_chat(payload: &Value) -> ChatResult<&str> {
    match payload {
        Value::String(s) => {
            if s.chars().count() > 2 * MAX_MSG_LEN {
                return Err(ChatError::Validation("message too long".into()));
            }
            Ok(s)
        }
        Value::Object(_) => Err(ChatError::Validation(
            "chat payload must be plain text".into(),
        )),
        _ => Err(ChatError::Validation("chat payload must be a string".into())),
    }
}
