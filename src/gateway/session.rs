//! Gateway session state.
//!
//! A [`Session`] survives reconnects: resuming keeps its id and sequence, a
//! fresh identify resets it.

use serde::Deserialize;
use serde_json::Value;

/// State of one logical gateway session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    /// Last received dispatch sequence, `0` before any dispatch.
    pub sequence: u64,
    pub session_id: Option<String>,
    /// Endpoint to use when resuming, reported by `READY`.
    pub resume_url: Option<String>,
    pub connected: bool,
}

#[derive(Debug, Deserialize)]
struct ReadyData {
    session_id: String,
    #[serde(default)]
    resume_gateway_url: Option<String>,
}

impl Session {
    /// Records a dispatch sequence. The stored value never decreases.
    pub fn observe_sequence(&mut self, sequence: u64) {
        self.sequence = self.sequence.max(sequence);
    }

    /// Whether a resume can be attempted instead of a fresh identify.
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    /// Stores the session id and resume endpoint from a `READY` payload.
    ///
    /// Returns `false` when the payload carries no session id.
    pub fn apply_ready(&mut self, data: &Value) -> bool {
        match ReadyData::deserialize(data) {
            Ok(ready) => {
                self.session_id = Some(ready.session_id);
                self.resume_url = ready.resume_gateway_url;
                true
            }
            Err(_) => false,
        }
    }

    /// Discards the session so the next connection identifies from scratch.
    pub fn reset(&mut self) {
        *self = Self {
            connected: self.connected,
            ..Self::default()
        };
    }
}
