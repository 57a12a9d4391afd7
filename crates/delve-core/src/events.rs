//! Event bus between a running research engine and its observers.
//!
//! Engines emit token-usage and progress events while they run; the agent
//! adapter drains them into the cost accountant and the log.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Unique identifier for an event
pub type EventId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub event_id: EventId,
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: AgentEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEventKind {
    /// Tokens consumed by one model call inside the engine.
    TokenUsage {
        model: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Coarse progress notice from an engine node.
    Progress { node: String, message: String },
}

/// Sending half handed to engines.
#[derive(Clone)]
pub struct AgentEventCollector {
    sender: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentEventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit_token_usage(&self, model: impl Into<String>, input_tokens: u64, output_tokens: u64) {
        self.emit(AgentEventKind::TokenUsage {
            model: model.into(),
            input_tokens,
            output_tokens,
        });
    }

    pub fn emit_progress(&self, node: impl Into<String>, message: impl Into<String>) {
        self.emit(AgentEventKind::Progress {
            node: node.into(),
            message: message.into(),
        });
    }

    fn emit(&self, kind: AgentEventKind) {
        let event = AgentEvent {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            kind,
        };

        if let Err(e) = self.sender.send(event) {
            tracing::warn!(error = %e, "Failed to emit agent event");
        }
    }
}

impl Default for AgentEventCollector {
    fn default() -> Self {
        Self::new().0
    }
}

fn generate_event_id() -> EventId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("evt_{}", id)
}

/// Current Unix timestamp in milliseconds
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
