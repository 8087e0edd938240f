//! Model transport collaborator.
//!
//! The transport turns one request into an async stream of typed events,
//! the vocabulary below. Tool execution happens upstream of the core: the
//! stream carries both the model's tool calls and the executor's results,
//! and the processor only materializes them as parts.

use std::pin::Pin;

use futures::Stream;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use redcell_protocol::protocol::TokenUsage;

use crate::error::Result;

/// A flattened conversation item sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelInput {
    UserText { text: String },
    AssistantText { text: String },
    ToolCall {
        call_id: String,
        tool: String,
        input: Value,
    },
    ToolOutput {
        call_id: String,
        output: String,
        success: Option<bool>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRequest {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input: Vec<ModelInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
    Other,
}

/// One event of the response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    Start,
    Finish,

    StartStep,
    FinishStep {
        finish_reason: FinishReason,
        usage: TokenUsage,
        #[serde(default)]
        provider_metadata: Value,
    },

    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        text: String,
        #[serde(default)]
        provider_metadata: Value,
    },
    TextEnd {
        id: String,
    },

    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        text: String,
    },
    ReasoningEnd {
        id: String,
    },

    ToolInputStart {
        id: String,
        tool_name: String,
    },
    ToolInputDelta {
        id: String,
    },
    ToolInputEnd {
        id: String,
    },

    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: Value,
        #[serde(default)]
        provider_metadata: Value,
    },
    ToolResult {
        tool_call_id: String,
        input: Value,
        output: String,
    },
    ToolError {
        tool_call_id: String,
        input: Value,
        error: String,
    },

    Error {
        error: String,
    },
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

pub trait ModelTransport: Send + Sync {
    fn stream(&self, request: ModelRequest) -> BoxFuture<'_, Result<EventStream>>;
}

/// Classifies stream errors for the retry loop. Mirrors the conservative
/// stance of production transports: everything is transient unless the
/// message carries one of the known-fatal markers.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u64,
    fatal_markers: Vec<&'static str>,
}

impl RetryPolicy {
    pub fn new(max_retries: u64) -> Self {
        Self {
            max_retries,
            fatal_markers: vec![
                "invalid_request",
                "unauthorized",
                "forbidden",
                "context_length",
                "not_found",
            ],
        }
    }

    pub fn is_retryable(&self, message: &str) -> bool {
        let lower = message.to_ascii_lowercase();
        !self.fatal_markers.iter().any(|m| lower.contains(m))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn stream_events_use_kebab_case_tags() {
        let event = StreamEvent::ToolInputStart {
            id: "call_1".to_string(),
            tool_name: "nmap_scan".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool-input-start");
    }

    #[test]
    fn retry_policy_flags_fatal_markers() {
        let policy = RetryPolicy::new(3);
        assert!(policy.is_retryable("stream reset by peer"));
        assert!(policy.is_retryable("429 too many requests"));
        assert!(!policy.is_retryable("400 invalid_request: bad tool schema"));
        assert!(!policy.is_retryable("context_length exceeded"));
    }
}
