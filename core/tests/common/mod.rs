#![allow(clippy::unwrap_used, dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tempfile::TempDir;

use redcell_core::Redcell;
use redcell_core::config::Config;
use redcell_core::error::Result;
use redcell_core::transport::EventStream;
use redcell_core::transport::FinishReason;
use redcell_core::transport::ModelRequest;
use redcell_core::transport::ModelTransport;
use redcell_core::transport::StreamEvent;
use redcell_protocol::protocol::Event;
use redcell_protocol::protocol::TokenUsage;

/// A core wired against temp directories so tests never touch the real
/// filesystem layout.
pub struct TestCore {
    pub core: Arc<Redcell>,
    pub events: async_channel::Receiver<Event>,
    pub dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.engagement.base_dir = dir.path().join("live");
    config.archive.base_dir = Some(dir.path().join("archive"));
    config
}

pub fn test_core() -> TestCore {
    let dir = TempDir::new().unwrap();
    let (core, events) = Redcell::new(test_config(&dir));
    TestCore { core, events, dir }
}

/// Transport that replays a fixed script per `stream` call and records every
/// request it was given.
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ModelTransport for ScriptedTransport {
    fn stream(&self, request: ModelRequest) -> BoxFuture<'_, Result<EventStream>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let events = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![StreamEvent::Start, StreamEvent::Finish]);
            let stream = futures::stream::iter(events.into_iter().map(Ok));
            Ok(Box::pin(stream) as EventStream)
        })
    }
}

pub fn finish_step(reason: FinishReason) -> StreamEvent {
    StreamEvent::FinishStep {
        finish_reason: reason,
        usage: TokenUsage {
            input: 10,
            output: 5,
            reasoning: 0,
        },
        provider_metadata: serde_json::Value::Null,
    }
}

/// A minimal single-step response producing one text part.
pub fn text_response(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Start,
        StreamEvent::StartStep,
        StreamEvent::TextStart {
            id: "txt_1".to_string(),
        },
        StreamEvent::TextDelta {
            id: "txt_1".to_string(),
            text: text.to_string(),
            provider_metadata: serde_json::Value::Null,
        },
        StreamEvent::TextEnd {
            id: "txt_1".to_string(),
        },
        finish_step(FinishReason::Stop),
        StreamEvent::Finish,
    ]
}

pub fn tool_call(call_id: &str, tool: &str, input: serde_json::Value) -> StreamEvent {
    StreamEvent::ToolCall {
        tool_call_id: call_id.to_string(),
        tool_name: tool.to_string(),
        input,
        provider_metadata: serde_json::Value::Null,
    }
}

/// Poll until `check` passes or a generous deadline expires.
pub async fn wait_for<F: Fn() -> bool>(check: F, what: &str) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
