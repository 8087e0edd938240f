//! Single-response stream processor.
//!
//! One processor instance owns the lifecycle of exactly one assistant
//! message. It consumes the typed event stream from the model transport and
//! materializes parts, wires TVAR blocks to the tool calls that follow
//! them, guards against doom loops, post-processes MCP tool output, and
//! decides whether the caller should run another step, stop, or compact
//! history first.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use redcell_protocol::protocol::EventMsg;
use redcell_protocol::protocol::PartKind;
use redcell_protocol::protocol::PatchPart;
use redcell_protocol::protocol::ReasoningPart;
use redcell_protocol::protocol::StepFinishPart;
use redcell_protocol::protocol::StepStartPart;
use redcell_protocol::protocol::TextPart;
use redcell_protocol::protocol::TimeRange;
use redcell_protocol::protocol::TokenUsage;
use redcell_protocol::protocol::ToolPart;
use redcell_protocol::protocol::ToolState;
use redcell_protocol::protocol::TvarPart;

use crate::config::Config;
use crate::error::RedcellErr;
use crate::error::Result;
use crate::outputs::McpToolCache;
use crate::outputs::OutputStore;
use crate::outputs::StoreOutputRequest;
use crate::permission::AskRequest;
use crate::permission::PermissionEngine;
use crate::redcell::EventBus;
use crate::session::SessionStore;
use crate::snapshot::WorkspaceSnapshot;
use crate::transport::FinishReason;
use crate::transport::ModelRequest;
use crate::transport::ModelTransport;
use crate::transport::RetryPolicy;
use crate::transport::StreamEvent;
use crate::tvar;
use crate::util::backoff;

/// How many consecutive byte-identical tool calls trip the doom-loop guard.
const DOOM_LOOP_RUN: usize = 3;

/// What the caller should do after the response completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Another step may follow (the model asked for tools).
    Continue,
    /// A denied permission or a fatal error ended the turn.
    Stop,
    /// Token usage would overflow the context; compact and rerun.
    Compact,
}

/// Everything the processor borrows from the core instance.
#[derive(Clone)]
pub struct ProcessorContext {
    pub sessions: Arc<SessionStore>,
    pub permissions: Arc<PermissionEngine>,
    pub snapshot: Arc<dyn WorkspaceSnapshot>,
    pub output_store: Arc<dyn OutputStore>,
    pub mcp_tools: Arc<McpToolCache>,
    pub bus: EventBus,
    pub config: Arc<Config>,
    pub retry: RetryPolicy,
}

pub struct StreamProcessor {
    ctx: ProcessorContext,
    session_id: String,
    message_id: String,
    cancel: CancellationToken,
    /// Optional hook applied to each finalized text part before TVAR
    /// extraction.
    text_postprocess: Option<Arc<dyn Fn(&str) -> String + Send + Sync>>,

    // Per-attempt stream state; reset before every (re)connect.
    texts: HashMap<String, String>,
    reasonings: HashMap<String, String>,
    tools: HashMap<String, String>,
    snapshot_handle: Option<String>,
    last_finish: Option<FinishReason>,
    blocked: bool,
    needs_compaction: bool,
}

impl StreamProcessor {
    pub fn new(
        ctx: ProcessorContext,
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            session_id: session_id.into(),
            message_id: message_id.into(),
            cancel,
            text_postprocess: None,
            texts: HashMap::new(),
            reasonings: HashMap::new(),
            tools: HashMap::new(),
            snapshot_handle: None,
            last_finish: None,
            blocked: false,
            needs_compaction: false,
        }
    }

    pub fn with_text_postprocess(
        mut self,
        hook: Arc<dyn Fn(&str) -> String + Send + Sync>,
    ) -> Self {
        self.text_postprocess = Some(hook);
        self
    }

    /// Drive one response to completion, retrying transient stream failures
    /// with backoff. On abort every open tool part flips to an error and the
    /// message is stamped completed.
    pub async fn run(
        &mut self,
        transport: &dyn ModelTransport,
        request: ModelRequest,
    ) -> Result<RunStatus> {
        let mut attempt: u64 = 0;
        loop {
            match self.run_once(transport, request.clone()).await {
                Ok(status) => {
                    self.finish_message(None)?;
                    return Ok(status);
                }
                Err(RedcellErr::Cancelled) => {
                    self.drain_in_flight("Tool execution aborted")?;
                    self.finish_message(None)?;
                    return Err(RedcellErr::Cancelled);
                }
                Err(RedcellErr::Stream(message, delay))
                    if self.ctx.retry.is_retryable(&message)
                        && attempt < self.ctx.retry.max_retries =>
                {
                    attempt += 1;
                    // Parts opened by the failed attempt must not linger as
                    // running; the rerun starts its own.
                    self.drain_in_flight("stream retry")?;
                    let delay = delay.unwrap_or_else(|| backoff(attempt));
                    warn!(
                        "stream disconnected - retrying turn ({attempt}/{} in {delay:?})...",
                        self.ctx.retry.max_retries
                    );
                    let next_retry_at = Utc::now()
                        + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    self.ctx.bus.publish(EventMsg::StreamRetry {
                        session_id: self.session_id.clone(),
                        attempt,
                        message,
                        next_retry_at,
                    });
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.drain_in_flight("Tool execution aborted")?;
                            self.finish_message(None)?;
                            return Err(RedcellErr::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    // Fatal: record on the message, surface, stop the loop.
                    let message = err.to_string();
                    self.drain_in_flight("stream failed")?;
                    self.finish_message(Some(message.clone()))?;
                    self.ctx.bus.publish(EventMsg::SessionError {
                        session_id: self.session_id.clone(),
                        message,
                    });
                    return Ok(RunStatus::Stop);
                }
            }
        }
    }

    async fn run_once(
        &mut self,
        transport: &dyn ModelTransport,
        request: ModelRequest,
    ) -> Result<RunStatus> {
        self.reset();
        let mut stream = transport.stream(request).await?;

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(RedcellErr::Cancelled),
                event = stream.next() => event,
            };
            let Some(event) = event else {
                break;
            };

            match event? {
                StreamEvent::Start => trace!("response started"),
                StreamEvent::Finish => break,

                StreamEvent::StartStep => self.on_start_step()?,
                StreamEvent::FinishStep {
                    finish_reason,
                    usage,
                    provider_metadata,
                } => self.on_finish_step(finish_reason, usage, provider_metadata)?,

                StreamEvent::TextStart { id } => self.on_text_start(id)?,
                StreamEvent::TextDelta { id, text, .. } => self.on_text_delta(id, text)?,
                StreamEvent::TextEnd { id } => self.on_text_end(id)?,

                StreamEvent::ReasoningStart { id } => self.on_reasoning_start(id)?,
                StreamEvent::ReasoningDelta { id, text } => {
                    self.on_reasoning_delta(id, text)?
                }
                StreamEvent::ReasoningEnd { id } => self.on_reasoning_end(id)?,

                StreamEvent::ToolInputStart { id, tool_name } => {
                    self.on_tool_input_start(id, tool_name)?
                }
                StreamEvent::ToolInputDelta { .. } | StreamEvent::ToolInputEnd { .. } => {}

                StreamEvent::ToolCall {
                    tool_call_id,
                    tool_name,
                    input,
                    ..
                } => self.on_tool_call(tool_call_id, tool_name, input).await?,
                StreamEvent::ToolResult {
                    tool_call_id,
                    input,
                    output,
                } => self.on_tool_result(tool_call_id, input, output)?,
                StreamEvent::ToolError {
                    tool_call_id,
                    input,
                    error,
                } => self.on_tool_error(tool_call_id, input, error)?,

                StreamEvent::Error { error } => {
                    return Err(RedcellErr::Stream(error, None));
                }
            }

            if self.needs_compaction {
                self.drain_in_flight("interrupted for compaction")?;
                return Ok(RunStatus::Compact);
            }
        }

        Ok(self.terminal_status())
    }

    fn reset(&mut self) {
        self.texts.clear();
        self.reasonings.clear();
        self.tools.clear();
        self.snapshot_handle = None;
        self.last_finish = None;
    }

    fn terminal_status(&self) -> RunStatus {
        if self.blocked && !self.ctx.config.experimental.continue_loop_on_deny {
            return RunStatus::Stop;
        }
        match self.last_finish {
            Some(FinishReason::ToolCalls) => RunStatus::Continue,
            _ => RunStatus::Stop,
        }
    }

    // ----------------------------------------------------------------
    // Text and reasoning
    // ----------------------------------------------------------------

    fn on_text_start(&mut self, id: String) -> Result<()> {
        let part = self.ctx.sessions.add_part(
            &self.session_id,
            &self.message_id,
            PartKind::Text(TextPart::default()),
        )?;
        self.texts.insert(id, part.id);
        Ok(())
    }

    fn on_text_delta(&mut self, id: String, delta: String) -> Result<()> {
        if !self.texts.contains_key(&id) {
            // Transports are allowed to skip text-start.
            self.on_text_start(id.clone())?;
        }
        if let Some(part_id) = self.texts.get(&id) {
            self.ctx
                .sessions
                .update_part(&self.message_id, part_id, |part| {
                    if let PartKind::Text(text) = &mut part.kind {
                        text.text.push_str(&delta);
                    }
                })?;
        }
        Ok(())
    }

    fn on_text_end(&mut self, id: String) -> Result<()> {
        let Some(part_id) = self.texts.remove(&id) else {
            debug!(id, "text-end for unknown stream id");
            return Ok(());
        };

        let hook = self.text_postprocess.clone();
        let finalized = self
            .ctx
            .sessions
            .update_part(&self.message_id, &part_id, |part| {
                if let PartKind::Text(text) = &mut part.kind {
                    let mut cleaned = text.text.trim_end().to_string();
                    if let Some(hook) = &hook {
                        cleaned = hook(&cleaned);
                    }
                    text.text = cleaned;
                    text.end = Some(Utc::now());
                }
            })?;

        let PartKind::Text(text) = &finalized.kind else {
            return Ok(());
        };
        let blocks = tvar::parse(&text.text);
        if blocks.is_empty() {
            return Ok(());
        }

        for block in &blocks {
            self.ctx.sessions.add_part(
                &self.session_id,
                &self.message_id,
                PartKind::Tvar(TvarPart {
                    thought: block.thought.clone(),
                    verify: block.verify.clone(),
                    action: block.action.clone(),
                    result: block.result.clone(),
                    phase: block.phase,
                    tool_call_id: None,
                }),
            )?;
        }

        let stripped = tvar::strip(&text.text, &blocks);
        self.ctx
            .sessions
            .update_part(&self.message_id, &part_id, |part| {
                if let PartKind::Text(text) = &mut part.kind {
                    text.text = stripped.clone();
                }
            })?;
        Ok(())
    }

    fn on_reasoning_start(&mut self, id: String) -> Result<()> {
        let part = self.ctx.sessions.add_part(
            &self.session_id,
            &self.message_id,
            PartKind::Reasoning(ReasoningPart::default()),
        )?;
        self.reasonings.insert(id, part.id);
        Ok(())
    }

    fn on_reasoning_delta(&mut self, id: String, delta: String) -> Result<()> {
        if !self.reasonings.contains_key(&id) {
            self.on_reasoning_start(id.clone())?;
        }
        if let Some(part_id) = self.reasonings.get(&id) {
            self.ctx
                .sessions
                .update_part(&self.message_id, part_id, |part| {
                    if let PartKind::Reasoning(reasoning) = &mut part.kind {
                        reasoning.text.push_str(&delta);
                    }
                })?;
        }
        Ok(())
    }

    fn on_reasoning_end(&mut self, id: String) -> Result<()> {
        if let Some(part_id) = self.reasonings.remove(&id) {
            self.ctx
                .sessions
                .update_part(&self.message_id, &part_id, |part| {
                    if let PartKind::Reasoning(reasoning) = &mut part.kind {
                        reasoning.text = reasoning.text.trim_end().to_string();
                        reasoning.end = Some(Utc::now());
                    }
                })?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Tools
    // ----------------------------------------------------------------

    fn on_tool_input_start(&mut self, id: String, tool_name: String) -> Result<()> {
        let part = self.ctx.sessions.add_part(
            &self.session_id,
            &self.message_id,
            PartKind::Tool(ToolPart {
                call_id: id.clone(),
                tool: tool_name,
                state: ToolState::Pending,
            }),
        )?;
        self.tools.insert(id, part.id);
        Ok(())
    }

    async fn on_tool_call(
        &mut self,
        tool_call_id: String,
        tool_name: String,
        input: Value,
    ) -> Result<()> {
        if !self.tools.contains_key(&tool_call_id) {
            self.on_tool_input_start(tool_call_id.clone(), tool_name.clone())?;
        }
        if let Some(part_id) = self.tools.get(&tool_call_id).cloned() {
            let input_for_part = input.clone();
            self.ctx
                .sessions
                .update_part(&self.message_id, &part_id, |part| {
                    if let PartKind::Tool(tool) = &mut part.kind {
                        tool.advance(ToolState::Running {
                            input: input_for_part,
                            time: TimeRange::open(Utc::now()),
                        });
                    }
                })?;
        }

        self.link_tvar(&tool_call_id)?;
        self.doom_loop_guard(&tool_call_id, &tool_name, &input).await
    }

    /// Attribute this call to the most recent TVAR block that is not yet
    /// linked to one. Missing blocks are recoverable: the model may simply
    /// not have reasoned in TVAR form.
    fn link_tvar(&self, tool_call_id: &str) -> Result<()> {
        let parts = self.ctx.sessions.parts(&self.message_id);
        let unlinked = parts.iter().rev().find(|part| {
            matches!(
                &part.kind,
                PartKind::Tvar(tvar) if tvar.tool_call_id.is_none()
            )
        });
        match unlinked {
            Some(part) => {
                let call = tool_call_id.to_string();
                self.ctx
                    .sessions
                    .update_part(&self.message_id, &part.id, |part| {
                        if let PartKind::Tvar(tvar) = &mut part.kind {
                            tvar.tool_call_id = Some(call);
                        }
                    })?;
            }
            None => {
                warn!(tool_call_id, "tool call without an unlinked tvar block");
            }
        }
        Ok(())
    }

    /// Three consecutive tool parts with the same tool and byte-identical
    /// input, with no other part in between, look like a stuck agent: raise
    /// a `doom_loop` permission so the user can authorize or abort.
    async fn doom_loop_guard(
        &mut self,
        tool_call_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> Result<()> {
        let current_input = canonical_input(input);
        let parts = self.ctx.sessions.parts(&self.message_id);

        let mut identical = 0usize;
        for part in parts.iter().rev() {
            let PartKind::Tool(tool) = &part.kind else {
                break;
            };
            if tool.state.is_pending() {
                continue;
            }
            let same = tool.tool == tool_name
                && tool
                    .state
                    .input()
                    .map(canonical_input)
                    .is_some_and(|existing| existing == current_input);
            if same {
                identical += 1;
            } else {
                break;
            }
        }

        if identical != DOOM_LOOP_RUN {
            return Ok(());
        }

        debug!(tool = tool_name, "doom loop detected");
        let ask = AskRequest {
            kind: "doom_loop".to_string(),
            title: format!("`{tool_name}` called {DOOM_LOOP_RUN} times with identical input"),
            pattern: Some(vec![tool_name.to_string()]),
            always: Some(vec![tool_name.to_string()]),
            session_id: self.session_id.clone(),
            message_id: self.message_id.clone(),
            call_id: Some(tool_call_id.to_string()),
            metadata: json!({ "tool": tool_name, "input": input }),
        };
        match self.ctx.permissions.ask(ask, &self.cancel).await {
            Ok(()) => Ok(()),
            Err(err @ RedcellErr::Rejected { .. }) => {
                debug!(tool = tool_name, "doom loop rejected: {err}");
                if let Some(part_id) = self.tools.get(tool_call_id) {
                    self.ctx
                        .sessions
                        .update_part(&self.message_id, part_id, |part| {
                            if let PartKind::Tool(tool) = &mut part.kind {
                                let start = tool
                                    .state
                                    .time()
                                    .map(|t| t.start)
                                    .unwrap_or_else(Utc::now);
                                tool.advance(ToolState::Error {
                                    input: tool.state.input().cloned().unwrap_or(Value::Null),
                                    error: "rejected by doom-loop guard".to_string(),
                                    time: TimeRange {
                                        start,
                                        end: Some(Utc::now()),
                                    },
                                });
                            }
                        })?;
                }
                self.blocked = true;
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    fn on_tool_result(
        &mut self,
        tool_call_id: String,
        input: Value,
        output: String,
    ) -> Result<()> {
        let Some(part_id) = self.tools.get(&tool_call_id).cloned() else {
            debug!(tool_call_id, "tool-result for unknown call");
            return Ok(());
        };
        let tool_name = self.tool_name(&part_id);
        let (output, metadata) = self.postprocess_mcp_output(&tool_name, output);

        self.ctx
            .sessions
            .update_part(&self.message_id, &part_id, |part| {
                if let PartKind::Tool(tool) = &mut part.kind {
                    let start = tool.state.time().map(|t| t.start).unwrap_or_else(Utc::now);
                    let input = match tool.state.input() {
                        Some(existing) if !existing.is_null() => existing.clone(),
                        _ => input,
                    };
                    let title = tool.tool.clone();
                    tool.advance(ToolState::Completed {
                        input,
                        output,
                        metadata,
                        title,
                        attachments: Vec::new(),
                        time: TimeRange {
                            start,
                            end: Some(Utc::now()),
                        },
                    });
                }
            })?;
        Ok(())
    }

    fn on_tool_error(
        &mut self,
        tool_call_id: String,
        input: Value,
        error: String,
    ) -> Result<()> {
        let Some(part_id) = self.tools.get(&tool_call_id).cloned() else {
            debug!(tool_call_id, "tool-error for unknown call");
            return Ok(());
        };
        self.ctx
            .sessions
            .update_part(&self.message_id, &part_id, |part| {
                if let PartKind::Tool(tool) = &mut part.kind {
                    let start = tool.state.time().map(|t| t.start).unwrap_or_else(Utc::now);
                    let input = match tool.state.input() {
                        Some(existing) if !existing.is_null() => existing.clone(),
                        _ => input,
                    };
                    tool.advance(ToolState::Error {
                        input,
                        error,
                        time: TimeRange {
                            start,
                            end: Some(Utc::now()),
                        },
                    });
                }
            })?;
        Ok(())
    }

    fn tool_name(&self, part_id: &str) -> String {
        self.ctx
            .sessions
            .parts(&self.message_id)
            .into_iter()
            .find(|part| part.id == part_id)
            .and_then(|part| match part.kind {
                PartKind::Tool(tool) => Some(tool.tool),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// MCP tools wrap their payload in an envelope with a `raw_output`
    /// field. Hand it to the output store; when it stores the payload, the
    /// conversation keeps only the summary.
    fn postprocess_mcp_output(&self, tool_name: &str, output: String) -> (String, Value) {
        if tool_name.is_empty()
            || !self.ctx.mcp_tools.is_mcp_tool(tool_name)
            || self
                .ctx
                .config
                .experimental
                .primary_tools
                .iter()
                .any(|t| t == tool_name)
        {
            return (output, Value::Null);
        }
        let Ok(parsed) = serde_json::from_str::<Value>(&output) else {
            return (output, Value::Null);
        };
        let Some(raw_output) = parsed.get("raw_output").cloned() else {
            return (output, Value::Null);
        };

        let request = StoreOutputRequest {
            session_id: self.session_id.clone(),
            tool: tool_name.to_string(),
            method: parsed
                .get("method")
                .and_then(|m| m.as_str())
                .map(str::to_string),
            data: parsed,
            raw_output,
        };
        match self.ctx.output_store.store(request) {
            Ok(stored) if stored.stored => {
                let metadata = json!({
                    "outputStored": true,
                    "outputId": stored.output_id,
                });
                (stored.output, metadata)
            }
            Ok(_) => (output, Value::Null),
            Err(err) => {
                warn!("output store failed: {err}");
                (output, Value::Null)
            }
        }
    }

    // ----------------------------------------------------------------
    // Steps
    // ----------------------------------------------------------------

    fn on_start_step(&mut self) -> Result<()> {
        let handle = match self.ctx.snapshot.track() {
            Ok(handle) if !handle.is_empty() => Some(handle),
            Ok(_) => None,
            Err(err) => {
                warn!("snapshot tracking failed: {err}");
                None
            }
        };
        self.snapshot_handle = handle.clone();
        self.ctx.sessions.add_part(
            &self.session_id,
            &self.message_id,
            PartKind::StepStart(StepStartPart { snapshot: handle }),
        )?;
        Ok(())
    }

    fn on_finish_step(
        &mut self,
        finish_reason: FinishReason,
        usage: TokenUsage,
        provider_metadata: Value,
    ) -> Result<()> {
        let step_cost = provider_metadata
            .get("cost")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let message = self.ctx.sessions.update_message(&self.message_id, |message| {
            message.tokens.add(&usage);
            message.cost += step_cost;
        })?;

        self.ctx.sessions.add_part(
            &self.session_id,
            &self.message_id,
            PartKind::StepFinish(StepFinishPart {
                tokens: usage,
                cost: step_cost,
            }),
        )?;

        if let Some(handle) = self.snapshot_handle.take() {
            match self.ctx.snapshot.patch(&handle) {
                Ok(patch) if !patch.is_empty() => {
                    self.ctx.sessions.add_part(
                        &self.session_id,
                        &self.message_id,
                        PartKind::Patch(PatchPart {
                            files: patch.files,
                            hash: patch.hash,
                        }),
                    )?;
                }
                Ok(_) => {}
                Err(err) => warn!("snapshot diff failed: {err}"),
            }
        }

        self.last_finish = Some(finish_reason);

        let window = self.ctx.config.model.context_window;
        if window > 0 && message.tokens.total() + self.ctx.config.model.compaction_margin >= window
        {
            debug!(
                tokens = message.tokens.total(),
                window, "context near capacity, compaction required"
            );
            self.needs_compaction = true;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Termination
    // ----------------------------------------------------------------

    /// Close every open text/reasoning part and fail every open tool part
    /// with `reason`. Used on abort, retry, compaction and fatal errors.
    fn drain_in_flight(&mut self, reason: &str) -> Result<()> {
        for part_id in self.texts.drain().map(|(_, id)| id).chain(
            self.reasonings.drain().map(|(_, id)| id),
        ) {
            self.ctx
                .sessions
                .update_part(&self.message_id, &part_id, |part| match &mut part.kind {
                    PartKind::Text(text) => {
                        if text.end.is_none() {
                            text.end = Some(Utc::now());
                        }
                    }
                    PartKind::Reasoning(reasoning) => {
                        if reasoning.end.is_none() {
                            reasoning.end = Some(Utc::now());
                        }
                    }
                    _ => {}
                })?;
        }

        let error = reason.to_string();
        for part_id in self.tools.drain().map(|(_, id)| id) {
            let error = error.clone();
            self.ctx
                .sessions
                .update_part(&self.message_id, &part_id, |part| {
                    if let PartKind::Tool(tool) = &mut part.kind {
                        if matches!(
                            tool.state,
                            ToolState::Pending | ToolState::Running { .. }
                        ) {
                            let start =
                                tool.state.time().map(|t| t.start).unwrap_or_else(Utc::now);
                            tool.advance(ToolState::Error {
                                input: tool.state.input().cloned().unwrap_or(Value::Null),
                                error,
                                time: TimeRange {
                                    start,
                                    end: Some(Utc::now()),
                                },
                            });
                        }
                    }
                })?;
        }
        Ok(())
    }

    fn finish_message(&self, error: Option<String>) -> Result<()> {
        self.ctx.sessions.update_message(&self.message_id, |message| {
            if message.time.completed.is_none() {
                message.time.completed = Some(Utc::now());
            }
            if error.is_some() {
                message.error = error;
            }
        })?;
        Ok(())
    }
}

/// Byte-identical comparison of tool inputs via canonical JSON.
fn canonical_input(input: &Value) -> String {
    input.to_string()
}
