//! The core instance.
//!
//! [`Redcell`] owns the shared subsystems (identifier generator, hierarchy
//! registry, permission engine, engagement store, session store, archive
//! writer) plus the collaborator implementations and the outbound event
//! queue. Everything is an explicit instance so tests can build isolated
//! cores; nothing here is ambient process state.

use std::sync::Arc;

use async_channel::Receiver;
use async_channel::Sender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use redcell_protocol::protocol::Event;
use redcell_protocol::protocol::EventMsg;
use redcell_protocol::protocol::PartKind;
use redcell_protocol::protocol::PermissionResponse;
use redcell_protocol::protocol::PermissionRule;
use redcell_protocol::protocol::Role;
use redcell_protocol::protocol::Session;
use redcell_protocol::protocol::ToolState;
use redcell_protocol::trajectory::EngagementLog;

use crate::agents::AgentDirectory;
use crate::agents::BuiltinAgents;
use crate::archive::ArchiveWriter;
use crate::config::Config;
use crate::engagement::EngagementStore;
use crate::error::Result;
use crate::hierarchy::HierarchyRegistry;
use crate::ids::IdGenerator;
use crate::ids::IdKind;
use crate::outputs::EmptyToolRegistry;
use crate::outputs::McpToolCache;
use crate::outputs::NoOutputStore;
use crate::outputs::OutputStore;
use crate::outputs::ToolRegistry;
use crate::permission::PermissionEngine;
use crate::policy::AskEverything;
use crate::policy::PermissionPolicy;
use crate::processor::ProcessorContext;
use crate::processor::RunStatus;
use crate::processor::StreamProcessor;
use crate::session::SessionStore;
use crate::snapshot::NoSnapshot;
use crate::snapshot::WorkspaceSnapshot;
use crate::transport::ModelInput;
use crate::transport::ModelRequest;
use crate::transport::ModelTransport;
use crate::transport::RetryPolicy;
use crate::trajectory;

/// Publishes outbound events without ever blocking core control flow: when
/// the consumer lags (or nobody is listening) events are dropped, not
/// queued unboundedly.
#[derive(Clone)]
pub struct EventBus {
    ids: Arc<IdGenerator>,
    tx: Sender<Event>,
}

impl EventBus {
    pub fn new(ids: Arc<IdGenerator>, tx: Sender<Event>) -> Self {
        Self { ids, tx }
    }

    /// A bus with its own queue, for tests and standalone subsystem use.
    pub fn standalone(ids: Arc<IdGenerator>, capacity: usize) -> (Self, Receiver<Event>) {
        let (tx, rx) = async_channel::bounded(capacity);
        (Self::new(ids, tx), rx)
    }

    pub fn publish(&self, msg: EventMsg) {
        let event = Event {
            id: self.ids.next(IdKind::Event),
            msg,
        };
        if let Err(err) = self.tx.try_send(event) {
            debug!("outbound event dropped: {err}");
        }
    }
}

/// Result of driving one turn to completion.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub status: RunStatus,
    pub last_text: Option<String>,
}

pub struct RedcellBuilder {
    config: Config,
    policy: Arc<dyn PermissionPolicy>,
    snapshot: Arc<dyn WorkspaceSnapshot>,
    output_store: Arc<dyn OutputStore>,
    tool_registry: Arc<dyn ToolRegistry>,
    agents: Arc<dyn AgentDirectory>,
    event_capacity: usize,
}

impl RedcellBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            policy: Arc::new(AskEverything),
            snapshot: Arc::new(NoSnapshot),
            output_store: Arc::new(NoOutputStore),
            tool_registry: Arc::new(EmptyToolRegistry),
            agents: Arc::new(BuiltinAgents::default()),
            event_capacity: 256,
        }
    }

    pub fn policy(mut self, policy: Arc<dyn PermissionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn snapshot(mut self, snapshot: Arc<dyn WorkspaceSnapshot>) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn output_store(mut self, output_store: Arc<dyn OutputStore>) -> Self {
        self.output_store = output_store;
        self
    }

    pub fn tool_registry(mut self, tool_registry: Arc<dyn ToolRegistry>) -> Self {
        self.tool_registry = tool_registry;
        self
    }

    pub fn agents(mut self, agents: Arc<dyn AgentDirectory>) -> Self {
        self.agents = agents;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> (Arc<Redcell>, Receiver<Event>) {
        let ids = Arc::new(IdGenerator::new());
        let (tx, rx) = async_channel::bounded(self.event_capacity);
        let bus = EventBus::new(Arc::clone(&ids), tx);

        let hierarchy = Arc::new(HierarchyRegistry::new());
        let permissions = Arc::new(PermissionEngine::new(
            Arc::clone(&hierarchy),
            Arc::clone(&ids),
            self.policy,
            bus.clone(),
        ));
        let engagement = Arc::new(EngagementStore::new(
            self.config.engagement.base_dir.clone(),
            self.config.engagement.prefix.clone(),
            Arc::clone(&hierarchy),
        ));
        let sessions = Arc::new(SessionStore::new(Arc::clone(&ids), bus.clone()));
        let archive = Arc::new(ArchiveWriter::new(self.config.archive.resolve_base()));
        let mcp_tools = Arc::new(McpToolCache::new(self.tool_registry));

        let core = Arc::new(Redcell {
            config: Arc::new(self.config),
            ids,
            hierarchy,
            permissions,
            engagement,
            sessions,
            archive,
            snapshot: self.snapshot,
            output_store: self.output_store,
            mcp_tools,
            agents: self.agents,
            bus,
        });
        (core, rx)
    }
}

pub struct Redcell {
    config: Arc<Config>,
    #[allow(dead_code)]
    ids: Arc<IdGenerator>,
    hierarchy: Arc<HierarchyRegistry>,
    permissions: Arc<PermissionEngine>,
    engagement: Arc<EngagementStore>,
    sessions: Arc<SessionStore>,
    archive: Arc<ArchiveWriter>,
    snapshot: Arc<dyn WorkspaceSnapshot>,
    output_store: Arc<dyn OutputStore>,
    mcp_tools: Arc<McpToolCache>,
    agents: Arc<dyn AgentDirectory>,
    bus: EventBus,
}

impl Redcell {
    pub fn new(config: Config) -> (Arc<Self>, Receiver<Event>) {
        RedcellBuilder::new(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn permissions(&self) -> &Arc<PermissionEngine> {
        &self.permissions
    }

    pub fn hierarchy(&self) -> &Arc<HierarchyRegistry> {
        &self.hierarchy
    }

    pub fn engagement(&self) -> &Arc<EngagementStore> {
        &self.engagement
    }

    pub fn agents(&self) -> &Arc<dyn AgentDirectory> {
        &self.agents
    }

    /// Call after a tool-registry configuration change so the MCP lookup
    /// cache re-reads the listing.
    pub fn invalidate_tool_cache(&self) {
        self.mcp_tools.invalidate();
    }

    pub fn create_root_session(&self, title: impl Into<String>) -> Session {
        self.sessions.create_session(title, None, Vec::new())
    }

    pub fn create_session(
        &self,
        title: impl Into<String>,
        parent_id: Option<String>,
        permission: Vec<PermissionRule>,
    ) -> Session {
        self.sessions.create_session(title, parent_id, permission)
    }

    /// Delete a session, releasing its hierarchy registration and, for a
    /// root, every pending permission of its tree.
    pub fn delete_session(&self, id: &str) {
        let root = self.hierarchy.root_of(id);
        if root == id {
            self.permissions.reject_all_pending(id);
            self.hierarchy.unregister_tree(id);
        } else {
            self.hierarchy.unregister(id);
        }
        self.sessions.delete_session(id);
    }

    pub fn respond_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        response: PermissionResponse,
    ) {
        self.permissions.respond(session_id, permission_id, response);
    }

    pub(crate) fn processor_context(&self) -> ProcessorContext {
        ProcessorContext {
            sessions: Arc::clone(&self.sessions),
            permissions: Arc::clone(&self.permissions),
            snapshot: Arc::clone(&self.snapshot),
            output_store: Arc::clone(&self.output_store),
            mcp_tools: Arc::clone(&self.mcp_tools),
            bus: self.bus.clone(),
            config: Arc::clone(&self.config),
            retry: RetryPolicy::new(self.config.stream.max_retries),
        }
    }

    /// Run one turn: append the user prompt (when given), then keep driving
    /// the processor while it reports that another step may follow.
    pub async fn run_turn(
        &self,
        transport: &dyn ModelTransport,
        session_id: &str,
        prompt: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        if let Some(prompt) = prompt {
            self.sessions.push_user_message(session_id, prompt)?;
        }

        loop {
            let message = self.sessions.append_message(
                session_id,
                Role::Assistant,
                self.config.model.model.clone(),
                self.config.model.provider.clone(),
            )?;
            let request = self.build_model_request(session_id);
            let mut processor = StreamProcessor::new(
                self.processor_context(),
                session_id,
                &message.id,
                cancel.clone(),
            );
            let status = processor.run(transport, request).await?;
            match status {
                RunStatus::Continue => continue,
                RunStatus::Stop | RunStatus::Compact => {
                    return Ok(TurnOutcome {
                        status,
                        last_text: self.sessions.last_assistant_text(session_id),
                    });
                }
            }
        }
    }

    /// Flatten the session history into transport input. TVAR blocks are
    /// re-rendered in their tag form so the model keeps seeing its own
    /// structured reasoning.
    pub fn build_model_request(&self, session_id: &str) -> ModelRequest {
        let mut input = Vec::new();
        for message in self.sessions.messages(session_id) {
            for part in self.sessions.parts(&message.id) {
                match (&message.role, &part.kind) {
                    (Role::User, PartKind::Text(text)) => {
                        input.push(ModelInput::UserText {
                            text: text.text.clone(),
                        });
                    }
                    (Role::Assistant, PartKind::Text(text)) => {
                        if !text.text.is_empty() {
                            input.push(ModelInput::AssistantText {
                                text: text.text.clone(),
                            });
                        }
                    }
                    (Role::Assistant, PartKind::Tvar(tvar)) => {
                        let mut rendered = format!(
                            "<thought>{}</thought><verify>{}</verify>",
                            tvar.thought, tvar.verify
                        );
                        if let Some(action) = &tvar.action {
                            rendered.push_str(&format!("<action>{action}</action>"));
                        }
                        if let Some(result) = &tvar.result {
                            rendered.push_str(&format!("<result>{result}</result>"));
                        }
                        input.push(ModelInput::AssistantText { text: rendered });
                    }
                    (Role::Assistant, PartKind::Tool(tool)) => match &tool.state {
                        ToolState::Completed { input: args, output, .. } => {
                            input.push(ModelInput::ToolCall {
                                call_id: tool.call_id.clone(),
                                tool: tool.tool.clone(),
                                input: args.clone(),
                            });
                            input.push(ModelInput::ToolOutput {
                                call_id: tool.call_id.clone(),
                                output: output.clone(),
                                success: Some(true),
                            });
                        }
                        ToolState::Error { input: args, error, .. } => {
                            input.push(ModelInput::ToolCall {
                                call_id: tool.call_id.clone(),
                                tool: tool.tool.clone(),
                                input: args.clone(),
                            });
                            input.push(ModelInput::ToolOutput {
                                call_id: tool.call_id.clone(),
                                output: error.clone(),
                                success: Some(false),
                            });
                        }
                        ToolState::Pending | ToolState::Running { .. } => {}
                    },
                    _ => {}
                }
            }
        }
        ModelRequest {
            session_id: session_id.to_string(),
            instructions: None,
            input,
        }
    }

    /// Dispatch a sub-agent and wait for its final text. Callers that hold
    /// elevated trust can bypass the agent-type checks through
    /// [`task::run_task`](crate::task::run_task) directly.
    pub async fn dispatch_task(
        &self,
        transport: &dyn ModelTransport,
        caller_session_id: &str,
        request: crate::task::TaskRequest,
        cancel: &CancellationToken,
    ) -> Result<crate::task::TaskOutput> {
        crate::task::run_task(self, transport, caller_session_id, request, false, cancel).await
    }

    pub fn engagement_log(&self, root_id: &str) -> EngagementLog {
        trajectory::from_engagement(&self.sessions, &self.hierarchy, root_id)
    }

    pub fn format_engagement_log(&self, root_id: &str) -> String {
        trajectory::format_engagement_log(&self.engagement_log(root_id))
    }

    pub async fn archive_engagement(&self, root_id: &str) -> Result<std::path::PathBuf> {
        self.archive
            .archive_engagement(&self.sessions, &self.hierarchy, &self.engagement, root_id)
            .await
    }
}

impl Drop for Redcell {
    fn drop(&mut self) {
        self.permissions.teardown();
    }
}
