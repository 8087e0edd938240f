//! Sub-agent dispatch.
//!
//! `task` creates (or resumes) a child session under the caller's root,
//! seeds it with the engagement directory and the shared state document,
//! and drives one full turn on it. The child's ruleset denies `task`
//! outright, so a sub-agent can never recurse into more sub-agents, and its
//! scratchpad tools are denied as well.

use tokio_util::sync::CancellationToken;
use tracing::info;

use redcell_protocol::protocol::PermissionRule;
use redcell_protocol::protocol::RuleAction;
use redcell_protocol::protocol::Session;

use crate::agents::ruleset_action;
use crate::error::RedcellErr;
use crate::error::Result;
use crate::redcell::Redcell;
use crate::transport::ModelTransport;

/// Agent types under this prefix are an authorized family: they skip the
/// caller-ruleset check and always receive the engagement-state injection.
pub const AUTHORIZED_AGENT_PREFIX: &str = "pentest/";

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub description: String,
    pub prompt: String,
    pub subagent_type: String,
    /// Resume an existing child instead of creating a new one.
    pub task_id: Option<String>,
    /// Optional command hint forwarded verbatim in the child prompt.
    pub command: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub task_id: String,
    pub text: String,
}

/// Dispatch one sub-agent turn and wait for its final text.
pub async fn run_task(
    core: &Redcell,
    transport: &dyn ModelTransport,
    caller_session_id: &str,
    request: TaskRequest,
    bypass_permission_checks: bool,
    cancel: &CancellationToken,
) -> Result<TaskOutput> {
    let subagent_type = request.subagent_type.clone();

    if !bypass_permission_checks {
        let caller = core
            .sessions()
            .get_session(caller_session_id)
            .ok_or_else(|| RedcellErr::SessionNotFound(caller_session_id.to_string()))?;
        // An explicit deny always blocks, even for the authorized family:
        // every child ruleset denies `task` outright, which is what keeps
        // sub-agents from recursing into more sub-agents.
        if ruleset_action(&caller.permission, "task", &subagent_type)
            == Some(RuleAction::Deny)
        {
            return Err(RedcellErr::AgentDenied(subagent_type));
        }
        if !subagent_type.starts_with(AUTHORIZED_AGENT_PREFIX)
            && core.agents().lookup(&subagent_type).is_none()
        {
            return Err(RedcellErr::AgentNotFound(subagent_type));
        }
    }

    let root_id = core.hierarchy().root_of(caller_session_id);
    let child = resolve_child(core, caller_session_id, &root_id, &request)?;
    core.hierarchy().register(&child.id, &root_id);

    let dir = core.engagement().ensure_layout(&root_id).await?;
    let prompt = build_child_prompt(core, &root_id, &dir, &request).await?;

    info!(
        caller = caller_session_id,
        child = child.id,
        agent = subagent_type,
        "dispatching sub-agent"
    );

    // The child's cancellation chains off the caller's: aborting the parent
    // turn aborts the sub-agent with it.
    let child_cancel = cancel.child_token();
    let outcome = core
        .run_turn(transport, &child.id, Some(&prompt), child_cancel)
        .await?;

    Ok(TaskOutput {
        task_id: child.id,
        text: outcome.last_text.unwrap_or_default(),
    })
}

fn resolve_child(
    core: &Redcell,
    caller_session_id: &str,
    root_id: &str,
    request: &TaskRequest,
) -> Result<Session> {
    if let Some(task_id) = &request.task_id
        && let Some(existing) = core.sessions().get_session(task_id)
    {
        return Ok(existing);
    }

    let dir = core.engagement().session_dir(root_id);
    let permission = vec![
        PermissionRule::new("task", "*", RuleAction::Deny),
        PermissionRule::new("todowrite", "*", RuleAction::Deny),
        PermissionRule::new("todoread", "*", RuleAction::Deny),
        PermissionRule::new(
            "external_directory",
            format!("{}/*", dir.display()),
            RuleAction::Allow,
        ),
    ];
    let title = format!(
        "@{} subagent: {}",
        request.subagent_type, request.description
    );
    Ok(core.create_session(title, Some(caller_session_id.to_string()), permission))
}

/// Prefix the caller-supplied prompt with the session-directory header and,
/// for `pentest/` agents or a non-empty document, the engagement-state
/// injection.
async fn build_child_prompt(
    core: &Redcell,
    root_id: &str,
    dir: &std::path::Path,
    request: &TaskRequest,
) -> Result<String> {
    let mut sections = vec![format!(
        "## Session Directory\n\nAll engagement artifacts for this tree live under:\n{}",
        dir.display()
    )];

    let injection = core.engagement().format_for_injection(root_id).await?;
    let wants_state = request
        .subagent_type
        .starts_with(AUTHORIZED_AGENT_PREFIX)
        || injection.is_some();
    if wants_state {
        sections.push(injection.unwrap_or_else(|| {
            "## Engagement State\n\nNo engagement state has been recorded yet.".to_string()
        }));
    }

    if let Some(command) = &request.command {
        sections.push(format!("Suggested command: `{command}`"));
    }
    sections.push(request.prompt.clone());
    Ok(sections.join("\n\n"))
}
