//! Trajectory aggregation.
//!
//! Walks a session tree after the fact and flattens every TVAR block and
//! tool call into one wall-clock-ordered timeline. Sessions run
//! concurrently and give no cross-session ordering guarantees, so the
//! timestamp sort is the only ordering authority here.

use std::sync::LazyLock;

use regex_lite::Regex;

use redcell_protocol::protocol::PartKind;
use redcell_protocol::protocol::Phase;
use redcell_protocol::protocol::Role;
use redcell_protocol::protocol::Session;
use redcell_protocol::protocol::ToolState;
use redcell_protocol::trajectory::EngagementLog;
use redcell_protocol::trajectory::EngagementSummary;
use redcell_protocol::trajectory::SessionTrace;
use redcell_protocol::trajectory::TrajectoryEntry;
use redcell_protocol::trajectory::TrajectoryKind;

use crate::hierarchy::HierarchyRegistry;
use crate::session::SessionStore;
use crate::util::truncate;

pub const ROOT_AGENT_NAME: &str = "master";
const FALLBACK_AGENT_NAME: &str = "subagent";

#[allow(clippy::expect_used)]
static AT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(\S+)\s+subagent").expect("agent name regex"));

#[allow(clippy::expect_used)]
static CHILD_FOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)child session\b.*\bfor\s+(\S+)").expect("child title regex"));

/// Agent name for a session title: `@name subagent`, then
/// `Child session … for name`, then the generic fallback.
pub fn agent_name_from_title(title: &str) -> String {
    if let Some(caps) = AT_NAME_RE.captures(title)
        && let Some(name) = caps.get(1)
    {
        return name.as_str().to_string();
    }
    if let Some(caps) = CHILD_FOR_RE.captures(title)
        && let Some(name) = caps.get(1)
    {
        return name.as_str().to_string();
    }
    FALLBACK_AGENT_NAME.to_string()
}

/// Timeline of a single session. TVAR entries that were linked to a tool
/// call carry the tool's name and completion status in their details.
pub fn from_session(store: &SessionStore, session: &Session, agent_name: &str) -> SessionTrace {
    let messages = store.messages(&session.id);
    let mut entries: Vec<TrajectoryEntry> = Vec::new();
    let mut model = None;

    for message in &messages {
        if message.role == Role::Assistant && model.is_none() {
            model = message.model_id.clone();
        }
        let parts = store.parts(&message.id);
        for part in &parts {
            match &part.kind {
                PartKind::Tvar(tvar) => {
                    let mut details = Vec::new();
                    details.push(format!("verify: {}", tvar.verify));
                    if let Some(action) = &tvar.action {
                        details.push(format!("action: {action}"));
                    }
                    if let Some(result) = &tvar.result {
                        details.push(format!("result: {result}"));
                    }
                    if let Some(call_id) = &tvar.tool_call_id
                        && let Some((tool, status)) = tool_for_call(&parts, call_id)
                    {
                        details.push(format!("tool: {tool} ({status})"));
                    }
                    entries.push(TrajectoryEntry {
                        kind: TrajectoryKind::Tvar,
                        timestamp: part.time,
                        agent_name: agent_name.to_string(),
                        session_id: session.id.clone(),
                        phase: tvar.phase,
                        summary: truncate(tvar.thought.lines().next().unwrap_or(""), 120),
                        details: Some(details.join("\n")),
                        duration_ms: None,
                        success: None,
                    });
                }
                PartKind::Tool(tool) => {
                    let time = tool.state.time();
                    let (summary, success) = match &tool.state {
                        ToolState::Pending => (format!("{} (pending)", tool.tool), None),
                        ToolState::Running { .. } => {
                            (format!("{} (running)", tool.tool), None)
                        }
                        ToolState::Completed { .. } => (tool.tool.clone(), Some(true)),
                        ToolState::Error { error, .. } => {
                            (format!("{}: {}", tool.tool, truncate(error, 80)), Some(false))
                        }
                    };
                    entries.push(TrajectoryEntry {
                        kind: TrajectoryKind::Tool,
                        timestamp: time.map(|t| t.start).unwrap_or(part.time),
                        agent_name: agent_name.to_string(),
                        session_id: session.id.clone(),
                        phase: None,
                        summary,
                        details: tool
                            .state
                            .input()
                            .map(|input| truncate(&input.to_string(), 200)),
                        duration_ms: time.and_then(|t| t.duration_ms()),
                        success,
                    });
                }
                _ => {}
            }
        }
    }

    entries.sort_by_key(|entry| entry.timestamp);

    SessionTrace {
        session_id: session.id.clone(),
        model,
        start_time: messages
            .first()
            .map(|m| m.time.created)
            .unwrap_or(session.created_at),
        end_time: messages.last().and_then(|m| m.time.completed),
        steps: entries,
    }
}

fn tool_for_call(
    parts: &[redcell_protocol::protocol::Part],
    call_id: &str,
) -> Option<(String, &'static str)> {
    parts.iter().find_map(|part| match &part.kind {
        PartKind::Tool(tool) if tool.call_id == call_id => {
            let status = match &tool.state {
                ToolState::Pending => "pending",
                ToolState::Running { .. } => "running",
                ToolState::Completed { .. } => "completed",
                ToolState::Error { .. } => "error",
            };
            Some((tool.tool.clone(), status))
        }
        _ => None,
    })
}

/// Merge the whole tree under `root_id` into one ascending timeline.
pub fn from_engagement(
    store: &SessionStore,
    hierarchy: &HierarchyRegistry,
    root_id: &str,
) -> EngagementLog {
    let mut session_ids = vec![root_id.to_string()];
    session_ids.extend(hierarchy.children(root_id));

    let mut entries: Vec<TrajectoryEntry> = Vec::new();
    let mut agent_names: Vec<String> = Vec::new();
    let mut total_agents = 0usize;

    for session_id in &session_ids {
        let Some(session) = store.get_session(session_id) else {
            continue;
        };
        total_agents += 1;
        let name = if session_id == root_id {
            ROOT_AGENT_NAME.to_string()
        } else {
            agent_name_from_title(&session.title)
        };
        if !agent_names.contains(&name) {
            agent_names.push(name.clone());
        }
        entries.extend(from_session(store, &session, &name).steps);
    }

    entries.sort_by_key(|entry| entry.timestamp);

    let tool_calls = entries
        .iter()
        .filter(|e| e.kind == TrajectoryKind::Tool)
        .count();
    let successful_tools = entries.iter().filter(|e| e.success == Some(true)).count();
    let failed_tools = entries.iter().filter(|e| e.success == Some(false)).count();
    let mut phases: Vec<Phase> = Vec::new();
    for entry in &entries {
        if let Some(phase) = entry.phase
            && !phases.contains(&phase)
        {
            phases.push(phase);
        }
    }

    EngagementLog {
        root_id: root_id.to_string(),
        entries,
        summary: EngagementSummary {
            total_agents,
            agent_names,
            tool_calls,
            successful_tools,
            failed_tools,
            phases,
        },
    }
}

/// Render a human-readable timeline. Consecutive entries by the same agent
/// blank the agent column so runs of activity read as one block; phase tags
/// are abbreviated to five characters.
pub fn format_engagement_log(log: &EngagementLog) -> String {
    let mut out = String::new();
    out.push_str(&format!("=== Engagement {} ===\n", log.root_id));
    out.push_str(&format!(
        "agents: {} ({}); tool calls: {} ({} ok, {} failed)\n\n",
        log.summary.total_agents,
        log.summary.agent_names.join(", "),
        log.summary.tool_calls,
        log.summary.successful_tools,
        log.summary.failed_tools,
    ));

    let width = log
        .summary
        .agent_names
        .iter()
        .map(|name| name.len())
        .max()
        .unwrap_or(FALLBACK_AGENT_NAME.len());

    let mut previous_agent: Option<&str> = None;
    for entry in &log.entries {
        let agent = if previous_agent == Some(entry.agent_name.as_str()) {
            String::new()
        } else {
            entry.agent_name.clone()
        };
        previous_agent = Some(entry.agent_name.as_str());

        let phase = entry
            .phase
            .map(|p| p.abbrev())
            .unwrap_or("     ");
        out.push_str(&format!(
            "{} {agent:width$} [{phase}] {}\n",
            entry.timestamp.format("%H:%M:%S"),
            entry.summary,
        ));
    }
    out
}
