//! Aggregated timeline types.
//!
//! A trajectory flattens a whole session tree into one timestamp-ordered
//! list of reasoning blocks and tool events, ready to be rendered or
//! exported as JSONL for training-data pipelines.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::protocol::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryKind {
    Tvar,
    Tool,
}

/// One event of the flattened timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    pub kind: TrajectoryKind,
    pub timestamp: DateTime<Utc>,
    pub agent_name: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// For tool entries: whether the call completed without error. Absent on
    /// tvar entries and on calls that never finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// The timeline of a single session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTrace {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub steps: Vec<TrajectoryEntry>,
}

/// The merged timeline of a whole tree plus summary counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementLog {
    pub root_id: String,
    pub entries: Vec<TrajectoryEntry>,
    pub summary: EngagementSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngagementSummary {
    pub total_agents: usize,
    pub agent_names: Vec<String>,
    pub tool_calls: usize,
    pub successful_tools: usize,
    pub failed_tools: usize,
    pub phases: Vec<Phase>,
}
