//! Sessions, messages, parts and permissions.
//!
//! A session tree is a root session plus the transitive children created by
//! sub-agent dispatch. Each session owns an ordered list of messages; an
//! assistant message owns an ordered list of [`Part`]s that are appended as
//! the model stream is consumed.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// One conversational context in the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// `None` for a root session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    /// Ordered permission ruleset; first matching rule wins.
    #[serde(default)]
    pub permission: Vec<PermissionRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single entry of a session's permission ruleset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Permission name this rule applies to, e.g. `task` or `bash`.
    pub permission: String,
    /// Wildcard pattern matched against the requested key. `*` matches any
    /// run of characters; everything else is literal.
    pub pattern: String,
    pub action: RuleAction,
}

impl PermissionRule {
    pub fn new(
        permission: impl Into<String>,
        pattern: impl Into<String>,
        action: RuleAction,
    ) -> Self {
        Self {
            permission: permission.into(),
            pattern: pattern.into(),
            action,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One turn in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub cost: f64,
    pub time: MessageTime,
    /// Set when the turn terminated with a fatal transport error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MessageTime {
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.reasoning
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.reasoning += other.reasoning;
    }
}

/// Shared envelope around every part kind. `time` is the instant the part
/// was appended to its message; kinds that stream carry their own ranges on
/// top of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: PartKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartKind {
    Text(TextPart),
    Reasoning(ReasoningPart),
    Tool(ToolPart),
    Tvar(TvarPart),
    StepStart(StepStartPart),
    StepFinish(StepFinishPart),
    Patch(PatchPart),
}

/// Streamed free text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Model-reported private reasoning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningPart {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPart {
    pub call_id: String,
    pub tool: String,
    pub state: ToolState,
}

impl ToolPart {
    /// Apply a state transition. Transitions only move forward through
    /// `pending -> running -> (completed | error)`; an attempt to regress a
    /// terminal state is ignored and reported as `false`.
    pub fn advance(&mut self, next: ToolState) -> bool {
        if next.rank() <= self.state.rank() {
            return false;
        }
        self.state = next;
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolState {
    Pending,
    Running {
        input: Value,
        time: TimeRange,
    },
    Completed {
        input: Value,
        output: String,
        metadata: Value,
        title: String,
        #[serde(default)]
        attachments: Vec<String>,
        time: TimeRange,
    },
    Error {
        input: Value,
        error: String,
        time: TimeRange,
    },
}

impl ToolState {
    fn rank(&self) -> u8 {
        match self {
            ToolState::Pending => 0,
            ToolState::Running { .. } => 1,
            ToolState::Completed { .. } | ToolState::Error { .. } => 2,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ToolState::Pending)
    }

    pub fn input(&self) -> Option<&Value> {
        match self {
            ToolState::Pending => None,
            ToolState::Running { input, .. }
            | ToolState::Completed { input, .. }
            | ToolState::Error { input, .. } => Some(input),
        }
    }

    pub fn time(&self) -> Option<&TimeRange> {
        match self {
            ToolState::Pending => None,
            ToolState::Running { time, .. }
            | ToolState::Completed { time, .. }
            | ToolState::Error { time, .. } => Some(time),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn open(start: DateTime<Utc>) -> Self {
        Self { start, end: None }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end
            .map(|end| end.signed_duration_since(self.start).num_milliseconds())
    }
}

/// A structured reasoning block parsed out of streamed text: thought and
/// verify are mandatory, action and result optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TvarPart {
    pub thought: String,
    pub verify: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Filled in when a subsequent tool call is attributed to this block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Reconnaissance,
    Enumeration,
    Exploitation,
    PostExploitation,
    Reporting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Reconnaissance => "reconnaissance",
            Phase::Enumeration => "enumeration",
            Phase::Exploitation => "exploitation",
            Phase::PostExploitation => "post_exploitation",
            Phase::Reporting => "reporting",
        }
    }

    /// Five-character tag used in timeline rendering.
    pub fn abbrev(&self) -> &'static str {
        match self {
            Phase::Reconnaissance => "recon",
            Phase::Enumeration => "enume",
            Phase::Exploitation => "explo",
            Phase::PostExploitation => "post_",
            Phase::Reporting => "repor",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartPart {
    /// Workspace snapshot handle taken at the beginning of the step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFinishPart {
    pub tokens: TokenUsage,
    pub cost: f64,
}

/// Filesystem diff observed between a step-start and its step-finish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchPart {
    pub files: Vec<String>,
    pub hash: String,
}

/// A permission demanded somewhere in the tree, surfaced at the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Wildcard keys this request asks to authorize. A request with no
    /// pattern uses its type as the single key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Vec<String>>,
    /// Keys recorded into the approval cache on an `always` reply. Defaults
    /// to the match keys when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub always: Option<Vec<String>>,
    /// Always the root of the requesting session's tree.
    pub session_id: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub metadata: Value,
    pub time: PermissionTime,
}

impl PermissionRequest {
    /// The keys checked against the approval cache.
    pub fn keys(&self) -> Vec<String> {
        match &self.pattern {
            Some(patterns) if !patterns.is_empty() => patterns.clone(),
            _ => vec![self.kind.clone()],
        }
    }

    /// The keys recorded on an `always` reply.
    pub fn always_keys(&self) -> Vec<String> {
        match &self.always {
            Some(keys) if !keys.is_empty() => keys.clone(),
            _ => self.keys(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PermissionTime {
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionResponse {
    Once,
    Always,
    Reject,
}

/// Outbound event envelope. `id` is a monotonic event sequence number local
/// to the core instance that published it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub msg: EventMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventMsg {
    #[serde(rename = "session.updated")]
    SessionUpdated { session: Session },

    #[serde(rename = "session.error")]
    SessionError {
        session_id: String,
        message: String,
    },

    #[serde(rename = "permission.updated")]
    PermissionUpdated { request: PermissionRequest },

    #[serde(rename = "permission.replied")]
    PermissionReplied {
        session_id: String,
        permission_id: String,
        response: PermissionResponse,
    },

    #[serde(rename = "part.updated")]
    PartUpdated { part: Part },

    /// Published while the stream processor sleeps before retrying a
    /// disconnected model stream.
    #[serde(rename = "stream.retry")]
    StreamRetry {
        session_id: String,
        attempt: u64,
        message: String,
        next_retry_at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn part_kind_serializes_with_kebab_case_tag() {
        let part = Part {
            id: "prt_000000000001".to_string(),
            session_id: "ses_000000000000".to_string(),
            message_id: "msg_000000000000".to_string(),
            time: Utc::now(),
            kind: PartKind::StepStart(StepStartPart { snapshot: None }),
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "step-start");
    }

    #[test]
    fn tool_state_never_regresses_from_terminal() {
        let now = Utc::now();
        let mut part = ToolPart {
            call_id: "call_1".to_string(),
            tool: "curl".to_string(),
            state: ToolState::Pending,
        };
        assert!(part.advance(ToolState::Running {
            input: serde_json::json!({"url": "http://x"}),
            time: TimeRange::open(now),
        }));
        assert!(part.advance(ToolState::Completed {
            input: serde_json::json!({"url": "http://x"}),
            output: "ok".to_string(),
            metadata: Value::Null,
            title: "curl".to_string(),
            attachments: Vec::new(),
            time: TimeRange {
                start: now,
                end: Some(now),
            },
        }));
        // A late error report must not clobber the completed state.
        assert!(!part.advance(ToolState::Error {
            input: Value::Null,
            error: "late".to_string(),
            time: TimeRange::open(now),
        }));
        assert!(matches!(part.state, ToolState::Completed { .. }));
    }

    #[test]
    fn permission_request_keys_fall_back_to_type() {
        let request = PermissionRequest {
            id: "per_000000000001".to_string(),
            kind: "bash".to_string(),
            pattern: None,
            always: None,
            session_id: "ses_000000000000".to_string(),
            message_id: "msg_000000000000".to_string(),
            call_id: None,
            title: "run bash".to_string(),
            metadata: Value::Null,
            time: PermissionTime {
                created: Utc::now(),
            },
        };
        assert_eq!(request.keys(), vec!["bash".to_string()]);
        assert_eq!(request.always_keys(), vec!["bash".to_string()]);
    }

    #[test]
    fn event_msg_uses_dotted_type_tags() {
        let msg = EventMsg::PermissionReplied {
            session_id: "ses_000000000000".to_string(),
            permission_id: "per_000000000001".to_string(),
            response: PermissionResponse::Always,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "permission.replied");
        assert_eq!(json["response"], "always");
    }
}
