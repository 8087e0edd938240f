//! Pluggable permission policy hook.
//!
//! The hook runs inside `ask` before a request goes pending: it can resolve
//! the request, fail it, or fall through to the interactive path. A deny
//! from the hook wins even when ultrasploit mode is enabled.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny,
    Ask,
}

/// What the hook gets to look at. The session id has already been resolved
/// to the root of the tree.
#[derive(Debug, Clone)]
pub struct AskInfo<'a> {
    pub root_session_id: &'a str,
    pub kind: &'a str,
    pub keys: &'a [String],
    pub call_id: Option<&'a str>,
    pub title: &'a str,
    pub metadata: &'a Value,
}

pub trait PermissionPolicy: Send + Sync {
    fn on_permission_ask(&self, info: &AskInfo<'_>) -> PolicyDecision;
}

/// Default hook: never auto-decides, every request goes to the user.
#[derive(Debug, Default)]
pub struct AskEverything;

impl PermissionPolicy for AskEverything {
    fn on_permission_ask(&self, _info: &AskInfo<'_>) -> PolicyDecision {
        PolicyDecision::Ask
    }
}
