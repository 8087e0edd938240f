//! Typed view over the engagement-state document.
//!
//! The live document is a permissive YAML mapping: the store merges raw
//! values so that keys it has never heard of survive verbatim. These types
//! are the recognized subset, used when a consumer wants structured access
//! instead of a raw mapping.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_yaml::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngagementState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<Credential>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vulnerabilities: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<ShellSession>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<Value>,
    #[serde(
        rename = "failedAttempts",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub failed_attempts: Vec<Value>,
    #[serde(rename = "accessLevel", skip_serializing_if = "Option::is_none")]
    pub access_level: Option<AccessLevel>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Value>,
    /// Keys the schema does not recognize, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl EngagementState {
    pub fn is_empty(&self) -> bool {
        self.target.is_none()
            && self.ports.is_empty()
            && self.credentials.is_empty()
            && self.vulnerabilities.is_empty()
            && self.sessions.is_empty()
            && self.files.is_empty()
            && self.failed_attempts.is_empty()
            && self.access_level.is_none()
            && self.flags.is_empty()
            && self.phase.is_none()
            && self.notes.is_empty()
            && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Target {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Identity for deduplication is `(port, protocol)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub port: u16,
    pub protocol: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Identity for deduplication is `(username, service)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credential {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A shell or implant session obtained on the target. Identity is `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellSession {
    pub id: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    None,
    User,
    Root,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let yaml = "target:\n  ip: 10.0.0.1\ncustomTracker:\n  hits: 3\n";
        let state: EngagementState = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(state.target.as_ref().unwrap().ip.as_deref(), Some("10.0.0.1"));
        assert!(state.extra.contains_key("customTracker"));

        let dumped = serde_yaml::to_string(&state).unwrap();
        assert!(dumped.contains("customTracker"));
    }

    #[test]
    fn empty_state_reports_empty() {
        assert!(EngagementState::default().is_empty());
        let state: EngagementState = serde_yaml::from_str("flags: [user.txt]").unwrap();
        assert!(!state.is_empty());
    }
}
