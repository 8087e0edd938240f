//! Agent directory collaborator.
//!
//! Sub-agent dispatch looks the requested type up here before creating a
//! child session. The `pentest/` family is always dispatchable regardless of
//! what the directory lists.

use redcell_protocol::protocol::PermissionRule;
use redcell_protocol::protocol::RuleAction;
use wildmatch::WildMatch;

#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub name: String,
    pub description: String,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

pub trait AgentDirectory: Send + Sync {
    fn lookup(&self, name: &str) -> Option<AgentInfo>;
    fn list(&self) -> Vec<AgentInfo>;
}

/// The built-in engagement roster.
#[derive(Debug)]
pub struct BuiltinAgents {
    agents: Vec<AgentInfo>,
}

impl Default for BuiltinAgents {
    fn default() -> Self {
        Self {
            agents: vec![
                AgentInfo::new("pentest/recon", "network and host reconnaissance"),
                AgentInfo::new("pentest/enum", "service and share enumeration"),
                AgentInfo::new("pentest/exploit", "vulnerability exploitation"),
                AgentInfo::new("pentest/privesc", "privilege escalation"),
                AgentInfo::new("pentest/report", "findings write-up"),
                AgentInfo::new("general", "general-purpose helper"),
            ],
        }
    }
}

impl BuiltinAgents {
    pub fn with_agents(agents: Vec<AgentInfo>) -> Self {
        Self { agents }
    }
}

impl AgentDirectory for BuiltinAgents {
    fn lookup(&self, name: &str) -> Option<AgentInfo> {
        self.agents.iter().find(|a| a.name == name).cloned()
    }

    fn list(&self) -> Vec<AgentInfo> {
        self.agents.clone()
    }
}

/// First-match evaluation of a session ruleset for one permission name.
/// Returns `None` when no rule matches.
pub fn ruleset_action(
    rules: &[PermissionRule],
    permission: &str,
    key: &str,
) -> Option<RuleAction> {
    rules
        .iter()
        .find(|rule| rule.permission == permission && WildMatch::new(&rule.pattern).matches(key))
        .map(|rule| rule.action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            PermissionRule::new("task", "pentest/*", RuleAction::Allow),
            PermissionRule::new("task", "*", RuleAction::Deny),
        ];
        assert_eq!(
            ruleset_action(&rules, "task", "pentest/recon"),
            Some(RuleAction::Allow)
        );
        assert_eq!(
            ruleset_action(&rules, "task", "general"),
            Some(RuleAction::Deny)
        );
        assert_eq!(ruleset_action(&rules, "bash", "ls"), None);
    }
}
