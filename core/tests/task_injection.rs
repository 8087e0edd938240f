#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::ScriptedTransport;
use common::test_core;
use common::text_response;
use redcell_core::error::RedcellErr;
use redcell_core::task::TaskRequest;
use redcell_protocol::protocol::PartKind;
use redcell_protocol::protocol::Role;
use redcell_protocol::protocol::RuleAction;

fn task(subagent_type: &str, prompt: &str) -> TaskRequest {
    TaskRequest {
        description: "recon the target".to_string(),
        prompt: prompt.to_string(),
        subagent_type: subagent_type.to_string(),
        task_id: None,
        command: None,
    }
}

/// The child's first user message carries the session-directory header, the
/// engagement state, and the caller prompt, in that order.
#[tokio::test]
async fn child_prompt_is_seeded_with_state() {
    let fixture = test_core();
    let core = Arc::clone(&fixture.core);
    let root = core.create_root_session("engagement");

    core.engagement()
        .update(
            &root.id,
            serde_yaml::from_str("target:\n  ip: 10.0.0.1\n").unwrap(),
        )
        .await
        .unwrap();

    let transport = ScriptedTransport::new(vec![text_response("recon complete")]);
    let output = core
        .dispatch_task(
            &transport,
            &root.id,
            task("pentest/recon", "scan"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(output.text, "recon complete");

    let child = core.sessions().get_session(&output.task_id).unwrap();
    assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
    assert_eq!(core.hierarchy().root_of(&child.id), root.id);

    let messages = core.sessions().messages(&child.id);
    let first = &messages[0];
    assert_eq!(first.role, Role::User);
    let parts = core.sessions().parts(&first.id);
    let PartKind::Text(text) = &parts[0].kind else {
        panic!("expected a text part");
    };

    let dir_at = text.text.find("Session Directory").unwrap();
    let ip_at = text.text.find("10.0.0.1").unwrap();
    let prompt_at = text.text.rfind("scan").unwrap();
    assert!(dir_at < ip_at && ip_at < prompt_at);
    assert!(
        text.text
            .contains(&core.engagement().session_dir(&root.id).display().to_string())
    );
}

/// Without recorded state, a pentest agent still gets the empty-state hint;
/// other agents get only the directory header.
#[tokio::test]
async fn empty_state_injection_depends_on_agent_family() {
    let fixture = test_core();
    let core = Arc::clone(&fixture.core);
    let root = core.create_root_session("engagement");

    let transport = ScriptedTransport::new(vec![
        text_response("done"),
        text_response("done"),
    ]);

    let pentest = core
        .dispatch_task(
            &transport,
            &root.id,
            task("pentest/recon", "scan"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let general = core
        .dispatch_task(
            &transport,
            &root.id,
            task("general", "summarize"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let first_text = |session_id: &str| {
        let messages = core.sessions().messages(session_id);
        let parts = core.sessions().parts(&messages[0].id);
        match &parts[0].kind {
            PartKind::Text(text) => text.text.clone(),
            _ => panic!("expected text part"),
        }
    };

    let pentest_prompt = first_text(&pentest.task_id);
    assert!(pentest_prompt.contains("No engagement state"));

    let general_prompt = first_text(&general.task_id);
    assert!(general_prompt.contains("Session Directory"));
    assert!(!general_prompt.contains("Engagement State"));
}

/// The child ruleset denies `task`, so a sub-agent cannot dispatch further
/// sub-agents, not even from the authorized family.
#[tokio::test]
async fn recursive_dispatch_is_denied() {
    let fixture = test_core();
    let core = Arc::clone(&fixture.core);
    let root = core.create_root_session("engagement");

    let transport = ScriptedTransport::new(vec![text_response("done")]);
    let child = core
        .dispatch_task(
            &transport,
            &root.id,
            task("pentest/recon", "scan"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let child_session = core.sessions().get_session(&child.task_id).unwrap();
    assert!(
        child_session
            .permission
            .iter()
            .any(|r| r.permission == "task" && r.action == RuleAction::Deny)
    );

    let nested = core
        .dispatch_task(
            &transport,
            &child.task_id,
            task("pentest/exploit", "go deeper"),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(nested, Err(RedcellErr::AgentDenied(_))));
}

/// Unknown agent types outside the authorized family are refused.
#[tokio::test]
async fn unknown_agent_type_is_refused() {
    let fixture = test_core();
    let core = Arc::clone(&fixture.core);
    let root = core.create_root_session("engagement");

    let transport = ScriptedTransport::new(vec![]);
    let result = core
        .dispatch_task(
            &transport,
            &root.id,
            task("made-up/agent", "??"),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(RedcellErr::AgentNotFound(_))));
}

/// A `task_id` pointing at an existing child resumes it instead of creating
/// a sibling.
#[tokio::test]
async fn task_id_resumes_the_same_child() {
    let fixture = test_core();
    let core = Arc::clone(&fixture.core);
    let root = core.create_root_session("engagement");

    let transport = ScriptedTransport::new(vec![
        text_response("first pass"),
        text_response("second pass"),
    ]);
    let first = core
        .dispatch_task(
            &transport,
            &root.id,
            task("pentest/recon", "scan"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut resume = task("pentest/recon", "dig into port 445");
    resume.task_id = Some(first.task_id.clone());
    let second = core
        .dispatch_task(&transport, &root.id, resume, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.task_id, second.task_id);
    assert_eq!(second.text, "second pass");
    // Two user messages, two assistant messages, one session.
    let messages = core.sessions().messages(&first.task_id);
    assert_eq!(messages.len(), 4);
}
