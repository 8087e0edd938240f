#![allow(clippy::unwrap_used)]

mod common;

use common::test_core;
use redcell_protocol::protocol::PartKind;
use redcell_protocol::protocol::Phase;
use redcell_protocol::protocol::Role;
use redcell_protocol::protocol::TvarPart;

/// Archival mirrors metadata, trajectory and state into the sessions base.
#[tokio::test]
async fn archive_writes_the_full_layout() {
    let fixture = test_core();
    let core = &fixture.core;

    let root = core.create_root_session("engagement");
    let child = core.create_session(
        "@pentest/recon subagent: scan",
        Some(root.id.clone()),
        vec![],
    );
    core.hierarchy().register(&child.id, &root.id);

    core.engagement()
        .update(
            &root.id,
            serde_yaml::from_str("target:\n  ip: 10.0.0.1\n").unwrap(),
        )
        .await
        .unwrap();

    let message = core
        .sessions()
        .append_message(&child.id, Role::Assistant, None, None)
        .unwrap();
    core.sessions()
        .add_part(
            &child.id,
            &message.id,
            PartKind::Tvar(TvarPart {
                thought: "scan the subnet".to_string(),
                verify: "nmap available".to_string(),
                action: None,
                result: None,
                phase: Some(Phase::Reconnaissance),
                tool_call_id: None,
            }),
        )
        .unwrap();

    let dir = core.archive_engagement(&root.id).await.unwrap();

    let meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join("session.json")).unwrap())
            .unwrap();
    assert_eq!(meta["id"], serde_json::json!(root.id));
    assert_eq!(meta["total_agents"], serde_json::json!(2));

    let jsonl = std::fs::read_to_string(dir.join("trajectory.jsonl")).unwrap();
    let lines: Vec<&str> = jsonl.lines().collect();
    assert_eq!(lines.len(), 1);
    let entry: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(entry["agent_name"], serde_json::json!("pentest/recon"));
    assert_eq!(entry["phase"], serde_json::json!("reconnaissance"));

    let state = std::fs::read_to_string(dir.join("state.yaml")).unwrap();
    assert!(state.contains("10.0.0.1"));
    assert!(dir.join("findings").is_dir());
    assert!(dir.join("artifacts").is_dir());

    // A second pass replaces the archive in place.
    core.archive_engagement(&root.id).await.unwrap();
    assert!(dir.join("trajectory.jsonl").is_file());
}

/// Deleting a root releases its registrations and rejects its pending
/// permissions; deleting a child only unregisters the child.
#[tokio::test]
async fn deletion_releases_registrations() {
    let fixture = test_core();
    let core = &fixture.core;

    let root = core.create_root_session("engagement");
    let child = core.create_session("child", Some(root.id.clone()), vec![]);
    core.hierarchy().register(&child.id, &root.id);

    core.delete_session(&child.id);
    assert_eq!(core.hierarchy().root_of(&child.id), child.id);
    assert!(core.sessions().get_session(&child.id).is_none());
    assert!(core.sessions().get_session(&root.id).is_some());

    core.delete_session(&root.id);
    assert!(core.sessions().get_session(&root.id).is_none());
}
