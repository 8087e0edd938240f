#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use common::test_core;
use common::wait_for;
use redcell_core::permission::AskRequest;
use redcell_protocol::protocol::PermissionResponse;

fn ask(kind: &str, pattern: Option<Vec<&str>>, session_id: &str) -> AskRequest {
    AskRequest {
        kind: kind.to_string(),
        title: format!("run {kind}"),
        pattern: pattern.map(|p| p.into_iter().map(str::to_string).collect()),
        always: None,
        session_id: session_id.to_string(),
        message_id: "msg_test".to_string(),
        call_id: None,
        metadata: Value::Null,
    }
}

/// A permission demanded in a child surfaces under the root, and an
/// `always` reply covers later identical asks without going pending.
#[tokio::test]
async fn bubbled_permission_resolves_at_the_root() {
    let fixture = test_core();
    let core = &fixture.core;

    let root = core.create_root_session("engagement");
    let child = core.create_session("@pentest/recon subagent: scan", Some(root.id.clone()), vec![]);
    core.hierarchy().register(&child.id, &root.id);

    let permissions = Arc::clone(core.permissions());
    let child_id = child.id.clone();
    let pending_ask = tokio::spawn({
        let permissions = Arc::clone(&permissions);
        async move {
            permissions
                .ask(
                    ask("bash", Some(vec!["rm -rf *"]), &child_id),
                    &CancellationToken::new(),
                )
                .await
        }
    });

    let root_id = root.id.clone();
    wait_for(
        || !permissions.pending_requests(&root_id).is_empty(),
        "pending request under root",
    )
    .await;

    let pending = permissions.pending_requests(&root.id);
    assert_eq!(pending.len(), 1);
    // Bubbled: the stored request is keyed by the root, not the child.
    assert_eq!(pending[0].session_id, root.id);
    assert_eq!(pending[0].keys(), vec!["rm -rf *".to_string()]);

    permissions.respond(&root.id, &pending[0].id, PermissionResponse::Always);
    pending_ask.await.unwrap().unwrap();

    // Covered by the approval cache now: resolves without a pending entry.
    permissions
        .ask(
            ask("bash", Some(vec!["rm -rf *"]), &child.id),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(permissions.pending_requests(&root.id).is_empty());
}

/// Enabling ultrasploit anywhere in the tree flips the whole tree.
#[tokio::test]
async fn ultrasploit_is_tree_wide() {
    let fixture = test_core();
    let core = &fixture.core;

    let root = core.create_root_session("engagement");
    let child = core.create_session("child", Some(root.id.clone()), vec![]);
    let grandchild = core.create_session("grandchild", Some(child.id.clone()), vec![]);
    core.hierarchy().register(&child.id, &root.id);
    core.hierarchy().register(&grandchild.id, &root.id);

    let permissions = core.permissions();
    permissions.enable_ultrasploit(&grandchild.id);

    assert!(permissions.is_ultrasploit(&root.id));
    assert!(permissions.is_ultrasploit(&child.id));
    assert!(permissions.is_ultrasploit(&grandchild.id));

    // Resolves immediately, nothing goes pending.
    permissions
        .ask(ask("bash", None, &child.id), &CancellationToken::new())
        .await
        .unwrap();
    assert!(permissions.pending_requests(&root.id).is_empty());

    permissions.disable_ultrasploit(&child.id);
    assert!(!permissions.is_ultrasploit(&grandchild.id));
}

/// An `always` reply re-resolves every pending request its patterns cover.
#[tokio::test]
async fn always_reply_coalesces_pending_requests() {
    let fixture = test_core();
    let core = &fixture.core;
    let root = core.create_root_session("engagement");

    let permissions = Arc::clone(core.permissions());
    let mut asks = Vec::new();
    for pattern in ["nmap *", "nmap *", "curl *"] {
        let permissions = Arc::clone(&permissions);
        let root_id = root.id.clone();
        asks.push((
            pattern,
            tokio::spawn(async move {
                permissions
                    .ask(
                        ask("bash", Some(vec![pattern]), &root_id),
                        &CancellationToken::new(),
                    )
                    .await
            }),
        ));
    }

    let root_id = root.id.clone();
    wait_for(
        || permissions.pending_requests(&root_id).len() == 3,
        "three pending requests",
    )
    .await;

    // Approving one `nmap *` request for good also resolves the other
    // pending `nmap *` request; `curl *` stays pending.
    let target = permissions
        .pending_requests(&root.id)
        .into_iter()
        .find(|r| r.keys() == vec!["nmap *".to_string()])
        .unwrap();
    permissions.respond(&root.id, &target.id, PermissionResponse::Always);

    for (pattern, handle) in asks {
        if pattern == "nmap *" {
            handle.await.unwrap().unwrap();
        } else {
            let remaining = permissions.pending_requests(&root.id);
            assert_eq!(remaining.len(), 1);
            assert_eq!(remaining[0].keys(), vec!["curl *".to_string()]);
            handle.abort();
        }
    }
}

/// Rejecting fails the awaiting ask with a Rejected error that carries the
/// root session id.
#[tokio::test]
async fn reject_fails_the_ask() {
    let fixture = test_core();
    let core = &fixture.core;
    let root = core.create_root_session("engagement");
    let child = core.create_session("child", Some(root.id.clone()), vec![]);
    core.hierarchy().register(&child.id, &root.id);

    let permissions = Arc::clone(core.permissions());
    let child_id = child.id.clone();
    let pending_ask = tokio::spawn({
        let permissions = Arc::clone(&permissions);
        async move {
            permissions
                .ask(ask("bash", None, &child_id), &CancellationToken::new())
                .await
        }
    });

    let root_id = root.id.clone();
    wait_for(
        || !permissions.pending_requests(&root_id).is_empty(),
        "pending request",
    )
    .await;
    let pending = permissions.pending_requests(&root.id);
    permissions.respond(&root.id, &pending[0].id, PermissionResponse::Reject);

    let err = pending_ask.await.unwrap().unwrap_err();
    match err {
        redcell_core::error::RedcellErr::Rejected { session_id, .. } => {
            assert_eq!(session_id, root.id);
        }
        other => panic!("expected Rejected, got {other}"),
    }
}

/// Aborting an awaiting ask drops the pending entry; a later respond for
/// that id is a no-op.
#[tokio::test]
async fn aborted_ask_is_released() {
    let fixture = test_core();
    let core = &fixture.core;
    let root = core.create_root_session("engagement");

    let permissions = Arc::clone(core.permissions());
    let cancel = CancellationToken::new();
    let root_id = root.id.clone();
    let pending_ask = tokio::spawn({
        let permissions = Arc::clone(&permissions);
        let cancel = cancel.clone();
        async move {
            permissions
                .ask(ask("bash", None, &root_id), &cancel)
                .await
        }
    });

    let root_id = root.id.clone();
    wait_for(
        || !permissions.pending_requests(&root_id).is_empty(),
        "pending request",
    )
    .await;
    let id = permissions.pending_requests(&root.id)[0].id.clone();

    cancel.cancel();
    assert!(pending_ask.await.unwrap().unwrap_err().is_rejected());
    assert!(permissions.pending_requests(&root.id).is_empty());

    // No awaiter left; this must not panic or resurrect anything.
    permissions.respond(&root.id, &id, PermissionResponse::Once);
    assert!(permissions.pending_requests(&root.id).is_empty());
}
