//! Root-scoped permission engine.
//!
//! Every request is keyed by the root of the requesting session's tree, so
//! a permission demanded deep in the tree bubbles up to the root
//! user-interface. Approvals are cached per root as wildcard patterns, and
//! an `always` reply coalesces any still-pending requests its patterns now
//! cover.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use wildmatch::WildMatch;

use redcell_protocol::protocol::EventMsg;
use redcell_protocol::protocol::PermissionRequest;
use redcell_protocol::protocol::PermissionResponse;
use redcell_protocol::protocol::PermissionTime;

use crate::error::RedcellErr;
use crate::error::Result;
use crate::hierarchy::HierarchyRegistry;
use crate::ids::IdGenerator;
use crate::ids::IdKind;
use crate::policy::AskInfo;
use crate::policy::PermissionPolicy;
use crate::policy::PolicyDecision;
use crate::redcell::EventBus;

/// Parameters of one `ask`. The session id may be any session in a tree;
/// the engine resolves it to the root before doing anything else.
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub kind: String,
    pub title: String,
    pub pattern: Option<Vec<String>>,
    /// Keys recorded on an `always` reply when they differ from the match
    /// patterns (the doom-loop guard uses this).
    pub always: Option<Vec<String>>,
    pub session_id: String,
    pub message_id: String,
    pub call_id: Option<String>,
    pub metadata: Value,
}

enum Outcome {
    Granted,
    Rejected,
}

struct PendingEntry {
    request: PermissionRequest,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct RootState {
    /// Pending requests in creation order (ids are monotonic).
    pending: BTreeMap<String, PendingEntry>,
    /// Wildcard patterns approved for the rest of the engagement.
    approved: HashSet<String>,
    ultrasploit: bool,
}

pub struct PermissionEngine {
    hierarchy: Arc<HierarchyRegistry>,
    ids: Arc<IdGenerator>,
    policy: Arc<dyn PermissionPolicy>,
    bus: EventBus,
    state: Mutex<HashMap<String, RootState>>,
}

impl PermissionEngine {
    pub fn new(
        hierarchy: Arc<HierarchyRegistry>,
        ids: Arc<IdGenerator>,
        policy: Arc<dyn PermissionPolicy>,
        bus: EventBus,
    ) -> Self {
        Self {
            hierarchy,
            ids,
            policy,
            bus,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Request authorization, suspending until a matching [`respond`] or
    /// engine teardown. Resolves immediately when ultrasploit mode is on
    /// (unless the policy hook denies: deny wins), when every key is
    /// covered by the approval cache, or when the hook decides outright.
    ///
    /// Cancelling `cancel` fails the ask with *Rejected* and drops the
    /// pending entry; a later `respond` for it is a no-op.
    pub async fn ask(&self, req: AskRequest, cancel: &CancellationToken) -> Result<()> {
        let root = self.hierarchy.root_of(&req.session_id);
        let keys = match &req.pattern {
            Some(patterns) if !patterns.is_empty() => patterns.clone(),
            _ => vec![req.kind.clone()],
        };

        let info = AskInfo {
            root_session_id: &root,
            kind: &req.kind,
            keys: &keys,
            call_id: req.call_id.as_deref(),
            title: &req.title,
            metadata: &req.metadata,
        };

        let ultrasploit = {
            let state = self.state.lock().unwrap();
            state.get(&root).map(|s| s.ultrasploit).unwrap_or(false)
        };
        if ultrasploit {
            // Auto-approve everything, except an explicit policy deny.
            if self.policy.on_permission_ask(&info) == PolicyDecision::Deny {
                return Err(self.rejected(&root, "", &req, "denied by policy"));
            }
            debug!(root, kind = req.kind, "permission auto-approved (ultrasploit)");
            return Ok(());
        }

        {
            let state = self.state.lock().unwrap();
            if let Some(root_state) = state.get(&root)
                && keys.iter().all(|key| covered(&root_state.approved, key))
            {
                debug!(root, kind = req.kind, "permission auto-approved (cached)");
                return Ok(());
            }
        }

        match self.policy.on_permission_ask(&info) {
            PolicyDecision::Allow => return Ok(()),
            PolicyDecision::Deny => {
                return Err(self.rejected(&root, "", &req, "denied by policy"));
            }
            PolicyDecision::Ask => {}
        }

        let id = self.ids.next(IdKind::Permission);
        let request = PermissionRequest {
            id: id.clone(),
            kind: req.kind.clone(),
            pattern: req.pattern.clone(),
            always: req.always.clone(),
            session_id: root.clone(),
            message_id: req.message_id.clone(),
            call_id: req.call_id.clone(),
            title: req.title.clone(),
            metadata: req.metadata.clone(),
            time: PermissionTime { created: Utc::now() },
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            let root_state = state.entry(root.clone()).or_default();
            root_state.pending.insert(
                id.clone(),
                PendingEntry {
                    request: request.clone(),
                    tx,
                },
            );
        }
        self.bus.publish(EventMsg::PermissionUpdated { request });

        tokio::select! {
            _ = cancel.cancelled() => {
                let mut state = self.state.lock().unwrap();
                if let Some(root_state) = state.get_mut(&root) {
                    root_state.pending.remove(&id);
                }
                Err(self.rejected(&root, &id, &req, "aborted"))
            }
            outcome = rx => match outcome {
                Ok(Outcome::Granted) => Ok(()),
                Ok(Outcome::Rejected) | Err(_) => {
                    Err(self.rejected(&root, &id, &req, "rejected"))
                }
            }
        }
    }

    /// Resolve a pending request. `session_id` is used exactly as provided -
    /// it is already the root id carried by the request. Unknown ids are a
    /// no-op (the awaiter may have been aborted in the meantime).
    pub fn respond(&self, session_id: &str, permission_id: &str, response: PermissionResponse) {
        let entry = {
            let mut state = self.state.lock().unwrap();
            state
                .get_mut(session_id)
                .and_then(|root_state| root_state.pending.remove(permission_id))
        };
        let Some(entry) = entry else {
            debug!(session_id, permission_id, "respond for unknown permission");
            return;
        };

        self.bus.publish(EventMsg::PermissionReplied {
            session_id: session_id.to_string(),
            permission_id: permission_id.to_string(),
            response,
        });

        match response {
            PermissionResponse::Reject => {
                let _ = entry.tx.send(Outcome::Rejected);
            }
            PermissionResponse::Once => {
                let _ = entry.tx.send(Outcome::Granted);
            }
            PermissionResponse::Always => {
                let _ = entry.tx.send(Outcome::Granted);
                self.record_and_coalesce(session_id, entry.request.always_keys());
            }
        }
    }

    /// Record approval patterns, then keep resolving any pending request
    /// whose keys are now fully covered until a fixpoint is reached.
    fn record_and_coalesce(&self, session_id: &str, mut patterns: Vec<String>) {
        loop {
            let resolved = {
                let mut state = self.state.lock().unwrap();
                let root_state = state.entry(session_id.to_string()).or_default();
                root_state.approved.extend(patterns.drain(..));

                let covered_id = root_state.pending.iter().find_map(|(id, entry)| {
                    let keys = entry.request.keys();
                    keys.iter()
                        .all(|key| covered(&root_state.approved, key))
                        .then(|| id.clone())
                });
                covered_id.and_then(|id| {
                    root_state
                        .pending
                        .remove(&id)
                        .map(|entry| (id, entry))
                })
            };

            let Some((id, entry)) = resolved else { break };
            self.bus.publish(EventMsg::PermissionReplied {
                session_id: session_id.to_string(),
                permission_id: id,
                response: PermissionResponse::Always,
            });
            let _ = entry.tx.send(Outcome::Granted);
            patterns = entry.request.always_keys();
        }
    }

    /// Pending requests for the tree owning `id`, in creation order.
    pub fn pending_requests(&self, id: &str) -> Vec<PermissionRequest> {
        let root = self.hierarchy.root_of(id);
        let state = self.state.lock().unwrap();
        state
            .get(&root)
            .map(|root_state| {
                root_state
                    .pending
                    .values()
                    .map(|entry| entry.request.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn enable_ultrasploit(&self, id: &str) {
        let root = self.hierarchy.root_of(id);
        let mut state = self.state.lock().unwrap();
        state.entry(root).or_default().ultrasploit = true;
    }

    pub fn disable_ultrasploit(&self, id: &str) {
        let root = self.hierarchy.root_of(id);
        let mut state = self.state.lock().unwrap();
        if let Some(root_state) = state.get_mut(&root) {
            root_state.ultrasploit = false;
        }
    }

    pub fn is_ultrasploit(&self, id: &str) -> bool {
        let root = self.hierarchy.root_of(id);
        let state = self.state.lock().unwrap();
        state.get(&root).map(|s| s.ultrasploit).unwrap_or(false)
    }

    /// Fail every pending request of one root with *Rejected*. Called on
    /// root-session deletion; the approval cache and ultrasploit flag stay
    /// until [`clear_root`](Self::clear_root).
    pub fn reject_all_pending(&self, id: &str) {
        let root = self.hierarchy.root_of(id);
        let drained = {
            let mut state = self.state.lock().unwrap();
            state
                .get_mut(&root)
                .map(|root_state| std::mem::take(&mut root_state.pending))
                .unwrap_or_default()
        };
        for (permission_id, entry) in drained {
            self.bus.publish(EventMsg::PermissionReplied {
                session_id: root.clone(),
                permission_id,
                response: PermissionResponse::Reject,
            });
            let _ = entry.tx.send(Outcome::Rejected);
        }
    }

    /// Explicit cleanup: drop everything recorded for a tree, including the
    /// ultrasploit flag and the approval cache.
    pub fn clear_root(&self, id: &str) {
        let root = self.hierarchy.root_of(id);
        self.reject_all_pending(&root);
        let mut state = self.state.lock().unwrap();
        state.remove(&root);
    }

    /// Engine shutdown: every outstanding request everywhere is rejected.
    pub fn teardown(&self) {
        let roots: Vec<String> = {
            let state = self.state.lock().unwrap();
            state.keys().cloned().collect()
        };
        for root in roots {
            self.reject_all_pending(&root);
        }
    }

    fn rejected(
        &self,
        root: &str,
        permission_id: &str,
        req: &AskRequest,
        reason: &str,
    ) -> RedcellErr {
        warn!(root, kind = req.kind, reason, "permission rejected");
        RedcellErr::Rejected {
            session_id: root.to_string(),
            permission_id: permission_id.to_string(),
            call_id: req.call_id.clone(),
            metadata: Some(req.metadata.clone()),
            reason: reason.to_string(),
        }
    }
}

impl Drop for PermissionEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// `*` matches any run of characters; everything else is literal. `/` has no
/// special meaning, so `pentest/*` covers the whole family.
fn covered(approved: &HashSet<String>, key: &str) -> bool {
    approved
        .iter()
        .any(|pattern| WildMatch::new(pattern).matches(key))
}
