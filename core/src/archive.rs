//! Engagement archival.
//!
//! Mirrors a tree's live state into `<base>/<rootID>/`: a `session.json`
//! metadata snapshot, the timestamp-sorted `trajectory.jsonl`, a copy of
//! `state.yaml`, and the `findings/` and `artifacts/` directories. Every
//! file is composed in memory and swapped in with a rename so concurrent
//! children can never leave a half-written archive behind; a per-root mutex
//! serializes whole archive passes.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::engagement::EngagementStore;
use crate::engagement::is_empty_document;
use crate::error::RedcellErr;
use crate::error::Result;
use crate::hierarchy::HierarchyRegistry;
use crate::session::SessionStore;
use crate::trajectory;

#[derive(Serialize)]
struct SessionMeta {
    id: String,
    /// Random correlation id stamped at archival time.
    archive_id: Uuid,
    title: String,
    created_at: DateTime<Utc>,
    archived_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    total_agents: usize,
    agent_names: Vec<String>,
    tool_calls: usize,
}

pub struct ArchiveWriter {
    base: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArchiveWriter {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn engagement_dir(&self, root_id: &str) -> PathBuf {
        self.base.join(root_id)
    }

    /// Write (or rewrite) the archive for the tree rooted at `root_id`.
    pub async fn archive_engagement(
        &self,
        store: &SessionStore,
        hierarchy: &HierarchyRegistry,
        engagement: &EngagementStore,
        root_id: &str,
    ) -> Result<PathBuf> {
        let lock = self.write_lock(root_id);
        let _guard = lock.lock().await;

        let session = store
            .get_session(root_id)
            .ok_or_else(|| RedcellErr::SessionNotFound(root_id.to_string()))?;
        let log = trajectory::from_engagement(store, hierarchy, root_id);

        let dir = self.engagement_dir(root_id);
        tokio::fs::create_dir_all(dir.join("findings")).await?;
        tokio::fs::create_dir_all(dir.join("artifacts")).await?;

        let meta = SessionMeta {
            id: session.id.clone(),
            archive_id: Uuid::new_v4(),
            title: session.title.clone(),
            created_at: session.created_at,
            archived_at: Utc::now(),
            model: store
                .messages(root_id)
                .iter()
                .find_map(|m| m.model_id.clone()),
            total_agents: log.summary.total_agents,
            agent_names: log.summary.agent_names.clone(),
            tool_calls: log.summary.tool_calls,
        };
        write_atomic(
            &dir.join("session.json"),
            serde_json::to_string_pretty(&meta)?.as_bytes(),
        )
        .await?;

        let mut jsonl = String::new();
        for entry in &log.entries {
            jsonl.push_str(&serde_json::to_string(entry)?);
            jsonl.push('\n');
        }
        write_atomic(&dir.join("trajectory.jsonl"), jsonl.as_bytes()).await?;

        let state = engagement.read(root_id).await?;
        if !is_empty_document(&state) {
            write_atomic(
                &dir.join("state.yaml"),
                serde_yaml::to_string(&state)?.as_bytes(),
            )
            .await?;
        }

        debug!(root = root_id, dir = %dir.display(), "engagement archived");
        Ok(dir)
    }

    fn write_lock(&self, root: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(root.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// Replace, never append-then-truncate: readers either see the old file or
/// the new one.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
