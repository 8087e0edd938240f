//! Workspace snapshot collaborator.
//!
//! The processor takes a snapshot handle at every `start-step` and asks for
//! the diff at `finish-step`; a non-empty diff becomes a `patch` part. The
//! actual tracking mechanism (git worktree, overlayfs, copy) is external.

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct SnapshotPatch {
    pub files: Vec<String>,
    pub hash: String,
}

impl SnapshotPatch {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

pub trait WorkspaceSnapshot: Send + Sync {
    /// Begin tracking; returns an opaque handle.
    fn track(&self) -> Result<String>;

    /// Diff the workspace against the state captured by `handle`.
    fn patch(&self, handle: &str) -> Result<SnapshotPatch>;
}

/// Snapshotting disabled: every step sees an empty diff.
#[derive(Debug, Default)]
pub struct NoSnapshot;

impl WorkspaceSnapshot for NoSnapshot {
    fn track(&self) -> Result<String> {
        Ok(String::new())
    }

    fn patch(&self, _handle: &str) -> Result<SnapshotPatch> {
        Ok(SnapshotPatch::default())
    }
}
