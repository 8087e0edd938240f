//! Per-engagement shared state.
//!
//! Every root session owns one directory holding `state.yaml`, a `findings/`
//! subdirectory and an `artifacts/` subdirectory. The document is a
//! permissive YAML mapping merged with domain-aware rules so that parallel
//! sub-agents can all contribute what they discover without clobbering each
//! other. Updates within one tree serialize around the file; the document is
//! composed in memory and swapped in atomically so no reader ever observes
//! partial YAML.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde_yaml::Mapping;
use serde_yaml::Value;
use tracing::debug;

use crate::error::Result;
use crate::hierarchy::HierarchyRegistry;

const STATE_FILE: &str = "state.yaml";

pub struct EngagementStore {
    base: PathBuf,
    prefix: String,
    hierarchy: Arc<HierarchyRegistry>,
    /// One write lock per root session; finer locking is unnecessary given
    /// update volumes.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EngagementStore {
    pub fn new(base: PathBuf, prefix: String, hierarchy: Arc<HierarchyRegistry>) -> Self {
        Self {
            base,
            prefix,
            hierarchy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The engagement directory for the tree owning `session_id`.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        let root = self.hierarchy.root_of(session_id);
        self.base.join(format!("{}-session-{root}", self.prefix))
    }

    /// Create the directory layout: `state.yaml`'s parent, `findings/`,
    /// `artifacts/screenshots/` and `artifacts/loot/`.
    pub async fn ensure_layout(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(dir.join("findings")).await?;
        tokio::fs::create_dir_all(dir.join("artifacts").join("screenshots")).await?;
        tokio::fs::create_dir_all(dir.join("artifacts").join("loot")).await?;
        Ok(dir)
    }

    /// Read-merge-write. Returns the merged document.
    pub async fn update(&self, session_id: &str, partial: Value) -> Result<Value> {
        let root = self.hierarchy.root_of(session_id);
        let lock = self.write_lock(&root);
        let _guard = lock.lock().await;

        self.ensure_layout(session_id).await?;
        let dir = self.session_dir(session_id);
        let existing = self.read_unlocked(&dir).await?;
        let merged = merge_state(existing, partial);

        let yaml = serde_yaml::to_string(&merged)?;
        let path = dir.join(STATE_FILE);
        let tmp = dir.join(format!("{STATE_FILE}.tmp"));
        tokio::fs::write(&tmp, yaml.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(root, path = %path.display(), "engagement state updated");
        Ok(merged)
    }

    /// The parsed document, or an empty mapping when no state exists yet.
    pub async fn read(&self, session_id: &str) -> Result<Value> {
        let dir = self.session_dir(session_id);
        self.read_unlocked(&dir).await
    }

    /// Human-readable block used to seed a sub-agent: the directory path
    /// plus the YAML dump. `None` when nothing has been recorded yet.
    pub async fn format_for_injection(&self, session_id: &str) -> Result<Option<String>> {
        let state = self.read(session_id).await?;
        if is_empty_document(&state) {
            return Ok(None);
        }
        let dir = self.session_dir(session_id);
        let yaml = serde_yaml::to_string(&state)?;
        Ok(Some(format!(
            "## Engagement State\n\nState file: {}/{STATE_FILE}\n\n{yaml}",
            dir.display()
        )))
    }

    fn write_lock(&self, root: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(root.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    async fn read_unlocked(&self, dir: &std::path::Path) -> Result<Value> {
        match tokio::fs::read_to_string(dir.join(STATE_FILE)).await {
            Ok(text) => match serde_yaml::from_str::<Value>(&text) {
                Ok(Value::Null) => Ok(Value::Mapping(Mapping::new())),
                Ok(value) => Ok(value),
                Err(err) => {
                    // A corrupt document is tolerated: log and start over
                    // rather than wedging every agent in the tree.
                    debug!(error = %err, "unparseable state.yaml, treating as empty");
                    Ok(Value::Mapping(Mapping::new()))
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Value::Mapping(Mapping::new())),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn is_empty_document(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Mapping(map) => map.is_empty(),
        _ => false,
    }
}

/// Merge `incoming` into `existing`.
///
/// Scalars are last-writer-wins; `target` shallow-merges; `ports`,
/// `credentials` and `sessions` deduplicate under their identity fields with
/// field-wise incoming-wins merge; `flags` is a set union; every other array
/// appends entries not already present, which keeps the whole merge
/// idempotent. Keys the schema does not know are preserved verbatim.
pub fn merge_state(existing: Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::Mapping(mut base), Value::Mapping(update)) => {
            for (key, value) in update {
                let name = key.as_str().unwrap_or_default().to_string();
                let merged = match base.remove(&key) {
                    None => value,
                    Some(current) => merge_field(&name, current, value),
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        // A non-mapping document on either side is a scalar from the
        // merge's point of view: the incoming value wins.
        (_, incoming) => incoming,
    }
}

fn merge_field(name: &str, current: Value, incoming: Value) -> Value {
    match name {
        "target" => shallow_merge(current, incoming),
        "ports" => merge_keyed(current, incoming, &["port", "protocol"]),
        "credentials" => merge_keyed(current, incoming, &["username", "service"]),
        "sessions" => merge_keyed(current, incoming, &["id"]),
        "flags" => union(current, incoming),
        _ => match (current, incoming) {
            (Value::Sequence(seq), Value::Sequence(new)) => {
                Value::Sequence(append_missing(seq, new))
            }
            (_, incoming) => incoming,
        },
    }
}

fn shallow_merge(current: Value, incoming: Value) -> Value {
    match (current, incoming) {
        (Value::Mapping(mut base), Value::Mapping(update)) => {
            for (key, value) in update {
                base.insert(key, value);
            }
            Value::Mapping(base)
        }
        (_, incoming) => incoming,
    }
}

fn merge_keyed(current: Value, incoming: Value, identity: &[&str]) -> Value {
    match (current, incoming) {
        (Value::Sequence(mut base), Value::Sequence(update)) => {
            for item in update {
                let matched = identity_of(&item, identity).and_then(|id| {
                    base.iter_mut().find(|existing| {
                        identity_of(existing, identity).as_ref() == Some(&id)
                    })
                });
                match matched {
                    Some(existing) => {
                        let merged = shallow_merge(existing.clone(), item);
                        *existing = merged;
                    }
                    None => {
                        if !base.contains(&item) {
                            base.push(item);
                        }
                    }
                }
            }
            Value::Sequence(base)
        }
        (_, incoming) => incoming,
    }
}

fn identity_of(item: &Value, identity: &[&str]) -> Option<Vec<Value>> {
    let Value::Mapping(map) = item else {
        return None;
    };
    let fields: Vec<Option<Value>> = identity
        .iter()
        .map(|field| map.get(&Value::String((*field).to_string())).cloned())
        .collect();
    // An item missing every identity field has no identity; it appends.
    fields.iter().any(|v| v.is_some()).then(|| {
        fields
            .into_iter()
            .map(|v| v.unwrap_or(Value::Null))
            .collect()
    })
}

fn union(current: Value, incoming: Value) -> Value {
    match (current, incoming) {
        (Value::Sequence(base), Value::Sequence(new)) => {
            Value::Sequence(append_missing(base, new))
        }
        (_, incoming) => incoming,
    }
}

fn append_missing(mut base: Vec<Value>, new: Vec<Value>) -> Vec<Value> {
    for item in new {
        if !base.contains(&item) {
            base.push(item);
        }
    }
    base
}
