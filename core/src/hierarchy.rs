// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Mutex;

/// Process-local mapping from any session id to the root of its tree.
///
/// Registration happens at sub-agent creation and removal only on explicit
/// session deletion; multiple dispatchers may register children in parallel.
/// There is no persistence: a restarted process starts with an empty map.
#[derive(Debug, Default)]
pub struct HierarchyRegistry {
    roots: Mutex<HashMap<String, String>>,
}

impl HierarchyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `child -> root`. Idempotent.
    pub fn register(&self, child: &str, root: &str) {
        let mut roots = self.roots.lock().unwrap();
        roots.insert(child.to_string(), root.to_string());
    }

    /// The registered root of `id`, or `id` itself when unregistered.
    pub fn root_of(&self, id: &str) -> String {
        let roots = self.roots.lock().unwrap();
        roots.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    /// All registered ids under `root`, excluding `root` itself.
    pub fn children(&self, root: &str) -> Vec<String> {
        let roots = self.roots.lock().unwrap();
        let mut children: Vec<String> = roots
            .iter()
            .filter(|(child, r)| r.as_str() == root && child.as_str() != root)
            .map(|(child, _)| child.clone())
            .collect();
        children.sort();
        children
    }

    pub fn unregister(&self, id: &str) {
        let mut roots = self.roots.lock().unwrap();
        roots.remove(id);
    }

    /// Remove `root` and every registration pointing at it.
    pub fn unregister_tree(&self, root: &str) {
        let mut roots = self.roots.lock().unwrap();
        roots.retain(|child, r| child != root && r != root);
    }
}
