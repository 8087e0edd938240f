//! MCP tool registry and output store collaborators.
//!
//! Tools routed through an MCP bridge wrap their payload in an envelope with
//! a `raw_output` field. When such a result arrives the processor hands the
//! decoded payload to the output store, which may persist it externally and
//! give back a short summary to keep the conversation small.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::Result;

/// Source of truth for which tool names are MCP tools. Typically backed by
/// the MCP connection manager's live tool listing.
pub trait ToolRegistry: Send + Sync {
    fn mcp_tools(&self) -> Vec<String>;
}

/// A registry with no MCP tools at all.
#[derive(Debug, Default)]
pub struct EmptyToolRegistry;

impl ToolRegistry for EmptyToolRegistry {
    fn mcp_tools(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Fixed tool list, used in tests and for statically configured bridges.
#[derive(Debug, Default)]
pub struct StaticToolRegistry {
    tools: Vec<String>,
}

impl StaticToolRegistry {
    pub fn new(tools: Vec<String>) -> Self {
        Self { tools }
    }
}

impl ToolRegistry for StaticToolRegistry {
    fn mcp_tools(&self) -> Vec<String> {
        self.tools.clone()
    }
}

/// Lazily cached view over a [`ToolRegistry`]. The first lookup snapshots
/// the listing; `invalidate` drops the snapshot so the next lookup re-reads
/// it (called on configuration change).
pub struct McpToolCache {
    registry: Arc<dyn ToolRegistry>,
    cached: Mutex<Option<HashSet<String>>>,
}

impl McpToolCache {
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self {
        Self {
            registry,
            cached: Mutex::new(None),
        }
    }

    pub fn is_mcp_tool(&self, name: &str) -> bool {
        let mut cached = self.cached.lock().unwrap();
        let set = cached
            .get_or_insert_with(|| self.registry.mcp_tools().into_iter().collect());
        set.contains(name)
    }

    pub fn invalidate(&self) {
        *self.cached.lock().unwrap() = None;
    }
}

#[derive(Debug, Clone)]
pub struct StoreOutputRequest {
    pub session_id: String,
    pub tool: String,
    pub method: Option<String>,
    /// The decoded envelope as received from the tool.
    pub data: Value,
    /// The `raw_output` payload extracted from the envelope.
    pub raw_output: Value,
}

#[derive(Debug, Clone)]
pub struct StoredOutput {
    /// Replacement text for the tool output (a summary when stored).
    pub output: String,
    pub stored: bool,
    pub output_id: Option<String>,
}

pub trait OutputStore: Send + Sync {
    fn store(&self, request: StoreOutputRequest) -> Result<StoredOutput>;
}

/// Store nothing; tool outputs pass through untouched.
#[derive(Debug, Default)]
pub struct NoOutputStore;

impl OutputStore for NoOutputStore {
    fn store(&self, request: StoreOutputRequest) -> Result<StoredOutput> {
        Ok(StoredOutput {
            output: request.data.to_string(),
            stored: false,
            output_id: None,
        })
    }
}
