//! Per-query distributed context
//!
//! A [`Context`] is created once per query on every node and shared read-only
//! (behind an `Arc`) by all kernels of the local execution graph and by the
//! exchange listeners. Only the step counters mutate, and they are atomics.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

/// Distributed metadata for one query on one node
#[derive(Debug)]
pub struct Context {
    /// Number of nodes taking part in the query
    total_nodes: usize,
    /// Ordinal of the current node in `0..total_nodes`
    node_index: usize,
    /// Stable per-query token, used as the query id in logs
    context_token: u32,
    /// Per-query token that namespaces cross-node messages
    communication_token: String,
    /// Observability counters
    query_step: AtomicU32,
    query_substep: AtomicU32,
}

impl Context {
    /// Create a context with a fresh communication token
    pub fn new(total_nodes: usize, node_index: usize, context_token: u32) -> Self {
        ContextBuilder::new(context_token)
            .total_nodes(total_nodes)
            .node_index(node_index)
            .build()
    }

    /// Single-node context, mostly useful for local pipelines and tests
    pub fn local(context_token: u32) -> Self {
        Self::new(1, 0, context_token)
    }

    pub fn total_nodes(&self) -> usize {
        self.total_nodes
    }

    pub fn node_index(&self) -> usize {
        self.node_index
    }

    pub fn context_token(&self) -> u32 {
        self.context_token
    }

    pub fn communication_token(&self) -> &str {
        &self.communication_token
    }

    pub fn query_step(&self) -> u32 {
        self.query_step.load(Ordering::Relaxed)
    }

    pub fn query_substep(&self) -> u32 {
        self.query_substep.load(Ordering::Relaxed)
    }

    /// Advance to the next step, resetting the substep counter
    pub fn increment_query_step(&self) -> u32 {
        self.query_substep.store(0, Ordering::Relaxed);
        self.query_step.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn increment_query_substep(&self) -> u32 {
        self.query_substep.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of remote peers, i.e. senders a cross-node exchange waits on
    pub fn remote_nodes(&self) -> usize {
        self.total_nodes.saturating_sub(1)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "query-{} (node {}/{})",
            self.context_token, self.node_index, self.total_nodes
        )
    }
}

/// Builder for [`Context`]
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    total_nodes: usize,
    node_index: usize,
    context_token: u32,
    communication_token: Option<String>,
}

impl ContextBuilder {
    pub fn new(context_token: u32) -> Self {
        Self {
            total_nodes: 1,
            node_index: 0,
            context_token,
            communication_token: None,
        }
    }

    pub fn total_nodes(mut self, total_nodes: usize) -> Self {
        self.total_nodes = total_nodes.max(1);
        self
    }

    pub fn node_index(mut self, node_index: usize) -> Self {
        self.node_index = node_index;
        self
    }

    /// Use a fixed communication token; every node of a query must agree on it
    pub fn communication_token(mut self, token: impl Into<String>) -> Self {
        self.communication_token = Some(token.into());
        self
    }

    pub fn build(self) -> Context {
        let communication_token = self
            .communication_token
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        Context {
            total_nodes: self.total_nodes,
            node_index: self.node_index,
            context_token: self.context_token,
            communication_token,
            query_step: AtomicU32::new(0),
            query_substep: AtomicU32::new(0),
        }
    }
}
