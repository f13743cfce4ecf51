//! Flow node graph - the persisted structural record of an execution
//!
//! Nodes are append-only and never mutated once written; the graph only
//! grows. Parent links form a DAG (not a tree) because parallel branches
//! merge at a join node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a flow node; dense, assigned in append order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Block construct a block-start node opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Retry,
    Parallel,
    Resource,
}

impl BlockKind {
    /// Function-style label, as surfaced by `current_executions`
    pub fn label(&self) -> &'static str {
        match self {
            BlockKind::Retry => "retry",
            BlockKind::Parallel => "parallel",
            BlockKind::Resource => "resource",
        }
    }
}

/// Immutable tag describing what a node represents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Root of the execution
    FlowStart,

    /// Terminal node; present once the execution has finished
    FlowEnd,

    /// A leaf step began; remains the branch head while the step runs
    StepStart { step: String },

    /// A leaf step finished
    StepEnd {
        step: String,
        start: NodeId,
        success: bool,
    },

    /// A retry/parallel/resource block was entered
    BlockStart { block: BlockKind },

    /// The matching block exit; for parallel this is the join
    BlockEnd { start: NodeId },

    /// Start of one branch of a parallel block
    BranchStart { branch: String, parallel: NodeId },
}

/// One record in the flow node graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: NodeId,
    /// Ordered parents; more than one only at a parallel join
    pub parents: Vec<NodeId>,
    pub kind: NodeKind,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only, write-once node store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    nodes: Vec<FlowNode>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node; the single mutation the graph supports
    pub fn append(&mut self, parents: Vec<NodeId>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(FlowNode {
            id,
            parents,
            kind,
            recorded_at: Utc::now(),
        });
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&FlowNode> {
        self.nodes.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.iter()
    }

    /// Discard nodes staged past `len`; used to roll back an unpersisted tick
    pub fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len);
    }

    pub fn into_nodes(self) -> Vec<FlowNode> {
        self.nodes
    }

    pub fn from_nodes(nodes: Vec<FlowNode>) -> Self {
        Self { nodes }
    }
}
