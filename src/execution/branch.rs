//! Branch state - the persisted continuation of one thread of control
//!
//! A branch's frame stack is the explicit, serializable record of where the
//! branch is inside nested blocks: each entered block pushes a frame carrying
//! the statements remaining after the current position. The stack replaces
//! host-level stack unwinding; resuming is just re-reading the frames.

use crate::core::graph::NodeId;
use crate::core::script::{Statement, StepCall};
use crate::pickle::{LiveObject, PickleDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

pub type BranchId = u32;
pub type JoinId = u32;

/// One named value in a branch's context
#[derive(Debug, Clone)]
pub enum Binding {
    /// Plain data
    Value(serde_json::Value),
    /// A live, non-serializable object
    Live(Arc<dyn LiveObject>),
    /// Restored from a checkpoint, not yet rehydrated
    Pickled(PickleDescriptor),
}

impl Binding {
    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Binding::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_pickled(&self) -> bool {
        matches!(self, Binding::Pickled(_))
    }
}

/// What kind of block a frame represents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameKind {
    /// The script's top-level sequence
    Root,

    /// Inside a retry block; `body` is kept for re-entry
    Retry { attempts_left: u32, body: Vec<Statement> },

    /// Inside a resource block; the handle lives in the bindings under `key`
    Resource { resource: String, key: String },

    /// One branch of a parallel block
    Branch { join: JoinId, name: String },
}

/// One entered block on a branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    /// The block's enter node (the flow-start node for the root frame)
    pub enter: NodeId,
    /// Statements still to run in this block, front first
    pub remaining: VecDeque<Statement>,
}

impl Frame {
    pub fn new(kind: FrameKind, enter: NodeId, body: Vec<Statement>) -> Self {
        Self {
            kind,
            enter,
            remaining: body.into(),
        }
    }
}

/// Outcome of a completed block, applied to the branch that entered it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockResult {
    Success,
    Failed {
        failure: crate::core::state::StepFailure,
        /// Branch the failure originated on
        #[serde(default)]
        origin: String,
    },
}

/// The work a branch is currently suspended on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CurrentWork {
    /// A dispatched leaf step; the head is its start node
    Step { call: StepCall },
    /// A pending resource acquisition; the head is the block's enter node
    Acquire { resource: String, key: String },
}

/// One live thread of control
#[derive(Debug, Clone)]
pub struct Branch {
    pub id: BranchId,
    /// "main", or the parallel branch name path ("a", "a/inner")
    pub name: String,
    /// This branch's active head in the flow node graph
    pub head: NodeId,
    /// Outermost first
    pub frames: Vec<Frame>,
    pub bindings: BTreeMap<String, Binding>,
    pub current: Option<CurrentWork>,
    /// Set when a fail-fast sibling failure asked this branch to stop
    pub cancelled: bool,
    /// Set while restored pickles are still being rehydrated
    pub rehydrating: bool,
    /// A block result that arrived while the branch was rehydrating; applied
    /// once the pickles resolve
    pub pending_result: Option<BlockResult>,
}

impl Branch {
    pub fn new(id: BranchId, name: impl Into<String>, head: NodeId, frames: Vec<Frame>) -> Self {
        Self {
            id,
            name: name.into(),
            head,
            frames,
            bindings: BTreeMap::new(),
            current: None,
            cancelled: false,
            rehydrating: false,
            pending_result: None,
        }
    }

    /// Plain-value view of the bindings, as handed to step runners
    pub fn value_bindings(&self) -> BTreeMap<String, serde_json::Value> {
        self.bindings
            .iter()
            .filter_map(|(k, b)| b.as_value().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Pickled bindings awaiting rehydration
    pub fn pickled_bindings(&self) -> Vec<(String, PickleDescriptor)> {
        self.bindings
            .iter()
            .filter_map(|(k, b)| match b {
                Binding::Pickled(d) => Some((k.clone(), d.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Fan-in bookkeeping for one parallel block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelJoin {
    pub id: JoinId,
    /// The parallel block's enter node
    pub enter: NodeId,
    pub fail_fast: bool,
    /// Branches that have not reached the join yet
    pub pending: u32,
    pub results: Vec<BranchResult>,
    /// First real failure observed, in completion order
    pub first_failure: Option<crate::core::state::StepFailure>,
    /// Fail-fast cancellation has been sent to the siblings
    pub aborting: bool,
}

/// One branch's terminal record inside a join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchResult {
    pub branch: String,
    /// The branch's last node; becomes a parent of the join node
    pub last: NodeId,
    pub failure: Option<crate::core::state::StepFailure>,
    /// Finished by cancellation rather than by running to the end
    pub interrupted: bool,
}

/// A completion queued while the execution was paused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferredTick {
    /// A leaf step finished while paused
    Step { node: NodeId, outcome: crate::core::state::StepOutcome },
    /// A resource acquisition failed while paused
    AcquireFailed { node: NodeId, failure: crate::core::state::StepFailure },
    /// A resource was acquired while paused; continue the branch on unpause
    Advance { branch: BranchId },
}
