//! Traces and guard branches

use super::{BoxFactory, IrBox, Opcode, Operation, TargetToken};
use crate::resume::{FailDescr, Snapshot};
use std::sync::Arc;

/// Index of a guard continuation in its trace's branch arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub u32);

/// An off-trace continuation recorded inline after a guard.
///
/// Branch operations name boxes from the recorded main trace; `snapshot`
/// is the guard's recorded snapshot, which maps those boxes to frame slots
/// when the branch is later compiled as a bridge.
#[derive(Debug, Clone)]
pub struct Branch {
    pub snapshot: Arc<Snapshot>,
    pub ops: Vec<Operation>,
}

/// A linear list of operations with explicit inputs
#[derive(Debug, Clone)]
pub struct Trace {
    pub inputargs: Vec<IrBox>,
    pub ops: Vec<Operation>,
    pub branches: Vec<Branch>,
    pub boxes: BoxFactory,
}

impl Trace {
    pub fn new(inputargs: Vec<IrBox>, ops: Vec<Operation>, boxes: BoxFactory) -> Self {
        Self {
            inputargs,
            ops,
            branches: Vec::new(),
            boxes,
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn terminal(&self) -> Option<&Operation> {
        self.ops.last().filter(|op| op.opcode.is_terminal())
    }

    pub fn branch(&self, id: BranchId) -> Option<&Branch> {
        self.branches.get(id.0 as usize)
    }

    /// Token of the leading label, if the trace starts with one
    pub fn start_token(&self) -> Option<&Arc<TargetToken>> {
        self.ops
            .first()
            .filter(|op| op.opcode == Opcode::Label)
            .and_then(|op| op.descr.as_ref())
            .and_then(|d| d.as_target())
    }

    /// A loop starts with a label and jumps back to that same label
    pub fn is_loop(&self) -> bool {
        let jump_target = self
            .terminal()
            .filter(|op| op.opcode == Opcode::Jump)
            .and_then(|op| op.descr.as_ref())
            .and_then(|d| d.as_target());
        match (self.start_token(), jump_target) {
            (Some(start), Some(target)) => start.id == target.id,
            _ => false,
        }
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.ops.iter().filter(|op| op.opcode == opcode).count()
    }

    pub fn guards(&self) -> impl Iterator<Item = &Arc<FailDescr>> {
        self.ops.iter().filter_map(|op| op.fail_descr())
    }

    /// Labels in order of appearance
    pub fn labels(&self) -> impl Iterator<Item = (usize, &Operation)> {
        self.ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.opcode == Opcode::Label)
    }
}
