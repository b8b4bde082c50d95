//! Trace Builder
//!
//! Builds traces directly, without the recorder's checks. Tests use it to
//! construct traces operation by operation, including ones the recorder
//! would refuse (for the validator), and benches use it to generate long
//! traces without going through the text format.

use super::{
    BoxFactory, Branch, BranchId, Descr, IdAllocator, IrBox, IrKind, IrValue, Opcode, Operation,
    TargetToken, Trace,
};
use crate::resume::{CodePosition, FailDescr, Snapshot, SnapshotValue};
use std::sync::Arc;

/// Builder for constructing traces in a convenient way
pub struct TraceBuilder {
    ids: Arc<IdAllocator>,
    boxes: BoxFactory,
    inputargs: Vec<IrBox>,
    ops: Vec<Operation>,
    branches: Vec<Branch>,
    /// Branches receiving operations, innermost last
    open: Vec<BranchId>,
    /// Code position given to the snapshots of the next guards
    position: CodePosition,
}

impl TraceBuilder {
    pub fn new(ids: Arc<IdAllocator>) -> Self {
        Self {
            ids,
            boxes: BoxFactory::new(),
            inputargs: Vec::new(),
            ops: Vec::new(),
            branches: Vec::new(),
            open: Vec::new(),
            position: CodePosition::new(0, 0),
        }
    }

    pub fn ids(&self) -> &Arc<IdAllocator> {
        &self.ids
    }

    /// Add an input box
    pub fn input(&mut self, kind: IrKind) -> IrBox {
        let b = self.boxes.fresh(kind);
        self.inputargs.push(b);
        b
    }

    pub fn inputs(&mut self, kinds: &[IrKind]) -> Vec<IrBox> {
        kinds.iter().map(|k| self.input(*k)).collect()
    }

    /// Set the code position recorded by the following guards
    pub fn at(&mut self, position: CodePosition) -> &mut Self {
        self.position = position;
        self
    }

    fn sink(&mut self) -> &mut Vec<Operation> {
        match self.open.last() {
            Some(id) => &mut self.branches[id.0 as usize].ops,
            None => &mut self.ops,
        }
    }

    /// Append `op` as is
    pub fn push(&mut self, op: Operation) {
        self.sink().push(op);
    }

    /// Build an operation; returns its result box if the opcode has one
    pub fn build_op(&mut self, opcode: Opcode, args: &[IrValue], descr: Option<Descr>) -> Option<IrBox> {
        let result = opcode
            .has_result()
            .then(|| self.boxes.fresh(opcode.result_kind()));
        self.push(Operation::new(opcode, args.iter().copied(), result, descr));
        result
    }

    /// Build an integer-producing operation on two operands
    pub fn build_int(&mut self, opcode: Opcode, left: impl Into<IrValue>, right: impl Into<IrValue>) -> IrBox {
        let result = self.boxes.fresh(IrKind::Int);
        self.push(Operation::new(
            opcode,
            [left.into(), right.into()],
            Some(result),
            None,
        ));
        result
    }

    /// Build a guard whose single-frame snapshot holds `live` values
    pub fn build_guard(&mut self, opcode: Opcode, args: &[IrValue], live: &[IrValue]) -> Arc<FailDescr> {
        let snapshot = Snapshot::new(
            self.position,
            live.iter().map(|v| SnapshotValue::Value(*v)).collect(),
            None,
        );
        let descr = FailDescr::recorded(self.ids.fail(), opcode, snapshot);
        self.push(Operation::new(
            opcode,
            args.iter().copied(),
            None,
            Some(Descr::Fail(descr.clone())),
        ));
        descr
    }

    /// Route the following operations into a branch of the last guard built.
    ///
    /// Returns `None` if the last operation is not a guard.
    pub fn start_branch(&mut self) -> Option<BranchId> {
        let id = BranchId(self.branches.len() as u32);
        let guard = self.sink().last_mut().filter(|op| op.is_guard())?;
        let snapshot = guard.fail_descr()?.snapshot().clone();
        guard.branch = Some(id);
        self.branches.push(Branch {
            snapshot,
            ops: Vec::new(),
        });
        self.open.push(id);
        Some(id)
    }

    /// Continue in the enclosing branch (or the main trace)
    pub fn end_branch(&mut self) {
        self.open.pop();
    }

    pub fn build_label(&mut self, token: &Arc<TargetToken>, args: &[IrBox]) {
        self.push(Operation::new(
            Opcode::Label,
            args.iter().map(|b| IrValue::Box(*b)),
            None,
            Some(Descr::Target(token.clone())),
        ));
    }

    pub fn build_jump(&mut self, token: &Arc<TargetToken>, args: &[IrValue]) {
        self.push(Operation::new(
            Opcode::Jump,
            args.iter().copied(),
            None,
            Some(Descr::Target(token.clone())),
        ));
    }

    pub fn build_finish(&mut self, value: Option<IrValue>) {
        self.push(Operation::new(Opcode::Finish, value, None, None));
    }

    pub fn build_fail(&mut self, exception: Option<IrValue>) {
        self.push(Operation::new(Opcode::Fail, exception, None, None));
    }

    pub fn finish(self) -> Trace {
        let mut trace = Trace::new(self.inputargs, self.ops, self.boxes);
        trace.branches = self.branches;
        trace
    }
}
