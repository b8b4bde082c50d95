//! Trace recorder.
//!
//! A [`History`] accumulates the operations the interpreter executes while
//! tracing a hot path. It is created either for a fresh loop, in which case
//! it opens with a `label` on a new start token, or for a bridge starting at
//! a failed guard, in which case the guard's snapshot is rebuilt into
//! recorder boxes first.

use crate::ir::{
    Arity, BoxFactory, Branch, BranchId, Descr, IdAllocator, IrBox, IrId, IrKind, IrValue,
    Opcode, Operation, TargetToken, Trace,
};
use crate::resume::{
    FailDescr, FrameState, Snapshot, SnapshotBuilder, SnapshotValue, VirtualDescription,
};
use fxhash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Default maximum number of recorded operations
pub const DEFAULT_TRACE_LIMIT: usize = 6000;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordError {
    /// The trace grew past the configured limit; tracing is abandoned
    TraceTooLong { limit: usize },
    Arity {
        opcode: Opcode,
        expected: Arity,
        found: usize,
    },
    Kind {
        opcode: Opcode,
        index: usize,
        expected: IrKind,
        found: IrKind,
    },
    MissingDescr(Opcode),
    /// `record` was called with a guard, label or terminal
    WrongEntryPoint(Opcode),
    /// An operation was recorded after the trace was terminated
    Terminated,
    Unterminated,
    UnterminatedBranch,
    NoSuchGuard,
    BranchAlreadyOpen,
    /// Recording refers to a box the recorder never produced
    UnboundValue(IrBox),
    MissingVirtual(usize),
    NoStartLabel,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::TraceTooLong { limit } => {
                write!(f, "trace too long (limit {} operations)", limit)
            }
            RecordError::Arity {
                opcode,
                expected,
                found,
            } => write!(f, "{} expects {:?} arguments, got {}", opcode, expected, found),
            RecordError::Kind {
                opcode,
                index,
                expected,
                found,
            } => write!(
                f,
                "argument {} of {} must be {}, got {}",
                index, opcode, expected, found
            ),
            RecordError::MissingDescr(op) => write!(f, "{} requires a descriptor", op),
            RecordError::WrongEntryPoint(op) => {
                write!(f, "{} cannot be recorded with this entry point", op)
            }
            RecordError::Terminated => write!(f, "trace already terminated"),
            RecordError::Unterminated => write!(f, "trace has no terminal operation"),
            RecordError::UnterminatedBranch => write!(f, "guard branch left open"),
            RecordError::NoSuchGuard => write!(f, "branch opened on something that is not a guard"),
            RecordError::BranchAlreadyOpen => write!(f, "guard already has a branch"),
            RecordError::UnboundValue(b) => write!(f, "{} was never recorded", b),
            RecordError::MissingVirtual(i) => write!(f, "snapshot refers to missing virtual #{}", i),
            RecordError::NoStartLabel => write!(f, "trace has no start label to close"),
        }
    }
}

impl std::error::Error for RecordError {}

/// Location of a recorded guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardRef {
    pub branch: Option<BranchId>,
    pub index: usize,
}

pub struct History {
    ids: Arc<IdAllocator>,
    boxes: BoxFactory,
    inputargs: Vec<IrBox>,
    ops: Vec<Operation>,
    branches: Vec<Branch>,
    open: Vec<BranchId>,
    closed: bool,
    snapshots: SnapshotBuilder,
    start_token: Option<Arc<TargetToken>>,
    limit: usize,
    recorded: usize,
}

impl History {
    fn empty(ids: Arc<IdAllocator>, limit: usize) -> Self {
        Self {
            ids,
            boxes: BoxFactory::new(),
            inputargs: Vec::new(),
            ops: Vec::new(),
            branches: Vec::new(),
            open: Vec::new(),
            closed: false,
            snapshots: SnapshotBuilder::new(),
            start_token: None,
            limit,
            recorded: 0,
        }
    }

    /// Start recording a loop whose header takes values of `kinds`
    pub fn new_loop(ids: Arc<IdAllocator>, kinds: &[IrKind], limit: usize) -> Self {
        let token = TargetToken::new(ids.token());
        Self::with_start_token(ids, kinds, token, limit)
    }

    /// Start recording a loop entered through an existing label token
    pub fn with_start_token(
        ids: Arc<IdAllocator>,
        kinds: &[IrKind],
        token: Arc<TargetToken>,
        limit: usize,
    ) -> Self {
        let mut history = Self::empty(ids, limit);
        history.inputargs = kinds.iter().map(|k| history.boxes.fresh(*k)).collect();
        let args: Vec<IrValue> = history.inputargs.iter().map(|b| IrValue::Box(*b)).collect();
        history.ops.push(Operation::new(
            Opcode::Label,
            args,
            None,
            Some(Descr::Target(token.clone())),
        ));
        history.start_token = Some(token);
        history
    }

    /// Start recording a straight-line trace without a loop header
    pub fn new_linear(ids: Arc<IdAllocator>, kinds: &[IrKind], limit: usize) -> Self {
        let mut history = Self::empty(ids, limit);
        history.inputargs = kinds.iter().map(|k| history.boxes.fresh(*k)).collect();
        history
    }

    /// Start recording a bridge from a failed guard.
    ///
    /// Fail args become fresh input boxes; virtual objects in the snapshot
    /// are re-recorded as allocations plus field writes. Returns the rebuilt
    /// frames, outermost first.
    pub fn new_bridge(
        ids: Arc<IdAllocator>,
        guard: &FailDescr,
        limit: usize,
    ) -> Result<(Self, Vec<FrameState>), RecordError> {
        let mut history = Self::empty(ids, limit);
        let mut bound: FxHashMap<IrId, IrValue> = FxHashMap::default();
        for arg in guard.fail_args() {
            let input = history.boxes.fresh(arg.kind());
            history.inputargs.push(input);
            bound.insert(arg.id(), IrValue::Box(input));
        }

        let mut rebuilt: FxHashMap<usize, IrValue> = FxHashMap::default();
        let mut frames = Vec::new();
        for frame in guard.snapshot().frames() {
            let mut values = Vec::with_capacity(frame.values.len());
            for slot in &frame.values {
                values.push(history.rebuild_slot(guard, &bound, &mut rebuilt, slot)?);
            }
            frames.push(FrameState::new(frame.position, values));
        }
        trace!(
            "bridge for {}: {} inputs, {} virtuals rebuilt",
            guard.id(),
            history.inputargs.len(),
            rebuilt.len()
        );
        Ok((history, frames))
    }

    fn rebuild_slot(
        &mut self,
        guard: &FailDescr,
        bound: &FxHashMap<IrId, IrValue>,
        rebuilt: &mut FxHashMap<usize, IrValue>,
        slot: &SnapshotValue,
    ) -> Result<IrValue, RecordError> {
        match slot {
            SnapshotValue::Value(IrValue::Const(c)) => Ok(IrValue::Const(*c)),
            SnapshotValue::Value(IrValue::Box(b)) => bound
                .get(&b.id())
                .copied()
                .ok_or(RecordError::UnboundValue(*b)),
            SnapshotValue::Virtual(index) => {
                if let Some(value) = rebuilt.get(index) {
                    return Ok(*value);
                }
                let description = guard
                    .virtuals()
                    .get(*index)
                    .ok_or(RecordError::MissingVirtual(*index))?;
                match description {
                    VirtualDescription::Struct { descr, fields } => {
                        let opcode = if descr.vtable.is_some() {
                            Opcode::NewWithVtable
                        } else {
                            Opcode::New
                        };
                        let object = self.push_with_result(opcode, &[], Some(Descr::Size(descr.clone())))?;
                        rebuilt.insert(*index, object);
                        for (field, slot) in fields {
                            let value = self.rebuild_slot(guard, bound, rebuilt, slot)?;
                            self.push_with_result(
                                Opcode::SetfieldGc,
                                &[object, value],
                                Some(Descr::Field(field.clone())),
                            )?;
                        }
                        Ok(object)
                    }
                    VirtualDescription::Array { descr, items } => {
                        let array = self.push_with_result(
                            Opcode::NewArray,
                            &[IrValue::int(items.len() as i64)],
                            Some(Descr::Array(descr.clone())),
                        )?;
                        rebuilt.insert(*index, array);
                        for (i, slot) in items.iter().enumerate() {
                            let value = self.rebuild_slot(guard, bound, rebuilt, slot)?;
                            if Some(value) == descr.item_kind.zero().map(IrValue::Const) {
                                continue;
                            }
                            self.push_with_result(
                                Opcode::SetarrayitemGc,
                                &[array, IrValue::int(i as i64), value],
                                Some(Descr::Array(descr.clone())),
                            )?;
                        }
                        Ok(array)
                    }
                }
            }
        }
    }

    fn push_with_result(
        &mut self,
        opcode: Opcode,
        args: &[IrValue],
        descr: Option<Descr>,
    ) -> Result<IrValue, RecordError> {
        let result = self.record(opcode, args, descr)?;
        Ok(result.map(IrValue::Box).unwrap_or(IrValue::null()))
    }

    pub fn inputargs(&self) -> &[IrBox] {
        &self.inputargs
    }

    pub fn start_token(&self) -> Option<&Arc<TargetToken>> {
        self.start_token.as_ref()
    }

    pub fn ids(&self) -> &Arc<IdAllocator> {
        &self.ids
    }

    /// Operations recorded so far, branches included
    pub fn len(&self) -> usize {
        self.recorded
    }

    pub fn is_empty(&self) -> bool {
        self.recorded == 0
    }

    pub fn fresh_box(&mut self, kind: IrKind) -> IrBox {
        self.boxes.fresh(kind)
    }

    fn check(&self, opcode: Opcode, args: &[IrValue], descr: &Option<Descr>) -> Result<(), RecordError> {
        let arity = opcode.arity();
        if !arity.accepts(args.len()) {
            return Err(RecordError::Arity {
                opcode,
                expected: arity,
                found: args.len(),
            });
        }
        for (index, arg) in args.iter().enumerate() {
            if let Some(expected) = opcode.arg_kind(index) {
                if arg.kind() != expected {
                    return Err(RecordError::Kind {
                        opcode,
                        index,
                        expected,
                        found: arg.kind(),
                    });
                }
            }
        }
        if opcode.needs_descr() && descr.is_none() {
            return Err(RecordError::MissingDescr(opcode));
        }
        Ok(())
    }

    fn sink(&mut self) -> Result<&mut Vec<Operation>, RecordError> {
        match self.open.last() {
            Some(id) => self
                .branches
                .get_mut(id.0 as usize)
                .map(|b| &mut b.ops)
                .ok_or(RecordError::NoSuchGuard),
            None if self.closed => Err(RecordError::Terminated),
            None => Ok(&mut self.ops),
        }
    }

    fn push(&mut self, op: Operation) -> Result<usize, RecordError> {
        if self.recorded >= self.limit {
            return Err(RecordError::TraceTooLong { limit: self.limit });
        }
        let terminal = op.opcode.is_terminal();
        let sink = self.sink()?;
        sink.push(op);
        let index = sink.len() - 1;
        self.recorded += 1;
        if terminal && self.open.pop().is_none() {
            self.closed = true;
        }
        Ok(index)
    }

    /// Record a non-guard, non-terminal operation; returns its result box
    pub fn record(
        &mut self,
        opcode: Opcode,
        args: &[IrValue],
        descr: Option<Descr>,
    ) -> Result<Option<IrBox>, RecordError> {
        if opcode.is_guard() || opcode.is_terminal() || opcode == Opcode::Label {
            return Err(RecordError::WrongEntryPoint(opcode));
        }
        self.check(opcode, args, &descr)?;
        let result = opcode
            .has_result()
            .then(|| self.boxes.fresh(opcode.result_kind()));
        self.push(Operation::new(opcode, args.iter().copied(), result, descr))?;
        Ok(result)
    }

    /// Record a guard, capturing `frames` (outermost first) as its snapshot
    pub fn record_guard(
        &mut self,
        opcode: Opcode,
        args: &[IrValue],
        frames: &[FrameState],
    ) -> Result<GuardRef, RecordError> {
        let snapshot = self.snapshots.capture(frames);
        self.record_guard_with_snapshot(opcode, args, snapshot)
    }

    pub fn record_guard_with_snapshot(
        &mut self,
        opcode: Opcode,
        args: &[IrValue],
        snapshot: Arc<Snapshot>,
    ) -> Result<GuardRef, RecordError> {
        if !opcode.is_guard() {
            return Err(RecordError::WrongEntryPoint(opcode));
        }
        let descr = FailDescr::recorded(self.ids.fail(), opcode, snapshot);
        let descr = Some(Descr::Fail(descr));
        self.check(opcode, args, &descr)?;
        let branch = self.open.last().copied();
        let index = self.push(Operation::new(opcode, args.iter().copied(), None, descr))?;
        Ok(GuardRef { branch, index })
    }

    /// Start recording the off-trace continuation of `guard`
    pub fn open_branch(&mut self, guard: GuardRef) -> Result<BranchId, RecordError> {
        if self.open.last().copied() != guard.branch {
            return Err(RecordError::NoSuchGuard);
        }
        let id = BranchId(self.branches.len() as u32);
        let container = match guard.branch {
            Some(b) => &mut self.branches[b.0 as usize].ops,
            None => &mut self.ops,
        };
        let op = container.get_mut(guard.index).ok_or(RecordError::NoSuchGuard)?;
        if op.branch.is_some() {
            return Err(RecordError::BranchAlreadyOpen);
        }
        let snapshot = op
            .fail_descr()
            .map(|d| d.snapshot().clone())
            .ok_or(RecordError::NoSuchGuard)?;
        op.branch = Some(id);
        self.branches.push(Branch {
            snapshot,
            ops: Vec::new(),
        });
        self.open.push(id);
        Ok(id)
    }

    /// Record a mid-trace label whose arguments are fresh boxes
    pub fn label(&mut self, token: Arc<TargetToken>, args: &[IrBox]) -> Result<(), RecordError> {
        let args: Vec<IrValue> = args.iter().map(|b| IrValue::Box(*b)).collect();
        self.push(Operation::new(
            Opcode::Label,
            args,
            None,
            Some(Descr::Target(token)),
        ))?;
        Ok(())
    }

    /// Jump back to this trace's own start label
    pub fn close_loop(&mut self, args: &[IrValue]) -> Result<(), RecordError> {
        let token = self.start_token.clone().ok_or(RecordError::NoStartLabel)?;
        self.jump_to(token, args)
    }

    /// Jump to an already-compiled target
    pub fn jump_to(&mut self, token: Arc<TargetToken>, args: &[IrValue]) -> Result<(), RecordError> {
        self.push(Operation::new(
            Opcode::Jump,
            args.iter().copied(),
            None,
            Some(Descr::Target(token)),
        ))?;
        Ok(())
    }

    /// Leave the traced frame with an optional return value
    pub fn finish(&mut self, value: Option<IrValue>) -> Result<(), RecordError> {
        self.push(Operation::new(Opcode::Finish, value, None, None))?;
        Ok(())
    }

    /// Leave the traced frame by raising `exception`
    pub fn fail(&mut self, exception: Option<IrValue>) -> Result<(), RecordError> {
        self.push(Operation::new(Opcode::Fail, exception, None, None))?;
        Ok(())
    }

    /// Finalize into a trace; every branch and the main trace must be terminated
    pub fn into_trace(self) -> Result<Trace, RecordError> {
        if !self.open.is_empty() {
            return Err(RecordError::UnterminatedBranch);
        }
        if !self.closed {
            return Err(RecordError::Unterminated);
        }
        let mut trace = Trace::new(self.inputargs, self.ops, self.boxes);
        trace.branches = self.branches;
        Ok(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrConst;
    use crate::resume::CodePosition;

    fn ids() -> Arc<IdAllocator> {
        Arc::new(IdAllocator::new())
    }

    #[test]
    fn test_loop_starts_with_label_and_closes_on_it() {
        let mut history = History::new_loop(ids(), &[IrKind::Int], 100);
        let i0 = IrValue::Box(history.inputargs()[0]);
        let i1 = history
            .record(Opcode::IntAdd, &[i0, IrValue::int(1)], None)
            .unwrap()
            .unwrap();
        history.close_loop(&[i1.into()]).unwrap();
        let trace = history.into_trace().unwrap();

        assert_eq!(trace.ops[0].opcode, Opcode::Label);
        assert!(trace.is_loop());
        assert_eq!(trace.len(), 3);
    }

    #[test]
    fn test_trace_limit() {
        let mut history = History::new_loop(ids(), &[IrKind::Int], 2);
        let i0 = IrValue::Box(history.inputargs()[0]);
        history.record(Opcode::IntNeg, &[i0], None).unwrap();
        history.record(Opcode::IntNeg, &[i0], None).unwrap();
        let err = history.record(Opcode::IntNeg, &[i0], None).unwrap_err();
        assert_eq!(err, RecordError::TraceTooLong { limit: 2 });
    }

    #[test]
    fn test_arity_and_kind_checks() {
        let mut history = History::new_linear(ids(), &[IrKind::Ref], 100);
        let p0 = IrValue::Box(history.inputargs()[0]);
        assert!(matches!(
            history.record(Opcode::IntAdd, &[IrValue::int(1)], None),
            Err(RecordError::Arity { .. })
        ));
        assert!(matches!(
            history.record(Opcode::IntAdd, &[p0, IrValue::int(1)], None),
            Err(RecordError::Kind { index: 0, .. })
        ));
        assert!(matches!(
            history.record(Opcode::GuardTrue, &[IrValue::int(1)], None),
            Err(RecordError::WrongEntryPoint(Opcode::GuardTrue))
        ));
    }

    #[test]
    fn test_nested_branch_recording() {
        let mut history = History::new_linear(ids(), &[IrKind::Int], 100);
        let i0 = IrValue::Box(history.inputargs()[0]);
        let frame = FrameState::new(CodePosition::new(0, 3), vec![i0]);
        let c = history
            .record(Opcode::IntLt, &[i0, IrValue::int(10)], None)
            .unwrap()
            .unwrap();
        let guard = history
            .record_guard(Opcode::GuardTrue, &[c.into()], &[frame])
            .unwrap();

        let branch = history.open_branch(guard).unwrap();
        history.finish(Some(IrValue::int(-1))).unwrap();
        history.finish(Some(i0)).unwrap();
        let trace = history.into_trace().unwrap();

        assert_eq!(trace.ops[guard.index].branch, Some(branch));
        let recorded = trace.branch(branch).unwrap();
        assert_eq!(recorded.ops.len(), 1);
        assert_eq!(recorded.ops[0].opcode, Opcode::Finish);
        assert_eq!(recorded.snapshot.values.len(), 1);
    }

    #[test]
    fn test_unterminated_branch_is_rejected() {
        let mut history = History::new_linear(ids(), &[IrKind::Int], 100);
        let i0 = IrValue::Box(history.inputargs()[0]);
        let guard = history.record_guard(Opcode::GuardTrue, &[i0], &[]).unwrap();
        history.open_branch(guard).unwrap();
        assert_eq!(history.into_trace().unwrap_err(), RecordError::UnterminatedBranch);
    }

    #[test]
    fn test_bridge_rebuilds_virtuals() {
        use crate::ir::LayoutRegistry;
        use crate::resume::{Snapshot, VirtualDescription};

        let ids = ids();
        let mut layout = LayoutRegistry::new(ids.clone());
        let node = layout.size_descr("Node", 16, Some(0x100));
        let value = layout.add_field(&node, "value", IrKind::Int, false);

        let original = IrBox::new(IrId::new(7), IrKind::Int);
        let snapshot = Snapshot::new(
            CodePosition::new(0, 9),
            vec![
                SnapshotValue::Virtual(0),
                SnapshotValue::Value(IrValue::Const(IrConst::Int(3))),
            ],
            None,
        );
        let guard = FailDescr::resolved(
            ids.fail(),
            Opcode::GuardTrue,
            vec![original],
            snapshot,
            vec![VirtualDescription::Struct {
                descr: node.clone(),
                fields: vec![(value, SnapshotValue::Value(original.into()))],
            }],
            None,
        );

        let (mut history, frames) = History::new_bridge(ids, &guard, 100).unwrap();
        assert_eq!(history.inputargs().len(), 1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].values[1], IrValue::int(3));
        let object = frames[0].values[0];
        history.finish(Some(object)).unwrap();
        let trace = history.into_trace().unwrap();
        assert_eq!(trace.ops[0].opcode, Opcode::NewWithVtable);
        assert_eq!(trace.ops[1].opcode, Opcode::SetfieldGc);
        assert_eq!(trace.ops[1].args[1], IrValue::Box(trace.inputargs[0]));
    }
}
