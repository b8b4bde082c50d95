//! Trace Optimizer
//!
//! The optimizer is a chain of passes. Every operation of the input trace is
//! sent into the first pass, which may drop it, rewrite it, or forward it
//! (possibly together with new operations) to the rest of the chain. An
//! operation that leaves the last pass is emitted into the output. Because
//! forwarding is a synchronous call, a pass can inspect the state after the
//! downstream passes have handled an operation ("post-processing") and record
//! facts only for operations that were actually emitted.
//!
//! Chain order:
//! 1. [`IntBounds`](intbounds::IntBounds) - integer range propagation
//! 2. [`Rewrite`](rewrite::Rewrite) - constant folding and guard removal
//! 3. [`Virtualize`](virtualize::Virtualize) - escape analysis
//! 4. [`Pure`](pure::Pure) - common subexpression elimination
//! 5. [`Heap`](heap::Heap) - field and array caching
//! 6. [`GuardMerge`](guards::GuardMerge) - guard strengthening
//!
//! Loops are additionally peeled (see [`unroll`]).

pub mod intbound;
mod intbounds;
mod rewrite;
mod virtualize;
mod pure;
mod heap;
mod guards;
mod resume_data;
pub mod unroll;
mod virtual_state;

pub use heap::HeapCache;
pub use intbound::IntBound;
pub use pure::{PureCache, PureKey};
pub use unroll::{optimize_trace, OptimizedTrace};

use crate::ir::{
    ArrayDescr, BoxFactory, Descr, DescrId, FieldDescr, IdAllocator, IrBox, IrConst, IrId,
    IrKind, IrValue, Opcode, Operation, SizeDescr, Trace,
};
use crate::resume::Snapshot;
use fxhash::FxHashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// The optimizer proved the trace can never run to its end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidLoop {
    pub reason: String,
}

impl InvalidLoop {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for InvalidLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid loop: {}", self.reason)
    }
}

impl std::error::Error for InvalidLoop {}

/// Optimizer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub int_bounds: bool,
    pub rewrite: bool,
    pub virtuals: bool,
    pub pure: bool,
    pub heap: bool,
    pub guard_merge: bool,
    /// Peel one iteration off loops
    pub unroll: bool,
    /// Re-optimizations of the peeled body before giving up on peeling
    pub max_retrace: usize,
    /// Invariant pure/heap results carried across the loop label
    pub max_short_boxes: usize,
    /// Largest constant-length array that is kept virtual
    pub max_virtual_array: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            int_bounds: true,
            rewrite: true,
            virtuals: true,
            pure: true,
            heap: true,
            guard_merge: true,
            unroll: true,
            max_retrace: 4,
            max_short_boxes: 16,
            max_virtual_array: 64,
        }
    }
}

impl OptimizerConfig {
    /// Development config - fewer retries so failures surface quickly
    pub fn development() -> Self {
        Self {
            max_retrace: 2,
            ..Self::default()
        }
    }

    /// Production config - more room for loop specialization
    pub fn production() -> Self {
        Self {
            max_retrace: 8,
            max_short_boxes: 32,
            ..Self::default()
        }
    }

    /// No pass enabled and no peeling: the output equals the input
    pub fn disabled() -> Self {
        Self {
            int_bounds: false,
            rewrite: false,
            virtuals: false,
            pure: false,
            heap: false,
            guard_merge: false,
            unroll: false,
            ..Self::default()
        }
    }

    /// Apply `TRACEJIT_NO_UNROLL` / `TRACEJIT_NO_VIRTUALS` debug switches
    pub fn with_env_overrides(mut self) -> Self {
        if std::env::var("TRACEJIT_NO_UNROLL").is_ok() {
            self.unroll = false;
        }
        if std::env::var("TRACEJIT_NO_VIRTUALS").is_ok() {
            self.virtuals = false;
        }
        self
    }
}

/// Result of an optimization run
#[derive(Debug, Clone, Default)]
pub struct OptimizationResult {
    /// Whether any operation was removed or rewritten
    pub modified: bool,

    /// Number of input operations that were not emitted
    pub ops_removed: usize,

    /// Number of operations written to the output
    pub ops_emitted: usize,

    /// Per-pass counters
    pub stats: HashMap<String, usize>,
}

impl OptimizationResult {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn bump(&mut self, key: &str) {
        self.modified = true;
        *self.stats.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn removed(&mut self, key: &str) {
        self.ops_removed += 1;
        self.bump(key);
    }

    pub fn get(&self, key: &str) -> usize {
        self.stats.get(key).copied().unwrap_or(0)
    }

    /// Combine results
    pub fn combine(mut self, other: OptimizationResult) -> Self {
        self.modified |= other.modified;
        self.ops_removed += other.ops_removed;
        self.ops_emitted += other.ops_emitted;
        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }
        self
    }
}

/// An object whose allocation has not been emitted
#[derive(Debug, Clone)]
pub enum VirtualObject {
    Struct {
        descr: Arc<SizeDescr>,
        fields: IndexMap<DescrId, (Arc<FieldDescr>, IrValue)>,
    },
    Array {
        descr: Arc<ArrayDescr>,
        items: Vec<IrValue>,
    },
}

fn zero_of(kind: IrKind) -> IrValue {
    kind.zero().map(IrValue::Const).unwrap_or(IrValue::int(0))
}

impl VirtualObject {
    pub fn known_class(&self) -> Option<usize> {
        match self {
            VirtualObject::Struct { descr, .. } => descr.vtable,
            VirtualObject::Array { .. } => None,
        }
    }

    /// Value of a field; unset fields read as zero
    pub fn field(&self, descr: &FieldDescr) -> IrValue {
        match self {
            VirtualObject::Struct { fields, .. } => fields
                .get(&descr.id)
                .map(|(_, v)| *v)
                .unwrap_or_else(|| zero_of(descr.kind)),
            VirtualObject::Array { .. } => zero_of(descr.kind),
        }
    }
}

/// What is known about a reference box
#[derive(Debug, Clone)]
pub enum PtrInfo {
    NonNull,
    /// Non-null with this class
    Class(usize),
    Virtual(VirtualObject),
}

impl PtrInfo {
    pub fn known_class(&self) -> Option<usize> {
        match self {
            PtrInfo::NonNull => None,
            PtrInfo::Class(vtable) => Some(*vtable),
            PtrInfo::Virtual(v) => v.known_class(),
        }
    }
}

/// Knowledge shared by all passes during one optimization run
pub struct OptState {
    pub config: OptimizerConfig,
    ids: Arc<IdAllocator>,
    boxes: BoxFactory,
    replacements: FxHashMap<IrId, IrValue>,
    bounds: FxHashMap<IrId, IntBound>,
    ptrs: FxHashMap<IrId, PtrInfo>,
    defs: FxHashMap<IrId, Operation>,
    pub pure: PureCache,
    pub heap: HeapCache,
    output: Vec<Operation>,
    exception_pending: bool,
    /// Raw snapshot frame address -> (raw frame, last resolved frame)
    resume_cache: FxHashMap<usize, (Arc<Snapshot>, Arc<Snapshot>)>,
    pub stats: OptimizationResult,
}

impl OptState {
    pub fn new(config: OptimizerConfig, ids: Arc<IdAllocator>, boxes: BoxFactory) -> Self {
        Self {
            config,
            ids,
            boxes,
            replacements: FxHashMap::default(),
            bounds: FxHashMap::default(),
            ptrs: FxHashMap::default(),
            defs: FxHashMap::default(),
            pure: PureCache::default(),
            heap: HeapCache::default(),
            output: Vec::new(),
            exception_pending: false,
            resume_cache: FxHashMap::default(),
            stats: OptimizationResult::unchanged(),
        }
    }

    pub fn ids(&self) -> &Arc<IdAllocator> {
        &self.ids
    }

    pub fn fresh_box(&mut self, kind: IrKind) -> IrBox {
        self.boxes.fresh(kind)
    }

    pub fn boxes(&self) -> &BoxFactory {
        &self.boxes
    }

    /// Follow the replacement chain of `value`
    pub fn get_replacement(&self, value: IrValue) -> IrValue {
        let mut current = value;
        while let IrValue::Box(b) = current {
            match self.replacements.get(&b.id()) {
                Some(next) => current = *next,
                None => break,
            }
        }
        current
    }

    /// Rename `b` to `value` without merging any knowledge
    pub fn alias(&mut self, b: IrBox, value: IrValue) {
        self.replacements.insert(b.id(), value);
    }

    /// Record that `b` always equals `value`, moving what is known about `b`
    pub fn make_equal_to(&mut self, b: IrBox, value: IrValue) -> Result<(), InvalidLoop> {
        let value = self.get_replacement(value);
        if value == IrValue::Box(b) {
            return Ok(());
        }
        if let Some(bound) = self.bounds.remove(&b.id()) {
            self.intersect_bound(value, bound)?;
        }
        if let Some(info) = self.ptrs.remove(&b.id()) {
            match value {
                IrValue::Const(c) if c.is_null() => {
                    return Err(InvalidLoop::new(format!("{} is known non-null", b)));
                }
                IrValue::Const(_) => {}
                IrValue::Box(target) => {
                    let keep = match (self.ptrs.get(&target.id()), &info) {
                        (None, _) => true,
                        (Some(PtrInfo::NonNull), PtrInfo::Class(_)) => true,
                        _ => false,
                    };
                    if keep {
                        self.ptrs.insert(target.id(), info);
                    }
                }
            }
        }
        self.replacements.insert(b.id(), value);
        Ok(())
    }

    pub fn make_constant(&mut self, b: IrBox, c: IrConst) -> Result<(), InvalidLoop> {
        self.make_equal_to(b, IrValue::Const(c))
    }

    /// Range of an integer value; full when nothing is known
    pub fn bound(&self, value: IrValue) -> IntBound {
        match self.get_replacement(value) {
            IrValue::Const(c) => c.as_int().map(IntBound::exact).unwrap_or(IntBound::FULL),
            IrValue::Box(b) => self.bounds.get(&b.id()).copied().unwrap_or(IntBound::FULL),
        }
    }

    /// Narrow the range of `value`; a box narrowed to one value becomes that constant
    pub fn intersect_bound(&mut self, value: IrValue, bound: IntBound) -> Result<(), InvalidLoop> {
        match self.get_replacement(value) {
            IrValue::Const(c) => match c.as_int() {
                Some(v) if !bound.contains(v) => Err(InvalidLoop::new(format!(
                    "constant {} outside {}",
                    v, bound
                ))),
                _ => Ok(()),
            },
            IrValue::Box(b) => {
                if b.kind() != IrKind::Int || bound.is_full() {
                    return Ok(());
                }
                let current = self.bounds.get(&b.id()).copied().unwrap_or(IntBound::FULL);
                let narrowed = current.intersect(&bound).ok_or_else(|| {
                    InvalidLoop::new(format!("{} cannot be in both {} and {}", b, current, bound))
                })?;
                match narrowed.constant() {
                    Some(v) => {
                        self.bounds.remove(&b.id());
                        self.replacements.insert(b.id(), IrValue::int(v));
                    }
                    None => {
                        self.bounds.insert(b.id(), narrowed);
                    }
                }
                Ok(())
            }
        }
    }

    pub fn ptr_info(&self, value: IrValue) -> Option<&PtrInfo> {
        match self.get_replacement(value) {
            IrValue::Box(b) => self.ptrs.get(&b.id()),
            IrValue::Const(_) => None,
        }
    }

    pub fn set_ptr_info(&mut self, b: IrBox, info: PtrInfo) {
        self.ptrs.insert(b.id(), info);
    }

    pub fn is_virtual(&self, value: IrValue) -> bool {
        matches!(self.ptr_info(value), Some(PtrInfo::Virtual(_)))
    }

    pub fn virtual_object(&self, value: IrValue) -> Option<&VirtualObject> {
        match self.ptr_info(value) {
            Some(PtrInfo::Virtual(v)) => Some(v),
            _ => None,
        }
    }

    pub fn virtual_object_mut(&mut self, value: IrValue) -> Option<&mut VirtualObject> {
        let IrValue::Box(b) = self.get_replacement(value) else {
            return None;
        };
        match self.ptrs.get_mut(&b.id()) {
            Some(PtrInfo::Virtual(v)) => Some(v),
            _ => None,
        }
    }

    /// Stop treating `b` as virtual; it keeps the class it had
    pub fn take_virtual(&mut self, b: IrBox) -> Option<VirtualObject> {
        match self.ptrs.remove(&b.id()) {
            Some(PtrInfo::Virtual(v)) => {
                let info = match v.known_class() {
                    Some(vtable) => PtrInfo::Class(vtable),
                    None => PtrInfo::NonNull,
                };
                self.ptrs.insert(b.id(), info);
                Some(v)
            }
            Some(other) => {
                self.ptrs.insert(b.id(), other);
                None
            }
            None => None,
        }
    }

    pub fn is_nonnull(&self, value: IrValue) -> bool {
        match self.get_replacement(value) {
            IrValue::Const(c) => c.kind() == IrKind::Ref && !c.is_null(),
            IrValue::Box(b) => self.ptrs.contains_key(&b.id()),
        }
    }

    pub fn is_null(&self, value: IrValue) -> bool {
        matches!(self.get_replacement(value), IrValue::Const(c) if c.is_null())
    }

    pub fn known_class(&self, value: IrValue) -> Option<usize> {
        self.ptr_info(value).and_then(|info| info.known_class())
    }

    pub fn mark_nonnull(&mut self, value: IrValue) {
        if let IrValue::Box(b) = self.get_replacement(value) {
            self.ptrs.entry(b.id()).or_insert(PtrInfo::NonNull);
        }
    }

    pub fn mark_class(&mut self, value: IrValue, vtable: usize) {
        if let IrValue::Box(b) = self.get_replacement(value) {
            if !matches!(self.ptrs.get(&b.id()), Some(PtrInfo::Virtual(_))) {
                self.ptrs.insert(b.id(), PtrInfo::Class(vtable));
            }
        }
    }

    /// The emitted comparison that produced `value`, if any
    pub fn definition(&self, value: IrValue) -> Option<&Operation> {
        match self.get_replacement(value) {
            IrValue::Box(b) => self.defs.get(&b.id()),
            IrValue::Const(_) => None,
        }
    }

    /// Whether an emitted call may have raised since the last exception check
    pub fn exception_pending(&self) -> bool {
        self.exception_pending
    }

    /// Append an operation to the output, finalizing guard resume data
    pub fn emit(&mut self, mut op: Operation) {
        for arg in op.args.iter_mut() {
            *arg = self.get_replacement(*arg);
        }
        if let Some(raw) = op.fail_descr().cloned() {
            let resolved = resume_data::finalize(self, &op, &raw);
            op.descr = Some(Descr::Fail(resolved));
        }
        match op.opcode {
            Opcode::GuardNoException => self.exception_pending = false,
            opcode if opcode.is_call() => {
                let may_raise = op
                    .descr
                    .as_ref()
                    .and_then(|d| d.as_call())
                    .map_or(true, |c| c.effect.may_raise);
                if may_raise {
                    self.exception_pending = true;
                }
            }
            _ => {}
        }
        if let Some(result) = op.result {
            if op.opcode.is_comparison()
                || matches!(op.opcode, Opcode::IntIsTrue | Opcode::IntIsZero)
            {
                self.defs.insert(result.id(), op.clone());
            }
        }
        trace!("emit {}", op);
        self.stats.ops_emitted += 1;
        self.output.push(op);
    }

    pub fn output(&self) -> &[Operation] {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut Vec<Operation> {
        &mut self.output
    }

    pub fn into_parts(self) -> (Vec<Operation>, BoxFactory, OptimizationResult) {
        (self.output, self.boxes, self.stats)
    }
}

/// One pass of the optimizer chain
pub trait OptimizationPass {
    /// Get the name of this pass
    fn name(&self) -> &'static str;

    /// Handle one operation, forwarding whatever survives to `next`
    fn propagate_forward(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop>;

    /// Emit postponed work and forget per-block state (before labels and at the end)
    fn flush(&mut self, _state: &mut OptState, _next: &mut Chain<'_>) -> Result<(), InvalidLoop> {
        Ok(())
    }
}

/// The passes downstream of the current one
pub struct Chain<'p> {
    rest: &'p mut [Box<dyn OptimizationPass>],
}

impl Chain<'_> {
    pub fn emit(&mut self, op: Operation, state: &mut OptState) -> Result<(), InvalidLoop> {
        send(self.rest, op, state)
    }
}

fn send(
    passes: &mut [Box<dyn OptimizationPass>],
    op: Operation,
    state: &mut OptState,
) -> Result<(), InvalidLoop> {
    match passes.split_first_mut() {
        Some((first, rest)) => first.propagate_forward(op, state, &mut Chain { rest }),
        None => {
            state.emit(op);
            Ok(())
        }
    }
}

/// Drives one optimization run over a sequence of operations
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
    virtualize_at: Option<usize>,
    pub state: OptState,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig, ids: Arc<IdAllocator>, boxes: BoxFactory) -> Self {
        let mut passes: Vec<Box<dyn OptimizationPass>> = Vec::new();
        let mut virtualize_at = None;
        if config.int_bounds {
            passes.push(Box::new(intbounds::IntBounds::new()));
        }
        if config.rewrite {
            passes.push(Box::new(rewrite::Rewrite::new()));
        }
        if config.virtuals {
            virtualize_at = Some(passes.len());
            passes.push(Box::new(virtualize::Virtualize::new()));
        }
        if config.pure {
            passes.push(Box::new(pure::Pure::new()));
        }
        if config.heap {
            passes.push(Box::new(heap::Heap::new()));
        }
        if config.guard_merge {
            passes.push(Box::new(guards::GuardMerge::new()));
        }
        Self {
            passes,
            virtualize_at,
            state: OptState::new(config, ids, boxes),
        }
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Feed one operation through the whole chain
    pub fn send(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        for arg in op.args.iter_mut() {
            *arg = self.state.get_replacement(*arg);
        }
        send(&mut self.passes, op, &mut self.state)
    }

    /// Append an operation to the output without running any pass
    pub fn emit_direct(&mut self, op: Operation) {
        self.state.emit(op);
    }

    pub fn flush(&mut self) -> Result<(), InvalidLoop> {
        for index in 0..self.passes.len() {
            let (head, rest) = self.passes.split_at_mut(index + 1);
            head[index].flush(&mut self.state, &mut Chain { rest })?;
        }
        Ok(())
    }

    /// Emit the allocation of `value` if it is virtual; returns its replacement
    pub fn force(&mut self, value: IrValue) -> Result<IrValue, InvalidLoop> {
        let value = self.state.get_replacement(value);
        match self.virtualize_at {
            Some(index) => {
                let rest = &mut self.passes[index + 1..];
                virtualize::force_value(&mut self.state, &mut Chain { rest }, value)
            }
            None => Ok(value),
        }
    }

    pub fn into_parts(self) -> (Vec<Operation>, BoxFactory, OptimizationResult) {
        self.state.into_parts()
    }
}

/// Optimize a trace without peeling: bridges and traces that leave the loop
pub fn optimize_linear(
    trace: &Trace,
    config: &OptimizerConfig,
    ids: &Arc<IdAllocator>,
) -> Result<(Trace, OptimizationResult), InvalidLoop> {
    let mut optimizer = Optimizer::new(*config, ids.clone(), trace.boxes.clone());
    debug!(
        "optimizing {} ops linearly with [{}]",
        trace.len(),
        optimizer.pass_names().join(", ")
    );
    for (index, op) in trace.ops.iter().enumerate() {
        if op.opcode == Opcode::Label {
            if index > 0 {
                optimizer.flush()?;
                optimizer.state.heap.clear();
            }
            optimizer.emit_direct(op.clone());
            continue;
        }
        optimizer.send(op.clone())?;
    }
    optimizer.flush()?;
    let (ops, boxes, stats) = optimizer.into_parts();
    let mut optimized = Trace::new(trace.inputargs.clone(), ops, boxes);
    optimized.branches = trace.branches.clone();
    Ok((optimized, stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> OptState {
        OptState::new(
            OptimizerConfig::default(),
            Arc::new(IdAllocator::new()),
            BoxFactory::new(),
        )
    }

    #[test]
    fn test_bound_narrowed_to_one_value_becomes_constant() {
        let mut state = state();
        let b = state.fresh_box(IrKind::Int);
        state.intersect_bound(b.into(), IntBound::new(0, 5)).unwrap();
        state.intersect_bound(b.into(), IntBound::new(5, 9)).unwrap();
        assert_eq!(state.get_replacement(b.into()), IrValue::int(5));
        assert!(state.intersect_bound(b.into(), IntBound::new(6, 9)).is_err());
    }

    #[test]
    fn test_make_equal_to_moves_knowledge() {
        let mut state = state();
        let a = state.fresh_box(IrKind::Ref);
        let b = state.fresh_box(IrKind::Ref);
        state.mark_class(a.into(), 0x40);
        state.make_equal_to(a, b.into()).unwrap();
        assert_eq!(state.known_class(a.into()), Some(0x40));
        assert_eq!(state.known_class(b.into()), Some(0x40));

        let c = state.fresh_box(IrKind::Ref);
        state.mark_nonnull(c.into());
        assert!(state.make_equal_to(c, IrValue::null()).is_err());
    }

    #[test]
    fn test_env_override_disables_unrolling() {
        std::env::set_var("TRACEJIT_NO_UNROLL", "1");
        let config = OptimizerConfig::default().with_env_overrides();
        std::env::remove_var("TRACEJIT_NO_UNROLL");
        assert!(!config.unroll);
        assert!(config.virtuals);
    }
}
