//! Trace Interpreter Backend
//!
//! Executes optimized traces directly instead of generating machine code.
//! It honours the whole [`Backend`](super::Backend) contract, so the
//! compilation manager, guard patching and state reconstruction can be run
//! end to end without a native code generator.
//!
//! ## Design
//! - Every compiled loop or bridge becomes a *code unit*: its input boxes and
//!   its operation list. Units live in an arena indexed by [`CodeAddress`].
//! - Labels are registered globally by token, so a `jump` can continue in
//!   the same unit or enter another one.
//! - Each guard with a failure path owns a patch slot. Patching publishes the
//!   bridge address behind a release fence; a failing guard reads the slot
//!   with acquire ordering and either enters the bridge or returns to the
//!   caller with the raw frame.
//! - Registers are a map from box id to value, rebuilt whenever control moves
//!   to another unit (box ids are only unique inside one unit).
//! - Calls go to external functions registered by address.

use super::heap::{Heap, HeapError};
use super::{decode_slots, Backend, BackendError, CodeAddress, CompiledCode, RawFrame};
use crate::ir::eval::{eval_ovf, eval_pure};
use crate::ir::{
    ArrayDescr, Descr, FailDescrId, FieldDescr, IrBox, IrId, IrValue, Opcode, Operation,
    RuntimeValue, SizeDescr, TokenId, Trace,
};
use crate::resume::{FailDescr, ResumeAllocator};
use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// An external function callable from compiled code
pub type ExternalFn = Arc<dyn Fn(&mut Heap, &[RuntimeValue]) -> CallOutcome + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Return(Option<RuntimeValue>),
    /// The callee raised; the value is the exception object
    Raise(RuntimeValue),
}

/// Resource limits of the interpreter backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendLimits {
    /// Code units (loops plus bridges) before compilation is refused
    pub max_units: usize,
    pub max_ops_per_unit: usize,
    /// Operations executed per `execute` call before giving up
    pub max_steps: u64,
}

impl Default for BackendLimits {
    fn default() -> Self {
        Self {
            max_units: 4096,
            max_ops_per_unit: 10_000,
            max_steps: 10_000_000,
        }
    }
}

/// How a run of compiled code ended
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Finished(Option<RuntimeValue>),
    /// Left through `fail`, carrying the exception
    Exception(Option<RuntimeValue>),
    /// A guard without a bridge failed
    GuardFailed { guard: Arc<FailDescr>, frame: RawFrame },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    UnknownUnit(CodeAddress),
    ArgumentCount { expected: usize, found: usize },
    Undefined(IrBox),
    BadOperands(Opcode),
    MissingDescr(Opcode),
    UnknownFunction(i64),
    UnknownTarget(TokenId),
    /// Control reached the end of a unit without a terminal
    FellOffEnd(CodeAddress),
    StepLimit(u64),
    Heap(HeapError),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::UnknownUnit(addr) => write!(f, "no code at {}", addr),
            ExecError::ArgumentCount { expected, found } => {
                write!(f, "unit takes {} arguments, got {}", expected, found)
            }
            ExecError::Undefined(b) => write!(f, "{} has no value", b),
            ExecError::BadOperands(op) => write!(f, "bad operands for {}", op),
            ExecError::MissingDescr(op) => write!(f, "{} has no usable descriptor", op),
            ExecError::UnknownFunction(addr) => write!(f, "no function at {:#x}", addr),
            ExecError::UnknownTarget(token) => write!(f, "jump to unknown target {}", token),
            ExecError::FellOffEnd(addr) => write!(f, "{} ended without a terminal", addr),
            ExecError::StepLimit(n) => write!(f, "step limit of {} operations reached", n),
            ExecError::Heap(e) => write!(f, "heap error: {}", e),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<HeapError> for ExecError {
    fn from(e: HeapError) -> Self {
        ExecError::Heap(e)
    }
}

const UNPATCHED: u32 = u32::MAX;

struct GuardSite {
    unit: CodeAddress,
    /// Address of the attached bridge, `UNPATCHED` until patched
    target: AtomicU32,
}

struct CodeUnit {
    inputargs: Vec<IrBox>,
    ops: Vec<Operation>,
}

#[derive(Default)]
struct Registers {
    values: FxHashMap<IrId, RuntimeValue>,
    exception: Option<RuntimeValue>,
    overflow: bool,
}

impl Registers {
    fn get(&self, value: IrValue) -> Result<RuntimeValue, ExecError> {
        match value {
            IrValue::Const(c) => Ok(RuntimeValue::from(c)),
            IrValue::Box(b) => self
                .values
                .get(&b.id())
                .copied()
                .ok_or(ExecError::Undefined(b)),
        }
    }

    fn set(&mut self, b: IrBox, value: RuntimeValue) {
        self.values.insert(b.id(), value);
    }

    fn int(&self, op: &Operation, index: usize) -> Result<i64, ExecError> {
        self.get(op.arg(index))?
            .as_int()
            .ok_or(ExecError::BadOperands(op.opcode))
    }

    fn gcref(&self, op: &Operation, index: usize) -> Result<crate::ir::GcRef, ExecError> {
        self.get(op.arg(index))?
            .as_gcref()
            .ok_or(ExecError::BadOperands(op.opcode))
    }

    /// Clear for entry into another unit, keeping the exception state
    fn enter(&mut self, inputs: &[IrBox], values: &[RuntimeValue]) {
        self.values.clear();
        for (b, v) in inputs.iter().zip(values) {
            self.set(*b, *v);
        }
    }
}

enum Flow {
    Next,
    Jump(TokenId, Vec<RuntimeValue>),
    GuardFailed(Arc<FailDescr>),
    Done(ExecOutcome),
}

/// Reference backend that executes traces by interpretation
pub struct TraceInterpreter {
    units: Vec<CodeUnit>,
    labels: FxHashMap<TokenId, (CodeAddress, usize)>,
    sites: FxHashMap<FailDescrId, GuardSite>,
    functions: FxHashMap<i64, ExternalFn>,
    heap: Heap,
    limits: BackendLimits,
    steps: u64,
}

impl Default for TraceInterpreter {
    fn default() -> Self {
        Self::new(BackendLimits::default())
    }
}

impl TraceInterpreter {
    pub fn new(limits: BackendLimits) -> Self {
        Self {
            units: Vec::new(),
            labels: FxHashMap::default(),
            sites: FxHashMap::default(),
            functions: FxHashMap::default(),
            heap: Heap::new(),
            limits,
            steps: 0,
        }
    }

    /// Make `function` callable at `address`
    pub fn register_function(&mut self, address: usize, function: ExternalFn) {
        self.functions.insert(address as i64, function);
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn limits(&self) -> &BackendLimits {
        &self.limits
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Total operations executed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn operations(&self, unit: CodeAddress) -> Option<&[Operation]> {
        self.units.get(unit.0 as usize).map(|u| u.ops.as_slice())
    }

    pub fn bridge_of(&self, guard: &FailDescr) -> Option<CodeAddress> {
        let site = self.sites.get(&guard.id())?;
        match site.target.load(Ordering::Acquire) {
            UNPATCHED => None,
            target => Some(CodeAddress(target)),
        }
    }

    fn install<'t>(
        &mut self,
        trace: &Trace,
        guards: impl Iterator<Item = &'t Arc<FailDescr>>,
    ) -> Result<CompiledCode, BackendError> {
        if self.units.len() >= self.limits.max_units {
            return Err(BackendError::CodeBufferFull {
                units: self.units.len(),
            });
        }
        if trace.ops.len() > self.limits.max_ops_per_unit {
            return Err(BackendError::TooManyOperations {
                ops: trace.ops.len(),
                limit: self.limits.max_ops_per_unit,
            });
        }

        let local: FxHashSet<TokenId> = trace
            .labels()
            .filter_map(|(_, op)| op.descr.as_ref()?.as_target().map(|t| t.id))
            .collect();
        for op in trace.ops.iter().filter(|op| op.opcode == Opcode::Jump) {
            let token = op
                .descr
                .as_ref()
                .and_then(|d| d.as_target())
                .map(|t| t.id)
                .ok_or(BackendError::UnknownTarget(TokenId(u32::MAX)))?;
            if !local.contains(&token) && !self.labels.contains_key(&token) {
                return Err(BackendError::UnknownTarget(token));
            }
        }

        let address = CodeAddress(self.units.len() as u32);
        for (index, op) in trace.labels() {
            if let Some(token) = op.descr.as_ref().and_then(|d| d.as_target()) {
                self.labels.insert(token.id, (address, index));
            }
        }
        let mut patchable = 0;
        for guard in guards {
            self.sites.insert(
                guard.id(),
                GuardSite {
                    unit: address,
                    target: AtomicU32::new(UNPATCHED),
                },
            );
            patchable += 1;
        }
        self.units.push(CodeUnit {
            inputargs: trace.inputargs.clone(),
            ops: trace.ops.clone(),
        });
        debug!(
            "installed {} with {} ops and {} guard(s)",
            address,
            trace.ops.len(),
            patchable
        );
        Ok(CompiledCode {
            entry: address,
            guards: patchable,
        })
    }

    /// Run compiled code from the start of `entry` until it leaves
    pub fn execute(&mut self, entry: CodeAddress, args: &[RuntimeValue]) -> Result<ExecOutcome, ExecError> {
        let Self {
            units,
            labels,
            sites,
            functions,
            heap,
            limits,
            steps,
        } = self;

        let unit = units
            .get(entry.0 as usize)
            .ok_or(ExecError::UnknownUnit(entry))?;
        if unit.inputargs.len() != args.len() {
            return Err(ExecError::ArgumentCount {
                expected: unit.inputargs.len(),
                found: args.len(),
            });
        }
        let mut regs = Registers::default();
        regs.enter(&unit.inputargs, args);

        let mut at = entry;
        let mut pc = 0usize;
        let mut executed = 0u64;
        loop {
            executed += 1;
            *steps += 1;
            if executed > limits.max_steps {
                return Err(ExecError::StepLimit(limits.max_steps));
            }
            let unit = &units[at.0 as usize];
            let op = unit.ops.get(pc).ok_or(ExecError::FellOffEnd(at))?;
            trace!("{}:{} {}", at, pc, op);

            match step(op, &mut regs, heap, functions)? {
                Flow::Next => pc += 1,
                Flow::Done(outcome) => return Ok(outcome),
                Flow::Jump(token, values) => {
                    let &(unit_at, index) =
                        labels.get(&token).ok_or(ExecError::UnknownTarget(token))?;
                    let label = &units[unit_at.0 as usize].ops[index];
                    let targets: Vec<IrBox> = label.args.iter().filter_map(|a| a.as_box()).collect();
                    if targets.len() != values.len() {
                        return Err(ExecError::ArgumentCount {
                            expected: targets.len(),
                            found: values.len(),
                        });
                    }
                    if unit_at == at {
                        for (b, v) in targets.iter().zip(&values) {
                            regs.set(*b, *v);
                        }
                    } else {
                        regs.enter(&targets, &values);
                    }
                    at = unit_at;
                    pc = index + 1;
                }
                Flow::GuardFailed(guard) => {
                    let values = guard
                        .fail_args()
                        .iter()
                        .map(|b| regs.get(IrValue::Box(*b)))
                        .collect::<Result<Vec<_>, _>>()?;
                    let bridge = sites
                        .get(&guard.id())
                        .map(|site| site.target.load(Ordering::Acquire))
                        .filter(|target| *target != UNPATCHED);
                    match bridge {
                        Some(target) => {
                            let address = CodeAddress(target);
                            let bridge = units
                                .get(target as usize)
                                .ok_or(ExecError::UnknownUnit(address))?;
                            trace!("{} failed, entering bridge {}", guard.id(), address);
                            regs.enter(&bridge.inputargs, &values);
                            at = address;
                            pc = 0;
                        }
                        None => {
                            let mut frame = RawFrame::from_values(&values);
                            frame.exception = regs.exception.map(|e| e.to_bits());
                            return Ok(ExecOutcome::GuardFailed { guard, frame });
                        }
                    }
                }
            }
        }
    }
}

fn guard_holds(op: &Operation, regs: &Registers, heap: &Heap) -> Result<bool, ExecError> {
    use Opcode::*;
    let class_matches = |r: crate::ir::GcRef| -> Result<bool, ExecError> {
        let expected = regs.int(op, 1)?;
        Ok(heap.class_of(r).map(|c| c as i64) == Some(expected))
    };
    Ok(match op.opcode {
        GuardTrue => regs.int(op, 0)? != 0,
        GuardFalse => regs.int(op, 0)? == 0,
        GuardValue => regs.get(op.arg(0))?.same_as(&regs.get(op.arg(1))?),
        GuardNonnull => !regs.gcref(op, 0)?.is_null(),
        GuardIsnull => regs.gcref(op, 0)?.is_null(),
        GuardClass => class_matches(regs.gcref(op, 0)?)?,
        GuardNonnullClass => {
            let r = regs.gcref(op, 0)?;
            !r.is_null() && class_matches(r)?
        }
        GuardNoException => regs.exception.is_none(),
        GuardNoOverflow => !regs.overflow,
        GuardOverflow => regs.overflow,
        other => return Err(ExecError::BadOperands(other)),
    })
}

fn step(
    op: &Operation,
    regs: &mut Registers,
    heap: &mut Heap,
    functions: &FxHashMap<i64, ExternalFn>,
) -> Result<Flow, ExecError> {
    use Opcode::*;
    let opcode = op.opcode;
    let descr = op.descr.as_ref();
    let missing = || ExecError::MissingDescr(opcode);

    if opcode.is_guard() {
        if guard_holds(op, regs, heap)? {
            return Ok(Flow::Next);
        }
        let guard = op.fail_descr().cloned().ok_or_else(missing)?;
        return Ok(Flow::GuardFailed(guard));
    }

    let result = match opcode {
        Label => return Ok(Flow::Next),
        Jump => {
            let token = descr.and_then(Descr::as_target).ok_or_else(missing)?.id;
            let values = op
                .args
                .iter()
                .map(|a| regs.get(*a))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Flow::Jump(token, values));
        }
        Finish | Fail => {
            let value = match op.args.first() {
                Some(a) => Some(regs.get(*a)?),
                None => None,
            };
            let outcome = if opcode == Finish {
                ExecOutcome::Finished(value)
            } else {
                ExecOutcome::Exception(value)
            };
            return Ok(Flow::Done(outcome));
        }
        IntAddOvf | IntSubOvf | IntMulOvf => {
            let (value, overflowed) = eval_ovf(opcode, regs.int(op, 0)?, regs.int(op, 1)?)
                .ok_or(ExecError::BadOperands(opcode))?;
            regs.overflow = overflowed;
            Some(RuntimeValue::Int(value))
        }
        New | NewWithVtable => {
            let layout = descr.and_then(Descr::as_size).ok_or_else(missing)?;
            Some(heap.new_struct(layout))
        }
        NewArray => {
            let array = descr.and_then(Descr::as_array).ok_or_else(missing)?;
            Some(heap.new_array(array, regs.int(op, 0)?)?)
        }
        GetfieldGcI | GetfieldGcR | GetfieldGcF => {
            let field = descr.and_then(Descr::as_field).ok_or_else(missing)?;
            Some(heap.get_field(regs.gcref(op, 0)?, field)?)
        }
        SetfieldGc => {
            let field = descr.and_then(Descr::as_field).ok_or_else(missing)?;
            let value = regs.get(op.arg(1))?;
            heap.set_field(regs.gcref(op, 0)?, field, value)?;
            None
        }
        GetarrayitemGcI | GetarrayitemGcR | GetarrayitemGcF => {
            Some(heap.get_item(regs.gcref(op, 0)?, regs.int(op, 1)?)?)
        }
        SetarrayitemGc => {
            let value = regs.get(op.arg(2))?;
            heap.set_item(regs.gcref(op, 0)?, regs.int(op, 1)?, value)?;
            None
        }
        ArraylenGc => Some(RuntimeValue::Int(heap.array_len(regs.gcref(op, 0)?)? as i64)),
        _ if opcode.is_call() => {
            let address = regs.int(op, 0)?;
            let function = functions
                .get(&address)
                .ok_or(ExecError::UnknownFunction(address))?;
            let args = op.args[1..]
                .iter()
                .map(|a| regs.get(*a))
                .collect::<Result<Vec<_>, _>>()?;
            match function(heap, &args) {
                CallOutcome::Return(value) => value,
                CallOutcome::Raise(exception) => {
                    regs.exception = Some(exception);
                    op.result.and_then(|b| RuntimeValue::zero(b.kind()))
                }
            }
        }
        _ => {
            let args = op
                .args
                .iter()
                .map(|a| regs.get(*a))
                .collect::<Result<Vec<_>, _>>()?;
            Some(eval_pure(opcode, &args).ok_or(ExecError::BadOperands(opcode))?)
        }
    };

    if let Some(b) = op.result {
        let value = result.ok_or(ExecError::BadOperands(opcode))?;
        regs.set(b, value);
    }
    Ok(Flow::Next)
}

impl Backend for TraceInterpreter {
    fn compile_loop(
        &mut self,
        trace: &Trace,
        guards: &[Arc<FailDescr>],
    ) -> Result<CompiledCode, BackendError> {
        self.install(trace, guards.iter())
    }

    fn compile_bridge(&mut self, guard: &FailDescr, trace: &Trace) -> Result<CodeAddress, BackendError> {
        if !self.sites.contains_key(&guard.id()) {
            return Err(BackendError::UnknownGuard(guard.id()));
        }
        let guards: Vec<Arc<FailDescr>> = trace.guards().cloned().collect();
        Ok(self.install(trace, guards.iter())?.entry)
    }

    fn patch_guard(&mut self, guard: &FailDescr, target: CodeAddress) -> Result<(), BackendError> {
        let site = self
            .sites
            .get(&guard.id())
            .ok_or(BackendError::UnknownGuard(guard.id()))?;
        // the bridge unit must be visible before the slot that leads to it
        fence(Ordering::Release);
        site.target.store(target.0, Ordering::Relaxed);
        debug!("patched {} in {} to {}", guard.id(), site.unit, target);
        Ok(())
    }

    fn decode_failure(
        &self,
        guard: &FailDescr,
        raw: &RawFrame,
    ) -> Result<Vec<(IrBox, RuntimeValue)>, BackendError> {
        decode_slots(guard, raw)
    }
}

/// Objects rebuilt after a guard failure live on the interpreter's own heap
impl ResumeAllocator for TraceInterpreter {
    fn allocate_struct(&mut self, descr: &Arc<SizeDescr>) -> RuntimeValue {
        self.heap.allocate_struct(descr)
    }

    fn allocate_array(&mut self, descr: &Arc<ArrayDescr>, length: usize) -> RuntimeValue {
        self.heap.allocate_array(descr, length)
    }

    fn set_field(&mut self, object: RuntimeValue, descr: &Arc<FieldDescr>, value: RuntimeValue) {
        ResumeAllocator::set_field(&mut self.heap, object, descr, value)
    }

    fn set_array_item(
        &mut self,
        array: RuntimeValue,
        descr: &Arc<ArrayDescr>,
        index: usize,
        value: RuntimeValue,
    ) {
        self.heap.set_array_item(array, descr, index, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;
    use crate::ir::lowering::lower_text;
    use crate::ir::IdAllocator;

    const SUM_LOOP: &str = "
        [i0, i1]
        label(i0, i1, descr=loop)
        i2 = int_add(i0, 1)
        i3 = int_add(i1, i0)
        i4 = int_lt(i2, 10)
        guard_true(i4) [i2, i3]
        jump(i2, i3, descr=loop)
    ";

    fn compile(backend: &mut TraceInterpreter, trace: &Trace) -> CodeAddress {
        let guards: Vec<Arc<FailDescr>> = trace.guards().cloned().collect();
        backend.compile_loop(trace, &guards).unwrap().entry
    }

    #[test]
    fn test_loop_runs_until_guard_fails() {
        let ids = Arc::new(IdAllocator::new());
        let lowered = lower_text(SUM_LOOP, ids).unwrap();
        let mut backend = TraceInterpreter::default();
        let entry = compile(&mut backend, &lowered.trace);

        let outcome = backend
            .execute(entry, &[RuntimeValue::Int(0), RuntimeValue::Int(0)])
            .unwrap();
        let ExecOutcome::GuardFailed { guard, frame } = outcome else {
            panic!("expected a guard failure, got {:?}", outcome);
        };
        let decoded = backend.decode_failure(&guard, &frame).unwrap();
        let values: Vec<RuntimeValue> = decoded.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![RuntimeValue::Int(10), RuntimeValue::Int(45)]);
    }

    #[test]
    fn test_patched_guard_enters_bridge() {
        let ids = Arc::new(IdAllocator::new());
        let lowered = lower_text(SUM_LOOP, ids.clone()).unwrap();
        let mut backend = TraceInterpreter::default();
        let entry = compile(&mut backend, &lowered.trace);
        let guard = lowered.trace.guards().next().cloned().unwrap();

        let (mut bridge, _) = History::new_bridge(ids, &guard, 100).unwrap();
        let sum = bridge.inputargs()[1];
        let doubled = bridge
            .record(Opcode::IntMul, &[sum.into(), IrValue::int(2)], None)
            .unwrap()
            .unwrap();
        bridge.finish(Some(doubled.into())).unwrap();
        let bridge = bridge.into_trace().unwrap();

        let address = backend.compile_bridge(&guard, &bridge).unwrap();
        assert_eq!(backend.bridge_of(&guard), None);
        backend.patch_guard(&guard, address).unwrap();
        assert_eq!(backend.bridge_of(&guard), Some(address));

        let outcome = backend
            .execute(entry, &[RuntimeValue::Int(0), RuntimeValue::Int(0)])
            .unwrap();
        assert!(matches!(
            outcome,
            ExecOutcome::Finished(Some(RuntimeValue::Int(90)))
        ));
    }

    #[test]
    fn test_calls_and_exceptions() {
        let ids = Arc::new(IdAllocator::new());
        let lowered = lower_text(
            "
            descr check = call(int -> int, raises)
            [i0]
            i1 = call_i(@check, i0, descr=check)
            guard_no_exception() [i0]
            finish(i1)
            ",
            ids,
        )
        .unwrap();
        let mut backend = TraceInterpreter::default();
        let address = lowered.function_address("check").unwrap();
        backend.register_function(
            address,
            Arc::new(|_heap: &mut Heap, args: &[RuntimeValue]| match args[0] {
                RuntimeValue::Int(n) if n < 0 => {
                    CallOutcome::Raise(RuntimeValue::Ref(crate::ir::GcRef(0x99)))
                }
                RuntimeValue::Int(n) => CallOutcome::Return(Some(RuntimeValue::Int(n * 3))),
                _ => CallOutcome::Return(None),
            }),
        );
        let entry = compile(&mut backend, &lowered.trace);

        let ok = backend.execute(entry, &[RuntimeValue::Int(4)]).unwrap();
        assert!(matches!(ok, ExecOutcome::Finished(Some(RuntimeValue::Int(12)))));

        let raised = backend.execute(entry, &[RuntimeValue::Int(-1)]).unwrap();
        let ExecOutcome::GuardFailed { frame, .. } = raised else {
            panic!("expected guard_no_exception to fail");
        };
        assert_eq!(frame.exception, Some(0x99));
        assert_eq!(frame.slots, vec![(-1i64) as u64]);
    }

    #[test]
    fn test_limits_are_enforced() {
        let ids = Arc::new(IdAllocator::new());
        let lowered = lower_text(SUM_LOOP, ids).unwrap();
        let mut backend = TraceInterpreter::new(BackendLimits {
            max_units: 1,
            max_ops_per_unit: 100,
            max_steps: 20,
        });
        let entry = compile(&mut backend, &lowered.trace);
        assert_eq!(
            backend.compile_loop(&lowered.trace, &[]),
            Err(BackendError::CodeBufferFull { units: 1 })
        );
        let err = backend
            .execute(entry, &[RuntimeValue::Int(0), RuntimeValue::Int(0)])
            .unwrap_err();
        assert_eq!(err, ExecError::StepLimit(20));
    }

    #[test]
    fn test_unknown_jump_target_is_rejected() {
        let ids = Arc::new(IdAllocator::new());
        let other = crate::ir::TargetToken::new(ids.token());
        let lowered = crate::ir::lowering::Lowering::new(ids)
            .with_token("elsewhere", other.clone())
            .lower(&parser::parse_trace_file("[i0]\njump(i0, descr=elsewhere)").unwrap())
            .unwrap();
        let mut backend = TraceInterpreter::default();
        assert_eq!(
            backend.compile_loop(&lowered.trace, &[]),
            Err(BackendError::UnknownTarget(other.id))
        );
    }
}
