/// Code generation backends for tracejit
///
/// A backend turns optimized traces into executable code units, patches
/// guards so that failures jump into bridges, and decodes the state a failed
/// guard left behind. The in-crate backend is the trace interpreter, which
/// executes units directly and exists for testing and the developer CLI.
pub mod heap;
pub mod profiling;
pub mod trace_interpreter;

pub use heap::{Heap, HeapError, HeapObject};
pub use profiling::{GuardValueCounters, HotnessLevel, ProfileConfig, ProfileData, ProfileStatistics};
pub use trace_interpreter::{
    BackendLimits, CallOutcome, ExecError, ExecOutcome, ExternalFn, TraceInterpreter,
};

use crate::ir::{FailDescrId, IrBox, RuntimeValue, TokenId, Trace};
use crate::resume::FailDescr;
use std::fmt;
use std::sync::Arc;

/// Address of a compiled code unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeAddress(pub u32);

impl fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// A compiled loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledCode {
    pub entry: CodeAddress,
    /// Guards that received a patchable failure path
    pub guards: usize,
}

/// Machine state left behind by a failed guard: one raw word per fail arg
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFrame {
    pub slots: Vec<u64>,
    /// Exception pending when the guard failed
    pub exception: Option<u64>,
}

impl RawFrame {
    /// Encode values in fail-args order
    pub fn from_values(values: &[RuntimeValue]) -> Self {
        Self {
            slots: values.iter().map(|v| v.to_bits()).collect(),
            exception: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// No room for another code unit
    CodeBufferFull { units: usize },
    TooManyOperations { ops: usize, limit: usize },
    /// A jump names a label that is neither in the trace nor compiled
    UnknownTarget(TokenId),
    UnknownGuard(FailDescrId),
    FrameMismatch { expected: usize, found: usize },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::CodeBufferFull { units } => {
                write!(f, "code buffer full ({} units)", units)
            }
            BackendError::TooManyOperations { ops, limit } => {
                write!(f, "trace has {} operations, backend limit is {}", ops, limit)
            }
            BackendError::UnknownTarget(token) => write!(f, "jump to unknown target {}", token),
            BackendError::UnknownGuard(id) => write!(f, "{} has no patchable failure path", id),
            BackendError::FrameMismatch { expected, found } => write!(
                f,
                "raw frame has {} slots, guard has {} fail args",
                found, expected
            ),
        }
    }
}

impl std::error::Error for BackendError {}

/// Code generator contract used by the compilation manager
pub trait Backend {
    /// Compile an optimized loop; `guards` get patchable failure paths
    fn compile_loop(
        &mut self,
        trace: &Trace,
        guards: &[Arc<FailDescr>],
    ) -> Result<CompiledCode, BackendError>;

    /// Compile a bridge leaving from `guard`; the bridge is not yet reachable
    fn compile_bridge(&mut self, guard: &FailDescr, trace: &Trace) -> Result<CodeAddress, BackendError>;

    /// Make failures of `guard` continue at `target`
    fn patch_guard(&mut self, guard: &FailDescr, target: CodeAddress) -> Result<(), BackendError>;

    /// Values of the guard's fail args, in fail-args order
    fn decode_failure(
        &self,
        guard: &FailDescr,
        raw: &RawFrame,
    ) -> Result<Vec<(IrBox, RuntimeValue)>, BackendError>;
}

/// Shared `decode_failure` for backends whose raw frames hold one word per fail arg
pub fn decode_slots(guard: &FailDescr, raw: &RawFrame) -> Result<Vec<(IrBox, RuntimeValue)>, BackendError> {
    let fail_args = guard.fail_args();
    if fail_args.len() != raw.slots.len() {
        return Err(BackendError::FrameMismatch {
            expected: fail_args.len(),
            found: raw.slots.len(),
        });
    }
    Ok(fail_args
        .iter()
        .zip(&raw.slots)
        .filter_map(|(b, bits)| RuntimeValue::from_bits(b.kind(), *bits).map(|v| (*b, v)))
        .collect())
}
