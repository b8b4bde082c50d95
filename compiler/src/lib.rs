//! Core of the tracejit meta-tracing JIT: trace IR, the recorder, the loop
//! optimizer, guard resume data, the compilation manager and a reference
//! backend that executes compiled traces directly.

pub mod ir;
pub mod resume;
pub mod history;
pub mod optimizer;
pub mod codegen;
pub mod compile;
pub mod logging;

pub use compile::{
    BridgeAttached, CellToken, CompilationContext, CompilationManager, CompileStatistics,
    DeoptError, GuardAction, GuardFailureOutcome, GuardState, JitConfig, Rejected,
};
pub use history::{History, RecordError, DEFAULT_TRACE_LIMIT};
pub use optimizer::{optimize_trace, InvalidLoop, OptimizedTrace, OptimizerConfig};
