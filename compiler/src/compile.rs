//! # Compilation Manager
//!
//! Drives recorded traces through the optimizer into a [`Backend`] and keeps
//! the bookkeeping that outlives a single compilation: compiled loops, the
//! state of every installed guard and the pseudo loops that end a frame.
//!
//! ## Lifecycle
//! 1. `compile_loop` optimizes a recorded trace, installs it and returns its
//!    [`CellToken`]; each guard of the new code starts out `Compiled`
//! 2. `handle_guard_failure` rebuilds the interpreter frames of a failed guard
//!    and counts the failure
//! 3. Once a guard has failed `bridge_threshold` times the caller is told to
//!    record a bridge from it (`BridgeRequested`)
//! 4. `compile_bridge` optimizes the bridge and patches the guard
//!    (`BridgeAttached`); if that is rejected the guard goes back to
//!    `Compiled` with its counter reset
//!
//! Guard branches recorded inline with a loop are compiled as bridges right
//! after the loop itself. Jumps to the pseudo loops are rewritten into
//! `finish`/`fail` before a trace reaches the backend.

use crate::codegen::{
    Backend, BackendError, BackendLimits, CodeAddress, GuardValueCounters, ProfileConfig,
    ProfileData, ProfileStatistics, RawFrame,
};
use crate::history::{History, RecordError};
use crate::ir::validation::{validate_trace, ValidationError};
use crate::ir::{
    BranchId, FailDescrId, GcRef, IdAllocator, IrId, IrKind, IrValue, Opcode, Operation,
    PseudoLoop, RuntimeValue, TargetToken, TokenId, Trace,
};
use crate::optimizer::{optimize_trace, InvalidLoop, OptimizedTrace, OptimizerConfig};
use crate::resume::{
    reconstruct_frames, FailDescr, FrameState, ResumeAllocator, ResumeError, ResumedFrame,
    SnapshotValue,
};
use fxhash::FxHashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration of the whole JIT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Check traces with `validate_trace` before and after optimizing
    pub validate: bool,
    pub profile: ProfileConfig,
    pub optimizer: OptimizerConfig,
    pub backend: BackendLimits,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            validate: true,
            profile: ProfileConfig::default(),
            optimizer: OptimizerConfig::default(),
            backend: BackendLimits::default(),
        }
    }
}

impl JitConfig {
    /// Development configuration (low thresholds, every trace validated)
    pub fn development() -> Self {
        Self {
            validate: true,
            profile: ProfileConfig::development(),
            optimizer: OptimizerConfig::development(),
            backend: BackendLimits::default(),
        }
    }

    /// Production configuration (conservative thresholds, no validation)
    pub fn production() -> Self {
        Self {
            validate: false,
            profile: ProfileConfig::production(),
            optimizer: OptimizerConfig::production(),
            backend: BackendLimits::default(),
        }
    }

    /// Parse a TOML document; missing tables and keys keep their defaults
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.optimizer = self.optimizer.with_env_overrides();
        self
    }
}

/// A compiled loop (or a compiled linear trace leaving the frame)
#[derive(Debug)]
pub struct CellToken {
    pub number: u32,
    pub entry: CodeAddress,
    /// Label of the preamble, `None` for traces that are not loops
    pub start: Option<Arc<TargetToken>>,
    /// Label of the peeled loop body
    pub loop_token: Option<Arc<TargetToken>>,
    pub inputs: Vec<IrKind>,
    pub guards: usize,
    pub operations: usize,
}

impl CellToken {
    /// Whether `token` names a label inside this unit
    pub fn owns(&self, token: TokenId) -> bool {
        self.start.iter().chain(&self.loop_token).any(|t| t.id == token)
    }
}

/// Compilation state of an installed guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Failures resume in the interpreter
    Compiled,
    /// Failed often enough; the interpreter should record a bridge
    BridgeRequested,
    BridgeInProgress,
    BridgeAttached(CodeAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeAttached {
    pub guard: FailDescrId,
    pub address: CodeAddress,
}

/// Why a trace was not compiled
#[derive(Debug, Clone, PartialEq)]
pub enum Rejected {
    InvalidLoop(InvalidLoop),
    /// Another bridge for this guard is being compiled right now
    BridgeInProgress(FailDescrId),
    BridgeAttached(FailDescrId),
    UnknownGuard(FailDescrId),
    Malformed(Vec<ValidationError>),
    Backend(BackendError),
}

impl Rejected {
    /// Short name used as the statistics key
    pub fn reason(&self) -> &'static str {
        match self {
            Rejected::InvalidLoop(_) => "invalid_loop",
            Rejected::BridgeInProgress(_) => "bridge_in_progress",
            Rejected::BridgeAttached(_) => "bridge_attached",
            Rejected::UnknownGuard(_) => "unknown_guard",
            Rejected::Malformed(_) => "malformed",
            Rejected::Backend(_) => "backend",
        }
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejected::InvalidLoop(e) => write!(f, "{}", e),
            Rejected::BridgeInProgress(id) => write!(f, "a bridge for {} is already being compiled", id),
            Rejected::BridgeAttached(id) => write!(f, "{} already has a bridge", id),
            Rejected::UnknownGuard(id) => write!(f, "{} was not installed by this manager", id),
            Rejected::Malformed(errors) => {
                write!(f, "malformed trace:")?;
                for e in errors {
                    write!(f, "\n  {}", e)?;
                }
                Ok(())
            }
            Rejected::Backend(e) => write!(f, "backend rejected the trace: {}", e),
        }
    }
}

impl std::error::Error for Rejected {}

impl From<InvalidLoop> for Rejected {
    fn from(e: InvalidLoop) -> Self {
        Rejected::InvalidLoop(e)
    }
}

impl From<BackendError> for Rejected {
    fn from(e: BackendError) -> Self {
        Rejected::Backend(e)
    }
}

/// What the interpreter should do after resuming from a failed guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    Resume,
    /// Record a bridge from the guard and hand it to `compile_bridge`
    CompileBridge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardFailureOutcome {
    /// Interpreter frames, outermost first
    pub frames: Vec<ResumedFrame>,
    pub exception: Option<RuntimeValue>,
    /// Failure count that decided `action`
    pub failures: u64,
    pub action: GuardAction,
}

/// A failed guard whose state could not be rebuilt
#[derive(Debug, Clone, PartialEq)]
pub enum DeoptError {
    Backend(BackendError),
    Resume(ResumeError),
}

impl fmt::Display for DeoptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeoptError::Backend(e) => write!(f, "cannot decode guard failure: {}", e),
            DeoptError::Resume(e) => write!(f, "cannot rebuild frames: {}", e),
        }
    }
}

impl std::error::Error for DeoptError {}

impl From<BackendError> for DeoptError {
    fn from(e: BackendError) -> Self {
        DeoptError::Backend(e)
    }
}

impl From<ResumeError> for DeoptError {
    fn from(e: ResumeError) -> Self {
        DeoptError::Resume(e)
    }
}

#[derive(Debug)]
struct GuardRecord {
    /// Cell the guard's code belongs to
    owner: u32,
    state: GuardState,
    failures: u64,
    /// Per-value counts of a `guard_value`
    values: Option<GuardValueCounters>,
}

/// Tokens, pseudo loops and guard tables of one JIT instance
pub struct CompilationContext {
    ids: Arc<IdAllocator>,
    pseudo: IndexMap<PseudoLoop, Arc<TargetToken>>,
    next_cell: AtomicU32,
    cells: Mutex<IndexMap<u32, Arc<CellToken>>>,
    guards: Mutex<FxHashMap<FailDescrId, GuardRecord>>,
}

impl CompilationContext {
    pub fn new(ids: Arc<IdAllocator>) -> Self {
        let pseudo = PseudoLoop::ALL
            .iter()
            .map(|kind| (*kind, TargetToken::pseudo(ids.token(), *kind)))
            .collect();
        Self {
            ids,
            pseudo,
            next_cell: AtomicU32::new(0),
            cells: Mutex::new(IndexMap::new()),
            guards: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn ids(&self) -> &Arc<IdAllocator> {
        &self.ids
    }

    pub fn pseudo_token(&self, kind: PseudoLoop) -> Option<Arc<TargetToken>> {
        self.pseudo.get(&kind).cloned()
    }

    /// Pseudo tokens under the names the text format knows them by
    pub fn pseudo_tokens(&self) -> impl Iterator<Item = (&'static str, Arc<TargetToken>)> + '_ {
        self.pseudo.iter().map(|(kind, token)| (kind.name(), token.clone()))
    }

    pub fn cell(&self, number: u32) -> Option<Arc<CellToken>> {
        self.cells.lock().get(&number).cloned()
    }

    /// The compiled unit containing the label `token`
    pub fn cell_for_token(&self, token: TokenId) -> Option<Arc<CellToken>> {
        self.cells.lock().values().find(|c| c.owns(token)).cloned()
    }

    pub fn cells(&self) -> Vec<Arc<CellToken>> {
        self.cells.lock().values().cloned().collect()
    }

    pub fn guard_state(&self, guard: FailDescrId) -> Option<GuardState> {
        self.guards.lock().get(&guard).map(|g| g.state)
    }

    pub fn guard_failures(&self, guard: FailDescrId) -> u64 {
        self.guards.lock().get(&guard).map_or(0, |g| g.failures)
    }

    /// Failing values counted for a `guard_value`, in insertion order
    pub fn guard_values(&self, guard: FailDescrId) -> Vec<(RuntimeValue, u64)> {
        self.guards
            .lock()
            .get(&guard)
            .and_then(|g| g.values.as_ref())
            .map(|v| v.entries().collect())
            .unwrap_or_default()
    }

    fn add_cell(&self, build: impl FnOnce(u32) -> CellToken) -> Arc<CellToken> {
        let number = self.next_cell.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(build(number));
        self.cells.lock().insert(number, cell.clone());
        cell
    }

    fn register_guards<'a>(&self, owner: u32, guards: impl Iterator<Item = &'a Arc<FailDescr>>) {
        let mut table = self.guards.lock();
        for descr in guards {
            let values = (descr.guard() == Opcode::GuardValue && descr.value_index().is_some())
                .then(GuardValueCounters::new);
            table.insert(
                descr.id(),
                GuardRecord {
                    owner,
                    state: GuardState::Compiled,
                    failures: 0,
                    values,
                },
            );
        }
    }

    /// Claim `guard` for bridge compilation; returns the owning cell
    pub(crate) fn begin_bridge(&self, guard: FailDescrId) -> Result<u32, Rejected> {
        let mut table = self.guards.lock();
        let record = table.get_mut(&guard).ok_or(Rejected::UnknownGuard(guard))?;
        match record.state {
            GuardState::BridgeInProgress => Err(Rejected::BridgeInProgress(guard)),
            GuardState::BridgeAttached(_) => Err(Rejected::BridgeAttached(guard)),
            GuardState::Compiled | GuardState::BridgeRequested => {
                record.state = GuardState::BridgeInProgress;
                Ok(record.owner)
            }
        }
    }

    /// Settle a claimed guard: attached, or back to `Compiled` with fresh counters
    pub(crate) fn end_bridge(&self, guard: FailDescrId, address: Option<CodeAddress>) {
        if let Some(record) = self.guards.lock().get_mut(&guard) {
            match address {
                Some(address) => record.state = GuardState::BridgeAttached(address),
                None => {
                    record.state = GuardState::Compiled;
                    record.failures = 0;
                    if let Some(values) = record.values.as_mut() {
                        *values = GuardValueCounters::new();
                    }
                }
            }
        }
    }

    fn count_failure(
        &self,
        guard: FailDescrId,
        checked: Option<RuntimeValue>,
        threshold: u64,
    ) -> (u64, GuardAction) {
        let mut table = self.guards.lock();
        let Some(record) = table.get_mut(&guard) else {
            return (0, GuardAction::Resume);
        };
        record.failures += 1;
        let count = match (checked, record.values.as_mut()) {
            (Some(value), Some(values)) => values.record(value),
            _ => record.failures,
        };
        if record.state == GuardState::Compiled && count >= threshold {
            record.state = GuardState::BridgeRequested;
            return (count, GuardAction::CompileBridge);
        }
        (count, GuardAction::Resume)
    }
}

#[derive(Debug, Default)]
struct Counters {
    loops: usize,
    bridges: usize,
    inline_bridges: usize,
    guard_failures: u64,
    rejections: IndexMap<&'static str, usize>,
}

/// Compilation statistics summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompileStatistics {
    pub loops_compiled: usize,
    pub bridges_attached: usize,
    /// Bridges compiled from guard branches recorded with their loop
    pub inline_bridges: usize,
    pub guard_failures: u64,
    pub rejections: IndexMap<&'static str, usize>,
    pub profile_stats: ProfileStatistics,
}

impl CompileStatistics {
    pub fn rejected(&self) -> usize {
        self.rejections.values().sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        let rejections = if self.rejections.is_empty() {
            "none".to_string()
        } else {
            self.rejections
                .iter()
                .map(|(reason, n)| format!("{}={}", reason, n))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "Compilation: {} loops, {} bridges ({} inline), {} guard failures\n\
             Rejected: {}\n\
             {}",
            self.loops_compiled,
            self.bridges_attached,
            self.inline_bridges,
            self.guard_failures,
            rejections,
            self.profile_stats.format()
        )
    }
}

/// Replace terminal jumps to pseudo loops by `finish`/`fail`
fn lower_pseudo_jumps(trace: &Trace) -> Trace {
    let mut trace = trace.clone();
    let ops = trace
        .ops
        .iter_mut()
        .chain(trace.branches.iter_mut().flat_map(|b| b.ops.iter_mut()));
    for op in ops {
        if op.opcode != Opcode::Jump {
            continue;
        }
        let Some(pseudo) = op
            .descr
            .as_ref()
            .and_then(|d| d.as_target())
            .and_then(|t| t.pseudo)
        else {
            continue;
        };
        let value = op.args.first().copied();
        *op = match pseudo {
            PseudoLoop::DoneWithThisFrame(_) => Operation::new(Opcode::Finish, value, None, None),
            PseudoLoop::ExitFrameWithException => Operation::new(Opcode::Fail, value, None, None),
        };
    }
    trace
}

/// Re-records a guard branch on top of a bridge history
struct BranchReplay<'t> {
    source: &'t Trace,
    history: History,
    /// Branch boxes to bridge values
    values: FxHashMap<IrId, IrValue>,
}

impl BranchReplay<'_> {
    fn value(&self, value: IrValue) -> Result<IrValue, RecordError> {
        match value {
            IrValue::Const(_) => Ok(value),
            IrValue::Box(b) => self
                .values
                .get(&b.id())
                .copied()
                .ok_or(RecordError::UnboundValue(b)),
        }
    }

    fn frames(&self, descr: &FailDescr) -> Result<Vec<FrameState>, RecordError> {
        let mut frames = Vec::new();
        for frame in descr.snapshot().frames() {
            let mut values = Vec::with_capacity(frame.values.len());
            for slot in &frame.values {
                values.push(match slot {
                    SnapshotValue::Value(v) => self.value(*v)?,
                    SnapshotValue::Virtual(index) => return Err(RecordError::MissingVirtual(*index)),
                });
            }
            frames.push(FrameState::new(frame.position, values));
        }
        Ok(frames)
    }

    fn replay(&mut self, branch: BranchId) -> Result<(), RecordError> {
        let source = self.source;
        let ops = &source.branch(branch).ok_or(RecordError::NoSuchGuard)?.ops;
        for op in ops {
            let args = op
                .args
                .iter()
                .map(|a| self.value(*a))
                .collect::<Result<Vec<_>, _>>()?;
            match op.opcode {
                Opcode::Jump => {
                    let token = op
                        .descr
                        .as_ref()
                        .and_then(|d| d.as_target())
                        .cloned()
                        .ok_or(RecordError::MissingDescr(Opcode::Jump))?;
                    self.history.jump_to(token, &args)?;
                }
                Opcode::Finish => self.history.finish(args.first().copied())?,
                Opcode::Fail => self.history.fail(args.first().copied())?,
                Opcode::Label => return Err(RecordError::WrongEntryPoint(Opcode::Label)),
                opcode if opcode.is_guard() => {
                    let descr = op.fail_descr().ok_or(RecordError::MissingDescr(opcode))?;
                    let frames = self.frames(descr)?;
                    let guard = self.history.record_guard(opcode, &args, &frames)?;
                    if let Some(nested) = op.branch {
                        self.history.open_branch(guard)?;
                        self.replay(nested)?;
                    }
                }
                opcode => {
                    let result = self.history.record(opcode, &args, op.descr.clone())?;
                    if let (Some(old), Some(new)) = (op.result, result) {
                        self.values.insert(old.id(), IrValue::Box(new));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Compilation manager over one backend
pub struct CompilationManager<B: Backend> {
    context: CompilationContext,
    backend: Mutex<B>,
    config: JitConfig,
    profile: ProfileData,
    counters: Mutex<Counters>,
}

impl<B: Backend> CompilationManager<B> {
    pub fn new(backend: B, config: JitConfig) -> Self {
        Self::with_context(CompilationContext::new(Arc::new(IdAllocator::new())), backend, config)
    }

    pub fn with_context(context: CompilationContext, backend: B, config: JitConfig) -> Self {
        Self {
            context,
            backend: Mutex::new(backend),
            profile: ProfileData::new(config.profile),
            config,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn context(&self) -> &CompilationContext {
        &self.context
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Loop-header counters consulted by the interpreter
    pub fn profile(&self) -> &ProfileData {
        &self.profile
    }

    /// Exclusive access to the backend, e.g. to run compiled code
    pub fn backend(&self) -> MutexGuard<'_, B> {
        self.backend.lock()
    }

    /// Start recording a loop whose inputs have `kinds`
    pub fn start_tracing(&self, kinds: &[IrKind]) -> History {
        History::new_loop(self.context.ids.clone(), kinds, self.config.profile.trace_limit)
    }

    /// Start recording a bridge from `guard`; returns the rebuilt frames too
    pub fn start_bridge(&self, guard: &FailDescr) -> Result<(History, Vec<FrameState>), RecordError> {
        History::new_bridge(self.context.ids.clone(), guard, self.config.profile.trace_limit)
    }

    /// The bridge requested for `guard` will not be delivered (tracing gave up)
    pub fn abandon_bridge(&self, guard: &FailDescr) {
        if self.context.guard_state(guard.id()) == Some(GuardState::BridgeRequested) {
            self.context.end_bridge(guard.id(), None);
        }
    }

    fn reject(&self, rejected: Rejected) -> Rejected {
        debug!("compilation rejected ({}): {}", rejected.reason(), rejected);
        *self
            .counters
            .lock()
            .rejections
            .entry(rejected.reason())
            .or_insert(0) += 1;
        rejected
    }

    fn prepare(&self, trace: &Trace) -> Result<OptimizedTrace, Rejected> {
        let trace = lower_pseudo_jumps(trace);
        if self.config.validate {
            validate_trace(&trace).map_err(Rejected::Malformed)?;
        }
        let optimized = optimize_trace(&trace, &self.config.optimizer, &self.context.ids)?;
        debug!(
            "optimized {} ops into {} ({} removed)",
            trace.len(),
            optimized.trace.len(),
            optimized.stats.ops_removed
        );
        if self.config.validate {
            validate_trace(&optimized.trace).map_err(Rejected::Malformed)?;
        }
        Ok(optimized)
    }

    /// Optimize and install a recorded loop
    pub fn compile_loop(&self, trace: &Trace) -> Result<Arc<CellToken>, Rejected> {
        let OptimizedTrace {
            trace: optimized,
            loop_token,
            ..
        } = self.prepare(trace).map_err(|e| self.reject(e))?;
        let guards: Vec<Arc<FailDescr>> = optimized.guards().cloned().collect();
        let compiled = self
            .backend
            .lock()
            .compile_loop(&optimized, &guards)
            .map_err(|e| self.reject(e.into()))?;

        let cell = self.context.add_cell(|number| CellToken {
            number,
            entry: compiled.entry,
            start: optimized.start_token().cloned(),
            loop_token,
            inputs: optimized.inputargs.iter().map(|b| b.kind()).collect(),
            guards: guards.len(),
            operations: optimized.len(),
        });
        self.context.register_guards(cell.number, guards.iter());
        self.counters.lock().loops += 1;
        info!(
            "compiled loop #{} at {} ({} ops, {} guards)",
            cell.number, cell.entry, cell.operations, cell.guards
        );

        self.compile_branches(&optimized);
        Ok(cell)
    }

    /// Optimize a bridge recorded from `guard` and attach it
    pub fn compile_bridge(&self, guard: &Arc<FailDescr>, trace: &Trace) -> Result<BridgeAttached, Rejected> {
        let owner = self
            .context
            .begin_bridge(guard.id())
            .map_err(|e| self.reject(e))?;
        match self.install_bridge(guard, trace) {
            Ok((address, optimized)) => {
                self.context.end_bridge(guard.id(), Some(address));
                self.context.register_guards(owner, optimized.guards());
                self.counters.lock().bridges += 1;
                info!("attached bridge {} to {}", address, guard.id());
                self.compile_branches(&optimized);
                Ok(BridgeAttached {
                    guard: guard.id(),
                    address,
                })
            }
            Err(e) => {
                self.context.end_bridge(guard.id(), None);
                Err(self.reject(e))
            }
        }
    }

    fn install_bridge(&self, guard: &FailDescr, trace: &Trace) -> Result<(CodeAddress, Trace), Rejected> {
        let optimized = self.prepare(trace)?.trace;
        let mut backend = self.backend.lock();
        let address = backend.compile_bridge(guard, &optimized)?;
        backend.patch_guard(guard, address)?;
        Ok((address, optimized))
    }

    /// Compile the inline branches of freshly installed code as bridges
    fn compile_branches(&self, trace: &Trace) {
        for op in &trace.ops {
            let (Some(branch), Some(descr)) = (op.branch, op.fail_descr()) else {
                continue;
            };
            let bridge = match self.branch_bridge(descr, trace, branch) {
                Ok(bridge) => bridge,
                Err(e) => {
                    warn!("cannot rebuild branch of {} as a bridge: {}", descr.id(), e);
                    continue;
                }
            };
            if self.compile_bridge(descr, &bridge).is_ok() {
                self.counters.lock().inline_bridges += 1;
            }
        }
    }

    /// Turn the branch recorded after a guard into a bridge leaving `descr`.
    ///
    /// The branch names the boxes of the guard's recorded snapshot; those
    /// map slot by slot onto the frames rebuilt from the optimized guard.
    fn branch_bridge(&self, descr: &FailDescr, trace: &Trace, branch: BranchId) -> Result<Trace, RecordError> {
        let recorded = trace.branch(branch).ok_or(RecordError::NoSuchGuard)?;
        let (history, frames) = self.start_bridge(descr)?;
        let mut values = FxHashMap::default();
        for (frame, rebuilt) in recorded.snapshot.frames().into_iter().zip(&frames) {
            for (slot, value) in frame.values.iter().zip(&rebuilt.values) {
                if let SnapshotValue::Value(IrValue::Box(b)) = slot {
                    values.insert(b.id(), *value);
                }
            }
        }
        let mut replay = BranchReplay {
            source: trace,
            history,
            values,
        };
        replay.replay(branch)?;
        replay.history.into_trace()
    }

    /// Rebuild the interpreter state of a failed guard and count the failure
    pub fn handle_guard_failure(
        &self,
        guard: &Arc<FailDescr>,
        raw: &RawFrame,
        allocator: &mut dyn ResumeAllocator,
    ) -> Result<GuardFailureOutcome, DeoptError> {
        let decoded = self.backend.lock().decode_failure(guard, raw)?;
        let frames = reconstruct_frames(guard, &decoded, allocator)?;
        let checked = guard
            .value_index()
            .and_then(|i| decoded.get(i))
            .map(|(_, v)| *v);
        Ok(self.failure_outcome(guard, raw, checked, frames))
    }

    fn failure_outcome(
        &self,
        guard: &FailDescr,
        raw: &RawFrame,
        checked: Option<RuntimeValue>,
        frames: Vec<ResumedFrame>,
    ) -> GuardFailureOutcome {
        let (failures, action) =
            self.context
                .count_failure(guard.id(), checked, self.config.profile.bridge_threshold);
        self.counters.lock().guard_failures += 1;
        if action == GuardAction::CompileBridge {
            debug!("{} failed {} times, requesting a bridge", guard.id(), failures);
        }
        GuardFailureOutcome {
            frames,
            exception: raw.exception.map(|bits| RuntimeValue::Ref(GcRef(bits as usize))),
            failures,
            action,
        }
    }

    pub fn statistics(&self) -> CompileStatistics {
        let counters = self.counters.lock();
        CompileStatistics {
            loops_compiled: counters.loops,
            bridges_attached: counters.bridges,
            inline_bridges: counters.inline_bridges,
            guard_failures: counters.guard_failures,
            rejections: counters.rejections.clone(),
            profile_stats: self.profile.get_statistics(),
        }
    }
}

impl<B: Backend + ResumeAllocator> CompilationManager<B> {
    /// `handle_guard_failure` rebuilding objects on the backend's own heap
    pub fn deoptimize(&self, guard: &Arc<FailDescr>, raw: &RawFrame) -> Result<GuardFailureOutcome, DeoptError> {
        let (decoded, frames) = {
            let mut backend = self.backend.lock();
            let decoded = backend.decode_failure(guard, raw)?;
            let frames = reconstruct_frames(guard, &decoded, &mut *backend)?;
            (decoded, frames)
        };
        let checked = guard
            .value_index()
            .and_then(|i| decoded.get(i))
            .map(|(_, v)| *v);
        Ok(self.failure_outcome(guard, raw, checked, frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{ExecOutcome, Heap, TraceInterpreter};
    use crate::ir::lowering::{LoweredTrace, Lowering};

    const SUM_LOOP: &str = "
        [i0, i1]
        label(i0, i1, descr=loop)
        i2 = int_add(i0, 1)
        i3 = int_add(i1, i0)
        i4 = int_lt(i2, 10)
        guard_true(i4) [i2, i3]
        jump(i2, i3, descr=loop)
    ";

    fn manager(config: JitConfig) -> CompilationManager<TraceInterpreter> {
        CompilationManager::new(TraceInterpreter::default(), config)
    }

    fn lower(manager: &CompilationManager<TraceInterpreter>, text: &str) -> LoweredTrace {
        let file = parser::parse_trace_file(text).unwrap();
        Lowering::new(manager.context().ids().clone())
            .with_tokens(manager.context().pseudo_tokens())
            .lower(&file)
            .unwrap()
    }

    fn run(manager: &CompilationManager<TraceInterpreter>, cell: &CellToken, args: &[i64]) -> ExecOutcome {
        let args: Vec<RuntimeValue> = args.iter().map(|v| RuntimeValue::Int(*v)).collect();
        manager.backend().execute(cell.entry, &args).unwrap()
    }

    #[test]
    fn test_loop_is_peeled_and_installed() {
        let manager = manager(JitConfig::development());
        let lowered = lower(&manager, SUM_LOOP);
        let cell = manager.compile_loop(&lowered.trace).unwrap();

        assert!(cell.start.is_some());
        assert!(cell.loop_token.is_some());
        assert_eq!(cell.inputs, vec![IrKind::Int, IrKind::Int]);
        assert_eq!(
            manager.context().cell_for_token(cell.start.as_ref().unwrap().id).map(|c| c.number),
            Some(cell.number)
        );
        assert_eq!(manager.statistics().loops_compiled, 1);
    }

    #[test]
    fn test_hot_guard_gets_a_bridge() {
        let manager = manager(JitConfig::development());
        let lowered = lower(&manager, SUM_LOOP);
        let cell = manager.compile_loop(&lowered.trace).unwrap();

        let mut failed = None;
        for round in 1..=2u64 {
            let ExecOutcome::GuardFailed { guard, frame } = run(&manager, &cell, &[0, 0]) else {
                panic!("loop must leave through its guard");
            };
            let outcome = manager.deoptimize(&guard, &frame).unwrap();
            assert_eq!(outcome.failures, round);
            assert_eq!(
                outcome.frames[0].values,
                vec![RuntimeValue::Int(10), RuntimeValue::Int(45)]
            );
            failed = Some((guard, outcome.action));
        }
        let (guard, action) = failed.unwrap();
        assert_eq!(action, GuardAction::CompileBridge);
        assert_eq!(
            manager.context().guard_state(guard.id()),
            Some(GuardState::BridgeRequested)
        );

        let (mut history, frames) = manager.start_bridge(&guard).unwrap();
        let sum = frames[0].values[1];
        let doubled = history
            .record(Opcode::IntMul, &[sum, IrValue::int(2)], None)
            .unwrap()
            .unwrap();
        history.finish(Some(doubled.into())).unwrap();
        let attached = manager
            .compile_bridge(&guard, &history.into_trace().unwrap())
            .unwrap();
        assert_eq!(
            manager.context().guard_state(guard.id()),
            Some(GuardState::BridgeAttached(attached.address))
        );

        assert!(matches!(
            run(&manager, &cell, &[0, 0]),
            ExecOutcome::Finished(Some(RuntimeValue::Int(90)))
        ));
        assert_eq!(
            manager.compile_bridge(&guard, &lowered.trace),
            Err(Rejected::BridgeAttached(guard.id()))
        );
    }

    #[test]
    fn test_pseudo_loop_jump_becomes_finish() {
        let manager = manager(JitConfig::development());
        let lowered = lower(
            &manager,
            "
            [i0]
            i1 = int_mul(i0, 7)
            jump(i1, descr=done_with_this_frame_int)
            ",
        );
        let cell = manager.compile_loop(&lowered.trace).unwrap();
        assert!(cell.start.is_none());
        assert!(matches!(
            run(&manager, &cell, &[6]),
            ExecOutcome::Finished(Some(RuntimeValue::Int(42)))
        ));
    }

    #[test]
    fn test_inline_branch_is_compiled_as_bridge() {
        let manager = manager(JitConfig::development());
        let lowered = lower(
            &manager,
            "
            [i0]
            i1 = int_lt(i0, 100)
            guard_true(i1) [i0] {
                i5 = int_sub(i0, 100)
                finish(i5)
            }
            i2 = int_add(i0, 1)
            finish(i2)
            ",
        );
        let cell = manager.compile_loop(&lowered.trace).unwrap();
        assert_eq!(manager.statistics().inline_bridges, 1);

        assert!(matches!(
            run(&manager, &cell, &[5]),
            ExecOutcome::Finished(Some(RuntimeValue::Int(6)))
        ));
        assert!(matches!(
            run(&manager, &cell, &[130]),
            ExecOutcome::Finished(Some(RuntimeValue::Int(30)))
        ));
    }

    #[test]
    fn test_rejections_are_counted_by_reason() {
        let manager = manager(JitConfig::development());
        let lowered = lower(
            &manager,
            "
            [i0]
            label(i0, descr=loop)
            guard_true(0) [i0]
            jump(i0, descr=loop)
            ",
        );
        let err = manager.compile_loop(&lowered.trace).unwrap_err();
        assert_eq!(err.reason(), "invalid_loop");

        let stats = manager.statistics();
        assert_eq!(stats.loops_compiled, 0);
        assert_eq!(stats.rejections.get("invalid_loop"), Some(&1));
        assert!(stats.format().contains("invalid_loop=1"));
        let json: serde_json::Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
        assert_eq!(json["rejections"]["invalid_loop"], 1);
        assert_eq!(json["profile_stats"]["total_loops"], 0);
    }

    #[test]
    fn test_bridge_in_progress_is_rejected() {
        let manager = manager(JitConfig::development());
        let lowered = lower(&manager, SUM_LOOP);
        let cell = manager.compile_loop(&lowered.trace).unwrap();
        let ExecOutcome::GuardFailed { guard, .. } = run(&manager, &cell, &[0, 0]) else {
            panic!("loop must leave through its guard");
        };

        manager.context().begin_bridge(guard.id()).unwrap();
        let (mut history, _) = manager.start_bridge(&guard).unwrap();
        history.finish(None).unwrap();
        let bridge = history.into_trace().unwrap();
        assert_eq!(
            manager.compile_bridge(&guard, &bridge),
            Err(Rejected::BridgeInProgress(guard.id()))
        );

        // a failed compile returns the guard to `Compiled` with a fresh counter
        manager.context().end_bridge(guard.id(), None);
        assert_eq!(manager.context().guard_state(guard.id()), Some(GuardState::Compiled));
        assert_eq!(manager.context().guard_failures(guard.id()), 0);
        assert!(manager.compile_bridge(&guard, &bridge).is_ok());
    }

    #[test]
    fn test_guard_value_counts_failing_values() {
        let manager = manager(JitConfig {
            profile: ProfileConfig {
                bridge_threshold: 3,
                ..ProfileConfig::development()
            },
            ..JitConfig::development()
        });
        let lowered = lower(
            &manager,
            "
            [i0]
            guard_value(i0, 1) [i0]
            finish(i0)
            ",
        );
        let cell = manager.compile_loop(&lowered.trace).unwrap();

        let mut heap = Heap::new();
        let mut last = None;
        for value in [2, 3, 2, 2] {
            let ExecOutcome::GuardFailed { guard, frame } = run(&manager, &cell, &[value]) else {
                panic!("guard_value must fail for {}", value);
            };
            let outcome = manager.handle_guard_failure(&guard, &frame, &mut heap).unwrap();
            last = Some((guard, outcome));
        }
        let (guard, outcome) = last.unwrap();
        assert_eq!(outcome.failures, 3);
        assert_eq!(outcome.action, GuardAction::CompileBridge);
        assert_eq!(
            manager.context().guard_values(guard.id()),
            vec![(RuntimeValue::Int(2), 3), (RuntimeValue::Int(3), 1)]
        );
        assert_eq!(manager.statistics().guard_failures, 4);
    }

    #[test]
    fn test_config_from_toml_keeps_defaults() {
        let config = JitConfig::from_toml(
            "
            validate = false

            [profile]
            bridge_threshold = 7

            [optimizer]
            unroll = false
            ",
        )
        .unwrap();
        assert!(!config.validate);
        assert_eq!(config.profile.bridge_threshold, 7);
        assert_eq!(config.profile.trace_threshold, ProfileConfig::default().trace_threshold);
        assert!(!config.optimizer.unroll);
        assert!(config.optimizer.virtuals);
        assert_eq!(config.backend, BackendLimits::default());
    }
}
