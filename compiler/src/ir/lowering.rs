//! Text to IR Lowering
//!
//! Turns a parsed trace file into a [`Trace`] by replaying it through a
//! [`History`], so textual traces obey the same arity, kind and nesting
//! rules as recorded ones. Descriptor declarations populate a fresh
//! [`LayoutRegistry`]; jump targets resolve against a token namespace that
//! callers may pre-populate (the compilation context's pseudo-loop tokens).

use super::{
    Descr, EffectInfo, GcRef, IdAllocator, IrBox, IrConst, IrKind, IrValue, LayoutRegistry,
    Opcode, TargetToken, Trace,
};
use crate::history::{History, DEFAULT_TRACE_LIMIT};
use crate::resume::{CodePosition, FrameState};
use fxhash::FxHashMap;
use indexmap::IndexMap;
use parser::{Arg, CallEffect, DescrDecl, DescrKind, OpLine, ParseError, TraceFile, ValueKind};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Functions without an explicit `addr=` get addresses from here on
const FUNCTION_BASE: usize = 0x7f00_0000;
const DEFAULT_STRUCT_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerError {
    pub line: usize,
    pub message: String,
}

impl LowerError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for LowerError {}

impl From<ParseError> for LowerError {
    fn from(err: ParseError) -> Self {
        LowerError::new(err.position.line, err.to_string())
    }
}

/// A trace built from text, with the descriptors and tokens it declared
#[derive(Debug)]
pub struct LoweredTrace {
    pub trace: Trace,
    pub layouts: LayoutRegistry,
    /// Function name to address
    pub functions: IndexMap<String, usize>,
    pub tokens: IndexMap<String, Arc<TargetToken>>,
    descrs: FxHashMap<String, Descr>,
}

impl LoweredTrace {
    pub fn descr(&self, name: &str) -> Option<&Descr> {
        self.descrs.get(name)
    }

    pub fn function_address(&self, name: &str) -> Option<usize> {
        self.functions.get(name).copied()
    }

    pub fn token(&self, name: &str) -> Option<&Arc<TargetToken>> {
        self.tokens.get(name)
    }
}

fn ir_kind(kind: ValueKind) -> IrKind {
    match kind {
        ValueKind::Int => IrKind::Int,
        ValueKind::Ref => IrKind::Ref,
        ValueKind::Float => IrKind::Float,
        ValueKind::Void => IrKind::Void,
    }
}

fn variable_kind(name: &str) -> Option<IrKind> {
    name.chars().next().and_then(IrKind::from_prefix)
}

type Scope = FxHashMap<String, IrValue>;

/// Builds IR from parsed trace files
pub struct Lowering {
    ids: Arc<IdAllocator>,
    layouts: LayoutRegistry,
    descrs: FxHashMap<String, Descr>,
    /// Class vtables and function addresses usable as `@name`
    addresses: FxHashMap<String, usize>,
    functions: IndexMap<String, usize>,
    tokens: IndexMap<String, Arc<TargetToken>>,
    start_label: Option<String>,
    limit: usize,
}

impl Lowering {
    pub fn new(ids: Arc<IdAllocator>) -> Self {
        Self {
            layouts: LayoutRegistry::new(ids.clone()),
            ids,
            descrs: FxHashMap::default(),
            addresses: FxHashMap::default(),
            functions: IndexMap::new(),
            tokens: IndexMap::new(),
            start_label: None,
            limit: DEFAULT_TRACE_LIMIT,
        }
    }

    /// Make `token` reachable as `descr=name` from jumps
    pub fn with_token(mut self, name: &str, token: Arc<TargetToken>) -> Self {
        self.tokens.insert(name.to_string(), token);
        self
    }

    pub fn with_tokens<'a>(
        mut self,
        tokens: impl IntoIterator<Item = (&'a str, Arc<TargetToken>)>,
    ) -> Self {
        for (name, token) in tokens {
            self.tokens.insert(name.to_string(), token);
        }
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn lower(mut self, file: &TraceFile) -> Result<LoweredTrace, LowerError> {
        for decl in &file.decls {
            self.declare(decl)?;
        }

        let first_line = file.ops.first().map_or(1, |op| op.line);
        let mut kinds = Vec::with_capacity(file.inputs.len());
        for name in &file.inputs {
            let kind = variable_kind(name)
                .ok_or_else(|| LowerError::new(first_line, format!("bad input name {}", name)))?;
            kinds.push(kind);
        }

        let (mut history, body) = match file.ops.first() {
            Some(op) if op.name == "label" => {
                let names: Vec<&str> = op
                    .args
                    .iter()
                    .filter_map(|a| match a {
                        Arg::Var(name) => Some(name.as_str()),
                        _ => None,
                    })
                    .collect();
                let inputs: Vec<&str> = file.inputs.iter().map(String::as_str).collect();
                if names != inputs || op.args.len() != inputs.len() {
                    return Err(LowerError::new(
                        op.line,
                        "the leading label must take exactly the inputs",
                    ));
                }
                let token = TargetToken::new(self.ids.token());
                if let Some(name) = &op.descr {
                    self.tokens.insert(name.clone(), token.clone());
                    self.start_label = Some(name.clone());
                }
                let history =
                    History::with_start_token(self.ids.clone(), &kinds, token, self.limit);
                (history, &file.ops[1..])
            }
            _ => (
                History::new_linear(self.ids.clone(), &kinds, self.limit),
                &file.ops[..],
            ),
        };

        let mut scope = Scope::default();
        for (name, input) in file.inputs.iter().zip(history.inputargs().to_vec()) {
            if scope.insert(name.clone(), input.into()).is_some() {
                return Err(LowerError::new(first_line, format!("input {} listed twice", name)));
            }
        }
        self.lower_ops(&mut history, &mut scope, body)?;

        let last_line = file.ops.last().map_or(first_line, |op| op.line);
        let trace = history
            .into_trace()
            .map_err(|e| LowerError::new(last_line, e.to_string()))?;
        debug!(
            "lowered trace: {} inputs, {} ops, {} branches",
            trace.inputargs.len(),
            trace.len(),
            trace.branches.len()
        );
        Ok(LoweredTrace {
            trace,
            layouts: self.layouts,
            functions: self.functions,
            tokens: self.tokens,
            descrs: self.descrs,
        })
    }

    fn declare(&mut self, decl: &DescrDecl) -> Result<(), LowerError> {
        if self.descrs.contains_key(&decl.name) {
            return Err(LowerError::new(
                decl.line,
                format!("descriptor {} declared twice", decl.name),
            ));
        }
        let descr = match &decl.kind {
            DescrKind::Struct { size, vtable } => {
                let size = size.map_or(DEFAULT_STRUCT_SIZE, |s| s as usize);
                let vtable = vtable.map(|v| v as usize);
                if let Some(vtable) = vtable {
                    self.addresses.insert(decl.name.clone(), vtable);
                }
                Descr::Size(self.layouts.size_descr(&decl.name, size, vtable))
            }
            DescrKind::Field {
                owner,
                kind,
                immutable,
            } => {
                let owner_descr = self.layouts.layout(owner).ok_or_else(|| {
                    LowerError::new(decl.line, format!("unknown struct {}", owner))
                })?;
                let kind = ir_kind(*kind);
                if kind == IrKind::Void {
                    return Err(LowerError::new(decl.line, "fields cannot be void"));
                }
                Descr::Field(
                    self.layouts
                        .add_field(&owner_descr, &decl.name, kind, *immutable),
                )
            }
            DescrKind::Array { item } => {
                let kind = ir_kind(*item);
                if kind == IrKind::Void {
                    return Err(LowerError::new(decl.line, "array items cannot be void"));
                }
                Descr::Array(self.layouts.add_array(&decl.name, kind))
            }
            DescrKind::Call {
                args,
                result,
                effect,
                raises,
                address,
            } => {
                let arg_kinds: Vec<IrKind> = args.iter().map(|k| ir_kind(*k)).collect();
                if arg_kinds.contains(&IrKind::Void) {
                    return Err(LowerError::new(decl.line, "call arguments cannot be void"));
                }
                let mut effect = match effect {
                    CallEffect::Unknown => EffectInfo::unknown(),
                    CallEffect::Elidable => EffectInfo::elidable(),
                    CallEffect::Writes(names) => {
                        let mut classes = Vec::with_capacity(names.len());
                        for name in names {
                            let class = self.layouts.effect_class_of(name).ok_or_else(|| {
                                LowerError::new(
                                    decl.line,
                                    format!("{} is not a field or array", name),
                                )
                            })?;
                            classes.push(class);
                        }
                        EffectInfo::writing(classes)
                    }
                };
                effect.may_raise |= *raises;
                let descr =
                    self.layouts
                        .add_call(&decl.name, arg_kinds, ir_kind(*result), effect);
                let address = address
                    .map(|a| a as usize)
                    .unwrap_or(FUNCTION_BASE + 16 * descr.id.0 as usize);
                self.addresses.insert(decl.name.clone(), address);
                self.functions.insert(decl.name.clone(), address);
                Descr::Call(descr)
            }
        };
        self.descrs.insert(decl.name.clone(), descr);
        Ok(())
    }

    fn value(&self, scope: &Scope, line: usize, arg: &Arg) -> Result<IrValue, LowerError> {
        let value = match arg {
            Arg::Var(name) => *scope
                .get(name)
                .ok_or_else(|| LowerError::new(line, format!("{} is not defined", name)))?,
            Arg::Int(v) => IrValue::int(*v),
            Arg::Float(v) => IrValue::Const(IrConst::Float(*v)),
            Arg::Null => IrValue::null(),
            Arg::Ptr(p) => IrValue::Const(IrConst::Ref(GcRef(*p as usize))),
            Arg::Addr(name) => {
                let address = self.addresses.get(name).ok_or_else(|| {
                    LowerError::new(line, format!("{} has no address", name))
                })?;
                IrValue::Const(IrConst::Addr(*address))
            }
        };
        Ok(value)
    }

    fn layout_descr(&self, op: &OpLine) -> Result<Option<Descr>, LowerError> {
        match &op.descr {
            Some(name) => self
                .descrs
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| LowerError::new(op.line, format!("unknown descriptor {}", name))),
            None => Ok(None),
        }
    }

    fn token(&self, op: &OpLine, name: &str) -> Result<Arc<TargetToken>, LowerError> {
        self.tokens
            .get(name)
            .cloned()
            .ok_or_else(|| LowerError::new(op.line, format!("unknown jump target {}", name)))
    }

    fn frames(&self, scope: &Scope, op: &OpLine) -> Result<Vec<FrameState>, LowerError> {
        let Some(frames) = &op.snapshot else {
            return Ok(Vec::new());
        };
        let mut states = Vec::with_capacity(frames.len());
        for frame in frames {
            let (code, pc) = frame.position.unwrap_or((0, 0));
            let mut values = Vec::with_capacity(frame.values.len());
            for value in &frame.values {
                values.push(self.value(scope, op.line, value)?);
            }
            states.push(FrameState::new(CodePosition::new(code, pc), values));
        }
        Ok(states)
    }

    fn lower_ops(
        &mut self,
        history: &mut History,
        scope: &mut Scope,
        ops: &[OpLine],
    ) -> Result<(), LowerError> {
        for op in ops {
            self.lower_op(history, scope, op)?;
        }
        Ok(())
    }

    fn lower_op(
        &mut self,
        history: &mut History,
        scope: &mut Scope,
        op: &OpLine,
    ) -> Result<(), LowerError> {
        let line = op.line;
        let record_err = |e: crate::history::RecordError| LowerError::new(line, e.to_string());
        let opcode = Opcode::from_name(&op.name)
            .ok_or_else(|| LowerError::new(line, format!("unknown operation {}", op.name)))?;
        let mut args = Vec::with_capacity(op.args.len());
        for arg in &op.args {
            args.push(self.value(scope, line, arg)?);
        }
        if op.snapshot.is_some() && !opcode.is_guard() {
            return Err(LowerError::new(line, "only guards carry snapshots"));
        }
        if op.branch.is_some() && !opcode.is_guard() {
            return Err(LowerError::new(line, "only guards can have a branch"));
        }
        if op.result.is_some() && !opcode.has_result() {
            return Err(LowerError::new(line, format!("{} has no result", opcode)));
        }

        match opcode {
            Opcode::Label => {
                let name = op
                    .descr
                    .clone()
                    .ok_or_else(|| LowerError::new(line, "label needs a descr"))?;
                let boxes: Option<Vec<IrBox>> = args.iter().map(|a| a.as_box()).collect();
                let boxes =
                    boxes.ok_or_else(|| LowerError::new(line, "label arguments must be boxes"))?;
                let token = TargetToken::new(self.ids.token());
                self.tokens.insert(name, token.clone());
                history.label(token, &boxes).map_err(record_err)
            }
            Opcode::Jump => match &op.descr {
                None => history.close_loop(&args).map_err(record_err),
                Some(name) if self.start_label.as_deref() == Some(name.as_str()) => {
                    history.close_loop(&args).map_err(record_err)
                }
                Some(name) => {
                    let token = self.token(op, name)?;
                    history.jump_to(token, &args).map_err(record_err)
                }
            },
            Opcode::Finish | Opcode::Fail => {
                if args.len() > 1 {
                    return Err(LowerError::new(line, format!("{} takes at most one value", opcode)));
                }
                let value = args.first().copied();
                if opcode == Opcode::Finish {
                    history.finish(value).map_err(record_err)
                } else {
                    history.fail(value).map_err(record_err)
                }
            }
            _ if opcode.is_guard() => {
                let frames = self.frames(scope, op)?;
                let guard = history
                    .record_guard(opcode, &args, &frames)
                    .map_err(record_err)?;
                if let Some(branch) = &op.branch {
                    // a bridge only sees what the guard's snapshot holds
                    let mut inner = Scope::default();
                    for frame in op.snapshot.iter().flatten() {
                        for value in &frame.values {
                            if let Arg::Var(name) = value {
                                if let Some(v) = scope.get(name) {
                                    inner.insert(name.clone(), *v);
                                }
                            }
                        }
                    }
                    let terminated = branch.last().is_some_and(|last| {
                        Opcode::from_name(&last.name).is_some_and(|o| o.is_terminal())
                    });
                    if !terminated {
                        return Err(LowerError::new(
                            line,
                            "a guard branch must end with jump, finish or fail",
                        ));
                    }
                    history.open_branch(guard).map_err(record_err)?;
                    self.lower_ops(history, &mut inner, branch)?;
                }
                Ok(())
            }
            _ => {
                let descr = self.layout_descr(op)?;
                let result = history.record(opcode, &args, descr).map_err(record_err)?;
                if let (Some(name), Some(result)) = (&op.result, result) {
                    if variable_kind(name) != Some(result.kind()) {
                        return Err(LowerError::new(
                            line,
                            format!("{} cannot hold the {} result of {}", name, result.kind(), opcode),
                        ));
                    }
                    if scope.insert(name.clone(), result.into()).is_some() {
                        return Err(LowerError::new(line, format!("{} defined twice", name)));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Parse and lower trace text in one step
pub fn lower_text(text: &str, ids: Arc<IdAllocator>) -> Result<LoweredTrace, LowerError> {
    let file = parser::parse_trace_file(text)?;
    Lowering::new(ids).lower(&file)
}
