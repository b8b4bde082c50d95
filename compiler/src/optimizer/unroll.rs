//! Loop peeling
//!
//! A loop trace is optimized twice. The first copy (the preamble) runs once
//! and computes everything the loop needs; the second copy (the body) is the
//! loop proper and starts at a new label. What the preamble proved about the
//! values it passes to the body is exported as entry states, and results of
//! loop-invariant pure operations and heap reads are passed along as extra
//! label arguments ("short boxes"), so the body never recomputes them.
//!
//! The body must hand the same entry states back to its own label. When it
//! does not, the entry states are generalized and the body is optimized
//! again; after too many attempts the loop is compiled without peeling.
//!
//! Output layout:
//!
//! ```text
//! label(start, inputs...)
//!   preamble
//! jump(loop, preamble end values...)
//! label(loop, label args...)
//!   body
//! jump(loop, body end values...)
//! ```

use super::virtual_state::{export_state, shared_virtuals, EntryState, PtrFact};
use super::{
    optimize_linear, InvalidLoop, OptState, OptimizationResult, Optimizer, OptimizerConfig,
    PtrInfo, PureKey, VirtualObject,
};
use crate::ir::{
    ArrayDescr, BoxFactory, Descr, FieldDescr, IdAllocator, IrBox, IrConst, IrId, IrKind,
    IrValue, Opcode, Operation, TargetToken, Trace,
};
use crate::resume::FailDescr;
use fxhash::{FxHashMap, FxHashSet};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Optimizer output for one trace
#[derive(Debug, Clone)]
pub struct OptimizedTrace {
    pub trace: Trace,
    /// Label the peeled body starts at; `None` when the trace was not peeled
    pub loop_token: Option<Arc<TargetToken>>,
    pub stats: OptimizationResult,
}

#[derive(Debug, Clone)]
enum ShortArg {
    /// Loop-invariant input position
    Input(usize),
    Const(IrConst),
}

#[derive(Debug, Clone)]
enum ShortOp {
    Pure {
        opcode: Opcode,
        args: Vec<ShortArg>,
        descr: Option<Descr>,
    },
    Field {
        object: ShortArg,
        descr: Arc<FieldDescr>,
    },
    ArrayItem {
        array: ShortArg,
        descr: Arc<ArrayDescr>,
        index: i64,
    },
}

/// A preamble result passed to the body as an extra label argument
#[derive(Debug, Clone)]
struct ShortBox {
    op: ShortOp,
    kind: IrKind,
    fact: EntryState,
    preamble_value: IrValue,
}

impl ShortBox {
    fn resolve(arg: &ShortArg, positions: &[IrValue]) -> IrValue {
        match arg {
            ShortArg::Input(i) => positions[*i],
            ShortArg::Const(c) => IrValue::Const(*c),
        }
    }

    fn inputs(&self) -> Vec<usize> {
        let args: Vec<&ShortArg> = match &self.op {
            ShortOp::Pure { args, .. } => args.iter().collect(),
            ShortOp::Field { object, .. } => vec![object],
            ShortOp::ArrayItem { array, .. } => vec![array],
        };
        args.into_iter()
            .filter_map(|a| match a {
                ShortArg::Input(i) => Some(*i),
                ShortArg::Const(_) => None,
            })
            .collect()
    }

    /// The operation recomputing this value from `positions`
    fn operation(&self, positions: &[IrValue], result: IrBox) -> Operation {
        match &self.op {
            ShortOp::Pure {
                opcode,
                args,
                descr,
            } => Operation::new(
                *opcode,
                args.iter().map(|a| Self::resolve(a, positions)),
                Some(result),
                descr.clone(),
            ),
            ShortOp::Field { object, descr } => Operation::new(
                Opcode::getfield_for(descr.kind),
                [Self::resolve(object, positions)],
                Some(result),
                Some(Descr::Field(descr.clone())),
            ),
            ShortOp::ArrayItem {
                array,
                descr,
                index,
            } => Operation::new(
                Opcode::getarrayitem_for(descr.item_kind),
                [Self::resolve(array, positions), IrValue::int(*index)],
                Some(result),
                Some(Descr::Array(descr.clone())),
            ),
        }
    }

    /// Tell the body's caches that this computation already produced `value`
    fn seed(&self, state: &mut OptState, positions: &[IrValue], value: IrValue) {
        match &self.op {
            ShortOp::Pure {
                opcode,
                args,
                descr,
            } => {
                let key = PureKey::new(
                    *opcode,
                    args.iter().map(|a| Self::resolve(a, positions)),
                    descr.as_ref(),
                );
                state.pure.insert(key, value, descr.clone());
            }
            ShortOp::Field { object, descr } => {
                state
                    .heap
                    .set_field(Self::resolve(object, positions), descr, value);
            }
            ShortOp::ArrayItem {
                array,
                descr,
                index,
            } => {
                state
                    .heap
                    .set_array_item(Self::resolve(array, positions), descr, *index, value);
            }
        }
    }
}

fn collect_shorts(
    state: &OptState,
    inputs: &[IrValue],
    end_values: &[IrValue],
    limit: usize,
) -> Vec<ShortBox> {
    let mut invariant: FxHashMap<IrValue, usize> = FxHashMap::default();
    for (position, (input, end)) in inputs.iter().zip(end_values).enumerate() {
        let start = state.get_replacement(*input);
        if start == *end && !start.is_const() && !state.is_virtual(start) {
            invariant.entry(start).or_insert(position);
        }
    }
    let short_arg = |value: IrValue| match state.get_replacement(value) {
        IrValue::Const(c) => Some(ShortArg::Const(c)),
        other => invariant.get(&other).map(|&i| ShortArg::Input(i)),
    };

    let mut candidates: Vec<(ShortOp, IrValue)> = Vec::new();
    for (key, descr, value) in state.pure.iter() {
        if key.opcode.is_call() || key.opcode.is_ovf() {
            continue;
        }
        let args: Option<Vec<ShortArg>> = key.args.iter().map(|a| short_arg(*a)).collect();
        if let Some(args) = args {
            let op = ShortOp::Pure {
                opcode: key.opcode,
                args,
                descr: descr.cloned(),
            };
            candidates.push((op, value));
        }
    }
    for (descr, object, value) in state.heap.fields() {
        if let Some(object) = short_arg(object) {
            let op = ShortOp::Field {
                object,
                descr: descr.clone(),
            };
            candidates.push((op, value));
        }
    }
    for (descr, array, index, value) in state.heap.array_items() {
        if let Some(array) = short_arg(array) {
            let op = ShortOp::ArrayItem {
                array,
                descr: descr.clone(),
                index,
            };
            candidates.push((op, value));
        }
    }

    let mut shorts = Vec::new();
    for (op, value) in candidates {
        let value = state.get_replacement(value);
        let IrValue::Box(b) = value else {
            continue;
        };
        if state.is_virtual(value) || invariant.contains_key(&value) {
            continue;
        }
        if shorts.len() == limit {
            break;
        }
        shorts.push(ShortBox {
            op,
            kind: b.kind(),
            fact: export_state(state, value),
            preamble_value: value,
        });
    }
    shorts
}

/// Materialize an entry state in the body: leaves become label arguments
fn import(
    state: &mut OptState,
    entry: &EntryState,
    label_args: &mut Vec<IrBox>,
) -> Result<IrValue, InvalidLoop> {
    match entry {
        EntryState::Const(c) => Ok(IrValue::Const(*c)),
        EntryState::Int(bound) => {
            let b = state.fresh_box(IrKind::Int);
            label_args.push(b);
            if let Some(c) = bound.constant() {
                return Ok(IrValue::int(c));
            }
            state.intersect_bound(b.into(), *bound)?;
            Ok(b.into())
        }
        EntryState::Ptr(fact) => {
            let b = state.fresh_box(IrKind::Ref);
            label_args.push(b);
            match fact {
                PtrFact::Unknown => {}
                PtrFact::NonNull => state.mark_nonnull(b.into()),
                PtrFact::Class(vtable) => state.mark_class(b.into(), *vtable),
            }
            Ok(b.into())
        }
        EntryState::Float => {
            let b = state.fresh_box(IrKind::Float);
            label_args.push(b);
            Ok(b.into())
        }
        EntryState::VirtualStruct { descr, fields } => {
            let b = state.fresh_box(IrKind::Ref);
            let mut values = IndexMap::new();
            for (field, field_state) in fields {
                let value = import(state, field_state, label_args)?;
                values.insert(field.id, (field.clone(), value));
            }
            state.set_ptr_info(
                b,
                PtrInfo::Virtual(VirtualObject::Struct {
                    descr: descr.clone(),
                    fields: values,
                }),
            );
            Ok(b.into())
        }
        EntryState::VirtualArray { descr, items } => {
            let b = state.fresh_box(IrKind::Ref);
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(import(state, item, label_args)?);
            }
            state.set_ptr_info(
                b,
                PtrInfo::Virtual(VirtualObject::Array {
                    descr: descr.clone(),
                    items: values,
                }),
            );
            Ok(b.into())
        }
    }
}

fn zero_value(kind: IrKind) -> IrValue {
    kind.zero().map(IrValue::Const).unwrap_or(IrValue::int(0))
}

fn is_zero(value: IrValue) -> bool {
    matches!(value, IrValue::Const(c) if c.to_bits() == 0)
}

/// Check that `value` satisfies `entry`, appending its leaves to `out`
fn match_state(
    opt: &mut Optimizer,
    entry: &EntryState,
    value: IrValue,
    out: &mut Vec<IrValue>,
    visited: &mut FxHashSet<IrId>,
) -> Result<bool, InvalidLoop> {
    let value = opt.state.get_replacement(value);
    match entry {
        EntryState::Const(c) => Ok(value == IrValue::Const(*c)),
        EntryState::Int(bound) => {
            let ok = value.kind() == IrKind::Int
                && match value {
                    IrValue::Const(c) => c.as_int().map_or(false, |v| bound.contains(v)),
                    IrValue::Box(_) => bound.contains_bound(&opt.state.bound(value)),
                };
            if ok {
                out.push(value);
            }
            Ok(ok)
        }
        EntryState::Float => {
            out.push(value);
            Ok(value.kind() == IrKind::Float)
        }
        EntryState::Ptr(fact) => {
            if value.kind() != IrKind::Ref {
                return Ok(false);
            }
            if let IrValue::Box(b) = value {
                if visited.contains(&b.id()) {
                    return Ok(false);
                }
            }
            let value = opt.force(value)?;
            let ok = match fact {
                PtrFact::Unknown => true,
                PtrFact::NonNull => opt.state.is_nonnull(value),
                PtrFact::Class(vtable) => opt.state.known_class(value) == Some(*vtable),
            };
            if ok {
                out.push(value);
            }
            Ok(ok)
        }
        EntryState::VirtualStruct { descr, fields } => {
            let Some(VirtualObject::Struct {
                descr: actual_descr,
                fields: actual,
            }) = opt.state.virtual_object(value).cloned()
            else {
                return Ok(false);
            };
            let IrValue::Box(b) = value else {
                return Ok(false);
            };
            if actual_descr.id != descr.id || !visited.insert(b.id()) {
                return Ok(false);
            }
            let unexpected = actual
                .iter()
                .any(|(id, (_, v))| !is_zero(*v) && !fields.iter().any(|(f, _)| f.id == *id));
            if unexpected {
                return Ok(false);
            }
            for (field, field_state) in fields {
                let field_value = actual
                    .get(&field.id)
                    .map(|(_, v)| *v)
                    .unwrap_or_else(|| zero_value(field.kind));
                if !match_state(opt, field_state, field_value, out, visited)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        EntryState::VirtualArray { descr, items } => {
            let Some(VirtualObject::Array {
                descr: actual_descr,
                items: actual,
            }) = opt.state.virtual_object(value).cloned()
            else {
                return Ok(false);
            };
            let IrValue::Box(b) = value else {
                return Ok(false);
            };
            if actual_descr.id != descr.id || actual.len() != items.len() || !visited.insert(b.id())
            {
                return Ok(false);
            }
            for (item_state, item) in items.iter().zip(actual) {
                if !match_state(opt, item_state, item, out, visited)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

enum BodyOutcome {
    Done(Optimizer),
    /// The body could not close the loop; carries its end states when it got that far
    Mismatch(Option<Vec<EntryState>>),
}

struct Peeler<'t> {
    trace: &'t Trace,
    config: OptimizerConfig,
    ids: Arc<IdAllocator>,
    loop_token: Arc<TargetToken>,
}

impl Peeler<'_> {
    fn body_ops(&self) -> &[Operation] {
        &self.trace.ops[1..self.trace.len() - 1]
    }

    fn raw_inputs(&self) -> Vec<IrValue> {
        self.trace.ops[0].args.to_vec()
    }

    fn raw_end(&self) -> Vec<IrValue> {
        self.trace.ops[self.trace.len() - 1].args.to_vec()
    }

    fn optimize_body(
        &self,
        boxes: &BoxFactory,
        entry: &[EntryState],
        shorts: &[ShortBox],
    ) -> BodyOutcome {
        match self.try_body(boxes, entry, shorts) {
            Ok(outcome) => outcome,
            Err(invalid) => {
                debug!("peeled body rejected: {}", invalid);
                BodyOutcome::Mismatch(None)
            }
        }
    }

    fn try_body(
        &self,
        boxes: &BoxFactory,
        entry: &[EntryState],
        shorts: &[ShortBox],
    ) -> Result<BodyOutcome, InvalidLoop> {
        let mut body = Optimizer::new(self.config, self.ids.clone(), boxes.clone());

        let mut label_args = Vec::new();
        let mut positions = Vec::with_capacity(entry.len());
        for state in entry {
            positions.push(import(&mut body.state, state, &mut label_args)?);
        }
        for short in shorts {
            let value = import(&mut body.state, &short.fact, &mut label_args)?;
            short.seed(&mut body.state, &positions, value);
        }
        body.emit_direct(Operation::new(
            Opcode::Label,
            label_args.iter().map(|b| IrValue::Box(*b)),
            None,
            Some(Descr::Target(self.loop_token.clone())),
        ));

        for (input, value) in self.raw_inputs().into_iter().zip(&positions) {
            if let IrValue::Box(input) = input {
                body.state.alias(input, *value);
            }
        }

        for op in self.body_ops() {
            let mut op = op.clone();
            if let Some(result) = op.result {
                let fresh = body.state.fresh_box(result.kind());
                body.state.alias(result, fresh.into());
                op.result = Some(fresh);
            }
            if let Some(raw) = op.fail_descr() {
                let copy = FailDescr::recorded(self.ids.fail(), op.opcode, raw.snapshot().clone());
                op.descr = Some(Descr::Fail(copy));
            }
            body.send(op)?;
        }
        body.flush()?;

        let end_values: Vec<IrValue> = self
            .raw_end()
            .into_iter()
            .map(|v| body.state.get_replacement(v))
            .collect();
        let end_states: Vec<EntryState> = end_values
            .iter()
            .map(|v| export_state(&body.state, *v))
            .collect();

        let mut jump_args = Vec::new();
        let mut visited = FxHashSet::default();
        for (state, value) in entry.iter().zip(&end_values) {
            if !match_state(&mut body, state, *value, &mut jump_args, &mut visited)? {
                debug!("end value {} does not match entry state {}", value, state);
                return Ok(BodyOutcome::Mismatch(Some(end_states)));
            }
        }

        let positions: Vec<IrValue> = positions
            .iter()
            .map(|v| body.state.get_replacement(*v))
            .collect();
        for short in shorts {
            if short.inputs().iter().any(|&i| end_values[i] != positions[i]) {
                return Ok(BodyOutcome::Mismatch(Some(end_states)));
            }
            let result = body.state.fresh_box(short.kind);
            body.send(short.operation(&positions, result))?;
            jump_args.push(body.state.get_replacement(result.into()));
        }

        body.emit_direct(Operation::new(
            Opcode::Jump,
            jump_args,
            None,
            Some(Descr::Target(self.loop_token.clone())),
        ));
        Ok(BodyOutcome::Done(body))
    }

    fn peel(&self) -> Result<Option<OptimizedTrace>, InvalidLoop> {
        let mut pre = Optimizer::new(self.config, self.ids.clone(), self.trace.boxes.clone());
        pre.emit_direct(self.trace.ops[0].clone());
        for op in self.body_ops() {
            pre.send(op.clone())?;
        }
        pre.flush()?;

        let end_values: Vec<IrValue> = self
            .raw_end()
            .into_iter()
            .map(|v| pre.state.get_replacement(v))
            .collect();
        for shared in shared_virtuals(&pre.state, &end_values) {
            pre.force(shared)?;
        }
        let kinds: Vec<IrKind> = self.raw_end().iter().map(|v| v.kind()).collect();
        let mut entry: Vec<EntryState> = end_values
            .iter()
            .map(|v| export_state(&pre.state, *v))
            .collect();
        let mut shorts = collect_shorts(
            &pre.state,
            &self.raw_inputs(),
            &end_values,
            self.config.max_short_boxes,
        );
        let boxes = pre.state.boxes().clone();

        for attempt in 0..=self.config.max_retrace {
            match self.optimize_body(&boxes, &entry, &shorts) {
                BodyOutcome::Done(body) => {
                    let mut jump_args = Vec::new();
                    let mut visited = FxHashSet::default();
                    for (state, value) in entry.iter().zip(&end_values) {
                        match match_state(&mut pre, state, *value, &mut jump_args, &mut visited) {
                            Ok(true) => {}
                            _ => return Ok(None),
                        }
                    }
                    jump_args.extend(shorts.iter().map(|s| s.preamble_value));
                    pre.emit_direct(Operation::new(
                        Opcode::Jump,
                        jump_args,
                        None,
                        Some(Descr::Target(self.loop_token.clone())),
                    ));

                    let (mut ops, _, pre_stats) = pre.into_parts();
                    let (body_ops, boxes, body_stats) = body.into_parts();
                    ops.extend(body_ops);
                    let mut optimized = Trace::new(self.trace.inputargs.clone(), ops, boxes);
                    optimized.branches = self.trace.branches.clone();
                    let mut stats = pre_stats.combine(body_stats);
                    stats.bump("unroll.peeled");
                    *stats.stats.entry("unroll.retrace".to_string()).or_insert(0) += attempt;
                    info!(
                        "peeled loop after {} retrace(s): {} short box(es), {} ops",
                        attempt,
                        shorts.len(),
                        optimized.len()
                    );
                    return Ok(Some(OptimizedTrace {
                        trace: optimized,
                        loop_token: Some(self.loop_token.clone()),
                        stats,
                    }));
                }
                BodyOutcome::Mismatch(end_states) => {
                    let generalized: Vec<EntryState> = match end_states {
                        Some(end) => entry
                            .iter()
                            .zip(&end)
                            .zip(&kinds)
                            .map(|((a, b), kind)| a.join(b, *kind))
                            .collect(),
                        None => kinds.iter().map(|k| EntryState::generic(*k)).collect(),
                    };
                    if generalized == entry && shorts.is_empty() {
                        debug!("entry states reached a fixed point without closing the loop");
                        break;
                    }
                    entry = generalized;
                    shorts.clear();
                }
            }
        }
        Ok(None)
    }
}

/// Optimize a trace, peeling one iteration off loops
pub fn optimize_trace(
    trace: &Trace,
    config: &OptimizerConfig,
    ids: &Arc<IdAllocator>,
) -> Result<OptimizedTrace, InvalidLoop> {
    let peelable = config.unroll && trace.is_loop() && trace.labels().count() == 1;
    if peelable {
        let peeler = Peeler {
            trace,
            config: *config,
            ids: ids.clone(),
            loop_token: TargetToken::new(ids.token()),
        };
        if let Some(optimized) = peeler.peel()? {
            return Ok(optimized);
        }
        debug!("loop could not be peeled; optimizing without a preamble");
    }
    let (optimized, mut stats) = optimize_linear(trace, config, ids)?;
    if peelable {
        stats.bump("unroll.fallback");
    }
    Ok(OptimizedTrace {
        trace: optimized,
        loop_token: None,
        stats,
    })
}
