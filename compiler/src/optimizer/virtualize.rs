//! Allocation removal
//!
//! Objects allocated in the trace stay virtual while only the trace looks at
//! them. Any use that lets an object escape forces it: the allocation and the
//! stores of its current contents are emitted right before the escaping use.

use super::{Chain, InvalidLoop, OptState, OptimizationPass, PtrInfo, VirtualObject};
use crate::ir::{Descr, IrKind, IrValue, Opcode, Operation, SizeDescr};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct Virtualize;

impl Virtualize {
    pub fn new() -> Self {
        Self
    }
}

fn is_zero(value: IrValue) -> bool {
    matches!(value, IrValue::Const(c) if c.to_bits() == 0)
}

/// Emit the allocation of `value` and its contents if it is still virtual
pub(super) fn force_value(
    state: &mut OptState,
    next: &mut Chain<'_>,
    value: IrValue,
) -> Result<IrValue, InvalidLoop> {
    let value = state.get_replacement(value);
    let IrValue::Box(b) = value else {
        return Ok(value);
    };
    // non-virtual from here on so cycles terminate
    let Some(object) = state.take_virtual(b) else {
        return Ok(value);
    };
    debug!("forcing virtual {}", b);
    state.stats.bump("virtualize.force");
    match object {
        VirtualObject::Struct { descr, fields } => {
            let opcode = if descr.vtable.is_some() {
                Opcode::NewWithVtable
            } else {
                Opcode::New
            };
            next.emit(
                Operation::new(opcode, [], Some(b), Some(Descr::Size(descr))),
                state,
            )?;
            for (_, (field, field_value)) in fields {
                let field_value = force_value(state, next, field_value)?;
                if is_zero(field_value) {
                    continue;
                }
                next.emit(
                    Operation::new(
                        Opcode::SetfieldGc,
                        [value, field_value],
                        None,
                        Some(Descr::Field(field)),
                    ),
                    state,
                )?;
            }
        }
        VirtualObject::Array { descr, items } => {
            next.emit(
                Operation::new(
                    Opcode::NewArray,
                    [IrValue::int(items.len() as i64)],
                    Some(b),
                    Some(Descr::Array(descr.clone())),
                ),
                state,
            )?;
            for (index, item) in items.into_iter().enumerate() {
                let item = force_value(state, next, item)?;
                if is_zero(item) {
                    continue;
                }
                next.emit(
                    Operation::new(
                        Opcode::SetarrayitemGc,
                        [value, IrValue::int(index as i64), item],
                        None,
                        Some(Descr::Array(descr.clone())),
                    ),
                    state,
                )?;
            }
        }
    }
    Ok(value)
}

fn force_args(
    op: Operation,
    state: &mut OptState,
    next: &mut Chain<'_>,
) -> Result<Operation, InvalidLoop> {
    if !op.args.iter().any(|a| state.is_virtual(*a)) {
        return Ok(op);
    }
    let mut args = op.args.clone();
    for arg in args.iter_mut() {
        if arg.kind() == IrKind::Ref {
            *arg = force_value(state, next, *arg)?;
        }
    }
    Ok(op.with_args(args))
}

fn out_of_range(op: &Operation, index: i64, len: usize) -> InvalidLoop {
    InvalidLoop::new(format!("{}: index {} outside virtual array of {}", op, index, len))
}

impl OptimizationPass for Virtualize {
    fn name(&self) -> &'static str {
        "virtualize"
    }

    fn propagate_forward(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop> {
        use Opcode::*;

        match op.opcode {
            New | NewWithVtable => {
                let descr: Option<Arc<SizeDescr>> = op.descr.as_ref().and_then(|d| d.as_size()).cloned();
                if let (Some(descr), Some(result)) = (descr, op.result) {
                    trace!("virtualize: {} is virtual", result);
                    state.set_ptr_info(
                        result,
                        PtrInfo::Virtual(VirtualObject::Struct {
                            descr,
                            fields: IndexMap::new(),
                        }),
                    );
                    state.stats.removed("virtualize.alloc");
                    return Ok(());
                }
            }
            NewArray => {
                let descr = op.descr.as_ref().and_then(|d| d.as_array()).cloned();
                let length = op.arg(0).as_int();
                if let (Some(descr), Some(length), Some(result)) = (descr, length, op.result) {
                    if length >= 0 && length as usize <= state.config.max_virtual_array {
                        let zero = descr
                            .item_kind
                            .zero()
                            .map(IrValue::Const)
                            .unwrap_or(IrValue::int(0));
                        state.set_ptr_info(
                            result,
                            PtrInfo::Virtual(VirtualObject::Array {
                                descr,
                                items: vec![zero; length as usize],
                            }),
                        );
                        state.stats.removed("virtualize.alloc");
                        return Ok(());
                    }
                }
            }
            GetfieldGcI | GetfieldGcR | GetfieldGcF => {
                let field = op.descr.as_ref().and_then(|d| d.as_field()).cloned();
                if let (Some(field), Some(result)) = (field, op.result) {
                    if let Some(object) = state.virtual_object(op.arg(0)) {
                        let value = object.field(&field);
                        state.make_equal_to(result, value)?;
                        state.stats.removed("virtualize.getfield");
                        return Ok(());
                    }
                }
            }
            SetfieldGc => {
                let field = op.descr.as_ref().and_then(|d| d.as_field()).cloned();
                let value = op.arg(1);
                if let (Some(field), Some(VirtualObject::Struct { fields, .. })) =
                    (field, state.virtual_object_mut(op.arg(0)))
                {
                    fields.insert(field.id, (field, value));
                    state.stats.removed("virtualize.setfield");
                    return Ok(());
                }
            }
            GetarrayitemGcI | GetarrayitemGcR | GetarrayitemGcF => {
                if let (Some(index), Some(result)) = (op.arg(1).as_int(), op.result) {
                    if let Some(VirtualObject::Array { items, .. }) = state.virtual_object(op.arg(0)) {
                        let item = usize::try_from(index)
                            .ok()
                            .and_then(|i| items.get(i).copied())
                            .ok_or_else(|| out_of_range(&op, index, items.len()))?;
                        state.make_equal_to(result, item)?;
                        state.stats.removed("virtualize.getarrayitem");
                        return Ok(());
                    }
                }
            }
            SetarrayitemGc => {
                if let Some(index) = op.arg(1).as_int() {
                    let value = op.arg(2);
                    if let Some(VirtualObject::Array { items, .. }) = state.virtual_object_mut(op.arg(0)) {
                        let len = items.len();
                        let slot = usize::try_from(index)
                            .ok()
                            .and_then(|i| items.get_mut(i))
                            .ok_or_else(|| out_of_range(&op, index, len))?;
                        *slot = value;
                        state.stats.removed("virtualize.setarrayitem");
                        return Ok(());
                    }
                }
            }
            ArraylenGc => {
                if let (Some(VirtualObject::Array { items, .. }), Some(result)) =
                    (state.virtual_object(op.arg(0)), op.result)
                {
                    let len = items.len() as i64;
                    state.make_equal_to(result, IrValue::int(len))?;
                    state.stats.removed("virtualize.arraylen");
                    return Ok(());
                }
            }
            _ => {}
        }

        let op = force_args(op, state, next)?;
        next.emit(op, state)
    }
}
