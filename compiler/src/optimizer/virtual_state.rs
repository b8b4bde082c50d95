//! Loop entry states
//!
//! An entry state describes what the peeled loop body may assume about one
//! value arriving at its label. Both edges into the label (the end of the
//! preamble and the back edge) must satisfy it.

use super::{IntBound, OptState, PtrInfo, VirtualObject};
use crate::ir::{ArrayDescr, FieldDescr, IrConst, IrId, IrKind, IrValue, SizeDescr};
use fxhash::FxHashSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrFact {
    Unknown,
    NonNull,
    Class(usize),
}

impl PtrFact {
    fn join(self, other: PtrFact) -> PtrFact {
        match (self, other) {
            (PtrFact::Class(a), PtrFact::Class(b)) if a == b => PtrFact::Class(a),
            (PtrFact::Unknown, _) | (_, PtrFact::Unknown) => PtrFact::Unknown,
            _ => PtrFact::NonNull,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryState {
    Const(IrConst),
    Int(IntBound),
    Ptr(PtrFact),
    Float,
    VirtualStruct {
        descr: Arc<SizeDescr>,
        fields: Vec<(Arc<FieldDescr>, EntryState)>,
    },
    VirtualArray {
        descr: Arc<ArrayDescr>,
        items: Vec<EntryState>,
    },
}

impl EntryState {
    /// State that holds for any value of `kind`
    pub fn generic(kind: IrKind) -> EntryState {
        match kind {
            IrKind::Ref => EntryState::Ptr(PtrFact::Unknown),
            IrKind::Float => EntryState::Float,
            IrKind::Int | IrKind::Void => EntryState::Int(IntBound::FULL),
        }
    }

    fn ptr_fact(&self) -> PtrFact {
        match self {
            EntryState::Const(c) if c.is_null() => PtrFact::Unknown,
            EntryState::Const(_) => PtrFact::NonNull,
            EntryState::Ptr(fact) => *fact,
            EntryState::VirtualStruct { descr, .. } => match descr.vtable {
                Some(vtable) => PtrFact::Class(vtable),
                None => PtrFact::NonNull,
            },
            EntryState::VirtualArray { .. } => PtrFact::NonNull,
            _ => PtrFact::Unknown,
        }
    }

    fn int_bound(&self) -> Option<IntBound> {
        match self {
            EntryState::Const(c) => c.as_int().map(IntBound::exact),
            EntryState::Int(bound) => Some(*bound),
            _ => None,
        }
    }

    /// Smallest state (up to widening) covering both `self` and `other`
    pub fn join(&self, other: &EntryState, kind: IrKind) -> EntryState {
        if self == other {
            return self.clone();
        }
        match (self, other) {
            (
                EntryState::VirtualStruct { descr, fields },
                EntryState::VirtualStruct {
                    descr: other_descr,
                    fields: other_fields,
                },
            ) if descr.id == other_descr.id => {
                let mut joined: Vec<(Arc<FieldDescr>, EntryState)> = Vec::new();
                let zero = |f: &FieldDescr| {
                    f.kind
                        .zero()
                        .map(EntryState::Const)
                        .unwrap_or_else(|| EntryState::generic(f.kind))
                };
                for (field, state) in fields {
                    let theirs = other_fields
                        .iter()
                        .find(|(f, _)| f.id == field.id)
                        .map(|(_, s)| s.clone())
                        .unwrap_or_else(|| zero(field));
                    joined.push((field.clone(), state.join(&theirs, field.kind)));
                }
                for (field, state) in other_fields {
                    if !fields.iter().any(|(f, _)| f.id == field.id) {
                        joined.push((field.clone(), zero(field).join(state, field.kind)));
                    }
                }
                EntryState::VirtualStruct {
                    descr: descr.clone(),
                    fields: joined,
                }
            }
            (
                EntryState::VirtualArray { descr, items },
                EntryState::VirtualArray {
                    descr: other_descr,
                    items: other_items,
                },
            ) if descr.id == other_descr.id && items.len() == other_items.len() => {
                EntryState::VirtualArray {
                    descr: descr.clone(),
                    items: items
                        .iter()
                        .zip(other_items)
                        .map(|(a, b)| a.join(b, descr.item_kind))
                        .collect(),
                }
            }
            _ => match kind {
                IrKind::Ref => EntryState::Ptr(self.ptr_fact().join(other.ptr_fact())),
                IrKind::Float => EntryState::Float,
                IrKind::Int | IrKind::Void => match (self.int_bound(), other.int_bound()) {
                    (Some(a), Some(b)) => EntryState::Int(a.widen(&b)),
                    _ => EntryState::Int(IntBound::FULL),
                },
            },
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryState::Const(c) => write!(f, "{}", c),
            EntryState::Int(bound) => write!(f, "int{}", bound),
            EntryState::Ptr(PtrFact::Unknown) => f.write_str("ptr"),
            EntryState::Ptr(PtrFact::NonNull) => f.write_str("ptr!"),
            EntryState::Ptr(PtrFact::Class(vtable)) => write!(f, "ptr<{:#x}>", vtable),
            EntryState::Float => f.write_str("float"),
            EntryState::VirtualStruct { descr, fields } => {
                write!(f, "virtual {}(", descr.name)?;
                for (i, (field, state)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}={}", field.name, state)?;
                }
                f.write_str(")")
            }
            EntryState::VirtualArray { descr, items } => {
                write!(f, "virtual {}[", descr.name)?;
                for (i, state) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", state)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Virtual objects reachable from `roots` more than once (shared or cyclic)
pub fn shared_virtuals(state: &OptState, roots: &[IrValue]) -> Vec<IrValue> {
    let mut seen = FxHashSet::default();
    let mut shared = Vec::new();
    let mut stack: Vec<IrValue> = roots.iter().rev().copied().collect();
    while let Some(value) = stack.pop() {
        let value = state.get_replacement(value);
        let Some(object) = state.virtual_object(value) else {
            continue;
        };
        let IrValue::Box(b) = value else {
            continue;
        };
        if !seen.insert(b.id()) {
            if !shared.contains(&value) {
                shared.push(value);
            }
            continue;
        }
        match object {
            VirtualObject::Struct { fields, .. } => {
                stack.extend(fields.values().rev().map(|(_, v)| *v));
            }
            VirtualObject::Array { items, .. } => stack.extend(items.iter().rev().copied()),
        }
    }
    shared
}

/// Describe `value` as an entry state
pub fn export_state(state: &OptState, value: IrValue) -> EntryState {
    let mut visiting = FxHashSet::default();
    export(state, value, &mut visiting)
}

fn export(state: &OptState, value: IrValue, visiting: &mut FxHashSet<IrId>) -> EntryState {
    let value = state.get_replacement(value);
    let b = match value {
        IrValue::Const(c) => return EntryState::Const(c),
        IrValue::Box(b) => b,
    };
    match b.kind() {
        IrKind::Int | IrKind::Void => EntryState::Int(state.bound(value)),
        IrKind::Float => EntryState::Float,
        IrKind::Ref => match state.ptr_info(value) {
            None => EntryState::Ptr(PtrFact::Unknown),
            Some(PtrInfo::NonNull) => EntryState::Ptr(PtrFact::NonNull),
            Some(PtrInfo::Class(vtable)) => EntryState::Ptr(PtrFact::Class(*vtable)),
            Some(PtrInfo::Virtual(object)) => {
                if !visiting.insert(b.id()) {
                    return EntryState::Ptr(PtrFact::NonNull);
                }
                let exported = match object {
                    VirtualObject::Struct { descr, fields } => EntryState::VirtualStruct {
                        descr: descr.clone(),
                        fields: fields
                            .values()
                            .map(|(field, v)| (field.clone(), export(state, *v, visiting)))
                            .collect(),
                    },
                    VirtualObject::Array { descr, items } => EntryState::VirtualArray {
                        descr: descr.clone(),
                        items: items.iter().map(|v| export(state, *v, visiting)).collect(),
                    },
                };
                visiting.remove(&b.id());
                exported
            }
        },
    }
}
