//! Object heap of the reference backend
//!
//! Objects live in an arena and are addressed by `GcRef(index + 1)`, so the
//! null reference never names an object. Nothing is ever freed; the heap
//! only has to outlive one run of compiled code.

use crate::ir::{ArrayDescr, DescrId, FieldDescr, GcRef, RuntimeValue, SizeDescr};
use crate::resume::ResumeAllocator;
use fxhash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum HeapObject {
    Struct {
        layout: Arc<SizeDescr>,
        /// Fields never written read as zero
        fields: FxHashMap<DescrId, RuntimeValue>,
    },
    Array {
        descr: Arc<ArrayDescr>,
        items: Vec<RuntimeValue>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeapError {
    NullDereference,
    DanglingRef(GcRef),
    NotAStruct(GcRef),
    NotAnArray(GcRef),
    IndexOutOfBounds { index: i64, length: usize },
    NegativeLength(i64),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::NullDereference => write!(f, "null dereference"),
            HeapError::DanglingRef(r) => write!(f, "reference {:#x} names no object", r.0),
            HeapError::NotAStruct(r) => write!(f, "reference {:#x} is not a struct", r.0),
            HeapError::NotAnArray(r) => write!(f, "reference {:#x} is not an array", r.0),
            HeapError::IndexOutOfBounds { index, length } => {
                write!(f, "index {} out of bounds for length {}", index, length)
            }
            HeapError::NegativeLength(n) => write!(f, "negative array length {}", n),
        }
    }
}

impl std::error::Error for HeapError {}

#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects allocated so far
    pub fn allocations(&self) -> usize {
        self.objects.len()
    }

    fn alloc(&mut self, object: HeapObject) -> RuntimeValue {
        self.objects.push(object);
        RuntimeValue::Ref(GcRef(self.objects.len()))
    }

    pub fn new_struct(&mut self, layout: &Arc<SizeDescr>) -> RuntimeValue {
        self.alloc(HeapObject::Struct {
            layout: layout.clone(),
            fields: FxHashMap::default(),
        })
    }

    pub fn new_array(&mut self, descr: &Arc<ArrayDescr>, length: i64) -> Result<RuntimeValue, HeapError> {
        let length = usize::try_from(length).map_err(|_| HeapError::NegativeLength(length))?;
        let zero = RuntimeValue::zero(descr.item_kind).unwrap_or(RuntimeValue::Int(0));
        Ok(self.alloc(HeapObject::Array {
            descr: descr.clone(),
            items: vec![zero; length],
        }))
    }

    pub fn object(&self, r: GcRef) -> Result<&HeapObject, HeapError> {
        if r.is_null() {
            return Err(HeapError::NullDereference);
        }
        self.objects.get(r.0 - 1).ok_or(HeapError::DanglingRef(r))
    }

    fn object_mut(&mut self, r: GcRef) -> Result<&mut HeapObject, HeapError> {
        if r.is_null() {
            return Err(HeapError::NullDereference);
        }
        self.objects.get_mut(r.0 - 1).ok_or(HeapError::DanglingRef(r))
    }

    /// Vtable of a struct created with a class, `None` for anything else
    pub fn class_of(&self, r: GcRef) -> Option<usize> {
        match self.object(r).ok()? {
            HeapObject::Struct { layout, .. } => layout.vtable,
            HeapObject::Array { .. } => None,
        }
    }

    pub fn get_field(&self, r: GcRef, field: &FieldDescr) -> Result<RuntimeValue, HeapError> {
        match self.object(r)? {
            HeapObject::Struct { fields, .. } => Ok(fields
                .get(&field.id)
                .copied()
                .or_else(|| RuntimeValue::zero(field.kind))
                .unwrap_or(RuntimeValue::Int(0))),
            HeapObject::Array { .. } => Err(HeapError::NotAStruct(r)),
        }
    }

    pub fn set_field(&mut self, r: GcRef, field: &FieldDescr, value: RuntimeValue) -> Result<(), HeapError> {
        match self.object_mut(r)? {
            HeapObject::Struct { fields, .. } => {
                fields.insert(field.id, value);
                Ok(())
            }
            HeapObject::Array { .. } => Err(HeapError::NotAStruct(r)),
        }
    }

    fn items(&self, r: GcRef) -> Result<&Vec<RuntimeValue>, HeapError> {
        match self.object(r)? {
            HeapObject::Array { items, .. } => Ok(items),
            HeapObject::Struct { .. } => Err(HeapError::NotAnArray(r)),
        }
    }

    pub fn array_len(&self, r: GcRef) -> Result<usize, HeapError> {
        Ok(self.items(r)?.len())
    }

    pub fn get_item(&self, r: GcRef, index: i64) -> Result<RuntimeValue, HeapError> {
        let items = self.items(r)?;
        usize::try_from(index)
            .ok()
            .and_then(|i| items.get(i).copied())
            .ok_or(HeapError::IndexOutOfBounds {
                index,
                length: items.len(),
            })
    }

    pub fn set_item(&mut self, r: GcRef, index: i64, value: RuntimeValue) -> Result<(), HeapError> {
        let items = match self.object_mut(r)? {
            HeapObject::Array { items, .. } => items,
            HeapObject::Struct { .. } => return Err(HeapError::NotAnArray(r)),
        };
        let length = items.len();
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| items.get_mut(i))
            .ok_or(HeapError::IndexOutOfBounds { index, length })?;
        *slot = value;
        Ok(())
    }
}

impl ResumeAllocator for Heap {
    fn allocate_struct(&mut self, descr: &Arc<SizeDescr>) -> RuntimeValue {
        self.new_struct(descr)
    }

    fn allocate_array(&mut self, descr: &Arc<ArrayDescr>, length: usize) -> RuntimeValue {
        let zero = RuntimeValue::zero(descr.item_kind).unwrap_or(RuntimeValue::Int(0));
        self.alloc(HeapObject::Array {
            descr: descr.clone(),
            items: vec![zero; length],
        })
    }

    fn set_field(&mut self, object: RuntimeValue, descr: &Arc<FieldDescr>, value: RuntimeValue) {
        let result = match object {
            RuntimeValue::Ref(r) => Heap::set_field(self, r, descr, value),
            _ => Err(HeapError::NullDereference),
        };
        if let Err(e) = result {
            warn!("resume: cannot set {}: {}", descr.name, e);
        }
    }

    fn set_array_item(
        &mut self,
        array: RuntimeValue,
        descr: &Arc<ArrayDescr>,
        index: usize,
        value: RuntimeValue,
    ) {
        let result = match array {
            RuntimeValue::Ref(r) => self.set_item(r, index as i64, value),
            _ => Err(HeapError::NullDereference),
        };
        if let Err(e) = result {
            warn!("resume: cannot set {}[{}]: {}", descr.name, index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IdAllocator, IrKind, LayoutRegistry};

    #[test]
    fn test_struct_fields_default_to_zero() {
        let mut layouts = LayoutRegistry::new(Arc::new(IdAllocator::new()));
        let node = layouts.size_descr("Node", 16, Some(0x1000));
        let value = layouts.add_field(&node, "value", IrKind::Int, false);
        let next = layouts.add_field(&node, "next", IrKind::Ref, false);

        let mut heap = Heap::new();
        let obj = heap.new_struct(&node).as_gcref().unwrap();
        assert_eq!(heap.get_field(obj, &value), Ok(RuntimeValue::Int(0)));
        assert_eq!(heap.get_field(obj, &next), Ok(RuntimeValue::Ref(GcRef(0))));
        heap.set_field(obj, &value, RuntimeValue::Int(7)).unwrap();
        assert_eq!(heap.get_field(obj, &value), Ok(RuntimeValue::Int(7)));
        assert_eq!(heap.class_of(obj), Some(0x1000));
    }

    #[test]
    fn test_array_bounds_and_null() {
        let mut layouts = LayoutRegistry::new(Arc::new(IdAllocator::new()));
        let items = layouts.add_array("items", IrKind::Int);
        let mut heap = Heap::new();
        let array = heap.new_array(&items, 3).unwrap().as_gcref().unwrap();
        assert_eq!(heap.array_len(array), Ok(3));
        heap.set_item(array, 2, RuntimeValue::Int(9)).unwrap();
        assert_eq!(heap.get_item(array, 2), Ok(RuntimeValue::Int(9)));
        assert_eq!(
            heap.get_item(array, 3),
            Err(HeapError::IndexOutOfBounds { index: 3, length: 3 })
        );
        assert_eq!(heap.array_len(GcRef(0)), Err(HeapError::NullDereference));
        assert!(heap.new_array(&items, -1).is_err());
    }
}
