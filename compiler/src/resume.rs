//! Guard resume data.
//!
//! Every guard carries a [`FailDescr`]: the boxes the backend must preserve
//! when the guard fails (the fail args) plus a [`Snapshot`] chain describing
//! the interpreter frames live at that point. Snapshots are persistent
//! linked lists; guards recorded in the same frame share their outer frames.
//!
//! After optimization a snapshot slot holds a fail-arg box, a constant, or a
//! reference to a [`VirtualDescription`] for an object the optimized code
//! never allocated. [`reconstruct_frames`] turns a decoded failure back into
//! interpreter frames, materializing those objects through a
//! [`ResumeAllocator`].

use crate::ir::{
    ArrayDescr, FailDescrId, FieldDescr, IrBox, IrId, IrKind, IrValue, Opcode,
    RuntimeValue, SizeDescr,
};
use fxhash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Position of an interpreter frame: code object and program counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodePosition {
    pub code: u32,
    pub pc: u32,
}

impl CodePosition {
    pub fn new(code: u32, pc: u32) -> Self {
        Self { code, pc }
    }
}

impl fmt::Display for CodePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.code, self.pc)
    }
}

/// One slot of a snapshot frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SnapshotValue {
    Value(IrValue),
    /// Index into the owning descriptor's virtual descriptions
    Virtual(usize),
}

/// One interpreter frame in a snapshot chain
#[derive(Debug, PartialEq)]
pub struct Snapshot {
    pub position: CodePosition,
    pub values: Vec<SnapshotValue>,
    /// Caller frame
    pub prev: Option<Arc<Snapshot>>,
}

impl Snapshot {
    pub fn new(
        position: CodePosition,
        values: Vec<SnapshotValue>,
        prev: Option<Arc<Snapshot>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            position,
            values,
            prev,
        })
    }

    /// Frame-less snapshot for guards recorded without interpreter state
    pub fn empty() -> Arc<Self> {
        Self::new(CodePosition::new(0, 0), Vec::new(), None)
    }

    /// Frames from the outermost caller to the innermost frame
    pub fn frames(&self) -> Vec<&Snapshot> {
        let mut frames = vec![self];
        let mut current = self.prev.as_deref();
        while let Some(frame) = current {
            frames.push(frame);
            current = frame.prev.as_deref();
        }
        frames.reverse();
        frames
    }

    pub fn depth(&self) -> usize {
        1 + self.prev.as_ref().map_or(0, |p| p.depth())
    }

    /// Every box mentioned in the chain, outermost frame first, deduplicated
    pub fn boxes(&self) -> Vec<IrBox> {
        let mut seen = FxHashMap::default();
        let mut out = Vec::new();
        for frame in self.frames() {
            for value in &frame.values {
                if let SnapshotValue::Value(IrValue::Box(b)) = value {
                    if seen.insert(b.id(), ()).is_none() {
                        out.push(*b);
                    }
                }
            }
        }
        out
    }
}

/// Frame state handed to the recorder when a guard is recorded
#[derive(Debug, Clone, PartialEq)]
pub struct FrameState {
    pub position: CodePosition,
    pub values: Vec<IrValue>,
}

impl FrameState {
    pub fn new(position: CodePosition, values: Vec<IrValue>) -> Self {
        Self { position, values }
    }
}

/// Builds snapshot chains, reusing the frames of the previous capture
/// that did not change.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    last: Vec<Arc<Snapshot>>,
    shared: usize,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture `frames` (outermost first) as a chain
    pub fn capture(&mut self, frames: &[FrameState]) -> Arc<Snapshot> {
        if frames.is_empty() {
            return Snapshot::empty();
        }
        let mut chain: Vec<Arc<Snapshot>> = Vec::with_capacity(frames.len());
        for (depth, frame) in frames.iter().enumerate() {
            let prev = chain.last().cloned();
            let reusable = self.last.get(depth).filter(|old| {
                old.position == frame.position
                    && old.values.len() == frame.values.len()
                    && old
                        .values
                        .iter()
                        .zip(&frame.values)
                        .all(|(a, b)| *a == SnapshotValue::Value(*b))
                    && match (&old.prev, &prev) {
                        (None, None) => true,
                        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                        _ => false,
                    }
            });
            let node = match reusable {
                Some(old) => {
                    self.shared += 1;
                    old.clone()
                }
                None => Snapshot::new(
                    frame.position,
                    frame.values.iter().map(|v| SnapshotValue::Value(*v)).collect(),
                    prev,
                ),
            };
            chain.push(node);
        }
        let top = chain.last().cloned().unwrap_or_else(Snapshot::empty);
        self.last = chain;
        top
    }

    /// Frames reused from an earlier capture
    pub fn shared_frames(&self) -> usize {
        self.shared
    }
}

/// An object the optimized code never allocated
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualDescription {
    Struct {
        descr: Arc<SizeDescr>,
        fields: Vec<(Arc<FieldDescr>, SnapshotValue)>,
    },
    Array {
        descr: Arc<ArrayDescr>,
        items: Vec<SnapshotValue>,
    },
}

/// Resume data of one guard
#[derive(Debug)]
pub struct FailDescr {
    id: FailDescrId,
    guard: Opcode,
    fail_args: Vec<IrBox>,
    snapshot: Arc<Snapshot>,
    virtuals: Vec<VirtualDescription>,
    /// Fail-arg slot holding the value a `guard_value` checked
    value_index: Option<usize>,
}

impl FailDescr {
    /// Resume data straight from the recorder: every snapshot box is a fail arg
    pub fn recorded(id: FailDescrId, guard: Opcode, snapshot: Arc<Snapshot>) -> Arc<Self> {
        let fail_args = snapshot.boxes();
        Arc::new(Self {
            id,
            guard,
            fail_args,
            snapshot,
            virtuals: Vec::new(),
            value_index: None,
        })
    }

    pub fn resolved(
        id: FailDescrId,
        guard: Opcode,
        fail_args: Vec<IrBox>,
        snapshot: Arc<Snapshot>,
        virtuals: Vec<VirtualDescription>,
        value_index: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            guard,
            fail_args,
            snapshot,
            virtuals,
            value_index,
        })
    }

    pub fn id(&self) -> FailDescrId {
        self.id
    }

    pub fn guard(&self) -> Opcode {
        self.guard
    }

    pub fn fail_args(&self) -> &[IrBox] {
        &self.fail_args
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn virtuals(&self) -> &[VirtualDescription] {
        &self.virtuals
    }

    pub fn value_index(&self) -> Option<usize> {
        self.value_index
    }
}

/// Guest object model used to rebuild virtual objects after a guard failure
pub trait ResumeAllocator {
    fn allocate_struct(&mut self, descr: &Arc<SizeDescr>) -> RuntimeValue;
    fn allocate_array(&mut self, descr: &Arc<ArrayDescr>, length: usize) -> RuntimeValue;
    fn set_field(&mut self, object: RuntimeValue, descr: &Arc<FieldDescr>, value: RuntimeValue);
    fn set_array_item(
        &mut self,
        array: RuntimeValue,
        descr: &Arc<ArrayDescr>,
        index: usize,
        value: RuntimeValue,
    );
}

/// An interpreter frame rebuilt from a guard failure
#[derive(Debug, Clone, PartialEq)]
pub struct ResumedFrame {
    pub position: CodePosition,
    pub values: Vec<RuntimeValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResumeError {
    /// The backend did not report a value for a fail arg
    MissingValue(IrBox),
    /// A snapshot refers to a virtual that does not exist
    BadVirtual(usize),
    KindMismatch { expected: IrKind, found: IrKind },
}

impl fmt::Display for ResumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeError::MissingValue(b) => write!(f, "no value decoded for {}", b),
            ResumeError::BadVirtual(i) => write!(f, "snapshot refers to missing virtual #{}", i),
            ResumeError::KindMismatch { expected, found } => {
                write!(f, "expected a {} value, decoded a {}", expected, found)
            }
        }
    }
}

impl std::error::Error for ResumeError {}

struct Materializer<'a> {
    descr: &'a FailDescr,
    values: FxHashMap<IrId, RuntimeValue>,
    built: FxHashMap<usize, RuntimeValue>,
    allocator: &'a mut dyn ResumeAllocator,
}

impl Materializer<'_> {
    fn value(&mut self, slot: &SnapshotValue) -> Result<RuntimeValue, ResumeError> {
        match slot {
            SnapshotValue::Value(IrValue::Const(c)) => Ok(RuntimeValue::from(*c)),
            SnapshotValue::Value(IrValue::Box(b)) => {
                let value = self
                    .values
                    .get(&b.id())
                    .copied()
                    .ok_or(ResumeError::MissingValue(*b))?;
                if value.kind() != b.kind() {
                    return Err(ResumeError::KindMismatch {
                        expected: b.kind(),
                        found: value.kind(),
                    });
                }
                Ok(value)
            }
            SnapshotValue::Virtual(index) => self.virtual_object(*index),
        }
    }

    fn virtual_object(&mut self, index: usize) -> Result<RuntimeValue, ResumeError> {
        if let Some(existing) = self.built.get(&index) {
            return Ok(*existing);
        }
        let descr = self.descr;
        let virtual_descr = descr
            .virtuals()
            .get(index)
            .ok_or(ResumeError::BadVirtual(index))?;
        match virtual_descr {
            VirtualDescription::Struct { descr, fields } => {
                let object = self.allocator.allocate_struct(descr);
                // registered before the fields so cycles resolve to this object
                self.built.insert(index, object);
                for (field, slot) in fields {
                    let value = self.value(slot)?;
                    self.allocator.set_field(object, field, value);
                }
                Ok(object)
            }
            VirtualDescription::Array { descr, items } => {
                let array = self.allocator.allocate_array(descr, items.len());
                self.built.insert(index, array);
                for (i, slot) in items.iter().enumerate() {
                    let value = self.value(slot)?;
                    self.allocator.set_array_item(array, descr, i, value);
                }
                Ok(array)
            }
        }
    }
}

/// Rebuild the interpreter frames of a failed guard, outermost first
pub fn reconstruct_frames(
    descr: &FailDescr,
    decoded: &[(IrBox, RuntimeValue)],
    allocator: &mut dyn ResumeAllocator,
) -> Result<Vec<ResumedFrame>, ResumeError> {
    let mut materializer = Materializer {
        descr,
        values: decoded.iter().map(|(b, v)| (b.id(), *v)).collect(),
        built: FxHashMap::default(),
        allocator,
    };
    let mut frames = Vec::new();
    for frame in descr.snapshot().frames() {
        let mut values = Vec::with_capacity(frame.values.len());
        for slot in &frame.values {
            values.push(materializer.value(slot)?);
        }
        frames.push(ResumedFrame {
            position: frame.position,
            values,
        });
    }
    Ok(frames)
}
