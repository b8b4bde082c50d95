//! Descriptors
//!
//! Descriptors are opaque metadata attached to operations: object layouts,
//! field and array accessors, call signatures, guard resume data and jump
//! targets. The optimizer only looks at identity and at the accessor fields
//! exposed here; the contents belong to whoever created them.

use super::IrKind;
use crate::resume::FailDescr;
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Identity of a layout or call descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescrId(pub u32);

/// Identity of a guard's resume data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FailDescrId(pub u32);

/// Identity of a jump target or compiled loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub u32);

impl fmt::Display for FailDescrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guard#{}", self.0)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// Hands out descriptor and token ids for one compilation context
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn descr(&self) -> DescrId {
        DescrId(self.bump())
    }

    pub fn fail(&self) -> FailDescrId {
        FailDescrId(self.bump())
    }

    pub fn token(&self) -> TokenId {
        TokenId(self.bump())
    }
}

/// Group of heap locations a call may clobber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectClass(pub u32);

/// Fixed-size object layout
#[derive(Debug)]
pub struct SizeDescr {
    pub id: DescrId,
    pub name: String,
    pub size: usize,
    /// Class pointer for objects created by `new_with_vtable`
    pub vtable: Option<usize>,
}

#[derive(Debug)]
pub struct FieldDescr {
    pub id: DescrId,
    pub name: String,
    /// Layout that owns the field
    pub owner: DescrId,
    pub offset: usize,
    pub size: usize,
    pub kind: IrKind,
    pub immutable: bool,
    pub effect_class: EffectClass,
}

#[derive(Debug)]
pub struct ArrayDescr {
    pub id: DescrId,
    pub name: String,
    pub item_size: usize,
    pub item_kind: IrKind,
    pub effect_class: EffectClass,
}

/// What a call may do to the heap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectInfo {
    /// `None` means the call may write anything
    pub writes: Option<BTreeSet<EffectClass>>,
    pub may_raise: bool,
    /// Same arguments always give the same result and no visible effect
    pub elidable: bool,
}

impl EffectInfo {
    pub fn unknown() -> Self {
        Self {
            writes: None,
            may_raise: true,
            elidable: false,
        }
    }

    pub fn elidable() -> Self {
        Self {
            writes: Some(BTreeSet::new()),
            may_raise: false,
            elidable: true,
        }
    }

    pub fn writing(classes: impl IntoIterator<Item = EffectClass>) -> Self {
        Self {
            writes: Some(classes.into_iter().collect()),
            may_raise: false,
            elidable: false,
        }
    }

    pub fn may_write(&self, class: EffectClass) -> bool {
        self.writes.as_ref().map_or(true, |w| w.contains(&class))
    }
}

#[derive(Debug)]
pub struct CallDescr {
    pub id: DescrId,
    pub name: String,
    pub arg_kinds: Vec<IrKind>,
    pub result_kind: IrKind,
    pub effect: EffectInfo,
}

/// Sentinel loops that are never compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PseudoLoop {
    /// Return from the traced frame with a value of this kind
    DoneWithThisFrame(IrKind),
    ExitFrameWithException,
}

impl PseudoLoop {
    pub const ALL: [PseudoLoop; 5] = [
        PseudoLoop::DoneWithThisFrame(IrKind::Int),
        PseudoLoop::DoneWithThisFrame(IrKind::Ref),
        PseudoLoop::DoneWithThisFrame(IrKind::Float),
        PseudoLoop::DoneWithThisFrame(IrKind::Void),
        PseudoLoop::ExitFrameWithException,
    ];

    /// Name under which the token is visible to the text format
    pub fn name(self) -> &'static str {
        match self {
            PseudoLoop::DoneWithThisFrame(IrKind::Int) => "done_with_this_frame_int",
            PseudoLoop::DoneWithThisFrame(IrKind::Ref) => "done_with_this_frame_ref",
            PseudoLoop::DoneWithThisFrame(IrKind::Float) => "done_with_this_frame_float",
            PseudoLoop::DoneWithThisFrame(IrKind::Void) => "done_with_this_frame_void",
            PseudoLoop::ExitFrameWithException => "exit_frame_with_exception",
        }
    }
}

/// A label a `jump` can target
#[derive(Debug)]
pub struct TargetToken {
    pub id: TokenId,
    pub pseudo: Option<PseudoLoop>,
}

impl TargetToken {
    pub fn new(id: TokenId) -> Arc<Self> {
        Arc::new(Self { id, pseudo: None })
    }

    pub fn pseudo(id: TokenId, kind: PseudoLoop) -> Arc<Self> {
        Arc::new(Self {
            id,
            pseudo: Some(kind),
        })
    }
}

macro_rules! identity_eq {
    ($($ty:ty),*) => {
        $(
            impl PartialEq for $ty {
                fn eq(&self, other: &Self) -> bool {
                    self.id == other.id
                }
            }
            impl Eq for $ty {}
        )*
    };
}

identity_eq!(SizeDescr, FieldDescr, ArrayDescr, CallDescr, TargetToken);

/// Descriptor attached to an operation
#[derive(Debug, Clone)]
pub enum Descr {
    Size(Arc<SizeDescr>),
    Field(Arc<FieldDescr>),
    Array(Arc<ArrayDescr>),
    Call(Arc<CallDescr>),
    Fail(Arc<FailDescr>),
    Target(Arc<TargetToken>),
}

/// Hashable identity of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescrKey {
    Layout(DescrId),
    Fail(FailDescrId),
    Target(TokenId),
}

impl Descr {
    pub fn key(&self) -> DescrKey {
        match self {
            Descr::Size(d) => DescrKey::Layout(d.id),
            Descr::Field(d) => DescrKey::Layout(d.id),
            Descr::Array(d) => DescrKey::Layout(d.id),
            Descr::Call(d) => DescrKey::Layout(d.id),
            Descr::Fail(d) => DescrKey::Fail(d.id()),
            Descr::Target(d) => DescrKey::Target(d.id),
        }
    }

    pub fn as_size(&self) -> Option<&Arc<SizeDescr>> {
        match self {
            Descr::Size(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_field(&self) -> Option<&Arc<FieldDescr>> {
        match self {
            Descr::Field(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Arc<ArrayDescr>> {
        match self {
            Descr::Array(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&Arc<CallDescr>> {
        match self {
            Descr::Call(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_fail(&self) -> Option<&Arc<FailDescr>> {
        match self {
            Descr::Fail(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_target(&self) -> Option<&Arc<TargetToken>> {
        match self {
            Descr::Target(d) => Some(d),
            _ => None,
        }
    }
}

impl PartialEq for Descr {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Descr {}

impl fmt::Display for Descr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descr::Size(d) => f.write_str(&d.name),
            Descr::Field(d) => f.write_str(&d.name),
            Descr::Array(d) => f.write_str(&d.name),
            Descr::Call(d) => f.write_str(&d.name),
            Descr::Fail(d) => write!(f, "{}", d.id()),
            Descr::Target(d) => write!(f, "{}", d.id),
        }
    }
}

/// Type-layout contract consumed by the recorder front end
pub trait TypeLayout {
    fn field_descr(&self, type_name: &str, field: &str) -> Option<Arc<FieldDescr>>;
    fn array_descr(&self, name: &str) -> Option<Arc<ArrayDescr>>;
    fn call_descr(&self, name: &str) -> Option<Arc<CallDescr>>;
}

/// Owns every layout descriptor of a compilation context.
///
/// Field lists are interned per layout and replaced copy-on-write, so traces
/// holding an old list keep a consistent snapshot of it.
#[derive(Debug)]
pub struct LayoutRegistry {
    ids: Arc<IdAllocator>,
    sizes: IndexMap<String, Arc<SizeDescr>>,
    fields: IndexMap<DescrId, Arc<[Arc<FieldDescr>]>>,
    arrays: IndexMap<String, Arc<ArrayDescr>>,
    calls: IndexMap<String, Arc<CallDescr>>,
}

const WORD: usize = 8;

impl LayoutRegistry {
    pub fn new(ids: Arc<IdAllocator>) -> Self {
        Self {
            ids,
            sizes: IndexMap::new(),
            fields: IndexMap::new(),
            arrays: IndexMap::new(),
            calls: IndexMap::new(),
        }
    }

    /// Register (or return the existing) layout named `name`
    pub fn size_descr(&mut self, name: &str, size: usize, vtable: Option<usize>) -> Arc<SizeDescr> {
        if let Some(existing) = self.sizes.get(name) {
            return existing.clone();
        }
        let descr = Arc::new(SizeDescr {
            id: self.ids.descr(),
            name: name.to_string(),
            size,
            vtable,
        });
        self.fields.insert(descr.id, Arc::from(Vec::new()));
        self.sizes.insert(name.to_string(), descr.clone());
        descr
    }

    pub fn layout(&self, name: &str) -> Option<Arc<SizeDescr>> {
        self.sizes.get(name).cloned()
    }

    /// Register a field on `owner`, copying the interned field list
    pub fn add_field(
        &mut self,
        owner: &SizeDescr,
        name: &str,
        kind: IrKind,
        immutable: bool,
    ) -> Arc<FieldDescr> {
        let current = self
            .fields
            .get(&owner.id)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()));
        if let Some(existing) = current.iter().find(|f| f.name == name) {
            return existing.clone();
        }
        let id = self.ids.descr();
        let field = Arc::new(FieldDescr {
            id,
            name: name.to_string(),
            owner: owner.id,
            offset: WORD * (current.len() + 1),
            size: WORD,
            kind,
            immutable,
            effect_class: EffectClass(id.0),
        });
        let mut list = current.to_vec();
        list.push(field.clone());
        self.fields.insert(owner.id, Arc::from(list));
        field
    }

    /// Interned field list of a layout
    pub fn fields_of(&self, owner: &SizeDescr) -> Arc<[Arc<FieldDescr>]> {
        self.fields
            .get(&owner.id)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    pub fn add_array(&mut self, name: &str, item_kind: IrKind) -> Arc<ArrayDescr> {
        if let Some(existing) = self.arrays.get(name) {
            return existing.clone();
        }
        let id = self.ids.descr();
        let descr = Arc::new(ArrayDescr {
            id,
            name: name.to_string(),
            item_size: WORD,
            item_kind,
            effect_class: EffectClass(id.0),
        });
        self.arrays.insert(name.to_string(), descr.clone());
        descr
    }

    pub fn add_call(
        &mut self,
        name: &str,
        arg_kinds: Vec<IrKind>,
        result_kind: IrKind,
        effect: EffectInfo,
    ) -> Arc<CallDescr> {
        if let Some(existing) = self.calls.get(name) {
            return existing.clone();
        }
        let descr = Arc::new(CallDescr {
            id: self.ids.descr(),
            name: name.to_string(),
            arg_kinds,
            result_kind,
            effect,
        });
        self.calls.insert(name.to_string(), descr.clone());
        descr
    }

    /// Effect class of a field or array registered under `name`
    pub fn effect_class_of(&self, name: &str) -> Option<EffectClass> {
        if let Some(array) = self.arrays.get(name) {
            return Some(array.effect_class);
        }
        self.fields
            .values()
            .flat_map(|list| list.iter())
            .find(|f| f.name == name)
            .map(|f| f.effect_class)
    }
}

impl TypeLayout for LayoutRegistry {
    fn field_descr(&self, type_name: &str, field: &str) -> Option<Arc<FieldDescr>> {
        let owner = self.sizes.get(type_name)?;
        self.fields_of(owner).iter().find(|f| f.name == field).cloned()
    }

    fn array_descr(&self, name: &str) -> Option<Arc<ArrayDescr>> {
        self.arrays.get(name).cloned()
    }

    fn call_descr(&self, name: &str) -> Option<Arc<CallDescr>> {
        self.calls.get(name).cloned()
    }
}
