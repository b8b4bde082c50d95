//! IR Value Types
//!
//! Boxes (unknown values), constants (known values) and the runtime values a
//! backend produces when it executes a trace.

use super::IrId;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Kind of a value flowing through a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IrKind {
    Int,
    Ref,
    Float,
    /// Only used as the result kind of operations without a result
    Void,
}

impl IrKind {
    /// Prefix used in the textual trace format (`i0`, `p1`, `f2`)
    pub fn prefix(self) -> char {
        match self {
            IrKind::Int => 'i',
            IrKind::Ref => 'p',
            IrKind::Float => 'f',
            IrKind::Void => 'v',
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'i' => Some(IrKind::Int),
            'p' => Some(IrKind::Ref),
            'f' => Some(IrKind::Float),
            _ => None,
        }
    }

    /// The value an untouched field or array slot of this kind holds
    pub fn zero(self) -> Option<IrConst> {
        match self {
            IrKind::Int => Some(IrConst::Int(0)),
            IrKind::Ref => Some(IrConst::NULL),
            IrKind::Float => Some(IrConst::Float(0.0)),
            IrKind::Void => None,
        }
    }
}

impl fmt::Display for IrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IrKind::Int => "int",
            IrKind::Ref => "ref",
            IrKind::Float => "float",
            IrKind::Void => "void",
        };
        f.write_str(name)
    }
}

/// A placeholder for a runtime value that is not known at compile time.
///
/// Equality is identity: two boxes are the same value only if they carry the
/// same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrBox {
    id: IrId,
    kind: IrKind,
}

impl IrBox {
    pub fn new(id: IrId, kind: IrKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> IrId {
        self.id
    }

    pub fn kind(&self) -> IrKind {
        self.kind
    }
}

impl fmt::Display for IrBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.id.index())
    }
}

/// A garbage-collected reference as seen by the JIT (an address; 0 is null)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GcRef(pub usize);

impl GcRef {
    pub const NULL: GcRef = GcRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A compile-time known value.
///
/// `Int` and `Addr` are two representations of the same integer kind and
/// compare equal when they denote the same number. Floats compare by bit
/// pattern so constants can be used as hash keys.
#[derive(Debug, Clone, Copy)]
pub enum IrConst {
    Int(i64),
    /// Raw machine address (class vtables, function pointers)
    Addr(usize),
    Ref(GcRef),
    Float(f64),
}

impl IrConst {
    pub const NULL: IrConst = IrConst::Ref(GcRef::NULL);

    pub fn bool(value: bool) -> Self {
        IrConst::Int(value as i64)
    }

    pub fn kind(&self) -> IrKind {
        match self {
            IrConst::Int(_) | IrConst::Addr(_) => IrKind::Int,
            IrConst::Ref(_) => IrKind::Ref,
            IrConst::Float(_) => IrKind::Float,
        }
    }

    /// Integer value of either integer representation
    pub fn as_int(&self) -> Option<i64> {
        match self {
            IrConst::Int(v) => Some(*v),
            IrConst::Addr(a) => Some(*a as i64),
            _ => None,
        }
    }

    pub fn as_gcref(&self) -> Option<GcRef> {
        match self {
            IrConst::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            IrConst::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, IrConst::Ref(r) if r.is_null())
    }

    /// Raw 64-bit pattern, as a backend would keep it in a register
    pub fn to_bits(&self) -> u64 {
        match self {
            IrConst::Int(v) => *v as u64,
            IrConst::Addr(a) => *a as u64,
            IrConst::Ref(r) => r.0 as u64,
            IrConst::Float(v) => v.to_bits(),
        }
    }
}

impl PartialEq for IrConst {
    fn eq(&self, other: &Self) -> bool {
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => match (self, other) {
                (IrConst::Ref(a), IrConst::Ref(b)) => a == b,
                (IrConst::Float(a), IrConst::Float(b)) => a.to_bits() == b.to_bits(),
                _ => false,
            },
            _ => false,
        }
    }
}

impl Eq for IrConst {}

impl Hash for IrConst {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            IrConst::Int(_) | IrConst::Addr(_) => {
                0u8.hash(state);
                self.to_bits().hash(state);
            }
            IrConst::Ref(r) => {
                1u8.hash(state);
                r.0.hash(state);
            }
            IrConst::Float(v) => {
                2u8.hash(state);
                v.to_bits().hash(state);
            }
        }
    }
}

impl fmt::Display for IrConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrConst::Int(v) => write!(f, "{}", v),
            IrConst::Addr(a) => write!(f, "{}", a),
            IrConst::Ref(r) if r.is_null() => f.write_str("NULL"),
            IrConst::Ref(r) => write!(f, "ConstPtr({:#x})", r.0),
            IrConst::Float(v) => write!(f, "{:?}", v),
        }
    }
}

/// An operation argument: either a box or a constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrValue {
    Box(IrBox),
    Const(IrConst),
}

impl IrValue {
    pub fn int(value: i64) -> Self {
        IrValue::Const(IrConst::Int(value))
    }

    pub fn null() -> Self {
        IrValue::Const(IrConst::NULL)
    }

    pub fn kind(&self) -> IrKind {
        match self {
            IrValue::Box(b) => b.kind(),
            IrValue::Const(c) => c.kind(),
        }
    }

    pub fn as_box(&self) -> Option<IrBox> {
        match self {
            IrValue::Box(b) => Some(*b),
            IrValue::Const(_) => None,
        }
    }

    pub fn as_const(&self) -> Option<IrConst> {
        match self {
            IrValue::Const(c) => Some(*c),
            IrValue::Box(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        self.as_const().and_then(|c| c.as_int())
    }

    pub fn is_const(&self) -> bool {
        matches!(self, IrValue::Const(_))
    }
}

impl From<IrBox> for IrValue {
    fn from(b: IrBox) -> Self {
        IrValue::Box(b)
    }
}

impl From<IrConst> for IrValue {
    fn from(c: IrConst) -> Self {
        IrValue::Const(c)
    }
}

impl fmt::Display for IrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrValue::Box(b) => write!(f, "{}", b),
            IrValue::Const(c) => write!(f, "{}", c),
        }
    }
}

/// A concrete value produced while executing compiled code
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuntimeValue {
    Int(i64),
    Ref(GcRef),
    Float(f64),
}

impl RuntimeValue {
    pub fn zero(kind: IrKind) -> Option<Self> {
        kind.zero().map(RuntimeValue::from)
    }

    pub fn kind(&self) -> IrKind {
        match self {
            RuntimeValue::Int(_) => IrKind::Int,
            RuntimeValue::Ref(_) => IrKind::Ref,
            RuntimeValue::Float(_) => IrKind::Float,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            RuntimeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_gcref(&self) -> Option<GcRef> {
        match self {
            RuntimeValue::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            RuntimeValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_bits(&self) -> u64 {
        match self {
            RuntimeValue::Int(v) => *v as u64,
            RuntimeValue::Ref(r) => r.0 as u64,
            RuntimeValue::Float(v) => v.to_bits(),
        }
    }

    pub fn from_bits(kind: IrKind, bits: u64) -> Option<Self> {
        match kind {
            IrKind::Int => Some(RuntimeValue::Int(bits as i64)),
            IrKind::Ref => Some(RuntimeValue::Ref(GcRef(bits as usize))),
            IrKind::Float => Some(RuntimeValue::Float(f64::from_bits(bits))),
            IrKind::Void => None,
        }
    }

    pub fn to_const(&self) -> IrConst {
        match self {
            RuntimeValue::Int(v) => IrConst::Int(*v),
            RuntimeValue::Ref(r) => IrConst::Ref(*r),
            RuntimeValue::Float(v) => IrConst::Float(*v),
        }
    }

    /// Bitwise identity, the comparison guards use
    pub fn same_as(&self, other: &RuntimeValue) -> bool {
        self.kind() == other.kind() && self.to_bits() == other.to_bits()
    }
}

impl From<IrConst> for RuntimeValue {
    fn from(c: IrConst) -> Self {
        match c {
            IrConst::Int(v) => RuntimeValue::Int(v),
            IrConst::Addr(a) => RuntimeValue::Int(a as i64),
            IrConst::Ref(r) => RuntimeValue::Ref(r),
            IrConst::Float(v) => RuntimeValue::Float(v),
        }
    }
}

impl fmt::Display for RuntimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeValue::Int(v) => write!(f, "{}", v),
            RuntimeValue::Ref(r) if r.is_null() => f.write_str("NULL"),
            RuntimeValue::Ref(r) => write!(f, "<ref {:#x}>", r.0),
            RuntimeValue::Float(v) => write!(f, "{:?}", v),
        }
    }
}
