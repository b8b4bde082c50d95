//! Opcode table
//!
//! The opcode set is a closed enum. Every variant is declared once in
//! `define_opcodes!` together with its textual name, arity, result kind and
//! flags, and all metadata queries read that table.

use super::IrKind;
use fxhash::FxHashMap;
use std::fmt;
use std::sync::OnceLock;

use Arity::{Fixed, Variadic};

/// Number of arguments an opcode takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Variadic,
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Fixed(n) => n == count,
            Variadic => true,
        }
    }
}

/// Opcode property flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpFlags(u16);

impl OpFlags {
    pub const NONE: OpFlags = OpFlags(0);
    /// No side effects and deterministic in its arguments
    pub const PURE: OpFlags = OpFlags(1 << 0);
    pub const GUARD: OpFlags = OpFlags(1 << 1);
    /// Integer op that records whether it overflowed
    pub const OVF: OpFlags = OpFlags(1 << 2);
    pub const CALL: OpFlags = OpFlags(1 << 3);
    pub const MALLOC: OpFlags = OpFlags(1 << 4);
    pub const TERMINAL: OpFlags = OpFlags(1 << 5);
    pub const COMPARISON: OpFlags = OpFlags(1 << 6);
    /// Requires a descriptor
    pub const DESCR: OpFlags = OpFlags(1 << 7);
    pub const HEAP_READ: OpFlags = OpFlags(1 << 8);
    pub const HEAP_WRITE: OpFlags = OpFlags(1 << 9);

    pub const fn union(list: &[OpFlags]) -> OpFlags {
        let mut bits = 0;
        let mut i = 0;
        while i < list.len() {
            bits |= list[i].0;
            i += 1;
        }
        OpFlags(bits)
    }

    pub const fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Static metadata for one opcode
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub arity: Arity,
    pub result: IrKind,
    pub flags: OpFlags,
}

macro_rules! define_opcodes {
    ($( $variant:ident = $name:literal, $arity:expr, $result:ident, [$($flag:ident),*]; )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            pub const fn info(self) -> OpInfo {
                match self {
                    $(Opcode::$variant => OpInfo {
                        name: $name,
                        arity: $arity,
                        result: IrKind::$result,
                        flags: OpFlags::union(&[$(OpFlags::$flag),*]),
                    },)*
                }
            }
        }
    };
}

define_opcodes! {
    // control
    Label = "label", Variadic, Void, [DESCR];
    Jump = "jump", Variadic, Void, [TERMINAL, DESCR];
    Finish = "finish", Variadic, Void, [TERMINAL];
    Fail = "fail", Variadic, Void, [TERMINAL];

    // guards
    GuardTrue = "guard_true", Fixed(1), Void, [GUARD];
    GuardFalse = "guard_false", Fixed(1), Void, [GUARD];
    GuardValue = "guard_value", Fixed(2), Void, [GUARD];
    GuardClass = "guard_class", Fixed(2), Void, [GUARD];
    GuardNonnull = "guard_nonnull", Fixed(1), Void, [GUARD];
    GuardIsnull = "guard_isnull", Fixed(1), Void, [GUARD];
    GuardNonnullClass = "guard_nonnull_class", Fixed(2), Void, [GUARD];
    GuardNoException = "guard_no_exception", Fixed(0), Void, [GUARD];
    GuardNoOverflow = "guard_no_overflow", Fixed(0), Void, [GUARD];
    GuardOverflow = "guard_overflow", Fixed(0), Void, [GUARD];

    // integer arithmetic
    IntAdd = "int_add", Fixed(2), Int, [PURE];
    IntSub = "int_sub", Fixed(2), Int, [PURE];
    IntMul = "int_mul", Fixed(2), Int, [PURE];
    IntAnd = "int_and", Fixed(2), Int, [PURE];
    IntOr = "int_or", Fixed(2), Int, [PURE];
    IntXor = "int_xor", Fixed(2), Int, [PURE];
    IntLshift = "int_lshift", Fixed(2), Int, [PURE];
    IntRshift = "int_rshift", Fixed(2), Int, [PURE];
    UintRshift = "uint_rshift", Fixed(2), Int, [PURE];
    IntNeg = "int_neg", Fixed(1), Int, [PURE];
    IntInvert = "int_invert", Fixed(1), Int, [PURE];
    IntIsTrue = "int_is_true", Fixed(1), Int, [PURE];
    IntIsZero = "int_is_zero", Fixed(1), Int, [PURE];
    IntLt = "int_lt", Fixed(2), Int, [PURE, COMPARISON];
    IntLe = "int_le", Fixed(2), Int, [PURE, COMPARISON];
    IntGt = "int_gt", Fixed(2), Int, [PURE, COMPARISON];
    IntGe = "int_ge", Fixed(2), Int, [PURE, COMPARISON];
    IntEq = "int_eq", Fixed(2), Int, [PURE, COMPARISON];
    IntNe = "int_ne", Fixed(2), Int, [PURE, COMPARISON];
    UintLt = "uint_lt", Fixed(2), Int, [PURE, COMPARISON];
    UintLe = "uint_le", Fixed(2), Int, [PURE, COMPARISON];
    UintGt = "uint_gt", Fixed(2), Int, [PURE, COMPARISON];
    UintGe = "uint_ge", Fixed(2), Int, [PURE, COMPARISON];
    IntAddOvf = "int_add_ovf", Fixed(2), Int, [OVF];
    IntSubOvf = "int_sub_ovf", Fixed(2), Int, [OVF];
    IntMulOvf = "int_mul_ovf", Fixed(2), Int, [OVF];

    // floats
    FloatAdd = "float_add", Fixed(2), Float, [PURE];
    FloatSub = "float_sub", Fixed(2), Float, [PURE];
    FloatMul = "float_mul", Fixed(2), Float, [PURE];
    FloatTrueDiv = "float_truediv", Fixed(2), Float, [PURE];
    FloatNeg = "float_neg", Fixed(1), Float, [PURE];
    FloatAbs = "float_abs", Fixed(1), Float, [PURE];
    FloatLt = "float_lt", Fixed(2), Int, [PURE, COMPARISON];
    FloatLe = "float_le", Fixed(2), Int, [PURE, COMPARISON];
    FloatGt = "float_gt", Fixed(2), Int, [PURE, COMPARISON];
    FloatGe = "float_ge", Fixed(2), Int, [PURE, COMPARISON];
    FloatEq = "float_eq", Fixed(2), Int, [PURE, COMPARISON];
    FloatNe = "float_ne", Fixed(2), Int, [PURE, COMPARISON];
    CastIntToFloat = "cast_int_to_float", Fixed(1), Float, [PURE];
    CastFloatToInt = "cast_float_to_int", Fixed(1), Int, [PURE];

    // references
    PtrEq = "ptr_eq", Fixed(2), Int, [PURE, COMPARISON];
    PtrNe = "ptr_ne", Fixed(2), Int, [PURE, COMPARISON];
    SameAsI = "same_as_i", Fixed(1), Int, [PURE];
    SameAsR = "same_as_r", Fixed(1), Ref, [PURE];
    SameAsF = "same_as_f", Fixed(1), Float, [PURE];

    // heap
    New = "new", Fixed(0), Ref, [MALLOC, DESCR];
    NewWithVtable = "new_with_vtable", Fixed(0), Ref, [MALLOC, DESCR];
    NewArray = "new_array", Fixed(1), Ref, [MALLOC, DESCR];
    GetfieldGcI = "getfield_gc_i", Fixed(1), Int, [HEAP_READ, DESCR];
    GetfieldGcR = "getfield_gc_r", Fixed(1), Ref, [HEAP_READ, DESCR];
    GetfieldGcF = "getfield_gc_f", Fixed(1), Float, [HEAP_READ, DESCR];
    SetfieldGc = "setfield_gc", Fixed(2), Void, [HEAP_WRITE, DESCR];
    GetarrayitemGcI = "getarrayitem_gc_i", Fixed(2), Int, [HEAP_READ, DESCR];
    GetarrayitemGcR = "getarrayitem_gc_r", Fixed(2), Ref, [HEAP_READ, DESCR];
    GetarrayitemGcF = "getarrayitem_gc_f", Fixed(2), Float, [HEAP_READ, DESCR];
    SetarrayitemGc = "setarrayitem_gc", Fixed(3), Void, [HEAP_WRITE, DESCR];
    ArraylenGc = "arraylen_gc", Fixed(1), Int, [PURE, DESCR];

    // calls; the first argument is the function address
    CallI = "call_i", Variadic, Int, [CALL, DESCR];
    CallR = "call_r", Variadic, Ref, [CALL, DESCR];
    CallF = "call_f", Variadic, Float, [CALL, DESCR];
    CallN = "call_n", Variadic, Void, [CALL, DESCR];
    CallPureI = "call_pure_i", Variadic, Int, [CALL, PURE, DESCR];
    CallPureR = "call_pure_r", Variadic, Ref, [CALL, PURE, DESCR];
    CallPureF = "call_pure_f", Variadic, Float, [CALL, PURE, DESCR];
}

impl Opcode {
    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn arity(self) -> Arity {
        self.info().arity
    }

    pub fn result_kind(self) -> IrKind {
        self.info().result
    }

    pub fn has_result(self) -> bool {
        self.result_kind() != IrKind::Void
    }

    fn has(self, flag: OpFlags) -> bool {
        self.info().flags.contains(flag)
    }

    pub fn is_always_pure(self) -> bool {
        self.has(OpFlags::PURE)
    }

    pub fn is_guard(self) -> bool {
        self.has(OpFlags::GUARD)
    }

    pub fn is_ovf(self) -> bool {
        self.has(OpFlags::OVF)
    }

    pub fn is_call(self) -> bool {
        self.has(OpFlags::CALL)
    }

    pub fn is_malloc(self) -> bool {
        self.has(OpFlags::MALLOC)
    }

    pub fn is_terminal(self) -> bool {
        self.has(OpFlags::TERMINAL)
    }

    pub fn is_comparison(self) -> bool {
        self.has(OpFlags::COMPARISON)
    }

    pub fn needs_descr(self) -> bool {
        self.has(OpFlags::DESCR)
    }

    pub fn reads_heap(self) -> bool {
        self.has(OpFlags::HEAP_READ)
    }

    pub fn writes_heap(self) -> bool {
        self.has(OpFlags::HEAP_WRITE)
    }

    pub fn is_overflow_guard(self) -> bool {
        matches!(self, Opcode::GuardNoOverflow | Opcode::GuardOverflow)
    }

    /// Look up an opcode by its textual name
    pub fn from_name(name: &str) -> Option<Opcode> {
        static TABLE: OnceLock<FxHashMap<&'static str, Opcode>> = OnceLock::new();
        TABLE
            .get_or_init(|| Opcode::ALL.iter().map(|op| (op.name(), *op)).collect())
            .get(name)
            .copied()
    }

    /// The non-checking counterpart of an overflow op
    pub fn without_overflow(self) -> Option<Opcode> {
        match self {
            Opcode::IntAddOvf => Some(Opcode::IntAdd),
            Opcode::IntSubOvf => Some(Opcode::IntSub),
            Opcode::IntMulOvf => Some(Opcode::IntMul),
            _ => None,
        }
    }

    /// `op(a, b) == !inverse(a, b)`
    pub fn bool_inverse(self) -> Option<Opcode> {
        use Opcode::*;
        Some(match self {
            IntLt => IntGe,
            IntGe => IntLt,
            IntLe => IntGt,
            IntGt => IntLe,
            IntEq => IntNe,
            IntNe => IntEq,
            UintLt => UintGe,
            UintGe => UintLt,
            UintLe => UintGt,
            UintGt => UintLe,
            PtrEq => PtrNe,
            PtrNe => PtrEq,
            _ => return None,
        })
    }

    /// `op(a, b) == reflex(b, a)`
    pub fn bool_reflex(self) -> Option<Opcode> {
        use Opcode::*;
        Some(match self {
            IntLt => IntGt,
            IntGt => IntLt,
            IntLe => IntGe,
            IntGe => IntLe,
            IntEq => IntEq,
            IntNe => IntNe,
            UintLt => UintGt,
            UintGt => UintLt,
            UintLe => UintGe,
            UintGe => UintLe,
            FloatLt => FloatGt,
            FloatGt => FloatLt,
            FloatLe => FloatGe,
            FloatGe => FloatLe,
            FloatEq => FloatEq,
            FloatNe => FloatNe,
            PtrEq => PtrEq,
            PtrNe => PtrNe,
            _ => return None,
        })
    }

    pub fn is_commutative(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            IntAdd | IntMul | IntAnd | IntOr | IntXor | IntEq | IntNe | FloatAdd | FloatMul
                | PtrEq | PtrNe
        )
    }

    pub fn getfield_for(kind: IrKind) -> Opcode {
        match kind {
            IrKind::Ref => Opcode::GetfieldGcR,
            IrKind::Float => Opcode::GetfieldGcF,
            _ => Opcode::GetfieldGcI,
        }
    }

    pub fn getarrayitem_for(kind: IrKind) -> Opcode {
        match kind {
            IrKind::Ref => Opcode::GetarrayitemGcR,
            IrKind::Float => Opcode::GetarrayitemGcF,
            _ => Opcode::GetarrayitemGcI,
        }
    }

    pub fn same_as_for(kind: IrKind) -> Opcode {
        match kind {
            IrKind::Ref => Opcode::SameAsR,
            IrKind::Float => Opcode::SameAsF,
            _ => Opcode::SameAsI,
        }
    }

    pub fn is_same_as(self) -> bool {
        matches!(self, Opcode::SameAsI | Opcode::SameAsR | Opcode::SameAsF)
    }

    /// Kind argument `index` must have, where the opcode alone decides it
    pub fn arg_kind(self, index: usize) -> Option<IrKind> {
        use Opcode::*;
        match self {
            IntAdd | IntSub | IntMul | IntAnd | IntOr | IntXor | IntLshift | IntRshift
            | UintRshift | IntNeg | IntInvert | IntIsTrue | IntIsZero | IntLt | IntLe | IntGt
            | IntGe | IntEq | IntNe | UintLt | UintLe | UintGt | UintGe | IntAddOvf
            | IntSubOvf | IntMulOvf | CastIntToFloat | GuardTrue | GuardFalse | NewArray
            | SameAsI => Some(IrKind::Int),
            FloatAdd | FloatSub | FloatMul | FloatTrueDiv | FloatNeg | FloatAbs | FloatLt
            | FloatLe | FloatGt | FloatGe | FloatEq | FloatNe | CastFloatToInt | SameAsF => {
                Some(IrKind::Float)
            }
            PtrEq | PtrNe | GuardNonnull | GuardIsnull | GetfieldGcI | GetfieldGcR
            | GetfieldGcF | ArraylenGc | SameAsR => Some(IrKind::Ref),
            GuardClass | GuardNonnullClass => Some(if index == 0 {
                IrKind::Ref
            } else {
                IrKind::Int
            }),
            SetfieldGc => (index == 0).then_some(IrKind::Ref),
            GetarrayitemGcI | GetarrayitemGcR | GetarrayitemGcF | SetarrayitemGc => match index {
                0 => Some(IrKind::Ref),
                1 => Some(IrKind::Int),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_table() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_name(op.name()), Some(*op), "{}", op.name());
        }
        assert_eq!(Opcode::from_name("no_such_op"), None);
    }

    #[test]
    fn test_flags() {
        assert!(Opcode::IntAdd.is_always_pure());
        assert!(!Opcode::IntAddOvf.is_always_pure());
        assert!(Opcode::IntAddOvf.is_ovf());
        assert!(Opcode::GuardClass.is_guard());
        assert!(Opcode::Jump.is_terminal());
        assert!(!Opcode::Label.is_terminal());
        assert!(Opcode::CallPureI.is_call() && Opcode::CallPureI.is_always_pure());
        assert!(Opcode::NewWithVtable.is_malloc());
        assert_eq!(Opcode::IntLt.result_kind(), IrKind::Int);
        assert!(!Opcode::SetfieldGc.has_result());
    }

    #[test]
    fn test_bool_inverse_and_reflex_are_involutions() {
        for op in Opcode::ALL {
            if let Some(inv) = op.bool_inverse() {
                assert_eq!(inv.bool_inverse(), Some(*op));
            }
            if let Some(refl) = op.bool_reflex() {
                assert_eq!(refl.bool_reflex(), Some(*op));
            }
        }
    }
}
