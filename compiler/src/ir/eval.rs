//! Pure-operation semantics.
//!
//! Constant folding and the reference backend both evaluate through this
//! module, so the optimizer can never fold a value the executed code would
//! not have produced. Integer arithmetic wraps; shift counts are taken
//! modulo 64; comparisons produce 0 or 1.

use super::{IrConst, Opcode, RuntimeValue};

/// Evaluate an always-pure, non-call operation
pub fn eval_pure(opcode: Opcode, args: &[RuntimeValue]) -> Option<RuntimeValue> {
    use Opcode::*;
    use RuntimeValue::{Float, Int};

    let int = |i: usize| args.get(i).and_then(|v| v.as_int());
    let float = |i: usize| args.get(i).and_then(|v| v.as_float());
    let flag = |b: bool| Some(Int(b as i64));

    match opcode {
        IntAdd => Some(Int(int(0)?.wrapping_add(int(1)?))),
        IntSub => Some(Int(int(0)?.wrapping_sub(int(1)?))),
        IntMul => Some(Int(int(0)?.wrapping_mul(int(1)?))),
        IntAnd => Some(Int(int(0)? & int(1)?)),
        IntOr => Some(Int(int(0)? | int(1)?)),
        IntXor => Some(Int(int(0)? ^ int(1)?)),
        IntLshift => Some(Int(int(0)?.wrapping_shl(int(1)? as u32))),
        IntRshift => Some(Int(int(0)?.wrapping_shr(int(1)? as u32))),
        UintRshift => Some(Int(((int(0)? as u64).wrapping_shr(int(1)? as u32)) as i64)),
        IntNeg => Some(Int(int(0)?.wrapping_neg())),
        IntInvert => Some(Int(!int(0)?)),
        IntIsTrue => flag(int(0)? != 0),
        IntIsZero => flag(int(0)? == 0),
        IntLt => flag(int(0)? < int(1)?),
        IntLe => flag(int(0)? <= int(1)?),
        IntGt => flag(int(0)? > int(1)?),
        IntGe => flag(int(0)? >= int(1)?),
        IntEq => flag(int(0)? == int(1)?),
        IntNe => flag(int(0)? != int(1)?),
        UintLt => flag((int(0)? as u64) < (int(1)? as u64)),
        UintLe => flag((int(0)? as u64) <= (int(1)? as u64)),
        UintGt => flag((int(0)? as u64) > (int(1)? as u64)),
        UintGe => flag((int(0)? as u64) >= (int(1)? as u64)),
        FloatAdd => Some(Float(float(0)? + float(1)?)),
        FloatSub => Some(Float(float(0)? - float(1)?)),
        FloatMul => Some(Float(float(0)? * float(1)?)),
        FloatTrueDiv => Some(Float(float(0)? / float(1)?)),
        FloatNeg => Some(Float(-float(0)?)),
        FloatAbs => Some(Float(float(0)?.abs())),
        FloatLt => flag(float(0)? < float(1)?),
        FloatLe => flag(float(0)? <= float(1)?),
        FloatGt => flag(float(0)? > float(1)?),
        FloatGe => flag(float(0)? >= float(1)?),
        FloatEq => flag(float(0)? == float(1)?),
        FloatNe => flag(float(0)? != float(1)?),
        CastIntToFloat => Some(Float(int(0)? as f64)),
        CastFloatToInt => Some(Int(float(0)? as i64)),
        PtrEq => flag(args.first()?.as_gcref()? == args.get(1)?.as_gcref()?),
        PtrNe => flag(args.first()?.as_gcref()? != args.get(1)?.as_gcref()?),
        SameAsI | SameAsR | SameAsF => args.first().copied(),
        _ => None,
    }
}

/// Evaluate an overflow-checking op: the wrapped result and whether it overflowed
pub fn eval_ovf(opcode: Opcode, a: i64, b: i64) -> Option<(i64, bool)> {
    match opcode {
        Opcode::IntAddOvf => Some(a.overflowing_add(b)),
        Opcode::IntSubOvf => Some(a.overflowing_sub(b)),
        Opcode::IntMulOvf => Some(a.overflowing_mul(b)),
        _ => None,
    }
}

/// Fold an operation whose arguments are all constants
pub fn fold_constants(opcode: Opcode, args: &[IrConst]) -> Option<IrConst> {
    if opcode.is_call() || !opcode.is_always_pure() {
        return None;
    }
    let values: Vec<RuntimeValue> = args.iter().map(|c| RuntimeValue::from(*c)).collect();
    eval_pure(opcode, &values).map(|v| v.to_const())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_arithmetic_wraps() {
        let r = eval_pure(
            Opcode::IntAdd,
            &[RuntimeValue::Int(i64::MAX), RuntimeValue::Int(1)],
        );
        assert_eq!(r, Some(RuntimeValue::Int(i64::MIN)));
        assert_eq!(eval_ovf(Opcode::IntAddOvf, i64::MAX, 1), Some((i64::MIN, true)));
        assert_eq!(eval_ovf(Opcode::IntMulOvf, 3, 4), Some((12, false)));
    }

    #[test]
    fn test_shifts() {
        let v = |op, a, b| eval_pure(op, &[RuntimeValue::Int(a), RuntimeValue::Int(b)]);
        assert_eq!(v(Opcode::IntRshift, -8, 1), Some(RuntimeValue::Int(-4)));
        assert_eq!(
            v(Opcode::UintRshift, -8, 60),
            Some(RuntimeValue::Int(0xf))
        );
        assert_eq!(v(Opcode::IntLshift, 1, 65), Some(RuntimeValue::Int(2)));
    }

    #[test]
    fn test_fold_constants_skips_calls_and_mismatched_kinds() {
        assert_eq!(
            fold_constants(Opcode::IntLt, &[IrConst::Int(1), IrConst::Addr(2)]),
            Some(IrConst::Int(1))
        );
        assert_eq!(fold_constants(Opcode::CallPureI, &[IrConst::Int(0)]), None);
        assert_eq!(fold_constants(Opcode::IntAdd, &[IrConst::NULL, IrConst::Int(1)]), None);
    }
}
