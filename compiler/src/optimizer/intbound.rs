//! Inclusive integer ranges

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntBound {
    pub lower: i64,
    pub upper: i64,
}

impl Default for IntBound {
    fn default() -> Self {
        Self::FULL
    }
}

impl IntBound {
    pub const FULL: IntBound = IntBound {
        lower: i64::MIN,
        upper: i64::MAX,
    };

    pub const BOOL: IntBound = IntBound { lower: 0, upper: 1 };

    pub const NONNEGATIVE: IntBound = IntBound {
        lower: 0,
        upper: i64::MAX,
    };

    pub fn new(lower: i64, upper: i64) -> Self {
        debug_assert!(lower <= upper, "empty bound [{}, {}]", lower, upper);
        Self { lower, upper }
    }

    pub fn exact(value: i64) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    pub fn is_full(&self) -> bool {
        *self == Self::FULL
    }

    pub fn constant(&self) -> Option<i64> {
        (self.lower == self.upper).then_some(self.lower)
    }

    pub fn contains(&self, value: i64) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Whether every value of `other` is also in `self`
    pub fn contains_bound(&self, other: &IntBound) -> bool {
        self.lower <= other.lower && other.upper <= self.upper
    }

    pub fn is_nonnegative(&self) -> bool {
        self.lower >= 0
    }

    /// `None` when the two ranges are disjoint
    pub fn intersect(&self, other: &IntBound) -> Option<IntBound> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        (lower <= upper).then_some(IntBound { lower, upper })
    }

    pub fn union(&self, other: &IntBound) -> IntBound {
        IntBound {
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    /// Loosen every side of `self` that `other` escapes to the type limit,
    /// so repeated widening reaches a fixed point in two steps
    pub fn widen(&self, other: &IntBound) -> IntBound {
        IntBound {
            lower: if other.lower < self.lower {
                i64::MIN
            } else {
                self.lower
            },
            upper: if other.upper > self.upper {
                i64::MAX
            } else {
                self.upper
            },
        }
    }

    pub fn known_lt(&self, other: &IntBound) -> bool {
        self.upper < other.lower
    }

    pub fn known_le(&self, other: &IntBound) -> bool {
        self.upper <= other.lower
    }

    pub fn known_gt(&self, other: &IntBound) -> bool {
        other.known_lt(self)
    }

    pub fn known_ge(&self, other: &IntBound) -> bool {
        other.known_le(self)
    }

    pub fn known_eq(&self, other: &IntBound) -> bool {
        matches!((self.constant(), other.constant()), (Some(a), Some(b)) if a == b)
    }

    pub fn known_ne(&self, other: &IntBound) -> bool {
        self.intersect(other).is_none()
    }

    pub fn add(&self, other: &IntBound) -> IntBound {
        match (
            self.lower.checked_add(other.lower),
            self.upper.checked_add(other.upper),
        ) {
            (Some(lower), Some(upper)) => IntBound { lower, upper },
            _ => Self::FULL,
        }
    }

    pub fn sub(&self, other: &IntBound) -> IntBound {
        match (
            self.lower.checked_sub(other.upper),
            self.upper.checked_sub(other.lower),
        ) {
            (Some(lower), Some(upper)) => IntBound { lower, upper },
            _ => Self::FULL,
        }
    }

    pub fn mul(&self, other: &IntBound) -> IntBound {
        let corners = [
            self.lower.checked_mul(other.lower),
            self.lower.checked_mul(other.upper),
            self.upper.checked_mul(other.lower),
            self.upper.checked_mul(other.upper),
        ];
        let mut lower = i64::MAX;
        let mut upper = i64::MIN;
        for corner in corners {
            match corner {
                Some(v) => {
                    lower = lower.min(v);
                    upper = upper.max(v);
                }
                None => return Self::FULL,
            }
        }
        IntBound { lower, upper }
    }

    pub fn neg(&self) -> IntBound {
        match (self.upper.checked_neg(), self.lower.checked_neg()) {
            (Some(lower), Some(upper)) => IntBound { lower, upper },
            _ => Self::FULL,
        }
    }

    pub fn add_cannot_overflow(&self, other: &IntBound) -> bool {
        self.lower.checked_add(other.lower).is_some() && self.upper.checked_add(other.upper).is_some()
    }

    pub fn sub_cannot_overflow(&self, other: &IntBound) -> bool {
        self.lower.checked_sub(other.upper).is_some() && self.upper.checked_sub(other.lower).is_some()
    }

    pub fn mul_cannot_overflow(&self, other: &IntBound) -> bool {
        [self.lower, self.upper]
            .iter()
            .all(|a| [other.lower, other.upper].iter().all(|b| a.checked_mul(*b).is_some()))
    }

    pub fn and(&self, other: &IntBound) -> IntBound {
        match (self.is_nonnegative(), other.is_nonnegative()) {
            (true, true) => IntBound::new(0, self.upper.min(other.upper)),
            (true, false) => IntBound::new(0, self.upper),
            (false, true) => IntBound::new(0, other.upper),
            (false, false) => Self::FULL,
        }
    }

    /// Bound for `or` and `xor` of two non-negative ranges
    pub fn or(&self, other: &IntBound) -> IntBound {
        if self.is_nonnegative() && other.is_nonnegative() {
            let high = self.upper.max(other.upper) as u64;
            let mask = if high == 0 {
                0
            } else {
                u64::MAX >> high.leading_zeros()
            };
            IntBound::new(0, mask as i64)
        } else {
            Self::FULL
        }
    }

    pub fn lshift(&self, count: &IntBound) -> IntBound {
        let Some(c) = count.constant() else {
            return Self::FULL;
        };
        if !(0..63).contains(&c) {
            return Self::FULL;
        }
        let shift = |v: i64| {
            let shifted = v.wrapping_shl(c as u32);
            (shifted >> c == v).then_some(shifted)
        };
        match (shift(self.lower), shift(self.upper)) {
            (Some(lower), Some(upper)) => IntBound { lower, upper },
            _ => Self::FULL,
        }
    }

    pub fn rshift(&self, count: &IntBound) -> IntBound {
        match count.constant() {
            Some(c) if (0..64).contains(&c) => IntBound {
                lower: self.lower >> c,
                upper: self.upper >> c,
            },
            _ if self.is_nonnegative() && count.is_nonnegative() => IntBound::new(0, self.upper),
            _ => Self::FULL,
        }
    }

    /// Bound for `uint_rshift`
    pub fn urshift(&self, count: &IntBound) -> IntBound {
        match count.constant() {
            Some(c) if self.is_nonnegative() && (0..64).contains(&c) => {
                IntBound::new(self.lower >> c, self.upper >> c)
            }
            Some(c) if (1..64).contains(&c) => IntBound::new(0, (u64::MAX >> c) as i64),
            _ if self.is_nonnegative() => IntBound::new(0, self.upper),
            _ => Self::FULL,
        }
    }

    /// Tighten so that every value is `< other`'s maximum; `false` if empty
    pub fn make_lt(&mut self, other: &IntBound) -> bool {
        match other.upper.checked_sub(1) {
            Some(max) => self.tighten(i64::MIN, max),
            None => false,
        }
    }

    pub fn make_le(&mut self, other: &IntBound) -> bool {
        self.tighten(i64::MIN, other.upper)
    }

    pub fn make_gt(&mut self, other: &IntBound) -> bool {
        match other.lower.checked_add(1) {
            Some(min) => self.tighten(min, i64::MAX),
            None => false,
        }
    }

    pub fn make_ge(&mut self, other: &IntBound) -> bool {
        self.tighten(other.lower, i64::MAX)
    }

    fn tighten(&mut self, lower: i64, upper: i64) -> bool {
        match self.intersect(&IntBound { lower, upper }) {
            Some(b) => {
                *self = b;
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for IntBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |v: i64| match v {
            i64::MIN => "-inf".to_string(),
            i64::MAX => "inf".to_string(),
            v => v.to_string(),
        };
        write!(f, "[{}, {}]", side(self.lower), side(self.upper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_comparisons() {
        let small = IntBound::new(0, 3);
        let big = IntBound::new(4, 10);
        assert!(small.known_lt(&big));
        assert!(big.known_gt(&small));
        assert!(small.known_ne(&big));
        assert!(!small.known_lt(&IntBound::new(3, 5)));
        assert!(IntBound::exact(5).known_eq(&IntBound::exact(5)));
    }

    #[test]
    fn test_arithmetic_saturates_to_full() {
        let b = IntBound::new(1, 10);
        assert_eq!(b.add(&IntBound::exact(5)), IntBound::new(6, 15));
        assert_eq!(b.sub(&IntBound::new(0, 2)), IntBound::new(-1, 10));
        assert_eq!(b.mul(&IntBound::new(-2, 2)), IntBound::new(-20, 20));
        assert!(IntBound::new(0, i64::MAX).add(&b).is_full());
        assert!(!IntBound::new(0, i64::MAX).add_cannot_overflow(&b));
        assert!(b.add_cannot_overflow(&b));
    }

    #[test]
    fn test_bitwise_bounds() {
        let a = IntBound::new(0, 5);
        assert_eq!(a.and(&IntBound::FULL), IntBound::new(0, 5));
        assert_eq!(a.or(&IntBound::new(0, 8)), IntBound::new(0, 15));
        assert_eq!(a.lshift(&IntBound::exact(2)), IntBound::new(0, 20));
        assert_eq!(IntBound::new(-8, 8).rshift(&IntBound::exact(1)), IntBound::new(-4, 4));
    }

    #[test]
    fn test_make_lt_tightens_or_reports_empty() {
        let mut b = IntBound::FULL;
        assert!(b.make_lt(&IntBound::exact(4)));
        assert_eq!(b.upper, 3);
        let mut c = IntBound::new(5, 9);
        assert!(!c.make_lt(&IntBound::exact(5)));
    }

    #[test]
    fn test_widen_jumps_to_limits() {
        let entry = IntBound::new(0, 0);
        let widened = entry.widen(&IntBound::new(1, 1));
        assert_eq!(widened, IntBound::new(0, i64::MAX));
        assert_eq!(widened.widen(&IntBound::new(2, 2)), widened);
    }
}
