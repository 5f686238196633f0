//! A bounded i32, for use when a network parameter is supposed to be
//! restricted to a given range.

use crate::Error;
use std::fmt;

/// An i32 that is restricted to lie within the inclusive range `[LOW, HIGH]`.
///
/// Values are clamped or rejected at construction time, so that once a
/// `BoundedInt32` exists, its value is known to satisfy the bound.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct BoundedInt32<const LOW: i32, const HIGH: i32> {
    /// The underlying value. Always within `[LOW, HIGH]`.
    value: i32,
}

impl<const LOW: i32, const HIGH: i32> BoundedInt32<LOW, HIGH> {
    /// The lowest valid value for this type.
    pub const LOWER: i32 = LOW;
    /// The highest valid value for this type.
    pub const UPPER: i32 = HIGH;

    /// Return the underlying value.
    pub fn get(&self) -> i32 {
        self.value
    }

    /// Clamp `val` into the allowable range and construct a new instance.
    pub fn saturating_new(val: i32) -> Self {
        BoundedInt32 {
            value: val.clamp(LOW, HIGH),
        }
    }

    /// Try to construct a new instance, returning an error if `val` is
    /// out-of-bounds.
    pub fn checked_new(val: i32) -> Result<Self, Error> {
        if val < LOW {
            Err(Error::BelowLowerBound(val))
        } else if val > HIGH {
            Err(Error::AboveUpperBound(val))
        } else {
            Ok(BoundedInt32 { value: val })
        }
    }

    /// Return the lowest valid value of this type.
    pub fn lower_bound() -> Self {
        BoundedInt32 { value: LOW }
    }
    /// Return the highest valid value of this type.
    pub fn upper_bound() -> Self {
        BoundedInt32 { value: HIGH }
    }
}

impl<const LOW: i32, const HIGH: i32> fmt::Debug for BoundedInt32<LOW, HIGH> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<const LOW: i32, const HIGH: i32> fmt::Display for BoundedInt32<LOW, HIGH> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<const LOW: i32, const HIGH: i32> TryFrom<i32> for BoundedInt32<LOW, HIGH> {
    type Error = Error;
    fn try_from(val: i32) -> Result<Self, Error> {
        Self::checked_new(val)
    }
}

impl<const LOW: i32, const HIGH: i32> From<BoundedInt32<LOW, HIGH>> for i32 {
    fn from(val: BoundedInt32<LOW, HIGH>) -> i32 {
        val.value
    }
}

impl<const LOW: i32, const HIGH: i32> TryFrom<BoundedInt32<LOW, HIGH>> for u64 {
    type Error = Error;
    fn try_from(val: BoundedInt32<LOW, HIGH>) -> Result<u64, Error> {
        u64::try_from(val.value).map_err(|_| Error::Unrepresentable)
    }
}

impl<const LOW: i32, const HIGH: i32> TryFrom<BoundedInt32<LOW, HIGH>> for u32 {
    type Error = Error;
    fn try_from(val: BoundedInt32<LOW, HIGH>) -> Result<u32, Error> {
        u32::try_from(val.value).map_err(|_| Error::Unrepresentable)
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    #[test]
    fn bounds() {
        type T = BoundedInt32<-10, 10>;
        assert_eq!(T::checked_new(5).unwrap().get(), 5);
        assert!(T::checked_new(11).is_err());
        assert!(T::checked_new(-11).is_err());
        assert_eq!(T::saturating_new(500).get(), 10);
        assert_eq!(T::saturating_new(-500).get(), -10);
    }
}
