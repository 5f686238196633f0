//! A wrapper type to represent a fraction from 0-100% as its underlying
//! integer type, so that it isn't confused with a raw integer quantity.

use crate::Error;

/// A value that represents a percentage of something, stored as a number.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Percentage<T>(T);

impl<T> Percentage<T> {
    /// Create a new `Percentage` wrapping `val`, interpreted as a number of
    /// percentage points.
    pub fn new(val: T) -> Self {
        Percentage(val)
    }
}

impl<T: Copy> Percentage<T> {
    /// Return the underlying percentage value.
    pub fn as_percent(&self) -> T {
        self.0
    }
}

impl<T: Copy + Into<f64>> Percentage<T> {
    /// Return this percentage as a fraction between 0.0 and 1.0 (or beyond,
    /// if the underlying value is out of the usual range).
    pub fn as_fraction(&self) -> f64 {
        self.0.into() / 100.0
    }
}

impl<T: TryFrom<i32, Error = Error>> TryFrom<i32> for Percentage<T> {
    type Error = Error;
    fn try_from(val: i32) -> Result<Self, Error> {
        Ok(Percentage(T::try_from(val)?))
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
    use float_cmp::assert_approx_eq;

    #[test]
    fn fraction() {
        let p: Percentage<u32> = Percentage::new(50);
        assert_approx_eq!(f64, p.as_fraction(), 0.5);
        assert_eq!(p.as_percent(), 50);
    }
}
