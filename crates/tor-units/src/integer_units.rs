//! Wrapper types for integers that represent a duration in a fixed unit
//! (seconds, milliseconds, or minutes), so that a mismatched multiplication
//! or comparison turns into a compile error rather than a silent bug.

use crate::Error;
use std::convert::TryFrom;
use std::time::Duration;

/// Declare an integer-duration wrapper type, along with its conversions
/// to and from [`Duration`].
///
/// `$secs_per_unit` gives the number of seconds represented by one unit
/// (it may be a fraction, expressed as `num / den`, for sub-second units).
macro_rules! integer_duration {
    { $(#[$meta:meta])* pub struct $name:ident => ($num:expr, $den:expr); } => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug,
            derive_more::Display,
            serde::Serialize, serde::Deserialize,
        )]
        pub struct $name<T>(T);

        impl<T> $name<T> {
            /// Wrap `val` as a number of these units.
            pub fn new(val: T) -> Self {
                Self(val)
            }
            /// Consume this wrapper and return the contained value.
            pub fn into_inner(self) -> T {
                self.0
            }
        }

        impl<T: Copy> $name<T> {
            /// Return the number of these units, without converting.
            pub fn get(&self) -> T {
                self.0
            }
        }

        impl<T: TryFrom<i32, Error = Error>> TryFrom<i32> for $name<T> {
            type Error = Error;
            fn try_from(val: i32) -> Result<Self, Error> {
                Ok(Self(T::try_from(val)?))
            }
        }

        impl<T: TryInto<u64>> TryFrom<$name<T>> for Duration {
            type Error = Error;
            fn try_from(val: $name<T>) -> Result<Duration, Error> {
                let units: u64 = val.0.try_into().map_err(|_| Error::Unrepresentable)?;
                let secs = units
                    .checked_mul($num)
                    .ok_or(Error::Unrepresentable)?
                    / $den;
                Ok(Duration::from_secs(secs))
            }
        }

        impl<T: std::ops::Mul<u32, Output = T>> std::ops::Mul<u32> for $name<T> {
            type Output = $name<T>;
            fn mul(self, rhs: u32) -> $name<T> {
                $name(self.0 * rhs)
            }
        }
    }
}

integer_duration! {
    /// A number of minutes, stored as an integer.
    pub struct IntegerMinutes => (60, 1);
}
integer_duration! {
    /// A number of seconds, stored as an integer.
    pub struct IntegerSeconds => (1, 1);
}
integer_duration! {
    /// A number of milliseconds, stored as an integer.
    pub struct IntegerMilliseconds => (1, 1000);
}

impl IntegerMinutes<u32> {
    /// Return the number of minutes represented by this value.
    pub fn as_minutes(&self) -> u32 {
        self.0
    }
}
impl IntegerSeconds<u32> {
    /// Return the number of seconds represented by this value.
    pub fn as_secs(&self) -> u32 {
        self.0
    }
}
impl IntegerMilliseconds<u32> {
    /// Return the number of milliseconds represented by this value.
    pub fn as_millis(&self) -> u32 {
        self.0
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
    fn minutes_to_duration() {
        let m = IntegerMinutes::new(5_u32);
        let d: Duration = m.try_into().unwrap();
        assert_eq!(d, Duration::from_secs(300));
    }

    #[test]
    fn millis_to_duration() {
        let m = IntegerMilliseconds::new(2500_u32);
        let d: Duration = m.try_into().unwrap();
        assert_eq!(d, Duration::from_secs(2));
    }
}
