//! Declare an error type for tor-units

/// An error type for bad conversions to and from the bounded/checked types
/// exposed by this crate.
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Tried to construct a bounded type with a value that was too low.
    #[error("Value {0} under the lowest allowable value")]
    BelowLowerBound(i32),
    /// Tried to construct a bounded type with a value that was too high.
    #[error("Value {0} over the highest allowable value")]
    AboveUpperBound(i32),
    /// Tried to convert an out-of-range value into a bounded integer type.
    #[error("Value could not be represented as an i32")]
    Unrepresentable,
}
