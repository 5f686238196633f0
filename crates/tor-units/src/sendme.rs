//! A type to represent the SENDME protocol version used for flow control.

use crate::Error;
use std::fmt;

/// A SENDME protocol version, as given in the `sendme-accept-min-version`
/// and `sendme-emit-min-version` consensus parameters.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize)]
pub struct SendMeVersion(u8);

impl SendMeVersion {
    /// Construct a new `SendMeVersion` from a raw version number.
    pub const fn new(v: u8) -> Self {
        SendMeVersion(v)
    }

    /// Return the raw version number.
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for SendMeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for SendMeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<i32> for SendMeVersion {
    type Error = Error;
    fn try_from(val: i32) -> Result<Self, Error> {
        u8::try_from(val)
            .map(SendMeVersion)
            .map_err(|_| Error::Unrepresentable)
    }
}
