//! Building support for the network document meta-format
//!
//! Implements building documents according to
//! [dir-spec.txt](https://spec.torproject.org/dir-spec).
//! section 1.2 and 1.3.
//!
//! This is a thin, `hs-service`-gated facade over [`crate::encode`],
//! which does the actual work and is compiled unconditionally (some
//! non-`hs-service` code, and this crate's own tests, also build
//! documents).

pub use crate::encode::{
    Cursor, ItemArgument, ItemEncoder, NetdocBuilder, NetdocEncoder, NetdocText,
};
