//! Lower-level cryptographic building blocks that are shared by more than
//! one part of the Tor protocol.
//!
//! Right now, this module only has one thing in it: the key-derivation
//! functions (KDFs) used to turn handshake outputs into usable session
//! keys.

pub(crate) mod kdf;
