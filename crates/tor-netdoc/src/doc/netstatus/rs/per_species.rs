//! router status entries - types that vary by document flavour
//!
//! **This file is reincluded multiple times**,
//! once for votes, and once for each consensus flavour.
//!
//! Each time, with different behaviour for the macros `ns_***`.
//!
//! See [`crate::doc::ns_per_species_macros`].

#[allow(unused)] // XXXX
use super::*;
