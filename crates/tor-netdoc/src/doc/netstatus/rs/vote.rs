//! Implementation for the style of router descriptors used in
//! old-style "ns" consensus documents.
//
// Read this file in conjunction with `each_variety.rs`.
// See "module scope" ns_variety_definition_macros.rs.

// Import `each_variety.rs`, appropriately variegated
ns_do_variety_vote! {}
