//! A token bucket implementation,
//! and async types which use the token bucket for rate limiting.

pub(crate) mod bucket;
pub(crate) mod dynamic_writer;
pub(crate) mod writer;
