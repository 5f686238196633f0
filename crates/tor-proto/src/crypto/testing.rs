//! Testing-only helpers for the `crypto` module.
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

use rand::{CryptoRng, RngCore};

/// A fake random number generator that just hands out the bytes it was
/// constructed with, in order.
///
/// This exists so that we can reproduce fixed test vectors that were
/// generated by another implementation of a handshake: we feed the
/// recorded "random" outputs of that run back in, and check that we
/// reach the same derived keys.
///
/// Panics if more bytes are requested than were provided.
pub(crate) struct FakePRNG<'a> {
    /// Remaining bytes to hand out.
    bytes: &'a [u8],
}

impl<'a> FakePRNG<'a> {
    /// Construct a new FakePRNG that will hand out the contents of `bytes`.
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        FakePRNG { bytes }
    }
}

impl<'a> RngCore for FakePRNG<'a> {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0_u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }
    fn next_u64(&mut self) -> u64 {
        let mut buf = [0_u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        assert!(
            dest.len() <= self.bytes.len(),
            "FakePRNG ran out of canned bytes"
        );
        let (head, tail) = self.bytes.split_at(dest.len());
        dest.copy_from_slice(head);
        self.bytes = tail;
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl<'a> CryptoRng for FakePRNG<'a> {}
