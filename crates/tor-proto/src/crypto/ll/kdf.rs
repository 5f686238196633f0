//! Key derivation functions (KDFs) used to turn handshake outputs into
//! usable session keys.
//!
//! Different parts of the Tor protocol use different KDFs: the legacy
//! "KDF-TOR" construction (used by the deprecated TAP and CREATE_FAST
//! handshakes), and a SHAKE-256-based construction (used by some newer
//! handshakes).  Both are exposed here behind the [`Kdf`] trait so that
//! [`super::super::handshake::KeyGenerator`] implementations can be
//! generic over which one they use.

use crate::{Error, Result};
use digest::{ExtendableOutput, Update, XofReader};
use tor_bytes::SecretBuf;
use tor_llcrypto::d::{Sha1, Shake256};

/// A trait for a key-derivation function used to expand a handshake seed
/// into a usable amount of key material.
pub(crate) trait Kdf {
    /// Derive `keylen` bytes of key material from `seed`.
    fn derive(&self, seed: &[u8], keylen: usize) -> Result<SecretBuf>;
}

/// The legacy "KDF-TOR" key derivation function.
///
/// This KDF is defined (for historical reasons) as the concatenation of
/// `SHA1(seed | [i])` for `i` in an increasing sequence of single bytes.
///
/// The starting value of `i` is configurable via [`LegacyKdf::new`] so
/// that a single seed can be used to derive more than one independent
/// stream of key material (by starting each stream's counter where the
/// previous one left off).
pub(crate) struct LegacyKdf {
    /// The first counter byte to use.
    start: u8,
}

impl LegacyKdf {
    /// Create a new LegacyKdf, whose output starts at the given counter
    /// value.
    pub(crate) fn new(start: u8) -> Self {
        LegacyKdf { start }
    }
}

impl Kdf for LegacyKdf {
    fn derive(&self, seed: &[u8], keylen: usize) -> Result<SecretBuf> {
        use digest::Digest;

        let mut result = SecretBuf::new();
        let mut counter = self.start;
        while result.len() < keylen {
            let mut d = Sha1::new();
            d.update(seed);
            d.update([counter]);
            let digest = d.finalize();
            result.extend_from_slice(&digest);
            counter = counter
                .checked_add(1)
                .ok_or(Error::InvalidOutputLength)?;
        }
        result.truncate(keylen);
        Ok(result)
    }
}

/// A key derivation function based on SHAKE-256.
///
/// This is simpler than [`LegacyKdf`]: since SHAKE-256 is an extendable
/// output function, we can just read as many bytes as we need directly
/// out of it.
pub(crate) struct ShakeKdf {}

impl ShakeKdf {
    /// Create a new ShakeKdf.
    pub(crate) fn new() -> Self {
        ShakeKdf {}
    }
}

impl Kdf for ShakeKdf {
    fn derive(&self, seed: &[u8], keylen: usize) -> Result<SecretBuf> {
        let mut xof = Shake256::default();
        xof.update(seed);
        let mut reader = xof.finalize_xof();
        let mut result: SecretBuf = vec![0_u8; keylen].into();
        reader.read(result.as_mut());
        Ok(result)
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
    fn legacy_kdf_is_deterministic_and_sized() {
        let seed = b"this is a test seed, not a real one";
        let a = LegacyKdf::new(0).derive(seed, 100).unwrap();
        let b = LegacyKdf::new(0).derive(seed, 100).unwrap();
        assert_eq!(&a[..], &b[..]);
        assert_eq!(a.len(), 100);
    }

    #[test]
    fn legacy_kdf_offsets_give_disjoint_streams() {
        let seed = b"another test seed";
        let a = LegacyKdf::new(0).derive(seed, 20).unwrap();
        let b = LegacyKdf::new(1).derive(seed, 20).unwrap();
        assert_ne!(&a[..], &b[..]);
    }

    #[test]
    fn shake_kdf_is_deterministic_and_sized() {
        let seed = b"shake seed";
        let a = ShakeKdf::new().derive(seed, 256).unwrap();
        let b = ShakeKdf::new().derive(seed, 256).unwrap();
        assert_eq!(&a[..], &b[..]);
        assert_eq!(a.len(), 256);
    }
}
