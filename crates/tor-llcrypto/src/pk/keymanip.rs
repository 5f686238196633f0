//! Conversions between curve25519 and ed25519 keys.
//!
//! Tor sometimes needs to prove that a curve25519 key and an ed25519 key
//! were generated from the same seed, without exposing the seed itself.
//! It does this with a "crosscert": an ed25519 certificate whose subject
//! key is the birational-map image of the curve25519 key on the twisted
//! Edwards curve.  These functions implement that mapping.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::Scalar;
use sha3::{Digest, Sha3_256};

use super::curve25519;
use super::ed25519;

/// Domain-separation prefix used when deriving a blinding factor for
/// onion-service key blinding, per rend-spec-v3 section A.2.
const BLIND_STRING: &[u8] = b"Derive temporary signing key";

/// Compute the blinding factor used to derive a blinded key from an
/// onion-service identity key, given the (unblinded) public key and a
/// `param` (typically derived from the current time period).
fn blinding_factor(pubkey: &ed25519::PublicKey, param: &[u8]) -> Scalar {
    let mut h = Sha3_256::new();
    h.update(BLIND_STRING);
    h.update(pubkey.to_bytes());
    h.update(param);
    let digest: [u8; 32] = h.finalize().into();
    Scalar::from_bytes_mod_order(digest)
}

/// Blind an ed25519 public key using `param`, yielding a blinded public
/// key that an onion service can use to publish its descriptors for a
/// given time period without revealing its long-term identity key.
///
/// Returns `None` if `pubkey` does not decode to a valid Edwards point, or
/// if the resulting point isn't a valid ed25519 public key.
pub fn blind_pubkey(pubkey: &ed25519::PublicKey, param: &[u8]) -> Option<ed25519::PublicKey> {
    let factor = blinding_factor(pubkey, param);
    let point = CompressedEdwardsY(pubkey.to_bytes())
        .decompress()?
        .mul_by_cofactor();
    let blinded: EdwardsPoint = point * factor;
    ed25519::PublicKey::from_bytes(blinded.compress().as_bytes()).ok()
}

/// Blind an ed25519 expanded keypair using `param`, the same way
/// [`blind_pubkey`] blinds the corresponding public key.
///
/// Returns `None` if the blinded secret key bytes don't form a valid
/// keypair.
pub fn blind_seckey(keypair: &ed25519::ExpandedKeypair, param: &[u8]) -> Option<ed25519::ExpandedKeypair> {
    let factor = blinding_factor(keypair.public(), param);
    let secret_bytes = keypair.to_secret_key_bytes();
    let (scalar_bytes, hash_prefix) = secret_bytes.split_at(32);

    let scalar = Scalar::from_bytes_mod_order(scalar_bytes.try_into().ok()?);
    let blinded_scalar = scalar * factor;

    let mut prefix_hash = Sha3_256::new();
    prefix_hash.update(hash_prefix);
    prefix_hash.update(factor.as_bytes());
    let blinded_prefix: [u8; 32] = prefix_hash.finalize().into();

    let mut blinded_bytes = [0_u8; 64];
    blinded_bytes[..32].copy_from_slice(blinded_scalar.as_bytes());
    blinded_bytes[32..].copy_from_slice(&blinded_prefix);

    ed25519::ExpandedKeypair::from_secret_key_bytes(blinded_bytes)
}

/// Convert a curve25519 public key into an ed25519 public key, for use in
/// verifying or constructing a crosscert.
///
/// The curve25519 birational map yields an Edwards point with two possible
/// signs for its `x` coordinate; `signbit` (which must be 0 or 1) selects
/// which one to use, matching whichever sign was used when the
/// corresponding crosscert was created.
///
/// Returns `None` if `pubkey` doesn't correspond to a valid point, or if
/// the resulting point isn't a valid ed25519 public key.
pub fn convert_curve25519_to_ed25519_public(
    pubkey: &curve25519::PublicKey,
    signbit: u8,
) -> Option<ed25519::PublicKey> {
    let point = MontgomeryPoint(*pubkey.as_bytes());
    let edward_point = point.to_edwards(signbit)?;
    ed25519::PublicKey::from_bytes(edward_point.compress().as_bytes()).ok()
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
    fn blinding_is_deterministic_and_preserves_relationship() {
        let mut rng = tor_basic_utils::test_rng::testing_rng();
        let keypair = ed25519::Keypair::generate(&mut rng);
        let expanded = ed25519::ExpandedKeypair::from(&keypair);
        let param = b"some time period";

        let blinded_pub_a = blind_pubkey(expanded.public(), param).unwrap();
        let blinded_pub_b = blind_pubkey(expanded.public(), param).unwrap();
        assert_eq!(blinded_pub_a.to_bytes(), blinded_pub_b.to_bytes());

        let blinded_keypair = blind_seckey(&expanded, param).unwrap();
        assert_eq!(blinded_keypair.public().to_bytes(), blinded_pub_a.to_bytes());

        let msg = b"hello from an onion service";
        let sig = blinded_keypair.sign(msg);
        assert!(blinded_keypair.public().verify_strict(msg, &sig).is_ok());
    }

    #[test]
    fn convert_is_deterministic() {
        let sk = curve25519::StaticSecret::random_from_rng(rand::rng());
        let pk = curve25519::PublicKey::from(&sk);

        let a = convert_curve25519_to_ed25519_public(&pk, 0);
        let b = convert_curve25519_to_ed25519_public(&pk, 0);
        assert_eq!(a.map(|k| k.to_bytes()), b.map(|k| k.to_bytes()));
    }

    #[test]
    fn sign_bit_changes_result() {
        let sk = curve25519::StaticSecret::random_from_rng(rand::rng());
        let pk = curve25519::PublicKey::from(&sk);

        let a = convert_curve25519_to_ed25519_public(&pk, 0);
        let b = convert_curve25519_to_ed25519_public(&pk, 1);
        // Both signs always yield *some* curve point, though not
        // necessarily a validly-encoded ed25519 key.
        if let (Some(a), Some(b)) = (a, b) {
            assert_ne!(a.to_bytes(), b.to_bytes());
        }
    }
}
