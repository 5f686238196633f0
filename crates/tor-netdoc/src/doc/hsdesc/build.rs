//! Functionality for encoding and signing onion service descriptors.
//!
//! This module assembles the inner, middle, and outer documents of an onion
//! service descriptor (see [`super`]), encrypting each layer in turn, and
//! producing the final signed descriptor text that gets uploaded to an
//! HsDir.

mod inner;
mod middle;
mod outer;

use inner::HsDescInner;
use middle::HsDescMiddleBuilder;
use outer::HsDescOuter;

use crate::doc::hsdesc::desc_enc::{HsDescEncNonce, HsDescEncryption};
use crate::doc::hsdesc::middle::AuthClient;
use crate::doc::hsdesc::{create_desc_sign_key_cert, IntroAuthType, IntroPointDesc};
use crate::NetdocBuilder;

use rand::{CryptoRng, Rng, RngCore};
use tor_bytes::EncodeError;
use tor_cell::chancell::msg::HandshakeType;
use tor_error::into_bad_api_usage;
use tor_hscrypto::pk::{HsBlindId, HsClientDescEncKey, HsSvcDescEncKey};
use tor_hscrypto::{RevisionCounter, Subcredential};
use tor_llcrypto::pk::curve25519;
use tor_llcrypto::pk::ed25519;
use tor_units::IntegerMinutes;

use smallvec::SmallVec;
use std::time::SystemTime;

#[cfg(feature = "hs-pow-full")]
use crate::doc::hsdesc::pow::PowParams;

/// The ephemeral keys and authorized clients used to build the client
/// authentication section of the middle document of an onion service
/// descriptor.
///
/// This is built by [`HsDescBuilder`] from the set of clients authorized to
/// decrypt the descriptor, and is used only when client authorization is
/// enabled.
pub(super) struct ClientAuth {
    /// The ephemeral public key the service generated for this descriptor
    /// (`KP_hss_desc_enc`).
    pub(super) ephemeral_key: HsSvcDescEncKey,
    /// The `auth-client` lines of the middle document: one per authorized
    /// client.
    pub(super) auth_clients: Vec<AuthClient>,
    /// The descriptor cookie (`N_hs_desc_enc`) used to derive the encryption
    /// key for the inner document.
    pub(super) descriptor_cookie: [u8; 16],
}

/// A request to build and sign a new onion service descriptor.
///
/// After setting all the fields of this builder, call [`build_sign`](
/// NetdocBuilder::build_sign) to produce the signed descriptor text.
#[derive(Debug, derive_builder::Builder)]
#[builder(
    public,
    derive(Debug),
    build_fn(private, name = "build_unchecked", error = "tor_error::Bug")
)]
pub struct HsDescBuilder<'a> {
    /// The blinded identity of the onion service, used to identify this
    /// descriptor and to validate the descriptor-signing-key certificate.
    blinded_id: &'a HsBlindId,
    /// The blinded signing keypair corresponding to `blinded_id`: this signs
    /// the descriptor-signing-key certificate.
    hs_blind_id_key: &'a ed25519::ExpandedKeypair,
    /// The short-term descriptor signing key: this signs the outer document.
    hs_desc_sign: &'a ed25519::Keypair,
    /// When the descriptor-signing-key certificate expires.
    hs_desc_sign_cert_expiry: SystemTime,
    /// The onion service's subcredential for the current time period.
    subcredential: &'a Subcredential,
    /// A revision counter to tell whether this descriptor is more or less
    /// recent than another one for the same blinded ID.
    revision_counter: RevisionCounter,
    /// The lifetime of this descriptor, in minutes.
    #[builder(default = "IntegerMinutes::new(180)")]
    lifetime: IntegerMinutes<u16>,
    /// A list of recognized CREATE handshakes that this onion service
    /// supports.
    create2_formats: &'a [HandshakeType],
    /// A list of authentication types that this onion service supports.
    #[builder(default)]
    auth_required: Option<SmallVec<[IntroAuthType; 2]>>,
    /// If true, this is a "single onion service" and is not trying to keep
    /// its own location private.
    #[builder(default)]
    is_single_onion_service: bool,
    /// One or more introduction points used to contact the onion service.
    intro_points: &'a [IntroPointDesc],
    /// The expiration time of an introduction point authentication key
    /// certificate.
    intro_auth_key_cert_expiry: SystemTime,
    /// The expiration time of an introduction point encryption key
    /// certificate.
    intro_enc_key_cert_expiry: SystemTime,
    /// Proof-of-work parameters.
    #[cfg(feature = "hs-pow-full")]
    #[builder(default)]
    pow_params: Option<&'a PowParams>,
    /// The clients authorized to decrypt this descriptor, if client
    /// authentication is enabled. If set to `None`, client authentication is
    /// disabled, and any client can decrypt the descriptor.
    #[builder(default)]
    client_auth: Option<&'a [HsClientDescEncKey]>,
}

impl<'a> NetdocBuilder for HsDescBuilder<'a> {
    fn build_sign<R: RngCore + CryptoRng>(self, rng: &mut R) -> Result<String, EncodeError> {
        let HsDescBuilder {
            blinded_id,
            hs_blind_id_key,
            hs_desc_sign,
            hs_desc_sign_cert_expiry,
            subcredential,
            revision_counter,
            lifetime,
            create2_formats,
            auth_required,
            is_single_onion_service,
            intro_points,
            intro_auth_key_cert_expiry,
            intro_enc_key_cert_expiry,
            #[cfg(feature = "hs-pow-full")]
            pow_params,
            client_auth,
        } = self
            .build_unchecked()
            .map_err(into_bad_api_usage!("the HsDescBuilder could not be built"))?;

        let inner_doc = HsDescInner {
            hs_desc_sign,
            create2_formats,
            auth_required: auth_required.as_ref(),
            is_single_onion_service,
            intro_points,
            intro_auth_key_cert_expiry,
            intro_enc_key_cert_expiry,
            #[cfg(feature = "hs-pow-full")]
            pow_params,
        }
        .build_sign(&mut *rng)
        .map_err(into_bad_api_usage!("could not build the inner document"))?;

        let (client_auth, descriptor_cookie) = build_client_auth(rng, client_auth, subcredential);
        let desc_enc_nonce = client_auth
            .as_ref()
            .map(|_| HsDescEncNonce::from(descriptor_cookie));

        let encrypt_inner = HsDescEncryption {
            blinded_id,
            desc_enc_nonce: desc_enc_nonce.as_ref(),
            subcredential,
            revision: revision_counter,
            string_const: b"hsdir-encrypted-data",
        };
        let encrypted_inner = encrypt_inner.encrypt(rng, inner_doc.as_bytes());

        let middle_doc = HsDescMiddleBuilder::default()
            .client_auth(client_auth.as_ref())
            .encrypted(encrypted_inner)
            .build_sign(&mut *rng)
            .map_err(into_bad_api_usage!("could not build the middle document"))?;

        let superencrypt_middle = HsDescEncryption {
            blinded_id,
            desc_enc_nonce: None,
            subcredential,
            revision: revision_counter,
            string_const: b"hsdir-superencrypted-data",
        };
        let superencrypted = superencrypt_middle.encrypt(rng, middle_doc.as_bytes());

        let hs_desc_sign_cert = create_desc_sign_key_cert(
            &hs_desc_sign.verifying_key(),
            hs_blind_id_key,
            hs_desc_sign_cert_expiry,
        )
        .map_err(into_bad_api_usage!(
            "could not sign the descriptor-signing-key certificate"
        ))?;

        HsDescOuter {
            hs_desc_sign,
            hs_desc_sign_cert,
            lifetime,
            revision_counter,
            superencrypted,
        }
        .build_sign(rng)
    }
}

/// Build the `ClientAuth` (and its matching descriptor cookie) for a
/// descriptor, given the set of clients authorized to decrypt it.
///
/// Returns `(None, _)` if client authentication is disabled.
fn build_client_auth<R: RngCore + CryptoRng>(
    rng: &mut R,
    authorized_clients: Option<&[HsClientDescEncKey]>,
    subcredential: &Subcredential,
) -> (Option<ClientAuth>, [u8; 16]) {
    use crate::doc::hsdesc::desc_enc::build_descriptor_cookie_key;

    let descriptor_cookie: [u8; 16] = rng.gen();

    let Some(authorized_clients) = authorized_clients else {
        return (None, descriptor_cookie);
    };

    let ephemeral_secret = curve25519::StaticSecret::random_from_rng(&mut *rng);
    let ephemeral_key = HsSvcDescEncKey::from(curve25519::PublicKey::from(&ephemeral_secret));

    let auth_clients = authorized_clients
        .iter()
        .map(|client_key| {
            use cipher::{KeyIvInit, StreamCipher};
            use tor_llcrypto::cipher::aes::Aes256Ctr as Cipher;

            let (client_id, cookie_key) =
                build_descriptor_cookie_key(&ephemeral_secret, client_key.as_ref(), subcredential);
            let iv: [u8; 16] = rng.gen();
            let mut encrypted_cookie = descriptor_cookie;
            let mut cipher = Cipher::new(&cookie_key.into(), &iv.into());
            cipher.apply_keystream(&mut encrypted_cookie);

            AuthClient {
                client_id,
                iv,
                encrypted_cookie,
            }
        })
        .collect();

    (
        Some(ClientAuth {
            ephemeral_key,
            auth_clients,
            descriptor_cookie,
        }),
        descriptor_cookie,
    )
}

#[cfg(any(test, feature = "hs-service"))]
#[allow(missing_docs)]
pub(crate) mod test {
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
    use tor_bytes::EncodeError;
    use tor_hscrypto::pk::{HsIntroPtSessionIdKey, HsSvcNtorKey};
    use tor_linkspec::LinkSpec;

    /// A fixed curve25519 public key, usable as dummy test data.
    pub(crate) const TEST_CURVE25519_PUBLIC1: [u8; 32] = [3; 32];

    /// A fixed descriptor cookie, usable as dummy test data.
    pub(crate) const TEST_DESCRIPTOR_COOKIE: [u8; 16] = [9; 16];

    /// Extract the message from a `Bug`-flavored `EncodeError`, panicking if
    /// the error isn't a `Bug`.
    pub(crate) fn expect_bug(err: EncodeError) -> String {
        match err {
            EncodeError::Bug(bug) => bug.to_string(),
            other => panic!("expected EncodeError::Bug, got {:?}", other),
        }
    }

    /// Build a dummy introduction point descriptor using `link_specifiers`.
    pub(crate) fn create_intro_point_descriptor<R: RngCore + CryptoRng>(
        rng: &mut R,
        link_specifiers: &[LinkSpec],
    ) -> IntroPointDesc {
        let link_specifiers = link_specifiers
            .iter()
            .map(|ls| ls.encode().expect("failed to encode link specifier"))
            .collect();
        let ipt_ntor_key =
            curve25519::PublicKey::from(&curve25519::StaticSecret::random_from_rng(&mut *rng));
        let ipt_sid_key =
            HsIntroPtSessionIdKey::from(ed25519::Keypair::generate(rng).verifying_key());
        let svc_ntor_key = HsSvcNtorKey::from(curve25519::PublicKey::from(
            &curve25519::StaticSecret::random_from_rng(&mut *rng),
        ));

        IntroPointDesc {
            link_specifiers,
            ipt_ntor_key,
            ipt_sid_key,
            svc_ntor_key,
        }
    }
}
