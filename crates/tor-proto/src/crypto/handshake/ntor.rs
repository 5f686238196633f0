//! Implementation for the original (v1) ntor handshake, as described in
//! `tor-spec.txt`.
//!
//! The ntor handshake uses a curve25519 Diffie-Hellman exchange, combined
//! with the relay's long-term ed25519 identity, to give a client a
//! one-way-authenticated shared secret with a relay.  It replaced the
//! older TAP and CREATE_FAST handshakes and is (as of this writing) the
//! handshake used to extend most circuits.

#![allow(clippy::many_single_char_names)] // Matches the names used in tor-spec.txt.

use std::borrow::Borrow;

use super::{RelayHandshakeError, RelayHandshakeResult};
use crate::crypto::ll::kdf::Kdf;
use crate::{Error, Result};

use digest::Mac;
use hmac::Hmac;
use rand_core::{CryptoRng, RngCore};
use subtle::{Choice, ConstantTimeEq};
use tor_bytes::{Reader, SecretBuf, Writer};
use tor_error::into_internal;
use tor_llcrypto::d::Sha256;
use tor_llcrypto::pk::{curve25519, ed25519::Ed25519Identity};
use tor_llcrypto::util::ct::ct_lookup;

/// The protocol identifier, used to tweak our HMAC key material so that it
/// can't collide with anything else.
const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";

/// Length of a MAC/HMAC output in bytes.
const MAC_LEN: usize = 32;

/// Type for the HMAC-SHA256 output used throughout this handshake.
type MacVal = [u8; MAC_LEN];

/// Compute `HMAC-SHA256(key, data)`.
fn hmac_sha256(key: &[u8], data: &[u8]) -> MacVal {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC-SHA256 can take a key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Return `key || suffix`, as a freshly allocated byte vector.
fn with_suffix(suffix: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(PROTOID.len() + 1 + suffix.len());
    v.extend_from_slice(PROTOID);
    v.extend_from_slice(b":");
    v.extend_from_slice(suffix);
    v
}

/// Key-derivation function for the ntor handshake.
///
/// This is an HKDF-like construction built from HMAC-SHA256: first we
/// extract a pseudo-random key from `secret_input` using a fixed salt,
/// and then we expand that key iteratively to produce as much key
/// material as the caller needs.
struct NtorHkdf;

impl Kdf for NtorHkdf {
    fn derive(&self, secret_input: &[u8], keylen: usize) -> Result<SecretBuf> {
        let prk = hmac_sha256(&with_suffix(b"key_extract"), secret_input);
        let m_expand = with_suffix(b"key_expand");

        let mut result = SecretBuf::new();
        let mut last_block: Vec<u8> = Vec::new();
        let mut i: u8 = 1;
        while result.len() < keylen {
            let mut data = Vec::with_capacity(last_block.len() + m_expand.len() + 1);
            data.extend_from_slice(&last_block);
            data.extend_from_slice(&m_expand);
            data.push(i);
            let block = hmac_sha256(&prk, &data);
            result.extend_from_slice(&block);
            last_block = block.to_vec();
            i = i.checked_add(1).ok_or(Error::InvalidOutputLength)?;
        }
        result.truncate(keylen);
        Ok(result)
    }
}

/// A key generator returned from an ntor handshake, used to produce
/// session keys for the circuit.
pub(crate) struct NtorHkdfKeyGenerator {
    /// The secret_input that we derived from the handshake.
    seed: SecretBuf,
}

impl NtorHkdfKeyGenerator {
    /// Create a new key generator around a given secret_input.
    fn new(seed: SecretBuf) -> Self {
        NtorHkdfKeyGenerator { seed }
    }
}

impl super::KeyGenerator for NtorHkdfKeyGenerator {
    fn expand(self, keylen: usize) -> Result<SecretBuf> {
        NtorHkdf.derive(&self.seed[..], keylen)
    }
}

/// A public key, as used in the ntor handshake, together with the
/// relay's identity.
#[derive(Clone, Debug)]
pub(crate) struct NtorPublicKey {
    /// The relay's identity.
    pub(crate) id: Ed25519Identity,
    /// The relay's onion key.
    pub(crate) pk: curve25519::PublicKey,
}

/// The secret counterpart to an [`NtorPublicKey`], held by a relay.
pub(crate) struct NtorSecretKey {
    /// The relay's public key information.
    pk: NtorPublicKey,
    /// The relay's secret onion key.
    sk: curve25519::StaticSecret,
}

impl NtorSecretKey {
    /// Construct a new NtorSecretKey from its components.
    #[allow(dead_code)]
    pub(crate) fn new(
        sk: curve25519::StaticSecret,
        pk: curve25519::PublicKey,
        id: Ed25519Identity,
    ) -> Self {
        Self {
            pk: NtorPublicKey { id, pk },
            sk,
        }
    }

    /// Generate a key using the given `rng`, suitable for testing.
    #[cfg(test)]
    pub(crate) fn generate_for_test<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut id = [0_u8; 32];
        rng.fill_bytes(&mut id);
        let sk = curve25519::StaticSecret::random_from_rng(rng);
        let pk = NtorPublicKey {
            pk: (&sk).into(),
            id: id.into(),
        };
        Self { pk, sk }
    }

    /// Checks whether `id` and `pk` match this secret key, in constant time.
    fn matches(&self, id: Ed25519Identity, pk: curve25519::PublicKey) -> Choice {
        id.as_bytes().ct_eq(self.pk.id.as_bytes()) & pk.as_bytes().ct_eq(self.pk.pk.as_bytes())
    }
}

/// State held by a client between sending its part of the ntor handshake
/// and receiving the relay's reply.
pub(crate) struct NtorHandshakeState {
    /// The public key of the relay we're talking to.
    relay_public: NtorPublicKey, // B, ID
    /// Our ephemeral secret key for this handshake.
    my_sk: curve25519::StaticSecret, // x
    /// Our ephemeral public key for this handshake.
    my_public: curve25519::PublicKey, // X
}

/// Build the `secret_input` used to seed the handshake's KDF and MAC.
///
/// `xy` is `EXP(Y,x)` or `EXP(X,y)`, and `xb` is `EXP(B,x)` or `EXP(X,b)`:
/// whichever side is computing this, it must supply its own shared
/// secrets in that order.
fn secret_input(
    xy: &curve25519::SharedSecret,
    xb: &curve25519::SharedSecret,
    id: &Ed25519Identity,
    b: &curve25519::PublicKey,
    x: &curve25519::PublicKey,
    y: &curve25519::PublicKey,
) -> SecretBuf {
    let mut input = SecretBuf::new();
    input.extend_from_slice(xy.as_bytes());
    input.extend_from_slice(xb.as_bytes());
    input.extend_from_slice(id.as_bytes());
    input.extend_from_slice(b.as_bytes());
    input.extend_from_slice(x.as_bytes());
    input.extend_from_slice(y.as_bytes());
    input.extend_from_slice(PROTOID);
    input
}

/// Compute the AUTH value that both sides of the handshake must agree on.
fn auth_value(
    secret_input: &[u8],
    id: &Ed25519Identity,
    b: &curve25519::PublicKey,
    y: &curve25519::PublicKey,
    x: &curve25519::PublicKey,
) -> MacVal {
    let verify = hmac_sha256(&with_suffix(b"verify"), secret_input);
    let mut auth_input = Vec::new();
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(id.as_bytes());
    auth_input.extend_from_slice(b.as_bytes());
    auth_input.extend_from_slice(y.as_bytes());
    auth_input.extend_from_slice(x.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");
    hmac_sha256(&with_suffix(b"mac"), &auth_input)
}

/// Client side of the ntor handshake.
pub(crate) struct NtorClient;

impl super::ClientHandshake for NtorClient {
    type KeyType = NtorPublicKey;
    type StateType = NtorHandshakeState;
    type KeyGen = NtorHkdfKeyGenerator;
    type ClientAuxData = ();
    type ServerAuxData = ();

    fn client1<R: RngCore + CryptoRng, M: Borrow<()>>(
        rng: &mut R,
        key: &Self::KeyType,
        _client_aux_data: &M,
    ) -> Result<(Self::StateType, Vec<u8>)> {
        let my_sk = curve25519::StaticSecret::random_from_rng(rng);
        let my_public = curve25519::PublicKey::from(&my_sk);

        let mut message = Vec::new();
        message
            .write(&key.id)
            .and_then(|m| m.write(&key.pk))
            .and_then(|m| m.write(&my_public))
            .map_err(|e| Error::from_bytes_enc(e, "ntor handshake"))?;

        let state = NtorHandshakeState {
            relay_public: key.clone(),
            my_sk,
            my_public,
        };

        Ok((state, message))
    }

    fn client2<T: AsRef<[u8]>>(state: Self::StateType, msg: T) -> Result<((), Self::KeyGen)> {
        let msg = msg.as_ref();
        let mut r = Reader::from_slice(msg);
        let y: curve25519::PublicKey = r.extract().map_err(Error::BytesErr)?;
        let auth: MacVal = r.extract().map_err(Error::BytesErr)?;

        let xy = state.my_sk.diffie_hellman(&y);
        let xb = state.my_sk.diffie_hellman(&state.relay_public.pk);

        let secret_input = secret_input(
            &xy,
            &xb,
            &state.relay_public.id,
            &state.relay_public.pk,
            &state.my_public,
            &y,
        );
        let expected_auth = auth_value(
            &secret_input,
            &state.relay_public.id,
            &state.relay_public.pk,
            &y,
            &state.my_public,
        );

        if bool::from(!auth.ct_eq(&expected_auth)) {
            return Err(Error::BadCircHandshakeAuth);
        }

        Ok(((), NtorHkdfKeyGenerator::new(secret_input)))
    }
}

/// Relay side of the ntor handshake.
pub(crate) struct NtorServer;

impl super::ServerHandshake for NtorServer {
    type KeyType = NtorSecretKey;
    type KeyGen = NtorHkdfKeyGenerator;
    type ClientAuxData = ();
    type ServerAuxData = ();

    fn server<R: RngCore + CryptoRng, REPLY: super::AuxDataReply<Self>, T: AsRef<[u8]>>(
        rng: &mut R,
        reply_fn: &mut REPLY,
        keys: &[Self::KeyType],
        msg: T,
    ) -> RelayHandshakeResult<(Self::KeyGen, Vec<u8>)> {
        let _reply_extensions: () = reply_fn
            .reply(&())
            .ok_or(RelayHandshakeError::BadClientHandshake)?;

        let msg = msg.as_ref();
        let mut r = Reader::from_slice(msg);
        let id: Ed25519Identity = r.extract()?;
        let requested_pk: curve25519::PublicKey = r.extract()?;
        let x: curve25519::PublicKey = r.extract()?;

        let keypair = ct_lookup(keys, |k| k.matches(id, requested_pk))
            .ok_or(RelayHandshakeError::MissingKey)?;

        let secret_key_y = curve25519::StaticSecret::random_from_rng(rng);
        let y = curve25519::PublicKey::from(&secret_key_y);

        let xy = secret_key_y.diffie_hellman(&x);
        let xb = keypair.sk.diffie_hellman(&x);

        let secret_input = secret_input(&xy, &xb, &id, &keypair.pk.pk, &x, &y);
        let auth = auth_value(&secret_input, &id, &keypair.pk.pk, &y, &x);

        let mut reply = Vec::new();
        reply
            .write(&y)
            .and_then(|m| m.write(&auth))
            .map_err(into_internal!("Can't encode ntor server reply"))?;

        Ok((NtorHkdfKeyGenerator::new(secret_input), reply))
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
    use crate::crypto::handshake::{ClientHandshake, KeyGenerator, ServerHandshake};
    use tor_basic_utils::test_rng::testing_rng;

    #[test]
    fn roundtrip() {
        let mut rng = testing_rng();
        let relay_sk = NtorSecretKey::generate_for_test(&mut rng);
        let relay_pk = relay_sk.pk.clone();

        let (state, cmsg) = NtorClient::client1(&mut rng, &relay_pk, &()).unwrap();
        let (s_keygen, smsg) =
            NtorServer::server(&mut rng, &mut |_: &()| Some(()), &[relay_sk], cmsg).unwrap();
        let (_, c_keygen) = NtorClient::client2(state, smsg).unwrap();

        let skeys = s_keygen.expand(200).unwrap();
        let ckeys = c_keygen.expand(200).unwrap();
        assert_eq!(skeys, ckeys);
    }

    #[test]
    fn missing_key_is_rejected() {
        let mut rng = testing_rng();
        let relay_sk = NtorSecretKey::generate_for_test(&mut rng);
        let other_relay_sk = NtorSecretKey::generate_for_test(&mut rng);
        let relay_pk = relay_sk.pk.clone();

        let (_state, cmsg) = NtorClient::client1(&mut rng, &relay_pk, &()).unwrap();
        // The relay only has a key for a *different* identity, so it can't
        // even produce an answer.
        let ans = NtorServer::server(&mut rng, &mut |_: &()| Some(()), &[other_relay_sk], cmsg);
        assert!(matches!(ans, Err(RelayHandshakeError::MissingKey)));
    }

    #[test]
    fn corrupt_reply_is_rejected() {
        let mut rng = testing_rng();
        let relay_sk = NtorSecretKey::generate_for_test(&mut rng);
        let relay_pk = relay_sk.pk.clone();

        let (state, cmsg) = NtorClient::client1(&mut rng, &relay_pk, &()).unwrap();
        let (_s_keygen, mut smsg) =
            NtorServer::server(&mut rng, &mut |_: &()| Some(()), &[relay_sk], cmsg).unwrap();
        *smsg.last_mut().unwrap() ^= 0xff;
        let ans = NtorClient::client2(state, smsg);
        assert!(ans.is_err());
    }
}
