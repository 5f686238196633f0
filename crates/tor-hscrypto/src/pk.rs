//! Key type wrappers of various kinds used in onion services.
//
// NOTE: We define wrappers here as a safety net against confusing one kind of
// key for another: without a system like this, it can get pretty hard making
// sure that each key is used only in the right way.

use std::fmt::{self, Display};
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use digest::Digest;
use tor_llcrypto::d::Sha3_256;
use tor_llcrypto::pk::ed25519::Ed25519Identity;
use tor_llcrypto::pk::{curve25519, ed25519, keymanip};

use crate::macros::{define_bytes, define_pk_keypair};
use crate::time::TimePeriod;
use crate::Subcredential;

/// The version byte used in a v3 onion-service address. See rend-spec-v3
/// appendix 6.
const HS_ONION_VERSION: u8 = 3;

/// The suffix appended to the base32-encoded representation of an [`HsId`]
/// to make a full `.onion` address.
pub const HSID_ONION_SUFFIX: &str = ".onion";

/// Domain-separation string used when computing the checksum embedded in a
/// v3 `.onion` address. See rend-spec-v3 appendix 6.
const HS_ONION_CHECKSUM_STRING: &[u8] = b".onion checksum";

/// Compute the 2-byte checksum embedded in a v3 `.onion` address.
fn onion_checksum(pubkey: &[u8; 32]) -> [u8; 2] {
    let mut h = Sha3_256::new();
    h.update(HS_ONION_CHECKSUM_STRING);
    h.update(pubkey);
    h.update([HS_ONION_VERSION]);
    let digest = h.finalize();
    [digest[0], digest[1]]
}

/// An error that occurred while parsing a `.onion` address into an [`HsId`].
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum HsIdParseError {
    /// The string did not end with ".onion".
    #[error("Address did not end with {}", HSID_ONION_SUFFIX)]
    NotOnionAddress,
    /// The part before ".onion" was not valid base32.
    #[error("Could not decode base32 in onion address")]
    InvalidBase32,
    /// The decoded data was not the right length to be a v3 onion address.
    #[error("Onion address was the wrong length")]
    WrongLength,
    /// The decoded data claimed an onion-service version we don't support.
    #[error("Unrecognized onion service version")]
    BadVersion,
    /// The embedded checksum did not match the rest of the address.
    #[error("Incorrect checksum in onion address")]
    BadChecksum,
}

define_bytes! {
/// The identity of a v3 onion service.
///
/// This is the decoded and validated ed25519 public key that is encoded as a
/// `${base32}.onion` address.  When expanded, it is a public key whose
/// corresponding secret key is controlled by the onion service.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct HsId([u8; 32]);
}

impl Display for HsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pubkey: &[u8; 32] = self.as_ref();
        let checksum = onion_checksum(pubkey);
        let mut buf = Vec::with_capacity(35);
        buf.extend_from_slice(pubkey);
        buf.extend_from_slice(&checksum);
        buf.push(HS_ONION_VERSION);
        write!(f, "{}{}", BASE32_NOPAD.encode(&buf).to_ascii_lowercase(), HSID_ONION_SUFFIX)
    }
}

impl FromStr for HsId {
    type Err = HsIdParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s
            .strip_suffix(HSID_ONION_SUFFIX)
            .ok_or(HsIdParseError::NotOnionAddress)?;
        let decoded = BASE32_NOPAD
            .decode(label.to_ascii_uppercase().as_bytes())
            .map_err(|_| HsIdParseError::InvalidBase32)?;
        if decoded.len() != 35 {
            return Err(HsIdParseError::WrongLength);
        }
        let (pubkey, rest) = decoded.split_at(32);
        let (checksum, version) = rest.split_at(2);
        if version != [HS_ONION_VERSION] {
            return Err(HsIdParseError::BadVersion);
        }
        let pubkey: [u8; 32] = pubkey.try_into().expect("wrong slice length");
        if checksum != onion_checksum(&pubkey) {
            return Err(HsIdParseError::BadChecksum);
        }
        Ok(HsId::from(pubkey))
    }
}

/// The identity of a v3 onion service, expanded into a public key.
///
/// This is the decoded and validated ed25519 public key that is encoded as
/// a `${base32}.onion` address.
///
/// This key is not used to sign or validate anything on its own; instead, it is
/// used to derive an `HsBlindIdKey`.
//
// NOTE: This is called the "master" key in rend-spec-v3, but we're deprecating
// that vocabulary generally.
//
// NOTE: This is a separate type from HsId because it is about 6x larger.  It
// is an expanded form, used for doing actual cryptography.
#[derive(Clone, Debug, derive_more::From)]
pub struct HsIdKey(ed25519::PublicKey);

impl From<&HsIdKey> for HsId {
    fn from(key: &HsIdKey) -> Self {
        Ed25519Identity::from(&key.0).into()
    }
}

impl From<Ed25519Identity> for HsId {
    fn from(id: Ed25519Identity) -> Self {
        let bytes: [u8; 32] = id.into();
        HsId::from(bytes)
    }
}

/// The keypair for the long-term identity of a v3 onion service.
#[derive(derive_more::From)]
pub struct HsIdKeypair(ed25519::ExpandedKeypair);

impl HsIdKeypair {
    /// Return the public part of this keypair.
    pub fn public(&self) -> HsIdKey {
        HsIdKey(*self.0.public())
    }

    /// Derive the blinded keypair and subcredential for this identity during `cur_period`.
    ///
    /// The returned [`ed25519::ExpandedKeypair`] can be used to sign a
    /// descriptor-signing-key certificate on the onion service's behalf; the
    /// returned [`HsBlindIdKey`] is its public counterpart, usable by anyone
    /// who needs to verify that certificate or compute an `HsBlindId`.
    pub fn compute_blinded_key(
        &self,
        cur_period: TimePeriod,
    ) -> Result<(HsBlindIdKey, ed25519::ExpandedKeypair, Subcredential), tor_error::Bug> {
        let param = cur_period.interval_num().to_be_bytes();
        let blinded_pub = keymanip::blind_pubkey(self.0.public(), &param)
            .ok_or_else(|| tor_error::internal!("derived an invalid blinded public key"))?;
        let blinded_expanded = keymanip::blind_seckey(&self.0, &param)
            .ok_or_else(|| tor_error::internal!("derived an invalid blinded secret key"))?;
        debug_assert_eq!(blinded_pub.to_bytes(), blinded_expanded.public().to_bytes());

        let id_bytes: [u8; 32] = HsId::from(&self.public()).into();
        let blind_id: HsBlindId = Ed25519Identity::from(&blinded_pub).into();

        // rend-spec-v3 s2.2.1: N_hs_subcred = H("subcredential" | N_hs_cred | blinded-public-key)
        // where N_hs_cred = H("credential" | identity-public-key).
        let mut cred_hasher = Sha3_256::new();
        cred_hasher.update(b"credential");
        cred_hasher.update(id_bytes);
        let cred: [u8; 32] = cred_hasher.finalize().into();

        let mut h = Sha3_256::new();
        h.update(b"subcredential");
        h.update(cred);
        h.update(blind_id.as_ref());
        let subcred: [u8; 32] = h.finalize().into();

        Ok((HsBlindIdKey(blinded_pub), blinded_expanded, subcred.into()))
    }
}

impl std::fmt::Debug for HsIdKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HsIdKeypair(...)")
    }
}

/// The "blinded" identity of a v3 onion service.
///
/// This key is derived via a one-way transformation from an
/// `HsIdKey` and the current time period.
///
/// It is used for two purposes: first, to compute an index into the HSDir
/// ring, and second, to sign a descriptor-signing key.
#[derive(Clone, Debug, derive_more::From)]
pub struct HsBlindIdKey(ed25519::PublicKey);

define_bytes! {
/// A blinded onion service identity, represented in a compact format.
///
/// See [`HsBlindIdKey`] for more information.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct HsBlindId([u8; 32]);
}

impl From<Ed25519Identity> for HsBlindId {
    fn from(id: Ed25519Identity) -> Self {
        let bytes: [u8; 32] = id.into();
        HsBlindId::from(bytes)
    }
}

impl From<&ed25519::PublicKey> for HsBlindId {
    fn from(key: &ed25519::PublicKey) -> Self {
        Ed25519Identity::from(key).into()
    }
}

define_pk_keypair! {
    /// A public key used by authorized clients to decrypt the key used to
    /// decrypt the encryption layer and decode the inner document of an
    /// onion service descriptor (`KP_hsc_desc_enc`).
    pub struct HsClientDescEncKey(curve25519::PublicKey) /
    /// The secret counterpart of an [`HsClientDescEncKey`] (`KS_hsc_desc_enc`).
    HsClientDescEncSecretKey(curve25519::StaticSecret);
    /// A keypair, combining an [`HsClientDescEncKey`] and its secret counterpart.
    curve25519_pair as HsClientDescEncKeypair;
}

/// A client authorization key, used to sign a nonce included in an
/// extension in the encrypted portion of an introduce cell.
///
/// This is the client-side counterpart of the identity recognized as
/// [`HsIntroPtSessionIdKey`] on the service side.
#[derive(Clone, derive_more::From, derive_more::Into)]
pub struct HsClientIntroAuthKeypair(ed25519::Keypair);

impl std::fmt::Debug for HsClientIntroAuthKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HsClientIntroAuthKeypair(...)")
    }
}

/// A key used to identify and authenticate an onion service at a single
/// introduction point (`KP_hs_ipt_sid`).
///
/// This key is included in the onion service's descriptor; a different one is
/// used at each introduction point.  Introduction points don't know the
/// relation of this key to the onion service: they only recognize the same key
/// when they see it again.
#[derive(Clone, Debug, derive_more::From, derive_more::Deref)]
pub struct HsIntroPtSessionIdKey(ed25519::PublicKey);

define_pk_keypair! {
    /// A key used in the HsNtor handshake between the client and the onion
    /// service (`KP_hss_ntor`).
    ///
    /// The onion service chooses a different one of these to use with each
    /// introduction point, though it does not need to tell the introduction
    /// points about these keys.
    pub struct HsSvcNtorKey(curve25519::PublicKey) /
    /// The secret counterpart of an [`HsSvcNtorKey`] (`KS_hss_ntor`).
    HsSvcNtorSecretKey(curve25519::StaticSecret);
    /// A keypair, combining an [`HsSvcNtorKey`] and its secret counterpart.
    curve25519_pair as HsSvcNtorKeypair;
}

/// An ephemeral public key used by the onion service to negotiate the
/// encryption layer of its descriptor with authorized clients
/// (`KP_hss_desc_enc`).
#[derive(Clone, Debug, derive_more::From, derive_more::Deref)]
pub struct HsSvcDescEncKey(curve25519::PublicKey);

/// A possibly-empty set of secret keys that a client may use when
/// connecting to a specific onion service.
#[derive(Default)]
#[non_exhaustive]
pub struct ClientSecretKeys {
    /// A key used to decrypt the descriptor, if one is needed.
    pub ks_hsc_desc_enc: Option<HsClientDescEncKeypair>,
    /// A key used to authenticate while introducing, if one is needed.
    pub ks_hsc_intro_auth: Option<HsClientIntroAuthKeypair>,
}

impl std::fmt::Debug for ClientSecretKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSecretKeys").finish_non_exhaustive()
    }
}
