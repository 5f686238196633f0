//! The "tor1" relay-cell cryptography, as used by today's circuits.
//!
//! Each hop on a circuit shares a forward and a backward cryptographic
//! state with the client: a keyed AES-CTR stream cipher, and a running
//! digest.  Cells are "onion-encrypted" as they head outward (one layer
//! per hop, innermost hop first) and "onion-decrypted" as they head
//! inward (one layer per hop, in the same order); the hop whose digest
//! matches after peeling its layer off is the cell's origin or
//! destination.

use cipher::generic_array::GenericArray;
use cipher::{KeyIvInit, KeySizeUser, StreamCipher};
use digest::Digest;
use tor_cell::{chancell::ChanCmd, relaycell::msg::SendmeTag};

use super::{
    ClientLayer, CryptInit, InboundClientLayer, InboundRelayLayer, OutboundClientLayer,
    OutboundRelayLayer, RelayCellBody, RelayLayer,
};
use crate::{Error, Result};
use crate::crypto::binding::CircuitBinding;

/// Byte range, within a relay cell, of the "recognized" field.
pub(crate) const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;
/// Byte range, within a relay cell, of the "digest" field.
pub(crate) const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

/// Zero out the mutable fields of a relay cell (`recognized` and `digest`)
/// so that they can be included in a digest computation deterministically.
fn clear_mutable_fields(cell: &mut [u8]) {
    cell[RECOGNIZED_RANGE].fill(0);
    cell[DIGEST_RANGE].fill(0);
}

/// One direction's worth of tor1 cryptographic state: a stream cipher and a
/// running digest.
struct Tor1Layer<C, D: Digest> {
    /// Stream cipher used to encrypt or decrypt cells in this direction.
    cipher: C,
    /// Running digest over all cells seen in this direction so far.
    digest: D,
}

impl<C, D: Digest + Clone> Tor1Layer<C, D> {
    /// Compute the current digest value, without disturbing the running
    /// digest state.
    fn peek_digest(&self) -> digest::Output<D> {
        self.digest.clone().finalize()
    }
}

/// A matched pair of forward and backward tor1 cryptographic states, as
/// shared between the client and a single hop on one of its circuits.
pub(crate) struct CryptStatePair<C, D: Digest> {
    /// State used in the outbound (away from the client) direction.
    forward: Tor1Layer<C, D>,
    /// State used in the inbound (towards the client) direction.
    backward: Tor1Layer<C, D>,
}

impl<C, D> CryptInit for CryptStatePair<C, D>
where
    C: StreamCipher + KeyIvInit + KeySizeUser,
    D: Digest + Clone,
{
    fn seed_len() -> usize {
        2 * C::key_size() + 2 * D::output_size()
    }

    fn initialize(seed: &[u8]) -> Result<Self> {
        let keylen = C::key_size();
        let digestlen = D::output_size();
        if seed.len() != Self::seed_len() {
            return Err(Error::InvalidOutputLength);
        }
        let (df, rest) = seed.split_at(digestlen);
        let (db, rest) = rest.split_at(digestlen);
        let (kf, kb) = rest.split_at(keylen);
        debug_assert_eq!(kb.len(), keylen);

        let iv = Default::default();
        let forward = Tor1Layer {
            cipher: C::new(GenericArray::from_slice(kf), &iv),
            digest: D::new_with_prefix(df),
        };
        let backward = Tor1Layer {
            cipher: C::new(GenericArray::from_slice(kb), &iv),
            digest: D::new_with_prefix(db),
        };

        Ok(CryptStatePair { forward, backward })
    }
}

impl<C, D> ClientLayer<Tor1ClientOutbound<C, D>, Tor1ClientInbound<C, D>> for CryptStatePair<C, D>
where
    C: StreamCipher,
    D: Digest + Clone,
{
    fn split_client_layer(
        self,
    ) -> (
        Tor1ClientOutbound<C, D>,
        Tor1ClientInbound<C, D>,
        CircuitBinding,
    ) {
        let binding = binding_material(&self.forward, &self.backward);
        (
            Tor1ClientOutbound(self.forward),
            Tor1ClientInbound(self.backward),
            binding,
        )
    }
}

impl<C, D> RelayLayer<Tor1RelayOutbound<C, D>, Tor1RelayInbound<C, D>> for CryptStatePair<C, D>
where
    C: StreamCipher,
    D: Digest + Clone,
{
    fn split_relay_layer(
        self,
    ) -> (
        Tor1RelayOutbound<C, D>,
        Tor1RelayInbound<C, D>,
        CircuitBinding,
    ) {
        let binding = binding_material(&self.forward, &self.backward);
        (
            // From the relay's point of view, "outbound" traffic (moving
            // towards the client) is decrypted using the client's
            // backward-direction keys, and "inbound" traffic (moving away
            // from the client) is decrypted with the forward-direction
            // keys.
            Tor1RelayOutbound(self.backward),
            Tor1RelayInbound(self.forward),
            binding,
        )
    }
}

/// Derive key-binding material for this hop from its digest seeds.
///
/// This is a deterministic function of the two digest seeds, used so that
/// a circuit's extension handshakes can be cryptographically bound
/// together.
fn binding_material<C, D: Digest + Clone>(
    forward: &Tor1Layer<C, D>,
    backward: &Tor1Layer<C, D>,
) -> CircuitBinding {
    let mut d = tor_llcrypto::d::Sha1::new();
    digest::Update::update(&mut d, &forward.peek_digest());
    digest::Update::update(&mut d, &backward.peek_digest());
    let result = d.finalize();
    let mut kh = [0_u8; 20];
    kh.copy_from_slice(&result);
    CircuitBinding::from(kh)
}

/// A client's view of the outbound (away from the client) cryptographic
/// layer shared with one hop.
pub(crate) struct Tor1ClientOutbound<C, D: Digest>(Tor1Layer<C, D>);
/// A client's view of the inbound (towards the client) cryptographic
/// layer shared with one hop.
pub(crate) struct Tor1ClientInbound<C, D: Digest>(Tor1Layer<C, D>);
/// A relay's view of the outbound (away from the client) cryptographic
/// layer shared with one circuit.
pub(crate) struct Tor1RelayOutbound<C, D: Digest>(Tor1Layer<C, D>);
/// A relay's view of the inbound (towards the client) cryptographic
/// layer shared with one circuit.
pub(crate) struct Tor1RelayInbound<C, D: Digest>(Tor1Layer<C, D>);

impl<C: StreamCipher, D: Digest + Clone> OutboundClientLayer for Tor1ClientOutbound<C, D> {
    fn originate_for(&mut self, _cmd: ChanCmd, cell: &mut RelayCellBody) -> SendmeTag {
        clear_mutable_fields(cell.as_mut());
        digest::Update::update(&mut self.0.digest, cell.as_ref());
        let digest_val = self.0.peek_digest();
        cell.as_mut()[DIGEST_RANGE].copy_from_slice(&digest_val[..4]);
        let tag = sendme_tag(&digest_val);
        self.0.cipher.apply_keystream(cell.as_mut());
        tag
    }

    fn encrypt_outbound(&mut self, _cmd: ChanCmd, cell: &mut RelayCellBody) {
        self.0.cipher.apply_keystream(cell.as_mut());
    }
}

impl<C: StreamCipher, D: Digest + Clone> InboundClientLayer for Tor1ClientInbound<C, D> {
    fn decrypt_inbound(&mut self, _cmd: ChanCmd, cell: &mut RelayCellBody) -> Option<SendmeTag> {
        self.0.cipher.apply_keystream(cell.as_mut());
        check_recognized(&mut self.0, cell)
    }
}

impl<C: StreamCipher, D: Digest + Clone> OutboundRelayLayer for Tor1RelayOutbound<C, D> {
    fn decrypt_outbound(&mut self, _cmd: ChanCmd, cell: &mut RelayCellBody) -> Option<SendmeTag> {
        self.0.cipher.apply_keystream(cell.as_mut());
        check_recognized(&mut self.0, cell)
    }
}

impl<C: StreamCipher, D: Digest + Clone> InboundRelayLayer for Tor1RelayInbound<C, D> {
    fn originate(&mut self, _cmd: ChanCmd, cell: &mut RelayCellBody) -> SendmeTag {
        clear_mutable_fields(cell.as_mut());
        digest::Update::update(&mut self.0.digest, cell.as_ref());
        let digest_val = self.0.peek_digest();
        cell.as_mut()[DIGEST_RANGE].copy_from_slice(&digest_val[..4]);
        let tag = sendme_tag(&digest_val);
        self.0.cipher.apply_keystream(cell.as_mut());
        tag
    }

    fn encrypt_inbound(&mut self, _cmd: ChanCmd, cell: &mut RelayCellBody) {
        self.0.cipher.apply_keystream(cell.as_mut());
    }
}

/// Check whether `cell` is "recognized" by `layer`'s running digest: that
/// is, whether its `recognized` field is zero and its `digest` field
/// matches what we'd compute.  If so, commit the digest update and return
/// a tag for sending an authenticated SENDME; otherwise leave the digest
/// state untouched and return `None`.
fn check_recognized<C, D: Digest + Clone>(
    layer: &mut Tor1Layer<C, D>,
    cell: &mut RelayCellBody,
) -> Option<SendmeTag> {
    if cell.as_ref()[RECOGNIZED_RANGE] != [0, 0] {
        return None;
    }

    let mut candidate = [0_u8; 509];
    candidate.copy_from_slice(cell.as_ref());
    let received_digest = candidate[DIGEST_RANGE].to_owned();
    candidate[DIGEST_RANGE].fill(0);

    let mut test_digest = layer.digest.clone();
    digest::Update::update(&mut test_digest, &candidate[..]);
    let computed = test_digest.clone().finalize();

    if computed[..4] != received_digest[..] {
        return None;
    }

    layer.digest = test_digest;
    let tag = sendme_tag(&computed);
    cell.as_mut().copy_from_slice(&candidate);
    Some(tag)
}

/// Build a [`SendmeTag`] from the first 20 bytes of a digest output.
fn sendme_tag<O: AsRef<[u8]>>(digest_val: &O) -> SendmeTag {
    let bytes = digest_val.as_ref();
    let mut tag = [0_u8; 20];
    let n = std::cmp::min(20, bytes.len());
    tag[..n].copy_from_slice(&bytes[..n]);
    SendmeTag::from(tag)
}
