//! Define a type for a set of HasRelayIds objects that can be looked up by any
//! of their keys.

use tor_basic_utils::n_key_set;
use tor_llcrypto::pk::ed25519::Ed25519Identity;
use tor_llcrypto::pk::rsa::RsaIdentity;

use crate::{HasRelayIds, RelayIdRef};

n_key_set! {
    /// A set of objects that can be accessed by relay identity.
    ///
    /// No more than one object in the set can have any given relay identity.
    ///
    /// # Invariants
    ///
    /// Every object in the set MUST have at least one recognized relay
    /// identity; if it does not, it cannot be inserted.
    ///
    /// This set may panic or give incorrect results if the values can change their
    /// keys through interior mutability.
    ///
    #[derive(Clone, Debug)]
    pub struct[H:HasRelayIds] ByRelayIds[H] for H
    {
        (Option) rsa: RsaIdentity { rsa_identity() },
        (Option) ed25519: Ed25519Identity { ed_identity() },
    }
}

impl<H: HasRelayIds> ByRelayIds<H> {
    /// Return the value in this set (if any) that has the key `key`.
    pub fn by_id<'a, T>(&self, key: T) -> Option<&H>
    where
        T: Into<RelayIdRef<'a>>,
    {
        match key.into() {
            RelayIdRef::Ed25519(ed) => self.by_ed25519(ed),
            RelayIdRef::Rsa(rsa) => self.by_rsa(rsa),
        }
    }

    /// Return the value in this set (if any) that has _all_ the relay IDs
    /// that `key` does.
    ///
    /// Return `None` if `key` has no relay IDs.
    pub fn by_all_ids<T>(&self, key: &T) -> Option<&H>
    where
        T: HasRelayIds,
    {
        let any_id = key.identities().next()?;
        self.by_id(any_id)
            .filter(|val| val.has_all_relay_ids_from(key))
    }
}

/// An error caused by an operation on a [`ByRelayIds`] set.
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ByRelayIdsError {
    /// The value being inserted had no recognized relay identity.
    #[error("value has no relay identity")]
    NoIdentity,
}

/// An error caused by building a [`ByRelayIds`] set from a list of values that
/// do not have distinct identities.
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ListByRelayIdsError {
    /// Two or more values in the list shared a relay identity.
    #[error("two or more values in the list share a relay identity")]
    DuplicateId,
}

impl<H: HasRelayIds + Clone> ByRelayIds<H> {
    /// Construct a `ByRelayIds` set from an iterator of values, returning an
    /// error if any two values share a relay identity.
    pub fn from_values(
        values: impl IntoIterator<Item = H>,
    ) -> std::result::Result<Self, ListByRelayIdsError> {
        let mut set = Self::new();
        for value in values {
            let replaced = set.insert(value);
            if !replaced.is_empty() {
                return Err(ListByRelayIdsError::DuplicateId);
            }
        }
        Ok(set)
    }
}
