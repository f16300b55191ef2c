use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

pub mod party;
pub mod party_i;
pub mod state_machine;
pub mod utilities;
pub mod vss;
pub mod wire;

#[cfg(any(test, feature = "dev"))]
pub mod test;

/// Numeric identity of one validator, in range `[1; n]`.
///
/// Identities double as the secret-sharing evaluation points, so they stay
/// stable across signing subsets and must never be renumbered after keygen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartyId(u16);

impl PartyId {
    /// Returns `None` for zero, which the wire format reserves for "no recipient".
    pub fn new(id: u16) -> Option<Self> {
        if id == 0 {
            None
        } else {
            Some(PartyId(id))
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ascending list of distinct validator identities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSet(Vec<PartyId>);

impl PeerSet {
    /// Sorts the identities ascending. Rejects an empty list and duplicates.
    pub fn new(mut ids: Vec<PartyId>) -> Result<Self, Error> {
        if ids.is_empty() {
            return Err(Error::InvalidPeerSet);
        }
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::InvalidPeerSet);
        }
        Ok(PeerSet(ids))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: PartyId) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    /// Zero-based position of `id` in ascending order.
    pub fn position(&self, id: PartyId) -> Option<usize> {
        self.0.binary_search(&id).ok()
    }

    pub fn id_at(&self, position: usize) -> PartyId {
        self.0[position]
    }

    pub fn ids(&self) -> &[PartyId] {
        &self.0
    }

    pub fn is_subset_of(&self, other: &PeerSet) -> bool {
        self.0.iter().all(|id| other.contains(*id))
    }
}
