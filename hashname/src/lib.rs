//! 32-byte self-certifying peer identifier. Derivation from a cipher-set
//! keyring is treated as an external collaborator's concern by the mesh
//! (the wire behavior only needs the *value type* below and its 5-byte
//! short-form prefix); this crate supplies one concrete, deterministic
//! derivation so the mesh and its tests have something real to run.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

pub const SHORT_LEN: usize = 5;

#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Hashname {
    data: [u8; 32],
}

impl Hashname {
    pub const fn from_bytes(data: [u8; 32]) -> Self {
        Hashname { data }
    }

    /// Derive a hashname from an ordered cipher-set-id -> raw public key
    /// keyring, the way `hashname_vkeys` does for telehash: fold the csids
    /// in ascending order into a running digest so the result commits to
    /// every key in the set regardless of insertion order.
    pub fn from_keys(keys: &BTreeMap<u8, Vec<u8>>) -> Option<Self> {
        if keys.is_empty() {
            return None;
        }
        let mut rolling = [0u8; 32];
        for (csid, key) in keys.iter() {
            let mut csid_hasher = Sha256::new();
            csid_hasher.update([*csid]);
            let csid_hash = csid_hasher.finalize();

            let mut key_hasher = Sha256::new();
            key_hasher.update(key);
            let key_hash = key_hasher.finalize();

            let mut combine = Sha256::new();
            combine.update(rolling);
            combine.update(csid_hash);
            combine.update(key_hash);
            rolling.copy_from_slice(&combine.finalize());
        }
        Some(Hashname { data: rolling })
    }

    /// Derive a hashname from a single cipher-set's raw public key, used
    /// when validating a handshake that only ever carries one csid's key.
    pub fn from_key(csid: u8, key: &[u8]) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(csid, key.to_vec());
        // from_keys never returns None for a non-empty map.
        Hashname::from_keys(&keys).expect("non-empty keyring")
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.data
    }

    /// The 5-byte prefix used to address routed packets.
    pub fn short(&self) -> [u8; SHORT_LEN] {
        let mut out = [0u8; SHORT_LEN];
        out.copy_from_slice(&self.data[..SHORT_LEN]);
        out
    }

    pub fn matches_short(&self, short: &[u8]) -> bool {
        short.len() == SHORT_LEN && &self.data[..SHORT_LEN] == short
    }

    pub fn to_base32(&self) -> String {
        base32::encode(base32::Alphabet::RFC4648 { padding: false }, &self.data)
    }

    /// Partial string match used only for link lookup by prefix.
    pub fn starts_with_str(&self, prefix: &str) -> bool {
        self.to_base32().starts_with(prefix)
    }
}

impl AsRef<[u8]> for Hashname {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<[u8; 32]> for Hashname {
    fn from(v: [u8; 32]) -> Self {
        Hashname { data: v }
    }
}

impl fmt::Debug for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hashname({})", self.to_base32())
    }
}

impl fmt::Display for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_base32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_and_order_independent() {
        let mut a = BTreeMap::new();
        a.insert(0x1a, vec![1, 2, 3]);
        a.insert(0x2b, vec![4, 5, 6]);

        let mut b = BTreeMap::new();
        b.insert(0x2b, vec![4, 5, 6]);
        b.insert(0x1a, vec![1, 2, 3]);

        assert_eq!(Hashname::from_keys(&a), Hashname::from_keys(&b));
    }

    #[test]
    fn different_keys_yield_different_hashnames() {
        let mut a = BTreeMap::new();
        a.insert(0x1a, vec![1, 2, 3]);
        let mut b = BTreeMap::new();
        b.insert(0x1a, vec![1, 2, 4]);
        assert_ne!(Hashname::from_keys(&a), Hashname::from_keys(&b));
    }

    #[test]
    fn short_is_first_five_bytes() {
        let hn = Hashname::from_bytes([7u8; 32]);
        assert_eq!(hn.short(), [7, 7, 7, 7, 7]);
        assert!(hn.matches_short(&[7, 7, 7, 7, 7]));
        assert!(!hn.matches_short(&[7, 7, 7, 7, 8]));
    }

    #[test]
    fn base32_round_trips_length() {
        let hn = Hashname::from_bytes([0xff; 32]);
        // 32 bytes -> ceil(32 * 8 / 5) = 52 base32 characters, unpadded.
        assert_eq!(hn.to_base32().len(), 52);
    }
}
