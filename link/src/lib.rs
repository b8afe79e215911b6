//! A mesh's handle for one peer: the hashname identifying them, the current
//! [`cipherset::Exchange`] once a handshake has completed, and the packets
//! flowing to and from them. Everything about *how* a handshake or channel
//! packet is cryptographically processed lives in `cipherset`; this crate
//! only tracks per-peer state and bookkeeping.
//!
//! Channel-level protocols (ordered streams, seek, keep-alive) ride on top
//! of the decrypted packets this crate hands back and are not modelled
//! here — a link only tracks that channels *exist* well enough to report
//! whether it's idle.

use std::collections::VecDeque;

use cipherset::{CipherError, Exchange, LocalIdentity, RemoteKey};
use hashname::Hashname;
use lob::Packet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cipher set {0:#04x} is not implemented")]
    UnsupportedCipherSet(u8),
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Sentinel `csid` meaning "marked for removal at the next process tick",
/// mirroring the C struct's reuse of the cipher-set byte as a tombstone.
const REMOVED_CSID: u8 = 0;

pub struct Link {
    peer: Hashname,
    csid: u8,
    exchange: Option<Exchange>,
    channels: Vec<u32>,
    received: VecDeque<Packet>,
    outbound: VecDeque<Packet>,
    last_process_at: u32,
}

impl Link {
    pub fn new(peer: Hashname) -> Self {
        Link {
            peer,
            csid: REMOVED_CSID,
            exchange: None,
            channels: Vec::new(),
            received: VecDeque::new(),
            outbound: VecDeque::new(),
            last_process_at: 0,
        }
    }

    pub fn peer(&self) -> &Hashname {
        &self.peer
    }

    pub fn csid(&self) -> u8 {
        self.csid
    }

    pub fn exchange(&self) -> Option<&Exchange> {
        self.exchange.as_ref()
    }

    pub fn exchange_mut(&mut self) -> Option<&mut Exchange> {
        self.exchange.as_mut()
    }

    pub fn token(&self) -> Option<[u8; 8]> {
        self.exchange.as_ref().map(|x| x.token())
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.csid == REMOVED_CSID
    }

    /// Marks this link for removal. The actual free happens lazily, at the
    /// next `mesh_process` sweep, so in-flight lookups still find it.
    pub fn unlink(&mut self) {
        self.csid = REMOVED_CSID;
    }

    /// Establish or refresh this link's exchange from a remote static key.
    pub fn load(&mut self, identity: &LocalIdentity, csid: u8, remote_key_bytes: &[u8]) -> Result<(), LinkError> {
        if csid != cipherset::CSID {
            log::warn!("link for {} cannot load unsupported cipher set {:#04x}", self.peer, csid);
            return Err(LinkError::UnsupportedCipherSet(csid));
        }
        let remote_pub: RemoteKey = cipherset::parse_public_key(remote_key_bytes)?;
        self.exchange = Some(identity.exchange(remote_pub));
        self.csid = csid;
        Ok(())
    }

    /// Load this link's exchange from an already-normalised handshake
    /// packet (`h.body()` is the remote's raw static key bytes).
    pub fn receive_handshake(&mut self, identity: &LocalIdentity, csid: u8, handshake: &Packet) -> Result<(), LinkError> {
        self.load(identity, csid, handshake.body())
    }

    /// Hand a decrypted inner packet to this link. Buffered for the caller
    /// to drain via [`Link::take_received`]; channel demultiplexing on top
    /// of this is out of scope here.
    pub fn receive(&mut self, inner: Packet) {
        self.received.push_back(inner);
    }

    pub fn take_received(&mut self) -> Option<Packet> {
        self.received.pop_front()
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    /// Queue an already wire-ready outer packet for delivery to this peer's
    /// transport. Path/pipe resolution lives outside this crate; this is
    /// just the handoff point a resolver drains from.
    pub fn send(&mut self, outer: Packet) {
        self.outbound.push_back(outer);
    }

    pub fn take_to_send(&mut self) -> Option<Packet> {
        self.outbound.pop_front()
    }

    /// Encrypt `inner` through this link's exchange and queue it for
    /// transport. No-op (returns false) if no exchange has been established.
    pub fn send_channel_packet(&mut self, inner: &Packet) -> bool {
        match &mut self.exchange {
            Some(exchange) => {
                let outer = exchange.encrypt_channel_packet(inner);
                self.outbound.push_back(outer);
                true
            }
            None => false,
        }
    }

    pub fn note_channel(&mut self, channel_id: u32) {
        if !self.channels.contains(&channel_id) {
            self.channels.push(channel_id);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Per-tick housekeeping. Timeout policy for stale links is left to a
    /// caller-chosen hook rather than a constant baked in here; this just
    /// records the tick so one could be layered on later.
    pub fn process(&mut self, now: u32) {
        self.last_process_at = now;
    }

    pub fn last_process_at(&self) -> u32 {
        self.last_process_at
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "hashname": self.peer.to_base32(),
            "csid": format!("{:02x}", self.csid),
            "channels": self.channels.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::PublicKey;

    #[test]
    fn new_link_has_no_exchange_and_is_marked_for_removal() {
        let link = Link::new(Hashname::from_bytes([1u8; 32]));
        assert!(link.is_marked_for_removal());
        assert!(link.exchange().is_none());
        assert!(link.token().is_none());
    }

    #[test]
    fn loading_an_exchange_clears_the_removal_marker() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let bob_pub = PublicKey::from_slice(&bob.public_key_bytes()).unwrap();

        let mut link = Link::new(Hashname::from_bytes([2u8; 32]));
        link.load(&alice, cipherset::CSID, &bob.public_key_bytes()).unwrap();

        assert!(!link.is_marked_for_removal());
        assert_eq!(link.csid(), cipherset::CSID);
        assert!(link.token().is_some());
        let _ = bob_pub;
    }

    #[test]
    fn unsupported_cipher_set_is_rejected() {
        let alice = LocalIdentity::generate();
        let mut link = Link::new(Hashname::from_bytes([3u8; 32]));
        let err = link.load(&alice, 0x99, &[0u8; 33]).unwrap_err();
        assert!(matches!(err, LinkError::UnsupportedCipherSet(0x99)));
    }

    #[test]
    fn received_packets_drain_in_order() {
        let mut link = Link::new(Hashname::from_bytes([4u8; 32]));
        link.receive(Packet::channel(vec![1]));
        link.receive(Packet::channel(vec![2]));
        assert_eq!(link.take_received().unwrap().body(), &[1]);
        assert_eq!(link.take_received().unwrap().body(), &[2]);
        assert!(link.take_received().is_none());
    }

    #[test]
    fn unlink_sets_the_removal_sentinel() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let mut link = Link::new(Hashname::from_bytes([5u8; 32]));
        link.load(&alice, cipherset::CSID, &bob.public_key_bytes()).unwrap();
        assert!(!link.is_marked_for_removal());

        link.unlink();
        assert!(link.is_marked_for_removal());
        // Exchange state survives until the mesh actually sweeps it away.
        assert!(link.exchange().is_some());
    }
}
