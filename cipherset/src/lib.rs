//! The cipher-set boundary the mesh dispatcher talks to: an opaque
//! [`LocalIdentity`] (the mesh's own keypair) and an opaque per-peer
//! [`Exchange`] session, each exposing exactly the surface spec.md's
//! "Cipher provider" component describes (token extraction, handshake
//! decrypt, channel packet encrypt/decrypt).
//!
//! Key generation, the handshake transcript and the channel AEAD are all
//! concrete here (cipher-set id `0x1a`) so the mesh and its tests have a
//! real, runnable implementation to exercise — the rest of this workspace
//! only relies on the method surface below, never on these specifics.

mod cipher_state;

use byteorder::{BigEndian, ByteOrder};
use cipher_state::{CipherState, MAC_SIZE};
use hkdf::Hkdf;
use lob::Packet;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

/// The only cipher-set id this crate implements.
pub const CSID: u8 = 0x1a;

const EPHEMERAL_KEY_SIZE: usize = 33;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("handshake packet too short to contain an ephemeral key and tag")]
    HandshakeTruncated,
    #[error("channel packet too short to contain a token and tag")]
    ChannelTruncated,
    #[error("invalid public key in handshake: {0}")]
    BadKey(#[from] secp256k1::Error),
    #[error("AEAD authentication failed")]
    AuthFailed,
    #[error("decrypted handshake body did not parse as a packet: {0}")]
    BadInnerPacket(#[from] lob::LobError),
}

impl From<chacha20_poly1305_aead::DecryptError> for CipherError {
    fn from(_: chacha20_poly1305_aead::DecryptError) -> Self {
        CipherError::AuthFailed
    }
}

fn ecdh(point: &PublicKey, scalar: &SecretKey) -> [u8; 32] {
    SharedSecret::new(point, scalar).secret_bytes()
}

fn hkdf_64(salt: &[u8], ikm: &[u8]) -> [u8; 64] {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 64];
    hkdf.expand(&[], &mut okm).expect("64 is a valid hkdf-sha256 output length");
    okm
}

/// The mesh's own long-term keypair for this cipher-set.
pub struct LocalIdentity {
    secret: SecretKey,
    public: PublicKey,
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LocalIdentity({})", hex::encode(self.public.serialize()))
    }
}

impl LocalIdentity {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::thread_rng());
        let public = PublicKey::from_secret_key(&secp, &secret);
        LocalIdentity { secret, public }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CipherError> {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(bytes)?;
        let public = PublicKey::from_secret_key(&secp, &secret);
        Ok(LocalIdentity { secret, public })
    }

    pub fn csid(&self) -> u8 {
        CSID
    }

    pub fn public_key_bytes(&self) -> [u8; 33] {
        self.public.serialize()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    /// Build a handshake packet addressed to `remote_public`, carrying our
    /// own static key so the recipient can derive our hashname and open an
    /// exchange back to us.
    pub fn encrypt_handshake(&self, remote_public: &PublicKey) -> Packet {
        let secp = Secp256k1::new();
        let ephemeral_secret = SecretKey::new(&mut rand::thread_rng());
        let ephemeral_public = PublicKey::from_secret_key(&secp, &ephemeral_secret);

        let shared = ecdh(remote_public, &ephemeral_secret);
        let okm = hkdf_64(&[], &shared);
        let mut key = [0u8; 32];
        key.copy_from_slice(&okm[..32]);
        let mut cipher = CipherState::new([0u8; 32], key);

        let plaintext = self.public.serialize();
        let mut ciphertext = Vec::with_capacity(plaintext.len());
        let tag = cipher
            .encrypt(&[CSID], &plaintext, &mut ciphertext)
            .expect("in-memory AEAD encrypt cannot fail");

        let mut body = Vec::with_capacity(EPHEMERAL_KEY_SIZE + ciphertext.len() + MAC_SIZE);
        body.extend_from_slice(&ephemeral_public.serialize());
        body.extend_from_slice(&ciphertext);
        body.extend_from_slice(&tag);

        Packet::handshake(CSID, body)
    }

    /// Decrypt a handshake addressed to us. On success, returns the inner
    /// packet whose body is itself a nested, wire-encoded packet carrying
    /// the remote's raw static key as its body (mirroring
    /// `e3x_self_decrypt`'s two-layer result in the original protocol).
    pub fn decrypt_handshake(&self, outer: &Packet) -> Result<Packet, CipherError> {
        let body = outer.body();
        if body.len() < EPHEMERAL_KEY_SIZE + MAC_SIZE {
            return Err(CipherError::HandshakeTruncated);
        }
        let ephemeral_public = PublicKey::from_slice(&body[..EPHEMERAL_KEY_SIZE])?;
        let ciphertext_end = body.len() - MAC_SIZE;
        let ciphertext = &body[EPHEMERAL_KEY_SIZE..ciphertext_end];
        let mut tag = [0u8; MAC_SIZE];
        tag.copy_from_slice(&body[ciphertext_end..]);

        let shared = ecdh(&ephemeral_public, &self.secret);
        let okm = hkdf_64(&[], &shared);
        let mut key = [0u8; 32];
        key.copy_from_slice(&okm[..32]);
        let mut cipher = CipherState::new([0u8; 32], key);

        let mut plaintext = Vec::new();
        cipher.decrypt(&[CSID], ciphertext, tag, &mut plaintext)?;

        let remote_static = PublicKey::from_slice(&plaintext)?;
        let nested = Packet::with_body(remote_static.serialize().to_vec());

        let mut inner = Packet::with_body(nested.to_bytes());
        inner.link(outer.clone());
        Ok(inner)
    }

    /// Open (or re-derive) the per-peer session for `remote_public`. Both
    /// sides converge on identical send/recv labeling and an identical
    /// token by ordering the two static keys' serializations rather than
    /// by initiator/responder role, since handshakes here are one-way.
    pub fn exchange(&self, remote_public: PublicKey) -> Exchange {
        let shared = ecdh(&remote_public, &self.secret);

        let local_bytes = self.public.serialize();
        let remote_bytes = remote_public.serialize();
        let we_are_lo = local_bytes < remote_bytes;
        let (lo, hi) = if we_are_lo {
            (local_bytes, remote_bytes)
        } else {
            (remote_bytes, local_bytes)
        };

        let mut token_input = Vec::with_capacity(32 + 33 + 33);
        token_input.extend_from_slice(&shared);
        token_input.extend_from_slice(&lo);
        token_input.extend_from_slice(&hi);
        let token_digest = hkdf_64(b"token", &token_input);
        let mut token = [0u8; 8];
        token.copy_from_slice(&token_digest[..8]);

        let lo2hi = hkdf_64(b"lo2hi", &shared);
        let hi2lo = hkdf_64(b"hi2lo", &shared);
        let (send_src, recv_src) = if we_are_lo { (lo2hi, hi2lo) } else { (hi2lo, lo2hi) };

        let mut send_key = [0u8; 32];
        send_key.copy_from_slice(&send_src[..32]);
        let mut send_salt = [0u8; 32];
        send_salt.copy_from_slice(&send_src[32..]);

        let mut recv_key = [0u8; 32];
        recv_key.copy_from_slice(&recv_src[..32]);
        let mut recv_salt = [0u8; 32];
        recv_salt.copy_from_slice(&recv_src[32..]);

        Exchange {
            token,
            send: CipherState::new(send_salt, send_key),
            recv: CipherState::new(recv_salt, recv_key),
            last_recv_at: 0,
        }
    }
}

/// A per-peer cryptographic session. Owned by a `link` crate `Link`.
pub struct Exchange {
    token: [u8; 8],
    send: CipherState,
    recv: CipherState,
    last_recv_at: u32,
}

impl Exchange {
    pub fn token(&self) -> [u8; 8] {
        self.token
    }

    pub fn last_recv_at(&self) -> u32 {
        self.last_recv_at
    }

    /// Encrypt `inner` for transmission as a zero-head channel packet.
    pub fn encrypt_channel_packet(&mut self, inner: &Packet) -> Packet {
        let plaintext = inner.to_bytes();
        let mut ciphertext = Vec::with_capacity(plaintext.len());
        let tag = self
            .send
            .encrypt(&self.token, &plaintext, &mut ciphertext)
            .expect("in-memory AEAD encrypt cannot fail");

        let mut body = Vec::with_capacity(8 + ciphertext.len() + MAC_SIZE);
        body.extend_from_slice(&self.token);
        body.extend_from_slice(&ciphertext);
        body.extend_from_slice(&tag);

        Packet::channel(body)
    }

    /// Decrypt a zero-head channel packet whose token has already been
    /// matched against this exchange by the caller.
    pub fn receive_channel_packet(&mut self, outer: &Packet, now: u32) -> Result<Packet, CipherError> {
        let body = outer.body();
        if body.len() < 8 + MAC_SIZE {
            return Err(CipherError::ChannelTruncated);
        }
        let ciphertext_end = body.len() - MAC_SIZE;
        let ciphertext = &body[8..ciphertext_end];
        let mut tag = [0u8; MAC_SIZE];
        tag.copy_from_slice(&body[ciphertext_end..]);

        let mut plaintext = Vec::new();
        self.recv.decrypt(&self.token, ciphertext, tag, &mut plaintext)?;
        self.last_recv_at = now;

        Ok(Packet::parse(&plaintext)?)
    }
}

// Re-exported so `link`/`mesh` crates never need their own secp256k1 dep
// just to carry a `PublicKey` value through.
pub use secp256k1::PublicKey as RemoteKey;

pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, CipherError> {
    Ok(PublicKey::from_slice(bytes)?)
}

pub fn big_endian_u16(bytes: &[u8]) -> u16 {
    BigEndian::read_u16(bytes)
}
