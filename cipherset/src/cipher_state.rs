//! AEAD session state, adapted from the Brontide `CipherState` pattern:
//! a ChaCha20-Poly1305 stream keyed by a rolling nonce, with the key
//! ratcheted forward by HKDF every [`KEY_ROTATION_INTERVAL`] messages so a
//! long-lived channel doesn't reuse a nonce space indefinitely.

use hkdf::Hkdf;
use sha2::Sha256;
use byteorder::{ByteOrder, LittleEndian};
use std::io;

pub const MAC_SIZE: usize = 16;
const KEY_ROTATION_INTERVAL: u64 = 1000;

pub struct CipherState {
    nonce: u64,
    secret_key: [u8; 32],
    salt: [u8; 32],
}

impl CipherState {
    pub fn new(salt: [u8; 32], key: [u8; 32]) -> Self {
        CipherState { nonce: 0, secret_key: key, salt }
    }

    pub fn encrypt(
        &mut self,
        associated_data: &[u8],
        plain_text: &[u8],
        cipher_text: &mut Vec<u8>,
    ) -> Result<[u8; MAC_SIZE], io::Error> {
        let mut nonce = [0u8; 12];
        LittleEndian::write_u64(&mut nonce[4..], self.nonce);
        let tag = chacha20_poly1305_aead::encrypt(
            &self.secret_key,
            &nonce,
            associated_data,
            plain_text,
            cipher_text,
        )?;
        self.advance();
        Ok(tag)
    }

    pub fn decrypt(
        &mut self,
        associated_data: &[u8],
        cipher_text: &[u8],
        tag: [u8; MAC_SIZE],
        plain_text: &mut Vec<u8>,
    ) -> Result<(), chacha20_poly1305_aead::DecryptError> {
        let mut nonce = [0u8; 12];
        LittleEndian::write_u64(&mut nonce[4..], self.nonce);
        chacha20_poly1305_aead::decrypt(
            &self.secret_key,
            &nonce,
            associated_data,
            cipher_text,
            &tag,
            plain_text,
        )?;
        self.advance();
        Ok(())
    }

    fn advance(&mut self) {
        self.nonce += 1;
        if self.nonce == KEY_ROTATION_INTERVAL {
            let hkdf = Hkdf::<Sha256>::new(Some(&self.salt), &self.secret_key);
            let mut okm = [0u8; 64];
            hkdf.expand(&[], &mut okm).expect("64 is a valid hkdf-sha256 output length");
            self.salt.copy_from_slice(&okm[..32]);
            self.secret_key.copy_from_slice(&okm[32..]);
            self.nonce = 0;
        }
    }
}
