//! AES-128-GCM symmetric encryption.
//!
//! The key is a 16-byte value transported on the wire as a
//! 32-character hex string (the `aes_key` field of `AesKeyMessage`),
//! matching the original protocol's choice of a textual key
//! representation inside the BSON envelope.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes128Gcm;

use crate::crypto::random_bytes;
use crate::error::*;

/// A 16-byte AES-128 key.
#[derive(Clone)]
pub struct AesKey([u8; AesKey::LENGTH]);

/// A 12-byte nonce, fresh for every `encrypt` call.
pub type Nonce = [u8; 12];

/// A 16-byte GCM authentication tag.
pub type Tag = [u8; 16];

impl AesKey {
    pub const LENGTH: usize = 16;

    pub fn from_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parses the 32-character hex representation carried by
    /// `AesKeyMessage.aes_key`.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s).wrapped(ErrorKind::CryptoAes)?;
        if raw.len() != Self::LENGTH {
            return Err("AES key has an invalid length").wrapped(ErrorKind::CryptoAes);
        }
        let mut key = [0u8; Self::LENGTH];
        key.copy_from_slice(&raw);
        Ok(Self(key))
    }

    /// Renders the key as the 32-character hex string placed on the
    /// wire inside `AesKeyMessage`.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn cipher(&self) -> Aes128Gcm {
        Aes128Gcm::new(GenericArray::from_slice(&self.0))
    }
}

/// Encrypts `plaintext` under `key`, returning a fresh nonce, the
/// authentication tag and the ciphertext (same length as plaintext).
pub fn encrypt(key: &AesKey, plaintext: &[u8]) -> Result<(Nonce, Tag, Vec<u8>)> {
    let nonce = random_bytes::<12>();
    let mut buffer = plaintext.to_vec();
    let tag = key
        .cipher()
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buffer)
        .simple(ErrorKind::CryptoAes)?;
    let mut tag_bytes = [0u8; 16];
    tag_bytes.copy_from_slice(&tag);
    Ok((nonce, tag_bytes, buffer))
}

/// Decrypts `ciphertext` under `key`, verifying `tag` before
/// returning the plaintext. A tampered envelope fails with
/// `ErrorKind::CryptoAes`.
pub fn decrypt(key: &AesKey, nonce: &Nonce, tag: &Tag, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = ciphertext.to_vec();
    key.cipher()
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .simple(ErrorKind::CryptoAes)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_aes_key;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key = random_aes_key();
        let (nonce, tag, ciphertext) = encrypt(&key, b"hello world").unwrap();
        let plaintext = decrypt(&key, &nonce, &tag, &ciphertext).unwrap();
        assert_eq!(&plaintext[..], b"hello world");
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = random_aes_key();
        let (nonce, mut tag, ciphertext) = encrypt(&key, b"hello world").unwrap();
        tag[0] ^= 0xff;
        assert!(decrypt(&key, &nonce, &tag, &ciphertext).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = random_aes_key();
        let (nonce, tag, mut ciphertext) = encrypt(&key, b"hello world").unwrap();
        ciphertext[0] ^= 0xff;
        assert!(decrypt(&key, &nonce, &tag, &ciphertext).is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let key = random_aes_key();
        let hex = key.to_hex();
        assert_eq!(hex.len(), 32);
        let parsed = AesKey::from_hex(&hex).unwrap();
        assert_eq!(parsed.0, key.0);
    }
}
