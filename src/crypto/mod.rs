//! Cryptographic primitives used by the handshake: RSA-2048 OAEP for
//! session-key wrapping, AES-128-GCM for the steady-state envelope,
//! and the secure RNG shared by both.

pub mod aes;
pub mod rsa;

use rand::rngs::OsRng;
use rand::RngCore;

/// Draws `N` cryptographically secure random bytes.
///
/// Backs every nonce, AES key and handshake challenge drawn by this
/// crate; there is exactly one RNG source, injected nowhere — callers
/// always go through this function rather than constructing their own
/// `OsRng`, so a future swap to a different secure source only
/// touches this module.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Draws a fresh 16-byte AES key.
pub fn random_aes_key() -> aes::AesKey {
    aes::AesKey::from_bytes(random_bytes::<{ aes::AesKey::LENGTH }>())
}

/// Holds the RSA key pair used during a single handshake and the AES
/// key that replaces it once the session is encrypted.
///
/// The RSA private half is burned (dropped) as soon as the AES key is
/// derived, per the invariant in `spec.md` §3; `aes_key` is `None`
/// until the handshake's session-key exchange completes.
pub struct KeyData {
    rsa: Option<rsa::KeyPair>,
    aes_key: Option<aes::AesKey>,
}

impl KeyData {
    pub fn new() -> Self {
        Self {
            rsa: None,
            aes_key: None,
        }
    }

    /// Generates a fresh RSA key pair. Blocking; run on a worker
    /// thread.
    pub fn generate_rsa(&mut self) -> crate::error::Result<rsa::PublicKey> {
        let kp = rsa::KeyPair::generate()?;
        let pk = kp.public_key();
        self.rsa = Some(kp);
        Ok(pk)
    }

    pub fn rsa(&self) -> Option<&rsa::KeyPair> {
        self.rsa.as_ref()
    }

    /// Burns the RSA private material and installs the session's AES
    /// key. Idempotent with respect to the RSA burn.
    pub fn install_aes_key(&mut self, key: aes::AesKey) {
        if let Some(rsa) = self.rsa.as_mut() {
            rsa.burn();
        }
        self.rsa = None;
        self.aes_key = Some(key);
    }

    pub fn aes_key(&self) -> Option<&aes::AesKey> {
        self.aes_key.as_ref()
    }
}

impl Default for KeyData {
    fn default() -> Self {
        Self::new()
    }
}
