//! RSA-2048 OAEP key agreement and PKCS#1 v1.5 signatures.
//!
//! Key generation is CPU-bound (on the order of half a second on
//! commodity hardware) and must never run on the single-threaded
//! reactor; `KeyPair::generate` is synchronous on purpose, and every
//! caller in this crate reaches it through `tokio::task::spawn_blocking`
//! rather than calling it inline inside an `async fn`.

use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};

use crate::error::*;

/// Number of bits of the RSA modulus used throughout the handshake.
pub const KEY_BITS: usize = 2048;

/// An RSA public key, exported/imported as DER-encoded SPKI bytes so
/// it can travel inside a BSON binary field.
#[derive(Clone)]
pub struct PublicKey(RsaPublicKey);

/// An RSA key pair. The private half is erased (`burn`) as soon as
/// the caller is done with it, per the handshake's "burn RSA material
/// immediately after the AES key is derived" invariant.
pub struct KeyPair {
    private: Option<RsaPrivateKey>,
    public: RsaPublicKey,
}

impl KeyPair {
    /// Generates a fresh 2048-bit RSA key pair. Blocking; run on a
    /// worker thread.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS).wrapped(ErrorKind::CryptoRsa)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self {
            private: Some(private),
            public,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.public.clone())
    }

    /// Erases the private key material. After this call, `decrypt`
    /// and `sign` return an error.
    ///
    /// `RsaPrivateKey` zeroizes its limbs on drop, so taking it out of
    /// the `Option` and letting it fall out of scope is sufficient.
    pub fn burn(&mut self) {
        self.private.take();
    }

    /// Decrypts an OAEP(SHA-256) ciphertext with the private key.
    /// Fails with `ErrorKind::CryptoRsa` if the key has been burned.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let sk = self
            .private
            .as_ref()
            .ok_or_else(|| Error::simple(ErrorKind::CryptoRsa))?;
        sk.decrypt(Oaep::new::<Sha256>(), ciphertext)
            .wrapped(ErrorKind::CryptoRsa)
    }

    /// Signs `message` with PKCS#1 v1.5 / SHA-256. Fails with
    /// `ErrorKind::CryptoRsa` if the key has been burned.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let sk = self
            .private
            .as_ref()
            .ok_or_else(|| Error::simple(ErrorKind::CryptoRsa))?;
        let signing_key = SigningKey::<Sha256>::new(sk.clone());
        let mut rng = rand::rngs::OsRng;
        let signature = signing_key.sign_with_rng(&mut rng, message);
        Ok(signature.to_vec())
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.burn();
    }
}

impl PublicKey {
    /// Encrypts a payload (the freshly drawn 16-byte AES key, wrapped
    /// in its own `AesKeyMessage`) with OAEP(SHA-256).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut rng = rand::rngs::OsRng;
        self.0
            .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
            .wrapped(ErrorKind::CryptoRsa)
    }

    /// Verifies a PKCS#1 v1.5 / SHA-256 signature produced by
    /// `KeyPair::sign`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        let verifying_key = VerifyingKey::<Sha256>::new(self.0.clone());
        verifying_key.verify(message, &signature).is_ok()
    }

    /// Serializes the public key as DER-encoded SubjectPublicKeyInfo
    /// bytes, the form carried inside `RsaPublicKeyMessage.key`.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        self.0
            .to_public_key_der()
            .wrapped(ErrorKind::CryptoRsa)
            .map(|doc| doc.as_bytes().to_vec())
    }

    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        RsaPublicKey::from_public_key_der(bytes)
            .wrapped(ErrorKind::CryptoRsa)
            .map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let kp = KeyPair::generate().unwrap();
        let pk = kp.public_key();
        let ct = pk.encrypt(b"sixteen-byte-key").unwrap();
        let pt = kp.decrypt(&ct).unwrap();
        assert_eq!(&pt[..], b"sixteen-byte-key");
    }

    #[test]
    fn test_burn_prevents_decrypt() {
        let mut kp = KeyPair::generate().unwrap();
        let pk = kp.public_key();
        let ct = pk.encrypt(b"sixteen-byte-key").unwrap();
        kp.burn();
        assert!(kp.decrypt(&ct).is_err());
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let kp = KeyPair::generate().unwrap();
        let pk = kp.public_key();
        let sig = kp.sign(b"to-sign").unwrap();
        assert!(pk.verify(b"to-sign", &sig));
        assert!(!pk.verify(b"other", &sig));
    }

    #[test]
    fn test_der_round_trip() {
        let kp = KeyPair::generate().unwrap();
        let pk = kp.public_key();
        let der = pk.to_der().unwrap();
        let parsed = PublicKey::from_der(&der).unwrap();
        let sig = kp.sign(b"msg").unwrap();
        assert!(parsed.verify(b"msg", &sig));
    }
}
