//! The pluggable authentication capability negotiated during the
//! handshake. A peer that installs an `AuthProvider` demands a signed
//! reply to a random challenge before it will proceed; a peer that
//! doesn't leaves `auth_required` false and skips the challenge/reply
//! exchange entirely. Client and server carry independent, optional
//! providers, so all four combinations in `spec.md` §4.3 are valid.

use crate::crypto::rsa::{KeyPair, PublicKey};
use crate::crypto::{self};
use crate::error::*;

/// Number of random bytes signed as the challenge payload.
pub const CHALLENGE_LEN: usize = 32;

/// Capability a peer installs to demand or satisfy signed challenges.
///
/// Implementors are expected to be cheap to construct and safe to hold
/// for the lifetime of a handshake; nothing here is async because
/// signing/verification with a pre-generated key is fast enough to run
/// inline on the reactor (unlike RSA key *generation*, which is not).
pub trait AuthProvider: Send + Sync {
    /// Draws the random bytes the peer is asked to sign.
    fn generate_challenge(&self) -> Vec<u8> {
        crypto::random_bytes::<CHALLENGE_LEN>().to_vec()
    }

    /// Signs `challenge`, producing the bytes carried in
    /// `ChallengeReplyMessage.signature`.
    fn sign_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// Verifies a signature produced by the peer's `sign_challenge`.
    fn verify_challenge(&self, challenge: &[u8], signature: &[u8]) -> Result<bool>;
}

/// An `AuthProvider` backed by a static RSA key pair: the local half
/// signs challenges, the remote half (the peer's known public key)
/// verifies them. Used symmetrically — a server verifying a client's
/// reply, or a client verifying a server's.
pub struct RsaAuthProvider {
    signing_key: Option<KeyPair>,
    verify_key: Option<PublicKey>,
}

impl RsaAuthProvider {
    /// A provider that can both sign (as the local identity) and
    /// verify (against the peer's known public key).
    pub fn new(signing_key: KeyPair, verify_key: PublicKey) -> Self {
        Self {
            signing_key: Some(signing_key),
            verify_key: Some(verify_key),
        }
    }

    /// A provider that can only verify, e.g. a server that checks
    /// client signatures but never signs anything itself.
    pub fn verify_only(verify_key: PublicKey) -> Self {
        Self {
            signing_key: None,
            verify_key: Some(verify_key),
        }
    }

    /// A provider that can only sign, e.g. a client replying to a
    /// server's challenge with no need to verify anything back.
    pub fn sign_only(signing_key: KeyPair) -> Self {
        Self {
            signing_key: Some(signing_key),
            verify_key: None,
        }
    }
}

impl AuthProvider for RsaAuthProvider {
    fn sign_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| Error::simple(ErrorKind::Auth))?;
        key.sign(challenge)
    }

    fn verify_challenge(&self, challenge: &[u8], signature: &[u8]) -> Result<bool> {
        let key = self
            .verify_key
            .as_ref()
            .ok_or_else(|| Error::simple(ErrorKind::Auth))?;
        Ok(key.verify(challenge, signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::rsa::KeyPair;

    #[test]
    fn test_sign_and_verify_round_trip() {
        let client_kp = KeyPair::generate().unwrap();
        let client_pk = client_kp.public_key();

        let client_side = RsaAuthProvider::sign_only(client_kp);
        let server_side = RsaAuthProvider::verify_only(client_pk);

        let challenge = server_side.generate_challenge();
        let signature = client_side.sign_challenge(&challenge).unwrap();
        assert!(server_side.verify_challenge(&challenge, &signature).unwrap());
    }

    #[test]
    fn test_verify_rejects_wrong_challenge() {
        let client_kp = KeyPair::generate().unwrap();
        let client_pk = client_kp.public_key();

        let client_side = RsaAuthProvider::sign_only(client_kp);
        let server_side = RsaAuthProvider::verify_only(client_pk);

        let challenge = server_side.generate_challenge();
        let signature = client_side.sign_challenge(&challenge).unwrap();
        let other_challenge = server_side.generate_challenge();
        assert!(!server_side
            .verify_challenge(&other_challenge, &signature)
            .unwrap());
    }

    #[test]
    fn test_sign_only_cannot_verify() {
        let client_kp = KeyPair::generate().unwrap();
        let client_side = RsaAuthProvider::sign_only(client_kp);
        let challenge = client_side.generate_challenge();
        assert!(client_side.verify_challenge(&challenge, &[]).is_err());
    }
}
