//! The message catalogue: every wire message variant, and the
//! encrypt/decrypt envelope wrapped around them once a peer is
//! encrypted.
//!
//! Every variant is a tagged BSON document (the `type` field selects
//! the variant; `serde`'s internal tagging does the rest). Binary
//! payloads use `bson::Binary` rather than a bare `Vec<u8>` so they
//! round-trip as BSON binary subtype 0 instead of an array of
//! integers.

use bson::spec::BinarySubtype;
use bson::Binary;
use serde::{Deserialize, Serialize};

use crate::crypto::aes::{self, AesKey};
use crate::error::*;

fn bin(bytes: Vec<u8>) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    }
}

/// A tagged, self-describing wire message. Each variant matches one
/// row of the message catalogue in `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    RsaPublicKey(RsaPublicKeyMessage),
    SessionKey(SessionKeyMessage),
    AesKey(AesKeyMessage),
    Encrypted(EncryptedMessage),
    Test(TestMessage),
    Challenge(ChallengeMessage),
    ChallengeReply(ChallengeReplyMessage),
    AuthReply(AuthReplyMessage),
    Proxy(ProxyMessage),
    ProxyResponse(ProxyResponseMessage),
    RpcRequest(RpcRequestMessage),
    RpcReply(RpcReplyMessage),
    Pty(PtyMessage),
    PtyResize(PtyResizeMessage),
    PtyClosed(PtyClosedMessage),
    FileEntryStream(FileEntryStreamMessage),
    Liveliness(LivelinessMessage),
    AesRekey(AesRekeyMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsaPublicKeyMessage {
    pub key: Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKeyMessage {
    /// A serialized `Encrypted(AesKeyMessage)`, AES-encrypted under
    /// the very session key it carries — a redundant copy the
    /// receiver can only open once it already holds that key.
    pub aes_key_message_bytes: Binary,
    /// The raw session key, RSA-wrapped under the peer's public key.
    pub rsa_encrypted_session_key: Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AesKeyMessage {
    /// 32-character hex encoding of the 16-byte AES key.
    pub aes_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub nonce: Binary,
    pub tag: Binary,
    pub ciphertext: Binary,
    pub original_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMessage {
    pub fill: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeMessage {
    pub source: String,
    pub auth_required: bool,
    pub id: String,
    pub to_sign: Binary,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeReplyMessage {
    pub close_connection: bool,
    pub signature: Option<Binary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthReplyMessage {
    pub source: String,
    pub authenticated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyMessage {
    pub proxy_required: bool,
    pub proxy_target: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_ssl: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResponseMessage {
    pub success: bool,
    pub socket_details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequestMessage {
    pub chan_id: u32,
    pub payload: Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReplyMessage {
    pub chan_id: u32,
    pub payload: Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyMessage {
    pub data: Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyResizeMessage {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyClosedMessage {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntryStreamMessage {
    pub path: String,
    pub data: Binary,
    pub eof: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivelinessMessage {
    pub chan_id: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AesRekeyMessage {}

impl Message {
    /// Serializes this message to a BSON document.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bson::to_vec(self).wrapped(ErrorKind::CommunicationMessage)
    }

    /// Deserializes a message previously produced by `serialize`.
    ///
    /// Failures here are *malformed frame* errors: the caller should
    /// log and skip the offending frame rather than terminate the
    /// peer (`spec.md` §7).
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        bson::from_slice(bytes).wrapped(ErrorKind::CommunicationMessage)
    }

    /// The `type` discriminator this message would serialize under;
    /// recorded verbatim in `EncryptedMessage.original_type`.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Message::RsaPublicKey(_) => "RsaPublicKey",
            Message::SessionKey(_) => "SessionKey",
            Message::AesKey(_) => "AesKey",
            Message::Encrypted(_) => "Encrypted",
            Message::Test(_) => "Test",
            Message::Challenge(_) => "Challenge",
            Message::ChallengeReply(_) => "ChallengeReply",
            Message::AuthReply(_) => "AuthReply",
            Message::Proxy(_) => "Proxy",
            Message::ProxyResponse(_) => "ProxyResponse",
            Message::RpcRequest(_) => "RpcRequest",
            Message::RpcReply(_) => "RpcReply",
            Message::Pty(_) => "Pty",
            Message::PtyResize(_) => "PtyResize",
            Message::PtyClosed(_) => "PtyClosed",
            Message::FileEntryStream(_) => "FileEntryStream",
            Message::Liveliness(_) => "Liveliness",
            Message::AesRekey(_) => "AesRekey",
        }
    }

    /// Wraps `self` in an `EncryptedMessage` under `key`.
    pub fn encrypt(&self, key: &AesKey) -> Result<Message> {
        let plaintext = self.serialize()?;
        let (nonce, tag, ciphertext) = aes::encrypt(key, &plaintext)?;
        Ok(Message::Encrypted(EncryptedMessage {
            nonce: bin(nonce.to_vec()),
            tag: bin(tag.to_vec()),
            ciphertext: bin(ciphertext),
            original_type: self.type_tag().to_string(),
        }))
    }

    /// Decrypts an `EncryptedMessage`, verifying its tag before
    /// trusting the payload (`ErrorKind::CryptoAes` on mismatch).
    pub fn decrypt(encrypted: &EncryptedMessage, key: &AesKey) -> Result<Message> {
        let nonce: [u8; 12] = encrypted
            .nonce
            .bytes
            .as_slice()
            .try_into()
            .simple(ErrorKind::CommunicationMessage)?;
        let tag: [u8; 16] = encrypted
            .tag
            .bytes
            .as_slice()
            .try_into()
            .simple(ErrorKind::CommunicationMessage)?;
        let plaintext = aes::decrypt(key, &nonce, &tag, &encrypted.ciphertext.bytes)?;
        Message::deserialize(&plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_aes_key;

    #[test]
    fn test_frame_round_trip() {
        let msg = Message::Test(TestMessage {
            fill: "abc".into(),
            text: "TestEncryptionMessage".into(),
        });
        let bytes = msg.serialize().unwrap();
        let back = Message::deserialize(&bytes).unwrap();
        match back {
            Message::Test(t) => {
                assert_eq!(t.fill, "abc");
                assert_eq!(t.text, "TestEncryptionMessage");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key = random_aes_key();
        let msg = Message::RpcRequest(RpcRequestMessage {
            chan_id: 3,
            payload: bin(b"hello".to_vec()),
        });
        let encrypted = msg.encrypt(&key).unwrap();
        let Message::Encrypted(env) = encrypted else {
            panic!("expected Encrypted variant")
        };
        assert_eq!(env.original_type, "RpcRequest");
        let decrypted = Message::decrypt(&env, &key).unwrap();
        match decrypted {
            Message::RpcRequest(r) => {
                assert_eq!(r.chan_id, 3);
                assert_eq!(r.payload.bytes, b"hello");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_tampered_envelope_fails_integrity() {
        let key = random_aes_key();
        let msg = Message::AesRekey(AesRekeyMessage {});
        let encrypted = msg.encrypt(&key).unwrap();
        let Message::Encrypted(mut env) = encrypted else {
            panic!("expected Encrypted variant")
        };
        env.ciphertext.bytes[0] ^= 0xff;
        let err = Message::decrypt(&env, &key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoAes);
    }
}
