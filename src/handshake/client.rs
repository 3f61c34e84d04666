//! Client connect path: dial → challenge → (optional) auth wait →
//! forwarding → RSA/AES key agreement → ready. Mirrors `server.rs`
//! phase for phase; every wait is bounded by `timeouts.client_phase`
//! and failure sets a `FailedOn` reason instead of a bare error so
//! `client::session` can report it upward.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::auth::AuthProvider;
use crate::crypto::aes::AesKey;
use crate::crypto::{self, KeyData};
use crate::error::*;
use crate::frame::{FrameReader, FrameWriter};
use crate::message::*;
use crate::timeouts::{dial_backoff, Timeouts};

use super::{recv_encrypted, recv_plain, send_encrypted, send_plain, with_timeout, FailedOn};

fn bin(bytes: Vec<u8>) -> bson::Binary {
    bson::Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes,
    }
}

/// Dials `addr` with up to `timeouts.client_dial_attempts` attempts,
/// each bounded by `timeouts.client_dial` and separated by an
/// incremental 0/1/2s back-off.
pub async fn dial(addr: &str, timeouts: &Timeouts) -> std::result::Result<TcpStream, FailedOn> {
    let mut last_err = None;
    for attempt in 0..timeouts.client_dial_attempts {
        if attempt > 0 {
            tokio::time::sleep(dial_backoff(attempt)).await;
        }
        match tokio::time::timeout(timeouts.client_dial, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => last_err = None,
        }
    }
    let _ = last_err;
    Err(FailedOn::NoSocket)
}

/// Steps 2-3: wait for the challenge, reply to it (or refuse if auth
/// is demanded but we have no provider), and wait for the verdict.
pub async fn challenge<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    auth: Option<&Arc<dyn AuthProvider>>,
    timeouts: &Timeouts,
) -> std::result::Result<bool, FailedOn>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg = with_timeout(timeouts.client_phase, recv_plain(reader, None))
        .await
        .map_err(|_| FailedOn::ChallengeTimeout)?;
    let challenge = match msg {
        Message::Challenge(c) => c,
        _ => return Err(FailedOn::ChallengeTimeout),
    };

    if challenge.auth_required && auth.is_none() {
        let _ = send_plain(
            writer,
            &Message::ChallengeReply(ChallengeReplyMessage {
                close_connection: true,
                signature: None,
            }),
        )
        .await;
        return Err(FailedOn::AuthAddressRequired);
    }

    let signature = match auth {
        Some(provider) => Some(bin(provider.sign_challenge(&challenge.to_sign.bytes).map_err(|_| FailedOn::AuthAddressRequired)?)),
        None => None,
    };

    send_plain(
        writer,
        &Message::ChallengeReply(ChallengeReplyMessage {
            close_connection: false,
            signature,
        }),
    )
    .await
    .map_err(|_| FailedOn::ChallengeTimeout)?;

    if !challenge.auth_required {
        return Ok(false);
    }

    let reply = with_timeout(timeouts.client_phase, recv_plain(reader, None))
        .await
        .map_err(|_| FailedOn::AuthTimeout)?;
    match reply {
        Message::AuthReply(r) if r.authenticated => Ok(true),
        Message::AuthReply(_) => Err(FailedOn::AuthDenied),
        _ => Err(FailedOn::AuthDenied),
    }
}

/// Step 4: send our forwarding request (possibly empty) and wait for
/// the server's verdict.
pub async fn forwarding_request<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    proxy: ProxyMessage,
    timeouts: &Timeouts,
) -> std::result::Result<ProxyResponseMessage, FailedOn>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_plain(writer, &Message::Proxy(proxy))
        .await
        .map_err(|_| FailedOn::ForwardingTimeout)?;

    let msg = with_timeout(timeouts.client_phase, recv_plain(reader, None))
        .await
        .map_err(|_| FailedOn::ForwardingTimeout)?;
    match msg {
        Message::ProxyResponse(r) => Ok(r),
        _ => Err(FailedOn::ForwardingTimeout),
    }
}

/// Steps 6-7: receive the RSA public key, draw a fresh AES key, wrap
/// it, send it, and confirm the test-encryption round trip. When
/// `rewrap_key` is `Some`, every message in this exchange travels
/// inside an `Encrypted` envelope keyed by the *previous* session key
/// (the rekey flow); otherwise it's plaintext (first handshake).
pub async fn encryption_exchange<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    timeouts: &Timeouts,
    rewrap_key: Option<&AesKey>,
) -> std::result::Result<AesKey, FailedOn>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg = match rewrap_key {
        Some(k) => with_timeout(timeouts.client_phase, recv_encrypted(reader, None, k)).await,
        None => with_timeout(timeouts.client_phase, recv_plain(reader, None)).await,
    }
    .map_err(|_| FailedOn::EncryptionTimeout)?;

    let public = match msg {
        Message::RsaPublicKey(p) => p,
        _ => return Err(FailedOn::EncryptionTimeout),
    };
    let public_key =
        crate::crypto::rsa::PublicKey::from_der(&public.key.bytes).map_err(|_| FailedOn::EncryptionTimeout)?;

    let aes_key = crypto::random_aes_key();

    // `AesKeyMessage` only ever travels inside an encrypted envelope,
    // keyed by the session key it itself carries: the redundant,
    // already-negotiated key encrypts its own wire copy.
    let aes_key_message = Message::AesKey(AesKeyMessage { aes_key: aes_key.to_hex() });
    let aes_key_message_encrypted = aes_key_message
        .encrypt(&aes_key)
        .map_err(|_| FailedOn::EncryptionTimeout)?;
    let aes_key_message_bytes = aes_key_message_encrypted
        .serialize()
        .map_err(|_| FailedOn::EncryptionTimeout)?;

    let rsa_encrypted_session_key = public_key
        .encrypt(&aes_key_bytes(&aes_key))
        .map_err(|_| FailedOn::EncryptionTimeout)?;

    let session_key_msg = Message::SessionKey(SessionKeyMessage {
        aes_key_message_bytes: bin(aes_key_message_bytes),
        rsa_encrypted_session_key: bin(rsa_encrypted_session_key),
    });
    match rewrap_key {
        Some(k) => send_encrypted(writer, &session_key_msg, k).await,
        None => send_plain(writer, &session_key_msg).await,
    }
    .map_err(|_| FailedOn::EncryptionTimeout)?;

    let test_msg = with_timeout(timeouts.client_phase, recv_encrypted(reader, None, &aes_key))
        .await
        .map_err(|_| FailedOn::EncryptionTimeout)?;
    let test = match test_msg {
        Message::Test(t) => t,
        _ => return Err(FailedOn::EncryptionTimeout),
    };
    if test.text != "TestEncryptionMessage" {
        return Err(FailedOn::EncryptionTimeout);
    }
    let reversed: String = test.fill.chars().rev().collect();
    let response = Message::Test(TestMessage {
        fill: reversed,
        text: "TestEncryptionMessageResponse".to_string(),
    });
    send_encrypted(writer, &response, &aes_key)
        .await
        .map_err(|_| FailedOn::EncryptionTimeout)?;

    Ok(aes_key)
}

fn aes_key_bytes(key: &AesKey) -> Vec<u8> {
    hex::decode(key.to_hex()).expect("hex produced by to_hex always decodes")
}

/// Rekey: mirrors `server::rekey`, restarting the encryption exchange
/// under the current session key and installing the result.
pub async fn rekey<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    timeouts: &Timeouts,
    key_data: &mut KeyData,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let current = key_data
        .aes_key()
        .cloned()
        .ok_or_else(|| Error::simple(ErrorKind::Handshake))?;
    let new_key = encryption_exchange(reader, writer, timeouts, Some(&current))
        .await
        .map_err(|_| Error::simple(ErrorKind::Handshake))?;
    key_data.install_aes_key(new_key);
    Ok(())
}
