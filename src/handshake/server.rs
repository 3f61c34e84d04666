//! Server accept path: source gate → challenge → (optional)
//! forwarding → RSA/AES key agreement → ready. Each step is a plain
//! function rather than a callback registered against an event, so
//! the linear order in `spec.md` §4.5 is just the order these
//! functions are called in.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::auth::AuthProvider;
use crate::crypto::aes::AesKey;
use crate::crypto::rsa::KeyPair;
use crate::crypto::{self, KeyData};
use crate::error::*;
use crate::forwarding;
use crate::frame::{FrameReader, FrameWriter};
use crate::message::*;
use crate::timeouts::Timeouts;

use super::{recv_encrypted, recv_plain, send_encrypted, send_plain, with_timeout};

fn bin(bytes: Vec<u8>) -> bson::Binary {
    bson::Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes,
    }
}

/// What the server learned once the handshake reaches a terminal,
/// non-proxied state.
pub struct HandshakeReady {
    pub key_data: KeyData,
    pub authenticated: bool,
}

/// What the forwarding phase decided.
pub enum ForwardingOutcome {
    NotRequested,
    Relayed { upstream: TcpStream, local_sockname: SocketAddr },
}

/// Step 1: reject connections from sources outside an optional
/// whitelist, after an anti-probe delay.
pub async fn source_gate(peer_ip: IpAddr, whitelist: Option<&[IpAddr]>, reject_delay: std::time::Duration) -> Result<()> {
    if let Some(wl) = whitelist {
        if !wl.contains(&peer_ip) {
            tokio::time::sleep(reject_delay).await;
            return Err(Error::simple(ErrorKind::Handshake));
        }
    }
    Ok(())
}

/// Steps 2-3: send the challenge, wait for the signed reply, and
/// verify it if an auth provider is configured.
pub async fn challenge<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    peer_addr: SocketAddr,
    auth: Option<&Arc<dyn AuthProvider>>,
    timeouts: &Timeouts,
) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let challenge_id = hex::encode(crypto::random_bytes::<16>());
    let to_sign = auth.map(|a| a.generate_challenge()).unwrap_or_default();

    send_plain(
        writer,
        &Message::Challenge(ChallengeMessage {
            source: peer_addr.to_string(),
            auth_required: auth.is_some(),
            id: challenge_id,
            to_sign: bin(to_sign.clone()),
            address: None,
        }),
    )
    .await?;

    let reply = with_timeout(timeouts.server_phase, recv_plain(reader, None)).await?;
    let reply = match reply {
        Message::ChallengeReply(r) => r,
        _ => return Err(Error::simple(ErrorKind::Handshake)),
    };

    if reply.close_connection {
        return Err(Error::simple(ErrorKind::Auth));
    }

    let Some(auth) = auth else {
        return Ok(false);
    };

    let signature = reply.signature.map(|b| b.bytes).unwrap_or_default();
    let verified = auth.verify_challenge(&to_sign, &signature)?;

    send_plain(
        writer,
        &Message::AuthReply(AuthReplyMessage {
            source: peer_addr.to_string(),
            authenticated: verified,
        }),
    )
    .await?;

    if !verified {
        return Err(Error::simple(ErrorKind::Auth));
    }
    Ok(true)
}

/// Step 4: wait for the client's forwarding decision and, if
/// requested, dial the downstream target.
pub async fn forwarding_decision<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    timeouts: &Timeouts,
) -> Result<ForwardingOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg = with_timeout(timeouts.server_phase, recv_plain(reader, None)).await?;
    let proxy = match msg {
        Message::Proxy(p) => p,
        _ => return Err(Error::simple(ErrorKind::Handshake)),
    };

    if !proxy.proxy_required {
        send_plain(
            writer,
            &Message::ProxyResponse(ProxyResponseMessage {
                success: false,
                socket_details: None,
            }),
        )
        .await?;
        return Ok(ForwardingOutcome::NotRequested);
    }

    let target = proxy.proxy_target.ok_or_else(|| Error::simple(ErrorKind::Forwarding))?;
    let port = proxy.proxy_port.ok_or_else(|| Error::simple(ErrorKind::Forwarding))?;

    match forwarding::dial_with_retry(
        &target,
        port,
        timeouts.forwarding_dial,
        timeouts.forwarding_dial_attempts,
    )
    .await
    {
        Ok(stream) => {
            let local_sockname = stream.local_addr()?;
            send_plain(
                writer,
                &Message::ProxyResponse(ProxyResponseMessage {
                    success: true,
                    socket_details: Some(local_sockname.to_string()),
                }),
            )
            .await?;
            Ok(ForwardingOutcome::Relayed { upstream: stream, local_sockname })
        }
        Err(e) => {
            send_plain(
                writer,
                &Message::ProxyResponse(ProxyResponseMessage {
                    success: false,
                    socket_details: None,
                }),
            )
            .await?;
            Err(e)
        }
    }
}

/// Steps 5-7: generate (or reuse, for rekey) an RSA key pair, send
/// the public half — plaintext on first handshake, encrypted under
/// `rewrap_key` during a rekey — receive the session key, and confirm
/// the test-encryption round trip. Returns the freshly installed
/// `KeyData`.
pub async fn encryption_exchange<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    timeouts: &Timeouts,
    rewrap_key: Option<&AesKey>,
) -> Result<KeyData>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut key_data, public_key) = tokio::task::spawn_blocking(|| {
        let mut kd = KeyData::new();
        kd.generate_rsa().map(|pk| (kd, pk))
    })
    .await
    .simple(ErrorKind::CryptoRsa)??;

    let public_msg = Message::RsaPublicKey(RsaPublicKeyMessage { key: bin(public_key.to_der()?) });
    match rewrap_key {
        Some(k) => send_encrypted(writer, &public_msg, k).await?,
        None => send_plain(writer, &public_msg).await?,
    }

    let session_key_msg = match rewrap_key {
        Some(k) => with_timeout(timeouts.server_phase, recv_encrypted(reader, None, k)).await?,
        None => with_timeout(timeouts.server_phase, recv_plain(reader, None)).await?,
    };
    let session_key_msg = match session_key_msg {
        Message::SessionKey(s) => s,
        _ => return Err(Error::simple(ErrorKind::Handshake)),
    };

    let aes_key = decrypt_session_key(key_data.rsa().ok_or_else(|| Error::simple(ErrorKind::CryptoRsa))?, &session_key_msg)?;
    key_data.install_aes_key(aes_key.clone());

    let nonce_hex = hex::encode(crypto::random_bytes::<16>());
    let test = Message::Test(TestMessage {
        fill: nonce_hex.clone(),
        text: "TestEncryptionMessage".to_string(),
    });
    send_encrypted(writer, &test, &aes_key).await?;

    let reply = with_timeout(timeouts.server_phase, recv_encrypted(reader, None, &aes_key)).await?;
    let reply = match reply {
        Message::Test(t) => t,
        _ => return Err(Error::simple(ErrorKind::Handshake)),
    };

    let expected_fill: String = nonce_hex.chars().rev().collect();
    if reply.text != "TestEncryptionMessageResponse" || reply.fill != expected_fill {
        return Err(Error::simple(ErrorKind::CryptoAes));
    }

    Ok(key_data)
}

/// Decrypts the two-part `SessionKeyMessage` payload (§3: the
/// RSA-wrapped raw key alongside a redundant copy of the
/// `AesKeyMessage`, itself AES-encrypted under that same key) and
/// asserts both halves agree.
fn decrypt_session_key(rsa: &KeyPair, msg: &SessionKeyMessage) -> Result<AesKey> {
    let raw_key = rsa.decrypt(&msg.rsa_encrypted_session_key.bytes)?;
    let aes_key = AesKey::from_bytes(
        raw_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::simple(ErrorKind::Handshake))?,
    );

    let envelope = Message::deserialize(&msg.aes_key_message_bytes.bytes)?;
    let encrypted = match envelope {
        Message::Encrypted(e) => e,
        _ => return Err(Error::simple(ErrorKind::Handshake)),
    };
    let aes_key_message = match Message::decrypt(&encrypted, &aes_key)? {
        Message::AesKey(m) => m,
        _ => return Err(Error::simple(ErrorKind::Handshake)),
    };
    let redundant = AesKey::from_hex(&aes_key_message.aes_key)?;

    if redundant.to_hex() != aes_key.to_hex() {
        return Err(Error::simple(ErrorKind::Handshake));
    }
    Ok(aes_key)
}

/// Rekey: restarts from the encryption exchange, wrapping the new
/// `RsaPublicKeyMessage` under the *current* AES key, and replaces
/// `key_data` with the freshly negotiated one. `encrypted` stays
/// true throughout on the caller's side.
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
    let new_key_data = encryption_exchange(reader, writer, timeouts, Some(&current)).await?;
    *key_data = new_key_data;
    Ok(())
}
