//! The handshake state machine shared vocabulary: phase states, the
//! client's `failed_on` taxonomy, and the frame-level send/receive
//! helpers both `server` and `client` build on.
//!
//! Per the REDESIGN FLAGS guidance, the four synchronization events
//! the original used to linearize the handshake (`challenge_complete`,
//! `forwarding_decided`, `encrypted`) are collapsed into a single
//! `HandshakeState` enum advanced by a state function: each inbound
//! message asserts the state it expects to find the peer in, and a
//! mismatch is a protocol violation rather than a race to reason
//! about.

pub mod client;
pub mod server;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::crypto::aes::AesKey;
use crate::error::*;
use crate::frame::{FrameReader, FrameWriter};
use crate::message::Message;

/// Phases of the linear handshake, in the order both sides execute
/// them. A peer's state only ever moves forward, except that
/// `AesRekeyMessage` sends an already-`Ready` peer back to
/// `EncryptionBootstrap` while leaving its `encrypted` flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    SourceGate,
    ChallengeSent,
    ChallengeReplied,
    ForwardingDecided,
    EncryptionBootstrap,
    SessionKeyReceived,
    TestConfirm,
    Ready,
}

/// Why a client-side connection attempt failed, surfaced to the
/// caller instead of a generic error so upper layers can decide
/// whether to retry, alert, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedOn {
    NoSocket,
    AuthAddressRequired,
    AuthDenied,
    ProxyAuthAddressRequired,
    ProxyAuthDenied,
    ProxyNoSocket,
    AuthTimeout,
    ChallengeTimeout,
    EncryptionTimeout,
    ForwardingTimeout,
}

/// Sends a plaintext message frame.
pub async fn send_plain<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    msg: &Message,
) -> Result<()> {
    writer.write_frame(&msg.serialize()?).await
}

/// Encrypts `msg` under `key` and sends the resulting envelope.
pub async fn send_encrypted<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    msg: &Message,
    key: &AesKey,
) -> Result<()> {
    let envelope = msg.encrypt(key)?;
    send_plain(writer, &envelope).await
}

/// Reads and deserializes the next plaintext message frame, with an
/// optional per-read timeout (`None` during the server's handshake,
/// per `spec.md` §4.1).
pub async fn recv_plain<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    timeout: Option<Duration>,
) -> Result<Message> {
    let bytes = reader.read_frame(timeout).await?;
    Message::deserialize(&bytes)
}

/// Reads the next frame and decrypts it, asserting it was in fact an
/// `Encrypted` envelope.
pub async fn recv_encrypted<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    timeout: Option<Duration>,
    key: &AesKey,
) -> Result<Message> {
    match recv_plain(reader, timeout).await? {
        Message::Encrypted(env) => Message::decrypt(&env, key),
        _ => Err(Error::simple(ErrorKind::Handshake)),
    }
}

/// Applies a phase timeout to a future, mapping elapsed time to
/// `ErrorKind::Timeout` rather than leaking the `Elapsed` type.
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| Error::simple(ErrorKind::Timeout))?
}
