//! The client half of the transport: dials, drives the handshake
//! (including the optional forwarding chain), then exposes the
//! steady-state RPC/PTY/file-stream API described in `spec.md` §6.
//!
//! `Client` owns at most one live connection at a time; `session`
//! layers the reference-counted `connect`/`disconnect` contract on
//! top of it, and this module is where the actual socket lives.

pub mod channel;
pub mod session;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::auth::AuthProvider;
use crate::crypto::aes::AesKey;
use crate::error::*;
use crate::frame::{FrameReader, FrameWriter};
use crate::handshake::{self, client as hs, FailedOn};
use crate::message::*;
use crate::socket::Socket;
use crate::timeouts::Timeouts;

use channel::ChannelManager;

fn bin(bytes: Vec<u8>) -> bson::Binary {
    bson::Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes,
    }
}

/// An inbound PTY event surfaced to whatever the caller wired up as a
/// terminal (spawning and rendering the PTY itself is out of scope
/// here, per `spec.md` §1).
pub enum PtyEvent {
    Data(Vec<u8>),
    Closed { reason: String },
}

/// Configuration for an optional forwarding leg: dial through a
/// server that relays to `target:port`, with an optional mutual-TLS
/// upgrade once the relay is spliced.
pub struct ProxyConfig {
    pub target: String,
    pub port: u16,
    pub tls: Option<crate::socket::ProxyTlsConfig>,
}

pub struct ClientConfig {
    pub address: String,
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub proxy: Option<ProxyConfig>,
    pub timeouts: Timeouts,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            auth: None,
            proxy: None,
            timeouts: Timeouts::default(),
        }
    }
}

/// File-chunk size used by `stream_files`, matching the server side's
/// willingness to accept arbitrarily chunked `FileEntryStreamMessage`s.
const STREAM_CHUNK: usize = 64 * 1024;

struct ConnectedState {
    writer: Arc<AsyncMutex<FrameWriter<WriteHalf<Socket>>>>,
    read_task: JoinHandle<()>,
    proxy_source: Option<SocketAddr>,
    /// Requests a rekey from `read_loop`, the sole owner of the
    /// `FrameReader`. Each request carries its own reply channel so
    /// `rekey()` can await the outcome.
    rekey_tx: mpsc::Sender<oneshot::Sender<Result<()>>>,
}

/// One client-owned socket, handshaken and ready for RPC traffic.
/// `connect`/`disconnect` are reentrant-safe: concurrent callers share
/// the same underlying socket once established.
pub struct Client {
    config: ClientConfig,
    channels: ChannelManager,
    connect_lock: AsyncMutex<()>,
    state: AsyncMutex<Option<ConnectedState>>,
    key_data: AsyncMutex<Option<AesKey>>,
    liveness_tx: AsyncMutex<Option<oneshot::Sender<String>>>,
    pty_tx: AsyncMutex<Option<mpsc::Sender<PtyEvent>>>,
    encrypted: AtomicBool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            channels: ChannelManager::new(),
            connect_lock: AsyncMutex::new(()),
            state: AsyncMutex::new(None),
            key_data: AsyncMutex::new(None),
            liveness_tx: AsyncMutex::new(None),
            pty_tx: AsyncMutex::new(None),
            encrypted: AtomicBool::new(false),
        })
    }

    /// Installs the channel inbound PTY events are delivered on.
    /// Replaces any previously installed one.
    pub async fn set_pty_sink(&self, tx: mpsc::Sender<PtyEvent>) {
        *self.pty_tx.lock().await = Some(tx);
    }

    pub async fn proxy_source(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().and_then(|s| s.proxy_source)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted.load(Ordering::SeqCst)
    }

    /// The current session key's hex representation, for callers that
    /// need to observe a rekey rather than just trigger one (e.g.
    /// confirming the key actually rotated).
    pub async fn session_key_hex(&self) -> Option<String> {
        self.key_data.lock().await.as_ref().map(|k| k.to_hex())
    }

    /// Adds a reference (a channel) to the session, connecting the
    /// underlying socket first if this is the first caller. Repeated
    /// calls while a previous one is still dialing simply wait on the
    /// same lock and then add their own channel.
    pub(crate) async fn connect(self: &Arc<Self>) -> std::result::Result<(), FailedOn> {
        let _guard = self.connect_lock.lock().await;
        if self.state.lock().await.is_none() {
            let connected = self.connect_once().await?;
            self.encrypted.store(true, Ordering::SeqCst);
            *self.state.lock().await = Some(connected);
        }
        self.channels.add();
        Ok(())
    }

    /// Removes a reference; tears the socket down once the last one
    /// is released.
    pub(crate) async fn disconnect(&self) {
        self.channels.remove_first_idle();
        if !self.channels.is_empty() {
            return;
        }
        if let Some(state) = self.state.lock().await.take() {
            state.read_task.abort();
            let mut writer = state.writer.lock().await;
            let _ = writer.get_mut().shutdown().await;
        }
        *self.key_data.lock().await = None;
        self.encrypted.store(false, Ordering::SeqCst);
    }

    /// Whether the socket is currently connected and presumed
    /// writeable; `ensure_connected` in `session` layers the liveness
    /// probe and reconnect loop on top of this.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.is_some()
    }

    async fn connect_once(self: &Arc<Self>) -> std::result::Result<ConnectedState, FailedOn> {
        let timeouts = &self.config.timeouts;
        let stream = hs::dial(&self.config.address, timeouts).await?;
        let socket = Socket::from_tcp(stream).map_err(|_| FailedOn::NoSocket)?;
        let (read_half, write_half) = split(socket);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        hs::challenge(&mut reader, &mut writer, self.config.auth.as_ref(), timeouts).await?;

        let proxy_msg = match &self.config.proxy {
            Some(p) => ProxyMessage {
                proxy_required: true,
                proxy_target: Some(p.target.clone()),
                proxy_port: Some(p.port),
                proxy_ssl: p.tls.is_some(),
            },
            None => ProxyMessage {
                proxy_required: false,
                proxy_target: None,
                proxy_port: None,
                proxy_ssl: false,
            },
        };
        let response = hs::forwarding_request(&mut reader, &mut writer, proxy_msg, timeouts).await?;

        let mut proxy_source = None;
        if response.success {
            proxy_source = response
                .socket_details
                .as_deref()
                .and_then(|s| s.parse::<SocketAddr>().ok());

            if let Some(proxy) = &self.config.proxy {
                if let Some(tls) = &proxy.tls {
                    let socket = tokio::io::unsplit(reader.into_inner(), writer.into_inner());
                    let socket = socket
                        .upgrade_client_tls(&tls.connector, &proxy.target)
                        .await
                        .map_err(|_| FailedOn::ProxyNoSocket)?;
                    let (rh, wh) = split(socket);
                    reader = FrameReader::new(rh);
                    writer = FrameWriter::new(wh);
                }
            }

            // The forwarding target runs the same accept-path FSM;
            // repeat the challenge/auth dance against it, then tell
            // its own forwarding phase we want no further relay.
            hs::challenge(&mut reader, &mut writer, self.config.auth.as_ref(), timeouts)
                .await
                .map_err(remap_proxy_failure)?;
            let no_relay = ProxyMessage {
                proxy_required: false,
                proxy_target: None,
                proxy_port: None,
                proxy_ssl: false,
            };
            hs::forwarding_request(&mut reader, &mut writer, no_relay, timeouts)
                .await
                .map_err(|_| FailedOn::ProxyNoSocket)?;
        }

        let aes_key = hs::encryption_exchange(&mut reader, &mut writer, timeouts, None).await?;
        *self.key_data.lock().await = Some(aes_key);

        let writer = Arc::new(AsyncMutex::new(writer));
        let (rekey_tx, rekey_rx) = mpsc::channel(1);
        let this = self.clone();
        let read_task = tokio::spawn(async move { this.read_loop(reader, rekey_rx).await });

        Ok(ConnectedState {
            writer,
            read_task,
            proxy_source,
            rekey_tx,
        })
    }

    /// Steady-state read loop: decrypts every inbound frame and routes
    /// it to the channel multiplexer, the liveness mailbox, or the PTY
    /// sink. Runs until the socket closes or a protocol violation
    /// occurs, then clears connection state so the next `connect()`
    /// redials.
    ///
    /// Also the sole owner of the `FrameReader`, so a client-initiated
    /// rekey has to ask this loop to drive it rather than running
    /// concurrently against it: `rekey_rx` carries those requests in,
    /// interleaved with frame reads via `select!` (`FrameReader::fill`
    /// reads at most one `AsyncReadExt::read` per poll, which is
    /// cancel-safe, so a request arriving mid-read can't tear a frame
    /// in half).
    async fn read_loop(
        self: Arc<Self>,
        mut reader: FrameReader<ReadHalf<Socket>>,
        mut rekey_rx: mpsc::Receiver<oneshot::Sender<Result<()>>>,
    ) {
        loop {
            tokio::select! {
                frame = reader.read_frame(Some(self.config.timeouts.client_read)) => {
                    let frame = match frame {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::debug!(error = %e, "client read loop ending");
                            break;
                        }
                    };
                    let msg = match Message::deserialize(&frame) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::debug!(error = %e, "malformed frame, skipping");
                            continue;
                        }
                    };
                    let msg = match msg {
                        Message::Encrypted(env) => {
                            let key_data = self.key_data.lock().await;
                            let Some(aes_key) = key_data.clone() else {
                                tracing::warn!("encrypted frame before key agreement");
                                break;
                            };
                            drop(key_data);
                            match Message::decrypt(&env, &aes_key) {
                                Ok(m) => m,
                                Err(e) => {
                                    tracing::warn!(error = %e, "decryption failure, terminating session");
                                    break;
                                }
                            }
                        }
                        other => other,
                    };

                    if let Err(e) = self.dispatch(msg).await {
                        tracing::warn!(error = %e, "protocol violation, terminating session");
                        break;
                    }
                }
                req = rekey_rx.recv() => {
                    let Some(reply_tx) = req else {
                        continue;
                    };
                    let result = self.drive_rekey(&mut reader).await;
                    let _ = reply_tx.send(result);
                }
            }
        }

        *self.state.lock().await = None;
        *self.key_data.lock().await = None;
        self.channels.clear_all();
        self.encrypted.store(false, Ordering::SeqCst);
    }

    /// Sends `AesRekeyMessage` and drives the client side of the
    /// mirrored exchange (`spec.md` §4.5 steps 5-7, restarted) under
    /// the current key, installing the new one on success.
    async fn drive_rekey(&self, reader: &mut FrameReader<ReadHalf<Socket>>) -> Result<()> {
        let current = self
            .key_data
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::simple(ErrorKind::Session))?;

        let state = self.state.lock().await;
        let state = state.as_ref().ok_or_else(|| Error::simple(ErrorKind::Session))?;
        let mut writer = state.writer.lock().await;

        handshake::send_encrypted(&mut writer, &Message::AesRekey(AesRekeyMessage {}), &current).await?;
        let new_key = hs::encryption_exchange(reader, &mut writer, &self.config.timeouts, Some(&current))
            .await
            .map_err(|_| Error::simple(ErrorKind::Handshake))?;
        drop(writer);

        *self.key_data.lock().await = Some(new_key);
        Ok(())
    }

    /// Triggers a rekey of the steady-state session and waits for it
    /// to complete. The actual exchange runs on `read_loop`, the only
    /// task allowed to touch the `FrameReader`.
    pub async fn rekey(&self) -> Result<()> {
        let tx = {
            let state = self.state.lock().await;
            state
                .as_ref()
                .map(|s| s.rekey_tx.clone())
                .ok_or_else(|| Error::simple(ErrorKind::Session))?
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(reply_tx).await.map_err(|_| Error::simple(ErrorKind::Session))?;
        reply_rx.await.simple(ErrorKind::Channel)?
    }

    async fn dispatch(&self, msg: Message) -> Result<()> {
        match msg {
            Message::RpcReply(reply) => self.channels.deliver(reply.chan_id, reply.payload.bytes),
            Message::Liveliness(reply) => {
                if let Some(tx) = self.liveness_tx.lock().await.take() {
                    let _ = tx.send(reply.text);
                }
                Ok(())
            }
            Message::Pty(p) => {
                if let Some(tx) = self.pty_tx.lock().await.as_ref() {
                    let _ = tx.send(PtyEvent::Data(p.data.bytes)).await;
                }
                Ok(())
            }
            Message::PtyClosed(p) => {
                if let Some(tx) = self.pty_tx.lock().await.as_ref() {
                    let _ = tx.send(PtyEvent::Closed { reason: p.reason }).await;
                }
                Ok(())
            }
            _ => Err(Error::simple(ErrorKind::Handshake)),
        }
    }

    async fn send_encrypted(&self, msg: &Message) -> Result<()> {
        let state = self.state.lock().await;
        let state = state.as_ref().ok_or_else(|| Error::simple(ErrorKind::Session))?;
        let key_data = self.key_data.lock().await;
        let aes_key = key_data.clone().ok_or_else(|| Error::simple(ErrorKind::Session))?;
        drop(key_data);
        let mut writer = state.writer.lock().await;
        handshake::send_encrypted(&mut writer, msg, &aes_key).await
    }

    /// Sends one RPC request and, if `expect_reply`, awaits the
    /// correlated reply for up to `timeouts.rpc_reply`. The caller
    /// must already be connected (an idle channel must exist); this
    /// mirrors `spec.md` §4.8's "acquire an idle Channel; fail if
    /// none".
    pub async fn send_message(&self, payload: Vec<u8>, expect_reply: bool) -> Result<Option<Vec<u8>>> {
        let (chan_id, rx) = self.channels.acquire_idle()?;
        let result = self.send_message_inner(chan_id, payload, expect_reply, rx).await;
        self.channels.release(chan_id);
        result
    }

    async fn send_message_inner(
        &self,
        chan_id: u32,
        payload: Vec<u8>,
        expect_reply: bool,
        rx: oneshot::Receiver<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        let msg = Message::RpcRequest(RpcRequestMessage { chan_id, payload: bin(payload) });
        self.send_encrypted(&msg).await?;
        if !expect_reply {
            return Ok(None);
        }
        let reply = tokio::time::timeout(self.config.timeouts.rpc_reply, rx)
            .await
            .simple(ErrorKind::Timeout)?
            .simple(ErrorKind::Channel)?;
        Ok(Some(reply))
    }

    /// Issues a `LivelinessMessage{text="Echo"}` and requires the
    /// byte-reversed reply within `timeouts.liveness`.
    pub async fn writeable(&self) -> bool {
        if !self.is_connected().await {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        *self.liveness_tx.lock().await = Some(tx);
        let probe = Message::Liveliness(LivelinessMessage { chan_id: 0, text: "Echo".to_string() });
        if self.send_encrypted(&probe).await.is_err() {
            return false;
        }
        match tokio::time::timeout(self.config.timeouts.liveness, rx).await {
            Ok(Ok(text)) => text == "ohcE",
            _ => false,
        }
    }

    pub async fn send_pty_message(&self, data: Vec<u8>) -> Result<()> {
        self.send_encrypted(&Message::Pty(PtyMessage { data: bin(data) })).await
    }

    pub async fn send_pty_resize_message(&self, rows: u16, cols: u16) -> Result<()> {
        self.send_encrypted(&Message::PtyResize(PtyResizeMessage { rows, cols })).await
    }

    /// Streams each `(local_path, remote_path)` pair in
    /// `STREAM_CHUNK`-sized pieces, terminating each file with an
    /// `eof=true` chunk. A zero-length file still sends one chunk
    /// (empty `data`, `eof=true`), matching the empty-file edge case
    /// in `spec.md` §4.10.
    pub async fn stream_files(&self, files: &[(impl AsRef<Path>, String)]) -> Result<()> {
        for (local, remote) in files {
            let mut file = tokio::fs::File::open(local.as_ref()).await?;
            let mut buf = vec![0u8; STREAM_CHUNK];
            loop {
                let n = file.read(&mut buf).await?;
                let eof = n == 0;
                let msg = Message::FileEntryStream(FileEntryStreamMessage {
                    path: remote.clone(),
                    data: bin(buf[..n].to_vec()),
                    eof,
                });
                self.send_encrypted(&msg).await?;
                if eof {
                    break;
                }
            }
        }
        Ok(())
    }
}

fn remap_proxy_failure(e: FailedOn) -> FailedOn {
    match e {
        FailedOn::AuthAddressRequired => FailedOn::ProxyAuthAddressRequired,
        FailedOn::AuthDenied => FailedOn::ProxyAuthDenied,
        other => other,
    }
}
