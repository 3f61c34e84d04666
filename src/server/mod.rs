//! The server half of the transport: accepts connections, drives each
//! one through the handshake state machine, and then dispatches its
//! steady-state traffic (RPC, PTY, file streams, liveness, rekey) to
//! the peer registry and the upper RPC layer's `receive_message`
//! queue.

pub mod registry;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{split, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::auth::AuthProvider;
use crate::error::*;
use crate::forwarding;
use crate::frame::{FrameReader, FrameWriter};
use crate::handshake::{self, server as hs};
use crate::message::*;
use crate::socket::Socket;
use crate::subprotocol::file_stream::FileStreamState;
use crate::subprotocol::pty::{self, AttachedPty};
use crate::timeouts::Timeouts;

use registry::{InactivityTimer, Peer, Registry};

fn bin(bytes: Vec<u8>) -> bson::Binary {
    bson::Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes,
    }
}

/// One inbound RPC request surfaced to the upper layer:
/// `(peer_id, chan_id, opaque_payload)`.
pub type InboundRpc = (SocketAddr, u32, Vec<u8>);

pub struct ServerConfig {
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub ip_whitelist: Option<Vec<IpAddr>>,
    pub timeouts: Timeouts,
    /// Retry interval when `bind` fails (§6: "retries `OSError` on
    /// bind every 5s").
    pub bind_retry: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            auth: None,
            ip_whitelist: None,
            timeouts: Timeouts::default(),
            bind_retry: Duration::from_secs(5),
        }
    }
}

pub struct Server {
    registry: Arc<Registry>,
    config: ServerConfig,
    inbound_tx: mpsc::Sender<InboundRpc>,
    inbound_rx: AsyncMutex<mpsc::Receiver<InboundRpc>>,
    listener_task: SyncMutex<Option<JoinHandle<()>>>,
    file_streams: Arc<SyncMutex<std::collections::HashMap<SocketAddr, Arc<FileStreamState>>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        Arc::new(Self {
            registry: Arc::new(Registry::new()),
            config,
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            listener_task: SyncMutex::new(None),
            file_streams: Arc::new(SyncMutex::new(std::collections::HashMap::new())),
        })
    }

    /// Binds `address:port`, retrying on failure, and starts the
    /// accept loop in the background.
    pub async fn start_server(self: &Arc<Self>, address: &str, port: u16) -> Result<()> {
        let bind_addr = format!("{address}:{port}");
        let listener = loop {
            match TcpListener::bind(&bind_addr).await {
                Ok(l) => break l,
                Err(e) => {
                    tracing::warn!(addr = %bind_addr, error = %e, "bind failed, retrying");
                    tokio::time::sleep(self.config.bind_retry).await;
                }
            }
        };
        let this = self.clone();
        let handle = tokio::spawn(async move { this.accept_loop(listener).await });
        *self.listener_task.lock() = Some(handle);
        Ok(())
    }

    /// Destroys every peer and stops accepting new connections.
    pub fn stop_server(&self) {
        if let Some(h) = self.listener_task.lock().take() {
            h.abort();
        }
        self.registry.destroy_all();
    }

    /// Blocks until an RPC request arrives from any peer.
    pub async fn receive_message(&self) -> Option<InboundRpc> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Sends an RPC reply to `peer_id` on `chan_id`, encrypted under
    /// that peer's current session key.
    pub async fn send_reply(&self, peer_id: SocketAddr, chan_id: u32, payload: Vec<u8>) -> Result<()> {
        let peer = self
            .registry
            .lookup(&peer_id)
            .ok_or_else(|| Error::simple(ErrorKind::Session))?;
        let msg = Message::RpcReply(RpcReplyMessage { chan_id, payload: bin(payload) });
        let key_data = peer.key_data.lock().await;
        let aes_key = key_data
            .aes_key()
            .cloned()
            .ok_or_else(|| Error::simple(ErrorKind::Handshake))?;
        drop(key_data);
        let mut writer_slot = peer.writer.lock().await;
        let writer = writer_slot.as_mut().ok_or_else(|| Error::simple(ErrorKind::Session))?;
        handshake::send_encrypted(writer, &msg, &aes_key).await
    }

    /// Attaches a pseudo-terminal to an already-`Ready` peer and starts
    /// its producer task streaming output back as encrypted `Pty`
    /// frames. Spawning the child process itself is the caller's job;
    /// this only wires the already-spawned handle into dispatch.
    pub async fn attach_pty(
        &self,
        peer_id: SocketAddr,
        master: Box<dyn portable_pty::MasterPty + Send>,
        pty_writer: Box<dyn std::io::Write + Send>,
        child: Box<dyn portable_pty::Child + Send + Sync>,
    ) -> Result<()> {
        let peer = self.registry.lookup(&peer_id).ok_or_else(|| Error::simple(ErrorKind::Session))?;
        let key_data = peer.key_data.lock().await;
        let aes_key = key_data.aes_key().cloned().ok_or_else(|| Error::simple(ErrorKind::Handshake))?;
        drop(key_data);

        let attached = Arc::new(AttachedPty::new(master, pty_writer, child));
        peer.attach_pty(attached.clone()).await;

        let peer_for_task = peer.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = pty::run_producer(attached, peer_for_task, aes_key).await {
                tracing::debug!(error = %e, "pty producer ended");
            }
        });
        peer.track_task(handle);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_accept(stream, addr).await });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }

    async fn handle_accept(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = hs::source_gate(addr.ip(), self.config.ip_whitelist.as_deref(), self.config.timeouts.source_gate_reject).await {
            tracing::debug!(peer = %addr, error = %e, "rejected by source gate");
            return;
        }

        let socket = match Socket::from_tcp(stream) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "failed to wrap accepted socket");
                return;
            }
        };
        let (read_half, write_half): (ReadHalf<Socket>, WriteHalf<Socket>) = split(socket);
        let reader = FrameReader::new(read_half);
        let writer = FrameWriter::new(write_half);

        let peer = Peer::new(addr);
        self.registry.add(peer.clone());

        match self.run_handshake(&peer, reader, writer, addr).await {
            Ok(Some(peer_reader)) => {
                let this = self.clone();
                let peer_for_loop = peer.clone();
                let read_handle = tokio::spawn(async move { this.peer_read_loop(peer_for_loop, peer_reader).await });
                peer.set_read_loop(read_handle);
            }
            Ok(None) => {
                // Proxied: the peer spliced itself off and already
                // removed its own registry entry.
            }
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "handshake failed");
                self.registry.destroy(&addr);
            }
        }
    }

    /// Runs challenge/forwarding/encryption. Returns `Some(reader)`
    /// once the peer is `Ready` (the caller spawns the steady-state
    /// read loop over it), or `None` if the peer was handed off to
    /// raw forwarding instead.
    async fn run_handshake(
        &self,
        peer: &Arc<Peer>,
        mut reader: FrameReader<ReadHalf<Socket>>,
        mut writer: FrameWriter<WriteHalf<Socket>>,
        addr: SocketAddr,
    ) -> Result<Option<FrameReader<ReadHalf<Socket>>>> {
        let authenticated = hs::challenge(&mut reader, &mut writer, addr, self.config.auth.as_ref(), &self.config.timeouts).await?;
        peer.authenticated.store(authenticated, Ordering::SeqCst);

        match hs::forwarding_decision(&mut reader, &mut writer, &self.config.timeouts).await? {
            hs::ForwardingOutcome::Relayed { upstream, .. } => {
                peer.proxied.store(true, Ordering::SeqCst);
                self.registry.destroy(&addr);
                let socket = tokio::io::unsplit(reader.into_inner(), writer.into_inner());
                tracing::debug!(peer = %addr, "forwarding relay established");
                if let Err(e) = forwarding::splice(socket, upstream).await {
                    tracing::debug!(peer = %addr, error = %e, "forwarding splice ended");
                }
                return Ok(None);
            }
            hs::ForwardingOutcome::NotRequested => {}
        }

        let key_data = hs::encryption_exchange(&mut reader, &mut writer, &self.config.timeouts, None).await?;
        peer.install_key_data(key_data).await;
        peer.install_writer(writer).await;

        let registry = self.registry.clone();
        let timer_id = addr;
        peer.set_inactivity_timer(InactivityTimer::start(self.config.timeouts.peer_inactivity, move || {
            tracing::debug!(peer = %timer_id, "peer inactive, destroying");
            registry.destroy(&timer_id);
        }));

        tracing::debug!(peer = %addr, "handshake complete");
        Ok(Some(reader))
    }

    /// Steady-state dispatch loop, spawned once the handshake
    /// completes. Owns the `FrameReader` exclusively. `AesRekey` is
    /// handled inline — it needs the reader for its own sub-exchange,
    /// and inlining it trivially serializes it against every other
    /// inbound frame. Every other message is handed to a freshly
    /// spawned task (tracked on the peer so a slow handler, e.g. a
    /// large file chunk, never blocks this loop from parsing the next
    /// frame.
    async fn peer_read_loop(self: Arc<Self>, peer: Arc<Peer>, mut reader: FrameReader<ReadHalf<Socket>>) {
        loop {
            let frame = match reader.read_frame(None).await {
                Ok(f) => f,
                Err(e) => {
                    tracing::debug!(peer = %peer.id, error = %e, "read loop ending");
                    break;
                }
            };

            let msg = match Message::deserialize(&frame) {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(peer = %peer.id, error = %e, "malformed frame, skipping");
                    continue;
                }
            };

            let msg = match msg {
                Message::Encrypted(env) => {
                    let key_data = peer.key_data.lock().await;
                    let Some(aes_key) = key_data.aes_key().cloned() else {
                        drop(key_data);
                        tracing::warn!(peer = %peer.id, "encrypted frame before key agreement");
                        break;
                    };
                    drop(key_data);
                    match Message::decrypt(&env, &aes_key) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!(peer = %peer.id, error = %e, "decryption failure, terminating peer");
                            break;
                        }
                    }
                }
                other => other,
            };

            peer.reset_inactivity_timer();

            if matches!(msg, Message::AesRekey(_)) {
                if let Err(e) = self.dispatch_rekey(&peer, &mut reader).await {
                    tracing::warn!(peer = %peer.id, error = %e, "rekey failed, terminating peer");
                    break;
                }
                continue;
            }

            let this = self.clone();
            let peer_for_task = peer.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = this.dispatch(&peer_for_task, msg).await {
                    tracing::warn!(peer = %peer_for_task.id, error = %e, "message dispatch failed, terminating peer");
                    this.registry.destroy(&peer_for_task.id);
                }
            });
            peer.track_task(handle);
        }
        self.registry.destroy(&peer.id);
    }

    /// Handles `AesRekey`: exclusive use of the reader, so it's run
    /// inline from `peer_read_loop` rather than spawned. Brackets the
    /// exchange with `begin_rekey`/`finish_rekey` so spawned
    /// message-processing tasks already waiting on `wait_out_rekey`
    /// (inside `dispatch`) don't read `key_data` mid-rotation.
    async fn dispatch_rekey(&self, peer: &Arc<Peer>, reader: &mut FrameReader<ReadHalf<Socket>>) -> Result<()> {
        peer.begin_rekey();
        let result = async {
            let mut writer_slot = peer.writer.lock().await;
            let writer = writer_slot.as_mut().ok_or_else(|| Error::simple(ErrorKind::Session))?;
            let mut key_data = peer.key_data.lock().await;
            hs::rekey(reader, writer, &self.config.timeouts, &mut key_data).await
        }
        .await;
        peer.finish_rekey();
        result
    }

    /// Handles every non-rekey steady-state message. Runs inside a
    /// spawned task off `peer_read_loop`, so it never blocks the next
    /// frame's parsing.
    async fn dispatch(&self, peer: &Arc<Peer>, msg: Message) -> Result<()> {
        match msg {
            Message::RpcRequest(req) => {
                let _ = self.inbound_tx.send((peer.id, req.chan_id, req.payload.bytes)).await;
                Ok(())
            }
            Message::Liveliness(req) => {
                peer.wait_out_rekey().await;
                let reversed: String = req.text.chars().rev().collect();
                let reply = Message::Liveliness(LivelinessMessage { chan_id: req.chan_id, text: reversed });
                let key_data = peer.key_data.lock().await;
                let aes_key = key_data.aes_key().cloned().ok_or_else(|| Error::simple(ErrorKind::Handshake))?;
                drop(key_data);
                let mut writer_slot = peer.writer.lock().await;
                let writer = writer_slot.as_mut().ok_or_else(|| Error::simple(ErrorKind::Session))?;
                handshake::send_encrypted(writer, &reply, &aes_key).await
            }
            Message::FileEntryStream(chunk) => {
                let state = {
                    let mut map = self.file_streams.lock();
                    map.entry(peer.id).or_insert_with(|| Arc::new(FileStreamState::new())).clone()
                };
                state.handle_chunk(&chunk).await
            }
            Message::Pty(data) => {
                let pty = peer.pty.lock().await;
                let pty = pty.as_ref().ok_or_else(|| Error::simple(ErrorKind::Subprotocol))?;
                pty.write(&data.data.bytes)
            }
            Message::PtyResize(resize) => {
                let pty = peer.pty.lock().await;
                let pty = pty.as_ref().ok_or_else(|| Error::simple(ErrorKind::Subprotocol))?;
                pty.resize(resize.rows, resize.cols)
            }
            _ => Err(Error::simple(ErrorKind::Handshake)),
        }
    }
}
