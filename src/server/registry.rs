//! The server-side peer registry: an address-keyed set of connected
//! peers, each with its own inactivity timer and set of cancellable
//! background tasks.
//!
//! Per `spec.md` §5 ("the peer registry ... is mutated only from the
//! reactor task"), mutation is guarded by a `parking_lot::Mutex`
//! rather than routed through a single-consumer control channel: a
//! `parking_lot::MutexGuard` is `!Send`, so the compiler itself
//! refuses any attempt to hold the lock across an `.await` point,
//! which is the property the control-channel design in the spec was
//! actually after. See `DESIGN.md` for the full rationale.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::WriteHalf;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::crypto::KeyData;
use crate::frame::FrameWriter;
use crate::socket::Socket;
use crate::subprotocol::pty::AttachedPty;

/// A scheduled-destruction timer that can be reset (on phase
/// progress) or cancelled (on peer teardown).
pub struct InactivityTimer {
    reset_tx: watch::Sender<()>,
    handle: JoinHandle<()>,
}

impl InactivityTimer {
    pub fn start<F>(duration: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (reset_tx, mut reset_rx) = watch::channel(());
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        on_expire();
                        return;
                    }
                    changed = reset_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Self { reset_tx, handle }
    }

    pub fn reset(&self) {
        let _ = self.reset_tx.send(());
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A connected peer's shared, long-lived state. The `FrameReader`
/// half is not stored here: it's owned exclusively by the peer's read
/// loop task, since only that task ever reads from the socket.
pub struct Peer {
    pub id: SocketAddr,
    pub key_data: AsyncMutex<KeyData>,
    pub encrypted: AtomicBool,
    pub authenticated: AtomicBool,
    pub proxied: AtomicBool,
    /// `None` until the handshake reaches `Ready` (a proxied peer
    /// never gets one — it's spliced raw and removed from the
    /// registry instead).
    pub writer: AsyncMutex<Option<FrameWriter<WriteHalf<Socket>>>>,
    /// The PTY attached to this peer, if any (`subprotocol::pty`).
    /// Unattached peers reject `Pty`/`PtyResize` traffic outright.
    pub pty: AsyncMutex<Option<Arc<AttachedPty>>>,
    pub(crate) read_loop: Mutex<Option<JoinHandle<()>>>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) inactivity: Mutex<Option<InactivityTimer>>,
    /// Set while a rekey is in flight; spawned message-processing
    /// tasks that need the session key wait on `rekey_done` instead of
    /// racing the reactor's inline rekey handling.
    pub(crate) rekeying: AtomicBool,
    pub(crate) rekey_done: Notify,
}

impl Peer {
    /// Created at accept time, before the handshake starts: key
    /// material and the authenticated/encrypted flags are filled in
    /// as the handshake phases complete.
    pub fn new(id: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id,
            key_data: AsyncMutex::new(KeyData::new()),
            encrypted: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            proxied: AtomicBool::new(false),
            writer: AsyncMutex::new(None),
            pty: AsyncMutex::new(None),
            read_loop: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            inactivity: Mutex::new(None),
            rekeying: AtomicBool::new(false),
            rekey_done: Notify::new(),
        })
    }

    /// Parks the caller until any in-flight rekey finishes. A
    /// spawned message-processing task calls this before touching
    /// `key_data` so it can't read a key mid-rotation and send under
    /// the stale one after the peer has already switched.
    pub async fn wait_out_rekey(&self) {
        loop {
            let notified = self.rekey_done.notified();
            if !self.rekeying.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Marks a rekey as starting; paired with `finish_rekey`.
    pub fn begin_rekey(&self) {
        self.rekeying.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Marks a rekey as finished and wakes everything parked in
    /// `wait_out_rekey`.
    pub fn finish_rekey(&self) {
        self.rekeying.store(false, std::sync::atomic::Ordering::SeqCst);
        self.rekey_done.notify_waiters();
    }

    pub async fn install_key_data(&self, key_data: KeyData) {
        *self.key_data.lock().await = key_data;
        self.encrypted.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn install_writer(&self, writer: FrameWriter<WriteHalf<Socket>>) {
        *self.writer.lock().await = Some(writer);
    }

    pub async fn attach_pty(&self, pty: Arc<AttachedPty>) {
        *self.pty.lock().await = Some(pty);
    }

    pub fn set_read_loop(&self, handle: JoinHandle<()>) {
        *self.read_loop.lock() = Some(handle);
    }

    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub fn set_inactivity_timer(&self, timer: InactivityTimer) {
        *self.inactivity.lock() = Some(timer);
    }

    pub fn clear_inactivity_timer(&self) {
        self.inactivity.lock().take();
    }

    /// Resets the inactivity timer if one is running; a no-op before
    /// the handshake installs it.
    pub fn reset_inactivity_timer(&self) {
        if let Some(timer) = self.inactivity.lock().as_ref() {
            timer.reset();
        }
    }

    fn cancel_tasks(&self) {
        if let Some(h) = self.read_loop.lock().take() {
            h.abort();
        }
        for h in self.tasks.lock().drain(..) {
            h.abort();
        }
        self.clear_inactivity_timer();
        self.finish_rekey();
    }
}

/// The set of connected peers.
#[derive(Default)]
pub struct Registry {
    peers: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: Arc<Peer>) {
        self.peers.lock().insert(peer.id, peer);
    }

    pub fn lookup(&self, id: &SocketAddr) -> Option<Arc<Peer>> {
        self.peers.lock().get(id).cloned()
    }

    /// Cancels the peer's read loop and in-flight tasks, clears its
    /// inactivity timer, and drops its registry entry. The writer is
    /// closed when the last `Arc<Peer>` reference is dropped.
    pub fn destroy(&self, id: &SocketAddr) {
        let peer = self.peers.lock().remove(id);
        if let Some(peer) = peer {
            peer.cancel_tasks();
        }
    }

    pub fn destroy_all(&self) {
        let ids: Vec<SocketAddr> = self.peers.lock().keys().copied().collect();
        for id in ids {
            self.destroy(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
