//! PTY byte shuttling: inbound `PtyMessage`/`PtyResizeMessage` are
//! applied to the attached pseudo-terminal; a producer task streams
//! the PTY's output back as encrypted `PtyMessage`s and emits
//! `PtyClosedMessage` when the child exits.
//!
//! Spawning the child process itself is the caller's job (`spec.md`
//! §1 excludes PTY process management beyond byte shuttling); this
//! module only needs a `MasterPty` + child handle to attach to.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{Child, MasterPty, PtySize};
use tokio::sync::mpsc;

use crate::crypto::aes::AesKey;
use crate::error::*;
use crate::handshake::send_encrypted;
use crate::message::{Message, PtyClosedMessage, PtyMessage};
use crate::server::registry::Peer;

/// Bytes read per producer iteration, matching the supplemented
/// behavior recovered from `aiotinyrpc`/`fluxrpc`'s PTY producer.
const READ_CHUNK: usize = 20 * 1024;
/// Poll interval between non-blocking PTY reads.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn bin(bytes: Vec<u8>) -> bson::Binary {
    bson::Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes,
    }
}

/// The PTY attached to a peer: a writable master handle plus the
/// child process, so the producer loop can detect the child exiting.
pub struct AttachedPty {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

impl AttachedPty {
    pub fn new(
        master: Box<dyn MasterPty + Send>,
        writer: Box<dyn Write + Send>,
        child: Box<dyn Child + Send + Sync>,
    ) -> Self {
        Self {
            writer: Mutex::new(writer),
            master: Mutex::new(master),
            child: Mutex::new(child),
        }
    }

    /// Handles an inbound `PtyMessage`: writes its bytes to the PTY.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.writer.lock().write_all(data).wrapped(ErrorKind::Subprotocol)
    }

    /// Handles an inbound `PtyResizeMessage`.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .wrapped(ErrorKind::Subprotocol)
    }

    fn exit_reason(&self) -> String {
        match self.child.lock().try_wait() {
            Ok(Some(status)) => format!("exited: {status:?}"),
            Ok(None) => "closed".to_string(),
            Err(e) => format!("wait error: {e}"),
        }
    }
}

/// Runs the PTY producer loop: reads output in `READ_CHUNK`-sized
/// pieces, sends each as an encrypted `PtyMessage`, and on EOF emits
/// `PtyClosedMessage` with the child's exit status as `reason`.
///
/// The PTY reader is a blocking `std::io::Read`; reads happen on a
/// dedicated blocking thread and are forwarded to this async loop
/// over an mpsc channel, so the reactor never blocks on PTY I/O.
/// Sends go through the peer's own writer slot, the same one
/// `dispatch` uses for replies, so producer output and reply traffic
/// interleave correctly on the wire.
pub async fn run_producer(pty: Arc<AttachedPty>, peer: Arc<Peer>, aes_key: AesKey) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
    let reader_pty = pty.clone();
    let mut reader = reader_pty
        .master
        .lock()
        .try_clone_reader()
        .wrapped(ErrorKind::Subprotocol)?;

    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.blocking_send(Vec::new());
                    return;
                }
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        return;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(_) => {
                    let _ = tx.blocking_send(Vec::new());
                    return;
                }
            }
        }
    });

    while let Some(chunk) = rx.recv().await {
        let mut writer_slot = peer.writer.lock().await;
        let w = writer_slot.as_mut().ok_or_else(|| Error::simple(ErrorKind::Session))?;
        if chunk.is_empty() {
            let closed = Message::PtyClosed(PtyClosedMessage { reason: pty.exit_reason() });
            send_encrypted(w, &closed, &aes_key).await?;
            return Ok(());
        }
        let msg = Message::Pty(PtyMessage { data: bin(chunk) });
        send_encrypted(w, &msg, &aes_key).await?;
    }
    Ok(())
}
