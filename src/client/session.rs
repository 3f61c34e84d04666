//! The reference-counted session handle applications actually hold:
//! `connect`/`disconnect` nest safely (the underlying socket dials
//! once and tears down once the last reference drops), and
//! `ensure_connected` folds in the liveness probe so a caller never
//! has to poll `is_connected` itself. `connect_guarded` offers the
//! same thing as a scope guard for callers who'd rather not pair
//! `connect`/`disconnect` by hand.
//!
//! Mirrors `server::registry::Registry`'s "mutate only under a lock
//! that can't be held across an await" discipline one level up: here
//! the invariant is enforced by `Client`'s own internal locking, and
//! `Session` just sequences calls into it.

use std::sync::Arc;

use crate::handshake::FailedOn;
use crate::timeouts::Timeouts;

use super::{Client, ClientConfig};

/// A lazily-connecting handle to one peer. Cloning a `Session` does
/// not share reference counts — each `Session` is its own caller;
/// share the `Arc<Client>` directly if multiple owners should count
/// as one connection.
pub struct Session {
    client: Arc<Client>,
    connected: std::sync::atomic::AtomicBool,
}

impl Session {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            client: Client::new(config),
            connected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Connects (dialing if necessary) and adds this session's
    /// reference. Safe to call repeatedly; only the first caller pays
    /// for the handshake.
    pub async fn connect(&self) -> std::result::Result<(), FailedOn> {
        self.client.connect().await?;
        self.connected.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    /// Releases this session's reference, tearing the socket down if
    /// it was the last one.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, std::sync::atomic::Ordering::SeqCst) {
            self.client.disconnect().await;
        }
    }

    /// Connects and returns a guard that releases this reference on
    /// `Drop`, so a panic or early return from the caller's scope can't
    /// leak it the way a bare `connect()`/`disconnect()` pair can.
    /// Independent of the manual `connect`/`disconnect` API: don't mix
    /// the two on the same `Session`.
    pub async fn connect_guarded(&self) -> std::result::Result<SessionGuard, FailedOn> {
        self.client.connect().await?;
        Ok(SessionGuard { client: self.client.clone() })
    }

    /// Blocks until the connection is confirmed writeable (a
    /// successful liveness round trip), reconnecting as needed. Under
    /// a continuously failing dial this never returns, but backs off
    /// by `timeouts.liveness_backoff` between attempts instead of
    /// busy-looping.
    pub async fn ensure_connected(&self, timeouts: &Timeouts) {
        loop {
            if self.client.is_connected().await && self.client.writeable().await {
                return;
            }
            self.client.disconnect().await;
            self.connected.store(false, std::sync::atomic::Ordering::SeqCst);
            match self.connect().await {
                Ok(()) => {
                    if self.client.writeable().await {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(?e, "ensure_connected: dial failed, backing off");
                }
            }
            tokio::time::sleep(timeouts.liveness_backoff).await;
        }
    }
}

/// An RAII connection scope returned by `connect_guarded`: releases its
/// reference when dropped instead of requiring a matching `disconnect`
/// call. `Drop` can't await, so the release is a detached `tokio::spawn`
/// rather than an inline call — fire-and-forget, same as the teardown
/// path already takes when a peer's read loop ends on its own.
pub struct SessionGuard {
    client: Arc<Client>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let client = self.client.clone();
        tokio::spawn(async move {
            client.disconnect().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_starts_disconnected() {
        let session = Session::new(ClientConfig::new("127.0.0.1:1"));
        assert!(!session.client().is_connected().await);
    }

    #[tokio::test]
    async fn test_session_guard_drop_does_not_panic() {
        let session = Session::new(ClientConfig::new("127.0.0.1:1"));
        let guard = SessionGuard { client: session.client().clone() };
        drop(guard);
        tokio::task::yield_now().await;
    }
}
