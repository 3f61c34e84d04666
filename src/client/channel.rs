//! The client-side channel pool: every `connect()` call owns one
//! `Channel`, which doubles as both the session's reference count and
//! a request/reply correlation slot an in-flight RPC can borrow.
//!
//! A channel is idle between requests. `acquire_idle` borrows one for
//! the duration of a single round trip and hands back a mailbox the
//! read loop delivers the matching reply into; `release` returns it to
//! the pool regardless of how the round trip ended.

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::*;

struct Channel {
    id: u32,
    in_use: bool,
    reply_tx: Option<oneshot::Sender<Vec<u8>>>,
}

/// Ordered collection of `Channel`s. `len()` is the session's
/// reference count: `client::session::Session` adds one on every
/// `connect()` and removes one on every `disconnect()`, tearing the
/// socket down when the count reaches zero.
#[derive(Default)]
pub struct ChannelManager {
    channels: Mutex<Vec<Channel>>,
    next_id: std::sync::atomic::AtomicU32,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fresh idle channel, returning its id.
    pub fn add(&self) -> u32 {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.channels.lock().push(Channel {
            id,
            in_use: false,
            reply_tx: None,
        });
        id
    }

    /// Removes the first idle channel found, if any, decrementing the
    /// reference count. Returns its id.
    pub fn remove_first_idle(&self) -> Option<u32> {
        let mut channels = self.channels.lock();
        let pos = channels.iter().position(|c| !c.in_use)?;
        Some(channels.remove(pos).id)
    }

    /// Borrows an idle channel for one request, returning its id and a
    /// mailbox the read loop will deliver the reply into. Fails with
    /// `ErrorKind::Channel` if every channel is currently in use, or
    /// none exist (the caller never connected).
    pub fn acquire_idle(&self) -> Result<(u32, oneshot::Receiver<Vec<u8>>)> {
        let mut channels = self.channels.lock();
        let chan = channels
            .iter_mut()
            .find(|c| !c.in_use)
            .ok_or_else(|| Error::simple(ErrorKind::Channel))?;
        let (tx, rx) = oneshot::channel();
        chan.in_use = true;
        chan.reply_tx = Some(tx);
        Ok((chan.id, rx))
    }

    /// Returns a channel to the idle pool. Always called on exit from
    /// a request, success or failure.
    pub fn release(&self, id: u32) {
        let mut channels = self.channels.lock();
        if let Some(chan) = channels.iter_mut().find(|c| c.id == id) {
            chan.in_use = false;
            chan.reply_tx = None;
        }
    }

    /// Routes an inbound `RpcReplyMessage` to the channel it's tagged
    /// with. An id with no waiting channel is a protocol violation
    /// (§7: "unknown channel id in reply" is a hard error).
    pub fn deliver(&self, id: u32, payload: Vec<u8>) -> Result<()> {
        let mut channels = self.channels.lock();
        let chan = channels
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::simple(ErrorKind::Channel))?;
        let tx = chan.reply_tx.take().ok_or_else(|| Error::simple(ErrorKind::Channel))?;
        let _ = tx.send(payload);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear_all(&self) {
        self.channels.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_fails_when_no_channels() {
        let mgr = ChannelManager::new();
        assert!(mgr.acquire_idle().is_err());
    }

    #[test]
    fn test_acquire_release_round_trip() {
        let mgr = ChannelManager::new();
        mgr.add();
        let (id, _rx) = mgr.acquire_idle().unwrap();
        assert!(mgr.acquire_idle().is_err());
        mgr.release(id);
        assert!(mgr.acquire_idle().is_ok());
    }

    #[tokio::test]
    async fn test_deliver_routes_to_matching_channel() {
        let mgr = ChannelManager::new();
        mgr.add();
        mgr.add();
        let (id_a, rx_a) = mgr.acquire_idle().unwrap();
        let (id_b, rx_b) = mgr.acquire_idle().unwrap();
        assert_ne!(id_a, id_b);

        mgr.deliver(id_b, b"for-b".to_vec()).unwrap();
        mgr.deliver(id_a, b"for-a".to_vec()).unwrap();

        assert_eq!(rx_a.await.unwrap(), b"for-a");
        assert_eq!(rx_b.await.unwrap(), b"for-b");
    }

    #[test]
    fn test_ref_count_reaches_zero() {
        let mgr = ChannelManager::new();
        mgr.add();
        mgr.add();
        assert_eq!(mgr.len(), 2);
        mgr.remove_first_idle();
        mgr.remove_first_idle();
        assert!(mgr.is_empty());
    }
}
