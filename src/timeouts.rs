//! Every duration named in the concurrency model (`spec.md` §5),
//! collected into one configurable struct instead of scattered
//! magic numbers.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Server inactivity timer between handshake phases.
    pub server_phase: Duration,
    /// Anti-probe sleep before closing a source-IP-rejected connection.
    pub source_gate_reject: Duration,
    /// Client per-phase handshake wait (challenge, auth, forwarding, encryption).
    pub client_phase: Duration,
    /// Client dial attempt timeout.
    pub client_dial: Duration,
    /// Number of client dial attempts.
    pub client_dial_attempts: u32,
    /// Server forwarding dial attempt timeout.
    pub forwarding_dial: Duration,
    /// Number of server forwarding dial attempts.
    pub forwarding_dial_attempts: u32,
    /// Client RPC reply wait.
    pub rpc_reply: Duration,
    /// Liveness probe reply wait.
    pub liveness: Duration,
    /// Liveness reconnect back-off.
    pub liveness_backoff: Duration,
    /// Client steady-state per-read timeout.
    pub client_read: Duration,
    /// Server-side steady-state peer inactivity timer: reset on every
    /// inbound frame, destroys the peer on expiry.
    pub peer_inactivity: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            server_phase: Duration::from_secs(10),
            source_gate_reject: Duration::from_secs(3),
            client_phase: Duration::from_secs(10),
            client_dial: Duration::from_secs(3),
            client_dial_attempts: 3,
            forwarding_dial: Duration::from_secs(1),
            forwarding_dial_attempts: 3,
            rpc_reply: Duration::from_secs(45),
            liveness: Duration::from_secs(3),
            liveness_backoff: Duration::from_secs(30),
            client_read: Duration::from_secs(60),
            peer_inactivity: Duration::from_secs(300),
        }
    }
}

/// Incremental back-off applied between client dial attempts: 0s,
/// 1s, 2s, ... (attempt index is 0-based).
pub fn dial_backoff(attempt: u32) -> Duration {
    Duration::from_secs(attempt as u64)
}
