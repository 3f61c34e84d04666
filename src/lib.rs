//! `relaylink`: an encrypted, authenticated, channel-multiplexed
//! point-to-point socket transport.
//!
//! A connection is length-implicit framed BSON documents
//! ([`frame`], [`message`]) carrying a linear handshake
//! ([`handshake`]) that negotiates optional signed-challenge
//! authentication ([`auth`]), optional in-band forwarding to a
//! downstream peer ([`forwarding`]), and RSA-wrapped AES-128-GCM
//! session encryption ([`crypto`]). Once `Ready`, peers exchange
//! multiplexed RPC requests/replies, PTY byte streams, and file
//! chunks ([`subprotocol`]) over one socket. [`server`] accepts and
//! dispatches inbound connections; [`client`] dials out and exposes
//! the same steady-state API from the other side.

pub mod auth;
pub mod client;
pub mod crypto;
pub mod error;
pub mod forwarding;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod server;
pub mod socket;
pub mod subprotocol;
pub mod timeouts;
