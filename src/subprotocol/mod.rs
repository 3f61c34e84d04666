//! Sub-protocols layered on top of the encrypted channel: PTY byte
//! shuttling and file-chunk streaming. Both are dispatched from a
//! peer's steady-state read loop once the handshake reaches `Ready`.

pub mod file_stream;
pub mod pty;
