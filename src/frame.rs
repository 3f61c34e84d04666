//! Length-implicit framing: every serialized message is followed by a
//! fixed 6-byte separator. The reader accumulates bytes in 64 KiB
//! chunks and splits on every separator it finds, so a single read
//! that happens to return several back-to-back frames (or a read that
//! returns less than one full frame) is both handled by the same
//! loop — there is no separate "fast path" to fall back from, unlike
//! the original asyncio `readuntil(limit=...)` this was distilled
//! from (see DESIGN.md).

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::*;

/// The 6-byte frame separator, part of the wire contract.
pub const SEPARATOR: &[u8; 6] = b"<?!!?>";

/// Chunk size used for each underlying read.
const CHUNK_SIZE: usize = 64 * 1024;

/// Reads length-implicit frames off an `AsyncRead`.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    pending: VecDeque<Vec<u8>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    /// Reads the next complete frame, applying `timeout` to each
    /// underlying read (`None` disables the timeout, used during the
    /// server's handshake per `spec.md` §4.1).
    pub async fn read_frame(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }
            self.fill(timeout).await?;
        }
    }

    async fn fill(&mut self, timeout: Option<Duration>) -> Result<()> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let n = match timeout {
            Some(d) => tokio::time::timeout(d, self.inner.read(&mut chunk))
                .await
                .simple(ErrorKind::Timeout)??,
            None => self.inner.read(&mut chunk).await?,
        };
        if n == 0 {
            return Err(Error::simple(ErrorKind::Communication));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        self.split_pending();
        Ok(())
    }

    /// Splits every complete, separator-terminated frame out of
    /// `self.buf` into `self.pending`; any trailing unterminated
    /// bytes remain in `self.buf` as the next read's prefix.
    /// Reclaims the underlying stream, e.g. to splice it raw once a
    /// peer transitions into forwarding. Any bytes already pulled off
    /// the wire past the last complete frame are discarded; in
    /// practice there are none at a phase boundary, since each phase
    /// reads exactly one frame at a time.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn split_pending(&mut self) {
        loop {
            let Some(pos) = find_separator(&self.buf) else {
                break;
            };
            let rest = self.buf.split_off(pos + SEPARATOR.len());
            let mut frame = std::mem::replace(&mut self.buf, rest);
            frame.truncate(pos);
            self.pending.push_back(frame);
        }
    }
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(SEPARATOR.len()).position(|w| w == SEPARATOR)
}

/// Writes length-implicit frames to an `AsyncWrite`.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one frame (`payload` followed by the separator) and
    /// flushes, so concurrent writers (a reply from the read loop and
    /// the server's outbound `send_reply` API) never interleave a
    /// partial frame.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.inner.write_all(payload).await?;
        self.inner.write_all(SEPARATOR).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_frame_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_frame(b"hello").await.unwrap();
        let frame = reader.read_frame(None).await.unwrap();
        assert_eq!(frame, b"hello");
    }

    #[tokio::test]
    async fn test_multi_separator_split_in_one_read() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(server);

        let mut payload = Vec::new();
        payload.extend_from_slice(b"one");
        payload.extend_from_slice(SEPARATOR);
        payload.extend_from_slice(b"two");
        payload.extend_from_slice(SEPARATOR);
        tokio::io::AsyncWriteExt::write_all(&mut client, &payload)
            .await
            .unwrap();

        let first = reader.read_frame(None).await.unwrap();
        let second = reader.read_frame(None).await.unwrap();
        assert_eq!(first, b"one");
        assert_eq!(second, b"two");
    }

    #[tokio::test]
    async fn test_trailing_unterminated_bytes_are_buffered() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(server);

        tokio::io::AsyncWriteExt::write_all(&mut client, b"partial")
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, SEPARATOR)
            .await
            .unwrap();
        drop(client);

        let frame = reader.read_frame(None).await.unwrap();
        assert_eq!(frame, b"partial");
    }

    #[tokio::test]
    async fn test_large_frame_spanning_many_chunks() {
        let (mut client, server) = tokio::io::duplex(1 << 20);
        let mut reader = FrameReader::new(server);

        let big = vec![0x42u8; CHUNK_SIZE * 3 + 17];
        let writer_task = tokio::spawn(async move {
            tokio::io::AsyncWriteExt::write_all(&mut client, &big)
                .await
                .unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut client, SEPARATOR)
                .await
                .unwrap();
            big
        });

        let frame = reader.read_frame(None).await.unwrap();
        let big = writer_task.await.unwrap();
        assert_eq!(frame, big);
    }
}
