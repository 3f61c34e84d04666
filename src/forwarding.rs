//! The relay/splice stage: once a peer asks to be forwarded, the
//! server dials the downstream target and moves bytes verbatim in
//! both directions until either side closes. From this point the
//! server stops parsing frames for that peer entirely (`spec.md`
//! §4.6) — the splice tasks know nothing about the protocol beyond
//! EOF.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::*;

/// Read chunk size used by the splice loops.
const SPLICE_CHUNK: usize = 2048;

/// Dials `(host, port)` with up to `attempts`, each bounded by
/// `per_attempt`, paced so attempts land roughly `per_attempt` apart.
pub async fn dial_with_retry(host: &str, port: u16, per_attempt: Duration, attempts: u32) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    let mut last_err = None;
    for _ in 0..attempts {
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(per_attempt, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(Error::from(e)),
            Err(_) => last_err = Some(Error::simple(ErrorKind::Timeout)),
        }
        let elapsed = started.elapsed();
        if elapsed < per_attempt {
            tokio::time::sleep(per_attempt - elapsed).await;
        }
    }
    Err(last_err.unwrap_or_else(|| Error::simple(ErrorKind::Forwarding)))
}

/// Splices `a` and `b` bidirectionally in `SPLICE_CHUNK`-sized reads
/// until either direction hits EOF or an error, at which point both
/// halves are shut down and the function returns.
pub async fn splice<A, B>(a: A, b: B) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let mut buf = [0u8; SPLICE_CHUNK];
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut a_read, &mut buf).await?;
            if n == 0 {
                let _ = b_write.shutdown().await;
                return Ok::<(), Error>(());
            }
            b_write.write_all(&buf[..n]).await?;
        }
    };

    let b_to_a = async {
        let mut buf = [0u8; SPLICE_CHUNK];
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut b_read, &mut buf).await?;
            if n == 0 {
                let _ = a_write.shutdown().await;
                return Ok::<(), Error>(());
            }
            a_write.write_all(&buf[..n]).await?;
        }
    };

    // Either direction finishing (EOF or error) tears down the whole
    // splice; the other direction is dropped along with its half of
    // the split streams, closing the remaining socket.
    tokio::select! {
        r = a_to_b => r,
        r = b_to_a => r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn test_splice_moves_bytes_both_ways() {
        let (client_a, server_a) = tokio::io::duplex(4096);
        let (client_b, server_b) = tokio::io::duplex(4096);

        let splice_task = tokio::spawn(splice(server_a, server_b));

        let mut client_a = client_a;
        let mut client_b = client_b;
        client_a.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut client_b, &mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client_b.write_all(b"pong").await.unwrap();
        let mut buf2 = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut client_a, &mut buf2).await.unwrap();
        assert_eq!(&buf2, b"pong");

        drop(client_a);
        drop(client_b);
        let _ = splice_task.await;
    }

    #[tokio::test]
    async fn test_dial_with_retry_fails_after_exhausting_attempts() {
        // Port 0 never accepts; this should exhaust all attempts.
        let result = dial_with_retry("127.0.0.1", 0, Duration::from_millis(50), 2).await;
        assert!(result.is_err());
    }
}
