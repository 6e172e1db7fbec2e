//! TCP transport: bounded-retry connect, buffered frame extraction.
//!
//! A connected stream is split into a [`FrameWriter`] (held under the
//! connection lock and shared by every sender) and a [`FrameReader`]
//! (owned by the receiver loop).

use std::time::Duration;

use telelink_core::{decode_frame, Frame};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time,
};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;

/// Socket-level failures.  Recoverable: the watchdog reconnects.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to {addr} after {attempts} attempt(s): {source}")]
    ConnectFailed {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("connection closed by peer")]
    Closed,
}

/// Connect retry policy.
#[derive(Debug, Clone, Copy)]
pub struct ConnectPolicy {
    pub attempts: u32,
    /// Wait before attempt `n` is `backoff * n`.
    pub backoff: Duration,
    pub attempt_timeout: Duration,
}

/// Opens a TCP connection to `addr`, retrying with linear backoff.
///
/// # Errors
///
/// Returns [`TransportError::ConnectFailed`] with the last error once every
/// attempt has failed.
pub async fn open(
    addr: &str,
    policy: ConnectPolicy,
) -> Result<(FrameWriter, FrameReader), TransportError> {
    let attempts = policy.attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            time::sleep(policy.backoff * (attempt - 1)).await;
        }
        let result = match time::timeout(policy.attempt_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        };
        match result {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                info!(addr, attempt, "transport connected");
                let (read_half, write_half) = stream.into_split();
                return Ok((
                    FrameWriter { half: write_half },
                    FrameReader {
                        half: read_half,
                        buffer: Vec::new(),
                    },
                ));
            }
            Err(e) => {
                warn!(addr, attempt, attempts, "connect failed: {e}");
                last_err = Some(e);
            }
        }
    }

    Err(TransportError::ConnectFailed {
        addr: addr.to_string(),
        attempts,
        source: last_err.unwrap_or_else(|| std::io::Error::other("no connect attempt made")),
    })
}

/// Write side of a connection.
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    /// Writes one encoded frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::WriteTimeout`] if the peer stops draining
    /// the socket, or [`TransportError::Io`].
    pub async fn write_frame(&mut self, bytes: &[u8], limit: Duration) -> Result<(), TransportError> {
        match time::timeout(limit, self.half.write_all(bytes)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::WriteTimeout(limit)),
        }
    }

    /// Half-closes the stream.  Errors are irrelevant at this point.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.half.shutdown().await {
            debug!("transport shutdown: {e}");
        }
    }
}

/// Read side of a connection with its reassembly buffer.
pub struct FrameReader {
    half: OwnedReadHalf,
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Waits up to `poll_interval` for bytes and returns every frame that is
    /// now complete.  An empty vector means nothing complete arrived yet.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] on EOF or [`TransportError::Io`].
    pub async fn poll(&mut self, poll_interval: Duration) -> Result<Vec<Frame>, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        match time::timeout(poll_interval, self.half.read(&mut chunk)).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(TransportError::Closed),
            Ok(Ok(n)) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                Ok(drain_frames(&mut self.buffer))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

/// Removes every complete frame from the front of `buffer`, leaving any
/// partial frame in place for the next read.
pub fn drain_frames(buffer: &mut Vec<u8>) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut consumed = 0;
    while let Some((frame, used)) = decode_frame(&buffer[consumed..]) {
        frames.push(frame);
        consumed += used;
    }
    buffer.drain(..consumed);
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use telelink_core::{encode_frame, MessageType};
    use tokio::net::TcpListener;

    const SERIAL: &[u8; 16] = b"TL-TRANSPORT-001";

    fn encoded(tid: u16) -> Vec<u8> {
        let frame = Frame::new(SERIAL, tid, MessageType::DataRequest, [1; 8], vec![9; 16]).unwrap();
        encode_frame(&frame).unwrap()
    }

    fn policy(attempts: u32) -> ConnectPolicy {
        ConnectPolicy {
            attempts,
            backoff: Duration::from_millis(10),
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_drain_frames_keeps_partial_tail() {
        // Arrange – one full frame plus the first 10 bytes of another
        let mut buffer = encoded(1);
        let second = encoded(2);
        buffer.extend_from_slice(&second[..10]);

        // Act
        let frames = drain_frames(&mut buffer);

        // Assert
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].transaction_id, 1);
        assert_eq!(buffer, second[..10].to_vec());

        // Completing the tail yields the second frame exactly once.
        buffer.extend_from_slice(&second[10..]);
        let frames = drain_frames(&mut buffer);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].transaction_id, 2);
        assert!(buffer.is_empty());
        assert!(drain_frames(&mut buffer).is_empty());
    }

    #[tokio::test]
    async fn test_open_fails_after_bounded_attempts() {
        // Arrange – grab a free port, then close the listener so nothing answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        // Act
        let result = open(&addr, policy(2)).await;

        // Assert
        match result {
            Err(TransportError::ConnectFailed { attempts, .. }) => assert_eq!(attempts, 2),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connect must fail"),
        }
    }

    #[tokio::test]
    async fn test_reader_reassembles_split_writes() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let bytes = encoded(77);
            sock.write_all(&bytes[..5]).await.unwrap();
            sock.flush().await.unwrap();
            time::sleep(Duration::from_millis(30)).await;
            sock.write_all(&bytes[5..]).await.unwrap();
            time::sleep(Duration::from_millis(100)).await;
        });
        let (_writer, mut reader) = open(&addr, policy(1)).await.unwrap();

        // Act – poll until the frame is complete
        let mut frames = Vec::new();
        for _ in 0..50 {
            frames.extend(reader.poll(Duration::from_millis(20)).await.unwrap());
            if !frames.is_empty() {
                break;
            }
        }

        // Assert
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].transaction_id, 77);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_reports_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });
        let (_writer, mut reader) = open(&addr, policy(1)).await.unwrap();
        server.await.unwrap();

        let mut outcome = Ok(Vec::new());
        for _ in 0..50 {
            outcome = reader.poll(Duration::from_millis(20)).await;
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(outcome, Err(TransportError::Closed)));
    }
}
