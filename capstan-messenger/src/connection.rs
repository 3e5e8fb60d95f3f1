//! Duplex connection abstraction
//!
//! The messenger is transport-agnostic: it sends and receives opaque frames
//! through this trait. `TcpConnection` frames messages as single lines of
//! JSON over a TCP stream; `pair()` builds an in-memory connection pair for
//! tests.

use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};

use crate::error::{MessengerError, Result};

/// An abstract duplex byte-frame connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one frame; the frame must not contain a newline
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Receive the next frame; `None` means the peer closed
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Close the connection; subsequent sends fail, pending recvs drain
    async fn close(&self);
}

/// Newline-delimited frames over a TCP stream
pub struct TcpConnection {
    reader: Mutex<tokio::io::Lines<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Mutex::new(BufReader::new(read_half).lines()),
            writer: Mutex::new(Some(write_half)),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(MessengerError::ConnectionClosed)?;
        writer.write_all(frame).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let line = reader.next_line().await?;
        Ok(line.map(String::into_bytes))
    }

    async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// In-memory connection; `pair()` returns both ends
pub struct MemoryConnection {
    tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Builds two connected in-memory endpoints. Frames written to one end are
/// read from the other. Used by tests across the workspace.
pub fn pair() -> (MemoryConnection, MemoryConnection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryConnection {
            tx: StdMutex::new(Some(a_tx)),
            rx: Mutex::new(b_rx),
        },
        MemoryConnection {
            tx: StdMutex::new(Some(b_tx)),
            rx: Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        let guard = self.tx.lock().unwrap();
        let tx = guard.as_ref().ok_or(MessengerError::ConnectionClosed)?;
        tx.send(frame.to_vec())
            .map_err(|_| MessengerError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_delivers_frames() {
        let (left, right) = pair();
        left.send(b"hello").await.unwrap();
        let frame = right.recv().await.unwrap();
        assert_eq!(frame.as_deref(), Some(b"hello".as_ref()));
    }

    #[tokio::test]
    async fn test_memory_close_ends_peer_stream() {
        let (left, right) = pair();
        left.close().await;
        assert!(right.recv().await.unwrap().is_none());
        assert!(left.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_connection_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let connection = TcpConnection::new(stream);
            let frame = connection.recv().await.unwrap().unwrap();
            connection.send(&frame).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let connection = TcpConnection::new(stream);
        connection.send(br#"{"x":1}"#).await.unwrap();
        let echoed = connection.recv().await.unwrap().unwrap();
        assert_eq!(echoed, br#"{"x":1}"#);

        server.await.unwrap();
    }
}
