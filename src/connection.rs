//! The engine's socket connection.
//!
//! Reads are never awaited directly: the session waits for readiness, then
//! drains whatever the kernel holds without blocking. The same drain runs from
//! the session's timer so that no input is left sitting in the socket if a
//! readiness notification is missed.

use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{Result, SessionError};

const READ_CHUNK: usize = 4096;

/// Bytes collected by one drain
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drained {
    pub data: Vec<u8>,
    /// The peer closed the connection
    pub closed: bool,
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    closed: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not disable Nagle on engine socket: {}", e);
        }
        Self {
            stream,
            peer,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wait until the socket has data (or EOF) to read
    pub async fn readable(&self) -> Result<()> {
        self.stream.readable().await.map_err(SessionError::Io)
    }

    /// Read everything available right now without blocking
    pub fn try_drain(&mut self) -> Result<Drained> {
        let mut drained = Drained::default();
        if self.closed {
            drained.closed = true;
            return Ok(drained);
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    debug!(peer = %self.peer, "engine closed the connection");
                    self.closed = true;
                    drained.closed = true;
                    break;
                }
                Ok(n) => drained.data.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.closed = true;
                    return Err(SessionError::Io(e));
                }
            }
        }
        if !drained.data.is_empty() {
            trace!(len = drained.data.len(), "drained engine socket");
        }
        Ok(drained)
    }

    /// Send a command to the engine
    pub async fn write_command(&mut self, text: &str) -> Result<()> {
        if self.closed {
            return Err(SessionError::NotConnected);
        }
        trace!(len = text.len(), "writing to engine");
        let written = match self.stream.write_all(text.as_bytes()).await {
            Ok(()) => self.stream.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.closed = true;
            return Err(SessionError::Io(e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Connection::new(server, peer), client)
    }

    #[tokio::test]
    async fn test_drain_collects_available_bytes() {
        let (mut conn, mut engine) = pair().await;
        engine.write_all(b"<mth>1</mth>").await.unwrap();
        engine.flush().await.unwrap();

        conn.readable().await.unwrap();
        let mut collected = Vec::new();
        while collected.len() < 12 {
            let drained = conn.try_drain().unwrap();
            assert!(!drained.closed);
            collected.extend(drained.data);
            if collected.len() < 12 {
                conn.readable().await.unwrap();
            }
        }
        assert_eq!(collected, b"<mth>1</mth>");
        assert_eq!(conn.try_drain().unwrap(), Drained::default());
    }

    #[tokio::test]
    async fn test_write_command_and_close() {
        let (mut conn, mut engine) = pair().await;
        conn.write_command("1+1;\n").await.unwrap();
        let mut buf = [0u8; 5];
        engine.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"1+1;\n");

        drop(engine);
        loop {
            conn.readable().await.unwrap();
            if conn.try_drain().unwrap().closed {
                break;
            }
        }
        assert!(conn.is_closed());
        assert!(matches!(
            conn.write_command("2;\n").await,
            Err(SessionError::NotConnected)
        ));
    }
}
