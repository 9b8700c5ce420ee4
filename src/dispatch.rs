//! Upstream dispatch seam.
//!
//! The host resolves a destination to a [`Link`]: a pair of buffer queues
//! carrying bytes to and from the upstream. [`TcpDispatcher`] is the plain
//! TCP implementation used by the server binary and scenario tests; hosts
//! with routing logic provide their own [`Dispatcher`].

use std::fmt;
use std::future::Future;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Queue depth of each link direction.
const LINK_QUEUE_DEPTH: usize = 64;

/// Read buffer size for the TCP pump.
const READ_BUFFER_SIZE: usize = 8192;

/// A TCP destination requested by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Hostname or IP address.
    pub addr: String,
    /// TCP port.
    pub port: u16,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// A bidirectional pipe to an upstream destination.
///
/// `reader` yields buffers read from the upstream; a read error travels
/// in-band and closing the queue signals EOF. Dropping `writer` closes the
/// upstream write side.
pub struct Link {
    /// Upstream-to-session buffers.
    pub reader: mpsc::Receiver<io::Result<Vec<u8>>>,
    /// Session-to-upstream buffers.
    pub writer: mpsc::Sender<Vec<u8>>,
}

impl Link {
    /// Create a link backed by in-process queues, returning the link and
    /// the host-side endpoints feeding it.
    pub fn pair() -> (Self, mpsc::Sender<io::Result<Vec<u8>>>, mpsc::Receiver<Vec<u8>>) {
        let (up_tx, up_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        let (down_tx, down_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        (
            Self {
                reader: up_rx,
                writer: down_tx,
            },
            up_tx,
            down_rx,
        )
    }
}

/// Resolves a destination and returns a bidirectional upstream link.
pub trait Dispatcher: Send + Sync {
    /// Open a link to `dest`.
    fn dispatch(&self, dest: Destination) -> impl Future<Output = Result<Link>> + Send;
}

/// Dispatcher that dials destinations directly over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDispatcher;

impl Dispatcher for TcpDispatcher {
    fn dispatch(&self, dest: Destination) -> impl Future<Output = Result<Link>> + Send {
        async move {
            let stream = TcpStream::connect((dest.addr.as_str(), dest.port))
                .await
                .map_err(|e| Error::dispatch(format!("dial {dest}: {e}")))?;
            let (mut read_half, mut write_half) = stream.into_split();
            let (link, up_tx, mut down_rx) = Link::pair();

            // Upstream socket to link
            tokio::spawn(async move {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                loop {
                    match read_half.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if up_tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = up_tx.send(Err(e)).await;
                            break;
                        }
                    }
                }
            });

            // Link to upstream socket
            tokio::spawn(async move {
                while let Some(data) = down_rx.recv().await {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                let _ = write_half.shutdown().await;
            });

            Ok(link)
        }
    }
}
