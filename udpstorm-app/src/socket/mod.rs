//! Batched datagram I/O.
//!
//! [`BatchSocket`] is the seam between the traffic engines and the OS. Two
//! realizations exist:
//! - [`UdpBatchSocket`]: non-blocking IPv4 UDP socket using `recvmmsg` /
//!   `sendmmsg` on Linux and a per-message loop elsewhere.
//! - [`MemorySocket`]: in-memory double serving preloaded datagrams and
//!   capturing everything sent.
//!
//! Counts returned by the batch calls are messages, never bytes. A socket
//! with nothing pending returns `Ok(0)`; only real failures are `Err`.

mod memory;
mod udp;

use std::io;
use std::net::SocketAddrV4;

pub use memory::{MemorySocket, SentDatagram};
#[cfg(test)]
pub(crate) use memory::ShortSendSocket;
pub use udp::UdpBatchSocket;

/// Socket buffer size requested by both engines. Advisory only.
pub const DEFAULT_SOCKET_BUFFER: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("failed to create UDP socket")]
    Create(#[source] io::Error),
    #[error("failed to bind UDP port {port}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("could not resolve {addr} to an IPv4 address")]
    Resolve { addr: String },
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("no destination given and socket is not connected")]
    NotConnected,
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Per-datagram result of [`BatchSocket::recv_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvMeta {
    /// Bytes written into the matching buffer, after truncation.
    pub len: usize,
    /// Sender address, when the receive path exposes it.
    pub source: Option<SocketAddrV4>,
}

/// Batched datagram socket.
///
/// Data-path calls take `&mut self`: one thread owns a socket at a time.
pub trait BatchSocket: Send {
    /// Bind to `0.0.0.0:port`. `reuse` asks for `SO_REUSEPORT` where supported.
    fn bind(&mut self, port: u16, reuse: bool) -> Result<(), SocketError>;

    /// Fix a default peer for sends that pass no destination.
    fn connect(&mut self, addr: &str, port: u16) -> Result<(), SocketError>;

    /// Fill up to `min(bufs.len(), meta.len())` buffers from pending
    /// datagrams. Datagrams longer than their buffer are truncated. Returns
    /// the number filled; `meta[..n]` describes them.
    fn recv_batch(
        &mut self,
        bufs: &mut [Vec<u8>],
        meta: &mut [RecvMeta],
    ) -> Result<usize, SocketError>;

    /// Send every buffer to `dest`, or to the connected peer when `dest` is
    /// `None`. A connected socket ignores `dest`. Partial counts are normal.
    fn send_batch<B: AsRef<[u8]>>(
        &mut self,
        bufs: &[B],
        dest: Option<SocketAddrV4>,
    ) -> Result<usize, SocketError>;

    /// Send each payload to its own destination in one batch.
    fn send_batch_to(&mut self, msgs: &[(&[u8], SocketAddrV4)]) -> Result<usize, SocketError>;

    fn set_rcvbuf(&mut self, _bytes: usize) {}

    fn set_sndbuf(&mut self, _bytes: usize) {}
}
