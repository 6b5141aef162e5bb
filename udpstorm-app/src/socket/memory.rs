use std::collections::VecDeque;
use std::io;
use std::net::SocketAddrV4;

use super::{BatchSocket, RecvMeta, SocketError};

/// A datagram captured by [`MemorySocket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub payload: Vec<u8>,
    pub dest: Option<SocketAddrV4>,
}

#[derive(Debug, Clone)]
struct Inbound {
    payload: Vec<u8>,
    source: Option<SocketAddrV4>,
}

/// In-memory [`BatchSocket`] for deterministic tests.
///
/// Receives are served cursor-wise from a preloaded queue and return `0`
/// once it is drained. Every send succeeds in full and is recorded.
/// Datagrams loaded with [`MemorySocket::preload`] carry no source address,
/// which puts the receiver into degraded mode for them.
#[derive(Debug, Default)]
pub struct MemorySocket {
    inbound: Vec<Inbound>,
    cursor: usize,
    sent: Vec<SentDatagram>,
    bound: Option<(u16, bool)>,
    peer: Option<(String, u16)>,
    pending_errors: VecDeque<io::ErrorKind>,
    rcvbuf: Option<usize>,
    sndbuf: Option<usize>,
}

impl MemorySocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a datagram with no known sender.
    pub fn preload(&mut self, datagram: impl Into<Vec<u8>>) {
        self.inbound.push(Inbound {
            payload: datagram.into(),
            source: None,
        });
    }

    /// Queue a datagram reported as coming from `source`.
    pub fn preload_from(&mut self, datagram: impl Into<Vec<u8>>, source: SocketAddrV4) {
        self.inbound.push(Inbound {
            payload: datagram.into(),
            source: Some(source),
        });
    }

    /// Make the next receive call fail with `kind` instead of serving data.
    pub fn fail_next_recv(&mut self, kind: io::ErrorKind) {
        self.pending_errors.push_back(kind);
    }

    pub fn sent(&self) -> &[SentDatagram] {
        &self.sent
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    /// Preloaded datagrams not yet handed out.
    pub fn pending(&self) -> usize {
        self.inbound.len() - self.cursor
    }

    pub fn bound(&self) -> Option<(u16, bool)> {
        self.bound
    }

    pub fn peer(&self) -> Option<(&str, u16)> {
        self.peer.as_ref().map(|(addr, port)| (addr.as_str(), *port))
    }

    pub fn buffer_sizes(&self) -> (Option<usize>, Option<usize>) {
        (self.rcvbuf, self.sndbuf)
    }
}

impl BatchSocket for MemorySocket {
    fn bind(&mut self, port: u16, reuse: bool) -> Result<(), SocketError> {
        self.bound = Some((port, reuse));
        Ok(())
    }

    fn connect(&mut self, addr: &str, port: u16) -> Result<(), SocketError> {
        self.peer = Some((addr.to_owned(), port));
        Ok(())
    }

    fn recv_batch(
        &mut self,
        bufs: &mut [Vec<u8>],
        meta: &mut [RecvMeta],
    ) -> Result<usize, SocketError> {
        if let Some(kind) = self.pending_errors.pop_front() {
            return Err(io::Error::from(kind).into());
        }

        let mut filled = 0;
        for (buf, slot) in bufs.iter_mut().zip(meta.iter_mut()) {
            let Some(src) = self.inbound.get(self.cursor) else {
                break;
            };
            let n = buf.len().min(src.payload.len());
            buf[..n].copy_from_slice(&src.payload[..n]);
            *slot = RecvMeta {
                len: n,
                source: src.source,
            };
            self.cursor += 1;
            filled += 1;
        }
        Ok(filled)
    }

    fn send_batch<B: AsRef<[u8]>>(
        &mut self,
        bufs: &[B],
        dest: Option<SocketAddrV4>,
    ) -> Result<usize, SocketError> {
        self.sent.extend(bufs.iter().map(|b| SentDatagram {
            payload: b.as_ref().to_vec(),
            dest,
        }));
        Ok(bufs.len())
    }

    fn send_batch_to(&mut self, msgs: &[(&[u8], SocketAddrV4)]) -> Result<usize, SocketError> {
        self.sent
            .extend(msgs.iter().map(|(payload, dest)| SentDatagram {
                payload: payload.to_vec(),
                dest: Some(*dest),
            }));
        Ok(msgs.len())
    }

    fn set_rcvbuf(&mut self, bytes: usize) {
        self.rcvbuf = Some(bytes);
    }

    fn set_sndbuf(&mut self, bytes: usize) {
        self.sndbuf = Some(bytes);
    }
}

/// Wraps a [`MemorySocket`] and accepts at most `cap` messages per send
/// call, like a kernel with a full send buffer.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ShortSendSocket {
    pub inner: MemorySocket,
    pub cap: usize,
}

#[cfg(test)]
impl ShortSendSocket {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: MemorySocket::new(),
            cap,
        }
    }
}

#[cfg(test)]
impl BatchSocket for ShortSendSocket {
    fn bind(&mut self, port: u16, reuse: bool) -> Result<(), SocketError> {
        self.inner.bind(port, reuse)
    }

    fn connect(&mut self, addr: &str, port: u16) -> Result<(), SocketError> {
        self.inner.connect(addr, port)
    }

    fn recv_batch(
        &mut self,
        bufs: &mut [Vec<u8>],
        meta: &mut [RecvMeta],
    ) -> Result<usize, SocketError> {
        self.inner.recv_batch(bufs, meta)
    }

    fn send_batch<B: AsRef<[u8]>>(
        &mut self,
        bufs: &[B],
        dest: Option<SocketAddrV4>,
    ) -> Result<usize, SocketError> {
        let n = bufs.len().min(self.cap);
        self.inner.send_batch(&bufs[..n], dest)
    }

    fn send_batch_to(&mut self, msgs: &[(&[u8], SocketAddrV4)]) -> Result<usize, SocketError> {
        let n = msgs.len().min(self.cap);
        self.inner.send_batch_to(&msgs[..n])
    }
}
