use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use super::{BatchSocket, RecvMeta, SocketError};

/// Non-blocking IPv4 UDP socket with batched send/receive.
///
/// "Would block" is reported as zero messages, never as an error.
pub struct UdpBatchSocket {
    socket: UdpSocket,
    connected: bool,
    #[cfg(target_os = "linux")]
    scratch: MmsgScratch,
}

// The scratch vectors hold raw pointers into caller buffers. They are
// rewritten before every syscall and never read outside of one.
unsafe impl Send for UdpBatchSocket {}

impl UdpBatchSocket {
    /// Create the socket. `batch_hint` pre-sizes the syscall scratch space.
    pub fn new(batch_hint: usize) -> Result<Self, SocketError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(SocketError::Create)?;
        socket.set_nonblocking(true).map_err(SocketError::Create)?;
        socket.set_reuse_address(true).ok();

        #[cfg(not(target_os = "linux"))]
        let _ = batch_hint;

        Ok(Self {
            socket: socket.into(),
            connected: false,
            #[cfg(target_os = "linux")]
            scratch: MmsgScratch::with_capacity(batch_hint),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl BatchSocket for UdpBatchSocket {
    fn bind(&mut self, port: u16, reuse: bool) -> Result<(), SocketError> {
        let sock = SockRef::from(&self.socket);
        if reuse {
            set_reuse_port(&sock);
        }
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        sock.bind(&addr.into())
            .map_err(|source| SocketError::Bind { port, source })
    }

    fn connect(&mut self, addr: &str, port: u16) -> Result<(), SocketError> {
        let peer = (addr, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.find(SocketAddr::is_ipv4))
            .ok_or_else(|| SocketError::Resolve {
                addr: format!("{addr}:{port}"),
            })?;
        self.socket
            .connect(peer)
            .map_err(|source| SocketError::Connect {
                addr: peer.to_string(),
                source,
            })?;
        self.connected = true;
        Ok(())
    }

    fn recv_batch(
        &mut self,
        bufs: &mut [Vec<u8>],
        meta: &mut [RecvMeta],
    ) -> Result<usize, SocketError> {
        let n = bufs.len().min(meta.len());
        if n == 0 {
            return Ok(0);
        }
        #[cfg(target_os = "linux")]
        {
            self.recv_mmsg(&mut bufs[..n], &mut meta[..n])
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.recv_each(&mut bufs[..n], &mut meta[..n])
        }
    }

    fn send_batch<B: AsRef<[u8]>>(
        &mut self,
        bufs: &[B],
        dest: Option<SocketAddrV4>,
    ) -> Result<usize, SocketError> {
        let dest = if self.connected {
            None
        } else {
            Some(dest.ok_or(SocketError::NotConnected)?)
        };
        if bufs.is_empty() {
            return Ok(0);
        }
        #[cfg(target_os = "linux")]
        {
            self.send_mmsg(bufs.iter().map(|b| (b.as_ref(), dest)))
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.send_each(bufs.iter().map(|b| (b.as_ref(), dest)))
        }
    }

    fn send_batch_to(&mut self, msgs: &[(&[u8], SocketAddrV4)]) -> Result<usize, SocketError> {
        if msgs.is_empty() {
            return Ok(0);
        }
        #[cfg(target_os = "linux")]
        {
            self.send_mmsg(msgs.iter().map(|(payload, dest)| (*payload, Some(*dest))))
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.send_each(msgs.iter().map(|(payload, dest)| (*payload, Some(*dest))))
        }
    }

    fn set_rcvbuf(&mut self, bytes: usize) {
        SockRef::from(&self.socket).set_recv_buffer_size(bytes).ok();
    }

    fn set_sndbuf(&mut self, bytes: usize) {
        SockRef::from(&self.socket).set_send_buffer_size(bytes).ok();
    }
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn set_reuse_port(sock: &SockRef<'_>) {
    // Best effort: some kernels and sandboxes refuse it.
    sock.set_reuse_port(true).ok();
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn set_reuse_port(_sock: &SockRef<'_>) {}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

// ---------------------------------------------------------------------------
// Linux: recvmmsg / sendmmsg
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
struct MmsgScratch {
    msgs: Vec<libc::mmsghdr>,
    iov: Vec<libc::iovec>,
    addrs: Vec<libc::sockaddr_in>,
}

#[cfg(target_os = "linux")]
impl MmsgScratch {
    fn with_capacity(n: usize) -> Self {
        Self {
            msgs: Vec::with_capacity(n),
            iov: Vec::with_capacity(n),
            addrs: Vec::with_capacity(n),
        }
    }

    fn reset(&mut self, n: usize) {
        let (msg, iov, addr) = unsafe {
            (
                std::mem::zeroed::<libc::mmsghdr>(),
                std::mem::zeroed::<libc::iovec>(),
                std::mem::zeroed::<libc::sockaddr_in>(),
            )
        };
        self.msgs.clear();
        self.msgs.resize(n, msg);
        self.iov.clear();
        self.iov.resize(n, iov);
        self.addrs.clear();
        self.addrs.resize(n, addr);
    }
}

#[cfg(target_os = "linux")]
const SOCKADDR_IN_LEN: libc::socklen_t = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

#[cfg(target_os = "linux")]
fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    sa
}

#[cfg(target_os = "linux")]
fn from_sockaddr_in(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
        u16::from_be(sa.sin_port),
    )
}

#[cfg(target_os = "linux")]
impl UdpBatchSocket {
    fn recv_mmsg(
        &mut self,
        bufs: &mut [Vec<u8>],
        meta: &mut [RecvMeta],
    ) -> Result<usize, SocketError> {
        let n = bufs.len();
        self.scratch.reset(n);

        let iov = self.scratch.iov.as_mut_ptr();
        let addrs = self.scratch.addrs.as_mut_ptr();
        for (i, buf) in bufs.iter_mut().enumerate() {
            unsafe {
                *iov.add(i) = libc::iovec {
                    iov_base: buf.as_mut_ptr().cast(),
                    iov_len: buf.len(),
                };
                let hdr = &mut self.scratch.msgs[i].msg_hdr;
                hdr.msg_iov = iov.add(i);
                hdr.msg_iovlen = 1;
                hdr.msg_name = addrs.add(i).cast();
                hdr.msg_namelen = SOCKADDR_IN_LEN;
            }
        }

        let rc = unsafe {
            libc::recvmmsg(
                self.socket.as_raw_fd(),
                self.scratch.msgs.as_mut_ptr(),
                n as libc::c_uint,
                0,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if would_block(&err) {
                return Ok(0);
            }
            return Err(err.into());
        }

        let received = rc as usize;
        for (i, slot) in meta.iter_mut().take(received).enumerate() {
            let msg = &self.scratch.msgs[i];
            let addr = &self.scratch.addrs[i];
            let has_source = msg.msg_hdr.msg_namelen >= SOCKADDR_IN_LEN
                && addr.sin_family == libc::AF_INET as libc::sa_family_t;
            *slot = RecvMeta {
                len: (msg.msg_len as usize).min(bufs[i].len()),
                source: has_source.then(|| from_sockaddr_in(addr)),
            };
        }
        Ok(received)
    }

    fn send_mmsg<'a>(
        &mut self,
        msgs: impl ExactSizeIterator<Item = (&'a [u8], Option<SocketAddrV4>)>,
    ) -> Result<usize, SocketError> {
        let n = msgs.len();
        self.scratch.reset(n);

        let iov = self.scratch.iov.as_mut_ptr();
        let addrs = self.scratch.addrs.as_mut_ptr();
        for (i, (payload, dest)) in msgs.enumerate() {
            unsafe {
                // sendmmsg never writes through iov_base.
                *iov.add(i) = libc::iovec {
                    iov_base: payload.as_ptr() as *mut libc::c_void,
                    iov_len: payload.len(),
                };
                let hdr = &mut self.scratch.msgs[i].msg_hdr;
                hdr.msg_iov = iov.add(i);
                hdr.msg_iovlen = 1;
                if let Some(dest) = dest {
                    *addrs.add(i) = to_sockaddr_in(dest);
                    hdr.msg_name = addrs.add(i).cast();
                    hdr.msg_namelen = SOCKADDR_IN_LEN;
                }
            }
        }

        let rc = unsafe {
            libc::sendmmsg(
                self.socket.as_raw_fd(),
                self.scratch.msgs.as_mut_ptr(),
                n as libc::c_uint,
                0,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if would_block(&err) {
                return Ok(0);
            }
            return Err(err.into());
        }
        Ok(rc as usize)
    }
}

// ---------------------------------------------------------------------------
// Fallback: one syscall per message
// ---------------------------------------------------------------------------

#[cfg_attr(target_os = "linux", allow(dead_code))]
impl UdpBatchSocket {
    fn recv_each(
        &mut self,
        bufs: &mut [Vec<u8>],
        meta: &mut [RecvMeta],
    ) -> Result<usize, SocketError> {
        let mut filled = 0;
        for (buf, slot) in bufs.iter_mut().zip(meta.iter_mut()) {
            match self.socket.recv_from(buf) {
                Ok((len, from)) => {
                    *slot = RecvMeta {
                        len,
                        source: match from {
                            SocketAddr::V4(v4) => Some(v4),
                            SocketAddr::V6(_) => None,
                        },
                    };
                    filled += 1;
                }
                Err(e) if would_block(&e) => break,
                Err(e) if filled == 0 => return Err(e.into()),
                Err(_) => break,
            }
        }
        Ok(filled)
    }

    fn send_each<'a>(
        &mut self,
        msgs: impl Iterator<Item = (&'a [u8], Option<SocketAddrV4>)>,
    ) -> Result<usize, SocketError> {
        let mut sent = 0;
        for (payload, dest) in msgs {
            let res = match dest {
                Some(dest) => self.socket.send_to(payload, dest),
                None => self.socket.send(payload),
            };
            match res {
                Ok(_) => sent += 1,
                Err(e) if would_block(&e) => break,
                Err(e) if sent == 0 => return Err(e.into()),
                Err(_) => break,
            }
        }
        Ok(sent)
    }
}
