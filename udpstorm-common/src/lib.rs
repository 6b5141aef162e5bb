//! Wire-level types shared by the `flood` sender and the `udpstorm` receiver.
//!
//! Every datagram starts with a fixed 20-byte [`PacketHeader`]:
//!
//! ```text
//!  0       8              16      20
//!  +-------+--------------+-------+----------------
//!  |  seq  |  send_ts_ns  | magic |  padding ...
//!  +-------+--------------+-------+----------------
//! ```
//!
//! Fields are written in host byte order. Peers with different endianness
//! have to agree on a conversion out of band; nothing here swaps bytes.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Sentinel written into every header; receivers may drop frames without it.
pub const MAGIC: u32 = 0xC0DE_F00D;

/// Encoded size of [`PacketHeader`] in bytes.
pub const HEADER_LEN: usize = 20;

const OFF_SEQ: usize = 0;
const OFF_SEND_TS: usize = 8;
const OFF_MAGIC: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer too short for header: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
}

/// Fixed header prepended to every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Sender-assigned, +1 per packet.
    pub seq: u64,
    /// Monotonic clock at send time. Only differences are meaningful.
    pub send_ts_ns: u64,
    pub magic: u32,
}

impl PacketHeader {
    pub fn new(seq: u64, send_ts_ns: u64) -> Self {
        Self {
            seq,
            send_ts_ns,
            magic: MAGIC,
        }
    }

    /// Write the header at the start of `buf`. Bytes past [`HEADER_LEN`] are
    /// left untouched.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                got: buf.len(),
            });
        }
        buf[OFF_SEQ..OFF_SEQ + 8].copy_from_slice(&self.seq.to_ne_bytes());
        buf[OFF_SEND_TS..OFF_SEND_TS + 8].copy_from_slice(&self.send_ts_ns.to_ne_bytes());
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&self.magic.to_ne_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                got: buf.len(),
            });
        }
        let mut seq = [0u8; 8];
        let mut send_ts = [0u8; 8];
        let mut magic = [0u8; 4];
        seq.copy_from_slice(&buf[OFF_SEQ..OFF_SEQ + 8]);
        send_ts.copy_from_slice(&buf[OFF_SEND_TS..OFF_SEND_TS + 8]);
        magic.copy_from_slice(&buf[OFF_MAGIC..OFF_MAGIC + 4]);
        Ok(Self {
            seq: u64::from_ne_bytes(seq),
            send_ts_ns: u64::from_ne_bytes(send_ts),
            magic: u32::from_ne_bytes(magic),
        })
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == MAGIC
    }
}

/// Total datagram size for a requested payload size. The header always fits.
pub fn datagram_len(payload_len: usize) -> usize {
    payload_len.max(HEADER_LEN)
}

/// A traffic source: IPv4 address and UDP port, both in host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity {
    pub addr: u32,
    pub port: u16,
}

impl ClientIdentity {
    pub fn new(addr: u32, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.addr), self.port)
    }
}

impl From<SocketAddrV4> for ClientIdentity {
    fn from(addr: SocketAddrV4) -> Self {
        Self {
            addr: u32::from(*addr.ip()),
            port: addr.port(),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Format a packet rate for log lines, e.g. `"12.34 kpps"`.
pub fn human_rate(pps: f64) -> String {
    if pps > 1e6 {
        format!("{:.2} Mpps", pps / 1e6)
    } else if pps > 1e3 {
        format!("{:.2} kpps", pps / 1e3)
    } else {
        format!("{pps:.2} pps")
    }
}
