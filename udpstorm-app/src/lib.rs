//! UDP load generation and admission-controlled reception.
//!
//! - [`sender::PacedSender`] emits stamped datagrams at a target rate.
//! - [`receiver::AdmissionReceiver`] counts, optionally echoes, and caps the
//!   number of distinct clients it serves.
//!
//! Both run their data path on a dedicated thread over a [`BatchSocket`],
//! and both publish into a shared [`Counters`].

pub mod cancel;
pub mod clock;
pub mod counters;
pub mod metrics;
pub mod receiver;
pub mod sender;
pub mod socket;

pub use cancel::CancelToken;
pub use counters::{CounterSnapshot, Counters};
pub use receiver::{Admission, AdmissionReceiver, AdmissionSet, ReceiverConfig};
pub use sender::{PacedSender, SenderConfig};
pub use socket::{BatchSocket, MemorySocket, RecvMeta, SocketError, UdpBatchSocket};

use env_logger::Env;

/// Install the process logger. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .init();
}
