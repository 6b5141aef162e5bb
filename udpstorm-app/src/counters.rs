//! Shared traffic counters.
//!
//! Scalar counters are relaxed atomics: consumers only need each value to be
//! numerically right, never a consistent cut across counters. The per-client
//! hit map sits behind a short-held mutex and only feeds the unique-client
//! gauge; admission is enforced elsewhere (see [`crate::receiver::AdmissionSet`]).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use udpstorm_common::ClientIdentity;

#[derive(Debug, Default)]
pub struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    clients: Mutex<HashMap<ClientIdentity, u64>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rx_bytes(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tx_bytes(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Bump the hit count for `client`, inserting it on first sight.
    pub fn note_client(&self, client: ClientIdentity) {
        *self.lock_clients().entry(client).or_insert(0) += 1;
    }

    pub fn unique_clients(&self) -> usize {
        self.lock_clients().len()
    }

    pub fn client_hits(&self, client: &ClientIdentity) -> u64 {
        self.lock_clients().get(client).copied().unwrap_or(0)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Read every counter once. Values are loaded independently, so the
    /// result is not a transactional snapshot.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            sent: self.sent(),
            received: self.received(),
            rx_bytes: self.rx_bytes(),
            tx_bytes: self.tx_bytes(),
            unique_clients: self.unique_clients(),
        }
    }

    // The map only holds plain counts, so a panic while holding the lock
    // cannot leave it in a state worth refusing.
    fn lock_clients(&self) -> MutexGuard<'_, HashMap<ClientIdentity, u64>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub sent: u64,
    pub received: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub unique_clients: usize,
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recv={} sent={} unique_clients={} rx_bytes={} tx_bytes={}",
            self.received, self.sent, self.unique_clients, self.rx_bytes, self.tx_bytes
        )
    }
}
