//! Batched receiver with first-come-first-served admission control.
//!
//! Each received datagram whose source address is known is checked against
//! an [`AdmissionSet`]: known clients are served, new clients are admitted
//! while capacity remains, and everything else is dropped without touching
//! any counter. Datagrams without a source address (e.g. from
//! [`crate::socket::MemorySocket::preload`]) cannot be attributed; they are
//! always served and never echoed.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info};
use udpstorm_common::{human_rate, ClientIdentity};

use crate::cancel::CancelToken;
use crate::clock::{self, NANOS_PER_SEC};
use crate::counters::Counters;
use crate::socket::{BatchSocket, RecvMeta, SocketError, DEFAULT_SOCKET_BUFFER};

/// Size of each receive buffer. Longer datagrams are truncated.
pub const RECV_BUF_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub port: u16,
    /// Datagrams per receive call.
    pub batch: usize,
    /// Send served datagrams back to their source.
    pub echo: bool,
    pub reuse_port: bool,
    pub verbose: bool,
    /// Loopback port for the metrics endpoint, 0 to disable.
    pub metrics_port: u16,
    /// Maximum number of distinct clients ever served.
    pub max_clients: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            batch: 64,
            echo: false,
            reuse_port: false,
            verbose: true,
            metrics_port: 9100,
            max_clients: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Already admitted earlier.
    Known,
    /// First sighting, capacity left: admitted now.
    Admitted,
    /// First sighting, set is full.
    Rejected,
}

impl Admission {
    pub fn is_served(self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Grow-only set of admitted clients, bounded by `capacity`.
///
/// No eviction: a client admitted once stays admitted for the lifetime of
/// the set.
#[derive(Debug, Clone)]
pub struct AdmissionSet {
    members: HashSet<ClientIdentity>,
    capacity: usize,
}

impl AdmissionSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            members: HashSet::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn admit(&mut self, client: ClientIdentity) -> Admission {
        if self.members.contains(&client) {
            Admission::Known
        } else if self.members.len() < self.capacity {
            self.members.insert(client);
            Admission::Admitted
        } else {
            Admission::Rejected
        }
    }

    pub fn contains(&self, client: &ClientIdentity) -> bool {
        self.members.contains(client)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }
}

/// One-second receive rate estimate, published through a shared gauge.
#[derive(Debug)]
pub struct RateSampler {
    last_ns: u64,
    last_total: u64,
    latest: Arc<AtomicU64>,
}

impl RateSampler {
    pub fn new(start_ns: u64, latest: Arc<AtomicU64>) -> Self {
        Self {
            last_ns: start_ns,
            last_total: 0,
            latest,
        }
    }

    /// Take a sample if at least a second passed since the last one.
    /// Returns the packets counted in between.
    pub fn sample(&mut self, now_ns: u64, total: u64) -> Option<u64> {
        if now_ns.saturating_sub(self.last_ns) < NANOS_PER_SEC {
            return None;
        }
        let delta = total.saturating_sub(self.last_total);
        self.latest.store(delta, Ordering::Relaxed);
        self.last_total = total;
        self.last_ns = now_ns;
        Some(delta)
    }

    pub fn latest(&self) -> u64 {
        self.latest.load(Ordering::Relaxed)
    }

    /// Restart the measurement window at `now_ns` with `total` as baseline.
    pub fn reset(&mut self, now_ns: u64, total: u64) {
        self.last_ns = now_ns;
        self.last_total = total;
    }
}

/// Worker-side receive state. Owns the socket and the admission set.
pub struct ReceiveLoop<S> {
    socket: S,
    config: ReceiverConfig,
    counters: Arc<Counters>,
    admission: AdmissionSet,
    bufs: Vec<Vec<u8>>,
    meta: Vec<RecvMeta>,
    rate: RateSampler,
}

impl<S: BatchSocket> ReceiveLoop<S> {
    pub fn new(
        socket: S,
        config: ReceiverConfig,
        counters: Arc<Counters>,
        rate_gauge: Arc<AtomicU64>,
    ) -> Self {
        let batch = config.batch.max(1);
        Self {
            socket,
            counters,
            admission: AdmissionSet::new(config.max_clients),
            bufs: vec![vec![0u8; RECV_BUF_LEN]; batch],
            meta: vec![RecvMeta::default(); batch],
            rate: RateSampler::new(clock::now_ns(), rate_gauge),
            config,
        }
    }

    /// Receive one batch and run it through admission and echo. Returns the
    /// number of datagrams served; `Ok(0)` when nothing was pending.
    pub fn poll_once(&mut self) -> Result<usize, SocketError> {
        let n = self.socket.recv_batch(&mut self.bufs, &mut self.meta)?;
        if n == 0 {
            return Ok(0);
        }

        let mut served = 0;
        let mut echo: Vec<(&[u8], SocketAddrV4)> = Vec::new();
        for (buf, meta) in self.bufs.iter().zip(&self.meta).take(n) {
            let Some(source) = meta.source else {
                self.counters.inc_received(1);
                self.counters.add_rx_bytes(meta.len as u64);
                served += 1;
                continue;
            };

            let client = ClientIdentity::from(source);
            if !self.admission.admit(client).is_served() {
                continue;
            }

            self.counters.note_client(client);
            self.counters.inc_received(1);
            self.counters.add_rx_bytes(meta.len as u64);
            served += 1;

            if self.config.echo {
                echo.push((&buf[..meta.len], source));
            }
        }

        if !echo.is_empty() {
            match self.socket.send_batch_to(&echo) {
                Ok(0) => {}
                Ok(w) => {
                    let bytes: usize = echo[..w.min(echo.len())].iter().map(|(p, _)| p.len()).sum();
                    self.counters.inc_sent(w as u64);
                    self.counters.add_tx_bytes(bytes as u64);
                }
                Err(e) => debug!("[udpstorm] echo failed: {e}"),
            }
        }

        Ok(served)
    }

    /// Poll until `cancel` fires. Receive errors abandon the current
    /// iteration and the loop retries.
    pub fn run(&mut self, cancel: &CancelToken) {
        self.rate.reset(clock::now_ns(), self.counters.received());
        while !cancel.is_cancelled() {
            match self.poll_once() {
                Ok(0) => std::hint::spin_loop(),
                Ok(_) => {}
                Err(e) => {
                    debug!("[udpstorm] receive failed: {e}");
                    continue;
                }
            }

            self.sample_rate(clock::now_ns());
        }
    }

    fn sample_rate(&mut self, now_ns: u64) {
        let Some(delta) = self.rate.sample(now_ns, self.counters.received()) else {
            return;
        };
        if self.config.verbose {
            info!(
                "[udpstorm] {} rate={} admitted={} cap={}",
                self.counters.snapshot(),
                human_rate(delta as f64),
                self.admission.len(),
                self.admission.capacity()
            );
        }
    }

    pub fn admission(&self) -> &AdmissionSet {
        &self.admission
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }
}

/// Admission-controlled receiver running on its own worker thread.
///
/// `start` and `stop` may be called from any thread and are idempotent.
pub struct AdmissionReceiver<S: BatchSocket + 'static> {
    counters: Arc<Counters>,
    rate: Arc<AtomicU64>,
    cancel: CancelToken,
    idle: Option<ReceiveLoop<S>>,
    worker: Option<JoinHandle<ReceiveLoop<S>>>,
}

impl<S: BatchSocket + 'static> AdmissionReceiver<S> {
    /// Bind `socket` to the configured port. Bind failures are setup errors.
    pub fn new(mut socket: S, config: ReceiverConfig) -> Result<Self, SocketError> {
        socket.bind(config.port, config.reuse_port)?;
        socket.set_rcvbuf(DEFAULT_SOCKET_BUFFER);
        socket.set_sndbuf(DEFAULT_SOCKET_BUFFER);

        let counters = Arc::new(Counters::new());
        let rate = Arc::new(AtomicU64::new(0));
        let idle = ReceiveLoop::new(socket, config, Arc::clone(&counters), Arc::clone(&rate));
        Ok(Self {
            counters,
            rate,
            cancel: CancelToken::new(),
            idle: Some(idle),
            worker: None,
        })
    }

    pub fn start(&mut self) -> io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(mut receive_loop) = self.idle.take() else {
            return Ok(());
        };
        let cancel = self.cancel.clone();
        let worker = thread::Builder::new()
            .name("udpstorm-rx".to_owned())
            .spawn(move || {
                receive_loop.run(&cancel);
                receive_loop
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Request cancellation and wait for the worker to exit.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(receive_loop) => self.idle = Some(receive_loop),
                Err(_) => error!("[udpstorm] receive worker panicked"),
            }
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Shared gauge holding the latest one-second receive rate.
    pub fn rate_gauge(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.rate)
    }

    pub fn last_rate_pps(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.counters.received()
    }

    pub fn sent(&self) -> u64 {
        self.counters.sent()
    }

    pub fn rx_bytes(&self) -> u64 {
        self.counters.rx_bytes()
    }

    pub fn tx_bytes(&self) -> u64 {
        self.counters.tx_bytes()
    }

    pub fn unique_clients(&self) -> usize {
        self.counters.unique_clients()
    }

    /// Worker state, available while no worker is running.
    pub fn receive_loop(&self) -> Option<&ReceiveLoop<S>> {
        self.idle.as_ref()
    }
}

impl<S: BatchSocket + 'static> Drop for AdmissionReceiver<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{MemorySocket, ShortSendSocket};
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn client(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, last), port)
    }

    fn receive_loop(socket: MemorySocket, config: ReceiverConfig) -> ReceiveLoop<MemorySocket> {
        ReceiveLoop::new(
            socket,
            config,
            Arc::new(Counters::new()),
            Arc::new(AtomicU64::new(0)),
        )
    }

    #[test]
    fn admission_is_first_come_first_served() {
        let mut set = AdmissionSet::new(2);
        let a = ClientIdentity::new(1, 1);
        let b = ClientIdentity::new(2, 2);
        let c = ClientIdentity::new(3, 3);

        assert_eq!(set.admit(a), Admission::Admitted);
        assert_eq!(set.admit(b), Admission::Admitted);
        assert_eq!(set.admit(c), Admission::Rejected);
        assert_eq!(set.admit(a), Admission::Known);
        assert!(set.is_full());
        assert!(!set.contains(&c));
    }

    #[test]
    fn zero_capacity_rejects_everyone() {
        let mut set = AdmissionSet::new(0);
        assert_eq!(set.admit(ClientIdentity::new(1, 1)), Admission::Rejected);
        assert!(set.is_empty());
    }

    #[test]
    fn rate_sampler_waits_a_full_second() {
        let gauge = Arc::new(AtomicU64::new(0));
        let mut sampler = RateSampler::new(0, Arc::clone(&gauge));

        assert_eq!(sampler.sample(NANOS_PER_SEC - 1, 500), None);
        assert_eq!(sampler.sample(NANOS_PER_SEC, 700), Some(700));
        assert_eq!(sampler.sample(NANOS_PER_SEC + 10, 900), None);
        assert_eq!(sampler.sample(2 * NANOS_PER_SEC + 5, 1000), Some(300));
        assert_eq!(gauge.load(Ordering::Relaxed), 300);
        assert_eq!(sampler.latest(), 300);
    }

    #[test]
    fn known_client_keeps_being_served_at_capacity() {
        let mut socket = MemorySocket::new();
        socket.preload_from(vec![1u8; 10], client(1, 1000));
        socket.preload_from(vec![2u8; 10], client(2, 1000));
        socket.preload_from(vec![1u8; 30], client(1, 1000));
        let config = ReceiverConfig {
            max_clients: 1,
            ..ReceiverConfig::default()
        };
        let mut rx = receive_loop(socket, config);

        assert_eq!(rx.poll_once().unwrap(), 2);
        assert_eq!(rx.counters().received(), 2);
        assert_eq!(rx.counters().rx_bytes(), 40);
        assert_eq!(rx.counters().unique_clients(), 1);
        assert_eq!(
            rx.counters().client_hits(&ClientIdentity::from(client(1, 1000))),
            2
        );
    }

    #[test]
    fn degraded_mode_counts_everything_and_never_echoes() {
        let mut socket = MemorySocket::new();
        for _ in 0..4 {
            socket.preload(vec![0u8; 64]);
        }
        let config = ReceiverConfig {
            max_clients: 1,
            echo: true,
            ..ReceiverConfig::default()
        };
        let mut rx = receive_loop(socket, config);

        assert_eq!(rx.poll_once().unwrap(), 4);
        assert_eq!(rx.counters().received(), 4);
        assert_eq!(rx.counters().rx_bytes(), 256);
        // The observability map has nothing to key on in this mode.
        assert_eq!(rx.counters().unique_clients(), 0);
        assert!(rx.admission().is_empty());
        assert_eq!(rx.socket().sent_count(), 0);
        assert_eq!(rx.counters().sent(), 0);
    }

    #[test]
    fn echo_goes_back_to_each_sender() {
        let mut socket = MemorySocket::new();
        socket.preload_from(vec![0xA1; 40], client(1, 5000));
        socket.preload_from(vec![0xB2; 24], client(2, 6000));
        let config = ReceiverConfig {
            echo: true,
            ..ReceiverConfig::default()
        };
        let mut rx = receive_loop(socket, config);

        assert_eq!(rx.poll_once().unwrap(), 2);
        let sent = rx.socket().sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].payload, vec![0xA1; 40]);
        assert_eq!(sent[0].dest, Some(client(1, 5000)));
        assert_eq!(sent[1].payload, vec![0xB2; 24]);
        assert_eq!(sent[1].dest, Some(client(2, 6000)));
        assert_eq!(rx.counters().sent(), 2);
        assert_eq!(rx.counters().tx_bytes(), 64);
    }

    #[test]
    fn rate_window_restarts_on_reset() {
        let gauge = Arc::new(AtomicU64::new(0));
        let mut sampler = RateSampler::new(0, Arc::clone(&gauge));
        sampler.reset(5 * NANOS_PER_SEC, 100);

        assert_eq!(sampler.sample(5 * NANOS_PER_SEC + 1, 200), None);
        assert_eq!(sampler.sample(6 * NANOS_PER_SEC, 250), Some(150));
    }

    #[test]
    fn run_starts_the_rate_window_when_the_worker_starts() {
        let mut rx = receive_loop(MemorySocket::new(), ReceiverConfig::default());
        rx.counters.inc_received(40);
        rx.rate.reset(0, 0);

        let cancel = CancelToken::new();
        cancel.cancel();
        let before = clock::now_ns();
        rx.run(&cancel);

        assert!(rx.rate.last_ns >= before);
        assert_eq!(rx.rate.last_total, 40);
    }

    #[test]
    fn partial_echo_counts_only_what_was_sent() {
        let mut socket = ShortSendSocket::new(2);
        socket.inner.preload_from(vec![1u8; 10], client(1, 1));
        socket.inner.preload_from(vec![2u8; 30], client(2, 2));
        socket.inner.preload_from(vec![3u8; 50], client(3, 3));
        let config = ReceiverConfig {
            echo: true,
            ..ReceiverConfig::default()
        };
        let mut rx = ReceiveLoop::new(
            socket,
            config,
            Arc::new(Counters::new()),
            Arc::new(AtomicU64::new(0)),
        );

        assert_eq!(rx.poll_once().unwrap(), 3);
        assert_eq!(rx.counters().received(), 3);
        assert_eq!(rx.counters().sent(), 2);
        assert_eq!(rx.counters().tx_bytes(), 40);
        let sent = rx.socket().inner.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].dest, Some(client(2, 2)));
    }

    #[test]
    fn rejected_clients_are_not_echoed() {
        let mut socket = MemorySocket::new();
        socket.preload_from(vec![1u8; 8], client(1, 1));
        socket.preload_from(vec![2u8; 8], client(2, 2));
        let config = ReceiverConfig {
            echo: true,
            max_clients: 1,
            ..ReceiverConfig::default()
        };
        let mut rx = receive_loop(socket, config);

        rx.poll_once().unwrap();
        assert_eq!(rx.socket().sent_count(), 1);
        assert_eq!(rx.socket().sent()[0].dest, Some(client(1, 1)));
    }

    #[test]
    fn receive_error_is_reported_then_recovered() {
        let mut socket = MemorySocket::new();
        socket.fail_next_recv(io::ErrorKind::Other);
        socket.preload(vec![0u8; 8]);
        let mut rx = receive_loop(socket, ReceiverConfig::default());

        assert!(rx.poll_once().is_err());
        assert_eq!(rx.counters().received(), 0);
        assert_eq!(rx.poll_once().unwrap(), 1);
    }

    #[test]
    fn new_binds_with_requested_reuse() {
        let config = ReceiverConfig {
            port: 9555,
            reuse_port: true,
            ..ReceiverConfig::default()
        };
        let rx = AdmissionReceiver::new(MemorySocket::new(), config).unwrap();
        let socket = rx.receive_loop().unwrap().socket();
        assert_eq!(socket.bound(), Some((9555, true)));
        assert_eq!(
            socket.buffer_sizes(),
            (Some(DEFAULT_SOCKET_BUFFER), Some(DEFAULT_SOCKET_BUFFER))
        );
    }

    proptest! {
        #[test]
        fn admitted_set_is_the_first_distinct_arrivals(
            arrivals in proptest::collection::vec((0u32..16, 0u16..4), 0..200),
            capacity in 0usize..24,
        ) {
            let mut set = AdmissionSet::new(capacity);
            let mut first_seen: Vec<ClientIdentity> = Vec::new();
            for (addr, port) in arrivals {
                let client = ClientIdentity::new(addr, port);
                let outcome = set.admit(client);
                if !first_seen.contains(&client) {
                    first_seen.push(client);
                }
                let rank = first_seen.iter().position(|c| *c == client).unwrap();
                prop_assert_eq!(outcome.is_served(), rank < capacity);
                prop_assert!(set.len() <= capacity);
            }
        }
    }
}
