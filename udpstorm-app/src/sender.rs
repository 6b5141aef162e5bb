//! Rate-paced datagram sender.
//!
//! The worker builds a batch of stamped datagrams, sends it, then sleeps
//! until an absolute deadline that advances by one batch worth of
//! inter-packet intervals per iteration. Late iterations do not sleep, so
//! scheduling jitter never accumulates into drift.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};
use udpstorm_common::{datagram_len, PacketHeader};

use crate::cancel::CancelToken;
use crate::clock::{self, NANOS_PER_SEC};
use crate::counters::Counters;
use crate::socket::{BatchSocket, SocketError, DEFAULT_SOCKET_BUFFER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    /// Destination host, resolved to IPv4.
    pub dest: String,
    pub port: u16,
    /// Target packets per second.
    pub rate_pps: u64,
    pub duration: Duration,
    /// Requested datagram size. Never smaller than the header.
    pub payload_len: usize,
    /// Datagrams per send call.
    pub batch: usize,
    /// Tag used in log lines.
    pub id: u32,
    pub verbose: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            dest: "127.0.0.1".to_owned(),
            port: 9000,
            rate_pps: 10_000,
            duration: Duration::from_secs(5),
            payload_len: 64,
            batch: 64,
            id: 0,
            verbose: false,
        }
    }
}

/// Absolute-deadline pacing schedule.
#[derive(Debug, Clone)]
pub struct Pacer {
    step_ns: u64,
    next_deadline_ns: u64,
}

impl Pacer {
    pub fn new(rate_pps: u64, batch: usize, start_ns: u64) -> Self {
        Self {
            step_ns: Self::interval_ns(rate_pps).saturating_mul(batch.max(1) as u64),
            next_deadline_ns: start_ns,
        }
    }

    /// Nominal gap between two packets. A zero rate counts as one.
    pub fn interval_ns(rate_pps: u64) -> u64 {
        NANOS_PER_SEC / rate_pps.max(1)
    }

    pub fn step_ns(&self) -> u64 {
        self.step_ns
    }

    /// Move the deadline one batch forward. Returns it when it still lies
    /// ahead of `now_ns`, `None` when the sender is behind schedule.
    pub fn advance(&mut self, now_ns: u64) -> Option<u64> {
        self.next_deadline_ns = self.next_deadline_ns.saturating_add(self.step_ns);
        (self.next_deadline_ns > now_ns).then_some(self.next_deadline_ns)
    }
}

/// Worker-side state: owns the socket while running.
struct SendLoop<S> {
    socket: S,
    config: SenderConfig,
    counters: Arc<Counters>,
    seq: u64,
    batch: Vec<Vec<u8>>,
    batch_bytes: u64,
    last_log_ns: u64,
}

impl<S: BatchSocket> SendLoop<S> {
    fn new(socket: S, config: SenderConfig, counters: Arc<Counters>) -> Self {
        let batch_len = config.batch.max(1);
        let size = datagram_len(config.payload_len);
        Self {
            socket,
            counters,
            seq: 0,
            batch: vec![vec![0u8; size]; batch_len],
            batch_bytes: (size * batch_len) as u64,
            last_log_ns: 0,
            config,
        }
    }

    fn stamp_batch(&mut self) {
        for pkt in &mut self.batch {
            self.seq += 1;
            // Datagrams are sized with datagram_len, so the header always fits.
            if let Err(e) = PacketHeader::new(self.seq, clock::now_ns()).encode_into(pkt) {
                error!("header did not fit datagram: {e}");
            }
        }
    }

    fn send_once(&mut self) {
        self.stamp_batch();
        match self.socket.send_batch(&self.batch, None) {
            Ok(0) => {}
            Ok(n) => {
                self.counters.inc_sent(n as u64);
                // Byte accounting covers the whole attempted batch.
                self.counters.add_tx_bytes(self.batch_bytes);
            }
            Err(e) => debug!("[flood {}] send failed: {e}", self.config.id),
        }
    }

    fn run(mut self, cancel: &CancelToken) -> S {
        let start_ns = clock::now_ns();
        let mut pacer = Pacer::new(self.config.rate_pps, self.config.batch, start_ns);
        self.last_log_ns = start_ns;

        while !cancel.is_cancelled() && clock::elapsed_since(start_ns) < self.config.duration {
            self.send_once();

            if let Some(deadline) = pacer.advance(clock::now_ns()) {
                clock::sleep_until_ns(deadline);
            }

            self.maybe_log(clock::now_ns());
        }

        debug!(
            "[flood {}] done after {:?}, last seq {}",
            self.config.id,
            clock::elapsed_since(start_ns),
            self.seq
        );
        self.socket
    }

    fn maybe_log(&mut self, now_ns: u64) {
        if !self.config.verbose || now_ns.saturating_sub(self.last_log_ns) < NANOS_PER_SEC {
            return;
        }
        info!(
            "[flood {}] sent={} tx_bytes={}",
            self.config.id,
            self.counters.sent(),
            self.counters.tx_bytes()
        );
        self.last_log_ns = now_ns;
    }
}

/// Paced sender running on its own worker thread.
///
/// `start`, `stop` and `join` may be called from any thread and are
/// idempotent. A stopped sender stays stopped.
pub struct PacedSender<S: BatchSocket + 'static> {
    config: SenderConfig,
    counters: Arc<Counters>,
    cancel: CancelToken,
    socket: Option<S>,
    worker: Option<JoinHandle<S>>,
}

impl<S: BatchSocket + 'static> PacedSender<S> {
    /// Connect `socket` to the configured destination. Connection failures
    /// are setup errors.
    pub fn new(mut socket: S, config: SenderConfig) -> Result<Self, SocketError> {
        socket.connect(&config.dest, config.port)?;
        socket.set_sndbuf(DEFAULT_SOCKET_BUFFER);
        Ok(Self {
            config,
            counters: Arc::new(Counters::new()),
            cancel: CancelToken::new(),
            socket: Some(socket),
            worker: None,
        })
    }

    pub fn start(&mut self) -> io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(socket) = self.socket.take() else {
            return Ok(());
        };
        let send_loop = SendLoop::new(socket, self.config.clone(), Arc::clone(&self.counters));
        let cancel = self.cancel.clone();
        let worker = thread::Builder::new()
            .name(format!("flood-{}", self.config.id))
            .spawn(move || send_loop.run(&cancel))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Request cancellation and wait for the worker to exit.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.join();
    }

    /// Wait for the worker to finish on its own (duration elapsed or
    /// cancelled through [`PacedSender::cancel_token`]).
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(socket) => self.socket = Some(socket),
                Err(_) => error!("[flood {}] worker panicked", self.config.id),
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    pub fn sent(&self) -> u64 {
        self.counters.sent()
    }

    pub fn tx_bytes(&self) -> u64 {
        self.counters.tx_bytes()
    }

    /// The socket, while no worker holds it.
    pub fn socket(&self) -> Option<&S> {
        self.socket.as_ref()
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }
}

impl<S: BatchSocket + 'static> Drop for PacedSender<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{MemorySocket, ShortSendSocket};
    use udpstorm_common::{HEADER_LEN, MAGIC};

    #[test]
    fn deadline_accumulates_per_batch() {
        let mut pacer = Pacer::new(1000, 10, 0);
        assert_eq!(pacer.step_ns(), 10_000_000);

        assert_eq!(pacer.advance(0), Some(10_000_000));
        assert_eq!(pacer.advance(12_000_000), Some(20_000_000));
        // Far behind: no sleep, but the schedule keeps its own pace.
        assert_eq!(pacer.advance(45_000_000), None);
        assert_eq!(pacer.advance(45_000_000), None);
        assert_eq!(pacer.advance(45_000_000), Some(50_000_000));
    }

    #[test]
    fn zero_rate_is_clamped() {
        assert_eq!(Pacer::interval_ns(0), NANOS_PER_SEC);
        assert_eq!(Pacer::new(0, 0, 0).step_ns(), NANOS_PER_SEC);
    }

    #[test]
    fn huge_batch_saturates_instead_of_overflowing() {
        let mut pacer = Pacer::new(1, usize::MAX, 0);
        assert_eq!(pacer.step_ns(), u64::MAX);
        assert_eq!(pacer.advance(0), Some(u64::MAX));
        assert_eq!(pacer.advance(0), Some(u64::MAX));
    }

    #[test]
    fn partial_send_counts_messages_but_bills_whole_batch() {
        let config = SenderConfig {
            payload_len: 64,
            batch: 5,
            ..SenderConfig::default()
        };
        let counters = Arc::new(Counters::new());
        let mut send_loop = SendLoop::new(ShortSendSocket::new(2), config, Arc::clone(&counters));
        send_loop.send_once();

        assert_eq!(send_loop.socket.inner.sent_count(), 2);
        assert_eq!(counters.sent(), 2);
        assert_eq!(counters.tx_bytes(), 5 * 64);
        // The whole batch was stamped, so the next one continues after it.
        send_loop.send_once();
        let next = PacketHeader::decode(&send_loop.socket.inner.sent()[2].payload).unwrap();
        assert_eq!(next.seq, 6);
    }

    #[test]
    fn batches_carry_consecutive_headers() {
        let config = SenderConfig {
            payload_len: 4,
            batch: 3,
            ..SenderConfig::default()
        };
        let counters = Arc::new(Counters::new());
        let mut send_loop = SendLoop::new(MemorySocket::new(), config, Arc::clone(&counters));
        send_loop.send_once();
        send_loop.send_once();

        let sent = send_loop.socket.sent();
        assert_eq!(sent.len(), 6);
        let mut last_ts = 0;
        for (i, dgram) in sent.iter().enumerate() {
            assert_eq!(dgram.payload.len(), HEADER_LEN);
            assert_eq!(dgram.dest, None);
            let hdr = PacketHeader::decode(&dgram.payload).unwrap();
            assert_eq!(hdr.seq, i as u64 + 1);
            assert_eq!(hdr.magic, MAGIC);
            assert!(hdr.send_ts_ns >= last_ts);
            last_ts = hdr.send_ts_ns;
        }
        assert_eq!(counters.sent(), 6);
        assert_eq!(counters.tx_bytes(), 6 * HEADER_LEN as u64);
    }

    #[test]
    fn new_connects_and_sizes_buffers() {
        let config = SenderConfig {
            dest: "10.1.2.3".to_owned(),
            port: 7000,
            ..SenderConfig::default()
        };
        let sender = PacedSender::new(MemorySocket::new(), config).unwrap();
        let socket = sender.socket().unwrap();
        assert_eq!(socket.peer(), Some(("10.1.2.3", 7000)));
        assert_eq!(socket.buffer_sizes().1, Some(DEFAULT_SOCKET_BUFFER));
    }

    #[test]
    fn stop_is_idempotent_and_returns_the_socket() {
        let config = SenderConfig {
            rate_pps: 100,
            batch: 1,
            duration: Duration::from_secs(60),
            ..SenderConfig::default()
        };
        let mut sender = PacedSender::new(MemorySocket::new(), config).unwrap();
        sender.start().unwrap();
        sender.start().unwrap();
        assert!(sender.socket().is_none());

        sender.stop();
        sender.stop();
        assert!(!sender.is_running());
        let socket = sender.socket().unwrap();
        assert_eq!(socket.sent_count() as u64, sender.sent());
    }
}
