use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::{Duration, Instant};

use udpstorm::socket::RecvMeta;
use udpstorm::{
    AdmissionReceiver, BatchSocket, MemorySocket, PacedSender, ReceiverConfig, SenderConfig,
};
use udpstorm_common::{ClientIdentity, PacketHeader, HEADER_LEN};

fn peer(last: u8, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
}

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn capacity_two_admits_the_first_two_clients() {
    let mut socket = MemorySocket::new();
    socket.preload_from(vec![1u8; 32], peer(1, 4000));
    socket.preload_from(vec![2u8; 32], peer(2, 4000));
    socket.preload_from(vec![3u8; 32], peer(3, 4000));
    let config = ReceiverConfig {
        max_clients: 2,
        verbose: false,
        ..ReceiverConfig::default()
    };

    let mut receiver = AdmissionReceiver::new(socket, config).unwrap();
    receiver.start().unwrap();
    wait_for(|| receiver.received() >= 2);
    receiver.stop();

    let rx = receiver.receive_loop().unwrap();
    assert_eq!(rx.socket().pending(), 0);
    assert_eq!(receiver.received(), 2);
    assert_eq!(receiver.rx_bytes(), 64);
    assert_eq!(receiver.sent(), 0);
    assert_eq!(receiver.unique_clients(), 2);
    assert!(!rx.admission().contains(&ClientIdentity::from(peer(3, 4000))));
}

#[test]
fn memory_socket_drains_in_batches() {
    let mut socket = MemorySocket::new();
    for i in 0..5u8 {
        socket.preload(vec![i; 16]);
    }
    let mut bufs = vec![vec![0u8; 64]; 3];
    let mut meta = vec![RecvMeta::default(); 3];

    assert_eq!(socket.recv_batch(&mut bufs, &mut meta).unwrap(), 3);
    assert_eq!(socket.recv_batch(&mut bufs, &mut meta).unwrap(), 2);
    assert_eq!(socket.recv_batch(&mut bufs, &mut meta).unwrap(), 0);
}

#[test]
fn paced_sender_hits_target_within_one_batch() {
    let config = SenderConfig {
        rate_pps: 1000,
        batch: 10,
        duration: Duration::from_secs(1),
        ..SenderConfig::default()
    };
    let mut sender = PacedSender::new(MemorySocket::new(), config).unwrap();
    let started = Instant::now();
    sender.start().unwrap();
    sender.join();

    let sent = sender.sent();
    assert!((990..=1010).contains(&sent), "sent {sent}");
    assert!(started.elapsed() >= Duration::from_secs(1));

    let socket = sender.socket().unwrap();
    assert_eq!(socket.sent_count() as u64, sent);
    let last = socket.sent().last().unwrap();
    assert_eq!(PacketHeader::decode(&last.payload).unwrap().seq, sent);
    assert_eq!(sender.tx_bytes(), sent * 64);
}

#[test]
fn echo_returns_payload_to_its_sender() {
    let from = peer(7, 5555);
    let payload: Vec<u8> = (0..64u8).collect();
    let mut socket = MemorySocket::new();
    socket.preload_from(payload.clone(), from);
    let config = ReceiverConfig {
        echo: true,
        verbose: false,
        ..ReceiverConfig::default()
    };

    let mut receiver = AdmissionReceiver::new(socket, config).unwrap();
    receiver.start().unwrap();
    wait_for(|| receiver.sent() >= 1);
    receiver.stop();

    let sent = receiver.receive_loop().unwrap().socket().sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, payload);
    assert_eq!(sent[0].dest, Some(from));
    assert_eq!(receiver.tx_bytes(), 64);
}

#[test]
fn stop_halts_a_long_sender_early() {
    let config = SenderConfig {
        rate_pps: 500,
        batch: 5,
        duration: Duration::from_secs(600),
        payload_len: HEADER_LEN,
        ..SenderConfig::default()
    };
    let mut sender = PacedSender::new(MemorySocket::new(), config).unwrap();
    sender.start().unwrap();
    wait_for(|| sender.sent() >= 50);

    let token = sender.cancel_token();
    token.cancel();
    sender.join();
    assert!(!sender.is_running());

    let frozen = sender.sent();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sender.sent(), frozen);
}

#[test]
fn receiver_stop_is_idempotent() {
    let mut receiver = AdmissionReceiver::new(MemorySocket::new(), ReceiverConfig::default()).unwrap();
    receiver.stop();
    receiver.start().unwrap();
    receiver.stop();
    receiver.stop();
    assert!(receiver.receive_loop().is_some());
    assert_eq!(receiver.received(), 0);
}
