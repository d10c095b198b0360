use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::bandwidth::{Bandwidth, Direction};

use super::*;

fn test_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 51413)
}

#[derive(Debug, PartialEq)]
enum Event {
    CanRead,
    DidWrite { payload: usize, is_piece: bool },
    GotError(ErrorFlags),
}

struct FakeUtp {
    sent: Arc<Mutex<Vec<u8>>>,
    abandoned: Arc<Mutex<bool>>,
}

impl FakeUtp {
    fn new() -> (Self, Arc<Mutex<Vec<u8>>>, Arc<Mutex<bool>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let abandoned = Arc::new(Mutex::new(false));
        (
            Self {
                sent: sent.clone(),
                abandoned: abandoned.clone(),
            },
            sent,
            abandoned,
        )
    }
}

impl UtpSocket for FakeUtp {
    fn send(&mut self, data: &[u8]) -> usize {
        self.sent.lock().unwrap().extend_from_slice(data);
        data.len()
    }

    fn abandon(&mut self) {
        *self.abandoned.lock().unwrap() = true;
    }
}

fn utp_io(parent: &Bandwidth) -> (PeerIo, Arc<Mutex<Vec<u8>>>, Arc<Mutex<bool>>) {
    let (fake, sent, abandoned) = FakeUtp::new();
    let io = PeerIo::new(
        Transport::Utp(Box::new(fake)),
        test_addr(),
        None,
        false,
        false,
        parent,
    );
    (io, sent, abandoned)
}

/// Consumes length-prefixed messages: u32 length, then that many bytes of
/// piece payload.
struct MessageReader {
    events: Arc<Mutex<Vec<Event>>>,
}

impl PeerIoHandler for MessageReader {
    fn can_read(&mut self, io: &mut PeerIo) -> (ReadState, usize) {
        self.events.lock().unwrap().push(Event::CanRead);
        if io.read_buffer_len() < 4 {
            return (ReadState::Later, 0);
        }
        let len = io.read_u32().unwrap() as usize;
        match io.read_bytes(len) {
            Some(_) => (ReadState::Now, len),
            None => (ReadState::Err, 0),
        }
    }

    fn did_write(&mut self, _io: &mut PeerIo, payload: usize, is_piece_data: bool) {
        self.events.lock().unwrap().push(Event::DidWrite {
            payload,
            is_piece: is_piece_data,
        });
    }

    fn got_error(&mut self, _io: &mut PeerIo, flags: ErrorFlags) {
        self.events.lock().unwrap().push(Event::GotError(flags));
    }
}

fn message(len: usize) -> Vec<u8> {
    let mut msg = (len as u32).to_be_bytes().to_vec();
    msg.extend(vec![0xabu8; len]);
    msg
}

#[test]
fn test_write_walks_datatype_fifo() {
    let root = Bandwidth::new();
    let (mut io, sent, _) = utp_io(&root);
    let events = Arc::new(Mutex::new(Vec::new()));
    io.set_handler(Box::new(MessageReader {
        events: events.clone(),
    }));

    io.write_bytes(b"\x00\x00\x40\x00", false);
    io.write_bytes(&vec![0xcd; 16384], true);
    assert_eq!(io.write_buffer_len(), 4 + 16384);

    let n = io.flush_write(Instant::now());
    assert_eq!(n, 4 + 16384);
    assert_eq!(sent.lock().unwrap().len(), 4 + 16384);

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            Event::DidWrite {
                payload: 4,
                is_piece: false
            },
            Event::DidWrite {
                payload: 16384,
                is_piece: true
            },
        ]
    );
}

#[test]
fn test_write_coalesces_same_tag_segments() {
    let root = Bandwidth::new();
    let (mut io, _, _) = utp_io(&root);
    let events = Arc::new(Mutex::new(Vec::new()));
    io.set_handler(Box::new(MessageReader {
        events: events.clone(),
    }));

    io.write_bytes(b"aa", false);
    io.write_bytes(b"bb", false);
    io.flush_write(Instant::now());

    assert_eq!(
        *events.lock().unwrap(),
        vec![Event::DidWrite {
            payload: 4,
            is_piece: false
        }]
    );
}

#[test]
fn test_can_read_splits_piece_from_overhead() {
    let root = Bandwidth::new();
    root.set_limited(Direction::Down, true);
    root.set_desired_bps(Direction::Down, 100_000);
    root.allocate();

    let (mut io, _, _) = utp_io(&root);
    let events = Arc::new(Mutex::new(Vec::new()));
    io.set_handler(Box::new(MessageReader {
        events: events.clone(),
    }));

    let now = Instant::now();
    io.utp_inject_read(&message(1000), now);

    // 1004 bytes consumed and charged against the down tokens
    assert_eq!(io.read_buffer_len(), 0);
    assert_eq!(root.clamp(Direction::Down, u64::MAX), 100_000 - 1004);
    assert_eq!(root.piece_speed_bps(Direction::Down, now), 1000 / 5);
}

#[test]
fn test_can_read_loops_until_buffer_empty() {
    let root = Bandwidth::new();
    let (mut io, _, _) = utp_io(&root);
    let events = Arc::new(Mutex::new(Vec::new()));
    io.set_handler(Box::new(MessageReader {
        events: events.clone(),
    }));

    let mut stream = message(10);
    stream.extend(message(20));
    stream.extend(message(30));
    io.utp_inject_read(&stream, Instant::now());

    let events = events.lock().unwrap();
    assert_eq!(events.iter().filter(|e| **e == Event::CanRead).count(), 3);
    assert_eq!(io.read_buffer_len(), 0);
}

#[test]
fn test_rc4_pipe_round_trip() {
    let root = Bandwidth::new();

    let (mut sender, sent, _) = utp_io(&root);
    sender.set_encryption(Direction::Up, Rc4::new(b"swap-key"));
    assert_eq!(sender.encryption_type(Direction::Up), EncryptionType::Rc4);

    sender.write_bytes(&message(100), true);
    sender.flush_write(Instant::now());

    let ciphertext = sent.lock().unwrap().clone();
    assert_ne!(ciphertext, message(100));

    let (mut receiver, _, _) = utp_io(&root);
    receiver.set_encryption(Direction::Down, Rc4::new(b"swap-key"));
    let events = Arc::new(Mutex::new(Vec::new()));
    receiver.set_handler(Box::new(MessageReader {
        events: events.clone(),
    }));

    receiver.utp_inject_read(&ciphertext, Instant::now());
    assert_eq!(receiver.read_buffer_len(), 0);
    assert!(events.lock().unwrap().contains(&Event::CanRead));
}

#[test]
fn test_framing_helpers() {
    let root = Bandwidth::new();
    let (mut io, _, _) = utp_io(&root);

    let mut data = vec![0x07u8];
    data.extend_from_slice(&0xbeefu16.to_be_bytes());
    data.extend_from_slice(&0xdeadbeefu32.to_be_bytes());
    data.extend_from_slice(&0x0123456789abcdefu64.to_be_bytes());
    data.extend_from_slice(b"skip-me");
    io.utp_inject_read(&data, Instant::now());

    assert_eq!(io.read_u8(), Some(0x07));
    assert_eq!(io.read_u16(), Some(0xbeef));
    assert_eq!(io.read_u32(), Some(0xdeadbeef));
    assert_eq!(io.read_u64(), Some(0x0123456789abcdef));
    assert_eq!(io.drain(100), 7);
    assert_eq!(io.read_u8(), None);
}

#[test]
fn test_error_delivered_after_callback_returns() {
    struct ErrInRead {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl PeerIoHandler for ErrInRead {
        fn can_read(&mut self, io: &mut PeerIo) -> (ReadState, usize) {
            self.events.lock().unwrap().push(Event::CanRead);
            // a failure noticed mid-callback must not recurse into us
            io.emit_error(ErrorFlags::READING | ErrorFlags::TIMEOUT);
            let n = io.read_buffer_len();
            io.drain(n);
            (ReadState::Later, 0)
        }

        fn did_write(&mut self, _io: &mut PeerIo, _payload: usize, _is_piece: bool) {}

        fn got_error(&mut self, _io: &mut PeerIo, flags: ErrorFlags) {
            self.events.lock().unwrap().push(Event::GotError(flags));
        }
    }

    let root = Bandwidth::new();
    let (mut io, _, _) = utp_io(&root);
    let events = Arc::new(Mutex::new(Vec::new()));
    io.set_handler(Box::new(ErrInRead {
        events: events.clone(),
    }));

    io.utp_inject_read(b"xx", Instant::now());

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            Event::CanRead,
            Event::GotError(ErrorFlags::READING | ErrorFlags::TIMEOUT),
        ]
    );
}

#[test]
fn test_read_disabled_when_tokens_run_out() {
    let root = Bandwidth::new();
    root.set_limited(Direction::Down, true);
    root.set_desired_bps(Direction::Down, 0);

    let (mut io, _, _) = utp_io(&root);
    assert!(io.is_enabled(Direction::Down));
    io.flush_read(Instant::now());
    assert!(!io.is_enabled(Direction::Down));

    // the next tick re-arms it
    root.allocate();
    io.set_enabled(Direction::Down, true);
    assert!(io.is_enabled(Direction::Down));
}

#[test]
fn test_utp_socket_abandoned_on_drop() {
    let root = Bandwidth::new();
    let (io, _, abandoned) = utp_io(&root);
    drop(io);
    assert!(*abandoned.lock().unwrap());
}

#[test]
fn test_utp_overhead_reported_separately() {
    let root = Bandwidth::new();
    let (mut io, _, _) = utp_io(&root);
    let now = Instant::now();

    io.report_overhead(Direction::Down, 5000, now);
    assert_eq!(root.raw_speed_bps(Direction::Down, now), 1000);
    assert_eq!(root.piece_speed_bps(Direction::Down, now), 0);
}

#[test]
fn test_guess_packet_overhead() {
    assert_eq!(guess_packet_overhead(94), 6);
    assert_eq!(guess_packet_overhead(0), 0);
    // roughly 6.4% of payload
    let overhead = guess_packet_overhead(100_000);
    assert!((6300..6500).contains(&overhead));
}

#[test]
fn test_peer_id_checksum() {
    const POOL: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    for _ in 0..32 {
        let id = PeerId::generate();
        let bytes = id.as_bytes();
        assert_eq!(&bytes[..8], b"-SH0010-");
        assert_eq!(id.client_id(), Some("SH0010"));

        let total: usize = bytes[8..]
            .iter()
            .map(|b| POOL.iter().position(|p| p == b).unwrap())
            .sum();
        assert_eq!(total % 36, 0);
    }
}
