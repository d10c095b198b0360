//! Per-peer byte pipes with bandwidth shaping and optional encryption.
//!
//! A `PeerIo` sits between one remote peer's transport (TCP or uTP) and the
//! peer protocol layer above it. It owns the inbound and outbound byte
//! buffers, asks the bandwidth tree for permission before moving bytes, and
//! tells its handler what happened through three callbacks:
//!
//! - `can_read`: bytes are waiting in the inbound buffer
//! - `did_write`: outbound bytes were handed to the transport
//! - `got_error`: the pipe broke, with flags describing how
//!
//! Accounting distinguishes piece payload from protocol overhead: the
//! handler reports how much of what it consumed was piece data, and writes
//! carry an `is_piece_data` tag through a FIFO of outbound segments.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;

use crate::bandwidth::{Bandwidth, Direction};
use crate::metainfo::InfoHash;

use super::crypto::Rc4;

/// Inbound buffer ceiling; reads stop until the handler drains below it.
const INBUF_MAX: usize = 256 * 1024;

/// Estimated per-packet cost of `payload` bytes on a TCP transport.
///
/// Assumes ~94% payload efficiency: Ethernet framing plus an IPv4 or IPv6
/// header plus a TCP header with optional timestamps. uTP doesn't use this;
/// its transport reports overhead explicitly.
pub fn guess_packet_overhead(payload: u64) -> u64 {
    const ASSUMED_PAYLOAD_RATE: f64 = 94.0;
    (payload as f64 * (100.0 / ASSUMED_PAYLOAD_RATE) - payload as f64) as u64
}

/// What `can_read` tells the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Keep calling; more of the buffer can be consumed now.
    Now,
    /// Not enough bytes yet; wait for the next read.
    Later,
    /// The stream is broken at the protocol level.
    Err,
}

/// Bitmask describing a pipe failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorFlags(u8);

impl ErrorFlags {
    pub const READING: ErrorFlags = ErrorFlags(1);
    pub const WRITING: ErrorFlags = ErrorFlags(1 << 1);
    pub const EOF: ErrorFlags = ErrorFlags(1 << 2);
    pub const ERROR: ErrorFlags = ErrorFlags(1 << 3);
    pub const TIMEOUT: ErrorFlags = ErrorFlags(1 << 4);

    pub fn contains(self, other: ErrorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ErrorFlags {
    type Output = ErrorFlags;

    fn bitor(self, rhs: ErrorFlags) -> ErrorFlags {
        ErrorFlags(self.0 | rhs.0)
    }
}

/// The peer protocol layer's view of pipe events.
pub trait PeerIoHandler: Send {
    /// Consume from `io`'s inbound buffer. Returns what to do next and how
    /// many of the consumed bytes were piece payload.
    fn can_read(&mut self, io: &mut PeerIo) -> (ReadState, usize);

    /// `payload` outbound bytes reached the transport.
    fn did_write(&mut self, io: &mut PeerIo, payload: usize, is_piece_data: bool);

    /// The pipe failed. The handler decides whether to disconnect.
    fn got_error(&mut self, io: &mut PeerIo, flags: ErrorFlags);
}

/// Reliable-UDP socket driven by an external uTP runtime.
///
/// The runtime pushes inbound bytes with [`PeerIo::utp_inject_read`] and
/// reports its own packet overhead with [`PeerIo::report_overhead`]; the
/// engine hands it outbound bytes through this trait.
pub trait UtpSocket: Send {
    /// Accepts up to `data.len()` outbound bytes; returns how many were taken.
    fn send(&mut self, data: &[u8]) -> usize;

    /// Detach the engine: swap the runtime's callbacks for no-ops so a
    /// socket that outlives its `PeerIo` goes quiet, then close.
    fn abandon(&mut self);
}

pub enum Transport {
    Tcp(TcpStream),
    Utp(Box<dyn UtpSocket>),
}

impl Transport {
    fn is_tcp(&self) -> bool {
        matches!(self, Transport::Tcp(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    None,
    Rc4,
}

struct Datatype {
    length: usize,
    is_piece_data: bool,
}

/// One direction's stream cipher state.
struct Crypto {
    encryption: EncryptionType,
    cipher: Option<Rc4>,
}

impl Crypto {
    fn plaintext() -> Self {
        Self {
            encryption: EncryptionType::None,
            cipher: None,
        }
    }

    fn process(&mut self, data: &mut [u8]) {
        if let Some(cipher) = &mut self.cipher {
            cipher.process(data);
        }
    }
}

pub struct PeerIo {
    addr: SocketAddr,
    info_hash: Option<InfoHash>,
    is_incoming: bool,
    is_seed: bool,

    transport: Transport,
    inbuf: BytesMut,
    outbuf: BytesMut,
    datatypes: VecDeque<Datatype>,
    bandwidth: Bandwidth,

    encrypt_out: Crypto,
    decrypt_in: Crypto,

    read_enabled: bool,
    write_enabled: bool,

    // taken while a callback runs, which both prevents re-entry and lets
    // callbacks borrow the io mutably
    handler: Option<Box<dyn PeerIoHandler>>,
    pending_error: Option<ErrorFlags>,
}

impl PeerIo {
    pub fn new(
        transport: Transport,
        addr: SocketAddr,
        info_hash: Option<InfoHash>,
        is_incoming: bool,
        is_seed: bool,
        parent_bandwidth: &Bandwidth,
    ) -> Self {
        Self {
            addr,
            info_hash,
            is_incoming,
            is_seed,
            transport,
            inbuf: BytesMut::with_capacity(32 * 1024),
            outbuf: BytesMut::with_capacity(32 * 1024),
            datatypes: VecDeque::new(),
            bandwidth: parent_bandwidth.new_child(),
            encrypt_out: Crypto::plaintext(),
            decrypt_in: Crypto::plaintext(),
            read_enabled: true,
            write_enabled: true,
            handler: None,
            pending_error: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn info_hash(&self) -> Option<&InfoHash> {
        self.info_hash.as_ref()
    }

    pub fn set_info_hash(&mut self, info_hash: InfoHash) {
        self.info_hash = Some(info_hash);
    }

    pub fn is_incoming(&self) -> bool {
        self.is_incoming
    }

    pub fn is_seed(&self) -> bool {
        self.is_seed
    }

    pub fn set_seed(&mut self, is_seed: bool) {
        self.is_seed = is_seed;
    }

    pub fn is_utp(&self) -> bool {
        !self.transport.is_tcp()
    }

    pub fn bandwidth(&self) -> &Bandwidth {
        &self.bandwidth
    }

    pub fn set_handler(&mut self, handler: Box<dyn PeerIoHandler>) {
        self.handler = Some(handler);
    }

    pub fn clear_handler(&mut self) {
        self.handler = None;
    }

    /// Switches one or both directions to RC4. The ciphers arrive already
    /// keyed by the handshake layer.
    pub fn set_encryption(&mut self, dir: Direction, cipher: Rc4) {
        let slot = match dir {
            Direction::Up => &mut self.encrypt_out,
            Direction::Down => &mut self.decrypt_in,
        };
        slot.encryption = EncryptionType::Rc4;
        slot.cipher = Some(cipher);
    }

    pub fn encryption_type(&self, dir: Direction) -> EncryptionType {
        match dir {
            Direction::Up => self.encrypt_out.encryption,
            Direction::Down => self.decrypt_in.encryption,
        }
    }

    pub fn set_enabled(&mut self, dir: Direction, is_enabled: bool) {
        match dir {
            Direction::Up => self.write_enabled = is_enabled,
            Direction::Down => self.read_enabled = is_enabled,
        }
    }

    pub fn is_enabled(&self, dir: Direction) -> bool {
        match dir {
            Direction::Up => self.write_enabled,
            Direction::Down => self.read_enabled,
        }
    }

    pub fn read_buffer_len(&self) -> usize {
        self.inbuf.len()
    }

    pub fn write_buffer_len(&self) -> usize {
        self.outbuf.len()
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Queues bytes for the transport, encrypting in place if this
    /// direction runs RC4, and tags them for later accounting.
    pub fn write_bytes(&mut self, data: &[u8], is_piece_data: bool) {
        if data.is_empty() {
            return;
        }

        let mut owned = data.to_vec();
        self.encrypt_out.process(&mut owned);
        self.outbuf.extend_from_slice(&owned);

        // coalesce with the tail segment when the tag matches
        if let Some(tail) = self.datatypes.back_mut() {
            if tail.is_piece_data == is_piece_data {
                tail.length += data.len();
                return;
            }
        }
        self.datatypes.push_back(Datatype {
            length: data.len(),
            is_piece_data,
        });
    }

    pub fn add_u8(&mut self, value: u8) {
        self.write_bytes(&[value], false);
    }

    pub fn add_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_be_bytes(), false);
    }

    pub fn add_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_be_bytes(), false);
    }

    pub fn add_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_be_bytes(), false);
    }

    /// Drains as much of the outbound buffer as the bandwidth tree and the
    /// transport allow. Returns bytes handed to the transport.
    pub fn flush_write(&mut self, now: Instant) -> usize {
        if !self.write_enabled || self.outbuf.is_empty() {
            return 0;
        }

        let allowed = self.bandwidth.clamp(Direction::Up, self.outbuf.len() as u64) as usize;
        if allowed == 0 {
            self.write_enabled = false;
            return 0;
        }

        let n = match &mut self.transport {
            Transport::Tcp(stream) => match stream.try_write(&self.outbuf[..allowed]) {
                Ok(n) => n,
                Err(e) if is_transient(&e) => 0,
                Err(_) => {
                    self.emit_error(ErrorFlags::WRITING | ErrorFlags::ERROR);
                    return 0;
                }
            },
            Transport::Utp(socket) => socket.send(&self.outbuf[..allowed]),
        };

        if n > 0 {
            self.outbuf.advance(n);
            self.did_write_walk(n, now);
        }
        n
    }

    // Walks the datatype FIFO attributing `transferred` bytes: bandwidth is
    // charged per segment (payload plus estimated packet overhead on TCP)
    // and the handler hears about each segment's payload.
    fn did_write_walk(&mut self, mut transferred: usize, now: Instant) {
        let is_tcp = self.transport.is_tcp();

        while transferred > 0 {
            let Some(head) = self.datatypes.front_mut() else {
                break;
            };

            let payload = head.length.min(transferred);
            let is_piece_data = head.is_piece_data;

            self.bandwidth
                .consume(Direction::Up, payload as u64, is_piece_data, now);
            if is_tcp {
                let overhead = guess_packet_overhead(payload as u64);
                if overhead > 0 {
                    self.bandwidth.consume(Direction::Up, overhead, false, now);
                }
            }

            transferred -= payload;
            head.length -= payload;
            if head.length == 0 {
                self.datatypes.pop_front();
            }

            self.with_handler(|handler, io| handler.did_write(io, payload, is_piece_data));
        }

        self.flush_pending_error();
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Pulls bytes from a readable TCP transport into the inbound buffer,
    /// within the buffer ceiling and the bandwidth clamp, then runs the
    /// `can_read` loop.
    pub fn flush_read(&mut self, now: Instant) -> usize {
        if !self.read_enabled {
            return 0;
        }

        let space = INBUF_MAX.saturating_sub(self.inbuf.len());
        let allowed = self.bandwidth.clamp(Direction::Down, space as u64) as usize;
        if allowed == 0 {
            // out of tokens until the next tick
            self.read_enabled = false;
            return 0;
        }

        let mut chunk = vec![0u8; allowed];
        let n = match &mut self.transport {
            Transport::Tcp(stream) => match stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.emit_error(ErrorFlags::READING | ErrorFlags::EOF);
                    return 0;
                }
                Ok(n) => n,
                Err(e) if is_transient(&e) => 0,
                Err(_) => {
                    self.emit_error(ErrorFlags::READING | ErrorFlags::ERROR);
                    return 0;
                }
            },
            // uTP data arrives via utp_inject_read instead
            Transport::Utp(_) => 0,
        };

        if n > 0 {
            self.decrypt_in.process(&mut chunk[..n]);
            self.inbuf.extend_from_slice(&chunk[..n]);
            self.dispatch_can_read(now);
        }
        n
    }

    /// Inbound bytes delivered by the uTP runtime.
    pub fn utp_inject_read(&mut self, data: &[u8], now: Instant) {
        let mut owned = data.to_vec();
        self.decrypt_in.process(&mut owned);
        self.inbuf.extend_from_slice(&owned);
        self.dispatch_can_read(now);
    }

    /// Packet overhead measured by the uTP runtime.
    pub fn report_overhead(&mut self, dir: Direction, bytes: u64, now: Instant) {
        self.bandwidth.consume(dir, bytes, false, now);
    }

    // Invokes `can_read` while it keeps consuming. Each pass measures how
    // much the buffer shrank, splits it into piece payload (reported by the
    // handler) and overhead (the rest), and charges the bandwidth node.
    fn dispatch_can_read(&mut self, now: Instant) {
        loop {
            if self.inbuf.is_empty() || self.handler.is_none() {
                break;
            }

            let old_len = self.inbuf.len();
            let mut outcome = None;
            self.with_handler(|handler, io| {
                outcome = Some(handler.can_read(io));
            });
            let Some((state, piece_claimed)) = outcome else {
                break;
            };

            let used = old_len - self.inbuf.len();
            let piece = piece_claimed.min(used);
            let overhead = used - piece;
            if piece > 0 {
                self.bandwidth.consume(Direction::Down, piece as u64, true, now);
            }
            if overhead > 0 {
                self.bandwidth
                    .consume(Direction::Down, overhead as u64, false, now);
            }

            match state {
                ReadState::Now => continue,
                ReadState::Later => break,
                ReadState::Err => {
                    self.emit_error(ErrorFlags::READING | ErrorFlags::ERROR);
                    break;
                }
            }
        }

        self.flush_pending_error();
    }

    // ------------------------------------------------------------------
    // Framing helpers
    // ------------------------------------------------------------------

    pub fn read_u8(&mut self) -> Option<u8> {
        if self.inbuf.is_empty() {
            return None;
        }
        Some(self.inbuf.get_u8())
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        if self.inbuf.len() < 2 {
            return None;
        }
        Some(self.inbuf.get_u16())
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        if self.inbuf.len() < 4 {
            return None;
        }
        Some(self.inbuf.get_u32())
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        if self.inbuf.len() < 8 {
            return None;
        }
        Some(self.inbuf.get_u64())
    }

    pub fn read_bytes(&mut self, n: usize) -> Option<BytesMut> {
        if self.inbuf.len() < n {
            return None;
        }
        Some(self.inbuf.split_to(n))
    }

    /// Discards up to `n` inbound bytes; used to skip unknown messages.
    pub fn drain(&mut self, n: usize) -> usize {
        let n = n.min(self.inbuf.len());
        self.inbuf.advance(n);
        n
    }

    // ------------------------------------------------------------------
    // Errors and lifecycle
    // ------------------------------------------------------------------

    /// Reports a pipe failure to the handler. Never re-enters: a failure
    /// raised while a callback is running is delivered after it returns.
    pub fn emit_error(&mut self, flags: ErrorFlags) {
        if self.handler.is_none() {
            // inside a callback; queue for delivery afterwards
            self.pending_error = Some(match self.pending_error {
                Some(prior) => prior | flags,
                None => flags,
            });
            return;
        }
        self.with_handler(|handler, io| handler.got_error(io, flags));
    }

    fn flush_pending_error(&mut self) {
        if let Some(flags) = self.pending_error.take() {
            self.with_handler(|handler, io| handler.got_error(io, flags));
        }
    }

    /// Swaps in a freshly connected TCP stream, keeping the bandwidth node,
    /// the handler set, and the per-direction enabled mask.
    pub fn reconnect(&mut self, stream: TcpStream) {
        let old = std::mem::replace(&mut self.transport, Transport::Tcp(stream));
        if let Transport::Utp(mut socket) = old {
            socket.abandon();
        }
        self.inbuf.clear();
        self.outbuf.clear();
        self.datatypes.clear();
    }

    fn with_handler<F>(&mut self, f: F)
    where
        F: FnOnce(&mut dyn PeerIoHandler, &mut PeerIo),
    {
        if let Some(mut handler) = self.handler.take() {
            f(handler.as_mut(), self);
            // a callback may have installed a replacement
            if self.handler.is_none() {
                self.handler = Some(handler);
            }
        }
    }
}

impl Drop for PeerIo {
    fn drop(&mut self) {
        // a uTP socket can outlive us inside its runtime; make sure it
        // stops calling back before it is closed
        if let Transport::Utp(socket) = &mut self.transport {
            socket.abandon();
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::NotConnected
    )
}
