//! NAT-PMP port mapping (RFC 6886).
//!
//! A single state machine driven by `pulse(now, private_port, enabled)`:
//! discover the gateway's public address, map our TCP port with a one-hour
//! lifetime, renew at half-life, and unmap when disabled or when the port
//! changes. Commands are paced at least eight seconds apart so a retrying
//! client doesn't hammer the router.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use tracing::{debug, info};

/// The well-known NAT-PMP port on the gateway.
pub const NATPMP_PORT: u16 = 5351;

const LIFETIME_SECS: u32 = 3600;
const COMMAND_WAIT_SECS: u64 = 8;

/// What the caller sees: the mapping's lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortForwarding {
    Unmapped,
    Mapping,
    Mapped,
    Unmapping,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Discover,
    RecvPub,
    Idle,
    SendMap,
    RecvMap,
    SendUnmap,
    RecvUnmap,
    Error,
}

/// A parsed gateway response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayResponse {
    PublicAddress(Ipv4Addr),
    Mapping {
        private_port: u16,
        public_port: u16,
        lifetime: u32,
    },
}

/// Result of polling the gateway socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayRead {
    Response(GatewayResponse),
    /// Nothing yet; not an error.
    TryAgain,
    Failed,
}

/// The gateway transport, separated out so the state machine can be driven
/// by a scripted fake in tests.
pub trait Gateway: Send {
    fn send_public_address_request(&mut self) -> io::Result<()>;

    /// `lifetime` 0 requests an unmap.
    fn send_mapping_request(
        &mut self,
        private_port: u16,
        public_port: u16,
        lifetime: u32,
    ) -> io::Result<()>;

    fn read_response(&mut self) -> GatewayRead;
}

pub struct PortMapper<G: Gateway> {
    gateway: G,
    state: State,
    is_mapped: bool,
    has_discovered: bool,
    public_port: u16,
    private_port: u16,
    renew_time: u64,
    command_time: u64,
}

impl<G: Gateway> PortMapper<G> {
    pub fn new(gateway: G) -> Self {
        Self {
            gateway,
            state: State::Discover,
            is_mapped: false,
            has_discovered: false,
            public_port: 0,
            private_port: 0,
            renew_time: 0,
            command_time: 0,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.is_mapped
    }

    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    /// Advances the state machine. Call periodically; `now` is a seconds
    /// clock, `private_port` the port we want forwarded, `is_enabled`
    /// whether forwarding should exist at all.
    pub fn pulse(&mut self, now: u64, private_port: u16, is_enabled: bool) -> PortForwarding {
        if is_enabled && self.state == State::Discover {
            let sent = self.gateway.send_public_address_request();
            self.state = match sent {
                Ok(()) => State::RecvPub,
                Err(_) => State::Error,
            };
            self.has_discovered = true;
            self.set_command_time(now);
        }

        if self.state == State::RecvPub && self.can_send_command(now) {
            match self.gateway.read_response() {
                GatewayRead::Response(GatewayResponse::PublicAddress(addr)) => {
                    info!(%addr, "found public address");
                    self.state = State::Idle;
                }
                GatewayRead::Response(_) => {}
                GatewayRead::TryAgain => {}
                GatewayRead::Failed => self.state = State::Error,
            }
        }

        if matches!(self.state, State::Idle | State::Error)
            && self.is_mapped
            && (!is_enabled || self.private_port != private_port)
        {
            self.state = State::SendUnmap;
        }

        if self.state == State::SendUnmap && self.can_send_command(now) {
            let sent = self
                .gateway
                .send_mapping_request(self.private_port, self.public_port, 0);
            self.state = match sent {
                Ok(()) => State::RecvUnmap,
                Err(_) => State::Error,
            };
            self.set_command_time(now);
        }

        if self.state == State::RecvUnmap {
            match self.gateway.read_response() {
                GatewayRead::Response(GatewayResponse::Mapping {
                    private_port: unmapped_port,
                    ..
                }) => {
                    info!(port = unmapped_port, "no longer forwarding");
                    if self.private_port == unmapped_port {
                        self.private_port = 0;
                        self.public_port = 0;
                        self.state = State::Idle;
                        self.is_mapped = false;
                    }
                }
                GatewayRead::Response(_) => {}
                GatewayRead::TryAgain => {}
                GatewayRead::Failed => self.state = State::Error,
            }
        }

        if self.state == State::Idle {
            if is_enabled && !self.is_mapped && self.has_discovered {
                self.state = State::SendMap;
            } else if self.is_mapped && now >= self.renew_time {
                self.state = State::SendMap;
            }
        }

        if self.state == State::SendMap && self.can_send_command(now) {
            let sent = self
                .gateway
                .send_mapping_request(private_port, private_port, LIFETIME_SECS);
            self.state = match sent {
                Ok(()) => State::RecvMap,
                Err(_) => State::Error,
            };
            self.set_command_time(now);
        }

        if self.state == State::RecvMap {
            match self.gateway.read_response() {
                GatewayRead::Response(GatewayResponse::Mapping {
                    private_port,
                    public_port,
                    lifetime,
                }) => {
                    self.state = State::Idle;
                    self.is_mapped = true;
                    self.renew_time = now + (lifetime / 2) as u64;
                    self.private_port = private_port;
                    self.public_port = public_port;
                    info!(private_port, public_port, "port forwarded");
                }
                GatewayRead::Response(_) => {}
                GatewayRead::TryAgain => {}
                GatewayRead::Failed => self.state = State::Error,
            }
        }

        match self.state {
            State::Idle => {
                if self.is_mapped {
                    PortForwarding::Mapped
                } else {
                    PortForwarding::Unmapped
                }
            }
            State::Discover => PortForwarding::Unmapped,
            State::RecvPub | State::SendMap | State::RecvMap => PortForwarding::Mapping,
            State::SendUnmap | State::RecvUnmap => PortForwarding::Unmapping,
            State::Error => PortForwarding::Error,
        }
    }

    fn can_send_command(&self, now: u64) -> bool {
        now >= self.command_time
    }

    fn set_command_time(&mut self, now: u64) {
        self.command_time = now + COMMAND_WAIT_SECS;
    }
}

// ----------------------------------------------------------------------
// Wire codec + UDP gateway
// ----------------------------------------------------------------------

pub(crate) fn encode_public_address_request() -> [u8; 2] {
    [0, 0]
}

pub(crate) fn encode_mapping_request(
    private_port: u16,
    public_port: u16,
    lifetime: u32,
) -> [u8; 12] {
    let mut frame = [0u8; 12];
    frame[0] = 0; // version
    frame[1] = 2; // opcode: map TCP
    frame[4..6].copy_from_slice(&private_port.to_be_bytes());
    frame[6..8].copy_from_slice(&public_port.to_be_bytes());
    frame[8..12].copy_from_slice(&lifetime.to_be_bytes());
    frame
}

pub(crate) fn decode_response(frame: &[u8]) -> GatewayRead {
    if frame.len() < 4 || frame[0] != 0 {
        return GatewayRead::Failed;
    }
    let opcode = frame[1];
    let result = u16::from_be_bytes([frame[2], frame[3]]);
    if result != 0 {
        return GatewayRead::Failed;
    }

    match opcode {
        // public address response: epoch + 4 address bytes
        128 if frame.len() >= 12 => GatewayRead::Response(GatewayResponse::PublicAddress(
            Ipv4Addr::new(frame[8], frame[9], frame[10], frame[11]),
        )),
        // mapping response (TCP): epoch + ports + lifetime
        130 if frame.len() >= 16 => GatewayRead::Response(GatewayResponse::Mapping {
            private_port: u16::from_be_bytes([frame[8], frame[9]]),
            public_port: u16::from_be_bytes([frame[10], frame[11]]),
            lifetime: u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]),
        }),
        _ => GatewayRead::Failed,
    }
}

/// Nonblocking UDP transport to the router.
pub struct UdpGateway {
    socket: UdpSocket,
}

impl UdpGateway {
    pub fn new(gateway_addr: Ipv4Addr) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(SocketAddrV4::new(gateway_addr, NATPMP_PORT))?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl Gateway for UdpGateway {
    fn send_public_address_request(&mut self) -> io::Result<()> {
        self.socket.send(&encode_public_address_request())?;
        Ok(())
    }

    fn send_mapping_request(
        &mut self,
        private_port: u16,
        public_port: u16,
        lifetime: u32,
    ) -> io::Result<()> {
        self.socket
            .send(&encode_mapping_request(private_port, public_port, lifetime))?;
        Ok(())
    }

    fn read_response(&mut self) -> GatewayRead {
        let mut buf = [0u8; 16];
        match self.socket.recv(&mut buf) {
            Ok(n) => decode_response(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => GatewayRead::TryAgain,
            Err(e) => {
                debug!(error = %e, "gateway read failed");
                GatewayRead::Failed
            }
        }
    }
}

/// Private-network gateway addresses worth probing when the platform can't
/// tell us the default route.
pub fn gateway_candidates() -> [Ipv4Addr; 3] {
    [
        Ipv4Addr::new(192, 168, 1, 1),
        Ipv4Addr::new(192, 168, 0, 1),
        Ipv4Addr::new(10, 0, 0, 1),
    ]
}
