//! UDP tracker protocol ([BEP-15]).
//!
//! Connection-oriented binary protocol: a `connect` round-trip yields a
//! connection id that subsequent `announce`/`scrape` requests carry.
//! Retries double the timeout each attempt.
//!
//! [BEP-15]: http://bittorrent.org/beps/bep_0015.html

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::error::TrackerError;
use super::response::{
    parse_compact_peers, AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse,
};

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;
const UDP_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 3;

pub struct UdpTracker {
    socket: UdpSocket,
    addr: SocketAddr,
    connection_id: Option<u64>,
}

impl UdpTracker {
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let addr = resolve_udp_url(url).await?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        let mut tracker = Self {
            socket,
            addr,
            connection_id: None,
        };
        tracker.do_connect().await?;
        Ok(tracker)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn do_connect(&mut self) -> Result<(), TrackerError> {
        let transaction_id: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());

        let response = self.send_and_receive(&request, 16).await?;
        let (action, tid) = parse_header(&response)?;
        if action != ACTION_CONNECT || tid != transaction_id {
            return Err(TrackerError::InvalidResponse(
                "connect response mismatch".into(),
            ));
        }

        let mut cid = [0u8; 8];
        cid.copy_from_slice(&response[8..16]);
        self.connection_id = Some(u64::from_be_bytes(cid));
        Ok(())
    }

    pub async fn announce(
        &mut self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self
            .connection_id
            .ok_or_else(|| TrackerError::InvalidResponse("not connected".into()))?;

        let transaction_id: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(98);
        request.extend_from_slice(&connection_id.to_be_bytes());
        request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());
        request.extend_from_slice(req.info_hash.as_bytes());
        request.extend_from_slice(req.peer_id.as_bytes());
        request.extend_from_slice(&req.down.to_be_bytes());
        request.extend_from_slice(&req.left.to_be_bytes());
        request.extend_from_slice(&req.up.to_be_bytes());
        request.extend_from_slice(&req.event.as_udp_id().to_be_bytes());
        request.extend_from_slice(&0u32.to_be_bytes()); // IP (0 = sender's)
        request.extend_from_slice(&req.key.to_be_bytes());
        request.extend_from_slice(&(req.numwant as i32).to_be_bytes());
        request.extend_from_slice(&req.port.to_be_bytes());

        let response = self.send_and_receive(&request, 20).await?;
        let (action, tid) = parse_header(&response)?;

        if action == ACTION_ERROR {
            return Err(TrackerError::Failure(
                String::from_utf8_lossy(&response[8..]).into_owned(),
            ));
        }
        if action != ACTION_ANNOUNCE || tid != transaction_id {
            return Err(TrackerError::InvalidResponse(
                "announce response mismatch".into(),
            ));
        }

        let interval = read_u32(&response[8..12]);
        let leechers = read_u32(&response[12..16]);
        let seeders = read_u32(&response[16..20]);

        let mut result = AnnounceResponse::new(req.info_hash);
        result.interval = interval;
        result.seeders = Some(seeders);
        result.leechers = Some(leechers);
        result.pex = parse_compact_peers(&response[20..]);
        Ok(result)
    }

    pub async fn scrape(&mut self, req: &ScrapeRequest) -> Result<ScrapeResponse, TrackerError> {
        let connection_id = self
            .connection_id
            .ok_or_else(|| TrackerError::InvalidResponse("not connected".into()))?;

        let transaction_id: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(16 + req.info_hashes.len() * 20);
        request.extend_from_slice(&connection_id.to_be_bytes());
        request.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());
        for info_hash in &req.info_hashes {
            request.extend_from_slice(info_hash.as_bytes());
        }

        let response = self.send_and_receive(&request, 8).await?;
        let (action, tid) = parse_header(&response)?;

        if action == ACTION_ERROR {
            return Err(TrackerError::Failure(
                String::from_utf8_lossy(&response[8..]).into_owned(),
            ));
        }
        if action != ACTION_SCRAPE || tid != transaction_id {
            return Err(TrackerError::InvalidResponse(
                "scrape response mismatch".into(),
            ));
        }

        // rows come back in request order, 12 bytes each
        let mut result = ScrapeResponse::for_request(req);
        for (i, chunk) in response[8..].chunks_exact(12).enumerate() {
            let Some(row) = result.rows.get_mut(i) else {
                break;
            };
            row.seeders = Some(read_u32(&chunk[0..4]));
            row.downloads = Some(read_u32(&chunk[4..8]));
            row.leechers = Some(read_u32(&chunk[8..12]));
        }
        Ok(result)
    }

    async fn send_and_receive(
        &self,
        request: &[u8],
        min_response_size: usize,
    ) -> Result<Vec<u8>, TrackerError> {
        let mut buf = vec![0u8; 4096];

        for attempt in 0..MAX_RETRIES {
            self.socket.send(request).await?;

            let timeout_duration = UDP_TIMEOUT * (1 << attempt);
            match timeout(timeout_duration, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) if n >= min_response_size => return Ok(buf[..n].to_vec()),
                Ok(Ok(_)) => {
                    return Err(TrackerError::InvalidResponse("response too short".into()))
                }
                Ok(Err(e)) => return Err(TrackerError::Io(e)),
                Err(_) => continue,
            }
        }

        Err(TrackerError::Timeout)
    }
}

fn parse_header(response: &[u8]) -> Result<(u32, u32), TrackerError> {
    if response.len() < 8 {
        return Err(TrackerError::InvalidResponse("header too short".into()));
    }
    Ok((read_u32(&response[0..4]), read_u32(&response[4..8])))
}

// callers have already checked the slice length
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

async fn resolve_udp_url(url: &str) -> Result<SocketAddr, TrackerError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
    let authority = rest.split('/').next().unwrap_or(rest);

    if let Ok(addr) = authority.parse() {
        return Ok(addr);
    }

    tokio::net::lookup_host(authority)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))
}
