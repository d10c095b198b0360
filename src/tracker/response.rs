use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::metainfo::InfoHash;
use crate::peer::PeerId;

/// Why we're announcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrackerEvent {
    None,
    Completed,
    Started,
    Stopped,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    pub fn as_udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

/// Everything one announce needs, independent of transport.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub announce_url: String,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub up: u64,
    pub down: u64,
    pub corrupt: u64,
    pub left: u64,
    pub event: TrackerEvent,
    pub numwant: u32,
    /// Session-wide random key so trackers can match us across IP changes.
    pub key: u32,
    pub partial_seed: bool,
    /// Opaque token the tracker handed us in a prior response.
    pub tracker_id: Option<String>,
}

/// One shape for every transport's announce result. Failures are folded in
/// (`did_connect` / `did_timeout` / `errmsg`) so the caller has a single
/// path to walk.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub info_hash: InfoHash,
    pub did_connect: bool,
    pub did_timeout: bool,
    pub interval: u32,
    pub min_interval: u32,
    pub tracker_id: Option<String>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub downloads: Option<u32>,
    pub pex: Vec<SocketAddr>,
    pub pex6: Vec<SocketAddr>,
    pub warning: Option<String>,
    pub errmsg: Option<String>,
}

impl AnnounceResponse {
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            did_connect: true,
            did_timeout: false,
            interval: 0,
            min_interval: 0,
            tracker_id: None,
            seeders: None,
            leechers: None,
            downloads: None,
            pex: Vec::new(),
            pex6: Vec::new(),
            warning: None,
            errmsg: None,
        }
    }

    pub fn no_connect(info_hash: InfoHash) -> Self {
        let mut r = Self::new(info_hash);
        r.did_connect = false;
        r
    }

    pub fn timed_out(info_hash: InfoHash) -> Self {
        let mut r = Self::new(info_hash);
        r.did_timeout = true;
        r
    }
}

/// One multiscrape request: several info-hashes against one scrape URL.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub scrape_url: String,
    pub info_hashes: Vec<InfoHash>,
}

#[derive(Debug, Clone)]
pub struct ScrapeRow {
    pub info_hash: InfoHash,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub downloads: Option<u32>,
    pub downloaders: Option<u32>,
}

impl ScrapeRow {
    fn empty(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            seeders: None,
            leechers: None,
            downloads: None,
            downloaders: None,
        }
    }
}

/// Result of one scrape request. `rows` always holds one entry per
/// *requested* info-hash (on failure the stats are simply absent), so the
/// announcer can settle every tier it marked as scraping.
#[derive(Debug, Clone)]
pub struct ScrapeResponse {
    pub scrape_url: String,
    pub did_connect: bool,
    pub did_timeout: bool,
    pub rows: Vec<ScrapeRow>,
    pub min_request_interval: u32,
    pub errmsg: Option<String>,
}

impl ScrapeResponse {
    pub fn for_request(request: &ScrapeRequest) -> Self {
        Self {
            scrape_url: request.scrape_url.clone(),
            did_connect: true,
            did_timeout: false,
            rows: request.info_hashes.iter().copied().map(ScrapeRow::empty).collect(),
            min_request_interval: 0,
            errmsg: None,
        }
    }

    /// How many info-hashes the request carried.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row_mut(&mut self, info_hash: &InfoHash) -> Option<&mut ScrapeRow> {
        self.rows.iter_mut().find(|r| r.info_hash == *info_hash)
    }
}

/// Derives the scrape URL for an announce URL per the scrape convention:
/// the text after the last `/` must start with `announce`, which is swapped
/// for `scrape`. Trackers without that shape don't support scraping.
pub fn scrape_url_for_announce(announce_url: &str) -> Option<String> {
    let slash = announce_url.rfind('/')?;
    let tail = &announce_url[slash + 1..];
    if !tail.starts_with("announce") {
        return None;
    }
    Some(format!(
        "{}scrape{}",
        &announce_url[..slash + 1],
        &tail["announce".len()..]
    ))
}

/// `host:port` identity used to group trackers, with scheme-default ports.
pub fn tracker_key(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some(parts) => parts,
        None => return url.to_string(),
    };
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    if authority.rsplit(':').next().is_some_and(|p| p.parse::<u16>().is_ok()) {
        authority.to_string()
    } else {
        let port = match scheme {
            "https" => 443,
            "udp" => 6969,
            _ => 80,
        };
        format!("{}:{}", authority, port)
    }
}

/// Human-readable tracker name: the authority without the port.
pub fn tracker_sitename(url: &str) -> String {
    let key = tracker_key(url);
    key.split(':').next().unwrap_or(&key).to_string()
}

pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

pub fn parse_compact_peers6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|chunk| {
            let mut ip_bytes = [0u8; 16];
            ip_bytes.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip_bytes)), port)
        })
        .collect()
}
