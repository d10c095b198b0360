//! HTTP(S) announce and scrape ([BEP-3], [BEP-48]).
//!
//! Requests are plain GETs with percent-encoded query parameters; responses
//! are bencoded. Transport failures never surface as `Err`: they are folded
//! into the response shape (`did_connect`, `did_timeout`, `errmsg`) so the
//! announcer handles every outcome through one path.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-48]: http://bittorrent.org/beps/bep_0048.html

use std::time::Duration;

use reqwest::Client;

use crate::bencode::{decode, Value};
use crate::metainfo::InfoHash;

use super::error::TrackerError;
use super::response::{
    parse_compact_peers, parse_compact_peers6, AnnounceRequest, AnnounceResponse, ScrapeRequest,
    ScrapeResponse, TrackerEvent,
};

/// Long-poll trackers exist; give them room.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

const USER_AGENT: &str = concat!("shoal/", env!("CARGO_PKG_VERSION"));

pub struct HttpTrackerClient {
    client: Client,
}

impl HttpTrackerClient {
    pub fn new() -> Result<Self, TrackerError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> AnnounceResponse {
        let url = announce_url(request);

        let body = match self.fetch(&url).await {
            Ok(body) => body,
            Err(e) => return announce_failure(request.info_hash, &e),
        };

        match parse_announce_response(request.info_hash, &body) {
            Ok(response) => response,
            Err(e) => {
                let mut response = AnnounceResponse::new(request.info_hash);
                response.errmsg = Some(e.to_string());
                response
            }
        }
    }

    pub async fn scrape(&self, request: &ScrapeRequest) -> ScrapeResponse {
        let url = scrape_url(request);

        let body = match self.fetch(&url).await {
            Ok(body) => body,
            Err(e) => {
                let mut response = ScrapeResponse::for_request(request);
                match e {
                    FetchError::Timeout => response.did_timeout = true,
                    FetchError::Connect => response.did_connect = false,
                    FetchError::Other(msg) => response.errmsg = Some(msg),
                }
                return response;
            }
        };

        match parse_scrape_response(request, &body) {
            Ok(response) => response,
            Err(e) => {
                let mut response = ScrapeResponse::for_request(request);
                response.errmsg = Some(e.to_string());
                response
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await.map_err(FetchError::from)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(FetchError::from)?;

        // tracker errors often ride on a non-200 with a text body
        if !status.is_success() && bytes.is_empty() {
            return Err(FetchError::Other(format!("http status {}", status.as_u16())));
        }
        Ok(bytes.to_vec())
    }
}

enum FetchError {
    Timeout,
    Connect,
    Other(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_connect() {
            FetchError::Connect
        } else {
            FetchError::Other(e.to_string())
        }
    }
}

fn announce_failure(info_hash: InfoHash, e: &FetchError) -> AnnounceResponse {
    match e {
        FetchError::Timeout => AnnounceResponse::timed_out(info_hash),
        FetchError::Connect => AnnounceResponse::no_connect(info_hash),
        FetchError::Other(msg) => {
            let mut response = AnnounceResponse::new(info_hash);
            response.errmsg = Some(msg.clone());
            response
        }
    }
}

/// Builds the announce GET URL. Field order follows convention so tracker
/// logs stay greppable.
pub(super) fn announce_url(req: &AnnounceRequest) -> String {
    use std::fmt::Write as _;

    let mut url = req.announce_url.clone();
    url.push(if url.contains('?') { '&' } else { '?' });

    let _ = write!(
        url,
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&numwant={}&key={:x}&compact=1&supportcrypto=1",
        url_encode(req.info_hash.as_bytes()),
        url_encode(req.peer_id.as_bytes()),
        req.port,
        req.up,
        req.down,
        req.left,
        req.numwant,
        req.key,
    );

    if req.corrupt > 0 {
        let _ = write!(url, "&corrupt={}", req.corrupt);
    }
    let event = req.event.as_str();
    if !event.is_empty() {
        let _ = write!(url, "&event={}", event);
    }
    if req.partial_seed && req.event != TrackerEvent::Stopped {
        url.push_str("&event=paused");
    }
    if let Some(tracker_id) = &req.tracker_id {
        let _ = write!(url, "&trackerid={}", url_encode(tracker_id.as_bytes()));
    }

    url
}

pub(super) fn scrape_url(req: &ScrapeRequest) -> String {
    use std::fmt::Write as _;

    let mut url = req.scrape_url.clone();
    let mut delimiter = if url.contains('?') { '&' } else { '?' };
    for info_hash in &req.info_hashes {
        let _ = write!(url, "{}info_hash={}", delimiter, url_encode(info_hash.as_bytes()));
        delimiter = '&';
    }
    url
}

pub(super) fn parse_announce_response(
    info_hash: InfoHash,
    body: &[u8],
) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(body)?;
    if value.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("expected dict".into()));
    }

    let mut response = AnnounceResponse::new(info_hash);

    if let Some(failure) = value.get_str(b"failure reason") {
        response.errmsg = Some(failure.to_string());
        return Ok(response);
    }

    response.warning = value.get_str(b"warning message").map(String::from);
    response.interval = value.get_int(b"interval").unwrap_or(0).max(0) as u32;
    response.min_interval = value.get_int(b"min interval").unwrap_or(0).max(0) as u32;
    response.tracker_id = value.get_str(b"tracker id").map(String::from);
    response.seeders = value.get_int(b"complete").map(|n| n.max(0) as u32);
    response.leechers = value.get_int(b"incomplete").map(|n| n.max(0) as u32);
    response.downloads = value.get_int(b"downloaded").map(|n| n.max(0) as u32);

    if let Some(peers) = value.get(b"peers") {
        if let Some(compact) = peers.as_bytes() {
            response.pex = parse_compact_peers(compact);
        } else if let Some(list) = peers.as_list() {
            // non-compact dict-model peers
            for peer in list {
                let ip = peer.get_str(b"ip").and_then(|s| s.parse().ok());
                let port = peer.get_int(b"port").map(|p| p as u16);
                if let (Some(ip), Some(port)) = (ip, port) {
                    response.pex.push(std::net::SocketAddr::new(ip, port));
                }
            }
        }
    }

    if let Some(compact6) = value.get_bytes(b"peers6") {
        response.pex6 = parse_compact_peers6(compact6);
    }

    Ok(response)
}

pub(super) fn parse_scrape_response(
    request: &ScrapeRequest,
    body: &[u8],
) -> Result<ScrapeResponse, TrackerError> {
    let value = decode(body)?;
    if value.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("expected dict".into()));
    }

    let mut response = ScrapeResponse::for_request(request);

    if let Some(failure) = value.get_str(b"failure reason") {
        response.errmsg = Some(failure.to_string());
        return Ok(response);
    }

    if let Some(flags) = value.get(b"flags") {
        response.min_request_interval =
            flags.get_int(b"min_request_interval").unwrap_or(0).max(0) as u32;
    }

    let files = value
        .get(b"files")
        .and_then(Value::as_dict)
        .ok_or_else(|| TrackerError::InvalidResponse("missing files".into()))?;

    for (hash_bytes, stats) in files {
        let Ok(info_hash) = InfoHash::from_bytes(hash_bytes) else {
            continue;
        };
        // rows we didn't ask about are dropped
        let Some(row) = response.row_mut(&info_hash) else {
            continue;
        };
        row.seeders = stats.get_int(b"complete").map(|n| n.max(0) as u32);
        row.leechers = stats.get_int(b"incomplete").map(|n| n.max(0) as u32);
        row.downloads = stats.get_int(b"downloaded").map(|n| n.max(0) as u32);
        row.downloaders = stats.get_int(b"downloaders").map(|n| n.max(0) as u32);
    }

    Ok(response)
}

/// Percent-encodes everything outside the unreserved set.
pub(super) fn url_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    bytes.iter().fold(String::with_capacity(bytes.len() * 3), |mut s, &b| {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            s.push(b as char);
        } else {
            let _ = write!(s, "%{:02X}", b);
        }
        s
    })
}
