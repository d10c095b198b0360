//! Tracker transports ([BEP-3], [BEP-15], [BEP-48]).
//!
//! HTTP(S) and UDP announce/scrape clients behind one dispatcher. The
//! transport is chosen once per request from the URL scheme, and both
//! transports produce the same response shape: failures are folded into
//! `did_connect` / `did_timeout` / `errmsg` fields rather than surfaced as
//! errors, so the announcer's response handling has a single path.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-15]: http://bittorrent.org/beps/bep_0015.html
//! [BEP-48]: http://bittorrent.org/beps/bep_0048.html

mod error;
mod http;
mod response;
mod udp;

pub use error::TrackerError;
pub use http::HttpTrackerClient;
pub use response::{
    parse_compact_peers, parse_compact_peers6, scrape_url_for_announce, tracker_key,
    tracker_sitename, AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse, ScrapeRow,
    TrackerEvent,
};
pub use udp::UdpTracker;

use crate::metainfo::InfoHash;


/// Scheme-dispatching client used by the announcer.
pub struct TrackerClient {
    http: HttpTrackerClient,
}

impl TrackerClient {
    pub fn new() -> Result<Self, TrackerError> {
        Ok(Self {
            http: HttpTrackerClient::new()?,
        })
    }

    pub async fn announce(&self, request: AnnounceRequest) -> AnnounceResponse {
        if is_http(&request.announce_url) {
            self.http.announce(&request).await
        } else if is_udp(&request.announce_url) {
            match self.udp_announce(&request).await {
                Ok(response) => response,
                Err(e) => udp_failure_announce(request.info_hash, e),
            }
        } else {
            let mut response = AnnounceResponse::new(request.info_hash);
            response.errmsg = Some(format!("unsupported url: {}", request.announce_url));
            response
        }
    }

    pub async fn scrape(&self, request: ScrapeRequest) -> ScrapeResponse {
        if is_http(&request.scrape_url) {
            self.http.scrape(&request).await
        } else if is_udp(&request.scrape_url) {
            match self.udp_scrape(&request).await {
                Ok(response) => response,
                Err(e) => udp_failure_scrape(&request, e),
            }
        } else {
            let mut response = ScrapeResponse::for_request(&request);
            response.errmsg = Some(format!("unsupported url: {}", request.scrape_url));
            response
        }
    }

    async fn udp_announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let mut tracker = UdpTracker::connect(&request.announce_url).await?;
        tracker.announce(request).await
    }

    async fn udp_scrape(&self, request: &ScrapeRequest) -> Result<ScrapeResponse, TrackerError> {
        let mut tracker = UdpTracker::connect(&request.scrape_url).await?;
        tracker.scrape(request).await
    }
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn is_udp(url: &str) -> bool {
    url.starts_with("udp://")
}

fn udp_failure_announce(info_hash: InfoHash, e: TrackerError) -> AnnounceResponse {
    match e {
        TrackerError::Timeout => AnnounceResponse::timed_out(info_hash),
        TrackerError::Io(_) | TrackerError::InvalidUrl(_) => {
            AnnounceResponse::no_connect(info_hash)
        }
        other => {
            let mut response = AnnounceResponse::new(info_hash);
            response.errmsg = Some(other.to_string());
            response
        }
    }
}

fn udp_failure_scrape(request: &ScrapeRequest, e: TrackerError) -> ScrapeResponse {
    let mut response = ScrapeResponse::for_request(request);
    match e {
        TrackerError::Timeout => response.did_timeout = true,
        TrackerError::Io(_) | TrackerError::InvalidUrl(_) => response.did_connect = false,
        other => response.errmsg = Some(other.to_string()),
    }
    response
}
