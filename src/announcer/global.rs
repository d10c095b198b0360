//! Session-scoped announce and scrape scheduling.
//!
//! The announcer owns per-torrent tier state and decides, on each upkeep
//! tick, which trackers to talk to. It is transport-agnostic: `upkeep`
//! returns the requests to perform and the driver feeds results back
//! through `on_announce_done` / `on_scrape_done`, which re-resolve the
//! live tier by `(info_hash, tier_id)` and quietly no-op when the torrent
//! has been removed in the meantime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info};

use crate::metainfo::InfoHash;
use crate::peer::PeerId;
use crate::tracker::{
    AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse, TrackerEvent,
};

use super::tier::{Tier, BYTES_CORRUPT, BYTES_DOWN, BYTES_UP, DEFAULT_SCRAPE_INTERVAL_SEC};

/// How often the session services the announcer.
pub const UPKEEP_INTERVAL: Duration = Duration::from_millis(500);

pub const MAX_ANNOUNCES_PER_UPKEEP: usize = 20;
pub const MAX_SCRAPES_PER_UPKEEP: usize = 20;

/// Starting cap on info-hashes per scrape request.
pub const MULTISCRAPE_MAX: usize = 60;
const MULTISCRAPE_STEP: usize = 5;

const NUMWANT: u32 = 80;

/// Snapshot of the torrent state an announce needs, provided by the owner.
#[derive(Debug, Clone, Copy)]
pub struct TorrentStats {
    pub left: u64,
    pub is_partial_seed: bool,
    pub is_done: bool,
    pub is_running: bool,
}

pub type StatsFn = Box<dyn Fn() -> TorrentStats + Send + Sync>;
pub type PublishFn = Box<dyn Fn(TrackerUpdate) + Send + Sync>;

/// What a tracker response told us, published to the torrent's owner.
#[derive(Debug, Clone)]
pub enum TrackerUpdate {
    /// A peer list, with whatever swarm counts rode along.
    Peers {
        seeders: Option<u32>,
        leechers: Option<u32>,
        pex: Vec<SocketAddr>,
    },
    /// Swarm counts only.
    Counts {
        seeders: Option<u32>,
        leechers: Option<u32>,
    },
    Warning(String),
    Error(String),
    ErrorClear,
}

/// Decides whether a scrape error means "request URI too long".
///
/// Trackers phrase this differently; keeping the substrings injectable
/// means a misbehaving tracker is a config change, not a code change.
pub struct MultiscrapePolicy {
    too_long_errors: Vec<String>,
}

impl Default for MultiscrapePolicy {
    fn default() -> Self {
        Self {
            too_long_errors: vec![
                "Bad Request".to_string(),
                "GET string too long".to_string(),
                "Request-URI Too Long".to_string(),
            ],
        }
    }
}

impl MultiscrapePolicy {
    pub fn new(too_long_errors: Vec<String>) -> Self {
        Self { too_long_errors }
    }

    pub fn is_too_big_error(&self, errmsg: &str) -> bool {
        self.too_long_errors.iter().any(|s| errmsg.contains(s))
    }
}

/// Trackers sharing a scrape URL share this; `multiscrape_max` only ever
/// shrinks.
struct ScrapeInfo {
    multiscrape_max: usize,
}

struct TorrentAnnouncer {
    info_hash: InfoHash,
    peer_id: PeerId,
    tiers: Vec<Tier>,
    stats: StatsFn,
    publish: PublishFn,
}

impl TorrentAnnouncer {
    fn tier_mut(&mut self, tier_id: u32) -> Option<&mut Tier> {
        self.tiers.iter_mut().find(|t| t.id == tier_id)
    }

    fn tracker_count(&self) -> usize {
        self.tiers.iter().map(|t| t.trackers.len()).sum()
    }
}

/// One announce for the driver to perform; the identifiers let the result
/// find its way back to a live tier, or nowhere.
pub struct AnnounceTask {
    pub info_hash: InfoHash,
    pub tier_id: u32,
    pub event: TrackerEvent,
    pub is_running_on_success: bool,
    pub request: AnnounceRequest,
}

/// The work one upkeep tick produced. Stops go out first, then scrapes,
/// then announces; scrape results inform the next tick's announce order.
#[derive(Default)]
pub struct Upkeep {
    pub stops: Vec<AnnounceRequest>,
    pub scrapes: Vec<ScrapeRequest>,
    pub announces: Vec<AnnounceTask>,
}

pub struct Announcer {
    torrents: HashMap<InfoHash, TorrentAnnouncer>,
    scrape_info: HashMap<String, ScrapeInfo>,

    /// Final `stopped` announces for removed torrents, deduped by
    /// `(info_hash, announce_url)`, flushed biggest-traffic-first.
    stops: Vec<AnnounceRequest>,

    /// Random 31-bit key sent with every announce.
    key: u32,
    port: u16,
    scrape_paused_torrents: bool,
    policy: MultiscrapePolicy,

    next_tier_id: u32,
    next_tracker_id: u32,
}

impl Announcer {
    pub fn new(port: u16) -> Self {
        Self {
            torrents: HashMap::new(),
            scrape_info: HashMap::new(),
            stops: Vec::new(),
            key: rand::random::<u32>() & 0x7fff_ffff,
            port,
            scrape_paused_torrents: true,
            policy: MultiscrapePolicy::default(),
            next_tier_id: 0,
            next_tracker_id: 0,
        }
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn set_scrape_paused_torrents(&mut self, enabled: bool) {
        self.scrape_paused_torrents = enabled;
    }

    pub fn set_multiscrape_policy(&mut self, policy: MultiscrapePolicy) {
        self.policy = policy;
    }

    pub fn multiscrape_max(&self, scrape_url: &str) -> usize {
        self.scrape_info
            .get(scrape_url)
            .map(|info| info.multiscrape_max)
            .unwrap_or(MULTISCRAPE_MAX)
    }

    // ------------------------------------------------------------------
    // Torrent registration
    // ------------------------------------------------------------------

    pub fn add_torrent(
        &mut self,
        info_hash: InfoHash,
        peer_id: PeerId,
        announce_tiers: &[Vec<String>],
        now: u64,
        stats: StatsFn,
        publish: PublishFn,
    ) {
        let mut tiers = Vec::with_capacity(announce_tiers.len());
        for urls in announce_tiers {
            if urls.is_empty() {
                continue;
            }
            let tier_id = self.next_tier_id;
            self.next_tier_id += 1;
            let mut tier = Tier::new(tier_id, urls, &mut self.next_tracker_id);

            for tracker in &tier.trackers {
                if let Some(scrape_url) = &tracker.scrape_url {
                    self.scrape_info
                        .entry(scrape_url.clone())
                        .or_insert(ScrapeInfo {
                            multiscrape_max: MULTISCRAPE_MAX,
                        });
                }
            }

            tier.scrape_soon(now, self.scrape_paused_torrents);
            tiers.push(tier);
        }

        self.torrents.insert(
            info_hash,
            TorrentAnnouncer {
                info_hash,
                peer_id,
                tiers,
                stats,
                publish,
            },
        );
    }

    /// Removes the torrent, queueing a final `stopped` for each running
    /// tier. The stops set keeps at most one request per tracker URL.
    pub fn remove_torrent(&mut self, info_hash: &InfoHash) {
        let Some(ta) = self.torrents.get(info_hash) else {
            return;
        };

        let mut new_stops = Vec::new();
        for tier in &ta.tiers {
            if !tier.is_running {
                continue;
            }
            if let Some(request) = build_request(self, ta, tier, TrackerEvent::Stopped) {
                new_stops.push(request);
            }
        }

        for request in new_stops {
            let duplicate = self.stops.iter().any(|s| {
                s.info_hash == request.info_hash && s.announce_url == request.announce_url
            });
            if !duplicate {
                self.stops.push(request);
            }
        }

        self.torrents.remove(info_hash);
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }

    // ------------------------------------------------------------------
    // Event entry points
    // ------------------------------------------------------------------

    pub fn torrent_started(&mut self, info_hash: &InfoHash, now: u64) {
        self.push_event_to_all_tiers(info_hash, TrackerEvent::Started, now);
    }

    pub fn torrent_stopped(&mut self, info_hash: &InfoHash, now: u64) {
        self.push_event_to_all_tiers(info_hash, TrackerEvent::Stopped, now);
    }

    pub fn torrent_completed(&mut self, info_hash: &InfoHash, now: u64) {
        self.push_event_to_all_tiers(info_hash, TrackerEvent::Completed, now);
    }

    pub fn manual_announce(&mut self, info_hash: &InfoHash, now: u64) {
        self.push_event_to_all_tiers(info_hash, TrackerEvent::None, now);
    }

    /// A port change re-introduces us to every tracker.
    pub fn port_changed(&mut self, port: u16, now: u64) {
        self.port = port;
        let hashes: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for info_hash in hashes {
            self.torrent_started(&info_hash, now);
        }
    }

    pub fn can_manual_announce(&self, info_hash: &InfoHash, now: u64) -> bool {
        self.torrents
            .get(info_hash)
            .is_some_and(|ta| ta.tiers.iter().any(|t| t.can_manual_announce(now)))
    }

    /// Counts bytes toward every tier's next announce.
    pub fn add_bytes(&mut self, info_hash: &InfoHash, kind: usize, bytes: u64) {
        debug_assert!(kind <= BYTES_CORRUPT);
        if let Some(ta) = self.torrents.get_mut(info_hash) {
            for tier in &mut ta.tiers {
                tier.byte_counts[kind] += bytes;
            }
        }
    }

    fn push_event_to_all_tiers(&mut self, info_hash: &InfoHash, event: TrackerEvent, now: u64) {
        if let Some(ta) = self.torrents.get_mut(info_hash) {
            for tier in &mut ta.tiers {
                tier.push_announce_event(event, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Upkeep
    // ------------------------------------------------------------------

    /// One scheduler tick: flush queued stops, batch due scrapes, pick the
    /// most deserving announces.
    pub fn upkeep(&mut self, now: u64) -> Upkeep {
        let stops = self.flush_stops();
        let scrapes = self.collect_scrapes(now);
        let announces = self.collect_announces(now);

        Upkeep {
            stops,
            scrapes,
            announces,
        }
    }

    /// Queued `stopped` requests, biggest traffic first so the heaviest
    /// contributors report their stats even if shutdown is cut short.
    pub fn flush_stops(&mut self) -> Vec<AnnounceRequest> {
        let mut stops = std::mem::take(&mut self.stops);
        stops.sort_by(|a, b| {
            (b.up + b.down)
                .cmp(&(a.up + a.down))
                .then_with(|| a.info_hash.cmp(&b.info_hash))
                .then_with(|| a.announce_url.cmp(&b.announce_url))
        });
        stops
    }

    // Group scrape-ready tiers by scrape URL, packing up to the URL's
    // multiscrape cap per request and at most MaxScrapesPerUpkeep requests.
    fn collect_scrapes(&mut self, now: u64) -> Vec<ScrapeRequest> {
        let mut requests: Vec<ScrapeRequest> = Vec::new();

        for ta in self.torrents.values_mut() {
            for tier in &mut ta.tiers {
                if !tier.needs_to_scrape(now) {
                    continue;
                }
                let Some(scrape_url) = tier
                    .current_tracker()
                    .and_then(|t| t.scrape_url.clone())
                else {
                    continue;
                };
                let max = self
                    .scrape_info
                    .get(&scrape_url)
                    .map(|i| i.multiscrape_max)
                    .unwrap_or(MULTISCRAPE_MAX);

                let slot = requests
                    .iter()
                    .position(|r| r.scrape_url == scrape_url && r.info_hashes.len() < max);

                match slot {
                    Some(i) => requests[i].info_hashes.push(ta.info_hash),
                    None => {
                        if requests.len() >= MAX_SCRAPES_PER_UPKEEP {
                            continue;
                        }
                        requests.push(ScrapeRequest {
                            scrape_url,
                            info_hashes: vec![ta.info_hash],
                        });
                    }
                }

                tier.is_scraping = true;
                tier.last_scrape_start_time = now;
            }
        }

        requests
    }

    fn collect_announces(&mut self, now: u64) -> Vec<AnnounceTask> {
        struct Key {
            info_hash: InfoHash,
            tier_id: u32,
            priority: Option<TrackerEvent>,
            downloaders: u32,
            is_done: bool,
            traffic: u64,
            announce_at: u64,
        }

        let mut keys: Vec<Key> = Vec::new();
        for ta in self.torrents.values() {
            let stats = (ta.stats)();
            for tier in &ta.tiers {
                if !tier.needs_to_announce(now) {
                    continue;
                }
                keys.push(Key {
                    info_hash: ta.info_hash,
                    tier_id: tier.id,
                    priority: tier.announce_event_priority(),
                    downloaders: tier.count_downloaders(),
                    is_done: stats.is_done,
                    traffic: tier.byte_counts[BYTES_UP] + tier.byte_counts[BYTES_DOWN],
                    announce_at: tier.announce_at,
                });
            }
        }

        // urgent events first, then swarms we could upload to, then swarms
        // we still need, then heavier traffic, then longest-waiting
        keys.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.downloaders.cmp(&a.downloaders))
                .then_with(|| a.is_done.cmp(&b.is_done))
                .then_with(|| b.traffic.cmp(&a.traffic))
                .then_with(|| a.announce_at.cmp(&b.announce_at))
                .then_with(|| a.tier_id.cmp(&b.tier_id))
        });
        keys.truncate(MAX_ANNOUNCES_PER_UPKEEP);

        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(task) = self.start_announce(&key.info_hash, key.tier_id, now) else {
                continue;
            };
            tasks.push(task);
        }
        tasks
    }

    fn start_announce(
        &mut self,
        info_hash: &InfoHash,
        tier_id: u32,
        now: u64,
    ) -> Option<AnnounceTask> {
        let key = self.key;
        let port = self.port;

        let ta = self.torrents.get_mut(info_hash)?;
        let stats = (ta.stats)();
        let peer_id = ta.peer_id;
        let tier = ta.tier_mut(tier_id)?;

        let event = tier.pull_announce_event()?;
        let request = build_request_inner(key, port, *info_hash, peer_id, &stats, tier, event)?;

        tier.is_announcing = true;
        tier.last_announce_start_time = now;

        debug!(info_hash = %info_hash, tier = tier_id, event = event.as_str(), "announcing");

        Some(AnnounceTask {
            info_hash: *info_hash,
            tier_id,
            event,
            is_running_on_success: stats.is_running,
            request,
        })
    }

    // ------------------------------------------------------------------
    // Response handling
    // ------------------------------------------------------------------

    pub fn on_announce_done(
        &mut self,
        tier_id: u32,
        event: TrackerEvent,
        is_running_on_success: bool,
        response: &AnnounceResponse,
        now: u64,
    ) {
        let scrape_paused = self.scrape_paused_torrents;
        let Some(ta) = self.torrents.get_mut(&response.info_hash) else {
            return; // removed while the request was in flight
        };
        let tracker_count = ta.tracker_count();
        let TorrentAnnouncer { tiers, publish, .. } = ta;
        let Some(tier) = tiers.iter_mut().find(|t| t.id == tier_id) else {
            return;
        };

        tier.last_announce_time = now;
        tier.last_announce_timed_out = response.did_timeout;
        tier.last_announce_succeeded = false;
        tier.is_announcing = false;
        tier.manual_announce_allowed_at = now + tier.announce_min_interval_sec as u64;

        if !response.did_connect {
            announce_error(tier, "Could not connect to tracker", event, now);
            return;
        }
        if response.did_timeout {
            announce_error(tier, "Tracker did not respond", event, now);
            return;
        }
        if let Some(errmsg) = &response.errmsg {
            // one dead tracker in a well-stocked torrent isn't worth
            // alarming the user over
            if tracker_count < 2 {
                publish(TrackerUpdate::Error(errmsg.clone()));
            }
            announce_error(tier, errmsg, event, now);
            return;
        }

        let is_stopped = event == TrackerEvent::Stopped;
        publish(TrackerUpdate::ErrorClear);

        let mut scrape_fields = 0;
        let mut has_scrape_url = false;
        if let Some(tracker) = tier.current_tracker_mut() {
            tracker.consecutive_failures = 0;
            has_scrape_url = tracker.scrape_url.is_some();

            if let Some(seeders) = response.seeders {
                tracker.seeder_count = Some(seeders);
                scrape_fields += 1;
            }
            if let Some(leechers) = response.leechers {
                tracker.leecher_count = Some(leechers);
                scrape_fields += 1;
            }
            if let Some(downloads) = response.downloads {
                tracker.download_count = Some(downloads);
                scrape_fields += 1;
            }
            if let Some(tracker_id) = &response.tracker_id {
                tracker.tracker_id = Some(tracker_id.clone());
            }
        }

        match &response.warning {
            Some(warning) => {
                tier.last_announce_str = warning.clone();
                publish(TrackerUpdate::Warning(warning.clone()));
            }
            None => tier.last_announce_str = "Success".to_string(),
        }

        if response.min_interval != 0 {
            tier.announce_min_interval_sec = response.min_interval;
        }
        if response.interval != 0 {
            tier.announce_interval_sec = response.interval;
        }

        if !response.pex.is_empty() {
            publish(TrackerUpdate::Peers {
                seeders: response.seeders,
                leechers: response.leechers,
                pex: response.pex.clone(),
            });
        }
        if !response.pex6.is_empty() {
            publish(TrackerUpdate::Peers {
                seeders: response.seeders,
                leechers: response.leechers,
                pex: response.pex6.clone(),
            });
        }
        publish(TrackerUpdate::Counts {
            seeders: response.seeders,
            leechers: response.leechers,
        });

        tier.is_running = is_running_on_success;

        // an announce response that carried scrape fields makes a separate
        // scrape redundant
        if scrape_fields >= 3 || (scrape_fields >= 1 && !has_scrape_url) {
            tier.schedule_next_scrape(now, scrape_paused);
            tier.last_scrape_time = now;
            tier.last_scrape_succeeded = true;
        } else if tier.last_scrape_time + tier.scrape_interval_sec as u64 <= now {
            tier.scrape_soon(now, scrape_paused);
        }

        tier.last_announce_succeeded = true;
        tier.last_announce_peer_count = response.pex.len() + response.pex6.len();

        if is_stopped {
            // the tracker has acknowledged these
            tier.byte_counts = [0; 3];
        }

        if !is_stopped && !tier.has_pending_events() {
            let interval = tier.announce_interval_sec as u64;
            debug!(tier = tier_id, interval, "queueing periodic reannounce");
            tier.push_announce_event(TrackerEvent::None, now + interval);
        }
    }

    pub fn on_scrape_done(&mut self, response: &ScrapeResponse, now: u64) {
        let scrape_paused = self.scrape_paused_torrents;

        for row in &response.rows {
            let Some(ta) = self.torrents.get_mut(&row.info_hash) else {
                continue;
            };
            let TorrentAnnouncer { tiers, publish, .. } = ta;
            let Some(tier) = tiers.iter_mut().find(|t| {
                t.current_tracker()
                    .and_then(|tracker| tracker.scrape_url.as_deref())
                    == Some(response.scrape_url.as_str())
            }) else {
                continue;
            };

            tier.is_scraping = false;
            tier.last_scrape_time = now;
            tier.last_scrape_succeeded = false;
            tier.last_scrape_timed_out = response.did_timeout;

            if !response.did_connect {
                scrape_error(tier, "Could not connect to tracker", now, scrape_paused);
            } else if response.did_timeout {
                scrape_error(tier, "Tracker did not respond", now, scrape_paused);
            } else if let Some(errmsg) = &response.errmsg {
                scrape_error(tier, errmsg, now, scrape_paused);
            } else {
                tier.last_scrape_succeeded = true;
                tier.scrape_interval_sec =
                    DEFAULT_SCRAPE_INTERVAL_SEC.max(response.min_request_interval);
                tier.schedule_next_scrape(now, scrape_paused);

                if let Some(tracker) = tier.current_tracker_mut() {
                    if row.seeders.is_some() {
                        tracker.seeder_count = row.seeders;
                    }
                    if row.leechers.is_some() {
                        tracker.leecher_count = row.leechers;
                    }
                    if row.downloads.is_some() {
                        tracker.download_count = row.downloads;
                    }
                    tracker.downloader_count = row.downloaders;
                    tracker.consecutive_failures = 0;
                }

                if row.seeders.is_some() && row.leechers.is_some() && row.downloads.is_some() {
                    publish(TrackerUpdate::Counts {
                        seeders: row.seeders,
                        leechers: row.leechers,
                    });
                }
            }
        }

        self.check_multiscrape_max(response);
    }

    // Shrink the per-URL batch cap when the tracker balked at the URL
    // length. At most one shrink per cap generation: if another response
    // from the same batch already lowered it below our row count, leave it.
    fn check_multiscrape_max(&mut self, response: &ScrapeResponse) {
        let Some(errmsg) = &response.errmsg else {
            return;
        };
        if !self.policy.is_too_big_error(errmsg) {
            return;
        }
        let Some(info) = self.scrape_info.get_mut(&response.scrape_url) else {
            return;
        };

        if info.multiscrape_max < response.row_count() {
            return;
        }

        let n = (info.multiscrape_max.saturating_sub(MULTISCRAPE_STEP)).max(1);
        if info.multiscrape_max != n {
            info!(url = %response.scrape_url, max = n, "reducing multiscrape max");
            info.multiscrape_max = n;
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Per-tracker snapshots for the RPC layer.
    pub fn tracker_snapshots(&self, info_hash: &InfoHash) -> Vec<TrackerSnapshot> {
        let Some(ta) = self.torrents.get(info_hash) else {
            return Vec::new();
        };

        let mut snapshots = Vec::new();
        for tier in &ta.tiers {
            for tracker in &tier.trackers {
                let is_current = tier.current_tracker().map(|t| t.id) == Some(tracker.id);
                snapshots.push(TrackerSnapshot {
                    tier_id: tier.id,
                    tracker_id: tracker.id,
                    announce_url: tracker.announce_url.clone(),
                    sitename: tracker.sitename.clone(),
                    seeder_count: tracker.seeder_count,
                    leecher_count: tracker.leecher_count,
                    download_count: tracker.download_count,
                    last_announce_str: is_current.then(|| tier.last_announce_str.clone()),
                    last_announce_succeeded: tier.last_announce_succeeded,
                    last_announce_time: tier.last_announce_time,
                    next_announce_time: tier.announce_at,
                });
            }
        }
        snapshots
    }

    #[cfg(test)]
    pub(crate) fn tier_for_test(
        &mut self,
        info_hash: &InfoHash,
        index: usize,
    ) -> &mut Tier {
        &mut self.torrents.get_mut(info_hash).unwrap().tiers[index]
    }

    #[cfg(test)]
    pub(crate) fn pending_stop_count(&self) -> usize {
        self.stops.len()
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSnapshot {
    pub tier_id: u32,
    pub tracker_id: u32,
    pub announce_url: String,
    pub sitename: String,
    pub seeder_count: Option<u32>,
    pub leecher_count: Option<u32>,
    pub download_count: Option<u32>,
    pub last_announce_str: Option<String>,
    pub last_announce_succeeded: bool,
    pub last_announce_time: u64,
    pub next_announce_time: u64,
}

fn build_request(
    announcer: &Announcer,
    ta: &TorrentAnnouncer,
    tier: &Tier,
    event: TrackerEvent,
) -> Option<AnnounceRequest> {
    let stats = (ta.stats)();
    build_request_inner(
        announcer.key,
        announcer.port,
        ta.info_hash,
        ta.peer_id,
        &stats,
        tier,
        event,
    )
}

fn build_request_inner(
    key: u32,
    port: u16,
    info_hash: InfoHash,
    peer_id: PeerId,
    stats: &TorrentStats,
    tier: &Tier,
    event: TrackerEvent,
) -> Option<AnnounceRequest> {
    let tracker = tier.current_tracker()?;
    Some(AnnounceRequest {
        announce_url: tracker.announce_url.clone(),
        info_hash,
        peer_id,
        port,
        up: tier.byte_counts[BYTES_UP],
        down: tier.byte_counts[BYTES_DOWN],
        corrupt: tier.byte_counts[BYTES_CORRUPT],
        left: stats.left,
        event,
        numwant: if event == TrackerEvent::Stopped { 0 } else { NUMWANT },
        key,
        partial_seed: stats.is_partial_seed,
        tracker_id: tracker.tracker_id.clone(),
    })
}

// A failed announce moves to the next tracker in the tier and requeues the
// event after the new tracker's backoff interval.
fn announce_error(tier: &mut Tier, err: &str, event: TrackerEvent, now: u64) {
    if let Some(tracker) = tier.current_tracker_mut() {
        tracker.consecutive_failures += 1;
    }
    tier.last_announce_str = err.to_string();

    tier.use_next_tracker();
    let interval = tier
        .current_tracker()
        .map(|t| t.retry_interval())
        .unwrap_or(0);

    debug!(err, interval, "announce error; retrying");
    tier.push_announce_event(event, now + interval as u64);
}

fn scrape_error(tier: &mut Tier, errmsg: &str, now: u64, scrape_paused: bool) {
    if let Some(tracker) = tier.current_tracker_mut() {
        tracker.consecutive_failures += 1;
    }
    tier.last_scrape_str = errmsg.to_string();

    tier.use_next_tracker();
    let interval = tier
        .current_tracker()
        .map(|t| t.retry_interval())
        .unwrap_or(0);

    debug!(errmsg, interval, "scrape error; retrying");
    tier.last_scrape_succeeded = false;
    tier.schedule_scrape_in(now, interval, scrape_paused);
}
