use std::sync::{Arc, Mutex};

use crate::metainfo::InfoHash;
use crate::peer::PeerId;
use crate::tracker::{AnnounceResponse, ScrapeRequest, ScrapeResponse, TrackerEvent};

use super::tier::Tier;
use super::*;

const NOW: u64 = 1_000_000;

fn hash(n: u8) -> InfoHash {
    InfoHash([n; 20])
}

struct Fixture {
    announcer: Announcer,
    updates: Arc<Mutex<Vec<TrackerUpdate>>>,
}

impl Fixture {
    fn new(info_hash: InfoHash, tiers: &[Vec<String>]) -> Self {
        let mut announcer = Announcer::new(51413);
        let updates = Arc::new(Mutex::new(Vec::new()));

        let updates_sink = updates.clone();
        announcer.add_torrent(
            info_hash,
            PeerId::generate(),
            tiers,
            NOW,
            Box::new(|| TorrentStats {
                left: 1000,
                is_partial_seed: false,
                is_done: false,
                is_running: true,
            }),
            Box::new(move |u| updates_sink.lock().unwrap().push(u)),
        );

        Self { announcer, updates }
    }

    fn single(url: &str) -> Self {
        Self::new(hash(1), &[vec![url.to_string()]])
    }

    fn tier(&mut self) -> &mut Tier {
        self.announcer.tier_for_test(&hash(1), 0)
    }
}

fn queue_of(tier: &Tier) -> Vec<TrackerEvent> {
    tier.announce_events().collect()
}

// ----------------------------------------------------------------------
// Event queue compaction
// ----------------------------------------------------------------------

#[test]
fn test_stopped_purges_queue_but_keeps_completed() {
    let mut fx = Fixture::single("http://t.example/announce");
    let tier = fx.tier();

    for event in [
        TrackerEvent::Started,
        TrackerEvent::None,
        TrackerEvent::None,
        TrackerEvent::Completed,
        TrackerEvent::None,
        TrackerEvent::Stopped,
    ] {
        tier.push_announce_event(event, NOW);
    }

    assert_eq!(
        queue_of(tier),
        vec![TrackerEvent::Completed, TrackerEvent::Stopped]
    );
}

#[test]
fn test_queue_drops_consecutive_duplicates_and_trailing_none() {
    let mut fx = Fixture::single("http://t.example/announce");
    let tier = fx.tier();

    tier.push_announce_event(TrackerEvent::Started, NOW);
    tier.push_announce_event(TrackerEvent::Started, NOW);
    assert_eq!(queue_of(tier), vec![TrackerEvent::Started]);

    tier.push_announce_event(TrackerEvent::None, NOW);
    tier.push_announce_event(TrackerEvent::Completed, NOW);
    assert_eq!(
        queue_of(tier),
        vec![TrackerEvent::Started, TrackerEvent::Completed]
    );
}

#[test]
fn test_queue_priority_is_max_event() {
    let mut fx = Fixture::single("http://t.example/announce");
    let tier = fx.tier();

    tier.push_announce_event(TrackerEvent::None, NOW);
    assert_eq!(tier.announce_event_priority(), Some(TrackerEvent::None));

    tier.push_announce_event(TrackerEvent::Completed, NOW);
    tier.push_announce_event(TrackerEvent::None, NOW);
    assert_eq!(tier.announce_event_priority(), Some(TrackerEvent::Completed));
}

// ----------------------------------------------------------------------
// Retry backoff
// ----------------------------------------------------------------------

#[test]
fn test_retry_backoff_table() {
    let mut tracker = super::tier::Tracker::new("http://t.example/announce", 0);
    let expected: [(u32, u32); 7] = [
        (0, 0),
        (20, 20),
        (300, 360),
        (900, 960),
        (1800, 1860),
        (3600, 3660),
        (7200, 7260),
    ];

    for (failures, (lo, hi)) in expected.iter().enumerate() {
        tracker.consecutive_failures = failures as u32;
        for _ in 0..16 {
            let interval = tracker.retry_interval();
            assert!(
                interval >= *lo && interval < hi + 1,
                "failures={} interval={} not in [{}, {}]",
                failures,
                interval,
                lo,
                hi
            );
        }
    }

    // capped past the table's end
    tracker.consecutive_failures = 40;
    assert!(tracker.retry_interval() >= 7200);
}

#[test]
fn test_retry_backoff_monotonic() {
    let mut tracker = super::tier::Tracker::new("http://t.example/announce", 0);
    let mut floor = 0;
    for failures in 0..8 {
        tracker.consecutive_failures = failures;
        let min_seen = (0..16).map(|_| tracker.retry_interval()).min().unwrap();
        assert!(min_seen >= floor);
        floor = min_seen;
    }
}

// ----------------------------------------------------------------------
// Scrape scheduling and batching
// ----------------------------------------------------------------------

#[test]
fn test_scrape_times_round_to_ten() {
    let mut fx = Fixture::single("http://t.example/announce");
    let tier = fx.tier();
    tier.is_running = true;

    for now in [NOW, NOW + 1, NOW + 7] {
        tier.scrape_interval_sec = 291;
        tier.schedule_next_scrape(now, false);
        assert_eq!(tier.scrape_at % 10, 0);
        assert!(tier.scrape_at >= now + 291);
    }
}

#[test]
fn test_multiscrape_batches_share_url_within_cap() {
    let mut announcer = Announcer::new(51413);
    let n_torrents = 70u8;

    for i in 0..n_torrents {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        announcer.add_torrent(
            hash(i),
            PeerId::generate(),
            &[vec!["http://t.example/announce".to_string()]],
            NOW,
            Box::new(|| TorrentStats {
                left: 0,
                is_partial_seed: false,
                is_done: true,
                is_running: true,
            }),
            Box::new(move |u| sink.lock().unwrap().push(u)),
        );
    }

    let upkeep = announcer.upkeep(NOW + 20);
    let total: usize = upkeep.scrapes.iter().map(|s| s.info_hashes.len()).sum();
    assert_eq!(total, n_torrents as usize);

    // 70 hashes against a 60-hash cap means exactly two requests
    assert_eq!(upkeep.scrapes.len(), 2);
    for request in &upkeep.scrapes {
        assert!(request.info_hashes.len() <= announcer.multiscrape_max(&request.scrape_url));
    }
}

#[test]
fn test_multiscrape_shrinks_once_per_generation() {
    let mut fx = Fixture::single("http://t.example/announce");
    let scrape_url = "http://t.example/scrape".to_string();
    assert_eq!(fx.announcer.multiscrape_max(&scrape_url), MULTISCRAPE_MAX);

    let too_long = |row_count: usize| {
        let request = ScrapeRequest {
            scrape_url: scrape_url.clone(),
            info_hashes: (0..row_count as u8).map(hash).collect(),
        };
        let mut response = ScrapeResponse::for_request(&request);
        response.errmsg = Some("Request-URI Too Long".to_string());
        response
    };

    fx.announcer.on_scrape_done(&too_long(60), NOW);
    assert_eq!(fx.announcer.multiscrape_max(&scrape_url), 55);

    // a second response from the same oversized batch must not compound
    fx.announcer.on_scrape_done(&too_long(60), NOW);
    assert_eq!(fx.announcer.multiscrape_max(&scrape_url), 55);

    // but once requests shrink to the new cap, another failure steps down
    fx.announcer.on_scrape_done(&too_long(55), NOW);
    assert_eq!(fx.announcer.multiscrape_max(&scrape_url), 50);
}

#[test]
fn test_multiscrape_floor_is_one() {
    let mut fx = Fixture::single("http://t.example/announce");
    let scrape_url = "http://t.example/scrape".to_string();

    for _ in 0..30 {
        let request = ScrapeRequest {
            scrape_url: scrape_url.clone(),
            info_hashes: vec![hash(1)],
        };
        let mut response = ScrapeResponse::for_request(&request);
        response.errmsg = Some("GET string too long".to_string());
        fx.announcer.on_scrape_done(&response, NOW);
    }

    assert_eq!(fx.announcer.multiscrape_max(&scrape_url), 1);
}

#[test]
fn test_custom_multiscrape_policy() {
    let policy = MultiscrapePolicy::new(vec!["tiny URLs only".to_string()]);
    assert!(policy.is_too_big_error("sorry, tiny URLs only here"));
    assert!(!policy.is_too_big_error("Request-URI Too Long"));
}

// ----------------------------------------------------------------------
// Upkeep
// ----------------------------------------------------------------------

#[test]
fn test_started_torrent_announces_on_upkeep() {
    let mut fx = Fixture::single("http://t.example/announce");
    fx.announcer.torrent_started(&hash(1), NOW);

    let upkeep = fx.announcer.upkeep(NOW);
    assert_eq!(upkeep.announces.len(), 1);

    let task = &upkeep.announces[0];
    assert_eq!(task.event, TrackerEvent::Started);
    assert_eq!(task.request.numwant, 80);
    assert_eq!(task.request.left, 1000);
    assert!(task.is_running_on_success);

    // in flight now; the next tick must not double-announce
    assert!(fx.announcer.upkeep(NOW).announces.is_empty());
}

#[test]
fn test_stopped_event_has_numwant_zero() {
    let mut fx = Fixture::single("http://t.example/announce");
    fx.announcer.torrent_stopped(&hash(1), NOW);

    let upkeep = fx.announcer.upkeep(NOW);
    assert_eq!(upkeep.announces[0].request.numwant, 0);
}

#[test]
fn test_urgent_events_outrank_periodic_reannounces() {
    let mut announcer = Announcer::new(51413);
    for i in 0..30u8 {
        announcer.add_torrent(
            hash(i),
            PeerId::generate(),
            &[vec![format!("http://t{}.example/announce", i)]],
            NOW,
            Box::new(|| TorrentStats {
                left: 0,
                is_partial_seed: false,
                is_done: false,
                is_running: true,
            }),
            Box::new(|_| {}),
        );
    }

    // torrents 0..29 queue periodic re-announces; torrent 29 stops
    for i in 0..29u8 {
        announcer.manual_announce(&hash(i), NOW);
    }
    announcer.torrent_stopped(&hash(29), NOW);

    let upkeep = announcer.upkeep(NOW);
    assert_eq!(upkeep.announces.len(), MAX_ANNOUNCES_PER_UPKEEP);
    assert_eq!(upkeep.announces[0].event, TrackerEvent::Stopped);
    assert_eq!(upkeep.announces[0].info_hash, hash(29));
}

#[test]
fn test_flush_stops_orders_by_traffic() {
    let mut announcer = Announcer::new(51413);

    for (i, traffic) in [(1u8, 10u64), (2, 500), (3, 100)] {
        announcer.add_torrent(
            hash(i),
            PeerId::generate(),
            &[vec![format!("http://t{}.example/announce", i)]],
            NOW,
            Box::new(|| TorrentStats {
                left: 0,
                is_partial_seed: false,
                is_done: true,
                is_running: true,
            }),
            Box::new(|_| {}),
        );
        announcer.tier_for_test(&hash(i), 0).is_running = true;
        announcer.add_bytes(&hash(i), super::tier::BYTES_UP, traffic);
        announcer.remove_torrent(&hash(i));
    }

    let stops = announcer.flush_stops();
    let traffic: Vec<u64> = stops.iter().map(|s| s.up + s.down).collect();
    assert_eq!(traffic, vec![500, 100, 10]);
    assert_eq!(announcer.pending_stop_count(), 0);
}

#[test]
fn test_remove_torrent_dedupes_stops() {
    let mut announcer = Announcer::new(51413);
    announcer.add_torrent(
        hash(1),
        PeerId::generate(),
        &[vec!["http://t.example/announce".to_string()]],
        NOW,
        Box::new(|| TorrentStats {
            left: 0,
            is_partial_seed: false,
            is_done: true,
            is_running: true,
        }),
        Box::new(|_| {}),
    );
    announcer.tier_for_test(&hash(1), 0).is_running = true;
    announcer.remove_torrent(&hash(1));
    announcer.remove_torrent(&hash(1));

    assert_eq!(announcer.pending_stop_count(), 1);
}

// ----------------------------------------------------------------------
// Announce responses
// ----------------------------------------------------------------------

fn run_announce(fx: &mut Fixture, event: TrackerEvent) -> u32 {
    fx.announcer.torrent_started(&hash(1), NOW);
    let tier = fx.tier();
    tier.push_announce_event(event, NOW);
    let upkeep = fx.announcer.upkeep(NOW);
    upkeep.announces.last().map(|t| t.tier_id).unwrap_or(0)
}

#[test]
fn test_success_response_updates_tier() {
    let mut fx = Fixture::single("http://t.example/announce");
    fx.announcer.torrent_started(&hash(1), NOW);
    let upkeep = fx.announcer.upkeep(NOW);
    let task = &upkeep.announces[0];

    let mut response = AnnounceResponse::new(hash(1));
    response.interval = 1700;
    response.min_interval = 60;
    response.seeders = Some(12);
    response.leechers = Some(4);
    response.downloads = Some(99);
    response.tracker_id = Some("tok".to_string());
    response.pex = vec!["10.0.0.1:6881".parse().unwrap()];

    fx.announcer
        .on_announce_done(task.tier_id, task.event, true, &response, NOW + 1);

    let tier = fx.tier();
    assert!(tier.last_announce_succeeded);
    assert!(tier.is_running);
    assert!(!tier.is_announcing);
    assert_eq!(tier.announce_interval_sec, 1700);
    assert_eq!(tier.announce_min_interval_sec, 60);
    assert_eq!(tier.last_announce_str, "Success");
    assert_eq!(tier.last_announce_peer_count, 1);
    let tracker = tier.current_tracker().unwrap();
    assert_eq!(tracker.tracker_id.as_deref(), Some("tok"));
    assert_eq!(tracker.seeder_count, Some(12));
    assert_eq!(tracker.consecutive_failures, 0);

    // the empty queue got a periodic reannounce at now + interval
    assert_eq!(queue_of(tier), vec![TrackerEvent::None]);
    assert_eq!(tier.announce_at, NOW + 1 + 1700);

    // exactly one peers publish and one counts publish
    let updates = fx.updates.lock().unwrap();
    let peers = updates
        .iter()
        .filter(|u| matches!(u, TrackerUpdate::Peers { .. }))
        .count();
    let counts = updates
        .iter()
        .filter(|u| matches!(u, TrackerUpdate::Counts { .. }))
        .count();
    assert_eq!(peers, 1);
    assert_eq!(counts, 1);
}

#[test]
fn test_stopped_ack_zeroes_byte_counts() {
    let mut fx = Fixture::single("http://t.example/announce");
    fx.announcer.add_bytes(&hash(1), super::tier::BYTES_UP, 111);
    fx.announcer.add_bytes(&hash(1), super::tier::BYTES_DOWN, 222);
    fx.announcer.add_bytes(&hash(1), super::tier::BYTES_CORRUPT, 3);

    let tier_id = run_announce(&mut fx, TrackerEvent::Stopped);
    let response = AnnounceResponse::new(hash(1));
    fx.announcer
        .on_announce_done(tier_id, TrackerEvent::Stopped, false, &response, NOW + 1);

    let tier = fx.tier();
    assert_eq!(tier.byte_counts, [0, 0, 0]);
    assert!(!tier.is_running);
    // a stopped ack never queues a periodic reannounce
    assert!(queue_of(tier).is_empty());
}

#[test]
fn test_single_tracker_error_is_published() {
    let mut fx = Fixture::single("http://t.example/announce");
    fx.announcer.torrent_started(&hash(1), NOW);
    let upkeep = fx.announcer.upkeep(NOW);
    let task = &upkeep.announces[0];

    let mut response = AnnounceResponse::new(hash(1));
    response.errmsg = Some("unregistered torrent".to_string());
    fx.announcer
        .on_announce_done(task.tier_id, task.event, true, &response, NOW + 1);

    let updates = fx.updates.lock().unwrap();
    assert!(updates
        .iter()
        .any(|u| matches!(u, TrackerUpdate::Error(msg) if msg == "unregistered torrent")));
}

#[test]
fn test_multi_tracker_error_is_not_published() {
    let mut fx = Fixture::new(
        hash(1),
        &[vec![
            "http://a.example/announce".to_string(),
            "http://b.example/announce".to_string(),
        ]],
    );
    fx.announcer.torrent_started(&hash(1), NOW);
    let upkeep = fx.announcer.upkeep(NOW);
    let task = &upkeep.announces[0];

    let mut response = AnnounceResponse::new(hash(1));
    response.errmsg = Some("dead tracker".to_string());
    fx.announcer
        .on_announce_done(task.tier_id, task.event, true, &response, NOW + 1);

    let updates = fx.updates.lock().unwrap();
    assert!(!updates
        .iter()
        .any(|u| matches!(u, TrackerUpdate::Error(_))));
    drop(updates);

    // but the tier still failed over to the next tracker
    let tier = fx.tier();
    assert_eq!(
        tier.current_tracker().unwrap().announce_url,
        "http://b.example/announce"
    );
    assert_eq!(tier.trackers[0].consecutive_failures, 1);
}

#[test]
fn test_failed_announce_requeues_event_with_backoff() {
    let mut fx = Fixture::single("http://t.example/announce");
    fx.announcer.torrent_started(&hash(1), NOW);
    let upkeep = fx.announcer.upkeep(NOW);
    let task = &upkeep.announces[0];

    let response = AnnounceResponse::no_connect(hash(1));
    fx.announcer
        .on_announce_done(task.tier_id, task.event, true, &response, NOW + 1);

    let tier = fx.tier();
    assert!(!tier.last_announce_succeeded);
    assert_eq!(tier.last_announce_str, "Could not connect to tracker");
    // the event went back on the queue; retry interval for one failure is 20s
    assert_eq!(queue_of(tier), vec![TrackerEvent::Started]);
    assert_eq!(tier.announce_at, NOW + 1 + 20);
}

#[test]
fn test_timeout_sets_timed_out_flag() {
    let mut fx = Fixture::single("http://t.example/announce");
    fx.announcer.torrent_started(&hash(1), NOW);
    let upkeep = fx.announcer.upkeep(NOW);
    let task = &upkeep.announces[0];

    let response = AnnounceResponse::timed_out(hash(1));
    fx.announcer
        .on_announce_done(task.tier_id, task.event, true, &response, NOW + 1);

    let tier = fx.tier();
    assert!(tier.last_announce_timed_out);
    assert_eq!(tier.last_announce_str, "Tracker did not respond");
}

#[test]
fn test_response_for_removed_torrent_is_a_noop() {
    let mut fx = Fixture::single("http://t.example/announce");
    fx.announcer.torrent_started(&hash(1), NOW);
    let upkeep = fx.announcer.upkeep(NOW);
    let task = &upkeep.announces[0];
    let tier_id = task.tier_id;

    fx.announcer.tier_for_test(&hash(1), 0).is_running = true;
    fx.announcer.remove_torrent(&hash(1));

    let response = AnnounceResponse::new(hash(1));
    fx.announcer
        .on_announce_done(tier_id, TrackerEvent::Started, true, &response, NOW + 1);
    assert_eq!(fx.announcer.torrent_count(), 0);
}

#[test]
fn test_scrape_fields_in_announce_defer_next_scrape() {
    let mut fx = Fixture::single("http://t.example/announce");
    fx.announcer.torrent_started(&hash(1), NOW);
    let upkeep = fx.announcer.upkeep(NOW);
    let task = &upkeep.announces[0];

    let mut response = AnnounceResponse::new(hash(1));
    response.interval = 600;
    response.seeders = Some(1);
    response.leechers = Some(2);
    response.downloads = Some(3);
    fx.announcer
        .on_announce_done(task.tier_id, task.event, true, &response, NOW + 1);

    let tier = fx.tier();
    assert!(tier.last_scrape_succeeded);
    assert_eq!(tier.last_scrape_time, NOW + 1);
    assert!(tier.scrape_at > NOW + 1);
}

// ----------------------------------------------------------------------
// Scrape responses
// ----------------------------------------------------------------------

#[test]
fn test_scrape_success_updates_counts() {
    let mut fx = Fixture::single("http://t.example/announce");
    fx.tier().is_running = true;

    let request = ScrapeRequest {
        scrape_url: "http://t.example/scrape".to_string(),
        info_hashes: vec![hash(1)],
    };
    let mut response = ScrapeResponse::for_request(&request);
    {
        let row = response.row_mut(&hash(1)).unwrap();
        row.seeders = Some(7);
        row.leechers = Some(3);
        row.downloads = Some(40);
        row.downloaders = Some(2);
    }
    response.min_request_interval = 3600;

    fx.announcer.on_scrape_done(&response, NOW);

    let tier = fx.tier();
    assert!(tier.last_scrape_succeeded);
    assert_eq!(tier.scrape_interval_sec, 3600);
    assert_eq!(tier.scrape_at % 10, 0);
    let tracker = tier.current_tracker().unwrap();
    assert_eq!(tracker.seeder_count, Some(7));
    assert_eq!(tracker.downloader_count, Some(2));

    let updates = fx.updates.lock().unwrap();
    assert!(updates
        .iter()
        .any(|u| matches!(u, TrackerUpdate::Counts { seeders: Some(7), .. })));
}

#[test]
fn test_scrape_failure_rotates_tracker() {
    let mut fx = Fixture::new(
        hash(1),
        &[vec![
            "http://a.example/announce".to_string(),
            "http://b.example/announce".to_string(),
        ]],
    );
    fx.tier().is_running = true;

    let request = ScrapeRequest {
        scrape_url: "http://a.example/scrape".to_string(),
        info_hashes: vec![hash(1)],
    };
    let mut response = ScrapeResponse::for_request(&request);
    response.did_connect = false;

    fx.announcer.on_scrape_done(&response, NOW);

    let tier = fx.tier();
    assert!(!tier.last_scrape_succeeded);
    assert_eq!(tier.last_scrape_str, "Could not connect to tracker");
    assert_eq!(
        tier.current_tracker().unwrap().announce_url,
        "http://b.example/announce"
    );
}
