//! Per-torrent tracker tiers and their announce/scrape state machines.

use std::collections::VecDeque;

use crate::tracker::{scrape_url_for_announce, tracker_key, tracker_sitename, TrackerEvent};

pub const DEFAULT_SCRAPE_INTERVAL_SEC: u32 = 60 * 30;
pub const DEFAULT_ANNOUNCE_INTERVAL_SEC: u32 = 60 * 10;
pub const DEFAULT_ANNOUNCE_MIN_INTERVAL_SEC: u32 = 60 * 2;

/// Indexes into [`Tier::byte_counts`].
pub const BYTES_UP: usize = 0;
pub const BYTES_DOWN: usize = 1;
pub const BYTES_CORRUPT: usize = 2;

/// One tracker row within a tier.
#[derive(Debug, Clone)]
pub struct Tracker {
    /// `host:port`, the tracker's identity for grouping and display.
    pub key: String,
    pub announce_url: String,
    pub scrape_url: Option<String>,
    pub sitename: String,

    /// Opaque token the tracker asked us to echo back.
    pub tracker_id: Option<String>,

    pub seeder_count: Option<u32>,
    pub leecher_count: Option<u32>,
    pub download_count: Option<u32>,
    pub downloader_count: Option<u32>,

    pub consecutive_failures: u32,

    pub id: u32,
}

impl Tracker {
    pub fn new(announce_url: &str, id: u32) -> Self {
        Self {
            key: tracker_key(announce_url),
            announce_url: announce_url.to_string(),
            scrape_url: scrape_url_for_announce(announce_url),
            sitename: tracker_sitename(announce_url),
            tracker_id: None,
            seeder_count: None,
            leecher_count: None,
            download_count: None,
            downloader_count: None,
            consecutive_failures: 0,
            id,
        }
    }

    /// Seconds to wait before retrying after `consecutive_failures`
    /// failures. Monotonic non-decreasing, capped at two hours plus jitter.
    pub fn retry_interval(&self) -> u32 {
        let jitter = || rand::random_range(0..60u32);
        match self.consecutive_failures {
            0 => 0,
            1 => 20,
            2 => 60 * 5 + jitter(),
            3 => 60 * 15 + jitter(),
            4 => 60 * 30 + jitter(),
            5 => 60 * 60 + jitter(),
            _ => 60 * 120 + jitter(),
        }
    }
}

/// An ordered group of interchangeable trackers, per the multitracker
/// convention. Counters and cadence live on the tier and survive switching
/// from one tracker in the group to another.
pub struct Tier {
    pub id: u32,

    pub trackers: Vec<Tracker>,
    current_tracker_index: Option<usize>,

    /// Up / down / corrupt bytes since the last acknowledged `stopped`.
    pub byte_counts: [u64; 3],

    pub scrape_at: u64,
    pub last_scrape_start_time: u64,
    pub last_scrape_time: u64,
    pub last_scrape_succeeded: bool,
    pub last_scrape_timed_out: bool,

    pub announce_at: u64,
    pub manual_announce_allowed_at: u64,
    pub last_announce_start_time: u64,
    pub last_announce_time: u64,
    pub last_announce_succeeded: bool,
    pub last_announce_timed_out: bool,

    announce_events: VecDeque<TrackerEvent>,

    pub scrape_interval_sec: u32,
    pub announce_interval_sec: u32,
    pub announce_min_interval_sec: u32,

    pub last_announce_peer_count: usize,

    pub is_running: bool,
    pub is_announcing: bool,
    pub is_scraping: bool,

    pub last_announce_str: String,
    pub last_scrape_str: String,
}

impl Tier {
    pub fn new(id: u32, announce_urls: &[String], next_tracker_id: &mut u32) -> Self {
        let trackers = announce_urls
            .iter()
            .map(|url| {
                let tracker = Tracker::new(url, *next_tracker_id);
                *next_tracker_id += 1;
                tracker
            })
            .collect();

        let mut tier = Self {
            id,
            trackers,
            current_tracker_index: None,
            byte_counts: [0; 3],
            scrape_at: 0,
            last_scrape_start_time: 0,
            last_scrape_time: 0,
            last_scrape_succeeded: false,
            last_scrape_timed_out: false,
            announce_at: 0,
            manual_announce_allowed_at: 0,
            last_announce_start_time: 0,
            last_announce_time: 0,
            last_announce_succeeded: false,
            last_announce_timed_out: false,
            announce_events: VecDeque::new(),
            scrape_interval_sec: DEFAULT_SCRAPE_INTERVAL_SEC,
            announce_interval_sec: DEFAULT_ANNOUNCE_INTERVAL_SEC,
            announce_min_interval_sec: DEFAULT_ANNOUNCE_MIN_INTERVAL_SEC,
            last_announce_peer_count: 0,
            is_running: false,
            is_announcing: false,
            is_scraping: false,
            last_announce_str: String::new(),
            last_scrape_str: String::new(),
        };
        tier.use_next_tracker();
        tier
    }

    pub fn current_tracker(&self) -> Option<&Tracker> {
        self.current_tracker_index.map(|i| &self.trackers[i])
    }

    pub fn current_tracker_mut(&mut self) -> Option<&mut Tracker> {
        self.current_tracker_index.map(|i| &mut self.trackers[i])
    }

    /// Advances to the next tracker in the tier and resets the transient
    /// per-tracker cadence state.
    pub fn use_next_tracker(&mut self) -> Option<&Tracker> {
        self.current_tracker_index = if self.trackers.is_empty() {
            None
        } else {
            match self.current_tracker_index {
                None => Some(0),
                Some(i) => Some((i + 1) % self.trackers.len()),
            }
        };

        self.scrape_interval_sec = DEFAULT_SCRAPE_INTERVAL_SEC;
        self.announce_interval_sec = DEFAULT_ANNOUNCE_INTERVAL_SEC;
        self.announce_min_interval_sec = DEFAULT_ANNOUNCE_MIN_INTERVAL_SEC;
        self.is_announcing = false;
        self.is_scraping = false;
        self.last_announce_start_time = 0;
        self.last_scrape_start_time = 0;

        self.current_tracker()
    }

    pub fn needs_to_announce(&self, now: u64) -> bool {
        !self.is_announcing
            && !self.is_scraping
            && self.announce_at != 0
            && self.announce_at <= now
            && !self.announce_events.is_empty()
    }

    pub fn needs_to_scrape(&self, now: u64) -> bool {
        !self.is_scraping
            && self.scrape_at != 0
            && self.scrape_at <= now
            && self
                .current_tracker()
                .is_some_and(|t| t.scrape_url.is_some())
    }

    /// Peers we could upload to, per the current tracker's last counts.
    pub fn count_downloaders(&self) -> u32 {
        self.current_tracker()
            .map(|t| t.downloader_count.unwrap_or(0) + t.leecher_count.unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn can_manual_announce(&self, now: u64) -> bool {
        self.manual_announce_allowed_at <= now
    }

    // ------------------------------------------------------------------
    // Announce event queue
    // ------------------------------------------------------------------

    /// Queues an announce event, compacting the queue:
    /// `stopped` purges everything except a pending `completed`; trailing
    /// `none` events and consecutive duplicates are dropped.
    pub fn push_announce_event(&mut self, event: TrackerEvent, announce_at: u64) {
        if !self.announce_events.is_empty() {
            if event == TrackerEvent::Stopped {
                let has_completed = self
                    .announce_events
                    .contains(&TrackerEvent::Completed);
                self.announce_events.clear();
                if has_completed {
                    self.announce_events.push_back(TrackerEvent::Completed);
                }
            }

            self.remove_trailing(TrackerEvent::None);
            self.remove_trailing(event);
        }

        self.announce_events.push_back(event);
        self.announce_at = announce_at;
    }

    pub fn pull_announce_event(&mut self) -> Option<TrackerEvent> {
        self.announce_events.pop_front()
    }

    /// The queue's priority: its strongest pending event.
    pub fn announce_event_priority(&self) -> Option<TrackerEvent> {
        self.announce_events.iter().max().copied()
    }

    pub fn announce_events(&self) -> impl Iterator<Item = TrackerEvent> + '_ {
        self.announce_events.iter().copied()
    }

    pub fn has_pending_events(&self) -> bool {
        !self.announce_events.is_empty()
    }

    fn remove_trailing(&mut self, event: TrackerEvent) {
        while self.announce_events.back() == Some(&event) {
            self.announce_events.pop_back();
        }
    }

    // ------------------------------------------------------------------
    // Scrape cadence
    // ------------------------------------------------------------------

    pub fn schedule_next_scrape(&mut self, now: u64, scrape_paused: bool) {
        self.schedule_scrape_in(now, self.scrape_interval_sec, scrape_paused);
    }

    pub fn scrape_soon(&mut self, now: u64, scrape_paused: bool) {
        self.schedule_scrape_in(now, 0, scrape_paused);
    }

    /// Scrape times land on multiples of 10 seconds so that torrents come
    /// due together and multiscrape can batch them.
    pub fn schedule_scrape_in(&mut self, now: u64, interval: u32, scrape_paused: bool) {
        if !self.is_running && !scrape_paused {
            self.scrape_at = 0;
            return;
        }
        self.scrape_at = round_up_to_ten(now + interval as u64);
    }
}

fn round_up_to_ten(t: u64) -> u64 {
    match t % 10 {
        0 => t,
        r => t + (10 - r),
    }
}
