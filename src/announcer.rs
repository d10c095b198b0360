//! Tracker announce and scrape scheduling.
//!
//! Each torrent's trackers are grouped into tiers per the multitracker
//! convention; each tier runs its own announce/scrape state machine with
//! failure backoff and tracker rotation. A 500 ms upkeep tick services
//! every tier: scrapes are batched per URL (multiscrape), announces are
//! prioritized, and `stopped` events for removed torrents are flushed
//! first so final stats make it out.

mod global;
mod tier;

pub use global::{
    AnnounceTask, Announcer, MultiscrapePolicy, StatsFn, PublishFn, TorrentStats,
    TrackerSnapshot, TrackerUpdate, Upkeep, MAX_ANNOUNCES_PER_UPKEEP, MAX_SCRAPES_PER_UPKEEP,
    MULTISCRAPE_MAX, UPKEEP_INTERVAL,
};
pub use tier::{
    Tier, Tracker, BYTES_CORRUPT, BYTES_DOWN, BYTES_UP, DEFAULT_ANNOUNCE_INTERVAL_SEC,
    DEFAULT_ANNOUNCE_MIN_INTERVAL_SEC, DEFAULT_SCRAPE_INTERVAL_SEC,
};

#[cfg(test)]
mod tests;
