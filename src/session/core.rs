//! The session: torrent registry, timers, and lifecycle.
//!
//! One `Session` owns the bandwidth root, the announcer, the blocklist,
//! the NAT-PMP mapper, and every torrent. `run` drives three timers: the
//! 500 ms announcer upkeep, a 1 s "now" tick for bandwidth refill and the
//! turtle clock, and a 360 s resume flush, plus the channel that carries
//! tracker responses back from their worker tasks.
//!
//! Lock order is announcer before torrent; the announcer's snapshot
//! closures take torrent locks while the announcer is held.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value as Json};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::announcer::{Announcer, TorrentStats, TrackerUpdate};
use crate::bandwidth::{Bandwidth, Direction, TurtleInfo, MINUTES_PER_DAY, MINUTES_PER_WEEK};
use crate::blocklist::Blocklist;
use crate::metainfo::{InfoHash, Metainfo};
use crate::portmap::{gateway_candidates, PortMapper, UdpGateway};
use crate::resume::{self, Ctor, Fields};
use crate::rpc::{RpcHandler, RpcServer};
use crate::torrent::{RunState, Torrent, TorrentId};
use crate::tracker::{AnnounceResponse, ScrapeResponse, TrackerClient, TrackerEvent};

use super::settings::Settings;

pub const NOW_INTERVAL: Duration = Duration::from_secs(1);
pub const RESUME_SAVE_INTERVAL: Duration = Duration::from_secs(360);
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracker error: {0}")]
    Tracker(#[from] crate::tracker::TrackerError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no such torrent")]
    NotFound,

    #[error("session is closing")]
    Shutdown,
}

/// Things the embedding application may want to react to.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    TorrentAdded(TorrentId),
    TorrentRemoved(TorrentId),
    TorrentDone(TorrentId),
    Tracker {
        id: TorrentId,
        update: TrackerUpdate,
    },
}

enum TrackerReply {
    Announce {
        tier_id: u32,
        event: TrackerEvent,
        is_running_on_success: bool,
        response: AnnounceResponse,
    },
    Scrape(ScrapeResponse),
}

type SharedTorrent = Arc<Mutex<Torrent>>;

pub struct Session {
    config_dir: PathBuf,
    settings: RwLock<Settings>,

    bandwidth: Bandwidth,
    turtle: Mutex<TurtleInfo>,

    torrents_by_id: DashMap<TorrentId, SharedTorrent>,
    torrents_by_hash: DashMap<InfoHash, TorrentId>,
    /// Insertion order; the third index, used for stable iteration.
    torrent_order: Mutex<Vec<TorrentId>>,

    announcer: Mutex<Announcer>,
    tracker_client: Arc<TrackerClient>,
    blocklist: RwLock<Blocklist>,
    portmap: Mutex<Option<PortMapper<UdpGateway>>>,

    peer_port: AtomicU16,
    is_closing: AtomicBool,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    replies_tx: mpsc::UnboundedSender<TrackerReply>,
    replies_rx: Mutex<Option<mpsc::UnboundedReceiver<TrackerReply>>>,
}

impl Session {
    pub fn new(config_dir: PathBuf) -> Result<Arc<Self>, SessionError> {
        let settings = Settings::load(&config_dir);
        Self::with_settings(config_dir, settings)
    }

    pub fn with_settings(
        config_dir: PathBuf,
        settings: Settings,
    ) -> Result<Arc<Self>, SessionError> {
        let now = unix_now();

        let bandwidth = Bandwidth::new();
        for dir in Direction::ALL {
            let (enabled, bps) = settings.speed_limit_bps(dir);
            bandwidth.set_limited(dir, enabled);
            bandwidth.set_desired_bps(dir, bps);
        }

        let mut turtle = TurtleInfo::new(
            settings.alt_speed_up_kbps * 1000,
            settings.alt_speed_down_kbps * 1000,
        );
        turtle.is_enabled = settings.alt_speed_enabled;
        turtle.is_clock_enabled = settings.alt_speed_time_enabled;
        turtle.begin_minute = settings.alt_speed_time_begin;
        turtle.end_minute = settings.alt_speed_time_end;
        turtle.days = settings.alt_speed_time_day;
        turtle.bootstrap(minute_of_week(now));

        let peer_port = if settings.peer_port_random_on_start {
            random_port(&settings)
        } else {
            settings.peer_port
        };

        let mut announcer = Announcer::new(peer_port);
        announcer.set_scrape_paused_torrents(settings.scrape_paused_torrents_enabled);

        let mut blocklist = Blocklist::load_dir(&config_dir.join("blocklists"))?;
        blocklist.set_enabled(settings.blocklist_enabled);
        if blocklist.rule_count() > 0 {
            info!(rules = blocklist.rule_count(), "blocklist loaded");
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            config_dir,
            settings: RwLock::new(settings),
            bandwidth,
            turtle: Mutex::new(turtle),
            torrents_by_id: DashMap::new(),
            torrents_by_hash: DashMap::new(),
            torrent_order: Mutex::new(Vec::new()),
            announcer: Mutex::new(announcer),
            tracker_client: Arc::new(TrackerClient::new()?),
            blocklist: RwLock::new(blocklist),
            portmap: Mutex::new(None),
            peer_port: AtomicU16::new(peer_port),
            is_closing: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            replies_tx,
            replies_rx: Mutex::new(Some(replies_rx)),
        });

        session.apply_speed_limits();
        Ok(session)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port.load(Ordering::Relaxed)
    }

    pub fn is_closing(&self) -> bool {
        self.is_closing.load(Ordering::Relaxed)
    }

    pub fn bandwidth(&self) -> &Bandwidth {
        &self.bandwidth
    }

    pub fn blocklist(&self) -> &RwLock<Blocklist> {
        &self.blocklist
    }

    /// The event stream. Callable once; later calls get `None`.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    // ------------------------------------------------------------------
    // Torrent lifecycle
    // ------------------------------------------------------------------

    pub fn add_torrent(
        self: &Arc<Self>,
        metainfo: Metainfo,
        ctor: Ctor,
    ) -> Result<TorrentId, SessionError> {
        if self.is_closing() {
            return Err(SessionError::Shutdown);
        }
        let info_hash = metainfo.info_hash;
        if self.torrents_by_hash.contains_key(&info_hash) {
            return Err(SessionError::InvalidInput("duplicate torrent".to_string()));
        }
        if metainfo.tiers.is_empty() {
            return Err(SessionError::InvalidInput("no trackers".to_string()));
        }

        let now = unix_now();
        let download_dir = self.settings.read().download_dir.clone();
        let tiers = metainfo.tiers.clone();

        let mut torrent = Torrent::new(metainfo, download_dir, &self.bandwidth, now);
        torrent.max_peers = self.settings.read().peer_limit_per_torrent;
        resume::load(&mut torrent, Fields::ALL, &ctor, &self.config_dir);

        let id = torrent.id();
        let peer_id = torrent.peer_id;
        let is_running = torrent.is_running();
        let name = torrent.name.clone();
        let shared = Arc::new(Mutex::new(torrent));

        self.torrents_by_id.insert(id, shared.clone());
        self.torrents_by_hash.insert(info_hash, id);
        self.torrent_order.lock().push(id);

        // the announcer resolves the torrent through a weak handle, so a
        // response landing after removal quietly becomes a no-op
        let stats_handle: Weak<Mutex<Torrent>> = Arc::downgrade(&shared);
        let stats = Box::new(move || match stats_handle.upgrade() {
            Some(torrent) => torrent.lock().announce_stats(),
            None => TorrentStats {
                left: 0,
                is_partial_seed: false,
                is_done: false,
                is_running: false,
            },
        });

        let events = self.events_tx.clone();
        let publish = Box::new(move |update: TrackerUpdate| {
            let _ = events.send(SessionEvent::Tracker { id, update });
        });

        {
            let mut announcer = self.announcer.lock();
            announcer.add_torrent(info_hash, peer_id, &tiers, now, stats, publish);
            if is_running {
                announcer.torrent_started(&info_hash, now);
            }
        }

        info!(id, name = %name, "torrent added");
        self.run_script_hook(ScriptHook::Added, id);
        let _ = self.events_tx.send(SessionEvent::TorrentAdded(id));
        Ok(id)
    }

    pub fn remove_torrent(&self, id: TorrentId) -> Result<(), SessionError> {
        let (_, shared) = self
            .torrents_by_id
            .remove(&id)
            .ok_or(SessionError::NotFound)?;

        let (info_hash, resume_path) = {
            let torrent = shared.lock();
            (torrent.info_hash(), torrent.resume_path(&self.config_dir))
        };

        self.announcer.lock().remove_torrent(&info_hash);
        self.torrents_by_hash.remove(&info_hash);
        self.torrent_order.lock().retain(|&t| t != id);

        if let Err(e) = std::fs::remove_file(&resume_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %resume_path.display(), error = %e, "couldn't remove resume file");
            }
        }

        info!(id, "torrent removed");
        let _ = self.events_tx.send(SessionEvent::TorrentRemoved(id));
        Ok(())
    }

    pub fn start_torrent(&self, id: TorrentId) -> Result<(), SessionError> {
        let shared = self.torrent(id)?;
        let info_hash = {
            let mut torrent = shared.lock();
            torrent.start();
            torrent.info_hash()
        };
        self.announcer.lock().torrent_started(&info_hash, unix_now());
        Ok(())
    }

    pub fn stop_torrent(&self, id: TorrentId) -> Result<(), SessionError> {
        let shared = self.torrent(id)?;
        let info_hash = {
            let mut torrent = shared.lock();
            torrent.stop();
            torrent.info_hash()
        };
        self.announcer.lock().torrent_stopped(&info_hash, unix_now());
        Ok(())
    }

    /// The verifier or peer layer reports that the last wanted piece
    /// arrived and checked out.
    pub fn notify_torrent_done(&self, id: TorrentId) -> Result<(), SessionError> {
        let shared = self.torrent(id)?;
        let (info_hash, is_seed) = {
            let mut torrent = shared.lock();
            torrent.done_date = unix_now();
            torrent.set_dirty();
            (torrent.info_hash(), torrent.is_seed())
        };

        self.announcer.lock().torrent_completed(&info_hash, unix_now());
        self.run_script_hook(
            if is_seed {
                ScriptHook::DoneSeeding
            } else {
                ScriptHook::Done
            },
            id,
        );
        let _ = self.events_tx.send(SessionEvent::TorrentDone(id));
        Ok(())
    }

    pub fn torrent(&self, id: TorrentId) -> Result<SharedTorrent, SessionError> {
        self.torrents_by_id
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(SessionError::NotFound)
    }

    pub fn find_by_hash(&self, info_hash: &InfoHash) -> Option<SharedTorrent> {
        let id = *self.torrents_by_hash.get(info_hash)?;
        self.torrents_by_id.get(&id).map(|e| e.value().clone())
    }

    pub fn torrent_ids(&self) -> Vec<TorrentId> {
        self.torrent_order.lock().clone()
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents_by_id.len()
    }

    pub fn set_peer_port(&self, port: u16) {
        self.peer_port.store(port, Ordering::Relaxed);
        self.announcer.lock().port_changed(port, unix_now());
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Drives the session until `close` is called.
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let session = self.clone();
        let mut replies = self
            .replies_rx
            .lock()
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            let mut upkeep = tokio::time::interval(crate::announcer::UPKEEP_INTERVAL);
            let mut now_tick = tokio::time::interval(NOW_INTERVAL);
            let mut resume_tick = tokio::time::interval(RESUME_SAVE_INTERVAL);

            loop {
                tokio::select! {
                    _ = upkeep.tick() => session.announcer_upkeep(),
                    _ = now_tick.tick() => session.tick_now(),
                    _ = resume_tick.tick() => session.save_dirty_torrents(),
                    Some(reply) = replies.recv() => session.on_tracker_reply(reply),
                }

                if session.is_closing() {
                    break;
                }
            }
        })
    }

    fn announcer_upkeep(&self) {
        let now = unix_now();
        let work = self.announcer.lock().upkeep(now);

        for stop in work.stops {
            let client = self.tracker_client.clone();
            tokio::spawn(async move {
                let _ = client.announce(stop).await;
            });
        }

        for scrape in work.scrapes {
            let client = self.tracker_client.clone();
            let replies = self.replies_tx.clone();
            tokio::spawn(async move {
                let response = client.scrape(scrape).await;
                let _ = replies.send(TrackerReply::Scrape(response));
            });
        }

        for task in work.announces {
            let client = self.tracker_client.clone();
            let replies = self.replies_tx.clone();
            tokio::spawn(async move {
                let response = client.announce(task.request).await;
                let _ = replies.send(TrackerReply::Announce {
                    tier_id: task.tier_id,
                    event: task.event,
                    is_running_on_success: task.is_running_on_success,
                    response,
                });
            });
        }
    }

    fn on_tracker_reply(&self, reply: TrackerReply) {
        let now = unix_now();
        let mut announcer = self.announcer.lock();
        match reply {
            TrackerReply::Announce {
                tier_id,
                event,
                is_running_on_success,
                response,
            } => announcer.on_announce_done(tier_id, event, is_running_on_success, &response, now),
            TrackerReply::Scrape(response) => announcer.on_scrape_done(&response, now),
        }
    }

    /// The 1-second tick: bandwidth refill, turtle clock, per-torrent
    /// counters, NAT-PMP pulse.
    pub fn tick_now(&self) {
        let now = unix_now();
        self.bandwidth.allocate();

        let flipped = self.turtle.lock().check_clock(minute_of_week(now));
        if let Some(enabled) = flipped {
            info!(enabled, "turtle schedule toggled alternate speed limits");
            self.apply_speed_limits();
        }

        for entry in self.torrents_by_id.iter() {
            let mut torrent = entry.value().lock();
            match torrent.run_state() {
                RunState::Seeding => torrent.seconds_seeding += 1,
                RunState::Downloading => torrent.seconds_downloading += 1,
                _ => {}
            }
        }

        self.portmap_pulse(now);
    }

    fn portmap_pulse(&self, now: u64) {
        let enabled =
            self.settings.read().port_forwarding_enabled && !self.is_closing();
        let mut slot = self.portmap.lock();

        if slot.is_none() && enabled {
            match UdpGateway::new(gateway_candidates()[0]) {
                Ok(gateway) => *slot = Some(PortMapper::new(gateway)),
                Err(e) => debug!(error = %e, "couldn't open nat-pmp socket"),
            }
        }

        if let Some(mapper) = slot.as_mut() {
            mapper.pulse(now, self.peer_port(), enabled);
        }
    }

    /// Reapplies the primary or turtle limits to the bandwidth root.
    pub fn apply_speed_limits(&self) {
        let turtle = self.turtle.lock();
        if turtle.is_enabled {
            for (dir, bps) in [
                (Direction::Up, turtle.up_bps),
                (Direction::Down, turtle.down_bps),
            ] {
                self.bandwidth.set_limited(dir, true);
                self.bandwidth.set_desired_bps(dir, bps);
            }
        } else {
            let settings = self.settings.read();
            for dir in Direction::ALL {
                let (enabled, bps) = settings.speed_limit_bps(dir);
                self.bandwidth.set_limited(dir, enabled);
                self.bandwidth.set_desired_bps(dir, bps);
            }
        }
    }

    pub fn set_turtle_enabled(&self, enabled: bool) {
        self.turtle.lock().set_enabled_by_user(enabled);
        self.apply_speed_limits();
    }

    pub fn is_turtle_enabled(&self) -> bool {
        self.turtle.lock().is_enabled
    }

    pub fn save_dirty_torrents(&self) {
        for entry in self.torrents_by_id.iter() {
            let mut torrent = entry.value().lock();
            if !torrent.is_dirty() {
                continue;
            }
            match resume::save(&torrent, &self.config_dir) {
                Ok(()) => torrent.clear_dirty(),
                Err(e) => warn!(name = %torrent.name, error = %e, "resume save failed"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Orderly shutdown: biggest contributors stop first, the announcer
    /// flushes after the torrents so every `stopped` is queued, and a
    /// bounded drain gives the final announces a chance to land.
    pub async fn close(&self) {
        self.is_closing.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + SHUTDOWN_DEADLINE;

        if let Err(e) = self.settings.read().save(&self.config_dir) {
            warn!(error = %e, "couldn't save settings");
        }

        // stop torrents, heaviest traffic first, so their final stats have
        // the best odds of reaching a tracker before the deadline
        let mut ids: Vec<(u64, TorrentId)> = Vec::new();
        for entry in self.torrents_by_id.iter() {
            let torrent = entry.value().lock();
            let traffic = torrent.uploaded.total() + torrent.downloaded.total();
            ids.push((traffic, torrent.id()));
        }
        ids.sort_by(|a, b| b.0.cmp(&a.0));

        let now = unix_now();
        for (_, id) in &ids {
            let Ok(shared) = self.torrent(*id) else {
                continue;
            };
            let (info_hash, was_running) = {
                let mut torrent = shared.lock();
                let was_running = torrent.is_running();
                if was_running {
                    torrent.stop();
                }
                if let Err(e) = resume::save(&torrent, &self.config_dir) {
                    warn!(name = %torrent.name, error = %e, "resume save failed");
                }
                (torrent.info_hash(), was_running)
            };
            if was_running {
                self.announcer.lock().torrent_stopped(&info_hash, now);
            }
        }

        // drain the stopped announces the loop above queued
        loop {
            let work = self.announcer.lock().upkeep(unix_now());
            let nothing_left = work.stops.is_empty() && work.announces.is_empty();
            if nothing_left {
                break;
            }

            for stop in work.stops {
                let Ok(remaining) = remaining_time(deadline) else {
                    return;
                };
                let _ =
                    tokio::time::timeout(remaining, self.tracker_client.announce(stop)).await;
            }

            for task in work.announces {
                let Ok(remaining) = remaining_time(deadline) else {
                    return;
                };
                let Ok(response) =
                    tokio::time::timeout(remaining, self.tracker_client.announce(task.request))
                        .await
                else {
                    return;
                };
                self.announcer.lock().on_announce_done(
                    task.tier_id,
                    task.event,
                    task.is_running_on_success,
                    &response,
                    unix_now(),
                );
            }

            if remaining_time(deadline).is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // ------------------------------------------------------------------
    // Script hooks
    // ------------------------------------------------------------------

    fn run_script_hook(&self, hook: ScriptHook, id: TorrentId) {
        let settings = self.settings.read();
        let (enabled, script) = match hook {
            ScriptHook::Added => (
                settings.script_torrent_added_enabled,
                settings.script_torrent_added_filename.clone(),
            ),
            ScriptHook::Done => (
                settings.script_torrent_done_enabled,
                settings.script_torrent_done_filename.clone(),
            ),
            ScriptHook::DoneSeeding => (
                settings.script_torrent_done_seeding_enabled,
                settings.script_torrent_done_seeding_filename.clone(),
            ),
        };
        drop(settings);

        if !enabled || script.as_os_str().is_empty() {
            return;
        }
        let Ok(shared) = self.torrent(id) else {
            return;
        };

        let (name, hash, dir) = {
            let torrent = shared.lock();
            (
                torrent.name.clone(),
                torrent.info_hash().to_hex(),
                torrent.download_dir.clone(),
            )
        };

        debug!(script = %script.display(), name = %name, "running script hook");
        let mut command = tokio::process::Command::new(script);
        command
            .env("TR_TORRENT_ID", id.to_string())
            .env("TR_TORRENT_NAME", name)
            .env("TR_TORRENT_HASH", hash)
            .env("TR_TORRENT_DIR", dir)
            .env("TR_APP_VERSION", env!("CARGO_PKG_VERSION"));
        tokio::spawn(async move {
            match command.status().await {
                Ok(status) if !status.success() => {
                    warn!(code = ?status.code(), "script hook exited nonzero")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "script hook failed to run"),
            }
        });
    }

    // ------------------------------------------------------------------
    // RPC
    // ------------------------------------------------------------------

    /// Starts the RPC server when the settings enable it.
    pub async fn start_rpc(
        self: &Arc<Self>,
    ) -> Result<Option<tokio::task::JoinHandle<()>>, SessionError> {
        let config = {
            let settings = self.settings.read();
            if !settings.rpc_enabled {
                return Ok(None);
            }
            settings.rpc_config(&self.config_dir)
        };

        let server = RpcServer::new(config, Arc::new(SessionRpc(self.clone())));
        Ok(Some(server.start().await?))
    }

    pub fn rpc_handler(self: &Arc<Self>) -> Arc<dyn RpcHandler> {
        Arc::new(SessionRpc(self.clone()))
    }
}

enum ScriptHook {
    Added,
    Done,
    DoneSeeding,
}

// ----------------------------------------------------------------------
// RPC method dispatch
// ----------------------------------------------------------------------

struct SessionRpc(Arc<Session>);

impl RpcHandler for SessionRpc {
    fn dispatch(&self, method: &str, arguments: &Json) -> Result<Json, String> {
        let session = &self.0;
        if session.is_closing() {
            return Err("session is closing".to_string());
        }

        match method {
            "session-get" => Ok(session.rpc_session_get()),
            "session-set" => session.rpc_session_set(arguments),
            "session-stats" => Ok(session.rpc_session_stats()),
            "torrent-get" => Ok(session.rpc_torrent_get(arguments)),
            "torrent-start" => session.rpc_for_each(arguments, |s, id| s.start_torrent(id)),
            "torrent-stop" => session.rpc_for_each(arguments, |s, id| s.stop_torrent(id)),
            "torrent-remove" => session.rpc_for_each(arguments, |s, id| s.remove_torrent(id)),
            "torrent-set" => session.rpc_torrent_set(arguments),
            "port-test" => Err("method not supported".to_string()),
            _ => Err("method not recognized".to_string()),
        }
    }
}

impl Session {
    fn rpc_session_get(&self) -> Json {
        let settings = self.settings.read();
        json!({
            "version": concat!("shoal ", env!("CARGO_PKG_VERSION")),
            "rpc-version": 17,
            "config-dir": self.config_dir.to_string_lossy(),
            "download-dir": settings.download_dir.to_string_lossy(),
            "peer-port": self.peer_port(),
            "peer-limit-global": settings.peer_limit_global,
            "peer-limit-per-torrent": settings.peer_limit_per_torrent,
            "speed-limit-down": settings.speed_limit_down_kbps,
            "speed-limit-down-enabled": settings.speed_limit_down_enabled,
            "speed-limit-up": settings.speed_limit_up_kbps,
            "speed-limit-up-enabled": settings.speed_limit_up_enabled,
            "alt-speed-enabled": self.is_turtle_enabled(),
            "alt-speed-up": settings.alt_speed_up_kbps,
            "alt-speed-down": settings.alt_speed_down_kbps,
            "port-forwarding-enabled": settings.port_forwarding_enabled,
            "blocklist-enabled": settings.blocklist_enabled,
            "blocklist-size": self.blocklist.read().rule_count(),
        })
    }

    fn rpc_session_set(&self, arguments: &Json) -> Result<Json, String> {
        {
            let mut settings = self.settings.write();
            if let Some(v) = arguments.get("speed-limit-up").and_then(Json::as_u64) {
                settings.speed_limit_up_kbps = v;
            }
            if let Some(v) = arguments
                .get("speed-limit-up-enabled")
                .and_then(Json::as_bool)
            {
                settings.speed_limit_up_enabled = v;
            }
            if let Some(v) = arguments.get("speed-limit-down").and_then(Json::as_u64) {
                settings.speed_limit_down_kbps = v;
            }
            if let Some(v) = arguments
                .get("speed-limit-down-enabled")
                .and_then(Json::as_bool)
            {
                settings.speed_limit_down_enabled = v;
            }
            if let Some(v) = arguments.get("download-dir").and_then(Json::as_str) {
                settings.download_dir = PathBuf::from(v);
            }
        }

        if let Some(v) = arguments.get("alt-speed-enabled").and_then(Json::as_bool) {
            self.set_turtle_enabled(v);
        }
        if let Some(v) = arguments.get("peer-port").and_then(Json::as_u64) {
            let port = u16::try_from(v).map_err(|_| "invalid peer-port".to_string())?;
            self.set_peer_port(port);
            self.settings.write().peer_port = port;
        }

        self.apply_speed_limits();
        Ok(json!({}))
    }

    fn rpc_session_stats(&self) -> Json {
        let now = Instant::now();
        let mut active = 0;
        let mut paused = 0;
        for entry in self.torrents_by_id.iter() {
            if entry.value().lock().is_running() {
                active += 1;
            } else {
                paused += 1;
            }
        }

        json!({
            "torrentCount": self.torrent_count(),
            "activeTorrentCount": active,
            "pausedTorrentCount": paused,
            "downloadSpeed": self.bandwidth.raw_speed_bps(Direction::Down, now),
            "uploadSpeed": self.bandwidth.raw_speed_bps(Direction::Up, now),
        })
    }

    fn rpc_torrent_get(&self, arguments: &Json) -> Json {
        let ids = self.rpc_ids(arguments);
        let announcer = self.announcer.lock();

        let mut torrents = Vec::new();
        for id in ids {
            let Ok(shared) = self.torrent(id) else {
                continue;
            };
            let torrent = shared.lock();

            let size_when_done = torrent.size_when_done();
            let left = torrent.left_until_done();
            let percent_done = if size_when_done == 0 {
                1.0
            } else {
                (size_when_done - left.min(size_when_done)) as f64 / size_when_done as f64
            };

            let tracker_stats: Vec<Json> = announcer
                .tracker_snapshots(&torrent.info_hash())
                .into_iter()
                .map(|snapshot| {
                    json!({
                        "tier": snapshot.tier_id,
                        "id": snapshot.tracker_id,
                        "announce": snapshot.announce_url,
                        "sitename": snapshot.sitename,
                        "seederCount": snapshot.seeder_count,
                        "leecherCount": snapshot.leecher_count,
                        "downloadCount": snapshot.download_count,
                        "lastAnnounceResult": snapshot.last_announce_str,
                        "lastAnnounceSucceeded": snapshot.last_announce_succeeded,
                        "lastAnnounceTime": snapshot.last_announce_time,
                        "nextAnnounceTime": snapshot.next_announce_time,
                    })
                })
                .collect();

            torrents.push(json!({
                "id": torrent.id(),
                "name": torrent.name.clone(),
                "hashString": torrent.info_hash().to_hex(),
                "status": rpc_status(&torrent),
                "totalSize": torrent.total_size(),
                "sizeWhenDone": size_when_done,
                "leftUntilDone": left,
                "percentDone": percent_done,
                "haveValid": torrent.completion.has_valid(),
                "downloadedEver": torrent.downloaded.total(),
                "uploadedEver": torrent.uploaded.total(),
                "corruptEver": torrent.corrupt.total(),
                "addedDate": torrent.added_date,
                "doneDate": torrent.done_date,
                "activityDate": torrent.activity_date,
                "secondsSeeding": torrent.seconds_seeding,
                "secondsDownloading": torrent.seconds_downloading,
                "labels": torrent.labels.clone(),
                "downloadDir": torrent.download_dir.to_string_lossy(),
                "peer-limit": torrent.max_peers,
                "trackerStats": tracker_stats,
            }));
        }

        json!({ "torrents": torrents })
    }

    fn rpc_torrent_set(&self, arguments: &Json) -> Result<Json, String> {
        let ids = self.rpc_ids(arguments);
        for id in ids {
            let Ok(shared) = self.torrent(id) else {
                continue;
            };
            let mut torrent = shared.lock();

            if let Some(labels) = arguments.get("labels").and_then(Json::as_array) {
                torrent.labels = labels
                    .iter()
                    .filter_map(Json::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
                torrent.set_dirty();
            }

            if let Some(files) = arguments.get("files-wanted").and_then(Json::as_array) {
                let files: Vec<usize> =
                    files.iter().filter_map(Json::as_u64).map(|v| v as usize).collect();
                torrent.set_files_wanted(&files, true);
            }
            if let Some(files) = arguments.get("files-unwanted").and_then(Json::as_array) {
                let files: Vec<usize> =
                    files.iter().filter_map(Json::as_u64).map(|v| v as usize).collect();
                torrent.set_files_wanted(&files, false);
            }

            if let Some(limit) = arguments.get("uploadLimit").and_then(Json::as_u64) {
                torrent.speed_limit_up.bytes_per_sec = limit * 1000;
                torrent.set_dirty();
            }
            if let Some(enabled) = arguments.get("uploadLimited").and_then(Json::as_bool) {
                torrent.speed_limit_up.is_limited = enabled;
                torrent.set_dirty();
            }
            if let Some(limit) = arguments.get("downloadLimit").and_then(Json::as_u64) {
                torrent.speed_limit_down.bytes_per_sec = limit * 1000;
                torrent.set_dirty();
            }
            if let Some(enabled) = arguments.get("downloadLimited").and_then(Json::as_bool) {
                torrent.speed_limit_down.is_limited = enabled;
                torrent.set_dirty();
            }
        }
        Ok(json!({}))
    }

    fn rpc_for_each(
        &self,
        arguments: &Json,
        f: impl Fn(&Session, TorrentId) -> Result<(), SessionError>,
    ) -> Result<Json, String> {
        for id in self.rpc_ids(arguments) {
            match f(self, id) {
                Ok(()) | Err(SessionError::NotFound) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(json!({}))
    }

    // `ids` may be absent (all torrents), a single number, or a list
    fn rpc_ids(&self, arguments: &Json) -> Vec<TorrentId> {
        match arguments.get("ids") {
            None => self.torrent_ids(),
            Some(Json::Number(n)) => n
                .as_u64()
                .map(|id| vec![id as TorrentId])
                .unwrap_or_default(),
            Some(Json::Array(list)) => list
                .iter()
                .filter_map(Json::as_u64)
                .map(|id| id as TorrentId)
                .collect(),
            Some(Json::String(_)) => self.torrent_ids(), // "recently-active"
            _ => Vec::new(),
        }
    }
}

fn rpc_status(torrent: &Torrent) -> u8 {
    match torrent.run_state() {
        RunState::Stopped => 0,
        RunState::Checking => 2,
        RunState::Queued => 3,
        RunState::Downloading => 4,
        RunState::Seeding => 6,
    }
}

// ----------------------------------------------------------------------
// Clock helpers
// ----------------------------------------------------------------------

fn remaining_time(deadline: Instant) -> Result<Duration, ()> {
    let now = Instant::now();
    if now >= deadline {
        Err(())
    } else {
        Ok(deadline - now)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// epoch day zero was a Thursday; the announcer's week starts Sunday
fn minute_of_week(now: u64) -> usize {
    ((now / 60) as usize + 4 * MINUTES_PER_DAY) % MINUTES_PER_WEEK
}

fn random_port(settings: &Settings) -> u16 {
    let low = settings.peer_port_random_low;
    let high = settings.peer_port_random_high.max(low);
    rand::random_range(low..=high)
}
