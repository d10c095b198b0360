//! A torrent and its per-session bookkeeping.
//!
//! The session owns a registry of these; everything here is plain state
//! and derived queries. Network activity happens in the announcer and the
//! peer layer, which read snapshots from here.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::announcer::TorrentStats;
use crate::bandwidth::Bandwidth;
use crate::bitfield::Bitfield;
use crate::blocks::BlockInfo;
use crate::completion::{Completeness, Completion, WantedPieces};
use crate::metainfo::{InfoHash, Metainfo};
use crate::peer::PeerId;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

pub type TorrentId = u32;

/// File and transfer priority. The wire sees only relative order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn score(self) -> i8 {
        match self {
            Priority::Low => -1,
            Priority::Normal => 0,
            Priority::High => 1,
        }
    }

    pub fn from_score(score: i8) -> Option<Self> {
        match score {
            -1 => Some(Priority::Low),
            0 => Some(Priority::Normal),
            1 => Some(Priority::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Queued,
    Checking,
    Downloading,
    Seeding,
}

/// A persisted counter split into the part loaded from the resume file and
/// the part accumulated this session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteCount {
    pub prev: u64,
    pub cur: u64,
}

impl ByteCount {
    pub fn total(&self) -> u64 {
        self.prev + self.cur
    }
}

/// How a per-torrent speed limit interacts with the session's.
#[derive(Debug, Clone, Copy)]
pub struct SpeedLimit {
    pub bytes_per_sec: u64,
    pub is_limited: bool,
    pub honors_session_limit: bool,
}

impl Default for SpeedLimit {
    fn default() -> Self {
        Self {
            bytes_per_sec: 0,
            is_limited: false,
            honors_session_limit: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitMode {
    #[default]
    Global,
    Single,
    Unlimited,
}

impl LimitMode {
    pub fn as_int(self) -> i64 {
        match self {
            LimitMode::Global => 0,
            LimitMode::Single => 1,
            LimitMode::Unlimited => 2,
        }
    }

    pub fn from_int(v: i64) -> Option<Self> {
        match v {
            0 => Some(LimitMode::Global),
            1 => Some(LimitMode::Single),
            2 => Some(LimitMode::Unlimited),
            _ => None,
        }
    }
}

pub struct Torrent {
    id: TorrentId,
    info_hash: InfoHash,
    metainfo: Option<Metainfo>,
    pub name: String,
    pub peer_id: PeerId,

    pub completion: Completion,
    run_state: RunState,

    pub downloaded: ByteCount,
    pub uploaded: ByteCount,
    pub corrupt: ByteCount,

    pub added_date: u64,
    pub done_date: u64,
    pub activity_date: u64,
    pub seconds_seeding: u64,
    pub seconds_downloading: u64,

    pub labels: Vec<String>,
    pub download_dir: PathBuf,
    pub incomplete_dir: Option<PathBuf>,

    pub bandwidth: Bandwidth,
    pub bandwidth_priority: Priority,

    // per-file state, parallel to metainfo.files
    file_priorities: Vec<Priority>,
    files_wanted: Vec<bool>,
    file_subpaths: Vec<Option<String>>,
    pub file_mtimes: Vec<i64>,
    pub checked_pieces: Bitfield,
    pieces_wanted: Bitfield,

    pub speed_limit_up: SpeedLimit,
    pub speed_limit_down: SpeedLimit,
    pub ratio_limit: f64,
    pub ratio_mode: LimitMode,
    pub idle_limit_minutes: u16,
    pub idle_mode: LimitMode,
    pub max_peers: u16,

    /// Peers worth remembering across restarts.
    pub resume_peers: Vec<SocketAddr>,

    is_dirty: bool,
}

impl Torrent {
    pub fn new(
        metainfo: Metainfo,
        download_dir: PathBuf,
        session_bandwidth: &Bandwidth,
        now: u64,
    ) -> Self {
        let info_hash = metainfo.info_hash;
        let name = metainfo.name.clone();
        let n_files = metainfo.files.len();
        let n_pieces = metainfo.piece_count() as usize;
        let info = BlockInfo::new(metainfo.total_size, metainfo.piece_length);

        let mut torrent = Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            info_hash,
            metainfo: Some(metainfo),
            name,
            peer_id: PeerId::generate(),
            completion: Completion::new(info),
            run_state: RunState::Stopped,
            downloaded: ByteCount::default(),
            uploaded: ByteCount::default(),
            corrupt: ByteCount::default(),
            added_date: now,
            done_date: 0,
            activity_date: 0,
            seconds_seeding: 0,
            seconds_downloading: 0,
            labels: Vec::new(),
            download_dir,
            incomplete_dir: None,
            bandwidth: session_bandwidth.new_child(),
            bandwidth_priority: Priority::Normal,
            file_priorities: vec![Priority::Normal; n_files],
            files_wanted: vec![true; n_files],
            file_subpaths: vec![None; n_files],
            file_mtimes: vec![0; n_files],
            checked_pieces: Bitfield::new(n_pieces),
            pieces_wanted: Bitfield::full(n_pieces),
            speed_limit_up: SpeedLimit::default(),
            speed_limit_down: SpeedLimit::default(),
            ratio_limit: 0.0,
            ratio_mode: LimitMode::Global,
            idle_limit_minutes: 0,
            idle_mode: LimitMode::Global,
            max_peers: 50,
            resume_peers: Vec::new(),
            is_dirty: false,
        };
        torrent.rebuild_wanted_pieces();
        torrent
    }

    pub fn id(&self) -> TorrentId {
        self.id
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn metainfo(&self) -> Option<&Metainfo> {
        self.metainfo.as_ref()
    }

    pub fn has_metainfo(&self) -> bool {
        self.metainfo.is_some()
    }

    pub fn file_count(&self) -> usize {
        self.file_priorities.len()
    }

    pub fn total_size(&self) -> u64 {
        self.metainfo.as_ref().map(|m| m.total_size).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Run state
    // ------------------------------------------------------------------

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.run_state,
            RunState::Downloading | RunState::Seeding | RunState::Checking
        )
    }

    pub fn start(&mut self) {
        self.run_state = if self.is_done() {
            RunState::Seeding
        } else {
            RunState::Downloading
        };
        self.set_dirty();
    }

    pub fn stop(&mut self) {
        self.run_state = RunState::Stopped;
        self.set_dirty();
    }

    pub fn set_queued(&mut self) {
        self.run_state = RunState::Queued;
    }

    pub fn set_checking(&mut self) {
        self.run_state = RunState::Checking;
    }

    // ------------------------------------------------------------------
    // Completion-derived queries
    // ------------------------------------------------------------------

    pub fn status(&self) -> Completeness {
        if !self.has_metainfo() {
            return Completeness::Leech;
        }
        self.completion.status(&self.wanted_view())
    }

    pub fn has_total(&self) -> u64 {
        self.completion.has_total()
    }

    pub fn size_when_done(&self) -> u64 {
        self.completion.size_when_done(&self.wanted_view())
    }

    pub fn left_until_done(&self) -> u64 {
        if !self.has_metainfo() {
            return u64::MAX;
        }
        self.completion.left_until_done(&self.wanted_view())
    }

    pub fn is_done(&self) -> bool {
        self.has_metainfo() && self.left_until_done() == 0
    }

    pub fn is_seed(&self) -> bool {
        self.completion.has_all()
    }

    pub fn is_partial_seed(&self) -> bool {
        self.status() == Completeness::PartialSeed
    }

    /// Snapshot for announce requests.
    pub fn announce_stats(&self) -> TorrentStats {
        TorrentStats {
            left: self.left_until_done(),
            is_partial_seed: self.is_partial_seed(),
            is_done: self.is_done(),
            is_running: self.is_running(),
        }
    }

    fn wanted_view(&self) -> WantedView<'_> {
        WantedView {
            pieces_wanted: &self.pieces_wanted,
        }
    }

    // ------------------------------------------------------------------
    // File priorities and wanted-ness
    // ------------------------------------------------------------------

    pub fn file_priority(&self, file: usize) -> Priority {
        self.file_priorities.get(file).copied().unwrap_or_default()
    }

    pub fn set_file_priority(&mut self, file: usize, priority: Priority) {
        if let Some(slot) = self.file_priorities.get_mut(file) {
            *slot = priority;
            self.set_dirty();
        }
    }

    /// A piece's priority is the highest priority of the files it touches.
    pub fn piece_priority(&self, piece: u32) -> Priority {
        let Some(meta) = &self.metainfo else {
            return Priority::Normal;
        };
        let begin = piece as u64 * meta.piece_length as u64;
        let end = (begin + meta.piece_length as u64).min(meta.total_size);

        let mut best = Priority::Low;
        let mut touched = false;
        for (i, file) in meta.files.iter().enumerate() {
            if file.offset < end && file.offset + file.length.max(1) > begin {
                touched = true;
                if self.file_priority(i).score() > best.score() {
                    best = self.file_priority(i);
                }
            }
        }
        if touched {
            best
        } else {
            Priority::Normal
        }
    }

    pub fn file_is_wanted(&self, file: usize) -> bool {
        self.files_wanted.get(file).copied().unwrap_or(true)
    }

    pub fn set_files_wanted(&mut self, files: &[usize], wanted: bool) {
        for &file in files {
            if let Some(slot) = self.files_wanted.get_mut(file) {
                *slot = wanted;
            }
        }
        self.rebuild_wanted_pieces();
        self.completion.invalidate_size_when_done();
        self.set_dirty();
    }

    pub fn piece_is_wanted(&self, piece: u32) -> bool {
        self.pieces_wanted.has(piece as usize)
    }

    // a piece is wanted when any file overlapping it is wanted
    fn rebuild_wanted_pieces(&mut self) {
        let Some(meta) = &self.metainfo else {
            return;
        };

        let piece_length = meta.piece_length as u64;
        let n_pieces = meta.piece_count();
        let mut wanted = Bitfield::new(n_pieces as usize);

        for (i, file) in meta.files.iter().enumerate() {
            if !self.files_wanted.get(i).copied().unwrap_or(true) {
                continue;
            }
            if piece_length == 0 {
                continue;
            }
            let first = (file.offset / piece_length) as usize;
            let last_byte = file.offset + file.length.max(1) - 1;
            let last = (last_byte / piece_length) as usize;
            wanted.set_span(first, (last + 1).min(n_pieces as usize));
        }

        self.pieces_wanted = wanted;
    }

    /// Pieces covered by one file, as a half-open range.
    pub fn pieces_in_file(&self, file: usize) -> (u32, u32) {
        let Some(meta) = &self.metainfo else {
            return (0, 0);
        };
        let Some(f) = meta.files.get(file) else {
            return (0, 0);
        };
        let piece_length = meta.piece_length as u64;
        if piece_length == 0 {
            return (0, 0);
        }
        let begin = (f.offset / piece_length) as u32;
        let end = ((f.offset + f.length.max(1) - 1) / piece_length) as u32 + 1;
        (begin, end.min(meta.piece_count()))
    }

    pub fn file_subpath(&self, file: usize) -> Option<PathBuf> {
        match self.file_subpaths.get(file) {
            Some(Some(renamed)) => Some(PathBuf::from(renamed)),
            Some(None) => self
                .metainfo
                .as_ref()
                .and_then(|m| m.files.get(file))
                .map(|f| f.path.clone()),
            None => None,
        }
    }

    pub fn set_file_subpath(&mut self, file: usize, subpath: &str) {
        if let Some(slot) = self.file_subpaths.get_mut(file) {
            *slot = Some(subpath.to_string());
            self.set_dirty();
        }
    }

    pub fn has_renamed_files(&self) -> bool {
        self.file_subpaths.iter().any(Option::is_some)
    }

    /// Where the file lives (or will live) on disk right now.
    pub fn file_disk_path(&self, file: usize) -> Option<PathBuf> {
        let subpath = self.file_subpath(file)?;
        let dir = if !self.is_done() {
            self.incomplete_dir.as_ref().unwrap_or(&self.download_dir)
        } else {
            &self.download_dir
        };
        Some(dir.join(subpath))
    }

    // ------------------------------------------------------------------
    // Dirty tracking
    // ------------------------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn set_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.is_dirty = false;
    }

    /// `<name>.<16-hex-prefix>.resume` under the config's resume dir.
    pub fn resume_path(&self, config_dir: &Path) -> PathBuf {
        let hex = self.info_hash.to_hex();
        config_dir
            .join("resume")
            .join(format!("{}.{}.resume", self.name, &hex[..16]))
    }
}

struct WantedView<'a> {
    pieces_wanted: &'a Bitfield,
}

impl WantedPieces for WantedView<'_> {
    fn piece_is_wanted(&self, piece: u32) -> bool {
        self.pieces_wanted.has(piece as usize)
    }
}
