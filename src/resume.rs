//! Per-torrent resume files.
//!
//! Everything a torrent needs to restart without re-verifying is persisted
//! as one bencoded dictionary at `<config>/resume/<name>.<hash>.resume`.
//! Saves are write-then-rename so a crash leaves either the old file or
//! the new one, never a torn one. A missing file on load is not an error;
//! it just means a fresh torrent.
//!
//! Two legacy progress shapes are tolerated read-only: a per-file
//! `time_checked` entry (integer or per-piece list) and a bare `bitfield`
//! in place of `blocks`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bencode::{decode, encode, key, Dict, Value};
use crate::bitfield::Bitfield;
use crate::tracker::{parse_compact_peers, parse_compact_peers6};
use crate::torrent::{LimitMode, Priority, SpeedLimit, Torrent};

const MAX_REMEMBERED_PEERS: usize = 200;

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}

/// Which parts of the resume file to read or honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fields(u32);

impl Fields {
    pub const NONE: Fields = Fields(0);
    pub const CORRUPT: Fields = Fields(1);
    pub const DOWNLOAD_DIR: Fields = Fields(1 << 1);
    pub const INCOMPLETE_DIR: Fields = Fields(1 << 2);
    pub const DOWNLOADED: Fields = Fields(1 << 3);
    pub const UPLOADED: Fields = Fields(1 << 4);
    pub const MAX_PEERS: Fields = Fields(1 << 5);
    pub const RUN: Fields = Fields(1 << 6);
    pub const ADDED_DATE: Fields = Fields(1 << 7);
    pub const DONE_DATE: Fields = Fields(1 << 8);
    pub const ACTIVITY_DATE: Fields = Fields(1 << 9);
    pub const TIME_SEEDING: Fields = Fields(1 << 10);
    pub const TIME_DOWNLOADING: Fields = Fields(1 << 11);
    pub const BANDWIDTH_PRIORITY: Fields = Fields(1 << 12);
    pub const PEERS: Fields = Fields(1 << 13);
    pub const PROGRESS: Fields = Fields(1 << 14);
    pub const FILE_PRIORITIES: Fields = Fields(1 << 15);
    pub const DND: Fields = Fields(1 << 16);
    pub const SPEEDLIMIT: Fields = Fields(1 << 17);
    pub const RATIOLIMIT: Fields = Fields(1 << 18);
    pub const IDLELIMIT: Fields = Fields(1 << 19);
    pub const FILENAMES: Fields = Fields(1 << 20);
    pub const NAME: Fields = Fields(1 << 21);
    pub const LABELS: Fields = Fields(1 << 22);

    pub const ALL: Fields = Fields(u32::MAX);

    pub fn contains(self, other: Fields) -> bool {
        self.0 & other.0 != 0
    }

    pub fn remove(self, other: Fields) -> Fields {
        Fields(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Fields {
    type Output = Fields;

    fn bitor(self, rhs: Fields) -> Fields {
        Fields(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Fields {
    fn bitor_assign(&mut self, rhs: Fields) {
        self.0 |= rhs.0;
    }
}

/// Caller-supplied overrides: mandatory values win over the file, fallback
/// values fill whatever neither set.
#[derive(Debug, Clone, Default)]
pub struct CtorValues {
    pub paused: Option<bool>,
    pub max_peers: Option<u16>,
    pub download_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct Ctor {
    pub mandatory: CtorValues,
    pub fallback: CtorValues,
}

// ----------------------------------------------------------------------
// Save
// ----------------------------------------------------------------------

pub fn save(torrent: &Torrent, config_dir: &Path) -> Result<(), ResumeError> {
    let path = torrent.resume_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let top = build_resume_dict(torrent);
    let encoded = encode(&Value::Dict(top));

    // write-then-rename keeps the old file intact if we die mid-write
    let tmp = path.with_extension("resume.tmp");
    std::fs::write(&tmp, &encoded)?;
    std::fs::rename(&tmp, &path)?;

    debug!(path = %path.display(), "saved resume file");
    Ok(())
}

fn build_resume_dict(torrent: &Torrent) -> Dict {
    let mut top = Dict::new();

    top.insert(
        key("activity-date"),
        Value::Integer(torrent.activity_date as i64),
    );
    top.insert(key("added-date"), Value::Integer(torrent.added_date as i64));
    top.insert(
        key("bandwidth-priority"),
        Value::Integer(torrent.bandwidth_priority.score() as i64),
    );
    top.insert(key("corrupt"), Value::Integer(torrent.corrupt.total() as i64));
    top.insert(
        key("destination"),
        Value::string(&torrent.download_dir.to_string_lossy()),
    );
    top.insert(key("done-date"), Value::Integer(torrent.done_date as i64));
    top.insert(
        key("downloaded"),
        Value::Integer(torrent.downloaded.total() as i64),
    );
    top.insert(
        key("downloading-time-seconds"),
        Value::Integer(torrent.seconds_downloading as i64),
    );
    if let Some(dir) = &torrent.incomplete_dir {
        top.insert(key("incomplete-dir"), Value::string(&dir.to_string_lossy()));
    }
    top.insert(key("max-peers"), Value::Integer(torrent.max_peers as i64));
    top.insert(key("name"), Value::string(&torrent.name));
    top.insert(key("paused"), Value::from(!torrent.is_running()));
    top.insert(
        key("seeding-time-seconds"),
        Value::Integer(torrent.seconds_seeding as i64),
    );
    top.insert(
        key("uploaded"),
        Value::Integer(torrent.uploaded.total() as i64),
    );

    if !torrent.labels.is_empty() {
        top.insert(
            key("labels"),
            Value::List(torrent.labels.iter().map(|l| Value::string(l)).collect()),
        );
    }

    save_peers(&mut top, torrent);
    save_dnd(&mut top, torrent);
    save_file_priorities(&mut top, torrent);
    save_filenames(&mut top, torrent);
    save_speed_limits(&mut top, torrent);
    save_ratio_limit(&mut top, torrent);
    save_idle_limit(&mut top, torrent);
    save_progress(&mut top, torrent);

    top
}

fn save_peers(top: &mut Dict, torrent: &Torrent) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for addr in torrent.resume_peers.iter().take(MAX_REMEMBERED_PEERS) {
        match addr {
            SocketAddr::V4(a) => {
                v4.extend_from_slice(&a.ip().octets());
                v4.extend_from_slice(&a.port().to_be_bytes());
            }
            SocketAddr::V6(a) => {
                v6.extend_from_slice(&a.ip().octets());
                v6.extend_from_slice(&a.port().to_be_bytes());
            }
        }
    }
    if !v4.is_empty() {
        top.insert(key("peers2"), Value::Bytes(Bytes::from(v4)));
    }
    if !v6.is_empty() {
        top.insert(key("peers2-6"), Value::Bytes(Bytes::from(v6)));
    }
}

fn save_dnd(top: &mut Dict, torrent: &Torrent) {
    let n = torrent.file_count();
    let mut dnd = Vec::with_capacity(n);
    let mut wanted = Vec::with_capacity(n);
    for i in 0..n {
        dnd.push(Value::from(!torrent.file_is_wanted(i)));
        wanted.push(Value::from(torrent.file_is_wanted(i)));
    }
    top.insert(key("dnd"), Value::List(dnd));
    top.insert(key("files-wanted"), Value::List(wanted));
}

fn save_file_priorities(top: &mut Dict, torrent: &Torrent) {
    let priorities = (0..torrent.file_count())
        .map(|i| Value::Integer(torrent.file_priority(i).score() as i64))
        .collect();
    top.insert(key("priority"), Value::List(priorities));
}

fn save_filenames(top: &mut Dict, torrent: &Torrent) {
    if !torrent.has_renamed_files() {
        return;
    }
    let files = (0..torrent.file_count())
        .map(|i| {
            torrent
                .file_subpath(i)
                .map(|p| Value::string(&p.to_string_lossy()))
                .unwrap_or_else(|| Value::string(""))
        })
        .collect();
    top.insert(key("files"), Value::List(files));
}

fn save_speed_limits(top: &mut Dict, torrent: &Torrent) {
    top.insert(
        key("speed-limit-down"),
        Value::Dict(speed_limit_dict(&torrent.speed_limit_down)),
    );
    top.insert(
        key("speed-limit-up"),
        Value::Dict(speed_limit_dict(&torrent.speed_limit_up)),
    );
}

fn speed_limit_dict(limit: &SpeedLimit) -> Dict {
    let mut d = Dict::new();
    d.insert(key("speed-Bps"), Value::Integer(limit.bytes_per_sec as i64));
    d.insert(
        key("use-global-speed-limit"),
        Value::from(limit.honors_session_limit),
    );
    d.insert(key("use-speed-limit"), Value::from(limit.is_limited));
    d
}

fn save_ratio_limit(top: &mut Dict, torrent: &Torrent) {
    let mut d = Dict::new();
    d.insert(
        key("ratio-limit"),
        Value::string(&format!("{}", torrent.ratio_limit)),
    );
    d.insert(key("ratio-mode"), Value::Integer(torrent.ratio_mode.as_int()));
    top.insert(key("ratio-limit"), Value::Dict(d));
}

fn save_idle_limit(top: &mut Dict, torrent: &Torrent) {
    let mut d = Dict::new();
    d.insert(
        key("idle-limit"),
        Value::Integer(torrent.idle_limit_minutes as i64),
    );
    d.insert(key("idle-mode"), Value::Integer(torrent.idle_mode.as_int()));
    top.insert(key("idle-limit"), Value::Dict(d));
}

fn bitfield_to_value(b: &Bitfield) -> Value {
    if b.has_none() || b.is_empty() {
        Value::string("none")
    } else if b.has_all() {
        Value::string("all")
    } else {
        Value::Bytes(b.raw())
    }
}

fn value_to_bitfield(b: &mut Bitfield, raw: &[u8]) {
    if raw.is_empty() || raw == b"none" {
        b.set_has_none();
    } else if raw == b"all" {
        b.set_has_all();
    } else {
        b.set_from_raw(raw);
    }
}

fn save_progress(top: &mut Dict, torrent: &Torrent) {
    let mut prog = Dict::new();

    let mtimes = torrent
        .file_mtimes
        .iter()
        .map(|&t| Value::Integer(t))
        .collect();
    prog.insert(key("mtimes"), Value::List(mtimes));

    prog.insert(key("pieces"), bitfield_to_value(&torrent.checked_pieces));

    if torrent.is_seed() {
        prog.insert(key("have"), Value::string("all"));
    }

    prog.insert(key("blocks"), bitfield_to_value(torrent.completion.blocks()));

    top.insert(key("progress"), Value::Dict(prog));
}

// ----------------------------------------------------------------------
// Load
// ----------------------------------------------------------------------

/// Loads resume state in three passes: the ctor's mandatory values, then
/// the file for whatever is still unset, then the ctor's fallback values.
/// Returns the fields that got set.
pub fn load(torrent: &mut Torrent, fields_to_load: Fields, ctor: &Ctor, config_dir: &Path) -> Fields {
    let mut loaded = Fields::NONE;

    loaded |= set_from_ctor(torrent, fields_to_load, &ctor.mandatory);
    let remaining = fields_to_load.remove(loaded);
    loaded |= load_from_file(torrent, remaining, config_dir);
    let remaining = fields_to_load.remove(loaded);
    loaded |= set_from_ctor(torrent, remaining, &ctor.fallback);

    loaded
}

fn set_from_ctor(torrent: &mut Torrent, fields: Fields, values: &CtorValues) -> Fields {
    let mut ret = Fields::NONE;

    if fields.contains(Fields::RUN) {
        if let Some(paused) = values.paused {
            if paused {
                torrent.stop();
            } else {
                torrent.start();
            }
            ret |= Fields::RUN;
        }
    }

    if fields.contains(Fields::MAX_PEERS) {
        if let Some(max_peers) = values.max_peers {
            torrent.max_peers = max_peers;
            ret |= Fields::MAX_PEERS;
        }
    }

    if fields.contains(Fields::DOWNLOAD_DIR) {
        if let Some(dir) = &values.download_dir {
            torrent.download_dir = dir.clone();
            ret |= Fields::DOWNLOAD_DIR;
        }
    }

    ret
}

fn load_from_file(torrent: &mut Torrent, fields: Fields, config_dir: &Path) -> Fields {
    let mut loaded = Fields::NONE;
    let path = torrent.resume_path(config_dir);

    let buf = match std::fs::read(&path) {
        Ok(buf) => buf,
        Err(_) => return loaded, // fresh torrent
    };
    let top = match decode(&buf) {
        Ok(top) => top,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "couldn't parse resume file");
            return loaded;
        }
    };

    debug!(path = %path.display(), "read resume file");

    if fields.contains(Fields::CORRUPT) {
        if let Some(n) = top.get_int(b"corrupt") {
            torrent.corrupt.prev = n.max(0) as u64;
            loaded |= Fields::CORRUPT;
        }
    }

    if fields.contains(Fields::DOWNLOAD_DIR) {
        if let Some(dir) = top.get_str(b"destination").filter(|s| !s.is_empty()) {
            torrent.download_dir = PathBuf::from(dir);
            loaded |= Fields::DOWNLOAD_DIR;
        }
    }

    if fields.contains(Fields::INCOMPLETE_DIR) {
        if let Some(dir) = top.get_str(b"incomplete-dir").filter(|s| !s.is_empty()) {
            torrent.incomplete_dir = Some(PathBuf::from(dir));
            loaded |= Fields::INCOMPLETE_DIR;
        }
    }

    if fields.contains(Fields::DOWNLOADED) {
        if let Some(n) = top.get_int(b"downloaded") {
            torrent.downloaded.prev = n.max(0) as u64;
            loaded |= Fields::DOWNLOADED;
        }
    }

    if fields.contains(Fields::UPLOADED) {
        if let Some(n) = top.get_int(b"uploaded") {
            torrent.uploaded.prev = n.max(0) as u64;
            loaded |= Fields::UPLOADED;
        }
    }

    if fields.contains(Fields::MAX_PEERS) {
        if let Some(n) = top.get_int(b"max-peers") {
            torrent.max_peers = n.clamp(0, u16::MAX as i64) as u16;
            loaded |= Fields::MAX_PEERS;
        }
    }

    if fields.contains(Fields::RUN) {
        if let Some(paused) = top.get_int(b"paused") {
            if paused != 0 {
                torrent.stop();
            } else {
                torrent.start();
            }
            loaded |= Fields::RUN;
        }
    }

    if fields.contains(Fields::ADDED_DATE) {
        if let Some(n) = top.get_int(b"added-date") {
            torrent.added_date = n.max(0) as u64;
            loaded |= Fields::ADDED_DATE;
        }
    }

    if fields.contains(Fields::DONE_DATE) {
        if let Some(n) = top.get_int(b"done-date") {
            torrent.done_date = n.max(0) as u64;
            loaded |= Fields::DONE_DATE;
        }
    }

    if fields.contains(Fields::ACTIVITY_DATE) {
        if let Some(n) = top.get_int(b"activity-date") {
            torrent.activity_date = n.max(0) as u64;
            loaded |= Fields::ACTIVITY_DATE;
        }
    }

    if fields.contains(Fields::TIME_SEEDING) {
        if let Some(n) = top.get_int(b"seeding-time-seconds") {
            torrent.seconds_seeding = n.max(0) as u64;
            loaded |= Fields::TIME_SEEDING;
        }
    }

    if fields.contains(Fields::TIME_DOWNLOADING) {
        if let Some(n) = top.get_int(b"downloading-time-seconds") {
            torrent.seconds_downloading = n.max(0) as u64;
            loaded |= Fields::TIME_DOWNLOADING;
        }
    }

    if fields.contains(Fields::BANDWIDTH_PRIORITY) {
        if let Some(p) = top
            .get_int(b"bandwidth-priority")
            .and_then(|n| i8::try_from(n).ok())
            .and_then(Priority::from_score)
        {
            torrent.bandwidth_priority = p;
            loaded |= Fields::BANDWIDTH_PRIORITY;
        }
    }

    if fields.contains(Fields::PEERS) {
        loaded |= load_peers(&top, torrent);
    }

    // progress must land before file priorities: a finished torrent skips
    // priority loading entirely
    if fields.contains(Fields::PROGRESS) {
        loaded |= load_progress(&top, torrent);
    }

    if !torrent.is_done() && fields.contains(Fields::FILE_PRIORITIES) {
        loaded |= load_file_priorities(&top, torrent);
    }

    if fields.contains(Fields::DND) {
        loaded |= load_dnd(&top, torrent);
    }

    if fields.contains(Fields::SPEEDLIMIT) {
        loaded |= load_speed_limits(&top, torrent);
    }

    if fields.contains(Fields::RATIOLIMIT) {
        loaded |= load_ratio_limit(&top, torrent);
    }

    if fields.contains(Fields::IDLELIMIT) {
        loaded |= load_idle_limit(&top, torrent);
    }

    if fields.contains(Fields::FILENAMES) {
        loaded |= load_filenames(&top, torrent);
    }

    if fields.contains(Fields::NAME) {
        loaded |= load_name(&top, torrent);
    }

    if fields.contains(Fields::LABELS) {
        loaded |= load_labels(&top, torrent);
    }

    torrent.clear_dirty();
    loaded
}

fn load_peers(top: &Value, torrent: &mut Torrent) -> Fields {
    let mut peers = Vec::new();
    if let Some(raw) = top.get_bytes(b"peers2") {
        peers.extend(parse_compact_peers(raw));
    }
    if let Some(raw) = top.get_bytes(b"peers2-6") {
        peers.extend(parse_compact_peers6(raw));
    }

    if peers.is_empty() {
        return Fields::NONE;
    }
    torrent.resume_peers = peers;
    Fields::PEERS
}

fn load_dnd(top: &Value, torrent: &mut Torrent) -> Fields {
    let Some(list) = top.get(b"dnd").and_then(Value::as_list) else {
        return Fields::NONE;
    };
    if list.len() != torrent.file_count() {
        return Fields::NONE;
    }

    let unwanted: Vec<usize> = list
        .iter()
        .enumerate()
        .filter(|(_, v)| v.as_integer() == Some(1))
        .map(|(i, _)| i)
        .collect();
    let wanted: Vec<usize> = (0..torrent.file_count())
        .filter(|i| !unwanted.contains(i))
        .collect();

    torrent.set_files_wanted(&unwanted, false);
    torrent.set_files_wanted(&wanted, true);
    Fields::DND
}

fn load_file_priorities(top: &Value, torrent: &mut Torrent) -> Fields {
    let Some(list) = top.get(b"priority").and_then(Value::as_list) else {
        return Fields::NONE;
    };
    if list.len() != torrent.file_count() {
        return Fields::NONE;
    }

    for (i, v) in list.iter().enumerate() {
        if let Some(p) = v
            .as_integer()
            .and_then(|n| i8::try_from(n).ok())
            .and_then(Priority::from_score)
        {
            torrent.set_file_priority(i, p);
        }
    }
    Fields::FILE_PRIORITIES
}

fn load_speed_limits(top: &Value, torrent: &mut Torrent) -> Fields {
    let mut loaded = Fields::NONE;

    if let Some(d) = top.get(b"speed-limit-up") {
        if let Some(limit) = speed_limit_from_value(d) {
            torrent.speed_limit_up = limit;
            loaded |= Fields::SPEEDLIMIT;
        }
    }
    if let Some(d) = top.get(b"speed-limit-down") {
        if let Some(limit) = speed_limit_from_value(d) {
            torrent.speed_limit_down = limit;
            loaded |= Fields::SPEEDLIMIT;
        }
    }
    loaded
}

fn speed_limit_from_value(d: &Value) -> Option<SpeedLimit> {
    d.as_dict()?;
    Some(SpeedLimit {
        bytes_per_sec: d.get_int(b"speed-Bps").unwrap_or(0).max(0) as u64,
        is_limited: d.get_int(b"use-speed-limit") == Some(1),
        honors_session_limit: d.get_int(b"use-global-speed-limit") != Some(0),
    })
}

fn load_ratio_limit(top: &Value, torrent: &mut Torrent) -> Fields {
    let Some(d) = top.get(b"ratio-limit") else {
        return Fields::NONE;
    };
    if d.as_dict().is_none() {
        return Fields::NONE;
    }

    if let Some(ratio) = d.get_str(b"ratio-limit").and_then(|s| s.parse().ok()) {
        torrent.ratio_limit = ratio;
    }
    if let Some(mode) = d.get_int(b"ratio-mode").and_then(LimitMode::from_int) {
        torrent.ratio_mode = mode;
    }
    Fields::RATIOLIMIT
}

fn load_idle_limit(top: &Value, torrent: &mut Torrent) -> Fields {
    let Some(d) = top.get(b"idle-limit") else {
        return Fields::NONE;
    };
    if d.as_dict().is_none() {
        return Fields::NONE;
    }

    if let Some(minutes) = d.get_int(b"idle-limit") {
        torrent.idle_limit_minutes = minutes.clamp(0, u16::MAX as i64) as u16;
    }
    if let Some(mode) = d.get_int(b"idle-mode").and_then(LimitMode::from_int) {
        torrent.idle_mode = mode;
    }
    Fields::IDLELIMIT
}

fn load_filenames(top: &Value, torrent: &mut Torrent) -> Fields {
    let Some(list) = top.get(b"files").and_then(Value::as_list) else {
        return Fields::NONE;
    };

    for (i, v) in list.iter().enumerate().take(torrent.file_count()) {
        if let Some(subpath) = v.as_str().filter(|s| !s.is_empty()) {
            torrent.set_file_subpath(i, subpath);
        }
    }
    Fields::FILENAMES
}

fn load_name(top: &Value, torrent: &mut Torrent) -> Fields {
    let Some(name) = top.get_str(b"name").map(str::trim).filter(|s| !s.is_empty()) else {
        return Fields::NONE;
    };
    if name != torrent.name {
        torrent.name = name.to_string();
    }
    Fields::NAME
}

fn load_labels(top: &Value, torrent: &mut Torrent) -> Fields {
    let Some(list) = top.get(b"labels").and_then(Value::as_list) else {
        return Fields::NONE;
    };

    torrent.labels = list
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    Fields::LABELS
}

fn load_progress(top: &Value, torrent: &mut Torrent) -> Fields {
    let Some(prog) = top.get(b"progress") else {
        return Fields::NONE;
    };
    if prog.as_dict().is_none() {
        return Fields::NONE;
    }

    let n_files = torrent.file_count();
    let n_pieces = torrent.checked_pieces.len();

    // stored mtimes, one per file
    let mut mtimes: Vec<i64> = prog
        .get(b"mtimes")
        .and_then(Value::as_list)
        .map(|l| l.iter().filter_map(Value::as_integer).collect())
        .unwrap_or_default();

    let mut checked = Bitfield::new(n_pieces);
    if let Some(raw) = prog.get_bytes(b"pieces") {
        value_to_bitfield(&mut checked, raw);
    }

    // legacy shape: per-file `time_checked`, an int or a per-piece list
    if let Some(list) = prog.get(b"time_checked").and_then(Value::as_list) {
        mtimes.clear();
        for entry in list.iter().take(n_files) {
            let time_checked = match entry {
                Value::Integer(t) => *t,
                // [offset, per-piece times...]: the stalest piece rules
                Value::List(piece_times) if !piece_times.is_empty() => piece_times[1..]
                    .iter()
                    .filter_map(Value::as_integer)
                    .min()
                    .unwrap_or(0),
                _ => 0,
            };
            mtimes.push(time_checked);
        }
    }

    if mtimes.len() != n_files {
        debug!(
            got = mtimes.len(),
            expected = n_files,
            "mtime count mismatch; unknown files treated as untested"
        );
        mtimes.resize(n_files, 0);
    }

    // a file whose on-disk mtime changed needs its pieces re-verified
    for (file, &stored_mtime) in mtimes.iter().enumerate() {
        let disk_mtime = disk_mtime(torrent, file);
        if stored_mtime == 0 || disk_mtime != Some(stored_mtime) {
            let (begin, end) = torrent.pieces_in_file(file);
            checked.unset_span(begin as usize, end as usize);
        }
    }

    torrent.file_mtimes = mtimes;
    torrent.checked_pieces = checked;

    // block-level completion
    let mut blocks = Bitfield::new(torrent.completion.blocks().len());
    let mut found = true;
    if let Some(raw) = prog.get_bytes(b"blocks") {
        value_to_bitfield(&mut blocks, raw);
    } else if prog.get_str(b"have") == Some("all") {
        blocks.set_has_all();
    } else if let Some(raw) = prog.get_bytes(b"bitfield") {
        // oldest shape: a bare blocks bitfield
        blocks.set_from_raw(raw);
    } else {
        debug!("no blocks, have, or bitfield entry; torrent needs verification");
        found = false;
    }

    if found {
        torrent.completion.set_blocks(blocks);
    }

    Fields::PROGRESS
}

fn disk_mtime(torrent: &Torrent, file: usize) -> Option<i64> {
    let path = torrent.file_disk_path(file)?;
    let metadata = std::fs::metadata(path).ok()?;
    let mtime = metadata.modified().ok()?;
    mtime
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::bandwidth::Bandwidth;
    use crate::metainfo::{make_test_torrent, Metainfo};

    use super::*;

    fn fresh_torrent(download_dir: &Path) -> Torrent {
        let data = make_test_torrent("alpha", 5 * 16384, 16384, "http://t.example/announce");
        let meta = Metainfo::parse(&data).unwrap();
        Torrent::new(meta, download_dir.to_path_buf(), &Bandwidth::new(), 1000)
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = fresh_torrent(dir.path());

        let loaded = load(&mut torrent, Fields::ALL, &Ctor::default(), dir.path());
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = fresh_torrent(dir.path());

        torrent.uploaded.cur = 777;
        torrent.downloaded.cur = 888;
        torrent.corrupt.cur = 9;
        torrent.added_date = 1111;
        torrent.done_date = 2222;
        torrent.activity_date = 3333;
        torrent.seconds_seeding = 44;
        torrent.seconds_downloading = 55;
        torrent.max_peers = 66;
        torrent.labels = vec!["linux".to_string(), "iso".to_string()];
        torrent.ratio_limit = 2.5;
        torrent.ratio_mode = LimitMode::Single;
        torrent.idle_limit_minutes = 30;
        torrent.idle_mode = LimitMode::Unlimited;
        torrent.speed_limit_up = SpeedLimit {
            bytes_per_sec: 1024,
            is_limited: true,
            honors_session_limit: false,
        };
        torrent.resume_peers = vec!["10.0.0.1:6881".parse().unwrap(), "[::1]:6882".parse().unwrap()];
        torrent.completion.add_piece(1);
        torrent.completion.add_piece(3);

        save(&torrent, dir.path()).unwrap();

        let mut restored = fresh_torrent(dir.path());
        let loaded = load(&mut restored, Fields::ALL, &Ctor::default(), dir.path());

        assert!(loaded.contains(Fields::UPLOADED));
        assert!(loaded.contains(Fields::PROGRESS));
        assert!(loaded.contains(Fields::LABELS));

        assert_eq!(restored.uploaded.prev, 777);
        assert_eq!(restored.downloaded.prev, 888);
        assert_eq!(restored.corrupt.prev, 9);
        assert_eq!(restored.added_date, 1111);
        assert_eq!(restored.done_date, 2222);
        assert_eq!(restored.activity_date, 3333);
        assert_eq!(restored.seconds_seeding, 44);
        assert_eq!(restored.seconds_downloading, 55);
        assert_eq!(restored.max_peers, 66);
        assert_eq!(restored.labels, vec!["linux", "iso"]);
        assert_eq!(restored.ratio_limit, 2.5);
        assert_eq!(restored.ratio_mode, LimitMode::Single);
        assert_eq!(restored.idle_limit_minutes, 30);
        assert_eq!(restored.idle_mode, LimitMode::Unlimited);
        assert!(restored.speed_limit_up.is_limited);
        assert_eq!(restored.speed_limit_up.bytes_per_sec, 1024);
        assert!(!restored.speed_limit_up.honors_session_limit);
        assert_eq!(restored.resume_peers.len(), 2);
        assert!(restored.completion.has_block(1));
        assert!(restored.completion.has_block(3));
        assert!(!restored.completion.has_block(0));
        assert!(!restored.is_running());
    }

    #[test]
    fn test_mandatory_ctor_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = fresh_torrent(dir.path());
        torrent.max_peers = 10;
        save(&torrent, dir.path()).unwrap();

        let ctor = Ctor {
            mandatory: CtorValues {
                max_peers: Some(99),
                ..CtorValues::default()
            },
            ..Ctor::default()
        };

        let mut restored = fresh_torrent(dir.path());
        load(&mut restored, Fields::ALL, &ctor, dir.path());
        assert_eq!(restored.max_peers, 99);
    }

    #[test]
    fn test_fallback_ctor_fills_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = fresh_torrent(dir.path());

        // no file on disk; fallback should apply
        let ctor = Ctor {
            fallback: CtorValues {
                max_peers: Some(123),
                download_dir: Some(PathBuf::from("/somewhere/else")),
                ..CtorValues::default()
            },
            ..Ctor::default()
        };

        let loaded = load(&mut torrent, Fields::ALL, &ctor, dir.path());
        assert!(loaded.contains(Fields::MAX_PEERS));
        assert_eq!(torrent.max_peers, 123);
        assert_eq!(torrent.download_dir, PathBuf::from("/somewhere/else"));
    }

    #[test]
    fn test_seed_progress_saved_as_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = fresh_torrent(dir.path());
        torrent.completion.set_has_all();
        torrent.checked_pieces.set_has_all();
        save(&torrent, dir.path()).unwrap();

        let raw = std::fs::read(torrent.resume_path(dir.path())).unwrap();
        let top = decode(&raw).unwrap();
        let prog = top.get(b"progress").unwrap();
        assert_eq!(prog.get_str(b"have"), Some("all"));
        assert_eq!(prog.get_str(b"blocks"), Some("all"));

        let mut restored = fresh_torrent(dir.path());
        load(&mut restored, Fields::ALL, &Ctor::default(), dir.path());
        assert!(restored.is_seed());
    }

    #[test]
    fn test_changed_mtime_clears_checked_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let download_dir = dir.path().join("downloads");
        std::fs::create_dir_all(&download_dir).unwrap();

        let mut torrent = fresh_torrent(&download_dir);
        // the payload file exists on disk
        let payload = torrent.file_disk_path(0).unwrap();
        std::fs::write(&payload, b"data").unwrap();

        torrent.checked_pieces.set_has_all();
        torrent.completion.set_has_all();
        // stored mtime deliberately disagrees with the disk
        torrent.file_mtimes = vec![12345];
        save(&torrent, dir.path()).unwrap();

        let mut restored = fresh_torrent(&download_dir);
        load(&mut restored, Fields::ALL, &Ctor::default(), dir.path());

        // blocks load fine, but the checked set was invalidated
        assert!(restored.is_seed());
        assert_eq!(restored.checked_pieces.count_all(), 0);
    }

    #[test]
    fn test_matching_mtime_keeps_checked_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let download_dir = dir.path().join("downloads");
        std::fs::create_dir_all(&download_dir).unwrap();

        let mut torrent = fresh_torrent(&download_dir);
        let payload = torrent.file_disk_path(0).unwrap();
        std::fs::write(&payload, b"data").unwrap();

        torrent.checked_pieces.set_has_all();
        torrent.completion.set_has_all();
        let mtime = std::fs::metadata(&payload)
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        torrent.file_mtimes = vec![mtime];
        save(&torrent, dir.path()).unwrap();

        let mut restored = fresh_torrent(&download_dir);
        load(&mut restored, Fields::ALL, &Ctor::default(), dir.path());
        assert_eq!(restored.checked_pieces.count_all(), 5);
    }

    #[test]
    fn test_legacy_bitfield_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = fresh_torrent(dir.path());

        // hand-build a legacy resume file: progress.bitfield instead of blocks
        let mut legacy_blocks = Bitfield::new(5);
        legacy_blocks.set(0);
        legacy_blocks.set(4);

        let mut prog = Dict::new();
        prog.insert(key("bitfield"), Value::Bytes(legacy_blocks.raw()));
        let mut top = Dict::new();
        top.insert(key("progress"), Value::Dict(prog));

        let path = torrent.resume_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, encode(&Value::Dict(top))).unwrap();

        let loaded = load(&mut torrent, Fields::ALL, &Ctor::default(), dir.path());
        assert!(loaded.contains(Fields::PROGRESS));
        assert!(torrent.completion.has_block(0));
        assert!(torrent.completion.has_block(4));
        assert!(!torrent.completion.has_block(2));
    }

    #[test]
    fn test_legacy_time_checked_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = fresh_torrent(dir.path());

        let mut prog = Dict::new();
        prog.insert(
            key("time_checked"),
            Value::List(vec![Value::Integer(98765)]),
        );
        prog.insert(key("blocks"), Value::string("none"));
        let mut top = Dict::new();
        top.insert(key("progress"), Value::Dict(prog));

        let path = torrent.resume_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, encode(&Value::Dict(top))).unwrap();

        let loaded = load(&mut torrent, Fields::ALL, &Ctor::default(), dir.path());
        assert!(loaded.contains(Fields::PROGRESS));
        assert_eq!(torrent.file_mtimes, vec![98765]);
    }

    #[test]
    fn test_dnd_round_trip_with_multi_file() {
        let dir = tempfile::tempdir().unwrap();

        // two-file torrent built by hand
        let make = || {
            use crate::bencode::{key, Dict};
            let mut file_a = Dict::new();
            file_a.insert(key("length"), Value::Integer(16384));
            file_a.insert(key("path"), Value::List(vec![Value::string("a")]));
            let mut file_b = Dict::new();
            file_b.insert(key("length"), Value::Integer(16384));
            file_b.insert(key("path"), Value::List(vec![Value::string("b")]));

            let mut info = Dict::new();
            info.insert(key("files"), Value::List(vec![Value::Dict(file_a), Value::Dict(file_b)]));
            info.insert(key("name"), Value::string("pair"));
            info.insert(key("piece length"), Value::Integer(16384));
            info.insert(key("pieces"), Value::Bytes(Bytes::from(vec![0u8; 40])));

            let mut root = Dict::new();
            root.insert(key("info"), Value::Dict(info));
            let meta = Metainfo::parse(&encode(&Value::Dict(root))).unwrap();
            Torrent::new(meta, dir.path().to_path_buf(), &Bandwidth::new(), 0)
        };

        let mut torrent = make();
        torrent.set_files_wanted(&[1], false);
        save(&torrent, dir.path()).unwrap();

        let mut restored = make();
        // block the is_done() shortcut from skipping priorities
        let loaded = load(&mut restored, Fields::ALL, &Ctor::default(), dir.path());
        assert!(loaded.contains(Fields::DND));
        assert!(restored.file_is_wanted(0));
        assert!(!restored.file_is_wanted(1));
    }

    #[test]
    fn test_file_priorities_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = fresh_torrent(dir.path());
        torrent.set_file_priority(0, Priority::High);
        save(&torrent, dir.path()).unwrap();

        let mut restored = fresh_torrent(dir.path());
        let loaded = load(&mut restored, Fields::ALL, &Ctor::default(), dir.path());
        assert!(loaded.contains(Fields::FILE_PRIORITIES));
        assert_eq!(restored.file_priority(0), Priority::High);
    }

    #[test]
    fn test_save_is_atomic_over_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = fresh_torrent(dir.path());
        save(&torrent, dir.path()).unwrap();

        torrent.uploaded.cur = 42;
        save(&torrent, dir.path()).unwrap();

        // no stray tmp file left behind
        let resume_dir = dir.path().join("resume");
        let entries: Vec<_> = std::fs::read_dir(resume_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with(".resume"));
    }
}
