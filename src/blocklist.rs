//! IP blocklists.
//!
//! Blocklists live in a directory as compiled `.bin` files: sorted
//! `(begin, end)` IPv4 pairs, big-endian, eight bytes per rule. Text
//! sources in the same directory (eMule/PeerGuardian `name:a.b.c.d-e.f.g.h`
//! lines) are compiled to a sibling `.bin` whenever they are newer than
//! their compiled form.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IpRange {
    begin: u32,
    end: u32,
}

#[derive(Debug, Default)]
pub struct Blocklist {
    ranges: Vec<IpRange>,
    enabled: bool,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles any newer text sources, then loads every `.bin` in `dir`.
    /// A missing directory yields an empty list.
    pub fn load_dir(dir: &Path) -> io::Result<Self> {
        let mut list = Self::new();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(list),
            Err(e) => return Err(e),
        };

        let mut bins: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().is_some_and(|e| e == "bin") {
                if !bins.contains(&path) {
                    bins.push(path);
                }
            } else if let Some(bin) = compile_if_newer(&path)? {
                if !bins.contains(&bin) {
                    bins.push(bin);
                }
            }
        }

        for bin in bins {
            match list.load_bin(&bin) {
                Ok(n) => debug!(path = %bin.display(), rules = n, "loaded blocklist"),
                Err(e) => warn!(path = %bin.display(), error = %e, "skipping blocklist"),
            }
        }

        list.ranges.sort_by_key(|r| r.begin);
        Ok(list)
    }

    fn load_bin(&mut self, path: &Path) -> io::Result<usize> {
        let raw = std::fs::read(path)?;
        let mut n = 0;
        for chunk in raw.chunks_exact(8) {
            let begin = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let end = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            if begin <= end {
                self.ranges.push(IpRange { begin, end });
                n += 1;
            }
        }
        Ok(n)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rule_count(&self) -> usize {
        self.ranges.len()
    }

    /// Whether connections to/from this address should be refused. Only
    /// meaningful when enabled; IPv6 addresses are never matched.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        if !self.enabled {
            return false;
        }
        let IpAddr::V4(v4) = addr else {
            return false;
        };
        let needle = u32::from(*v4);

        let idx = self.ranges.partition_point(|r| r.begin <= needle);
        idx > 0 && self.ranges[idx - 1].end >= needle
    }
}

// Returns the compiled path if this looks like a text source and its .bin
// is stale or missing.
fn compile_if_newer(source: &Path) -> io::Result<Option<PathBuf>> {
    let bin = source.with_extension("bin");

    let source_mtime = std::fs::metadata(source)?.modified()?;
    let stale = match std::fs::metadata(&bin) {
        // equal timestamps recompile; cheaper than missing an update on a
        // coarse-mtime filesystem
        Ok(meta) => meta.modified()? <= source_mtime,
        Err(_) => true,
    };
    if !stale {
        return Ok(Some(bin));
    }

    let text = std::fs::read_to_string(source)?;
    let mut out = Vec::new();
    let mut rules = 0;
    for line in text.lines() {
        let Some((begin, end)) = parse_rule(line) else {
            continue;
        };
        out.extend_from_slice(&begin.to_be_bytes());
        out.extend_from_slice(&end.to_be_bytes());
        rules += 1;
    }

    if rules == 0 {
        return Ok(None);
    }

    std::fs::write(&bin, out)?;
    debug!(source = %source.display(), rules, "compiled blocklist");
    Ok(Some(bin))
}

// "name:1.2.3.4-5.6.7.8" or just "1.2.3.4-5.6.7.8"
fn parse_rule(line: &str) -> Option<(u32, u32)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let range = line.rsplit(':').next().unwrap_or(line);
    let (begin, end) = range.split_once('-')?;
    let begin: Ipv4Addr = begin.trim().parse().ok()?;
    let end: Ipv4Addr = end.trim().parse().ok()?;

    let (begin, end) = (u32::from(begin), u32::from(end));
    (begin <= end).then_some((begin, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn write_bin(dir: &Path, name: &str, ranges: &[(&str, &str)]) {
        let mut out = Vec::new();
        for (begin, end) in ranges {
            let begin: Ipv4Addr = begin.parse().unwrap();
            let end: Ipv4Addr = end.parse().unwrap();
            out.extend_from_slice(&u32::from(begin).to_be_bytes());
            out.extend_from_slice(&u32::from(end).to_be_bytes());
        }
        std::fs::write(dir.join(name), out).unwrap();
    }

    #[test]
    fn test_contains_range_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write_bin(
            dir.path(),
            "test.bin",
            &[("10.0.0.0", "10.0.0.255"), ("192.168.0.0", "192.168.255.255")],
        );

        let mut list = Blocklist::load_dir(dir.path()).unwrap();
        list.set_enabled(true);

        assert_eq!(list.rule_count(), 2);
        assert!(list.contains(&ip("10.0.0.1")));
        assert!(list.contains(&ip("10.0.0.255")));
        assert!(!list.contains(&ip("10.0.1.0")));
        assert!(list.contains(&ip("192.168.44.7")));
        assert!(!list.contains(&ip("8.8.8.8")));
        assert!(!list.contains(&ip("::1")));
    }

    #[test]
    fn test_disabled_list_matches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_bin(dir.path(), "test.bin", &[("10.0.0.0", "10.255.255.255")]);

        let list = Blocklist::load_dir(dir.path()).unwrap();
        assert!(!list.contains(&ip("10.0.0.1")));
    }

    #[test]
    fn test_text_source_is_compiled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("level1.p2p"),
            "# comment\nbad corp:10.1.0.0-10.1.255.255\n172.16.0.1-172.16.0.9\nnot a rule\n",
        )
        .unwrap();

        let mut list = Blocklist::load_dir(dir.path()).unwrap();
        list.set_enabled(true);

        assert_eq!(list.rule_count(), 2);
        assert!(list.contains(&ip("10.1.2.3")));
        assert!(list.contains(&ip("172.16.0.5")));
        assert!(!list.contains(&ip("172.16.0.10")));
        assert!(dir.path().join("level1.bin").exists());
    }

    #[test]
    fn test_stale_bin_is_recompiled() {
        let dir = tempfile::tempdir().unwrap();
        // old bin blocks one range
        write_bin(dir.path(), "level1.bin", &[("1.0.0.0", "1.0.0.255")]);
        // newer text source replaces it
        std::fs::write(dir.path().join("level1.p2p"), "x:2.0.0.0-2.0.0.255\n").unwrap();

        let mut list = Blocklist::load_dir(dir.path()).unwrap();
        list.set_enabled(true);

        assert!(list.contains(&ip("2.0.0.1")));
        assert!(!list.contains(&ip("1.0.0.1")));
    }

    #[test]
    fn test_parse_rule_forms() {
        assert_eq!(
            parse_rule("Some Org:1.2.3.4-1.2.3.8"),
            Some((0x01020304, 0x01020308))
        );
        assert_eq!(parse_rule("1.2.3.4-1.2.3.8"), Some((0x01020304, 0x01020308)));
        assert_eq!(parse_rule("# comment"), None);
        assert_eq!(parse_rule(""), None);
        assert_eq!(parse_rule("9.9.9.9-1.1.1.1"), None);
        assert_eq!(parse_rule("garbage"), None);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let list = Blocklist::load_dir(Path::new("/nonexistent/blocklists")).unwrap();
        assert_eq!(list.rule_count(), 0);
    }
}
