//! Torrent metainfo (BEP-3, BEP-12).
//!
//! Parses the fields the core needs out of a `.torrent` file: the info
//! hash, the file layout, piece hashes, and the multitracker announce
//! tiers. Anything else in the file is ignored.

use std::fmt;
use std::path::PathBuf;

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode::{decode, encode, BencodeError, Value};

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("invalid info hash")]
    InvalidInfoHash,
}

/// A torrent's identity: the SHA-1 of its bencoded info dictionary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_info_bytes(info_bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| MetainfoError::InvalidInfoHash)?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, MetainfoError> {
        if s.len() != 40 {
            return Err(MetainfoError::InvalidInfoHash);
        }
        let mut arr = [0u8; 20];
        for (i, chunk) in arr.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| MetainfoError::InvalidInfoHash)?;
        }
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        use std::fmt::Write as _;
        self.0.iter().fold(String::with_capacity(40), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A file within a torrent, with its absolute byte offset in the payload.
#[derive(Debug, Clone)]
pub struct File {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

/// Parsed torrent metadata.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub pieces: Vec<[u8; 20]>,
    pub files: Vec<File>,
    pub total_size: u64,
    /// Announce URLs grouped into tiers, per the multitracker convention.
    /// A torrent with only `announce` gets a single one-tracker tier.
    pub tiers: Vec<Vec<String>>,
    pub private: bool,
}

impl Metainfo {
    pub fn parse(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = decode(data)?;
        if root.as_dict().is_none() {
            return Err(MetainfoError::InvalidField("root"));
        }

        let info_value = root.get(b"info").ok_or(MetainfoError::MissingField("info"))?;
        let info_hash = InfoHash::from_info_bytes(&encode(info_value));

        let name = info_value
            .get_str(b"name")
            .ok_or(MetainfoError::MissingField("name"))?
            .to_string();

        let piece_length = info_value
            .get_int(b"piece length")
            .filter(|&n| n > 0)
            .ok_or(MetainfoError::InvalidField("piece length"))? as u32;

        let pieces_raw = info_value
            .get_bytes(b"pieces")
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if pieces_raw.len() % 20 != 0 {
            return Err(MetainfoError::InvalidField("pieces"));
        }
        let pieces: Vec<[u8; 20]> = pieces_raw
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = parse_files(info_value, &name)?;
        let total_size = files.iter().map(|f| f.length).sum();

        let tiers = parse_tiers(&root);
        let private = info_value.get_int(b"private") == Some(1);

        Ok(Self {
            info_hash,
            name,
            piece_length,
            pieces,
            files,
            total_size,
            tiers,
            private,
        })
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn piece_hash(&self, piece: u32) -> Option<&[u8; 20]> {
        self.pieces.get(piece as usize)
    }
}

fn parse_files(info: &Value, name: &str) -> Result<Vec<File>, MetainfoError> {
    // single-file torrents carry `length`; multi-file ones carry `files`
    if let Some(length) = info.get_int(b"length") {
        if length < 0 {
            return Err(MetainfoError::InvalidField("length"));
        }
        return Ok(vec![File {
            path: PathBuf::from(name),
            length: length as u64,
            offset: 0,
        }]);
    }

    let list = info
        .get(b"files")
        .and_then(|v| v.as_list())
        .ok_or(MetainfoError::MissingField("length"))?;

    let mut files = Vec::with_capacity(list.len());
    let mut offset = 0u64;
    for entry in list {
        let length = entry
            .get_int(b"length")
            .filter(|&n| n >= 0)
            .ok_or(MetainfoError::InvalidField("files"))? as u64;

        let mut path = PathBuf::from(name);
        let components = entry
            .get(b"path")
            .and_then(|v| v.as_list())
            .ok_or(MetainfoError::InvalidField("files"))?;
        for component in components {
            let component = component.as_str().ok_or(MetainfoError::InvalidField("path"))?;
            if component.is_empty() || component == ".." {
                return Err(MetainfoError::InvalidField("path"));
            }
            path.push(component);
        }

        files.push(File {
            path,
            length,
            offset,
        });
        offset += length;
    }

    if files.is_empty() {
        return Err(MetainfoError::InvalidField("files"));
    }
    Ok(files)
}

fn parse_tiers(root: &Value) -> Vec<Vec<String>> {
    let mut tiers: Vec<Vec<String>> = root
        .get(b"announce-list")
        .and_then(|v| v.as_list())
        .map(|list| {
            list.iter()
                .filter_map(|tier| {
                    let urls: Vec<String> = tier
                        .as_list()?
                        .iter()
                        .filter_map(|u| u.as_str().map(String::from))
                        .collect();
                    (!urls.is_empty()).then_some(urls)
                })
                .collect()
        })
        .unwrap_or_default();

    if tiers.is_empty() {
        if let Some(announce) = root.get_str(b"announce") {
            tiers.push(vec![announce.to_string()]);
        }
    }
    tiers
}

/// Builds a minimal single-file metainfo blob; handy for tests elsewhere in
/// the crate.
#[cfg(test)]
pub(crate) fn make_test_torrent(name: &str, length: u64, piece_length: u32, announce: &str) -> Vec<u8> {
    use crate::bencode::{key, Dict};
    use bytes::Bytes;

    let n_pieces = length.div_ceil(piece_length as u64) as usize;
    let pieces_bytes = vec![0xaau8; n_pieces * 20];

    let mut info = Dict::new();
    info.insert(key("length"), Value::Integer(length as i64));
    info.insert(key("name"), Value::string(name));
    info.insert(key("piece length"), Value::Integer(piece_length as i64));
    info.insert(key("pieces"), Value::Bytes(Bytes::from(pieces_bytes)));

    let mut root = Dict::new();
    root.insert(key("announce"), Value::string(announce));
    root.insert(key("info"), Value::Dict(info));
    encode(&Value::Dict(root))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::bencode::{key, Dict};

    #[test]
    fn test_parse_single_file() {
        let data = make_test_torrent("linux.iso", 100_000, 16384, "http://tracker.example/announce");
        let meta = Metainfo::parse(&data).unwrap();

        assert_eq!(meta.name, "linux.iso");
        assert_eq!(meta.total_size, 100_000);
        assert_eq!(meta.piece_length, 16384);
        assert_eq!(meta.piece_count(), 7);
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.tiers, vec![vec!["http://tracker.example/announce".to_string()]]);
    }

    #[test]
    fn test_info_hash_is_stable() {
        let data = make_test_torrent("a", 16384, 16384, "http://t.example/announce");
        let one = Metainfo::parse(&data).unwrap();
        let two = Metainfo::parse(&data).unwrap();
        assert_eq!(one.info_hash, two.info_hash);
        assert_eq!(one.info_hash.to_hex().len(), 40);
    }

    #[test]
    fn test_hex_round_trip() {
        let hash = InfoHash([0xc1; 20]);
        let parsed = InfoHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);

        assert!(InfoHash::from_hex("deadbeef").is_err());
        assert!(InfoHash::from_hex(&"zz".repeat(20)).is_err());
    }

    #[test]
    fn test_announce_list_tiers() {
        let mut info = Dict::new();
        info.insert(key("length"), Value::Integer(16384));
        info.insert(key("name"), Value::string("x"));
        info.insert(key("piece length"), Value::Integer(16384));
        info.insert(key("pieces"), Value::Bytes(Bytes::from(vec![0u8; 20])));

        let mut root = Dict::new();
        root.insert(key("announce"), Value::string("http://primary.example/announce"));
        root.insert(
            key("announce-list"),
            Value::List(vec![
                Value::List(vec![
                    Value::string("http://a.example/announce"),
                    Value::string("http://b.example/announce"),
                ]),
                Value::List(vec![Value::string("udp://c.example:6969/announce")]),
            ]),
        );
        root.insert(key("info"), Value::Dict(info));

        let meta = Metainfo::parse(&encode(&Value::Dict(root))).unwrap();
        assert_eq!(meta.tiers.len(), 2);
        assert_eq!(meta.tiers[0].len(), 2);
        assert_eq!(meta.tiers[1][0], "udp://c.example:6969/announce");
    }

    #[test]
    fn test_multi_file_offsets() {
        let mut file_a = Dict::new();
        file_a.insert(key("length"), Value::Integer(1000));
        file_a.insert(key("path"), Value::List(vec![Value::string("a.txt")]));
        let mut file_b = Dict::new();
        file_b.insert(key("length"), Value::Integer(2000));
        file_b.insert(
            key("path"),
            Value::List(vec![Value::string("sub"), Value::string("b.txt")]),
        );

        let mut info = Dict::new();
        info.insert(key("files"), Value::List(vec![Value::Dict(file_a), Value::Dict(file_b)]));
        info.insert(key("name"), Value::string("pack"));
        info.insert(key("piece length"), Value::Integer(16384));
        info.insert(key("pieces"), Value::Bytes(Bytes::from(vec![0u8; 20])));

        let mut root = Dict::new();
        root.insert(key("info"), Value::Dict(info));

        let meta = Metainfo::parse(&encode(&Value::Dict(root))).unwrap();
        assert_eq!(meta.total_size, 3000);
        assert_eq!(meta.files[1].offset, 1000);
        assert_eq!(meta.files[1].path, PathBuf::from("pack/sub/b.txt"));
        assert!(meta.tiers.is_empty());
    }

    #[test]
    fn test_rejects_path_traversal() {
        let mut file = Dict::new();
        file.insert(key("length"), Value::Integer(10));
        file.insert(key("path"), Value::List(vec![Value::string("..")]));

        let mut info = Dict::new();
        info.insert(key("files"), Value::List(vec![Value::Dict(file)]));
        info.insert(key("name"), Value::string("evil"));
        info.insert(key("piece length"), Value::Integer(16384));
        info.insert(key("pieces"), Value::Bytes(Bytes::from(vec![0u8; 20])));

        let mut root = Dict::new();
        root.insert(key("info"), Value::Dict(info));

        assert!(Metainfo::parse(&encode(&Value::Dict(root))).is_err());
    }
}
