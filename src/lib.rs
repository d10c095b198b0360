//! shoal - BitTorrent swarm core
//!
//! The networking and coordination subsystems a BitTorrent client is built
//! around: tracker announcing and scraping, per-peer byte pipes with
//! bandwidth shaping, completion accounting, block request selection,
//! NAT-PMP port mapping, resume persistence, and a JSON-RPC control
//! surface, all owned by a [`session::Session`].
//!
//! # Modules
//!
//! - [`announcer`] - tier scheduling, multiscrape batching, backoff
//! - [`bandwidth`] - hierarchical token buckets and the turtle schedule
//! - [`bencode`] - BEP-3 bencode codec
//! - [`bitfield`] / [`blocks`] - bit sets and piece/block/byte arithmetic
//! - [`blocklist`] - compiled IP range filters
//! - [`completion`] - which blocks and pieces we own
//! - [`metainfo`] - BEP-3/12 torrent metadata
//! - [`peer`] - per-peer I/O engine over TCP or uTP
//! - [`portmap`] - RFC 6886 NAT-PMP state machine
//! - [`resume`] - per-torrent persisted state
//! - [`rpc`] - HTTP JSON-RPC endpoint
//! - [`session`] - the orchestrator that owns everything above
//! - [`torrent`] - per-torrent bookkeeping
//! - [`tracker`] - BEP-3/15/48 announce and scrape transports
//! - [`wishlist`] - block request selection with endgame policy

pub mod announcer;
pub mod bandwidth;
pub mod bencode;
pub mod bitfield;
pub mod blocklist;
pub mod blocks;
pub mod completion;
pub mod metainfo;
pub mod peer;
pub mod portmap;
pub mod resume;
pub mod rpc;
pub mod session;
pub mod torrent;
pub mod tracker;
pub mod wishlist;

pub use announcer::{Announcer, MultiscrapePolicy, TrackerUpdate};
pub use bandwidth::{Bandwidth, Direction, TurtleInfo};
pub use bencode::{decode, encode, BencodeError, Value};
pub use bitfield::Bitfield;
pub use blocklist::Blocklist;
pub use blocks::{BlockInfo, BlockSpan, BLOCK_SIZE};
pub use completion::{Completeness, Completion};
pub use metainfo::{InfoHash, Metainfo, MetainfoError};
pub use peer::{PeerId, PeerIo, PeerIoHandler};
pub use portmap::{PortForwarding, PortMapper};
pub use resume::{Ctor, Fields, ResumeError};
pub use rpc::{RpcConfig, RpcHandler, RpcServer};
pub use session::{Session, SessionError, SessionEvent, Settings};
pub use torrent::{Priority, RunState, Torrent, TorrentId};
pub use tracker::{
    AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse, TrackerClient, TrackerError,
    TrackerEvent,
};
pub use wishlist::PeerInfo;
