//! The session orchestrator.
//!
//! Owns the torrent registry, the bandwidth root, the announcer, the
//! blocklist, NAT traversal, the settings file, and the timers that drive
//! them. The RPC server plugs in through [`Session::rpc_handler`].

mod core;
mod settings;

pub use self::core::{
    Session, SessionError, SessionEvent, NOW_INTERVAL, RESUME_SAVE_INTERVAL, SHUTDOWN_DEADLINE,
};
pub use settings::{Settings, SETTINGS_FILENAME};
