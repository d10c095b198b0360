//! Session settings: defaults, `settings.json`, and caller overrides.
//!
//! The effective configuration is defaults merged with the file merged
//! with whatever the embedding application overrides at startup. Keys we
//! don't recognize are carried through a rewrite untouched, so foreign
//! tools can stash their own state in the same file.

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SETTINGS_FILENAME: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "download-dir")]
    pub download_dir: PathBuf,
    #[serde(rename = "incomplete-dir")]
    pub incomplete_dir: PathBuf,
    #[serde(rename = "incomplete-dir-enabled")]
    pub incomplete_dir_enabled: bool,

    #[serde(rename = "peer-port")]
    pub peer_port: u16,
    #[serde(rename = "peer-port-random-on-start")]
    pub peer_port_random_on_start: bool,
    #[serde(rename = "peer-port-random-low")]
    pub peer_port_random_low: u16,
    #[serde(rename = "peer-port-random-high")]
    pub peer_port_random_high: u16,
    #[serde(rename = "port-forwarding-enabled")]
    pub port_forwarding_enabled: bool,

    #[serde(rename = "speed-limit-down")]
    pub speed_limit_down_kbps: u64,
    #[serde(rename = "speed-limit-down-enabled")]
    pub speed_limit_down_enabled: bool,
    #[serde(rename = "speed-limit-up")]
    pub speed_limit_up_kbps: u64,
    #[serde(rename = "speed-limit-up-enabled")]
    pub speed_limit_up_enabled: bool,

    #[serde(rename = "alt-speed-down")]
    pub alt_speed_down_kbps: u64,
    #[serde(rename = "alt-speed-up")]
    pub alt_speed_up_kbps: u64,
    #[serde(rename = "alt-speed-enabled")]
    pub alt_speed_enabled: bool,
    #[serde(rename = "alt-speed-time-enabled")]
    pub alt_speed_time_enabled: bool,
    #[serde(rename = "alt-speed-time-begin")]
    pub alt_speed_time_begin: u16,
    #[serde(rename = "alt-speed-time-end")]
    pub alt_speed_time_end: u16,
    #[serde(rename = "alt-speed-time-day")]
    pub alt_speed_time_day: u8,

    #[serde(rename = "peer-limit-global")]
    pub peer_limit_global: u16,
    #[serde(rename = "peer-limit-per-torrent")]
    pub peer_limit_per_torrent: u16,

    #[serde(rename = "blocklist-enabled")]
    pub blocklist_enabled: bool,

    #[serde(rename = "dht-enabled")]
    pub dht_enabled: bool,
    #[serde(rename = "lpd-enabled")]
    pub lpd_enabled: bool,
    #[serde(rename = "utp-enabled")]
    pub utp_enabled: bool,
    #[serde(rename = "pex-enabled")]
    pub pex_enabled: bool,

    #[serde(rename = "scrape-paused-torrents-enabled")]
    pub scrape_paused_torrents_enabled: bool,

    #[serde(rename = "download-queue-size")]
    pub download_queue_size: u16,
    #[serde(rename = "download-queue-enabled")]
    pub download_queue_enabled: bool,
    #[serde(rename = "seed-queue-size")]
    pub seed_queue_size: u16,
    #[serde(rename = "seed-queue-enabled")]
    pub seed_queue_enabled: bool,

    #[serde(rename = "ratio-limit")]
    pub ratio_limit: f64,
    #[serde(rename = "ratio-limit-enabled")]
    pub ratio_limit_enabled: bool,
    #[serde(rename = "idle-seeding-limit")]
    pub idle_seeding_limit_minutes: u16,
    #[serde(rename = "idle-seeding-limit-enabled")]
    pub idle_seeding_limit_enabled: bool,

    #[serde(rename = "rpc-enabled")]
    pub rpc_enabled: bool,
    #[serde(rename = "rpc-bind-address")]
    pub rpc_bind_address: IpAddr,
    #[serde(rename = "rpc-port")]
    pub rpc_port: u16,
    #[serde(rename = "rpc-url")]
    pub rpc_url: String,
    #[serde(rename = "rpc-username")]
    pub rpc_username: String,
    #[serde(rename = "rpc-password")]
    pub rpc_password: String,
    #[serde(rename = "rpc-authentication-required")]
    pub rpc_authentication_required: bool,
    #[serde(rename = "rpc-whitelist")]
    pub rpc_whitelist: String,
    #[serde(rename = "rpc-whitelist-enabled")]
    pub rpc_whitelist_enabled: bool,
    #[serde(rename = "rpc-host-whitelist")]
    pub rpc_host_whitelist: String,
    #[serde(rename = "rpc-host-whitelist-enabled")]
    pub rpc_host_whitelist_enabled: bool,
    #[serde(rename = "anti-brute-force-enabled")]
    pub anti_brute_force_enabled: bool,
    #[serde(rename = "anti-brute-force-threshold")]
    pub anti_brute_force_threshold: u32,

    #[serde(rename = "script-torrent-added-enabled")]
    pub script_torrent_added_enabled: bool,
    #[serde(rename = "script-torrent-added-filename")]
    pub script_torrent_added_filename: PathBuf,
    #[serde(rename = "script-torrent-done-enabled")]
    pub script_torrent_done_enabled: bool,
    #[serde(rename = "script-torrent-done-filename")]
    pub script_torrent_done_filename: PathBuf,
    #[serde(rename = "script-torrent-done-seeding-enabled")]
    pub script_torrent_done_seeding_enabled: bool,
    #[serde(rename = "script-torrent-done-seeding-filename")]
    pub script_torrent_done_seeding_filename: PathBuf,

    /// Keys this build doesn't know about; preserved verbatim on rewrite.
    #[serde(flatten)]
    pub unknown: serde_json::Map<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("Downloads"),
            incomplete_dir: PathBuf::from("Incomplete"),
            incomplete_dir_enabled: false,
            peer_port: 51413,
            peer_port_random_on_start: false,
            peer_port_random_low: 49152,
            peer_port_random_high: 65535,
            port_forwarding_enabled: true,
            speed_limit_down_kbps: 100,
            speed_limit_down_enabled: false,
            speed_limit_up_kbps: 100,
            speed_limit_up_enabled: false,
            alt_speed_down_kbps: 50,
            alt_speed_up_kbps: 50,
            alt_speed_enabled: false,
            alt_speed_time_enabled: false,
            alt_speed_time_begin: 540,
            alt_speed_time_end: 1020,
            alt_speed_time_day: 0x7f,
            peer_limit_global: 200,
            peer_limit_per_torrent: 50,
            blocklist_enabled: false,
            dht_enabled: true,
            lpd_enabled: false,
            utp_enabled: true,
            pex_enabled: true,
            scrape_paused_torrents_enabled: true,
            download_queue_size: 5,
            download_queue_enabled: true,
            seed_queue_size: 10,
            seed_queue_enabled: false,
            ratio_limit: 2.0,
            ratio_limit_enabled: false,
            idle_seeding_limit_minutes: 30,
            idle_seeding_limit_enabled: false,
            rpc_enabled: false,
            rpc_bind_address: IpAddr::from([0, 0, 0, 0]),
            rpc_port: 9091,
            rpc_url: "/transmission/".to_string(),
            rpc_username: String::new(),
            rpc_password: String::new(),
            rpc_authentication_required: false,
            rpc_whitelist: "127.0.0.1,::1".to_string(),
            rpc_whitelist_enabled: true,
            rpc_host_whitelist: String::new(),
            rpc_host_whitelist_enabled: true,
            anti_brute_force_enabled: false,
            anti_brute_force_threshold: 100,
            script_torrent_added_enabled: false,
            script_torrent_added_filename: PathBuf::new(),
            script_torrent_done_enabled: false,
            script_torrent_done_filename: PathBuf::new(),
            script_torrent_done_seeding_enabled: false,
            script_torrent_done_seeding_filename: PathBuf::new(),
            unknown: serde_json::Map::new(),
        }
    }
}

impl Settings {
    /// Defaults overlaid with `<config>/settings.json`, if present.
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(SETTINGS_FILENAME);
        match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "couldn't parse settings; using defaults");
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        }
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(config_dir)?;
        let path = config_dir.join(SETTINGS_FILENAME);
        let pretty = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, pretty)?;
        std::fs::rename(&tmp, &path)
    }

    pub fn rpc_config(&self, config_dir: &Path) -> crate::rpc::RpcConfig {
        crate::rpc::RpcConfig {
            bind_address: self.rpc_bind_address,
            port: self.rpc_port,
            url_prefix: self.rpc_url.clone(),
            username: self.rpc_username.clone(),
            password: self.rpc_password.clone(),
            auth_required: self.rpc_authentication_required,
            whitelist: split_csv(&self.rpc_whitelist),
            whitelist_enabled: self.rpc_whitelist_enabled,
            host_whitelist: split_csv(&self.rpc_host_whitelist),
            host_whitelist_enabled: self.rpc_host_whitelist_enabled,
            anti_brute_force_enabled: self.anti_brute_force_enabled,
            anti_brute_force_threshold: self.anti_brute_force_threshold,
            web_root: config_dir.join("web"),
        }
    }

    pub fn speed_limit_bps(&self, dir: crate::bandwidth::Direction) -> (bool, u64) {
        match dir {
            crate::bandwidth::Direction::Up => {
                (self.speed_limit_up_enabled, self.speed_limit_up_kbps * 1000)
            }
            crate::bandwidth::Direction::Down => (
                self.speed_limit_down_enabled,
                self.speed_limit_down_kbps * 1000,
            ),
        }
    }
}

fn split_csv(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        settings.save(dir.path()).unwrap();

        let loaded = Settings::load(dir.path());
        assert_eq!(loaded.peer_port, 51413);
        assert_eq!(loaded.rpc_url, "/transmission/");
        assert!(loaded.scrape_paused_torrents_enabled);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let settings = Settings::load(Path::new("/nonexistent"));
        assert_eq!(settings.peer_port, 51413);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILENAME),
            r#"{ "peer-port": 12345, "rpc-enabled": true }"#,
        )
        .unwrap();

        let settings = Settings::load(dir.path());
        assert_eq!(settings.peer_port, 12345);
        assert!(settings.rpc_enabled);
        // untouched keys keep their defaults
        assert_eq!(settings.peer_limit_global, 200);
    }

    #[test]
    fn test_unknown_keys_survive_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILENAME),
            r#"{ "peer-port": 7070, "x-custom-key": { "nested": [1, 2, 3] } }"#,
        )
        .unwrap();

        let settings = Settings::load(dir.path());
        settings.save(dir.path()).unwrap();

        let reread = Settings::load(dir.path());
        assert_eq!(reread.peer_port, 7070);
        assert_eq!(
            reread.unknown.get("x-custom-key").unwrap()["nested"][2],
            serde_json::json!(3)
        );
    }

    #[test]
    fn test_garbage_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILENAME), "{ not json").unwrap();

        let settings = Settings::load(dir.path());
        assert_eq!(settings.peer_port, 51413);
    }

    #[test]
    fn test_rpc_config_mapping() {
        let mut settings = Settings::default();
        settings.rpc_whitelist = "127.0.0.1, 192.168.*.*".to_string();

        let config = settings.rpc_config(Path::new("/cfg"));
        assert_eq!(config.whitelist, vec!["127.0.0.1", "192.168.*.*"]);
        assert_eq!(config.port, 9091);
        assert_eq!(config.web_root, PathBuf::from("/cfg/web"));
    }
}
