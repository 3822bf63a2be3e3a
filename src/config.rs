//! Configuration types for adc-dl

use crate::error::Error;
use crate::types::Priority;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Download queue and bundle behavior
///
/// Groups settings for how bundles are queued, scheduled and persisted.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Concurrent download slots (default: 3)
    #[serde(default = "default_download_slots")]
    pub download_slots: usize,

    /// Extra slots available to `Highest`-priority items (default: 3)
    #[serde(default = "default_extra_download_slots")]
    pub extra_download_slots: usize,

    /// Download speed ceiling in KiB/s used by slot admission (0 = unlimited)
    #[serde(default)]
    pub max_download_speed_kib: u64,

    /// Priority assigned when a request carries `Priority::Default`
    #[serde(default = "default_priority")]
    pub default_priority: Priority,

    /// Auto-priority mode
    #[serde(default)]
    pub auto_priority: AutoPriorityMode,

    /// Interval between balanced auto-priority passes, seconds (default: 120)
    #[serde(default = "default_autoprio_interval")]
    pub auto_priority_interval_secs: u64,

    /// Seconds between alternate searches for a bundle (default: 180)
    ///
    /// Bundles younger than five minutes use half of this.
    #[serde(default = "default_bundle_search")]
    pub bundle_search_secs: u64,

    /// Download skiplist pattern; empty disables
    #[serde(default)]
    pub skiplist: String,

    /// Interpret `skiplist` as a regular expression instead of wildcards
    #[serde(default)]
    pub skiplist_regex: bool,

    /// Refuse zero-byte files (default: true)
    #[serde(default = "default_true")]
    pub skip_zero_byte: bool,

    /// Refuse files larger than this many bytes (0 = unlimited)
    #[serde(default)]
    pub max_file_size: u64,

    /// Extensions never queued or shared
    #[serde(default = "default_forbidden_extensions")]
    pub forbidden_extensions: Vec<String>,

    /// Smallest chunk handed to a connection, KiB (default: 1024)
    #[serde(default = "default_min_segment_kib")]
    pub min_segment_kib: u64,

    /// Default cap on concurrent segments per file (default: 3)
    #[serde(default = "default_max_segments")]
    pub max_segments: u8,

    /// Seconds between dirty-bundle flushes (default: 10)
    #[serde(default = "default_flush_secs")]
    pub save_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            download_slots: default_download_slots(),
            extra_download_slots: default_extra_download_slots(),
            max_download_speed_kib: 0,
            default_priority: default_priority(),
            auto_priority: AutoPriorityMode::default(),
            auto_priority_interval_secs: default_autoprio_interval(),
            bundle_search_secs: default_bundle_search(),
            skiplist: String::new(),
            skiplist_regex: false,
            skip_zero_byte: true,
            max_file_size: 0,
            forbidden_extensions: default_forbidden_extensions(),
            min_segment_kib: default_min_segment_kib(),
            max_segments: default_max_segments(),
            save_interval_secs: default_flush_secs(),
        }
    }
}

/// Auto-priority strategy for queued bundles and items
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoPriorityMode {
    /// Auto-priority disabled
    Disabled,
    /// Item priority is a step function of downloaded fraction
    #[default]
    Progress,
    /// Bundles are scored by speed and source count and split into tiers
    Balanced,
}

/// Upload slot behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Granted user slots (default: 2)
    #[serde(default = "default_upload_slots")]
    pub slots: usize,

    /// Extra per-file mini slots for small meta files (default: 3)
    #[serde(default = "default_extra_slots")]
    pub extra_slots: usize,

    /// Grant extra slots while total upload speed stays under this, KiB/s (0 = disabled)
    #[serde(default)]
    pub auto_slot_min_speed_kib: u64,

    /// Ceiling on automatically opened extra slots (default: 5)
    #[serde(default = "default_max_auto_opened")]
    pub max_auto_opened: usize,

    /// Files at most this many KiB ride the MCN small-file slot (default: 64)
    #[serde(default = "default_mini_file_kib")]
    pub mini_file_size_kib: u64,

    /// Concurrent MCN small-file connections (default: 8)
    #[serde(default = "default_mcn_small_max")]
    pub mcn_small_max: usize,

    /// Per-user cap on concurrent MCN uploads (0 = no explicit cap)
    #[serde(default)]
    pub max_mcn_per_user: usize,

    /// Minimum seconds between automatic extra-slot grants (default: 30)
    #[serde(default = "default_grant_interval")]
    pub grant_interval_secs: u64,

    /// How long a finished upload stays resumable, milliseconds (default: 3500)
    #[serde(default = "default_upload_delay_ms")]
    pub delay_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            slots: default_upload_slots(),
            extra_slots: default_extra_slots(),
            auto_slot_min_speed_kib: 0,
            max_auto_opened: default_max_auto_opened(),
            mini_file_size_kib: default_mini_file_kib(),
            mcn_small_max: default_mcn_small_max(),
            max_mcn_per_user: 0,
            grant_interval_secs: default_grant_interval(),
            delay_ms: default_upload_delay_ms(),
        }
    }
}

/// Content index behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Share skiplist pattern; empty disables
    #[serde(default)]
    pub skiplist: String,

    /// Interpret `skiplist` as a regular expression instead of wildcards
    #[serde(default)]
    pub skiplist_regex: bool,

    /// Refuse to share zero-byte files (default: false)
    #[serde(default)]
    pub skip_zero_byte: bool,

    /// Refuse to share files larger than this many bytes (0 = unlimited)
    #[serde(default)]
    pub max_file_size: u64,

    /// Walk share roots in parallel during a full refresh (default: true)
    #[serde(default = "default_true")]
    pub refresh_parallel: bool,

    /// Paths never indexed, even inside a root
    #[serde(default)]
    pub excluded_paths: Vec<PathBuf>,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            skiplist: String::new(),
            skiplist_regex: false,
            skip_zero_byte: false,
            max_file_size: 0,
            refresh_parallel: true,
            excluded_paths: Vec::new(),
        }
    }
}

/// Hub session behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubConfig {
    /// Our nick
    #[serde(default = "default_nick")]
    pub nick: String,

    /// Free-text description advertised to hubs
    #[serde(default)]
    pub description: String,

    /// Base reconnect delay in seconds; jitter of 0..60 s is added (default: 120)
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,

    /// Minimum seconds between outbound searches per hub (default: 5)
    #[serde(default = "default_search_interval")]
    pub search_interval_secs: u64,

    /// Messages retained per hub for re-delivery to attaching readers (default: 100)
    #[serde(default = "default_message_cache")]
    pub message_cache_size: usize,

    /// Allow hubs whose TLS certificate cannot be verified (default: false)
    #[serde(default)]
    pub allow_untrusted: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            nick: default_nick(),
            description: String::new(),
            reconnect_secs: default_reconnect_secs(),
            search_interval_secs: default_search_interval(),
            message_cache_size: default_message_cache(),
            allow_untrusted: false,
        }
    }
}

/// Main configuration for [`crate::AdcDownloader`]
///
/// All fields have sensible defaults; `Config::default()` yields a working
/// zero-configuration instance that stores state under `./state` and downloads
/// under `./downloads`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Directory for persisted state (`bundles/`, `shares.xml`, `recents.xml`)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Final download directory
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Directory for in-progress temp files (default: inside `download_dir`)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Queue and bundle behavior
    #[serde(default)]
    pub queue: QueueConfig,

    /// Upload slot behavior
    #[serde(default)]
    pub upload: UploadConfig,

    /// Content index behavior
    #[serde(default)]
    pub share: ShareConfig,

    /// Hub session behavior
    #[serde(default)]
    pub hub: HubConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            download_dir: default_download_dir(),
            temp_dir: None,
            queue: QueueConfig::default(),
            upload: UploadConfig::default(),
            share: ShareConfig::default(),
            hub: HubConfig::default(),
        }
    }
}

impl Config {
    /// Validate the configuration, returning the first problem found
    pub fn validate(&self) -> Result<(), Error> {
        if self.queue.download_slots == 0 {
            return Err(Error::Config {
                message: "at least one download slot is required".into(),
                key: Some("queue.download_slots".into()),
            });
        }
        if self.upload.slots == 0 {
            return Err(Error::Config {
                message: "at least one upload slot is required".into(),
                key: Some("upload.slots".into()),
            });
        }
        if self.hub.nick.trim().is_empty() {
            return Err(Error::Config {
                message: "nick must not be empty".into(),
                key: Some("hub.nick".into()),
            });
        }
        if self.hub.nick.contains(|c: char| c.is_whitespace()) {
            return Err(Error::Config {
                message: "nick must not contain whitespace".into(),
                key: Some("hub.nick".into()),
            });
        }
        if self.queue.min_segment_kib == 0 {
            return Err(Error::Config {
                message: "minimum segment size must be positive".into(),
                key: Some("queue.min_segment_kib".into()),
            });
        }
        if self.queue.skiplist_regex && !self.queue.skiplist.is_empty() {
            regex::Regex::new(&self.queue.skiplist).map_err(|e| Error::Config {
                message: format!("invalid skiplist regex: {e}"),
                key: Some("queue.skiplist".into()),
            })?;
        }
        if self.share.skiplist_regex && !self.share.skiplist.is_empty() {
            regex::Regex::new(&self.share.skiplist).map_err(|e| Error::Config {
                message: format!("invalid skiplist regex: {e}"),
                key: Some("share.skiplist".into()),
            })?;
        }
        Ok(())
    }

    /// Directory holding per-bundle XML documents
    pub fn bundles_dir(&self) -> PathBuf {
        self.state_dir.join("bundles")
    }

    /// Directory for in-progress temp files
    pub fn effective_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.download_dir.join(".incomplete"))
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_download_slots() -> usize {
    3
}

fn default_extra_download_slots() -> usize {
    3
}

fn default_priority() -> Priority {
    Priority::Normal
}

fn default_autoprio_interval() -> u64 {
    120
}

fn default_bundle_search() -> u64 {
    180
}

fn default_min_segment_kib() -> u64 {
    1024
}

fn default_max_segments() -> u8 {
    3
}

fn default_flush_secs() -> u64 {
    10
}

fn default_upload_slots() -> usize {
    2
}

fn default_extra_slots() -> usize {
    3
}

fn default_max_auto_opened() -> usize {
    5
}

fn default_mini_file_kib() -> u64 {
    64
}

fn default_mcn_small_max() -> usize {
    8
}

fn default_grant_interval() -> u64 {
    30
}

fn default_upload_delay_ms() -> u64 {
    3500
}

fn default_nick() -> String {
    "adc-dl".to_string()
}

fn default_reconnect_secs() -> u64 {
    120
}

fn default_search_interval() -> u64 {
    5
}

fn default_message_cache() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_forbidden_extensions() -> Vec<String> {
    ["tmp", "bak", "bad", "dctmp", "!ut", "bc!", "missing", "temp"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn zero_download_slots_rejected_with_key() {
        let mut cfg = Config::default();
        cfg.queue.download_slots = 0;
        match cfg.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("queue.download_slots"));
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn whitespace_nick_rejected() {
        let mut cfg = Config::default();
        cfg.hub.nick = "bad nick".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_skiplist_regex_rejected_only_in_regex_mode() {
        let mut cfg = Config::default();
        cfg.queue.skiplist = "[unclosed".into();
        cfg.queue.skiplist_regex = false;
        cfg.validate().expect("wildcard mode never parses as regex");

        cfg.queue.skiplist_regex = true;
        assert!(cfg.validate().is_err(), "regex mode must parse the pattern");
    }

    #[test]
    fn temp_dir_defaults_under_download_dir() {
        let cfg = Config::default();
        assert!(cfg.effective_temp_dir().starts_with(&cfg.download_dir));

        let cfg = Config {
            temp_dir: Some(PathBuf::from("/tmp/elsewhere")),
            ..Config::default()
        };
        assert_eq!(cfg.effective_temp_dir(), PathBuf::from("/tmp/elsewhere"));
    }

    #[test]
    fn forbidden_extension_defaults_cover_partial_files() {
        let exts = default_forbidden_extensions();
        for ext in ["tmp", "dctmp", "!ut", "missing"] {
            assert!(exts.iter().any(|e| e == ext), "{ext} must be forbidden");
        }
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.queue.download_slots, cfg.queue.download_slots);
        assert_eq!(back.upload.delay_ms, cfg.upload.delay_ms);
        assert_eq!(back.hub.search_interval_secs, cfg.hub.search_interval_secs);
    }

    #[test]
    fn empty_json_object_yields_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.queue.download_slots, 3);
        assert_eq!(cfg.upload.delay_ms, 3500);
        assert_eq!(cfg.queue.bundle_search_secs, 180);
    }
}
