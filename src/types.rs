//! Core types for adc-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

/// Process-wide monotonic token source.
///
/// Tokens are opaque positive integers, unique across the process lifetime.
/// Bundles, queue items, transfers and refresh tasks all draw from the same
/// source so a token identifies exactly one entity regardless of kind.
static NEXT_TOKEN: AtomicU32 = AtomicU32::new(1);

/// Unique identifier for a bundle, queue item or transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueToken(pub u32);

impl QueueToken {
    /// Allocate the next process-unique token
    pub fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner u32 value
    pub fn get(&self) -> u32 {
        self.0
    }

    /// Bump the allocator so future tokens don't collide with a persisted one.
    ///
    /// Called while loading bundles from disk; persisted tokens must stay
    /// stable across restarts and newly allocated ones must not reuse them.
    pub fn reserve(token: u32) {
        NEXT_TOKEN.fetch_max(token.saturating_add(1), Ordering::Relaxed);
    }
}

impl From<u32> for QueueToken {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for QueueToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for QueueToken {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Client identifier: 192-bit value rendered as unpadded base32 (39 chars)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid(pub [u8; 24]);

impl Cid {
    /// Parse a CID from its base32 form
    pub fn from_base32(s: &str) -> Option<Self> {
        let bytes = data_encoding::BASE32_NOPAD.decode(s.as_bytes()).ok()?;
        let arr: [u8; 24] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", data_encoding::BASE32_NOPAD.encode(&self.0))
    }
}

impl std::fmt::Debug for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cid({self})")
    }
}

impl Serialize for Cid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cid::from_base32(&s).ok_or_else(|| serde::de::Error::custom("invalid CID"))
    }
}

/// A user identity paired with the hub where it was seen.
///
/// The hub hint disambiguates users sharing a CID across hubs and tells the
/// connection layer where to initiate the transfer handshake.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HintedUser {
    /// Stable client identifier
    pub cid: Cid,
    /// Last known nick, for display and persistence
    pub nick: String,
    /// Hub URL hint
    pub hub_url: String,
}

impl HintedUser {
    /// Create a new hinted user
    pub fn new(cid: Cid, nick: impl Into<String>, hub_url: impl Into<String>) -> Self {
        Self {
            cid,
            nick: nick.into(),
            hub_url: hub_url.into(),
        }
    }
}

/// Download priority, ordered from most to least throttled.
///
/// `Default` is a request-time sentinel meaning "derive from config/bundle";
/// it is resolved during add and never stored on a live item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Paused by the engine (disk full, recheck); not auto-resumed by the user
    PausedForce = 0,
    /// Paused by the user
    Paused = 1,
    /// Runs only when nothing else does
    Lowest = 2,
    /// Low priority
    Low = 3,
    /// Normal priority
    Normal = 4,
    /// High priority
    High = 5,
    /// Bypasses slot and speed caps
    Highest = 6,
    /// Resolve to the configured default at add time
    Default = 7,
}

impl Priority {
    /// Convert a persisted integer code to a Priority
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => Priority::PausedForce,
            1 => Priority::Paused,
            2 => Priority::Lowest,
            3 => Priority::Low,
            5 => Priority::High,
            6 => Priority::Highest,
            _ => Priority::Normal,
        }
    }

    /// Integer code used in persisted bundle documents
    pub fn to_i32(self) -> i32 {
        match self {
            Priority::PausedForce => 0,
            Priority::Paused => 1,
            Priority::Lowest => 2,
            Priority::Low => 3,
            Priority::Normal => 4,
            Priority::High => 5,
            Priority::Highest => 6,
            Priority::Default => 4,
        }
    }

    /// True for both pause levels
    pub fn is_paused(self) -> bool {
        matches!(self, Priority::Paused | Priority::PausedForce)
    }

    /// Resolve the `Default` sentinel against a concrete fallback
    pub fn resolve(self, fallback: Priority) -> Priority {
        if self == Priority::Default {
            fallback
        } else {
            self
        }
    }
}

/// Queue item status
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Waiting for or receiving segments
    Queued,
    /// All segments on disk, file moved to its final target
    Downloaded,
    /// Completion hooks running
    ValidationRunning,
    /// Completion hooks rejected the file
    ValidationError,
    /// Hooks passed, item fully processed
    Completed,
}

/// Bundle status.
///
/// Ordering is meaningful: `>= Downloaded` means no queued bytes remain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    /// Constructed but not yet persisted
    New,
    /// Live in the queue
    Queued,
    /// Integrity recheck running
    Recheck,
    /// Paused by the engine (disk full, I/O failure); auto-resumes
    DownloadError,
    /// Completion hooks running
    ValidationRunning,
    /// Completion hooks rejected the bundle
    ValidationError,
    /// Every item has finished downloading
    Downloaded,
    /// Completion hooks passed
    Completed,
    /// Content indexed into the share
    Shared,
}

/// Dupe classification for a path checked against the share and the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DupeType {
    /// No match
    None,
    /// Directory partially present in the share
    SharePartial,
    /// Directory fully present in the share
    ShareFull,
    /// Queued directory, sizes differ
    QueuePartial,
    /// Queued directory with matching size
    QueueFull,
    /// Finished (downloaded, not yet shared) directory, sizes differ
    FinishedPartial,
    /// Finished directory with matching size
    FinishedFull,
}

/// Severity of a hub status message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSeverity {
    /// Verbose/spam grade, hidden by default UIs
    Verbose,
    /// Informational
    Info,
    /// Warning
    Warning,
    /// Error
    Error,
}

/// A chat message received from or sent to a hub
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender nick
    pub from: String,
    /// Message body
    pub text: String,
    /// Third-person (`/me`) message
    pub third_person: bool,
    /// Private message (direct, not main chat)
    pub private: bool,
    /// Receive time
    pub time: DateTime<Utc>,
    /// Whether an attached UI has read this message yet
    pub read: bool,
}

/// A client- or hub-generated status line
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Message body
    pub text: String,
    /// Severity grade
    pub severity: MessageSeverity,
    /// Receive time
    pub time: DateTime<Utc>,
}

/// Per-task statistics reported by a completed share refresh
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RefreshStats {
    /// Directories scanned from disk
    pub dirs_scanned: usize,
    /// Files accepted into the new subtree
    pub files_indexed: usize,
    /// Bytes of accepted files
    pub bytes_indexed: u64,
    /// Entries rejected by validation
    pub files_skipped: usize,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

/// Hub connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// TCP/TLS connect in flight
    Connecting,
    /// Protocol feature negotiation
    Protocol,
    /// Waiting for hub to accept our identity
    Identify,
    /// Hub demanded a password
    Verify,
    /// Logged in
    Normal,
}

/// Event emitted by the core.
///
/// All managers publish into one broadcast channel; subscribers filter by
/// variant. Emission is synchronous; subscribers needing asynchrony drain the
/// receiver on their own task.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Bundle added (or an add merged into it)
    BundleAdded {
        /// Bundle token
        token: QueueToken,
        /// Bundle target path
        target: PathBuf,
        /// True when the request merged into an existing bundle
        merged: bool,
    },

    /// Bundle removed from the queue
    BundleRemoved {
        /// Bundle token
        token: QueueToken,
        /// Bundle target path
        target: PathBuf,
    },

    /// Bundle status transition
    BundleStatus {
        /// Bundle token
        token: QueueToken,
        /// New status
        status: BundleStatus,
    },

    /// Bundle priority change (manual or auto-balancing)
    BundlePriority {
        /// Bundle token
        token: QueueToken,
        /// New priority
        priority: Priority,
    },

    /// Queue item added
    ItemAdded {
        /// Item token
        token: QueueToken,
        /// Owning bundle, if any
        bundle: Option<QueueToken>,
        /// Final target path
        target: PathBuf,
    },

    /// Queue item removed
    ItemRemoved {
        /// Item token
        token: QueueToken,
        /// Final target path
        target: PathBuf,
        /// True when the item had finished downloading
        finished: bool,
    },

    /// Queue item finished downloading and moved to its target
    ItemFinished {
        /// Item token
        token: QueueToken,
        /// Owning bundle, if any
        bundle: Option<QueueToken>,
        /// Final target path
        target: PathBuf,
    },

    /// Queue item status transition
    ItemStatus {
        /// Item token
        token: QueueToken,
        /// New status
        status: QueueItemStatus,
    },

    /// Queue item priority change
    ItemPriority {
        /// Item token
        token: QueueToken,
        /// New priority
        priority: Priority,
    },

    /// Source list of an item changed (added, removed, or demoted)
    ItemSources {
        /// Item token
        token: QueueToken,
        /// Good sources currently known
        good: usize,
        /// Bad sources currently known
        bad: usize,
    },

    /// Integrity recheck finished for an item
    RecheckCompleted {
        /// Item token
        token: QueueToken,
        /// Bytes previously counted done that failed verification
        failed_bytes: u64,
    },

    /// Share refresh queued
    RefreshQueued {
        /// Refresh task token
        task: QueueToken,
        /// Real paths in the task
        paths: Vec<PathBuf>,
    },

    /// Share refresh completed
    RefreshCompleted {
        /// Refresh task token
        task: QueueToken,
        /// Per-task statistics
        stats: RefreshStats,
    },

    /// Hub connection state transition
    HubState {
        /// Hub URL
        url: String,
        /// New state
        state: ConnectionState,
    },

    /// Hub redirected us to another address
    HubRedirect {
        /// Original URL
        url: String,
        /// Redirect target
        target: String,
    },

    /// Chat or private message received
    HubMessage {
        /// Hub URL
        url: String,
        /// The message
        message: ChatMessage,
    },

    /// Status line for a hub (flood notices, connect errors)
    HubStatus {
        /// Hub URL
        url: String,
        /// The message
        message: StatusMessage,
    },

    /// An outbound search left the pacing queue
    OutgoingSearch {
        /// Hub URL
        url: String,
        /// Query rendered for logging
        query: String,
    },

    /// Upload slot counts changed
    SlotsUpdated {
        /// Free user slots
        free: usize,
        /// Configured user slots
        total: usize,
    },

    /// Recent-hubs list changed
    RecentsUpdated,

    /// Graceful shutdown initiated
    Shutdown,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn tokens_are_unique_and_positive() {
        let a = QueueToken::next();
        let b = QueueToken::next();
        assert!(a.get() > 0, "tokens are positive integers");
        assert_ne!(a, b, "consecutive tokens must differ");
        assert!(b.get() > a.get(), "allocator is monotonic");
    }

    #[test]
    fn reserve_prevents_collision_with_persisted_tokens() {
        let persisted = QueueToken::next().get() + 50;
        QueueToken::reserve(persisted);
        let fresh = QueueToken::next();
        assert!(
            fresh.get() > persisted,
            "token allocated after reserve({persisted}) must exceed it, got {fresh}"
        );
    }

    #[test]
    fn token_parses_and_displays() {
        let t = QueueToken::from_str("42").unwrap();
        assert_eq!(t.get(), 42);
        assert_eq!(t.to_string(), "42");
        assert!(QueueToken::from_str("x").is_err());
    }

    #[test]
    fn priority_order_matches_throttling_order() {
        assert!(Priority::PausedForce < Priority::Paused);
        assert!(Priority::Paused < Priority::Lowest);
        assert!(Priority::Lowest < Priority::Low);
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Highest);
        assert!(Priority::Highest < Priority::Default);
    }

    #[test]
    fn priority_round_trips_through_i32() {
        for p in [
            Priority::PausedForce,
            Priority::Paused,
            Priority::Lowest,
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Highest,
        ] {
            assert_eq!(Priority::from_i32(p.to_i32()), p, "{p:?} must round-trip");
        }
    }

    #[test]
    fn default_priority_resolves_and_persists_as_normal() {
        assert_eq!(Priority::Default.to_i32(), Priority::Normal.to_i32());
        assert_eq!(Priority::Default.resolve(Priority::High), Priority::High);
        assert_eq!(Priority::Normal.resolve(Priority::High), Priority::Normal);
    }

    #[test]
    fn unknown_priority_code_falls_back_to_normal() {
        assert_eq!(Priority::from_i32(99), Priority::Normal);
        assert_eq!(Priority::from_i32(-3), Priority::Normal);
    }

    #[test]
    fn bundle_status_ordering_reflects_lifecycle() {
        assert!(BundleStatus::New < BundleStatus::Queued);
        assert!(BundleStatus::Queued < BundleStatus::Downloaded);
        assert!(BundleStatus::Downloaded < BundleStatus::Completed);
        assert!(BundleStatus::Completed < BundleStatus::Shared);
    }

    #[test]
    fn cid_round_trips_through_base32() {
        let cid = Cid([7u8; 24]);
        let s = cid.to_string();
        assert_eq!(s.len(), 39, "24 bytes encode to 39 base32 chars unpadded");
        assert_eq!(Cid::from_base32(&s), Some(cid));
    }

    #[test]
    fn cid_rejects_wrong_length_input() {
        assert!(Cid::from_base32("SHORT").is_none());
        assert!(Cid::from_base32("").is_none());
    }
}
