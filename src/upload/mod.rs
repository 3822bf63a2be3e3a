//! Upload slot manager.
//!
//! Every incoming per-file request is resolved against the content index and
//! run through the slot decision ladder: keep an existing user slot, MCN
//! small-file slots, hook-granted slots, standard user slots, then mini
//! slots, and finally a refusal carrying the estimated waiting-queue
//! position. Finished uploads linger on a short delay list so an immediate
//! follow-up request from the same connection reuses the open file instead of
//! reopening it.

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::hooks::ActionHook;
use crate::segment::Segment;
use crate::share::ShareManager;
use crate::tth::Tth;
use crate::types::{Cid, Event, HintedUser, QueueToken};
use crate::utils::now_ms;

/// Slot class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    /// Persists across files from the same user
    UserSlot,
    /// Bound to a single transfer
    FileSlot,
}

/// Where a slot came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotSource {
    /// Standard user-slot pool
    Standard,
    /// MCN small-file slot
    McnSmall,
    /// Mini slot for small meta files
    MiniSlot,
    /// Granted by a slot hook
    Hook(String),
}

/// A granted transfer slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferSlot {
    /// Slot class
    pub kind: SlotKind,
    /// Origin tag
    pub source: SlotSource,
}

/// What the peer asked for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadKind {
    /// A shared file (or a byte range of one)
    File,
    /// Full or partial file list
    FileList,
    /// Hash-tree leaves for a shared file
    TthLeaves,
}

/// An incoming per-file upload request
#[derive(Clone, Debug)]
pub struct UploadRequest {
    /// Requesting user; `None` when the peer never identified
    pub user: Option<HintedUser>,
    /// Share profile the connection is bound to
    pub profile: u32,
    /// Requested content hash (files and leaves)
    pub tth: Option<Tth>,
    /// Requested virtual path, for diagnostics
    pub virtual_path: String,
    /// Requested byte range; zero size means "whole file"
    pub segment: Segment,
    /// Stable token of the peer connection
    pub connection: QueueToken,
    /// Remote address, for per-IP slot reservations
    pub ip: String,
    /// Request category
    pub kind: UploadKind,
    /// Peer advertises MCN
    pub mcn: bool,
    /// Peer supports mini slots
    pub supports_mini_slots: bool,
    /// Peer is a hub operator
    pub operator: bool,
}

/// A prepared upload: slot assigned, file opened, range computed
pub struct Upload {
    /// Upload token
    pub token: QueueToken,
    /// Receiving user
    pub user: HintedUser,
    /// Peer connection
    pub connection: QueueToken,
    /// Real path of the served file
    pub real_path: PathBuf,
    /// Virtual path as requested
    pub virtual_path: String,
    /// Byte range to serve
    pub segment: Segment,
    /// The slot this upload rides on
    pub slot: TransferSlot,
    /// Open input stream; `None` for generated content (file lists)
    pub stream: Option<Arc<tokio::sync::Mutex<tokio::fs::File>>>,
}

struct DelayedUpload {
    upload: Upload,
    expires_ms: u64,
}

struct UploadState {
    uploads: HashMap<QueueToken, Upload>,
    delayed: Vec<DelayedUpload>,
    /// Slot currently held by each peer connection
    connection_slots: HashMap<QueueToken, TransferSlot>,
    /// Concurrent uploads per MCN user
    mcn_counts: HashMap<Cid, usize>,
    /// Open MCN small-file connections
    small_file_connections: usize,
    /// IP → (user, connection) holding a slot reservation there
    reserved_ips: HashMap<String, (Cid, QueueToken)>,
    /// Waiting users, in arrival order
    waiting: Vec<Cid>,
    last_grant_ms: u64,
    /// Total upload rate, KiB/s, reported by the connection manager
    current_rate_kib: u64,
}

impl UploadState {
    fn user_slots_in_use(&self) -> usize {
        self.connection_slots
            .values()
            .filter(|s| s.kind == SlotKind::UserSlot)
            .count()
    }

    fn mini_slots_in_use(&self) -> usize {
        self.connection_slots
            .values()
            .filter(|s| s.source == SlotSource::MiniSlot)
            .count()
    }

    fn free_slots(&self, config: &UploadConfig) -> i64 {
        config.slots as i64 - self.user_slots_in_use() as i64
    }

    fn waiting_position(&self, user: &Cid) -> usize {
        self.waiting
            .iter()
            .position(|u| u == user)
            .map(|p| p + 1)
            .unwrap_or(self.waiting.len() + 1)
    }
}

/// The upload slot manager (cloneable; all state is shared)
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<UploadInner>,
}

struct UploadInner {
    config: UploadConfig,
    state: RwLock<UploadState>,
    /// Serialises slot admission: decide-and-commit runs as one unit so two
    /// concurrent requests can never both take the last slot
    admit_lock: Mutex<()>,
    share: ShareManager,
    event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Extension point: hooks may vote a user slot past the normal cap
    slot_hooks: ActionHook<UploadRequest, TransferSlot>,
}

impl UploadManager {
    /// Create the manager
    pub fn new(
        config: UploadConfig,
        share: ShareManager,
        event_tx: tokio::sync::broadcast::Sender<Event>,
    ) -> Self {
        Self {
            inner: Arc::new(UploadInner {
                config,
                state: RwLock::new(UploadState {
                    uploads: HashMap::new(),
                    delayed: Vec::new(),
                    connection_slots: HashMap::new(),
                    mcn_counts: HashMap::new(),
                    small_file_connections: 0,
                    reserved_ips: HashMap::new(),
                    waiting: Vec::new(),
                    last_grant_ms: 0,
                    current_rate_kib: 0,
                }),
                admit_lock: Mutex::new(()),
                share,
                event_tx,
                slot_hooks: ActionHook::new(Duration::from_secs(2)),
            }),
        }
    }

    /// Slot-grant hook chain
    pub fn slot_hooks(&self) -> &ActionHook<UploadRequest, TransferSlot> {
        &self.inner.slot_hooks
    }

    /// Report the total upload rate (KiB/s) for auto-slot decisions
    pub async fn update_upload_rate(&self, kib_per_sec: u64) {
        self.inner.state.write().await.current_rate_kib = kib_per_sec;
    }

    /// Resolve, admit and open an upload for an incoming request
    pub async fn prepare_upload(&self, request: UploadRequest) -> Result<QueueToken, UploadError> {
        let user = request.user.clone().ok_or(UploadError::UnknownUser)?;

        // Resolve against the share first; a refused lookup never consumes a slot.
        let (real_path, file_size) = self.resolve(&request).await?;

        // A finished upload on the delay list for the same connection and
        // file hands its open stream over instead of reopening.
        let resumed = {
            let mut state = self.inner.state.write().await;
            state
                .delayed
                .iter()
                .position(|d| {
                    d.upload.connection == request.connection && d.upload.real_path == real_path
                })
                .map(|pos| state.delayed.remove(pos).upload)
        };

        // Open the stream before admission so a failed open never consumes a
        // slot, and so the admit lock is never held across file I/O.
        let stream = match resumed {
            Some(prior) if prior.stream.is_some() => {
                tracing::debug!(path = %real_path.display(), "reusing delayed upload stream");
                prior.stream
            }
            _ if request.kind == UploadKind::FileList => None,
            _ => {
                let file = tokio::fs::File::open(&real_path).await.map_err(|e| {
                    tracing::warn!(path = %real_path.display(), error = %e, "upload open failed");
                    UploadError::FileNotAvailable {
                        path: request.virtual_path.clone(),
                    }
                })?;
                Some(Arc::new(tokio::sync::Mutex::new(file)))
            }
        };

        // Admission is serialised: the slot decision and the grant commit run
        // as one unit, like the download side's start lock.
        let _admit = self.inner.admit_lock.lock().await;

        let now = now_ms();
        let slot = match self.parse_slot(&request, &user, now).await {
            Some(slot) => slot,
            None => {
                let mut state = self.inner.state.write().await;
                if !state.waiting.contains(&user.cid) {
                    state.waiting.push(user.cid);
                }
                let position = state.waiting_position(&user.cid);
                tracing::debug!(user = %user.nick, position, "upload refused, slots full");
                return Err(UploadError::SlotsFull { position });
            }
        };

        let segment = clip_segment(request.segment, file_size);
        let upload = Upload {
            token: QueueToken::next(),
            user: user.clone(),
            connection: request.connection,
            real_path,
            virtual_path: request.virtual_path.clone(),
            segment,
            slot: slot.clone(),
            stream,
        };
        let token = upload.token;

        let mut state = self.inner.state.write().await;
        if slot.kind == SlotKind::UserSlot {
            state
                .reserved_ips
                .insert(request.ip.clone(), (user.cid, request.connection));
            if slot.source == SlotSource::Standard
                && !state.connection_slots.contains_key(&request.connection)
            {
                state.last_grant_ms = now;
            }
        }
        let held_small = state
            .connection_slots
            .get(&request.connection)
            .is_some_and(|s| s.source == SlotSource::McnSmall);
        if slot.source == SlotSource::McnSmall && !held_small {
            state.small_file_connections += 1;
        } else if slot.source != SlotSource::McnSmall && held_small {
            // The connection's slot moves away from the small-file pool; its
            // count goes with it, mirroring the removal paths.
            state.small_file_connections = state.small_file_connections.saturating_sub(1);
        }
        if request.mcn {
            *state.mcn_counts.entry(user.cid).or_insert(0) += 1;
        }
        state.connection_slots.insert(request.connection, slot);
        state.waiting.retain(|u| *u != user.cid);
        state.uploads.insert(token, upload);

        let free = state.free_slots(&self.inner.config).max(0) as usize;
        drop(state);
        let _ = self.inner.event_tx.send(Event::SlotsUpdated {
            free,
            total: self.inner.config.slots,
        });
        Ok(token)
    }

    async fn resolve(&self, request: &UploadRequest) -> Result<(PathBuf, u64), UploadError> {
        match request.kind {
            UploadKind::FileList => {
                // Lists are generated per profile; served from the state dir
                // by the connection layer. Slot handling is what matters here.
                Ok((PathBuf::from(&request.virtual_path), 0))
            }
            UploadKind::File | UploadKind::TthLeaves => {
                let tth = request.tth.ok_or_else(|| UploadError::Protocol(
                    "file request without TR".into(),
                ))?;
                let all = self.inner.share.find_by_tth(&tth).await;
                if all.is_empty() {
                    return Err(UploadError::FileNotAvailable {
                        path: request.virtual_path.clone(),
                    });
                }
                match all.into_iter().find(|f| f.visible_to(request.profile)) {
                    Some(f) => Ok((f.real_path, f.size)),
                    None => Err(UploadError::FileAccessDenied {
                        path: request.virtual_path.clone(),
                    }),
                }
            }
        }
    }

    /// The ordered slot decision
    async fn parse_slot(
        &self,
        request: &UploadRequest,
        user: &HintedUser,
        now: u64,
    ) -> Option<TransferSlot> {
        let config = &self.inner.config;
        let small = self.is_small(request).await;

        {
            let state = self.inner.state.read().await;

            // 1. An existing user slot on this connection is kept.
            if let Some(existing) = state.connection_slots.get(&request.connection)
                && existing.kind == SlotKind::UserSlot
            {
                return Some(existing.clone());
            }

            // An MCN uploader asking for another full connection must pass
            // the balance check before anything else.
            if !small
                && state.mcn_counts.get(&user.cid).copied().unwrap_or(0) > 0
                && !Self::allow_new_mcn(&state, &user.cid, config)
            {
                tracing::debug!(user = %user.nick, "new MCN connection refused");
                return None;
            }

            // 2. Small files ride the MCN small-file slot, hooks cannot
            //    override this.
            if small && request.mcn {
                let already = state
                    .connection_slots
                    .get(&request.connection)
                    .is_some_and(|s| s.source == SlotSource::McnSmall);
                if already || state.small_file_connections < config.mcn_small_max {
                    return Some(TransferSlot {
                        kind: SlotKind::FileSlot,
                        source: SlotSource::McnSmall,
                    });
                }
            }
        }

        // 3. Hooks may vote a user slot past the cap.
        let hook_slot = match self.inner.slot_hooks.run_hooks(request).await {
            Ok(grants) => grants
                .into_iter()
                .max_by_key(|s| (s.kind == SlotKind::UserSlot, s.source != SlotSource::MiniSlot)),
            Err(rejection) => {
                tracing::debug!(hook = rejection.hook_id, "slot hook rejected");
                None
            }
        };
        if let Some(slot) = &hook_slot
            && slot.kind == SlotKind::UserSlot
        {
            return hook_slot;
        }

        let state = self.inner.state.read().await;

        // 4. Standard user slot.
        if Self::standard_slots_remaining(&state, &user.cid, &request.ip, config, now) {
            return Some(TransferSlot {
                kind: SlotKind::UserSlot,
                source: SlotSource::Standard,
            });
        }

        // 5. Mini slots for small meta files.
        let mini_candidate = matches!(request.kind, UploadKind::FileList | UploadKind::TthLeaves);
        if hook_slot.is_none() && mini_candidate && request.supports_mini_slots {
            let already = state
                .connection_slots
                .get(&request.connection)
                .is_some_and(|s| s.source == SlotSource::MiniSlot);
            let allowed = already
                || request.operator
                || state.mini_slots_in_use() < config.extra_slots;
            if allowed {
                return Some(TransferSlot {
                    kind: SlotKind::FileSlot,
                    source: SlotSource::MiniSlot,
                });
            }
        }

        hook_slot
    }

    async fn is_small(&self, request: &UploadRequest) -> bool {
        match request.kind {
            UploadKind::FileList | UploadKind::TthLeaves => true,
            UploadKind::File => match request.tth {
                Some(tth) => self
                    .inner
                    .share
                    .find_by_tth(&tth)
                    .await
                    .first()
                    .is_some_and(|f| f.size <= self.inner.config.mini_file_size_kib * 1024),
                None => false,
            },
        }
    }

    fn standard_slots_remaining(
        state: &UploadState,
        user: &Cid,
        ip: &str,
        config: &UploadConfig,
        now: u64,
    ) -> bool {
        // Slot reserved for someone else at this address?
        if let Some((holder, _)) = state.reserved_ips.get(ip)
            && holder != user
        {
            return false;
        }
        let no_queue = state.waiting.is_empty() || state.waiting.first() == Some(user);
        if state.free_slots(config) > 0 && no_queue {
            return true;
        }
        // Low-speed auto slots, rate limited to one per grant interval.
        config.auto_slot_min_speed_kib > 0
            && state.current_rate_kib < config.auto_slot_min_speed_kib
            && state.user_slots_in_use() < config.slots + config.max_auto_opened
            && now.saturating_sub(state.last_grant_ms) >= config.grant_interval_secs * 1000
    }

    fn allow_new_mcn(state: &UploadState, user: &Cid, config: &UploadConfig) -> bool {
        let mine = state.mcn_counts.get(user).copied().unwrap_or(0);
        if config.max_mcn_per_user > 0 && mine >= config.max_mcn_per_user {
            return false;
        }
        let highest_other = state
            .mcn_counts
            .iter()
            .filter(|(u, _)| *u != user)
            .map(|(_, c)| *c)
            .max()
            .unwrap_or(0);
        // One connection ahead of everyone else needs a free slot to back it.
        if mine + 1 > highest_other + 1 && state.free_slots(config) <= 0 {
            return false;
        }
        true
    }

    /// When the slot pool is oversubscribed, pick the MCN upload to shed:
    /// one belonging to the user with the highest concurrent count
    pub async fn pick_mcn_disconnect(&self) -> Option<QueueToken> {
        let state = self.inner.state.read().await;
        if state.free_slots(&self.inner.config) >= 0 {
            return None;
        }
        let (worst, _) = state
            .mcn_counts
            .iter()
            .max_by_key(|(_, c)| **c)
            .map(|(u, c)| (*u, *c))?;
        state
            .uploads
            .values()
            .find(|u| u.user.cid == worst && u.slot.kind == SlotKind::UserSlot)
            .map(|u| u.token)
    }

    /// An upload finished cleanly; keep it resumable for the delay window
    pub async fn upload_finished(&self, token: QueueToken) {
        let mut state = self.inner.state.write().await;
        let Some(upload) = state.uploads.remove(&token) else {
            return;
        };
        self.release_counts(&mut state, &upload, false);
        let expires_ms = now_ms() + self.inner.config.delay_ms;
        state.delayed.push(DelayedUpload { upload, expires_ms });
    }

    /// An upload died; release everything at once
    pub async fn upload_aborted(&self, token: QueueToken) {
        let mut state = self.inner.state.write().await;
        if let Some(upload) = state.uploads.remove(&token) {
            self.release_counts(&mut state, &upload, true);
        }
    }

    /// A peer connection closed; its slot and delayed entries go with it
    pub async fn connection_closed(&self, connection: QueueToken) {
        let mut state = self.inner.state.write().await;
        let uploads: Vec<QueueToken> = state
            .uploads
            .values()
            .filter(|u| u.connection == connection)
            .map(|u| u.token)
            .collect();
        for token in uploads {
            if let Some(upload) = state.uploads.remove(&token) {
                self.release_counts(&mut state, &upload, true);
            }
        }
        state.delayed.retain(|d| d.upload.connection != connection);
        state.reserved_ips.retain(|_, (_, conn)| *conn != connection);
        if let Some(slot) = state.connection_slots.remove(&connection) {
            if slot.source == SlotSource::McnSmall {
                state.small_file_connections = state.small_file_connections.saturating_sub(1);
            }
            tracing::debug!(connection = connection.get(), "slot released with connection");
        }
    }

    fn release_counts(&self, state: &mut UploadState, upload: &Upload, drop_slot: bool) {
        if let Some(count) = state.mcn_counts.get_mut(&upload.user.cid) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.mcn_counts.remove(&upload.user.cid);
            }
        }
        if drop_slot
            && let Some(slot) = state.connection_slots.remove(&upload.connection)
        {
            if slot.source == SlotSource::McnSmall {
                state.small_file_connections = state.small_file_connections.saturating_sub(1);
            }
            if slot.kind == SlotKind::UserSlot {
                state
                    .reserved_ips
                    .retain(|_, (_, conn)| *conn != upload.connection);
            }
        }
    }

    /// Second tick: expire delay-list entries, closing their streams
    pub async fn tick(&self, now_ms: u64) {
        let mut state = self.inner.state.write().await;
        let before = state.delayed.len();
        state.delayed.retain(|d| d.expires_ms > now_ms);
        let expired = before - state.delayed.len();
        if expired > 0 {
            tracing::debug!(expired, "delay uploads expired");
        }
    }

    /// Running upload count
    pub async fn upload_count(&self) -> usize {
        self.inner.state.read().await.uploads.len()
    }

    /// Snapshot of slot occupancy: `(user_slots_in_use, mini_slots_in_use)`
    pub async fn slot_usage(&self) -> (usize, usize) {
        let state = self.inner.state.read().await;
        (state.user_slots_in_use(), state.mini_slots_in_use())
    }

    /// Byte range of a prepared upload
    pub async fn upload_segment(&self, token: QueueToken) -> Option<Segment> {
        self.inner.state.read().await.uploads.get(&token).map(|u| u.segment)
    }

    /// Slot assigned to a prepared upload
    pub async fn upload_slot(&self, token: QueueToken) -> Option<TransferSlot> {
        self.inner
            .state
            .read()
            .await
            .uploads
            .get(&token)
            .map(|u| u.slot.clone())
    }
}

fn clip_segment(requested: Segment, file_size: u64) -> Segment {
    if requested.size == 0 || requested.end() > file_size {
        let start = requested.start.min(file_size);
        Segment::new(start, file_size - start)
    } else {
        requested
    }
}
