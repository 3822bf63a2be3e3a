//! Download queue and bundle engine.
//!
//! The `QueueManager` and its methods are organized by domain:
//! - [`bundle`] - Bundle type and lifecycle
//! - [`item`] - Queued files and sources
//! - [`user_queue`] - Per-user priority index
//! - [`selection`] - Segment selection and download slot admission
//! - [`downloads`] - Running transfers, completion and failure handling
//! - [`auto_priority`] - Progress and balanced auto-priority
//! - [`search`] - Paced alternate-search rotation
//! - [`persistence`] - Per-bundle XML documents and legacy import
//! - [`recheck`] - Full-file integrity recheck
//! - [`partial_sharing`] - Partial-bundle discovery exchange

pub mod auto_priority;
pub mod bundle;
pub mod downloads;
pub mod item;
pub mod partial_sharing;
pub mod persistence;
pub mod recheck;
pub mod search;
pub mod selection;
pub mod user_queue;


use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, QueueError, Result};
use crate::hasher::Hasher;
use crate::hooks::ActionHook;
use crate::segment::Segment;
use crate::share::ShareManager;
use crate::tth::Tth;
use crate::types::{BundleStatus, Event, HintedUser, Priority, QueueItemStatus, QueueToken};
use crate::utils::{is_parent_or_exact, now_secs};

use bundle::Bundle;
use item::{ItemFlags, QueueItem, Source};
use selection::DownloadSlotKind;
use user_queue::UserQueue;

/// Result of a single-file add
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BundleAddInfo {
    /// The owning bundle (new or merged into)
    pub bundle: QueueToken,
    /// True when the request merged into an existing bundle
    pub merged: bool,
}

/// One file of a directory-bundle add request
#[derive(Clone, Debug)]
pub struct BundleFileInfo {
    /// Path relative to the bundle target
    pub name: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Content hash
    pub tth: Tth,
    /// Per-file priority
    pub priority: Priority,
}

/// Result of a directory-bundle add
#[derive(Debug, Default)]
pub struct DirectoryAddResult {
    /// The bundle, when at least one file was accepted
    pub bundle: Option<QueueToken>,
    /// Files newly queued
    pub files_added: usize,
    /// Files that already existed and gained a source
    pub files_updated: usize,
    /// Files rejected by validation
    pub files_failed: usize,
    /// Per-file rejection messages
    pub errors: Vec<(String, String)>,
}

/// Input handed to bundle add-validation hooks
#[derive(Clone, Debug)]
pub struct BundleAddRequest {
    /// Requested target path
    pub target: PathBuf,
    /// Size for single files
    pub size: u64,
    /// Hash for single files
    pub tth: Option<Tth>,
}

/// Input handed to bundle completion hooks
#[derive(Clone, Debug)]
pub struct BundleCompletion {
    /// The finished bundle
    pub bundle: QueueToken,
    /// Its target path
    pub target: PathBuf,
}

/// A running download known to the engine
#[derive(Clone, Debug)]
pub struct RunningDownload {
    /// Transfer token
    pub token: QueueToken,
    /// Item being fetched
    pub item: QueueToken,
    /// Owning bundle
    pub bundle: Option<QueueToken>,
    /// Source user
    pub user: HintedUser,
    /// Assigned byte range
    pub segment: Segment,
    /// Slot class this download occupies
    pub slot: DownloadSlotKind,
}

pub(crate) struct QueueState {
    pub(crate) bundles: HashMap<QueueToken, Bundle>,
    pub(crate) items: HashMap<QueueToken, QueueItem>,
    /// lowercase target path → item token
    pub(crate) path_to_item: HashMap<String, QueueToken>,
    pub(crate) tth_to_items: HashMap<Tth, Vec<QueueToken>>,
    pub(crate) user_queue: UserQueue,
    pub(crate) running: HashMap<QueueToken, RunningDownload>,
    /// Extra-slot downloads currently running
    pub(crate) extra_running: usize,
    /// Engine-wide download rate, KiB/s, reported by the connection manager
    pub(crate) current_rate_kib: u64,
    /// Per-bundle rates for balanced auto-priority, KiB/s
    pub(crate) bundle_rates: HashMap<QueueToken, u64>,
    /// Peers subscribed to partial-bundle updates: bundle → (user, remote token)
    pub(crate) pbd_subscribers: HashMap<QueueToken, Vec<(HintedUser, u32)>>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            bundles: HashMap::new(),
            items: HashMap::new(),
            path_to_item: HashMap::new(),
            tth_to_items: HashMap::new(),
            user_queue: UserQueue::new(),
            running: HashMap::new(),
            extra_running: 0,
            current_rate_kib: 0,
            bundle_rates: HashMap::new(),
            pbd_subscribers: HashMap::new(),
        }
    }

    pub(crate) fn index_item(&mut self, item: &QueueItem) {
        self.path_to_item
            .insert(item.target.to_string_lossy().to_lowercase(), item.token);
        self.tth_to_items.entry(item.tth).or_default().push(item.token);
    }

    pub(crate) fn unindex_item(&mut self, item: &QueueItem) {
        self.path_to_item
            .remove(&item.target.to_string_lossy().to_lowercase());
        if let Some(list) = self.tth_to_items.get_mut(&item.tth) {
            list.retain(|t| *t != item.token);
            if list.is_empty() {
                self.tth_to_items.remove(&item.tth);
            }
        }
        self.user_queue.remove_item(item.token);
    }

    pub(crate) fn running_count_for_bundle(&self, bundle: QueueToken) -> usize {
        self.running
            .values()
            .filter(|d| d.bundle == Some(bundle))
            .count()
    }

    pub(crate) fn running_count_for_item(&self, item: QueueToken) -> usize {
        self.running.values().filter(|d| d.item == item).count()
    }

    fn occupied_slots(&self) -> usize {
        self.running
            .values()
            .filter(|d| d.slot == DownloadSlotKind::Normal)
            .count()
    }
}

pub(crate) struct QueueInner {
    pub(crate) config: Arc<Config>,
    pub(crate) state: RwLock<QueueState>,
    /// Serialises `get_next_download` across connection tasks
    pub(crate) start_lock: Mutex<()>,
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    pub(crate) hasher: Hasher,
    pub(crate) share: std::sync::RwLock<Option<ShareManager>>,
    /// Consulted before any add request mutates state
    pub(crate) validation_hooks: ActionHook<BundleAddRequest, ()>,
    /// Run when a bundle finishes downloading
    pub(crate) completion_hooks: ActionHook<BundleCompletion, ()>,
    pub(crate) skiplist: Option<regex::Regex>,
    /// Hash trees negotiated for in-progress files, keyed by root
    pub(crate) trees: RwLock<HashMap<Tth, crate::tth::TigerTree>>,
    pub(crate) cancel: CancellationToken,
}

/// The download queue and bundle engine (cloneable; all state is shared)
#[derive(Clone)]
pub struct QueueManager {
    pub(crate) inner: Arc<QueueInner>,
}

impl QueueManager {
    /// Create the engine and load persisted bundles
    pub async fn new(
        config: Arc<Config>,
        event_tx: tokio::sync::broadcast::Sender<Event>,
        hasher: Hasher,
    ) -> Result<Self> {
        let skiplist =
            crate::utils::compile_skiplist(&config.queue.skiplist, config.queue.skiplist_regex);
        let manager = Self {
            inner: Arc::new(QueueInner {
                config,
                state: RwLock::new(QueueState::new()),
                start_lock: Mutex::new(()),
                event_tx,
                hasher,
                share: std::sync::RwLock::new(None),
                validation_hooks: ActionHook::new(Duration::from_secs(5)),
                completion_hooks: ActionHook::new(Duration::from_secs(30)),
                skiplist,
                trees: RwLock::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
        };
        manager.load_bundles().await?;
        Ok(manager)
    }

    /// Wire the content index in (dupe checks, completed-bundle indexing)
    pub fn set_share(&self, share: ShareManager) {
        let queue = self.clone();
        share.set_queued_checker(Arc::new(move |path| queue.is_path_queued_blocking(path)));
        *self.inner.share.write().unwrap_or_else(|e| e.into_inner()) = Some(share);
    }

    pub(crate) fn share(&self) -> Option<ShareManager> {
        self.inner
            .share
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Add-validation hook chain
    pub fn validation_hooks(&self) -> &ActionHook<BundleAddRequest, ()> {
        &self.inner.validation_hooks
    }

    /// Bundle completion hook chain
    pub fn completion_hooks(&self) -> &ActionHook<BundleCompletion, ()> {
        &self.inner.completion_hooks
    }

    /// Stop periodic work and flush dirty bundles
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.cancel.cancel();
        self.flush_dirty().await
    }

    // ---------------------------------------------------------------------
    // Add requests
    // ---------------------------------------------------------------------

    /// Add a single-file bundle
    pub async fn add_file(
        &self,
        target: PathBuf,
        size: u64,
        tth: Tth,
        priority: Priority,
        source: Option<HintedUser>,
        flags: ItemFlags,
    ) -> Result<BundleAddInfo> {
        if !target.is_absolute() {
            return Err(QueueError::InvalidPath { path: target }.into());
        }
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| QueueError::InvalidPath {
                path: target.clone(),
            })?;
        self.inner
            .validation_hooks
            .run_hooks(&BundleAddRequest {
                target: target.clone(),
                size,
                tth: Some(tth),
            })
            .await?;

        let priority = priority.resolve(self.inner.config.queue.default_priority);
        let mut state = self.inner.state.write().await;
        self.validate_file_add(&state, &target, &name, size, &tth)
            .await?;

        // An identical file bundle just gains the source.
        if let Some(existing) = state
            .bundles
            .values()
            .find(|b| b.file_bundle && b.contains_path(&target) && !b.is_completed())
            .map(|b| b.token)
        {
            let token = state.bundles[&existing].queue_items.first().copied();
            if let (Some(item_token), Some(user)) = (token, source.clone()) {
                self.attach_source(&mut state, item_token, Source::new(user));
            }
            let _ = self.inner.event_tx.send(Event::BundleAdded {
                token: existing,
                target,
                merged: true,
            });
            return Ok(BundleAddInfo {
                bundle: existing,
                merged: true,
            });
        }

        // A parent directory bundle absorbs the file.
        let parent = state
            .bundles
            .values()
            .find(|b| !b.file_bundle && !b.is_completed() && b.contains_path(&target))
            .map(|b| b.token);

        let info = match parent {
            Some(bundle_token) => {
                self.insert_item(&mut state, bundle_token, target, size, tth, priority, flags, source)?;
                BundleAddInfo {
                    bundle: bundle_token,
                    merged: true,
                }
            }
            None => {
                let mut bundle = Bundle::new(target.clone(), priority, true, now_secs());
                bundle.priority = priority;
                bundle.auto_priority =
                    self.inner.config.queue.auto_priority != crate::config::AutoPriorityMode::Disabled;
                let bundle_token = bundle.token;
                bundle.set_status(BundleStatus::Queued);
                state.bundles.insert(bundle_token, bundle);
                self.insert_item(&mut state, bundle_token, target.clone(), size, tth, priority, flags, source)?;
                let _ = self.inner.event_tx.send(Event::BundleAdded {
                    token: bundle_token,
                    target,
                    merged: false,
                });
                BundleAddInfo {
                    bundle: bundle_token,
                    merged: false,
                }
            }
        };
        if info.merged {
            let target = state.bundles[&info.bundle].target.clone();
            let _ = self.inner.event_tx.send(Event::BundleAdded {
                token: info.bundle,
                target,
                merged: true,
            });
        }
        drop(state);
        self.save_bundle_now(info.bundle).await;
        Ok(info)
    }

    /// Add a directory bundle
    pub async fn add_directory(
        &self,
        target_dir: PathBuf,
        files: Vec<BundleFileInfo>,
        source: Option<HintedUser>,
    ) -> Result<DirectoryAddResult> {
        if !target_dir.is_absolute() {
            return Err(QueueError::InvalidPath { path: target_dir }.into());
        }
        self.inner
            .validation_hooks
            .run_hooks(&BundleAddRequest {
                target: target_dir.clone(),
                size: files.iter().map(|f| f.size).sum(),
                tth: None,
            })
            .await?;

        let mut state = self.inner.state.write().await;

        // Completed bundle already covering the directory: duplicate.
        if let Some(done) = state
            .bundles
            .values()
            .find(|b| b.is_completed() && b.contains_path(&target_dir))
        {
            let path = done.target.clone();
            return Err(QueueError::DuplicateFinished { path }.into());
        }

        // The new target swallowing existing bundles is refused.
        let sub_bundles = state
            .bundles
            .values()
            .filter(|b| {
                is_parent_or_exact(&target_dir, &b.target)
                    && !crate::utils::paths_equal(&target_dir, &b.target)
            })
            .count();
        if sub_bundles > 0 {
            return Err(QueueError::SubBundlesExist { count: sub_bundles }.into());
        }

        // Merge into a live bundle whose tree covers the target, or create.
        let (bundle_token, merged) = match state
            .bundles
            .values()
            .find(|b| !b.file_bundle && !b.is_completed() && b.contains_path(&target_dir))
            .map(|b| b.token)
        {
            Some(t) => (t, true),
            None => {
                let mut bundle = Bundle::new(target_dir.clone(), Priority::Normal, false, now_secs());
                bundle.auto_priority =
                    self.inner.config.queue.auto_priority != crate::config::AutoPriorityMode::Disabled;
                let token = bundle.token;
                bundle.set_status(BundleStatus::Queued);
                state.bundles.insert(token, bundle);
                (token, false)
            }
        };

        let mut result = DirectoryAddResult {
            bundle: Some(bundle_token),
            ..DirectoryAddResult::default()
        };

        for file in files {
            let target = target_dir.join(&file.name);
            let name = file.name.to_string_lossy().into_owned();
            let key = target.to_string_lossy().to_lowercase();

            if let Some(existing) = state.path_to_item.get(&key).copied() {
                // Idempotent add: refresh the source only.
                if let Some(user) = source.clone() {
                    self.attach_source(&mut state, existing, Source::new(user));
                }
                result.files_updated += 1;
                continue;
            }

            if let Err(e) = self
                .validate_file_add(&state, &target, &name, file.size, &file.tth)
                .await
            {
                result.files_failed += 1;
                result.errors.push((name, e.to_string()));
                continue;
            }

            let priority = file.priority.resolve(Priority::Normal);
            match self.insert_item(
                &mut state,
                bundle_token,
                target,
                file.size,
                file.tth,
                priority,
                ItemFlags::default(),
                source.clone(),
            ) {
                Ok(()) => result.files_added += 1,
                Err(e) => {
                    result.files_failed += 1;
                    result.errors.push((name, e.to_string()));
                }
            }
        }

        // A fresh bundle that accepted nothing is dropped again.
        if !merged && result.files_added == 0 {
            state.bundles.remove(&bundle_token);
            result.bundle = None;
            return Ok(result);
        }

        let _ = self.inner.event_tx.send(Event::BundleAdded {
            token: bundle_token,
            target: target_dir,
            merged,
        });
        drop(state);
        self.save_bundle_now(bundle_token).await;
        Ok(result)
    }

    /// Queue a file-list (or partial-list) download from a user.
    ///
    /// Lists are standalone `Highest`-priority items without a bundle.
    pub async fn add_list(&self, user: HintedUser, flags: ItemFlags) -> Result<QueueToken> {
        debug_assert!(flags.is_standalone());
        let list_dir = self.inner.config.state_dir.join("lists");
        let target = list_dir.join(format!("{}.xml.bz2", user.cid));

        let mut state = self.inner.state.write().await;
        let key = target.to_string_lossy().to_lowercase();
        if let Some(existing) = state.path_to_item.get(&key).copied() {
            return Ok(existing);
        }

        let mut item = QueueItem::new(
            target.clone(),
            target.clone(),
            0,
            crate::tth::hash_buffer(key.as_bytes()).root(),
            Priority::Highest,
            flags,
            1,
            now_secs(),
        );
        item.add_source(Source::new(user.clone()));
        let token = item.token;
        state.user_queue.add(user.cid, Priority::Highest, token);
        state.index_item(&item);
        state.items.insert(token, item);
        let _ = self.inner.event_tx.send(Event::ItemAdded {
            token,
            bundle: None,
            target,
        });
        Ok(token)
    }

    async fn validate_file_add(
        &self,
        state: &QueueState,
        target: &Path,
        name: &str,
        size: u64,
        tth: &Tth,
    ) -> Result<()> {
        let qc = &self.inner.config.queue;
        if let Some(re) = &self.inner.skiplist
            && re.is_match(name)
        {
            return Err(QueueError::SkiplistMatch {
                path: target.to_path_buf(),
            }
            .into());
        }
        if let Some(ext) = name.rsplit_once('.').map(|(_, e)| e.to_lowercase())
            && qc.forbidden_extensions.iter().any(|f| *f == ext)
        {
            return Err(QueueError::ForbiddenExtension { extension: ext }.into());
        }
        if qc.skip_zero_byte && size == 0 {
            return Err(QueueError::ZeroByte {
                path: target.to_path_buf(),
            }
            .into());
        }
        if qc.max_file_size > 0 && size > qc.max_file_size {
            return Err(QueueError::FileTooLarge {
                size,
                limit: qc.max_file_size,
            }
            .into());
        }
        if std::fs::metadata(target).map(|m| m.len() == size).unwrap_or(false) {
            return Err(QueueError::TargetExists {
                path: target.to_path_buf(),
            }
            .into());
        }
        if let Some(share) = self.share()
            && let Some(shared) = share.find_by_tth(tth).await.into_iter().next()
        {
            return Err(QueueError::DuplicateInShare {
                path: shared.real_path,
            }
            .into());
        }
        if let Some(items) = state.tth_to_items.get(tth)
            && let Some(first) = items.first()
            && let Some(existing) = state.items.get(first)
            && !crate::utils::paths_equal(&existing.target, target)
        {
            return Err(QueueError::DuplicateInQueue {
                path: existing.target.clone(),
            }
            .into());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_item(
        &self,
        state: &mut QueueState,
        bundle_token: QueueToken,
        target: PathBuf,
        size: u64,
        tth: Tth,
        priority: Priority,
        flags: ItemFlags,
        source: Option<HintedUser>,
    ) -> Result<()> {
        let temp_name = format!(
            "{}.{}.dctmp",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            tth
        );
        let temp_target = self.inner.config.effective_temp_dir().join(temp_name);

        let mut item = QueueItem::new(
            target.clone(),
            temp_target,
            size,
            tth,
            priority,
            flags,
            self.inner.config.queue.max_segments,
            now_secs(),
        );
        item.bundle = Some(bundle_token);
        item.auto_priority = self.inner.config.queue.auto_priority
            == crate::config::AutoPriorityMode::Progress;
        let token = item.token;

        if let Some(user) = source {
            item.add_source(Source::new(user.clone()));
            state.user_queue.add(user.cid, priority, token);
        }

        state.index_item(&item);
        state.items.insert(token, item);
        let bundle = state
            .bundles
            .get_mut(&bundle_token)
            .ok_or(QueueError::NotFound {
                token: bundle_token,
            })?;
        bundle.queue_items.push(token);
        bundle.dirty = true;
        let _ = self.inner.event_tx.send(Event::ItemAdded {
            token,
            bundle: Some(bundle_token),
            target,
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Sources
    // ---------------------------------------------------------------------

    pub(crate) fn attach_source(
        &self,
        state: &mut QueueState,
        item_token: QueueToken,
        source: Source,
    ) -> bool {
        let Some(item) = state.items.get_mut(&item_token) else {
            return false;
        };
        let user = source.user.clone();
        let added = item.add_source(source);
        let (good, bad, priority) = (item.sources.len(), item.bad_sources.len(), item.priority);
        if added {
            state.user_queue.add(user.cid, priority, item_token);
            let _ = self.inner.event_tx.send(Event::ItemSources {
                token: item_token,
                good,
                bad,
            });
        }
        added
    }

    /// Add a source to an item
    pub async fn add_source(&self, item: QueueToken, source: Source) -> Result<bool> {
        let mut state = self.inner.state.write().await;
        if !state.items.contains_key(&item) {
            return Err(QueueError::NotFound { token: item }.into());
        }
        Ok(self.attach_source(&mut state, item, source))
    }

    /// An incoming search result whose TTH matches queued items contributes a
    /// source to each of them. Returns the touched item tokens.
    pub async fn on_search_result(
        &self,
        tth: &Tth,
        user: HintedUser,
        partial: bool,
    ) -> Vec<QueueToken> {
        let mut state = self.inner.state.write().await;
        let targets: Vec<QueueToken> = state
            .tth_to_items
            .get(tth)
            .map(|v| v.clone())
            .unwrap_or_default();
        let mut touched = Vec::new();
        for token in targets {
            let source = if partial {
                Source::partial(user.clone(), Vec::new())
            } else {
                Source::new(user.clone())
            };
            if self.attach_source(&mut state, token, source) {
                touched.push(token);
            }
        }
        touched
    }

    /// Remove a user from an item's source lists
    pub async fn remove_source(&self, item_token: QueueToken, user: &HintedUser) -> Result<bool> {
        let mut state = self.inner.state.write().await;
        let Some(item) = state.items.get_mut(&item_token) else {
            return Err(QueueError::NotFound { token: item_token }.into());
        };
        let removed = item.remove_source(user);
        let (good, bad) = (item.sources.len(), item.bad_sources.len());
        if removed {
            state.user_queue.remove(&user.cid, item_token);
            let _ = self.inner.event_tx.send(Event::ItemSources {
                token: item_token,
                good,
                bad,
            });
        }
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // Priority and removal
    // ---------------------------------------------------------------------

    /// Set a bundle's priority (clears auto-priority)
    pub async fn set_bundle_priority(&self, token: QueueToken, priority: Priority) -> Result<()> {
        let mut state = self.inner.state.write().await;
        self.set_bundle_priority_locked(&mut state, token, priority, false)
    }

    pub(crate) fn set_bundle_priority_locked(
        &self,
        state: &mut QueueState,
        token: QueueToken,
        priority: Priority,
        from_auto: bool,
    ) -> Result<()> {
        let bundle = state.bundles.get_mut(&token).ok_or(QueueError::NotFound { token })?;
        if bundle.priority == priority {
            return Ok(());
        }
        bundle.priority = priority;
        if !from_auto {
            bundle.auto_priority = false;
        }
        bundle.dirty = true;
        // A file bundle's single item always mirrors the bundle priority.
        let mirror: Vec<QueueToken> = if bundle.file_bundle {
            bundle.queue_items.clone()
        } else {
            Vec::new()
        };
        let _ = self.inner.event_tx.send(Event::BundlePriority { token, priority });
        for item_token in mirror {
            if let Some(item) = state.items.get_mut(&item_token) {
                item.priority = priority;
                state.user_queue.reprioritize(item_token, priority);
                let _ = self.inner.event_tx.send(Event::ItemPriority {
                    token: item_token,
                    priority,
                });
            }
        }
        Ok(())
    }

    /// Set a single item's priority (clears its auto-priority)
    pub async fn set_item_priority(&self, token: QueueToken, priority: Priority) -> Result<()> {
        let mut state = self.inner.state.write().await;
        self.set_item_priority_locked(&mut state, token, priority, false)
    }

    pub(crate) fn set_item_priority_locked(
        &self,
        state: &mut QueueState,
        token: QueueToken,
        priority: Priority,
        from_auto: bool,
    ) -> Result<()> {
        let item = state.items.get_mut(&token).ok_or(QueueError::NotFound { token })?;
        if item.priority == priority {
            return Ok(());
        }
        item.priority = priority;
        if !from_auto {
            item.auto_priority = false;
        }
        let bundle = item.bundle;
        state.user_queue.reprioritize(token, priority);
        if let Some(b) = bundle.and_then(|b| state.bundles.get_mut(&b)) {
            b.dirty = true;
        }
        let _ = self.inner.event_tx.send(Event::ItemPriority { token, priority });
        Ok(())
    }

    /// Remove a bundle with all member items
    pub async fn remove_bundle(&self, token: QueueToken) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let bundle = state.bundles.remove(&token).ok_or(QueueError::NotFound { token })?;
        for item_token in bundle.queue_items.iter().chain(&bundle.finished_items) {
            if let Some(item) = state.items.remove(item_token) {
                state.unindex_item(&item);
                let _ = self.inner.event_tx.send(Event::ItemRemoved {
                    token: item.token,
                    target: item.target.clone(),
                    finished: item.is_downloaded(),
                });
            }
        }
        let _ = self.inner.event_tx.send(Event::BundleRemoved {
            token,
            target: bundle.target.clone(),
        });
        drop(state);
        self.delete_bundle_file(token).await;
        Ok(())
    }

    /// Remove one item; an emptied bundle is removed along with it
    pub async fn remove_item(&self, token: QueueToken) -> Result<()> {
        let bundle_token = {
            let mut state = self.inner.state.write().await;
            let item = state.items.remove(&token).ok_or(QueueError::NotFound { token })?;
            state.unindex_item(&item);
            let bundle_token = item.bundle;
            if let Some(bt) = bundle_token
                && let Some(bundle) = state.bundles.get_mut(&bt)
            {
                bundle.remove_item(token);
            }
            let _ = self.inner.event_tx.send(Event::ItemRemoved {
                token,
                target: item.target.clone(),
                finished: item.is_downloaded(),
            });
            bundle_token.filter(|bt| {
                state
                    .bundles
                    .get(bt)
                    .is_some_and(|b| b.total_items() == 0)
            })
        };
        if let Some(bt) = bundle_token {
            self.remove_bundle(bt).await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Snapshot of a bundle
    pub async fn bundle(&self, token: QueueToken) -> Option<Bundle> {
        self.inner.state.read().await.bundles.get(&token).cloned()
    }

    /// Snapshot of an item
    pub async fn item(&self, token: QueueToken) -> Option<QueueItem> {
        self.inner.state.read().await.items.get(&token).cloned()
    }

    /// All bundle tokens
    pub async fn bundle_tokens(&self) -> Vec<QueueToken> {
        self.inner.state.read().await.bundles.keys().copied().collect()
    }

    /// The item queued at a target path
    pub async fn item_by_target(&self, target: &Path) -> Option<QueueItem> {
        let state = self.inner.state.read().await;
        let token = state
            .path_to_item
            .get(&target.to_string_lossy().to_lowercase())?;
        state.items.get(token).cloned()
    }

    /// Queued items carrying the hash
    pub async fn items_by_tth(&self, tth: &Tth) -> Vec<QueueToken> {
        self.inner
            .state
            .read()
            .await
            .tth_to_items
            .get(tth)
            .cloned()
            .unwrap_or_default()
    }

    /// Is a real path owned by an unfinished bundle?
    pub async fn is_path_queued(&self, path: &Path) -> bool {
        let state = self.inner.state.read().await;
        state
            .bundles
            .values()
            .any(|b| !b.is_completed() && b.contains_path(path))
    }

    /// Synchronous variant for the share refresh walk
    pub(crate) fn is_path_queued_blocking(&self, path: &Path) -> bool {
        let Ok(state) = self.inner.state.try_read() else {
            // Refresh can tolerate a sporadic false; the file joins the share
            // on the next refresh once the bundle completes.
            return false;
        };
        state
            .bundles
            .values()
            .any(|b| !b.is_completed() && b.contains_path(path))
    }

    pub(crate) fn emit_item_status(&self, token: QueueToken, status: QueueItemStatus) {
        let _ = self.inner.event_tx.send(Event::ItemStatus { token, status });
    }

    pub(crate) fn emit_bundle_status(&self, token: QueueToken, status: BundleStatus) {
        let _ = self.inner.event_tx.send(Event::BundleStatus { token, status });
    }
}
