//! Content index: share roots, refresh pipeline, search answering.
//!
//! The share is a forest of [`tree::ShareRoot`]s plus two global secondary
//! indexes: TTH → file list (many names may carry one hash) and lowercase
//! directory basename → real paths (dupe detection, partial lists). A refresh
//! never mutates the live tree; it builds a new subtree and splices it in
//! under the write lock, then rebuilds the indexes and fires
//! `RefreshCompleted`.

pub mod bloom;
pub mod refresh;
pub mod tree;
pub mod validator;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quick_xml::Reader;
use quick_xml::events::Event as XmlEvent;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result, ShareError};
use crate::hasher::Hasher;
use crate::tth::Tth;
use crate::types::{DupeType, Event, QueueToken, RefreshStats};
use crate::utils::{is_parent_or_exact, meaningful_directory, paths_equal};
use crate::xml::{XmlWriter, attr_map};

use bloom::SearchBloom;
use refresh::{RefreshKind, RefreshPriority, RefreshTask, scan_path};
use tree::{ShareDirectory, ShareRoot};
use validator::ShareValidator;

/// Default share profile token; every root belongs to it implicitly
pub const DEFAULT_PROFILE: u32 = 0;

/// A file reachable through the share, with its resolved locations
#[derive(Clone, Debug)]
pub struct IndexedFile {
    /// Real path on disk
    pub real_path: PathBuf,
    /// Virtual path as exposed to peers (`/Root/dir/file.ext`)
    pub virtual_path: String,
    /// Size in bytes
    pub size: u64,
    /// Content hash
    pub tth: Tth,
    /// Profiles that may see this file; empty means every profile
    pub profiles: BTreeSet<u32>,
}

impl IndexedFile {
    /// May the given profile download this file?
    pub fn visible_to(&self, profile: u32) -> bool {
        self.profiles.is_empty() || self.profiles.contains(&profile)
    }
}

/// A parsed incoming search
#[derive(Clone, Debug, Default)]
pub struct SearchQuery {
    /// Terms that must all appear in the virtual path
    pub include: Vec<String>,
    /// Terms that must not appear
    pub exclude: Vec<String>,
    /// Exact content hash; overrides text matching when set
    pub tth: Option<Tth>,
    /// Minimum size bound
    pub min_size: Option<u64>,
    /// Maximum size bound
    pub max_size: Option<u64>,
    /// Acceptable extensions (lowercase, no dot); empty accepts all
    pub extensions: Vec<String>,
}

impl SearchQuery {
    /// Match a file by virtual path and size
    fn matches(&self, virtual_path_lower: &str, size: u64) -> bool {
        if let Some(min) = self.min_size
            && size < min
        {
            return false;
        }
        if let Some(max) = self.max_size
            && size > max
        {
            return false;
        }
        if !self.extensions.is_empty() {
            let ext = virtual_path_lower.rsplit_once('.').map(|(_, e)| e);
            match ext {
                Some(e) if self.extensions.iter().any(|x| x == e) => {}
                _ => return false,
            }
        }
        self.include
            .iter()
            .all(|t| virtual_path_lower.contains(&t.to_lowercase()))
            && !self
                .exclude
                .iter()
                .any(|t| virtual_path_lower.contains(&t.to_lowercase()))
    }
}

/// One search answer
#[derive(Clone, Debug)]
pub struct SearchResultItem {
    /// Virtual path of the match
    pub virtual_path: String,
    /// Size in bytes
    pub size: u64,
    /// Content hash
    pub tth: Tth,
}

struct ShareState {
    roots: Vec<ShareRoot>,
    /// TTH → every shared file carrying that hash
    tth_index: HashMap<Tth, Vec<IndexedFile>>,
    /// lowercase directory basename → real paths
    dir_index: HashMap<String, Vec<PathBuf>>,
    bloom: SearchBloom,
    profiles: BTreeMap<u32, String>,
}

impl ShareState {
    fn rebuild_indexes(&mut self) {
        let mut tth_index: HashMap<Tth, Vec<IndexedFile>> = HashMap::new();
        let mut dir_index: HashMap<String, Vec<PathBuf>> = HashMap::new();
        let mut bloom = SearchBloom::new(
            self.roots
                .iter()
                .filter_map(|r| r.tree.as_ref())
                .map(ShareDirectory::total_files)
                .sum(),
        );

        for root in &self.roots {
            let Some(tree) = root.tree.as_ref() else {
                continue;
            };
            let virtual_base = format!("/{}", root.virtual_name);
            tree.walk_dirs(&root.path, &mut |path, dir| {
                let key = dir.name.to_lowercase();
                if !key.is_empty() {
                    dir_index.entry(key).or_default().push(path.to_path_buf());
                }
                bloom.add_name(&dir.name);
            });
            tree.walk_files(&root.path, &mut |real_path, file| {
                let rel = real_path
                    .strip_prefix(&root.path)
                    .unwrap_or(&real_path)
                    .to_string_lossy()
                    .replace('\\', "/");
                let virtual_path = format!("{virtual_base}/{rel}");
                bloom.add_name(&file.name);
                tth_index.entry(file.tth).or_default().push(IndexedFile {
                    real_path: real_path.clone(),
                    virtual_path,
                    size: file.size,
                    tth: file.tth,
                    profiles: root.profiles.clone(),
                });
            });
        }

        self.tth_index = tth_index;
        self.dir_index = dir_index;
        self.bloom = bloom;
    }
}

struct ShareInner {
    state: RwLock<ShareState>,
    validator: Arc<ShareValidator>,
    hasher: Hasher,
    event_tx: tokio::sync::broadcast::Sender<Event>,
    refresh_tx: mpsc::UnboundedSender<RefreshTask>,
    refresh_rx: Mutex<Option<mpsc::UnboundedReceiver<RefreshTask>>>,
    /// Paths queued but not yet picked up; duplicates are dropped
    queued_paths: std::sync::Mutex<HashSet<PathBuf>>,
    /// Asks the queue whether a path belongs to an unfinished bundle
    queued_checker: std::sync::RwLock<Option<Arc<dyn Fn(&Path) -> bool + Send + Sync>>>,
    refresh_parallel: bool,
    shares_file: PathBuf,
    cancel: CancellationToken,
}

/// The content index manager (cloneable; all state is shared)
#[derive(Clone)]
pub struct ShareManager {
    inner: Arc<ShareInner>,
}

impl ShareManager {
    /// Create the manager and load persisted roots from `shares.xml`
    pub async fn new(
        config: &Config,
        event_tx: tokio::sync::broadcast::Sender<Event>,
        hasher: Hasher,
    ) -> Result<Self> {
        let validator = Arc::new(ShareValidator::new(
            &config.share,
            config.queue.forbidden_extensions.clone(),
            config.state_dir.clone(),
        ));
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

        let mut profiles = BTreeMap::new();
        profiles.insert(DEFAULT_PROFILE, "Default".to_string());

        let manager = Self {
            inner: Arc::new(ShareInner {
                state: RwLock::new(ShareState {
                    roots: Vec::new(),
                    tth_index: HashMap::new(),
                    dir_index: HashMap::new(),
                    bloom: SearchBloom::new(0),
                    profiles,
                }),
                validator,
                hasher,
                event_tx,
                refresh_tx,
                refresh_rx: Mutex::new(Some(refresh_rx)),
                queued_paths: std::sync::Mutex::new(HashSet::new()),
                queued_checker: std::sync::RwLock::new(None),
                refresh_parallel: config.share.refresh_parallel,
                shares_file: config.state_dir.join("shares.xml"),
                cancel: CancellationToken::new(),
            }),
        };
        manager.load().await?;
        Ok(manager)
    }

    /// Register the callback deciding whether a path is owned by an
    /// unfinished bundle (provided by the queue engine)
    pub fn set_queued_checker(&self, check: Arc<dyn Fn(&Path) -> bool + Send + Sync>) {
        *self
            .inner
            .queued_checker
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(check);
    }

    /// The path validator, for hook registration and skiplist reloads
    pub fn validator(&self) -> &ShareValidator {
        &self.inner.validator
    }

    /// Start the refresh worker
    pub async fn spawn(&self) {
        let Some(mut rx) = self.inner.refresh_rx.lock().await.take() else {
            return;
        };
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.inner.cancel.cancelled() => {
                        tracing::debug!("refresh worker stopped");
                        return;
                    }
                    task = rx.recv() => {
                        let Some(task) = task else { return };
                        manager.run_refresh(task).await;
                    }
                }
            }
        });
    }

    /// Stop the worker and persist roots
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.cancel.cancel();
        self.save().await
    }

    // ---------------------------------------------------------------------
    // Roots
    // ---------------------------------------------------------------------

    /// Add a share root and queue its initial scan
    pub async fn add_root(
        &self,
        path: PathBuf,
        virtual_name: impl Into<String>,
        profiles: BTreeSet<u32>,
        incoming: bool,
    ) -> Result<QueueToken> {
        self.inner.validator.validate_root_path(&path)?;
        {
            let mut state = self.inner.state.write().await;
            if state
                .roots
                .iter()
                .any(|r| is_parent_or_exact(&r.path, &path) || is_parent_or_exact(&path, &r.path))
            {
                return Err(ShareError::PathAlreadyShared { path }.into());
            }
            let mut root = ShareRoot::new(path.clone(), virtual_name);
            root.profiles = profiles;
            root.incoming = incoming;
            state.roots.push(root);
        }
        self.save().await?;
        self.refresh(vec![path], RefreshPriority::Manual, RefreshKind::AddRoot)
    }

    /// Remove a share root and drop its subtree from the indexes
    pub async fn remove_root(&self, path: &Path) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            let before = state.roots.len();
            state.roots.retain(|r| !paths_equal(&r.path, path));
            if state.roots.len() == before {
                return Err(ShareError::PathNotShared {
                    path: path.to_path_buf(),
                }
                .into());
            }
            state.rebuild_indexes();
        }
        self.save().await
    }

    /// Real paths of all roots
    pub async fn root_paths(&self) -> Vec<PathBuf> {
        self.inner
            .state
            .read()
            .await
            .roots
            .iter()
            .map(|r| r.path.clone())
            .collect()
    }

    /// Register a share profile
    pub async fn add_profile(&self, token: u32, name: impl Into<String>) {
        self.inner
            .state
            .write()
            .await
            .profiles
            .insert(token, name.into());
    }

    /// Profile name lookup
    pub async fn profile_name(&self, token: u32) -> Result<String> {
        self.inner
            .state
            .read()
            .await
            .profiles
            .get(&token)
            .cloned()
            .ok_or_else(|| ShareError::ProfileNotFound(token).into())
    }

    // ---------------------------------------------------------------------
    // Refresh
    // ---------------------------------------------------------------------

    /// Queue a refresh of the given real paths.
    ///
    /// Paths already waiting in the queue are dropped; an in-flight refresh is
    /// never cancelled by a new overlapping request. `Blocking` priority runs
    /// on the caller's task instead of the worker.
    pub fn refresh(
        &self,
        paths: Vec<PathBuf>,
        priority: RefreshPriority,
        kind: RefreshKind,
    ) -> Result<QueueToken> {
        let fresh: Vec<PathBuf> = {
            let mut queued = self
                .inner
                .queued_paths
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            paths
                .into_iter()
                .filter(|p| queued.insert(p.clone()))
                .collect()
        };
        if fresh.is_empty() {
            return Err(Error::Other("all paths are already queued for refresh".into()));
        }

        let token = QueueToken::next();
        let task = RefreshTask {
            token,
            kind,
            priority,
            paths: fresh.clone(),
            cancel: self.inner.cancel.child_token(),
        };
        let _ = self.inner.event_tx.send(Event::RefreshQueued {
            task: token,
            paths: fresh,
        });

        if priority == RefreshPriority::Blocking {
            let manager = self.clone();
            // Caller awaits the refresh inline through a dedicated handle.
            let handle = tokio::runtime::Handle::current();
            tokio::task::block_in_place(move || {
                handle.block_on(manager.run_refresh(task));
            });
        } else {
            self.inner
                .refresh_tx
                .send(task)
                .map_err(|_| Error::ShuttingDown)?;
        }
        Ok(token)
    }

    /// Queue a refresh of every root
    pub async fn refresh_all(&self, priority: RefreshPriority) -> Result<QueueToken> {
        let paths = self.root_paths().await;
        if paths.is_empty() {
            return Err(Error::Other("nothing is shared".into()));
        }
        self.refresh(paths, priority, RefreshKind::All)
    }

    async fn run_refresh(&self, task: RefreshTask) {
        // Keep competing hash work quiet for the duration of the walk.
        let _pauser = self.inner.hasher.pause();
        let is_queued = self
            .inner
            .queued_checker
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let is_queued = move |p: &Path| is_queued.as_ref().is_some_and(|f| f(p));

        let mut total = RefreshStats::default();
        let scans = task.paths.iter().map(|path| {
            let is_queued: &(dyn Fn(&Path) -> bool + Sync) = &is_queued;
            let cancel = &task.cancel;
            async move {
                let (root_path, sub_rel, old_tree) = self.locate(path).await?;
                let result = scan_path(
                    path,
                    &self.inner.validator,
                    &self.inner.hasher,
                    old_tree.as_ref(),
                    is_queued,
                    cancel,
                )
                .await;
                Some((root_path, sub_rel, result))
            }
        });

        let outcomes = if self.inner.refresh_parallel {
            futures::future::join_all(scans).await
        } else {
            let mut done = Vec::new();
            for scan in scans {
                done.push(scan.await);
            }
            done
        };

        {
            let mut state = self.inner.state.write().await;
            for outcome in outcomes.into_iter().flatten() {
                let (root_path, sub_rel, result) = outcome;
                match result {
                    Ok(scan) => {
                        total.dirs_scanned += scan.stats.dirs_scanned;
                        total.files_indexed += scan.stats.files_indexed;
                        total.bytes_indexed += scan.stats.bytes_indexed;
                        total.files_skipped += scan.stats.files_skipped;
                        total.duration_ms = total.duration_ms.max(scan.stats.duration_ms);
                        if let Some(root) =
                            state.roots.iter_mut().find(|r| paths_equal(&r.path, &root_path))
                            && !root.splice(&sub_rel, scan.tree)
                        {
                            tracing::warn!(
                                path = %scan.path.display(),
                                "splice point vanished, subtree dropped"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "refresh scan failed");
                    }
                }
            }
            state.rebuild_indexes();
        }

        {
            let mut queued = self
                .inner
                .queued_paths
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for p in &task.paths {
                queued.remove(p);
            }
        }

        tracing::info!(
            task = task.token.get(),
            kind = ?task.kind,
            files = total.files_indexed,
            skipped = total.files_skipped,
            "refresh completed"
        );
        let _ = self.inner.event_tx.send(Event::RefreshCompleted {
            task: task.token,
            stats: total,
        });
    }

    /// Resolve a real path to its owning root, the relative splice point and
    /// a clone of the old subtree (for hash reuse)
    async fn locate(&self, path: &Path) -> Option<(PathBuf, PathBuf, Option<ShareDirectory>)> {
        let state = self.inner.state.read().await;
        let root = state
            .roots
            .iter()
            .find(|r| is_parent_or_exact(&r.path, path))?;
        let rel = path.strip_prefix(&root.path).ok()?.to_path_buf();
        let old = match root.tree.as_ref() {
            Some(tree) if rel.as_os_str().is_empty() => Some(tree.clone()),
            Some(tree) => tree.descend(&rel).cloned(),
            None => None,
        };
        Some((root.path.clone(), rel, old))
    }

    // ---------------------------------------------------------------------
    // Lookup and search
    // ---------------------------------------------------------------------

    /// Every shared file carrying the hash
    pub async fn find_by_tth(&self, tth: &Tth) -> Vec<IndexedFile> {
        self.inner
            .state
            .read()
            .await
            .tth_index
            .get(tth)
            .cloned()
            .unwrap_or_default()
    }

    /// The preferred on-disk location for a hash, if shared and visible
    pub async fn lookup_transfer(&self, tth: &Tth, profile: u32) -> Option<IndexedFile> {
        self.inner
            .state
            .read()
            .await
            .tth_index
            .get(tth)?
            .iter()
            .find(|f| f.visible_to(profile))
            .cloned()
    }

    /// Answer a search against the index
    pub async fn search(&self, query: &SearchQuery, profile: u32) -> Vec<SearchResultItem> {
        let state = self.inner.state.read().await;

        if let Some(tth) = &query.tth {
            return state
                .tth_index
                .get(tth)
                .map(|files| {
                    files
                        .iter()
                        .filter(|f| f.visible_to(profile))
                        .map(|f| SearchResultItem {
                            virtual_path: f.virtual_path.clone(),
                            size: f.size,
                            tth: f.tth,
                        })
                        .collect()
                })
                .unwrap_or_default();
        }

        // Fast negative answer before walking anything.
        if !state
            .bloom
            .maybe_contains_all(query.include.iter().map(String::as_str))
        {
            return Vec::new();
        }

        let mut out = Vec::new();
        for files in state.tth_index.values() {
            for f in files {
                if f.visible_to(profile) && query.matches(&f.virtual_path.to_lowercase(), f.size) {
                    out.push(SearchResultItem {
                        virtual_path: f.virtual_path.clone(),
                        size: f.size,
                        tth: f.tth,
                    });
                }
            }
        }
        out
    }

    /// Classify a local directory path against the share (dupe detection)
    pub async fn directory_dupe(&self, path: &Path, size: u64) -> DupeType {
        let (name, _) = meaningful_directory(path);
        let state = self.inner.state.read().await;
        let Some(candidates) = state.dir_index.get(&name.to_lowercase()) else {
            return DupeType::None;
        };
        for candidate in candidates {
            let shared_size = state
                .roots
                .iter()
                .filter_map(|r| {
                    let rel = candidate.strip_prefix(&r.path).ok()?;
                    r.tree.as_ref()?.descend(rel)
                })
                .map(ShareDirectory::total_size)
                .next();
            if let Some(shared_size) = shared_size {
                return if size > 0 && shared_size == size {
                    DupeType::ShareFull
                } else {
                    DupeType::SharePartial
                };
            }
        }
        DupeType::None
    }

    /// Is any shared file stored at this exact real path?
    pub async fn is_real_path_shared(&self, path: &Path) -> bool {
        self.inner
            .state
            .read()
            .await
            .tth_index
            .values()
            .flatten()
            .any(|f| paths_equal(&f.real_path, path))
    }

    /// Total shared bytes visible to a profile
    pub async fn total_size(&self, profile: u32) -> u64 {
        let state = self.inner.state.read().await;
        state
            .roots
            .iter()
            .filter(|r| r.profiles.is_empty() || r.profiles.contains(&profile))
            .filter_map(|r| r.tree.as_ref())
            .map(ShareDirectory::total_size)
            .sum()
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    /// Write `shares.xml`
    pub async fn save(&self) -> Result<()> {
        let state = self.inner.state.read().await;
        let mut w = XmlWriter::new();
        w.open("Share", &[("Version", "1".into())]);
        for root in &state.roots {
            w.open(
                "Root",
                &[
                    ("Path", root.path.to_string_lossy().into_owned()),
                    ("Virtual", root.virtual_name.clone()),
                    ("Incoming", if root.incoming { "1" } else { "0" }.into()),
                ],
            );
            for profile in &root.profiles {
                w.empty("Profile", &[("Token", profile.to_string())]);
            }
            w.close("Root");
        }
        for path in self.inner.validator.excluded_paths() {
            w.empty("Exclude", &[("Path", path.to_string_lossy().into_owned())]);
        }
        w.close("Share");
        drop(state);

        let doc = w.finish();
        if let Some(parent) = self.inner.shares_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.inner.shares_file, doc).await?;
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        let doc = match tokio::fs::read_to_string(&self.inner.shares_file).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = Reader::from_str(&doc);
        let mut state = self.inner.state.write().await;
        let mut current_root: Option<ShareRoot> = None;
        loop {
            match reader.read_event() {
                Ok(XmlEvent::Start(el)) | Ok(XmlEvent::Empty(el)) => {
                    let attrs = attr_map(&el);
                    match el.name().as_ref() {
                        b"Root" => {
                            if let Some(done) = current_root.take() {
                                state.roots.push(done);
                            }
                            if let Some(path) = attrs.get("Path") {
                                let mut root = ShareRoot::new(
                                    PathBuf::from(path),
                                    attrs.get("Virtual").cloned().unwrap_or_default(),
                                );
                                root.incoming = attrs.get("Incoming").map(String::as_str) == Some("1");
                                current_root = Some(root);
                            }
                        }
                        b"Profile" => {
                            if let (Some(root), Some(token)) = (
                                current_root.as_mut(),
                                attrs.get("Token").and_then(|t| t.parse().ok()),
                            ) {
                                root.profiles.insert(token);
                            }
                        }
                        b"Exclude" => {
                            if let Some(path) = attrs.get("Path") {
                                let _ = self
                                    .inner
                                    .validator
                                    .add_excluded_path(PathBuf::from(path));
                            }
                        }
                        _ => {}
                    }
                }
                Ok(XmlEvent::End(el)) => {
                    if el.name().as_ref() == b"Root"
                        && let Some(done) = current_root.take()
                    {
                        state.roots.push(done);
                    }
                }
                Ok(XmlEvent::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(Error::Persistence {
                        path: self.inner.shares_file.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        if let Some(done) = current_root.take() {
            state.roots.push(done);
        }
        tracing::info!(roots = state.roots.len(), "loaded share roots");
        Ok(())
    }
}
