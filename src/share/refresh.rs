//! Share refresh tasks.
//!
//! A refresh scans a set of real paths and builds *new* subtrees next to the
//! live ones; the manager splices a finished subtree in atomically under the
//! share lock. The worker never mutates the live tree, checks cancellation
//! between files, and holds a hash pauser so competing hash work stays quiet
//! while the walk runs.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::hasher::Hasher;
use crate::share::tree::{ShareDirectory, ShareFile};
use crate::share::validator::{ErrorCollector, ShareValidator};
use crate::types::{QueueToken, RefreshStats};

/// Scheduling class of a refresh task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefreshPriority {
    /// Kicked off by the user
    Manual,
    /// Periodic schedule
    Scheduled,
    /// Initial scan at startup
    Startup,
    /// Runs synchronously on the caller's task
    Blocking,
}

/// What a refresh task covers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshKind {
    /// Every root
    All,
    /// A set of existing shared directories
    Dirs,
    /// A root that was just added
    AddRoot,
    /// Incoming roots only
    Incoming,
    /// A completed bundle's directory
    Bundle,
}

/// One queued refresh
#[derive(Debug)]
pub struct RefreshTask {
    /// Task token, reported back in completion events
    pub token: QueueToken,
    /// What the task covers
    pub kind: RefreshKind,
    /// Scheduling class
    pub priority: RefreshPriority,
    /// Real paths to scan
    pub paths: Vec<PathBuf>,
    /// Cooperative cancellation; checked between files
    pub cancel: CancellationToken,
}

/// Collected result of scanning one real path
#[derive(Debug)]
pub struct ScanResult {
    /// Real path the subtree was built for
    pub path: PathBuf,
    /// The freshly built subtree
    pub tree: ShareDirectory,
    /// Scan statistics
    pub stats: RefreshStats,
    /// Validation error summary, if any entries were rejected
    pub error_summary: Option<String>,
}

struct RawEntry {
    rel: PathBuf,
    name: String,
    size: u64,
    modified: i64,
    is_dir: bool,
}

fn list_entries(base: &Path) -> std::io::Result<Vec<RawEntry>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(base).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry during refresh");
                continue;
            }
        };
        let Ok(rel) = entry.path().strip_prefix(base) else {
            continue;
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "stat failed during refresh");
                continue;
            }
        };
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        out.push(RawEntry {
            rel: rel.to_path_buf(),
            name: entry.file_name().to_string_lossy().into_owned(),
            size: meta.len(),
            modified,
            is_dir: meta.is_dir(),
        });
    }
    Ok(out)
}

/// Scan one real directory into a fresh subtree.
///
/// `old_tree` lets unchanged files (same size and mtime) reuse their hashes;
/// everything else is stream-hashed. `is_queued` marks files owned by an
/// unfinished bundle, which must not enter the share yet.
pub async fn scan_path(
    base: &Path,
    validator: &ShareValidator,
    hasher: &Hasher,
    old_tree: Option<&ShareDirectory>,
    is_queued: &(dyn Fn(&Path) -> bool + Sync),
    cancel: &CancellationToken,
) -> std::io::Result<ScanResult> {
    let started = Instant::now();
    let base_owned = base.to_path_buf();
    let entries =
        tokio::task::spawn_blocking(move || list_entries(&base_owned))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;

    let mut stats = RefreshStats::default();
    let mut errors = ErrorCollector::new(entries.iter().filter(|e| !e.is_dir).count());

    let root_name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut tree = ShareDirectory::new(root_name);

    for entry in &entries {
        if cancel.is_cancelled() {
            tracing::debug!(path = %base.display(), "refresh cancelled mid-walk");
            return Err(std::io::Error::other("refresh cancelled"));
        }
        let abs = base.join(&entry.rel);
        if entry.is_dir {
            if let Err(e) = validator.validate_directory(&abs, &entry.name) {
                tracing::debug!(path = %abs.display(), error = %e, "directory rejected");
                continue;
            }
            // Materialise the node even when empty
            if let Some(parent) = find_parent(&mut tree, &entry.rel) {
                parent.insert_dir(ShareDirectory::new(entry.name.clone()));
                stats.dirs_scanned += 1;
            }
            continue;
        }

        // A rejected ancestor hides the whole subtree; don't hash unreachable files.
        if find_parent(&mut tree, &entry.rel).is_none() {
            continue;
        }

        if let Err(e) = validator.validate_file(&abs, &entry.name, entry.size, is_queued(&abs)) {
            stats.files_skipped += 1;
            errors.add(error_kind(&e), entry.name.clone());
            continue;
        }

        let reused = old_tree
            .and_then(|t| lookup_old(t, &entry.rel))
            .filter(|old| old.size == entry.size && old.modified == entry.modified)
            .map(|old| old.tth);

        let tth = match reused {
            Some(tth) => tth,
            None => {
                hasher.wait_unpaused().await;
                match hasher.hash_file(&abs).await {
                    Ok(t) => t.root(),
                    Err(e) => {
                        tracing::warn!(path = %abs.display(), error = %e, "hashing failed");
                        stats.files_skipped += 1;
                        errors.add("hashing failed", entry.name.clone());
                        continue;
                    }
                }
            }
        };

        if let Some(parent) = find_parent(&mut tree, &entry.rel) {
            parent.insert_file(ShareFile {
                name: entry.name.clone(),
                size: entry.size,
                tth,
                modified: entry.modified,
            });
            stats.files_indexed += 1;
            stats.bytes_indexed += entry.size;
        }
    }

    stats.duration_ms = started.elapsed().as_millis() as u64;
    let error_summary = errors.message();
    if let Some(summary) = &error_summary {
        tracing::info!(path = %base.display(), summary, "refresh finished with rejected entries");
    }

    Ok(ScanResult {
        path: base.to_path_buf(),
        tree,
        stats,
        error_summary,
    })
}

fn error_kind(e: &crate::error::ShareError) -> &'static str {
    use crate::error::ShareError;
    match e {
        ShareError::SkiplistMatch { .. } => "skiplist match",
        ShareError::PathExcluded { .. } => "excluded path",
        _ => "invalid entry",
    }
}

/// Walk down to the node that should own `rel`'s final component; parents that
/// were rejected by validation make the whole subtree unreachable.
fn find_parent<'t>(tree: &'t mut ShareDirectory, rel: &Path) -> Option<&'t mut ShareDirectory> {
    match rel.parent() {
        Some(p) if !p.as_os_str().is_empty() => tree.descend_mut(p),
        _ => Some(tree),
    }
}

fn lookup_old<'t>(tree: &'t ShareDirectory, rel: &Path) -> Option<&'t ShareFile> {
    let parent = match rel.parent() {
        Some(p) if !p.as_os_str().is_empty() => tree.descend(p)?,
        _ => tree,
    };
    parent.file(&rel.file_name()?.to_string_lossy())
}
