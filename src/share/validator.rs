//! Share path validation.
//!
//! Every filesystem entry scanned during a refresh passes through the
//! validator: user skiplist (wildcard or regex), forbidden extensions,
//! zero-byte and max-size rules, excluded paths, and pluggable hooks. Errors
//! are aggregated per kind and collapsed into a readable summary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use regex::Regex;

use crate::config::ShareConfig;
use crate::error::ShareError;
use crate::hooks::ActionHook;
use crate::utils::{compile_skiplist, is_parent_or_exact};

/// Input handed to share validation hooks
#[derive(Clone, Debug)]
pub struct ShareValidationRequest {
    /// Real path of the entry
    pub path: PathBuf,
    /// Size for files, `None` for directories
    pub size: Option<u64>,
}

/// Validates filesystem entries against the share rules
pub struct ShareValidator {
    skiplist: RwLock<Option<Regex>>,
    excluded: RwLock<Vec<PathBuf>>,
    forbidden_extensions: Vec<String>,
    skip_zero_byte: bool,
    max_file_size: u64,
    /// State directory; never sharable as a root
    state_dir: PathBuf,
    /// Extension point consulted for every scanned entry
    pub hooks: ActionHook<ShareValidationRequest, ()>,
}

impl ShareValidator {
    /// Build a validator from the share configuration
    pub fn new(config: &ShareConfig, forbidden_extensions: Vec<String>, state_dir: PathBuf) -> Self {
        Self {
            skiplist: RwLock::new(compile_skiplist(&config.skiplist, config.skiplist_regex)),
            excluded: RwLock::new(config.excluded_paths.clone()),
            forbidden_extensions,
            skip_zero_byte: config.skip_zero_byte,
            max_file_size: config.max_file_size,
            state_dir,
            hooks: ActionHook::new(Duration::from_secs(5)),
        }
    }

    /// Replace the skiplist after a settings change
    pub fn reload_skiplist(&self, pattern: &str, regex_mode: bool) {
        let compiled = compile_skiplist(pattern, regex_mode);
        *self.skiplist.write().unwrap_or_else(|e| e.into_inner()) = compiled;
    }

    /// Does a bare name match the skiplist?
    pub fn matches_skiplist(&self, name: &str) -> bool {
        self.skiplist
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|re| re.is_match(name))
    }

    /// Current excluded paths
    pub fn excluded_paths(&self) -> Vec<PathBuf> {
        self.excluded
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Add an excluded path; it must sit under a shared location to be useful
    pub fn add_excluded_path(&self, path: PathBuf) -> Result<(), ShareError> {
        let mut excluded = self.excluded.write().unwrap_or_else(|e| e.into_inner());
        if excluded.iter().any(|p| is_parent_or_exact(p, &path)) {
            return Err(ShareError::PathExcluded { path });
        }
        excluded.push(path);
        Ok(())
    }

    /// Remove an excluded path
    pub fn remove_excluded_path(&self, path: &Path) -> bool {
        let mut excluded = self.excluded.write().unwrap_or_else(|e| e.into_inner());
        let before = excluded.len();
        excluded.retain(|p| p != path);
        excluded.len() != before
    }

    /// True when `path` lies under an excluded path
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.excluded
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|ex| is_parent_or_exact(ex, path))
    }

    /// Validate a prospective root path
    pub fn validate_root_path(&self, path: &Path) -> Result<(), ShareError> {
        if !path.is_absolute() {
            return Err(ShareError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        if is_parent_or_exact(&self.state_dir, path) || is_parent_or_exact(path, &self.state_dir) {
            return Err(ShareError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        #[cfg(windows)]
        {
            let lower = path.to_string_lossy().to_lowercase();
            if lower.contains("\\windows") {
                return Err(ShareError::InvalidPath {
                    path: path.to_path_buf(),
                });
            }
        }
        if self.is_excluded(path) {
            return Err(ShareError::PathExcluded {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Validate a directory found during a refresh walk
    pub fn validate_directory(&self, path: &Path, name: &str) -> Result<(), ShareError> {
        if self.matches_skiplist(name) {
            return Err(ShareError::SkiplistMatch {
                path: path.to_path_buf(),
            });
        }
        if self.is_excluded(path) {
            return Err(ShareError::PathExcluded {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Validate a file found during a refresh walk.
    ///
    /// `in_unfinished_bundle` marks files currently owned by the download
    /// queue; they are not shared until their bundle completes.
    pub fn validate_file(
        &self,
        path: &Path,
        name: &str,
        size: u64,
        in_unfinished_bundle: bool,
    ) -> Result<(), ShareError> {
        if self.matches_skiplist(name) {
            return Err(ShareError::SkiplistMatch {
                path: path.to_path_buf(),
            });
        }
        if let Some(ext) = name.rsplit_once('.').map(|(_, e)| e.to_lowercase())
            && self.forbidden_extensions.iter().any(|f| *f == ext)
        {
            return Err(ShareError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        if self.skip_zero_byte && size == 0 {
            return Err(ShareError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        if self.max_file_size > 0 && size > self.max_file_size {
            return Err(ShareError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        if in_unfinished_bundle {
            return Err(ShareError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        if self.is_excluded(path) {
            return Err(ShareError::PathExcluded {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }
}

/// Aggregates per-path validation errors into a compact report.
///
/// Error kinds with at most three occurrences list the offending files; noisier
/// kinds collapse into a count against the scanned total.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    total_files: usize,
    /// kind -> offending files, in first-seen order
    errors: BTreeMap<String, Vec<String>>,
}

impl ErrorCollector {
    /// Create a collector; `total_files` is used in collapsed summaries
    pub fn new(total_files: usize) -> Self {
        Self {
            total_files,
            errors: BTreeMap::new(),
        }
    }

    /// Record one error occurrence
    pub fn add(&mut self, kind: impl Into<String>, file: impl Into<String>) {
        self.errors.entry(kind.into()).or_default().push(file.into());
    }

    /// Number of recorded occurrences
    pub fn count(&self) -> usize {
        self.errors.values().map(Vec::len).sum()
    }

    /// Render the summary, or `None` when nothing was recorded
    pub fn message(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|(kind, files)| {
                if files.len() <= 3 {
                    format!("{kind}: {}", files.join(", "))
                } else {
                    format!("{kind}: {} of {} files", files.len(), self.total_files)
                }
            })
            .collect();
        Some(parts.join(", "))
    }
}
