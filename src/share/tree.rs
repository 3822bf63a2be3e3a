//! Share tree nodes.
//!
//! A root is a real filesystem directory with a virtual name and a set of
//! share-profile tokens. Children and files are indexed case-insensitively by
//! name within each directory. Ownership flows strictly downward; navigation
//! back up happens by path descent under the share lock, which also guards
//! removal, so a node can never be observed after its parent dropped it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::tth::Tth;

/// A shared file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareFile {
    /// File name as it appears on disk
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Content identifier; the primary global index key
    pub tth: Tth,
    /// Last-modified time, seconds since the epoch
    pub modified: i64,
}

/// A directory node in the share tree
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareDirectory {
    /// Directory name as it appears on disk
    pub name: String,
    /// Subdirectories keyed by lowercase name
    pub dirs: BTreeMap<String, ShareDirectory>,
    /// Files keyed by lowercase name
    pub files: BTreeMap<String, ShareFile>,
}

impl ShareDirectory {
    /// Create an empty directory node
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dirs: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }

    /// Insert or replace a child directory
    pub fn insert_dir(&mut self, dir: ShareDirectory) {
        self.dirs.insert(dir.name.to_lowercase(), dir);
    }

    /// Insert or replace a file
    pub fn insert_file(&mut self, file: ShareFile) {
        self.files.insert(file.name.to_lowercase(), file);
    }

    /// Case-insensitive child lookup
    pub fn dir(&self, name: &str) -> Option<&ShareDirectory> {
        self.dirs.get(&name.to_lowercase())
    }

    /// Case-insensitive file lookup
    pub fn file(&self, name: &str) -> Option<&ShareFile> {
        self.files.get(&name.to_lowercase())
    }

    /// Descend along relative path components (case-insensitive)
    pub fn descend(&self, rel: &Path) -> Option<&ShareDirectory> {
        let mut cur = self;
        for comp in rel.components() {
            let name = comp.as_os_str().to_string_lossy().to_lowercase();
            cur = cur.dirs.get(&name)?;
        }
        Some(cur)
    }

    /// Mutable descent along relative path components
    pub fn descend_mut(&mut self, rel: &Path) -> Option<&mut ShareDirectory> {
        let mut cur = self;
        for comp in rel.components() {
            let name = comp.as_os_str().to_string_lossy().to_lowercase();
            cur = cur.dirs.get_mut(&name)?;
        }
        Some(cur)
    }

    /// Total bytes in this subtree
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum::<u64>()
            + self.dirs.values().map(ShareDirectory::total_size).sum::<u64>()
    }

    /// Total files in this subtree
    pub fn total_files(&self) -> usize {
        self.files.len() + self.dirs.values().map(ShareDirectory::total_files).sum::<usize>()
    }

    /// Visit every file with its real path below `base`
    pub fn walk_files<'a>(&'a self, base: &Path, visit: &mut impl FnMut(PathBuf, &'a ShareFile)) {
        for f in self.files.values() {
            visit(base.join(&f.name), f);
        }
        for d in self.dirs.values() {
            d.walk_files(&base.join(&d.name), visit);
        }
    }

    /// Visit every directory with its real path (including self)
    pub fn walk_dirs<'a>(&'a self, base: &Path, visit: &mut impl FnMut(&Path, &'a ShareDirectory)) {
        visit(base, self);
        for d in self.dirs.values() {
            d.walk_dirs(&base.join(&d.name), visit);
        }
    }
}

/// A share root: a real path exposed under a virtual name to a set of profiles
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareRoot {
    /// Real filesystem path
    pub path: PathBuf,
    /// Name shown to peers
    pub virtual_name: String,
    /// Share profiles this root belongs to
    pub profiles: BTreeSet<u32>,
    /// Incoming roots receive completed bundles
    pub incoming: bool,
    /// Content tree; `None` until the first refresh completes
    #[serde(skip)]
    pub tree: Option<ShareDirectory>,
}

impl ShareRoot {
    /// Create a root without content
    pub fn new(path: PathBuf, virtual_name: impl Into<String>) -> Self {
        Self {
            path,
            virtual_name: virtual_name.into(),
            profiles: BTreeSet::new(),
            incoming: false,
            tree: None,
        }
    }

    /// Splice a refreshed subtree in.
    ///
    /// `sub_path` is relative to the root's real path; an empty path replaces
    /// the whole tree. Returns false when the parent of the splice point no
    /// longer exists in the live tree.
    pub fn splice(&mut self, sub_path: &Path, new_tree: ShareDirectory) -> bool {
        if sub_path.as_os_str().is_empty() {
            self.tree = Some(new_tree);
            return true;
        }
        let Some(root) = self.tree.as_mut() else {
            return false;
        };
        let parent_rel: PathBuf = match sub_path.parent() {
            Some(p) => p.to_path_buf(),
            None => PathBuf::new(),
        };
        match root.descend_mut(&parent_rel) {
            Some(parent) => {
                parent.insert_dir(new_tree);
                true
            }
            None => false,
        }
    }
}
