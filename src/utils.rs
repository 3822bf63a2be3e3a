//! Utility functions shared across the crate

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::{Regex, RegexBuilder};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Free bytes on the volume containing `path`
#[cfg(unix)]
pub fn free_disk_space(path: &Path) -> std::io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::other("path contains NUL"))?;
    // Walk up until an existing component is found; statvfs needs one.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

/// Free bytes on the volume containing `path`
#[cfg(windows)]
pub fn free_disk_space(path: &Path) -> std::io::Result<u64> {
    use std::os::windows::ffi::OsStrExt;

    let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
    let mut free: u64 = 0;
    let rc = unsafe {
        winapi::um::fileapi::GetDiskFreeSpaceExW(
            wide.as_ptr(),
            &mut free as *mut u64 as *mut _,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if rc == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(free)
}

/// Free bytes of the nearest existing ancestor of `path`.
///
/// Bundle targets usually don't exist yet while their volume does.
pub fn free_space_for_target(path: &Path) -> std::io::Result<u64> {
    let mut p = path;
    loop {
        if p.exists() {
            return free_disk_space(p);
        }
        match p.parent() {
            Some(parent) => p = parent,
            None => return free_disk_space(path),
        }
    }
}

/// Case-insensitive path prefix test: is `child` equal to or inside `parent`?
pub fn is_parent_or_exact(parent: &Path, child: &Path) -> bool {
    let parent: Vec<String> = parent
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect();
    let child: Vec<String> = child
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect();
    child.len() >= parent.len() && child[..parent.len()] == parent[..]
}

/// Case-insensitive path equality
pub fn paths_equal(a: &Path, b: &Path) -> bool {
    is_parent_or_exact(a, b) && is_parent_or_exact(b, a)
}

/// Compile a skiplist into a matcher.
///
/// In wildcard mode the pattern is a `;`-separated list of globs using `*`
/// and `?`. In regex mode the pattern is used verbatim. Matching is always
/// case-insensitive and anchored to the whole name.
pub fn compile_skiplist(pattern: &str, regex_mode: bool) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    let source = if regex_mode {
        format!("^(?:{pattern})$")
    } else {
        let parts: Vec<String> = pattern
            .split(';')
            .filter(|p| !p.is_empty())
            .map(wildcard_to_regex)
            .collect();
        if parts.is_empty() {
            return None;
        }
        format!("^(?:{})$", parts.join("|"))
    };
    RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map_err(|e| {
            tracing::warn!(pattern, error = %e, "ignoring unparseable skiplist");
            e
        })
        .ok()
}

fn wildcard_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out
}

/// True when a directory name looks like a scene release
/// (`Some.Release.2024-GRP` style: tagged, dotted, with a group suffix).
pub fn is_release_name(name: &str) -> bool {
    static PATTERN: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"^[A-Z0-9]\S{3,}-[A-Za-z0-9_]{2,}$").ok());
    name.chars().any(|c| c.is_ascii_alphabetic())
        && re.as_ref().is_some_and(|re| re.is_match(name))
}

/// True for generic container directory names (`CD1`, `Sample`, `Subs`, …)
/// that say nothing about the content they hold.
pub fn is_generic_subdir(name: &str) -> bool {
    static PATTERN: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        RegexBuilder::new(
            r"^((((S(eason)?)|DVD|CD|(D|DIS(K|C))).?([0-9](0-9)?))|Sample.?|Proof.?|Cover.?|.{0,5}Sub(s|pack)?)$",
        )
        .case_insensitive(true)
        .build()
        .ok()
    });
    re.as_ref().is_some_and(|re| re.is_match(name))
}

/// The last meaningful directory of a path: generic subdirs (`CD1`, `Subs`)
/// are skipped upward. Returns the directory name and, when subdirs were
/// skipped, the remaining sub-path below it.
pub fn meaningful_directory(path: &Path) -> (String, Option<String>) {
    let mut components: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let mut skipped: Vec<String> = Vec::new();

    while let Some(last) = components.last() {
        if components.len() > 1 && is_generic_subdir(last) {
            skipped.push(components.pop().unwrap_or_default());
        } else {
            break;
        }
    }

    let name = components.last().cloned().unwrap_or_default();
    if skipped.is_empty() {
        (name, None)
    } else {
        skipped.reverse();
        (name, Some(skipped.join("/")))
    }
}

/// Byte length of the "meaningful" part of a file name: the stem without
/// trailing digits-only qualifiers. Longer names are less likely to collide
/// with unrelated files in search results.
pub fn meaningful_name_len(file_name: &str) -> usize {
    let stem = file_name
        .rsplit_once('.')
        .map_or(file_name, |(stem, _)| stem);
    stem.trim_end_matches(|c: char| c.is_ascii_digit() || c == '_' || c == '-')
        .len()
}
