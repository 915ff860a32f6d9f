//! Path safety and filesystem helpers.
//!
//! Every server-supplied path goes through this module before it touches
//! the disk:
//! - Relative path normalization (hypermedia and ZIP flavours)
//! - Root confinement checks
//! - Ignore-list matching
//! - Atomic file replacement and empty-directory pruning

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};

use crate::error::UpdateError;

/// Normalize a catalog-supplied relative path.
///
/// Backslashes become `/`, `.` segments and duplicate separators are
/// dropped, `..` collapses against its parent and any leading `/` is
/// stripped. Paths that are empty or still climb above the root after
/// collapsing are rejected.
pub fn normalize_rel_path(raw: &str) -> Result<String, UpdateError> {
    let replaced = raw.trim().replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in replaced.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(UpdateError::PathSafety(format!(
                        "path escapes installation root: {}",
                        raw
                    )));
                }
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(UpdateError::PathSafety(format!("empty relative path: {:?}", raw)));
    }
    Ok(segments.join("/"))
}

/// Normalize a ZIP entry name.
///
/// Stricter than [`normalize_rel_path`]: absolute names, drive letters and
/// any `..` segment are rejected outright instead of being collapsed.
pub fn normalize_zip_rel_path(raw: &str) -> Result<String, UpdateError> {
    let replaced = raw.replace('\\', "/");
    if replaced.starts_with('/') {
        return Err(UpdateError::PathSafety(format!("absolute ZIP entry: {}", raw)));
    }
    let bytes = replaced.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(UpdateError::PathSafety(format!("drive-qualified ZIP entry: {}", raw)));
    }
    if replaced.split('/').any(|segment| segment == "..") {
        return Err(UpdateError::PathSafety(format!("ZIP entry escapes root: {}", raw)));
    }
    normalize_rel_path(&replaced)
}

/// Join a normalized relative path onto `root`, refusing anything that
/// would resolve outside of it.
pub fn resolve_within_root(root: &Path, rel: &str) -> Result<PathBuf, UpdateError> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(UpdateError::PathSafety(format!(
                    "path escapes installation root: {}",
                    rel
                )));
            }
        }
    }
    Ok(resolved)
}

/// Lexical check that `candidate` equals or descends from `root`.
pub fn is_within_root(root: &Path, candidate: &Path) -> bool {
    lexical_normalize(candidate).starts_with(lexical_normalize(root))
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Relative path of `path` under `root`, with `/` separators.
pub fn to_rel_string(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Turn an arbitrary identifier into a single safe directory name.
pub fn safe_id_segment(id: &str) -> String {
    let cleaned: String = id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

/// Compiled ignore list.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<IgnoreRule>,
}

#[derive(Debug, Clone)]
enum IgnoreRule {
    /// `dir/` matches the directory and everything below it
    Prefix(String),
    /// Wildcard pattern compiled to an anchored regex; `basename_only` when
    /// the pattern has no `/`
    Glob { pattern: Regex, basename_only: bool },
    /// Slash-free literal compared with the basename
    Basename(String),
    Exact(String),
}

impl IgnoreRules {
    /// Compile raw ignore-list entries.
    ///
    /// Blank lines and `#` comments are skipped, duplicates collapse.
    pub fn compile<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut seen: Vec<String> = Vec::new();
        for entry in entries {
            let mut cleaned = entry.as_ref().trim().replace('\\', "/");
            if cleaned.is_empty() || cleaned.starts_with('#') {
                continue;
            }
            while cleaned.contains("//") {
                cleaned = cleaned.replace("//", "/");
            }
            let cleaned = cleaned.trim_start_matches('/').to_string();
            if cleaned.is_empty() || seen.contains(&cleaned) {
                continue;
            }
            seen.push(cleaned);
        }

        let rules = seen
            .into_iter()
            .filter_map(|entry| {
                let rule = if let Some(dir) = entry.strip_suffix('/') {
                    IgnoreRule::Prefix(dir.to_string())
                } else if entry.contains(|c: char| c == '*' || c == '?') {
                    match Regex::new(&glob_to_regex(&entry)) {
                        Ok(pattern) => IgnoreRule::Glob {
                            basename_only: !entry.contains('/'),
                            pattern,
                        },
                        Err(e) => {
                            warn!(pattern = %entry, error = %e, "Skipping unusable ignore pattern");
                            return None;
                        }
                    }
                } else if !entry.contains('/') {
                    IgnoreRule::Basename(entry)
                } else {
                    IgnoreRule::Exact(entry)
                };
                Some(rule)
            })
            .collect();
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether a normalized relative path is excluded.
    pub fn matches(&self, rel_path: &str) -> bool {
        let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
        self.rules.iter().any(|rule| match rule {
            IgnoreRule::Prefix(dir) => {
                rel_path == dir
                    || (rel_path.len() > dir.len()
                        && rel_path.starts_with(dir.as_str())
                        && rel_path.as_bytes()[dir.len()] == b'/')
            }
            IgnoreRule::Glob {
                pattern,
                basename_only,
            } => {
                pattern.is_match(rel_path) || (*basename_only && pattern.is_match(basename))
            }
            IgnoreRule::Basename(name) => basename == name || rel_path == name,
            IgnoreRule::Exact(path) => rel_path == path,
        })
    }
}

/// Anchored regex for a glob: `**` spans separators, `*` and `?` do not.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("(?s)^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}

/// Recursively list regular files below `root` as `/`-separated relative paths.
pub fn collect_files(root: &Path) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    if !root.is_dir() {
        return Ok(out);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Some(rel) = to_rel_string(root, &path) {
                    out.push(rel);
                }
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Remove a file and prune now-empty parents up to, not including, `root`.
///
/// Returns `true` when a file was actually removed.
pub fn remove_file_and_empty_parents(root: &Path, path: &Path) -> io::Result<bool> {
    let removed = match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(e),
    };
    prune_empty_parents(root, path);
    Ok(removed)
}

/// Remove empty directories between `path` and `root`.
pub fn prune_empty_parents(root: &Path, path: &Path) {
    let root = lexical_normalize(root);
    let mut current = path.parent().map(Path::to_path_buf);
    while let Some(dir) = current {
        let normalized = lexical_normalize(&dir);
        if normalized == root || !normalized.starts_with(&root) {
            break;
        }
        // remove_dir fails on non-empty directories, which ends the walk
        if fs::remove_dir(&dir).is_err() {
            break;
        }
        debug!(dir = %dir.display(), "Pruned empty directory");
        current = dir.parent().map(Path::to_path_buf);
    }
}

/// Temp path in the same directory as `dest`, so a rename stays on one filesystem.
pub fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tag = uuid::Uuid::new_v4().simple().to_string();
    dest.with_file_name(format!(".{}.{}.tmp", name, &tag[..8]))
}

/// Move a fully written sibling temp file over `dest`.
///
/// If the first rename fails (some platforms refuse to replace an existing
/// file) the destination is removed and the rename retried once.
pub fn replace_file(temp: &Path, dest: &Path) -> io::Result<()> {
    if let Err(first) = fs::rename(temp, dest) {
        if dest.exists() {
            fs::remove_file(dest)?;
            if let Err(e) = fs::rename(temp, dest) {
                let _ = fs::remove_file(temp);
                return Err(e);
            }
            return Ok(());
        }
        let _ = fs::remove_file(temp);
        return Err(first);
    }
    Ok(())
}

/// Copy `source` to `dest` through a temp sibling and an atomic rename.
pub fn commit_copy(source: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = temp_sibling(dest);
    if let Err(e) = fs::copy(source, &temp) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    replace_file(&temp, dest)
}

/// Write `bytes` to `dest` through a temp sibling and an atomic rename.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = temp_sibling(dest);
    if let Err(e) = fs::write(&temp, bytes) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    replace_file(&temp, dest)
}
