//! Filesystem scanning and path identity helpers for indexing passes.

use std::path::{Path, PathBuf};

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::ImpactResult;

/// Project-local ignore file, read with `.gitignore` syntax.
pub const IGNORE_FILE_NAME: &str = ".endpoint-impact-ignore";

const IMPLICIT_IGNORED_DIRS: &[&str] = &[
    ".git",
    ".endpoint-impact",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    ".mypy_cache",
    "node_modules",
    "site-packages",
];

/// Collect every Python source file under `repo_root`.
///
/// Honours `.gitignore` and [`IGNORE_FILE_NAME`] even outside a git
/// checkout. `include_patterns` whitelist, `exclude_patterns` blacklist;
/// both use gitignore glob syntax relative to the root.
pub fn iter_python_files(
    repo_root: &Path,
    include_patterns: &[String],
    exclude_patterns: &[String],
) -> ImpactResult<Vec<PathBuf>> {
    let mut overrides = OverrideBuilder::new(repo_root);
    for pattern in include_patterns {
        let stripped = pattern.trim();
        if !stripped.is_empty() {
            overrides.add(stripped)?;
        }
    }
    for pattern in exclude_patterns {
        let stripped = pattern.trim().trim_start_matches('!');
        if !stripped.is_empty() {
            overrides.add(&format!("!{stripped}"))?;
        }
    }
    let overrides = overrides.build()?;

    let walker = WalkBuilder::new(repo_root)
        .hidden(true)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(false)
        .require_git(false)
        .add_custom_ignore_filename(IGNORE_FILE_NAME)
        .overrides(overrides)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !IMPLICIT_IGNORED_DIRS.contains(&name.as_ref())
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        if entry.path().extension().is_some_and(|ext| ext == "py") {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Path of `path` relative to `repo_root`, with forward slashes.
pub fn relative_path(repo_root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(repo_root).unwrap_or(path);
    normalize_path(&relative.to_string_lossy())
}

/// Normalize separators and collapse `.`/`..` segments without touching the disk.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Whether two spellings name the same source file.
///
/// Diff paths are repository-relative, handler paths are often absolute and
/// index paths are project-relative, so a path matches when it equals the
/// other or is a suffix of it on a component boundary.
pub fn same_source_file(a: &str, b: &str) -> bool {
    let (a, b) = (normalize_path(a), normalize_path(b));
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    let (long, short) = if a.len() >= b.len() { (&a, &b) } else { (&b, &a) };
    if short.starts_with('/') {
        return false;
    }
    long.ends_with(&format!("/{short}"))
}

pub fn compute_content_hash(path: &Path) -> ImpactResult<String> {
    let data = std::fs::read(path)?;
    Ok(content_digest(&data))
}

/// SHA-256 hex digest of in-memory content.
pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Digest over `(relative path, content hash)` pairs, order-independent.
pub fn project_fingerprint<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut pairs: Vec<(&str, &str)> = files.into_iter().collect();
    pairs.sort_unstable();
    let mut hasher = Sha256::new();
    for (path, hash) in pairs {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./app\\api/../main.py"), "app/main.py");
        assert_eq!(normalize_path("/srv//app/./x.py"), "/srv/app/x.py");
        assert_eq!(normalize_path("../x.py"), "../x.py");
    }

    #[test]
    fn test_same_source_file() {
        assert!(same_source_file("/srv/app/services/user.py", "services/user.py"));
        assert!(same_source_file("./services/user.py", "services/user.py"));
        assert!(!same_source_file("/srv/app/services/user.py", "er.py"));
        assert!(!same_source_file("/a/x.py", "/b/x.py"));
        assert!(!same_source_file("", "x.py"));
    }

    #[test]
    fn test_iter_python_files_filters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "app/main.py", "x = 1\n");
        write(root, "app/notes.txt", "hi\n");
        write(root, "app/tests/test_main.py", "x = 1\n");
        write(root, "app/__pycache__/main.py", "x = 1\n");
        write(root, "generated/out.py", "x = 1\n");
        write(root, ".gitignore", "generated/\n");

        let excludes = vec!["**/tests/**".to_string()];
        let files = iter_python_files(root, &[], &excludes).unwrap();
        let rels: Vec<String> = files.iter().map(|p| relative_path(root, p)).collect();
        assert_eq!(rels, vec!["app/main.py".to_string()]);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let a = project_fingerprint([("a.py", "1"), ("b.py", "2")]);
        let b = project_fingerprint([("b.py", "2"), ("a.py", "1")]);
        let c = project_fingerprint([("a.py", "1"), ("b.py", "3")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_compute_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", "x = 1\n");
        let hash = compute_content_hash(&dir.path().join("a.py")).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_digest(b"x = 1\n"));
    }
}
