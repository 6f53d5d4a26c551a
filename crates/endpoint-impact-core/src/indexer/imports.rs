//! Module naming and import resolution between dotted Python names and project files.

use std::collections::HashMap;

use crate::indexer::filesystem::normalize_path;

/// Dotted module name for a project-relative `.py` path, and whether it is a
/// package (`__init__.py`).
pub fn module_name_for_path(relative_path: &str) -> (String, bool) {
    let normalized = normalize_path(relative_path);
    let without_ext = normalized.strip_suffix(".py").unwrap_or(&normalized);
    let mut parts: Vec<&str> = without_ext.split('/').filter(|p| !p.is_empty()).collect();
    let is_package = parts.last() == Some(&"__init__");
    if is_package {
        parts.pop();
    }
    (parts.join("."), is_package)
}

/// Absolute module named by a relative import of `level` dots plus `suffix`,
/// seen from `module`.
pub fn resolve_relative_module(module: &str, is_package: bool, level: usize, suffix: &str) -> String {
    let mut parts: Vec<&str> = module.split('.').filter(|p| !p.is_empty()).collect();
    if !is_package {
        parts.pop();
    }
    for _ in 1..level {
        parts.pop();
    }
    let suffix = suffix.trim_matches('.');
    if !suffix.is_empty() {
        parts.push(suffix);
    }
    parts.join(".")
}

/// Files that may define `module`, in lookup order.
pub fn module_file_candidates(module: &str) -> [String; 2] {
    let base = module.replace('.', "/");
    [format!("{base}.py"), format!("{base}/__init__.py")]
}

/// Resolve a module name to a file present in `all_files`.
pub fn resolve_module_file(module: &str, all_files: &HashMap<String, String>) -> Option<String> {
    if module.is_empty() {
        return None;
    }
    module_file_candidates(module)
        .into_iter()
        .find(|c| all_files.contains_key(c))
}

/// `a.b.c` -> `["a.b.c", "a.b", "a"]`.
pub fn module_and_parents(module: &str) -> Vec<String> {
    let parts: Vec<&str> = module.split('.').filter(|p| !p.is_empty()).collect();
    (1..=parts.len())
        .rev()
        .map(|n| parts[..n].join("."))
        .collect()
}

/// Split `fqn` at every dot, longest head first: `a.b.c` yields
/// `("a.b", "c")` then `("a", "b.c")`.
pub fn prefix_splits(fqn: &str) -> Vec<(&str, &str)> {
    fqn.char_indices()
        .filter(|(_, c)| *c == '.')
        .map(|(i, _)| (&fqn[..i], &fqn[i + 1..]))
        .rev()
        .collect()
}
