//! Indexed store of entry points supplied by an external extractor.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use tracing::debug;

use crate::indexer::filesystem::same_source_file;
use crate::models::{EntryPoint, HttpMethod};

#[derive(Clone, Debug, Default)]
pub struct EntryPointRegistry {
    entries: IndexMap<String, EntryPoint>,
}

impl EntryPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = EntryPoint>) -> Self {
        let mut registry = Self::new();
        registry.register_many(entries);
        registry
    }

    /// Add `entry`; returns false when its identifier is already registered.
    /// The first registration of an identifier wins.
    pub fn register(&mut self, entry: EntryPoint) -> bool {
        let id = entry.id();
        if self.entries.contains_key(&id) {
            debug!(id = %id, "duplicate entry point ignored");
            return false;
        }
        self.entries.insert(id, entry);
        true
    }

    pub fn register_many(&mut self, entries: impl IntoIterator<Item = EntryPoint>) -> usize {
        let mut added = 0;
        for entry in entries {
            if self.register(entry) {
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &EntryPoint> {
        self.entries.values()
    }

    pub fn get(&self, id: &str) -> Option<&EntryPoint> {
        self.entries.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn by_path(&self, path: &str) -> Vec<&EntryPoint> {
        self.entries.values().filter(|e| e.path == path).collect()
    }

    /// Entries whose handler is declared in `file`, under any path spelling.
    pub fn by_file(&self, file: &str) -> Vec<&EntryPoint> {
        self.entries
            .values()
            .filter(|e| same_source_file(&e.handler.file, file))
            .collect()
    }

    pub fn by_module(&self, module: &str) -> Vec<&EntryPoint> {
        self.entries
            .values()
            .filter(|e| e.handler.module == module)
            .collect()
    }

    pub fn get_by_method(&self, method: HttpMethod) -> Vec<&EntryPoint> {
        self.entries
            .values()
            .filter(|e| e.methods.contains(&method))
            .collect()
    }

    pub fn get_by_tag(&self, tag: &str) -> Vec<&EntryPoint> {
        self.entries
            .values()
            .filter(|e| e.tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Entries in `file` whose handler range overlaps `[start, end]`. A
    /// handler with no declared end counts as its start line only.
    pub fn get_by_line_range(&self, file: &str, start: i64, end: i64) -> Vec<&EntryPoint> {
        self.by_file(file)
            .into_iter()
            .filter(|e| {
                let handler_end = e.handler.end_line.unwrap_or(e.handler.start_line);
                e.handler.start_line <= end && handler_end >= start
            })
            .collect()
    }

    /// Entries declaring `dependency` by name, short or dotted.
    pub fn find_using_dependency(&self, dependency: &str) -> Vec<&EntryPoint> {
        self.entries
            .values()
            .filter(|e| {
                e.dependencies.iter().any(|d| {
                    d == dependency || d.rsplit('.').next() == Some(dependency)
                })
            })
            .collect()
    }

    pub fn files(&self) -> BTreeSet<&str> {
        self.entries.values().map(|e| e.handler.file.as_str()).collect()
    }

    pub fn modules(&self) -> BTreeSet<&str> {
        self.entries.values().map(|e| e.handler.module.as_str()).collect()
    }

    pub fn paths(&self) -> BTreeSet<&str> {
        self.entries.values().map(|e| e.path.as_str()).collect()
    }
}
