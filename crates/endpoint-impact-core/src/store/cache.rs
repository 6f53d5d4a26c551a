//! Persistent per-entry-point dependency cache.
//!
//! One SQLite file per analyzed project, partitioned by backend so symbol
//! level and coarse results never mix. Every failure on the read side is a
//! cache miss; the write side replaces a backend's partition in one
//! transaction.
//!
//! Each payload is the JSON dependency record (`referenced_files`,
//! `referenced_symbols`, `traces`). `traces` maps a file to a list of
//! traces, one or more per reached symbol, rather than a single trace per
//! file; a reader wanting one chain per file takes the first entry.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::config::{AnalyzerConfig, BackendKind};
use crate::errors::ImpactResult;
use crate::models::EntryPointDependencies;
use crate::store::schema;

pub const CACHE_FILE_NAME: &str = "cache.db";
const FINGERPRINT_KEY: &str = "source_fingerprint";

/// Entry-point identifier to its dependency record.
pub type DependencyMap = IndexMap<String, EntryPointDependencies>;

#[derive(Clone, Debug)]
pub struct AnalysisCache {
    db_path: PathBuf,
    backend: BackendKind,
}

impl AnalysisCache {
    pub fn new(db_path: impl Into<PathBuf>, backend: BackendKind) -> Self {
        Self {
            db_path: db_path.into(),
            backend,
        }
    }

    /// Cache stored in the project's state directory.
    pub fn for_project(project_root: &Path, config: &AnalyzerConfig) -> Self {
        Self::new(config.state_dir(project_root).join(CACHE_FILE_NAME), config.backend)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn exists(&self) -> bool {
        self.db_path.is_file()
    }

    fn open_read_only(&self) -> ImpactResult<Option<Connection>> {
        if !self.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(&self.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        if schema::schema_version(&conn) != schema::SCHEMA_VERSION {
            debug!(path = %self.db_path.display(), "cache schema mismatch");
            return Ok(None);
        }
        Ok(Some(conn))
    }

    fn open_read_write(&self) -> ImpactResult<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.db_path)?;
        schema::init_schema(&conn)?;
        Ok(conn)
    }

    /// Stored records for this backend; undecodable rows are skipped.
    pub fn try_load(&self) -> ImpactResult<DependencyMap> {
        let Some(conn) = self.open_read_only()? else {
            return Ok(DependencyMap::new());
        };
        let mut stmt = conn.prepare(
            "SELECT endpoint_id, payload FROM dependencies WHERE backend = ?1 ORDER BY rowid;",
        )?;
        let rows = stmt.query_map(params![self.backend.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut loaded = DependencyMap::new();
        for row in rows {
            let (id, payload) = row?;
            match serde_json::from_str::<EntryPointDependencies>(&payload) {
                Ok(deps) => {
                    loaded.insert(id, deps);
                }
                Err(err) => debug!(id = %id, error = %err, "skipping undecodable cache row"),
            }
        }
        Ok(loaded)
    }

    /// Like [`try_load`](Self::try_load), with every failure treated as a miss.
    pub fn load(&self) -> DependencyMap {
        match self.try_load() {
            Ok(loaded) => {
                debug!(entries = loaded.len(), backend = self.backend.as_str(), "cache loaded");
                loaded
            }
            Err(err) => {
                warn!(path = %self.db_path.display(), error = %err, "unreadable cache, ignoring");
                DependencyMap::new()
            }
        }
    }

    /// Source fingerprint recorded by the last save, if any.
    pub fn fingerprint(&self) -> Option<String> {
        let conn = self.open_read_only().ok().flatten()?;
        schema::get_meta(&conn, FINGERPRINT_KEY).ok().flatten()
    }

    /// Replace this backend's records with `entries`. A file that is not a
    /// usable cache database is discarded and recreated.
    pub fn save(&self, entries: &DependencyMap, fingerprint: Option<&str>) -> ImpactResult<usize> {
        let mut conn = match self.open_read_write() {
            Ok(conn) => conn,
            Err(err) => {
                warn!(path = %self.db_path.display(), error = %err, "recreating cache database");
                self.remove_files()?;
                self.open_read_write()?
            }
        };
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM dependencies WHERE backend = ?1;",
            params![self.backend.as_str()],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO dependencies(backend, endpoint_id, payload) VALUES(?1, ?2, ?3);",
            )?;
            for (id, deps) in entries {
                let payload = serde_json::to_string(deps)?;
                insert.execute(params![self.backend.as_str(), id, payload])?;
            }
        }
        if let Some(fingerprint) = fingerprint {
            schema::set_meta(&tx, FINGERPRINT_KEY, fingerprint)?;
        }
        tx.commit()?;
        info!(entries = entries.len(), path = %self.db_path.display(), "cache saved");
        Ok(entries.len())
    }

    /// Discard the persisted store for every backend.
    pub fn clear(&self) -> ImpactResult<()> {
        self.remove_files()?;
        info!(path = %self.db_path.display(), "cache cleared");
        Ok(())
    }

    fn remove_files(&self) -> ImpactResult<()> {
        let mut candidates = vec![self.db_path.clone()];
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut name = self.db_path.clone().into_os_string();
            name.push(suffix);
            candidates.push(PathBuf::from(name));
        }
        for path in candidates {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SymbolReference, TraceFrame};
    use tempfile::TempDir;

    fn sample() -> DependencyMap {
        let mut deps = EntryPointDependencies::new();
        deps.add_symbol_reference(SymbolReference::new("services/users.py", "create", 3, 6));
        deps.add_trace(
            "services/users.py",
            vec![TraceFrame::new("api.py", 4, "read", Some("create()".to_string()))],
            4,
        );
        let mut map = DependencyMap::new();
        map.insert("GET /users".to_string(), deps);
        map.insert("POST /users".to_string(), EntryPointDependencies::new());
        map
    }

    #[test]
    fn test_round_trip() {
        let tmp = TempDir::new().unwrap();
        let cache = AnalysisCache::new(tmp.path().join("state/cache.db"), BackendKind::Symbol);
        assert!(cache.load().is_empty());
        cache.save(&sample(), Some("abc")).unwrap();
        let loaded = cache.load();
        assert_eq!(loaded, sample());
        assert_eq!(cache.fingerprint().as_deref(), Some("abc"));
    }

    #[test]
    fn test_payload_keeps_trace_lists_per_file() {
        let tmp = TempDir::new().unwrap();
        let cache = AnalysisCache::new(tmp.path().join("cache.db"), BackendKind::Symbol);
        cache.save(&sample(), None).unwrap();
        let conn = Connection::open(cache.path()).unwrap();
        let payload: String = conn
            .query_row(
                "SELECT payload FROM dependencies WHERE endpoint_id = 'GET /users';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        let traces = value["traces"]["services/users.py"].as_array().unwrap();
        assert_eq!(traces.len(), 1);
        let first = traces[0].as_array().unwrap();
        assert_eq!(first[0]["symbol"], "read");
        assert_eq!(value["referenced_files"]["services/users.py"], serde_json::json!([3, 4, 5, 6]));
    }

    #[test]
    fn test_backends_are_partitioned() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.db");
        AnalysisCache::new(&path, BackendKind::Symbol).save(&sample(), None).unwrap();
        assert!(AnalysisCache::new(&path, BackendKind::Coverage).load().is_empty());
        assert_eq!(AnalysisCache::new(&path, BackendKind::Symbol).load().len(), 2);
    }

    #[test]
    fn test_save_replaces_previous_partition() {
        let tmp = TempDir::new().unwrap();
        let cache = AnalysisCache::new(tmp.path().join("cache.db"), BackendKind::Symbol);
        cache.save(&sample(), None).unwrap();
        let mut smaller = sample();
        smaller.shift_remove("POST /users");
        cache.save(&smaller, None).unwrap();
        assert_eq!(cache.load().len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_a_miss_and_gets_replaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.db");
        std::fs::write(&path, b"definitely not sqlite").unwrap();
        let cache = AnalysisCache::new(&path, BackendKind::Symbol);
        assert!(cache.load().is_empty());
        cache.save(&sample(), None).unwrap();
        assert_eq!(cache.load().len(), 2);
    }

    #[test]
    fn test_undecodable_row_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let cache = AnalysisCache::new(tmp.path().join("cache.db"), BackendKind::Symbol);
        cache.save(&sample(), None).unwrap();
        let conn = Connection::open(cache.path()).unwrap();
        conn.execute(
            "UPDATE dependencies SET payload = '{not json' WHERE endpoint_id = 'POST /users';",
            [],
        )
        .unwrap();
        drop(conn);
        let loaded = cache.load();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("GET /users"));
    }

    #[test]
    fn test_clear_from_project_path() {
        let tmp = TempDir::new().unwrap();
        let config = AnalyzerConfig::default();
        let cache = AnalysisCache::for_project(tmp.path(), &config);
        cache.save(&sample(), None).unwrap();
        assert!(cache.exists());
        AnalysisCache::for_project(tmp.path(), &config).clear().unwrap();
        assert!(!cache.exists());
        assert!(cache.load().is_empty());
        cache.clear().unwrap();
    }
}
