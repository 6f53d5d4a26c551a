//! SQLite schema DDL and migration framework for the analysis cache.

use rusqlite::{params, Connection};

use crate::errors::ImpactResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 2;

/// Core DDL, safe to replay on an already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cache_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS dependencies (
        backend TEXT NOT NULL,
        endpoint_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY(backend, endpoint_id)
    );",
];

/// Apply the DDL and run pending migrations.
pub fn init_schema(conn: &Connection) -> ImpactResult<()> {
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    migrate_schema(conn)
}

/// Run all pending migrations from the stored version up to
/// [`SCHEMA_VERSION`]. Each step runs inside a SAVEPOINT so a failure rolls
/// back only that step.
pub fn migrate_schema(conn: &Connection) -> ImpactResult<()> {
    let mut current_version = schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT impact_migrate_step;")?;

        let step_result = (|| -> ImpactResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                2 => migrate_to_v2(conn)?,
                _ => {}
            }
            set_meta(conn, "schema_version", &next_version.to_string())?;
            conn.execute_batch("RELEASE SAVEPOINT impact_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => current_version = next_version,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT impact_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT impact_migrate_step;");
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Stored schema version; 0 when absent or unparseable.
pub fn schema_version(conn: &Connection) -> i32 {
    get_meta(conn, "schema_version")
        .ok()
        .flatten()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0)
}

pub fn get_meta(conn: &Connection, key: &str) -> ImpactResult<Option<String>> {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM cache_meta WHERE key = ?1 LIMIT 1;",
        params![key],
        |row| row.get(0),
    );
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> ImpactResult<()> {
    conn.execute(
        "INSERT INTO cache_meta(key, value) VALUES(?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![key, value],
    )?;
    Ok(())
}

/// v0 -> v1: baseline, created by [`SCHEMA_STATEMENTS`].
fn migrate_to_v1(_conn: &Connection) -> ImpactResult<()> {
    Ok(())
}

/// v1 -> v2: lookup index for per-backend loads.
fn migrate_to_v2(conn: &Connection) -> ImpactResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_dependencies_backend ON dependencies(backend);",
    )?;
    Ok(())
}
