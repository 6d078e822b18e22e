use anyhow::Context;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// SQLite-backed repository shared by every engine component.
/// Entity-specific queries live in sibling `*_repo.rs` files as further `impl Store` blocks.
#[derive(Clone)]
pub struct Store {
    pub conn: Arc<Mutex<Connection>>,
}

pub struct StoreInfo {
    pub schema_version: i64,
    pub experiments: i64,
    pub turn_results: i64,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open sqlite db")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(crate::storage::schema::DDL)?;
        migrate_v2(&conn)?;
        conn.pragma_update(None, "user_version", crate::storage::schema::SCHEMA_VERSION)?;
        Ok(())
    }

    /// Opens (or creates) a store at `path` and applies the schema.
    pub fn open_with_schema(path: &Path) -> anyhow::Result<Self> {
        let store = Self::open(path)?;
        store.init_schema()?;
        Ok(store)
    }

    pub fn memory_with_schema() -> anyhow::Result<Self> {
        let store = Self::memory()?;
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))
    }

    pub fn info(&self) -> anyhow::Result<StoreInfo> {
        let conn = self.lock()?;
        let schema_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        let experiments: i64 =
            conn.query_row("SELECT COUNT(*) FROM experiments", [], |r| r.get(0))?;
        let turn_results: i64 =
            conn.query_row("SELECT COUNT(*) FROM turn_results", [], |r| r.get(0))?;
        Ok(StoreInfo {
            schema_version,
            experiments,
            turn_results,
        })
    }
}

// v2: token accounting on stats rows
fn migrate_v2(conn: &Connection) -> anyhow::Result<()> {
    let cols = get_columns(conn, "expt_stats")?;
    add_column_if_missing(conn, &cols, "expt_stats", "input_tokens", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(conn, &cols, "expt_stats", "output_tokens", "INTEGER NOT NULL DEFAULT 0")?;
    Ok(())
}

fn get_columns(
    conn: &Connection,
    table: &str,
) -> anyhow::Result<std::collections::HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = std::collections::HashSet::new();
    for r in rows {
        out.insert(r?);
    }
    Ok(out)
}

fn add_column_if_missing(
    conn: &Connection,
    cols: &std::collections::HashSet<String>,
    table: &str,
    col: &str,
    ty: &str,
) -> anyhow::Result<()> {
    if !cols.contains(col) {
        let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, col, ty);
        conn.execute(&sql, [])?;
    }
    Ok(())
}

pub(crate) fn to_json<T: Serialize>(v: &T) -> rusqlite::Result<String> {
    serde_json::to_string(v).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

pub(crate) fn from_json<T: DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn opt_from_json<T: DeserializeOwned>(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<T>> {
    match s {
        Some(s) if !s.trim().is_empty() => from_json(idx, &s).map(Some),
        _ => Ok(None),
    }
}

/// Maps a stored enum string back to its type, failing the row on unknown values.
pub(crate) fn parse_col<T>(idx: usize, s: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown value {:?}", s).into(),
        )
    })
}

/// `?,?,?` placeholder list for IN clauses.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_reentrant_and_stamped() {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        store.init_schema().unwrap();
        let info = store.info().unwrap();
        assert_eq!(info.schema_version, crate::storage::schema::SCHEMA_VERSION);
        assert_eq!(info.experiments, 0);

        let conn = store.lock().unwrap();
        let cols = get_columns(&conn, "expt_stats").unwrap();
        assert!(cols.contains("input_tokens"));
        assert!(cols.contains("output_tokens"));
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(3), "?,?,?");
        assert_eq!(placeholders(1), "?");
    }
}
