//! Shared relational-store abstraction.
//!
//! All persisted modules (VM state, lifecycle history, subnet allocations)
//! share one SQLite file opened through [`Store`]:
//!
//! - per-module migrations versioned in a `schema_migrations` table;
//! - atomic apply-or-rollback migration semantics: a backup of the file is
//!   taken at open time and restored if any migration fails;
//! - a bounded busy-retry policy: only the `BUSY`/`LOCKED` primary error
//!   class is retryable, with exponential back-off from a 25 ms base over
//!   at most 8 attempts;
//! - writes run in explicit `BEGIN IMMEDIATE` transactions under a
//!   process-local mutex, in addition to SQLite's own writer lock.

pub mod lifecycle;
pub mod subnet;
pub mod vm;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::id::now_rfc3339;

/// One schema migration for one module.
pub struct Migration {
    pub module: &'static str,
    pub version: i64,
    pub sql: &'static str,
}

/// Maximum attempts for a busy/locked statement.
const BUSY_MAX_ATTEMPTS: u32 = 8;
/// Base back-off delay; doubles per attempt.
const BUSY_BASE_DELAY: Duration = Duration::from_millis(25);

/// Shared handle to the on-disk store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the store at `path` and bring every module's schema
    /// up to date.
    ///
    /// A copy of the pre-migration file is taken first; if any migration
    /// fails the copy is restored and the error surfaced as
    /// [`Error::Migration`].
    pub fn open(path: &Path, migrations: &[Migration]) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let backup = backup_path(path);
        let had_existing = path.exists();
        if had_existing {
            std::fs::copy(path, &backup)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        match apply_migrations(&conn, migrations) {
            Ok(applied) => {
                if applied > 0 {
                    debug!(path = %path.display(), applied, "store migrations applied");
                }
                if had_existing {
                    let _ = std::fs::remove_file(&backup);
                }
                Ok(Self {
                    inner: Arc::new(StoreInner {
                        conn: Mutex::new(conn),
                        path: path.to_path_buf(),
                    }),
                })
            }
            Err(e) => {
                drop(conn);
                if had_existing {
                    if let Err(restore_err) = std::fs::copy(&backup, path) {
                        warn!(
                            path = %path.display(),
                            error = %restore_err,
                            "failed to restore pre-migration backup"
                        );
                    }
                    let _ = std::fs::remove_file(&backup);
                } else {
                    let _ = std::fs::remove_file(path);
                }
                Err(Error::Migration(e.to_string()))
            }
        }
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Run a read-oriented closure with busy retry.
    pub fn with_conn<T>(&self, mut f: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.inner.conn.lock().unwrap();
        retry_busy(|| f(&conn))
    }

    /// Run a write closure inside a `BEGIN IMMEDIATE` transaction with busy
    /// retry. The closure may run more than once; it must be idempotent up
    /// to the commit.
    pub fn with_tx<T>(&self, mut f: impl FnMut(&Transaction<'_>) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self.inner.conn.lock().unwrap();
        retry_busy(|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".bak");
    PathBuf::from(os)
}

/// Apply every pending migration; returns how many ran.
fn apply_migrations(conn: &Connection, migrations: &[Migration]) -> rusqlite::Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             module     TEXT    NOT NULL,
             version    INTEGER NOT NULL,
             applied_at TEXT    NOT NULL,
             PRIMARY KEY (module, version)
         );",
    )?;

    let mut applied = 0;
    for migration in migrations {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE module = ?1 AND version = ?2)",
            rusqlite::params![migration.module, migration.version],
            |row| row.get(0),
        )?;
        if exists {
            continue;
        }

        conn.execute_batch("BEGIN IMMEDIATE;")?;
        let result = conn.execute_batch(migration.sql).and_then(|_| {
            conn.execute(
                "INSERT INTO schema_migrations (module, version, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![migration.module, migration.version, now_rfc3339()],
            )
            .map(|_| ())
        });
        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT;")?;
                applied += 1;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK;");
                return Err(e);
            }
        }
    }
    Ok(applied)
}

/// Whether the error's primary class is BUSY or LOCKED.
fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::DatabaseBusy
                || failure.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn retry_busy<T>(mut f: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    let mut delay = BUSY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if is_busy(&e) && attempt < BUSY_MAX_ATTEMPTS => {
                debug!(attempt, ?delay, "store busy, backing off");
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(module: &'static str, version: i64, sql: &'static str) -> Migration {
        Migration {
            module,
            version,
            sql,
        }
    }

    #[test]
    fn open_creates_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = Store::open(
            &path,
            &[migration(
                "demo",
                1,
                "CREATE TABLE demo (id TEXT PRIMARY KEY);",
            )],
        )
        .unwrap();

        store
            .with_conn(|conn| {
                conn.execute("INSERT INTO demo (id) VALUES ('a')", [])
                    .map(|_| ())
            })
            .unwrap();
    }

    #[test]
    fn migrations_are_applied_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let migrations = [migration(
            "demo",
            1,
            "CREATE TABLE demo (id TEXT PRIMARY KEY);",
        )];

        let store = Store::open(&path, &migrations).unwrap();
        drop(store);
        // Re-open: CREATE TABLE would fail if the migration ran again.
        let store = Store::open(&path, &migrations).unwrap();
        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM schema_migrations WHERE module = 'demo'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn failed_migration_restores_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let v1 = [migration(
            "demo",
            1,
            "CREATE TABLE demo (id TEXT PRIMARY KEY);",
        )];
        {
            let store = Store::open(&path, &v1).unwrap();
            store
                .with_conn(|conn| {
                    conn.execute("INSERT INTO demo (id) VALUES ('keep-me')", [])
                        .map(|_| ())
                })
                .unwrap();
        }

        // Second migration is broken SQL.
        let v2 = [
            migration("demo", 1, "CREATE TABLE demo (id TEXT PRIMARY KEY);"),
            migration("demo", 2, "THIS IS NOT SQL;"),
        ];
        match Store::open(&path, &v2) {
            Err(Error::Migration(_)) => {}
            other => panic!("expected Migration error, got {:?}", other.map(|_| ())),
        }

        // The original file survived and still has the row.
        let store = Store::open(&path, &v1).unwrap();
        let id: String = store
            .with_conn(|conn| conn.query_row("SELECT id FROM demo", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(id, "keep-me");
        // No stray backup left behind.
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn with_tx_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = Store::open(
            &path,
            &[migration(
                "demo",
                1,
                "CREATE TABLE demo (id TEXT PRIMARY KEY, n INTEGER NOT NULL);",
            )],
        )
        .unwrap();

        store
            .with_tx(|tx| {
                tx.execute("INSERT INTO demo (id, n) VALUES ('x', 1)", [])?;
                tx.execute("UPDATE demo SET n = n + 1 WHERE id = 'x'", [])?;
                Ok(())
            })
            .unwrap();

        let n: i64 = store
            .with_conn(|conn| conn.query_row("SELECT n FROM demo WHERE id = 'x'", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = Store::open(
            &path,
            &[migration(
                "demo",
                1,
                "CREATE TABLE demo (id TEXT PRIMARY KEY);",
            )],
        )
        .unwrap();

        let result = store.with_tx(|tx| {
            tx.execute("INSERT INTO demo (id) VALUES ('y')", [])?;
            // Duplicate key forces an error after a successful statement.
            tx.execute("INSERT INTO demo (id) VALUES ('y')", [])?;
            Ok(())
        });
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM demo", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn busy_detection_matches_primary_class_only() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let locked = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            None,
        );
        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(is_busy(&busy));
        assert!(is_busy(&locked));
        assert!(!is_busy(&constraint));
    }
}
