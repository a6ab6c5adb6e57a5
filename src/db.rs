//! Local SQLite database for the offline client.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the shared connection state used by the sync queue.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{SyncError, SyncResult};

/// Shared database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "pos-sync.db";

/// Initialize the database at `{data_dir}/pos-sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. Only a corrupt file is moved aside (to
/// `pos-sync.db.corrupt-<timestamp>`) and replaced by a fresh database; any
/// other failure, such as the file being locked, is returned so queued
/// mutations are never lost.
pub fn init(data_dir: &Path) -> SyncResult<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_migrate(&db_path) {
        Ok(c) => c,
        Err(first_err) if is_corruption(&first_err) => {
            let moved_to = quarantine(&db_path)?;
            warn!(
                "Database is corrupt ({first_err}); moved to {} and starting fresh",
                moved_to.display()
            );
            open_and_migrate(&db_path)?
        }
        Err(e) => {
            error!("Database open failed: {e}");
            return Err(e);
        }
    };

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

fn open_and_migrate(path: &Path) -> SyncResult<Connection> {
    let conn = open_and_configure(path)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn is_corruption(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::Database(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Rename a corrupt database (and its WAL/SHM side files) out of the way.
fn quarantine(db_path: &Path) -> SyncResult<PathBuf> {
    let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%d%H%M%S"));
    let target = PathBuf::from(format!("{}.{suffix}", db_path.display()));
    fs::rename(db_path, &target)?;
    for side in ["wal", "shm"] {
        let side_path = PathBuf::from(format!("{}-{side}", db_path.display()));
        if side_path.exists() {
            fs::rename(&side_path, format!("{}-{side}", target.display()))?;
        }
    }
    Ok(target)
}

/// Fully migrated in-memory database, for tests and ephemeral sessions.
pub fn open_in_memory() -> SyncResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> SyncResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA busy_timeout = 5000;
         PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings and the mutation queue.
fn migrate_v1(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- sync_queue: FIFO by seq; rows leave only when synced or discarded
        CREATE TABLE IF NOT EXISTS sync_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
            entity_type TEXT NOT NULL,
            target_id TEXT,
            local_id TEXT,
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            retry_delay_ms INTEGER NOT NULL DEFAULT 5000,
            next_retry_at INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            CHECK (local_id IS NULL OR operation = 'create')
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_local_id ON sync_queue(local_id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        e
    })?;

    info!("Applied migration v1 (local_settings, sync_queue)");
    Ok(())
}

/// Migration v2: local-to-server identifier mappings, persisted so that
/// items deferred past the pass that synced their create still resolve.
fn migrate_v2(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS id_mappings (
            local_id TEXT PRIMARY KEY,
            server_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            resolved_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        e
    })?;

    info!("Applied migration v2 (id_mappings)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> SyncResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let db = open_in_memory().expect("open");
        let conn = db.conn.lock().unwrap();
        let tables = table_names(&conn);
        for expected in ["local_settings", "sync_queue", "id_mappings", "schema_version"] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = open_in_memory().expect("open");
        let conn = db.conn.lock().unwrap();
        run_migrations(&conn).expect("second run is a no-op");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_queue_rejects_local_id_on_update() {
        let db = open_in_memory().expect("open");
        let conn = db.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO sync_queue (id, operation, entity_type, local_id, created_at)
             VALUES ('q1', 'update', 'product', 'local_x', 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_settings_upsert() {
        let db = open_in_memory().expect("open");
        let conn = db.conn.lock().unwrap();
        assert_eq!(get_setting(&conn, "sync", "last_sync"), None);
        set_setting(&conn, "sync", "last_sync", "a").unwrap();
        set_setting(&conn, "sync", "last_sync", "b").unwrap();
        assert_eq!(get_setting(&conn, "sync", "last_sync"), Some("b".into()));
    }

    #[test]
    fn test_init_on_disk_creates_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = init(&dir.path().join("nested")).expect("init");
        assert!(db.db_path.exists());
        let mode: String = db
            .conn
            .lock()
            .unwrap()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    fn queued_rows(db: &DbState) -> i64 {
        db.conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_locked_database_is_not_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = init(dir.path()).expect("init");
            db.conn
                .lock()
                .unwrap()
                .execute(
                    "INSERT INTO sync_queue (id, operation, entity_type, target_id, created_at)
                     VALUES ('q1', 'delete', 'product', 'p1', 0)",
                    [],
                )
                .unwrap();
        }

        let locker = Connection::open(dir.path().join(DB_FILE_NAME)).unwrap();
        locker
            .execute_batch(
                "PRAGMA locking_mode = EXCLUSIVE;
                 BEGIN EXCLUSIVE;
                 UPDATE sync_queue SET status = status;",
            )
            .unwrap();
        assert!(init(dir.path()).is_err(), "locked database must not open");
        drop(locker);

        let db = init(dir.path()).expect("reopen after lock released");
        assert_eq!(queued_rows(&db), 1);
    }

    #[test]
    fn test_corrupt_database_is_moved_aside() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(DB_FILE_NAME), vec![b'x'; 4096]).unwrap();

        let db = init(dir.path()).expect("fresh database");
        assert_eq!(queued_rows(&db), 0);

        let kept: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("pos-sync.db.corrupt-"))
            .collect();
        assert_eq!(kept.len(), 1, "corrupt file kept for inspection");
    }
}
