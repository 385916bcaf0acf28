#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use widget_pulse_core::{
    format_rfc3339, now_utc, ProfileSlots, SessionError, LEGACY_GRADE_SLOT, LEGACY_NAME_SLOT,
    LEGACY_REGISTERED_SLOT, LEGACY_USER_ID_SLOT,
};

const PROFILE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_PROFILE_V1: &str = r"
CREATE TABLE IF NOT EXISTS profile_slots (
  slot_key TEXT PRIMARY KEY,
  slot_value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Durable slot storage backed by a single SQLite file, the reload-surviving
/// scope the identity store persists into.
pub struct SqliteProfileStore {
    conn: Connection,
}

impl SqliteProfileStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_PROFILE_V1)
            .context("failed to apply profile schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow::anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![PROFILE_MIGRATION_VERSION, now],
            )
            .context("failed to register profile schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT MAX(version) FROM schema_migrations",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .context("failed to read schema_migrations")
            .map(Option::flatten)
    }
}

impl ProfileSlots for SqliteProfileStore {
    fn read_slot(&self, key: &str) -> Result<Option<String>, SessionError> {
        self.conn
            .query_row(
                "SELECT slot_value FROM profile_slots WHERE slot_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| SessionError::Storage(format!("failed to read slot {key}: {err}")))
    }

    fn write_slot(&mut self, key: &str, value: &str) -> Result<(), SessionError> {
        let now = format_rfc3339(now_utc())
            .map_err(|err| SessionError::Storage(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO profile_slots(slot_key, slot_value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(slot_key) DO UPDATE SET
                   slot_value = excluded.slot_value,
                   updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .map_err(|err| SessionError::Storage(format!("failed to write slot {key}: {err}")))?;

        Ok(())
    }

    fn remove_slot(&mut self, key: &str) -> Result<(), SessionError> {
        self.conn
            .execute(
                "DELETE FROM profile_slots WHERE slot_key = ?1",
                params![key],
            )
            .map_err(|err| SessionError::Storage(format!("failed to remove slot {key}: {err}")))?;

        Ok(())
    }
}

/// Seeds the individual legacy field slots an older script revision would
/// have written. Test support for migration paths.
pub fn seed_legacy_profile_slots(
    conn: &Connection,
    name: &str,
    grade: &str,
    user_id: Option<&str>,
) -> Result<()> {
    let now = format_rfc3339(now_utc()).map_err(|err| anyhow::anyhow!(err.to_string()))?;

    let mut slots = vec![
        (LEGACY_NAME_SLOT, name.to_string()),
        (LEGACY_GRADE_SLOT, grade.to_string()),
        (LEGACY_REGISTERED_SLOT, "true".to_string()),
    ];
    if let Some(id) = user_id {
        slots.push((LEGACY_USER_ID_SLOT, id.to_string()));
    }

    for (key, value) in slots {
        conn.execute(
            "INSERT INTO profile_slots(slot_key, slot_value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(slot_key) DO UPDATE SET
               slot_value = excluded.slot_value,
               updated_at = excluded.updated_at",
            params![key, value, now],
        )
        .with_context(|| format!("failed to seed legacy slot {key}"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ulid::Ulid;
    use widget_pulse_core::{IdentityStore, CANONICAL_PROFILE_SLOT};

    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("widget-pulse-store-{}.sqlite3", Ulid::new()))
    }

    fn open_migrated(path: &Path) -> SqliteProfileStore {
        let store = must_ok(SqliteProfileStore::open(path));
        must_ok(store.migrate());
        store
    }

    #[test]
    fn migrate_registers_schema_version_once() {
        let store = open_migrated(Path::new(":memory:"));
        assert_eq!(must_ok(store.schema_version()), Some(1));

        // Re-running is harmless.
        must_ok(store.migrate());
        assert_eq!(must_ok(store.schema_version()), Some(1));
    }

    #[test]
    fn slots_write_read_overwrite_and_remove() {
        let mut store = open_migrated(Path::new(":memory:"));

        assert_eq!(must_ok(store.read_slot("missing")), None);

        must_ok(store.write_slot("profile_record", "{\"a\":1}"));
        assert_eq!(
            must_ok(store.read_slot("profile_record")),
            Some("{\"a\":1}".to_string())
        );

        must_ok(store.write_slot("profile_record", "{\"a\":2}"));
        assert_eq!(
            must_ok(store.read_slot("profile_record")),
            Some("{\"a\":2}".to_string())
        );

        must_ok(store.remove_slot("profile_record"));
        assert_eq!(must_ok(store.read_slot("profile_record")), None);
    }

    #[test]
    fn identity_survives_a_fresh_connection() {
        let path = temp_db_path();

        let mut store = IdentityStore::new(open_migrated(&path));
        let registered = must_ok(store.register("지민", "고2", None));
        drop(store);

        let mut reloaded = IdentityStore::new(open_migrated(&path));
        reloaded.initialize();
        let restored = must_some(reloaded.current()).clone();
        assert_eq!(restored, registered);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn legacy_seed_migrates_to_canonical_on_first_load() {
        let path = temp_db_path();

        {
            let backend = open_migrated(&path);
            must_ok(seed_legacy_profile_slots(&backend.conn, "지민", "고2", None));
        }

        let mut store = IdentityStore::new(open_migrated(&path));
        store.initialize();
        let user_id = must_some(store.current()).user_id.clone();
        assert!(!user_id.is_empty());

        let backend = store.into_inner();
        assert!(must_ok(backend.read_slot(CANONICAL_PROFILE_SLOT)).is_some());
        assert_eq!(must_ok(backend.read_slot(LEGACY_NAME_SLOT)), None);

        let _ = std::fs::remove_file(&path);
    }
}
