//! Transactional entity store shared by every component.
//!
//! One SQLite database in WAL mode is the process-wide environment. Writes go
//! through a single connection (`BEGIN IMMEDIATE`); read-only transactions run
//! on pooled read-only connections and see a consistent snapshot without
//! blocking each other or the writer.

pub mod entity;

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::{debug, info};

pub use entity::{Entity, EntityId, PropertyValue, difference};

use crate::error::StoreError;

/// File name of the database inside the working directory.
pub const DB_FILE: &str = "polaroid.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_IDLE_READERS: usize = 4;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS properties (
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    tag INTEGER NOT NULL,
    value NOT NULL,
    PRIMARY KEY (entity_id, name)
);

CREATE INDEX IF NOT EXISTS idx_properties_lookup ON properties(name, tag, value);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    tag INTEGER NOT NULL,
    value NOT NULL
);
";

/// Handle to the opened store. Cheap to clone; all clones share one database.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

struct EnvironmentInner {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

impl Environment {
    /// Open (or create) the environment inside `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Self::open_file(&dir.join(DB_FILE))
    }

    /// Open (or create) the environment at an explicit database path.
    pub fn open_file(path: &Path) -> Result<Self, StoreError> {
        let writer = Connection::open(path)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        writer.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        writer.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            inner: Arc::new(EnvironmentInner {
                path: path.to_path_buf(),
                writer: Mutex::new(writer),
                readers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Run `f` inside a read-only transaction.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&ReadTxn<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.checkout_reader()?;
        let result = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(StoreError::from)
            .and_then(|tx| f(&ReadTxn { tx }));
        self.checkin_reader(conn);
        result
    }

    /// Run `f` inside a write transaction, committing only if it returns `Ok`.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&WriteTxn<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.inner.writer.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let txn = WriteTxn(ReadTxn { tx });
        let value = f(&txn)?;
        let WriteTxn(ReadTxn { tx }) = txn;
        tx.commit()?;
        Ok(value)
    }

    fn checkout_reader(&self) -> Result<Connection, StoreError> {
        let pooled = self
            .inner
            .readers
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => {
                debug!("opening read-only store connection");
                let conn = Connection::open_with_flags(
                    &self.inner.path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                Ok(conn)
            }
        }
    }

    fn checkin_reader(&self, conn: Connection) {
        if let Ok(mut readers) = self.inner.readers.lock() {
            if readers.len() < MAX_IDLE_READERS {
                readers.push(conn);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn execute_batch_for_test(&self, sql: &str) -> Result<(), StoreError> {
        let conn = self.inner.writer.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

/// A read-only transaction; every query observes the same snapshot.
pub struct ReadTxn<'c> {
    tx: Transaction<'c>,
}

impl ReadTxn<'_> {
    /// Load the full record for `id`, if it exists.
    pub fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, StoreError> {
        let found = self.collect_entities(
            "SELECT e.id, e.kind, p.name, p.tag, p.value
             FROM entities e LEFT JOIN properties p ON p.entity_id = e.id
             WHERE e.id = ?1
             ORDER BY e.id",
            params![id.0],
        )?;
        Ok(found.into_iter().next())
    }

    pub fn get_property(&self, id: EntityId, name: &str) -> Result<Option<PropertyValue>, StoreError> {
        let raw: Option<(i64, Value)> = self
            .tx
            .prepare_cached("SELECT tag, value FROM properties WHERE entity_id = ?1 AND name = ?2")?
            .query_row(params![id.0, name], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        raw.map(|(tag, value)| PropertyValue::from_parts(tag, ValueRef::from(&value)))
            .transpose()
    }

    /// All `kind` records whose `name` property equals `value` (type included).
    pub fn find(
        &self,
        kind: &str,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<Vec<Entity>, StoreError> {
        let value = value.into();
        self.collect_entities(
            "SELECT e.id, e.kind, p.name, p.tag, p.value
             FROM entities e LEFT JOIN properties p ON p.entity_id = e.id
             WHERE e.kind = ?1 AND e.id IN (
                 SELECT entity_id FROM properties WHERE name = ?2 AND tag = ?3 AND value = ?4
             )
             ORDER BY e.id",
            params![kind, name, value.tag(), value],
        )
    }

    /// All `kind` records whose text property `name` starts with `prefix`.
    pub fn find_starting_with(
        &self,
        kind: &str,
        name: &str,
        prefix: &str,
    ) -> Result<Vec<Entity>, StoreError> {
        let text = PropertyValue::Text(String::new());
        self.collect_entities(
            "SELECT e.id, e.kind, p.name, p.tag, p.value
             FROM entities e LEFT JOIN properties p ON p.entity_id = e.id
             WHERE e.kind = ?1 AND e.id IN (
                 SELECT entity_id FROM properties
                 WHERE name = ?2 AND tag = ?3 AND substr(value, 1, length(?4)) = ?4
             )
             ORDER BY e.id",
            params![kind, name, text.tag(), prefix],
        )
    }

    pub fn config_get(&self, key: &str) -> Result<Option<PropertyValue>, StoreError> {
        let raw: Option<(i64, Value)> = self
            .tx
            .prepare_cached("SELECT tag, value FROM config WHERE key = ?1")?
            .query_row(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        raw.map(|(tag, value)| PropertyValue::from_parts(tag, ValueRef::from(&value)))
            .transpose()
    }

    // Rows arrive ordered by entity id, one per property (or one with NULLs
    // for a record without properties).
    fn collect_entities(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Entity>, StoreError> {
        let mut stmt = self.tx.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out: Vec<Entity> = Vec::new();
        while let Some(row) = rows.next()? {
            let id = EntityId(row.get(0)?);
            if out.last().map(|e| e.id) != Some(id) {
                out.push(Entity {
                    id,
                    kind: row.get(1)?,
                    properties: Default::default(),
                });
            }
            let Some(name) = row.get::<_, Option<String>>(2)? else {
                continue;
            };
            let value = PropertyValue::from_parts(row.get(3)?, row.get_ref(4)?)?;
            if let Some(entity) = out.last_mut() {
                entity.properties.insert(name, value);
            }
        }
        Ok(out)
    }
}

/// A write transaction. Dereferences to [`ReadTxn`] for queries.
pub struct WriteTxn<'c>(ReadTxn<'c>);

impl<'c> Deref for WriteTxn<'c> {
    type Target = ReadTxn<'c>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl WriteTxn<'_> {
    pub fn new_entity(&self, kind: &str) -> Result<EntityId, StoreError> {
        self.0
            .tx
            .prepare_cached("INSERT INTO entities (kind) VALUES (?1)")?
            .execute(params![kind])?;
        Ok(EntityId(self.0.tx.last_insert_rowid()))
    }

    pub fn set_property(
        &self,
        id: EntityId,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), StoreError> {
        let value = value.into();
        self.0
            .tx
            .prepare_cached(
                "INSERT INTO properties (entity_id, name, tag, value) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(entity_id, name) DO UPDATE SET tag = excluded.tag, value = excluded.value",
            )?
            .execute(params![id.0, name, value.tag(), value])?;
        Ok(())
    }

    pub fn config_put(&self, key: &str, value: impl Into<PropertyValue>) -> Result<(), StoreError> {
        let value = value.into();
        self.0
            .tx
            .prepare_cached(
                "INSERT INTO config (key, tag, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET tag = excluded.tag, value = excluded.value",
            )?
            .execute(params![key, value.tag(), value])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use tempfile::tempdir;

    fn photo(txn: &WriteTxn<'_>, path: &str, hidden: bool) -> EntityId {
        let id = txn.new_entity("Photo").unwrap();
        txn.set_property(id, "path", path).unwrap();
        txn.set_property(id, "hidden", hidden).unwrap();
        id
    }

    #[test]
    fn create_and_read_back_properties() {
        let dir = tempdir().unwrap();
        let env = Environment::open(dir.path()).unwrap();
        let id = env.write(|txn| Ok(photo(txn, "/p/a.jpg", false))).unwrap();

        let entity = env.read(|txn| txn.get_entity(id)).unwrap().unwrap();
        assert_eq!(entity.kind, "Photo");
        assert_eq!(entity.property("path").and_then(PropertyValue::as_text), Some("/p/a.jpg"));
        assert_eq!(entity.property("hidden").and_then(PropertyValue::as_bool), Some(false));

        env.write(|txn| txn.set_property(id, "hidden", true)).unwrap();
        let hidden = env.read(|txn| txn.get_property(id, "hidden")).unwrap();
        assert_eq!(hidden, Some(PropertyValue::Bool(true)));
        assert_eq!(env.read(|txn| txn.get_property(id, "missing")).unwrap(), None);
        assert!(env.read(|txn| txn.get_entity(EntityId(999))).unwrap().is_none());
    }

    #[test]
    fn prefix_and_equality_scans() {
        let dir = tempdir().unwrap();
        let env = Environment::open(dir.path()).unwrap();
        env.write(|txn| {
            photo(txn, "/photos/a.jpg", false);
            photo(txn, "/photos/sub/b.jpg", true);
            photo(txn, "/other/c.jpg", false);
            Ok(())
        })
        .unwrap();

        let under = env.read(|txn| txn.find_starting_with("Photo", "path", "/photos/")).unwrap();
        assert_eq!(under.len(), 2);
        let hidden = env.read(|txn| txn.find("Photo", "hidden", true)).unwrap();
        assert_eq!(hidden.len(), 1);

        let visible = difference(under, &hidden);
        assert_eq!(visible.len(), 1);
        assert_eq!(
            visible[0].property("path").and_then(PropertyValue::as_text),
            Some("/photos/a.jpg")
        );
    }

    #[test]
    fn equality_scan_respects_value_type() {
        let dir = tempdir().unwrap();
        let env = Environment::open(dir.path()).unwrap();
        env.write(|txn| {
            let id = txn.new_entity("Photo")?;
            txn.set_property(id, "hidden", "true")?;
            let id = txn.new_entity("Photo")?;
            txn.set_property(id, "hidden", 1_i64)
        })
        .unwrap();
        assert!(env.read(|txn| txn.find("Photo", "hidden", true)).unwrap().is_empty());
        assert_eq!(env.read(|txn| txn.find("Photo", "hidden", "true")).unwrap().len(), 1);
    }

    #[test]
    fn failed_write_rolls_back() {
        let dir = tempdir().unwrap();
        let env = Environment::open(dir.path()).unwrap();
        let res: Result<(), StoreError> = env.write(|txn| {
            photo(txn, "/p/a.jpg", false);
            Err(StoreError::Corrupt("abort".into()))
        });
        assert!(res.is_err());
        assert!(env.read(|txn| txn.find("Photo", "path", "/p/a.jpg")).unwrap().is_empty());
    }

    #[test]
    fn config_values_round_trip_with_type() {
        let dir = tempdir().unwrap();
        let env = Environment::open(dir.path()).unwrap();
        assert_eq!(env.read(|txn| txn.config_get("Duration")).unwrap(), None);
        env.write(|txn| txn.config_put("Duration", 30_i64)).unwrap();
        env.write(|txn| txn.config_put("Duration", 45_i64)).unwrap();
        assert_eq!(
            env.read(|txn| txn.config_get("Duration")).unwrap(),
            Some(PropertyValue::Int(45))
        );
    }

    #[test]
    fn readers_do_not_block_each_other() {
        let dir = tempdir().unwrap();
        let env = Environment::open(dir.path()).unwrap();
        env.write(|txn| Ok(photo(txn, "/p/a.jpg", false))).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let env = env.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    env.read(|txn| {
                        let found = txn.find_starting_with("Photo", "path", "/p")?;
                        // Both transactions are open at this point.
                        barrier.wait();
                        Ok(found.len())
                    })
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), 1);
        }
    }

    #[test]
    fn read_snapshot_ignores_concurrent_commit() {
        let dir = tempdir().unwrap();
        let env = Environment::open(dir.path()).unwrap();
        env.write(|txn| Ok(photo(txn, "/p/a.jpg", false))).unwrap();

        let before_and_after = env
            .read(|txn| {
                let before = txn.find_starting_with("Photo", "path", "/p")?.len();
                env.write(|w| Ok(photo(w, "/p/b.jpg", false)))?;
                let after = txn.find_starting_with("Photo", "path", "/p")?.len();
                Ok((before, after))
            })
            .unwrap();
        assert_eq!(before_and_after, (1, 1));
        let total = env.read(|txn| txn.find_starting_with("Photo", "path", "/p")).unwrap();
        assert_eq!(total.len(), 2);
    }
}
