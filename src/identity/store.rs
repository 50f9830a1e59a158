use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags};

/// Row from the identity table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityRecord {
    pub id: String,
    pub name: String,
    pub active: bool,
}

/// Read path into wherever identities are enrolled.
///
/// Enrollment itself happens elsewhere; the gateway only consumes the stored
/// 128-value vectors.
pub trait IdentityStore: Send + Sync {
    fn all_identities(&self) -> Result<Vec<IdentityRecord>>;
    fn embeddings(&self, identity_id: &str) -> Result<Vec<Vec<f32>>>;
}

// -------------------- SQLite --------------------

pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path.starts_with("file:") {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )
        } else {
            Connection::open(db_path)
        }
        .with_context(|| format!("open identity database {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS identities (
                  id TEXT PRIMARY KEY,
                  name TEXT NOT NULL,
                  active INTEGER NOT NULL DEFAULT 1,
                  created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                );

                CREATE TABLE IF NOT EXISTS face_embeddings (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
                  vector_json TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_embeddings_identity ON face_embeddings(identity_id);
                "#,
            )?;
            Ok(())
        })
    }

    /// Insert or update an identity row.
    pub fn upsert_identity(&self, id: &str, name: &str, active: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO identities (id, name, active) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, active = excluded.active",
                params![id, name, active as i64],
            )?;
            Ok(())
        })
    }

    pub fn add_embedding(&self, identity_id: &str, vector: &[f32]) -> Result<()> {
        let vector_json = serde_json::to_string(vector)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO face_embeddings (identity_id, vector_json) VALUES (?1, ?2)",
                params![identity_id, vector_json],
            )?;
            Ok(())
        })
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn all_identities(&self) -> Result<Vec<IdentityRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, active FROM identities ORDER BY created_at, id")?;
            let rows = stmt.query_map([], |row| {
                let active: i64 = row.get(2)?;
                Ok(IdentityRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    active: active != 0,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn embeddings(&self, identity_id: &str) -> Result<Vec<Vec<f32>>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, vector_json FROM face_embeddings WHERE identity_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query(params![identity_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let row_id: i64 = row.get(0)?;
                let vector_json: String = row.get(1)?;
                match serde_json::from_str::<Vec<f32>>(&vector_json) {
                    Ok(vector) => out.push(vector),
                    Err(e) => log::warn!(
                        "skipping unreadable embedding {} for identity {}: {}",
                        row_id,
                        identity_id,
                        e
                    ),
                }
            }
            Ok(out)
        })
    }
}

// -------------------- In-memory --------------------

/// Fixed identity set, for tests and offline runs.
#[derive(Default)]
pub struct MemoryIdentityStore {
    records: Vec<IdentityRecord>,
    embeddings: BTreeMap<String, Vec<Vec<f32>>>,
}

impl MemoryIdentityStore {
    pub fn with_identity(
        mut self,
        id: &str,
        name: &str,
        active: bool,
        embeddings: Vec<Vec<f32>>,
    ) -> Self {
        self.records.push(IdentityRecord {
            id: id.to_string(),
            name: name.to_string(),
            active,
        });
        self.embeddings.insert(id.to_string(), embeddings);
        self
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn all_identities(&self) -> Result<Vec<IdentityRecord>> {
        Ok(self.records.clone())
    }

    fn embeddings(&self, identity_id: &str) -> Result<Vec<Vec<f32>>> {
        self.embeddings
            .get(identity_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown identity {}", identity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentitySnapshot, EMBEDDING_DIM};

    #[test]
    fn sqlite_store_round_trips_identities_and_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.db");
        let store = SqliteIdentityStore::open(path.to_str().unwrap()).unwrap();

        store.upsert_identity("u1", "Alice", true).unwrap();
        store.upsert_identity("u2", "Bob", false).unwrap();
        store.add_embedding("u1", &vec![0.25; EMBEDDING_DIM]).unwrap();
        store.add_embedding("u1", &[0.5; 4]).unwrap();

        let records = store.all_identities().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.id == "u2" && !r.active));

        let vectors = store.embeddings("u1").unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), EMBEDDING_DIM);

        let snapshot = IdentitySnapshot::load(&store).unwrap();
        assert_eq!(snapshot.identity_count(), 1);
        assert_eq!(snapshot.sample_count(), 1);
    }

    #[test]
    fn sqlite_store_reopens_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteIdentityStore::open(path).unwrap();
            store.upsert_identity("u1", "Alice", true).unwrap();
        }
        let store = SqliteIdentityStore::open(path).unwrap();
        store.upsert_identity("u1", "Alicia", true).unwrap();
        let records = store.all_identities().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Alicia");
    }

    #[test]
    fn memory_store_rejects_unknown_identity() {
        let store = MemoryIdentityStore::default();
        assert!(store.embeddings("ghost").is_err());
    }
}
