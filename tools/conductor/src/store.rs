use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::composition::Composition;
use crate::errors::ConductorError;
use crate::logging::append_run_log;
use crate::performance::Performance;

type StoreResult<T> = Result<T, ConductorError>;

/// Round-trip persistence for one kind of record.
pub trait Repository<T> {
    fn load_all(&self) -> StoreResult<Vec<T>>;
    /// Insert or replace by id.
    fn save(&self, item: &T) -> StoreResult<()>;
    /// Returns whether a row was removed.
    fn delete(&self, id: &str) -> StoreResult<bool>;
}

#[derive(Debug)]
enum WriteCmd {
    SaveComposition {
        composition: Box<Composition>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    DeleteComposition {
        id: String,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    SavePerformance {
        performance: Box<Performance>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    DeletePerformance {
        id: String,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
}

pub struct ConductorStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_conn: Mutex<Connection>,
    writer_join: Option<thread::JoinHandle<()>>,
}

impl Drop for ConductorStore {
    fn drop(&mut self) {
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl ConductorStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConductorError::Database(e.to_string()))?;
        }
        if path.exists() {
            let meta =
                std::fs::metadata(path).map_err(|e| ConductorError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(ConductorError::Database(format!(
                    "store database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;
        run_migrations(&mut write_conn)?;

        let (write_tx, mut write_rx) = mpsc::channel(64);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::SaveComposition { composition, reply } => {
                        let _ = reply.send(save_composition(&write_conn, &composition));
                    }
                    WriteCmd::DeleteComposition { id, reply } => {
                        let _ = reply.send(delete_composition(&mut write_conn, &id));
                    }
                    WriteCmd::SavePerformance { performance, reply } => {
                        let _ = reply.send(save_performance(&write_conn, &performance));
                    }
                    WriteCmd::DeletePerformance { id, reply } => {
                        let _ = reply.send(
                            write_conn
                                .execute("DELETE FROM performances WHERE id = ?1", [&id])
                                .map(|n| n > 0)
                                .map_err(db_err),
                        );
                    }
                }
            }
        });

        let read_conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(db_err)?;
        read_conn
            .busy_timeout(std::time::Duration::from_secs(3))
            .map_err(db_err)?;

        append_run_log(
            "info",
            "store.opened",
            json!({ "path": path.display().to_string() }),
        );
        Ok(Self {
            write_tx: Some(write_tx),
            read_conn: Mutex::new(read_conn),
            writer_join: Some(writer_join),
        })
    }

    pub fn load_composition(&self, id: &str) -> StoreResult<Option<Composition>> {
        self.with_read(|conn| {
            conn.query_row(
                "SELECT document FROM compositions WHERE id = ?1",
                [id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(|document| decode(&document))
            .transpose()
        })
    }

    /// Performances of one composition, newest first.
    pub fn performances_for(&self, composition_id: &str) -> StoreResult<Vec<Performance>> {
        self.query_documents(
            "SELECT document FROM performances WHERE composition_id = ?1
             ORDER BY start_time DESC, id DESC",
            &[&composition_id],
        )
    }

    fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> WriteCmd,
    ) -> StoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.write_tx
            .as_ref()
            .ok_or_else(|| ConductorError::Database("store is closed".to_string()))?
            .blocking_send(build(reply_tx))
            .map_err(|e| ConductorError::Database(e.to_string()))?;
        reply_rx
            .blocking_recv()
            .map_err(|e| ConductorError::Database(e.to_string()))?
    }

    fn with_read<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self
            .read_conn
            .lock()
            .map_err(|_| ConductorError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }

    fn query_documents<T: DeserializeOwned>(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StoreResult<Vec<T>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(sql).map_err(db_err)?;
            let documents = stmt
                .query_map(args, |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            documents.iter().map(|document| decode(document)).collect()
        })
    }
}

impl Repository<Composition> for ConductorStore {
    fn load_all(&self) -> StoreResult<Vec<Composition>> {
        self.query_documents("SELECT document FROM compositions ORDER BY name, id", &[])
    }

    fn save(&self, item: &Composition) -> StoreResult<()> {
        let result = self.request(|reply| WriteCmd::SaveComposition {
            composition: Box::new(item.clone()),
            reply,
        });
        append_run_log(
            if result.is_ok() { "info" } else { "error" },
            "store.composition.saved",
            json!({
                "id": item.id,
                "version": item.version,
                "error": result.as_ref().err().map(ToString::to_string),
            }),
        );
        result
    }

    /// Also removes the composition's performance history.
    fn delete(&self, id: &str) -> StoreResult<bool> {
        let result = self.request(|reply| WriteCmd::DeleteComposition {
            id: id.to_string(),
            reply,
        });
        append_run_log(
            "info",
            "store.composition.deleted",
            json!({ "id": id, "removed": result.as_ref().ok() }),
        );
        result
    }
}

impl Repository<Performance> for ConductorStore {
    fn load_all(&self) -> StoreResult<Vec<Performance>> {
        self.query_documents(
            "SELECT document FROM performances ORDER BY start_time DESC, id DESC",
            &[],
        )
    }

    fn save(&self, item: &Performance) -> StoreResult<()> {
        let result = self.request(|reply| WriteCmd::SavePerformance {
            performance: Box::new(item.clone()),
            reply,
        });
        append_run_log(
            if result.is_ok() { "info" } else { "error" },
            "store.performance.saved",
            json!({
                "id": item.id,
                "composition_id": item.composition_id,
                "status": item.status.as_str(),
            }),
        );
        result
    }

    fn delete(&self, id: &str) -> StoreResult<bool> {
        self.request(|reply| WriteCmd::DeletePerformance {
            id: id.to_string(),
            reply,
        })
    }
}

fn save_composition(conn: &Connection, composition: &Composition) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO compositions (id, name, version, created, updated, document)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            version = excluded.version,
            created = excluded.created,
            updated = excluded.updated,
            document = excluded.document",
        params![
            composition.id,
            composition.name,
            composition.version,
            composition.created,
            composition.updated,
            encode(composition)?,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn delete_composition(conn: &mut Connection, id: &str) -> StoreResult<bool> {
    let tx = conn.transaction().map_err(db_err)?;
    tx.execute("DELETE FROM performances WHERE composition_id = ?1", [id])
        .map_err(db_err)?;
    let removed = tx
        .execute("DELETE FROM compositions WHERE id = ?1", [id])
        .map_err(db_err)?;
    tx.commit().map_err(db_err)?;
    Ok(removed > 0)
}

fn save_performance(conn: &Connection, performance: &Performance) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO performances (id, composition_id, status, start_time, end_time, document)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            composition_id = excluded.composition_id,
            status = excluded.status,
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            document = excluded.document",
        params![
            performance.id,
            performance.composition_id,
            performance.status.as_str(),
            performance.start_time,
            performance.end_time,
            encode(performance)?,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../migrations/0001_conductor.sql"))];

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL);",
    )
    .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, system_time_unix()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        append_run_log(
            "info",
            "store.migration.applied",
            json!({ "version": version }),
        );
    }
    Ok(())
}

fn encode<T: Serialize>(item: &T) -> StoreResult<String> {
    serde_json::to_string(item).map_err(|e| ConductorError::Database(e.to_string()))
}

fn decode<T: DeserializeOwned>(document: &str) -> StoreResult<T> {
    serde_json::from_str(document).map_err(|e| ConductorError::Database(e.to_string()))
}

fn db_err(error: rusqlite::Error) -> ConductorError {
    ConductorError::Database(error.to_string())
}

fn system_time_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use tempfile::TempDir;

    use super::{ConductorStore, Repository};
    use crate::composition::{AccountReference, Composition, Step, StepAction};
    use crate::performance::{Performance, StepResult};

    fn temp_store() -> (ConductorStore, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("conductor.sqlite");
        (ConductorStore::open(&db).expect("open store"), dir)
    }

    fn composition(id: &str, name: &str) -> Composition {
        Composition {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            version: 1,
            created: 10,
            updated: 10,
            accounts: vec![AccountReference {
                alias: "alice".to_string(),
                identifier: "alice@example.com".to_string(),
            }],
            steps: vec![Step {
                id: "s1".to_string(),
                account_alias: "alice".to_string(),
                description: "Connect alice".to_string(),
                action: StepAction::Connect,
            }],
            variables: BTreeMap::from([("room".to_string(), "lobby".to_string())]),
            tags: BTreeSet::from(["smoke".to_string()]),
        }
    }

    fn performance(id: &str, composition_id: &str, start: i64) -> Performance {
        Performance::assemble(
            id.to_string(),
            composition_id,
            start,
            start + 5,
            vec![StepResult::passed("s1", 5)],
        )
    }

    #[test]
    fn compositions_round_trip_and_upsert_by_id() {
        let (store, _dir) = temp_store();
        let mut original = composition("comp-b", "beta");
        store.save(&original).expect("save");
        store.save(&composition("comp-a", "alpha")).expect("save");

        original.version = 2;
        original.name = "beta v2".to_string();
        store.save(&original).expect("upsert");

        let all: Vec<Composition> = store.load_all().expect("load");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "alpha");
        assert_eq!(
            store.load_composition("comp-b").expect("load"),
            Some(original)
        );
        assert_eq!(store.load_composition("missing").expect("load"), None);
    }

    #[test]
    fn history_is_newest_first_and_follows_composition_deletes() {
        let (store, _dir) = temp_store();
        store.save(&composition("comp-1", "ping")).expect("save");
        store.save(&performance("perf-old", "comp-1", 100)).expect("save");
        store.save(&performance("perf-new", "comp-1", 200)).expect("save");
        store.save(&performance("perf-other", "comp-2", 150)).expect("save");

        let history = store.performances_for("comp-1").expect("history");
        let ids = history.iter().map(|p| p.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["perf-new", "perf-old"]);

        assert!(Repository::<Composition>::delete(&store, "comp-1").expect("delete"));
        assert!(store.performances_for("comp-1").expect("history").is_empty());
        let remaining: Vec<Performance> = store.load_all().expect("load");
        assert_eq!(remaining.len(), 1);
        assert!(!Repository::<Performance>::delete(&store, "perf-new").expect("delete"));
    }

    #[test]
    fn reopening_keeps_data_and_skips_applied_migrations() {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("conductor.sqlite");
        {
            let store = ConductorStore::open(&db).expect("open");
            store.save(&composition("comp-1", "ping")).expect("save");
        }
        let store = ConductorStore::open(&db).expect("reopen");
        let all: Vec<Composition> = store.load_all().expect("load");
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn zero_byte_database_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("conductor.sqlite");
        std::fs::write(&db, b"").expect("touch");
        let err = ConductorStore::open(&db).err().expect("must fail");
        assert!(err.to_string().contains("0 bytes"));
    }
}
