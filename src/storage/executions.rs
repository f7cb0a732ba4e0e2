use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::daemon::events::{DaemonEvent, EventBus};
use crate::errors::DaemonError;
use crate::models::{Execution, ExecutionStatus};
use crate::storage::ExecutionStore;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    status TEXT NOT NULL DEFAULT 'created',
    create_date INTEGER NOT NULL,
    start_date INTEGER NULL,
    end_date INTEGER NULL
);
";

const EXECUTION_COLUMNS: &str = "id, status, create_date, start_date, end_date";

/// SQLite-backed execution store.
///
/// Every mutation is a single atomic update-and-fetch (`RETURNING`), and
/// the post-mutation snapshot is published on the bus while the
/// connection lock is still held. Subscribers therefore observe events
/// in commit order, and never before the row reflects the change.
pub struct SqliteExecutionStore {
    conn: Mutex<Option<Connection>>,
    bus: EventBus,
}

impl SqliteExecutionStore {
    /// Open (or create) the execution database at `path`.
    pub fn open(path: impl AsRef<Path>, bus: EventBus) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open execution database")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL journal mode")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create executions schema")?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            bus,
        })
    }

    /// In-memory store, used by tests.
    pub fn in_memory(bus: EventBus) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create executions schema")?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            bus,
        })
    }

    /// Close the underlying connection. Called when `Shutdown` is
    /// observed on the bus; later store calls fail with a storage error.
    pub fn close(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            if guard.take().is_some() {
                tracing::info!("Execution database closed");
            }
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| DaemonError::Storage("execution store lock poisoned".to_string()))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| DaemonError::Storage("execution store is closed".to_string()))?;
        f(conn)
    }

    fn decode_row(
        id: i64,
        status: String,
        create_date: i64,
        start_date: Option<i64>,
        end_date: Option<i64>,
    ) -> Result<Execution> {
        let status = ExecutionStatus::parse(&status).ok_or_else(|| {
            DaemonError::Storage(format!("unknown execution status '{}'", status))
        })?;
        Ok(Execution {
            id,
            status,
            create_date: decode_millis(create_date)?,
            start_date: start_date.map(decode_millis).transpose()?,
            end_date: end_date.map(decode_millis).transpose()?,
        })
    }

    fn query_execution<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Option<Execution>> {
        let row: Option<(i64, String, i64, Option<i64>, Option<i64>)> = conn
            .query_row(sql, params, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })
            .optional()
            .context("Execution query failed")?;

        row.map(|(id, status, create_date, start_date, end_date)| {
            Self::decode_row(id, status, create_date, start_date, end_date)
        })
        .transpose()
    }

    /// Run a mutation that returns the updated row, publishing the
    /// snapshot before the connection lock is released.
    fn mutate<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
        missing: impl FnOnce() -> DaemonError,
    ) -> Result<Execution> {
        self.with_conn(|conn| {
            let execution =
                Self::query_execution(conn, sql, params)?.ok_or_else(missing)?;
            self.bus.publish(DaemonEvent::ExecutionUpdated {
                execution: execution.clone(),
            });
            Ok(execution)
        })
    }
}

fn decode_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| DaemonError::Storage(format!("invalid timestamp {}", millis)).into())
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create_execution(&self) -> Result<Execution> {
        let now = Utc::now().timestamp_millis();
        self.mutate(
            &format!(
                "INSERT INTO executions (create_date) VALUES (?1) RETURNING {}",
                EXECUTION_COLUMNS
            ),
            params![now],
            || DaemonError::Storage("insert returned no row".to_string()),
        )
    }

    async fn schedule_execution(&self, id: i64) -> Result<Execution> {
        self.mutate(
            &format!(
                "UPDATE executions SET status = 'scheduled' \
                 WHERE id = ?1 AND status = 'created' RETURNING {}",
                EXECUTION_COLUMNS
            ),
            params![id],
            || DaemonError::Conflict(format!("execution {} is not in the created state", id)),
        )
    }

    async fn start_execution(&self, id: i64, start_date: DateTime<Utc>) -> Result<Execution> {
        self.mutate(
            &format!(
                "UPDATE executions SET status = 'running', start_date = ?2 \
                 WHERE id = ?1 AND start_date IS NULL AND end_date IS NULL RETURNING {}",
                EXECUTION_COLUMNS
            ),
            params![id, start_date.timestamp_millis()],
            || DaemonError::Conflict(format!("execution {} cannot transition to running", id)),
        )
    }

    async fn end_execution(&self, id: i64, end_date: DateTime<Utc>) -> Result<Execution> {
        self.mutate(
            &format!(
                "UPDATE executions SET status = 'finished', end_date = ?2 \
                 WHERE id = ?1 AND end_date IS NULL RETURNING {}",
                EXECUTION_COLUMNS
            ),
            params![id, end_date.timestamp_millis()],
            || DaemonError::Conflict(format!("execution {} is already finished", id)),
        )
    }

    async fn get_execution(&self, id: i64) -> Result<Option<Execution>> {
        self.with_conn(|conn| {
            Self::query_execution(
                conn,
                &format!(
                    "SELECT {} FROM executions WHERE id = ?1 LIMIT 1",
                    EXECUTION_COLUMNS
                ),
                params![id],
            )
        })
    }

    async fn list_executions(&self) -> Result<Vec<Execution>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM executions ORDER BY id DESC",
                    EXECUTION_COLUMNS
                ))
                .context("Failed to prepare execution listing")?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })
                .context("Failed to list executions")?;

            let mut executions = Vec::new();
            for row in rows {
                let (id, status, create_date, start_date, end_date) =
                    row.context("Failed to read execution row")?;
                executions.push(Self::decode_row(
                    id, status, create_date, start_date, end_date,
                )?);
            }
            Ok(executions)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_store() -> (SqliteExecutionStore, EventBus) {
        let bus = EventBus::new(64);
        let store = SqliteExecutionStore::in_memory(bus.clone()).expect("open store");
        (store, bus)
    }

    #[tokio::test]
    async fn test_create_execution_starts_in_created() {
        let (store, _bus) = setup_store();
        let execution = store.create_execution().await.expect("create");
        assert_eq!(execution.id, 1);
        assert_eq!(execution.status, ExecutionStatus::Created);
        assert!(execution.start_date.is_none());
        assert!(execution.end_date.is_none());
        assert!(!execution.is_running());
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let (store, _bus) = setup_store();
        let first = store.create_execution().await.expect("create");
        let second = store.create_execution().await.expect("create");
        let third = store.create_execution().await.expect("create");
        assert!(first.id < second.id);
        assert!(second.id < third.id);
    }

    #[tokio::test]
    async fn test_full_lifecycle_sets_dates_and_status() {
        let (store, _bus) = setup_store();
        let execution = store.create_execution().await.expect("create");
        let id = execution.id;

        let scheduled = store.schedule_execution(id).await.expect("schedule");
        assert_eq!(scheduled.status, ExecutionStatus::Scheduled);
        assert!(!scheduled.is_running());

        let started = store
            .start_execution(id, Utc::now())
            .await
            .expect("start");
        assert_eq!(started.status, ExecutionStatus::Running);
        assert!(started.start_date.is_some());
        assert!(started.is_running());

        let ended = store.end_execution(id, Utc::now()).await.expect("end");
        assert_eq!(ended.status, ExecutionStatus::Finished);
        assert!(ended.end_date.is_some());
        assert!(!ended.is_running());
        assert!(ended.start_date.expect("start") <= ended.end_date.expect("end"));
    }

    #[tokio::test]
    async fn test_schedule_twice_is_a_contract_violation() {
        let (store, _bus) = setup_store();
        let execution = store.create_execution().await.expect("create");
        store
            .schedule_execution(execution.id)
            .await
            .expect("first schedule");

        let result = store.schedule_execution(execution.id).await;
        assert!(result.is_err(), "second schedule must be rejected");

        // The row is untouched by the rejected call.
        let current = store
            .get_execution(execution.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(current.status, ExecutionStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_start_date_is_set_exactly_once() {
        let (store, _bus) = setup_store();
        let execution = store.create_execution().await.expect("create");
        store
            .schedule_execution(execution.id)
            .await
            .expect("schedule");

        let first_start = Utc::now();
        store
            .start_execution(execution.id, first_start)
            .await
            .expect("start");

        let result = store.start_execution(execution.id, Utc::now()).await;
        assert!(result.is_err(), "second start must be rejected");
    }

    #[tokio::test]
    async fn test_finished_is_terminal() {
        let (store, _bus) = setup_store();
        let execution = store.create_execution().await.expect("create");
        let id = execution.id;
        store.schedule_execution(id).await.expect("schedule");
        store.start_execution(id, Utc::now()).await.expect("start");
        store.end_execution(id, Utc::now()).await.expect("end");

        assert!(store.end_execution(id, Utc::now()).await.is_err());
        assert!(store.start_execution(id, Utc::now()).await.is_err());
        assert!(store.schedule_execution(id).await.is_err());
    }

    #[tokio::test]
    async fn test_get_unknown_execution_returns_none() {
        let (store, _bus) = setup_store();
        let result = store.get_execution(999).await.expect("get must not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_list_executions_newest_first() {
        let (store, _bus) = setup_store();
        for _ in 0..3 {
            store.create_execution().await.expect("create");
        }

        let executions = store.list_executions().await.expect("list");
        assert_eq!(executions.len(), 3);
        assert_eq!(executions[0].id, 3);
        assert_eq!(executions[1].id, 2);
        assert_eq!(executions[2].id, 1);
    }

    #[tokio::test]
    async fn test_every_mutation_publishes_a_snapshot() {
        let (store, bus) = setup_store();
        let mut rx = bus.subscribe();

        let execution = store.create_execution().await.expect("create");
        let id = execution.id;
        store.schedule_execution(id).await.expect("schedule");
        store.start_execution(id, Utc::now()).await.expect("start");
        store.end_execution(id, Utc::now()).await.expect("end");

        let expected = [
            ExecutionStatus::Created,
            ExecutionStatus::Scheduled,
            ExecutionStatus::Running,
            ExecutionStatus::Finished,
        ];
        for status in expected {
            match rx.recv().await.expect("event") {
                DaemonEvent::ExecutionUpdated { execution } => {
                    assert_eq!(execution.id, id);
                    assert_eq!(execution.status, status);
                }
                other => panic!("Expected ExecutionUpdated, got: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_event_snapshot_matches_row_at_publish_time() {
        let (store, bus) = setup_store();
        let mut rx = bus.subscribe();

        let execution = store.create_execution().await.expect("create");

        match rx.recv().await.expect("event") {
            DaemonEvent::ExecutionUpdated {
                execution: snapshot,
            } => {
                let row = store
                    .get_execution(execution.id)
                    .await
                    .expect("get")
                    .expect("exists");
                assert_eq!(snapshot, row);
            }
            other => panic!("Expected ExecutionUpdated, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_mutation_publishes_nothing() {
        let (store, bus) = setup_store();
        let execution = store.create_execution().await.expect("create");
        store
            .schedule_execution(execution.id)
            .await
            .expect("schedule");

        let mut rx = bus.subscribe();
        let _ = store.schedule_execution(execution.id).await;
        assert!(
            matches!(
                rx.try_recv(),
                Err(tokio::sync::broadcast::error::TryRecvError::Empty)
            ),
            "a rejected transition must not publish an event"
        );
    }

    #[tokio::test]
    async fn test_store_calls_fail_after_close() {
        let (store, _bus) = setup_store();
        store.create_execution().await.expect("create");
        store.close();

        assert!(store.create_execution().await.is_err());
        assert!(store.get_execution(1).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (store, _bus) = setup_store();
        store.close();
        store.close();
    }

    #[tokio::test]
    async fn test_open_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let db_path = tmp.path().join("executions.db");

        let bus = EventBus::new(16);
        {
            let store = SqliteExecutionStore::open(&db_path, bus.clone()).expect("open");
            store.create_execution().await.expect("create");
            store.close();
        }

        let store = SqliteExecutionStore::open(&db_path, bus).expect("reopen");
        let executions = store.list_executions().await.expect("list");
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Created);
    }
}
