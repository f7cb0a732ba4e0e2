pub mod executions;
pub mod logs;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::Execution;
use crate::storage::logs::{LogStream, LogWriter};

/// Durable record of executions. The store owns every status transition;
/// each mutation returns the post-mutation snapshot and publishes it as
/// an `ExecutionUpdated` event before the next mutation can commit.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self) -> Result<Execution>;
    /// `created` → `scheduled`. Calling on an execution not in
    /// `created` is a contract violation and returns an error.
    async fn schedule_execution(&self, id: i64) -> Result<Execution>;
    /// Marks the execution running and sets `start_date`, exactly once.
    async fn start_execution(&self, id: i64, start_date: DateTime<Utc>) -> Result<Execution>;
    /// Marks the execution finished and sets `end_date`, exactly once.
    async fn end_execution(&self, id: i64, end_date: DateTime<Utc>) -> Result<Execution>;
    async fn get_execution(&self, id: i64) -> Result<Option<Execution>>;
    /// All executions, newest first.
    async fn list_executions(&self) -> Result<Vec<Execution>>;
}

/// Append-only per-execution byte logs.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Creates the empty log artifact; fails if one already exists for
    /// this id (ids are never reused).
    async fn create_log(&self, id: i64) -> Result<()>;
    /// The single append handle, used once per execution by the runner.
    async fn open_for_write(&self, id: i64) -> Result<LogWriter>;
    /// Full read for finished executions, live tail for running ones.
    async fn read_log(&self, id: i64) -> Result<LogStream>;
}
