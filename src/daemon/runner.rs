use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use crate::daemon::command::CommandRunner;
use crate::daemon::events::{DaemonEvent, EventBus};
use crate::models::{DaemonConfig, ExecutionStatus};
use crate::storage::logs::LogWriter;
use crate::storage::{ExecutionStore, LogStore};

/// Capacity of the scheduled-execution queue feeding the worker.
const QUEUE_CAPACITY: usize = 64;
/// Capacity of the per-pipeline log write channel.
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Handles to the runner's background tasks.
pub struct RunnerHandle {
    pub listener: tokio::task::JoinHandle<()>,
    pub worker: tokio::task::JoinHandle<()>,
}

/// Consumes `scheduled` executions from the bus and drives the build
/// pipeline for each.
///
/// Serialization is structural: a single worker task owns the queue, so
/// two pipelines can never overlap no matter how many executions are
/// scheduled concurrently. Excess executions wait their turn in enqueue
/// order (event-arrival order, which tracks but does not strictly
/// guarantee creation order).
pub struct Runner {
    store: Arc<dyn ExecutionStore>,
    log_store: Arc<dyn LogStore>,
    commands: Arc<dyn CommandRunner>,
    bus: EventBus,
    config: Arc<DaemonConfig>,
}

impl Runner {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        log_store: Arc<dyn LogStore>,
        commands: Arc<dyn CommandRunner>,
        bus: EventBus,
        config: Arc<DaemonConfig>,
    ) -> Self {
        Self {
            store,
            log_store,
            commands,
            bus,
            config,
        }
    }

    /// Start the listener and worker tasks. The listener enqueues every
    /// execution observed entering `scheduled`; the worker drains the
    /// queue one pipeline at a time.
    pub fn spawn(self) -> RunnerHandle {
        let (queue_tx, mut queue_rx) = mpsc::channel::<i64>(QUEUE_CAPACITY);
        let mut events = self.bus.subscribe();

        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DaemonEvent::ExecutionUpdated { execution })
                        if execution.status == ExecutionStatus::Scheduled =>
                    {
                        if queue_tx.send(execution.id).await.is_err() {
                            break;
                        }
                    }
                    Ok(DaemonEvent::Shutdown) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Runner lagged behind the event bus by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Runner listener stopped");
        });

        let worker = tokio::spawn(async move {
            while let Some(id) = queue_rx.recv().await {
                self.run_execution(id).await;
            }
            tracing::debug!("Runner worker stopped");
        });

        RunnerHandle { listener, worker }
    }

    async fn run_execution(&self, id: i64) {
        tracing::info!("Starting execution [{}]", id);
        if let Err(e) = self.drive_pipeline(id).await {
            tracing::error!("Execution {} aborted: {}", id, e);
            return;
        }
        tracing::info!("Ended execution [{}]", id);
    }

    /// One full pipeline run. Step failures are logged and the
    /// execution still reaches `finished`; only storage or log-handle
    /// failures abort.
    async fn drive_pipeline(&self, id: i64) -> Result<()> {
        // The write handle must exist before the execution is reported
        // running, so an attaching tail reader always finds the file.
        let writer = self.log_store.open_for_write(id).await?;
        let (log_tx, log_rx) = mpsc::channel::<Vec<u8>>(LOG_CHANNEL_CAPACITY);
        let writer_task = tokio::spawn(write_log(writer, log_rx));

        self.store.start_execution(id, Utc::now()).await?;

        if let Err(e) = self.run_steps(id, &log_tx).await {
            tracing::error!("Error while running execution {}: {}", id, e);
        }

        // Flush and close the log before the finished transition is
        // published, so a tail reader's final drain sees every byte.
        drop(log_tx);
        let _ = writer_task.await;

        self.store.end_execution(id, Utc::now()).await?;
        Ok(())
    }

    async fn run_steps(&self, id: i64, log_tx: &mpsc::Sender<Vec<u8>>) -> Result<()> {
        let workspace = self.config.workspace_path();
        match tokio::fs::remove_dir_all(&workspace).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to reset workspace"),
        }

        let repo = self.config.repo_url.clone();
        let workspace_arg = workspace.to_string_lossy().into_owned();

        write_marker(log_tx, format!("=== Cloning {}\n", repo)).await;
        self.commands
            .run(
                "git",
                &["clone".to_string(), repo, workspace_arg],
                log_tx.clone(),
            )
            .await?;

        let image = format!("{}-{}", self.config.image_prefix, id);
        let dockerfile = workspace.join(&self.config.dockerfile);
        let build_context = workspace.join(&self.config.build_context);

        write_marker(log_tx, format!("\n=== Building image {}\n", image)).await;
        self.commands
            .run(
                "docker",
                &[
                    "build".to_string(),
                    "-t".to_string(),
                    image,
                    "-f".to_string(),
                    dockerfile.to_string_lossy().into_owned(),
                    build_context.to_string_lossy().into_owned(),
                ],
                log_tx.clone(),
            )
            .await?;

        Ok(())
    }
}

async fn write_marker(log_tx: &mpsc::Sender<Vec<u8>>, marker: String) {
    let _ = log_tx.send(marker.into_bytes()).await;
}

/// Single writer task per pipeline: stdout, stderr and marker chunks
/// all funnel through one channel, keeping log appends sequential.
async fn write_log(mut writer: LogWriter, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = writer.append(&chunk).await {
            tracing::error!("Failed to append to execution log: {}", e);
        }
    }
    if let Err(e) = writer.close().await {
        tracing::error!("Failed to close execution log: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::command::MockCommandRunner;
    use crate::storage::executions::SqliteExecutionStore;
    use crate::storage::logs::FsLogStore;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    struct Harness {
        store: Arc<dyn ExecutionStore>,
        log_store: Arc<dyn LogStore>,
        bus: EventBus,
        _tmp: TempDir,
    }

    async fn setup(commands: Arc<MockCommandRunner>) -> (Harness, RunnerHandle) {
        let tmp = TempDir::new().expect("tempdir");
        let bus = EventBus::new(256);
        let store: Arc<dyn ExecutionStore> =
            Arc::new(SqliteExecutionStore::in_memory(bus.clone()).expect("store"));
        let log_store: Arc<dyn LogStore> = Arc::new(
            FsLogStore::new(tmp.path().to_path_buf(), Arc::clone(&store), bus.clone())
                .await
                .expect("log store"),
        );

        let mut config = DaemonConfig::default();
        config.data_dir = Some(tmp.path().to_path_buf());
        config.repo_url = "https://example.com/repo.git".to_string();

        let runner = Runner::new(
            Arc::clone(&store),
            Arc::clone(&log_store),
            commands,
            bus.clone(),
            Arc::new(config),
        );
        let handle = runner.spawn();

        (
            Harness {
                store,
                log_store,
                bus,
                _tmp: tmp,
            },
            handle,
        )
    }

    /// Create, register a log for, and schedule one execution.
    async fn schedule_one(harness: &Harness) -> i64 {
        let execution = harness.store.create_execution().await.expect("create");
        harness
            .log_store
            .create_log(execution.id)
            .await
            .expect("create log");
        harness
            .store
            .schedule_execution(execution.id)
            .await
            .expect("schedule");
        execution.id
    }

    /// Wait until the given execution is reported finished.
    async fn wait_until_finished(harness: &Harness, id: i64) {
        let mut rx = harness.bus.subscribe();
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                // The event may already have fired; check the store first.
                let current = harness
                    .store
                    .get_execution(id)
                    .await
                    .expect("get")
                    .expect("exists");
                if current.status == ExecutionStatus::Finished {
                    return;
                }
                match rx.recv().await {
                    Ok(DaemonEvent::ExecutionUpdated { execution })
                        if execution.id == id
                            && execution.status == ExecutionStatus::Finished =>
                    {
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => {}
                }
            }
        })
        .await;
        deadline.expect("execution did not finish in time");
    }

    async fn read_full_log(harness: &Harness, id: i64) -> Vec<u8> {
        let mut stream = harness.log_store.read_log(id).await.expect("read log");
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.expect("chunk"));
        }
        collected
    }

    #[tokio::test]
    async fn test_scheduled_execution_runs_to_finished() {
        let commands = Arc::new(MockCommandRunner::with_outputs(vec![
            b"clone output\n".to_vec(),
            b"build output\n".to_vec(),
        ]));
        let (harness, _handle) = setup(Arc::clone(&commands)).await;

        let id = schedule_one(&harness).await;
        wait_until_finished(&harness, id).await;

        let execution = harness
            .store
            .get_execution(id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(execution.status, ExecutionStatus::Finished);
        assert!(execution.start_date.is_some());
        assert!(execution.end_date.is_some());
        assert!(!execution.is_running());
    }

    #[tokio::test]
    async fn test_pipeline_invokes_clone_then_build() {
        let commands = Arc::new(MockCommandRunner::with_outputs(vec![
            b"clone output\n".to_vec(),
            b"build output\n".to_vec(),
        ]));
        let (harness, _handle) = setup(Arc::clone(&commands)).await;

        let id = schedule_one(&harness).await;
        wait_until_finished(&harness, id).await;

        let invocations = commands.invocations();
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].program, "git");
        assert_eq!(invocations[0].args[0], "clone");
        assert_eq!(invocations[0].args[1], "https://example.com/repo.git");
        assert_eq!(invocations[1].program, "docker");
        assert_eq!(invocations[1].args[0], "build");
        assert!(
            invocations[1].args.contains(&format!("rbd-build-{}", id)),
            "image tag must derive from the execution id"
        );
    }

    #[tokio::test]
    async fn test_log_contains_markers_and_command_output_in_order() {
        let commands = Arc::new(MockCommandRunner::with_outputs(vec![
            b"clone output\n".to_vec(),
            b"build output\n".to_vec(),
        ]));
        let (harness, _handle) = setup(commands).await;

        let id = schedule_one(&harness).await;
        wait_until_finished(&harness, id).await;

        let log = read_full_log(&harness, id).await;
        let expected = format!(
            "=== Cloning https://example.com/repo.git\nclone output\n\
             \n=== Building image rbd-build-{}\nbuild output\n",
            id
        );
        assert_eq!(String::from_utf8_lossy(&log), expected);
    }

    #[tokio::test]
    async fn test_step_failure_still_reaches_finished() {
        let commands = Arc::new(MockCommandRunner::failing("remote hung up"));
        let (harness, _handle) = setup(commands).await;

        let id = schedule_one(&harness).await;
        wait_until_finished(&harness, id).await;

        let execution = harness
            .store
            .get_execution(id)
            .await
            .expect("get")
            .expect("exists");
        // No distinct failure status exists; failures land in finished.
        assert_eq!(execution.status, ExecutionStatus::Finished);
        assert!(execution.end_date.is_some());
    }

    #[tokio::test]
    async fn test_failed_clone_skips_build() {
        let commands = Arc::new(MockCommandRunner::failing("remote hung up"));
        let (harness, _handle) = setup(Arc::clone(&commands)).await;

        let id = schedule_one(&harness).await;
        wait_until_finished(&harness, id).await;

        let invocations = commands.invocations();
        assert_eq!(invocations.len(), 1, "build must not run after a failed clone");
        assert_eq!(invocations[0].program, "git");
    }

    #[tokio::test]
    async fn test_pipelines_never_overlap() {
        let commands = Arc::new(MockCommandRunner::with_delay(
            vec![
                b"a\n".to_vec(),
                b"b\n".to_vec(),
                b"c\n".to_vec(),
                b"d\n".to_vec(),
            ],
            Duration::from_millis(50),
        ));
        let (harness, _handle) = setup(Arc::clone(&commands)).await;

        let first = schedule_one(&harness).await;
        let second = schedule_one(&harness).await;
        wait_until_finished(&harness, first).await;
        wait_until_finished(&harness, second).await;

        // Every command of the first pipeline finished before any
        // command of the second one started.
        let invocations = commands.invocations();
        assert_eq!(invocations.len(), 4);
        for window in invocations.windows(2) {
            assert!(
                window[0].finished_at <= window[1].started_at,
                "pipeline commands must not overlap"
            );
        }
    }

    #[tokio::test]
    async fn test_second_execution_starts_after_first_ends() {
        let commands = Arc::new(MockCommandRunner::with_delay(
            Vec::new(),
            Duration::from_millis(30),
        ));
        let (harness, _handle) = setup(commands).await;

        let first = schedule_one(&harness).await;
        let second = schedule_one(&harness).await;
        wait_until_finished(&harness, first).await;
        wait_until_finished(&harness, second).await;

        let first = harness
            .store
            .get_execution(first)
            .await
            .expect("get")
            .expect("exists");
        let second = harness
            .store
            .get_execution(second)
            .await
            .expect("get")
            .expect("exists");
        assert!(
            second.start_date.expect("start") >= first.end_date.expect("end"),
            "back-to-back executions must be serialized"
        );
    }

    #[tokio::test]
    async fn test_status_events_are_monotonic_per_execution() {
        let commands = Arc::new(MockCommandRunner::with_outputs(vec![]));
        let (harness, _handle) = setup(commands).await;

        let mut rx = harness.bus.subscribe();
        let id = schedule_one(&harness).await;
        wait_until_finished(&harness, id).await;

        let order = |status: ExecutionStatus| match status {
            ExecutionStatus::Created => 0,
            ExecutionStatus::Scheduled => 1,
            ExecutionStatus::Running => 2,
            ExecutionStatus::Finished => 3,
        };

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let DaemonEvent::ExecutionUpdated { execution } = event {
                if execution.id != id {
                    continue;
                }
                if let Some(previous) = last {
                    assert!(
                        order(execution.status) >= previous,
                        "status must never move backwards"
                    );
                }
                last = Some(order(execution.status));
            }
        }
        assert_eq!(last, Some(3), "the final observed status is finished");
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_runner() {
        let commands = Arc::new(MockCommandRunner::with_outputs(vec![]));
        let (harness, handle) = setup(commands).await;

        harness.bus.publish(DaemonEvent::Shutdown);

        tokio::time::timeout(Duration::from_secs(5), async {
            handle.listener.await.expect("listener join");
            handle.worker.await.expect("worker join");
        })
        .await
        .expect("runner tasks must stop on shutdown");
    }
}
