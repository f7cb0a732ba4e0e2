// Daemon bootstrap: PID file handling, config resolution, component
// wiring and the graceful shutdown sequence.

pub mod command;
pub mod events;
pub mod runner;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::daemon::command::SystemCommandRunner;
use crate::daemon::events::{DaemonEvent, EventBus};
use crate::daemon::runner::Runner;
use crate::models::DaemonConfig;
use crate::server::{self, AppState};
use crate::storage::executions::SqliteExecutionStore;
use crate::storage::logs::FsLogStore;
use crate::storage::{ExecutionStore, LogStore};

/// Grace period for an in-flight pipeline once shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// PidFile — exclusive PID file acquisition
// ---------------------------------------------------------------------------

/// Manages a PID file to ensure only one daemon instance runs at a time.
///
/// Uses exclusive file creation (CREATE_NEW / O_EXCL) to prevent races.
/// If the PID file exists, checks whether the recorded PID is still alive.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Create a new PidFile handle (does not acquire yet).
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Acquire the PID file.
    ///
    /// - If the file does not exist, creates it exclusively and writes
    ///   the current PID.
    /// - If the file exists and the recorded PID is alive, returns an
    ///   error.
    /// - If the file exists but the PID is stale (process dead),
    ///   removes the stale file and acquires.
    pub fn acquire(&self) -> Result<()> {
        if self.path.exists() {
            let content =
                std::fs::read_to_string(&self.path).context("Failed to read existing PID file")?;
            let existing_pid: u32 = content
                .trim()
                .parse()
                .context("Failed to parse PID from PID file")?;

            if is_process_alive(existing_pid) {
                return Err(anyhow::anyhow!(
                    "Daemon is already running (PID {existing_pid}). \
                     PID file: {}",
                    self.path.display()
                ));
            }

            tracing::warn!(
                "Removing stale PID file (PID {} is no longer running)",
                existing_pid
            );
            std::fs::remove_file(&self.path).context("Failed to remove stale PID file")?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .context("Failed to create PID file (exclusive create)")?;

        let pid = std::process::id();
        write!(file, "{}", pid).context("Failed to write PID to PID file")?;
        file.flush().context("Failed to flush PID file")?;

        tracing::info!("PID file acquired: {} (PID {})", self.path.display(), pid);
        Ok(())
    }

    /// Release the PID file by removing it.
    pub fn release(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove PID file")?;
            tracing::info!("PID file released: {}", self.path.display());
        }
        Ok(())
    }

    /// Check if the PID file exists and the recorded process is alive.
    pub fn is_alive(&self) -> bool {
        if !self.path.exists() {
            return false;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match content.trim().parse::<u32>() {
                Ok(pid) => is_process_alive(pid),
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    /// Return the path to this PID file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Check whether a process with the given PID is alive.
///
/// - Unix: uses kill(pid, 0) — signal 0 checks existence without
///   sending a signal.
/// - Windows: uses OpenProcess with PROCESS_QUERY_LIMITED_INFORMATION.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // signal 0 tests process existence
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(windows)]
    {
        // PROCESS_QUERY_LIMITED_INFORMATION = 0x1000
        const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;

        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                false
            } else {
                CloseHandle(handle);
                true
            }
        }
    }
}

#[cfg(windows)]
extern "system" {
    fn OpenProcess(
        dwDesiredAccess: u32,
        bInheritHandle: i32,
        dwProcessId: u32,
    ) -> *mut std::ffi::c_void;
    fn CloseHandle(hObject: *mut std::ffi::c_void) -> i32;
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load the DaemonConfig using the resolution order:
///   1. --config CLI flag (passed as config_path)
///   2. RBD_CONFIG_DIR environment variable
///   3. Platform config dir (dirs::config_dir()/repo-build-daemon/config.json)
///   4. Fall back to {data_dir}/config.json
///   5. If no config file exists, use DaemonConfig::default()
pub fn load_config(config_path: Option<&Path>) -> Result<DaemonConfig> {
    // 1. Explicit config path
    if let Some(path) = config_path {
        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: DaemonConfig =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            tracing::info!("Loaded config from: {}", path.display());
            return Ok(config);
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    // 2. RBD_CONFIG_DIR env var
    if let Ok(config_dir) = std::env::var("RBD_CONFIG_DIR") {
        let path = PathBuf::from(&config_dir).join("config.json");
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .context("Failed to read config from RBD_CONFIG_DIR")?;
            let config: DaemonConfig = serde_json::from_str(&content)
                .context("Failed to parse config from RBD_CONFIG_DIR")?;
            tracing::info!("Loaded config from RBD_CONFIG_DIR: {}", path.display());
            return Ok(config);
        }
    }

    // 3. Platform config dir
    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("repo-build-daemon").join("config.json");
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .context("Failed to read config from platform config dir")?;
            let config: DaemonConfig = serde_json::from_str(&content)
                .context("Failed to parse config from platform config dir")?;
            tracing::info!("Loaded config from: {}", path.display());
            return Ok(config);
        }
    }

    // 4. Fall back to data_dir/config.json
    let data_dir = resolve_data_dir(None);
    let path = data_dir.join("config.json");
    if path.exists() {
        let content =
            std::fs::read_to_string(&path).context("Failed to read config from data dir")?;
        let config: DaemonConfig =
            serde_json::from_str(&content).context("Failed to parse config from data dir")?;
        tracing::info!("Loaded config from: {}", path.display());
        return Ok(config);
    }

    // 5. Use defaults
    tracing::info!("No config file found, using defaults");
    Ok(DaemonConfig::default())
}

/// Resolve the data directory. If `override_dir` is Some, use it.
/// Otherwise, use the platform default.
///
/// Platform defaults:
/// - Windows: `C:\ProgramData\repo-build-daemon`
/// - macOS/Linux: `~/.local/share/repo-build-daemon` via `dirs::data_dir()`
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    // Check RBD_DATA_DIR env
    if let Ok(d) = std::env::var("RBD_DATA_DIR") {
        return PathBuf::from(d);
    }

    // Platform default
    #[cfg(target_os = "windows")]
    {
        std::env::var("PROGRAMDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\ProgramData"))
            .join("repo-build-daemon")
    }

    #[cfg(not(target_os = "windows"))]
    {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("repo-build-daemon")
    }
}

/// Create the required data directories under `data_dir`.
pub async fn create_data_dirs(data_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .context("Failed to create data directory")?;
    tokio::fs::create_dir_all(data_dir.join("logs"))
        .await
        .context("Failed to create logs directory")?;
    tracing::info!("Data directories ensured at: {}", data_dir.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Daemon bootstrap
// ---------------------------------------------------------------------------

/// Start the daemon.
///
/// This is the main entry point for the daemon process. It:
/// 1. Loads config and resolves the data directory
/// 2. Acquires the PID file
/// 3. Opens storage (SqliteExecutionStore, FsLogStore)
/// 4. Creates the event bus and wires the shutdown listener
/// 5. Starts the execution runner
/// 6. Starts the HTTP server
/// 7. Waits for Ctrl+C / SIGTERM / API shutdown
/// 8. Runs the shutdown sequence
pub async fn start_daemon(
    config_path: Option<&Path>,
    data_dir_override: Option<&Path>,
    host_override: Option<&str>,
    port_override: Option<u16>,
    foreground: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;

    if let Some(h) = host_override {
        config.host = h.to_string();
    }
    if let Some(p) = port_override {
        config.port = p;
    }

    let data_dir = if let Some(d) = data_dir_override {
        d.to_path_buf()
    } else if let Some(ref d) = config.data_dir {
        d.clone()
    } else {
        resolve_data_dir(None)
    };
    config.data_dir = Some(data_dir.clone());

    let config = Arc::new(config);

    create_data_dirs(&data_dir).await?;

    if config.repo_url.is_empty() {
        tracing::warn!("No repository URL configured; executions will fail at the clone step");
    }

    let pid_file = PidFile::new(data_dir.join("rbd.pid"));
    pid_file.acquire()?;

    // Event bus and storage
    let bus = EventBus::new(config.broadcast_capacity);
    let sqlite_store = Arc::new(SqliteExecutionStore::open(
        data_dir.join("executions.db"),
        bus.clone(),
    )?);
    let store: Arc<dyn ExecutionStore> = Arc::clone(&sqlite_store) as Arc<dyn ExecutionStore>;
    let log_store: Arc<dyn LogStore> = Arc::new(
        FsLogStore::new(data_dir.clone(), Arc::clone(&store), bus.clone()).await?,
    );

    // The storage layer releases its connection when shutdown is
    // announced on the bus.
    let mut store_events = bus.subscribe();
    let store_for_shutdown = Arc::clone(&sqlite_store);
    let store_closer = tokio::spawn(async move {
        loop {
            match store_events.recv().await {
                Ok(DaemonEvent::Shutdown) => {
                    store_for_shutdown.close();
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Execution runner
    let runner = Runner::new(
        Arc::clone(&store),
        Arc::clone(&log_store),
        Arc::new(SystemCommandRunner),
        bus.clone(),
        Arc::clone(&config),
    );
    let runner_handle = runner.spawn();

    // HTTP server
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(());
    let state = Arc::new(AppState {
        store,
        log_store,
        bus: bus.clone(),
        config: Arc::clone(&config),
        start_time: Instant::now(),
        shutdown_tx: Some(shutdown_tx.clone()),
    });

    let router = server::create_router(state);
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .context(format!("Failed to bind to {}", bind_addr))?;

    tracing::info!("Daemon started. Listening on http://{}", bind_addr);

    if foreground {
        tracing::info!("Running in foreground mode. Press Ctrl+C to stop.");
    }

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
                tracing::info!("HTTP server received shutdown signal");
            })
            .await
            .ok();
    });

    // Wait for shutdown: Ctrl+C, SIGTERM (Unix), or API shutdown
    // request. The API subscriber ensures `rbd stop` terminates the
    // process even when running headless.
    let mut api_shutdown_rx = shutdown_tx.subscribe();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            }
            _ = api_shutdown_rx.changed() => {
                tracing::info!("Received API shutdown signal");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = api_shutdown_rx.changed() => {
                tracing::info!("Received API shutdown signal");
            }
        }
    }

    // Stop accepting HTTP connections, then announce shutdown on the
    // bus: the runner stops picking up work, open log tails end, and
    // the store closes its connection.
    let _ = shutdown_tx.send(());
    bus.publish(DaemonEvent::Shutdown);

    match tokio::time::timeout(SHUTDOWN_GRACE, runner_handle.worker).await {
        Ok(_) => tracing::info!("Runner stopped"),
        Err(_) => tracing::warn!(
            "Runner did not stop within the {}s grace period",
            SHUTDOWN_GRACE.as_secs()
        ),
    }
    runner_handle.listener.abort();
    let _ = store_closer.await;
    let _ = server_handle.await;

    if let Err(e) = pid_file.release() {
        tracing::error!("Failed to release PID file: {}", e);
    }

    tracing::info!("Daemon exited cleanly.");
    Ok(())
}
