// CLI daemon commands: start, stop, status

use std::process::Stdio;

use anyhow::Context;
use reqwest::Client;
use serde_json::Value;

use super::{base_url, connection_error_message};

/// Helper to handle reqwest errors and produce a user-friendly connection error.
fn handle_request_error(err: reqwest::Error, host: &str, port: u16) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() {
        anyhow::anyhow!("{}", connection_error_message(host, port))
    } else {
        anyhow::anyhow!("Request failed: {}", err)
    }
}

/// rbd start
pub async fn cmd_start(
    host: &str,
    foreground: bool,
    config: Option<&str>,
    port_override: Option<u16>,
    data_dir: Option<&str>,
) -> anyhow::Result<()> {
    // Ensure tracing is initialized for daemon mode
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();

    if foreground {
        return run_daemon_foreground(host, config, port_override, data_dir).await;
    }

    // Background mode: re-invoke ourselves with --foreground, detached
    // from the current terminal.
    let exe_path = std::env::current_exe().context("Failed to determine executable path")?;

    let mut cmd = std::process::Command::new(exe_path);
    cmd.arg("start").arg("--foreground");
    if let Some(c) = config {
        cmd.args(["--config", c]);
    }
    if let Some(p) = port_override {
        cmd.args(["--port", &p.to_string()]);
    }
    if let Some(d) = data_dir {
        cmd.args(["--data-dir", d]);
    }
    if host != "127.0.0.1" {
        cmd.args(["--host", host]);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New session so the daemon survives the terminal closing.
        cmd.process_group(0);
    }

    let child = cmd.spawn().context("Failed to spawn daemon process")?;
    println!("Daemon started in the background (PID {}).", child.id());
    println!("Use 'rbd status' to check daemon status.");
    println!("Use 'rbd stop' to stop the daemon.");
    Ok(())
}

/// Run the daemon directly in the foreground (blocking).
async fn run_daemon_foreground(
    host: &str,
    config: Option<&str>,
    port_override: Option<u16>,
    data_dir: Option<&str>,
) -> anyhow::Result<()> {
    let config_path = config.map(std::path::Path::new);
    let data_dir_path = data_dir.map(std::path::Path::new);

    // The global --host only overrides the config when it differs from
    // the default.
    let host_override = if host != "127.0.0.1" { Some(host) } else { None };

    crate::daemon::start_daemon(
        config_path,
        data_dir_path,
        host_override,
        port_override,
        true,
    )
    .await
}

/// rbd stop
pub async fn cmd_stop(host: &str, port: u16, force: bool) -> anyhow::Result<()> {
    if force {
        println!("Force stopping daemon...");
        return force_kill_daemon();
    }

    let client = Client::new();
    let url = format!("{}/shutdown", base_url(host, port));

    match client.post(&url).send().await {
        Ok(response) => {
            let status = response.status();
            let body: Value = response
                .json()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

            if status.is_success() {
                println!("Daemon is shutting down...");
                Ok(())
            } else {
                let message = body["message"].as_str().unwrap_or("Unknown error");
                eprintln!("Error: {}", message);
                std::process::exit(1);
            }
        }
        Err(e) if e.is_connect() || e.is_timeout() => Err(handle_request_error(e, host, port)),
        Err(e) => Err(anyhow::anyhow!("Request failed: {}", e)),
    }
}

/// Force kill the daemon by reading the PID file and terminating the process.
fn force_kill_daemon() -> anyhow::Result<()> {
    let data_dir = crate::daemon::resolve_data_dir(None);
    let pid_file_path = data_dir.join("rbd.pid");

    if !pid_file_path.exists() {
        println!("No PID file found. Daemon may not be running.");
        return Ok(());
    }

    let content = std::fs::read_to_string(&pid_file_path).context("Failed to read PID file")?;
    let pid: u32 = content
        .trim()
        .parse()
        .context("Failed to parse PID from PID file")?;

    println!("Found daemon PID: {}", pid);

    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        if result == 0 {
            println!("Sent SIGKILL to process {}", pid);
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                println!("Process {} not found (already dead)", pid);
            } else {
                return Err(anyhow::anyhow!("Failed to kill process {}: {}", pid, err));
            }
        }
    }

    #[cfg(windows)]
    {
        let status = std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .status()
            .context("Failed to execute taskkill")?;

        if status.success() {
            println!("Terminated process {}", pid);
        } else {
            println!(
                "taskkill exited with code {:?} (process may already be dead)",
                status.code()
            );
        }
    }

    if let Err(e) = std::fs::remove_file(&pid_file_path) {
        println!("Warning: Could not remove PID file: {}", e);
    } else {
        println!("Removed PID file.");
    }

    Ok(())
}

/// rbd status
pub async fn cmd_status(host: &str, port: u16, verbose: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/health", base_url(host, port));

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if verbose {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("Daemon is running at {}:{}", host, port);
    println!("  version:            {}", body["version"].as_str().unwrap_or("?"));
    println!(
        "  uptime:             {}s",
        body["uptime_seconds"].as_u64().unwrap_or(0)
    );
    println!(
        "  total executions:   {}",
        body["total_executions"].as_u64().unwrap_or(0)
    );
    println!(
        "  running executions: {}",
        body["running_executions"].as_u64().unwrap_or(0)
    );
    Ok(())
}
