use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::errors::DaemonError;

/// Seam for invoking external tools so the pipeline can be exercised in
/// tests without git or docker installed.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, piping stdout and stderr into
    /// `log_tx` chunk by chunk as they arrive. Fails on spawn errors
    /// and nonzero exits.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        log_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<()>;
}

/// Real implementation backed by tokio child processes.
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        log_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<()> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;

        let stdout = child
            .stdout
            .take()
            .context("Child process stdout was not captured")?;
        let stderr = child
            .stderr
            .take()
            .context("Child process stderr was not captured")?;

        let stdout_task = tokio::spawn(forward_output(stdout, log_tx.clone()));
        let stderr_task = tokio::spawn(forward_output(stderr, log_tx));

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", program))?;

        // Join both pipes before judging the exit so trailing output
        // lands in the log.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if !status.success() {
            return Err(DaemonError::Command(format!("{} exited with {}", program, status)).into());
        }
        Ok(())
    }
}

/// Copy one child output pipe into the log channel. Each chunk is sent
/// whole, so concurrent stdout/stderr forwarding never splits a chunk.
async fn forward_output<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Output pipe read error: {}", e);
                break;
            }
        }
    }
}

/// One recorded invocation of the mock runner.
#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub started_at: Instant,
    pub finished_at: Instant,
}

/// Scripted command runner for tests: emits one canned output blob per
/// invocation, optionally sleeps, optionally fails, and records every
/// call with entry/exit timestamps.
pub struct MockCommandRunner {
    outputs: std::sync::Mutex<std::collections::VecDeque<Vec<u8>>>,
    delay: Option<Duration>,
    fail_with: Option<String>,
    invocations: std::sync::Mutex<Vec<RecordedCommand>>,
}

impl MockCommandRunner {
    /// Each invocation pops and emits the next blob; further
    /// invocations emit nothing.
    pub fn with_outputs(outputs: Vec<Vec<u8>>) -> Self {
        Self {
            outputs: std::sync::Mutex::new(outputs.into()),
            delay: None,
            fail_with: None,
            invocations: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Like `with_outputs`, but every invocation also sleeps for
    /// `delay` before returning.
    pub fn with_delay(outputs: Vec<Vec<u8>>, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::with_outputs(outputs)
        }
    }

    /// Every invocation fails with the given message.
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::with_outputs(Vec::new())
        }
    }

    pub fn invocations(&self) -> Vec<RecordedCommand> {
        self.invocations.lock().expect("invocations lock").clone()
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        log_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<()> {
        let started_at = Instant::now();

        let output = self.outputs.lock().expect("outputs lock").pop_front();
        if let Some(output) = output {
            let _ = log_tx.send(output).await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.invocations
            .lock()
            .expect("invocations lock")
            .push(RecordedCommand {
                program: program.to_string(),
                args: args.to_vec(),
                started_at,
                finished_at: Instant::now(),
            });

        if let Some(message) = &self.fail_with {
            anyhow::bail!("{}", message);
        }
        Ok(())
    }
}
