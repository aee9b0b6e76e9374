//! Subprocess spawning with output teeing and timeout enforcement.
//!
//! The pipe spawner runs the agent CLI with separate stdout/stderr pipes,
//! tees every chunk to the attempt's output file and to a chunk callback
//! (which feeds `agent_response` events), and escalates SIGTERM to
//! SIGKILL when the effective timeout or a cancellation fires.
//!
//! A [`PtySpawner`] implementation can be injected to run the child under
//! a pseudo-terminal instead, so stdout and stderr arrive merged and
//! line-buffered. None ships in-tree; pipes are the default.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::DroverError;

/// Cap on output retained in memory; the output file holds the full text.
const COLLECTED_OUTPUT_CAP: usize = 256 * 1024;

/// Everything needed to run one agent CLI attempt.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Environment overrides, applied in order on top of the process env.
    pub env: Vec<(String, String)>,
    /// Written to stdin and closed, for stdin-delivery invokers.
    pub stdin_payload: Option<String>,
    pub nice: i32,
    pub working_dir: Option<PathBuf>,
    pub output_file: PathBuf,
    pub timeout: Duration,
    /// Window between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

/// What happened to one spawned attempt.
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub pid: u32,
    /// `None` when the child died to a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
    /// Collected output (stdout + stderr interleaved), capped in size.
    pub output: String,
}

/// Callback invoked with each output chunk as it arrives.
pub type ChunkFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked once with the child's pid, right after spawn.
pub type SpawnedFn = Box<dyn FnOnce(u32) + Send>;

/// Alternate spawner that merges stdout/stderr under a pseudo-terminal.
#[async_trait]
pub trait PtySpawner: Send + Sync {
    fn is_available(&self) -> bool;

    async fn spawn(
        &self,
        spec: &SpawnSpec,
        on_chunk: ChunkFn,
        on_spawned: SpawnedFn,
        cancel: &CancellationToken,
    ) -> Result<SpawnOutcome, DroverError>;
}

/// Send SIGTERM, wait out the grace period, then SIGKILL.
async fn graceful_kill(
    child: &mut tokio::process::Child,
    pid: u32,
    grace: Duration,
) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        // SAFETY: pid belongs to a child we spawned and still own.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            tracing::warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(pid, "process exited after SIGTERM");
            Some(status)
        }
        _ => {
            tracing::debug!(pid, "process survived SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}

async fn pump<R>(
    mut reader: R,
    file: Arc<tokio::sync::Mutex<tokio::fs::File>>,
    collected: Arc<std::sync::Mutex<Vec<u8>>>,
    on_chunk: ChunkFn,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "error reading agent output");
                break;
            }
        };

        {
            let mut f = file.lock().await;
            if let Err(e) = f.write_all(&buf[..n]).await {
                tracing::warn!(error = %e, "failed to append agent output to log file");
            }
            let _ = f.flush().await;
        }

        {
            let mut out = collected.lock().unwrap_or_else(|e| e.into_inner());
            let room = COLLECTED_OUTPUT_CAP.saturating_sub(out.len());
            out.extend_from_slice(&buf[..n.min(room)]);
        }

        on_chunk(&buf[..n]);
    }
}

/// Spawn with separate pipes, tee output, and enforce the timeout.
pub async fn spawn_piped(
    spec: &SpawnSpec,
    on_chunk: ChunkFn,
    on_spawned: SpawnedFn,
    cancel: &CancellationToken,
) -> Result<SpawnOutcome, DroverError> {
    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(if spec.stdin_payload.is_some() {
        std::process::Stdio::piped()
    } else {
        std::process::Stdio::null()
    });
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    #[cfg(unix)]
    {
        let nice = spec.nice;
        if nice != 0 {
            // SAFETY: setpriority is async-signal-safe and only touches
            // the forked child.
            unsafe {
                cmd.pre_exec(move || {
                    libc::setpriority(libc::PRIO_PROCESS, 0, nice);
                    Ok(())
                });
            }
        }
    }

    let mut child = cmd.spawn().map_err(|e| DroverError::SpawnFailed {
        reason: format!("{}: {e}", spec.program.display()),
    })?;
    let pid = child.id().ok_or_else(|| DroverError::SpawnFailed {
        reason: "child process has no pid".to_string(),
    })?;
    on_spawned(pid);

    // Deliver the prompt and close stdin so the CLI starts processing.
    if let Some(payload) = &spec.stdin_payload {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                tracing::warn!(pid, error = %e, "failed to write prompt to agent stdin");
            }
            drop(stdin);
        }
    }

    if let Some(parent) = spec.output_file.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DroverError::SpawnFailed {
                reason: format!("cannot create log directory {}: {e}", parent.display()),
            })?;
    }
    let file = tokio::fs::File::create(&spec.output_file)
        .await
        .map_err(|e| DroverError::SpawnFailed {
            reason: format!("cannot create output file {}: {e}", spec.output_file.display()),
        })?;
    let file = Arc::new(tokio::sync::Mutex::new(file));
    let collected = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(
            stdout,
            Arc::clone(&file),
            Arc::clone(&collected),
            Arc::clone(&on_chunk),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(
            stderr,
            Arc::clone(&file),
            Arc::clone(&collected),
            Arc::clone(&on_chunk),
        )));
    }

    let started = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;

    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = tokio::time::sleep(spec.timeout) => {
            timed_out = true;
            graceful_kill(&mut child, pid, spec.kill_grace).await
        }
        _ = cancel.cancelled() => {
            cancelled = true;
            graceful_kill(&mut child, pid, spec.kill_grace).await
        }
    };

    // Let the pumps drain whatever is left in the pipes.
    for pump in pumps {
        let _ = pump.await;
    }

    let output = {
        let collected = collected.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&collected).into_owned()
    };

    Ok(SpawnOutcome {
        pid,
        exit_code: status.and_then(|s| s.code()),
        timed_out,
        cancelled,
        duration: started.elapsed(),
        output,
    })
}
