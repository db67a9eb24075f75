//! Runs one execution as one OS process.
//!
//! Whatever ends the process (exit, crash, timeout, cancellation, spawn
//! failure) the executor cleans up the environment and releases the account
//! before it records the terminal status and returns.

mod stream;

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::ExecutionConfig;
use crate::core::ephemeral::{EnvironmentHandle, PreparedEnvironment};
use crate::core::error::{CoreError, CoreResult};
use crate::core::pool::{AccountLease, AccountPool};
use crate::core::tracker::{EventKind, ExecutionStatus, ExecutionTracker, TransitionDetail};
use crate::platform::{NativePlatform, Platform};

pub use stream::{LineClassifier, LineReader, MAX_LINE_BYTES, StreamLine, ToolCall};

/// Everything one run consumes. The environment guard and the lease are
/// owned here so they are released even if the run future is dropped.
pub struct ExecutionJob {
    pub execution_id: String,
    pub prompt: String,
    pub environment: PreparedEnvironment,
    pub lease: AccountLease,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub output: String,
    pub tool_calls: Vec<ToolCall>,
}

enum Finish {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

#[derive(Default)]
struct Collected {
    output: Vec<String>,
    tool_calls: Vec<ToolCall>,
}

pub struct ProcessExecutor {
    config: ExecutionConfig,
    tracker: Arc<ExecutionTracker>,
    pool: AccountPool,
    classifier: LineClassifier,
}

impl ProcessExecutor {
    pub fn new(
        config: ExecutionConfig,
        tracker: Arc<ExecutionTracker>,
        pool: AccountPool,
    ) -> CoreResult<Self> {
        Ok(Self {
            config,
            tracker,
            pool,
            classifier: LineClassifier::new()?,
        })
    }

    /// Completed and cancelled runs return `Ok`; timeouts, crashes and spawn
    /// failures return the error after the execution is marked failed.
    pub async fn run(&self, job: ExecutionJob) -> CoreResult<ExecutionOutcome> {
        let ExecutionJob {
            execution_id,
            prompt,
            environment,
            lease,
            cancel,
        } = job;
        let PreparedEnvironment { handle, guard } = environment;
        let mut collected = Collected::default();

        let result = if cancel.is_cancelled() {
            Ok(Finish::Cancelled)
        } else {
            match self
                .tracker
                .transition(&execution_id, ExecutionStatus::Running, TransitionDetail::default())
                .await
            {
                Ok(_) => {
                    self.drive(&execution_id, &prompt, &handle, &lease, &cancel, &mut collected)
                        .await
                }
                Err(e) => Err(e),
            }
        };

        if let Err(e) = guard.cleanup() {
            error!("Execution [{}]: {}", execution_id, e);
        }
        self.pool.release(lease);

        self.finish(&execution_id, result, collected, &handle).await
    }

    async fn drive(
        &self,
        execution_id: &str,
        prompt: &str,
        handle: &EnvironmentHandle,
        lease: &AccountLease,
        cancel: &CancellationToken,
        collected: &mut Collected,
    ) -> CoreResult<Finish> {
        let mut child = self.spawn(handle)?;
        info!(
            "Execution [{}] started {} (pid {:?}) on account [{}]",
            execution_id,
            self.config.program,
            child.id(),
            lease.account_id()
        );

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!("Execution [{}] could not write prompt: {}", execution_id, e);
            }
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::ProcessSpawnError("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoreError::ProcessSpawnError("stderr not captured".to_string()))?;
        let mut out_lines = LineReader::new(stdout, MAX_LINE_BYTES);
        let mut err_lines = LineReader::new(stderr, MAX_LINE_BYTES);
        let mut out_open = true;
        let mut err_open = true;

        let deadline = tokio::time::sleep(self.config.timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                line = out_lines.next_line(), if out_open => match line {
                    Ok(Some(line)) => {
                        self.handle_line(execution_id, "stdout", &line, handle, lease, collected).await;
                    }
                    Ok(None) => out_open = false,
                    Err(e) => {
                        warn!("Execution [{}] stdout unreadable: {}", execution_id, e);
                        out_open = false;
                    }
                },
                line = err_lines.next_line(), if err_open => match line {
                    Ok(Some(line)) => {
                        self.handle_line(execution_id, "stderr", &line, handle, lease, collected).await;
                    }
                    Ok(None) => err_open = false,
                    Err(e) => {
                        warn!("Execution [{}] stderr unreadable: {}", execution_id, e);
                        err_open = false;
                    }
                },
                status = child.wait(), if !out_open && !err_open => {
                    return Ok(Finish::Exited(status?));
                }
                _ = &mut deadline => {
                    warn!("Execution [{}] timed out, terminating", execution_id);
                    self.terminate(&mut child).await;
                    return Ok(Finish::TimedOut);
                }
                _ = cancel.cancelled() => {
                    info!("Execution [{}] cancelled, terminating", execution_id);
                    self.terminate(&mut child).await;
                    return Ok(Finish::Cancelled);
                }
            }
        }
    }

    fn spawn(&self, handle: &EnvironmentHandle) -> CoreResult<Child> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .current_dir(handle.dir())
            .env_clear();
        for name in &self.config.passthrough_env {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }
        cmd.envs(handle.env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| {
            CoreError::ProcessSpawnError(format!("{}: {}", self.config.program, e))
        })
    }

    /// Graceful signal first, forced kill once the grace period runs out.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id()
            && let Err(e) = NativePlatform::terminate_process(pid)
        {
            warn!("Graceful termination of pid {} failed: {}", pid, e);
        }
        match tokio::time::timeout(self.config.grace_period(), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Process ignored termination, killing");
                if let Err(e) = child.kill().await {
                    error!("Failed to kill execution process: {}", e);
                }
            }
        }
    }

    async fn handle_line(
        &self,
        execution_id: &str,
        stream: &str,
        line: &str,
        handle: &EnvironmentHandle,
        lease: &AccountLease,
        collected: &mut Collected,
    ) {
        let line = handle.redact(line);
        let event = match self.classifier.classify(&line) {
            StreamLine::ToolCall(call) => {
                collected.tool_calls.push(call.clone());
                EventKind::ToolCall {
                    name: call.name,
                    input: call.input,
                }
            }
            StreamLine::RateLimited { retry_after, text } => {
                self.pool
                    .report_rate_limited(lease.account_id(), retry_after);
                EventKind::Output {
                    stream: stream.to_string(),
                    text,
                }
            }
            StreamLine::Output(text) => {
                if stream == "stdout" {
                    collected.output.push(text.clone());
                }
                EventKind::Output {
                    stream: stream.to_string(),
                    text,
                }
            }
        };
        if let Err(e) = self.tracker.publish(execution_id, event).await {
            error!("Execution [{}] event not recorded: {}", execution_id, e);
        }
    }

    async fn finish(
        &self,
        execution_id: &str,
        result: CoreResult<Finish>,
        collected: Collected,
        handle: &EnvironmentHandle,
    ) -> CoreResult<ExecutionOutcome> {
        let output = collected.output.join("\n");
        let failure = match result {
            Ok(Finish::Exited(status)) if status.success() => {
                self.record(
                    execution_id,
                    ExecutionStatus::Completed,
                    TransitionDetail::output(output.clone()),
                )
                .await;
                info!("Execution [{}] completed", execution_id);
                return Ok(ExecutionOutcome {
                    execution_id: execution_id.to_string(),
                    status: ExecutionStatus::Completed,
                    output,
                    tool_calls: collected.tool_calls,
                });
            }
            Ok(Finish::Cancelled) => {
                let mut detail = TransitionDetail::output(output.clone());
                detail.error_kind = Some("cancelled".to_string());
                self.record(execution_id, ExecutionStatus::Cancelled, detail)
                    .await;
                return Ok(ExecutionOutcome {
                    execution_id: execution_id.to_string(),
                    status: ExecutionStatus::Cancelled,
                    output,
                    tool_calls: collected.tool_calls,
                });
            }
            Ok(Finish::Exited(status)) => CoreError::ProcessCrashed {
                code: status.code(),
            },
            Ok(Finish::TimedOut) => CoreError::ExecutionTimeout {
                timeout_secs: self.config.timeout_secs,
            },
            Err(e) => e,
        };

        warn!("Execution [{}] failed: {}", execution_id, failure);
        let message = handle.redact(&failure.to_string());
        if let Err(e) = self
            .tracker
            .publish(
                execution_id,
                EventKind::Error {
                    kind: failure.kind().to_string(),
                    message: message.clone(),
                },
            )
            .await
        {
            error!("Execution [{}] event not recorded: {}", execution_id, e);
        }
        let detail = TransitionDetail {
            output: (!output.is_empty()).then_some(output),
            error_kind: Some(failure.kind().to_string()),
            error: Some(message),
        };
        self.record(execution_id, ExecutionStatus::Failed, detail)
            .await;
        Err(failure)
    }

    async fn record(&self, execution_id: &str, to: ExecutionStatus, detail: TransitionDetail) {
        if let Err(e) = self.tracker.transition(execution_id, to, detail).await {
            error!(
                "Execution [{}] could not be marked {}: {}",
                execution_id,
                to.as_str(),
                e
            );
        }
    }
}

#[cfg(all(test, unix))]
mod tests;
