//! Entry point for work: permission checks, per-agent concurrency, the
//! configure → reserve → execute pipeline, delegation and escalation.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::agent::{Agent, AgentDirectory, EffectivePermissions, Permission, resolve_permissions};
use crate::core::config::SupervisorConfig;
use crate::core::ephemeral::ConfigGenerator;
use crate::core::error::{CoreError, CoreResult};
use crate::core::executor::{ExecutionJob, ExecutionOutcome, ProcessExecutor};
use crate::core::pool::AccountPool;
use crate::core::tracker::{
    EventKind, Execution, ExecutionStatus, ExecutionTracker, NewExecution, TransitionDetail,
};

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub agent_id: String,
    pub task: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// A submitted execution. The id is valid immediately; `wait` resolves once
/// the run and its teardown are finished.
pub struct ExecutionHandle {
    pub execution_id: String,
    cancel: CancellationToken,
    task: JoinHandle<CoreResult<ExecutionOutcome>>,
}

impl ExecutionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> CoreResult<ExecutionOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Execution task aborted: {}", e);
                Err(CoreError::ProcessCrashed { code: None })
            }
        }
    }
}

struct AgentSlots {
    size: usize,
    semaphore: Arc<Semaphore>,
}

struct Inner {
    agents: Arc<AgentDirectory>,
    tracker: Arc<ExecutionTracker>,
    generator: Arc<ConfigGenerator>,
    pool: AccountPool,
    executor: Arc<ProcessExecutor>,
    config: SupervisorConfig,
    slots: StdMutex<HashMap<String, AgentSlots>>,
    active: StdMutex<HashMap<String, CancellationToken>>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        agents: Arc<AgentDirectory>,
        tracker: Arc<ExecutionTracker>,
        generator: Arc<ConfigGenerator>,
        pool: AccountPool,
        executor: Arc<ProcessExecutor>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agents,
                tracker,
                generator,
                pool,
                executor,
                config,
                slots: StdMutex::new(HashMap::new()),
                active: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn resolve_permissions(&self, agent_id: &str) -> CoreResult<EffectivePermissions> {
        let agent = self.inner.agents.get(agent_id).await?;
        Ok(resolve_permissions(&agent))
    }

    /// Check permissions, record a pending execution and start the pipeline
    /// in the background.
    pub async fn submit(&self, request: SubmitRequest) -> CoreResult<ExecutionHandle> {
        let agent = self.inner.agents.get(&request.agent_id).await?;
        let permissions = ensure_runnable(&agent)?;
        self.start(agent, permissions, request.task, request.parent_id)
            .await
    }

    /// Hand a task to `to_agent_id`, which must be the delegator or sit
    /// below it in the hierarchy.
    pub async fn delegate(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        task: &str,
    ) -> CoreResult<ExecutionHandle> {
        let from = self.inner.agents.get(from_agent_id).await?;
        ensure_runnable(&from)?.require(Permission::Delegate, from_agent_id)?;
        if !self
            .inner
            .agents
            .is_self_or_descendant(from_agent_id, to_agent_id)
            .await
        {
            return Err(CoreError::PermissionDenied(format!(
                "agent '{}' may only delegate within its own subtree, '{}' is outside it",
                from_agent_id, to_agent_id
            )));
        }
        let to = self.inner.agents.get(to_agent_id).await?;
        let permissions = ensure_runnable(&to)?;
        info!("Agent [{}] delegated a task to [{}]", from_agent_id, to_agent_id);
        self.start(to, permissions, task.to_string(), None).await
    }

    /// Route a task one level up. When `failed_execution_id` is given, that
    /// execution moves `failed → escalated` and becomes the parent of the
    /// manager's execution.
    pub async fn escalate(
        &self,
        agent_id: &str,
        task: &str,
        reason: &str,
        failed_execution_id: Option<&str>,
    ) -> CoreResult<ExecutionHandle> {
        let agent = self.inner.agents.get(agent_id).await?;
        resolve_permissions(&agent).require(Permission::Escalate, agent_id)?;
        let manager = self
            .inner
            .agents
            .manager_of(agent_id)
            .await?
            .ok_or_else(|| CoreError::NoEscalationTarget {
                agent_id: agent_id.to_string(),
            })?;
        let permissions = ensure_runnable(&manager)?;

        if let Some(failed_id) = failed_execution_id {
            let failed = self.inner.tracker.get(failed_id).await?;
            if failed.agent_id != agent_id {
                return Err(CoreError::PermissionDenied(format!(
                    "execution '{}' does not belong to agent '{}'",
                    failed_id, agent_id
                )));
            }
            self.inner
                .tracker
                .transition(failed_id, ExecutionStatus::Escalated, TransitionDetail::default())
                .await?;
        }

        info!(
            "Escalating task from [{}] to manager [{}]: {}",
            agent_id, manager.id, reason
        );
        let escalated_task = format!(
            "Escalated by {} ({}).\n\n{}",
            agent_id, reason, task
        );
        self.start(
            manager,
            permissions,
            escalated_task,
            failed_execution_id.map(str::to_string),
        )
        .await
    }

    /// Signal cancellation. Returns false when the execution already finished.
    pub async fn cancel(&self, execution_id: &str) -> CoreResult<bool> {
        let token = lock(&self.inner.active).get(execution_id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                info!("Cancellation requested for execution [{}]", execution_id);
                Ok(true)
            }
            None => {
                self.inner.tracker.get(execution_id).await?;
                Ok(false)
            }
        }
    }

    /// Cancel every live execution and wait up to `grace` for their
    /// teardown. Returns how many were still running when time ran out.
    pub async fn shutdown(&self, grace: std::time::Duration) -> usize {
        let tokens: Vec<CancellationToken> =
            lock(&self.inner.active).values().cloned().collect();
        if tokens.is_empty() {
            return 0;
        }
        info!("Cancelling {} live executions", tokens.len());
        for token in &tokens {
            token.cancel();
        }
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = lock(&self.inner.active).len();
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                if remaining > 0 {
                    warn!("{} executions still tearing down at shutdown", remaining);
                }
                return remaining;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    async fn start(
        &self,
        agent: Agent,
        permissions: EffectivePermissions,
        task: String,
        parent_id: Option<String>,
    ) -> CoreResult<ExecutionHandle> {
        let snapshot = serde_json::json!({
            "agent": agent,
            "permissions": permissions,
        });
        let execution = self
            .inner
            .tracker
            .create(NewExecution {
                agent_id: agent.id.clone(),
                organization_id: agent.organization_id.clone(),
                parent_id,
                task: task.clone(),
                config_snapshot: snapshot,
            })
            .await?;

        let cancel = CancellationToken::new();
        lock(&self.inner.active).insert(execution.id.clone(), cancel.clone());

        let supervisor = self.clone();
        let execution_id = execution.id.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let result = supervisor
                .pipeline(&agent, &execution_id, &task, token)
                .await;
            lock(&supervisor.inner.active).remove(&execution_id);
            if let Err(e) = &result
                && supervisor.inner.config.auto_escalate
                && e.is_recoverable()
            {
                supervisor.spawn_auto_escalation(agent.id.clone(), execution_id.clone(), task, e.kind());
            }
            result
        });

        Ok(ExecutionHandle {
            execution_id: execution.id,
            cancel,
            task,
        })
    }

    async fn pipeline(
        &self,
        agent: &Agent,
        execution_id: &str,
        task: &str,
        cancel: CancellationToken,
    ) -> CoreResult<ExecutionOutcome> {
        let Some(_permit) = self.acquire_slot(agent, execution_id, &cancel).await? else {
            return self.cancelled_before_start(execution_id).await;
        };

        // Configuration errors surface before any account is reserved.
        let environment = match self.inner.generator.prepare(agent, execution_id).await {
            Ok(environment) => environment,
            Err(e) => return self.fail_before_start(execution_id, e).await,
        };

        let lease = tokio::select! {
            lease = self.inner.pool.reserve(&agent.organization_id, agent.account_affinity.as_deref()) => lease,
            _ = cancel.cancelled() => {
                if let Err(e) = environment.guard.cleanup() {
                    error!("Execution [{}]: {}", execution_id, e);
                }
                return self.cancelled_before_start(execution_id).await;
            }
        };
        let lease = match lease {
            Ok(lease) => lease,
            Err(e) => {
                if let Err(cleanup) = environment.guard.cleanup() {
                    error!("Execution [{}]: {}", execution_id, cleanup);
                }
                return self.fail_before_start(execution_id, e).await;
            }
        };
        if let Err(e) = self
            .inner
            .tracker
            .bind_account(execution_id, lease.account_id())
            .await
        {
            warn!("Execution [{}] account not recorded: {}", execution_id, e);
        }

        self.inner
            .executor
            .run(ExecutionJob {
                execution_id: execution_id.to_string(),
                prompt: task.to_string(),
                environment,
                lease,
                cancel,
            })
            .await
    }

    /// FIFO wait for one of the agent's `max_concurrency` slots. `None` means
    /// the execution was cancelled while queued.
    async fn acquire_slot(
        &self,
        agent: &Agent,
        execution_id: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Option<OwnedSemaphorePermit>> {
        let semaphore = {
            let mut slots = lock(&self.inner.slots);
            let entry = slots
                .entry(agent.id.clone())
                .or_insert_with(|| AgentSlots {
                    size: agent.max_concurrency,
                    semaphore: Arc::new(Semaphore::new(agent.max_concurrency)),
                });
            if entry.size != agent.max_concurrency {
                resize_slots(&entry.semaphore, entry.size, agent.max_concurrency);
                entry.size = agent.max_concurrency;
            }
            entry.semaphore.clone()
        };

        if let Ok(permit) = semaphore.clone().try_acquire_owned() {
            return Ok(Some(permit));
        }

        self.inner
            .tracker
            .publish(
                execution_id,
                EventKind::Progress {
                    message: format!(
                        "queued: agent '{}' is at its concurrency limit of {}",
                        agent.id, agent.max_concurrency
                    ),
                },
            )
            .await?;

        tokio::select! {
            permit = semaphore.acquire_owned() => permit
                .map(Some)
                .map_err(|_| CoreError::Config("agent concurrency slots closed".to_string())),
            _ = cancel.cancelled() => Ok(None),
        }
    }

    async fn cancelled_before_start(&self, execution_id: &str) -> CoreResult<ExecutionOutcome> {
        self.inner
            .tracker
            .transition(
                execution_id,
                ExecutionStatus::Cancelled,
                TransitionDetail::default(),
            )
            .await?;
        Ok(ExecutionOutcome {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Cancelled,
            output: String::new(),
            tool_calls: Vec::new(),
        })
    }

    async fn fail_before_start(
        &self,
        execution_id: &str,
        err: CoreError,
    ) -> CoreResult<ExecutionOutcome> {
        warn!("Execution [{}] failed before start: {}", execution_id, err);
        if let Err(e) = self
            .inner
            .tracker
            .transition(execution_id, ExecutionStatus::Failed, TransitionDetail::error(&err))
            .await
        {
            error!("Execution [{}] could not be marked failed: {}", execution_id, e);
        }
        Err(err)
    }

    /// Escalation runs as its own task so the original execution's result
    /// is not held up by the manager's run.
    fn spawn_auto_escalation(
        &self,
        agent_id: String,
        execution_id: String,
        task: String,
        reason: &'static str,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            match supervisor
                .escalate(&agent_id, &task, reason, Some(&execution_id))
                .await
            {
                Ok(handle) => info!(
                    "Execution [{}] auto-escalated as [{}]",
                    execution_id, handle.execution_id
                ),
                Err(CoreError::NoEscalationTarget { .. }) => {}
                Err(e) => warn!("Auto-escalation of [{}] failed: {}", execution_id, e),
            }
        });
    }

    pub async fn get_execution(&self, execution_id: &str) -> CoreResult<Execution> {
        self.inner.tracker.get(execution_id).await
    }
}

fn ensure_runnable(agent: &Agent) -> CoreResult<EffectivePermissions> {
    if agent.archived {
        return Err(CoreError::PermissionDenied(format!(
            "agent '{}' is archived",
            agent.id
        )));
    }
    let permissions = resolve_permissions(agent);
    permissions.require(Permission::Execute, &agent.id)?;
    Ok(permissions)
}

/// Resize in place so permits held by running executions still count
/// against the new limit.
fn resize_slots(semaphore: &Arc<Semaphore>, from: usize, to: usize) {
    if to >= from {
        semaphore.add_permits(to - from);
        return;
    }
    let excess = from - to;
    let owed = excess - semaphore.forget_permits(excess);
    if owed > 0 {
        // Queued ahead of later waiters, so returned permits are retired first.
        let semaphore = semaphore.clone();
        let owed = u32::try_from(owed).unwrap_or(u32::MAX);
        tokio::spawn(async move {
            if let Ok(permits) = semaphore.acquire_many_owned(owed).await {
                permits.forget();
            }
        });
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
