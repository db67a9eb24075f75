use super::*;
use crate::core::agent::Agent;
use crate::core::config::{ExhaustedPolicy, PoolConfig};
use crate::core::ephemeral::ConfigGenerator;
use crate::core::pool::AccountSpec;
use crate::core::tracker::NewExecution;
use crate::core::vault::{CredentialPayload, CredentialVault, KeyRing, MasterSecret, NewCredential};
use rusqlite::Connection;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Harness {
    _tmp: tempfile::TempDir,
    generator: ConfigGenerator,
    vault: Arc<CredentialVault>,
    tracker: Arc<ExecutionTracker>,
    pool: AccountPool,
    agent: Agent,
}

async fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
    let vault = Arc::new(CredentialVault::new(
        db.clone(),
        KeyRing::new(MasterSecret::new(b"k".to_vec()), 1_000),
    ));
    vault.initialize().await.unwrap();
    let tracker = Arc::new(ExecutionTracker::new(db));
    tracker.initialize().await.unwrap();
    let pool = AccountPool::new(PoolConfig {
        exhausted_policy: ExhaustedPolicy::Fail,
        ..PoolConfig::default()
    });
    pool.provision(AccountSpec {
        id: "acct-1".into(),
        organization_id: "org".into(),
        max_concurrency: 1,
    })
    .unwrap();
    let generator = ConfigGenerator::new(
        tmp.path().join("executions"),
        vault.clone(),
        "base".to_string(),
    );
    let mut agent = Agent::new("eng", "org");
    agent.providers = vec!["github".into()];
    Harness {
        _tmp: tmp,
        generator,
        vault,
        tracker,
        pool,
        agent,
    }
}

fn executor(h: &Harness, script: &str, timeout_secs: u64) -> ProcessExecutor {
    ProcessExecutor::new(
        ExecutionConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout_secs,
            grace_period_secs: 5,
            passthrough_env: Vec::new(),
        },
        h.tracker.clone(),
        h.pool.clone(),
    )
    .unwrap()
}

async fn job(h: &Harness, prompt: &str) -> (ExecutionJob, CancellationToken) {
    let exec = h
        .tracker
        .create(NewExecution {
            agent_id: h.agent.id.clone(),
            organization_id: "org".into(),
            parent_id: None,
            task: prompt.into(),
            config_snapshot: serde_json::json!({}),
        })
        .await
        .unwrap();
    let environment = h.generator.prepare(&h.agent, &exec.id).await.unwrap();
    let lease = h.pool.reserve("org", None).await.unwrap();
    h.tracker
        .bind_account(&exec.id, lease.account_id())
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    (
        ExecutionJob {
            execution_id: exec.id,
            prompt: prompt.into(),
            environment,
            lease,
            cancel: cancel.clone(),
        },
        cancel,
    )
}

fn assert_torn_down_once(h: &Harness) {
    assert_eq!(h.generator.cleanup_count(), 1, "cleanup must run exactly once");
    assert_eq!(h.pool.release_count(), 1, "account must be released exactly once");
    assert_eq!(h.pool.snapshot("org")[0].in_flight, 0);
}

#[tokio::test]
async fn successful_run_streams_output_and_tool_calls() {
    let h = harness().await;
    let exec = executor(
        &h,
        r#"task=$(cat); echo "working on $task"; echo '{"type":"tool_use","name":"bash","input":{"cmd":"ls"}}'"#,
        30,
    );
    let (job, _) = job(&h, "ship it").await;
    let id = job.execution_id.clone();
    let dir = job.environment.handle.dir().to_path_buf();

    let outcome = exec.run(job).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.output, "working on ship it");
    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.tool_calls[0].name, "bash");
    assert!(!dir.exists());
    assert_torn_down_once(&h);

    let record = h.tracker.get(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.account_id.as_deref(), Some("acct-1"));
    let transcript = h.tracker.transcript(&id).await.unwrap();
    assert!(transcript.contains("[tool] bash"));
}

#[tokio::test]
async fn crash_is_reported_and_torn_down() {
    let h = harness().await;
    let exec = executor(&h, "echo partial; exit 3", 30);
    let (job, _) = job(&h, "x").await;
    let id = job.execution_id.clone();

    let err = exec.run(job).await.unwrap_err();
    assert!(matches!(err, CoreError::ProcessCrashed { code: Some(3) }));
    assert_torn_down_once(&h);

    let record = h.tracker.get(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_kind.as_deref(), Some("process_crashed"));
    assert_eq!(record.output.as_deref(), Some("partial"));
}

#[tokio::test]
async fn invalid_utf8_and_bulk_output_do_not_stall_the_run() {
    let h = harness().await;
    let exec = executor(
        &h,
        r"printf 'ok\n\377\n'; head -c 262144 /dev/zero | tr '\0' a; echo done",
        10,
    );
    let (job, _) = job(&h, "x").await;

    let outcome = exec.run(job).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    let lines: Vec<&str> = outcome.output.lines().collect();
    assert_eq!(lines[0], "ok");
    assert_eq!(lines[1], "\u{FFFD}");
    assert!(lines.iter().all(|l| l.len() <= MAX_LINE_BYTES));
    assert!(outcome.output.ends_with("done"));
    assert_eq!(outcome.output.matches('a').count(), 262_144);
    assert_torn_down_once(&h);
}

#[tokio::test]
async fn timeout_terminates_the_process() {
    let h = harness().await;
    let exec = executor(&h, "exec sleep 30", 1);
    let (job, _) = job(&h, "x").await;
    let id = job.execution_id.clone();

    let started = Instant::now();
    let err = exec.run(job).await.unwrap_err();
    assert!(matches!(err, CoreError::ExecutionTimeout { timeout_secs: 1 }));
    assert!(started.elapsed() < Duration::from_secs(15));
    assert_torn_down_once(&h);
    assert_eq!(
        h.tracker.get(&id).await.unwrap().status,
        ExecutionStatus::Failed
    );
}

#[tokio::test]
async fn cancellation_stops_a_running_process() {
    let h = harness().await;
    let exec = executor(&h, "exec sleep 30", 60);
    let (job, cancel) = job(&h, "x").await;
    let id = job.execution_id.clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let outcome = exec.run(job).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Cancelled);
    assert_torn_down_once(&h);
    assert_eq!(
        h.tracker.get(&id).await.unwrap().status,
        ExecutionStatus::Cancelled
    );
}

#[tokio::test]
async fn cancellation_before_start_never_spawns() {
    let h = harness().await;
    let exec = executor(&h, "echo should-not-run", 30);
    let (job, cancel) = job(&h, "x").await;
    let id = job.execution_id.clone();
    cancel.cancel();

    let outcome = exec.run(job).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Cancelled);
    assert!(outcome.output.is_empty());
    assert_torn_down_once(&h);
    assert_eq!(
        h.tracker.get(&id).await.unwrap().status,
        ExecutionStatus::Cancelled
    );
}

#[tokio::test]
async fn spawn_failure_still_tears_down() {
    let h = harness().await;
    let exec = ProcessExecutor::new(
        ExecutionConfig {
            program: "/nonexistent/conductor-agent-binary".into(),
            args: Vec::new(),
            timeout_secs: 30,
            grace_period_secs: 1,
            passthrough_env: Vec::new(),
        },
        h.tracker.clone(),
        h.pool.clone(),
    )
    .unwrap();
    let (job, _) = job(&h, "x").await;
    let id = job.execution_id.clone();

    let err = exec.run(job).await.unwrap_err();
    assert!(matches!(err, CoreError::ProcessSpawnError(_)));
    assert_torn_down_once(&h);
    assert_eq!(
        h.tracker.get(&id).await.unwrap().error_kind.as_deref(),
        Some("process_spawn_error")
    );
}

#[tokio::test]
async fn rate_limit_signal_cools_the_account_down() {
    let h = harness().await;
    let exec = executor(
        &h,
        r#"echo '{"type":"rate_limit","retry_after_secs":120}'"#,
        30,
    );
    let (job, _) = job(&h, "x").await;
    exec.run(job).await.unwrap();

    let snap = &h.pool.snapshot("org")[0];
    assert!(snap.rate_limited);
    assert!(snap.cooldown_remaining_ms.unwrap() > 60_000);
}

#[tokio::test]
async fn injected_secrets_never_reach_the_event_log() {
    let h = harness().await;
    h.vault
        .store(
            "eng",
            "github",
            NewCredential::new(CredentialPayload::api_key("tok_abc123")),
        )
        .await
        .unwrap();
    let exec = executor(&h, r#"echo "key=$GITHUB_API_KEY home=$HOME""#, 30);
    let (job, _) = job(&h, "x").await;
    let id = job.execution_id.clone();

    let outcome = exec.run(job).await.unwrap();
    assert!(outcome.output.starts_with("key=[REDACTED] home="));
    assert!(outcome.output.contains("exec-"));

    let events = h.tracker.events(&id, 0, 100).await.unwrap();
    let serialized = serde_json::to_string(&events).unwrap();
    assert!(!serialized.contains("tok_abc123"));
    let record = serde_json::to_string(&h.tracker.get(&id).await.unwrap()).unwrap();
    assert!(!record.contains("tok_abc123"));
}
