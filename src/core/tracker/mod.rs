//! Execution records, the lifecycle state machine and the append-only event
//! log. Every event is persisted before it is broadcast to live subscribers.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::core::error::{CoreError, CoreResult};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Escalated,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Escalated => "escalated",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            "escalated" => Some(ExecutionStatus::Escalated),
            _ => None,
        }
    }

    /// No further work will happen for this execution.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Escalated
        )
    }
}

pub fn can_transition(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    match from {
        ExecutionStatus::Pending => matches!(
            to,
            ExecutionStatus::Running | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        ),
        ExecutionStatus::Running => matches!(
            to,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        ),
        ExecutionStatus::Failed => to == ExecutionStatus::Escalated,
        ExecutionStatus::Completed | ExecutionStatus::Cancelled | ExecutionStatus::Escalated => {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Status {
        from: Option<ExecutionStatus>,
        to: ExecutionStatus,
    },
    Output {
        stream: String,
        text: String,
    },
    ToolCall {
        name: String,
        input: serde_json::Value,
    },
    Progress {
        message: String,
    },
    Error {
        kind: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub seq: i64,
    pub execution_id: String,
    pub agent_id: String,
    pub organization_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: String,
    pub agent_id: String,
    pub organization_id: String,
    pub parent_id: Option<String>,
    pub task: String,
    pub status: ExecutionStatus,
    pub account_id: Option<String>,
    pub config_snapshot: Option<serde_json::Value>,
    pub output: Option<String>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct NewExecution {
    pub agent_id: String,
    pub organization_id: String,
    pub parent_id: Option<String>,
    pub task: String,
    pub config_snapshot: serde_json::Value,
}

/// Terminal details recorded alongside a transition.
#[derive(Debug, Default)]
pub struct TransitionDetail {
    pub output: Option<String>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

impl TransitionDetail {
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn error(err: &CoreError) -> Self {
        Self {
            output: None,
            error_kind: Some(err.kind().to_string()),
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Organization(String),
    Agent(String),
    Execution(String),
}

impl Scope {
    pub fn matches(&self, event: &ExecutionEvent) -> bool {
        match self {
            Scope::Organization(id) => &event.organization_id == id,
            Scope::Agent(id) => &event.agent_id == id,
            Scope::Execution(id) => &event.execution_id == id,
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = ExecutionEvent> + Send>>;

pub struct ExecutionTracker {
    db: Arc<Mutex<Connection>>,
    events: broadcast::Sender<ExecutionEvent>,
}

const EXECUTION_COLUMNS: &str = "id, agent_id, organization_id, parent_id, task, status, account_id, config_snapshot, output, error_kind, error, created_at, updated_at";

impl ExecutionTracker {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { db, events }
    }

    pub async fn initialize(&self) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                parent_id TEXT,
                task TEXT NOT NULL,
                status TEXT NOT NULL,
                account_id TEXT,
                config_snapshot TEXT,
                output TEXT,
                error_kind TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_executions_agent ON executions(agent_id, created_at);

            CREATE TRIGGER IF NOT EXISTS executions_snapshot_write_once
            BEFORE UPDATE OF config_snapshot ON executions
            WHEN OLD.config_snapshot IS NOT NULL AND NEW.config_snapshot IS NOT OLD.config_snapshot
            BEGIN
                SELECT RAISE(ABORT, 'config snapshot is write-once');
            END;

            CREATE TABLE IF NOT EXISTS execution_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                at TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_execution ON execution_events(execution_id, seq);

            CREATE TRIGGER IF NOT EXISTS execution_events_no_update
            BEFORE UPDATE ON execution_events
            BEGIN
                SELECT RAISE(ABORT, 'execution events are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS execution_events_no_delete
            BEFORE DELETE ON execution_events
            BEGIN
                SELECT RAISE(ABORT, 'execution events are append-only');
            END;",
        )?;
        Ok(())
    }

    pub async fn create(&self, new: NewExecution) -> CoreResult<Execution> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let snapshot = serde_json::to_string(&new.config_snapshot)?;
        {
            let db = self.db.lock().await;
            db.execute(
                "INSERT INTO executions (id, agent_id, organization_id, parent_id, task, status, config_snapshot, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id,
                    new.agent_id,
                    new.organization_id,
                    new.parent_id,
                    new.task,
                    ExecutionStatus::Pending.as_str(),
                    snapshot,
                    now,
                ],
            )?;
        }
        info!("Created execution [{}] for agent [{}]", id, new.agent_id);
        self.publish(
            &id,
            EventKind::Status {
                from: None,
                to: ExecutionStatus::Pending,
            },
        )
        .await?;
        self.get(&id).await
    }

    /// Move to `to` if the state machine allows it and record the detail.
    pub async fn transition(
        &self,
        execution_id: &str,
        to: ExecutionStatus,
        detail: TransitionDetail,
    ) -> CoreResult<Execution> {
        let from = {
            let db = self.db.lock().await;
            let current: Option<String> = db
                .query_row(
                    "SELECT status FROM executions WHERE id = ?1",
                    params![execution_id],
                    |row| row.get(0),
                )
                .optional()?;
            let current = current
                .ok_or_else(|| CoreError::ExecutionNotFound(execution_id.to_string()))?;
            let from = ExecutionStatus::from_status(&current).ok_or_else(|| {
                CoreError::Config(format!("unknown stored status '{}'", current))
            })?;
            if !can_transition(from, to) {
                return Err(CoreError::InvalidTransition {
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                });
            }
            // Compare-and-set on the status read above.
            let changed = db.execute(
                "UPDATE executions
                 SET status = ?1,
                     output = COALESCE(?2, output),
                     error_kind = COALESCE(?3, error_kind),
                     error = COALESCE(?4, error),
                     updated_at = ?5
                 WHERE id = ?6 AND status = ?7",
                params![
                    to.as_str(),
                    detail.output,
                    detail.error_kind,
                    detail.error,
                    Utc::now().to_rfc3339(),
                    execution_id,
                    from.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(CoreError::InvalidTransition {
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                });
            }
            from
        };

        debug!(
            "Execution [{}] {} -> {}",
            execution_id,
            from.as_str(),
            to.as_str()
        );
        self.publish(
            execution_id,
            EventKind::Status {
                from: Some(from),
                to,
            },
        )
        .await?;
        self.get(execution_id).await
    }

    pub async fn bind_account(&self, execution_id: &str, account_id: &str) -> CoreResult<()> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE executions SET account_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![account_id, Utc::now().to_rfc3339(), execution_id],
        )?;
        if changed == 0 {
            return Err(CoreError::ExecutionNotFound(execution_id.to_string()));
        }
        Ok(())
    }

    /// Append an event and fan it out to subscribers.
    pub async fn publish(&self, execution_id: &str, kind: EventKind) -> CoreResult<ExecutionEvent> {
        let payload = serde_json::to_string(&kind)?;
        let at = Utc::now();
        let event = {
            let db = self.db.lock().await;
            let owner: Option<(String, String)> = db
                .query_row(
                    "SELECT agent_id, organization_id FROM executions WHERE id = ?1",
                    params![execution_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (agent_id, organization_id) =
                owner.ok_or_else(|| CoreError::ExecutionNotFound(execution_id.to_string()))?;
            db.execute(
                "INSERT INTO execution_events (execution_id, agent_id, organization_id, at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![execution_id, agent_id, organization_id, at.to_rfc3339(), payload],
            )?;
            ExecutionEvent {
                seq: db.last_insert_rowid(),
                execution_id: execution_id.to_string(),
                agent_id,
                organization_id,
                at,
                kind,
            }
        };
        // No receivers is fine; the log is the source of truth.
        let _ = self.events.send(event.clone());
        Ok(event)
    }

    /// Live events for one organization, agent or execution.
    pub fn subscribe(&self, scope: Scope) -> EventStream {
        let receiver = self.events.subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(move |msg| match msg {
            Ok(event) if scope.matches(&event) => Some(event),
            Ok(_) => None,
            Err(e) => {
                warn!("Execution event subscriber lagged: {}", e);
                None
            }
        });
        Box::pin(stream)
    }

    pub async fn get(&self, execution_id: &str) -> CoreResult<Execution> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS);
        db.query_row(&sql, params![execution_id], map_execution)
            .optional()?
            .ok_or_else(|| CoreError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Replay persisted events with `seq > after`, oldest first.
    pub async fn events(
        &self,
        execution_id: &str,
        after: i64,
        limit: usize,
    ) -> CoreResult<Vec<ExecutionEvent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT seq, execution_id, agent_id, organization_id, at, payload
             FROM execution_events
             WHERE execution_id = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![execution_id, after, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, execution_id, agent_id, organization_id, at, payload) = row?;
            out.push(ExecutionEvent {
                seq,
                execution_id,
                agent_id,
                organization_id,
                at: DateTime::parse_from_rfc3339(&at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                kind: serde_json::from_str(&payload)?,
            });
        }
        Ok(out)
    }

    /// Human-readable log of an execution: output lines, tool calls and
    /// status changes in order.
    pub async fn transcript(&self, execution_id: &str) -> CoreResult<String> {
        self.get(execution_id).await?;
        let mut out = String::new();
        for event in self.events(execution_id, 0, usize::MAX).await? {
            let line = match event.kind {
                EventKind::Status { to, .. } => format!("[status] {}", to.as_str()),
                EventKind::Output { stream, text } => format!("[{}] {}", stream, text),
                EventKind::ToolCall { name, .. } => format!("[tool] {}", name),
                EventKind::Progress { message } => format!("[progress] {}", message),
                EventKind::Error { kind, message } => format!("[error] {}: {}", kind, message),
            };
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    pub async fn list_for_agent(&self, agent_id: &str, limit: usize) -> CoreResult<Vec<Execution>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM executions WHERE agent_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            EXECUTION_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![agent_id, limit], map_execution)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn map_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(5)?;
    let snapshot: Option<String> = row.get(7)?;
    Ok(Execution {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        organization_id: row.get(2)?,
        parent_id: row.get(3)?,
        task: row.get(4)?,
        status: ExecutionStatus::from_status(&status).unwrap_or(ExecutionStatus::Failed),
        account_id: row.get(6)?,
        config_snapshot: snapshot.and_then(|s| serde_json::from_str(&s).ok()),
        output: row.get(8)?,
        error_kind: row.get(9)?,
        error: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
