//! SQLite checkpoint store implementation.
//!
//! Implements `CheckpointStore` from `quill-core`. Each checkpoint is one row
//! keyed by `(instance_id, sequence)`; the state document, frontier and
//! interrupt info are stored as JSON text. A save is a single `INSERT` on the
//! one-connection writer pool, so readers never see a partial checkpoint and
//! writes for one instance are serialized.
//!
//! Driver leases live in `driver_leases`. Claiming is one upsert whose
//! `WHERE` clause only lets the holder or a successor of an expired lease
//! through, so coordinators in different processes cannot both hold it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use quill_core::repository::checkpoint::{CheckpointStore, LeaseClaim};
use quill_types::checkpoint::{Checkpoint, Frontier};
use quill_types::error::StorageError;
use quill_types::state::StateDocument;
use quill_types::status::{InstanceStatus, InstanceSummary, InterruptInfo};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointStore`.
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct CheckpointRow {
    instance_id: String,
    sequence: i64,
    graph: String,
    status: String,
    current_step: Option<String>,
    state: String,
    frontier: String,
    interrupt: Option<String>,
    error: Option<String>,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            sequence: row.try_get("sequence")?,
            graph: row.try_get("graph")?,
            status: row.try_get("status")?,
            current_step: row.try_get("current_step")?,
            state: row.try_get("state")?,
            frontier: row.try_get("frontier")?,
            interrupt: row.try_get("interrupt")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, StorageError> {
        let state: StateDocument = serde_json::from_str(&self.state)
            .map_err(|e| StorageError::Serialization(format!("invalid state JSON: {e}")))?;
        let frontier: Frontier = serde_json::from_str(&self.frontier)
            .map_err(|e| StorageError::Serialization(format!("invalid frontier JSON: {e}")))?;
        let interrupt: Option<InterruptInfo> = self
            .interrupt
            .as_deref()
            .map(|s| {
                serde_json::from_str(s).map_err(|e| {
                    StorageError::Serialization(format!("invalid interrupt JSON: {e}"))
                })
            })
            .transpose()?;

        Ok(Checkpoint {
            instance_id: parse_uuid(&self.instance_id)?,
            sequence: parse_sequence(self.sequence)?,
            graph: self.graph,
            status: parse_status(&self.status)?,
            current_step: self.current_step,
            state,
            frontier,
            interrupt,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    s.parse::<Uuid>()
        .map_err(|e| StorageError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_status(s: &str) -> Result<InstanceStatus, StorageError> {
    s.parse::<InstanceStatus>().map_err(StorageError::Query)
}

fn parse_sequence(n: i64) -> Result<u64, StorageError> {
    u64::try_from(n).map_err(|_| StorageError::Query(format!("invalid sequence: {n}")))
}

fn to_sql_sequence(n: u64) -> Result<i64, StorageError> {
    i64::try_from(n).map_err(|_| StorageError::Query(format!("sequence out of range: {n}")))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, StorageError> {
    serde_json::to_string(value)
        .map_err(|e| StorageError::Serialization(format!("serialize {what}: {e}")))
}

fn query_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Connection(e.to_string())
        }
        other => StorageError::Query(other.to_string()),
    }
}

fn to_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

const SELECT_COLUMNS: &str = "instance_id, sequence, graph, status, current_step, state, frontier, interrupt, error, created_at";

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let state = to_json(&checkpoint.state, "state")?;
        let frontier = to_json(&checkpoint.frontier, "frontier")?;
        let interrupt = checkpoint
            .interrupt
            .as_ref()
            .map(|i| to_json(i, "interrupt"))
            .transpose()?;

        let result = sqlx::query(
            r#"INSERT INTO checkpoints
               (instance_id, sequence, graph, status, current_step, state,
                frontier, interrupt, error, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.instance_id.to_string())
        .bind(to_sql_sequence(checkpoint.sequence)?)
        .bind(&checkpoint.graph)
        .bind(checkpoint.status.to_string())
        .bind(&checkpoint.current_step)
        .bind(&state)
        .bind(&frontier)
        .bind(&interrupt)
        .bind(&checkpoint.error)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => {
                Err(StorageError::Conflict(format!(
                    "checkpoint {} of instance {} already exists",
                    checkpoint.sequence, checkpoint.instance_id
                )))
            }
            Err(e) => Err(query_error(e)),
        }
    }

    async fn load_latest(&self, instance_id: &Uuid) -> Result<Option<Checkpoint>, StorageError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM checkpoints WHERE instance_id = ? ORDER BY sequence DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn load_range(
        &self,
        instance_id: &Uuid,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Checkpoint>, StorageError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM checkpoints WHERE instance_id = ? AND sequence > ? ORDER BY sequence ASC LIMIT ?"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&sql)
            .bind(instance_id.to_string())
            .bind(to_sql_sequence(after)?)
            .bind(limit)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CheckpointRow::from_row(row).map_err(query_error)?;
            checkpoints.push(r.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceSummary>, StorageError> {
        let base = r#"SELECT c.instance_id, c.sequence, c.graph, c.status, c.created_at
               FROM checkpoints c
               JOIN (SELECT instance_id, MAX(sequence) AS latest
                     FROM checkpoints GROUP BY instance_id) l
                 ON c.instance_id = l.instance_id AND c.sequence = l.latest"#;

        let rows = match status {
            Some(s) => {
                let sql = format!("{base} WHERE c.status = ? ORDER BY c.instance_id ASC");
                sqlx::query(&sql)
                    .bind(s.to_string())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                let sql = format!("{base} ORDER BY c.instance_id ASC");
                sqlx::query(&sql).fetch_all(&self.pool.reader).await
            }
        }
        .map_err(query_error)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let instance_id: String = row.try_get("instance_id").map_err(query_error)?;
            let sequence: i64 = row.try_get("sequence").map_err(query_error)?;
            let graph: String = row.try_get("graph").map_err(query_error)?;
            let status: String = row.try_get("status").map_err(query_error)?;
            let created_at: String = row.try_get("created_at").map_err(query_error)?;

            summaries.push(InstanceSummary {
                instance_id: parse_uuid(&instance_id)?,
                graph,
                status: parse_status(&status)?,
                last_checkpoint_seq: parse_sequence(sequence)?,
                updated_at: parse_datetime(&created_at)?,
            });
        }
        Ok(summaries)
    }

    async fn claim(&self, instance_id: &Uuid, owner: Uuid, ttl: Duration) -> Result<LeaseClaim, StorageError> {
        let now = Utc::now().timestamp_millis();
        let row = sqlx::query(
            r#"INSERT INTO driver_leases (instance_id, owner, expires_at_ms, cancel_requested)
               VALUES (?, ?, ?, 0)
               ON CONFLICT(instance_id) DO UPDATE SET
                   cancel_requested = CASE WHEN driver_leases.owner = excluded.owner
                                           THEN driver_leases.cancel_requested ELSE 0 END,
                   owner = excluded.owner,
                   expires_at_ms = excluded.expires_at_ms
               WHERE driver_leases.owner = excluded.owner OR driver_leases.expires_at_ms <= ?
               RETURNING cancel_requested"#,
        )
        .bind(instance_id.to_string())
        .bind(owner.to_string())
        .bind(now.saturating_add(to_millis(ttl)))
        .bind(now)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let cancel_requested: i64 = row.try_get("cancel_requested").map_err(query_error)?;
                Ok(LeaseClaim::Held {
                    cancel_requested: cancel_requested != 0,
                })
            }
            None => Ok(LeaseClaim::Busy),
        }
    }

    async fn release(&self, instance_id: &Uuid, owner: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM driver_leases WHERE instance_id = ? AND owner = ?")
            .bind(instance_id.to_string())
            .bind(owner.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn request_cancel(&self, instance_id: &Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE driver_leases SET cancel_requested = 1 WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use futures_util::StreamExt;
    use quill_core::repository::checkpoint::load_history;
    use quill_core::workflow::{Coordinator, END, EngineError, FnStep, GraphBuilder, StepFailure, StepOutput};
    use quill_types::checkpoint::Dispatch;
    use quill_types::config::EngineConfig;
    use quill_types::state::{DEFAULT_FEEDBACK_FIELD, InputView, StateDelta};
    use quill_types::status::InterruptPosition;
    use serde_json::json;

    async fn test_pool(dir: &tempfile::TempDir) -> DatabasePool {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        DatabasePool::new(&url).await.unwrap()
    }

    fn make_checkpoint(instance_id: Uuid, sequence: u64, status: InstanceStatus) -> Checkpoint {
        let mut state = StateDocument::new(instance_id);
        state.fields_mut().insert("topic".to_string(), json!("rust"));
        state.fields_mut().insert("score".to_string(), json!(0.75));
        state.record_steps(sequence - 1);
        Checkpoint {
            instance_id,
            sequence,
            graph: "pipeline".to_string(),
            status,
            current_step: Some("plan".to_string()),
            state,
            frontier: Frontier::Run(vec![Dispatch::with_payload("draft", json!({"format": "text"}))]),
            interrupt: (status == InstanceStatus::Interrupted).then(|| InterruptInfo {
                step: "review".to_string(),
                position: InterruptPosition::Before,
                feedback_field: DEFAULT_FEEDBACK_FIELD.to_string(),
            }),
            error: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_load_latest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::new(test_pool(&dir).await);
        let id = Uuid::now_v7();

        let first = make_checkpoint(id, 1, InstanceStatus::Running);
        let second = make_checkpoint(id, 2, InstanceStatus::Interrupted);
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        let latest = store.load_latest(&id).await.unwrap().unwrap();
        assert_eq!(latest, second);
        assert!(store.load_latest(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_sequence_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::new(test_pool(&dir).await);
        let id = Uuid::now_v7();

        store.save(&make_checkpoint(id, 1, InstanceStatus::Running)).await.unwrap();
        let err = store
            .save(&make_checkpoint(id, 1, InstanceStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert!(!err.is_transient());

        let latest = store.load_latest(&id).await.unwrap().unwrap();
        assert_eq!(latest.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn history_streams_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::new(test_pool(&dir).await);
        let id = Uuid::now_v7();
        for seq in 1..=12 {
            store.save(&make_checkpoint(id, seq, InstanceStatus::Running)).await.unwrap();
        }

        let page = store.load_range(&id, 4, 3).await.unwrap();
        assert_eq!(page.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![5, 6, 7]);

        let all: Vec<u64> = load_history(&store, id, 5)
            .map(|c| c.unwrap().sequence)
            .collect()
            .await;
        assert_eq!(all, (1..=12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn list_instances_reports_latest_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::new(test_pool(&dir).await);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        store.save(&make_checkpoint(a, 1, InstanceStatus::Running)).await.unwrap();
        store.save(&make_checkpoint(a, 2, InstanceStatus::Completed)).await.unwrap();
        store.save(&make_checkpoint(b, 1, InstanceStatus::Running)).await.unwrap();

        let all = store.list_instances(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let completed = store.list_instances(Some(InstanceStatus::Completed)).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].instance_id, a);
        assert_eq!(completed[0].last_checkpoint_seq, 2);
        assert_eq!(completed[0].graph, "pipeline");

        let running = store.list_instances(Some(InstanceStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].instance_id, b);
    }

    #[tokio::test]
    async fn driver_lease_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::new(test_pool(&dir).await);
        let id = Uuid::now_v7();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let ttl = Duration::from_secs(30);

        assert_eq!(
            store.claim(&id, a, ttl).await.unwrap(),
            LeaseClaim::Held { cancel_requested: false }
        );
        assert_eq!(store.claim(&id, b, ttl).await.unwrap(), LeaseClaim::Busy);

        assert!(store.request_cancel(&id).await.unwrap());
        assert_eq!(
            store.claim(&id, a, ttl).await.unwrap(),
            LeaseClaim::Held { cancel_requested: true }
        );

        store.release(&id, b).await.unwrap();
        assert_eq!(store.claim(&id, b, ttl).await.unwrap(), LeaseClaim::Busy);
        store.release(&id, a).await.unwrap();
        assert!(!store.request_cancel(&id).await.unwrap());
        assert_eq!(
            store.claim(&id, b, ttl).await.unwrap(),
            LeaseClaim::Held { cancel_requested: false }
        );
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_across_pools() {
        let dir = tempfile::tempdir().unwrap();
        let first = SqliteCheckpointStore::new(test_pool(&dir).await);
        let second = SqliteCheckpointStore::new(test_pool(&dir).await);
        let id = Uuid::now_v7();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());

        first.claim(&id, a, Duration::from_millis(50)).await.unwrap();
        first.request_cancel(&id).await.unwrap();
        assert_eq!(second.claim(&id, b, Duration::from_secs(30)).await.unwrap(), LeaseClaim::Busy);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            second.claim(&id, b, Duration::from_secs(30)).await.unwrap(),
            LeaseClaim::Held { cancel_requested: false }
        );
        assert_eq!(first.claim(&id, a, Duration::from_secs(30)).await.unwrap(), LeaseClaim::Busy);
    }

    #[tokio::test]
    async fn concurrent_instances_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteCheckpointStore::new(test_pool(&dir).await));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let id = Uuid::now_v7();
                for seq in 1..=10 {
                    store.save(&make_checkpoint(id, seq, InstanceStatus::Running)).await.unwrap();
                }
                id
            }));
        }
        for task in tasks {
            let id = task.await.unwrap();
            let latest = store.load_latest(&id).await.unwrap().unwrap();
            assert_eq!(latest.sequence, 10);
        }
    }

    #[tokio::test]
    async fn interrupted_instance_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let graph = Arc::new(
            GraphBuilder::new("approval")
                .add_step(
                    "draft",
                    FnStep::new(|_v: InputView| async {
                        Ok::<_, StepFailure>(StepOutput::new(StateDelta::new().set("draft", "v1")))
                    }),
                )
                .add_step(
                    "publish",
                    FnStep::new(|v: InputView| async move {
                        let approved = v.get_as::<String>(DEFAULT_FEEDBACK_FIELD).as_deref() == Some("yes");
                        Ok::<_, StepFailure>(StepOutput::new(StateDelta::new().set("published", approved)))
                    }),
                )
                .add_edge("draft", "publish")
                .add_edge("publish", END)
                .interrupt_before("publish")
                .set_entry("draft")
                .build()
                .unwrap(),
        );

        let id = {
            let store = Arc::new(SqliteCheckpointStore::new(test_pool(&dir).await));
            let coordinator = Coordinator::new(store, EngineConfig::default());
            let id = coordinator.start(Arc::clone(&graph), StateDelta::new()).await.unwrap();
            let held = coordinator.advance(id).await.unwrap();
            assert_eq!(held.status(), InstanceStatus::Interrupted);
            id
        };

        let store = Arc::new(SqliteCheckpointStore::new(test_pool(&dir).await));
        let coordinator = Coordinator::new(store, EngineConfig::default());
        coordinator.recover(Arc::clone(&graph), id).await.unwrap();
        let done = coordinator
            .resume(id, StateDelta::new().set(DEFAULT_FEEDBACK_FIELD, "yes"))
            .await
            .unwrap();

        assert_eq!(done.status(), InstanceStatus::Completed);
        assert_eq!(done.state.get_as::<bool>("published"), Some(true));
        assert_eq!(done.state.get_as::<String>("draft").as_deref(), Some("v1"));

        let statuses: Vec<InstanceStatus> = coordinator
            .history(id)
            .await
            .unwrap()
            .map(|c| c.unwrap().status)
            .collect()
            .await;
        assert_eq!(statuses.first(), Some(&InstanceStatus::Running));
        assert_eq!(statuses.last(), Some(&InstanceStatus::Completed));
        assert!(statuses.contains(&InstanceStatus::Interrupted));
    }

    #[tokio::test]
    async fn only_one_process_drives_an_instance() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let r = Arc::clone(&runs);
        let graph = Arc::new(
            GraphBuilder::new("slow")
                .add_step(
                    "work",
                    FnStep::new(move |_v: InputView| {
                        r.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        async {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok::<_, StepFailure>(StepOutput::new(StateDelta::new().set("done", true)))
                        }
                    }),
                )
                .set_entry("work")
                .build()
                .unwrap(),
        );

        let a = Coordinator::new(
            Arc::new(SqliteCheckpointStore::new(test_pool(&dir).await)),
            EngineConfig::default(),
        );
        let b = Coordinator::new(
            Arc::new(SqliteCheckpointStore::new(test_pool(&dir).await)),
            EngineConfig::default(),
        );
        let id = a.start(Arc::clone(&graph), StateDelta::new()).await.unwrap();
        b.recover(Arc::clone(&graph), id).await.unwrap();

        let (first, second) = tokio::join!(a.advance(id), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            b.advance(id).await
        });
        assert_eq!(first.unwrap().status(), InstanceStatus::Completed);
        assert!(matches!(second, Err(EngineError::AlreadyRunning(_))));
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);

        let caught_up = b.advance(id).await.unwrap();
        assert_eq!(caught_up.status(), InstanceStatus::Completed);
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
