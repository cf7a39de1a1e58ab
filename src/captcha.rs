//! The CAPTCHA Task Queue (C6).
//!
//! Field set, statuses, and the composite `(status, priority DESC,
//! created_at ASC)` ordering are grounded directly on
//! `original_source/migrations/versions/8f3a2b4c5d6e_add_captcha_task.py` and
//! `.../a1b2c3d4e5f6_update_captcha_task_for_resolver.py`. The external
//! HTTP-facing Postgres table those migrations describe is a *consumer* of
//! this same state, not reimplemented here (out of scope per spec §1); this
//! queue mirrors its composite index with a priority-ordered pending set and
//! persists task state via `redb` — a dependency the teacher already
//! declares but never uses — so a process restart does not lose queued or
//! assigned work. Waiting on a task's terminal state uses one
//! `tokio::sync::Notify` per task, never a held lock across the wait.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

const TABLE: redb::TableDefinition<&str, &[u8]> = redb::TableDefinition::new("captcha_tasks");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaStatus {
    Pending,
    Assigned,
    InProgress,
    Solved,
    Failed,
    Expired,
    Unsolvable,
}

/// Clearance cookie + UA + extra cookies produced when a task is solved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverResult {
    pub cf_clearance: String,
    pub user_agent: String,
    pub cookies: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaTask {
    pub id: Uuid,
    pub url: String,
    pub domain: String,
    pub status: CaptchaStatus,
    pub priority: i32,
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub solved_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub solver_result: Option<SolverResult>,
    pub last_error: Option<String>,
    pub proxy_used: Option<String>,
    pub originating_request_id: Uuid,
    /// Human-solver-UI-only fields, threaded through as opaque data.
    pub preview_path: Option<String>,
    pub solver_notes: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {0} is not pending and cannot be assigned")]
    NotPending(Uuid),
    #[error("task {0} is not assigned to operator '{1}'")]
    NotAssignedTo(Uuid, String),
    #[error("task {0} is in status {1:?} and cannot make that transition")]
    InvalidTransition(Uuid, CaptchaStatus),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Outcome of waiting for a task to reach a terminal state.
#[derive(Debug, Clone)]
pub enum TerminalOutcome {
    Solved(SolverResult),
    Failed(Option<String>),
    Expired,
    Unsolvable,
}

#[derive(Eq, PartialEq)]
struct PendingKey {
    priority: i32,
    created_at: DateTime<Utc>,
    task_id: Uuid,
}

impl Ord for PendingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Highest priority first; ties broken by oldest created_at first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for PendingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    tasks: HashMap<Uuid, CaptchaTask>,
    pending: BinaryHeap<PendingKey>,
    /// domain -> task id, for tasks still pending/assigned/in-progress, so a
    /// repeated enqueue for the same domain joins the existing task instead
    /// of creating a duplicate.
    open_by_domain: HashMap<String, Uuid>,
    waiters: HashMap<Uuid, Arc<Notify>>,
}

/// Persistent, priority-ordered CAPTCHA task queue.
pub struct CaptchaQueue {
    state: Mutex<State>,
    db: Option<redb::Database>,
}

impl CaptchaQueue {
    /// In-memory only; no restart durability.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(State {
                tasks: HashMap::new(),
                pending: BinaryHeap::new(),
                open_by_domain: HashMap::new(),
                waiters: HashMap::new(),
            }),
            db: None,
        }
    }

    /// Backed by an embedded `redb` database at `path`; on construction,
    /// any previously-persisted non-terminal tasks are reloaded so a process
    /// restart does not lose queued or assigned work.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, CaptchaError> {
        let db = redb::Database::create(path).map_err(|e| CaptchaError::Storage(e.to_string()))?;
        let mut tasks = HashMap::new();
        let mut open_by_domain = HashMap::new();
        let mut pending = BinaryHeap::new();

        {
            let txn = db
                .begin_read()
                .map_err(|e| CaptchaError::Storage(e.to_string()))?;
            if let Ok(table) = txn.open_table(TABLE) {
                for row in table
                    .iter()
                    .map_err(|e| CaptchaError::Storage(e.to_string()))?
                {
                    let (_, value) = row.map_err(|e| CaptchaError::Storage(e.to_string()))?;
                    let task: CaptchaTask = serde_json::from_slice(value.value())
                        .map_err(|e| CaptchaError::Storage(e.to_string()))?;
                    if matches!(task.status, CaptchaStatus::Pending) {
                        pending.push(PendingKey {
                            priority: task.priority,
                            created_at: task.created_at,
                            task_id: task.id,
                        });
                    }
                    if is_open(task.status) {
                        open_by_domain.insert(task.domain.clone(), task.id);
                    }
                    tasks.insert(task.id, task);
                }
            }
        }

        Ok(Self {
            state: Mutex::new(State {
                tasks,
                pending,
                open_by_domain,
                waiters: HashMap::new(),
            }),
            db: Some(db),
        })
    }

    fn persist(&self, task: &CaptchaTask) -> Result<(), CaptchaError> {
        let Some(db) = &self.db else { return Ok(()) };
        let bytes = serde_json::to_vec(task).map_err(|e| CaptchaError::Storage(e.to_string()))?;
        let txn = db
            .begin_write()
            .map_err(|e| CaptchaError::Storage(e.to_string()))?;
        {
            let mut table = txn
                .open_table(TABLE)
                .map_err(|e| CaptchaError::Storage(e.to_string()))?;
            table
                .insert(task.id.to_string().as_str(), bytes.as_slice())
                .map_err(|e| CaptchaError::Storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| CaptchaError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Create a pending task with `priority` and `ttl`, or join an existing
    /// pending/assigned/in-progress task for the same domain (idempotence:
    /// re-submitting the same URL must not produce duplicate tasks).
    pub async fn enqueue(
        &self,
        url: impl Into<String>,
        domain: impl Into<String>,
        priority: i32,
        originating_request_id: Uuid,
        ttl: chrono::Duration,
    ) -> Result<Uuid, CaptchaError> {
        let domain = domain.into();
        let mut state = self.state.lock().await;

        if let Some(&existing) = state.open_by_domain.get(&domain) {
            return Ok(existing);
        }

        let now = Utc::now();
        let task = CaptchaTask {
            id: Uuid::new_v4(),
            url: url.into(),
            domain: domain.clone(),
            status: CaptchaStatus::Pending,
            priority,
            assigned_to: None,
            created_at: now,
            assigned_at: None,
            solved_at: None,
            expires_at: now + ttl,
            attempts: 0,
            solver_result: None,
            last_error: None,
            proxy_used: None,
            originating_request_id,
            preview_path: None,
            solver_notes: None,
            metadata: serde_json::json!({}),
        };

        let id = task.id;
        state.pending.push(PendingKey {
            priority,
            created_at: now,
            task_id: id,
        });
        state.open_by_domain.insert(domain, id);
        state.tasks.insert(id, task.clone());
        drop(state);
        self.persist(&task)?;
        Ok(id)
    }

    /// Atomically transitions the highest-priority pending task to
    /// `assigned`. Safe under concurrent operators: the `BinaryHeap` pop is
    /// performed under the single state lock, so no two operators can claim
    /// the same task.
    pub async fn claim(&self, operator: impl Into<String>) -> Result<Option<Uuid>, CaptchaError> {
        let mut state = self.state.lock().await;
        loop {
            let Some(key) = state.pending.pop() else {
                return Ok(None);
            };
            // The heap may contain stale entries for tasks that were
            // requeued or expired since being pushed; skip those.
            let still_pending = state
                .tasks
                .get(&key.task_id)
                .map(|t| t.status == CaptchaStatus::Pending)
                .unwrap_or(false);
            if !still_pending {
                continue;
            }
            let operator = operator.into();
            let task = state.tasks.get_mut(&key.task_id).expect("checked above");
            task.status = CaptchaStatus::Assigned;
            task.assigned_to = Some(operator);
            task.assigned_at = Some(Utc::now());
            let snapshot = task.clone();
            drop(state);
            self.persist(&snapshot)?;
            return Ok(Some(snapshot.id));
        }
    }

    /// Mark a claimed task `in-progress`.
    pub async fn start(&self, task_id: Uuid, operator: &str) -> Result<(), CaptchaError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(CaptchaError::NotFound(task_id))?;
        if task.assigned_to.as_deref() != Some(operator) {
            return Err(CaptchaError::NotAssignedTo(task_id, operator.to_string()));
        }
        task.status = CaptchaStatus::InProgress;
        let snapshot = task.clone();
        drop(state);
        self.persist(&snapshot)
    }

    /// Accepted only from the assigned operator; transitions to `solved` and
    /// wakes any waiters. Writing the resulting Session Entry to the
    /// Session Store is the orchestrator's responsibility on observing the
    /// `Solved` terminal outcome, keeping this queue independent of C3.
    pub async fn submit(
        &self,
        task_id: Uuid,
        operator: &str,
        result: SolverResult,
    ) -> Result<(), CaptchaError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(CaptchaError::NotFound(task_id))?;
        if task.assigned_to.as_deref() != Some(operator) {
            return Err(CaptchaError::NotAssignedTo(task_id, operator.to_string()));
        }
        if !matches!(task.status, CaptchaStatus::Assigned | CaptchaStatus::InProgress) {
            return Err(CaptchaError::InvalidTransition(task_id, task.status));
        }
        task.status = CaptchaStatus::Solved;
        task.solved_at = Some(Utc::now());
        task.solver_result = Some(result);
        state.open_by_domain.remove(&task.domain);
        let snapshot = task.clone();
        let waiter = state.waiters.remove(&task_id);
        drop(state);
        self.persist(&snapshot)?;
        if let Some(notify) = waiter {
            notify.notify_waiters();
        }
        Ok(())
    }

    pub async fn mark_unsolvable(&self, task_id: Uuid) -> Result<(), CaptchaError> {
        self.terminate(task_id, CaptchaStatus::Unsolvable, None).await
    }

    pub async fn mark_failed(&self, task_id: Uuid, error: impl Into<String>) -> Result<(), CaptchaError> {
        self.terminate(task_id, CaptchaStatus::Failed, Some(error.into())).await
    }

    async fn terminate(
        &self,
        task_id: Uuid,
        status: CaptchaStatus,
        error: Option<String>,
    ) -> Result<(), CaptchaError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(CaptchaError::NotFound(task_id))?;
        if !is_open(task.status) {
            return Err(CaptchaError::InvalidTransition(task_id, task.status));
        }
        task.status = status;
        task.last_error = error;
        state.open_by_domain.remove(&task.domain);
        let snapshot = task.clone();
        let waiter = state.waiters.remove(&task_id);
        drop(state);
        self.persist(&snapshot)?;
        if let Some(notify) = waiter {
            notify.notify_waiters();
        }
        Ok(())
    }

    /// Promotes tasks past their `expires_at` to `expired`, and releases any
    /// assignment held beyond `assignment_timeout` back to `pending`
    /// (attempts increments on every re-queue).
    pub async fn expire_sweep(&self, assignment_timeout: chrono::Duration) -> Result<(), CaptchaError> {
        let now = Utc::now();
        let mut to_persist = Vec::new();
        let mut woken = Vec::new();
        {
            let mut state = self.state.lock().await;
            let ids: Vec<Uuid> = state.tasks.keys().copied().collect();
            for id in ids {
                let requeue = {
                    let task = state.tasks.get_mut(&id).expect("id from keys()");
                    if is_open(task.status) && now >= task.expires_at {
                        task.status = CaptchaStatus::Expired;
                        to_persist.push(task.clone());
                        woken.push(id);
                        None
                    } else if task.status == CaptchaStatus::Assigned
                        && task
                            .assigned_at
                            .map(|at| now - at >= assignment_timeout)
                            .unwrap_or(false)
                    {
                        task.status = CaptchaStatus::Pending;
                        task.assigned_to = None;
                        task.assigned_at = None;
                        task.attempts += 1;
                        to_persist.push(task.clone());
                        Some((task.priority, task.created_at, id))
                    } else {
                        None
                    }
                };
                if let Some((priority, created_at, task_id)) = requeue {
                    state.pending.push(PendingKey {
                        priority,
                        created_at,
                        task_id,
                    });
                } else if woken.last() == Some(&id) {
                    state.open_by_domain.retain(|_, v| *v != id);
                }
            }
            for id in &woken {
                state.waiters.remove(id);
            }
        }
        for task in &to_persist {
            self.persist(task)?;
        }
        Ok(())
    }

    /// Blocks (cooperatively) until `task_id` reaches a terminal state.
    /// Never holds the state lock across the wait.
    pub async fn wait_for_terminal(&self, task_id: Uuid) -> Result<TerminalOutcome, CaptchaError> {
        loop {
            let notify = {
                let mut state = self.state.lock().await;
                let task = state
                    .tasks
                    .get(&task_id)
                    .ok_or(CaptchaError::NotFound(task_id))?;
                if let Some(outcome) = terminal_outcome(task) {
                    return Ok(outcome);
                }
                state
                    .waiters
                    .entry(task_id)
                    .or_insert_with(|| Arc::new(Notify::new()))
                    .clone()
            };
            notify.notified().await;
        }
    }

    pub async fn get(&self, task_id: Uuid) -> Option<CaptchaTask> {
        self.state.lock().await.tasks.get(&task_id).cloned()
    }

    pub async fn list_by_status(&self, status: CaptchaStatus) -> Vec<CaptchaTask> {
        self.state
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }
}

fn is_open(status: CaptchaStatus) -> bool {
    matches!(
        status,
        CaptchaStatus::Pending | CaptchaStatus::Assigned | CaptchaStatus::InProgress
    )
}

fn terminal_outcome(task: &CaptchaTask) -> Option<TerminalOutcome> {
    match task.status {
        CaptchaStatus::Solved => Some(TerminalOutcome::Solved(
            task.solver_result.clone().expect("solved task has a result"),
        )),
        CaptchaStatus::Failed => Some(TerminalOutcome::Failed(task.last_error.clone())),
        CaptchaStatus::Expired => Some(TerminalOutcome::Expired),
        CaptchaStatus::Unsolvable => Some(TerminalOutcome::Unsolvable),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_returns_none_when_empty() {
        let queue = CaptchaQueue::in_memory();
        assert!(queue.claim("op-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_picks_highest_priority_oldest_first() {
        let queue = CaptchaQueue::in_memory();
        let low = queue
            .enqueue("https://a", "a.com", 1, Uuid::new_v4(), chrono::Duration::seconds(60))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let high = queue
            .enqueue("https://b", "b.com", 10, Uuid::new_v4(), chrono::Duration::seconds(60))
            .await
            .unwrap();

        let first = queue.claim("op-1").await.unwrap().unwrap();
        assert_eq!(first, high);
        let second = queue.claim("op-2").await.unwrap().unwrap();
        assert_eq!(second, low);
    }

    #[tokio::test]
    async fn duplicate_enqueue_for_same_domain_joins_existing_task() {
        let queue = CaptchaQueue::in_memory();
        let first = queue
            .enqueue("https://a", "a.com", 5, Uuid::new_v4(), chrono::Duration::seconds(60))
            .await
            .unwrap();
        let second = queue
            .enqueue("https://a/other-path", "a.com", 5, Uuid::new_v4(), chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn submit_wakes_waiter_with_solver_result() {
        let queue = Arc::new(CaptchaQueue::in_memory());
        let id = queue
            .enqueue("https://a", "a.com", 1, Uuid::new_v4(), chrono::Duration::seconds(60))
            .await
            .unwrap();
        queue.claim("op-1").await.unwrap();
        queue.start(id, "op-1").await.unwrap();

        let waiter_queue = queue.clone();
        let waiter = tokio::spawn(async move { waiter_queue.wait_for_terminal(id).await });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        queue
            .submit(
                id,
                "op-1",
                SolverResult {
                    cf_clearance: "abc".into(),
                    user_agent: "Mozilla/5.0".into(),
                    cookies: HashMap::new(),
                },
            )
            .await
            .unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert!(matches!(outcome, TerminalOutcome::Solved(_)));
    }

    #[tokio::test]
    async fn expire_sweep_promotes_past_deadline_tasks() {
        let queue = CaptchaQueue::in_memory();
        let id = queue
            .enqueue("https://a", "a.com", 1, Uuid::new_v4(), chrono::Duration::milliseconds(1))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        queue.expire_sweep(chrono::Duration::seconds(60)).await.unwrap();
        let task = queue.get(id).await.unwrap();
        assert_eq!(task.status, CaptchaStatus::Expired);
    }

    #[tokio::test]
    async fn terminate_rejects_an_already_solved_task() {
        let queue = CaptchaQueue::in_memory();
        let id = queue
            .enqueue("https://a", "a.com", 1, Uuid::new_v4(), chrono::Duration::seconds(60))
            .await
            .unwrap();
        queue.claim("op-1").await.unwrap();
        queue.start(id, "op-1").await.unwrap();
        queue
            .submit(
                id,
                "op-1",
                SolverResult {
                    cf_clearance: "abc".into(),
                    user_agent: "Mozilla/5.0".into(),
                    cookies: HashMap::new(),
                },
            )
            .await
            .unwrap();

        let err = queue.mark_unsolvable(id).await.unwrap_err();
        assert!(matches!(err, CaptchaError::InvalidTransition(_, CaptchaStatus::Solved)));
        assert_eq!(queue.get(id).await.unwrap().status, CaptchaStatus::Solved);
    }

    #[tokio::test]
    async fn submit_rejects_an_already_terminal_task() {
        let queue = CaptchaQueue::in_memory();
        let id = queue
            .enqueue("https://a", "a.com", 1, Uuid::new_v4(), chrono::Duration::seconds(60))
            .await
            .unwrap();
        queue.claim("op-1").await.unwrap();
        queue.start(id, "op-1").await.unwrap();
        queue.mark_failed(id, "boom").await.unwrap();

        let err = queue
            .submit(
                id,
                "op-1",
                SolverResult {
                    cf_clearance: "abc".into(),
                    user_agent: "Mozilla/5.0".into(),
                    cookies: HashMap::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CaptchaError::InvalidTransition(_, CaptchaStatus::Failed)));
    }

    #[tokio::test]
    async fn expire_sweep_requeues_timed_out_assignment() {
        let queue = CaptchaQueue::in_memory();
        let id = queue
            .enqueue("https://a", "a.com", 1, Uuid::new_v4(), chrono::Duration::seconds(3600))
            .await
            .unwrap();
        queue.claim("op-1").await.unwrap();
        queue
            .expire_sweep(chrono::Duration::milliseconds(0))
            .await
            .unwrap();
        let task = queue.get(id).await.unwrap();
        assert_eq!(task.status, CaptchaStatus::Pending);
        assert_eq!(task.attempts, 1);
    }
}
