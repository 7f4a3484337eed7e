//! In-memory broker implementation.
//!
//! All records live in a single map guarded by an async lock, next to one set
//! of lanes per queue: a FIFO of pending IDs, a time-ordered set of delayed
//! IDs (scheduled, requeued and retrying tasks) and the active set. Nothing
//! survives a restart, which is fine for development, tests and single-process
//! deployments.

use super::{Broker, Lease, SharedBroker};
use crate::error::{RelayError, RelayResult};
use crate::task::{Queue, TaskId, TaskInfo, TaskMessage, TaskState, add_duration};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug)]
struct Record {
    message: TaskMessage,
    info: TaskInfo,
}

#[derive(Debug, Default)]
struct Lanes {
    pending: VecDeque<TaskId>,
    delayed: BTreeSet<(DateTime<Utc>, TaskId)>,
    active: HashSet<TaskId>,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<TaskId, Record>,
    lanes: HashMap<Queue, Lanes>,
}

impl State {
    /// Move due delayed tasks of `queue` to the back of its pending lane.
    fn promote_due(&mut self, queue: Queue, now: DateTime<Utc>) -> u64 {
        let State { records, lanes } = self;
        let lane = lanes.entry(queue).or_default();
        let mut moved = 0;

        while let Some((due_at, _)) = lane.delayed.first() {
            if *due_at > now {
                break;
            }
            let Some((_, id)) = lane.delayed.pop_first() else {
                break;
            };
            if let Some(record) = records.get_mut(&id) {
                record.info.state = TaskState::Pending;
                record.info.next_process_at = None;
                lane.pending.push_back(id);
                moved += 1;
            }
        }

        moved
    }

    /// Take an active record out of the active lane.
    fn release(&mut self, message: &TaskMessage) -> RelayResult<&mut Record> {
        if let Some(lane) = self.lanes.get_mut(&message.queue) {
            lane.active.remove(&message.id);
        }
        self.records
            .get_mut(&message.id)
            .ok_or_else(|| not_found(message.queue, &message.id))
    }

    fn delay(&mut self, queue: Queue, id: TaskId, until: DateTime<Utc>) {
        self.lanes.entry(queue).or_default().delayed.insert((until, id));
    }
}

/// In-memory broker backend
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: RwLock<State>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance used by configuration-built components.
    pub fn shared() -> SharedBroker {
        static SHARED: OnceLock<Arc<InMemoryBroker>> = OnceLock::new();
        let broker: SharedBroker = SHARED.get_or_init(|| Arc::new(InMemoryBroker::new())).clone();
        broker
    }

    /// Snapshot of every stored record.
    pub async fn snapshot(&self) -> Vec<TaskInfo> {
        let state = self.state.read().await;
        state.records.values().map(|r| r.info.clone()).collect()
    }

    /// Number of pending tasks in `queue`.
    pub async fn pending_len(&self, queue: Queue) -> usize {
        let state = self.state.read().await;
        state.lanes.get(&queue).map_or(0, |lane| lane.pending.len())
    }
}

fn not_found(queue: Queue, id: &str) -> RelayError {
    RelayError::TaskNotFound {
        queue: queue.to_string(),
        id: id.to_string(),
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(
        &self,
        message: TaskMessage,
        process_at: Option<DateTime<Utc>>,
    ) -> RelayResult<TaskInfo> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        if state.records.contains_key(&message.id) {
            return Err(RelayError::broker_msg(format!(
                "Task ID '{}' already exists",
                message.id
            )));
        }

        let id = message.id.clone();
        let queue = message.queue;
        let info = match process_at.filter(|at| *at > now) {
            Some(at) => {
                let mut info = TaskInfo::new(&message, TaskState::Scheduled);
                info.next_process_at = Some(at);
                state.delay(queue, id.clone(), at);
                info
            }
            None => {
                state.lanes.entry(queue).or_default().pending.push_back(id.clone());
                TaskInfo::new(&message, TaskState::Pending)
            }
        };

        state.records.insert(
            id.clone(),
            Record {
                message,
                info: info.clone(),
            },
        );

        tracing::debug!(task_id = %id, queue = %queue, state = %info.state, "Enqueued task");
        Ok(info)
    }

    async fn lease(&self, queues: &[Queue]) -> RelayResult<Option<Lease>> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        for &queue in queues {
            state.promote_due(queue, now);

            let State { records, lanes } = &mut *state;
            let lane = lanes.entry(queue).or_default();
            while let Some(id) = lane.pending.pop_front() {
                let Some(record) = records.get_mut(&id) else {
                    continue;
                };
                record.info.state = TaskState::Active;
                lane.active.insert(id);
                return Ok(Some(Lease {
                    message: record.message.clone(),
                    retried: record.info.retried,
                }));
            }
        }

        Ok(None)
    }

    async fn complete(&self, message: &TaskMessage) -> RelayResult<()> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let record = state.release(message)?;

        record.info.state = TaskState::Completed;
        record.info.completed_at = Some(now);
        record.info.expires_at = Some(add_duration(now, message.retention()));

        tracing::debug!(task_id = %message.id, "Completed task");
        Ok(())
    }

    async fn requeue(&self, message: &TaskMessage, delay: Duration) -> RelayResult<()> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let record = state.release(message)?;
        record.info.state = TaskState::Pending;

        if delay.is_zero() {
            record.info.next_process_at = None;
            state
                .lanes
                .entry(message.queue)
                .or_default()
                .pending
                .push_back(message.id.clone());
        } else {
            let until = add_duration(now, delay);
            record.info.next_process_at = Some(until);
            state.delay(message.queue, message.id.clone(), until);
        }

        tracing::debug!(task_id = %message.id, delay_ms = delay.as_millis() as u64, "Requeued task");
        Ok(())
    }

    async fn retry(
        &self,
        message: &TaskMessage,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> RelayResult<()> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let record = state.release(message)?;

        record.info.state = TaskState::Retry;
        record.info.retried += 1;
        record.info.last_error = Some(error.to_string());
        record.info.last_failed_at = Some(now);
        record.info.next_process_at = Some(retry_at);
        state.delay(message.queue, message.id.clone(), retry_at);

        tracing::debug!(task_id = %message.id, %retry_at, "Scheduled retry");
        Ok(())
    }

    async fn archive(&self, message: &TaskMessage, error: &str) -> RelayResult<()> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let record = state.release(message)?;

        record.info.state = TaskState::Archived;
        record.info.retried += 1;
        record.info.last_error = Some(error.to_string());
        record.info.last_failed_at = Some(now);
        record.info.next_process_at = None;
        record.info.expires_at = Some(add_duration(now, message.retention()));

        tracing::debug!(task_id = %message.id, "Archived task");
        Ok(())
    }

    async fn forward_due(&self) -> RelayResult<u64> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        Ok(Queue::ALL
            .iter()
            .map(|queue| state.promote_due(*queue, now))
            .sum())
    }

    async fn delete_expired(&self) -> RelayResult<u64> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let before = state.records.len();

        state.records.retain(|_, record| {
            !(record.info.state.is_terminal()
                && record.info.expires_at.is_some_and(|at| at <= now))
        });

        Ok((before - state.records.len()) as u64)
    }

    async fn get_task_info(&self, queue: Queue, id: &TaskId) -> RelayResult<TaskInfo> {
        let state = self.state.read().await;
        state
            .records
            .get(id)
            .filter(|record| record.message.queue == queue)
            .map(|record| record.info.clone())
            .ok_or_else(|| not_found(queue, id))
    }

    async fn ping(&self) -> RelayResult<()> {
        Ok(())
    }

    async fn close(&self) -> RelayResult<()> {
        // Records belong to every handle of this broker; nothing to release.
        tracing::debug!("In-memory broker handle closed");
        Ok(())
    }
}
