use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datasync_core::{PersistentQueueStore, SyncError, SyncResult, TaskControl, TaskRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// 排队条目
///
/// 队列按优先级降序、`queued_at` 升序、`seq` 升序排列；`seq` 单调递增，
/// 保证同一时刻到达的任务仍按提交顺序出队。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: Uuid,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub seq: u64,
}

impl QueueEntry {
    fn sort_key(&self) -> (std::cmp::Reverse<i32>, DateTime<Utc>, u64) {
        (std::cmp::Reverse(self.priority), self.queued_at, self.seq)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct QueueState {
    next_seq: u64,
    entries: Vec<QueueEntry>,
}

impl QueueState {
    fn insert(&mut self, entry: QueueEntry) {
        let position = self
            .entries
            .partition_point(|e| e.sort_key() <= entry.sort_key());
        self.entries.insert(position, entry);
    }
}

/// 活跃集合：task_id -> 晋升时间
type ActiveSet = BTreeMap<Uuid, DateTime<Utc>>;

/// 调度统计计数器
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerCounters {
    pub submitted: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub stale: u64,
    pub dispatch_errors: u64,
}

impl SchedulerCounters {
    pub fn merge(&mut self, other: &SchedulerCounters) {
        self.submitted += other.submitted;
        self.dispatched += other.dispatched;
        self.completed += other.completed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.stale += other.stale;
        self.dispatch_errors += other.dispatch_errors;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Submitted,
    Dispatched,
    Completed,
    Failed,
    Cancelled,
    Stale,
    DispatchErrors,
}

impl Counter {
    fn bump(self, counters: &mut SchedulerCounters) {
        match self {
            Counter::Submitted => counters.submitted += 1,
            Counter::Dispatched => counters.dispatched += 1,
            Counter::Completed => counters.completed += 1,
            Counter::Failed => counters.failed += 1,
            Counter::Cancelled => counters.cancelled += 1,
            Counter::Stale => counters.stale += 1,
            Counter::DispatchErrors => counters.dispatch_errors += 1,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned + Default>(value: Option<&Value>) -> SyncResult<T> {
    match value {
        Some(v) => Ok(serde_json::from_value(v.clone())?),
        None => Ok(T::default()),
    }
}

/// 调度状态的类型化客户端
///
/// 在 `PersistentQueueStore` 之上维护调度器的持久化布局，所有键都以 `{prefix}:` 开头：
///
/// - `active`: 活跃集合，槽位计数的唯一依据
/// - `queue`: 优先级队列
/// - `stats`: 统计计数器
/// - `task:{id}`: 任务记录，终态记录带TTL
/// - `cancel:{id}`: 取消标记，由管道在批次边界轮询
pub struct SchedulerStateStore {
    store: Arc<dyn PersistentQueueStore>,
    prefix: String,
    terminal_ttl: Duration,
}

impl SchedulerStateStore {
    pub fn new(
        store: Arc<dyn PersistentQueueStore>,
        prefix: impl Into<String>,
        terminal_ttl: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            terminal_ttl,
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn task_key(&self, task_id: Uuid) -> String {
        self.key(&format!("task:{task_id}"))
    }

    fn cancel_key(&self, task_id: Uuid) -> String {
        self.key(&format!("cancel:{task_id}"))
    }

    pub async fn health_check(&self) -> SyncResult<()> {
        self.store.health_check().await
    }

    // 任务记录

    pub async fn load_task(&self, task_id: Uuid) -> SyncResult<Option<TaskRecord>> {
        match self.store.get(&self.task_key(task_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// 写入任务记录，终态记录带过期时间
    pub async fn save_task(&self, record: &TaskRecord) -> SyncResult<()> {
        let ttl = record.is_terminal().then_some(self.terminal_ttl);
        self.store
            .set(&self.task_key(record.id), serde_json::to_value(record)?, ttl)
            .await
    }

    pub async fn delete_task(&self, task_id: Uuid) -> SyncResult<bool> {
        self.store.delete(&self.task_key(task_id)).await
    }

    /// 原子修改任务记录
    ///
    /// `mutate` 返回 `false` 表示不做修改（例如状态转换不合法）。返回修改后的记录以及是否实际修改。
    /// 修改后的记录进入终态时会重新写入以附加TTL。
    pub async fn update_task<F>(&self, task_id: Uuid, mutate: F) -> SyncResult<(TaskRecord, bool)>
    where
        F: Fn(&mut TaskRecord) -> bool + Send + Sync,
    {
        let applied = AtomicBool::new(false);
        let update = |current: Option<&Value>| -> SyncResult<Option<Value>> {
            let Some(current) = current else {
                applied.store(false, Ordering::SeqCst);
                return Ok(None);
            };
            let mut record: TaskRecord = serde_json::from_value(current.clone())?;
            let changed = mutate(&mut record);
            applied.store(changed, Ordering::SeqCst);
            if changed {
                Ok(Some(serde_json::to_value(&record)?))
            } else {
                Ok(None)
            }
        };

        let value = self
            .store
            .atomic_update(&self.task_key(task_id), &update)
            .await?
            .ok_or(SyncError::TaskNotFound { id: task_id })?;
        let record: TaskRecord = serde_json::from_value(value)?;
        let applied = applied.load(Ordering::SeqCst);

        if applied && record.is_terminal() {
            self.save_task(&record).await?;
        }
        Ok((record, applied))
    }

    // 活跃集合

    /// 尝试占用一个槽位，已在活跃集合中视为成功
    pub async fn try_acquire_slot(
        &self,
        task_id: Uuid,
        started_at: DateTime<Utc>,
        max_workers: usize,
    ) -> SyncResult<bool> {
        let acquired = AtomicBool::new(false);
        let update = |current: Option<&Value>| -> SyncResult<Option<Value>> {
            let mut active: ActiveSet = decode(current)?;
            if active.contains_key(&task_id) {
                acquired.store(true, Ordering::SeqCst);
                return Ok(None);
            }
            if active.len() >= max_workers {
                acquired.store(false, Ordering::SeqCst);
                return Ok(None);
            }
            active.insert(task_id, started_at);
            acquired.store(true, Ordering::SeqCst);
            Ok(Some(serde_json::to_value(&active)?))
        };

        self.store.atomic_update(&self.key("active"), &update).await?;
        Ok(acquired.load(Ordering::SeqCst))
    }

    pub async fn release_slot(&self, task_id: Uuid) -> SyncResult<bool> {
        let released = AtomicBool::new(false);
        let update = |current: Option<&Value>| -> SyncResult<Option<Value>> {
            let mut active: ActiveSet = decode(current)?;
            let removed = active.remove(&task_id).is_some();
            released.store(removed, Ordering::SeqCst);
            if removed {
                Ok(Some(serde_json::to_value(&active)?))
            } else {
                Ok(None)
            }
        };

        self.store.atomic_update(&self.key("active"), &update).await?;
        let released = released.load(Ordering::SeqCst);
        if released {
            debug!("释放槽位: task={}", task_id);
        }
        Ok(released)
    }

    pub async fn active_ids(&self) -> SyncResult<Vec<Uuid>> {
        let current = self.store.get(&self.key("active")).await?;
        let active: ActiveSet = decode(current.as_ref())?;
        Ok(active.into_keys().collect())
    }

    pub async fn active_count(&self) -> SyncResult<usize> {
        Ok(self.active_ids().await?.len())
    }

    // 优先级队列

    pub async fn enqueue(&self, record: &TaskRecord) -> SyncResult<QueueEntry> {
        let assigned: Mutex<Option<QueueEntry>> = Mutex::new(None);
        let update = |current: Option<&Value>| -> SyncResult<Option<Value>> {
            let mut queue: QueueState = decode(current)?;
            let entry = QueueEntry {
                task_id: record.id,
                priority: record.priority,
                queued_at: record.queued_at,
                seq: queue.next_seq,
            };
            queue.next_seq += 1;
            queue.insert(entry.clone());
            if let Ok(mut slot) = assigned.lock() {
                *slot = Some(entry);
            }
            Ok(Some(serde_json::to_value(&queue)?))
        };

        self.store.atomic_update(&self.key("queue"), &update).await?;
        assigned
            .into_inner()
            .ok()
            .flatten()
            .ok_or_else(|| SyncError::Internal("入队结果丢失".to_string()))
    }

    /// 把出队后未能晋升的条目放回原位置
    pub async fn requeue(&self, entry: QueueEntry) -> SyncResult<()> {
        let update = |current: Option<&Value>| -> SyncResult<Option<Value>> {
            let mut queue: QueueState = decode(current)?;
            if queue.entries.iter().any(|e| e.task_id == entry.task_id) {
                return Ok(None);
            }
            queue.insert(entry.clone());
            Ok(Some(serde_json::to_value(&queue)?))
        };
        self.store.atomic_update(&self.key("queue"), &update).await?;
        Ok(())
    }

    /// 弹出最高优先级的条目
    pub async fn pop_next(&self) -> SyncResult<Option<QueueEntry>> {
        let popped: Mutex<Option<QueueEntry>> = Mutex::new(None);
        let update = |current: Option<&Value>| -> SyncResult<Option<Value>> {
            let mut queue: QueueState = decode(current)?;
            let head = if queue.entries.is_empty() {
                None
            } else {
                Some(queue.entries.remove(0))
            };
            let changed = head.is_some();
            if let Ok(mut slot) = popped.lock() {
                *slot = head;
            }
            if changed {
                Ok(Some(serde_json::to_value(&queue)?))
            } else {
                Ok(None)
            }
        };

        self.store.atomic_update(&self.key("queue"), &update).await?;
        Ok(popped.into_inner().ok().flatten())
    }

    pub async fn remove_queued(&self, task_id: Uuid) -> SyncResult<bool> {
        let removed = AtomicBool::new(false);
        let update = |current: Option<&Value>| -> SyncResult<Option<Value>> {
            let mut queue: QueueState = decode(current)?;
            let before = queue.entries.len();
            queue.entries.retain(|e| e.task_id != task_id);
            let changed = queue.entries.len() != before;
            removed.store(changed, Ordering::SeqCst);
            if changed {
                Ok(Some(serde_json::to_value(&queue)?))
            } else {
                Ok(None)
            }
        };

        self.store.atomic_update(&self.key("queue"), &update).await?;
        Ok(removed.load(Ordering::SeqCst))
    }

    /// 按出队顺序列出排队条目
    pub async fn queued_entries(&self) -> SyncResult<Vec<QueueEntry>> {
        let current = self.store.get(&self.key("queue")).await?;
        let queue: QueueState = decode(current.as_ref())?;
        Ok(queue.entries)
    }

    pub async fn queue_len(&self) -> SyncResult<usize> {
        Ok(self.queued_entries().await?.len())
    }

    // 统计

    pub async fn bump(&self, counter: Counter) -> SyncResult<()> {
        let update = |current: Option<&Value>| -> SyncResult<Option<Value>> {
            let mut counters: SchedulerCounters = decode(current)?;
            counter.bump(&mut counters);
            Ok(Some(serde_json::to_value(counters)?))
        };
        self.store.atomic_update(&self.key("stats"), &update).await?;
        Ok(())
    }

    pub async fn counters(&self) -> SyncResult<SchedulerCounters> {
        let current = self.store.get(&self.key("stats")).await?;
        decode(current.as_ref())
    }

    // 取消标记

    pub async fn set_cancel_flag(&self, task_id: Uuid) -> SyncResult<()> {
        self.store
            .set(
                &self.cancel_key(task_id),
                Value::Bool(true),
                Some(self.terminal_ttl),
            )
            .await
    }

    pub async fn has_cancel_flag(&self, task_id: Uuid) -> SyncResult<bool> {
        Ok(self.store.get(&self.cancel_key(task_id)).await?.is_some())
    }
}

#[async_trait]
impl TaskControl for SchedulerStateStore {
    async fn heartbeat(&self, task_id: Uuid) -> SyncResult<()> {
        let now = Utc::now();
        self.update_task(task_id, |record| record.record_heartbeat(now))
            .await?;
        Ok(())
    }

    async fn is_cancel_requested(&self, task_id: Uuid) -> SyncResult<bool> {
        if self.has_cancel_flag(task_id).await? {
            return Ok(true);
        }
        Ok(self
            .load_task(task_id)
            .await?
            .is_some_and(|record| record.status == datasync_core::TaskStatus::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasync_core::{JobKind, TaskStatus};
    use datasync_infrastructure::InMemoryQueueStore;
    use serde_json::json;

    fn state() -> SchedulerStateStore {
        SchedulerStateStore::new(
            Arc::new(InMemoryQueueStore::new()),
            "test",
            Duration::from_secs(60),
        )
    }

    fn record(priority: i32) -> TaskRecord {
        TaskRecord::new(JobKind::new("crm", "contacts"), json!({}), priority)
    }

    #[tokio::test]
    async fn test_queue_orders_by_priority_then_arrival() {
        let state = state();
        let low_a = record(0);
        let low_b = record(0);
        let high = record(5);
        state.enqueue(&low_a).await.unwrap();
        state.enqueue(&low_b).await.unwrap();
        state.enqueue(&high).await.unwrap();

        let order: Vec<Uuid> = state
            .queued_entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.task_id)
            .collect();
        assert_eq!(order, vec![high.id, low_a.id, low_b.id]);

        assert_eq!(state.pop_next().await.unwrap().unwrap().task_id, high.id);
        assert_eq!(state.queue_len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_same_timestamp_keeps_submission_order() {
        let state = state();
        let first = record(0);
        let mut second = record(0);
        second.queued_at = first.queued_at;
        state.enqueue(&first).await.unwrap();
        state.enqueue(&second).await.unwrap();

        let entry = state.pop_next().await.unwrap().unwrap();
        assert_eq!(entry.task_id, first.id);

        state.requeue(entry).await.unwrap();
        assert_eq!(
            state.queued_entries().await.unwrap()[0].task_id,
            first.id
        );
    }

    #[tokio::test]
    async fn test_slot_acquisition_respects_limit() {
        let state = state();
        let now = Utc::now();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(state.try_acquire_slot(a, now, 2).await.unwrap());
        assert!(state.try_acquire_slot(b, now, 2).await.unwrap());
        assert!(!state.try_acquire_slot(c, now, 2).await.unwrap());
        assert!(state.try_acquire_slot(a, now, 2).await.unwrap(), "重复占用视为成功");

        assert!(state.release_slot(a).await.unwrap());
        assert!(!state.release_slot(a).await.unwrap());
        assert!(state.try_acquire_slot(c, now, 2).await.unwrap());
        assert_eq!(state.active_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_task_reports_applied() {
        let state = state();
        let task = record(0);
        state.save_task(&task).await.unwrap();

        let (updated, applied) = state
            .update_task(task.id, |r| r.start(Utc::now()).is_ok())
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(updated.status, TaskStatus::Running);

        let (_, applied) = state
            .update_task(task.id, |r| r.start(Utc::now()).is_ok())
            .await
            .unwrap();
        assert!(!applied);

        let missing = state.update_task(Uuid::new_v4(), |_| true).await;
        assert!(matches!(missing, Err(SyncError::TaskNotFound { .. })));
    }

    #[tokio::test]
    async fn test_task_control() {
        let state = state();
        let mut task = record(0);
        task.start(Utc::now() - chrono::Duration::seconds(30)).unwrap();
        state.save_task(&task).await.unwrap();

        state.heartbeat(task.id).await.unwrap();
        let loaded = state.load_task(task.id).await.unwrap().unwrap();
        assert!(loaded.last_heartbeat > task.last_heartbeat);

        assert!(!state.is_cancel_requested(task.id).await.unwrap());
        state.set_cancel_flag(task.id).await.unwrap();
        assert!(state.is_cancel_requested(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_counters() {
        let state = state();
        state.bump(Counter::Submitted).await.unwrap();
        state.bump(Counter::Submitted).await.unwrap();
        state.bump(Counter::Stale).await.unwrap();
        let counters = state.counters().await.unwrap();
        assert_eq!(counters.submitted, 2);
        assert_eq!(counters.stale, 1);
    }
}
