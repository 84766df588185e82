//! 管道测试替身
//!
//! - [`ScriptedSource`]: 按脚本产出批次或错误的数据源，记录拉取参数和关闭情况
//! - [`MemorySink`]: 以 `id` 字段为键的内存写入目标
//! - [`FlakySink`]: 批量写入总是失败，逐条写入对 `"poison": true` 的记录失败

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datasync_core::{SyncError, SyncResult};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::mapping::RecordMapper;
use crate::saver::{BulkSaver, RecordSink, UpsertOutcome};
use crate::source::{PipelineComponents, RecordBatch, SyncSource};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
enum Step {
    Batch(RecordBatch),
    Fail(String),
}

#[derive(Default)]
struct SourceState {
    fetches: Mutex<Vec<(Option<DateTime<Utc>>, usize)>>,
    authenticated: AtomicBool,
    closed: AtomicBool,
}

/// 脚本化数据源
///
/// 克隆体共享观测状态，可以把一个克隆交给管道，另一个留在测试中断言。
#[derive(Clone, Default)]
pub struct ScriptedSource {
    steps: Vec<Step>,
    auth_error: Option<String>,
    cancel_after: Option<(usize, CancellationToken)>,
    state: Arc<SourceState>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch(mut self, records: RecordBatch) -> Self {
        self.steps.push(Step::Batch(records));
        self
    }

    pub fn fail(mut self, message: &str) -> Self {
        self.steps.push(Step::Fail(message.to_string()));
        self
    }

    pub fn reject_auth(mut self, message: &str) -> Self {
        self.auth_error = Some(message.to_string());
        self
    }

    /// 产出第 `batches` 个批次时触发令牌
    pub fn cancel_after(mut self, batches: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((batches, token));
        self
    }

    /// 每次 `fetch` 的 `(since, batch_size)`
    pub fn fetches(&self) -> Vec<(Option<DateTime<Utc>>, usize)> {
        lock(&self.state.fetches).clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.authenticated.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn components(
        &self,
        mapper: Arc<dyn RecordMapper>,
        sink: Arc<dyn RecordSink>,
    ) -> PipelineComponents {
        PipelineComponents {
            source: Box::new(self.clone()),
            mapper,
            saver: Arc::new(BulkSaver::new(sink)),
        }
    }
}

#[async_trait]
impl SyncSource for ScriptedSource {
    async fn authenticate(&self) -> SyncResult<()> {
        if let Some(message) = &self.auth_error {
            return Err(SyncError::Source(message.clone()));
        }
        self.state.authenticated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn fetch(
        &self,
        since: Option<DateTime<Utc>>,
        batch_size: usize,
    ) -> BoxStream<'_, SyncResult<RecordBatch>> {
        lock(&self.state.fetches).push((since, batch_size));
        let cancel_after = self.cancel_after.clone();
        stream::iter(self.steps.clone().into_iter().enumerate())
            .map(move |(index, step)| {
                if let Some((after, token)) = &cancel_after {
                    if index + 1 == *after {
                        token.cancel();
                    }
                }
                match step {
                    Step::Batch(records) => Ok(records),
                    Step::Fail(message) => Err(SyncError::Source(message)),
                }
            })
            .boxed()
    }

    async fn close(&self) -> SyncResult<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn record_key(record: &Value) -> String {
    record
        .get("id")
        .map(Value::to_string)
        .unwrap_or_else(|| record.to_string())
}

/// 内存写入目标
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<HashMap<String, Value>>,
    bulk_calls: AtomicUsize,
    individual_calls: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &Value) -> Option<Value> {
        lock(&self.records).get(&id.to_string()).cloned()
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn individual_calls(&self) -> usize {
        self.individual_calls.load(Ordering::SeqCst)
    }

    fn put(&self, record: &Value) -> UpsertOutcome {
        match lock(&self.records).insert(record_key(record), record.clone()) {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Created,
        }
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn bulk_upsert(&self, records: &[Value]) -> SyncResult<Vec<UpsertOutcome>> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        Ok(records.iter().map(|r| self.put(r)).collect())
    }

    async fn upsert(&self, record: &Value) -> SyncResult<UpsertOutcome> {
        self.individual_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.put(record))
    }
}

/// 批量写入总是失败的写入目标
#[derive(Default)]
pub struct FlakySink {
    inner: MemorySink,
    bulk_attempts: AtomicUsize,
    individual_attempts: AtomicUsize,
}

impl FlakySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(&self) -> usize {
        self.inner.len()
    }

    pub fn bulk_attempts(&self) -> usize {
        self.bulk_attempts.load(Ordering::SeqCst)
    }

    pub fn individual_attempts(&self) -> usize {
        self.individual_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for FlakySink {
    async fn bulk_upsert(&self, records: &[Value]) -> SyncResult<Vec<UpsertOutcome>> {
        self.bulk_attempts.fetch_add(1, Ordering::SeqCst);
        Err(SyncError::BulkSave(format!(
            "目标拒绝了 {} 条记录的批量写入",
            records.len()
        )))
    }

    async fn upsert(&self, record: &Value) -> SyncResult<UpsertOutcome> {
        self.individual_attempts.fetch_add(1, Ordering::SeqCst);
        if record.get("poison").and_then(Value::as_bool).unwrap_or(false) {
            return Err(SyncError::Internal(format!(
                "记录 {} 格式错误",
                record_key(record)
            )));
        }
        self.inner.upsert(record).await
    }
}
