//! 调度器测试替身
//!
//! - [`ScriptedRuntime`]: 记录提交、按脚本返回状态的执行运行时
//! - [`FlakyStore`]: 可以随时切换为不可用，或让指定键的原子更新失败的内存共享存储

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use datasync_core::{
    ExecutionHandle, JobExecutionRuntime, JobPayload, JobReference, PersistentQueueStore,
    RuntimeJobStatus, SyncError, SyncResult, UpdateFn,
};
use datasync_infrastructure::InMemoryQueueStore;
use serde_json::Value;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub job_ref: JobReference,
    pub payload: JobPayload,
    pub handle: ExecutionHandle,
}

/// 脚本化执行运行时
///
/// 提交的作业默认处于 `Running`，测试通过 [`ScriptedRuntime::set_task_status`] 模拟运行时侧的结束。
#[derive(Default)]
pub struct ScriptedRuntime {
    submissions: Mutex<Vec<Submission>>,
    statuses: Mutex<HashMap<ExecutionHandle, RuntimeJobStatus>>,
    rejected: Mutex<HashSet<String>>,
    cancel_requests: Mutex<Vec<ExecutionHandle>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后对该作业引用的提交都同步拒绝
    pub fn reject(&self, job_ref: &str) {
        lock(&self.rejected).insert(job_ref.to_string());
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.submissions).clone()
    }

    /// 按提交顺序返回任务ID
    pub fn dispatched_tasks(&self) -> Vec<Uuid> {
        lock(&self.submissions)
            .iter()
            .map(|s| s.payload.task_id)
            .collect()
    }

    pub fn handle_for(&self, task_id: Uuid) -> Option<ExecutionHandle> {
        lock(&self.submissions)
            .iter()
            .find(|s| s.payload.task_id == task_id)
            .map(|s| s.handle.clone())
    }

    pub fn set_task_status(&self, task_id: Uuid, status: RuntimeJobStatus) {
        if let Some(handle) = self.handle_for(task_id) {
            lock(&self.statuses).insert(handle, status);
        }
    }

    pub fn cancel_requests(&self) -> Vec<ExecutionHandle> {
        lock(&self.cancel_requests).clone()
    }
}

#[async_trait]
impl JobExecutionRuntime for ScriptedRuntime {
    async fn submit(
        &self,
        job_ref: &JobReference,
        payload: JobPayload,
    ) -> SyncResult<ExecutionHandle> {
        if lock(&self.rejected).contains(job_ref.as_str()) {
            return Err(SyncError::Dispatch(format!("运行时拒绝作业: {job_ref}")));
        }
        let handle = ExecutionHandle::new(format!("scripted-{}", payload.task_id));
        lock(&self.statuses).insert(handle.clone(), RuntimeJobStatus::Running);
        lock(&self.submissions).push(Submission {
            job_ref: job_ref.clone(),
            payload,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    async fn get_status(&self, handle: &ExecutionHandle) -> SyncResult<RuntimeJobStatus> {
        Ok(lock(&self.statuses)
            .get(handle)
            .cloned()
            .unwrap_or(RuntimeJobStatus::Unknown))
    }

    async fn request_cancel(&self, handle: &ExecutionHandle) -> SyncResult<()> {
        lock(&self.cancel_requests).push(handle.clone());
        Ok(())
    }
}

#[derive(Debug)]
struct UpdateFault {
    fragment: String,
    skip: usize,
    remaining: usize,
}

/// 可切换为不可用的共享存储
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryQueueStore,
    down: AtomicBool,
    update_fault: Mutex<Option<UpdateFault>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// 键包含 `fragment` 的原子更新：先放行 `skip` 次，之后失败 `times` 次
    pub fn fail_updates(&self, fragment: &str, skip: usize, times: usize) {
        *lock(&self.update_fault) = Some(UpdateFault {
            fragment: fragment.to_string(),
            skip,
            remaining: times,
        });
    }

    fn check_update(&self, key: &str) -> SyncResult<()> {
        let mut fault = lock(&self.update_fault);
        let Some(f) = fault.as_mut() else {
            return Ok(());
        };
        if !key.contains(&f.fragment) || f.remaining == 0 {
            return Ok(());
        }
        if f.skip > 0 {
            f.skip -= 1;
            return Ok(());
        }
        f.remaining -= 1;
        Err(SyncError::StoreUnavailable("写入超时".to_string()))
    }

    fn check(&self) -> SyncResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SyncError::StoreUnavailable("连接被拒绝".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistentQueueStore for FlakyStore {
    async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> SyncResult<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> SyncResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn atomic_update(&self, key: &str, update: &UpdateFn<'_>) -> SyncResult<Option<Value>> {
        self.check()?;
        self.check_update(key)?;
        self.inner.atomic_update(key, update).await
    }
}
