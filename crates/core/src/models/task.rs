use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{ExecutionHandle, JobKind};
use crate::errors::{SyncError, SyncResult};

/// 调度任务记录
///
/// 表示一次作业提交在调度器中的完整生命周期。
///
/// # 字段说明
///
/// - `id`: 任务唯一标识
/// - `job_kind`: 作业类型 `(source_system, operation)`
/// - `parameters`: 透传给管道的参数，JSON 对象
/// - `status`: 任务状态，只允许向前转换
/// - `priority`: 优先级，数值越大越先执行
/// - `queued_at` / `started_at` / `completed_at`: 排队、开始、结束时间
/// - `execution_handle`: 运行时返回的执行句柄，一个句柄只属于一条记录
/// - `error`: 失败原因，取消的任务不携带错误信息
/// - `last_heartbeat`: 最近一次心跳，运行期间单调不减
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub job_kind: JobKind,
    pub parameters: serde_json::Value,
    pub status: TaskStatus,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_handle: Option<ExecutionHandle>,
    pub error: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// 任务状态
///
/// 合法转换：`Queued -> Running -> {Completed, Failed}`，以及
/// `Queued | Running -> Cancelled`。终态不可再转换。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, to),
            (Queued, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Queued, Cancelled)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TaskRecord {
    /// 创建排队状态的新任务
    pub fn new(job_kind: JobKind, parameters: serde_json::Value, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_kind,
            parameters,
            status: TaskStatus::Queued,
            priority,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            execution_handle: None,
            error: None,
            last_heartbeat: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, to: TaskStatus) -> SyncResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(SyncError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// 晋升为运行状态，同时写入开始时间和初始心跳
    pub fn start(&mut self, now: DateTime<Utc>) -> SyncResult<()> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(now);
        self.last_heartbeat = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> SyncResult<()> {
        self.transition(TaskStatus::Completed)?;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>) -> SyncResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.completed_at = Some(now);
        self.error = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> SyncResult<()> {
        self.transition(TaskStatus::Cancelled)?;
        self.completed_at = Some(now);
        self.error = None;
        Ok(())
    }

    /// 记录心跳，只在运行状态下生效，且不会让心跳时间倒退
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.last_heartbeat {
            Some(last) if last >= at => false,
            _ => {
                self.last_heartbeat = Some(at);
                true
            }
        }
    }

    /// 距离上次心跳的时长，没有心跳时以开始时间计算
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_heartbeat
            .or(self.started_at)
            .map(|last| now - last)
    }
}
