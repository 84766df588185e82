use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 作业类型
///
/// 由 `(source_system, operation)` 二元组标识一类同步工作，例如
/// `("crm", "contacts")`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKind {
    pub source_system: String,
    pub operation: String,
}

impl JobKind {
    pub fn new(source_system: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            source_system: source_system.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_system, self.operation)
    }
}

/// 运行时可解析的作业引用（例如注册在运行时中的处理器名称）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobReference(String);

impl JobReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 执行运行时返回的执行句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionHandle(String);

impl ExecutionHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 提交给执行运行时的载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub task_id: Uuid,
    pub job_kind: JobKind,
    pub parameters: serde_json::Value,
}

/// 运行时视角下的作业真实状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeJobStatus {
    Pending,
    Running,
    Succeeded { result: Option<serde_json::Value> },
    Failed { error: String },
    Cancelled,
    /// 运行时不认识该句柄（例如运行时重启后丢失）
    Unknown,
}

impl RuntimeJobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RuntimeJobStatus::Succeeded { .. }
                | RuntimeJobStatus::Failed { .. }
                | RuntimeJobStatus::Cancelled
        )
    }
}

/// 作业执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Succeeded { result: Option<serde_json::Value> },
    Failed { error: String },
}

impl TaskOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }
}

/// 运行时推送的完成事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletion {
    pub task_id: Uuid,
    pub handle: ExecutionHandle,
    pub outcome: TaskOutcome,
    pub finished_at: DateTime<Utc>,
}
