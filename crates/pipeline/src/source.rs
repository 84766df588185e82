use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datasync_core::{JobKind, SyncError, SyncResult};
use futures::stream::BoxStream;
use serde_json::Value;

use crate::mapping::RecordMapper;
use crate::saver::BatchSaver;

/// 源系统返回的一批原始记录
pub type RecordBatch = Vec<Value>;

/// 数据源客户端
///
/// 生命周期：`authenticate` -> `fetch` 返回的批次流被消费到结束 -> `close`。
/// 流结束表示数据已取尽；流中的 `Err` 视为整次运行失败。
/// 管道在每一条退出路径上都会调用 `close`。
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn authenticate(&self) -> SyncResult<()>;

    /// 惰性拉取记录，`since` 为 `None` 表示全量
    fn fetch(
        &self,
        since: Option<DateTime<Utc>>,
        batch_size: usize,
    ) -> BoxStream<'_, SyncResult<RecordBatch>>;

    async fn close(&self) -> SyncResult<()>;
}

/// 一次运行所需的源相关组件
pub struct PipelineComponents {
    pub source: Box<dyn SyncSource>,
    pub mapper: Arc<dyn RecordMapper>,
    pub saver: Arc<dyn BatchSaver>,
}

/// 按作业类型创建数据源组件
pub trait SourceFactory: Send + Sync {
    fn create(&self, job_kind: &JobKind) -> SyncResult<PipelineComponents>;
}

type ComponentBuilder = dyn Fn() -> SyncResult<PipelineComponents> + Send + Sync;

/// 以作业类型为键的组件构造表
///
/// 连接器由嵌入方注册；未注册的作业类型在运行时以 `SyncError::Source` 失败。
#[derive(Default)]
pub struct StaticSourceFactory {
    builders: RwLock<HashMap<JobKind, Arc<ComponentBuilder>>>,
}

impl StaticSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, job_kind: JobKind, builder: F)
    where
        F: Fn() -> SyncResult<PipelineComponents> + Send + Sync + 'static,
    {
        if let Ok(mut builders) = self.builders.write() {
            builders.insert(job_kind, Arc::new(builder));
        }
    }

    pub fn registered(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self
            .builders
            .read()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        kinds.sort();
        kinds
    }
}

impl SourceFactory for StaticSourceFactory {
    fn create(&self, job_kind: &JobKind) -> SyncResult<PipelineComponents> {
        let builder = self
            .builders
            .read()
            .ok()
            .and_then(|b| b.get(job_kind).cloned())
            .ok_or_else(|| SyncError::Source(format!("作业类型 {job_kind} 未配置数据源连接器")))?;
        builder()
    }
}
