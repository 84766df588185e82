use async_trait::async_trait;

use crate::{
    models::{SyncRunFilter, SyncRunRecord},
    SyncResult,
};

/// 同步运行审计记录仓库
///
/// 记录只追加；`finish` 写入结束状态后记录不可再修改。
#[async_trait]
pub trait SyncRunRepository: Send + Sync {
    /// 插入运行中的记录，返回分配了 `id` 的记录
    async fn create(&self, run: &SyncRunRecord) -> SyncResult<SyncRunRecord>;

    /// 写入结束状态，已结束的记录返回 `SyncError::RunAlreadyFinished`
    async fn finish(&self, run: &SyncRunRecord) -> SyncResult<()>;

    async fn get_by_id(&self, id: i64) -> SyncResult<Option<SyncRunRecord>>;

    /// 同一 `(source_system, operation)` 最近一条 Success/Partial 记录，按 `end_time` 排序
    async fn latest_successful(
        &self,
        source_system: &str,
        operation: &str,
    ) -> SyncResult<Option<SyncRunRecord>>;

    /// 按条件查询历史，按开始时间倒序
    async fn query(&self, filter: &SyncRunFilter) -> SyncResult<Vec<SyncRunRecord>>;
}
