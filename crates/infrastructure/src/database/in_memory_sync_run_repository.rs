use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use datasync_core::{
    SyncError, SyncResult, SyncRunFilter, SyncRunRecord, SyncRunRepository,
};
use tokio::sync::RwLock;

/// 内存同步运行记录仓库
#[derive(Debug)]
pub struct InMemorySyncRunRepository {
    runs: RwLock<Vec<SyncRunRecord>>,
    next_id: AtomicI64,
}

impl Default for InMemorySyncRunRepository {
    fn default() -> Self {
        Self {
            runs: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl InMemorySyncRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接插入一条已存在的记录，测试中用来构造历史
    pub async fn insert(&self, mut run: SyncRunRecord) -> SyncRunRecord {
        run.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.runs.write().await.push(run.clone());
        run
    }
}

#[async_trait]
impl SyncRunRepository for InMemorySyncRunRepository {
    async fn create(&self, run: &SyncRunRecord) -> SyncResult<SyncRunRecord> {
        Ok(self.insert(run.clone()).await)
    }

    async fn finish(&self, run: &SyncRunRecord) -> SyncResult<()> {
        if !run.is_finished() {
            return Err(SyncError::InvalidTransition {
                from: run.status.as_str().to_string(),
                to: "FINISHED".to_string(),
            });
        }

        let mut runs = self.runs.write().await;
        let stored = runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or(SyncError::RunNotFound { id: run.id })?;

        if stored.is_finished() {
            return Err(SyncError::RunAlreadyFinished { id: run.id });
        }

        *stored = run.clone();
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> SyncResult<Option<SyncRunRecord>> {
        let runs = self.runs.read().await;
        Ok(runs.iter().find(|r| r.id == id).cloned())
    }

    async fn latest_successful(
        &self,
        source_system: &str,
        operation: &str,
    ) -> SyncResult<Option<SyncRunRecord>> {
        let runs = self.runs.read().await;
        Ok(runs
            .iter()
            .filter(|r| {
                r.source_system == source_system
                    && r.operation == operation
                    && r.status.is_delta_anchor()
                    && r.end_time.is_some()
            })
            .max_by_key(|r| (r.end_time, r.id))
            .cloned())
    }

    async fn query(&self, filter: &SyncRunFilter) -> SyncResult<Vec<SyncRunRecord>> {
        let runs = self.runs.read().await;
        let mut matched: Vec<SyncRunRecord> =
            runs.iter().filter(|r| filter.matches(r)).cloned().collect();
        matched.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit.max(0) as usize);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use datasync_core::{SyncCounts, SyncRunStatus};
    use serde_json::json;

    #[tokio::test]
    async fn test_create_assigns_ids() {
        let repo = InMemorySyncRunRepository::new();
        let a = repo
            .create(&SyncRunRecord::start("crm", "contacts", json!({})))
            .await
            .unwrap();
        let b = repo
            .create(&SyncRunRecord::start("crm", "contacts", json!({})))
            .await
            .unwrap();
        assert!(b.id > a.id);
        assert_eq!(repo.get_by_id(a.id).await.unwrap().unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_finish_is_write_once() {
        let repo = InMemorySyncRunRepository::new();
        let mut run = repo
            .create(&SyncRunRecord::start("crm", "contacts", json!({})))
            .await
            .unwrap();

        assert!(matches!(
            repo.finish(&run).await,
            Err(SyncError::InvalidTransition { .. })
        ));

        run.finish(SyncCounts::default(), 0, Utc::now()).unwrap();
        repo.finish(&run).await.unwrap();
        assert!(matches!(
            repo.finish(&run).await,
            Err(SyncError::RunAlreadyFinished { .. })
        ));
    }

    #[tokio::test]
    async fn test_latest_successful_skips_failed_and_running() {
        let repo = InMemorySyncRunRepository::new();
        let base = Utc::now();

        let mut old = SyncRunRecord::start("crm", "contacts", json!({}));
        old.finish(SyncCounts::default(), 0, base).unwrap();
        let old = repo.insert(old).await;

        let mut partial = SyncRunRecord::start("crm", "contacts", json!({}));
        partial
            .finish(
                SyncCounts {
                    failed: 1,
                    ..Default::default()
                },
                0,
                base + Duration::seconds(10),
            )
            .unwrap();
        let partial = repo.insert(partial).await;

        let mut failed = SyncRunRecord::start("crm", "contacts", json!({}));
        failed
            .fail(SyncCounts::default(), "down", base + Duration::seconds(20))
            .unwrap();
        repo.insert(failed).await;
        repo.insert(SyncRunRecord::start("crm", "contacts", json!({})))
            .await;

        let latest = repo
            .latest_successful("crm", "contacts")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, partial.id);
        assert_eq!(latest.status, SyncRunStatus::Partial);
        assert_ne!(latest.id, old.id);

        assert!(repo
            .latest_successful("erp", "contacts")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_query_newest_first_with_limit() {
        let repo = InMemorySyncRunRepository::new();
        for i in 0..5 {
            let mut run = SyncRunRecord::start("crm", "contacts", json!({}));
            run.start_time = Utc::now() + Duration::seconds(i);
            repo.insert(run).await;
        }
        let filter = SyncRunFilter {
            limit: Some(2),
            ..SyncRunFilter::for_job("crm", "contacts")
        };
        let runs = repo.query(&filter).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].start_time > runs[1].start_time);
    }
}
