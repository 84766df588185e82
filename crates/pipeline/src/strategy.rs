use std::fmt;

use chrono::{DateTime, Utc};
use datasync_core::{SyncResult, SyncRunRepository};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 同步策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncStrategy {
    Full,
    Incremental { since: DateTime<Utc> },
}

impl SyncStrategy {
    pub fn since(&self) -> Option<DateTime<Utc>> {
        match self {
            SyncStrategy::Full => None,
            SyncStrategy::Incremental { since } => Some(*since),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncStrategy::Full => "full",
            SyncStrategy::Incremental { .. } => "incremental",
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStrategy::Full => f.write_str("full"),
            SyncStrategy::Incremental { since } => write!(f, "incremental(since={since})"),
        }
    }
}

/// 选择本次运行的同步策略
///
/// 优先级：手动指定起点 > 强制全量 > 最近一次 Success/Partial 运行的结束时间 > 全量。
/// 起点精确取上次运行的 `end_time`，不做回拨。
pub async fn determine_strategy(
    repository: &dyn SyncRunRepository,
    source_system: &str,
    operation: &str,
    force_full: bool,
    manual_since: Option<DateTime<Utc>>,
) -> SyncResult<SyncStrategy> {
    if let Some(since) = manual_since {
        debug!("{}/{} 使用手动指定的增量起点 {}", source_system, operation, since);
        return Ok(SyncStrategy::Incremental { since });
    }
    if force_full {
        return Ok(SyncStrategy::Full);
    }

    let strategy = match repository
        .latest_successful(source_system, operation)
        .await?
        .and_then(|run| run.end_time)
    {
        Some(since) => SyncStrategy::Incremental { since },
        None => SyncStrategy::Full,
    };
    debug!("{}/{} 选择同步策略 {}", source_system, operation, strategy);
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use datasync_core::{SyncCounts, SyncRunRecord};
    use datasync_infrastructure::InMemorySyncRunRepository;
    use serde_json::json;

    async fn seed(repo: &InMemorySyncRunRepository, operation: &str, end: DateTime<Utc>, failed: bool) {
        let mut run = repo
            .create(&SyncRunRecord::start("crm", operation, json!({})))
            .await
            .unwrap();
        if failed {
            run.fail(SyncCounts::default(), "boom", end).unwrap();
        } else {
            run.finish(SyncCounts::default(), 0, end).unwrap();
        }
        repo.finish(&run).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_history_means_full() {
        let repo = InMemorySyncRunRepository::new();
        let strategy = determine_strategy(&repo, "crm", "contacts", false, None)
            .await
            .unwrap();
        assert_eq!(strategy, SyncStrategy::Full);
    }

    #[tokio::test]
    async fn test_incremental_from_last_success_end_time() {
        let repo = InMemorySyncRunRepository::new();
        let success_end = Utc::now() - Duration::hours(2);
        seed(&repo, "contacts", success_end, false).await;
        // 失败运行与其他操作不影响起点
        seed(&repo, "contacts", Utc::now() - Duration::hours(1), true).await;
        seed(&repo, "deals", Utc::now(), false).await;

        let strategy = determine_strategy(&repo, "crm", "contacts", false, None)
            .await
            .unwrap();
        assert_eq!(strategy.since(), Some(success_end));
    }

    #[tokio::test]
    async fn test_overrides() {
        let repo = InMemorySyncRunRepository::new();
        seed(&repo, "contacts", Utc::now(), false).await;

        let forced = determine_strategy(&repo, "crm", "contacts", true, None)
            .await
            .unwrap();
        assert_eq!(forced, SyncStrategy::Full);

        let manual = Utc::now() - Duration::days(7);
        let strategy = determine_strategy(&repo, "crm", "contacts", true, Some(manual))
            .await
            .unwrap();
        assert_eq!(strategy, SyncStrategy::Incremental { since: manual });
    }
}
