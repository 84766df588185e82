use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{SyncError, SyncResult};

/// 同步运行审计记录
///
/// 管道每执行一次追加一条。`end_time` 当且仅当状态不为 `Running` 时存在，
/// 写入 `end_time` 之后记录不可再修改。增量同步以同一 `(source_system, operation)`
/// 最近一条 `Success`/`Partial` 记录的 `end_time` 作为起点。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub id: i64,
    pub source_system: String,
    pub operation: String,
    pub status: SyncRunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub counts: SyncCounts,
    pub error_message: Option<String>,
    /// 本次运行的输入回显（策略、since、批大小等）
    pub configuration: serde_json::Value,
    pub performance_metrics: Option<PerformanceMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncRunStatus {
    Running,
    Success,
    Failed,
    Partial,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Running => "RUNNING",
            SyncRunStatus::Success => "SUCCESS",
            SyncRunStatus::Failed => "FAILED",
            SyncRunStatus::Partial => "PARTIAL",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(SyncRunStatus::Running),
            "SUCCESS" => Ok(SyncRunStatus::Success),
            "FAILED" => Ok(SyncRunStatus::Failed),
            "PARTIAL" => Ok(SyncRunStatus::Partial),
            _ => Err(SyncError::Serialization(format!(
                "无效的同步运行状态: {s}"
            ))),
        }
    }

    /// 可作为增量同步起点的状态
    pub fn is_delta_anchor(&self) -> bool {
        matches!(self, SyncRunStatus::Success | SyncRunStatus::Partial)
    }
}

impl sqlx::Type<sqlx::Sqlite> for SyncRunStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for SyncRunStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        SyncRunStatus::parse(s).map_err(|e| e.to_string().into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for SyncRunStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 记录计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub processed: i64,
    pub created: i64,
    pub updated: i64,
    pub failed: i64,
}

impl SyncCounts {
    pub fn merge(&mut self, other: &SyncCounts) {
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.failed += other.failed;
    }
}

/// 运行性能指标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub duration_ms: i64,
    pub records_per_second: f64,
    pub batches: i64,
}

impl PerformanceMetrics {
    pub fn compute(start: DateTime<Utc>, end: DateTime<Utc>, processed: i64, batches: i64) -> Self {
        let duration_ms = (end - start).num_milliseconds().max(0);
        let records_per_second = if duration_ms > 0 {
            processed as f64 * 1000.0 / duration_ms as f64
        } else {
            processed as f64
        };
        Self {
            duration_ms,
            records_per_second,
            batches,
        }
    }
}

impl SyncRunRecord {
    /// 创建运行中的记录，`id` 由仓库分配
    pub fn start(
        source_system: impl Into<String>,
        operation: impl Into<String>,
        configuration: serde_json::Value,
    ) -> Self {
        Self {
            id: 0,
            source_system: source_system.into(),
            operation: operation.into(),
            status: SyncRunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            counts: SyncCounts::default(),
            error_message: None,
            configuration,
            performance_metrics: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// 正常结束：无失败记录为 `Success`，否则为 `Partial`
    pub fn finish(&mut self, counts: SyncCounts, batches: i64, now: DateTime<Utc>) -> SyncResult<()> {
        self.ensure_open()?;
        self.status = if counts.failed == 0 {
            SyncRunStatus::Success
        } else {
            SyncRunStatus::Partial
        };
        self.counts = counts;
        self.end_time = Some(now);
        self.performance_metrics = Some(PerformanceMetrics::compute(
            self.start_time,
            now,
            counts.processed,
            batches,
        ));
        Ok(())
    }

    /// 运行级失败，保留已累计的计数
    pub fn fail(
        &mut self,
        counts: SyncCounts,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> SyncResult<()> {
        self.ensure_open()?;
        self.status = SyncRunStatus::Failed;
        self.counts = counts;
        self.error_message = Some(error.into());
        self.end_time = Some(now);
        Ok(())
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.is_finished() {
            return Err(SyncError::RunAlreadyFinished { id: self.id });
        }
        Ok(())
    }
}

/// 同步历史查询条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRunFilter {
    pub source_system: Option<String>,
    pub operation: Option<String>,
    pub status: Option<SyncRunStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl SyncRunFilter {
    pub fn for_job(source_system: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            source_system: Some(source_system.into()),
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, run: &SyncRunRecord) -> bool {
        if let Some(source) = &self.source_system {
            if &run.source_system != source {
                return false;
            }
        }
        if let Some(operation) = &self.operation {
            if &run.operation != operation {
                return false;
            }
        }
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(after) = self.started_after {
            if run.start_time < after {
                return false;
            }
        }
        if let Some(before) = self.started_before {
            if run.start_time >= before {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_finish_sets_status_from_failed_count() {
        let mut run = SyncRunRecord::start("crm", "contacts", json!({}));
        let end = run.start_time + Duration::seconds(2);
        run.finish(
            SyncCounts {
                processed: 10,
                created: 10,
                ..Default::default()
            },
            1,
            end,
        )
        .unwrap();
        assert_eq!(run.status, SyncRunStatus::Success);
        assert_eq!(run.end_time, Some(end));
        let metrics = run.performance_metrics.as_ref().unwrap();
        assert_eq!(metrics.duration_ms, 2000);
        assert!((metrics.records_per_second - 5.0).abs() < f64::EPSILON);

        let mut partial = SyncRunRecord::start("crm", "contacts", json!({}));
        partial
            .finish(
                SyncCounts {
                    processed: 11,
                    created: 10,
                    failed: 1,
                    ..Default::default()
                },
                1,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(partial.status, SyncRunStatus::Partial);
    }

    #[test]
    fn test_finished_run_is_immutable() {
        let mut run = SyncRunRecord::start("crm", "contacts", json!({}));
        run.fail(SyncCounts::default(), "source down", Utc::now()).unwrap();
        assert_eq!(run.status, SyncRunStatus::Failed);
        assert!(matches!(
            run.finish(SyncCounts::default(), 0, Utc::now()),
            Err(SyncError::RunAlreadyFinished { .. })
        ));
        assert_eq!(run.error_message.as_deref(), Some("source down"));
    }

    #[test]
    fn test_filter_matches() {
        let run = SyncRunRecord::start("crm", "contacts", json!({}));
        assert!(SyncRunFilter::default().matches(&run));
        assert!(SyncRunFilter::for_job("crm", "contacts").matches(&run));
        assert!(!SyncRunFilter::for_job("erp", "contacts").matches(&run));

        let filter = SyncRunFilter {
            status: Some(SyncRunStatus::Success),
            ..Default::default()
        };
        assert!(!filter.matches(&run));

        let filter = SyncRunFilter {
            started_before: Some(run.start_time),
            ..Default::default()
        };
        assert!(!filter.matches(&run));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(SyncRunStatus::parse("partial").unwrap(), SyncRunStatus::Partial);
        assert!(SyncRunStatus::parse("DONE").is_err());
        assert!(SyncRunStatus::Partial.is_delta_anchor());
        assert!(!SyncRunStatus::Failed.is_delta_anchor());
    }
}
