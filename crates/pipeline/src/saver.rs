use std::sync::Arc;

use async_trait::async_trait;
use datasync_core::{SyncCounts, SyncResult};
use datasync_infrastructure::MetricsCollector;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// 单条记录写入目标后的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// 目标系统写入接口
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// 整批写入，返回与输入一一对应的结果；任何错误视为整批失败
    async fn bulk_upsert(&self, records: &[Value]) -> SyncResult<Vec<UpsertOutcome>>;

    async fn upsert(&self, record: &Value) -> SyncResult<UpsertOutcome>;
}

/// 单条记录写入失败详情
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    /// 记录在本批次中的下标，经 [`SaveReport::remap_indices`] 换算后为原始块中的下标
    pub index: usize,
    pub message: String,
}

/// 一批记录的保存结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReport {
    pub created: i64,
    pub updated: i64,
    pub failed: i64,
    pub errors: Vec<RecordError>,
    /// 是否由批量写入回退到逐条写入
    pub fell_back: bool,
}

impl SaveReport {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }

    fn record_error(&mut self, index: usize, message: String) {
        self.failed += 1;
        self.errors.push(RecordError { index, message });
    }

    /// 把下标从保存时的切片换算回原始块，`positions[i]` 是保存切片第 `i` 条在原始块中的位置
    pub fn remap_indices(&mut self, positions: &[usize]) {
        for error in &mut self.errors {
            if let Some(&original) = positions.get(error.index) {
                error.index = original;
            }
        }
    }

    pub fn attempted(&self) -> i64 {
        self.created + self.updated + self.failed
    }

    pub fn counts(&self) -> SyncCounts {
        SyncCounts {
            processed: self.attempted(),
            created: self.created,
            updated: self.updated,
            failed: self.failed,
        }
    }
}

/// 批次保存策略
///
/// 保存不会因单条记录失败而返回错误，失败体现在 `SaveReport` 中。
#[async_trait]
pub trait BatchSaver: Send + Sync {
    async fn save(&self, records: &[Value]) -> SaveReport;
}

/// 逐条保存
pub struct IndividualSaver {
    sink: Arc<dyn RecordSink>,
}

impl IndividualSaver {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }

    async fn save_into(&self, records: &[Value], report: &mut SaveReport) {
        for (index, record) in records.iter().enumerate() {
            match self.sink.upsert(record).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    debug!("第 {} 条记录写入失败: {}", index, e);
                    report.record_error(index, e.to_string());
                }
            }
        }
    }
}

#[async_trait]
impl BatchSaver for IndividualSaver {
    async fn save(&self, records: &[Value]) -> SaveReport {
        let mut report = SaveReport::default();
        self.save_into(records, &mut report).await;
        report
    }
}

/// 批量优先保存
///
/// 先整批写入；整批失败或返回结果数量不符时，对同一批的每条记录逐条重试，
/// 失败只计入对应记录。
pub struct BulkSaver {
    sink: Arc<dyn RecordSink>,
    fallback: IndividualSaver,
    metrics: Option<Arc<MetricsCollector>>,
}

impl BulkSaver {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self {
            fallback: IndividualSaver::new(sink.clone()),
            sink,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl BatchSaver for BulkSaver {
    async fn save(&self, records: &[Value]) -> SaveReport {
        let mut report = SaveReport::default();
        if records.is_empty() {
            return report;
        }

        let reason = match self.sink.bulk_upsert(records).await {
            Ok(outcomes) if outcomes.len() == records.len() => {
                for outcome in outcomes {
                    report.record(outcome);
                }
                return report;
            }
            Ok(outcomes) => format!(
                "批量写入返回 {} 条结果，期望 {} 条",
                outcomes.len(),
                records.len()
            ),
            Err(e) => e.to_string(),
        };

        warn!(
            "批量写入 {} 条记录失败，回退为逐条写入: {}",
            records.len(),
            reason
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_bulk_fallback();
        }
        report.fell_back = true;
        self.fallback.save_into(records, &mut report).await;
        report
    }
}
