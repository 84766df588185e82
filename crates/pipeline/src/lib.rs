//! # datasync-pipeline
//!
//! 通用同步管道：按策略从数据源拉取批次，映射、校验并保存记录，
//! 每次运行追加一条 `SyncRunRecord`。
//!
//! 数据源连接器、字段映射和目标写入都通过 trait 注入：
//! [`SyncSource`]、[`RecordMapper`]、[`RecordSink`]。

pub mod job;
pub mod mapping;
pub mod pipeline;
pub mod saver;
pub mod source;
pub mod strategy;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use job::PipelineJob;
pub use mapping::{FieldMapper, FieldSpec, RecordMapper};
pub use pipeline::{JobControl, PipelineStage, SyncPipeline, SyncRequest};
pub use saver::{
    BatchSaver, BulkSaver, IndividualSaver, RecordError, RecordSink, SaveReport, UpsertOutcome,
};
pub use source::{PipelineComponents, RecordBatch, SourceFactory, StaticSourceFactory, SyncSource};
pub use strategy::{determine_strategy, SyncStrategy};
