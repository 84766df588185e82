//! 同步运行审计记录仓库
//!
//! - [`InMemorySyncRunRepository`]: 测试和无持久化需求的部署使用
//! - [`SqliteSyncRunRepository`]: 嵌入式SQLite，启动时自动建表

pub mod in_memory_sync_run_repository;
pub mod sqlite_sync_run_repository;

pub use in_memory_sync_run_repository::InMemorySyncRunRepository;
pub use sqlite_sync_run_repository::SqliteSyncRunRepository;
