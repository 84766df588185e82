use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datasync_core::{
    DatabaseConfig, PerformanceMetrics, SyncCounts, SyncError, SyncResult, SyncRunFilter,
    SyncRunRecord, SyncRunRepository, SyncRunStatus,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

const SELECT_COLUMNS: &str = "SELECT id, source_system, operation, status, start_time, end_time, \
     records_processed, records_created, records_updated, records_failed, \
     error_message, configuration, performance_metrics FROM sync_runs";

/// SQLite同步运行记录仓库
pub struct SqliteSyncRunRepository {
    pool: SqlitePool,
}

impl SqliteSyncRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 按配置打开数据库并执行建表
    pub async fn connect(config: &DatabaseConfig) -> SyncResult<Self> {
        debug!("打开SQLite同步记录库: {}", config.url);

        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .connect_with(connect_options)
            .await?;

        let repository = Self { pool };
        repository.migrate().await?;
        Ok(repository)
    }

    /// 创建表和索引，可重复执行
    pub async fn migrate(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_system TEXT NOT NULL,
                operation TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                records_processed INTEGER NOT NULL DEFAULT 0,
                records_created INTEGER NOT NULL DEFAULT 0,
                records_updated INTEGER NOT NULL DEFAULT 0,
                records_failed INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                configuration TEXT NOT NULL DEFAULT '{}',
                performance_metrics TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_runs_job_start \
             ON sync_runs (source_system, operation, start_time)",
        )
        .execute(&self.pool)
        .await?;

        debug!("sync_runs 表迁移完成");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_run(row: &SqliteRow) -> SyncResult<SyncRunRecord> {
        let configuration: String = row.try_get("configuration")?;
        let performance_metrics: Option<String> = row.try_get("performance_metrics")?;

        Ok(SyncRunRecord {
            id: row.try_get("id")?,
            source_system: row.try_get("source_system")?,
            operation: row.try_get("operation")?,
            status: row.try_get("status")?,
            start_time: row.try_get::<DateTime<Utc>, _>("start_time")?,
            end_time: row.try_get::<Option<DateTime<Utc>>, _>("end_time")?,
            counts: SyncCounts {
                processed: row.try_get("records_processed")?,
                created: row.try_get("records_created")?,
                updated: row.try_get("records_updated")?,
                failed: row.try_get("records_failed")?,
            },
            error_message: row.try_get("error_message")?,
            configuration: serde_json::from_str(&configuration)?,
            performance_metrics: performance_metrics
                .map(|raw| serde_json::from_str::<PerformanceMetrics>(&raw))
                .transpose()?,
        })
    }
}

#[async_trait]
impl SyncRunRepository for SqliteSyncRunRepository {
    #[instrument(skip(self, run), fields(
        source_system = %run.source_system,
        operation = %run.operation,
    ))]
    async fn create(&self, run: &SyncRunRecord) -> SyncResult<SyncRunRecord> {
        let metrics = run
            .performance_metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let row = sqlx::query(
            r#"
            INSERT INTO sync_runs (source_system, operation, status, start_time, end_time,
                                   records_processed, records_created, records_updated, records_failed,
                                   error_message, configuration, performance_metrics)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&run.source_system)
        .bind(&run.operation)
        .bind(run.status)
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(run.counts.processed)
        .bind(run.counts.created)
        .bind(run.counts.updated)
        .bind(run.counts.failed)
        .bind(&run.error_message)
        .bind(serde_json::to_string(&run.configuration)?)
        .bind(metrics)
        .fetch_one(&self.pool)
        .await?;

        let mut created = run.clone();
        created.id = row.try_get("id")?;
        debug!("创建同步运行记录: {}", created.id);
        Ok(created)
    }

    #[instrument(skip(self, run), fields(run_id = run.id, status = %run.status.as_str()))]
    async fn finish(&self, run: &SyncRunRecord) -> SyncResult<()> {
        if !run.is_finished() {
            return Err(SyncError::InvalidTransition {
                from: run.status.as_str().to_string(),
                to: "FINISHED".to_string(),
            });
        }

        let metrics = run
            .performance_metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = ?, end_time = ?, records_processed = ?, records_created = ?,
                records_updated = ?, records_failed = ?, error_message = ?, performance_metrics = ?
            WHERE id = ? AND end_time IS NULL
            "#,
        )
        .bind(run.status)
        .bind(run.end_time)
        .bind(run.counts.processed)
        .bind(run.counts.created)
        .bind(run.counts.updated)
        .bind(run.counts.failed)
        .bind(&run.error_message)
        .bind(metrics)
        .bind(run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_by_id(run.id).await? {
                Some(_) => Err(SyncError::RunAlreadyFinished { id: run.id }),
                None => Err(SyncError::RunNotFound { id: run.id }),
            };
        }
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> SyncResult<Option<SyncRunRecord>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn latest_successful(
        &self,
        source_system: &str,
        operation: &str,
    ) -> SyncResult<Option<SyncRunRecord>> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE source_system = ? AND operation = ? \
             AND status IN ('SUCCESS', 'PARTIAL') AND end_time IS NOT NULL \
             ORDER BY end_time DESC, id DESC LIMIT 1"
        ))
        .bind(source_system)
        .bind(operation)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn query(&self, filter: &SyncRunFilter) -> SyncResult<Vec<SyncRunRecord>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);
        builder.push(" WHERE 1 = 1");

        if let Some(source) = &filter.source_system {
            builder.push(" AND source_system = ").push_bind(source.clone());
        }
        if let Some(operation) = &filter.operation {
            builder.push(" AND operation = ").push_bind(operation.clone());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(after) = filter.started_after {
            builder.push(" AND start_time >= ").push_bind(after);
        }
        if let Some(before) = filter.started_before {
            builder.push(" AND start_time < ").push_bind(before);
        }
        builder.push(" ORDER BY start_time DESC, id DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit.max(0));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_run).collect()
    }
}
