use std::sync::Arc;

use anyhow::{Context, Result};
use datasync_api::AppState;
use datasync_core::{
    AppConfig, DatabaseBackend, JobCompletion, PersistentQueueStore, StoreBackend,
    SyncRunRepository,
};
use datasync_dispatcher::{CompletionListener, JobRegistry, ReconciliationMonitor, WorkerPoolScheduler};
use datasync_infrastructure::{
    InMemoryQueueStore, InMemorySyncRunRepository, LocalJobRuntime, MetricsCollector,
    RedisQueueStore, SqliteSyncRunRepository,
};
use datasync_pipeline::{PipelineJob, StaticSourceFactory};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 主应用程序
///
/// 组装共享存储、运行记录仓库、进程内运行时、调度器、监控器和API服务器。
/// 数据源连接器通过 [`Application::source_factory`] 注册。
pub struct Application {
    config: AppConfig,
    scheduler: Arc<WorkerPoolScheduler>,
    runtime: Arc<LocalJobRuntime>,
    sync_runs: Arc<dyn SyncRunRepository>,
    sources: Arc<StaticSourceFactory>,
    metrics: Arc<MetricsCollector>,
    completions: Mutex<Option<mpsc::UnboundedReceiver<JobCompletion>>>,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序，实例: {}", config.scheduler.instance_id);

        let store = create_queue_store(&config).await?;
        let sync_runs = create_sync_run_repository(&config).await?;
        let mut registry =
            JobRegistry::from_config(&config.registry).context("加载作业注册表失败")?;
        for entry in &config.registry.jobs {
            registry.set_validator(entry.job_ref.clone(), PipelineJob::parameter_validator());
        }
        let metrics = Arc::new(MetricsCollector::new());

        let (runtime, completions) = LocalJobRuntime::with_completions();
        let runtime = Arc::new(runtime);

        let scheduler = Arc::new(
            WorkerPoolScheduler::new(store, registry, runtime.clone(), &config.scheduler)
                .with_metrics(metrics.clone()),
        );

        let sources = Arc::new(StaticSourceFactory::new());
        let job = Arc::new(
            PipelineJob::new(sources.clone(), sync_runs.clone(), config.pipeline.clone())
                .with_task_control(scheduler.clone())
                .with_metrics(metrics.clone()),
        );
        for entry in &config.registry.jobs {
            runtime.register(entry.job_ref.clone(), job.clone()).await;
        }

        Ok(Self {
            config,
            scheduler,
            runtime,
            sync_runs,
            sources,
            metrics,
            completions: Mutex::new(Some(completions)),
        })
    }

    pub fn scheduler(&self) -> Arc<WorkerPoolScheduler> {
        self.scheduler.clone()
    }

    pub fn runtime(&self) -> Arc<LocalJobRuntime> {
        self.runtime.clone()
    }

    pub fn source_factory(&self) -> Arc<StaticSourceFactory> {
        self.sources.clone()
    }

    /// 运行所有组件直到停止令牌被触发
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut handles = Vec::new();

        let completions = self
            .completions
            .lock()
            .await
            .take()
            .context("应用程序已经在运行")?;
        handles.push({
            let listener = CompletionListener::new(self.scheduler.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { listener.run(completions, shutdown).await })
        });

        if self.config.monitor.enabled {
            let monitor = ReconciliationMonitor::new(
                self.scheduler.clone(),
                self.runtime.clone(),
                self.config.monitor.clone(),
            )
            .with_metrics(self.metrics.clone());
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { monitor.run(shutdown).await }));
        } else {
            info!("对账监控器已禁用");
        }

        // 启动时处理存储中遗留的排队任务
        match self.scheduler.process_queue().await {
            Ok(0) => {}
            Ok(n) => info!("启动时分发了 {} 个遗留排队任务", n),
            Err(e) => error!("启动时处理队列失败: {}", e),
        }

        let result = if self.config.api.enabled {
            let state = AppState {
                scheduler: self.scheduler.clone(),
                sync_runs: self.sync_runs.clone(),
            };
            let served =
                datasync_api::serve(state, &self.config.api.bind_address, shutdown.clone()).await;
            if served.is_err() {
                shutdown.cancel();
            }
            served
        } else {
            info!("API服务器已禁用");
            shutdown.cancelled().await;
            Ok(())
        };

        for handle in handles {
            if let Err(e) = handle.await {
                error!("后台任务异常退出: {}", e);
            }
        }

        let active = self.runtime.active_jobs().await;
        if active > 0 {
            info!("仍有 {} 个作业在运行，由下一次启动的监控器对账", active);
        }
        result
    }
}

async fn create_queue_store(config: &AppConfig) -> Result<Arc<dyn PersistentQueueStore>> {
    let store: Arc<dyn PersistentQueueStore> = match config.store.backend {
        StoreBackend::Memory => {
            info!("使用进程内共享存储");
            Arc::new(InMemoryQueueStore::new())
        }
        StoreBackend::Redis => {
            info!("连接Redis共享存储: {}", config.store.redis_url);
            Arc::new(
                RedisQueueStore::new(&config.store)
                    .await
                    .context("连接Redis失败")?,
            )
        }
    };
    Ok(store)
}

async fn create_sync_run_repository(config: &AppConfig) -> Result<Arc<dyn SyncRunRepository>> {
    let repository: Arc<dyn SyncRunRepository> = match config.database.backend {
        DatabaseBackend::Memory => Arc::new(InMemorySyncRunRepository::new()),
        DatabaseBackend::Sqlite => {
            info!("连接SQLite数据库: {}", config.database.url);
            Arc::new(
                SqliteSyncRunRepository::connect(&config.database)
                    .await
                    .context("初始化SQLite运行记录仓库失败")?,
            )
        }
    };
    Ok(repository)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasync_core::{JobKind, RegistryEntry, SyncError, TaskStatus};
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.api.enabled = false;
        config.scheduler.instance_id = "test".to_string();
        config.registry.jobs.push(RegistryEntry {
            source_system: "crm".to_string(),
            operation: "contacts".to_string(),
            job_ref: "sync_crm_contacts".to_string(),
        });
        config
    }

    #[tokio::test]
    async fn test_bad_sync_parameters_rejected_at_submit() {
        let app = Application::new(test_config()).await.unwrap();
        let scheduler = app.scheduler();

        let result = scheduler
            .submit(
                JobKind::new("crm", "contacts"),
                json!({ "force_full": "yes", "manual_since": 42 }),
                0,
            )
            .await;
        assert!(matches!(result, Err(SyncError::Admission(_))));

        let stats = scheduler.stats().await.unwrap();
        assert_eq!(stats.counters.submitted, 0);
        assert_eq!(stats.running + stats.queued, 0);
        assert_eq!(app.runtime().active_jobs().await, 0);
    }

    #[tokio::test]
    async fn test_job_without_connector_fails_and_frees_slot() {
        let app = Arc::new(Application::new(test_config()).await.unwrap());
        assert_eq!(app.runtime().registered().await, vec!["sync_crm_contacts"]);

        let shutdown = CancellationToken::new();
        let running = {
            let app = app.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { app.run(shutdown).await })
        };

        let scheduler = app.scheduler();
        let task_id = scheduler
            .submit(JobKind::new("crm", "contacts"), json!({}), 0)
            .await
            .unwrap();

        let mut status = TaskStatus::Running;
        for _ in 0..100 {
            status = scheduler.get_status(task_id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, TaskStatus::Failed);
        assert!(scheduler.list_active().await.unwrap().is_empty());

        shutdown.cancel();
        running.await.unwrap().unwrap();
        assert!(app.run(CancellationToken::new()).await.is_err());
    }
}
