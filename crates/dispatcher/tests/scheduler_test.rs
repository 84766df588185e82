use std::sync::Arc;

use chrono::{Duration, Utc};
use datasync_core::{
    JobKind, MonitorConfig, RuntimeJobStatus, SchedulerConfig, TaskOutcome, TaskStatus,
};
use datasync_dispatcher::test_utils::ScriptedRuntime;
use datasync_dispatcher::{JobRegistry, ReconciliationMonitor, WorkerPoolScheduler};
use datasync_infrastructure::InMemoryQueueStore;
use serde_json::json;
use uuid::Uuid;

struct Harness {
    scheduler: Arc<WorkerPoolScheduler>,
    runtime: Arc<ScriptedRuntime>,
    monitor: ReconciliationMonitor,
}

fn harness(max_workers: usize) -> Harness {
    let runtime = Arc::new(ScriptedRuntime::new());
    let scheduler = Arc::new(WorkerPoolScheduler::new(
        Arc::new(InMemoryQueueStore::new()),
        JobRegistry::new(),
        runtime.clone(),
        &SchedulerConfig {
            max_workers,
            ..Default::default()
        },
    ));
    let monitor = ReconciliationMonitor::new(
        scheduler.clone(),
        runtime.clone(),
        MonitorConfig {
            stale_threshold_seconds: 120,
            jitter_millis: 0,
            ..Default::default()
        },
    );
    Harness {
        scheduler,
        runtime,
        monitor,
    }
}

fn contacts() -> JobKind {
    JobKind::new("crm", "contacts")
}

async fn submit(h: &Harness, priority: i32) -> Uuid {
    h.scheduler
        .submit(contacts(), json!({}), priority)
        .await
        .unwrap()
}

async fn finish(h: &Harness, task_id: Uuid) {
    assert!(h
        .scheduler
        .complete(task_id, TaskOutcome::Succeeded { result: None })
        .await
        .unwrap());
}

#[tokio::test]
async fn test_running_never_exceeds_max_workers() {
    let h = harness(3);

    let mut handles = Vec::new();
    for i in 0..20 {
        let scheduler = h.scheduler.clone();
        handles.push(tokio::spawn(async move {
            scheduler
                .submit(contacts(), json!({ "n": i }), i % 3)
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(h.scheduler.list_active().await.unwrap().len(), 3);
    assert_eq!(h.scheduler.list_queued().await.unwrap().len(), 17);
    assert_eq!(h.runtime.dispatched_tasks().len(), 3);

    // 逐个完成，运行数始终不超过上限
    for _ in 0..20 {
        let active = h.scheduler.list_active().await.unwrap();
        assert!(active.len() <= 3);
        let Some(task) = active.first() else {
            break;
        };
        finish(&h, task.id).await;
    }
    assert_eq!(h.runtime.dispatched_tasks().len(), 20);
    assert!(h.scheduler.list_queued().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_higher_priority_promoted_first() {
    let h = harness(1);
    let blocker = submit(&h, 0).await;
    let a = submit(&h, 1).await;
    let b = submit(&h, 5).await;

    finish(&h, blocker).await;
    assert_eq!(h.scheduler.get_status(b).await.unwrap().status, TaskStatus::Running);
    assert_eq!(h.scheduler.get_status(a).await.unwrap().status, TaskStatus::Queued);
}

#[tokio::test]
async fn test_priority_then_fifo_dispatch_order() {
    let h = harness(1);
    let blocker = submit(&h, 0).await;
    let first_low = submit(&h, 0).await;
    let second_low = submit(&h, 0).await;
    let high = submit(&h, 5).await;

    let queued: Vec<Uuid> = h
        .scheduler
        .list_queued()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(queued, vec![high, first_low, second_low]);

    finish(&h, blocker).await;
    finish(&h, high).await;
    finish(&h, first_low).await;

    assert_eq!(
        h.runtime.dispatched_tasks(),
        vec![blocker, high, first_low, second_low]
    );
}

#[tokio::test]
async fn test_monitor_sweep_is_idempotent() {
    let h = harness(1);
    let running = submit(&h, 0).await;
    let queued = submit(&h, 0).await;
    h.runtime.set_task_status(
        running,
        RuntimeJobStatus::Succeeded {
            result: Some(json!({"processed": 3})),
        },
    );

    let first = h.monitor.sweep().await.unwrap();
    assert_eq!(first.reconciled, 1);
    assert_eq!(
        h.scheduler.get_status(running).await.unwrap().status,
        TaskStatus::Completed
    );
    assert!(h.scheduler.get_status(queued).await.unwrap().is_running());

    let snapshot = (
        h.scheduler.list_active().await.unwrap(),
        h.scheduler.list_queued().await.unwrap(),
    );
    let second = h.monitor.sweep().await.unwrap();
    assert_eq!(second.transitions(), 0);
    assert_eq!(
        snapshot,
        (
            h.scheduler.list_active().await.unwrap(),
            h.scheduler.list_queued().await.unwrap(),
        )
    );
}

#[tokio::test]
async fn test_stale_task_failed_and_slot_backfilled() {
    let h = harness(1);
    let stale = submit(&h, 0).await;
    let waiting = submit(&h, 0).await;

    let later = Utc::now() + Duration::seconds(121);
    let report = h.monitor.sweep_at(later).await.unwrap();
    assert_eq!(report.expired, 1);

    let record = h.scheduler.get_status(stale).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error.unwrap().contains("心跳超时"));
    assert!(h.scheduler.get_status(waiting).await.unwrap().is_running());

    let stats = h.scheduler.stats().await.unwrap();
    assert_eq!(stats.counters.stale, 1);
}

#[tokio::test]
async fn test_heartbeat_keeps_task_alive() {
    let h = harness(1);
    let task = submit(&h, 0).await;
    h.scheduler.heartbeat(task).await.unwrap();

    let report = h
        .monitor
        .sweep_at(Utc::now() + Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(report.expired, 0);
    assert!(h.scheduler.get_status(task).await.unwrap().is_running());
}

#[tokio::test]
async fn test_cancel_queued_task_is_never_dispatched() {
    let h = harness(1);
    let blocker = submit(&h, 0).await;
    let victim = submit(&h, 0).await;

    assert!(h.scheduler.cancel(victim).await.unwrap());
    assert!(h.scheduler.list_queued().await.unwrap().is_empty());

    let record = h.scheduler.get_status(victim).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert!(record.error.is_none());

    finish(&h, blocker).await;
    assert!(!h.runtime.dispatched_tasks().contains(&victim));
    assert!(!h.scheduler.cancel(victim).await.unwrap());
}

#[tokio::test]
async fn test_cancel_running_task_frees_slot() {
    let h = harness(1);
    let running = submit(&h, 0).await;
    let waiting = submit(&h, 0).await;

    assert!(h.scheduler.cancel(running).await.unwrap());
    assert_eq!(
        h.scheduler.get_status(running).await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert_eq!(h.runtime.cancel_requests().len(), 1);
    assert!(h.scheduler.get_status(waiting).await.unwrap().is_running());

    // 作业随后上报的失败不会覆盖取消状态
    assert!(!h
        .scheduler
        .complete(running, TaskOutcome::failed("作业已取消"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_dispatch_rejection_fails_without_consuming_slot() {
    let h = harness(1);
    h.runtime.reject("sync_erp_invoices");

    let rejected = h
        .scheduler
        .submit(JobKind::new("erp", "invoices"), json!({}), 0)
        .await
        .unwrap();
    let record = h.scheduler.get_status(rejected).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error.is_some());

    let next = submit(&h, 0).await;
    assert!(h.scheduler.get_status(next).await.unwrap().is_running());

    let stats = h.scheduler.stats().await.unwrap();
    assert_eq!(stats.counters.dispatch_errors, 1);
    assert_eq!(stats.running, 1);
}

#[tokio::test]
async fn test_shrinking_does_not_preempt() {
    let h = harness(2);
    let a = submit(&h, 0).await;
    let b = submit(&h, 0).await;
    let queued = submit(&h, 0).await;

    h.scheduler.reconfigure(1).await.unwrap();
    assert_eq!(h.scheduler.list_active().await.unwrap().len(), 2);

    finish(&h, a).await;
    assert_eq!(
        h.scheduler.get_status(queued).await.unwrap().status,
        TaskStatus::Queued
    );
    finish(&h, b).await;
    assert!(h.scheduler.get_status(queued).await.unwrap().is_running());

    h.scheduler.reconfigure(3).await.unwrap();
    assert_eq!(h.scheduler.max_workers(), 3);
}

#[tokio::test]
async fn test_unknown_task() {
    let h = harness(1);
    let missing = Uuid::new_v4();
    assert!(h.scheduler.get_status(missing).await.is_err());
    assert!(h.scheduler.cancel(missing).await.is_err());
}
