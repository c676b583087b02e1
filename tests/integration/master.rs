//! The daemon's master loops against live workers: pings, heartbeats,
//! stale closes, and what a worker does when its master goes away.

use hive_core::config::SchedulerConfig;
use hive_core::task::{Requirements, TaskPayload};
use hive_services::TaskStatus;
use hived::master::connection::WorkerEvent;

use crate::{eventually, scheduler_config, token, Pki, TestMaster, TestWorker, WorkerOptions};

fn sleeper(secs: u32) -> TaskPayload {
    TaskPayload::Command {
        program: "sleep".into(),
        args: vec![secs.to_string()],
    }
}

async fn one_worker(
    secret: &str,
    config: SchedulerConfig,
) -> (Pki, TestMaster, TestWorker) {
    let pki = Pki::generate().unwrap();
    let master = TestMaster::with_scheduler(&pki, token(secret), true, config).unwrap();
    let worker = TestWorker::spawn(&pki, secret, WorkerOptions::new(token(secret)))
        .await
        .unwrap();
    master.connect(&worker).await.unwrap();
    master.wait_ready(&worker).await.unwrap();
    (pki, master, worker)
}

#[tokio::test]
async fn pongs_record_worker_latency() {
    let (_pki, master, worker) = one_worker("latency", scheduler_config()).await;
    let id = worker.id();

    master
        .run_until("latency sample", |d| {
            d.registry().get(&id).is_some_and(|w| w.latency_ms.is_some())
        })
        .await
        .unwrap();
    let latency = master.dispatcher.registry().get(&id).unwrap().latency_ms.unwrap();
    assert!((0.0..5_000.0).contains(&latency), "{latency}");
}

#[tokio::test]
async fn silent_worker_is_expired() {
    // One ping at start-up, then only resource reports every 2s.
    let config = SchedulerConfig {
        heartbeat_timeout_secs: 1,
        ping_interval_secs: 3600,
        ..scheduler_config()
    };
    let (_pki, master, worker) = one_worker("expiry", config).await;
    let id = worker.id();

    master
        .run_until("heartbeat expiry", |d| !d.registry().contains(&id))
        .await
        .unwrap();
}

#[tokio::test]
async fn stale_close_leaves_current_connection_alone() {
    let (_pki, master, worker) = one_worker("stale", scheduler_config()).await;
    let id = worker.id();
    let registry = master.dispatcher.registry().clone();
    let current = registry.connection_of(&id).unwrap();

    master.inject(WorkerEvent::Closed {
        worker: id.clone(),
        connection: current.wrapping_sub(1),
        reason: "replaced".into(),
    });
    let task = master
        .dispatcher
        .submit_task(
            "general",
            TaskPayload::Command {
                program: "true".into(),
                args: vec![],
            },
            serde_json::Value::Null,
            Requirements::default(),
        )
        .unwrap();
    master
        .run_until("task on the same connection", |d| {
            d.task(&task).is_some_and(|t| t.status == TaskStatus::Completed)
        })
        .await
        .unwrap();
    assert_eq!(registry.connection_of(&id), Some(current));

    master.inject(WorkerEvent::Closed {
        worker: id.clone(),
        connection: current,
        reason: "gone".into(),
    });
    master
        .run_until("current close applied", |d| !d.registry().contains(&id))
        .await
        .unwrap();
}

#[tokio::test]
async fn worker_kills_tasks_when_its_master_goes_away() {
    let (_pki, master, worker) = one_worker("orphaned", scheduler_config()).await;

    let id = master
        .dispatcher
        .submit_task("general", sleeper(30), serde_json::Value::Null, Requirements::default())
        .unwrap();
    master
        .run_until("dispatch", |d| d.task(&id).is_some_and(|t| t.status.is_in_flight()))
        .await
        .unwrap();
    eventually("task running on the worker", || worker.executor.running() == 1)
        .await
        .unwrap();

    drop(master);
    eventually("worker to kill the orphaned task", || worker.executor.running() == 0)
        .await
        .unwrap();
}

#[tokio::test]
async fn stopped_worker_does_not_report_its_own_cancellations() {
    let (_pki, master, worker) = one_worker("shutdown", scheduler_config()).await;

    let id = master
        .dispatcher
        .submit_task("general", sleeper(30), serde_json::Value::Null, Requirements::default())
        .unwrap();
    eventually("task running on the worker", || worker.executor.running() == 1)
        .await
        .unwrap();

    worker.stop();
    master
        .run_until("task back in the queue", |d| {
            d.task(&id).is_some_and(|t| t.status == TaskStatus::Pending)
        })
        .await
        .unwrap();
    let task = master.task(&id).unwrap();
    assert_eq!(task.attempt, 1);
    assert!(task.outcome.is_none(), "{:?}", task.outcome);
}
