//! Master and workers end to end: dispatch, results, worker loss.

use std::collections::HashMap;

use hive_core::task::{FailureKind, Requirements, Strategy, TaskOutcome, TaskPayload};
use hive_services::{new_task_id, TaskSpec, TaskStatus};

use crate::{token, Pki, TestMaster, TestWorker, WorkerOptions};

fn shell(script: &str) -> TaskPayload {
    TaskPayload::Command {
        program: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
    }
}

fn spec(task_type: &str, payload: TaskPayload) -> TaskSpec {
    TaskSpec {
        id: new_task_id(task_type),
        task_type: task_type.into(),
        payload,
        input: serde_json::Value::Null,
        requirements: Requirements::default(),
        strategy: None,
        timeout_secs: Some(30),
    }
}

async fn cluster(names: &[&str]) -> (Pki, TestMaster, Vec<TestWorker>) {
    let pki = Pki::generate().unwrap();
    let master = TestMaster::new(&pki, token("cluster"), true).unwrap();
    let mut workers = Vec::new();
    for name in names {
        let worker = TestWorker::spawn(&pki, name, WorkerOptions::new(token("cluster")))
            .await
            .unwrap();
        master.connect(&worker).await.unwrap();
        master.wait_ready(&worker).await.unwrap();
        workers.push(worker);
    }
    (pki, master, workers)
}

#[tokio::test]
async fn round_robin_spreads_tasks_and_collects_output() {
    let (_pki, master, workers) = cluster(&["rr-a", "rr-b"]).await;

    let mut ids = Vec::new();
    for _ in 0..6 {
        let mut s = spec("general", shell("echo \"$HIVE_TASK_ID\""));
        s.strategy = Some(Strategy::RoundRobin);
        ids.push(master.dispatcher.submit(s).unwrap());
    }

    master
        .run_until("six completions", |d| d.counts().completed == 6)
        .await
        .unwrap();

    let mut per_worker: HashMap<String, usize> = HashMap::new();
    for id in &ids {
        let task = master.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt, 1);
        match task.outcome.unwrap() {
            TaskOutcome::Completed { stdout, exit_code, .. } => {
                assert_eq!(exit_code, 0);
                assert_eq!(stdout.trim(), id.as_str());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        *per_worker.entry(task.worker.unwrap()).or_default() += 1;
    }
    assert_eq!(per_worker.get(&workers[0].id()), Some(&3));
    assert_eq!(per_worker.get(&workers[1].id()), Some(&3));

    // Active counts drain back to zero once results are in.
    for w in master.dispatcher.registry().list_connected() {
        assert_eq!(w.active_tasks, 0);
    }
}

#[tokio::test]
async fn script_reads_input_and_returns_value() {
    let (_pki, master, _workers) = cluster(&["script"]).await;

    let mut s = spec(
        "general",
        TaskPayload::Script {
            interpreter: "/bin/sh".into(),
            source: "x=$(cat)\nprintf '{\"got\":%s}' \"$x\" > \"$HIVE_RESULT_FILE\"\n".into(),
        },
    );
    s.input = serde_json::json!(5);
    let id = master.dispatcher.submit(s).unwrap();

    master
        .run_until("script result", |d| {
            d.task(&id).is_some_and(|t| t.status.is_terminal())
        })
        .await
        .unwrap();

    match master.task(&id).unwrap().outcome.unwrap() {
        TaskOutcome::Completed { return_value, .. } => {
            assert_eq!(return_value, Some(serde_json::json!({ "got": 5 })));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn non_zero_exit_is_an_execution_error() {
    let (_pki, master, _workers) = cluster(&["exit"]).await;

    let id = master
        .dispatcher
        .submit(spec("general", shell("echo boom >&2; exit 3")))
        .unwrap();
    master
        .run_until("failure", |d| d.task(&id).is_some_and(|t| t.status.is_terminal()))
        .await
        .unwrap();

    let task = master.task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let outcome = task.outcome.unwrap();
    assert_eq!(outcome.failure_kind(), Some(FailureKind::ExecutionError));
    match outcome {
        TaskOutcome::Failed { message, .. } => {
            assert!(message.starts_with("exit code 3"), "{message}");
            assert!(message.contains("boom"), "{message}");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn accelerator_tasks_go_to_accelerator_workers() {
    let pki = Pki::generate().unwrap();
    let master = TestMaster::new(&pki, token("gpu"), true).unwrap();

    let cpu = TestWorker::spawn(&pki, "cpu-only", WorkerOptions::new(token("gpu")))
        .await
        .unwrap();
    let mut gpu_opts = WorkerOptions::new(token("gpu"));
    gpu_opts.accelerator = true;
    let gpu = TestWorker::spawn(&pki, "with-gpu", gpu_opts).await.unwrap();
    for w in [&cpu, &gpu] {
        master.connect(w).await.unwrap();
        master.wait_ready(w).await.unwrap();
    }

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            master
                .dispatcher
                .submit(spec("machine_learning", shell("true")))
                .unwrap(),
        );
    }
    master
        .run_until("ml tasks", |d| d.counts().completed == 3)
        .await
        .unwrap();

    for id in &ids {
        assert_eq!(master.task(id).unwrap().worker, Some(gpu.id()));
    }
}

#[tokio::test]
async fn lost_worker_tasks_are_redispatched() {
    let pki = Pki::generate().unwrap();
    let master = TestMaster::new(&pki, token("loss"), true).unwrap();

    let doomed = TestWorker::spawn(&pki, "doomed", WorkerOptions::new(token("loss")))
        .await
        .unwrap();
    master.connect(&doomed).await.unwrap();
    master.wait_ready(&doomed).await.unwrap();

    let id = master
        .dispatcher
        .submit(spec("general", shell("sleep 3; echo survived")))
        .unwrap();
    master
        .run_until("first dispatch", |d| {
            d.task(&id).is_some_and(|t| t.status.is_in_flight())
        })
        .await
        .unwrap();
    assert_eq!(master.task(&id).unwrap().worker, Some(doomed.id()));

    let survivor = TestWorker::spawn(&pki, "survivor", WorkerOptions::new(token("loss")))
        .await
        .unwrap();
    master.connect(&survivor).await.unwrap();
    master.wait_ready(&survivor).await.unwrap();

    doomed.stop();
    master
        .run_until("re-dispatched completion", |d| {
            d.task(&id).is_some_and(|t| t.status == TaskStatus::Completed)
        })
        .await
        .unwrap();

    let task = master.task(&id).unwrap();
    assert_eq!(task.worker, Some(survivor.id()));
    assert_eq!(task.attempt, 2);
    assert!(!master.dispatcher.registry().contains(&doomed.id()));
}

#[tokio::test]
async fn cancelling_running_task_frees_the_worker() {
    let (_pki, master, workers) = cluster(&["cancel"]).await;

    let id = master
        .dispatcher
        .submit(spec("general", shell("sleep 30")))
        .unwrap();
    master
        .run_until("dispatch", |d| d.task(&id).is_some_and(|t| t.status.is_in_flight()))
        .await
        .unwrap();

    let previous = master.dispatcher.cancel(&id).unwrap();
    assert!(previous.is_in_flight());
    assert_eq!(master.task(&id).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(
        master.dispatcher.registry().get(&workers[0].id()).unwrap().active_tasks,
        0
    );

    // The worker still answers; a follow-up task runs normally.
    let next = master.dispatcher.submit(spec("general", shell("true"))).unwrap();
    master
        .run_until("follow-up", |d| {
            d.task(&next).is_some_and(|t| t.status == TaskStatus::Completed)
        })
        .await
        .unwrap();
    assert_eq!(master.task(&id).unwrap().status, TaskStatus::Cancelled);
}
