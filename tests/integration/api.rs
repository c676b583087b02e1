//! Operator HTTP API against a live dispatcher.

use std::sync::Arc;
use std::time::Instant;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use hive_api::ApiState;
use hive_services::{Dispatcher, DispatcherSettings, Selector, WorkerRegistry};

use crate::{token, Pki, TestMaster, TestWorker, WorkerOptions};

async fn serve(dispatcher: Dispatcher) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}/api", listener.local_addr().unwrap());
    let state = ApiState {
        dispatcher,
        node_id: "master@api".into(),
        started: Instant::now(),
    };
    tokio::spawn(hive_api::serve(state, listener));
    base
}

fn idle_dispatcher() -> Dispatcher {
    Dispatcher::new(
        WorkerRegistry::new(),
        Arc::new(Selector::new()),
        DispatcherSettings::default(),
    )
}

fn sleep_task(id: &str) -> Value {
    json!({
        "id": id,
        "task_type": "general",
        "payload": { "kind": "command", "program": "sleep", "args": ["1"] },
    })
}

#[tokio::test]
async fn task_lifecycle_without_workers() {
    let base = serve(idle_dispatcher()).await;
    let http = reqwest::Client::new();

    let resp = http.post(format!("{base}/tasks")).json(&sleep_task("t-1")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["task_id"], "t-1");

    // Same id again is a conflict.
    let resp = http.post(format!("{base}/tasks")).json(&sleep_task("t-1")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let task: Value = http.get(format!("{base}/tasks/t-1")).send().await.unwrap().json().await.unwrap();
    assert_eq!(task["status"], "pending");
    assert_eq!(task["attempt"], 0);
    assert_eq!(task["payload"]["program"], "sleep");

    let status: Value = http.get(format!("{base}/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["node_id"], "master@api");
    assert_eq!(status["workers_connected"], 0);
    assert_eq!(status["tasks"]["pending"], 1);
    assert_eq!(status["tasks"]["total"], 1);

    let cancelled: Value = http
        .post(format!("{base}/tasks/t-1/cancel"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cancelled["previous"], "pending");

    // Cancelling twice hits a terminal task.
    let resp = http.post(format!("{base}/tasks/t-1/cancel")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let listed: Value = http
        .get(format!("{base}/tasks?status=cancelled"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["tasks"].as_array().unwrap().len(), 1);

    let purged: Value = http
        .delete(format!("{base}/tasks?status=cancelled"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(purged["removed"], 1);

    let resp = http.get(format!("{base}/tasks/t-1")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let base = serve(idle_dispatcher()).await;
    let http = reqwest::Client::new();

    let resp = http.get(format!("{base}/tasks?status=sleeping")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = http.delete(format!("{base}/tasks?status=pending")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let mut no_type = sleep_task("t-2");
    no_type["task_type"] = json!("  ");
    let resp = http.post(format!("{base}/tasks")).json(&no_type).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = http.post(format!("{base}/tasks/nope/cancel")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn out_of_range_timeout_is_a_bad_request() {
    let base = serve(idle_dispatcher()).await;
    let http = reqwest::Client::new();

    let mut forever = sleep_task("t-forever");
    forever["timeout_secs"] = json!(u64::MAX);
    let resp = http.post(format!("{base}/tasks")).json(&forever).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let resp = http.get(format!("{base}/tasks/t-forever")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // Zero is accepted and stored as "use the default".
    let mut zero = sleep_task("t-zero");
    zero["timeout_secs"] = json!(0);
    let resp = http.post(format!("{base}/tasks")).json(&zero).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let task: Value = http.get(format!("{base}/tasks/t-zero")).send().await.unwrap().json().await.unwrap();
    assert!(task["timeout_secs"].is_null(), "{task}");

    // The server is still serving after the rejected submit.
    let resp = http.get(format!("{base}/status")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn generated_ids_are_unique() {
    let base = serve(idle_dispatcher()).await;
    let http = reqwest::Client::new();
    let req = json!({
        "task_type": "general",
        "payload": { "kind": "command", "program": "true" },
    });

    let mut ids = Vec::new();
    for _ in 0..3 {
        let body: Value = http
            .post(format!("{base}/tasks"))
            .json(&req)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        ids.push(body["task_id"].as_str().unwrap().to_string());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| id.len() == 32));
}

#[tokio::test]
async fn submitted_task_runs_on_connected_worker() {
    let pki = Pki::generate().unwrap();
    let master = TestMaster::new(&pki, token("api"), true).unwrap();
    let worker = TestWorker::spawn(&pki, "api-worker", WorkerOptions::new(token("api")))
        .await
        .unwrap();
    master.connect(&worker).await.unwrap();
    master.wait_ready(&worker).await.unwrap();

    let base = serve(master.dispatcher.clone()).await;
    let http = reqwest::Client::new();

    let workers: Value = http.get(format!("{base}/workers")).send().await.unwrap().json().await.unwrap();
    assert_eq!(workers["workers"][0]["id"], worker.id());
    assert_eq!(workers["workers"][0]["resources"]["hostname"], "api-worker");

    let body: Value = http
        .post(format!("{base}/tasks"))
        .json(&json!({
            "task_type": "general",
            "payload": { "kind": "command", "program": "echo", "args": ["over http"] },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = body["task_id"].as_str().unwrap().to_string();

    master
        .run_until("api task", |d| d.task(&id).is_some_and(|t| t.status.is_terminal()))
        .await
        .unwrap();

    let task: Value = http.get(format!("{base}/tasks/{id}")).send().await.unwrap().json().await.unwrap();
    assert_eq!(task["status"], "completed");
    assert_eq!(task["worker"], worker.id());
    assert_eq!(task["outcome"]["status"], "completed");
    assert_eq!(task["outcome"]["stdout"], "over http\n");
}
