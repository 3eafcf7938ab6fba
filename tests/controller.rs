//! End-to-end controller behaviour: propagation, coalescing, worker
//! lifecycle and the component debug handler.

mod common;

use std::time::Duration;

use rill::component::HealthState;
use rill::config::{Block, SourceFile, Value};
use common::{eventually, metric_value, passthrough, sink, source, TestKit};

#[tokio::test]
async fn empty_configuration() {
    let kit = TestKit::new();
    let (controller, metrics) = kit.controller();

    controller.load_file(&SourceFile::default()).unwrap();
    assert!(controller.component_infos().is_empty());
    assert!(controller.loaded_once());

    controller.close().await.unwrap();
    assert_eq!(0.0, metric_value(&metrics, "rill_controller_running_components"));
}

#[tokio::test]
async fn chain_propagates_export_changes() {
    let kit = TestKit::new();
    let (controller, _metrics) = kit.controller();

    let file = SourceFile::new(vec![
        source("s", "v1"),
        sink("snk", "test.source.s.value"),
    ]);
    controller.load_file(&file).unwrap();

    // The initial evaluation already flowed v1 into the sink.
    assert_eq!(Some(Value::from("v1")), kit.input("test.sink.snk"));

    eventually("workers to start", || kit.is_running("test.source.s")).await;

    // The source's first export during apply schedules one more pass over
    // its dependents; wait for that to settle.
    eventually("the initial load to quiesce", || {
        kit.updates("test.sink.snk") == 2
    })
    .await;

    // A distinct runtime value triggers exactly one update of the sink.
    kit.push("test.source.s", Value::from("v2"));
    eventually("v2 to reach the sink", || {
        kit.input("test.sink.snk") == Some(Value::from("v2"))
    })
    .await;
    assert_eq!(3, kit.updates("test.sink.snk"));

    // Pushing an equal value again must not trigger another update.
    kit.push("test.source.s", Value::from("v2"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(3, kit.updates("test.sink.snk"));

    controller.close().await.unwrap();
}

#[tokio::test]
async fn burst_of_export_changes_coalesces() {
    let kit = TestKit::new();
    let (controller, _metrics) = kit.controller();

    let file = SourceFile::new(vec![
        source("s", 0),
        passthrough("p", "test.source.s.value"),
        sink("snk", "test.passthrough.p.output"),
    ]);
    controller.load_file(&file).unwrap();
    eventually("workers to start", || kit.is_running("test.source.s")).await;

    for n in 1..=1000i64 {
        kit.push("test.source.s", Value::from(n));
    }
    eventually("the burst to quiesce", || {
        kit.input("test.sink.snk") == Some(Value::from(1000i64))
    })
    .await;

    // Coalescing bounds the work: at most one evaluation per pushed value
    // plus the two of the initial load, usually far fewer.
    assert!(kit.updates("test.passthrough.p") <= 1002);

    // Quiescence: no further evaluations once the burst is consumed.
    let settled = kit.updates("test.sink.snk");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(settled, kit.updates("test.sink.snk"));

    controller.close().await.unwrap();
}

#[tokio::test]
async fn exited_component_leaves_neighbours_alone() {
    let kit = TestKit::new();
    let (controller, _metrics) = kit.controller();

    let file = SourceFile::new(vec![
        Block::new("test.exiter", "e"),
        source("s", "v1"),
        sink("snk", "test.source.s.value"),
    ]);
    controller.load_file(&file).unwrap();

    eventually("the exiter to finish", || {
        controller
            .component_infos()
            .iter()
            .any(|info| info.id == "test.exiter.e" && info.health.state == HealthState::Exited)
    })
    .await;

    // The rest of the graph still propagates.
    kit.push("test.source.s", Value::from("v2"));
    eventually("v2 to reach the sink", || {
        kit.input("test.sink.snk") == Some(Value::from("v2"))
    })
    .await;

    controller.close().await.unwrap();
}

#[tokio::test]
async fn worker_panic_is_contained() {
    let kit = TestKit::new();
    let (controller, _metrics) = kit.controller();

    let file = SourceFile::new(vec![
        Block::new("test.crasher", "c"),
        source("s", "v1"),
        sink("snk", "test.source.s.value"),
    ]);
    controller.load_file(&file).unwrap();

    eventually("the panic to surface as exited health", || {
        controller
            .component_infos()
            .iter()
            .any(|info| {
                info.id == "test.crasher.c"
                    && info.health.state == HealthState::Exited
                    && info.health.message.contains("panicked")
            })
    })
    .await;

    kit.push("test.source.s", Value::from("v2"));
    eventually("v2 to reach the sink", || {
        kit.input("test.sink.snk") == Some(Value::from("v2"))
    })
    .await;

    controller.close().await.unwrap();
}

#[tokio::test]
async fn close_stops_every_worker() {
    let kit = TestKit::new();
    let (controller, metrics) = kit.controller();

    let file = SourceFile::new(vec![
        source("s", 0),
        passthrough("p", "test.source.s.value"),
    ]);
    controller.load_file(&file).unwrap();
    eventually("workers to start", || {
        kit.is_running("test.source.s") && kit.is_running("test.passthrough.p")
    })
    .await;

    // Keep the graph busy while closing.
    for n in 1..=100i64 {
        kit.push("test.source.s", Value::from(n));
    }
    controller.close().await.unwrap();

    assert!(!kit.is_running("test.source.s"));
    assert!(!kit.is_running("test.passthrough.p"));
    assert_eq!(0.0, metric_value(&metrics, "rill_controller_running_components"));
}

#[tokio::test]
#[should_panic(expected = "close called twice")]
async fn double_close_panics() {
    let kit = TestKit::new();
    let (controller, _metrics) = kit.controller();
    controller.load_file(&SourceFile::default()).unwrap();
    controller.close().await.unwrap();
    let _ = controller.close().await;
}

#[tokio::test]
async fn component_infos_report_references_and_health() {
    let kit = TestKit::new();
    let (controller, _metrics) = kit.controller();

    let file = SourceFile::new(vec![
        source("s", "v1"),
        sink("snk", "test.source.s.value"),
    ]);
    controller.load_file(&file).unwrap();

    let infos = controller.component_infos();
    assert_eq!(2, infos.len());

    let s = infos.iter().find(|i| i.id == "test.source.s").unwrap();
    assert_eq!("test.source", s.name);
    assert_eq!("s", s.label);
    assert!(s.references.is_empty());
    assert_eq!(vec!["test.sink.snk".to_owned()], s.referenced_by);
    assert_eq!(HealthState::Healthy, s.health.state);
    assert!(s.exports.is_some());

    let snk = infos.iter().find(|i| i.id == "test.sink.snk").unwrap();
    assert_eq!(vec!["test.source.s".to_owned()], snk.references);
    assert!(snk.exports.is_none());

    // Wire format of the original API: camelCase with referencesTo.
    let json = serde_json::to_value(snk).unwrap();
    assert!(json.get("referencesTo").is_some());
    assert!(json.get("referencedBy").is_some());
    assert_eq!("healthy", json["health"]["state"]);

    controller.close().await.unwrap();
}

#[tokio::test]
async fn component_handler_serves_component_info() {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    let kit = TestKit::new();
    let (controller, _metrics) = kit.controller();
    controller
        .load_file(&SourceFile::new(vec![source("s", "v1")]))
        .unwrap();

    let handler = controller.component_handler();

    let response = handler
        .clone()
        .oneshot(
            Request::builder()
                .uri("/component/test.source.s")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, response.status());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!("test.source.s", json["id"]);

    let response = handler
        .clone()
        .oneshot(
            Request::builder()
                .uri("/component/test.source.ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::NOT_FOUND, response.status());

    let response = handler
        .oneshot(
            Request::builder()
                .uri("/component/test.source.s/debug")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::NOT_FOUND, response.status());

    controller.close().await.unwrap();
}
