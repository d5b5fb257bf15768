use super::*;
use crate::models::{RecommendationDueMetadata, WorkloadKind};
use crate::storage::NewWorkload;
use crate::testing::{MockAnalyzer, MockStore};
use chrono::TimeZone;
use serde_json::{json, Value};

const EXPERIMENT: &str = "o|s|c|acme|deployment|api";

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
}

fn kruize_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn store_with_workload() -> MockStore {
    let store = MockStore::default();
    store.add_workload(NewWorkload {
        org_id: "o".into(),
        cluster_id: 1,
        experiment_name: EXPERIMENT.into(),
        namespace: "acme".into(),
        workload_type: WorkloadKind::Deployment,
        workload_name: "api".into(),
        containers: vec!["web".into()],
        metrics_upload_at: at(10, 1),
    });
    store
}

fn due(max_end: DateTime<Utc>, new_record: bool, experiment_type: ExperimentType) -> RecommendationDue {
    RecommendationDue {
        request_id: "req-1".into(),
        metadata: RecommendationDueMetadata {
            org_id: "o".into(),
            workload_id: 1,
            experiment_name: EXPERIMENT.into(),
            max_endtime_report: max_end,
            new_record,
            experiment_type,
        },
    }
}

fn container_body(end: DateTime<Utc>, notifications: Value) -> Vec<RecommendedExperiment> {
    let key = kruize_ts(end);
    serde_json::from_value(json!([{
        "experiment_name": EXPERIMENT,
        "kubernetes_objects": [{
            "type": "deployment", "name": "api", "namespace": "acme",
            "containers": [{
                "container_name": "web",
                "recommendations": {"data": {key.clone(): {
                    "notifications": notifications,
                    "monitoring_end_time": key,
                    "recommendation_terms": {"short_term": {
                        "monitoring_start_time": kruize_ts(end - Duration::hours(24))
                    }}
                }}}
            }]
        }]
    }]))
    .unwrap()
}

fn poller(analyzer: &Arc<MockAnalyzer>, store: &Arc<MockStore>) -> RecommendationPoller {
    RecommendationPoller::new(analyzer.clone(), store.clone(), 6, PipelineMetrics::new())
}

#[test]
fn test_should_poll() {
    let delay = Duration::hours(6);
    assert!(should_poll(true, Some(at(10, 0)), at(10, 1), delay));
    assert!(should_poll(false, None, at(10, 1), delay));
    assert!(!should_poll(false, Some(at(10, 0)), at(10, 1), delay));
    assert!(should_poll(false, Some(at(10, 0)), at(10, 6), delay));
}

#[test]
fn test_should_poll_on_first_of_month() {
    let delay = Duration::hours(6);
    let first = |month, hour| Utc.with_ymd_and_hms(2024, month, 1, hour, 0, 0).unwrap();
    let last_of_feb = Utc.with_ymd_and_hms(2024, 2, 29, 23, 0, 0).unwrap();

    assert!(should_poll(false, Some(last_of_feb), first(3, 1), delay));
    assert!(should_poll(
        false,
        Some(Utc.with_ymd_and_hms(2023, 12, 31, 22, 0, 0).unwrap()),
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap(),
        delay
    ));
    // Same day as the stored recommendation
    assert!(!should_poll(false, Some(first(3, 0)), first(3, 2), delay));
    // Not the first
    assert!(!should_poll(false, Some(at(1, 23)), at(2, 1), delay));
}

#[tokio::test]
async fn test_recent_recommendation_defers_without_analyzer_call() {
    let analyzer = Arc::new(MockAnalyzer::default());
    let store = Arc::new(store_with_workload());
    store.with_state(|s| {
        s.recommendations.insert(
            (1, "web".into()),
            RecommendationRow {
                workload_id: 1,
                container_name: "web".into(),
                monitoring_start: at(9, 0),
                monitoring_end: at(10, 0),
                recommendations: json!({}),
            },
        );
    });
    let before = PipelineMetrics::new().deferred_recommendations();

    let disposition = poller(&analyzer, &store)
        .process(&due(at(10, 1), false, ExperimentType::Container))
        .await;

    assert_eq!(disposition, Disposition::Defer);
    assert!(analyzer.recommendation_calls.lock().unwrap().is_empty());
    assert!(PipelineMetrics::new().deferred_recommendations() > before);
}

#[tokio::test]
async fn test_new_workload_is_polled_and_stored() {
    let analyzer = Arc::new(MockAnalyzer::default());
    analyzer.respond(Ok(container_body(at(10, 1), json!({}))));
    let store = Arc::new(store_with_workload());

    let disposition = poller(&analyzer, &store)
        .process(&due(at(10, 1), true, ExperimentType::Container))
        .await;

    assert_eq!(disposition, Disposition::Commit);
    assert_eq!(
        analyzer.recommendation_calls.lock().unwrap().clone(),
        vec![(EXPERIMENT.to_string(), at(10, 1))]
    );
    store.with_state(|s| {
        let row = &s.recommendations[&(1, "web".to_string())];
        assert_eq!(row.monitoring_end, at(10, 1));
        assert_eq!(row.monitoring_start, at(9, 1));
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.history[0].0, "o");
    });
}

#[tokio::test]
async fn test_repeated_response_is_idempotent() {
    let analyzer = Arc::new(MockAnalyzer::default());
    analyzer.respond(Ok(container_body(at(10, 1), json!({}))));
    analyzer.respond(Ok(container_body(at(10, 1), json!({}))));
    let store = Arc::new(store_with_workload());
    let poller = poller(&analyzer, &store);
    let message = due(at(10, 1), true, ExperimentType::Container);

    poller.process(&message).await;
    poller.process(&message).await;

    store.with_state(|s| {
        assert_eq!(s.recommendations.len(), 1);
        assert_eq!(s.history.len(), 1);
    });
}

#[tokio::test]
async fn test_stored_end_advances_and_never_regresses() {
    let analyzer = Arc::new(MockAnalyzer::default());
    analyzer.respond(Ok(container_body(at(11, 0), json!({}))));
    analyzer.respond(Ok(container_body(at(10, 0), json!({}))));
    let store = Arc::new(store_with_workload());
    let poller = poller(&analyzer, &store);

    poller.process(&due(at(11, 0), true, ExperimentType::Container)).await;
    assert_eq!(
        store.with_state(|s| s.recommendations[&(1, "web".to_string())].monitoring_end),
        at(11, 0)
    );

    // a stale answer lands in history only
    poller.process(&due(at(10, 0), true, ExperimentType::Container)).await;
    store.with_state(|s| {
        assert_eq!(s.recommendations[&(1, "web".to_string())].monitoring_end, at(11, 0));
        assert_eq!(s.history.len(), 2);
    });
}

#[tokio::test]
async fn test_not_ready_and_transport_errors_defer() {
    let analyzer = Arc::new(MockAnalyzer::default());
    analyzer.respond(Err(AnalyzerError::Transport {
        path: "updateRecommendations".into(),
        message: "timeout".into(),
    }));
    let store = Arc::new(store_with_workload());
    let poller = poller(&analyzer, &store);
    let message = due(at(10, 1), true, ExperimentType::Container);

    assert_eq!(poller.process(&message).await, Disposition::Defer);
    // queue drained: the mock now answers "not ready"
    assert_eq!(poller.process(&message).await, Disposition::Defer);
    store.with_state(|s| assert!(s.recommendations.is_empty()));
}

#[tokio::test]
async fn test_invalid_body_is_committed() {
    let analyzer = Arc::new(MockAnalyzer::default());
    let blocking = json!({"221001": {"type": "error", "code": 221001}});
    analyzer.respond(Ok(container_body(at(10, 1), blocking)));
    let store = Arc::new(store_with_workload());

    let disposition = poller(&analyzer, &store)
        .process(&due(at(10, 1), true, ExperimentType::Container))
        .await;

    assert_eq!(disposition, Disposition::Commit);
    store.with_state(|s| assert!(s.recommendations.is_empty()));
}

#[tokio::test]
async fn test_deleted_workload_is_skipped() {
    let analyzer = Arc::new(MockAnalyzer::default());
    let store = Arc::new(MockStore::default());

    let disposition = poller(&analyzer, &store)
        .process(&due(at(10, 1), true, ExperimentType::Container))
        .await;

    assert_eq!(disposition, Disposition::Commit);
    assert!(analyzer.recommendation_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_namespace_recommendation_is_summarized() {
    let analyzer = Arc::new(MockAnalyzer::default());
    let key = kruize_ts(at(10, 1));
    let body: Vec<RecommendedExperiment> = serde_json::from_value(json!([{
        "experiment_type": "namespace",
        "kubernetes_objects": [{"namespaces": {
            "namespace": "acme",
            "recommendations": {"data": {key.clone(): {
                "monitoring_end_time": key,
                "current": {"requests": {
                    "cpu": {"amount": 4.0, "format": "cores"},
                    "memory": {"amount": 2048.0, "format": "bytes"}
                }},
                "recommendation_terms": {"short_term": {
                    "recommendation_engines": {"cost": {"variation": {"requests": {
                        "cpu": {"amount": 1.0, "format": "cores"},
                        "memory": {"amount": -1024.0, "format": "bytes"}
                    }}}}
                }}
            }}}
        }}]
    }]))
    .unwrap();
    analyzer.respond(Ok(body));
    let store = Arc::new(store_with_workload());

    let disposition = poller(&analyzer, &store)
        .process(&due(at(10, 1), true, ExperimentType::Namespace))
        .await;

    assert_eq!(disposition, Disposition::Commit);
    store.with_state(|s| {
        let row = &s.namespace_recommendations[&1];
        assert_eq!(row.namespace_name, "acme");
        assert_eq!(row.cpu_request_current, Some(4.0));
        assert_eq!(row.cpu_variation, Some(25.0));
        assert_eq!(row.memory_variation, Some(-50.0));
        assert_eq!(s.namespace_history.len(), 1);
        assert!(s.recommendations.is_empty());
    });
}

#[tokio::test]
async fn test_handler_skips_invalid_envelope() {
    let analyzer = Arc::new(MockAnalyzer::default());
    let store = Arc::new(store_with_workload());
    let poller = poller(&analyzer, &store);

    let zero_workload = json!({
        "request_id": "r",
        "metadata": {"org_id": "o", "workload_id": 0, "experiment_name": EXPERIMENT,
                     "max_endtime_report": "2024-03-10T01:00:00Z"}
    });
    let message = BusMessage::new("rosocp.kruize.recommendations", zero_workload.to_string());
    assert_eq!(poller.handle(&message).await, Disposition::Commit);

    let garbage = BusMessage::new("rosocp.kruize.recommendations", "{");
    assert_eq!(poller.handle(&garbage).await, Disposition::Commit);
    assert!(analyzer.recommendation_calls.lock().unwrap().is_empty());
}
