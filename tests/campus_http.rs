//! Campus aggregator over real HTTP, with mock node endpoints

use chrono::Utc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vpp_controller::campus::CampusAggregator;
use vpp_controller::config::{CampusConfig, DroopConfig};
use vpp_controller::domain::types::SafetyTelemetry;
use vpp_controller::domain::{NodeIdentity, NodeStatus, Setpoint, TelemetryReport};
use vpp_controller::grid::dispatcher::GridDispatcher;
use vpp_controller::grid::monitor::FrequencyBand;

fn identity(id: &str, rated: f64) -> NodeIdentity {
    NodeIdentity {
        node_id: id.to_string(),
        campus_id: "CAMPUS_01".to_string(),
        rated_power_kw: rated,
        energy_capacity_kwh: rated * 2.0,
    }
}

fn report(id: &str, soc: f64) -> TelemetryReport {
    TelemetryReport {
        node_id: id.to_string(),
        campus_id: "CAMPUS_01".to_string(),
        ts: Utc::now(),
        soc: Some(soc),
        soh: Some(95.0),
        voltage: Some(58.0),
        current: Some(0.0),
        temperature: Some(25.0),
        power_kw: Some(0.0),
        reactive_power_kvar: Some(0.0),
        frequency: Some(50.0),
        capacity_kwh: 200.0,
        max_power_kw: 100.0,
        cycle_count: Some(10),
        status: Default::default(),
        bms: None,
        inverter: None,
        safety: SafetyTelemetry {
            emergency_stopped: false,
            power_reduction_factor: 1.0,
            violations: Vec::new(),
        },
    }
}

async fn mock_node(id: &str, soc: f64, accept_setpoints: bool) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/telemetry"))
        .respond_with(ResponseTemplate::new(200).set_body_json(report(id, soc)))
        .mount(&server)
        .await;
    let status = if accept_setpoints { 200 } else { 500 };
    Mock::given(method("POST"))
        .and(path("/api/v1/power"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn campus_config() -> CampusConfig {
    CampusConfig {
        poll_interval_secs: 1,
        ..CampusConfig::default()
    }
}

#[tokio::test]
async fn poll_brings_nodes_online_and_aggregates() {
    let node_a = mock_node("a", 80.0, true).await;
    let node_b = mock_node("b", 40.0, true).await;

    let ca = CampusAggregator::new(campus_config()).unwrap();
    ca.register(identity("a", 100.0), node_a.uri()).await.unwrap();
    ca.register(identity("b", 200.0), node_b.uri()).await.unwrap();

    ca.poll_all().await;

    let listing = ca.node_listing().await;
    assert!(listing.iter().all(|n| n.status == NodeStatus::Online));

    let capacity = ca.aggregate_capacity().await;
    assert_eq!(capacity.rated_power_kw, 300.0);
    assert_eq!(capacity.available_power_kw, 300.0);

    let rollup = ca.campus_telemetry().await;
    assert_eq!(rollup.online_nodes, 2);
    assert_eq!(rollup.average_soc, 60.0);
}

#[tokio::test]
async fn dispatch_delivers_setpoints_with_validity_window() {
    let node_a = mock_node("a", 80.0, true).await;
    let node_b = mock_node("b", 80.0, true).await;

    let ca = CampusAggregator::new(campus_config()).unwrap();
    ca.register(identity("a", 100.0), node_a.uri()).await.unwrap();
    ca.register(identity("b", 100.0), node_b.uri()).await.unwrap();
    ca.poll_all().await;

    let before = Utc::now();
    let result = ca.dispatch(-80.0, "proportional", None).await.unwrap();
    assert!(result.all_delivered());
    assert!(!result.saturated);

    // Inspect what node a actually received
    let requests = node_a.received_requests().await.unwrap();
    let setpoint_req = requests
        .iter()
        .find(|r| r.url.path() == "/api/v1/power")
        .expect("setpoint delivered");
    let setpoint: Setpoint = serde_json::from_slice(&setpoint_req.body).unwrap();
    assert!((setpoint.target_kw + 40.0).abs() <= 0.1);
    // valid_until = now + 2x poll interval (1 s here)
    let window = setpoint.valid_until - before;
    assert!(window.num_seconds() >= 1 && window.num_seconds() <= 3);
    assert_eq!(setpoint.source_id, "campus:CAMPUS_01");
}

#[tokio::test]
async fn failed_delivery_reports_partial_and_excludes_node() {
    let node_a = mock_node("a", 80.0, true).await;
    let node_b = mock_node("b", 80.0, false).await; // refuses writes

    let ca = CampusAggregator::new(campus_config()).unwrap();
    ca.register(identity("a", 100.0), node_a.uri()).await.unwrap();
    ca.register(identity("b", 100.0), node_b.uri()).await.unwrap();
    ca.poll_all().await;

    let result = ca.dispatch(-80.0, "proportional", None).await.unwrap();
    assert!(!result.all_delivered());
    assert!(result.outcomes["a"].delivered);
    assert!(!result.outcomes["b"].delivered);
    assert!(result.outcomes["b"].error.is_some());

    // The failed node no longer counts toward available capacity
    let capacity = ca.aggregate_capacity().await;
    assert_eq!(capacity.available_power_kw, 100.0);
}

#[tokio::test]
async fn dispatch_sequences_are_monotonic() {
    let node_a = mock_node("a", 80.0, true).await;

    let ca = CampusAggregator::new(campus_config()).unwrap();
    ca.register(identity("a", 100.0), node_a.uri()).await.unwrap();
    ca.poll_all().await;

    ca.dispatch(-10.0, "proportional", None).await.unwrap();
    ca.dispatch(-20.0, "proportional", None).await.unwrap();

    let requests = node_a.received_requests().await.unwrap();
    let seqs: Vec<u64> = requests
        .iter()
        .filter(|r| r.url.path() == "/api/v1/power")
        .map(|r| serde_json::from_slice::<Setpoint>(&r.body).unwrap().seq)
        .collect();
    assert_eq!(seqs.len(), 2);
    assert!(seqs[1] > seqs[0]);
}

/// Emergency fan-out (critical low frequency): the grid tier bypasses the
/// campus dispatch and commands each online node at rated magnitude, wire
/// sign negative (discharge).
#[tokio::test]
async fn emergency_fanout_commands_rated_discharge() {
    let node_a = mock_node("a", 80.0, true).await;
    let node_b = mock_node("b", 15.0, true).await;

    // A campus server exposing the node listing
    let campus_server = MockServer::start().await;
    let listing = serde_json::json!({
        "campus_id": "CAMPUS_01",
        "nodes": [
            {
                "node_id": "a", "campus_id": "CAMPUS_01",
                "rated_power_kw": 100.0, "energy_capacity_kwh": 200.0,
                "endpoint": node_a.uri(), "status": "online", "soc": 80.0
            },
            {
                "node_id": "b", "campus_id": "CAMPUS_01",
                "rated_power_kw": 50.0, "energy_capacity_kwh": 100.0,
                "endpoint": node_b.uri(), "status": "online", "soc": 15.0
            }
        ]
    });
    Mock::given(method("GET"))
        .and(path("/api/v1/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing))
        .mount(&campus_server)
        .await;

    let droop_cfg = DroopConfig {
        campus_url: Some(campus_server.uri()),
        ..DroopConfig::default()
    };
    let dispatcher = GridDispatcher::new(&droop_cfg).unwrap();

    let now = Utc::now();
    dispatcher
        .emergency_fanout(FrequencyBand::CriticalLow, now)
        .await;
    assert!(dispatcher.in_emergency_hold(now).await);

    for (server, rated) in [(&node_a, 100.0), (&node_b, 50.0)] {
        let requests = server.received_requests().await.unwrap();
        let setpoint: Setpoint = requests
            .iter()
            .find(|r| r.url.path() == "/api/v1/power")
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .expect("emergency setpoint delivered");
        assert_eq!(setpoint.target_kw, -rated);
        assert_eq!(setpoint.source_id, "fdc");
    }
}
