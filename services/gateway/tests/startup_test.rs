//! Gateway startup against an unreachable broker

mod support;

use std::time::Duration;

use gateway::config::GatewayConfig;
use gateway::{Gateway, GatewayError, GatewaySummary};
use tokio_util::sync::CancellationToken;

use support::{torre_fusora_block, FakeController};

/// A local port with nothing listening on it
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn unreachable_broker_config(retries: u32) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.bus.host = "127.0.0.1".to_string();
    config.bus.port = closed_port().await;
    config.bus.connection_retries = retries;
    config.bus.initial_retry_delay_ms = 10;
    config.bus.reconnect_min_delay_ms = 10;
    config.bus.reconnect_max_delay_ms = 40;
    config.bus.connect_timeout_ms = 500;
    config
}

#[tokio::test]
async fn test_gives_up_after_connection_retries() {
    support::init_tracing();
    let controller = FakeController::new(torre_fusora_block(725.3));
    let config = unreachable_broker_config(3).await;
    let gateway = Gateway::with_transport(config, controller.builder()).unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        gateway.run(CancellationToken::new()),
    )
    .await
    .expect("startup must give up on its own");

    match result {
        Err(GatewayError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    // Polling never starts without a broker
    assert_eq!(controller.builds(), 0);
}

#[tokio::test]
async fn test_shutdown_during_initial_connect_is_clean() {
    let controller = FakeController::new(torre_fusora_block(725.3));
    let mut config = unreachable_broker_config(100).await;
    config.bus.initial_retry_delay_ms = 60_000;
    config.bus.reconnect_max_delay_ms = 60_000;
    let gateway = Gateway::with_transport(config, controller.builder()).unwrap();

    let cancel = CancellationToken::new();
    let run = tokio::spawn(gateway.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancel must end the retry wait")
        .unwrap()
        .unwrap();
    assert_eq!(summary, GatewaySummary::default());
    assert_eq!(controller.builds(), 0);
}

#[test]
fn test_invalid_config_rejected_before_running() {
    let controller = FakeController::new(torre_fusora_block(725.3));
    let mut config = GatewayConfig::default();
    config.topics.realtime = "plcTemperaturas/tiemporeal".to_string();

    let result = Gateway::with_transport(config, controller.builder());
    assert!(matches!(result, Err(GatewayError::Config(_))));
}

#[test]
fn test_initial_policy_follows_bus_config() {
    let controller = FakeController::new(torre_fusora_block(725.3));
    let gateway = Gateway::with_transport(GatewayConfig::default(), controller.builder()).unwrap();

    let policy = gateway.initial_connect_policy();
    // 5 attempts: 5s, 10s, 20s, 40s between them
    assert!(policy.allows_another(3));
    assert!(!policy.allows_another(5));
    assert_eq!(policy.delay_for(1), Duration::from_secs(5));
    assert_eq!(policy.delay_for(4), Duration::from_secs(40));
}
