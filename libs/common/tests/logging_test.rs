//! Global subscriber setup; one per test binary, so a single test owns it

use common::logging::{init_with_config, LogConfig};
use tracing::Level;

#[test]
fn test_file_logging_creates_rolling_file_and_rejects_second_init() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("logs");

    init_with_config(LogConfig {
        service_name: "gateway".to_string(),
        log_dir: Some(log_dir.clone()),
        level: Level::DEBUG,
        enable_json: true,
        ansi: false,
    })
    .unwrap();
    tracing::info!(channel = "Torre Fusora", "file logging up");

    let files: Vec<String> = std::fs::read_dir(&log_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(
        files.iter().any(|name| name.starts_with("gateway.log")),
        "no rolling file in {files:?}"
    );

    // A process gets one global subscriber
    assert!(common::logging::init("gateway", "info").is_err());
}
