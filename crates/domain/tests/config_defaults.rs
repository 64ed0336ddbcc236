use ec_domain::config::{ConfigSeverity, OrchestratorConfig};

#[test]
fn defaults_match_documented_values() {
    let config = OrchestratorConfig::default();
    assert_eq!(config.evaluation_concurrency, 1);
    assert_eq!(config.evaluation_timeout_seconds, 7200);
    assert_eq!(config.evaluation_test_path, "basics");
    assert_eq!(config.evaluation_envoi_url, "http://localhost:8000");
    assert_eq!(config.turn_recovery_retries, 3);
    assert_eq!(config.message_timeout_seconds, 600);
    assert_eq!(config.logs_flush_interval_seconds, 5);
    assert_eq!(config.logs_flush_batch_size, 50);
    assert_eq!(config.shutdown_grace_seconds, 300);
    assert_eq!(config.evaluator_drain_timeout_seconds, 30);
    assert!(config.resume_from_store);
    assert_eq!(config.advisor_timeout_seconds, 180);
    assert_eq!(config.failed_test_feedback_limit, 50);
}

#[test]
fn default_config_validates_clean() {
    let issues = OrchestratorConfig::default().validate();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

#[test]
fn empty_envoi_url_is_an_error() {
    let config = OrchestratorConfig {
        evaluation_envoi_url: String::new(),
        ..Default::default()
    };
    let issues = config.validate();
    assert!(issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error && i.field == "evaluation_envoi_url"));
}
