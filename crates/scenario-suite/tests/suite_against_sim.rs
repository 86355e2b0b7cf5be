//! The whole suite run against the simulated core

use pretty_assertions::assert_eq;
use serial_test::serial;
use sipdrill_scenario_core::{Capabilities, SuiteReport};
use sipdrill_scenario_suite::{run, RunnerConfig};

async fn run_filtered(config: &RunnerConfig, filter: &str) -> SuiteReport {
    run(config, Some(filter)).await.unwrap()
}

fn assert_all_passed(report: &SuiteReport, expected: usize) {
    assert!(report.is_success(), "suite failed:\n{}", report);
    assert_eq!(report.passed, expected, "{}", report);
    assert_eq!(report.skipped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_call_diversion_strict() {
    let report = run_filtered(&RunnerConfig::default(), "Call Diversion").await;
    assert_all_passed(&report, 11);
}

#[tokio::test(start_paused = true)]
async fn test_call_diversion_absorbed() {
    let config = RunnerConfig::default().with_absorbed_provisionals();
    for filter in ["Unconditional", "No answer", "Audio-video call", "Not reachable (503)"] {
        let report = run_filtered(&config, filter).await;
        assert_all_passed(&report, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_reg_event_subscriptions() {
    let report = run_filtered(&RunnerConfig::default(), "SUBSCRIBE").await;
    assert_all_passed(&report, 5);
}

#[tokio::test(start_paused = true)]
async fn test_missing_capabilities_skip() {
    let mut config = RunnerConfig::default();
    config.harness.capabilities = Capabilities::default();

    let report = run(&config, None).await.unwrap();
    assert!(report.is_success(), "{}", report);

    let passed: Vec<&str> = report
        .tests
        .iter()
        .filter(|t| t.passed())
        .map(|t| t.name.as_str())
        .collect();
    assert_eq!(
        passed,
        vec![
            "SUBSCRIBE - reg-event",
            "SUBSCRIBE - reg-event with a GRUU",
            "SUBSCRIBE - Subscription timeout",
            "Multiple SUBSCRIBErs to one UE's reg-event",
        ]
    );
    assert_eq!(report.skipped, 12);
    assert_eq!(report.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_json_report() {
    let report = run_filtered(&RunnerConfig::default(), "Busy").await;
    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["passed"], 1);
    assert_eq!(value["tests"][0]["name"], "Call Diversion - Busy");
    assert_eq!(value["tests"][0]["outcome"], "passed");
}

#[test]
#[serial]
fn test_environment_overrides() {
    unsafe {
        std::env::set_var("SIPDRILL__HARNESS__HOME_DOMAIN", "ims.example.net");
        std::env::set_var("SIPDRILL__SIM__ABSORB_PROVISIONAL", "true");
    }
    let config = RunnerConfig::load(None);
    unsafe {
        std::env::remove_var("SIPDRILL__HARNESS__HOME_DOMAIN");
        std::env::remove_var("SIPDRILL__SIM__ABSORB_PROVISIONAL");
    }

    let config = config.unwrap();
    assert_eq!(config.harness.home_domain, "ims.example.net");
    assert_eq!(config.sim.domain, "ims.example.net");
    assert_eq!(config.sim.host, "core.ims.example.net");
    assert_eq!(
        config.harness.provisional_policy,
        sipdrill_scenario_core::ProvisionalPolicy::Absorbed
    );
}

#[test]
#[serial]
fn test_defaults_without_environment() {
    let config = RunnerConfig::load(None).unwrap();
    assert_eq!(config, RunnerConfig::default());
}
