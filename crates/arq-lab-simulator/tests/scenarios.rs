//! End-to-end transfers over the simulated channel.

use std::path::PathBuf;

use arq_lab_abstract::{ArqConfig, SimConfig, TestScenario};
use arq_lab_protocol::BernoulliLoss;
use arq_lab_simulator::scenario_runner::{run_scenario, run_scenario_file};
use arq_lab_simulator::{Completion, Transfer};

fn scenario_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../scenarios")
        .join(name)
}

#[test]
fn bundled_scenarios_pass() {
    for name in [
        "priority_lossless.toml",
        "random_loss.toml",
        "tail_drop.toml",
        "scripted_loss.toml",
    ] {
        let report = run_scenario_file(&scenario_path(name), ArqConfig::default())
            .unwrap_or_else(|e| panic!("{name}: {e:#}"));
        assert!(report.sender_complete, "{name}");
    }
}

#[test]
fn every_message_arrives_exactly_once_under_heavy_loss() {
    for seed in 0..8 {
        let arq = ArqConfig {
            window_capacity: 5,
            total_messages: 60,
            loss_probability: 0.6,
            ack_timeout_ms: 300,
            ..Default::default()
        };
        let sim = SimConfig {
            min_latency: 1,
            max_latency: 80,
            duplicate_rate: 0.2,
            seed,
            ..Default::default()
        };
        let injector = BernoulliLoss::new(arq.loss_probability, Some(seed));
        let mut transfer = Transfer::transfer(arq, sim, Box::new(injector));
        let completion = transfer.run_until_complete();
        let report = transfer.export_report(completion);

        assert_eq!(report.completion, Completion::Idle, "seed {seed}");
        assert!(report.all_delivered(), "seed {seed}");
        assert!(report.delivered_in_order(), "seed {seed}");
        assert!(!report.has_duplicate_delivery(), "seed {seed}");
        assert!(report.max_window_in_flight() <= 5.0, "seed {seed}");
        assert!(report.sender_stats.simulated_losses > 0, "seed {seed}");
    }
}

#[test]
fn failed_assertion_is_reported() {
    let scenario = TestScenario::from_toml_str(
        r#"
        name = "impossible"

        [arq]
        total_messages = 5
        loss_probability = 0.0

        [[assertions]]
        type = "sender_transmissions"
        min = 0
        max = 2
        "#,
    )
    .unwrap();
    let error = run_scenario(&scenario, ArqConfig::default()).unwrap_err();
    assert!(error.to_string().contains("sender transmissions"));
}

#[test]
fn invalid_arq_section_is_rejected() {
    let scenario = TestScenario::from_toml_str(
        r#"
        name = "bad"

        [arq]
        window_capacity = 0
        "#,
    )
    .unwrap();
    assert!(run_scenario(&scenario, ArqConfig::default()).is_err());
}

#[test]
fn report_serialises_to_json() {
    let arq = ArqConfig {
        total_messages: 4,
        loss_probability: 0.0,
        ..Default::default()
    };
    let mut transfer = Transfer::transfer(arq, SimConfig::default(), Box::new(arq_lab_protocol::NoLoss));
    let completion = transfer.run_until_complete();
    let json = serde_json::to_value(transfer.export_report(completion)).unwrap();
    assert_eq!(json["completion"], "idle");
    assert_eq!(json["deliveries"][3]["payload"], "Message 3");
    assert_eq!(json["arq"]["priority_rule"]["rule"], "every_nth");
}
