use anyhow::{Context, anyhow};
use arq_lab_abstract::{ArqConfig, SimConfig, TestAction, TestAssertion, TestScenario};
use arq_lab_protocol::{FaultInjector, ScriptedLoss, fault};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::engine::Transfer;
use crate::trace::{Completion, SimulationReport};

pub fn load_scenario(path: &Path) -> anyhow::Result<TestScenario> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
    TestScenario::from_toml_str(&content).context("Failed to parse scenario file")
}

pub fn run_scenario_file(path: &Path, base: ArqConfig) -> anyhow::Result<SimulationReport> {
    let scenario = load_scenario(path)?;
    run_scenario(&scenario, base)
}

/// Run `scenario` on top of `base` and check its assertions.
pub fn run_scenario(scenario: &TestScenario, base: ArqConfig) -> anyhow::Result<SimulationReport> {
    info!("Running Scenario: {}", scenario.name);
    if !scenario.description.is_empty() {
        info!("Description: {}", scenario.description);
    }

    let mut arq = base;
    scenario.arq.apply_to(&mut arq);
    arq.validate().context("Invalid [arq] section")?;

    let mut sim_config = SimConfig::default();
    scenario.sim.apply_to(&mut sim_config);
    sim_config.validate().context("Invalid [sim] section")?;

    let mut injector: Box<dyn FaultInjector> = fault::from_config(&arq);
    for action in &scenario.actions {
        if let TestAction::ScriptedLosses { pattern } = action {
            injector = Box::new(ScriptedLoss::new(pattern.iter().copied()));
        }
    }

    let mut sim = Transfer::transfer(arq, sim_config, injector);

    // Deterministic channel faults
    for action in &scenario.actions {
        match action {
            TestAction::DropNextFromSenderSeq { seq } => sim.add_drop_sender_seq_once(*seq),
            TestAction::CorruptNextFromSenderSeq { seq } => sim.add_corrupt_sender_seq_once(*seq),
            TestAction::ScriptedLosses { .. } => {}
        }
    }

    let completion = sim.run_until_complete();
    let report = sim.export_report(completion);
    check_assertions(&scenario.assertions, &report)?;

    info!("Test Scenario Passed!");
    Ok(report)
}

fn check_assertions(assertions: &[TestAssertion], report: &SimulationReport) -> anyhow::Result<()> {
    for assertion in assertions {
        match assertion {
            TestAssertion::AllDelivered => {
                if !report.all_delivered() {
                    return Err(anyhow!(
                        "Assertion Failed: only {} of {} messages delivered",
                        report.deliveries.len(),
                        report.total_messages
                    ));
                }
            }
            TestAssertion::DeliveredInOrder => {
                if !report.delivered_in_order() {
                    return Err(anyhow!("Assertion Failed: deliveries are out of order"));
                }
            }
            TestAssertion::NoDuplicateDelivery => {
                if report.has_duplicate_delivery() {
                    return Err(anyhow!("Assertion Failed: a message was delivered twice"));
                }
            }
            TestAssertion::SenderComplete => {
                if !report.sender_complete {
                    return Err(anyhow!("Assertion Failed: sender did not complete"));
                }
            }
            TestAssertion::MaxDuration { ms } => {
                if report.completion == Completion::TimeLimit || report.duration_ms > *ms {
                    return Err(anyhow!(
                        "Assertion Failed: run took {} ms, expected at most {}",
                        report.duration_ms,
                        ms
                    ));
                }
            }
            TestAssertion::SenderTransmissions { min, max } => {
                check_range(
                    "sender transmissions",
                    report.sender_stats.transmissions,
                    *min,
                    *max,
                )?;
            }
            TestAssertion::Timeouts { min, max } => {
                check_range("timeouts", report.sender_stats.timeouts, *min, *max)?;
            }
        }
    }
    Ok(())
}

fn check_range(what: &str, value: u64, min: u64, max: Option<u64>) -> anyhow::Result<()> {
    if value < min {
        return Err(anyhow!(
            "Assertion Failed: {} = {}, expected min {}",
            what,
            value,
            min
        ));
    }
    if let Some(max) = max
        && value > max
    {
        return Err(anyhow!(
            "Assertion Failed: {} = {}, expected max {}",
            what,
            value,
            max
        ));
    }
    Ok(())
}
