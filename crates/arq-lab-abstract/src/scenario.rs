use crate::config::{ArqConfig, PriorityRule, SimConfig};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct TestScenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arq: ArqConfigOverride,
    #[serde(default)]
    pub sim: SimConfigOverride,
    #[serde(default)]
    pub actions: Vec<TestAction>,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

impl TestScenario {
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ArqConfigOverride {
    pub window_capacity: Option<usize>,
    pub total_messages: Option<u32>,
    pub loss_probability: Option<f64>,
    pub ack_timeout_ms: Option<u64>,
    pub priority_rule: Option<PriorityRule>,
    pub max_consecutive_losses: Option<u32>,
    pub seed: Option<u64>,
}

impl ArqConfigOverride {
    pub fn apply_to(&self, config: &mut ArqConfig) {
        if let Some(v) = self.window_capacity {
            config.window_capacity = v;
        }
        if let Some(v) = self.total_messages {
            config.total_messages = v;
        }
        if let Some(v) = self.loss_probability {
            config.loss_probability = v;
        }
        if let Some(v) = self.ack_timeout_ms {
            config.ack_timeout_ms = v;
        }
        if let Some(v) = self.priority_rule {
            config.priority_rule = v;
        }
        if let Some(v) = self.max_consecutive_losses {
            config.max_consecutive_losses = v;
        }
        if let Some(v) = self.seed {
            config.seed = Some(v);
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SimConfigOverride {
    pub corrupt_rate: Option<f64>,
    pub duplicate_rate: Option<f64>,
    pub min_latency: Option<u64>,
    pub max_latency: Option<u64>,
    pub seed: Option<u64>,
    pub max_duration_ms: Option<u64>,
}

impl SimConfigOverride {
    pub fn apply_to(&self, config: &mut SimConfig) {
        if let Some(v) = self.corrupt_rate {
            config.corrupt_rate = v;
        }
        if let Some(v) = self.duplicate_rate {
            config.duplicate_rate = v;
        }
        if let Some(v) = self.min_latency {
            config.min_latency = v;
        }
        if let Some(v) = self.max_latency {
            config.max_latency = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.max_duration_ms {
            config.max_duration_ms = v;
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAction {
    /// Drop the first datagram the sender puts on the channel with this seq.
    DropNextFromSenderSeq { seq: u32 },
    /// Flip a byte in the first datagram the sender puts on the channel with this seq.
    CorruptNextFromSenderSeq { seq: u32 },
    /// Replace the random fault injector with a fixed list of drop decisions.
    ScriptedLosses { pattern: Vec<bool> },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAssertion {
    /// Every message of the transfer reached the application.
    AllDelivered,
    /// Deliveries are strictly increasing in seq with no gaps.
    DeliveredInOrder,
    NoDuplicateDelivery,
    /// The sender reached its terminal condition.
    SenderComplete,
    MaxDuration { ms: u64 },
    SenderTransmissions { min: u64, max: Option<u64> },
    Timeouts { min: u64, max: Option<u64> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scenario_with_overrides() {
        let scenario = TestScenario::from_toml_str(
            r#"
            name = "lossy"
            description = "sender drops"

            [arq]
            window_capacity = 4
            total_messages = 12

            [sim]
            seed = 7

            [[actions]]
            type = "scripted_losses"
            pattern = [true, false, true]

            [[actions]]
            type = "drop_next_from_sender_seq"
            seq = 2

            [[assertions]]
            type = "all_delivered"

            [[assertions]]
            type = "sender_transmissions"
            min = 12
            "#,
        )
        .unwrap();

        let mut arq = ArqConfig::default();
        scenario.arq.apply_to(&mut arq);
        assert_eq!(arq.window_capacity, 4);
        assert_eq!(arq.total_messages, 12);

        let mut sim = SimConfig::default();
        scenario.sim.apply_to(&mut sim);
        assert_eq!(sim.seed, 7);

        assert_eq!(scenario.actions.len(), 2);
        assert!(matches!(
            scenario.assertions[1],
            TestAssertion::SenderTransmissions { min: 12, max: None }
        ));
    }
}
