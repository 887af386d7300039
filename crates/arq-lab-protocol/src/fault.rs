//! Sender-side channel unreliability.
//!
//! The sender asks its [`FaultInjector`] once per send attempt whether the
//! datagram should vanish. Tests swap the random implementation for
//! [`NoLoss`] or [`ScriptedLoss`].

use std::collections::VecDeque;

use arq_lab_abstract::ArqConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait FaultInjector: Send {
    /// Decide the fate of one send attempt, independently of all others.
    fn should_drop(&mut self) -> bool;
}

/// Perfect channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoss;

impl FaultInjector for NoLoss {
    fn should_drop(&mut self) -> bool {
        false
    }
}

/// Drops each attempt with a fixed probability.
#[derive(Debug)]
pub struct BernoulliLoss {
    probability: f64,
    rng: StdRng,
}

impl BernoulliLoss {
    /// A `None` seed draws from OS entropy.
    pub fn new(probability: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { probability, rng }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }
}

impl FaultInjector for BernoulliLoss {
    fn should_drop(&mut self) -> bool {
        self.rng.random::<f64>() < self.probability
    }
}

/// Replays a fixed list of decisions, then lets everything through.
#[derive(Debug, Default, Clone)]
pub struct ScriptedLoss {
    script: VecDeque<bool>,
}

impl ScriptedLoss {
    pub fn new(script: impl IntoIterator<Item = bool>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl FaultInjector for ScriptedLoss {
    fn should_drop(&mut self) -> bool {
        self.script.pop_front().unwrap_or(false)
    }
}

/// Injector described by the config: lossless when the probability is zero.
pub fn from_config(config: &ArqConfig) -> Box<dyn FaultInjector> {
    if config.loss_probability <= 0.0 {
        Box::new(NoLoss)
    } else {
        Box::new(BernoulliLoss::new(config.loss_probability, config.seed))
    }
}
