use arq_lab_abstract::{ArqConfig, SimConfig};
use arq_lab_protocol::{ReceiverStats, SenderStats};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::engine::LinkEventSummary;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// No events left.
    Idle,
    /// Abandoned at `max_duration_ms`.
    TimeLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryRecord {
    pub time: u64,
    pub seq_num: u32,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub arq: ArqConfig,
    pub sim: SimConfig,
    pub completion: Completion,
    pub duration_ms: u64,
    pub total_messages: u32,
    pub sender_complete: bool,
    pub deliveries: Vec<DeliveryRecord>,
    pub sender_datagrams: u64,
    pub sender_stats: SenderStats,
    pub receiver_stats: ReceiverStats,
    pub link_events: Vec<LinkEventSummary>,
    pub metrics: HashMap<String, Vec<(u64, f64)>>,
}

impl SimulationReport {
    /// Every sequence number of the transfer was delivered.
    pub fn all_delivered(&self) -> bool {
        let seen: HashSet<u32> = self.deliveries.iter().map(|d| d.seq_num).collect();
        (0..self.total_messages).all(|seq| seen.contains(&seq))
    }

    /// Deliveries form the prefix `0, 1, 2, ...` with no gaps.
    pub fn delivered_in_order(&self) -> bool {
        self.deliveries
            .iter()
            .enumerate()
            .all(|(i, d)| d.seq_num as usize == i)
    }

    pub fn has_duplicate_delivery(&self) -> bool {
        let mut seen = HashSet::new();
        !self.deliveries.iter().all(|d| seen.insert(d.seq_num))
    }

    pub fn max_window_in_flight(&self) -> f64 {
        self.metrics
            .get("window_in_flight")
            .map(|series| series.iter().map(|(_, v)| *v).fold(0.0, f64::max))
            .unwrap_or(0.0)
    }
}
