pub mod engine;
pub mod scenario_runner;
pub mod trace;

pub use engine::{LinkEventSummary, NodeId, Simulator, Transfer};
pub use trace::{Completion, DeliveryRecord, SimulationReport};
