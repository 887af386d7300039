pub mod config;
pub mod interface;
pub mod packet;
pub mod scenario;

pub use interface::{Endpoint, LinkContext};
pub use packet::{HEADER_LEN, Header, Malformation, Packet, PacketError, Priority, compute_checksum};

pub use config::{ArqConfig, ConfigError, PriorityRule, SimConfig};
pub use scenario::{ArqConfigOverride, SimConfigOverride, TestAction, TestAssertion, TestScenario};
