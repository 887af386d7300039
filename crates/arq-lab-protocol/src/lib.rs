//! Sans-IO implementation of the priority-scheduled sliding-window transfer.
//!
//! [`Sender`] and [`Receiver`] implement [`arq_lab_abstract::Endpoint`], so the
//! same code runs under the discrete-event simulator and over real UDP.

pub mod fault;
pub mod ready_queue;
pub mod receiver;
pub mod sender;
pub mod window;

pub use fault::{BernoulliLoss, FaultInjector, NoLoss, ScriptedLoss};
pub use ready_queue::ReadyQueue;
pub use receiver::{Delivery, Disposition, Reception, Receiver, ReceiverStats};
pub use sender::{ACK_TIMER, DrainReport, Sender, SenderStats, default_payload};
pub use window::{AckOutcome, WindowState};
