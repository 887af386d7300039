//! Priority transmission scheduler.
//!
//! The sender admits messages into a bounded window, transmits ready packets
//! high-priority first through its [`FaultInjector`], and reacts to
//! acknowledgments and to the ack timeout. Acknowledgments are cumulative: an
//! ack for `n` retires every outstanding packet up to and including `n`.
//!
//! [`Sender`] is driven through [`Endpoint`]: every inbound datagram and every
//! timer expiry ends with an admit/drain cycle and a freshly armed
//! [`ACK_TIMER`], which reproduces a blocking receive with a timeout.

use arq_lab_abstract::{ArqConfig, ConfigError, Endpoint, LinkContext, Packet};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::fault::FaultInjector;
use crate::ready_queue::ReadyQueue;
use crate::window::{AckOutcome, WindowState};

/// Timer id of the ack timeout.
pub const ACK_TIMER: u32 = 0;

/// Payload used when the transfer is described only by a message count.
pub fn default_payload(seq_num: u32) -> String {
    format!("Message {seq_num}")
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    pub transmissions: u64,
    pub simulated_losses: u64,
    pub acks_received: u64,
    pub stale_acks: u64,
    pub corrupt_acks: u64,
    pub timeouts: u64,
    pub requeued_by_timeout: u64,
}

/// What one call to [`Sender::drain`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Sequence numbers put on the channel, in order.
    pub sent: Vec<u32>,
    pub simulated_losses: u32,
    /// Queued copies skipped because they were acknowledged meanwhile.
    pub stale_skipped: u32,
    /// Injector consultations, lost or not.
    pub attempts: u32,
    /// Entries still queued when the loss limit was reached.
    pub leftover: usize,
}

pub struct Sender {
    config: ArqConfig,
    window: WindowState,
    ready: ReadyQueue,
    messages: Option<Vec<String>>,
    total_messages: u32,
    injector: Box<dyn FaultInjector>,
    stats: SenderStats,
}

impl Sender {
    /// Transfer `config.total_messages` generated messages.
    ///
    /// `config` must already pass [`ArqConfig::validate`]; a zero window
    /// capacity panics. Use [`Sender::try_new`] for unchecked input.
    pub fn new(config: ArqConfig, injector: Box<dyn FaultInjector>) -> Self {
        let total_messages = config.total_messages;
        Self::build(config, None, total_messages, injector)
    }

    /// Validate `config`, then build as [`Sender::new`] does.
    pub fn try_new(
        config: ArqConfig,
        injector: Box<dyn FaultInjector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config, injector))
    }

    /// Transfer exactly `messages`, in order. Same precondition as
    /// [`Sender::new`].
    pub fn with_messages(
        config: ArqConfig,
        messages: Vec<String>,
        injector: Box<dyn FaultInjector>,
    ) -> Self {
        let total_messages = u32::try_from(messages.len()).unwrap_or(u32::MAX);
        Self::build(config, Some(messages), total_messages, injector)
    }

    fn build(
        config: ArqConfig,
        messages: Option<Vec<String>>,
        total_messages: u32,
        injector: Box<dyn FaultInjector>,
    ) -> Self {
        Self {
            window: WindowState::new(config.window_capacity),
            ready: ReadyQueue::new(),
            config,
            messages,
            total_messages,
            injector,
            stats: SenderStats::default(),
        }
    }

    pub fn config(&self) -> &ArqConfig {
        &self.config
    }

    pub fn window(&self) -> &WindowState {
        &self.window
    }

    pub fn ready_queue(&self) -> &ReadyQueue {
        &self.ready
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    pub fn total_messages(&self) -> u32 {
        self.total_messages
    }

    /// Every message has been cumulatively acknowledged.
    pub fn is_complete(&self) -> bool {
        self.window.base() >= self.total_messages
    }

    fn payload_for(&self, seq_num: u32) -> String {
        match &self.messages {
            Some(messages) => messages[seq_num as usize].clone(),
            None => default_payload(seq_num),
        }
    }

    /// Fill the window with new messages. Returns how many were admitted.
    pub fn admit(&mut self) -> usize {
        let mut admitted = 0;
        while self.window.has_room() && self.window.next_seq_num() < self.total_messages {
            let seq_num = self.window.next_seq_num();
            let priority = self.config.priority_rule.priority_of(seq_num);
            let packet = Packet::data(
                seq_num,
                priority,
                self.config.advertised_window(),
                self.payload_for(seq_num),
            );
            self.window.admit(packet.clone());
            self.ready.push(packet, priority);
            admitted += 1;
        }
        if admitted > 0 {
            debug!(
                admitted,
                base = self.window.base(),
                next = self.window.next_seq_num(),
                "admitted into window"
            );
        }
        admitted
    }

    /// Attempt every ready packet, highest priority first.
    ///
    /// A packet the injector drops goes straight back on the queue, so it is
    /// the head again and is retried before anything of lower rank. After
    /// `max_consecutive_losses` drops in a row the drain stops and the rest
    /// stays queued for the next one.
    pub fn drain(&mut self, mut transmit: impl FnMut(&Packet)) -> DrainReport {
        let mut report = DrainReport::default();
        let mut loss_streak = 0;
        while let Some(seq_num) = self.ready.peek_seq() {
            if seq_num >= self.window.next_seq_num()
                || loss_streak >= self.config.max_consecutive_losses
            {
                break;
            }
            let Some(entry) = self.ready.pop() else {
                break;
            };
            if !self.window.is_unacked(seq_num) {
                report.stale_skipped += 1;
                continue;
            }
            report.attempts += 1;
            if self.injector.should_drop() {
                debug!(seq = seq_num, "simulated loss, re-queueing");
                self.stats.simulated_losses += 1;
                report.simulated_losses += 1;
                loss_streak += 1;
                self.ready.requeue(entry);
                continue;
            }
            loss_streak = 0;
            debug!(
                seq = seq_num,
                priority = ?entry.priority,
                payload = entry.packet.payload(),
                "sent"
            );
            transmit(&entry.packet);
            self.stats.transmissions += 1;
            report.sent.push(seq_num);
        }
        report.leftover = self.ready.len();
        report
    }

    /// Apply a cumulative acknowledgment for `ack_seq`.
    pub fn on_ack(&mut self, ack_seq: u32) -> AckOutcome {
        self.stats.acks_received += 1;
        let outcome = self.window.acknowledge(ack_seq);
        match outcome {
            AckOutcome::Advanced { retired, base } => {
                debug!(ack = ack_seq, retired, base, "received ACK");
            }
            AckOutcome::Stale => {
                self.stats.stale_acks += 1;
                debug!(ack = ack_seq, base = self.window.base(), "stale ACK");
            }
        }
        outcome
    }

    /// Re-queue every unacknowledged packet. Returns how many were queued.
    pub fn on_timeout(&mut self) -> usize {
        self.stats.timeouts += 1;
        let rule = self.config.priority_rule;
        let mut requeued = 0;
        for packet in self.window.unacked() {
            self.ready.push(packet.clone(), rule.priority_of(packet.seq_num()));
            requeued += 1;
        }
        self.stats.requeued_by_timeout += requeued as u64;
        warn!(
            requeued,
            base = self.window.base(),
            "ack timeout, re-queueing unacknowledged packets"
        );
        requeued
    }

    /// Admit, drain, and re-arm the ack timer unless the transfer is over.
    fn pump(&mut self, ctx: &mut dyn LinkContext) {
        self.admit();
        let report = self.drain(|packet| ctx.send_datagram(packet.encode()));
        ctx.record_metric("window_in_flight", self.window.in_flight() as f64);
        ctx.record_metric("ready_queue_len", report.leftover as f64);
        if self.is_complete() {
            ctx.cancel_timer(ACK_TIMER);
        } else {
            ctx.start_timer(self.config.ack_timeout_ms, ACK_TIMER);
        }
    }
}

impl Endpoint for Sender {
    fn init(&mut self, ctx: &mut dyn LinkContext) {
        info!(
            total = self.total_messages,
            window = self.config.window_capacity,
            "sender starting"
        );
        self.pump(ctx);
    }

    fn on_datagram(&mut self, ctx: &mut dyn LinkContext, datagram: &[u8]) {
        if self.is_complete() {
            return;
        }
        match Packet::decode(datagram).and_then(|ack| ack.verify().map(|()| ack)) {
            Ok(ack) => {
                self.on_ack(ack.seq_num());
            }
            Err(error) => {
                self.stats.corrupt_acks += 1;
                warn!(%error, "discarding unreadable ACK");
            }
        }
        if self.is_complete() {
            ctx.cancel_timer(ACK_TIMER);
            info!(
                total = self.total_messages,
                transmissions = self.stats.transmissions,
                "transfer complete"
            );
            return;
        }
        self.pump(ctx);
    }

    fn on_timer(&mut self, ctx: &mut dyn LinkContext, timer_id: u32) {
        if timer_id != ACK_TIMER || self.is_complete() {
            return;
        }
        if self.window.has_unacked() {
            self.on_timeout();
        }
        self.pump(ctx);
    }

    fn is_finished(&self) -> bool {
        self.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{NoLoss, ScriptedLoss};
    use arq_lab_abstract::Priority;
    use bytes::Bytes;

    /// Records what the sender asks of the link.
    #[derive(Default)]
    struct Recorder {
        sent: Vec<Bytes>,
    }

    impl LinkContext for Recorder {
        fn send_datagram(&mut self, datagram: Bytes) {
            self.sent.push(datagram);
        }

        fn start_timer(&mut self, _delay_ms: u64, _timer_id: u32) {}

        fn cancel_timer(&mut self, _timer_id: u32) {}

        fn deliver(&mut self, _seq_num: u32, _payload: &str) {}

        fn now(&self) -> u64 {
            0
        }
    }

    fn config(capacity: usize, total: u32) -> ArqConfig {
        ArqConfig {
            window_capacity: capacity,
            total_messages: total,
            loss_probability: 0.0,
            ..Default::default()
        }
    }

    fn lossless(capacity: usize, total: u32) -> Sender {
        Sender::new(config(capacity, total), Box::new(NoLoss))
    }

    #[test]
    fn first_batch_sends_high_priority_first() {
        let mut sender = lossless(5, 10);
        assert_eq!(sender.admit(), 5);

        let priorities: Vec<Priority> = sender.window().unacked().map(Packet::priority).collect();
        assert_eq!(
            priorities,
            vec![
                Priority::High,
                Priority::Normal,
                Priority::Normal,
                Priority::High,
                Priority::Normal
            ]
        );

        let report = sender.drain(|_| {});
        assert_eq!(report.sent, vec![0, 3, 1, 2, 4]);
        assert_eq!(report.attempts, 5);
    }

    #[test]
    fn unreadable_acks_are_counted_and_ignored() {
        let mut sender = lossless(5, 10);
        let mut link = Recorder::default();
        sender.init(&mut link);
        assert_eq!(link.sent.len(), 5);

        let mut corrupt = Packet::ack(2, 5).encode().to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x01;
        sender.on_datagram(&mut link, &corrupt);

        let valid = Packet::ack(2, 5).encode();
        sender.on_datagram(&mut link, &valid[..8]);

        assert_eq!(sender.window().base(), 0);
        assert_eq!(sender.stats().corrupt_acks, 2);
        assert_eq!(sender.stats().acks_received, 0);

        sender.on_datagram(&mut link, &valid);
        assert_eq!(sender.window().base(), 3);
        assert_eq!(sender.stats().acks_received, 1);
    }

    #[test]
    fn try_new_rejects_invalid_config() {
        let bad = config(0, 10);
        assert!(matches!(
            Sender::try_new(bad, Box::new(NoLoss)),
            Err(ConfigError::WindowCapacity(0))
        ));
        assert!(Sender::try_new(config(5, 10), Box::new(NoLoss)).is_ok());
    }

    #[test]
    fn admission_stops_at_total_messages() {
        let mut sender = lossless(5, 3);
        assert_eq!(sender.admit(), 3);
        assert_eq!(sender.window().next_seq_num(), 3);
        assert_eq!(sender.admit(), 0);
    }

    #[test]
    fn one_ack_retires_earlier_packets() {
        let mut sender = lossless(5, 3);
        sender.admit();
        sender.drain(|_| {});
        assert_eq!(
            sender.on_ack(2),
            AckOutcome::Advanced { retired: 3, base: 3 }
        );
        assert_eq!(sender.window().base(), 3);
        assert!(!sender.window().has_unacked());
        assert!(sender.is_complete());
    }

    #[test]
    fn timeout_requeues_whole_window_once() {
        let mut sender = lossless(4, 10);
        sender.admit();
        sender.drain(|_| {});
        sender.on_ack(0);
        assert!(sender.ready_queue().is_empty());

        assert_eq!(sender.on_timeout(), 3);
        assert_eq!(sender.ready_queue().pending_order(), vec![3, 1, 2]);
        assert_eq!(sender.stats().timeouts, 1);
    }

    #[test]
    fn simulated_loss_is_retried_immediately() {
        let mut sender = Sender::new(config(3, 3), Box::new(ScriptedLoss::new([true, false, true])));
        sender.admit();
        let report = sender.drain(|_| {});
        // seq 0 lost then resent, seq 1 lost then resent, seq 2 first time.
        assert_eq!(report.sent, vec![0, 1, 2]);
        assert_eq!(report.simulated_losses, 2);
        assert_eq!(report.attempts, 5);
        assert_eq!(report.leftover, 0);
        assert_eq!(sender.stats().transmissions, 3);
    }

    #[test]
    fn lost_high_priority_packet_keeps_its_place() {
        let mut sender = Sender::new(config(5, 5), Box::new(ScriptedLoss::new([true])));
        sender.admit();
        let report = sender.drain(|_| {});
        assert_eq!(report.sent, vec![0, 3, 1, 2, 4]);
        assert_eq!(report.simulated_losses, 1);
    }

    #[test]
    fn loss_limit_leaves_packets_queued() {
        let cfg = ArqConfig {
            max_consecutive_losses: 2,
            ..config(2, 2)
        };
        let mut sender = Sender::new(cfg, Box::new(ScriptedLoss::new([true; 8])));
        sender.admit();
        let report = sender.drain(|_| {});
        assert!(report.sent.is_empty());
        assert_eq!(report.attempts, 2);
        assert_eq!(report.leftover, 2);
        assert_eq!(sender.ready_queue().pending_order(), vec![0, 1]);
    }

    #[test]
    fn a_send_resets_the_loss_streak() {
        let cfg = ArqConfig {
            max_consecutive_losses: 2,
            ..config(3, 3)
        };
        let pattern = [true, false, true, false, true, false];
        let mut sender = Sender::new(cfg, Box::new(ScriptedLoss::new(pattern)));
        sender.admit();
        let report = sender.drain(|_| {});
        assert_eq!(report.sent, vec![0, 1, 2]);
        assert_eq!(report.leftover, 0);
    }

    #[test]
    fn acknowledged_copies_are_not_resent() {
        let mut sender = lossless(3, 6);
        sender.admit();
        sender.on_timeout();
        sender.on_ack(1);
        let report = sender.drain(|_| {});
        assert_eq!(report.sent, vec![2, 2]);
        assert_eq!(report.stale_skipped, 4);
    }

    #[test]
    fn window_bound_holds_across_acks() {
        let mut sender = lossless(3, 20);
        for ack in [0, 2, 3, 7, 9, 12] {
            sender.admit();
            sender.drain(|_| {});
            assert!(sender.window().in_flight() <= 3);
            sender.on_ack(ack);
        }
    }

    #[test]
    fn explicit_messages_are_sent_verbatim() {
        let messages = vec!["alpha".to_string(), "beta".to_string()];
        let mut sender = Sender::with_messages(config(5, 0), messages, Box::new(NoLoss));
        assert_eq!(sender.total_messages(), 2);
        sender.admit();
        let mut payloads = Vec::new();
        sender.drain(|p| payloads.push(p.payload().to_string()));
        assert_eq!(payloads, vec!["alpha", "beta"]);
    }
}
