use crate::trace::{Completion, DeliveryRecord, SimulationReport};
use arq_lab_abstract::packet::peek_seq_num;
use arq_lab_abstract::{ArqConfig, SimConfig};
use arq_lab_abstract::{Endpoint, LinkContext};
use arq_lab_protocol::{FaultInjector, Receiver, Sender};
use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeId {
    Sender,
    Receiver,
}

impl NodeId {
    pub fn peer(&self) -> Self {
        match self {
            NodeId::Sender => NodeId::Receiver,
            NodeId::Receiver => NodeId::Sender,
        }
    }
}

#[derive(Debug)]
pub enum EventType {
    DatagramArrival {
        to: NodeId,
        datagram: Bytes,
    },
    TimerExpiry {
        node: NodeId,
        timer_id: u32,
        generation: u64,
    },
}

#[derive(Debug)]
struct Event {
    time: u64,
    event_type: EventType,
    /// Insertion order; breaks ties between events due at the same time.
    order: u64,
}

impl Event {
    fn key(&self) -> (u64, u64) {
        (self.time, self.order)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reversed so the max-heap pops the earliest event first.
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// A compact textual summary of important link-layer events.
#[derive(Debug, Clone, Serialize)]
pub struct LinkEventSummary {
    pub time: u64,
    pub description: String,
}

#[derive(Debug)]
enum TimerCommand {
    Start { delay_ms: u64, timer_id: u32 },
    Cancel { timer_id: u32 },
}

/// Actions buffered during one endpoint callback.
#[derive(Default)]
struct PendingActions {
    outgoing: Vec<Bytes>,
    timers: Vec<TimerCommand>,
    deliveries: Vec<(u32, String)>,
    metrics: Vec<(String, f64)>,
}

/// Context implementation passed to an endpoint.
struct CallbackContext<'a> {
    pending: &'a mut PendingActions,
    now: u64,
}

impl<'a> LinkContext for CallbackContext<'a> {
    fn send_datagram(&mut self, datagram: Bytes) {
        self.pending.outgoing.push(datagram);
    }

    fn start_timer(&mut self, delay_ms: u64, timer_id: u32) {
        self.pending
            .timers
            .push(TimerCommand::Start { delay_ms, timer_id });
    }

    fn cancel_timer(&mut self, timer_id: u32) {
        self.pending.timers.push(TimerCommand::Cancel { timer_id });
    }

    fn deliver(&mut self, seq_num: u32, payload: &str) {
        self.pending.deliveries.push((seq_num, payload.to_owned()));
    }

    fn now(&self) -> u64 {
        self.now
    }

    fn record_metric(&mut self, name: &str, value: f64) {
        self.pending.metrics.push((name.to_string(), value));
    }
}

/// Discrete-event channel between two endpoints.
///
/// Datagrams travel as encoded bytes. Traffic from the sender may be
/// corrupted, duplicated or dropped by script; acknowledgments only see
/// latency.
pub struct Simulator<S, R> {
    time: u64,
    event_queue: BinaryHeap<Event>,
    next_order: u64,

    config: SimConfig,
    rng: StdRng,

    pub sender: S,
    pub receiver: R,

    pub deliveries: Vec<DeliveryRecord>,
    pub sender_datagrams: u64,

    /// `(time_ms, value)` samples per metric name.
    pub metrics: HashMap<String, Vec<(u64, f64)>>,

    // Deterministic faults: first sender datagram with the given seq
    drop_sender_seq_once: Vec<u32>,
    corrupt_sender_seq_once: Vec<u32>,

    pub link_events: Vec<LinkEventSummary>,

    /// Key: (node, timer_id), Value: generation of the live deadline
    timer_generations: HashMap<(NodeId, u32), u64>,
}

impl<S: Endpoint, R: Endpoint> Simulator<S, R> {
    pub fn new(config: SimConfig, sender: S, receiver: R) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);

        Self {
            time: 0,
            event_queue: BinaryHeap::new(),
            next_order: 0,
            config,
            rng,
            sender,
            receiver,
            deliveries: Vec::new(),
            sender_datagrams: 0,
            metrics: HashMap::new(),
            drop_sender_seq_once: Vec::new(),
            corrupt_sender_seq_once: Vec::new(),
            link_events: Vec::new(),
            timer_generations: HashMap::new(),
        }
    }

    /// Drop the first datagram the sender puts on the channel with this seq.
    pub fn add_drop_sender_seq_once(&mut self, seq: u32) {
        self.drop_sender_seq_once.push(seq);
    }

    /// Corrupt the first datagram the sender puts on the channel with this seq.
    pub fn add_corrupt_sender_seq_once(&mut self, seq: u32) {
        self.corrupt_sender_seq_once.push(seq);
    }

    /// Samples recorded under `name`, oldest first.
    pub fn metric_series(&self, name: &str) -> Option<&[(u64, f64)]> {
        self.metrics.get(name).map(|v| v.as_slice())
    }

    fn push_event(&mut self, time: u64, event_type: EventType) {
        self.event_queue.push(Event {
            time,
            event_type,
            order: self.next_order,
        });
        self.next_order += 1;
    }

    pub fn init(&mut self) {
        // Receiver first, so it is listening before the first datagram.
        {
            let mut buffer = PendingActions::default();
            let mut ctx = CallbackContext {
                pending: &mut buffer,
                now: self.time,
            };
            self.receiver.init(&mut ctx);
            self.process_actions(NodeId::Receiver, buffer);
        }
        {
            let mut buffer = PendingActions::default();
            let mut ctx = CallbackContext {
                pending: &mut buffer,
                now: self.time,
            };
            self.sender.init(&mut ctx);
            self.process_actions(NodeId::Sender, buffer);
        }
    }

    /// Handle the earliest pending event. `false` once the queue is empty.
    pub fn step(&mut self) -> bool {
        let event = match self.event_queue.pop() {
            Some(e) => e,
            None => return false,
        };

        self.time = event.time;

        match event.event_type {
            EventType::DatagramArrival { to, datagram } => {
                debug!(time = self.time, ?to, len = datagram.len(), "datagram arrival");
                let mut buffer = PendingActions::default();
                {
                    let mut ctx = CallbackContext {
                        pending: &mut buffer,
                        now: self.time,
                    };
                    match to {
                        NodeId::Sender => self.sender.on_datagram(&mut ctx, &datagram),
                        NodeId::Receiver => self.receiver.on_datagram(&mut ctx, &datagram),
                    }
                }
                self.process_actions(to, buffer);
            }
            EventType::TimerExpiry {
                node,
                timer_id,
                generation,
            } => {
                // A re-armed or cancelled timer bumps the generation, which
                // invalidates the event already queued.
                let current = self.timer_generations.get(&(node, timer_id)).copied();
                if current != Some(generation) {
                    debug!("Skipping stale timer event for timer_id={}", timer_id);
                    return true;
                }

                let mut buffer = PendingActions::default();
                {
                    let mut ctx = CallbackContext {
                        pending: &mut buffer,
                        now: self.time,
                    };
                    match node {
                        NodeId::Sender => self.sender.on_timer(&mut ctx, timer_id),
                        NodeId::Receiver => self.receiver.on_timer(&mut ctx, timer_id),
                    }
                }
                self.process_actions(node, buffer);
            }
        }
        true
    }

    /// Run until nothing is left to happen or the time limit passes.
    pub fn run_until_complete(&mut self) -> Completion {
        self.init();
        self.resume()
    }

    /// Continue a run that was already initialised.
    pub fn resume(&mut self) -> Completion {
        while self.step() {
            if self.time > self.config.max_duration_ms {
                info!(time = self.time, "simulation time limit reached");
                return Completion::TimeLimit;
            }
        }
        Completion::Idle
    }

    fn process_actions(&mut self, source_node: NodeId, buffer: PendingActions) {
        let now = self.time;
        for (name, value) in buffer.metrics {
            self.metrics.entry(name).or_default().push((now, value));
        }

        for (seq_num, payload) in buffer.deliveries {
            self.link_events.push(LinkEventSummary {
                time: self.time,
                description: format!("[{:?}] DELIVERED seq={}", source_node, seq_num),
            });
            self.deliveries.push(DeliveryRecord {
                time: self.time,
                seq_num,
                payload,
            });
        }

        for command in buffer.timers {
            match command {
                TimerCommand::Start { delay_ms, timer_id } => {
                    let generation = self.bump_generation(source_node, timer_id);
                    self.push_event(
                        self.time + delay_ms,
                        EventType::TimerExpiry {
                            node: source_node,
                            timer_id,
                            generation,
                        },
                    );
                }
                TimerCommand::Cancel { timer_id } => {
                    self.bump_generation(source_node, timer_id);
                }
            }
        }

        for datagram in buffer.outgoing {
            self.transmit(source_node, datagram);
        }
    }

    fn bump_generation(&mut self, node: NodeId, timer_id: u32) -> u64 {
        let generation = self.timer_generations.entry((node, timer_id)).or_insert(0);
        *generation += 1;
        *generation
    }

    fn transmit(&mut self, source_node: NodeId, mut datagram: Bytes) {
        let target_node = source_node.peer();
        let seq = peek_seq_num(&datagram).unwrap_or(u32::MAX);
        let mut copies = 1;

        if source_node == NodeId::Sender {
            self.sender_datagrams += 1;

            if let Some(pos) = self.drop_sender_seq_once.iter().position(|s| *s == seq) {
                self.drop_sender_seq_once.remove(pos);
                self.link_event(format!("[Sender->Receiver] DROP (scripted) seq={seq}"));
                debug!(seq, "scripted drop");
                return;
            }

            let scripted_corrupt = self.corrupt_sender_seq_once.iter().position(|s| *s == seq);
            if let Some(pos) = scripted_corrupt
                && let Some(last) = datagram.len().checked_sub(1)
            {
                self.corrupt_sender_seq_once.remove(pos);
                datagram = flip_bit(&datagram, last, 0);
                self.link_event(format!(
                    "[Sender->Receiver] CORRUPT (scripted) seq={}",
                    seq
                ));
            } else if !datagram.is_empty() && self.rng.random::<f64>() < self.config.corrupt_rate {
                let index = self.rng.random_range(0..datagram.len());
                let bit = self.rng.random_range(0..8);
                datagram = flip_bit(&datagram, index, bit);
                self.link_event(format!("[Sender->Receiver] CORRUPT seq={}", seq));
                debug!("Datagram corrupted in channel");
            }

            if self.rng.random::<f64>() < self.config.duplicate_rate {
                copies = 2;
                self.link_event(format!("[Sender->Receiver] DUPLICATE seq={}", seq));
            }
        }

        for _ in 0..copies {
            let latency = self
                .rng
                .random_range(self.config.min_latency..=self.config.max_latency);
            self.link_event(format!(
                "[{:?}->{:?}] SEND seq={} (latency={}ms)",
                source_node, target_node, seq, latency
            ));
            self.push_event(
                self.time + latency,
                EventType::DatagramArrival {
                    to: target_node,
                    datagram: datagram.clone(),
                },
            );
        }
    }

    fn link_event(&mut self, description: String) {
        self.link_events.push(LinkEventSummary {
            time: self.time,
            description,
        });
    }
}

fn flip_bit(datagram: &[u8], index: usize, bit: u32) -> Bytes {
    let mut bytes = BytesMut::from(datagram);
    bytes[index] ^= 1 << bit;
    bytes.freeze()
}

/// A full transfer: protocol sender and receiver over the simulated channel.
pub type Transfer = Simulator<Sender, Receiver>;

impl Simulator<Sender, Receiver> {
    pub fn transfer(arq: ArqConfig, sim: SimConfig, injector: Box<dyn FaultInjector>) -> Self {
        let receiver = Receiver::new(&arq);
        let sender = Sender::new(arq, injector);
        Simulator::new(sim, sender, receiver)
    }

    /// Snapshot of the run so far.
    pub fn export_report(&self, completion: Completion) -> SimulationReport {
        SimulationReport {
            arq: self.sender.config().clone(),
            sim: self.config.clone(),
            completion,
            duration_ms: self.time,
            total_messages: self.sender.total_messages(),
            sender_complete: self.sender.is_complete(),
            deliveries: self.deliveries.clone(),
            sender_datagrams: self.sender_datagrams,
            sender_stats: self.sender.stats().clone(),
            receiver_stats: self.receiver.stats().clone(),
            link_events: self.link_events.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arq_lab_abstract::Priority;
    use arq_lab_protocol::{NoLoss, ScriptedLoss};

    fn arq(capacity: usize, total: u32) -> ArqConfig {
        ArqConfig {
            window_capacity: capacity,
            total_messages: total,
            loss_probability: 0.0,
            ack_timeout_ms: 2000,
            ..Default::default()
        }
    }

    fn fixed_latency(ms: u64) -> SimConfig {
        SimConfig {
            min_latency: ms,
            max_latency: ms,
            ..Default::default()
        }
    }

    fn delivered_seqs(sim: &Transfer) -> Vec<u32> {
        sim.deliveries.iter().map(|d| d.seq_num).collect()
    }

    #[test]
    fn lossless_transfer_delivers_everything_in_order() {
        let mut sim = Transfer::transfer(arq(5, 20), fixed_latency(10), Box::new(NoLoss));
        assert_eq!(sim.run_until_complete(), Completion::Idle);
        assert!(sim.sender.is_complete());
        assert_eq!(delivered_seqs(&sim), (0..20).collect::<Vec<_>>());
        assert_eq!(sim.deliveries[7].payload, "Message 7");
        assert_eq!(sim.sender.stats().timeouts, 0);
    }

    fn first_send_order(injector: Box<dyn FaultInjector>) -> Vec<u32> {
        let mut sim = Transfer::transfer(arq(5, 5), fixed_latency(10), injector);
        sim.init();
        sim.link_events
            .iter()
            .filter(|e| e.description.starts_with("[Sender->Receiver] SEND"))
            .filter_map(|e| e.description.split("seq=").nth(1)?.split(' ').next()?.parse().ok())
            .collect()
    }

    #[test]
    fn first_datagrams_leave_in_priority_order() {
        assert_eq!(first_send_order(Box::new(NoLoss)), vec![0, 3, 1, 2, 4]);
    }

    #[test]
    fn injected_loss_of_high_priority_head_keeps_priority_order() {
        let injector = ScriptedLoss::new([true, false, true]);
        assert_eq!(first_send_order(Box::new(injector)), vec![0, 3, 1, 2, 4]);
    }

    #[test]
    fn injected_losses_are_retried_immediately() {
        let injector = ScriptedLoss::new([true, true, false, true]);
        let mut sim = Transfer::transfer(arq(4, 8), fixed_latency(5), Box::new(injector));
        sim.run_until_complete();
        assert_eq!(delivered_seqs(&sim), (0..8).collect::<Vec<_>>());
        assert_eq!(sim.sender.stats().simulated_losses, 3);
        assert_eq!(sim.sender.stats().timeouts, 0);
    }

    #[test]
    fn channel_drop_of_last_packet_recovers_by_timeout() {
        let mut sim = Transfer::transfer(arq(3, 3), fixed_latency(10), Box::new(NoLoss));
        // seq 2 is the last normal-priority packet, so no later ack covers it.
        sim.add_drop_sender_seq_once(2);
        sim.run_until_complete();
        assert_eq!(delivered_seqs(&sim), vec![0, 1, 2]);
        assert_eq!(sim.sender.stats().timeouts, 1);
        assert!(sim.deliveries[2].time >= 2000);
    }

    #[test]
    fn duplicated_datagrams_are_delivered_once() {
        let sim_config = SimConfig {
            duplicate_rate: 1.0,
            ..fixed_latency(10)
        };
        let mut sim = Transfer::transfer(arq(5, 15), sim_config, Box::new(NoLoss));
        sim.run_until_complete();
        assert_eq!(delivered_seqs(&sim), (0..15).collect::<Vec<_>>());
        assert!(sim.receiver.stats().duplicates > 0);
    }

    #[test]
    fn reordering_latency_still_delivers_in_order() {
        let sim_config = SimConfig {
            min_latency: 1,
            max_latency: 400,
            seed: 99,
            ..Default::default()
        };
        let mut sim = Transfer::transfer(arq(6, 40), sim_config, Box::new(NoLoss));
        sim.run_until_complete();
        assert_eq!(delivered_seqs(&sim), (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn early_ack_can_retire_a_packet_the_channel_later_corrupts() {
        // seq 3 overtakes seq 1 and 2 (priority). Its ack retires 1 and 2,
        // so a corrupted seq 1 is never retransmitted.
        let mut sim = Transfer::transfer(arq(5, 5), fixed_latency(10), Box::new(NoLoss));
        sim.add_corrupt_sender_seq_once(1);
        assert_eq!(sim.run_until_complete(), Completion::Idle);
        assert!(sim.sender.is_complete());
        assert_eq!(delivered_seqs(&sim), vec![0]);
        assert_eq!(sim.receiver.expected_seq(), 1);
        assert_eq!(sim.receiver.stats().checksum_failures, 1);
    }

    #[test]
    fn corrupted_only_packet_recovers_by_timeout() {
        let mut sim = Transfer::transfer(arq(1, 3), fixed_latency(10), Box::new(NoLoss));
        sim.add_corrupt_sender_seq_once(1);
        sim.run_until_complete();
        assert_eq!(delivered_seqs(&sim), vec![0, 1, 2]);
        assert_eq!(sim.sender.stats().timeouts, 1);
    }

    #[test]
    fn window_metric_never_exceeds_capacity() {
        let mut sim = Transfer::transfer(arq(4, 30), fixed_latency(10), Box::new(NoLoss));
        sim.run_until_complete();
        let samples = sim.metric_series("window_in_flight").unwrap();
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|(_, v)| *v <= 4.0));
    }

    #[test]
    fn custom_priority_rule_is_used_on_the_wire() {
        fn all_high(_: u32) -> Priority {
            Priority::High
        }
        let config = ArqConfig {
            priority_rule: arq_lab_abstract::PriorityRule::Custom(all_high),
            ..arq(3, 6)
        };
        let mut sim = Transfer::transfer(config, fixed_latency(10), Box::new(NoLoss));
        sim.run_until_complete();
        assert_eq!(delivered_seqs(&sim), (0..6).collect::<Vec<_>>());
    }
}
