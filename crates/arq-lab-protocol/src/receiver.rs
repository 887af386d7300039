//! Receiver-side reassembly.
//!
//! Every datagram that decodes and passes its checksum is acknowledged with
//! its own sequence number, whether it is in order, early, or a duplicate.
//! Payloads reach the application strictly in sequence order; early arrivals
//! wait in a reorder buffer until the gap before them closes.

use std::collections::BTreeMap;

use arq_lab_abstract::{ArqConfig, Endpoint, LinkContext, Packet, PacketError};
use serde::Serialize;
use tracing::{debug, info, warn};

/// One payload handed to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub seq_num: u32,
    pub payload: String,
}

/// Where an accepted packet went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    InOrder,
    Buffered,
    Duplicate,
}

/// Outcome of an accepted datagram: the ack to send and what became
/// deliverable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reception {
    pub ack: Packet,
    pub disposition: Disposition,
    pub delivered: Vec<Delivery>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    pub accepted: u64,
    pub delivered: u64,
    pub buffered: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub checksum_failures: u64,
}

#[derive(Debug)]
pub struct Receiver {
    expected_seq: u32,
    reorder: BTreeMap<u32, String>,
    window_size: u8,
    stats: ReceiverStats,
}

impl Receiver {
    pub fn new(config: &ArqConfig) -> Self {
        Self {
            expected_seq: 0,
            reorder: BTreeMap::new(),
            window_size: config.advertised_window(),
            stats: ReceiverStats::default(),
        }
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    /// Sequence numbers waiting in the reorder buffer.
    pub fn buffered(&self) -> impl Iterator<Item = u32> + '_ {
        self.reorder.keys().copied()
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Validate one datagram and update reassembly state.
    ///
    /// Errors mean the datagram is dropped without an acknowledgment.
    pub fn receive(&mut self, datagram: &[u8]) -> Result<Reception, PacketError> {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(error) => {
                self.stats.malformed += 1;
                return Err(error);
            }
        };
        if let Err(error) = packet.verify() {
            self.stats.checksum_failures += 1;
            return Err(error);
        }
        self.stats.accepted += 1;

        let seq_num = packet.seq_num();
        let ack = Packet::ack(seq_num, self.window_size);
        let mut delivered = Vec::new();

        let disposition = if seq_num == self.expected_seq {
            delivered.push(Delivery {
                seq_num,
                payload: packet.payload().to_owned(),
            });
            self.expected_seq += 1;
            while let Some(payload) = self.reorder.remove(&self.expected_seq) {
                delivered.push(Delivery {
                    seq_num: self.expected_seq,
                    payload,
                });
                self.expected_seq += 1;
            }
            Disposition::InOrder
        } else if seq_num > self.expected_seq {
            debug!(
                expected = self.expected_seq,
                received = seq_num,
                "out-of-order packet buffered"
            );
            self.reorder.insert(seq_num, packet.payload().to_owned());
            self.stats.buffered += 1;
            Disposition::Buffered
        } else {
            debug!(seq = seq_num, "duplicate packet");
            self.stats.duplicates += 1;
            Disposition::Duplicate
        };

        self.stats.delivered += delivered.len() as u64;
        Ok(Reception {
            ack,
            disposition,
            delivered,
        })
    }
}

impl Endpoint for Receiver {
    fn init(&mut self, _ctx: &mut dyn LinkContext) {
        info!(window = self.window_size, "receiver listening");
    }

    fn on_datagram(&mut self, ctx: &mut dyn LinkContext, datagram: &[u8]) {
        match self.receive(datagram) {
            Ok(reception) => {
                ctx.send_datagram(reception.ack.encode());
                for delivery in &reception.delivered {
                    info!(seq = delivery.seq_num, payload = %delivery.payload, "delivered");
                    ctx.deliver(delivery.seq_num, &delivery.payload);
                }
                ctx.record_metric("reorder_buffer_len", self.reorder.len() as f64);
            }
            Err(error) => {
                warn!(%error, "discarding packet");
            }
        }
    }

    fn on_timer(&mut self, _ctx: &mut dyn LinkContext, _timer_id: u32) {
        // The receiver arms no timers.
    }
}
