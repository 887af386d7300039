//! Packets waiting for a transmission attempt.
//!
//! Ordering is by `(rank, seq)` ascending, where `rank` is 0 for
//! [`Priority::High`] and 1 for [`Priority::Normal`]: every high-priority
//! packet leaves before any normal one, and ties go to the lower sequence
//! number. The same sequence number may be queued more than once (a timeout
//! can re-queue a packet that is still waiting); each copy is one attempt.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use arq_lab_abstract::{Packet, Priority};

#[derive(Debug, Clone)]
pub struct ReadyEntry {
    pub priority: Priority,
    pub packet: Packet,
    /// Push order, so equal keys pop first-in first-out.
    order: u64,
}

impl ReadyEntry {
    pub fn rank(&self) -> u8 {
        match self.priority {
            Priority::High => 0,
            Priority::Normal => 1,
        }
    }

    pub fn seq_num(&self) -> u32 {
        self.packet.seq_num()
    }

    fn key(&self) -> (u8, u32, u64) {
        (self.rank(), self.seq_num(), self.order)
    }
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: the smallest key is the greatest element of the max-heap.
        other.key().cmp(&self.key())
    }
}

#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<ReadyEntry>,
    pushed: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: Packet, priority: Priority) {
        let order = self.pushed;
        self.pushed += 1;
        self.heap.push(ReadyEntry {
            priority,
            packet,
            order,
        });
    }

    /// Put a previously popped entry back with its original priority.
    pub fn requeue(&mut self, entry: ReadyEntry) {
        self.push(entry.packet, entry.priority);
    }

    pub fn pop(&mut self) -> Option<ReadyEntry> {
        self.heap.pop()
    }

    pub fn peek_seq(&self) -> Option<u32> {
        self.heap.peek().map(ReadyEntry::seq_num)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queued sequence numbers in the order they would be popped.
    pub fn pending_order(&self) -> Vec<u32> {
        let mut entries: Vec<&ReadyEntry> = self.heap.iter().collect();
        entries.sort_by_key(|e| e.key());
        entries.into_iter().map(ReadyEntry::seq_num).collect()
    }
}
