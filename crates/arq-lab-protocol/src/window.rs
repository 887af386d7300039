//! Sender-side sliding window.
//!
//! ```text
//!   base             next_seq_num
//!    │                    │
//! ───┼────────────────────┼──────────────▶ seq space
//!    │ <─── unacked ─────▶│
//! ```
//!
//! Invariant: `next_seq_num - base <= capacity`, and `unacked` holds exactly
//! the sequence numbers in `[base, next_seq_num)`.

use std::collections::BTreeMap;

use arq_lab_abstract::Packet;

/// Result of feeding one acknowledgment to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `retired` packets were removed and the window now starts at `base`.
    Advanced { retired: usize, base: u32 },
    /// The ack is below `base` or nothing is outstanding.
    Stale,
}

#[derive(Debug)]
pub struct WindowState {
    base: u32,
    next_seq_num: u32,
    capacity: usize,
    unacked: BTreeMap<u32, Packet>,
}

impl WindowState {
    /// Panics when `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "window capacity must be at least 1");
        Self {
            base: 0,
            next_seq_num: 0,
            capacity,
            unacked: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq_num(&self) -> u32 {
        self.next_seq_num
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        (self.next_seq_num - self.base) as usize
    }

    pub fn has_room(&self) -> bool {
        self.in_flight() < self.capacity
    }

    pub fn has_unacked(&self) -> bool {
        !self.unacked.is_empty()
    }

    pub fn is_unacked(&self, seq_num: u32) -> bool {
        self.unacked.contains_key(&seq_num)
    }

    /// Outstanding packets, oldest first.
    pub fn unacked(&self) -> impl Iterator<Item = &Packet> {
        self.unacked.values()
    }

    /// Record `packet` as the packet for `next_seq_num` and advance it.
    pub fn admit(&mut self, packet: Packet) {
        debug_assert!(self.has_room(), "admit on a full window");
        debug_assert_eq!(packet.seq_num(), self.next_seq_num);
        self.unacked.insert(self.next_seq_num, packet);
        self.next_seq_num += 1;
    }

    /// Treat `ack_seq` as cumulative: everything in `[base, ack_seq]` is done.
    ///
    /// Only admitted packets can be retired, so an ack at or beyond
    /// `next_seq_num` retires the whole window and no more.
    pub fn acknowledge(&mut self, ack_seq: u32) -> AckOutcome {
        if ack_seq < self.base || self.next_seq_num == self.base {
            return AckOutcome::Stale;
        }
        let upper = ack_seq.min(self.next_seq_num - 1);
        let remaining = self.unacked.split_off(&(upper + 1));
        let retired = self.unacked.len();
        self.unacked = remaining;
        self.base = upper + 1;
        AckOutcome::Advanced {
            retired,
            base: self.base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arq_lab_abstract::Priority;

    fn filled(capacity: usize, count: u32) -> WindowState {
        let mut window = WindowState::new(capacity);
        for seq in 0..count {
            window.admit(Packet::data(seq, Priority::Normal, capacity as u8, "x"));
        }
        window
    }

    #[test]
    fn admission_respects_capacity() {
        let window = filled(3, 3);
        assert_eq!(window.in_flight(), 3);
        assert!(!window.has_room());
        assert_eq!(window.next_seq_num(), 3);
    }

    #[test]
    fn single_ack_retires_everything_up_to_it() {
        let mut window = filled(5, 3);
        assert_eq!(
            window.acknowledge(2),
            AckOutcome::Advanced { retired: 3, base: 3 }
        );
        assert_eq!(window.base(), 3);
        assert!(!window.has_unacked());
        for seq in 0..3 {
            assert!(!window.is_unacked(seq));
        }
    }

    #[test]
    fn partial_ack_keeps_the_rest() {
        let mut window = filled(5, 4);
        window.acknowledge(1);
        let left: Vec<u32> = window.unacked().map(Packet::seq_num).collect();
        assert_eq!(left, vec![2, 3]);
        assert!(window.has_room());
    }

    #[test]
    fn ack_below_base_is_stale() {
        let mut window = filled(5, 3);
        window.acknowledge(1);
        assert_eq!(window.acknowledge(0), AckOutcome::Stale);
        assert_eq!(window.base(), 2);
    }

    #[test]
    fn ack_beyond_next_seq_is_clamped() {
        let mut window = filled(5, 2);
        assert_eq!(
            window.acknowledge(40),
            AckOutcome::Advanced { retired: 2, base: 2 }
        );
        assert_eq!(window.base(), window.next_seq_num());
        assert_eq!(window.acknowledge(41), AckOutcome::Stale);
    }
}
