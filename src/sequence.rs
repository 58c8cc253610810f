//! RTP sequence numbering.
//!
//! One stream owns one counter; media and FEC packets draw from the same
//! series, so sequence numbers are assigned strictly in call order with no
//! gaps between media and FEC sends.

use std::sync::{Arc, Mutex};

/// Cloneable handle onto a shared, wrapping u16 sequence counter.
#[derive(Debug, Clone)]
pub struct Sequencer {
    next: Arc<Mutex<u16>>,
}

impl Sequencer {
    /// Starts the series at `start`; the first call to
    /// [`Sequencer::next_sequence_number`] returns `start`.
    pub fn new(start: u16) -> Self {
        Self {
            next: Arc::new(Mutex::new(start)),
        }
    }

    /// Starts the series at a random value, as a fresh stream should.
    pub fn new_random() -> Self {
        Self::new(rand::random::<u16>())
    }

    pub fn next_sequence_number(&self) -> u16 {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        let seq = *next;
        *next = next.wrapping_add(1);
        seq
    }

    /// The next number the sequencer will hand out.
    pub fn peek(&self) -> u16 {
        *self.next.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new_random()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_assignment() {
        let sequencer = Sequencer::new(1000);
        assert_eq!(sequencer.next_sequence_number(), 1000);
        assert_eq!(sequencer.next_sequence_number(), 1001);
        assert_eq!(sequencer.next_sequence_number(), 1002);
    }

    #[test]
    fn test_wraps_at_u16_max() {
        let sequencer = Sequencer::new(u16::MAX);
        assert_eq!(sequencer.next_sequence_number(), u16::MAX);
        assert_eq!(sequencer.next_sequence_number(), 0);
    }

    #[test]
    fn test_clones_share_the_series() {
        let sequencer = Sequencer::new(5);
        let other = sequencer.clone();
        assert_eq!(sequencer.next_sequence_number(), 5);
        assert_eq!(other.next_sequence_number(), 6);
        assert_eq!(sequencer.next_sequence_number(), 7);
    }
}
