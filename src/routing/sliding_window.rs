//! Echo sliding window
//!
//! Records which of the last `capacity` sequence slots were actually received.
//! Slots are positional (`sequence mod capacity`): duplicates and reordered
//! sequences are accepted without rejection.

/// Receive record over a fixed number of sequence slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoSlidingWindow {
    slots: Vec<Option<u32>>,
}

impl EchoSlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, sequence: u32) -> usize {
        (sequence as usize) % self.slots.len()
    }

    /// Open the slot for `sequence` as expected but not yet received
    pub fn slide_sequence(&mut self, sequence: u32) {
        let slot = self.slot(sequence);
        self.slots[slot] = None;
    }

    /// Mark `sequence` as received
    pub fn add_sequence(&mut self, sequence: u32) {
        let slot = self.slot(sequence);
        self.slots[slot] = Some(sequence);
    }

    pub fn contains(&self, sequence: u32) -> bool {
        self.slots[self.slot(sequence)] == Some(sequence)
    }

    pub fn received_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn received_ratio(&self) -> f64 {
        self.received_count() as f64 / self.capacity() as f64
    }

    /// Transmission quality derived from the receive ratio, scaled to 0-255
    pub fn tq(&self) -> u8 {
        (self.received_ratio() * 255.0).round().min(255.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_echo_in_window_of_twelve() {
        let mut window = EchoSlidingWindow::new(12);
        window.add_sequence(500);
        assert_eq!(window.received_count(), 1);
        // 255 / 12 = 21.25
        assert_eq!(window.tq(), 21);
    }

    #[test]
    fn test_full_window_is_max_tq() {
        let mut window = EchoSlidingWindow::new(12);
        for seq in 100..112 {
            window.add_sequence(seq);
        }
        assert_eq!(window.tq(), 255);
    }

    #[test]
    fn test_duplicates_do_not_inflate_ratio() {
        let mut window = EchoSlidingWindow::new(12);
        window.add_sequence(7);
        window.add_sequence(7);
        window.add_sequence(7 + 12);
        assert_eq!(window.received_count(), 1);
        assert!(window.contains(19));
        assert!(!window.contains(7));
    }

    #[test]
    fn test_slide_reopens_slot() {
        let mut window = EchoSlidingWindow::new(4);
        for seq in 0..4 {
            window.add_sequence(seq);
        }
        window.slide_sequence(5);
        assert_eq!(window.received_count(), 3);
        assert!(!window.contains(1));
        window.add_sequence(5);
        assert_eq!(window.received_count(), 4);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut window = EchoSlidingWindow::new(0);
        window.add_sequence(3);
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.tq(), 255);
    }
}
