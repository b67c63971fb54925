//! Timestamp-keyed reorder buffer for gateway transports that may deliver out of order

use std::collections::BTreeMap;

/// Small bounded lookahead that releases packets in timestamp order
///
/// Packets are keyed by their gateway timestamp (ms). A packet is released when it is the
/// next expected one (`next_timestamp`); out-of-order arrivals wait until the gap is filled
/// or until `capacity` packets are waiting, at which point the oldest are released and the
/// gap is skipped. Packets older than the expectation pass straight through.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    capacity: usize,
    step: u32,
    next_timestamp: Option<u32>,
    pending: BTreeMap<u32, T>,
}

impl<T> ReorderBuffer<T> {
    /// `step` is the timestamp distance between consecutive packets (the packet duration)
    pub fn new(capacity: usize, step: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            step: step.max(1),
            next_timestamp: None,
            pending: BTreeMap::new(),
        }
    }

    /// Accept one packet, returning whatever is now ready in order
    pub fn push(&mut self, timestamp: u32, packet: T) -> Vec<T> {
        let next = *self.next_timestamp.get_or_insert(timestamp);

        if timestamp < next {
            tracing::trace!(timestamp, next, "Late packet passed through");
            return vec![packet];
        }

        if self.pending.insert(timestamp, packet).is_some() {
            tracing::debug!(timestamp, "Duplicate packet timestamp replaced");
        }

        let mut ready = self.release_contiguous();

        while self.pending.len() > self.capacity {
            if let Some((timestamp, packet)) = self.pending.pop_first() {
                tracing::debug!(timestamp, "Reorder buffer full, skipping gap");
                self.next_timestamp = Some(timestamp.saturating_add(self.step));
                ready.push(packet);
                ready.extend(self.release_contiguous());
            }
        }

        ready
    }

    /// Drain every waiting packet in timestamp order
    pub fn flush(&mut self) -> Vec<T> {
        let pending = std::mem::take(&mut self.pending);
        if let Some(&last) = pending.keys().next_back() {
            self.next_timestamp = Some(last.saturating_add(self.step));
        }
        pending.into_values().collect()
    }

    /// Forget the expected timestamp and drop waiting packets
    pub fn reset(&mut self) {
        self.next_timestamp = None;
        self.pending.clear();
    }

    /// Packets currently waiting for a gap to fill
    pub fn waiting(&self) -> usize {
        self.pending.len()
    }

    fn release_contiguous(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(next) = self.next_timestamp {
            match self.pending.remove(&next) {
                Some(packet) => {
                    ready.push(packet);
                    self.next_timestamp = Some(next.saturating_add(self.step));
                }
                None => break,
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_passes_through() {
        let mut buffer = ReorderBuffer::new(4, 60);
        assert_eq!(buffer.push(0, "a"), vec!["a"]);
        assert_eq!(buffer.push(60, "b"), vec!["b"]);
        assert_eq!(buffer.push(120, "c"), vec!["c"]);
        assert_eq!(buffer.waiting(), 0);
    }

    #[test]
    fn test_swapped_packets_are_reordered() {
        let mut buffer = ReorderBuffer::new(4, 60);
        assert_eq!(buffer.push(0, 0), vec![0]);
        assert!(buffer.push(120, 2).is_empty());
        assert_eq!(buffer.push(60, 1), vec![1, 2]);
        assert_eq!(buffer.push(180, 3), vec![3]);
    }

    #[test]
    fn test_full_buffer_skips_the_gap() {
        let mut buffer = ReorderBuffer::new(2, 60);
        assert_eq!(buffer.push(0, 0), vec![0]);
        // 60 never arrives
        assert!(buffer.push(120, 2).is_empty());
        assert!(buffer.push(180, 3).is_empty());
        assert_eq!(buffer.push(240, 4), vec![2, 3, 4]);

        // The lost packet shows up late and passes straight through
        assert_eq!(buffer.push(60, 1), vec![1]);
        assert_eq!(buffer.push(300, 5), vec![5]);
    }

    #[test]
    fn test_flush_drains_in_order() {
        let mut buffer = ReorderBuffer::new(8, 60);
        buffer.push(0, 0);
        buffer.push(240, 4);
        buffer.push(120, 2);
        assert_eq!(buffer.flush(), vec![2, 4]);
        assert_eq!(buffer.waiting(), 0);
        assert_eq!(buffer.push(300, 5), vec![5]);
    }

    #[test]
    fn test_reset_restarts_expectation() {
        let mut buffer = ReorderBuffer::new(4, 60);
        buffer.push(600, "x");
        buffer.push(720, "z");
        buffer.reset();
        assert_eq!(buffer.push(0, "a"), vec!["a"]);
    }
}
