//! Per-fan-out-device reader state (spec.md §3 "Consumer").

use crate::cuse::Notifier;
use crate::ring::Ring;

/// One synthetic device's cursor into the shared ring, plus the bookkeeping
/// the device session handler (`crate::session`) needs to service it.
pub struct Consumer {
    pub name: String,
    read_pos: usize,
    read_gen: u64,
    open_count: u32,
    pending_notifier: Option<Box<dyn Notifier>>,
}

impl Consumer {
    pub fn new(name: String) -> Self {
        Self {
            name,
            read_pos: 0,
            read_gen: 0,
            open_count: 0,
            pending_notifier: None,
        }
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn read_gen(&self) -> u64 {
        self.read_gen
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub fn available(&self, ring: &Ring) -> usize {
        ring.available_for(self.read_pos, self.read_gen)
    }

    /// spec.md §4.3 open: "Initialise read_pos and read_gen per §4.1 *only
    /// on the first open*" — a shared cursor across concurrent opens.
    pub fn on_open(&mut self, ring: &Ring) {
        if self.open_count == 0 {
            self.read_pos = ring.prod_pos();
            self.read_gen = ring.prod_gen().saturating_sub(1);
        }
        self.open_count += 1;
    }

    /// spec.md §4.3 release: decrement, and clear `read_pos` to the `0`
    /// sentinel once the last handle closes. `open_count` is asserted
    /// non-negative per §9's resolution of the "≤ 0" open question.
    pub fn on_release(&mut self) {
        assert!(self.open_count > 0, "release on a consumer with no open handles");
        self.open_count -= 1;
        if self.open_count == 0 {
            self.read_pos = 0;
        }
    }

    /// spec.md §4.3 read: advance the cursor by the number of bytes
    /// actually returned, wrapping the generation on a same boundary as the
    /// producer's own wrap.
    pub fn advance_read(&mut self, ring: &Ring, returned: usize) {
        self.read_pos += returned;
        if self.read_pos == ring.capacity() {
            self.read_pos = 0;
            self.read_gen += 1;
        }
    }

    /// spec.md §4.2 step 5a: repair this consumer's cursor against a
    /// producer write of `n` bytes that started at `old_prod_pos`.
    pub fn repair(&mut self, ring: &Ring, old_prod_pos: usize, old_prod_gen: u64, n: usize) {
        let (pos, gen) = ring.repair_cursor(self.read_pos, self.read_gen, old_prod_pos, old_prod_gen, n);
        self.read_pos = pos;
        self.read_gen = gen;
    }

    /// spec.md §4.3 poll: retain `notifier` if not already readable, firing
    /// and dropping any previously retained notifier without firing it
    /// (at most one retained notifier per consumer, per spec.md §8).
    pub fn set_notifier(&mut self, notifier: Box<dyn Notifier>) {
        self.pending_notifier = Some(notifier);
    }

    pub fn has_notifier(&self) -> bool {
        self.pending_notifier.is_some()
    }

    pub fn take_notifier(&mut self) -> Option<Box<dyn Notifier>> {
        self.pending_notifier.take()
    }

    /// spec.md §4.2 step 5c: if data just became available and a notifier
    /// is retained, fire it exactly once and release it.
    pub fn fire_if_waiting(&mut self, ring: &Ring) {
        if self.available(ring) > 0 {
            if let Some(notifier) = self.pending_notifier.take() {
                notifier.fire();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cuse::Notifier;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingNotifier(Rc<Cell<u32>>);
    impl Notifier for CountingNotifier {
        fn fire(self: Box<Self>) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn first_open_inherits_producer_position() {
        let mut ring = Ring::new(8);
        ring.write_at_producer(b"ABCD");
        ring.advance_producer(4);

        let mut c = Consumer::new("a".into());
        c.on_open(&ring);
        assert_eq!(c.read_pos(), 4);
        assert_eq!(c.read_gen(), 0); // saturating_sub(1) on prod_gen=0
        assert_eq!(c.open_count(), 1);
    }

    #[test]
    fn second_concurrent_open_does_not_reset_cursor() {
        let mut ring = Ring::new(8);
        ring.write_at_producer(b"AB");
        ring.advance_producer(2);

        let mut c = Consumer::new("a".into());
        c.on_open(&ring);
        c.advance_read(&ring, 1);
        let pos_before = c.read_pos();

        c.on_open(&ring);
        assert_eq!(c.read_pos(), pos_before);
        assert_eq!(c.open_count(), 2);
    }

    #[test]
    fn release_to_zero_resets_sentinel() {
        let ring = Ring::new(8);
        let mut c = Consumer::new("a".into());
        c.on_open(&ring);
        c.on_release();
        assert_eq!(c.read_pos(), 0);
        assert_eq!(c.open_count(), 0);
    }

    #[test]
    fn notifier_fires_exactly_once_on_transition_to_available() {
        let ring_before = Ring::new(8);
        let fired = Rc::new(Cell::new(0));
        let mut c = Consumer::new("a".into());
        c.set_notifier(Box::new(CountingNotifier(fired.clone())));

        // no data yet: should not fire.
        c.fire_if_waiting(&ring_before);
        assert_eq!(fired.get(), 0);
        assert!(c.has_notifier());

        let mut ring = Ring::new(8);
        ring.write_at_producer(b"A");
        ring.advance_producer(1);
        c.fire_if_waiting(&ring);
        assert_eq!(fired.get(), 1);
        assert!(!c.has_notifier());

        // a second arrival with no notifier retained must not fire anything.
        ring.write_at_producer(b"B");
        ring.advance_producer(1);
        c.fire_if_waiting(&ring);
        assert_eq!(fired.get(), 1);
    }
}
