//! Drains the source descriptor into the ring (spec.md §4.2).

use std::os::fd::BorrowedFd;

use nix::errno::Errno;
use nix::unistd;
use tracing::{trace, warn};

use crate::consumer::Consumer;
use crate::ring::Ring;

/// Drain the source descriptor into `ring` until it would block, is
/// interrupted, fails, or reports end-of-stream. Implements spec.md §4.2
/// steps 1-5 as a single call, since each loop iteration is already
/// "logically atomic" (spec.md §5) and nothing outside this function may
/// observe the ring between iterations.
pub fn drain(source: BorrowedFd<'_>, ring: &mut Ring, consumers: &mut [Consumer]) {
    let mut buf = vec![0u8; ring.capacity()];

    loop {
        let space = ring.contiguous_write_space();
        if space == 0 {
            // prod_pos sits exactly at capacity only momentarily inside
            // advance_producer; by construction it's always < capacity here.
            unreachable!("producer position must be within [0, capacity) between iterations");
        }

        match unistd::read(source, &mut buf[..space]) {
            Ok(0) => {
                trace!("source reported end-of-stream on this read");
                return;
            }
            Ok(n) => {
                let old_prod_pos = ring.prod_pos();
                let old_prod_gen = ring.prod_gen();

                ring.write_at_producer(&buf[..n]);

                // 5a: repair any consumer overtaken by this write.
                for consumer in consumers.iter_mut() {
                    consumer.repair(ring, old_prod_pos, old_prod_gen, n);
                }

                // 5b: publish by advancing the producer cursor.
                ring.advance_producer(n);

                // 5c: wake any consumer whose availability just went positive.
                for consumer in consumers.iter_mut() {
                    consumer.fire_if_waiting(ring);
                }

                // 5d: loop to drain further buffered data.
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                return;
            }
            Err(e) => {
                warn!(error = %e, "source read failed, will retry on next readiness event");
                return;
            }
        }
    }
}
