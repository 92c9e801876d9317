//! Per-device session callbacks (spec.md §4.3): open, release, read, write,
//! poll. These dispatch the decoded `Request` from a `DeviceFrame` against
//! one `Consumer`'s cursor and the shared `Ring`, or forward to the source
//! descriptor for writes.

use std::os::fd::BorrowedFd;

use nix::unistd;
use tracing::{trace, warn};

use crate::consumer::Consumer;
use crate::cuse::{Reply, Request};
use crate::ring::Ring;

/// Handle one decoded request for `consumer`, returning the reply to send
/// back down its `DeviceFrame`. `source` is the fan-out source descriptor,
/// needed only to forward `Request::Write` (spec.md §4.3 write: "forward
/// the bytes verbatim to the source descriptor").
pub fn handle(
    request: Request,
    consumer: &mut Consumer,
    ring: &Ring,
    source: BorrowedFd<'_>,
) -> Reply {
    match request {
        Request::Open => {
            consumer.on_open(ring);
            trace!(device = %consumer.name, open_count = consumer.open_count(), "open");
            Reply::Ok
        }
        Request::Release => {
            consumer.on_release();
            trace!(device = %consumer.name, open_count = consumer.open_count(), "release");
            Reply::Ok
        }
        Request::Read { size, offset } => handle_read(consumer, ring, size, offset),
        Request::Write { data } => handle_write(source, &data),
        Request::Poll { notifier } => handle_poll(consumer, ring, notifier),
    }
}

/// spec.md §4.3 read: compute `available`, return zero bytes if
/// `offset > available`, else `min(size, available - offset)` bytes from
/// `read_pos + offset`. The cursor then advances by `offset + returned` —
/// offset is a read-ahead peek, so the cursor catches up through the
/// peeked region as well as the bytes actually handed back (spec.md §8's
/// cursor-advance law).
fn handle_read(consumer: &mut Consumer, ring: &Ring, size: usize, offset: u64) -> Reply {
    let available = consumer.available(ring);
    let offset = offset as usize;
    if offset > available {
        return Reply::Data(Vec::new());
    }
    let returned = size.min(available - offset);
    if returned == 0 {
        return Reply::Data(Vec::new());
    }
    let data = ring.slice_from(consumer.read_pos() + offset, returned).to_vec();
    consumer.advance_read(ring, offset + returned);
    Reply::Data(data)
}

/// spec.md §4.3 write: forward verbatim to the source descriptor. A short
/// write is reported as-is; a failed write, including `EAGAIN` on the
/// nonblocking descriptor, is propagated to the caller as the platform
/// errno (spec.md §7) rather than folded into the success path — the
/// caller owns its own retry/backoff decision.
fn handle_write(source: BorrowedFd<'_>, data: &[u8]) -> Reply {
    match unistd::write(source, data) {
        Ok(n) => Reply::Written(n),
        Err(e) => {
            warn!(error = %e, "forwarding write to source failed");
            Reply::Error(e as i32)
        }
    }
}

/// spec.md §4.3 poll: if data is already available, report readable
/// immediately without retaining the notifier. Otherwise retain it; the
/// source reader fires it when data arrives (spec.md §4.2 step 5c).
fn handle_poll(
    consumer: &mut Consumer,
    ring: &Ring,
    notifier: Box<dyn crate::cuse::Notifier>,
) -> Reply {
    if consumer.available(ring) > 0 {
        Reply::PollReady(true)
    } else {
        consumer.set_notifier(notifier);
        Reply::PollReady(false)
    }
}
