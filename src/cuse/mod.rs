//! Contract the core consumes from the character-device-in-userspace
//! framework (spec.md §1 "out of scope", §9 "Dynamic dispatch over callback
//! table" / "Per-session user data").
//!
//! `session.rs` and `eventloop.rs` are written against `Notifier` and the
//! request/reply types here only; `device.rs` backs them with the real
//! Linux CUSE wire protocol (`proto.rs`). Tests back them with an in-memory
//! double instead (see `crate::session::tests`).

pub mod device;
pub mod proto;

use std::os::fd::RawFd;

/// Opaque handle that wakes exactly one blocked `poll()` caller when fired.
///
/// Firing consumes the notifier: spec.md §3 requires it be "fired-and-
/// released exactly once, and released without firing if replaced", so the
/// type system enforces the "exactly once" half directly.
pub trait Notifier {
    fn fire(self: Box<Self>);
}

/// One incoming request from a device session, decoded far enough to
/// dispatch (spec.md §4.4: "receive one framework message ... and hand it
/// to the framework's per-session dispatcher").
pub enum Request {
    Open,
    Release,
    Read { size: usize, offset: u64 },
    Write { data: Vec<u8> },
    Poll { notifier: Box<dyn Notifier> },
}

/// Outcome of a device session handler's response, handed back to the
/// concrete framework binding to encode and send.
pub enum Reply {
    Ok,
    Data(Vec<u8>),
    Written(usize),
    PollReady(bool),
    Error(i32),
}

/// One registered synthetic device's session with the CUSE framework.
///
/// `fd()` is what the event loop registers with the readiness multiplexer
/// (spec.md §4.4); `receive()`/`send()` implement the "receive one
/// framework message" / reply half of the per-session dispatch.
pub trait DeviceFrame {
    fn fd(&self) -> RawFd;

    /// Receive and decode one request. `Ok(None)` means the read would have
    /// blocked or was interrupted (spec.md §4.4: "If the receive reports
    /// interrupted, skip this descriptor"). `Err` means failure or
    /// end-of-stream, which the event loop treats as `stop = true`.
    fn receive(&mut self) -> std::io::Result<Option<Request>>;

    fn send(&mut self, reply: Reply) -> std::io::Result<()>;

    /// Whether the framework has signalled this session as exited
    /// (spec.md §4.4, checked "after dispatch").
    fn exited(&self) -> bool;

    fn device_name(&self) -> &str;
}
