//! Single-threaded readiness loop multiplexing the source descriptor and
//! every device session descriptor over epoll (spec.md §4.4).

use std::os::fd::BorrowedFd;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::{debug, warn};

use crate::consumer::Consumer;
use crate::cuse::DeviceFrame;
use crate::error::{Result, SerteeError};
use crate::ring::Ring;
use crate::session;
use crate::source;

/// Descriptors are registered with epoll `data` tagging what they are:
/// the source gets the sentinel `SOURCE_TAG`, every consumer session gets
/// its index into the `devices`/`consumers` slices plus one.
const SOURCE_TAG: u64 = 0;

/// 30-second liveness heartbeat (spec.md §4.4); bounds shutdown latency
/// only, never used for correctness.
const WAIT_TIMEOUT_MS: u16 = 30_000;

/// Run the loop until shutdown (spec.md §5 "Cancellation and shutdown").
/// `devices[i]` and `consumers[i]` are paired by index: device `i`'s
/// session traffic is serviced against consumer `i`'s cursor.
pub fn run(
    source_fd: BorrowedFd<'_>,
    devices: &mut [Box<dyn DeviceFrame>],
    consumers: &mut [Consumer],
    ring: &mut Ring,
) -> Result<()> {
    let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(SerteeError::Multiplexer)?;
    epoll
        .add(source_fd, EpollEvent::new(EpollFlags::EPOLLIN, SOURCE_TAG))
        .map_err(SerteeError::Multiplexer)?;
    for (i, device) in devices.iter().enumerate() {
        let fd = unsafe { BorrowedFd::borrow_raw(device.fd()) };
        epoll
            .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, tag_for(i)))
            .map_err(SerteeError::Multiplexer)?;
    }

    let mut events = vec![EpollEvent::empty(); devices.len() + 1];
    let mut stop = false;
    while !stop {
        let n = match epoll.wait(&mut events, EpollTimeout::from(WAIT_TIMEOUT_MS)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(SerteeError::Multiplexer(e)),
        };

        for event in &events[..n] {
            match event.data() {
                SOURCE_TAG => source::drain(source_fd, ring, consumers),
                tag => {
                    let i = index_for(tag);
                    if dispatch_one(devices, consumers, ring, source_fd, i) {
                        stop = true;
                    }
                }
            }
        }
    }

    debug!("event loop exiting");
    Ok(())
}

fn tag_for(index: usize) -> u64 {
    index as u64 + 1
}

fn index_for(tag: u64) -> usize {
    (tag - 1) as usize
}

/// Service one ready consumer session. Returns `true` if the loop should
/// stop (spec.md §4.4: receive failure, end-of-stream, or the framework
/// signalling the session has exited).
fn dispatch_one(
    devices: &mut [Box<dyn DeviceFrame>],
    consumers: &mut [Consumer],
    ring: &mut Ring,
    source_fd: BorrowedFd<'_>,
    index: usize,
) -> bool {
    let device = &mut devices[index];
    let request = match device.receive() {
        Ok(Some(request)) => request,
        Ok(None) => return false,
        Err(e) => {
            warn!(device = %device.device_name(), error = %e, "device session receive failed");
            return true;
        }
    };

    let reply = session::handle(request, &mut consumers[index], ring, source_fd);
    if let Err(e) = device.send(reply) {
        warn!(device = %device.device_name(), error = %e, "device session send failed");
        return true;
    }

    device.exited()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cuse::{Reply, Request};
    use std::collections::VecDeque;
    use std::os::fd::{AsFd, AsRawFd};

    /// In-memory `DeviceFrame` double (no real `/dev/cuse` needed).
    struct FakeDevice {
        fd: std::fs::File,
        name: String,
        inbox: VecDeque<Request>,
        outbox: Vec<Reply>,
        exited: bool,
    }

    impl DeviceFrame for FakeDevice {
        fn fd(&self) -> std::os::fd::RawFd {
            self.fd.as_raw_fd()
        }
        fn receive(&mut self) -> std::io::Result<Option<Request>> {
            Ok(self.inbox.pop_front())
        }
        fn send(&mut self, reply: Reply) -> std::io::Result<()> {
            self.outbox.push(reply);
            Ok(())
        }
        fn exited(&self) -> bool {
            self.exited
        }
        fn device_name(&self) -> &str {
            &self.name
        }
    }

    fn fake_device(name: &str) -> FakeDevice {
        let raw = nix::fcntl::open(
            "/dev/null",
            nix::fcntl::OFlag::O_RDWR,
            nix::sys::stat::Mode::empty(),
        )
        .unwrap();
        FakeDevice {
            fd: std::fs::File::from(raw),
            name: name.to_string(),
            inbox: VecDeque::new(),
            outbox: Vec::new(),
            exited: false,
        }
    }

    #[test]
    fn dispatch_one_services_open_then_read() {
        let mut fake = fake_device("a");
        fake.inbox.push_back(Request::Open);
        let mut devices: Vec<Box<dyn DeviceFrame>> = vec![Box::new(fake)];
        let mut consumers = vec![Consumer::new("a".into())];
        let mut ring = Ring::new(8);
        ring.write_at_producer(b"AB");
        ring.advance_producer(2);

        let source_file = std::fs::File::open("/dev/null").unwrap();
        let source_fd = source_file.as_fd();

        let stop = dispatch_one(&mut devices, &mut consumers, &mut ring, source_fd, 0);
        assert!(!stop);
        assert_eq!(consumers[0].open_count(), 1);
    }

    #[test]
    fn dispatch_one_stops_loop_on_receive_error() {
        struct ErroringDevice(FakeDevice);
        impl DeviceFrame for ErroringDevice {
            fn fd(&self) -> std::os::fd::RawFd {
                self.0.fd()
            }
            fn receive(&mut self) -> std::io::Result<Option<Request>> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "gone"))
            }
            fn send(&mut self, reply: Reply) -> std::io::Result<()> {
                self.0.send(reply)
            }
            fn exited(&self) -> bool {
                false
            }
            fn device_name(&self) -> &str {
                self.0.device_name()
            }
        }

        let mut devices: Vec<Box<dyn DeviceFrame>> = vec![Box::new(ErroringDevice(fake_device("a")))];
        let mut consumers = vec![Consumer::new("a".into())];
        let mut ring = Ring::new(8);
        let source_file = std::fs::File::open("/dev/null").unwrap();

        let stop = dispatch_one(&mut devices, &mut consumers, &mut ring, source_file.as_fd(), 0);
        assert!(stop);
    }
}
