//! Concrete `DeviceFrame` backed by the real Linux CUSE channel.
//!
//! Each registered device name gets its own `open("/dev/cuse")`, per the
//! kernel CUSE model: one file descriptor is one synthetic character
//! device's full duplex channel to the kernel. Bootstrap (spec.md §4.5)
//! opens one of these per name in `--name`.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;
use tracing::{debug, trace, warn};

use super::proto::{
    as_bytes, from_bytes, CuseInitOut, InHeader, NotifyPollWakeupOut, OpenOut, OutHeader, PollIn,
    PollOut, ReadIn, ReleaseIn, WriteIn, WriteOut, CUSE_INIT, FUSE_NOTIFY_POLL, FUSE_OPEN,
    FUSE_POLL, FUSE_READ, FUSE_RELEASE, FUSE_WRITE,
};
use super::{DeviceFrame, Notifier, Reply, Request};

const CUSE_DEVICE: &str = "/dev/cuse";
const MAX_MESSAGE: usize = 8192;

/// One registered synthetic device's CUSE channel.
pub struct CuseDevice {
    fd: std::fs::File,
    name: String,
    last_unique: u64,
    last_opcode: u32,
    exited: bool,
}

impl CuseDevice {
    /// Register a synthetic character device named `name` with the CUSE
    /// framework (spec.md §4.5, §6 "Each name in the --name list yields
    /// one device registered ... under the property DEVNAME=<name>").
    pub fn register(name: &str) -> io::Result<Self> {
        let raw = fcntl::open(CUSE_DEVICE, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let fd: std::fs::File = std::fs::File::from(raw);
        let mut device = Self {
            fd,
            name: name.to_string(),
            last_unique: 0,
            last_opcode: 0,
            exited: false,
        };
        device.handshake()?;
        debug!(device = %device.name, "registered CUSE device");
        Ok(device)
    }

    /// Perform the CUSE_INIT handshake: the kernel sends a CUSE_INIT
    /// request as soon as the channel opens, which we must answer with a
    /// `cuse_init_out` plus the `DEVNAME=<name>` info string before any
    /// open/read/write requests will be delivered.
    fn handshake(&mut self) -> io::Result<()> {
        let mut buf = [0u8; MAX_MESSAGE];
        let n = blocking_read(&mut self.fd, &mut buf)?;
        let header: InHeader = from_bytes(&buf[..n]);
        if header.opcode != CUSE_INIT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected CUSE_INIT, got opcode {}", header.opcode),
            ));
        }

        let init_out = CuseInitOut {
            major: 7,
            minor: 1,
            flags: 0,
            max_read: MAX_MESSAGE as u32,
            max_write: MAX_MESSAGE as u32,
            ..Default::default()
        };
        let devinfo = format!("DEVNAME={}\0", self.name);
        let body = as_bytes(&init_out);
        let out = OutHeader {
            len: (std::mem::size_of::<OutHeader>() + body.len() + devinfo.len()) as u32,
            error: 0,
            unique: header.unique,
        };

        let mut reply = Vec::with_capacity(out.len as usize);
        reply.extend_from_slice(as_bytes(&out));
        reply.extend_from_slice(body);
        reply.extend_from_slice(devinfo.as_bytes());
        self.fd.write_all(&reply)
    }

    fn reply_raw(&mut self, error: i32, body: &[u8]) -> io::Result<()> {
        let out = OutHeader {
            len: (std::mem::size_of::<OutHeader>() + body.len()) as u32,
            error: -error,
            unique: self.last_unique,
        };
        let mut buf = Vec::with_capacity(out.len as usize);
        buf.extend_from_slice(as_bytes(&out));
        buf.extend_from_slice(body);
        self.fd.write_all(&buf)
    }
}

impl DeviceFrame for CuseDevice {
    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn receive(&mut self) -> io::Result<Option<Request>> {
        let mut buf = [0u8; MAX_MESSAGE];
        let n = match self.fd.read(&mut buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "cuse channel closed")),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        };

        let header: InHeader = from_bytes(&buf[..n]);
        let body = &buf[std::mem::size_of::<InHeader>()..n];
        self.last_unique = header.unique;
        self.last_opcode = header.opcode;

        let request = match header.opcode {
            FUSE_OPEN => Request::Open,
            FUSE_RELEASE => {
                let _release: ReleaseIn = from_bytes(body);
                Request::Release
            }
            FUSE_READ => {
                let read: ReadIn = from_bytes(body);
                Request::Read {
                    size: read.size as usize,
                    offset: read.offset,
                }
            }
            FUSE_WRITE => {
                let write: WriteIn = from_bytes(body);
                let data_off = std::mem::size_of::<WriteIn>();
                let data = body[data_off..data_off + write.size as usize].to_vec();
                Request::Write { data }
            }
            FUSE_POLL => {
                let poll: PollIn = from_bytes(body);
                Request::Poll {
                    notifier: Box::new(CusePollNotifier {
                        fd: self.fd.as_raw_fd(),
                        kh: poll.kh,
                    }),
                }
            }
            other => {
                warn!(device = %self.name, opcode = other, "unhandled CUSE opcode");
                return Ok(None);
            }
        };
        trace!(device = %self.name, opcode = header.opcode, "received CUSE request");
        Ok(Some(request))
    }

    fn send(&mut self, reply: Reply) -> io::Result<()> {
        match reply {
            Reply::Ok if self.last_opcode == FUSE_OPEN => {
                self.reply_raw(0, as_bytes(&OpenOut::default()))
            }
            Reply::Ok => self.reply_raw(0, &[]),
            Reply::Data(data) => self.reply_raw(0, &data),
            Reply::Written(n) => {
                let out = WriteOut {
                    size: n as u32,
                    padding: 0,
                };
                self.reply_raw(0, as_bytes(&out))
            }
            Reply::PollReady(ready) => {
                let out = PollOut {
                    revents: if ready { libc::POLLIN as u32 } else { 0 },
                    padding: 0,
                };
                self.reply_raw(0, as_bytes(&out))
            }
            Reply::Error(errno) => self.reply_raw(errno, &[]),
        }
    }

    fn exited(&self) -> bool {
        self.exited
    }

    fn device_name(&self) -> &str {
        &self.name
    }
}

/// Fires a retained poll by sending an unsolicited `FUSE_NOTIFY_POLL`
/// frame carrying the kernel's poll handle (`kh`) back down the same CUSE
/// channel the poll request arrived on (spec.md §4.2 step 5c).
struct CusePollNotifier {
    fd: RawFd,
    kh: u64,
}

impl Notifier for CusePollNotifier {
    fn fire(self: Box<Self>) {
        let wakeup = NotifyPollWakeupOut { kh: self.kh };
        let body = as_bytes(&wakeup);
        let out = OutHeader {
            len: (std::mem::size_of::<OutHeader>() + body.len()) as u32,
            error: FUSE_NOTIFY_POLL as i32,
            unique: 0,
        };
        let mut buf = Vec::with_capacity(out.len as usize);
        buf.extend_from_slice(as_bytes(&out));
        buf.extend_from_slice(body);
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.fd) };
        if let Err(e) = unistd::write(borrowed, &buf) {
            warn!(kh = self.kh, error = %e, "failed to fire poll notifier");
        }
    }
}

/// Blocking read used only for the CUSE_INIT handshake, which happens
/// before the descriptor is registered with the event loop.
fn blocking_read(file: &mut std::fs::File, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match file.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
