//! Parses configuration, opens the source, registers synthetic devices,
//! runs the event loop, tears down (spec.md §4.5).

use std::os::fd::AsFd;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use tracing::info;

use crate::config::Args;
use crate::consumer::Consumer;
use crate::cuse::device::CuseDevice;
use crate::cuse::DeviceFrame;
use crate::error::{Result, SerteeError};
use crate::eventloop;
use crate::ring::Ring;

pub fn run(args: Args) -> Result<()> {
    let source_fd = open_source(&args.source)?;
    let mut ring = Ring::new(args.bufsize);

    let mut devices: Vec<Box<dyn DeviceFrame>> = Vec::with_capacity(args.name.len());
    let mut consumers: Vec<Consumer> = Vec::with_capacity(args.name.len());
    for name in &args.name {
        let device = CuseDevice::register(name).map_err(|source| SerteeError::Registration {
            device: name.clone(),
            source,
        })?;
        devices.push(Box::new(device) as Box<dyn DeviceFrame>);
        consumers.push(Consumer::new(name.clone()));
        info!(device = %name, "registered");
    }

    let result = eventloop::run(source_fd.as_fd(), &mut devices, &mut consumers, &mut ring);

    // Teardown in creation order (spec.md §4.5): dropping each `CuseDevice`
    // closes its /dev/cuse channel, which is all release requires here.
    devices.clear();

    result
}

fn open_source(path: &str) -> Result<std::fs::File> {
    let flags = OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_NOCTTY | OFlag::O_SYNC;
    let raw = fcntl::open(path, flags, Mode::empty()).map_err(|source| SerteeError::SourceOpen {
        path: path.to_string(),
        source,
    })?;
    Ok(std::fs::File::from(raw))
}
