// SPDX-License-Identifier: MPL-2.0-only

//! Privileged device access.
//!
//! The core never opens DRM or evdev character devices itself: a launcher
//! process holding the elevated capability opens them and passes file
//! descriptors in. Hosts that still run with the required privilege can use
//! [`DirectOpener`].

use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use rustix::fs::{Mode, OFlags};

/// Opens device nodes on behalf of the unprivileged core.
pub trait DeviceOpener {
    fn open_device(&mut self, path: &Path, flags: OFlags) -> io::Result<OwnedFd>;
}

/// Opener for hosts that hold the privilege themselves (development setups,
/// running from a root shell on a VT).
#[derive(Debug, Default)]
pub struct DirectOpener;

impl DeviceOpener for DirectOpener {
    fn open_device(&mut self, path: &Path, flags: OFlags) -> io::Result<OwnedFd> {
        let fd = rustix::fs::open(path, flags | OFlags::CLOEXEC, Mode::empty())?;
        Ok(fd)
    }
}

/// Enumerates the device nodes belonging to a seat. The udev layer sits
/// behind this; [`DevScanner`] is the udev-less fallback.
pub trait DeviceScanner {
    /// The primary DRM node for `seat`.
    fn primary_drm(&mut self, seat: &str) -> io::Result<PathBuf>;

    /// All evdev nodes assigned to `seat`.
    fn input_devices(&mut self, seat: &str) -> io::Result<Vec<PathBuf>>;
}

/// Directory-scan device discovery: first `/dev/dri/card*` and every
/// `/dev/input/event*`. Seat assignment is not consulted.
#[derive(Debug, Default)]
pub struct DevScanner;

fn scan(dir: &str, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut nodes: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix))
        })
        .collect();
    nodes.sort();
    Ok(nodes)
}

impl DeviceScanner for DevScanner {
    fn primary_drm(&mut self, _seat: &str) -> io::Result<PathBuf> {
        scan("/dev/dri", "card")?
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no drm device node"))
    }

    fn input_devices(&mut self, _seat: &str) -> io::Result<Vec<PathBuf>> {
        scan("/dev/input", "event")
    }
}
