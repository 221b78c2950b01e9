// SPDX-License-Identifier: MPL-2.0-only

//! VT acquisition and switch handling.
//!
//! The session owns one virtual terminal in VT_PROCESS mode: the kernel asks
//! for release/acquire through SIGUSR1/SIGUSR2, which arrive on a signalfd so
//! they dispatch like any other event source. The release request is
//! acknowledged before the Leave event is delivered to subscribers.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

use rustix::fs::OFlags;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::launch::DeviceOpener;

const VT_OPENQRY: u32 = 0x5600;
const VT_SETMODE: u32 = 0x5602;
const VT_GETSTATE: u32 = 0x5603;
const VT_RELDISP: u32 = 0x5605;
const VT_ACTIVATE: u32 = 0x5606;
const VT_WAITACTIVE: u32 = 0x5607;

const VT_AUTO: libc::c_char = 0x00;
const VT_PROCESS: libc::c_char = 0x01;
const VT_ACKACQ: libc::c_int = 0x02;

const KDSETMODE: u32 = 0x4b3a;
const KD_TEXT: libc::c_int = 0x00;
const KD_GRAPHICS: libc::c_int = 0x01;
const KDGKBMODE: u32 = 0x4b44;
const KDSKBMODE: u32 = 0x4b45;
const K_OFF: libc::c_int = 0x04;

#[repr(C)]
struct VtMode {
    mode: libc::c_char,
    waitv: libc::c_char,
    relsig: libc::c_short,
    acqsig: libc::c_short,
    frsig: libc::c_short,
}

#[repr(C)]
struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

#[derive(Debug, Error)]
pub enum TtyError {
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("{name} ioctl failed: {source}")]
    Ioctl {
        name: &'static str,
        source: io::Error,
    },
    #[error("failed to set up the vt signalfd: {0}")]
    SignalFd(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtEvent {
    Enter,
    Leave,
}

fn ioctl_int(fd: BorrowedFd<'_>, name: &'static str, request: u32, arg: libc::c_int) -> Result<(), TtyError> {
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg) };
    if ret < 0 {
        return Err(TtyError::Ioctl {
            name,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn ioctl_ptr<T>(fd: BorrowedFd<'_>, name: &'static str, request: u32, arg: *mut T) -> Result<(), TtyError> {
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg) };
    if ret < 0 {
        return Err(TtyError::Ioctl {
            name,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// The compositor's virtual terminal.
pub struct Tty {
    fd: OwnedFd,
    signal_fd: OwnedFd,
    vt: u16,
    active: bool,
    saved_kb_mode: libc::c_int,
}

impl Tty {
    /// Acquire `vt`, or a kernel-chosen free VT when `vt` is zero, put it in
    /// graphics/process mode and make it active.
    pub fn new(opener: &mut dyn DeviceOpener, vt: u16) -> Result<Self, TtyError> {
        let vt = if vt == 0 { query_free_vt(opener)? } else { vt };

        let path = PathBuf::from(format!("/dev/tty{vt}"));
        let fd = opener
            .open_device(&path, OFlags::RDWR | OFlags::NOCTTY)
            .map_err(|source| TtyError::Open {
                path: path.clone(),
                source,
            })?;

        let mut saved_kb_mode: libc::c_int = 0;
        ioctl_ptr(fd.as_fd(), "KDGKBMODE", KDGKBMODE, &mut saved_kb_mode)?;
        ioctl_int(fd.as_fd(), "KDSKBMODE", KDSKBMODE, K_OFF)?;
        ioctl_int(fd.as_fd(), "KDSETMODE", KDSETMODE, KD_GRAPHICS)?;

        let signal_fd = vt_signal_fd().map_err(TtyError::SignalFd)?;

        let mut mode = VtMode {
            mode: VT_PROCESS,
            waitv: 0,
            relsig: libc::SIGUSR1 as libc::c_short,
            acqsig: libc::SIGUSR2 as libc::c_short,
            frsig: 0,
        };
        ioctl_ptr(fd.as_fd(), "VT_SETMODE", VT_SETMODE, &mut mode)?;

        // Make our VT the active one if some other VT currently holds the
        // display.
        let mut stat: VtStat = unsafe { mem::zeroed() };
        ioctl_ptr(fd.as_fd(), "VT_GETSTATE", VT_GETSTATE, &mut stat)?;
        if stat.v_active != vt {
            ioctl_int(fd.as_fd(), "VT_ACTIVATE", VT_ACTIVATE, vt as libc::c_int)?;
            ioctl_int(fd.as_fd(), "VT_WAITACTIVE", VT_WAITACTIVE, vt as libc::c_int)?;
        }

        info!("session active on /dev/tty{vt}");

        Ok(Self {
            fd,
            signal_fd,
            vt,
            active: true,
            saved_kb_mode,
        })
    }

    pub fn vt(&self) -> u16 {
        self.vt
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Duplicate of the signalfd for event-loop registration.
    pub fn event_fd(&self) -> io::Result<OwnedFd> {
        self.signal_fd.try_clone()
    }

    /// Drain the signalfd, acknowledging VT handshakes with the kernel.
    /// Returns the resulting enter/leave events in order.
    pub fn dispatch(&mut self) -> io::Result<Vec<VtEvent>> {
        let mut events = Vec::new();
        loop {
            let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
            let n = unsafe {
                libc::read(
                    self.signal_fd.as_raw_fd(),
                    (&mut info as *mut libc::signalfd_siginfo).cast(),
                    mem::size_of::<libc::signalfd_siginfo>(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err),
                }
            }
            if n as usize != mem::size_of::<libc::signalfd_siginfo>() {
                break;
            }

            match info.ssi_signo as libc::c_int {
                libc::SIGUSR1 => {
                    // Acknowledge the release before telling subscribers, so
                    // the kernel can complete the switch once they are done.
                    debug!("releasing vt {}", self.vt);
                    if let Err(err) = ioctl_int(self.fd.as_fd(), "VT_RELDISP", VT_RELDISP, 1) {
                        warn!("{err}");
                    }
                    self.active = false;
                    events.push(VtEvent::Leave);
                }
                libc::SIGUSR2 => {
                    debug!("acquiring vt {}", self.vt);
                    if let Err(err) =
                        ioctl_int(self.fd.as_fd(), "VT_RELDISP", VT_RELDISP, VT_ACKACQ)
                    {
                        warn!("{err}");
                    }
                    self.active = true;
                    events.push(VtEvent::Enter);
                }
                other => debug!("ignoring signal {other} on vt signalfd"),
            }
        }
        Ok(events)
    }

    /// Ask the kernel to switch to `target`. A no-op when `target` is already
    /// the active VT.
    pub fn switch_vt(&mut self, target: u16) -> Result<(), TtyError> {
        if self.active && target == self.vt {
            return Ok(());
        }
        info!("switching to vt {target}");
        ioctl_int(
            self.fd.as_fd(),
            "VT_ACTIVATE",
            VT_ACTIVATE,
            target as libc::c_int,
        )
    }
}

impl Drop for Tty {
    fn drop(&mut self) {
        // Hand the console back in the state we found it.
        let _ = ioctl_int(self.fd.as_fd(), "KDSKBMODE", KDSKBMODE, self.saved_kb_mode);
        let _ = ioctl_int(self.fd.as_fd(), "KDSETMODE", KDSETMODE, KD_TEXT);
        let mut mode = VtMode {
            mode: VT_AUTO,
            waitv: 0,
            relsig: 0,
            acqsig: 0,
            frsig: 0,
        };
        let _ = ioctl_ptr(self.fd.as_fd(), "VT_SETMODE", VT_SETMODE, &mut mode);

        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGUSR1);
            libc::sigaddset(&mut mask, libc::SIGUSR2);
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut());
        }
    }
}

/// Block SIGUSR1/SIGUSR2 and route them to a non-blocking signalfd.
fn vt_signal_fd() -> io::Result<OwnedFd> {
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGUSR1);
        libc::sigaddset(&mut mask, libc::SIGUSR2);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

/// Ask the kernel for a free VT through the console multiplexer.
fn query_free_vt(opener: &mut dyn DeviceOpener) -> Result<u16, TtyError> {
    let path = PathBuf::from("/dev/tty0");
    let fd = opener
        .open_device(&path, OFlags::RDWR | OFlags::NOCTTY)
        .map_err(|source| TtyError::Open { path, source })?;
    let mut vt: libc::c_int = 0;
    ioctl_ptr(fd.as_fd(), "VT_OPENQRY", VT_OPENQRY, &mut vt)?;
    if vt <= 0 {
        return Err(TtyError::Ioctl {
            name: "VT_OPENQRY",
            source: io::Error::new(io::ErrorKind::Other, "no free vt"),
        });
    }
    Ok(vt as u16)
}
