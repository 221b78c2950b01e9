// SPDX-License-Identifier: MPL-2.0-only

//! Raw evdev event pump.
//!
//! Each device is one non-blocking fd read in `input_event` sized chunks.
//! Relative motion is coalesced within a SYN frame and flushed as a single
//! semantic event; wheel events are scaled to the protocol's 24.8 fixed-point
//! axis convention. On SYN_DROPPED the pump discards the partial frame and
//! skips ahead to the next report boundary.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use bitflags::bitflags;
use rustix::fs::OFlags;
use rustix::io::Errno;
use tracing::debug;

use super::{Axis, DeviceEvent, Fixed, KeyState};
use crate::launch::DeviceOpener;

pub(crate) const EV_SYN: u16 = 0x00;
pub(crate) const EV_KEY: u16 = 0x01;
pub(crate) const EV_REL: u16 = 0x02;
pub(crate) const EV_ABS: u16 = 0x03;

pub(crate) const SYN_REPORT: u16 = 0x00;
pub(crate) const SYN_DROPPED: u16 = 0x03;

pub(crate) const REL_X: u16 = 0x00;
pub(crate) const REL_Y: u16 = 0x01;
pub(crate) const REL_HWHEEL: u16 = 0x06;
pub(crate) const REL_WHEEL: u16 = 0x08;

pub(crate) const ABS_X: u16 = 0x00;
pub(crate) const ABS_Y: u16 = 0x01;

pub(crate) const KEY_ENTER: u16 = 28;
pub(crate) const BTN_MISC: u16 = 0x100;
pub(crate) const BTN_MOUSE: u16 = 0x110;
pub(crate) const BTN_TOUCH: u16 = 0x14a;
pub(crate) const BTN_GEAR_UP: u16 = 0x151;
pub(crate) const BTN_TRIGGER_HAPPY: u16 = 0x2c0;
const KEY_MAX: u16 = 0x2ff;
const REL_MAX: u16 = 0x0f;
const ABS_MAX: u16 = 0x3f;

/// Wheel step in protocol units per detent.
const AXIS_STEP_DISTANCE: i32 = 10;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const KEYBOARD = 1 << 0;
        const POINTER = 1 << 1;
        const TOUCH = 1 << 2;
    }
}

const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u64, nr: u64, size: u64) -> u64 {
    (dir << 30) | (size << 16) | (ty << 8) | nr
}

const fn eviocgname(len: usize) -> u64 {
    ioc(IOC_READ, b'E' as u64, 0x06, len as u64)
}

const fn eviocgbit(ev: u16, len: usize) -> u64 {
    ioc(IOC_READ, b'E' as u64, 0x20 + ev as u64, len as u64)
}

fn bit_set(bits: &[u8], bit: u16) -> bool {
    let bit = bit as usize;
    bits.get(bit / 8).is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
}

fn timeval_to_msec(time: &libc::timeval) -> u32 {
    (time.tv_sec as u64)
        .wrapping_mul(1000)
        .wrapping_add(time.tv_usec as u64 / 1000) as u32
}

fn is_motion_event(event: &libc::input_event) -> bool {
    (event.type_ == EV_REL && (event.code == REL_X || event.code == REL_Y))
        || (event.type_ == EV_ABS && (event.code == ABS_X || event.code == ABS_Y))
}

#[derive(Debug, Default)]
struct RelMotion {
    dx: i32,
    dy: i32,
    pending: bool,
}

pub struct EvdevDevice {
    fd: OwnedFd,
    name: String,
    capabilities: Capabilities,
    motion: RelMotion,
    /// Set after SYN_DROPPED until the next SYN_REPORT is seen.
    syncing: bool,
}

impl EvdevDevice {
    pub fn open(opener: &mut dyn DeviceOpener, path: &Path) -> io::Result<Self> {
        let fd = opener.open_device(
            path,
            OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC | OFlags::NOCTTY,
        )?;

        let raw = fd.as_raw_fd();
        let mut name_buf = [0u8; 256];
        let name = if unsafe {
            libc::ioctl(raw, eviocgname(name_buf.len()) as _, name_buf.as_mut_ptr())
        } < 0
        {
            String::from("unknown")
        } else {
            let end = name_buf.iter().position(|&b| b == 0).unwrap_or(0);
            String::from_utf8_lossy(&name_buf[..end]).into_owned()
        };

        let mut key_bits = [0u8; (KEY_MAX as usize + 1).div_ceil(8)];
        let mut rel_bits = [0u8; (REL_MAX as usize + 1).div_ceil(8)];
        let mut abs_bits = [0u8; (ABS_MAX as usize + 1).div_ceil(8)];
        unsafe {
            libc::ioctl(raw, eviocgbit(EV_KEY, key_bits.len()) as _, key_bits.as_mut_ptr());
            libc::ioctl(raw, eviocgbit(EV_REL, rel_bits.len()) as _, rel_bits.as_mut_ptr());
            libc::ioctl(raw, eviocgbit(EV_ABS, abs_bits.len()) as _, abs_bits.as_mut_ptr());
        }

        let mut capabilities = Capabilities::empty();
        if bit_set(&key_bits, KEY_ENTER) {
            capabilities |= Capabilities::KEYBOARD;
        }
        if bit_set(&rel_bits, REL_X) && bit_set(&rel_bits, REL_Y) && bit_set(&key_bits, BTN_MOUSE) {
            capabilities |= Capabilities::POINTER;
        }
        if bit_set(&abs_bits, ABS_X) && bit_set(&abs_bits, ABS_Y) && bit_set(&key_bits, BTN_TOUCH) {
            capabilities |= Capabilities::TOUCH;
        }

        debug!("adding device {name} ({capabilities:?})");

        Ok(Self {
            fd,
            name,
            capabilities,
            motion: RelMotion::default(),
            syncing: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Duplicate of the device fd for event-loop registration.
    pub fn event_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    /// Drain all readable events, delivering semantic events to `sink`.
    /// An error other than EAGAIN means the device is gone and must be
    /// detached by the caller.
    pub fn dispatch(&mut self, sink: &mut dyn FnMut(DeviceEvent)) -> io::Result<()> {
        const EVENT_SIZE: usize = mem::size_of::<libc::input_event>();
        let mut buf = [0u8; 32 * EVENT_SIZE];
        let mut last_time = None;

        loop {
            let n = match rustix::io::read(&self.fd, &mut buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => n,
                Err(Errno::AGAIN) => break,
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            };

            for chunk in buf[..n].chunks_exact(EVENT_SIZE) {
                let event: libc::input_event =
                    unsafe { std::ptr::read_unaligned(chunk.as_ptr().cast()) };
                last_time = Some(timeval_to_msec(&event.time));
                self.process_event(&event, sink);
            }
        }

        // Flush a partial motion frame, but only if something was read at
        // all; there is no meaningful timestamp otherwise.
        if let Some(time) = last_time {
            self.flush_motion(time, sink);
        }
        Ok(())
    }

    fn process_event(&mut self, event: &libc::input_event, sink: &mut dyn FnMut(DeviceEvent)) {
        if self.syncing {
            if event.type_ == EV_SYN && event.code == SYN_REPORT {
                self.syncing = false;
            }
            return;
        }

        if event.type_ == EV_SYN && event.code == SYN_DROPPED {
            debug!("device {}: kernel dropped events, resyncing", self.name);
            self.motion = RelMotion::default();
            self.syncing = true;
            return;
        }

        if !is_motion_event(event) {
            self.flush_motion(timeval_to_msec(&event.time), sink);
        }

        match event.type_ {
            EV_KEY => self.handle_key_event(event, sink),
            EV_REL => self.handle_rel_event(event, sink),
            // Reserved for touch; not handled here.
            EV_ABS => {}
            _ => {}
        }
    }

    fn handle_key_event(&mut self, event: &libc::input_event, sink: &mut dyn FnMut(DeviceEvent)) {
        let time = timeval_to_msec(&event.time);
        let state = if event.value != 0 {
            KeyState::Pressed
        } else {
            KeyState::Released
        };

        if (BTN_MISC..=BTN_GEAR_UP).contains(&event.code) || event.code >= BTN_TRIGGER_HAPPY {
            sink(DeviceEvent::Button {
                time,
                button: event.code as u32,
                state,
            });
        } else {
            sink(DeviceEvent::Key {
                time,
                key: event.code as u32,
                state,
            });
        }
    }

    fn handle_rel_event(&mut self, event: &libc::input_event, sink: &mut dyn FnMut(DeviceEvent)) {
        let time = timeval_to_msec(&event.time);
        let (axis, amount) = match event.code {
            REL_X => {
                self.motion.dx += event.value;
                self.motion.pending = true;
                return;
            }
            REL_Y => {
                self.motion.dy += event.value;
                self.motion.pending = true;
                return;
            }
            // Vertical wheel is inverted so that scrolling down is positive.
            REL_WHEEL => (
                Axis::Vertical,
                Fixed::from_int(-AXIS_STEP_DISTANCE * event.value),
            ),
            REL_HWHEEL => (
                Axis::Horizontal,
                Fixed::from_int(AXIS_STEP_DISTANCE * event.value),
            ),
            _ => return,
        };

        sink(DeviceEvent::Axis { time, axis, amount });
    }

    fn flush_motion(&mut self, time: u32, sink: &mut dyn FnMut(DeviceEvent)) {
        if !self.motion.pending {
            return;
        }
        let motion = mem::take(&mut self.motion);
        sink(DeviceEvent::RelativeMotion {
            time,
            dx: Fixed::from_int(motion.dx),
            dy: Fixed::from_int(motion.dy),
        });
    }
}
