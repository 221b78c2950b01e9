// SPDX-License-Identifier: MPL-2.0-only

//! The seat: input devices, keyboard and pointer state, focus.

pub mod evdev;
pub mod keyboard;

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use crate::launch::{DeviceOpener, DeviceScanner};
use crate::region::Region;
use crate::scene::SurfaceId;
use ember_compositor_config::CompositorConfig;

pub use evdev::{Capabilities, EvdevDevice};
pub use keyboard::{Keyboard, Modifiers};

/// 24.8 signed fixed-point, the protocol's coordinate and axis unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(i32);

impl Fixed {
    pub const fn from_int(value: i32) -> Self {
        Fixed(value << 8)
    }

    pub const fn to_int(self) -> i32 {
        self.0 >> 8
    }

    pub const fn from_raw(raw: i32) -> Self {
        Fixed(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Pressed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Vertical,
    Horizontal,
}

/// Semantic input produced by one evdev device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Key {
        time: u32,
        key: u32,
        state: KeyState,
    },
    Button {
        time: u32,
        button: u32,
        state: KeyState,
    },
    Axis {
        time: u32,
        axis: Axis,
        amount: Fixed,
    },
    RelativeMotion {
        time: u32,
        dx: Fixed,
        dy: Fixed,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u32);

#[derive(Debug, Error)]
pub enum SeatError {
    #[error("failed to compile a keymap from the configured names")]
    Keymap,
    #[error("input device discovery failed: {0}")]
    Discover(#[source] io::Error),
}

/// Delivery of input to client resources; the protocol dispatcher's side of
/// the seat. All methods default to dropping the event so hosts implement
/// only what they surface.
pub trait InputForwarder {
    fn key(&mut self, _surface: SurfaceId, _time: u32, _key: u32, _state: KeyState) {}
    fn button(&mut self, _surface: SurfaceId, _time: u32, _button: u32, _state: KeyState) {}
    fn axis(&mut self, _surface: SurfaceId, _time: u32, _axis: Axis, _amount: Fixed) {}
    fn motion(&mut self, _surface: SurfaceId, _time: u32, _x: Fixed, _y: Fixed) {}
    fn focus_changed(&mut self, _old: Option<SurfaceId>, _new: Option<SurfaceId>) {}
}

/// Pointer half of the seat. The position is clamped to the pointer region,
/// the union of all output geometries.
pub struct Pointer {
    x: Fixed,
    y: Fixed,
    region: Region,
    pub(crate) focus: Option<SurfaceId>,
}

impl Pointer {
    fn new() -> Self {
        Self {
            x: Fixed::from_int(0),
            y: Fixed::from_int(0),
            region: Region::new(),
            focus: None,
        }
    }

    pub fn position(&self) -> (Fixed, Fixed) {
        (self.x, self.y)
    }

    pub fn focus(&self) -> Option<SurfaceId> {
        self.focus
    }

    pub(crate) fn set_region(&mut self, region: Region) {
        self.region = region;
        self.clamp();
    }

    pub(crate) fn motion(&mut self, dx: Fixed, dy: Fixed) -> (i32, i32) {
        self.x = Fixed::from_raw(self.x.raw().saturating_add(dx.raw()));
        self.y = Fixed::from_raw(self.y.raw().saturating_add(dy.raw()));
        self.clamp();
        (self.x.to_int(), self.y.to_int())
    }

    fn clamp(&mut self) {
        let extents = self.region.extents();
        if extents.is_empty() {
            return;
        }
        self.x = self.x.clamp(
            Fixed::from_int(extents.x),
            Fixed::from_int(extents.x + extents.w - 1),
        );
        self.y = self.y.clamp(
            Fixed::from_int(extents.y),
            Fixed::from_int(extents.y + extents.h - 1),
        );
    }
}

/// Aggregates the input devices of one seat and the keyboard/pointer state
/// derived from them.
pub struct Seat {
    name: String,
    pub(crate) keyboard: Keyboard,
    pub(crate) pointer: Pointer,
    pub(crate) keyboard_focus: Option<SurfaceId>,
    devices: Vec<(DeviceId, EvdevDevice)>,
    next_device: u32,
}

impl Seat {
    pub fn new(
        config: &CompositorConfig,
        opener: &mut dyn DeviceOpener,
        scanner: &mut dyn DeviceScanner,
    ) -> Result<Self, SeatError> {
        let keyboard = Keyboard::new(&config.xkb)?;

        let mut seat = Self {
            name: config.seat.clone(),
            keyboard,
            pointer: Pointer::new(),
            keyboard_focus: None,
            devices: Vec::new(),
            next_device: 0,
        };

        let paths = scanner
            .input_devices(&config.seat)
            .map_err(SeatError::Discover)?;
        for path in paths {
            seat.add_device(opener, path);
        }
        info!("seat {}: {} input devices", seat.name, seat.devices.len());

        Ok(seat)
    }

    fn add_device(&mut self, opener: &mut dyn DeviceOpener, path: PathBuf) {
        match EvdevDevice::open(opener, &path) {
            Ok(device) => {
                self.devices.push((DeviceId(self.next_device), device));
                self.next_device += 1;
            }
            Err(err) => {
                warn!("failed to open input device {}: {}", path.display(), err);
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pointer(&self) -> &Pointer {
        &self.pointer
    }

    pub fn keyboard_focus(&self) -> Option<SurfaceId> {
        self.keyboard_focus
    }

    pub fn set_keyboard_focus(&mut self, focus: Option<SurfaceId>) {
        self.keyboard_focus = focus;
    }

    pub(crate) fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|(id, _)| *id).collect()
    }

    pub(crate) fn device_mut(&mut self, id: DeviceId) -> Option<&mut EvdevDevice> {
        self.devices
            .iter_mut()
            .find(|(d, _)| *d == id)
            .map(|(_, device)| device)
    }

    pub(crate) fn remove_device(&mut self, id: DeviceId) {
        if let Some(index) = self.devices.iter().position(|(d, _)| *d == id) {
            let (_, device) = self.devices.remove(index);
            info!("removed input device {}", device.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Rect;

    #[test]
    fn fixed_point_round_trips_integers() {
        assert_eq!(Fixed::from_int(42).to_int(), 42);
        assert_eq!(Fixed::from_int(-3).to_int(), -3);
        assert_eq!(Fixed::from_int(1).raw(), 256);
    }

    #[test]
    fn pointer_clamps_to_region_extents() {
        let mut pointer = Pointer::new();
        let mut region = Region::from_rect(Rect::new(0, 0, 100, 100));
        region.union_rect(&Rect::new(100, 0, 100, 100));
        pointer.set_region(region);

        let (x, y) = pointer.motion(Fixed::from_int(500), Fixed::from_int(50));
        assert_eq!((x, y), (199, 50));

        let (x, y) = pointer.motion(Fixed::from_int(-1000), Fixed::from_int(-1000));
        assert_eq!((x, y), (0, 0));
    }

    #[test]
    fn pointer_without_region_does_not_clamp() {
        let mut pointer = Pointer::new();
        let (x, y) = pointer.motion(Fixed::from_int(10), Fixed::from_int(20));
        assert_eq!((x, y), (10, 20));
    }
}
