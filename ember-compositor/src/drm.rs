// SPDX-License-Identifier: MPL-2.0-only

//! KMS session: DRM master ownership, output enumeration and the page-flip
//! event pump.
//!
//! Framebuffer allocation and the actual flip ioctl live behind the
//! [`PlaneFactory`]/[`Plane`](crate::scene::Plane) collaborators; this module
//! only decides which connector drives which CRTC and turns completed flips
//! back into output identities.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use drm::control::{connector, crtc, Device as ControlDevice, Event, Mode, ModeTypeFlags};
use drm::Device as BasicDevice;
use rustix::fs::OFlags;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::launch::DeviceOpener;
use crate::region::Rect;
use crate::scene::{Output, OutputId, Plane};

struct Card(OwnedFd);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for Card {}
impl ControlDevice for Card {}

/// Creates the double-buffered scan-out plane for one CRTC. Implemented by
/// the GBM-backed framebuffer allocator.
pub trait PlaneFactory {
    fn create_plane(
        &mut self,
        drm: BorrowedFd<'_>,
        crtc: crtc::Handle,
        mode: &Mode,
    ) -> io::Result<Box<dyn Plane>>;
}

#[derive(Debug, Error)]
pub enum DrmError {
    #[error("failed to open drm device {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to become drm master: {0}")]
    Master(#[source] io::Error),
    #[error("failed to enumerate drm resources: {0}")]
    Resources(#[source] io::Error),
    #[error("failed to create a scan-out plane for {connector}: {source}")]
    Plane {
        connector: String,
        source: io::Error,
    },
    #[error("no connected outputs")]
    NoOutputs,
}

/// A completed page flip, translated to the output it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct PageFlip {
    pub output: OutputId,
    pub time_ms: u32,
}

/// DRM master handoff, driven by the VT state machine. Failures are logged,
/// not propagated: a session that cannot reacquire master simply keeps
/// failing its flips until the next handoff.
pub trait MasterControl {
    /// Reclaim master after the session regains the VT.
    fn set_master(&mut self);
    /// Give up master so the next VT owner can modeset.
    fn drop_master(&mut self);
}

/// Holds KMS master on the seat's primary DRM device.
pub struct DrmSession {
    card: Card,
    crtcs: HashMap<crtc::Handle, OutputId>,
    master: bool,
}

impl DrmSession {
    pub fn open(opener: &mut dyn DeviceOpener, path: &Path) -> Result<Self, DrmError> {
        let fd = opener
            .open_device(path, OFlags::RDWR | OFlags::NONBLOCK)
            .map_err(|source| DrmError::Open {
                path: path.to_owned(),
                source,
            })?;
        let card = Card(fd);
        card.acquire_master_lock().map_err(DrmError::Master)?;
        info!("drm master on {}", path.display());

        Ok(Self {
            card,
            crtcs: HashMap::new(),
            master: true,
        })
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    /// Duplicate of the card fd for event-loop registration.
    pub fn event_fd(&self) -> io::Result<OwnedFd> {
        self.card.0.try_clone()
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }

    /// Enumerate connected connectors into outputs, left to right in a shared
    /// coordinate space, asking `planes` for each output's scan-out plane.
    pub fn create_outputs(&mut self, planes: &mut dyn PlaneFactory) -> Result<Vec<Output>, DrmError> {
        let resources = self.card.resource_handles().map_err(DrmError::Resources)?;

        let mut outputs = Vec::new();
        let mut taken = Vec::new();
        let mut x = 0;

        for handle in resources.connectors() {
            let info = match self.card.get_connector(*handle, false) {
                Ok(info) => info,
                Err(err) => {
                    warn!("skipping unreadable connector: {err}");
                    continue;
                }
            };
            if info.state() != connector::State::Connected {
                continue;
            }
            let name = format!("{:?}-{}", info.interface(), info.interface_id());

            let Some(mode) = preferred_mode(info.modes()) else {
                warn!("connector {name} has no modes");
                continue;
            };
            let Some(crtc) = self.pick_crtc(&resources, &info, &taken) else {
                warn!("no free crtc for connector {name}");
                continue;
            };
            taken.push(crtc);

            let plane = planes
                .create_plane(self.card.as_fd(), crtc, &mode)
                .map_err(|source| DrmError::Plane {
                    connector: name.clone(),
                    source,
                })?;

            let id = OutputId::new(outputs.len());
            let (w, h) = mode.size();
            let geometry = Rect::new(x, 0, w as i32, h as i32);
            x += w as i32;

            info!("output {name}: {}x{}@{}", w, h, mode.vrefresh());
            self.crtcs.insert(crtc, id);
            outputs.push(Output::new(id, geometry, plane));
        }

        if outputs.is_empty() {
            return Err(DrmError::NoOutputs);
        }
        Ok(outputs)
    }

    fn pick_crtc(
        &self,
        resources: &drm::control::ResourceHandles,
        info: &connector::Info,
        taken: &[crtc::Handle],
    ) -> Option<crtc::Handle> {
        // Prefer the CRTC the connector is already routed to.
        if let Some(encoder) = info.current_encoder() {
            if let Ok(encoder) = self.card.get_encoder(encoder) {
                if let Some(crtc) = encoder.crtc() {
                    if !taken.contains(&crtc) {
                        return Some(crtc);
                    }
                }
            }
        }

        for encoder in info.encoders() {
            if let Ok(encoder) = self.card.get_encoder(*encoder) {
                for crtc in resources.filter_crtcs(encoder.possible_crtcs()) {
                    if !taken.contains(&crtc) {
                        return Some(crtc);
                    }
                }
            }
        }
        None
    }

    /// Drain pending DRM events. A page flip for a CRTC this session never
    /// configured is a programmer error.
    pub fn dispatch(&mut self) -> io::Result<Vec<PageFlip>> {
        let mut flips = Vec::new();
        for event in self.card.receive_events()? {
            match event {
                Event::PageFlip(flip) => {
                    let output = *self
                        .crtcs
                        .get(&flip.crtc)
                        .unwrap_or_else(|| panic!("page flip for unknown crtc {:?}", flip.crtc));
                    flips.push(PageFlip {
                        output,
                        time_ms: flip.duration.as_millis() as u32,
                    });
                }
                Event::Vblank(_) => {}
                _ => debug!("ignoring unknown drm event"),
            }
        }
        Ok(flips)
    }
}

impl MasterControl for DrmSession {
    fn set_master(&mut self) {
        match self.card.acquire_master_lock() {
            Ok(()) => self.master = true,
            Err(err) => error!("failed to reacquire drm master: {err}"),
        }
    }

    fn drop_master(&mut self) {
        match self.card.release_master_lock() {
            Ok(()) => self.master = false,
            Err(err) => error!("failed to release drm master: {err}"),
        }
    }
}

impl Drop for DrmSession {
    fn drop(&mut self) {
        if self.master {
            let _ = self.card.release_master_lock();
        }
    }
}

fn preferred_mode(modes: &[Mode]) -> Option<Mode> {
    modes
        .iter()
        .find(|mode| mode.mode_type().contains(ModeTypeFlags::PREFERRED))
        .or_else(|| modes.first())
        .copied()
}
