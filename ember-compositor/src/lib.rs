// SPDX-License-Identifier: MPL-2.0-only

//! A kernel-modesetting compositor core.
//!
//! The crate drives a set of physical outputs through DRM/KMS, composites
//! client surfaces into them with per-output damage tracking, and routes
//! evdev input to the focused surface. Three asynchronous streams feed one
//! single-threaded [`calloop`] event loop: surface commits, VT switches and
//! completed page flips.
//!
//! The Wayland wire protocol, the renderer and the framebuffer allocator are
//! external collaborators behind narrow traits ([`scene::Renderer`],
//! [`scene::Plane`], [`drm::PlaneFactory`], [`launch::DeviceOpener`]); a host
//! wires them up in a [`compositor::Backend`] and owns the event loop:
//!
//! ```no_run
//! # fn host(backend: ember_compositor::Backend) -> anyhow::Result<()> {
//! let mut event_loop = calloop::EventLoop::try_new()?;
//! let config = ember_compositor_config::CompositorConfig::load()?;
//! let mut compositor = ember_compositor::Compositor::new(
//!     event_loop.handle(),
//!     event_loop.get_signal(),
//!     &config,
//!     backend,
//! )?;
//! event_loop.run(None, &mut compositor, |_| {})?;
//! # Ok(())
//! # }
//! ```

pub mod compositor;
pub mod drm;
pub mod input;
pub mod launch;
pub mod region;
pub mod scene;
pub mod tty;

pub use compositor::{Action, Backend, Binding, BindingFilter, Compositor, InitError};
pub use input::{Axis, Fixed, InputForwarder, KeyState, Modifiers, Seat};
pub use region::{Rect, Region};
pub use scene::{Output, OutputId, Plane, Renderer, Surface, SurfaceId};
