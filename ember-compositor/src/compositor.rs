// SPDX-License-Identifier: MPL-2.0-only

//! Compositor wiring: event sources, key bindings and the VT/DRM coupling.
//!
//! [`Compositor`] is the event loop's data type. Construction acquires the
//! VT, the seat and DRM master, enumerates outputs and registers every fd
//! source; the host then runs the loop until a binding or the host itself
//! stops it. Construction failure unwinds in reverse order through the
//! subsystems' `Drop` impls, restoring the console.

use std::io;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use calloop::generic::Generic;
use calloop::{Interest, LoopHandle, LoopSignal, Mode as TriggerMode, PostAction};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use xkbcommon::xkb::Keysym;

use crate::drm::{DrmError, DrmSession, MasterControl, PageFlip, PlaneFactory};
use crate::input::{
    DeviceEvent, DeviceId, Fixed, InputForwarder, KeyState, Modifiers, Seat, SeatError,
};
use crate::launch::{DeviceOpener, DeviceScanner};
use crate::region::Region;
use crate::scene::{Output, OutputId, Renderer, Scene, Surface, SurfaceId};
use crate::tty::{Tty, TtyError, VtEvent};
use ember_compositor_config::CompositorConfig;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("tty initialization failed: {0}")]
    Tty(#[from] TtyError),
    #[error("seat initialization failed: {0}")]
    Seat(#[from] SeatError),
    #[error("drm initialization failed: {0}")]
    Drm(#[from] DrmError),
    #[error("drm device discovery failed: {0}")]
    Discovery(#[source] io::Error),
    #[error("event source registration failed: {0}")]
    EventSource(#[source] calloop::Error),
}

/// Modifier requirement of a key binding. `Any` matches every modifier
/// state and bypasses the consumed-modifier adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingFilter {
    Any,
    Mods(Modifiers),
}

pub type BindingHandler = dyn Fn(&mut Compositor, u32, Keysym);

#[derive(Clone)]
pub enum Action {
    /// Stop the event loop.
    Terminate,
    /// Switch to the given VT.
    SwitchVt(u16),
    Custom(Rc<BindingHandler>),
}

#[derive(Clone)]
pub struct Binding {
    pub keysym: Keysym,
    pub filter: BindingFilter,
    pub action: Action,
}

/// The external collaborators the core drives through narrow interfaces.
pub struct Backend {
    pub opener: Box<dyn DeviceOpener>,
    pub scanner: Box<dyn DeviceScanner>,
    pub planes: Box<dyn PlaneFactory>,
    pub renderer: Box<dyn Renderer>,
    pub forwarder: Option<Box<dyn InputForwarder>>,
}

pub struct Compositor {
    handle: LoopHandle<'static, Compositor>,
    signal: LoopSignal,
    scene: Scene,
    seat: Seat,
    tty: Tty,
    drm: DrmSession,
    renderer: Box<dyn Renderer>,
    forwarder: Option<Box<dyn InputForwarder>>,
    key_bindings: Vec<Binding>,
}

impl Compositor {
    pub fn new(
        handle: LoopHandle<'static, Compositor>,
        signal: LoopSignal,
        config: &CompositorConfig,
        backend: Backend,
    ) -> Result<Self, InitError> {
        let Backend {
            mut opener,
            mut scanner,
            mut planes,
            renderer,
            forwarder,
        } = backend;

        let tty = Tty::new(opener.as_mut(), config.vt)?;
        let mut seat = Seat::new(config, opener.as_mut(), scanner.as_mut())?;

        let drm_path = scanner
            .primary_drm(&config.seat)
            .map_err(InitError::Discovery)?;
        let mut drm = DrmSession::open(opener.as_mut(), &drm_path)?;
        let outputs = drm.create_outputs(planes.as_mut())?;

        let mut scene = Scene::new();
        let mut pointer_region = Region::new();
        for output in outputs {
            pointer_region.union_rect(&output.geometry());
            scene.add_output(output);
        }
        seat.pointer.set_region(pointer_region);

        let mut compositor = Self {
            handle: handle.clone(),
            signal,
            scene,
            seat,
            tty,
            drm,
            renderer,
            forwarder,
            key_bindings: default_bindings(),
        };

        compositor.register_sources(&handle)?;

        // The scan-out buffers start with undefined content; paint every
        // output once the loop comes up.
        compositor.scene.damage_all_outputs();
        for output in compositor.output_ids() {
            compositor.schedule_update(output);
        }

        Ok(compositor)
    }

    fn register_sources(&mut self, handle: &LoopHandle<'static, Compositor>) -> Result<(), InitError> {
        handle
            .insert_source(fd_source(self.tty.event_fd())?, |_, _, compositor| {
                match compositor.tty.dispatch() {
                    Ok(events) => {
                        for event in events {
                            compositor.handle_vt_event(event);
                        }
                    }
                    Err(err) => warn!("vt signal dispatch failed: {err}"),
                }
                Ok(PostAction::Continue)
            })
            .map_err(|err| InitError::EventSource(err.into()))?;

        handle
            .insert_source(fd_source(self.drm.event_fd())?, |_, _, compositor| {
                match compositor.drm.dispatch() {
                    Ok(flips) => {
                        for flip in flips {
                            compositor.handle_page_flip(flip);
                        }
                    }
                    Err(err) => warn!("drm event dispatch failed: {err}"),
                }
                Ok(PostAction::Continue)
            })
            .map_err(|err| InitError::EventSource(err.into()))?;

        let mut device_fds = Vec::new();
        for id in self.seat.device_ids() {
            if let Some(device) = self.seat.device_mut(id) {
                device_fds.push((id, device.event_fd()));
            }
        }
        for (id, fd) in device_fds {
            handle
                .insert_source(fd_source(fd)?, move |_, _, compositor| {
                    Ok(compositor.dispatch_device(id))
                })
                .map_err(|err| InitError::EventSource(err.into()))?;
        }

        Ok(())
    }

    pub fn seat(&self) -> &Seat {
        &self.seat
    }

    pub fn seat_mut(&mut self) -> &mut Seat {
        &mut self.seat
    }

    pub fn outputs(&self) -> &[Output] {
        self.scene.outputs()
    }

    pub fn output_ids(&self) -> Vec<OutputId> {
        self.scene.output_ids()
    }

    /// Create a surface at the top of the stack (the surface collaborator's
    /// on-attach hook).
    pub fn create_surface(&mut self) -> SurfaceId {
        self.scene.create_surface()
    }

    pub fn destroy_surface(&mut self, id: SurfaceId) {
        if self.seat.pointer.focus == Some(id) {
            self.seat.pointer.focus = None;
            if let Some(forwarder) = self.forwarder.as_mut() {
                forwarder.focus_changed(Some(id), None);
            }
        }
        if self.seat.keyboard_focus == Some(id) {
            self.seat.keyboard_focus = None;
        }
        self.scene.destroy_surface(id);
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.scene.surface(id)
    }

    pub fn surface_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.scene.surface_mut(id)
    }

    /// Mark `output` for repaint; coalesced onto a single idle task that runs
    /// before the loop next blocks.
    pub fn schedule_update(&mut self, output: OutputId) {
        if self.scene.schedule_update(output) {
            self.handle.insert_idle(|compositor| compositor.perform_update());
        }
    }

    /// Append a key binding. Bindings are matched in insertion order; the
    /// first match wins.
    pub fn add_key_binding(&mut self, filter: BindingFilter, keysym: Keysym, action: Action) {
        self.key_bindings.push(Binding {
            keysym,
            filter,
            action,
        });
    }

    fn perform_update(&mut self) {
        let Compositor {
            scene, renderer, ..
        } = self;
        scene.perform_update(renderer.as_mut());
    }

    fn handle_vt_event(&mut self, event: VtEvent) {
        if apply_vt_event(&mut self.scene, &mut self.drm, event) {
            self.handle.insert_idle(|compositor| compositor.perform_update());
        }
    }

    fn handle_page_flip(&mut self, flip: PageFlip) {
        let Compositor {
            scene, renderer, ..
        } = self;
        apply_page_flip(scene, renderer.as_mut(), flip);
    }

    fn dispatch_device(&mut self, id: DeviceId) -> PostAction {
        let Some(device) = self.seat.device_mut(id) else {
            return PostAction::Remove;
        };

        let mut events = Vec::new();
        let result = device.dispatch(&mut |event| events.push(event));
        for event in events {
            self.handle_input_event(event);
        }

        match result {
            Ok(()) => PostAction::Continue,
            Err(err) => {
                // The device is gone; detach it without tearing anything
                // else down.
                warn!("input device error, removing: {err}");
                self.seat.remove_device(id);
                PostAction::Remove
            }
        }
    }

    fn handle_input_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Key { time, key, state } => self.on_key(time, key, state),
            DeviceEvent::Button {
                time,
                button,
                state,
            } => {
                if let (Some(focus), Some(forwarder)) =
                    (self.seat.pointer.focus, self.forwarder.as_mut())
                {
                    forwarder.button(focus, time, button, state);
                }
            }
            DeviceEvent::Axis { time, axis, amount } => {
                if let (Some(focus), Some(forwarder)) =
                    (self.seat.pointer.focus, self.forwarder.as_mut())
                {
                    forwarder.axis(focus, time, axis, amount);
                }
            }
            DeviceEvent::RelativeMotion { time, dx, dy } => {
                self.on_relative_motion(time, dx, dy);
            }
        }
    }

    fn on_key(&mut self, time: u32, key: u32, state: KeyState) {
        self.seat.keyboard.update_key(key, state);

        if state == KeyState::Pressed {
            let keysym = self.seat.keyboard.keysym(key);
            let modifiers = self.seat.keyboard.binding_modifiers(key);
            if let Some(binding) = match_binding(&self.key_bindings, keysym, modifiers) {
                debug!("key binding handled {keysym:?}");
                let action = binding.action.clone();
                self.run_action(action, time, keysym);
                return;
            }
        }

        if let (Some(focus), Some(forwarder)) = (self.seat.keyboard_focus, self.forwarder.as_mut())
        {
            forwarder.key(focus, time, key, state);
        }
    }

    fn run_action(&mut self, action: Action, time: u32, keysym: Keysym) {
        match action {
            Action::Terminate => {
                info!("terminate binding pressed, stopping the loop");
                self.signal.stop();
            }
            Action::SwitchVt(vt) => {
                if let Err(err) = self.tty.switch_vt(vt) {
                    error!("vt switch to {vt} failed: {err}");
                }
            }
            Action::Custom(handler) => handler(self, time, keysym),
        }
    }

    fn on_relative_motion(&mut self, time: u32, dx: Fixed, dy: Fixed) {
        let (x, y) = self.seat.pointer.motion(dx, dy);

        // Focus follows the topmost surface whose input region contains the
        // pointer.
        let focus = self.scene.surface_at(x, y);
        if focus != self.seat.pointer.focus {
            let old = self.seat.pointer.focus;
            self.seat.pointer.focus = focus;
            if let Some(forwarder) = self.forwarder.as_mut() {
                forwarder.focus_changed(old, focus);
            }
        }

        if let (Some(focus), Some(forwarder)) = (self.seat.pointer.focus, self.forwarder.as_mut())
        {
            let (x, y) = self.seat.pointer.position();
            forwarder.motion(focus, time, x, y);
        }
    }
}

fn fd_source(fd: io::Result<OwnedFd>) -> Result<Generic<OwnedFd>, InitError> {
    let fd = fd.map_err(|err| InitError::EventSource(err.into()))?;
    Ok(Generic::new(fd, Interest::READ, TriggerMode::Level))
}

/// The VT/DRM state machine. Leave drops master and lets damage keep
/// accruing; Enter reclaims master and forces a full-screen repaint of every
/// output. Returns true when the caller must enqueue the one-shot update
/// task. Pending flips are left untouched in both directions.
fn apply_vt_event(scene: &mut Scene, drm: &mut dyn MasterControl, event: VtEvent) -> bool {
    match event {
        VtEvent::Leave => {
            info!("vt leave, dropping drm master");
            drm.drop_master();
            false
        }
        VtEvent::Enter => {
            info!("vt enter, reclaiming drm master");
            drm.set_master();
            // The other VT owner scribbled over the scan-out buffers;
            // repaint every output from scratch.
            scene.damage_all_outputs();
            let mut needs_task = false;
            for output in scene.output_ids() {
                needs_task |= scene.schedule_update(output);
            }
            needs_task
        }
    }
}

/// Flip completion: release the output and run any updates that were blocked
/// on it. The caller is already inside a callback, so the update runs
/// directly instead of queueing another idle task.
fn apply_page_flip(scene: &mut Scene, renderer: &mut dyn Renderer, flip: PageFlip) {
    scene.complete_flip(flip.output, flip.time_ms);
    if scene.has_scheduled_updates() {
        scene.perform_update(renderer);
    }
}

/// First binding whose keysym matches and whose filter accepts the (already
/// consumed-adjusted) modifier state.
fn match_binding(bindings: &[Binding], keysym: Keysym, modifiers: Modifiers) -> Option<&Binding> {
    bindings.iter().find(|binding| {
        binding.keysym == keysym
            && match binding.filter {
                BindingFilter::Any => true,
                BindingFilter::Mods(required) => required == modifiers,
            }
    })
}

fn default_bindings() -> Vec<Binding> {
    let mut bindings = vec![Binding {
        keysym: Keysym::BackSpace,
        filter: BindingFilter::Mods(Modifiers::CTRL | Modifiers::ALT),
        action: Action::Terminate,
    }];

    for vt in 1..=12u16 {
        bindings.push(Binding {
            keysym: Keysym::from(Keysym::XF86_Switch_VT_1.raw() + u32::from(vt) - 1),
            filter: BindingFilter::Any,
            action: Action::SwitchVt(vt),
        });
    }
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Rect;
    use crate::scene::fakes::{rect_region, scene_with_outputs, FakeRenderer};

    #[derive(Default)]
    struct FakeMaster {
        master: bool,
        sets: u32,
        drops: u32,
    }

    impl MasterControl for FakeMaster {
        fn set_master(&mut self) {
            self.master = true;
            self.sets += 1;
        }

        fn drop_master(&mut self) {
            self.master = false;
            self.drops += 1;
        }
    }

    #[test]
    fn vt_leave_enter_around_pending_flip() {
        let (mut scene, ids, planes) = scene_with_outputs(&[Rect::new(0, 0, 640, 480)]);
        let mut renderer = FakeRenderer::default();
        let mut master = FakeMaster {
            master: true,
            ..Default::default()
        };

        let surface = scene.create_surface();
        let s = scene.surface_mut(surface).unwrap();
        s.set_geometry(Rect::new(10, 10, 50, 50));
        s.state.damage = rect_region(0, 0, 50, 50);

        scene.schedule_update(ids[0]);
        scene.perform_update(&mut renderer);
        assert!(scene.pending_flips().contains(ids[0]));
        assert_eq!(planes[0].flips.get(), 1);

        // Leave: master goes away, the in-flight flip stays recorded.
        assert!(!apply_vt_event(&mut scene, &mut master, VtEvent::Leave));
        assert!(!master.master);
        assert!(scene.pending_flips().contains(ids[0]));

        // Enter: master is back and every output is scheduled for a full
        // repaint, with pending flips still untouched.
        assert!(apply_vt_event(&mut scene, &mut master, VtEvent::Enter));
        assert!(master.master);
        assert!(scene.pending_flips().contains(ids[0]));
        assert!(scene.has_scheduled_updates());

        // The update task runs but stays blocked behind the in-flight flip.
        scene.perform_update(&mut renderer);
        assert_eq!(planes[0].flips.get(), 1);

        // The queued completion arrives and re-enters the update directly,
        // repainting the whole screen.
        apply_page_flip(
            &mut scene,
            &mut renderer,
            PageFlip {
                output: ids[0],
                time_ms: 7,
            },
        );
        assert_eq!(planes[0].flips.get(), 2);
        assert!(scene.pending_flips().contains(ids[0]));
        assert!(!scene.has_scheduled_updates());
        let repaints = renderer.repaints.borrow();
        assert!(repaints
            .last()
            .unwrap()
            .damage
            .covers(&rect_region(0, 0, 640, 480)));
    }

    #[test]
    fn vt_enter_without_pending_flip_repaints_every_output() {
        let (mut scene, _ids, planes) =
            scene_with_outputs(&[Rect::new(0, 0, 100, 100), Rect::new(100, 0, 100, 100)]);
        let mut renderer = FakeRenderer::default();
        let mut master = FakeMaster {
            master: true,
            ..Default::default()
        };

        apply_vt_event(&mut scene, &mut master, VtEvent::Leave);
        assert!(apply_vt_event(&mut scene, &mut master, VtEvent::Enter));
        assert_eq!((master.drops, master.sets), (1, 1));

        scene.perform_update(&mut renderer);
        assert_eq!(planes[0].flips.get(), 1);
        assert_eq!(planes[1].flips.get(), 1);
        let repaints = renderer.repaints.borrow();
        assert!(repaints[0].damage.same_coverage(&rect_region(0, 0, 100, 100)));
        assert!(repaints[1].damage.same_coverage(&rect_region(100, 0, 100, 100)));
    }

    #[test]
    fn vt_enter_reuses_an_already_queued_update_task() {
        let (mut scene, ids, _planes) = scene_with_outputs(&[Rect::new(0, 0, 100, 100)]);
        let mut master = FakeMaster {
            master: true,
            ..Default::default()
        };

        // A task is already outstanding for this output.
        assert!(scene.schedule_update(ids[0]));
        assert!(!apply_vt_event(&mut scene, &mut master, VtEvent::Enter));
    }

    fn binding(keysym: Keysym, filter: BindingFilter) -> Binding {
        Binding {
            keysym,
            filter,
            action: Action::Terminate,
        }
    }

    #[test]
    fn exact_filter_requires_equal_modifiers() {
        let bindings = vec![binding(
            Keysym::a,
            BindingFilter::Mods(Modifiers::CTRL),
        )];

        assert!(match_binding(&bindings, Keysym::a, Modifiers::CTRL).is_some());
        assert!(match_binding(&bindings, Keysym::a, Modifiers::CTRL | Modifiers::SHIFT).is_none());
        assert!(match_binding(&bindings, Keysym::a, Modifiers::empty()).is_none());
        assert!(match_binding(&bindings, Keysym::b, Modifiers::CTRL).is_none());
    }

    #[test]
    fn any_filter_matches_every_modifier_state() {
        let bindings = vec![binding(Keysym::XF86_Switch_VT_3, BindingFilter::Any)];

        for modifiers in [
            Modifiers::empty(),
            Modifiers::CTRL | Modifiers::ALT,
            Modifiers::SHIFT,
        ] {
            assert!(match_binding(&bindings, Keysym::XF86_Switch_VT_3, modifiers).is_some());
        }
    }

    #[test]
    fn consumed_adjusted_mask_matches_exact_binding() {
        // A Shift-sensitive keysym with Shift consumed: the caller passes
        // CTRL alone, so a plain CTRL binding matches even though Shift is
        // physically held.
        let bindings = vec![binding(
            Keysym::A,
            BindingFilter::Mods(Modifiers::CTRL),
        )];
        let adjusted = (Modifiers::CTRL | Modifiers::SHIFT) - Modifiers::SHIFT;
        assert!(match_binding(&bindings, Keysym::A, adjusted).is_some());
    }

    #[test]
    fn first_matching_binding_wins() {
        let bindings = vec![
            binding(Keysym::a, BindingFilter::Any),
            binding(Keysym::a, BindingFilter::Mods(Modifiers::CTRL)),
        ];
        let found = match_binding(&bindings, Keysym::a, Modifiers::CTRL).unwrap();
        assert_eq!(found.filter, BindingFilter::Any);
    }

    #[test]
    fn default_bindings_cover_terminate_and_vt_switch() {
        let bindings = default_bindings();

        let terminate = match_binding(
            &bindings,
            Keysym::BackSpace,
            Modifiers::CTRL | Modifiers::ALT,
        )
        .unwrap();
        assert!(matches!(terminate.action, Action::Terminate));
        // Without the exact modifiers the terminate binding must not fire.
        assert!(match_binding(&bindings, Keysym::BackSpace, Modifiers::CTRL).is_none());

        let switch = match_binding(&bindings, Keysym::XF86_Switch_VT_5, Modifiers::SHIFT).unwrap();
        assert!(matches!(switch.action, Action::SwitchVt(5)));
    }
}
