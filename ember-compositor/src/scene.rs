// SPDX-License-Identifier: MPL-2.0-only

//! Surface stack, per-output damage accounting and flip bookkeeping.
//!
//! This is the frame pipeline: surface commits accumulate damage, an idle
//! task turns the accumulated damage into per-output repaints, and page-flip
//! completions release the outputs for the next cycle. Everything here runs
//! on the event-loop thread; none of it touches hardware directly.

use std::io;
use std::mem;

use tracing::{debug, warn};

use crate::region::{Rect, Region};

/// Identity of one output. Internally a bit position in [`OutputSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(u8);

impl OutputId {
    pub(crate) fn new(index: usize) -> Self {
        assert!(index < 32, "more outputs than the flip mask can track");
        Self(index as u8)
    }
}

/// A set of outputs, used for the scheduled-update and pending-flip masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputSet(u32);

impl OutputSet {
    pub const EMPTY: OutputSet = OutputSet(0);

    pub fn insert(&mut self, id: OutputId) {
        self.0 |= 1 << id.0;
    }

    pub fn remove(&mut self, id: OutputId) {
        self.0 &= !(1 << id.0);
    }

    pub fn contains(&self, id: OutputId) -> bool {
        self.0 & (1 << id.0) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: OutputSet) -> OutputSet {
        OutputSet(self.0 | other.0)
    }

    pub fn without(self, other: OutputSet) -> OutputSet {
        OutputSet(self.0 & !other.0)
    }
}

/// Hardware scan-out plane with double-buffering semantics, provided by the
/// framebuffer allocator. `flip` submits the back buffer; completion is
/// reported asynchronously through the DRM session.
pub trait Plane {
    fn flip(&mut self) -> io::Result<()>;
}

/// The black-box image compositor. `flush` uploads any pending texture data
/// for a surface before its damage is consumed; `repaint` redraws `damage`
/// of the current target, clearing `base` (the part no surface covers)
/// first, honouring each surface's clip region.
pub trait Renderer {
    fn flush(&mut self, surface: &Surface);
    fn repaint(&mut self, target: &mut dyn Plane, damage: &Region, base: &Region, surfaces: &[Surface]);
}

pub struct Output {
    id: OutputId,
    geometry: Rect,
    plane: Box<dyn Plane>,
    /// Damage painted in the previous frame. The back buffer is stale there
    /// and must be redrawn along with the new frame's damage.
    previous_damage: Region,
}

impl Output {
    pub fn new(id: OutputId, geometry: Rect, plane: Box<dyn Plane>) -> Self {
        Self {
            id,
            geometry,
            plane,
            previous_damage: Region::new(),
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn geometry(&self) -> Rect {
        self.geometry
    }

    pub fn previous_damage(&self) -> &Region {
        &self.previous_damage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(u32);

/// Client-committed surface state, in surface-local coordinates.
#[derive(Default)]
pub struct SurfaceState {
    pub damage: Region,
    pub opaque: Region,
    pub input: Region,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Border {
    pub width: i32,
    pub damaged: bool,
}

/// Orchestrator-owned per-surface state.
#[derive(Default)]
pub struct ClassState {
    /// Global-coordinate region occluded by opaque surfaces above this one.
    pub clip: Region,
    /// Bounding box including the border.
    pub extents: Rect,
    pub border: Border,
}

type FrameCallback = Box<dyn FnOnce(u32)>;

pub struct Surface {
    id: SurfaceId,
    geometry: Rect,
    pub state: SurfaceState,
    pub(crate) class: ClassState,
    frame_callbacks: Vec<FrameCallback>,
}

impl Surface {
    fn new(id: SurfaceId) -> Self {
        Self {
            id,
            geometry: Rect::default(),
            state: SurfaceState::default(),
            class: ClassState::default(),
            frame_callbacks: Vec::new(),
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn geometry(&self) -> Rect {
        self.geometry
    }

    pub fn set_geometry(&mut self, geometry: Rect) {
        self.geometry = geometry;
        self.update_extents();
    }

    pub fn clip(&self) -> &Region {
        &self.class.clip
    }

    pub fn extents(&self) -> Rect {
        self.class.extents
    }

    pub fn set_border_width(&mut self, width: i32) {
        self.class.border.width = width;
        self.class.border.damaged = true;
        self.update_extents();
    }

    fn update_extents(&mut self) {
        self.class.extents = self.geometry.inflated(self.class.border.width);
    }

    /// Queue a one-shot callback for the next presented frame.
    pub fn add_frame_callback(&mut self, callback: FrameCallback) {
        self.frame_callbacks.push(callback);
    }

    fn send_frame_callbacks(&mut self, time_ms: u32) {
        for callback in self.frame_callbacks.drain(..) {
            callback(time_ms);
        }
    }

    /// Whether the translated input region contains the global point.
    pub fn input_contains(&self, x: i32, y: i32) -> bool {
        self.state
            .input
            .contains_point(x - self.geometry.x, y - self.geometry.y)
    }
}

/// The orchestrator's view of the world: a z-ordered surface stack
/// (front-to-back), the outputs, and the damage pipeline state.
#[derive(Default)]
pub struct Scene {
    surfaces: Vec<Surface>,
    outputs: Vec<Output>,
    damage: Region,
    opaque: Region,
    scheduled_updates: OutputSet,
    pending_flips: OutputSet,
    next_surface_id: u32,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_output(&mut self, output: Output) {
        debug_assert!(self.outputs.iter().all(|o| o.id != output.id));
        self.outputs.push(output);
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn output_ids(&self) -> Vec<OutputId> {
        self.outputs.iter().map(|o| o.id).collect()
    }

    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    /// Create a surface and link it at the top of the stack.
    pub fn create_surface(&mut self) -> SurfaceId {
        let id = SurfaceId(self.next_surface_id);
        self.next_surface_id += 1;
        self.surfaces.insert(0, Surface::new(id));
        id
    }

    pub fn destroy_surface(&mut self, id: SurfaceId) {
        self.surfaces.retain(|s| s.id != id);
    }

    pub fn surface_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces.iter_mut().find(|s| s.id == id)
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.iter().find(|s| s.id == id)
    }

    /// Topmost surface whose input region contains the global point.
    pub fn surface_at(&self, x: i32, y: i32) -> Option<SurfaceId> {
        self.surfaces
            .iter()
            .find(|s| s.input_contains(x, y))
            .map(|s| s.id)
    }

    pub fn has_scheduled_updates(&self) -> bool {
        !self.scheduled_updates.is_empty()
    }

    pub fn pending_flips(&self) -> OutputSet {
        self.pending_flips
    }

    /// Mark an output for repaint. Returns true when the caller must enqueue
    /// the one-shot update task; at most one task is ever outstanding.
    pub fn schedule_update(&mut self, id: OutputId) -> bool {
        let task_outstanding = !self.scheduled_updates.is_empty();
        if self.scheduled_updates.contains(id) {
            return false;
        }
        self.scheduled_updates.insert(id);
        !task_outstanding
    }

    /// Force a full-screen repaint of every output, e.g. after the session
    /// regains the VT and the scan-out buffers are stale.
    pub fn damage_all_outputs(&mut self) {
        for output in &self.outputs {
            self.damage.union_rect(&output.geometry);
        }
    }

    /// The one-shot update task. Repaints every scheduled output that has no
    /// flip in flight; outputs still waiting on a flip are picked up again
    /// from the flip-completion path.
    pub fn perform_update(&mut self, renderer: &mut dyn Renderer) {
        let updates = self.scheduled_updates.without(self.pending_flips);
        if updates.is_empty() {
            return;
        }

        debug!("performing update");
        self.calculate_damage(renderer);

        let mut flipped = OutputSet::EMPTY;
        let Scene {
            surfaces,
            outputs,
            damage,
            opaque,
            ..
        } = self;
        for output in outputs.iter_mut() {
            if updates.contains(output.id) && repaint_output(output, damage, opaque, surfaces, renderer) {
                flipped.insert(output.id);
            }
        }

        // A failed flip leaves its scheduled bit set so a later update
        // attempt retries the output.
        self.pending_flips = self.pending_flips.union(flipped);
        self.scheduled_updates = self.scheduled_updates.without(flipped);
    }

    /// Walk the stack front-to-back, snapshotting each surface's clip,
    /// accumulating opaque coverage and folding committed damage into the
    /// global damage region.
    fn calculate_damage(&mut self, renderer: &mut dyn Renderer) {
        self.opaque.clear();
        let Scene {
            surfaces,
            damage,
            opaque,
            ..
        } = self;

        for surface in surfaces.iter_mut() {
            // Clip the surface by the opaque region covering it.
            surface.class.clip = opaque.clone();

            let mut surface_opaque = surface.state.opaque.clone();
            surface_opaque.translate(surface.geometry.x, surface.geometry.y);
            opaque.union(&surface_opaque);

            if !surface.state.damage.is_empty() {
                renderer.flush(surface);
                let mut surface_damage = mem::take(&mut surface.state.damage);
                surface_damage.translate(surface.geometry.x, surface.geometry.y);
                damage.union(&surface_damage);
            }

            if surface.class.border.damaged {
                let mut border = Region::from_rect(surface.class.extents);
                border.subtract_rect(&surface.geometry);
                damage.union(&border);
                surface.class.border.damaged = false;
            }
        }
    }

    /// A page flip for `id` completed at `time_ms`. Fires frame callbacks on
    /// every surface once the last in-flight flip of the batch settles.
    pub fn complete_flip(&mut self, id: OutputId, time_ms: u32) {
        assert!(
            self.outputs.iter().any(|o| o.id == id),
            "page flip completion for unknown output {id:?}"
        );
        self.pending_flips.remove(id);

        if self.pending_flips.is_empty() {
            for surface in &mut self.surfaces {
                surface.send_frame_callbacks(time_ms);
            }
        }
    }

    #[cfg(test)]
    fn opaque(&self) -> &Region {
        &self.opaque
    }

    #[cfg(test)]
    fn damage(&self) -> &Region {
        &self.damage
    }
}

fn repaint_output(
    output: &mut Output,
    global_damage: &mut Region,
    opaque: &Region,
    surfaces: &[Surface],
    renderer: &mut dyn Renderer,
) -> bool {
    let damage = global_damage.intersect_rect(&output.geometry);

    // The back buffer is also stale in the region painted last frame.
    let previous = mem::replace(&mut output.previous_damage, damage.clone());
    let mut total = damage;
    total.union(&previous);

    let mut base = total.clone();
    base.subtract(opaque);

    renderer.repaint(output.plane.as_mut(), &total, &base, surfaces);

    global_damage.subtract(&total);

    match output.plane.flip() {
        Ok(()) => true,
        Err(err) => {
            warn!("plane flip failed on output {:?}: {}", output.id, err);
            false
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn single_surface_single_output_pipeline() {
        let (mut scene, ids, planes) = scene_with_outputs(&[Rect::new(0, 0, 1920, 1080)]);
        let mut renderer = FakeRenderer::default();

        let surface = scene.create_surface();
        let s = scene.surface_mut(surface).unwrap();
        s.set_geometry(Rect::new(100, 100, 200, 150));
        s.state.damage = rect_region(0, 0, 200, 150);

        assert!(scene.schedule_update(ids[0]));
        scene.perform_update(&mut renderer);

        assert!(scene.damage().is_empty());
        assert!(scene.outputs()[0]
            .previous_damage()
            .same_coverage(&rect_region(100, 100, 200, 150)));
        assert_eq!(planes[0].flips.get(), 1);
        assert!(scene.pending_flips().contains(ids[0]));
        assert!(!scene.has_scheduled_updates());
        assert_eq!(renderer.flushes.get(), 1);
    }

    #[test]
    fn flip_completion_fires_frame_callbacks() {
        let (mut scene, ids, _planes) = scene_with_outputs(&[Rect::new(0, 0, 1920, 1080)]);
        let mut renderer = FakeRenderer::default();

        let surface = scene.create_surface();
        let s = scene.surface_mut(surface).unwrap();
        s.set_geometry(Rect::new(100, 100, 200, 150));
        s.state.damage = rect_region(0, 0, 200, 150);

        let times = Rc::new(RefCell::new(Vec::new()));
        let sink = times.clone();
        scene
            .surface_mut(surface)
            .unwrap()
            .add_frame_callback(Box::new(move |t| sink.borrow_mut().push(t)));

        scene.schedule_update(ids[0]);
        scene.perform_update(&mut renderer);
        assert!(times.borrow().is_empty());

        scene.complete_flip(ids[0], 42);
        assert_eq!(*times.borrow(), vec![42]);
        assert!(scene.pending_flips().is_empty());

        // The callback is one-shot: a later batch does not refire it.
        scene.schedule_update(ids[0]);
        scene.perform_update(&mut renderer);
        scene.complete_flip(ids[0], 43);
        assert_eq!(*times.borrow(), vec![42]);
    }

    #[test]
    fn occlusion_clips_lower_surface() {
        let (mut scene, ids, _planes) = scene_with_outputs(&[Rect::new(0, 0, 100, 100)]);
        let mut renderer = FakeRenderer::default();

        let below = scene.create_surface();
        let s = scene.surface_mut(below).unwrap();
        s.set_geometry(Rect::new(0, 0, 100, 100));
        s.state.damage = rect_region(0, 0, 100, 100);

        // Created later, so on top of `below`.
        let top = scene.create_surface();
        let s = scene.surface_mut(top).unwrap();
        s.set_geometry(Rect::new(0, 0, 100, 100));
        s.state.opaque = rect_region(0, 0, 100, 100);

        scene.schedule_update(ids[0]);
        scene.perform_update(&mut renderer);

        assert!(scene.surface(top).unwrap().clip().is_empty());
        assert!(scene
            .surface(below)
            .unwrap()
            .clip()
            .same_coverage(&rect_region(0, 0, 100, 100)));
        assert!(scene.opaque().same_coverage(&rect_region(0, 0, 100, 100)));

        let repaints = renderer.repaints.borrow();
        assert_eq!(repaints.len(), 1);
        assert!(repaints[0].damage.same_coverage(&rect_region(0, 0, 100, 100)));
        assert!(repaints[0].base.is_empty());
    }

    #[test]
    fn schedule_update_is_idempotent() {
        let (mut scene, ids, _planes) =
            scene_with_outputs(&[Rect::new(0, 0, 100, 100), Rect::new(100, 0, 100, 100)]);

        assert!(scene.schedule_update(ids[0]));
        assert!(!scene.schedule_update(ids[0]));
        // A second output while a task is outstanding must not enqueue again.
        assert!(!scene.schedule_update(ids[1]));
    }

    #[test]
    fn update_waits_for_pending_flip() {
        let (mut scene, ids, planes) = scene_with_outputs(&[Rect::new(0, 0, 100, 100)]);
        let mut renderer = FakeRenderer::default();

        let surface = scene.create_surface();
        let s = scene.surface_mut(surface).unwrap();
        s.set_geometry(Rect::new(0, 0, 10, 10));
        s.state.damage = rect_region(0, 0, 10, 10);

        scene.schedule_update(ids[0]);
        scene.perform_update(&mut renderer);
        assert_eq!(planes[0].flips.get(), 1);

        // New damage while the flip is in flight: the update is recorded but
        // not serviced until the flip completes.
        let s = scene.surface_mut(surface).unwrap();
        s.state.damage = rect_region(0, 0, 5, 5);
        assert!(scene.schedule_update(ids[0]));
        scene.perform_update(&mut renderer);
        assert_eq!(planes[0].flips.get(), 1);
        assert!(scene.has_scheduled_updates());

        scene.complete_flip(ids[0], 1);
        scene.perform_update(&mut renderer);
        assert_eq!(planes[0].flips.get(), 2);
        assert!(!scene.has_scheduled_updates());
    }

    #[test]
    fn failed_flip_leaves_update_scheduled() {
        let (mut scene, ids, planes) = scene_with_outputs(&[Rect::new(0, 0, 100, 100)]);
        let mut renderer = FakeRenderer::default();

        let surface = scene.create_surface();
        let s = scene.surface_mut(surface).unwrap();
        s.set_geometry(Rect::new(0, 0, 10, 10));
        s.state.damage = rect_region(0, 0, 10, 10);

        planes[0].fail.set(true);
        scene.schedule_update(ids[0]);
        scene.perform_update(&mut renderer);

        assert!(scene.has_scheduled_updates());
        assert!(scene.pending_flips().is_empty());
        assert_eq!(planes[0].flips.get(), 0);

        // Once the plane accepts flips again the retry succeeds.
        planes[0].fail.set(false);
        scene.perform_update(&mut renderer);
        assert!(!scene.has_scheduled_updates());
        assert!(scene.pending_flips().contains(ids[0]));
    }

    #[test]
    fn frame_callbacks_wait_for_last_flip_of_batch() {
        let (mut scene, ids, _planes) =
            scene_with_outputs(&[Rect::new(0, 0, 100, 100), Rect::new(100, 0, 100, 100)]);
        let mut renderer = FakeRenderer::default();

        let surface = scene.create_surface();
        let s = scene.surface_mut(surface).unwrap();
        s.set_geometry(Rect::new(50, 0, 100, 100));
        s.state.damage = rect_region(0, 0, 100, 100);

        let times = Rc::new(RefCell::new(Vec::new()));
        let sink = times.clone();
        scene
            .surface_mut(surface)
            .unwrap()
            .add_frame_callback(Box::new(move |t| sink.borrow_mut().push(t)));

        scene.schedule_update(ids[0]);
        scene.schedule_update(ids[1]);
        scene.perform_update(&mut renderer);

        scene.complete_flip(ids[0], 10);
        assert!(times.borrow().is_empty());
        scene.complete_flip(ids[1], 11);
        assert_eq!(*times.borrow(), vec![11]);
    }

    #[test]
    #[should_panic(expected = "unknown output")]
    fn flip_for_unknown_output_panics() {
        let (mut scene, _ids, _planes) = scene_with_outputs(&[Rect::new(0, 0, 100, 100)]);
        scene.complete_flip(OutputId::new(7), 0);
    }

    #[test]
    fn damage_all_outputs_covers_every_screen() {
        let (mut scene, _ids, _planes) =
            scene_with_outputs(&[Rect::new(0, 0, 100, 100), Rect::new(100, 0, 200, 100)]);
        scene.damage_all_outputs();
        let mut expected = rect_region(0, 0, 100, 100);
        expected.union(&rect_region(100, 0, 200, 100));
        assert!(scene.damage().same_coverage(&expected));
    }

    #[test]
    fn surface_without_damage_contributes_nothing() {
        let (mut scene, ids, planes) = scene_with_outputs(&[Rect::new(0, 0, 100, 100)]);
        let mut renderer = FakeRenderer::default();

        let surface = scene.create_surface();
        scene
            .surface_mut(surface)
            .unwrap()
            .set_geometry(Rect::new(0, 0, 10, 10));

        scene.schedule_update(ids[0]);
        scene.perform_update(&mut renderer);

        assert!(scene.damage().is_empty());
        assert_eq!(renderer.flushes.get(), 0);
        let repaints = renderer.repaints.borrow();
        assert!(repaints[0].damage.is_empty());
        // The empty repaint still flips so the frame callback cycle runs.
        assert_eq!(planes[0].flips.get(), 1);
    }

    #[test]
    fn opaque_is_union_of_translated_opaque_regions() {
        let (mut scene, ids, _planes) = scene_with_outputs(&[Rect::new(0, 0, 300, 100)]);
        let mut renderer = FakeRenderer::default();

        let a = scene.create_surface();
        let s = scene.surface_mut(a).unwrap();
        s.set_geometry(Rect::new(0, 0, 50, 50));
        s.state.opaque = rect_region(0, 0, 50, 50);

        let b = scene.create_surface();
        let s = scene.surface_mut(b).unwrap();
        s.set_geometry(Rect::new(100, 10, 50, 50));
        s.state.opaque = rect_region(0, 0, 30, 30);

        scene.schedule_update(ids[0]);
        scene.perform_update(&mut renderer);

        let mut expected = rect_region(0, 0, 50, 50);
        expected.union(&rect_region(100, 10, 30, 30));
        assert!(scene.opaque().same_coverage(&expected));
    }

    #[test]
    fn border_damage_paints_frame_around_geometry() {
        let (mut scene, ids, _planes) = scene_with_outputs(&[Rect::new(0, 0, 100, 100)]);
        let mut renderer = FakeRenderer::default();

        let surface = scene.create_surface();
        let s = scene.surface_mut(surface).unwrap();
        s.set_geometry(Rect::new(10, 10, 20, 20));
        s.set_border_width(2);

        scene.schedule_update(ids[0]);
        scene.perform_update(&mut renderer);

        let mut expected = Region::from_rect(Rect::new(8, 8, 24, 24));
        expected.subtract_rect(&Rect::new(10, 10, 20, 20));
        let repaints = renderer.repaints.borrow();
        assert!(repaints[0].damage.same_coverage(&expected));
        assert!(!scene.surface(surface).unwrap().class.border.damaged);
    }

    #[test]
    fn surface_at_honours_z_order_and_input_region() {
        let (mut scene, _ids, _planes) = scene_with_outputs(&[Rect::new(0, 0, 100, 100)]);

        let below = scene.create_surface();
        let s = scene.surface_mut(below).unwrap();
        s.set_geometry(Rect::new(0, 0, 100, 100));
        s.state.input = rect_region(0, 0, 100, 100);

        let top = scene.create_surface();
        let s = scene.surface_mut(top).unwrap();
        s.set_geometry(Rect::new(20, 20, 40, 40));
        s.state.input = rect_region(0, 0, 40, 40);

        assert_eq!(scene.surface_at(30, 30), Some(top));
        assert_eq!(scene.surface_at(5, 5), Some(below));
        assert_eq!(scene.surface_at(200, 200), None);

        scene.destroy_surface(top);
        assert_eq!(scene.surface_at(30, 30), Some(below));
    }
}
