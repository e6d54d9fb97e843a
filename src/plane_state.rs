//! Per-plane composition state across a frame (C6).
//!
//! Grounded on `original_source/common/display/displayplanestate.cpp`:
//! `AddLayer`/`ResetLayers`, the revalidation bitmask machine, the pixel-cost
//! scaling model (`CanUseDisplayUpScaling`/`CanUseGPUDownScaling`), and
//! `SwapSurfaceIfNeeded`'s triple-buffer rotation (delegated to
//! [`crate::surface_pool::SurfacePool`] here, see `DESIGN.md` Open Question 3).

use bitflags::bitflags;

use crate::buffer::OverlayBuffer;
use crate::fence::Fence;
use crate::geometry::{Rect, Transform};
use crate::layer::OverlayLayer;

bitflags! {
    /// Which aspects of a plane's assignment changed since the last commit
    /// and therefore need revalidation before the next one.
    ///
    /// Grounded on the original's `RevalidationType` bitmask; tracked here
    /// as a typed flag set rather than raw integer constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Revalidation: u8 {
        /// the set of layers assigned to this plane changed
        const LAYERS = 1 << 0;
        /// the display frame (position/size on screen) changed
        const GEOMETRY = 1 << 1;
        /// the source crop changed
        const SOURCE_CROP = 1 << 2;
        /// the plane was forced onto (or off of) GPU composition
        const GPU_FORCED = 1 << 3;
    }
}

/// What a plane is doing this frame: scanning out a client buffer directly,
/// or receiving the GPU-rendered composite of one or more layers.
#[derive(Debug, Clone)]
pub enum PlaneContent {
    /// direct scanout of a single client buffer, no GPU composition
    Scanout(OverlayBuffer),
    /// one or more layers composited by the GPU into an off-screen target
    Composited(OverlayBuffer),
}

/// The complete state of one plane for one frame: which layers it carries,
/// where, and whether it needs GPU composition.
#[derive(Debug, Clone)]
pub struct PlaneState {
    /// plane being described
    pub plane_id: u32,
    /// layers assigned to this plane, front-to-back
    layers: Vec<OverlayLayer>,
    /// the plane's display frame, the union of its layers' frames once resolved
    pub display_frame: Rect,
    /// the source crop sampled into `display_frame`, once resolved
    pub source_crop: Rect,
    /// rotation applied at scanout
    pub transform: Transform,
    /// content plan for this frame
    pub content: Option<PlaneContent>,
    /// forced onto the GPU, skipping direct-scanout eligibility entirely
    gpu_forced: bool,
    /// bits describing what must be revalidated before reuse
    revalidation: Revalidation,
    revalidation_done: Revalidation,
}

impl PlaneState {
    /// Creates empty state for `plane_id`.
    pub fn new(plane_id: u32) -> Self {
        Self {
            plane_id,
            layers: Vec::new(),
            display_frame: Rect::default(),
            source_crop: Rect::default(),
            transform: Transform::Normal,
            content: None,
            gpu_forced: false,
            revalidation: Revalidation::empty(),
            revalidation_done: Revalidation::empty(),
        }
    }

    /// Adds a layer to this plane, growing the display frame to cover it and
    /// marking layer-set revalidation pending.
    pub fn add_layer(&mut self, layer: OverlayLayer) {
        self.display_frame = self.display_frame.merge(&layer.display_frame);
        self.layers.push(layer);
        self.revalidation.insert(Revalidation::LAYERS);
    }

    /// Clears this plane's layers, keeping its identity, ready for the next frame.
    pub fn reset_layers(&mut self) {
        self.layers.clear();
        self.display_frame = Rect::default();
        self.content = None;
        self.revalidation.insert(Revalidation::LAYERS);
    }

    /// The layers currently assigned to this plane.
    pub fn layers(&self) -> &[OverlayLayer] {
        &self.layers
    }

    /// Takes ownership of this plane's layers, leaving it empty. Used when
    /// folding one plane's layers into another during a squash.
    pub fn take_layers(&mut self) -> Vec<OverlayLayer> {
        self.display_frame = Rect::default();
        std::mem::take(&mut self.layers)
    }

    /// Sets every assigned layer's release fence to a dup of `fence` — the
    /// frame that superseded them has committed, so their buffers are safe
    /// to reuse once the fence signals (spec.md §8 invariant 4).
    pub fn set_release_fence(&mut self, fence: &Fence) {
        for layer in self.layers.iter_mut() {
            layer.release_fence = match fence.try_clone() {
                Ok(dup) => Some(dup),
                Err(e) => {
                    tracing::warn!(error = %e, "plane_state: could not duplicate retire fence for release");
                    None
                }
            };
        }
    }

    /// Clears every assigned layer's release fence (-1), used when the
    /// commit that would have presented them failed.
    pub fn clear_release_fences(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.release_fence = None;
        }
    }

    /// True if this plane's content can be scanned out directly, i.e. it
    /// carries exactly one layer and was not forced onto the GPU.
    pub fn scanout_eligible(&self) -> bool {
        !self.gpu_forced && self.layers.len() == 1
    }

    /// True if this plane needs an off-screen composition pass: more than one
    /// layer, or forced.
    pub fn needs_off_screen_composition(&self) -> bool {
        self.gpu_forced || self.layers.len() > 1
    }

    /// Forces this plane onto GPU composition for the rest of this frame
    /// (e.g. after a failed atomic test commit).
    pub fn force_gpu_rendering(&mut self) {
        self.gpu_forced = true;
        self.revalidation.insert(Revalidation::GPU_FORCED);
    }

    /// Releases a previous [`Self::force_gpu_rendering`] call, allowing
    /// direct scanout again once eligible.
    pub fn disable_gpu_rendering(&mut self) {
        self.gpu_forced = false;
        self.revalidation.insert(Revalidation::GPU_FORCED);
    }

    /// True if this plane was forced onto GPU composition.
    pub fn is_gpu_forced(&self) -> bool {
        self.gpu_forced
    }

    /// Records that `bits` have been revalidated for this frame.
    pub fn mark_revalidated(&mut self, bits: Revalidation) {
        self.revalidation_done.insert(bits);
    }

    /// True if every pending revalidation bit has been addressed.
    pub fn revalidation_complete(&self) -> bool {
        self.revalidation_done.contains(self.revalidation)
    }

    /// True if any two assigned layers' display frames overlap.
    pub fn can_squash(&self) -> bool {
        for (i, a) in self.layers.iter().enumerate() {
            for b in &self.layers[i + 1..] {
                if a.display_frame.overlaps(&b.display_frame) {
                    return true;
                }
            }
        }
        false
    }

    /// The pixel-cost of using hardware upscaling for `layer`, per the
    /// original's `CanUseDisplayUpScaling` model: the excess area (display
    /// frame minus source crop) on each axis, independently, clamped at zero.
    pub fn upscale_pixel_cost(layer: &OverlayLayer) -> i64 {
        let src_w = layer.source_crop.width as i32;
        let src_h = layer.source_crop.height as i32;
        let width_cost = (layer.display_frame.width - src_w).max(0) as i64 * layer.display_frame.height as i64;
        let height_cost = (layer.display_frame.height - src_h).max(0) as i64 * layer.display_frame.width as i64;
        width_cost + height_cost
    }

    /// True if hardware upscaling is worth using for `layer` rather than
    /// falling back to GPU composition, i.e. its pixel cost stays under
    /// `budget`.
    pub fn can_use_display_upscaling(layer: &OverlayLayer, budget: i64) -> bool {
        layer.needs_scaling() && !layer.is_downscaling() && Self::upscale_pixel_cost(layer) <= budget
    }

    /// True if GPU downscaling should be used for `layer` given `enable_downscaling`
    /// (spec.md §6 `ENABLE_DOWNSCALING`): downscaling is never free on this
    /// hardware model, so it is gated entirely behind the config flag.
    pub fn can_use_gpu_downscaling(layer: &OverlayLayer, enable_downscaling: bool) -> bool {
        layer.is_downscaling() && enable_downscaling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drm_fourcc::{DrmFourcc, DrmModifier};

    fn layer(display_frame: Rect, crop_w: f32, crop_h: f32) -> OverlayLayer {
        OverlayLayer {
            surface_id: 1,
            buffer: OverlayBuffer {
                id: 1,
                format: DrmFourcc::Xrgb8888,
                modifier: DrmModifier::Linear,
                width: crop_w as u32,
                height: crop_h as u32,
            },
            source_crop: crate::layer::RectF::new(0.0, 0.0, crop_w, crop_h),
            display_frame,
            transform: Transform::Normal,
            plane_alpha: 255,
            blending: crate::layer::Blending::None,
            is_opaque: true,
            needs_dedicated_plane: false,
            is_cursor: false,
            is_video: false,
            is_solid_color: false,
            solid_color_rgba: 0,
            content_revision: 0,
            acquire_fence: None,
            release_fence: None,
        }
    }

    #[test]
    fn single_layer_is_scanout_eligible() {
        let mut state = PlaneState::new(1);
        state.add_layer(layer(Rect::new(0, 0, 100, 100), 100.0, 100.0));
        assert!(state.scanout_eligible());
        assert!(!state.needs_off_screen_composition());
    }

    #[test]
    fn two_layers_need_composition() {
        let mut state = PlaneState::new(1);
        state.add_layer(layer(Rect::new(0, 0, 100, 100), 100.0, 100.0));
        state.add_layer(layer(Rect::new(50, 50, 100, 100), 100.0, 100.0));
        assert!(!state.scanout_eligible());
        assert!(state.needs_off_screen_composition());
        assert!(state.can_squash());
    }

    #[test]
    fn forced_gpu_rendering_overrides_single_layer() {
        let mut state = PlaneState::new(1);
        state.add_layer(layer(Rect::new(0, 0, 100, 100), 100.0, 100.0));
        state.force_gpu_rendering();
        assert!(!state.scanout_eligible());
        state.disable_gpu_rendering();
        assert!(state.scanout_eligible());
    }

    #[test]
    fn revalidation_tracks_pending_bits() {
        let mut state = PlaneState::new(1);
        state.add_layer(layer(Rect::new(0, 0, 10, 10), 10.0, 10.0));
        assert!(!state.revalidation_complete());
        state.mark_revalidated(Revalidation::LAYERS);
        assert!(state.revalidation_complete());
    }

    #[test]
    fn upscaling_cost_is_zero_for_identity_mapping() {
        let l = layer(Rect::new(0, 0, 100, 100), 100.0, 100.0);
        assert_eq!(PlaneState::upscale_pixel_cost(&l), 0);
        assert!(!PlaneState::can_use_display_upscaling(&l, 0));
    }

    #[test]
    fn upscaling_within_budget_is_accepted() {
        let l = layer(Rect::new(0, 0, 200, 100), 100.0, 100.0);
        let cost = PlaneState::upscale_pixel_cost(&l);
        assert!(cost > 0);
        assert!(PlaneState::can_use_display_upscaling(&l, cost));
        assert!(!PlaneState::can_use_display_upscaling(&l, cost - 1));
    }

    #[test]
    fn downscaling_requires_config_flag() {
        let l = layer(Rect::new(0, 0, 50, 50), 100.0, 100.0);
        assert!(!PlaneState::can_use_gpu_downscaling(&l, false));
        assert!(PlaneState::can_use_gpu_downscaling(&l, true));
    }
}
