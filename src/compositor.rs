//! Drives the region engine and renderer for one GPU-composited plane (C8).
//!
//! Grounded on `original_source/common/compositor/compositor.cpp::Draw`/`DrawOffscreen`:
//! decompose the plane's layers into disjoint regions, then render once per
//! distinct composition region, passing only the regions that actually
//! changed (damage) to the renderer. Layers with `needs_dedicated_plane` set
//! are never themselves GPU-composited, but their footprint still punches a
//! hole through any composited region they occlude (`region::separate_layers`'s
//! dedicated-layer handling), so damage tracking doesn't over-report area
//! that's actually covered by the dedicated plane sitting in front of it.
//!
//! Per-layer render state construction (crop remapping, texture matrix,
//! blend factors) is grounded on `original_source/common/compositor/renderstate.cpp`.

use crate::geometry::Rect;
use crate::layer::{Blending, OverlayLayer, RectF};
use crate::region::{separate_layers, CompositionRegion};
use crate::renderer::{LayerState, RenderState, Renderer};
use crate::surface_pool::{ClearType, OffScreenTarget};

const IDENTITY_MATRIX: [[f32; 2]; 2] = [[1.0, 0.0], [0.0, 1.0]];
const SWAP_MATRIX: [[f32; 2]; 2] = [[0.0, 1.0], [1.0, 0.0]];

/// Composites the layers of one GPU-rendered plane into a target.
#[derive(Debug, Default)]
pub struct Compositor {
    /// the composition regions computed for the most recent frame, kept for damage comparison
    previous_regions: Vec<CompositionRegion>,
}

impl Compositor {
    /// Creates an empty compositor with no prior-frame state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders `layers` (front-to-back) into `target` via `renderer`,
    /// limiting the renderer's work to regions whose coverage changed since
    /// the previous call (or the full plane on the first call). Returns
    /// `target` back with its `acquire_fence` set to the renderer's out-fence
    /// if anything was drawn.
    ///
    /// Layers with `needs_dedicated_plane` set are passed to the region
    /// engine as dedicated (hole-punching) layers rather than sources: they
    /// occlude whatever they overlap but are never themselves rendered here,
    /// since the plane manager has already routed them to their own plane.
    ///
    /// Before drawing, each source layer's acquire fence (if any) is
    /// imported into the renderer via [`Renderer::insert_fence`] unless
    /// `disable_explicit_sync` is set (spec.md §6 `DISABLE_EXPLICIT_SYNC`),
    /// so the GPU waits for client content to finish rendering without the
    /// compositor blocking its own thread on it.
    pub fn draw(&mut self, mut target: OffScreenTarget, layers: &[OverlayLayer], renderer: &mut dyn Renderer, disable_explicit_sync: bool) -> OffScreenTarget {
        let rects: Vec<Rect> = layers.iter().map(|l| l.display_frame).collect();
        let source_layers: Vec<usize> = layers.iter().enumerate().filter(|(_, l)| !l.needs_dedicated_plane).map(|(i, _)| i).collect();
        let dedicated_layers: Vec<usize> = layers.iter().enumerate().filter(|(_, l)| l.needs_dedicated_plane).map(|(i, _)| i).collect();

        let regions = separate_layers(&rects, &source_layers, &dedicated_layers, &[]);
        let damage = self.damage_since_previous(&regions);
        self.previous_regions = regions.clone();

        let states: Vec<RenderState> = regions
            .iter()
            .filter(|r| damage.iter().any(|d| d.overlaps(&r.rect)))
            .map(|r| build_render_state(r, layers))
            .collect();

        if states.is_empty() {
            return target;
        }

        if !renderer.begin_frame(disable_explicit_sync) {
            tracing::warn!("compositor: renderer failed to begin frame, skipping draw");
            return target;
        }

        if !disable_explicit_sync {
            for &i in &source_layers {
                if let Some(fence) = &layers[i].acquire_fence {
                    renderer.insert_fence(fence);
                }
            }
        }

        let clear = matches!(target.clear_type, ClearType::Full);
        if renderer.draw(&states, &target, clear) {
            target.acquire_fence = renderer.sync_fd();
        }
        target
    }

    fn damage_since_previous(&self, regions: &[CompositionRegion]) -> Vec<Rect> {
        if self.previous_regions.is_empty() {
            return regions.iter().map(|r| r.rect).collect();
        }
        regions
            .iter()
            .filter(|r| !self.previous_regions.iter().any(|p| p.rect == r.rect && p.mask == r.mask))
            .map(|r| r.rect)
            .collect()
    }
}

/// Builds one region's render state from the layers (by original index)
/// its mask covers. Indices come back from `mask.indices()` in ascending
/// (topmost-first) order; reversed here so layers draw back-to-front.
fn build_render_state(region: &CompositionRegion, layers: &[OverlayLayer]) -> RenderState {
    let mut indices = region.mask.indices();
    indices.reverse();
    let layer_states = indices.into_iter().map(|i| layer_state_for(&layers[i], region.rect)).collect();
    RenderState { rect: region.rect, layers: layer_states }
}

fn layer_state_for(layer: &OverlayLayer, region_rect: Rect) -> LayerState {
    let (alpha, premult) = blend_factors(layer);
    LayerState {
        texture: layer.buffer,
        crop: crop_for_region(layer, region_rect),
        matrix: if layer.transform.swaps_dimensions() { SWAP_MATRIX } else { IDENTITY_MATRIX },
        alpha,
        premult,
        solid_color: layer.is_solid_color.then_some(layer.solid_color_rgba),
    }
}

/// Maps `region_rect` (a sub-rectangle of `layer.display_frame`) back into
/// `layer.source_crop`'s coordinate space, proportionally on each axis.
fn crop_for_region(layer: &OverlayLayer, region_rect: Rect) -> RectF {
    let frame = layer.display_frame;
    if frame.width == 0 || frame.height == 0 {
        return layer.source_crop;
    }
    let scale_x = layer.source_crop.width / frame.width as f32;
    let scale_y = layer.source_crop.height / frame.height as f32;
    RectF::new(
        layer.source_crop.x + (region_rect.x - frame.x) as f32 * scale_x,
        layer.source_crop.y + (region_rect.y - frame.y) as f32 * scale_y,
        region_rect.width as f32 * scale_x,
        region_rect.height as f32 * scale_y,
    )
}

fn blend_factors(layer: &OverlayLayer) -> (f32, bool) {
    match layer.blending {
        Blending::None => (1.0, true),
        Blending::Premult => (layer.plane_alpha as f32 / 255.0, true),
        Blending::Coverage => (layer.plane_alpha as f32 / 255.0, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OverlayBuffer;
    use crate::fence::Fence;
    use crate::geometry::Transform;
    use crate::renderer::TestRenderer;
    use drm_fourcc::{DrmFourcc, DrmModifier};

    fn layer(display_frame: Rect, dedicated: bool) -> OverlayLayer {
        OverlayLayer {
            surface_id: 1,
            buffer: OverlayBuffer {
                id: 1,
                format: DrmFourcc::Xrgb8888,
                modifier: DrmModifier::Linear,
                width: 100,
                height: 100,
            },
            source_crop: RectF::full(100, 100),
            display_frame,
            transform: Transform::Normal,
            plane_alpha: 255,
            blending: crate::layer::Blending::None,
            is_opaque: true,
            needs_dedicated_plane: dedicated,
            is_cursor: false,
            is_video: false,
            is_solid_color: false,
            solid_color_rgba: 0,
            content_revision: 0,
            acquire_fence: None,
            release_fence: None,
        }
    }

    fn target() -> OffScreenTarget {
        OffScreenTarget {
            buffer: OverlayBuffer { id: 1, format: DrmFourcc::Xrgb8888, modifier: DrmModifier::Linear, width: 200, height: 200 },
            clear_type: ClearType::Full,
            surface_damage: Rect::new(0, 0, 200, 200),
            transform: Transform::Normal,
            on_screen: false,
            acquire_fence: None,
        }
    }

    #[test]
    fn first_frame_damages_everything() {
        let mut compositor = Compositor::new();
        let mut renderer = TestRenderer::default();
        let layers = vec![layer(Rect::new(0, 0, 100, 100), false)];
        let result = compositor.draw(target(), &layers, &mut renderer, false);
        assert_eq!(renderer.calls, 1);
        assert_eq!(renderer.layers_seen, 1);
        assert!(result.acquire_fence.is_some());
    }

    #[test]
    fn unchanged_second_frame_has_no_damage() {
        let mut compositor = Compositor::new();
        let mut renderer = TestRenderer::default();
        let layers = vec![layer(Rect::new(0, 0, 100, 100), false)];
        compositor.draw(target(), &layers, &mut renderer, false);
        compositor.draw(target(), &layers, &mut renderer, false);
        assert_eq!(renderer.calls, 1);
    }

    #[test]
    fn dedicated_layers_are_excluded_from_composition() {
        let mut compositor = Compositor::new();
        let mut renderer = TestRenderer::default();
        let layers = vec![layer(Rect::new(0, 0, 100, 100), true)];
        compositor.draw(target(), &layers, &mut renderer, false);
        assert_eq!(renderer.layers_seen, 0);
        assert_eq!(renderer.calls, 0);
    }

    #[test]
    fn disabling_explicit_sync_skips_fence_import() {
        let mut compositor = Compositor::new();
        let mut renderer = TestRenderer::default();
        let mut l = layer(Rect::new(0, 0, 100, 100), false);
        let (read, write) = rustix::pipe::pipe().unwrap();
        rustix::io::write(&write, b"x").unwrap();
        l.acquire_fence = Some(Fence::new(read));
        compositor.draw(target(), &[l], &mut renderer, true);
        assert_eq!(renderer.fences_inserted, 0);
    }
}
