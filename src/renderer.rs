//! The GPU renderer as an external collaborator (C3).
//!
//! Mirrors the shape of `backend::renderer::Renderer` in the teacher: a
//! trait the compositor drives to turn one region's covering layers into
//! pixels in an off-screen target, with a [`TestRenderer`] (grounded on
//! `backend::renderer::test`) standing in for a real GL/Vulkan backend in
//! this crate's own tests.
//!
//! The four-operation shape (`begin_frame`, `draw`, `insert_fence`,
//! `sync_fd`) mirrors `original_source/common/compositor/glrenderer.cpp`'s
//! `Draw`/`InsertFence` split: fences are imported into the GPU command
//! stream without blocking the calling thread, and the renderer produces
//! its own out-fence once every draw call for the frame has been issued.

use crate::buffer::OverlayBuffer;
use crate::fence::Fence;
use crate::geometry::Rect;
use crate::surface_pool::OffScreenTarget;

/// The per-layer inputs the renderer needs to composite one layer's
/// contribution to a single region: which texture, which sub-rectangle of
/// it, and how to blend it.
///
/// Grounded on `original_source/common/compositor/renderstate.h`'s
/// `LayerState`: crop bounds are the layer's source crop remapped to cover
/// just this region, and the texture matrix selects identity or the
/// axis-swap table entry for the layer's transform.
#[derive(Debug, Clone, Copy)]
pub struct LayerState {
    /// the buffer sampled for this layer
    pub texture: OverlayBuffer,
    /// the sub-rectangle of `texture` (buffer pixel space) to sample for this region
    pub crop: crate::layer::RectF,
    /// 2x2 texture coordinate matrix: identity, or the swap-xy table entry for a 90/270 rotation
    pub matrix: [[f32; 2]; 2],
    /// blend factor, 0.0-1.0
    pub alpha: f32,
    /// true if the source color channels are already alpha-premultiplied
    pub premult: bool,
    /// fill color for a solid-color layer, instead of sampling `texture`
    pub solid_color: Option<u32>,
}

/// One composited region: its bounds in target space and the layers
/// (back-to-front) that cover it.
#[derive(Debug, Clone)]
pub struct RenderState {
    /// the region's bounds, in the off-screen target's pixel space
    pub rect: Rect,
    /// covering layers, ordered back-to-front for correct "over" blending
    pub layers: Vec<LayerState>,
}

/// External collaborator that can composite layers into an off-screen
/// target. A real implementation binds the target as a framebuffer and
/// issues GL/Vulkan draw calls per region; this crate only needs to know
/// the four-operation protocol spec.md §4.3 describes.
pub trait Renderer: std::fmt::Debug {
    /// Starts a new frame. `disable_explicit_sync` (spec.md §6
    /// `DISABLE_EXPLICIT_SYNC`) tells the renderer not to bother importing
    /// fences via [`Self::insert_fence`] even if the caller supplies them.
    /// Returns `false` if the renderer couldn't start (e.g. context lost).
    fn begin_frame(&mut self, disable_explicit_sync: bool) -> bool;

    /// Imports `fence` into the GPU command stream so the next
    /// [`Self::draw`] call waits on it on the GPU side without blocking the
    /// calling thread.
    fn insert_fence(&mut self, fence: &Fence);

    /// Composites `states` into `surface`. `clear` requests a full clear of
    /// the target before drawing (surface's [`crate::surface_pool::ClearType::Full`]),
    /// as opposed to a partial redraw of just the damaged regions. Returns
    /// `false` if the draw failed.
    fn draw(&mut self, states: &[RenderState], surface: &OffScreenTarget, clear: bool) -> bool;

    /// Produces this frame's out-fence, signalled once every draw call has
    /// retired on the GPU. `None` if the frame produced no fence (e.g.
    /// explicit sync disabled, or nothing was drawn).
    fn sync_fd(&mut self) -> Option<Fence>;
}

/// A [`Renderer`] that performs no drawing, only records what it was asked
/// to do — used by this crate's own tests and by embedders exercising the
/// plane manager/compositor without a GPU.
#[derive(Debug, Default)]
pub struct TestRenderer {
    /// number of times `begin_frame` was invoked
    pub begin_frame_calls: usize,
    /// number of times `draw` was invoked
    pub calls: usize,
    /// total number of layer states ever passed to `draw`
    pub layers_seen: usize,
    /// number of fences imported via `insert_fence`
    pub fences_inserted: usize,
    /// the `disable_explicit_sync` flag seen on the most recent `begin_frame`
    pub last_disable_explicit_sync: bool,
}

impl Renderer for TestRenderer {
    fn begin_frame(&mut self, disable_explicit_sync: bool) -> bool {
        self.begin_frame_calls += 1;
        self.last_disable_explicit_sync = disable_explicit_sync;
        true
    }

    fn insert_fence(&mut self, _fence: &Fence) {
        self.fences_inserted += 1;
    }

    fn draw(&mut self, states: &[RenderState], _surface: &OffScreenTarget, _clear: bool) -> bool {
        self.calls += 1;
        self.layers_seen += states.iter().map(|s| s.layers.len()).sum::<usize>();
        true
    }

    fn sync_fd(&mut self) -> Option<Fence> {
        let (read, write) = rustix::pipe::pipe().ok()?;
        std::io::Write::write_all(&mut std::fs::File::from(write), &[0u8]).ok()?;
        Some(Fence::new(read))
    }
}
