//! Client-submitted overlay layers (spec.md §3 `OverlayLayer`).

use crate::buffer::OverlayBuffer;
use crate::fence::Fence;
use crate::geometry::{Rect, Transform};

/// Per-pixel blend mode a layer is composited with, spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Blending {
    /// the layer is opaque; no blend equation is applied
    #[default]
    None,
    /// source color channels are already multiplied by alpha ("over" blend)
    Premult,
    /// source color channels are straight (non-premultiplied) alpha
    Coverage,
}

/// One client's request to show a buffer at a particular place on screen.
///
/// The plane manager assigns a front-to-back stack of these (index 0 is
/// topmost) either to hardware overlay planes or to the GPU-rendered
/// primary plane every frame.
#[derive(Debug)]
pub struct OverlayLayer {
    /// identifies the client surface this layer belongs to, stable across frames
    pub surface_id: u64,
    /// the buffer to scan out or composite; absent for solid-color layers
    pub buffer: OverlayBuffer,
    /// the portion of the buffer to sample from
    pub source_crop: RectF,
    /// where on the display this layer lands
    pub display_frame: Rect,
    /// rotation/flip to apply while scanning out or compositing
    pub transform: Transform,
    /// 0 (fully transparent) to 255 (fully opaque) plane-wide blend factor
    pub plane_alpha: u8,
    /// per-pixel blend equation
    pub blending: Blending,
    /// true if every pixel of the buffer is opaque (enables underlay placement)
    pub is_opaque: bool,
    /// true if the client needs this layer on a dedicated plane (e.g. protected/video content)
    pub needs_dedicated_plane: bool,
    /// true if this is the pointer/cursor layer; routed to a dedicated cursor plane when one exists
    pub is_cursor: bool,
    /// true if this layer carries video content; never squashed with another layer (spec.md §4.6)
    pub is_video: bool,
    /// true if this layer has no backing buffer and is filled with `solid_color_rgba` instead
    pub is_solid_color: bool,
    /// fill color used when `is_solid_color` is set, 0xRRGGBBAA
    pub solid_color_rgba: u32,
    /// monotonically increasing per-surface frame counter, used to detect unchanged content
    pub content_revision: u64,
    /// fd the client signals once the buffer is safe to read; ownership
    /// transfers to the composer on submission (spec.md §6). Waited on
    /// before this layer is scanned out or composited.
    pub acquire_fence: Option<Fence>,
    /// fd the composer signals once the buffer is safe for the client to
    /// reuse: the frame's retire fence on success, absent (-1) if the
    /// commit that was meant to display this layer failed.
    pub release_fence: Option<Fence>,
}

/// Fence fds are duplicated rather than shared on clone: plane assignment
/// routinely clones candidate layers across trial plans, and a dup'd sync
/// fd is a legitimate second waiter on the same underlying signal. A dup
/// failure (fd exhaustion) drops the fence rather than propagating an
/// error here; the layer is then treated as having no fence to wait on.
impl Clone for OverlayLayer {
    fn clone(&self) -> Self {
        Self {
            surface_id: self.surface_id,
            buffer: self.buffer,
            source_crop: self.source_crop,
            display_frame: self.display_frame,
            transform: self.transform,
            plane_alpha: self.plane_alpha,
            blending: self.blending,
            is_opaque: self.is_opaque,
            needs_dedicated_plane: self.needs_dedicated_plane,
            is_cursor: self.is_cursor,
            is_video: self.is_video,
            is_solid_color: self.is_solid_color,
            solid_color_rgba: self.solid_color_rgba,
            content_revision: self.content_revision,
            acquire_fence: clone_fence(&self.acquire_fence),
            release_fence: clone_fence(&self.release_fence),
        }
    }
}

fn clone_fence(fence: &Option<Fence>) -> Option<Fence> {
    fence.as_ref().and_then(|f| match f.try_clone() {
        Ok(dup) => Some(dup),
        Err(e) => {
            tracing::warn!(error = %e, "layer: could not duplicate fence fd on clone, dropping it");
            None
        }
    })
}

/// A source-crop rectangle, in buffer pixel space with sub-pixel precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectF {
    /// left edge
    pub x: f32,
    /// top edge
    pub y: f32,
    /// width
    pub width: f32,
    /// height
    pub height: f32,
}

impl RectF {
    /// Builds a new crop rectangle.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Crop rectangle covering the entire buffer.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }
}

impl OverlayLayer {
    /// True if this layer's display frame requires scaling relative to its source crop.
    pub fn needs_scaling(&self) -> bool {
        let (src_w, src_h) = self.transform.transform_size(self.source_crop.width as i32, self.source_crop.height as i32);
        src_w != self.display_frame.width || src_h != self.display_frame.height
    }

    /// True if this layer's display frame is strictly smaller than its (transformed) source crop.
    pub fn is_downscaling(&self) -> bool {
        let (src_w, src_h) = self.transform.transform_size(self.source_crop.width as i32, self.source_crop.height as i32);
        self.display_frame.width < src_w || self.display_frame.height < src_h
    }
}
