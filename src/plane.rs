//! The hardware plane model (C5).
//!
//! A `Plane` describes one KMS overlay/primary/cursor plane's fixed
//! capabilities and the subset of properties the plane manager needs to
//! reason about assignment — not the full KMS property blob, which is owned
//! by [`crate::mode_client::ModeClient`].

use bitflags::bitflags;
use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::error::CapabilityError;
use crate::geometry::{Rect, Transform};
use crate::layer::OverlayLayer;

/// The three KMS plane types, mirroring `DRM_PLANE_TYPE_*` without pulling in
/// the `drm` crate (see `DESIGN.md` for why that dependency was dropped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// scans out the CRTC's base layer, always present, used as the GPU composition target
    Primary,
    /// composites above the primary plane in z-order, optional, the scarce resource being assigned
    Overlay,
    /// a small plane dedicated to pointer/cursor scanout
    Cursor,
}

bitflags! {
    /// Fixed hardware capability flags for one plane.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PlaneCapabilities: u32 {
        /// can sample a sub-rectangle of the buffer different from its display frame
        const SOURCE_CROP = 1 << 0;
        /// can scale between source crop and display frame
        const SCALING = 1 << 1;
        /// can apply a rotation/flip transform
        const ROTATION = 1 << 2;
        /// can blend with a plane-wide alpha factor
        const PLANE_ALPHA = 1 << 3;
    }
}

/// One hardware plane: identity, type, and fixed capabilities.
#[derive(Debug, Clone)]
pub struct Plane {
    /// KMS plane object id
    pub id: u32,
    /// plane type
    pub plane_type: PlaneType,
    /// formats this plane can scan out, each with its supported modifiers
    pub formats: Vec<(DrmFourcc, Vec<DrmModifier>)>,
    /// fixed capability flags
    pub capabilities: PlaneCapabilities,
    /// the maximum downscale factor (source / destination) the plane can apply, 1.0 if none
    pub max_downscale: f32,
    /// the maximum upscale factor the plane can apply, 1.0 if none
    pub max_upscale: f32,
    /// format used to allocate an off-screen target when this plane composites non-video layers
    pub preferred_format: DrmFourcc,
    /// the modifier tried first when allocating a new off-screen target for this plane
    pub preferred_modifier: DrmModifier,
    /// true if this plane is currently assigned to a layer this frame
    pub in_use: bool,
}

impl Plane {
    /// True if this plane advertises `format`/`modifier`.
    pub fn supports_format(&self, format: DrmFourcc, modifier: DrmModifier) -> bool {
        self.formats.iter().any(|(f, mods)| *f == format && mods.contains(&modifier))
    }

    /// Modifiers to try, in order, when allocating an off-screen target for
    /// this plane: the preferred modifier for `format` first, then the rest
    /// of the advertised set. Empty if `format` isn't supported at all.
    pub fn candidate_modifiers(&self, format: DrmFourcc) -> Vec<DrmModifier> {
        let Some((_, mods)) = self.formats.iter().find(|(f, _)| *f == format) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(mods.len());
        if mods.contains(&self.preferred_modifier) {
            out.push(self.preferred_modifier);
        }
        out.extend(mods.iter().copied().filter(|m| *m != self.preferred_modifier));
        out
    }

    /// The framebuffer format actually used to scan out `requested` on this
    /// plane. The primary plane falls back from ARGB to XRGB (dropping the
    /// alpha channel) when it advertises no ARGB-capable format at all,
    /// since the primary is always the opaque base of the z-order and has
    /// nothing beneath it to blend against (spec.md §4.4).
    pub fn framebuffer_format(&self, requested: DrmFourcc) -> DrmFourcc {
        if self.plane_type == PlaneType::Primary && requested == DrmFourcc::Argb8888 && !self.formats.iter().any(|(f, _)| *f == requested) {
            DrmFourcc::Xrgb8888
        } else {
            requested
        }
    }

    /// Checks whether `layer` could be scanned out directly on this plane,
    /// independent of z-order/overlap concerns (those are the plane
    /// manager's job). Returns the specific capability gap as an error when
    /// it cannot.
    pub fn validate_layer(&self, layer: &OverlayLayer) -> Result<(), CapabilityError> {
        let fb_format = self.framebuffer_format(layer.buffer.format);
        if !self.supports_format(fb_format, layer.buffer.modifier) {
            return Err(CapabilityError::UnsupportedFormat(layer.buffer.format, layer.buffer.modifier));
        }
        if layer.transform != Transform::Normal && !self.capabilities.contains(PlaneCapabilities::ROTATION) {
            return Err(CapabilityError::UnsupportedTransform {
                plane: self.id,
                transform: layer.transform,
            });
        }
        if layer.needs_scaling() && !self.capabilities.contains(PlaneCapabilities::SCALING) {
            return Err(CapabilityError::UnsupportedTransform {
                plane: self.id,
                transform: layer.transform,
            });
        }
        if layer.plane_alpha != 255 && !self.capabilities.contains(PlaneCapabilities::PLANE_ALPHA) {
            return Err(CapabilityError::MissingProperty("plane alpha"));
        }
        Ok(())
    }

    /// The set of atomic properties this plane would need committed to scan
    /// out `layer` at `geometry`. A cursor plane always samples its entire
    /// buffer (SRC_W/SRC_H pinned to the buffer's own dimensions) rather
    /// than `layer.source_crop`, per spec.md §4.4 scenario E3 — cursor
    /// images are never cropped.
    pub fn emit_properties(&self, layer: &OverlayLayer, geometry: Rect) -> PlaneProperties {
        let (src_x, src_y, src_w, src_h) = if self.plane_type == PlaneType::Cursor {
            (0.0, 0.0, layer.buffer.width as f32, layer.buffer.height as f32)
        } else {
            (layer.source_crop.x, layer.source_crop.y, layer.source_crop.width, layer.source_crop.height)
        };
        PlaneProperties {
            plane_id: self.id,
            fb_id: layer.buffer.id,
            fb_format: self.framebuffer_format(layer.buffer.format),
            crtc_x: geometry.x,
            crtc_y: geometry.y,
            crtc_w: geometry.width as u32,
            crtc_h: geometry.height as u32,
            src_x: to_fixed_16_16(src_x),
            src_y: to_fixed_16_16(src_y),
            src_w: to_fixed_16_16(src_w),
            src_h: to_fixed_16_16(src_h),
            rotation: layer.transform,
            alpha: layer.plane_alpha,
        }
    }

    /// The atomic properties for scanning out a composited off-screen
    /// target, whose entire extent is sampled (no source crop) onto
    /// `geometry`. Used by the display queue for render planes, where
    /// `layer.emit_properties` (single source layer) does not apply.
    pub fn emit_properties_for_target(&self, fb_id: u64, fb_format: DrmFourcc, buffer_width: u32, buffer_height: u32, geometry: Rect) -> PlaneProperties {
        PlaneProperties {
            plane_id: self.id,
            fb_id,
            fb_format,
            crtc_x: geometry.x,
            crtc_y: geometry.y,
            crtc_w: geometry.width as u32,
            crtc_h: geometry.height as u32,
            src_x: 0,
            src_y: 0,
            src_w: to_fixed_16_16(buffer_width as f32),
            src_h: to_fixed_16_16(buffer_height as f32),
            rotation: Transform::Normal,
            alpha: 255,
        }
    }
}

/// Converts a buffer-pixel coordinate to the 16.16 fixed-point
/// representation KMS atomic SRC_* properties use (spec.md §6).
fn to_fixed_16_16(value: f32) -> i32 {
    (value * 65536.0).round() as i32
}

/// The atomic-commit property values for one plane in one frame, ready to
/// hand to [`crate::mode_client::ModeClient`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneProperties {
    /// plane being committed
    pub plane_id: u32,
    /// framebuffer to scan out
    pub fb_id: u64,
    /// format the framebuffer was actually created with (may differ from the source buffer's own format, spec.md §4.4 ARGB->XRGB fallback)
    pub fb_format: DrmFourcc,
    /// CRTC_X
    pub crtc_x: i32,
    /// CRTC_Y
    pub crtc_y: i32,
    /// CRTC_W
    pub crtc_w: u32,
    /// CRTC_H
    pub crtc_h: u32,
    /// SRC_X, 16.16 fixed-point buffer pixels
    pub src_x: i32,
    /// SRC_Y, 16.16 fixed-point
    pub src_y: i32,
    /// SRC_W, 16.16 fixed-point
    pub src_w: i32,
    /// SRC_H, 16.16 fixed-point
    pub src_h: i32,
    /// rotation property
    pub rotation: Transform,
    /// plane alpha, 0-255
    pub alpha: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OverlayBuffer;

    fn plane(caps: PlaneCapabilities) -> Plane {
        Plane {
            id: 10,
            plane_type: PlaneType::Overlay,
            formats: vec![(DrmFourcc::Xrgb8888, vec![DrmModifier::Linear])],
            capabilities: caps,
            max_downscale: 1.0,
            max_upscale: 1.0,
            preferred_format: DrmFourcc::Xrgb8888,
            preferred_modifier: DrmModifier::Linear,
            in_use: false,
        }
    }

    fn layer() -> OverlayLayer {
        OverlayLayer {
            surface_id: 1,
            buffer: OverlayBuffer {
                id: 1,
                format: DrmFourcc::Xrgb8888,
                modifier: DrmModifier::Linear,
                width: 100,
                height: 100,
            },
            source_crop: crate::layer::RectF::full(100, 100),
            display_frame: Rect::new(0, 0, 100, 100),
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
    fn unsupported_format_is_rejected() {
        let p = plane(PlaneCapabilities::empty());
        let mut l = layer();
        l.buffer.format = DrmFourcc::Nv12;
        assert!(matches!(p.validate_layer(&l), Err(CapabilityError::UnsupportedFormat(_, _))));
    }

    #[test]
    fn rotation_without_capability_is_rejected() {
        let p = plane(PlaneCapabilities::empty());
        let mut l = layer();
        l.transform = Transform::_90;
        assert!(p.validate_layer(&l).is_err());
    }

    #[test]
    fn rotation_with_capability_is_accepted() {
        let p = plane(PlaneCapabilities::ROTATION);
        let mut l = layer();
        l.transform = Transform::_90;
        l.display_frame = Rect::new(0, 0, 100, 100);
        assert!(p.validate_layer(&l).is_ok());
    }

    #[test]
    fn cursor_plane_samples_full_buffer_regardless_of_source_crop() {
        let mut p = plane(PlaneCapabilities::empty());
        p.plane_type = PlaneType::Cursor;
        let mut l = layer();
        l.buffer.width = 64;
        l.buffer.height = 64;
        l.source_crop = crate::layer::RectF::new(10.0, 10.0, 20.0, 20.0);
        let props = p.emit_properties(&l, l.display_frame);
        assert_eq!(props.src_x, 0);
        assert_eq!(props.src_y, 0);
        assert_eq!(props.src_w, 64 << 16);
        assert_eq!(props.src_h, 64 << 16);
    }

    #[test]
    fn non_cursor_plane_uses_source_crop_as_16_16_fixed_point() {
        let p = plane(PlaneCapabilities::empty());
        let l = layer();
        let props = p.emit_properties(&l, l.display_frame);
        assert_eq!(props.src_w, 100 << 16);
        assert_eq!(props.src_h, 100 << 16);
    }

    #[test]
    fn primary_plane_without_argb_falls_back_to_xrgb_framebuffer() {
        let mut p = plane(PlaneCapabilities::empty());
        p.plane_type = PlaneType::Primary;
        p.formats = vec![(DrmFourcc::Xrgb8888, vec![DrmModifier::Linear])];
        assert_eq!(p.framebuffer_format(DrmFourcc::Argb8888), DrmFourcc::Xrgb8888);
        assert_eq!(p.framebuffer_format(DrmFourcc::Xrgb8888), DrmFourcc::Xrgb8888);
    }

    #[test]
    fn overlay_plane_has_no_argb_fallback() {
        let p = plane(PlaneCapabilities::empty());
        assert_eq!(p.framebuffer_format(DrmFourcc::Argb8888), DrmFourcc::Argb8888);
    }
}
