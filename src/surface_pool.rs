//! Off-screen render target pooling (C2).
//!
//! Grounded on `original_source/common/display/displayplanemanager.cpp::EnsureOffScreenTarget`
//! (acquire + modifier blacklist-on-reject) and
//! `displayplanestate.cpp::SwapSurfaceIfNeeded` (the triple-buffer ring
//! rotation). The original tracks buffer liveness with an untyped ref-count
//! whose `SetInUse(true)` bumps it to 3; this module replaces that with an
//! explicit 3-slot ring and an [`Age`] enum per DESIGN.md's Open Question 3,
//! so the invariant "at most one slot in use at a time" is a debug assertion
//! rather than an implicit count.

use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::buffer::{BufferHandler, OverlayBuffer};
use crate::error::SurfaceError;
use crate::fence::Fence;
use crate::geometry::{Rect, Transform};
use crate::plane_state::PlaneState;

/// Lifecycle state of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Age {
    /// never rendered into
    Unused,
    /// holds a buffer currently scanned out or queued for scanout
    InUse,
    /// holds a buffer from `n` frames ago, available for damage-tracked reuse
    Stale(u8),
}

/// One slot of the pool's triple-buffer ring.
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    /// the backing buffer, once allocated
    pub buffer: Option<OverlayBuffer>,
    /// this slot's age
    pub age: Age,
}

impl Default for Slot {
    fn default() -> Self {
        Self { buffer: None, age: Age::Unused }
    }
}

/// Whether the off-screen target handed back by [`SurfacePool::acquire`]
/// needs a full redraw or can be touched up with just this frame's damage
/// (spec.md §4.2's clear-type policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearType {
    /// no draw is needed at all (nothing changed and the buffer is already current)
    None,
    /// only `surface_damage` needs to be redrawn
    Partial,
    /// the whole target must be redrawn — new allocation, geometry/format change, or video content
    Full,
}

/// One off-screen render target handed to the renderer for one frame.
///
/// Grounded on `original_source/common/compositor/nativesurface.h`'s
/// `NativeSurface`: a buffer paired with the damage/clear policy the
/// compositor needs to decide how much of it to redraw.
#[derive(Debug)]
pub struct OffScreenTarget {
    /// the backing buffer to render into and scan out
    pub buffer: OverlayBuffer,
    /// how much of the target needs to be redrawn this frame
    pub clear_type: ClearType,
    /// the region that actually needs to be redrawn (the whole buffer when `clear_type` is `Full`)
    pub surface_damage: Rect,
    /// the plane's scanout transform, carried through for the renderer to apply
    pub transform: Transform,
    /// true once this target has actually been scanned out at least once
    pub on_screen: bool,
    /// the renderer's out-fence for the draw that produced this target's current contents, if any
    pub acquire_fence: Option<Fence>,
}

/// A pool of off-screen render targets for a single render plane, recycled
/// across frames instead of reallocated.
#[derive(Debug, Default)]
pub struct SurfacePool {
    slots: [Slot; 3],
    blacklisted_modifiers: Vec<DrmModifier>,
    trace_recycling: bool,
}

impl SurfacePool {
    /// Creates an empty pool. Geometry, format, and modifiers are supplied
    /// per [`Self::acquire`] call rather than fixed at construction, since
    /// a plane's assigned layers (and therefore its off-screen target's
    /// required size/format) can change from one frame to the next.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables `tracing::trace!` output for recycling decisions (spec.md §6 `SURFACE_RECYCLE_TRACING`).
    pub fn set_recycle_tracing(&mut self, enabled: bool) {
        self.trace_recycling = enabled;
    }

    fn candidate_modifiers<'a>(&self, modifiers: &'a [DrmModifier]) -> Vec<DrmModifier> {
        modifiers.iter().copied().filter(|m| !self.blacklisted_modifiers.contains(m)).collect()
    }

    /// Acquires the next available slot's buffer for `plane_state`,
    /// allocating (or reallocating, on a geometry/format change) it as
    /// needed and recycling it otherwise. Rotates the ring
    /// `[1, 2, 0] -> [2, 0, 1] -> ...` the way `SwapSurfaceIfNeeded` rotates
    /// its three surfaces, so the most-stale slot is always offered next.
    ///
    /// `is_video` forces a full clear every frame: video content is
    /// typically converted (YUV->RGB) as part of the draw, which touches
    /// the whole buffer regardless of which pixels actually changed.
    #[allow(clippy::too_many_arguments)]
    pub fn acquire(
        &mut self,
        handler: &mut dyn BufferHandler,
        plane_state: &PlaneState,
        width: u32,
        height: u32,
        preferred_format: DrmFourcc,
        preferred_modifier: DrmModifier,
        candidate_modifiers: &[DrmModifier],
        is_video: bool,
    ) -> Result<OffScreenTarget, SurfaceError> {
        let idx = self.most_stale_slot();
        let geometry_changed = match &self.slots[idx].buffer {
            None => true,
            Some(b) => b.width != width || b.height != height || b.format != preferred_format,
        };

        if geometry_changed {
            let mut candidates = self.candidate_modifiers(candidate_modifiers);
            if let Some(pos) = candidates.iter().position(|m| *m == preferred_modifier) {
                candidates.swap(0, pos);
            }
            if candidates.is_empty() {
                return Err(SurfaceError::NoUsableModifier);
            }
            let buffer = match handler.allocate(width, height, preferred_format, &candidates) {
                Ok(b) => b,
                Err(SurfaceError::NoUsableModifier) => {
                    if let Some(bad) = candidates.first() {
                        self.blacklisted_modifiers.push(*bad);
                    }
                    let retry = self.candidate_modifiers(candidate_modifiers);
                    if retry.is_empty() {
                        return Err(SurfaceError::NoUsableModifier);
                    }
                    handler.allocate(width, height, preferred_format, &retry)?
                }
                Err(e) => return Err(e),
            };
            if self.trace_recycling {
                tracing::trace!(slot = idx, id = buffer.id, "surface_pool: allocated new buffer");
            }
            if let Some(old) = self.slots[idx].buffer.take() {
                handler.free(old);
            }
            self.slots[idx].buffer = Some(buffer);
        } else if self.trace_recycling {
            tracing::trace!(slot = idx, "surface_pool: recycling existing buffer");
        }

        self.mark_in_use(idx);

        let clear_type = if geometry_changed || is_video { ClearType::Full } else { ClearType::Partial };
        let surface_damage = match clear_type {
            ClearType::Full => Rect::new(0, 0, width as i32, height as i32),
            _ => plane_state.display_frame,
        };

        Ok(OffScreenTarget {
            buffer: self.slots[idx].buffer.expect("just allocated or already present"),
            clear_type,
            surface_damage,
            transform: plane_state.transform,
            on_screen: false,
            acquire_fence: None,
        })
    }

    fn most_stale_slot(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| match s.age {
                Age::Unused => u16::MAX,
                Age::Stale(n) => n as u16,
                Age::InUse => 0,
            })
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    fn mark_in_use(&mut self, idx: usize) {
        debug_assert!(
            self.slots.iter().filter(|s| s.age == Age::InUse).count() <= 1,
            "surface pool invariant: at most one slot in use at a time"
        );
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.age = if i == idx {
                Age::InUse
            } else {
                match slot.age {
                    Age::Unused => Age::Unused,
                    Age::InUse => Age::Stale(1),
                    Age::Stale(n) => Age::Stale(n.saturating_add(1)),
                }
            };
        }
    }

    /// Number of slots that currently hold an allocated buffer.
    pub fn allocated_count(&self) -> usize {
        self.slots.iter().filter(|s| s.buffer.is_some()).count()
    }

    /// Frees every slot not currently in use back to `handler`, the way an
    /// explicit "release free" request drops age −1 surfaces at disconnect,
    /// end-of-frame recycling, or under memory pressure (spec.md §4.2). The
    /// in-use slot, if any, is left untouched.
    pub fn release_free(&mut self, handler: &mut dyn BufferHandler) {
        for slot in self.slots.iter_mut() {
            if slot.age == Age::InUse {
                continue;
            }
            if let Some(buffer) = slot.buffer.take() {
                handler.free(buffer);
            }
            slot.age = Age::Unused;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TestBufferHandler;

    fn state(display_frame: Rect) -> PlaneState {
        let mut s = PlaneState::new(1);
        s.display_frame = display_frame;
        s
    }

    #[test]
    fn first_three_acquires_allocate_distinct_slots() {
        let mut pool = SurfacePool::new();
        let mut handler = TestBufferHandler::default();
        let st = state(Rect::new(0, 0, 100, 100));
        let mods = [DrmModifier::Linear];
        let a = pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, false).unwrap();
        let b = pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, false).unwrap();
        let c = pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, false).unwrap();
        assert_eq!(pool.allocated_count(), 3);
        assert_ne!(a.buffer.id, b.buffer.id);
        assert_ne!(b.buffer.id, c.buffer.id);
    }

    #[test]
    fn fourth_acquire_recycles_the_first_slot() {
        let mut pool = SurfacePool::new();
        let mut handler = TestBufferHandler::default();
        let st = state(Rect::new(0, 0, 100, 100));
        let mods = [DrmModifier::Linear];
        let a = pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, false).unwrap();
        pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, false).unwrap();
        pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, false).unwrap();
        let d = pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, false).unwrap();
        assert_eq!(a.buffer.id, d.buffer.id);
        assert_eq!(pool.allocated_count(), 3);
        // geometry unchanged on recycle => only the damaged area needs a redraw
        assert_eq!(d.clear_type, ClearType::Partial);
    }

    #[test]
    fn geometry_change_forces_a_full_clear() {
        let mut pool = SurfacePool::new();
        let mut handler = TestBufferHandler::default();
        let st = state(Rect::new(0, 0, 100, 100));
        let mods = [DrmModifier::Linear];
        let a = pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, false).unwrap();
        assert_eq!(a.clear_type, ClearType::Full);
    }

    #[test]
    fn video_targets_always_clear_full() {
        let mut pool = SurfacePool::new();
        let mut handler = TestBufferHandler::default();
        let st = state(Rect::new(0, 0, 100, 100));
        let mods = [DrmModifier::Linear];
        pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, true).unwrap();
        let second = pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, true).unwrap();
        assert_eq!(second.clear_type, ClearType::Full);
    }

    #[test]
    fn rejected_modifier_is_blacklisted_and_retried() {
        let mut pool = SurfacePool::new();
        let mut handler = TestBufferHandler::default().reject(DrmModifier::Linear);
        let st = state(Rect::new(0, 0, 100, 100));
        let mods = [DrmModifier::Linear, DrmModifier::Invalid];
        let buf = pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, false).unwrap();
        assert_eq!(buf.buffer.modifier, DrmModifier::Invalid);
    }

    #[test]
    fn exhausted_modifiers_is_an_error() {
        let mut pool = SurfacePool::new();
        let mut handler = TestBufferHandler::default().reject(DrmModifier::Linear);
        let st = state(Rect::new(0, 0, 100, 100));
        let mods = [DrmModifier::Linear];
        assert!(pool.acquire(&mut handler, &st, 100, 100, DrmFourcc::Xrgb8888, DrmModifier::Linear, &mods, false).is_err());
    }
}
