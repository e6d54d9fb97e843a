//! Buffer allocation as an external collaborator.
//!
//! The real buffer allocator (GBM, dumb-buffer, or a client-supplied dmabuf
//! importer) lives outside this crate's scope; it is abstracted behind
//! [`BufferHandler`] the way `backend::renderer::Bind`/`Offscreen` abstract
//! the GPU backend in the teacher, so the surface pool and renderer can be
//! driven by a test double.

use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::error::SurfaceError;

/// A single allocated scanout/render buffer, opaque to everything except the
/// `BufferHandler` that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayBuffer {
    /// allocator-assigned identity, unique for the lifetime of the buffer
    pub id: u64,
    /// pixel format
    pub format: DrmFourcc,
    /// layout modifier the buffer was allocated with
    pub modifier: DrmModifier,
    /// width in pixels
    pub width: u32,
    /// height in pixels
    pub height: u32,
}

/// External collaborator responsible for allocating and importing buffers.
///
/// Implemented by the embedder against their real GPU/allocator stack; a
/// [`TestBufferHandler`] is provided for use in this crate's own tests and
/// in embedders' integration tests.
pub trait BufferHandler: std::fmt::Debug {
    /// Allocates a new buffer able to hold `width`x`height` pixels in `format`,
    /// trying `modifiers` in order and returning the first that succeeds.
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        modifiers: &[DrmModifier],
    ) -> Result<OverlayBuffer, SurfaceError>;

    /// Releases a previously allocated buffer back to the allocator.
    fn free(&mut self, buffer: OverlayBuffer);
}

/// An in-memory [`BufferHandler`] that never fails and hands out buffers
/// with a configurable rejection list, for exercising the modifier
/// blacklist-on-reject path in [`crate::surface_pool`]'s tests.
#[derive(Debug, Default)]
pub struct TestBufferHandler {
    next_id: u64,
    rejected_modifiers: Vec<DrmModifier>,
}

impl TestBufferHandler {
    /// Creates a handler that will reject allocation attempts using `modifier`.
    pub fn reject(mut self, modifier: DrmModifier) -> Self {
        self.rejected_modifiers.push(modifier);
        self
    }
}

impl BufferHandler for TestBufferHandler {
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        modifiers: &[DrmModifier],
    ) -> Result<OverlayBuffer, SurfaceError> {
        for &modifier in modifiers {
            if self.rejected_modifiers.contains(&modifier) {
                continue;
            }
            self.next_id += 1;
            return Ok(OverlayBuffer {
                id: self.next_id,
                format,
                modifier,
                width,
                height,
            });
        }
        Err(SurfaceError::NoUsableModifier)
    }

    fn free(&mut self, _buffer: OverlayBuffer) {}
}
