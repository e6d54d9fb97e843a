//! Error types for every fallible subsystem boundary.
//!
//! Internal algorithms (the region engine, the plane assignment loop) signal
//! failure with plain booleans or fallback plans, as decided in
//! `spec.md` §7 and `DESIGN.md`; only boundary crossings that a caller needs
//! to act on individually raise a typed error here.

use std::fmt;

/// A connector or CRTC was asked to do something it lacks the hardware for.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    /// The requested pixel format / modifier combination is not advertised by any plane.
    #[error("no plane advertises format {0:?} with modifier {1:?}")]
    UnsupportedFormat(drm_fourcc::DrmFourcc, drm_fourcc::DrmModifier),
    /// A rotation or scaling request exceeds what the plane hardware can apply.
    #[error("plane {plane} cannot satisfy transform {transform:?}")]
    UnsupportedTransform {
        /// plane id that was asked
        plane: u32,
        /// the rejected transform
        transform: crate::geometry::Transform,
    },
    /// The connector does not expose the named property at all.
    #[error("connector has no property named {0:?}")]
    MissingProperty(&'static str),
}

/// Failure to acquire an off-screen render target from the surface pool.
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    /// Every candidate modifier was rejected by the allocator or blacklisted from a prior failure.
    #[error("no surface could be allocated: all modifiers rejected")]
    NoUsableModifier,
    /// The pool has no free slot and the caller did not release one.
    #[error("surface pool exhausted, call release_surface first")]
    PoolExhausted,
    /// The underlying buffer allocator reported an error.
    #[error("buffer allocation failed: {0}")]
    Allocation(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Failure while driving the KMS atomic-commit interface.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The dry-run (`TEST_ONLY`) commit rejected the proposed atomic state.
    #[error("atomic test commit rejected the proposed state")]
    TestFailed,
    /// The real commit was rejected after a passing test commit (hardware/driver inconsistency).
    #[error("atomic commit failed after a passing test commit")]
    CommitRejected,
    /// The mode client returned an OS-level error performing the ioctl.
    #[error("mode client ioctl failed: {0}")]
    Io(#[source] std::io::Error),
}

/// Failure to apply a display mode (resolution/refresh change).
#[derive(Debug, thiserror::Error)]
pub enum ModesetError {
    /// No mode matching the request is in the connector's mode list.
    #[error("requested mode not supported by the connector")]
    UnsupportedMode,
    /// The commit carrying the modeset blob failed.
    #[error("modeset commit failed: {0}")]
    Commit(#[from] CommitError),
}

/// Failure while waiting on a buffer's acquire/release fence.
#[derive(Debug, thiserror::Error)]
pub enum FenceError {
    /// The fence did not signal within the allotted deadline.
    #[error("fence wait timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The poll on the fence fd itself failed.
    #[error("fence fd poll failed: {0}")]
    Poll(#[source] std::io::Error),
}

/// Top-level error returned by the public composer API.
///
/// Wraps every subsystem error with `#[error(transparent)]`/`#[from]`, the
/// way `backend::drm::compositor::RenderFrameError` wraps `FrameError` in
/// the teacher, rather than flattening everything into one enum.
#[derive(Debug, thiserror::Error)]
pub enum ComposerError {
    /// No hardware resource (plane, CRTC, buffer slot) was available to satisfy the request.
    #[error("no resources available: {0}")]
    NoResources(String),
    /// A caller-supplied argument was invalid (out-of-range index, zero-sized rect, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The requested capability is not supported by this display's hardware.
    #[error(transparent)]
    CapabilityMismatch(#[from] CapabilityError),
    /// Surface pool failure.
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    /// Atomic commit failure.
    #[error(transparent)]
    Commit(#[from] CommitError),
    /// Modeset failure.
    #[error(transparent)]
    Modeset(#[from] ModesetError),
    /// Fence wait failure.
    #[error(transparent)]
    Fence(#[from] FenceError),
    /// The display was physically disconnected mid-operation.
    #[error("display {0} is disconnected")]
    Disconnected(DisplayId),
}

/// Opaque identifier for a physical display, reused across error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplayId(pub u32);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Convenience alias used throughout the public API.
pub type Result<T, E = ComposerError> = std::result::Result<T, E>;
