//! Explicit, caller-constructed configuration.
//!
//! Passed once into [`crate::composer::HwComposer::new`] rather than read
//! from scattered `std::env::var` calls or a global singleton (spec.md §9,
//! "Global state").

/// Runtime configuration recognised by the composer.
///
/// Mirrors the environment flags documented in spec.md §6; [`ComposerConfig::from_env`]
/// exists only for parity with the original's compile-time flags, the struct itself
/// is the single source of truth everywhere else in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposerConfig {
    /// Disables explicit (fence-based) synchronization; falls back to implicit fencing.
    pub disable_explicit_sync: bool,
    /// Forces every layer onto the GPU-rendered primary plane, never using overlay planes.
    pub disable_overlay_usage: bool,
    /// Permits the plane manager to rely on display-hardware upscaling/downscaling.
    pub enable_downscaling: bool,
    /// Routes surface-pool recycling decisions through `tracing::trace!`.
    pub surface_recycle_tracing: bool,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            disable_explicit_sync: false,
            disable_overlay_usage: false,
            enable_downscaling: false,
            surface_recycle_tracing: false,
        }
    }
}

impl ComposerConfig {
    /// Builds a config from the environment variables named in spec.md §6.
    ///
    /// A variable counts as set if present and not equal to `"0"`.
    pub fn from_env() -> Self {
        let flag = |name: &str| std::env::var_os(name).is_some_and(|v| v != "0");
        Self {
            disable_explicit_sync: flag("DISABLE_EXPLICIT_SYNC"),
            disable_overlay_usage: flag("DISABLE_OVERLAY_USAGE"),
            enable_downscaling: flag("ENABLE_DOWNSCALING"),
            surface_recycle_tracing: flag("SURFACE_RECYCLE_TRACING"),
        }
    }

    /// Builder-style setter, for tests and embedders that don't want to go via the environment.
    pub fn with_overlay_usage(mut self, enabled: bool) -> Self {
        self.disable_overlay_usage = !enabled;
        self
    }

    /// Builder-style setter for downscaling support.
    pub fn with_downscaling(mut self, enabled: bool) -> Self {
        self.enable_downscaling = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_permissive() {
        let cfg = ComposerConfig::default();
        assert!(!cfg.disable_overlay_usage);
        assert!(!cfg.enable_downscaling);
    }

    #[test]
    fn builder_toggles_overlay_usage() {
        let cfg = ComposerConfig::default().with_overlay_usage(false);
        assert!(cfg.disable_overlay_usage);
    }
}
