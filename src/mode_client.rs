//! The KMS atomic-commit surface as an external collaborator.
//!
//! Everything this crate knows about a real DRM/KMS device goes through
//! [`ModeClient`], abstracting the ioctl surface spec.md §1/§9 calls out as
//! external (and per `DESIGN.md`, the reason the `drm` crate itself is not a
//! dependency: its `Mode` type has no safe constructor, which would make
//! this trait's test double impossible to build cheaply).

use crate::error::CommitError;
use crate::plane::PlaneProperties;

/// A display mode: resolution, refresh rate, and the driver's resource handle for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayMode {
    /// horizontal resolution in pixels
    pub width: u32,
    /// vertical resolution in pixels
    pub height: u32,
    /// refresh rate in milli-Hz, matching the KMS `vrefresh` convention
    pub refresh_mhz: u32,
    /// true if the driver reports this as the connector's preferred mode
    pub preferred: bool,
}

/// Connector power state, mirroring the DPMS property's enum values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    /// fully powered, actively scanning out
    On,
    /// powered down, display asleep
    Off,
}

/// The connector's `Broadcast RGB` property (spec.md §4.11 / `SPEC_FULL.md` §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastRgb {
    /// let the driver pick based on what the sink reports
    Automatic,
    /// always output full-range RGB
    Full,
}

/// One atomic commit request: the plane properties to set, plus whether this
/// is a dry-run (`TEST_ONLY`) or a real commit.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    /// plane properties to apply
    pub planes: Vec<PlaneProperties>,
    /// if set, the mode blob id to attach this commit (a modeset)
    pub mode_blob: Option<u32>,
    /// requested power mode, if changing
    pub power_mode: Option<PowerMode>,
}

/// External collaborator abstracting one connector/CRTC's KMS atomic interface.
pub trait ModeClient: std::fmt::Debug {
    /// The connector's available modes, in driver-reported order.
    fn modes(&self) -> &[DisplayMode];

    /// Performs a dry-run (`TEST_ONLY`) atomic commit, returning whether the
    /// driver would accept it.
    fn test_commit(&mut self, request: &CommitRequest) -> bool;

    /// Performs a real atomic commit. Callers must have passed the same
    /// request through [`Self::test_commit`] first and seen it succeed,
    /// per spec.md's dry-run-then-commit discipline.
    fn commit(&mut self, request: &CommitRequest) -> Result<(), CommitError>;

    /// Sets the connector's `Broadcast RGB` property, applied on the next commit.
    fn set_broadcast_rgb(&mut self, range: BroadcastRgb);

    /// Uploads `lut` as the CRTC's `GAMMA_LUT` property blob, applied on the
    /// next commit (spec.md §4.8 color correction).
    fn set_gamma_lut(&mut self, lut: [u16; 256]);
}

/// A [`ModeClient`] double for tests: always accepts commits unless told to
/// reject the next one, and records every request it was asked to make.
#[derive(Debug)]
pub struct TestModeClient {
    modes: Vec<DisplayMode>,
    reject_next_test: bool,
    /// requests passed to `commit`, in order
    pub committed: Vec<CommitRequest>,
    broadcast_rgb: BroadcastRgb,
    /// the most recently uploaded `GAMMA_LUT` blob, if any
    pub gamma_lut: Option<[u16; 256]>,
}

impl TestModeClient {
    /// Creates a test client advertising `modes`.
    pub fn new(modes: Vec<DisplayMode>) -> Self {
        Self {
            modes,
            reject_next_test: false,
            committed: Vec::new(),
            broadcast_rgb: BroadcastRgb::Automatic,
            gamma_lut: None,
        }
    }

    /// Makes the next `test_commit` call fail, to exercise fallback paths.
    pub fn reject_next_commit(&mut self) {
        self.reject_next_test = true;
    }

    /// The current broadcast RGB setting, for assertions in tests.
    pub fn broadcast_rgb(&self) -> BroadcastRgb {
        self.broadcast_rgb
    }
}

impl ModeClient for TestModeClient {
    fn modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    fn test_commit(&mut self, _request: &CommitRequest) -> bool {
        if self.reject_next_test {
            self.reject_next_test = false;
            false
        } else {
            true
        }
    }

    fn commit(&mut self, request: &CommitRequest) -> Result<(), CommitError> {
        self.committed.push(request.clone());
        Ok(())
    }

    fn set_broadcast_rgb(&mut self, range: BroadcastRgb) {
        self.broadcast_rgb = range;
    }

    fn set_gamma_lut(&mut self, lut: [u16; 256]) {
        self.gamma_lut = Some(lut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_test_commit_is_observed_once() {
        let mut client = TestModeClient::new(vec![]);
        client.reject_next_commit();
        let req = CommitRequest { planes: vec![], mode_blob: None, power_mode: None };
        assert!(!client.test_commit(&req));
        assert!(client.test_commit(&req));
    }

    #[test]
    fn broadcast_rgb_defaults_to_automatic() {
        let client = TestModeClient::new(vec![]);
        assert_eq!(client.broadcast_rgb(), BroadcastRgb::Automatic);
    }
}
