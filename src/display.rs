//! Physical display connection lifecycle, power mode, clone relationships,
//! and vsync/hotplug registration (C10).
//!
//! Grounded on `original_source/common/display/physicaldisplay.cpp`:
//! `InitializeDisplay`/`Connect`/`DisConnect` drive the lifecycle bitmask,
//! `SetPowerMode` stashes a pending power mode while disconnected and
//! otherwise forwards it to the queue, and `PresentClone` is how a source
//! display drives every display cloned from it after its own `Present`
//! returns (spec.md §8 invariant 8).

use std::sync::Mutex;

use bitflags::bitflags;

use crate::buffer::BufferHandler;
use crate::config::ComposerConfig;
use crate::error::{ComposerError, DisplayId};
use crate::fence::Fence;
use crate::layer::OverlayLayer;
use crate::mode_client::{BroadcastRgb, DisplayMode, ModeClient, PowerMode};
use crate::plane_manager::PlaneManager;
use crate::queue::{ColorCorrection, DisplayQueue, PresentResult};
use crate::renderer::Renderer;

bitflags! {
    /// Lifecycle bitmask, mirroring `PhysicalDisplay`'s state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DisplayState: u32 {
        /// a connector is currently plugged in and usable
        const CONNECTED = 1 << 0;
        /// the next commit must carry a mode-set blob
        const NEEDS_MODESET = 1 << 1;
        /// a power-mode change is queued until the display (re)connects
        const PENDING_POWER_MODE = 1 << 2;
        /// a hotplug or config change requires the queue to rebuild its plan
        const UPDATE_DISPLAY = 1 << 3;
        /// a disconnect has been requested but clones/queue teardown is still in flight
        const DISCONNECTION_IN_PROGRESS = 1 << 4;
        /// `connect()` has completed at least once
        const INITIALIZED = 1 << 5;
        /// clones need to be re-driven after this display's next present
        const REFRESH_CLONES = 1 << 6;
    }
}

/// Per-refresh vsync callback: `(display_id, timestamp_ns)`.
pub type VsyncCallback = Box<dyn FnMut(DisplayId, u64) + Send>;
/// Hotplug callback: `(display_id, connected)`.
pub type HotplugCallback = Box<dyn FnMut(DisplayId, bool) + Send>;

/// One physical (or virtual-clone) display: identity, mode-list, lifecycle
/// state, and the per-display queue that actually sequences frames.
pub struct PhysicalDisplay {
    id: DisplayId,
    pipe: u32,
    connector_id: u32,
    crtc_id: u32,
    state: DisplayState,
    power_mode: PowerMode,
    pending_power_mode: Option<PowerMode>,
    active_mode: Option<DisplayMode>,
    broadcast_rgb: BroadcastRgb,
    gamma: f32,
    contrast: u8,
    brightness: u8,
    /// id of the display this one clones, if any
    source_display: Option<DisplayId>,
    /// displays that clone this one
    clones: Vec<DisplayId>,
    queue: DisplayQueue,
    vsync_cb: Mutex<Option<(VsyncCallback, u32)>>,
    hotplug_cb: Mutex<Option<(HotplugCallback, u32)>>,
}

impl std::fmt::Debug for PhysicalDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDisplay")
            .field("id", &self.id)
            .field("pipe", &self.pipe)
            .field("connector_id", &self.connector_id)
            .field("crtc_id", &self.crtc_id)
            .field("state", &self.state)
            .field("power_mode", &self.power_mode)
            .field("source_display", &self.source_display)
            .field("clones", &self.clones)
            .finish()
    }
}

impl PhysicalDisplay {
    /// Creates a disconnected display for `connector_id`/`crtc_id`, owning
    /// `plane_manager`'s planes.
    pub fn new(id: DisplayId, pipe: u32, connector_id: u32, crtc_id: u32, plane_manager: PlaneManager, config: ComposerConfig) -> Self {
        Self {
            id,
            pipe,
            connector_id,
            crtc_id,
            state: DisplayState::empty(),
            power_mode: PowerMode::Off,
            pending_power_mode: None,
            active_mode: None,
            broadcast_rgb: BroadcastRgb::Automatic,
            gamma: 1.0,
            contrast: 128,
            brightness: 128,
            source_display: None,
            clones: Vec::new(),
            queue: DisplayQueue::new(plane_manager, config),
            vsync_cb: Mutex::new(None),
            hotplug_cb: Mutex::new(None),
        }
    }

    /// Stable identity for this display.
    pub fn id(&self) -> DisplayId {
        self.id
    }

    /// KMS pipe index (for multi-CRTC configuration lookups).
    pub fn pipe(&self) -> u32 {
        self.pipe
    }

    /// Current lifecycle bitmask.
    pub fn state(&self) -> DisplayState {
        self.state
    }

    /// True once `connect()` has run at least once and `disconnect()` has
    /// not since cleared it.
    pub fn is_connected(&self) -> bool {
        self.state.contains(DisplayState::CONNECTED)
    }

    /// Marks the display connected, applying any power mode that was queued
    /// while it was away, per spec.md §4.9 `connect`.
    pub fn connect(&mut self, mode_client: &mut dyn ModeClient) {
        self.state.remove(DisplayState::INITIALIZED);
        self.state.insert(DisplayState::CONNECTED | DisplayState::NEEDS_MODESET);
        self.queue.force_full_revalidation();
        mode_client.set_broadcast_rgb(self.broadcast_rgb);
        if let Some(mode) = self.pending_power_mode.take() {
            self.update_power_mode(mode);
        }
        self.state.insert(DisplayState::INITIALIZED);
        tracing::debug!(display = ?self.id, "display: connected");
    }

    /// Begins tearing the display down: clears `CONNECTED` but leaves
    /// `DISCONNECTION_IN_PROGRESS`/`REFRESH_CLONES` set until the caller has
    /// finished reassigning any displays that were cloning this one.
    pub fn mark_for_disconnect(&mut self) {
        self.state.insert(DisplayState::DISCONNECTION_IN_PROGRESS | DisplayState::REFRESH_CLONES);
        tracing::debug!(display = ?self.id, "display: marked for disconnect");
    }

    /// Completes the disconnect, releasing surfaces and clearing `CONNECTED`.
    pub fn disconnect(&mut self, buffer_handler: &mut dyn BufferHandler) {
        self.queue.release_free_surfaces(buffer_handler);
        self.state.remove(DisplayState::CONNECTED | DisplayState::DISCONNECTION_IN_PROGRESS);
        tracing::debug!(display = ?self.id, "display: disconnected");
    }

    /// Sets the active display mode, queuing a mode-set on the next commit.
    pub fn set_active_config(&mut self, mode: DisplayMode, mode_blob: u32) {
        self.active_mode = Some(mode);
        self.queue.request_modeset(mode_blob);
        self.state.insert(DisplayState::NEEDS_MODESET);
    }

    /// The currently selected mode, if any.
    pub fn active_config(&self) -> Option<DisplayMode> {
        self.active_mode
    }

    /// Requests a power-mode transition. If the display isn't connected (or
    /// is mid-disconnect), the request is stashed as `PENDING_POWER_MODE`
    /// and applied on the next `connect()`; otherwise it takes effect now.
    pub fn set_power_mode(&mut self, mode: PowerMode) {
        if !self.is_connected() || self.state.contains(DisplayState::DISCONNECTION_IN_PROGRESS) {
            self.pending_power_mode = Some(mode);
            self.state.insert(DisplayState::PENDING_POWER_MODE);
            return;
        }
        self.update_power_mode(mode);
    }

    fn update_power_mode(&mut self, mode: PowerMode) {
        self.power_mode = mode;
        self.state.remove(DisplayState::PENDING_POWER_MODE);
        if mode == PowerMode::On {
            self.state.insert(DisplayState::NEEDS_MODESET);
        }
        self.queue.request_power_mode(mode);
    }

    /// Current power mode.
    pub fn power_mode(&self) -> PowerMode {
        self.power_mode
    }

    /// Sets the connector's Broadcast RGB range (spec.md §4.11 / `SPEC_FULL.md` §4.11).
    pub fn set_broadcast_rgb(&mut self, range: BroadcastRgb, mode_client: &mut dyn ModeClient) {
        self.broadcast_rgb = range;
        mode_client.set_broadcast_rgb(range);
    }

    /// Queues gamma/contrast/brightness to apply at the next commit.
    pub fn set_gamma(&mut self, gamma: f32) {
        self.gamma = gamma;
        self.push_color_correction();
    }

    /// Queues a contrast update (0..255) to apply at the next commit.
    pub fn set_contrast(&mut self, contrast: u8) {
        self.contrast = contrast;
        self.push_color_correction();
    }

    /// Queues a brightness update (0..255) to apply at the next commit.
    pub fn set_brightness(&mut self, brightness: u8) {
        self.brightness = brightness;
        self.push_color_correction();
    }

    fn push_color_correction(&mut self) {
        self.queue.request_color_correction(ColorCorrection { gamma: self.gamma, contrast: self.contrast, brightness: self.brightness });
    }

    /// Registers (replacing any previous) per-refresh vsync callback.
    pub fn register_vsync_callback(&self, callback: VsyncCallback, display_id: u32) {
        *self.vsync_cb.lock().unwrap() = Some((callback, display_id));
    }

    /// Registers (replacing any previous) hotplug callback.
    pub fn register_hotplug_callback(&self, callback: HotplugCallback, display_id: u32) {
        *self.hotplug_cb.lock().unwrap() = Some((callback, display_id));
    }

    /// Delivers a vsync tick to the registered callback, if any.
    ///
    /// Spec.md §5: "Hotplug callbacks are delivered after the modeset lock
    /// is released, to avoid re-entrancy into display state" — the same
    /// discipline applies here: call this only once the present/modeset
    /// work for the tick has finished.
    pub fn dispatch_vsync(&self, timestamp_ns: u64) {
        if let Some((cb, _id)) = self.vsync_cb.lock().unwrap().as_mut() {
            cb(self.id, timestamp_ns);
        }
    }

    /// Delivers a hotplug event to the registered callback, if any.
    pub fn dispatch_hotplug(&self, connected: bool) {
        if let Some((cb, _id)) = self.hotplug_cb.lock().unwrap().as_mut() {
            cb(self.id, connected);
        }
    }

    /// Makes this display a clone of `source`: its own `present()` will
    /// defer to the source instead of sequencing its own frames.
    pub fn set_source_display(&mut self, source: DisplayId) {
        self.source_display = Some(source);
    }

    /// The display this one clones, if it is a clone.
    pub fn source_display(&self) -> Option<DisplayId> {
        self.source_display
    }

    /// Registers `clone` as cloning this display.
    pub fn add_clone(&mut self, clone: DisplayId) {
        if !self.clones.contains(&clone) {
            self.clones.push(clone);
        }
    }

    /// Removes `clone` from this display's clone list.
    pub fn remove_clone(&mut self, clone: DisplayId) {
        self.clones.retain(|c| *c != clone);
    }

    /// Every display currently cloning this one.
    pub fn clones(&self) -> &[DisplayId] {
        &self.clones
    }

    /// Scales `frame` (in the source display's coordinate space) into this
    /// clone's own geometry, per `UpdateScalingRatio`.
    pub fn scale_frame_from_source(&self, frame: crate::geometry::Rect, source_width: u32, source_height: u32) -> crate::geometry::Rect {
        let Some(target) = self.active_mode else { return frame };
        if source_width == 0 || source_height == 0 {
            return frame;
        }
        let sx = target.width as f32 / source_width as f32;
        let sy = target.height as f32 / source_height as f32;
        crate::geometry::Rect::new(
            (frame.x as f32 * sx) as i32,
            (frame.y as f32 * sy) as i32,
            (frame.width as f32 * sx) as i32,
            (frame.height as f32 * sy) as i32,
        )
    }

    /// Sequences one frame for this display. Per spec.md §7 "Disconnected
    /// aborts `present` early with `true`", a mid-disconnect present is a
    /// silent no-op rather than an error.
    pub fn present(
        &mut self,
        layers: Vec<OverlayLayer>,
        mode_client: &mut dyn ModeClient,
        buffer_handler: &mut dyn BufferHandler,
        renderer: &mut dyn Renderer,
    ) -> Result<PresentResult, ComposerError> {
        if self.state.contains(DisplayState::DISCONNECTION_IN_PROGRESS) || !self.is_connected() {
            return Ok(PresentResult { retire_fence: None });
        }
        if self.power_mode != PowerMode::On {
            return Ok(PresentResult { retire_fence: None });
        }
        match self.queue.present(layers, mode_client, buffer_handler, renderer) {
            Ok(result) => {
                self.state.remove(DisplayState::NEEDS_MODESET);
                Ok(result)
            }
            Err(e) => {
                self.queue.force_full_revalidation();
                self.state.insert(DisplayState::NEEDS_MODESET);
                Err(e)
            }
        }
    }

    /// Blocks until `previous`'s fence signals before the next `present`
    /// may issue its commit (spec.md §5 frame ordering invariant).
    pub fn ensure_ready_for_next_frame(&self, previous: Fence, timeout: std::time::Duration) -> Result<(), ComposerError> {
        self.queue.ensure_ready_for_next_frame(previous, timeout)
    }

    /// Access to the underlying queue, for callers that need to inspect
    /// mode-set state across a `present`/`ensure_ready_for_next_frame` pair.
    pub fn needs_modeset(&self) -> bool {
        self.queue.needs_modeset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode_client::TestModeClient;
    use crate::plane::{Plane, PlaneCapabilities, PlaneType};
    use drm_fourcc::{DrmFourcc, DrmModifier};

    fn primary_plane_manager() -> PlaneManager {
        let primary = Plane {
            id: 0,
            plane_type: PlaneType::Primary,
            formats: vec![(DrmFourcc::Xrgb8888, vec![DrmModifier::Linear])],
            capabilities: PlaneCapabilities::all(),
            max_downscale: 1.0,
            max_upscale: 1.0,
            preferred_format: DrmFourcc::Xrgb8888,
            preferred_modifier: DrmModifier::Linear,
            in_use: false,
        };
        PlaneManager::new(vec![primary], ComposerConfig::default())
    }

    fn display() -> PhysicalDisplay {
        PhysicalDisplay::new(DisplayId(0), 0, 10, 20, primary_plane_manager(), ComposerConfig::default())
    }

    #[test]
    fn connect_clears_disconnection_and_applies_pending_power_mode() {
        let mut d = display();
        let mut mc = TestModeClient::new(vec![]);
        d.set_power_mode(PowerMode::On);
        assert!(d.state().contains(DisplayState::PENDING_POWER_MODE));
        d.connect(&mut mc);
        assert!(d.is_connected());
        assert_eq!(d.power_mode(), PowerMode::On);
        assert!(!d.state().contains(DisplayState::PENDING_POWER_MODE));
    }

    #[test]
    fn present_while_disconnected_is_a_silent_no_op() {
        let mut d = display();
        let mut mc = TestModeClient::new(vec![]);
        let mut bh = crate::buffer::TestBufferHandler::default();
        let mut renderer = crate::renderer::TestRenderer::default();
        let result = d.present(vec![], &mut mc, &mut bh, &mut renderer).unwrap();
        assert!(result.retire_fence.is_none());
    }

    #[test]
    fn power_off_round_trip_forces_a_modeset_on_next_commit() {
        let mut d = display();
        let mut mc = TestModeClient::new(vec![]);
        d.connect(&mut mc);
        d.set_power_mode(PowerMode::Off);
        assert_eq!(d.power_mode(), PowerMode::Off);
        d.set_power_mode(PowerMode::On);
        assert!(d.needs_modeset());
    }

    #[test]
    fn clone_tree_tracks_both_directions() {
        let mut source = display();
        source.add_clone(DisplayId(1));
        assert_eq!(source.clones(), &[DisplayId(1)]);
        source.remove_clone(DisplayId(1));
        assert!(source.clones().is_empty());
    }

    #[test]
    fn scaling_ratio_maps_source_frame_into_clone_geometry() {
        let mut clone = display();
        clone.active_mode = Some(DisplayMode { width: 1280, height: 720, refresh_mhz: 60000, preferred: true });
        let scaled = clone.scale_frame_from_source(crate::geometry::Rect::new(0, 0, 1920, 1080), 1920, 1080);
        assert_eq!(scaled, crate::geometry::Rect::new(0, 0, 1280, 720));
    }
}
