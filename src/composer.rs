//! Public client API (spec.md §6).
//!
//! Grounded on `backend::drm::output::DrmOutputManager`: a thin registry
//! that owns one entry per connector (here, one [`PhysicalDisplay`] per
//! entry) and hands the caller references to drive by id, while the actual
//! KMS/GPU/allocator work stays behind the `ModeClient`/`Renderer`/
//! `BufferHandler` collaborator traits those displays were built with.
//! Two language bindings would wrap this same type identically, matching
//! spec.md §6 "two bindings, identical semantics".

use indexmap::IndexMap;

use crate::buffer::BufferHandler;
use crate::config::ComposerConfig;
use crate::display::{HotplugCallback, PhysicalDisplay, VsyncCallback};
use crate::error::{ComposerError, DisplayId};
use crate::layer::OverlayLayer;
use crate::mode_client::ModeClient;
use crate::plane::Plane;
use crate::plane_manager::PlaneManager;
use crate::queue::PresentResult;
use crate::renderer::Renderer;

/// Static description of one connector discovered by the (external) mode
/// client, enough to build the plane manager and display bookkeeping for it.
#[derive(Debug, Clone)]
pub struct ConnectorDescriptor {
    /// KMS connector object id
    pub connector_id: u32,
    /// KMS CRTC object id this connector is (or will be) routed through
    pub crtc_id: u32,
    /// CRTC pipe index, used to pick the right entry in multi-CRTC configs
    pub pipe: u32,
    /// planes belonging to this CRTC, ownership transferred to the new display's plane manager
    pub planes: Vec<Plane>,
}

/// The three external collaborators a clone present needs, bundled so
/// `present_clone` doesn't have to take each as its own parameter.
struct CloneSinks<'a> {
    mode_client: &'a mut dyn ModeClient,
    buffer_handler: &'a mut dyn BufferHandler,
    renderer: &'a mut dyn Renderer,
}

/// Registry of every display (physical or virtual) the composer knows
/// about, and the entry point for the public operations in spec.md §6.
#[derive(Debug)]
pub struct HwComposer {
    config: ComposerConfig,
    displays: IndexMap<DisplayId, PhysicalDisplay>,
    next_id: u32,
}

impl HwComposer {
    /// Creates an empty composer. No displays exist until [`Self::initialize`]
    /// (physical) or [`Self::create_virtual_display`] (virtual) is called.
    pub fn new(config: ComposerConfig) -> Self {
        Self { config, displays: IndexMap::new(), next_id: 0 }
    }

    fn allocate_id(&mut self) -> DisplayId {
        let id = DisplayId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Enumerates the connectors the caller's mode client discovered and
    /// creates one disconnected [`PhysicalDisplay`] per entry (spec.md §6
    /// `initialize()`). Displays become usable once [`Self::connect_display`]
    /// is called for each (at startup for already-plugged connectors, or
    /// from a hotplug event later).
    pub fn initialize(&mut self, connectors: Vec<ConnectorDescriptor>) -> Vec<DisplayId> {
        let mut ids = Vec::with_capacity(connectors.len());
        for connector in connectors {
            let id = self.allocate_id();
            let plane_manager = PlaneManager::new(connector.planes, self.config);
            let display = PhysicalDisplay::new(id, connector.pipe, connector.connector_id, connector.crtc_id, plane_manager, self.config);
            self.displays.insert(id, display);
            ids.push(id);
            tracing::debug!(display = ?id, connector = connector.connector_id, "composer: registered connector");
        }
        ids
    }

    /// Allocates an off-screen composite target not tied to any connector
    /// (spec.md §6 `create_virtual_display`). The returned display's
    /// `present()` composites exactly like a physical one; only the final
    /// KMS commit is meaningless for it, so callers route its plan to their
    /// own virtual/remote-share transport instead (out of scope, spec.md §1).
    pub fn create_virtual_display(&mut self, planes: Vec<Plane>) -> DisplayId {
        let id = self.allocate_id();
        let plane_manager = PlaneManager::new(planes, self.config);
        let display = PhysicalDisplay::new(id, u32::MAX, 0, 0, plane_manager, self.config);
        self.displays.insert(id, display);
        tracing::debug!(display = ?id, "composer: created virtual display");
        id
    }

    /// Connects a previously-initialized display, applying any pending power mode.
    pub fn connect_display(&mut self, id: DisplayId, mode_client: &mut dyn ModeClient) -> Result<(), ComposerError> {
        let display = self.displays.get_mut(&id).ok_or(ComposerError::Disconnected(id))?;
        display.connect(mode_client);
        Ok(())
    }

    /// Begins, then completes, disconnecting `id`: marks it disconnecting so
    /// in-flight presents become no-ops, releases its free surfaces, then
    /// clears `CONNECTED`. The clone relationship (if any) is left for the
    /// caller to unwind via [`PhysicalDisplay::remove_clone`] before calling
    /// this, since only the caller knows which source drove this display.
    pub fn disconnect_display(&mut self, id: DisplayId, buffer_handler: &mut dyn BufferHandler) -> Result<(), ComposerError> {
        let display = self.displays.get_mut(&id).ok_or(ComposerError::Disconnected(id))?;
        display.mark_for_disconnect();
        display.disconnect(buffer_handler);
        Ok(())
    }

    /// Every currently connected display (spec.md §6 `get_displays()`).
    pub fn get_displays(&self) -> impl Iterator<Item = &PhysicalDisplay> {
        self.displays.values().filter(|d| d.is_connected())
    }

    /// Looks up one display by id, connected or not.
    pub fn display(&self, id: DisplayId) -> Option<&PhysicalDisplay> {
        self.displays.get(&id)
    }

    /// Mutable lookup, for callers that need to call lifecycle/config
    /// methods (`set_power_mode`, `set_gamma`, ...) directly on the display.
    pub fn display_mut(&mut self, id: DisplayId) -> Option<&mut PhysicalDisplay> {
        self.displays.get_mut(&id)
    }

    /// Sequences one frame on `id` (spec.md §6 `display.present(layers)`),
    /// then drives every live clone of it with the same content scaled to
    /// each clone's own geometry (spec.md §4.9 `handle_cloned_displays`,
    /// §8 invariant 8: one `present_clone` per live clone before this
    /// returns).
    pub fn present(
        &mut self,
        id: DisplayId,
        layers: Vec<OverlayLayer>,
        mode_client: &mut dyn ModeClient,
        buffer_handler: &mut dyn BufferHandler,
        renderer: &mut dyn Renderer,
    ) -> Result<PresentResult, ComposerError> {
        let clones = self.displays.get(&id).map(|d| d.clones().to_vec()).unwrap_or_default();
        let (source_width, source_height) = layers
            .iter()
            .map(|l| (l.display_frame.right(), l.display_frame.bottom()))
            .fold((0i32, 0i32), |acc, (r, b)| (acc.0.max(r), acc.1.max(b)));

        let display = self.displays.get_mut(&id).ok_or(ComposerError::Disconnected(id))?;
        let result = display.present(layers.clone(), mode_client, buffer_handler, renderer)?;

        let source_size = (source_width.max(1) as u32, source_height.max(1) as u32);
        let mut sinks = CloneSinks { mode_client, buffer_handler, renderer };
        for clone_id in clones {
            self.present_clone(clone_id, &layers, source_size, &mut sinks);
        }

        Ok(result)
    }

    /// Drives one clone display with `source_layers`, scaling each layer's
    /// display frame from the source's geometry into the clone's own mode.
    /// Per spec.md §7, a clone failing its present is non-fatal to the
    /// source frame that triggered it; the failure is only traced.
    fn present_clone(&mut self, clone_id: DisplayId, source_layers: &[OverlayLayer], source_size: (u32, u32), sinks: &mut CloneSinks<'_>) {
        let Some(clone) = self.displays.get_mut(&clone_id) else { return };
        let (source_width, source_height) = source_size;
        let scaled: Vec<OverlayLayer> = source_layers
            .iter()
            .cloned()
            .map(|mut l| {
                l.display_frame = clone.scale_frame_from_source(l.display_frame, source_width, source_height);
                l
            })
            .collect();
        if let Err(e) = clone.present(scaled, sinks.mode_client, sinks.buffer_handler, sinks.renderer) {
            tracing::warn!(display = ?clone_id, error = %e, "composer: clone present failed");
        }
    }

    /// Registers a per-refresh vsync callback for `id` (spec.md §6).
    pub fn register_vsync_callback(&self, id: DisplayId, callback: VsyncCallback, display_id: u32) -> Result<(), ComposerError> {
        let display = self.displays.get(&id).ok_or(ComposerError::Disconnected(id))?;
        display.register_vsync_callback(callback, display_id);
        Ok(())
    }

    /// Registers a hotplug callback for `id` (spec.md §6).
    pub fn register_hotplug_callback(&self, id: DisplayId, callback: HotplugCallback, display_id: u32) -> Result<(), ComposerError> {
        let display = self.displays.get(&id).ok_or(ComposerError::Disconnected(id))?;
        display.register_hotplug_callback(callback, display_id);
        Ok(())
    }
}
