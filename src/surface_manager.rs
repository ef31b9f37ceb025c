// SPDX-License-Identifier: MPL-2.0

//! Reconciles live output surfaces with the layout chosen by the arbiter.
//!
//! Surfaces are kept in a small arena indexed by stream role. The inset of
//! the picture-in-picture layouts records its parent as `master` and the
//! parent records the inset as `slave`; both are plain role indices, so
//! tearing either down never leaves a dangling reference.

use cosmic_video_out_config::VideoOutputMode;

use crate::arbiter::{FrameInfo, FrameSize, required_roles};
use crate::backend::{Geometry, OutputBackend, OutputPath, Placement, SurfaceEvent};
use crate::display_info::DisplayInfo;
use crate::events::AccelStatus;
use crate::frame_store::{FrameBuffer, RoleFlags, StreamRole, UpdateRequired};
use crate::surface::{OutputSurface, SurfaceRequest};

/// Lifecycle of the surface slot for one stream role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Closed,
    Opening,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedPlacement {
    Embedded,
    Standalone,
    /// positioned inside the surface of another role
    ChildOf(StreamRole),
}

/// One surface a layout needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfacePlan {
    pub role: StreamRole,
    pub placement: PlannedPlacement,
    pub geometry: Geometry,
    pub source: FrameSize,
    pub fullscreen: bool,
    pub on_top: bool,
    pub decorated: bool,
    /// the layout is unusable without this surface
    pub primary: bool,
}

impl SurfacePlan {
    fn embedded(role: StreamRole, frame: &FrameInfo) -> Self {
        let size = frame.size(role).zoomed(frame.zoom);
        Self {
            role,
            placement: PlannedPlacement::Embedded,
            geometry: Geometry::new(frame.embedded_x, frame.embedded_y, size.width, size.height),
            source: frame.size(role),
            fullscreen: false,
            on_top: false,
            decorated: false,
            primary: true,
        }
    }

    fn window(role: StreamRole, frame: &FrameInfo, on_top: bool) -> Self {
        let size = frame.size(role).zoomed(frame.zoom);
        Self {
            role,
            placement: PlannedPlacement::Standalone,
            geometry: Geometry::new(0, 0, size.width, size.height),
            source: frame.size(role),
            fullscreen: false,
            on_top,
            decorated: true,
            primary: true,
        }
    }

    /// Local inset at a third of `parent`, in its bottom right corner.
    fn inset(frame: &FrameInfo, parent: FrameSize) -> Self {
        Self {
            role: StreamRole::Local,
            placement: PlannedPlacement::ChildOf(StreamRole::Remote),
            geometry: Geometry::new(
                offset_two_thirds(parent.width),
                offset_two_thirds(parent.height),
                parent.width / 3,
                parent.height / 3,
            ),
            source: frame.local,
            fullscreen: false,
            on_top: false,
            decorated: false,
            primary: false,
        }
    }
}

fn offset_two_thirds(extent: u32) -> i32 {
    i32::try_from(u64::from(extent) * 2 / 3).unwrap_or(i32::MAX)
}

/// Surfaces needed for `frame.mode`, parents before children.
#[must_use]
pub fn plan_layout(frame: &FrameInfo, on_top: bool, screen: FrameSize) -> Vec<SurfacePlan> {
    match frame.mode {
        VideoOutputMode::Unset => Vec::new(),
        VideoOutputMode::Local => vec![SurfacePlan::embedded(StreamRole::Local, frame)],
        VideoOutputMode::Remote => vec![SurfacePlan::embedded(StreamRole::Remote, frame)],
        VideoOutputMode::RemoteExt => {
            let mut extended = SurfacePlan::window(StreamRole::Extended, frame, false);
            extended.primary = false;
            vec![SurfacePlan::embedded(StreamRole::Remote, frame), extended]
        }
        VideoOutputMode::Pip => {
            let remote = SurfacePlan::embedded(StreamRole::Remote, frame);
            let inset = SurfacePlan::inset(frame, remote.geometry.size());
            vec![remote, inset]
        }
        VideoOutputMode::PipWindow => {
            let remote = SurfacePlan::window(StreamRole::Remote, frame, on_top);
            let inset = SurfacePlan::inset(frame, remote.geometry.size());
            vec![remote, inset]
        }
        VideoOutputMode::Fullscreen => {
            let mut remote = SurfacePlan::window(StreamRole::Remote, frame, false);
            remote.fullscreen = true;
            remote.decorated = false;
            vec![remote, SurfacePlan::inset(frame, screen)]
        }
    }
}

/// Role whose surface must open for the layout to count as shown.
#[must_use]
pub fn primary_role(mode: VideoOutputMode) -> StreamRole {
    if mode == VideoOutputMode::Local {
        StreamRole::Local
    } else {
        StreamRole::Remote
    }
}

#[derive(Debug)]
struct SurfaceSlot {
    surface: OutputSurface,
    master: Option<StreamRole>,
    slave: Option<StreamRole>,
}

/// Result of [`SurfaceManager::setup_frame_display`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupOutcome {
    /// live surfaces were torn down first
    pub closed_any: bool,
    pub primary_opened: bool,
    pub accel: AccelStatus,
    /// size of the surface embedded in the GUI window, if the layout has one
    pub embedded_size: Option<FrameSize>,
}

/// Owns the native surfaces; lives on the render thread only.
pub struct SurfaceManager {
    backend: Box<dyn OutputBackend>,
    slots: [Option<SurfaceSlot>; 3],
    states: [SlotState; 3],
    mode: VideoOutputMode,
    accel: AccelStatus,
}

impl std::fmt::Debug for SurfaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceManager")
            .field("backend", &self.backend.name())
            .field("states", &self.states)
            .field("mode", &self.mode)
            .field("accel", &self.accel)
            .finish()
    }
}

impl SurfaceManager {
    #[must_use]
    pub fn new(backend: Box<dyn OutputBackend>) -> Self {
        Self {
            backend,
            slots: [None, None, None],
            states: [SlotState::Closed; 3],
            mode: VideoOutputMode::Unset,
            accel: AccelStatus::NoVideo,
        }
    }

    #[must_use]
    pub fn slot_state(&self, role: StreamRole) -> SlotState {
        self.states[role.index()]
    }

    #[must_use]
    pub fn accel_status(&self) -> AccelStatus {
        self.accel
    }

    /// Roles with a live surface.
    #[must_use]
    pub fn live_roles(&self) -> RoleFlags {
        let mut live = RoleFlags::default();
        for role in StreamRole::ALL {
            live.set(role, self.slots[role.index()].is_some());
        }
        live
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }

    /// The master and slave roles linked to `role`.
    #[must_use]
    pub fn links(&self, role: StreamRole) -> (Option<StreamRole>, Option<StreamRole>) {
        self.slots[role.index()]
            .as_ref()
            .map_or((None, None), |slot| (slot.master, slot.slave))
    }

    #[must_use]
    pub fn surface(&self, role: StreamRole) -> Option<&OutputSurface> {
        self.slots[role.index()].as_ref().map(|slot| &slot.surface)
    }

    fn transition(&mut self, role: StreamRole, to: SlotState) {
        let from = std::mem::replace(&mut self.states[role.index()], to);
        debug_assert!(
            matches!(
                (from, to),
                (SlotState::Closed, SlotState::Opening)
                    | (SlotState::Opening, SlotState::Open | SlotState::Closed)
                    | (SlotState::Open, SlotState::Closed)
            ),
            "invalid surface transition {from:?} -> {to:?}"
        );
        tracing::trace!(?role, ?from, ?to, "surface slot");
    }

    /// Tear down every live surface and build the ones `frame.mode` needs.
    pub fn setup_frame_display(&mut self, frame: &FrameInfo, display: &DisplayInfo) -> SetupOutcome {
        let closed_any = self.close_frame_display();
        let screen = self.backend.screen_size();

        for plan in plan_layout(frame, display.on_top, screen) {
            let placement = match plan.placement {
                PlannedPlacement::Embedded => Placement::Embedded {
                    parent: display.window_handle,
                },
                PlannedPlacement::Standalone => Placement::Standalone,
                PlannedPlacement::ChildOf(parent) => match self.surface(parent) {
                    Some(surface) => Placement::Child {
                        parent: surface.id(),
                    },
                    None => continue,
                },
            };

            let is_child = matches!(plan.placement, PlannedPlacement::ChildOf(_));
            let request = SurfaceRequest {
                role: plan.role,
                placement,
                geometry: plan.geometry,
                source: plan.source,
                fullscreen: plan.fullscreen,
                on_top: plan.on_top,
                decorated: plan.decorated,
                allow_overlay: !display.disable_hw_accel,
                allow_software: !is_child || display.allow_pip_sw_scaling,
                algorithm: display.sw_scaling_algorithm,
            };

            self.transition(plan.role, SlotState::Opening);
            match OutputSurface::open(self.backend.as_mut(), &request) {
                Ok(surface) => {
                    self.slots[plan.role.index()] = Some(SurfaceSlot {
                        surface,
                        master: None,
                        slave: None,
                    });
                    self.transition(plan.role, SlotState::Open);

                    if let PlannedPlacement::ChildOf(parent) = plan.placement {
                        self.link(parent, plan.role);
                    }
                }
                Err(why) if plan.primary => {
                    tracing::error!(role = ?plan.role, mode = ?frame.mode, %why, "no output surface could be opened");
                    self.transition(plan.role, SlotState::Closed);
                    self.close_frame_display();
                    self.accel = AccelStatus::NoVideo;
                    return SetupOutcome {
                        closed_any,
                        primary_opened: false,
                        accel: AccelStatus::NoVideo,
                        embedded_size: None,
                    };
                }
                Err(why) => {
                    self.transition(plan.role, SlotState::Closed);
                    if is_child && !display.allow_pip_sw_scaling {
                        tracing::warn!(%why, "picture-in-picture inset omitted, software scaling not allowed for it");
                    } else {
                        tracing::warn!(role = ?plan.role, %why, "secondary output surface omitted");
                    }
                }
            }
        }

        self.mode = frame.mode;
        self.accel = self.compute_accel();

        let primary = primary_role(frame.mode);
        let embedded_size = frame
            .mode
            .is_embedded()
            .then(|| self.surface(primary).map(|surface| surface.geometry().size()))
            .flatten();

        tracing::info!(mode = ?frame.mode, accel = ?self.accel, backend = self.backend.name(), "output surfaces ready");

        SetupOutcome {
            closed_any,
            primary_opened: self.surface(primary).is_some(),
            accel: self.accel,
            embedded_size,
        }
    }

    fn link(&mut self, master: StreamRole, slave: StreamRole) {
        if let Some(slot) = self.slots[master.index()].as_mut() {
            slot.slave = Some(slave);
        }
        if let Some(slot) = self.slots[slave.index()].as_mut() {
            slot.master = Some(master);
        }
    }

    fn compute_accel(&self) -> AccelStatus {
        let Some(primary) = self.surface(primary_role(self.mode)) else {
            return AccelStatus::NoVideo;
        };

        if primary.path() == OutputPath::Software {
            return AccelStatus::Software;
        }

        let all_overlay = self
            .slots
            .iter()
            .flatten()
            .all(|slot| slot.surface.path() == OutputPath::Overlay);
        let complete = required_roles(self.mode).is_subset_of(&self.live_roles());

        if all_overlay && complete {
            AccelStatus::All
        } else {
            AccelStatus::RemoteOnly
        }
    }

    /// Unlink and destroy every live surface, insets before their parents.
    ///
    /// Returns whether anything was closed.
    pub fn close_frame_display(&mut self) -> bool {
        let (insets, rest): (Vec<StreamRole>, Vec<StreamRole>) = StreamRole::ALL
            .into_iter()
            .filter(|role| self.slots[role.index()].is_some())
            .partition(|role| self.links(*role).0.is_some());
        let order: Vec<StreamRole> = insets.into_iter().chain(rest).collect();

        for slot in self.slots.iter_mut().flatten() {
            slot.master = None;
            slot.slave = None;
        }

        let closed_any = !order.is_empty();
        for role in order {
            if let Some(slot) = self.slots[role.index()].take() {
                slot.surface.close(self.backend.as_mut());
                self.transition(role, SlotState::Closed);
            }
        }

        if closed_any {
            tracing::debug!("output surfaces closed");
        }
        self.mode = VideoOutputMode::Unset;
        self.accel = AccelStatus::NoVideo;
        closed_any
    }

    /// Roles in event pump order: each master followed by its slave.
    fn pump_order(&self) -> Vec<StreamRole> {
        let mut order = Vec::with_capacity(3);
        for role in StreamRole::ALL {
            let (master, slave) = self.links(role);
            if self.slots[role.index()].is_none() || master.is_some() {
                continue;
            }
            order.push(role);
            if let Some(slave) = slave {
                order.push(slave);
            }
        }
        order
    }

    /// Pump native events for every live surface.
    pub fn pump_events(&mut self) -> Vec<(StreamRole, SurfaceEvent)> {
        let mut events = Vec::new();
        for role in self.pump_order() {
            let Self { backend, slots, .. } = &mut *self;
            let Some(slot) = slots[role.index()].as_mut() else {
                continue;
            };

            match slot.surface.pump_events(backend.as_mut()) {
                Ok(pumped) => events.extend(pumped.into_iter().map(|event| (role, event))),
                Err(why) => tracing::warn!(?role, %why, "failed to pump surface events"),
            }
        }
        events
    }

    fn push(&mut self, role: StreamRole, frame: &FrameBuffer) {
        if frame.is_empty() {
            return;
        }

        let Self { backend, slots, .. } = &mut *self;
        let Some(slot) = slots[role.index()].as_mut() else {
            return;
        };

        if let Err(why) =
            slot.surface
                .put_frame(backend.as_mut(), frame.data(), frame.width(), frame.height())
        {
            tracing::warn!(?role, %why, "failed to push frame");
        }
    }

    /// Pump events, then push one stream's frame to its surface.
    pub fn display_frame(
        &mut self,
        role: StreamRole,
        frame: &FrameBuffer,
    ) -> Vec<(StreamRole, SurfaceEvent)> {
        let events = self.pump_events();
        self.push(role, frame);
        events
    }

    /// Pump events, then push the updated streams of a combined layout.
    ///
    /// When neither stream is flagged both are pushed, so the first pass
    /// after a setup shows both streams.
    pub fn display_pip_frames(
        &mut self,
        local: &FrameBuffer,
        remote: &FrameBuffer,
        updates: UpdateRequired,
    ) -> Vec<(StreamRole, SurfaceEvent)> {
        let events = self.pump_events();
        let push_both = !updates.local && !updates.remote;

        if updates.local || push_both {
            self.push(StreamRole::Local, local);
        }
        if updates.remote || push_both {
            self.push(StreamRole::Remote, remote);
        }
        events
    }

    /// Present the surfaces of updated streams, or all when neither the
    /// local nor the remote stream is flagged, matching
    /// [`display_pip_frames`](Self::display_pip_frames). Surfaces with a
    /// pending expose are presented too.
    pub fn sync(&mut self, updates: UpdateRequired) {
        let present_all = !updates.local && !updates.remote;
        let Self { backend, slots, .. } = &mut *self;

        for (role, slot) in StreamRole::ALL.into_iter().zip(slots.iter_mut()) {
            let Some(slot) = slot.as_mut() else {
                continue;
            };

            if present_all || updates.get(role) || slot.surface.needs_present() {
                if let Err(why) = slot.surface.present(backend.as_mut()) {
                    tracing::warn!(?role, %why, "present failed");
                }
            }
        }
    }

    /// Apply GUI options that do not need a new setup.
    pub fn apply_display_options(&mut self, display: &DisplayInfo) {
        let Self { backend, slots, .. } = &mut *self;

        for slot in slots.iter_mut().flatten() {
            slot.surface.set_algorithm(display.sw_scaling_algorithm);

            let surface = &mut slot.surface;
            let standalone_remote = surface.role() == StreamRole::Remote
                && surface.placement() == Placement::Standalone
                && !surface.state().fullscreen;
            if standalone_remote {
                if let Err(why) = surface.set_on_top(backend.as_mut(), display.on_top) {
                    tracing::warn!(%why, "failed to change window stacking");
                }
            }
        }
    }

    /// Drop the remote surface out of fullscreen, back to its windowed size.
    pub fn leave_fullscreen(&mut self) {
        let screen = self.backend.screen_size();
        let Self { backend, slots, .. } = &mut *self;

        if let Some(slot) = slots[StreamRole::Remote.index()].as_mut() {
            if let Err(why) = slot.surface.set_fullscreen(backend.as_mut(), false, screen) {
                tracing::warn!(%why, "failed to leave fullscreen");
            }
        }
    }

    #[must_use]
    pub fn is_fullscreen(&self) -> bool {
        self.surface(StreamRole::Remote)
            .is_some_and(|surface| surface.state().fullscreen)
    }
}

impl Drop for SurfaceManager {
    fn drop(&mut self) {
        self.close_frame_display();
    }
}
