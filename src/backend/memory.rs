// SPDX-License-Identifier: MPL-2.0

//! Offscreen backend keeping surfaces in memory.
//!
//! Every call is recorded in a [`BackendLog`] that other threads can inspect,
//! and output paths can be made to fail on demand.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use eyre::eyre;
use image::RgbImage;

use super::{
    FramePayload, Geometry, OutputBackend, OutputPath, PixelLayout, Placement, SurfaceEvent,
    SurfaceId, SurfaceSpec, SurfaceState,
};
use crate::arbiter::FrameSize;
use crate::frame_store::{RoleFlags, StreamRole};
use crate::scaler::{PlaneLayout, i420_to_xrgb8888};

/// Calls kept in a [`BackendLog`]; older ones are dropped first.
pub const CALL_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOptions {
    pub overlay: bool,
    pub software: bool,
    pub screen: FrameSize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            overlay: true,
            software: true,
            screen: FrameSize::new(1920, 1080),
        }
    }
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Create {
        id: SurfaceId,
        role: StreamRole,
        path: OutputPath,
        placement: Placement,
        geometry: Geometry,
        state: SurfaceState,
    },
    CreateFailed {
        role: StreamRole,
        path: OutputPath,
    },
    Destroy {
        id: SurfaceId,
    },
    ApplyState {
        id: SurfaceId,
        geometry: Geometry,
        state: SurfaceState,
    },
    Push {
        id: SurfaceId,
        layout: PixelLayout,
        width: u32,
        height: u32,
    },
    Present {
        id: SurfaceId,
    },
}

#[derive(Debug)]
struct Canvas {
    layout: PixelLayout,
    width: u32,
    height: u32,
    data: Vec<u8>,
}

#[derive(Debug)]
struct MemorySurface {
    role: StreamRole,
    geometry: Geometry,
    state: SurfaceState,
    canvas: Option<Canvas>,
    presented: u64,
}

#[derive(Debug, Default)]
struct Inner {
    options: MemoryOptions,
    calls: VecDeque<BackendCall>,
    surfaces: BTreeMap<SurfaceId, MemorySurface>,
    pending: HashMap<StreamRole, Vec<SurfaceEvent>>,
    overlay_denied: RoleFlags,
    next_id: u32,
}

impl Inner {
    fn record(&mut self, call: BackendCall) {
        if self.calls.len() == CALL_LOG_CAPACITY {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }
}

/// Shared view of a [`MemoryBackend`], usable from any thread.
#[derive(Debug, Clone, Default)]
pub struct BackendLog {
    inner: Arc<Mutex<Inner>>,
}

impl BackendLog {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.iter().cloned().collect()
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Live surface for a role, with its geometry and state.
    #[must_use]
    pub fn surface(&self, role: StreamRole) -> Option<(SurfaceId, Geometry, SurfaceState)> {
        self.lock()
            .surfaces
            .iter()
            .find(|(_, surface)| surface.role == role)
            .map(|(id, surface)| (*id, surface.geometry, surface.state))
    }

    #[must_use]
    pub fn live_surfaces(&self) -> usize {
        self.lock().surfaces.len()
    }

    /// How many times the role's live surface was presented.
    #[must_use]
    pub fn presented(&self, role: StreamRole) -> u64 {
        self.lock()
            .surfaces
            .values()
            .find(|surface| surface.role == role)
            .map_or(0, |surface| surface.presented)
    }

    /// Queue a native event for the live surface of `role`.
    pub fn inject_event(&self, role: StreamRole, event: SurfaceEvent) {
        self.lock().pending.entry(role).or_default().push(event);
    }

    pub fn set_overlay_available(&self, available: bool) {
        self.lock().options.overlay = available;
    }

    /// Make overlay creation fail for one role only.
    pub fn deny_overlay(&self, role: StreamRole) {
        self.lock().overlay_denied.set(role, true);
    }

    pub fn set_software_available(&self, available: bool) {
        self.lock().options.software = available;
    }

    /// Raw bytes of the last frame pushed to the role's live surface.
    #[must_use]
    pub fn frame(&self, role: StreamRole) -> Option<(PixelLayout, u32, u32, Vec<u8>)> {
        let inner = self.lock();
        let surface = inner.surfaces.values().find(|surface| surface.role == role)?;
        let canvas = surface.canvas.as_ref()?;
        Some((canvas.layout, canvas.width, canvas.height, canvas.data.clone()))
    }

    /// Last frame pushed to the role's live surface, at the size it was
    /// pushed with.
    #[must_use]
    pub fn snapshot(&self, role: StreamRole) -> Option<RgbImage> {
        let inner = self.lock();
        let surface = inner.surfaces.values().find(|surface| surface.role == role)?;
        let canvas = surface.canvas.as_ref()?;

        let converted;
        let xrgb = match canvas.layout {
            PixelLayout::Xrgb8888 => &canvas.data,
            PixelLayout::I420 => {
                let layout = PlaneLayout::new(canvas.width, canvas.height);
                let planes = layout.split(&canvas.data).ok()?;
                let mut out = vec![0; canvas.width as usize * canvas.height as usize * 4];
                i420_to_xrgb8888(planes, &layout, &mut out);
                converted = out;
                &converted
            }
        };

        let rgb = xrgb
            .chunks_exact(4)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect();
        RgbImage::from_raw(canvas.width, canvas.height, rgb)
    }
}

/// Backend whose surfaces exist only in memory.
#[derive(Debug)]
pub struct MemoryBackend {
    log: BackendLog,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(options: MemoryOptions) -> Self {
        let log = BackendLog::default();
        log.lock().options = options;
        Self { log }
    }

    #[must_use]
    pub fn log(&self) -> BackendLog {
        self.log.clone()
    }
}

impl OutputBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn screen_size(&self) -> FrameSize {
        self.log.lock().options.screen
    }

    fn create_surface(&mut self, spec: &SurfaceSpec) -> eyre::Result<SurfaceId> {
        let mut inner = self.log.lock();
        let available = match spec.path {
            OutputPath::Overlay => inner.options.overlay && !inner.overlay_denied.get(spec.role),
            OutputPath::Software => inner.options.software,
        };

        if !available {
            inner.record(BackendCall::CreateFailed {
                role: spec.role,
                path: spec.path,
            });
            return Err(eyre!("{:?} path unavailable", spec.path));
        }

        if let Placement::Child { parent } = spec.placement {
            if !inner.surfaces.contains_key(&parent) {
                return Err(eyre!("parent surface {parent:?} does not exist"));
            }
        }

        inner.next_id += 1;
        let id = SurfaceId(inner.next_id);
        inner.surfaces.insert(
            id,
            MemorySurface {
                role: spec.role,
                geometry: spec.geometry,
                state: spec.state,
                canvas: None,
                presented: 0,
            },
        );
        inner.record(BackendCall::Create {
            id,
            role: spec.role,
            path: spec.path,
            placement: spec.placement,
            geometry: spec.geometry,
            state: spec.state,
        });

        Ok(id)
    }

    fn destroy_surface(&mut self, id: SurfaceId) {
        let mut inner = self.log.lock();
        if let Some(surface) = inner.surfaces.remove(&id) {
            inner.pending.remove(&surface.role);
        }
        inner.record(BackendCall::Destroy { id });
    }

    fn apply_state(
        &mut self,
        id: SurfaceId,
        geometry: Geometry,
        state: &SurfaceState,
    ) -> eyre::Result<()> {
        let mut inner = self.log.lock();
        let surface = inner
            .surfaces
            .get_mut(&id)
            .ok_or_else(|| eyre!("no surface {id:?}"))?;
        surface.geometry = geometry;
        surface.state = *state;
        inner.record(BackendCall::ApplyState {
            id,
            geometry,
            state: *state,
        });
        Ok(())
    }

    fn push_frame(&mut self, id: SurfaceId, frame: &FramePayload<'_>) -> eyre::Result<()> {
        let mut inner = self.log.lock();
        let surface = inner
            .surfaces
            .get_mut(&id)
            .ok_or_else(|| eyre!("no surface {id:?}"))?;

        let canvas = surface.canvas.get_or_insert_with(|| Canvas {
            layout: frame.layout,
            width: 0,
            height: 0,
            data: Vec::new(),
        });
        canvas.layout = frame.layout;
        canvas.width = frame.width;
        canvas.height = frame.height;
        canvas.data.clear();
        canvas.data.extend_from_slice(frame.data);

        inner.record(BackendCall::Push {
            id,
            layout: frame.layout,
            width: frame.width,
            height: frame.height,
        });
        Ok(())
    }

    fn present(&mut self, id: SurfaceId) -> eyre::Result<()> {
        let mut inner = self.log.lock();
        let surface = inner
            .surfaces
            .get_mut(&id)
            .ok_or_else(|| eyre!("no surface {id:?}"))?;
        surface.presented += 1;
        inner.record(BackendCall::Present { id });
        Ok(())
    }

    fn pump_events(&mut self, id: SurfaceId) -> eyre::Result<Vec<SurfaceEvent>> {
        let mut inner = self.log.lock();
        let role = inner
            .surfaces
            .get(&id)
            .map(|surface| surface.role)
            .ok_or_else(|| eyre!("no surface {id:?}"))?;
        Ok(inner.pending.remove(&role).unwrap_or_default())
    }
}
