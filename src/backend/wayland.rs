// SPDX-License-Identifier: MPL-2.0

//! Native output on a Wayland compositor.
//!
//! Standalone and embedded surfaces are xdg toplevels, picture-in-picture
//! insets are subsurfaces of their parent. Every surface gets a viewport so
//! the compositor scales whatever buffer is attached to the surface size:
//!
//! - overlay path: the I420 frame is copied into a `Yuv420` shm buffer at
//!   source resolution; needs the compositor to advertise that format
//! - software path: an XRGB8888 canvas already at surface size
//!
//! The GUI's window belongs to another client, so embedded surfaces cannot be
//! parented to it and are shown as undecorated toplevels instead.

use std::collections::BTreeMap;
use std::time::Duration;

use eyre::eyre;
use sctk::{
    compositor::{CompositorHandler, CompositorState},
    delegate_compositor, delegate_output, delegate_registry, delegate_shm, delegate_simple,
    delegate_subcompositor, delegate_xdg_shell, delegate_xdg_window,
    output::{OutputHandler, OutputState},
    reexports::{
        calloop::EventLoop,
        calloop_wayland_source::WaylandSource,
        client::{
            Connection, Dispatch, QueueHandle,
            globals::registry_queue_init,
            protocol::{wl_output, wl_shm, wl_subsurface::WlSubsurface, wl_surface::WlSurface},
        },
    },
    registry::{ProvidesRegistryState, RegistryState, SimpleGlobal},
    registry_handlers,
    shell::{
        WaylandSurface,
        xdg::{
            XdgShell,
            window::{DecorationMode, Window, WindowConfigure, WindowDecorations, WindowHandler},
        },
    },
    shm::{
        Shm, ShmHandler,
        slot::{Buffer, SlotPool},
    },
    subcompositor::SubcompositorState,
};
use wayland_protocols::wp::viewporter::client::{
    wp_viewport::{self, WpViewport},
    wp_viewporter::WpViewporter,
};

use super::{
    FramePayload, Geometry, OutputBackend, OutputPath, PixelLayout, Placement, SurfaceEvent,
    SurfaceId, SurfaceSpec, SurfaceState,
};
use crate::arbiter::FrameSize;

const APP_ID: &str = "com.system76.CosmicVideoOut";

const FALLBACK_SCREEN: FrameSize = FrameSize::new(1920, 1080);

enum Shell {
    Window(Window),
    Subsurface {
        subsurface: WlSubsurface,
        surface: WlSurface,
    },
}

struct NativeSurface {
    shell: Shell,
    viewport: WpViewport,
    pool: SlotPool,
    pending: Option<Buffer>,
    /// kept alive until the compositor releases it
    attached: Option<Buffer>,
    geometry: Geometry,
    state: SurfaceState,
    configured: bool,
    events: Vec<SurfaceEvent>,
}

impl NativeSurface {
    fn wl_surface(&self) -> &WlSurface {
        match &self.shell {
            Shell::Window(window) => window.wl_surface(),
            Shell::Subsurface { surface, .. } => surface,
        }
    }
}

impl Drop for NativeSurface {
    fn drop(&mut self) {
        self.viewport.destroy();
        if let Shell::Subsurface {
            subsurface,
            surface,
        } = &self.shell
        {
            subsurface.destroy();
            surface.destroy();
        }
    }
}

struct WaylandState {
    registry_state: RegistryState,
    output_state: OutputState,
    compositor_state: CompositorState,
    subcompositor_state: SubcompositorState,
    shm: Shm,
    xdg_shell: XdgShell,
    viewporter: SimpleGlobal<WpViewporter, 1>,
    qh: QueueHandle<WaylandState>,
    surfaces: BTreeMap<SurfaceId, NativeSurface>,
}

impl WaylandState {
    fn surface_for_window(&mut self, window: &Window) -> Option<&mut NativeSurface> {
        self.surfaces.values_mut().find(|surface| match &surface.shell {
            Shell::Window(w) => w == window,
            Shell::Subsurface { .. } => false,
        })
    }

    fn yuv_supported(&self) -> bool {
        self.shm.formats().contains(&wl_shm::Format::Yuv420)
    }
}

pub struct WaylandBackend {
    conn: Connection,
    event_loop: EventLoop<'static, WaylandState>,
    state: WaylandState,
    next_id: u32,
}

impl std::fmt::Debug for WaylandBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaylandBackend")
            .field("surfaces", &self.state.surfaces.len())
            .finish_non_exhaustive()
    }
}

impl WaylandBackend {
    /// Connect to the compositor named by the environment.
    ///
    /// # Errors
    ///
    /// Fails without a compositor or when a required global is missing.
    pub fn connect() -> eyre::Result<Self> {
        let conn = Connection::connect_to_env()?;
        let (globals, mut event_queue) = registry_queue_init::<WaylandState>(&conn)?;
        let qh = event_queue.handle();

        let compositor_state = CompositorState::bind(&globals, &qh)?;
        let subcompositor_state =
            SubcompositorState::bind(compositor_state.wl_compositor().clone(), &globals, &qh)?;

        let mut state = WaylandState {
            registry_state: RegistryState::new(&globals),
            output_state: OutputState::new(&globals, &qh),
            compositor_state,
            subcompositor_state,
            shm: Shm::bind(&globals, &qh)?,
            xdg_shell: XdgShell::bind(&globals, &qh)?,
            viewporter: SimpleGlobal::<WpViewporter, 1>::bind(&globals, &qh)?,
            qh,
            surfaces: BTreeMap::new(),
        };

        // learn outputs and shm formats before the first surface
        event_queue.roundtrip(&mut state)?;

        let event_loop = EventLoop::<WaylandState>::try_new()?;
        WaylandSource::new(conn.clone(), event_queue)
            .insert(event_loop.handle())
            .map_err(|err| eyre!("{}", err.error))?;

        tracing::info!(yuv420 = state.yuv_supported(), "connected to wayland compositor");

        Ok(Self {
            conn,
            event_loop,
            state,
            next_id: 0,
        })
    }

    fn surface_mut(&mut self, id: SurfaceId) -> eyre::Result<&mut NativeSurface> {
        self.state
            .surfaces
            .get_mut(&id)
            .ok_or_else(|| eyre!("no surface {id:?}"))
    }
}

impl OutputBackend for WaylandBackend {
    fn name(&self) -> &'static str {
        "wayland"
    }

    fn screen_size(&self) -> FrameSize {
        self.state
            .output_state
            .outputs()
            .filter_map(|output| self.state.output_state.info(&output))
            .find_map(|info| info.logical_size)
            .map_or(FALLBACK_SCREEN, |(width, height)| {
                FrameSize::new(width.max(1) as u32, height.max(1) as u32)
            })
    }

    fn create_surface(&mut self, spec: &SurfaceSpec) -> eyre::Result<SurfaceId> {
        let state = &mut self.state;

        if spec.path == OutputPath::Overlay && !state.yuv_supported() {
            return Err(eyre!("compositor does not accept YUV420 shm buffers"));
        }
        let viewporter = state
            .viewporter
            .get()
            .map_err(|_| eyre!("compositor has no wp_viewporter"))?;

        let shell = match spec.placement {
            Placement::Child { parent } => {
                let parent = state
                    .surfaces
                    .get(&parent)
                    .ok_or_else(|| eyre!("parent surface {parent:?} does not exist"))?;
                let (subsurface, surface) = state
                    .subcompositor_state
                    .create_subsurface(parent.wl_surface().clone(), &state.qh);
                subsurface.set_position(spec.geometry.x, spec.geometry.y);
                subsurface.set_desync();
                Shell::Subsurface {
                    subsurface,
                    surface,
                }
            }
            Placement::Embedded { .. } | Placement::Standalone => {
                if let Placement::Embedded { parent } = spec.placement {
                    tracing::debug!(?parent, "foreign parent window, using an undecorated toplevel");
                }

                let surface = state.compositor_state.create_surface(&state.qh);
                let decorations = if spec.state.decorated {
                    WindowDecorations::RequestServer
                } else {
                    WindowDecorations::None
                };
                let window = state
                    .xdg_shell
                    .create_window(surface, decorations, &state.qh);
                window.set_title(spec.title.clone());
                window.set_app_id(APP_ID);
                if spec.state.fullscreen {
                    window.set_fullscreen(None);
                }
                window.commit();
                Shell::Window(window)
            }
        };

        let wl_surface = match &shell {
            Shell::Window(window) => window.wl_surface().clone(),
            Shell::Subsurface { surface, .. } => surface.clone(),
        };
        let viewport = viewporter.get_viewport(&wl_surface, &state.qh, ());
        let pool = SlotPool::new(
            (spec.geometry.width as usize * spec.geometry.height as usize * 4).max(4096),
            &state.shm,
        )?;

        let configured = matches!(shell, Shell::Subsurface { .. });
        self.next_id += 1;
        let id = SurfaceId(self.next_id);
        state.surfaces.insert(
            id,
            NativeSurface {
                shell,
                viewport,
                pool,
                pending: None,
                attached: None,
                geometry: spec.geometry,
                state: spec.state,
                configured,
                events: Vec::new(),
            },
        );

        if spec.state.on_top {
            tracing::debug!("stacking above other windows is up to the compositor");
        }

        self.conn.flush()?;
        Ok(id)
    }

    fn destroy_surface(&mut self, id: SurfaceId) {
        if self.state.surfaces.remove(&id).is_some() {
            if let Err(why) = self.conn.flush() {
                tracing::warn!(%why, "flush after destroying surface failed");
            }
        }
    }

    fn apply_state(
        &mut self,
        id: SurfaceId,
        geometry: Geometry,
        state: &SurfaceState,
    ) -> eyre::Result<()> {
        let surface = self.surface_mut(id)?;

        match &surface.shell {
            Shell::Window(window) => {
                if state.fullscreen != surface.state.fullscreen {
                    if state.fullscreen {
                        window.set_fullscreen(None);
                    } else {
                        window.unset_fullscreen();
                    }
                }
                if state.decorated != surface.state.decorated {
                    window.request_decoration_mode(Some(if state.decorated {
                        DecorationMode::Server
                    } else {
                        DecorationMode::Client
                    }));
                }
            }
            Shell::Subsurface { subsurface, .. } => {
                subsurface.set_position(geometry.x, geometry.y);
            }
        }

        if state.on_top != surface.state.on_top {
            tracing::debug!(on_top = state.on_top, "stacking above other windows is up to the compositor");
        }

        surface.geometry = geometry;
        surface.state = *state;
        surface.viewport.set_destination(
            geometry.width.max(1) as i32,
            geometry.height.max(1) as i32,
        );
        surface.wl_surface().commit();
        self.conn.flush()?;
        Ok(())
    }

    fn push_frame(&mut self, id: SurfaceId, frame: &FramePayload<'_>) -> eyre::Result<()> {
        let surface = self.surface_mut(id)?;
        let (width, height) = (frame.width as i32, frame.height as i32);

        let buffer = match frame.layout {
            PixelLayout::Xrgb8888 => {
                let (buffer, canvas) = surface.pool.create_buffer(
                    width,
                    height,
                    frame.stride as i32,
                    wl_shm::Format::Xrgb8888,
                )?;
                let len = canvas.len().min(frame.data.len());
                canvas[..len].copy_from_slice(&frame.data[..len]);
                buffer
            }
            PixelLayout::I420 => {
                let slot = surface.pool.new_slot(frame.data.len())?;
                let canvas = surface
                    .pool
                    .canvas(&slot)
                    .ok_or_else(|| eyre!("shm slot for {id:?} is still in use"))?;
                let len = canvas.len().min(frame.data.len());
                canvas[..len].copy_from_slice(&frame.data[..len]);
                surface.pool.create_buffer_in(
                    &slot,
                    width,
                    height,
                    frame.stride as i32,
                    wl_shm::Format::Yuv420,
                )?
            }
        };

        surface.pending = Some(buffer);
        Ok(())
    }

    fn present(&mut self, id: SurfaceId) -> eyre::Result<()> {
        let surface = self.surface_mut(id)?;
        if !surface.configured {
            return Ok(());
        }
        if let Some(buffer) = surface.pending.take() {
            buffer.attach_to(surface.wl_surface())?;
            surface.attached = Some(buffer);
        }
        if surface.attached.is_none() {
            return Ok(());
        }

        let wl_surface = surface.wl_surface();
        wl_surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
        surface.viewport.set_destination(
            surface.geometry.width.max(1) as i32,
            surface.geometry.height.max(1) as i32,
        );
        wl_surface.commit();

        self.conn.flush()?;
        Ok(())
    }

    fn pump_events(&mut self, id: SurfaceId) -> eyre::Result<Vec<SurfaceEvent>> {
        self.event_loop
            .dispatch(Duration::ZERO, &mut self.state)?;
        let surface = self.surface_mut(id)?;
        Ok(std::mem::take(&mut surface.events))
    }
}

impl CompositorHandler for WaylandState {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &WlSurface,
        _new_factor: i32,
    ) {
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _surface: &WlSurface, _time: u32) {}

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }
}

impl OutputHandler for WaylandState {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _output: wl_output::WlOutput) {}

    fn update_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _output: wl_output::WlOutput) {}

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
    }
}

impl WindowHandler for WaylandState {
    fn request_close(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, window: &Window) {
        if let Some(surface) = self.surface_for_window(window) {
            surface.events.push(SurfaceEvent::CloseRequested);
        }
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        window: &Window,
        configure: WindowConfigure,
        _serial: u32,
    ) {
        let Some(surface) = self.surface_for_window(window) else {
            return;
        };

        // the compositor flipped fullscreen on its own, e.g. from a key binding
        if surface.configured && configure.is_fullscreen() != surface.state.fullscreen {
            surface.events.push(SurfaceEvent::ToggleFullscreen);
        }

        if let (Some(width), Some(height)) = configure.new_size {
            let (width, height) = (width.get(), height.get());
            if (width, height) != (surface.geometry.width, surface.geometry.height) {
                surface.geometry.width = width;
                surface.geometry.height = height;
                surface.events.push(SurfaceEvent::Resized { width, height });
            }
        }

        if !surface.configured {
            surface.configured = true;
            surface.events.push(SurfaceEvent::Exposed);
        }
    }
}

impl ShmHandler for WaylandState {
    fn shm_state(&mut self) -> &mut Shm {
        &mut self.shm
    }
}

impl Dispatch<WpViewport, ()> for WaylandState {
    fn event(
        _state: &mut Self,
        _viewport: &WpViewport,
        _event: wp_viewport::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl ProvidesRegistryState for WaylandState {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }
    registry_handlers![OutputState];
}

delegate_compositor!(WaylandState);
delegate_subcompositor!(WaylandState);
delegate_output!(WaylandState);
delegate_shm!(WaylandState);
delegate_xdg_shell!(WaylandState);
delegate_xdg_window!(WaylandState);
delegate_simple!(WaylandState, WpViewporter, 1);
delegate_registry!(WaylandState);
