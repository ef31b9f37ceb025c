// SPDX-License-Identifier: MPL-2.0

//! One native output surface.
//!
//! Opening walks a fallback ladder: the overlay path first, then software
//! scaling. Window state (fullscreen, stacking, decorations) is tracked here
//! and pushed to the backend whenever it changes.

use cosmic_video_out_config::ScalingAlgorithm;
use eyre::eyre;

use crate::arbiter::FrameSize;
use crate::backend::{
    FramePayload, Geometry, OutputBackend, OutputPath, PixelLayout, Placement, SurfaceEvent,
    SurfaceId, SurfaceLayer, SurfaceSpec, SurfaceState,
};
use crate::frame_store::StreamRole;
use crate::scaler::SoftwareScaler;

/// Parameters for [`OutputSurface::open`].
#[derive(Debug, Clone)]
pub struct SurfaceRequest {
    pub role: StreamRole,
    pub placement: Placement,
    pub geometry: Geometry,
    pub source: FrameSize,
    pub fullscreen: bool,
    pub on_top: bool,
    pub decorated: bool,
    pub allow_overlay: bool,
    pub allow_software: bool,
    pub algorithm: ScalingAlgorithm,
}

#[derive(Debug)]
pub struct OutputSurface {
    id: SurfaceId,
    role: StreamRole,
    path: OutputPath,
    placement: Placement,
    geometry: Geometry,
    /// geometry to restore when leaving fullscreen
    windowed: Option<Geometry>,
    state: SurfaceState,
    scaler: Option<SoftwareScaler>,
    canvas: Vec<u8>,
    needs_present: bool,
}

fn layer_for(placement: Placement, fullscreen: bool, on_top: bool) -> SurfaceLayer {
    match placement {
        Placement::Child { .. } => SurfaceLayer::Child,
        Placement::Embedded { .. } => SurfaceLayer::Embedded,
        Placement::Standalone if fullscreen => SurfaceLayer::Fullscreen,
        Placement::Standalone if on_top => SurfaceLayer::Above,
        Placement::Standalone => SurfaceLayer::Normal,
    }
}

fn title_for(role: StreamRole) -> &'static str {
    match role {
        StreamRole::Local => "Local video",
        StreamRole::Remote => "Remote video",
        StreamRole::Extended => "Extended video",
    }
}

impl OutputSurface {
    /// Create the surface, preferring the overlay path.
    ///
    /// # Errors
    ///
    /// Fails when every allowed path failed.
    pub fn open(backend: &mut dyn OutputBackend, request: &SurfaceRequest) -> eyre::Result<Self> {
        if request.geometry.width == 0 || request.geometry.height == 0 {
            return Err(eyre!(
                "{:?} surface would be {}x{}",
                request.role,
                request.geometry.width,
                request.geometry.height
            ));
        }

        let fullscreen = request.fullscreen && request.placement == Placement::Standalone;
        let state = SurfaceState {
            fullscreen,
            on_top: request.on_top,
            decorated: request.decorated,
            layer: layer_for(request.placement, fullscreen, request.on_top),
        };

        // fullscreen surfaces are created covering the screen and remember
        // the requested geometry for when they leave fullscreen
        let (geometry, windowed) = if fullscreen {
            let screen = backend.screen_size();
            (
                Geometry::new(0, 0, screen.width, screen.height),
                Some(request.geometry),
            )
        } else {
            (request.geometry, None)
        };

        let mut spec = SurfaceSpec {
            role: request.role,
            path: OutputPath::Overlay,
            placement: request.placement,
            geometry,
            source: request.source,
            state,
            title: title_for(request.role).to_owned(),
        };

        let mut last_error = None;
        for path in [OutputPath::Overlay, OutputPath::Software] {
            let allowed = match path {
                OutputPath::Overlay => request.allow_overlay,
                OutputPath::Software => request.allow_software,
            };
            if !allowed {
                continue;
            }

            spec.path = path;
            match backend.create_surface(&spec) {
                Ok(id) => {
                    tracing::debug!(
                        role = ?request.role,
                        ?path,
                        ?geometry,
                        backend = backend.name(),
                        "output surface created"
                    );

                    return Ok(Self {
                        id,
                        role: request.role,
                        path,
                        placement: request.placement,
                        geometry,
                        windowed,
                        state,
                        scaler: (path == OutputPath::Software)
                            .then(|| SoftwareScaler::new(request.algorithm)),
                        canvas: Vec::new(),
                        needs_present: false,
                    });
                }
                Err(why) => {
                    tracing::debug!(role = ?request.role, ?path, %why, "output path unavailable");
                    last_error = Some(why);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| eyre!("no output path allowed for {:?}", request.role)))
    }

    #[must_use]
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> StreamRole {
        self.role
    }

    #[must_use]
    pub fn path(&self) -> OutputPath {
        self.path
    }

    #[must_use]
    pub fn placement(&self) -> Placement {
        self.placement
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    #[must_use]
    pub fn state(&self) -> SurfaceState {
        self.state
    }

    fn apply(&mut self, backend: &mut dyn OutputBackend) -> eyre::Result<()> {
        self.state.layer = layer_for(self.placement, self.state.fullscreen, self.state.on_top);
        backend.apply_state(self.id, self.geometry, &self.state)
    }

    /// Enter or leave fullscreen, covering `screen` while fullscreen.
    ///
    /// Only standalone surfaces can go fullscreen.
    ///
    /// # Errors
    ///
    /// Fails if the backend rejects the new state.
    pub fn set_fullscreen(
        &mut self,
        backend: &mut dyn OutputBackend,
        fullscreen: bool,
        screen: FrameSize,
    ) -> eyre::Result<()> {
        if self.state.fullscreen == fullscreen || self.placement != Placement::Standalone {
            return Ok(());
        }

        if fullscreen {
            self.windowed = Some(self.geometry);
            self.geometry = Geometry::new(0, 0, screen.width, screen.height);
        } else if let Some(windowed) = self.windowed.take() {
            self.geometry = windowed;
        }

        // standalone windows carry decorations only while windowed
        self.state.fullscreen = fullscreen;
        self.state.decorated = !fullscreen;
        self.apply(backend)
    }

    /// # Errors
    ///
    /// Fails if the backend rejects the new state.
    pub fn set_on_top(&mut self, backend: &mut dyn OutputBackend, on_top: bool) -> eyre::Result<()> {
        if self.state.on_top == on_top {
            return Ok(());
        }

        self.state.on_top = on_top;
        self.apply(backend)
    }

    /// # Errors
    ///
    /// Fails if the backend rejects the new state.
    pub fn set_decorated(
        &mut self,
        backend: &mut dyn OutputBackend,
        decorated: bool,
    ) -> eyre::Result<()> {
        if self.state.decorated == decorated {
            return Ok(());
        }

        self.state.decorated = decorated;
        self.apply(backend)
    }

    pub fn set_algorithm(&mut self, algorithm: ScalingAlgorithm) {
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.set_algorithm(algorithm);
        }
    }

    /// Hand a planar YUV 4:2:0 frame to the surface.
    ///
    /// # Errors
    ///
    /// Fails if scaling or the backend push fails.
    pub fn put_frame(
        &mut self,
        backend: &mut dyn OutputBackend,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> eyre::Result<()> {
        let payload = match self.scaler.as_mut() {
            Some(scaler) => {
                let (dst_width, dst_height) = (self.geometry.width, self.geometry.height);
                scaler.scale_to_xrgb(data, width, height, dst_width, dst_height, &mut self.canvas)?;
                FramePayload {
                    layout: PixelLayout::Xrgb8888,
                    data: &self.canvas,
                    width: dst_width,
                    height: dst_height,
                    stride: dst_width * 4,
                }
            }
            None => FramePayload {
                layout: PixelLayout::I420,
                data,
                width,
                height,
                stride: width,
            },
        };

        backend.push_frame(self.id, &payload)?;
        self.needs_present = true;
        Ok(())
    }

    /// Whether an expose or a pushed frame is waiting for a present.
    #[must_use]
    pub fn needs_present(&self) -> bool {
        self.needs_present
    }

    /// # Errors
    ///
    /// Fails if the backend present fails.
    pub fn present(&mut self, backend: &mut dyn OutputBackend) -> eyre::Result<()> {
        backend.present(self.id)?;
        self.needs_present = false;
        Ok(())
    }

    /// Drain native events, handling the ones that only concern this surface.
    ///
    /// Resizes update the stored geometry and exposes mark the surface for a
    /// present; every event is also returned to the caller.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot pump events.
    pub fn pump_events(&mut self, backend: &mut dyn OutputBackend) -> eyre::Result<Vec<SurfaceEvent>> {
        let events = backend.pump_events(self.id)?;
        for event in &events {
            match *event {
                SurfaceEvent::Resized { width, height } if width > 0 && height > 0 => {
                    tracing::trace!(role = ?self.role, width, height, "surface resized");
                    self.geometry.width = width;
                    self.geometry.height = height;
                }
                SurfaceEvent::Exposed => self.needs_present = true,
                _ => {}
            }
        }
        Ok(events)
    }

    pub fn close(self, backend: &mut dyn OutputBackend) {
        tracing::debug!(role = ?self.role, id = ?self.id, "output surface destroyed");
        backend.destroy_surface(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{BackendCall, MemoryBackend, MemoryOptions};
    use crate::frame_store::i420_len;

    fn request(placement: Placement) -> SurfaceRequest {
        SurfaceRequest {
            role: StreamRole::Remote,
            placement,
            geometry: Geometry::new(10, 20, 352, 288),
            source: FrameSize::new(352, 288),
            fullscreen: false,
            on_top: false,
            decorated: true,
            allow_overlay: true,
            allow_software: true,
            algorithm: ScalingAlgorithm::Bilinear,
        }
    }

    #[test]
    fn test_overlay_preferred() {
        let mut backend = MemoryBackend::new(MemoryOptions::default());
        let surface = OutputSurface::open(&mut backend, &request(Placement::Standalone)).unwrap();
        assert_eq!(surface.path(), OutputPath::Overlay);
        assert_eq!(surface.state().layer, SurfaceLayer::Normal);
    }

    #[test]
    fn test_falls_back_to_software() {
        let mut backend = MemoryBackend::new(MemoryOptions::default());
        let log = backend.log();
        log.set_overlay_available(false);

        let surface = OutputSurface::open(&mut backend, &request(Placement::Standalone)).unwrap();
        assert_eq!(surface.path(), OutputPath::Software);
        assert_eq!(
            log.count(|call| matches!(
                call,
                BackendCall::CreateFailed {
                    path: OutputPath::Overlay,
                    ..
                }
            )),
            1
        );
    }

    #[test]
    fn test_overlay_disallowed_skips_attempt() {
        let mut backend = MemoryBackend::new(MemoryOptions::default());
        let log = backend.log();
        let mut req = request(Placement::Standalone);
        req.allow_overlay = false;

        let surface = OutputSurface::open(&mut backend, &req).unwrap();
        assert_eq!(surface.path(), OutputPath::Software);
        assert_eq!(log.count(|call| matches!(call, BackendCall::CreateFailed { .. })), 0);
    }

    #[test]
    fn test_ladder_exhausted() {
        let mut backend = MemoryBackend::new(MemoryOptions {
            overlay: false,
            software: false,
            ..MemoryOptions::default()
        });
        assert!(OutputSurface::open(&mut backend, &request(Placement::Standalone)).is_err());

        let mut req = request(Placement::Standalone);
        req.allow_overlay = false;
        req.allow_software = false;
        assert!(OutputSurface::open(&mut backend, &req).is_err());
    }

    #[test]
    fn test_zero_geometry_refused() {
        let mut backend = MemoryBackend::new(MemoryOptions::default());
        let log = backend.log();
        let mut req = request(Placement::Standalone);
        req.geometry.width = 0;

        assert!(OutputSurface::open(&mut backend, &req).is_err());
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_fullscreen_restores_geometry() {
        let mut backend = MemoryBackend::new(MemoryOptions::default());
        let mut surface = OutputSurface::open(&mut backend, &request(Placement::Standalone)).unwrap();
        let windowed = surface.geometry();
        let screen = FrameSize::new(1920, 1080);

        surface.set_fullscreen(&mut backend, true, screen).unwrap();
        assert_eq!(surface.geometry(), Geometry::new(0, 0, 1920, 1080));
        assert_eq!(surface.state().layer, SurfaceLayer::Fullscreen);
        assert!(!surface.state().decorated);

        surface.set_fullscreen(&mut backend, false, screen).unwrap();
        assert_eq!(surface.geometry(), windowed);
        assert_eq!(surface.state().layer, SurfaceLayer::Normal);
        assert!(surface.state().decorated);
    }

    #[test]
    fn test_open_fullscreen() {
        let mut backend = MemoryBackend::new(MemoryOptions {
            screen: FrameSize::new(1280, 720),
            ..MemoryOptions::default()
        });
        let mut req = request(Placement::Standalone);
        req.fullscreen = true;
        req.decorated = false;

        let mut surface = OutputSurface::open(&mut backend, &req).unwrap();
        assert_eq!(surface.geometry(), Geometry::new(0, 0, 1280, 720));
        assert_eq!(surface.state().layer, SurfaceLayer::Fullscreen);

        surface
            .set_fullscreen(&mut backend, false, FrameSize::new(1280, 720))
            .unwrap();
        assert_eq!(surface.geometry(), req.geometry);
        assert!(surface.state().decorated);
    }

    #[test]
    fn test_embedded_surface_stays_embedded() {
        let mut backend = MemoryBackend::new(MemoryOptions::default());
        let log = backend.log();
        let mut surface =
            OutputSurface::open(&mut backend, &request(Placement::Embedded { parent: Some(1) }))
                .unwrap();
        log.clear_calls();

        surface
            .set_fullscreen(&mut backend, true, FrameSize::new(1920, 1080))
            .unwrap();
        assert!(!surface.state().fullscreen);
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_on_top_layering() {
        let mut backend = MemoryBackend::new(MemoryOptions::default());
        let log = backend.log();
        let mut surface = OutputSurface::open(&mut backend, &request(Placement::Standalone)).unwrap();

        surface.set_on_top(&mut backend, true).unwrap();
        assert_eq!(surface.state().layer, SurfaceLayer::Above);
        surface.set_on_top(&mut backend, true).unwrap();
        surface.set_decorated(&mut backend, false).unwrap();

        assert_eq!(log.count(|call| matches!(call, BackendCall::ApplyState { .. })), 2);
        assert!(!surface.state().decorated);
    }

    #[test]
    fn test_software_push_uses_surface_size() {
        let mut backend = MemoryBackend::new(MemoryOptions::default());
        let log = backend.log();
        let mut req = request(Placement::Standalone);
        req.allow_overlay = false;
        req.geometry = Geometry::new(0, 0, 117, 96);

        let mut surface = OutputSurface::open(&mut backend, &req).unwrap();
        let frame = vec![128; i420_len(352, 288)];
        surface.put_frame(&mut backend, &frame, 352, 288).unwrap();
        assert!(surface.needs_present());
        surface.present(&mut backend).unwrap();
        assert!(!surface.needs_present());

        assert!(log.calls().contains(&BackendCall::Push {
            id: surface.id(),
            layout: PixelLayout::Xrgb8888,
            width: 117,
            height: 96,
        }));
        assert_eq!(log.snapshot(StreamRole::Remote).unwrap().dimensions(), (117, 96));
    }

    #[test]
    fn test_overlay_push_keeps_source_size() {
        let mut backend = MemoryBackend::new(MemoryOptions::default());
        let log = backend.log();
        let mut surface = OutputSurface::open(&mut backend, &request(Placement::Standalone)).unwrap();

        let frame = vec![0; i420_len(176, 144)];
        surface.put_frame(&mut backend, &frame, 176, 144).unwrap();
        assert!(log.calls().contains(&BackendCall::Push {
            id: surface.id(),
            layout: PixelLayout::I420,
            width: 176,
            height: 144,
        }));
    }

    #[test]
    fn test_events_update_surface() {
        let mut backend = MemoryBackend::new(MemoryOptions::default());
        let log = backend.log();
        let mut surface = OutputSurface::open(&mut backend, &request(Placement::Standalone)).unwrap();

        log.inject_event(StreamRole::Remote, SurfaceEvent::Resized { width: 640, height: 480 });
        log.inject_event(StreamRole::Remote, SurfaceEvent::Exposed);
        let events = surface.pump_events(&mut backend).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(surface.geometry().size(), FrameSize::new(640, 480));
        assert!(surface.needs_present());
    }
}
