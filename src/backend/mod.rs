// SPDX-License-Identifier: MPL-2.0

//! Native output capability.
//!
//! The surface manager only talks to windowing systems through
//! [`OutputBackend`]. Implementations are created on the render thread by a
//! [`BackendFactory`] and never leave it.

pub mod memory;
#[cfg(feature = "wayland")]
pub mod wayland;

use cosmic_video_out_config::BackendKind;
use drm_fourcc::DrmFourcc;

use crate::arbiter::FrameSize;
use crate::display_info::NativeHandle;
use crate::frame_store::StreamRole;

/// Backend-assigned identifier of a native surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

/// How pixels reach the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPath {
    /// raw YUV frames handed over, scaled by the display hardware or compositor
    Overlay,
    /// frames scaled and converted to RGB on the CPU
    Software,
}

impl OutputPath {
    /// Pixel layout pushed to surfaces on this path.
    #[must_use]
    pub fn layout(self) -> PixelLayout {
        match self {
            Self::Overlay => PixelLayout::I420,
            Self::Software => PixelLayout::Xrgb8888,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// planar YUV 4:2:0, full resolution luma followed by U then V
    I420,
    /// packed 32 bit, blue in the lowest byte
    Xrgb8888,
}

impl PixelLayout {
    #[must_use]
    pub fn fourcc(self) -> DrmFourcc {
        match self {
            Self::I420 => DrmFourcc::Yuv420,
            Self::Xrgb8888 => DrmFourcc::Xrgb8888,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[must_use]
    pub fn size(&self) -> FrameSize {
        FrameSize::new(self.width, self.height)
    }
}

/// Where a surface lives in the window hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// inside the GUI's window
    Embedded { parent: Option<NativeHandle> },
    /// a toplevel window of its own
    Standalone,
    /// inside another output surface, positioned relative to it
    Child { parent: SurfaceId },
}

/// Stacking class of a surface, derived from its placement and state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SurfaceLayer {
    Child,
    Embedded,
    #[default]
    Normal,
    Above,
    Fullscreen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceState {
    pub fullscreen: bool,
    pub on_top: bool,
    pub decorated: bool,
    pub layer: SurfaceLayer,
}

/// Everything a backend needs to create one surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceSpec {
    pub role: StreamRole,
    pub path: OutputPath,
    pub placement: Placement,
    pub geometry: Geometry,
    /// size of the frames that will be pushed on the overlay path
    pub source: FrameSize,
    pub state: SurfaceState,
    pub title: String,
}

/// A frame handed to [`OutputBackend::push_frame`].
#[derive(Debug, Clone, Copy)]
pub struct FramePayload<'a> {
    pub layout: PixelLayout,
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// bytes per row of the first plane
    pub stride: u32,
}

/// Native input relevant to video output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    ToggleFullscreen,
    CloseRequested,
    Resized { width: u32, height: u32 },
    Exposed,
}

pub trait OutputBackend {
    fn name(&self) -> &'static str;

    /// Size of the screen fullscreen surfaces cover.
    fn screen_size(&self) -> FrameSize;

    /// Create a surface on the requested output path.
    ///
    /// Fails when the path is unavailable; callers fall back to another path.
    fn create_surface(&mut self, spec: &SurfaceSpec) -> eyre::Result<SurfaceId>;

    fn destroy_surface(&mut self, id: SurfaceId);

    /// Apply geometry and window state changes to a live surface.
    fn apply_state(
        &mut self,
        id: SurfaceId,
        geometry: Geometry,
        state: &SurfaceState,
    ) -> eyre::Result<()>;

    fn push_frame(&mut self, id: SurfaceId, frame: &FramePayload<'_>) -> eyre::Result<()>;

    /// Flip the last pushed frame onto the screen.
    fn present(&mut self, id: SurfaceId) -> eyre::Result<()>;

    /// Drain pending native events for a surface without blocking.
    fn pump_events(&mut self, id: SurfaceId) -> eyre::Result<Vec<SurfaceEvent>>;
}

/// Builds the backend on the render thread.
pub type BackendFactory = Box<dyn FnOnce() -> eyre::Result<Box<dyn OutputBackend>> + Send>;

/// Factory for the configured backend kind.
///
/// # Errors
///
/// Fails for kinds this build does not include.
pub fn factory(kind: BackendKind) -> eyre::Result<BackendFactory> {
    match kind {
        BackendKind::Memory => {
            let backend = memory::MemoryBackend::new(memory::MemoryOptions::default());
            Ok(Box::new(move || -> eyre::Result<Box<dyn OutputBackend>> {
                Ok(Box::new(backend))
            }))
        }
        #[cfg(feature = "wayland")]
        BackendKind::Wayland => Ok(Box::new(|| -> eyre::Result<Box<dyn OutputBackend>> {
            Ok(Box::new(wayland::WaylandBackend::connect()?))
        })),
        #[cfg(not(feature = "wayland"))]
        BackendKind::Wayland => Err(eyre::eyre!(
            "wayland output requested but built without the `wayland` feature"
        )),
    }
}
