// SPDX-License-Identifier: MPL-2.0

//! Mode arbitration.
//!
//! Decides which layout to render from stream activity, the number of open
//! devices and the GUI's requested mode, and whether the output surfaces
//! have to be rebuilt for it. Nothing here touches native resources.

use cosmic_video_out_config::VideoOutputMode;

use crate::display_info::DisplayInfo;
use crate::frame_store::{RoleFlags, StreamRole, UpdateRequired};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size scaled by a zoom factor in percent.
    #[must_use]
    pub fn zoomed(self, zoom: u32) -> Self {
        let scale = |v: u32| (u64::from(v) * u64::from(zoom) / 100).min(u64::from(u32::MAX)) as u32;
        Self::new(scale(self.width), scale(self.height))
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Layout descriptor for the frames currently being shown.
///
/// The render thread keeps two of these: the latest truth gathered from
/// producers and the GUI, and the one the surfaces were last built for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub mode: VideoOutputMode,
    pub zoom: u32,
    pub local: FrameSize,
    pub remote: FrameSize,
    pub extended: FrameSize,
    pub both_streams_active: bool,
    pub ext_stream_active: bool,
    pub embedded_x: i32,
    pub embedded_y: i32,
    pub hw_accel_disabled: bool,
}

impl FrameInfo {
    #[must_use]
    pub fn size(&self, role: StreamRole) -> FrameSize {
        match role {
            StreamRole::Local => self.local,
            StreamRole::Remote => self.remote,
            StreamRole::Extended => self.extended,
        }
    }

    pub fn set_size(&mut self, role: StreamRole, size: FrameSize) {
        match role {
            StreamRole::Local => self.local = size,
            StreamRole::Remote => self.remote = size,
            StreamRole::Extended => self.extended = size,
        }
    }

    /// Whether `other` would produce the same surfaces as `self`.
    ///
    /// Only fields that influence geometry in the current mode are compared:
    /// the embedding position is irrelevant for standalone windows, and so
    /// are the sizes of streams the mode does not show.
    #[must_use]
    pub fn same_geometry(&self, other: &FrameInfo) -> bool {
        if self.mode != other.mode
            || self.zoom != other.zoom
            || self.hw_accel_disabled != other.hw_accel_disabled
        {
            return false;
        }

        let position = self.embedded_x == other.embedded_x && self.embedded_y == other.embedded_y;
        match self.mode {
            VideoOutputMode::Unset => true,
            VideoOutputMode::Local => self.local == other.local && position,
            VideoOutputMode::Remote => self.remote == other.remote && position,
            VideoOutputMode::RemoteExt => {
                self.remote == other.remote && self.extended == other.extended && position
            }
            VideoOutputMode::Pip => {
                self.local == other.local && self.remote == other.remote && position
            }
            VideoOutputMode::PipWindow | VideoOutputMode::Fullscreen => {
                self.local == other.local && self.remote == other.remote
            }
        }
    }
}

/// Stream roles that get a surface in `mode`.
#[must_use]
pub fn required_roles(mode: VideoOutputMode) -> RoleFlags {
    match mode {
        VideoOutputMode::Unset => RoleFlags::default(),
        VideoOutputMode::Local => RoleFlags {
            local: true,
            ..RoleFlags::default()
        },
        VideoOutputMode::Remote => RoleFlags {
            remote: true,
            ..RoleFlags::default()
        },
        VideoOutputMode::RemoteExt => RoleFlags {
            remote: true,
            extended: true,
            local: false,
        },
        VideoOutputMode::Pip | VideoOutputMode::PipWindow | VideoOutputMode::Fullscreen => {
            RoleFlags {
                local: true,
                remote: true,
                extended: false,
            }
        }
    }
}

/// Everything the arbiter looks at for one render pass.
#[derive(Debug, Clone, Copy)]
pub struct ArbiterInput<'a> {
    pub updates: UpdateRequired,
    pub devices_nbr: u32,
    pub display: &'a DisplayInfo,
    /// latest frame descriptor, as maintained by producers
    pub current: &'a FrameInfo,
    /// descriptor the live surfaces were built for
    pub last: &'a FrameInfo,
    /// roles that currently have a live surface
    pub live: RoleFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setup {
    /// live surfaces already match
    Unchanged,
    /// surfaces must be torn down and rebuilt
    Required,
    /// the GUI has not provided enough to build surfaces
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub frame: FrameInfo,
    pub setup: Setup,
}

/// Resolve the mode to render and whether surfaces must be rebuilt.
#[must_use]
pub fn arbitrate(input: &ArbiterInput<'_>) -> Decision {
    let display = input.display;

    let mut frame = *input.current;
    frame.zoom = display.zoom;
    frame.embedded_x = display.x;
    frame.embedded_y = display.y;
    frame.hw_accel_disabled = display.disable_hw_accel;
    frame.mode = resolve_mode(input.updates, input.devices_nbr, display.mode, &frame);

    let setup = if !display.is_ready() || frame.mode == VideoOutputMode::Unset {
        Setup::NotReady
    } else if !frame.same_geometry(input.last) || !required_roles(frame.mode).is_subset_of(&input.live) {
        Setup::Required
    } else {
        Setup::Unchanged
    };

    Decision { frame, setup }
}

fn resolve_mode(
    updates: UpdateRequired,
    devices_nbr: u32,
    requested: VideoOutputMode,
    frame: &FrameInfo,
) -> VideoOutputMode {
    if devices_nbr <= 1 {
        // nothing to combine: show whichever drawable stream is delivering
        let has_remote = !frame.remote.is_empty();
        let has_local = !frame.local.is_empty();
        return match frame.mode {
            _ if updates.remote && has_remote => VideoOutputMode::Remote,
            _ if updates.local && has_local => VideoOutputMode::Local,
            VideoOutputMode::Remote if has_remote => VideoOutputMode::Remote,
            VideoOutputMode::Local if has_local => VideoOutputMode::Local,
            _ if has_remote => VideoOutputMode::Remote,
            _ if has_local => VideoOutputMode::Local,
            // an extended stream alone has no single-stream layout
            _ => VideoOutputMode::Unset,
        };
    }

    match requested {
        VideoOutputMode::Unset | VideoOutputMode::Local | VideoOutputMode::Remote => requested,
        VideoOutputMode::Pip | VideoOutputMode::PipWindow | VideoOutputMode::Fullscreen => {
            if frame.both_streams_active {
                requested
            } else {
                single_stream_fallback(frame)
            }
        }
        VideoOutputMode::RemoteExt => {
            if frame.ext_stream_active {
                requested
            } else {
                VideoOutputMode::Remote
            }
        }
    }
}

fn single_stream_fallback(frame: &FrameInfo) -> VideoOutputMode {
    if frame.remote.is_empty() {
        VideoOutputMode::Local
    } else {
        VideoOutputMode::Remote
    }
}
