// SPDX-License-Identifier: MPL-2.0

//! Video output for calls: decoded frames from local and remote streams are
//! composed into the layout the GUI asks for and pushed to native surfaces
//! from a dedicated render thread.

pub mod arbiter;
pub mod backend;
pub mod display_info;
pub mod events;
pub mod frame_store;
pub mod manager;
mod render_loop;
pub mod scaler;
pub mod surface;
pub mod surface_manager;

#[cfg(test)]
mod tests;

pub use cosmic_video_out_config as config;
pub use display_info::DisplayInfo;
pub use events::{AccelStatus, DeviceErrorCode, FullscreenToggle, Notifier, VideoEvent};
pub use frame_store::{FrameStoreStats, StreamRole};
pub use manager::{VideoContext, VideoOutputManager};
