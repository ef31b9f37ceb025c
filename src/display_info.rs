// SPDX-License-Identifier: MPL-2.0

use std::sync::{Mutex, PoisonError};

use cosmic_video_out_config::{ScalingAlgorithm, VideoOutputConfig, VideoOutputMode};
use derive_setters::Setters;

/// Opaque native handle owned by the GUI, such as a parent window id.
pub type NativeHandle = u64;

/// GUI-supplied parameters describing where and how video is shown.
///
/// The GUI fills in the widget half (handles, position) and the config half
/// (mode, zoom, acceleration preferences) independently; rendering starts
/// only once both halves are marked as set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Setters)]
#[must_use]
pub struct DisplayInfo {
    /// window the embedded surfaces are parented to
    #[setters(strip_option)]
    pub window_handle: Option<NativeHandle>,
    /// graphics context of the GUI window, when the platform has one
    #[setters(strip_option)]
    pub graphics_context: Option<NativeHandle>,
    /// embedded surface position inside the GUI window
    pub x: i32,
    pub y: i32,
    pub mode: VideoOutputMode,
    /// zoom factor in percent
    pub zoom: u32,
    pub widget_info_set: bool,
    pub config_info_set: bool,
    pub disable_hw_accel: bool,
    pub allow_pip_sw_scaling: bool,
    pub sw_scaling_algorithm: ScalingAlgorithm,
    pub on_top: bool,
}

impl DisplayInfo {
    /// Seed the config half from the persisted configuration.
    pub fn from_config(config: &VideoOutputConfig) -> Self {
        Self {
            mode: config.default_mode,
            zoom: config.default_zoom,
            config_info_set: true,
            disable_hw_accel: config.disable_hw_accel,
            allow_pip_sw_scaling: config.allow_pip_sw_scaling,
            sw_scaling_algorithm: config.sw_scaling_algorithm,
            on_top: config.on_top,
            ..Self::default()
        }
    }

    /// Fill in the widget half and mark it as set.
    pub fn with_widget(mut self, window_handle: Option<NativeHandle>, x: i32, y: i32) -> Self {
        self.window_handle = window_handle;
        self.x = x;
        self.y = y;
        self.widget_info_set = true;
        self
    }

    /// Whether enough is known to set up output surfaces.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.widget_info_set && self.config_info_set && self.zoom != 0
    }
}

/// Mutex-guarded [`DisplayInfo`] snapshot, written by the GUI thread and
/// read once per render pass.
#[derive(Debug, Default)]
pub struct DisplayInfoCell {
    inner: Mutex<DisplayInfo>,
}

impl DisplayInfoCell {
    pub fn set(&self, info: DisplayInfo) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = info;
    }

    #[must_use]
    pub fn get(&self) -> DisplayInfo {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
