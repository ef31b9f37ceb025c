// SPDX-License-Identifier: MPL-2.0-only

use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const NAME: &str = "cosmic-video-out";
pub const CONFIG_FILE: &str = "config.ron";

/// Layout used to present the conference streams.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum VideoOutputMode {
    /// nothing chosen yet
    #[default]
    Unset,
    /// the local camera preview, embedded in the GUI window
    Local,
    /// the remote peer, embedded in the GUI window
    Remote,
    /// remote embedded with the local preview inset in its corner
    Pip,
    /// remote in its own window with the local preview inset
    PipWindow,
    /// remote covering the screen with the local preview inset
    Fullscreen,
    /// remote embedded plus a separate window for the extended stream
    RemoteExt,
}

impl VideoOutputMode {
    /// Modes showing both the local and the remote stream.
    #[must_use]
    pub fn is_combined(self) -> bool {
        matches!(self, Self::Pip | Self::PipWindow | Self::Fullscreen)
    }

    /// Modes whose primary surface lives inside the GUI window.
    #[must_use]
    pub fn is_embedded(self) -> bool {
        matches!(self, Self::Local | Self::Remote | Self::Pip | Self::RemoteExt)
    }
}

impl fmt::Display for VideoOutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unset => "unset",
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Pip => "pip",
            Self::PipWindow => "pip-window",
            Self::Fullscreen => "fullscreen",
            Self::RemoteExt => "remote-ext",
        })
    }
}

impl FromStr for VideoOutputMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "pip" => Ok(Self::Pip),
            "pip-window" | "pip_window" => Ok(Self::PipWindow),
            "fullscreen" => Ok(Self::Fullscreen),
            "remote-ext" | "remote_ext" => Ok(Self::RemoteExt),
            other => Err(Error::UnknownMode(other.to_owned())),
        }
    }
}

/// Filter used when frames are scaled in software
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScalingAlgorithm {
    // nearest neighbor sampling
    Nearest,
    // box filtering
    Tiles,
    // bilinear filtering
    #[default]
    Bilinear,
    // lanczos filtering with window 3
    Hyper,
}

#[cfg(feature = "scaler")]
impl From<ScalingAlgorithm> for fast_image_resize::ResizeAlg {
    fn from(algorithm: ScalingAlgorithm) -> Self {
        use fast_image_resize::{FilterType, ResizeAlg};

        match algorithm {
            ScalingAlgorithm::Nearest => ResizeAlg::Nearest,
            ScalingAlgorithm::Tiles => ResizeAlg::Convolution(FilterType::Box),
            ScalingAlgorithm::Bilinear => ResizeAlg::Convolution(FilterType::Bilinear),
            ScalingAlgorithm::Hyper => ResizeAlg::Convolution(FilterType::Lanczos3),
        }
    }
}

/// Native windowing backend the render thread drives
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// offscreen surfaces kept in memory
    #[default]
    Memory,
    /// wayland toplevels and subsurfaces
    Wayland,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters)]
#[serde(default, deny_unknown_fields)]
#[must_use]
pub struct VideoOutputConfig {
    /// upper bound in milliseconds the render thread sleeps between passes
    pub poll_interval_ms: u64,
    /// never try overlay surfaces
    pub disable_hw_accel: bool,
    /// let the picture-in-picture inset fall back to software scaling
    pub allow_pip_sw_scaling: bool,
    /// filter used by the software scaler
    pub sw_scaling_algorithm: ScalingAlgorithm,
    /// keep the standalone picture-in-picture window above others
    pub on_top: bool,
    /// mode requested when the GUI has not picked one
    pub default_mode: VideoOutputMode,
    /// zoom factor in percent
    pub default_zoom: u32,
    pub backend: BackendKind,
}

impl Default for VideoOutputConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30,
            disable_hw_accel: false,
            allow_pip_sw_scaling: true,
            sw_scaling_algorithm: ScalingAlgorithm::default(),
            on_top: false,
            default_mode: VideoOutputMode::Remote,
            default_zoom: 100,
            backend: BackendKind::default(),
        }
    }
}

impl VideoOutputConfig {
    /// Location of the config file under the user's config directory.
    #[must_use]
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(NAME).join(CONFIG_FILE))
    }

    /// Load the config from the user's config directory.
    ///
    /// # Errors
    ///
    /// Fails if the config directory is unknown, or the file cannot be read or parsed.
    pub fn load() -> Result<Self, Error> {
        Self::load_from(&Self::path().ok_or(Error::NoConfigDir)?)
    }

    /// Load the config from the given file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        Ok(ron::from_str(&contents)?)
    }

    /// Load the config, falling back to defaults when it is missing or invalid.
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(Error::Io(why)) if why.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("no config file found, using defaults");
                Self::default()
            }
            Err(why) => {
                tracing::warn!(?why, "failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Write the config to the given file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be serialized or written.
    pub fn save_to(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, contents)?;
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Parse(ron::error::SpannedError),
    Serialize(ron::Error),
    NoConfigDir,
    UnknownMode(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(why) => write!(f, "config io error: {why}"),
            Self::Parse(why) => write!(f, "invalid config: {why}"),
            Self::Serialize(why) => write!(f, "config serialization failed: {why}"),
            Self::NoConfigDir => f.write_str("user config directory is unknown"),
            Self::UnknownMode(mode) => write!(f, "unknown video output mode: {mode}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(why) => Some(why),
            Self::Parse(why) => Some(why),
            Self::Serialize(why) => Some(why),
            Self::NoConfigDir | Self::UnknownMode(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(why: io::Error) -> Self {
        Self::Io(why)
    }
}

impl From<ron::error::SpannedError> for Error {
    fn from(why: ron::error::SpannedError) -> Self {
        Self::Parse(why)
    }
}

impl From<ron::Error> for Error {
    fn from(why: ron::Error) -> Self {
        Self::Serialize(why)
    }
}
