// SPDX-License-Identifier: MPL-2.0

//! Notifications marshalled from the render thread onto the GUI thread.
//!
//! The host inserts the [`calloop::channel::Channel`] returned by
//! [`Notifier::channel`] into its own event loop; every [`VideoEvent`] is
//! then delivered from that loop's dispatch, on the GUI thread.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use calloop::channel::{self, Channel, Sender};
use cosmic_video_out_config::VideoOutputMode;

/// Which output paths the open surfaces ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelStatus {
    /// every open surface uses the overlay path
    All,
    /// remote on the overlay path, the inset on software or absent
    RemoteOnly,
    /// the primary surface is scaled in software
    Software,
    NoVideo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullscreenToggle {
    On,
    Off,
    Toggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    /// no output path could be opened for the primary stream
    NoSurface,
    /// the native backend could not be created
    BackendUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoEvent {
    DeviceOpened {
        accel: AccelStatus,
        mode: VideoOutputMode,
        zoom: u32,
        both_streams_active: bool,
        ext_stream_active: bool,
    },
    DeviceClosed,
    DeviceError(DeviceErrorCode),
    SizeChanged {
        width: u32,
        height: u32,
    },
    FullscreenModeChanged(FullscreenToggle),
}

/// Sending half of the GUI notification channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Sender<VideoEvent>,
    disconnected: Arc<AtomicBool>,
}

impl Notifier {
    /// Create a notifier and the channel the GUI event loop should own.
    #[must_use]
    pub fn channel() -> (Self, Channel<VideoEvent>) {
        let (tx, rx) = channel::channel();
        let notifier = Self {
            tx,
            disconnected: Arc::new(AtomicBool::new(false)),
        };
        (notifier, rx)
    }

    pub fn send(&self, event: VideoEvent) {
        tracing::trace!(?event, "notify");
        if self.tx.send(event).is_err() && !self.disconnected.swap(true, Ordering::Relaxed) {
            tracing::debug!("notification channel closed, dropping GUI events");
        }
    }

    pub fn device_opened(
        &self,
        accel: AccelStatus,
        mode: VideoOutputMode,
        zoom: u32,
        both_streams_active: bool,
        ext_stream_active: bool,
    ) {
        self.send(VideoEvent::DeviceOpened {
            accel,
            mode,
            zoom,
            both_streams_active,
            ext_stream_active,
        });
    }

    pub fn device_closed(&self) {
        self.send(VideoEvent::DeviceClosed);
    }

    pub fn device_error(&self, code: DeviceErrorCode) {
        self.send(VideoEvent::DeviceError(code));
    }

    pub fn size_changed(&self, width: u32, height: u32) {
        self.send(VideoEvent::SizeChanged { width, height });
    }

    pub fn fullscreen_mode_changed(&self, toggle: FullscreenToggle) {
        self.send(VideoEvent::FullscreenModeChanged(toggle));
    }
}
