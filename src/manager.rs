// SPDX-License-Identifier: MPL-2.0

//! Public entry point of the engine.
//!
//! [`VideoOutputManager`] owns the render thread. Producer threads hand it
//! decoded frames with [`set_frame_data`](VideoOutputManager::set_frame_data),
//! the GUI describes where video goes with
//! [`set_display_info`](VideoOutputManager::set_display_info), and lifecycle
//! notifications come back through the [`Notifier`] channel.

use std::sync::Arc;
use std::sync::mpsc::{self, SyncSender};
use std::thread::{self, JoinHandle};

use cosmic_video_out_config::{VideoOutputConfig, VideoOutputMode};
use eyre::eyre;

use crate::arbiter::FrameSize;
use crate::backend::BackendFactory;
use crate::display_info::DisplayInfo;
use crate::events::Notifier;
use crate::frame_store::{FrameStoreStats, MIN_FRAME_EXTENT, StreamRole, i420_len};
use crate::render_loop::{COMMAND_CAPACITY, RenderCommand, RenderLoop, Shared};

/// Everything the render thread needs to start.
pub struct VideoContext {
    pub config: VideoOutputConfig,
    pub notifier: Notifier,
    /// Builds the output backend on the render thread.
    pub backend: BackendFactory,
}

impl VideoContext {
    pub fn new(config: VideoOutputConfig, notifier: Notifier, backend: BackendFactory) -> Self {
        Self {
            config,
            notifier,
            backend,
        }
    }
}

impl std::fmt::Debug for VideoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct VideoOutputManager {
    shared: Arc<Shared>,
    commands: SyncSender<RenderCommand>,
    thread: Option<JoinHandle<()>>,
}

impl VideoOutputManager {
    /// Spawn the render thread and wait until it runs.
    ///
    /// The display info starts out with the configuration half filled in
    /// from `context.config`.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned or exits during startup.
    pub fn new(context: VideoContext) -> eyre::Result<Self> {
        let VideoContext {
            config,
            notifier,
            backend,
        } = context;

        let shared = Arc::new(Shared::default());
        shared.display_info.set(DisplayInfo::from_config(&config));

        let (commands, command_rx) = mpsc::sync_channel(COMMAND_CAPACITY);
        let (started_tx, started_rx) = mpsc::sync_channel(1);
        let poll_interval = config.poll_interval();
        let thread_shared = Arc::clone(&shared);

        let thread = thread::Builder::new()
            .name(String::from("video-output"))
            .spawn(move || {
                let render_loop =
                    RenderLoop::new(thread_shared, command_rx, notifier, poll_interval, backend);
                let _ = started_tx.send(());
                render_loop.run();
            })?;

        started_rx
            .recv()
            .map_err(|_| eyre!("render thread exited during startup"))?;

        Ok(Self {
            shared,
            commands,
            thread: Some(thread),
        })
    }

    /// Start accepting frames. Blocks until the render loop is initialized.
    ///
    /// # Errors
    ///
    /// Fails if the render thread is gone.
    pub fn open(&self) -> eyre::Result<()> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.commands
            .send(RenderCommand::Open(ack_tx))
            .map_err(|_| eyre!("render thread has exited"))?;
        ack_rx
            .recv()
            .map_err(|_| eyre!("render thread exited before initializing"))?;

        tracing::info!("video output opened");
        Ok(())
    }

    /// Stop accepting frames and release every output surface.
    ///
    /// Returns once the render loop has let go of the surfaces. Frames
    /// handed in afterwards are dropped until the next [`open`](Self::open).
    pub fn close(&self) {
        self.shared.lock_vars().ready = false;

        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self.commands.send(RenderCommand::Close(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.recv();

        tracing::info!("video output closed");
    }

    /// Hand over a decoded I420 frame for `role`.
    ///
    /// Safe to call from any producer thread. Only the newest frame per role
    /// is kept; one not yet rendered is overwritten. Frames narrower or
    /// shorter than two pixels and frames arriving while closed are ignored.
    pub fn set_frame_data(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        role: StreamRole,
        active_device_count: u32,
    ) {
        if width < MIN_FRAME_EXTENT || height < MIN_FRAME_EXTENT {
            tracing::trace!(?role, width, height, "degenerate frame ignored");
            return;
        }

        let expected = i420_len(width, height);
        if data.len() < expected {
            tracing::debug!(?role, len = data.len(), expected, "short frame, padding");
        }

        let overwritten = {
            let mut vars = self.shared.lock_vars();
            if !vars.ready {
                return;
            }

            let overwritten = vars.store.store(role, data, width, height);
            vars.devices_nbr = active_device_count;
            vars.current_frame.set_size(role, FrameSize::new(width, height));

            let both_streams_active = active_device_count > 1
                && vars.store.has_frame(StreamRole::Local)
                && vars.store.has_frame(StreamRole::Remote);
            vars.current_frame.both_streams_active = both_streams_active;
            vars.current_frame.ext_stream_active = vars.store.has_frame(StreamRole::Extended);

            if active_device_count <= 1 {
                vars.current_frame.mode = if role == StreamRole::Local {
                    VideoOutputMode::Local
                } else {
                    VideoOutputMode::Remote
                };
            }

            overwritten
        };

        self.shared.counters.record_store(overwritten);
        if overwritten {
            tracing::trace!(?role, "unrendered frame overwritten");
        }

        // a full queue already holds a wake
        let _ = self.commands.try_send(RenderCommand::Wake);
    }

    /// Replace the GUI's description of the output. Applied on the next
    /// render pass.
    pub fn set_display_info(&self, info: DisplayInfo) {
        tracing::debug!(
            mode = ?info.mode,
            zoom = info.zoom,
            ready = info.is_ready(),
            "display info updated"
        );
        self.shared.display_info.set(info);
    }

    #[must_use]
    pub fn display_info(&self) -> DisplayInfo {
        self.shared.display_info.get()
    }

    #[must_use]
    pub fn stats(&self) -> FrameStoreStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for VideoOutputManager {
    fn drop(&mut self) {
        let _ = self.commands.send(RenderCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("render thread panicked");
            }
        }
    }
}
