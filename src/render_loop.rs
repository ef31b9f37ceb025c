// SPDX-License-Identifier: MPL-2.0

//! The dedicated render thread.
//!
//! Producers and the facade reach the thread through a bounded command
//! channel. The thread waits on it with a timeout, so a lost wake only costs
//! one poll interval:
//!
//! ```text
//!  set_frame_data ──try_send(Wake)──┐
//!  open / close ──send(Open|Close)──┤
//!                                   ▼
//!                      recv_timeout(poll_interval)
//!                                   │
//!                    lock: take flags, arbitrate, copy frames out
//!                                   │
//!                  unlocked: setup, display, sync, pump events
//! ```
//!
//! Only this thread touches the output backend.

use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cosmic_video_out_config::VideoOutputMode;

use crate::arbiter::{ArbiterInput, FrameInfo, Setup, arbitrate};
use crate::backend::{BackendFactory, SurfaceEvent};
use crate::display_info::{DisplayInfo, DisplayInfoCell};
use crate::events::{DeviceErrorCode, FullscreenToggle, Notifier};
use crate::frame_store::{FrameBuffer, FrameStore, StoreCounters, StreamRole, UpdateRequired};
use crate::surface_manager::SurfaceManager;

/// Capacity of the command channel. Wakes beyond it are dropped.
pub(crate) const COMMAND_CAPACITY: usize = 16;

/// Rendered passes between two progress lines.
const PROGRESS_INTERVAL: u64 = 60;

pub(crate) enum RenderCommand {
    /// initialize and acknowledge
    Open(SyncSender<()>),
    /// release every surface and acknowledge
    Close(SyncSender<()>),
    /// frames are pending
    Wake,
    Shutdown,
}

/// State shared with producer threads, guarded by one lock.
#[derive(Debug, Default)]
pub(crate) struct SharedVars {
    pub store: FrameStore,
    pub current_frame: FrameInfo,
    pub devices_nbr: u32,
    /// frames are accepted only while the render loop is initialized
    pub ready: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Shared {
    vars: Mutex<SharedVars>,
    pub display_info: DisplayInfoCell,
    pub counters: StoreCounters,
}

impl Shared {
    pub fn lock_vars(&self) -> MutexGuard<'_, SharedVars> {
        self.vars.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopState {
    /// waiting for an open request
    Created,
    Initializing,
    Ready,
    Rendering,
    Uninitializing,
    Terminated,
}

pub(crate) struct RenderLoop {
    shared: Arc<Shared>,
    commands: Receiver<RenderCommand>,
    notifier: Notifier,
    poll_interval: Duration,
    surfaces: Option<SurfaceManager>,
    state: LoopState,
    last_frame: FrameInfo,
    /// layout whose setup failed; not retried until something changes
    failed_setup: Option<FrameInfo>,
    error_reported: bool,
    video_disabled: bool,
    frames: [FrameBuffer; 3],
}

impl RenderLoop {
    /// Build the loop and its backend. Must run on the render thread.
    pub fn new(
        shared: Arc<Shared>,
        commands: Receiver<RenderCommand>,
        notifier: Notifier,
        poll_interval: Duration,
        backend: BackendFactory,
    ) -> Self {
        let surfaces = match backend() {
            Ok(backend) => {
                tracing::info!(backend = backend.name(), "render thread started");
                Some(SurfaceManager::new(backend))
            }
            Err(why) => {
                tracing::error!(%why, "output backend unavailable, video disabled");
                None
            }
        };

        Self {
            shared,
            commands,
            notifier,
            poll_interval,
            surfaces,
            state: LoopState::Created,
            last_frame: FrameInfo::default(),
            failed_setup: None,
            error_reported: false,
            video_disabled: false,
            frames: Default::default(),
        }
    }

    pub fn run(mut self) {
        let span = tracing::debug_span!("render_loop");
        let _handle = span.enter();

        loop {
            let command = match self.commands.recv_timeout(self.poll_interval) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(RenderCommand::Shutdown),
            };

            match command {
                Some(RenderCommand::Open(ack)) => {
                    self.initialize();
                    let _ = ack.send(());
                }
                Some(RenderCommand::Close(ack)) => {
                    self.uninitialize();
                    let _ = ack.send(());
                }
                Some(RenderCommand::Shutdown) => break,
                Some(RenderCommand::Wake) | None => {}
            }

            if self.state == LoopState::Ready {
                self.state = LoopState::Rendering;
                self.render_pass();
                self.state = LoopState::Ready;
            }
        }

        self.uninitialize();
        self.surfaces = None;
        self.state = LoopState::Terminated;
        tracing::info!("render thread ended");
    }

    fn initialize(&mut self) {
        self.state = LoopState::Initializing;
        {
            let mut vars = self.shared.lock_vars();
            vars.store.clear();
            vars.current_frame = FrameInfo::default();
            vars.devices_nbr = 0;
            vars.ready = true;
        }

        self.last_frame = FrameInfo::default();
        self.failed_setup = None;
        self.error_reported = false;
        self.video_disabled = self.surfaces.is_none();
        for frame in &mut self.frames {
            frame.clear();
        }

        self.state = LoopState::Ready;
        tracing::debug!("render loop initialized");
    }

    fn uninitialize(&mut self) {
        if self.state != LoopState::Ready {
            return;
        }
        self.state = LoopState::Uninitializing;

        let closed = {
            let mut vars = self.shared.lock_vars();
            vars.ready = false;
            let closed = self
                .surfaces
                .as_mut()
                .is_some_and(SurfaceManager::close_frame_display);
            vars.store.clear();
            closed
        };

        if closed {
            self.notifier.device_closed();
        }
        for frame in &mut self.frames {
            frame.clear();
        }

        self.last_frame = FrameInfo::default();
        self.state = LoopState::Created;
        tracing::debug!("render loop uninitialized");
    }

    fn render_pass(&mut self) {
        let display = self.shared.display_info.get();

        let (decision, updates) = {
            let mut vars = self.shared.lock_vars();
            if !vars.store.updates().any() {
                return;
            }

            let updates = vars.store.take_updates();
            let live = self
                .surfaces
                .as_ref()
                .map(SurfaceManager::live_roles)
                .unwrap_or_default();
            let decision = arbitrate(&ArbiterInput {
                updates,
                devices_nbr: vars.devices_nbr,
                display: &display,
                current: &vars.current_frame,
                last: &self.last_frame,
                live,
            });
            vars.current_frame.mode = decision.frame.mode;

            // a fresh setup shows every stream it has, not just the updated ones
            let copy_all = decision.setup == Setup::Required;
            for role in StreamRole::ALL {
                if updates.get(role) || (copy_all && vars.store.has_frame(role)) {
                    self.frames[role.index()].copy_from(vars.store.buffer(role));
                }
            }

            (decision, updates)
        };

        let frame = decision.frame;
        let fresh = match decision.setup {
            Setup::NotReady => {
                tracing::trace!(mode = ?frame.mode, "display info incomplete, setup deferred");
                return;
            }
            Setup::Required => {
                if self
                    .failed_setup
                    .is_some_and(|failed| failed.same_geometry(&frame))
                {
                    return;
                }
                if !self.setup(&frame, &display) {
                    return;
                }
                true
            }
            Setup::Unchanged => false,
        };

        if self.video_disabled {
            return;
        }

        // nothing flagged means push and present everything
        let push = if fresh {
            UpdateRequired::default()
        } else {
            updates
        };
        self.display(frame.mode, push, &display);

        let rendered = self.shared.counters.record_render();
        if rendered % PROGRESS_INTERVAL == 0 {
            let stats = self.shared.counters.snapshot();
            tracing::debug!(
                stored = stats.frames_stored,
                overwritten = stats.frames_overwritten,
                rendered = stats.frames_rendered,
                "render progress"
            );
        }
    }

    /// Rebuild the surfaces for `frame`. Returns whether the primary opened.
    fn setup(&mut self, frame: &FrameInfo, display: &DisplayInfo) -> bool {
        tracing::debug!(
            mode = ?frame.mode,
            zoom = frame.zoom,
            both_streams_active = frame.both_streams_active,
            "output setup"
        );

        let Some(surfaces) = self.surfaces.as_mut() else {
            self.disable_video(frame, DeviceErrorCode::BackendUnavailable);
            return false;
        };

        let outcome = surfaces.setup_frame_display(frame, display);
        if outcome.closed_any {
            self.notifier.device_closed();
        }

        if !outcome.primary_opened {
            self.disable_video(frame, DeviceErrorCode::NoSurface);
            return false;
        }

        self.last_frame = *frame;
        self.failed_setup = None;
        self.video_disabled = false;
        self.error_reported = false;

        self.notifier.device_opened(
            outcome.accel,
            frame.mode,
            frame.zoom,
            frame.both_streams_active,
            frame.ext_stream_active,
        );
        if let Some(size) = outcome.embedded_size {
            self.notifier.size_changed(size.width, size.height);
        }

        true
    }

    fn disable_video(&mut self, frame: &FrameInfo, code: DeviceErrorCode) {
        self.video_disabled = true;
        self.failed_setup = Some(*frame);
        self.last_frame = FrameInfo::default();

        if !self.error_reported {
            self.error_reported = true;
            tracing::error!(?code, mode = ?frame.mode, "video output disabled");
            self.notifier.device_error(code);
        }
    }

    fn display(&mut self, mode: VideoOutputMode, push: UpdateRequired, display: &DisplayInfo) {
        let Some(surfaces) = self.surfaces.as_mut() else {
            return;
        };
        surfaces.apply_display_options(display);

        let frames = &self.frames;
        let wants = |role: StreamRole| !push.any() || push.get(role);
        let frame_for = |role: StreamRole| &frames[role.index()];

        let events = match mode {
            VideoOutputMode::Unset => return,
            VideoOutputMode::Local | VideoOutputMode::Remote => {
                let role = if mode == VideoOutputMode::Local {
                    StreamRole::Local
                } else {
                    StreamRole::Remote
                };

                if wants(role) {
                    surfaces.display_frame(role, frame_for(role))
                } else {
                    surfaces.pump_events()
                }
            }
            VideoOutputMode::RemoteExt => {
                let mut events = Vec::new();
                for role in [StreamRole::Remote, StreamRole::Extended] {
                    if wants(role) {
                        events.extend(surfaces.display_frame(role, frame_for(role)));
                    }
                }
                events
            }
            VideoOutputMode::Pip | VideoOutputMode::PipWindow | VideoOutputMode::Fullscreen => {
                surfaces.display_pip_frames(
                    frame_for(StreamRole::Local),
                    frame_for(StreamRole::Remote),
                    push,
                )
            }
        };

        surfaces.sync(push);

        for (role, event) in events {
            match event {
                SurfaceEvent::ToggleFullscreen => {
                    self.notifier
                        .fullscreen_mode_changed(FullscreenToggle::Toggle);
                }
                SurfaceEvent::CloseRequested if surfaces.is_fullscreen() => {
                    surfaces.leave_fullscreen();
                    self.notifier.fullscreen_mode_changed(FullscreenToggle::Off);
                }
                SurfaceEvent::CloseRequested => {
                    tracing::debug!(?role, "close request ignored, layout is owned by the GUI");
                }
                SurfaceEvent::Resized { .. } | SurfaceEvent::Exposed => {}
            }
        }
    }
}
