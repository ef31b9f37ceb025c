// SPDX-License-Identifier: MPL-2.0

//! Demo host: synthetic camera and remote streams shown through the engine,
//! with a calloop loop standing in for the GUI thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use calloop::channel;
use calloop::signals::{Signal, Signals};
use clap::Parser;
use cosmic_video_out::backend::memory::{BackendLog, MemoryBackend, MemoryOptions};
use cosmic_video_out::backend::{self, BackendFactory, OutputBackend};
use cosmic_video_out::config::{BackendKind, VideoOutputConfig, VideoOutputMode};
use cosmic_video_out::scaler::rgb_to_yuv;
use cosmic_video_out::{
    DisplayInfo, Notifier, StreamRole, VideoContext, VideoEvent, VideoOutputManager,
};
use eyre::eyre;
use tracing_subscriber::EnvFilter;

const FRAME_INTERVAL: Duration = Duration::from_millis(33);

// white, yellow, cyan, green, magenta, red, blue, black
const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

/// Plays synthetic call video through the output engine.
#[derive(Parser, Debug)]
#[command(version, long_about = None)]
struct Args {
    /// Frames each producer emits before the demo exits
    #[arg(long, default_value_t = 300)]
    frames: u64,

    /// Layout to request: local, remote, pip, pip-window, fullscreen or remote-ext
    #[arg(long)]
    mode: Option<VideoOutputMode>,

    /// Write a PNG of the remote surface here before closing
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

/// State of the stand-in GUI thread.
#[derive(Debug)]
struct Host {
    running: bool,
    notifications: usize,
}

impl Host {
    fn on_event(&mut self, event: VideoEvent) {
        self.notifications += 1;
        match event {
            VideoEvent::DeviceError(code) => {
                tracing::warn!(?code, "video output unavailable");
            }
            event => tracing::info!(?event, "notification"),
        }
    }
}

/// Fill `frame` with I420 colour bars shifted by `offset`.
fn colour_bars(frame: &mut Vec<u8>, width: u32, height: u32, offset: u64) {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = ((w / 2).max(1), (h / 2).max(1));
    frame.resize(w * h + 2 * cw * ch, 0);

    let shift = (offset as usize * 4) % w;
    let yuv = |x: usize| {
        let [r, g, b] = BARS[((x + shift) % w) * BARS.len() / w];
        rgb_to_yuv(r, g, b)
    };

    let (luma, chroma) = frame.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    for row in luma.chunks_exact_mut(w) {
        for (x, px) in row.iter_mut().enumerate() {
            *px = yuv(x)[0];
        }
    }

    for (u_row, v_row) in u_plane.chunks_exact_mut(cw).zip(v_plane.chunks_exact_mut(cw)) {
        for (x, (u, v)) in u_row.iter_mut().zip(v_row.iter_mut()).enumerate() {
            let [_, cb, cr] = yuv(x * 2);
            *u = cb;
            *v = cr;
        }
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cosmic_video_out=info")),
        )
        .init();

    let args = Args::parse();
    let config = VideoOutputConfig::load_or_default();
    let mode = args.mode.unwrap_or(config.default_mode);

    let mut event_loop: calloop::EventLoop<'static, Host> = calloop::EventLoop::try_new()?;
    let (notifier, notifications) = Notifier::channel();
    event_loop
        .handle()
        .insert_source(notifications, |event, _, host| {
            if let channel::Event::Msg(event) = event {
                host.on_event(event);
            }
        })
        .map_err(|err| eyre!("{}", err.error))?;

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])?;
    event_loop
        .handle()
        .insert_source(signals, |event, _, host| {
            tracing::info!(signal = ?event.signal(), "shutting down");
            host.running = false;
        })
        .map_err(|err| eyre!("{}", err.error))?;

    let (factory, memory_log): (BackendFactory, Option<BackendLog>) = match config.backend {
        BackendKind::Memory => {
            let backend = MemoryBackend::new(MemoryOptions::default());
            let log = backend.log();
            let factory: BackendFactory =
                Box::new(move || -> eyre::Result<Box<dyn OutputBackend>> { Ok(Box::new(backend)) });
            (factory, Some(log))
        }
        kind => (backend::factory(kind)?, None),
    };

    let manager = Arc::new(VideoOutputManager::new(VideoContext::new(
        config.clone(),
        notifier,
        factory,
    ))?);
    manager.set_display_info(
        DisplayInfo::from_config(&config)
            .mode(mode)
            .with_widget(None, 0, 0),
    );
    manager.open()?;

    let producing = Arc::new(AtomicBool::new(true));
    let producers = [
        (StreamRole::Remote, 352, 288),
        (StreamRole::Local, 176, 144),
    ]
    .into_iter()
    .map(|(role, width, height)| {
        let manager = Arc::clone(&manager);
        let producing = Arc::clone(&producing);
        let frames = args.frames;

        thread::Builder::new()
            .name(format!("{role:?}-producer").to_lowercase())
            .spawn(move || {
                let mut frame = Vec::new();
                for n in 0..frames {
                    if !producing.load(Ordering::Relaxed) {
                        break;
                    }
                    colour_bars(&mut frame, width, height, n);
                    manager.set_frame_data(&frame, width, height, role, 2);
                    thread::sleep(FRAME_INTERVAL);
                }
            })
    })
    .collect::<Result<Vec<_>, _>>()?;

    let mut host = Host {
        running: true,
        notifications: 0,
    };
    while host.running && producers.iter().any(|producer| !producer.is_finished()) {
        event_loop.dispatch(Some(Duration::from_millis(50)), &mut host)?;
    }

    producing.store(false, Ordering::Relaxed);
    for producer in producers {
        if producer.join().is_err() {
            tracing::error!("producer thread panicked");
        }
    }

    if let Some(path) = args.snapshot.as_deref() {
        match memory_log.and_then(|log| log.snapshot(StreamRole::Remote)) {
            Some(image) => {
                image.save(path)?;
                tracing::info!(path = %path.display(), "snapshot written");
            }
            None => tracing::warn!("no remote frame to snapshot"),
        }
    }

    manager.close();
    event_loop.dispatch(Some(Duration::from_millis(50)), &mut host)?;

    let stats = manager.stats();
    tracing::info!(
        stored = stats.frames_stored,
        overwritten = stats.frames_overwritten,
        rendered = stats.frames_rendered,
        notifications = host.notifications,
        "done"
    );

    Ok(())
}
