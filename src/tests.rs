// SPDX-License-Identifier: MPL-2.0

//! End-to-end tests driving the render thread against the memory backend.

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use calloop::{EventLoop, channel};
    use cosmic_video_out_config::{VideoOutputConfig, VideoOutputMode};
    use eyre::eyre;

    use crate::backend::memory::{BackendCall, BackendLog, MemoryBackend, MemoryOptions};
    use crate::backend::{
        BackendFactory, Geometry, OutputBackend, OutputPath, PixelLayout, Placement, SurfaceEvent,
    };
    use crate::display_info::DisplayInfo;
    use crate::events::{AccelStatus, DeviceErrorCode, FullscreenToggle, Notifier, VideoEvent};
    use crate::frame_store::{StreamRole, i420_len};
    use crate::manager::{VideoContext, VideoOutputManager};

    const TIMEOUT: Duration = Duration::from_secs(5);
    const WINDOW: u64 = 7;

    struct Harness {
        manager: VideoOutputManager,
        log: BackendLog,
        event_loop: EventLoop<'static, Vec<VideoEvent>>,
        events: Vec<VideoEvent>,
    }

    impl Harness {
        fn new(options: MemoryOptions, config: VideoOutputConfig) -> Self {
            let backend = MemoryBackend::new(options);
            let log = backend.log();
            let factory: BackendFactory = Box::new(move || -> eyre::Result<Box<dyn OutputBackend>> {
                Ok(Box::new(backend))
            });
            Self::with_factory(factory, log, config)
        }

        fn with_factory(factory: BackendFactory, log: BackendLog, config: VideoOutputConfig) -> Self {
            let (notifier, channel) = Notifier::channel();
            let event_loop: EventLoop<'static, Vec<VideoEvent>> = EventLoop::try_new().unwrap();
            event_loop
                .handle()
                .insert_source(channel, |event, _, events: &mut Vec<VideoEvent>| {
                    if let channel::Event::Msg(event) = event {
                        events.push(event);
                    }
                })
                .unwrap();

            let context = VideoContext::new(config.poll_interval_ms(5), notifier, factory);
            let manager = VideoOutputManager::new(context).unwrap();
            manager.open().unwrap();

            Self {
                manager,
                log,
                event_loop,
                events: Vec::new(),
            }
        }

        fn display(&self, mode: VideoOutputMode) -> DisplayInfo {
            self.manager
                .display_info()
                .mode(mode)
                .with_widget(Some(WINDOW), 10, 20)
        }

        fn push(&self, role: StreamRole, width: u32, height: u32, devices: u32) {
            let frame = vec![128; i420_len(width, height)];
            self.manager
                .set_frame_data(&frame, width, height, role, devices);
        }

        fn dispatch(&mut self) {
            self.event_loop
                .dispatch(Some(Duration::from_millis(5)), &mut self.events)
                .unwrap();
        }

        fn wait_until(&mut self, what: &str, done: impl Fn(&BackendLog, &[VideoEvent]) -> bool) {
            let deadline = Instant::now() + TIMEOUT;
            loop {
                self.dispatch();
                if done(&self.log, &self.events) {
                    return;
                }
                assert!(Instant::now() < deadline, "timed out waiting for {what}");
            }
        }

        /// Let the render thread run a few passes and collect what it sent.
        fn settle(&mut self) {
            let until = Instant::now() + Duration::from_millis(100);
            while Instant::now() < until {
                self.dispatch();
            }
        }
    }

    fn creates(log: &BackendLog) -> Vec<BackendCall> {
        log.calls()
            .into_iter()
            .filter(|call| matches!(call, BackendCall::Create { .. }))
            .collect()
    }

    fn opened(events: &[VideoEvent], mode: VideoOutputMode) -> bool {
        events
            .iter()
            .any(|event| matches!(event, VideoEvent::DeviceOpened { mode: m, .. } if *m == mode))
    }

    #[test]
    fn test_single_remote_stream() {
        let mut harness = Harness::new(MemoryOptions::default(), VideoOutputConfig::default());
        harness
            .manager
            .set_display_info(harness.display(VideoOutputMode::Remote));
        harness.push(StreamRole::Remote, 352, 288, 1);

        harness.wait_until("first present", |log, events| {
            log.presented(StreamRole::Remote) > 0 && events.len() >= 2
        });
        harness.settle();

        assert_eq!(
            harness.events,
            vec![
                VideoEvent::DeviceOpened {
                    accel: AccelStatus::All,
                    mode: VideoOutputMode::Remote,
                    zoom: 100,
                    both_streams_active: false,
                    ext_stream_active: false,
                },
                VideoEvent::SizeChanged {
                    width: 352,
                    height: 288
                },
            ]
        );

        let created = creates(&harness.log);
        assert_eq!(created.len(), 1);
        assert!(matches!(
            created[0],
            BackendCall::Create {
                role: StreamRole::Remote,
                path: OutputPath::Overlay,
                placement: Placement::Embedded {
                    parent: Some(WINDOW)
                },
                geometry: Geometry {
                    x: 10,
                    y: 20,
                    width: 352,
                    height: 288
                },
                ..
            }
        ));
        assert!(harness.log.surface(StreamRole::Local).is_none());
        assert!(harness.log.calls().iter().any(|call| matches!(
            call,
            BackendCall::Push {
                layout: PixelLayout::I420,
                width: 352,
                height: 288,
                ..
            }
        )));

        // more frames of the same size reuse the surface
        harness.push(StreamRole::Remote, 352, 288, 1);
        harness.wait_until("second present", |log, _| {
            log.presented(StreamRole::Remote) > 1
        });
        assert_eq!(creates(&harness.log).len(), 1);
        assert!(harness.manager.stats().frames_rendered >= 1);
    }

    #[test]
    fn test_pip_then_fullscreen() {
        let mut harness = Harness::new(MemoryOptions::default(), VideoOutputConfig::default());

        // frames arriving before the widget is known do not open anything
        harness.push(StreamRole::Remote, 352, 288, 2);
        harness.push(StreamRole::Local, 176, 144, 2);
        harness.settle();
        assert!(creates(&harness.log).is_empty());

        harness
            .manager
            .set_display_info(harness.display(VideoOutputMode::Pip));
        harness.push(StreamRole::Remote, 352, 288, 2);
        harness.wait_until("pip layout", |log, events| {
            log.surface(StreamRole::Local).is_some()
                && opened(events, VideoOutputMode::Pip)
                && events.contains(&VideoEvent::SizeChanged {
                    width: 352,
                    height: 288,
                })
        });

        let (remote_id, remote_geometry, _) = harness.log.surface(StreamRole::Remote).unwrap();
        assert_eq!(remote_geometry, Geometry::new(10, 20, 352, 288));
        assert!(harness.log.calls().iter().any(|call| matches!(
            call,
            BackendCall::Create {
                role: StreamRole::Local,
                placement: Placement::Child { parent },
                geometry,
                ..
            } if *parent == remote_id && *geometry == Geometry::new(234, 192, 117, 96)
        )));
        assert!(harness.events.contains(&VideoEvent::DeviceOpened {
            accel: AccelStatus::All,
            mode: VideoOutputMode::Pip,
            zoom: 100,
            both_streams_active: true,
            ext_stream_active: false,
        }));

        harness.log.clear_calls();
        harness.events.clear();
        harness
            .manager
            .set_display_info(harness.display(VideoOutputMode::Fullscreen));
        harness.push(StreamRole::Remote, 352, 288, 2);
        harness.wait_until("fullscreen layout", |log, events| {
            opened(events, VideoOutputMode::Fullscreen) && log.surface(StreamRole::Local).is_some()
        });

        let calls = harness.log.calls();
        let last_destroy = calls
            .iter()
            .rposition(|call| matches!(call, BackendCall::Destroy { .. }))
            .unwrap();
        let first_create = calls
            .iter()
            .position(|call| matches!(call, BackendCall::Create { .. }))
            .unwrap();
        assert!(last_destroy < first_create);

        let (_, geometry, state) = harness.log.surface(StreamRole::Remote).unwrap();
        assert_eq!(geometry.size().width, 1920);
        assert!(state.fullscreen);
        let (_, inset, _) = harness.log.surface(StreamRole::Local).unwrap();
        assert_eq!(inset, Geometry::new(1280, 720, 640, 360));

        assert_eq!(harness.events[0], VideoEvent::DeviceClosed);
        assert!(
            !harness
                .events
                .iter()
                .any(|event| matches!(event, VideoEvent::SizeChanged { .. }))
        );
    }

    #[test]
    fn test_fullscreen_window_events() {
        let mut harness = Harness::new(MemoryOptions::default(), VideoOutputConfig::default());
        harness.push(StreamRole::Remote, 352, 288, 2);
        harness.push(StreamRole::Local, 176, 144, 2);
        harness
            .manager
            .set_display_info(harness.display(VideoOutputMode::Fullscreen));
        harness.push(StreamRole::Remote, 352, 288, 2);
        harness.wait_until("fullscreen layout", |_, events| {
            opened(events, VideoOutputMode::Fullscreen)
        });

        harness
            .log
            .inject_event(StreamRole::Remote, SurfaceEvent::ToggleFullscreen);
        harness.push(StreamRole::Remote, 352, 288, 2);
        harness.wait_until("toggle request", |_, events| {
            events.contains(&VideoEvent::FullscreenModeChanged(FullscreenToggle::Toggle))
        });

        harness
            .log
            .inject_event(StreamRole::Remote, SurfaceEvent::CloseRequested);
        harness.push(StreamRole::Remote, 352, 288, 2);
        harness.wait_until("fullscreen left", |_, events| {
            events.contains(&VideoEvent::FullscreenModeChanged(FullscreenToggle::Off))
        });

        let (_, geometry, state) = harness.log.surface(StreamRole::Remote).unwrap();
        assert!(!state.fullscreen);
        assert_eq!(geometry.size().width, 352);
    }

    #[test]
    fn test_remote_with_extended_window() {
        let mut harness = Harness::new(MemoryOptions::default(), VideoOutputConfig::default());
        harness.push(StreamRole::Remote, 352, 288, 2);
        harness.push(StreamRole::Extended, 640, 480, 2);
        harness
            .manager
            .set_display_info(harness.display(VideoOutputMode::RemoteExt));
        harness.push(StreamRole::Extended, 640, 480, 2);

        harness.wait_until("extended window", |log, _| {
            log.presented(StreamRole::Extended) > 0
        });

        let (_, geometry, _) = harness.log.surface(StreamRole::Extended).unwrap();
        assert_eq!(geometry.size().width, 640);
        assert!(harness.log.calls().iter().any(|call| matches!(
            call,
            BackendCall::Create {
                role: StreamRole::Extended,
                placement: Placement::Standalone,
                ..
            }
        )));
        assert!(harness.events.iter().any(|event| matches!(
            event,
            VideoEvent::DeviceOpened {
                mode: VideoOutputMode::RemoteExt,
                ext_stream_active: true,
                ..
            }
        )));
    }

    #[test]
    fn test_software_when_hw_disabled() {
        let config = VideoOutputConfig::default().disable_hw_accel(true);
        let mut harness = Harness::new(MemoryOptions::default(), config);
        harness
            .manager
            .set_display_info(harness.display(VideoOutputMode::Remote));
        harness.push(StreamRole::Remote, 352, 288, 1);

        harness.wait_until("software present", |log, _| {
            log.presented(StreamRole::Remote) > 0
        });

        assert!(harness.log.calls().iter().any(|call| matches!(
            call,
            BackendCall::Create {
                path: OutputPath::Software,
                ..
            }
        )));
        assert!(harness.log.calls().iter().any(|call| matches!(
            call,
            BackendCall::Push {
                layout: PixelLayout::Xrgb8888,
                width: 352,
                height: 288,
                ..
            }
        )));
        harness.wait_until("open notification", |_, events| !events.is_empty());
        assert!(matches!(
            harness.events[0],
            VideoEvent::DeviceOpened {
                accel: AccelStatus::Software,
                ..
            }
        ));

        let snapshot = harness.log.snapshot(StreamRole::Remote).unwrap();
        assert_eq!(snapshot.dimensions(), (352, 288));
        for channel in snapshot.get_pixel(100, 100).0 {
            assert!(channel.abs_diff(130) <= 2);
        }
    }

    #[test]
    fn test_falls_back_when_overlay_missing() {
        let options = MemoryOptions {
            overlay: false,
            ..MemoryOptions::default()
        };
        let mut harness = Harness::new(options, VideoOutputConfig::default());
        harness
            .manager
            .set_display_info(harness.display(VideoOutputMode::Remote));
        harness.push(StreamRole::Remote, 352, 288, 1);

        harness.wait_until("open notification", |_, events| !events.is_empty());
        assert!(matches!(
            harness.events[0],
            VideoEvent::DeviceOpened {
                accel: AccelStatus::Software,
                ..
            }
        ));
        assert_eq!(
            harness.log.count(|call| matches!(
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
    fn test_close_stops_rendering() {
        let mut harness = Harness::new(MemoryOptions::default(), VideoOutputConfig::default());
        harness
            .manager
            .set_display_info(harness.display(VideoOutputMode::Remote));
        harness.push(StreamRole::Remote, 352, 288, 1);
        harness.wait_until("first present", |log, _| {
            log.presented(StreamRole::Remote) > 0
        });

        harness.manager.close();
        assert_eq!(harness.log.live_surfaces(), 0);
        harness.log.clear_calls();

        harness.push(StreamRole::Remote, 352, 288, 1);
        harness.settle();
        assert!(harness.log.calls().is_empty());
        assert_eq!(harness.events.last(), Some(&VideoEvent::DeviceClosed));

        // reopening starts from scratch
        harness.manager.open().unwrap();
        harness.push(StreamRole::Remote, 352, 288, 1);
        harness.wait_until("reopened surface", |log, _| log.live_surfaces() == 1);
    }

    #[test]
    fn test_nothing_opens_without_widget() {
        let mut harness = Harness::new(MemoryOptions::default(), VideoOutputConfig::default());
        for _ in 0..5 {
            harness.push(StreamRole::Remote, 352, 288, 1);
            harness.push(StreamRole::Local, 176, 144, 1);
        }
        harness.settle();

        assert!(harness.log.calls().is_empty());
        assert!(harness.events.is_empty());
        assert_eq!(harness.manager.stats().frames_stored, 10);
    }

    #[test]
    fn test_extended_only_single_device_waits() {
        let mut harness = Harness::new(MemoryOptions::default(), VideoOutputConfig::default());
        harness
            .manager
            .set_display_info(harness.display(VideoOutputMode::Remote));
        harness.push(StreamRole::Extended, 640, 480, 1);
        harness.settle();

        assert!(harness.events.is_empty(), "{:?}", harness.events);
        assert_eq!(harness.log.live_surfaces(), 0);

        harness.push(StreamRole::Remote, 352, 288, 1);
        harness.wait_until("remote surface", |_, events| {
            opened(events, VideoOutputMode::Remote)
        });
        assert!(
            !harness
                .events
                .iter()
                .any(|event| matches!(event, VideoEvent::DeviceError(_)))
        );
    }

    #[test]
    fn test_concurrent_producers_never_tear() {
        const FRAMES: u8 = 60;
        const REMOTE_SIZES: [(u32, u32); 3] = [(352, 288), (320, 240), (176, 144)];
        const LOCAL_SIZES: [(u32, u32); 3] = [(176, 144), (160, 120), (128, 96)];

        let mut harness = Harness::new(MemoryOptions::default(), VideoOutputConfig::default());
        harness
            .manager
            .set_display_info(harness.display(VideoOutputMode::Pip));

        // every byte of a frame carries `base + size index`
        let check = |log: &BackendLog, role: StreamRole, sizes: &[(u32, u32)], base: u8| {
            let Some((layout, width, height, data)) = log.frame(role) else {
                return;
            };
            assert_eq!(layout, PixelLayout::I420);
            assert_eq!(data.len(), i420_len(width, height), "{role:?} {width}x{height}");
            let value = data[0];
            assert!(data.iter().all(|&b| b == value), "{role:?} frame mixes values");
            let index = usize::from(value - base);
            assert_eq!(sizes[index], (width, height), "{role:?} size does not match contents");
        };

        let stored: u64 = thread::scope(|scope| {
            let manager = &harness.manager;
            let producers = [
                (StreamRole::Remote, &REMOTE_SIZES, 100u8),
                (StreamRole::Local, &LOCAL_SIZES, 40u8),
            ]
            .map(|(role, sizes, base)| {
                scope.spawn(move || {
                    for n in 0..FRAMES {
                        let index = usize::from(n / 10) % sizes.len();
                        let (width, height) = sizes[index];
                        let frame = vec![base + index as u8; i420_len(width, height)];
                        manager.set_frame_data(&frame, width, height, role, 2);
                        thread::sleep(Duration::from_millis(1));
                    }
                    u64::from(FRAMES)
                })
            });

            while producers.iter().any(|producer| !producer.is_finished()) {
                check(&harness.log, StreamRole::Remote, &REMOTE_SIZES[..], 100);
                check(&harness.log, StreamRole::Local, &LOCAL_SIZES[..], 40);
            }
            producers.into_iter().map(|producer| producer.join().unwrap()).sum()
        });

        harness.wait_until("pip presented", |log, _| {
            log.presented(StreamRole::Remote) > 0 && log.presented(StreamRole::Local) > 0
        });
        check(&harness.log, StreamRole::Remote, &REMOTE_SIZES[..], 100);
        check(&harness.log, StreamRole::Local, &LOCAL_SIZES[..], 40);

        let stats = harness.manager.stats();
        assert_eq!(stats.frames_stored, stored);
        assert!(stats.frames_overwritten < stats.frames_stored);
    }

    #[test]
    fn test_degenerate_frames_ignored() {
        let harness = Harness::new(MemoryOptions::default(), VideoOutputConfig::default());
        harness
            .manager
            .set_frame_data(&[], 0, 288, StreamRole::Remote, 1);
        harness
            .manager
            .set_frame_data(&[0; 16], 352, 0, StreamRole::Remote, 1);
        harness.push(StreamRole::Remote, 1, 1, 1);
        harness.push(StreamRole::Local, 1, 288, 1);
        assert_eq!(harness.manager.stats().frames_stored, 0);

        harness.push(StreamRole::Remote, 2, 2, 1);
        assert_eq!(harness.manager.stats().frames_stored, 1);
    }

    #[test]
    fn test_total_failure_reported_once() {
        let options = MemoryOptions {
            overlay: false,
            software: false,
            ..MemoryOptions::default()
        };
        let mut harness = Harness::new(options, VideoOutputConfig::default());
        let display = harness.display(VideoOutputMode::Remote);
        harness.manager.set_display_info(display.clone());
        harness.push(StreamRole::Remote, 352, 288, 1);

        harness.wait_until("device error", |_, events| !events.is_empty());
        for _ in 0..5 {
            harness.push(StreamRole::Remote, 352, 288, 1);
            harness.settle();
        }

        let failed = |log: &BackendLog| {
            log.count(|call| matches!(call, BackendCall::CreateFailed { .. }))
        };
        assert_eq!(harness.events, vec![VideoEvent::DeviceError(DeviceErrorCode::NoSurface)]);
        assert_eq!(failed(&harness.log), 2);

        // a new zoom is a new layout and is attempted once more
        harness.manager.set_display_info(display.zoom(200));
        harness.push(StreamRole::Remote, 352, 288, 1);
        harness.wait_until("second attempt", |log, _| failed(log) == 4);
        harness.settle();
        assert_eq!(failed(&harness.log), 4);
        assert_eq!(harness.events.len(), 1);
    }

    #[test]
    fn test_backend_unavailable() {
        let factory: BackendFactory =
            Box::new(|| -> eyre::Result<Box<dyn OutputBackend>> { Err(eyre!("no display server")) });
        let mut harness =
            Harness::with_factory(factory, BackendLog::default(), VideoOutputConfig::default());
        harness
            .manager
            .set_display_info(harness.display(VideoOutputMode::Remote));
        harness.push(StreamRole::Remote, 352, 288, 1);

        harness.wait_until("device error", |_, events| !events.is_empty());
        harness.push(StreamRole::Remote, 352, 288, 1);
        harness.settle();
        assert_eq!(
            harness.events,
            vec![VideoEvent::DeviceError(DeviceErrorCode::BackendUnavailable)]
        );
    }
}
