//! End-to-end engine scenarios, driven deterministically through the
//! dummy driver: the test thread is the "driver thread" and pumps one
//! bufferswitch at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cadenza::hw::DriverRegistry;
use cadenza::hw::dummy::{DummyDriver, DummyHandle, DummySpec};
use cadenza::{
    AudioClient, Block, Direction, Engine, EngineConfig, EngineError, EngineState, XrunKind,
};

#[derive(Default)]
struct Probe {
    process_calls: AtomicUsize,
    preload_calls: AtomicUsize,
    done_calls: AtomicUsize,
    done_loop_stops: AtomicUsize,
    hangs: AtomicUsize,
    fatals: AtomicUsize,
    states: Mutex<Vec<EngineState>>,
    first_done_capture: Mutex<Option<f32>>,
}

type ProcessFn = Box<dyn FnMut(&mut Block, &mut Block, usize, bool) + Send>;

struct TestClient {
    probe: Arc<Probe>,
    process_fn: ProcessFn,
}

impl AudioClient for TestClient {
    fn process(&mut self, capture: &mut Block, playback: &mut Block, queued: usize, preloading: bool) {
        self.probe.process_calls.fetch_add(1, Ordering::SeqCst);
        if preloading {
            self.probe.preload_calls.fetch_add(1, Ordering::SeqCst);
        }
        (self.process_fn)(capture, playback, queued, preloading);
    }

    fn on_buffer_done(&mut self, capture: &Block, _playback: &Block, _backlog: usize) {
        self.probe.done_calls.fetch_add(1, Ordering::SeqCst);
        let mut first = self.probe.first_done_capture.lock().unwrap();
        if first.is_none() && capture.channels() > 0 && capture.frames() > 0 {
            *first = Some(capture.channel(0)[0]);
        }
    }

    fn on_state_change(&mut self, state: EngineState) {
        self.probe.states.lock().unwrap().push(state);
    }

    fn on_hang(&mut self) {
        self.probe.hangs.fetch_add(1, Ordering::SeqCst);
    }

    fn on_fatal_error(&mut self, _message: &str) {
        self.probe.fatals.fetch_add(1, Ordering::SeqCst);
    }

    fn on_done_loop_stopped(&mut self) {
        self.probe.done_loop_stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn echo_client(probe: &Arc<Probe>) -> TestClient {
    TestClient {
        probe: probe.clone(),
        process_fn: Box::new(|capture, playback, _queued, _preloading| {
            playback
                .copy_from(capture)
                .expect("echo requires matching shapes");
        }),
    }
}

fn make_engine(config: &EngineConfig, client: TestClient) -> (Engine, DummyHandle) {
    let (driver, handle) = DummyDriver::new(DummySpec::default());
    let mut engine = Engine::with_registry(Box::new(client), DriverRegistry::empty());
    engine.load_driver(Box::new(driver)).unwrap();
    engine.init(config).unwrap();
    (engine, handle)
}

fn config(frames: usize, proc_depth: usize, done_depth: usize) -> EngineConfig {
    EngineConfig {
        buffer_frames: Some(frames),
        proc_queue_depth: proc_depth,
        done_queue_depth: done_depth,
        ..EngineConfig::default()
    }
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Capture block for period `k`: sample `i` is `(k * frames + i) / 1024`,
/// exact through the dummy's 32-bit integer round trip.
fn capture_block(k: usize, channels: usize, frames: usize) -> Block {
    let mut block = Block::new(channels, frames);
    for ch in 0..channels {
        for (i, sample) in block.channel_mut(ch).iter_mut().enumerate() {
            *sample = (k * frames + i) as f32 / 1024.0;
        }
    }
    block
}

fn assert_blocks_equal(actual: &Block, expected: &Block, what: &str) {
    assert_eq!(actual.shape(), expected.shape(), "{what}: shape");
    for ch in 0..expected.channels() {
        for i in 0..expected.frames() {
            assert_eq!(
                actual.channel(ch)[i],
                expected.channel(ch)[i],
                "{what}: channel {ch} frame {i}"
            );
        }
    }
}

fn assert_silent(block: &Block, what: &str) {
    for ch in 0..block.channels() {
        assert!(
            block.channel(ch).iter().all(|&s| s == 0.0),
            "{what}: channel {ch} not silent"
        );
    }
}

#[test]
fn echo_loopback_buffered() {
    let probe = Arc::new(Probe::default());
    let (mut engine, handle) = make_engine(&config(64, 4, 8), echo_client(&probe));
    let observer = engine.observer();

    engine.start().unwrap();
    // Prefill ran the client once per playback slot, flagged as preload.
    assert_eq!(probe.preload_calls.load(Ordering::SeqCst), 4);
    assert_eq!(probe.process_calls.load(Ordering::SeqCst), 4);

    for k in 1..=12usize {
        // A processed block must be committed to the playback queue
        // before the device asks for it: prefill covers the first four
        // periods, completed processing cycles the rest.
        assert!(
            wait_until(Duration::from_secs(2), || {
                observer.counters().proc_bufferswitches + 4 >= k
            }),
            "processing thread starved before period {k}"
        );
        handle.feed_input(&capture_block(k, 2, 64));
        assert!(handle.pump());
    }

    let recorded = handle.recorded_outputs();
    assert_eq!(recorded.len(), 12);
    // The first four periods replay the (silent) prefill; afterwards the
    // device hears the capture from four periods earlier, verbatim.
    for (p, block) in recorded.iter().enumerate() {
        if p < 4 {
            assert_silent(block, &format!("prefill period {p}"));
        } else {
            assert_blocks_equal(block, &capture_block(p - 3, 2, 64), &format!("period {p}"));
        }
    }

    // The done path saw every pumped pair.
    assert!(wait_until(Duration::from_secs(2), || {
        probe.done_calls.load(Ordering::SeqCst) >= 12
    }));
    let counters = engine.counters();
    assert_eq!(counters.xruns_proc, 0);
    assert_eq!(counters.xruns_done, 0);
    assert_eq!(counters.xruns_rt, 0);
    assert_eq!(counters.driver_bufferswitches, 12);

    engine.stop_and_wait(true);
    assert_eq!(engine.state(), EngineState::Prepared);
    assert!(!observer.is_stopping());
    assert_eq!(probe.done_loop_stops.load(Ordering::SeqCst), 1);
    // The done thread drained its queues itself; nothing was thrown away.
    assert_eq!(engine.counters().done_blocks_discarded, 0);

    engine.dispose_buffers().unwrap();
    assert_eq!(engine.state(), EngineState::Initialized);
    engine.unload();
    assert_eq!(engine.state(), EngineState::Free);

    assert_eq!(
        probe.states.lock().unwrap().as_slice(),
        &[
            EngineState::Loaded,
            EngineState::Initialized,
            EngineState::Prepared,
            EngineState::Running,
            EngineState::Prepared,
            EngineState::Initialized,
            EngineState::Free,
        ]
    );
}

#[test]
fn realtime_mode_processes_inside_the_callback() {
    let probe = Arc::new(Probe::default());
    let (mut engine, handle) = make_engine(&config(64, 0, 0), echo_client(&probe));

    engine.start().unwrap();
    // No prefill in realtime mode.
    assert_eq!(probe.process_calls.load(Ordering::SeqCst), 0);

    for k in 1..=3usize {
        handle.feed_input(&capture_block(k, 2, 64));
        assert!(handle.pump());
        // Processing happened synchronously inside the pump.
        assert_eq!(probe.process_calls.load(Ordering::SeqCst), k);
    }

    let recorded = handle.recorded_outputs();
    assert_eq!(recorded.len(), 3);
    for (p, block) in recorded.iter().enumerate() {
        assert_blocks_equal(block, &capture_block(p + 1, 2, 64), &format!("period {p}"));
    }

    let counters = engine.counters();
    // The processing thread never ran.
    assert_eq!(counters.proc_bufferswitches, 0);
    assert_eq!(counters.driver_bufferswitches, 3);
    assert_eq!(counters.xruns_rt, 0);

    engine.stop_and_wait(true);
    assert_eq!(engine.state(), EngineState::Prepared);
}

#[test]
fn realtime_overlap_raises_rt_xrun() {
    let probe = Arc::new(Probe::default());
    let slow = TestClient {
        probe: probe.clone(),
        process_fn: Box::new(|capture, playback, _queued, _preloading| {
            thread::sleep(Duration::from_millis(80));
            playback.copy_from(capture).unwrap();
        }),
    };
    let (mut engine, handle) = make_engine(&config(64, 0, 0), slow);
    let observer = engine.observer();

    engine.start().unwrap();

    let slow_pump = {
        let handle = handle.clone();
        thread::spawn(move || {
            handle.pump();
        })
    };
    // Wait for the first pump to be inside the client, then overlap it.
    assert!(wait_until(Duration::from_secs(2), || {
        probe.process_calls.load(Ordering::SeqCst) == 1
    }));
    assert!(handle.pump());
    slow_pump.join().unwrap();

    // The overlapping period was skipped and counted as a realtime xrun.
    assert_eq!(observer.xruns(XrunKind::Rt), 1);
    assert_eq!(probe.process_calls.load(Ordering::SeqCst), 1);

    engine.stop_and_wait(true);
    assert_eq!(engine.state(), EngineState::Prepared);
}

#[test]
fn graceful_stop_plays_tail_silence() {
    let probe = Arc::new(Probe::default());
    let mut produced = 0usize;
    let ramp = TestClient {
        probe: probe.clone(),
        process_fn: Box::new(move |_capture, playback, _queued, _preloading| {
            produced += 1;
            if produced <= 10 {
                let value = produced as f32 / 64.0;
                for ch in 0..playback.channels() {
                    playback.channel_mut(ch).fill(value);
                }
                if produced == 10 {
                    playback.set_last(true);
                }
            }
            // Later calls leave the (cleared) slot silent.
        }),
    };
    // A long period keeps the stop thread's timeout far away from the
    // quick pumps below.
    let (mut engine, handle) = make_engine(&config(1024, 4, 0), ramp);
    let observer = engine.observer();

    engine.start().unwrap();

    for k in 1..=10usize {
        assert!(
            wait_until(Duration::from_secs(2), || {
                observer.counters().proc_bufferswitches + 4 >= k
            }),
            "no block ready for period {k}"
        );
        assert!(handle.pump());
    }

    // Pump 10 delivered the last-flagged block; the stop protocol begins.
    assert!(wait_until(Duration::from_secs(2), || observer.is_stopping()));

    // The device keeps switching and receives exactly the configured
    // number of silent periods before it is stopped.
    for tail in 0..4 {
        assert!(handle.is_running(), "device stopped early at tail {tail}");
        assert!(handle.pump());
    }
    assert!(wait_until(Duration::from_secs(2), || !handle.is_running()));
    observer.wait_stopped();
    assert_eq!(engine.state(), EngineState::Prepared);

    let recorded = handle.recorded_outputs();
    assert_eq!(recorded.len(), 14);
    for (p, block) in recorded.iter().enumerate() {
        if p < 10 {
            let value = (p + 1) as f32 / 64.0;
            assert!(
                block.channel(0).iter().all(|&s| s == value),
                "period {p} should be the ramp block {value}"
            );
        } else {
            assert_silent(block, &format!("tail period {p}"));
        }
    }
}

#[test]
fn last_flag_during_prefill_short_circuits() {
    let probe = Arc::new(Probe::default());
    let mut produced = 0usize;
    let short = TestClient {
        probe: probe.clone(),
        process_fn: Box::new(move |_capture, playback, _queued, _preloading| {
            produced += 1;
            if produced <= 2 {
                for ch in 0..playback.channels() {
                    playback.channel_mut(ch).fill(produced as f32 / 64.0);
                }
                if produced == 2 {
                    playback.set_last(true);
                }
            }
        }),
    };
    let (mut engine, handle) = make_engine(&config(1024, 4, 0), short);
    let observer = engine.observer();

    engine.start().unwrap();
    // Prefill stopped early: the client flagged its second block as last.
    assert_eq!(probe.preload_calls.load(Ordering::SeqCst), 2);

    assert!(handle.pump());
    assert!(handle.pump());
    assert!(wait_until(Duration::from_secs(2), || observer.is_stopping()));
    for _ in 0..4 {
        assert!(handle.pump());
    }
    assert!(wait_until(Duration::from_secs(2), || !handle.is_running()));
    observer.wait_stopped();

    let recorded = handle.recorded_outputs();
    assert_eq!(recorded.len(), 6);
    assert!(recorded[0].channel(0).iter().all(|&s| s == 1.0 / 64.0));
    assert!(recorded[1].channel(0).iter().all(|&s| s == 2.0 / 64.0));
    for block in &recorded[2..] {
        assert_silent(block, "tail after early last flag");
    }
}

#[test]
fn abrupt_stop_skips_tail_silence() {
    let probe = Arc::new(Probe::default());
    let (mut engine, handle) = make_engine(&config(64, 4, 0), echo_client(&probe));

    engine.start().unwrap();
    for _ in 0..2 {
        handle.pump();
    }

    engine.stop_and_wait(false);
    assert!(!handle.is_running());
    assert_eq!(engine.state(), EngineState::Prepared);
    // No tail periods were requested from the device.
    assert_eq!(handle.recorded_outputs().len(), 2);
}

#[test]
fn frozen_driver_trips_the_watchdog_and_still_stops() {
    let probe = Arc::new(Probe::default());
    let mut cfg = config(64, 4, 0);
    cfg.watchdog_timeout_ms = 40;
    let (mut engine, handle) = make_engine(&cfg, echo_client(&probe));

    engine.start().unwrap();
    for _ in 0..3 {
        handle.pump();
    }

    // Freeze: no more bufferswitches. The watchdog must notice.
    assert!(wait_until(Duration::from_secs(2), || {
        probe.hangs.load(Ordering::SeqCst) >= 1
    }));

    // Stopping cannot rely on the driver any more; the stop thread's
    // per-switch timeout guarantees progress.
    let begun = Instant::now();
    engine.stop_and_wait(true);
    assert!(begun.elapsed() < Duration::from_secs(2));
    assert_eq!(engine.state(), EngineState::Prepared);

    let hangs = probe.hangs.load(Ordering::SeqCst);
    assert!((1..=3).contains(&hangs), "one hang per missed cycle, got {hangs}");
}

#[test]
fn control_operations_enforce_the_state_machine() {
    let probe = Arc::new(Probe::default());
    let mut engine = Engine::with_registry(
        Box::new(echo_client(&probe)),
        DriverRegistry::empty(),
    );

    assert!(matches!(
        engine.init(&config(64, 4, 0)),
        Err(EngineError::InvalidState { .. })
    ));
    assert!(matches!(
        engine.start(),
        Err(EngineError::InvalidState { .. })
    ));
    assert!(matches!(
        engine.dispose_buffers(),
        Err(EngineError::InvalidState { .. })
    ));
    // Stopping an idle engine is a no-op and never blocks.
    engine.stop(true);
    engine.stop_and_wait(true);
    assert_eq!(engine.state(), EngineState::Free);

    let (driver, _handle) = DummyDriver::new(DummySpec::default());
    engine.load_driver(Box::new(driver)).unwrap();
    assert_eq!(engine.state(), EngineState::Initialized);

    // A mask selecting a channel the hardware does not have.
    let mut bad = config(64, 4, 0);
    bad.input_channels = vec![true; 5];
    assert!(matches!(engine.init(&bad), Err(EngineError::Unsupported(_))));
    assert_eq!(engine.state(), EngineState::Initialized);

    // A buffer size the driver rejects (not a power of two here).
    let mut bad = config(65, 4, 0);
    bad.buffer_frames = Some(65);
    assert!(matches!(engine.init(&bad), Err(EngineError::Unsupported(_))));
    assert_eq!(engine.state(), EngineState::Initialized);

    // An unsupported sample rate.
    let mut bad = config(64, 4, 0);
    bad.sample_rate = Some(12_345.0);
    assert!(matches!(engine.init(&bad), Err(EngineError::Unsupported(_))));
    assert_eq!(engine.state(), EngineState::Initialized);

    engine.init(&config(64, 4, 0)).unwrap();
    assert_eq!(engine.state(), EngineState::Prepared);
    assert!(matches!(
        engine.set_sample_rate(12_345.0),
        Err(EngineError::Unsupported(_))
    ));
    engine.set_sample_rate(48_000.0).unwrap();

    engine.start().unwrap();
    assert!(matches!(
        engine.start(),
        Err(EngineError::InvalidState { .. })
    ));
    assert!(matches!(
        engine.set_sample_rate(44_100.0),
        Err(EngineError::InvalidState { .. })
    ));
    engine.stop_and_wait(true);
    assert_eq!(engine.state(), EngineState::Prepared);
}

#[test]
fn prepared_observers_report_channels_and_latency() {
    let probe = Arc::new(Probe::default());
    let (engine, _handle) = make_engine(&config(64, 4, 0), echo_client(&probe));

    assert_eq!(engine.buffer_frames(), Some(64));
    assert_eq!(engine.active_channels(Direction::Input), 2);
    assert_eq!(engine.active_channels(Direction::Output), 2);
    assert!(
        engine
            .active_channel_name(Direction::Output, 1)
            .unwrap()
            .contains("out")
    );
    // The dummy reports one period of device latency; playback adds the
    // queue on top.
    assert_eq!(engine.latency(Direction::Input).unwrap(), 64);
    assert_eq!(engine.latency(Direction::Output).unwrap(), 64 + 4 * 64);
    // 32-bit integer channels reproduce +1 one quantum short of full
    // scale, -1 exactly.
    assert_eq!(
        engine.max_sample_value(Direction::Output, 0).unwrap(),
        1.0 - f32::EPSILON
    );
    assert_eq!(engine.min_sample_value(Direction::Output, 0).unwrap(), -1.0);
    assert!(engine.format_string().unwrap().contains("32 bit integer"));
}

#[test]
fn processed_capture_routing_reaches_the_done_path() {
    let probe = Arc::new(Probe::default());
    let doubling = TestClient {
        probe: probe.clone(),
        process_fn: Box::new(|capture, playback, _queued, _preloading| {
            for ch in 0..capture.channels() {
                for sample in capture.channel_mut(ch).iter_mut() {
                    *sample *= 2.0;
                }
            }
            playback.copy_from(capture).unwrap();
        }),
    };
    let mut cfg = config(64, 4, 8);
    cfg.capture_done_processed = true;
    let (mut engine, handle) = make_engine(&cfg, doubling);

    engine.start().unwrap();
    handle.feed_input(&capture_block(1, 2, 64));
    handle.pump();

    assert!(wait_until(Duration::from_secs(2), || {
        probe.done_calls.load(Ordering::SeqCst) >= 1
    }));
    // The done path saw the doubled (processed) capture, not the raw one.
    let expected = 2.0 * capture_block(1, 2, 64).channel(0)[0];
    assert_eq!(*probe.first_done_capture.lock().unwrap(), Some(expected));

    engine.stop_and_wait(true);
}

#[test]
fn client_panic_is_fatal_but_contained() {
    let probe = Arc::new(Probe::default());
    let mut calls = 0usize;
    let panicking = TestClient {
        probe: probe.clone(),
        process_fn: Box::new(move |capture, playback, _queued, preloading| {
            calls += 1;
            if !preloading && calls > 4 {
                panic!("client bug");
            }
            playback.copy_from(capture).unwrap();
        }),
    };
    let (mut engine, handle) = make_engine(&config(64, 4, 0), panicking);

    engine.start().unwrap();
    handle.feed_input(&capture_block(1, 2, 64));
    handle.pump();

    // The panic is caught, reported, and triggers an asynchronous stop.
    assert!(wait_until(Duration::from_secs(2), || {
        probe.fatals.load(Ordering::SeqCst) >= 1
    }));
    assert!(engine.fatal_error().is_some());
    assert!(wait_until(Duration::from_secs(2), || {
        engine.state() == EngineState::Prepared
    }));
}
