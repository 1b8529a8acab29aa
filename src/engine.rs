//! Host wrapper around a sound driver.
//!
//! Owns the engine state machine, the exchanger, and four helper threads:
//!
//! * the **callback thread** dispatches deferred notifications (fatal
//!   errors, xruns) so they never run on the driver's realtime thread,
//!   and doubles as the watchdog that detects a driver which stopped
//!   calling back;
//! * the **stop thread** runs the asynchronous stop protocol: some
//!   devices replay the last buffers of a stopped device, so the wrapper
//!   keeps the device running for a configurable number of silent
//!   periods before actually stopping it;
//! * the **processing thread** runs the client's `process` callback for
//!   each matched pair of filled capture / empty playback blocks;
//! * the **done thread** feeds already-exchanged blocks to the client's
//!   `on_buffer_done` for visualization or disk recording.
//!
//! Threads are spawned when the engine is created and joined on drop;
//! they are steered entirely through the event fabric in [`crate::sync`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::block::Block;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::exchanger::{Exchanger, ExchangerConfig};
use crate::hw::{
    DriverCallbacks, DriverChannel, DriverChannelMut, DriverRegistry, SampleFormat, SoundDriver,
    convert, latency,
};
use crate::state::{Direction, EngineState, XrunKind};
use crate::sync::{Event, ResetMode, SignalHub, Wait, wait_any};

/// Callbacks the engine raises towards the application.
///
/// `process` must be realtime safe. `on_buffer_play` runs on the driver
/// thread and must not block. `on_buffer_done` runs on the done thread
/// and may do disk I/O. Panics from any callback are caught; they never
/// cross back into an engine thread.
pub trait AudioClient: Send + 'static {
    /// Produce one playback block from one capture block. `queued` is the
    /// number of buffer pairs ready at call time; `preloading` is true
    /// while the playback queue is prefilled before the device starts.
    /// Setting the last-flag on `playback` stops the engine once that
    /// block has reached the device.
    fn process(&mut self, capture: &mut Block, playback: &mut Block, queued: usize, preloading: bool);

    /// The given block is about to be handed to the device.
    fn on_buffer_play(&mut self, _playback: &Block) {}

    /// A capture/playback pair has completed its trip through the device.
    fn on_buffer_done(&mut self, _capture: &Block, _playback: &Block, _backlog: usize) {}

    fn on_state_change(&mut self, _state: EngineState) {}

    fn on_xrun(&mut self, _kind: XrunKind) {}

    fn on_fatal_error(&mut self, _message: &str) {}

    /// The driver stopped invoking its bufferswitch callback.
    fn on_hang(&mut self) {}

    fn on_warning(&mut self, _message: &str) {}

    fn on_done_loop_stopped(&mut self) {}

    fn on_rate_change(&mut self, _rate: f64) {}
}

/// Snapshot of the engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub driver_bufferswitches: usize,
    pub proc_bufferswitches: usize,
    pub xruns_proc: usize,
    pub xruns_done: usize,
    pub xruns_rt: usize,
    pub watchdog_wakeups: usize,
    pub stop_timeouts_waited: usize,
    /// Done-queue blocks discarded at stop because the done loop was no
    /// longer draining them.
    pub done_blocks_discarded: usize,
}

/// Per-role event sets. The first event of every role is the shared
/// manual-reset quit; the rest are auto-reset and ordered most-important
/// first, which `wait_any` relies on.
struct Events {
    cb_quit: Event,
    proc_error: Event,
    done_error: Event,
    xrun_proc: Event,
    xrun_done: Event,
    xrun_rt: Event,
    observe: Event,

    stop_quit: Event,
    stop_begin: Event,
    stop_continue: Event,

    proc_quit: Event,
    proc_start: Event,
    proc_stop: Event,

    done_quit: Event,
    done_start: Event,
    done_stop: Event,

    /// Set while no stop procedure is pending completion.
    stopped: Event,
}

impl Events {
    fn new(hub: &Arc<SignalHub>) -> Events {
        let auto = |hub| Event::new(hub, ResetMode::Auto);
        let manual = |hub| Event::new(hub, ResetMode::Manual);
        Events {
            cb_quit: manual(hub),
            proc_error: auto(hub),
            done_error: auto(hub),
            xrun_proc: auto(hub),
            xrun_done: auto(hub),
            xrun_rt: auto(hub),
            observe: auto(hub),
            stop_quit: manual(hub),
            stop_begin: auto(hub),
            stop_continue: auto(hub),
            proc_quit: manual(hub),
            proc_start: auto(hub),
            proc_stop: auto(hub),
            done_quit: manual(hub),
            done_start: auto(hub),
            done_stop: auto(hub),
            stopped: manual(hub),
        }
    }
}

#[derive(Default)]
struct Counters {
    driver_switches: AtomicUsize,
    proc_switches: AtomicUsize,
    xruns_proc: AtomicUsize,
    xruns_done: AtomicUsize,
    xruns_rt: AtomicUsize,
    watchdog_wakeups: AtomicUsize,
    stop_timeouts: AtomicUsize,
}

/// Channel bookkeeping captured at prepare time.
struct PreparedInfo {
    frames: usize,
    input_indices: Vec<usize>,
    output_indices: Vec<usize>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    input_formats: Vec<SampleFormat>,
    output_formats: Vec<SampleFormat>,
    input_max: Vec<f32>,
    input_min: Vec<f32>,
    output_max: Vec<f32>,
    output_min: Vec<f32>,
    proc_queue_depth: usize,
    stop_timeout: Duration,
}

struct Shared {
    hub: Arc<SignalHub>,
    events: Events,
    counters: Counters,
    state: AtomicU8,
    stopping: AtomicBool,
    stop_smooth: AtomicBool,
    rt_busy: AtomicBool,
    done_loop_active: AtomicBool,
    done_waits_when_empty: AtomicBool,
    stop_switches: AtomicUsize,
    watchdog_timeout_ms: AtomicU64,
    client: Mutex<Box<dyn AudioClient>>,
    driver: Mutex<Option<Box<dyn SoundDriver>>>,
    exchanger: Mutex<Option<Arc<Exchanger>>>,
    prepared: Mutex<Option<Arc<PreparedInfo>>>,
    fatal_error: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
        self.guarded_client(|client| client.on_state_change(state));
        // Let the callback thread recompute its watchdog timeout.
        self.events.observe.set();
    }

    /// Run a client callback under the engine lock, isolating panics.
    fn guarded_client<R>(&self, f: impl FnOnce(&mut dyn AudioClient) -> R) -> Option<R> {
        let mut client = self.client.lock().expect("client lock poisoned");
        match catch_unwind(AssertUnwindSafe(|| f(client.as_mut()))) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("client callback panicked; discarded");
                None
            }
        }
    }

    fn signal_xrun(&self, kind: XrunKind) {
        match kind {
            XrunKind::Proc => {
                self.counters.xruns_proc.fetch_add(1, Ordering::Relaxed);
                self.events.xrun_proc.set();
            }
            XrunKind::Done => {
                self.counters.xruns_done.fetch_add(1, Ordering::Relaxed);
                self.events.xrun_done.set();
            }
            XrunKind::Rt => {
                self.counters.xruns_rt.fetch_add(1, Ordering::Relaxed);
                self.events.xrun_rt.set();
            }
        }
    }

    fn warn_client(&self, message: &str) {
        warn!("{message}");
        self.guarded_client(|client| client.on_warning(message));
    }

    fn current_exchanger(&self) -> Option<Arc<Exchanger>> {
        self.exchanger.lock().expect("exchanger lock poisoned").clone()
    }

    fn current_prepared(&self) -> Option<Arc<PreparedInfo>> {
        self.prepared.lock().expect("prepared lock poisoned").clone()
    }

    fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms.load(Ordering::Relaxed))
    }

    /// Counter the watchdog observes. In realtime mode there is no
    /// processing thread, so driver bufferswitches stand in.
    fn watched_switches(&self) -> usize {
        let realtime = self
            .current_exchanger()
            .map(|exchanger| exchanger.is_realtime())
            .unwrap_or(false);
        if realtime {
            self.counters.driver_switches.load(Ordering::Relaxed)
        } else {
            self.counters.proc_switches.load(Ordering::Relaxed)
        }
    }

    fn counters_snapshot(&self) -> EngineCounters {
        EngineCounters {
            driver_bufferswitches: self.counters.driver_switches.load(Ordering::Relaxed),
            proc_bufferswitches: self.counters.proc_switches.load(Ordering::Relaxed),
            xruns_proc: self.counters.xruns_proc.load(Ordering::Relaxed),
            xruns_done: self.counters.xruns_done.load(Ordering::Relaxed),
            xruns_rt: self.counters.xruns_rt.load(Ordering::Relaxed),
            watchdog_wakeups: self.counters.watchdog_wakeups.load(Ordering::Relaxed),
            stop_timeouts_waited: self.counters.stop_timeouts.load(Ordering::Relaxed),
            done_blocks_discarded: self
                .current_exchanger()
                .map(|exchanger| exchanger.discarded_done_blocks())
                .unwrap_or(0),
        }
    }
}

/// The `DriverCallbacks` glue a prepared driver calls into. Holds its own
/// references to the exchanger and the channel info so the driver thread
/// never has to take the engine's bookkeeping locks.
struct DriverBridge {
    shared: Arc<Shared>,
    exchanger: Arc<Exchanger>,
}

impl DriverBridge {
    fn capture_half(&self, inputs: &[DriverChannel<'_>]) {
        let signal = |kind: XrunKind| self.shared.signal_xrun(kind);
        self.exchanger.handle_capture(
            |scratch| {
                for (channel, input) in inputs.iter().enumerate().take(scratch.channels()) {
                    convert::to_float(input.bytes, input.format, scratch.channel_mut(channel));
                }
            },
            &signal,
        );
    }

    fn playback_half(&self, outputs: &mut [DriverChannelMut<'_>]) {
        let signal = |kind: XrunKind| self.shared.signal_xrun(kind);
        let shared = &self.shared;
        let is_last = self.exchanger.handle_playback(&signal, &mut |block| {
            shared.guarded_client(|client| client.on_buffer_play(block));
            for (channel, output) in outputs.iter_mut().enumerate().take(block.channels()) {
                convert::from_float(block.channel(channel), output.format, output.bytes);
            }
        });
        if is_last && shared.state() == EngineState::Running {
            shared.stop_smooth.store(true, Ordering::Release);
            shared.events.stop_begin.set();
        }
    }

    /// Realtime mode: capture conversion, client processing and playback
    /// dispatch all happen inside the driver callback. A single-entry
    /// guard detects the previous callback still being in flight.
    fn realtime_switch(
        &self,
        inputs: &[DriverChannel<'_>],
        outputs: &mut [DriverChannelMut<'_>],
    ) {
        let shared = &self.shared;
        if shared
            .rt_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Overlap with the previous period: a realtime xrun, except
            // while stopping, where overlaps do not count.
            if !shared.stopping.load(Ordering::Acquire) {
                shared.signal_xrun(XrunKind::Rt);
            }
            return;
        }

        self.capture_half(inputs);

        let queued = self.exchanger.proc_pending();
        if queued > 0 {
            let capture = self.exchanger.proc_capture().read_slot();
            let playback = self.exchanger.proc_playback().write_slot();
            match (capture, playback) {
                (Ok(mut capture), Ok(mut playback)) => {
                    let completed = shared
                        .guarded_client(|client| {
                            client.process(&mut capture, &mut playback, queued, false)
                        })
                        .is_some();
                    if !completed {
                        playback.clear();
                        shared.events.proc_error.set();
                    }
                    let signal = |kind: XrunKind| shared.signal_xrun(kind);
                    self.exchanger.route_processed_capture(&capture, &signal);
                    capture.commit();
                    playback.commit();
                }
                _ => shared.events.proc_error.set(),
            }
        }

        self.playback_half(outputs);
        shared.rt_busy.store(false, Ordering::Release);
    }
}

impl DriverCallbacks for DriverBridge {
    fn buffer_switch(
        &self,
        inputs: &[DriverChannel<'_>],
        outputs: &mut [DriverChannelMut<'_>],
        _process_now: bool,
    ) {
        self.shared
            .counters
            .driver_switches
            .fetch_add(1, Ordering::Relaxed);

        if self.shared.stopping.load(Ordering::Acquire) {
            // Tail silence: whatever was queued, the device only sees
            // zeros from here until it is actually stopped.
            for output in outputs.iter_mut() {
                output.bytes.fill(0);
            }
            self.shared.events.stop_continue.set();
            return;
        }

        if self.exchanger.is_realtime() {
            self.realtime_switch(inputs, outputs);
        } else {
            self.capture_half(inputs);
            self.playback_half(outputs);
        }
    }

    fn sample_rate_changed(&self, rate: f64) {
        self.shared.guarded_client(|client| client.on_rate_change(rate));
    }

    fn reset_request(&self) {
        self.shared.warn_client("driver requested a reset");
    }

    fn buffer_size_changed(&self) {
        self.shared.warn_client("driver reports a changed buffer size");
    }
}

/// The audio engine. One driver at a time; control operations are meant
/// to be issued from a single control thread, observers are safe from
/// anywhere (see [`Engine::observer`]).
pub struct Engine {
    shared: Arc<Shared>,
    registry: DriverRegistry,
    threads: Vec<JoinHandle<()>>,
}

/// Cheap cloneable read-only view of a running engine, for threads that
/// must not touch the control path.
#[derive(Clone)]
pub struct EngineObserver {
    shared: Arc<Shared>,
}

impl EngineObserver {
    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state() == EngineState::Running
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> EngineCounters {
        self.shared.counters_snapshot()
    }

    pub fn xruns(&self, kind: XrunKind) -> usize {
        let counters = self.shared.counters_snapshot();
        match kind {
            XrunKind::Proc => counters.xruns_proc,
            XrunKind::Done => counters.xruns_done,
            XrunKind::Rt => counters.xruns_rt,
        }
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal_error.lock().expect("fatal lock poisoned").clone()
    }

    /// Block until a pending stop procedure has completed.
    pub fn wait_stopped(&self) {
        self.shared.events.stopped.wait();
    }
}

impl Engine {
    pub fn new(client: Box<dyn AudioClient>) -> Engine {
        Engine::with_registry(client, DriverRegistry::default())
    }

    pub fn with_registry(client: Box<dyn AudioClient>, registry: DriverRegistry) -> Engine {
        let hub = SignalHub::new();
        let shared = Arc::new(Shared {
            events: Events::new(&hub),
            hub,
            counters: Counters::default(),
            state: AtomicU8::new(EngineState::Free as u8),
            stopping: AtomicBool::new(false),
            stop_smooth: AtomicBool::new(true),
            rt_busy: AtomicBool::new(false),
            done_loop_active: AtomicBool::new(false),
            done_waits_when_empty: AtomicBool::new(true),
            stop_switches: AtomicUsize::new(4),
            watchdog_timeout_ms: AtomicU64::new(500),
            client: Mutex::new(client),
            driver: Mutex::new(None),
            exchanger: Mutex::new(None),
            prepared: Mutex::new(None),
            fatal_error: Mutex::new(None),
        });
        shared.events.stopped.set();

        let spawn = |name: &str, body: fn(Arc<Shared>)| {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(name.into())
                .spawn(move || body(shared))
                .expect("failed to spawn engine thread")
        };
        let threads = vec![
            spawn("engine-callback", callback_main),
            spawn("engine-stop", stop_main),
            spawn("engine-proc", proc_main),
            spawn("engine-done", done_main),
        ];

        Engine {
            shared,
            registry,
            threads,
        }
    }

    pub fn observer(&self) -> EngineObserver {
        EngineObserver {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state() == EngineState::Running
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> EngineCounters {
        self.shared.counters_snapshot()
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal_error.lock().expect("fatal lock poisoned").clone()
    }

    /// Names of the loadable drivers, in registry order.
    pub fn driver_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn load_by_index(&mut self, index: usize) -> EngineResult<()> {
        let driver = self.registry.create_by_index(index)?;
        self.install_driver(driver)
    }

    pub fn load_by_name(&mut self, name: &str) -> EngineResult<()> {
        let driver = self.registry.create_by_name(name)?;
        self.install_driver(driver)
    }

    /// Hand a driver instance straight to the engine, bypassing the
    /// registry. Used with in-process drivers such as [`crate::hw::dummy`].
    pub fn load_driver(&mut self, driver: Box<dyn SoundDriver>) -> EngineResult<()> {
        self.install_driver(driver)
    }

    fn install_driver(&mut self, driver: Box<dyn SoundDriver>) -> EngineResult<()> {
        // Only one driver at a time: a loaded driver is torn down first.
        self.unload();
        *self.shared.driver.lock().expect("driver lock poisoned") = Some(driver);
        self.shared.set_state(EngineState::Loaded);
        // Drivers arrive from their factory already initialized.
        self.shared.set_state(EngineState::Initialized);
        Ok(())
    }

    /// Validate the configuration, allocate the exchanger and prepare the
    /// driver's buffers. On failure nothing is allocated and the state is
    /// unchanged.
    pub fn init(&mut self, config: &EngineConfig) -> EngineResult<()> {
        let state = self.shared.state();
        if state != EngineState::Initialized {
            return Err(EngineError::InvalidState {
                op: "init",
                required: EngineState::Initialized,
                current: state,
            });
        }
        let mut driver_guard = self.shared.driver.lock().expect("driver lock poisoned");
        let driver = driver_guard
            .as_mut()
            .expect("state Initialized without driver");

        let input_indices = EngineConfig::active_indices(&config.input_channels);
        let output_indices = EngineConfig::active_indices(&config.output_channels);
        let hardware_in = driver.channels(Direction::Input)?;
        let hardware_out = driver.channels(Direction::Output)?;
        if input_indices.iter().any(|&i| i >= hardware_in) {
            return Err(EngineError::Unsupported(format!(
                "input mask selects a channel beyond the {hardware_in} available"
            )));
        }
        if output_indices.iter().any(|&i| i >= hardware_out) {
            return Err(EngineError::Unsupported(format!(
                "output mask selects a channel beyond the {hardware_out} available"
            )));
        }

        if let Some(rate) = config.sample_rate {
            if !driver.can_sample_rate(rate)? {
                return Err(EngineError::Unsupported(format!(
                    "sample rate {rate} not supported by '{}'",
                    driver.name()
                )));
            }
            driver.set_sample_rate(rate)?;
        }
        let rate = driver.sample_rate()?;

        let sizes = driver.buffer_sizes()?;
        let frames = config.buffer_frames.unwrap_or(sizes.preferred);
        if !sizes.supports(frames) {
            return Err(EngineError::Unsupported(format!(
                "buffer size {frames} not supported (min {}, max {}, granularity {})",
                sizes.min, sizes.max, sizes.granularity
            )));
        }
        let stop_timeout = compute_stop_timeout(frames, rate, Duration::from_millis(5))?;

        let mut input_names = Vec::with_capacity(input_indices.len());
        let mut input_formats = Vec::with_capacity(input_indices.len());
        for &index in &input_indices {
            input_names.push(driver.channel_name(Direction::Input, index)?);
            input_formats.push(driver.channel_format(Direction::Input, index)?);
        }
        let mut output_names = Vec::with_capacity(output_indices.len());
        let mut output_formats = Vec::with_capacity(output_indices.len());
        for &index in &output_indices {
            output_names.push(driver.channel_name(Direction::Output, index)?);
            output_formats.push(driver.channel_format(Direction::Output, index)?);
        }

        let exchanger = Arc::new(Exchanger::new(
            &ExchangerConfig {
                capture_channels: input_indices.len(),
                playback_channels: output_indices.len(),
                frames,
                proc_queue_depth: config.proc_queue_depth,
                done_queue_depth: config.done_queue_depth,
                capture_done_processed: config.capture_done_processed,
            },
            &self.shared.hub,
        )?);
        let prepared = Arc::new(PreparedInfo {
            frames,
            input_max: input_formats.iter().map(|&f| convert::max_sample_value(f)).collect(),
            input_min: input_formats.iter().map(|&f| convert::min_sample_value(f)).collect(),
            output_max: output_formats.iter().map(|&f| convert::max_sample_value(f)).collect(),
            output_min: output_formats.iter().map(|&f| convert::min_sample_value(f)).collect(),
            input_indices,
            output_indices,
            input_names,
            output_names,
            input_formats,
            output_formats,
            proc_queue_depth: config.proc_queue_depth,
            stop_timeout,
        });

        let bridge = Arc::new(DriverBridge {
            shared: self.shared.clone(),
            exchanger: exchanger.clone(),
        });
        driver.create_buffers(
            &prepared.input_indices,
            &prepared.output_indices,
            frames,
            bridge,
        )?;
        drop(driver_guard);

        *self.shared.exchanger.lock().expect("exchanger lock poisoned") = Some(exchanger);
        *self.shared.prepared.lock().expect("prepared lock poisoned") = Some(prepared);
        self.shared
            .stop_switches
            .store(config.stop_switches.max(1), Ordering::Relaxed);
        self.shared
            .watchdog_timeout_ms
            .store(config.watchdog_timeout_ms.max(1), Ordering::Relaxed);
        self.shared.rt_busy.store(false, Ordering::Release);
        self.shared.set_state(EngineState::Prepared);
        Ok(())
    }

    /// Prefill the playback queue, start the worker loops and the driver.
    pub fn start(&mut self) -> EngineResult<()> {
        let state = self.shared.state();
        if state != EngineState::Prepared {
            return Err(EngineError::InvalidState {
                op: "start",
                required: EngineState::Prepared,
                current: state,
            });
        }
        let exchanger = self
            .shared
            .current_exchanger()
            .expect("state Prepared without exchanger");
        let prepared = self
            .shared
            .current_prepared()
            .expect("state Prepared without channel info");

        self.shared.stopping.store(false, Ordering::Release);
        self.shared.done_waits_when_empty.store(true, Ordering::Release);

        if !exchanger.is_realtime() {
            self.prefill(&exchanger, &prepared)?;
        }

        let events = &self.shared.events;
        events.proc_stop.reset();
        events.done_stop.reset();
        if !exchanger.is_realtime() {
            events.proc_start.set();
        }
        events.done_start.set();
        self.shared.set_state(EngineState::Running);

        let switches_before = self.shared.counters.driver_switches.load(Ordering::Relaxed);
        let started = {
            let mut driver = self.shared.driver.lock().expect("driver lock poisoned");
            driver
                .as_mut()
                .expect("state Prepared without driver")
                .start()
        };
        if let Err(e) = started {
            self.shared.set_state(EngineState::Prepared);
            events.proc_stop.set();
            events.done_stop.set();
            let shared = self.shared.clone();
            exchanger.clear_queues(&|| shared.done_loop_active.load(Ordering::Acquire));
            return Err(e);
        }
        events.stopped.reset();

        // Give the driver a moment to deliver its first period; purely
        // diagnostic, manual drivers are pumped after start() returns.
        let rate = self.sample_rate().unwrap_or(48_000.0).max(1000.0);
        let period = Duration::from_secs_f64(prepared.frames as f64 / rate);
        let deadline = Instant::now() + 2 * period;
        while Instant::now() < deadline {
            if self.shared.counters.driver_switches.load(Ordering::Relaxed) != switches_before {
                return Ok(());
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        debug!("driver delivered no bufferswitch within two periods of start");
        Ok(())
    }

    fn prefill(&self, exchanger: &Exchanger, prepared: &PreparedInfo) -> EngineResult<()> {
        let mut capture = Block::new(prepared.input_indices.len(), prepared.frames);
        let mut playback = Block::new(prepared.output_indices.len(), prepared.frames);
        while exchanger.proc_playback().empty_count() > 0 && !playback.is_last() {
            capture.clear();
            playback.clear();
            let completed = self
                .shared
                .guarded_client(|client| client.process(&mut capture, &mut playback, 0, true))
                .is_some();
            if !completed {
                self.shared.events.proc_error.set();
                return Err(EngineError::Driver(
                    "processing callback failed during prefill".into(),
                ));
            }
            exchanger.prefill_one(&playback)?;
        }
        Ok(())
    }

    /// Request a stop. Never blocks: the stop thread silences the device
    /// for the configured number of periods (when `smooth`), stops the
    /// driver, drains the done path and moves the state back to
    /// `Prepared`.
    pub fn stop(&mut self, smooth: bool) {
        if self.shared.state() == EngineState::Running {
            self.shared.stop_smooth.store(smooth, Ordering::Release);
            self.shared.events.stop_begin.set();
        }
    }

    /// [`Engine::stop`] followed by a wait for the stop to complete.
    /// `smooth` selects between the tail-silence protocol and an abrupt
    /// stop, exactly as in [`Engine::stop`].
    pub fn stop_and_wait(&mut self, smooth: bool) {
        self.stop(smooth);
        self.shared.events.stopped.wait();
    }

    /// Release the exchanger and the driver's buffers.
    pub fn dispose_buffers(&mut self) -> EngineResult<()> {
        let state = self.shared.state();
        if state < EngineState::Prepared {
            return Err(EngineError::InvalidState {
                op: "dispose_buffers",
                required: EngineState::Prepared,
                current: state,
            });
        }
        if state == EngineState::Running {
            self.stop_and_wait(true);
        }
        {
            let mut driver = self.shared.driver.lock().expect("driver lock poisoned");
            if let Some(driver) = driver.as_mut() {
                if let Err(e) = driver.dispose_buffers() {
                    // Cleanup must not fail; report and carry on.
                    self.shared
                        .warn_client(&format!("dispose_buffers: driver reported: {e}"));
                }
            }
        }
        *self.shared.exchanger.lock().expect("exchanger lock poisoned") = None;
        *self.shared.prepared.lock().expect("prepared lock poisoned") = None;
        self.shared.set_state(EngineState::Initialized);
        Ok(())
    }

    /// Cascade stop, dispose and unload. Never fails; anomalies are
    /// reported through `on_warning`.
    pub fn unload(&mut self) {
        if self.shared.state() == EngineState::Running {
            self.stop_and_wait(true);
        }
        if self.shared.state() >= EngineState::Prepared {
            if let Err(e) = self.dispose_buffers() {
                self.shared.warn_client(&format!("unload: {e}"));
            }
        }
        if self.shared.state() >= EngineState::Loaded {
            *self.shared.driver.lock().expect("driver lock poisoned") = None;
            self.shared.set_state(EngineState::Free);
        }
    }

    pub fn set_sample_rate(&mut self, rate: f64) -> EngineResult<()> {
        let state = self.shared.state();
        if state == EngineState::Running {
            return Err(EngineError::InvalidState {
                op: "set_sample_rate",
                required: EngineState::Prepared,
                current: state,
            });
        }
        if state < EngineState::Initialized {
            return Err(EngineError::InvalidState {
                op: "set_sample_rate",
                required: EngineState::Initialized,
                current: state,
            });
        }
        let mut driver = self.shared.driver.lock().expect("driver lock poisoned");
        driver
            .as_mut()
            .expect("state Initialized without driver")
            .set_sample_rate(rate)
    }

    pub fn sample_rate(&self) -> EngineResult<f64> {
        let driver = self.shared.driver.lock().expect("driver lock poisoned");
        match driver.as_ref() {
            Some(driver) => driver.sample_rate(),
            None => Err(EngineError::InvalidState {
                op: "sample_rate",
                required: EngineState::Loaded,
                current: EngineState::Free,
            }),
        }
    }

    /// Frames per period of the prepared buffers.
    pub fn buffer_frames(&self) -> Option<usize> {
        self.shared.current_prepared().map(|prepared| prepared.frames)
    }

    /// Total latency of one direction in frames, device plus queueing.
    pub fn latency(&self, direction: Direction) -> EngineResult<usize> {
        let prepared = self.require_prepared("latency")?;
        let device = {
            let driver = self.shared.driver.lock().expect("driver lock poisoned");
            driver
                .as_ref()
                .expect("state Prepared without driver")
                .latency(direction)?
        };
        Ok(latency::latency_frames(
            direction,
            device,
            prepared.frames,
            prepared.proc_queue_depth,
        ))
    }

    pub fn active_channels(&self, direction: Direction) -> usize {
        self.shared
            .current_prepared()
            .map(|prepared| match direction {
                Direction::Input => prepared.input_indices.len(),
                Direction::Output => prepared.output_indices.len(),
            })
            .unwrap_or(0)
    }

    pub fn active_channel_name(&self, direction: Direction, index: usize) -> EngineResult<String> {
        let prepared = self.require_prepared("active_channel_name")?;
        let names = match direction {
            Direction::Input => &prepared.input_names,
            Direction::Output => &prepared.output_names,
        };
        names
            .get(index)
            .cloned()
            .ok_or_else(|| EngineError::Unsupported(format!("no active channel {index}")))
    }

    pub fn active_channel_format(
        &self,
        direction: Direction,
        index: usize,
    ) -> EngineResult<SampleFormat> {
        let prepared = self.require_prepared("active_channel_format")?;
        let formats = match direction {
            Direction::Input => &prepared.input_formats,
            Direction::Output => &prepared.output_formats,
        };
        formats
            .get(index)
            .copied()
            .ok_or_else(|| EngineError::Unsupported(format!("no active channel {index}")))
    }

    /// Largest float sample the channel's native format reproduces; the
    /// round trip of +1.0. Exceeding it means the hardware clips.
    pub fn max_sample_value(&self, direction: Direction, index: usize) -> EngineResult<f32> {
        let prepared = self.require_prepared("max_sample_value")?;
        let values = match direction {
            Direction::Input => &prepared.input_max,
            Direction::Output => &prepared.output_max,
        };
        values
            .get(index)
            .copied()
            .ok_or_else(|| EngineError::Unsupported(format!("no active channel {index}")))
    }

    pub fn min_sample_value(&self, direction: Direction, index: usize) -> EngineResult<f32> {
        let prepared = self.require_prepared("min_sample_value")?;
        let values = match direction {
            Direction::Input => &prepared.input_min,
            Direction::Output => &prepared.output_min,
        };
        values
            .get(index)
            .copied()
            .ok_or_else(|| EngineError::Unsupported(format!("no active channel {index}")))
    }

    /// One-line description of the active channel formats.
    pub fn format_string(&self) -> EngineResult<String> {
        let prepared = self.require_prepared("format_string")?;
        let describe = |formats: &[SampleFormat]| match formats.first() {
            Some(first) => first.describe().to_string(),
            None => "none".to_string(),
        };
        Ok(format!(
            "{} in @ {} / {} out @ {}",
            prepared.input_indices.len(),
            describe(&prepared.input_formats),
            prepared.output_indices.len(),
            describe(&prepared.output_formats),
        ))
    }

    /// Divert the done-capture queue to the processed capture data. Takes
    /// effect on the next period.
    pub fn set_capture_done_processed(&mut self, enabled: bool) -> EngineResult<()> {
        let exchanger = self
            .shared
            .current_exchanger()
            .ok_or(EngineError::InvalidState {
                op: "set_capture_done_processed",
                required: EngineState::Prepared,
                current: self.shared.state(),
            })?;
        exchanger.set_capture_done_processed(enabled);
        Ok(())
    }

    pub fn set_watchdog_timeout(&mut self, timeout: Duration) {
        self.shared
            .watchdog_timeout_ms
            .store(timeout.as_millis().max(1) as u64, Ordering::Relaxed);
    }

    fn require_prepared(&self, op: &'static str) -> EngineResult<Arc<PreparedInfo>> {
        self.shared
            .current_prepared()
            .ok_or(EngineError::InvalidState {
                op,
                required: EngineState::Prepared,
                current: self.shared.state(),
            })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.unload();
        let events = &self.shared.events;
        events.cb_quit.set();
        events.stop_quit.set();
        events.proc_quit.set();
        events.done_quit.set();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn compute_stop_timeout(frames: usize, rate: f64, slack: Duration) -> EngineResult<Duration> {
    if rate < 1000.0 {
        return Err(EngineError::Unsupported(
            "sample rates below 1 kHz are not supported".into(),
        ));
    }
    let millis = (frames as f64 * 1000.0 / rate).ceil();
    if !millis.is_finite() || millis > 3_600_000.0 {
        return Err(EngineError::Unsupported(
            "stop timeout overflows a sane range".into(),
        ));
    }
    Ok(Duration::from_millis(millis as u64) + slack)
}

// ---------------------------------------------------------------------------
// Thread main loops
// ---------------------------------------------------------------------------

/// Callback thread: deferred notification dispatch plus driver watchdog.
fn callback_main(shared: Arc<Shared>) {
    loop {
        let events = &shared.events;
        let running = shared.state() == EngineState::Running;
        let switches_before = shared.watched_switches();
        let timeout = running.then(|| shared.watchdog_timeout());
        let outcome = wait_any(
            &[
                &events.cb_quit,
                &events.proc_error,
                &events.done_error,
                &events.xrun_proc,
                &events.xrun_done,
                &events.xrun_rt,
                &events.observe,
            ],
            timeout,
        );
        match outcome {
            Wait::Event(0) => return,
            Wait::Timeout => {
                shared.counters.watchdog_wakeups.fetch_add(1, Ordering::Relaxed);
                if shared.state() == EngineState::Running
                    && shared.watched_switches() == switches_before
                {
                    shared.guarded_client(|client| client.on_hang());
                }
            }
            Wait::Event(index @ (1 | 2)) => {
                let message = if index == 1 {
                    "unexpected failure in the processing thread"
                } else {
                    "unexpected failure in the done thread"
                };
                *shared.fatal_error.lock().expect("fatal lock poisoned") =
                    Some(message.to_string());
                shared.guarded_client(|client| client.on_fatal_error(message));
                // Fatal conditions trigger an asynchronous stop.
                if shared.state() == EngineState::Running {
                    shared.stop_smooth.store(true, Ordering::Release);
                    shared.events.stop_begin.set();
                }
            }
            Wait::Event(index @ (3 | 4 | 5)) => {
                let kind = match index {
                    3 => XrunKind::Proc,
                    4 => XrunKind::Done,
                    _ => XrunKind::Rt,
                };
                shared.guarded_client(|client| client.on_xrun(kind));
            }
            Wait::Event(_) => {
                // observe: loop around and recompute the watchdog timeout.
            }
        }
    }
}

/// Stop thread: owns the tail-silence protocol and the transition back to
/// `Prepared`.
fn stop_main(shared: Arc<Shared>) {
    let mut switches_waited = 0usize;
    let mut target_switches = 0usize;
    loop {
        let events = &shared.events;
        let stopping = shared.stopping.load(Ordering::Acquire)
            && shared.state() == EngineState::Running;
        // While stopping, never wait longer than one period plus slack:
        // a wedged driver must not be able to prevent shutdown.
        let timeout = if stopping {
            shared
                .current_prepared()
                .map(|prepared| prepared.stop_timeout)
        } else {
            None
        };
        match wait_any(
            &[&events.stop_quit, &events.stop_begin, &events.stop_continue],
            timeout,
        ) {
            Wait::Event(0) => return,
            Wait::Event(1) => {
                if shared.state() == EngineState::Running
                    && !shared.stopping.load(Ordering::Acquire)
                {
                    shared.stopping.store(true, Ordering::Release);
                    switches_waited = 0;
                    target_switches = if shared.stop_smooth.load(Ordering::Acquire) {
                        shared.stop_switches.load(Ordering::Relaxed)
                    } else {
                        0
                    };
                    events.proc_stop.set();
                    // DONE_STOP is deferred to the end of the procedure:
                    // the last bufferswitch may still produce done data.
                    if target_switches == 0 {
                        finish_stop(&shared);
                    }
                }
            }
            Wait::Timeout => {
                // The bufferswitch did not come; count it as progress so a
                // dead driver still stops.
                shared.counters.stop_timeouts.fetch_add(1, Ordering::Relaxed);
                if shared.state() == EngineState::Running && shared.stopping.load(Ordering::Acquire)
                {
                    switches_waited += 1;
                    if switches_waited >= target_switches {
                        finish_stop(&shared);
                    }
                }
            }
            Wait::Event(2) => {
                if shared.state() == EngineState::Running && shared.stopping.load(Ordering::Acquire)
                {
                    switches_waited += 1;
                    if switches_waited >= target_switches {
                        finish_stop(&shared);
                    }
                }
            }
            Wait::Event(_) => {}
        }
    }
}

fn finish_stop(shared: &Arc<Shared>) {
    {
        let mut driver = shared.driver.lock().expect("driver lock poisoned");
        if let Some(driver) = driver.as_mut() {
            if let Err(e) = driver.stop() {
                // Stopping should always succeed; degrade to a warning.
                shared.warn_client(&format!("driver stop reported: {e}"));
            }
        }
    }
    // The done thread is still waiting for more data; tell it none comes.
    shared.events.done_stop.set();

    // In the unlikely case a `process` call is still executing, wait for
    // it to leave the engine lock before discarding queue contents. The
    // lock is released again immediately so the done thread can drain.
    drop(shared.client.lock().expect("client lock poisoned"));

    if let Some(exchanger) = shared.current_exchanger() {
        let shared = shared.clone();
        exchanger.clear_queues(&move || shared.done_loop_active.load(Ordering::Acquire));
    }
    shared.set_state(EngineState::Prepared);
    shared.stopping.store(false, Ordering::Release);
    shared.events.stopped.set();
}

/// Processing thread: time-critical while a run is active.
fn proc_main(shared: Arc<Shared>) {
    loop {
        let events = &shared.events;
        match wait_any(&[&events.proc_quit, &events.proc_start], None) {
            Wait::Event(0) => return,
            Wait::Event(_) => {
                if let Err(e) = set_time_critical("engine-proc") {
                    shared.warn_client(&format!("processing thread priority not raised: {e}"));
                }
                proc_loop(&shared);
                clear_time_critical();
            }
            Wait::Timeout => {}
        }
    }
}

fn proc_loop(shared: &Arc<Shared>) {
    let Some(exchanger) = shared.current_exchanger() else {
        return;
    };
    loop {
        let events = &shared.events;
        if events.proc_quit.is_set() || events.proc_stop.try_consume() {
            return;
        }
        let mut queued = exchanger.proc_pending();
        if queued == 0 {
            queued = wait_for_proc(shared, &exchanger);
            if queued == 0 {
                // Quit or stop was signalled while waiting.
                return;
            }
        }
        {
            let mut client = shared.client.lock().expect("client lock poisoned");
            let capture = exchanger.proc_capture().read_slot();
            let playback = exchanger.proc_playback().write_slot();
            match (capture, playback) {
                (Ok(mut capture), Ok(mut playback)) => {
                    let completed = catch_unwind(AssertUnwindSafe(|| {
                        client.process(&mut capture, &mut playback, queued, false)
                    }))
                    .is_ok();
                    if !completed {
                        playback.clear();
                        events.proc_error.set();
                    }
                    let signal = |kind: XrunKind| shared.signal_xrun(kind);
                    exchanger.route_processed_capture(&capture, &signal);
                    capture.commit();
                    playback.commit();
                }
                _ => {
                    // Should never happen after the pending check.
                    events.proc_error.set();
                }
            }
        }
        shared.counters.proc_switches.fetch_add(1, Ordering::Relaxed);
    }
}

/// Wait until a capture block and playback space are both available, or
/// until quit/stop cancel the run. Capture-data and playback-space arrive
/// as independent events; each wakeup re-checks the joint condition.
fn wait_for_proc(shared: &Arc<Shared>, exchanger: &Exchanger) -> usize {
    let events = &shared.events;
    loop {
        match wait_any(
            &[
                &events.proc_quit,
                exchanger.proc_capture().data_event(),
                exchanger.proc_playback().space_event(),
                &events.proc_stop,
            ],
            None,
        ) {
            Wait::Event(0) | Wait::Event(3) => return 0,
            _ => {
                let queued = exchanger.proc_pending();
                if queued > 0 {
                    return queued;
                }
            }
        }
    }
}

/// Done thread: runs the client's `on_buffer_done` for each pair of done
/// blocks, at normal priority.
fn done_main(shared: Arc<Shared>) {
    loop {
        let events = &shared.events;
        match wait_any(&[&events.done_quit, &events.done_start], None) {
            Wait::Event(0) => return,
            Wait::Event(_) => {
                shared.done_loop_active.store(true, Ordering::Release);
                done_loop(&shared);
                shared.done_loop_active.store(false, Ordering::Release);
                shared.guarded_client(|client| client.on_done_loop_stopped());
            }
            Wait::Timeout => {}
        }
    }
}

fn done_loop(shared: &Arc<Shared>) {
    let Some(exchanger) = shared.current_exchanger() else {
        return;
    };
    if !exchanger.has_done_queue() {
        return;
    }
    loop {
        let events = &shared.events;
        if events.done_quit.is_set() {
            return;
        }
        let mut backlog = exchanger.done_pending();
        if backlog == 0 {
            if !shared.done_waits_when_empty.load(Ordering::Acquire) {
                // The stop protocol announced that no more data comes.
                return;
            }
            backlog = wait_for_done(shared, &exchanger);
            if backlog == 0 {
                return;
            }
        }
        let capture = exchanger.done_capture().expect("done queue vanished").read_slot();
        let playback = exchanger.done_playback().expect("done queue vanished").read_slot();
        match (capture, playback) {
            (Ok(capture), Ok(playback)) => {
                {
                    let mut client = shared.client.lock().expect("client lock poisoned");
                    if catch_unwind(AssertUnwindSafe(|| {
                        client.on_buffer_done(&capture, &playback, backlog)
                    }))
                    .is_err()
                    {
                        events.done_error.set();
                    }
                }
                capture.commit();
                playback.commit();
            }
            _ => {
                events.done_error.set();
                return;
            }
        }
    }
}

fn wait_for_done(shared: &Arc<Shared>, exchanger: &Exchanger) -> usize {
    let events = &shared.events;
    let capture_data = exchanger
        .done_capture()
        .expect("done queue vanished")
        .data_event();
    let playback_data = exchanger
        .done_playback()
        .expect("done queue vanished")
        .data_event();
    loop {
        match wait_any(
            &[&events.done_quit, capture_data, playback_data, &events.done_stop],
            None,
        ) {
            Wait::Event(0) => return 0,
            Wait::Event(3) => {
                // No more data will arrive; drain what is left and leave.
                shared.done_waits_when_empty.store(false, Ordering::Release);
                return exchanger.done_pending();
            }
            _ => {
                let backlog = exchanger.done_pending();
                if backlog > 0 {
                    return backlog;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Thread priority
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn set_time_critical(name: &str) -> Result<(), String> {
    use nix::libc;
    let thread = unsafe { libc::pthread_self() };
    let param = unsafe {
        let mut p = std::mem::zeroed::<libc::sched_param>();
        p.sched_priority = 18;
        p
    };
    let rc = unsafe { libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        return Err(format!(
            "pthread_setschedparam({name}, SCHED_FIFO) failed with errno {rc}"
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_time_critical(_name: &str) -> Result<(), String> {
    Err("realtime thread priority is not supported on this platform".to_string())
}

#[cfg(unix)]
fn clear_time_critical() {
    use nix::libc;
    let thread = unsafe { libc::pthread_self() };
    let param = unsafe { std::mem::zeroed::<libc::sched_param>() };
    unsafe {
        let _ = libc::pthread_setschedparam(thread, libc::SCHED_OTHER, &param);
    }
}

#[cfg(not(unix))]
fn clear_time_critical() {}
