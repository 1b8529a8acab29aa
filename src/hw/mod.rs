//! Driver abstraction: the seam between the engine and a sound backend.
//!
//! A backend implements [`SoundDriver`]; the engine hands it a
//! [`DriverCallbacks`] object at prepare time and from then on the driver
//! pushes periods through `buffer_switch` from its own realtime thread.

pub mod convert;
pub mod dummy;
pub mod format;
pub mod latency;
pub mod timer;

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::state::Direction;
pub use format::SampleFormat;

/// Native-format view of one input channel's current device buffer half.
pub struct DriverChannel<'a> {
    pub format: SampleFormat,
    pub bytes: &'a [u8],
}

/// Native-format view of one output channel's current device buffer half.
pub struct DriverChannelMut<'a> {
    pub format: SampleFormat,
    pub bytes: &'a mut [u8],
}

/// Buffer size capabilities of a driver.
#[derive(Debug, Clone, Copy)]
pub struct BufferSizes {
    pub min: usize,
    pub max: usize,
    pub preferred: usize,
    /// Step between legal sizes; `-1` means powers of two, `0` means only
    /// the preferred size is available.
    pub granularity: i64,
}

impl BufferSizes {
    /// Whether `frames` is a size this driver accepts.
    pub fn supports(&self, frames: usize) -> bool {
        if frames < self.min || frames > self.max {
            return false;
        }
        match self.granularity {
            -1 => frames.is_power_of_two(),
            0 => frames == self.preferred,
            step => (frames - self.min) % (step as usize) == 0,
        }
    }
}

/// Callbacks the driver invokes on the engine. `buffer_switch` runs on the
/// driver's realtime thread once per period; the notification callbacks
/// may run on any driver-owned thread.
pub trait DriverCallbacks: Send + Sync {
    /// One period of sound I/O. `inputs` and `outputs` view the halves of
    /// the driver's double buffers that are safe to touch right now.
    /// `process_now` hints that processing inside this call is safe; the
    /// engine always assumes the worst case and ignores it in buffered
    /// mode.
    fn buffer_switch(
        &self,
        inputs: &[DriverChannel<'_>],
        outputs: &mut [DriverChannelMut<'_>],
        process_now: bool,
    );

    fn sample_rate_changed(&self, _rate: f64) {}

    fn reset_request(&self) {}

    fn buffer_size_changed(&self) {}
}

/// A sound backend. One driver is loaded at a time; the engine enforces
/// this as a runtime precondition of `load`.
pub trait SoundDriver: Send {
    fn name(&self) -> &str;

    fn channels(&self, direction: Direction) -> EngineResult<usize>;

    fn channel_name(&self, direction: Direction, index: usize) -> EngineResult<String>;

    fn channel_format(&self, direction: Direction, index: usize) -> EngineResult<SampleFormat>;

    fn sample_rate(&self) -> EngineResult<f64>;

    fn can_sample_rate(&self, rate: f64) -> EngineResult<bool>;

    fn set_sample_rate(&mut self, rate: f64) -> EngineResult<()>;

    fn buffer_sizes(&self) -> EngineResult<BufferSizes>;

    /// Device-side latency in frames, excluding anything the engine's own
    /// queueing adds.
    fn latency(&self, direction: Direction) -> EngineResult<usize>;

    /// Prepare double buffers for the given active channels and register
    /// the engine's callbacks.
    fn create_buffers(
        &mut self,
        inputs: &[usize],
        outputs: &[usize],
        frames: usize,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> EngineResult<()>;

    fn dispose_buffers(&mut self) -> EngineResult<()>;

    fn start(&mut self) -> EngineResult<()>;

    fn stop(&mut self) -> EngineResult<()>;

    /// Open the backend's own settings panel, if it has one.
    fn show_control_panel(&mut self) -> EngineResult<()> {
        Err(EngineError::Unsupported(
            "driver has no control panel".into(),
        ))
    }
}

pub type DriverFactory = Box<dyn Fn() -> EngineResult<Box<dyn SoundDriver>> + Send + Sync>;

/// Ordered set of loadable drivers. Replaces a process-global driver list:
/// each engine owns its registry, so several engines can coexist.
pub struct DriverRegistry {
    entries: Vec<(String, DriverFactory)>,
}

impl DriverRegistry {
    pub fn empty() -> DriverRegistry {
        DriverRegistry { entries: vec![] }
    }

    /// Registry with the backends available on this machine: currently the
    /// timer-driven backend on the default output device, when one exists.
    pub fn with_system_drivers() -> DriverRegistry {
        let mut registry = DriverRegistry::empty();
        if let Some(device_name) = timer::default_output_name() {
            let registered = format!("timer:{device_name}");
            registry.register(registered, move || {
                timer::TimerDriver::open_default()
                    .map(|driver| Box::new(driver) as Box<dyn SoundDriver>)
            });
        }
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> EngineResult<Box<dyn SoundDriver>> + Send + Sync + 'static,
    ) {
        self.entries.push((name.into(), Box::new(factory)));
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn create_by_index(&self, index: usize) -> EngineResult<Box<dyn SoundDriver>> {
        let (_, factory) = self.entries.get(index).ok_or_else(|| {
            EngineError::Driver(format!("no driver with index {index}"))
        })?;
        factory()
    }

    pub(crate) fn create_by_name(&self, name: &str) -> EngineResult<Box<dyn SoundDriver>> {
        for (registered, factory) in &self.entries {
            if registered == name {
                return factory();
            }
        }
        Err(EngineError::Driver(format!("no driver named '{name}'")))
    }
}

impl Default for DriverRegistry {
    fn default() -> DriverRegistry {
        DriverRegistry::with_system_drivers()
    }
}
