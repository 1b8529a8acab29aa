//! In-process driver without hardware behind it.
//!
//! The dummy driver presents the full [`SoundDriver`] contract but is
//! pumped by hand through a [`DummyHandle`]: each `pump` performs one
//! bufferswitch with whatever input the handle was fed, and records the
//! native output the engine produced. This makes every engine scenario
//! deterministic, which is what the test suite runs against, and doubles
//! as an offline backend.

use std::sync::{Arc, Mutex};

use super::{BufferSizes, DriverCallbacks, DriverChannel, DriverChannelMut, SoundDriver};
use super::{convert, format::SampleFormat};
use crate::block::Block;
use crate::error::{EngineError, EngineResult};
use crate::state::Direction;

/// Capabilities the dummy device pretends to have.
#[derive(Debug, Clone)]
pub struct DummySpec {
    pub name: String,
    pub input_formats: Vec<SampleFormat>,
    pub output_formats: Vec<SampleFormat>,
    pub sample_rates: Vec<f64>,
    pub buffer_sizes: BufferSizes,
}

impl Default for DummySpec {
    fn default() -> DummySpec {
        DummySpec {
            name: "dummy".into(),
            input_formats: vec![SampleFormat::Int32Le; 2],
            output_formats: vec![SampleFormat::Int32Le; 2],
            sample_rates: vec![44_100.0, 48_000.0],
            buffer_sizes: BufferSizes {
                min: 16,
                max: 4096,
                preferred: 512,
                granularity: -1,
            },
        }
    }
}

struct PreparedBuffers {
    frames: usize,
    active_in: Vec<usize>,
    active_out: Vec<usize>,
    /// Per active input channel: the two halves of the double buffer.
    in_halves: Vec<[Vec<u8>; 2]>,
    half: usize,
    callbacks: Arc<dyn DriverCallbacks>,
}

struct DummyState {
    rate: f64,
    running: bool,
    switches: usize,
    prepared: Option<PreparedBuffers>,
    recorded: Vec<Block>,
}

struct DummyShared {
    spec: DummySpec,
    state: Mutex<DummyState>,
}

pub struct DummyDriver {
    shared: Arc<DummyShared>,
}

/// Test-side handle to a [`DummyDriver`]: pumps periods, feeds input,
/// inspects recorded output.
#[derive(Clone)]
pub struct DummyHandle {
    shared: Arc<DummyShared>,
}

impl DummyDriver {
    pub fn new(spec: DummySpec) -> (DummyDriver, DummyHandle) {
        let rate = spec.sample_rates.first().copied().unwrap_or(48_000.0);
        let shared = Arc::new(DummyShared {
            spec,
            state: Mutex::new(DummyState {
                rate,
                running: false,
                switches: 0,
                prepared: None,
                recorded: vec![],
            }),
        });
        (
            DummyDriver {
                shared: shared.clone(),
            },
            DummyHandle { shared },
        )
    }

    fn formats(&self, direction: Direction) -> &[SampleFormat] {
        match direction {
            Direction::Input => &self.shared.spec.input_formats,
            Direction::Output => &self.shared.spec.output_formats,
        }
    }
}

impl DummyHandle {
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().expect("dummy state poisoned").running
    }

    pub fn switches(&self) -> usize {
        self.shared.state.lock().expect("dummy state poisoned").switches
    }

    /// Write one block of capture data into the half that the next
    /// [`DummyHandle::pump`] presents to the engine.
    pub fn feed_input(&self, block: &Block) {
        let mut state = self.shared.state.lock().expect("dummy state poisoned");
        let spec_formats = &self.shared.spec.input_formats;
        let Some(prepared) = state.prepared.as_mut() else {
            return;
        };
        let half = prepared.half;
        for slot in 0..prepared.active_in.len().min(block.channels()) {
            let format = spec_formats[prepared.active_in[slot]];
            convert::from_float(
                block.channel(slot),
                format,
                &mut prepared.in_halves[slot][half],
            );
        }
    }

    /// Run one bufferswitch. Returns false when the driver is not running.
    ///
    /// The state lock is dropped while the engine's callback executes, so
    /// pumps may overlap deliberately (that is how realtime-overlap xruns
    /// are provoked in tests). Output buffers are private per pump.
    pub fn pump(&self) -> bool {
        let spec = &self.shared.spec;
        // Snapshot driver-side data, flip the double-buffer half.
        let (in_bytes, in_formats, out_formats, frames, callbacks) = {
            let mut state = self.shared.state.lock().expect("dummy state poisoned");
            if !state.running {
                return false;
            }
            let Some(prepared) = state.prepared.as_mut() else {
                return false;
            };
            let half = prepared.half;
            prepared.half ^= 1;
            let in_bytes: Vec<Vec<u8>> = prepared
                .in_halves
                .iter()
                .map(|halves| halves[half].clone())
                .collect();
            let in_formats: Vec<SampleFormat> = prepared
                .active_in
                .iter()
                .map(|&hw_index| spec.input_formats[hw_index])
                .collect();
            let out_formats: Vec<SampleFormat> = prepared
                .active_out
                .iter()
                .map(|&hw_index| spec.output_formats[hw_index])
                .collect();
            (
                in_bytes,
                in_formats,
                out_formats,
                prepared.frames,
                prepared.callbacks.clone(),
            )
        };

        let mut out_bytes: Vec<Vec<u8>> = out_formats
            .iter()
            .map(|format| vec![0u8; frames * format.bytes_per_sample()])
            .collect();
        {
            let inputs: Vec<DriverChannel<'_>> = in_formats
                .iter()
                .zip(&in_bytes)
                .map(|(&format, bytes)| DriverChannel { format, bytes })
                .collect();
            let mut outputs: Vec<DriverChannelMut<'_>> = out_formats
                .iter()
                .zip(out_bytes.iter_mut())
                .map(|(&format, bytes)| DriverChannelMut { format, bytes })
                .collect();
            callbacks.buffer_switch(&inputs, &mut outputs, false);
        }

        // Record what the device would have played this period.
        let mut played = Block::new(out_formats.len(), frames);
        for (slot, &format) in out_formats.iter().enumerate() {
            convert::to_float(&out_bytes[slot], format, played.channel_mut(slot));
        }
        let mut state = self.shared.state.lock().expect("dummy state poisoned");
        state.recorded.push(played);
        state.switches += 1;
        true
    }

    /// Every output period recorded so far, decoded to float.
    pub fn recorded_outputs(&self) -> Vec<Block> {
        self.shared
            .state
            .lock()
            .expect("dummy state poisoned")
            .recorded
            .clone()
    }

    pub fn clear_recorded(&self) {
        self.shared
            .state
            .lock()
            .expect("dummy state poisoned")
            .recorded
            .clear();
    }
}

impl SoundDriver for DummyDriver {
    fn name(&self) -> &str {
        &self.shared.spec.name
    }

    fn channels(&self, direction: Direction) -> EngineResult<usize> {
        Ok(self.formats(direction).len())
    }

    fn channel_name(&self, direction: Direction, index: usize) -> EngineResult<String> {
        if index >= self.formats(direction).len() {
            return Err(EngineError::Unsupported(format!(
                "channel index {index} out of range"
            )));
        }
        let side = match direction {
            Direction::Input => "in",
            Direction::Output => "out",
        };
        Ok(format!("{} {side} {index}", self.shared.spec.name))
    }

    fn channel_format(&self, direction: Direction, index: usize) -> EngineResult<SampleFormat> {
        self.formats(direction)
            .get(index)
            .copied()
            .ok_or_else(|| EngineError::Unsupported(format!("channel index {index} out of range")))
    }

    fn sample_rate(&self) -> EngineResult<f64> {
        Ok(self.shared.state.lock().expect("dummy state poisoned").rate)
    }

    fn can_sample_rate(&self, rate: f64) -> EngineResult<bool> {
        Ok(self.shared.spec.sample_rates.contains(&rate))
    }

    fn set_sample_rate(&mut self, rate: f64) -> EngineResult<()> {
        if !self.can_sample_rate(rate)? {
            return Err(EngineError::Unsupported(format!(
                "sample rate {rate} not supported"
            )));
        }
        self.shared.state.lock().expect("dummy state poisoned").rate = rate;
        Ok(())
    }

    fn buffer_sizes(&self) -> EngineResult<BufferSizes> {
        Ok(self.shared.spec.buffer_sizes)
    }

    fn latency(&self, _direction: Direction) -> EngineResult<usize> {
        let state = self.shared.state.lock().expect("dummy state poisoned");
        Ok(state.prepared.as_ref().map(|p| p.frames).unwrap_or(0))
    }

    fn create_buffers(
        &mut self,
        inputs: &[usize],
        outputs: &[usize],
        frames: usize,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> EngineResult<()> {
        if !self.shared.spec.buffer_sizes.supports(frames) {
            return Err(EngineError::Unsupported(format!(
                "buffer size {frames} not supported"
            )));
        }
        for &index in inputs {
            if index >= self.shared.spec.input_formats.len() {
                return Err(EngineError::Unsupported(format!(
                    "input channel {index} out of range"
                )));
            }
        }
        for &index in outputs {
            if index >= self.shared.spec.output_formats.len() {
                return Err(EngineError::Unsupported(format!(
                    "output channel {index} out of range"
                )));
            }
        }
        let mut state = self.shared.state.lock().expect("dummy state poisoned");
        let in_halves = inputs
            .iter()
            .map(|&hw_index| {
                let bytes = frames * self.shared.spec.input_formats[hw_index].bytes_per_sample();
                [vec![0u8; bytes], vec![0u8; bytes]]
            })
            .collect();
        state.prepared = Some(PreparedBuffers {
            frames,
            active_in: inputs.to_vec(),
            active_out: outputs.to_vec(),
            in_halves,
            half: 0,
            callbacks,
        });
        Ok(())
    }

    fn dispose_buffers(&mut self) -> EngineResult<()> {
        let mut state = self.shared.state.lock().expect("dummy state poisoned");
        state.running = false;
        state.prepared = None;
        Ok(())
    }

    fn start(&mut self) -> EngineResult<()> {
        let mut state = self.shared.state.lock().expect("dummy state poisoned");
        if state.prepared.is_none() {
            return Err(EngineError::Driver("no buffers prepared".into()));
        }
        state.running = true;
        Ok(())
    }

    fn stop(&mut self) -> EngineResult<()> {
        self.shared.state.lock().expect("dummy state poisoned").running = false;
        Ok(())
    }
}
