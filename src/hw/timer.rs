//! Timer-driven backend for devices without a callback-driven driver.
//!
//! The device side is a cpal output stream. Because such devices have no
//! bufferswitch of their own, the driver runs an internal software-buffer
//! worker: a bounded ring of float blocks that a filler thread keeps full
//! by invoking the engine's `buffer_switch`, and that the stream callback
//! drains at its own pace. An empty ring at drain time is an xrun; the
//! callback then plays silence. The backend is restricted to 2-channel
//! output.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, SupportedStreamConfig};
use tracing::error;

use super::{BufferSizes, DriverCallbacks, DriverChannelMut, SoundDriver};
use super::{convert, format::SampleFormat};
use crate::error::{EngineError, EngineResult};
use crate::queue::BlockQueue;
use crate::state::Direction;
use crate::sync::{Event, ResetMode, SignalHub, Wait, wait_any};

const OUTPUT_CHANNELS: usize = 2;
const RING_BLOCKS: usize = 4;

/// Name of the default output device, if the host has one.
pub fn default_output_name() -> Option<String> {
    let device = cpal::default_host().default_output_device()?;
    device.name().ok()
}

struct Prepared {
    frames: usize,
    callbacks: Arc<dyn DriverCallbacks>,
}

struct Running {
    quit: Arc<Event>,
    filler: Option<JoinHandle<()>>,
}

pub struct TimerDriver {
    device_name: String,
    rate: f64,
    prepared: Option<Prepared>,
    running: Option<Running>,
    ring_xruns: Arc<AtomicUsize>,
}

impl TimerDriver {
    /// Open the default output device of the default host.
    pub fn open_default() -> EngineResult<TimerDriver> {
        let device_name = default_output_name()
            .ok_or_else(|| EngineError::Driver("no default output device".into()))?;
        Ok(TimerDriver {
            device_name,
            rate: 48_000.0,
            prepared: None,
            running: None,
            ring_xruns: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Periods the stream callback found the software ring empty.
    pub fn ring_xruns(&self) -> usize {
        self.ring_xruns.load(Ordering::Relaxed)
    }

    fn select_output_config(&self, rate: f64) -> EngineResult<SupportedStreamConfig> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| EngineError::Driver("output device disappeared".into()))?;
        let wanted = SampleRate(rate as u32);
        let configs = device
            .supported_output_configs()
            .map_err(|e| EngineError::Driver(format!("supported_output_configs: {e}")))?;
        for supported in configs {
            if supported.sample_format() == cpal::SampleFormat::F32
                && supported.min_sample_rate() <= wanted
                && supported.max_sample_rate() >= wanted
            {
                return Ok(supported.with_sample_rate(wanted));
            }
        }
        Err(EngineError::Unsupported(format!(
            "no f32 output config at {rate} Hz on '{}'",
            self.device_name
        )))
    }
}

impl SoundDriver for TimerDriver {
    fn name(&self) -> &str {
        &self.device_name
    }

    fn channels(&self, direction: Direction) -> EngineResult<usize> {
        Ok(match direction {
            Direction::Input => 0,
            Direction::Output => OUTPUT_CHANNELS,
        })
    }

    fn channel_name(&self, direction: Direction, index: usize) -> EngineResult<String> {
        if direction == Direction::Input || index >= OUTPUT_CHANNELS {
            return Err(EngineError::Unsupported(format!(
                "channel index {index} out of range"
            )));
        }
        Ok(format!(
            "{} out {}",
            self.device_name,
            if index == 0 { "left" } else { "right" }
        ))
    }

    fn channel_format(&self, direction: Direction, index: usize) -> EngineResult<SampleFormat> {
        if direction == Direction::Input || index >= OUTPUT_CHANNELS {
            return Err(EngineError::Unsupported(format!(
                "channel index {index} out of range"
            )));
        }
        Ok(SampleFormat::Float32Le)
    }

    fn sample_rate(&self) -> EngineResult<f64> {
        Ok(self.rate)
    }

    fn can_sample_rate(&self, rate: f64) -> EngineResult<bool> {
        Ok(self.select_output_config(rate).is_ok())
    }

    fn set_sample_rate(&mut self, rate: f64) -> EngineResult<()> {
        if !self.can_sample_rate(rate)? {
            return Err(EngineError::Unsupported(format!(
                "sample rate {rate} not supported"
            )));
        }
        self.rate = rate;
        Ok(())
    }

    fn buffer_sizes(&self) -> EngineResult<BufferSizes> {
        Ok(BufferSizes {
            min: 32,
            max: 8192,
            preferred: 1024,
            granularity: 1,
        })
    }

    fn latency(&self, direction: Direction) -> EngineResult<usize> {
        Ok(match direction {
            Direction::Input => 0,
            Direction::Output => {
                self.prepared
                    .as_ref()
                    .map(|p| p.frames * RING_BLOCKS)
                    .unwrap_or(0)
            }
        })
    }

    fn create_buffers(
        &mut self,
        inputs: &[usize],
        outputs: &[usize],
        frames: usize,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> EngineResult<()> {
        if !inputs.is_empty() {
            return Err(EngineError::Unsupported(
                "timer backend has no capture channels".into(),
            ));
        }
        if outputs != [0, 1] {
            return Err(EngineError::Unsupported(
                "timer backend requires exactly output channels 0 and 1".into(),
            ));
        }
        if !self.buffer_sizes()?.supports(frames) {
            return Err(EngineError::Unsupported(format!(
                "buffer size {frames} not supported"
            )));
        }
        self.prepared = Some(Prepared { frames, callbacks });
        Ok(())
    }

    fn dispose_buffers(&mut self) -> EngineResult<()> {
        self.stop()?;
        self.prepared = None;
        Ok(())
    }

    fn start(&mut self) -> EngineResult<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| EngineError::Driver("no buffers prepared".into()))?;
        let frames = prepared.frames;
        let callbacks = prepared.callbacks.clone();
        let stream_config = self.select_output_config(self.rate)?;

        let hub = SignalHub::new();
        let ring = Arc::new(BlockQueue::with_hub(OUTPUT_CHANNELS, frames, RING_BLOCKS, &hub)?);
        let quit = Arc::new(Event::new(&hub, ResetMode::Manual));
        let xruns = self.ring_xruns.clone();

        let (ready_tx, ready_rx) = mpsc::channel::<EngineResult<()>>();
        let filler = {
            let ring = ring.clone();
            let quit = quit.clone();
            std::thread::Builder::new()
                .name("timer-softwarebuffer".into())
                .spawn(move || {
                    // The cpal stream lives on this thread for its whole
                    // life; it must not cross threads on every platform.
                    let stream = match build_stream(&stream_config, frames, ring.clone(), xruns) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(EngineError::Driver(format!(
                            "failed to start output stream: {e}"
                        ))));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));
                    fill_loop(&ring, &quit, &callbacks, frames);
                    drop(stream);
                })
                .map_err(|e| EngineError::Driver(format!("failed to spawn filler thread: {e}")))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.running = Some(Running {
                    quit,
                    filler: Some(filler),
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = filler.join();
                Err(e)
            }
            Err(_) => {
                let _ = filler.join();
                Err(EngineError::Driver("filler thread died during start".into()))
            }
        }
    }

    fn stop(&mut self) -> EngineResult<()> {
        if let Some(mut running) = self.running.take() {
            running.quit.set();
            if let Some(handle) = running.filler.take() {
                let _ = handle.join();
            }
        }
        Ok(())
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn build_stream(
    config: &SupportedStreamConfig,
    frames: usize,
    ring: Arc<BlockQueue>,
    xruns: Arc<AtomicUsize>,
) -> EngineResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| EngineError::Driver("output device disappeared".into()))?;
    let stream_channels = config.channels() as usize;
    let stream_config = cpal::StreamConfig {
        channels: config.channels(),
        sample_rate: config.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    // Interleaved stereo staging drained across stream callbacks; the
    // stream period and the software block size are independent.
    let mut pending: Vec<f32> = Vec::new();
    let mut pending_at = 0usize;

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut starved = false;
                for frame in data.chunks_mut(stream_channels) {
                    if pending_at >= pending.len() {
                        match ring.read_slot() {
                            Ok(slot) => {
                                pending.resize(frames * 2, 0.0);
                                for i in 0..frames {
                                    pending[i * 2] = slot.channel(0)[i];
                                    pending[i * 2 + 1] = slot.channel(1)[i];
                                }
                                slot.commit();
                                pending_at = 0;
                            }
                            Err(_) => {
                                starved = true;
                                for sample in frame.iter_mut() {
                                    *sample = 0.0;
                                }
                                continue;
                            }
                        }
                    }
                    let left = pending[pending_at];
                    let right = pending[pending_at + 1];
                    pending_at += 2;
                    match stream_channels {
                        1 => frame[0] = (left + right) * 0.5,
                        _ => {
                            frame[0] = left;
                            frame[1] = right;
                            for sample in frame.iter_mut().skip(2) {
                                *sample = 0.0;
                            }
                        }
                    }
                }
                if starved {
                    xruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            move |e| error!("timer backend output stream error: {e}"),
            None,
        )
        .map_err(|e| EngineError::Driver(format!("failed to build output stream: {e}")))?;
    Ok(stream)
}

/// The software-buffer worker: keeps the ring full by running one engine
/// bufferswitch per free block.
fn fill_loop(ring: &BlockQueue, quit: &Event, callbacks: &Arc<dyn DriverCallbacks>, frames: usize) {
    let mut staging = [
        vec![0u8; frames * SampleFormat::Float32Le.bytes_per_sample()],
        vec![0u8; frames * SampleFormat::Float32Le.bytes_per_sample()],
    ];
    loop {
        if quit.is_set() {
            return;
        }
        if ring.empty_count() == 0 {
            match wait_any(&[quit, ring.space_event()], Some(Duration::from_millis(100))) {
                Wait::Event(0) => return,
                _ => continue,
            }
        }
        for half in staging.iter_mut() {
            half.fill(0);
        }
        {
            let mut outputs: Vec<DriverChannelMut<'_>> = staging
                .iter_mut()
                .map(|bytes| DriverChannelMut {
                    format: SampleFormat::Float32Le,
                    bytes,
                })
                .collect();
            callbacks.buffer_switch(&[], &mut outputs, true);
        }
        match ring.write_slot() {
            Ok(mut slot) => {
                for (channel, bytes) in staging.iter().enumerate() {
                    convert::to_float(bytes, SampleFormat::Float32Le, slot.channel_mut(channel));
                }
                slot.commit();
            }
            Err(_) => {
                // Cannot happen: this thread is the only producer and space
                // was checked above. The period is dropped if it ever does.
            }
        }
    }
}
