//! Low-latency multi-channel audio I/O engine.
//!
//! Sits between a callback- or timer-driven sound driver and client
//! signal processing code, turning the driver's unbuffered bufferswitch
//! into a disciplined pipeline: bounded SPSC block queues towards a
//! processing thread and an optional visualization/recording ("done")
//! thread, glitch-free asynchronous stop with tail silence, prefill,
//! per-channel sample-format conversion and a driver watchdog.

mod block;
pub mod config;
mod engine;
mod error;
mod exchanger;
pub mod hw;
pub mod logging;
mod queue;
mod state;
mod sync;

pub use block::Block;
pub use config::{ConfigError, EngineConfig};
pub use engine::{AudioClient, Engine, EngineCounters, EngineObserver};
pub use error::{EngineError, EngineResult};
pub use queue::{BlockQueue, ReadSlot, WriteSlot};
pub use state::{Direction, EngineState, XrunKind};
