use crate::state::EngineState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("block shape mismatch: destination is {dst_channels}x{dst_frames}, source is {src_channels}x{src_frames}")]
    ShapeMismatch {
        dst_channels: usize,
        dst_frames: usize,
        src_channels: usize,
        src_frames: usize,
    },

    #[error("queue overrun: no empty buffer available")]
    Overrun,

    #[error("queue underrun: no filled buffer available")]
    Underrun,

    #[error("queue protocol violation: {0}")]
    Protocol(&'static str),

    #[error("{op}: requires at least state {required:?}, current state is {current:?}")]
    InvalidState {
        op: &'static str,
        required: EngineState,
        current: EngineState,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("driver error: {0}")]
    Driver(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
