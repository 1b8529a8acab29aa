//! Multi-channel sound data block.

use crate::error::{EngineError, EngineResult};

/// One driver period across all active channels of a direction.
///
/// Samples are `f32` in `[-1, +1]`, stored channel-major. The `is_last`
/// flag marks the final playback block of a sequence; it travels with the
/// block through the queues and takes effect exactly when the block is
/// handed to the device.
#[derive(Debug, Clone, Default)]
pub struct Block {
    channels: Vec<Vec<f32>>,
    frames: usize,
    is_last: bool,
}

impl Block {
    /// Create a block of `channels` x `frames` silence.
    pub fn new(channels: usize, frames: usize) -> Block {
        Block {
            channels: vec![vec![0.0; frames]; channels],
            frames,
            is_last: false,
        }
    }

    /// Allocate a contiguous batch of identically shaped blocks, used to
    /// back a queue. Fails for zero buffers or zero frames; zero channels
    /// is legal (a direction may have no active channels).
    pub fn create_array(count: usize, channels: usize, frames: usize) -> EngineResult<Vec<Block>> {
        if count == 0 || frames == 0 {
            return Err(EngineError::Unsupported(
                "number of buffers and number of frames must not be 0".into(),
            ));
        }
        Ok(vec![Block::new(channels, frames); count])
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.channels.len(), self.frames)
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index]
    }

    pub fn is_last(&self) -> bool {
        self.is_last
    }

    pub fn set_last(&mut self, is_last: bool) {
        self.is_last = is_last;
    }

    /// Overwrite all samples with zeros and clear the last-flag.
    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
        self.is_last = false;
    }

    /// Change the shape of this block. This reallocates and must only be
    /// used outside the realtime path.
    pub fn reinitialize(&mut self, channels: usize, frames: usize) -> EngineResult<()> {
        if frames == 0 {
            return Err(EngineError::Unsupported(
                "number of frames must not be 0".into(),
            ));
        }
        self.channels = vec![vec![0.0; frames]; channels];
        self.frames = frames;
        self.is_last = false;
        Ok(())
    }

    /// Copy samples and the last-flag from `source`. The shapes have to
    /// match exactly.
    pub fn copy_from(&mut self, source: &Block) -> EngineResult<()> {
        if source.shape() != self.shape() {
            return Err(EngineError::ShapeMismatch {
                dst_channels: self.channels.len(),
                dst_frames: self.frames,
                src_channels: source.channels.len(),
                src_frames: source.frames,
            });
        }
        for (dst, src) in self.channels.iter_mut().zip(&source.channels) {
            dst.copy_from_slice(src);
        }
        self.is_last = source.is_last;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_block_is_silent() {
        let block = Block::new(2, 64);
        assert_eq!(block.shape(), (2, 64));
        assert!(!block.is_last());
        assert!(block.channel(0).iter().all(|&s| s == 0.0));
        assert!(block.channel(1).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn clear_zeroes_samples_and_last_flag() {
        let mut block = Block::new(1, 8);
        block.channel_mut(0).copy_from_slice(&[1.0; 8]);
        block.set_last(true);
        block.clear();
        assert!(block.channel(0).iter().all(|&s| s == 0.0));
        assert!(!block.is_last());
    }

    #[test]
    fn copy_from_matching_shape_is_exact() {
        let mut src = Block::new(2, 4);
        for ch in 0..2 {
            for (i, s) in src.channel_mut(ch).iter_mut().enumerate() {
                *s = (ch * 4 + i) as f32 / 8.0;
            }
        }
        src.set_last(true);
        let mut dst = Block::new(2, 4);
        dst.copy_from(&src).unwrap();
        assert_eq!(dst.channel(0), src.channel(0));
        assert_eq!(dst.channel(1), src.channel(1));
        assert!(dst.is_last());
    }

    #[test]
    fn copy_from_rejects_frame_mismatch() {
        let src = Block::new(2, 32);
        let mut dst = Block::new(2, 64);
        assert!(matches!(
            dst.copy_from(&src),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn copy_from_rejects_channel_mismatch() {
        let src = Block::new(1, 64);
        let mut dst = Block::new(2, 64);
        assert!(matches!(
            dst.copy_from(&src),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn reinitialize_rejects_zero_frames() {
        let mut block = Block::new(2, 64);
        assert!(block.reinitialize(2, 0).is_err());
        assert!(block.reinitialize(4, 16).is_ok());
        assert_eq!(block.shape(), (4, 16));
    }

    #[test]
    fn create_array_validates_parameters() {
        assert!(Block::create_array(0, 2, 64).is_err());
        assert!(Block::create_array(4, 2, 0).is_err());
        let blocks = Block::create_array(4, 0, 64).unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].shape(), (0, 64));
    }
}
