//! Routing between the driver callback and the worker threads.
//!
//! Owns up to four block queues: the processing pair that decouples the
//! client's signal processing from the sound card, and the optional "done"
//! pair that carries already-captured input and already-dispatched output
//! to a visualization / disk recording consumer. A processing depth of 0
//! selects realtime mode; the processing pair is then allocated with depth
//! 1 and used only as a synchronisation token between the driver callback
//! and the inline processing it performs itself.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::block::Block;
use crate::error::EngineResult;
use crate::queue::BlockQueue;
use crate::state::XrunKind;
use crate::sync::SignalHub;

/// Shape of the queue fabric, fixed at prepare time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExchangerConfig {
    pub capture_channels: usize,
    pub playback_channels: usize,
    pub frames: usize,
    pub proc_queue_depth: usize,
    pub done_queue_depth: usize,
    pub capture_done_processed: bool,
}

/// Scratch state touched only inside the driver callback. Guarded by an
/// uncontended mutex; the callback is the only regular lock holder.
struct DriverSide {
    capture: Block,
    playback: Block,
    proc_xrun: bool,
    done_xrun: bool,
}

pub(crate) struct Exchanger {
    proc_capture: BlockQueue,
    proc_playback: BlockQueue,
    done_capture: Option<BlockQueue>,
    done_playback: Option<BlockQueue>,
    realtime: bool,
    capture_done_processed: AtomicBool,
    driver_side: Mutex<DriverSide>,
    /// Done-queue blocks that had to be discarded by `clear_queues`
    /// because the done loop was no longer draining them.
    discarded_done_blocks: AtomicUsize,
}

impl Exchanger {
    pub(crate) fn new(config: &ExchangerConfig, hub: &Arc<SignalHub>) -> EngineResult<Exchanger> {
        let realtime = config.proc_queue_depth == 0;
        let proc_depth = if realtime { 1 } else { config.proc_queue_depth };
        let proc_capture =
            BlockQueue::with_hub(config.capture_channels, config.frames, proc_depth, hub)?;
        let proc_playback =
            BlockQueue::with_hub(config.playback_channels, config.frames, proc_depth, hub)?;
        let (done_capture, done_playback) = if config.done_queue_depth > 0 {
            (
                Some(BlockQueue::with_hub(
                    config.capture_channels,
                    config.frames,
                    config.done_queue_depth,
                    hub,
                )?),
                Some(BlockQueue::with_hub(
                    config.playback_channels,
                    config.frames,
                    config.done_queue_depth,
                    hub,
                )?),
            )
        } else {
            (None, None)
        };
        Ok(Exchanger {
            proc_capture,
            proc_playback,
            done_capture,
            done_playback,
            realtime,
            capture_done_processed: AtomicBool::new(config.capture_done_processed),
            driver_side: Mutex::new(DriverSide {
                capture: Block::new(config.capture_channels, config.frames),
                playback: Block::new(config.playback_channels, config.frames),
                proc_xrun: false,
                done_xrun: false,
            }),
            discarded_done_blocks: AtomicUsize::new(0),
        })
    }

    pub(crate) fn is_realtime(&self) -> bool {
        self.realtime
    }

    pub(crate) fn has_done_queue(&self) -> bool {
        self.done_playback.is_some()
    }

    pub(crate) fn capture_done_processed(&self) -> bool {
        self.capture_done_processed.load(Ordering::Acquire)
    }

    pub(crate) fn set_capture_done_processed(&self, enabled: bool) {
        self.capture_done_processed.store(enabled, Ordering::Release);
    }

    pub(crate) fn proc_capture(&self) -> &BlockQueue {
        &self.proc_capture
    }

    pub(crate) fn proc_playback(&self) -> &BlockQueue {
        &self.proc_playback
    }

    pub(crate) fn done_capture(&self) -> Option<&BlockQueue> {
        self.done_capture.as_ref()
    }

    pub(crate) fn done_playback(&self) -> Option<&BlockQueue> {
        self.done_playback.as_ref()
    }

    /// Number of client buffers that can be processed right now without
    /// waiting for further sound card interrupts.
    pub(crate) fn proc_pending(&self) -> usize {
        self.proc_capture
            .filled_count()
            .min(self.proc_playback.empty_count())
    }

    /// Number of block pairs waiting in the done queues.
    pub(crate) fn done_pending(&self) -> usize {
        match (&self.done_capture, &self.done_playback) {
            (Some(capture), Some(playback)) => {
                capture.filled_count().min(playback.filled_count())
            }
            _ => 0,
        }
    }

    pub(crate) fn discarded_done_blocks(&self) -> usize {
        self.discarded_done_blocks.load(Ordering::Relaxed)
    }

    /// Driver-thread capture half: checks both capture queues for overrun
    /// (destination-side xrun; data is dropped when a consumer cannot keep
    /// up), converts the driver inputs via `convert_in`, and pushes the
    /// block to every capture queue that is not in xrun.
    pub(crate) fn handle_capture(
        &self,
        convert_in: impl FnOnce(&mut Block),
        signal_xrun: &dyn Fn(XrunKind),
    ) {
        let mut side = self.driver_side.lock().expect("driver side poisoned");
        side.proc_xrun = check_capture_xrun(&self.proc_capture, XrunKind::Proc, signal_xrun);
        side.done_xrun = match &self.done_capture {
            Some(queue) => check_capture_xrun(queue, XrunKind::Done, signal_xrun),
            None => false,
        };

        convert_in(&mut side.capture);
        side.capture.set_last(false);

        if !side.proc_xrun {
            if let Ok(mut slot) = self.proc_capture.write_slot() {
                let _ = slot.copy_from(&side.capture);
                slot.commit();
            }
        }
        if !self.capture_done_processed() && !side.done_xrun {
            if let Some(queue) = &self.done_capture {
                if let Ok(mut slot) = queue.write_slot() {
                    let _ = slot.copy_from(&side.capture);
                    slot.commit();
                }
            }
        }
    }

    /// Driver-thread playback half: pops the next processed block into the
    /// scratch buffer (silence on underrun), hands it to `deliver` (play
    /// notification plus native output conversion), mirrors it into the
    /// done-playback queue, and returns whether the block carried the
    /// last-flag.
    pub(crate) fn handle_playback(
        &self,
        signal_xrun: &dyn Fn(XrunKind),
        deliver: &mut dyn FnMut(&Block),
    ) -> bool {
        let mut side = self.driver_side.lock().expect("driver side poisoned");
        let proc_xrun = side.proc_xrun;
        match if proc_xrun {
            None
        } else {
            self.proc_playback.read_slot().ok()
        } {
            Some(slot) => {
                let _ = side.playback.copy_from(&slot);
                slot.commit();
            }
            None => {
                // Data is missing, either because the capture half already
                // flagged the processing path or because the playback queue
                // ran dry on its own.
                side.playback.clear();
                if !proc_xrun {
                    signal_xrun(XrunKind::Proc);
                }
            }
        }

        deliver(&side.playback);

        if !side.done_xrun {
            if let Some(queue) = &self.done_playback {
                if let Ok(mut slot) = queue.write_slot() {
                    let _ = slot.copy_from(&side.playback);
                    slot.commit();
                }
            }
        }
        side.playback.is_last()
    }

    /// Processing-thread tail of the `capture_done_processed` routing: the
    /// block the client just processed in place is pushed to the
    /// done-capture queue instead of the raw driver-side copy.
    pub(crate) fn route_processed_capture(
        &self,
        processed: &Block,
        signal_xrun: &dyn Fn(XrunKind),
    ) {
        if !self.capture_done_processed() {
            return;
        }
        if let Some(queue) = &self.done_capture {
            match queue.write_slot() {
                Ok(mut slot) => {
                    let _ = slot.copy_from(processed);
                    slot.commit();
                }
                Err(_) => signal_xrun(XrunKind::Done),
            }
        }
    }

    /// Copy one synthesized playback block into the processing playback
    /// queue before the device starts.
    pub(crate) fn prefill_one(&self, playback: &Block) -> EngineResult<()> {
        let mut slot = self.proc_playback.write_slot()?;
        slot.copy_from(playback)?;
        slot.commit();
        Ok(())
    }

    /// Discard queued data at the end of the stop procedure. Processing
    /// queues are dropped immediately; the done queues are given to the
    /// done loop to drain while it is still active, and discarded here
    /// otherwise.
    pub(crate) fn clear_queues(&self, done_loop_active: &dyn Fn() -> bool) {
        while let Ok(slot) = self.proc_capture.read_slot() {
            slot.commit();
        }
        while let Ok(slot) = self.proc_playback.read_slot() {
            slot.commit();
        }

        while done_loop_active() && self.done_filled() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        for queue in [&self.done_capture, &self.done_playback].into_iter().flatten() {
            while let Ok(slot) = queue.read_slot() {
                slot.commit();
                self.discarded_done_blocks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn done_filled(&self) -> usize {
        [&self.done_capture, &self.done_playback]
            .into_iter()
            .flatten()
            .map(|queue| queue.filled_count())
            .sum()
    }
}

fn check_capture_xrun(
    queue: &BlockQueue,
    kind: XrunKind,
    signal_xrun: &dyn Fn(XrunKind),
) -> bool {
    if queue.empty_count() == 0 {
        signal_xrun(kind);
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::Mutex as StdMutex;

    fn exchanger(proc_depth: usize, done_depth: usize) -> Exchanger {
        let config = ExchangerConfig {
            capture_channels: 2,
            playback_channels: 2,
            frames: 8,
            proc_queue_depth: proc_depth,
            done_queue_depth: done_depth,
            capture_done_processed: false,
        };
        Exchanger::new(&config, &SignalHub::new()).unwrap()
    }

    fn collecting() -> (Arc<StdMutex<Vec<XrunKind>>>, impl Fn(XrunKind)) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |kind| seen.lock().unwrap().push(kind)
        };
        (seen, sink)
    }

    fn ramp(step: f32) -> impl FnOnce(&mut Block) {
        move |block: &mut Block| {
            for ch in 0..block.channels() {
                for (i, sample) in block.channel_mut(ch).iter_mut().enumerate() {
                    *sample = step + i as f32;
                }
            }
        }
    }

    #[test]
    fn zero_proc_depth_selects_realtime_with_token_queues() {
        let exchanger = exchanger(0, 0);
        assert!(exchanger.is_realtime());
        assert!(!exchanger.has_done_queue());
        assert_eq!(exchanger.proc_capture().capacity(), 1);
        assert_eq!(exchanger.proc_playback().capacity(), 1);
    }

    #[test]
    fn capture_overrun_drops_and_signals_per_callback() {
        // Depth 2, nobody consumes: 5 callbacks end in exactly 3 Proc
        // xruns and a full queue holding the two oldest blocks.
        let exchanger = exchanger(2, 0);
        let (seen, sink) = collecting();
        for n in 0..5 {
            exchanger.handle_capture(ramp(n as f32), &sink);
        }
        assert_eq!(seen.lock().unwrap().as_slice(), &[
            XrunKind::Proc,
            XrunKind::Proc,
            XrunKind::Proc
        ]);
        assert_eq!(exchanger.proc_capture().filled_count(), 2);
        let oldest = exchanger.proc_capture().read_slot().unwrap();
        assert_eq!(oldest.channel(0)[0], 0.0);
        oldest.commit();
        let next = exchanger.proc_capture().read_slot().unwrap();
        assert_eq!(next.channel(0)[0], 1.0);
        next.commit();
    }

    #[test]
    fn raw_capture_reaches_done_queue_by_default() {
        let exchanger = exchanger(2, 4);
        let (_, sink) = collecting();
        exchanger.handle_capture(ramp(7.0), &sink);
        assert_eq!(exchanger.proc_capture().filled_count(), 1);
        let done = exchanger.done_capture().unwrap();
        assert_eq!(done.filled_count(), 1);
        let slot = done.read_slot().unwrap();
        assert_eq!(slot.channel(1)[3], 10.0);
        slot.commit();
    }

    #[test]
    fn processed_capture_routing_bypasses_driver_push() {
        let exchanger = exchanger(2, 4);
        exchanger.set_capture_done_processed(true);
        let (seen, sink) = collecting();
        exchanger.handle_capture(ramp(1.0), &sink);
        assert_eq!(exchanger.done_capture().unwrap().filled_count(), 0);

        let mut processed = Block::new(2, 8);
        processed.channel_mut(0).fill(0.25);
        exchanger.route_processed_capture(&processed, &sink);
        let done = exchanger.done_capture().unwrap();
        assert_eq!(done.filled_count(), 1);
        let slot = done.read_slot().unwrap();
        assert_eq!(slot.channel(0)[0], 0.25);
        slot.commit();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn playback_underrun_delivers_silence_and_signals() {
        let exchanger = exchanger(2, 0);
        let (seen, sink) = collecting();
        let mut delivered = Block::new(2, 8);
        let last = exchanger.handle_playback(&sink, &mut |block| {
            delivered.copy_from(block).unwrap();
        });
        assert!(!last);
        assert!(delivered.channel(0).iter().all(|&s| s == 0.0));
        assert_eq!(seen.lock().unwrap().as_slice(), &[XrunKind::Proc]);
    }

    #[test]
    fn playback_flows_in_order_and_mirrors_to_done() {
        let exchanger = exchanger(2, 4);
        let (seen, sink) = collecting();
        for n in 0..2 {
            let mut block = Block::new(2, 8);
            block.channel_mut(0).fill(n as f32 + 1.0);
            exchanger.prefill_one(&block).unwrap();
        }
        let mut delivered = Vec::new();
        for _ in 0..2 {
            exchanger.handle_playback(&sink, &mut |block| delivered.push(block.channel(0)[0]));
        }
        assert_eq!(delivered, vec![1.0, 2.0]);
        assert!(seen.lock().unwrap().is_empty());
        let done = exchanger.done_playback().unwrap();
        assert_eq!(done.filled_count(), 2);
        let first = done.read_slot().unwrap();
        assert_eq!(first.channel(0)[0], 1.0);
        first.commit();
    }

    #[test]
    fn last_flag_is_reported_when_the_block_reaches_the_device() {
        let exchanger = exchanger(2, 0);
        let (_, sink) = collecting();
        let mut block = Block::new(2, 8);
        block.set_last(true);
        exchanger.prefill_one(&block).unwrap();
        let last = exchanger.handle_playback(&sink, &mut |_| {});
        assert!(last);
    }

    #[test]
    fn prefill_fills_to_capacity() {
        let exchanger = exchanger(4, 0);
        let block = Block::new(2, 8);
        for _ in 0..4 {
            exchanger.prefill_one(&block).unwrap();
        }
        assert!(matches!(
            exchanger.prefill_one(&block),
            Err(EngineError::Overrun)
        ));
        assert_eq!(exchanger.proc_playback().filled_count(), 4);
    }

    #[test]
    fn clear_queues_discards_when_done_loop_is_inactive() {
        let exchanger = exchanger(2, 4);
        let (_, sink) = collecting();
        exchanger.handle_capture(ramp(0.0), &sink);
        exchanger.handle_capture(ramp(1.0), &sink);
        exchanger.clear_queues(&|| false);
        assert_eq!(exchanger.proc_capture().filled_count(), 0);
        assert_eq!(exchanger.done_capture().unwrap().filled_count(), 0);
        assert_eq!(exchanger.discarded_done_blocks(), 2);
    }
}
