//! Bounded single-producer/single-consumer queue of sound blocks.
//!
//! Transports sound data from one thread to another and introduces a
//! bounded delay. Storage is `capacity + 1` slots arranged as a ring: at
//! least one slot is always unused, because `capacity + 1` distinct fill
//! counts `[0, capacity]` have to be distinguishable from the two indices
//! alone. All blocks are allocated up front; the hot path is
//! allocation-free.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::block::Block;
use crate::error::{EngineError, EngineResult};
use crate::sync::{Event, ResetMode, SignalHub};

pub struct BlockQueue {
    capacity: usize,
    slots: Box<[UnsafeCell<Block>]>,
    write_index: AtomicUsize,
    read_index: AtomicUsize,
    write_pending: AtomicBool,
    read_pending: AtomicBool,
    data_available: Event,
    space_available: Event,
}

// SAFETY: the queue is strictly single-producer/single-consumer. A slot is
// only dereferenced through a WriteSlot or ReadSlot guard; the pending
// flags guarantee at most one outstanding guard per side, and the index
// arithmetic guarantees the two sides never alias the same slot while a
// guard is alive.
unsafe impl Send for BlockQueue {}
unsafe impl Sync for BlockQueue {}

impl BlockQueue {
    /// Create a queue of `capacity` blocks shaped `channels` x `frames`.
    pub fn new(channels: usize, frames: usize, capacity: usize) -> EngineResult<BlockQueue> {
        BlockQueue::with_hub(channels, frames, capacity, &SignalHub::new())
    }

    /// Like [`BlockQueue::new`], with the wakeup events attached to the
    /// given hub so callers can wait on them together with other events.
    pub(crate) fn with_hub(
        channels: usize,
        frames: usize,
        capacity: usize,
        hub: &Arc<SignalHub>,
    ) -> EngineResult<BlockQueue> {
        if capacity == 0 {
            return Err(EngineError::Unsupported(
                "cannot create queue with capacity for 0 buffers".into(),
            ));
        }
        let slots: Vec<UnsafeCell<Block>> = Block::create_array(capacity + 1, channels, frames)?
            .into_iter()
            .map(UnsafeCell::new)
            .collect();
        let space_available = Event::new(hub, ResetMode::Auto);
        // The queue starts out all-empty, so "space" is signalled from the
        // beginning.
        space_available.set();
        Ok(BlockQueue {
            capacity,
            slots: slots.into_boxed_slice(),
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(0),
            write_pending: AtomicBool::new(false),
            read_pending: AtomicBool::new(false),
            data_available: Event::new(hub, ResetMode::Auto),
            space_available,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of filled blocks, exact at the moment of the call.
    ///
    /// The extra `capacity + 1` in the sum keeps the difference positive
    /// when the write index has already wrapped while the read index has
    /// not.
    pub fn filled_count(&self) -> usize {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        (write + self.capacity + 1 - read) % (self.capacity + 1)
    }

    /// Number of empty blocks, exact at the moment of the call.
    pub fn empty_count(&self) -> usize {
        self.capacity - self.filled_count()
    }

    /// Acquire the next writable block. Fails with [`EngineError::Overrun`]
    /// when the queue is full, and with [`EngineError::Protocol`] when a
    /// write slot is already outstanding.
    pub fn write_slot(&self) -> EngineResult<WriteSlot<'_>> {
        if self.empty_count() == 0 {
            return Err(EngineError::Overrun);
        }
        if self.write_pending.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Protocol("write slot already outstanding"));
        }
        Ok(WriteSlot {
            queue: self,
            committed: false,
        })
    }

    /// Acquire the next readable block. Fails with
    /// [`EngineError::Underrun`] when the queue is empty, and with
    /// [`EngineError::Protocol`] when a read slot is already outstanding.
    pub fn read_slot(&self) -> EngineResult<ReadSlot<'_>> {
        if self.filled_count() == 0 {
            return Err(EngineError::Underrun);
        }
        if self.read_pending.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Protocol("read slot already outstanding"));
        }
        Ok(ReadSlot {
            queue: self,
            committed: false,
        })
    }

    /// Block until the queue contains at least one filled block.
    pub fn wait_data(&self) {
        while self.filled_count() == 0 {
            self.data_available.wait();
        }
    }

    /// Block until the queue has space for at least one block.
    pub fn wait_space(&self) {
        while self.empty_count() == 0 {
            self.space_available.wait();
        }
    }

    pub(crate) fn data_event(&self) -> &Event {
        &self.data_available
    }

    pub(crate) fn space_event(&self) -> &Event {
        &self.space_available
    }

    fn slot_ptr(&self, index: usize) -> *mut Block {
        self.slots[index].get()
    }

    fn finish_write(&self) {
        let write = self.write_index.load(Ordering::Relaxed);
        self.write_index
            .store((write + 1) % (self.capacity + 1), Ordering::Release);
        self.write_pending.store(false, Ordering::Release);
        self.data_available.set();
    }

    fn finish_read(&self) {
        let read = self.read_index.load(Ordering::Relaxed);
        // SAFETY: the read guard being committed is the only access to this
        // slot; the writer cannot reach it before the index advances below.
        unsafe { (*self.slot_ptr(read)).clear() };
        self.read_index
            .store((read + 1) % (self.capacity + 1), Ordering::Release);
        self.read_pending.store(false, Ordering::Release);
        self.space_available.set();
    }
}

/// Exclusive handle to the next writable block. Fill it in place and call
/// [`WriteSlot::commit`]; dropping without committing abandons the write
/// and leaves the queue unchanged.
pub struct WriteSlot<'q> {
    queue: &'q BlockQueue,
    committed: bool,
}

impl WriteSlot<'_> {
    /// Publish the written block: advances the write index and wakes the
    /// reader.
    pub fn commit(mut self) {
        self.committed = true;
        self.queue.finish_write();
    }
}

impl Deref for WriteSlot<'_> {
    type Target = Block;

    fn deref(&self) -> &Block {
        let write = self.queue.write_index.load(Ordering::Relaxed);
        // SAFETY: exclusive by the write_pending flag; see BlockQueue.
        unsafe { &*self.queue.slot_ptr(write) }
    }
}

impl DerefMut for WriteSlot<'_> {
    fn deref_mut(&mut self) -> &mut Block {
        let write = self.queue.write_index.load(Ordering::Relaxed);
        // SAFETY: exclusive by the write_pending flag; see BlockQueue.
        unsafe { &mut *self.queue.slot_ptr(write) }
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.queue.write_pending.store(false, Ordering::Release);
        }
    }
}

/// Exclusive handle to the next readable block. Call [`ReadSlot::commit`]
/// to consume it: the slot is cleared, the read index advances and the
/// writer is woken. Dropping without committing leaves the block in the
/// queue.
pub struct ReadSlot<'q> {
    queue: &'q BlockQueue,
    committed: bool,
}

impl ReadSlot<'_> {
    /// Consume the block: clears the slot, advances the read index and
    /// wakes the writer.
    pub fn commit(mut self) {
        self.committed = true;
        self.queue.finish_read();
    }
}

impl Deref for ReadSlot<'_> {
    type Target = Block;

    fn deref(&self) -> &Block {
        let read = self.queue.read_index.load(Ordering::Relaxed);
        // SAFETY: exclusive by the read_pending flag; see BlockQueue.
        unsafe { &*self.queue.slot_ptr(read) }
    }
}

impl DerefMut for ReadSlot<'_> {
    fn deref_mut(&mut self) -> &mut Block {
        let read = self.queue.read_index.load(Ordering::Relaxed);
        // SAFETY: exclusive by the read_pending flag; see BlockQueue.
        unsafe { &mut *self.queue.slot_ptr(read) }
    }
}

impl Drop for ReadSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.queue.read_pending.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn rejects_zero_capacity() {
        assert!(BlockQueue::new(2, 64, 0).is_err());
    }

    #[test]
    fn counts_always_sum_to_capacity() {
        let queue = BlockQueue::new(1, 8, 3).unwrap();
        assert_eq!(queue.filled_count() + queue.empty_count(), 3);
        for fill in 0..3 {
            assert_eq!(queue.filled_count(), fill);
            queue.write_slot().unwrap().commit();
            assert_eq!(queue.filled_count() + queue.empty_count(), 3);
        }
        for drain in 0..3 {
            assert_eq!(queue.empty_count(), drain);
            queue.read_slot().unwrap().commit();
            assert_eq!(queue.filled_count() + queue.empty_count(), 3);
        }
    }

    #[test]
    fn overrun_when_full() {
        let queue = BlockQueue::new(1, 8, 2).unwrap();
        queue.write_slot().unwrap().commit();
        queue.write_slot().unwrap().commit();
        assert!(matches!(queue.write_slot(), Err(EngineError::Overrun)));
    }

    #[test]
    fn exactly_excess_writes_overrun() {
        let queue = BlockQueue::new(1, 8, 2).unwrap();
        let mut overruns = 0;
        for _ in 0..5 {
            match queue.write_slot() {
                Ok(slot) => slot.commit(),
                Err(EngineError::Overrun) => overruns += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(overruns, 3);
        assert_eq!(queue.filled_count(), 2);
    }

    #[test]
    fn underrun_when_empty() {
        let queue = BlockQueue::new(1, 8, 2).unwrap();
        assert!(matches!(queue.read_slot(), Err(EngineError::Underrun)));
    }

    #[test]
    fn second_outstanding_slot_is_a_protocol_error() {
        let queue = BlockQueue::new(1, 8, 2).unwrap();
        let write = queue.write_slot().unwrap();
        assert!(matches!(queue.write_slot(), Err(EngineError::Protocol(_))));
        write.commit();

        let read = queue.read_slot().unwrap();
        assert!(matches!(queue.read_slot(), Err(EngineError::Protocol(_))));
        read.commit();
    }

    #[test]
    fn dropping_a_slot_abandons_it() {
        let queue = BlockQueue::new(1, 8, 2).unwrap();
        drop(queue.write_slot().unwrap());
        assert_eq!(queue.filled_count(), 0);
        // The side is free for a new acquisition afterwards.
        queue.write_slot().unwrap().commit();
        assert_eq!(queue.filled_count(), 1);

        drop(queue.read_slot().unwrap());
        assert_eq!(queue.filled_count(), 1);
    }

    #[test]
    fn commit_read_clears_the_slot() {
        let queue = BlockQueue::new(1, 4, 1).unwrap();
        {
            let mut slot = queue.write_slot().unwrap();
            slot.channel_mut(0).fill(0.5);
            slot.set_last(true);
            slot.commit();
        }
        queue.read_slot().unwrap().commit();
        // The vacated slot comes around again for the writer, cleared.
        let slot = queue.write_slot().unwrap();
        assert!(slot.channel(0).iter().all(|&s| s == 0.0));
        assert!(!slot.is_last());
    }

    #[test]
    fn spsc_round_trip_is_bit_exact_and_ordered() {
        let queue = Arc::new(BlockQueue::new(2, 16, 4).unwrap());
        let rounds = 500usize;

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for round in 0..rounds {
                    queue.wait_space();
                    let mut slot = queue.write_slot().unwrap();
                    for ch in 0..2 {
                        for (i, sample) in slot.channel_mut(ch).iter_mut().enumerate() {
                            *sample = (round * 32 + ch * 16 + i) as f32;
                        }
                    }
                    slot.commit();
                }
            })
        };

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for round in 0..rounds {
                    queue.wait_data();
                    let slot = queue.read_slot().unwrap();
                    for ch in 0..2 {
                        for (i, &sample) in slot.channel(ch).iter().enumerate() {
                            assert_eq!(sample, (round * 32 + ch * 16 + i) as f32);
                        }
                    }
                    slot.commit();
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert_eq!(queue.filled_count(), 0);
    }
}
