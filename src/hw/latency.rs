use crate::state::Direction;

/// Total latency of one direction in frames: the device-side figure plus
/// what the engine's own playback queueing adds. Capture is delivered as
/// soon as the driver hands it over, so only playback pays for the queue.
pub fn latency_frames(
    direction: Direction,
    device_latency: usize,
    period_frames: usize,
    proc_queue_depth: usize,
) -> usize {
    match direction {
        Direction::Input => device_latency,
        Direction::Output => device_latency + proc_queue_depth * period_frames,
    }
}
