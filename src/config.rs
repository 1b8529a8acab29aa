//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Everything `Engine::init` needs to prepare a driver. Hosts typically
/// deserialize this from a session file; all fields have defaults so a
/// partial document is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Activation mask over the driver's input channels.
    pub input_channels: Vec<bool>,
    /// Activation mask over the driver's output channels.
    pub output_channels: Vec<bool>,
    /// Frames per period; `None` uses the driver's preferred size.
    pub buffer_frames: Option<usize>,
    /// Depth of the processing queues. 0 selects realtime processing.
    pub proc_queue_depth: usize,
    /// Depth of the done queues. 0 disables the done path.
    pub done_queue_depth: usize,
    /// Sample rate to negotiate; `None` keeps the driver's current rate.
    pub sample_rate: Option<f64>,
    /// Silent periods written between a stop request and the device stop.
    pub stop_switches: usize,
    /// Watchdog timeout while running.
    pub watchdog_timeout_ms: u64,
    /// Route the processed capture (instead of the raw driver-side copy)
    /// into the done-capture queue.
    pub capture_done_processed: bool,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            input_channels: vec![true, true],
            output_channels: vec![true, true],
            buffer_frames: None,
            proc_queue_depth: 8,
            done_queue_depth: 0,
            sample_rate: None,
            stop_switches: 4,
            watchdog_timeout_ms: 500,
            capture_done_processed: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub(crate) fn active_indices(mask: &[bool]) -> Vec<usize> {
        mask.iter()
            .enumerate()
            .filter_map(|(index, &active)| active.then_some(index))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "proc_queue_depth": 2, "done_queue_depth": 8 }"#).unwrap();
        assert_eq!(config.proc_queue_depth, 2);
        assert_eq!(config.done_queue_depth, 8);
        assert_eq!(config.stop_switches, 4);
        assert_eq!(config.watchdog_timeout_ms, 500);
        assert_eq!(config.input_channels, vec![true, true]);
    }

    #[test]
    fn round_trips_through_json() {
        let mut config = EngineConfig::default();
        config.buffer_frames = Some(64);
        config.sample_rate = Some(44_100.0);
        let text = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.buffer_frames, Some(64));
        assert_eq!(back.sample_rate, Some(44_100.0));
    }

    #[test]
    fn mask_to_indices() {
        assert_eq!(
            EngineConfig::active_indices(&[true, false, true, true]),
            vec![0, 2, 3]
        );
        assert!(EngineConfig::active_indices(&[]).is_empty());
    }
}
