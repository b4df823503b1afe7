use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModesetConfig {
    /// Downgrade steps the link-bandwidth check may take per connector.
    pub link_downgrade_retries: u32,
    /// Polls of the update completion signal before the device is declared wedged.
    pub update_poll_budget: u32,
    /// Polls of the satellite channels before a commit is abandoned.
    pub idle_poll_budget: u32,
    /// Sleep between polls. Zero spins.
    pub poll_interval_micros: u64,
    /// DRAM floor programmed while the bandwidth ledger is pinned.
    pub pinned_dram_floor_kbps: u32,
    pub event_queue_capacity: usize,
    pub display_id_slots: u16,
}

impl Default for ModesetConfig {
    fn default() -> Self {
        Self {
            link_downgrade_retries: 1,
            update_poll_budget: 10_000,
            idle_poll_budget: 10_000,
            poll_interval_micros: 0,
            pinned_dram_floor_kbps: u32::MAX,
            event_queue_capacity: 64,
            display_id_slots: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("modeset config is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
}

impl ModesetConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |field| Err(ConfigError::Zero { field });
        if self.update_poll_budget == 0 {
            return zero("update_poll_budget");
        }
        if self.idle_poll_budget == 0 {
            return zero("idle_poll_budget");
        }
        if self.event_queue_capacity == 0 {
            return zero("event_queue_capacity");
        }
        if self.display_id_slots == 0 {
            return zero("display_id_slots");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_micros)
    }
}
