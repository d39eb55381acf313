// Data-driven session configuration.
//
// Every cadence, timeout, and tuning constant the session layer uses lives
// in `SyncConfig`, loadable from JSON. Missing fields fall back to the
// `Default` values (`#[serde(default)]` on every struct), so a config file
// only needs to name what it changes.
//
// Nested groups:
// - `ReconnectConfig`: joiner backoff after an unintentional host loss.
// - `LodConfig`: distance thresholds for the default entity LOD policy.
//
// See also: `sync.rs` (tick cadence, full-sync period, LOD), `reconnect.rs`
// (backoff), `directory.rs` (palette).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Backoff schedule for automatic rejoin attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Attempts before giving up with `JoinerStatus::Failed`.
    pub max_attempts: u32,
}

/// Distance thresholds for `DistanceLod`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// Entities within this distance of any player are sent at full precision.
    pub near_radius: f32,
    /// Entities beyond this distance from every player are left out of delta
    /// ticks. Full syncs always carry them.
    pub far_radius: f32,
    /// Position quantization step for entities between the two radii.
    pub reduced_precision: f32,
}

/// All session tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Host broadcast cadence.
    pub tick_interval_ms: u64,
    /// Every Nth broadcast is a full sync.
    pub full_sync_interval: u64,
    /// Joiner input uplink rate.
    pub input_rate_hz: u32,
    /// Bound on waiting for channel-open plus `welcome`.
    pub join_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
    /// Player color slots in assignment order. The host takes the first.
    pub palette: Vec<String>,
    pub lod: LodConfig,
    /// Experience multiplier gained per party member beyond the first.
    pub party_bonus_per_member: f32,
    /// Player positions beyond this distance from the origin are rejected.
    pub world_bound: f32,
    /// A joiner heard from again after this much silence is treated as back
    /// from a pause and may re-seed its position once.
    pub resume_gap_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 15_000,
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            near_radius: 40.0,
            far_radius: 120.0,
            reduced_precision: 0.25,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            full_sync_interval: 90,
            input_rate_hz: 30,
            join_timeout_ms: 10_000,
            reconnect: ReconnectConfig::default(),
            palette: [
                "#e74c3c", "#3498db", "#2ecc71", "#f1c40f", "#9b59b6", "#e67e22", "#1abc9c",
                "#ecf0f1",
            ]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
            lod: LodConfig::default(),
            party_bonus_per_member: 0.1,
            world_bound: 10_000.0,
            resume_gap_ms: 2_000,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json_str(&text)?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn resume_gap(&self) -> Duration {
        Duration::from_millis(self.resume_gap_ms)
    }

    /// Minimum spacing between two input uplink messages.
    pub fn input_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.input_rate_hz.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_default() {
        let config = SyncConfig::from_json_str("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config = SyncConfig::from_json_str(
            r#"{"full_sync_interval": 30, "reconnect": {"max_attempts": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.full_sync_interval, 30);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.initial_delay_ms, 1_000);
        assert_eq!(config.tick_interval_ms, 50);
    }

    #[test]
    fn input_interval_matches_rate() {
        let config = SyncConfig::default();
        let interval = config.input_interval();
        assert!(interval > Duration::from_millis(33) && interval < Duration::from_millis(34));
    }
}
