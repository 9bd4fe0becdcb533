//! Run configuration.
//!
//! A [`RunConfig`] is stored as JSON. Every field has a default, so a partial
//! file only overrides what it names; values outside their allowed range are
//! clamped on load. The config of a run is also recorded in its log's run
//! metadata, so reopening a log restores it.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const GRID_SIZE_RANGE: (u32, u32) = (10, 100);
pub const INITIAL_COUNT_MAX: u32 = 100;
pub const SPEED_RANGE: (f64, f64) = (0.1, 2.0);
pub const FPS_RANGE: (u32, u32) = (5, 60);

/// Parameters of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub grid_width: u32,
    pub grid_height: u32,
    /// Nutrient level every grid cell starts with.
    pub initial_nutrient: f32,
    /// Initial population per kind name.
    pub initial_counts: BTreeMap<String, u32>,
    /// Playback speed multiplier for live ticking.
    pub simulation_speed: f64,
    pub fps: u32,
    pub seed: u64,
    /// Snapshots are handed to the background writer in batches of this many.
    pub flush_interval: u64,
    pub zstd_level: i32,
    pub sync_writes: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        let initial_counts = [
            ("producer", 15),
            ("herbivore", 10),
            ("carnivore", 10),
            ("omnivore", 3),
        ]
        .into_iter()
        .map(|(kind, count)| (kind.to_owned(), count))
        .collect();

        Self {
            grid_width: 20,
            grid_height: 20,
            initial_nutrient: 1.0,
            initial_counts,
            simulation_speed: 1.0,
            fps: 15,
            seed: 0,
            flush_interval: 16,
            zstd_level: 3,
            sync_writes: true,
        }
    }
}

impl RunConfig {
    /// Load a config file, or the defaults if `path` does not exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: RunConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config.clamped())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Rebuild a config from recorded run metadata, filling gaps with defaults.
    pub fn from_value(value: &serde_json::Value) -> Self {
        match serde_json::from_value::<RunConfig>(value.clone()) {
            Ok(config) => config.clamped(),
            Err(e) => {
                tracing::warn!(error = %e, "recorded config unreadable, using defaults");
                Self::default()
            }
        }
    }

    /// This config with every value forced into its allowed range.
    pub fn clamped(mut self) -> Self {
        self.grid_width = self.grid_width.clamp(GRID_SIZE_RANGE.0, GRID_SIZE_RANGE.1);
        self.grid_height = self.grid_height.clamp(GRID_SIZE_RANGE.0, GRID_SIZE_RANGE.1);
        for count in self.initial_counts.values_mut() {
            *count = (*count).min(INITIAL_COUNT_MAX);
        }
        self.simulation_speed = clamp_speed(self.simulation_speed);
        self.fps = self.fps.clamp(FPS_RANGE.0, FPS_RANGE.1);
        self.flush_interval = self.flush_interval.max(1);
        self.zstd_level = self.zstd_level.clamp(1, 22);
        self
    }

    /// Wall-clock time between live ticks. Out-of-range `fps` and
    /// `simulation_speed` are clamped first.
    pub fn tick_interval(&self) -> Duration {
        let fps = self.fps.clamp(FPS_RANGE.0, FPS_RANGE.1);
        let speed = clamp_speed(self.simulation_speed);
        Duration::from_secs_f64(1.0 / (f64::from(fps) * speed))
    }

    pub fn initial_count(&self, kind: &str) -> u32 {
        self.initial_counts.get(kind).copied().unwrap_or(0)
    }
}

fn clamp_speed(speed: f64) -> f64 {
    if speed.is_finite() {
        speed.clamp(SPEED_RANGE.0, SPEED_RANGE.1)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "grid_width": 500, "fps": 1, "seed": 9 }"#).unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.grid_width, 100);
        assert_eq!(config.grid_height, 20);
        assert_eq!(config.fps, 5);
        assert_eq!(config.seed, 9);
        assert_eq!(config.initial_count("omnivore"), 3);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::load(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn malformed_file_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = RunConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.json"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = RunConfig::default();
        config.initial_counts.insert("herbivore".to_owned(), 500);
        config.simulation_speed = 0.0;
        config.save(&path).unwrap();

        let loaded = RunConfig::load(&path).unwrap();
        assert_eq!(loaded.initial_count("herbivore"), 100);
        assert_eq!(loaded.simulation_speed, 0.1);
    }

    #[test]
    fn tick_interval_scales_with_speed() {
        let config = RunConfig {
            fps: 10,
            simulation_speed: 2.0,
            ..RunConfig::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
    }

    #[test]
    fn tick_interval_of_an_unclamped_config() {
        let stalled = RunConfig {
            fps: 0,
            simulation_speed: f64::NAN,
            ..RunConfig::default()
        };
        assert_eq!(stalled.tick_interval(), Duration::from_millis(200));

        let racing = RunConfig {
            fps: 1_000,
            simulation_speed: 50.0,
            ..RunConfig::default()
        };
        assert_eq!(racing.tick_interval(), racing.clone().clamped().tick_interval());
    }
}
