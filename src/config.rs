// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format};
use figment::{providers::Toml, Figment};

use serde::{Deserialize, Serialize};

use std::path::Path;
use std::time::Duration;

use tracing::{event, Level};

/// Runtime tunables for the renter core. Everything here has a sane
/// default; a TOML file and `CIRRUS_`-prefixed environment variables can
/// override individual fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    // Memory
    pub memory_pool_bytes: u64,

    // Repair
    pub remote_repair_threshold: f64,
    pub max_consecutive_chunk_repairs: usize,
    pub rebuild_chunk_heap_interval_secs: u64,
    pub file_repair_interval_secs: u64,
    pub stuck_loop_interval_secs: u64,

    // Workers
    pub download_cooldown_base_ms: u64,
    pub upload_cooldown_base_ms: u64,
    pub max_cooldown_penalty: u32,

    // Downloads
    pub default_overdrive: usize,
    pub default_priority: u64,
    pub default_latency_target_ms: u64,
    pub latency_stagger_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            memory_pool_bytes: 512 * 1024 * 1024,

            remote_repair_threshold: 0.95,
            max_consecutive_chunk_repairs: 20,
            rebuild_chunk_heap_interval_secs: 15,
            file_repair_interval_secs: 300,
            stuck_loop_interval_secs: 30,

            download_cooldown_base_ms: 3000,
            upload_cooldown_base_ms: 3000,
            max_cooldown_penalty: 10,

            default_overdrive: 3,
            default_priority: 5,
            default_latency_target_ms: 25_000,
            latency_stagger_ms: 25,
        }
    }
}

impl Settings {
    pub fn rebuild_chunk_heap_interval(&self) -> Duration {
        Duration::from_secs(self.rebuild_chunk_heap_interval_secs)
    }

    pub fn file_repair_interval(&self) -> Duration {
        Duration::from_secs(self.file_repair_interval_secs)
    }

    pub fn stuck_loop_interval(&self) -> Duration {
        Duration::from_secs(self.stuck_loop_interval_secs)
    }

    pub fn download_cooldown_base(&self) -> Duration {
        Duration::from_millis(self.download_cooldown_base_ms)
    }

    pub fn upload_cooldown_base(&self) -> Duration {
        Duration::from_millis(self.upload_cooldown_base_ms)
    }

    pub fn default_latency_target(&self) -> Duration {
        Duration::from_millis(self.default_latency_target_ms)
    }
}

/// Loads settings from an optional TOML file, then applies `CIRRUS_`
/// environment overrides. Unparseable overrides fall back to defaults with
/// a warning rather than refusing to start.
pub fn load_settings(config_path: Option<&Path>) -> Settings {
    let mut figment = Figment::from(figment::providers::Serialized::defaults(Settings::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    figment = figment.merge(Env::prefixed("CIRRUS_"));

    match figment.extract() {
        Ok(settings) => settings,
        Err(e) => {
            event!(Level::WARN, error = %e, "Failed to parse settings, using defaults.");
            Settings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let s = Settings::default();
        assert!(s.memory_pool_bytes > 0);
        assert!(s.remote_repair_threshold <= 1.0);
        assert!(s.max_consecutive_chunk_repairs > 0);
        assert_eq!(s.download_cooldown_base(), Duration::from_millis(3000));
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "memory_pool_bytes = 1024").unwrap();
        writeln!(file, "default_overdrive = 1").unwrap();

        let settings = load_settings(Some(file.path()));
        assert_eq!(settings.memory_pool_bytes, 1024);
        assert_eq!(settings.default_overdrive, 1);
        // Untouched fields keep their defaults.
        assert_eq!(
            settings.max_consecutive_chunk_repairs,
            Settings::default().max_consecutive_chunk_repairs
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = load_settings(Some(Path::new("/nonexistent/cirrus.toml")));
        assert_eq!(settings, Settings::default());
    }
}
