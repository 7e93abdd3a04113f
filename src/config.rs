//! Engine configuration.
//!
//! Mirrors the teacher's `figment_config` feature: a `serde`-derived config
//! struct with sane defaults, optionally overlaid from a JSON or YAML file
//! via `figment`. No file needs to exist for the engine to start.

use serde::{Deserialize, Serialize};

/// Tunables for a single open database / tree file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Fixed on-disk node size, in bytes. Every node image, including the
    /// header, occupies exactly this many bytes on disk.
    pub node_size: u32,
    /// Compile-time-ish fanout bound `F` for internal nodes (spec §3:
    /// `2 <= N <= F+1`).
    pub fanout: usize,
    /// Total bytes the cachetable may hold pinned + unpinned before it
    /// starts evicting.
    pub cache_limit_bytes: usize,
    /// Initial hash-table bucket count for the cachetable (rounded up to
    /// the next prime in the table, spec §4.4).
    pub cache_table_size_hint: usize,
    /// Directory holding numbered WAL segment files.
    pub log_directory: String,
    /// Size, in bytes, of the logger's in-memory write buffer before a
    /// forced flush (spec §4.5: 1 MiB).
    pub log_buffer_bytes: usize,
    /// Size, in bytes, at which the current log segment is closed and the
    /// next is opened (spec §4.5: 100 MiB).
    pub log_segment_bytes: u64,
    /// Filename extension used for log segments (spec §6: `log<decimal>.<ext>`).
    pub log_segment_extension: String,
}

impl EngineConfig {
    /// Render this configuration as YAML, for an operator dumping the
    /// effective settings a tree was opened with (e.g. next to a crash
    /// report) or seeding a config file from [`EngineConfig::default`].
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Render this configuration as JSON, the other format
    /// [`EngineConfig::load_with_overlay`] accepts.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            node_size: 4 * 1024 * 1024,
            fanout: 16,
            cache_limit_bytes: 256 * 1024 * 1024,
            cache_table_size_hint: 1024,
            log_directory: "log".to_string(),
            log_buffer_bytes: 1024 * 1024,
            log_segment_bytes: 100 * 1024 * 1024,
            log_segment_extension: "tokulog".to_string(),
        }
    }
}

#[cfg(feature = "figment_config")]
mod figment_support {
    use super::EngineConfig;
    use figment::{
        providers::{Format, Json, Serialized, Yaml},
        Figment,
    };
    use std::path::Path;

    impl EngineConfig {
        /// Load configuration starting from [`EngineConfig::default`] and
        /// overlaying a JSON or YAML file, selected by extension, if one is
        /// present at `path`. Missing files are not an error: the defaults
        /// are returned unchanged.
        pub fn load_with_overlay(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
            let path = path.as_ref();
            let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
            if path.exists() {
                figment = match path.extension().and_then(|e| e.to_str()) {
                    Some("json") => figment.merge(Json::file(path)),
                    _ => figment.merge(Yaml::file(path)),
                };
            }
            figment.extract()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = EngineConfig::default();
        assert!(cfg.fanout >= 2);
        assert!(cfg.log_buffer_bytes < cfg.log_segment_bytes as usize);
    }

    #[cfg(feature = "figment_config")]
    #[test]
    fn missing_overlay_file_falls_back_to_defaults() {
        let cfg = EngineConfig::load_with_overlay("/nonexistent/path/config.yaml").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn yaml_and_json_dumps_round_trip_through_serde() {
        let cfg = EngineConfig::default();
        let yaml = cfg.to_yaml().unwrap();
        assert_eq!(serde_yaml::from_str::<EngineConfig>(&yaml).unwrap(), cfg);
        let json = cfg.to_json().unwrap();
        assert_eq!(serde_json::from_str::<EngineConfig>(&json).unwrap(), cfg);
    }
}
