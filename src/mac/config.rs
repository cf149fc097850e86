//! Static MAC configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! standard 802.11p node: 6 Mbit/s, CCH/SCH switching on service channel 1,
//! no acknowledgments.

use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::MacError;
use super::timing::{data_bits_per_symbol, service_channel_frequency};
use super::types::{AcParameters, AccessCategory};

/// EDCA parameter overrides, one entry per category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AccessCategoryTable {
    pub background: AcParameters,
    pub best_effort: AcParameters,
    pub video: AcParameters,
    pub voice: AcParameters,
}

impl Default for AccessCategoryTable {
    fn default() -> Self {
        Self {
            background: AccessCategory::Background.default_parameters(),
            best_effort: AccessCategory::BestEffort.default_parameters(),
            video: AccessCategory::Video.default_parameters(),
            voice: AccessCategory::Voice.default_parameters(),
        }
    }
}

impl AccessCategoryTable {
    pub fn get(&self, category: AccessCategory) -> AcParameters {
        match category {
            AccessCategory::Background => self.background,
            AccessCategory::BestEffort => self.best_effort,
            AccessCategory::Video => self.video,
            AccessCategory::Voice => self.voice,
        }
    }

    /// Parameters indexed by `AccessCategory::index()`.
    pub fn as_array(&self) -> [AcParameters; 4] {
        [self.background, self.best_effort, self.video, self.voice]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MacConfig {
    /// Default bit rate in bit/s.
    pub bitrate: u64,
    /// Default transmit power in mW.
    pub tx_power_mw: f64,
    /// Capacity of every category queue; 0 means unbounded.
    pub queue_size: usize,
    pub header_length_bits: u32,
    /// Alternate between CCH and a service channel.
    pub use_service_channel: bool,
    /// Service channel number, 1..=4.
    pub service_channel: u8,
    pub switching_interval_us: u64,
    pub guard_interval_us: u64,
    /// Upper bound of the random per-node offset added to the first switch.
    pub sync_offset_us: u64,
    pub use_acks: bool,
    pub ack_length_bits: u32,
    /// Frames longer than this use the long retry counter.
    pub rts_threshold_bits: u64,
    pub short_retry_limit: u32,
    pub long_retry_limit: u32,
    /// Remembered `(source, packet id)` pairs for duplicate suppression.
    pub duplicate_cache_capacity: usize,
    pub access_categories: AccessCategoryTable,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            bitrate: 6_000_000,
            tx_power_mw: 20.0,
            queue_size: 0,
            header_length_bits: 88,
            use_service_channel: true,
            service_channel: 1,
            switching_interval_us: 50_000,
            guard_interval_us: 4_000,
            sync_offset_us: 0,
            use_acks: false,
            ack_length_bits: 112,
            rts_threshold_bits: 12_000,
            short_retry_limit: 7,
            long_retry_limit: 4,
            duplicate_cache_capacity: 4_096,
            access_categories: AccessCategoryTable::default(),
        }
    }
}

impl MacConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Returns
    /// * `Ok(MacConfig)` if the file was read and parsed
    /// * `Err(String)` with a descriptive error message otherwise
    ///
    /// The result is not validated; `Mac::new` does that.
    pub fn load(config_path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(config_path).map_err(|e| format!("Failed to read config file: {}", e))?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse config file: {}", e))
    }

    pub fn switching_interval(&self) -> Duration {
        Duration::from_micros(self.switching_interval_us)
    }

    pub fn guard_interval(&self) -> Duration {
        Duration::from_micros(self.guard_interval_us)
    }

    /// Check every value the MAC relies on.
    pub fn validate(&self) -> Result<(), MacError> {
        if data_bits_per_symbol(self.bitrate).is_none() {
            return Err(MacError::InvalidBitrate(self.bitrate));
        }
        if !(self.tx_power_mw.is_finite() && self.tx_power_mw > 0.0) {
            return Err(MacError::InvalidTxPower(self.tx_power_mw));
        }
        if service_channel_frequency(self.service_channel).is_none() {
            return Err(MacError::InvalidServiceChannel(self.service_channel));
        }

        for category in AccessCategory::BY_PRIORITY {
            let params = self.access_categories.get(category);
            if params.aifsn == 0 {
                return Err(MacError::InvalidAccessCategory {
                    category,
                    reason: "aifsn must be at least 1".to_string(),
                });
            }
            if params.cw_min > params.cw_max {
                return Err(MacError::InvalidAccessCategory {
                    category,
                    reason: format!("cw-min {} exceeds cw-max {}", params.cw_min, params.cw_max),
                });
            }
        }

        if self.use_service_channel {
            if self.switching_interval_us == 0 {
                return Err(MacError::InvalidTiming("switching interval must be positive".to_string()));
            }
            if self.guard_interval_us >= self.switching_interval_us {
                return Err(MacError::InvalidTiming(format!(
                    "guard interval {} us must be shorter than the switching interval {} us",
                    self.guard_interval_us, self.switching_interval_us
                )));
            }
            if self.sync_offset_us >= self.switching_interval_us {
                return Err(MacError::InvalidTiming(format!(
                    "sync offset {} us must be shorter than the switching interval {} us",
                    self.sync_offset_us, self.switching_interval_us
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = MacConfig::from_toml_str("").unwrap();
        assert_eq!(config, MacConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config = MacConfig::from_toml_str(
            r#"
            bitrate = 12000000
            use-acks = true
            short-retry-limit = 2

            [access-categories.voice]
            aifsn = 3
            cw-min = 7
            cw-max = 15
            "#,
        )
        .unwrap();
        assert_eq!(config.bitrate, 12_000_000);
        assert!(config.use_acks);
        assert_eq!(config.short_retry_limit, 2);
        assert_eq!(config.long_retry_limit, 4);
        assert_eq!(config.access_categories.voice.cw_max, 15);
        assert_eq!(config.access_categories.video, AccessCategory::Video.default_parameters());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_80211p_bitrate() {
        let config = MacConfig {
            bitrate: 11_000_000,
            ..MacConfig::default()
        };
        assert_eq!(config.validate(), Err(MacError::InvalidBitrate(11_000_000)));
    }

    #[test]
    fn rejects_unknown_service_channel() {
        let config = MacConfig {
            service_channel: 5,
            ..MacConfig::default()
        };
        assert_eq!(config.validate(), Err(MacError::InvalidServiceChannel(5)));
    }

    #[test]
    fn rejects_inverted_contention_window() {
        let mut config = MacConfig::default();
        config.access_categories.video.cw_min = 31;
        assert!(matches!(
            config.validate(),
            Err(MacError::InvalidAccessCategory {
                category: AccessCategory::Video,
                ..
            })
        ));
    }

    #[test]
    fn guard_must_fit_in_interval_only_when_switching() {
        let mut config = MacConfig {
            guard_interval_us: 60_000,
            ..MacConfig::default()
        };
        assert!(matches!(config.validate(), Err(MacError::InvalidTiming(_))));
        config.use_service_channel = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_toml_reports_parse_error() {
        let err = MacConfig::from_toml_str("bitrate = \"fast\"").unwrap_err();
        assert!(err.starts_with("Failed to parse config file"));
    }

    #[test]
    fn bundled_sample_matches_defaults_except_acks() {
        let config = MacConfig::from_toml_str(include_str!("../../scenarios/mac.toml")).unwrap();
        assert_eq!(
            config,
            MacConfig {
                use_acks: true,
                ..MacConfig::default()
            }
        );
    }
}
