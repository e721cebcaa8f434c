// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! Device configuration (`SPEC_FULL.md` §1 Expansion: "ambient stack the
//! distilled spec omits"). Grounded in the teacher crate's own
//! `toml`/`serde` dependency pair (`Cargo.toml`: `serde = { features =
//! ["derive"] }`, `toml = "0.5"`) -- the teacher loads its runtime
//! configuration from a TOML file the same way; this module is that
//! pattern applied to the handful of knobs this firmware core actually
//! needs at startup (flash geometry, PBKDF2 cost, the coin policy
//! defaults), rather than anything hardware-specific (clock speed, pin
//! muxing), which stays out of scope (`spec.md` §1 Non-goals).

use serde::{Deserialize, Serialize};

use crate::crypto::wrap;

/// Top-level device configuration, loaded from a TOML file by
/// `src/bin/simulator.rs` and otherwise baked into firmware at build time
/// on real hardware.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub flash: FlashConfig,
    pub pbkdf2: Pbkdf2Config,
    pub policy_defaults: PolicyDefaults,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            flash: FlashConfig::default(),
            pbkdf2: Pbkdf2Config::default(),
            policy_defaults: PolicyDefaults::default(),
        }
    }
}

impl DeviceConfig {
    /// Parses a `DeviceConfig` from TOML text (`SPEC_FULL.md` §1: "config
    /// via serde+toml").
    pub fn from_toml_str(text: &str) -> Result<DeviceConfig, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Flash geometry (`spec.md` §3 "3 sectors, wear-levelled"). Real
/// hardware fixes these at the linker-script level; the simulator reads
/// them from config so it can model different sector sizes.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    pub sector_size: usize,
}

impl Default for FlashConfig {
    fn default() -> Self {
        FlashConfig { sector_size: crate::storage::layout::DEFAULT_SECTOR_LEN }
    }
}

/// PBKDF2 cost parameters (`spec.md` §4.1 "dual-round PBKDF2-HMAC-SHA256",
/// `crypto::kdf`). Exposed as config so the simulator can run with a
/// lower iteration count in tests without touching the production
/// constant compiled into hardware firmware.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Pbkdf2Config {
    pub iterations: u32,
}

impl Default for Pbkdf2Config {
    fn default() -> Self {
        Pbkdf2Config { iterations: wrap::LEGACY_PBKDF2_ITERATIONS }
    }
}

/// Which policies (`crate::policy::PolicyId`) a freshly-initialized
/// device ships with enabled.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDefaults {
    pub exchange_enabled: bool,
    pub advanced_mode_enabled: bool,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        PolicyDefaults { exchange_enabled: false, advanced_mode_enabled: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = DeviceConfig::default();
        let text = config.to_toml_string().unwrap();
        let parsed = DeviceConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.flash.sector_size, config.flash.sector_size);
        assert_eq!(parsed.pbkdf2.iterations, config.pbkdf2.iterations);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let parsed = DeviceConfig::from_toml_str("[pbkdf2]\niterations = 50000\n").unwrap();
        assert_eq!(parsed.pbkdf2.iterations, 50_000);
        assert_eq!(parsed.flash.sector_size, FlashConfig::default().sector_size);
    }
}
