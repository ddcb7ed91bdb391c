use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use btleplug::api::bleuuid::uuid_from_u16;
use mac_address::MacAddress;
use serde_derive::Deserialize;
use uuid::Uuid;

use crate::coordinator::{CoordinatorSettings, DEFAULT_POLL_INTERVAL};

/// Standard Battery Level characteristic.
pub const BATTERY_LEVEL_CHARACTERISTIC: u16 = 0x2A19;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub mower: Option<MowerConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub discovery_prefix: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MowerConfig {
    pub address: MacAddress,
    pub name: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub poll_interval_seconds: Option<u64>,
    pub connect_timeout_seconds: Option<u64>,
    pub fetch_timeout_seconds: Option<u64>,
    pub scan_seconds: Option<u64>,
    pub shutdown_grace_seconds: Option<u64>,
    pub gatt: GattConfig,
}

/// Characteristics the session reads and writes.
#[derive(Deserialize, Debug, Clone)]
pub struct GattConfig {
    pub battery_level: Option<Uuid>,
    pub activity: Uuid,
    pub state: Uuid,
    pub command: Uuid,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

impl MowerConfig {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or("Automower")
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.model())
    }

    /// Falls back to the address when no serial number is configured.
    pub fn serial(&self) -> String {
        self.serial
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_seconds.unwrap_or(10))
    }

    pub fn coordinator_settings(&self) -> anyhow::Result<CoordinatorSettings> {
        anyhow::ensure!(
            self.poll_interval_seconds != Some(0),
            "mower.poll_interval_seconds must be at least 1"
        );

        let defaults = CoordinatorSettings::default();
        Ok(CoordinatorSettings {
            poll_interval: self
                .poll_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            connect_timeout: self
                .connect_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            fetch_timeout: self
                .fetch_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            shutdown_grace: self
                .shutdown_grace_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        })
    }
}

impl GattConfig {
    pub fn battery_level(&self) -> Uuid {
        self.battery_level
            .unwrap_or_else(|| uuid_from_u16(BATTERY_LEVEL_CHARACTERISTIC))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [mqtt]
        host = "localhost"
        port = 1883
        username = "user"
        password = "pass"

        [mower]
        address = "C0:11:22:33:44:55"
        model = "305"
        poll_interval_seconds = 30

        [mower.gatt]
        activity = "98bd2a01-0b0e-421a-84e5-ddbf75dc6de4"
        state = "98bd2a02-0b0e-421a-84e5-ddbf75dc6de4"
        command = "98bd2a03-0b0e-421a-84e5-ddbf75dc6de4"
    "#;

    #[test]
    fn test_config() {
        let config: AppConfig = toml::de::from_str(CONFIG).unwrap();
        assert!(config.mqtt.host == "localhost");
        assert_eq!(config.mqtt.discovery_prefix, None);

        let mower = config.mower.unwrap();
        assert_eq!(
            mower.address,
            MacAddress::new([0xC0, 0x11, 0x22, 0x33, 0x44, 0x55])
        );
        assert_eq!(mower.model(), "305");
        assert_eq!(mower.name(), "305");
        assert_eq!(mower.serial(), "C0:11:22:33:44:55");
    }

    #[test]
    fn test_coordinator_settings() {
        let config: AppConfig = toml::de::from_str(CONFIG).unwrap();
        let settings = config.mower.unwrap().coordinator_settings().unwrap();
        assert_eq!(settings.poll_interval, Duration::from_secs(30));
        assert_eq!(settings.connect_timeout, Duration::from_secs(30));
        assert_eq!(settings.fetch_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let config: AppConfig =
            toml::de::from_str(&CONFIG.replace("poll_interval_seconds = 30", "poll_interval_seconds = 0"))
                .unwrap();
        let err = config.mower.unwrap().coordinator_settings().unwrap_err();
        assert!(err.to_string().contains("poll_interval_seconds"));
    }

    #[test]
    fn test_battery_characteristic_default() {
        let config: AppConfig = toml::de::from_str(CONFIG).unwrap();
        let gatt = config.mower.unwrap().gatt;
        assert_eq!(
            gatt.battery_level().to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_example_config() {
        let config: AppConfig = toml::de::from_str(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.mqtt.port, Some(1883));
        assert_eq!(config.mower.unwrap().model(), "305");
    }

    #[test]
    fn test_mower_section_is_optional() {
        let config: AppConfig = toml::de::from_str(
            r#"
            [mqtt]
            host = "broker"
            "#,
        )
        .unwrap();
        assert!(config.mower.is_none());
    }
}
