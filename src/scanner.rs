use std::time::Duration;

use btleplug::platform::Adapter;
use log::{info, warn};
use mac_address::MacAddress;

use crate::ble::{DeviceInformation, DiscoveredMower, read_device_information, scan_for_mowers};

/// Looks for supported mowers, connects to each new one and prints a config
/// block for it.
pub struct Scanner {
    adapter: Adapter,
    duration: Duration,
    connect_timeout: Duration,
    configured: Option<MacAddress>,
}

impl Scanner {
    pub fn new(
        adapter: Adapter,
        duration: Duration,
        connect_timeout: Duration,
        configured: Option<MacAddress>,
    ) -> Self {
        Scanner {
            adapter,
            duration,
            connect_timeout,
            configured,
        }
    }

    pub async fn run(&self) -> Result<(), btleplug::Error> {
        info!("Scanning for mowers for {}s", self.duration.as_secs());
        let mowers = scan_for_mowers(&self.adapter, self.duration).await?;

        if mowers.is_empty() {
            warn!("No devices found");
            return Ok(());
        }

        for mower in &mowers {
            if Some(mower.address) == self.configured {
                println!("{} is already configured", mower.address);
                continue;
            }

            match read_device_information(&self.adapter, &mower.address, self.connect_timeout).await
            {
                Ok(device) => {
                    info!(
                        "Found device: {}",
                        device.title().unwrap_or_else(|| mower.address.to_string())
                    );
                    println!("{}", config_snippet(mower, &device));
                }
                Err(err) => println!("{} cannot connect: {}", mower.address, err),
            }
        }
        Ok(())
    }
}

fn config_snippet(mower: &DiscoveredMower, device: &DeviceInformation) -> String {
    let advertised = mower
        .name
        .as_deref()
        .map(|name| name.replace('\0', ""))
        .unwrap_or_default();
    let title = device.title().unwrap_or(advertised);
    let rssi = mower
        .rssi
        .map(|rssi| format!(" (RSSI {rssi})"))
        .unwrap_or_default();

    let mut snippet = format!(
        "# Found {title}{rssi}\n[mower]\naddress = \"{}\"\nname = {}\n",
        mower.address,
        toml::Value::String(title.clone())
    );
    if let Some(model) = &device.model {
        snippet.push_str(&format!("model = {}\n", toml::Value::String(model.clone())));
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mower() -> DiscoveredMower {
        DiscoveredMower {
            address: MacAddress::new([0xC0, 0x11, 0x22, 0x33, 0x44, 0x55]),
            name: Some("Automower\0\0".to_string()),
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_config_snippet_with_model() {
        let device = DeviceInformation {
            manufacturer: Some("Husqvarna".to_string()),
            model: Some("305".to_string()),
        };
        let snippet = config_snippet(&mower(), &device);
        assert!(snippet.starts_with("# Found Husqvarna 305 (RSSI -60)\n"));

        let parsed: toml::Value = toml::de::from_str(&snippet).unwrap();
        assert_eq!(parsed["mower"]["address"].as_str(), Some("C0:11:22:33:44:55"));
        assert_eq!(parsed["mower"]["name"].as_str(), Some("Husqvarna 305"));
        assert_eq!(parsed["mower"]["model"].as_str(), Some("305"));
    }

    #[test]
    fn test_config_snippet_falls_back_to_advertised_name() {
        let snippet = config_snippet(&mower(), &DeviceInformation::default());
        assert!(snippet.starts_with("# Found Automower (RSSI -60)\n"));

        let parsed: toml::Value = toml::de::from_str(&snippet).unwrap();
        assert_eq!(parsed["mower"]["name"].as_str(), Some("Automower"));
        assert!(parsed["mower"].get("model").is_none());
    }
}
