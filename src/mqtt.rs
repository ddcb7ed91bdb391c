use std::time::Duration;

use log::{debug, error, info, warn};
use mac_address::MacAddress;
use rumqttc::{LastWill, MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::activity::{LawnMowerActivity, lawn_mower_activity};
use crate::config::{self, MowerConfig};
use crate::messages::{MowerCommand, MqttAnnouncement};
use crate::session::{MowerActivity, MowerState, Snapshot};

const MANUFACTURER: &str = "Husqvarna";
const PAYLOAD_AVAILABLE: &str = "online";
const PAYLOAD_NOT_AVAILABLE: &str = "offline";

/// Identity of the mower as Home Assistant sees it.
#[derive(Debug, Clone)]
pub struct MowerIdentity {
    pub address: MacAddress,
    pub name: String,
    pub model: String,
    pub serial: String,
}

impl MowerIdentity {
    pub fn from_config(config: &MowerConfig) -> Self {
        MowerIdentity {
            address: config.address,
            name: config.name().to_string(),
            model: config.model().to_string(),
            serial: config.serial(),
        }
    }

    fn object_id(&self) -> String {
        sanitize_name(&format!("automower_{}", self.address))
    }

    fn lawn_mower_unique_id(&self) -> String {
        format!("automower{}_{}", self.model, self.address)
    }

    fn battery_unique_id(&self) -> String {
        format!("automower_{}_{}_battery_percent", self.model, self.address)
    }
}

#[derive(Debug, Serialize)]
struct DeviceInfo<'a> {
    identifiers: [&'a str; 1],
    manufacturer: &'static str,
    model: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct LawnMowerDiscovery<'a> {
    name: Option<&'a str>,
    unique_id: String,
    availability_topic: String,
    activity_state_topic: String,
    activity_value_template: &'static str,
    start_mowing_command_topic: String,
    pause_command_topic: String,
    dock_command_topic: String,
    device: DeviceInfo<'a>,
}

#[derive(Debug, Serialize)]
struct BatterySensorDiscovery<'a> {
    name: &'static str,
    unique_id: String,
    availability_topic: String,
    state_topic: String,
    value_template: &'static str,
    device_class: &'static str,
    state_class: &'static str,
    unit_of_measurement: &'static str,
    device: DeviceInfo<'a>,
}

/// Retained state document the entities read their values from.
#[derive(Debug, Serialize, PartialEq)]
pub struct MowerStateMessage {
    pub activity: Option<LawnMowerActivity>,
    pub battery_level: Option<u8>,
    pub mower_activity: Option<MowerActivity>,
    pub mower_state: Option<MowerState>,
}

impl MowerStateMessage {
    pub fn from_snapshot(snapshot: Option<&Snapshot>) -> Self {
        MowerStateMessage {
            activity: lawn_mower_activity(snapshot),
            battery_level: snapshot.and_then(|s| s.battery_level),
            mower_activity: snapshot.and_then(|s| s.activity),
            mower_state: snapshot.and_then(|s| s.state),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    topic_path: String,
    discovery_prefix: String,
    mower: MowerIdentity,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig, mower: MowerIdentity) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"automower-ble".to_string())
            .to_string();
        let topic_path = config
            .topic_path
            .clone()
            .unwrap_or("automower".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id,
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));
        mqttoptions.set_last_will(LastWill::new(
            availability_topic(&topic_path, &mower),
            PAYLOAD_NOT_AVAILABLE,
            QoS::AtLeastOnce,
            true,
        ));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                topic_path,
                discovery_prefix: config
                    .discovery_prefix
                    .clone()
                    .unwrap_or("homeassistant".to_string()),
                mower,
            },
            eventloop,
        )
    }

    fn base_topic(&self) -> String {
        format!("{}/{}", self.topic_path, self.mower.object_id())
    }

    fn state_topic(&self) -> String {
        format!("{}/state", self.base_topic())
    }

    fn command_topic(&self, command: MowerCommand) -> String {
        format!("{}/{}", self.base_topic(), command.topic_suffix())
    }

    fn status_topic(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }

    pub fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        let mut filters: Vec<_> = MowerCommand::ALL
            .into_iter()
            .map(|command| SubscribeFilter::new(self.command_topic(command), QoS::AtMostOnce))
            .collect();
        filters.push(SubscribeFilter::new(self.status_topic(), QoS::AtMostOnce));
        self.client.try_subscribe_many(filters)?;

        Ok(())
    }

    fn lawn_mower_discovery(&self) -> (String, String) {
        let mower = &self.mower;
        let config = LawnMowerDiscovery {
            // Entity takes the device name
            name: None,
            unique_id: mower.lawn_mower_unique_id(),
            availability_topic: availability_topic(&self.topic_path, mower),
            activity_state_topic: self.state_topic(),
            activity_value_template: "{{ value_json.activity }}",
            start_mowing_command_topic: self.command_topic(MowerCommand::StartMowing),
            pause_command_topic: self.command_topic(MowerCommand::Pause),
            dock_command_topic: self.command_topic(MowerCommand::Dock),
            device: self.device_info(),
        };
        (
            format!("{}/lawn_mower/{}/config", self.discovery_prefix, mower.object_id()),
            serde_json::to_string(&config).unwrap_or_default(),
        )
    }

    fn battery_discovery(&self) -> (String, String) {
        let mower = &self.mower;
        let config = BatterySensorDiscovery {
            name: "Battery",
            unique_id: mower.battery_unique_id(),
            availability_topic: availability_topic(&self.topic_path, mower),
            state_topic: self.state_topic(),
            value_template: "{{ value_json.battery_level }}",
            device_class: "battery",
            state_class: "measurement",
            unit_of_measurement: "%",
            device: self.device_info(),
        };
        (
            format!(
                "{}/sensor/{}_battery_percent/config",
                self.discovery_prefix,
                mower.object_id()
            ),
            serde_json::to_string(&config).unwrap_or_default(),
        )
    }

    fn device_info(&self) -> DeviceInfo<'_> {
        DeviceInfo {
            identifiers: [self.mower.serial.as_str()],
            manufacturer: MANUFACTURER,
            model: &self.mower.model,
            name: &self.mower.name,
        }
    }

    /// Publishes the retained discovery configs for the lawn mower and its
    /// battery sensor.
    pub fn announce_entities(&self) -> Result<(), rumqttc::ClientError> {
        info!("Announcing {} to Home Assistant", self.mower.name);
        for (topic, payload) in [self.lawn_mower_discovery(), self.battery_discovery()] {
            debug!("Publishing discovery config on {}", topic);
            self.client
                .try_publish(topic, QoS::AtLeastOnce, true, payload)?;
        }
        Ok(())
    }

    /// Never waits on the request queue. While the broker is unreachable the
    /// queue fills up and further states are dropped; they are retained
    /// snapshots, so the next one supersedes them.
    pub fn publish_state(
        &self,
        snapshot: Option<&Snapshot>,
        available: bool,
    ) -> Result<(), rumqttc::ClientError> {
        let message = MowerStateMessage::from_snapshot(snapshot);
        debug!("Publishing state {:?} (available: {})", message, available);
        self.client.try_publish(
            self.state_topic(),
            QoS::AtMostOnce,
            true,
            serde_json::to_string(&message).unwrap_or_default(),
        )?;
        self.publish_availability(available)
    }

    pub fn publish_availability(&self, available: bool) -> Result<(), rumqttc::ClientError> {
        let payload = if available {
            PAYLOAD_AVAILABLE
        } else {
            PAYLOAD_NOT_AVAILABLE
        };
        self.client.try_publish(
            availability_topic(&self.topic_path, &self.mower),
            QoS::AtLeastOnce,
            true,
            payload,
        )
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<MqttAnnouncement>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let message = if p.topic == self.status_topic() {
                            if p.payload.as_ref() != PAYLOAD_AVAILABLE.as_bytes() {
                                continue;
                            }
                            info!("Home Assistant is online");
                            if let Err(err) = self.announce_entities() {
                                error!("Error announcing entities: {:?}", err);
                            }
                            MqttAnnouncement::HomeAssistantOnline
                        } else if let Some(command) = MowerCommand::from_topic(&p.topic) {
                            MqttAnnouncement::Command(command)
                        } else {
                            warn!("Ignoring message on unexpected topic {}", p.topic);
                            continue;
                        };

                        if let Err(err) = tx.send(message) {
                            error!("Error announcing {:?}: {:?}", message, err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe() {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                        if let Err(err) = self.announce_entities() {
                            error!("Error announcing entities: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.try_disconnect()
    }
}

fn availability_topic(topic_path: &str, mower: &MowerIdentity) -> String {
    format!("{}/{}/availability", topic_path, mower.object_id())
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_and_eventloop() -> (MqttClient, rumqttc::EventLoop) {
        let config = config::MqttConfig {
            host: "localhost".to_string(),
            port: None,
            username: None,
            password: None,
            publisher_id: None,
            topic_path: None,
            discovery_prefix: None,
            keep_alive_seconds: None,
        };
        let mower = MowerIdentity {
            address: MacAddress::new([0xC0, 0x11, 0x22, 0x33, 0x44, 0x55]),
            name: "Garden".to_string(),
            model: "305".to_string(),
            serial: "1233445".to_string(),
        };
        MqttClient::new(&config, mower)
    }

    fn client() -> MqttClient {
        client_and_eventloop().0
    }

    #[test]
    fn test_sanitize_name() {
        let name = "Test's Device 123";
        let sanitized = super::sanitize_name(name);
        assert_eq!(sanitized, "test_s_device_123");
    }

    #[tokio::test]
    async fn test_topics() {
        let client = client();
        assert_eq!(
            client.state_topic(),
            "automower/automower_c0_11_22_33_44_55/state"
        );
        assert_eq!(
            client.command_topic(MowerCommand::StartMowing),
            "automower/automower_c0_11_22_33_44_55/start_mowing"
        );
        assert_eq!(
            MowerCommand::from_topic(&client.command_topic(MowerCommand::Pause)),
            Some(MowerCommand::Pause)
        );
        assert_eq!(client.status_topic(), "homeassistant/status");
    }

    #[tokio::test]
    async fn test_lawn_mower_discovery() {
        let (topic, payload) = client().lawn_mower_discovery();
        assert_eq!(
            topic,
            "homeassistant/lawn_mower/automower_c0_11_22_33_44_55/config"
        );
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["unique_id"], "automower305_C0:11:22:33:44:55");
        assert_eq!(json["name"], serde_json::Value::Null);
        assert_eq!(
            json["dock_command_topic"],
            "automower/automower_c0_11_22_33_44_55/dock"
        );
        assert_eq!(json["device"]["identifiers"][0], "1233445");
        assert_eq!(json["device"]["manufacturer"], "Husqvarna");
    }

    #[tokio::test]
    async fn test_battery_discovery() {
        let (topic, payload) = client().battery_discovery();
        assert_eq!(
            topic,
            "homeassistant/sensor/automower_c0_11_22_33_44_55_battery_percent/config"
        );
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["unique_id"], "automower_305_C0:11:22:33:44:55_battery_percent");
        assert_eq!(json["device_class"], "battery");
        assert_eq!(json["state_class"], "measurement");
        assert_eq!(json["unit_of_measurement"], "%");
    }

    #[test]
    fn test_full_request_queue_does_not_block() {
        // Keep the event loop alive but never poll it, as during a broker outage.
        let (client, _eventloop) = client_and_eventloop();

        let mut dropped = 0;
        for _ in 0..20 {
            if client.publish_state(None, true).is_err() {
                dropped += 1;
            }
        }
        assert!(dropped > 0);

        assert!(matches!(
            client.publish_availability(false),
            Err(rumqttc::ClientError::TryRequest(_))
        ));
        assert!(client.subscribe().is_err());
        assert!(client.announce_entities().is_err());
        assert!(client.disconnect().is_err());
    }

    #[test]
    fn test_state_message() {
        let snapshot = Snapshot {
            battery_level: Some(80),
            activity: Some(MowerActivity::Mowing),
            state: Some(MowerState::InOperation),
        };
        let json = serde_json::to_value(MowerStateMessage::from_snapshot(Some(&snapshot))).unwrap();
        assert_eq!(json["activity"], "mowing");
        assert_eq!(json["battery_level"], 80);
        assert_eq!(json["mower_activity"], "mowing");
        assert_eq!(json["mower_state"], "inOperation");

        let empty = MowerStateMessage::from_snapshot(None);
        assert_eq!(empty.activity, None);
        assert_eq!(empty.battery_level, None);
    }
}
