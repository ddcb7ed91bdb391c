use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use mac_address::MacAddress;
use serde_derive::Serialize;

use crate::error::TransportError;

/// What the mower is physically doing.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MowerActivity {
    #[serde(rename = "none")]
    Idle,
    Charging,
    GoingOut,
    Mowing,
    GoingHome,
    Parked,
    StoppedInGarden,
}

/// Operating state reported by the mower controller.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MowerState {
    Off,
    WaitForSafetyPin,
    Stopped,
    FatalError,
    PendingStart,
    Paused,
    InOperation,
    Restricted,
    Error,
    CheckSafety,
    Unknown,
}

const ACTIVITIES: [(MowerActivity, &str); 7] = [
    (MowerActivity::Idle, "none"),
    (MowerActivity::Charging, "charging"),
    (MowerActivity::GoingOut, "goingOut"),
    (MowerActivity::Mowing, "mowing"),
    (MowerActivity::GoingHome, "goingHome"),
    (MowerActivity::Parked, "parked"),
    (MowerActivity::StoppedInGarden, "stoppedInGarden"),
];

const STATES: [(MowerState, &str); 11] = [
    (MowerState::Off, "off"),
    (MowerState::WaitForSafetyPin, "waitForSafetyPin"),
    (MowerState::Stopped, "stopped"),
    (MowerState::FatalError, "fatalError"),
    (MowerState::PendingStart, "pendingStart"),
    (MowerState::Paused, "paused"),
    (MowerState::InOperation, "inOperation"),
    (MowerState::Restricted, "restricted"),
    (MowerState::Error, "error"),
    (MowerState::CheckSafety, "checkSafety"),
    (MowerState::Unknown, "unknown"),
];

impl MowerActivity {
    /// Decodes the one-byte code used on the wire. Unknown codes yield `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        ACTIVITIES.get(code as usize).map(|(activity, _)| *activity)
    }

    pub fn as_str(&self) -> &'static str {
        ACTIVITIES
            .iter()
            .find(|(activity, _)| activity == self)
            .map(|(_, name)| *name)
            .unwrap_or("none")
    }
}

impl MowerState {
    /// Decodes the one-byte code used on the wire. Unknown codes yield `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        STATES.get(code as usize).map(|(state, _)| *state)
    }

    pub fn as_str(&self) -> &'static str {
        STATES
            .iter()
            .find(|(state, _)| state == self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }
}

impl fmt::Display for MowerActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for MowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MowerActivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ACTIVITIES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(activity, _)| *activity)
            .ok_or_else(|| format!("unknown mower activity: {s}"))
    }
}

impl FromStr for MowerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STATES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(state, _)| *state)
            .ok_or_else(|| format!("unknown mower state: {s}"))
    }
}

/// Latest known device state. Replaced as a whole after every successful poll.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub battery_level: Option<u8>,
    pub activity: Option<MowerActivity>,
    pub state: Option<MowerState>,
}

/// A stateful connection to the mower.
///
/// Fetches return `Ok(None)` when the device answered but had nothing usable,
/// and `Err` only for transport failures.
#[async_trait]
pub trait MowerSession: Send + Sync {
    type Device: Send;

    async fn is_connected(&self) -> bool;
    async fn connect(&mut self, device: Self::Device) -> Result<bool, TransportError>;
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    async fn battery_level(&mut self) -> Result<Option<u8>, TransportError>;
    async fn activity(&mut self) -> Result<Option<MowerActivity>, TransportError>;
    async fn state(&mut self) -> Result<Option<MowerState>, TransportError>;

    async fn resume(&mut self) -> Result<(), TransportError>;
    async fn override_schedule(&mut self) -> Result<(), TransportError>;
    async fn park(&mut self) -> Result<(), TransportError>;
    async fn pause(&mut self) -> Result<(), TransportError>;
}

/// Resolves a device address to a connectable handle.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    type Device: Send;

    async fn find_device(&self, address: &MacAddress) -> Option<Self::Device>;

    /// Drops any lingering low-level connection to `address` before a reconnect.
    async fn close_stale_connections(&self, address: &MacAddress);

    /// Resolves once the link to `address` is reported down. Never resolves
    /// unless the transport can tell.
    async fn disconnected(&self, _address: &MacAddress) {
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_codes() {
        assert_eq!(MowerActivity::from_code(0), Some(MowerActivity::Idle));
        assert_eq!(MowerActivity::from_code(3), Some(MowerActivity::Mowing));
        assert_eq!(MowerActivity::from_code(7), None);
        assert_eq!(MowerActivity::Idle.to_string(), "none");
        assert_eq!(MowerActivity::GoingHome.to_string(), "goingHome");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(MowerState::from_code(6), Some(MowerState::InOperation));
        assert_eq!(MowerState::from_code(200), None);
        assert_eq!("waitForSafetyPin".parse::<MowerState>(), Ok(MowerState::WaitForSafetyPin));
        assert!("sleeping".parse::<MowerState>().is_err());
    }

    #[test]
    fn test_snapshot_json() {
        let snapshot = Snapshot {
            battery_level: Some(80),
            activity: Some(MowerActivity::Idle),
            state: Some(MowerState::InOperation),
        };
        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["battery_level"], 80);
        assert_eq!(json["activity"], "none");
        assert_eq!(json["state"], "inOperation");
    }
}
