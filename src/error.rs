use mac_address::MacAddress;
use thiserror::Error;

use crate::coordinator::Field;

/// Failures raised by the BLE layer underneath a session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("session is not connected")]
    NotConnected,
    #[error("characteristic {0} not found on device")]
    MissingCharacteristic(uuid::Uuid),
    #[error(transparent)]
    Ble(#[from] btleplug::Error),
}

/// Why a refresh cycle (or a command) could not complete.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("can't find device {0}")]
    DeviceNotFound(MacAddress),
    #[error("failed to connect to {address}: {reason}")]
    ConnectionFailed { address: MacAddress, reason: String },
    #[error("error getting {field} from device: {source}")]
    Fetch {
        field: Field,
        #[source]
        source: TransportError,
    },
    #[error("error sending command to device: {0}")]
    Command(#[source] TransportError),
}
