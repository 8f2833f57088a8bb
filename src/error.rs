//! Error types for the gasgauge-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// Permission to use the radio was not granted.
    ///
    /// Checked before any connect, discover, or read attempt; no link
    /// activity happens once this is returned.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// Operation requires a connection but the sensor is not connected.
    #[error("Sensor not connected")]
    NotConnected,

    /// Failed to establish a connection to the sensor.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection to the sensor was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// Service discovery did not find all required characteristics.
    ///
    /// The session is aborted and the state returns to `Disconnected`;
    /// no partial operation against a subset of characteristics.
    #[error("Service discovery incomplete, missing characteristic: {missing}")]
    ServiceDiscoveryIncomplete {
        /// UUID of the characteristic that was not found.
        missing: String,
    },

    /// A characteristic read produced no response within the watchdog window.
    ///
    /// Recovered locally by the read queue; never surfaced to polling callers.
    #[error("Characteristic read timed out")]
    ReadTimeout,

    /// The sensor reported an error for a read.
    #[error("Sensor reported error: {message}")]
    DeviceReportedError {
        /// The error message from the sensor.
        message: String,
    },

    /// A characteristic payload could not be decoded.
    ///
    /// The sample is discarded; the pipeline continues.
    #[error("Malformed payload: {context}")]
    MalformedPayload {
        /// Description of what was wrong with the payload.
        context: String,
    },

    /// No cylinder is currently active, so a weight sample cannot be
    /// converted into a fuel measurement.
    #[error("No active cylinder")]
    NoActiveCylinder,

    /// A converted measurement failed basic validity checks.
    #[error("Invalid measurement: {reason}")]
    InvalidMeasurement {
        /// Description of the failed check.
        reason: String,
    },

    /// A durable write to the measurement store failed.
    #[error("Storage error: {reason}")]
    Storage {
        /// Description of the storage failure.
        reason: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ServiceDiscoveryIncomplete {
            missing: "0000a103".to_string(),
        };
        assert!(err.to_string().contains("0000a103"));

        assert_eq!(
            Error::PermissionDenied.to_string(),
            "Bluetooth permission denied"
        );
        assert_eq!(
            Error::ReadTimeout.to_string(),
            "Characteristic read timed out"
        );
    }
}
