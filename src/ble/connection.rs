//! Connection lifecycle state.
//!
//! The state machine itself is driven by [`crate::device::SensorDevice`];
//! this module owns the state type and its transitions.

/// Connection state for a sensor session.
///
/// ```text
/// Disconnected -> Connecting -> ServiceDiscovery -> Ready
///       ^                                             |
///       +---------- Disconnecting <-------------------+
/// ```
///
/// Any unexpected link drop, from any state, lands back in
/// `Disconnected` and clears all session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected to the sensor.
    #[default]
    Disconnected,
    /// Establishing the physical link.
    Connecting,
    /// Link established, verifying the required characteristics.
    ServiceDiscovery,
    /// All three characteristics found; polling and sync are running.
    Ready,
    /// Tearing the link down on request.
    Disconnecting,
}

impl ConnectionState {
    /// Check if the session is fully established.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::ServiceDiscovery | Self::Disconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServiceDiscovery => write!(f, "ServiceDiscovery"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Ready.is_ready());
        assert!(!ConnectionState::Disconnected.is_ready());

        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::ServiceDiscovery.is_transitioning());
        assert!(ConnectionState::Disconnecting.is_transitioning());
        assert!(!ConnectionState::Ready.is_transitioning());
        assert!(!ConnectionState::Disconnected.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Ready), "Ready");
        assert_eq!(
            format!("{}", ConnectionState::ServiceDiscovery),
            "ServiceDiscovery"
        );
    }

    #[test]
    fn test_default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
