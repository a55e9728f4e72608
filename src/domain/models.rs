use crate::domain::config::ConfigCacheEntry;
use crate::domain::peers::DiscoveredPeer;

/// Identifies one connection attempt. Events carrying a different id than the
/// active session are stale and must be ignored.
pub type SessionId = u64;

/// One configuration item as decoded from a device notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRecord {
    pub id: String,
    pub value: String,
    /// Allowed values in device order. Empty means free-form.
    pub choices: Vec<String>,
    pub is_read_only: bool,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    PeerDiscovered(DiscoveredPeer),
    ScanStopped,
    ConnectionStatus(ConnectionStatus),
    ConfigUpdated(ConfigCacheEntry),
    ConfigCleared,
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    /// Text shown next to the device name.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
        }
    }

    pub fn is_connected(&self) -> bool {
        *self == Self::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        *self == Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_derived_fields() {
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Disconnected);
        assert!(ConnectionStatus::Connected.is_connected());
        assert!(!ConnectionStatus::Connecting.is_connected());
        assert!(!ConnectionStatus::Connecting.is_disconnected());
        assert_eq!(ConnectionStatus::Connecting.to_string(), "Connecting");
    }
}
