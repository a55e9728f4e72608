//! BLE Connection Module
//!
//! Runs the handshake with an Astro device (connect, pair, discover the
//! configuration service and its characteristics, subscribe to config
//! notifications) and tears everything down again on failure or request.

use crate::domain::models::{ConnectionStatus, SessionId};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    AccessStatus, BleEvent, EventSink, PairingStatus, Transport, TransportError, WriteMode,
};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// GATT identifiers used during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub service_uuid: Uuid,
    pub config_read_uuid: Uuid,
    pub config_write_uuid: Uuid,
    pub capture_image_uuid: Uuid,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID,
            config_read_uuid: protocol::CONFIG_READ_CHAR_UUID,
            config_write_uuid: protocol::CONFIG_WRITE_CHAR_UUID,
            capture_image_uuid: protocol::CAPTURE_IMAGE_CHAR_UUID,
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, uuid::Error> {
        Ok(Self {
            service_uuid: Uuid::parse_str(&settings.ble_service_uuid)?,
            config_read_uuid: Uuid::parse_str(&settings.ble_config_read_uuid)?,
            config_write_uuid: Uuid::parse_str(&settings.ble_config_write_uuid)?,
            capture_image_uuid: Uuid::parse_str(&settings.ble_capture_image_uuid)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Connecting,
    Pairing,
    DiscoveringService,
    DiscoveringCharacteristics,
    Subscribing,
    Connected,
    Disconnected,
}

/// Characteristics resolved during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicRole {
    ConfigRead,
    ConfigWrite,
    CaptureImage,
}

impl CharacteristicRole {
    fn label(&self) -> &'static str {
        match self {
            Self::ConfigRead => "config read characteristic",
            Self::ConfigWrite => "config write characteristic",
            Self::CaptureImage => "capture image characteristic",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Unable to connect to device: {0}")]
    Connect(TransportError),
    #[error("Pairing result of Paired expected but got {0}")]
    Pairing(String),
    #[error("Unable to find {target} on this device: {reason}")]
    Discovery {
        target: &'static str,
        reason: String,
    },
    #[error("Unable to access the configuration service on this device: {0}")]
    Access(String),
    #[error("Unable to listen to notify events on the config read characteristic: {0}")]
    Subscription(String),
    #[error("Transport error: {0}")]
    Transport(TransportError),
    #[error("Device is not connected")]
    NotConnected,
    #[error("Connection attempt cancelled")]
    Cancelled,
}

/// Identity of the active (or in-progress) session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub address: u64,
    pub name: String,
}

/// Handles acquired so far. Each one is recorded the moment it is obtained so
/// teardown can release it even if the handshake future was dropped.
struct Link<T: Transport> {
    connection: Option<T::Connection>,
    service: Option<T::Service>,
    config_read: Option<T::Characteristic>,
    config_write: Option<T::Characteristic>,
    capture_image: Option<T::Characteristic>,
    /// Set once `subscribe` has been started, whether or not it finished.
    subscribed: bool,
}

impl<T: Transport> Default for Link<T> {
    fn default() -> Self {
        Self {
            connection: None,
            service: None,
            config_read: None,
            config_write: None,
            capture_image: None,
            subscribed: false,
        }
    }
}

impl<T: Transport> Link<T> {
    fn characteristic(&self, role: CharacteristicRole) -> Option<&T::Characteristic> {
        match role {
            CharacteristicRole::ConfigRead => self.config_read.as_ref(),
            CharacteristicRole::ConfigWrite => self.config_write.as_ref(),
            CharacteristicRole::CaptureImage => self.capture_image.as_ref(),
        }
    }

    fn slot(&mut self, role: CharacteristicRole) -> &mut Option<T::Characteristic> {
        match role {
            CharacteristicRole::ConfigRead => &mut self.config_read,
            CharacteristicRole::ConfigWrite => &mut self.config_write,
            CharacteristicRole::CaptureImage => &mut self.capture_image,
        }
    }
}

/// BLE connection state machine for one device at a time
pub struct BleConnection<T: Transport> {
    transport: Arc<T>,
    config: ConnectionConfig,
    events: mpsc::UnboundedSender<BleEvent>,
    state: HandshakeState,
    session: Option<SessionInfo>,
    last_session_id: SessionId,
    link_up: bool,
    link: Link<T>,
}

impl<T: Transport> BleConnection<T> {
    /// Create a new connection handler
    pub fn new(
        transport: Arc<T>,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<BleEvent>,
    ) -> Self {
        Self {
            transport,
            config,
            events,
            state: HandshakeState::Idle,
            session: None,
            last_session_id: 0,
            link_up: false,
            link: Link::default(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Status as shown to the user, derived from the handshake state and the
    /// last link report from the platform.
    pub fn status(&self) -> ConnectionStatus {
        match self.state {
            HandshakeState::Connected if self.link_up => ConnectionStatus::Connected,
            HandshakeState::Connected | HandshakeState::Idle | HandshakeState::Disconnected => {
                ConnectionStatus::Disconnected
            }
            _ => ConnectionStatus::Connecting,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == HandshakeState::Connected
    }

    /// Connect to a device by Bluetooth address.
    ///
    /// On any failure the handles acquired so far are released before the
    /// error is returned and the state ends as `Disconnected`.
    pub async fn connect(
        &mut self,
        address: u64,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionId, ConnectionError> {
        if self.state != HandshakeState::Idle && self.state != HandshakeState::Disconnected {
            warn!("Connect requested while {:?}; tearing down first", self.state);
            self.teardown().await;
        }

        self.last_session_id += 1;
        let session = SessionInfo {
            id: self.last_session_id,
            address,
            name: name.to_string(),
        };
        info!(
            "Connecting to Bluetooth device: {:#X} ({}), session {}",
            address, name, session.id
        );
        self.session = Some(session);

        match self.handshake(address, cancel).await {
            Ok(()) => {
                info!("Handshake complete for {:#X}", address);
                Ok(self.last_session_id)
            }
            Err(e) => {
                error!("Handshake failed in {:?}: {}", self.state, e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn handshake(
        &mut self,
        address: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        let transport = Arc::clone(&self.transport);
        let sink = EventSink::new(self.last_session_id, self.events.clone());

        // Step 1: Connect to BLE device
        self.state = HandshakeState::Connecting;
        let connection = cancellable(cancel, transport.connect(address, sink.clone()))
            .await?
            .map_err(ConnectionError::Connect)?;
        let connection = &*self.link.connection.insert(connection);
        self.link_up = true;

        // Step 2: Pair if not already paired
        let paired = cancellable(cancel, transport.is_paired(connection))
            .await?
            .map_err(|e| ConnectionError::Pairing(e.to_string()))?;
        if paired {
            debug!("Device already paired");
        } else {
            self.state = HandshakeState::Pairing;
            info!("Device is not paired. Attempting to pair...");
            match cancellable(cancel, transport.pair(connection)).await? {
                Ok(PairingStatus::Paired) => {
                    info!("Pairing successful");
                }
                Ok(PairingStatus::AlreadyPaired) => {
                    return Err(ConnectionError::Pairing("AlreadyPaired".to_string()));
                }
                Ok(PairingStatus::NotPaired(status)) => {
                    return Err(ConnectionError::Pairing(status));
                }
                Err(e) => return Err(ConnectionError::Pairing(e.to_string())),
            }
        }

        // Step 3: Resolve the configuration service
        self.state = HandshakeState::DiscoveringService;
        let mut services = cancellable(
            cancel,
            transport.discover_services(connection, self.config.service_uuid),
        )
        .await?
        .map_err(|e| ConnectionError::Discovery {
            target: "configuration service",
            reason: e.to_string(),
        })?
        .into_iter();
        let Some(service) = services.next() else {
            return Err(ConnectionError::Discovery {
                target: "configuration service",
                reason: "no matching service".to_string(),
            });
        };
        let service = &*self.link.service.insert(service);
        // First match wins
        for extra in services {
            transport.release_service(extra);
        }
        info!("Found configuration service");

        match cancellable(cancel, transport.request_access(service)).await? {
            Ok(AccessStatus::Allowed) => {}
            Ok(AccessStatus::Denied(status)) => return Err(ConnectionError::Access(status)),
            Err(e) => return Err(ConnectionError::Access(e.to_string())),
        }

        // Step 4: Resolve the three characteristics
        self.state = HandshakeState::DiscoveringCharacteristics;
        for (role, uuid) in [
            (CharacteristicRole::ConfigRead, self.config.config_read_uuid),
            (CharacteristicRole::ConfigWrite, self.config.config_write_uuid),
            (CharacteristicRole::CaptureImage, self.config.capture_image_uuid),
        ] {
            let characteristic = cancellable(cancel, transport.discover_characteristic(service, uuid))
                .await?
                .map_err(|e| ConnectionError::Discovery {
                    target: role.label(),
                    reason: e.to_string(),
                })?;
            let slot = match role {
                CharacteristicRole::ConfigRead => &mut self.link.config_read,
                CharacteristicRole::ConfigWrite => &mut self.link.config_write,
                CharacteristicRole::CaptureImage => &mut self.link.capture_image,
            };
            *slot = Some(characteristic);
            debug!("Found {}", role.label());
        }

        // Step 5: Enable notifications on config read
        self.state = HandshakeState::Subscribing;
        let config_read = self
            .link
            .config_read
            .as_ref()
            .ok_or(ConnectionError::NotConnected)?;
        // Set before the await so teardown also undoes a partial registration
        self.link.subscribed = true;
        cancellable(cancel, transport.subscribe(config_read, sink))
            .await?
            .map_err(|e| ConnectionError::Subscription(e.to_string()))?;
        info!("Notifications enabled");

        self.state = HandshakeState::Connected;
        Ok(())
    }

    /// Disconnect from the current device. Safe from any state.
    pub async fn disconnect(&mut self) {
        if self.link.connection.is_none() && self.session.is_none() {
            self.state = HandshakeState::Disconnected;
            return;
        }
        self.teardown().await;
        info!("Disconnected from device");
    }

    /// Release acquired handles in reverse acquisition order.
    async fn teardown(&mut self) {
        let transport = Arc::clone(&self.transport);

        if self.link.subscribed {
            if let Some(config_read) = self.link.config_read.as_ref() {
                transport.unsubscribe(config_read).await;
            }
            self.link.subscribed = false;
        }

        for role in [
            CharacteristicRole::CaptureImage,
            CharacteristicRole::ConfigWrite,
            CharacteristicRole::ConfigRead,
        ] {
            if let Some(characteristic) = self.link.slot(role).take() {
                transport.release_characteristic(characteristic);
            }
        }

        if let Some(service) = self.link.service.take() {
            transport.release_service(service);
        }

        if let Some(connection) = self.link.connection.take() {
            transport.disconnect(connection).await;
        }

        self.link_up = false;
        self.session = None;
        self.state = HandshakeState::Disconnected;
    }

    /// Apply a platform link status report. Reports for any session other
    /// than the active one are ignored.
    pub fn on_link_status(&mut self, session: SessionId, connected: bool) -> Option<ConnectionStatus> {
        if self.session_id() != Some(session) {
            debug!("Ignoring link status for stale session {}", session);
            return None;
        }
        self.link_up = connected;
        Some(self.status())
    }

    /// Write to one of the resolved characteristics. Fails fast unless the
    /// handshake has completed.
    pub async fn write(
        &self,
        role: CharacteristicRole,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), ConnectionError> {
        if self.state != HandshakeState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        let characteristic = self
            .link
            .characteristic(role)
            .ok_or(ConnectionError::NotConnected)?;
        self.transport
            .write(characteristic, payload, mode)
            .await
            .map_err(ConnectionError::Transport)
    }
}

async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    step: F,
) -> Result<F::Output, ConnectionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
        output = step => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{Fault, Hang, MockTransport};

    fn setup(
        mock: MockTransport,
    ) -> (
        Arc<MockTransport>,
        BleConnection<MockTransport>,
        mpsc::UnboundedReceiver<BleEvent>,
    ) {
        let transport = Arc::new(mock);
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = BleConnection::new(Arc::clone(&transport), ConnectionConfig::default(), tx);
        (transport, connection, rx)
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (transport, mut connection, _rx) = setup(MockTransport::new());
        let session = connection
            .connect(0xABCD, "Astro Helper", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session, 1);
        assert_eq!(connection.state(), HandshakeState::Connected);
        assert_eq!(connection.status(), ConnectionStatus::Connected);
        assert_eq!(connection.session().unwrap().name, "Astro Helper");

        let state = transport.state();
        assert_eq!(state.open_connections, 1);
        assert_eq!(state.open_services, 1);
        assert_eq!(state.open_characteristics, 3);
        assert_eq!(state.active_subscriptions, 1);
        assert!(!state.calls.contains(&"pair".to_string()));
    }

    #[tokio::test]
    async fn test_unpaired_device_is_paired() {
        let mock = MockTransport::new();
        mock.state().already_paired = false;
        let (transport, mut connection, _rx) = setup(mock);

        connection
            .connect(1, "cam", &CancellationToken::new())
            .await
            .unwrap();
        assert!(transport.state().calls.contains(&"pair".to_string()));
    }

    async fn assert_teardown_on(fault: Fault, already_paired: bool) -> ConnectionError {
        let mock = MockTransport::with_fault(fault);
        mock.state().already_paired = already_paired;
        let (transport, mut connection, _rx) = setup(mock);

        let err = connection
            .connect(0x42, "cam", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(connection.state(), HandshakeState::Disconnected);
        assert_eq!(connection.status(), ConnectionStatus::Disconnected);
        assert!(connection.session().is_none());
        assert_eq!(transport.state().leaked_handles(), 0, "leak after {fault:?}");
        err
    }

    #[tokio::test]
    async fn test_teardown_on_every_failing_step() {
        assert!(matches!(
            assert_teardown_on(Fault::Connect, true).await,
            ConnectionError::Connect(_)
        ));
        assert_eq!(
            assert_teardown_on(Fault::Pairing, false).await,
            ConnectionError::Pairing("RejectedByHandler".to_string())
        );
        assert_eq!(
            assert_teardown_on(Fault::AlreadyPaired, false).await,
            ConnectionError::Pairing("AlreadyPaired".to_string())
        );
        assert!(matches!(
            assert_teardown_on(Fault::ServiceMissing, true).await,
            ConnectionError::Discovery { target: "configuration service", .. }
        ));
        assert!(matches!(
            assert_teardown_on(Fault::ServiceStatus, true).await,
            ConnectionError::Discovery { .. }
        ));
        assert_eq!(
            assert_teardown_on(Fault::AccessDenied, true).await,
            ConnectionError::Access("DeniedByUser".to_string())
        );
        for uuid in [
            protocol::CONFIG_READ_CHAR_UUID,
            protocol::CONFIG_WRITE_CHAR_UUID,
            protocol::CAPTURE_IMAGE_CHAR_UUID,
        ] {
            assert!(matches!(
                assert_teardown_on(Fault::CharacteristicMissing(uuid), true).await,
                ConnectionError::Discovery { .. }
            ));
        }
        assert!(matches!(
            assert_teardown_on(Fault::Subscribe, true).await,
            ConnectionError::Subscription(_)
        ));
    }

    #[tokio::test]
    async fn test_teardown_order() {
        let (transport, mut connection, _rx) = setup(MockTransport::new());
        connection
            .connect(1, "cam", &CancellationToken::new())
            .await
            .unwrap();
        transport.state().calls.clear();

        connection.disconnect().await;

        assert_eq!(
            transport.state().calls,
            vec![
                "unsubscribe",
                "release_characteristic",
                "release_characteristic",
                "release_characteristic",
                "release_service",
                "disconnect",
            ]
        );
        assert_eq!(transport.state().leaked_handles(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (transport, mut connection, _rx) = setup(MockTransport::new());
        connection.disconnect().await;
        assert_eq!(connection.state(), HandshakeState::Disconnected);

        connection
            .connect(1, "cam", &CancellationToken::new())
            .await
            .unwrap();
        connection.disconnect().await;
        connection.disconnect().await;

        assert_eq!(transport.state().leaked_handles(), 0);
        let disconnects = transport
            .state()
            .calls
            .iter()
            .filter(|c| *c == "disconnect")
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_handshake() {
        let mock = MockTransport::new();
        mock.state().hang = Some(Hang::DiscoverService);
        let (transport, mut connection, _rx) = setup(mock);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = connection.connect(1, "cam", &cancel).await.unwrap_err();
        assert_eq!(err, ConnectionError::Cancelled);
        assert_eq!(connection.state(), HandshakeState::Disconnected);
        assert_eq!(transport.state().leaked_handles(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_enabling_notifications() {
        let mock = MockTransport::new();
        mock.state().hang = Some(Hang::Subscribe);
        let (transport, mut connection, _rx) = setup(mock);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = connection.connect(1, "cam", &cancel).await.unwrap_err();
        assert_eq!(err, ConnectionError::Cancelled);
        assert_eq!(connection.state(), HandshakeState::Disconnected);

        let state = transport.state();
        assert!(state.calls.contains(&"unsubscribe".to_string()));
        assert_eq!(state.active_subscriptions, 0);
        assert_eq!(state.leaked_handles(), 0);
        assert!(!state.has_notify_sink());
    }

    #[tokio::test]
    async fn test_first_matching_service_wins() {
        let mock = MockTransport::new();
        mock.state().extra_service_matches = 2;
        let (transport, mut connection, _rx) = setup(mock);

        connection
            .connect(1, "cam", &CancellationToken::new())
            .await
            .unwrap();
        {
            let state = transport.state();
            assert_eq!(state.open_services, 1);
            let released = state.calls.iter().filter(|c| *c == "release_service").count();
            assert_eq!(released, 2);
        }

        connection.disconnect().await;
        assert_eq!(transport.state().leaked_handles(), 0);
    }

    #[tokio::test]
    async fn test_dropped_handshake_is_released_by_disconnect() {
        let mock = MockTransport::new();
        mock.state().already_paired = false;
        mock.state().hang = Some(Hang::Pair);
        let (transport, mut connection, _rx) = setup(mock);

        let cancel = CancellationToken::new();
        let attempt = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            connection.connect(1, "cam", &cancel),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(connection.state(), HandshakeState::Pairing);
        assert_eq!(transport.state().open_connections, 1);

        connection.disconnect().await;
        assert_eq!(transport.state().leaked_handles(), 0);
        assert_eq!(connection.state(), HandshakeState::Disconnected);
    }

    #[tokio::test]
    async fn test_writes_fail_fast_when_not_connected() {
        let (transport, mut connection, _rx) = setup(MockTransport::new());
        let err = connection
            .write(CharacteristicRole::CaptureImage, b"v", WriteMode::WithoutResponse)
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::NotConnected);

        connection
            .connect(1, "cam", &CancellationToken::new())
            .await
            .unwrap();
        connection.disconnect().await;
        let err = connection
            .write(CharacteristicRole::ConfigWrite, b"iso=100", WriteMode::WithoutResponse)
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::NotConnected);
        assert!(transport.state().writes.is_empty());
    }

    #[tokio::test]
    async fn test_stale_link_status_is_ignored() {
        let (transport, mut connection, mut rx) = setup(MockTransport::new());
        let first = connection
            .connect(1, "cam", &CancellationToken::new())
            .await
            .unwrap();
        connection.disconnect().await;
        let second = connection
            .connect(1, "cam", &CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(first, second);

        assert_eq!(connection.on_link_status(first, false), None);
        assert_eq!(connection.status(), ConnectionStatus::Connected);

        assert!(transport.report_link(false));
        let Some(BleEvent::LinkStatus { session, connected }) = rx.recv().await else {
            panic!("expected a link status event");
        };
        assert_eq!(
            connection.on_link_status(session, connected),
            Some(ConnectionStatus::Disconnected)
        );
        assert!(connection.is_connected());
    }

    #[test]
    fn test_config_from_settings() {
        let settings = Settings::default();
        assert_eq!(
            ConnectionConfig::from_settings(&settings).unwrap(),
            ConnectionConfig::default()
        );

        let mut broken = Settings::default();
        broken.ble_service_uuid = "not-a-uuid".to_string();
        assert!(ConnectionConfig::from_settings(&broken).is_err());
    }
}
