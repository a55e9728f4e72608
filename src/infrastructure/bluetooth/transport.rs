//! GATT transport seam.
//!
//! The connection state machine only talks to a [`Transport`]. Platform
//! callbacks never touch shared state directly: they push [`BleEvent`]s into a
//! channel that the owning context drains in order.

use crate::domain::models::SessionId;
use crate::domain::peers::Advertisement;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingStatus {
    Paired,
    /// Reported by the platform when a pairing attempt races an existing bond.
    AlreadyPaired,
    /// Any other platform result, e.g. rejected or cancelled by the user.
    NotPaired(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessStatus {
    Allowed,
    Denied(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("device {0:#X} is unreachable")]
    Unreachable(u64),
    #[error("{0} not found")]
    NotFound(String),
    #[error("GATT status {0}")]
    Status(String),
    #[error("{0}")]
    Platform(String),
}

/// Events raised by the BLE stack on its own threads.
#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
    Notification {
        session: SessionId,
        payload: Vec<u8>,
    },
    LinkStatus {
        session: SessionId,
        connected: bool,
    },
    Advertisement(Advertisement),
    ScanStopped,
}

/// Callback target handed to the transport for one session.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<BleEvent>,
}

impl EventSink {
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<BleEvent>) -> Self {
        Self { session, tx }
    }

    /// Returns false once the owning context has gone away.
    pub fn notification(&self, payload: Vec<u8>) -> bool {
        self.tx
            .send(BleEvent::Notification {
                session: self.session,
                payload,
            })
            .is_ok()
    }

    pub fn link_status(&self, connected: bool) -> bool {
        self.tx
            .send(BleEvent::LinkStatus {
                session: self.session,
                connected,
            })
            .is_ok()
    }
}

/// A BLE GATT client.
///
/// Handles returned by one call are owned by the caller until passed back to
/// the matching release call. Release calls and `disconnect` never fail.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Send + Sync;
    type Service: Send + Sync;
    type Characteristic: Send + Sync;

    /// Open a connection. Link status changes are reported through `events`.
    async fn connect(
        &self,
        address: u64,
        events: EventSink,
    ) -> Result<Self::Connection, TransportError>;

    async fn is_paired(&self, connection: &Self::Connection) -> Result<bool, TransportError>;

    /// Pair without any additional protection level.
    async fn pair(&self, connection: &Self::Connection) -> Result<PairingStatus, TransportError>;

    /// Every service matching `service`, in platform order. Ownership of all
    /// returned handles passes to the caller.
    async fn discover_services(
        &self,
        connection: &Self::Connection,
        service: Uuid,
    ) -> Result<Vec<Self::Service>, TransportError>;

    async fn request_access(&self, service: &Self::Service)
        -> Result<AccessStatus, TransportError>;

    async fn discover_characteristic(
        &self,
        service: &Self::Service,
        characteristic: Uuid,
    ) -> Result<Self::Characteristic, TransportError>;

    /// Enable notifications. Payloads are reported through `events`.
    async fn subscribe(
        &self,
        characteristic: &Self::Characteristic,
        events: EventSink,
    ) -> Result<(), TransportError>;

    /// Undo whatever part of `subscribe` took effect. Must be safe after a
    /// failed or interrupted subscription.
    async fn unsubscribe(&self, characteristic: &Self::Characteristic);

    async fn write(
        &self,
        characteristic: &Self::Characteristic,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    fn release_characteristic(&self, characteristic: Self::Characteristic);

    fn release_service(&self, service: Self::Service);

    /// Dispose the connection. Safe on a connection the peer already dropped.
    async fn disconnect(&self, connection: Self::Connection);
}
