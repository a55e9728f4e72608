//! In-memory transport with fault injection and handle accounting.

use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    AccessStatus, EventSink, PairingStatus, Transport, TransportError, WriteMode,
};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Connect,
    Pairing,
    /// `pair` reports `AlreadyPaired` for a device `is_paired` said was not.
    AlreadyPaired,
    ServiceMissing,
    ServiceStatus,
    AccessDenied,
    CharacteristicMissing(Uuid),
    Subscribe,
    Write,
}

/// Step that never completes, for cancellation tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hang {
    Pair,
    DiscoverService,
    /// Handler registered, descriptor write never completes.
    Subscribe,
}

#[derive(Debug)]
pub struct MockState {
    pub already_paired: bool,
    pub faults: Vec<Fault>,
    pub hang: Option<Hang>,
    /// Services matching the requested uuid beyond the first one.
    pub extra_service_matches: usize,
    pub open_connections: usize,
    pub open_services: usize,
    pub open_characteristics: usize,
    pub active_subscriptions: usize,
    pub writes: Vec<(Uuid, Vec<u8>, WriteMode)>,
    /// Ordered log of calls, e.g. `"unsubscribe"` or `"release_service"`.
    pub calls: Vec<String>,
    link_events: Option<EventSink>,
    notify_events: Option<EventSink>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            already_paired: true,
            faults: Vec::new(),
            hang: None,
            extra_service_matches: 0,
            open_connections: 0,
            open_services: 0,
            open_characteristics: 0,
            active_subscriptions: 0,
            writes: Vec::new(),
            calls: Vec::new(),
            link_events: None,
            notify_events: None,
        }
    }
}

impl MockState {
    fn has(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    pub fn has_notify_sink(&self) -> bool {
        self.notify_events.is_some()
    }

    pub fn leaked_handles(&self) -> usize {
        self.open_connections
            + self.open_services
            + self.open_characteristics
            + self.active_subscriptions
    }
}

#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

#[derive(Debug)]
pub struct MockConnection {
    pub address: u64,
}

#[derive(Debug)]
pub struct MockService {
    pub uuid: Uuid,
}

#[derive(Debug)]
pub struct MockCharacteristic {
    pub uuid: Uuid,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(fault: Fault) -> Self {
        let mock = Self::new();
        mock.state().faults.push(fault);
        mock
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Push a notification as if the device sent it.
    pub fn notify(&self, payload: Vec<u8>) -> bool {
        let sink = self.state().notify_events.clone();
        sink.map(|s| s.notification(payload)).unwrap_or(false)
    }

    /// Report a link status change as the platform stack would.
    pub fn report_link(&self, connected: bool) -> bool {
        let sink = self.state().link_events.clone();
        sink.map(|s| s.link_status(connected)).unwrap_or(false)
    }

    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.state()
            .writes
            .iter()
            .filter(|(target, _, _)| *target == uuid)
            .map(|(_, payload, _)| payload.clone())
            .collect()
    }

    fn call(&self, name: &str) -> MutexGuard<'_, MockState> {
        let mut state = self.state();
        state.calls.push(name.to_string());
        state
    }

    fn hangs_on(&self, step: Hang) -> bool {
        self.state().hang == Some(step)
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;
    type Service = MockService;
    type Characteristic = MockCharacteristic;

    async fn connect(
        &self,
        address: u64,
        events: EventSink,
    ) -> Result<MockConnection, TransportError> {
        let mut state = self.call("connect");
        if state.has(Fault::Connect) {
            return Err(TransportError::Unreachable(address));
        }
        state.open_connections += 1;
        state.link_events = Some(events);
        Ok(MockConnection { address })
    }

    async fn is_paired(&self, _connection: &MockConnection) -> Result<bool, TransportError> {
        Ok(self.call("is_paired").already_paired)
    }

    async fn pair(&self, _connection: &MockConnection) -> Result<PairingStatus, TransportError> {
        if self.hangs_on(Hang::Pair) {
            std::future::pending::<()>().await;
        }
        let mut state = self.call("pair");
        if state.has(Fault::Pairing) {
            return Ok(PairingStatus::NotPaired("RejectedByHandler".to_string()));
        }
        if state.has(Fault::AlreadyPaired) {
            return Ok(PairingStatus::AlreadyPaired);
        }
        state.already_paired = true;
        Ok(PairingStatus::Paired)
    }

    async fn discover_services(
        &self,
        _connection: &MockConnection,
        service: Uuid,
    ) -> Result<Vec<MockService>, TransportError> {
        if self.hangs_on(Hang::DiscoverService) {
            std::future::pending::<()>().await;
        }
        let mut state = self.call("discover_services");
        if state.has(Fault::ServiceStatus) {
            return Err(TransportError::Status("Unreachable".to_string()));
        }
        if state.has(Fault::ServiceMissing) || service != protocol::SERVICE_UUID {
            return Ok(Vec::new());
        }
        let count = 1 + state.extra_service_matches;
        state.open_services += count;
        Ok((0..count).map(|_| MockService { uuid: service }).collect())
    }

    async fn request_access(&self, _service: &MockService) -> Result<AccessStatus, TransportError> {
        let state = self.call("request_access");
        if state.has(Fault::AccessDenied) {
            return Ok(AccessStatus::Denied("DeniedByUser".to_string()));
        }
        Ok(AccessStatus::Allowed)
    }

    async fn discover_characteristic(
        &self,
        _service: &MockService,
        characteristic: Uuid,
    ) -> Result<MockCharacteristic, TransportError> {
        let mut state = self.call("discover_characteristic");
        if state.has(Fault::CharacteristicMissing(characteristic)) {
            return Err(TransportError::NotFound(format!(
                "characteristic {characteristic}"
            )));
        }
        state.open_characteristics += 1;
        Ok(MockCharacteristic {
            uuid: characteristic,
        })
    }

    async fn subscribe(
        &self,
        _characteristic: &MockCharacteristic,
        events: EventSink,
    ) -> Result<(), TransportError> {
        let hang = {
            let mut state = self.call("subscribe");
            if state.has(Fault::Subscribe) {
                return Err(TransportError::Status("ProtocolError".to_string()));
            }
            state.active_subscriptions += 1;
            state.notify_events = Some(events);
            state.hang == Some(Hang::Subscribe)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, _characteristic: &MockCharacteristic) {
        let mut state = self.call("unsubscribe");
        if state.notify_events.take().is_some() {
            state.active_subscriptions -= 1;
        }
    }

    async fn write(
        &self,
        characteristic: &MockCharacteristic,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let mut state = self.call("write");
        if state.has(Fault::Write) {
            return Err(TransportError::Status("Unreachable".to_string()));
        }
        state
            .writes
            .push((characteristic.uuid, payload.to_vec(), mode));
        Ok(())
    }

    fn release_characteristic(&self, _characteristic: MockCharacteristic) {
        self.call("release_characteristic").open_characteristics -= 1;
    }

    fn release_service(&self, _service: MockService) {
        self.call("release_service").open_services -= 1;
    }

    async fn disconnect(&self, _connection: MockConnection) {
        let mut state = self.call("disconnect");
        state.open_connections -= 1;
        state.link_events = None;
    }
}
