//! Camera Service Module
//!
//! Owns the device session and its configuration cache. Everything the BLE
//! stack reports arrives as a [`BleEvent`] on one channel and is applied here,
//! in order, on the caller's task. Presentation code observes the results as
//! [`AppEvent`]s.

use crate::domain::capture::{CaptureOutcome, CapturePlan, CaptureSequence};
use crate::domain::config::{ConfigCache, ConfigCacheEntry, SharedConfigCache};
use crate::domain::models::{AppEvent, ConnectionStatus, MessageSeverity, StatusMessage};
use crate::domain::peers::{Advertisement, PeerRegistry, UNKNOWN_DEVICE_NAME};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::connection::{BleConnection, ConnectionConfig, ConnectionError};
use crate::infrastructure::bluetooth::sync::{ConfigSynchronizer, SyncError};
use crate::infrastructure::bluetooth::transport::{BleEvent, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Main service coordinating all BLE operations for one selected device
pub struct CameraService<T: Transport> {
    connection: BleConnection<T>,
    sync: ConfigSynchronizer,
    peers: PeerRegistry,
    /// Decoded notifications applied per config id, identical values included.
    replies: HashMap<String, u64>,
    ble_sender: mpsc::UnboundedSender<BleEvent>,
    ble_receiver: mpsc::UnboundedReceiver<BleEvent>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    settings: Arc<Mutex<SettingsService>>,
}

impl<T: Transport> CameraService<T> {
    pub fn new(
        transport: Arc<T>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        settings: Arc<Mutex<SettingsService>>,
    ) -> Self {
        let config = {
            let settings = settings.lock().unwrap_or_else(PoisonError::into_inner);
            ConnectionConfig::from_settings(settings.get()).unwrap_or_else(|e| {
                warn!("Invalid GATT identifiers in settings ({}), using defaults", e);
                ConnectionConfig::default()
            })
        };

        let (ble_sender, ble_receiver) = mpsc::unbounded_channel();
        Self {
            connection: BleConnection::new(transport, config, ble_sender.clone()),
            sync: ConfigSynchronizer::new(),
            peers: PeerRegistry::new(),
            replies: HashMap::new(),
            ble_sender,
            ble_receiver,
            event_sender,
            settings,
        }
    }

    /// Sender for platform callbacks that are not tied to a session, such as
    /// the advertisement scanner.
    pub fn ble_sender(&self) -> mpsc::UnboundedSender<BleEvent> {
        self.ble_sender.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn connection(&self) -> &BleConnection<T> {
        &self.connection
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn config_cache(&self) -> SharedConfigCache {
        self.sync.cache()
    }

    pub fn config_snapshot(&self) -> ConfigCache {
        self.sync.cache().snapshot()
    }

    /// Forget peers from the previous scan.
    pub fn begin_scan(&mut self) {
        self.peers.begin_scan();
        self.send_log("Scanning for devices...", MessageSeverity::Info);
    }

    /// Connect to a device by address and, if configured, ask for the
    /// well-known config items.
    pub async fn connect(
        &mut self,
        address: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        let name = self
            .peers
            .get(address)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string());

        self.clear_cache();
        self.send_status(ConnectionStatus::Connecting);
        self.send_log(format!("Connecting to {}...", name), MessageSeverity::Info);

        if let Err(e) = self.connection.connect(address, &name, cancel).await {
            self.send_log(e.to_string(), MessageSeverity::Error);
            self.send_status(ConnectionStatus::Disconnected);
            return Err(e);
        }

        self.peers.mark_paired(address);
        let refresh = {
            let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = settings.remember_connected(address) {
                warn!("Failed to persist last connected device: {}", e);
            }
            settings.get().refresh_on_connect
        };

        self.send_log("Connection established!", MessageSeverity::Success);
        self.send_status(self.connection.status());

        if refresh {
            if let Err(e) = self.sync.refresh_all(&self.connection).await {
                warn!("Initial config refresh failed: {}", e);
                self.send_log(e.to_string(), MessageSeverity::Warning);
            }
        }
        Ok(())
    }

    /// Disconnect from the current device and drop its cached configuration
    pub async fn disconnect(&mut self) {
        let was_active = self.connection.session().is_some();
        self.connection.disconnect().await;
        self.clear_cache();

        if was_active {
            self.send_log("Disconnected from device", MessageSeverity::Info);
        }
        self.send_status(ConnectionStatus::Disconnected);
    }

    pub async fn request_config(&self, id: &str) -> Result<(), SyncError> {
        self.sync.request(&self.connection, id).await
    }

    pub async fn write_config(&self, id: &str, value: &str) -> Result<(), SyncError> {
        self.sync.write(&self.connection, id, value).await
    }

    pub async fn capture_image(&self) -> Result<(), SyncError> {
        self.sync.capture(&self.connection).await
    }

    /// Trigger `plan.takes` captures, `plan.interval` apart, until done or
    /// cancelled. Device events keep being applied between takes.
    pub async fn capture_sequence(
        &mut self,
        plan: CapturePlan,
        cancel: CancellationToken,
    ) -> Result<CaptureOutcome, SyncError> {
        info!("Starting capture sequence: {} takes every {:?}", plan.takes, plan.interval);
        let mut sequence = CaptureSequence::new(plan, cancel);

        while sequence.should_continue() {
            self.capture_image().await?;
            let progress = sequence.record_take();
            self.send_log(progress.label(), MessageSeverity::Info);

            if !sequence.wait_interval().await {
                break;
            }
            self.process_pending_events();
        }

        let outcome = sequence.outcome();
        info!("Capture sequence finished: {:?}", outcome);
        Ok(outcome)
    }

    /// Apply one event from the BLE stack.
    pub fn handle_event(&mut self, event: BleEvent) {
        match event {
            BleEvent::Notification { session, payload } => {
                if self.connection.session_id() != Some(session) {
                    debug!("Dropping notification from stale session {}", session);
                    return;
                }
                let sender = &self.event_sender;
                let applied = self.sync.on_notification(&payload, |entry| {
                    let _ = sender.send(AppEvent::ConfigUpdated(entry.clone()));
                });
                if let Some(entry) = applied {
                    *self.replies.entry(entry.id).or_default() += 1;
                }
            }
            BleEvent::LinkStatus { session, connected } => {
                if let Some(status) = self.connection.on_link_status(session, connected) {
                    info!("Link status changed: {}", status);
                    self.send_status(status);
                }
            }
            BleEvent::Advertisement(adv) => self.on_advertisement(&adv),
            BleEvent::ScanStopped => {
                self.peers.end_scan();
                let _ = self.event_sender.send(AppEvent::ScanStopped);
            }
        }
    }

    /// Apply every event queued so far. Returns how many were applied.
    pub fn process_pending_events(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.ble_receiver.try_recv() {
            self.handle_event(event);
            applied += 1;
        }
        if applied > 0 {
            trace!("Applied {} BLE events", applied);
        }
        applied
    }

    /// Wait for the next event and apply it. Returns false if the channel
    /// has closed.
    pub async fn process_next_event(&mut self) -> bool {
        match self.ble_receiver.recv().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    fn reply_count(&self, id: &str) -> u64 {
        self.replies.get(id).copied().unwrap_or(0)
    }

    /// Request `id` and apply events until the device answers or `timeout`
    /// elapses. Any record for `id` counts as the answer, even one equal to
    /// the cached entry. On timeout the cached entry, if any, is returned.
    pub async fn fetch_config(
        &mut self,
        id: &str,
        timeout: Duration,
    ) -> Result<Option<ConfigCacheEntry>, SyncError> {
        let before = self.reply_count(id);
        self.request_config(id).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        while self.reply_count(id) == before {
            match tokio::time::timeout_at(deadline, self.ble_receiver.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => break,
                Err(_) => {
                    debug!("No answer for config '{}' within {:?}", id, timeout);
                    break;
                }
            }
        }
        Ok(self.sync.cache().entry(id))
    }

    fn on_advertisement(&mut self, adv: &Advertisement) {
        let peer = self.peers.record(adv).clone();
        trace!("Sighted {} ({})", peer.name, peer.formatted_address);
        let _ = self.event_sender.send(AppEvent::PeerDiscovered(peer));
    }

    fn clear_cache(&mut self) {
        self.sync.clear();
        self.replies.clear();
        let _ = self.event_sender.send(AppEvent::ConfigCleared);
    }

    fn send_status(&self, status: ConnectionStatus) {
        let _ = self.event_sender.send(AppEvent::ConnectionStatus(status));
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}
