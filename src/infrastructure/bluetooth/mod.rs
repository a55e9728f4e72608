//! Bluetooth Module
//!
//! Provides BLE communication with Astro camera devices.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     CameraService                        │
//! │  (owns the session, applies BleEvents, emits AppEvents)  │
//! └──────────────┬──────────────────────────┬───────────────┘
//!                │                          │
//!                ▼                          ▼
//!        ┌──────────────┐          ┌──────────────────┐
//!        │ BleConnection│          │ ConfigSynchronizer│
//!        │ - handshake  │◄─────────│ - requests/writes │
//!        │ - teardown   │          │ - cache updates   │
//!        └──────┬───────┘          └────────┬─────────┘
//!               │                           │
//!               ▼                           ▼
//!        ┌──────────────┐          ┌──────────────────┐
//!        │  Transport   │          │     Protocol      │
//!        │ (WinRT/mock) │          │ - UUIDs, payloads │
//!        └──────────────┘          │ - record decoder  │
//!                                  └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers, write payloads and notification decoding
//! - [`transport`] - GATT client trait and the event channel types
//! - [`connection`] - Handshake state machine and ordered teardown
//! - [`sync`] - Configuration cache synchronization
//! - [`service`] - Main service coordinator
//! - `scanner`, `winrt` - Windows backend

pub mod connection;
pub mod protocol;
pub mod service;
pub mod sync;
pub mod transport;

#[cfg(windows)]
pub mod scanner;
#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub(crate) mod mock;

pub use service::CameraService;
