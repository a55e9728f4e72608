//! Companion client for Astro camera devices over Bluetooth LE.
//!
//! The library owns the device protocol, the connection state machine and the
//! configuration cache. `src/main.rs` is a thin command line shell over
//! [`infrastructure::bluetooth::CameraService`].

pub mod domain;
pub mod ffi;
pub mod infrastructure;
