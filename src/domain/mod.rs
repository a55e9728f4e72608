//! Domain types: configuration cache, discovered peers, capture plans and settings.

pub mod capture;
pub mod config;
pub mod models;
pub mod peers;
pub mod settings;
