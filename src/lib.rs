//! Stream-based, cancelable and identity-correlated access to a callback-driven
//! Bluetooth Low Energy host stack.
//!
//! A [`CentralSession`] owns the delegate of a [`HostCentral`] and turns every
//! callback into a stream or future. Side effects happen when those are first polled;
//! dropping them issues the inverse host action where one exists.

pub use models::*;

mod bridge;
mod cache;
mod central;
mod channel;
mod config;
mod correlation;
mod error;
mod models;
mod peripheral;

pub mod fake;
pub mod host;

#[cfg(feature = "btleplug")]
pub mod btleplug_host;

pub use central::CentralSession;
pub use config::SessionConfig;
pub use error::{Entity, Error, HostError, Operation, Result};
pub use host::{HostCentral, HostPeripheral};
pub use peripheral::Peripheral;
