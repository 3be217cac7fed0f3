//! Bluetooth Module
//!
//! Provides the BLE link to the ESP32 motion peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           ConnectionHandle  ──►  connection actor        │
//! │  (public API)                  (service: state machine)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┬──────────────┐
//!         │             │              │              │
//!         ▼             ▼              ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌────────────┐
//! │  Scanner  │  │ Connection │  │  Framer  │  │ Transport  │
//! │ - bounded │  │ - config   │  │ - lines  │  │ - WinRT    │
//! │   scan    │  │ - GATT     │  │ - decode │  │ - replay   │
//! └───────────┘  └────────────┘  └──────────┘  └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Profile UUIDs, outbound commands, and line decoding
//! - [`framer`] - Reassembly of notification chunks into lines
//! - [`scanner`] - Bounded BLE discovery
//! - [`connection`] - Connection parameters and characteristic resolution
//! - [`transport`] - The seam between the actor and a radio backend
//! - [`service`] - The connection actor and its handle
//! - [`replay`] - Simulated peripheral fed from a capture file
//! - `winrt` - Windows radio backend

pub mod connection;
pub mod framer;
pub mod protocol;
pub mod replay;
pub mod scanner;
pub mod service;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub(crate) mod mock;

pub use service::{ConnectionHandle, LinkEvent};
