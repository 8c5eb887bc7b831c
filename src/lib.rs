//! Reconnection policy engine for a BLE HID peripheral.
//!
//! The library holds everything that can be tested on the host: the MRU
//! device order, the millisecond timer scheduler, the reconnection
//! controller, button mapping and movement report packing.
//!
//! Usage: `cargo test`
//!
//! Note: The embedded binary (`--features embedded`) uses main.rs with
//! #![no_std] and #![no_main] and adds the SoftDevice and flash adapters
//! behind the same feature.

#![cfg_attr(not(test), no_std)]

// This must go first so the logging macros are visible to every module.
pub(crate) mod fmt;

// ═══════════════════════════════════════════════════════════════════════════
// Policy core
// ═══════════════════════════════════════════════════════════════════════════

pub mod config;
pub mod error;
pub mod order;
pub mod reconnect;
pub mod storage;
pub mod timer;

// ═══════════════════════════════════════════════════════════════════════════
// Collaborator seams and input/output mapping
// ═══════════════════════════════════════════════════════════════════════════

pub mod ble;
pub mod hid;
pub mod input;

pub use ble::{AdvProfile, AdvWindow, ConnHandle, PeerId, RadioEvent, RadioStack, StackError};
pub use error::Error;
pub use order::{DeviceOrder, OrderPool, OrderSlot};
pub use reconnect::{AdvMode, ConnectionState, Controller, Request};
pub use storage::{RecordStore, SaveRetry, SaveStep, StorageError};
pub use timer::{Scheduler, TimerHandle, TimerPool};
