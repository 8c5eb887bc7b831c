//! HID input reports sent over the BLE link.
//!
//! Only relative cursor movement is produced here; the GATT HID service
//! that carries the bytes lives in the radio-stack collaborator.

pub mod mouse;

pub use mouse::{MovementReport, MOVEMENT_REPORT_SIZE};
