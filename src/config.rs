//! Application-wide constants and compile-time configuration.
//!
//! All pool sizes, timing parameters, persistence constants and button
//! assignments live here so they can be tuned in one place.

use crate::ble::AdvProfile;

// Device order (MRU store)

/// Number of peers ranked by the MRU order store.
pub const ORDER_CAPACITY: usize = 5;

/// Number of order instances in the static pool (only one is used in practice).
pub const ORDER_POOL_SIZE: usize = 2;

/// Sentinel marking a free order slot. Matches erased flash.
pub const ORDER_FREE: u8 = 0xFF;

/// Validator appended to the persisted order record.
pub const ORDER_MAGIC: u32 = 0xAABB_CCDD;

/// Record key of the order in the record store.
pub const RECORD_KEY_ORDER: u16 = 0xABBA;

/// Write attempts per order change before a storage failure is surfaced.
/// `StorageError::Busy` is retried on the following main-loop iterations.
pub const STORAGE_RETRY_LIMIT: u8 = 3;

// Timer scheduler

/// Number of deferred callback slots.
pub const TIMER_SLOTS: usize = 5;

/// Period of the hardware tick source (ms).
pub const TICK_PERIOD_MS: u32 = 1;

// Reconnection policy

/// Maximum number of peers the radio stack accepts in a whitelist
/// (`BLE_GAP_WHITELIST_ADDR_MAX_COUNT`).
pub const WHITELIST_MAX: usize = 8;

/// Length of the scan phase of a reconnect cycle (ms).
pub const SCAN_TIMEOUT_MS: u32 = 10_000;

/// Full passes over the detected-device list before the directed sequence is abandoned.
pub const DIRECT_CONNECT_PASSES: u8 = 3;

/// Fast advertising interval, 0.625 ms units. 0x23 = 21.875 ms.
pub const ADV_FAST_INTERVAL: u16 = 0x0023;

/// Advertising profile of the reconnect scan and of the registry-wide
/// window that follows an abandoned directed sequence. No stack timeout:
/// the scan timer ends the scan window.
pub const ADV_SCAN_PROFILE: AdvProfile = AdvProfile {
    interval: ADV_FAST_INTERVAL,
    timeout_s: 0,
    use_whitelist: true,
};

/// Advertising profile of a directed-connect window.
pub const ADV_RECONNECT_PROFILE: AdvProfile = AdvProfile {
    interval: ADV_FAST_INTERVAL,
    timeout_s: 10,
    use_whitelist: true,
};

/// Advertising profile of the open pairing window.
pub const ADV_PAIRING_PROFILE: AdvProfile = AdvProfile {
    interval: ADV_FAST_INTERVAL,
    timeout_s: 60,
    use_whitelist: false,
};

// Input

/// Pixels the cursor moves per button press.
pub const MOVEMENT_SPEED: i16 = 5;

// GPIO pin assignments (nRF52840-DK defaults)
//
//   Button 0 (move left)      → P0.11
//   Button 1 (move up)        → P0.12
//   Button 2 (erase bonds)    → P0.24
//   Button 3 (pair / long: disconnect) → P0.25

/// Button debounce time (ms).
pub const BUTTON_DEBOUNCE_MS: u64 = 50;

/// Hold time that turns a press of the pairing button into a disconnect request (ms).
pub const LONG_PRESS_MS: u64 = 1_000;

// Flash storage

/// Flash page index where the record map starts (4 KB per page on nRF52840).
pub const STORAGE_FLASH_PAGE_START: u32 = 254;

/// Number of flash pages reserved for the record map.
pub const STORAGE_FLASH_PAGE_COUNT: u32 = 2;
