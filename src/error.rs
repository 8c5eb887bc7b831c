//! Unified error type for the reconnection engine.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` for efficient on-target logging.

use crate::ble::StackError;
use crate::storage::StorageError;

/// Top-level error type used across the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A radio-stack call failed with a code outside that call's allow-list.
    Stack(StackError),

    /// The order record could not be persisted or garbage-collected.
    Storage(StorageError),

    /// Every timer callback slot is already registered.
    TimerPoolExhausted,

    /// Every device order instance is already allocated.
    OrderPoolExhausted,
}

impl Error {
    /// Whether the main loop must reset the device.
    ///
    /// Storage failures are logged and the device keeps running with the
    /// in-RAM order; everything else leaves the engine in an unknown state.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Storage(_))
    }
}

// Convenience conversions

impl From<StackError> for Error {
    fn from(e: StackError) -> Self {
        Error::Stack(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::Storage(e)
    }
}
