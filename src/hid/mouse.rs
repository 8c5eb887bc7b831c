//! Mouse movement reports.
//!
//! Report protocol layout (3 bytes, two signed 12-bit deltas):
//! ```text
//! Byte 0: X[7:0]
//! Byte 1: Y[3:0] << 4 | X[11:8]
//! Byte 2: Y[11:4]
//! ```

/// Movement report size in bytes.
pub const MOVEMENT_REPORT_SIZE: usize = 3;

const DELTA_MIN: i16 = -2048;
const DELTA_MAX: i16 = 2047;

/// Relative cursor movement, report protocol.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MovementReport {
    /// Relative X movement, clamped to the 12-bit range on packing.
    pub dx: i16,
    /// Relative Y movement, clamped to the 12-bit range on packing.
    pub dy: i16,
}

impl MovementReport {
    pub const fn new(dx: i16, dy: i16) -> Self {
        Self { dx, dy }
    }

    /// Pack into the 12-bit report protocol layout.
    pub fn pack(&self) -> [u8; MOVEMENT_REPORT_SIZE] {
        let x = self.dx.clamp(DELTA_MIN, DELTA_MAX) as u16 & 0x0FFF;
        let y = self.dy.clamp(DELTA_MIN, DELTA_MAX) as u16 & 0x0FFF;
        [
            (x & 0x00FF) as u8,
            (((y & 0x000F) << 4) | ((x & 0x0F00) >> 8)) as u8,
            ((y & 0x0FF0) >> 4) as u8,
        ]
    }
}
