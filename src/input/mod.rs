//! Physical button input.
//!
//! Four buttons (active-low with internal pull-up) map to controller
//! requests:
//!   - Button 0 - move cursor left
//!   - Button 1 - move cursor up
//!   - Button 2 - erase all bonds
//!   - Button 3 - open pairing window; long press disconnects
//!
//! The debounced async tasks live in [`buttons`] (embedded only); the
//! mapping itself is pure so it can be tested on the host.

#[cfg(feature = "embedded")]
pub mod buttons;

use crate::config::MOVEMENT_SPEED;
use crate::reconnect::Request;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Button {
    Left,
    Up,
    EraseBonds,
    Pair,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Press {
    Short,
    /// Held for at least `LONG_PRESS_MS`.
    Long,
}

/// Physical button event (after debouncing).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ButtonEvent {
    pub button: Button,
    pub press: Press,
}

impl ButtonEvent {
    pub const fn short(button: Button) -> Self {
        Self {
            button,
            press: Press::Short,
        }
    }
}

/// Map a button event to the controller request it triggers.
pub fn request_for(event: ButtonEvent) -> Request {
    match (event.button, event.press) {
        (Button::Left, _) => Request::MoveCursor {
            dx: -MOVEMENT_SPEED,
            dy: 0,
        },
        (Button::Up, _) => Request::MoveCursor {
            dx: 0,
            dy: -MOVEMENT_SPEED,
        },
        (Button::EraseBonds, _) => Request::EraseBonds,
        (Button::Pair, Press::Short) => Request::PairingWindow,
        (Button::Pair, Press::Long) => Request::Disconnect,
    }
}
