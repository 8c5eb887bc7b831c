//! GPIO button input with async debouncing.
//!
//! Each button is handled by an async task that waits for a GPIO edge,
//! debounces it, measures how long it is held and sends a `ButtonEvent`
//! to the main loop.

use crate::config::{BUTTON_DEBOUNCE_MS, LONG_PRESS_MS};
use crate::input::{Button, ButtonEvent, Press};
use embassy_futures::select::{select, Either};
use embassy_nrf::gpio::{AnyPin, Input, Pull};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use embassy_time::{Duration, Timer};

/// Run a single button polling loop.
///
/// Waits for the pin to go low (pressed), debounces, classifies the press
/// as short or long, sends the event, then waits for release before
/// repeating.
pub async fn button_task(
    pin: AnyPin,
    button: Button,
    tx: &Sender<'static, CriticalSectionRawMutex, ButtonEvent, 4>,
) -> ! {
    let mut btn = Input::new(pin, Pull::Up);

    loop {
        // Wait for falling edge (button press, active-low).
        btn.wait_for_falling_edge().await;

        // Debounce: wait and re-check.
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
        if btn.is_high() {
            continue;
        }

        let held = Timer::after(Duration::from_millis(LONG_PRESS_MS - BUTTON_DEBOUNCE_MS));
        let press = match select(btn.wait_for_rising_edge(), held).await {
            Either::First(()) => Press::Short,
            Either::Second(()) => Press::Long,
        };

        let event = ButtonEvent { button, press };
        info!("Button: {}", event);
        tx.send(event).await;

        // Wait for release to avoid repeat triggers.
        if btn.is_low() {
            btn.wait_for_rising_edge().await;
        }
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
    }
}
