//! Bluetooth Low Energy collaborator seam.
//!
//! The reconnection engine never talks to the SoftDevice directly. It
//! issues fire-and-forget requests through [`RadioStack`] and receives
//! the stack's outcomes later as [`RadioEvent`]s delivered by the main
//! loop.
//!
//! With the `embedded` feature the [`softdevice`] module provides the
//! S140 implementation: peripheral-role advertising, whitelist and
//! identity-list pushes, and a bonding security handler that doubles as
//! the bonded-peer registry.

#[cfg(feature = "embedded")]
pub mod softdevice;

use crate::error::Error;

/// Identifier of a bonded peer, as assigned by the peer registry.
///
/// `0xFF` is reserved as the free-slot sentinel of the device order and
/// can never name a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerId(u8);

impl PeerId {
    /// Wrap a raw registry id. Returns `None` for the free-slot sentinel.
    pub const fn new(raw: u8) -> Option<Self> {
        if raw == crate::config::ORDER_FREE {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

/// Link-layer connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnHandle(pub u16);

/// Advertising parameters for one advertising window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvProfile {
    /// Advertising interval in 0.625 ms units.
    pub interval: u16,
    /// Window length in seconds; the stack reports `AdvertisingTimedOut` when it
    /// elapses. `0` advertises until stopped.
    pub timeout_s: u16,
    /// Restrict connection requests to the pushed whitelist.
    pub use_whitelist: bool,
}

impl AdvProfile {
    /// Whether the stack ends this window on its own.
    pub const fn times_out(&self) -> bool {
        self.timeout_s != 0
    }
}

/// Identifies one advertising window.
///
/// The controller hands a fresh id to every mode change and the stack
/// echoes it in [`RadioEvent::AdvertisingTimedOut`], so a timeout that
/// races a mode switch is recognised as belonging to an older window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvWindow(pub u16);

impl AdvWindow {
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Subset of SoftDevice return codes the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackError {
    Busy,
    NoResources,
    InvalidState,
    SysAttrMissing,
    NotSupported,
    /// Any other raw error code.
    Raw(u32),
}

/// Outcomes reported by the radio stack, delivered on the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioEvent {
    /// A central connected. `peer` is set when the registry recognised it
    /// as an already bonded device.
    Connected {
        peer: Option<PeerId>,
        conn: ConnHandle,
    },
    /// The active link is gone, whoever closed it.
    Disconnected,
    /// Security was established with a bonded peer (new bond or re-encrypted link).
    Bonded(PeerId),
    /// The advertising window `window` ended without a connection.
    AdvertisingTimedOut { window: AdvWindow },
    /// The persistent record store ran out of space.
    StorageFull,
    /// The registry finished erasing every bond.
    BondsErased,
}

/// Requests the engine issues to the radio stack.
///
/// Every call is fire-and-forget: results arrive later as [`RadioEvent`]s.
pub trait RadioStack {
    /// Restrict connectable advertising to `peers`.
    fn set_whitelist(&mut self, peers: &[PeerId]) -> Result<(), StackError>;

    /// Push the identity-resolution keys of `peers`.
    fn set_identity_list(&mut self, peers: &[PeerId]) -> Result<(), StackError>;

    /// Open advertising window `window`. A timeout of that window is
    /// reported with the same id.
    fn start_advertising(&mut self, profile: AdvProfile, window: AdvWindow)
        -> Result<(), StackError>;

    fn stop_advertising(&mut self) -> Result<(), StackError>;

    fn disconnect(&mut self, conn: ConnHandle) -> Result<(), StackError>;

    /// Enumerate the bonded-peer registry: the first peer after `after`,
    /// or the first peer overall when `after` is `None`.
    fn next_peer_id(&self, after: Option<PeerId>) -> Option<PeerId>;

    /// Erase every bond. Completion is reported as [`RadioEvent::BondsErased`].
    fn delete_bonds(&mut self) -> Result<(), StackError>;

    /// Send one relative cursor movement input report.
    fn send_movement(&mut self, conn: ConnHandle, dx: i16, dy: i16) -> Result<(), StackError>;
}

/// Filter a stack result through a per-call allow-list.
///
/// Allowed codes are logged and swallowed; the call is not retried.
pub fn tolerate(
    result: Result<(), StackError>,
    allowed: &[StackError],
    call: &'static str,
) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if allowed.contains(&e) => {
            warn!("{=str}: ignoring {}", call, e);
            Ok(())
        }
        Err(e) => {
            error!("{=str}: {}", call, e);
            Err(Error::Stack(e))
        }
    }
}
