//! Nordic SoftDevice S140 implementation of [`RadioStack`].
//!
//! - **Bonder** - security handler that keeps the bonds and doubles as the
//!   bonded-peer registry. A peer's id is its slot index.
//! - **SoftdeviceRadio** - the synchronous request side. Whitelist,
//!   identity list and disconnect go straight to the SoftDevice; advertising
//!   start/stop are posted to the advertising task.
//! - **advertising_task** - runs connectable advertising windows, holds the
//!   live connection and reports outcomes back to the main loop.
//!
//! Communication with the main loop is done via Embassy channels owned by
//! `main.rs`.

use core::cell::RefCell;
use core::ptr;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::{Receiver, Sender};
use embassy_time::{Duration, Timer};
use heapless::Vec;
use nrf_softdevice::ble::gatt_server::{self, NotifyValueError};
use nrf_softdevice::ble::peripheral::{self, AdvertiseError, FilterPolicy};
use nrf_softdevice::ble::security::{IoCapabilities, SecurityHandler};
use nrf_softdevice::ble::{
    Address, Connection, EncryptionInfo, IdentityKey, MasterId, SecurityMode,
};
use nrf_softdevice::{raw, RawError, Softdevice};

use crate::ble::{AdvProfile, AdvWindow, ConnHandle, PeerId, RadioEvent, RadioStack, StackError};
use crate::config::WHITELIST_MAX;
use crate::hid::MovementReport;

/// Depth of the advertising command channel.
pub const ADV_COMMAND_DEPTH: usize = 4;

/// Depth of the radio event channel.
pub const RADIO_EVENT_DEPTH: usize = 8;

/// How often the advertising task checks whether the link is still up (ms).
const LINK_POLL_MS: u64 = 50;

#[rustfmt::skip]
const ADV_DATA: &[u8] = &[
    0x02, 0x01, raw::BLE_GAP_ADV_FLAGS_LE_ONLY_GENERAL_DISC_MODE as u8,
    0x03, 0x03, 0x12, 0x18, // Complete list of 16-bit UUIDs: HID service
    0x03, 0x19, 0xC2, 0x03, // Appearance: mouse
];

#[rustfmt::skip]
const SCAN_DATA: &[u8] = &[
    0x0A, 0x09, b'B', b'L', b'E', b' ', b'M', b'o', b'u', b's', b'e',
];

/// Requests posted to the advertising task.
#[derive(Clone, Copy, defmt::Format)]
pub enum AdvCommand {
    Start(AdvProfile, AdvWindow),
    Stop,
}

pub type AdvCommandSender = Sender<'static, CriticalSectionRawMutex, AdvCommand, ADV_COMMAND_DEPTH>;
pub type AdvCommandReceiver = Receiver<'static, CriticalSectionRawMutex, AdvCommand, ADV_COMMAND_DEPTH>;
pub type RadioEventSender = Sender<'static, CriticalSectionRawMutex, RadioEvent, RADIO_EVENT_DEPTH>;

/// Map a SoftDevice error onto the codes the engine distinguishes.
pub fn stack_error(e: RawError) -> StackError {
    match e {
        RawError::Busy => StackError::Busy,
        RawError::NoMem | RawError::Resources => StackError::NoResources,
        RawError::InvalidState => StackError::InvalidState,
        RawError::GattsSysAttrMissing => StackError::SysAttrMissing,
        RawError::NotSupported => StackError::NotSupported,
        other => StackError::Raw(other as u32),
    }
}

// Bonded-peer registry

#[derive(Clone)]
struct PeerBond {
    master_id: MasterId,
    key: EncryptionInfo,
    peer_id: IdentityKey,
}

pub struct Bonder {
    peers: RefCell<[Option<PeerBond>; WHITELIST_MAX]>,
    events: RadioEventSender,
}

impl Bonder {
    pub fn new(events: RadioEventSender) -> Self {
        Self {
            peers: RefCell::new([const { None }; WHITELIST_MAX]),
            events,
        }
    }

    /// Registry id of the bonded device behind `addr`, resolving private addresses.
    pub fn peer_for(&self, addr: Address) -> Option<PeerId> {
        self.peers.borrow().iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|bond| bond.peer_id.is_match(addr))
                .and_then(|_| PeerId::new(i as u8))
        })
    }

    /// First bonded peer after `after` in slot order.
    pub fn next_after(&self, after: Option<PeerId>) -> Option<PeerId> {
        let start = after.map_or(0, |p| p.raw() as usize + 1);
        let peers = self.peers.borrow();
        (start..WHITELIST_MAX)
            .find(|&i| peers[i].is_some())
            .and_then(|i| PeerId::new(i as u8))
    }

    fn identity(&self, peer: PeerId) -> Option<IdentityKey> {
        self.peers
            .borrow()
            .get(peer.raw() as usize)
            .and_then(Option::as_ref)
            .map(|bond| bond.peer_id.clone())
    }

    fn erase_all(&self) {
        self.peers.borrow_mut().iter_mut().for_each(|slot| *slot = None);
    }

    fn notify(&self, event: RadioEvent) {
        if self.events.try_send(event).is_err() {
            warn!("Radio event queue full, dropped {}", event);
        }
    }
}

impl SecurityHandler for Bonder {
    fn io_capabilities(&self) -> IoCapabilities {
        IoCapabilities::None
    }

    fn can_bond(&self, _conn: &Connection) -> bool {
        true
    }

    fn on_bonded(
        &self,
        _conn: &Connection,
        master_id: MasterId,
        key: EncryptionInfo,
        peer_id: IdentityKey,
    ) {
        let addr = peer_id.addr;
        let bond = PeerBond {
            master_id,
            key,
            peer_id,
        };
        let slot = {
            let mut peers = self.peers.borrow_mut();
            let existing = peers.iter().position(|slot| {
                slot.as_ref()
                    .is_some_and(|p| p.master_id == master_id || p.peer_id.is_match(addr))
            });
            match existing.or_else(|| peers.iter().position(Option::is_none)) {
                Some(i) => {
                    peers[i] = Some(bond);
                    Some(i)
                }
                None => None,
            }
        };

        match slot.and_then(|i| PeerId::new(i as u8)) {
            Some(peer) => {
                info!("Bonded peer {}", peer);
                self.notify(RadioEvent::Bonded(peer));
            }
            None => warn!("Bond registry full, bond not kept"),
        }
    }

    fn get_key(&self, _conn: &Connection, master_id: MasterId) -> Option<EncryptionInfo> {
        self.peers
            .borrow()
            .iter()
            .flatten()
            .find_map(|p| (p.master_id == master_id).then_some(p.key))
    }

    fn get_peripheral_key(&self, conn: &Connection) -> Option<(MasterId, EncryptionInfo)> {
        self.peers.borrow().iter().flatten().find_map(|p| {
            p.peer_id
                .is_match(conn.peer_address())
                .then_some((p.master_id, p.key))
        })
    }

    fn on_security_update(&self, conn: &Connection, mode: SecurityMode) {
        debug!("BLE security mode updated: {}", mode);
        if matches!(mode, SecurityMode::NoAccess | SecurityMode::Open) {
            return;
        }
        // Re-encrypted link of a known bond; fresh bonds are reported by `on_bonded`.
        if let Some(peer) = self.peer_for(conn.peer_address()) {
            self.notify(RadioEvent::Bonded(peer));
        }
    }
}

// Live connection

/// The connection currently held by the advertising task.
pub struct ActiveLink(Mutex<CriticalSectionRawMutex, RefCell<Option<Connection>>>);

impl ActiveLink {
    pub const fn new() -> Self {
        Self(Mutex::new(RefCell::new(None)))
    }

    fn set(&self, conn: Option<Connection>) {
        self.0.lock(|link| *link.borrow_mut() = conn);
    }

    fn get(&self, handle: ConnHandle) -> Option<Connection> {
        self.0.lock(|link| {
            link.borrow()
                .as_ref()
                .filter(|c| c.handle() == Some(handle.0))
                .cloned()
        })
    }
}

// Request side

pub struct SoftdeviceRadio {
    bonder: &'static Bonder,
    link: &'static ActiveLink,
    commands: AdvCommandSender,
    /// Value handle of the HID movement input report, if the GATT server exposes one.
    report_handle: Option<u16>,
}

impl SoftdeviceRadio {
    pub fn new(
        bonder: &'static Bonder,
        link: &'static ActiveLink,
        commands: AdvCommandSender,
        report_handle: Option<u16>,
    ) -> Self {
        Self {
            bonder,
            link,
            commands,
            report_handle,
        }
    }

    fn post(&self, cmd: AdvCommand) -> Result<(), StackError> {
        self.commands.try_send(cmd).map_err(|_| StackError::NoResources)
    }
}

impl RadioStack for SoftdeviceRadio {
    fn set_whitelist(&mut self, peers: &[PeerId]) -> Result<(), StackError> {
        let addrs: Vec<raw::ble_gap_addr_t, WHITELIST_MAX> = peers
            .iter()
            .filter_map(|&p| self.bonder.identity(p))
            .map(|key| key.addr.into_raw())
            .collect();
        let ptrs: Vec<*const raw::ble_gap_addr_t, WHITELIST_MAX> =
            addrs.iter().map(|a| a as *const _).collect();
        let list = if ptrs.is_empty() { ptr::null() } else { ptrs.as_ptr() };

        let ret = unsafe { raw::sd_ble_gap_whitelist_set(list, ptrs.len() as u8) };
        RawError::convert(ret).map_err(stack_error)
    }

    fn set_identity_list(&mut self, peers: &[PeerId]) -> Result<(), StackError> {
        let keys: Vec<raw::ble_gap_id_key_t, WHITELIST_MAX> = peers
            .iter()
            .filter_map(|&p| self.bonder.identity(p))
            .map(|key| raw::ble_gap_id_key_t {
                id_info: *key.irk.as_raw(),
                id_addr_info: key.addr.into_raw(),
            })
            .collect();
        let ptrs: Vec<*const raw::ble_gap_id_key_t, WHITELIST_MAX> =
            keys.iter().map(|k| k as *const _).collect();
        let list = if ptrs.is_empty() { ptr::null() } else { ptrs.as_ptr() };

        let ret = unsafe { raw::sd_ble_gap_device_identities_set(list, ptr::null(), ptrs.len() as u8) };
        RawError::convert(ret).map_err(stack_error)
    }

    fn start_advertising(&mut self, profile: AdvProfile, window: AdvWindow) -> Result<(), StackError> {
        self.post(AdvCommand::Start(profile, window))
    }

    fn stop_advertising(&mut self) -> Result<(), StackError> {
        self.post(AdvCommand::Stop)
    }

    fn disconnect(&mut self, conn: ConnHandle) -> Result<(), StackError> {
        let ret = unsafe {
            raw::sd_ble_gap_disconnect(
                conn.0,
                raw::BLE_HCI_REMOTE_USER_TERMINATED_CONNECTION as u8,
            )
        };
        RawError::convert(ret).map_err(stack_error)
    }

    fn next_peer_id(&self, after: Option<PeerId>) -> Option<PeerId> {
        self.bonder.next_after(after)
    }

    fn delete_bonds(&mut self) -> Result<(), StackError> {
        self.bonder.erase_all();
        self.bonder.notify(RadioEvent::BondsErased);
        Ok(())
    }

    fn send_movement(&mut self, conn: ConnHandle, dx: i16, dy: i16) -> Result<(), StackError> {
        let Some(report_handle) = self.report_handle else {
            debug!("No movement report characteristic");
            return Err(StackError::InvalidState);
        };
        let Some(link) = self.link.get(conn) else {
            return Err(StackError::InvalidState);
        };
        let report = MovementReport::new(dx, dy).pack();
        gatt_server::notify_value(&link, report_handle, &report).map_err(|e| match e {
            NotifyValueError::Disconnected => StackError::InvalidState,
            NotifyValueError::Raw(e) => stack_error(e),
        })
    }
}

// Advertising task

fn adv_config(profile: &AdvProfile) -> peripheral::Config {
    peripheral::Config {
        interval: u32::from(profile.interval),
        // 10 ms units.
        timeout: profile
            .times_out()
            .then(|| profile.timeout_s.saturating_mul(100)),
        filter_policy: if profile.use_whitelist {
            FilterPolicy::Both
        } else {
            FilterPolicy::Any
        },
        ..Default::default()
    }
}

/// Run advertising windows on request and report their outcome.
pub async fn advertising_task(
    sd: &'static Softdevice,
    bonder: &'static Bonder,
    link: &'static ActiveLink,
    commands: AdvCommandReceiver,
    events: RadioEventSender,
) -> ! {
    let mut pending: Option<AdvCommand> = None;

    loop {
        let cmd = match pending.take() {
            Some(cmd) => cmd,
            None => commands.receive().await,
        };
        let AdvCommand::Start(profile, window) = cmd else {
            continue;
        };
        let timed_out = RadioEvent::AdvertisingTimedOut { window };

        debug!("Advertising window {}: {}", window, profile);
        let config = adv_config(&profile);
        let adv = peripheral::ConnectableAdvertisement::ScannableUndirected {
            adv_data: ADV_DATA,
            scan_data: SCAN_DATA,
        };

        // Dropping the advertise future stops advertising.
        match select(
            commands.receive(),
            peripheral::advertise_pairable(sd, adv, &config, bonder),
        )
        .await
        {
            Either::First(next) => pending = Some(next),
            Either::Second(Ok(conn)) => {
                let Some(handle) = conn.handle() else {
                    events.send(timed_out).await;
                    continue;
                };
                let peer = bonder.peer_for(conn.peer_address());
                info!("Connected, handle {}, peer {}", handle, peer);
                link.set(Some(conn.clone()));
                events
                    .send(RadioEvent::Connected {
                        peer,
                        conn: ConnHandle(handle),
                    })
                    .await;

                pending = hold_link(&conn, &commands).await;
                link.set(None);
                info!("Disconnected");
                events.send(RadioEvent::Disconnected).await;
            }
            Either::Second(Err(AdvertiseError::Timeout)) => {
                events.send(timed_out).await;
            }
            Either::Second(Err(e)) => {
                warn!("Advertising failed: {:?}", e);
                events.send(timed_out).await;
            }
        }
    }
}

/// Wait for the link to drop. Commands received meanwhile are kept, latest wins.
async fn hold_link(conn: &Connection, commands: &AdvCommandReceiver) -> Option<AdvCommand> {
    let mut pending = None;
    while conn.handle().is_some() {
        match select(
            commands.receive(),
            Timer::after(Duration::from_millis(LINK_POLL_MS)),
        )
        .await
        {
            Either::First(cmd) => pending = Some(cmd),
            Either::Second(()) => {}
        }
    }
    pending
}
