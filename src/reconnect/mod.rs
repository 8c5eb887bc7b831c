//! Reconnection controller.
//!
//! Decides which bonded central may connect, in what order and for how
//! long the peripheral advertises:
//!
//! 1. **Scan** - advertise to the whole bonded registry for
//!    [`SCAN_TIMEOUT_MS`]. Every connection is only a presence signal: it
//!    is dropped at once and the peer is recorded by its MRU rank.
//! 2. **Connection** - offer one directed window per detected peer, most
//!    recently used first. After [`DIRECT_CONNECT_PASSES`] unsuccessful
//!    passes the sequence is abandoned and the whole registry is
//!    whitelisted until any bonded peer connects.
//!
//! With no bonded peers the controller opens a pairing window instead.
//!
//! Every mode change opens a new [`AdvWindow`]. A stack timeout naming an
//! older window is dropped, so a timeout racing a mode switch can never
//! consume the window that replaced it.
//!
//! All methods run on the main loop and never block. Radio requests are
//! fire-and-forget; their outcomes come back through
//! [`Controller::handle_event`]. [`Controller::tick`] reconciles the
//! desired and actual advertising state once per loop iteration.
//!
//! [`DIRECT_CONNECT_PASSES`]: crate::config::DIRECT_CONNECT_PASSES

pub mod phase;


use heapless::Vec;

use crate::ble::{
    tolerate, AdvProfile, AdvWindow, ConnHandle, PeerId, RadioEvent, RadioStack, StackError,
};
use crate::config::{
    ADV_PAIRING_PROFILE, ADV_RECONNECT_PROFILE, ADV_SCAN_PROFILE, SCAN_TIMEOUT_MS,
    STORAGE_RETRY_LIMIT, WHITELIST_MAX,
};
use crate::error::Error;
use crate::order::DeviceOrder;
use crate::storage::{RecordStore, StorageError};
use crate::timer::{Scheduler, TimerHandle, TimerPool};

pub use phase::{transition, Action, AdvMode, Advance, Phase, PhaseEvent, PhaseEventKind, ScanConnectPhase};

/// State of the (single) link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    Connect,
    /// Disconnect requested by the controller, waiting for the stack.
    StartDisconnect,
    Disconnect,
}

/// User-level requests, typically mapped from buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    MoveCursor { dx: i16, dy: i16 },
    PairingWindow,
    EraseBonds,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvertisingState {
    pub mode: AdvMode,
    /// Whether the controller wants the stack to advertise.
    pub desired: bool,
    /// Whether the stack is believed to be advertising.
    pub actual: bool,
    /// The current link belongs to a bonded peer, either known when it
    /// connected or bonded since.
    pub prev_conn: bool,
    /// Bond erase requested, applied once the link is down.
    pub erase_pending: bool,
    /// Profile used for the next advertising start.
    pub profile: AdvProfile,
    /// Window opened by the latest mode change.
    pub window: AdvWindow,
}

pub struct Controller<'a, R, S> {
    radio: R,
    store: S,
    order: &'a mut DeviceOrder,
    timers: &'a TimerPool,
    scan_timer: TimerHandle,

    adv: AdvertisingState,
    link: ConnectionState,
    conn: Option<ConnHandle>,
    whitelist: Vec<PeerId, WHITELIST_MAX>,
    phase: ScanConnectPhase,
    scan_started_at: u32,

    /// Error raised inside a timer callback, reported by the next `tick`.
    fault: Option<Error>,
    order_dirty: bool,
    persist_attempts: u8,
}

impl<'a, R: RadioStack, S: RecordStore> Controller<'a, R, S> {
    /// Create an idle controller and register its scan timeout with `scheduler`.
    pub fn new(
        radio: R,
        store: S,
        order: &'a mut DeviceOrder,
        scheduler: &mut Scheduler<'a, Self>,
    ) -> Result<Self, Error> {
        let scan_timer = scheduler
            .register(Self::on_scan_timeout)
            .ok_or(Error::TimerPoolExhausted)?;

        Ok(Self {
            radio,
            store,
            order,
            timers: scheduler.pool(),
            scan_timer,
            adv: AdvertisingState {
                mode: AdvMode::Idle,
                desired: false,
                actual: false,
                prev_conn: false,
                erase_pending: false,
                profile: ADV_RECONNECT_PROFILE,
                window: AdvWindow::default(),
            },
            link: ConnectionState::Disconnect,
            conn: None,
            whitelist: Vec::new(),
            phase: ScanConnectPhase::new(),
            scan_started_at: 0,
            fault: None,
            order_dirty: false,
            persist_attempts: 0,
        })
    }

    /// Restore the persisted order and enter the directed-reconnect sequence.
    ///
    /// Ranks of peers the registry no longer enumerates are dropped and
    /// the pruned order is written back.
    pub fn start(&mut self) -> Result<(), Error> {
        match self.order.restore(&mut self.store) {
            Ok(true) => info!("Restored order of {} peers", self.order.count()),
            Ok(false) => info!("No stored order, starting empty"),
            Err(e) => warn!("Order restore failed: {}", e),
        }

        let radio = &self.radio;
        let pruned = self.order.retain(|peer| in_registry(radio, peer));
        if pruned > 0 {
            info!("Dropped {} ranks without a bond", pruned);
            self.order_dirty = true;
        }

        self.start_reconnect()?;
        self.flush_order()
    }

    /// Begin a fresh directed-reconnect sequence.
    pub fn start_reconnect(&mut self) -> Result<(), Error> {
        self.phase.reset();
        self.set_mode(AdvMode::ReconnectScan, None)
    }

    /// Switch advertising mode. `target` names the peer of a
    /// [`AdvMode::ReconnectConnect`] window and is ignored otherwise.
    pub fn set_mode(&mut self, mode: AdvMode, target: Option<PeerId>) -> Result<(), Error> {
        self.adv.window = self.adv.window.next();
        match mode {
            AdvMode::Idle => {
                info!("Mode -> Idle");
                self.adv.mode = AdvMode::Idle;
                return self.stop_advertising();
            }
            AdvMode::AddNew => {
                self.whitelist.clear();
                self.adv.profile = ADV_PAIRING_PROFILE;
            }
            AdvMode::ReconnectScan => {
                self.load_registry();
                if self.whitelist.is_empty() {
                    info!("No bonded peers, opening pairing window");
                    return self.set_mode(AdvMode::AddNew, None);
                }
                self.phase.begin_scan();
                self.timers.arm(self.scan_timer, SCAN_TIMEOUT_MS);
                self.scan_started_at = self.timers.now();
                self.adv.profile = ADV_SCAN_PROFILE;
            }
            AdvMode::ReconnectConnect => {
                let Some(peer) = target else {
                    warn!("Directed window without target, rescanning");
                    return self.set_mode(AdvMode::ReconnectScan, None);
                };
                self.whitelist.clear();
                let _ = self.whitelist.push(peer);
                self.adv.profile = ADV_RECONNECT_PROFILE;
            }
            AdvMode::ReconnectAny => {
                self.load_registry();
                if self.whitelist.is_empty() {
                    info!("No bonded peers left, opening pairing window");
                    return self.set_mode(AdvMode::AddNew, None);
                }
                self.adv.profile = ADV_SCAN_PROFILE;
            }
        }

        info!("Mode -> {} ({} whitelisted)", mode, self.whitelist.len());
        self.adv.mode = mode;
        self.stop_advertising()?;
        self.push_whitelist()?;
        self.start_advertising()
    }

    /// Feed one radio-stack outcome into the controller.
    pub fn handle_event(&mut self, event: RadioEvent) -> Result<(), Error> {
        debug!("Radio event {}", event);
        match event {
            RadioEvent::Connected { peer, conn } => {
                if self.link != ConnectionState::Disconnect {
                    // Single-link stack: the held link is reported down first.
                    warn!("Connect {} while a link is held, ignored", conn);
                    return Ok(());
                }
                self.link = ConnectionState::Connect;
                self.conn = Some(conn);
                // The stack stops advertising when a connection forms.
                self.adv.actual = false;
                self.adv.prev_conn = peer.is_some();
                match peer {
                    Some(peer) => {
                        if self.adv.mode == AdvMode::AddNew {
                            self.dispatch(PhaseEvent::ConnectPrevious)
                        } else {
                            self.dispatch(PhaseEvent::StartConnect(peer))
                        }
                    }
                    None => self.dispatch(PhaseEvent::GenericConnect),
                }
            }
            RadioEvent::Disconnected => {
                if self.link == ConnectionState::Disconnect {
                    debug!("Disconnect without a link, ignored");
                    return Ok(());
                }
                let solicited = self.link == ConnectionState::StartDisconnect;
                let bonded = self.adv.prev_conn;
                self.link = ConnectionState::Disconnect;
                self.conn = None;
                self.adv.actual = false;
                self.adv.prev_conn = false;
                if solicited {
                    Ok(())
                } else if !bonded && self.adv.mode == AdvMode::AddNew {
                    info!("Pairing attempt dropped, reopening pairing window");
                    self.set_mode(AdvMode::AddNew, None)
                } else {
                    info!("Link lost, restarting reconnect");
                    self.start_reconnect()
                }
            }
            RadioEvent::Bonded(peer) => {
                if self.link != ConnectionState::Connect {
                    debug!("Bond of released link {} not ranked", peer);
                    return Ok(());
                }
                self.adv.prev_conn = true;
                if !self.order.insert(peer).changed() {
                    debug!("Peer {} already most recent", peer);
                    return Ok(());
                }
                self.order_dirty = true;
                self.flush_order()
            }
            RadioEvent::AdvertisingTimedOut { window } => {
                if window != self.adv.window {
                    debug!("Timeout of superseded window {} ignored", window);
                    return Ok(());
                }
                self.adv.actual = false;
                match self.adv.mode {
                    AdvMode::ReconnectConnect => self.dispatch(PhaseEvent::StopAdvertising),
                    AdvMode::AddNew => {
                        info!("Pairing window closed");
                        self.set_mode(AdvMode::Idle, None)
                    }
                    AdvMode::ReconnectAny => self.dispatch(PhaseEvent::StopAdvertising),
                    // The scan timer owns the scan window; `tick` restarts advertising.
                    AdvMode::ReconnectScan | AdvMode::Idle => Ok(()),
                }
            }
            RadioEvent::StorageFull => match self.store.collect_garbage() {
                Ok(()) => Ok(()),
                Err(StorageError::Busy) => {
                    warn!("Garbage collection busy");
                    Ok(())
                }
                Err(e) => Err(Error::Storage(e)),
            },
            RadioEvent::BondsErased => self.start_reconnect(),
        }
    }

    /// Apply a user-level request.
    pub fn request(&mut self, request: Request) -> Result<(), Error> {
        debug!("Request {}", request);
        match request {
            Request::MoveCursor { dx, dy } => match (self.link, self.conn) {
                (ConnectionState::Connect, Some(conn)) => tolerate(
                    self.radio.send_movement(conn, dx, dy),
                    &[
                        StackError::InvalidState,
                        StackError::NoResources,
                        StackError::SysAttrMissing,
                        StackError::Busy,
                    ],
                    "movement",
                ),
                _ => Ok(()),
            },
            Request::PairingWindow => self.set_mode(AdvMode::AddNew, None),
            Request::EraseBonds => {
                info!("Bond erase requested");
                self.adv.erase_pending = true;
                Ok(())
            }
            Request::Disconnect => self.disconnect(),
        }
    }

    /// Main-loop reconciliation. Call once per loop iteration.
    pub fn tick(&mut self) -> Result<(), Error> {
        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }

        if self.adv.desired != self.adv.actual && self.link == ConnectionState::Disconnect {
            if self.adv.desired {
                self.radio_start()?;
            } else {
                self.radio_stop()?;
            }
        }

        if self.adv.erase_pending && self.link == ConnectionState::Disconnect {
            self.adv.erase_pending = false;
            info!("Erasing all bonds");
            tolerate(self.radio.delete_bonds(), &[StackError::Busy], "bond erase")?;
            self.order.clear();
            self.order_dirty = true;
        }

        self.flush_order()
    }

    /// Scan-window timeout, run by the scheduler.
    ///
    /// There is no cancel, so a timeout left over from an earlier scan is ignored.
    pub fn on_scan_timeout(&mut self) {
        if self.adv.mode != AdvMode::ReconnectScan || self.phase.phase() != Phase::Scanning {
            debug!("Stale scan timeout ignored");
            return;
        }
        info!(
            "Scan window closed after {} ms",
            self.timers.now().wrapping_sub(self.scan_started_at)
        );
        if let Err(e) = self.end_scan_window() {
            self.fault = Some(e);
        }
    }

    pub fn mode(&self) -> AdvMode {
        self.adv.mode
    }

    pub fn advertising(&self) -> &AdvertisingState {
        &self.adv
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link
    }

    pub fn conn(&self) -> Option<ConnHandle> {
        self.conn
    }

    pub fn phase(&self) -> &ScanConnectPhase {
        &self.phase
    }

    pub fn whitelist(&self) -> &[PeerId] {
        &self.whitelist
    }

    pub fn order(&self) -> &DeviceOrder {
        &*self.order
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    // Phase machine

    fn dispatch(&mut self, event: PhaseEvent) -> Result<(), Error> {
        let action = transition(self.adv.mode, self.phase.phase(), event.kind());
        debug!("{} in {}/{} -> {}", event, self.adv.mode, self.phase.phase(), action);

        match (action, event) {
            (Action::Ignore, _) => Ok(()),
            (Action::ForceDisconnect, _) => self.disconnect(),
            (Action::StopAdvertising, _) => self.stop_advertising(),
            (Action::RecordDetection, PhaseEvent::StartConnect(peer)) => self.record_detection(peer),
            (Action::RecordDetection, _) => Ok(()),
            (Action::FinishScan, _) => self.finish_scan(),
            (Action::ConfirmTarget, _) => {
                info!("Reconnected in {}, keeping link", self.adv.mode);
                self.stop_advertising()
            }
            (Action::NextCandidate, _) => self.next_candidate(),
        }
    }

    fn record_detection(&mut self, peer: PeerId) -> Result<(), Error> {
        if let Some(pos) = self.whitelist.iter().position(|&p| p == peer) {
            self.whitelist.remove(pos);
        }
        self.push_whitelist()?;
        self.disconnect()?;

        match self.order.rank_of(peer) {
            Some(rank) => {
                if self.phase.record(rank, peer) {
                    debug!("Detected peer {} at rank {}", peer, rank);
                }
            }
            None => debug!("Detected peer {} has no rank", peer),
        }

        let detected = self.phase.detected_count();
        if detected > 0 && detected >= self.order.count() {
            info!("All {} ranked peers detected, ending scan early", detected);
            self.end_scan_window()?;
        }
        Ok(())
    }

    fn end_scan_window(&mut self) -> Result<(), Error> {
        self.stop_advertising()?;
        self.dispatch(PhaseEvent::StopAdvertising)
    }

    fn finish_scan(&mut self) -> Result<(), Error> {
        match self.phase.begin_connection() {
            Some(first) => {
                info!("Scan detected {} peers", self.phase.detected_count());
                self.set_mode(AdvMode::ReconnectConnect, Some(first))
            }
            None => {
                info!("Scan detected no peers, rescanning");
                self.set_mode(AdvMode::ReconnectScan, None)
            }
        }
    }

    fn next_candidate(&mut self) -> Result<(), Error> {
        match self.phase.advance() {
            Advance::Next(peer) => self.set_mode(AdvMode::ReconnectConnect, Some(peer)),
            Advance::Rescan => {
                info!("Pass {} over detected peers failed, rescanning", self.phase.loops());
                self.set_mode(AdvMode::ReconnectScan, None)
            }
            Advance::Abandon => {
                warn!("Directed reconnect abandoned after {} passes", self.phase.loops());
                self.set_mode(AdvMode::ReconnectAny, None)
            }
        }
    }

    // Link and advertising state

    fn start_advertising(&mut self) -> Result<(), Error> {
        self.adv.desired = true;
        match self.link {
            // Advertising resumes once the link is down.
            ConnectionState::Connect => self.disconnect(),
            ConnectionState::StartDisconnect => Ok(()),
            ConnectionState::Disconnect if !self.adv.actual => self.radio_start(),
            ConnectionState::Disconnect => Ok(()),
        }
    }

    fn stop_advertising(&mut self) -> Result<(), Error> {
        self.adv.desired = false;
        if self.link == ConnectionState::Disconnect && self.adv.actual {
            self.radio_stop()?;
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        let (ConnectionState::Connect, Some(conn)) = (self.link, self.conn) else {
            return Ok(());
        };
        self.link = ConnectionState::StartDisconnect;
        tolerate(
            self.radio.disconnect(conn),
            &[StackError::InvalidState],
            "disconnect",
        )
    }

    fn radio_start(&mut self) -> Result<(), Error> {
        self.adv.actual = true;
        tolerate(
            self.radio.start_advertising(self.adv.profile, self.adv.window),
            &[],
            "adv start",
        )
    }

    fn radio_stop(&mut self) -> Result<(), Error> {
        self.adv.actual = false;
        // The stack may have timed out already.
        tolerate(
            self.radio.stop_advertising(),
            &[StackError::InvalidState],
            "adv stop",
        )
    }

    // Whitelist

    fn load_registry(&mut self) {
        self.whitelist.clear();
        let mut cursor = None;
        while let Some(peer) = self.radio.next_peer_id(cursor) {
            if self.whitelist.push(peer).is_err() {
                warn!("Registry exceeds {} peers, whitelist truncated", WHITELIST_MAX);
                break;
            }
            cursor = Some(peer);
        }
    }

    fn push_whitelist(&mut self) -> Result<(), Error> {
        tolerate(self.radio.set_whitelist(&self.whitelist), &[], "whitelist")?;
        tolerate(
            self.radio.set_identity_list(&self.whitelist),
            &[StackError::NotSupported],
            "identity list",
        )
    }

    // Persistence

    fn flush_order(&mut self) -> Result<(), Error> {
        if !self.order_dirty {
            return Ok(());
        }
        self.persist_attempts += 1;
        match self.order.persist(&mut self.store) {
            Ok(()) => {
                debug!("Order persisted: {}", self.order);
                self.order_dirty = false;
                self.persist_attempts = 0;
                Ok(())
            }
            Err(StorageError::Busy) if self.persist_attempts < STORAGE_RETRY_LIMIT => {
                warn!("Order store busy, attempt {}", self.persist_attempts);
                Ok(())
            }
            Err(e) => {
                error!("Order not persisted: {}", e);
                self.order_dirty = false;
                self.persist_attempts = 0;
                Err(Error::Storage(e))
            }
        }
    }
}

/// Whether the registry behind `radio` enumerates `peer`.
fn in_registry<R: RadioStack>(radio: &R, peer: PeerId) -> bool {
    let mut cursor = None;
    while let Some(next) = radio.next_peer_id(cursor) {
        if next == peer {
            return true;
        }
        cursor = Some(next);
    }
    false
}
