//! Scan/connect phase bookkeeping and the dispatch table.
//!
//! The directed-reconnect sequence alternates between a *scan* window,
//! where every bonded peer may connect and each connection is only a
//! presence signal, and a *connection* phase that offers single-peer
//! windows to the detected peers in MRU order.

use crate::ble::PeerId;
use crate::config::{DIRECT_CONNECT_PASSES, WHITELIST_MAX};

/// Advertising mode of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvMode {
    Idle,
    /// Open pairing window, no whitelist.
    AddNew,
    /// Scan phase of the directed-reconnect sequence.
    ReconnectScan,
    /// One directed window for a single detected peer.
    ReconnectConnect,
    /// Whitelist of the whole registry after the directed sequence gave
    /// up. The first bonded peer to connect keeps its link.
    ReconnectAny,
}

impl AdvMode {
    pub const ALL: [AdvMode; 5] = [
        AdvMode::Idle,
        AdvMode::AddNew,
        AdvMode::ReconnectScan,
        AdvMode::ReconnectConnect,
        AdvMode::ReconnectAny,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Scanning,
    Connection,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::Scanning, Phase::Connection];
}

/// Stack outcome as seen by the phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PhaseEvent {
    /// A bonded peer is connecting.
    StartConnect(PeerId),
    /// The advertising window ended (timeout or explicit stop).
    StopAdvertising,
    /// A bonded peer reconnected outside the managed sequence.
    ConnectPrevious,
    /// A connection from a device the registry does not know.
    GenericConnect,
}

/// Payload-free view of [`PhaseEvent`], used as the table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PhaseEventKind {
    StartConnect,
    StopAdvertising,
    ConnectPrevious,
    GenericConnect,
}

impl PhaseEventKind {
    pub const ALL: [PhaseEventKind; 4] = [
        PhaseEventKind::StartConnect,
        PhaseEventKind::StopAdvertising,
        PhaseEventKind::ConnectPrevious,
        PhaseEventKind::GenericConnect,
    ];
}

impl PhaseEvent {
    pub fn kind(self) -> PhaseEventKind {
        match self {
            PhaseEvent::StartConnect(_) => PhaseEventKind::StartConnect,
            PhaseEvent::StopAdvertising => PhaseEventKind::StopAdvertising,
            PhaseEvent::ConnectPrevious => PhaseEventKind::ConnectPrevious,
            PhaseEvent::GenericConnect => PhaseEventKind::GenericConnect,
        }
    }
}

/// What the controller does in response to a phase event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    Ignore,
    /// Drop the active link.
    ForceDisconnect,
    /// Consume the advertising window.
    StopAdvertising,
    /// Note a peer seen during the scan window and drop its link.
    RecordDetection,
    /// Leave the scan window: rescan or start directed windows.
    FinishScan,
    /// The peer the window was offered to connected; keep the link.
    ConfirmTarget,
    /// The directed window elapsed; try the next detected peer.
    NextCandidate,
}

/// Dispatch table. Total over every (mode, phase, event) triple.
pub fn transition(mode: AdvMode, phase: Phase, event: PhaseEventKind) -> Action {
    use PhaseEventKind as E;

    match mode {
        AdvMode::Idle => Action::Ignore,
        AdvMode::AddNew => match event {
            E::ConnectPrevious => Action::ForceDisconnect,
            E::GenericConnect => Action::StopAdvertising,
            E::StartConnect | E::StopAdvertising => Action::Ignore,
        },
        AdvMode::ReconnectScan | AdvMode::ReconnectConnect => match (phase, event) {
            (Phase::Scanning, E::StartConnect) => Action::RecordDetection,
            (Phase::Scanning, E::StopAdvertising) => Action::FinishScan,
            (Phase::Connection, E::StartConnect) => Action::ConfirmTarget,
            (Phase::Connection, E::StopAdvertising) => Action::NextCandidate,
            (_, E::GenericConnect) => Action::ForceDisconnect,
            (_, E::ConnectPrevious) => Action::Ignore,
        },
        AdvMode::ReconnectAny => match event {
            E::StartConnect => Action::ConfirmTarget,
            E::GenericConnect => Action::ForceDisconnect,
            // No stack timeout; `tick` restarts a window the stack ended.
            E::StopAdvertising | E::ConnectPrevious => Action::Ignore,
        },
    }
}

/// Outcome of a failed directed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Offer a window to this peer next.
    Next(PeerId),
    /// Pass over the detected list finished; scan again.
    Rescan,
    /// Retry bound reached; give up on the directed sequence and open
    /// the registry-wide window.
    Abandon,
}

/// Phase state of one directed-reconnect sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConnectPhase {
    phase: Phase,
    /// Indexed by MRU rank during the scan, compacted for the connection phase.
    detected: [Option<PeerId>; WHITELIST_MAX],
    detected_count: u8,
    index: u8,
    loops: u8,
}

impl Default for ScanConnectPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanConnectPhase {
    pub const fn new() -> Self {
        Self {
            phase: Phase::Scanning,
            detected: [None; WHITELIST_MAX],
            detected_count: 0,
            index: 0,
            loops: 0,
        }
    }

    /// Start a fresh sequence, retry counter included.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Open a scan window. The retry counter is kept.
    pub fn begin_scan(&mut self) {
        self.phase = Phase::Scanning;
        self.detected = [None; WHITELIST_MAX];
        self.detected_count = 0;
        self.index = 0;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn detected_count(&self) -> usize {
        self.detected_count as usize
    }

    pub fn loops(&self) -> u8 {
        self.loops
    }

    /// Record `peer` as seen at MRU `rank`. Returns `false` if already recorded.
    pub fn record(&mut self, rank: usize, peer: PeerId) -> bool {
        let Some(slot) = self.detected.get_mut(rank) else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(peer);
        self.detected_count += 1;
        true
    }

    /// Close the scan window and start the connection phase.
    ///
    /// Returns the first target, or `None` when nothing was detected.
    pub fn begin_connection(&mut self) -> Option<PeerId> {
        let mut compacted = [None; WHITELIST_MAX];
        for (dst, peer) in compacted.iter_mut().zip(self.detected.iter().flatten()) {
            *dst = Some(*peer);
        }
        self.detected = compacted;
        self.index = 0;
        let first = self.detected[0]?;
        self.phase = Phase::Connection;
        Some(first)
    }

    /// The peer the current directed window targets.
    pub fn candidate(&self) -> Option<PeerId> {
        match self.phase {
            Phase::Connection => self.detected.get(self.index as usize).copied().flatten(),
            Phase::Scanning => None,
        }
    }

    /// Move past a directed window that elapsed without a connection.
    pub fn advance(&mut self) -> Advance {
        self.index += 1;
        if self.index < self.detected_count {
            if let Some(peer) = self.detected[self.index as usize] {
                return Advance::Next(peer);
            }
        }

        self.loops += 1;
        if self.loops >= DIRECT_CONNECT_PASSES {
            Advance::Abandon
        } else {
            Advance::Rescan
        }
    }
}
