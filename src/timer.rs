//! Millisecond tick source and cooperative one-shot callbacks.
//!
//! [`TimerPool`] is the state shared with the tick interrupt. The ISR
//! calls [`TimerPool::on_tick`], which only bumps the tick counter and
//! moves due slots from *armed* to *ready*. Callback bodies never run in
//! interrupt context: [`Scheduler::step`] runs them from the main loop.
//!
//! Shared fields and their writers:
//!
//! | field    | written by                            | read by   |
//! |----------|---------------------------------------|-----------|
//! | `now`    | ISR                                   | both      |
//! | `target` | main loop (`arm`)                     | ISR       |
//! | `armed`  | main loop (`arm`), ISR (due, CAS)     | ISR       |
//! | `ready`  | main loop (`arm`, `step`), ISR (due)  | main loop |
//!
//! `armed` and `ready` have two writers. The ISR preempts the main loop
//! but never the reverse, so an ISR pass either completes before `arm`
//! starts or sees the slot disarmed. `arm` clears `armed` and `ready`
//! first and publishes `target` before setting `armed` again
//! (release/acquire): a pass that lands inside `arm` skips the slot, and a
//! pass that completed before it has its `ready` cleared. The ISR takes
//! the armed-to-ready transition with a compare-exchange, so a slot is
//! moved to ready at most once per `arm`.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::{TICK_PERIOD_MS, TIMER_SLOTS};

/// Handle of a registered callback slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerHandle(u8);

impl TimerHandle {
    fn index(self) -> usize {
        self.0 as usize
    }
}

struct TimerSlot {
    target: AtomicU32,
    armed: AtomicBool,
    ready: AtomicBool,
    claimed: AtomicBool,
}

impl TimerSlot {
    const fn idle() -> Self {
        Self {
            target: AtomicU32::new(0),
            armed: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
        }
    }
}

/// Tick counter and per-slot flags, shared with the tick interrupt.
pub struct TimerPool {
    now: AtomicU32,
    slots: [TimerSlot; TIMER_SLOTS],
}

impl Default for TimerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerPool {
    pub const fn new() -> Self {
        const IDLE: TimerSlot = TimerSlot::idle();
        Self {
            now: AtomicU32::new(0),
            slots: [IDLE; TIMER_SLOTS],
        }
    }

    /// Tick handler. Interrupt context: no callbacks, no allocation.
    pub fn on_tick(&self) {
        let now = self.now.load(Ordering::Relaxed).wrapping_add(1);
        self.now.store(now, Ordering::Release);

        for slot in &self.slots {
            if !slot.armed.load(Ordering::Acquire) {
                continue;
            }
            let target = slot.target.load(Ordering::Relaxed);
            // Wrapping compare: due once `now` has reached `target`.
            if now.wrapping_sub(target) as i32 >= 0
                && slot
                    .armed
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                slot.ready.store(true, Ordering::Release);
            }
        }
    }

    /// Ticks elapsed since start-up (wraps after ~49 days).
    pub fn now(&self) -> u32 {
        self.now.load(Ordering::Acquire)
    }

    /// Fire `handle` once, `delay_ms` from now. Re-arming replaces the pending target.
    pub fn arm(&self, handle: TimerHandle, delay_ms: u32) {
        let slot = &self.slots[handle.index()];
        slot.armed.store(false, Ordering::Relaxed);
        slot.ready.store(false, Ordering::Relaxed);
        let target = self.now().wrapping_add(delay_ms / TICK_PERIOD_MS);
        slot.target.store(target, Ordering::Relaxed);
        slot.armed.store(true, Ordering::Release);
    }

    fn claim(&self) -> Option<TimerHandle> {
        self.slots.iter().enumerate().find_map(|(i, slot)| {
            slot.claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
                .then_some(TimerHandle(i as u8))
        })
    }

    fn take_ready(&self, index: usize) -> bool {
        self.slots[index].ready.swap(false, Ordering::AcqRel)
    }
}

/// Callback body run by [`Scheduler::step`] with the main-loop context.
pub type Callback<C> = fn(&mut C);

/// Main-loop half of the timer service.
///
/// `C` is the context handed to every callback, typically the reconnection
/// controller.
pub struct Scheduler<'a, C> {
    pool: &'a TimerPool,
    callbacks: [Option<Callback<C>>; TIMER_SLOTS],
    last_tick: u32,
}

impl<'a, C> Scheduler<'a, C> {
    pub fn new(pool: &'a TimerPool) -> Self {
        Self {
            pool,
            callbacks: [None; TIMER_SLOTS],
            last_tick: pool.now(),
        }
    }

    pub fn pool(&self) -> &'a TimerPool {
        self.pool
    }

    /// Register `callback` in a free slot. `None` when all slots are taken;
    /// there is no way to release a slot.
    pub fn register(&mut self, callback: Callback<C>) -> Option<TimerHandle> {
        let handle = self.pool.claim()?;
        self.callbacks[handle.index()] = Some(callback);
        trace!("timer slot {} registered", handle.0);
        Some(handle)
    }

    pub fn arm(&self, handle: TimerHandle, delay_ms: u32) {
        self.pool.arm(handle, delay_ms);
    }

    /// Run every ready callback to completion.
    ///
    /// Does nothing unless at least one tick elapsed since the last call.
    pub fn step(&mut self, ctx: &mut C) {
        let now = self.pool.now();
        if now == self.last_tick {
            return;
        }
        self.last_tick = now;

        for (index, callback) in self.callbacks.iter().enumerate() {
            if let Some(callback) = callback {
                if self.pool.take_ready(index) {
                    callback(ctx);
                }
            }
        }
    }
}
