// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flag-handshake stall, for parts where the directed interrupt vector
//! is dedicated to stalling.
//!
//! Each core has three generation counters, written as follows:
//!
//! - `stall_gen[c]`: by the initiator, before it raises the interrupt at `c`.
//! - `arrived[c]`: by `c`'s handler, once it is parked.
//! - `released[c]`: by the initiator, to let `c` go.
//!
//! The handler parks until `released[c]` catches up with the generation it
//! arrived for. Using generations rather than booleans means an initiator
//! that ends one stall and immediately begins another can't clear a flag the
//! peer's handler hasn't seen yet. When no stall is open,
//! `released[c] == stall_gen[c]`, so a stray interrupt returns at once.

use core::sync::atomic::{AtomicU32, Ordering};

use super::Stall;
use crate::mux::CoreMux;
use crate::platform::{Platform, Wait};
use crate::spin::wait_until;
use crate::state::{Enter, Exit, StallBook, StallState};
use crate::trace::{trace, Event, Trace, TraceLog};
use crate::CoreId;

pub struct DirectStall<P: Platform> {
    platform: P,
    mux: CoreMux,
    book: StallBook<P::Mask>,
    stall_gen: [AtomicU32; 2],
    arrived: [AtomicU32; 2],
    released: [AtomicU32; 2],
    log: TraceLog,
}

impl<P: Platform> DirectStall<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            mux: CoreMux::new(),
            book: StallBook::new(),
            stall_gen: [AtomicU32::new(0), AtomicU32::new(0)],
            arrived: [AtomicU32::new(0), AtomicU32::new(0)],
            released: [AtomicU32::new(0), AtomicU32::new(0)],
            log: TraceLog::new(),
        }
    }

    pub(crate) fn mux(&self) -> &CoreMux {
        &self.mux
    }

    /// Directed interrupt entry: parks this core until the initiator ends
    /// the stall.
    pub fn handle_ipi(&self) {
        let i = self.platform.current_core().index();
        let generation = self.stall_gen[i].load(Ordering::Acquire);
        if self.released[i].load(Ordering::Acquire) == generation {
            return;
        }
        self.arrived[i].store(generation, Ordering::Release);
        wait_until(&self.platform, Wait::StallRelease, || {
            self.released[i].load(Ordering::Acquire) == generation
        });
        self.log.count(Event::Handled);
    }
}

impl<P: Platform> Stall for DirectStall<P> {
    type Platform = P;

    fn platform(&self) -> &P {
        &self.platform
    }

    fn begin_stall(&self) {
        let p = &self.platform;
        let me = p.current_core();
        let mask = p.mask_interrupts();

        match self.book.enter(me) {
            Enter::Nested => p.restore_interrupts(mask),
            Enter::Bypass => {
                trace!(self.log, me, Trace::Bypassed);
                p.restore_interrupts(mask);
            }
            Enter::Engage => {
                self.mux.lock(p);
                // Safety: on `me`, interrupts masked, released in `end_stall`.
                unsafe { self.book.save_mask(me, mask) };

                let peer = me.peer();
                let i = peer.index();
                let generation =
                    self.stall_gen[i].load(Ordering::Relaxed).wrapping_add(1);
                self.stall_gen[i].store(generation, Ordering::Release);
                p.raise(peer);
                wait_until(p, Wait::PeerArrived, || {
                    self.arrived[i].load(Ordering::Acquire) == generation
                });

                // Drain any posted writes the peer issued before it parked.
                // Safety: the platform vouches for its own flush register.
                let _ = unsafe { p.read_register(p.flush_register()) };

                trace!(self.log, me, Trace::Engaged { peer });
            }
        }
    }

    #[track_caller]
    fn end_stall(&self) {
        let p = &self.platform;
        let me = p.current_core();
        let mask = p.mask_interrupts();

        // Safety: on `me`, interrupts masked.
        match unsafe { self.book.exit(me) } {
            Exit::Release(saved) => {
                let peer = me.peer();
                let i = peer.index();
                let generation = self.stall_gen[i].load(Ordering::Relaxed);
                self.released[i].store(generation, Ordering::Release);
                trace!(self.log, me, Trace::Released { peer });

                self.mux.unlock(p);
                p.restore_interrupts(mask);
                p.restore_interrupts(saved);
            }
            Exit::Bypassed | Exit::Nested => p.restore_interrupts(mask),
        }
    }

    fn init_core(&self) {
        super::init_core(&self.platform, &self.mux, &self.book, &self.log);
    }

    fn pause(&self) {
        super::set_all(
            &self.platform,
            &self.mux,
            &self.book,
            &self.log,
            StallState::Idle,
        );
    }

    fn resume(&self) {
        super::set_all(
            &self.platform,
            &self.mux,
            &self.book,
            &self.log,
            StallState::Running,
        );
    }

    fn abort(&self) {
        super::abort(&self.book, &self.log);
    }

    fn state(&self, core: CoreId) -> StallState {
        self.book.state(core)
    }

    fn nesting(&self, core: CoreId) -> u32 {
        self.book.nesting(core)
    }

    fn trace(&self) -> &TraceLog {
        &self.log
    }
}
