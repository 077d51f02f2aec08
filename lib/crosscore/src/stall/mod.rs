// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stalling the other core.
//!
//! A stall window keeps the peer spinning inside its directed interrupt
//! handler, so that the calling core can touch registers the peer might
//! otherwise be touching at the same moment. Windows nest per core; only the
//! outermost `begin_stall`/`end_stall` pair talks to the peer.
//!
//! Until every core has run `init_core`, and whenever the protocol has been
//! paused or aborted, an outermost `begin_stall` does nothing and the caller
//! runs unprotected. That is what early boot needs, and it is also the only
//! sane thing to do after a panic.

use core::marker::PhantomData;

use crate::mux::CoreMux;
use crate::platform::Platform;
use crate::state::{StallBook, StallState};
use crate::trace::{trace, Event, Trace, TraceLog};
use crate::CoreId;

mod direct;
mod remote;

pub use direct::DirectStall;
pub use remote::RemoteStall;

/// Operations common to both stall backends.
pub trait Stall {
    type Platform: Platform;

    fn platform(&self) -> &Self::Platform;

    /// Opens a stall window on the calling core. When this is the outermost
    /// window and the protocol is running, returns only once the peer is
    /// parked. Interrupts stay masked until the window closes.
    fn begin_stall(&self);

    /// Closes the innermost stall window on the calling core.
    ///
    /// Panics if there is no window open on this core.
    fn end_stall(&self);

    /// Bring-up: marks the calling core as ready to take part. Call once per
    /// core, after its directed interrupt is routed.
    fn init_core(&self);

    /// Marks both cores idle, e.g. before a sleep mode that drops interrupt
    /// routing.
    fn pause(&self);

    /// Marks both cores running again.
    fn resume(&self);

    /// Marks both cores idle without taking the mux. For panic handlers,
    /// where the mux may be held by whoever just died.
    fn abort(&self);

    fn state(&self, core: CoreId) -> StallState;

    /// How many stall windows are open on `core`.
    fn nesting(&self, core: CoreId) -> u32;

    fn trace(&self) -> &TraceLog;

    /// Opens a stall window that closes when the guard is dropped.
    fn stalled(&self) -> StallGuard<'_, Self>
    where
        Self: Sized,
    {
        self.begin_stall();
        StallGuard {
            stall: self,
            _not_send: PhantomData,
        }
    }

    /// Runs `body` inside a stall window.
    fn with_stall<R>(&self, body: impl FnOnce() -> R) -> R
    where
        Self: Sized,
    {
        let _g = self.stalled();
        body()
    }

    /// Reads one register with the peer stalled.
    ///
    /// # Safety
    ///
    /// As for [`Platform::read_register`].
    unsafe fn read_register(&self, addr: usize) -> u32
    where
        Self: Sized,
    {
        let _g = self.stalled();
        self.platform().read_register(addr)
    }

    /// Reads consecutive registers starting at `addr` into `buf`, all in one
    /// stall window.
    ///
    /// # Safety
    ///
    /// As for [`Platform::read_register`], for every word covered.
    unsafe fn read_buffer(&self, addr: usize, buf: &mut [u32])
    where
        Self: Sized,
    {
        let _g = self.stalled();
        for (i, word) in buf.iter_mut().enumerate() {
            *word = self.platform().read_register(addr + i * 4);
        }
    }
}

/// An open stall window, from [`Stall::stalled`]. Must be dropped on the core
/// that opened it, so it isn't `Send`.
#[must_use = "the stall window closes as soon as this is dropped"]
pub struct StallGuard<'a, S: Stall> {
    stall: &'a S,
    _not_send: PhantomData<*const ()>,
}

impl<S: Stall> Drop for StallGuard<'_, S> {
    fn drop(&mut self) {
        self.stall.end_stall();
    }
}

/// Runs `body` holding `mux`, with interrupts masked.
fn locked<P: Platform>(p: &P, mux: &CoreMux, body: impl FnOnce()) {
    let mask = p.mask_interrupts();
    mux.lock(p);
    body();
    mux.unlock(p);
    p.restore_interrupts(mask);
}

// The state transitions, shared by both backends.

fn init_core<P: Platform>(
    p: &P,
    mux: &CoreMux,
    book: &StallBook<P::Mask>,
    log: &TraceLog,
) {
    let me = p.current_core();
    locked(p, mux, || book.set(me, StallState::Running));
    trace!(log, me, Trace::CoreOnline);
}

fn set_all<P: Platform>(
    p: &P,
    mux: &CoreMux,
    book: &StallBook<P::Mask>,
    log: &TraceLog,
    state: StallState,
) {
    locked(p, mux, || book.set_all(state));
    let what = match state {
        StallState::Idle => Trace::Paused,
        StallState::Running => Trace::Resumed,
    };
    trace!(log, p.current_core(), what);
}

fn abort<M: Copy + Send>(book: &StallBook<M>, log: &TraceLog) {
    book.set_all(StallState::Idle);
    log.count(Event::Aborted);
}
