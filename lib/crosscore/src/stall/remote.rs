// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The stall built on remote execution, for parts where the directed
//! interrupt vector is shared with other cross-core work.
//!
//! Beginning a stall sends the peer a parking function and waits
//! only for it to start. Ending it raises the release flag and then waits for
//! the call to finish, so the peer is known to be out of the parking loop
//! before the mux is released.

use core::sync::atomic::{AtomicBool, Ordering};

use super::Stall;
use crate::platform::{Platform, Wait};
use crate::remote::{RemoteCall, RemoteExec, WaitMode};
use crate::spin::wait_until;
use crate::state::{Enter, Exit, StallBook, StallState};
use crate::trace::{trace, Trace, TraceLog};
use crate::CoreId;

pub struct RemoteStall<P: Platform> {
    exec: RemoteExec<P>,
    book: StallBook<P::Mask>,
    release: AtomicBool,
}

impl<P: Platform> RemoteStall<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            exec: RemoteExec::new(platform),
            book: StallBook::new(),
            release: AtomicBool::new(true),
        }
    }

    /// The remote call controller this stall rides on. Ordinary remote calls
    /// may share it, except from a core that has a stall window open: the
    /// peer is parked until that window closes, so such a call panics rather
    /// than hang.
    pub fn exec(&self) -> &RemoteExec<P> {
        &self.exec
    }

    /// Directed interrupt entry; see [`RemoteExec::handle_ipi`].
    pub fn handle_ipi(&self) {
        self.exec.handle_ipi();
    }

    fn park(&self) {
        wait_until(self.exec.platform(), Wait::StallRelease, || {
            self.release.load(Ordering::Acquire)
        });
    }
}

impl<P: Platform> Stall for RemoteStall<P> {
    type Platform = P;

    fn platform(&self) -> &P {
        self.exec.platform()
    }

    fn begin_stall(&self) {
        let p = self.exec.platform();
        let me = p.current_core();
        let mask = p.mask_interrupts();

        match self.book.enter(me) {
            Enter::Nested => p.restore_interrupts(mask),
            Enter::Bypass => {
                trace!(self.exec.trace(), me, Trace::Bypassed);
                p.restore_interrupts(mask);
            }
            Enter::Engage => {
                // Held until `end_stall`, so no other call can be sent to the
                // parked peer in the meantime.
                self.exec.mux().lock(p);
                // Safety: on `me`, interrupts masked, released in `end_stall`.
                unsafe { self.book.save_mask(me, mask) };

                self.release.store(false, Ordering::Relaxed);
                let park = RemoteCall::new(Self::park, self);
                // Safety: `self` outlives the call, because `end_stall` waits
                // for it to finish, and so does dropping `self.exec`.
                unsafe { self.exec.send(park, WaitMode::ForStart) };

                let peer = me.peer();
                trace!(self.exec.trace(), me, Trace::Engaged { peer });
            }
        }
    }

    #[track_caller]
    fn end_stall(&self) {
        let p = self.exec.platform();
        let me = p.current_core();
        let mask = p.mask_interrupts();

        // Safety: on `me`, interrupts masked.
        match unsafe { self.book.exit(me) } {
            Exit::Release(saved) => {
                self.release.store(true, Ordering::Release);
                wait_until(p, Wait::CallFinished, || self.exec.is_quiescent());
                let peer = me.peer();
                trace!(self.exec.trace(), me, Trace::Released { peer });

                self.exec.mux().unlock(p);
                p.restore_interrupts(mask);
                p.restore_interrupts(saved);
            }
            Exit::Bypassed | Exit::Nested => p.restore_interrupts(mask),
        }
    }

    fn init_core(&self) {
        super::init_core(
            self.exec.platform(),
            self.exec.mux(),
            &self.book,
            self.exec.trace(),
        );
    }

    fn pause(&self) {
        super::set_all(
            self.exec.platform(),
            self.exec.mux(),
            &self.book,
            self.exec.trace(),
            StallState::Idle,
        );
    }

    fn resume(&self) {
        super::set_all(
            self.exec.platform(),
            self.exec.mux(),
            &self.book,
            self.exec.trace(),
            StallState::Running,
        );
    }

    fn abort(&self) {
        super::abort(&self.book, self.exec.trace());
    }

    fn state(&self, core: CoreId) -> StallState {
        self.book.state(core)
    }

    fn nesting(&self, core: CoreId) -> u32 {
        self.book.nesting(core)
    }

    fn trace(&self) -> &TraceLog {
        self.exec.trace()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakePlatform;
    use crate::trace::Event;
    use core::sync::atomic::AtomicU32;

    fn leaked() -> &'static RemoteStall<FakePlatform> {
        let stall: &'static RemoteStall<FakePlatform> = Box::leak(Box::new(
            RemoteStall::new(FakePlatform::new(CoreId::Pro)),
        ));
        stall.platform().set_vector(move || stall.handle_ipi());
        stall
    }

    #[test]
    #[should_panic(expected = "StallRelease")]
    fn peer_parks_until_released() {
        let stall = leaked();
        stall.resume();
        stall.begin_stall();
    }

    #[test]
    fn shares_exec_with_plain_calls() {
        fn bump(counter: &AtomicU32) {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        let stall = leaked();
        let counter = AtomicU32::new(0);
        stall.exec().call_blocking(bump, &counter);
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        // Bypassed stalls leave the mailbox alone.
        stall.with_stall(|| ());
        assert_eq!(stall.trace().total(Event::Dispatched), 1);
        assert_eq!(stall.trace().total(Event::Handled), 1);
        assert!(stall.exec().is_quiescent());
    }
}
