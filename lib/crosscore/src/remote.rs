// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running a function on the other core.
//!
//! A [`RemoteExec`] owns a single-slot mailbox. A call takes the cross-core
//! mux, waits for any previous call to finish, publishes the function and
//! its argument, fires the directed interrupt at the peer, and then waits
//! for the peer to either start or finish the function, depending on the
//! [`WaitMode`]. On the peer, the directed interrupt must land in
//! [`RemoteExec::handle_ipi`], which runs the function right there in
//! interrupt context.
//!
//! Only one call is ever in flight, system-wide.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::mux::CoreMux;
use crate::platform::{Platform, Wait};
use crate::spin::wait_until;
use crate::trace::{trace, Event, Trace, TraceLog};
use crate::CoreId;

/// How long `RemoteExec` callers wait for the peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// Return once the peer has entered the function. The function keeps
    /// running on the peer after the call returns.
    ForStart,
    /// Return once the function has returned on the peer.
    ForCompletion,
}

/// A type-erased `fn(&T)` plus its argument, as stored in the mailbox.
#[derive(Copy, Clone)]
pub struct RemoteCall {
    shim: unsafe fn(*const (), *const ()),
    func: *const (),
    arg: *const (),
}

unsafe fn shim<T>(func: *const (), arg: *const ()) {
    // Safety: `func` and `arg` were built from a `fn(&T)` and a `&T` by
    // `RemoteCall::new`, and the caller of `invoke` vouches for `arg`.
    let func: fn(&T) = core::mem::transmute(func);
    func(&*(arg as *const T));
}

unsafe fn idle(_: *const (), _: *const ()) {}

impl RemoteCall {
    /// Packs up `func(arg)`. The borrow of `arg` is forgotten here; whoever
    /// dispatches the call is responsible for keeping it alive.
    pub fn new<T: Sync>(func: fn(&T), arg: &T) -> Self {
        Self {
            shim: shim::<T>,
            func: func as *const (),
            arg: arg as *const T as *const (),
        }
    }

    const fn idle() -> Self {
        Self {
            shim: idle,
            func: core::ptr::null(),
            arg: core::ptr::null(),
        }
    }

    /// # Safety
    ///
    /// The argument captured by `new` must still be alive.
    unsafe fn invoke(self) {
        (self.shim)(self.func, self.arg)
    }
}

/// The remote execution controller. See the module docs.
pub struct RemoteExec<P: Platform> {
    platform: P,
    mux: CoreMux,
    started: AtomicBool,
    finished: AtomicBool,
    mailbox: UnsafeCell<RemoteCall>,
    log: TraceLog,
}

// Safety: the mailbox is written only by the mux holder, after the previous
// call has finished and before the directed interrupt is raised; it is read
// only by `handle_ipi` on the peer, after that interrupt.
unsafe impl<P: Platform> Sync for RemoteExec<P> {}
unsafe impl<P: Platform + Send> Send for RemoteExec<P> {}

impl<P: Platform> RemoteExec<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            mux: CoreMux::new(),
            // `started` is left set between calls, so a stray directed
            // interrupt finds nothing to run.
            started: AtomicBool::new(true),
            finished: AtomicBool::new(true),
            mailbox: UnsafeCell::new(RemoteCall::idle()),
            log: TraceLog::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn trace(&self) -> &TraceLog {
        &self.log
    }

    pub(crate) fn mux(&self) -> &CoreMux {
        &self.mux
    }

    /// True when no call is in flight.
    pub fn is_quiescent(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Runs `func(arg)` on the other core.
    ///
    /// `arg` has to be `'static` because with [`WaitMode::ForStart`] the
    /// function may still be using it after this returns; see
    /// [`RemoteExec::call_blocking`] for borrowed arguments.
    #[track_caller]
    pub fn call<T: Sync>(&self, func: fn(&T), arg: &'static T, wait: WaitMode) {
        // Safety: `arg` lives forever.
        unsafe { self.dispatch(RemoteCall::new(func, arg), wait) }
    }

    /// Runs `func(arg)` on the other core and waits for it to return.
    #[track_caller]
    pub fn call_blocking<T: Sync>(&self, func: fn(&T), arg: &T) {
        // Safety: we don't return until `func` has, so `arg` outlives its
        // use.
        unsafe {
            self.dispatch(RemoteCall::new(func, arg), WaitMode::ForCompletion)
        }
    }

    /// Like [`RemoteExec::call`], but names the target.
    ///
    /// Panics if `target` is the calling core: a core can't take its own
    /// directed interrupt while it spins waiting for it.
    #[track_caller]
    pub fn call_on<T: Sync>(
        &self,
        target: CoreId,
        func: fn(&T),
        arg: &'static T,
        wait: WaitMode,
    ) {
        let me = self.platform.current_core();
        if target == me {
            panic!("remote call from {me:?} targets its own core");
        }
        self.call(func, arg, wait);
    }

    /// Sends a prepared call to the other core.
    ///
    /// # Safety
    ///
    /// Whatever `call` borrows must stay alive until the call has finished on
    /// the peer, which for [`WaitMode::ForStart`] may be well after this
    /// returns. [`RemoteExec::is_quiescent`] tells you when.
    ///
    /// Panics if the calling core already holds the mux with a call in
    /// flight, which is the case inside an open [`RemoteStall`] window: the
    /// peer is parked in that call, so this one could never be taken.
    ///
    /// [`RemoteStall`]: crate::RemoteStall
    #[track_caller]
    pub unsafe fn dispatch(&self, call: RemoteCall, wait: WaitMode) {
        let p = &self.platform;
        let me = p.current_core();
        if self.mux.owner() == Some(me) && !self.is_quiescent() {
            panic!("remote call on {me:?} issued inside an open stall window");
        }
        let mask = p.mask_interrupts();
        self.mux.lock(p);
        self.send(call, wait);
        self.mux.unlock(p);
        p.restore_interrupts(mask);
    }

    /// The body of `dispatch`, for callers that already hold the mux with
    /// interrupts masked.
    ///
    /// # Safety
    ///
    /// As for `dispatch`.
    pub(crate) unsafe fn send(&self, call: RemoteCall, wait: WaitMode) {
        let p = &self.platform;
        let me = p.current_core();
        let target = me.peer();

        wait_until(p, Wait::Quiescent, || {
            self.finished.load(Ordering::Acquire)
        });

        // `started` goes last, with Release: a handler that claims the call
        // through it must also see the mailbox.
        *self.mailbox.get() = call;
        self.finished.store(false, Ordering::Relaxed);
        self.started.store(false, Ordering::Release);
        trace!(self.log, me, Trace::Dispatched { target, wait });

        p.raise(target);

        match wait {
            WaitMode::ForStart => wait_until(p, Wait::CallStarted, || {
                self.started.load(Ordering::Acquire)
            }),
            WaitMode::ForCompletion => wait_until(p, Wait::CallFinished, || {
                self.finished.load(Ordering::Acquire)
            }),
        }
    }

    /// Directed interrupt entry. Runs the pending call, if there is one.
    ///
    /// The platform must route the directed interrupt here on each core.
    pub fn handle_ipi(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            // Nothing pending; a stray interrupt.
            return;
        }
        // Safety: `started` was clear, so the mailbox holds a call published
        // by the other core, which is keeping its argument alive until we set
        // `finished`.
        unsafe {
            let call = *self.mailbox.get();
            call.invoke();
        }
        self.log.count(Event::Handled);
        self.finished.store(true, Ordering::Release);
    }
}

impl<P: Platform> Drop for RemoteExec<P> {
    fn drop(&mut self) {
        // The peer may still be running a `ForStart` call that points into
        // us, and will write `finished` when it's done.
        wait_until(&self.platform, Wait::Quiescent, || {
            self.finished.load(Ordering::Acquire)
        });
    }
}
