// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-core bookkeeping shared by both stall backends.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::CoreId;

/// Whether the stall protocol may be used on a core.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StallState {
    /// Not yet brought up, paused for sleep, or aborted by a panic. Stalls
    /// begun while any core is idle are skipped.
    Idle,
    Running,
}

/// One slot per core, each only ever touched by its own core with interrupts
/// masked.
pub(crate) struct CoreLocal<T> {
    slots: [UnsafeCell<T>; 2],
}

// Safety: each slot is accessed from a single core only; see `get_mut`.
unsafe impl<T: Send> Sync for CoreLocal<T> {}

impl<T> CoreLocal<T> {
    pub const fn new(a: T, b: T) -> Self {
        Self {
            slots: [UnsafeCell::new(a), UnsafeCell::new(b)],
        }
    }

    /// # Safety
    ///
    /// The caller must be running on `core`, with interrupts masked, and must
    /// not let the reference escape that window.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, core: CoreId) -> &mut T {
        &mut *self.slots[core.index()].get()
    }
}

/// What `StallBook::enter` decided.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Enter {
    /// Outermost begin with both cores running: go stall the peer.
    Engage,
    /// Outermost begin with some core idle: run unprotected.
    Bypass,
    /// Already inside a stall window (engaged or bypassed) on this core.
    Nested,
}

/// What `StallBook::exit` decided.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Exit<M> {
    /// Outermost end of an engaged window: let the peer go and restore this.
    Release(M),
    /// Outermost end of a bypassed window.
    Bypassed,
    Nested,
}

pub(crate) struct StallBook<M> {
    running: [AtomicBool; 2],
    depth: [AtomicU32; 2],
    engaged: [AtomicBool; 2],
    saved: CoreLocal<Option<M>>,
}

impl<M: Copy + Send> StallBook<M> {
    pub const fn new() -> Self {
        Self {
            running: [AtomicBool::new(false), AtomicBool::new(false)],
            depth: [AtomicU32::new(0), AtomicU32::new(0)],
            engaged: [AtomicBool::new(false), AtomicBool::new(false)],
            saved: CoreLocal::new(None, None),
        }
    }

    pub fn state(&self, core: CoreId) -> StallState {
        if self.running[core.index()].load(Ordering::Acquire) {
            StallState::Running
        } else {
            StallState::Idle
        }
    }

    pub fn all_running(&self) -> bool {
        CoreId::ALL
            .iter()
            .all(|&c| self.state(c) == StallState::Running)
    }

    pub fn set(&self, core: CoreId, state: StallState) {
        self.running[core.index()]
            .store(state == StallState::Running, Ordering::Release);
    }

    pub fn set_all(&self, state: StallState) {
        for core in CoreId::ALL {
            self.set(core, state);
        }
    }

    pub fn nesting(&self, core: CoreId) -> u32 {
        self.depth[core.index()].load(Ordering::Relaxed)
    }

    /// Records a `begin_stall` on `core`. Must be called with interrupts
    /// masked on `core`.
    pub fn enter(&self, core: CoreId) -> Enter {
        let i = core.index();
        let depth = self.depth[i].load(Ordering::Relaxed);
        let verdict = if depth != 0 {
            Enter::Nested
        } else if self.all_running() {
            Enter::Engage
        } else {
            Enter::Bypass
        };
        if depth == 0 {
            self.engaged[i]
                .store(verdict == Enter::Engage, Ordering::Relaxed);
        }
        self.depth[i].store(depth + 1, Ordering::Relaxed);
        verdict
    }

    /// Stashes the interrupt state from an engaging `begin_stall`.
    ///
    /// # Safety
    ///
    /// As for [`CoreLocal::get_mut`].
    pub unsafe fn save_mask(&self, core: CoreId, mask: M) {
        *self.saved.get_mut(core) = Some(mask);
    }

    /// Records an `end_stall` on `core`.
    ///
    /// Panics if `core` has no open stall window.
    ///
    /// # Safety
    ///
    /// As for [`CoreLocal::get_mut`].
    #[track_caller]
    pub unsafe fn exit(&self, core: CoreId) -> Exit<M> {
        let i = core.index();
        let depth = self.depth[i].load(Ordering::Relaxed);
        if depth == 0 {
            panic!("end_stall on {core:?} without a matching begin_stall");
        }
        self.depth[i].store(depth - 1, Ordering::Relaxed);
        if depth > 1 {
            return Exit::Nested;
        }
        if !self.engaged[i].swap(false, Ordering::Relaxed) {
            return Exit::Bypassed;
        }
        match self.saved.get_mut(core).take() {
            Some(mask) => Exit::Release(mask),
            None => panic!("engaged stall on {core:?} lost its saved mask"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let book = StallBook::<u32>::new();
        assert_eq!(book.state(CoreId::Pro), StallState::Idle);
        assert_eq!(book.state(CoreId::App), StallState::Idle);
        assert!(!book.all_running());
    }

    #[test]
    fn one_idle_core_bypasses() {
        let book = StallBook::<u32>::new();
        book.set(CoreId::Pro, StallState::Running);
        assert_eq!(book.enter(CoreId::Pro), Enter::Bypass);
        assert_eq!(book.enter(CoreId::Pro), Enter::Nested);
        assert_eq!(book.nesting(CoreId::Pro), 2);
        unsafe {
            assert_eq!(book.exit(CoreId::Pro), Exit::Nested);
            assert_eq!(book.exit(CoreId::Pro), Exit::Bypassed);
        }
        assert_eq!(book.nesting(CoreId::Pro), 0);
    }

    #[test]
    fn engaged_window_survives_state_change() {
        let book = StallBook::<u32>::new();
        book.set_all(StallState::Running);
        assert_eq!(book.enter(CoreId::App), Enter::Engage);
        unsafe { book.save_mask(CoreId::App, 7) };

        // A panic elsewhere knocks the protocol idle mid-window; the window
        // must still close properly.
        book.set_all(StallState::Idle);
        assert_eq!(book.enter(CoreId::App), Enter::Nested);
        unsafe {
            assert_eq!(book.exit(CoreId::App), Exit::Nested);
            assert_eq!(book.exit(CoreId::App), Exit::Release(7));
        }
    }

    #[test]
    fn cores_nest_independently() {
        let book = StallBook::<u32>::new();
        book.set_all(StallState::Running);
        assert_eq!(book.enter(CoreId::Pro), Enter::Engage);
        assert_eq!(book.nesting(CoreId::App), 0);
        assert_eq!(book.enter(CoreId::App), Enter::Engage);
    }

    #[test]
    #[should_panic(expected = "without a matching begin_stall")]
    fn underflow() {
        let book = StallBook::<u32>::new();
        book.set_all(StallState::Running);
        unsafe {
            book.exit(CoreId::Pro);
        }
    }
}
