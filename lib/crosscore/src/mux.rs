// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::platform::{Platform, Wait};
use crate::spin::wait_until;
use crate::CoreId;

const FREE: u8 = u8::MAX;

/// A spin mutex shared by the two cores, tagged with its owner.
///
/// The owning core may take it again; it is released when every `lock` has
/// been matched by an `unlock`. There is no guard type, because a stall holds
/// the mux from `begin_stall` until `end_stall`, which are separate calls.
///
/// This does not mask interrupts. Callers do that first, so that nothing
/// else on the core can run while the mux is held and find it "already
/// owned by us".
pub struct CoreMux {
    owner: AtomicU8,
    // Only ever touched by the owner.
    depth: AtomicU32,
}

impl CoreMux {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU8::new(FREE),
            depth: AtomicU32::new(0),
        }
    }

    /// Takes the mux for the current core, spinning while the other core
    /// holds it.
    pub fn lock<P: Platform + ?Sized>(&self, platform: &P) {
        let me = platform.current_core() as u8;
        if self.owner.load(Ordering::Relaxed) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }
        wait_until(platform, Wait::Mux, || {
            self.owner
                .compare_exchange_weak(
                    FREE,
                    me,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
        });
        self.depth.store(1, Ordering::Relaxed);
    }

    /// Drops one level of ownership.
    ///
    /// Panics if the current core does not hold the mux.
    #[track_caller]
    pub fn unlock<P: Platform + ?Sized>(&self, platform: &P) {
        let me = platform.current_core();
        if self.owner.load(Ordering::Relaxed) != me as u8 {
            panic!("cross-core mux released by {me:?}, which does not hold it");
        }
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(FREE, Ordering::Release);
        }
    }

    /// Returns the core holding the mux, if any.
    pub fn owner(&self) -> Option<CoreId> {
        CoreId::try_from(u32::from(self.owner.load(Ordering::Relaxed))).ok()
    }
}

impl Default for CoreMux {
    fn default() -> Self {
        Self::new()
    }
}
