// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-threaded stand-in platform for unit tests.
//!
//! Both "cores" run on the test thread. Raising the directed interrupt runs
//! the installed vector synchronously, as the target core, and then switches
//! back. Anything that would need the peer to be running concurrently (such
//! as a stall) spins until the fake's patience runs out and panics, naming
//! what it was waiting for.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::platform::{Platform, Wait};
use crate::CoreId;

const PATIENCE: u32 = 100_000;

pub const FLUSH_REGISTER: usize = 0x3ff0_0000;

pub struct FakePlatform {
    core: AtomicU8,
    raised: [AtomicU32; 2],
    level: AtomicU32,
    reads: AtomicU32,
    vector: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl FakePlatform {
    pub fn new(core: CoreId) -> Self {
        Self {
            core: AtomicU8::new(core as u8),
            raised: [AtomicU32::new(0), AtomicU32::new(0)],
            level: AtomicU32::new(0),
            reads: AtomicU32::new(0),
            vector: OnceLock::new(),
        }
    }

    pub fn set_vector(&self, vector: impl Fn() + Send + Sync + 'static) {
        if self.vector.set(Box::new(vector)).is_err() {
            panic!("vector installed twice");
        }
    }

    pub fn switch_to(&self, core: CoreId) {
        self.core.store(core as u8, Ordering::Relaxed);
    }

    pub fn raised(&self, core: CoreId) -> u32 {
        self.raised[core.index()].load(Ordering::Relaxed)
    }

    pub fn mask_level(&self) -> u32 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl Platform for FakePlatform {
    type Mask = u32;

    fn current_core(&self) -> CoreId {
        match self.core.load(Ordering::Relaxed) {
            0 => CoreId::Pro,
            _ => CoreId::App,
        }
    }

    fn raise(&self, target: CoreId) {
        self.raised[target.index()].fetch_add(1, Ordering::Relaxed);
        if let Some(vector) = self.vector.get() {
            let me = self.current_core();
            self.switch_to(target);
            vector();
            self.switch_to(me);
        }
    }

    fn mask_interrupts(&self) -> u32 {
        self.level.fetch_add(1, Ordering::Relaxed)
    }

    fn restore_interrupts(&self, mask: u32) {
        self.level.store(mask, Ordering::Relaxed);
    }

    fn flush_register(&self) -> usize {
        FLUSH_REGISTER
    }

    unsafe fn read_register(&self, addr: usize) -> u32 {
        self.reads.fetch_add(1, Ordering::Relaxed);
        addr as u32
    }

    fn relax(&self, wait: Wait, spins: u32) {
        if spins >= PATIENCE {
            panic!("fake platform would hang waiting for {wait:?}");
        }
    }
}
