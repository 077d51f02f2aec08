// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A host simulation of a two-core part, for exercising `crosscore`.
//!
//! Each simulated core is an OS thread, bound to its [`CoreId`] by
//! [`SimPlatform::run`]. The directed interrupt is modeled as the highest
//! priority interrupt on the part: once raised, it is taken by the target
//! core at its next spin iteration (or explicit [`SimPlatform::poll`]),
//! whatever its mask level, but never while that core is already in the
//! handler. Mask levels are tracked per core so tests can check they unwind.
//!
//! There is also a small register file whose writes are attributed to the
//! writing core, and a hang detector: any single busy-wait that outlasts
//! [`SimConfig::hang_timeout`] panics, naming the core and what it waited
//! for, rather than wedging the test run.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use crosscore::{
    CoreId, DirectStall, Platform, RemoteExec, RemoteStall, Stall, Wait,
};
use enum_map::EnumMap;

/// Base address of the simulated register file.
pub const REGISTER_BASE: usize = 0x3ff0_0000;
/// Number of 32-bit registers in the file.
pub const REGISTER_COUNT: usize = 64;
/// The register `flush_register` names. Reads of it are counted.
pub const FLUSH_REGISTER: usize = REGISTER_BASE + 0xfc;

// Spins before a waiting core starts yielding its host CPU.
const SPINS_BEFORE_YIELD: u32 = 64;
// Spins between looks at the clock.
const CHECK_EVERY: u32 = 1024;

#[derive(Copy, Clone, Debug)]
pub struct SimConfig {
    /// How long one busy-wait may run before it's declared a hang.
    pub hang_timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            hang_timeout: Duration::from_secs(10),
        }
    }
}

thread_local! {
    static CURRENT: Cell<Option<CoreId>> = const { Cell::new(None) };
    static SPIN_START: Cell<Instant> = Cell::new(Instant::now());
}

#[derive(Default)]
struct SimCore {
    pending: AtomicBool,
    in_isr: AtomicBool,
    raised: AtomicU32,
    handled: AtomicU32,
    level: AtomicU32,
    writes: AtomicU32,
}

pub struct SimPlatform {
    config: SimConfig,
    cores: EnumMap<CoreId, SimCore>,
    vector: OnceLock<Box<dyn Fn() + Send + Sync>>,
    registers: [AtomicU32; REGISTER_COUNT],
    flushes: AtomicU32,
    meet: AtomicU32,
}

impl SimPlatform {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            cores: EnumMap::default(),
            vector: OnceLock::new(),
            registers: std::array::from_fn(|_| AtomicU32::new(0)),
            flushes: AtomicU32::new(0),
            meet: AtomicU32::new(0),
        }
    }

    /// Installs the directed interrupt handler, shared by both cores.
    ///
    /// Panics if called twice.
    pub fn set_vector(&self, vector: impl Fn() + Send + Sync + 'static) {
        if self.vector.set(Box::new(vector)).is_err() {
            panic!("directed interrupt vector installed twice");
        }
    }

    /// Runs `pro` on core 0 and `app` on core 1, each on its own thread.
    /// A core that finishes early keeps taking interrupts until the other is
    /// done too. Panics on either core are propagated.
    pub fn run<A, B>(&self, pro: A, app: B)
    where
        A: FnOnce() + Send,
        B: FnOnce() + Send,
    {
        let done = AtomicU32::new(0);
        thread::scope(|s| {
            s.spawn(|| self.on_core(CoreId::Pro, pro, &done));
            s.spawn(|| self.on_core(CoreId::App, app, &done));
        });
    }

    fn on_core(&self, core: CoreId, body: impl FnOnce(), done: &AtomicU32) {
        struct Finished<'a>(&'a AtomicU32);
        impl Drop for Finished<'_> {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::AcqRel);
            }
        }

        CURRENT.with(|c| c.set(Some(core)));
        {
            let _finished = Finished(done);
            body();
        }
        // The other core may legitimately take a long time, so this wait is
        // exempt from the hang detector.
        while done.load(Ordering::Acquire) < 2 {
            self.poll();
            thread::yield_now();
        }
        CURRENT.with(|c| c.set(None));
    }

    /// Spins, taking interrupts, until both cores have called this the same
    /// number of times.
    pub fn rendezvous(&self) {
        let arrived = self.meet.fetch_add(1, Ordering::AcqRel) + 1;
        let target = arrived + arrived % 2;
        self.idle_until("rendezvous", || {
            self.meet.load(Ordering::Acquire) >= target
        });
    }

    /// Spins, taking interrupts, until `done` holds. Subject to the hang
    /// detector.
    pub fn idle_until(
        &self,
        what: &'static str,
        mut done: impl FnMut() -> bool,
    ) {
        let mut spins = 0u32;
        while !done() {
            self.tick(&what, spins);
            spins = spins.wrapping_add(1);
        }
    }

    /// Takes a pending directed interrupt on the current core, if there is
    /// one and the core isn't already handling it.
    pub fn poll(&self) {
        let core = &self.cores[self.current_core()];
        if core.in_isr.load(Ordering::Acquire)
            || !core.pending.swap(false, Ordering::AcqRel)
        {
            return;
        }
        core.in_isr.store(true, Ordering::Release);
        if let Some(vector) = self.vector.get() {
            vector();
        }
        core.handled.fetch_add(1, Ordering::AcqRel);
        core.in_isr.store(false, Ordering::Release);
    }

    fn tick(&self, what: &dyn fmt::Debug, spins: u32) {
        self.poll();

        if spins == 0 {
            SPIN_START.with(|s| s.set(Instant::now()));
        } else if spins % CHECK_EVERY == 0 {
            let start = SPIN_START.with(Cell::get);
            if start.elapsed() > self.config.hang_timeout {
                panic!(
                    "{:?} hung for {:?} waiting for {what:?}",
                    self.current_core(),
                    self.config.hang_timeout,
                );
            }
        }

        if spins < SPINS_BEFORE_YIELD {
            std::hint::spin_loop();
        } else {
            thread::yield_now();
        }
    }

    /// Writes a register in the file, attributing the write to the current
    /// core.
    pub fn write_register(&self, addr: usize, value: u32) {
        self.registers[Self::slot(addr)].store(value, Ordering::Release);
        self.cores[self.current_core()]
            .writes
            .fetch_add(1, Ordering::AcqRel);
    }

    fn slot(addr: usize) -> usize {
        match addr.checked_sub(REGISTER_BASE).map(|off| off / 4) {
            Some(i) if i < REGISTER_COUNT && addr % 4 == 0 => i,
            _ => panic!("{addr:#x} is not a simulated register"),
        }
    }

    /// Directed interrupts raised at `core` so far.
    pub fn raised(&self, core: CoreId) -> u32 {
        self.cores[core].raised.load(Ordering::Acquire)
    }

    /// Directed interrupts `core` has finished handling so far.
    pub fn handled(&self, core: CoreId) -> u32 {
        self.cores[core].handled.load(Ordering::Acquire)
    }

    /// Whether `core` is inside its directed interrupt handler right now.
    pub fn in_interrupt(&self, core: CoreId) -> bool {
        self.cores[core].in_isr.load(Ordering::Acquire)
    }

    pub fn mask_level(&self, core: CoreId) -> u32 {
        self.cores[core].level.load(Ordering::Acquire)
    }

    /// Register writes made by `core` so far.
    pub fn writes(&self, core: CoreId) -> u32 {
        self.cores[core].writes.load(Ordering::Acquire)
    }

    /// Reads of [`FLUSH_REGISTER`] so far.
    pub fn flushes(&self) -> u32 {
        self.flushes.load(Ordering::Acquire)
    }
}

impl Platform for SimPlatform {
    type Mask = u32;

    fn current_core(&self) -> CoreId {
        match CURRENT.with(Cell::get) {
            Some(core) => core,
            None => panic!("SimPlatform used from a thread that isn't a core"),
        }
    }

    fn raise(&self, target: CoreId) {
        let core = &self.cores[target];
        core.raised.fetch_add(1, Ordering::AcqRel);
        core.pending.store(true, Ordering::Release);
    }

    fn mask_interrupts(&self) -> u32 {
        self.cores[self.current_core()]
            .level
            .fetch_add(1, Ordering::AcqRel)
    }

    fn restore_interrupts(&self, mask: u32) {
        self.cores[self.current_core()]
            .level
            .store(mask, Ordering::Release);
    }

    fn flush_register(&self) -> usize {
        FLUSH_REGISTER
    }

    unsafe fn read_register(&self, addr: usize) -> u32 {
        if addr == FLUSH_REGISTER {
            self.flushes.fetch_add(1, Ordering::AcqRel);
        }
        self.registers[Self::slot(addr)].load(Ordering::Acquire)
    }

    fn relax(&self, wait: Wait, spins: u32) {
        self.tick(&wait, spins);
    }
}

/// A controller whose directed interrupt entry can be wired to a
/// [`SimPlatform`].
pub trait Wired: Sync + 'static {
    fn sim(&self) -> &SimPlatform;
    fn handle_ipi(&self);
}

impl Wired for DirectStall<SimPlatform> {
    fn sim(&self) -> &SimPlatform {
        self.platform()
    }
    fn handle_ipi(&self) {
        DirectStall::handle_ipi(self)
    }
}

impl Wired for RemoteStall<SimPlatform> {
    fn sim(&self) -> &SimPlatform {
        self.platform()
    }
    fn handle_ipi(&self) {
        RemoteStall::handle_ipi(self)
    }
}

impl Wired for RemoteExec<SimPlatform> {
    fn sim(&self) -> &SimPlatform {
        self.platform()
    }
    fn handle_ipi(&self) {
        RemoteExec::handle_ipi(self)
    }
}

/// Leaks `controller` and routes the directed interrupt to it.
///
/// Controllers live for the whole program on real hardware, and leaking them
/// here means a test that panics mid-protocol never runs a destructor that
/// would wait on the peer.
pub fn wire<C: Wired>(controller: C) -> &'static C {
    let c: &'static C = Box::leak(Box::new(controller));
    c.sim().set_vector(move || c.handle_ipi());
    c
}

/// Brings both cores up on `stall`, the way per-core bring-up tasks would.
pub fn bring_up<S: Stall<Platform = SimPlatform> + Sync>(stall: &S) {
    let sim = stall.platform();
    sim.run(
        || {
            stall.init_core();
            sim.rendezvous();
        },
        || {
            stall.init_core();
            sim.rendezvous();
        },
    );
}
