// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;

use crosscore::trace::Event;
use crosscore::{CoreId, Platform, RemoteExec, RemoteStall, Stall, WaitMode};
use crosscore_sim::{bring_up, wire, SimConfig, SimPlatform};

fn exec() -> &'static RemoteExec<SimPlatform> {
    wire(RemoteExec::new(SimPlatform::new(SimConfig::default())))
}

// Load and store rather than an atomic add, so that two calls running at once
// would lose an update.
fn increment(counter: &AtomicU32) {
    let v = counter.load(Ordering::Relaxed);
    counter.store(v + 1, Ordering::Relaxed);
}

struct Sighting<'a> {
    sim: &'a SimPlatform,
    calls: AtomicU32,
    ran_on: AtomicU32,
    in_handler: AtomicBool,
}

fn sight(p: &Sighting<'_>) {
    let me = p.sim.current_core();
    p.calls.fetch_add(1, Ordering::Relaxed);
    p.ran_on.store(me as u32, Ordering::Relaxed);
    p.in_handler.store(p.sim.in_interrupt(me), Ordering::Relaxed);
}

#[test]
fn blocking_round_trip() {
    let exec = exec();
    let sim = exec.platform();
    let p = Sighting {
        sim,
        calls: AtomicU32::new(0),
        ran_on: AtomicU32::new(u32::MAX),
        in_handler: AtomicBool::new(false),
    };

    sim.run(
        || {
            exec.call_blocking(sight, &p);
            assert_eq!(p.calls.load(Ordering::Relaxed), 1);
            assert!(exec.is_quiescent());
        },
        || (),
    );

    assert_eq!(p.ran_on.load(Ordering::Relaxed), CoreId::App as u32);
    assert!(p.in_handler.load(Ordering::Relaxed));
    assert_eq!(exec.trace().total(Event::Dispatched), 1);
    assert_eq!(exec.trace().total(Event::Handled), 1);
}

#[test]
fn calls_from_both_cores() {
    const CALLS: u32 = 1000;

    let exec = exec();
    let sim = exec.platform();
    let counter = AtomicU32::new(0);
    let work = || {
        for _ in 0..CALLS {
            exec.call_blocking(increment, &counter);
        }
    };
    sim.run(work, work);

    assert_eq!(counter.load(Ordering::Relaxed), 2 * CALLS);
    assert!(exec.is_quiescent());
    assert_eq!(sim.handled(CoreId::Pro), CALLS);
    assert_eq!(sim.handled(CoreId::App), CALLS);
    for core in CoreId::ALL {
        assert_eq!(sim.mask_level(core), 0);
    }
}

struct Gate {
    go: AtomicBool,
    done: AtomicBool,
}

fn hold(gate: &Gate) {
    while !gate.go.load(Ordering::Acquire) {
        thread::yield_now();
    }
    gate.done.store(true, Ordering::Release);
}

#[test]
fn wait_for_start_returns_early() {
    static GATE: Gate = Gate {
        go: AtomicBool::new(false),
        done: AtomicBool::new(false),
    };

    let exec = exec();
    let sim = exec.platform();
    sim.run(
        || {
            exec.call(hold, &GATE, WaitMode::ForStart);

            // The peer is in `hold`, waiting on us.
            assert!(sim.in_interrupt(CoreId::App));
            assert!(!exec.is_quiescent());
            assert!(!GATE.done.load(Ordering::Acquire));

            GATE.go.store(true, Ordering::Release);
            sim.idle_until("call to finish", || exec.is_quiescent());
            assert!(GATE.done.load(Ordering::Acquire));
        },
        || (),
    );
}

#[test]
fn call_on_names_the_peer() {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let exec = exec();
    let sim = exec.platform();
    sim.run(
        || (),
        || {
            exec.call_on(
                CoreId::Pro,
                increment,
                &COUNTER,
                WaitMode::ForCompletion,
            );
            assert_eq!(COUNTER.load(Ordering::Relaxed), 1);
        },
    );
    assert_eq!(sim.raised(CoreId::Pro), 1);
    assert_eq!(sim.raised(CoreId::App), 0);
}

#[test]
fn stalls_and_calls_share_the_vector() {
    const ROUNDS: u32 = 1000;

    let stall = wire(RemoteStall::new(SimPlatform::new(SimConfig::default())));
    bring_up(stall);
    let sim = stall.platform();
    let counter = AtomicU32::new(0);

    sim.run(
        || {
            for _ in 0..ROUNDS {
                stall.with_stall(|| increment(&counter));
            }
        },
        || {
            for _ in 0..ROUNDS {
                stall.exec().call_blocking(increment, &counter);
            }
        },
    );

    assert_eq!(counter.load(Ordering::Relaxed), 2 * ROUNDS);
    assert!(stall.exec().is_quiescent());
    assert_eq!(stall.trace().total(Event::Engaged), ROUNDS);
    assert_eq!(stall.trace().total(Event::Dispatched), 2 * ROUNDS);
}

#[test]
fn stray_interrupts_never_run_a_stale_call() {
    const CALLS: u32 = 1000;

    let exec = exec();
    let sim = exec.platform();
    let stop = AtomicBool::new(false);

    sim.run(
        || {
            for _ in 0..CALLS {
                // A fresh tally each time: a handler that ran the previous
                // call again would bump a tally that is already checked.
                let tally = AtomicU32::new(0);
                exec.call_blocking(increment, &tally);
                assert_eq!(tally.load(Ordering::Relaxed), 1);
            }
            stop.store(true, Ordering::Release);
        },
        || {
            // Enter the handler over and over, racing each publish.
            while !stop.load(Ordering::Acquire) {
                exec.handle_ipi();
                sim.poll();
            }
        },
    );

    assert!(exec.is_quiescent());
    assert_eq!(exec.trace().total(Event::Handled), CALLS);
}

#[test]
fn call_inside_stall_window_panics() {
    let stall = wire(RemoteStall::new(SimPlatform::new(SimConfig::default())));
    bring_up(stall);
    let sim = stall.platform();
    let counter = AtomicU32::new(0);

    sim.run(
        || {
            stall.begin_stall();
            let err = panic::catch_unwind(AssertUnwindSafe(|| {
                stall.exec().call_blocking(increment, &counter);
            }))
            .unwrap_err();
            let msg = err.downcast_ref::<String>().unwrap();
            assert!(msg.contains("inside an open stall window"), "{msg}");

            // The window is intact and still closes normally.
            assert!(sim.in_interrupt(CoreId::App));
            assert_eq!(stall.nesting(CoreId::Pro), 1);
            stall.end_stall();
            sim.idle_until("peer to leave its handler", || {
                !sim.in_interrupt(CoreId::App)
            });
            assert_eq!(sim.mask_level(CoreId::Pro), 0);

            // And the controller is usable again once it has.
            stall.exec().call_blocking(increment, &counter);
        },
        || (),
    );

    assert_eq!(counter.load(Ordering::Relaxed), 1);
    assert_eq!(stall.trace().total(Event::Dispatched), 2);
}
