// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol event tracing.
//!
//! Every controller carries a [`TraceLog`]: one small ring of recent
//! [`Trace`] entries per core, plus a counter per [`Event`] kind. The rings
//! are meant to be read out of a halted part with a debugger (or by a test);
//! the counters keep the long-run totals that the rings forget.
//!
//! As in a ringbuf, an entry that repeats the previous one (same line,
//! same payload) bumps that entry's `count` rather than taking a new slot,
//! so a tight loop of stalls shows up as one line.
//!
//! Entries are recorded on the ring of the core they happen on, from thread
//! context or from the directed interrupt (a remote call body may itself
//! dispatch). An interrupt can land while its own core is halfway through a
//! ring write; the ring is then busy, and the interrupt's entry is dropped.
//! Its counter is still bumped, so totals never lose an event. Enabling the
//! `trace-disabled` feature compiles ring writes out.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use enum_map::{Enum, EnumMap};

use crate::remote::WaitMode;
use crate::CoreId;

/// Entries kept per core.
pub const TRACE_ENTRIES: usize = 16;

/// A traced protocol event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    CoreOnline,
    Engaged { peer: CoreId },
    Bypassed,
    Released { peer: CoreId },
    Dispatched { target: CoreId, wait: WaitMode },
    Paused,
    Resumed,
}

/// Counted event kinds. Includes the ones that only happen in interrupt or
/// panic context and so never make it into a ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum Event {
    CoreOnline,
    Engaged,
    Bypassed,
    Released,
    Dispatched,
    Handled,
    Paused,
    Resumed,
    Aborted,
}

impl Trace {
    fn event(&self) -> Option<Event> {
        Some(match self {
            Trace::None => return None,
            Trace::CoreOnline => Event::CoreOnline,
            Trace::Engaged { .. } => Event::Engaged,
            Trace::Bypassed => Event::Bypassed,
            Trace::Released { .. } => Event::Released,
            Trace::Dispatched { .. } => Event::Dispatched,
            Trace::Paused => Event::Paused,
            Trace::Resumed => Event::Resumed,
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct TraceEntry {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: Trace,
}

const EMPTY: TraceEntry = TraceEntry {
    line: 0,
    generation: 0,
    count: 0,
    payload: Trace::None,
};

#[derive(Debug)]
pub struct TraceRing {
    last: Option<usize>,
    buffer: [TraceEntry; TRACE_ENTRIES],
}

impl TraceRing {
    const fn new() -> Self {
        Self {
            last: None,
            buffer: [EMPTY; TRACE_ENTRIES],
        }
    }

    fn entry(&mut self, line: u16, payload: Trace) {
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(count) = ent.count.checked_add(1) {
                    ent.count = count;
                    return;
                }
            }
        }

        let ndx = match last.wrapping_add(1) {
            n if n >= self.buffer.len() => 0,
            n => n,
        };
        let ent = &mut self.buffer[ndx];
        *ent = TraceEntry {
            line,
            generation: ent.generation.wrapping_add(1),
            count: 1,
            payload,
        };
        self.last = Some(ndx);
    }

    /// The most recent entry.
    pub fn last(&self) -> Option<&TraceEntry> {
        self.last.and_then(|i| self.buffer.get(i))
    }

    /// Entries from oldest to newest, skipping never-written slots.
    pub fn iter(&self) -> impl Iterator<Item = &TraceEntry> + '_ {
        let start = self.last.map_or(0, |i| i + 1);
        self.buffer[start..]
            .iter()
            .chain(&self.buffer[..start])
            .filter(|e| e.count != 0)
    }
}

struct Slot {
    busy: AtomicBool,
    ring: UnsafeCell<TraceRing>,
}

impl Slot {
    const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            ring: UnsafeCell::new(TraceRing::new()),
        }
    }

    fn with<R>(&self, body: impl FnOnce(&mut TraceRing) -> R) -> Option<R> {
        if self.busy.swap(true, Ordering::Acquire) {
            return None;
        }
        // Safety: the `busy` flag above makes this the only reference.
        let r = body(unsafe { &mut *self.ring.get() });
        self.busy.store(false, Ordering::Release);
        Some(r)
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU32 = AtomicU32::new(0);

pub struct TraceLog {
    rings: [Slot; 2],
    counts: [AtomicU32; <Event as Enum>::LENGTH],
}

// Safety: ring access is serialized by each slot's `busy` flag; counters are
// atomics.
unsafe impl Sync for TraceLog {}

impl TraceLog {
    pub const fn new() -> Self {
        Self {
            rings: [Slot::new(), Slot::new()],
            counts: [ZERO; <Event as Enum>::LENGTH],
        }
    }

    /// Counts `payload` and, unless tracing is disabled, puts it in `core`'s
    /// ring. Use the `trace!` macro rather than calling this directly, so the
    /// line number is filled in.
    pub fn record(&self, core: CoreId, line: u16, payload: Trace) {
        if let Some(event) = payload.event() {
            self.count(event);
        }
        if cfg!(not(feature = "trace-disabled")) {
            let _ = self.rings[core.index()].with(|r| r.entry(line, payload));
        }
    }

    /// Counts `event` without touching any ring. Safe from any context.
    pub fn count(&self, event: Event) {
        self.counts[event.into_usize()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self, event: Event) -> u32 {
        self.counts[event.into_usize()].load(Ordering::Relaxed)
    }

    pub fn totals(&self) -> EnumMap<Event, u32> {
        EnumMap::from_fn(|e| self.total(e))
    }

    /// Runs `body` on `core`'s ring. Returns `None` if the ring is being
    /// written at the moment.
    pub fn inspect<R>(
        &self,
        core: CoreId,
        body: impl FnOnce(&TraceRing) -> R,
    ) -> Option<R> {
        self.rings[core.index()].with(|r| body(r))
    }
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Records a [`Trace`] in a [`TraceLog`], tagged with the current line.
macro_rules! trace {
    ($log:expr, $core:expr, $payload:expr) => {{
        let (log, core, payload) = (&$log, $core, $payload);
        $crate::trace::TraceLog::record(log, core, line!() as u16, payload);
    }};
}
pub(crate) use trace;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(feature = "trace-disabled", ignore)]
    fn repeats_coalesce() {
        let log = TraceLog::new();
        for _ in 0..5 {
            log.record(CoreId::Pro, 10, Trace::Bypassed);
        }
        log.record(CoreId::Pro, 11, Trace::Bypassed);

        log.inspect(CoreId::Pro, |ring| {
            let entries: Vec<_> = ring.iter().collect();
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].count, 5);
            assert_eq!(entries[1].line, 11);
        })
        .unwrap();
        assert_eq!(log.total(Event::Bypassed), 6);
    }

    #[test]
    #[cfg_attr(feature = "trace-disabled", ignore)]
    fn rings_are_per_core() {
        let log = TraceLog::new();
        log.record(CoreId::App, 1, Trace::Paused);
        assert!(log.inspect(CoreId::Pro, |r| r.last().is_none()).unwrap());
        let last = log.inspect(CoreId::App, |r| *r.last().unwrap()).unwrap();
        assert_eq!(last.payload, Trace::Paused);
    }

    #[test]
    #[cfg_attr(feature = "trace-disabled", ignore)]
    fn wraps_and_bumps_generation() {
        let log = TraceLog::new();
        for line in 0..(TRACE_ENTRIES as u16 + 3) {
            log.record(CoreId::Pro, line, Trace::Resumed);
        }
        log.inspect(CoreId::Pro, |ring| {
            let lines: Vec<u16> = ring.iter().map(|e| e.line).collect();
            assert_eq!(lines.len(), TRACE_ENTRIES);
            assert_eq!(lines[0], 3);
            assert_eq!(*lines.last().unwrap(), TRACE_ENTRIES as u16 + 2);
            assert_eq!(ring.last().unwrap().generation, 2);
        })
        .unwrap();
    }

    #[test]
    fn counter_only_events() {
        let log = TraceLog::new();
        log.count(Event::Handled);
        log.count(Event::Aborted);
        log.count(Event::Handled);
        let totals = log.totals();
        assert_eq!(totals[Event::Handled], 2);
        assert_eq!(totals[Event::Aborted], 1);
        assert!(log.inspect(CoreId::Pro, |r| r.last().is_none()).unwrap());
    }

    #[test]
    fn busy_ring_drops_entry_but_counts_it() {
        let log = TraceLog::new();
        // Recording while the ring is held is what an interrupt sees when it
        // preempts a write on its own core.
        let held = log.inspect(CoreId::Pro, |_| {
            log.record(CoreId::Pro, 7, Trace::Paused);
        });
        assert!(held.is_some());
        assert_eq!(log.total(Event::Paused), 1);
        assert!(log.inspect(CoreId::Pro, |r| r.last().is_none()).unwrap());
    }
}
