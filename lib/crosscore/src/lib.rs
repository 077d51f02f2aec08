// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-core mutual exclusion and remote execution for dual-core parts.
//!
//! This crate lets one core of a two-core chip
//!
//! - keep the other core away from a shared register window for a while (a
//!   _stall_), and
//! - run an arbitrary function on the other core, optionally waiting for it
//!   to finish (a _remote call_).
//!
//! Neither operation uses any blocking OS primitive. Every wait is a spin,
//! so the whole thing works from interrupt handlers, before the scheduler
//! has started, and from a panic handler.
//!
//! The moving parts are:
//!
//! - [`Platform`], which the board provides: "which core am I", "fire the
//!   directed interrupt at that core", and "mask/restore interrupts".
//! - [`RemoteExec`], the single-slot remote call mailbox.
//! - The [`Stall`] trait and its two backends: [`DirectStall`], where the
//!   peer's interrupt handler spins on a pair of per-core flags, and
//!   [`RemoteStall`], which asks [`RemoteExec`] to run a parking function on
//!   the peer. Exactly one of them is [`ActiveStall`], chosen at build time by
//!   the `legacy-stall` feature.
//!
//! ## Wiring
//!
//! The directed interrupt on each core must be routed to the controller's
//! `handle_ipi` method, at a priority above whatever
//! [`Platform::mask_interrupts`] masks. That routing is the platform's job.
//! Once it is in place on a core, a bring-up task on that core calls
//! `init_core`; until both cores have done so, stalls are silently skipped.
//!
//! ## Hazards
//!
//! There are no timeouts. If the peer never takes the directed interrupt
//! (it is wedged, or the vector was never routed), the initiator spins
//! forever and only a watchdog will save you.

#![cfg_attr(target_os = "none", no_std)]

use enum_map::Enum;
use static_assertions::const_assert_eq;

mod cs;
mod mux;
mod platform;
mod remote;
mod spin;
mod stall;
mod state;
pub mod trace;

#[cfg(test)]
mod fake;

pub use cs::CsMask;
pub use mux::CoreMux;
pub use platform::{Platform, Wait};
pub use remote::{RemoteCall, RemoteExec, WaitMode};
pub use spin::wait_until;
pub use stall::{DirectStall, RemoteStall, Stall, StallGuard};
pub use state::StallState;

cfg_if::cfg_if! {
    if #[cfg(feature = "legacy-stall")] {
        /// The stall backend this build uses.
        pub type ActiveStall<P> = DirectStall<P>;
    } else {
        /// The stall backend this build uses.
        pub type ActiveStall<P> = RemoteStall<P>;
    }
}

/// Names one of the two cores.
///
/// The discriminants match the hardware core numbering.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum CoreId {
    /// Core 0, the protocol core, which boots first.
    Pro = 0,
    /// Core 1, the application core.
    App = 1,
}

// Everything in here leans on there being exactly one peer.
const_assert_eq!(<CoreId as Enum>::LENGTH, 2);

impl CoreId {
    pub const ALL: [CoreId; 2] = [CoreId::Pro, CoreId::App];

    /// Returns the other core.
    pub const fn peer(self) -> CoreId {
        match self {
            CoreId::Pro => CoreId::App,
            CoreId::App => CoreId::Pro,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Error returned when converting a core number that doesn't name a core.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BadCoreId(pub u32);

impl TryFrom<u32> for CoreId {
    type Error = BadCoreId;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(CoreId::Pro),
            1 => Ok(CoreId::App),
            _ => Err(BadCoreId(n)),
        }
    }
}
