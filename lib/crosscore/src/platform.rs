// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::CoreId;

/// What a spinning core is waiting for. Passed to [`Platform::relax`] on
/// every iteration of a busy-wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Another core holds the cross-core mux.
    Mux,
    /// The peer has not yet taken the directed interrupt.
    PeerArrived,
    /// Running in the directed interrupt, parked until the initiator lets go.
    StallRelease,
    /// A previous remote call has not finished.
    Quiescent,
    /// The peer has not yet started the remote call.
    CallStarted,
    /// The peer has not yet finished the remote call.
    CallFinished,
}

/// The hardware and OS services the protocol is built on.
///
/// Implementations are per-board. Everything here must be callable from
/// interrupt context and before any scheduler is running.
pub trait Platform: Sync {
    /// Saved interrupt state, as produced by `mask_interrupts`.
    type Mask: Copy + Send;

    /// Returns the core executing the call.
    fn current_core(&self) -> CoreId;

    /// Fires the directed interrupt at `target`. Edge-triggered, no payload.
    fn raise(&self, target: CoreId);

    /// Masks interrupts on the current core, returning the previous state.
    /// Must nest. The directed interrupt has to stay deliverable.
    fn mask_interrupts(&self) -> Self::Mask;

    /// Restores the state returned by a matching `mask_interrupts`.
    fn restore_interrupts(&self, mask: Self::Mask);

    /// Address of a peripheral register whose read completes only after any
    /// posted bus writes have drained.
    fn flush_register(&self) -> usize;

    /// Reads a 32-bit register.
    ///
    /// # Safety
    ///
    /// `addr` must be a readable, aligned register address on this part.
    unsafe fn read_register(&self, addr: usize) -> u32 {
        core::ptr::read_volatile(addr as *const u32)
    }

    /// Called once per iteration of every busy-wait, with the number of
    /// iterations so far.
    fn relax(&self, wait: Wait, spins: u32) {
        let _ = (wait, spins);
        core::hint::spin_loop();
    }
}
