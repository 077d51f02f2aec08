// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Interrupt mask state taken through the `critical-section` crate.
///
/// Boards whose RTOS port provides a `critical-section` implementation can
/// use this as their [`Platform::Mask`](crate::Platform::Mask) and forward
/// `mask_interrupts`/`restore_interrupts` to [`CsMask::enter`] and
/// [`CsMask::exit`]. The implementation must leave the directed interrupt
/// unmasked, and must nest.
#[derive(Copy, Clone, Debug)]
pub struct CsMask(critical_section::RestoreState);

impl CsMask {
    #[inline]
    pub fn enter() -> Self {
        // Safety: the matching release happens in `exit`, which the stall
        // and mux code call in strict LIFO order on the same core.
        Self(unsafe { critical_section::acquire() })
    }

    #[inline]
    pub fn exit(self) {
        // Safety: `self` came from `enter` on this core, see above.
        unsafe { critical_section::release(self.0) }
    }
}
