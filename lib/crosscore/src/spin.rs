// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::platform::{Platform, Wait};

/// Spins until `done` returns true.
///
/// This is the only busy-wait in the crate; every "wait for the peer" goes
/// through here so that a harness can bound it via [`Platform::relax`]. There
/// is no timeout.
#[inline]
pub fn wait_until<P: Platform + ?Sized>(
    platform: &P,
    wait: Wait,
    mut done: impl FnMut() -> bool,
) {
    let mut spins: u32 = 0;
    while !done() {
        platform.relax(wait, spins);
        spins = spins.wrapping_add(1);
    }
}
