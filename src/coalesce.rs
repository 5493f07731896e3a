/*
Copyright 2025  The Nicplane Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Interrupt coalescing unit conversion.
//!
//! The device reports a multiplier/divisor pair defining its coalescing
//! unit. The conversion below is device-defined and must stay bit-exact,
//! including the half-unit rounding bias and the zero fallback.

use crate::device::DeviceIdentity;

/// Convert a user-specified microsecond delay to hardware coalescing units.
///
/// A zero multiplier or divisor means the device identity is malformed or
/// coalescing is unavailable; the conversion degrades to 0 ("coalescing
/// disabled") rather than failing, so a bad identity can never make
/// configuration calls error out.
pub fn usecs_to_hw(usecs: u32, mult: u32, div: u32) -> u32 {
    if mult == 0 || div == 0 {
        return 0;
    }

    // Round up in case usecs is close to the next hw unit
    let usecs = u64::from(usecs) + u64::from((div / mult) >> 1);

    // Convert from usecs to device units. The intermediate is widened only
    // to avoid overflow; the truncating division is part of the contract.
    ((usecs * u64::from(mult)) / u64::from(div)) as u32
}

/// Per-LIF coalescing record: what the user asked for and what the hardware
/// is actually using, per direction. Guarded by the configuration lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoalesceSettings {
    /// Rx delay the user asked for, in microseconds
    pub rx_usecs: u32,
    /// Rx delay the hardware is using, in hardware units
    pub rx_hw: u32,
    /// Tx delay the user asked for, in microseconds
    pub tx_usecs: u32,
    /// Tx delay the hardware is using, in hardware units
    pub tx_hw: u32,
}

impl CoalesceSettings {
    /// Capture a user request, deriving the hardware values from the
    /// device identity.
    pub fn from_usecs(ident: &DeviceIdentity, tx_usecs: u32, rx_usecs: u32) -> Self {
        CoalesceSettings {
            rx_usecs,
            rx_hw: usecs_to_hw(rx_usecs, ident.intr_coal_mult, ident.intr_coal_div),
            tx_usecs,
            tx_hw: usecs_to_hw(tx_usecs, ident.intr_coal_mult, ident.intr_coal_div),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::usecs_to_hw;

    #[test]
    fn zero_mult_or_div_disables_coalescing() {
        for usecs in [0u32, 1, 17, 1000, u32::MAX] {
            assert_eq!(usecs_to_hw(usecs, 0, 3), 0);
            assert_eq!(usecs_to_hw(usecs, 2, 0), 0);
            assert_eq!(usecs_to_hw(usecs, 0, 0), 0);
        }
    }

    #[test]
    fn monotonic_in_usecs() {
        for (mult, div) in [(1u32, 1u32), (2, 3), (3, 2), (25, 8), (1, 1000)] {
            let mut prev = 0;
            for usecs in 0..10_000 {
                let hw = usecs_to_hw(usecs, mult, div);
                assert!(
                    hw >= prev,
                    "usecs_to_hw({usecs}, {mult}, {div}) = {hw} < {prev}"
                );
                prev = hw;
            }
        }
    }

    #[test]
    fn pins_rounding_formula() {
        // mult=2, div=3: the half-unit bias is (3/2)>>1 == 0, so the
        // conversion is a plain (100 * 2) / 3.
        assert_eq!(usecs_to_hw(100, 2, 3), 66);

        // mult=1, div=5: bias is (5/1)>>1 == 2, so 3us lands on the next
        // unit instead of truncating to 0.
        assert_eq!(usecs_to_hw(3, 1, 5), 1);
        assert_eq!(usecs_to_hw(2, 1, 5), 0);
    }

    #[test]
    fn wide_inputs_do_not_overflow() {
        // Would overflow a 32-bit intermediate; must still be monotonic.
        let a = usecs_to_hw(u32::MAX - 1, 25, 8);
        let b = usecs_to_hw(u32::MAX, 25, 8);
        assert!(b >= a);
    }
}
