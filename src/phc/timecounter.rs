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

//! Counter-to-time translation for the free-running hardware clock.
//!
//! The counter wraps at a device-reported bit width, so deltas are always
//! taken modulo the mask and someone has to observe the counter at least
//! once per wrap period to fold elapsed time into the accumulated
//! nanosecond base before a wrap is lost. That someone is the periodic
//! correction task in [`super::Phc`].

/// Scaled-ppm frequency adjustments carry 16 fractional bits, so one ppm
/// is `1 << 16`.
const SCALED_PPM_DENOMINATOR: u128 = 65_536_000_000;

#[derive(Clone, Copy, Debug)]
pub(crate) struct Timecounter {
    mask: u64,
    mult: u32,
    shift: u32,
    /// The multiplier for a nominal (zero-ppm) clock; frequency
    /// adjustments are always computed against this, not the current
    /// multiplier, so they do not accumulate rounding error.
    init_mult: u32,
    cycle_last: u64,
    nsec: u64,
    /// Fractional nanoseconds left over from the last fold, in units of
    /// 2^-shift ns
    frac: u64,
}

/// Pick `mult`/`shift` such that `cycles * mult >> shift` converts counter
/// cycles at `freq_hz` to nanoseconds with the most precision that still
/// fits the multiply in 64 bits for deltas up to a full wrap.
fn mult_shift_for(freq_hz: u64) -> (u32, u32) {
    debug_assert!(freq_hz > 0);
    let mut shift = 32u32;
    loop {
        let mult = (1_000_000_000u128 << shift) / freq_hz as u128;
        if mult <= u32::MAX as u128 {
            return (mult as u32, shift);
        }
        shift -= 1;
    }
}

impl Timecounter {
    pub(crate) fn new(freq_hz: u64, mask_bits: u32, start_cycles: u64, start_ns: u64) -> Timecounter {
        let mask = if mask_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << mask_bits) - 1
        };
        let (mult, shift) = mult_shift_for(freq_hz);
        Timecounter {
            mask,
            mult,
            shift,
            init_mult: mult,
            cycle_last: start_cycles & mask,
            nsec: start_ns,
            frac: 0,
        }
    }

    pub(crate) fn mask(&self) -> u64 {
        self.mask
    }

    fn delta_ns(&self, raw: u64) -> u64 {
        let delta = raw.wrapping_sub(self.cycle_last) & self.mask;
        let widened = delta as u128 * self.mult as u128 + self.frac as u128;
        (widened >> self.shift) as u64
    }

    /// Translate a raw counter value through the current mapping without
    /// mutating it. Valid for values captured less than one wrap period
    /// after the last fold.
    pub(crate) fn cyc2time(&self, raw: u64) -> u64 {
        self.nsec.wrapping_add(self.delta_ns(raw & self.mask))
    }

    /// Fold elapsed cycles into the nanosecond base and advance the cycle
    /// anchor. Called by the periodic correction task and before any
    /// multiplier change.
    pub(crate) fn update(&mut self, raw: u64) {
        let raw = raw & self.mask;
        let delta = raw.wrapping_sub(self.cycle_last) & self.mask;
        let widened = delta as u128 * self.mult as u128 + self.frac as u128;
        self.nsec = self.nsec.wrapping_add((widened >> self.shift) as u64);
        self.frac = (widened & ((1u128 << self.shift) - 1)) as u64;
        self.cycle_last = raw;
    }

    /// Step the clock by a signed nanosecond offset.
    pub(crate) fn adjtime(&mut self, delta_ns: i64) {
        self.nsec = self.nsec.wrapping_add_signed(delta_ns);
    }

    /// Slew the clock rate. `scaled_ppm` is parts-per-million with 16
    /// fractional bits. The caller must fold (`update`) first so the new
    /// rate only applies from now on.
    pub(crate) fn adjfine(&mut self, scaled_ppm: i64) {
        let diff =
            ((self.init_mult as u128 * scaled_ppm.unsigned_abs() as u128) / SCALED_PPM_DENOMINATOR) as u32;
        self.mult = if scaled_ppm < 0 {
            self.init_mult.saturating_sub(diff)
        } else {
            self.init_mult.saturating_add(diff)
        };
    }

    /// Nanoseconds until the counter wraps past the last fold point.
    pub(crate) fn wrap_period_ns(&self) -> u64 {
        ((self.mask as u128 * self.mult as u128) >> self.shift) as u64
    }
}
