// Pacer
// Copyright (c) 2025-2026 The Project Pacer Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `units` module provides definitions for common units.

use std::fmt;
use std::ops::{Add, AddAssign};

/// A `ScaledQp` is a quantization parameter in a fixed-point representation where one integer QP
/// step equals 64 units.
///
/// The feedback laws of a rate controller produce sub-integer QP corrections. Accumulating those
/// corrections in integer QP would lose them entirely, therefore the working representation is
/// QP×64. A correction ("ratio") is a plain `i32` delta in the same scale.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScaledQp(i32);

impl ScaledQp {
    /// The number of fractional bits in the scaled representation.
    const FRAC_BITS: u32 = 6;

    /// Create a scaled QP from an integer QP.
    pub const fn from_qp(qp: i32) -> ScaledQp {
        ScaledQp(qp << Self::FRAC_BITS)
    }

    /// Create a scaled QP from a raw QP×64 value.
    pub const fn from_raw(raw: i32) -> ScaledQp {
        ScaledQp(raw)
    }

    /// Get the integer QP, truncating the fractional part.
    pub const fn qp(self) -> i32 {
        self.0 >> Self::FRAC_BITS
    }

    /// Get the raw QP×64 value.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Clamp the scaled QP to an inclusive integer QP range.
    pub fn clamp_to(self, min_qp: i32, max_qp: i32) -> ScaledQp {
        ScaledQp(self.0.clamp(min_qp << Self::FRAC_BITS, max_qp << Self::FRAC_BITS))
    }
}

impl Add<i32> for ScaledQp {
    type Output = ScaledQp;

    fn add(self, delta: i32) -> ScaledQp {
        ScaledQp(self.0 + delta)
    }
}

impl AddAssign<i32> for ScaledQp {
    fn add_assign(&mut self, delta: i32) {
        self.0 += delta;
    }
}

impl fmt::Display for ScaledQp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}/64", self.qp(), self.0 & 0x3f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_scaled_qp() {
        assert_eq!(ScaledQp::from_qp(26).raw(), 26 << 6);
        assert_eq!(ScaledQp::from_qp(26).qp(), 26);
        assert_eq!((ScaledQp::from_qp(26) + 63).qp(), 26);
        assert_eq!((ScaledQp::from_qp(26) + 64).qp(), 27);
        assert_eq!((ScaledQp::from_qp(26) + -1).qp(), 25);
    }

    #[test]
    fn verify_scaled_qp_clamp() {
        assert_eq!(ScaledQp::from_qp(60).clamp_to(10, 51), ScaledQp::from_qp(51));
        assert_eq!(ScaledQp::from_qp(4).clamp_to(10, 51), ScaledQp::from_qp(10));
        let mid = ScaledQp::from_qp(30) + 17;
        assert_eq!(mid.clamp_to(10, 51), mid);
    }
}
