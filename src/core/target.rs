//! Compact difficulty targets
//!
//! Targets are carried in block headers in the compact "bits" form: one
//! exponent byte and a 23-bit mantissa, `target = mantissa * 256^(exponent - 3)`.
//! A header satisfies its target when the header hash, read as a big-endian
//! 256-bit integer, is less than or equal to the expanded target.

use crate::crypto::Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compact encoding of a 256-bit proof-of-work target
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompactTarget(pub u32);

impl CompactTarget {
    /// Easiest target allowed on the test network style chains
    pub const POW_LIMIT: CompactTarget = CompactTarget(0x207f_ffff);

    fn exponent(self) -> i32 {
        (self.0 >> 24) as i32
    }

    fn mantissa(self) -> u32 {
        self.0 & 0x007f_ffff
    }

    fn is_negative(self) -> bool {
        self.0 & 0x0080_0000 != 0 && self.mantissa() != 0
    }

    /// Expand to a big-endian 256-bit value.
    ///
    /// Returns `None` for negative or overflowing encodings.
    pub fn expand(self) -> Option<[u8; 32]> {
        if self.is_negative() {
            return None;
        }
        scaled_to_bytes(self.mantissa() as u128, self.exponent() - 3)
    }

    /// A target is usable when it expands and is non-zero
    pub fn is_valid(self) -> bool {
        matches!(self.expand(), Some(t) if t != [0u8; 32])
    }

    /// Compress a 256-bit big-endian value into compact form (rounding down)
    pub fn from_target(target: &[u8; 32]) -> Self {
        let first = match target.iter().position(|b| *b != 0) {
            Some(i) => i,
            None => return CompactTarget(0),
        };
        let mut size = (32 - first) as u32;
        let mut mantissa: u32 = if size <= 3 {
            let mut m = 0u32;
            for b in &target[first..] {
                m = (m << 8) | *b as u32;
            }
            m << (8 * (3 - size))
        } else {
            ((target[first] as u32) << 16)
                | ((target[first + 1] as u32) << 8)
                | target[first + 2] as u32
        };

        // Keep the sign bit clear
        if mantissa & 0x0080_0000 != 0 {
            mantissa >>= 8;
            size += 1;
        }
        CompactTarget((size << 24) | mantissa)
    }

    /// Whether `hash` (big-endian) is at or below this target
    pub fn is_met_by(self, hash: &Hash256) -> bool {
        match self.expand() {
            Some(target) => hash.as_bytes() <= &target,
            None => false,
        }
    }

    /// Expected number of hashes to meet this target: `2^256 / (target + 1)`.
    ///
    /// Computed from the compact form and saturated to `u128`, which is exact
    /// enough to order chains built from the same retarget rules.
    pub fn work(self) -> u128 {
        let mantissa = self.mantissa() as u128;
        if mantissa == 0 || self.is_negative() {
            return 0;
        }
        let shift = 256 - 8 * (self.exponent() - 3);
        if shift <= 0 {
            return 1;
        }
        let work = if shift < 128 {
            (1u128 << shift) / mantissa
        } else {
            // 2^shift / m == (2^127 / m) * 2^(shift - 127)
            let extra = shift - 127;
            let base = (1u128 << 127) / mantissa;
            if extra >= 128 {
                u128::MAX
            } else {
                base.checked_mul(1u128 << extra).unwrap_or(u128::MAX)
            }
        };
        work.max(1)
    }

    /// Scale this target by `actual / expected`, clamped to the adjustment
    /// factor and never easier than `limit`.
    pub fn retarget(
        self,
        actual_timespan: i64,
        expected_timespan: u64,
        max_adjust_factor: u64,
        limit: CompactTarget,
    ) -> CompactTarget {
        let expected = expected_timespan.max(1);
        let factor = max_adjust_factor.max(1);
        let min_span = (expected / factor).max(1);
        let max_span = expected.saturating_mul(factor);
        let actual = (actual_timespan.max(0) as u64).clamp(min_span, max_span);

        // Work with four extra mantissa bytes to keep precision when shrinking
        let scaled = ((self.mantissa() as u128) << 32) * actual as u128 / expected as u128;
        let limit_bytes = limit.expand().unwrap_or([0xff; 32]);

        match scaled_to_bytes(scaled, self.exponent() - 3 - 4) {
            Some(bytes) if bytes <= limit_bytes => CompactTarget::from_target(&bytes),
            _ => limit,
        }
    }
}

impl fmt::Debug for CompactTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompactTarget({:#010x})", self.0)
    }
}

impl fmt::Display for CompactTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// `value * 256^exp_bytes` as a big-endian 256-bit array, `None` on overflow
fn scaled_to_bytes(mut value: u128, mut exp_bytes: i32) -> Option<[u8; 32]> {
    if exp_bytes < 0 {
        let shift = -exp_bytes * 8;
        value = if shift >= 128 { 0 } else { value >> shift };
        exp_bytes = 0;
    }

    let mut out = [0u8; 32];
    let start = 16 - exp_bytes;
    for (j, byte) in value.to_be_bytes().iter().enumerate() {
        let idx = start + j as i32;
        if idx < 0 {
            if *byte != 0 {
                return None;
            }
        } else {
            out[idx as usize] = *byte;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_known_values() {
        let t = CompactTarget(0x1d00_ffff).expand().unwrap();
        // 0x00000000ffff0000...
        assert_eq!(&t[..6], &[0, 0, 0, 0, 0xff, 0xff]);
        assert!(t[6..].iter().all(|b| *b == 0));

        let limit = CompactTarget::POW_LIMIT.expand().unwrap();
        assert_eq!(&limit[..3], &[0x7f, 0xff, 0xff]);
    }

    #[test]
    fn test_compress_round_trips_canonical_bits() {
        for bits in [0x1d00_ffffu32, 0x1f00_ffff, 0x207f_ffff, 0x1b04_04cb] {
            let target = CompactTarget(bits).expand().unwrap();
            assert_eq!(CompactTarget::from_target(&target), CompactTarget(bits));
        }
    }

    #[test]
    fn test_negative_and_zero_targets_are_invalid() {
        assert!(!CompactTarget(0x1d80_ffff).is_valid());
        assert!(!CompactTarget(0x1d00_0000).is_valid());
        assert!(CompactTarget::POW_LIMIT.is_valid());
    }

    #[test]
    fn test_is_met_by() {
        let easy = CompactTarget::POW_LIMIT;
        let mut low = [0u8; 32];
        low[0] = 0x10;
        assert!(easy.is_met_by(&Hash256(low)));
        assert!(!easy.is_met_by(&Hash256([0xff; 32])));
    }

    #[test]
    fn test_harder_target_has_more_work() {
        let easy = CompactTarget(0x207f_ffff).work();
        let medium = CompactTarget(0x1f00_ffff).work();
        let hard = CompactTarget(0x1d00_ffff).work();
        assert!(easy >= 1);
        assert!(easy < medium);
        assert!(medium < hard);
    }

    #[test]
    fn test_retarget_clamps_to_factor() {
        let start = CompactTarget(0x1f00_ffff);
        let limit = CompactTarget::POW_LIMIT;

        // Blocks arrived instantly: four times harder at most
        let harder = start.retarget(0, 540, 4, limit);
        let expected = start.retarget(135, 540, 4, limit);
        assert_eq!(harder, expected);
        assert!(harder.work() > start.work());

        // On schedule: unchanged
        assert_eq!(start.retarget(540, 540, 4, limit), start);

        // Very slow: easier, but never beyond the limit
        let easier = start.retarget(1_000_000, 540, 4, limit);
        assert!(easier.work() < start.work());
        assert_eq!(limit.retarget(1_000_000, 540, 4, limit), limit);
    }
}
