//! Q32 fixed-point helpers.
//!
//! Cycle-rate arithmetic (tape sampling, H counter) divides by constants via
//! reciprocal multiplication. The rounding is floor on the reciprocal and
//! floor again on the product, matching the bit-exact behavior the timing
//! code depends on.

/// Reciprocal of `div` in Q32, truncated.
pub fn inv_q32(div: u32) -> u32 {
    debug_assert!(div != 0);
    ((1u64 << 32) / div as u64) as u32
}

/// `x / div` computed as `(x * inv_q32(div)) >> 32`.
pub fn div_q32(x: u32, div: u32) -> u32 {
    ((x as u64 * inv_q32(div) as u64) >> 32) as u32
}

/// `x` scaled by a precomputed Q32 reciprocal, truncated.
pub fn scale_q32(x: u32, mult: u32) -> u32 {
    ((x as u64 * mult as u64) >> 32) as u32
}

/// `x` scaled by a precomputed Q32 reciprocal, rounded to nearest.
pub fn scale_q32_round(x: u32, mult: u32) -> u32 {
    ((x as u64 * mult as u64 + 0x8000_0000) >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inv_q32_known_values() {
        assert_eq!(inv_q32(1), 0); // 2^32 truncated to u32
        assert_eq!(inv_q32(2), 0x8000_0000);
        assert_eq!(inv_q32(4), 0x4000_0000);
    }

    #[test]
    fn test_div_q32_matches_integer_division() {
        for x in [0u32, 1, 171, 228, 39330, 0xffff] {
            for d in [3u32, 171, 228, 2983] {
                let q = div_q32(x, d);
                // reciprocal truncation may undershoot by at most one
                assert!(q == x / d || q + 1 == x / d, "{x}/{d}: got {q}");
            }
        }
    }

    #[test]
    fn test_scale_q32_roundtrip() {
        let mult = inv_q32(2982); // NTSC Z80 cycles per 1200Hz bit cell
        assert_eq!(scale_q32(2982, mult), 0);
        assert_eq!(scale_q32(2983, mult), 1);
        assert_eq!(scale_q32(29820, mult), 9);
    }
}
