//! Count leading zeros
#![allow(clippy::if_same_then_else)]

#[allow(clippy::needless_bool)]
const HAS_CLZ: bool = if cfg!(target_arch = "riscv32") || cfg!(target_arch = "riscv64") {
    cfg!(target_feature = "zbb") || cfg!(target_feature = "b")
} else if cfg!(target_arch = "arm") {
    // Armv5T and later in Arm mode, Thumb-2 otherwise
    cfg!(target_feature = "v6t2")
        || (cfg!(target_feature = "v5te") && !cfg!(target_feature = "thumb-mode"))
} else if cfg!(target_arch = "msp430") || cfg!(target_arch = "avr") {
    false
} else {
    // AArch64: All
    // x86: 80386 and later (`bsr`)
    true
};

/// Indicates whether the target includes a barrel shifter.
#[allow(clippy::needless_bool)]
const HAS_SHIFTER: bool = if cfg!(target_arch = "msp430") || cfg!(target_arch = "avr") {
    false
} else {
    true
};

/// Return the number of leading zeros in the 32-bit word `x`. Returns `32` if
/// `x` is zero.
///
/// The scheduler's priority bitmaps map priority `p` to bit `31 - p`, so this
/// yields the most urgent set level.
#[inline]
pub fn leading_zeros(x: u32) -> u32 {
    if HAS_CLZ {
        x.leading_zeros()
    } else if HAS_SHIFTER {
        clz_bsearch32(x)
    } else {
        clz_linear(x)
    }
}

/// Implements [`leading_zeros`] using a look-up table.
/// `x` must be in range `1..16`.
#[inline]
fn clz4_lut_nonzero(x: u32) -> u32 {
    debug_assert!(x < 16 && x != 0);
    // Two bits per entry, entry `x` at bit `2 * x`:
    // 1 => 3, 2..=3 => 2, 4..=7 => 1, 8..=15 => 0
    (0b00_00_00_00_00_00_00_00_01_01_01_01_10_10_11_00 >> (x * 2)) & 0b11
}

/// Implements [`leading_zeros`] using binary search. The last level is
/// handled by [`clz4_lut_nonzero`].
#[inline]
fn clz_bsearch32(mut x: u32) -> u32 {
    if x == 0 {
        return 32;
    }

    let mut i = 0;

    if (x & 0xffff_0000) == 0 {
        x <<= 16;
        i += 16;
    }

    if (x & 0xff00_0000) == 0 {
        x <<= 8;
        i += 8;
    }

    if (x & 0xf000_0000) == 0 {
        x <<= 4;
        i += 4;
    }

    i + clz4_lut_nonzero(x >> 28)
}

/// Implements [`leading_zeros`] using linear search.
#[inline]
fn clz_linear(x: u32) -> u32 {
    for i in 0..32 {
        if x & (0x8000_0000 >> i) != 0 {
            return i;
        }
    }
    32
}
