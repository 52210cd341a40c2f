//! Integer helpers for tiling arithmetic. All helpers treat a zero divisor
//! or alignment as "no constraint" rather than panicking.

/// `ceil(a / b)`; returns 0 when `b == 0`.
#[inline]
pub const fn ceil_div(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        a.div_ceil(b)
    }
}

/// Round `value` up to a multiple of `align`.
#[inline]
pub const fn ceil_align(value: u64, align: u64) -> u64 {
    if align == 0 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Round `value` down to a multiple of `align`.
#[inline]
pub const fn floor_align(value: u64, align: u64) -> u64 {
    if align == 0 {
        value
    } else {
        value / align * align
    }
}

/// `a / b` with 0 for a zero divisor.
#[inline]
pub const fn safe_div(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        a / b
    }
}

/// Elements per DMA block for a given element width (never below 1).
#[inline]
pub const fn block_elems(align_bytes: u64, elem_bytes: u64) -> u64 {
    let n = safe_div(align_bytes, elem_bytes);
    if n == 0 {
        1
    } else {
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(ceil_div(10, 3), 4);
        assert_eq!(ceil_div(9, 3), 3);
        assert_eq!(ceil_div(5, 0), 0);
        assert_eq!(ceil_align(5457, 16), 5472);
        assert_eq!(floor_align(5461, 16), 5456);
        assert_eq!(floor_align(7, 0), 7);
        assert_eq!(block_elems(32, 2), 16);
        assert_eq!(block_elems(32, 64), 1);
    }
}
