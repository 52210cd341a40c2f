//! Property tests for broadcasting and alignment arithmetic.

use npuop_common::math::{ceil_align, ceil_div, floor_align};
use npuop_common::{broadcast_shape, normalize_axis};
use proptest::prelude::*;

fn small_shape() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..6, 0..5)
}

proptest! {
    #[test]
    fn broadcast_is_commutative(a in small_shape(), b in small_shape()) {
        let ab = broadcast_shape("p", &a, &b);
        let ba = broadcast_shape("p", &b, &a);
        prop_assert_eq!(ab.is_ok(), ba.is_ok());
        if let (Ok(ab), Ok(ba)) = (ab, ba) {
            prop_assert_eq!(ab, ba);
        }
    }

    #[test]
    fn broadcast_with_self_is_identity(a in small_shape()) {
        prop_assert_eq!(broadcast_shape("p", &a, &a).unwrap(), a);
    }

    #[test]
    fn broadcast_with_ones_is_identity(a in small_shape()) {
        let ones = vec![1u64; a.len()];
        prop_assert_eq!(broadcast_shape("p", &a, &ones).unwrap(), a);
    }

    #[test]
    fn alignment_brackets_value(value in 0u64..1_000_000, shift in 0u32..8) {
        let align = 1u64 << shift;
        let up = ceil_align(value, align);
        let down = floor_align(value, align);
        prop_assert!(down <= value && value <= up);
        prop_assert_eq!(up % align, 0);
        prop_assert_eq!(down % align, 0);
        prop_assert!(up - down == 0 || up - down == align);
    }

    #[test]
    fn ceil_div_is_tight(a in 0u64..1_000_000, b in 1u64..10_000) {
        let q = ceil_div(a, b);
        prop_assert!(q * b >= a);
        prop_assert!(q == 0 || (q - 1) * b < a);
    }

    #[test]
    fn negative_axes_resolve(rank in 1usize..8, back in 1i64..8) {
        let resolved = normalize_axis(-back, rank);
        if back as usize <= rank {
            prop_assert_eq!(resolved, Some(rank - back as usize));
        } else {
            prop_assert_eq!(resolved, None);
        }
    }
}
