//! Property-based tests for the tiling planner.
//!
//! Covers chunk coverage, core-count monotonicity, alignment of non-final
//! chunks, the copy-out hazard rules, key codec round trips and blob
//! determinism over generated shapes and hardware profiles.

use npuop_common::{DType, HardwareProfile, Layout, SocTag, TensorShapeView, DEFAULT_SYSTEM_WORKSPACE_BYTES};
use npuop_tiling::{
    copy_out_plan, tile, Approximation, CopyOut, DtypeClass, ElementwiseVariant, PlanGeometry,
    QuantInputs, QuantTemplate, ScatterKey, ScatterTemplate, SizeRegime, TilingContext, TilingKey,
};
use proptest::prelude::*;

// ── Strategies ──────────────────────────────────────────────────────────────

fn arb_hardware() -> impl Strategy<Value = HardwareProfile> {
    let ub = prop_oneof![Just(8_192u64), Just(65_536), Just(196_608), Just(262_144)];
    (1u64..=64, ub).prop_map(|(cores, ub)| HardwareProfile::new(SocTag::Ascend910B, cores, ub))
}

fn arb_relu_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![Just(DType::Float16), Just(DType::Float32), Just(DType::Int8), Just(DType::Int64)]
}

fn arb_glu_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![Just(DType::Float16), Just(DType::BFloat16), Just(DType::Float32)]
}

fn arb_key() -> impl Strategy<Value = TilingKey> {
    let regime = prop_oneof![
        Just(SizeRegime::Small),
        Just(SizeRegime::Aligned),
        Just(SizeRegime::AlignedLastAxisBig)
    ];
    let glu = (0usize..3, 0usize..2, regime).prop_map(|(d, a, regime)| TilingKey::GluGrad {
        dtype: DtypeClass::ALL[d],
        approx: Approximation::ALL[a],
        regime,
    });
    let quant = (0usize..5, 0usize..5).prop_map(|(t, i)| TilingKey::GeluQuant {
        template: QuantTemplate::ALL[t],
        inputs: QuantInputs::ALL[i],
    });
    let per_dtype = prop_oneof![
        Just(DType::Float16),
        Just(DType::BFloat16),
        Just(DType::Float32),
        Just(DType::Int8),
        Just(DType::Int32),
        Just(DType::Int64)
    ];
    let layout = prop_oneof![Just(Layout::Nd), Just(Layout::Nz)];
    let elementwise = (proptest::option::of(per_dtype), layout).prop_map(|(dtype, layout)| {
        let variant = dtype.map_or(ElementwiseVariant::Uniform, ElementwiseVariant::PerDtype);
        TilingKey::Elementwise { variant, layout }
    });
    let scatter = proptest::option::of((any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>())).prop_map(
        |flags| match flags {
            None => TilingKey::ScatterAdd(ScatterKey::Empty),
            Some((sorted, simd, wide_addr, scalar_updates)) => TilingKey::ScatterAdd(ScatterKey::Active {
                sorted,
                template: if simd { ScatterTemplate::Simd } else { ScatterTemplate::Simt },
                wide_addr,
                scalar_updates,
            }),
        },
    );
    prop_oneof![glu, quant, elementwise, scatter]
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn relu_ctx(hw: HardwareProfile, dtype: DType, n: u64) -> TilingContext {
    let x = TensorShapeView::new(vec![n], dtype);
    TilingContext::new(hw).with_input(x.clone()).with_output(x)
}

fn glu_ctx(hw: HardwareProfile, dtype: DType, rows: u64, half: u64, approximate: i64) -> TilingContext {
    let dy = TensorShapeView::new(vec![rows, half], dtype);
    let x = TensorShapeView::new(vec![rows, 2 * half], dtype);
    TilingContext::new(hw)
        .with_input(dy.clone())
        .with_input(x.clone())
        .with_input(dy)
        .with_output(x)
        .with_attr("dim", -1i64)
        .with_attr("approximate", approximate)
}

/// Check the pad/unpad rules on every chunk of `g`.
fn assert_copy_out_safe(g: &PlanGeometry) -> Result<(), TestCaseError> {
    let total = g.total_elems();
    for core in 0..g.used_core_num() {
        let core_end = g.core_end_elem(core).unwrap_or(0) * g.elem_bytes;
        for (i, chunk) in g.core_chunks(core).iter().enumerate() {
            let ends_tensor = chunk.elem_offset + chunk.elems == total;
            match copy_out_plan(g, chunk) {
                CopyOut::Direct { bytes } => prop_assert_eq!(bytes % g.align_bytes, 0),
                CopyOut::OverwritePastEnd { aligned_bytes, .. } => prop_assert!(
                    ends_tensor || g.used_core_num() == 1 || chunk.byte_offset(g.elem_bytes) + aligned_bytes <= core_end,
                    "core {} chunk {} pads into its neighbour",
                    core,
                    i
                ),
                CopyOut::MergeThroughScratch { scratch_offset, boundary_bytes, .. } => {
                    prop_assert!(g.tail_merge);
                    prop_assert_eq!(scratch_offset, core * g.scratch_stride_bytes);
                    prop_assert!(boundary_bytes < g.align_bytes);
                }
            }
        }
    }
    Ok(())
}

// ── Property tests ───────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Chunks tile the output exactly once, in order.
    #[test]
    fn relu_chunks_cover_output_once(hw in arb_hardware(), dtype in arb_relu_dtype(), n in 1u64..300_000) {
        let out = tile("relu", &relu_ctx(hw, dtype, n)).unwrap();
        let g = &out.plan.geometry;
        prop_assert!(g.used_core_num() >= 1 && g.used_core_num() <= hw.core_count);
        let mut next = 0;
        for core in 0..g.used_core_num() {
            let chunks = g.core_chunks(core);
            prop_assert!(!chunks.is_empty(), "core {} has no work", core);
            for c in chunks {
                prop_assert_eq!(c.elem_offset, next);
                prop_assert!(c.elems > 0 && c.elems <= g.pass_elems);
                next += c.elems;
            }
        }
        prop_assert_eq!(next, n);
    }

    /// More work never uses fewer cores.
    #[test]
    fn relu_core_count_is_monotone(hw in arb_hardware(), dtype in arb_relu_dtype(), n in 1u64..200_000, extra in 0u64..200_000) {
        let small = tile("relu", &relu_ctx(hw, dtype, n)).unwrap();
        let large = tile("relu", &relu_ctx(hw, dtype, n + extra)).unwrap();
        prop_assert!(small.block_dim <= large.block_dim);
    }

    /// Only the final chunk of a core may have an unaligned footprint.
    #[test]
    fn relu_inner_chunks_are_aligned(hw in arb_hardware(), dtype in arb_relu_dtype(), n in 1u64..300_000) {
        let out = tile("relu", &relu_ctx(hw, dtype, n)).unwrap();
        let g = &out.plan.geometry;
        for core in 0..g.used_core_num() {
            let chunks = g.core_chunks(core);
            for c in chunks.iter().take(chunks.len().saturating_sub(1)) {
                prop_assert_eq!(c.byte_len(g.elem_bytes) % g.align_bytes, 0);
            }
        }
        assert_copy_out_safe(g)?;
    }

    /// Workspace is the system area plus one scratch slot per core when merging.
    #[test]
    fn relu_workspace_matches_merge_state(hw in arb_hardware(), dtype in arb_relu_dtype(), n in 1u64..300_000) {
        let out = tile("relu", &relu_ctx(hw, dtype, n)).unwrap();
        let g = &out.plan.geometry;
        let scratch = if g.tail_merge { g.used_core_num() * g.scratch_stride_bytes } else { 0 };
        prop_assert_eq!(out.workspace_sizes.clone(), vec![DEFAULT_SYSTEM_WORKSPACE_BYTES + scratch]);
        if g.has_unaligned_core_boundary() {
            prop_assert!(g.tail_merge);
        }
    }

    /// Unaligned rows packed into blocks never pad into another core's rows.
    #[test]
    fn glu_copy_out_is_safe(
        hw in arb_hardware(),
        dtype in arb_glu_dtype(),
        rows in 1u64..200,
        half in 1u64..3_000,
        approximate in 0i64..2,
    ) {
        if let Ok(out) = tile("ge_glu_grad_v2", &glu_ctx(hw, dtype, rows, half, approximate)) {
            let g = &out.plan.geometry;
            let covered: u64 = (0..g.used_core_num()).flat_map(|c| g.core_chunks(c)).map(|c| c.elems).sum();
            prop_assert_eq!(covered, rows * half);
            assert_copy_out_safe(g)?;
        }
    }

    /// Encoding then decoding in the key's own space is the identity.
    #[test]
    fn key_wire_round_trip(key in arb_key()) {
        let wire = key.to_wire().unwrap();
        prop_assert_eq!(TilingKey::from_wire(key.space(), wire).unwrap(), key);
    }

    /// Same input, same bytes.
    #[test]
    fn tiling_is_deterministic(hw in arb_hardware(), dtype in arb_glu_dtype(), rows in 1u64..100, half in 1u64..2_000) {
        let ctx = glu_ctx(hw, dtype, rows, half, 1);
        if let Ok(first) = tile("ge_glu_grad_v2", &ctx) {
            let second = tile("ge_glu_grad_v2", &ctx).unwrap();
            prop_assert_eq!(first.blob.as_bytes(), second.blob.as_bytes());
            prop_assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
        }
    }
}
