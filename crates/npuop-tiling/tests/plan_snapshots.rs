//! Snapshot tests for rendered tiling plans.
//!
//! Pins the human-readable plan of one representative call per family so
//! that changes to chunking or distribution show up in review.

use npuop_common::{DType, HardwareProfile, SocTag, TensorShapeView};
use npuop_tiling::{tile, TilingContext};

fn r95() -> HardwareProfile {
    HardwareProfile::new(SocTag::Ascend910_95, 64, 262_144)
}

#[test]
fn relu_plan_with_short_tail() {
    let x = TensorShapeView::new(vec![65_536 * 10 + 3], DType::Float32);
    let ctx = TilingContext::new(r95()).with_input(x.clone()).with_output(x);
    let out = tile("relu", &ctx).unwrap();
    insta::assert_snapshot!("relu_plan_with_short_tail", out.to_string());
}

#[test]
fn glu_grad_plan_with_packed_rows() {
    let dy = TensorShapeView::new(vec![23, 12, 1024], DType::BFloat16);
    let x = TensorShapeView::new(vec![23, 12, 2048], DType::BFloat16);
    let ctx = TilingContext::new(HardwareProfile::new(SocTag::Ascend910B, 48, 196_608))
        .with_input(dy.clone())
        .with_input(x.clone())
        .with_input(dy)
        .with_output(x)
        .with_attr("approximate", 1i64);
    let out = tile("ge_glu_grad_v2", &ctx).unwrap();
    insta::assert_snapshot!("glu_grad_plan_with_packed_rows", out.to_string());
}

#[test]
fn scatter_add_plan_one_row_per_core() {
    let var = TensorShapeView::new(vec![1000, 1024], DType::Float32);
    let ctx = TilingContext::new(r95())
        .with_input(var.clone())
        .with_input(TensorShapeView::new(vec![64], DType::Int32))
        .with_input(TensorShapeView::new(vec![64, 1024], DType::Float32))
        .with_output(var);
    let out = tile("scatter_add", &ctx).unwrap();
    insta::assert_snapshot!("scatter_add_plan_one_row_per_core", out.to_string());
}
