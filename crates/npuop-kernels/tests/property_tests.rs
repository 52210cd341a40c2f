//! Property tests: a launch reproduces the scalar reference for generated
//! shapes, hardware profiles and core orders.

use npuop_common::{DType, HardwareProfile, SocTag};
use npuop_kernels::activations::relu;
use npuop_kernels::{launch_output, CoreOrder, DeviceIo, HostTensor, KernelLibrary};
use npuop_tiling::{tile, TilingContext};
use proptest::prelude::*;

fn arb_hardware() -> impl Strategy<Value = HardwareProfile> {
    let ub = prop_oneof![Just(8_192u64), Just(65_536), Just(196_608)];
    (1u64..=16, ub).prop_map(|(cores, ub)| HardwareProfile::new(SocTag::Ascend910B, cores, ub))
}

fn arb_order() -> impl Strategy<Value = CoreOrder> {
    prop_oneof![Just(CoreOrder::Forward), Just(CoreOrder::Reverse), Just(CoreOrder::Parallel)]
}

fn arb_float() -> impl Strategy<Value = DType> {
    prop_oneof![Just(DType::Float16), Just(DType::BFloat16), Just(DType::Float32)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn relu_launch_is_exact(
        hw in arb_hardware(),
        dtype in arb_float(),
        order in arb_order(),
        n in 1u64..20_000,
        seed in any::<u32>(),
    ) {
        let values: Vec<f32> = (0..n).map(|i| ((i as u32).wrapping_mul(2_654_435_761) ^ seed) as f32 / u32::MAX as f32 - 0.5).collect();
        let x = HostTensor::from_f32(vec![n], dtype, &values).unwrap();
        let ctx = TilingContext::new(hw).with_input(x.view()).with_output(x.view());
        let plan = tile("relu", &ctx).unwrap();

        let io = DeviceIo::with_inputs(&[&x], &[HostTensor::zeros(vec![n], dtype)], hw.align_bytes);
        let report = launch_output(&KernelLibrary::builtin().unwrap(), "relu", &plan, &io, order).unwrap();
        prop_assert_eq!(report.active_cores() as u64, plan.block_dim);

        let want: Vec<f32> = x.to_f32().unwrap().into_iter().map(relu).collect();
        prop_assert_eq!(io.into_outputs().remove(0).to_f32().unwrap(), want);
    }

    #[test]
    fn geglu_launch_writes_every_output_element(
        hw in arb_hardware(),
        order in arb_order(),
        rows in 1u64..40,
        half in 1u64..600,
    ) {
        // Non-zero inputs everywhere, so a skipped element stays at zero.
        let ones = |n: u64| vec![1.0f32; n as usize];
        let dy = HostTensor::from_f32(vec![rows, half], DType::Float32, &ones(rows * half)).unwrap();
        let x = HostTensor::from_f32(vec![rows, 2 * half], DType::Float32, &ones(rows * 2 * half)).unwrap();
        let gelu = dy.clone();
        let ctx = TilingContext::new(hw)
            .with_input(dy.view())
            .with_input(x.view())
            .with_input(gelu.view())
            .with_output(x.view())
            .with_attr("approximate", 1i64);
        if let Ok(plan) = tile("ge_glu_grad_v2", &ctx) {
            let io = DeviceIo::with_inputs(&[&dy, &x, &gelu], &[HostTensor::zeros(vec![rows, 2 * half], DType::Float32)], hw.align_bytes);
            launch_output(&KernelLibrary::builtin().unwrap(), "ge_glu_grad_v2", &plan, &io, order).unwrap();
            let dx = io.into_outputs().remove(0).to_f32().unwrap();
            prop_assert!(dx.iter().all(|&v| v != 0.0));
        }
    }
}
