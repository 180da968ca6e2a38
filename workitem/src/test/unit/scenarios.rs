//! End-to-end scenarios: transform a canonical kernel, verify it, execute
//! it once, and compare the output buffer against the work-group
//! semantics of the original.

use proptest::prelude::*;
use test_case::test_case;
use veld_ir::verify::verify_function;
use veld_ir::{InstKind, MdTag, Module};

use crate::test::helpers::*;
use crate::{KernelInfo, Outcome, VariableUniformity, run_on_function, run_on_function_with_uniformity};

fn transform(module: &mut Module, name: &str) -> Outcome {
    let outcome = run_on_function(module, name).expect("flattening succeeds");
    let func = module.function(module.function_index(name).unwrap());
    verify_function(func).unwrap_or_else(|e| panic!("verifier rejected {name}: {e}\n{func}"));
    outcome
}

#[test_case(1)]
#[test_case(4)]
#[test_case(7)]
fn s1_no_barriers_writes_ids(size: u64) {
    let mut m = test_module([size, 1, 1]);
    let info = KernelInfo::from_module(&mut m);
    add_kernel(&mut m, kernel_s1(&info));

    assert_eq!(transform(&mut m, "s1"), Outcome::WrappedInLoops);
    let out = run_kernel(&m, "s1", &[size as usize]);
    let expected: Vec<i64> = (0..size as i64).collect();
    assert_eq!(out[0], expected);
}

#[test]
fn s2_value_crosses_one_barrier() {
    let mut m = test_module([8, 1, 1]);
    let info = KernelInfo::from_module(&mut m);
    add_kernel(&mut m, kernel_s2(&info));

    assert_eq!(transform(&mut m, "s2"), Outcome::SubCfgsFormed { sub_cfgs: 2 });
    let out = run_kernel(&m, "s2", &[8]);
    assert_eq!(out[0], vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn s2_single_work_item_matches_plain_invocation() {
    // With a (1,1,1) group the flattened kernel is a single invocation.
    let mut m = test_module([1, 1, 1]);
    let info = KernelInfo::from_module(&mut m);
    add_kernel(&mut m, kernel_s2(&info));

    transform(&mut m, "s2");
    let out = run_kernel(&m, "s2", &[1]);
    assert_eq!(out[0], vec![1]);
}

#[test]
fn s3_loop_across_barrier() {
    let mut m = test_module([4, 1, 1]);
    let info = KernelInfo::from_module(&mut m);
    add_kernel(&mut m, kernel_s3(&info));

    assert_eq!(transform(&mut m, "s3"), Outcome::SubCfgsFormed { sub_cfgs: 2 });
    let out = run_kernel(&m, "s3", &[4]);
    assert_eq!(out[0], vec![0, 3, 6, 9]);
}

#[test]
fn s4_two_dimensional_conditional() {
    let mut m = test_module([3, 3, 1]);
    let info = KernelInfo::from_module(&mut m);
    add_kernel(&mut m, kernel_s4(&info));

    assert_eq!(transform(&mut m, "s4"), Outcome::WrappedInLoops);
    let out = run_kernel(&m, "s4", &[9]);
    // out[y*3+x] is 1 where x < y, 2 on and below the diagonal.
    assert_eq!(out[0], vec![2, 2, 2, 1, 2, 2, 1, 1, 2]);
}

#[test]
fn s5_uniform_value_uses_single_slot() {
    let mut m = test_module([2, 2, 2]);
    let info = KernelInfo::from_module(&mut m);
    add_kernel(&mut m, kernel_s5(&info));

    transform(&mut m, "s5");
    let out = run_kernel(&m, "s5", &[8]);
    assert_eq!(out[0], vec![4; 8]);

    // The uniform value's backing storage is a tagged single-slot alloca.
    let func = m.function(m.function_index("s5").unwrap());
    let single_slot = func.blocks().flat_map(|b| func.block_insts(b).to_vec()).any(|v| {
        matches!(func.inst(v).kind, InstKind::Alloca { array_size: 1, .. }) && func.inst(v).has_md(MdTag::Arrayified)
    });
    assert!(single_slot, "expected a single-slot arrayified alloca:\n{func}");
}

#[test]
fn s5_wide_lowering_is_equivalent() {
    // Forcing every value through the wide lowering must not change the
    // output.
    let mut m = test_module([2, 2, 2]);
    let info = KernelInfo::from_module(&mut m);
    add_kernel(&mut m, kernel_s5(&info));
    let mut vua = VariableUniformity::pessimistic();
    run_on_function_with_uniformity(&mut m, "s5", &mut vua).unwrap();
    let func = m.function(m.function_index("s5").unwrap());
    verify_function(func).unwrap();

    let out = run_kernel(&m, "s5", &[8]);
    assert_eq!(out[0], vec![4; 8]);
}

#[test]
fn s6_multiple_exits_dispatch_correctly() {
    for (flag, expected) in [(0, 1i64), (1, 2i64)] {
        let mut m = test_module([4, 1, 1]);
        let info = KernelInfo::from_module(&mut m);
        add_kernel(&mut m, kernel_s6(&info));
        assert_eq!(transform(&mut m, "s6"), Outcome::SubCfgsFormed { sub_cfgs: 3 });

        let out = run_kernel_with_buffers(&m, "s6", vec![vec![0; 4], vec![flag]]);
        assert_eq!(out[0], vec![expected; 4], "flag = {flag}");
    }
}

#[test]
fn flattening_is_idempotent() {
    let mut m = test_module([4, 1, 1]);
    let info = KernelInfo::from_module(&mut m);
    add_kernel(&mut m, kernel_s2(&info));

    assert_eq!(transform(&mut m, "s2"), Outcome::SubCfgsFormed { sub_cfgs: 2 });
    // A flattened function is no longer a kernel to process.
    assert_eq!(run_on_function(&mut m, "s2").unwrap(), Outcome::Unchanged);
}

#[test]
fn non_kernels_and_other_handlers_are_skipped() {
    let mut m = test_module([4, 1, 1]);
    let info = KernelInfo::from_module(&mut m);
    // Present in the module but not registered as a kernel.
    m.add_function(kernel_s2(&info));
    assert_eq!(run_on_function(&mut m, "s2").unwrap(), Outcome::Unchanged);

    let mut m = test_module([4, 1, 1]);
    m.set_bool_metadata("WGCbsHandler", false);
    let info = KernelInfo::from_module(&mut m);
    add_kernel(&mut m, kernel_s2(&info));
    assert_eq!(run_on_function(&mut m, "s2").unwrap(), Outcome::Unchanged);
}

#[test]
fn dynamic_local_sizes_load_bounds_from_globals() {
    let mut m = test_module([6, 1, 1]);
    m.set_bool_metadata("WGDynamicLocalSize", true);
    let info = KernelInfo::from_module(&mut m);
    assert!(info.dynamic_local_size);
    add_kernel(&mut m, kernel_s2(&info));

    transform(&mut m, "s2");
    // The runner seeds the _local_size_* globals from the metadata.
    let out = run_kernel(&m, "s2", &[6]);
    assert_eq!(out[0], vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn dispatcher_has_one_switch_with_a_case_per_region() {
    let mut m = test_module([2, 1, 1]);
    let info = KernelInfo::from_module(&mut m);
    add_kernel(&mut m, kernel_s3(&info));
    transform(&mut m, "s3");

    let func = m.function(m.function_index("s3").unwrap());
    let switches: Vec<_> = func
        .blocks()
        .flat_map(|b| func.block_insts(b).to_vec())
        .filter(|&v| matches!(func.inst(v).kind, InstKind::Switch { .. }))
        .collect();
    assert_eq!(switches.len(), 1, "{func}");
    let InstKind::Switch { cases, .. } = &func.inst(switches[0]).kind else {
        unreachable!();
    };
    // Two regions plus the exit sentinel.
    assert_eq!(cases.len(), 3);
    assert!(cases.iter().any(|c| c.value == -1));

    // Work-item loop latches carry the loop tag.
    let tagged = func
        .blocks()
        .flat_map(|b| func.block_insts(b).to_vec())
        .filter(|&v| func.inst(v).has_md(MdTag::WorkItemLoop))
        .count();
    assert_eq!(tagged, 2, "one tagged latch per region:\n{func}");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn work_group_sweep_one_barrier(size in 1u64..=16) {
        let mut m = test_module([size, 1, 1]);
        let info = KernelInfo::from_module(&mut m);
        add_kernel(&mut m, kernel_s2(&info));
        run_on_function(&mut m, "s2").unwrap();
        let func = m.function(m.function_index("s2").unwrap());
        verify_function(func).unwrap();

        let out = run_kernel(&m, "s2", &[size as usize]);
        let expected: Vec<i64> = (1..=size as i64).collect();
        prop_assert_eq!(&out[0], &expected);
    }

    #[test]
    fn work_group_sweep_three_dims(x in 1u64..=3, y in 1u64..=3, z in 1u64..=2) {
        let mut m = test_module([x, y, z]);
        let info = KernelInfo::from_module(&mut m);
        add_kernel(&mut m, kernel_s5(&info));
        run_on_function(&mut m, "s5").unwrap();
        let func = m.function(m.function_index("s5").unwrap());
        verify_function(func).unwrap();

        let n = (x * y * z) as usize;
        let out = run_kernel(&m, "s5", &[n]);
        prop_assert_eq!(&out[0], &vec![2 * x as i64; n]);
    }
}
