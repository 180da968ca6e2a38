//! Unit tests for sub-CFG discovery.

use veld_ir::{Builder, Type};

use crate::barrier::{self, ENTRY_BARRIER_ID, EXIT_BARRIER_ID};
use crate::kernel_info::KernelInfo;
use crate::subcfg::SubCfg;
use crate::test::helpers::*;

#[test]
fn discovery_splits_at_barriers() {
    let mut m = test_module([4, 1, 1]);
    let info = KernelInfo::from_module(&mut m);
    let mut f = kernel_s2(&info);

    let exiting: Vec<_> = f.block_order().into_iter().filter(|&b| f.successors(b).is_empty()).collect();
    let ids = barrier::barrier_ids(&f, &exiting);
    assert_eq!(ids.len(), 3); // entry, bar, retb

    let entry = f.entry();
    let storage = Builder::at_start(&mut f, entry).alloca(Type::largest_int(), 1, 8, "LastBarrierId");
    let undef = f.undef(Type::Ptr);
    let pseudo = Builder::before_terminator(&mut f, entry).load(Type::largest_int(), undef, "");

    let entry_region = SubCfg::new(&f, entry, &ids, storage, pseudo, 1).unwrap();
    assert_eq!(entry_region.entry_id(), ENTRY_BARRIER_ID);
    assert_eq!(entry_region.blocks().len(), 1); // body
    assert_eq!(entry_region.new_blocks().len(), 0);

    let bar = f.block_order().into_iter().find(|&b| barrier::has_only_barrier(&f, b)).unwrap();
    let barrier_region = SubCfg::new(&f, bar, &ids, storage, pseudo, 1).unwrap();
    assert_eq!(barrier_region.entry_id(), 1);
    assert_eq!(barrier_region.blocks().len(), 1); // post
}

#[test]
fn blocks_reachable_from_two_barriers_belong_to_both_regions() {
    // The s3 loop: header/body/fin are reachable both from the entry and
    // from the intermediate barrier without crossing another barrier.
    let mut m = test_module([4, 1, 1]);
    let info = KernelInfo::from_module(&mut m);
    let mut f = kernel_s3(&info);

    let exiting: Vec<_> = f.block_order().into_iter().filter(|&b| f.successors(b).is_empty()).collect();
    let ids = barrier::barrier_ids(&f, &exiting);

    let entry = f.entry();
    let storage = Builder::at_start(&mut f, entry).alloca(Type::largest_int(), 1, 8, "LastBarrierId");
    let undef = f.undef(Type::Ptr);
    let pseudo = Builder::before_terminator(&mut f, entry).load(Type::largest_int(), undef, "");

    let entry_region = SubCfg::new(&f, entry, &ids, storage, pseudo, 1).unwrap();
    let bar = f
        .block_order()
        .into_iter()
        .find(|&b| barrier::has_only_barrier(&f, b) && ids[&b] != EXIT_BARRIER_ID)
        .unwrap();
    let barrier_region = SubCfg::new(&f, bar, &ids, storage, pseudo, 1).unwrap();

    // header, body, fin for the entry; latch, header, body, fin for the
    // barrier region.
    assert_eq!(entry_region.blocks().len(), 3);
    assert_eq!(barrier_region.blocks().len(), 4);
    for b in entry_region.blocks() {
        assert!(barrier_region.blocks().contains(b));
    }
}
