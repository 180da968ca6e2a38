//! Structural surgery tests: splitting, cloning, remapping, unreachable
//! cleanup.

use crate::types::Type;
use crate::{Builder, CloneMap, Function, InstKind};

fn two_block_function() -> (Function, crate::BlockId, crate::BlockId) {
    let mut f = Function::new("f");
    let out = f.add_param(Type::Ptr);
    let entry = f.create_block("entry");
    let exit = f.create_block("exit");
    let zero = f.const_int(0);
    let one = f.const_int(1);
    let mut bld = Builder::at_end(&mut f, entry);
    let x = bld.add(zero, one, "x");
    let gep = bld.gep(Type::Int64, out, zero, "gep");
    bld.store(x, gep);
    bld.br(exit);
    Builder::at_end(&mut f, exit).ret();
    (f, entry, exit)
}

#[test]
fn split_block_moves_tail_and_branches() {
    let (mut f, entry, _) = two_block_function();
    // Split before the store: [add, gep] stay, [store, br] move.
    let new = f.split_block(entry, 2, "tail");
    assert_eq!(f.block_insts(entry).len(), 3); // add, gep, br
    assert_eq!(f.block_insts(new).len(), 2);
    assert_eq!(f.single_successor(entry), Some(new));
    crate::verify::verify_function(&f).unwrap();
}

#[test]
fn split_block_updates_successor_phis() {
    let mut f = Function::new("f");
    let entry = f.create_block("entry");
    let join = f.create_block("join");
    let seven = f.const_int(7);
    let mut bld = Builder::at_end(&mut f, entry);
    let x = bld.add(seven, seven, "x");
    bld.br(join);
    let mut bld = Builder::at_end(&mut f, join);
    let phi = bld.phi(Type::Int64, "p");
    bld.ret();
    f.add_phi_incoming(phi, x, entry);

    let new = f.split_block(entry, 1, "tail");
    let incoming = f.inst(phi).kind.phi_incoming().to_vec();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].block, new);
    crate::verify::verify_function(&f).unwrap();
}

#[test]
fn clone_block_then_remap_rewrites_operands() {
    let (mut f, entry, exit) = two_block_function();
    let mut map = CloneMap::default();
    let clone = f.clone_block(entry, ".copy", &mut map);
    map.map_block(entry, clone);

    // Before remapping, the clone still references original values.
    let orig_insts = f.block_insts(entry).to_vec();
    let clone_insts = f.block_insts(clone).to_vec();
    assert_eq!(orig_insts.len(), clone_insts.len());
    assert_eq!(f.inst(clone_insts[2]).kind.operands(), f.inst(orig_insts[2]).kind.operands());

    f.remap_insts_in_blocks(&[clone], &map);
    // Now the cloned store uses the cloned add/gep.
    let ops = f.inst(clone_insts[2]).kind.operands();
    assert_eq!(ops[0], map.value(orig_insts[0]).unwrap());
    assert_eq!(ops[1], map.value(orig_insts[1]).unwrap());
    // Branch target was left alone (exit not in the map).
    assert_eq!(f.single_successor(clone), Some(exit));
}

#[test]
fn replace_all_uses_rewrites_every_user() {
    let (mut f, entry, _) = two_block_function();
    let insts = f.block_insts(entry).to_vec();
    let x = insts[0];
    let y = f.const_int(42);
    f.replace_all_uses_with(x, y);
    assert!(f.users_of(x).is_empty());
    let store_ops = f.inst(insts[2]).kind.operands();
    assert_eq!(store_ops[0], y);
}

#[test]
fn remove_unreachable_blocks_fixes_phis() {
    let mut f = Function::new("f");
    let entry = f.create_block("entry");
    let dead = f.create_block("dead");
    let join = f.create_block("join");
    let one = f.const_int(1);
    let two = f.const_int(2);
    Builder::at_end(&mut f, entry).br(join);
    Builder::at_end(&mut f, dead).br(join);
    let mut bld = Builder::at_end(&mut f, join);
    let phi = bld.phi(Type::Int64, "p");
    bld.ret();
    f.add_phi_incoming(phi, one, entry);
    f.add_phi_incoming(phi, two, dead);

    assert_eq!(f.remove_unreachable_blocks(), 1);
    assert!(f.block_is_removed(dead));
    assert_eq!(f.inst(phi).kind.phi_incoming().len(), 1);
    crate::verify::verify_function(&f).unwrap();
}

#[test]
fn move_inst_rehomes_allocas() {
    let mut f = Function::new("f");
    let entry = f.create_block("entry");
    let body = f.create_block("body");
    Builder::at_end(&mut f, entry).br(body);
    let mut bld = Builder::at_end(&mut f, body);
    let a = bld.alloca(Type::Int64, 1, 8, "a");
    bld.ret();

    f.move_inst(a, entry, 0);
    assert_eq!(f.inst(a).parent(), Some(entry));
    assert!(matches!(f.inst(f.block_insts(entry)[0]).kind, InstKind::Alloca { .. }));
    crate::verify::verify_function(&f).unwrap();
}

#[test]
fn predecessors_counts_each_block_once() {
    let mut f = Function::new("f");
    let entry = f.create_block("entry");
    let next = f.create_block("next");
    let t = f.const_bool(true);
    Builder::at_end(&mut f, entry).cond_br(t, next, next);
    Builder::at_end(&mut f, next).ret();
    assert_eq!(f.predecessors(next), vec![entry]);
}
