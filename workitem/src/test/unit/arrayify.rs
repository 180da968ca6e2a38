//! Unit tests for the widening helpers.

use std::collections::HashSet;

use veld_ir::dominance::DomTree;
use veld_ir::interp::{ExecEnv, execute};
use veld_ir::{Builder, Function, InstKind, MdTag, Type};

use crate::arrayify::{
    arrayify_allocas_in_entry, arrayify_instruction, is_array_allocation, load_from_alloca,
    loop_state_alloca_for_load, widen_alloca,
};
use crate::{DEFAULT_ALIGNMENT, NUM_ARRAY_ELEMENTS};

#[test]
fn arrayify_then_load_round_trips() {
    // Store a value to slot 3 of a wide alloca and read it back into the
    // output buffer.
    let mut f = Function::new("k");
    let out = f.add_param(Type::Ptr);
    let entry = f.create_block("entry");
    let zero = f.const_int(0);
    let three = f.const_int(3);
    let seven = f.const_int(7);

    let value;
    {
        let mut bld = Builder::at_end(&mut f, entry);
        value = bld.add(seven, zero, "value");
        bld.ret();
    }
    let alloca = arrayify_instruction(&mut f, value, value, three, 16);
    assert!(f.inst(alloca).has_md(MdTag::Arrayified));
    assert!(is_array_allocation(&f, alloca));
    let InstKind::Alloca { align, .. } = f.inst(alloca).kind else { unreachable!() };
    assert_eq!(align, DEFAULT_ALIGNMENT);

    // Read the slot back just before the return.
    let term = f.terminator(entry).unwrap();
    let at = f.inst_index(term);
    let load = load_from_alloca(&mut f, alloca, three, (entry, at), "value");
    let gep = {
        let mut bld = Builder::before_terminator(&mut f, entry);
        bld.gep(Type::Int64, out, zero, "out.gep")
    };
    Builder::before_terminator(&mut f, entry).store(load, gep);

    veld_ir::verify::verify_function(&f).unwrap();
    let mut env = ExecEnv::new().with_buffer(vec![0]);
    execute(&f, &mut env).unwrap();
    assert_eq!(env.buffers[0], vec![7]);
}

#[test]
fn single_slot_allocas_skip_the_gep() {
    let mut f = Function::new("k");
    let entry = f.create_block("entry");
    let one = f.const_int(1);
    let value;
    {
        let mut bld = Builder::at_end(&mut f, entry);
        value = bld.add(one, one, "value");
        bld.ret();
    }
    let alloca = arrayify_instruction(&mut f, value, value, one, 1);
    assert!(!is_array_allocation(&f, alloca));
    // The store targets the alloca directly.
    let store = f
        .block_insts(entry)
        .iter()
        .copied()
        .find(|&v| matches!(f.inst(v).kind, InstKind::Store { .. }))
        .unwrap();
    let InstKind::Store { ptr, .. } = f.inst(store).kind else { unreachable!() };
    assert_eq!(ptr, alloca);
}

#[test]
fn loop_state_lookup_sees_through_geps() {
    let mut f = Function::new("k");
    let entry = f.create_block("entry");
    let idx = f.const_int(2);
    let (alloca, plain, direct_load, gep_load, plain_load);
    {
        let mut bld = Builder::at_end(&mut f, entry);
        alloca = bld.alloca(Type::Int64, 8, 64, "state");
        plain = bld.alloca(Type::Int64, 8, 64, "not_state");
        let gep = bld.gep(Type::Int64, alloca, idx, "state.gep");
        gep_load = bld.load(Type::Int64, gep, "via.gep");
        direct_load = bld.load(Type::Int64, alloca, "direct");
        plain_load = bld.load(Type::Int64, plain, "plain");
        bld.ret();
    }
    f.inst_mut(alloca).set_md(MdTag::Arrayified);

    assert_eq!(loop_state_alloca_for_load(&f, gep_load), Some(alloca));
    assert_eq!(loop_state_alloca_for_load(&f, direct_load), Some(alloca));
    assert_eq!(loop_state_alloca_for_load(&f, plain_load), None);
}

#[test]
fn widen_alloca_nests_existing_arrays() {
    let mut f = Function::new("k");
    let entry = f.create_block("entry");
    let old;
    {
        let mut bld = Builder::at_end(&mut f, entry);
        old = bld.alloca(Type::Int64, 4, 8, "buf");
        bld.ret();
    }
    let wide = widen_alloca(&mut f, old, NUM_ARRAY_ELEMENTS);
    let InstKind::Alloca { elem_ty, array_size, .. } = &f.inst(wide).kind else { unreachable!() };
    assert_eq!(*array_size, NUM_ARRAY_ELEMENTS);
    assert_eq!(*elem_ty, Type::Int64.array_of(4));
    assert!(f.inst(wide).has_md(MdTag::Arrayified));
}

#[test]
fn entry_allocas_used_only_in_loop_blocks_are_widened() {
    // entry: alloca; body: store/load through it; exit.
    let mut f = Function::new("k");
    let out = f.add_param(Type::Ptr);
    let entry = f.create_block("entry");
    let body = f.create_block("body");
    let exit = f.create_block("exit");
    let zero = f.const_int(0);
    let five = f.const_int(5);

    let a;
    {
        let mut bld = Builder::at_end(&mut f, entry);
        a = bld.alloca(Type::Int64, 1, 8, "a");
        bld.br(body);
    }
    {
        let mut bld = Builder::at_end(&mut f, body);
        bld.store(five, a);
        let x = bld.load(Type::Int64, a, "x");
        let gep = bld.gep(Type::Int64, out, zero, "out.gep");
        bld.store(x, gep);
        bld.br(exit);
    }
    Builder::at_end(&mut f, exit).ret();

    let dt = DomTree::compute(&f);
    let loop_blocks: HashSet<_> = [body].into_iter().collect();
    let idx = f.const_int(3);
    arrayify_allocas_in_entry(&mut f, entry, &loop_blocks, idx, &dt);

    // The original alloca is gone; a tagged wide alloca and a tagged GEP
    // replace it.
    assert!(f.inst(a).parent().is_none());
    let wide = f
        .block_insts(entry)
        .iter()
        .copied()
        .find(|&v| f.inst(v).kind.is_alloca())
        .expect("wide alloca in entry");
    assert!(f.inst(wide).has_md(MdTag::Arrayified));
    assert!(is_array_allocation(&f, wide));

    veld_ir::verify::verify_function(&f).unwrap();
    let mut env = ExecEnv::new().with_buffer(vec![0]);
    execute(&f, &mut env).unwrap();
    assert_eq!(env.buffers[0], vec![5]);
}
