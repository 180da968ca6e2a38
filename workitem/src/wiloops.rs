//! Work-item loop scaffolding.
//!
//! Builds the `Dim`-nested loops that iterate a block of code once per
//! work-item, and the contiguous linear index
//! `((id_x * size_y) + id_y) * size_z + id_z` that addresses per-work-item
//! backing storage. Loops are built innermost-first around a given header
//! block; outer latches are rewired afterwards so the nest exits through
//! the outermost latch only.

use smallvec::SmallVec;
use veld_ir::{BlockId, Builder, CloneMap, Function, GlobalId, IcmpPred, InstKind, MdTag, Type, ValueData, ValueId};

use crate::kernel_info::{KernelInfo, LOCAL_ID_GLOBAL_NAMES, LOCAL_SIZE_GLOBAL_NAMES};

pub const DIM_NAME: [char; 3] = ['x', 'y', 'z'];

/// Result of [`create_loops_around`].
pub struct LoopNest {
    /// Latch blocks, outermost first. The outermost latch is the only exit
    /// of the nest; the innermost latch carries the work-item loop tag.
    pub latches: SmallVec<[BlockId; 3]>,
    /// Outermost header; the block to branch to to start the nest.
    pub outermost_header: BlockId,
    /// Contiguous work-item index valid inside the nest.
    pub cont_idx: ValueId,
}

/// Find the load of `global` anywhere in `func`, without creating one.
pub fn find_load_for_global(func: &Function, global: GlobalId) -> Option<ValueId> {
    for b in func.blocks() {
        for &v in func.block_insts(b) {
            if let InstKind::Load { ptr } = func.inst(v).kind
                && let ValueData::Global { global: g, .. } = func.value(ptr)
                && *g == global
            {
                return Some(v);
            }
        }
    }
    None
}

/// The load of `global` inside `func`, created before the entry terminator
/// when the function does not load it yet.
pub fn get_load_for_global(func: &mut Function, global: GlobalId, name: &str) -> ValueId {
    if let Some(v) = find_load_for_global(func, global) {
        return v;
    }
    let gv = func.global_value(global, name);
    let entry = func.entry();
    Builder::before_terminator(func, entry).load(Type::largest_int(), gv, name)
}

/// Per-dimension local-size values for the loop bounds: compile-time
/// constants, or loads of the `_local_size_*` globals when sizes are
/// dynamic.
pub fn local_size_values(func: &mut Function, info: &KernelInfo) -> SmallVec<[ValueId; 3]> {
    let mut out = SmallVec::new();
    for d in 0..info.dim {
        if info.dynamic_local_size {
            out.push(get_load_for_global(func, info.local_size_globals[d], LOCAL_SIZE_GLOBAL_NAMES[d]));
        } else {
            out.push(func.const_int(info.local_sizes[d] as i64));
        }
    }
    out
}

/// Build work-item loops around `last_header` (the load block of a sub-CFG
/// or the body of a barrier-free kernel), innermost dimension first, using
/// `after_bb` as the provisional exit edge of every latch.
///
/// On return:
/// - outer latches have been rewired so only the outermost one exits;
/// - `vmap` maps `after_bb` to the innermost latch (cloned exits re-enter
///   the nest), each `_local_id_*` load to its induction variable, and
///   `cont_idx` to the new contiguous index;
/// - the innermost latch terminator carries [`MdTag::WorkItemLoop`].
pub fn create_loops_around(
    func: &mut Function,
    info: &KernelInfo,
    after_bb: BlockId,
    local_sizes: &[ValueId],
    entry_id: u64,
    vmap: &mut CloneMap,
    last_header: BlockId,
    cont_idx: ValueId,
) -> LoopNest {
    let dim = local_sizes.len();
    let entry = func.entry();
    let zero = func.const_int(0);
    let one = func.const_int(1);

    // Innermost to outermost: wrap a fresh header/latch pair around the
    // previous level.
    let mut ind_vars: SmallVec<[ValueId; 3]> = SmallVec::new();
    let mut latches: SmallVec<[BlockId; 3]> = SmallVec::new();
    let mut last_header = last_header;
    for d in (0..dim).rev() {
        let suffix = format!("{}.subcfg.{}", DIM_NAME[d], entry_id);

        let header = func.create_block_before(format!("header.{suffix}b"), last_header);
        let ind_var;
        {
            let mut bld = Builder::at_end(func, header);
            ind_var = bld.phi(Type::largest_int(), &format!("indvar.{suffix}"));
            bld.br(last_header);
        }
        func.add_phi_incoming(ind_var, zero, entry);
        ind_vars.push(ind_var);

        let latch = func.create_block(format!("latch.{suffix}b"));
        {
            let mut bld = Builder::at_end(func, latch);
            let inc = bld.add(ind_var, one, &format!("addInd.{suffix}"));
            let cond = bld.icmp(IcmpPred::Ult, inc, local_sizes[d], &format!("exit.cond.{suffix}"));
            bld.cond_br(cond, header, after_bb);
            bld.func().add_phi_incoming(ind_var, inc, latch);
        }
        latches.push(latch);
        last_header = header;
    }

    latches.reverse();
    ind_vars.reverse();

    // Exit inner levels into the next-outer latch instead of after_bb, and
    // hang inner initial values off the enclosing header.
    for d in 1..dim {
        func.replace_successor(latches[d], after_bb, latches[d - 1]);
        let outer_header = func.inst(ind_vars[d - 1]).parent().expect("induction variable is attached");
        let inner = ind_vars[d];
        if let InstKind::Phi { incoming } = &mut func.inst_mut(inner).kind {
            for inc in incoming {
                if inc.block == entry {
                    inc.block = outer_header;
                }
            }
        }
    }

    let innermost_latch = latches[dim - 1];
    let term = func.terminator(innermost_latch).expect("latch has a terminator");
    func.inst_mut(term).set_md(MdTag::WorkItemLoop);
    vmap.map_block(after_bb, innermost_latch);

    // Contiguous index, computed in the innermost header right after its
    // induction variable.
    let mut idx = ind_vars[0];
    if dim > 1 {
        let innermost_header = func.inst(ind_vars[dim - 1]).parent().expect("induction variable is attached");
        let mut bld = Builder::at(func, innermost_header, 1);
        for d in 1..dim {
            let suffix = format!("{}.subcfg.{}", DIM_NAME[d], entry_id);
            idx = bld.mul(idx, local_sizes[d], &format!("idx.mul.{suffix}"));
            idx = bld.add(ind_vars[d], idx, &format!("idx.add.{suffix}"));
        }
    }

    for d in 0..dim {
        let load = get_load_for_global(func, info.local_id_globals[d], LOCAL_ID_GLOBAL_NAMES[d]);
        vmap.map_value(load, ind_vars[d]);
    }

    vmap.map_value(cont_idx, idx);
    LoopNest { latches, outermost_header: last_header, cont_idx: idx }
}
