//! The flattening pass driver.
//!
//! Entry point [`run_on_function`]: decides between the sub-CFG formation
//! (kernels with barriers) and plainly wrapping the body in work-item
//! loops (kernels without), then guarantees verifier-clean output.
//!
//! The sub-CFG route builds, in order: barrier ids, last-barrier storage,
//! the placeholder index, region discovery, cross-region backing slots,
//! region replication, the while/switch dispatcher, unreachable-block
//! cleanup, widening of the remaining allocas, per-region SSA repair, and
//! finally a loop-simplify step that gives the dispatcher loop a dedicated
//! preheader and a single latch.

use std::collections::HashSet;

use snafu::OptionExt;
use veld_ir::dominance::DomTree;
use veld_ir::verify::verify_function;
use veld_ir::{BlockId, Builder, CloneMap, Function, MdTag, Module, SwitchCase, Type, ValueId};

use crate::arrayify::{alloca_elem_ty, widen_alloca};
use crate::barrier::{self, ENTRY_BARRIER_ID, EXIT_BARRIER_ID};
use crate::error::{self, Error, Result};
use crate::kernel_info::{KernelInfo, LOCAL_ID_GLOBAL_NAMES, is_kernel_to_process};
use crate::subcfg::{ContInstReplicaMap, InstAllocaMap, SubCfg};
use crate::uniformity::VariableUniformity;
use crate::wiloops::{create_loops_around, find_load_for_global, get_load_for_global, local_size_values};
use crate::{NUM_ARRAY_ELEMENTS, Outcome, WorkItemHandler};

/// Flatten the named kernel of `module`, computing variable uniformity
/// internally.
pub fn run_on_function(module: &mut Module, name: &str) -> Result<Outcome> {
    let index = module.function_index(name).context(error::NoSuchFunctionSnafu { name })?;
    let info = KernelInfo::from_module(module);
    if !is_kernel_to_process(module, module.function(index)) {
        return Ok(Outcome::Unchanged);
    }
    if info.handler != WorkItemHandler::Cbs {
        return Ok(Outcome::Unchanged);
    }
    let mut vua = VariableUniformity::analyze(module.function(index), &info);
    run(module.function_mut(index), &info, &mut vua)
}

/// [`run_on_function`] with a caller-supplied uniformity oracle.
pub fn run_on_function_with_uniformity(
    module: &mut Module,
    name: &str,
    vua: &mut VariableUniformity,
) -> Result<Outcome> {
    let index = module.function_index(name).context(error::NoSuchFunctionSnafu { name })?;
    let info = KernelInfo::from_module(module);
    if !is_kernel_to_process(module, module.function(index)) {
        return Ok(Outcome::Unchanged);
    }
    if info.handler != WorkItemHandler::Cbs {
        return Ok(Outcome::Unchanged);
    }
    run(module.function_mut(index), &info, vua)
}

fn run(func: &mut Function, info: &KernelInfo, vua: &mut VariableUniformity) -> Result<Outcome> {
    tracing::debug!(function = func.name, "forming sub-CFGs");
    let outcome = if barrier::has_workgroup_barriers(func) {
        form_sub_cfgs(func, info, vua)?
    } else {
        create_loops_around_kernel(func, info)?
    };
    func.flattened = true;
    Ok(outcome)
}

// ---- sub-CFG formation ----------------------------------------------------

fn form_sub_cfgs(func: &mut Function, info: &KernelInfo, vua: &mut VariableUniformity) -> Result<Outcome> {
    let local_sizes = local_size_values(func, info);
    let reqd_array_elements = NUM_ARRAY_ELEMENTS;

    let blocks = func.block_order();
    move_allocas_to_entry(func, &blocks);

    let exiting: Vec<BlockId> = blocks.iter().copied().filter(|&b| func.successors(b).is_empty()).collect();
    if exiting.is_empty() {
        tracing::error!(function = %func, "invalid kernel, no exits");
        return error::NoExitBlockSnafu { function: func.name.clone() }.fail();
    }

    let barrier_ids = barrier::barrier_ids(func, &exiting);

    let entry = func.entry();
    let last_barrier_id_storage =
        Builder::at_start(func, entry).alloca(Type::largest_int(), 1, 8, "LastBarrierId");

    // Placeholder for the contiguous work-item index: a load through an
    // undef pointer, easy to identify and replaced per region. The load of
    // the last local-id global pins its type.
    get_load_for_global(func, info.local_id_globals[info.dim - 1], LOCAL_ID_GLOBAL_NAMES[info.dim - 1]);
    let undef_ptr = func.undef(Type::Ptr);
    let ind_var = Builder::before_terminator(func, entry).load(Type::largest_int(), undef_ptr, "");

    // One region per non-exit barrier, in barrier-id order.
    let mut ordered: Vec<(BlockId, u64)> = barrier_ids.iter().map(|(&b, &id)| (b, id)).collect();
    ordered.sort_by_key(|&(_, id)| id);
    let mut sub_cfgs = Vec::new();
    for (bb, id) in ordered {
        if id == EXIT_BARRIER_ID {
            continue;
        }
        tracing::debug!(block = func.block_name(bb), id, "creating sub-CFG");
        sub_cfgs.push(SubCfg::new(func, bb, &barrier_ids, last_barrier_id_storage, ind_var, info.dim)?);
    }

    let mut inst_alloca_map = InstAllocaMap::new();
    let mut base_inst_allocas = InstAllocaMap::new();
    let mut cont_inst_replicas = ContInstReplicaMap::new();

    let alloca_ip = func.block_insts(entry)[func.first_non_phi_index(entry)];
    for i in 0..sub_cfgs.len() {
        let other_blocks: HashSet<BlockId> = sub_cfgs
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .flat_map(|(_, cfg)| cfg.blocks().iter().copied())
            .collect();
        sub_cfgs[i].arrayify_multi_subcfg_values(
            func,
            &other_blocks,
            &mut inst_alloca_map,
            &mut base_inst_allocas,
            &mut cont_inst_replicas,
            alloca_ip,
            reqd_array_elements,
            vua,
        );
    }

    let mut remapped_inst_allocas = InstAllocaMap::new();
    let after_bb = exiting[0];
    for cfg in &mut sub_cfgs {
        cfg.replicate(
            func,
            info,
            &inst_alloca_map,
            &mut base_inst_allocas,
            &mut cont_inst_replicas,
            &mut remapped_inst_allocas,
            after_bb,
            &local_sizes,
        )?;
    }

    let while_header = generate_while_switch_around(func, after_bb, last_barrier_id_storage, &sub_cfgs)?;

    func.remove_unreachable_blocks();

    let dt = DomTree::compute(func);
    arrayify_allocas_for_subcfgs(func, &dt, &sub_cfgs, reqd_array_elements);

    for cfg in &sub_cfgs {
        cfg.fix_single_subcfg_values(func, &dt, &remapped_inst_allocas, reqd_array_elements);
    }

    func.erase_inst(ind_var);

    // A dedicated preheader and a single latch keep the dispatcher loop
    // from being mistaken for a work-item loop.
    simplify_while_loop(func, while_header);

    if let Err(source) = verify_function(func) {
        tracing::error!(function = %func, "verification failed after sub-CFG formation");
        return Err(Error::VerifierFailed { function: func.name.clone(), source });
    }

    Ok(Outcome::SubCfgsFormed { sub_cfgs: sub_cfgs.len() })
}

/// The while/switch dispatcher: loads the last-completed barrier id and
/// jumps to the region it enters; the exit sentinel leaves the loop.
fn generate_while_switch_around(
    func: &mut Function,
    exit: BlockId,
    last_barrier_id_storage: ValueId,
    sub_cfgs: &[SubCfg],
) -> Result<BlockId> {
    let entry = func.entry();
    let old_entry = func.single_successor(entry).context(error::MalformedKernelSnafu {
        function: func.name.clone(),
        reason: "entry block must end in an unconditional branch".to_owned(),
    })?;

    let while_header = func.create_block_before("cbs.while.header", old_entry);
    let default_bb = create_unreachable_block(func);

    let mut cases: Vec<SwitchCase> =
        sub_cfgs.iter().map(|cfg| SwitchCase { value: cfg.entry_id() as i64, dest: cfg.entry_bb() }).collect();
    cases.push(SwitchCase { value: EXIT_BARRIER_ID as i64, dest: exit });

    {
        let mut bld = Builder::at_end(func, while_header);
        let last_id = bld.load(Type::largest_int(), last_barrier_id_storage, "cbs.while.last_barr.load");
        bld.switch(last_id, default_bb, cases);
    }

    for cfg in sub_cfgs {
        func.replace_phi_uses_with(cfg.entry_bb(), entry, while_header);
        func.replace_successor(cfg.exit_bb(), exit, while_header);
    }

    let entry_id = func.const_int(ENTRY_BARRIER_ID as i64);
    Builder::before_terminator(func, entry).store(entry_id, last_barrier_id_storage);
    func.replace_successor(entry, old_entry, while_header);
    Ok(while_header)
}

fn create_unreachable_block(func: &mut Function) -> BlockId {
    let bb = func.create_block("cbs.while.default");
    Builder::at_end(func, bb).unreachable();
    bb
}

// ---- alloca widening ------------------------------------------------------

/// Widen every remaining entry alloca whose users span several regions;
/// each region addresses it through a GEP by its own contiguous index,
/// placed at the top of the region's load block.
fn arrayify_allocas_for_subcfgs(func: &mut Function, dt: &DomTree, sub_cfgs: &[SubCfg], reqd_array_elements: u64) {
    let region_blocks: HashSet<BlockId> =
        sub_cfgs.iter().flat_map(|cfg| cfg.new_blocks().iter().copied()).collect();

    let entry = func.entry();
    let mut worklist = Vec::new();
    for &inst in func.block_insts(entry) {
        if !func.inst(inst).kind.is_alloca() || func.inst(inst).has_md(MdTag::Arrayified) {
            continue;
        }
        // Anything escaping the regions (dispatcher state, spills used in
        // the entry) stays narrow.
        let escapes = func
            .users_of(inst)
            .iter()
            .any(|&u| func.inst(u).parent().is_some_and(|p| !region_blocks.contains(&p)));
        if escapes {
            continue;
        }
        if !is_alloca_subcfg_internal(func, inst, sub_cfgs) {
            worklist.push(inst);
        }
    }

    for old in worklist {
        let name = func.inst(old).name.clone();
        let wide = widen_alloca(func, old, reqd_array_elements);
        let elem_ty = alloca_elem_ty(func, wide);
        for cfg in sub_cfgs {
            let load_bb = cfg.load_bb();
            let gep = {
                let mut bld = Builder::at(func, load_bb, 0);
                bld.gep(elem_ty.clone(), wide, cfg.cont_idx(), &format!("{name}_gep"))
            };
            func.inst_mut(gep).set_md(MdTag::Arrayified);
            replace_dominated_uses(func, dt, old, gep, load_bb);
        }
        func.erase_inst(old);
    }
}

/// Transitive users of `alloca` along memory and pointer chains.
fn fill_user_hull(func: &Function, alloca: ValueId) -> Vec<ValueId> {
    let mut worklist: Vec<ValueId> = func.users_of(alloca);
    let mut seen: HashSet<ValueId> = HashSet::new();
    let mut hull = Vec::new();
    while let Some(inst) = worklist.pop() {
        if !seen.insert(inst) {
            continue;
        }
        hull.push(inst);
        for user in func.users_of(inst) {
            let touches_memory = matches!(
                func.inst(user).kind,
                veld_ir::InstKind::Load { .. } | veld_ir::InstKind::Store { .. } | veld_ir::InstKind::Call { .. }
            );
            if !seen.contains(&user) && (touches_memory || func.value_ty(user).is_ptr()) {
                worklist.push(user);
            }
        }
    }
    hull
}

/// Whether every region that touches `alloca` contains all of its users.
fn is_alloca_subcfg_internal(func: &Function, alloca: ValueId, sub_cfgs: &[SubCfg]) -> bool {
    let user_blocks: HashSet<BlockId> =
        fill_user_hull(func, alloca).iter().filter_map(|&u| func.inst(u).parent()).collect();

    for cfg in sub_cfgs {
        let region: HashSet<BlockId> = cfg.new_blocks().iter().copied().collect();
        let touches = user_blocks.iter().any(|b| region.contains(b));
        if touches && !user_blocks.iter().all(|b| region.contains(b)) {
            return false;
        }
    }
    true
}

/// Replace uses of `old` with `new` wherever the use site is dominated by
/// `root`; PHI uses count at the end of their incoming block.
fn replace_dominated_uses(func: &mut Function, dt: &DomTree, old: ValueId, new: ValueId, root: BlockId) {
    for user in func.users_of(old) {
        if func.inst(user).kind.is_phi() {
            let kind = &mut func.inst_mut(user).kind;
            for inc in kind.phi_incoming_mut() {
                if inc.value == old && dt.dominates_block(root, inc.block) {
                    inc.value = new;
                }
            }
        } else if func.inst(user).parent().is_some_and(|b| dt.dominates_block(root, b)) {
            func.replace_uses_in_inst(user, old, new);
        }
    }
}

// ---- shared helpers -------------------------------------------------------

/// Allocas outside the entry block are considered broken; hoist them.
fn move_allocas_to_entry(func: &mut Function, blocks: &[BlockId]) {
    let entry = func.entry();
    let mut worklist = Vec::new();
    for &bb in blocks {
        if bb == entry {
            continue;
        }
        for &inst in func.block_insts(bb) {
            if func.inst(inst).kind.is_alloca() {
                worklist.push(inst);
            }
        }
    }
    for inst in worklist {
        let at = func.first_non_phi_index(entry);
        func.move_inst(inst, entry, at);
    }
}

// ---- kernels without barriers ---------------------------------------------

/// No barriers to honor: wrap the whole kernel body in work-item loops.
fn create_loops_around_kernel(func: &mut Function, info: &KernelInfo) -> Result<Outcome> {
    let entry = func.entry();
    let body = func.split_block(entry, 0, "wibody");

    let mut exit_bb = None;
    for bb in func.block_order() {
        if func.successors(bb).is_empty() {
            let term = func.terminator(bb).context(error::MalformedKernelSnafu {
                function: func.name.clone(),
                reason: "exiting block has no terminator".to_owned(),
            })?;
            let at = func.inst_index(term);
            exit_bb = Some(func.split_block(bb, at, "exit"));
            break;
        }
    }
    let Some(exit_bb) = exit_bb else {
        tracing::error!(function = %func, "invalid kernel, no exits");
        return error::NoExitBlockSnafu { function: func.name.clone() }.fail();
    };

    let blocks = func.block_order();
    move_allocas_to_entry(func, &blocks);

    let local_sizes = local_size_values(func, info);

    // Placeholder index, as in the sub-CFG route.
    get_load_for_global(func, info.local_id_globals[info.dim - 1], LOCAL_ID_GLOBAL_NAMES[info.dim - 1]);
    let undef_ptr = func.undef(Type::Ptr);
    let idx = Builder::before_terminator(func, entry).load(Type::largest_int(), undef_ptr, "");

    let mut vmap = CloneMap::default();
    let nest = create_loops_around(func, info, exit_bb, &local_sizes, 0, &mut vmap, body, idx);

    func.replace_successor(entry, body, nest.outermost_header);
    // The snapshot predates the loop blocks, so only original code is
    // remapped; the latch exit edge into `exit_bb` survives.
    func.remap_insts_in_blocks(&blocks, &vmap);

    for d in 0..info.dim {
        if let Some(load) = find_load_for_global(func, info.local_id_globals[d])
            && func.users_of(load).is_empty()
        {
            func.erase_inst(load);
        }
    }
    func.erase_inst(idx);

    if let Err(source) = verify_function(func) {
        tracing::error!(function = %func, "verification failed after wrapping kernel in loops");
        return Err(Error::VerifierFailed { function: func.name.clone(), source });
    }
    Ok(Outcome::WrappedInLoops)
}

// ---- dispatcher loop simplification ---------------------------------------

/// Give the dispatcher loop a dedicated preheader and a single latch, so
/// later loop passes see a canonical loop that is distinct from the
/// work-item loops.
fn simplify_while_loop(func: &mut Function, while_header: BlockId) {
    let entry = func.entry();
    let preds = func.predecessors(while_header);

    let preheader = func.create_block_before(format!("{}.preheader", func.block_name(while_header)), while_header);
    Builder::at_end(func, preheader).br(while_header);
    func.replace_successor(entry, while_header, preheader);

    let latch_preds: Vec<BlockId> = preds.into_iter().filter(|&p| p != entry).collect();
    if latch_preds.len() > 1 {
        let backedge = func.create_block_before(format!("{}.backedge", func.block_name(while_header)), while_header);
        Builder::at_end(func, backedge).br(while_header);
        for p in latch_preds {
            func.replace_successor(p, while_header, backedge);
        }
    }
}
