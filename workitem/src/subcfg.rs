//! Barrier-bounded sub-CFGs: discovery, replication, SSA repair.
//!
//! A [`SubCfg`] is the maximal region of the kernel CFG reachable from one
//! barrier without crossing another. Replication clones the region, wraps
//! the clone in work-item loops, routes region exits through stubs that
//! record the next barrier id, and re-links every value that crosses a
//! region boundary through its per-work-item backing slot.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use snafu::OptionExt;
use veld_ir::dominance::DomTree;
use veld_ir::{BlockId, Builder, CloneMap, Function, InstKind, MdTag, ValueId};

use crate::arrayify::{
    arrayify_instruction, is_array_allocation, load_from_alloca, loop_state_alloca_for_load,
};
use crate::barrier;
use crate::error::{self, Result};
use crate::kernel_info::{KernelInfo, LOCAL_ID_GLOBAL_NAMES};
use crate::uniformity::VariableUniformity;
use crate::wiloops::{create_loops_around, get_load_for_global};

/// Cross-region value to backing alloca.
pub type InstAllocaMap = HashMap<ValueId, ValueId>;

/// Contiguous instruction to the instruction tree recomputing it from
/// uniform values and the work-item index. Plumbing for the (disabled)
/// contiguous-value rematerialization; nothing populates it by default.
pub type ContInstReplicaMap = HashMap<ValueId, Vec<ValueId>>;

/// One barrier-bounded region of the kernel.
#[derive(Debug)]
pub struct SubCfg {
    entry_id: u64,
    entry_barrier: BlockId,
    /// Single successor of the entry barrier; the first real block of the
    /// region.
    entry_block: BlockId,
    /// Original blocks of the region, in discovery order. Excludes the
    /// entry barrier and all exit barriers; blocks reachable from several
    /// barriers belong to several regions.
    blocks: Vec<BlockId>,
    /// Cloned blocks plus exit stubs, after replication.
    new_blocks: Vec<BlockId>,
    /// Exit barrier block to its barrier id.
    exit_ids: HashMap<BlockId, u64>,
    last_barrier_id_storage: ValueId,
    /// Contiguous work-item index addressing backing slots inside this
    /// region. The shared placeholder until replication installs the real
    /// index.
    cont_idx: ValueId,
    entry_bb: Option<BlockId>,
    exit_bb: Option<BlockId>,
    load_bb: Option<BlockId>,
    pre_header: Option<BlockId>,
    dim: usize,
}

impl SubCfg {
    /// Discover the region entered at `entry_barrier` by forward DFS up to
    /// the next barrier blocks.
    pub fn new(
        func: &Function,
        entry_barrier: BlockId,
        barrier_ids: &HashMap<BlockId, u64>,
        last_barrier_id_storage: ValueId,
        ind_var: ValueId,
        dim: usize,
    ) -> Result<Self> {
        let entry_id = barrier_ids[&entry_barrier];
        let entry_block = func.single_successor(entry_barrier).context(error::MalformedKernelSnafu {
            function: func.name.clone(),
            reason: format!("barrier block {} has no single successor", func.block_name(entry_barrier)),
        })?;

        let mut blocks = Vec::new();
        let mut exit_ids = HashMap::new();
        let mut worklist = vec![entry_barrier];
        while let Some(bb) = worklist.pop() {
            for succ in func.successors(bb) {
                if blocks.contains(&succ) {
                    continue;
                }
                if !barrier::has_only_barrier(func, succ) {
                    worklist.push(succ);
                    blocks.push(succ);
                } else {
                    let id = *barrier_ids.get(&succ).context(error::MalformedKernelSnafu {
                        function: func.name.clone(),
                        reason: format!("exit barrier block {} not found in map", func.block_name(succ)),
                    })?;
                    debug_assert_ne!(id, barrier::ENTRY_BARRIER_ID);
                    exit_ids.insert(succ, id);
                }
            }
        }

        tracing::debug!(
            entry = entry_id,
            blocks = blocks.len(),
            exits = exit_ids.len(),
            "discovered sub-CFG"
        );

        Ok(Self {
            entry_id,
            entry_barrier,
            entry_block,
            blocks,
            new_blocks: Vec::new(),
            exit_ids,
            last_barrier_id_storage,
            cont_idx: ind_var,
            entry_bb: None,
            exit_bb: None,
            load_bb: None,
            pre_header: None,
            dim,
        })
    }

    pub fn entry_id(&self) -> u64 {
        self.entry_id
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn new_blocks(&self) -> &[BlockId] {
        &self.new_blocks
    }

    /// Region entry after replication: the uniform-load pre-header.
    pub fn entry_bb(&self) -> BlockId {
        self.entry_bb.expect("sub-CFG not replicated yet")
    }

    /// Region exit after replication: the outermost latch.
    pub fn exit_bb(&self) -> BlockId {
        self.exit_bb.expect("sub-CFG not replicated yet")
    }

    pub fn load_bb(&self) -> BlockId {
        self.load_bb.expect("sub-CFG not replicated yet")
    }

    pub fn cont_idx(&self) -> ValueId {
        self.cont_idx
    }

    // ---- cross-region value analysis -------------------------------------

    /// Give every value defined in this region but used in another one a
    /// per-work-item backing slot.
    ///
    /// Reuses existing arrayified storage where the value is itself a
    /// loop-state load or an arrayified GEP; uniform values get a single
    /// slot; everything else a wide alloca with a store right after the
    /// definition.
    pub fn arrayify_multi_subcfg_values(
        &self,
        func: &mut Function,
        other_cfg_blocks: &HashSet<BlockId>,
        inst_alloca_map: &mut InstAllocaMap,
        _base_inst_allocas: &mut InstAllocaMap,
        _cont_inst_replicas: &mut ContInstReplicaMap,
        alloca_ip: ValueId,
        reqd_array_elements: u64,
        vua: &mut VariableUniformity,
    ) {
        for &bb in &self.blocks {
            for inst in func.block_insts(bb).to_vec() {
                if inst == self.cont_idx {
                    continue;
                }
                if inst_alloca_map.contains_key(&inst) {
                    continue;
                }
                let used_elsewhere = func.users_of(inst).iter().any(|&u| {
                    func.inst(u)
                        .parent()
                        .is_some_and(|p| p != bb && other_cfg_blocks.contains(&p))
                });
                if !used_elsewhere {
                    continue;
                }

                // A load from a loop-state alloca: the slot already exists.
                if let Some(alloca) = loop_state_alloca_for_load(func, inst) {
                    inst_alloca_map.insert(inst, alloca);
                    continue;
                }
                // A GEP into an already-widened alloca: reuse its base.
                if let InstKind::Gep { base, .. } = func.inst(inst).kind
                    && func.inst(inst).has_md(MdTag::Arrayified)
                {
                    inst_alloca_map.insert(inst, base);
                    continue;
                }
                // Uniform values share one slot across the group.
                if vua.is_uniform(inst) {
                    tracing::debug!(value = %describe(func, inst), "uniform value, storing to single-slot alloca");
                    let alloca = arrayify_instruction(func, alloca_ip, inst, self.cont_idx, 1);
                    inst_alloca_map.insert(inst, alloca);
                    vua.set_uniform(alloca);
                    continue;
                }

                let alloca = arrayify_instruction(func, alloca_ip, inst, self.cont_idx, reqd_array_elements);
                inst_alloca_map.insert(inst, alloca);
            }
        }
    }

    // ---- replication ------------------------------------------------------

    /// Clone the region, wrap it in work-item loops and wire the clone to
    /// its backing storage.
    #[allow(clippy::too_many_arguments)]
    pub fn replicate(
        &mut self,
        func: &mut Function,
        info: &KernelInfo,
        inst_alloca_map: &InstAllocaMap,
        base_inst_allocas: &mut InstAllocaMap,
        cont_inst_replicas: &mut ContInstReplicaMap,
        remapped_inst_allocas: &mut InstAllocaMap,
        after_bb: BlockId,
        local_sizes: &[ValueId],
    ) -> Result<()> {
        let mut vmap = CloneMap::default();

        // Clone the blocks; route edges into exit barriers through stubs
        // recording the target barrier id.
        for bb in self.blocks.clone() {
            let new_bb = func.clone_block(bb, &format!(".subcfg.{}b", self.entry_id), &mut vmap);
            vmap.map_block(bb, new_bb);
            self.new_blocks.push(new_bb);
            let mut seen = HashSet::new();
            for succ in func.successors(bb) {
                if !seen.insert(succ) {
                    continue;
                }
                if let Some(&exit_id) = self.exit_ids.get(&succ) {
                    let stub = self.create_exit_with_id(func, succ, exit_id, new_bb, after_bb);
                    self.new_blocks.push(stub);
                }
            }
        }

        let load_bb = self.create_load_bb(func, &vmap)?;
        self.load_bb = Some(load_bb);
        vmap.map_block(self.entry_barrier, load_bb);

        let nest =
            create_loops_around(func, info, after_bb, local_sizes, self.entry_id, &mut vmap, load_bb, self.cont_idx);

        let pre_header = self.create_uniform_load_bb(func, nest.outermost_header);
        self.pre_header = Some(pre_header);
        func.replace_phi_uses_with(nest.outermost_header, func.entry(), pre_header);

        add_remapped_map_keys(inst_alloca_map, &vmap, remapped_inst_allocas);
        self.load_multi_subcfg_values(func, inst_alloca_map, pre_header, &mut vmap);
        self.load_uniform_and_recalc_cont_values(func, info, base_inst_allocas, cont_inst_replicas, pre_header, &mut vmap);

        func.remap_insts_in_blocks(&self.new_blocks, &vmap);
        self.remove_dead_phi_blocks(func, &self.new_blocks.clone());

        self.entry_bb = Some(pre_header);
        self.exit_bb = Some(nest.latches[0]);
        self.cont_idx = nest.cont_idx;
        Ok(())
    }

    /// New exiting stub: stores `exit_id` into last-barrier storage and
    /// branches to `target`; `after`'s edge into the barrier is redirected
    /// through it.
    fn create_exit_with_id(
        &self,
        func: &mut Function,
        barrier_block: BlockId,
        exit_id: u64,
        after: BlockId,
        target: BlockId,
    ) -> BlockId {
        tracing::debug!(id = exit_id, at = func.block_name(after), "creating sub-CFG exit");

        let name = format!("{}.subcfg.exit{}b", func.block_name(after), exit_id);
        let exit = func.create_block_before(name, target);
        let id_const = func.const_int(exit_id as i64);
        {
            let mut bld = Builder::at_end(func, exit);
            bld.store(id_const, self.last_barrier_id_storage);
            bld.br(target);
        }
        func.replace_successor(after, barrier_block, exit);
        exit
    }

    /// The region's load pre-header inside the innermost loop body;
    /// branches to the cloned region entry.
    fn create_load_bb(&self, func: &mut Function, vmap: &CloneMap) -> Result<BlockId> {
        let new_entry = vmap.block(self.entry_block).context(error::MalformedKernelSnafu {
            function: func.name.clone(),
            reason: format!(
                "region entry {} was not cloned; the entry barrier must not lead straight to another barrier",
                func.block_name(self.entry_block)
            ),
        })?;
        let load_bb = func.create_block_before(format!("loadblock.subcfg.{}b", self.entry_id), new_entry);
        Builder::at_end(func, load_bb).br(new_entry);
        Ok(load_bb)
    }

    /// Pre-header outside the work-item loops, for group-uniform loads.
    fn create_uniform_load_bb(&self, func: &mut Function, outermost_header: BlockId) -> BlockId {
        let bb = func.create_block_before(format!("uniloadblock.subcfg.{}b", self.entry_id), outermost_header);
        Builder::at_end(func, bb).br(outermost_header);
        bb
    }

    /// Insert loads from backing slots for values defined outside this
    /// region but used inside its clone, recording the loads in `vmap` so
    /// the remap pass picks them up.
    fn load_multi_subcfg_values(
        &self,
        func: &mut Function,
        inst_alloca_map: &InstAllocaMap,
        pre_header: BlockId,
        vmap: &mut CloneMap,
    ) {
        let new_cont_idx = vmap.value(self.cont_idx).expect("loop scaffolding mapped the contiguous index");
        let load_bb = self.load_bb();

        let mut pairs: Vec<(ValueId, ValueId)> = inst_alloca_map.iter().map(|(&k, &v)| (k, v)).collect();
        pairs.sort();
        for (inst, alloca) in pairs {
            let def_block = func.inst(inst).parent();
            if def_block.is_some_and(|b| self.blocks.contains(&b)) {
                continue;
            }
            let used_in_clone = self.new_blocks.iter().any(|&nb| {
                func.block_insts(nb).iter().any(|&u| func.inst(u).kind.operands().contains(&inst))
            });
            if !used_in_clone {
                continue;
            }

            // An arrayified GEP is re-derived from its base with this
            // region's index instead of reloaded.
            if let InstKind::Gep { elem_ty, base, .. } = func.inst(inst).kind.clone()
                && func.inst(inst).has_md(MdTag::Arrayified)
            {
                let name = format!("{}c", describe(func, inst));
                let mut bld = Builder::before_terminator(func, load_bb);
                let new_gep = bld.gep(elem_ty, base, new_cont_idx, &name);
                bld.func().inst_mut(new_gep).set_md(MdTag::Arrayified);
                vmap.map_value(inst, new_gep);
                continue;
            }

            let ip_block = if is_array_allocation(func, alloca) { load_bb } else { pre_header };
            tracing::debug!(
                value = %describe(func, inst),
                into = func.block_name(ip_block),
                "loading cross-region value from its backing slot"
            );
            let term = func.terminator(ip_block).expect("load block has a terminator");
            let at = func.inst_index(term);
            let name = describe(func, inst);
            let load = load_from_alloca(func, alloca, new_cont_idx, (ip_block, at), &name);
            vmap.map_value(inst, load);
        }
    }

    /// Load base-uniform values in the pre-header and clone the recorded
    /// contiguous instruction trees into the load block, remapped to the
    /// uniform loads and the new index.
    ///
    /// Dormant unless the contiguous-value rematerialization fills the two
    /// maps; kept wired so it can be enabled without replumbing.
    fn load_uniform_and_recalc_cont_values(
        &self,
        func: &mut Function,
        info: &KernelInfo,
        base_inst_allocas: &mut InstAllocaMap,
        cont_inst_replicas: &mut ContInstReplicaMap,
        pre_header: BlockId,
        vmap: &mut CloneMap,
    ) {
        let mut uni_vmap = CloneMap::default();
        let new_cont_idx = vmap.value(self.cont_idx).expect("loop scaffolding mapped the contiguous index");
        uni_vmap.map_value(self.cont_idx, new_cont_idx);
        let load_bb = self.load_bb();

        for d in 0..self.dim {
            let load = get_load_for_global(func, info.local_id_globals[d], LOCAL_ID_GLOBAL_NAMES[d]);
            if let Some(mapped) = vmap.value(load) {
                uni_vmap.map_value(load, mapped);
            }
        }

        let mut pairs: Vec<(ValueId, ValueId)> = base_inst_allocas.iter().map(|(&k, &v)| (k, v)).collect();
        pairs.sort();
        for (inst, alloca) in pairs {
            let term = func.terminator(pre_header).expect("pre-header has a terminator");
            let at = func.inst_index(term);
            let name = describe(func, inst);
            tracing::debug!(value = %name, "loading base uniform value in pre-header");
            let load = load_from_alloca(func, alloca, new_cont_idx, (pre_header, at), &name);
            uni_vmap.map_value(inst, load);
        }

        let mut uniquify: BTreeSet<ValueId> = BTreeSet::new();
        for (inst, targets) in cont_inst_replicas.iter() {
            uniquify.insert(*inst);
            uniquify.extend(targets.iter().copied());
        }

        let mut to_remap = Vec::new();
        for inst in topo_sort_instructions(func, &uniquify) {
            if uni_vmap.has_value(inst) {
                continue;
            }
            let clone_data = func.inst(inst).clone();
            let term = func.terminator(load_bb).expect("load block has a terminator");
            let at = func.inst_index(term);
            let clone = func.insert_inst(load_bb, at, clone_data);
            to_remap.push(clone);
            uni_vmap.map_value(inst, clone);
            if !vmap.has_value(inst) {
                vmap.map_value(inst, clone);
            }
        }

        for clone in to_remap {
            func.inst_mut(clone).kind.for_each_operand_mut(|op| {
                if let Some(n) = uni_vmap.value(*op) {
                    *op = n;
                }
            });
        }
    }

    /// Drop PHI incoming entries whose block is no longer an actual
    /// predecessor after cloning.
    fn remove_dead_phi_blocks(&self, func: &mut Function, blocks: &[BlockId]) {
        for &bb in blocks {
            let preds: HashSet<BlockId> = func.predecessors(bb).into_iter().collect();
            for inst in func.block_insts(bb).to_vec() {
                if !func.inst(inst).kind.is_phi() {
                    continue;
                }
                let dead: Vec<BlockId> = func
                    .inst(inst)
                    .kind
                    .phi_incoming()
                    .iter()
                    .map(|inc| inc.block)
                    .filter(|b| !preds.contains(b))
                    .collect();
                for b in dead {
                    tracing::debug!(
                        phi = %describe(func, inst),
                        incoming = func.block_name(b),
                        "removing dead phi incoming block"
                    );
                    func.remove_phi_incoming(inst, b);
                }
            }
        }
    }

    // ---- single-region SSA repair ----------------------------------------

    /// Restore dominance for operands inside the cloned region whose
    /// definitions no longer dominate their uses (loops split across the
    /// region boundary): reload them from backing slots, creating slots on
    /// demand, and merge with PHIs where the using block has several
    /// predecessors.
    pub fn fix_single_subcfg_values(
        &self,
        func: &mut Function,
        dt: &DomTree,
        remapped_inst_allocas: &InstAllocaMap,
        reqd_array_elements: u64,
    ) {
        let entry = func.entry();
        let alloca_ip = func.block_insts(entry)[func.first_non_phi_index(entry)];
        let load_bb = self.load_bb();
        let pre_header = self.pre_header.expect("sub-CFG not replicated yet");

        let mut inst_load_map: HashMap<ValueId, ValueId> = HashMap::new();

        for &bb in &self.new_blocks {
            for inst in func.block_insts(bb).to_vec() {
                for op in func.inst(inst).kind.operands() {
                    if func.try_inst(op).is_none() {
                        continue;
                    }
                    if dt.value_dominates(func, op, inst) {
                        continue;
                    }
                    if func.inst(inst).kind.is_phi() {
                        // Tolerate PHIs whose incoming value dominates the
                        // incoming block's terminator.
                        let found = func.inst(inst).kind.phi_incoming().iter().any(|inc| {
                            inc.value == op && dt.dominates_block_terminator(func, op, inc.block)
                        });
                        if found {
                            continue;
                        }
                    }
                    tracing::debug!(
                        user = %describe(func, inst),
                        operand = %describe(func, op),
                        "operand does not dominate its use"
                    );

                    if let Some(&load) = inst_load_map.get(&op)
                        && dt.value_dominates(func, load, inst)
                    {
                        func.replace_uses_in_inst(inst, op, load);
                        continue;
                    }

                    // An arrayified GEP can be re-derived right here.
                    if let InstKind::Gep { elem_ty, base, .. } = func.inst(op).kind.clone()
                        && func.inst(op).has_md(MdTag::Arrayified)
                    {
                        let name = format!("{}c", describe(func, op));
                        let mut bld = Builder::before_terminator(func, load_bb);
                        let new_gep = bld.gep(elem_ty, base, self.cont_idx, &name);
                        bld.func().inst_mut(new_gep).set_md(MdTag::Arrayified);
                        func.replace_uses_in_inst(inst, op, new_gep);
                        inst_load_map.insert(op, new_gep);
                        continue;
                    }

                    let mut alloca = remapped_inst_allocas.get(&op).copied();
                    if alloca.is_none() {
                        alloca = loop_state_alloca_for_load(func, op);
                    }
                    let alloca = alloca.unwrap_or_else(|| {
                        tracing::debug!(operand = %describe(func, op), "no backing slot yet, widening");
                        arrayify_instruction(func, alloca_ip, op, self.cont_idx, reqd_array_elements)
                    });

                    let ip_block = if is_array_allocation(func, alloca) { load_bb } else { pre_header };
                    let term = func.terminator(ip_block).expect("load block has a terminator");
                    let at = func.inst_index(term);
                    let name = describe(func, op);
                    let load = load_from_alloca(func, alloca, self.cont_idx, (ip_block, at), &name);

                    // A conditionally split loop can give the first block of
                    // the region a second incoming edge; merge with a PHI
                    // then.
                    let preds = func.predecessors(bb);
                    if !func.inst(inst).kind.is_phi() && preds.len() > 1 && preds.contains(&load_bb) {
                        let ty = func.value_ty(load);
                        let phi = {
                            let mut bld = Builder::at(func, bb, 0);
                            bld.phi(ty, &name)
                        };
                        for p in preds {
                            let incoming = if p == load_bb { load } else { op };
                            func.add_phi_incoming(phi, incoming, p);
                        }
                        func.replace_uses_in_inst(inst, op, phi);
                        inst_load_map.insert(op, phi);
                    } else {
                        func.replace_uses_in_inst(inst, op, load);
                        inst_load_map.insert(op, load);
                    }
                }
            }
        }
    }
}

/// Carry `original → alloca` entries over to their clones, keyed by the
/// cloned instruction.
fn add_remapped_map_keys(original: &InstAllocaMap, vmap: &CloneMap, remapped: &mut InstAllocaMap) {
    for (&inst, &alloca) in original {
        if let Some(new_inst) = vmap.value(inst) {
            remapped.insert(new_inst, alloca);
        }
    }
}

/// Order `insts` so that every instruction comes after the instructions it
/// uses. Restricted to edges within the set.
fn topo_sort_instructions(func: &Function, insts: &BTreeSet<ValueId>) -> Vec<ValueId> {
    let mut indegree: BTreeMap<ValueId, usize> = BTreeMap::new();
    for &i in insts {
        let count = func.inst(i).kind.operands().iter().filter(|op| insts.contains(op)).count();
        indegree.insert(i, count);
    }

    let mut ready: Vec<ValueId> = indegree.iter().filter(|&(_, &d)| d == 0).map(|(&i, _)| i).collect();
    let mut out = Vec::with_capacity(insts.len());
    while let Some(i) = ready.pop() {
        out.push(i);
        for &user in insts {
            let uses = func.inst(user).kind.operands().iter().filter(|&&op| op == i).count();
            if uses > 0 {
                let d = indegree.get_mut(&user).expect("user is in the set");
                *d -= uses.min(*d);
                if *d == 0 && !out.contains(&user) && !ready.contains(&user) {
                    ready.push(user);
                }
            }
        }
    }
    debug_assert_eq!(out.len(), insts.len(), "cycle among contiguous instructions");
    out
}

fn describe(func: &Function, v: ValueId) -> String {
    match func.try_inst(v) {
        Some(inst) if !inst.name.is_empty() => inst.name.clone(),
        _ => format!("v{v}"),
    }
}
