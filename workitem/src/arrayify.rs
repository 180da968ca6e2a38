//! Per-work-item widening of values and allocas.
//!
//! A value that must survive a barrier gets a backing alloca with one slot
//! per work-item, addressed by the contiguous work-item index of the
//! enclosing sub-CFG. Widened allocas and the GEPs derived from them carry
//! the arrayified metadata tag; the tag is how later phases recognize
//! their own storage, names play no part in it.

use std::collections::HashSet;

use veld_ir::dominance::DomTree;
use veld_ir::{BlockId, Builder, Function, InstKind, MdTag, Type, ValueData, ValueId};

use crate::{DEFAULT_ALIGNMENT, NUM_ARRAY_ELEMENTS};

/// Display-ish name of a value for derived storage names.
fn value_name(func: &Function, v: ValueId) -> String {
    match func.value(v) {
        ValueData::Inst(inst) if !inst.name.is_empty() => inst.name.clone(),
        _ => format!("v{v}"),
    }
}

/// Emit a backing alloca of `num_elements` slots of `value`'s type before
/// `alloca_ip`, and a store of `value` into slot `idx` before the
/// `insertion_point` instruction. Single-slot allocas skip the GEP.
///
/// Both positions are instruction anchors, so inserting the alloca cannot
/// shift the store's position even when the two share a block.
///
/// Returns the alloca.
pub fn arrayify_value(
    func: &mut Function,
    alloca_ip: ValueId,
    value: ValueId,
    insertion_point: ValueId,
    idx: ValueId,
    num_elements: u64,
) -> ValueId {
    let name = value_name(func, value);
    let ty = func.value_ty(value);

    let align = if num_elements > 1 { DEFAULT_ALIGNMENT } else { 8 };
    let mut bld = Builder::before(func, alloca_ip);
    let alloca = bld.alloca(ty.clone(), num_elements, align, &format!("{name}_alloca"));
    func.inst_mut(alloca).set_md(MdTag::Arrayified);

    let mut bld = Builder::before(func, insertion_point);
    let target = if num_elements != 1 {
        let gep = bld.gep(ty, alloca, idx, &format!("{name}_gep"));
        bld.func().inst_mut(gep).set_md(MdTag::Arrayified);
        gep
    } else {
        alloca
    };
    bld.store(value, target);
    alloca
}

/// [`arrayify_value`] with the store placed immediately after `inst` (after
/// the PHI group when `inst` is a PHI).
pub fn arrayify_instruction(
    func: &mut Function,
    alloca_ip: ValueId,
    inst: ValueId,
    idx: ValueId,
    num_elements: u64,
) -> ValueId {
    let block = func.inst(inst).parent().expect("cannot arrayify a detached instruction");
    let at = if func.inst(inst).kind.is_phi() {
        func.first_non_phi_index(block)
    } else {
        func.inst_index(inst) + 1
    };
    let insertion_point = func.block_insts(block)[at];
    arrayify_value(func, alloca_ip, inst, insertion_point, idx, num_elements)
}

/// Load slot `idx` of `alloca` at `insertion_point`. Array allocas go
/// through an in-bounds GEP tagged arrayified; single-slot allocas load
/// directly.
pub fn load_from_alloca(
    func: &mut Function,
    alloca: ValueId,
    idx: ValueId,
    insertion_point: (BlockId, usize),
    name_prefix: &str,
) -> ValueId {
    let InstKind::Alloca { elem_ty, array_size, .. } = func.inst(alloca).kind.clone() else {
        panic!("load_from_alloca target is not an alloca");
    };
    let (block, at) = insertion_point;
    let mut bld = Builder::at(func, block, at);
    let from = if array_size > 1 {
        let gep = bld.gep(elem_ty.clone(), alloca, idx, &format!("{name_prefix}_lgep"));
        bld.func().inst_mut(gep).set_md(MdTag::Arrayified);
        gep
    } else {
        alloca
    };
    bld.load(elem_ty, from, &format!("{name_prefix}_load"))
}

/// If `load` reads (directly or through a GEP) from an arrayified alloca,
/// return that alloca.
pub fn loop_state_alloca_for_load(func: &Function, load: ValueId) -> Option<ValueId> {
    let InstKind::Load { ptr } = func.inst(load).kind else {
        return None;
    };
    let candidate = match func.try_inst(ptr).map(|i| &i.kind) {
        Some(InstKind::Gep { base, .. }) => *base,
        _ => ptr,
    };
    let inst = func.try_inst(candidate)?;
    (inst.kind.is_alloca() && inst.has_md(MdTag::Arrayified)).then_some(candidate)
}

/// Widen every entry-block alloca whose users all live inside `loop_blocks`
/// and redirect those users through a per-work-item GEP by `idx`.
///
/// Used when a barrier-free kernel body is wrapped in work-item loops:
/// private variables of the original work-item become per-iteration slots.
pub fn arrayify_allocas_in_entry(
    func: &mut Function,
    entry: BlockId,
    loop_blocks: &HashSet<BlockId>,
    idx: ValueId,
    dt: &DomTree,
) {
    let mut worklist = Vec::new();
    for &inst in func.block_insts(entry) {
        if !func.inst(inst).kind.is_alloca() || func.inst(inst).has_md(MdTag::Arrayified) {
            continue;
        }
        let all_in_loop = func
            .users_of(inst)
            .iter()
            .all(|&u| func.inst(u).parent().is_some_and(|b| loop_blocks.contains(&b)));
        if all_in_loop {
            worklist.push(inst);
        }
    }

    for old in worklist {
        // Place the GEP at the user dominating all the others, so every
        // redirected use still sees its pointer.
        let mut gep_ip = None;
        for u in func.users_of(old) {
            gep_ip = match gep_ip {
                None => Some(u),
                Some(g) if dt.value_dominates(func, u, g) => Some(u),
                keep => keep,
            };
        }
        let Some(gep_ip) = gep_ip else {
            continue;
        };

        let wide = widen_alloca(func, old, NUM_ARRAY_ELEMENTS);
        let elem_ty = alloca_elem_ty(func, wide);
        let name = value_name(func, old);
        let mut bld = Builder::before(func, gep_ip);
        let gep = bld.gep(elem_ty, wide, idx, &format!("{name}_gep"));
        bld.func().inst_mut(gep).set_md(MdTag::Arrayified);
        func.replace_all_uses_with(old, gep);
        func.erase_inst(old);
    }
}

pub fn alloca_elem_ty(func: &Function, alloca: ValueId) -> Type {
    match &func.inst(alloca).kind {
        InstKind::Alloca { elem_ty, .. } => elem_ty.clone(),
        _ => panic!("not an alloca"),
    }
}

pub fn is_array_allocation(func: &Function, alloca: ValueId) -> bool {
    matches!(func.inst(alloca).kind, InstKind::Alloca { array_size, .. } if array_size > 1)
}

/// Replace `old` with a widened twin of `num_elements` slots, preserving an
/// existing array-of-`k` shape by nesting it. Does not touch users.
pub fn widen_alloca(func: &mut Function, old: ValueId, num_elements: u64) -> ValueId {
    let InstKind::Alloca { elem_ty, array_size, .. } = func.inst(old).kind.clone() else {
        panic!("widen_alloca target is not an alloca");
    };
    let elem_ty = if array_size > 1 {
        tracing::warn!(alloca = value_name(func, old), size = array_size, "alloca was an array; nesting its shape");
        elem_ty.array_of(array_size)
    } else {
        elem_ty
    };
    let name = value_name(func, old);
    let mut bld = Builder::before(func, old);
    let wide = bld.alloca(elem_ty, num_elements, DEFAULT_ALIGNMENT, &format!("{name}_alloca"));
    func.inst_mut(wide).set_md(MdTag::Arrayified);
    wide
}
