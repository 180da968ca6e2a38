//! Variable uniformity analysis.
//!
//! A value is *uniform* when every work-item of the group observes the same
//! value. Uniform values that cross a barrier only need a single backing
//! slot instead of one per work-item.
//!
//! The analysis is a forward dataflow over the function: constants,
//! parameters and loads of the `_local_size_*` globals seed the uniform
//! set; pure instructions stay uniform when all operands are. Everything
//! with divergent sources (local-id loads, PHIs, memory reads, calls) is
//! conservatively varying.

use std::collections::HashSet;

use veld_ir::{Function, InstKind, ValueData, ValueId};

use crate::kernel_info::KernelInfo;

#[derive(Debug, Default)]
pub struct VariableUniformity {
    uniform: HashSet<ValueId>,
}

impl VariableUniformity {
    /// Analysis that reports every instruction as varying. Forces the wide
    /// lowering everywhere.
    pub fn pessimistic() -> Self {
        Self::default()
    }

    pub fn analyze(func: &Function, info: &KernelInfo) -> Self {
        let mut uniform: HashSet<ValueId> = HashSet::new();

        // Iterate to a fixed point; block layout order converges in one or
        // two rounds for the acyclic majority of kernels.
        let mut changed = true;
        while changed {
            changed = false;
            for block in func.block_order() {
                for &inst in func.block_insts(block) {
                    if uniform.contains(&inst) {
                        continue;
                    }
                    if Self::inst_is_uniform(func, info, &uniform, inst) {
                        uniform.insert(inst);
                        changed = true;
                    }
                }
            }
        }

        tracing::trace!(function = func.name, uniform = uniform.len(), "uniformity analysis done");
        Self { uniform }
    }

    fn inst_is_uniform(func: &Function, info: &KernelInfo, uniform: &HashSet<ValueId>, inst: ValueId) -> bool {
        let value_uniform = |v: ValueId| match func.value(v) {
            ValueData::Const { .. } | ValueData::Param { .. } | ValueData::Global { .. } => true,
            ValueData::Undef { .. } => false,
            ValueData::Inst(_) => uniform.contains(&v),
        };

        match &func.inst(inst).kind {
            InstKind::Binary { lhs, rhs, .. } | InstKind::Icmp { lhs, rhs, .. } => {
                value_uniform(*lhs) && value_uniform(*rhs)
            }
            InstKind::Gep { base, index, .. } => value_uniform(*base) && value_uniform(*index),
            InstKind::Load { ptr } => {
                // The group size is the same for every work-item; nothing
                // else loaded from memory is.
                match func.value(*ptr) {
                    ValueData::Global { global, .. } => info.local_size_globals.contains(global),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// External predicate: is `value` the same for every work-item?
    pub fn is_uniform(&self, value: ValueId) -> bool {
        self.uniform.contains(&value)
    }

    /// Record a pass-created value (typically a single-slot alloca) as
    /// uniform.
    pub fn set_uniform(&mut self, value: ValueId) {
        self.uniform.insert(value);
    }
}
