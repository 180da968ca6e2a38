//! Barrier-block predicates and the barrier id map.
//!
//! Canonical input places every barrier call alone in its block, directly
//! followed by the terminator. Those blocks delimit the sub-CFGs; this
//! module assigns them the stable small integers the dispatcher switches
//! on.

use std::collections::HashMap;

use veld_ir::{BlockId, Function};

/// Id of the implicit barrier at function entry.
pub const ENTRY_BARRIER_ID: u64 = 0;

/// Sentinel id assigned to every exiting block. Stored into the
/// last-barrier slot as the bit pattern `-1`.
pub const EXIT_BARRIER_ID: u64 = u64::MAX;

/// Whether `block` consists of exactly a barrier call plus a terminator.
pub fn has_only_barrier(func: &Function, block: BlockId) -> bool {
    let insts = func.block_insts(block);
    insts.len() == 2 && func.inst(insts[0]).kind.is_barrier() && func.inst(insts[1]).kind.is_terminator()
}

/// Whether the function contains any work-group barrier call.
pub fn has_workgroup_barriers(func: &Function) -> bool {
    func.blocks().any(|b| func.block_insts(b).iter().any(|&i| func.inst(i).kind.is_barrier()))
}

/// Assign an id to every barrier position of the function: the sentinel to
/// each exiting block, [`ENTRY_BARRIER_ID`] to the entry (which is treated
/// as a barrier whether or not it contains one), and fresh positive ids to
/// the remaining barrier-only blocks in layout order.
pub fn barrier_ids(func: &Function, exiting_blocks: &[BlockId]) -> HashMap<BlockId, u64> {
    let mut barriers = HashMap::new();
    for &b in exiting_blocks {
        barriers.insert(b, EXIT_BARRIER_ID);
    }
    barriers.insert(func.entry(), ENTRY_BARRIER_ID);

    let mut next = 1;
    for b in func.block_order() {
        if !barriers.contains_key(&b) && has_only_barrier(func, b) {
            barriers.insert(b, next);
            next += 1;
        }
    }
    barriers
}
