//! Dominator tree.
//!
//! Iterative dataflow over reverse postorder (the Cooper–Harvey–Kennedy
//! "engineering a simple, fast dominance algorithm" scheme). Functions
//! here are small; simplicity beats the asymptotically better Lengauer–
//! Tarjan construction.

use std::collections::{HashMap, HashSet};

use crate::{BlockId, Function, ValueData, ValueId};

#[derive(Debug)]
pub struct DomTree {
    /// Immediate dominator per block; the entry has none.
    idom: HashMap<BlockId, BlockId>,
    /// Reverse-postorder number per reachable block.
    rpo: HashMap<BlockId, usize>,
    entry: BlockId,
}

impl DomTree {
    /// Compute dominators for all blocks reachable from the entry.
    pub fn compute(func: &Function) -> Self {
        let entry = func.entry();

        // Postorder DFS, then reverse.
        let mut order = Vec::new();
        let mut visited: HashSet<BlockId> = HashSet::new();
        let mut stack = vec![(entry, false)];
        while let Some((b, processed)) = stack.pop() {
            if processed {
                order.push(b);
                continue;
            }
            if !visited.insert(b) {
                continue;
            }
            stack.push((b, true));
            for s in func.successors(b) {
                if !visited.contains(&s) {
                    stack.push((s, false));
                }
            }
        }
        order.reverse();

        let rpo: HashMap<BlockId, usize> = order.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let preds: HashMap<BlockId, Vec<BlockId>> = order
            .iter()
            .map(|&b| {
                let ps: Vec<BlockId> =
                    func.predecessors(b).into_iter().filter(|p| rpo.contains_key(p)).collect();
                (b, ps)
            })
            .collect();

        let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
        idom.insert(entry, entry);

        let intersect = |idom: &HashMap<BlockId, BlockId>, mut a: BlockId, mut b: BlockId| {
            while a != b {
                while rpo[&a] > rpo[&b] {
                    a = idom[&a];
                }
                while rpo[&b] > rpo[&a] {
                    b = idom[&b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &b in order.iter().skip(1) {
                let mut new_idom = None;
                for &p in &preds[&b] {
                    if !idom.contains_key(&p) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, p, cur),
                    });
                }
                let new_idom = new_idom.expect("reachable block without processed predecessor");
                if idom.get(&b) != Some(&new_idom) {
                    idom.insert(b, new_idom);
                    changed = true;
                }
            }
        }

        idom.remove(&entry);
        Self { idom, rpo, entry }
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.rpo.contains_key(&b)
    }

    /// Whether `a` dominates `b`. Reflexive.
    pub fn dominates_block(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            if cur == self.entry {
                return false;
            }
            cur = self.idom[&cur];
        }
    }

    /// Whether the definition of `def` dominates the instruction `user`.
    ///
    /// Non-instruction values (constants, parameters, globals, undef)
    /// dominate everything. For a PHI user this checks the PHI itself, not
    /// its incoming edges; edge-wise tolerance is the caller's business.
    pub fn value_dominates(&self, func: &Function, def: ValueId, user: ValueId) -> bool {
        let def_inst = match func.value(def) {
            ValueData::Inst(inst) => inst,
            _ => return true,
        };
        let Some(def_block) = def_inst.parent() else {
            return false;
        };
        let Some(use_block) = func.inst(user).parent() else {
            return false;
        };
        if def_block == use_block {
            return func.inst_index(def) < func.inst_index(user);
        }
        self.dominates_block(def_block, use_block)
    }

    /// Whether `def` dominates the terminator of `block`. This is the
    /// dominance condition for a PHI incoming value on the edge out of
    /// `block`.
    pub fn dominates_block_terminator(&self, func: &Function, def: ValueId, block: BlockId) -> bool {
        match func.terminator(block) {
            Some(term) => self.value_dominates(func, def, term),
            None => false,
        }
    }
}
