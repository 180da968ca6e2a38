//! Structural verification.
//!
//! The work-group transformations promise verifier-clean output as their
//! sole post-condition, so this is the oracle the passes and their tests
//! run against: block shape, live operands, PHI/predecessor agreement and
//! SSA dominance.

use std::collections::HashSet;

use snafu::ensure;

use crate::dominance::DomTree;
use crate::error::{self, Result};
use crate::{Function, InstKind, ValueData, ValueId};

/// Check `func` for structural validity.
///
/// Verified properties:
/// 1. every live block is non-empty and ends with its only terminator;
/// 2. PHIs form a prefix of their block;
/// 3. every operand refers to an attached value, every branch target to a
///    live block;
/// 4. each PHI's incoming blocks are exactly its CFG predecessors;
/// 5. switch case values are distinct;
/// 6. the entry block has no predecessors;
/// 7. every definition dominates its uses (PHI uses checked per incoming
///    edge).
pub fn verify_function(func: &Function) -> Result<()> {
    ensure!(func.blocks().next().is_some(), error::EmptyFunctionSnafu { function: func.name.clone() });
    let entry = func.entry();
    ensure!(
        func.predecessors(entry).is_empty(),
        error::EntryHasPredecessorsSnafu { block: func.block_name(entry).to_owned() }
    );

    for block in func.blocks() {
        let block_name = func.block_name(block).to_owned();
        let insts = func.block_insts(block);
        ensure!(!insts.is_empty(), error::EmptyBlockSnafu { block: block_name.clone() });

        let mut seen_non_phi = false;
        for (i, &inst) in insts.iter().enumerate() {
            let data = func.inst(inst);
            let last = i + 1 == insts.len();
            if data.kind.is_terminator() {
                ensure!(
                    last,
                    error::TerminatorInBlockBodySnafu { block: block_name.clone(), inst: describe(func, inst) }
                );
            } else if last {
                return error::MissingTerminatorSnafu { block: block_name.clone() }.fail();
            }
            if data.kind.is_phi() {
                ensure!(
                    !seen_non_phi,
                    error::PhiNotAtBlockStartSnafu { block: block_name.clone(), inst: describe(func, inst) }
                );
            } else {
                seen_non_phi = true;
            }

            for op in data.kind.operands() {
                if let ValueData::Inst(op_inst) = func.value(op) {
                    ensure!(
                        op_inst.parent().is_some_and(|b| !func.block_is_removed(b)),
                        error::DetachedOperandSnafu {
                            block: block_name.clone(),
                            inst: describe(func, inst),
                            operand: describe(func, op),
                        }
                    );
                }
            }
            for target in data.kind.successors() {
                ensure!(
                    !func.block_is_removed(target),
                    error::DeadBranchTargetSnafu {
                        block: block_name.clone(),
                        target: func.block_name(target).to_owned(),
                    }
                );
            }
            if let InstKind::Switch { cases, .. } = &data.kind {
                let mut seen = HashSet::new();
                for case in cases {
                    ensure!(
                        seen.insert(case.value),
                        error::DuplicateSwitchCaseSnafu { block: block_name.clone(), value: case.value }
                    );
                }
            }
        }
    }

    verify_phis(func)?;
    verify_dominance(func)
}

fn verify_phis(func: &Function) -> Result<()> {
    for block in func.blocks() {
        let mut preds: Vec<_> = func.predecessors(block);
        preds.sort();
        for &inst in func.block_insts(block) {
            let data = func.inst(inst);
            if !data.kind.is_phi() {
                break;
            }
            let mut incoming: Vec<_> = data.kind.phi_incoming().iter().map(|inc| inc.block).collect();
            incoming.sort();
            if incoming != preds {
                let names = |blocks: &[crate::BlockId]| {
                    blocks.iter().map(|&b| func.block_name(b).to_owned()).collect::<Vec<_>>()
                };
                return error::PhiIncomingMismatchSnafu {
                    block: func.block_name(block).to_owned(),
                    inst: describe(func, inst),
                    incoming: names(&incoming),
                    preds: names(&preds),
                }
                .fail();
            }
        }
    }
    Ok(())
}

fn verify_dominance(func: &Function) -> Result<()> {
    let dt = DomTree::compute(func);
    for block in func.blocks() {
        if !dt.is_reachable(block) {
            // Dominance is undefined in unreachable code; the passes run
            // unreachable-block cleanup before verification anyway.
            continue;
        }
        for &inst in func.block_insts(block) {
            let data = func.inst(inst);
            if data.kind.is_phi() {
                for inc in data.kind.phi_incoming() {
                    ensure!(
                        dt.dominates_block_terminator(func, inc.value, inc.block),
                        error::DefDoesNotDominateUseSnafu {
                            block: func.block_name(block).to_owned(),
                            inst: describe(func, inst),
                            operand: describe(func, inc.value),
                        }
                    );
                }
            } else {
                for op in data.kind.operands() {
                    ensure!(
                        dt.value_dominates(func, op, inst),
                        error::DefDoesNotDominateUseSnafu {
                            block: func.block_name(block).to_owned(),
                            inst: describe(func, inst),
                            operand: describe(func, op),
                        }
                    );
                }
            }
        }
    }
    Ok(())
}

fn describe(func: &Function, v: ValueId) -> String {
    match func.value(v) {
        ValueData::Inst(inst) if !inst.name.is_empty() => format!("%{} (v{v})", inst.name),
        ValueData::Inst(inst) => {
            let kind: &str = inst.kind.as_ref();
            format!("{kind} (v{v})")
        }
        other => format!("{other:?}"),
    }
}
