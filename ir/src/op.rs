//! Instruction kinds and operand/successor visitors.
//!
//! [`InstKind`] is a tagged variant over the finite set of node kinds the
//! work-group transformations consume. Each variant encodes its operand
//! structure directly, and generic rewriting (use replacement, clone
//! remapping) goes through the visitor methods instead of downcasts.

use smallvec::SmallVec;

use crate::types::Type;
use crate::{BlockId, ValueId};

/// Integer binary operations.
///
/// The work-item index math only needs `Add` and `Mul`; the remaining
/// operations exist for kernel bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Unsigned division, truncating.
    UDiv,
    /// Unsigned remainder.
    URem,
}

/// Integer comparison predicates. Result type is always [`Type::Bool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcmpPred {
    Eq,
    Ne,
    /// Unsigned less-than.
    Ult,
    /// Unsigned less-or-equal.
    Ule,
    /// Signed less-than.
    Slt,
    /// Signed less-or-equal.
    Sle,
}

/// Call target.
///
/// The barrier intrinsic is the only call the transformations inspect, so
/// it gets its own variant rather than a name match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Callee {
    /// Work-group barrier intrinsic.
    Barrier,
    /// Any other function, by symbol name.
    Named(String),
}

/// One incoming edge of a PHI node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhiIncoming {
    pub value: ValueId,
    pub block: BlockId,
}

/// One case of a switch terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchCase {
    /// Case value, compared bit-exactly against the switch operand.
    pub value: i64,
    pub dest: BlockId,
}

/// Metadata tags carried by instructions.
///
/// Tags are identity markers, not debugging hints: the transformations
/// recognize their own allocas and GEPs exclusively through
/// [`MdTag::Arrayified`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdTag {
    /// `pocl.arrayified`: a per-work-item widened alloca, or a GEP derived
    /// from one. Payload is [`crate::LOOP_STATE_MD`].
    Arrayified,
    /// `pocl.loop.workitem` on the `llvm.loop` node of a work-item loop
    /// latch.
    WorkItemLoop,
}

impl MdTag {
    pub fn name(self) -> &'static str {
        match self {
            MdTag::Arrayified => "pocl.arrayified",
            MdTag::WorkItemLoop => "pocl.loop.workitem",
        }
    }
}

/// Instruction operation, with typed operands.
#[derive(Debug, Clone, PartialEq)]
#[derive(strum::AsRefStr)]
pub enum InstKind {
    Binary {
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    Icmp {
        pred: IcmpPred,
        lhs: ValueId,
        rhs: ValueId,
    },
    Phi {
        incoming: SmallVec<[PhiIncoming; 2]>,
    },
    /// Stack slot of `array_size` elements of `elem_ty`.
    ///
    /// `array_size > 1` is an array allocation; per-work-item widened
    /// allocas use this with [`crate::MdTag::Arrayified`] set.
    Alloca {
        elem_ty: Type,
        array_size: u64,
        align: u64,
    },
    Load {
        ptr: ValueId,
    },
    Store {
        value: ValueId,
        ptr: ValueId,
    },
    /// In-bounds element pointer: `base + index * sizeof(elem_ty)`.
    Gep {
        elem_ty: Type,
        base: ValueId,
        index: ValueId,
    },
    Call {
        callee: Callee,
        args: SmallVec<[ValueId; 2]>,
    },
    Br {
        dest: BlockId,
    },
    CondBr {
        cond: ValueId,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Switch {
        value: ValueId,
        default: BlockId,
        cases: Vec<SwitchCase>,
    },
    Ret {
        value: Option<ValueId>,
    },
    Unreachable,
}

impl InstKind {
    /// Whether this instruction terminates a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Switch { .. }
                | InstKind::Ret { .. }
                | InstKind::Unreachable
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    pub fn is_alloca(&self) -> bool {
        matches!(self, InstKind::Alloca { .. })
    }

    /// Whether this is a call to the work-group barrier intrinsic.
    pub fn is_barrier(&self) -> bool {
        matches!(self, InstKind::Call { callee: Callee::Barrier, .. })
    }

    /// All value operands, in a fixed order. PHI incoming values included.
    pub fn operands(&self) -> SmallVec<[ValueId; 4]> {
        let mut out = SmallVec::new();
        self.clone_for_visit(|v| out.push(*v));
        out
    }

    /// Visit every value operand mutably. Used by use-replacement and clone
    /// remapping.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueId)) {
        match self {
            InstKind::Binary { lhs, rhs, .. } | InstKind::Icmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Phi { incoming } => {
                for inc in incoming {
                    f(&mut inc.value);
                }
            }
            InstKind::Alloca { .. } | InstKind::Unreachable => {}
            InstKind::Load { ptr } => f(ptr),
            InstKind::Store { value, ptr } => {
                f(value);
                f(ptr);
            }
            InstKind::Gep { base, index, .. } => {
                f(base);
                f(index);
            }
            InstKind::Call { args, .. } => {
                for a in args {
                    f(a);
                }
            }
            InstKind::Br { .. } => {}
            InstKind::CondBr { cond, .. } => f(cond),
            InstKind::Switch { value, .. } => f(value),
            InstKind::Ret { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
        }
    }

    fn clone_for_visit(&self, mut f: impl FnMut(&ValueId)) {
        // Immutable twin of for_each_operand_mut; kept next to it so the
        // two cannot drift apart silently.
        let mut clone = self.clone();
        clone.for_each_operand_mut(|v| f(v));
    }

    /// Successor blocks of a terminator. Empty for non-terminators and for
    /// `ret`/`unreachable`.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        let mut out = SmallVec::new();
        match self {
            InstKind::Br { dest } => out.push(*dest),
            InstKind::CondBr { then_dest, else_dest, .. } => {
                out.push(*then_dest);
                out.push(*else_dest);
            }
            InstKind::Switch { default, cases, .. } => {
                out.push(*default);
                out.extend(cases.iter().map(|c| c.dest));
            }
            _ => {}
        }
        out
    }

    /// Visit every successor block reference of a terminator mutably.
    pub fn for_each_successor_mut(&mut self, mut f: impl FnMut(&mut BlockId)) {
        match self {
            InstKind::Br { dest } => f(dest),
            InstKind::CondBr { then_dest, else_dest, .. } => {
                f(then_dest);
                f(else_dest);
            }
            InstKind::Switch { default, cases, .. } => {
                f(default);
                for c in cases {
                    f(&mut c.dest);
                }
            }
            _ => {}
        }
    }

    /// Visit every block reference, including PHI incoming blocks.
    ///
    /// This is the visitor clone remapping uses; [`Self::for_each_successor_mut`]
    /// deliberately skips PHI incoming blocks because they are not CFG
    /// edges of the instruction's own block.
    pub fn for_each_block_ref_mut(&mut self, mut f: impl FnMut(&mut BlockId)) {
        if let InstKind::Phi { incoming } = self {
            for inc in incoming {
                f(&mut inc.block);
            }
        } else {
            self.for_each_successor_mut(f);
        }
    }

    /// Replace every successor edge targeting `from` with `to`. Returns the
    /// number of edges rewritten.
    pub fn replace_successor(&mut self, from: BlockId, to: BlockId) -> usize {
        let mut n = 0;
        self.for_each_successor_mut(|d| {
            if *d == from {
                *d = to;
                n += 1;
            }
        });
        n
    }

    /// Incoming edges of a PHI node.
    pub fn phi_incoming(&self) -> &[PhiIncoming] {
        match self {
            InstKind::Phi { incoming } => incoming,
            _ => &[],
        }
    }

    pub fn phi_incoming_mut(&mut self) -> &mut SmallVec<[PhiIncoming; 2]> {
        match self {
            InstKind::Phi { incoming } => incoming,
            _ => panic!("phi_incoming_mut on non-phi instruction"),
        }
    }
}
