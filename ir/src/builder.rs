//! Positioned instruction emission.
//!
//! [`Builder`] owns a mutable borrow of a [`Function`] plus an insertion
//! cursor; every `emit` inserts at the cursor and advances it, so a
//! sequence of calls lays instructions down in source order.

use smallvec::SmallVec;

use crate::op::{BinaryOp, Callee, IcmpPred, InstKind, SwitchCase};
use crate::types::Type;
use crate::{BlockId, Function, Inst, ValueId};

pub struct Builder<'f> {
    func: &'f mut Function,
    block: BlockId,
    at: usize,
}

impl<'f> Builder<'f> {
    /// Position at the end of `block` (after any existing instructions).
    pub fn at_end(func: &'f mut Function, block: BlockId) -> Self {
        let at = func.block_insts(block).len();
        Self { func, block, at }
    }

    /// Position at an explicit instruction index within `block`.
    pub fn at(func: &'f mut Function, block: BlockId, at: usize) -> Self {
        debug_assert!(at <= func.block_insts(block).len());
        Self { func, block, at }
    }

    /// Position at the first insertion point of `block`: after its PHIs.
    pub fn at_start(func: &'f mut Function, block: BlockId) -> Self {
        let at = func.first_non_phi_index(block);
        Self { func, block, at }
    }

    /// Position immediately before the block terminator.
    pub fn before_terminator(func: &'f mut Function, block: BlockId) -> Self {
        let term = func.terminator(block).expect("block has no terminator");
        let at = func.inst_index(term);
        Self { func, block, at }
    }

    /// Position immediately before an existing instruction.
    pub fn before(func: &'f mut Function, inst: ValueId) -> Self {
        let block = func.inst(inst).parent().expect("instruction is detached");
        let at = func.inst_index(inst);
        Self { func, block, at }
    }

    /// Position immediately after an existing instruction.
    pub fn after(func: &'f mut Function, inst: ValueId) -> Self {
        let block = func.inst(inst).parent().expect("instruction is detached");
        let at = func.inst_index(inst) + 1;
        Self { func, block, at }
    }

    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    fn emit(&mut self, kind: InstKind, ty: Type, name: &str) -> ValueId {
        let id = self.func.insert_inst(self.block, self.at, Inst::new(kind, ty, name));
        self.at += 1;
        id
    }

    // ---- arithmetic ------------------------------------------------------

    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId, name: &str) -> ValueId {
        let ty = self.func.value_ty(lhs);
        debug_assert_eq!(ty, self.func.value_ty(rhs), "binary operand type mismatch");
        self.emit(InstKind::Binary { op, lhs, rhs }, ty, name)
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId, name: &str) -> ValueId {
        self.binary(BinaryOp::Add, lhs, rhs, name)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId, name: &str) -> ValueId {
        self.binary(BinaryOp::Mul, lhs, rhs, name)
    }

    pub fn icmp(&mut self, pred: IcmpPred, lhs: ValueId, rhs: ValueId, name: &str) -> ValueId {
        self.emit(InstKind::Icmp { pred, lhs, rhs }, Type::Bool, name)
    }

    // ---- memory ----------------------------------------------------------

    pub fn alloca(&mut self, elem_ty: Type, array_size: u64, align: u64, name: &str) -> ValueId {
        self.emit(InstKind::Alloca { elem_ty, array_size, align }, Type::Ptr, name)
    }

    pub fn load(&mut self, ty: Type, ptr: ValueId, name: &str) -> ValueId {
        self.emit(InstKind::Load { ptr }, ty, name)
    }

    pub fn store(&mut self, value: ValueId, ptr: ValueId) -> ValueId {
        self.emit(InstKind::Store { value, ptr }, Type::Void, "")
    }

    /// In-bounds GEP: `base + index * sizeof(elem_ty)`.
    pub fn gep(&mut self, elem_ty: Type, base: ValueId, index: ValueId, name: &str) -> ValueId {
        self.emit(InstKind::Gep { elem_ty, base, index }, Type::Ptr, name)
    }

    // ---- SSA -------------------------------------------------------------

    /// Empty PHI; add edges with [`Function::add_phi_incoming`].
    pub fn phi(&mut self, ty: Type, name: &str) -> ValueId {
        self.emit(InstKind::Phi { incoming: SmallVec::new() }, ty, name)
    }

    // ---- calls -----------------------------------------------------------

    pub fn call_barrier(&mut self) -> ValueId {
        self.emit(InstKind::Call { callee: Callee::Barrier, args: SmallVec::new() }, Type::Void, "")
    }

    pub fn call_named(&mut self, name: &str, args: &[ValueId], ty: Type, result_name: &str) -> ValueId {
        let kind = InstKind::Call { callee: Callee::Named(name.to_owned()), args: SmallVec::from_slice(args) };
        self.emit(kind, ty, result_name)
    }

    // ---- terminators -----------------------------------------------------

    pub fn br(&mut self, dest: BlockId) -> ValueId {
        self.emit(InstKind::Br { dest }, Type::Void, "")
    }

    pub fn cond_br(&mut self, cond: ValueId, then_dest: BlockId, else_dest: BlockId) -> ValueId {
        self.emit(InstKind::CondBr { cond, then_dest, else_dest }, Type::Void, "")
    }

    pub fn switch(&mut self, value: ValueId, default: BlockId, cases: Vec<SwitchCase>) -> ValueId {
        self.emit(InstKind::Switch { value, default, cases }, Type::Void, "")
    }

    pub fn ret(&mut self) -> ValueId {
        self.emit(InstKind::Ret { value: None }, Type::Void, "")
    }

    pub fn unreachable(&mut self) -> ValueId {
        self.emit(InstKind::Unreachable, Type::Void, "")
    }
}
