//! Veld intermediate representation.
//!
//! A mutable control-flow-graph IR for scalar OpenCL work-item kernels:
//! functions own an arena of values and basic blocks, instructions are a
//! tagged variant over the node kinds the work-group transformations
//! consume, and rewriting happens in place through ids rather than through
//! shared pointers.
//!
//! # Module Organization
//!
//! - [`op`] - instruction kinds and operand/successor visitors
//! - [`types`] - the scalar/pointer/array type system
//! - [`builder`] - positioned instruction emission
//! - [`dominance`] - dominator tree and instruction-level dominance
//! - [`verify`] - SSA/CFG structural verification
//! - [`interp`] - reference interpreter for execution-level tests
//! - [`print`] - LLVM-like textual form
//!
//! Design choice: ids into per-function arenas instead of `Rc` graph nodes.
//! The flattening passes clone, splice and rewire whole regions of the CFG
//! in place; value identity must survive those mutations, and a plain
//! `u32` id does while a shared pointer graph would fight the borrow
//! checker at every splice point.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::mem::discriminant;

use smallvec::SmallVec;

pub mod builder;
pub mod dominance;
pub mod error;
pub mod interp;
pub mod op;
pub mod print;
pub mod types;
pub mod verify;

#[cfg(test)]
pub mod test;

pub use builder::Builder;
pub use error::{Error, Result};
pub use op::{BinaryOp, Callee, IcmpPred, InstKind, MdTag, PhiIncoming, SwitchCase};
pub use types::Type;

/// Payload string of the [`MdTag::Arrayified`] metadata node: marks an
/// alloca as cross-barrier loop state.
pub const LOOP_STATE_MD: &str = "poclLoopState";

/// Id of a value (constant, global reference, parameter or instruction)
/// within one [`Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u32);

/// Id of a basic block within one [`Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

/// Id of a global variable within one [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(u32);

macro_rules! id_impls {
    ($($id:ident),*) => {
        $(
            impl $id {
                pub fn from_raw(raw: u32) -> Self {
                    Self(raw)
                }

                pub fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl std::fmt::Display for $id {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

id_impls!(ValueId, BlockId, GlobalId);

/// Constant value stored in a [`ValueData::Const`].
#[derive(Debug, Clone, Copy)]
pub enum ConstValue {
    Int(i64),
    Bool(bool),
    Float(f64),
}

// Floats compare and hash by bit pattern so constants can be interned;
// NaNs with identical bits are equal, which is exactly what interning
// needs.
impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstValue::Int(a), ConstValue::Int(b)) => a == b,
            (ConstValue::Bool(a), ConstValue::Bool(b)) => a == b,
            (ConstValue::Float(a), ConstValue::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for ConstValue {}

impl Hash for ConstValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        discriminant(self).hash(state);
        match self {
            ConstValue::Int(v) => v.hash(state),
            ConstValue::Bool(v) => v.hash(state),
            ConstValue::Float(v) => v.to_bits().hash(state),
        }
    }
}

/// An instruction: kind, result type, optional name hint, owning block and
/// metadata tags.
#[derive(Debug, Clone)]
pub struct Inst {
    pub kind: InstKind,
    pub ty: Type,
    pub name: String,
    block: Option<BlockId>,
    metadata: SmallVec<[MdTag; 1]>,
}

impl Inst {
    pub fn new(kind: InstKind, ty: Type, name: impl Into<String>) -> Self {
        Self { kind, ty, name: name.into(), block: None, metadata: SmallVec::new() }
    }

    /// Block this instruction currently lives in, `None` once erased.
    pub fn parent(&self) -> Option<BlockId> {
        self.block
    }

    pub fn has_md(&self, tag: MdTag) -> bool {
        self.metadata.contains(&tag)
    }

    pub fn set_md(&mut self, tag: MdTag) {
        if !self.metadata.contains(&tag) {
            self.metadata.push(tag);
        }
    }

    pub fn metadata(&self) -> &[MdTag] {
        &self.metadata
    }
}

/// A value in a function's arena.
#[derive(Debug, Clone)]
pub enum ValueData {
    Const { value: ConstValue, ty: Type },
    /// Undefined value of a given type. Reading one is a bug the
    /// interpreter reports.
    Undef { ty: Type },
    /// Address of a module global. The value itself is a pointer.
    Global { global: GlobalId, name: String },
    /// Function parameter.
    Param { index: usize, ty: Type },
    Inst(Inst),
}

#[derive(Debug, Clone)]
struct BlockData {
    name: String,
    insts: Vec<ValueId>,
    removed: bool,
}

/// Clone map threaded through block cloning and remapping.
///
/// Mirrors the two roles a value map plays during region replication: value
/// substitution for operands, block substitution for branch targets and
/// PHI incoming blocks.
#[derive(Debug, Default)]
pub struct CloneMap {
    values: HashMap<ValueId, ValueId>,
    blocks: HashMap<BlockId, BlockId>,
}

impl CloneMap {
    pub fn value(&self, v: ValueId) -> Option<ValueId> {
        self.values.get(&v).copied()
    }

    pub fn block(&self, b: BlockId) -> Option<BlockId> {
        self.blocks.get(&b).copied()
    }

    /// Map `from` to `to`, overwriting any previous mapping.
    pub fn map_value(&mut self, from: ValueId, to: ValueId) {
        self.values.insert(from, to);
    }

    pub fn map_block(&mut self, from: BlockId, to: BlockId) {
        self.blocks.insert(from, to);
    }

    pub fn has_value(&self, v: ValueId) -> bool {
        self.values.contains_key(&v)
    }
}

/// A function under transformation: arena of values, arena of blocks, and
/// an ordered block layout.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    params: Vec<ValueId>,
    values: Vec<ValueData>,
    blocks: Vec<BlockData>,
    layout: Vec<BlockId>,
    entry: Option<BlockId>,
    /// Set by the work-group flattening pass; a flattened function is no
    /// longer a kernel to process.
    pub flattened: bool,
    const_cache: HashMap<(ConstValue, Type), ValueId>,
    global_cache: HashMap<GlobalId, ValueId>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            values: Vec::new(),
            blocks: Vec::new(),
            layout: Vec::new(),
            entry: None,
            flattened: false,
            const_cache: HashMap::new(),
            global_cache: HashMap::new(),
        }
    }

    // ---- values ----------------------------------------------------------

    fn push_value(&mut self, data: ValueData) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(data);
        id
    }

    pub fn add_param(&mut self, ty: Type) -> ValueId {
        let index = self.params.len();
        let id = self.push_value(ValueData::Param { index, ty });
        self.params.push(id);
        id
    }

    pub fn params(&self) -> &[ValueId] {
        &self.params
    }

    pub fn value(&self, v: ValueId) -> &ValueData {
        &self.values[v.index()]
    }

    /// Result type of a value.
    pub fn value_ty(&self, v: ValueId) -> Type {
        match self.value(v) {
            ValueData::Const { ty, .. } | ValueData::Undef { ty } | ValueData::Param { ty, .. } => ty.clone(),
            ValueData::Global { .. } => Type::Ptr,
            ValueData::Inst(inst) => inst.ty.clone(),
        }
    }

    /// Interned constant of arbitrary type.
    pub fn const_typed(&mut self, value: ConstValue, ty: Type) -> ValueId {
        if let Some(&id) = self.const_cache.get(&(value, ty.clone())) {
            return id;
        }
        let id = self.push_value(ValueData::Const { value, ty: ty.clone() });
        self.const_cache.insert((value, ty), id);
        id
    }

    /// Interned `i64` constant; barrier ids and indices use this.
    pub fn const_int(&mut self, value: i64) -> ValueId {
        self.const_typed(ConstValue::Int(value), Type::largest_int())
    }

    pub fn const_bool(&mut self, value: bool) -> ValueId {
        self.const_typed(ConstValue::Bool(value), Type::Bool)
    }

    pub fn undef(&mut self, ty: Type) -> ValueId {
        self.push_value(ValueData::Undef { ty })
    }

    /// Pointer to a module global, interned per function.
    pub fn global_value(&mut self, global: GlobalId, name: impl Into<String>) -> ValueId {
        if let Some(&id) = self.global_cache.get(&global) {
            return id;
        }
        let id = self.push_value(ValueData::Global { global, name: name.into() });
        self.global_cache.insert(global, id);
        id
    }

    pub fn is_inst(&self, v: ValueId) -> bool {
        matches!(self.value(v), ValueData::Inst(_))
    }

    pub fn try_inst(&self, v: ValueId) -> Option<&Inst> {
        match self.value(v) {
            ValueData::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn inst(&self, v: ValueId) -> &Inst {
        self.try_inst(v).unwrap_or_else(|| panic!("value {v} is not an instruction"))
    }

    pub fn inst_mut(&mut self, v: ValueId) -> &mut Inst {
        match &mut self.values[v.index()] {
            ValueData::Inst(inst) => inst,
            _ => panic!("value {v} is not an instruction"),
        }
    }

    /// Total number of values in the arena, attached or not.
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    // ---- blocks ----------------------------------------------------------

    pub fn create_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData { name: name.into(), insts: Vec::new(), removed: false });
        self.layout.push(id);
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        id
    }

    /// Create a block placed immediately before `before` in layout order.
    pub fn create_block_before(&mut self, name: impl Into<String>, before: BlockId) -> BlockId {
        let id = self.create_block(name);
        self.layout.pop();
        let pos = self.layout.iter().position(|&b| b == before).expect("before block not in layout");
        self.layout.insert(pos, id);
        id
    }

    pub fn entry(&self) -> BlockId {
        self.entry.expect("function has no blocks")
    }

    pub fn block_name(&self, b: BlockId) -> &str {
        &self.blocks[b.index()].name
    }

    pub fn block_is_removed(&self, b: BlockId) -> bool {
        self.blocks[b.index()].removed
    }

    /// Live blocks in layout order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.layout.iter().copied()
    }

    /// Snapshot of the current layout; safe to hold across mutation.
    pub fn block_order(&self) -> Vec<BlockId> {
        self.layout.clone()
    }

    pub fn block_insts(&self, b: BlockId) -> &[ValueId] {
        &self.blocks[b.index()].insts
    }

    /// Index of `v` within its block.
    pub fn inst_index(&self, v: ValueId) -> usize {
        let block = self.inst(v).parent().expect("instruction is detached");
        self.blocks[block.index()]
            .insts
            .iter()
            .position(|&i| i == v)
            .expect("instruction not found in its parent block")
    }

    /// Index of the first non-PHI instruction of a block.
    pub fn first_non_phi_index(&self, b: BlockId) -> usize {
        let insts = &self.blocks[b.index()].insts;
        insts.iter().position(|&i| !self.inst(i).kind.is_phi()).unwrap_or(insts.len())
    }

    pub fn append_inst(&mut self, b: BlockId, inst: Inst) -> ValueId {
        let at = self.blocks[b.index()].insts.len();
        self.insert_inst(b, at, inst)
    }

    pub fn insert_inst(&mut self, b: BlockId, at: usize, mut inst: Inst) -> ValueId {
        inst.block = Some(b);
        let id = self.push_value(ValueData::Inst(inst));
        self.blocks[b.index()].insts.insert(at, id);
        id
    }

    /// Detach `v` from its block. The value stays in the arena so stale
    /// references remain diagnosable.
    pub fn erase_inst(&mut self, v: ValueId) {
        if let Some(block) = self.inst(v).parent() {
            self.blocks[block.index()].insts.retain(|&i| i != v);
            self.inst_mut(v).block = None;
        }
    }

    /// Detach `v` from its current block and re-insert it at `at` in `b`.
    pub fn move_inst(&mut self, v: ValueId, b: BlockId, at: usize) {
        self.erase_inst(v);
        self.inst_mut(v).block = Some(b);
        self.blocks[b.index()].insts.insert(at, v);
    }

    // ---- control flow ----------------------------------------------------

    pub fn terminator(&self, b: BlockId) -> Option<ValueId> {
        let last = *self.blocks[b.index()].insts.last()?;
        self.inst(last).kind.is_terminator().then_some(last)
    }

    pub fn successors(&self, b: BlockId) -> SmallVec<[BlockId; 2]> {
        match self.terminator(b) {
            Some(t) => self.inst(t).kind.successors(),
            None => SmallVec::new(),
        }
    }

    pub fn single_successor(&self, b: BlockId) -> Option<BlockId> {
        let succs = self.successors(b);
        match succs.as_slice() {
            [s] => Some(*s),
            _ => None,
        }
    }

    /// Predecessors of `b`, by scanning live block terminators. A block
    /// appears once per edge kind, not per switch case.
    pub fn predecessors(&self, b: BlockId) -> Vec<BlockId> {
        let mut preds = Vec::new();
        for p in &self.layout {
            if self.successors(*p).contains(&b) {
                preds.push(*p);
            }
        }
        preds
    }

    /// Rewrite `from`-targeting edges of `b`'s terminator to `to`.
    pub fn replace_successor(&mut self, b: BlockId, from: BlockId, to: BlockId) {
        let term = self.terminator(b).expect("block has no terminator");
        let n = self.inst_mut(term).kind.replace_successor(from, to);
        debug_assert!(n > 0, "no successor edge to replace");
    }

    // ---- PHI helpers -----------------------------------------------------

    pub fn add_phi_incoming(&mut self, phi: ValueId, value: ValueId, block: BlockId) {
        self.inst_mut(phi).kind.phi_incoming_mut().push(PhiIncoming { value, block });
    }

    /// For every PHI in `b`, rewrite incoming-block references from
    /// `old_pred` to `new_pred`.
    pub fn replace_phi_uses_with(&mut self, b: BlockId, old_pred: BlockId, new_pred: BlockId) {
        for v in self.blocks[b.index()].insts.clone() {
            let inst = self.inst_mut(v);
            if let InstKind::Phi { incoming } = &mut inst.kind {
                for inc in incoming {
                    if inc.block == old_pred {
                        inc.block = new_pred;
                    }
                }
            }
        }
    }

    pub fn remove_phi_incoming(&mut self, phi: ValueId, pred: BlockId) {
        self.inst_mut(phi).kind.phi_incoming_mut().retain(|inc| inc.block != pred);
    }

    // ---- uses ------------------------------------------------------------

    /// Instructions using `v` as an operand, across all live blocks.
    pub fn users_of(&self, v: ValueId) -> Vec<ValueId> {
        let mut users = Vec::new();
        for &b in &self.layout {
            for &i in &self.blocks[b.index()].insts {
                if self.inst(i).kind.operands().contains(&v) {
                    users.push(i);
                }
            }
        }
        users
    }

    /// Replace every use of `old` with `new` across all live blocks.
    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) {
        for b in self.layout.clone() {
            for v in self.blocks[b.index()].insts.clone() {
                self.replace_uses_in_inst(v, old, new);
            }
        }
    }

    pub fn replace_uses_in_inst(&mut self, user: ValueId, old: ValueId, new: ValueId) {
        self.inst_mut(user).kind.for_each_operand_mut(|op| {
            if *op == old {
                *op = new;
            }
        });
    }

    // ---- structural surgery ----------------------------------------------

    /// Move `insts[at..]` of `b` into a fresh block and terminate `b` with a
    /// branch to it. PHIs in the moved instructions' successors are updated
    /// to name the new block as predecessor.
    pub fn split_block(&mut self, b: BlockId, at: usize, name: impl Into<String>) -> BlockId {
        let new = self.create_block(name);
        let moved: Vec<ValueId> = self.blocks[b.index()].insts.split_off(at);
        for &v in &moved {
            self.inst_mut(v).block = Some(new);
        }
        self.blocks[new.index()].insts = moved;
        self.append_inst(b, Inst::new(InstKind::Br { dest: new }, Type::Void, ""));
        for succ in self.successors(new) {
            self.replace_phi_uses_with(succ, b, new);
        }
        new
    }

    /// Clone `b`'s instructions into a fresh block named after `b` plus
    /// `suffix`. Operands are *not* remapped; each original→clone pair is
    /// recorded in `map` for a later [`Self::remap_insts_in_blocks`] pass.
    pub fn clone_block(&mut self, b: BlockId, suffix: &str, map: &mut CloneMap) -> BlockId {
        let name = format!("{}{}", self.blocks[b.index()].name, suffix);
        let new = self.create_block(name);
        for v in self.blocks[b.index()].insts.clone() {
            let inst = self.inst(v).clone();
            let clone = self.append_inst(new, inst);
            map.map_value(v, clone);
        }
        new
    }

    /// Rewrite operands, branch targets and PHI incoming blocks of every
    /// instruction in `blocks` through `map`.
    pub fn remap_insts_in_blocks(&mut self, blocks: &[BlockId], map: &CloneMap) {
        for &b in blocks {
            for v in self.blocks[b.index()].insts.clone() {
                let inst = self.inst_mut(v);
                inst.kind.for_each_operand_mut(|op| {
                    if let Some(n) = map.values.get(op) {
                        *op = *n;
                    }
                });
                inst.kind.for_each_block_ref_mut(|blk| {
                    if let Some(n) = map.blocks.get(blk) {
                        *blk = *n;
                    }
                });
            }
        }
    }

    /// Detach a block from the layout; its instructions become detached
    /// too.
    pub fn remove_block(&mut self, b: BlockId) {
        for v in self.blocks[b.index()].insts.clone() {
            self.inst_mut(v).block = None;
        }
        self.blocks[b.index()].insts.clear();
        self.blocks[b.index()].removed = true;
        self.layout.retain(|&x| x != b);
        if self.entry == Some(b) {
            self.entry = self.layout.first().copied();
        }
    }

    /// Drop every block unreachable from the entry, fixing up PHIs of the
    /// surviving blocks. Returns the number of blocks removed.
    pub fn remove_unreachable_blocks(&mut self) -> usize {
        let entry = self.entry();
        let mut reachable = vec![false; self.blocks.len()];
        let mut wl = vec![entry];
        while let Some(b) = wl.pop() {
            if std::mem::replace(&mut reachable[b.index()], true) {
                continue;
            }
            wl.extend(self.successors(b));
        }

        let dead: Vec<BlockId> = self.layout.iter().copied().filter(|b| !reachable[b.index()]).collect();
        for &b in &self.layout.clone() {
            if !reachable[b.index()] {
                continue;
            }
            for v in self.blocks[b.index()].insts.clone() {
                if self.inst(v).kind.is_phi() {
                    self.inst_mut(v).kind.phi_incoming_mut().retain(|inc| reachable[inc.block.index()]);
                }
            }
        }
        for &b in &dead {
            tracing::trace!(block = self.blocks[b.index()].name, "removing unreachable block");
            self.remove_block(b);
        }
        dead.len()
    }
}

/// Global variable: a single cell of `value_ty` storage.
#[derive(Debug, Clone)]
pub struct GlobalData {
    pub name: String,
    pub value_ty: Type,
}

/// A module: globals, functions, metadata and the kernel list.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    globals: Vec<GlobalData>,
    functions: Vec<Function>,
    int_md: HashMap<String, u64>,
    bool_md: HashMap<String, bool>,
    kernels: Vec<String>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn add_global(&mut self, name: impl Into<String>, value_ty: Type) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(GlobalData { name: name.into(), value_ty });
        id
    }

    pub fn global(&self, g: GlobalId) -> &GlobalData {
        &self.globals[g.index()]
    }

    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.globals.iter().position(|g| g.name == name).map(|i| GlobalId(i as u32))
    }

    /// Look up a global by name, creating it if absent.
    pub fn ensure_global(&mut self, name: &str, value_ty: Type) -> GlobalId {
        match self.global_by_name(name) {
            Some(g) => g,
            None => self.add_global(name, value_ty),
        }
    }

    pub fn globals(&self) -> &[GlobalData] {
        &self.globals
    }

    pub fn set_int_metadata(&mut self, key: &str, value: u64) {
        self.int_md.insert(key.to_owned(), value);
    }

    pub fn int_metadata(&self, key: &str) -> Option<u64> {
        self.int_md.get(key).copied()
    }

    pub fn set_bool_metadata(&mut self, key: &str, value: bool) {
        self.bool_md.insert(key.to_owned(), value);
    }

    pub fn bool_metadata(&self, key: &str) -> Option<bool> {
        self.bool_md.get(key).copied()
    }

    /// Mark a function name as an OpenCL kernel entry point.
    pub fn add_kernel(&mut self, name: &str) {
        if !self.kernels.iter().any(|k| k == name) {
            self.kernels.push(name.to_owned());
        }
    }

    pub fn is_kernel(&self, name: &str) -> bool {
        self.kernels.iter().any(|k| k == name)
    }

    pub fn add_function(&mut self, func: Function) -> usize {
        self.functions.push(func);
        self.functions.len() - 1
    }

    pub fn function(&self, index: usize) -> &Function {
        &self.functions[index]
    }

    pub fn function_mut(&mut self, index: usize) -> &mut Function {
        &mut self.functions[index]
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }
}
