//! Reference interpreter.
//!
//! Executes a single function against a region-based memory model: one
//! region per global, per pointer parameter and per executed alloca.
//! This is the execution oracle for the work-group transformation tests;
//! it favors strict checking over speed (bounds on every access, fuel
//! against runaway loops, hard error on undef pointers).
//!
//! Memory is zero-initialized, matching what the flattening passes may
//! legitimately rely on: a hoisted region-entry load can touch a backing
//! slot whose producer never ran on a dead path.

use std::collections::HashMap;

use snafu::{Snafu, ensure};

use crate::op::{BinaryOp, Callee, IcmpPred, InstKind};
use crate::types::Type;
use crate::{BlockId, ConstValue, Function, GlobalId, ValueData, ValueId};

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum InterpError {
    #[snafu(display("fuel exhausted after {steps} instructions"))]
    FuelExhausted { steps: u64 },

    #[snafu(display("load through undef pointer"))]
    UndefPointer,

    #[snafu(display("value %{name} used before definition"))]
    UseBeforeDef { name: String },

    #[snafu(display("expected a pointer, found {found}"))]
    NotAPointer { found: String },

    #[snafu(display("expected an integer, found {found}"))]
    NotAnInteger { found: String },

    #[snafu(display("no buffer bound for pointer parameter {index}"))]
    MissingBuffer { index: usize },

    #[snafu(display("memory access out of bounds: region {region} offset {offset} size {size}"))]
    OutOfBounds { region: usize, offset: u64, size: usize },

    #[snafu(display("division by zero"))]
    DivisionByZero,

    #[snafu(display("unreachable instruction executed"))]
    UnreachableExecuted,

    #[snafu(display("call to @{name} is not supported by the interpreter"))]
    UnsupportedCall { name: String },

    #[snafu(display("type {ty} is not loadable/storable as a scalar"))]
    NotScalar { ty: String },

    #[snafu(display("phi has no incoming edge for predecessor block"))]
    PhiMissingIncoming,

    #[snafu(display("block has no terminator"))]
    NoTerminator,
}

pub type Result<T, E = InterpError> = std::result::Result<T, E>;

/// One scalar memory/value slot.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Int(i64),
    Float(f64),
    Ptr { region: usize, offset: u64 },
}

/// Inputs and outputs of one execution.
///
/// Pointer parameters are bound to `buffers` by parameter index; integer
/// parameters to `scalar_args`. Globals read their initial value from
/// `globals` and write their final value back.
#[derive(Debug, Default)]
pub struct ExecEnv {
    pub globals: HashMap<GlobalId, i64>,
    pub buffers: Vec<Vec<i64>>,
    pub scalar_args: Vec<i64>,
    pub fuel: u64,
}

impl ExecEnv {
    pub fn new() -> Self {
        Self { fuel: 1_000_000, ..Default::default() }
    }

    pub fn with_buffer(mut self, buf: Vec<i64>) -> Self {
        self.buffers.push(buf);
        self
    }

    pub fn with_global(mut self, g: GlobalId, value: i64) -> Self {
        self.globals.insert(g, value);
        self
    }
}

struct Machine<'f> {
    func: &'f Function,
    regions: Vec<Vec<Slot>>,
    global_regions: HashMap<GlobalId, usize>,
    param_regions: HashMap<usize, usize>,
    vals: HashMap<ValueId, Slot>,
    fuel: u64,
    steps: u64,
}

/// Run `func` to completion under `env`, writing buffer and global results
/// back into `env`.
pub fn execute(func: &Function, env: &mut ExecEnv) -> Result<()> {
    let mut m = Machine {
        func,
        regions: Vec::new(),
        global_regions: HashMap::new(),
        param_regions: HashMap::new(),
        vals: HashMap::new(),
        fuel: env.fuel,
        steps: 0,
    };

    // Pointer params get one region each, sized by the provided buffer.
    for (i, buf) in env.buffers.iter().enumerate() {
        let region = m.regions.len();
        m.regions.push(buf.iter().map(|&v| Slot::Int(v)).collect());
        m.param_regions.insert(i, region);
    }

    m.run(env)?;

    for (i, buf) in env.buffers.iter_mut().enumerate() {
        let region = m.param_regions[&i];
        for (slot, out) in m.regions[region].iter().zip(buf.iter_mut()) {
            *out = match slot {
                Slot::Int(v) => *v,
                Slot::Float(v) => v.to_bits() as i64,
                Slot::Ptr { .. } => 0,
            };
        }
    }
    for (&g, &region) in &m.global_regions {
        if let Slot::Int(v) = m.regions[region][0] {
            env.globals.insert(g, v);
        }
    }
    Ok(())
}

impl<'f> Machine<'f> {
    fn run(&mut self, env: &ExecEnv) -> Result<()> {
        let mut block = self.func.entry();
        let mut prev: Option<BlockId> = None;
        loop {
            match self.run_block(block, prev, env)? {
                Some(next) => {
                    prev = Some(block);
                    block = next;
                }
                None => return Ok(()),
            }
        }
    }

    /// Execute one block; returns the next block or `None` on return.
    fn run_block(&mut self, block: BlockId, prev: Option<BlockId>, env: &ExecEnv) -> Result<Option<BlockId>> {
        let insts = self.func.block_insts(block);

        // PHIs evaluate simultaneously against the predecessor edge.
        let phi_end = self.func.first_non_phi_index(block);
        if phi_end > 0 {
            let prev = prev.ok_or(InterpError::PhiMissingIncoming)?;
            let mut updates = Vec::with_capacity(phi_end);
            for &v in &insts[..phi_end] {
                let inc = self
                    .func
                    .inst(v)
                    .kind
                    .phi_incoming()
                    .iter()
                    .find(|inc| inc.block == prev)
                    .ok_or(InterpError::PhiMissingIncoming)?;
                updates.push((v, self.operand(inc.value, env)?));
            }
            for (v, slot) in updates {
                self.vals.insert(v, slot);
            }
        }

        for &v in &insts[phi_end..] {
            self.steps += 1;
            ensure!(self.steps <= self.fuel, FuelExhaustedSnafu { steps: self.steps });

            let inst = self.func.inst(v);
            match &inst.kind {
                InstKind::Phi { .. } => unreachable!("phi after non-phi survived verification"),
                InstKind::Binary { op, lhs, rhs } => {
                    let a = self.operand(*lhs, env)?;
                    let b = self.operand(*rhs, env)?;
                    let out = eval_binary(*op, a, b)?;
                    self.vals.insert(v, out);
                }
                InstKind::Icmp { pred, lhs, rhs } => {
                    let a = self.int_operand(*lhs, env)?;
                    let b = self.int_operand(*rhs, env)?;
                    let out = match pred {
                        IcmpPred::Eq => a == b,
                        IcmpPred::Ne => a != b,
                        IcmpPred::Ult => (a as u64) < (b as u64),
                        IcmpPred::Ule => (a as u64) <= (b as u64),
                        IcmpPred::Slt => a < b,
                        IcmpPred::Sle => a <= b,
                    };
                    self.vals.insert(v, Slot::Int(out as i64));
                }
                InstKind::Alloca { elem_ty, array_size, .. } => {
                    let slots = elem_ty.slot_count() * array_size;
                    let region = self.regions.len();
                    self.regions.push(vec![Slot::Int(0); slots as usize]);
                    self.vals.insert(v, Slot::Ptr { region, offset: 0 });
                }
                InstKind::Gep { elem_ty, base, index } => {
                    let (region, offset) = self.ptr_operand(*base, env)?;
                    let idx = self.int_operand(*index, env)? as u64;
                    self.vals.insert(v, Slot::Ptr { region, offset: offset + idx * elem_ty.slot_count() });
                }
                InstKind::Load { ptr } => {
                    ensure_scalar(&inst.ty)?;
                    let (region, offset) = self.ptr_operand(*ptr, env)?;
                    let slot = self.read(region, offset)?;
                    self.vals.insert(v, slot);
                }
                InstKind::Store { value, ptr } => {
                    let slot = self.operand(*value, env)?;
                    let (region, offset) = self.ptr_operand(*ptr, env)?;
                    self.write(region, offset, slot)?;
                }
                InstKind::Call { callee, .. } => match callee {
                    // Barriers synchronize nothing in a single scalar
                    // execution.
                    Callee::Barrier => {}
                    Callee::Named(name) => return UnsupportedCallSnafu { name: name.clone() }.fail(),
                },
                InstKind::Br { dest } => return Ok(Some(*dest)),
                InstKind::CondBr { cond, then_dest, else_dest } => {
                    let c = self.int_operand(*cond, env)?;
                    return Ok(Some(if c != 0 { *then_dest } else { *else_dest }));
                }
                InstKind::Switch { value, default, cases } => {
                    let x = self.int_operand(*value, env)?;
                    let dest = cases.iter().find(|c| c.value == x).map(|c| c.dest).unwrap_or(*default);
                    return Ok(Some(dest));
                }
                InstKind::Ret { .. } => return Ok(None),
                InstKind::Unreachable => return UnreachableExecutedSnafu.fail(),
            }
        }
        NoTerminatorSnafu.fail()
    }

    fn operand(&mut self, v: ValueId, env: &ExecEnv) -> Result<Slot> {
        match self.func.value(v) {
            ValueData::Const { value, .. } => Ok(match value {
                ConstValue::Int(i) => Slot::Int(*i),
                ConstValue::Bool(b) => Slot::Int(*b as i64),
                ConstValue::Float(x) => Slot::Float(*x),
            }),
            ValueData::Undef { .. } => Err(InterpError::UndefPointer),
            ValueData::Global { global, .. } => {
                let region = match self.global_regions.get(global) {
                    Some(&r) => r,
                    None => {
                        let r = self.regions.len();
                        let init = env.globals.get(global).copied().unwrap_or(0);
                        self.regions.push(vec![Slot::Int(init)]);
                        self.global_regions.insert(*global, r);
                        r
                    }
                };
                Ok(Slot::Ptr { region, offset: 0 })
            }
            ValueData::Param { index, ty } => {
                if ty.is_ptr() {
                    match self.param_regions.get(index) {
                        Some(&r) => Ok(Slot::Ptr { region: r, offset: 0 }),
                        None => MissingBufferSnafu { index: *index }.fail(),
                    }
                } else {
                    Ok(Slot::Int(env.scalar_args.get(*index).copied().unwrap_or(0)))
                }
            }
            ValueData::Inst(inst) => {
                self.vals.get(&v).copied().ok_or_else(|| InterpError::UseBeforeDef { name: inst.name.clone() })
            }
        }
    }

    fn int_operand(&mut self, v: ValueId, env: &ExecEnv) -> Result<i64> {
        match self.operand(v, env)? {
            Slot::Int(i) => Ok(i),
            other => NotAnIntegerSnafu { found: format!("{other:?}") }.fail(),
        }
    }

    fn ptr_operand(&mut self, v: ValueId, env: &ExecEnv) -> Result<(usize, u64)> {
        match self.operand(v, env)? {
            Slot::Ptr { region, offset } => Ok((region, offset)),
            other => NotAPointerSnafu { found: format!("{other:?}") }.fail(),
        }
    }

    fn read(&self, region: usize, offset: u64) -> Result<Slot> {
        let mem = &self.regions[region];
        ensure!((offset as usize) < mem.len(), OutOfBoundsSnafu { region, offset, size: mem.len() });
        Ok(mem[offset as usize])
    }

    fn write(&mut self, region: usize, offset: u64, slot: Slot) -> Result<()> {
        let size = self.regions[region].len();
        ensure!((offset as usize) < size, OutOfBoundsSnafu { region, offset, size });
        self.regions[region][offset as usize] = slot;
        Ok(())
    }
}

fn ensure_scalar(ty: &Type) -> Result<()> {
    ensure!(ty.slot_count() == 1, NotScalarSnafu { ty: ty.to_string() });
    Ok(())
}

fn eval_binary(op: BinaryOp, a: Slot, b: Slot) -> Result<Slot> {
    match (a, b) {
        (Slot::Int(a), Slot::Int(b)) => {
            let out = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::UDiv => {
                    ensure!(b != 0, DivisionByZeroSnafu);
                    ((a as u64) / (b as u64)) as i64
                }
                BinaryOp::URem => {
                    ensure!(b != 0, DivisionByZeroSnafu);
                    ((a as u64) % (b as u64)) as i64
                }
            };
            Ok(Slot::Int(out))
        }
        (Slot::Float(a), Slot::Float(b)) => {
            let out = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::UDiv | BinaryOp::URem => return NotAnIntegerSnafu { found: "float".to_owned() }.fail(),
            };
            Ok(Slot::Float(out))
        }
        (a, b) => NotAnIntegerSnafu { found: format!("{a:?} with {b:?}") }.fail(),
    }
}
