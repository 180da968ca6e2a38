//! LLVM-like textual form for functions.
//!
//! Only for logs, error dumps and test diagnostics; there is no parser and
//! the syntax is not round-trippable.

use std::collections::HashMap;
use std::fmt;

use crate::op::{BinaryOp, Callee, IcmpPred, InstKind};
use crate::{ConstValue, Function, LOOP_STATE_MD, MdTag, ValueData, ValueId};

struct Names {
    values: HashMap<ValueId, String>,
    blocks: HashMap<crate::BlockId, String>,
}

fn assign_names(func: &Function) -> Names {
    let mut taken: HashMap<String, usize> = HashMap::new();
    let mut unique = |hint: &str, fallback: String| -> String {
        let base = if hint.is_empty() { fallback } else { hint.to_owned() };
        let n = taken.entry(base.clone()).or_insert(0);
        *n += 1;
        if *n == 1 { base } else { format!("{base}.{}", *n - 1) }
    };

    let mut blocks = HashMap::new();
    for b in func.blocks() {
        let name = unique(func.block_name(b), format!("bb{b}"));
        blocks.insert(b, name);
    }

    let mut values = HashMap::new();
    for (i, &p) in func.params().iter().enumerate() {
        values.insert(p, format!("arg{i}"));
    }
    let mut counter = 0usize;
    for b in func.blocks() {
        for &v in func.block_insts(b) {
            let inst = func.inst(v);
            if inst.ty == crate::Type::Void {
                continue;
            }
            let fallback = format!("t{counter}");
            counter += 1;
            values.insert(v, unique(&inst.name, fallback));
        }
    }
    Names { values, blocks }
}

fn fmt_operand(func: &Function, names: &Names, v: ValueId) -> String {
    match func.value(v) {
        ValueData::Const { value, .. } => match value {
            ConstValue::Int(i) => i.to_string(),
            ConstValue::Bool(b) => b.to_string(),
            ConstValue::Float(x) => format!("{x:?}"),
        },
        ValueData::Undef { .. } => "undef".to_owned(),
        ValueData::Global { name, .. } => format!("@{name}"),
        ValueData::Param { .. } | ValueData::Inst(_) => match names.values.get(&v) {
            Some(n) => format!("%{n}"),
            None => format!("%v{v}"),
        },
    }
}

fn fmt_md(md: &[MdTag]) -> String {
    let mut out = String::new();
    for tag in md {
        match tag {
            MdTag::Arrayified => out.push_str(&format!(", !{} !{{!\"{}\"}}", tag.name(), LOOP_STATE_MD)),
            MdTag::WorkItemLoop => out.push_str(&format!(", !llvm.loop !{{!\"{}\"}}", tag.name())),
        }
    }
    out
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = assign_names(self);
        let params: Vec<String> = self
            .params()
            .iter()
            .map(|&p| format!("{} %{}", self.value_ty(p), names.values[&p]))
            .collect();
        writeln!(f, "define void @{}({}) {{", self.name, params.join(", "))?;

        for b in self.blocks() {
            writeln!(f, "{}:", names.blocks[&b])?;
            for &v in self.block_insts(b) {
                let inst = self.inst(v);
                let op = |v: ValueId| fmt_operand(self, &names, v);
                let blk = |b: crate::BlockId| format!("%{}", names.blocks[&b]);
                let text = match &inst.kind {
                    InstKind::Binary { op: bop, lhs, rhs } => {
                        let mnemonic = match bop {
                            BinaryOp::Add => "add",
                            BinaryOp::Sub => "sub",
                            BinaryOp::Mul => "mul",
                            BinaryOp::UDiv => "udiv",
                            BinaryOp::URem => "urem",
                        };
                        format!("{mnemonic} {} {}, {}", inst.ty, op(*lhs), op(*rhs))
                    }
                    InstKind::Icmp { pred, lhs, rhs } => {
                        let mnemonic = match pred {
                            IcmpPred::Eq => "eq",
                            IcmpPred::Ne => "ne",
                            IcmpPred::Ult => "ult",
                            IcmpPred::Ule => "ule",
                            IcmpPred::Slt => "slt",
                            IcmpPred::Sle => "sle",
                        };
                        format!("icmp {mnemonic} {}, {}", op(*lhs), op(*rhs))
                    }
                    InstKind::Phi { incoming } => {
                        let edges: Vec<String> =
                            incoming.iter().map(|inc| format!("[ {}, {} ]", op(inc.value), blk(inc.block))).collect();
                        format!("phi {} {}", inst.ty, edges.join(", "))
                    }
                    InstKind::Alloca { elem_ty, array_size, align } => {
                        if *array_size == 1 {
                            format!("alloca {elem_ty}, align {align}")
                        } else {
                            format!("alloca {elem_ty}, i64 {array_size}, align {align}")
                        }
                    }
                    InstKind::Load { ptr } => format!("load {}, ptr {}", inst.ty, op(*ptr)),
                    InstKind::Store { value, ptr } => format!("store {}, ptr {}", op(*value), op(*ptr)),
                    InstKind::Gep { elem_ty, base, index } => {
                        format!("getelementptr inbounds {elem_ty}, ptr {}, i64 {}", op(*base), op(*index))
                    }
                    InstKind::Call { callee, args } => {
                        let name = match callee {
                            Callee::Barrier => "pocl.barrier",
                            Callee::Named(n) => n,
                        };
                        let args: Vec<String> = args.iter().map(|&a| op(a)).collect();
                        format!("call {} @{name}({})", inst.ty, args.join(", "))
                    }
                    InstKind::Br { dest } => format!("br label {}", blk(*dest)),
                    InstKind::CondBr { cond, then_dest, else_dest } => {
                        format!("br i1 {}, label {}, label {}", op(*cond), blk(*then_dest), blk(*else_dest))
                    }
                    InstKind::Switch { value, default, cases } => {
                        let arms: Vec<String> =
                            cases.iter().map(|c| format!("i64 {}, label {}", c.value, blk(c.dest))).collect();
                        format!("switch i64 {}, label {} [ {} ]", op(*value), blk(*default), arms.join(" "))
                    }
                    InstKind::Ret { value: Some(v) } => format!("ret {}", op(*v)),
                    InstKind::Ret { value: None } => "ret void".to_owned(),
                    InstKind::Unreachable => "unreachable".to_owned(),
                };
                if inst.ty == crate::Type::Void {
                    writeln!(f, "  {text}{}", fmt_md(inst.metadata()))?;
                } else {
                    writeln!(f, "  %{} = {text}{}", names.values[&v], fmt_md(inst.metadata()))?;
                }
            }
        }
        writeln!(f, "}}")
    }
}
