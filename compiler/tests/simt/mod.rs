// simt — Lock-step reference interpreter for selected LIR
//
// Runs one thread block of a `LirModule` function: every thread executes
// until it reaches a barrier or returns, then the block resumes together.
// Phis take their value from the predecessor block on entry. Global and
// shared memory are maps from (address space, byte address) to values.
//
// Preconditions: the function was produced by `select` (phis lead their
//                blocks; every barrier is reached by every thread).
// Failure modes: `SimtError` on reads of unwritten memory, undefined
//                values, divergent barriers or runaway loops.

#![allow(dead_code)]

use std::collections::HashMap;

use thiserror::Error;

use tlc::ir::{BinaryOp, CmpPred};
use tlc::lir::{
    LirFunction, LirModule, LirOp, LirType, Operand, SpecialReg, GLOBAL_ADDRSPACE,
    SHARED_ADDRSPACE,
};

/// Instructions one thread may retire before the run is abandoned.
const STEP_LIMIT: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    Int(i64),
    Float(f64),
    Ptr { space: u8, addr: i64 },
}

#[derive(Error, Debug)]
pub enum SimtError {
    #[error("thread {tid}: %{value} used before it was defined")]
    Undefined { tid: i64, value: u32 },
    #[error("thread {tid}: load from unwritten address {addr} in addrspace({space})")]
    Unwritten { tid: i64, space: u8, addr: i64 },
    #[error("thread {tid}: {op} applied to {lhs:?} and {rhs:?}")]
    BadOperands {
        tid: i64,
        op: &'static str,
        lhs: Val,
        rhs: Val,
    },
    #[error("thread {tid}: no phi incoming from block {from}")]
    MissingIncoming { tid: i64, from: usize },
    #[error("thread {tid}: phi outside a block's leading phi group")]
    StrayPhi { tid: i64 },
    #[error("some threads returned while others wait at a barrier")]
    DivergentBarrier,
    #[error("thread {tid}: step limit exceeded")]
    StepLimit { tid: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Barrier,
    Ret,
}

#[derive(Debug, Default)]
struct Thread {
    regs: HashMap<u32, Val>,
    block: usize,
    pc: usize,
    steps: u64,
}

/// Base address of the kernel's `index`th pointer argument.
pub fn buffer(index: usize) -> Val {
    Val::Ptr {
        space: GLOBAL_ADDRSPACE,
        addr: ((index as i64) + 1) << 32,
    }
}

#[derive(Debug, Default)]
pub struct Machine {
    memory: HashMap<(u8, i64), Val>,
    /// Block index per grid axis; missing axes read as 0.
    pub block_ids: Vec<i64>,
}

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` as element `index` of an fp32 buffer.
    pub fn write_f32(&mut self, buf: Val, index: usize, value: f64) {
        let Val::Ptr { space, addr } = buf else {
            panic!("write_f32 on non-pointer {:?}", buf);
        };
        self.memory
            .insert((space, addr + 4 * index as i64), Val::Float(value));
    }

    pub fn read_f32(&self, buf: Val, index: usize) -> Option<f64> {
        let Val::Ptr { space, addr } = buf else {
            return None;
        };
        match self.memory.get(&(space, addr + 4 * index as i64)) {
            Some(Val::Float(x)) => Some(*x),
            _ => None,
        }
    }

    /// Execute function `func` for one thread block with `args`.
    pub fn run(&mut self, lir: &LirModule, func: usize, args: &[Val]) -> Result<(), SimtError> {
        let f = &lir.functions()[func];
        let mut threads: Vec<Thread> = (0..f.decl.threads_per_block)
            .map(|_| Thread::default())
            .collect();
        loop {
            let mut events = Vec::with_capacity(threads.len());
            for (tid, thread) in threads.iter_mut().enumerate() {
                events.push(self.run_thread(lir, f, thread, tid as i64, args)?);
            }
            if events.iter().all(|&e| e == Event::Ret) {
                return Ok(());
            }
            if events.contains(&Event::Ret) {
                return Err(SimtError::DivergentBarrier);
            }
        }
    }

    fn run_thread(
        &mut self,
        lir: &LirModule,
        f: &LirFunction,
        t: &mut Thread,
        tid: i64,
        args: &[Val],
    ) -> Result<Event, SimtError> {
        loop {
            t.steps += 1;
            if t.steps > STEP_LIMIT {
                return Err(SimtError::StepLimit { tid });
            }
            let inst = &f.blocks[t.block].insts[t.pc];
            t.pc += 1;
            let result = match &inst.op {
                LirOp::Binary { op, lhs, rhs } => {
                    let (a, b) = (operand(lir, t, tid, lhs, args)?, operand(lir, t, tid, rhs, args)?);
                    Some(binary(*op, a, b, tid)?)
                }
                LirOp::Cmp { pred, lhs, rhs } => {
                    let (a, b) = (operand(lir, t, tid, lhs, args)?, operand(lir, t, tid, rhs, args)?);
                    Some(compare(*pred, a, b, tid)?)
                }
                LirOp::Gep { elem, ptr, index } => {
                    let (p, i) = (operand(lir, t, tid, ptr, args)?, operand(lir, t, tid, index, args)?);
                    match (p, i) {
                        (Val::Ptr { space, addr }, Val::Int(i)) => Some(Val::Ptr {
                            space,
                            addr: addr + i * size_of(lir.ty(*elem)),
                        }),
                        (lhs, rhs) => {
                            return Err(SimtError::BadOperands {
                                tid,
                                op: "getelementptr",
                                lhs,
                                rhs,
                            })
                        }
                    }
                }
                LirOp::Load { ptr } => {
                    let (space, addr) = address(operand(lir, t, tid, ptr, args)?, tid, "load")?;
                    let v = self
                        .memory
                        .get(&(space, addr))
                        .copied()
                        .ok_or(SimtError::Unwritten { tid, space, addr })?;
                    Some(v)
                }
                LirOp::Store { ptr, value } => {
                    let (space, addr) = address(operand(lir, t, tid, ptr, args)?, tid, "store")?;
                    let v = operand(lir, t, tid, value, args)?;
                    self.memory.insert((space, addr), v);
                    None
                }
                LirOp::Fma { a, b, c } => {
                    let a = operand(lir, t, tid, a, args)?;
                    let b = operand(lir, t, tid, b, args)?;
                    let c = operand(lir, t, tid, c, args)?;
                    match (a, b, c) {
                        (Val::Float(a), Val::Float(b), Val::Float(c)) => Some(Val::Float(a.mul_add(b, c))),
                        (lhs, rhs, _) => {
                            return Err(SimtError::BadOperands {
                                tid,
                                op: "fma",
                                lhs,
                                rhs,
                            })
                        }
                    }
                }
                LirOp::Special(SpecialReg::ThreadId) => Some(Val::Int(tid)),
                LirOp::Special(SpecialReg::BlockId(axis)) => Some(Val::Int(
                    self.block_ids.get(*axis as usize).copied().unwrap_or(0),
                )),
                LirOp::Barrier => return Ok(Event::Barrier),
                LirOp::Phi { .. } => return Err(SimtError::StrayPhi { tid }),
                LirOp::Br { target } => {
                    enter(lir, f, t, tid, target.index as usize, args)?;
                    None
                }
                LirOp::CondBr {
                    cond,
                    then_block,
                    else_block,
                } => {
                    let taken = match operand(lir, t, tid, cond, args)? {
                        Val::Int(c) => c != 0,
                        other => {
                            return Err(SimtError::BadOperands {
                                tid,
                                op: "br",
                                lhs: other,
                                rhs: other,
                            })
                        }
                    };
                    let target = if taken { then_block } else { else_block };
                    enter(lir, f, t, tid, target.index as usize, args)?;
                    None
                }
                LirOp::Ret => return Ok(Event::Ret),
            };
            if let (Some(n), Some(v)) = (inst.result, result) {
                t.regs.insert(n, v);
            }
        }
    }
}

/// Jump to block `to`, evaluating its leading phis against the values
/// live at the end of the current block.
fn enter(
    lir: &LirModule,
    f: &LirFunction,
    t: &mut Thread,
    tid: i64,
    to: usize,
    args: &[Val],
) -> Result<(), SimtError> {
    let from = t.block;
    let mut updates = Vec::new();
    let mut pc = 0;
    for inst in &f.blocks[to].insts {
        let LirOp::Phi { incoming } = &inst.op else {
            break;
        };
        let (value, _) = incoming
            .iter()
            .find(|(_, b)| b.index as usize == from)
            .ok_or(SimtError::MissingIncoming { tid, from })?;
        if let Some(n) = inst.result {
            updates.push((n, operand(lir, t, tid, value, args)?));
        }
        pc += 1;
    }
    t.regs.extend(updates);
    t.block = to;
    t.pc = pc;
    Ok(())
}

fn operand(lir: &LirModule, t: &Thread, tid: i64, op: &Operand, args: &[Val]) -> Result<Val, SimtError> {
    match op {
        Operand::Value(n) => t
            .regs
            .get(n)
            .copied()
            .ok_or(SimtError::Undefined { tid, value: *n }),
        Operand::Param { index, .. } => Ok(args[*index as usize]),
        Operand::Int { value, .. } => Ok(Val::Int(*value)),
        Operand::Float { value, .. } => Ok(Val::Float(*value)),
        Operand::Global(name) => {
            let slot = lir.shared().iter().position(|(n, _)| n == name).unwrap_or(0);
            Ok(Val::Ptr {
                space: SHARED_ADDRSPACE,
                addr: (slot as i64) << 32,
            })
        }
    }
}

fn address(v: Val, tid: i64, op: &'static str) -> Result<(u8, i64), SimtError> {
    match v {
        Val::Ptr { space, addr } => Ok((space, addr)),
        other => Err(SimtError::BadOperands {
            tid,
            op,
            lhs: other,
            rhs: other,
        }),
    }
}

fn binary(op: BinaryOp, a: Val, b: Val, tid: i64) -> Result<Val, SimtError> {
    let bad = |name| SimtError::BadOperands {
        tid,
        op: name,
        lhs: a,
        rhs: b,
    };
    match (a, b) {
        (Val::Int(x), Val::Int(y)) => Ok(Val::Int(match op {
            BinaryOp::Add => x.wrapping_add(y),
            BinaryOp::Sub => x.wrapping_sub(y),
            BinaryOp::Mul => x.wrapping_mul(y),
            BinaryOp::Div => x.checked_div(y).ok_or_else(|| bad("sdiv"))?,
            BinaryOp::Rem => x.checked_rem(y).ok_or_else(|| bad("srem"))?,
        })),
        (Val::Float(x), Val::Float(y)) => Ok(Val::Float(match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Rem => x % y,
        })),
        _ => Err(bad(op.name())),
    }
}

fn compare(pred: CmpPred, a: Val, b: Val, tid: i64) -> Result<Val, SimtError> {
    let ord = match (a, b) {
        (Val::Int(x), Val::Int(y)) => x.partial_cmp(&y),
        (Val::Float(x), Val::Float(y)) => x.partial_cmp(&y),
        _ => None,
    };
    let Some(ord) = ord else {
        return Err(SimtError::BadOperands {
            tid,
            op: pred.name(),
            lhs: a,
            rhs: b,
        });
    };
    let holds = match pred {
        CmpPred::Lt => ord.is_lt(),
        CmpPred::Le => ord.is_le(),
        CmpPred::Gt => ord.is_gt(),
        CmpPred::Ge => ord.is_ge(),
        CmpPred::Eq => ord.is_eq(),
        CmpPred::Ne => ord.is_ne(),
    };
    Ok(Val::Int(holds as i64))
}

fn size_of(ty: LirType) -> i64 {
    match ty {
        LirType::Void => 0,
        LirType::Int(bits) => (i64::from(bits) + 7) / 8,
        LirType::Half => 2,
        LirType::Float => 4,
        LirType::Double => 8,
        LirType::Ptr { .. } => 8,
    }
}
