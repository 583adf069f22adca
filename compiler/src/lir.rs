//! LIR – per-lane scalar code produced by instruction selection.
//!
//! Selection never builds LIR data structures directly; it drives the
//! `ModuleBuilder` trait, so any backend that can declare functions and
//! append scalar instructions can receive its output. `LirModule` is the
//! in-crate implementation: it records everything and prints it as
//! LLVM-flavoured text (`define`, `phi`, `getelementptr`, address spaces
//! 1 = global and 3 = shared).

use std::fmt;

use crate::ir::{BinaryOp, CmpPred};

// ── Handles ────────────────────────────────────────────────────────────────

/// Interned LIR type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LirFunc(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LirBlock {
    pub func: u32,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Result of an appended instruction.
    Value(u32),
    Param { func: u32, index: u32 },
    Int { ty: TypeRef, value: i64 },
    Float { ty: TypeRef, value: f64 },
    /// Module-level symbol, e.g. a shared-memory array.
    Global(String),
}

// ── Types ──────────────────────────────────────────────────────────────────

pub const GLOBAL_ADDRSPACE: u8 = 1;
pub const SHARED_ADDRSPACE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LirType {
    Void,
    Int(u8),
    Half,
    Float,
    Double,
    Ptr { addrspace: u8 },
}

impl LirType {
    pub fn is_float(self) -> bool {
        matches!(self, LirType::Half | LirType::Float | LirType::Double)
    }
}

impl fmt::Display for LirType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LirType::Void => write!(f, "void"),
            LirType::Int(bits) => write!(f, "i{}", bits),
            LirType::Half => write!(f, "half"),
            LirType::Float => write!(f, "float"),
            LirType::Double => write!(f, "double"),
            LirType::Ptr { addrspace: 0 } => write!(f, "ptr"),
            LirType::Ptr { addrspace } => write!(f, "ptr addrspace({})", addrspace),
        }
    }
}

// ── Instructions ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialReg {
    /// Thread index within the block.
    ThreadId,
    /// Block index along a grid axis.
    BlockId(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LirOp {
    Binary {
        op: BinaryOp,
        lhs: Operand,
        rhs: Operand,
    },
    Cmp {
        pred: CmpPred,
        lhs: Operand,
        rhs: Operand,
    },
    Gep {
        elem: TypeRef,
        ptr: Operand,
        index: Operand,
    },
    Load {
        ptr: Operand,
    },
    Store {
        ptr: Operand,
        value: Operand,
    },
    /// `a * b + c` in one rounding.
    Fma {
        a: Operand,
        b: Operand,
        c: Operand,
    },
    Special(SpecialReg),
    Barrier,
    Phi {
        incoming: Vec<(Operand, LirBlock)>,
    },
    Br {
        target: LirBlock,
    },
    CondBr {
        cond: Operand,
        then_block: LirBlock,
        else_block: LirBlock,
    },
    Ret,
}

impl LirOp {
    fn has_result(&self) -> bool {
        !matches!(
            self,
            LirOp::Store { .. } | LirOp::Barrier | LirOp::Br { .. } | LirOp::CondBr { .. } | LirOp::Ret
        )
    }
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<(String, TypeRef)>,
    pub threads_per_block: u32,
}

// ── Builder interface ──────────────────────────────────────────────────────

/// Sink for instruction selection.
pub trait ModuleBuilder {
    fn declare_type(&mut self, ty: LirType) -> TypeRef;
    fn declare_function(&mut self, decl: FunctionDecl) -> LirFunc;
    /// Reserve `bytes` of shared memory under `name`; returns its address.
    fn declare_shared(&mut self, name: &str, bytes: u64) -> Operand;
    fn append_block(&mut self, func: LirFunc, name: &str) -> LirBlock;
    fn set_insert_point(&mut self, block: LirBlock);
    /// Append at the insert point. Returns the result operand; instructions
    /// without a result return `None`.
    fn append(&mut self, ty: TypeRef, op: LirOp) -> Option<Operand>;
    fn param(&self, func: LirFunc, index: u32) -> Operand;
    fn const_int(&mut self, ty: TypeRef, value: i64) -> Operand;
    fn const_float(&mut self, ty: TypeRef, value: f64) -> Operand;
    fn add_incoming(&mut self, phi: &Operand, value: Operand, block: LirBlock);
}

// ── In-crate module ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LirInst {
    pub result: Option<u32>,
    pub ty: TypeRef,
    pub op: LirOp,
}

#[derive(Debug, Clone)]
pub struct LirBlockData {
    pub name: String,
    pub insts: Vec<LirInst>,
}

#[derive(Debug, Clone)]
pub struct LirFunction {
    pub decl: FunctionDecl,
    pub blocks: Vec<LirBlockData>,
}

#[derive(Debug, Clone, Default)]
pub struct LirModule {
    pub name: String,
    /// Comment lines printed before any declaration.
    pub header: Vec<String>,
    types: Vec<LirType>,
    shared: Vec<(String, u64)>,
    functions: Vec<LirFunction>,
    /// Value number → (function, block, instruction).
    sites: Vec<(usize, usize, usize)>,
    value_types: Vec<TypeRef>,
    cursor: Option<LirBlock>,
}

impl LirModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn ty(&self, ty: TypeRef) -> LirType {
        self.types[ty.0 as usize]
    }

    pub fn functions(&self) -> &[LirFunction] {
        &self.functions
    }

    pub fn shared(&self) -> &[(String, u64)] {
        &self.shared
    }

    pub fn num_values(&self) -> usize {
        self.sites.len()
    }

    /// Count of instructions whose op satisfies `pred`, over all functions.
    pub fn count(&self, pred: impl Fn(&LirOp) -> bool) -> usize {
        self.functions
            .iter()
            .flat_map(|f| &f.blocks)
            .flat_map(|b| &b.insts)
            .filter(|i| pred(&i.op))
            .count()
    }

    pub fn operand_type(&self, op: &Operand) -> LirType {
        match op {
            Operand::Value(n) => self.ty(self.value_types[*n as usize]),
            Operand::Param { func, index } => {
                self.ty(self.functions[*func as usize].decl.params[*index as usize].1)
            }
            Operand::Int { ty, .. } | Operand::Float { ty, .. } => self.ty(*ty),
            Operand::Global(_) => LirType::Ptr {
                addrspace: SHARED_ADDRSPACE,
            },
        }
    }

    fn fmt_operand(&self, op: &Operand) -> String {
        match op {
            Operand::Value(n) => format!("%{}", n),
            Operand::Param { func, index } => {
                format!("%{}", self.functions[*func as usize].decl.params[*index as usize].0)
            }
            Operand::Int { value, .. } => value.to_string(),
            Operand::Float { value, .. } => format!("{:?}", value),
            Operand::Global(name) => format!("@{}", name),
        }
    }

    fn typed(&self, op: &Operand) -> String {
        format!("{} {}", self.operand_type(op), self.fmt_operand(op))
    }

    fn label(&self, block: LirBlock) -> String {
        let b = &self.functions[block.func as usize].blocks[block.index as usize];
        format!("{}{}", b.name, block.index)
    }

    fn fmt_inst(&self, f: &mut fmt::Formatter<'_>, inst: &LirInst) -> fmt::Result {
        write!(f, "  ")?;
        if let Some(n) = inst.result {
            write!(f, "%{} = ", n)?;
        }
        let ty = self.ty(inst.ty);
        match &inst.op {
            LirOp::Binary { op, lhs, rhs } => {
                let name = match (op, ty.is_float()) {
                    (BinaryOp::Add, false) => "add",
                    (BinaryOp::Sub, false) => "sub",
                    (BinaryOp::Mul, false) => "mul",
                    (BinaryOp::Div, false) => "sdiv",
                    (BinaryOp::Rem, false) => "srem",
                    (BinaryOp::Add, true) => "fadd",
                    (BinaryOp::Sub, true) => "fsub",
                    (BinaryOp::Mul, true) => "fmul",
                    (BinaryOp::Div, true) => "fdiv",
                    (BinaryOp::Rem, true) => "frem",
                };
                write!(f, "{} {} {}, {}", name, ty, self.fmt_operand(lhs), self.fmt_operand(rhs))
            }
            LirOp::Cmp { pred, lhs, rhs } => {
                let float = self.operand_type(lhs).is_float();
                let p = match (pred, float) {
                    (CmpPred::Lt, false) => "icmp slt",
                    (CmpPred::Le, false) => "icmp sle",
                    (CmpPred::Gt, false) => "icmp sgt",
                    (CmpPred::Ge, false) => "icmp sge",
                    (CmpPred::Eq, false) => "icmp eq",
                    (CmpPred::Ne, false) => "icmp ne",
                    (CmpPred::Lt, true) => "fcmp olt",
                    (CmpPred::Le, true) => "fcmp ole",
                    (CmpPred::Gt, true) => "fcmp ogt",
                    (CmpPred::Ge, true) => "fcmp oge",
                    (CmpPred::Eq, true) => "fcmp oeq",
                    (CmpPred::Ne, true) => "fcmp one",
                };
                write!(f, "{} {}, {}", p, self.typed(lhs), self.fmt_operand(rhs))
            }
            LirOp::Gep { elem, ptr, index } => write!(
                f,
                "getelementptr {}, {}, {}",
                self.ty(*elem),
                self.typed(ptr),
                self.typed(index)
            ),
            LirOp::Load { ptr } => write!(f, "load {}, {}", ty, self.typed(ptr)),
            LirOp::Store { ptr, value } => {
                write!(f, "store {}, {}", self.typed(value), self.typed(ptr))
            }
            LirOp::Fma { a, b, c } => write!(
                f,
                "call {} @llvm.fma.{}({}, {}, {})",
                ty,
                ty,
                self.typed(a),
                self.typed(b),
                self.typed(c)
            ),
            LirOp::Special(SpecialReg::ThreadId) => write!(f, "call i32 @tid.x()"),
            LirOp::Special(SpecialReg::BlockId(axis)) => {
                let dim = ["x", "y", "z"].get(*axis as usize).copied().unwrap_or("w");
                write!(f, "call i32 @ctaid.{}()", dim)
            }
            LirOp::Barrier => write!(f, "call void @barrier()"),
            LirOp::Phi { incoming } => {
                write!(f, "phi {}", ty)?;
                for (i, (v, b)) in incoming.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{}[ {}, %{} ]", sep, self.fmt_operand(v), self.label(*b))?;
                }
                Ok(())
            }
            LirOp::Br { target } => write!(f, "br label %{}", self.label(*target)),
            LirOp::CondBr {
                cond,
                then_block,
                else_block,
            } => write!(
                f,
                "br {}, label %{}, label %{}",
                self.typed(cond),
                self.label(*then_block),
                self.label(*else_block)
            ),
            LirOp::Ret => write!(f, "ret void"),
        }
    }
}

impl ModuleBuilder for LirModule {
    fn declare_type(&mut self, ty: LirType) -> TypeRef {
        if let Some(i) = self.types.iter().position(|&t| t == ty) {
            return TypeRef(i as u32);
        }
        self.types.push(ty);
        TypeRef(self.types.len() as u32 - 1)
    }

    fn declare_function(&mut self, decl: FunctionDecl) -> LirFunc {
        self.functions.push(LirFunction {
            decl,
            blocks: Vec::new(),
        });
        LirFunc(self.functions.len() as u32 - 1)
    }

    fn declare_shared(&mut self, name: &str, bytes: u64) -> Operand {
        self.shared.push((name.to_string(), bytes));
        Operand::Global(name.to_string())
    }

    fn append_block(&mut self, func: LirFunc, name: &str) -> LirBlock {
        let blocks = &mut self.functions[func.0 as usize].blocks;
        blocks.push(LirBlockData {
            name: name.to_string(),
            insts: Vec::new(),
        });
        LirBlock {
            func: func.0,
            index: blocks.len() as u32 - 1,
        }
    }

    fn set_insert_point(&mut self, block: LirBlock) {
        self.cursor = Some(block);
    }

    fn append(&mut self, ty: TypeRef, op: LirOp) -> Option<Operand> {
        let block = self.cursor.expect("append without an insert point");
        let (fi, bi) = (block.func as usize, block.index as usize);
        let result = op.has_result().then(|| {
            let n = self.sites.len() as u32;
            let pos = self.functions[fi].blocks[bi].insts.len();
            self.sites.push((fi, bi, pos));
            self.value_types.push(ty);
            n
        });
        self.functions[fi].blocks[bi]
            .insts
            .push(LirInst { result, ty, op });
        result.map(Operand::Value)
    }

    fn param(&self, func: LirFunc, index: u32) -> Operand {
        Operand::Param {
            func: func.0,
            index,
        }
    }

    fn const_int(&mut self, ty: TypeRef, value: i64) -> Operand {
        Operand::Int { ty, value }
    }

    fn const_float(&mut self, ty: TypeRef, value: f64) -> Operand {
        Operand::Float { ty, value }
    }

    fn add_incoming(&mut self, phi: &Operand, value: Operand, block: LirBlock) {
        let Operand::Value(n) = phi else {
            panic!("add_incoming on non-value operand {:?}", phi);
        };
        let (fi, bi, ii) = self.sites[*n as usize];
        match &mut self.functions[fi].blocks[bi].insts[ii].op {
            LirOp::Phi { incoming } => incoming.push((value, block)),
            other => panic!("add_incoming on non-phi {:?}", other),
        }
    }
}

impl fmt::Display for LirModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for line in &self.header {
            writeln!(f, "; {}", line)?;
        }
        for (name, bytes) in &self.shared {
            writeln!(
                f,
                "@{} = addrspace({}) global [{} x i8] undef, align 16",
                name, SHARED_ADDRSPACE, bytes
            )?;
        }
        for func in &self.functions {
            writeln!(f)?;
            let params: Vec<String> = func
                .decl
                .params
                .iter()
                .map(|(name, ty)| format!("{} %{}", self.ty(*ty), name))
                .collect();
            writeln!(
                f,
                "define void @{}({}) #{{ threads_per_block = {} }} {{",
                func.decl.name,
                params.join(", "),
                func.decl.threads_per_block
            )?;
            for (bi, block) in func.blocks.iter().enumerate() {
                if bi > 0 {
                    writeln!(f)?;
                }
                writeln!(f, "{}{}:", block.name, bi)?;
                for inst in &block.insts {
                    self.fmt_inst(f, inst)?;
                    writeln!(f)?;
                }
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_loop() -> LirModule {
        let mut m = LirModule::new("t");
        let i32t = m.declare_type(LirType::Int(32));
        let i1 = m.declare_type(LirType::Int(1));
        let void = m.declare_type(LirType::Void);
        let f = m.declare_function(FunctionDecl {
            name: "f".into(),
            params: vec![("n".into(), i32t)],
            threads_per_block: 32,
        });
        let entry = m.append_block(f, "entry");
        let header = m.append_block(f, "header");
        let exit = m.append_block(f, "exit");
        m.set_insert_point(entry);
        m.append(void, LirOp::Br { target: header });
        m.set_insert_point(header);
        let zero = m.const_int(i32t, 0);
        let i = m
            .append(
                i32t,
                LirOp::Phi {
                    incoming: vec![(zero, entry)],
                },
            )
            .unwrap();
        let one = m.const_int(i32t, 1);
        let next = m
            .append(
                i32t,
                LirOp::Binary {
                    op: BinaryOp::Add,
                    lhs: i.clone(),
                    rhs: one,
                },
            )
            .unwrap();
        m.add_incoming(&i, next.clone(), header);
        let n = m.param(f, 0);
        let c = m
            .append(
                i1,
                LirOp::Cmp {
                    pred: CmpPred::Lt,
                    lhs: next,
                    rhs: n,
                },
            )
            .unwrap();
        m.append(
            void,
            LirOp::CondBr {
                cond: c,
                then_block: header,
                else_block: exit,
            },
        );
        m.set_insert_point(exit);
        m.append(void, LirOp::Ret);
        m
    }

    #[test]
    fn types_are_interned() {
        let mut m = LirModule::new("t");
        let a = m.declare_type(LirType::Float);
        let b = m.declare_type(LirType::Float);
        assert_eq!(a, b);
        assert_ne!(a, m.declare_type(LirType::Double));
    }

    #[test]
    fn phi_incoming_added_after_the_fact() {
        let m = counter_loop();
        let text = m.to_string();
        assert!(text.contains("%0 = phi i32 [ 0, %entry0 ], [ %1, %header1 ]"), "{text}");
        assert!(text.contains("%2 = icmp slt i32 %1, %n"), "{text}");
        assert!(text.contains("br i1 %2, label %header1, label %exit2"), "{text}");
    }

    #[test]
    fn void_ops_have_no_result() {
        let m = counter_loop();
        assert_eq!(m.num_values(), 3);
        assert_eq!(m.count(|op| matches!(op, LirOp::Ret)), 1);
    }

    #[test]
    fn shared_and_pointer_printing() {
        let mut m = LirModule::new("t");
        let f32t = m.declare_type(LirType::Float);
        let void = m.declare_type(LirType::Void);
        let i32t = m.declare_type(LirType::Int(32));
        let sptr = m.declare_type(LirType::Ptr {
            addrspace: SHARED_ADDRSPACE,
        });
        let smem = m.declare_shared("smem", 2048);
        let f = m.declare_function(FunctionDecl {
            name: "k".into(),
            params: vec![],
            threads_per_block: 128,
        });
        let b = m.append_block(f, "entry");
        m.set_insert_point(b);
        let idx = m.const_int(i32t, 4);
        let p = m
            .append(
                sptr,
                LirOp::Gep {
                    elem: f32t,
                    ptr: smem,
                    index: idx,
                },
            )
            .unwrap();
        let v = m.append(f32t, LirOp::Load { ptr: p }).unwrap();
        assert_eq!(m.operand_type(&v), LirType::Float);
        m.append(void, LirOp::Ret);
        let text = m.to_string();
        assert!(text.contains("@smem = addrspace(3) global [2048 x i8] undef, align 16"));
        assert!(text.contains("getelementptr float, ptr addrspace(3) @smem, i32 4"), "{text}");
        assert!(text.contains("load float, ptr addrspace(3) %0"), "{text}");
        assert!(text.contains("threads_per_block = 128"));
    }
}
