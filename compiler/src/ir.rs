// ir.rs — Tile IR: context, types, values, instructions, blocks, module
//
// The `Context` owns every interned type and constant of one compilation.
// A `Module` owns its functions, blocks and values in flat arenas indexed by
// the ids in `id.rs`; operands and user lists are ids, so the def-use graph
// may be cyclic (loop phis) without any shared ownership.
//
// Preconditions: ids passed to a module were produced by that module (and
//                type/constant ids by the context it was built against).
// Postconditions: every instruction appears in exactly one block; every
//                 operand edge has a matching entry in the operand's users.
// Failure modes: out-of-range ids panic (programming error, not user input).
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use crate::id::{BlockId, ConstId, FuncId, GlobalId, TypeId, ValueId};
use crate::shape::ShapeDisplay;

// ── Types ──────────────────────────────────────────────────────────────────

/// A type interned in the `Context`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    /// Integer of the given bit width (1 for booleans).
    Int(u8),
    /// IEEE float of the given bit width.
    Float(u8),
    /// Pointer into global memory.
    Pointer { pointee: TypeId },
    /// Tile of scalars with a static shape. `elem` is never itself a tile.
    Tile { elem: TypeId, shape: Vec<u32> },
}

/// A constant interned in the `Context`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int { ty: TypeId, value: i64 },
    Float { ty: TypeId, value: f64 },
}

impl Constant {
    pub fn ty(&self) -> TypeId {
        match self {
            Constant::Int { ty, .. } | Constant::Float { ty, .. } => *ty,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Constant::Int { value, .. } => Some(*value),
            Constant::Float { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(TypeId, i64),
    Float(TypeId, u64),
}

/// Owner of interned types and singleton constants for one compilation.
#[derive(Debug, Default)]
pub struct Context {
    types: Vec<Type>,
    type_map: HashMap<Type, TypeId>,
    constants: Vec<Constant>,
    const_map: HashMap<ConstKey, ConstId>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a type, returning the existing id if it was seen before.
    pub fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(&id) = self.type_map.get(&ty) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty.clone());
        self.type_map.insert(ty, id);
        id
    }

    pub fn ty(&self, id: TypeId) -> &Type {
        &self.types[id.index()]
    }

    pub fn void_type(&mut self) -> TypeId {
        self.intern(Type::Void)
    }

    pub fn int_type(&mut self, bits: u8) -> TypeId {
        self.intern(Type::Int(bits))
    }

    pub fn float_type(&mut self, bits: u8) -> TypeId {
        self.intern(Type::Float(bits))
    }

    pub fn pointer_to(&mut self, pointee: TypeId) -> TypeId {
        let pointee = self.scalar_type(pointee);
        self.intern(Type::Pointer { pointee })
    }

    /// Tile of `elem` (or of `elem`'s scalar type if `elem` is a tile).
    pub fn tile(&mut self, elem: TypeId, shape: &[u32]) -> TypeId {
        let elem = self.scalar_type(elem);
        self.intern(Type::Tile {
            elem,
            shape: shape.to_vec(),
        })
    }

    /// The scalar type of `ty` with the given shape (`None` = scalar).
    pub fn with_shape(&mut self, ty: TypeId, shape: Option<&[u32]>) -> TypeId {
        match shape {
            Some(s) => self.tile(ty, s),
            None => self.scalar_type(ty),
        }
    }

    /// Element type of a tile, or the type itself for scalars.
    pub fn scalar_type(&self, ty: TypeId) -> TypeId {
        match self.ty(ty) {
            Type::Tile { elem, .. } => *elem,
            _ => ty,
        }
    }

    pub fn shape(&self, ty: TypeId) -> Option<&[u32]> {
        match self.ty(ty) {
            Type::Tile { shape, .. } => Some(shape),
            _ => None,
        }
    }

    pub fn is_tile(&self, ty: TypeId) -> bool {
        matches!(self.ty(ty), Type::Tile { .. })
    }

    pub fn is_pointer(&self, ty: TypeId) -> bool {
        matches!(self.ty(self.scalar_type(ty)), Type::Pointer { .. })
    }

    pub fn is_float(&self, ty: TypeId) -> bool {
        matches!(self.ty(self.scalar_type(ty)), Type::Float(_))
    }

    pub fn is_int(&self, ty: TypeId) -> bool {
        matches!(self.ty(self.scalar_type(ty)), Type::Int(_))
    }

    /// Pointee of a pointer or of a tile of pointers.
    pub fn pointee(&self, ty: TypeId) -> Option<TypeId> {
        match self.ty(self.scalar_type(ty)) {
            Type::Pointer { pointee } => Some(*pointee),
            _ => None,
        }
    }

    /// Storage size in bytes; tiles count every element. `None` when the
    /// size overflows a u64.
    pub fn size_in_bytes(&self, ty: TypeId) -> Option<u64> {
        match self.ty(ty) {
            Type::Void => Some(0),
            Type::Int(bits) | Type::Float(bits) => Some((*bits as u64).div_ceil(8)),
            Type::Pointer { .. } => Some(8),
            Type::Tile { elem, shape } => self
                .size_in_bytes(*elem)?
                .checked_mul(crate::shape::num_elements(shape)?),
        }
    }

    pub fn const_int(&mut self, ty: TypeId, value: i64) -> ConstId {
        self.intern_const(ConstKey::Int(ty, value), Constant::Int { ty, value })
    }

    pub fn const_float(&mut self, ty: TypeId, value: f64) -> ConstId {
        self.intern_const(
            ConstKey::Float(ty, value.to_bits()),
            Constant::Float { ty, value },
        )
    }

    fn intern_const(&mut self, key: ConstKey, c: Constant) -> ConstId {
        if let Some(&id) = self.const_map.get(&key) {
            return id;
        }
        let id = ConstId(self.constants.len() as u32);
        self.constants.push(c);
        self.const_map.insert(key, id);
        id
    }

    pub fn constant(&self, id: ConstId) -> &Constant {
        &self.constants[id.index()]
    }

    pub fn num_types(&self) -> usize {
        self.types.len()
    }

    /// Human-readable type name, e.g. `fp32*[32, 8]`.
    pub fn type_name(&self, ty: TypeId) -> String {
        match self.ty(ty) {
            Type::Void => "void".to_string(),
            Type::Int(bits) => format!("i{}", bits),
            Type::Float(bits) => format!("fp{}", bits),
            Type::Pointer { pointee } => format!("{}*", self.type_name(*pointee)),
            Type::Tile { elem, shape } => {
                format!("{}{}", self.type_name(*elem), ShapeDisplay(shape))
            }
        }
    }
}

// ── Instructions ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Rem => "rem",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpPred {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpPred {
    pub fn name(self) -> &'static str {
        match self {
            CmpPred::Lt => "lt",
            CmpPred::Le => "le",
            CmpPred::Gt => "gt",
            CmpPred::Ge => "ge",
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
        }
    }
}

/// One case per operator kind. Tile shapes live in the result type.
#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    /// Elementwise arithmetic over operands of identical shape.
    Binary {
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Elementwise comparison producing `i1`.
    Cmp {
        pred: CmpPred,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Pointer plus element offset.
    Gep { ptr: ValueId, offset: ValueId },
    Load { ptr: ValueId },
    Store { ptr: ValueId, value: ValueId },
    /// Ascending integers `start, start+1, ...` over a 1-D tile.
    Range { start: i64 },
    /// `block_coord(axis) * n + [0, n)` over a 1-D tile of extent n.
    GlobalRange { axis: u32 },
    /// Scalar replicated over a tile.
    Splat { value: ValueId },
    /// Insert or remove unit axes.
    Reshape { value: ValueId },
    /// Stretch unit axes to the result extents.
    Broadcast { value: ValueId },
    /// `acc + a[M,K] x b[K,N]`.
    Dot {
        a: ValueId,
        b: ValueId,
        acc: ValueId,
    },
    /// Stage a tile into on-chip shared memory.
    CopyToShared { value: ValueId },
    Phi { incoming: Vec<(ValueId, BlockId)> },
    Br { target: BlockId },
    CondBr {
        cond: ValueId,
        then_block: BlockId,
        else_block: BlockId,
    },
    Return,
}

impl InstKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstKind::Binary { op, .. } => op.name(),
            InstKind::Cmp { .. } => "cmp",
            InstKind::Gep { .. } => "gep",
            InstKind::Load { .. } => "load",
            InstKind::Store { .. } => "store",
            InstKind::Range { .. } => "range",
            InstKind::GlobalRange { .. } => "get_global_range",
            InstKind::Splat { .. } => "splat",
            InstKind::Reshape { .. } => "reshape",
            InstKind::Broadcast { .. } => "broadcast",
            InstKind::Dot { .. } => "dot",
            InstKind::CopyToShared { .. } => "copy_to_shared",
            InstKind::Phi { .. } => "phi",
            InstKind::Br { .. } => "br",
            InstKind::CondBr { .. } => "cond_br",
            InstKind::Return => "ret",
        }
    }

    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            InstKind::Binary { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Gep { ptr, offset } => vec![*ptr, *offset],
            InstKind::Load { ptr } => vec![*ptr],
            InstKind::Store { ptr, value } => vec![*ptr, *value],
            InstKind::Range { .. } | InstKind::GlobalRange { .. } => Vec::new(),
            InstKind::Splat { value }
            | InstKind::Reshape { value }
            | InstKind::Broadcast { value }
            | InstKind::CopyToShared { value } => vec![*value],
            InstKind::Dot { a, b, acc } => vec![*a, *b, *acc],
            InstKind::Phi { incoming } => incoming.iter().map(|(v, _)| *v).collect(),
            InstKind::CondBr { cond, .. } => vec![*cond],
            InstKind::Br { .. } | InstKind::Return => Vec::new(),
        }
    }

    /// Visit every operand slot mutably.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueId)) {
        match self {
            InstKind::Binary { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Gep { ptr, offset } => {
                f(ptr);
                f(offset);
            }
            InstKind::Load { ptr } => f(ptr),
            InstKind::Store { ptr, value } => {
                f(ptr);
                f(value);
            }
            InstKind::Range { .. } | InstKind::GlobalRange { .. } => {}
            InstKind::Splat { value }
            | InstKind::Reshape { value }
            | InstKind::Broadcast { value }
            | InstKind::CopyToShared { value } => f(value),
            InstKind::Dot { a, b, acc } => {
                f(a);
                f(b);
                f(acc);
            }
            InstKind::Phi { incoming } => {
                for (v, _) in incoming {
                    f(v);
                }
            }
            InstKind::CondBr { cond, .. } => f(cond),
            InstKind::Br { .. } | InstKind::Return => {}
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. } | InstKind::CondBr { .. } | InstKind::Return
        )
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br { target } => vec![*target],
            InstKind::CondBr {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            _ => Vec::new(),
        }
    }

    /// True if the instruction produces no value.
    pub fn is_void(&self) -> bool {
        self.is_terminator() || matches!(self, InstKind::Store { .. })
    }
}

// ── Values ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Instruction {
    pub block: BlockId,
    pub op: InstKind,
}

#[derive(Debug, Clone)]
pub enum ValueKind {
    Argument { func: FuncId, index: u32 },
    Constant(ConstId),
    Inst(Instruction),
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: TypeId,
    /// Diagnostic name only.
    pub name: Option<String>,
    pub kind: ValueKind,
    users: Vec<ValueId>,
}

impl ValueData {
    pub fn users(&self) -> &[ValueId] {
        &self.users
    }

    pub fn inst(&self) -> Option<&Instruction> {
        match &self.kind {
            ValueKind::Inst(inst) => Some(inst),
            _ => None,
        }
    }
}

// ── Blocks, functions, globals ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub name: String,
    pub func: FuncId,
    pub insts: Vec<ValueId>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub ret: TypeId,
    pub args: Vec<ValueId>,
    pub blocks: Vec<BlockId>,
}

/// Module-scope scalar declaration, e.g. `int32 TM = 32;`.
#[derive(Debug, Clone)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: TypeId,
    pub init: Option<ConstId>,
}

// ── Module ─────────────────────────────────────────────────────────────────

/// Unit handed between pipeline stages.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    values: Vec<ValueData>,
    blocks: Vec<BasicBlock>,
    functions: Vec<Function>,
    globals: Vec<GlobalDecl>,
    const_values: HashMap<ConstId, ValueId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            blocks: Vec::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            const_values: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.globals.is_empty()
    }

    // ── Declarations ──

    pub fn add_global(&mut self, name: impl Into<String>, ty: TypeId, init: Option<ConstId>) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(GlobalDecl {
            name: name.into(),
            ty,
            init,
        });
        id
    }

    pub fn globals(&self) -> &[GlobalDecl] {
        &self.globals
    }

    pub fn add_function(&mut self, name: impl Into<String>, ret: TypeId) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(Function {
            name: name.into(),
            ret,
            args: Vec::new(),
            blocks: Vec::new(),
        });
        id
    }

    pub fn add_argument(&mut self, func: FuncId, name: impl Into<String>, ty: TypeId) -> ValueId {
        let index = self.functions[func.index()].args.len() as u32;
        let id = self.push_value(ty, Some(name.into()), ValueKind::Argument { func, index });
        self.functions[func.index()].args.push(id);
        id
    }

    pub fn add_block(&mut self, func: FuncId, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            name: name.into(),
            func,
            insts: Vec::new(),
        });
        self.functions[func.index()].blocks.push(id);
        id
    }

    /// Module-level reference to a context constant (one per constant).
    pub fn constant(&mut self, ctx: &Context, c: ConstId) -> ValueId {
        if let Some(&v) = self.const_values.get(&c) {
            return v;
        }
        let ty = ctx.constant(c).ty();
        let v = self.push_value(ty, None, ValueKind::Constant(c));
        self.const_values.insert(c, v);
        v
    }

    // ── Instruction insertion ──

    pub fn append_inst(&mut self, block: BlockId, ty: TypeId, op: InstKind, name: Option<String>) -> ValueId {
        let pos = self.blocks[block.index()].insts.len();
        self.insert_inst(block, pos, ty, op, name)
    }

    pub fn insert_inst(
        &mut self,
        block: BlockId,
        position: usize,
        ty: TypeId,
        op: InstKind,
        name: Option<String>,
    ) -> ValueId {
        let operands = op.operands();
        let id = self.push_value(ty, name, ValueKind::Inst(Instruction { block, op }));
        for operand in operands {
            self.add_user(operand, id);
        }
        self.blocks[block.index()].insts.insert(position, id);
        id
    }

    /// Insert right after `anchor`'s definition. Anchors that are phis are
    /// moved past the block's phi group so phis stay first.
    pub fn insert_after(&mut self, anchor: ValueId, ty: TypeId, op: InstKind, name: Option<String>) -> ValueId {
        let block = self
            .inst(anchor)
            .map(|i| i.block)
            .expect("insert_after anchor must be an instruction");
        let insts = &self.blocks[block.index()].insts;
        let mut pos = insts
            .iter()
            .position(|&v| v == anchor)
            .map(|p| p + 1)
            .unwrap_or(insts.len());
        while pos < insts.len() && matches!(self.op(insts[pos]), Some(InstKind::Phi { .. })) {
            pos += 1;
        }
        self.insert_inst(block, pos, ty, op, name)
    }

    fn push_value(&mut self, ty: TypeId, name: Option<String>, kind: ValueKind) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData {
            ty,
            name,
            kind,
            users: Vec::new(),
        });
        id
    }

    fn add_user(&mut self, value: ValueId, user: ValueId) {
        let users = &mut self.values[value.index()].users;
        if !users.contains(&user) {
            users.push(user);
        }
    }

    pub fn set_name(&mut self, id: ValueId, name: impl Into<String>) {
        self.values[id.index()].name = Some(name.into());
    }

    pub fn add_phi_incoming(&mut self, phi: ValueId, value: ValueId, block: BlockId) {
        match &mut self.values[phi.index()].kind {
            ValueKind::Inst(Instruction {
                op: InstKind::Phi { incoming },
                ..
            }) => incoming.push((value, block)),
            _ => panic!("add_phi_incoming on non-phi {}", phi),
        }
        self.add_user(value, phi);
    }

    /// Rewrite every operand slot of `user` that refers to `old`.
    pub fn replace_operand(&mut self, user: ValueId, old: ValueId, new: ValueId) {
        if let ValueKind::Inst(inst) = &mut self.values[user.index()].kind {
            inst.op.for_each_operand_mut(|v| {
                if *v == old {
                    *v = new;
                }
            });
        }
        self.values[old.index()].users.retain(|&u| u != user);
        self.add_user(new, user);
    }

    // ── Queries ──

    pub fn functions(&self) -> impl Iterator<Item = FuncId> + '_ {
        (0..self.functions.len() as u32).map(FuncId)
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn ty(&self, id: ValueId) -> TypeId {
        self.values[id.index()].ty
    }

    pub fn users(&self, id: ValueId) -> &[ValueId] {
        &self.values[id.index()].users
    }

    pub fn inst(&self, id: ValueId) -> Option<&Instruction> {
        self.values[id.index()].inst()
    }

    pub fn op(&self, id: ValueId) -> Option<&InstKind> {
        self.inst(id).map(|i| &i.op)
    }

    pub fn const_of(&self, id: ValueId) -> Option<ConstId> {
        match self.values[id.index()].kind {
            ValueKind::Constant(c) => Some(c),
            _ => None,
        }
    }

    /// All instructions of a function in block order.
    pub fn instructions(&self, func: FuncId) -> Vec<ValueId> {
        self.functions[func.index()]
            .blocks
            .iter()
            .flat_map(|b| self.blocks[b.index()].insts.iter().copied())
            .collect()
    }

    pub fn terminator(&self, block: BlockId) -> Option<ValueId> {
        let last = *self.blocks[block.index()].insts.last()?;
        self.op(last)
            .filter(|op| op.is_terminator())
            .map(|_| last)
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.terminator(block)
            .and_then(|t| self.op(t))
            .map(|op| op.successors())
            .unwrap_or_default()
    }

    /// Printable name of a value: `%name.N` or `%N`.
    pub fn value_name(&self, id: ValueId) -> String {
        match &self.values[id.index()].name {
            Some(name) => format!("%{}.{}", name, id.0),
            None => format!("%{}", id.0),
        }
    }

    pub fn block_label(&self, id: BlockId) -> String {
        format!("{}.{}", self.blocks[id.index()].name, id.0)
    }

    pub fn display<'a>(&'a self, ctx: &'a Context) -> ModuleDisplay<'a> {
        ModuleDisplay { module: self, ctx }
    }
}

// ── Printing ───────────────────────────────────────────────────────────────

pub struct ModuleDisplay<'a> {
    module: &'a Module,
    ctx: &'a Context,
}

impl ModuleDisplay<'_> {
    fn operand(&self, v: ValueId) -> String {
        match self.module.value(v).kind {
            ValueKind::Constant(c) => match self.ctx.constant(c) {
                Constant::Int { value, .. } => value.to_string(),
                Constant::Float { value, .. } => format!("{:?}", value),
            },
            _ => self.module.value_name(v),
        }
    }

    fn write_inst(&self, f: &mut fmt::Formatter<'_>, id: ValueId) -> fmt::Result {
        let m = self.module;
        let Some(inst) = m.inst(id) else {
            return Ok(());
        };
        write!(f, "  ")?;
        if !inst.op.is_void() {
            write!(f, "{} = ", m.value_name(id))?;
        }
        let o = |v: &ValueId| self.operand(*v);
        match &inst.op {
            InstKind::Binary { op, lhs, rhs } => write!(f, "{} {}, {}", op.name(), o(lhs), o(rhs))?,
            InstKind::Cmp { pred, lhs, rhs } => write!(f, "cmp {} {}, {}", pred.name(), o(lhs), o(rhs))?,
            InstKind::Gep { ptr, offset } => write!(f, "gep {}, {}", o(ptr), o(offset))?,
            InstKind::Load { ptr } => write!(f, "load {}", o(ptr))?,
            InstKind::Store { ptr, value } => write!(f, "store {}, {}", o(ptr), o(value))?,
            InstKind::Range { start } => write!(f, "range {}", start)?,
            InstKind::GlobalRange { axis } => write!(f, "get_global_range({})", axis)?,
            InstKind::Splat { value } => write!(f, "splat {}", o(value))?,
            InstKind::Reshape { value } => write!(f, "reshape {}", o(value))?,
            InstKind::Broadcast { value } => write!(f, "broadcast {}", o(value))?,
            InstKind::Dot { a, b, acc } => write!(f, "dot {}, {}, {}", o(a), o(b), o(acc))?,
            InstKind::CopyToShared { value } => write!(f, "copy_to_shared {}", o(value))?,
            InstKind::Phi { incoming } => {
                write!(f, "phi")?;
                for (i, (v, b)) in incoming.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{}[{}, {}]", sep, o(v), m.block_label(*b))?;
                }
            }
            InstKind::Br { target } => write!(f, "br {}", m.block_label(*target))?,
            InstKind::CondBr {
                cond,
                then_block,
                else_block,
            } => write!(
                f,
                "cond_br {}, {}, {}",
                o(cond),
                m.block_label(*then_block),
                m.block_label(*else_block)
            )?,
            InstKind::Return => write!(f, "ret")?,
        }
        if !inst.op.is_void() {
            write!(f, " : {}", self.ctx.type_name(m.ty(id)))?;
        }
        writeln!(f)
    }
}

impl fmt::Display for ModuleDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.module;
        writeln!(f, "module {}", m.name)?;
        for g in &m.globals {
            write!(f, "global {}: {}", g.name, self.ctx.type_name(g.ty))?;
            if let Some(c) = g.init.and_then(|c| self.ctx.constant(c).as_int()) {
                write!(f, " = {}", c)?;
            }
            writeln!(f)?;
        }
        for func in &m.functions {
            writeln!(f)?;
            write!(f, "def {} {}(", self.ctx.type_name(func.ret), func.name)?;
            for (i, &arg) in func.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{} {}", self.ctx.type_name(m.ty(arg)), m.value_name(arg))?;
            }
            writeln!(f, ") {{")?;
            for &b in &func.blocks {
                writeln!(f, "{}:", m.block_label(b))?;
                for &inst in &m.block(b).insts {
                    self.write_inst(f, inst)?;
                }
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
