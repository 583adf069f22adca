// select.rs — Instruction selection: tile IR to per-lane scalar code
//
// Each tile value becomes the list of elements one lane holds, ordered
// row-major over the per-lane index of every axis. Along an axis with
// layout (nts, mts, wpt), per-lane element `j` of a lane sits at
//
//     base + (j / nts) · (nts · mts · wpt) + j % nts
//     base = ((warp / warp_stride % wpt) · mts + lane / lane_stride % mts) · nts
//
// The `base` of every layout class is computed once in the entry block.
// Staged tiles live in shared memory and are represented by their byte
// offset; reductions read them there. Double-buffered copies alternate
// regions through `next = first + second - current`.
//
// Preconditions: allocation succeeded for the same module and copies.
// Postconditions: one LIR function per IR function, blocks in reverse
//                 post-order, every phi completed with all incomings.
// Failure modes: `LoweringError::Unsupported` for tiles without a dividing
//                layout, unstaged reduction operands, tile arguments, and
//                element types the target lacks.
// Side effects: appends to the builder.

use std::collections::{BTreeSet, HashMap};

use log::{debug, trace};

use crate::allocation::Allocation;
use crate::error::LoweringError;
use crate::id::{BlockId, FuncId, TypeId, ValueId};
use crate::ir::{BinaryOp, Constant, Context, InstKind, Module, Type};
use crate::lir::{
    FunctionDecl, LirBlock, LirFunc, LirOp, LirType, ModuleBuilder, Operand, SpecialReg, TypeRef,
    GLOBAL_ADDRSPACE, SHARED_ADDRSPACE,
};
use crate::liveness::reverse_post_order;
use crate::shape;
use crate::shared::SharedCopies;
use crate::tune::{AxisLayout, Tuner};

/// Name of the shared-memory array every staged tile lives in.
pub const SHARED_SYMBOL: &str = "smem";

/// Inputs selection reads; all produced by earlier passes.
pub struct SelectInput<'a> {
    pub module: &'a Module,
    pub ctx: &'a Context,
    pub tuner: &'a Tuner,
    pub copies: &'a SharedCopies,
    pub alloc: &'a Allocation,
}

pub fn select<B: ModuleBuilder>(input: &SelectInput<'_>, builder: &mut B) -> Result<(), LoweringError> {
    let smem = builder.declare_shared(SHARED_SYMBOL, input.alloc.peak());
    let layouts = input.tuner.class_layouts();
    let i32t = builder.declare_type(LirType::Int(32));
    for func in input.module.functions() {
        FunctionSelector {
            input,
            b: &mut *builder,
            smem: smem.clone(),
            i32t,
            layouts: &layouts,
            func,
            lir_func: LirFunc(0),
            values: HashMap::new(),
            blocks: HashMap::new(),
            bases: HashMap::new(),
            block_ids: HashMap::new(),
            pending_phis: Vec::new(),
        }
        .run()?;
    }
    debug!("select: {} function(s) lowered", input.module.functions().count());
    Ok(())
}

#[derive(Debug, Clone)]
enum Lowered {
    Scalar(Operand),
    Tile(Vec<Operand>),
    /// Tile resident in shared memory, by byte offset into `smem`.
    Shared(Operand),
}

struct FunctionSelector<'a, B> {
    input: &'a SelectInput<'a>,
    b: &'a mut B,
    smem: Operand,
    i32t: TypeRef,
    layouts: &'a [AxisLayout],
    func: FuncId,
    lir_func: LirFunc,
    values: HashMap<ValueId, Lowered>,
    blocks: HashMap<BlockId, LirBlock>,
    /// Layout class → first element index of this lane along the axis.
    bases: HashMap<usize, Operand>,
    block_ids: HashMap<u32, Operand>,
    /// IR phi → LIR phis awaiting incomings.
    pending_phis: Vec<(ValueId, Vec<Operand>)>,
}

impl<B: ModuleBuilder> FunctionSelector<'_, B> {
    fn run(&mut self) -> Result<(), LoweringError> {
        let module = self.input.module;
        let function = module.function(self.func);

        let mut params = Vec::new();
        for &arg in &function.args {
            let ty = module.ty(arg);
            let lty = self.scalar_lir_type(ty).ok_or_else(|| LoweringError::Unsupported {
                kind: "argument",
                shape: shape::describe(self.input.ctx.shape(ty)),
                reason: format!("{} cannot be passed to a kernel", module.value_name(arg)),
            })?;
            let tref = self.b.declare_type(lty);
            let name = module.value(arg).name.clone().unwrap_or_else(|| format!("arg{}", arg.0));
            params.push((name, tref));
        }
        self.lir_func = self.b.declare_function(FunctionDecl {
            name: function.name.clone(),
            params,
            threads_per_block: self.input.tuner.threads_per_block(self.func),
        });
        for (i, &arg) in function.args.iter().enumerate() {
            let p = self.b.param(self.lir_func, i as u32);
            self.values.insert(arg, Lowered::Scalar(p));
        }

        let order = reverse_post_order(module, self.func);
        for &block in &order {
            let lb = self.b.append_block(self.lir_func, &module.block(block).name);
            self.blocks.insert(block, lb);
        }
        let Some(&entry) = order.first() else {
            return Ok(());
        };
        self.b.set_insert_point(self.blocks[&entry]);
        self.prologue()?;

        for &block in &order {
            self.b.set_insert_point(self.blocks[&block]);
            for &v in &module.block(block).insts {
                self.lower(v)?;
            }
        }
        self.complete_phis()
    }

    // ── Lane coordinates ──

    fn prologue(&mut self) -> Result<(), LoweringError> {
        let i32t = self.i32t;
        let tid = self.emit(i32t, LirOp::Special(SpecialReg::ThreadId), "thread id")?;
        let warp_size = self.i32(self.input.tuner.warp_size() as i64);
        let lane = self.arith(BinaryOp::Rem, tid.clone(), warp_size.clone())?;
        let warp = self.arith(BinaryOp::Div, tid, warp_size)?;

        let classes: Vec<usize> = self
            .input
            .tuner
            .classes()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.func == self.func && c.params.is_some())
            .map(|(i, _)| i)
            .collect();
        for c in classes {
            let l = self.layouts[c];
            let lane_c = self.digit(lane.clone(), l.lane_stride, l.mts)?;
            let warp_c = self.digit(warp.clone(), l.warp_stride, l.wpt)?;
            let scaled = self.arith(BinaryOp::Mul, warp_c, self.i32(l.mts as i64))?;
            let sum = self.arith(BinaryOp::Add, scaled, lane_c)?;
            let base = self.arith(BinaryOp::Mul, sum, self.i32(l.nts as i64))?;
            trace!("select: class {} base {:?}", c, base);
            self.bases.insert(c, base);
        }

        let axes: BTreeSet<u32> = self
            .input
            .module
            .instructions(self.func)
            .into_iter()
            .filter_map(|v| match self.input.module.op(v) {
                Some(InstKind::GlobalRange { axis }) => Some(*axis),
                _ => None,
            })
            .collect();
        for axis in axes {
            let id = self.emit(i32t, LirOp::Special(SpecialReg::BlockId(axis)), "block id")?;
            self.block_ids.insert(axis, id);
        }
        Ok(())
    }

    /// `(id / stride) % radix`.
    fn digit(&mut self, id: Operand, stride: u32, radix: u32) -> Result<Operand, LoweringError> {
        let q = self.arith(BinaryOp::Div, id, self.i32(stride as i64))?;
        self.arith(BinaryOp::Rem, q, self.i32(radix as i64))
    }

    // ── Layout helpers ──

    /// Layout class and resolved layout of every axis of `v`.
    fn tile_layout(&self, v: ValueId) -> Result<Vec<(Option<usize>, AxisLayout)>, LoweringError> {
        let shape = self.shape_of(v).unwrap_or_default();
        let mut out = Vec::with_capacity(shape.len());
        for (axis, &extent) in shape.iter().enumerate() {
            if extent == 1 {
                out.push((None, AxisLayout::FIXED));
                continue;
            }
            let class = self
                .input
                .tuner
                .class_of(v, axis as u32)
                .ok_or_else(|| self.unsupported(v, format!("axis {} has no layout", axis)))?;
            let layout = self.layouts[class];
            let span = layout.span();
            if span == 0 || extent % span != 0 {
                return Err(self.unsupported(
                    v,
                    format!(
                        "layout of axis {} covers {} elements, which does not divide {}",
                        axis, span, extent
                    ),
                ));
            }
            out.push((Some(class), layout));
        }
        Ok(out)
    }

    fn per_lane_counts(layout: &[(Option<usize>, AxisLayout)]) -> Vec<u32> {
        layout.iter().map(|(_, l)| l.per_lane()).collect()
    }

    /// Number of elements `v` holds per lane; 1 for scalars.
    fn count(&self, v: ValueId) -> Result<usize, LoweringError> {
        if self.shape_of(v).is_none() {
            return Ok(1);
        }
        let layout = self.tile_layout(v)?;
        Ok(Self::per_lane_counts(&layout).iter().map(|&n| n as usize).product())
    }

    /// Index along one axis of this lane's per-lane element `j`.
    fn axis_index(
        &mut self,
        (class, layout): (Option<usize>, AxisLayout),
        j: u32,
    ) -> Result<Operand, LoweringError> {
        let Some(class) = class else {
            return Ok(self.i32(0));
        };
        let offset = (j / layout.nts) * layout.span() + j % layout.nts;
        let base = self.bases.get(&class).cloned().unwrap_or_else(|| self.i32(0));
        self.arith(BinaryOp::Add, base, self.i32(offset as i64))
    }

    /// Tile coordinates of per-lane element `flat` of a tile with `layout`.
    fn coords(
        &mut self,
        layout: &[(Option<usize>, AxisLayout)],
        flat: usize,
    ) -> Result<Vec<Operand>, LoweringError> {
        let counts = Self::per_lane_counts(layout);
        let idx = unflatten(flat, &counts);
        layout
            .iter()
            .zip(idx)
            .map(|(&axis, j)| self.axis_index(axis, j))
            .collect()
    }

    /// Row-major linear element index of `coords` in a tile of `shape`.
    fn linearize(&mut self, coords: &[Operand], shape: &[u32]) -> Result<Operand, LoweringError> {
        let mut lin = self.i32(0);
        for (c, &extent) in coords.iter().zip(shape) {
            let scaled = self.arith(BinaryOp::Mul, lin, self.i32(extent as i64))?;
            lin = self.arith(BinaryOp::Add, scaled, c.clone())?;
        }
        Ok(lin)
    }

    // ── Emission helpers ──

    fn emit(&mut self, ty: TypeRef, op: LirOp, what: &'static str) -> Result<Operand, LoweringError> {
        self.b.append(ty, op).ok_or_else(|| LoweringError::Unsupported {
            kind: what,
            shape: "scalar".to_string(),
            reason: "builder produced no result".to_string(),
        })
    }

    fn emit_void(&mut self, op: LirOp) {
        let void = self.b.declare_type(LirType::Void);
        let _ = self.b.append(void, op);
    }

    fn i32(&self, value: i64) -> Operand {
        Operand::Int {
            ty: self.i32t,
            value,
        }
    }

    /// Integer index arithmetic with constant folding and identities.
    fn arith(&mut self, op: BinaryOp, lhs: Operand, rhs: Operand) -> Result<Operand, LoweringError> {
        let konst = |o: &Operand| match o {
            Operand::Int { value, .. } => Some(*value),
            _ => None,
        };
        match (op, konst(&lhs), konst(&rhs)) {
            (_, Some(a), Some(b)) => {
                let v = match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div if b != 0 => a / b,
                    BinaryOp::Rem if b != 0 => a % b,
                    _ => return Err(self.index_error("division by zero")),
                };
                return Ok(self.i32(v));
            }
            (BinaryOp::Add, Some(0), _) => return Ok(rhs),
            (BinaryOp::Add | BinaryOp::Sub, _, Some(0)) => return Ok(lhs),
            (BinaryOp::Mul, Some(0), _) | (BinaryOp::Mul, _, Some(0)) => return Ok(self.i32(0)),
            (BinaryOp::Mul, Some(1), _) => return Ok(rhs),
            (BinaryOp::Mul | BinaryOp::Div, _, Some(1)) => return Ok(lhs),
            (BinaryOp::Rem, _, Some(1)) => return Ok(self.i32(0)),
            _ => {}
        }
        self.emit(self.i32t, LirOp::Binary { op, lhs, rhs }, "index")
    }

    fn index_error(&self, reason: &str) -> LoweringError {
        LoweringError::Unsupported {
            kind: "index",
            shape: "scalar".to_string(),
            reason: reason.to_string(),
        }
    }

    fn shared_ptr(&mut self, offset: Operand) -> Result<Operand, LoweringError> {
        let i8t = self.b.declare_type(LirType::Int(8));
        let sptr = self.b.declare_type(LirType::Ptr {
            addrspace: SHARED_ADDRSPACE,
        });
        let smem = self.smem.clone();
        self.emit(
            sptr,
            LirOp::Gep {
                elem: i8t,
                ptr: smem,
                index: offset,
            },
            "copy_to_shared",
        )
    }

    // ── Types and errors ──

    fn shape_of(&self, v: ValueId) -> Option<Vec<u32>> {
        self.input
            .ctx
            .shape(self.input.module.ty(v))
            .map(|s| s.to_vec())
    }

    fn scalar_lir_type(&self, ty: TypeId) -> Option<LirType> {
        match self.input.ctx.ty(ty) {
            Type::Void => Some(LirType::Void),
            Type::Int(bits) => Some(LirType::Int(*bits)),
            Type::Float(16) => Some(LirType::Half),
            Type::Float(32) => Some(LirType::Float),
            Type::Float(64) => Some(LirType::Double),
            Type::Float(_) => None,
            Type::Pointer { .. } => Some(LirType::Ptr {
                addrspace: GLOBAL_ADDRSPACE,
            }),
            Type::Tile { .. } => None,
        }
    }

    /// LIR type of one element of `v`.
    fn elem_type(&mut self, v: ValueId) -> Result<TypeRef, LoweringError> {
        let scalar = self.input.ctx.scalar_type(self.input.module.ty(v));
        let lty = self
            .scalar_lir_type(scalar)
            .ok_or_else(|| self.unsupported(v, "element type has no target equivalent"))?;
        Ok(self.b.declare_type(lty))
    }

    fn unsupported(&self, v: ValueId, reason: impl Into<String>) -> LoweringError {
        let module = self.input.module;
        LoweringError::Unsupported {
            kind: module.op(v).map(|op| op.name()).unwrap_or("value"),
            shape: shape::describe(self.input.ctx.shape(module.ty(v))),
            reason: reason.into(),
        }
    }

    // ── Operands ──

    fn lowered(&mut self, user: ValueId, v: ValueId) -> Result<Lowered, LoweringError> {
        if let Some(l) = self.values.get(&v) {
            return Ok(l.clone());
        }
        if let Some(c) = self.input.module.const_of(v) {
            let op = match *self.input.ctx.constant(c) {
                Constant::Int { ty, value } => {
                    let lty = self
                        .scalar_lir_type(ty)
                        .ok_or_else(|| self.unsupported(user, "constant of unsupported type"))?;
                    let t = self.b.declare_type(lty);
                    self.b.const_int(t, value)
                }
                Constant::Float { ty, value } => {
                    let lty = self
                        .scalar_lir_type(ty)
                        .ok_or_else(|| self.unsupported(user, "constant of unsupported type"))?;
                    let t = self.b.declare_type(lty);
                    self.b.const_float(t, value)
                }
            };
            return Ok(Lowered::Scalar(op));
        }
        Err(self.unsupported(
            user,
            format!("{} is used before it is defined", self.input.module.value_name(v)),
        ))
    }

    fn scalar(&mut self, user: ValueId, v: ValueId) -> Result<Operand, LoweringError> {
        match self.lowered(user, v)? {
            Lowered::Scalar(op) => Ok(op),
            _ => Err(self.unsupported(
                user,
                format!("{} must be a scalar", self.input.module.value_name(v)),
            )),
        }
    }

    /// Per-lane elements of `v`, splatting scalars to `n` copies.
    fn elements(&mut self, user: ValueId, v: ValueId, n: usize) -> Result<Vec<Operand>, LoweringError> {
        match self.lowered(user, v)? {
            Lowered::Scalar(op) => Ok(vec![op; n]),
            Lowered::Tile(elems) if elems.len() == n => Ok(elems),
            Lowered::Tile(elems) => Err(self.unsupported(
                user,
                format!(
                    "{} holds {} elements per lane, expected {}",
                    self.input.module.value_name(v),
                    elems.len(),
                    n
                ),
            )),
            Lowered::Shared(_) => Err(self.unsupported(
                user,
                format!(
                    "{} lives in shared memory and can only feed a reduction",
                    self.input.module.value_name(v)
                ),
            )),
        }
    }

    fn map1(
        &mut self,
        v: ValueId,
        x: ValueId,
        mut f: impl FnMut(&mut Self, Operand) -> Result<Operand, LoweringError>,
    ) -> Result<Lowered, LoweringError> {
        if self.shape_of(v).is_none() {
            let a = self.scalar(v, x)?;
            return Ok(Lowered::Scalar(f(self, a)?));
        }
        let n = self.count(v)?;
        let xs = self.elements(v, x, n)?;
        let out = xs.into_iter().map(|a| f(self, a)).collect::<Result<_, _>>()?;
        Ok(Lowered::Tile(out))
    }

    fn map2(
        &mut self,
        v: ValueId,
        x: ValueId,
        y: ValueId,
        mut f: impl FnMut(&mut Self, Operand, Operand) -> Result<Operand, LoweringError>,
    ) -> Result<Lowered, LoweringError> {
        if self.shape_of(v).is_none() {
            let a = self.scalar(v, x)?;
            let b = self.scalar(v, y)?;
            return Ok(Lowered::Scalar(f(self, a, b)?));
        }
        let n = self.count(v)?;
        let xs = self.elements(v, x, n)?;
        let ys = self.elements(v, y, n)?;
        let out = xs
            .into_iter()
            .zip(ys)
            .map(|(a, b)| f(self, a, b))
            .collect::<Result<_, _>>()?;
        Ok(Lowered::Tile(out))
    }

    // ── Instructions ──

    fn lower(&mut self, v: ValueId) -> Result<(), LoweringError> {
        let Some(op) = self.input.module.op(v).cloned() else {
            return Ok(());
        };
        trace!("select: {} ({})", self.input.module.value_name(v), op.name());
        let lowered = match op {
            InstKind::Binary { op, lhs, rhs } => {
                let elem = self.elem_type(v)?;
                Some(self.map2(v, lhs, rhs, |s, a, b| {
                    s.emit(elem, LirOp::Binary { op, lhs: a, rhs: b }, "binary")
                })?)
            }
            InstKind::Cmp { pred, lhs, rhs } => {
                let elem = self.elem_type(v)?;
                Some(self.map2(v, lhs, rhs, |s, a, b| {
                    s.emit(elem, LirOp::Cmp { pred, lhs: a, rhs: b }, "cmp")
                })?)
            }
            InstKind::Gep { ptr, offset } => {
                let ptr_ty = self.elem_type(v)?;
                let pointee = self
                    .input
                    .ctx
                    .pointee(self.input.module.ty(v))
                    .and_then(|t| self.scalar_lir_type(t))
                    .ok_or_else(|| self.unsupported(v, "pointee type has no target equivalent"))?;
                let pointee = self.b.declare_type(pointee);
                Some(self.map2(v, ptr, offset, |s, p, i| {
                    s.emit(
                        ptr_ty,
                        LirOp::Gep {
                            elem: pointee,
                            ptr: p,
                            index: i,
                        },
                        "gep",
                    )
                })?)
            }
            InstKind::Load { ptr } => {
                let elem = self.elem_type(v)?;
                Some(self.map1(v, ptr, |s, p| s.emit(elem, LirOp::Load { ptr: p }, "load"))?)
            }
            InstKind::Store { ptr, value } => {
                let n = self.count(ptr)?;
                let ptrs = self.elements(v, ptr, n)?;
                let vals = self.elements(v, value, n)?;
                for (p, x) in ptrs.into_iter().zip(vals) {
                    self.emit_void(LirOp::Store { ptr: p, value: x });
                }
                None
            }
            InstKind::Range { start } => {
                let layout = self.tile_layout(v)?;
                let n = self.count(v)?;
                let mut out = Vec::with_capacity(n);
                for flat in 0..n {
                    let c = self.coords(&layout, flat)?;
                    let first = self.i32(start);
                    out.push(self.arith(BinaryOp::Add, c[0].clone(), first)?);
                }
                Some(Lowered::Tile(out))
            }
            InstKind::GlobalRange { axis } => {
                let layout = self.tile_layout(v)?;
                let extent = self.shape_of(v).map(|s| s[0]).unwrap_or(1);
                let id = self.block_ids.get(&axis).cloned().unwrap_or_else(|| self.i32(0));
                let offset = self.arith(BinaryOp::Mul, id, self.i32(extent as i64))?;
                let n = self.count(v)?;
                let mut out = Vec::with_capacity(n);
                for flat in 0..n {
                    let c = self.coords(&layout, flat)?;
                    out.push(self.arith(BinaryOp::Add, offset.clone(), c[0].clone())?);
                }
                Some(Lowered::Tile(out))
            }
            InstKind::Splat { value } => {
                let x = self.scalar(v, value)?;
                Some(Lowered::Tile(vec![x; self.count(v)?]))
            }
            InstKind::Reshape { value } => {
                let n = self.count(v)?;
                Some(Lowered::Tile(self.elements(v, value, n)?))
            }
            InstKind::Broadcast { value } => Some(self.broadcast(v, value)?),
            InstKind::Dot { a, b, acc } => Some(self.dot(v, a, b, acc)?),
            InstKind::CopyToShared { value } => Some(self.copy_to_shared(v, value)?),
            InstKind::Phi { .. } => Some(self.phi(v)?),
            InstKind::Br { target } => {
                self.emit_void(LirOp::Br {
                    target: self.blocks[&target],
                });
                None
            }
            InstKind::CondBr {
                cond,
                then_block,
                else_block,
            } => {
                let c = self.scalar(v, cond)?;
                self.emit_void(LirOp::CondBr {
                    cond: c,
                    then_block: self.blocks[&then_block],
                    else_block: self.blocks[&else_block],
                });
                None
            }
            InstKind::Return => {
                self.emit_void(LirOp::Ret);
                None
            }
        };
        if let Some(l) = lowered {
            self.values.insert(v, l);
        }
        Ok(())
    }

    /// Unit axes of the source contribute no offset: every destination
    /// element along them reads the source's single element.
    fn broadcast(&mut self, v: ValueId, value: ValueId) -> Result<Lowered, LoweringError> {
        let dst = self.tile_layout(v)?;
        let src_shape = self.shape_of(value).unwrap_or_default();
        if src_shape.is_empty() {
            let x = self.scalar(v, value)?;
            return Ok(Lowered::Tile(vec![x; self.count(v)?]));
        }
        if src_shape.len() != dst.len() {
            return Err(self.unsupported(v, "source rank differs from result rank"));
        }
        let dst_counts = Self::per_lane_counts(&dst);
        let src_counts: Vec<u32> = dst_counts
            .iter()
            .zip(&src_shape)
            .map(|(&n, &e)| if e == 1 { 1 } else { n })
            .collect();
        let src_n: usize = src_counts.iter().map(|&n| n as usize).product();
        let src = self.elements(v, value, src_n)?;
        let dst_n: usize = dst_counts.iter().map(|&n| n as usize).product();
        let out = (0..dst_n)
            .map(|flat| {
                let idx: Vec<u32> = unflatten(flat, &dst_counts)
                    .into_iter()
                    .zip(&src_shape)
                    .map(|(j, &e)| if e == 1 { 0 } else { j })
                    .collect();
                src[flatten(&idx, &src_counts)].clone()
            })
            .collect();
        Ok(Lowered::Tile(out))
    }

    fn staged_offset(&mut self, v: ValueId, operand: ValueId) -> Result<Operand, LoweringError> {
        match self.lowered(v, operand)? {
            Lowered::Shared(offset) => Ok(offset),
            _ => Err(self.unsupported(
                v,
                format!(
                    "operand {} is not staged in shared memory",
                    self.input.module.value_name(operand)
                ),
            )),
        }
    }

    /// `acc[i, j] + Σk a[i, k] · b[k, j]` for this lane's elements, reading
    /// both operands from shared memory. Each row of `a` and column of `b`
    /// this lane needs is loaded once.
    fn dot(&mut self, v: ValueId, a: ValueId, b: ValueId, acc: ValueId) -> Result<Lowered, LoweringError> {
        let (Some(sa), Some(sb)) = (self.shape_of(a), self.shape_of(b)) else {
            return Err(self.unsupported(v, "operands must be tiles"));
        };
        if sa.len() != 2 || sb.len() != 2 || sa[1] != sb[0] {
            return Err(self.unsupported(v, "operands must be [M, K] and [K, N]"));
        }
        let (k, n_cols) = (sa[1], sb[1]);
        let elem = self.elem_type(v)?;
        if !self.is_float_result(v) {
            return Err(self.unsupported(v, "reductions need a floating-point element type"));
        }
        let oa = self.staged_offset(v, a)?;
        let ob = self.staged_offset(v, b)?;
        let layout = self.tile_layout(v)?;
        let counts = Self::per_lane_counts(&layout);
        let (n0, n1) = (counts[0], counts[1]);
        let accs = self.elements(v, acc, (n0 * n1) as usize)?;

        let pa = self.shared_ptr(oa)?;
        let pb = self.shared_ptr(ob)?;
        let sptr = self.b.declare_type(LirType::Ptr {
            addrspace: SHARED_ADDRSPACE,
        });

        let mut rows: Vec<Vec<Operand>> = Vec::with_capacity(n0 as usize);
        for i in 0..n0 {
            let row = self.axis_index(layout[0], i)?;
            let row_start = self.arith(BinaryOp::Mul, row, self.i32(k as i64))?;
            let mut vals = Vec::with_capacity(k as usize);
            for kk in 0..k {
                let lin = self.arith(BinaryOp::Add, row_start.clone(), self.i32(kk as i64))?;
                let p = self.emit(sptr, LirOp::Gep { elem, ptr: pa.clone(), index: lin }, "dot")?;
                vals.push(self.emit(elem, LirOp::Load { ptr: p }, "dot")?);
            }
            rows.push(vals);
        }
        let mut cols: Vec<Vec<Operand>> = Vec::with_capacity(n1 as usize);
        for j in 0..n1 {
            let col = self.axis_index(layout[1], j)?;
            let mut vals = Vec::with_capacity(k as usize);
            for kk in 0..k {
                let lin = self.arith(BinaryOp::Add, self.i32((kk * n_cols) as i64), col.clone())?;
                let p = self.emit(sptr, LirOp::Gep { elem, ptr: pb.clone(), index: lin }, "dot")?;
                vals.push(self.emit(elem, LirOp::Load { ptr: p }, "dot")?);
            }
            cols.push(vals);
        }

        let mut out = Vec::with_capacity(accs.len());
        for (flat, init) in accs.into_iter().enumerate() {
            let (i, j) = (flat / n1 as usize, flat % n1 as usize);
            let mut c = init;
            for kk in 0..k as usize {
                c = self.emit(
                    elem,
                    LirOp::Fma {
                        a: rows[i][kk].clone(),
                        b: cols[j][kk].clone(),
                        c,
                    },
                    "dot",
                )?;
            }
            out.push(c);
        }
        Ok(Lowered::Tile(out))
    }

    fn is_float_result(&self, v: ValueId) -> bool {
        let ctx = self.input.ctx;
        ctx.is_float(ctx.scalar_type(self.input.module.ty(v)))
    }

    /// Write this lane's elements into the copy's region, fenced by
    /// barriers on both sides.
    fn copy_to_shared(&mut self, v: ValueId, value: ValueId) -> Result<Lowered, LoweringError> {
        let pair = self
            .input
            .copies
            .double_buffers
            .iter()
            .find(|d| d.second == v)
            .copied();
        let offset = match pair {
            Some(pair) => {
                let total = self.region_offset(v, pair.first)? + self.region_offset(v, pair.second)?;
                let current = match self.values.get(&pair.phi) {
                    Some(Lowered::Shared(cur)) => cur.clone(),
                    _ => return Err(self.unsupported(v, "double buffer phi is not lowered yet")),
                };
                let total = self.i32(total as i64);
                self.arith(BinaryOp::Sub, total, current)?
            }
            None => {
                let off = self.region_offset(v, v)?;
                self.i32(off as i64)
            }
        };

        let shape = self.shape_of(value).unwrap_or_default();
        let layout = self.tile_layout(value)?;
        let n = self.count(value)?;
        let elems = self.elements(v, value, n)?;
        let elem = self.elem_type(value)?;
        let sptr = self.b.declare_type(LirType::Ptr {
            addrspace: SHARED_ADDRSPACE,
        });

        self.emit_void(LirOp::Barrier);
        let base = self.shared_ptr(offset.clone())?;
        for (flat, x) in elems.into_iter().enumerate() {
            let coords = self.coords(&layout, flat)?;
            let lin = self.linearize(&coords, &shape)?;
            let p = self.emit(sptr, LirOp::Gep { elem, ptr: base.clone(), index: lin }, "copy_to_shared")?;
            self.emit_void(LirOp::Store { ptr: p, value: x });
        }
        self.emit_void(LirOp::Barrier);
        Ok(Lowered::Shared(offset))
    }

    fn region_offset(&self, v: ValueId, staged: ValueId) -> Result<u64, LoweringError> {
        self.input.alloc.offset_of(staged).ok_or_else(|| {
            self.unsupported(
                v,
                format!("{} has no shared-memory region", self.input.module.value_name(staged)),
            )
        })
    }

    /// Phis get their incomings once every block is lowered.
    fn phi(&mut self, v: ValueId) -> Result<Lowered, LoweringError> {
        if self.input.copies.pair_of(v).is_some() {
            let phi = self.emit(self.i32t, LirOp::Phi { incoming: Vec::new() }, "phi")?;
            self.pending_phis.push((v, vec![phi.clone()]));
            return Ok(Lowered::Shared(phi));
        }
        let elem = self.elem_type(v)?;
        let n = self.count(v)?;
        let phis = (0..n)
            .map(|_| self.emit(elem, LirOp::Phi { incoming: Vec::new() }, "phi"))
            .collect::<Result<Vec<_>, _>>()?;
        self.pending_phis.push((v, phis.clone()));
        Ok(if self.shape_of(v).is_some() {
            Lowered::Tile(phis)
        } else {
            Lowered::Scalar(phis[0].clone())
        })
    }

    fn complete_phis(&mut self) -> Result<(), LoweringError> {
        for (v, phis) in std::mem::take(&mut self.pending_phis) {
            let Some(InstKind::Phi { incoming }) = self.input.module.op(v) else {
                continue;
            };
            for &(value, block) in incoming {
                let Some(&from) = self.blocks.get(&block) else {
                    continue;
                };
                let vals = match self.lowered(v, value)? {
                    Lowered::Shared(offset) => vec![offset],
                    _ => self.elements(v, value, phis.len())?,
                };
                for (phi, x) in phis.iter().zip(vals) {
                    self.b.add_incoming(phi, x, from);
                }
            }
        }
        Ok(())
    }
}

/// Row-major multi-index of `flat` over `counts`.
fn unflatten(mut flat: usize, counts: &[u32]) -> Vec<u32> {
    let mut idx = vec![0u32; counts.len()];
    for k in (0..counts.len()).rev() {
        let n = counts[k].max(1) as usize;
        idx[k] = (flat % n) as u32;
        flat /= n;
    }
    idx
}

fn flatten(idx: &[u32], counts: &[u32]) -> usize {
    idx.iter()
        .zip(counts)
        .fold(0usize, |acc, (&j, &n)| acc * n.max(1) as usize + j as usize)
}
