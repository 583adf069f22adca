// irgen.rs — AST → tile IR construction
//
// Translates a parsed kernel into SSA tile IR: declarations and
// expressions become shape-annotated instructions, broadcasting becomes
// explicit `splat`/`broadcast` instructions, `newaxis` indexing becomes
// `reshape`, pointer arithmetic becomes `gep`, and structured `for` loops
// become header/body/exit blocks with one phi per loop-carried variable.
//
// Preconditions: `program` is a complete AST from the parser.
// Postconditions: on success, `module` holds one function per definition;
//                 every loop phi has exactly one preheader and one latch
//                 incoming; every block ends in one terminator.
// Failure modes: `BuildError` for the first incompatible construct; the
//                caller's module is left untouched.
// Side effects: interns types and constants into `ctx`.

use std::collections::HashMap;

use log::{debug, trace};

use crate::ast::{
    BaseType, BinOp, Block, Declaration, Expr, ExprKind, FunctionDef, Item, Program, Span, Stmt,
    StmtKind, Subscript, TypeSpec, UnaryOp,
};
use crate::error::BuildError;
use crate::id::{BlockId, FuncId, TypeId, ValueId};
use crate::ir::{BinaryOp, CmpPred, Constant, Context, InstKind, Module};
use crate::shape;

/// Build IR for every function and global of `program` into `module`.
pub fn build_ir(program: &Program, ctx: &mut Context, module: &mut Module) -> Result<(), BuildError> {
    let mut builder = Builder::new(ctx, module.clone());
    for item in &program.items {
        match item {
            Item::Global(decl) => builder.global(decl)?,
            Item::Function(def) => builder.function(def)?,
        }
    }
    debug!(
        "irgen: {} function(s), {} value(s)",
        builder.module.functions().count(),
        builder.module.num_values()
    );
    *module = builder.module;
    Ok(())
}

// ── Scopes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Binding {
    /// Declared type, including the tile shape.
    ty: TypeId,
    /// Current SSA value; `None` until first assigned.
    value: Option<ValueId>,
    span: Span,
}

struct Builder<'a> {
    ctx: &'a mut Context,
    module: Module,
    globals: HashMap<String, Binding>,
    scopes: Vec<HashMap<String, Binding>>,
    func: FuncId,
    block: BlockId,
    terminated: bool,
}

impl<'a> Builder<'a> {
    fn new(ctx: &'a mut Context, module: Module) -> Self {
        Self {
            ctx,
            module,
            globals: HashMap::new(),
            scopes: Vec::new(),
            func: FuncId(0),
            block: BlockId(0),
            terminated: false,
        }
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.get(name))
            .or_else(|| self.globals.get(name))
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut Binding> {
        self.scopes.iter_mut().rev().find_map(|s| s.get_mut(name))
    }

    fn define(&mut self, name: &str, binding: Binding) -> Result<(), BuildError> {
        let scope = self
            .scopes
            .last_mut()
            .expect("define called outside a function scope");
        if let Some(prev) = scope.get(name) {
            return Err(BuildError::Redefinition {
                name: name.to_string(),
                span: binding.span,
                previous: prev.span,
            });
        }
        scope.insert(name.to_string(), binding);
        Ok(())
    }

    // ── Types ──

    fn resolve_type(&mut self, spec: &TypeSpec) -> Result<TypeId, BuildError> {
        let mut ty = match spec.base {
            BaseType::Void if spec.pointer_depth == 0 => return Ok(self.ctx.void_type()),
            BaseType::Void => {
                return Err(BuildError::Unsupported {
                    what: "void pointer".to_string(),
                    span: spec.span,
                })
            }
            BaseType::Int1 => self.ctx.int_type(1),
            BaseType::Int8 => self.ctx.int_type(8),
            BaseType::Int16 => self.ctx.int_type(16),
            BaseType::Int32 => self.ctx.int_type(32),
            BaseType::Int64 => self.ctx.int_type(64),
            BaseType::Fp16 => self.ctx.float_type(16),
            BaseType::Fp32 => self.ctx.float_type(32),
            BaseType::Fp64 => self.ctx.float_type(64),
        };
        for _ in 0..spec.pointer_depth {
            ty = self.ctx.pointer_to(ty);
        }
        Ok(ty)
    }

    /// Evaluate a compile-time integer (literals, constants, arithmetic).
    /// `Ok(None)` when `e` is not constant; overflow and division by zero
    /// are errors.
    fn const_eval(&self, e: &Expr) -> Result<Option<i64>, BuildError> {
        let overflow = |what: String| BuildError::ConstantOverflow { what, span: e.span };
        match &e.kind {
            ExprKind::Int(n) => Ok(Some(*n)),
            ExprKind::Ident(name) => Ok(self
                .lookup(name)
                .and_then(|b| b.value)
                .and_then(|v| self.module.const_of(v))
                .and_then(|c| self.ctx.constant(c).as_int())),
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => match self.const_eval(operand)? {
                Some(v) => v.checked_neg().map(Some).ok_or_else(|| overflow(format!("-({})", v))),
                None => Ok(None),
            },
            ExprKind::Binary { op, lhs, rhs } => {
                let (Some(a), Some(b)) = (self.const_eval(lhs)?, self.const_eval(rhs)?) else {
                    return Ok(None);
                };
                let (result, sym) = match op {
                    BinOp::Add => (a.checked_add(b), "+"),
                    BinOp::Sub => (a.checked_sub(b), "-"),
                    BinOp::Mul => (a.checked_mul(b), "*"),
                    BinOp::Div => (a.checked_div(b), "/"),
                    BinOp::Rem => (a.checked_rem(b), "%"),
                    _ => return Ok(None),
                };
                result
                    .map(Some)
                    .ok_or_else(|| overflow(format!("{} {} {}", a, sym, b)))
            }
            _ => Ok(None),
        }
    }

    /// `const_eval`, with a non-constant `e` reported as `what`.
    fn constant(&self, e: &Expr, what: &str) -> Result<i64, BuildError> {
        self.const_eval(e)?.ok_or_else(|| BuildError::NonConstant {
            what: what.to_string(),
            span: e.span,
        })
    }

    fn const_extent(&self, e: &Expr, what: &str) -> Result<u32, BuildError> {
        let v = self.constant(e, what)?;
        u32::try_from(v)
            .ok()
            .filter(|&v| v > 0)
            .ok_or_else(|| BuildError::Unsupported {
                what: format!("{} of {} (must be positive)", what, v),
                span: e.span,
            })
    }

    // ── Items ──

    fn global(&mut self, decl: &Declaration) -> Result<(), BuildError> {
        let ty = self.resolve_type(&decl.ty)?;
        for d in &decl.declarators {
            if d.shape.is_some() || self.ctx.is_pointer(ty) || !self.ctx.is_int(ty) {
                return Err(BuildError::Unsupported {
                    what: "module-scope declarations must be integer scalars".to_string(),
                    span: d.span,
                });
            }
            let init = d.init.as_ref().ok_or_else(|| BuildError::NonConstant {
                what: format!("initializer of `{}`", d.name.name),
                span: d.span,
            })?;
            let n = self.constant(init, &format!("initializer of `{}`", d.name.name))?;
            if let Some(prev) = self.globals.get(&d.name.name) {
                return Err(BuildError::Redefinition {
                    name: d.name.name.clone(),
                    span: d.name.span,
                    previous: prev.span,
                });
            }
            let c = self.ctx.const_int(ty, n);
            self.module.add_global(d.name.name.clone(), ty, Some(c));
            let value = self.module.constant(self.ctx, c);
            self.globals.insert(
                d.name.name.clone(),
                Binding {
                    ty,
                    value: Some(value),
                    span: d.name.span,
                },
            );
        }
        Ok(())
    }

    fn function(&mut self, def: &FunctionDef) -> Result<(), BuildError> {
        let ret = self.resolve_type(&def.ret)?;
        self.func = self.module.add_function(def.name.name.clone(), ret);
        self.scopes.push(HashMap::new());
        for p in &def.params {
            let ty = self.resolve_type(&p.ty)?;
            let arg = self.module.add_argument(self.func, p.name.name.clone(), ty);
            self.define(
                &p.name.name,
                Binding {
                    ty,
                    value: Some(arg),
                    span: p.name.span,
                },
            )?;
        }
        self.block = self.module.add_block(self.func, "entry");
        self.terminated = false;
        self.block_stmts(&def.body)?;
        if !self.terminated {
            let void = self.ctx.void_type();
            self.emit(void, InstKind::Return, None);
        }
        self.scopes.pop();
        trace!("irgen: built `{}`", def.name.name);
        Ok(())
    }

    // ── Statements ──

    fn emit(&mut self, ty: TypeId, op: InstKind, name: Option<String>) -> ValueId {
        self.module.append_inst(self.block, ty, op, name)
    }

    fn block_stmts(&mut self, block: &Block) -> Result<(), BuildError> {
        for stmt in &block.stmts {
            if self.terminated {
                return Err(BuildError::Unsupported {
                    what: "statement after return".to_string(),
                    span: stmt.span,
                });
            }
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), BuildError> {
        match &stmt.kind {
            StmtKind::Decl(decl) => self.declaration(decl),
            StmtKind::Assign { target, value } => self.assign(target, value),
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => self.for_loop(init.as_deref(), cond.as_ref(), step.as_deref(), body, stmt.span),
            StmtKind::Block(block) => {
                self.scopes.push(HashMap::new());
                let r = self.block_stmts(block);
                self.scopes.pop();
                r
            }
            StmtKind::Return => {
                let void = self.ctx.void_type();
                self.emit(void, InstKind::Return, None);
                self.terminated = true;
                Ok(())
            }
            StmtKind::Expr(e) => self.expr(e, None).map(|_| ()),
        }
    }

    fn declaration(&mut self, decl: &Declaration) -> Result<(), BuildError> {
        let scalar = self.resolve_type(&decl.ty)?;
        if self.ctx.ty(scalar) == &crate::ir::Type::Void {
            return Err(BuildError::TypeMismatch {
                message: "variables cannot be void".to_string(),
                span: decl.ty.span,
            });
        }
        for d in &decl.declarators {
            let shape = match &d.shape {
                Some(dims) => Some(
                    dims.iter()
                        .map(|e| self.const_extent(e, "tile extent"))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                None => None,
            };
            let ty = self.ctx.with_shape(scalar, shape.as_deref());
            let value = match &d.init {
                Some(init) => {
                    let hint = (!self.ctx.is_pointer(scalar)).then_some(scalar);
                    let v = self.expr(init, hint)?;
                    let v = self.coerce_to(v, ty, init.span, "=")?;
                    self.name_value(v, &d.name.name);
                    Some(v)
                }
                None => None,
            };
            self.define(
                &d.name.name,
                Binding {
                    ty,
                    value,
                    span: d.name.span,
                },
            )?;
        }
        Ok(())
    }

    fn name_value(&mut self, v: ValueId, name: &str) {
        if self.module.inst(v).is_some() && self.module.value(v).name.is_none() {
            self.module.set_name(v, name);
        }
    }

    fn assign(&mut self, target: &Expr, value: &Expr) -> Result<(), BuildError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                let binding = self
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| BuildError::UndefinedName {
                        name: name.clone(),
                        span: target.span,
                    })?;
                if self.lookup_mut(name).is_none() {
                    // Only module constants are visible but not in a scope.
                    return Err(BuildError::InvalidTarget { span: target.span });
                }
                let scalar = self.ctx.scalar_type(binding.ty);
                let hint = (!self.ctx.is_pointer(scalar)).then_some(scalar);
                let v = self.expr(value, hint)?;
                let v = self.coerce_to(v, binding.ty, value.span, "=")?;
                self.name_value(v, name);
                if let Some(b) = self.lookup_mut(name) {
                    b.value = Some(v);
                }
                Ok(())
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => {
                let ptr = self.expr(operand, None)?;
                let ptr_ty = self.module.ty(ptr);
                let pointee = self.ctx.pointee(ptr_ty).ok_or_else(|| BuildError::TypeMismatch {
                    message: format!("cannot store through {}", self.ctx.type_name(ptr_ty)),
                    span: operand.span,
                })?;
                let shape = self.ctx.shape(ptr_ty).map(|s| s.to_vec());
                let val_ty = self.ctx.with_shape(pointee, shape.as_deref());
                let v = self.expr(value, Some(pointee))?;
                let v = self.coerce_to(v, val_ty, value.span, "store")?;
                let void = self.ctx.void_type();
                self.emit(void, InstKind::Store { ptr, value: v }, None);
                Ok(())
            }
            _ => Err(BuildError::InvalidTarget { span: target.span }),
        }
    }

    // ── Loops ──

    fn for_loop(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Stmt>,
        body: &Block,
        span: Span,
    ) -> Result<(), BuildError> {
        self.scopes.push(HashMap::new());
        if let Some(init) = init {
            self.stmt(init)?;
        }

        let mut assigned = Vec::new();
        collect_assigned(&body.stmts, &mut assigned);
        if let Some(step) = step {
            collect_assigned(std::slice::from_ref(step), &mut assigned);
        }

        let preheader = self.block;
        let header = self.module.add_block(self.func, "loop.header");
        let void = self.ctx.void_type();
        self.emit(void, InstKind::Br { target: header }, None);

        // One phi per outer variable the loop re-assigns.
        self.block = header;
        let mut carried = Vec::new();
        for name in assigned {
            let Some(binding) = self.lookup_mut(&name).cloned() else {
                continue;
            };
            let init = binding
                .value
                .ok_or_else(|| BuildError::UninitializedLoopCarried {
                    name: name.clone(),
                    span: binding.span,
                })?;
            let phi = self.emit(
                binding.ty,
                InstKind::Phi {
                    incoming: vec![(init, preheader)],
                },
                Some(name.clone()),
            );
            if let Some(b) = self.lookup_mut(&name) {
                b.value = Some(phi);
            }
            carried.push((name, phi));
        }

        let cond = cond.ok_or_else(|| BuildError::Unsupported {
            what: "for loop without a condition".to_string(),
            span,
        })?;
        let cond_v = self.expr(cond, None)?;
        let cond_ty = self.module.ty(cond_v);
        if self.ctx.is_tile(cond_ty) || !self.ctx.is_int(cond_ty) {
            return Err(BuildError::TypeMismatch {
                message: format!(
                    "loop condition must be a scalar integer, got {}",
                    self.ctx.type_name(cond_ty)
                ),
                span: cond.span,
            });
        }
        let cond_block = self.block;

        let body_block = self.module.add_block(self.func, "loop.body");
        self.block = body_block;
        self.scopes.push(HashMap::new());
        self.block_stmts(body)?;
        self.scopes.pop();
        if self.terminated {
            return Err(BuildError::Unsupported {
                what: "return inside a loop".to_string(),
                span: body.span,
            });
        }
        if let Some(step) = step {
            self.stmt(step)?;
        }
        let latch = self.block;
        self.emit(void, InstKind::Br { target: header }, None);

        for (name, phi) in &carried {
            let latest = self
                .lookup(name)
                .and_then(|b| b.value)
                .unwrap_or(*phi);
            self.module.add_phi_incoming(*phi, latest, latch);
        }

        let exit = self.module.add_block(self.func, "loop.exit");
        self.module.append_inst(
            cond_block,
            void,
            InstKind::CondBr {
                cond: cond_v,
                then_block: body_block,
                else_block: exit,
            },
            None,
        );
        self.block = exit;
        for (name, phi) in carried {
            if let Some(b) = self.lookup_mut(&name) {
                b.value = Some(phi);
            }
        }
        self.scopes.pop();
        Ok(())
    }

    // ── Expressions ──

    /// Lower an expression. `hint` is the scalar type integer literals
    /// should adopt.
    fn expr(&mut self, e: &Expr, hint: Option<TypeId>) -> Result<ValueId, BuildError> {
        match &e.kind {
            ExprKind::Int(n) => Ok(self.int_literal(*n, hint)),
            ExprKind::Float(v) => {
                let ty = match hint {
                    Some(h) if self.ctx.is_float(h) => h,
                    _ => self.ctx.float_type(32),
                };
                let c = self.ctx.const_float(ty, *v);
                Ok(self.module.constant(self.ctx, c))
            }
            ExprKind::Ident(name) => {
                let binding = self.lookup(name).ok_or_else(|| BuildError::UndefinedName {
                    name: name.clone(),
                    span: e.span,
                })?;
                binding.value.ok_or_else(|| BuildError::Unsupported {
                    what: format!("use of `{}` before assignment", name),
                    span: e.span,
                })
            }
            ExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, e.span, hint),
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => {
                let v = self.expr(operand, hint)?;
                let zero = self.zero_like(v);
                self.arith(BinOp::Sub, zero, v, e.span, e.span, operand.span)
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => {
                let ptr = self.expr(operand, None)?;
                let ptr_ty = self.module.ty(ptr);
                let pointee = self.ctx.pointee(ptr_ty).ok_or_else(|| BuildError::TypeMismatch {
                    message: format!("cannot dereference {}", self.ctx.type_name(ptr_ty)),
                    span: operand.span,
                })?;
                let shape = self.ctx.shape(ptr_ty).map(|s| s.to_vec());
                let ty = self.ctx.with_shape(pointee, shape.as_deref());
                Ok(self.emit(ty, InstKind::Load { ptr }, None))
            }
            ExprKind::Index { base, subscripts } => self.index(base, subscripts, e.span),
            ExprKind::Range { start, end } => {
                let lo = self.constant(start, "range start")?;
                let hi = self.constant(end, "range end")?;
                let width = hi.checked_sub(lo).ok_or_else(|| BuildError::ConstantOverflow {
                    what: format!("{} - {}", hi, lo),
                    span: e.span,
                })?;
                let extent = u32::try_from(width)
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| BuildError::Unsupported {
                        what: format!("empty range {} ... {}", lo, hi),
                        span: e.span,
                    })?;
                let i32t = self.ctx.int_type(32);
                let ty = self.ctx.tile(i32t, &[extent]);
                Ok(self.emit(ty, InstKind::Range { start: lo }, None))
            }
            ExprKind::GlobalRange { size, axis } => {
                let extent = self.const_extent(size, "global range size")?;
                let axis_v = self.constant(axis, "global range axis")?;
                let axis = u32::try_from(axis_v).ok().filter(|&a| a < 3).ok_or_else(|| {
                    BuildError::Unsupported {
                        what: format!("global range axis {} (expected 0, 1 or 2)", axis_v),
                        span: e.span,
                    }
                })?;
                let i32t = self.ctx.int_type(32);
                let ty = self.ctx.tile(i32t, &[extent]);
                Ok(self.emit(ty, InstKind::GlobalRange { axis }, None))
            }
            ExprKind::Dot { a, b, c } => self.dot(a, b, c, e.span),
        }
    }

    fn shape_vec(&self, v: ValueId) -> Option<Vec<u32>> {
        self.ctx.shape(self.module.ty(v)).map(|s| s.to_vec())
    }

    fn int_literal(&mut self, n: i64, hint: Option<TypeId>) -> ValueId {
        let c = match hint {
            Some(h) if self.ctx.is_float(h) => self.ctx.const_float(h, n as f64),
            Some(h) if self.ctx.is_int(h) && !self.ctx.is_tile(h) => self.ctx.const_int(h, n),
            _ => {
                let i32t = self.ctx.int_type(32);
                self.ctx.const_int(i32t, n)
            }
        };
        self.module.constant(self.ctx, c)
    }

    fn zero_like(&mut self, v: ValueId) -> ValueId {
        let scalar = self.ctx.scalar_type(self.module.ty(v));
        let c = if self.ctx.is_float(scalar) {
            self.ctx.const_float(scalar, 0.0)
        } else {
            self.ctx.const_int(scalar, 0)
        };
        self.module.constant(self.ctx, c)
    }

    /// Re-type an integer constant to `target`'s scalar type.
    fn retype_constant(&mut self, v: ValueId, target: TypeId) -> Option<ValueId> {
        let c = self.module.const_of(v)?;
        let Constant::Int { value, .. } = *self.ctx.constant(c) else {
            return None;
        };
        let scalar = self.ctx.scalar_type(target);
        let c = if self.ctx.is_float(scalar) {
            self.ctx.const_float(scalar, value as f64)
        } else if self.ctx.is_int(scalar) {
            self.ctx.const_int(scalar, value)
        } else {
            return None;
        };
        Some(self.module.constant(self.ctx, c))
    }

    /// Give `v` exactly the shape `target` (splat or broadcast as needed).
    fn reshape_to(&mut self, v: ValueId, target: Option<&[u32]>) -> Option<ValueId> {
        let ty = self.module.ty(v);
        let current = self.ctx.shape(ty).map(|s| s.to_vec());
        match (current.as_deref(), target) {
            (a, b) if a == b => Some(v),
            (None, Some(t)) => {
                let ty = self.ctx.tile(ty, t);
                Some(self.emit(ty, InstKind::Splat { value: v }, None))
            }
            (Some(from), Some(t)) if shape::broadcasts_to(from, t) => {
                let ty = self.ctx.tile(ty, t);
                Some(self.emit(ty, InstKind::Broadcast { value: v }, None))
            }
            _ => None,
        }
    }

    /// Convert `v` to the declared type `target`: matching scalar type and
    /// a shape `v` broadcasts to.
    fn coerce_to(&mut self, v: ValueId, target: TypeId, span: Span, op: &str) -> Result<ValueId, BuildError> {
        let target_scalar = self.ctx.scalar_type(target);
        let mut v = v;
        if self.ctx.scalar_type(self.module.ty(v)) != target_scalar {
            v = self
                .retype_constant(v, target)
                .ok_or_else(|| BuildError::TypeMismatch {
                    message: format!(
                        "expected {}, found {}",
                        self.ctx.type_name(target_scalar),
                        self.ctx.type_name(self.module.ty(v))
                    ),
                    span,
                })?;
        }
        let target_shape = self.ctx.shape(target).map(|s| s.to_vec());
        self.reshape_to(v, target_shape.as_deref()).ok_or_else(|| {
            let from = self.ctx.shape(self.module.ty(v));
            BuildError::ShapeMismatch {
                op: op.to_string(),
                lhs: shape::describe(target_shape.as_deref()),
                rhs: shape::describe(from),
                span,
                lhs_span: span,
                rhs_span: span,
            }
        })
    }

    fn binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, span: Span, hint: Option<TypeId>) -> Result<ValueId, BuildError> {
        let l = self.expr(lhs, hint)?;
        let r = self.expr(rhs, hint)?;
        self.arith(op, l, r, span, lhs.span, rhs.span)
    }

    fn arith(
        &mut self,
        op: BinOp,
        l: ValueId,
        r: ValueId,
        span: Span,
        lhs_span: Span,
        rhs_span: Span,
    ) -> Result<ValueId, BuildError> {
        let (mut l, mut r) = (l, r);
        let (lt, rt) = (self.module.ty(l), self.module.ty(r));

        // Pointer arithmetic: ptr + int in either order.
        let ptr_side = match (self.ctx.is_pointer(lt), self.ctx.is_pointer(rt)) {
            (true, false) => Some(false),
            (false, true) => Some(true),
            (false, false) => None,
            (true, true) => {
                return Err(BuildError::TypeMismatch {
                    message: "cannot combine two pointers".to_string(),
                    span,
                })
            }
        };
        if let Some(swapped) = ptr_side {
            if op != BinOp::Add {
                return Err(BuildError::Unsupported {
                    what: "pointer arithmetic other than `+`".to_string(),
                    span,
                });
            }
            let (ptr, offset) = if swapped { (r, l) } else { (l, r) };
            if !self.ctx.is_int(self.module.ty(offset)) {
                return Err(BuildError::TypeMismatch {
                    message: "pointer offset must be an integer".to_string(),
                    span,
                });
            }
            let (ptr, offset, result_shape) = self.unify_shapes(ptr, offset, "+", span, lhs_span, rhs_span)?;
            let ty = self.ctx.with_shape(self.module.ty(ptr), result_shape.as_deref());
            return Ok(self.emit(ty, InstKind::Gep { ptr, offset }, None));
        }

        // Numeric: integer constants adopt the other side's scalar type.
        let (ls, rs) = (self.ctx.scalar_type(lt), self.ctx.scalar_type(rt));
        if ls != rs {
            if let Some(c) = self.retype_constant(r, ls) {
                r = c;
            } else if let Some(c) = self.retype_constant(l, rs) {
                l = c;
            } else {
                return Err(BuildError::TypeMismatch {
                    message: format!(
                        "operands have types {} and {}",
                        self.ctx.type_name(lt),
                        self.ctx.type_name(rt)
                    ),
                    span,
                });
            }
        }

        let name = binop_symbol(op);
        let (l, r, result_shape) = self.unify_shapes(l, r, name, span, lhs_span, rhs_span)?;
        let scalar = self.ctx.scalar_type(self.module.ty(l));
        let kind = match op {
            BinOp::Add => InstKind::Binary { op: BinaryOp::Add, lhs: l, rhs: r },
            BinOp::Sub => InstKind::Binary { op: BinaryOp::Sub, lhs: l, rhs: r },
            BinOp::Mul => InstKind::Binary { op: BinaryOp::Mul, lhs: l, rhs: r },
            BinOp::Div => InstKind::Binary { op: BinaryOp::Div, lhs: l, rhs: r },
            BinOp::Rem => InstKind::Binary { op: BinaryOp::Rem, lhs: l, rhs: r },
            BinOp::Lt => InstKind::Cmp { pred: CmpPred::Lt, lhs: l, rhs: r },
            BinOp::Le => InstKind::Cmp { pred: CmpPred::Le, lhs: l, rhs: r },
            BinOp::Gt => InstKind::Cmp { pred: CmpPred::Gt, lhs: l, rhs: r },
            BinOp::Ge => InstKind::Cmp { pred: CmpPred::Ge, lhs: l, rhs: r },
            BinOp::Eq => InstKind::Cmp { pred: CmpPred::Eq, lhs: l, rhs: r },
            BinOp::Ne => InstKind::Cmp { pred: CmpPred::Ne, lhs: l, rhs: r },
        };
        let elem = if matches!(kind, InstKind::Cmp { .. }) {
            self.ctx.int_type(1)
        } else {
            scalar
        };
        let ty = self.ctx.with_shape(elem, result_shape.as_deref());
        Ok(self.emit(ty, kind, None))
    }

    /// Broadcast both operands to their common shape.
    fn unify_shapes(
        &mut self,
        l: ValueId,
        r: ValueId,
        op: &str,
        span: Span,
        lhs_span: Span,
        rhs_span: Span,
    ) -> Result<(ValueId, ValueId, Option<Vec<u32>>), BuildError> {
        let ls = self.ctx.shape(self.module.ty(l)).map(|s| s.to_vec());
        let rs = self.ctx.shape(self.module.ty(r)).map(|s| s.to_vec());
        let mismatch = || BuildError::ShapeMismatch {
            op: op.to_string(),
            lhs: shape::describe(ls.as_deref()),
            rhs: shape::describe(rs.as_deref()),
            span,
            lhs_span,
            rhs_span,
        };
        let result = shape::broadcast_optional(ls.as_deref(), rs.as_deref()).map_err(|_| mismatch())?;
        let l = self.reshape_to(l, result.as_deref()).ok_or_else(mismatch)?;
        let r = self.reshape_to(r, result.as_deref()).ok_or_else(mismatch)?;
        Ok((l, r, result))
    }

    fn index(&mut self, base: &Expr, subscripts: &[Subscript], span: Span) -> Result<ValueId, BuildError> {
        let v = self.expr(base, None)?;
        let ty = self.module.ty(v);
        let Some(src) = self.ctx.shape(ty).map(|s| s.to_vec()) else {
            return Err(BuildError::Unsupported {
                what: "indexing a scalar".to_string(),
                span,
            });
        };
        let kept = subscripts.iter().filter(|s| **s == Subscript::All).count();
        if kept != src.len() {
            return Err(BuildError::ShapeMismatch {
                op: "[]".to_string(),
                lhs: shape::describe(Some(&src)),
                rhs: format!("{} `:` subscript(s)", kept),
                span,
                lhs_span: base.span,
                rhs_span: span,
            });
        }
        let mut axes = src.iter();
        let shape: Vec<u32> = subscripts
            .iter()
            .map(|s| match s {
                Subscript::All => axes.next().copied().unwrap_or(1),
                Subscript::NewAxis => 1,
            })
            .collect();
        if shape == src {
            return Ok(v);
        }
        let ty = self.ctx.tile(ty, &shape);
        Ok(self.emit(ty, InstKind::Reshape { value: v }, None))
    }

    fn dot(&mut self, a: &Expr, b: &Expr, c: &Expr, span: Span) -> Result<ValueId, BuildError> {
        let av = self.expr(a, None)?;
        let bv = self.expr(b, None)?;
        let acc_hint = Some(self.ctx.scalar_type(self.module.ty(av)));
        let cv = self.expr(c, acc_hint)?;

        let (sa, sb) = (self.shape_vec(av), self.shape_vec(bv));
        let mismatch = |lhs: &Option<Vec<u32>>, rhs: &Option<Vec<u32>>| BuildError::ShapeMismatch {
            op: "dot".to_string(),
            lhs: shape::describe(lhs.as_deref()),
            rhs: shape::describe(rhs.as_deref()),
            span,
            lhs_span: a.span,
            rhs_span: b.span,
        };
        let (Some([m, k1]), Some([k2, n])) = (
            sa.as_deref().and_then(|s| <[u32; 2]>::try_from(s).ok()),
            sb.as_deref().and_then(|s| <[u32; 2]>::try_from(s).ok()),
        ) else {
            return Err(mismatch(&sa, &sb));
        };
        if k1 != k2 {
            return Err(mismatch(&sa, &sb));
        }
        let scalar = self.ctx.scalar_type(self.module.ty(av));
        if self.ctx.scalar_type(self.module.ty(bv)) != scalar || !self.ctx.is_float(scalar) {
            return Err(BuildError::TypeMismatch {
                message: "dot operands must share a floating-point type".to_string(),
                span,
            });
        }
        let result_ty = self.ctx.tile(scalar, &[m, n]);
        let cv = self.coerce_to(cv, result_ty, c.span, "dot")?;
        Ok(self.emit(result_ty, InstKind::Dot { a: av, b: bv, acc: cv }, None))
    }
}

fn binop_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
    }
}

/// Names assigned by identifier anywhere in `stmts`, first occurrence first.
fn collect_assigned(stmts: &[Stmt], out: &mut Vec<String>) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::Assign { target, .. } => {
                if let ExprKind::Ident(name) = &target.kind {
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
            }
            StmtKind::For {
                init, step, body, ..
            } => {
                if let Some(init) = init {
                    collect_assigned(std::slice::from_ref(init.as_ref()), out);
                }
                collect_assigned(&body.stmts, out);
                if let Some(step) = step {
                    collect_assigned(std::slice::from_ref(step.as_ref()), out);
                }
            }
            StmtKind::Block(block) => collect_assigned(&block.stmts, out),
            StmtKind::Decl(_) | StmtKind::Return | StmtKind::Expr(_) => {}
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
