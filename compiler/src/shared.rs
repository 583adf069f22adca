// shared.rs — Staging of reduction operands into shared memory
//
// Every `dot` operand is copied into shared memory right after it is
// defined, and the reduction is rewritten to read the copy. Operands defined
// in a loop body are therefore staged once per iteration. An operand that is
// a two-incoming loop phi is staged per incoming definition; a new phi over
// the two copies replaces it, and the copies form a double-buffer pair.
//
// Preconditions: tuning has run; the module is well formed.
// Postconditions: every `dot` reads `a` and `b` from a `copy_to_shared` or
//                 from a phi whose incomings are all `copy_to_shared`.
//                 A value read by several reductions is staged once.
// Failure modes: none.
// Side effects: mutates the module.

use std::collections::HashMap;

use log::{debug, trace};

use crate::id::{BlockId, FuncId, ValueId};
use crate::ir::{Context, InstKind, Module};

/// A value created by staging, and the value whose layout it mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedValue {
    pub value: ValueId,
    pub source: ValueId,
}

/// Two copies that feed the same loop phi and must not share a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleBuffer {
    /// Phi reading `first` from the preheader and `second` from the latch.
    pub phi: ValueId,
    pub first: ValueId,
    pub second: ValueId,
}

#[derive(Debug, Clone, Default)]
pub struct SharedCopies {
    /// `copy_to_shared` instructions in insertion order.
    pub copies: Vec<StagedValue>,
    /// Phis merging double-buffered copies.
    pub phis: Vec<StagedValue>,
    pub double_buffers: Vec<DoubleBuffer>,
}

impl SharedCopies {
    pub fn is_staged(&self, v: ValueId) -> bool {
        self.copies.iter().any(|c| c.value == v)
    }

    pub fn pair_of(&self, phi: ValueId) -> Option<&DoubleBuffer> {
        self.double_buffers.iter().find(|d| d.phi == phi)
    }

    /// Every new value with its layout source.
    pub fn all(&self) -> impl Iterator<Item = &StagedValue> {
        self.copies.iter().chain(&self.phis)
    }
}

pub fn place_shared_copies(module: &mut Module, ctx: &Context) -> SharedCopies {
    let mut out = SharedCopies::default();
    let funcs: Vec<FuncId> = module.functions().collect();
    for func in funcs {
        Placer {
            module: &mut *module,
            ctx,
            out: &mut out,
            staged: HashMap::new(),
        }
        .run(func);
    }
    debug!(
        "shared: {} copy(ies), {} double buffer(s)",
        out.copies.len(),
        out.double_buffers.len()
    );
    out
}

struct Placer<'a> {
    module: &'a mut Module,
    ctx: &'a Context,
    out: &'a mut SharedCopies,
    /// Operand → value the reductions read instead.
    staged: HashMap<ValueId, ValueId>,
}

impl Placer<'_> {
    fn run(&mut self, func: FuncId) {
        let dots: Vec<ValueId> = self
            .module
            .instructions(func)
            .into_iter()
            .filter(|&v| matches!(self.module.op(v), Some(InstKind::Dot { .. })))
            .collect();
        for dot in dots {
            let Some(InstKind::Dot { a, b, .. }) = self.module.op(dot).cloned() else {
                continue;
            };
            for operand in [a, b] {
                if let Some(replacement) = self.stage(operand) {
                    self.module.replace_operand(dot, operand, replacement);
                }
            }
        }
    }

    /// Value reductions should read in place of `operand`, if it can be
    /// staged.
    fn stage(&mut self, operand: ValueId) -> Option<ValueId> {
        if let Some(&done) = self.staged.get(&operand) {
            return Some(done);
        }
        let loop_incoming = match self.module.op(operand)? {
            InstKind::CopyToShared { .. } => return None,
            InstKind::Phi { incoming } if incoming.len() == 2 => Some(incoming.clone()),
            _ => None,
        };
        let replacement = match loop_incoming {
            Some(incoming) => self.stage_phi(operand, &incoming)?,
            None => self.copy_after(operand),
        };
        self.staged.insert(operand, replacement);
        Some(replacement)
    }

    fn copy_after(&mut self, value: ValueId) -> ValueId {
        let ty = self.module.ty(value);
        let name = self.module.value(value).name.clone();
        let copy = self
            .module
            .insert_after(value, ty, InstKind::CopyToShared { value }, name);
        trace!(
            "shared: staged {} as {} ({})",
            self.module.value_name(value),
            self.module.value_name(copy),
            self.ctx.type_name(ty)
        );
        self.out.copies.push(StagedValue {
            value: copy,
            source: value,
        });
        copy
    }

    fn stage_phi(&mut self, phi: ValueId, incoming: &[(ValueId, BlockId)]) -> Option<ValueId> {
        // Incomings that are not instructions (arguments) have no definition
        // point to copy after.
        if incoming.iter().any(|(v, _)| self.module.inst(*v).is_none()) {
            return Some(self.copy_after(phi));
        }
        let first = self.copy_after(incoming[0].0);
        let second = self.copy_after(incoming[1].0);

        let header = self.module.inst(phi)?.block;
        let pos = self.module.block(header).insts.iter().position(|&v| v == phi)? + 1;
        let ty = self.module.ty(phi);
        let name = self.module.value(phi).name.clone();
        let shared = self.module.insert_inst(
            header,
            pos,
            ty,
            InstKind::Phi {
                incoming: vec![(first, incoming[0].1), (second, incoming[1].1)],
            },
            name,
        );
        self.out.phis.push(StagedValue {
            value: shared,
            source: phi,
        });
        self.out.double_buffers.push(DoubleBuffer {
            phi: shared,
            first,
            second,
        });
        trace!(
            "shared: double buffer {} over {} and {}",
            self.module.value_name(shared),
            self.module.value_name(first),
            self.module.value_name(second)
        );
        Some(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Context;

    /// Straight-line `dot(load pa, load pb, acc)`.
    fn straight_line() -> (Context, Module, ValueId, ValueId, ValueId) {
        let mut ctx = Context::new();
        let mut m = Module::new("t");
        let f32t = ctx.float_type(32);
        let void = ctx.void_type();
        let ptr = ctx.pointer_to(f32t);
        let pa_ty = ctx.tile(ptr, &[4, 2]);
        let pb_ty = ctx.tile(ptr, &[2, 4]);
        let a_ty = ctx.tile(f32t, &[4, 2]);
        let b_ty = ctx.tile(f32t, &[2, 4]);
        let c_ty = ctx.tile(f32t, &[4, 4]);
        let f = m.add_function("f", void);
        let pa = m.add_argument(f, "pa", pa_ty);
        let pb = m.add_argument(f, "pb", pb_ty);
        let acc = m.add_argument(f, "acc", c_ty);
        let entry = m.add_block(f, "entry");
        let a = m.append_inst(entry, a_ty, InstKind::Load { ptr: pa }, Some("a".into()));
        let b = m.append_inst(entry, b_ty, InstKind::Load { ptr: pb }, Some("b".into()));
        let dot = m.append_inst(entry, c_ty, InstKind::Dot { a, b, acc }, None);
        m.append_inst(entry, void, InstKind::Return, None);
        (ctx, m, a, b, dot)
    }

    #[test]
    fn copies_follow_definitions() {
        let (ctx, mut m, a, b, dot) = straight_line();
        let copies = place_shared_copies(&mut m, &ctx);
        assert_eq!(copies.copies.len(), 2);
        let entry = m.inst(a).unwrap().block;
        let insts = &m.block(entry).insts;
        let pos = |v: ValueId| insts.iter().position(|&x| x == v).unwrap();
        let ca = copies.copies[0].value;
        let cb = copies.copies[1].value;
        assert_eq!(pos(ca), pos(a) + 1);
        assert_eq!(pos(cb), pos(b) + 1);
        let Some(InstKind::Dot { a: da, b: db, .. }) = m.op(dot) else {
            panic!("dot expected");
        };
        assert_eq!((*da, *db), (ca, cb));
        assert_eq!(m.users(a), &[ca]);
    }

    #[test]
    fn rerun_does_not_stage_twice() {
        let (ctx, mut m, ..) = straight_line();
        place_shared_copies(&mut m, &ctx);
        let again = place_shared_copies(&mut m, &ctx);
        assert!(again.copies.is_empty());
    }

    #[test]
    fn shared_operand_staged_once() {
        let mut ctx = Context::new();
        let mut m = Module::new("t");
        let f32t = ctx.float_type(32);
        let void = ctx.void_type();
        let ptr = ctx.pointer_to(f32t);
        let p_ty = ctx.tile(ptr, &[4, 4]);
        let t = ctx.tile(f32t, &[4, 4]);
        let f = m.add_function("f", void);
        let p = m.add_argument(f, "p", p_ty);
        let acc = m.add_argument(f, "acc", t);
        let entry = m.add_block(f, "entry");
        let x = m.append_inst(entry, t, InstKind::Load { ptr: p }, Some("x".into()));
        let d1 = m.append_inst(entry, t, InstKind::Dot { a: x, b: x, acc }, None);
        let d2 = m.append_inst(entry, t, InstKind::Dot { a: x, b: x, acc: d1 }, None);
        m.append_inst(entry, void, InstKind::Return, None);

        let copies = place_shared_copies(&mut m, &ctx);
        assert_eq!(copies.copies.len(), 1);
        let c = copies.copies[0].value;
        for d in [d1, d2] {
            let Some(InstKind::Dot { a, b, .. }) = m.op(d) else {
                panic!("dot expected");
            };
            assert_eq!((*a, *b), (c, c));
        }
    }

    #[test]
    fn loop_phi_operand_is_double_buffered() {
        let mut ctx = Context::new();
        let mut m = Module::new("t");
        let f32t = ctx.float_type(32);
        let i1 = ctx.int_type(1);
        let void = ctx.void_type();
        let ptr = ctx.pointer_to(f32t);
        let p_ty = ctx.tile(ptr, &[4, 4]);
        let t = ctx.tile(f32t, &[4, 4]);
        let f = m.add_function("f", void);
        let p = m.add_argument(f, "p", p_ty);
        let cond = m.add_argument(f, "c", i1);
        let entry = m.add_block(f, "entry");
        let header = m.add_block(f, "loop.header");
        let body = m.add_block(f, "loop.body");
        let exit = m.add_block(f, "loop.exit");
        let x0 = m.append_inst(entry, t, InstKind::Load { ptr: p }, Some("x".into()));
        m.append_inst(entry, void, InstKind::Br { target: header }, None);
        let xphi = m.append_inst(
            header,
            t,
            InstKind::Phi {
                incoming: vec![(x0, entry)],
            },
            Some("x".into()),
        );
        let acc = m.append_inst(
            header,
            t,
            InstKind::Phi {
                incoming: vec![(x0, entry)],
            },
            Some("acc".into()),
        );
        m.append_inst(
            header,
            void,
            InstKind::CondBr {
                cond,
                then_block: body,
                else_block: exit,
            },
            None,
        );
        let d = m.append_inst(body, t, InstKind::Dot { a: xphi, b: xphi, acc }, None);
        let x1 = m.append_inst(body, t, InstKind::Load { ptr: p }, Some("x".into()));
        m.append_inst(body, void, InstKind::Br { target: header }, None);
        m.add_phi_incoming(xphi, x1, body);
        m.add_phi_incoming(acc, d, body);
        m.append_inst(exit, void, InstKind::Return, None);

        let copies = place_shared_copies(&mut m, &ctx);
        assert_eq!(copies.copies.len(), 2);
        assert_eq!(copies.double_buffers.len(), 1);
        let pair = copies.double_buffers[0];
        assert_eq!(copies.copies[0].source, x0);
        assert_eq!(copies.copies[1].source, x1);
        assert_eq!((pair.first, pair.second), (copies.copies[0].value, copies.copies[1].value));

        // The new phi sits in the header's phi group, right after the old one.
        let insts = &m.block(header).insts;
        assert_eq!(insts[1], pair.phi);
        let Some(InstKind::Phi { incoming }) = m.op(pair.phi) else {
            panic!("phi expected");
        };
        assert_eq!(incoming, &vec![(pair.first, entry), (pair.second, body)]);
        let Some(InstKind::Dot { a, b, .. }) = m.op(d) else {
            panic!("dot expected");
        };
        assert_eq!((*a, *b), (pair.phi, pair.phi));
    }
}
