// liveness.rs — Live intervals of staged values
//
// Instructions are numbered once, in reverse post-order of each function's
// blocks, with one counter running across the whole module (first position
// is 1). Successors are visited last-first during the depth-first walk so a
// loop body directly follows its header and precedes the loop exit; loops
// are then contiguous position ranges found from back-edges.
//
// Only values placed in shared memory get intervals: `copy_to_shared`
// results, widened by the phis that merge double-buffered copies.
//
// Preconditions: `place_shared_copies` has run.
// Postconditions: every staged copy has exactly one interval with
//                 start ≤ end; intervals are sorted by (start, value).
// Failure modes: none.
// Side effects: none.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use log::{debug, trace};

use crate::id::{BlockId, FuncId, ValueId};
use crate::ir::{InstKind, Module};
use crate::shared::SharedCopies;

/// Closed range of instruction positions during which a value is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LiveInterval {
    pub start: u32,
    pub end: u32,
}

impl LiveInterval {
    pub fn overlaps(&self, other: &LiveInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, pos: u32) -> bool {
        self.start <= pos && pos <= self.end
    }

    fn cover(&mut self, other: LiveInterval) {
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }
}

impl fmt::Display for LiveInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// A natural loop: header block and the position range it spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRange {
    pub header: BlockId,
    pub latch: BlockId,
    pub span: LiveInterval,
}

#[derive(Debug, Clone, Default)]
pub struct Liveness {
    positions: HashMap<ValueId, u32>,
    block_order: Vec<BlockId>,
    loops: Vec<LoopRange>,
    intervals: Vec<(ValueId, LiveInterval)>,
}

impl Liveness {
    pub fn position(&self, v: ValueId) -> Option<u32> {
        self.positions.get(&v).copied()
    }

    /// Blocks of every function in numbering order.
    pub fn block_order(&self) -> &[BlockId] {
        &self.block_order
    }

    pub fn loops(&self) -> &[LoopRange] {
        &self.loops
    }

    /// Staged values and their intervals, by increasing start.
    pub fn intervals(&self) -> &[(ValueId, LiveInterval)] {
        &self.intervals
    }

    pub fn interval(&self, v: ValueId) -> Option<LiveInterval> {
        self.intervals
            .iter()
            .find(|(value, _)| *value == v)
            .map(|(_, i)| *i)
    }

    /// One `value: [start, end]` line per interval.
    pub fn describe(&self, module: &Module) -> String {
        let mut out = String::new();
        for (v, interval) in &self.intervals {
            out.push_str(&format!("{}: {}\n", module.value_name(*v), interval));
        }
        out
    }
}

// ── Analysis ───────────────────────────────────────────────────────────────

pub fn compute_liveness(module: &Module, copies: &SharedCopies) -> Liveness {
    let mut live = Liveness::default();
    let mut next = 1u32;
    let mut block_first: HashMap<BlockId, u32> = HashMap::new();
    let mut block_last: HashMap<BlockId, u32> = HashMap::new();

    for func in module.functions() {
        let order = reverse_post_order(module, func);
        let rank: HashMap<BlockId, usize> = order.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        for &block in &order {
            block_first.insert(block, next);
            for &v in &module.block(block).insts {
                live.positions.insert(v, next);
                next += 1;
            }
            block_last.insert(block, next - 1);
        }
        for &block in &order {
            for succ in module.successors(block) {
                if rank.get(&succ).is_some_and(|&h| h <= rank[&block]) {
                    live.loops.push(LoopRange {
                        header: succ,
                        latch: block,
                        span: LiveInterval {
                            start: block_first[&succ],
                            end: block_last[&block],
                        },
                    });
                }
            }
        }
        live.block_order.extend(order);
    }

    let mut intervals: BTreeMap<ValueId, LiveInterval> = BTreeMap::new();
    for copy in &copies.copies {
        if let Some(interval) = value_interval(module, &live, &block_last, copy.value) {
            intervals.insert(copy.value, interval);
        }
    }
    // A merged phi reads one of its two buffers for as long as it is live.
    for pair in &copies.double_buffers {
        let Some(phi) = value_interval(module, &live, &block_last, pair.phi) else {
            continue;
        };
        for v in [pair.first, pair.second] {
            if let Some(i) = intervals.get_mut(&v) {
                i.cover(phi);
            }
        }
    }

    let mut sorted: Vec<(ValueId, LiveInterval)> = intervals.into_iter().collect();
    sorted.sort_by_key(|(v, i)| (i.start, *v));
    for (v, i) in &sorted {
        trace!("liveness: {} {}", module.value_name(*v), i);
    }
    debug!(
        "liveness: {} position(s), {} loop(s), {} interval(s)",
        next - 1,
        live.loops.len(),
        sorted.len()
    );
    live.intervals = sorted;
    live
}

/// Definition through last use, widened across loops.
fn value_interval(
    module: &Module,
    live: &Liveness,
    block_last: &HashMap<BlockId, u32>,
    v: ValueId,
) -> Option<LiveInterval> {
    let def = live.position(v)?;
    let mut interval = LiveInterval { start: def, end: def };
    for &user in module.users(v) {
        let Some(upos) = live.position(user) else {
            continue;
        };
        match module.op(user) {
            Some(InstKind::Phi { incoming }) => {
                let header = module.inst(user).map(|i| i.block);
                for &(_, from) in incoming.iter().filter(|(x, _)| *x == v) {
                    // Phi operands are read on the edge, at the end of the
                    // incoming block.
                    let edge = block_last.get(&from).copied().unwrap_or(upos);
                    interval.end = interval.end.max(edge);
                    let back_edge = live
                        .loops
                        .iter()
                        .find(|l| Some(l.header) == header && l.latch == from);
                    if let Some(l) = back_edge {
                        interval.cover(l.span);
                    }
                }
            }
            _ => interval.end = interval.end.max(upos),
        }
    }
    // Defined before a loop and used inside it: live until the loop ends.
    for l in &live.loops {
        let used_inside = module
            .users(v)
            .iter()
            .filter_map(|&u| live.position(u))
            .any(|p| l.span.contains(p));
        if !l.span.contains(def) && used_inside {
            interval.end = interval.end.max(l.span.end);
        }
    }
    Some(interval)
}

/// Blocks reachable from the entry, in reverse post-order. `pop` takes the
/// last successor first, so the first successor finishes last and is
/// numbered first.
pub(crate) fn reverse_post_order(module: &Module, func: FuncId) -> Vec<BlockId> {
    let Some(&entry) = module.function(func).blocks.first() else {
        return Vec::new();
    };
    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut post = Vec::new();
    let mut stack: Vec<(BlockId, Vec<BlockId>)> = vec![(entry, module.successors(entry))];
    visited.insert(entry);
    while let Some((block, pending)) = stack.last_mut() {
        match pending.pop() {
            Some(succ) => {
                if visited.insert(succ) {
                    stack.push((succ, module.successors(succ)));
                }
            }
            None => {
                post.push(*block);
                stack.pop();
            }
        }
    }
    post.reverse();
    post
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Context;
    use crate::shared::place_shared_copies;

    fn build(src: &str) -> (Context, Module) {
        let result = crate::parser::parse(src);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        let program = result.program.expect("program");
        let mut ctx = Context::new();
        let mut module = Module::new("t");
        crate::irgen::build_ir(&program, &mut ctx, &mut module).expect("build");
        (ctx, module)
    }

    #[test]
    fn loop_body_follows_header() {
        let (ctx, mut m) = build(include_str!("../../kernels/matmul.tl"));
        let copies = place_shared_copies(&mut m, &ctx);
        let live = compute_liveness(&m, &copies);
        let names: Vec<&str> = live
            .block_order()
            .iter()
            .map(|&b| m.block(b).name.as_str())
            .collect();
        assert_eq!(names, vec!["entry", "loop.header", "loop.body", "loop.exit"]);
        assert_eq!(live.loops().len(), 1);
        let l = live.loops()[0];
        assert_eq!(m.block(l.header).name, "loop.header");
        assert_eq!(m.block(l.latch).name, "loop.body");
    }

    #[test]
    fn staged_interval_starts_at_copy_not_load() {
        let (ctx, mut m) = build(include_str!("../../kernels/matmul.tl"));
        let copies = place_shared_copies(&mut m, &ctx);
        let live = compute_liveness(&m, &copies);
        assert_eq!(live.intervals().len(), 2);
        for staged in &copies.copies {
            let i = live.interval(staged.value).expect("interval");
            let load = live.position(staged.source).unwrap();
            assert_eq!(i.start, live.position(staged.value).unwrap());
            assert_eq!(i.start, load + 1);
            assert!(i.end > i.start);
        }
        // Both operands are live at the reduction.
        let (a, b) = (live.intervals()[0].1, live.intervals()[1].1);
        assert!(a.overlaps(&b));
    }

    #[test]
    fn value_defined_before_loop_lives_to_loop_end() {
        let src = "void f(fp32 *p) {
            fp32* q[4, 4] = p + (0 ... 4)[:, newaxis] + (0 ... 4)[newaxis, :];
            fp32 x[4, 4] = *q;
            fp32 acc[4, 4] = 0;
            int32 k;
            for (k = 0; k < 4; k = k + 1) {
                acc = dot(x, x, acc);
            }
        }";
        let (ctx, mut m) = build(src);
        let copies = place_shared_copies(&mut m, &ctx);
        let live = compute_liveness(&m, &copies);
        let l = live.loops()[0];
        let (v, i) = live.intervals()[0];
        assert!(!l.span.contains(i.start), "{} defined inside loop", m.value_name(v));
        assert_eq!(i.end, l.span.end);
    }

    #[test]
    fn back_edge_copy_is_live_over_the_whole_loop() {
        let src = "void f(fp32 *p, int32 K) {
            int32 k;
            fp32* q[4, 4] = p + (0 ... 4)[:, newaxis] + (0 ... 4)[newaxis, :];
            fp32 x[4, 4] = *q;
            fp32 c[4, 4] = 0;
            for(k = K; k > 0; k = k - 1){
                c = dot(x, x, c);
                x = *q;
            }
            *q = c;
        }";
        let (ctx, mut m) = build(src);
        let copies = place_shared_copies(&mut m, &ctx);
        let live = compute_liveness(&m, &copies);
        let l = live.loops()[0];
        let pair = copies.double_buffers[0];

        // Defined in the latch, but read by the header phi on the next
        // iteration: the interval reaches back to the header, not the latch.
        let def = live.position(pair.second).unwrap();
        let latch_start = live.position(m.block(l.latch).insts[0]).unwrap();
        assert!(def > latch_start);
        let i = live.interval(pair.second).expect("interval");
        assert_eq!(i, l.span);
        assert!(i.start < latch_start);
    }

    #[test]
    fn unused_copy_is_a_point() {
        let mut ctx = Context::new();
        let mut m = Module::new("t");
        let f32t = ctx.float_type(32);
        let void = ctx.void_type();
        let t = ctx.tile(f32t, &[4]);
        let f = m.add_function("f", void);
        let entry = m.add_block(f, "entry");
        let x = m.append_inst(entry, t, InstKind::Range { start: 0 }, None);
        let c = m.append_inst(entry, t, InstKind::CopyToShared { value: x }, None);
        m.append_inst(entry, void, InstKind::Return, None);
        let copies = SharedCopies {
            copies: vec![crate::shared::StagedValue { value: c, source: x }],
            ..SharedCopies::default()
        };
        let live = compute_liveness(&m, &copies);
        assert_eq!(live.interval(c), Some(LiveInterval { start: 2, end: 2 }));
    }

    #[test]
    fn positions_continue_across_functions() {
        let (ctx, mut m) = build("void f() { return; } void g() { return; }");
        let copies = place_shared_copies(&mut m, &ctx);
        let live = compute_liveness(&m, &copies);
        let f = m.function_by_name("f").unwrap();
        let g = m.function_by_name("g").unwrap();
        let first = |func| {
            let b = m.function(func).blocks[0];
            live.position(m.block(b).insts[0]).unwrap()
        };
        assert_eq!(first(f), 1);
        assert_eq!(first(g), 2);
    }
}
