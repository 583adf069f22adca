// allocation.rs — Shared-memory offsets for staged values
//
// Linear scan over live intervals in increasing start order. Intervals that
// ended before the current start leave the active set; the current value
// takes the lowest aligned offset that does not overlap any active region.
// Double-buffered copies have overlapping intervals (both cover their phi),
// so they always receive disjoint regions; the phi itself has no region.
//
// Preconditions: `compute_liveness` has run; tuning parameters are final.
// Postconditions: two values with overlapping intervals never share bytes;
//                 every region lies inside the budget.
// Failure modes: `AllocError::OutOfSharedMemory` on the first value that
//                does not fit, `AllocError::SizeOverflow` on a value whose
//                byte size overflows a u64. Nothing after it is placed.
// Side effects: none.

use std::collections::BTreeMap;

use log::{debug, trace};

use crate::error::AllocError;
use crate::id::ValueId;
use crate::ir::{Context, Module};
use crate::liveness::{LiveInterval, Liveness};

/// Alignment of every region, in bytes.
pub const ALIGNMENT: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Allocation {
    regions: BTreeMap<ValueId, Region>,
    intervals: BTreeMap<ValueId, LiveInterval>,
    budget: u64,
}

impl Allocation {
    pub fn region(&self, v: ValueId) -> Option<Region> {
        self.regions.get(&v).copied()
    }

    pub fn offset_of(&self, v: ValueId) -> Option<u64> {
        self.region(v).map(|r| r.offset)
    }

    /// Highest byte in use plus one.
    pub fn peak(&self) -> u64 {
        self.regions.values().map(Region::end).max().unwrap_or(0)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn regions(&self) -> impl Iterator<Item = (ValueId, Region)> + '_ {
        self.regions.iter().map(|(&v, &r)| (v, r))
    }

    /// Pairs of values that are live together and share bytes. Empty for
    /// any allocation produced by `allocate`.
    pub fn verify(&self) -> Vec<(ValueId, ValueId)> {
        let entries: Vec<(ValueId, Region, LiveInterval)> = self
            .regions
            .iter()
            .filter_map(|(&v, &r)| self.intervals.get(&v).map(|&i| (v, r, i)))
            .collect();
        let mut conflicts = Vec::new();
        for (i, (va, ra, ia)) in entries.iter().enumerate() {
            for (vb, rb, ib) in &entries[i + 1..] {
                if ia.overlaps(ib) && ra.overlaps(rb) {
                    conflicts.push((*va, *vb));
                }
            }
        }
        conflicts
    }

    /// One `value: offset +size [start, end]` line per region, by offset.
    pub fn describe(&self, module: &Module) -> String {
        let mut rows: Vec<(ValueId, Region)> = self.regions().collect();
        rows.sort_by_key(|(v, r)| (r.offset, *v));
        let mut out = String::new();
        for (v, r) in rows {
            out.push_str(&format!("{}: offset {} size {}", module.value_name(v), r.offset, r.size));
            if let Some(i) = self.intervals.get(&v) {
                out.push_str(&format!(" live {}", i));
            }
            out.push('\n');
        }
        out.push_str(&format!("peak {} of {} bytes\n", self.peak(), self.budget));
        out
    }
}

fn align_up(n: u64) -> u64 {
    n.div_ceil(ALIGNMENT) * ALIGNMENT
}

pub fn allocate(
    module: &Module,
    ctx: &Context,
    liveness: &Liveness,
    budget: u64,
) -> Result<Allocation, AllocError> {
    let mut alloc = Allocation {
        budget,
        ..Allocation::default()
    };
    let mut active: Vec<(ValueId, LiveInterval, Region)> = Vec::new();

    for &(v, interval) in liveness.intervals() {
        active.retain(|(_, i, _)| i.end >= interval.start);
        let ty = module.ty(v);
        let size = ctx
            .size_in_bytes(ty)
            .and_then(|n| n.checked_next_multiple_of(ALIGNMENT))
            .ok_or_else(|| AllocError::SizeOverflow {
                value: module.value_name(v),
                ty: ctx.type_name(ty),
            })?;

        let mut taken: Vec<Region> = active.iter().map(|(_, _, r)| *r).collect();
        taken.sort_by_key(|r| r.offset);

        let mut offset = 0u64;
        let mut largest_gap = 0u64;
        for r in &taken {
            if offset.saturating_add(size) <= r.offset {
                break;
            }
            largest_gap = largest_gap.max(r.offset.saturating_sub(offset));
            offset = offset.max(align_up(r.end()));
        }
        if offset.saturating_add(size) > budget {
            largest_gap = largest_gap.max(budget.saturating_sub(offset));
            return Err(AllocError::OutOfSharedMemory {
                value: module.value_name(v),
                requested: size,
                available: largest_gap,
                budget,
            });
        }

        let region = Region { offset, size };
        trace!(
            "allocation: {} at {} ({} bytes, live {})",
            module.value_name(v),
            offset,
            size,
            interval
        );
        alloc.regions.insert(v, region);
        alloc.intervals.insert(v, interval);
        active.push((v, interval, region));
    }

    debug!(
        "allocation: {} region(s), peak {} of {} bytes",
        alloc.regions.len(),
        alloc.peak(),
        budget
    );
    Ok(alloc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InstKind;
    use crate::liveness::compute_liveness;
    use crate::shared::{place_shared_copies, SharedCopies, StagedValue};

    fn staged(src: &str) -> (Context, Module, Liveness) {
        let result = crate::parser::parse(src);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        let program = result.program.expect("program");
        let mut ctx = Context::new();
        let mut module = Module::new("t");
        crate::irgen::build_ir(&program, &mut ctx, &mut module).expect("build");
        let copies = place_shared_copies(&mut module, &ctx);
        let live = compute_liveness(&module, &copies);
        (ctx, module, live)
    }

    #[test]
    fn matmul_operands_get_adjacent_buffers() {
        let (ctx, m, live) = staged(include_str!("../../kernels/matmul.tl"));
        let alloc = allocate(&m, &ctx, &live, 49152).unwrap();
        let mut regions: Vec<Region> = alloc.regions().map(|(_, r)| r).collect();
        regions.sort_by_key(|r| r.offset);
        assert_eq!(
            regions,
            vec![
                Region { offset: 0, size: 1024 },
                Region { offset: 1024, size: 1024 },
            ]
        );
        assert_eq!(alloc.peak(), 2048);
        assert!(alloc.verify().is_empty());
    }

    #[test]
    fn over_budget_reports_sizes() {
        let (ctx, m, live) = staged(include_str!("../../kernels/matmul.tl"));
        let err = allocate(&m, &ctx, &live, 1536).unwrap_err();
        let AllocError::OutOfSharedMemory {
            requested,
            available,
            budget,
            ..
        } = err
        else {
            panic!("expected out of shared memory, got {err:?}");
        };
        assert_eq!(requested, 1024);
        assert_eq!(available, 512);
        assert_eq!(budget, 1536);
    }

    #[test]
    fn exact_budget_fits() {
        let (ctx, m, live) = staged(include_str!("../../kernels/matmul.tl"));
        assert!(allocate(&m, &ctx, &live, 2048).is_ok());
        assert!(allocate(&m, &ctx, &live, 2047).is_err());
    }

    #[test]
    fn larger_budget_keeps_offsets() {
        let (ctx, m, live) = staged(include_str!("../../kernels/matmul.tl"));
        let small = allocate(&m, &ctx, &live, 2048).unwrap();
        let large = allocate(&m, &ctx, &live, 1 << 20).unwrap();
        let a: Vec<_> = small.regions().collect();
        let b: Vec<_> = large.regions().collect();
        assert_eq!(a, b);
    }

    /// One staged copy of a `shape` tile, defined and dropped in `entry`.
    fn lone_copy(shape: &[u32]) -> (Context, Module, Liveness) {
        let mut ctx = Context::new();
        let mut m = Module::new("t");
        let f32t = ctx.float_type(32);
        let void = ctx.void_type();
        let t = ctx.tile(f32t, shape);
        let f = m.add_function("f", void);
        let entry = m.add_block(f, "entry");
        let x = m.append_inst(entry, t, InstKind::Range { start: 0 }, None);
        let c = m.append_inst(entry, t, InstKind::CopyToShared { value: x }, None);
        m.append_inst(entry, void, InstKind::Return, None);
        let copies = SharedCopies {
            copies: vec![StagedValue { value: c, source: x }],
            ..SharedCopies::default()
        };
        let live = compute_liveness(&m, &copies);
        (ctx, m, live)
    }

    #[test]
    fn unrepresentable_size_is_an_error() {
        let (ctx, m, live) = lone_copy(&[u32::MAX, u32::MAX, u32::MAX]);
        let err = allocate(&m, &ctx, &live, 49152).unwrap_err();
        assert!(matches!(err, AllocError::SizeOverflow { .. }), "{err:?}");
        assert_eq!(err.to_diagnostic().code, Some(crate::diag::codes::E0302));
    }

    #[test]
    fn huge_representable_size_reports_its_request() {
        let (ctx, m, live) = lone_copy(&[65536, 65536]);
        let err = allocate(&m, &ctx, &live, 49152).unwrap_err();
        let AllocError::OutOfSharedMemory { requested, available, .. } = err else {
            panic!("expected out of shared memory, got {err:?}");
        };
        assert_eq!(requested, 4 << 32);
        assert_eq!(available, 49152);
    }

    #[test]
    fn sizes_round_up_to_alignment() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 16);
        assert_eq!(align_up(16), 16);
        assert_eq!(align_up(1000), 1008);
    }

    #[test]
    fn double_buffer_pair_gets_disjoint_regions() {
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
        let (ctx, m, live) = staged(src);
        let alloc = allocate(&m, &ctx, &live, 1024).unwrap();
        let mut regions: Vec<Region> = alloc.regions().map(|(_, r)| r).collect();
        regions.sort_by_key(|r| r.offset);
        assert_eq!(
            regions,
            vec![Region { offset: 0, size: 64 }, Region { offset: 64, size: 64 }]
        );
        assert!(allocate(&m, &ctx, &live, 127).is_err());
    }

    #[test]
    fn disjoint_lifetimes_reuse_offsets() {
        // Two reductions in sequence: the first pair of copies is dead
        // before the second is defined.
        let src = "void f(fp32 *p) {
            fp32* q[4, 4] = p + (0 ... 4)[:, newaxis] + (0 ... 4)[newaxis, :];
            fp32 x[4, 4] = *q;
            fp32 c[4, 4] = dot(x, x, 0);
            fp32 y[4, 4] = *q;
            fp32 d[4, 4] = dot(y, y, c);
            *q = d;
        }";
        let (ctx, m, live) = staged(src);
        let alloc = allocate(&m, &ctx, &live, 64).unwrap();
        let offsets: Vec<u64> = live
            .intervals()
            .iter()
            .map(|(v, _)| alloc.offset_of(*v).unwrap())
            .collect();
        assert_eq!(offsets, vec![0, 0]);
        assert_eq!(alloc.peak(), 64);
    }
}
