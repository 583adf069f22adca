// tune.rs — Tuning engine: layout classes, parameters, constraints
//
// Every tile axis is distributed over the hardware in three levels: each
// lane holds `nts` consecutive elements, `mts` lanes of a warp cover the
// axis side by side, and `wpt` warps repeat that pattern. Axes that must
// share a distribution (operands and results of elementwise operations,
// loads, phis, reduction outputs) are unified into layout classes, and each
// class owns one parameter per level.
//
// Preconditions: `run` receives a module produced by `irgen`.
// Postconditions: parameters are enumerated in function order, instruction
//                 definition order, then axis order; each class with
//                 extent > 1 contributes `p0` (nts), `p1` (mts), `p2` (wpt).
// Failure modes: `apply_overrides` rejects lists of the wrong length.
//                Constraint violations are returned as data, never raised.
// Side effects: none (constraint checking never mutates the tuner).

use std::collections::{BTreeMap, HashMap};

use log::{debug, trace};

use crate::config::TargetConfig;
use crate::error::ParamError;
use crate::id::{FuncId, ParamId, ValueId};
use crate::ir::{Context, InstKind, Module};

// ── Parameters ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Consecutive elements per lane (`p0`).
    Nts,
    /// Lanes per warp along the axis (`p1`).
    Mts,
    /// Warps along the axis (`p2`).
    Wpt,
}

impl ParamKind {
    fn index(self) -> usize {
        match self {
            ParamKind::Nts => 0,
            ParamKind::Mts => 1,
            ParamKind::Wpt => 2,
        }
    }
}

/// Named integer unknown bound to (instruction, axis).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub id: ParamId,
    /// `rx.p1.d0`: owner name, level, axis.
    pub name: String,
    pub owner: ValueId,
    pub axis: u32,
    pub kind: ParamKind,
    pub default: u32,
    pub value: u32,
}

// ── Layout classes ────────────────────────────────────────────────────────

/// Set of tile axes that share one distribution over lanes and warps.
#[derive(Debug, Clone)]
pub struct LayoutClass {
    pub func: FuncId,
    pub extent: u32,
    /// First member in definition order.
    pub representative: (ValueId, u32),
    /// `None` for unit-extent classes, which are fixed to (1, 1, 1).
    pub params: Option<[ParamId; 3]>,
}

#[derive(Debug, Clone)]
struct TileRecord {
    value: ValueId,
    func: FuncId,
    classes: Vec<usize>,
    /// Maximal rank in its function and no unit axes.
    full: bool,
    rank_gt1: usize,
}

/// Resolved distribution of one tile axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisLayout {
    pub extent: u32,
    pub nts: u32,
    pub mts: u32,
    pub wpt: u32,
    /// Lane-id stride of this axis' lane coordinate.
    pub lane_stride: u32,
    /// Warp-id stride of this axis' warp coordinate.
    pub warp_stride: u32,
}

impl AxisLayout {
    pub const FIXED: AxisLayout = AxisLayout {
        extent: 1,
        nts: 1,
        mts: 1,
        wpt: 1,
        lane_stride: 1,
        warp_stride: 1,
    };

    /// Elements covered by one pass of all lanes and warps.
    pub fn span(&self) -> u32 {
        self.nts.saturating_mul(self.mts).saturating_mul(self.wpt)
    }

    /// Elements of this axis held by each lane.
    pub fn per_lane(&self) -> u32 {
        match self.mts.checked_mul(self.wpt) {
            Some(d) if d > 0 => self.extent / d,
            _ => 0,
        }
    }
}

// ── Constraints ───────────────────────────────────────────────────────────

/// Predicate over parameters, registered against the value whose shape it
/// governs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// Parameter value ≥ 1.
    Positive { param: ParamId },
    /// Class extent divisible by nts·mts·wpt.
    ExtentDivisible { class: usize },
    /// Lanes of a tile: exactly the warp when `exact`, else a divisor.
    LanesPerWarp { tile: usize, exact: bool },
    /// Warps per block identical to the function's reference tile.
    WarpsConsistent { tile: usize, reference: usize },
    /// Lanes × warps within the target limit.
    ThreadsPerBlock { tile: usize },
    /// Lane strides of the tile's classes form a mixed radix.
    LaneStrides { tile: usize },
    /// Warp strides of the tile's classes form a mixed radix.
    WarpStrides { tile: usize },
}

// ── Union-find ────────────────────────────────────────────────────────────

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb.max(ra)] = rb.min(ra);
        }
    }
}

// ── Tuner ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Tuner {
    warp_size: u32,
    max_threads_per_block: u32,
    nodes: HashMap<(ValueId, u32), usize>,
    classes: Vec<LayoutClass>,
    tiles: Vec<TileRecord>,
    params: Vec<Parameter>,
    constraints: Vec<Constraint>,
}

impl Tuner {
    pub fn new(target: &TargetConfig) -> Self {
        Self {
            warp_size: target.warp_size,
            max_threads_per_block: target.max_threads_per_block,
            nodes: HashMap::new(),
            classes: Vec::new(),
            tiles: Vec::new(),
            params: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn warp_size(&self) -> u32 {
        self.warp_size
    }

    /// Discover layout classes and parameters, assign defaults and register
    /// constraints. Replaces any previous state.
    pub fn run(&mut self, module: &Module, ctx: &Context) {
        self.nodes.clear();
        self.classes.clear();
        self.tiles.clear();
        self.params.clear();
        self.constraints.clear();

        for func in module.functions() {
            self.discover(module, ctx, func);
        }
        for func in module.functions() {
            self.assign_defaults(func);
        }
        self.register_constraints();
        debug!(
            "tune: {} class(es), {} parameter(s), {} constraint(s)",
            self.classes.len(),
            self.params.len(),
            self.constraints.len()
        );
    }

    fn discover(&mut self, module: &Module, ctx: &Context, func: FuncId) {
        let insts = module.instructions(func);
        let shape_of = move |v: ValueId| ctx.shape(module.ty(v));

        // Nodes, in definition order then axis order.
        let mut node_list: Vec<(ValueId, u32)> = Vec::new();
        let mut index: HashMap<(ValueId, u32), usize> = HashMap::new();
        for &v in &insts {
            if let Some(shape) = shape_of(v) {
                for axis in 0..shape.len() as u32 {
                    index.insert((v, axis), node_list.len());
                    node_list.push((v, axis));
                }
            }
        }

        let mut uf = UnionFind::new(node_list.len());
        let tie_all = |uf: &mut UnionFind, a: ValueId, b: ValueId| {
            let (Some(sa), Some(sb)) = (shape_of(a), shape_of(b)) else {
                return;
            };
            if sa.len() != sb.len() {
                return;
            }
            for axis in 0..sa.len() as u32 {
                if sa[axis as usize] == sb[axis as usize] {
                    if let (Some(&x), Some(&y)) = (index.get(&(a, axis)), index.get(&(b, axis))) {
                        uf.union(x, y);
                    }
                }
            }
        };
        let tie = |uf: &mut UnionFind, a: (ValueId, u32), b: (ValueId, u32)| {
            if let (Some(&x), Some(&y)) = (index.get(&a), index.get(&b)) {
                uf.union(x, y);
            }
        };

        for &v in &insts {
            let Some(op) = module.op(v) else { continue };
            match op {
                InstKind::Binary { lhs, rhs, .. }
                | InstKind::Cmp { lhs, rhs, .. }
                | InstKind::Gep {
                    ptr: lhs,
                    offset: rhs,
                } => {
                    tie_all(&mut uf, v, *lhs);
                    tie_all(&mut uf, v, *rhs);
                }
                InstKind::Load { ptr } => tie_all(&mut uf, v, *ptr),
                InstKind::Store { ptr, value } => tie_all(&mut uf, *ptr, *value),
                InstKind::Phi { incoming } => {
                    for (inc, _) in incoming {
                        tie_all(&mut uf, v, *inc);
                    }
                }
                InstKind::Broadcast { value } | InstKind::CopyToShared { value } => {
                    tie_all(&mut uf, v, *value)
                }
                InstKind::Reshape { value } => {
                    let (Some(from), Some(to)) = (shape_of(*value), shape_of(v)) else {
                        continue;
                    };
                    let src = (0..from.len() as u32).filter(|&k| from[k as usize] > 1);
                    let dst = (0..to.len() as u32).filter(|&k| to[k as usize] > 1);
                    for (a, b) in src.zip(dst) {
                        tie(&mut uf, (*value, a), (v, b));
                    }
                }
                InstKind::Dot { a, b, acc } => {
                    tie(&mut uf, (v, 0), (*a, 0));
                    tie(&mut uf, (v, 1), (*b, 1));
                    tie_all(&mut uf, v, *acc);
                }
                InstKind::Range { .. }
                | InstKind::GlobalRange { .. }
                | InstKind::Splat { .. }
                | InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Return => {}
            }
        }

        // Node indices follow definition order, so the smallest index of a
        // group is its representative and sorting by it orders the classes.
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for n in 0..node_list.len() {
            let root = uf.find(n);
            groups.entry(root).or_default().push(n);
        }
        let mut ordered: Vec<Vec<usize>> = groups.into_values().collect();
        ordered.sort_by_key(|members| members[0]);

        for members in ordered {
            let (rep, rep_axis) = node_list[members[0]];
            let extent = shape_of(rep).map(|s| s[rep_axis as usize]).unwrap_or(1);
            let class = self.classes.len();
            let params = (extent > 1).then(|| {
                let owner = module
                    .value(rep)
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("%{}", rep.0));
                [ParamKind::Nts, ParamKind::Mts, ParamKind::Wpt].map(|kind| {
                    let id = ParamId(self.params.len() as u32);
                    self.params.push(Parameter {
                        id,
                        name: format!("{}.p{}.d{}", owner, kind.index(), rep_axis),
                        owner: rep,
                        axis: rep_axis,
                        kind,
                        default: 1,
                        value: 1,
                    });
                    id
                })
            });
            for &m in &members {
                self.nodes.insert(node_list[m], class);
            }
            self.classes.push(LayoutClass {
                func,
                extent,
                representative: (rep, rep_axis),
                params,
            });
        }

        let max_rank = insts
            .iter()
            .filter_map(|&v| shape_of(v).map(|s| s.len()))
            .max()
            .unwrap_or(0);
        for &v in &insts {
            let Some(shape) = shape_of(v) else { continue };
            let classes = (0..shape.len() as u32)
                .map(|axis| self.nodes[&(v, axis)])
                .collect();
            self.tiles.push(TileRecord {
                value: v,
                func,
                classes,
                full: shape.len() == max_rank && shape.iter().all(|&d| d > 1),
                rank_gt1: crate::shape::rank_gt1(shape),
            });
        }
    }

    /// `p0 = p2 = 1`; `p1` doubles round-robin over the open axes of each
    /// full-rank tile while the lanes still fit in one warp.
    fn assign_defaults(&mut self, func: FuncId) {
        let mut finalized = vec![false; self.classes.len()];
        let full: Vec<usize> = (0..self.tiles.len())
            .filter(|&t| self.tiles[t].func == func && self.tiles[t].full)
            .collect();
        for t in full {
            let classes = self.tiles[t].classes.clone();
            let mut open: Vec<usize> = Vec::new();
            for &c in &classes {
                if self.classes[c].params.is_some() && !finalized[c] && !open.contains(&c) {
                    open.push(c);
                }
            }
            let mut lanes: u32 = classes.iter().map(|&c| self.value(c, ParamKind::Mts)).product();
            loop {
                let mut grew = false;
                for &c in &open {
                    let mts = self.value(c, ParamKind::Mts);
                    if lanes * 2 <= self.warp_size && self.classes[c].extent % (mts * 2) == 0 {
                        self.set_class_default(c, ParamKind::Mts, mts * 2);
                        lanes *= 2;
                        grew = true;
                    }
                }
                if !grew {
                    break;
                }
            }
            for c in classes {
                finalized[c] = true;
            }
        }
        for p in &self.params {
            trace!("tune: default {} = {}", p.name, p.default);
        }
    }

    fn set_class_default(&mut self, class: usize, kind: ParamKind, value: u32) {
        if let Some(ids) = self.classes[class].params {
            let p = &mut self.params[ids[kind.index()].index()];
            p.default = value;
            p.value = value;
        }
    }

    fn register_constraints(&mut self) {
        let mut out = Vec::new();
        for p in &self.params {
            out.push(Constraint::Positive { param: p.id });
        }
        for (c, class) in self.classes.iter().enumerate() {
            if class.params.is_some() {
                out.push(Constraint::ExtentDivisible { class: c });
            }
        }
        let mut reference: HashMap<FuncId, usize> = HashMap::new();
        for (t, tile) in self.tiles.iter().enumerate() {
            out.push(Constraint::LanesPerWarp {
                tile: t,
                exact: tile.full,
            });
            if !tile.full {
                continue;
            }
            match reference.get(&tile.func) {
                None => {
                    reference.insert(tile.func, t);
                    out.push(Constraint::ThreadsPerBlock { tile: t });
                }
                Some(&r) => out.push(Constraint::WarpsConsistent {
                    tile: t,
                    reference: r,
                }),
            }
            out.push(Constraint::LaneStrides { tile: t });
            out.push(Constraint::WarpStrides { tile: t });
        }
        self.constraints = out;
    }

    // ── Enumeration and mutation ──

    /// All parameters in stable enumeration order.
    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn classes(&self) -> &[LayoutClass] {
        &self.classes
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn set(&mut self, id: ParamId, value: u32) {
        self.params[id.index()].value = value;
    }

    pub fn set_by_name(&mut self, name: &str, value: u32) -> Result<(), ParamError> {
        let p = self
            .params
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| ParamError::UnknownName(name.to_string()))?;
        p.value = value;
        Ok(())
    }

    /// Overwrite every parameter by position.
    pub fn apply_overrides(&mut self, values: &[u32]) -> Result<(), ParamError> {
        if values.len() != self.params.len() {
            return Err(ParamError::CountMismatch {
                expected: self.params.len(),
                got: values.len(),
            });
        }
        for (p, &v) in self.params.iter_mut().zip(values) {
            p.value = v;
        }
        Ok(())
    }

    /// Current values in enumeration order.
    pub fn values(&self) -> Vec<u32> {
        self.params.iter().map(|p| p.value).collect()
    }

    fn value(&self, class: usize, kind: ParamKind) -> u32 {
        match self.classes[class].params {
            Some(ids) => self.params[ids[kind.index()].index()].value,
            None => 1,
        }
    }

    /// `name = value` per parameter, one per line.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for p in &self.params {
            out.push_str(&format!("{} = {}\n", p.name, p.value));
        }
        out
    }

    // ── Layout queries ──

    /// Lane and warp strides per class under the current values. A class
    /// takes its strides from the first full-rank tile containing it, else
    /// from the first tile with the most non-unit axes.
    fn strides(&self) -> Vec<(u32, u32)> {
        let mut strides: Vec<Option<(u32, u32)>> = vec![None; self.classes.len()];
        let mut order: Vec<usize> = (0..self.tiles.len()).collect();
        order.sort_by_key(|&t| (!self.tiles[t].full, std::cmp::Reverse(self.tiles[t].rank_gt1), t));
        for t in order {
            let (mut lane, mut warp) = (1u32, 1u32);
            for &c in &self.tiles[t].classes {
                if self.classes[c].params.is_none() {
                    continue;
                }
                if strides[c].is_none() {
                    strides[c] = Some((lane, warp));
                }
                lane = lane.saturating_mul(self.value(c, ParamKind::Mts));
                warp = warp.saturating_mul(self.value(c, ParamKind::Wpt));
            }
        }
        strides.into_iter().map(|s| s.unwrap_or((1, 1))).collect()
    }

    fn class_layout(&self, class: usize, strides: &[(u32, u32)]) -> AxisLayout {
        if self.classes[class].params.is_none() {
            return AxisLayout::FIXED;
        }
        AxisLayout {
            extent: self.classes[class].extent,
            nts: self.value(class, ParamKind::Nts),
            mts: self.value(class, ParamKind::Mts),
            wpt: self.value(class, ParamKind::Wpt),
            lane_stride: strides[class].0,
            warp_stride: strides[class].1,
        }
    }

    /// Layout of every axis of `v`, or `None` if `v` is not a known tile.
    pub fn layout_of(&self, v: ValueId, rank: usize) -> Option<Vec<AxisLayout>> {
        let strides = self.strides();
        (0..rank as u32)
            .map(|axis| {
                self.nodes
                    .get(&(v, axis))
                    .map(|&c| self.class_layout(c, &strides))
            })
            .collect()
    }

    /// Class index of `(v, axis)`.
    pub fn class_of(&self, v: ValueId, axis: u32) -> Option<usize> {
        self.nodes.get(&(v, axis)).copied()
    }

    /// Layout of every class, indexed by class.
    pub fn class_layouts(&self) -> Vec<AxisLayout> {
        let strides = self.strides();
        (0..self.classes.len())
            .map(|c| self.class_layout(c, &strides))
            .collect()
    }

    /// Warps per block of `func`: product of `wpt` over its first full-rank
    /// tile.
    pub fn warps_per_block(&self, func: FuncId) -> u32 {
        self.tiles
            .iter()
            .find(|t| t.func == func && t.full)
            .map(|t| self.warps_of(t))
            .unwrap_or(1)
    }

    pub fn threads_per_block(&self, func: FuncId) -> u32 {
        self.warp_size.saturating_mul(self.warps_per_block(func))
    }

    fn lanes_of(&self, tile: &TileRecord) -> u32 {
        tile.classes
            .iter()
            .fold(1u32, |acc, &c| acc.saturating_mul(self.value(c, ParamKind::Mts)))
    }

    fn warps_of(&self, tile: &TileRecord) -> u32 {
        tile.classes
            .iter()
            .fold(1u32, |acc, &c| acc.saturating_mul(self.value(c, ParamKind::Wpt)))
    }

    // ── Validation ──

    /// Evaluate every registered constraint against the current values.
    /// Returns offending value → violation descriptions; empty when all
    /// constraints hold. Pure: calling it twice yields identical results.
    pub fn check_constraints(&self) -> BTreeMap<ValueId, Vec<String>> {
        let strides = self.strides();
        let mut errors: BTreeMap<ValueId, Vec<String>> = BTreeMap::new();
        let mut report = |v: ValueId, msg: String| errors.entry(v).or_default().push(msg);

        for constraint in &self.constraints {
            match constraint {
                Constraint::Positive { param } => {
                    let p = &self.params[param.index()];
                    if p.value == 0 {
                        report(p.owner, format!("parameter {} must be at least 1", p.name));
                    }
                }
                Constraint::ExtentDivisible { class } => {
                    let layout = self.class_layout(*class, &strides);
                    let (rep, axis) = self.classes[*class].representative;
                    let span = layout.span();
                    if span == 0 || layout.extent % span != 0 {
                        report(
                            rep,
                            format!(
                                "for dim {}: shape ({}) is not a multiple of layout ({})",
                                axis, layout.extent, span
                            ),
                        );
                    }
                }
                Constraint::LanesPerWarp { tile, exact } => {
                    let record = &self.tiles[*tile];
                    let lanes = self.lanes_of(record);
                    if *exact && lanes != self.warp_size {
                        report(
                            record.value,
                            format!(
                                "number of threads per warp ({}) must be {}",
                                lanes, self.warp_size
                            ),
                        );
                    } else if !*exact && (lanes == 0 || self.warp_size % lanes != 0) {
                        report(
                            record.value,
                            format!(
                                "number of threads per warp ({}) must divide {}",
                                lanes, self.warp_size
                            ),
                        );
                    }
                }
                Constraint::WarpsConsistent { tile, reference } => {
                    let (record, base) = (&self.tiles[*tile], &self.tiles[*reference]);
                    let (w, expected) = (self.warps_of(record), self.warps_of(base));
                    if w != expected {
                        report(
                            record.value,
                            format!(
                                "number of warps ({}) differs from {} used by %{}",
                                w, expected, base.value.0
                            ),
                        );
                    }
                }
                Constraint::ThreadsPerBlock { tile } => {
                    let record = &self.tiles[*tile];
                    let threads = self.lanes_of(record).saturating_mul(self.warps_of(record));
                    if threads > self.max_threads_per_block {
                        report(
                            record.value,
                            format!(
                                "number of threads per block ({}) exceeds {}",
                                threads, self.max_threads_per_block
                            ),
                        );
                    }
                }
                Constraint::LaneStrides { tile } => {
                    let record = &self.tiles[*tile];
                    let radix: Vec<(u32, u32)> = self
                        .distributed(record)
                        .map(|c| (strides[c].0, self.value(c, ParamKind::Mts)))
                        .collect();
                    if !is_mixed_radix(radix) {
                        report(record.value, "lane layout does not tile the warp".to_string());
                    }
                }
                Constraint::WarpStrides { tile } => {
                    let record = &self.tiles[*tile];
                    let radix: Vec<(u32, u32)> = self
                        .distributed(record)
                        .map(|c| (strides[c].1, self.value(c, ParamKind::Wpt)))
                        .collect();
                    if !is_mixed_radix(radix) {
                        report(record.value, "warp layout does not tile the block".to_string());
                    }
                }
            }
        }
        errors
    }

    /// Tunable classes of a tile, in axis order.
    fn distributed<'a>(&'a self, tile: &'a TileRecord) -> impl Iterator<Item = usize> + 'a {
        tile.classes
            .iter()
            .copied()
            .filter(move |&c| self.classes[c].params.is_some())
    }
}

/// True if `(stride, radix)` pairs, sorted by stride, enumerate every index
/// below their product exactly once. Radix-1 digits are ignored.
fn is_mixed_radix(mut digits: Vec<(u32, u32)>) -> bool {
    digits.retain(|&(_, radix)| radix > 1);
    digits.sort_unstable();
    let mut expected = 1u32;
    for (stride, radix) in digits {
        if stride != expected {
            return false;
        }
        expected = expected.saturating_mul(radix);
    }
    true
}

// ── Tests ──────────────────────────────────────────────────────────────────
