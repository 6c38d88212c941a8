//! Chaitin/Briggs-style graph-coloring register allocation with move
//! coalescing. Runs once per register class (`RegClass::Gpr`, then
//! `RegClass::Sse`) over the vreg-using assembly the `asm` module produces.
//!
//! Pipeline within one class: number instructions and compute the CFG, run
//! backward liveness to a fixpoint, build per-register live ranges from the
//! converged `live_in` sets, derive the interference and coalescing graphs
//! from those ranges, run simplify/coalesce/freeze/spill to pick a coloring
//! order, select physical registers, then rewrite operands and delete
//! redundant moves.

use crate::common::*;
use crate::back::asm::{
    AsmBbId, AsmFn, AsmInsId, AsmOpr, GprSize, RegId, RegSet, X64Op, CALL_CLOBBERED_GPRS,
    NUM_GPR_PREGS, NUM_XMM_PREGS, RAX, RBP, RDX, RSP,
};

/// Which register file a pass is allocating for. Pregs and vregs share one
/// numeric id space *within* a class (`SPEC_FULL.md` §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegClass {
    Gpr,
    Sse,
}

fn num_pregs(class: RegClass) -> u32 {
    match class {
        RegClass::Gpr => NUM_GPR_PREGS,
        RegClass::Sse => NUM_XMM_PREGS,
    }
}

const ALL_XMM: [RegId; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

fn operand_reg(class: RegClass, opr: &AsmOpr) -> Option<RegId> {
    match (class, opr) {
        (RegClass::Gpr, AsmOpr::Gpr { id, .. }) => Some(*id),
        (RegClass::Sse, AsmOpr::Xmm { id }) => Some(*id),
        _ => None,
    }
}

fn mem_regs(class: RegClass, opr: &AsmOpr) -> Vec<RegId> {
    if class != RegClass::Gpr {
        return Vec::new();
    }
    match opr {
        AsmOpr::Mem { base, index, .. } => {
            let mut v = vec![*base];
            if let Some((idx, _)) = index {
                v.push(*idx);
            }
            v
        }
        _ => Vec::new(),
    }
}

/// Physical registers an opcode clobbers outright (`SPEC_FULL.md` §4.2's
/// clobber table: `CWD/CDQ/CQO` -> RDX, `IDIV/DIV` -> RAX+RDX, `CALL` ->
/// all System V caller-saved GPRs, or for the SSE class, all XMMs).
fn clobbers(class: RegClass, op: X64Op) -> &'static [RegId] {
    match (class, op) {
        (RegClass::Gpr, X64Op::Cwd | X64Op::Cdq | X64Op::Cqo) => &[RDX],
        (RegClass::Gpr, X64Op::Idiv | X64Op::Div) => &[RAX, RDX],
        (RegClass::Gpr, X64Op::Call) => &CALL_CLOBBERED_GPRS,
        (RegClass::Sse, X64Op::Call) => &ALL_XMM,
        _ => &[],
    }
}

/// Merges `i` into an adjacent existing interval, or starts a new one.
fn mark_idx_live(range: &mut Vec<(i32, i32)>, i: i32) {
    for iv in range.iter_mut() {
        if i >= iv.0 - 1 && i <= iv.1 + 1 {
            iv.0 = iv.0.min(i);
            iv.1 = iv.1.max(i);
            return;
        }
    }
    range.push((i, i));
    range.sort_by_key(|iv| iv.0);
}

/// Any-pair interval overlap between two ranges. Iterates both ranges with
/// their own indices (the source's `ranges_intersect` reused `i` for both,
/// a known defect fixed here per `SPEC_FULL.md` §4.2).
fn ranges_intersect(a: &[(i32, i32)], b: &[(i32, i32)]) -> bool {
    for &(a_start, a_end) in a {
        for &(b_start, b_end) in b {
            if a_start <= b_end && b_start <= a_end {
                return true;
            }
        }
    }
    false
}

/// Like [`ranges_intersect`], but an overlap that is *exactly* the single
/// point `exclude` doesn't count — used to check a move's own operands,
/// whose ranges legitimately touch at the move's own program point.
fn ranges_intersect_excluding(a: &[(i32, i32)], b: &[(i32, i32)], exclude: i32) -> bool {
    for &(a_start, a_end) in a {
        for &(b_start, b_end) in b {
            let lo = a_start.max(b_start);
            let hi = a_end.min(b_end);
            if lo <= hi && !(lo == hi && lo == exclude) {
                return true;
            }
        }
    }
    false
}

fn gpr_size_bytes(size: GprSize) -> u32 {
    match size {
        GprSize::R8L => 1,
        GprSize::R16 => 2,
        GprSize::R32 => 4,
        GprSize::R64 => 8,
    }
}

/// Recomputes `preds`/`succs` for every block from each block's terminator
/// (or implicit fall-through, if the block doesn't end in an unconditional
/// jump or `ret`).
fn compute_cfg(fn_: &mut AsmFn) {
    let bbs = fn_.bbs.clone();
    for &bb in &bbs {
        fn_.bb_mut(bb).preds.clear();
        fn_.bb_mut(bb).succs.clear();
    }
    for (i, &bb) in bbs.iter().enumerate() {
        let mut succs = Vec::new();
        let mut terminal = false;
        if let Some(tail) = fn_.bb(bb).tail {
            let ins = fn_.ins(tail);
            match ins.op {
                X64Op::Jmp => {
                    if let Some(AsmOpr::Bb(t)) = &ins.l {
                        succs.push(*t);
                    }
                    terminal = true;
                }
                X64Op::Je
                | X64Op::Jne
                | X64Op::Jl
                | X64Op::Jle
                | X64Op::Jg
                | X64Op::Jge
                | X64Op::Jb
                | X64Op::Jbe
                | X64Op::Ja
                | X64Op::Jae => {
                    if let Some(AsmOpr::Bb(t)) = &ins.l {
                        succs.push(*t);
                    }
                }
                X64Op::Ret => terminal = true,
                _ => {}
            }
        }
        if !terminal {
            if let Some(&next) = bbs.get(i + 1) {
                succs.push(next);
            }
        }
        for &s in &succs {
            fn_.bb_mut(s).preds.insert(bb);
        }
        fn_.bb_mut(bb).succs = succs;
    }
}

/// Assigns each instruction a strictly increasing `n`, leaving one spare
/// value between blocks as the end-of-block program point.
fn number_instructions(fn_: &mut AsmFn) {
    let mut n = 0i32;
    let bbs = fn_.bbs.clone();
    for bb in bbs {
        for id in fn_.ins_in(bb).collect::<Vec<_>>() {
            fn_.ins_mut(id).n = n;
            n += 1;
        }
        n += 1;
    }
}

/// One backward step of liveness over a single instruction: use-side
/// (including clobbers and, for the GPR class, RSP/RBP), optional live-range
/// extension, def-side kill, then the physical-register reset.
fn step_live(
    fn_: &AsmFn,
    class: RegClass,
    id: AsmInsId,
    live: &mut RegSet,
    mut ranges: Option<&mut [Vec<(i32, i32)>]>,
) {
    let ins = fn_.ins(id);
    if let Some(l) = &ins.l {
        if let Some(r) = operand_reg(class, l) {
            live.insert(r);
        }
        for r in mem_regs(class, l) {
            live.insert(r);
        }
    }
    if let Some(r_opr) = &ins.r {
        if let Some(r) = operand_reg(class, r_opr) {
            live.insert(r);
        }
        for r in mem_regs(class, r_opr) {
            live.insert(r);
        }
    }
    if class == RegClass::Gpr {
        live.insert(RSP);
        live.insert(RBP);
    }
    for &c in clobbers(class, ins.op) {
        live.insert(c);
    }

    if let Some(ranges) = ranges.as_deref_mut() {
        for r in live.iter() {
            mark_idx_live(&mut ranges[r as usize], ins.n);
        }
    }

    if ins.op.defines_left() {
        if let Some(l) = &ins.l {
            if let Some(r) = operand_reg(class, l) {
                live.remove(r);
            }
        }
    }

    for p in 0..num_pregs(class) {
        live.remove(p);
    }
}

/// Backward, worklist-based fixpoint over every block's `live_in`.
fn compute_live_in(fn_: &mut AsmFn, class: RegClass) {
    let bbs = fn_.bbs.clone();
    for &bb in &bbs {
        fn_.bb_mut(bb).live_in = RegSet::new();
    }
    let mut worklist: std::collections::VecDeque<AsmBbId> = bbs.iter().copied().collect();
    let mut iterations = 0u32;
    while let Some(bb) = worklist.pop_front() {
        iterations += 1;
        let succs = fn_.bb(bb).succs.clone();
        let mut live = RegSet::new();
        for s in &succs {
            live.union_with(&fn_.bb(*s).live_in);
        }
        for id in fn_.ins_in(bb).collect::<Vec<_>>().into_iter().rev() {
            step_live(fn_, class, id, &mut live, None);
        }
        if live != fn_.bb(bb).live_in {
            fn_.bb_mut(bb).live_in = live;
            for p in fn_.bb(bb).preds.clone() {
                worklist.push_back(p);
            }
        }
    }
    log::trace!("{class:?}: liveness fixpoint converged after {iterations} block visits");
}

/// Builds the per-register live-range interval vectors from the converged
/// `live_in` sets with one more backward pass per block.
fn build_ranges(fn_: &AsmFn, class: RegClass, num_regs: u32) -> Vec<Vec<(i32, i32)>> {
    let mut ranges = vec![Vec::new(); num_regs as usize];
    for &bb in &fn_.bbs {
        let mut live = RegSet::new();
        for &s in &fn_.bb(bb).succs {
            live.union_with(&fn_.bb(s).live_in);
        }
        let ids: Vec<_> = fn_.ins_in(bb).collect();
        if let Some(&last) = ids.last() {
            let seed = fn_.ins(last).n + 1;
            for r in live.iter() {
                mark_idx_live(&mut ranges[r as usize], seed);
            }
        }
        for &id in ids.iter().rev() {
            step_live(fn_, class, id, &mut live, Some(&mut ranges));
        }
    }
    ranges
}

/// A dense adjacency structure shared by the interference and coalescing
/// graphs (`SPEC_FULL.md` §9: dense bit-matrix suits the small, dense id
/// space). Nodes are never reallocated out of `adj`; `remove_node` just
/// marks them removed so neighbor queries can skip them in O(1) per edge.
struct Graph {
    adj: Vec<RegSet>,
}

impl Graph {
    fn new(n: usize) -> Self {
        Graph {
            adj: vec![RegSet::with_capacity(n); n],
        }
    }

    fn from_adj(adj: Vec<RegSet>) -> Self {
        Graph { adj }
    }

    fn add_edge(&mut self, a: RegId, b: RegId) {
        if a == b {
            return;
        }
        self.adj[a as usize].insert(b);
        self.adj[b as usize].insert(a);
    }

    fn has_edge(&self, a: RegId, b: RegId) -> bool {
        self.adj[a as usize].contains(b)
    }

    fn neighbors(&self, removed: &RegSet, r: RegId) -> Vec<RegId> {
        self.adj[r as usize]
            .iter()
            .filter(|n| !removed.contains(*n))
            .collect()
    }

    fn degree(&self, removed: &RegSet, r: RegId) -> usize {
        self.neighbors(removed, r).len()
    }

    fn num_edges(&self, removed: &RegSet) -> usize {
        let mut total = 0;
        for a in 0..self.adj.len() as RegId {
            if removed.contains(a) {
                continue;
            }
            total += self.degree(removed, a);
        }
        total / 2
    }

    /// Unions `src`'s (non-removed) neighbours into `dst`'s adjacency.
    fn copy_edges(&mut self, removed: &RegSet, src: RegId, dst: RegId) {
        for n in self.neighbors(removed, src) {
            self.add_edge(dst, n);
        }
    }
}

fn chase(coalesce_map: &Map<RegId, RegId>, mut r: RegId) -> RegId {
    while let Some(&t) = coalesce_map.get(&r) {
        r = t;
    }
    r
}

fn resolve(coalesce_map: &Map<RegId, RegId>, reg_map: &Map<RegId, RegId>, r: RegId) -> RegId {
    let target = chase(coalesce_map, r);
    *reg_map
        .get(&target)
        .unwrap_or_else(|| panic!("vreg {target} was never colored"))
}

/// Briggs's criterion: the combined node's neighbours of *significant*
/// degree (>= k) in the interference graph must number fewer than k.
fn briggs_safe(ig: &Graph, removed: &RegSet, a: RegId, b: RegId, k: u32) -> bool {
    let mut neighbors: Set<RegId> = Set::new();
    neighbors.extend(ig.neighbors(removed, a));
    neighbors.extend(ig.neighbors(removed, b));
    neighbors.remove(&a);
    neighbors.remove(&b);
    let significant = neighbors
        .iter()
        .filter(|&&n| ig.degree(removed, n) >= k as usize)
        .count();
    significant < k as usize
}

/// Register allocation for one class over one function.
pub struct RegAlloc<'a> {
    class: RegClass,
    fn_: &'a mut AsmFn,
}

impl<'a> RegAlloc<'a> {
    pub fn new(class: RegClass, fn_: &'a mut AsmFn) -> Self {
        RegAlloc { class, fn_ }
    }

    pub fn run(&mut self) {
        let class = self.class;
        let k = num_pregs(class);
        let n = match class {
            RegClass::Gpr => self.fn_.num_gprs,
            RegClass::Sse => self.fn_.num_sse,
        };

        compute_cfg(self.fn_);
        number_instructions(self.fn_);
        compute_live_in(self.fn_, class);
        let ranges = build_ranges(self.fn_, class, n);

        let ig_adj = Self::build_interference(&ranges, k);
        let cg_adj = Self::build_coalesce_graph(self.fn_, class, &ranges);

        let ig = Graph::from_adj(ig_adj.clone());
        let mut ig2 = Graph::from_adj(ig_adj);
        let mut cg = Graph::from_adj(cg_adj);
        let mut ig_removed = RegSet::new();
        let mut cg_removed = RegSet::new();

        let mut stack: Vec<RegId> = Vec::new();
        let mut coalesce_map: Map<RegId, RegId> = Map::new();

        loop {
            let mut progressed = true;
            while progressed {
                progressed = false;
                for r in k..n {
                    if ig_removed.contains(r) {
                        continue;
                    }
                    if cg.degree(&cg_removed, r) == 0 && ig2.degree(&ig_removed, r) < k as usize {
                        log::trace!("{class:?}: simplify v{r}");
                        stack.push(r);
                        ig_removed.insert(r);
                        cg_removed.insert(r);
                        progressed = true;
                    }
                }
            }

            let mut coalesced = false;
            'find_coalesce: for a in 0..n {
                if cg_removed.contains(a) {
                    continue;
                }
                for b in cg.neighbors(&cg_removed, a) {
                    if a == b || cg_removed.contains(b) {
                        continue;
                    }
                    let a_preg = a < k;
                    let b_preg = b < k;
                    if a_preg && b_preg {
                        continue;
                    }
                    let (winner, loser) = if a_preg {
                        (a, b)
                    } else if b_preg {
                        (b, a)
                    } else {
                        (a.min(b), a.max(b))
                    };
                    let safe = winner < k || briggs_safe(&ig2, &ig_removed, winner, loser, k);
                    if !safe {
                        continue;
                    }
                    log::trace!("{class:?}: coalesce v{loser} into v{winner}");
                    ig2.copy_edges(&ig_removed, loser, winner);
                    cg.copy_edges(&cg_removed, loser, winner);
                    ig_removed.insert(loser);
                    cg_removed.insert(loser);
                    coalesce_map.insert(loser, winner);
                    coalesced = true;
                    break 'find_coalesce;
                }
            }
            if coalesced {
                continue;
            }

            let mut frozen = false;
            for r in k..n {
                if cg_removed.contains(r) || ig_removed.contains(r) {
                    continue;
                }
                if cg.degree(&cg_removed, r) > 0 && ig2.degree(&ig_removed, r) < k as usize {
                    log::trace!("{class:?}: freeze v{r}");
                    cg_removed.insert(r);
                    frozen = true;
                    break;
                }
            }
            if frozen {
                continue;
            }

            let mut spilled = false;
            for r in k..n {
                if ig_removed.contains(r) {
                    continue;
                }
                log::trace!("{class:?}: optimistic spill candidate v{r}");
                stack.push(r);
                ig_removed.insert(r);
                cg_removed.insert(r);
                spilled = true;
                break;
            }
            if !spilled {
                break;
            }
        }

        // Select: propagate every coalesced vreg's pristine interferences
        // onto its ultimate target, then pop the stack and assign colors.
        let mut ig_select = ig;
        let mut select_removed = RegSet::new();
        for &loser in coalesce_map.keys() {
            let target = chase(&coalesce_map, loser);
            ig_select.copy_edges(&select_removed, loser, target);
        }

        let mut reg_map: Map<RegId, RegId> = Map::new();
        for p in 0..k {
            reg_map.insert(p, p);
        }

        while let Some(r) = stack.pop() {
            let mut chosen = None;
            'find_color: for p in 0..k {
                for neighbor in ig_select.neighbors(&select_removed, r) {
                    if let Some(&nc) = reg_map.get(&chase(&coalesce_map, neighbor)) {
                        if nc == p {
                            continue 'find_color;
                        }
                    }
                }
                chosen = Some(p);
                break;
            }
            let p = chosen.unwrap_or_else(|| {
                panic!(
                    "{class:?} register allocation ran out of physical registers for v{r}; \
                     spilling to the stack is not implemented"
                )
            });
            reg_map.insert(r, p);
            select_removed.insert(r);
            log::debug!("{class:?}: v{r} -> p{p}");
        }

        self.rewrite(&coalesce_map, &reg_map);
    }

    fn build_interference(ranges: &[Vec<(i32, i32)>], num_pregs: u32) -> Vec<RegSet> {
        let n = ranges.len();
        let mut ig = vec![RegSet::with_capacity(n); n];
        for r1 in 0..n {
            if ranges[r1].is_empty() {
                continue;
            }
            for r2 in (r1 + 1)..n {
                if ranges[r2].is_empty() {
                    continue;
                }
                if (r1 as u32) < num_pregs && (r2 as u32) < num_pregs {
                    continue;
                }
                if ranges_intersect(&ranges[r1], &ranges[r2]) {
                    ig[r1].insert(r2 as RegId);
                    ig[r2].insert(r1 as RegId);
                }
            }
        }
        ig
    }

    fn build_coalesce_graph(fn_: &AsmFn, class: RegClass, ranges: &[Vec<(i32, i32)>]) -> Vec<RegSet> {
        let n = ranges.len();
        let mut cg = vec![RegSet::with_capacity(n); n];
        let k = num_pregs(class);
        for &bb in &fn_.bbs {
            for id in fn_.ins_in(bb) {
                let ins = fn_.ins(id);
                let is_move_for_class = match class {
                    RegClass::Gpr => ins.op == X64Op::Mov,
                    RegClass::Sse => matches!(ins.op, X64Op::Movss | X64Op::Movsd),
                };
                if !is_move_for_class {
                    continue;
                }
                let (Some(l), Some(r)) = (&ins.l, &ins.r) else {
                    continue;
                };
                let (Some(lid), Some(rid)) = (operand_reg(class, l), operand_reg(class, r)) else {
                    continue;
                };
                if lid == rid || (lid < k && rid < k) {
                    continue;
                }
                if ranges_intersect_excluding(&ranges[lid as usize], &ranges[rid as usize], ins.n) {
                    continue;
                }
                cg[lid as usize].insert(rid);
                cg[rid as usize].insert(lid);
            }
        }
        cg
    }

    /// Substitutes every vreg operand with its assigned physical register,
    /// then deletes moves that became `l == r` (except a genuinely
    /// narrowing `movsx`/`movzx`, which still performs extension).
    fn rewrite(&mut self, coalesce_map: &Map<RegId, RegId>, reg_map: &Map<RegId, RegId>) {
        let class = self.class;
        let bbs = self.fn_.bbs.clone();
        for &bb in &bbs {
            for id in self.fn_.ins_in(bb).collect::<Vec<_>>() {
                let (mut l, mut r) = {
                    let ins = self.fn_.ins(id);
                    (ins.l.clone(), ins.r.clone())
                };
                if let Some(opr) = &mut l {
                    Self::rewrite_opr(opr, class, coalesce_map, reg_map);
                }
                if let Some(opr) = &mut r {
                    Self::rewrite_opr(opr, class, coalesce_map, reg_map);
                }
                let ins = self.fn_.ins_mut(id);
                ins.l = l;
                ins.r = r;
            }
        }

        let mut to_delete = Vec::new();
        for &bb in &bbs {
            for id in self.fn_.ins_in(bb).collect::<Vec<_>>() {
                let ins = self.fn_.ins(id);
                let is_move = matches!(
                    ins.op,
                    X64Op::Mov | X64Op::Movss | X64Op::Movsd | X64Op::Movsx | X64Op::Movzx
                );
                if !is_move {
                    continue;
                }
                let (Some(l), Some(r)) = (&ins.l, &ins.r) else {
                    continue;
                };
                let (Some(li), Some(ri)) = (l.reg_id(), r.reg_id()) else {
                    continue;
                };
                if li != ri {
                    continue;
                }
                let widens = match (l, r) {
                    (AsmOpr::Gpr { size: ls, .. }, AsmOpr::Gpr { size: rs, .. }) => {
                        gpr_size_bytes(*ls) > gpr_size_bytes(*rs)
                    }
                    _ => false,
                };
                let keep_for_extension =
                    matches!(ins.op, X64Op::Movsx | X64Op::Movzx) && widens;
                if !keep_for_extension {
                    to_delete.push(id);
                }
            }
        }
        for id in to_delete {
            self.fn_.unlink_ins(id);
        }
    }

    fn rewrite_opr(
        opr: &mut AsmOpr,
        class: RegClass,
        coalesce_map: &Map<RegId, RegId>,
        reg_map: &Map<RegId, RegId>,
    ) {
        match opr {
            AsmOpr::Gpr { id, .. } if class == RegClass::Gpr => {
                *id = resolve(coalesce_map, reg_map, *id);
            }
            AsmOpr::Xmm { id } if class == RegClass::Sse => {
                *id = resolve(coalesce_map, reg_map, *id);
            }
            AsmOpr::Mem { base, index, .. } if class == RegClass::Gpr => {
                *base = resolve(coalesce_map, reg_map, *base);
                if let Some((idx_id, _)) = index {
                    *idx_id = resolve(coalesce_map, reg_map, *idx_id);
                }
            }
            _ => {}
        }
    }
}

