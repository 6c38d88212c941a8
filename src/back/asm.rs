//! Instruction selection: lowers a typed IR function into x86-64 assembly
//! that freely uses virtual registers. Every operand is produced through one
//! of five gates (`discharge`, `inline_imm`, `inline_mem`, `inline_imm_mem`,
//! `inline_label_mem`) so that addressing-mode utilization stays consistent
//! and predictable for the liveness pass that follows in `regalloc`.
//!
//! System V AMD64 ABI (this crate targets macOS/Linux, not Windows):
//! integer/pointer arguments go in RDI, RSI, RDX, RCX, R8, R9 in order;
//! floating-point arguments go in XMM0..XMM7; RAX holds an integer return
//! value, XMM0 a floating one; RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11 and
//! all XMMs are caller-saved; the stack must be 16-byte aligned at `call`.

use crate::common::*;
use crate::ir::{ArithOp, CmpOp, IrBbId, IrFn, IrInsId, IrOp, IrType};

/// Physical and virtual registers of one class share this id space: preg ids
/// are `[0, K)`, vreg ids are `[K, N)` (`SPEC_FULL.md` §3, §9).
pub type RegId = u32;

pub const NUM_GPR_PREGS: u32 = 16;
pub const NUM_XMM_PREGS: u32 = 16;

pub const RAX: RegId = 0;
pub const RCX: RegId = 1;
pub const RDX: RegId = 2;
pub const RBX: RegId = 3;
pub const RSP: RegId = 4;
pub const RBP: RegId = 5;
pub const RSI: RegId = 6;
pub const RDI: RegId = 7;
pub const R8: RegId = 8;
pub const R9: RegId = 9;
pub const R10: RegId = 10;
pub const R11: RegId = 11;

/// Integer argument registers, System V order.
pub const ARG_GPRS: [RegId; 6] = [RDI, RSI, RDX, RCX, R8, R9];
/// GPRs clobbered by `call` (System V caller-saved, minus RBX/R12-15 which
/// are callee-saved).
pub const CALL_CLOBBERED_GPRS: [RegId; 9] = [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];

const GPR64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];
const GPR32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];
const GPR16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];
const GPR8L: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];

fn gpr_name(id: RegId, size: GprSize) -> String {
    let idx = id as usize;
    if idx >= 16 {
        return format!("%v{idx}");
    }
    match size {
        GprSize::R64 => GPR64[idx],
        GprSize::R32 => GPR32[idx],
        GprSize::R16 => GPR16[idx],
        GprSize::R8L => GPR8L[idx],
    }
    .to_string()
}

fn xmm_name(id: RegId) -> String {
    if (id as usize) < 16 {
        format!("xmm{id}")
    } else {
        format!("%v{id}")
    }
}

/// Width of a GPR operand. Picked from the IR value's type at the point it
/// is discharged or inlined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GprSize {
    R8L,
    R16,
    R32,
    R64,
}

fn gpr_size(ty: &IrType) -> GprSize {
    match ty {
        IrType::Int { bits: 8 } => GprSize::R8L,
        IrType::Int { bits: 16 } => GprSize::R16,
        IrType::Int { bits: 32 } => GprSize::R32,
        IrType::Int { bits: 64 } => GprSize::R64,
        IrType::Ptr => GprSize::R64,
        other => panic!("{other:?} has no GPR representation"),
    }
}

/// An assembly operand (`SPEC_FULL.md` §3).
#[derive(Clone, Debug, PartialEq)]
pub enum AsmOpr {
    Imm(i64),
    /// Index into the owning function's f32 constant pool.
    F32(u32),
    /// Index into the owning function's f64 constant pool.
    F64(u32),
    Gpr { id: RegId, size: GprSize },
    Xmm { id: RegId },
    Mem {
        base: RegId,
        index: Option<(RegId, u8)>,
        disp: i32,
        bytes: u32,
    },
    /// A RIP-relative reference to a symbolic label (global address).
    Deref(Id),
    /// A bare label, used as a direct `call` target.
    Label(Id),
    Bb(AsmBbId),
}

impl AsmOpr {
    pub fn reg_id(&self) -> Option<RegId> {
        match self {
            AsmOpr::Gpr { id, .. } | AsmOpr::Xmm { id } => Some(*id),
            _ => None,
        }
    }

    pub fn is_xmm(&self) -> bool {
        matches!(self, AsmOpr::Xmm { .. })
    }
}

impl std::fmt::Display for AsmOpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsmOpr::Imm(v) => write!(f, "{v}"),
            AsmOpr::F32(i) => write!(f, "dword [.Lf32.{i}]"),
            AsmOpr::F64(i) => write!(f, "qword [.Lf64.{i}]"),
            AsmOpr::Gpr { id, size } => write!(f, "{}", gpr_name(*id, *size)),
            AsmOpr::Xmm { id } => write!(f, "{}", xmm_name(*id)),
            AsmOpr::Mem {
                base,
                index,
                disp,
                ..
            } => {
                write!(f, "[{}", gpr_name(*base, GprSize::R64))?;
                if let Some((idx, scale)) = index {
                    write!(f, "+{}*{}", gpr_name(*idx, GprSize::R64), scale)?;
                }
                match disp.cmp(&0) {
                    std::cmp::Ordering::Greater => write!(f, "+{disp}")?,
                    std::cmp::Ordering::Less => write!(f, "{disp}")?,
                    std::cmp::Ordering::Equal => {}
                }
                write!(f, "]")
            }
            AsmOpr::Deref(label) => write!(f, "[{label}(%rip)]"),
            AsmOpr::Label(label) => write!(f, "{label}"),
            AsmOpr::Bb(id) => write!(f, ".L{}", id.index()),
        }
    }
}

/// x86-64 opcodes the assembler emits (`SPEC_FULL.md` §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum X64Op {
    #[display("mov")]
    Mov,
    #[display("movsx")]
    Movsx,
    #[display("movzx")]
    Movzx,
    #[display("movss")]
    Movss,
    #[display("movsd")]
    Movsd,
    #[display("lea")]
    Lea,
    #[display("push")]
    Push,
    #[display("pop")]
    Pop,
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("imul")]
    IMul,
    #[display("and")]
    And,
    #[display("or")]
    Or,
    #[display("xor")]
    Xor,
    #[display("shl")]
    Shl,
    #[display("sar")]
    Sar,
    #[display("shr")]
    Shr,
    #[display("addss")]
    Addss,
    #[display("addsd")]
    Addsd,
    #[display("subss")]
    Subss,
    #[display("subsd")]
    Subsd,
    #[display("mulss")]
    Mulss,
    #[display("mulsd")]
    Mulsd,
    #[display("divss")]
    Divss,
    #[display("divsd")]
    Divsd,
    #[display("cmp")]
    Cmp,
    #[display("ucomiss")]
    Ucomiss,
    #[display("ucomisd")]
    Ucomisd,
    #[display("sete")]
    Sete,
    #[display("setne")]
    Setne,
    #[display("setl")]
    Setl,
    #[display("setle")]
    Setle,
    #[display("setg")]
    Setg,
    #[display("setge")]
    Setge,
    #[display("setb")]
    Setb,
    #[display("setbe")]
    Setbe,
    #[display("seta")]
    Seta,
    #[display("setae")]
    Setae,
    #[display("cwd")]
    Cwd,
    #[display("cdq")]
    Cdq,
    #[display("cqo")]
    Cqo,
    #[display("idiv")]
    Idiv,
    #[display("div")]
    Div,
    #[display("cvtsd2ss")]
    Cvtsd2ss,
    #[display("cvtss2sd")]
    Cvtss2sd,
    #[display("cvttsd2si")]
    Cvttsd2si,
    #[display("cvttss2si")]
    Cvttss2si,
    #[display("cvtsi2sd")]
    Cvtsi2sd,
    #[display("cvtsi2ss")]
    Cvtsi2ss,
    #[display("jmp")]
    Jmp,
    #[display("je")]
    Je,
    #[display("jne")]
    Jne,
    #[display("jl")]
    Jl,
    #[display("jle")]
    Jle,
    #[display("jg")]
    Jg,
    #[display("jge")]
    Jge,
    #[display("jb")]
    Jb,
    #[display("jbe")]
    Jbe,
    #[display("ja")]
    Ja,
    #[display("jae")]
    Jae,
    #[display("call")]
    Call,
    #[display("ret")]
    Ret,
}

impl X64Op {
    /// True for opcodes whose instructions define (overwrite) their left
    /// operand register, per the `DEFINES_LEFT` table of `SPEC_FULL.md` §9 —
    /// used by liveness analysis's def-side step.
    pub fn defines_left(self) -> bool {
        !matches!(
            self,
            X64Op::Cmp
                | X64Op::Ucomiss
                | X64Op::Ucomisd
                | X64Op::Jmp
                | X64Op::Je
                | X64Op::Jne
                | X64Op::Jl
                | X64Op::Jle
                | X64Op::Jg
                | X64Op::Jge
                | X64Op::Jb
                | X64Op::Jbe
                | X64Op::Ja
                | X64Op::Jae
                | X64Op::Call
                | X64Op::Ret
                | X64Op::Cwd
                | X64Op::Cdq
                | X64Op::Cqo
                | X64Op::Idiv
                | X64Op::Div
                | X64Op::Push
        )
    }
}

fn cc_jump_op(op: CmpOp) -> X64Op {
    match op {
        CmpOp::Eq => X64Op::Je,
        CmpOp::Neq => X64Op::Jne,
        CmpOp::Slt => X64Op::Jl,
        CmpOp::Sle => X64Op::Jle,
        CmpOp::Sgt => X64Op::Jg,
        CmpOp::Sge => X64Op::Jge,
        CmpOp::Ult | CmpOp::Flt => X64Op::Jb,
        CmpOp::Ule | CmpOp::Fle => X64Op::Jbe,
        CmpOp::Ugt | CmpOp::Fgt => X64Op::Ja,
        CmpOp::Uge | CmpOp::Fge => X64Op::Jae,
    }
}

fn cc_set_op(op: CmpOp) -> X64Op {
    match op {
        CmpOp::Eq => X64Op::Sete,
        CmpOp::Neq => X64Op::Setne,
        CmpOp::Slt => X64Op::Setl,
        CmpOp::Sle => X64Op::Setle,
        CmpOp::Sgt => X64Op::Setg,
        CmpOp::Sge => X64Op::Setge,
        CmpOp::Ult | CmpOp::Flt => X64Op::Setb,
        CmpOp::Ule | CmpOp::Fle => X64Op::Setbe,
        CmpOp::Ugt | CmpOp::Fgt => X64Op::Seta,
        CmpOp::Uge | CmpOp::Fge => X64Op::Setae,
    }
}

fn invert_cc(op: CmpOp) -> CmpOp {
    match op {
        CmpOp::Eq => CmpOp::Neq,
        CmpOp::Neq => CmpOp::Eq,
        CmpOp::Slt => CmpOp::Sge,
        CmpOp::Sge => CmpOp::Slt,
        CmpOp::Sle => CmpOp::Sgt,
        CmpOp::Sgt => CmpOp::Sle,
        CmpOp::Ult => CmpOp::Uge,
        CmpOp::Uge => CmpOp::Ult,
        CmpOp::Ule => CmpOp::Ugt,
        CmpOp::Ugt => CmpOp::Ule,
        CmpOp::Flt => CmpOp::Fge,
        CmpOp::Fge => CmpOp::Flt,
        CmpOp::Fle => CmpOp::Fgt,
        CmpOp::Fgt => CmpOp::Fle,
    }
}

/// A dense, growable set of register ids. Backs both `AsmBB::live_in` and
/// the interference/coalescing adjacency rows in `regalloc` (design note
/// in `SPEC_FULL.md` §9: a bitset suits the small, dense id space).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegSet(Vec<bool>);

impl RegSet {
    pub fn new() -> Self {
        RegSet(Vec::new())
    }

    pub fn with_capacity(n: usize) -> Self {
        RegSet(vec![false; n])
    }

    pub fn insert(&mut self, id: RegId) -> bool {
        let idx = id as usize;
        if idx >= self.0.len() {
            self.0.resize(idx + 1, false);
        }
        let was = self.0[idx];
        self.0[idx] = true;
        !was
    }

    pub fn remove(&mut self, id: RegId) {
        if let Some(slot) = self.0.get_mut(id as usize) {
            *slot = false;
        }
    }

    pub fn contains(&self, id: RegId) -> bool {
        self.0.get(id as usize).copied().unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.0.fill(false);
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| !b)
    }

    pub fn iter(&self) -> impl Iterator<Item = RegId> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| b.then_some(i as RegId))
    }

    pub fn union_with(&mut self, other: &RegSet) {
        if other.0.len() > self.0.len() {
            self.0.resize(other.0.len(), false);
        }
        for (i, &b) in other.0.iter().enumerate() {
            if b {
                self.0[i] = true;
            }
        }
    }
}

pub type AsmInsId = ArenaIdx<AsmIns>;
pub type AsmBbId = ArenaIdx<AsmBB>;

/// One assembly instruction, linked into its block's instruction list via
/// `prev`/`next` arena indices (design note in `SPEC_FULL.md` §9: an arena
/// of nodes stands in for a hand-rolled doubly-linked list; splice/delete is
/// index rewiring rather than pointer surgery).
#[derive(Debug)]
pub struct AsmIns {
    pub op: X64Op,
    pub l: Option<AsmOpr>,
    pub r: Option<AsmOpr>,
    /// Program-point number, assigned by `regalloc`'s numbering pass.
    pub n: i32,
    pub bb: AsmBbId,
    pub prev: Option<AsmInsId>,
    pub next: Option<AsmInsId>,
}

impl std::fmt::Display for AsmIns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.op)?;
        if let Some(l) = &self.l {
            write!(f, " {l}")?;
        }
        if let Some(r) = &self.r {
            write!(f, ", {r}")?;
        }
        Ok(())
    }
}

/// One basic block: a doubly-linked instruction list plus the analysis
/// fields `regalloc` fills in (predecessors/successors, `live_in`).
#[derive(Debug, Default)]
pub struct AsmBB {
    pub head: Option<AsmInsId>,
    pub tail: Option<AsmInsId>,
    pub preds: Set<AsmBbId>,
    pub succs: Vec<AsmBbId>,
    pub live_in: RegSet,
}

/// An assembled function: basic blocks in program order, per-function f32/f64
/// constant pools, and the vreg upper bounds the register allocator needs.
#[derive(Debug)]
pub struct AsmFn {
    pub name: Id,
    pub bbs: Vec<AsmBbId>,
    pub bb_arena: Arena<AsmBB>,
    pub ins_arena: Arena<AsmIns>,
    pub f32_pool: Vec<f32>,
    pub f64_pool: Vec<f64>,
    /// Upper bound on GPR-class ids (`NUM_GPR_PREGS + num_gpr_vregs`).
    pub num_gprs: u32,
    /// Upper bound on SSE-class ids (`NUM_XMM_PREGS + num_sse_vregs`).
    pub num_sse: u32,
    /// `sub`/`add rsp, _` instructions pending the final stack-size patch.
    /// Emptied once `Assembler::run` resolves the frame size.
    pub stack_patch: Vec<AsmInsId>,
}

impl AsmFn {
    pub fn ins(&self, id: AsmInsId) -> &AsmIns {
        self.ins_arena.get(id)
    }

    pub fn ins_mut(&mut self, id: AsmInsId) -> &mut AsmIns {
        self.ins_arena.get_mut(id)
    }

    pub fn bb(&self, id: AsmBbId) -> &AsmBB {
        self.bb_arena.get(id)
    }

    pub fn bb_mut(&mut self, id: AsmBbId) -> &mut AsmBB {
        self.bb_arena.get_mut(id)
    }

    /// Instructions of `bb` in program order.
    pub fn ins_in(&self, bb: AsmBbId) -> impl Iterator<Item = AsmInsId> + '_ {
        let mut cur = self.bb(bb).head;
        std::iter::from_fn(move || {
            let id = cur?;
            cur = self.ins(id).next;
            Some(id)
        })
    }

    /// Unlink `id` from its block's instruction list. The arena slot itself
    /// is never freed (so ids taken before the unlink stay valid to compare
    /// against, they're just unreachable by walking `head`/`next`).
    pub fn unlink_ins(&mut self, id: AsmInsId) {
        let (prev, next, bb) = {
            let ins = self.ins(id);
            (ins.prev, ins.next, ins.bb)
        };
        match prev {
            Some(p) => self.ins_mut(p).next = next,
            None => self.bb_mut(bb).head = next,
        }
        match next {
            Some(n) => self.ins_mut(n).prev = prev,
            None => self.bb_mut(bb).tail = prev,
        }
    }
}

fn align_up(n: i32, align: i32) -> i32 {
    (n.max(0) + align - 1) / align * align
}

fn reg64(id: RegId) -> AsmOpr {
    AsmOpr::Gpr {
        id,
        size: GprSize::R64,
    }
}

/// Instruction selection over one IR function. Constructed once per
/// function via [`Assembler::new`], then consumed by [`Assembler::run`].
pub struct Assembler {
    name: Id,
    bb_arena: Arena<AsmBB>,
    ins_arena: Arena<AsmIns>,
    bbs: Vec<AsmBbId>,
    ir_bb_to_asm: Map<IrBbId, AsmBbId>,
    cur_bb: Option<AsmBbId>,
    cur_ir_bb: Option<IrBbId>,
    next_gpr: u32,
    next_sse: u32,
    next_stack: i32,
    stack_patch: Vec<AsmInsId>,
    f32_pool: Vec<f32>,
    f64_pool: Vec<f64>,
}

impl Assembler {
    pub fn new(name: Id) -> Self {
        Assembler {
            name,
            bb_arena: Arena::new(),
            ins_arena: Arena::new(),
            bbs: Vec::new(),
            ir_bb_to_asm: Map::new(),
            cur_bb: None,
            cur_ir_bb: None,
            next_gpr: NUM_GPR_PREGS,
            next_sse: NUM_XMM_PREGS,
            next_stack: 0,
            stack_patch: Vec::new(),
            f32_pool: Vec::new(),
            f64_pool: Vec::new(),
        }
    }

    /// Select instructions for `ir`, producing a vreg-using [`AsmFn`]. The
    /// IR is mutated only on its scratch bookkeeping fields (`vreg`,
    /// `stack_slot`, `fp_idx`), per `SPEC_FULL.md` §3 Lifecycle.
    pub fn run(mut self, ir: &mut IrFn) -> AsmFn {
        for &bb in &ir.bbs {
            let id = self.bb_arena.push(AsmBB::default());
            self.bbs.push(id);
            self.ir_bb_to_asm.insert(bb, id);
        }

        let entry = self.bbs[0];
        self.cur_bb = Some(entry);
        self.emit(X64Op::Push, Some(reg64(RBP)), None);
        self.emit(X64Op::Mov, Some(reg64(RBP)), Some(reg64(RSP)));
        let sub_ins = self.emit(X64Op::Sub, Some(reg64(RSP)), Some(AsmOpr::Imm(0)));
        self.stack_patch.push(sub_ins);

        let bbs = ir.bbs.clone();
        for bb in bbs {
            self.lower_bb(ir, bb);
        }

        log::debug!("{}: frame size {} bytes (pre-alignment)", self.name, self.next_stack);
        self.finish()
    }

    fn finish(self) -> AsmFn {
        let aligned = align_up(self.next_stack, 16);
        let mut asm_fn = AsmFn {
            name: self.name,
            bbs: self.bbs,
            bb_arena: self.bb_arena,
            ins_arena: self.ins_arena,
            f32_pool: self.f32_pool,
            f64_pool: self.f64_pool,
            num_gprs: self.next_gpr,
            num_sse: self.next_sse,
            stack_patch: self.stack_patch.clone(),
        };
        if aligned == 0 {
            for ins in self.stack_patch {
                asm_fn.unlink_ins(ins);
            }
            asm_fn.stack_patch.clear();
        } else {
            for &ins in &asm_fn.stack_patch.clone() {
                asm_fn.ins_mut(ins).r = Some(AsmOpr::Imm(aligned as i64));
            }
        }
        asm_fn
    }

    // -- instruction-list plumbing -----------------------------------------

    fn emit(&mut self, op: X64Op, l: Option<AsmOpr>, r: Option<AsmOpr>) -> AsmInsId {
        let bb = self.cur_bb.expect("emit before a block is current");
        let ins = AsmIns {
            op,
            l,
            r,
            n: 0,
            bb,
            prev: None,
            next: None,
        };
        let id = self.ins_arena.push(ins);
        let tail = self.bb_arena.get(bb).tail;
        self.ins_arena.get_mut(id).prev = tail;
        match tail {
            Some(t) => self.ins_arena.get_mut(t).next = Some(id),
            None => self.bb_arena.get_mut(bb).head = Some(id),
        }
        self.bb_arena.get_mut(bb).tail = Some(id);
        id
    }

    fn new_gpr(&mut self) -> RegId {
        let id = self.next_gpr;
        self.next_gpr += 1;
        id
    }

    fn new_sse(&mut self) -> RegId {
        let id = self.next_sse;
        self.next_sse += 1;
        id
    }

    fn new_vreg_for(&mut self, ty: &IrType) -> RegId {
        if ty.is_float() {
            self.new_sse()
        } else {
            self.new_gpr()
        }
    }

    fn vreg_opr(&self, id: RegId, ty: &IrType) -> AsmOpr {
        if ty.is_float() {
            AsmOpr::Xmm { id }
        } else {
            AsmOpr::Gpr {
                id,
                size: gpr_size(ty),
            }
        }
    }

    // -- the five operand gates (`SPEC_FULL.md` §4.1) ----------------------

    /// Guarantees `id`'s value sits in a register, materializing it if
    /// necessary.
    fn discharge(&mut self, ir: &mut IrFn, id: IrInsId) -> AsmOpr {
        let ty = ir.ins(id).ty.clone();
        if let Some(vreg) = ir.ins(id).vreg {
            if !matches!(ir.ins(id).op, IrOp::Alloc(_)) {
                return self.vreg_opr(vreg, &ty);
            }
        }
        match ir.ins(id).op.clone() {
            IrOp::Imm(v) => {
                let dst = self.new_gpr();
                let dst_opr = self.vreg_opr(dst, &ty);
                self.emit(X64Op::Mov, Some(dst_opr.clone()), Some(AsmOpr::Imm(v)));
                ir.ins_mut(id).vreg = Some(dst);
                dst_opr
            }
            IrOp::Fp(_) => {
                let idx = ir
                    .ins(id)
                    .fp_idx
                    .expect("FP node discharged before its pool slot was assigned");
                let dst = self.new_sse();
                let (op, src) = if ty == IrType::F32 {
                    (X64Op::Movss, AsmOpr::F32(idx))
                } else {
                    (X64Op::Movsd, AsmOpr::F64(idx))
                };
                self.emit(op, Some(AsmOpr::Xmm { id: dst }), Some(src));
                ir.ins_mut(id).vreg = Some(dst);
                AsmOpr::Xmm { id: dst }
            }
            IrOp::Global(label) => {
                let dst = self.new_gpr();
                self.emit(
                    X64Op::Lea,
                    Some(reg64(dst)),
                    Some(AsmOpr::Deref(label)),
                );
                ir.ins_mut(id).vreg = Some(dst);
                reg64(dst)
            }
            IrOp::Load(ptr) => {
                let mem = self.load_ptr(ir, ptr, &ty);
                let dst_opr = if ty.is_float() {
                    let dst = self.new_sse();
                    let op = if ty == IrType::F32 {
                        X64Op::Movss
                    } else {
                        X64Op::Movsd
                    };
                    self.emit(op, Some(AsmOpr::Xmm { id: dst }), Some(mem));
                    AsmOpr::Xmm { id: dst }
                } else {
                    let dst = self.new_gpr();
                    let opr = self.vreg_opr(dst, &ty);
                    self.emit(X64Op::Mov, Some(opr.clone()), Some(mem));
                    opr
                };
                ir.ins_mut(id).vreg = dst_opr.reg_id();
                dst_opr
            }
            IrOp::Alloc(_) => {
                let slot = ir
                    .ins(id)
                    .stack_slot
                    .expect("ALLOC discharged before a stack slot was assigned");
                let dst = self.new_gpr();
                self.emit(
                    X64Op::Lea,
                    Some(reg64(dst)),
                    Some(AsmOpr::Mem {
                        base: RBP,
                        index: None,
                        disp: -slot,
                        bytes: 8,
                    }),
                );
                // Deliberately not recorded on `ir->vreg`: ALLOC is
                // re-materialized on every discharge (SPEC_FULL.md §3).
                reg64(dst)
            }
            IrOp::Cmp { op, lhs, rhs } => {
                self.asm_cmp(ir, op, lhs, rhs);
                let dst = self.new_gpr();
                self.emit(
                    cc_set_op(op),
                    Some(AsmOpr::Gpr {
                        id: dst,
                        size: GprSize::R8L,
                    }),
                    None,
                );
                self.emit(
                    X64Op::And,
                    Some(AsmOpr::Gpr {
                        id: dst,
                        size: GprSize::R8L,
                    }),
                    Some(AsmOpr::Imm(1)),
                );
                ir.ins_mut(id).vreg = Some(dst);
                self.vreg_opr(dst, &ty)
            }
            other => unreachable!("discharge reached an eagerly-lowered op: {other:?}"),
        }
    }

    /// `IMM` stays an immediate; anything else is discharged.
    fn inline_imm(&mut self, ir: &mut IrFn, id: IrInsId) -> AsmOpr {
        if let IrOp::Imm(v) = ir.ins(id).op {
            AsmOpr::Imm(v)
        } else {
            self.discharge(ir, id)
        }
    }

    /// A not-yet-discharged `LOAD` becomes a memory operand; an `FP`
    /// becomes a constant-pool operand; anything else is discharged.
    fn inline_mem(&mut self, ir: &mut IrFn, id: IrInsId) -> AsmOpr {
        match ir.ins(id).op.clone() {
            IrOp::Load(ptr) if ir.ins(id).vreg.is_none() => {
                let ty = ir.ins(id).ty.clone();
                self.load_ptr(ir, ptr, &ty)
            }
            IrOp::Fp(_) if ir.ins(id).vreg.is_none() => {
                let ty = ir.ins(id).ty.clone();
                let idx = ir
                    .ins(id)
                    .fp_idx
                    .expect("FP node inlined before its pool slot was assigned");
                if ty == IrType::F32 {
                    AsmOpr::F32(idx)
                } else {
                    AsmOpr::F64(idx)
                }
            }
            _ => self.discharge(ir, id),
        }
    }

    fn inline_imm_mem(&mut self, ir: &mut IrFn, id: IrInsId) -> AsmOpr {
        if let IrOp::Imm(v) = ir.ins(id).op {
            AsmOpr::Imm(v)
        } else {
            self.inline_mem(ir, id)
        }
    }

    /// A direct `GLOBAL` call target becomes a bare label; anything else is
    /// discharged into a register used as an indirect call target.
    fn inline_label_mem(&mut self, ir: &mut IrFn, id: IrInsId) -> AsmOpr {
        if let IrOp::Global(label) = ir.ins(id).op {
            AsmOpr::Label(label)
        } else {
            self.discharge(ir, id)
        }
    }

    /// Maps an IR pointer to a memory operand sized for `to_load_ty`.
    fn load_ptr(&mut self, ir: &mut IrFn, ptr: IrInsId, to_load_ty: &IrType) -> AsmOpr {
        let bytes = to_load_ty.size().max(1);
        match ir.ins(ptr).op.clone() {
            IrOp::Alloc(_) => {
                let slot = ir
                    .ins(ptr)
                    .stack_slot
                    .expect("load through an ALLOC before a stack slot was assigned");
                AsmOpr::Mem {
                    base: RBP,
                    index: None,
                    disp: -slot,
                    bytes,
                }
            }
            IrOp::Global(label) => AsmOpr::Deref(label),
            _ => {
                let reg = self.discharge(ir, ptr);
                AsmOpr::Mem {
                    base: reg.reg_id().expect("pointer discharge must yield a GPR"),
                    index: None,
                    disp: 0,
                    bytes,
                }
            }
        }
    }

    /// Emits the compare feeding either a `set<cc>` (discharge of a bare
    /// comparison) or a `j<cc>` (`CONDBR`). Inspects the *operand* types
    /// (not the boolean result type) to choose `CMP` vs `UCOMIS*`
    /// (`SPEC_FULL.md` §4.2, known-defect fix).
    fn asm_cmp(&mut self, ir: &mut IrFn, op: CmpOp, lhs: IrInsId, rhs: IrInsId) {
        let lhs_ty = ir.ins(lhs).ty.clone();
        if lhs_ty.is_float() {
            let l = self.discharge(ir, lhs);
            let r = self.inline_mem(ir, rhs);
            let ucmp = if lhs_ty == IrType::F32 {
                X64Op::Ucomiss
            } else {
                X64Op::Ucomisd
            };
            self.emit(ucmp, Some(l), Some(r));
        } else {
            let l = self.discharge(ir, lhs);
            let r = self.inline_imm_mem(ir, rhs);
            self.emit(X64Op::Cmp, Some(l), Some(r));
        }
        let _ = op;
    }

    // -- per-instruction lowering --------------------------------------------

    fn lower_bb(&mut self, ir: &mut IrFn, bb: IrBbId) {
        self.cur_ir_bb = Some(bb);
        self.cur_bb = Some(self.ir_bb_to_asm[&bb]);
        let ins_list = ir.bb(bb).ins.clone();
        let mut i = 0;
        while i < ins_list.len() {
            let id = ins_list[i];
            match ir.ins(id).op.clone() {
                IrOp::Imm(_) | IrOp::Global(_) | IrOp::Load(_) | IrOp::Cmp { .. } => {
                    // Inlined lazily at use sites; the bare instruction emits
                    // no code of its own.
                }
                IrOp::Fp(v) => self.lower_fp(ir, id, v),
                IrOp::Alloc(ty) => self.lower_alloc(ir, id, ty),
                IrOp::Farg(idx) => self.lower_farg(ir, id, idx),
                IrOp::Store { ptr, val } => self.lower_store(ir, ptr, val),
                IrOp::PtrAdd { ptr, offset } => self.lower_ptradd(ir, id, ptr, offset),
                IrOp::Arith { op, lhs, rhs } => self.lower_arith(ir, id, op, lhs, rhs),
                IrOp::Trunc(s) | IrOp::Ptr2I(s) => self.lower_narrow_mov(ir, id, s),
                IrOp::Sext(s) => self.lower_extend(ir, id, s, true),
                IrOp::Zext(s) => self.lower_extend(ir, id, s, false),
                IrOp::I2Ptr(s) | IrOp::Bitcast(s) => self.lower_reinterpret(ir, id, s),
                IrOp::Ftrunc(s) => self.lower_ftrunc(ir, id, s),
                IrOp::Fext(s) => self.lower_fext(ir, id, s),
                IrOp::Fp2I(s) => self.lower_fp2i(ir, id, s),
                IrOp::I2Fp(s) => self.lower_i2fp(ir, id, s),
                IrOp::Br(target) => self.lower_br(ir, target),
                IrOp::CondBr { cond, t, f } => self.lower_condbr(ir, cond, t, f),
                IrOp::Call { func } => {
                    let mut args = Vec::new();
                    let mut j = i + 1;
                    while j < ins_list.len() {
                        if let IrOp::Carg(a) = ir.ins(ins_list[j]).op {
                            args.push(a);
                            j += 1;
                        } else {
                            break;
                        }
                    }
                    self.lower_call(ir, id, func, &args);
                    i = j;
                    continue;
                }
                IrOp::Carg(_) => unreachable!("CARG not preceded by a CALL"),
                IrOp::Ret(v) => self.lower_ret(ir, v),
            }
            i += 1;
        }
    }

    fn lower_fp(&mut self, ir: &mut IrFn, id: IrInsId, v: f64) {
        let ty = ir.ins(id).ty.clone();
        let idx = if ty == IrType::F32 {
            let bits = (v as f32).to_bits();
            self.f32_pool
                .iter()
                .position(|x| x.to_bits() == bits)
                .unwrap_or_else(|| {
                    self.f32_pool.push(v as f32);
                    self.f32_pool.len() - 1
                }) as u32
        } else {
            let bits = v.to_bits();
            self.f64_pool
                .iter()
                .position(|x| x.to_bits() == bits)
                .unwrap_or_else(|| {
                    self.f64_pool.push(v);
                    self.f64_pool.len() - 1
                }) as u32
        };
        ir.ins_mut(id).fp_idx = Some(idx);
    }

    fn lower_alloc(&mut self, ir: &mut IrFn, id: IrInsId, ty: IrType) {
        let pad = align_up(self.next_stack, ty.align() as i32);
        self.next_stack = pad + ty.size() as i32;
        ir.ins_mut(id).stack_slot = Some(self.next_stack);
    }

    fn lower_farg(&mut self, ir: &mut IrFn, id: IrInsId, idx: u32) {
        let ty = ir.ins(id).ty.clone();
        let dst = self.new_vreg_for(&ty);
        if ty.is_float() {
            assert!(
                (idx as usize) < 8,
                "more than 8 floating-point parameters are not supported"
            );
            let op = if ty == IrType::F32 {
                X64Op::Movss
            } else {
                X64Op::Movsd
            };
            self.emit(
                op,
                Some(AsmOpr::Xmm { id: dst }),
                Some(AsmOpr::Xmm { id: idx as RegId }),
            );
        } else {
            assert!(
                (idx as usize) < 6,
                "more than 6 integer parameters are not supported"
            );
            let size = gpr_size(&ty);
            self.emit(
                X64Op::Mov,
                Some(AsmOpr::Gpr { id: dst, size }),
                Some(AsmOpr::Gpr {
                    id: ARG_GPRS[idx as usize],
                    size,
                }),
            );
        }
        ir.ins_mut(id).vreg = Some(dst);
    }

    fn lower_store(&mut self, ir: &mut IrFn, ptr: IrInsId, val: IrInsId) {
        let val_ty = ir.ins(val).ty.clone();
        let mem = self.load_ptr(ir, ptr, &val_ty);
        if val_ty.is_float() {
            let v = self.discharge(ir, val);
            let op = if val_ty == IrType::F32 {
                X64Op::Movss
            } else {
                X64Op::Movsd
            };
            self.emit(op, Some(mem), Some(v));
        } else {
            let v = self.inline_imm(ir, val);
            self.emit(X64Op::Mov, Some(mem), Some(v));
        }
    }

    fn lower_ptradd(&mut self, ir: &mut IrFn, id: IrInsId, ptr: IrInsId, offset: IrInsId) {
        let base = self.discharge(ir, ptr);
        let base_id = base.reg_id().expect("pointer discharge must yield a GPR");
        if matches!(ir.ins(offset).op, IrOp::Imm(0)) {
            // No code: the result aliases `ptr` itself.
            ir.ins_mut(id).vreg = Some(base_id);
            return;
        }
        let dst = self.new_gpr();
        let mem = match ir.ins(offset).op {
            IrOp::Imm(v) => AsmOpr::Mem {
                base: base_id,
                index: None,
                disp: v as i32,
                bytes: 8,
            },
            _ => {
                let off = self.discharge(ir, offset);
                let off_id = off.reg_id().expect("offset discharge must yield a GPR");
                AsmOpr::Mem {
                    base: base_id,
                    index: Some((off_id, 1)),
                    disp: 0,
                    bytes: 8,
                }
            }
        };
        self.emit(X64Op::Lea, Some(reg64(dst)), Some(mem));
        ir.ins_mut(id).vreg = Some(dst);
    }

    fn lower_arith(&mut self, ir: &mut IrFn, id: IrInsId, op: ArithOp, lhs: IrInsId, rhs: IrInsId) {
        let ty = ir.ins(id).ty.clone();
        match op {
            ArithOp::SDiv | ArithOp::UDiv | ArithOp::SMod | ArithOp::UMod => {
                self.lower_div(ir, id, op, lhs, rhs, &ty)
            }
            ArithOp::Shl | ArithOp::Sar | ArithOp::Shr => {
                self.lower_shift(ir, id, op, lhs, rhs, &ty)
            }
            _ if ty.is_float() => self.lower_float_arith(ir, id, op, lhs, rhs, &ty),
            _ => self.lower_int_arith(ir, id, op, lhs, rhs, &ty),
        }
    }

    fn lower_div(
        &mut self,
        ir: &mut IrFn,
        id: IrInsId,
        op: ArithOp,
        lhs: IrInsId,
        rhs: IrInsId,
        ty: &IrType,
    ) {
        let size = gpr_size(ty);
        let lv = self.discharge(ir, lhs);
        self.emit(X64Op::Mov, Some(AsmOpr::Gpr { id: RAX, size }), Some(lv));
        let ext = match size {
            GprSize::R16 => X64Op::Cwd,
            GprSize::R32 => X64Op::Cdq,
            GprSize::R64 => X64Op::Cqo,
            GprSize::R8L => X64Op::Cwd,
        };
        self.emit(ext, None, None);
        // IDIV/DIV never take an immediate operand on real hardware.
        let divisor = self.inline_mem(ir, rhs);
        let divop = if matches!(op, ArithOp::SDiv | ArithOp::SMod) {
            X64Op::Idiv
        } else {
            X64Op::Div
        };
        self.emit(divop, Some(divisor), None);
        let dst = self.new_gpr();
        let src_reg = if matches!(op, ArithOp::SDiv | ArithOp::UDiv) {
            RAX
        } else {
            RDX
        };
        let dst_opr = self.vreg_opr(dst, ty);
        self.emit(
            X64Op::Mov,
            Some(dst_opr),
            Some(AsmOpr::Gpr { id: src_reg, size }),
        );
        ir.ins_mut(id).vreg = Some(dst);
    }

    fn lower_shift(
        &mut self,
        ir: &mut IrFn,
        id: IrInsId,
        op: ArithOp,
        lhs: IrInsId,
        rhs: IrInsId,
        ty: &IrType,
    ) {
        let lv = self.discharge(ir, lhs);
        let dst = self.new_gpr();
        let dst_opr = self.vreg_opr(dst, ty);
        self.emit(X64Op::Mov, Some(dst_opr.clone()), Some(lv));
        let amt = if let IrOp::Imm(v) = ir.ins(rhs).op {
            AsmOpr::Imm(v)
        } else {
            let rv = self.discharge(ir, rhs);
            let rid = rv.reg_id().expect("shift amount discharge must yield a GPR");
            self.emit(
                X64Op::Mov,
                Some(AsmOpr::Gpr {
                    id: RCX,
                    size: GprSize::R8L,
                }),
                Some(AsmOpr::Gpr {
                    id: rid,
                    size: GprSize::R8L,
                }),
            );
            AsmOpr::Gpr {
                id: RCX,
                size: GprSize::R8L,
            }
        };
        let sop = match op {
            ArithOp::Shl => X64Op::Shl,
            ArithOp::Sar => X64Op::Sar,
            ArithOp::Shr => X64Op::Shr,
            _ => unreachable!(),
        };
        self.emit(sop, Some(dst_opr), Some(amt));
        ir.ins_mut(id).vreg = Some(dst);
    }

    fn lower_float_arith(
        &mut self,
        ir: &mut IrFn,
        id: IrInsId,
        op: ArithOp,
        lhs: IrInsId,
        rhs: IrInsId,
        ty: &IrType,
    ) {
        let lv = self.discharge(ir, lhs);
        let dst = self.new_sse();
        let mv = if *ty == IrType::F32 {
            X64Op::Movss
        } else {
            X64Op::Movsd
        };
        self.emit(mv, Some(AsmOpr::Xmm { id: dst }), Some(lv));
        let rv = self.inline_mem(ir, rhs);
        let f32 = *ty == IrType::F32;
        let aop = match op {
            ArithOp::Add => {
                if f32 {
                    X64Op::Addss
                } else {
                    X64Op::Addsd
                }
            }
            ArithOp::Sub => {
                if f32 {
                    X64Op::Subss
                } else {
                    X64Op::Subsd
                }
            }
            ArithOp::Mul => {
                if f32 {
                    X64Op::Mulss
                } else {
                    X64Op::Mulsd
                }
            }
            ArithOp::FDiv => {
                if f32 {
                    X64Op::Divss
                } else {
                    X64Op::Divsd
                }
            }
            other => unreachable!("{other:?} is not a floating-point arithmetic opcode"),
        };
        self.emit(aop, Some(AsmOpr::Xmm { id: dst }), Some(rv));
        ir.ins_mut(id).vreg = Some(dst);
    }

    fn lower_int_arith(
        &mut self,
        ir: &mut IrFn,
        id: IrInsId,
        op: ArithOp,
        lhs: IrInsId,
        rhs: IrInsId,
        ty: &IrType,
    ) {
        let lv = self.discharge(ir, lhs);
        let dst = self.new_gpr();
        let dst_opr = self.vreg_opr(dst, ty);
        self.emit(X64Op::Mov, Some(dst_opr.clone()), Some(lv));
        let rv = self.inline_imm_mem(ir, rhs);
        let aop = match op {
            ArithOp::Add => X64Op::Add,
            ArithOp::Sub => X64Op::Sub,
            ArithOp::Mul => X64Op::IMul,
            ArithOp::And => X64Op::And,
            ArithOp::Or => X64Op::Or,
            ArithOp::Xor => X64Op::Xor,
            other => unreachable!("{other:?} is not routed through the integer arith path"),
        };
        self.emit(aop, Some(dst_opr), Some(rv));
        ir.ins_mut(id).vreg = Some(dst);
    }

    /// `TRUNC`/`PTR2I`: a plain `mov` sized per the *source* type, so a
    /// later narrow-register use truncates naturally.
    fn lower_narrow_mov(&mut self, ir: &mut IrFn, id: IrInsId, src: IrInsId) {
        let src_ty = ir.ins(src).ty.clone();
        let lv = self.discharge(ir, src);
        let dst = self.new_gpr();
        let dst_opr = AsmOpr::Gpr {
            id: dst,
            size: gpr_size(&src_ty),
        };
        self.emit(X64Op::Mov, Some(dst_opr), Some(lv));
        ir.ins_mut(id).vreg = Some(dst);
    }

    fn lower_extend(&mut self, ir: &mut IrFn, id: IrInsId, src: IrInsId, signed: bool) {
        let dst_ty = ir.ins(id).ty.clone();
        let is_imm = matches!(ir.ins(src).op, IrOp::Imm(_));
        let lv = self.discharge(ir, src);
        let dst = self.new_gpr();
        let dst_opr = self.vreg_opr(dst, &dst_ty);
        let op = if is_imm {
            X64Op::Mov
        } else if signed {
            X64Op::Movsx
        } else {
            X64Op::Movzx
        };
        self.emit(op, Some(dst_opr), Some(lv));
        ir.ins_mut(id).vreg = Some(dst);
    }

    /// `I2PTR`/`BITCAST`: reinterpret the bits in a fresh vreg of the
    /// destination's size.
    fn lower_reinterpret(&mut self, ir: &mut IrFn, id: IrInsId, src: IrInsId) {
        let dst_ty = ir.ins(id).ty.clone();
        let lv = self.discharge(ir, src);
        let dst = self.new_gpr();
        let dst_opr = self.vreg_opr(dst, &dst_ty);
        self.emit(X64Op::Mov, Some(dst_opr), Some(lv));
        ir.ins_mut(id).vreg = Some(dst);
    }

    fn lower_ftrunc(&mut self, ir: &mut IrFn, id: IrInsId, src: IrInsId) {
        // Discharged (register-only source): partial-register write hazards
        // make a memory source unsafe here.
        let lv = self.discharge(ir, src);
        let dst = self.new_sse();
        self.emit(X64Op::Cvtsd2ss, Some(AsmOpr::Xmm { id: dst }), Some(lv));
        ir.ins_mut(id).vreg = Some(dst);
    }

    fn lower_fext(&mut self, ir: &mut IrFn, id: IrInsId, src: IrInsId) {
        let lv = self.discharge(ir, src);
        let dst = self.new_sse();
        self.emit(X64Op::Cvtss2sd, Some(AsmOpr::Xmm { id: dst }), Some(lv));
        ir.ins_mut(id).vreg = Some(dst);
    }

    fn lower_fp2i(&mut self, ir: &mut IrFn, id: IrInsId, src: IrInsId) {
        let src_ty = ir.ins(src).ty.clone();
        let lv = self.discharge(ir, src);
        let dst = self.new_gpr();
        let dst_ty = ir.ins(id).ty.clone();
        let dst_opr = self.vreg_opr(dst, &dst_ty);
        let op = if src_ty == IrType::F32 {
            X64Op::Cvttss2si
        } else {
            X64Op::Cvttsd2si
        };
        self.emit(op, Some(dst_opr), Some(lv));
        ir.ins_mut(id).vreg = Some(dst);
    }

    fn lower_i2fp(&mut self, ir: &mut IrFn, id: IrInsId, src: IrInsId) {
        let lv = self.discharge(ir, src);
        let dst = self.new_sse();
        let dst_ty = ir.ins(id).ty.clone();
        let op = if dst_ty == IrType::F32 {
            X64Op::Cvtsi2ss
        } else {
            X64Op::Cvtsi2sd
        };
        self.emit(op, Some(AsmOpr::Xmm { id: dst }), Some(lv));
        ir.ins_mut(id).vreg = Some(dst);
    }

    fn lower_br(&mut self, ir: &mut IrFn, target: IrBbId) {
        let cur = self.cur_ir_bb.unwrap();
        if ir.next_bb(cur) != Some(target) {
            let target_bb = self.ir_bb_to_asm[&target];
            self.emit(X64Op::Jmp, Some(AsmOpr::Bb(target_bb)), None);
        }
    }

    fn lower_condbr(&mut self, ir: &mut IrFn, cond: IrInsId, t: IrBbId, f: IrBbId) {
        let (op, lhs, rhs) = match ir.ins(cond).op {
            IrOp::Cmp { op, lhs, rhs } => (op, lhs, rhs),
            ref other => panic!("CONDBR condition must be a comparison, got {other:?}"),
        };
        self.asm_cmp(ir, op, lhs, rhs);
        let cur = self.cur_ir_bb.unwrap();
        let next = ir.next_bb(cur);
        let (jcc_target, jcc) = if next == Some(t) {
            (f, cc_jump_op(invert_cc(op)))
        } else if next == Some(f) {
            (t, cc_jump_op(op))
        } else {
            panic!("CONDBR requires one branch target to be the textually next block");
        };
        let target_bb = self.ir_bb_to_asm[&jcc_target];
        self.emit(jcc, Some(AsmOpr::Bb(target_bb)), None);
    }

    fn lower_call(&mut self, ir: &mut IrFn, id: IrInsId, func: IrInsId, args: &[IrInsId]) {
        const MAX_SSE_ARGS: usize = 8;
        let mut gpr_i = 0usize;
        let mut sse_i = 0usize;
        for &arg in args {
            let ty = ir.ins(arg).ty.clone();
            let v = self.inline_imm(ir, arg);
            if ty.is_float() {
                assert!(
                    sse_i < MAX_SSE_ARGS,
                    "more than 8 floating-point call arguments are not supported"
                );
                let op = if ty == IrType::F32 {
                    X64Op::Movss
                } else {
                    X64Op::Movsd
                };
                self.emit(op, Some(AsmOpr::Xmm { id: sse_i as RegId }), Some(v));
                sse_i += 1;
            } else {
                assert!(
                    gpr_i < ARG_GPRS.len(),
                    "more than 6 integer call arguments are not supported"
                );
                let size = gpr_size(&ty);
                self.emit(
                    X64Op::Mov,
                    Some(AsmOpr::Gpr {
                        id: ARG_GPRS[gpr_i],
                        size,
                    }),
                    Some(v),
                );
                gpr_i += 1;
            }
        }
        let target = self.inline_label_mem(ir, func);
        self.emit(X64Op::Call, Some(target), None);

        let ret_ty = ir.ins(id).ty.clone();
        if !ret_ty.is_void() {
            let dst = self.new_vreg_for(&ret_ty);
            if ret_ty.is_float() {
                let op = if ret_ty == IrType::F32 {
                    X64Op::Movss
                } else {
                    X64Op::Movsd
                };
                self.emit(op, Some(AsmOpr::Xmm { id: dst }), Some(AsmOpr::Xmm { id: 0 }));
            } else {
                let dst_opr = self.vreg_opr(dst, &ret_ty);
                self.emit(
                    X64Op::Mov,
                    Some(dst_opr),
                    Some(AsmOpr::Gpr {
                        id: RAX,
                        size: gpr_size(&ret_ty),
                    }),
                );
            }
            ir.ins_mut(id).vreg = Some(dst);
        }
    }

    fn lower_ret(&mut self, ir: &mut IrFn, val: Option<IrInsId>) {
        if let Some(v) = val {
            let ty = ir.ins(v).ty.clone();
            if ty.is_float() {
                let lv = self.discharge(ir, v);
                let op = if ty == IrType::F32 {
                    X64Op::Movss
                } else {
                    X64Op::Movsd
                };
                self.emit(op, Some(AsmOpr::Xmm { id: 0 }), Some(lv));
            } else if ty.size() < 4 {
                let lv = self.discharge(ir, v);
                self.emit(
                    X64Op::Movsx,
                    Some(AsmOpr::Gpr {
                        id: RAX,
                        size: GprSize::R32,
                    }),
                    Some(lv),
                );
            } else {
                let lv = self.discharge(ir, v);
                self.emit(
                    X64Op::Mov,
                    Some(AsmOpr::Gpr {
                        id: RAX,
                        size: gpr_size(&ty),
                    }),
                    Some(lv),
                );
            }
        }
        let patch = self.emit(X64Op::Add, Some(reg64(RSP)), Some(AsmOpr::Imm(0)));
        self.stack_patch.push(patch);
        self.emit(X64Op::Pop, Some(reg64(RBP)), None);
        self.emit(X64Op::Ret, None, None);
    }
}
