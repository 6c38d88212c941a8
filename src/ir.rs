//! The typed, single-assignment intermediate representation consumed by the
//! backend (`back::asm`, `back::regalloc`).
//!
//! Building this IR from C source — lexing, parsing, semantic analysis — is
//! out of scope for this crate (see `SPEC_FULL.md` §1); what lives here is
//! the data model itself plus [`FnBuilder`], a small in-memory construction
//! API that lets tests and the demo binary hand the backend a function
//! without going through a parser.

use crate::common::*;

/// Types carried by IR values. Every IR instruction that produces a value
/// has one of these as its result type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IrType {
    Int { bits: u8 },
    Ptr,
    Array { elem: Box<IrType>, len: u32 },
    Float { bits: u8 },
    Void,
}

impl IrType {
    pub const I8: IrType = IrType::Int { bits: 8 };
    pub const I16: IrType = IrType::Int { bits: 16 };
    pub const I32: IrType = IrType::Int { bits: 32 };
    pub const I64: IrType = IrType::Int { bits: 64 };
    pub const F32: IrType = IrType::Float { bits: 32 };
    pub const F64: IrType = IrType::Float { bits: 64 };

    pub fn size(&self) -> u32 {
        match self {
            IrType::Int { bits } => *bits as u32 / 8,
            IrType::Ptr => 8,
            IrType::Array { elem, len } => elem.size() * len,
            IrType::Float { bits } => *bits as u32 / 8,
            IrType::Void => 0,
        }
    }

    pub fn align(&self) -> u32 {
        match self {
            IrType::Array { elem, .. } => elem.align(),
            _ => self.size().max(1),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, IrType::Float { .. })
    }

    pub fn is_void(&self) -> bool {
        matches!(self, IrType::Void)
    }
}

/// Arithmetic / bitwise binary opcodes (`ADD`, `SUB`, ... in spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    FDiv,
    SDiv,
    UDiv,
    SMod,
    UMod,
    And,
    Or,
    Xor,
    Shl,
    Sar,
    Shr,
}

/// Comparison opcodes. `Eq`/`Neq` apply to both integers and floats; the
/// rest are split by signedness/floatness as in spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
    Flt,
    Fle,
    Fgt,
    Fge,
}

impl CmpOp {
    pub fn is_float(&self) -> bool {
        matches!(
            self,
            CmpOp::Flt | CmpOp::Fle | CmpOp::Fgt | CmpOp::Fge
        )
    }
}

pub type IrInsId = ArenaIdx<IrIns>;
pub type IrBbId = ArenaIdx<IrBb>;

/// An opcode together with the operands it needs, referenced by instruction
/// id (the IR is a graph of typed SSA values addressed by arena index, in
/// place of the source compiler's linked list of node pointers).
#[derive(Clone, Debug)]
pub enum IrOp {
    Imm(i64),
    Fp(f64),
    Global(Id),
    /// The i-th formal argument (0-indexed).
    Farg(u32),
    /// Reserves stack space for a value of the given type; produces a
    /// pointer to it.
    Alloc(IrType),
    Load(IrInsId),
    Store { ptr: IrInsId, val: IrInsId },
    PtrAdd { ptr: IrInsId, offset: IrInsId },
    Arith { op: ArithOp, lhs: IrInsId, rhs: IrInsId },
    Cmp { op: CmpOp, lhs: IrInsId, rhs: IrInsId },
    Trunc(IrInsId),
    Sext(IrInsId),
    Zext(IrInsId),
    Ptr2I(IrInsId),
    I2Ptr(IrInsId),
    Bitcast(IrInsId),
    Ftrunc(IrInsId),
    Fext(IrInsId),
    Fp2I(IrInsId),
    I2Fp(IrInsId),
    Br(IrBbId),
    CondBr { cond: IrInsId, t: IrBbId, f: IrBbId },
    Call { func: IrInsId },
    /// A call argument. Must appear immediately after a `Call` (or another
    /// `Carg`) in the owning block's instruction list; the assembler scans
    /// forward from the `Call` to collect them (spec.md §4.1's `CALL` row).
    Carg(IrInsId),
    Ret(Option<IrInsId>),
}

/// A single IR instruction / value.
#[derive(Clone, Debug)]
pub struct IrIns {
    pub ty: IrType,
    pub op: IrOp,
    /// Set by the assembler once this value has been discharged into a
    /// vreg. `ALLOC` never sets this — it is re-materialized on every
    /// discharge (spec.md §3 Invariants).
    pub vreg: Option<u32>,
    /// Set by the assembler for `Alloc` nodes: byte offset below `rbp`.
    pub stack_slot: Option<i32>,
    /// Set by the assembler for `Fp` nodes: index into the function's f32
    /// or f64 constant pool.
    pub fp_idx: Option<u32>,
}

#[derive(Debug, Default)]
pub struct IrBb {
    pub ins: Vec<IrInsId>,
}

/// An IR function: a typed signature plus a sequence of basic blocks.
#[derive(Debug)]
pub struct IrFn {
    pub params: Vec<IrType>,
    pub ret: IrType,
    /// Basic blocks in program (textual) order; the assembler relies on
    /// this order for fall-through detection (spec.md §4.1's `BR`/`CONDBR`
    /// rows).
    pub bbs: Vec<IrBbId>,
    pub ins_arena: Arena<IrIns>,
    pub bb_arena: Arena<IrBb>,
}

impl IrFn {
    pub fn ins(&self, id: IrInsId) -> &IrIns {
        self.ins_arena.get(id)
    }

    pub fn ins_mut(&mut self, id: IrInsId) -> &mut IrIns {
        self.ins_arena.get_mut(id)
    }

    pub fn bb(&self, id: IrBbId) -> &IrBb {
        self.bb_arena.get(id)
    }

    /// The block following `bb` in textual order, if any.
    pub fn next_bb(&self, bb: IrBbId) -> Option<IrBbId> {
        let pos = self.bbs.iter().position(|&b| b == bb)?;
        self.bbs.get(pos + 1).copied()
    }
}

/// One global definition: a symbol, optionally backed by a function body.
/// Globals with no function (e.g. extern data) never gain an `AsmFn`.
#[derive(Debug)]
pub struct Global {
    pub label: Id,
    pub func: Option<IrFn>,
    pub asm: Option<crate::back::asm::AsmFn>,
}

impl Global {
    pub fn new(label: Id, func: Option<IrFn>) -> Self {
        Global { label, func, asm: None }
    }
}

/// An error raised by [`FnBuilder`] when asked to do something that isn't a
/// contract violation of the backend itself, but a mistake by the (human or
/// generated) caller building IR by hand — e.g. referencing a basic block
/// from a different function. Kept in the same spirit as the teacher's
/// `ParseError`/`LexError`: a message wrapped in hand-written `Display`.
pub struct BuildError(String);

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IR builder error: {}", self.0)
    }
}

impl std::fmt::Debug for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::error::Error for BuildError {}

/// A small, linear builder for IR functions. Basic blocks are allocated up
/// front (so forward branches can reference them) and filled in by
/// appending instructions one at a time.
pub struct FnBuilder {
    params: Vec<IrType>,
    ret: IrType,
    ins_arena: Arena<IrIns>,
    bb_arena: Arena<IrBb>,
    bbs: Vec<IrBbId>,
}

impl FnBuilder {
    pub fn new(params: Vec<IrType>, ret: IrType) -> Self {
        FnBuilder {
            params,
            ret,
            ins_arena: Arena::new(),
            bb_arena: Arena::new(),
            bbs: Vec::new(),
        }
    }

    /// Allocate a new, empty basic block at the end of the function and
    /// return its id. The id is valid immediately, so it can be used as a
    /// branch target before the block itself is populated.
    pub fn new_bb(&mut self) -> IrBbId {
        let id = self.bb_arena.push(IrBb::default());
        self.bbs.push(id);
        id
    }

    fn push(&mut self, bb: IrBbId, ty: IrType, op: IrOp) -> IrInsId {
        let id = self.ins_arena.push(IrIns {
            ty,
            op,
            vreg: None,
            stack_slot: None,
            fp_idx: None,
        });
        self.bb_arena.get_mut(bb).ins.push(id);
        id
    }

    pub fn imm(&mut self, bb: IrBbId, ty: IrType, v: i64) -> IrInsId {
        self.push(bb, ty, IrOp::Imm(v))
    }

    pub fn fp(&mut self, bb: IrBbId, ty: IrType, v: f64) -> IrInsId {
        self.push(bb, ty, IrOp::Fp(v))
    }

    pub fn global(&mut self, bb: IrBbId, label: Id) -> IrInsId {
        self.push(bb, IrType::Ptr, IrOp::Global(label))
    }

    pub fn farg(&mut self, bb: IrBbId, idx: u32) -> IrInsId {
        let ty = self.params[idx as usize].clone();
        self.push(bb, ty, IrOp::Farg(idx))
    }

    pub fn alloc(&mut self, bb: IrBbId, ty: IrType) -> IrInsId {
        self.push(bb, IrType::Ptr, IrOp::Alloc(ty))
    }

    pub fn load(&mut self, bb: IrBbId, ty: IrType, ptr: IrInsId) -> IrInsId {
        self.push(bb, ty, IrOp::Load(ptr))
    }

    pub fn store(&mut self, bb: IrBbId, ptr: IrInsId, val: IrInsId) -> IrInsId {
        self.push(bb, IrType::Void, IrOp::Store { ptr, val })
    }

    pub fn ptradd(&mut self, bb: IrBbId, ptr: IrInsId, offset: IrInsId) -> IrInsId {
        self.push(bb, IrType::Ptr, IrOp::PtrAdd { ptr, offset })
    }

    pub fn arith(&mut self, bb: IrBbId, ty: IrType, op: ArithOp, lhs: IrInsId, rhs: IrInsId) -> IrInsId {
        self.push(bb, ty, IrOp::Arith { op, lhs, rhs })
    }

    /// A comparison always produces a 1-byte-wide boolean (modeled as
    /// `i8`); when used directly as a `CondBr` guard, the assembler never
    /// actually materializes this value (spec.md §4.1 "Comparisons").
    pub fn cmp(&mut self, bb: IrBbId, op: CmpOp, lhs: IrInsId, rhs: IrInsId) -> IrInsId {
        self.push(bb, IrType::I8, IrOp::Cmp { op, lhs, rhs })
    }

    pub fn trunc(&mut self, bb: IrBbId, ty: IrType, src: IrInsId) -> IrInsId {
        self.push(bb, ty, IrOp::Trunc(src))
    }
    pub fn sext(&mut self, bb: IrBbId, ty: IrType, src: IrInsId) -> IrInsId {
        self.push(bb, ty, IrOp::Sext(src))
    }
    pub fn zext(&mut self, bb: IrBbId, ty: IrType, src: IrInsId) -> IrInsId {
        self.push(bb, ty, IrOp::Zext(src))
    }
    pub fn ptr2i(&mut self, bb: IrBbId, ty: IrType, src: IrInsId) -> IrInsId {
        self.push(bb, ty, IrOp::Ptr2I(src))
    }
    pub fn i2ptr(&mut self, bb: IrBbId, src: IrInsId) -> IrInsId {
        self.push(bb, IrType::Ptr, IrOp::I2Ptr(src))
    }
    pub fn bitcast(&mut self, bb: IrBbId, ty: IrType, src: IrInsId) -> IrInsId {
        self.push(bb, ty, IrOp::Bitcast(src))
    }
    pub fn ftrunc(&mut self, bb: IrBbId, src: IrInsId) -> IrInsId {
        self.push(bb, IrType::F32, IrOp::Ftrunc(src))
    }
    pub fn fext(&mut self, bb: IrBbId, src: IrInsId) -> IrInsId {
        self.push(bb, IrType::F64, IrOp::Fext(src))
    }
    pub fn fp2i(&mut self, bb: IrBbId, ty: IrType, src: IrInsId) -> IrInsId {
        self.push(bb, ty, IrOp::Fp2I(src))
    }
    pub fn i2fp(&mut self, bb: IrBbId, ty: IrType, src: IrInsId) -> IrInsId {
        self.push(bb, ty, IrOp::I2Fp(src))
    }

    pub fn br(&mut self, bb: IrBbId, target: IrBbId) -> IrInsId {
        self.push(bb, IrType::Void, IrOp::Br(target))
    }

    pub fn condbr(&mut self, bb: IrBbId, cond: IrInsId, t: IrBbId, f: IrBbId) -> IrInsId {
        self.push(bb, IrType::Void, IrOp::CondBr { cond, t, f })
    }

    pub fn call(&mut self, bb: IrBbId, ty: IrType, func: IrInsId, args: &[IrInsId]) -> IrInsId {
        let call = self.push(bb, ty, IrOp::Call { func });
        for &arg in args {
            self.push(bb, IrType::Void, IrOp::Carg(arg));
        }
        call
    }

    pub fn ret(&mut self, bb: IrBbId, val: Option<IrInsId>) -> IrInsId {
        self.push(bb, IrType::Void, IrOp::Ret(val))
    }

    /// Finish building and produce the [`IrFn`]. Checked only for the one
    /// mistake that would otherwise panic deep inside the assembler with a
    /// confusing message: an empty function.
    pub fn finish(self) -> Result<IrFn, BuildError> {
        if self.bbs.is_empty() {
            return Err(BuildError("function has no basic blocks".into()));
        }
        Ok(IrFn {
            params: self.params,
            ret: self.ret,
            bbs: self.bbs,
            ins_arena: self.ins_arena,
            bb_arena: self.bb_arena,
        })
    }
}
