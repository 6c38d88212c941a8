//! The compiler binary. Since lexing/parsing C source is out of scope for
//! this crate (`ir.rs`'s module doc), this drives the backend with a fixed
//! menu of hand-built IR functions instead of reading a source file; pick one
//! with `--demo` and choose whether to see it before or after register
//! allocation.
//!
//! run with `--help` for more info.

use cflatc::back;
use cflatc::common::id;
use cflatc::ir::{ArithOp, CmpOp, FnBuilder, Global, IrFn, IrType};

use clap::{Parser, ValueEnum};
use derive_more::Display;

#[derive(Display)]
#[display("demo build error: {}", self.0)]
struct DemoError(String);

impl std::fmt::Debug for DemoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::error::Error for DemoError {}

impl From<cflatc::ir::BuildError> for DemoError {
    fn from(e: cflatc::ir::BuildError) -> Self {
        DemoError(e.to_string())
    }
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// which built-in IR function to compile
    #[arg(value_enum)]
    demo: Demo,
    /// print instruction-selected assembly before register allocation,
    /// instead of the final allocated form
    #[arg(long, default_value_t = false)]
    vreg: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Demo {
    /// `int f(int a) { return a; }`
    Identity,
    /// `int f(int a, int b) { return a + b; }`
    AddArgs,
    /// `int f() { int x = 5; return x; }`
    LocalVar,
    /// `int f(int a, int b) { if (a < b) return a; else return b; }`
    IfElse,
    /// `double f(double a, double b) { return a + b; }`
    FloatAdd,
    /// `int f(int a, int b) { return a / b; }`
    SignedDiv,
}

impl Demo {
    fn build(self) -> Result<IrFn, DemoError> {
        let f = match self {
            Demo::Identity => {
                let mut b = FnBuilder::new(vec![IrType::I32], IrType::I32);
                let entry = b.new_bb();
                let a = b.farg(entry, 0);
                b.ret(entry, Some(a));
                b
            }
            Demo::AddArgs => {
                let mut b = FnBuilder::new(vec![IrType::I32, IrType::I32], IrType::I32);
                let entry = b.new_bb();
                let a = b.farg(entry, 0);
                let rhs = b.farg(entry, 1);
                let sum = b.arith(entry, IrType::I32, ArithOp::Add, a, rhs);
                b.ret(entry, Some(sum));
                b
            }
            Demo::LocalVar => {
                let mut b = FnBuilder::new(vec![], IrType::I32);
                let entry = b.new_bb();
                let slot = b.alloc(entry, IrType::I32);
                let five = b.imm(entry, IrType::I32, 5);
                b.store(entry, slot, five);
                let loaded = b.load(entry, IrType::I32, slot);
                b.ret(entry, Some(loaded));
                b
            }
            Demo::IfElse => {
                let mut b = FnBuilder::new(vec![IrType::I32, IrType::I32], IrType::I32);
                let entry = b.new_bb();
                let then_bb = b.new_bb();
                let else_bb = b.new_bb();
                let a = b.farg(entry, 0);
                let rhs = b.farg(entry, 1);
                let cond = b.cmp(entry, CmpOp::Slt, a, rhs);
                b.condbr(entry, cond, then_bb, else_bb);
                b.ret(then_bb, Some(a));
                b.ret(else_bb, Some(rhs));
                b
            }
            Demo::FloatAdd => {
                let mut b = FnBuilder::new(vec![IrType::F64, IrType::F64], IrType::F64);
                let entry = b.new_bb();
                let a = b.farg(entry, 0);
                let rhs = b.farg(entry, 1);
                let sum = b.arith(entry, IrType::F64, ArithOp::Add, a, rhs);
                b.ret(entry, Some(sum));
                b
            }
            Demo::SignedDiv => {
                let mut b = FnBuilder::new(vec![IrType::I32, IrType::I32], IrType::I32);
                let entry = b.new_bb();
                let a = b.farg(entry, 0);
                let rhs = b.farg(entry, 1);
                let q = b.arith(entry, IrType::I32, ArithOp::SDiv, a, rhs);
                b.ret(entry, Some(q));
                b
            }
        };
        Ok(f.finish()?)
    }

    fn label(self) -> &'static str {
        match self {
            Demo::Identity => "identity",
            Demo::AddArgs => "add_args",
            Demo::LocalVar => "local_var",
            Demo::IfElse => "if_else",
            Demo::FloatAdd => "float_add",
            Demo::SignedDiv => "signed_div",
        }
    }
}

fn print_asm(asm: &back::AsmFn) {
    for (i, &bb) in asm.bbs.iter().enumerate() {
        println!(".L{i}:");
        for id in asm.ins_in(bb) {
            println!("    {}", asm.ins(id));
        }
    }
}

fn main() -> Result<(), DemoError> {
    env_logger::init();
    let args = Args::parse();

    let ir_fn = args.demo.build()?;

    if args.vreg {
        let mut ir_fn = ir_fn;
        let asm = back::Assembler::new(id(args.demo.label())).run(&mut ir_fn);
        print_asm(&asm);
    } else {
        let mut globals = vec![Global::new(id(args.demo.label()), Some(ir_fn))];
        back::compile_globals(&mut globals);
        let asm = globals.pop().unwrap().asm.expect("function body was assembled");
        print_asm(&asm);
    }

    Ok(())
}
