//! The back-end of the compiler: instruction selection (`asm`) followed by
//! graph-coloring register allocation (`regalloc`).

pub mod asm;
pub mod regalloc;

pub use asm::*;
pub use regalloc::*;

/// Run the full backend over every global that carries a function body:
/// select instructions (producing vreg-using assembly), then allocate
/// registers independently for the GPR and SSE classes.
///
/// This is the one public entry point a driver needs (`SPEC_FULL.md` §6).
pub fn compile_globals(globals: &mut [crate::ir::Global]) {
    for global in globals.iter_mut() {
        let Some(ir_fn) = &mut global.func else { continue };
        log::debug!("assembling {}", global.label);
        let mut asm_fn = asm::Assembler::new(global.label).run(ir_fn);
        regalloc::RegAlloc::new(regalloc::RegClass::Gpr, &mut asm_fn).run();
        regalloc::RegAlloc::new(regalloc::RegClass::Sse, &mut asm_fn).run();
        global.asm = Some(asm_fn);
    }
}

#[cfg(test)]
mod tests;
