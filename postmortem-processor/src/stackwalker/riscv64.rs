//! RISC-V unwinding via the link-register skeleton. `s0` is the frame
//! pointer; `ra` holds the return address.

use postmortem_symbols::SupplierInterrupted;

use crate::context::{ContextRiscv64, RawContext};
use crate::memory::MemoryRegion;
use crate::process_state::StackFrame;
use crate::stackwalker::lr_family::{self, LrFamily};
use crate::stackwalker::{CallerUnwinder, UnwindArgs};

impl LrFamily for ContextRiscv64 {
    const POINTER_WIDTH: u64 = 8;
    const RETURN_ADDRESS_ADJUST: u64 = 4;
    const PROGRAM_COUNTER: &'static str = "pc";
    const STACK_POINTER: &'static str = "sp";
    const FRAME_POINTER: &'static str = "s0";
    const LINK_REGISTER: &'static str = "ra";
    const CALLEE_SAVED: &'static [&'static str] = &[
        "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "sp",
    ];

    fn wrap(self) -> RawContext {
        RawContext::Riscv64(self)
    }
}

impl CallerUnwinder for ContextRiscv64 {
    fn try_cfi<M: MemoryRegion>(
        &self,
        args: &UnwindArgs<'_, M>,
    ) -> Result<Option<StackFrame>, SupplierInterrupted> {
        lr_family::try_cfi(self, args)
    }
    fn try_frame_pointer<M: MemoryRegion>(&self, args: &UnwindArgs<'_, M>) -> Option<StackFrame> {
        lr_family::try_frame_pointer(self, args)
    }
    fn try_scan<M: MemoryRegion>(
        &self,
        args: &UnwindArgs<'_, M>,
        prologue_only: bool,
    ) -> Result<Option<StackFrame>, SupplierInterrupted> {
        lr_family::try_scan(self, args, prologue_only)
    }
    fn caller_is_terminal(&self, callee: &StackFrame, caller: &StackFrame) -> bool {
        lr_family::caller_is_terminal::<ContextRiscv64>(callee, caller)
    }
    fn adjust_instruction(&self, frame: &mut StackFrame) {
        lr_family::adjust_instruction::<ContextRiscv64>(frame)
    }
}
