//! MIPS unwinding via the link-register skeleton. Return addresses sit
//! two instructions past the call because of the branch delay slot.

use postmortem_symbols::SupplierInterrupted;

use crate::context::{ContextMips, RawContext};
use crate::memory::MemoryRegion;
use crate::process_state::StackFrame;
use crate::stackwalker::lr_family::{self, LrFamily};
use crate::stackwalker::{CallerUnwinder, UnwindArgs};

impl LrFamily for ContextMips {
    const POINTER_WIDTH: u64 = 8;
    const RETURN_ADDRESS_ADJUST: u64 = 8;
    const PROGRAM_COUNTER: &'static str = "pc";
    const STACK_POINTER: &'static str = "sp";
    const FRAME_POINTER: &'static str = "fp";
    const LINK_REGISTER: &'static str = "ra";
    const CALLEE_SAVED: &'static [&'static str] = &[
        "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "gp", "sp", "fp",
    ];

    fn wrap(self) -> RawContext {
        RawContext::Mips(self)
    }
}

impl CallerUnwinder for ContextMips {
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
        lr_family::caller_is_terminal::<ContextMips>(callee, caller)
    }
    fn adjust_instruction(&self, frame: &mut StackFrame) {
        lr_family::adjust_instruction::<ContextMips>(frame)
    }
}
