//! AArch64 unwinding: the link-register skeleton with the standard
//! `(fp, lr)` pair at x29/x30.

use postmortem_symbols::SupplierInterrupted;

use crate::context::{ContextArm64, RawContext};
use crate::memory::MemoryRegion;
use crate::process_state::StackFrame;
use crate::stackwalker::lr_family::{self, LrFamily};
use crate::stackwalker::{CallerUnwinder, UnwindArgs};

impl LrFamily for ContextArm64 {
    const POINTER_WIDTH: u64 = 8;
    const RETURN_ADDRESS_ADJUST: u64 = 4;
    const PROGRAM_COUNTER: &'static str = "pc";
    const STACK_POINTER: &'static str = "sp";
    const FRAME_POINTER: &'static str = "fp";
    const LINK_REGISTER: &'static str = "lr";
    const CALLEE_SAVED: &'static [&'static str] = &[
        "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28", "fp", "sp",
    ];

    fn wrap(self) -> RawContext {
        RawContext::Arm64(self)
    }
}

impl CallerUnwinder for ContextArm64 {
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
        lr_family::caller_is_terminal::<ContextArm64>(callee, caller)
    }
    fn adjust_instruction(&self, frame: &mut StackFrame) {
        lr_family::adjust_instruction::<ContextArm64>(frame)
    }
}
