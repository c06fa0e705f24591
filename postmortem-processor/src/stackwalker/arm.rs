//! ARM (AArch32) unwinding: the link-register skeleton with r11 as the
//! frame pointer.

use postmortem_symbols::SupplierInterrupted;

use crate::context::{ContextArm, RawContext};
use crate::memory::MemoryRegion;
use crate::process_state::StackFrame;
use crate::stackwalker::lr_family::{self, LrFamily};
use crate::stackwalker::{CallerUnwinder, UnwindArgs};

impl LrFamily for ContextArm {
    const POINTER_WIDTH: u64 = 4;
    const RETURN_ADDRESS_ADJUST: u64 = 4;
    const PROGRAM_COUNTER: &'static str = "pc";
    const STACK_POINTER: &'static str = "sp";
    const FRAME_POINTER: &'static str = "r11";
    const LINK_REGISTER: &'static str = "lr";
    const CALLEE_SAVED: &'static [&'static str] = &[
        "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "sp",
    ];

    fn wrap(self) -> RawContext {
        RawContext::Arm(self)
    }
}

impl CallerUnwinder for ContextArm {
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
        lr_family::caller_is_terminal::<ContextArm>(callee, caller)
    }
    fn adjust_instruction(&self, frame: &mut StackFrame) {
        lr_family::adjust_instruction::<ContextArm>(frame)
    }
}
