//! PowerPC unwinding via the link-register skeleton. r1 is the stack
//! pointer; r31 conventionally holds the frame pointer.

use postmortem_symbols::SupplierInterrupted;

use crate::context::{ContextPpc64, RawContext};
use crate::memory::MemoryRegion;
use crate::process_state::StackFrame;
use crate::stackwalker::lr_family::{self, LrFamily};
use crate::stackwalker::{CallerUnwinder, UnwindArgs};

impl LrFamily for ContextPpc64 {
    const POINTER_WIDTH: u64 = 8;
    const RETURN_ADDRESS_ADJUST: u64 = 4;
    const PROGRAM_COUNTER: &'static str = "pc";
    const STACK_POINTER: &'static str = "sp";
    const FRAME_POINTER: &'static str = "r31";
    const LINK_REGISTER: &'static str = "lr";
    const CALLEE_SAVED: &'static [&'static str] = &[
        "r14", "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25", "r26",
        "r27", "r28", "r29", "r30", "r31", "sp",
    ];

    fn wrap(self) -> RawContext {
        RawContext::Ppc64(self)
    }
}

impl CallerUnwinder for ContextPpc64 {
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
        lr_family::caller_is_terminal::<ContextPpc64>(callee, caller)
    }
    fn adjust_instruction(&self, frame: &mut StackFrame) {
        lr_family::adjust_instruction::<ContextPpc64>(frame)
    }
}
