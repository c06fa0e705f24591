//! x86 unwinding. The only architecture with Windows frame-data
//! records, which ride the same frame-info path as CFI.

use std::collections::HashSet;

use tracing::trace;

use postmortem_symbols::SupplierInterrupted;

use crate::context::{Context, ContextValidity, ContextX86, RawContext};
use crate::memory::MemoryRegion;
use crate::process_state::{FrameTrust, StackFrame};
use crate::stackwalker::{
    callee_forwarded_regs, instruction_seems_valid, scan_for_return_address, CallerUnwinder,
    CfiStackWalker, UnwindArgs,
};

const POINTER_WIDTH: u64 = 4;
const INSTRUCTION_REGISTER: &str = "eip";
const STACK_POINTER_REGISTER: &str = "esp";
const FRAME_POINTER_REGISTER: &str = "ebp";
const CALLEE_SAVED_REGS: &[&str] = &["ebp", "ebx", "edi", "esi"];

// Max reasonable size for a single x86 frame, used when recovering the
// ebp chain after a scan. Stack-frame histograms put 99.5% of frames
// under this.
const MAX_REASONABLE_GAP_BETWEEN_FRAMES: u64 = 128 * 1024;

fn stack_seems_valid<M: MemoryRegion>(caller_sp: u64, callee_sp: u64, stack_memory: &M) -> bool {
    // The stack must not grow when we unwind.
    if caller_sp <= callee_sp {
        return false;
    }
    // And the new stack pointer must point into the stack.
    stack_memory
        .get_memory_at_address::<u32>(caller_sp)
        .is_some()
}

impl CallerUnwinder for ContextX86 {
    fn try_cfi<M: MemoryRegion>(
        &self,
        args: &UnwindArgs<'_, M>,
    ) -> Result<Option<StackFrame>, SupplierInterrupted> {
        trace!("trying frame info (STACK WIN / CFI)");
        let Some(callee_context) = &args.callee.context else {
            return Ok(None);
        };
        let valid = &callee_context.valid;
        if !valid.contains(INSTRUCTION_REGISTER) || !valid.contains(STACK_POINTER_REGISTER) {
            return Ok(None);
        }
        let last_sp = self.esp as u64;
        let Some(module) = args.modules.module_at_address(args.callee.instruction) else {
            return Ok(None);
        };

        let mut walker = CfiStackWalker {
            instruction: args.callee.instruction,
            grand_callee_parameter_size: args.grand_callee_parameter_size(),
            callee_ctx: self,
            callee_validity: valid,
            caller_ctx: self.clone(),
            caller_validity: callee_forwarded_regs(valid, CALLEE_SAVED_REGS),
            stack_memory: args.stack_memory,
            pointer_width: POINTER_WIDTH,
            ip_name: INSTRUCTION_REGISTER,
            sp_name: STACK_POINTER_REGISTER,
        };
        if args.symbolizer.walk_frame(module, &mut walker)?.is_none() {
            return Ok(None);
        }
        let caller_ip = walker.caller_ctx.eip as u64;
        let caller_sp = walker.caller_ctx.esp as u64;
        trace!("caller_ip: 0x{:08x}, caller_sp: 0x{:08x}", caller_ip, caller_sp);

        // Don't accept obviously wrong answers.
        if !instruction_seems_valid(caller_ip, args.modules) {
            return Ok(None);
        }
        if !stack_seems_valid(caller_sp, last_sp, args.stack_memory) {
            return Ok(None);
        }

        let context = Context {
            raw: RawContext::X86(walker.caller_ctx),
            valid: ContextValidity::Some(walker.caller_validity),
        };
        Ok(Some(StackFrame::from_context(
            context,
            FrameTrust::CallFrameInfo,
        )))
    }

    fn try_frame_pointer<M: MemoryRegion>(&self, args: &UnwindArgs<'_, M>) -> Option<StackFrame> {
        trace!("trying frame pointer");
        let valid = &args.callee.context.as_ref()?.valid;
        if !valid.contains(FRAME_POINTER_REGISTER) {
            return None;
        }
        let last_bp = self.ebp as u64;

        // With the standard prologue, the caller's %ebp sits right at
        // *%ebp and the return address one pointer above it:
        //
        //   %ip_new = *(%bp_old + ptr)
        //   %sp_new = %bp_old + 2*ptr
        //   %bp_new = *(%bp_old)
        let caller_ip = args
            .stack_memory
            .get_memory_at_address::<u32>(last_bp + POINTER_WIDTH)?;
        let caller_bp = args.stack_memory.get_memory_at_address::<u32>(last_bp)?;
        let caller_sp = last_bp + POINTER_WIDTH * 2;

        let caller_ctx = ContextX86 {
            eip: caller_ip,
            esp: caller_sp as u32,
            ebp: caller_bp,
            ..ContextX86::default()
        };
        let mut valid = HashSet::new();
        valid.insert(INSTRUCTION_REGISTER);
        valid.insert(STACK_POINTER_REGISTER);
        valid.insert(FRAME_POINTER_REGISTER);
        let context = Context {
            raw: RawContext::X86(caller_ctx),
            valid: ContextValidity::Some(valid),
        };
        Some(StackFrame::from_context(context, FrameTrust::FramePointer))
    }

    fn try_scan<M: MemoryRegion>(
        &self,
        args: &UnwindArgs<'_, M>,
        prologue_only: bool,
    ) -> Result<Option<StackFrame>, SupplierInterrupted> {
        trace!("trying scan (prologue_only: {})", prologue_only);
        let Some(callee_context) = &args.callee.context else {
            return Ok(None);
        };
        let valid = &callee_context.valid;
        if !valid.contains(STACK_POINTER_REGISTER) {
            return Ok(None);
        }
        let last_bp = valid
            .contains(FRAME_POINTER_REGISTER)
            .then_some(self.ebp as u64);

        let hit = scan_for_return_address(
            self.esp as u64,
            POINTER_WIDTH,
            1,
            args.callee.trust == FrameTrust::Context,
            args,
            prologue_only,
        )?;
        let Some(hit) = hit else {
            return Ok(None);
        };
        // The candidate was pushed by a CALL, so the caller's esp is
        // just past it.
        let caller_sp = hit.address_of_ip + POINTER_WIDTH;

        // Try to restore ebp too. Either this function has the standard
        // prologue, in which case the saved ebp sits just below the
        // return address, or it never touched ebp and the callee's
        // value is still the caller's.
        let mut caller_bp: Option<u64> = None;
        let address_of_bp = hit.address_of_ip.saturating_sub(POINTER_WIDTH);
        if let Some(bp) = args.stack_memory.get_memory_at_address::<u32>(address_of_bp) {
            let bp = bp as u64;
            if bp > hit.address_of_ip && bp - address_of_bp <= MAX_REASONABLE_GAP_BETWEEN_FRAMES {
                if args
                    .stack_memory
                    .get_memory_at_address::<u32>(bp)
                    .is_some()
                {
                    caller_bp = Some(bp);
                }
            } else if let Some(last_bp) = last_bp {
                if last_bp >= caller_sp
                    && args
                        .stack_memory
                        .get_memory_at_address::<u32>(last_bp)
                        .is_some()
                {
                    caller_bp = Some(last_bp);
                }
            }
        }

        let caller_ctx = ContextX86 {
            eip: hit.caller_ip as u32,
            esp: caller_sp as u32,
            ebp: caller_bp.unwrap_or(0) as u32,
            ..ContextX86::default()
        };
        let mut valid = HashSet::new();
        valid.insert(INSTRUCTION_REGISTER);
        valid.insert(STACK_POINTER_REGISTER);
        if caller_bp.is_some() {
            valid.insert(FRAME_POINTER_REGISTER);
        }
        let trust = if prologue_only {
            FrameTrust::ScanPrologue
        } else {
            FrameTrust::Scan
        };
        let context = Context {
            raw: RawContext::X86(caller_ctx),
            valid: ContextValidity::Some(valid),
        };
        Ok(Some(StackFrame::from_context(context, trust)))
    }

    fn caller_is_terminal(&self, _callee: &StackFrame, caller: &StackFrame) -> bool {
        let Some(context) = &caller.context else {
            return true;
        };
        // An instruction address of 0 is end-of-stack.
        if context.get_instruction_pointer() == 0 {
            return true;
        }
        // A stack pointer at or below the old one means no progress;
        // stop rather than loop.
        context.get_stack_pointer() <= self.esp as u64
    }

    fn adjust_instruction(&self, frame: &mut StackFrame) {
        // The caller's ip is the return address, one past the CALL that
        // got us here. Point the lookup inside the CALL instruction.
        if frame.instruction > 0 {
            frame.instruction -= 1;
        }
    }
}
