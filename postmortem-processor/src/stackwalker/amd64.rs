//! x86-64 unwinding. Structurally the same as x86 minus the Windows
//! frame-data records, which don't exist on this architecture.

use std::collections::HashSet;

use tracing::trace;

use postmortem_symbols::SupplierInterrupted;

use crate::context::{Context, ContextAmd64, ContextValidity, RawContext};
use crate::memory::MemoryRegion;
use crate::process_state::{FrameTrust, StackFrame};
use crate::stackwalker::{
    callee_forwarded_regs, instruction_seems_valid, scan_for_return_address, CallerUnwinder,
    CfiStackWalker, UnwindArgs,
};

const POINTER_WIDTH: u64 = 8;
const INSTRUCTION_REGISTER: &str = "rip";
const STACK_POINTER_REGISTER: &str = "rsp";
const FRAME_POINTER_REGISTER: &str = "rbp";
const CALLEE_SAVED_REGS: &[&str] = &["rbx", "rbp", "r12", "r13", "r14", "r15"];

fn stack_seems_valid<M: MemoryRegion>(caller_sp: u64, callee_sp: u64, stack_memory: &M) -> bool {
    if caller_sp <= callee_sp {
        return false;
    }
    stack_memory
        .get_memory_at_address::<u64>(caller_sp)
        .is_some()
}

impl CallerUnwinder for ContextAmd64 {
    fn try_cfi<M: MemoryRegion>(
        &self,
        args: &UnwindArgs<'_, M>,
    ) -> Result<Option<StackFrame>, SupplierInterrupted> {
        trace!("trying cfi");
        let Some(callee_context) = &args.callee.context else {
            return Ok(None);
        };
        let valid = &callee_context.valid;
        if !valid.contains(INSTRUCTION_REGISTER) || !valid.contains(STACK_POINTER_REGISTER) {
            return Ok(None);
        }
        let last_sp = self.rsp;
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
        let caller_ip = walker.caller_ctx.rip;
        let caller_sp = walker.caller_ctx.rsp;
        trace!("caller_ip: 0x{:016x}, caller_sp: 0x{:016x}", caller_ip, caller_sp);

        if !instruction_seems_valid(caller_ip, args.modules) {
            return Ok(None);
        }
        if !stack_seems_valid(caller_sp, last_sp, args.stack_memory) {
            return Ok(None);
        }

        let context = Context {
            raw: RawContext::Amd64(walker.caller_ctx),
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
        let last_bp = self.rbp;
        if last_bp >= u64::MAX - POINTER_WIDTH * 2 {
            return None;
        }

        let caller_ip = args
            .stack_memory
            .get_memory_at_address::<u64>(last_bp + POINTER_WIDTH)?;
        let caller_bp = args.stack_memory.get_memory_at_address::<u64>(last_bp)?;
        let caller_sp = last_bp + POINTER_WIDTH * 2;

        let caller_ctx = ContextAmd64 {
            rip: caller_ip,
            rsp: caller_sp,
            rbp: caller_bp,
            ..ContextAmd64::default()
        };
        let mut valid = HashSet::new();
        valid.insert(INSTRUCTION_REGISTER);
        valid.insert(STACK_POINTER_REGISTER);
        valid.insert(FRAME_POINTER_REGISTER);
        let context = Context {
            raw: RawContext::Amd64(caller_ctx),
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
        let last_bp = valid.contains(FRAME_POINTER_REGISTER).then_some(self.rbp);

        let hit = scan_for_return_address(
            self.rsp,
            POINTER_WIDTH,
            1,
            args.callee.trust == FrameTrust::Context,
            args,
            prologue_only,
        )?;
        let Some(hit) = hit else {
            return Ok(None);
        };
        let caller_sp = hit.address_of_ip + POINTER_WIDTH;

        // Restore rbp if this function either pushed it in a standard
        // prologue (saved copy right below the return address) or
        // simply never touched it.
        let mut caller_bp = None;
        if let Some(last_bp) = last_bp {
            let address_of_bp = hit.address_of_ip.saturating_sub(POINTER_WIDTH);
            if last_bp == address_of_bp {
                if let Some(bp) = args.stack_memory.get_memory_at_address::<u64>(address_of_bp) {
                    if bp > hit.address_of_ip {
                        caller_bp = Some(bp);
                    }
                }
            } else if last_bp >= caller_sp {
                caller_bp = Some(last_bp);
            }
        }

        let caller_ctx = ContextAmd64 {
            rip: hit.caller_ip,
            rsp: caller_sp,
            rbp: caller_bp.unwrap_or(0),
            ..ContextAmd64::default()
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
            raw: RawContext::Amd64(caller_ctx),
            valid: ContextValidity::Some(valid),
        };
        Ok(Some(StackFrame::from_context(context, trust)))
    }

    fn caller_is_terminal(&self, _callee: &StackFrame, caller: &StackFrame) -> bool {
        let Some(context) = &caller.context else {
            return true;
        };
        if context.get_instruction_pointer() == 0 {
            return true;
        }
        context.get_stack_pointer() <= self.rsp
    }

    fn adjust_instruction(&self, frame: &mut StackFrame) {
        if frame.instruction > 0 {
            frame.instruction -= 1;
        }
    }
}
