//! The shared unwinding skeleton for link-register architectures.
//!
//! ARM, AArch64, MIPS, PowerPC, and RISC-V all keep the return address
//! in a link register and (under frame pointers) save `(fp, lr)` pairs
//! on the stack, so one implementation covers them, parameterized by
//! register names and word size. Each architecture's module implements
//! [`LrFamily`] and delegates its [`CallerUnwinder`] methods here.
//!
//! [`CallerUnwinder`]: super::CallerUnwinder

use std::collections::HashSet;

use tracing::trace;

use postmortem_symbols::SupplierInterrupted;

use crate::context::{Context, ContextValidity, CpuContext, RawContext};
use crate::memory::MemoryRegion;
use crate::process_state::{FrameTrust, StackFrame};
use crate::stackwalker::{
    callee_forwarded_regs, scan_for_return_address, CfiStackWalker, UnwindArgs,
};

pub(crate) trait LrFamily: CpuContext + Default {
    const POINTER_WIDTH: u64;
    /// How far a return address sits past its call instruction.
    const RETURN_ADDRESS_ADJUST: u64;
    const PROGRAM_COUNTER: &'static str;
    const STACK_POINTER: &'static str;
    const FRAME_POINTER: &'static str;
    const LINK_REGISTER: &'static str;
    const CALLEE_SAVED: &'static [&'static str];
    fn wrap(self) -> RawContext;
}

pub(crate) fn try_cfi<C: LrFamily, M: MemoryRegion>(
    ctx: &C,
    args: &UnwindArgs<'_, M>,
) -> Result<Option<StackFrame>, SupplierInterrupted> {
    let Some(callee_context) = &args.callee.context else {
        return Ok(None);
    };
    let valid = &callee_context.valid;
    if ctx.get_register(C::STACK_POINTER, valid).is_none() {
        return Ok(None);
    }
    let Some(module) = args.modules.module_at_address(args.callee.instruction) else {
        return Ok(None);
    };
    trace!("trying cfi");

    let mut walker = CfiStackWalker {
        instruction: args.callee.instruction,
        grand_callee_parameter_size: args.grand_callee_parameter_size(),
        callee_ctx: ctx,
        callee_validity: valid,
        // Forward callee-saved registers by default; the evaluator may
        // overwrite or clear them.
        caller_ctx: ctx.clone(),
        caller_validity: callee_forwarded_regs(valid, C::CALLEE_SAVED),
        stack_memory: args.stack_memory,
        pointer_width: C::POINTER_WIDTH,
        ip_name: C::PROGRAM_COUNTER,
        sp_name: C::STACK_POINTER,
    };
    if args.symbolizer.walk_frame(module, &mut walker)?.is_none() {
        return Ok(None);
    }

    let caller_pc = walker.caller_ctx.get_register_always(C::PROGRAM_COUNTER);
    let caller_sp = walker.caller_ctx.get_register_always(C::STACK_POINTER);
    trace!(
        "cfi evaluation successful, caller_pc: 0x{:016x}, caller_sp: 0x{:016x}",
        caller_pc,
        caller_sp,
    );

    let context = Context {
        raw: walker.caller_ctx.wrap(),
        valid: ContextValidity::Some(walker.caller_validity),
    };
    Ok(Some(StackFrame::from_context(
        context,
        FrameTrust::CallFrameInfo,
    )))
}

pub(crate) fn try_frame_pointer<C: LrFamily, M: MemoryRegion>(
    ctx: &C,
    args: &UnwindArgs<'_, M>,
) -> Option<StackFrame> {
    trace!("trying frame pointer");
    let valid = &args.callee.context.as_ref()?.valid;
    let last_fp = ctx.get_register(C::FRAME_POINTER, valid)?;
    let last_sp = ctx.get_register(C::STACK_POINTER, valid)?;
    let last_lr = ctx.get_register(C::LINK_REGISTER, valid)?;
    let width = C::POINTER_WIDTH;

    if last_fp >= u64::MAX - width * 2 {
        // Pointer math below would wrap.
        return None;
    }

    let (caller_fp, caller_pc, caller_sp, caller_lr) = if last_fp == 0 {
        // A zero frame pointer marks the outermost frame. Forcing the
        // caller's stack pointer to stand still makes the driver's
        // progress check end the walk.
        (0, last_lr, last_sp, 0)
    } else {
        (
            args.stack_memory.read_pointer(last_fp, width)?,
            last_lr,
            last_fp + width * 2,
            args.stack_memory.read_pointer(last_fp + width, width)?,
        )
    };

    let mut caller_ctx = C::default();
    caller_ctx.set_register(C::PROGRAM_COUNTER, caller_pc)?;
    caller_ctx.set_register(C::FRAME_POINTER, caller_fp)?;
    caller_ctx.set_register(C::STACK_POINTER, caller_sp)?;
    caller_ctx.set_register(C::LINK_REGISTER, caller_lr)?;

    let mut valid = HashSet::new();
    valid.insert(caller_ctx.memoize_register(C::PROGRAM_COUNTER)?);
    valid.insert(caller_ctx.memoize_register(C::FRAME_POINTER)?);
    valid.insert(caller_ctx.memoize_register(C::STACK_POINTER)?);
    valid.insert(caller_ctx.memoize_register(C::LINK_REGISTER)?);

    let context = Context {
        raw: caller_ctx.wrap(),
        valid: ContextValidity::Some(valid),
    };
    Some(StackFrame::from_context(context, FrameTrust::FramePointer))
}

pub(crate) fn try_scan<C: LrFamily, M: MemoryRegion>(
    ctx: &C,
    args: &UnwindArgs<'_, M>,
    prologue_only: bool,
) -> Result<Option<StackFrame>, SupplierInterrupted> {
    trace!("trying scan (prologue_only: {})", prologue_only);
    let Some(callee_context) = &args.callee.context else {
        return Ok(None);
    };
    let Some(last_sp) = ctx.get_register(C::STACK_POINTER, &callee_context.valid) else {
        return Ok(None);
    };

    let hit = scan_for_return_address(
        last_sp,
        C::POINTER_WIDTH,
        C::RETURN_ADDRESS_ADJUST,
        args.callee.trust == FrameTrust::Context,
        args,
        prologue_only,
    )?;
    let Some(hit) = hit else {
        return Ok(None);
    };

    let caller_sp = match hit.address_of_ip.checked_add(C::POINTER_WIDTH) {
        Some(sp) => sp,
        None => return Ok(None),
    };
    let mut caller_ctx = C::default();
    let _ = caller_ctx.set_register(C::PROGRAM_COUNTER, hit.caller_ip);
    let _ = caller_ctx.set_register(C::STACK_POINTER, caller_sp);

    let mut valid = HashSet::new();
    if let (Some(pc), Some(sp)) = (
        caller_ctx.memoize_register(C::PROGRAM_COUNTER),
        caller_ctx.memoize_register(C::STACK_POINTER),
    ) {
        valid.insert(pc);
        valid.insert(sp);
    }

    let trust = if prologue_only {
        FrameTrust::ScanPrologue
    } else {
        FrameTrust::Scan
    };
    let context = Context {
        raw: caller_ctx.wrap(),
        valid: ContextValidity::Some(valid),
    };
    Ok(Some(StackFrame::from_context(context, trust)))
}

pub(crate) fn caller_is_terminal<C: LrFamily>(callee: &StackFrame, caller: &StackFrame) -> bool {
    let Some(context) = &caller.context else {
        return true;
    };
    // An instruction pointer within the first page is as good as null.
    if context.get_instruction_pointer() < 4096 {
        trace!("instruction pointer is nullish, ending walk");
        return true;
    }
    let sp = context.get_stack_pointer();
    let last_sp = callee
        .context
        .as_ref()
        .map(|c| c.get_stack_pointer())
        .unwrap_or(0);
    if sp <= last_sp {
        // Leaf functions may not touch the stack at all thanks to the
        // link register, so the first unwind is allowed to stand still.
        let is_leaf = callee.trust == FrameTrust::Context && sp == last_sp;
        if !is_leaf {
            trace!("stack pointer went backwards, ending walk");
            return true;
        }
    }
    false
}

pub(crate) fn adjust_instruction<C: LrFamily>(frame: &mut StackFrame) {
    // A caller's pc is the return address, one call instruction past
    // the call itself. Point the lookup address back into the call.
    let ip = frame.instruction;
    frame.instruction = ip.saturating_sub(C::RETURN_ADDRESS_ADJUST);
}
