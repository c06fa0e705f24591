//! Unwind stack frames for a thread.
//!
//! One driver loop composes the per-architecture
//! [`CallerUnwinder`] implementations: starting from the thread's
//! context frame, each caller is recovered with the strongest available
//! technique (frame info, frame pointer, scanning), symbolicated, and
//! appended until a terminal condition is reached.

use std::collections::{BTreeMap, HashSet};

use tracing::trace;

use postmortem_symbols::{
    FillSymbolError, FrameSymbolizer, FrameWalker, SupplierInterrupted, Symbolizer,
};

use crate::context::{Context, ContextValidity, CpuContext, RawContext};
use crate::dump::ModuleList;
use crate::memory::MemoryRegion;
use crate::process_state::{CallStack, CallStackInfo, FrameTrust, InlineFrame, StackFrame};

mod address_list;
mod amd64;
mod arm;
mod arm64;
mod lr_family;
mod mips;
mod ppc;
mod riscv64;
mod unwind;
mod x86;

pub use address_list::walk_address_list;
pub use unwind::{CallerUnwinder, UnwindArgs};

#[cfg(test)]
mod amd64_unittest;
#[cfg(test)]
mod x86_unittest;

/// Knobs for the walker's bounded searches.
#[derive(Clone, Debug)]
pub struct WalkOptions {
    /// Hard cap on frames per thread.
    pub frame_limit: usize,
    /// Word budget for one stack scan. The first unwind off a context
    /// frame uses the whole budget (those frames are often the most
    /// damaged); later frames use a quarter of it.
    pub scan_words: u64,
    /// Whether stack scanning is permitted at all.
    pub allow_scan: bool,
}

impl Default for WalkOptions {
    fn default() -> WalkOptions {
        WalkOptions {
            frame_limit: 1024,
            scan_words: 1024,
            allow_scan: true,
        }
    }
}

/// A [`FrameWalker`] over a callee context and a caller context under
/// construction. Frame-info evaluation reads the callee side and writes
/// the caller side; the driver then promotes the caller side into a
/// frame.
pub struct CfiStackWalker<'a, C, M> {
    pub instruction: u64,
    pub grand_callee_parameter_size: u32,

    pub callee_ctx: &'a C,
    pub callee_validity: &'a ContextValidity,

    pub caller_ctx: C,
    pub caller_validity: HashSet<&'static str>,

    pub stack_memory: &'a M,
    pub pointer_width: u64,
    pub ip_name: &'static str,
    pub sp_name: &'static str,
}

impl<C: CpuContext, M: MemoryRegion> FrameWalker for CfiStackWalker<'_, C, M> {
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn get_grand_callee_parameter_size(&self) -> u32 {
        self.grand_callee_parameter_size
    }
    fn get_register_at_address(&self, address: u64) -> Option<u64> {
        self.stack_memory.read_pointer(address, self.pointer_width)
    }
    fn get_callee_register(&self, name: &str) -> Option<u64> {
        self.callee_ctx.get_register(name, self.callee_validity)
    }
    fn set_caller_register(&mut self, name: &str, val: u64) -> Option<()> {
        let name = self.caller_ctx.memoize_register(name)?;
        self.caller_validity.insert(name);
        self.caller_ctx.set_register(name, val)
    }
    fn clear_caller_register(&mut self, name: &str) {
        if let Some(name) = self.caller_ctx.memoize_register(name) {
            self.caller_validity.remove(name);
        }
    }
    fn set_cfa(&mut self, val: u64) -> Option<()> {
        // The CFA is the caller's stack pointer by definition.
        let name = self.caller_ctx.memoize_register(self.sp_name)?;
        self.caller_validity.insert(name);
        self.caller_ctx.set_register(name, val)
    }
    fn set_ra(&mut self, val: u64) -> Option<()> {
        let name = self.caller_ctx.memoize_register(self.ip_name)?;
        self.caller_validity.insert(name);
        self.caller_ctx.set_register(name, val)
    }
}

/// The callee-saved registers that may be forwarded into the caller
/// context by default, filtered to the ones actually valid.
pub(crate) fn callee_forwarded_regs(
    valid: &ContextValidity,
    callee_saved: &'static [&'static str],
) -> HashSet<&'static str> {
    match valid {
        ContextValidity::All => callee_saved.iter().copied().collect(),
        ContextValidity::Some(which) => callee_saved
            .iter()
            .filter(|&reg| which.contains(reg))
            .copied()
            .collect(),
    }
}

/// Does any loaded module map this address?
pub(crate) fn instruction_seems_valid(addr: u64, modules: &ModuleList) -> bool {
    modules.module_at_address(addr).is_some()
}

/// Does a named function cover this address? Used by the scan's
/// call-site test; stronger than module containment.
pub(crate) fn instruction_has_symbols(
    addr: u64,
    modules: &ModuleList,
    symbolizer: &Symbolizer,
) -> Result<bool, SupplierInterrupted> {
    struct DummyFrame {
        instruction: u64,
        has_name: bool,
    }
    impl FrameSymbolizer for DummyFrame {
        fn get_instruction(&self) -> u64 {
            self.instruction
        }
        fn set_function(&mut self, _name: &str, _base: u64, _parameter_size: u32, _multiple: bool) {
            self.has_name = true;
        }
        fn set_source_file(&mut self, _file: &str, _line: u32, _base: u64) {}
    }

    let Some(module) = modules.module_at_address(addr) else {
        return Ok(false);
    };
    let mut frame = DummyFrame {
        instruction: addr,
        has_name: false,
    };
    match symbolizer.fill_symbol(module, &mut frame) {
        Ok(()) => Ok(frame.has_name),
        Err(FillSymbolError::NotFound) => Ok(false),
        Err(FillSymbolError::Interrupted) => Err(SupplierInterrupted),
    }
}

/// A candidate return address found by scanning.
pub(crate) struct ScanHit {
    /// Where on the stack the candidate was found.
    pub address_of_ip: u64,
    /// The candidate return address itself.
    pub caller_ip: u64,
}

/// Scan pointer-aligned words from `last_sp` upward for something that
/// looks like a return address. Reads never leave the provided region;
/// hitting its end just ends the scan.
pub(crate) fn scan_for_return_address<M: MemoryRegion>(
    last_sp: u64,
    width: u64,
    return_address_adjust: u64,
    from_context_frame: bool,
    args: &UnwindArgs<'_, M>,
    prologue_only: bool,
) -> Result<Option<ScanHit>, SupplierInterrupted> {
    // The first frame of an unwind is often the most damaged and
    // benefits from a longer search.
    let words = if from_context_frame {
        args.options.scan_words
    } else {
        args.options.scan_words / 4
    };
    let start = last_sp
        .checked_add(width - 1)
        .map(|sp| sp & !(width - 1))
        .unwrap_or(last_sp);

    for i in 0..words {
        let Some(address_of_ip) = start.checked_add(i * width) else {
            break;
        };
        let Some(caller_ip) = args.stack_memory.read_pointer(address_of_ip, width) else {
            break;
        };
        let acceptable = if prologue_only {
            instruction_has_symbols(
                caller_ip.wrapping_sub(return_address_adjust),
                args.modules,
                args.symbolizer,
            )?
        } else {
            instruction_seems_valid(caller_ip, args.modules)
        };
        if acceptable {
            trace!(
                "scan hit at 0x{:x}: caller_ip 0x{:x}",
                address_of_ip,
                caller_ip
            );
            return Ok(Some(ScanHit {
                address_of_ip,
                caller_ip,
            }));
        }
    }
    Ok(None)
}

fn make_inline_frame(physical: &StackFrame, inline: InlineFrame) -> StackFrame {
    StackFrame {
        instruction: physical.instruction,
        module: physical.module.clone(),
        unloaded_modules: BTreeMap::new(),
        function_name: Some(inline.function_name),
        function_base: Some(inline.function_base),
        parameter_size: physical.parameter_size,
        is_multiple: false,
        source_file_name: inline.source_file_name,
        source_line: inline.source_line,
        source_line_base: None,
        trust: FrameTrust::Inline,
        context: physical.context.clone(),
        inlines: vec![],
    }
}

/// Attach module and symbol information to one frame. The supplier may
/// interrupt, which aborts the whole dump.
pub(crate) fn fill_frame_info(
    frame: &mut StackFrame,
    modules: &ModuleList,
    symbolizer: &Symbolizer,
) -> Result<(), SupplierInterrupted> {
    if let Some(module) = modules.module_at_address(frame.instruction) {
        frame.module = Some(module.clone());
        match symbolizer.fill_symbol(module, frame) {
            Ok(()) | Err(FillSymbolError::NotFound) => {}
            Err(FillSymbolError::Interrupted) => return Err(SupplierInterrupted),
        }
    }
    Ok(())
}

fn unwind_with<C: CallerUnwinder, M: MemoryRegion>(
    ctx: &C,
    args: &UnwindArgs<'_, M>,
) -> Result<Option<StackFrame>, SupplierInterrupted> {
    let mut caller = ctx.try_cfi(args)?;
    if caller.is_none() {
        caller = ctx.try_frame_pointer(args);
    }
    if caller.is_none() && args.options.allow_scan {
        caller = ctx.try_scan(args, true)?;
    }
    if caller.is_none() && args.options.allow_scan {
        caller = ctx.try_scan(args, false)?;
    }
    let Some(mut caller) = caller else {
        return Ok(None);
    };

    if ctx.caller_is_terminal(args.callee, &caller) {
        trace!("caller frame is terminal, ending walk");
        return Ok(None);
    }
    // With scanning disabled there is no way to make sense of a frame
    // outside every known module; stop rather than guess.
    if !args.options.allow_scan && !instruction_seems_valid(caller.instruction, args.modules) {
        return Ok(None);
    }

    ctx.adjust_instruction(&mut caller);
    Ok(Some(caller))
}

fn get_caller_frame<M: MemoryRegion>(
    args: &UnwindArgs<'_, M>,
) -> Result<Option<StackFrame>, SupplierInterrupted> {
    let Some(context) = &args.callee.context else {
        return Ok(None);
    };
    match &context.raw {
        RawContext::X86(ctx) => unwind_with(ctx, args),
        RawContext::Amd64(ctx) => unwind_with(ctx, args),
        RawContext::Arm(ctx) => unwind_with(ctx, args),
        RawContext::Arm64(ctx) => unwind_with(ctx, args),
        RawContext::Mips(ctx) => unwind_with(ctx, args),
        RawContext::Ppc64(ctx) => unwind_with(ctx, args),
        RawContext::Riscv64(ctx) => unwind_with(ctx, args),
    }
}

/// Unwind one thread.
///
/// Begins with the context frame and keeps recovering callers until a
/// terminal condition, symbolizing every frame and expanding its
/// inlined calls into `trust = Inline` frames placed before it.
pub fn walk_stack<M: MemoryRegion>(
    thread_id: u32,
    context: Option<&Context>,
    stack_memory: Option<&M>,
    modules: &ModuleList,
    symbolizer: &Symbolizer,
    options: &WalkOptions,
) -> Result<CallStack, SupplierInterrupted> {
    let Some(context) = context else {
        return Ok(CallStack::with_info(thread_id, CallStackInfo::MissingContext));
    };
    let info = if stack_memory.is_some() {
        CallStackInfo::Ok
    } else {
        CallStackInfo::MissingMemory
    };
    let mut stack = CallStack::with_info(thread_id, info);

    let mut frame = StackFrame::from_context(context.clone(), FrameTrust::Context);
    let mut last_physical: Option<usize> = None;
    loop {
        fill_frame_info(&mut frame, modules, symbolizer)?;

        // Inline frames sit above their physical frame, innermost first.
        let inlines = std::mem::take(&mut frame.inlines);
        for inline in inlines {
            stack.frames.push(make_inline_frame(&frame, inline));
        }
        stack.frames.push(frame);
        let callee_idx = stack.frames.len() - 1;

        if stack.frames.len() >= options.frame_limit {
            trace!("frame limit reached, ending walk");
            break;
        }
        let Some(stack_memory) = stack_memory else {
            break;
        };

        let args = UnwindArgs {
            callee: &stack.frames[callee_idx],
            grand_callee: last_physical.map(|i| &stack.frames[i]),
            stack_memory,
            modules,
            symbolizer,
            options,
        };
        match get_caller_frame(&args)? {
            Some(caller) => {
                last_physical = Some(callee_idx);
                frame = caller;
            }
            None => break,
        }
    }
    Ok(stack)
}
