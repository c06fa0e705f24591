//! The per-architecture unwinding interface.

use postmortem_symbols::{SupplierInterrupted, Symbolizer};

use crate::context::CpuContext;
use crate::dump::ModuleList;
use crate::memory::MemoryRegion;
use crate::process_state::StackFrame;
use crate::stackwalker::WalkOptions;

/// Everything a recovery technique may consult while computing a caller
/// frame.
pub struct UnwindArgs<'a, M> {
    /// The frame being unwound from. Its `context` is always present.
    pub callee: &'a StackFrame,
    /// The callee's callee, when one exists; Windows frame-data
    /// arithmetic needs its parameter size.
    pub grand_callee: Option<&'a StackFrame>,
    pub stack_memory: &'a M,
    pub modules: &'a ModuleList,
    pub symbolizer: &'a Symbolizer,
    pub options: &'a WalkOptions,
}

impl<M> UnwindArgs<'_, M> {
    pub fn grand_callee_parameter_size(&self) -> u32 {
        self.grand_callee
            .and_then(|frame| frame.parameter_size)
            .unwrap_or(0)
    }
}

/// One architecture's caller-recovery techniques, composed by the
/// single walker driver in recovery order: frame info (CFI and Windows
/// frame data), frame pointer, then bounded scanning.
pub trait CallerUnwinder: CpuContext {
    /// Recover the caller through CFI rules or Windows frame data in
    /// the module's symbols.
    fn try_cfi<M: MemoryRegion>(
        &self,
        args: &UnwindArgs<'_, M>,
    ) -> Result<Option<StackFrame>, SupplierInterrupted>;

    /// Recover the caller by following the frame-pointer chain.
    fn try_frame_pointer<M: MemoryRegion>(&self, args: &UnwindArgs<'_, M>)
        -> Option<StackFrame>;

    /// Recover the caller by scanning the stack for a plausible return
    /// address. The prologue pass accepts only words whose call site
    /// symbolizes to a named function; the plain pass accepts any word
    /// inside a known module.
    fn try_scan<M: MemoryRegion>(
        &self,
        args: &UnwindArgs<'_, M>,
        prologue_only: bool,
    ) -> Result<Option<StackFrame>, SupplierInterrupted>;

    /// Whether a recovered caller means the walk is over (nullish
    /// instruction pointer, or a stack pointer that failed to make
    /// progress).
    fn caller_is_terminal(&self, callee: &StackFrame, caller: &StackFrame) -> bool;

    /// Move the frame's lookup address from the return address back
    /// into the call instruction.
    fn adjust_instruction(&self, frame: &mut StackFrame);
}
