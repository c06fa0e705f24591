//! A processor for post-mortem crash dumps: given thread contexts,
//! loaded modules, and captured stack memory, it reconstructs an
//! annotated call stack for every thread, resolving frames through
//! symbol files supplied by a [`Symbolizer`].
//!
//! The main entry point is [`process_dump`], which consumes anything
//! implementing [`DumpAccess`] and produces a [`ProcessState`].
//!
//! Processing one dump is strictly single-threaded and synchronous;
//! concurrency across dumps is the caller's business, with each dump
//! using its own [`Symbolizer`] over a shared
//! [`SymbolSupplier`](postmortem_symbols::SymbolSupplier).

pub mod context;
pub mod dump;
pub mod exception;
pub mod memory;
pub mod process_state;
pub mod processor;
pub mod stackwalker;

pub use postmortem_common::{Cpu, Module, Os, SystemInfo};
pub use postmortem_symbols::{
    NoSymbolSupplier, SimpleSymbolSupplier, StringSymbolSupplier, SupplierInterrupted,
    SymbolSupplier, Symbolizer,
};

pub use context::{Context, ContextValidity, CpuContext, RawContext};
pub use dump::{
    AssertionInfo, DumpAccess, DumpHeader, DumpModule, DumpThread, ExceptionInfo, MiscInfo,
    ModuleList, StreamAccess, UnloadedModule, UnloadedModuleList,
};
pub use memory::{MemoryBlock, MemoryRegion};
pub use process_state::{
    CallStack, CallStackInfo, Exploitability, FrameTrust, ProcessState, StackFrame,
};
pub use processor::{process_dump, process_dump_with_options, ProcessError, ProcessorOptions};
pub use stackwalker::{walk_address_list, walk_stack, CallerUnwinder, WalkOptions};
