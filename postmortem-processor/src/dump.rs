//! The dump-reader interface the processor consumes, and the value
//! types that cross it.
//!
//! Parsing the binary dump container is someone else's job; the
//! processor only requires these accessors of a fully constructed
//! reader. Test doubles implement [`DumpAccess`] directly.

use std::borrow::Cow;

use debugid::{CodeId, DebugId};

use postmortem_common::{range_contains, Module, SystemInfo};

use crate::context::Context;
use crate::memory::MemoryBlock;

/// The dump's top-level header.
#[derive(Clone, Debug, Default)]
pub struct DumpHeader {
    /// When the dump was written, in seconds since the epoch.
    pub time_date_stamp: u32,
}

/// Miscellaneous process information.
#[derive(Clone, Debug, Default)]
pub struct MiscInfo {
    /// When the process started, in seconds since the epoch.
    pub process_create_time: Option<u32>,
}

/// The exception that produced the dump, when it was produced by one.
#[derive(Clone, Debug, Default)]
pub struct ExceptionInfo {
    /// The OS exception code.
    pub code: u32,
    /// OS exception flags.
    pub flags: u32,
    /// OS-specific exception parameters (e.g. the access-violation
    /// read/write discriminator and faulting address on Windows).
    pub exception_information: Vec<u64>,
    /// The faulting instruction address as recorded by the OS.
    pub address: u64,
    /// The thread that raised the exception.
    pub thread_id: u32,
    /// The register state at the point of the exception. Preferred over
    /// the raising thread's own context, which usually captures the
    /// dump-writing machinery instead.
    pub context: Option<Context>,
}

/// A failed assertion that produced the dump.
#[derive(Clone, Debug, Default)]
pub struct AssertionInfo {
    pub expression: String,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: u32,
}

/// One thread captured in the dump.
#[derive(Clone, Debug)]
pub struct DumpThread {
    pub thread_id: u32,
    /// The thread's register state; absent when the dump is damaged.
    pub context: Option<Context>,
    /// The thread's captured stack, when it was stored inline.
    pub stack: Option<MemoryBlock>,
    /// The base address of the thread's stack, for looking the memory
    /// up in the dump's memory list instead.
    pub stack_base: u64,
}

/// A module that was loaded in the crashed process.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DumpModule {
    pub base: u64,
    pub size: u64,
    pub code_file: String,
    pub code_id: Option<CodeId>,
    pub debug_file: Option<String>,
    pub debug_id: Option<DebugId>,
    pub version: Option<String>,
}

impl DumpModule {
    pub fn new(base: u64, size: u64, code_file: &str) -> DumpModule {
        DumpModule {
            base,
            size,
            code_file: code_file.to_string(),
            ..DumpModule::default()
        }
    }
}

impl Module for DumpModule {
    fn base_address(&self) -> u64 {
        self.base
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn code_file(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.code_file)
    }
    fn code_identifier(&self) -> Option<CodeId> {
        self.code_id.clone()
    }
    fn debug_file(&self) -> Option<Cow<'_, str>> {
        self.debug_file.as_deref().map(Cow::Borrowed)
    }
    fn debug_identifier(&self) -> Option<DebugId> {
        self.debug_id
    }
    fn version(&self) -> Option<Cow<'_, str>> {
        self.version.as_deref().map(Cow::Borrowed)
    }
}

/// The loaded modules of the crashed process, ordered by address.
/// Modules in the active set never overlap.
#[derive(Clone, Debug, Default)]
pub struct ModuleList {
    modules: Vec<DumpModule>,
}

impl ModuleList {
    pub fn new(mut modules: Vec<DumpModule>) -> ModuleList {
        modules.sort_by_key(|m| m.base);
        ModuleList { modules }
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DumpModule> {
        self.modules.iter()
    }

    /// The module whose range covers `addr`.
    pub fn module_at_address(&self, addr: u64) -> Option<&DumpModule> {
        let idx = self.modules.partition_point(|m| m.base <= addr);
        let module = self.modules.get(idx.checked_sub(1)?)?;
        range_contains(module.base, module.size, addr).then_some(module)
    }

    /// The module mapped lowest, by convention the main executable.
    pub fn main_module(&self) -> Option<&DumpModule> {
        self.modules.first()
    }
}

/// A module that had been unloaded before the dump was written. Ranges
/// may overlap each other and the loaded set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnloadedModule {
    pub base: u64,
    pub size: u64,
    pub code_file: String,
}

/// Previously loaded modules, used to attribute otherwise unmapped
/// instruction addresses.
#[derive(Clone, Debug, Default)]
pub struct UnloadedModuleList {
    pub modules: Vec<UnloadedModule>,
}

impl UnloadedModuleList {
    pub fn new(modules: Vec<UnloadedModule>) -> UnloadedModuleList {
        UnloadedModuleList { modules }
    }

    /// Every unloaded module whose range covers `addr`.
    pub fn modules_at_address(&self, addr: u64) -> impl Iterator<Item = &UnloadedModule> {
        self.modules
            .iter()
            .filter(move |m| range_contains(m.base, m.size, addr))
    }
}

/// Access to an optional dump stream that can also be present but
/// unreadable.
#[derive(Clone, Copy, Debug)]
pub enum StreamAccess<'a, T> {
    Found(&'a T),
    /// The stream is not in the dump at all.
    Missing,
    /// The stream is in the dump but could not be read.
    Unreadable,
}

/// The accessor surface of a dump reader.
///
/// The reader must be fully constructed (its read succeeded) before any
/// accessor is called; `read_ok` reports that state for readers that
/// can exist in a failed state.
pub trait DumpAccess {
    /// Whether the dump was actually readable.
    fn read_ok(&self) -> bool {
        true
    }
    fn header(&self) -> Option<&DumpHeader>;
    fn system_info(&self) -> Option<&SystemInfo>;
    fn threads(&self) -> Option<&[DumpThread]>;
    fn modules(&self) -> &ModuleList;
    fn unloaded_modules(&self) -> &UnloadedModuleList;
    /// The dump's standalone memory regions. Required; an empty slice
    /// is fine, a missing stream is not.
    fn memory_list(&self) -> Option<&[MemoryBlock]>;
    fn misc_info(&self) -> Option<&MiscInfo> {
        None
    }
    fn exception(&self) -> StreamAccess<'_, ExceptionInfo> {
        StreamAccess::Missing
    }
    fn assertion(&self) -> StreamAccess<'_, AssertionInfo> {
        StreamAccess::Missing
    }
}
