//! The result of processing a dump: annotated stacks for every thread
//! plus the crash metadata.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::io::prelude::*;

use postmortem_common::{Module, SystemInfo};
use postmortem_symbols::FrameSymbolizer;

use crate::context::Context;
use crate::dump::{DumpModule, ModuleList, UnloadedModuleList};

/// How much the stack walker trusts the instruction pointer of a frame.
///
/// Ordered strongest first: a frame handed to us in a thread context is
/// certain; one found by scanning the stack is a guess. `Inline` frames
/// are synthesized from symbols rather than unwound at all.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameTrust {
    /// Given as the instruction pointer in a thread context.
    Context,
    /// Explicitly provided by an external stack walker.
    PreWalked,
    /// Derived from call frame info (CFI rules or Windows frame data).
    CallFrameInfo,
    /// Derived from the frame-pointer chain.
    FramePointer,
    /// Found by stack scanning, confirmed by a symbol at the call site.
    ScanPrologue,
    /// Found by plain stack scanning.
    Scan,
    /// An inlined call expanded from symbol data.
    Inline,
}

impl FrameTrust {
    /// A description for human-readable reports.
    pub fn description(&self) -> &'static str {
        match *self {
            FrameTrust::Context => "given as instruction pointer in context",
            FrameTrust::PreWalked => "recovered by external stack walker",
            FrameTrust::CallFrameInfo => "call frame info",
            FrameTrust::FramePointer => "previous frame's frame pointer",
            FrameTrust::ScanPrologue => "stack scanning with call-site check",
            FrameTrust::Scan => "stack scanning",
            FrameTrust::Inline => "inlined call",
        }
    }

    /// The stable machine-readable name.
    pub fn name(&self) -> &'static str {
        match *self {
            FrameTrust::Context => "context",
            FrameTrust::PreWalked => "prewalked",
            FrameTrust::CallFrameInfo => "cfi",
            FrameTrust::FramePointer => "frame_pointer",
            FrameTrust::ScanPrologue => "scan_prologue",
            FrameTrust::Scan => "scan",
            FrameTrust::Inline => "inline",
        }
    }
}

/// An inlined call attached to a physical frame during symbolication,
/// before it is expanded into a frame of its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineFrame {
    pub function_name: String,
    pub function_base: u64,
    pub source_file_name: Option<String>,
    pub source_line: Option<u32>,
}

/// A single stack frame produced by unwinding a thread's stack.
#[derive(Clone, Debug)]
pub struct StackFrame {
    /// The program counter as an absolute address. For the innermost
    /// frame this is exact; for caller frames it points within (one
    /// byte or instruction before) the call instruction, so source
    /// lookups land on the call site rather than the return site.
    pub instruction: u64,

    /// The module containing `instruction`.
    pub module: Option<DumpModule>,

    /// Unloaded modules overlapping `instruction`, as
    /// module name → set of offsets, populated only when `module` is
    /// `None`. BTrees keep report output stable.
    pub unloaded_modules: BTreeMap<String, BTreeSet<u64>>,

    /// The function name, when debug symbols cover the address.
    pub function_name: Option<String>,
    /// The absolute start address of the function.
    pub function_base: Option<u64>,
    /// Bytes of stack the function's parameters occupy. Windows
    /// frame-data unwinding consumes this from the *callee's callee*.
    pub parameter_size: Option<u32>,
    /// Whether the symbol was emitted for multiple source symbols.
    pub is_multiple: bool,

    /// The source file name, when line records cover the address.
    pub source_file_name: Option<String>,
    /// The 1-based source line number.
    pub source_line: Option<u32>,
    /// The absolute start address of the line's machine code.
    pub source_line_base: Option<u64>,

    /// How this frame's instruction pointer was established.
    pub trust: FrameTrust,

    /// Register state for this frame. `None` for frames that carry no
    /// registers (prewalked and inline frames).
    pub context: Option<Context>,

    /// Inlined calls covering `instruction`, innermost first, recorded
    /// during symbolication and expanded into frames by the walker.
    pub inlines: Vec<InlineFrame>,
}

impl StackFrame {
    /// A frame whose registers come from `context`.
    pub fn from_context(context: Context, trust: FrameTrust) -> StackFrame {
        StackFrame {
            instruction: context.get_instruction_pointer(),
            module: None,
            unloaded_modules: BTreeMap::new(),
            function_name: None,
            function_base: None,
            parameter_size: None,
            is_multiple: false,
            source_file_name: None,
            source_line: None,
            source_line_base: None,
            trust,
            context: Some(context),
            inlines: vec![],
        }
    }

    /// A register-less frame at `instruction`.
    pub fn from_instruction(instruction: u64, trust: FrameTrust) -> StackFrame {
        StackFrame {
            instruction,
            module: None,
            unloaded_modules: BTreeMap::new(),
            function_name: None,
            function_base: None,
            parameter_size: None,
            is_multiple: false,
            source_file_name: None,
            source_line: None,
            source_line_base: None,
            trust,
            context: None,
            inlines: vec![],
        }
    }

    /// The return address as saved on the stack or in a register; see
    /// the comments on [`instruction`](Self::instruction).
    pub fn return_address(&self) -> u64 {
        self.instruction
    }
}

impl FrameSymbolizer for StackFrame {
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32, is_multiple: bool) {
        self.function_name = Some(String::from(name));
        self.function_base = Some(base);
        self.parameter_size = Some(parameter_size);
        self.is_multiple = is_multiple;
    }
    fn set_source_file(&mut self, file: &str, line: u32, base: u64) {
        self.source_file_name = Some(String::from(file));
        self.source_line = Some(line);
        self.source_line_base = Some(base);
    }
    fn add_inline_frame(&mut self, name: &str, base: u64, file: Option<&str>, line: Option<u32>) {
        self.inlines.push(InlineFrame {
            function_name: String::from(name),
            function_base: base,
            source_file_name: file.map(String::from),
            source_line: line,
        });
    }
}

/// Why a thread's stack ended up the way it did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallStackInfo {
    /// Everything went fine.
    Ok,
    /// No context was available; the stack has no frames.
    MissingContext,
    /// No stack memory was available; only the context frame exists.
    MissingMemory,
    /// No walker exists for this CPU.
    UnsupportedCpu,
}

/// The unwound stack of one thread. Frame 0 is the innermost callee.
#[derive(Clone, Debug)]
pub struct CallStack {
    pub frames: Vec<StackFrame>,
    pub info: CallStackInfo,
    pub thread_id: u32,
}

impl CallStack {
    /// An empty stack with `info` recorded.
    pub fn with_info(thread_id: u32, info: CallStackInfo) -> CallStack {
        CallStack {
            frames: vec![],
            info,
            thread_id,
        }
    }

    /// Write a human-readable description of this stack to `f`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        if self.frames.is_empty() {
            writeln!(f, "<no frames>")?;
        }
        for (i, frame) in self.frames.iter().enumerate() {
            let addr = frame.instruction;
            write!(f, "{i:2}  ")?;
            if let Some(ref module) = frame.module {
                write!(f, "{}", basename(&module.code_file()))?;
                if let (Some(function), Some(function_base)) =
                    (&frame.function_name, frame.function_base)
                {
                    write!(f, "!{function}")?;
                    if let (Some(source_file), Some(source_line), Some(source_line_base)) = (
                        &frame.source_file_name,
                        frame.source_line,
                        frame.source_line_base,
                    ) {
                        write!(
                            f,
                            " [{} : {} + {:#x}]",
                            basename(source_file),
                            source_line,
                            addr.saturating_sub(source_line_base),
                        )?;
                    } else {
                        write!(f, " + {:#x}", addr.saturating_sub(function_base))?;
                    }
                } else {
                    write!(f, " + {:#x}", addr - module.base_address())?;
                }
            } else {
                write!(f, "{addr:#x}")?;
                for (name, offsets) in &frame.unloaded_modules {
                    write!(f, " (unloaded {name}@")?;
                    let mut first = true;
                    for offset in offsets {
                        if first {
                            write!(f, "{offset:#x}")?;
                        } else {
                            write!(f, "|{offset:#x}")?;
                        }
                        first = false;
                    }
                    write!(f, ")")?;
                }
            }
            writeln!(f)?;
            if let Some(ref context) = frame.context {
                print_registers(f, context)?;
            }
            writeln!(f, "    Found by: {}", frame.trust.description())?;
        }
        Ok(())
    }
}

fn basename(f: &str) -> &str {
    match f.rfind(|c| c == '/' || c == '\\') {
        None => f,
        Some(index) => &f[(index + 1)..],
    }
}

fn print_registers<T: Write>(f: &mut T, context: &Context) -> io::Result<()> {
    let mut output = String::new();
    for (reg, val) in context.valid_registers() {
        let next = format!(" {reg: >5} = {val:#018x}");
        if output.chars().count() + next.chars().count() > 80 {
            writeln!(f, " {output}")?;
            output.truncate(0);
        }
        output.push_str(&next);
    }
    if !output.is_empty() {
        writeln!(f, " {output}")?;
    }
    Ok(())
}

/// The exploitability rating of a crash. Rating crashes is out of scope
/// for this engine; the field records that nothing analyzed it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Exploitability {
    #[default]
    NotAnalyzed,
}

/// Everything recovered from one dump.
#[derive(Clone, Debug)]
pub struct ProcessState {
    /// The system the dump was written on.
    pub system_info: SystemInfo,
    /// A formatted crash reason, when the process crashed.
    pub crash_reason: Option<String>,
    /// The memory address implicated in the crash: the faulting data
    /// address for access errors, the instruction address otherwise.
    pub crash_address: Option<u64>,
    /// A hit assertion, when the dump came from one.
    pub assertion: Option<String>,
    /// When the dump was written, seconds since the epoch.
    pub time_date_stamp: u32,
    /// When the process started, seconds since the epoch.
    pub process_create_time: Option<u32>,
    /// Index into `threads` of the thread that crashed or requested the
    /// dump, when known.
    pub requesting_thread: Option<usize>,
    /// One unwound stack per thread, in dump order.
    pub threads: Vec<CallStack>,
    pub modules: ModuleList,
    pub unloaded_modules: UnloadedModuleList,
    pub exploitability: Exploitability,
}

impl ProcessState {
    /// `true` when the dump was written in response to a crash.
    pub fn crashed(&self) -> bool {
        self.crash_reason.is_some() && self.crash_address.is_some()
    }

    /// Write a human-readable report of the whole process state to `f`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        writeln!(f, "Operating system: {}", self.system_info.os.long_name())?;
        if let Some(ver) = self.system_info.format_os_version() {
            writeln!(f, "                  {ver}")?;
        }
        writeln!(f, "CPU: {}", self.system_info.cpu)?;
        if let Some(ref info) = self.system_info.cpu_info {
            writeln!(f, "     {info}")?;
        }
        writeln!(f)?;

        if let (Some(reason), Some(address)) = (&self.crash_reason, self.crash_address) {
            writeln!(f, "Crash reason:  {reason}")?;
            writeln!(f, "Crash address: {address:#x}")?;
        } else {
            writeln!(f, "No crash")?;
        }
        if let Some(ref assertion) = self.assertion {
            writeln!(f, "Assertion: {assertion}")?;
        }
        match self.process_create_time {
            Some(created) => {
                let uptime = self.time_date_stamp.saturating_sub(created);
                writeln!(f, "Process uptime: {uptime} seconds")?;
            }
            None => writeln!(f, "Process uptime: not available")?,
        }
        writeln!(f)?;

        for (i, stack) in self.threads.iter().enumerate() {
            let crashed = self.requesting_thread == Some(i);
            if crashed {
                writeln!(f, "Thread {i} (crashed)")?;
            } else {
                writeln!(f, "Thread {i}")?;
            }
            stack.print(f)?;
        }

        writeln!(f, "\nLoaded modules:")?;
        for module in self.modules.iter() {
            writeln!(
                f,
                "{:#010x} - {:#010x}  {}  {}",
                module.base,
                module.base + module.size - 1,
                basename(&module.code_file),
                module.version.as_deref().unwrap_or("???"),
            )?;
        }
        if !self.unloaded_modules.modules.is_empty() {
            writeln!(f, "\nUnloaded modules:")?;
            for module in &self.unloaded_modules.modules {
                writeln!(
                    f,
                    "{:#010x} - {:#010x}  {}",
                    module.base,
                    module.base + module.size - 1,
                    basename(&module.code_file),
                )?;
            }
        }
        Ok(())
    }
}
