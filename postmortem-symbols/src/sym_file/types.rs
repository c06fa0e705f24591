use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use range_map::{Range, RangeMap};

use crate::maps::ContainedRangeMap;

/// A publicly visible linker symbol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublicSymbol {
    /// The symbol's address relative to the module's load address.
    pub address: u64,
    /// The size of parameters passed to the function.
    pub parameter_size: u32,
    /// The name of the symbol.
    pub name: String,
    /// Whether this address was emitted for more than one source symbol.
    pub is_multiple: bool,
}

impl Ord for PublicSymbol {
    fn cmp(&self, other: &PublicSymbol) -> Ordering {
        let o = self.address.cmp(&other.address);
        if o != Ordering::Equal {
            o
        } else {
            // Fall back to sorting by name if addresses are equal.
            let nameo = self.name.cmp(&other.name);
            if nameo != Ordering::Equal {
                nameo
            } else {
                // Compare parameter size just for sanity.
                self.parameter_size.cmp(&other.parameter_size)
            }
        }
    }
}

impl PartialOrd for PublicSymbol {
    fn partial_cmp(&self, other: &PublicSymbol) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A mapping from machine code bytes to source line and file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLine {
    /// The start address relative to the module's load address.
    pub address: u64,
    /// The size of this range of instructions in bytes.
    pub size: u32,
    /// Index into `SymbolFile::files` of the file that generated this code.
    pub file: u32,
    /// The line number in `file` that generated this machine code.
    pub line: u32,
}

/// One expansion of an inlined function, minus its address ranges, which
/// live in the enclosing function's containment map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inline {
    /// Nesting depth; nested inlines have strictly greater depth.
    pub depth: u32,
    /// The line of the call that this expansion replaced.
    pub call_site_line: u32,
    /// The file of that call, as an index into `SymbolFile::files`.
    pub call_site_file: Option<u32>,
    /// Index into `SymbolFile::inline_origins`.
    pub origin_id: u32,
}

/// A source-language function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    /// The function's start address relative to the module's load address.
    pub address: u64,
    /// The size of the function in bytes.
    pub size: u32,
    /// The size of parameters passed to the function.
    pub parameter_size: u32,
    /// The name of the function as declared in the source.
    pub name: String,
    /// Whether this address was emitted for more than one source symbol.
    pub is_multiple: bool,
    /// Source line information for this function.
    pub lines: RangeMap<u64, SourceLine>,
    /// Inlined-call expansions contained in this function.
    pub inlines: ContainedRangeMap<Inline>,
}

impl Function {
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.address,
            self.address.checked_add(self.size as u64 - 1)?,
        ))
    }
}

/// DWARF CFI rules for recovering registers at a specific address.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct CfiRules {
    /// The address in question.
    pub address: u64,
    /// Postfix expressions to evaluate to recover register values.
    pub rules: String,
}

/// A fully merged register-recovery rule set for one address, the result
/// of applying every applicable delta to an initial rule set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CfiFrameRules {
    /// The expression computing the canonical frame address.
    pub cfa_rule: String,
    /// The expression computing the return address.
    pub ra_rule: String,
    /// Expressions for general-purpose registers, in rule order.
    pub register_rules: Vec<(String, String)>,
}

/// Whether a frame allocates a base pointer or carries a program string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WinStackThing {
    ProgramString(String),
    AllocatesBasePointer(bool),
}

/// The frame-layout flavor of a `STACK WIN` record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WinStackInfoType {
    /// Old-style FPO data with a fixed frame layout.
    Fpo,
    /// New-style frame data carrying a program string.
    FrameData,
}

/// How a `STACK WIN` record was typed in the symbol file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WinFrameType {
    Fpo(StackInfoWin),
    FrameData(StackInfoWin),
    /// Some other type of frame; parsed and discarded.
    Unhandled,
}

/// Information used for unwinding stack frames with Windows frame info.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackInfoWin {
    /// The address in question.
    pub address: u64,
    /// The size of the address range covered.
    pub size: u32,
    /// The size of the function's prologue.
    pub prologue_size: u32,
    /// The size of the function's epilogue.
    pub epilogue_size: u32,
    /// The size of arguments passed to this function.
    pub parameter_size: u32,
    /// The number of bytes in the stack frame for callee-saves registers.
    pub saved_register_size: u32,
    /// The number of bytes in the stack frame for local variables.
    pub local_size: u32,
    /// The maximum number of bytes pushed onto the stack by this frame.
    pub max_stack_size: u32,
    /// A program string or a flag about the base pointer.
    pub program_string_or_base_pointer: WinStackThing,
}

impl StackInfoWin {
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.address,
            self.address.checked_add(self.size as u64 - 1)?,
        ))
    }
}

/// The answer to a Windows frame-info query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WindowsFrameInfo {
    /// A full record from a `STACK WIN` entry.
    Frame(WinStackInfoType, StackInfoWin),
    /// Only the parameter size is known; it came from a `FUNC` or
    /// `PUBLIC` record rather than frame data.
    ParameterSize(u32),
}

/// A parsed symbol file: the "built" resolver variant's map set.
#[derive(Clone, Debug)]
pub struct SymbolFile {
    /// The set of source files involved in compilation.
    pub files: HashMap<u32, String>,
    /// Names of inlined functions, shared across every expansion site.
    pub inline_origins: HashMap<u32, String>,
    /// Publicly visible symbols, sorted by address.
    pub publics: Vec<PublicSymbol>,
    /// Functions.
    pub functions: RangeMap<u64, Function>,
    /// DWARF CFI initial rule sets, one per covered region.
    pub cfi_initial_rules: RangeMap<u64, CfiRules>,
    /// DWARF CFI delta rules, applied in address order within a region.
    pub cfi_delta_rules: BTreeMap<u64, String>,
    /// Windows unwind information (frame data).
    pub win_stack_framedata_info: RangeMap<u64, StackInfoWin>,
    /// Windows unwind information (FPO data).
    pub win_stack_fpo_info: RangeMap<u64, StackInfoWin>,
    /// Whether any record was malformed, duplicated, or dropped.
    pub is_corrupt: bool,
}

impl Default for SymbolFile {
    fn default() -> SymbolFile {
        SymbolFile {
            files: HashMap::new(),
            inline_origins: HashMap::new(),
            publics: vec![],
            functions: RangeMap::new(),
            cfi_initial_rules: RangeMap::new(),
            cfi_delta_rules: BTreeMap::new(),
            win_stack_framedata_info: RangeMap::new(),
            win_stack_fpo_info: RangeMap::new(),
            is_corrupt: false,
        }
    }
}
