use std::borrow::Cow;

use debugid::{CodeId, DebugId};

/// An executable or shared library loaded into the process whose dump is
/// being examined.
///
/// Implemented by the dump reader's module records and by test helpers.
/// A module is identified by its `(debug_file, debug_identifier)` pair;
/// two distinct modules never overlap in the active address space.
pub trait Module {
    /// The base address at which the module was mapped.
    fn base_address(&self) -> u64;
    /// The size of the module's mapping in bytes.
    fn size(&self) -> u64;
    /// The path to the executable or library on the crashed system.
    fn code_file(&self) -> Cow<'_, str>;
    /// An identifier for the executable itself, if one is known.
    fn code_identifier(&self) -> Option<CodeId>;
    /// The path to the debug information file, if known.
    ///
    /// On Windows this is a `.pdb` path; elsewhere it is usually the
    /// code file again.
    fn debug_file(&self) -> Option<Cow<'_, str>>;
    /// The identifier of the debug information file.
    fn debug_identifier(&self) -> Option<DebugId>;
    /// A version string, if known.
    fn version(&self) -> Option<Cow<'_, str>> {
        None
    }
}

/// Does `[base, base + size)` contain `addr`?
///
/// Written so that a `base + size` that wraps around the address space
/// still yields the mathematically correct answer.
pub fn range_contains(base: u64, size: u64, addr: u64) -> bool {
    addr >= base && addr - base < size
}
