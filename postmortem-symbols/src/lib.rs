//! Symbol files, address-indexed symbol maps, and register-recovery
//! evaluation for post-mortem crash processing.
//!
//! The pieces, bottom up:
//!
//! * [`maps`]: immutable address-indexed containers over byte buffers.
//! * [`sym_file`]: the text symbol-file parser, the serialized image,
//!   and [`SymbolModule`], which answers address lookups and frame-info
//!   queries for one module.
//! * [`ResolverRegistry`]: owns every loaded module (and thereby the
//!   serialized buffers), enforcing load-once per module identity.
//! * [`Symbolizer`]: ties a [`SymbolSupplier`] to a registry, with
//!   at-most-once supplier consultation per `(dump, module)`.
//!
//! The processor crate drives [`Symbolizer::fill_symbol`] for every
//! frame it produces and [`Symbolizer::walk_frame`] for CFI and Windows
//! frame-data unwinding.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use debugid::{CodeId, DebugId};
use tracing::trace;

pub use postmortem_common::{Cpu, Module, Os, SystemInfo};

pub mod maps;
pub mod sym_file;

pub use maps::MapFormatError;
pub use sym_file::{
    CfiFrameRules, ImageView, SymbolFile, SymbolModule, WinStackInfoType, WindowsFrameInfo,
};

/// Errors loading symbols for a module.
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    /// No symbol file could be found for the module.
    #[error("symbol file not found")]
    NotFound,
    /// The module carries no debug file or debug id, so there is
    /// nothing to look up.
    #[error("the debug file or id were missing")]
    MissingDebugFileOrId,
    /// The symbol data could not be read.
    #[error("couldn't read input stream")]
    LoadError(#[from] std::io::Error),
    /// The symbol text was too corrupt to recover anything at all.
    /// Individually bad records never produce this; they just mark the
    /// module corrupt.
    #[error("parse error: {0} at line {1}")]
    ParseError(&'static str, u64),
    /// A serialized image failed validation; no module was registered.
    #[error("serialized symbol image rejected")]
    ImageFormat(#[from] MapFormatError),
    /// Symbols for this module were already loaded.
    #[error("symbols for this module are already loaded")]
    AlreadyLoaded,
}

impl PartialEq for SymbolError {
    fn eq(&self, other: &SymbolError) -> bool {
        matches!(
            (self, other),
            (SymbolError::NotFound, SymbolError::NotFound)
                | (
                    SymbolError::MissingDebugFileOrId,
                    SymbolError::MissingDebugFileOrId
                )
                | (SymbolError::LoadError(_), SymbolError::LoadError(_))
                | (SymbolError::ParseError(..), SymbolError::ParseError(..))
                | (SymbolError::ImageFormat(_), SymbolError::ImageFormat(_))
                | (SymbolError::AlreadyLoaded, SymbolError::AlreadyLoaded)
        )
    }
}

/// The symbol supplier told us to stop the whole dump.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("symbol supplier interrupted processing")]
pub struct SupplierInterrupted;

/// Errors from [`Symbolizer::fill_symbol`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FillSymbolError {
    /// No symbols are available for the module.
    #[error("no symbols for module")]
    NotFound,
    /// The supplier interrupted; the caller must abandon the dump.
    #[error("symbol supplier interrupted processing")]
    Interrupted,
}

/// What a supplier query produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupplierResult<T> {
    Found(T),
    NotFound,
    /// Abandon processing entirely. The processor surfaces this as its
    /// own terminal status.
    Interrupt,
}

/// Symbol bytes handed back by a supplier, tagged with their format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SymbolData {
    /// Text symbol records, to be parsed.
    Text(Vec<u8>),
    /// A serialized symbol image, to be loaded zero-copy.
    Image(Vec<u8>),
}

/// File extension for serialized symbol images sitting next to their
/// text sources.
pub const IMAGE_EXTENSION: &str = "symi";

/// A source of symbol files for modules.
///
/// Suppliers may be shared across processors on different threads and
/// must synchronize internally.
pub trait SymbolSupplier {
    /// Locate a symbol file on disk for `module`.
    fn get_symbol_file(
        &self,
        module: &dyn Module,
        system_info: &SystemInfo,
    ) -> SupplierResult<PathBuf>;

    /// Produce the symbol bytes for `module`.
    ///
    /// The default reads whatever [`get_symbol_file`] found, treating a
    /// `.symi` file as a serialized image and anything else as text.
    ///
    /// [`get_symbol_file`]: Self::get_symbol_file
    fn get_symbol_data(
        &self,
        module: &dyn Module,
        system_info: &SystemInfo,
    ) -> SupplierResult<SymbolData> {
        match self.get_symbol_file(module, system_info) {
            SupplierResult::Found(path) => match fs::read(&path) {
                Ok(bytes) => {
                    if path
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case(IMAGE_EXTENSION))
                    {
                        SupplierResult::Found(SymbolData::Image(bytes))
                    } else {
                        SupplierResult::Found(SymbolData::Text(bytes))
                    }
                }
                Err(_) => SupplierResult::NotFound,
            },
            SupplierResult::NotFound => SupplierResult::NotFound,
            SupplierResult::Interrupt => SupplierResult::Interrupt,
        }
    }

    /// Release whatever backs a previous successful
    /// [`get_symbol_data`](Self::get_symbol_data). Called exactly once
    /// per success, when the module is evicted.
    fn free_symbol_data(&self, _module: &dyn Module) {}
}

/// Callbacks through which symbolication writes its results into a
/// frame.
pub trait FrameSymbolizer {
    /// The program counter value for this frame.
    fn get_instruction(&self) -> u64;
    /// Record the function covering the instruction.
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32, is_multiple: bool);
    /// Record the source location of the instruction.
    fn set_source_file(&mut self, file: &str, line: u32, base: u64);
    /// Record one inlined call covering the instruction. Calls arrive
    /// innermost-first, after the call-site shift has been applied.
    fn add_inline_frame(&mut self, _name: &str, _base: u64, _file: Option<&str>, _line: Option<u32>) {
    }
}

/// Callbacks through which frame-info evaluation reads callee state and
/// writes caller state.
pub trait FrameWalker {
    /// The instruction address being unwound from.
    fn get_instruction(&self) -> u64;
    /// The callee's callee's parameter size, needed by `STACK WIN`
    /// frame-size arithmetic (0 when unknown).
    fn get_grand_callee_parameter_size(&self) -> u32;
    /// Read a register-sized value from stack memory.
    fn get_register_at_address(&self, address: u64) -> Option<u64>;
    /// Read a register from the callee's frame.
    fn get_callee_register(&self, name: &str) -> Option<u64>;
    /// Set a register in the caller's frame.
    fn set_caller_register(&mut self, name: &str, val: u64) -> Option<()>;
    /// Explicitly mark one of the caller's registers as unrecoverable.
    fn clear_caller_register(&mut self, name: &str);
    /// Commit the computed CFA (e.g. as the caller's stack pointer).
    fn set_cfa(&mut self, val: u64) -> Option<()>;
    /// Commit the recovered return address (e.g. as the caller's
    /// instruction pointer).
    fn set_ra(&mut self, val: u64) -> Option<()>;
}

/// A `Module` implementation that holds arbitrary data, for callers
/// that have a debug id and filename but no dump.
#[derive(Clone, Debug, Default)]
pub struct SimpleModule {
    pub base_address: Option<u64>,
    pub size: Option<u64>,
    pub code_file: Option<String>,
    pub code_identifier: Option<CodeId>,
    pub debug_file: Option<String>,
    pub debug_id: Option<DebugId>,
    pub version: Option<String>,
}

impl SimpleModule {
    /// A module with just `debug_file` and `debug_id` set.
    pub fn new(debug_file: &str, debug_id: DebugId) -> SimpleModule {
        SimpleModule {
            debug_file: Some(String::from(debug_file)),
            debug_id: Some(debug_id),
            ..SimpleModule::default()
        }
    }
}

impl Module for SimpleModule {
    fn base_address(&self) -> u64 {
        self.base_address.unwrap_or(0)
    }
    fn size(&self) -> u64 {
        self.size.unwrap_or(0)
    }
    fn code_file(&self) -> Cow<'_, str> {
        self.code_file
            .as_ref()
            .map_or(Cow::from(""), |s| Cow::Borrowed(&s[..]))
    }
    fn code_identifier(&self) -> Option<CodeId> {
        self.code_identifier.clone()
    }
    fn debug_file(&self) -> Option<Cow<'_, str>> {
        self.debug_file.as_ref().map(|s| Cow::Borrowed(&s[..]))
    }
    fn debug_identifier(&self) -> Option<DebugId> {
        self.debug_id
    }
    fn version(&self) -> Option<Cow<'_, str>> {
        self.version.as_ref().map(|s| Cow::Borrowed(&s[..]))
    }
}

/// One resolved inline frame recorded by [`SimpleFrame`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimpleInlineFrame {
    pub name: String,
    pub base: u64,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// A [`FrameSymbolizer`] that just holds the data it is given.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimpleFrame {
    /// The program counter value for this frame.
    pub instruction: u64,
    /// The name of the function containing the instruction.
    pub function: Option<String>,
    /// The absolute address where `function` starts.
    pub function_base: Option<u64>,
    /// The size the function's parameters take up on the stack.
    pub parameter_size: Option<u32>,
    /// Whether the address was emitted for more than one symbol.
    pub is_multiple: bool,
    /// The source file containing the instruction.
    pub source_file: Option<String>,
    /// The 1-based line number the instruction came from.
    pub source_line: Option<u32>,
    /// The absolute address where `source_line` starts.
    pub source_line_base: Option<u64>,
    /// Inlined calls covering the instruction, innermost first.
    pub inlines: Vec<SimpleInlineFrame>,
}

impl SimpleFrame {
    /// A `SimpleFrame` with instruction pointer `instruction`.
    pub fn with_instruction(instruction: u64) -> SimpleFrame {
        SimpleFrame {
            instruction,
            ..SimpleFrame::default()
        }
    }
}

impl FrameSymbolizer for SimpleFrame {
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32, is_multiple: bool) {
        self.function = Some(String::from(name));
        self.function_base = Some(base);
        self.parameter_size = Some(parameter_size);
        self.is_multiple = is_multiple;
    }
    fn set_source_file(&mut self, file: &str, line: u32, base: u64) {
        self.source_file = Some(String::from(file));
        self.source_line = Some(line);
        self.source_line_base = Some(base);
    }
    fn add_inline_frame(&mut self, name: &str, base: u64, file: Option<&str>, line: Option<u32>) {
        self.inlines.push(SimpleInlineFrame {
            name: String::from(name),
            base,
            file: file.map(String::from),
            line,
        });
    }
}

// `Module` can't be hashed as a trait object, so identity is captured
// into a plain tuple key.
type ModuleKey = (String, Option<String>, Option<String>, Option<String>);

fn module_key(module: &dyn Module) -> ModuleKey {
    (
        module.code_file().to_string(),
        module.code_identifier().map(|id| id.to_string()),
        module.debug_file().map(|s| s.to_string()),
        module.debug_identifier().map(|id| id.to_string()),
    )
}

/// Like `PathBuf::file_name`, but works on Windows or POSIX paths.
pub fn leafname(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// If `filename` ends with `match_extension`, replace it with
/// `new_extension`; otherwise append.
fn replace_or_add_extension(filename: &str, match_extension: &str, new_extension: &str) -> String {
    let mut bits = filename.split('.').collect::<Vec<_>>();
    if bits.len() > 1
        && bits
            .last()
            .is_some_and(|e| e.to_lowercase() == match_extension)
    {
        bits.pop();
    }
    bits.push(new_extension);
    bits.join(".")
}

/// The canonical symbol-store layout:
/// `<debug file>/<debug id>/<debug file with .sym extension>`.
pub fn symbol_store_lookup(module: &dyn Module) -> Option<String> {
    let debug_file = module.debug_file()?;
    let debug_id = module.debug_identifier()?;
    let leaf = leafname(&debug_file);
    let filename = replace_or_add_extension(leaf, "pdb", "sym");
    Some([leaf, &debug_id.breakpad().to_string(), &filename[..]].join("/"))
}

/// Holds the loaded symbols of every known module and the byte buffers
/// behind them, enforcing load-once per module identity.
#[derive(Default)]
pub struct ResolverRegistry {
    modules: HashMap<ModuleKey, SymbolModule>,
}

impl ResolverRegistry {
    pub fn new() -> ResolverRegistry {
        ResolverRegistry::default()
    }

    pub fn has_module(&self, module: &dyn Module) -> bool {
        self.modules.contains_key(&module_key(module))
    }

    /// Parse text symbols and register them for `module`.
    pub fn load_text(&mut self, module: &dyn Module, bytes: &[u8]) -> Result<(), SymbolError> {
        let symbols = SymbolFile::from_bytes(bytes)?;
        self.insert(module, SymbolModule::Built(symbols))
    }

    /// Validate a serialized image and register it for `module`. On
    /// failure no partial module is registered.
    pub fn load_image(&mut self, module: &dyn Module, buffer: Vec<u8>) -> Result<(), SymbolError> {
        let view = ImageView::new(buffer)?;
        self.insert(module, SymbolModule::Loaded(view))
    }

    fn insert(&mut self, module: &dyn Module, symbols: SymbolModule) -> Result<(), SymbolError> {
        let key = module_key(module);
        if self.modules.contains_key(&key) {
            return Err(SymbolError::AlreadyLoaded);
        }
        self.modules.insert(key, symbols);
        Ok(())
    }

    /// Drop a module's symbols, releasing the backing buffer.
    pub fn unload(&mut self, module: &dyn Module) -> bool {
        self.modules.remove(&module_key(module)).is_some()
    }

    pub fn symbols(&self, module: &dyn Module) -> Option<&SymbolModule> {
        self.modules.get(&module_key(module))
    }

    fn clear(&mut self) {
        self.modules.clear();
    }
}

#[derive(Default)]
struct SymbolizerState {
    registry: ResolverRegistry,
    /// Modules the supplier has been asked about this dump, loaded or
    /// not. Guarantees at-most-once consultation per `(dump, module)`.
    asked: HashSet<ModuleKey>,
    /// Identity snapshots of supplier-backed modules, for
    /// `free_symbol_data` at eviction.
    supplied: Vec<SimpleModule>,
    system_info: Option<SystemInfo>,
}

/// Symbolicates stack frames, loading symbols through a
/// [`SymbolSupplier`] at most once per module per dump.
pub struct Symbolizer {
    supplier: Box<dyn SymbolSupplier + Send + Sync>,
    state: Mutex<SymbolizerState>,
}

impl Symbolizer {
    /// Create a `Symbolizer` that uses `supplier` to locate symbols.
    pub fn new<T: SymbolSupplier + Send + Sync + 'static>(supplier: T) -> Symbolizer {
        Symbolizer {
            supplier: Box::new(supplier),
            state: Mutex::new(SymbolizerState::default()),
        }
    }

    /// Start processing a new dump: evict every loaded module (calling
    /// [`SymbolSupplier::free_symbol_data`] once per supplied module)
    /// and forget which modules have been asked about, so the supplier
    /// is consulted afresh. The system info accompanies every supplier
    /// request for this dump.
    pub fn begin_dump(&self, system_info: &SystemInfo) {
        let mut state = self.state.lock().unwrap();
        for module in state.supplied.drain(..).collect::<Vec<_>>() {
            self.supplier.free_symbol_data(&module);
        }
        state.registry.clear();
        state.asked.clear();
        state.system_info = Some(system_info.clone());
    }

    /// Run `query` against the module's symbols, consulting the
    /// supplier first if this is the module's first appearance.
    fn with_symbols<R>(
        &self,
        module: &dyn Module,
        query: impl FnOnce(&SymbolModule) -> R,
    ) -> Result<Option<R>, SupplierInterrupted> {
        let mut state = self.state.lock().unwrap();
        let key = module_key(module);
        if !state.asked.contains(&key) {
            state.asked.insert(key.clone());
            trace!("locating symbols for module {}", module.code_file());
            let system_info = state.system_info.clone().unwrap_or_else(|| SystemInfo {
                os: Os::Unknown(0),
                os_version: None,
                os_build: None,
                cpu: Cpu::Unknown(0),
                cpu_info: None,
                cpu_count: 0,
            });
            match self.supplier.get_symbol_data(module, &system_info) {
                SupplierResult::Found(data) => {
                    let loaded = match data {
                        SymbolData::Text(bytes) => state.registry.load_text(module, &bytes),
                        SymbolData::Image(buffer) => state.registry.load_image(module, buffer),
                    };
                    match loaded {
                        Ok(()) => {
                            state.supplied.push(snapshot(module));
                        }
                        Err(e) => {
                            trace!("failed to load symbols: {}", e);
                            // The data was supplied even though we could
                            // not use it; it still must be freed.
                            self.supplier.free_symbol_data(module);
                        }
                    }
                }
                SupplierResult::NotFound => {
                    trace!("no symbols for module {}", module.code_file());
                }
                SupplierResult::Interrupt => {
                    trace!("supplier interrupted");
                    return Err(SupplierInterrupted);
                }
            }
        }
        Ok(state.registry.symbols(module).map(query))
    }

    /// Fill symbol information in `frame` for an instruction inside
    /// `module`.
    pub fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
    ) -> Result<(), FillSymbolError> {
        self.with_symbols(module, |symbols| symbols.fill_symbol(module, frame))
            .map_err(|SupplierInterrupted| FillSymbolError::Interrupted)?
            .ok_or(FillSymbolError::NotFound)
    }

    /// Try to recover the caller frame through the module's frame info.
    /// `Ok(None)` means no applicable info; the walker falls through to
    /// its next recovery technique.
    pub fn walk_frame(
        &self,
        module: &dyn Module,
        walker: &mut dyn FrameWalker,
    ) -> Result<Option<()>, SupplierInterrupted> {
        Ok(self
            .with_symbols(module, |symbols| symbols.walk_frame(module, walker))?
            .flatten())
    }

    /// The Windows frame-layout record covering `instruction`.
    pub fn find_windows_frame_info(
        &self,
        module: &dyn Module,
        instruction: u64,
    ) -> Result<Option<WindowsFrameInfo>, SupplierInterrupted> {
        Ok(self
            .with_symbols(module, |symbols| {
                symbols.find_windows_frame_info(module, instruction)
            })?
            .flatten())
    }

    /// Whether the module's symbols parsed with corruption.
    pub fn module_is_corrupt(&self, module: &dyn Module) -> bool {
        let state = self.state.lock().unwrap();
        state
            .registry
            .symbols(module)
            .is_some_and(|symbols| symbols.is_corrupt())
    }

    /// Convenience lookup: the name of the symbol covering `address`
    /// (module-relative) in the module identified by `debug_file` and
    /// `debug_id`.
    pub fn get_symbol_at_address(
        &self,
        debug_file: &str,
        debug_id: DebugId,
        address: u64,
    ) -> Option<String> {
        let module = SimpleModule::new(debug_file, debug_id);
        let mut frame = SimpleFrame::with_instruction(address);
        self.fill_symbol(&module, &mut frame).ok()?;
        frame.function
    }
}

fn snapshot(module: &dyn Module) -> SimpleModule {
    SimpleModule {
        base_address: Some(module.base_address()),
        size: Some(module.size()),
        code_file: Some(module.code_file().into_owned()),
        code_identifier: module.code_identifier(),
        debug_file: module.debug_file().map(Cow::into_owned),
        debug_id: module.debug_identifier(),
        version: module.version().map(Cow::into_owned),
    }
}

/// A supplier that searches local disk paths laid out like a symbol
/// store. A serialized `.symi` sibling is preferred over the text file
/// when both exist.
pub struct SimpleSymbolSupplier {
    paths: Vec<PathBuf>,
}

impl SimpleSymbolSupplier {
    pub fn new(paths: Vec<PathBuf>) -> SimpleSymbolSupplier {
        SimpleSymbolSupplier { paths }
    }
}

impl SymbolSupplier for SimpleSymbolSupplier {
    fn get_symbol_file(
        &self,
        module: &dyn Module,
        _system_info: &SystemInfo,
    ) -> SupplierResult<PathBuf> {
        let Some(rel_path) = symbol_store_lookup(module) else {
            return SupplierResult::NotFound;
        };
        for path in &self.paths {
            let text_path = path.join(&rel_path);
            let image_path = text_path.with_extension(IMAGE_EXTENSION);
            for candidate in [image_path, text_path] {
                if fs::metadata(&candidate).map(|m| m.is_file()).unwrap_or(false) {
                    trace!("found symbol file {}", candidate.display());
                    return SupplierResult::Found(candidate);
                }
            }
        }
        SupplierResult::NotFound
    }
}

/// A supplier that maps module code files to in-memory symbol text.
/// Intended for tests.
#[derive(Clone, Debug, Default)]
pub struct StringSymbolSupplier {
    modules: HashMap<String, String>,
}

impl StringSymbolSupplier {
    pub fn new(modules: HashMap<String, String>) -> StringSymbolSupplier {
        StringSymbolSupplier { modules }
    }
}

impl SymbolSupplier for StringSymbolSupplier {
    fn get_symbol_file(
        &self,
        _module: &dyn Module,
        _system_info: &SystemInfo,
    ) -> SupplierResult<PathBuf> {
        SupplierResult::NotFound
    }

    fn get_symbol_data(
        &self,
        module: &dyn Module,
        _system_info: &SystemInfo,
    ) -> SupplierResult<SymbolData> {
        match self.modules.get(&*module.code_file()) {
            Some(text) => SupplierResult::Found(SymbolData::Text(text.clone().into_bytes())),
            None => SupplierResult::NotFound,
        }
    }
}

/// A supplier that never finds anything.
pub struct NoSymbolSupplier;

impl SymbolSupplier for NoSymbolSupplier {
    fn get_symbol_file(
        &self,
        _module: &dyn Module,
        _system_info: &SystemInfo,
    ) -> SupplierResult<PathBuf> {
        SupplierResult::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_system_info() -> SystemInfo {
        SystemInfo {
            os: Os::Linux,
            os_version: None,
            os_build: None,
            cpu: Cpu::X86,
            cpu_info: None,
            cpu_count: 1,
        }
    }

    #[test]
    fn test_leafname() {
        assert_eq!(leafname("c:\\foo\\bar\\test.pdb"), "test.pdb");
        assert_eq!(leafname("c:/foo/bar/test.pdb"), "test.pdb");
        assert_eq!(leafname("test.pdb"), "test.pdb");
        assert_eq!(leafname("/path/to/test"), "test");
    }

    #[test]
    fn test_symbol_store_lookup() {
        let id = DebugId::from_str("abcd1234-abcd-1234-abcd-abcd12345678-a").unwrap();
        let m = SimpleModule::new("foo.pdb", id);
        assert_eq!(
            symbol_store_lookup(&m).unwrap(),
            "foo.pdb/ABCD1234ABCD1234ABCDABCD12345678a/foo.sym"
        );
        let m = SimpleModule::new("/path/to/foo.bin", id);
        assert_eq!(
            symbol_store_lookup(&m).unwrap(),
            "foo.bin/ABCD1234ABCD1234ABCDABCD12345678a/foo.bin.sym"
        );
        assert!(symbol_store_lookup(&SimpleModule::default()).is_none());
    }

    #[derive(Default)]
    struct CountingSupplier {
        data_calls: AtomicUsize,
        free_calls: AtomicUsize,
        interrupt: bool,
    }

    impl SymbolSupplier for Arc<CountingSupplier> {
        fn get_symbol_file(
            &self,
            _module: &dyn Module,
            _system_info: &SystemInfo,
        ) -> SupplierResult<PathBuf> {
            SupplierResult::NotFound
        }
        fn get_symbol_data(
            &self,
            module: &dyn Module,
            _system_info: &SystemInfo,
        ) -> SupplierResult<SymbolData> {
            self.data_calls.fetch_add(1, Ordering::SeqCst);
            if self.interrupt {
                return SupplierResult::Interrupt;
            }
            if &*module.code_file() == "has_syms.bin" {
                SupplierResult::Found(SymbolData::Text(
                    b"MODULE Linux x86 ffff0000 has_syms\nFILE 0 a.c\nFUNC 1000 30 0 a func\n1000 30 7 0\n"
                        .to_vec(),
                ))
            } else {
                SupplierResult::NotFound
            }
        }
        fn free_symbol_data(&self, _module: &dyn Module) {
            self.free_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn module_named(name: &str) -> SimpleModule {
        SimpleModule {
            base_address: Some(0x40000000),
            size: Some(0x10000),
            code_file: Some(name.to_string()),
            debug_file: Some(name.to_string()),
            debug_id: Some(DebugId::nil()),
            ..SimpleModule::default()
        }
    }

    #[test]
    fn test_supplier_asked_once_per_dump() {
        let supplier = Arc::new(CountingSupplier::default());
        let symbolizer = Symbolizer::new(supplier.clone());
        symbolizer.begin_dump(&test_system_info());

        let module = module_named("has_syms.bin");
        let mut frame = SimpleFrame::with_instruction(0x40001010);
        symbolizer.fill_symbol(&module, &mut frame).unwrap();
        assert_eq!(frame.function.as_deref(), Some("a func"));

        // Additional queries reuse the loaded module.
        let mut frame = SimpleFrame::with_instruction(0x40001020);
        symbolizer.fill_symbol(&module, &mut frame).unwrap();
        assert_eq!(supplier.data_calls.load(Ordering::SeqCst), 1);

        // A module with no symbols is also only asked about once.
        let missing = module_named("no_syms.bin");
        let mut frame = SimpleFrame::with_instruction(0x40001010);
        assert_eq!(
            symbolizer.fill_symbol(&missing, &mut frame),
            Err(FillSymbolError::NotFound)
        );
        assert!(symbolizer.fill_symbol(&missing, &mut frame).is_err());
        assert_eq!(supplier.data_calls.load(Ordering::SeqCst), 2);

        // A new dump re-requests everything and frees the old data.
        symbolizer.begin_dump(&test_system_info());
        assert_eq!(supplier.free_calls.load(Ordering::SeqCst), 1);
        let mut frame = SimpleFrame::with_instruction(0x40001010);
        symbolizer.fill_symbol(&module, &mut frame).unwrap();
        assert_eq!(supplier.data_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_supplier_interrupt_propagates() {
        let supplier = Arc::new(CountingSupplier {
            interrupt: true,
            ..CountingSupplier::default()
        });
        let symbolizer = Symbolizer::new(supplier);
        symbolizer.begin_dump(&test_system_info());
        let module = module_named("has_syms.bin");
        let mut frame = SimpleFrame::with_instruction(0x40001010);
        assert_eq!(
            symbolizer.fill_symbol(&module, &mut frame),
            Err(FillSymbolError::Interrupted)
        );
    }

    #[test]
    fn test_registry_load_once() {
        let mut registry = ResolverRegistry::new();
        let module = module_named("m.bin");
        registry
            .load_text(&module, b"MODULE Linux x86 ffff0000 m\nFILE 0 a.c\n")
            .unwrap();
        assert!(registry.has_module(&module));
        assert_eq!(
            registry
                .load_text(&module, b"MODULE Linux x86 ffff0000 m\nFILE 0 a.c\n")
                .unwrap_err(),
            SymbolError::AlreadyLoaded
        );
        assert!(registry.unload(&module));
        assert!(!registry.has_module(&module));
    }

    #[test]
    fn test_simple_supplier_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let id = DebugId::from_str("abcd1234-abcd-1234-abcd-abcd12345678-a").unwrap();
        let rel = "foo.pdb/ABCD1234ABCD1234ABCDABCD12345678a/foo.sym";
        let path = dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            b"MODULE Windows x86 ABCD1234ABCD1234ABCDABCD12345678a foo.pdb\nFILE 0 foo.c\nFUNC 1000 30 0 disk func\n1000 30 1 0\n",
        )
        .unwrap();

        let supplier = SimpleSymbolSupplier::new(vec![dir.path().to_path_buf()]);
        let symbolizer = Symbolizer::new(supplier);
        assert_eq!(
            symbolizer
                .get_symbol_at_address("foo.pdb", id, 0x1010)
                .unwrap(),
            "disk func"
        );

        // A serialized sibling takes precedence once present.
        let sym = SymbolFile::from_bytes(
            b"MODULE Windows x86 ABCD1234ABCD1234ABCDABCD12345678a foo.pdb\nFILE 0 foo.c\nFUNC 1000 30 0 image func\n1000 30 1 0\n",
        )
        .unwrap();
        std::fs::write(path.with_extension(IMAGE_EXTENSION), sym.serialize()).unwrap();
        let symbolizer = Symbolizer::new(SimpleSymbolSupplier::new(vec![dir.path().to_path_buf()]));
        assert_eq!(
            symbolizer
                .get_symbol_at_address("foo.pdb", id, 0x1010)
                .unwrap(),
            "image func"
        );
    }
}
