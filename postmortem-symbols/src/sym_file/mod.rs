//! Parsed and serialized symbol modules, and the point queries the
//! stack walker and symbolizer run against them.

use std::path::Path;

use tracing::trace;

use postmortem_common::{range_contains, Module};

pub mod image;
mod parser;
pub mod types;
pub mod walker;

pub use image::ImageView;
pub use parser::{parse_symbol_bytes, parse_symbol_file, SymbolParser};
pub use types::*;

use crate::{FrameSymbolizer, FrameWalker, SymbolError};

impl SymbolFile {
    /// Parse a `SymbolFile` from `path`.
    pub fn from_file(path: &Path) -> Result<SymbolFile, SymbolError> {
        parser::parse_symbol_file(path)
    }

    /// Parse an in-memory `SymbolFile` from `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<SymbolFile, SymbolError> {
        parser::parse_symbol_bytes(bytes)
    }

    /// Flatten into the serialized byte image.
    pub fn serialize(&self) -> Vec<u8> {
        image::serialize_symbol_file(self)
    }
}

/// The symbols for one module, in either representation.
///
/// `Built` holds the parser's in-memory maps; `Loaded` is a view over a
/// serialized image. Both answer the same queries identically.
#[derive(Clone, Debug)]
pub enum SymbolModule {
    Built(SymbolFile),
    Loaded(ImageView),
}

/// Where a frame's instruction landed, in transient owned form.
struct FrameLocation {
    name: String,
    base: u64,
    parameter_size: u32,
    is_multiple: bool,
    file: Option<String>,
    line: Option<u32>,
    line_base: Option<u64>,
}

/// One inlined call covering the address. Before the file/line shift
/// these carry their own *call site*; afterwards, the location to
/// display for the frame.
struct InlineSite {
    name: String,
    base: u64,
    file: Option<String>,
    line: Option<u32>,
}

impl SymbolModule {
    pub fn is_corrupt(&self) -> bool {
        match self {
            SymbolModule::Built(sym) => sym.is_corrupt,
            SymbolModule::Loaded(view) => view.is_corrupt(),
        }
    }

    /// Serialize to the byte image format.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            SymbolModule::Built(sym) => sym.serialize(),
            SymbolModule::Loaded(view) => view.as_bytes().to_vec(),
        }
    }

    /// Fill in as much source information for `frame` as possible,
    /// including any inlined calls covering its address.
    pub fn fill_symbol(&self, module: &dyn Module, frame: &mut dyn FrameSymbolizer) {
        if frame.get_instruction() < module.base_address() {
            return;
        }
        let addr = frame.get_instruction() - module.base_address();
        let base = module.base_address();

        let (location, mut inline_sites) = match self {
            SymbolModule::Built(sym) => locate_built(sym, base, addr),
            SymbolModule::Loaded(view) => locate_loaded(view, base, addr),
        };
        let Some(mut location) = location else {
            return;
        };

        // The line record at this address describes the *leaf* of the
        // inline chain. Rotate locations so that every frame's file and
        // line point at the call inside the frame above it, and the leaf
        // location ends up on the innermost inline.
        if !inline_sites.is_empty() {
            let mut saved_file = location.file.take();
            let mut saved_line = location.line.take();
            location.file = inline_sites[0].file.clone();
            location.line = inline_sites[0].line;
            for site in inline_sites.iter_mut().rev() {
                std::mem::swap(&mut site.file, &mut saved_file);
                std::mem::swap(&mut site.line, &mut saved_line);
            }
        }

        frame.set_function(
            &location.name,
            location.base,
            location.parameter_size,
            location.is_multiple,
        );
        if let (Some(file), Some(line)) = (&location.file, location.line) {
            frame.set_source_file(file, line, location.line_base.unwrap_or(location.base));
        }
        // Innermost-first, the order stacks are printed in.
        for site in inline_sites.iter().rev() {
            frame.add_inline_frame(&site.name, site.base, site.file.as_deref(), site.line);
        }
    }

    /// Recover the caller's registers using the best frame info covering
    /// the walker's address: Windows frame data, then FPO, then CFI.
    pub fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        if walker.get_instruction() < module.base_address() {
            return None;
        }
        let addr = walker.get_instruction() - module.base_address();
        match self {
            SymbolModule::Built(sym) => {
                let win_result = if let Some(info) = sym.win_stack_framedata_info.get(addr) {
                    walker::walk_with_stack_win_framedata(info, walker)
                } else if let Some(info) = sym.win_stack_fpo_info.get(addr) {
                    walker::walk_with_stack_win_fpo(info, walker)
                } else {
                    None
                };
                win_result.or_else(|| {
                    let rules = sym.cfi_initial_rules.get(addr)?;
                    let deltas: Vec<&str> = sym
                        .cfi_delta_rules
                        .range(rules.address..=addr)
                        .map(|(_, r)| r.as_str())
                        .collect();
                    trace!("walking with cfi");
                    walker::walk_with_stack_cfi(&rules.rules, &deltas, walker)
                })
            }
            SymbolModule::Loaded(view) => {
                let win_result = if let Some(info) = retrieve_win_info(view.win_frame_data(), addr)
                {
                    walker::walk_with_stack_win_framedata(&info, walker)
                } else if let Some(info) = retrieve_win_info(view.win_fpo(), addr) {
                    walker::walk_with_stack_win_fpo(&info, walker)
                } else {
                    None
                };
                win_result.or_else(|| {
                    let (payload, ibase, _) = view.cfi_init().retrieve_range(addr)?;
                    let init = std::str::from_utf8(payload).ok()?;
                    let deltas = collect_deltas(view, ibase, addr);
                    trace!("walking with cfi");
                    walker::walk_with_stack_cfi(init, &deltas, walker)
                })
            }
        }
    }

    /// The Windows frame-layout answer for an absolute instruction
    /// address, per the `FRAME_DATA`-over-`FPO` preference. When no
    /// `STACK WIN` record covers the address, the parameter size of a
    /// covering function (or bounding public symbol) is still reported.
    pub fn find_windows_frame_info(
        &self,
        module: &dyn Module,
        instruction: u64,
    ) -> Option<WindowsFrameInfo> {
        if instruction < module.base_address() {
            return None;
        }
        let addr = instruction - module.base_address();
        match self {
            SymbolModule::Built(sym) => {
                if let Some(info) = sym.win_stack_framedata_info.get(addr) {
                    return Some(WindowsFrameInfo::Frame(
                        WinStackInfoType::FrameData,
                        info.clone(),
                    ));
                }
                if let Some(info) = sym.win_stack_fpo_info.get(addr) {
                    return Some(WindowsFrameInfo::Frame(WinStackInfoType::Fpo, info.clone()));
                }
                if let Some(func) = sym.functions.get(addr) {
                    return Some(WindowsFrameInfo::ParameterSize(func.parameter_size));
                }
                nearest_public_bounded(sym, addr)
                    .map(|p| WindowsFrameInfo::ParameterSize(p.parameter_size))
            }
            SymbolModule::Loaded(view) => {
                if let Some(info) = retrieve_win_info(view.win_frame_data(), addr) {
                    return Some(WindowsFrameInfo::Frame(WinStackInfoType::FrameData, info));
                }
                if let Some(info) = retrieve_win_info(view.win_fpo(), addr) {
                    return Some(WindowsFrameInfo::Frame(WinStackInfoType::Fpo, info));
                }
                let nearest = view.functions().retrieve_nearest_range(addr);
                if let Some((payload, fbase, fsize)) = nearest {
                    if range_contains(fbase, fsize, addr) {
                        let func = image::decode_function(payload, fbase, fsize).ok()?;
                        return Some(WindowsFrameInfo::ParameterSize(func.parameter_size));
                    }
                }
                let (payload, paddr) = view.publics().retrieve(addr)?;
                if let Some((_, fbase, _)) = nearest {
                    if paddr <= fbase {
                        return None;
                    }
                }
                let public = image::decode_public(payload, paddr).ok()?;
                Some(WindowsFrameInfo::ParameterSize(public.parameter_size))
            }
        }
    }

    /// The fully merged CFI rule set for an absolute instruction
    /// address: the covering initial rules plus every delta at or below
    /// the address within that region.
    pub fn find_cfi_frame_info(
        &self,
        module: &dyn Module,
        instruction: u64,
    ) -> Option<CfiFrameRules> {
        if instruction < module.base_address() {
            return None;
        }
        let addr = instruction - module.base_address();
        match self {
            SymbolModule::Built(sym) => {
                let rules = sym.cfi_initial_rules.get(addr)?;
                let deltas: Vec<&str> = sym
                    .cfi_delta_rules
                    .range(rules.address..=addr)
                    .map(|(_, r)| r.as_str())
                    .collect();
                walker::merge_cfi_rules(&rules.rules, &deltas)
            }
            SymbolModule::Loaded(view) => {
                let (payload, ibase, _) = view.cfi_init().retrieve_range(addr)?;
                let init = std::str::from_utf8(payload).ok()?;
                let deltas = collect_deltas(view, ibase, addr);
                walker::merge_cfi_rules(init, &deltas)
            }
        }
    }
}

fn retrieve_win_info(
    map: crate::maps::StaticRangeMap<'_>,
    addr: u64,
) -> Option<StackInfoWin> {
    let (payload, base, size) = map.retrieve_range(addr)?;
    image::decode_win_info(payload, base, size).ok()
}

/// Delta rules in `[ibase, addr]`, as borrowed strings from the image.
fn collect_deltas(view: &ImageView, ibase: u64, addr: u64) -> Vec<&str> {
    let deltas = view.cfi_delta();
    let mut out = vec![];
    let mut i = deltas.lower_bound(ibase);
    while i < deltas.len() && deltas.key_at(i) <= addr {
        if let Ok(rules) = std::str::from_utf8(deltas.value_at(i)) {
            out.push(rules);
        }
        i += 1;
    }
    out
}

fn locate_built(sym: &SymbolFile, base: u64, addr: u64) -> (Option<FrameLocation>, Vec<InlineSite>) {
    if let Some(func) = sym.functions.get(addr) {
        // FUNC parameter sizes are less reliable than STACK WIN ones,
        // and the STACK WIN values are what drive subsequent frame-data
        // unwinds. Prefer them when present.
        let parameter_size = sym
            .win_stack_framedata_info
            .get(addr)
            .or_else(|| sym.win_stack_fpo_info.get(addr))
            .map(|info| info.parameter_size)
            .unwrap_or(func.parameter_size);

        let mut location = FrameLocation {
            name: func.name.clone(),
            base: base + func.address,
            parameter_size,
            is_multiple: func.is_multiple,
            file: None,
            line: None,
            line_base: None,
        };
        if let Some(line) = func.lines.get(addr) {
            location.file = sym.files.get(&line.file).cloned();
            location.line = Some(line.line);
            location.line_base = Some(base + line.address);
        }

        let inline_sites = func
            .inlines
            .retrieve_ranges(addr)
            .into_iter()
            .map(|(inline, ibase, _)| InlineSite {
                name: sym
                    .inline_origins
                    .get(&inline.origin_id)
                    .cloned()
                    .unwrap_or_else(|| "<name omitted>".to_string()),
                base: base + ibase,
                file: inline
                    .call_site_file
                    .and_then(|id| sym.files.get(&id).cloned()),
                line: Some(inline.call_site_line),
            })
            .collect();
        (Some(location), inline_sites)
    } else if let Some(public) = nearest_public_bounded(sym, addr) {
        (
            Some(FrameLocation {
                name: public.name.clone(),
                base: base + public.address,
                parameter_size: public.parameter_size,
                is_multiple: public.is_multiple,
                file: None,
                line: None,
                line_base: None,
            }),
            vec![],
        )
    } else {
        (None, vec![])
    }
}

/// The nearest public symbol at or below `addr`, unless a function
/// between the two proves the symbol's implicit extent ended early.
fn nearest_public_bounded(sym: &SymbolFile, addr: u64) -> Option<&PublicSymbol> {
    let idx = sym.publics.partition_point(|p| p.address <= addr);
    let public = sym.publics.get(idx.checked_sub(1)?)?;

    // PUBLIC records have no endpoint, so a record from far down the
    // module could otherwise soak up every address above it. A public
    // symbol cannot extend past a function, so find the nearest function
    // starting at or below addr and require the public to be above it.
    let funcs = sym.functions.ranges_values().as_slice();
    let prev_func = funcs
        .binary_search_by_key(&addr, |(range, _)| range.start)
        .err()
        .and_then(|idx| idx.checked_sub(1))
        .and_then(|idx| funcs.get(idx));
    if let Some((_, prev)) = prev_func {
        if public.address <= prev.address {
            return None;
        }
    }
    Some(public)
}

fn locate_loaded(
    view: &ImageView,
    base: u64,
    addr: u64,
) -> (Option<FrameLocation>, Vec<InlineSite>) {
    let functions = view.functions();
    let nearest = functions.retrieve_nearest_range(addr);
    if let Some((payload, fbase, fsize)) = nearest {
        if range_contains(fbase, fsize, addr) {
            let Ok(func) = image::decode_function(payload, fbase, fsize) else {
                return (None, vec![]);
            };

            let parameter_size = retrieve_win_info(view.win_frame_data(), addr)
                .or_else(|| retrieve_win_info(view.win_fpo(), addr))
                .map(|info| info.parameter_size)
                .unwrap_or(func.parameter_size);

            let mut location = FrameLocation {
                name: func.name.to_string(),
                base: base + fbase,
                parameter_size,
                is_multiple: func.is_multiple,
                file: None,
                line: None,
                line_base: None,
            };
            if let Some((line_payload, lbase, _)) = func.lines.retrieve_range(addr) {
                if line_payload.len() >= 8 {
                    let file_id = crate::maps::u32_at(line_payload, 0);
                    location.file = view
                        .files()
                        .get(file_id)
                        .and_then(|b| std::str::from_utf8(b).ok())
                        .map(str::to_string);
                    location.line = Some(crate::maps::u32_at(line_payload, 4));
                    location.line_base = Some(base + lbase);
                }
            }

            let origins = view.inline_origins();
            let files = view.files();
            let inline_sites = func
                .inlines
                .retrieve_ranges(addr)
                .into_iter()
                .filter_map(|(entry, ibase, _)| {
                    let inline = image::decode_inline(entry).ok()?;
                    Some(InlineSite {
                        name: origins
                            .get(inline.origin_id)
                            .and_then(|b| std::str::from_utf8(b).ok())
                            .unwrap_or("<name omitted>")
                            .to_string(),
                        base: base + ibase,
                        file: inline
                            .call_site_file
                            .and_then(|id| files.get(id))
                            .and_then(|b| std::str::from_utf8(b).ok())
                            .map(str::to_string),
                        line: Some(inline.call_site_line),
                    })
                })
                .collect();
            return (Some(location), inline_sites);
        }
    }

    // No covering function; settle for a public symbol whose implicit
    // extent has not been cut short by a nearer function.
    let publics = view.publics();
    if let Some((payload, paddr)) = publics.retrieve(addr) {
        let bounded = match nearest {
            Some((_, fbase, _)) => paddr > fbase,
            None => true,
        };
        if bounded {
            if let Ok(public) = image::decode_public(payload, paddr) {
                return (
                    Some(FrameLocation {
                        name: public.name.to_string(),
                        base: base + public.address,
                        parameter_size: public.parameter_size,
                        is_multiple: public.is_multiple,
                        file: None,
                        line: None,
                        line_base: None,
                    }),
                    vec![],
                );
            }
        }
    }
    (None, vec![])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimpleFrame, SimpleModule};
    use debugid::DebugId;

    fn module_at(base: u64) -> SimpleModule {
        SimpleModule {
            base_address: Some(base),
            size: Some(0x10000),
            code_file: Some("test.bin".into()),
            debug_file: Some("test.pdb".into()),
            debug_id: Some(DebugId::nil()),
            ..SimpleModule::default()
        }
    }

    fn both_variants(text: &str) -> Vec<SymbolModule> {
        let sym = SymbolFile::from_bytes(text.as_bytes()).unwrap();
        let image = sym.serialize();
        vec![
            SymbolModule::Built(sym),
            SymbolModule::Loaded(ImageView::new(image).unwrap()),
        ]
    }

    const SYM: &str = "MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 test
FILE 0 foo.c
FILE 1 inlined.h
INLINE_ORIGIN 0 alpha()
INLINE_ORIGIN 1 beta()
INLINE_ORIGIN 2 gamma()
PUBLIC 800 0 early_public
FUNC 1000 100 8 outer()
INLINE 0 10 0 0 1020 40
INLINE 1 20 1 1 1030 20
INLINE 2 30 1 2 1034 8
1000 20 9 0
1020 20 101 1
1030 10 201 1
1040 20 11 0
PUBLIC 2000 4 tail_public
";

    #[test]
    fn test_lookup_function_and_line() {
        for module in both_variants(SYM) {
            let m = module_at(0x40000000);
            let mut frame = SimpleFrame::with_instruction(0x40001010);
            module.fill_symbol(&m, &mut frame);
            assert_eq!(frame.function.as_deref(), Some("outer()"));
            assert_eq!(frame.function_base, Some(0x40001000));
            assert_eq!(frame.parameter_size, Some(8));
            assert_eq!(frame.source_file.as_deref(), Some("foo.c"));
            assert_eq!(frame.source_line, Some(9));
            assert_eq!(frame.source_line_base, Some(0x40001000));
            assert!(frame.inlines.is_empty());
        }
    }

    #[test]
    fn test_lookup_misses_outside_function() {
        for module in both_variants(SYM) {
            let m = module_at(0x40000000);
            let mut frame = SimpleFrame::with_instruction(0x40000700);
            module.fill_symbol(&m, &mut frame);
            assert!(frame.function.is_none());
        }
    }

    #[test]
    fn test_public_fallback_and_bounding() {
        for module in both_variants(SYM) {
            let m = module_at(0x40000000);
            // Above the last function, the tail public applies.
            let mut frame = SimpleFrame::with_instruction(0x40002345);
            module.fill_symbol(&m, &mut frame);
            assert_eq!(frame.function.as_deref(), Some("tail_public"));
            assert_eq!(frame.function_base, Some(0x40002000));

            // Between the early public and the function's end there is a
            // gap at 0x1100..0x2000: the nearest public (0x800) sits
            // below the nearest function (0x1000), so its extent must
            // have ended before the gap. No name.
            let mut frame = SimpleFrame::with_instruction(0x40001800);
            module.fill_symbol(&m, &mut frame);
            assert!(frame.function.is_none(), "public leaked past a function");
        }
    }

    #[test]
    fn test_inline_chain_and_line_shift() {
        for module in both_variants(SYM) {
            let m = module_at(0x40000000);
            // 0x1036 is inside gamma inside beta inside alpha.
            let mut frame = SimpleFrame::with_instruction(0x40001036);
            module.fill_symbol(&m, &mut frame);

            assert_eq!(frame.function.as_deref(), Some("outer()"));
            assert_eq!(frame.inlines.len(), 3);
            // Innermost first.
            assert_eq!(frame.inlines[0].name, "gamma()");
            assert_eq!(frame.inlines[1].name, "beta()");
            assert_eq!(frame.inlines[2].name, "alpha()");
            assert_eq!(frame.inlines[0].base, 0x40001034);
            assert_eq!(frame.inlines[1].base, 0x40001030);
            assert_eq!(frame.inlines[2].base, 0x40001020);

            // The leaf line record (201 in inlined.h) lands on the
            // innermost inline; every other frame shows the call site of
            // the frame above it.
            assert_eq!(frame.inlines[0].file.as_deref(), Some("inlined.h"));
            assert_eq!(frame.inlines[0].line, Some(201));
            assert_eq!(frame.inlines[1].file.as_deref(), Some("inlined.h"));
            assert_eq!(frame.inlines[1].line, Some(30));
            assert_eq!(frame.inlines[2].file.as_deref(), Some("inlined.h"));
            assert_eq!(frame.inlines[2].line, Some(20));
            // The physical frame shows where alpha was called from.
            assert_eq!(frame.source_file.as_deref(), Some("foo.c"));
            assert_eq!(frame.source_line, Some(10));
        }
    }

    const CFI_SYM: &str = "MODULE Linux x86_64 D3096ED481217FD4C16B29CD9BC208BA0 test
STACK CFI INIT 1000 40 .cfa: $rsp 8 + .ra: .cfa -8 + ^
STACK CFI 1010 .cfa: $rsp 16 + $rbx: .cfa -16 + ^
STACK CFI 1020 .cfa: $rsp 24 +
STACK WIN 4 2000 30 4 2 8 4 8 0 1 $eip $esp ^ = $esp $esp 4 + =
STACK WIN 0 3000 30 4 2 c 4 8 0 0 1
";

    #[test]
    fn test_find_cfi_frame_info_applies_deltas_in_order() {
        for module in both_variants(CFI_SYM) {
            let m = module_at(0x40000000);
            let rules = module.find_cfi_frame_info(&m, 0x40001008).unwrap();
            assert_eq!(rules.cfa_rule, "$rsp 8 +");
            assert!(rules.register_rules.is_empty());

            let rules = module.find_cfi_frame_info(&m, 0x40001015).unwrap();
            assert_eq!(rules.cfa_rule, "$rsp 16 +");
            assert_eq!(rules.ra_rule, ".cfa -8 + ^");
            assert_eq!(rules.register_rules.len(), 1);

            // Deltas past the query address are ignored.
            let rules = module.find_cfi_frame_info(&m, 0x40001020).unwrap();
            assert_eq!(rules.cfa_rule, "$rsp 24 +");

            assert!(module.find_cfi_frame_info(&m, 0x40000900).is_none());
        }
    }

    #[test]
    fn test_find_windows_frame_info() {
        for module in both_variants(CFI_SYM) {
            let m = module_at(0x40000000);
            match module.find_windows_frame_info(&m, 0x40002010) {
                Some(WindowsFrameInfo::Frame(WinStackInfoType::FrameData, info)) => {
                    assert_eq!(info.address, 0x2000);
                    assert_eq!(info.parameter_size, 8);
                }
                other => panic!("expected frame data, got {other:?}"),
            }
            match module.find_windows_frame_info(&m, 0x40003010) {
                Some(WindowsFrameInfo::Frame(WinStackInfoType::Fpo, info)) => {
                    assert_eq!(
                        info.program_string_or_base_pointer,
                        WinStackThing::AllocatesBasePointer(true)
                    );
                }
                other => panic!("expected fpo, got {other:?}"),
            }
            assert!(module.find_windows_frame_info(&m, 0x40004000).is_none());
        }
    }

    #[test]
    fn test_round_trip_lookup_identity() {
        let sym = SymbolFile::from_bytes(SYM.as_bytes()).unwrap();
        let built = SymbolModule::Built(sym.clone());
        let loaded = SymbolModule::Loaded(ImageView::new(sym.serialize()).unwrap());
        let m = module_at(0x40000000);

        for addr in (0x40000000u64..0x40002400).step_by(4) {
            let mut a = SimpleFrame::with_instruction(addr);
            let mut b = SimpleFrame::with_instruction(addr);
            built.fill_symbol(&m, &mut a);
            loaded.fill_symbol(&m, &mut b);
            assert_eq!(a, b, "lookup diverged at {addr:#x}");
        }
    }

    #[test]
    fn test_round_trip_cfi_identity() {
        let sym = SymbolFile::from_bytes(CFI_SYM.as_bytes()).unwrap();
        let built = SymbolModule::Built(sym.clone());
        let loaded = SymbolModule::Loaded(ImageView::new(sym.serialize()).unwrap());
        let m = module_at(0x40000000);

        for addr in (0x40000f00u64..0x40003100).step_by(2) {
            assert_eq!(
                built.find_cfi_frame_info(&m, addr),
                loaded.find_cfi_frame_info(&m, addr),
                "cfi diverged at {addr:#x}"
            );
            assert_eq!(
                built.find_windows_frame_info(&m, addr),
                loaded.find_windows_frame_info(&m, addr),
                "win info diverged at {addr:#x}"
            );
        }
    }
}
