//! The serialized symbol image: a [`SymbolFile`] flattened into one
//! contiguous buffer of static maps for zero-copy reload.
//!
//! Layout:
//!
//! ```text
//! [is_corrupt: u8][size[8]: u64 x 8][map bytes x 8][optional NUL]
//! ```
//!
//! Map order: files, functions, public symbols, STACK WIN FPO,
//! STACK WIN frame data, CFI initial rules, CFI delta rules, inline
//! origins. The loader accepts a buffer whose length exceeds the
//! declared total by exactly one byte (a trailing NUL from C-string
//! handling); anything else is a format error and no module is
//! registered.

use std::str;

use super::types::*;
use crate::maps::writer::{StaticMapWriter, StaticRangeMapWriter};
use crate::maps::{
    u32_at, u64_at, MapFormatError, StaticAddressMap, StaticContainedRangeMap, StaticMap,
    StaticRangeMap,
};

pub(crate) const NUM_MAPS: usize = 8;

const MAP_FILES: usize = 0;
const MAP_FUNCTIONS: usize = 1;
const MAP_PUBLICS: usize = 2;
const MAP_WIN_FPO: usize = 3;
const MAP_WIN_FRAME_DATA: usize = 4;
const MAP_CFI_INIT: usize = 5;
const MAP_CFI_DELTA: usize = 6;
const MAP_INLINE_ORIGINS: usize = 7;

fn encode_inline(inline: &Inline, out: &mut Vec<u8>) {
    out.extend_from_slice(&inline.depth.to_le_bytes());
    out.extend_from_slice(&inline.call_site_line.to_le_bytes());
    out.push(inline.call_site_file.is_some() as u8);
    out.extend_from_slice(&inline.call_site_file.unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&inline.origin_id.to_le_bytes());
}

fn encode_function(func: &Function) -> Vec<u8> {
    let mut lines = StaticRangeMapWriter::new();
    for (range, line) in func.lines.ranges_values() {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&line.file.to_le_bytes());
        payload.extend_from_slice(&line.line.to_le_bytes());
        lines.insert(range.start, range.end, &payload);
    }
    let lines = lines.finish();
    let inlines = func.inlines.serialize(&encode_inline);

    let mut out = Vec::new();
    out.extend_from_slice(&func.parameter_size.to_le_bytes());
    out.push(func.is_multiple as u8);
    out.extend_from_slice(&(func.name.len() as u32).to_le_bytes());
    out.extend_from_slice(func.name.as_bytes());
    out.extend_from_slice(&(lines.len() as u32).to_le_bytes());
    out.extend_from_slice(&lines);
    out.extend_from_slice(&inlines);
    out
}

fn encode_win_info(info: &StackInfoWin) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&info.prologue_size.to_le_bytes());
    out.extend_from_slice(&info.epilogue_size.to_le_bytes());
    out.extend_from_slice(&info.parameter_size.to_le_bytes());
    out.extend_from_slice(&info.saved_register_size.to_le_bytes());
    out.extend_from_slice(&info.local_size.to_le_bytes());
    out.extend_from_slice(&info.max_stack_size.to_le_bytes());
    match &info.program_string_or_base_pointer {
        WinStackThing::ProgramString(s) => {
            out.push(1);
            out.push(0);
            out.extend_from_slice(s.as_bytes());
        }
        WinStackThing::AllocatesBasePointer(allocates) => {
            out.push(0);
            out.push(*allocates as u8);
        }
    }
    out
}

fn serialize_win_map(
    map: &range_map::RangeMap<u64, StackInfoWin>,
) -> Vec<u8> {
    let mut writer = StaticRangeMapWriter::new();
    for (range, info) in map.ranges_values() {
        writer.insert(range.start, range.end, &encode_win_info(info));
    }
    writer.finish()
}

/// Serialize a parsed symbol file into its byte image.
pub fn serialize_symbol_file(sym: &SymbolFile) -> Vec<u8> {
    let mut maps: [Vec<u8>; NUM_MAPS] = Default::default();

    let mut files = StaticMapWriter::<u32>::new();
    for (&id, path) in &sym.files {
        files.insert(id, path.as_bytes());
    }
    maps[MAP_FILES] = files.finish();

    let mut functions = StaticRangeMapWriter::new();
    for (range, func) in sym.functions.ranges_values() {
        functions.insert(range.start, range.end, &encode_function(func));
    }
    maps[MAP_FUNCTIONS] = functions.finish();

    let mut publics = StaticMapWriter::<u64>::new();
    for public in &sym.publics {
        let mut payload = Vec::new();
        payload.extend_from_slice(&public.parameter_size.to_le_bytes());
        payload.push(public.is_multiple as u8);
        payload.extend_from_slice(public.name.as_bytes());
        publics.insert_owned(public.address, payload);
    }
    maps[MAP_PUBLICS] = publics.finish();

    maps[MAP_WIN_FPO] = serialize_win_map(&sym.win_stack_fpo_info);
    maps[MAP_WIN_FRAME_DATA] = serialize_win_map(&sym.win_stack_framedata_info);

    let mut cfi_init = StaticRangeMapWriter::new();
    for (range, rules) in sym.cfi_initial_rules.ranges_values() {
        cfi_init.insert(range.start, range.end, rules.rules.as_bytes());
    }
    maps[MAP_CFI_INIT] = cfi_init.finish();

    let mut cfi_delta = StaticMapWriter::<u64>::new();
    for (&addr, rules) in &sym.cfi_delta_rules {
        cfi_delta.insert(addr, rules.as_bytes());
    }
    maps[MAP_CFI_DELTA] = cfi_delta.finish();

    let mut origins = StaticMapWriter::<u32>::new();
    for (&id, name) in &sym.inline_origins {
        origins.insert(id, name.as_bytes());
    }
    maps[MAP_INLINE_ORIGINS] = origins.finish();

    let mut out = Vec::new();
    out.push(sym.is_corrupt as u8);
    for map in &maps {
        out.extend_from_slice(&(map.len() as u64).to_le_bytes());
    }
    for map in &maps {
        out.extend_from_slice(map);
    }
    out
}

/// A loaded symbol image. Owns its buffer; every query constructs
/// transient views borrowing from it.
#[derive(Clone, Debug)]
pub struct ImageView {
    buffer: Vec<u8>,
    is_corrupt: bool,
    map_ranges: [std::ops::Range<usize>; NUM_MAPS],
}

/// A function decoded out of the image, borrowing the buffer.
pub(crate) struct FunctionView<'a> {
    pub base: u64,
    pub size: u64,
    pub parameter_size: u32,
    pub is_multiple: bool,
    pub name: &'a str,
    pub lines: StaticRangeMap<'a>,
    pub inlines: StaticContainedRangeMap<'a>,
}

pub(crate) struct InlineView<'a> {
    pub depth: u32,
    pub call_site_line: u32,
    pub call_site_file: Option<u32>,
    pub origin_id: u32,
    // Keeps the depth field meaningful for callers sorting entries.
    pub _marker: std::marker::PhantomData<&'a ()>,
}

pub(crate) fn decode_function(
    payload: &[u8],
    base: u64,
    size: u64,
) -> Result<FunctionView<'_>, MapFormatError> {
    if payload.len() < 9 {
        return Err(MapFormatError::Truncated);
    }
    let parameter_size = u32_at(payload, 0);
    let is_multiple = payload[4] != 0;
    let name_len = u32_at(payload, 5) as usize;
    let name_end = 9usize
        .checked_add(name_len)
        .ok_or(MapFormatError::Truncated)?;
    if payload.len() < name_end + 4 {
        return Err(MapFormatError::Truncated);
    }
    let name = str::from_utf8(&payload[9..name_end]).map_err(|_| MapFormatError::Truncated)?;
    let lines_len = u32_at(payload, name_end) as usize;
    let lines_end = name_end
        .checked_add(4)
        .and_then(|n| n.checked_add(lines_len))
        .ok_or(MapFormatError::Truncated)?;
    if payload.len() < lines_end {
        return Err(MapFormatError::Truncated);
    }
    let lines = StaticRangeMap::new(&payload[name_end + 4..lines_end])?;
    let inlines = StaticContainedRangeMap::new(&payload[lines_end..])?;
    Ok(FunctionView {
        base,
        size,
        parameter_size,
        is_multiple,
        name,
        lines,
        inlines,
    })
}

pub(crate) fn decode_inline(entry: &[u8]) -> Result<InlineView<'_>, MapFormatError> {
    if entry.len() < 17 {
        return Err(MapFormatError::Truncated);
    }
    let has_file = entry[8] != 0;
    Ok(InlineView {
        depth: u32_at(entry, 0),
        call_site_line: u32_at(entry, 4),
        call_site_file: has_file.then(|| u32_at(entry, 9)),
        origin_id: u32_at(entry, 13),
        _marker: std::marker::PhantomData,
    })
}

pub(crate) struct PublicView<'a> {
    pub address: u64,
    pub parameter_size: u32,
    pub is_multiple: bool,
    pub name: &'a str,
}

pub(crate) fn decode_public(payload: &[u8], address: u64) -> Result<PublicView<'_>, MapFormatError> {
    if payload.len() < 5 {
        return Err(MapFormatError::Truncated);
    }
    Ok(PublicView {
        address,
        parameter_size: u32_at(payload, 0),
        is_multiple: payload[4] != 0,
        name: str::from_utf8(&payload[5..]).map_err(|_| MapFormatError::Truncated)?,
    })
}

pub(crate) fn decode_win_info(
    payload: &[u8],
    base: u64,
    size: u64,
) -> Result<StackInfoWin, MapFormatError> {
    if payload.len() < 26 {
        return Err(MapFormatError::Truncated);
    }
    let has_program_string = payload[24] != 0;
    let program_string_or_base_pointer = if has_program_string {
        let s = str::from_utf8(&payload[26..]).map_err(|_| MapFormatError::Truncated)?;
        WinStackThing::ProgramString(s.to_string())
    } else {
        WinStackThing::AllocatesBasePointer(payload[25] != 0)
    };
    Ok(StackInfoWin {
        address: base,
        size: size as u32,
        prologue_size: u32_at(payload, 0),
        epilogue_size: u32_at(payload, 4),
        parameter_size: u32_at(payload, 8),
        saved_register_size: u32_at(payload, 12),
        local_size: u32_at(payload, 16),
        max_stack_size: u32_at(payload, 20),
        program_string_or_base_pointer,
    })
}

impl ImageView {
    /// Validate `buffer` and take ownership of it.
    pub fn new(buffer: Vec<u8>) -> Result<ImageView, MapFormatError> {
        let header_len = 1 + NUM_MAPS * 8;
        if buffer.len() < header_len {
            return Err(MapFormatError::Truncated);
        }
        let is_corrupt = buffer[0] != 0;

        let mut map_ranges: [std::ops::Range<usize>; NUM_MAPS] = Default::default();
        let mut offset = header_len;
        for (i, range) in map_ranges.iter_mut().enumerate() {
            let size = u64_at(&buffer, 1 + i * 8) as usize;
            let end = offset.checked_add(size).ok_or(MapFormatError::SizeMismatch)?;
            if end > buffer.len() {
                return Err(MapFormatError::SizeMismatch);
            }
            *range = offset..end;
            offset = end;
        }
        // Tolerate exactly one trailing NUL.
        if offset != buffer.len() && !(offset + 1 == buffer.len() && buffer[offset] == 0) {
            return Err(MapFormatError::SizeMismatch);
        }

        let view = ImageView {
            buffer,
            is_corrupt,
            map_ranges,
        };
        view.validate()?;
        Ok(view)
    }

    /// Parse every map once so later queries cannot fail.
    fn validate(&self) -> Result<(), MapFormatError> {
        StaticMap::<u32>::new(self.map_bytes(MAP_FILES))?;
        StaticMap::<u32>::new(self.map_bytes(MAP_INLINE_ORIGINS))?;
        StaticMap::<u64>::new(self.map_bytes(MAP_CFI_DELTA))?;
        StaticRangeMap::new(self.map_bytes(MAP_CFI_INIT))?;
        let functions = StaticRangeMap::new(self.map_bytes(MAP_FUNCTIONS))?;
        for (payload, base, size) in functions.iter() {
            let func = decode_function(payload, base, size)?;
            for (entry, _, _) in func.inlines.retrieve_ranges(base) {
                decode_inline(entry)?;
            }
        }
        let publics = StaticAddressMap::new(self.map_bytes(MAP_PUBLICS))?;
        for (address, payload) in publics.iter() {
            decode_public(payload, address)?;
        }
        for index in [MAP_WIN_FPO, MAP_WIN_FRAME_DATA] {
            let map = StaticRangeMap::new(self.map_bytes(index))?;
            for (payload, base, size) in map.iter() {
                decode_win_info(payload, base, size)?;
            }
        }
        Ok(())
    }

    fn map_bytes(&self, index: usize) -> &[u8] {
        &self.buffer[self.map_ranges[index].clone()]
    }

    pub fn is_corrupt(&self) -> bool {
        self.is_corrupt
    }

    /// The raw serialized bytes, e.g. for writing back to disk.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn files(&self) -> StaticMap<'_, u32> {
        // Validated in new().
        StaticMap::new(self.map_bytes(MAP_FILES)).unwrap_or_else(|_| unreachable!())
    }

    pub(crate) fn inline_origins(&self) -> StaticMap<'_, u32> {
        StaticMap::new(self.map_bytes(MAP_INLINE_ORIGINS)).unwrap_or_else(|_| unreachable!())
    }

    pub(crate) fn functions(&self) -> StaticRangeMap<'_> {
        StaticRangeMap::new(self.map_bytes(MAP_FUNCTIONS)).unwrap_or_else(|_| unreachable!())
    }

    pub(crate) fn publics(&self) -> StaticAddressMap<'_> {
        StaticAddressMap::new(self.map_bytes(MAP_PUBLICS)).unwrap_or_else(|_| unreachable!())
    }

    pub(crate) fn win_fpo(&self) -> StaticRangeMap<'_> {
        StaticRangeMap::new(self.map_bytes(MAP_WIN_FPO)).unwrap_or_else(|_| unreachable!())
    }

    pub(crate) fn win_frame_data(&self) -> StaticRangeMap<'_> {
        StaticRangeMap::new(self.map_bytes(MAP_WIN_FRAME_DATA)).unwrap_or_else(|_| unreachable!())
    }

    pub(crate) fn cfi_init(&self) -> StaticRangeMap<'_> {
        StaticRangeMap::new(self.map_bytes(MAP_CFI_INIT)).unwrap_or_else(|_| unreachable!())
    }

    pub(crate) fn cfi_delta(&self) -> StaticMap<'_, u64> {
        StaticMap::new(self.map_bytes(MAP_CFI_DELTA)).unwrap_or_else(|_| unreachable!())
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse_symbol_bytes;
    use super::*;

    const SYM: &[u8] = b"MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 bin
FILE 0 foo.c
PUBLIC abcd 10 some public
FUNC 1000 30 10 some func
1000 30 42 0
STACK WIN 4 1000 30 a1 b2 c3 d4 e5 f6 1 prog string
STACK CFI INIT 1000 30 .cfa: $esp 4 + .ra: .cfa 4 - ^
STACK CFI 1004 .cfa: $esp 8 +
";

    #[test]
    fn test_image_total_matches_header() {
        let sym = parse_symbol_bytes(SYM).unwrap();
        let image = serialize_symbol_file(&sym);
        let mut declared = 1 + NUM_MAPS * 8;
        for i in 0..NUM_MAPS {
            declared += u64_at(&image, 1 + i * 8) as usize;
        }
        assert_eq!(declared, image.len());
    }

    #[test]
    fn test_trailing_nul_tolerated() {
        let sym = parse_symbol_bytes(SYM).unwrap();
        let mut image = serialize_symbol_file(&sym);
        assert!(ImageView::new(image.clone()).is_ok());
        image.push(0);
        assert!(ImageView::new(image.clone()).is_ok());
        image.push(0);
        assert_eq!(
            ImageView::new(image).unwrap_err(),
            MapFormatError::SizeMismatch
        );
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let sym = parse_symbol_bytes(SYM).unwrap();
        let image = serialize_symbol_file(&sym);
        // Truncated buffer.
        assert!(ImageView::new(image[..image.len() - 2].to_vec()).is_err());
        // Lying header.
        let mut lying = image.clone();
        lying[1] = lying[1].wrapping_add(1);
        assert!(ImageView::new(lying).is_err());
    }

    #[test]
    fn test_is_corrupt_round_trips() {
        let mut sym = parse_symbol_bytes(SYM).unwrap();
        sym.is_corrupt = true;
        let image = serialize_symbol_file(&sym);
        assert!(ImageView::new(image).unwrap().is_corrupt());
    }
}
