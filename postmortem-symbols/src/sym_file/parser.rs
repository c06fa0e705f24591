//! The line-oriented symbol-file parser.
//!
//! Parsing is streaming: input is consumed one line at a time, so memory
//! stays bounded by the largest single record plus whatever the records
//! themselves accumulate. Malformed records never abort a parse; they
//! are skipped and the module is marked corrupt.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use nom::bytes::complete::{tag, take_till1};
use nom::character::complete::{digit1, hex_digit1, space1};
use nom::combinator::{map, map_res, opt, rest};
use nom::multi::many1;
use nom::sequence::{preceded, separated_pair, terminated, tuple};
use nom::IResult;
use range_map::{Range, RangeMap};
use tracing::{debug, warn};

use super::types::*;
use crate::maps::ContainedRangeMap;
use crate::SymbolError;

fn hex_u64(input: &str) -> IResult<&str, u64> {
    map_res(hex_digit1, |s: &str| u64::from_str_radix(s, 16))(input)
}

fn hex_u32(input: &str) -> IResult<&str, u32> {
    map_res(hex_digit1, |s: &str| u32::from_str_radix(s, 16))(input)
}

fn dec_u32(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |s: &str| s.parse::<u32>())(input)
}

/// The remainder of the line, trailing whitespace removed.
fn name_rest(input: &str) -> IResult<&str, &str> {
    map(rest, |s: &str| s.trim_end())(input)
}

fn word(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_ascii_whitespace())(input)
}

/// `MODULE <os> <arch> <debug_id> <debug_file>`
fn module_line(input: &str) -> IResult<&str, ()> {
    let (input, _) = terminated(tag("MODULE"), space1)(input)?;
    let (input, (_os, _, _cpu, _, _id, _)) =
        tuple((word, space1, word, space1, hex_digit1, space1))(input)?;
    let (input, _name) = name_rest(input)?;
    Ok((input, ()))
}

/// `FILE <id> <path>`
fn file_line(input: &str) -> IResult<&str, (u32, &str)> {
    let (input, _) = terminated(tag("FILE"), space1)(input)?;
    let (input, id) = terminated(dec_u32, space1)(input)?;
    let (input, path) = name_rest(input)?;
    Ok((input, (id, path)))
}

/// `INLINE_ORIGIN <id> <name>`
fn inline_origin_line(input: &str) -> IResult<&str, (u32, &str)> {
    let (input, _) = terminated(tag("INLINE_ORIGIN"), space1)(input)?;
    let (input, id) = terminated(dec_u32, space1)(input)?;
    let (input, name) = name_rest(input)?;
    Ok((input, (id, name)))
}

/// `PUBLIC [m] <addr> <param_size> <name>`
fn public_line(input: &str) -> IResult<&str, PublicSymbol> {
    let (input, _) = terminated(tag("PUBLIC"), space1)(input)?;
    let (input, multiple) = opt(terminated(tag("m"), space1))(input)?;
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, parameter_size) = terminated(hex_u32, space1)(input)?;
    let (input, name) = name_rest(input)?;
    Ok((
        input,
        PublicSymbol {
            address,
            parameter_size,
            name: name.to_string(),
            is_multiple: multiple.is_some(),
        },
    ))
}

/// The header fields of a `FUNC [m] <addr> <size> <param_size> <name>`
/// record; lines and inlines attach afterwards.
#[derive(Debug)]
struct FuncRecord {
    address: u64,
    size: u32,
    parameter_size: u32,
    name: String,
    is_multiple: bool,
}

fn func_line(input: &str) -> IResult<&str, FuncRecord> {
    let (input, _) = terminated(tag("FUNC"), space1)(input)?;
    let (input, multiple) = opt(terminated(tag("m"), space1))(input)?;
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, size) = terminated(hex_u32, space1)(input)?;
    let (input, parameter_size) = terminated(hex_u32, space1)(input)?;
    let (input, name) = name_rest(input)?;
    Ok((
        input,
        FuncRecord {
            address,
            size,
            parameter_size,
            name: name.to_string(),
            is_multiple: multiple.is_some(),
        },
    ))
}

/// `<addr> <size> <line> <file_id>`, the implicit LINE record.
fn source_line(input: &str) -> IResult<&str, SourceLine> {
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, size) = terminated(hex_u32, space1)(input)?;
    let (input, line) = terminated(dec_u32, space1)(input)?;
    let (input, file) = dec_u32(input)?;
    Ok((
        input,
        SourceLine {
            address,
            size,
            file,
            line,
        },
    ))
}

/// `INLINE <depth> <call_site_line> <call_site_file_id> <origin_id> (<addr> <size>)+`
fn inline_line(input: &str) -> IResult<&str, (Inline, Vec<(u64, u32)>)> {
    let (input, _) = terminated(tag("INLINE"), space1)(input)?;
    let (input, depth) = terminated(dec_u32, space1)(input)?;
    let (input, call_site_line) = terminated(dec_u32, space1)(input)?;
    let (input, call_site_file) = terminated(dec_u32, space1)(input)?;
    let (input, origin_id) = dec_u32(input)?;
    let (input, ranges) = many1(preceded(space1, separated_pair(hex_u64, space1, hex_u32)))(input)?;
    Ok((
        input,
        (
            Inline {
                depth,
                call_site_line,
                call_site_file: Some(call_site_file),
                origin_id,
            },
            ranges,
        ),
    ))
}

/// `STACK WIN <type> <addr> <size> <prolog> <epilog> <params> <saved_regs>
///  <locals> <max_stack> <has_prog_string> <prog_string_or_allocates_bp>`
fn stack_win_line(input: &str) -> IResult<&str, WinFrameType> {
    let (input, _) = terminated(tag("STACK WIN"), space1)(input)?;
    let (input, ty) = terminated(hex_u32, space1)(input)?;
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, size) = terminated(hex_u32, space1)(input)?;
    let (input, prologue_size) = terminated(hex_u32, space1)(input)?;
    let (input, epilogue_size) = terminated(hex_u32, space1)(input)?;
    let (input, parameter_size) = terminated(hex_u32, space1)(input)?;
    let (input, saved_register_size) = terminated(hex_u32, space1)(input)?;
    let (input, local_size) = terminated(hex_u32, space1)(input)?;
    let (input, max_stack_size) = terminated(hex_u32, space1)(input)?;
    let (input, has_program_string) =
        terminated(map(digit1, |s: &str| s == "1"), space1)(input)?;
    let (input, tail) = name_rest(input)?;

    let program_string_or_base_pointer = if has_program_string {
        WinStackThing::ProgramString(tail.to_string())
    } else {
        WinStackThing::AllocatesBasePointer(tail == "1")
    };
    let info = StackInfoWin {
        address,
        size,
        prologue_size,
        epilogue_size,
        parameter_size,
        saved_register_size,
        local_size,
        max_stack_size,
        program_string_or_base_pointer,
    };
    let frame_type = match ty {
        4 => WinFrameType::FrameData(info),
        0 => WinFrameType::Fpo(info),
        _ => WinFrameType::Unhandled,
    };
    Ok((input, frame_type))
}

/// `STACK CFI INIT <addr> <size> <rules>`
fn stack_cfi_init_line(input: &str) -> IResult<&str, (u64, u32, &str)> {
    let (input, _) = terminated(tag("STACK CFI INIT"), space1)(input)?;
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, size) = terminated(hex_u32, space1)(input)?;
    let (input, rules) = name_rest(input)?;
    Ok((input, (address, size, rules)))
}

/// `STACK CFI <addr> <delta rules>`
fn stack_cfi_delta_line(input: &str) -> IResult<&str, (u64, &str)> {
    let (input, _) = terminated(tag("STACK CFI"), space1)(input)?;
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, rules) = name_rest(input)?;
    Ok((input, (address, rules)))
}

/// Build a `RangeMap` from possibly-overlapping entries.
///
/// Entries are ordered by range; when two ranges overlap, the first
/// survives and the rest are dropped. Returns whether anything other
/// than an exact duplicate had to be dropped.
fn into_rangemap_safe<V: Clone + Eq + std::fmt::Debug>(mut input: Vec<(Range<u64>, V)>) -> (RangeMap<u64, V>, bool) {
    input.sort_by_key(|(range, _)| (range.start, range.end));
    let mut out: Vec<(Range<u64>, V)> = vec![];
    let mut dropped = false;
    for (range, value) in input {
        if let Some((last_range, last_value)) = out.last() {
            if range.start <= last_range.end {
                if !(range == *last_range && value == *last_value) {
                    dropped = true;
                }
                continue;
            }
        }
        out.push((range, value));
    }
    (out.into_iter().collect(), dropped)
}

/// Incremental parser state. Feed it lines, then call
/// [`finish`](SymbolParser::finish).
#[derive(Default)]
pub struct SymbolParser {
    files: HashMap<u32, String>,
    inline_origins: HashMap<u32, String>,
    publics: Vec<PublicSymbol>,
    functions: Vec<(Range<u64>, Function)>,
    cur_func: Option<(FuncRecord, Vec<SourceLine>, Vec<(Inline, Vec<(u64, u32)>)>)>,
    stack_win_framedata: Vec<(Range<u64>, StackInfoWin)>,
    stack_win_fpo: Vec<(Range<u64>, StackInfoWin)>,
    cfi_init: Vec<(Range<u64>, CfiRules)>,
    cfi_deltas: BTreeMap<u64, String>,
    has_cfi_init: bool,
    records: u64,
    lines_seen: u64,
    is_corrupt: bool,
}

impl SymbolParser {
    pub fn new() -> SymbolParser {
        SymbolParser::default()
    }

    fn malformed(&mut self, what: &str) {
        debug!("malformed {} record at line {}, skipping", what, self.lines_seen);
        self.is_corrupt = true;
    }

    /// Consume one line of input, without its terminator.
    pub fn handle_line(&mut self, line: &str) {
        self.lines_seen += 1;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return;
        }
        let keyword = line.split_ascii_whitespace().next().unwrap_or("");
        match keyword {
            "MODULE" => match module_line(line) {
                Ok(_) => self.records += 1,
                Err(_) => self.malformed("MODULE"),
            },
            "INFO" => {
                // Recognized but carries nothing we need.
                self.records += 1;
            }
            "FILE" => match file_line(line) {
                Ok((_, (id, path))) => {
                    self.records += 1;
                    if self.files.contains_key(&id) {
                        self.malformed("duplicate FILE");
                    } else {
                        self.files.insert(id, path.to_string());
                    }
                }
                Err(_) => self.malformed("FILE"),
            },
            "INLINE_ORIGIN" => match inline_origin_line(line) {
                Ok((_, (id, name))) => {
                    self.records += 1;
                    if self.inline_origins.contains_key(&id) {
                        self.malformed("duplicate INLINE_ORIGIN");
                    } else {
                        self.inline_origins.insert(id, name.to_string());
                    }
                }
                Err(_) => self.malformed("INLINE_ORIGIN"),
            },
            "PUBLIC" => match public_line(line) {
                Ok((_, public)) => {
                    self.records += 1;
                    self.publics.push(public);
                }
                Err(_) => self.malformed("PUBLIC"),
            },
            "FUNC" => {
                self.finalize_function();
                match func_line(line) {
                    Ok((_, func)) => {
                        self.records += 1;
                        self.cur_func = Some((func, vec![], vec![]));
                    }
                    Err(_) => self.malformed("FUNC"),
                }
            }
            "INLINE" => match inline_line(line) {
                Ok((_, record)) => {
                    self.records += 1;
                    match self.cur_func.as_mut() {
                        Some((_, _, inlines)) => inlines.push(record),
                        None => self.malformed("INLINE outside FUNC"),
                    }
                }
                Err(_) => self.malformed("INLINE"),
            },
            "STACK" => self.handle_stack_line(line),
            _ => {
                if keyword.bytes().all(|b| b.is_ascii_hexdigit()) {
                    match source_line(line) {
                        Ok((_, src)) => {
                            self.records += 1;
                            match self.cur_func.as_mut() {
                                Some((_, lines, _)) => lines.push(src),
                                None => self.malformed("LINE outside FUNC"),
                            }
                        }
                        Err(_) => self.malformed("LINE"),
                    }
                } else {
                    warn!("unknown record keyword `{}`, ignoring", keyword);
                }
            }
        }
    }

    fn handle_stack_line(&mut self, line: &str) {
        if line.starts_with("STACK WIN") {
            match stack_win_line(line) {
                Ok((_, WinFrameType::FrameData(info))) => {
                    self.records += 1;
                    if let Some(range) = info.memory_range() {
                        self.stack_win_framedata.push((range, info));
                    }
                }
                Ok((_, WinFrameType::Fpo(info))) => {
                    self.records += 1;
                    if let Some(range) = info.memory_range() {
                        self.stack_win_fpo.push((range, info));
                    }
                }
                // Other frame types are parsed and dropped.
                Ok((_, WinFrameType::Unhandled)) => self.records += 1,
                Err(_) => self.malformed("STACK WIN"),
            }
        } else if line.starts_with("STACK CFI INIT") {
            match stack_cfi_init_line(line) {
                Ok((_, (address, size, rules))) => {
                    self.records += 1;
                    self.has_cfi_init = true;
                    if size > 0 {
                        if let Some(high) = address.checked_add(size as u64 - 1) {
                            self.cfi_init.push((
                                Range::new(address, high),
                                CfiRules {
                                    address,
                                    rules: rules.to_string(),
                                },
                            ));
                        }
                    }
                }
                Err(_) => self.malformed("STACK CFI INIT"),
            }
        } else if line.starts_with("STACK CFI") {
            match stack_cfi_delta_line(line) {
                Ok((_, (address, rules))) => {
                    self.records += 1;
                    if !self.has_cfi_init {
                        self.malformed("STACK CFI before any STACK CFI INIT");
                    } else if self.cfi_deltas.contains_key(&address) {
                        self.malformed("duplicate STACK CFI");
                    } else {
                        self.cfi_deltas.insert(address, rules.to_string());
                    }
                }
                Err(_) => self.malformed("STACK CFI"),
            }
        } else {
            warn!("unknown STACK record, ignoring");
        }
    }

    /// Fold the in-progress FUNC and its attached lines/inlines into a
    /// finished [`Function`].
    fn finalize_function(&mut self) {
        let Some((record, lines, mut inline_records)) = self.cur_func.take() else {
            return;
        };

        let mut line_ranges = vec![];
        for line in lines {
            // PDB line data often carries zero-size entries; drop them.
            if line.size == 0 {
                continue;
            }
            let Some(high) = line.address.checked_add(line.size as u64 - 1) else {
                self.malformed("LINE range");
                continue;
            };
            line_ranges.push((Range::new(line.address, high), line));
        }
        let (lines, dropped) = into_rangemap_safe(line_ranges);
        if dropped {
            self.malformed("overlapping LINE");
        }

        // Nested inlines carry strictly greater depths; inserting in
        // depth order keeps the containment map happy.
        inline_records.sort_by_key(|(inline, _)| inline.depth);
        let func_end = record.address.saturating_add(record.size as u64);
        let mut inlines = ContainedRangeMap::new();
        for (inline, ranges) in inline_records {
            for (address, size) in ranges {
                if size == 0 {
                    continue;
                }
                let Some(high) = address.checked_add(size as u64 - 1) else {
                    self.malformed("INLINE range");
                    continue;
                };
                if address < record.address || high >= func_end {
                    self.malformed("INLINE range outside FUNC");
                    continue;
                }
                if inlines.insert(address, high, inline.clone()).is_err() {
                    self.malformed("INLINE nesting");
                }
            }
        }

        let function = Function {
            address: record.address,
            size: record.size,
            parameter_size: record.parameter_size,
            name: record.name,
            is_multiple: record.is_multiple,
            lines,
            inlines,
        };
        match function.memory_range() {
            Some(range) => self.functions.push((range, function)),
            None => self.malformed("zero-size FUNC"),
        }
    }

    /// Produce the finished [`SymbolFile`].
    pub fn finish(mut self) -> Result<SymbolFile, SymbolError> {
        self.finalize_function();
        if self.records == 0 {
            return Err(SymbolError::ParseError(
                "no recognizable records",
                self.lines_seen,
            ));
        }

        let mut publics = self.publics;
        publics.sort();
        // Several symbols may share an address; keep the first.
        publics.dedup_by(|a, b| a.address == b.address);

        let (functions, dropped) = into_rangemap_safe(self.functions);
        if dropped {
            self.is_corrupt = true;
        }
        let (cfi_initial_rules, dropped) = into_rangemap_safe(self.cfi_init);
        if dropped {
            self.is_corrupt = true;
        }
        let (win_stack_framedata_info, dropped) = into_rangemap_safe(self.stack_win_framedata);
        if dropped {
            self.is_corrupt = true;
        }
        let (win_stack_fpo_info, dropped) = into_rangemap_safe(self.stack_win_fpo);
        if dropped {
            self.is_corrupt = true;
        }

        Ok(SymbolFile {
            files: self.files,
            inline_origins: self.inline_origins,
            publics,
            functions,
            cfi_initial_rules,
            cfi_delta_rules: self.cfi_deltas,
            win_stack_framedata_info,
            win_stack_fpo_info,
            is_corrupt: self.is_corrupt,
        })
    }
}

/// Parse a symbol file held in memory.
pub fn parse_symbol_bytes(bytes: &[u8]) -> Result<SymbolFile, SymbolError> {
    let mut parser = SymbolParser::new();
    for line in bytes.split(|&b| b == b'\n') {
        parser.handle_line(&String::from_utf8_lossy(line));
    }
    parser.finish()
}

/// Parse a symbol file from disk, streaming line by line.
pub fn parse_symbol_file(path: &Path) -> Result<SymbolFile, SymbolError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut parser = SymbolParser::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        parser.handle_line(&String::from_utf8_lossy(&line));
    }
    parser.finish()
}
