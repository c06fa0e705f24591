//! The top-level driver: iterate a dump's threads, walk and symbolize
//! each one, and collect the results into a [`ProcessState`].

use std::collections::BTreeSet;

use tracing::{trace, warn};

use postmortem_common::Cpu;
use postmortem_symbols::Symbolizer;

use crate::dump::{DumpAccess, StreamAccess};
use crate::exception;
use crate::memory::MemoryBlock;
use crate::process_state::{CallStack, CallStackInfo, Exploitability, ProcessState};
use crate::stackwalker::{walk_stack, WalkOptions};

/// Why a dump could not be processed at all. Anything recoverable (bad
/// symbol records, unwalkable frames, missing symbols) never produces
/// one of these; they mean the dump itself is unusable or the supplier
/// asked us to stop.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProcessError {
    #[error("the dump could not be read")]
    DumpNotFound,
    #[error("the dump has no header")]
    NoHeader,
    #[error("the thread list stream was not found")]
    NoThreadList,
    #[error("the memory list stream was not found")]
    NoMemoryList,
    #[error("the system information stream was not found")]
    NoSystemInfo,
    #[error("the exception or assertion stream could not be read")]
    NoExceptionOrAssertion,
    #[error("the symbol supplier interrupted processing")]
    SymbolSupplierInterrupted,
}

/// Configuration of the processor's exact behaviour.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct ProcessorOptions {
    /// Limits applied while walking each thread.
    pub walk_options: WalkOptions,
}

/// Process `dump` with default options.
pub fn process_dump(
    dump: &impl DumpAccess,
    symbolizer: &Symbolizer,
) -> Result<ProcessState, ProcessError> {
    process_dump_with_options(dump, symbolizer, &ProcessorOptions::default())
}

fn walker_exists_for(cpu: Cpu) -> bool {
    matches!(
        cpu,
        Cpu::X86
            | Cpu::X86_64
            | Cpu::Arm
            | Cpu::Arm64
            | Cpu::Mips
            | Cpu::Mips64
            | Cpu::Ppc
            | Cpu::Ppc64
            | Cpu::Riscv64
    )
}

/// Process `dump`, unwinding and symbolizing every thread.
///
/// The symbolizer's supplier is consulted at most once per module for
/// this call; a fresh call consults it again.
pub fn process_dump_with_options(
    dump: &impl DumpAccess,
    symbolizer: &Symbolizer,
    options: &ProcessorOptions,
) -> Result<ProcessState, ProcessError> {
    if !dump.read_ok() {
        return Err(ProcessError::DumpNotFound);
    }
    let header = dump.header().ok_or(ProcessError::NoHeader)?;
    let system_info = dump.system_info().ok_or(ProcessError::NoSystemInfo)?.clone();
    let threads = dump.threads().ok_or(ProcessError::NoThreadList)?;
    let memory_list = dump.memory_list().ok_or(ProcessError::NoMemoryList)?;

    let (exception_info, exception_unreadable) = match dump.exception() {
        StreamAccess::Found(info) => (Some(info), false),
        StreamAccess::Missing => (None, false),
        StreamAccess::Unreadable => (None, true),
    };
    let (assertion_info, assertion_unreadable) = match dump.assertion() {
        StreamAccess::Found(info) => (Some(info), false),
        StreamAccess::Missing => (None, false),
        StreamAccess::Unreadable => (None, true),
    };
    // A dump with neither stream is a healthy non-crash dump, but a
    // stream we can see and not read invalidates the whole dump.
    if (exception_unreadable && assertion_info.is_none())
        || (assertion_unreadable && exception_info.is_none())
    {
        return Err(ProcessError::NoExceptionOrAssertion);
    }

    let (crash_reason, crash_address, crashing_thread_id) = match exception_info {
        Some(info) => (
            Some(exception::crash_reason(system_info.os, info)),
            Some(exception::crash_address(
                system_info.os,
                system_info.cpu,
                info,
            )),
            Some(info.thread_id),
        ),
        None => (None, None, None),
    };
    let assertion = assertion_info.map(|info| match (&info.file, info.line) {
        (Some(file), line) if line > 0 => {
            format!("{} at {}:{}", info.expression, file, line)
        }
        _ => info.expression.clone(),
    });

    let process_create_time = dump.misc_info().and_then(|info| info.process_create_time);

    symbolizer.begin_dump(&system_info);

    let cpu_supported = walker_exists_for(system_info.cpu);
    if !cpu_supported {
        warn!("no stack walker for cpu {}", system_info.cpu);
    }

    let modules = dump.modules();
    let unloaded_modules = dump.unloaded_modules();

    let mut stacks = Vec::with_capacity(threads.len());
    let mut requesting_thread = None;
    for (i, thread) in threads.iter().enumerate() {
        trace!("walking thread {} ({})", i, thread.thread_id);
        if !cpu_supported {
            stacks.push(CallStack::with_info(
                thread.thread_id,
                CallStackInfo::UnsupportedCpu,
            ));
            continue;
        }

        // The exception record's context describes the crash itself;
        // the crashed thread's own context usually describes the dump
        // writer. Prefer the former.
        let context = if crashing_thread_id == Some(thread.thread_id) {
            requesting_thread = Some(i);
            exception_info
                .and_then(|info| info.context.as_ref())
                .or(thread.context.as_ref())
        } else {
            thread.context.as_ref()
        };

        let stack_memory: Option<&MemoryBlock> = thread.stack.as_ref().or_else(|| {
            memory_list
                .iter()
                .find(|block| block.contains(thread.stack_base))
        });

        let mut stack = walk_stack(
            thread.thread_id,
            context,
            stack_memory,
            modules,
            symbolizer,
            &options.walk_options,
        )
        .map_err(|_| ProcessError::SymbolSupplierInterrupted)?;

        // Frames with no loaded module may land in something that was
        // unloaded earlier; record every overlap and its offset.
        for frame in &mut stack.frames {
            if frame.module.is_none() {
                for unloaded in unloaded_modules.modules_at_address(frame.instruction) {
                    let offset = frame.instruction - unloaded.base;
                    frame
                        .unloaded_modules
                        .entry(unloaded.code_file.clone())
                        .or_insert_with(BTreeSet::new)
                        .insert(offset);
                }
            }
        }

        stacks.push(stack);
    }

    Ok(ProcessState {
        system_info,
        crash_reason,
        crash_address,
        assertion,
        time_date_stamp: header.time_date_stamp,
        process_create_time,
        requesting_thread,
        threads: stacks,
        modules: modules.clone(),
        unloaded_modules: unloaded_modules.clone(),
        exploitability: Exploitability::NotAnalyzed,
    })
}
