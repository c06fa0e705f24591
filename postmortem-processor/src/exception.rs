//! Crash reason and crash address recovery from the exception record.
//!
//! Full OS error-code humanization lives outside this engine; this is
//! the minimal mapping the report format names, with a hex fallback for
//! everything else.

use postmortem_common::{Cpu, Os, PointerWidth};

use crate::dump::ExceptionInfo;

const EXCEPTION_ACCESS_VIOLATION: u32 = 0xc000_0005;
const EXCEPTION_IN_PAGE_ERROR: u32 = 0xc000_0006;
const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xc000_001d;
const EXCEPTION_INT_DIVIDE_BY_ZERO: u32 = 0xc000_0094;
const EXCEPTION_STACK_OVERFLOW: u32 = 0xc000_00fd;
const EXCEPTION_STACK_BUFFER_OVERRUN: u32 = 0xc000_0409;

/// Named FAST_FAIL subcodes of `STATUS_STACK_BUFFER_OVERRUN`, which
/// Windows reuses for every `__fastfail` invocation.
fn fast_fail_name(subcode: u64) -> Option<&'static str> {
    Some(match subcode {
        0 => "FAST_FAIL_LEGACY_GS_VIOLATION",
        1 => "FAST_FAIL_VTGUARD_CHECK_FAILURE",
        2 => "FAST_FAIL_STACK_COOKIE_CHECK_FAILURE",
        3 => "FAST_FAIL_CORRUPT_LIST_ENTRY",
        4 => "FAST_FAIL_INCORRECT_STACK",
        5 => "FAST_FAIL_INVALID_ARG",
        6 => "FAST_FAIL_GS_COOKIE_INIT",
        7 => "FAST_FAIL_FATAL_APP_EXIT",
        8 => "FAST_FAIL_RANGE_CHECK_FAILURE",
        _ => return None,
    })
}

fn windows_crash_reason(exception: &ExceptionInfo) -> String {
    let info = &exception.exception_information;
    match exception.code {
        EXCEPTION_ACCESS_VIOLATION => match info.first() {
            Some(0) => "EXCEPTION_ACCESS_VIOLATION_READ".to_string(),
            Some(1) => "EXCEPTION_ACCESS_VIOLATION_WRITE".to_string(),
            Some(8) => "EXCEPTION_ACCESS_VIOLATION_EXEC".to_string(),
            _ => "EXCEPTION_ACCESS_VIOLATION".to_string(),
        },
        EXCEPTION_IN_PAGE_ERROR => "EXCEPTION_IN_PAGE_ERROR".to_string(),
        EXCEPTION_BREAKPOINT => "EXCEPTION_BREAKPOINT".to_string(),
        EXCEPTION_SINGLE_STEP => "EXCEPTION_SINGLE_STEP".to_string(),
        EXCEPTION_ILLEGAL_INSTRUCTION => "EXCEPTION_ILLEGAL_INSTRUCTION".to_string(),
        EXCEPTION_INT_DIVIDE_BY_ZERO => "EXCEPTION_INT_DIVIDE_BY_ZERO".to_string(),
        EXCEPTION_STACK_OVERFLOW => "EXCEPTION_STACK_OVERFLOW".to_string(),
        EXCEPTION_STACK_BUFFER_OVERRUN => match info.first().copied().and_then(fast_fail_name) {
            Some(name) => name.to_string(),
            None => match info.first() {
                Some(subcode) => format!("FAST_FAIL_{subcode}"),
                None => "EXCEPTION_STACK_BUFFER_OVERRUN".to_string(),
            },
        },
        code => format!("0x{code:08x}"),
    }
}

fn posix_signal_name(signal: u32) -> Option<&'static str> {
    Some(match signal {
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        11 => "SIGSEGV",
        _ => return None,
    })
}

/// A displayable reason for the crash.
pub fn crash_reason(os: Os, exception: &ExceptionInfo) -> String {
    match os {
        Os::Windows => windows_crash_reason(exception),
        Os::Linux | Os::Android | Os::MacOs | Os::Ios | Os::Solaris => {
            match posix_signal_name(exception.code) {
                Some(name) => name.to_string(),
                None => format!("0x{:08x}", exception.code),
            }
        }
        _ => format!("0x{:08x}", exception.code),
    }
}

/// The address implicated in the crash.
///
/// For Windows access errors the faulting data address rides in the
/// second exception parameter; otherwise the recorded exception address
/// is used. The raw value then gets an architecture fixup: 32-bit
/// targets are zero-extended (some writers sign-extend them by
/// mistake), and 64-bit targets are re-canonicalized by sign-extending
/// from bit 62, recovering addresses whose top bit was dropped on the
/// way through a dump writer. Canonical user and kernel addresses pass
/// through unchanged.
pub fn crash_address(os: Os, cpu: Cpu, exception: &ExceptionInfo) -> u64 {
    let addr = match (os, exception.code) {
        (Os::Windows, EXCEPTION_ACCESS_VIOLATION) | (Os::Windows, EXCEPTION_IN_PAGE_ERROR)
            if exception.exception_information.len() >= 2 =>
        {
            exception.exception_information[1]
        }
        _ => exception.address,
    };
    match cpu.pointer_width() {
        PointerWidth::Bits32 => addr as u32 as u64,
        PointerWidth::Bits64 => ((addr as i64) << 1 >> 1) as u64,
        PointerWidth::Unknown => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exc(code: u32, info: Vec<u64>, address: u64) -> ExceptionInfo {
        ExceptionInfo {
            code,
            flags: 0,
            exception_information: info,
            address,
            thread_id: 0,
            context: None,
        }
    }

    #[test]
    fn test_access_violation_reasons() {
        let e = exc(EXCEPTION_ACCESS_VIOLATION, vec![1, 0x45], 0xdead);
        assert_eq!(
            crash_reason(Os::Windows, &e),
            "EXCEPTION_ACCESS_VIOLATION_WRITE"
        );
        assert_eq!(crash_address(Os::Windows, Cpu::X86, &e), 0x45);

        let e = exc(EXCEPTION_ACCESS_VIOLATION, vec![0, 0x45], 0xdead);
        assert_eq!(
            crash_reason(Os::Windows, &e),
            "EXCEPTION_ACCESS_VIOLATION_READ"
        );
    }

    #[test]
    fn test_fast_fail() {
        let e = exc(EXCEPTION_STACK_BUFFER_OVERRUN, vec![7], 0);
        assert_eq!(crash_reason(Os::Windows, &e), "FAST_FAIL_FATAL_APP_EXIT");
        let e = exc(EXCEPTION_STACK_BUFFER_OVERRUN, vec![77], 0);
        assert_eq!(crash_reason(Os::Windows, &e), "FAST_FAIL_77");
    }

    #[test]
    fn test_non_canonical_address_sign_extended() {
        let e = exc(
            EXCEPTION_ACCESS_VIOLATION,
            vec![1, 0x7efefefefefefefe],
            0xdead,
        );
        assert_eq!(
            crash_address(Os::Windows, Cpu::X86_64, &e),
            0xfefefefefefefefe
        );
        // Canonical addresses are untouched.
        let e = exc(EXCEPTION_ACCESS_VIOLATION, vec![1, 0x00007fff_12345678], 0);
        assert_eq!(
            crash_address(Os::Windows, Cpu::X86_64, &e),
            0x00007fff_12345678
        );
        let e = exc(EXCEPTION_ACCESS_VIOLATION, vec![1, 0xffff8000_00000000], 0);
        assert_eq!(
            crash_address(Os::Windows, Cpu::X86_64, &e),
            0xffff8000_00000000
        );
    }

    #[test]
    fn test_32bit_zero_extension() {
        let e = exc(EXCEPTION_ACCESS_VIOLATION, vec![1, 0xffffffff_80000045], 0);
        assert_eq!(crash_address(Os::Windows, Cpu::X86, &e), 0x80000045);
    }

    #[test]
    fn test_posix_signals() {
        let e = exc(11, vec![], 0x1234);
        assert_eq!(crash_reason(Os::Linux, &e), "SIGSEGV");
        assert_eq!(crash_address(Os::Linux, Cpu::X86_64, &e), 0x1234);
    }
}
