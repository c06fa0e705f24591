use std::collections::HashMap;

use test_assembler::*;

use postmortem_symbols::{StringSymbolSupplier, Symbolizer};

use crate::context::{Context, ContextValidity, ContextX86, RawContext};
use crate::dump::{DumpModule, ModuleList};
use crate::memory::MemoryBlock;
use crate::process_state::{CallStack, FrameTrust};
use crate::stackwalker::{walk_stack, WalkOptions};

struct TestFixture {
    pub raw: ContextX86,
    pub modules: ModuleList,
    pub symbols: HashMap<String, String>,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: ContextX86::default(),
            // Give the two modules reasonable standard locations and
            // names for tests to play with.
            modules: ModuleList::new(vec![
                DumpModule::new(0x40000000, 0x10000, "module1"),
                DumpModule::new(0x50000000, 0x10000, "module2"),
            ]),
            symbols: HashMap::new(),
        }
    }

    pub fn walk_stack(&self, stack: Section) -> CallStack {
        let context = Context {
            raw: RawContext::X86(self.raw.clone()),
            valid: ContextValidity::All,
        };
        let base = stack.start().value().unwrap();
        let stack_memory = MemoryBlock::new(base, stack.get_contents().unwrap());
        let symbolizer = Symbolizer::new(StringSymbolSupplier::new(self.symbols.clone()));
        walk_stack(
            0,
            Some(&context),
            Some(&stack_memory),
            &self.modules,
            &symbolizer,
            &WalkOptions::default(),
        )
        .unwrap()
    }

    pub fn add_symbols(&mut self, name: &str, symbols: &str) {
        self.symbols.insert(name.to_string(), symbols.to_string());
    }
}

#[test]
fn test_simple() {
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack.D32(0).D32(0); // end-of-stack marker
    f.raw.eip = 0x40000200;
    f.raw.esp = 0x80000000;
    f.raw.ebp = 0x80000000;
    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 1);
    let frame = &s.frames[0];
    assert_eq!(frame.trust, FrameTrust::Context);
    assert_eq!(frame.module.as_ref().unwrap().code_file, "module1");
}

// A traditional frame saves the caller's %ebp just below the return
// address and points its own %ebp at the saved copy.
#[test]
fn test_traditional() {
    let mut f = TestFixture::new();
    let frame0_ebp = Label::new();
    let frame1_ebp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .append_repeated(0, 12) // frame 0: space
        .mark(&frame0_ebp) // frame 0 %ebp points here
        .D32(&frame1_ebp) // frame 0: saved %ebp
        .D32(0x40008679) // frame 0: return address
        .append_repeated(0, 8) // frame 1: space
        .mark(&frame1_ebp) // frame 1 %ebp points here
        .D32(0) // frame 1: saved %ebp (stack end)
        .D32(0); // frame 1: return address (stack end)
    f.raw.eip = 0x4000c7a5;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.ebp = frame0_ebp.value().unwrap() as u32;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    {
        let f0 = &s.frames[0];
        assert_eq!(f0.trust, FrameTrust::Context);
        assert_eq!(f0.instruction, 0x4000c7a5);
    }
    {
        let f1 = &s.frames[1];
        assert_eq!(f1.trust, FrameTrust::FramePointer);
        // The return address points after the CALL; the lookup address
        // must point inside it.
        assert_eq!(f1.instruction, 0x40008678);
        let ctx = f1.context.as_ref().unwrap();
        assert_eq!(ctx.get_instruction_pointer(), 0x40008679);
        assert_eq!(
            ctx.get_stack_pointer(),
            frame0_ebp.value().unwrap() + 8
        );
    }
}

// A bogus %ebp forces a scan of the stack for something that looks
// like a return address.
#[test]
fn test_traditional_scan() {
    let mut f = TestFixture::new();
    let frame1_ebp = Label::new();
    let mut stack = Section::new();
    let stack_start = 0x80000000;
    stack.start().set_const(stack_start);
    stack = stack
        // frame 0
        .D32(0xf065dc76u32) // locals area:
        .D32(0x46ee2167u32) // garbage that doesn't look like
        .D32(0xbab023ecu32) // a return address
        .D32(&frame1_ebp) // a saved %ebp that %ebp fails to point at
        .D32(0x4000129d) // return address
        // frame 1
        .append_repeated(0, 8) // space
        .mark(&frame1_ebp) // %ebp points here
        .D32(0) // saved %ebp (stack end)
        .D32(0); // return address (stack end)

    f.raw.eip = 0x4000f49d;
    f.raw.esp = stack.start().value().unwrap() as u32;
    // Make the frame pointer bogus so the walker must scan.
    f.raw.ebp = 0xd43eed6e;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    {
        let f0 = &s.frames[0];
        assert_eq!(f0.trust, FrameTrust::Context);
        assert_eq!(f0.instruction, 0x4000f49d);
    }
    {
        let f1 = &s.frames[1];
        // No symbols are present, so the call-site pass finds nothing
        // and the plain scan wins.
        assert_eq!(f1.trust, FrameTrust::Scan);
        assert_eq!(f1.instruction + 1, 0x4000129d);
        if let ContextValidity::Some(which) = &f1.context.as_ref().unwrap().valid {
            assert!(which.contains("eip"));
            assert!(which.contains("esp"));
        } else {
            unreachable!();
        }
    }
}

// With symbols covering the call site, the scan's prologue pass wins
// and earns more trust than a plain scan.
#[test]
fn test_scan_with_symbols() {
    let mut f = TestFixture::new();
    f.add_symbols(
        "module1",
        "MODULE Linux x86 ffff0000 module1\nFILE 0 a.c\nFUNC 1280 40 0 caller_func\n1280 40 10 0\n",
    );
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .D32(0xbab023ecu32) // garbage
        .D32(0x4000129d) // return address into caller_func
        .append_repeated(0, 16)
        .D32(0)
        .D32(0);

    f.raw.eip = 0x4000f49d;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.ebp = 0xd43eed6e;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::ScanPrologue);
    assert_eq!(f1.instruction, 0x4000129c);
    assert_eq!(f1.function_name.as_deref(), Some("caller_func"));
}

#[test]
fn test_cfi() {
    let mut f = TestFixture::new();
    f.add_symbols(
        "module1",
        "MODULE Linux x86 ffff0000 module1
FILE 0 a.c
FUNC 4000 100 0 cfi_func
4000 100 1 0
STACK CFI INIT 4000 100 .cfa: $esp 8 + .ra: .cfa 4 - ^
",
    );
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .D32(0) // frame 0: space
        .D32(0x40005510) // .ra lives at cfa - 4
        .append_repeated(0, 16); // caller frame, enough to look valid

    f.raw.eip = 0x40004010;
    f.raw.esp = stack.start().value().unwrap() as u32;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    {
        let f0 = &s.frames[0];
        assert_eq!(f0.trust, FrameTrust::Context);
        assert_eq!(f0.function_name.as_deref(), Some("cfi_func"));
    }
    {
        let f1 = &s.frames[1];
        assert_eq!(f1.trust, FrameTrust::CallFrameInfo);
        assert_eq!(f1.instruction, 0x4000550f);
        let ctx = f1.context.as_ref().unwrap();
        assert_eq!(ctx.get_instruction_pointer(), 0x40005510);
        assert_eq!(ctx.get_stack_pointer(), 0x80000008);
    }
}

#[test]
fn test_stack_win_frame_data() {
    let mut f = TestFixture::new();
    // The classic framedata program for a standard prologue.
    f.add_symbols(
        "module1",
        "MODULE Windows x86 ffff0000 module1
FILE 0 a.c
FUNC 4000 100 0 win_func
4000 100 1 0
STACK WIN 4 4000 100 4 4 0 4 8 0 1 $T0 $ebp = $eip $T0 4 + ^ = $ebp $T0 ^ = $esp $T0 8 + =
",
    );
    let frame0_ebp = Label::new();
    let frame1_ebp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .append_repeated(0, 8) // frame 0: locals
        .mark(&frame0_ebp)
        .D32(&frame1_ebp) // saved %ebp
        .D32(0x40005510) // return address
        .append_repeated(0, 16)
        .mark(&frame1_ebp)
        .D32(0)
        .D32(0);

    f.raw.eip = 0x40004010;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.ebp = frame0_ebp.value().unwrap() as u32;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::CallFrameInfo);
    let ctx = f1.context.as_ref().unwrap();
    assert_eq!(ctx.get_instruction_pointer(), 0x40005510);
    assert_eq!(ctx.get_stack_pointer(), frame0_ebp.value().unwrap() + 8);
    if let RawContext::X86(raw) = &ctx.raw {
        assert_eq!(raw.ebp as u64, frame1_ebp.value().unwrap());
    } else {
        unreachable!();
    }
}

#[test]
fn test_frame_limit() {
    // An endless chain of identical frames stops at the configured cap.
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    // A self-perpetuating stack: every scan hit yields another plausible
    // return address right above it.
    for _ in 0..600 {
        stack = stack.D32(0x40000300);
    }
    f.raw.eip = 0x40000200;
    f.raw.esp = 0x80000000;
    f.raw.ebp = 0;

    let context = Context {
        raw: RawContext::X86(f.raw.clone()),
        valid: ContextValidity::All,
    };
    let stack_memory = MemoryBlock::new(0x80000000, stack.get_contents().unwrap());
    let symbolizer = Symbolizer::new(StringSymbolSupplier::new(HashMap::new()));
    let options = WalkOptions {
        frame_limit: 100,
        ..WalkOptions::default()
    };
    let s = walk_stack(
        0,
        Some(&context),
        Some(&stack_memory),
        &f.modules,
        &symbolizer,
        &options,
    )
    .unwrap();
    assert_eq!(s.frames.len(), 100);
}

#[test]
fn test_scan_disabled() {
    // With scanning off and a bogus frame pointer there is nothing to
    // recover with.
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack.D32(0xbab023ecu32).D32(0x4000129d).append_repeated(0, 16);
    f.raw.eip = 0x4000f49d;
    f.raw.esp = 0x80000000;
    f.raw.ebp = 0xd43eed6e;

    let context = Context {
        raw: RawContext::X86(f.raw.clone()),
        valid: ContextValidity::All,
    };
    let stack_memory = MemoryBlock::new(0x80000000, stack.get_contents().unwrap());
    let symbolizer = Symbolizer::new(StringSymbolSupplier::new(HashMap::new()));
    let options = WalkOptions {
        allow_scan: false,
        ..WalkOptions::default()
    };
    let s = walk_stack(
        0,
        Some(&context),
        Some(&stack_memory),
        &f.modules,
        &symbolizer,
        &options,
    )
    .unwrap();
    assert_eq!(s.frames.len(), 1);
}
