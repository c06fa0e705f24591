use std::collections::HashMap;

use test_assembler::*;

use postmortem_symbols::{StringSymbolSupplier, Symbolizer};

use crate::context::{Context, ContextAmd64, ContextValidity, RawContext};
use crate::dump::{DumpModule, ModuleList};
use crate::memory::MemoryBlock;
use crate::process_state::{CallStack, FrameTrust};
use crate::stackwalker::{walk_stack, WalkOptions};

struct TestFixture {
    pub raw: ContextAmd64,
    pub modules: ModuleList,
    pub symbols: HashMap<String, String>,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: ContextAmd64::default(),
            modules: ModuleList::new(vec![
                DumpModule::new(0x00007400c0000000, 0x10000, "module1"),
                DumpModule::new(0x00007500b0000000, 0x10000, "module2"),
            ]),
            symbols: HashMap::new(),
        }
    }

    pub fn walk_stack(&self, stack: Section) -> CallStack {
        let context = Context {
            raw: RawContext::Amd64(self.raw.clone()),
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
    stack.start().set_const(0x8000000080000000);
    stack = stack.D64(0).D64(0);
    f.raw.rip = 0x00007400c0000200;
    f.raw.rsp = 0x8000000080000000;
    f.raw.rbp = 0x8000000080000000;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 1);
    let frame = &s.frames[0];
    assert_eq!(frame.trust, FrameTrust::Context);
    assert_eq!(frame.module.as_ref().unwrap().code_file, "module1");
}

#[test]
fn test_frame_pointer_chain() {
    let mut f = TestFixture::new();
    let frame0_rbp = Label::new();
    let frame1_rbp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x8000000080000000);
    stack = stack
        .append_repeated(0, 16) // frame 0: space
        .mark(&frame0_rbp)
        .D64(&frame1_rbp) // frame 0: saved %rbp
        .D64(0x00007500b0000110u64) // frame 0: return address
        .append_repeated(0, 16) // frame 1: space
        .mark(&frame1_rbp)
        .D64(0) // saved %rbp (stack end)
        .D64(0); // return address (stack end)

    f.raw.rip = 0x00007400c0000200;
    f.raw.rsp = stack.start().value().unwrap();
    f.raw.rbp = frame0_rbp.value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    {
        let f0 = &s.frames[0];
        assert_eq!(f0.trust, FrameTrust::Context);
        assert_eq!(f0.instruction, 0x00007400c0000200);
    }
    {
        let f1 = &s.frames[1];
        assert_eq!(f1.trust, FrameTrust::FramePointer);
        assert_eq!(f1.instruction + 1, 0x00007500b0000110);
        let ctx = f1.context.as_ref().unwrap();
        assert_eq!(ctx.get_stack_pointer(), frame0_rbp.value().unwrap() + 16);
        if let RawContext::Amd64(raw) = &ctx.raw {
            assert_eq!(raw.rbp, frame1_rbp.value().unwrap());
        } else {
            unreachable!();
        }
    }
}

#[test]
fn test_scan_without_symbols() {
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x8000000080000000u64;
    stack.start().set_const(stack_start);
    stack = stack
        .D64(0x00007400b0000000u64) // junk that's not a return address
        .D64(0x0000750000000001u64) // more junk
        .D64(0x00007500b0000110u64) // return address into module2
        .append_repeated(0, 16)
        .D64(0)
        .D64(0);

    f.raw.rip = 0x00007400c0000200;
    f.raw.rsp = stack_start;
    // A garbage frame pointer forces scanning.
    f.raw.rbp = 0xd43eed6e2892dc4c;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::Scan);
    assert_eq!(f1.instruction + 1, 0x00007500b0000110);
    assert_eq!(f1.module.as_ref().unwrap().code_file, "module2");
}

#[test]
fn test_cfi_rules() {
    let mut f = TestFixture::new();
    f.add_symbols(
        "module1",
        "MODULE Linux x86_64 ffff0000 module1
FILE 0 a.c
FUNC 200 100 0 cfi_func
200 100 1 0
STACK CFI INIT 200 100 .cfa: $rsp 16 + .ra: .cfa -8 + ^ $rbx: .cfa -16 + ^
",
    );
    let mut stack = Section::new();
    let stack_start = 0x8000000080000000u64;
    stack.start().set_const(stack_start);

    const CALLER_RBX: u64 = 0x1122334455667788;
    stack = stack
        .D64(CALLER_RBX) // cfa - 16: saved %rbx
        .D64(0x00007400c0001010u64) // cfa - 8: return address
        .append_repeated(0, 32); // caller frame

    f.raw.rip = 0x00007400c0000250;
    f.raw.rsp = stack_start;
    f.raw.rbx = 0xbad;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::CallFrameInfo);
    let ctx = f1.context.as_ref().unwrap();
    assert_eq!(ctx.get_instruction_pointer(), 0x00007400c0001010);
    assert_eq!(ctx.get_stack_pointer(), stack_start + 16);
    if let RawContext::Amd64(raw) = &ctx.raw {
        assert_eq!(raw.rbx, CALLER_RBX);
    } else {
        unreachable!();
    }
    if let ContextValidity::Some(which) = &ctx.valid {
        assert!(which.contains("rbx"));
    } else {
        unreachable!();
    }
}
