//! CPU register contexts, one per supported architecture.
//!
//! Walkers manipulate registers by name so that frame-info rules (which
//! name registers textually) and architecture-generic code can share one
//! interface. Registers are exchanged as `u64` regardless of the
//! architecture's word size; 32-bit contexts truncate on store.

use std::collections::HashSet;

use postmortem_common::Cpu;

/// Which registers of a context hold meaningful values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextValidity {
    /// All registers are valid.
    All,
    /// Only the named registers are valid.
    Some(HashSet<&'static str>),
}

impl ContextValidity {
    pub fn contains(&self, reg: &str) -> bool {
        match self {
            ContextValidity::All => true,
            ContextValidity::Some(which) => which.contains(reg),
        }
    }
}

/// Operations every architecture's register file supports.
pub trait CpuContext: Clone {
    /// The general-purpose register names of this architecture, in
    /// display order.
    fn register_names(&self) -> &'static [&'static str];

    /// Read a register, valid or not. Unknown names read as 0.
    fn get_register_always(&self, reg: &str) -> u64;

    /// Write a register by name; `None` when the name is unknown.
    fn set_register(&mut self, reg: &str, val: u64) -> Option<()>;

    /// Read a register only if `valid` covers it.
    fn get_register(&self, reg: &str, valid: &ContextValidity) -> Option<u64> {
        if valid.contains(reg) {
            Some(self.get_register_always(reg))
        } else {
            None
        }
    }

    /// Intern a register name into this architecture's static name
    /// table, for use as a validity-set member.
    fn memoize_register(&self, reg: &str) -> Option<&'static str> {
        self.register_names()
            .iter()
            .find(|&&name| name == reg)
            .copied()
    }

    fn instruction_pointer(&self) -> u64;
    fn stack_pointer(&self) -> u64;
}

/// x86 general-purpose registers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextX86 {
    pub eip: u32,
    pub esp: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub eflags: u32,
}

pub static X86_REGS: [&str; 10] = [
    "eip", "esp", "ebp", "ebx", "esi", "edi", "eax", "ecx", "edx", "efl",
];

impl CpuContext for ContextX86 {
    fn register_names(&self) -> &'static [&'static str] {
        &X86_REGS
    }

    fn get_register_always(&self, reg: &str) -> u64 {
        let val = match reg {
            "eip" => self.eip,
            "esp" => self.esp,
            "ebp" => self.ebp,
            "ebx" => self.ebx,
            "esi" => self.esi,
            "edi" => self.edi,
            "eax" => self.eax,
            "ecx" => self.ecx,
            "edx" => self.edx,
            "efl" => self.eflags,
            _ => 0,
        };
        val as u64
    }

    fn set_register(&mut self, reg: &str, val: u64) -> Option<()> {
        let val = val as u32;
        match reg {
            "eip" => self.eip = val,
            "esp" => self.esp = val,
            "ebp" => self.ebp = val,
            "ebx" => self.ebx = val,
            "esi" => self.esi = val,
            "edi" => self.edi = val,
            "eax" => self.eax = val,
            "ecx" => self.ecx = val,
            "edx" => self.edx = val,
            "efl" => self.eflags = val,
            _ => return None,
        }
        Some(())
    }

    fn instruction_pointer(&self) -> u64 {
        self.eip as u64
    }

    fn stack_pointer(&self) -> u64 {
        self.esp as u64
    }
}

/// x86-64 general-purpose registers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextAmd64 {
    pub rax: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

pub static AMD64_REGS: [&str; 17] = [
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip",
];

impl CpuContext for ContextAmd64 {
    fn register_names(&self) -> &'static [&'static str] {
        &AMD64_REGS
    }

    fn get_register_always(&self, reg: &str) -> u64 {
        match reg {
            "rax" => self.rax,
            "rdx" => self.rdx,
            "rcx" => self.rcx,
            "rbx" => self.rbx,
            "rsi" => self.rsi,
            "rdi" => self.rdi,
            "rbp" => self.rbp,
            "rsp" => self.rsp,
            "r8" => self.r8,
            "r9" => self.r9,
            "r10" => self.r10,
            "r11" => self.r11,
            "r12" => self.r12,
            "r13" => self.r13,
            "r14" => self.r14,
            "r15" => self.r15,
            "rip" => self.rip,
            _ => 0,
        }
    }

    fn set_register(&mut self, reg: &str, val: u64) -> Option<()> {
        match reg {
            "rax" => self.rax = val,
            "rdx" => self.rdx = val,
            "rcx" => self.rcx = val,
            "rbx" => self.rbx = val,
            "rsi" => self.rsi = val,
            "rdi" => self.rdi = val,
            "rbp" => self.rbp = val,
            "rsp" => self.rsp = val,
            "r8" => self.r8 = val,
            "r9" => self.r9 = val,
            "r10" => self.r10 = val,
            "r11" => self.r11 = val,
            "r12" => self.r12 = val,
            "r13" => self.r13 = val,
            "r14" => self.r14 = val,
            "r15" => self.r15 = val,
            "rip" => self.rip = val,
            _ => return None,
        }
        Some(())
    }

    fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    fn stack_pointer(&self) -> u64 {
        self.rsp
    }
}

/// A register file stored as an index-addressed array with a static
/// name table. Shared by the link-register architectures.
macro_rules! indexed_context {
    ($name:ident, $table:ident, $count:expr, $word:ty, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name {
            pub iregs: [$word; $count],
        }

        impl Default for $name {
            fn default() -> $name {
                $name {
                    iregs: [0; $count],
                }
            }
        }

        impl $name {
            fn index_of(reg: &str) -> Option<usize> {
                $table.iter().position(|&name| name == reg)
            }
        }

        impl CpuContext for $name {
            fn register_names(&self) -> &'static [&'static str] {
                &$table
            }

            fn get_register_always(&self, reg: &str) -> u64 {
                Self::index_of(Self::canonical(reg))
                    .map(|i| self.iregs[i] as u64)
                    .unwrap_or(0)
            }

            fn set_register(&mut self, reg: &str, val: u64) -> Option<()> {
                let i = Self::index_of(Self::canonical(reg))?;
                self.iregs[i] = val as $word;
                Some(())
            }

            fn memoize_register(&self, reg: &str) -> Option<&'static str> {
                let canonical = Self::canonical(reg);
                $table.iter().find(|&&name| name == canonical).copied()
            }

            fn instruction_pointer(&self) -> u64 {
                self.get_register_always("pc")
            }

            fn stack_pointer(&self) -> u64 {
                self.get_register_always("sp")
            }
        }
    };
}

pub static ARM_REGS: [&str; 16] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc",
];

indexed_context!(
    ContextArm,
    ARM_REGS,
    16,
    u32,
    "ARM (AArch32) general-purpose registers. `r11` is the frame pointer."
);

impl ContextArm {
    fn canonical(reg: &str) -> &str {
        match reg {
            "r13" => "sp",
            "r14" => "lr",
            "r15" => "pc",
            "fp" => "r11",
            other => other,
        }
    }
}

pub static ARM64_REGS: [&str; 33] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "lr", "sp", "pc",
];

indexed_context!(
    ContextArm64,
    ARM64_REGS,
    33,
    u64,
    "AArch64 general-purpose registers. `fp` is x29, `lr` is x30."
);

impl ContextArm64 {
    fn canonical(reg: &str) -> &str {
        match reg {
            "x29" => "fp",
            "x30" => "lr",
            other => other,
        }
    }
}

pub static MIPS_REGS: [&str; 33] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25", "r26", "r27",
    "gp", "sp", "fp", "ra", "pc",
];

indexed_context!(
    ContextMips,
    MIPS_REGS,
    33,
    u64,
    "MIPS general-purpose registers. `gp`/`sp`/`fp`/`ra` are r28-r31."
);

impl ContextMips {
    fn canonical(reg: &str) -> &str {
        match reg {
            "r28" => "gp",
            "r29" => "sp",
            "r30" => "fp",
            "r31" => "ra",
            other => other,
        }
    }
}

pub static PPC_REGS: [&str; 34] = [
    "r0", "sp", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25", "r26", "r27",
    "r28", "r29", "r30", "r31", "lr", "pc",
];

indexed_context!(
    ContextPpc64,
    PPC_REGS,
    34,
    u64,
    "PowerPC general-purpose registers. `sp` is r1; `pc` is srr0."
);

impl ContextPpc64 {
    fn canonical(reg: &str) -> &str {
        match reg {
            "r1" => "sp",
            "srr0" => "pc",
            other => other,
        }
    }
}

pub static RISCV64_REGS: [&str; 33] = [
    "pc", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5",
    "t6", "zero",
];

indexed_context!(
    ContextRiscv64,
    RISCV64_REGS,
    33,
    u64,
    "RISC-V general-purpose registers. `s0` is the frame pointer."
);

impl ContextRiscv64 {
    fn canonical(reg: &str) -> &str {
        match reg {
            "fp" | "x8" => "s0",
            "x1" => "ra",
            "x2" => "sp",
            other => other,
        }
    }
}

/// The CPU-specific register state of one thread or exception record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawContext {
    X86(ContextX86),
    Amd64(ContextAmd64),
    Arm(ContextArm),
    Arm64(ContextArm64),
    Mips(ContextMips),
    Ppc64(ContextPpc64),
    Riscv64(ContextRiscv64),
}

macro_rules! dispatch {
    ($self:expr, $ctx:ident => $body:expr) => {
        match $self {
            RawContext::X86($ctx) => $body,
            RawContext::Amd64($ctx) => $body,
            RawContext::Arm($ctx) => $body,
            RawContext::Arm64($ctx) => $body,
            RawContext::Mips($ctx) => $body,
            RawContext::Ppc64($ctx) => $body,
            RawContext::Riscv64($ctx) => $body,
        }
    };
}

impl RawContext {
    pub fn cpu(&self) -> Cpu {
        match self {
            RawContext::X86(_) => Cpu::X86,
            RawContext::Amd64(_) => Cpu::X86_64,
            RawContext::Arm(_) => Cpu::Arm,
            RawContext::Arm64(_) => Cpu::Arm64,
            RawContext::Mips(_) => Cpu::Mips,
            RawContext::Ppc64(_) => Cpu::Ppc64,
            RawContext::Riscv64(_) => Cpu::Riscv64,
        }
    }

    pub fn instruction_pointer(&self) -> u64 {
        dispatch!(self, ctx => ctx.instruction_pointer())
    }

    pub fn stack_pointer(&self) -> u64 {
        dispatch!(self, ctx => ctx.stack_pointer())
    }

    pub fn register_names(&self) -> &'static [&'static str] {
        dispatch!(self, ctx => ctx.register_names())
    }

    pub fn get_register_always(&self, reg: &str) -> u64 {
        dispatch!(self, ctx => ctx.get_register_always(reg))
    }
}

/// Register state plus a record of which registers can be trusted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Context {
    pub raw: RawContext,
    pub valid: ContextValidity,
}

impl Context {
    /// A context whose registers are all valid, as they come from a
    /// thread or exception record.
    pub fn from_raw(raw: RawContext) -> Context {
        Context {
            raw,
            valid: ContextValidity::All,
        }
    }

    pub fn get_instruction_pointer(&self) -> u64 {
        self.raw.instruction_pointer()
    }

    pub fn get_stack_pointer(&self) -> u64 {
        self.raw.stack_pointer()
    }

    /// Registers that are valid in this context, with their values, in
    /// display order.
    pub fn valid_registers(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.raw
            .register_names()
            .iter()
            .filter(|name| self.valid.contains(name))
            .map(|&name| (name, self.raw.get_register_always(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_roundtrip() {
        let mut ctx = ContextX86::default();
        ctx.set_register("eip", 0x1234).unwrap();
        ctx.set_register("esp", 0xf000).unwrap();
        assert_eq!(ctx.instruction_pointer(), 0x1234);
        assert_eq!(ctx.stack_pointer(), 0xf000);
        assert!(ctx.set_register("rax", 1).is_none());
        // 32-bit contexts truncate.
        ctx.set_register("eax", 0x1_0000_0001).unwrap();
        assert_eq!(ctx.get_register_always("eax"), 1);
    }

    #[test]
    fn test_arm64_aliases() {
        let mut ctx = ContextArm64::default();
        ctx.set_register("x29", 0xbeef).unwrap();
        assert_eq!(ctx.get_register_always("fp"), 0xbeef);
        ctx.set_register("lr", 0xcafe).unwrap();
        assert_eq!(ctx.get_register_always("x30"), 0xcafe);
    }

    #[test]
    fn test_validity() {
        let mut valid = HashSet::new();
        valid.insert("pc");
        let mut ctx = ContextRiscv64::default();
        ctx.set_register("pc", 5).unwrap();
        ctx.set_register("sp", 6).unwrap();
        let valid = ContextValidity::Some(valid);
        assert_eq!(ctx.get_register("pc", &valid), Some(5));
        assert_eq!(ctx.get_register("sp", &valid), None);
        assert_eq!(ctx.get_register("sp", &ContextValidity::All), Some(6));
    }

    #[test]
    fn test_memoize() {
        let ctx = ContextAmd64::default();
        assert_eq!(ctx.memoize_register("rip"), Some("rip"));
        assert_eq!(ctx.memoize_register("nope"), None);
    }
}
