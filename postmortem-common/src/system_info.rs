//! Information about the system that produced a dump.

use std::fmt;

/// Known operating systems.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Os {
    Windows,
    MacOs,
    Ios,
    Linux,
    Solaris,
    Android,
    Ps3,
    NaCl,
    Unknown(u32),
}

impl Os {
    /// A long name, as seen in human-readable reports.
    pub fn long_name(self) -> &'static str {
        match self {
            Os::Windows => "Windows NT",
            Os::MacOs => "Mac OS X",
            Os::Ios => "iOS",
            Os::Linux => "Linux",
            Os::Solaris => "Solaris",
            Os::Android => "Android",
            Os::Ps3 => "PS3",
            Os::NaCl => "NaCl",
            Os::Unknown(_) => "unknown",
        }
    }

    /// The short name used in symbol paths and supplier queries.
    pub fn short_name(self) -> &'static str {
        match self {
            Os::Windows => "windows",
            Os::MacOs => "mac",
            Os::Ios => "ios",
            Os::Linux => "linux",
            Os::Solaris => "solaris",
            Os::Android => "android",
            Os::Ps3 => "ps3",
            Os::NaCl => "nacl",
            Os::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// The width of pointers for a [`Cpu`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PointerWidth {
    Bits32,
    Bits64,
    Unknown,
}

/// Known CPU architectures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cpu {
    X86,
    X86_64,
    Ppc,
    Ppc64,
    Sparc,
    Arm,
    Arm64,
    Mips,
    Mips64,
    Riscv64,
    Unknown(u32),
}

impl Cpu {
    pub fn pointer_width(self) -> PointerWidth {
        match self {
            Cpu::X86 | Cpu::Ppc | Cpu::Sparc | Cpu::Arm | Cpu::Mips => PointerWidth::Bits32,
            Cpu::X86_64 | Cpu::Ppc64 | Cpu::Arm64 | Cpu::Mips64 | Cpu::Riscv64 => {
                PointerWidth::Bits64
            }
            Cpu::Unknown(_) => PointerWidth::Unknown,
        }
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cpu::X86 => "x86",
            Cpu::X86_64 => "amd64",
            Cpu::Ppc => "ppc",
            Cpu::Ppc64 => "ppc64",
            Cpu::Sparc => "sparc",
            Cpu::Arm => "arm",
            Cpu::Arm64 => "arm64",
            Cpu::Mips => "mips",
            Cpu::Mips64 => "mips64",
            Cpu::Riscv64 => "riscv64",
            Cpu::Unknown(_) => "unknown",
        };
        f.write_str(name)
    }
}

/// A description of the system that wrote the dump, handed to the symbol
/// supplier alongside every request and recorded into the process state.
#[derive(Clone, Debug)]
pub struct SystemInfo {
    /// The operating system that wrote the dump.
    pub os: Os,
    /// A string identifying the version of the OS, e.g. "5.1.2600 Service Pack 2".
    pub os_version: Option<String>,
    /// The OS build number.
    pub os_build: Option<String>,
    /// The CPU on which the dump was produced.
    pub cpu: Cpu,
    /// A string describing the CPU, e.g. "GenuineIntel family 6 model 13 stepping 8".
    pub cpu_info: Option<String>,
    /// The number of processors in the system.
    pub cpu_count: usize,
}

impl SystemInfo {
    /// os_version and os_build joined into one displayable string.
    pub fn format_os_version(&self) -> Option<String> {
        match (&self.os_version, &self.os_build) {
            (Some(version), Some(build)) => Some(format!("{version} {build}")),
            (Some(version), None) => Some(version.clone()),
            (None, _) => None,
        }
    }
}
