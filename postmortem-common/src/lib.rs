//! Types shared by the `postmortem-symbols` and `postmortem-processor`
//! crates: the [`Module`] identity trait and the system description that
//! accompanies every symbol request.

pub mod system_info;
pub mod traits;

pub use system_info::{Cpu, Os, PointerWidth, SystemInfo};
pub use traits::{range_contains, Module};
