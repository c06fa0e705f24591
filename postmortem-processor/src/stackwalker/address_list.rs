//! A degenerate walker for clients that already know their frame
//! addresses (e.g. a language runtime reporting its own stack). No
//! stack memory is touched and no frame info is evaluated; every frame
//! is taken on faith and marked accordingly.

use postmortem_symbols::{SupplierInterrupted, Symbolizer};

use crate::dump::ModuleList;
use crate::process_state::{CallStack, CallStackInfo, FrameTrust, StackFrame};
use crate::stackwalker::fill_frame_info;

/// Produce a stack with one `PreWalked` frame per supplied address,
/// preserving order. Frames are symbolized like any other, including
/// inline expansion.
pub fn walk_address_list(
    thread_id: u32,
    addresses: &[u64],
    modules: &ModuleList,
    symbolizer: &Symbolizer,
) -> Result<CallStack, SupplierInterrupted> {
    let mut stack = CallStack::with_info(thread_id, CallStackInfo::Ok);
    for &address in addresses {
        let mut frame = StackFrame::from_instruction(address, FrameTrust::PreWalked);
        fill_frame_info(&mut frame, modules, symbolizer)?;
        let inlines = std::mem::take(&mut frame.inlines);
        for inline in inlines {
            stack.frames.push(super::make_inline_frame(&frame, inline));
        }
        stack.frames.push(frame);
    }
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::DumpModule;
    use postmortem_symbols::{StringSymbolSupplier, Symbolizer};
    use std::collections::HashMap;

    #[test]
    fn test_prewalked_frames() {
        let modules = ModuleList::new(vec![DumpModule::new(0x40000000, 0x10000, "module1")]);
        let mut symbols = HashMap::new();
        symbols.insert(
            "module1".to_string(),
            "MODULE Linux x86 ffff0000 module1\nFILE 0 a.c\nFUNC 1000 100 0 known()\n1000 100 3 0\n"
                .to_string(),
        );
        let symbolizer = Symbolizer::new(StringSymbolSupplier::new(symbols));

        let addresses = [0x40001010, 0xdeadbeef, 0x40001020];
        let stack = walk_address_list(7, &addresses, &modules, &symbolizer).unwrap();

        assert_eq!(stack.frames.len(), 3);
        for (frame, &addr) in stack.frames.iter().zip(&addresses) {
            assert_eq!(frame.trust, FrameTrust::PreWalked);
            assert_eq!(frame.instruction, addr);
            assert!(frame.context.is_none());
        }
        assert_eq!(stack.frames[0].function_name.as_deref(), Some("known()"));
        assert!(stack.frames[1].function_name.is_none());
        assert!(stack.frames[1].module.is_none());
    }
}
