//! Evaluation of register-recovery rules against a callee frame.
//!
//! Two rule languages live in symbol files:
//!
//! * `STACK CFI` rules are `REG: EXPR` pairs where `EXPR` is a postfix
//!   expression over u64 values. `.cfa` (canonical frame address) and
//!   `.ra` (return address) must always be recoverable; every other
//!   register is best-effort. The CFA is evaluated first and may be
//!   referenced by every later expression, but never by its own.
//!
//! * `STACK WIN` program strings extend the same postfix language with
//!   `=` assignment over a variable store seeded from the callee's
//!   registers and the frame-layout constants of the record. After
//!   evaluation, `$eip`/`$esp`/`$ebp`/`$ebx`/`$esi`/`$edi` hold the
//!   caller's registers.
//!
//! Supported operators: `+ - * / % @` (align) and unary `^`
//! (dereference through the walker's memory). Values are signed decimal
//! literals, `$`-prefixed or bare register names, `.cfa`, and `.undef`,
//! which poisons the expression.

use std::collections::HashMap;
use std::str::FromStr;

use tracing::{debug, trace};

use super::types::{CfiFrameRules, StackInfoWin, WinStackThing};
use crate::FrameWalker;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CfiReg<'a> {
    Cfa,
    Ra,
    Other(&'a str),
}

/// Split a `REG: EXPR REG: EXPR ...` rule string into its pairs,
/// merging into `out`. Later rules for the same register overwrite
/// earlier ones, which is exactly how delta records refine an initial
/// rule set.
fn split_rule_set<'a>(input: &'a str, out: &mut HashMap<CfiReg<'a>, &'a str>) -> Option<()> {
    // An ASCII format, so bytes == chars and substrings can be recovered
    // from pointer offsets into the original line.
    let base_addr = input.as_ptr() as usize;
    let mut cur_reg = None;
    let mut expr_first: Option<&str> = None;
    let mut expr_last: Option<&str> = None;
    for token in input.split_ascii_whitespace() {
        if let Some(token) = token.strip_suffix(':') {
            // A "REG:" token ends the previous expression.
            if let Some(reg) = cur_reg {
                let min_addr = expr_first?.as_ptr() as usize;
                let max_addr = expr_last?.as_ptr() as usize + expr_last?.len();
                out.insert(reg, &input[min_addr - base_addr..max_addr - base_addr]);
                expr_first = None;
                expr_last = None;
            }

            cur_reg = if token == ".cfa" {
                Some(CfiReg::Cfa)
            } else if token == ".ra" {
                Some(CfiReg::Ra)
            } else if let Some(token) = token.strip_prefix('$') {
                Some(CfiReg::Other(token))
            } else {
                // ARM-style name with no sigil.
                Some(CfiReg::Other(token))
            };
        } else {
            // The first token must declare a register.
            cur_reg.as_ref()?;
            if expr_first.is_none() {
                expr_first = Some(token);
            }
            expr_last = Some(token);
        }
    }

    let min_addr = expr_first?.as_ptr() as usize;
    let max_addr = expr_last?.as_ptr() as usize + expr_last?.len();
    out.insert(cur_reg?, &input[min_addr - base_addr..max_addr - base_addr]);
    Some(())
}

fn eval_cfi_expr(expr: &str, walker: &mut dyn FrameWalker, cfa: Option<u64>) -> Option<u64> {
    let mut stack: Vec<u64> = Vec::new();
    for token in expr.split_ascii_whitespace() {
        match token {
            "+" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_add(rhs));
            }
            "-" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_sub(rhs));
            }
            "*" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_mul(rhs));
            }
            "/" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 {
                    return None;
                }
                stack.push(lhs.wrapping_div(rhs));
            }
            "%" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 {
                    return None;
                }
                stack.push(lhs.wrapping_rem(rhs));
            }
            "@" => {
                // Truncate lhs to a multiple of rhs, a power of two.
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 || !rhs.is_power_of_two() {
                    return None;
                }
                stack.push(lhs & !(rhs - 1));
            }
            "^" => {
                let ptr = stack.pop()?;
                stack.push(walker.get_register_at_address(ptr)?);
            }
            ".cfa" => {
                // The CFA may not be used to compute itself.
                stack.push(cfa?);
            }
            ".undef" => return None,
            _ => {
                if let Some((_, reg)) = token.split_once('$') {
                    stack.push(walker.get_callee_register(reg)?);
                } else if let Ok(value) = i64::from_str(token) {
                    stack.push(value as u64);
                } else if let Some(value) = walker.get_callee_register(token) {
                    // Bare register name (ARM syntax).
                    stack.push(value);
                } else {
                    debug!("CFI expression eval failed, unknown token: {}", token);
                    return None;
                }
            }
        }
    }

    if stack.len() == 1 {
        stack.pop()
    } else {
        None
    }
}

/// Recover the caller's registers from an initial CFI rule set plus the
/// deltas that apply at the walker's address.
pub fn walk_with_stack_cfi(
    init: &str,
    deltas: &[&str],
    walker: &mut dyn FrameWalker,
) -> Option<()> {
    trace!("cfi: {}", init);
    let mut exprs = HashMap::new();
    split_rule_set(init, &mut exprs)?;
    for delta in deltas {
        trace!("cfi delta: {}", delta);
        split_rule_set(delta, &mut exprs)?;
    }

    // These two must be present or the rule set is malformed.
    let cfa_expr = exprs.remove(&CfiReg::Cfa)?;
    let ra_expr = exprs.remove(&CfiReg::Ra)?;

    let cfa = eval_cfi_expr(cfa_expr, walker, None)?;
    let ra = eval_cfi_expr(ra_expr, walker, Some(cfa))?;
    walker.set_cfa(cfa)?;
    walker.set_ra(ra)?;

    for (reg, expr) in exprs {
        if let CfiReg::Other(reg) = reg {
            // A failed rule only loses this register. Clear it so a
            // stale callee value is not silently forwarded.
            match eval_cfi_expr(expr, walker, Some(cfa)) {
                Some(val) => {
                    walker.set_caller_register(reg, val);
                }
                None => {
                    walker.clear_caller_register(reg);
                }
            }
        }
    }
    Some(())
}

/// Merge an initial rule set and deltas into owned per-register rules,
/// the transient form handed out by frame-info queries.
pub fn merge_cfi_rules(init: &str, deltas: &[&str]) -> Option<CfiFrameRules> {
    let mut exprs = HashMap::new();
    split_rule_set(init, &mut exprs)?;
    for delta in deltas {
        split_rule_set(delta, &mut exprs)?;
    }
    let cfa_rule = exprs.remove(&CfiReg::Cfa)?.to_string();
    let ra_rule = exprs.remove(&CfiReg::Ra)?.to_string();
    let mut register_rules: Vec<(String, String)> = exprs
        .into_iter()
        .map(|(reg, expr)| {
            let name = match reg {
                CfiReg::Other(name) => name.to_string(),
                // Cfa and Ra were removed above.
                _ => unreachable!(),
            };
            (name, expr.to_string())
        })
        .collect();
    register_rules.sort();
    Some(CfiFrameRules {
        cfa_rule,
        ra_rule,
        register_rules,
    })
}

enum WinVal<'a> {
    Var(&'a str),
    Int(u32),
    Undef,
}

impl<'a> WinVal<'a> {
    fn into_var(self) -> Option<&'a str> {
        if let WinVal::Var(var) = self {
            Some(var)
        } else {
            None
        }
    }
    fn into_int(self, vars: &HashMap<&'a str, u32>) -> Option<u32> {
        match self {
            WinVal::Var(var) => vars.get(&var).cloned(),
            WinVal::Int(int) => Some(int),
            WinVal::Undef => None,
        }
    }
}

fn win_frame_size(info: &StackInfoWin, grand_callee_parameter_size: u32) -> u32 {
    info.local_size + info.saved_register_size + grand_callee_parameter_size
}

fn eval_win_expr(expr: &str, info: &StackInfoWin, walker: &mut dyn FrameWalker) -> Option<()> {
    let mut vars: HashMap<&str, u32> = HashMap::new();

    let callee_esp = walker.get_callee_register("esp")? as u32;
    let callee_ebp = walker.get_callee_register("ebp")? as u32;
    let grand_callee_param_size = walker.get_grand_callee_parameter_size();
    let frame_size = win_frame_size(info, grand_callee_param_size);

    vars.insert("$esp", callee_esp);
    vars.insert("$ebp", callee_ebp);
    // Some program strings also want $ebx.
    if let Some(callee_ebx) = walker.get_callee_register("ebx") {
        vars.insert("$ebx", callee_ebx as u32);
    }

    let search_start = callee_esp + frame_size;
    trace!("raSearchStart: 0x{:08x}", search_start);

    vars.insert(".cbParams", info.parameter_size);
    vars.insert(".cbCalleeParams", grand_callee_param_size);
    vars.insert(".cbSavedRegs", info.saved_register_size);
    vars.insert(".cbLocals", info.local_size);
    vars.insert(".raSearch", search_start);
    vars.insert(".raSearchStart", search_start);

    let mut stack: Vec<WinVal> = Vec::new();

    for token in expr.split_ascii_whitespace() {
        match token {
            "+" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                stack.push(WinVal::Int(lhs.wrapping_add(rhs)));
            }
            "-" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                stack.push(WinVal::Int(lhs.wrapping_sub(rhs)));
            }
            "*" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                stack.push(WinVal::Int(lhs.wrapping_mul(rhs)));
            }
            "/" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                if rhs == 0 {
                    return None;
                }
                stack.push(WinVal::Int(lhs.wrapping_div(rhs)));
            }
            "%" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                if rhs == 0 {
                    return None;
                }
                stack.push(WinVal::Int(lhs.wrapping_rem(rhs)));
            }
            "@" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                if rhs == 0 || !rhs.is_power_of_two() {
                    return None;
                }
                stack.push(WinVal::Int(lhs & !(rhs - 1)));
            }
            "=" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?.into_var()?;
                if let WinVal::Undef = rhs {
                    vars.remove(&lhs);
                } else {
                    let value = rhs.into_int(&vars)?;
                    vars.insert(lhs, value);
                }
            }
            "^" => {
                let ptr = stack.pop()?.into_int(&vars)?;
                stack.push(WinVal::Int(
                    walker.get_register_at_address(ptr as u64)? as u32
                ));
            }
            ".undef" => stack.push(WinVal::Undef),
            _ => {
                if token.starts_with('$') || token.starts_with('.') {
                    stack.push(WinVal::Var(token));
                } else if let Ok(value) = i32::from_str(token) {
                    stack.push(WinVal::Int(value as u32));
                } else {
                    debug!("STACK WIN expression eval failed, unknown token: {}", token);
                    return None;
                }
            }
        }
    }

    let output_regs = ["$eip", "$esp", "$ebp", "$ebx", "$esi", "$edi"];
    for reg in &output_regs {
        if let Some(&val) = vars.get(reg) {
            walker.set_caller_register(&reg[1..], val as u64)?;
        }
    }
    Some(())
}

/// Unwind one x86 frame using a frame-data (`STACK WIN 4`) record.
pub fn walk_with_stack_win_framedata(
    info: &StackInfoWin,
    walker: &mut dyn FrameWalker,
) -> Option<()> {
    if let WinStackThing::ProgramString(ref expr) = info.program_string_or_base_pointer {
        trace!("framedata program: {}", expr);
        eval_win_expr(expr, info, walker)
    } else {
        None
    }
}

/// Unwind one x86 frame using an FPO (`STACK WIN 0`) record.
pub fn walk_with_stack_win_fpo(info: &StackInfoWin, walker: &mut dyn FrameWalker) -> Option<()> {
    if let WinStackThing::AllocatesBasePointer(allocates_base_pointer) =
        info.program_string_or_base_pointer
    {
        trace!("fpo record");
        let grand_callee_param_size = walker.get_grand_callee_parameter_size();
        let frame_size = win_frame_size(info, grand_callee_param_size) as u64;

        let callee_esp = walker.get_callee_register("esp")?;
        let eip_address = callee_esp + frame_size;
        let caller_eip = walker.get_register_at_address(eip_address)?;
        let caller_esp = callee_esp + frame_size + 4;

        let caller_ebp = if allocates_base_pointer {
            let ebp_address =
                callee_esp + grand_callee_param_size as u64 + info.saved_register_size as u64 - 8;
            walker.get_register_at_address(ebp_address)?
        } else {
            // Functions that do not use ebp leave the caller's intact.
            // ebx is commonly unmodified across thin forwarding
            // functions, so propagate it too.
            if let Some(callee_ebx) = walker.get_callee_register("ebx") {
                walker.set_caller_register("ebx", callee_ebx)?;
            }
            walker.get_callee_register("ebp")?
        };

        walker.set_caller_register("eip", caller_eip)?;
        walker.set_caller_register("esp", caller_esp)?;
        walker.set_caller_register("ebp", caller_ebp)?;
        Some(())
    } else {
        None
    }
}
