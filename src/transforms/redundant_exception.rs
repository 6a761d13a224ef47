//! Drops `RuntimeException` ranges from methods that end by throwing.

use crate::error::Result;
use crate::opcodes::ATHROW;
use crate::pipeline::{StageContext, Transform};
use crate::program::{Code, MethodUnit};

use super::RUNTIME_EXCEPTION;

/// Removes the `RuntimeException` ranges of `code` if its last real
/// instruction is `ATHROW`.
pub fn remove_redundant_ranges(code: &mut Code) -> usize {
    let list = &code.instructions;
    let throws = list
        .last()
        .and_then(|last| {
            if list.get(last).is_real() {
                Some(last)
            } else {
                list.prev_real(last)
            }
        })
        .map_or(false, |last| list.get(last).opcode() == Some(ATHROW));
    if !throws {
        return 0;
    }

    let before = code.exception_ranges.len();
    code.exception_ranges
        .retain(|range| range.catch_type.as_deref() != Some(RUNTIME_EXCEPTION));
    before - code.exception_ranges.len()
}

fn redundant_exception(_: &MethodUnit, code: &mut Code, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let removed = remove_redundant_ranges(code);
    ctx.stats.add("removed_ranges", removed);
    Ok(removed > 0)
}

pub static REDUNDANT_EXCEPTION: Transform = Transform {
    code: Some(redundant_exception),
    ..Transform::new("redundant-exception")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{Insn, InstructionList};
    use crate::opcodes::*;
    use crate::program::ExceptionRange;

    fn code(last: u8) -> Code {
        let mut list = InstructionList::new();
        let start = list.push_label();
        list.push(Insn::Simple(ACONST_NULL));
        let end = list.push_label();
        list.push(Insn::Simple(last));
        let handler = list.push_label();
        list.push(Insn::Simple(ATHROW));
        if last != ATHROW {
            list.push(Insn::Simple(RETURN));
        }
        list.push_label();

        let range = |catch_type: Option<&str>| ExceptionRange {
            start,
            end,
            handler,
            catch_type: catch_type.map(str::to_string),
        };
        Code {
            instructions: list,
            exception_ranges: vec![range(Some(RUNTIME_EXCEPTION)), range(None)],
            ..Code::default()
        }
    }

    #[test]
    fn throwing_methods_lose_runtime_exception_ranges() {
        let mut code = code(ATHROW);
        assert_eq!(remove_redundant_ranges(&mut code), 1);
        assert_eq!(code.exception_ranges.len(), 1);
        assert_eq!(code.exception_ranges[0].catch_type, None);
    }

    #[test]
    fn returning_methods_are_untouched() {
        let mut code = code(POP);
        assert_eq!(remove_redundant_ranges(&mut code), 0);
        assert_eq!(code.exception_ranges.len(), 2);
    }
}
