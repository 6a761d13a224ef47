//! Reshapes `synchronized` blocks into the form compilers emit.
//!
//! Obfuscated builds end the catch-all range of a monitor block just before
//! `ALOAD MONITOREXIT`, and load the lock object back from a local instead of
//! duplicating it. Decompilers only recognize the compiler's shape.

use crate::error::Result;
use crate::insn::{Insn, InsnId, InstructionList};
use crate::matcher::InsnMatcher;
use crate::opcodes::{ALOAD, DUP, MONITORENTER, MONITOREXIT};
use crate::pipeline::{StageContext, Transform};
use crate::program::{Code, MethodUnit, Program};

const LOAD_BEFORE_ENTER: &str = "ASTORE ALOAD MONITORENTER";

#[derive(Default)]
pub struct MonitorState {
    load: Option<InsnMatcher>,
}

fn compile(_: &mut Program, ctx: &mut StageContext<'_, MonitorState>) -> Result<bool> {
    ctx.state.load = Some(InsnMatcher::compile(LOAD_BEFORE_ENTER)?);
    Ok(false)
}

fn opcode(list: &InstructionList, id: Option<InsnId>) -> Option<u8> {
    id.and_then(|id| list.get(id).opcode())
}

/// Extends catch-all ranges that open right after `MONITORENTER` and stop just
/// before `ALOAD MONITOREXIT` so they cover the exit too.
pub fn extend_ranges(code: &mut Code) -> usize {
    let mut extended = 0;
    for index in 0..code.exception_ranges.len() {
        let list = &code.instructions;
        let range = &code.exception_ranges[index];
        if range.catch_type.is_some() || opcode(list, list.prev_real(range.start.id())) != Some(MONITORENTER) {
            continue;
        }
        let load = list.next_real(range.end.id());
        if opcode(list, load) != Some(ALOAD) {
            continue;
        }
        let exit = load.and_then(|load| list.next(load)).and_then(|next| list.next_real(next));
        if opcode(list, exit) != Some(MONITOREXIT) {
            continue;
        }
        let after = match exit.and_then(|exit| list.next(exit)).and_then(|next| list.next_real(next)) {
            Some(after) => after,
            None => continue,
        };

        let label = code.instructions.create_label();
        code.instructions.insert_before(after, label.id());
        code.exception_ranges[index].end = label;
        extended += 1;
    }
    extended
}

/// Rewrites `ASTORE n; ALOAD n; MONITORENTER` into `DUP; ASTORE n; MONITORENTER`.
pub fn replace_loads(code: &mut Code, load: &InsnMatcher) -> usize {
    let runs = load.matches_where(&code.instructions, |list, run| {
        list.get(run[0]).stored_var().is_some() && list.get(run[0]).stored_var() == list.get(run[1]).loaded_var()
    });
    for run in &runs {
        let dup = code.instructions.create(Insn::Simple(DUP));
        code.instructions.insert_before(run[0], dup);
        code.instructions.remove(run[1]);
    }
    if !runs.is_empty() {
        code.max_stack = code.max_stack.saturating_add(1);
    }
    runs.len()
}

fn monitor(_: &MethodUnit, code: &mut Code, ctx: &mut StageContext<'_, MonitorState>) -> Result<bool> {
    let extended = extend_ranges(code);
    let replaced = match &ctx.state.load {
        Some(load) => replace_loads(code, load),
        None => 0,
    };
    ctx.stats.add("extended_ranges", extended);
    ctx.stats.add("replaced_loads", replaced);
    Ok(extended + replaced > 0)
}

pub static MONITOR: Transform<MonitorState> = Transform {
    before_all: Some(compile),
    code: Some(monitor),
    ..Transform::new("monitor")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::tests::mnemonics;
    use crate::insn::Label;
    use crate::opcodes::*;
    use crate::program::ExceptionRange;

    fn var(opcode: u8, var: u16) -> Insn {
        Insn::Var { opcode, var }
    }

    /// `synchronized (arg) { body }` as an obfuscated build lays it out.
    fn synchronized() -> (Code, Label) {
        let mut list = InstructionList::new();
        list.push(var(ALOAD, 0));
        list.push(var(ASTORE, 1));
        list.push(var(ALOAD, 1));
        list.push(Insn::Simple(MONITORENTER));
        let start = list.push_label();
        list.push(Insn::Simple(NOP));
        let end = list.push_label();
        list.push(var(ALOAD, 1));
        list.push(Insn::Simple(MONITOREXIT));
        list.push(Insn::Simple(RETURN));
        let handler = list.push_label();
        list.push(var(ALOAD, 1));
        list.push(Insn::Simple(MONITOREXIT));
        list.push(Insn::Simple(ATHROW));

        let code = Code {
            instructions: list,
            exception_ranges: vec![ExceptionRange {
                start,
                end,
                handler,
                catch_type: None,
            }],
            max_stack: 1,
            max_locals: 2,
            ..Code::default()
        };
        (code, end)
    }

    #[test]
    fn catch_all_ranges_cover_the_exit() {
        let (mut code, old_end) = synchronized();
        assert_eq!(extend_ranges(&mut code), 1);
        let list = &code.instructions;
        let end = code.exception_ranges[0].end;
        assert_ne!(end, old_end);
        assert_eq!(list.next_real(end.id()).map(|id| list.get(id)), Some(&Insn::Simple(RETURN)));

        assert_eq!(extend_ranges(&mut code), 0);
    }

    #[test]
    fn lock_loads_become_dups() {
        let (mut code, _) = synchronized();
        let matcher = InsnMatcher::compile(LOAD_BEFORE_ENTER).unwrap();
        assert_eq!(replace_loads(&mut code, &matcher), 1);
        assert_eq!(
            mnemonics(&code.instructions)[..4],
            ["ALOAD", "DUP", "ASTORE", "MONITORENTER"]
        );
        assert_eq!(code.max_stack, 2);
        assert_eq!(replace_loads(&mut code, &matcher), 0);
    }

    #[test]
    fn different_slots_are_left_alone() {
        let mut list = InstructionList::new();
        list.push(var(ASTORE, 1));
        list.push(var(ALOAD, 2));
        list.push(Insn::Simple(MONITORENTER));
        let mut code = Code {
            instructions: list,
            ..Code::default()
        };
        let matcher = InsnMatcher::compile(LOAD_BEFORE_ENTER).unwrap();
        assert_eq!(replace_loads(&mut code, &matcher), 0);
    }
}
