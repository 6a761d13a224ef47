//! Removes opaque predicates built on flow obstructor fields.
//!
//! A flow obstructor is a static field whose value never changes the outcome
//! of the branches reading it. The obfuscator writes it through a recognizable
//! initializer sequence; finding that sequence identifies the field, after
//! which every `IFEQ` on it is always taken and every `IFNE` never is.

use std::collections::HashSet;

use log::debug;

use crate::error::Result;
use crate::insn::{Insn, InstructionList};
use crate::matcher::InsnMatcher;
use crate::opcodes::{GOTO, IFEQ, IFNE};
use crate::pipeline::{StageContext, Transform};
use crate::program::{Code, MemberRef, MethodUnit, Program};

const INITIALIZER: &str = "(GETSTATIC | ILOAD) IFEQ \
    (((GETSTATIC ISTORE)? IINC ILOAD) | ((GETSTATIC | ILOAD) IFEQ ICONST GOTO ICONST)) \
    PUTSTATIC";
const PREDICATE: &str = "(GETSTATIC | ILOAD) (IFEQ | IFNE)";
const COPY: &str = "GETSTATIC ISTORE";

pub struct Matchers {
    initializer: InsnMatcher,
    predicate: InsnMatcher,
    copy: InsnMatcher,
}

impl Matchers {
    pub fn compile() -> Result<Matchers> {
        Ok(Matchers {
            initializer: InsnMatcher::compile(INITIALIZER)?,
            predicate: InsnMatcher::compile(PREDICATE)?,
            copy: InsnMatcher::compile(COPY)?,
        })
    }
}

#[derive(Default)]
pub struct OpaqueState {
    matchers: Option<Matchers>,
    obstructors: HashSet<MemberRef>,
}

fn field(insn: &Insn) -> Option<&MemberRef> {
    match insn {
        Insn::Field { member, .. } => Some(member),
        _ => None,
    }
}

/// Fields copied into locals by `GETSTATIC f; ISTORE n`, with the slot.
fn copies<'l>(list: &'l InstructionList, matchers: &Matchers) -> Vec<(&'l MemberRef, u16)> {
    matchers
        .copy
        .matches(list)
        .into_iter()
        .filter_map(|run| Some((field(list.get(run[0]))?, list.get(run[1]).stored_var()?)))
        .collect()
}

/// Finds obstructor initializers in `code`, removes everything after their
/// leading branch and returns the fields they initialize.
pub fn remove_initializers(code: &mut Code, matchers: &Matchers) -> Vec<MemberRef> {
    let list = &code.instructions;
    let mut found = Vec::new();
    let mut doomed = Vec::new();
    for run in matchers.initializer.matches(list) {
        let target = match run.last().and_then(|last| field(list.get(*last))) {
            Some(target) => target.clone(),
            None => continue,
        };
        // a local-based initializer only counts if the local copies the field
        if list.get(run[0]).loaded_var().is_some()
            && !copies(list, matchers).iter().any(|(copied, _)| **copied == target)
        {
            continue;
        }
        doomed.extend_from_slice(&run[2..]);
        found.push(target);
    }
    for id in doomed {
        code.instructions.remove(id);
    }
    found
}

/// Rewrites branches on obstructors and drops their copies into locals.
/// Returns the number of predicates and copies removed.
pub fn remove_predicates(code: &mut Code, matchers: &Matchers, obstructors: &HashSet<MemberRef>) -> (usize, usize) {
    let list = &code.instructions;
    let copied_slots: HashSet<u16> = copies(list, matchers)
        .into_iter()
        .filter(|(member, _)| obstructors.contains(*member))
        .map(|(_, slot)| slot)
        .collect();
    let predicates = matchers.predicate.matches_where(list, |list, run| match list.get(run[0]) {
        Insn::Field { member, .. } => obstructors.contains(member),
        insn => insn.loaded_var().map_or(false, |slot| copied_slots.contains(&slot)),
    });

    for run in &predicates {
        let (load, branch) = (run[0], run[1]);
        match code.instructions.get(branch).clone() {
            Insn::Jump { opcode: IFEQ, target } => {
                code.instructions.remove(load);
                code.instructions.replace(branch, Insn::Jump { opcode: GOTO, target });
            }
            Insn::Jump { opcode: IFNE, .. } => {
                code.instructions.remove(load);
                code.instructions.remove(branch);
            }
            _ => {}
        }
    }

    let list = &code.instructions;
    let stores: Vec<_> = matchers
        .copy
        .matches(list)
        .into_iter()
        .filter(|run| field(list.get(run[0])).map_or(false, |member| obstructors.contains(member)))
        .collect();
    for run in &stores {
        for id in run {
            code.instructions.remove(*id);
        }
    }
    (predicates.len(), stores.len())
}

fn find_obstructors(program: &mut Program, ctx: &mut StageContext<'_, OpaqueState>) -> Result<bool> {
    let matchers = Matchers::compile()?;
    let mut removed = 0;
    for method in program.methods_mut() {
        if let Some(code) = &mut method.code {
            let found = remove_initializers(code, &matchers);
            removed += found.len();
            ctx.state.obstructors.extend(found);
        }
    }
    debug!("Identified flow obstructors {:?}", ctx.state.obstructors);
    ctx.stats.add("removed_initializers", removed);
    ctx.state.matchers = Some(matchers);
    Ok(removed > 0)
}

fn opaque_predicate(_: &MethodUnit, code: &mut Code, ctx: &mut StageContext<'_, OpaqueState>) -> Result<bool> {
    let matchers = match &ctx.state.matchers {
        Some(matchers) if !ctx.state.obstructors.is_empty() => matchers,
        _ => return Ok(false),
    };
    let (predicates, stores) = remove_predicates(code, matchers, &ctx.state.obstructors);
    ctx.stats.add("removed_predicates", predicates);
    ctx.stats.add("removed_copies", stores);
    Ok(predicates + stores > 0)
}

pub static OPAQUE_PREDICATE: Transform<OpaqueState> = Transform {
    before_all: Some(find_obstructors),
    code: Some(opaque_predicate),
    ..Transform::new("opaque-predicate")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::tests::mnemonics;
    use crate::opcodes::*;
    use crate::pipeline::{run, Settings};
    use crate::program::{AccessFlags, ClassUnit};

    fn getstatic(name: &str) -> Insn {
        Insn::Field {
            opcode: GETSTATIC,
            member: MemberRef::new("a", name, "Z"),
        }
    }

    fn initializer() -> Code {
        let mut list = InstructionList::new();
        let skip = list.create_label();
        let one = list.create_label();
        let store = list.create_label();
        list.push(getstatic("ob"));
        list.push(Insn::Jump { opcode: IFEQ, target: skip });
        list.push(getstatic("ob"));
        list.push(Insn::Jump { opcode: IFEQ, target: one });
        list.push(Insn::Simple(ICONST_0));
        list.push(Insn::Jump { opcode: GOTO, target: store });
        list.append(one.id());
        list.push(Insn::Simple(ICONST_1));
        list.append(store.id());
        list.push(Insn::Field {
            opcode: PUTSTATIC,
            member: MemberRef::new("a", "ob", "Z"),
        });
        list.append(skip.id());
        list.push(Insn::Simple(RETURN));
        Code {
            instructions: list,
            ..Code::default()
        }
    }

    fn guarded() -> Code {
        let mut list = InstructionList::new();
        let other = list.create_label();
        list.push(getstatic("ob"));
        list.push(Insn::Var { opcode: ISTORE, var: 2 });
        list.push(Insn::Var { opcode: ILOAD, var: 2 });
        list.push(Insn::Jump { opcode: IFNE, target: other });
        list.push(getstatic("real"));
        list.push(Insn::Jump { opcode: IFEQ, target: other });
        list.push(Insn::Simple(ICONST_1));
        list.push(Insn::Simple(IRETURN));
        list.append(other.id());
        list.push(Insn::Simple(ICONST_0));
        list.push(Insn::Simple(IRETURN));
        Code {
            instructions: list,
            ..Code::default()
        }
    }

    fn program() -> Program {
        let mut class = ClassUnit::new("a", Some("java/lang/Object"), AccessFlags::PUBLIC);
        for (name, code) in [("b", initializer()), ("c", guarded())] {
            let mut method = MethodUnit::new("a", name, "()I", AccessFlags::STATIC);
            method.code = Some(code);
            class.methods.push(method);
        }
        Program::new(vec![class])
    }

    #[test]
    fn initializers_identify_obstructors() {
        let matchers = Matchers::compile().unwrap();
        let mut code = initializer();
        let found = remove_initializers(&mut code, &matchers);
        assert_eq!(found, vec![MemberRef::new("a", "ob", "Z")]);
        assert_eq!(
            mnemonics(&code.instructions),
            vec!["GETSTATIC", "IFEQ", "LABEL", "LABEL", "LABEL", "RETURN"]
        );
    }

    #[test]
    fn predicates_on_obstructors_are_resolved() {
        let mut program = program();
        let report = run(&OPAQUE_PREDICATE, &mut program, &Settings::default()).unwrap();
        assert_eq!(report.counters.get("removed_initializers"), 1);
        assert_eq!(report.counters.get("removed_predicates"), 2);
        assert_eq!(report.counters.get("removed_copies"), 1);

        let class = &program.classes[0];
        let code = |name: &str| &class.method(name, "()I").unwrap().code.as_ref().unwrap().instructions;
        assert_eq!(mnemonics(code("b")), vec!["GOTO", "LABEL", "LABEL", "LABEL", "RETURN"]);
        assert_eq!(
            mnemonics(code("c")),
            vec!["GETSTATIC", "IFEQ", "ICONST_1", "IRETURN", "LABEL", "ICONST_0", "IRETURN"]
        );
    }

    #[test]
    fn nothing_to_do_without_obstructors() {
        let matchers = Matchers::compile().unwrap();
        let mut code = guarded();
        assert_eq!(remove_predicates(&mut code, &matchers, &HashSet::new()), (0, 0));
        assert_eq!(code.instructions.len(), 11);
    }
}
