//! Moves static methods back to the classes that own them.
//!
//! Obfuscators copy static methods into unrelated classes and redirect every
//! call to the copy, leaving the original uncalled in its real owner. A called
//! method whose body matches uncalled methods of exactly one class moves into
//! that class. Other called static methods of the holder's package move into
//! the holder class, the way static fields do.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::trace;

use crate::error::Result;
use crate::insn::Insn;
use crate::pipeline::{StageContext, Transform};
use crate::program::{AccessFlags, ClassUnit, Code, MemberRef, MethodUnit, Program};
use crate::remap::{generated_name, relocate, MemberGroups, Remapping};
use crate::transforms::static_fields::{ensure_holder, holder_name};
use crate::transforms::unused_methods::{called_names, METHOD_PREFIX};

struct Candidate {
    key: MemberRef,
    called: bool,
    movable: bool,
}

/// Body text with integer constants blanked out, since copies often differ
/// only in those. Line numbers are ignored.
fn fingerprint(method: &MethodUnit, code: &Code) -> String {
    let list = &code.instructions;
    let mut text = method.descriptor.clone();
    for (id, shape) in list.iter().zip(list.shape()) {
        let insn = list.get(id);
        if matches!(insn, Insn::Line(_)) {
            continue;
        }
        text.push('\n');
        if insn.int_constant().is_some() {
            text.push_str("(int)");
        } else {
            text.push_str(&shape);
        }
    }
    text
}

fn declared_access(program: &Program, member: &MemberRef) -> Option<AccessFlags> {
    let class = program.class(&member.owner)?;
    if member.descriptor.starts_with('(') {
        class.method(&member.name, &member.descriptor).map(|method| method.access)
    } else {
        class.field(&member.name, &member.descriptor).map(|field| field.access)
    }
}

/// Whether the body still works from another class: no private member of its
/// own class, no protected member anywhere, and no class lock.
fn movable(program: &Program, class: &ClassUnit, method: &MethodUnit, code: &Code) -> bool {
    if method.access.contains(AccessFlags::SUPER) {
        return false;
    }
    let list = &code.instructions;
    list.iter().all(|id| match list.get(id) {
        Insn::Field { member, .. } | Insn::Method { member, .. } => match declared_access(program, member) {
            Some(access) if access.contains(AccessFlags::PROTECTED) => false,
            Some(access) => !(member.owner == class.name && access.contains(AccessFlags::PRIVATE)),
            None => true,
        },
        _ => true,
    })
}

fn package(class: &str) -> &str {
    &class[..class.rfind('/').unwrap_or(0)]
}

/// Decides where each movable method goes, keyed by its current reference.
fn plan(program: &Program, holder: &str) -> HashMap<MemberRef, String> {
    let called = called_names(program);
    let mut bodies: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for class in program.classes.iter().filter(|class| !class.is_interface()) {
        for method in &class.methods {
            if !method.is_static() || !generated_name(&method.name, METHOD_PREFIX) {
                continue;
            }
            let code = match &method.code {
                Some(code) => code,
                None => continue,
            };
            bodies.entry(fingerprint(method, code)).or_default().push(Candidate {
                key: method.key(),
                called: called.contains(&method.name),
                movable: movable(program, class, method, code),
            });
        }
    }

    let mut targets = HashMap::new();
    let mut settled = HashSet::new();
    for group in bodies.values().filter(|group| group.len() > 1) {
        let mut owners: Vec<&str> = group
            .iter()
            .filter(|candidate| !candidate.called)
            .map(|candidate| candidate.key.owner.as_str())
            .collect();
        owners.sort_unstable();
        owners.dedup();
        let owner = match owners.as_slice() {
            [owner] => *owner,
            _ => continue,
        };
        for candidate in group.iter().filter(|candidate| candidate.called) {
            settled.insert(&candidate.key);
            if candidate.movable && candidate.key.owner != owner {
                targets.insert(candidate.key.clone(), owner.to_string());
            }
        }
    }

    for candidate in bodies.values().flatten() {
        let owner = candidate.key.owner.as_str();
        if candidate.called
            && candidate.movable
            && !settled.contains(&candidate.key)
            && owner != holder
            && package(owner) == package(holder)
        {
            targets.insert(candidate.key.clone(), holder.to_string());
        }
    }
    targets
}

/// Moves static methods to their real owners or into `holder`. Returns the
/// number of methods moved.
pub fn move_statics(program: &mut Program, holder: &str) -> Result<usize> {
    let targets = plan(program, holder);
    if targets.is_empty() {
        return Ok(0);
    }

    let groups = MemberGroups::compute(program);
    let mut taken: HashSet<MemberRef> = program
        .classes
        .iter()
        .flat_map(|class| class.methods.iter().map(|method| method.key()))
        .collect();
    let mut sorted: Vec<(&MemberRef, &String)> = targets.iter().collect();
    sorted.sort();

    let mut moves = Vec::with_capacity(sorted.len());
    let mut remapping = Remapping::default();
    for (key, target) in sorted {
        let moved = key.with_owner(target);
        if !taken.insert(moved.clone()) {
            trace!("{} already declares {}, leaving {}", target, key.name, key);
            continue;
        }
        for linked in groups.linked(key) {
            remapping.map_member(linked.clone(), moved.clone());
        }
        moves.push((key.clone(), target.clone()));
    }
    if moves.iter().any(|(_, target)| target == holder) {
        ensure_holder(program, holder);
    }

    let moved = relocate(program, &moves)?;
    for (key, target) in &moves {
        if let Some(method) = program
            .class_mut(target)
            .and_then(|class| class.method_mut(&key.name, &key.descriptor))
        {
            method.access = (method.access - AccessFlags::VISIBILITY) | AccessFlags::PUBLIC;
        }
    }
    remapping.apply(program);
    Ok(moved)
}

fn static_methods(program: &mut Program, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let holder = holder_name(&ctx.settings.statics_class, &ctx.settings.default_package);
    let moved = move_statics(program, &holder)?;
    ctx.stats.add("moved_methods", moved);
    Ok(moved > 0)
}

pub static STATIC_METHODS: Transform = Transform {
    pass: Some(static_methods),
    ..Transform::new("static-methods")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::InstructionList;
    use crate::opcodes::*;
    use crate::pipeline::{run, Settings};
    use crate::program::FieldUnit;

    fn method(owner: &str, name: &str, descriptor: &str, insns: Vec<Insn>) -> MethodUnit {
        let mut list = InstructionList::new();
        for insn in insns {
            list.push(insn);
        }
        let mut method = MethodUnit::new(owner, name, descriptor, AccessFlags::STATIC);
        method.code = Some(Code {
            instructions: list,
            max_stack: 2,
            max_locals: 1,
            ..Code::default()
        });
        method
    }

    fn call(owner: &str, name: &str, descriptor: &str) -> Insn {
        Insn::Method {
            opcode: INVOKESTATIC,
            member: MemberRef::new(owner, name, descriptor),
            interface: false,
        }
    }

    fn add(constant: i32) -> Vec<Insn> {
        vec![
            Insn::Var { opcode: ILOAD, var: 0 },
            Insn::Int {
                opcode: BIPUSH,
                operand: constant,
            },
            Insn::Simple(IADD),
            Insn::Simple(IRETURN),
        ]
    }

    fn class(name: &str) -> ClassUnit {
        ClassUnit::new(name, Some("java/lang/Object"), AccessFlags::PUBLIC)
    }

    fn program() -> Program {
        let mut owner = class("deob/class1");
        owner.methods.push(method("deob/class1", "method1", "(I)I", add(7)));

        let mut copy = class("deob/class2");
        copy.methods.push(method("deob/class2", "method2", "(I)I", add(9)));

        let mut main = class("deob/class3");
        main.fields.push(FieldUnit::new(
            "deob/class3",
            "secret",
            "I",
            AccessFlags::PRIVATE | AccessFlags::STATIC,
        ));
        main.methods.push(method(
            "deob/class3",
            "main",
            "()V",
            vec![
                Insn::Simple(ICONST_1),
                call("deob/class2", "method2", "(I)I"),
                Insn::Simple(POP),
                call("deob/class3", "method3", "()V"),
                call("deob/class3", "method4", "()V"),
                Insn::Simple(RETURN),
            ],
        ));
        main.methods.push(method("deob/class3", "method3", "()V", vec![Insn::Simple(RETURN)]));
        main.methods.push(method(
            "deob/class3",
            "method4",
            "()V",
            vec![
                Insn::Field {
                    opcode: GETSTATIC,
                    member: MemberRef::new("deob/class3", "secret", "I"),
                },
                Insn::Simple(POP),
                Insn::Simple(RETURN),
            ],
        ));
        Program::new(vec![owner, copy, main])
    }

    fn names(class: &ClassUnit) -> Vec<&str> {
        class.methods.iter().map(|method| method.name.as_str()).collect()
    }

    #[test]
    fn copies_point_at_the_real_owner() {
        let mut program = program();
        let report = run(&STATIC_METHODS, &mut program, &Settings::default()).unwrap();
        assert_eq!(report.counters.get("moved_methods"), 2);
        assert_eq!(report.passes, 2);

        assert_eq!(names(program.class("deob/class1").unwrap()), vec!["method1", "method2"]);
        assert!(program.class("deob/class2").unwrap().methods.is_empty());
        let holder = program.class("deob/Statics").unwrap();
        assert_eq!(names(holder), vec!["method3"]);
        assert!(holder.methods[0].access.contains(AccessFlags::PUBLIC));
        assert_eq!(holder.methods[0].owner, "deob/Statics");
        assert_eq!(names(program.class("deob/class3").unwrap()), vec!["main", "method4"]);

        let main = program.class("deob/class3").unwrap().method("main", "()V").unwrap();
        let list = &main.code.as_ref().unwrap().instructions;
        let calls: Vec<&Insn> = list
            .iter()
            .map(|id| list.get(id))
            .filter(|insn| matches!(insn, Insn::Method { .. }))
            .collect();
        assert_eq!(
            calls,
            vec![
                &call("deob/class1", "method2", "(I)I"),
                &call("deob/Statics", "method3", "()V"),
                &call("deob/class3", "method4", "()V"),
            ]
        );
    }

    #[test]
    fn bodies_differing_in_constants_match() {
        let program = program();
        let one = program.classes[0].methods[0].clone();
        let two = program.classes[1].methods[0].clone();
        assert_eq!(
            fingerprint(&one, one.code.as_ref().unwrap()),
            fingerprint(&two, two.code.as_ref().unwrap())
        );
        let three = program.classes[2].method("method4", "()V").unwrap();
        assert!(!movable(&program, &program.classes[2], three, three.code.as_ref().unwrap()));
    }
}
