//! Gathers static fields into one holder class.
//!
//! Obfuscators scatter static fields over unrelated classes. A static field no
//! `<clinit>` touches can live anywhere, so such fields move into the holder
//! class. Fields a static initializer touches stay put, since moving them would
//! change when they are initialized. Fields nothing reads or writes are deleted
//! first.

use std::collections::HashSet;

use log::debug;

use crate::error::Result;
use crate::insn::Insn;
use crate::pipeline::{StageContext, Transform};
use crate::program::{AccessFlags, ClassUnit, MemberRef, Program};
use crate::remap::{relocate, source_file_name, MemberGroups, Remapping};

/// Internal name of the holder class for these settings.
pub fn holder_name(statics_class: &str, default_package: &str) -> String {
    if statics_class.contains('/') {
        statics_class.to_string()
    } else {
        format!("{}/{}", default_package, statics_class)
    }
}

fn field_refs(class: &ClassUnit, only_initializer: bool) -> impl Iterator<Item = &MemberRef> {
    class
        .methods
        .iter()
        .filter(move |method| !only_initializer || method.is_initializer())
        .filter_map(|method| method.code.as_ref())
        .flat_map(|code| {
            let list = &code.instructions;
            list.iter().filter_map(move |id| match list.get(id) {
                Insn::Field { member, .. } => Some(member),
                _ => None,
            })
        })
}

/// Deletes fields no instruction in the program refers to.
pub fn remove_unused(program: &mut Program) -> usize {
    let groups = MemberGroups::compute(program);
    let used: HashSet<usize> = program
        .classes
        .iter()
        .flat_map(|class| field_refs(class, false))
        .filter_map(|member| groups.group(member))
        .collect();

    let mut removed = 0;
    for class in &mut program.classes {
        let before = class.fields.len();
        class
            .fields
            .retain(|field| groups.group(&field.key()).map_or(true, |group| used.contains(&group)));
        removed += before - class.fields.len();
    }
    removed
}

/// Adds an empty public `holder` class unless the program has one.
pub fn ensure_holder(program: &mut Program, holder: &str) {
    if program.class(holder).is_none() {
        debug!("Creating holder class {}", holder);
        let mut class = ClassUnit::new(holder, Some("java/lang/Object"), AccessFlags::PUBLIC | AccessFlags::SUPER);
        class.source_file = Some(source_file_name(holder));
        program.classes.push(class);
    }
}

/// Moves every movable static field into `holder`, creating the class if
/// needed. Returns the number of fields moved.
pub fn move_statics(program: &mut Program, holder: &str) -> Result<usize> {
    let groups = MemberGroups::compute(program);
    let mut taken: HashSet<(String, String)> = program
        .class(holder)
        .map(|class| {
            class
                .fields
                .iter()
                .map(|field| (field.name.clone(), field.descriptor.clone()))
                .collect()
        })
        .unwrap_or_default();

    let pinned: HashSet<usize> = program
        .classes
        .iter()
        .flat_map(|class| field_refs(class, true))
        .filter_map(|member| groups.group(member))
        .collect();

    let mut moves = Vec::new();
    let mut remapping = Remapping::default();
    for class in &program.classes {
        if class.name == holder || class.is_interface() {
            continue;
        }
        for field in class.fields.iter().filter(|field| field.is_static()) {
            let key = field.key();
            if groups.group(&key).map_or(false, |group| pinned.contains(&group)) {
                continue;
            }

            let simple = &class.name[class.name.rfind('/').map_or(0, |pos| pos + 1)..];
            let mut name = field.name.clone();
            let mut suffix = 1;
            while taken.contains(&(name.clone(), field.descriptor.clone())) {
                name = if suffix == 1 {
                    format!("{}_{}", simple, field.name)
                } else {
                    format!("{}_{}{}", simple, field.name, suffix)
                };
                suffix += 1;
            }
            taken.insert((name.clone(), field.descriptor.clone()));

            let target = MemberRef::new(holder, name.as_str(), field.descriptor.as_str());
            for linked in groups.linked(&key) {
                remapping.map_member(linked.clone(), target.clone());
            }
            moves.push((key, holder.to_string()));
        }
    }
    if moves.is_empty() {
        return Ok(0);
    }

    ensure_holder(program, holder);
    let moved = relocate(program, &moves)?;
    if let Some(class) = program.class_mut(holder) {
        for field in &mut class.fields {
            field.access = (field.access - AccessFlags::VISIBILITY) | AccessFlags::PUBLIC;
        }
    }
    remapping.apply(program);
    Ok(moved)
}

fn static_fields(program: &mut Program, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let holder = holder_name(&ctx.settings.statics_class, &ctx.settings.default_package);
    let removed = remove_unused(program);
    let moved = move_statics(program, &holder)?;
    ctx.stats.add("removed_fields", removed);
    ctx.stats.add("moved_fields", moved);
    Ok(removed + moved > 0)
}

pub static STATIC_FIELDS: Transform = Transform {
    pass: Some(static_fields),
    ..Transform::new("static-fields")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::InstructionList;
    use crate::opcodes::*;
    use crate::pipeline::{run, Settings};
    use crate::program::{Code, FieldUnit, MethodUnit};

    fn access(opcode: u8, owner: &str, name: &str) -> Insn {
        Insn::Field {
            opcode,
            member: MemberRef::new(owner, name, "I"),
        }
    }

    fn method(owner: &str, name: &str, insns: Vec<Insn>) -> MethodUnit {
        let mut list = InstructionList::new();
        for insn in insns {
            list.push(insn);
        }
        list.push(Insn::Simple(RETURN));
        let mut method = MethodUnit::new(owner, name, "()V", AccessFlags::STATIC);
        method.code = Some(Code {
            instructions: list,
            ..Code::default()
        });
        method
    }

    fn program() -> Program {
        let statik = AccessFlags::PRIVATE | AccessFlags::STATIC;
        let mut a = ClassUnit::new("p/a", Some("java/lang/Object"), AccessFlags::PUBLIC);
        a.fields.push(FieldUnit::new("p/a", "x", "I", statik));
        a.fields.push(FieldUnit::new("p/a", "y", "I", statik));
        a.fields.push(FieldUnit::new("p/a", "dead", "I", statik));
        a.fields.push(FieldUnit::new("p/a", "inst", "I", AccessFlags::PUBLIC));
        a.methods.push(method(
            "p/a",
            "<clinit>",
            vec![Insn::Simple(ICONST_1), access(PUTSTATIC, "p/a", "y")],
        ));
        a.methods.push(method(
            "p/a",
            "f",
            vec![
                access(GETSTATIC, "p/a", "x"),
                access(GETSTATIC, "p/a", "y"),
                Insn::Simple(POP2),
                Insn::Var { opcode: ALOAD, var: 0 },
                access(GETFIELD, "p/a", "inst"),
                Insn::Simple(POP),
            ],
        ));

        let mut b = ClassUnit::new("p/b", Some("p/a"), AccessFlags::PUBLIC);
        b.fields.push(FieldUnit::new("p/b", "x", "I", statik));
        b.methods.push(method(
            "p/b",
            "g",
            vec![
                access(GETSTATIC, "p/b", "x"),
                Insn::Simple(POP),
            ],
        ));
        Program::new(vec![a, b])
    }

    #[test]
    fn unused_fields_are_deleted() {
        let mut program = program();
        assert_eq!(remove_unused(&mut program), 1);
        assert!(program.classes[0].field("dead", "I").is_none());
        assert!(program.classes[0].field("inst", "I").is_some());
    }

    #[test]
    fn fields_other_initializers_touch_stay() {
        let mut program = program();
        let mut c = ClassUnit::new("p/c", Some("java/lang/Object"), AccessFlags::PUBLIC);
        c.methods.push(method(
            "p/c",
            "<clinit>",
            vec![Insn::Simple(ICONST_2), access(PUTSTATIC, "p/b", "x")],
        ));
        program.classes.push(c);

        let report = run(&STATIC_FIELDS, &mut program, &Settings::default()).unwrap();
        assert_eq!(report.counters.get("moved_fields"), 1);
        assert!(program.class("p/b").unwrap().field("x", "I").is_some());
        let holder = program.class("deob/Statics").unwrap();
        let names: Vec<&str> = holder.fields.iter().map(|field| field.name.as_str()).collect();
        assert_eq!(names, vec!["x"]);
    }

    #[test]
    fn statics_move_to_the_holder() {
        let mut program = program();
        let report = run(&STATIC_FIELDS, &mut program, &Settings::default()).unwrap();
        assert_eq!(report.counters.get("moved_fields"), 2);

        let holder = program.class("deob/Statics").unwrap();
        let names: Vec<&str> = holder.fields.iter().map(|field| field.name.as_str()).collect();
        assert_eq!(names, vec!["x", "b_x"]);
        assert!(holder.fields.iter().all(|field| field.access.contains(AccessFlags::PUBLIC)));
        assert!(holder.fields.iter().all(|field| field.owner == "deob/Statics"));

        let a = program.class("p/a").unwrap();
        assert!(a.field("y", "I").is_some());
        assert!(a.field("inst", "I").is_some());
        let f = a.method("f", "()V").unwrap().code.as_ref().unwrap();
        let first = f.instructions.first().unwrap();
        assert_eq!(f.instructions.get(first), &access(GETSTATIC, "deob/Statics", "x"));

        let g = program.class("p/b").unwrap().method("g", "()V").unwrap().code.as_ref().unwrap();
        let first = g.instructions.first().unwrap();
        assert_eq!(g.instructions.get(first), &access(GETSTATIC, "deob/Statics", "b_x"));
    }
}
