//! Puts fields back in declaration order.
//!
//! Compilers initialize fields in source order, so the first access from the
//! static initializer (for statics) and the constructors (for instance fields)
//! recovers it. Fields neither touches follow, by type and then by name.

use std::collections::HashMap;

use crate::error::Result;
use crate::insn::Insn;
use crate::opcodes::{GETFIELD, GETSTATIC, PUTFIELD, PUTSTATIC};
use crate::pipeline::{StageContext, Transform};
use crate::program::{ClassUnit, FieldUnit, MemberRef};

/// Position of each of the class's own fields in initialization order.
fn access_order(class: &ClassUnit) -> HashMap<MemberRef, usize> {
    let mut order = HashMap::new();
    let initializers = class.methods.iter().filter(|method| method.is_initializer());
    let constructors = class.methods.iter().filter(|method| method.is_constructor());
    for (method, opcodes) in initializers
        .map(|method| (method, [GETSTATIC, PUTSTATIC]))
        .chain(constructors.map(|method| (method, [GETFIELD, PUTFIELD])))
    {
        let code = match &method.code {
            Some(code) => code,
            None => continue,
        };
        for id in code.instructions.iter() {
            if let Insn::Field { opcode, member } = code.instructions.get(id) {
                if member.owner == class.name && opcodes.contains(opcode) && !order.contains_key(member) {
                    order.insert(member.clone(), order.len());
                }
            }
        }
    }
    order
}

/// Sorts the fields of `class`; true when the order changed.
pub fn sort_fields(class: &mut ClassUnit) -> bool {
    let order = access_order(class);
    let before: Vec<MemberRef> = class.fields.iter().map(|field| field.key()).collect();
    class.fields.sort_by(|a, b| {
        let rank = |field: &FieldUnit| order.get(&field.key()).copied().unwrap_or(usize::MAX);
        rank(a)
            .cmp(&rank(b))
            .then_with(|| a.descriptor.cmp(&b.descriptor))
            .then_with(|| a.name.cmp(&b.name))
    });
    class.fields.iter().map(|field| field.key()).ne(before)
}

fn sort_class(class: &mut ClassUnit, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let changed = sort_fields(class);
    if changed {
        ctx.stats.incr("sorted_classes");
    }
    Ok(changed)
}

pub static SORT_FIELDS: Transform = Transform {
    class: Some(sort_class),
    ..Transform::new("sort-fields")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::InstructionList;
    use crate::opcodes::*;
    use crate::pipeline::{run, Settings};
    use crate::program::{AccessFlags, Code, MethodUnit, Program};

    fn method(name: &str, accesses: &[(u8, &str)]) -> MethodUnit {
        let mut list = InstructionList::new();
        for (opcode, field) in accesses {
            list.push(Insn::Field {
                opcode: *opcode,
                member: MemberRef::new("a", *field, "I"),
            });
        }
        list.push(Insn::Simple(RETURN));
        let mut method = MethodUnit::new("a", name, "()V", AccessFlags::empty());
        method.code = Some(Code {
            instructions: list,
            ..Code::default()
        });
        method
    }

    fn names(class: &ClassUnit) -> Vec<&str> {
        class.fields.iter().map(|field| field.name.as_str()).collect()
    }

    #[test]
    fn initializers_decide_the_order() {
        let mut class = ClassUnit::new("a", Some("java/lang/Object"), AccessFlags::PUBLIC);
        for (name, descriptor) in [("z", "J"), ("s2", "I"), ("i1", "I"), ("s1", "I"), ("y", "I")] {
            class.fields.push(FieldUnit::new("a", name, descriptor, AccessFlags::empty()));
        }
        class
            .methods
            .push(method("<clinit>", &[(PUTSTATIC, "s1"), (GETSTATIC, "s1"), (PUTSTATIC, "s2")]));
        class.methods.push(method("<init>", &[(GETSTATIC, "y"), (PUTFIELD, "i1")]));

        assert!(sort_fields(&mut class));
        assert_eq!(names(&class), vec!["s1", "s2", "i1", "y", "z"]);
        assert!(!sort_fields(&mut class));
    }

    #[test]
    fn stage_counts_sorted_classes() {
        let mut class = ClassUnit::new("a", Some("java/lang/Object"), AccessFlags::PUBLIC);
        class.fields.push(FieldUnit::new("a", "b", "I", AccessFlags::empty()));
        class.fields.push(FieldUnit::new("a", "a", "I", AccessFlags::empty()));
        let mut program = Program::new(vec![class]);
        let report = run(&SORT_FIELDS, &mut program, &Settings::default()).unwrap();
        assert_eq!(report.counters.get("sorted_classes"), 1);
        assert_eq!(report.passes, 2);
        assert_eq!(names(&program.classes[0]), vec!["a", "b"]);
    }
}
