//! Deletes methods nothing calls.
//!
//! Only methods the remapper named are candidates, so entry points and
//! overrides of library methods are never touched. Calls are matched by name:
//! a method stays while any instruction invokes or references that name.

use std::collections::HashSet;

use log::trace;

use crate::error::Result;
use crate::insn::Insn;
use crate::pipeline::{StageContext, Transform};
use crate::program::{AccessFlags, ClassUnit, Constant, Program};
use crate::remap::generated_name;

/// Name prefix of the method names the remapper generates.
pub const METHOD_PREFIX: &str = "method";

/// Names of every method some instruction invokes or takes a handle to.
pub fn called_names(program: &Program) -> HashSet<String> {
    let mut called = HashSet::new();
    for (_, code) in program.code() {
        let list = &code.instructions;
        for id in list.iter() {
            match list.get(id) {
                Insn::Method { member, .. } | Insn::Ldc(Constant::MethodHandle { member, .. }) => {
                    called.insert(member.name.clone());
                }
                _ => {}
            }
        }
    }
    called
}

/// Bootstrap arguments are kept as raw bytes, so method handles of classes
/// using `INVOKEDYNAMIC` cannot be seen.
fn uses_invokedynamic(class: &ClassUnit) -> bool {
    class.methods.iter().filter_map(|method| method.code.as_ref()).any(|code| {
        let list = &code.instructions;
        list.iter().any(|id| matches!(list.get(id), Insn::InvokeDynamic(_)))
    })
}

/// Deletes uncalled methods with generated names. Returns how many went.
pub fn remove_uncalled(program: &mut Program) -> usize {
    let called = called_names(program);
    let mut removed = 0;
    for class in &mut program.classes {
        if uses_invokedynamic(class) {
            continue;
        }
        let before = class.methods.len();
        class.methods.retain(|method| {
            let keep = called.contains(&method.name)
                || !generated_name(&method.name, METHOD_PREFIX)
                || method.access.contains(AccessFlags::SYNTHETIC);
            if !keep {
                trace!("Removing uncalled method {}", method);
            }
            keep
        });
        removed += before - class.methods.len();
    }
    removed
}

fn unused_methods(program: &mut Program, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let removed = remove_uncalled(program);
    ctx.stats.add("removed_methods", removed);
    Ok(removed > 0)
}

pub static UNUSED_METHODS: Transform = Transform {
    pass: Some(unused_methods),
    ..Transform::new("unused-methods")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{DynamicCall, InstructionList};
    use crate::opcodes::*;
    use crate::pipeline::{run, Settings};
    use crate::program::{Code, MemberRef, MethodUnit};

    fn call(owner: &str, name: &str) -> Insn {
        Insn::Method {
            opcode: INVOKESTATIC,
            member: MemberRef::new(owner, name, "()V"),
            interface: false,
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

    fn names(class: &ClassUnit) -> Vec<&str> {
        class.methods.iter().map(|method| method.name.as_str()).collect()
    }

    #[test]
    fn uncalled_chains_are_removed() {
        let owner = "deob/class1";
        let mut class = ClassUnit::new(owner, Some("java/lang/Object"), AccessFlags::PUBLIC);
        class.methods.push(method(owner, "main", vec![call(owner, "method1")]));
        class.methods.push(method(owner, "method1", vec![]));
        class.methods.push(method(owner, "method2", vec![call(owner, "method3")]));
        class.methods.push(method(owner, "method3", vec![]));
        class.methods.push(method(owner, "helper", vec![]));

        let lambdas = "deob/class2";
        let mut other = ClassUnit::new(lambdas, Some("java/lang/Object"), AccessFlags::PUBLIC);
        other.methods.push(method(
            lambdas,
            "method4",
            vec![Insn::InvokeDynamic(DynamicCall {
                bootstrap: 0,
                name: "run".to_string(),
                descriptor: "()Ljava/lang/Runnable;".to_string(),
            })],
        ));
        other.methods.push(method(lambdas, "method5", vec![]));

        let mut program = Program::new(vec![class, other]);
        let report = run(&UNUSED_METHODS, &mut program, &Settings::default()).unwrap();
        assert_eq!(report.counters.get("removed_methods"), 2);
        assert_eq!(report.passes, 3);
        assert_eq!(names(&program.classes[0]), vec!["main", "method1", "helper"]);
        assert_eq!(names(&program.classes[1]), vec!["method4", "method5"]);
    }

    #[test]
    fn method_handles_count_as_calls() {
        let owner = "deob/class1";
        let mut class = ClassUnit::new(owner, Some("java/lang/Object"), AccessFlags::PUBLIC);
        class.methods.push(method(
            owner,
            "main",
            vec![
                Insn::Ldc(Constant::MethodHandle {
                    kind: 6,
                    member: MemberRef::new(owner, "method1", "()V"),
                    interface: false,
                }),
                Insn::Simple(POP),
            ],
        ));
        class.methods.push(method(owner, "method1", vec![]));
        let mut program = Program::new(vec![class]);
        assert_eq!(remove_uncalled(&mut program), 0);
    }
}
