//! Replaces `INVOKEDYNAMIC` call sites with stubs: the arguments are popped and
//! a zero value of the return type is pushed. Some obfuscated builds only use
//! dynamic calls for decoy code, and decompilers handle the stubs better.

use crate::error::Result;
use crate::insn::{Insn, InsnId};
use crate::opcodes::{ACONST_NULL, DCONST_0, FCONST_0, ICONST_0, LCONST_0, POP, POP2};
use crate::pipeline::{StageContext, Transform};
use crate::program::{descriptor, Code, MethodUnit};

/// Zero value of a return type descriptor, `None` for `void`.
fn zero(return_type: &str) -> Option<u8> {
    match return_type {
        "V" => None,
        "Z" | "B" | "C" | "S" | "I" => Some(ICONST_0),
        "J" => Some(LCONST_0),
        "F" => Some(FCONST_0),
        "D" => Some(DCONST_0),
        _ => Some(ACONST_NULL),
    }
}

/// Stubs out every dynamic call site of `code`, returning how many there were.
pub fn stub_dynamic_calls(code: &mut Code) -> usize {
    let sites: Vec<(InsnId, String)> = code
        .instructions
        .iter()
        .filter_map(|id| match code.instructions.get(id) {
            Insn::InvokeDynamic(call) => Some((id, call.descriptor.clone())),
            _ => None,
        })
        .collect();

    for (site, desc) in &sites {
        let list = &mut code.instructions;
        for argument in descriptor::arguments(desc).into_iter().rev() {
            let pop = list.create(Insn::Simple(if descriptor::is_wide(argument) { POP2 } else { POP }));
            list.insert_before(*site, pop);
        }
        if let Some(opcode) = zero(descriptor::return_type(desc)) {
            let push = list.create(Insn::Simple(opcode));
            list.insert_before(*site, push);
        }
        list.remove(*site);
    }
    sites.len()
}

fn delete_invokedynamic(_: &MethodUnit, code: &mut Code, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let stubbed = stub_dynamic_calls(code);
    ctx.stats.add("stubbed_calls", stubbed);
    Ok(stubbed > 0)
}

pub static DELETE_INVOKEDYNAMIC: Transform = Transform {
    code: Some(delete_invokedynamic),
    ..Transform::new("delete-invokedynamic")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::tests::mnemonics;
    use crate::insn::{DynamicCall, InstructionList};
    use crate::opcodes::*;

    fn dynamic(descriptor: &str) -> Insn {
        Insn::InvokeDynamic(DynamicCall {
            bootstrap: 0,
            name: "apply".to_string(),
            descriptor: descriptor.to_string(),
        })
    }

    #[test]
    fn calls_become_pops_and_zeros() {
        let mut list = InstructionList::new();
        list.push(dynamic("(ILjava/lang/String;J)Z"));
        list.push(Insn::Simple(POP));
        list.push(dynamic("()Ljava/lang/Runnable;"));
        list.push(Insn::Simple(POP));
        list.push(dynamic("(D)V"));
        list.push(Insn::Simple(RETURN));
        let mut code = Code {
            instructions: list,
            ..Code::default()
        };

        assert_eq!(stub_dynamic_calls(&mut code), 3);
        assert_eq!(
            mnemonics(&code.instructions),
            vec!["POP2", "POP", "POP", "ICONST_0", "POP", "ACONST_NULL", "POP", "POP2", "RETURN"]
        );
        assert_eq!(stub_dynamic_calls(&mut code), 0);
    }
}
