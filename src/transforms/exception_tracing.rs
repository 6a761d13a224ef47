//! Removes the try/catch blocks the obfuscator wraps around method bodies to
//! report crashes. Such a handler only builds a message out of the method's
//! arguments, passes it to a reporting method and rethrows.

use crate::error::Result;
use crate::matcher::InsnMatcher;
use crate::pipeline::{StageContext, Transform};
use crate::program::{Code, MethodUnit, Program};

use super::RUNTIME_EXCEPTION;

const TRACING_HANDLER: &str = "ASTORE NEW DUP LDC INVOKESPECIAL \
    ((ALOAD | ILOAD | LLOAD | FLOAD | DLOAD | BIPUSH | SIPUSH | LDC) INVOKEVIRTUAL INVOKEVIRTUAL?)* \
    INVOKEVIRTUAL INVOKESTATIC NEW DUP INVOKESPECIAL ATHROW";

#[derive(Default)]
pub struct TracingState {
    handler: Option<InsnMatcher>,
}

fn compile(_: &mut Program, ctx: &mut StageContext<'_, TracingState>) -> Result<bool> {
    ctx.state.handler = Some(InsnMatcher::compile(TRACING_HANDLER)?);
    Ok(false)
}

/// Removes every `RuntimeException` range whose handler is a tracing handler,
/// together with the handler code. Returns how many handlers went.
pub fn remove_tracing_handlers(code: &mut Code, handler: &InsnMatcher) -> usize {
    let mut removed = 0;
    for run in handler.matches(&code.instructions) {
        let entry = run[0];
        let list = &code.instructions;
        let before = code.exception_ranges.len();
        code.exception_ranges.retain(|range| {
            !(range.catch_type.as_deref() == Some(RUNTIME_EXCEPTION) && list.next_real(range.handler.id()) == Some(entry))
        });
        if code.exception_ranges.len() < before {
            for id in run {
                code.instructions.remove(id);
            }
            removed += 1;
        }
    }
    removed
}

fn exception_tracing(_: &MethodUnit, code: &mut Code, ctx: &mut StageContext<'_, TracingState>) -> Result<bool> {
    let handler = match &ctx.state.handler {
        Some(handler) => handler,
        None => return Ok(false),
    };
    let removed = remove_tracing_handlers(code, handler);
    ctx.stats.add("removed_handlers", removed);
    Ok(removed > 0)
}

pub static EXCEPTION_TRACING: Transform<TracingState> = Transform {
    before_all: Some(compile),
    code: Some(exception_tracing),
    ..Transform::new("exception-tracing")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::tests::mnemonics;
    use crate::insn::{Insn, InstructionList};
    use crate::opcodes::*;
    use crate::program::{Constant, ExceptionRange, MemberRef};

    fn invoke(opcode: u8, owner: &str, name: &str, descriptor: &str) -> Insn {
        Insn::Method {
            opcode,
            member: MemberRef::new(owner, name, descriptor),
            interface: false,
        }
    }

    fn new(class: &str) -> Insn {
        Insn::Type {
            opcode: NEW,
            class: class.to_string(),
        }
    }

    fn traced_method(catch_type: &str) -> Code {
        let mut list = InstructionList::new();
        let start = list.push_label();
        list.push(Insn::Var { opcode: ILOAD, var: 0 });
        list.push(Insn::Simple(IRETURN));
        let end = list.push_label();
        let handler = list.push_label();
        list.push(Insn::Var { opcode: ASTORE, var: 1 });
        list.push(new("java/lang/StringBuilder"));
        list.push(Insn::Simple(DUP));
        list.push(Insn::Ldc(Constant::String("ab.c(".to_string())));
        list.push(invoke(INVOKESPECIAL, "java/lang/StringBuilder", "<init>", "(Ljava/lang/String;)V"));
        list.push(Insn::Var { opcode: ILOAD, var: 0 });
        list.push(invoke(INVOKEVIRTUAL, "java/lang/StringBuilder", "append", "(I)Ljava/lang/StringBuilder;"));
        list.push(Insn::Ldc(Constant::String(")".to_string())));
        list.push(invoke(INVOKEVIRTUAL, "java/lang/StringBuilder", "append", "(Ljava/lang/String;)Ljava/lang/StringBuilder;"));
        list.push(invoke(INVOKEVIRTUAL, "java/lang/StringBuilder", "toString", "()Ljava/lang/String;"));
        list.push(invoke(INVOKESTATIC, "ac", "a", "(Ljava/lang/Throwable;Ljava/lang/String;)Lbd;"));
        list.push(new("java/lang/RuntimeException"));
        list.push(Insn::Simple(DUP));
        list.push(invoke(INVOKESPECIAL, "java/lang/RuntimeException", "<init>", "()V"));
        list.push(Insn::Simple(ATHROW));

        Code {
            instructions: list,
            exception_ranges: vec![ExceptionRange {
                start,
                end,
                handler,
                catch_type: Some(catch_type.to_string()),
            }],
            ..Code::default()
        }
    }

    #[test]
    fn tracing_handlers_are_removed() {
        let matcher = InsnMatcher::compile(TRACING_HANDLER).unwrap();
        let mut code = traced_method(RUNTIME_EXCEPTION);
        assert_eq!(remove_tracing_handlers(&mut code, &matcher), 1);
        assert!(code.exception_ranges.is_empty());
        assert_eq!(
            mnemonics(&code.instructions),
            vec!["LABEL", "ILOAD", "IRETURN", "LABEL", "LABEL"]
        );
        assert_eq!(remove_tracing_handlers(&mut code, &matcher), 0);
    }

    #[test]
    fn other_handlers_are_kept() {
        let matcher = InsnMatcher::compile(TRACING_HANDLER).unwrap();
        let mut code = traced_method("java/io/IOException");
        assert_eq!(remove_tracing_handlers(&mut code, &matcher), 0);
        assert_eq!(code.exception_ranges.len(), 1);
        assert_eq!(code.instructions.len(), 20);
    }
}
