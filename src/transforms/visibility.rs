//! Widens access so relocated members stay reachable and decompiled classes
//! can be split up and recompiled freely.

use crate::error::Result;
use crate::pipeline::{StageContext, Transform};
use crate::program::{AccessFlags, ClassUnit, FieldUnit, MethodUnit};

/// Public and non-final for classes.
pub fn widen_class(access: AccessFlags) -> AccessFlags {
    (access - AccessFlags::PRIVATE - AccessFlags::PROTECTED - AccessFlags::FINAL) | AccessFlags::PUBLIC
}

/// Package-private members become public; everything else is kept.
pub fn widen_member(access: AccessFlags) -> AccessFlags {
    if access.is_package() {
        access | AccessFlags::PUBLIC
    } else {
        access
    }
}

fn class(class: &mut ClassUnit, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let widened = widen_class(class.access);
    if widened == class.access {
        return Ok(false);
    }
    class.access = widened;
    ctx.stats.incr("widened_classes");
    Ok(true)
}

fn field(field: &mut FieldUnit, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let widened = widen_member(field.access);
    if widened == field.access {
        return Ok(false);
    }
    field.access = widened;
    ctx.stats.incr("widened_fields");
    Ok(true)
}

fn method(method: &mut MethodUnit, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let widened = widen_member(method.access);
    if widened == method.access {
        return Ok(false);
    }
    method.access = widened;
    ctx.stats.incr("widened_methods");
    Ok(true)
}

pub static VISIBILITY: Transform = Transform {
    class: Some(class),
    field: Some(field),
    method_pre: Some(method),
    ..Transform::new("visibility")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{run, Settings};
    use crate::program::Program;

    #[test]
    fn flags() {
        assert_eq!(widen_class(AccessFlags::FINAL | AccessFlags::SUPER), AccessFlags::PUBLIC | AccessFlags::SUPER);
        assert_eq!(widen_member(AccessFlags::STATIC), AccessFlags::PUBLIC | AccessFlags::STATIC);
        assert_eq!(widen_member(AccessFlags::PRIVATE), AccessFlags::PRIVATE);
        assert_eq!(widen_member(AccessFlags::PROTECTED), AccessFlags::PROTECTED);
    }

    #[test]
    fn stage_widens_once() {
        let mut class = ClassUnit::new("a", Some("java/lang/Object"), AccessFlags::FINAL);
        class.fields.push(FieldUnit::new("a", "b", "I", AccessFlags::empty()));
        class.fields.push(FieldUnit::new("a", "c", "I", AccessFlags::PRIVATE));
        class
            .methods
            .push(MethodUnit::new("a", "d", "()V", AccessFlags::STATIC));
        let mut program = Program::new(vec![class]);

        let report = run(&VISIBILITY, &mut program, &Settings::default()).unwrap();
        assert_eq!(report.passes, 2);
        assert_eq!(report.counters.get("widened_classes"), 1);
        assert_eq!(report.counters.get("widened_fields"), 1);
        assert_eq!(report.counters.get("widened_methods"), 1);
        assert_eq!(program.classes[0].access, AccessFlags::PUBLIC);
    }
}
