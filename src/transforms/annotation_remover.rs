//! Strips annotations, including the obfuscator's original-name markers.

use crate::error::Result;
use crate::pipeline::{StageContext, Transform};
use crate::program::{Annotation, ClassUnit, FieldUnit, MethodUnit};

fn clear(annotations: &mut Vec<Annotation>, ctx: &mut StageContext<'_, ()>) -> bool {
    if annotations.is_empty() {
        return false;
    }
    ctx.stats.add("removed_annotations", annotations.len());
    annotations.clear();
    true
}

fn class(class: &mut ClassUnit, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    Ok(clear(&mut class.annotations, ctx))
}

fn field(field: &mut FieldUnit, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    Ok(clear(&mut field.annotations, ctx))
}

fn method(method: &mut MethodUnit, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    Ok(clear(&mut method.annotations, ctx))
}

pub static ANNOTATION_REMOVER: Transform = Transform {
    class: Some(class),
    field: Some(field),
    method_pre: Some(method),
    ..Transform::new("annotation-remover")
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{run, Settings};
    use crate::program::{AccessFlags, Program};

    fn marker() -> Annotation {
        Annotation {
            descriptor: "LObfuscatedName;".to_string(),
            visible: false,
            values: Vec::new(),
        }
    }

    #[test]
    fn annotations_are_cleared() {
        let mut class = ClassUnit::new("a", Some("java/lang/Object"), AccessFlags::PUBLIC);
        class.annotations.push(marker());
        let mut field = FieldUnit::new("a", "b", "I", AccessFlags::empty());
        field.annotations.push(marker());
        field.annotations.push(marker());
        class.fields.push(field);
        class.methods.push(MethodUnit::new("a", "c", "()V", AccessFlags::empty()));
        let mut program = Program::new(vec![class]);

        let report = run(&ANNOTATION_REMOVER, &mut program, &Settings::default()).unwrap();
        assert_eq!(report.counters.get("removed_annotations"), 3);
        assert!(program.classes[0].annotations.is_empty());
        assert!(program.classes[0].fields[0].annotations.is_empty());
    }
}
