//! Puts methods back in source order, using the lowest line number of each
//! body. Methods without line numbers keep their relative order at the end.

use crate::error::Result;
use crate::insn::Insn;
use crate::pipeline::{StageContext, Transform};
use crate::program::{ClassUnit, MemberRef, MethodUnit};

fn first_line(method: &MethodUnit) -> Option<u16> {
    let list = &method.code.as_ref()?.instructions;
    list.iter()
        .filter_map(|id| match list.get(id) {
            Insn::Line(line) => Some(*line),
            _ => None,
        })
        .min()
}

/// Sorts the methods of `class`; true when the order changed.
pub fn sort_methods(class: &mut ClassUnit) -> bool {
    let before: Vec<MemberRef> = class.methods.iter().map(|method| method.key()).collect();
    class
        .methods
        .sort_by_key(|method| first_line(method).map_or((1, 0), |line| (0, line)));
    class.methods.iter().map(|method| method.key()).ne(before)
}

fn sort_class(class: &mut ClassUnit, ctx: &mut StageContext<'_, ()>) -> Result<bool> {
    let changed = sort_methods(class);
    if changed {
        ctx.stats.incr("sorted_classes");
    }
    Ok(changed)
}

pub static SORT_METHODS: Transform = Transform {
    class: Some(sort_class),
    ..Transform::new("sort-methods")
};
