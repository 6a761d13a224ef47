//! Masks constant shift distances.
//!
//! The JVM only uses the low five bits of an `int` shift distance and the low
//! six bits of a `long` one. Obfuscators push out-of-range distances such as
//! `x << 35`, which decompile into confusing source.

use crate::error::Result;
use crate::insn::Insn;
use crate::matcher::InsnMatcher;
use crate::opcodes::{LSHL, LSHR, LUSHR};
use crate::pipeline::{StageContext, Transform};
use crate::program::{Code, MethodUnit, Program};

const CONSTANT_SHIFT: &str = "(ICONST | BIPUSH | SIPUSH | LDC) (ISHL | ISHR | IUSHR | LSHL | LSHR | LUSHR)";

#[derive(Default)]
pub struct BitShiftState {
    shift: Option<InsnMatcher>,
}

fn compile(_: &mut Program, ctx: &mut StageContext<'_, BitShiftState>) -> Result<bool> {
    ctx.state.shift = Some(InsnMatcher::compile(CONSTANT_SHIFT)?);
    Ok(false)
}

/// Replaces every out-of-range constant shift distance with its masked value.
pub fn mask_shifts(code: &mut Code, shift: &InsnMatcher) -> usize {
    let mut masked = 0;
    for run in shift.matches(&code.instructions) {
        let list = &code.instructions;
        let distance = match list.get(run[0]).int_constant() {
            Some(distance) => distance,
            None => continue,
        };
        let mask = match list.get(run[1]).opcode() {
            Some(LSHL) | Some(LSHR) | Some(LUSHR) => 63,
            _ => 31,
        };
        if distance & mask != distance {
            code.instructions.replace(run[0], Insn::push_int(distance & mask));
            masked += 1;
        }
    }
    masked
}

fn bit_shift(_: &MethodUnit, code: &mut Code, ctx: &mut StageContext<'_, BitShiftState>) -> Result<bool> {
    let masked = match &ctx.state.shift {
        Some(shift) => mask_shifts(code, shift),
        None => 0,
    };
    ctx.stats.add("masked_shifts", masked);
    Ok(masked > 0)
}

pub static BIT_SHIFT: Transform<BitShiftState> = Transform {
    before_all: Some(compile),
    code: Some(bit_shift),
    ..Transform::new("bit-shift")
};
