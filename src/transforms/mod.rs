//! Stage registry and the obfuscation-pattern removers.

use crate::code_graph::{REDUNDANT_GOTO, UNREACHABLE_CODE};
use crate::pipeline::Stage;
use crate::remap::REMAP;
use crate::var_splitter::VARIABLE_SPLITTER;

pub mod annotation_remover;
pub mod bit_shift;
pub mod exception_tracing;
pub mod invoke_dynamic;
pub mod monitor;
pub mod opaque_predicate;
pub mod redundant_exception;
pub mod sort_fields;
pub mod sort_methods;
pub mod static_fields;
pub mod static_methods;
pub mod unused_methods;
pub mod visibility;

pub const RUNTIME_EXCEPTION: &str = "java/lang/RuntimeException";

/// Stages run when none are named.
pub const DEFAULT_PROFILE: &[&str] = &[
    "exception-tracing",
    "redundant-exception",
    "monitor",
    "opaque-predicate",
    "bit-shift",
    "unreachable-code",
    "redundant-goto",
    "variable-splitter",
    "remap",
    "static-methods",
    "unused-methods",
    "static-fields",
    "sort-fields",
    "sort-methods",
    "visibility",
];

static STAGES: &[&dyn Stage] = &[
    &exception_tracing::EXCEPTION_TRACING,
    &redundant_exception::REDUNDANT_EXCEPTION,
    &monitor::MONITOR,
    &opaque_predicate::OPAQUE_PREDICATE,
    &bit_shift::BIT_SHIFT,
    &UNREACHABLE_CODE,
    &REDUNDANT_GOTO,
    &VARIABLE_SPLITTER,
    &REMAP,
    &static_methods::STATIC_METHODS,
    &unused_methods::UNUSED_METHODS,
    &static_fields::STATIC_FIELDS,
    &sort_fields::SORT_FIELDS,
    &sort_methods::SORT_METHODS,
    &visibility::VISIBILITY,
    &annotation_remover::ANNOTATION_REMOVER,
    &invoke_dynamic::DELETE_INVOKEDYNAMIC,
];

/// Finds a stage by its name.
pub fn lookup(name: &str) -> Option<&'static dyn Stage> {
    STAGES.iter().copied().find(|stage| stage.name() == name)
}

/// Names of every registered stage, in default order.
pub fn stage_names() -> impl Iterator<Item = &'static str> {
    STAGES.iter().map(|stage| stage.name())
}
