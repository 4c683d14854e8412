//! Embedded expression language for workflow documents
//!
//! Step inputs, conditions and loop sources may contain `{{ expr }}`
//! fragments that reference workflow inputs, defaults, loop variables and
//! the records of other steps.
//!
//! # Features
//!
//! - Dotted paths: `{{ search.output.results[0].title }}`
//! - Fallbacks: `{{ inputs.label || 'untitled' }}`
//! - Concatenation: `{{ 'q=' + inputs.query }}`
//! - Boolean logic and comparisons: `{{ !check.output || check.output.score < 0.85 }}`
//!
//! Missing data resolves to `undefined` and never raises. Only text that
//! does not follow the grammar produces an [`ExpressionError`].

mod dependencies;
mod errors;
mod eval;
mod parser;
mod template;

pub use dependencies::{RESERVED_NAMES, extract_dependencies, extract_expression_dependencies};
pub use errors::{ExpressionError, suggest_correction};
pub use eval::{LoopScope, Scope};
#[allow(unused_imports)]
pub use template::{
    condition_holds, evaluate_source, has_fragment, resolve_str, resolve_value, validate_source,
    validate_value,
};
