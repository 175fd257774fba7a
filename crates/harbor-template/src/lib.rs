//! Template evaluation for service definitions.
//!
//! Service fields such as `startup`, `runs`, `actions`, endpoint
//! application templates, and log-config values may embed `{{ … }}`
//! expressions evaluated with the service itself as context. Two accessors
//! are recognized:
//!
//! - `parent` — resolves the service's parent through a caller-supplied
//!   resolver.
//! - `context` — parses the service's opaque `context` JSON bag.
//!
//! Failure never aborts the caller: a template that does not parse or
//! evaluate yields the empty string with a diagnostic, and the original
//! value is retained. Evaluation happens once on write and again at
//! instance dispatch, so values that contain no template syntax must pass
//! through unchanged.

mod eval;
mod parser;

pub use eval::Evaluator;

use thiserror::Error;

/// Errors raised while parsing or evaluating a template.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template parse error at byte {at}: {message}")]
    Parse { at: usize, message: String },

    #[error("unknown accessor '{0}'")]
    UnknownAccessor(String),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("service {0} has no parent")]
    NoParent(String),

    #[error("could not resolve service '{0}'")]
    Unresolved(String),

    #[error("service {id} context is not valid JSON: {source}")]
    BadContext {
        id: String,
        source: serde_json::Error,
    },

    #[error("value cannot be rendered as text")]
    Unrenderable,
}
