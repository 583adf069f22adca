// error.rs — Fatal error taxonomy for the tile compiler
//
// Four stage errors abort the pipeline: IR construction (`BuildError`),
// parameter overrides (`ParamError`), shared-memory exhaustion
// (`AllocError`) and missing lowering rules (`LoweringError`). Constraint
// violations are not errors; tuning returns them as data.
//
// `CompileError` wraps all of them for the pipeline and CLI, and every
// variant converts to a coded `Diagnostic`.

use std::path::PathBuf;

use thiserror::Error;

use crate::ast::Span;
use crate::diag::{codes, Diagnostic};

// ── IR construction ──────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("undefined name `{name}`")]
    UndefinedName { name: String, span: Span },

    /// Operand shapes that are not broadcast-compatible.
    #[error("shape mismatch in `{op}`: {lhs} vs {rhs}")]
    ShapeMismatch {
        op: String,
        lhs: String,
        rhs: String,
        span: Span,
        lhs_span: Span,
        rhs_span: Span,
    },

    #[error("type mismatch: {message}")]
    TypeMismatch { message: String, span: Span },

    #[error("{what} must be a constant integer")]
    NonConstant { what: String, span: Span },

    #[error("constant expression `{what}` has no 64-bit integer value")]
    ConstantOverflow { what: String, span: Span },

    #[error("invalid assignment target")]
    InvalidTarget { span: Span },

    #[error("loop-carried variable `{name}` has no value before the loop")]
    UninitializedLoopCarried { name: String, span: Span },

    #[error("`{name}` is already defined in this scope")]
    Redefinition {
        name: String,
        span: Span,
        previous: Span,
    },

    #[error("unsupported construct: {what}")]
    Unsupported { what: String, span: Span },
}

impl BuildError {
    pub fn span(&self) -> Span {
        match self {
            BuildError::UndefinedName { span, .. }
            | BuildError::ShapeMismatch { span, .. }
            | BuildError::TypeMismatch { span, .. }
            | BuildError::NonConstant { span, .. }
            | BuildError::ConstantOverflow { span, .. }
            | BuildError::InvalidTarget { span }
            | BuildError::UninitializedLoopCarried { span, .. }
            | BuildError::Redefinition { span, .. }
            | BuildError::Unsupported { span, .. } => *span,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let code = match self {
            BuildError::UndefinedName { .. } => codes::E0101,
            BuildError::ShapeMismatch { .. } => codes::E0102,
            BuildError::TypeMismatch { .. } => codes::E0103,
            BuildError::NonConstant { .. } => codes::E0104,
            BuildError::InvalidTarget { .. } => codes::E0105,
            BuildError::UninitializedLoopCarried { .. } => codes::E0106,
            BuildError::Redefinition { .. } => codes::E0107,
            BuildError::Unsupported { .. } => codes::E0108,
            BuildError::ConstantOverflow { .. } => codes::E0109,
        };
        let diag = Diagnostic::error(self.to_string())
            .with_code(code)
            .with_span(self.span());
        match self {
            BuildError::ShapeMismatch {
                lhs,
                rhs,
                lhs_span,
                rhs_span,
                ..
            } => diag
                .with_related(*lhs_span, format!("operand of shape {}", lhs))
                .with_related(*rhs_span, format!("operand of shape {}", rhs))
                .with_hint("extents must match or be 1; use newaxis to add a unit axis"),
            BuildError::Redefinition { previous, .. } => {
                diag.with_related(*previous, "previous definition")
            }
            _ => diag,
        }
    }
}

// ── Tuning overrides ─────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("expected {expected} parameter values, got {got}")]
    CountMismatch { expected: usize, got: usize },

    #[error("unknown parameter `{0}`")]
    UnknownName(String),

    #[error("invalid parameter list: {0}")]
    Syntax(String),
}

impl ParamError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.to_string()).with_code(codes::E0202)
    }
}

// ── Allocation ───────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// No free region large enough. `available` is the largest free gap.
    #[error(
        "out of shared memory: {value} requests {requested} bytes, \
         {available} bytes available (budget {budget} bytes)"
    )]
    OutOfSharedMemory {
        value: String,
        requested: u64,
        available: u64,
        budget: u64,
    },

    /// Byte size of a staged tile does not fit in a u64.
    #[error("size of staged value {value} with type {ty} is not representable")]
    SizeOverflow { value: String, ty: String },
}

impl AllocError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            AllocError::OutOfSharedMemory { value, .. } => Diagnostic::error(self.to_string())
                .with_code(codes::E0301)
                .with_subject(value.clone())
                .with_hint("reduce tile sizes or raise --shared-memory"),
            AllocError::SizeOverflow { value, .. } => Diagnostic::error(self.to_string())
                .with_code(codes::E0302)
                .with_subject(value.clone())
                .with_hint("reduce tile sizes"),
        }
    }
}

// ── Instruction selection ────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoweringError {
    #[error("no lowering rule for `{kind}` on {shape}: {reason}")]
    Unsupported {
        kind: &'static str,
        shape: String,
        reason: String,
    },
}

impl LoweringError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.to_string()).with_code(codes::E0401)
    }
}

// ── Configuration ────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid target: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.to_string()).with_code(codes::E0501)
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("{} syntax error(s)", .0.len())]
    Parse(Vec<Diagnostic>),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Lowering(#[from] LoweringError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Raised only when strict mode is on.
    #[error("{} constraint violation(s) in strict mode", .0.len())]
    StrictViolations(Vec<Diagnostic>),

    #[error("internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    /// Diagnostics describing this failure, in report order.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            CompileError::Parse(diags) => diags.clone(),
            CompileError::Build(e) => vec![e.to_diagnostic()],
            CompileError::Param(e) => vec![e.to_diagnostic()],
            CompileError::Alloc(e) => vec![e.to_diagnostic()],
            CompileError::Lowering(e) => vec![e.to_diagnostic()],
            CompileError::Config(e) => vec![e.to_diagnostic()],
            CompileError::Internal(_) => {
                vec![Diagnostic::error(self.to_string()).with_code(codes::E0503)]
            }
            CompileError::StrictViolations(diags) => {
                let mut out: Vec<Diagnostic> = diags
                    .iter()
                    .cloned()
                    .map(|mut d| {
                        d.level = crate::diag::DiagLevel::Error;
                        d
                    })
                    .collect();
                out.push(Diagnostic::error(self.to_string()).with_code(codes::E0502));
                out
            }
        }
    }
}
