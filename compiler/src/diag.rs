// diag.rs — Unified diagnostics model
//
// Every phase reports through `Diagnostic`: fatal errors convert into one
// (see `error.rs`), and constraint violations from tuning are emitted as
// warnings. Source-level diagnostics carry a span; IR-level ones name the
// value they concern instead.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use chumsky::span::Span as _;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`, `W0201`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Code registry. E00xx front end, E01xx IR construction, W02xx tuning,
/// E03xx allocation, E04xx lowering, E05xx driver.
pub mod codes {
    use super::DiagCode;

    pub const E0001: DiagCode = DiagCode("E0001"); // syntax error
    pub const E0101: DiagCode = DiagCode("E0101"); // undefined name
    pub const E0102: DiagCode = DiagCode("E0102"); // shape mismatch
    pub const E0103: DiagCode = DiagCode("E0103"); // type mismatch
    pub const E0104: DiagCode = DiagCode("E0104"); // non-constant shape or bound
    pub const E0105: DiagCode = DiagCode("E0105"); // invalid assignment target
    pub const E0106: DiagCode = DiagCode("E0106"); // uninitialized loop-carried variable
    pub const E0107: DiagCode = DiagCode("E0107"); // redefinition
    pub const E0108: DiagCode = DiagCode("E0108"); // unsupported construct
    pub const E0109: DiagCode = DiagCode("E0109"); // constant overflow
    pub const W0201: DiagCode = DiagCode("W0201"); // violated tuning constraint
    pub const E0202: DiagCode = DiagCode("E0202"); // bad parameter override
    pub const E0301: DiagCode = DiagCode("E0301"); // out of shared memory
    pub const E0302: DiagCode = DiagCode("E0302"); // staged size overflow
    pub const E0401: DiagCode = DiagCode("E0401"); // unsupported lowering
    pub const E0501: DiagCode = DiagCode("E0501"); // configuration
    pub const E0502: DiagCode = DiagCode("E0502"); // strict-mode violation
    pub const E0503: DiagCode = DiagCode("E0503"); // internal compiler error
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related span ─────────────────────────────────────────────────────────

/// A secondary source location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedSpan {
    pub span: Span,
    pub label: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Option<Span>,
    /// IR value the diagnostic is about, e.g. `%pa.14`.
    pub subject: Option<String>,
    pub message: String,
    pub hint: Option<String>,
    pub related_spans: Vec<RelatedSpan>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span: None,
            subject: None,
            message: message.into(),
            hint: None,
            related_spans: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, message)
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_related(mut self, span: Span, label: impl Into<String>) -> Self {
        self.related_spans.push(RelatedSpan {
            span,
            label: label.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }

    /// Render with `path:line:col` locations resolved against `source`.
    pub fn render(&self, path: &str, source: &str) -> String {
        let mut out = self.to_string();
        if let Some(span) = self.span {
            let (line, col) = line_col(source, span.start());
            out.push_str(&format!("\n  --> {}:{}:{}", path, line, col));
        }
        for rel in &self.related_spans {
            let (line, col) = line_col(source, rel.span.start());
            out.push_str(&format!("\n  note: {} at {}:{}:{}", rel.label, path, line, col));
        }
        out
    }
}

/// 1-based line and column of a byte offset.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let col = offset - before.rfind('\n').map(|p| p + 1).unwrap_or(0) + 1;
    (line, col)
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        match &self.code {
            Some(code) => write!(f, "{}[{}]: ", level, code)?,
            None => write!(f, "{}: ", level)?,
        }
        if let Some(subject) = &self.subject {
            write!(f, "{}: ", subject)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
