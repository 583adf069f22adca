// Lexer for tile-language (.tl) kernel sources.
//
// C-like lexical structure: type keywords, a handful of tile keywords,
// integer and float literals, identifiers and punctuation. Uses the `logos`
// crate for DFA-based lexing.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Tile-language token types.
///
/// Identifiers carry no value; the parser slices the source by span.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
pub enum Token {
    // ── Type keywords ──
    #[token("void")]
    Void,
    #[token("int1")]
    Int1,
    #[token("int8")]
    Int8,
    #[token("int16")]
    Int16,
    #[token("int32")]
    Int32,
    #[token("int64")]
    Int64,
    #[token("fp16")]
    Fp16,
    #[token("fp32")]
    Fp32,
    #[token("fp64")]
    Fp64,

    // ── Keywords ──
    #[token("for")]
    For,
    #[token("return")]
    Return,
    #[token("newaxis")]
    NewAxis,
    #[token("get_global_range")]
    GetGlobalRange,
    #[token("dot")]
    Dot,

    // ── Symbols ──
    #[token("...")]
    Ellipsis,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("=")]
    Assign,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,

    // ── Literals ──
    //
    // Float must be tried before Int; logos picks the longest match, so
    // `1.5` lexes as one Float rather than Int + error.
    /// Floating literal (`1.0`, `2.5e-3`).
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    /// Decimal integer literal.
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    // ── Identifier ──
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Token::Void => "void",
            Token::Int1 => "int1",
            Token::Int8 => "int8",
            Token::Int16 => "int16",
            Token::Int32 => "int32",
            Token::Int64 => "int64",
            Token::Fp16 => "fp16",
            Token::Fp32 => "fp32",
            Token::Fp64 => "fp64",
            Token::For => "for",
            Token::Return => "return",
            Token::NewAxis => "newaxis",
            Token::GetGlobalRange => "get_global_range",
            Token::Dot => "dot",
            Token::Ellipsis => "...",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Le => "<=",
            Token::Ge => ">=",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Assign => "=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::Comma => ",",
            Token::Semi => ";",
            Token::Colon => ":",
            Token::Float(v) => return write!(f, "{}", v),
            Token::Int(v) => return write!(f, "{}", v),
            Token::Ident => "identifier",
        };
        write!(f, "{}", s)
    }
}

// ── Public API ──

/// Lex a tile-language source string into tokens.
///
/// Lexing is non-fatal: errors are collected and the lexer continues past
/// bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_ok(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(
            result.errors.is_empty(),
            "unexpected lex errors: {:?}",
            result.errors
        );
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn type_keywords() {
        let tokens = lex_ok("void int1 int8 int16 int32 int64 fp16 fp32 fp64");
        assert_eq!(
            tokens,
            vec![
                Token::Void,
                Token::Int1,
                Token::Int8,
                Token::Int16,
                Token::Int32,
                Token::Int64,
                Token::Fp16,
                Token::Fp32,
                Token::Fp64,
            ]
        );
    }

    #[test]
    fn keyword_prefix_is_ident() {
        assert_eq!(lex_ok("format dotted"), vec![Token::Ident, Token::Ident]);
        assert_eq!(lex_ok("for dot"), vec![Token::For, Token::Dot]);
    }

    #[test]
    fn range_and_literals() {
        let tokens = lex_ok("0 ... 8 1.5 2.0e3");
        assert_eq!(
            tokens,
            vec![
                Token::Int(0),
                Token::Ellipsis,
                Token::Int(8),
                Token::Float(1.5),
                Token::Float(2000.0),
            ]
        );
    }

    #[test]
    fn comparison_operators_prefer_longest() {
        let tokens = lex_ok("<= < == = != >= >");
        assert_eq!(
            tokens,
            vec![
                Token::Le,
                Token::Lt,
                Token::EqEq,
                Token::Assign,
                Token::NotEq,
                Token::Ge,
                Token::Gt,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = lex_ok("a // line\n/* block\n * more */ b");
        assert_eq!(tokens, vec![Token::Ident, Token::Ident]);
    }

    #[test]
    fn subscript_tokens() {
        let tokens = lex_ok("rx[:, newaxis]");
        assert_eq!(
            tokens,
            vec![
                Token::Ident,
                Token::LBracket,
                Token::Colon,
                Token::Comma,
                Token::NewAxis,
                Token::RBracket,
            ]
        );
    }

    #[test]
    fn spans_are_byte_offsets() {
        let result = lex("  fp32 x");
        assert_eq!(result.tokens[0].1, Span { start: 2, end: 6 });
        assert_eq!(result.tokens[1].1, Span { start: 7, end: 8 });
    }

    #[test]
    fn unknown_character_is_non_fatal() {
        let result = lex("a @ b");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].span, Span { start: 2, end: 3 });
        assert_eq!(result.tokens.len(), 2);
    }
}
