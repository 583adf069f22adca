// AST node types for tile-language (.tl) kernel sources.
//
// Every node carries a `SimpleSpan` for error reporting in the IR builder.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use chumsky::span::SimpleSpan;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

// ── Root ──

/// A translation unit: function definitions and module-scope declarations.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub items: Vec<Item>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Function(FunctionDef),
    Global(Declaration),
}

// ── Functions ──

/// `T name(T a, T b) { ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub ret: TypeSpec,
    pub name: Ident,
    pub params: Vec<ParamDecl>,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub ty: TypeSpec,
    pub name: Ident,
    pub span: Span,
}

// ── Types ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Void,
    Int1,
    Int8,
    Int16,
    Int32,
    Int64,
    Fp16,
    Fp32,
    Fp64,
}

/// Base type plus the number of `*` that follow it.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSpec {
    pub base: BaseType,
    pub pointer_depth: usize,
    pub span: Span,
}

// ── Declarations ──

/// `fp32* pa[32, 8] = a + ..., pb;`
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub ty: TypeSpec,
    pub declarators: Vec<Declarator>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declarator {
    pub name: Ident,
    /// Tile extents; `None` declares a scalar.
    pub shape: Option<Vec<Expr>>,
    pub init: Option<Expr>,
    pub span: Span,
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Decl(Declaration),
    /// `target = value;` where target is an identifier or `*expr`.
    Assign { target: Expr, value: Expr },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Block,
    },
    Block(Block),
    Return,
    Expr(Expr),
}

// ── Expressions ──

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Deref,
}

/// One position of a subscript list: `:` keeps an axis, `newaxis` inserts one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscript {
    All,
    NewAxis,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Ident(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `base[:, newaxis]`
    Index {
        base: Box<Expr>,
        subscripts: Vec<Subscript>,
    },
    /// `start ... end`
    Range { start: Box<Expr>, end: Box<Expr> },
    /// `get_global_range[size](axis)`
    GlobalRange { size: Box<Expr>, axis: Box<Expr> },
    /// `dot(a, b, c)`
    Dot {
        a: Box<Expr>,
        b: Box<Expr>,
        c: Box<Expr>,
    },
}

// ── Identifiers ──

#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

impl Program {
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.items.iter().filter_map(|item| match item {
            Item::Function(f) => Some(f),
            Item::Global(_) => None,
        })
    }
}
