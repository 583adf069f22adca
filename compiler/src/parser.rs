// Parser for tile-language (.tl) kernel sources.
//
// Parses a token stream (from the lexer) into an AST. Uses chumsky
// combinators. Expression precedence, lowest first: range `a ... b`,
// comparison, additive, multiplicative, unary `-`/`*`, postfix subscripts,
// primaries.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics; parsing continues.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Option<Program>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a tile-language source string. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = program_parser(source);
    let (program, parse_errors) = parser.parse(stream).into_output_errors();

    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        program,
        errors: all_errors,
    }
}

fn join(a: Span, b: Span) -> Span {
    (a.start()..b.end()).into()
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr {
        span: join(lhs.span, rhs.span),
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    }
}

// ── Main parser builder ──
//
// Identifiers are sliced from `source` by span, so every rule is built
// inside `program_parser` where the reference is in scope.

fn program_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Program, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    // ── Types ──

    let base_type = select! {
        Token::Void => BaseType::Void,
        Token::Int1 => BaseType::Int1,
        Token::Int8 => BaseType::Int8,
        Token::Int16 => BaseType::Int16,
        Token::Int32 => BaseType::Int32,
        Token::Int64 => BaseType::Int64,
        Token::Fp16 => BaseType::Fp16,
        Token::Fp32 => BaseType::Fp32,
        Token::Fp64 => BaseType::Fp64,
    };

    let type_spec = base_type
        .then(just(Token::Star).repeated().count())
        .map_with(|(base, pointer_depth), e| TypeSpec {
            base,
            pointer_depth,
            span: e.span(),
        });

    // ── Expressions ──

    let expr = {
        let ident = ident.clone();
        recursive(move |expr| {
            let literal = select! {
                Token::Int(n) => ExprKind::Int(n),
                Token::Float(v) => ExprKind::Float(v),
            };

            let global_range = just(Token::GetGlobalRange)
                .ignore_then(
                    expr.clone()
                        .delimited_by(just(Token::LBracket), just(Token::RBracket)),
                )
                .then(
                    expr.clone()
                        .delimited_by(just(Token::LParen), just(Token::RParen)),
                )
                .map(|(size, axis)| ExprKind::GlobalRange {
                    size: Box::new(size),
                    axis: Box::new(axis),
                });

            let dot_call = just(Token::Dot)
                .ignore_then(
                    expr.clone()
                        .then_ignore(just(Token::Comma))
                        .then(expr.clone())
                        .then_ignore(just(Token::Comma))
                        .then(expr.clone())
                        .delimited_by(just(Token::LParen), just(Token::RParen)),
                )
                .map(|((a, b), c)| ExprKind::Dot {
                    a: Box::new(a),
                    b: Box::new(b),
                    c: Box::new(c),
                });

            let name = ident.clone().map(|id: Ident| ExprKind::Ident(id.name));

            let atom = choice((literal, global_range, dot_call, name))
                .map_with(|kind, e| Expr {
                    kind,
                    span: e.span(),
                })
                .or(expr
                    .clone()
                    .delimited_by(just(Token::LParen), just(Token::RParen)));

            // ── Postfix: base[:, newaxis] ──

            let subscript = select! {
                Token::Colon => Subscript::All,
                Token::NewAxis => Subscript::NewAxis,
            };
            let subscripts = subscript
                .separated_by(just(Token::Comma))
                .at_least(1)
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBracket), just(Token::RBracket))
                .map_with(|subs, e| (subs, e.span()));

            let postfix = atom.foldl(subscripts.repeated(), |base: Expr, (subscripts, span)| Expr {
                span: join(base.span, span),
                kind: ExprKind::Index {
                    base: Box::new(base),
                    subscripts,
                },
            });

            // ── Unary ──

            let unary_op = select! {
                Token::Minus => UnaryOp::Neg,
                Token::Star => UnaryOp::Deref,
            }
            .map_with(|op, e| (op, e.span()));

            let unary = unary_op
                .repeated()
                .foldr(postfix, |(op, span), operand: Expr| Expr {
                    span: join(span, operand.span),
                    kind: ExprKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                })
                .boxed();

            // ── Binary levels ──

            let mul_op = select! {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Rem,
            };
            let product = unary
                .clone()
                .foldl(mul_op.then(unary).repeated(), |lhs, (op, rhs)| {
                    binary(op, lhs, rhs)
                })
                .boxed();

            let add_op = select! {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
            };
            let sum = product
                .clone()
                .foldl(add_op.then(product).repeated(), |lhs, (op, rhs)| {
                    binary(op, lhs, rhs)
                })
                .boxed();

            let cmp_op = select! {
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::Ne,
            };
            let comparison = sum
                .clone()
                .foldl(cmp_op.then(sum).repeated(), |lhs, (op, rhs)| {
                    binary(op, lhs, rhs)
                })
                .boxed();

            // ── Range: a ... b ──

            comparison
                .clone()
                .then(just(Token::Ellipsis).ignore_then(comparison).or_not())
                .map(|(start, end)| match end {
                    Some(end) => Expr {
                        span: join(start.span, end.span),
                        kind: ExprKind::Range {
                            start: Box::new(start),
                            end: Box::new(end),
                        },
                    },
                    None => start,
                })
        })
    };

    // ── Declarations ──

    let shape = expr
        .clone()
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBracket), just(Token::RBracket));

    let declarator = ident
        .clone()
        .then(shape.or_not())
        .then(just(Token::Assign).ignore_then(expr.clone()).or_not())
        .map_with(|((name, shape), init), e| Declarator {
            name,
            shape,
            init,
            span: e.span(),
        });

    let declaration = type_spec
        .clone()
        .then(
            declarator
                .separated_by(just(Token::Comma))
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .map_with(|(ty, declarators), e| Declaration {
            ty,
            declarators,
            span: e.span(),
        });

    // ── Statements ──

    // Declaration or assignment without the trailing `;` (for-loop headers).
    let simple_stmt = {
        let decl = declaration.clone().map(StmtKind::Decl);
        let assign = expr
            .clone()
            .then_ignore(just(Token::Assign))
            .then(expr.clone())
            .map(|(target, value)| StmtKind::Assign { target, value });
        decl.or(assign).map_with(|kind, e| Stmt {
            kind,
            span: e.span(),
        })
    };

    let stmt = {
        let expr = expr.clone();
        let simple_stmt = simple_stmt.clone();
        recursive(move |stmt| {
            let block = stmt
                .clone()
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace))
                .map_with(|stmts, e| Block {
                    stmts,
                    span: e.span(),
                });

            let body = block.clone().or(stmt.clone().map(|s: Stmt| Block {
                span: s.span,
                stmts: vec![s],
            }));

            let for_stmt = just(Token::For)
                .ignore_then(
                    simple_stmt
                        .clone()
                        .or_not()
                        .then_ignore(just(Token::Semi))
                        .then(expr.clone().or_not())
                        .then_ignore(just(Token::Semi))
                        .then(simple_stmt.clone().or_not())
                        .delimited_by(just(Token::LParen), just(Token::RParen)),
                )
                .then(body)
                .map(|(((init, cond), step), body)| StmtKind::For {
                    init: init.map(Box::new),
                    cond,
                    step: step.map(Box::new),
                    body,
                });

            let ret = just(Token::Return)
                .then(just(Token::Semi))
                .to(StmtKind::Return);

            let kind = choice((
                for_stmt,
                block.map(StmtKind::Block),
                ret,
                simple_stmt
                    .clone()
                    .then_ignore(just(Token::Semi))
                    .map(|s: Stmt| s.kind),
                expr.clone().then_ignore(just(Token::Semi)).map(StmtKind::Expr),
            ));

            kind.map_with(|kind, e| Stmt {
                kind,
                span: e.span(),
            })
        })
    };

    let block = stmt
        .repeated()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBrace), just(Token::RBrace))
        .map_with(|stmts, e| Block {
            stmts,
            span: e.span(),
        });

    // ── Items ──

    let param = type_spec
        .clone()
        .then(ident.clone())
        .map_with(|(ty, name), e| ParamDecl {
            ty,
            name,
            span: e.span(),
        });

    let function = type_spec
        .then(ident)
        .then(
            param
                .separated_by(just(Token::Comma))
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then(block)
        .map_with(|(((ret, name), params), body), e| {
            Item::Function(FunctionDef {
                ret,
                name,
                params,
                body,
                span: e.span(),
            })
        });

    let global = declaration
        .then_ignore(just(Token::Semi))
        .map(Item::Global);

    choice((function, global))
        .repeated()
        .collect::<Vec<_>>()
        .map_with(|items, e| Program {
            items,
            span: e.span(),
        })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        let result = parse(source);
        assert!(
            result.errors.is_empty(),
            "unexpected errors: {:#?}",
            result.errors
        );
        result.program.expect("expected program")
    }

    fn parse_all(source: &str) -> (Option<Program>, Vec<Rich<'static, Token, SimpleSpan>>) {
        let result = parse(source);
        (result.program, result.errors)
    }

    /// Parse `void f() { <body> }` and return the body statements.
    fn parse_body(body: &str) -> Vec<Stmt> {
        let prog = parse_ok(&format!("void f() {{ {} }}", body));
        let Some(Item::Function(f)) = prog.items.into_iter().next() else {
            panic!("expected function")
        };
        f.body.stmts
    }

    fn parse_expr(src: &str) -> Expr {
        let mut stmts = parse_body(&format!("{};", src));
        let StmtKind::Expr(e) = stmts.remove(0).kind else {
            panic!("expected expression statement")
        };
        e
    }

    #[test]
    fn empty_program() {
        let prog = parse_ok("");
        assert!(prog.items.is_empty());
    }

    #[test]
    fn function_signature() {
        let prog = parse_ok("void matmul(fp32 *a, int32 M) { }");
        let Item::Function(f) = &prog.items[0] else {
            panic!("expected function")
        };
        assert_eq!(f.name.name, "matmul");
        assert_eq!(f.ret.base, BaseType::Void);
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.params[0].ty.base, BaseType::Fp32);
        assert_eq!(f.params[0].ty.pointer_depth, 1);
        assert_eq!(f.params[1].ty.pointer_depth, 0);
    }

    #[test]
    fn global_declaration() {
        let prog = parse_ok("int32 TM = 32, TN = 16;");
        let Item::Global(d) = &prog.items[0] else {
            panic!("expected global")
        };
        assert_eq!(d.declarators.len(), 2);
        assert_eq!(d.declarators[1].name.name, "TN");
    }

    #[test]
    fn tile_declaration_with_shape() {
        let stmts = parse_body("fp32* pa[32, 8] = a;");
        let StmtKind::Decl(d) = &stmts[0].kind else {
            panic!("expected declaration")
        };
        let shape = d.declarators[0].shape.as_ref().expect("shape");
        assert_eq!(shape.len(), 2);
        assert!(matches!(shape[0].kind, ExprKind::Int(32)));
        assert!(matches!(shape[1].kind, ExprKind::Int(8)));
    }

    #[test]
    fn range_binds_loosest() {
        let e = parse_expr("0 ... 4 * 2");
        let ExprKind::Range { start, end } = e.kind else {
            panic!("expected range")
        };
        assert!(matches!(start.kind, ExprKind::Int(0)));
        assert!(matches!(end.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let e = parse_expr("a + b * c");
        let ExprKind::Binary { op, rhs, .. } = e.kind else {
            panic!("expected binary")
        };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn newaxis_subscripts() {
        let e = parse_expr("rx[:, newaxis]");
        let ExprKind::Index { base, subscripts } = e.kind else {
            panic!("expected index")
        };
        assert!(matches!(base.kind, ExprKind::Ident(ref n) if n == "rx"));
        assert_eq!(subscripts, vec![Subscript::All, Subscript::NewAxis]);
    }

    #[test]
    fn subscript_binds_tighter_than_multiplication() {
        let e = parse_expr("rka[newaxis, :] * M");
        let ExprKind::Binary { op, lhs, .. } = e.kind else {
            panic!("expected binary")
        };
        assert_eq!(op, BinOp::Mul);
        assert!(matches!(lhs.kind, ExprKind::Index { .. }));
    }

    #[test]
    fn deref_and_builtins() {
        let e = parse_expr("dot(*pa, *pb, C)");
        let ExprKind::Dot { a, .. } = e.kind else {
            panic!("expected dot")
        };
        assert!(matches!(
            a.kind,
            ExprKind::Unary {
                op: UnaryOp::Deref,
                ..
            }
        ));

        let e = parse_expr("get_global_range[32](1)");
        assert!(matches!(e.kind, ExprKind::GlobalRange { .. }));
    }

    #[test]
    fn store_through_pointer() {
        let stmts = parse_body("*pc = C;");
        let StmtKind::Assign { target, .. } = &stmts[0].kind else {
            panic!("expected assignment")
        };
        assert!(matches!(
            target.kind,
            ExprKind::Unary {
                op: UnaryOp::Deref,
                ..
            }
        ));
    }

    #[test]
    fn for_loop_header() {
        let stmts = parse_body("for(k = K; k > 0; k = k - 8){ C = C; }");
        let StmtKind::For {
            init,
            cond,
            step,
            body,
        } = &stmts[0].kind
        else {
            panic!("expected for")
        };
        assert!(init.is_some());
        assert!(matches!(
            cond.as_ref().map(|c| &c.kind),
            Some(ExprKind::Binary { op: BinOp::Gt, .. })
        ));
        assert!(step.is_some());
        assert_eq!(body.stmts.len(), 1);
    }

    #[test]
    fn spans_cover_constructs() {
        let src = "void f() { x + y; }";
        let prog = parse_ok(src);
        let Item::Function(f) = &prog.items[0] else {
            panic!("expected function")
        };
        let StmtKind::Expr(e) = &f.body.stmts[0].kind else {
            panic!("expected expression")
        };
        assert_eq!(&src[e.span.start()..e.span.end()], "x + y");
    }

    #[test]
    fn error_missing_semicolon() {
        let (_, errors) = parse_all("void f() { int32 x = 1 }");
        assert!(!errors.is_empty());
    }

    #[test]
    fn lex_errors_are_reported() {
        let (_, errors) = parse_all("void f() { int32 x = 1 @ 2; }");
        assert!(!errors.is_empty());
    }

    #[test]
    fn matmul_kernel_parses() {
        let src = include_str!("../../kernels/matmul.tl");
        let prog = parse_ok(src);
        assert_eq!(prog.functions().count(), 1);
    }
}
