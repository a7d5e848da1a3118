//! Parsing and analysis for the `${{ ... }}` expression sub-language
//! that appears inside WorkPipe string scalars.
//!
//! The compiler never evaluates these expressions; it parses them to
//! validate the context references (e.g. `needs.build.outputs.report`)
//! that it can check statically.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use std::ops::{Deref, Range};

use itertools::Itertools;
use pest::{Parser, iterators::Pair};
use thiserror::Error;

use self::parser::{ExprParser, Rule};
use crate::context::Context;

pub mod context;
mod scan;

pub use scan::{Occurrence, extract_expressions};

// The generated parser types live in their own module so that
// `missing_docs` can be enforced everywhere else.
// See: https://github.com/pest-parser/pest/issues/326
mod parser {
    use pest_derive::Parser;

    /// A parser for the Actions expression language.
    #[derive(Parser)]
    #[grammar = "expr.pest"]
    pub struct ExprParser;
}

/// A half-open byte range into the parsed expression source.
pub type Span = Range<usize>;

/// The error produced when an expression fails to parse.
#[derive(Debug, Error, PartialEq)]
#[error("malformed expression: {reason}")]
pub struct ParseError {
    /// Where in the expression source the parse failed.
    pub span: Span,
    /// A short human-readable reason.
    pub reason: String,
}

impl From<pest::error::Error<Rule>> for ParseError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        let span = match err.location {
            pest::error::InputLocation::Pos(pos) => pos..pos,
            pest::error::InputLocation::Span((start, end)) => start..end,
        };

        Self {
            span,
            reason: err.variant.message().into(),
        }
    }
}

/// Represents a function in an expression.
///
/// Function names are case-insensitive.
#[derive(Debug)]
pub struct Function<'src>(pub(crate) &'src str);

impl Function<'_> {
    /// The function name's raw text.
    pub fn as_str(&self) -> &str {
        self.0
    }
}

impl PartialEq for Function<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(other.0)
    }
}

impl PartialEq<str> for Function<'_> {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

/// Represents a single identifier, i.e. a single context component.
///
/// Identifiers are case-insensitive.
#[derive(Debug, Clone, Copy)]
pub struct Identifier<'src>(pub(crate) &'src str);

impl Identifier<'_> {
    /// The identifier's raw text.
    pub fn as_str(&self) -> &str {
        self.0
    }
}

impl PartialEq for Identifier<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(other.0)
    }
}

impl PartialEq<str> for Identifier<'_> {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

/// Binary operations allowed in an expression.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BinOp {
    /// `expr && expr`
    And,
    /// `expr || expr`
    Or,
    /// `expr == expr`
    Eq,
    /// `expr != expr`
    Neq,
    /// `expr > expr`
    Gt,
    /// `expr >= expr`
    Ge,
    /// `expr < expr`
    Lt,
    /// `expr <= expr`
    Le,
}

/// Unary operations allowed in an expression.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum UnOp {
    /// `!expr`
    Not,
}

/// An expression together with its span in the parsed source.
#[derive(Debug, PartialEq)]
pub struct SpannedExpr<'src> {
    /// The expression.
    pub inner: Expr<'src>,
    /// The expression's byte span, relative to the parse input.
    pub span: Span,
}

impl<'src> SpannedExpr<'src> {
    fn new(inner: Expr<'src>, span: Span) -> Self {
        Self { inner, span }
    }
}

impl<'src> Deref for SpannedExpr<'src> {
    type Target = Expr<'src>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Represents an Actions expression.
#[derive(Debug, PartialEq)]
pub enum Expr<'src> {
    /// A number literal.
    Number(f64),
    /// A string literal, with `''` escapes resolved.
    String(String),
    /// A boolean literal.
    Boolean(bool),
    /// The `null` literal.
    Null,
    /// The `*` literal within an index or context.
    Star,
    /// A function call.
    Call {
        /// The function name, e.g. `fromJSON` in `fromJSON(x)`.
        func: Function<'src>,
        /// The function's arguments.
        args: Vec<SpannedExpr<'src>>,
    },
    /// A context identifier component, e.g. `needs` in `needs.build`.
    Identifier(Identifier<'src>),
    /// A context index component, e.g. `[0]` in `foo[0]`.
    Index(Box<SpannedExpr<'src>>),
    /// A full context reference.
    Context(Context<'src>),
    /// A binary operation.
    BinOp {
        /// The LHS of the binop.
        lhs: Box<SpannedExpr<'src>>,
        /// The binary operator.
        op: BinOp,
        /// The RHS of the binop.
        rhs: Box<SpannedExpr<'src>>,
    },
    /// A unary operation.
    UnOp {
        /// The unary operator.
        op: UnOp,
        /// The expression the operator applies to.
        expr: Box<SpannedExpr<'src>>,
    },
}

impl<'src> Expr<'src> {
    /// Parses a single expression (the contents between `${{` and `}}`).
    pub fn parse(src: &'src str) -> Result<SpannedExpr<'src>, ParseError> {
        // expression -> or_expr ~ EOI
        let or_expr = ExprParser::parse(Rule::expression, src)?
            .next()
            .and_then(|p| p.into_inner().next())
            .ok_or_else(|| ParseError {
                span: 0..src.len(),
                reason: "empty expression".into(),
            })?;

        parse_pair(or_expr)
    }

    /// Walks the expression, yielding every context reference in it.
    pub fn contexts(&self) -> Vec<&Context<'src>> {
        let mut out = vec![];
        self.collect_contexts(&mut out);
        out
    }

    fn collect_contexts<'a>(&'a self, out: &mut Vec<&'a Context<'src>>) {
        match self {
            Expr::Context(ctx) => {
                out.push(ctx);
                // Index components may themselves contain contexts,
                // e.g. `foo[needs.a.outputs.idx]`.
                for part in &ctx.parts {
                    if let Expr::Index(inner) = &part.inner {
                        inner.collect_contexts(out);
                    }
                }
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_contexts(out);
                }
            }
            Expr::BinOp { lhs, rhs, .. } => {
                lhs.collect_contexts(out);
                rhs.collect_contexts(out);
            }
            Expr::UnOp { expr, .. } => expr.collect_contexts(out),
            Expr::Index(expr) => expr.collect_contexts(out),
            _ => (),
        }
    }
}

/// Folds a possibly many-headed binop pair into a left-associative tree.
///
/// The grammar isn't left-recursive, so `a || b || c` parses as a single
/// `or_expr` with three children; this rebuilds the expected
/// `BinOp(BinOp(a, b), c)` shape.
fn fold_binop<'src>(
    pair: Pair<'src, Rule>,
    op: BinOp,
) -> Result<SpannedExpr<'src>, ParseError> {
    let mut pairs = pair.into_inner();
    let lhs = parse_pair(pairs.next().expect("binop rule with no operands"))?;
    pairs.try_fold(lhs, |lhs, next| {
        let rhs = parse_pair(next)?;
        let span = lhs.span.start..rhs.span.end;
        Ok(SpannedExpr::new(
            Expr::BinOp {
                lhs: lhs.into(),
                op,
                rhs: rhs.into(),
            },
            span,
        ))
    })
}

/// Like [`fold_binop`], but for rules that interleave an operator
/// capture between operands (`eq_expr`, `comp_expr`).
fn fold_binop_chain<'src>(pair: Pair<'src, Rule>) -> Result<SpannedExpr<'src>, ParseError> {
    let mut pairs = pair.into_inner();
    let lhs = parse_pair(pairs.next().expect("binop chain with no operands"))?;

    let chunks = pairs.chunks(2);
    chunks.into_iter().try_fold(lhs, |lhs, mut chunk| {
        let op = chunk.next().expect("operator pair");
        let rhs = parse_pair(chunk.next().expect("operand pair"))?;

        let op = match op.as_str() {
            "==" => BinOp::Eq,
            "!=" => BinOp::Neq,
            ">" => BinOp::Gt,
            ">=" => BinOp::Ge,
            "<" => BinOp::Lt,
            "<=" => BinOp::Le,
            other => unreachable!("unexpected operator: {other}"),
        };

        let span = lhs.span.start..rhs.span.end;
        Ok(SpannedExpr::new(
            Expr::BinOp {
                lhs: lhs.into(),
                op,
                rhs: rhs.into(),
            },
            span,
        ))
    })
}

fn parse_pair<'src>(pair: Pair<'src, Rule>) -> Result<SpannedExpr<'src>, ParseError> {
    let span = pair.as_span().start()..pair.as_span().end();

    match pair.as_rule() {
        Rule::or_expr => fold_binop(pair, BinOp::Or),
        Rule::and_expr => fold_binop(pair, BinOp::And),
        Rule::eq_expr | Rule::comp_expr => fold_binop_chain(pair),
        Rule::unary_expr => {
            let mut pairs = pair.into_inner();
            let first = pairs.next().expect("unary rule with no operands");

            match first.as_rule() {
                Rule::unary_op => {
                    let expr = parse_pair(pairs.next().expect("negated operand"))?;
                    Ok(SpannedExpr::new(
                        Expr::UnOp {
                            op: UnOp::Not,
                            expr: expr.into(),
                        },
                        span,
                    ))
                }
                Rule::primary_expr => parse_pair(first),
                r => unreachable!("unexpected rule in unary_expr: {r:?}"),
            }
        }
        Rule::primary_expr | Rule::group => {
            // Punch through to the single inner pair.
            parse_pair(pair.into_inner().next().expect("empty primary"))
        }
        Rule::number => {
            let raw = pair.as_str();
            let value = parse_number(raw).ok_or_else(|| ParseError {
                span: span.clone(),
                reason: format!("invalid number literal: {raw}"),
            })?;
            Ok(SpannedExpr::new(Expr::Number(value), span))
        }
        Rule::string => {
            // string -> string_inner
            let inner = pair.into_inner().next().expect("string with no body");
            Ok(SpannedExpr::new(
                Expr::String(inner.as_str().replace("''", "'")),
                span,
            ))
        }
        Rule::boolean => Ok(SpannedExpr::new(
            Expr::Boolean(pair.as_str() == "true"),
            span,
        )),
        Rule::null => Ok(SpannedExpr::new(Expr::Null, span)),
        Rule::star => Ok(SpannedExpr::new(Expr::Star, span)),
        Rule::function_call => {
            let mut pairs = pair.into_inner();
            let identifier = pairs.next().expect("call with no name");
            let args = pairs.map(parse_pair).collect::<Result<_, _>>()?;

            Ok(SpannedExpr::new(
                Expr::Call {
                    func: Function(identifier.as_str()),
                    args,
                },
                span,
            ))
        }
        Rule::identifier => Ok(SpannedExpr::new(
            Expr::Identifier(Identifier(pair.as_str())),
            span,
        )),
        Rule::index => {
            let inner = parse_pair(pair.into_inner().next().expect("empty index"))?;
            Ok(SpannedExpr::new(Expr::Index(inner.into()), span))
        }
        Rule::context => {
            let mut parts = pair
                .into_inner()
                .map(parse_pair)
                .collect::<Result<Vec<_>, _>>()?;

            // The context rule wholly encloses function_call, so a bare
            // call parses as a one-part context; unwrap it back to a Call.
            if parts.len() == 1 && matches!(parts[0].inner, Expr::Call { .. }) {
                Ok(parts.remove(0))
            } else {
                Ok(SpannedExpr::new(Expr::Context(Context::new(parts)), span))
            }
        }
        r => unreachable!("unrecognized rule: {r:?}"),
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    let (neg, body) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };

    let value = match body.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()? as f64,
        None => body.parse().ok()?,
    };

    Some(if neg { -value } else { value })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{BinOp, Expr, Identifier, ParseError, UnOp};

    fn parse(src: &str) -> Expr<'_> {
        Expr::parse(src).map(|e| e.inner).unwrap()
    }

    #[test]
    fn test_identifier_eq() {
        let ident = Identifier("fromJSON");
        assert_eq!(&ident, "fromjson");
        assert_eq!(&ident, "FROMJSON");
        assert_eq!(ident, Identifier("FromJson"));
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(parse("42"), Expr::Number(42.0));
        assert_eq!(parse("-3.5"), Expr::Number(-3.5));
        assert_eq!(parse("0xff"), Expr::Number(255.0));
        assert_eq!(parse("true"), Expr::Boolean(true));
        assert_eq!(parse("false"), Expr::Boolean(false));
        assert_eq!(parse("null"), Expr::Null);
        assert_eq!(parse("'it''s'"), Expr::String("it's".into()));
        assert_eq!(parse("''"), Expr::String("".into()));
    }

    #[test]
    fn test_parse_contexts() {
        let cases = &[
            "needs.build.outputs.report",
            "github.event.issue.labels.*.name",
            "matrix.os",
            "steps['fetch'].outcome",
            "inputs.dry-run",
        ];

        for case in cases {
            let expr = Expr::parse(case).unwrap();
            assert!(
                matches!(expr.inner, Expr::Context(_)),
                "{case} did not parse as a context"
            );
            assert_eq!(expr.span, 0..case.len());
        }
    }

    #[test]
    fn test_parse_call_context() {
        // A call followed by context components parses as a context
        // headed by the call.
        let expr = parse("fromJSON(needs.a.outputs.o).y");
        let Expr::Context(ctx) = expr else {
            panic!("expected context");
        };
        assert!(matches!(ctx.parts[0].inner, Expr::Call { .. }));
        assert_eq!(ctx.parts[1].inner, Expr::Identifier(Identifier("y")));

        // A bare call is unwrapped back to a Call.
        assert!(matches!(parse("always()"), Expr::Call { .. }));
    }

    #[test]
    fn test_parse_operators() {
        let expr = parse("a || b && !c");
        let Expr::BinOp { op, rhs, .. } = expr else {
            panic!("expected binop");
        };
        assert_eq!(op, BinOp::Or);
        let Expr::BinOp { op, rhs, .. } = &rhs.inner else {
            panic!("expected nested binop");
        };
        assert_eq!(*op, BinOp::And);
        assert!(matches!(
            rhs.inner,
            Expr::UnOp {
                op: UnOp::Not,
                ..
            }
        ));

        // Left associativity of chained ops.
        let expr = parse("x == 1 != true");
        let Expr::BinOp { op, lhs, .. } = expr else {
            panic!("expected binop");
        };
        assert_eq!(op, BinOp::Neq);
        assert!(matches!(
            lhs.inner,
            Expr::BinOp {
                op: BinOp::Eq,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_spans_nested() {
        let src = "foo.bar == 'baz'";
        let expr = Expr::parse(src).unwrap();
        assert_eq!(expr.span, 0..src.len());

        let Expr::BinOp { lhs, rhs, .. } = expr.inner else {
            panic!("expected binop");
        };
        assert_eq!(lhs.span, 0..7);
        assert_eq!(&src[rhs.span.clone()], "'baz'");
    }

    #[test]
    fn test_parse_errors() {
        for bad in &["", "(", "a ||", "'unterminated", "1 == ==", "foo..bar"] {
            let err: Result<_, ParseError> = Expr::parse(bad);
            assert!(err.is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_contexts_walk() {
        let expr = Expr::parse(
            "needs.a.outputs.x == 'ok' && format('{0}', needs.b.outputs.y[0])",
        )
        .unwrap();

        let contexts: Vec<String> = expr
            .contexts()
            .iter()
            .map(|c| c.dotted_path().unwrap())
            .collect();

        assert_eq!(contexts, ["needs.a.outputs.x", "needs.b.outputs.y"]);
    }
}
