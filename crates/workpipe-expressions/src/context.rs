//! Context references (e.g. `needs.build.outputs.report`) and
//! matching helpers for them.

use crate::{Expr, SpannedExpr};

/// Represents a context reference in an expression.
///
/// Most contexts are dotted identifier chains like `matrix.os`, but the
/// head of a context may also be a function call, as in
/// `fromJSON(needs.a.outputs.o).y`.
#[derive(Debug, PartialEq)]
pub struct Context<'src> {
    /// The individual parts of the context.
    pub parts: Vec<SpannedExpr<'src>>,
}

impl<'src> Context<'src> {
    pub(crate) fn new(parts: Vec<SpannedExpr<'src>>) -> Self {
        Self { parts }
    }

    /// Returns the head part's identifier, if the context is headed by
    /// a plain identifier rather than a call.
    pub fn head(&self) -> Option<&str> {
        match self.parts.first().map(|p| &p.inner) {
            Some(Expr::Identifier(ident)) => Some(ident.as_str()),
            _ => None,
        }
    }

    /// Returns the leading dotted-identifier path of this context,
    /// stopping at the first part that isn't a plain identifier.
    ///
    /// `needs.a.outputs.x[0]` yields `needs.a.outputs.x`; a context
    /// headed by a call yields `None`.
    pub fn dotted_path(&self) -> Option<String> {
        self.head()?;

        let idents: Vec<&str> = self
            .parts
            .iter()
            .map_while(|p| match &p.inner {
                Expr::Identifier(ident) => Some(ident.as_str()),
                _ => None,
            })
            .collect();

        Some(idents.join("."))
    }

    /// Returns the leading identifier segments of this context as raw
    /// strings, stopping at the first non-identifier part.
    pub fn segments(&self) -> Vec<&'src str> {
        self.parts
            .iter()
            .map_while(|p| match &p.inner {
                Expr::Identifier(ident) => Some(ident.0),
                _ => None,
            })
            .collect()
    }

    /// If this context is headed by a call to `func` with a single
    /// context argument, returns that inner context.
    ///
    /// This is the `fromJSON(needs.a.outputs.o).y` shape: the caller
    /// gets `needs.a.outputs.o` back, and the remaining parts of `self`
    /// describe the path applied to the decoded value.
    pub fn call_head(&self, func: &str) -> Option<&Context<'src>> {
        match self.parts.first().map(|p| &p.inner) {
            Some(Expr::Call { func: f, args }) if f == func && args.len() == 1 => {
                match &args[0].inner {
                    Expr::Context(inner) => Some(inner),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// The parts of this context after the head, as `(text, span)`
    /// pairs, stopping at the first part that is neither an identifier
    /// nor a star.
    pub fn tail(&self) -> impl Iterator<Item = (&'src str, crate::Span)> + '_ {
        self.parts[1..].iter().map_while(|p| match &p.inner {
            Expr::Identifier(ident) => Some((ident.0, p.span.clone())),
            Expr::Star => Some(("*", p.span.clone())),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::Expr;

    #[test]
    fn test_dotted_path() {
        let cases = &[
            ("needs.a.outputs.x", Some("needs.a.outputs.x")),
            ("needs.a.outputs.x[0]", Some("needs.a.outputs.x")),
            ("matrix.os", Some("matrix.os")),
        ];

        for (src, expected) in cases {
            let expr = Expr::parse(src).unwrap();
            let Expr::Context(ctx) = &expr.inner else {
                panic!("{src} did not parse as a context");
            };
            assert_eq!(ctx.dotted_path().as_deref(), *expected);
        }
    }

    #[test]
    fn test_call_head() {
        let expr = Expr::parse("fromJSON(needs.a.outputs.o).y.z").unwrap();
        let Expr::Context(ctx) = &expr.inner else {
            panic!("expected context");
        };

        let inner = ctx.call_head("fromJSON").unwrap();
        assert_eq!(inner.dotted_path().as_deref(), Some("needs.a.outputs.o"));

        // Case-insensitive function matching.
        assert!(ctx.call_head("fromjson").is_some());
        assert!(ctx.call_head("toJSON").is_none());
    }

    #[test]
    fn test_tail() {
        let expr = Expr::parse("needs.a.outputs.x.y").unwrap();
        let Expr::Context(ctx) = &expr.inner else {
            panic!("expected context");
        };

        let tail: Vec<&str> = ctx.tail().map(|(s, _)| s).collect();
        assert_eq!(tail, ["a", "outputs", "x", "y"]);
    }
}
