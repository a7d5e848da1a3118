//! Surface parsing: the pest grammar and the concrete-tree reader.
//!
//! The pest `Pairs` tree is the concrete parse tree; [`parse_file`]
//! walks it into a [`FileAst`]. Parse failures become `WP0001`
//! diagnostics rather than errors: callers always get the diagnostics
//! they can render, and an AST only when one could be built.

use pest::Parser as _;

use crate::diagnostic::{Code, Diagnostic, Diagnostics, Span};

pub mod ast;
mod reader;

use ast::FileAst;

// The generated parser stays in its own module so the rest of the
// crate interacts with typed rules only.
mod grammar {
    use pest_derive::Parser;

    #[derive(Parser)]
    #[grammar = "parser/workpipe.pest"]
    pub struct WorkPipeParser;
}

pub(crate) use grammar::{Rule, WorkPipeParser};

/// Parses one file into an AST, accumulating diagnostics.
///
/// Returns `None` when the source does not parse at all; structural
/// problems inside an otherwise well-formed tree (`WP0002`) still
/// yield an AST for best-effort downstream analysis.
pub fn parse_file(source: &str, diagnostics: &mut Diagnostics) -> Option<FileAst> {
    let mut pairs = match WorkPipeParser::parse(Rule::file, source) {
        Ok(pairs) => pairs,
        Err(err) => {
            let span = match err.location {
                pest::error::InputLocation::Pos(pos) => Span::new(pos, pos),
                pest::error::InputLocation::Span((start, end)) => Span::new(start, end),
            };
            diagnostics.push(Diagnostic::error(
                Code::Parse,
                format!("syntax error: {}", err.variant.message()),
                span,
            ));
            return None;
        }
    };

    let file = pairs.next()?;
    Some(reader::lower_file(file, diagnostics))
}
