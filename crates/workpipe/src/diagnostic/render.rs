//! Diagnostic rendering for terminals and editors.
//!
//! Rendering is a pure function of the diagnostic, the source text and
//! the options; concurrent rendering is safe because the inputs are
//! immutable.

use annotate_snippets::{AnnotationKind, Group, Level, Renderer, Snippet};
use serde::Serialize;

use crate::diagnostic::{Diagnostic, Severity};
use crate::source::SourceMap;

impl From<Severity> for Level<'_> {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Error => Level::ERROR,
            Severity::Warning => Level::WARNING,
            Severity::Info => Level::INFO,
        }
    }
}

/// Renders one diagnostic as terminal text.
///
/// The output is a `file:line:col: severity[code]: message` header
/// followed by a caret-underlined source excerpt and an optional
/// `hint:` line. ANSI styling is applied only when `color` is set;
/// callers decide that from their output stream.
pub fn render(diagnostic: &Diagnostic, source: &str, path: &str, color: bool) -> String {
    let map = SourceMap::new(source);
    let (line, col) = map.line_col(diagnostic.span.start);

    let header = format!(
        "{path}:{line}:{col}: {severity}[{code}]: {message}",
        severity = diagnostic.severity,
        code = diagnostic.code,
        message = diagnostic.message,
    );

    let mut group = Group::with_title(
        Level::from(diagnostic.severity)
            .primary_title(&diagnostic.message)
            .id(diagnostic.code.as_str()),
    );

    if !source.is_empty() {
        let start = diagnostic.span.start.min(source.len());
        let end = diagnostic.span.end.clamp(start, source.len());

        group = group.element(
            Snippet::source(source)
                .fold(true)
                .line_start(1)
                .path(path)
                .annotations([AnnotationKind::Primary.span(start..end)]),
        );
    }

    if let Some(hint) = &diagnostic.hint {
        group = group.element(Level::HELP.message(hint));
    }

    let renderer = if color {
        Renderer::styled()
    } else {
        Renderer::plain()
    };

    format!("{header}\n{body}", body = renderer.render(&[group]))
}

#[derive(Serialize)]
struct JsonDiagnostic<'a> {
    #[serde(flatten)]
    diagnostic: &'a Diagnostic,
    path: &'a str,
    line: usize,
    col: usize,
}

/// Renders a batch of diagnostics as a JSON array, with line/column
/// resolved for editor consumers.
pub fn render_json(diagnostics: &[Diagnostic], source: &str, path: &str) -> String {
    let map = SourceMap::new(source);

    let entries: Vec<JsonDiagnostic> = diagnostics
        .iter()
        .map(|diagnostic| {
            let (line, col) = map.line_col(diagnostic.span.start);
            JsonDiagnostic {
                diagnostic,
                path,
                line,
                col,
            }
        })
        .collect();

    // Serialization of this shape cannot fail.
    serde_json::to_string_pretty(&entries).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use crate::diagnostic::{Code, Diagnostic, Span};

    use super::{render, render_json};

    #[test]
    fn test_render_header() {
        let source = "workflow w {\n  job j {\n  }\n}\n";
        let span = Span::new(source.find("job").unwrap(), source.find("job").unwrap() + 3);
        let diag = Diagnostic::error(Code::MissingRunner, "job `j` has no runner", span)
            .with_hint("add `runs_on:` to the job");

        let out = render(&diag, source, "ci.workpipe", false);
        assert!(out.starts_with("ci.workpipe:2:3: error[WP7001]: job `j` has no runner"));
        assert!(out.contains("^^^"));
        assert!(out.contains("add `runs_on:` to the job"));
    }

    #[test]
    fn test_render_no_color_is_plain() {
        let diag = Diagnostic::error(Code::Parse, "unexpected token", Span::new(0, 1));
        let out = render(&diag, "x", "a.workpipe", false);
        assert!(!out.contains('\u{1b}'));
    }

    #[test]
    fn test_render_json_positions() {
        let source = "ab\ncd\n";
        let diag = Diagnostic::error(Code::Parse, "boom", Span::new(3, 4));
        let out = render_json(&[diag], source, "a.workpipe");

        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["code"], "WP0001");
        assert_eq!(parsed[0]["line"], 2);
        assert_eq!(parsed[0]["col"], 1);
    }
}
