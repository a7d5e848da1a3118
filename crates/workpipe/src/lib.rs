//! WorkPipe compiles a CI/CD pipeline DSL into GitHub Actions YAML.
//!
//! The compiler is a pipeline of passes over per-file ASTs: parse,
//! import resolution, registry construction, fragment expansion,
//! semantic validation, cycle lowering, and emission. Passes append
//! span-tagged diagnostics instead of failing; a hard stop happens
//! only where a later pass would fabricate nonsense from broken input.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

pub mod diagnostic;
pub mod emit;
pub mod expand;
pub mod ir;
pub mod lower;
pub mod parser;
pub mod resolver;
pub mod source;
pub mod types;
pub mod validate;

use diagnostic::{Code, Diagnostic, Diagnostics, FileDiagnostic, Severity, Span};
use resolver::context::LoadOutcome;
pub use resolver::{FileResolver, FsResolver, ImportContext, MemoryResolver};

/// Cooperative cancellation for embedders. Passes poll it between
/// top-level items; a tripped token stops the batch with the
/// diagnostics collected so far and no YAML.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The outcome of a compilation: generated YAML when it succeeded,
/// plus every diagnostic collected along the way.
#[derive(Debug)]
pub struct CompileResult {
    pub yaml: Option<String>,
    pub diagnostics: Vec<FileDiagnostic>,
}

impl CompileResult {
    /// Compilation succeeded iff no diagnostic is an error.
    pub fn success(&self) -> bool {
        !self
            .diagnostics
            .iter()
            .any(|d| d.diagnostic.severity == Severity::Error)
    }
}

/// The path a bare source string compiles under.
const ANONYMOUS_PATH: &str = "/main.workpipe";

/// Compiles a single source with no imports.
pub fn compile(source: &str) -> CompileResult {
    compile_cancellable(source, &CancelToken::new())
}

/// [`compile`], with a cancellation signal.
pub fn compile_cancellable(source: &str, cancel: &CancelToken) -> CompileResult {
    let mut context = ImportContext::new(MemoryResolver::new(), "/");
    compile_with_imports(source, Utf8Path::new(ANONYMOUS_PATH), &mut context, cancel)
}

/// Compiles a file against a long-lived import context. The entry
/// source is taken as given (it may be unsaved editor contents); its
/// imports load through the context's resolver.
pub fn compile_with_imports(
    source: &str,
    file_path: &Utf8Path,
    context: &mut ImportContext,
    cancel: &CancelToken,
) -> CompileResult {
    let mut diagnostics = vec![];

    match run_pipeline(source, file_path, context, cancel, &mut diagnostics) {
        Ok(yaml) => CompileResult { yaml, diagnostics },
        Err(err) => {
            // Internal invariant violations surface as a single
            // synthetic diagnostic instead of a panic.
            diagnostics.push(FileDiagnostic::new(
                file_path.to_path_buf(),
                Diagnostic::error(
                    Code::Internal,
                    format!("internal compiler error: {err}"),
                    Span::empty(),
                ),
            ));
            CompileResult {
                yaml: None,
                diagnostics,
            }
        }
    }
}

fn run_pipeline(
    source: &str,
    file_path: &Utf8Path,
    context: &mut ImportContext,
    cancel: &CancelToken,
    diagnostics: &mut Vec<FileDiagnostic>,
) -> anyhow::Result<Option<String>> {
    let entry: Utf8PathBuf = resolver::normalize_path(file_path);

    let order = match context.load_closure(&entry, source.to_owned(), cancel, diagnostics) {
        LoadOutcome::Loaded(order) => order,
        LoadOutcome::Failed | LoadOutcome::Cancelled => return Ok(None),
    };
    debug!(files = order.len(), "import closure loaded");

    let ast = context
        .ast(&entry)
        .ok_or_else(|| anyhow::anyhow!("entry AST missing after load"))?;
    let registry = context
        .registry(&entry)
        .ok_or_else(|| anyhow::anyhow!("entry registry missing after load"))?;

    let mut entry_diags = Diagnostics::new();
    types::check::check_type_refs(ast, registry, &mut entry_diags);

    let Some(workflow) = &ast.workflow else {
        // Type-only files are valid import targets but compile to
        // nothing on their own.
        drain(file_path, entry_diags, diagnostics);
        return Ok(None);
    };

    if cancel.is_cancelled() {
        drain(file_path, entry_diags, diagnostics);
        return Ok(None);
    }

    let mut workflow = workflow.clone();
    expand::expand_fragments(&mut workflow, registry, &mut entry_diags);

    if cancel.is_cancelled() {
        drain(file_path, entry_diags, diagnostics);
        return Ok(None);
    }

    validate::validate(&workflow, registry, &mut entry_diags);

    let halt = entry_diags.has_errors()
        || diagnostics
            .iter()
            .any(|d| d.diagnostic.severity == Severity::Error);
    drain(file_path, entry_diags, diagnostics);

    if halt || cancel.is_cancelled() {
        // Lowering validated input cannot fail; lowering invalid
        // input would fabricate nonsense diagnostics.
        return Ok(None);
    }

    let ir = lower::lower_workflow(&workflow);
    Ok(Some(emit::emit(&ir)))
}

fn drain(path: &Utf8Path, from: Diagnostics, into: &mut Vec<FileDiagnostic>) {
    for diagnostic in from.into_vec() {
        into.push(FileDiagnostic::new(path.to_path_buf(), diagnostic));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::diagnostic::Code;

    use super::{CancelToken, compile};

    #[test]
    fn test_compile_minimal() {
        let result = compile(
            r#"workflow w { on: push  job j { runs_on: ubuntu-latest  steps: [ run("echo hi") ] } }"#,
        );
        assert!(result.success(), "{:?}", result.diagnostics);

        let yaml = result.yaml.expect("yaml");
        assert!(yaml.contains("name: w\n"));
        assert!(yaml.contains("on: push\n"));
        assert!(yaml.contains("runs-on: ubuntu-latest\n"));
        assert!(yaml.contains("run: echo hi\n"));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let source = r#"
            workflow w {
              on: push
              job a { runs_on: x  steps: [ run("1") ] }
              job b { runs_on: x  needs: [a]  steps: [ run("2") ] }
            }
        "#;
        assert_eq!(compile(source).yaml, compile(source).yaml);
    }

    #[test]
    fn test_compile_reports_errors_without_yaml() {
        let result = compile(r#"workflow w { on: push  job j { steps: [ run("") ] } }"#);
        assert!(!result.success());
        assert!(result.yaml.is_none());
        assert_eq!(result.diagnostics[0].diagnostic.code, Code::MissingRunner);
    }

    #[test]
    fn test_warnings_do_not_block_yaml() {
        let result = compile(
            r#"
            workflow w {
              on: push
              cycle c {
                key = "k"
                until guard_js "return true"
                body { job b { runs_on: x  steps: [ run("") ] } }
              }
            }
            "#,
        );
        assert!(result.success(), "{:?}", result.diagnostics);
        assert!(result.yaml.is_some());
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.diagnostic.code == Code::CycleNoMaxIters)
        );
    }

    #[test]
    fn test_cancelled_compile_returns_no_yaml() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = super::compile_cancellable(
            r#"workflow w { on: push  job j { runs_on: x  steps: [ run("") ] } }"#,
            &cancel,
        );
        assert!(result.yaml.is_none());
    }

    #[test]
    fn test_diagnostic_spans_within_bounds() {
        let source = r#"workflow w { on: push  job j { steps: [ run("${{ needs.ghost.outputs.x }}") ] } }"#;
        let result = compile(source);
        for fd in &result.diagnostics {
            let span = fd.diagnostic.span;
            assert!(span.start <= span.end);
            assert!(span.end <= source.len());
        }
    }
}
