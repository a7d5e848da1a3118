//! The batch-scoped import context: parsed-file cache, per-file type
//! registries, and the dependency graph.
//!
//! Only the loader mutates the context; every other pass reads it.
//! Editor embeddings keep one context alive across saves and call
//! [`ImportContext::invalidate`] per changed file.

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use tracing::debug;

use crate::CancelToken;
use crate::diagnostic::{Code, Diagnostic, Diagnostics, FileDiagnostic, Span};
use crate::parser::ast::FileAst;
use crate::parser::parse_file;
use crate::resolver::graph::ImportGraph;
use crate::resolver::{FileResolver, normalize_path, valid_import_shape, within_root};
use crate::types::registry::build_registry;
use crate::types::FileRegistry;

/// The outcome of loading a file closure.
pub enum LoadOutcome {
    /// All files loaded and registered; the order is leaves-first and
    /// ends with the entry file.
    Loaded(Vec<Utf8PathBuf>),
    /// Loading stopped (import cycle, entry syntax error); diagnostics
    /// say why.
    Failed,
    /// The cancellation signal tripped.
    Cancelled,
}

pub struct ImportContext {
    resolver: Box<dyn FileResolver>,
    project_root: Utf8PathBuf,
    parsed_files: IndexMap<Utf8PathBuf, FileAst>,
    sources: IndexMap<Utf8PathBuf, String>,
    registries: IndexMap<Utf8PathBuf, FileRegistry>,
    /// Per file: each import declaration index with its resolved path.
    resolved_imports: IndexMap<Utf8PathBuf, Vec<(usize, Utf8PathBuf)>>,
    /// Per file: the span of each import declaration, by resolved
    /// target. Used to place cycle diagnostics.
    import_spans: IndexMap<Utf8PathBuf, Vec<(Utf8PathBuf, Span)>>,
    graph: ImportGraph,
}

impl ImportContext {
    pub fn new(resolver: impl FileResolver + 'static, project_root: impl AsRef<Utf8Path>) -> Self {
        Self {
            resolver: Box::new(resolver),
            project_root: normalize_path(project_root.as_ref()),
            parsed_files: IndexMap::new(),
            sources: IndexMap::new(),
            registries: IndexMap::new(),
            resolved_imports: IndexMap::new(),
            import_spans: IndexMap::new(),
            graph: ImportGraph::new(),
        }
    }

    pub fn project_root(&self) -> &Utf8Path {
        &self.project_root
    }

    /// The cached source of a loaded file.
    pub fn source(&self, path: &Utf8Path) -> Option<&str> {
        self.sources.get(path).map(String::as_str)
    }

    /// The cached AST of a loaded file.
    pub fn ast(&self, path: &Utf8Path) -> Option<&FileAst> {
        self.parsed_files.get(path)
    }

    /// The registry of a loaded file.
    pub fn registry(&self, path: &Utf8Path) -> Option<&FileRegistry> {
        self.registries.get(path)
    }

    /// Transitive dependents of `path`, for editor recompilation.
    pub fn dependents_of(&self, path: &Utf8Path) -> Vec<Utf8PathBuf> {
        self.graph
            .dependents_of(&normalize_path(path))
            .into_iter()
            .map(Utf8Path::to_path_buf)
            .collect()
    }

    /// Drops a file's cached entries and the registries of all its
    /// transitive dependents. Dependent ASTs stay cached; they reparse
    /// only if their own file changes.
    pub fn invalidate(&mut self, path: &Utf8Path) {
        let path = normalize_path(path);
        for dependent in self.dependents_of(&path) {
            self.registries.shift_remove(&dependent);
        }
        self.parsed_files.shift_remove(&path);
        self.sources.shift_remove(&path);
        self.registries.shift_remove(&path);
        self.resolved_imports.shift_remove(&path);
        self.import_spans.shift_remove(&path);
    }

    /// Loads the transitive import closure of `entry`, building the
    /// dependency graph and then the per-file registries in
    /// leaves-first order.
    pub fn load_closure(
        &mut self,
        entry: &Utf8Path,
        entry_source: String,
        cancel: &CancelToken,
        out: &mut Vec<FileDiagnostic>,
    ) -> LoadOutcome {
        let entry = normalize_path(entry);
        self.invalidate(&entry);
        self.sources.insert(entry.clone(), entry_source);

        // Phase 1: parse the closure and build the graph.
        let mut graph = ImportGraph::new();
        graph.add_node(&entry);
        let mut worklist = vec![entry.clone()];
        let mut entry_parse_failed = false;

        while let Some(file) = worklist.pop() {
            if cancel.is_cancelled() {
                return LoadOutcome::Cancelled;
            }

            if !self.parsed_files.contains_key(&file) {
                let Some(source) = self.sources.get(&file) else {
                    continue;
                };
                let mut diagnostics = Diagnostics::new();
                let parsed = parse_file(source, &mut diagnostics);
                drain_into(&file, diagnostics, out);

                match parsed {
                    Some(ast) => {
                        self.parsed_files.insert(file.clone(), ast);
                    }
                    None => {
                        if file == entry {
                            entry_parse_failed = true;
                        }
                        continue;
                    }
                }
            }

            let imports: Vec<_> = self.parsed_files[&file]
                .imports
                .iter()
                .enumerate()
                .map(|(index, decl)| {
                    (
                        index,
                        decl.path.value.clone(),
                        decl.path.span,
                        decl.items
                            .iter()
                            .map(|i| i.name.value.clone())
                            .collect::<Vec<_>>(),
                    )
                })
                .collect();

            let mut resolved_here = vec![];
            let mut spans_here = vec![];

            for (index, import_path, path_span, names) in imports {
                if !valid_import_shape(&import_path) {
                    out.push(FileDiagnostic::new(
                        file.clone(),
                        Diagnostic::error(
                            Code::InvalidImportPath,
                            format!("invalid import path \"{import_path}\""),
                            path_span,
                        )
                        .with_hint(
                            "import paths must be `./`- or `../`-relative and end in `.workpipe`",
                        ),
                    ));
                    continue;
                }

                let Some(resolved) = self.resolver.resolve(&import_path, &file) else {
                    out.push(FileDiagnostic::new(
                        file.clone(),
                        Diagnostic::error(
                            Code::InvalidImportPath,
                            format!("import path \"{import_path}\" cannot be resolved"),
                            path_span,
                        ),
                    ));
                    continue;
                };

                if !within_root(&resolved, &self.project_root) {
                    out.push(FileDiagnostic::new(
                        file.clone(),
                        Diagnostic::error(
                            Code::ImportEscapesRoot,
                            format!("\"{import_path}\" resolves outside the project root"),
                            path_span,
                        ),
                    ));
                    continue;
                }

                if !self.resolver.exists(&resolved) {
                    out.push(FileDiagnostic::new(
                        file.clone(),
                        Diagnostic::error(
                            Code::ImportNotFound,
                            format!("imported file not found: \"{import_path}\""),
                            path_span,
                        ),
                    ));
                    continue;
                }

                let first_visit = !graph.contains(&resolved);
                graph.add_edge(&file, &resolved, names);
                resolved_here.push((index, resolved.clone()));
                spans_here.push((resolved.clone(), path_span));

                if first_visit {
                    if !self.sources.contains_key(&resolved) {
                        match self.resolver.read(&resolved) {
                            Ok(source) => {
                                self.sources.insert(resolved.clone(), source);
                            }
                            Err(err) => {
                                out.push(FileDiagnostic::new(
                                    file.clone(),
                                    Diagnostic::error(
                                        Code::ImportNotFound,
                                        format!("cannot read \"{import_path}\": {err}"),
                                        path_span,
                                    ),
                                ));
                                continue;
                            }
                        }
                    }
                    worklist.push(resolved);
                }
            }

            self.resolved_imports.insert(file.clone(), resolved_here);
            self.import_spans.insert(file.clone(), spans_here);
        }

        // Phase 2: cycle detection.
        let cycles = graph.cycles();
        if !cycles.is_empty() {
            for cycle in &cycles {
                let first = cycle[0];
                let second = cycle.get(1).copied().unwrap_or(first);
                let span = self
                    .import_spans
                    .get(first)
                    .and_then(|spans| {
                        spans
                            .iter()
                            .find(|(to, _)| to == second)
                            .map(|(_, span)| *span)
                    })
                    .unwrap_or_else(Span::empty);

                out.push(FileDiagnostic::new(
                    first.to_path_buf(),
                    Diagnostic::error(
                        Code::CircularImport,
                        format!("circular import: {}", ImportGraph::render_ring(cycle)),
                        span,
                    ),
                ));
            }
            self.graph = graph;
            return LoadOutcome::Failed;
        }

        if entry_parse_failed {
            self.graph = graph;
            return LoadOutcome::Failed;
        }

        // Phase 3: registries, leaves-first.
        let order: Vec<Utf8PathBuf> = graph
            .topological_order()
            .expect("acyclic after cycle check")
            .into_iter()
            .map(Utf8Path::to_path_buf)
            .collect();
        self.graph = graph;

        for path in &order {
            if cancel.is_cancelled() {
                return LoadOutcome::Cancelled;
            }
            if self.registries.contains_key(path) {
                continue;
            }
            let Some(ast) = self.parsed_files.get(path) else {
                continue;
            };

            debug!(file = %path, "building type registry");
            let resolved = self
                .resolved_imports
                .get(path)
                .cloned()
                .unwrap_or_default();
            let mut diagnostics = Diagnostics::new();
            let registry = build_registry(ast, &resolved, &self.parsed_files, &mut diagnostics);
            drain_into(path, diagnostics, out);
            self.registries.insert(path.clone(), registry);
        }

        LoadOutcome::Loaded(order)
    }
}

fn drain_into(path: &Utf8Path, diagnostics: Diagnostics, out: &mut Vec<FileDiagnostic>) {
    for diagnostic in diagnostics.into_vec() {
        out.push(FileDiagnostic::new(path.to_path_buf(), diagnostic));
    }
}

#[cfg(test)]
mod tests {
    use camino::{Utf8Path, Utf8PathBuf};
    use pretty_assertions::assert_eq;

    use crate::CancelToken;
    use crate::diagnostic::Code;
    use crate::resolver::MemoryResolver;

    use super::{ImportContext, LoadOutcome};

    fn load(
        context: &mut ImportContext,
        entry: &str,
        source: &str,
    ) -> (LoadOutcome, Vec<crate::diagnostic::FileDiagnostic>) {
        let mut out = vec![];
        let outcome = context.load_closure(
            Utf8Path::new(entry),
            source.into(),
            &CancelToken::new(),
            &mut out,
        );
        (outcome, out)
    }

    #[test]
    fn test_load_two_files_in_order() {
        let mut resolver = MemoryResolver::new();
        resolver.add_file("/p/lib.workpipe", "type U { v: int }");
        let mut context = ImportContext::new(resolver, "/p");

        let (outcome, diagnostics) = load(
            &mut context,
            "/p/main.workpipe",
            r#"import { U } from "./lib.workpipe""#,
        );

        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let LoadOutcome::Loaded(order) = outcome else {
            panic!("expected a loaded closure");
        };
        assert_eq!(
            order,
            [
                Utf8PathBuf::from("/p/lib.workpipe"),
                Utf8PathBuf::from("/p/main.workpipe"),
            ]
        );

        let registry = context
            .registry(Utf8Path::new("/p/main.workpipe"))
            .expect("registry");
        assert!(registry.types.contains_key("U"));
    }

    #[test]
    fn test_circular_import_fails() {
        let mut resolver = MemoryResolver::new();
        resolver.add_file(
            "/p/a.workpipe",
            r#"import { X } from "./b.workpipe"  type A { v: int }"#,
        );
        resolver.add_file(
            "/p/b.workpipe",
            r#"import { A } from "./a.workpipe"  type X { v: int }"#,
        );
        let mut context = ImportContext::new(resolver, "/p");

        let (outcome, diagnostics) = load(
            &mut context,
            "/p/main.workpipe",
            r#"import { A } from "./a.workpipe""#,
        );

        assert!(matches!(outcome, LoadOutcome::Failed));
        let cycle = diagnostics
            .iter()
            .find(|d| d.diagnostic.code == Code::CircularImport)
            .expect("cycle diagnostic");
        assert!(cycle.diagnostic.message.contains("a.workpipe"));
        assert!(cycle.diagnostic.message.contains("b.workpipe"));
    }

    #[test]
    fn test_missing_import_reports_not_found() {
        let resolver = MemoryResolver::new();
        let mut context = ImportContext::new(resolver, "/p");

        let (_, diagnostics) = load(
            &mut context,
            "/p/main.workpipe",
            r#"import { U } from "./lib.workpipe""#,
        );

        assert_eq!(diagnostics[0].diagnostic.code, Code::ImportNotFound);
    }

    #[test]
    fn test_bad_path_shapes() {
        let resolver = MemoryResolver::new();
        let mut context = ImportContext::new(resolver, "/p");

        let (_, diagnostics) = load(
            &mut context,
            "/p/main.workpipe",
            r#"
            import { A } from "lib.workpipe"
            import { B } from "/abs/lib.workpipe"
            import { C } from "../outside.workpipe"
            "#,
        );

        let codes: Vec<_> = diagnostics.iter().map(|d| d.diagnostic.code).collect();
        assert_eq!(
            codes,
            [
                Code::InvalidImportPath,
                Code::InvalidImportPath,
                Code::ImportEscapesRoot,
            ]
        );
    }

    #[test]
    fn test_invalidate_drops_dependent_registries() {
        let mut resolver = MemoryResolver::new();
        resolver.add_file("/p/lib.workpipe", "type U { v: int }");
        let mut context = ImportContext::new(resolver, "/p");

        let (_, diagnostics) = load(
            &mut context,
            "/p/main.workpipe",
            r#"import { U } from "./lib.workpipe""#,
        );
        assert!(diagnostics.is_empty());
        assert!(context.registry(Utf8Path::new("/p/main.workpipe")).is_some());

        context.invalidate(Utf8Path::new("/p/lib.workpipe"));

        // The dependent's registry is gone, but its AST survives.
        assert!(context.registry(Utf8Path::new("/p/main.workpipe")).is_none());
        assert!(context.ast(Utf8Path::new("/p/main.workpipe")).is_some());
        assert!(context.ast(Utf8Path::new("/p/lib.workpipe")).is_none());
    }
}
