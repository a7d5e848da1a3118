//! Registry construction: local declarations plus imported names.
//!
//! A registry is built per file, in leaves-first order, so a file's
//! imports are always fully registered before the file itself.
//! Imports are non-transitive: only a file's own declarations are
//! exportable, never the names it imported.

use std::collections::HashSet;

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use itertools::Itertools;

use crate::diagnostic::{Code, Diagnostic, Diagnostics};
use crate::parser::ast::{
    FileAst, JobFragmentDecl, StepsFragmentDecl, TypeExpr, TypeKind,
};

/// Everything a file's scope can see: local and imported types and
/// fragments, keyed by their locally visible (possibly aliased) name.
#[derive(Debug, Default, Clone)]
pub struct FileRegistry {
    pub types: IndexMap<String, TypeExpr>,
    pub job_fragments: IndexMap<String, JobFragmentDecl>,
    pub steps_fragments: IndexMap<String, StepsFragmentDecl>,
}

impl FileRegistry {
    /// Follows `Named` references until a structural type is reached.
    ///
    /// Unknown names (already diagnosed as `WP5002`) and alias loops
    /// return the last type reached.
    pub fn resolve<'a>(&'a self, ty: &'a TypeExpr) -> &'a TypeExpr {
        let mut current = ty;
        let mut hops = 0;
        while let TypeKind::Named(name) = &current.kind {
            match self.types.get(name) {
                Some(next) if hops < 32 => {
                    current = next;
                    hops += 1;
                }
                _ => break,
            }
        }
        current
    }

    fn is_bound(&self, name: &str) -> bool {
        self.types.contains_key(name)
            || self.job_fragments.contains_key(name)
            || self.steps_fragments.contains_key(name)
    }
}

/// The names a file exports: its own declarations only.
fn exportable_names(ast: &FileAst) -> Vec<&str> {
    ast.types
        .iter()
        .map(|t| t.name.value.as_str())
        .chain(ast.job_fragments.iter().map(|f| f.name.value.as_str()))
        .chain(ast.steps_fragments.iter().map(|f| f.name.value.as_str()))
        .collect()
}

/// Levenshtein-nearest exportable name, for `WP7103` hints.
/// Case-insensitive, distance at most 3.
fn nearest_name<'a>(wanted: &str, candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| {
            (
                strsim::levenshtein(&wanted.to_lowercase(), &c.to_lowercase()),
                *c,
            )
        })
        .filter(|(distance, _)| *distance <= 3)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, c)| c)
}

/// Builds the registry for one file.
///
/// `resolved_imports` pairs each import declaration index with the
/// path it resolved to; unresolvable imports were already diagnosed by
/// the loader and are simply absent here.
pub fn build_registry(
    ast: &FileAst,
    resolved_imports: &[(usize, Utf8PathBuf)],
    parsed: &IndexMap<Utf8PathBuf, FileAst>,
    diagnostics: &mut Diagnostics,
) -> FileRegistry {
    let mut registry = FileRegistry::default();

    // Local declarations first: imports may not shadow them.
    for decl in &ast.types {
        if registry.types.contains_key(&decl.name.value) {
            diagnostics.push(Diagnostic::error(
                Code::DuplicateType,
                format!("duplicate type `{}`", decl.name.value),
                decl.name.span,
            ));
            continue;
        }
        registry.types.insert(decl.name.value.clone(), decl.ty.clone());
    }

    for fragment in &ast.job_fragments {
        if registry.is_bound(&fragment.name.value) {
            diagnostics.push(Diagnostic::error(
                Code::AstBuild,
                format!("duplicate declaration `{}`", fragment.name.value),
                fragment.name.span,
            ));
            continue;
        }
        registry
            .job_fragments
            .insert(fragment.name.value.clone(), fragment.clone());
    }

    for fragment in &ast.steps_fragments {
        if registry.is_bound(&fragment.name.value) {
            diagnostics.push(Diagnostic::error(
                Code::AstBuild,
                format!("duplicate declaration `{}`", fragment.name.value),
                fragment.name.span,
            ));
            continue;
        }
        registry
            .steps_fragments
            .insert(fragment.name.value.clone(), fragment.clone());
    }

    let mut seen_imports: HashSet<(String, String)> = HashSet::new();

    for (decl_index, source_path) in resolved_imports {
        let decl = &ast.imports[*decl_index];
        let Some(source_ast) = parsed.get(source_path) else {
            // The loader failed on this file and said so already.
            continue;
        };

        for item in &decl.items {
            let wanted = item.name.value.as_str();
            let local = item.local_name().to_owned();

            if !seen_imports.insert((source_path.as_str().to_owned(), wanted.to_owned())) {
                diagnostics.push(Diagnostic::error(
                    Code::DuplicateImport,
                    format!("`{wanted}` is already imported from \"{}\"", decl.path.value),
                    item.span(),
                ));
                continue;
            }

            if registry.is_bound(&local) {
                diagnostics.push(Diagnostic::error(
                    Code::ImportCollision,
                    format!("`{local}` collides with an existing declaration or import"),
                    item.span(),
                ));
                continue;
            }

            if let Some(ty) = source_ast.types.iter().find(|t| t.name.value == wanted) {
                registry.types.insert(local, ty.ty.clone());
            } else if let Some(fragment) = source_ast
                .job_fragments
                .iter()
                .find(|f| f.name.value == wanted)
            {
                registry.job_fragments.insert(local, fragment.clone());
            } else if let Some(fragment) = source_ast
                .steps_fragments
                .iter()
                .find(|f| f.name.value == wanted)
            {
                registry.steps_fragments.insert(local, fragment.clone());
            } else {
                let candidates = exportable_names(source_ast);
                let mut diagnostic = Diagnostic::error(
                    Code::ImportUnknownName,
                    format!(
                        "\"{path}\" does not export `{wanted}`",
                        path = decl.path.value
                    ),
                    item.name.span,
                );
                if let Some(suggestion) = nearest_name(wanted, &candidates) {
                    diagnostic = diagnostic.with_hint(format!("did you mean `{suggestion}`?"));
                } else if !candidates.is_empty() {
                    diagnostic = diagnostic.with_hint(format!(
                        "available names: {}",
                        candidates.iter().join(", ")
                    ));
                }
                diagnostics.push(diagnostic);
            }
        }
    }

    registry
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    use crate::diagnostic::{Code, Diagnostics};
    use crate::parser::parse_file;

    use super::{build_registry, nearest_name};

    fn parse(source: &str) -> crate::parser::ast::FileAst {
        let mut diagnostics = Diagnostics::new();
        parse_file(source, &mut diagnostics).expect("parses")
    }

    #[test]
    fn test_nearest_name() {
        assert_eq!(nearest_name("Reprot", &["Report", "Config"]), Some("Report"));
        assert_eq!(nearest_name("report", &["Report"]), Some("Report"));
        assert_eq!(nearest_name("Zzz", &["Report", "Config"]), None);
    }

    #[test]
    fn test_local_duplicate_type() {
        let ast = parse("type T { x: int }  type T { y: int }");
        let mut diagnostics = Diagnostics::new();
        let registry = build_registry(&ast, &[], &IndexMap::new(), &mut diagnostics);

        assert_eq!(registry.types.len(), 1);
        assert_eq!(diagnostics.items()[0].code, Code::DuplicateType);
    }

    #[test]
    fn test_import_binds_alias() {
        let lib = parse("type U { v: int }");
        let main = parse(r#"import { U as V } from "./lib.workpipe""#);

        let lib_path = Utf8PathBuf::from("/p/lib.workpipe");
        let mut parsed = IndexMap::new();
        parsed.insert(lib_path.clone(), lib);

        let mut diagnostics = Diagnostics::new();
        let registry = build_registry(&main, &[(0, lib_path)], &parsed, &mut diagnostics);

        assert!(!diagnostics.has_errors());
        assert!(registry.types.contains_key("V"));
        assert!(!registry.types.contains_key("U"));
    }

    #[test]
    fn test_import_unknown_name_suggests() {
        let lib = parse("type Report { v: int }");
        let main = parse(r#"import { Reprot } from "./lib.workpipe""#);

        let lib_path = Utf8PathBuf::from("/p/lib.workpipe");
        let mut parsed = IndexMap::new();
        parsed.insert(lib_path.clone(), lib);

        let mut diagnostics = Diagnostics::new();
        build_registry(&main, &[(0, lib_path)], &parsed, &mut diagnostics);

        let diag = &diagnostics.items()[0];
        assert_eq!(diag.code, Code::ImportUnknownName);
        assert!(diag.hint.as_deref().unwrap().contains("Report"));
    }

    #[test]
    fn test_duplicate_and_colliding_imports() {
        let lib = parse("type U { v: int }");
        let main = parse(
            r#"
            import { U, U } from "./lib.workpipe"
            type U { x: int }
            "#,
        );

        let lib_path = Utf8PathBuf::from("/p/lib.workpipe");
        let mut parsed = IndexMap::new();
        parsed.insert(lib_path.clone(), lib);

        let mut diagnostics = Diagnostics::new();
        build_registry(&main, &[(0, lib_path)], &parsed, &mut diagnostics);

        let codes: Vec<_> = diagnostics.items().iter().map(|d| d.code).collect();
        assert!(codes.contains(&Code::ImportCollision));
        assert!(codes.contains(&Code::DuplicateImport));
    }

    #[test]
    fn test_imports_are_not_reexported() {
        // b imports U from a; c imports from b and must not see U.
        let a = parse("type U { v: int }");
        let b = parse(r#"import { U } from "./a.workpipe""#);
        let c = parse(r#"import { U } from "./b.workpipe""#);

        let a_path = Utf8PathBuf::from("/p/a.workpipe");
        let b_path = Utf8PathBuf::from("/p/b.workpipe");
        let mut parsed = IndexMap::new();
        parsed.insert(a_path.clone(), a);
        parsed.insert(b_path.clone(), b);

        let mut diagnostics = Diagnostics::new();
        let registry = build_registry(&c, &[(0, b_path)], &parsed, &mut diagnostics);

        assert!(registry.types.is_empty());
        assert_eq!(diagnostics.items()[0].code, Code::ImportUnknownName);
    }
}
