//! Structural checks: dangling type references (`WP5002`) and
//! property access through `needs.<job>.outputs.<output>` expressions
//! (`WP5003`).

use indexmap::IndexMap;
use itertools::Itertools;
use workpipe_expressions::{Expr, extract_expressions};

use crate::diagnostic::{Code, Diagnostic, Diagnostics, Span};
use crate::parser::ast::{
    FileAst, JobBody, JobDecl, Primitive, Spanned, Step, TypeExpr, TypeKind, Value, ValueKind,
    WorkflowDecl, WorkflowItem,
};
use crate::types::FileRegistry;

/// Reports `WP5002` for every `Named` reference that the registry
/// cannot resolve. Walks type declarations, fragment bodies, and the
/// workflow's outputs and agent schemas.
pub fn check_type_refs(ast: &FileAst, registry: &FileRegistry, diagnostics: &mut Diagnostics) {
    for decl in &ast.types {
        walk_type(&decl.ty, registry, diagnostics);
    }
    for fragment in &ast.job_fragments {
        walk_body_types(&fragment.body, registry, diagnostics);
    }
    for fragment in &ast.steps_fragments {
        for step in &fragment.steps {
            walk_step_types(step, registry, diagnostics);
        }
    }
    if let Some(workflow) = &ast.workflow {
        for job in all_jobs(workflow) {
            walk_body_types(&job.body, registry, diagnostics);
        }
    }
}

fn walk_body_types(body: &JobBody, registry: &FileRegistry, diagnostics: &mut Diagnostics) {
    for output in &body.outputs {
        walk_type(&output.ty, registry, diagnostics);
    }
    for step in &body.steps {
        walk_step_types(step, registry, diagnostics);
    }
}

fn walk_step_types(step: &Step, registry: &FileRegistry, diagnostics: &mut Diagnostics) {
    if let Step::AgentTask(task) = step {
        if let Some(schema) = &task.output_schema {
            walk_type(schema, registry, diagnostics);
        }
    }
}

fn walk_type(ty: &TypeExpr, registry: &FileRegistry, diagnostics: &mut Diagnostics) {
    match &ty.kind {
        TypeKind::Named(name) => {
            if !registry.types.contains_key(name) {
                diagnostics.push(Diagnostic::error(
                    Code::UnknownType,
                    format!("unknown type `{name}`"),
                    ty.span,
                ));
            }
        }
        TypeKind::Nullable(inner) | TypeKind::List(inner) => {
            walk_type(inner, registry, diagnostics)
        }
        TypeKind::Object(fields) => {
            for field in fields {
                walk_type(&field.ty, registry, diagnostics);
            }
        }
        TypeKind::Primitive(_) | TypeKind::LiteralUnion(_) => (),
    }
}

/// Checks every `${{ ... }}` occurrence in the workflow's string
/// positions against the declared output types.
///
/// Only `needs.*` contexts (directly, or through a `fromJSON(...)`
/// head) are checked; everything else is runtime-defined and accepted
/// verbatim. References to the synthesized `_hydrate`/`_decide`
/// outputs of a cycle are dynamic and skipped.
pub fn check_expressions(
    workflow: &WorkflowDecl,
    registry: &FileRegistry,
    diagnostics: &mut Diagnostics,
) {
    let jobs: IndexMap<&str, &JobDecl> = all_jobs(workflow)
        .map(|job| (job.name.value.as_str(), job))
        .collect();

    let reserved: Vec<String> = workflow
        .items
        .iter()
        .filter_map(|item| match item {
            WorkflowItem::Cycle(cycle) => Some(&cycle.name.value),
            WorkflowItem::Job(_) => None,
        })
        .flat_map(|name| {
            [
                format!("{name}_hydrate"),
                format!("{name}_decide"),
                format!("{name}_dispatch"),
            ]
        })
        .collect();

    for job in jobs.values() {
        for scalar in job_strings(job) {
            check_scalar(&scalar, &jobs, &reserved, registry, diagnostics);
        }
    }
}

/// The string positions of one job that may carry expressions.
fn job_strings(job: &JobDecl) -> Vec<Spanned<String>> {
    let mut out = vec![];
    out.extend(job.body.condition.clone());

    for step in &job.body.steps {
        match step {
            Step::Run(run) => out.push(run.command.clone()),
            Step::Shell(shell) => out.push(shell.script.clone()),
            Step::Uses(uses) => {
                for (_, value) in &uses.with {
                    collect_value_strings(value, &mut out);
                }
            }
            Step::AgentTask(task) => {
                out.push(task.prompt.clone());
                out.extend(task.output_artifact.clone());
            }
            Step::Guard(_) | Step::Spread(_) => (),
        }
    }
    out
}

fn collect_value_strings(value: &Value, out: &mut Vec<Spanned<String>>) {
    match &value.kind {
        ValueKind::String(s) => out.push(Spanned::new(s.clone(), value.span)),
        ValueKind::List(values) => {
            for value in values {
                collect_value_strings(value, out);
            }
        }
        ValueKind::Object(entries) => {
            for (_, value) in entries {
                collect_value_strings(value, out);
            }
        }
        _ => (),
    }
}

fn check_scalar(
    scalar: &Spanned<String>,
    jobs: &IndexMap<&str, &JobDecl>,
    reserved: &[String],
    registry: &FileRegistry,
    diagnostics: &mut Diagnostics,
) {
    for occurrence in extract_expressions(&scalar.value) {
        let Ok(expr) = Expr::parse(occurrence.body(&scalar.value)) else {
            // Unparseable expressions are accepted verbatim; the
            // compiler validates only the reference subset it models.
            continue;
        };

        for context in expr.contexts() {
            // Either `needs.J.outputs.O.p...` directly, or the same
            // context inside a `fromJSON(...)` head with the path
            // applied to the call result.
            let (chain, path): (Vec<_>, Vec<_>) = match context.call_head("fromJSON") {
                Some(inner) => {
                    if inner.head() != Some("needs") {
                        continue;
                    }
                    (inner.tail().collect(), context.tail().collect())
                }
                None => {
                    let tail: Vec<_> = context.tail().collect();
                    if context.head() != Some("needs") {
                        continue;
                    }
                    let path = tail.get(3..).unwrap_or_default().to_vec();
                    (tail.get(..3).unwrap_or_default().to_vec(), path)
                }
            };

            check_needs_chain(&chain, &path, scalar.span, jobs, reserved, registry, diagnostics);
        }
    }
}

/// `chain` is `[J, "outputs", O]` relative to a `needs` head (for the
/// `fromJSON` shape the head lives inside the call). `path` is the
/// field path applied to the output's type.
#[allow(clippy::too_many_arguments)]
fn check_needs_chain(
    chain: &[(&str, std::ops::Range<usize>)],
    path: &[(&str, std::ops::Range<usize>)],
    scalar_span: Span,
    jobs: &IndexMap<&str, &JobDecl>,
    reserved: &[String],
    registry: &FileRegistry,
    diagnostics: &mut Diagnostics,
) {
    let [(job_name, _), (outputs_kw, _), (output_name, _)] = chain else {
        return;
    };
    if *outputs_kw != "outputs" {
        return;
    }
    if reserved.iter().any(|r| r.as_str() == *job_name) {
        // Synthesized cycle outputs are dynamically typed.
        return;
    }
    let Some(job) = jobs.get(*job_name) else {
        // Unknown jobs in expressions are left to the `needs` check;
        // GitHub-level contexts are not re-derived here.
        return;
    };

    let Some(output) = job
        .body
        .outputs
        .iter()
        .find(|o| o.name.value == *output_name)
    else {
        let available = job.body.outputs.iter().map(|o| &o.name.value).join(", ");
        let mut diagnostic = Diagnostic::error(
            Code::UnknownProperty,
            format!("job `{job_name}` declares no output `{output_name}`"),
            scalar_span,
        );
        if !available.is_empty() {
            diagnostic = diagnostic.with_hint(format!("declared outputs: {available}"));
        }
        diagnostics.push(diagnostic);
        return;
    };

    walk_output_path(&output.ty, path, scalar_span, registry, diagnostics);
}

fn walk_output_path(
    ty: &TypeExpr,
    path: &[(&str, std::ops::Range<usize>)],
    scalar_span: Span,
    registry: &FileRegistry,
    diagnostics: &mut Diagnostics,
) {
    let mut current = registry.resolve(ty);

    for (field, _) in path {
        // Nullability does not affect the field set.
        while let TypeKind::Nullable(inner) = &current.kind {
            current = registry.resolve(inner);
        }

        match &current.kind {
            // `json` ends static checking: the rest of the path is
            // dynamic.
            TypeKind::Primitive(Primitive::Json) => return,
            TypeKind::Object(fields) => {
                if *field == "*" {
                    return;
                }
                match fields.iter().find(|f| f.name.value == *field) {
                    Some(found) => current = registry.resolve(&found.ty),
                    None => {
                        let available = fields.iter().map(|f| &f.name.value).join(", ");
                        let mut diagnostic = Diagnostic::error(
                            Code::UnknownProperty,
                            format!("unknown property `{field}`"),
                            scalar_span,
                        );
                        if !available.is_empty() {
                            diagnostic =
                                diagnostic.with_hint(format!("available fields: {available}"));
                        }
                        diagnostics.push(diagnostic);
                        return;
                    }
                }
            }
            TypeKind::List(element) => {
                if *field == "*" {
                    current = registry.resolve(element);
                } else {
                    diagnostics.push(
                        Diagnostic::error(
                            Code::UnknownProperty,
                            format!("unknown property `{field}`"),
                            scalar_span,
                        )
                        .with_hint("lists have no named properties; use an index or `*`"),
                    );
                    return;
                }
            }
            TypeKind::Primitive(primitive) => {
                diagnostics.push(
                    Diagnostic::error(
                        Code::UnknownProperty,
                        format!("unknown property `{field}`"),
                        scalar_span,
                    )
                    .with_hint(format!("type `{primitive}` has no properties")),
                );
                return;
            }
            TypeKind::LiteralUnion(_) => {
                diagnostics.push(
                    Diagnostic::error(
                        Code::UnknownProperty,
                        format!("unknown property `{field}`"),
                        scalar_span,
                    )
                    .with_hint("string literal unions have no properties"),
                );
                return;
            }
            TypeKind::Named(_) => return,
            TypeKind::Nullable(_) => unreachable!("nullable is stripped above"),
        }
    }
}

/// Iterates every job in the workflow, including cycle body jobs.
pub fn all_jobs(workflow: &WorkflowDecl) -> impl Iterator<Item = &JobDecl> {
    workflow.items.iter().flat_map(|item| match item {
        WorkflowItem::Job(job) => vec![job],
        WorkflowItem::Cycle(cycle) => cycle
            .body
            .iter()
            .filter_map(|body_item| match body_item {
                crate::parser::ast::CycleBodyItem::Job(job) => Some(job),
                crate::parser::ast::CycleBodyItem::Cycle(_) => None,
            })
            .collect(),
    })
}
