//! Semantic validation. Runs after fragment expansion and before
//! cycle lowering; errors here stop the pipeline, warnings pass
//! through.

use std::collections::HashSet;

use indexmap::IndexMap;
use itertools::Itertools;

use crate::diagnostic::{Code, Diagnostic, Diagnostics};
use crate::parser::ast::{
    CycleBodyItem, CycleDecl, JobDecl, JobKind, Step, TypeKind, Value, ValueKind, WorkflowDecl,
    WorkflowItem,
};
use crate::types::{FileRegistry, check};

const MATRIX_PRODUCT_LIMIT: usize = 256;

/// The reserved job-name suffixes a cycle expands into.
pub const RESERVED_SUFFIXES: [&str; 3] = ["_hydrate", "_decide", "_dispatch"];

pub fn validate(
    workflow: &WorkflowDecl,
    registry: &FileRegistry,
    diagnostics: &mut Diagnostics,
) {
    check_job_names(workflow, diagnostics);

    for item in &workflow.items {
        match item {
            WorkflowItem::Job(job) => validate_job(job, diagnostics),
            WorkflowItem::Cycle(cycle) => validate_cycle(cycle, diagnostics),
        }
    }

    check_needs_targets(workflow, diagnostics);
    check::check_expressions(workflow, registry, diagnostics);
}

/// Job-name uniqueness, including cycle body jobs and the names the
/// cycle lowerer will synthesize.
fn check_job_names(workflow: &WorkflowDecl, diagnostics: &mut Diagnostics) {
    let reserved: HashSet<String> = workflow
        .items
        .iter()
        .filter_map(|item| match item {
            WorkflowItem::Cycle(cycle) => Some(&cycle.name.value),
            WorkflowItem::Job(_) => None,
        })
        .flat_map(|name| RESERVED_SUFFIXES.map(|suffix| format!("{name}{suffix}")))
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();

    for job in check::all_jobs(workflow) {
        let name = job.name.value.as_str();
        if reserved.contains(name) {
            diagnostics.push(
                Diagnostic::error(
                    Code::CycleReservedName,
                    format!("job name `{name}` is reserved for cycle expansion"),
                    job.name.span,
                )
                .with_hint("rename the job; `_hydrate`, `_decide` and `_dispatch` names belong to cycles"),
            );
        }
        if !seen.insert(name) {
            diagnostics.push(Diagnostic::error(
                Code::DuplicateJob,
                format!("duplicate job name `{name}`"),
                job.name.span,
            ));
        }
    }

    // Cycle names share the job namespace: the lowering derives job
    // names from them.
    let mut cycle_names: HashSet<&str> = HashSet::new();
    for item in &workflow.items {
        if let WorkflowItem::Cycle(cycle) = item {
            if !cycle_names.insert(cycle.name.value.as_str()) {
                diagnostics.push(Diagnostic::error(
                    Code::DuplicateJob,
                    format!("duplicate cycle name `{}`", cycle.name.value),
                    cycle.name.span,
                ));
            }
        }
    }
}

fn validate_job(job: &JobDecl, diagnostics: &mut Diagnostics) {
    if job.body.runs_on.is_none() {
        let (code, noun) = match job.kind {
            JobKind::Agent => (Code::AgentMissingRunner, "agent job"),
            _ => (Code::MissingRunner, "job"),
        };
        diagnostics.push(
            Diagnostic::error(
                code,
                format!("{noun} `{}` declares no runner", job.name.value),
                job.name.span,
            )
            .with_hint("add a runner, e.g. `runs_on: ubuntu-latest`"),
        );
    }

    if job.kind == JobKind::Matrix {
        validate_matrix(job, diagnostics);
    } else if job.body.matrix.is_some() {
        diagnostics.push(Diagnostic::error(
            Code::AstBuild,
            format!("job `{}` declares axes but is not a matrix job", job.name.value),
            job.name.span,
        ));
    }

    for step in &job.body.steps {
        if let Step::AgentTask(task) = step {
            if task.model.is_none() {
                diagnostics.push(Diagnostic::error(
                    Code::AgentMissingModel,
                    "agent_task declares no `model`",
                    task.span,
                ));
            }
            if task.max_turns.is_none() {
                diagnostics.push(Diagnostic::error(
                    Code::AgentMissingMaxTurns,
                    "agent_task declares no `max_turns`",
                    task.span,
                ));
            }
            if let Some(schema) = &task.output_schema {
                match &schema.kind {
                    TypeKind::Object(_) | TypeKind::Named(_) => (),
                    _ => diagnostics.push(Diagnostic::error(
                        Code::AgentBadSchema,
                        "agent output schema must be an object type",
                        schema.span,
                    )),
                }
            }
        }
    }
}

fn validate_matrix(job: &JobDecl, diagnostics: &mut Diagnostics) {
    let Some(matrix) = &job.body.matrix else {
        diagnostics.push(
            Diagnostic::error(
                Code::MatrixEmptyAxis,
                format!("matrix job `{}` declares no axes", job.name.value),
                job.name.span,
            )
            .with_hint("add `axes: { name: [ ... ] }`"),
        );
        return;
    };

    let mut product: usize = 1;
    for (name, values) in &matrix.axes {
        if values.value.is_empty() {
            diagnostics.push(Diagnostic::error(
                Code::MatrixEmptyAxis,
                format!("matrix axis `{}` is empty", name.value),
                values.span,
            ));
        }
        product = product.saturating_mul(values.value.len().max(1));
    }

    if product > MATRIX_PRODUCT_LIMIT {
        diagnostics.push(Diagnostic::error(
            Code::MatrixTooLarge,
            format!(
                "matrix expands to {product} combinations; the limit is {MATRIX_PRODUCT_LIMIT}"
            ),
            matrix.span,
        ));
    }

    // A row both included and excluded is a contradiction.
    for included in &matrix.include {
        if matrix.exclude.iter().any(|excluded| rows_equal(included, excluded)) {
            diagnostics.push(Diagnostic::error(
                Code::MatrixConflict,
                "matrix row appears in both `include` and `exclude`",
                included.span,
            ));
        }
    }
}

fn rows_equal(a: &Value, b: &Value) -> bool {
    match (&a.kind, &b.kind) {
        (ValueKind::Object(left), ValueKind::Object(right)) => {
            left.len() == right.len()
                && left.iter().all(|(key, value)| {
                    right
                        .iter()
                        .any(|(k, v)| k.value == key.value && v.kind == value.kind)
                })
        }
        (left, right) => left == right,
    }
}

fn validate_cycle(cycle: &CycleDecl, diagnostics: &mut Diagnostics) {
    if cycle.max_iters.is_none() && cycle.until.is_none() {
        diagnostics.push(
            Diagnostic::error(
                Code::CycleMissingBound,
                format!(
                    "cycle `{}` has neither `max_iters` nor `until`",
                    cycle.name.value
                ),
                cycle.name.span,
            )
            .with_hint("declare `max_iters = N`, an `until guard_js`, or both"),
        );
    } else if cycle.max_iters.is_none() {
        diagnostics.push(
            Diagnostic::warning(
                Code::CycleNoMaxIters,
                format!(
                    "cycle `{}` has `until` but no `max_iters` safety limit",
                    cycle.name.value
                ),
                cycle.name.span,
            )
            .with_hint("a hard cap of 100 iterations applies; declare `max_iters` to control it"),
        );
    }

    if cycle.key.is_none() {
        diagnostics.push(
            Diagnostic::error(
                Code::CycleMissingKey,
                format!("cycle `{}` declares no `key`", cycle.name.value),
                cycle.name.span,
            )
            .with_hint("state artifacts are named by key; parallel cycles must not share one"),
        );
    }

    let body_names: IndexMap<&str, &JobDecl> = cycle
        .body
        .iter()
        .filter_map(|item| match item {
            CycleBodyItem::Job(job) => Some((job.name.value.as_str(), job)),
            CycleBodyItem::Cycle(_) => None,
        })
        .collect();

    for item in &cycle.body {
        match item {
            CycleBodyItem::Cycle(nested) => {
                diagnostics.push(Diagnostic::error(
                    Code::CycleNested,
                    format!(
                        "cycle `{}` nests cycle `{}`; cycle bodies may contain only jobs",
                        cycle.name.value, nested.name.value
                    ),
                    nested.name.span,
                ));
            }
            CycleBodyItem::Job(job) => {
                validate_job(job, diagnostics);

                let hydrate = format!("{}_hydrate", cycle.name.value);
                for needed in &job.body.needs {
                    if needed.value != hydrate && !body_names.contains_key(needed.value.as_str()) {
                        diagnostics.push(Diagnostic::error(
                            Code::CycleBodyNeeds,
                            format!(
                                "job `{}` needs `{}`, which is not in the cycle body",
                                job.name.value, needed.value
                            ),
                            needed.span,
                        ));
                    }
                }
            }
        }
    }
}

/// `needs` targets of top-level jobs must name sibling jobs. The
/// synthesized cycle job names are valid targets as well, so a job may
/// run after a cycle completes by needing its `_decide` job.
fn check_needs_targets(workflow: &WorkflowDecl, diagnostics: &mut Diagnostics) {
    let mut valid: HashSet<String> = HashSet::new();
    for item in &workflow.items {
        match item {
            WorkflowItem::Job(job) => {
                valid.insert(job.name.value.clone());
            }
            WorkflowItem::Cycle(cycle) => {
                for suffix in RESERVED_SUFFIXES {
                    valid.insert(format!("{}{suffix}", cycle.name.value));
                }
            }
        }
    }

    for item in &workflow.items {
        let WorkflowItem::Job(job) = item else {
            continue;
        };
        for needed in &job.body.needs {
            if !valid.contains(&needed.value) {
                let known = workflow
                    .items
                    .iter()
                    .filter_map(|i| match i {
                        WorkflowItem::Job(j) => Some(j.name.value.as_str()),
                        WorkflowItem::Cycle(_) => None,
                    })
                    .join(", ");
                let mut diagnostic = Diagnostic::error(
                    Code::UnknownNeeds,
                    format!(
                        "job `{}` needs unknown job `{}`",
                        job.name.value, needed.value
                    ),
                    needed.span,
                );
                if !known.is_empty() {
                    diagnostic = diagnostic.with_hint(format!("declared jobs: {known}"));
                }
                diagnostics.push(diagnostic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use crate::diagnostic::{Code, Diagnostics, Severity};
    use crate::parser::parse_file;
    use crate::types::registry::build_registry;

    fn validate(source: &str) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        let ast = parse_file(source, &mut diagnostics).expect("parses");
        let registry = build_registry(&ast, &[], &IndexMap::new(), &mut diagnostics);
        let workflow = ast.workflow.expect("workflow");
        super::validate(&workflow, &registry, &mut diagnostics);
        diagnostics
    }

    fn codes(diagnostics: &Diagnostics) -> Vec<Code> {
        diagnostics.items().iter().map(|d| d.code).collect()
    }

    #[test]
    fn test_missing_runner() {
        let diagnostics = validate(
            r#"workflow w { on: push  job j { steps: [ run("echo hi") ] } }"#,
        );
        let diag = &diagnostics.items()[0];
        assert_eq!(diag.code, Code::MissingRunner);
        assert!(diag.hint.as_deref().unwrap().contains("runner"));
    }

    #[test]
    fn test_agent_job_missing_runner() {
        let diagnostics = validate(
            r#"
            workflow w {
              on: push
              agent_job a {
                steps: [ agent_task("go") { model: "m", max_turns: 5 } ]
              }
            }
            "#,
        );
        assert!(codes(&diagnostics).contains(&Code::AgentMissingRunner));
    }

    #[test]
    fn test_unknown_needs_target() {
        let diagnostics = validate(
            r#"
            workflow w {
              on: push
              job a { runs_on: x  steps: [ run("") ] }
              job b { runs_on: x  needs: [ghost]  steps: [ run("") ] }
            }
            "#,
        );
        let diag = &diagnostics.items()[0];
        assert_eq!(diag.code, Code::UnknownNeeds);
        assert!(diag.hint.as_deref().unwrap().contains("a"));
    }

    #[test]
    fn test_duplicate_job_and_reserved_name() {
        let diagnostics = validate(
            r#"
            workflow w {
              on: push
              job a { runs_on: x  steps: [ run("") ] }
              job a { runs_on: x  steps: [ run("") ] }
              job loop_hydrate { runs_on: x  steps: [ run("") ] }
              cycle loop {
                max_iters = 2
                key = "k"
                body { job inner { runs_on: x  steps: [ run("") ] } }
              }
            }
            "#,
        );
        let found = codes(&diagnostics);
        assert!(found.contains(&Code::DuplicateJob));
        assert!(found.contains(&Code::CycleReservedName));
    }

    #[test]
    fn test_cycle_bound_rules() {
        let diagnostics = validate(
            r#"
            workflow w {
              on: push
              cycle nobound {
                key = "a"
                body { job x1 { runs_on: x  steps: [ run("") ] } }
              }
              cycle onlyguard {
                key = "b"
                until guard_js "return true"
                body { job x2 { runs_on: x  steps: [ run("") ] } }
              }
            }
            "#,
        );

        let items = diagnostics.items();
        let missing = items.iter().find(|d| d.code == Code::CycleMissingBound).unwrap();
        assert_eq!(missing.severity, Severity::Error);

        let warning = items.iter().find(|d| d.code == Code::CycleNoMaxIters).unwrap();
        assert_eq!(warning.severity, Severity::Warning);
        assert!(warning.hint.as_deref().unwrap().contains("100"));
    }

    #[test]
    fn test_cycle_missing_key_and_nesting() {
        let diagnostics = validate(
            r#"
            workflow w {
              on: push
              cycle outer {
                max_iters = 2
                body {
                  job inner { runs_on: x  steps: [ run("") ] }
                  cycle nested {
                    max_iters = 2
                    key = "n"
                    body { job deep { runs_on: x  steps: [ run("") ] } }
                  }
                }
              }
            }
            "#,
        );
        let found = codes(&diagnostics);
        assert!(found.contains(&Code::CycleMissingKey));
        assert!(found.contains(&Code::CycleNested));
    }

    #[test]
    fn test_cycle_body_needs() {
        let diagnostics = validate(
            r#"
            workflow w {
              on: push
              job outside { runs_on: x  steps: [ run("") ] }
              cycle c {
                max_iters = 2
                key = "k"
                body {
                  job first { runs_on: x  steps: [ run("") ] }
                  job second { runs_on: x  needs: [first, outside]  steps: [ run("") ] }
                }
              }
            }
            "#,
        );
        let items = diagnostics.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].code, Code::CycleBodyNeeds);
        assert!(items[0].message.contains("outside"));
    }

    #[test]
    fn test_matrix_rules() {
        let diagnostics = validate(
            r#"
            workflow w {
              on: push
              matrix m {
                runs_on: x
                axes: { os: [], node: [18, 20] }
                steps: [ run("") ]
              }
            }
            "#,
        );
        assert!(codes(&diagnostics).contains(&Code::MatrixEmptyAxis));
    }

    #[test]
    fn test_matrix_product_limit() {
        let diagnostics = validate(
            r#"
            workflow w {
              on: push
              matrix m {
                runs_on: x
                axes: {
                  a: [1, 2, 3, 4, 5, 6, 7],
                  b: [1, 2, 3, 4, 5, 6, 7],
                  c: [1, 2, 3, 4, 5, 6, 7]
                }
                steps: [ run("") ]
              }
            }
            "#,
        );
        assert!(codes(&diagnostics).contains(&Code::MatrixTooLarge));
    }

    #[test]
    fn test_agent_task_required_fields() {
        let diagnostics = validate(
            r#"
            workflow w {
              on: push
              agent_job a {
                runs_on: x
                steps: [ agent_task("review") { tools: ["bash"] } ]
              }
            }
            "#,
        );
        let found = codes(&diagnostics);
        assert!(found.contains(&Code::AgentMissingModel));
        assert!(found.contains(&Code::AgentMissingMaxTurns));
    }

    #[test]
    fn test_clean_workflow_passes() {
        let diagnostics = validate(
            r#"
            workflow w {
              on: push
              job a { runs_on: ubuntu-latest  steps: [ run("echo hi") ] }
              job b { runs_on: ubuntu-latest  needs: [a]  steps: [ run("echo bye") ] }
            }
            "#,
        );
        assert!(!diagnostics.has_errors(), "{:?}", diagnostics.items());
    }
}
