//! Fragment expansion: job-fragment instantiation and steps-fragment
//! spreads, with scalar-level parameter substitution.
//!
//! Substitution is textual and single-pass: `${{ params.x }}` in a
//! string-valued position is replaced by the supplied value, and the
//! replacement is never re-expanded, so a parameter value containing
//! `${{ ... }}` survives to the emitted YAML verbatim.

use itertools::Itertools;
use workpipe_expressions::extract_expressions;

use crate::diagnostic::{Code, Diagnostic, Diagnostics, Span};
use crate::parser::ast::{
    CycleBodyItem, FragmentCall, JobBody, JobDecl, ParamDecl, ParamType, Spanned, Step, Value,
    ValueKind, WorkflowDecl, WorkflowItem,
};
use crate::types::FileRegistry;

const MAX_SPREAD_DEPTH: usize = 8;

/// Expands every fragment instantiation and spread in the workflow.
/// Runs before semantic validation; expanded bodies are validated like
/// hand-written ones.
pub fn expand_fragments(
    workflow: &mut WorkflowDecl,
    registry: &FileRegistry,
    diagnostics: &mut Diagnostics,
) {
    for item in &mut workflow.items {
        match item {
            WorkflowItem::Job(job) => expand_job(job, registry, diagnostics),
            WorkflowItem::Cycle(cycle) => {
                for body_item in &mut cycle.body {
                    if let CycleBodyItem::Job(job) = body_item {
                        expand_job(job, registry, diagnostics);
                    }
                }
            }
        }
    }
}

fn expand_job(job: &mut JobDecl, registry: &FileRegistry, diagnostics: &mut Diagnostics) {
    if let Some(call) = job.fragment.take() {
        let Some(fragment) = registry.job_fragments.get(&call.name.value) else {
            diagnostics.push(Diagnostic::error(
                Code::UnknownFragment,
                format!("unknown job fragment `{}`", call.name.value),
                call.name.span,
            ));
            return;
        };

        let Some(bindings) = bind_params(&fragment.params, &call, diagnostics) else {
            return;
        };

        let mut body = fragment.body.clone();
        substitute_body(&mut body, &bindings);
        job.body = body;
    }

    expand_spreads(&mut job.body.steps, registry, diagnostics, 0);
}

fn expand_spreads(
    steps: &mut Vec<Step>,
    registry: &FileRegistry,
    diagnostics: &mut Diagnostics,
    depth: usize,
) {
    if !steps.iter().any(|s| matches!(s, Step::Spread(_))) {
        return;
    }

    if depth >= MAX_SPREAD_DEPTH {
        let span = steps
            .iter()
            .find(|s| matches!(s, Step::Spread(_)))
            .map(|s| s.span())
            .unwrap_or_else(Span::empty);
        diagnostics.push(Diagnostic::error(
            Code::UnknownFragment,
            "steps fragments nest too deeply (likely a fragment that spreads itself)",
            span,
        ));
        steps.retain(|s| !matches!(s, Step::Spread(_)));
        return;
    }

    let mut out = Vec::with_capacity(steps.len());
    for step in steps.drain(..) {
        let Step::Spread(spread) = step else {
            out.push(step);
            continue;
        };

        let Some(fragment) = registry.steps_fragments.get(&spread.fragment.value) else {
            diagnostics.push(Diagnostic::error(
                Code::UnknownFragment,
                format!("unknown steps fragment `{}`", spread.fragment.value),
                spread.fragment.span,
            ));
            continue;
        };

        let call = FragmentCall {
            name: spread.fragment.clone(),
            args: spread.args.clone(),
            span: spread.span,
        };
        let Some(bindings) = bind_params(&fragment.params, &call, diagnostics) else {
            continue;
        };

        let mut spliced = fragment.steps.clone();
        for step in &mut spliced {
            substitute_step(step, &bindings);
        }
        expand_spreads(&mut spliced, registry, diagnostics, depth + 1);
        out.extend(spliced);
    }
    *steps = out;
}

/// One bound parameter: the rendered replacement for
/// `${{ params.<name> }}`.
struct Binding {
    name: String,
    replacement: String,
}

fn bind_params(
    params: &[ParamDecl],
    call: &FragmentCall,
    diagnostics: &mut Diagnostics,
) -> Option<Vec<Binding>> {
    let mut ok = true;

    for (key, _) in &call.args {
        if !params.iter().any(|p| p.name.value == key.value) {
            diagnostics.push(Diagnostic::error(
                Code::FragmentUnknownParam,
                format!(
                    "fragment `{}` has no parameter `{}`",
                    call.name.value, key.value
                ),
                key.span,
            ));
            ok = false;
        }
    }

    let mut bindings = vec![];
    for param in params {
        let supplied = call.args.iter().find(|(key, _)| key.value == param.name.value);

        let value = match (supplied, &param.default) {
            (Some((_, value)), _) => value,
            (None, Some(default)) => default,
            (None, None) => {
                diagnostics.push(
                    Diagnostic::error(
                        Code::FragmentMissingParam,
                        format!(
                            "missing required parameter `{}` of fragment `{}`",
                            param.name.value, call.name.value
                        ),
                        call.span,
                    )
                    .with_hint(format!("declared as `{}: {}`", param.name.value, param.ty)),
                );
                ok = false;
                continue;
            }
        };

        match render_param(param, value) {
            Some(replacement) => bindings.push(Binding {
                name: param.name.value.clone(),
                replacement,
            }),
            None => {
                diagnostics.push(Diagnostic::error(
                    Code::FragmentParamType,
                    format!(
                        "parameter `{}` expects {} but got {}",
                        param.name.value,
                        param.ty,
                        value.kind.type_name()
                    ),
                    value.span,
                ));
                ok = false;
            }
        }
    }

    ok.then_some(bindings)
}

/// Renders a parameter value for textual substitution, or `None` on a
/// type mismatch.
fn render_param(param: &ParamDecl, value: &Value) -> Option<String> {
    match (param.ty, &value.kind) {
        (ParamType::String, ValueKind::String(s)) => Some(s.clone()),
        (ParamType::Int, ValueKind::Int(n)) => Some(n.to_string()),
        (ParamType::Bool, ValueKind::Bool(b)) => Some(b.to_string()),
        (ParamType::StringList, ValueKind::List(items)) => {
            let strings: Option<Vec<&String>> = items
                .iter()
                .map(|item| match &item.kind {
                    ValueKind::String(s) => Some(s),
                    _ => None,
                })
                .collect();
            strings.map(|s| s.iter().join(","))
        }
        _ => None,
    }
}

fn substitute_body(body: &mut JobBody, bindings: &[Binding]) {
    substitute_opt(&mut body.runs_on, bindings);
    substitute_opt(&mut body.condition, bindings);
    substitute_opt(&mut body.environment, bindings);
    for step in &mut body.steps {
        substitute_step(step, bindings);
    }
}

fn substitute_step(step: &mut Step, bindings: &[Binding]) {
    match step {
        Step::Run(run) => substitute_scalar(&mut run.command, bindings),
        Step::Shell(shell) => substitute_scalar(&mut shell.script, bindings),
        Step::Guard(guard) => {
            substitute_scalar(&mut guard.name, bindings);
            substitute_scalar(&mut guard.code, bindings);
        }
        Step::Uses(uses) => {
            substitute_scalar(&mut uses.action, bindings);
            for (_, value) in &mut uses.with {
                substitute_value(value, bindings);
            }
        }
        Step::AgentTask(task) => {
            substitute_scalar(&mut task.prompt, bindings);
            substitute_opt(&mut task.model, bindings);
            substitute_opt(&mut task.output_artifact, bindings);
            for tool in &mut task.tools {
                substitute_scalar(tool, bindings);
            }
        }
        Step::Spread(spread) => {
            for (_, value) in &mut spread.args {
                substitute_value(value, bindings);
            }
        }
    }
}

fn substitute_value(value: &mut Value, bindings: &[Binding]) {
    match &mut value.kind {
        ValueKind::String(s) => *s = substitute_text(s, bindings),
        ValueKind::List(items) => {
            for item in items {
                substitute_value(item, bindings);
            }
        }
        ValueKind::Object(entries) => {
            for (_, item) in entries {
                substitute_value(item, bindings);
            }
        }
        _ => (),
    }
}

fn substitute_opt(slot: &mut Option<Spanned<String>>, bindings: &[Binding]) {
    if let Some(scalar) = slot {
        substitute_scalar(scalar, bindings);
    }
}

fn substitute_scalar(scalar: &mut Spanned<String>, bindings: &[Binding]) {
    scalar.value = substitute_text(&scalar.value, bindings);
}

/// Replaces each `${{ params.<name> }}` occurrence with its binding.
/// Occurrences whose body is anything else are left untouched, as are
/// unbound parameter names.
fn substitute_text(text: &str, bindings: &[Binding]) -> String {
    let occurrences = extract_expressions(text);
    if occurrences.is_empty() {
        return text.to_owned();
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    for occurrence in occurrences {
        let body = occurrence.body(text).trim();
        let replacement = body
            .strip_prefix("params.")
            .and_then(|name| bindings.iter().find(|b| b.name == name))
            .map(|b| b.replacement.as_str());

        if let Some(replacement) = replacement {
            out.push_str(&text[cursor..occurrence.outer.start]);
            out.push_str(replacement);
            cursor = occurrence.outer.end;
        }
    }

    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    use crate::diagnostic::{Code, Diagnostics};
    use crate::parser::ast::{Step, WorkflowItem};
    use crate::parser::parse_file;
    use crate::types::registry::build_registry;

    fn expand(source: &str) -> (crate::parser::ast::WorkflowDecl, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let ast = parse_file(source, &mut diagnostics).expect("parses");
        let registry = build_registry(&ast, &[], &IndexMap::new(), &mut diagnostics);
        let mut workflow = ast.workflow.expect("workflow");
        super::expand_fragments(&mut workflow, &registry, &mut diagnostics);
        (workflow, diagnostics)
    }

    fn run_command(workflow: &crate::parser::ast::WorkflowDecl, job: usize, step: usize) -> String {
        let WorkflowItem::Job(job) = &workflow.items[job] else {
            panic!("expected job");
        };
        let Step::Run(run) = &job.body.steps[step] else {
            panic!("expected run step");
        };
        run.command.value.clone()
    }

    #[test]
    fn test_job_fragment_instantiation() {
        let (workflow, diagnostics) = expand(
            r#"
            job_fragment deploy params(env: string) {
              runs_on: ubuntu-latest
              steps: [ run("deploy to ${{ params.env }}") ]
            }
            workflow w {
              on: push
              job staging = deploy { env: "staging" }
              job prod = deploy { env: "production" }
            }
            "#,
        );

        assert!(!diagnostics.has_errors(), "{:?}", diagnostics.items());
        assert_eq!(run_command(&workflow, 0, 0), "deploy to staging");
        assert_eq!(run_command(&workflow, 1, 0), "deploy to production");
    }

    #[test]
    fn test_default_and_typed_params() {
        let (workflow, diagnostics) = expand(
            r#"
            job_fragment build params(parallel: int = 4, verbose: bool = false) {
              runs_on: ubuntu-latest
              steps: [ run("make -j${{ params.parallel }} VERBOSE=${{ params.verbose }}") ]
            }
            workflow w {
              on: push
              job b = build { parallel: 8 }
            }
            "#,
        );

        assert!(!diagnostics.has_errors(), "{:?}", diagnostics.items());
        assert_eq!(run_command(&workflow, 0, 0), "make -j8 VERBOSE=false");
    }

    #[test]
    fn test_missing_and_unknown_params() {
        let (_, diagnostics) = expand(
            r#"
            job_fragment deploy params(env: string) {
              runs_on: x
              steps: [ run("") ]
            }
            workflow w {
              on: push
              job a = deploy { typo: "x" }
            }
            "#,
        );

        let codes: Vec<_> = diagnostics.items().iter().map(|d| d.code).collect();
        assert!(codes.contains(&Code::FragmentUnknownParam));
        assert!(codes.contains(&Code::FragmentMissingParam));
    }

    #[test]
    fn test_param_type_mismatch() {
        let (_, diagnostics) = expand(
            r#"
            job_fragment build params(parallel: int) {
              runs_on: x
              steps: [ run("") ]
            }
            workflow w {
              on: push
              job a = build { parallel: "lots" }
            }
            "#,
        );

        assert_eq!(diagnostics.items()[0].code, Code::FragmentParamType);
    }

    #[test]
    fn test_steps_spread_preserves_order() {
        let (workflow, diagnostics) = expand(
            r#"
            steps_fragment setup params(version: string) {
              run("install ${{ params.version }}")
              run("verify")
            }
            workflow w {
              on: push
              job j {
                runs_on: x
                steps: [
                  run("before"),
                  ...setup { version: "20" },
                  run("after")
                ]
              }
            }
            "#,
        );

        assert!(!diagnostics.has_errors(), "{:?}", diagnostics.items());
        assert_eq!(run_command(&workflow, 0, 0), "before");
        assert_eq!(run_command(&workflow, 0, 1), "install 20");
        assert_eq!(run_command(&workflow, 0, 2), "verify");
        assert_eq!(run_command(&workflow, 0, 3), "after");
    }

    #[test]
    fn test_substitution_is_single_pass() {
        // A value containing `${{ ... }}` is spliced verbatim and not
        // re-expanded.
        let (workflow, diagnostics) = expand(
            r#"
            job_fragment echo params(msg: string) {
              runs_on: x
              steps: [ run("echo ${{ params.msg }}") ]
            }
            workflow w {
              on: push
              job a = echo { msg: "${{ github.actor }}" }
            }
            "#,
        );

        assert!(!diagnostics.has_errors());
        assert_eq!(run_command(&workflow, 0, 0), "echo ${{ github.actor }}");
    }

    #[test]
    fn test_unknown_fragment() {
        let (_, diagnostics) = expand(
            r#"
            workflow w {
              on: push
              job a = nonexistent { }
            }
            "#,
        );
        assert_eq!(diagnostics.items()[0].code, Code::UnknownFragment);
    }
}
