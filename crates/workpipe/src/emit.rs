//! The canonical YAML serializer.
//!
//! Emission is byte-deterministic: keys come out in a fixed order,
//! indentation is two spaces, multi-line scalars use the `|` literal
//! block form with internal line breaks preserved exactly, and
//! quoting follows a single set of rules. `serde_yaml` re-parses the
//! output in tests to hold the idempotence property; it is never used
//! to produce it.

use std::fmt::Write as _;

use crate::ir::{JobIr, Scalar, StepIr, WorkflowIr};

const INDENT: &str = "  ";

pub fn emit(workflow: &WorkflowIr) -> String {
    let mut out = String::new();
    let w = &mut out;

    line(w, 0, "name", &workflow.name);
    emit_triggers(w, workflow);

    if !workflow.permissions.is_empty() {
        push_key(w, 0, "permissions");
        for (key, value) in &workflow.permissions {
            line(w, 1, key, value);
        }
    }

    push_key(w, 0, "jobs");
    for (id, job) in &workflow.jobs {
        push_key(w, 1, id);
        emit_job(w, job);
    }

    out
}

fn emit_triggers(w: &mut String, workflow: &WorkflowIr) {
    let on = &workflow.on;

    if on.dispatch_inputs.is_empty() {
        match on.events.as_slice() {
            [single] => line(w, 0, "on", single),
            events => {
                let rendered = events.iter().map(|e| quote_if_needed(e)).collect::<Vec<_>>();
                push_raw(w, 0, &format!("on: [{}]", rendered.join(", ")));
            }
        }
        return;
    }

    push_key(w, 0, "on");
    for event in &on.events {
        push_raw(w, 1, &format!("{}:", quote_if_needed(event)));
    }
    push_key(w, 1, "workflow_dispatch");
    push_key(w, 2, "inputs");
    for (name, input) in &on.dispatch_inputs {
        push_key(w, 3, name);
        line(w, 4, "description", &input.description);
        line(w, 4, "default", &input.default);
    }
}

fn emit_job(w: &mut String, job: &JobIr) {
    let base = 2;

    if let Some(name) = &job.name {
        line(w, base, "name", name);
    }
    line(w, base, "runs-on", &job.runs_on);

    if !job.needs.is_empty() {
        let rendered = job.needs.iter().map(|n| quote_if_needed(n)).collect::<Vec<_>>();
        push_raw(w, base, &format!("needs: [{}]", rendered.join(", ")));
    }

    if let Some(condition) = &job.condition {
        line(w, base, "if", condition);
    }
    if let Some(environment) = &job.environment {
        line(w, base, "environment", environment);
    }

    if !job.permissions.is_empty() {
        push_key(w, base, "permissions");
        for (key, value) in &job.permissions {
            line(w, base + 1, key, value);
        }
    }

    if let Some(strategy) = &job.strategy {
        push_key(w, base, "strategy");
        push_key(w, base + 1, "matrix");
        for (axis, values) in &strategy.matrix.axes {
            let rendered = values.iter().map(render_scalar).collect::<Vec<_>>();
            push_raw(
                w,
                base + 2,
                &format!("{}: [{}]", quote_if_needed(axis), rendered.join(", ")),
            );
        }
        for (key, rows) in [
            ("include", &strategy.matrix.include),
            ("exclude", &strategy.matrix.exclude),
        ] {
            if rows.is_empty() {
                continue;
            }
            push_key(w, base + 2, key);
            for row in rows {
                let rendered = row
                    .iter()
                    .map(|(k, v)| format!("{}: {}", quote_if_needed(k), render_scalar(v)))
                    .collect::<Vec<_>>();
                push_raw(w, base + 3, &format!("- {{{}}}", rendered.join(", ")));
            }
        }
    }

    if !job.outputs.is_empty() {
        push_key(w, base, "outputs");
        for (name, value) in &job.outputs {
            line(w, base + 1, name, value);
        }
    }

    if !job.steps.is_empty() {
        push_key(w, base, "steps");
        for step in &job.steps {
            emit_step(w, step, base + 1);
        }
    }
}

fn emit_step(w: &mut String, step: &StepIr, indent: usize) {
    // The first emitted field rides on the `- ` line; the rest align
    // two spaces deeper.
    let mut first = true;
    let mut entry = |w: &mut String, text: &str| {
        if first {
            push_raw(w, indent, &format!("- {text}"));
            first = false;
        } else {
            push_raw(w, indent + 1, text);
        }
    };

    if let Some(name) = &step.name {
        entry(w, &render_entry("name", name));
    }
    if let Some(id) = &step.id {
        entry(w, &render_entry("id", id));
    }
    if let Some(condition) = &step.condition {
        entry(w, &render_entry("if", condition));
    }
    if let Some(uses) = &step.uses {
        entry(w, &render_entry("uses", uses));
    }
    if !step.with.is_empty() {
        entry(w, "with:");
        for (key, value) in &step.with {
            push_raw(
                w,
                indent + 2,
                &format!("{}: {}", quote_if_needed(key), render_scalar(value)),
            );
        }
    }
    if let Some(run) = &step.run {
        if run.contains('\n') {
            entry(w, block_header("run", run).as_str());
            push_block_body(w, indent + 2, run);
        } else {
            entry(w, &render_entry("run", run));
        }
    }
    if !step.env.is_empty() {
        entry(w, "env:");
        for (key, value) in &step.env {
            push_raw(
                w,
                indent + 2,
                &format!("{}: {}", quote_if_needed(key), quote_if_needed(value)),
            );
        }
    }
    if step.continue_on_error {
        entry(w, "continue-on-error: true");
    }
}

/// Emits `key: value` at the given indent, switching to a literal
/// block for multi-line values.
fn line(w: &mut String, indent: usize, key: &str, value: &str) {
    if value.contains('\n') {
        push_raw(w, indent, &block_header(key, value));
        push_block_body(w, indent + 1, value);
    } else {
        push_raw(w, indent, &render_entry(key, value));
    }
}

fn render_entry(key: &str, value: &str) -> String {
    format!("{}: {}", quote_if_needed(key), quote_if_needed(value))
}

fn push_key(w: &mut String, indent: usize, key: &str) {
    push_raw(w, indent, &format!("{}:", quote_if_needed(key)));
}

fn push_raw(w: &mut String, indent: usize, text: &str) {
    for _ in 0..indent {
        w.push_str(INDENT);
    }
    let _ = writeln!(w, "{text}");
}

/// `|` keeps the trailing newline, `|-` chomps it; picking by the
/// value's own tail preserves internal line breaks exactly.
fn block_header(key: &str, value: &str) -> String {
    if value.ends_with('\n') {
        format!("{}: |", quote_if_needed(key))
    } else {
        format!("{}: |-", quote_if_needed(key))
    }
}

fn push_block_body(w: &mut String, indent: usize, value: &str) {
    for line in value.trim_end_matches('\n').split('\n') {
        if line.is_empty() {
            w.push('\n');
        } else {
            push_raw(w, indent, line);
        }
    }
}

fn render_scalar(scalar: &Scalar) -> String {
    match scalar {
        Scalar::Str(s) => quote_if_needed(s),
        Scalar::Int(n) => n.to_string(),
        Scalar::Float(f) => {
            // Keep a decimal point so the value re-parses as a float.
            if f.fract() == 0.0 && f.is_finite() {
                format!("{f:.1}")
            } else {
                f.to_string()
            }
        }
        Scalar::Bool(b) => b.to_string(),
    }
}

/// Double-quotes a string when emitting it bare would change its
/// meaning: YAML indicators in leading position, `: ` / ` #`
/// sequences, boolean/null/numeric look-alikes, surrounding
/// whitespace, a leading `@`, or a value that is purely a `${{ ... }}`
/// expression.
fn quote_if_needed(s: &str) -> String {
    if needs_quoting(s) {
        let mut out = String::with_capacity(s.len() + 2);
        out.push('"');
        for c in s.chars() {
            match c {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                other => out.push(other),
            }
        }
        out.push('"');
        out
    } else {
        s.to_owned()
    }
}

fn needs_quoting(s: &str) -> bool {
    if s.is_empty() {
        return true;
    }
    if s.starts_with(char::is_whitespace) || s.ends_with(char::is_whitespace) {
        return true;
    }
    if s.starts_with("${{") {
        return true;
    }

    let first = s.chars().next().expect("non-empty");
    if "-?:,[]{}#&*!|>'\"%@`".contains(first) {
        return true;
    }

    if s.contains(": ") || s.ends_with(':') || s.contains(" #") {
        return true;
    }
    if s.contains('\n') || s.contains('\t') || s.contains('"') {
        return true;
    }
    // Flow indicators break flow collections and surprise in block
    // context; scalars carrying them always travel quoted.
    if s.contains(['[', ']', '{', '}', ',']) {
        return true;
    }

    let lowered = s.to_ascii_lowercase();
    if matches!(
        lowered.as_str(),
        "true" | "false" | "yes" | "no" | "on" | "off" | "null" | "~"
    ) {
        return true;
    }

    // Pure numbers would re-parse as numbers, not strings.
    if s.parse::<i64>().is_ok() || s.parse::<f64>().is_ok() {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    use crate::ir::{JobIr, Scalar, StepIr, TriggerIr, WorkflowIr};

    use super::{emit, quote_if_needed};

    #[test]
    fn test_quoting_rules() {
        assert_eq!(quote_if_needed("echo hi"), "echo hi");
        assert_eq!(quote_if_needed("ubuntu-latest"), "ubuntu-latest");
        assert_eq!(quote_if_needed("a/b@v4"), "a/b@v4");
        // Embedded expressions carry braces, so they travel quoted.
        assert_eq!(
            quote_if_needed("echo ${{ x }} done"),
            "\"echo ${{ x }} done\""
        );

        assert_eq!(quote_if_needed(""), "\"\"");
        assert_eq!(quote_if_needed("123"), "\"123\"");
        assert_eq!(quote_if_needed("1.5"), "\"1.5\"");
        assert_eq!(quote_if_needed("true"), "\"true\"");
        assert_eq!(quote_if_needed("@scope/pkg"), "\"@scope/pkg\"");
        assert_eq!(quote_if_needed("${{ x }}"), "\"${{ x }}\"");
        assert_eq!(quote_if_needed("key: value"), "\"key: value\"");
        assert_eq!(quote_if_needed("- item"), "\"- item\"");
        assert_eq!(quote_if_needed(" padded"), "\" padded\"");
    }

    fn minimal_workflow() -> WorkflowIr {
        WorkflowIr {
            name: "w".into(),
            on: TriggerIr {
                events: vec!["push".into()],
                dispatch_inputs: IndexMap::new(),
            },
            permissions: IndexMap::new(),
            jobs: IndexMap::from([(
                "j".to_owned(),
                JobIr {
                    runs_on: "ubuntu-latest".into(),
                    steps: vec![StepIr {
                        run: Some("echo hi".into()),
                        ..StepIr::default()
                    }],
                    ..JobIr::default()
                },
            )]),
        }
    }

    #[test]
    fn test_emit_minimal() {
        let yaml = emit(&minimal_workflow());
        assert_eq!(
            yaml,
            "name: w\n\
             on: push\n\
             jobs:\n\
            \u{20} j:\n\
            \u{20}   runs-on: ubuntu-latest\n\
            \u{20}   steps:\n\
            \u{20}     - run: echo hi\n"
        );
    }

    #[test]
    fn test_emit_is_deterministic() {
        let workflow = minimal_workflow();
        assert_eq!(emit(&workflow), emit(&workflow));
    }

    #[test]
    fn test_multiline_run_uses_block_form() {
        let mut workflow = minimal_workflow();
        workflow.jobs["j"].steps[0].run = Some("first line\nsecond line\n".into());

        let yaml = emit(&workflow);
        assert!(yaml.contains("- run: |\n"));
        assert!(yaml.contains("          first line\n"));
        assert!(yaml.contains("          second line\n"));
    }

    #[test]
    fn test_emitted_yaml_reparses() {
        let mut workflow = minimal_workflow();
        workflow.jobs["j"].steps[0].run =
            Some("echo \"quoted\"\nprintf '%s' \"$STATE\" > state.json\n".into());
        workflow.jobs["j"].steps.push(StepIr {
            uses: Some("actions/checkout@v4".into()),
            with: IndexMap::from([
                ("ref".to_owned(), Scalar::from("${{ github.ref }}")),
                ("fetch-depth".to_owned(), Scalar::Int(0)),
            ]),
            ..StepIr::default()
        });

        let yaml = emit(&workflow);
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("emitted YAML parses");

        assert_eq!(parsed["name"], "w");
        assert_eq!(
            parsed["jobs"]["j"]["steps"][0]["run"],
            "echo \"quoted\"\nprintf '%s' \"$STATE\" > state.json\n"
        );
        assert_eq!(
            parsed["jobs"]["j"]["steps"][1]["with"]["ref"],
            "${{ github.ref }}"
        );
        assert_eq!(parsed["jobs"]["j"]["steps"][1]["with"]["fetch-depth"], 0);
    }

    #[test]
    fn test_needs_and_expressions_quoting() {
        let mut workflow = minimal_workflow();
        workflow.jobs["j"].needs = vec!["a".into(), "b".into()];
        workflow.jobs["j"].condition = Some("${{ always() }}".into());

        let yaml = emit(&workflow);
        assert!(yaml.contains("needs: [a, b]\n"));
        assert!(yaml.contains("if: \"${{ always() }}\"\n"));

        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["jobs"]["j"]["if"], "${{ always() }}");
    }
}
