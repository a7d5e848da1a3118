//! Lowering from the validated AST to the IR, including the cycle
//! transform.
//!
//! A cycle cannot exist in GitHub Actions' acyclic job graph, so each
//! one becomes a DAG fixpoint spanning workflow runs: a `_hydrate` job
//! restores the previous iteration's state artifact, the body jobs run
//! against it, a `_decide` job merges contributions and evaluates the
//! termination predicate, and a `_dispatch` job re-triggers the
//! workflow while the predicate says to continue.

use indexmap::IndexMap;
use itertools::Itertools;
use serde_json::json;

use crate::ir::{
    DispatchInputIr, JobIr, MatrixIr, Scalar, StepIr, StrategyIr, TriggerIr, WorkflowIr,
};
use crate::parser::ast::{
    AgentTaskStep, CycleBodyItem, CycleDecl, JobDecl, JobKind, Primitive, Step, TypeExpr,
    TypeKind, ValueKind, WorkflowDecl, WorkflowItem,
};

/// The action invoked for `agent_task` steps; the runtime harness
/// behind it is a separate project.
pub const AGENT_RUNNER_ACTION: &str = "workpipe/agent-runner@v1";

const DOWNLOAD_ARTIFACT_ACTION: &str = "actions/download-artifact@v4";
const UPLOAD_ARTIFACT_ACTION: &str = "actions/upload-artifact@v4";

/// The hard iteration cap applied when a cycle declares `until` but no
/// `max_iters`.
pub const UNBOUNDED_CYCLE_CAP: u32 = 100;

pub fn lower_workflow(workflow: &WorkflowDecl) -> WorkflowIr {
    let has_cycles = workflow
        .items
        .iter()
        .any(|item| matches!(item, WorkflowItem::Cycle(_)));

    let mut on = TriggerIr {
        events: workflow.triggers.iter().map(|t| t.value.clone()).collect(),
        dispatch_inputs: IndexMap::new(),
    };

    if has_cycles {
        // Self-dispatch arrives with the cycle key, the iteration to
        // hydrate, and the run that produced the state artifact.
        for (name, description) in [
            ("cycle", "key of the cycle being continued"),
            ("iteration", "iteration counter to hydrate"),
            ("source_run_id", "run id that uploaded the state artifact"),
        ] {
            on.dispatch_inputs.insert(
                name.into(),
                DispatchInputIr {
                    description: description.into(),
                    default: if name == "iteration" { "0" } else { "" }.into(),
                },
            );
        }
    }

    let mut jobs = IndexMap::new();
    for item in &workflow.items {
        match item {
            WorkflowItem::Job(job) => {
                jobs.insert(job.name.value.clone(), lower_job(job));
            }
            WorkflowItem::Cycle(cycle) => {
                lower_cycle(cycle, &workflow.name.value, &mut jobs);
            }
        }
    }

    WorkflowIr {
        name: workflow.name.value.clone(),
        on,
        permissions: IndexMap::new(),
        jobs,
    }
}

fn lower_job(job: &JobDecl) -> JobIr {
    let mut out = JobIr {
        runs_on: job
            .body
            .runs_on
            .as_ref()
            .map(|r| r.value.clone())
            .unwrap_or_default(),
        needs: job.body.needs.iter().map(|n| n.value.clone()).collect(),
        condition: job.body.condition.as_ref().map(|c| c.value.clone()),
        environment: job.body.environment.as_ref().map(|e| e.value.clone()),
        ..JobIr::default()
    };

    if job.kind == JobKind::Matrix {
        if let Some(matrix) = &job.body.matrix {
            let mut ir = MatrixIr::default();
            for (name, values) in &matrix.axes {
                ir.axes.insert(
                    name.value.clone(),
                    values.value.iter().map(Scalar::from).collect(),
                );
            }
            for row in &matrix.include {
                ir.include.extend(lower_matrix_row(row));
            }
            for row in &matrix.exclude {
                ir.exclude.extend(lower_matrix_row(row));
            }
            out.strategy = Some(StrategyIr { matrix: ir });
        }
    }

    // Steps get ids when something refers back to them: declared job
    // outputs read the last step, and guard steps publish `result`.
    let want_ids = !job.body.outputs.is_empty()
        || job
            .body
            .steps
            .iter()
            .any(|s| matches!(s, Step::Guard(_)));

    out.steps = job
        .body
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let id = want_ids.then(|| format!("s{index}"));
            lower_step(step, id)
        })
        .collect();

    if let Some(last_id) = out.steps.last().and_then(|s| s.id.clone()) {
        for output in &job.body.outputs {
            out.outputs.insert(
                output.name.value.clone(),
                format!("${{{{ steps.{last_id}.outputs.{} }}}}", output.name.value),
            );
        }
    }

    out
}

fn lower_matrix_row(row: &crate::parser::ast::Value) -> Option<IndexMap<String, Scalar>> {
    match &row.kind {
        ValueKind::Object(entries) => Some(
            entries
                .iter()
                .map(|(key, value)| (key.value.clone(), Scalar::from(value)))
                .collect(),
        ),
        _ => None,
    }
}

fn lower_step(step: &Step, id: Option<String>) -> StepIr {
    match step {
        Step::Run(run) => StepIr {
            id,
            run: Some(run.command.value.clone()),
            ..StepIr::default()
        },
        Step::Shell(shell) => StepIr {
            id,
            run: Some(shell.script.value.clone()),
            ..StepIr::default()
        },
        Step::Uses(uses) => StepIr {
            id,
            uses: Some(uses.action.value.clone()),
            with: uses
                .with
                .iter()
                .map(|(key, value)| (key.value.clone(), Scalar::from(value)))
                .collect(),
            ..StepIr::default()
        },
        Step::Guard(guard) => StepIr {
            name: Some(guard.name.value.clone()),
            id,
            run: Some(guard_harness(&guard.code.value)),
            ..StepIr::default()
        },
        Step::AgentTask(task) => lower_agent_task(task, id),
        // Spreads are gone after expansion; an unexpanded one here is
        // an internal error surfaced by the emitter producing nothing.
        Step::Spread(spread) => StepIr {
            id,
            run: Some(format!("echo 'unexpanded fragment {}' && exit 1", spread.fragment.value)),
            ..StepIr::default()
        },
    }
}

/// Wraps opaque guard JavaScript so its boolean verdict lands in the
/// step's `result` output.
fn guard_harness(code: &str) -> String {
    format!(
        "cat > step-guard.js <<'WORKPIPE_GUARD'\n\
         const guard = function () {{\n\
         {code}\n\
         }};\n\
         require(\"fs\").appendFileSync(process.env.GITHUB_OUTPUT, `result=${{guard() ? \"true\" : \"false\"}}\\n`);\n\
         WORKPIPE_GUARD\n\
         node step-guard.js\n"
    )
}

fn lower_agent_task(task: &AgentTaskStep, id: Option<String>) -> StepIr {
    let mut with: IndexMap<String, Scalar> = IndexMap::new();
    with.insert("prompt".into(), task.prompt.value.as_str().into());
    if let Some(model) = &task.model {
        with.insert("model".into(), model.value.as_str().into());
    }
    if let Some(max_turns) = &task.max_turns {
        with.insert("max-turns".into(), Scalar::Int(max_turns.value));
    }
    if !task.tools.is_empty() {
        with.insert(
            "tools".into(),
            task.tools.iter().map(|t| t.value.as_str()).join(",").into(),
        );
    }
    if let Some(schema) = &task.output_schema {
        with.insert("output-schema".into(), schema_json(schema).into());
    }
    if let Some(artifact) = &task.output_artifact {
        with.insert("output-artifact".into(), artifact.value.as_str().into());
    }

    StepIr {
        id,
        uses: Some(AGENT_RUNNER_ACTION.into()),
        with,
        ..StepIr::default()
    }
}

/// Compact JSON encoding of an agent output schema, passed to the
/// runner action verbatim.
fn schema_json(ty: &TypeExpr) -> String {
    fn encode(ty: &TypeExpr) -> serde_json::Value {
        match &ty.kind {
            TypeKind::Primitive(p) => json!(match p {
                Primitive::String => "string",
                Primitive::Int => "int",
                Primitive::Float => "float",
                Primitive::Bool => "bool",
                Primitive::Json => "json",
            }),
            TypeKind::LiteralUnion(options) => json!({ "enum": options }),
            TypeKind::Nullable(inner) => json!({ "nullable": encode(inner) }),
            TypeKind::List(inner) => json!([encode(inner)]),
            TypeKind::Object(fields) => {
                let mut map = serde_json::Map::new();
                for field in fields {
                    map.insert(field.name.value.clone(), encode(&field.ty));
                }
                serde_json::Value::Object(map)
            }
            TypeKind::Named(name) => json!({ "ref": name }),
        }
    }

    encode(ty).to_string()
}

/// Expands one cycle into the hydrate / body / decide / dispatch
/// skeleton, inserted at the cycle's declaration point.
fn lower_cycle(cycle: &CycleDecl, workflow_name: &str, jobs: &mut IndexMap<String, JobIr>) {
    let cycle_name = &cycle.name.value;
    let key = cycle.key.as_ref().map(|k| k.value.as_str()).unwrap_or("");
    let hydrate_name = format!("{cycle_name}_hydrate");
    let decide_name = format!("{cycle_name}_decide");
    let dispatch_name = format!("{cycle_name}_dispatch");

    let body_jobs: Vec<&JobDecl> = cycle
        .body
        .iter()
        .filter_map(|item| match item {
            CycleBodyItem::Job(job) => Some(job),
            CycleBodyItem::Cycle(_) => None,
        })
        .collect();

    let runner = body_jobs
        .first()
        .and_then(|job| job.body.runs_on.as_ref())
        .map(|r| r.value.clone())
        .unwrap_or_else(|| "ubuntu-latest".to_owned());

    jobs.insert(
        hydrate_name.clone(),
        hydrate_job(workflow_name, key, &runner),
    );

    for job in &body_jobs {
        let mut ir = lower_job(job);
        if !ir.needs.contains(&hydrate_name) {
            ir.needs.insert(0, hydrate_name.clone());
        }
        if !job.body.outputs.is_empty() {
            push_contribution_steps(&mut ir, cycle_name, &hydrate_name, &job.name.value);
        }
        jobs.insert(job.name.value.clone(), ir);
    }

    let body_names: Vec<String> = body_jobs.iter().map(|j| j.name.value.clone()).collect();
    jobs.insert(
        decide_name.clone(),
        decide_job(cycle, workflow_name, key, &runner, &hydrate_name, &body_names),
    );
    jobs.insert(
        dispatch_name,
        dispatch_job(key, &runner, &decide_name),
    );
}

fn hydrate_job(workflow_name: &str, key: &str, runner: &str) -> JobIr {
    let restore = StepIr {
        name: Some("restore state".into()),
        id: Some("s0".into()),
        condition: Some(format!(
            "${{{{ github.event_name == 'workflow_dispatch' && github.event.inputs.cycle == '{key}' }}}}"
        )),
        uses: Some(DOWNLOAD_ARTIFACT_ACTION.into()),
        with: IndexMap::from([
            (
                "name".to_owned(),
                Scalar::from(format!(
                    "{workflow_name}-{key}-${{{{ github.event.inputs.iteration }}}}"
                )),
            ),
            (
                "github-token".to_owned(),
                Scalar::from("${{ github.token }}"),
            ),
            (
                "run-id".to_owned(),
                Scalar::from("${{ github.event.inputs.source_run_id }}"),
            ),
        ]),
        continue_on_error: true,
        ..StepIr::default()
    };

    let hydrate = StepIr {
        name: Some("hydrate state".into()),
        id: Some("s1".into()),
        run: Some(
            "if [ -f state.json ]; then\n\
             \u{20} echo \"iteration=${{ github.event.inputs.iteration }}\" >> \"$GITHUB_OUTPUT\"\n\
             \u{20} echo \"state=$(cat state.json)\" >> \"$GITHUB_OUTPUT\"\n\
             else\n\
             \u{20} echo \"iteration=0\" >> \"$GITHUB_OUTPUT\"\n\
             \u{20} echo \"state={}\" >> \"$GITHUB_OUTPUT\"\n\
             fi\n"
                .into(),
        ),
        ..StepIr::default()
    };

    JobIr {
        runs_on: runner.into(),
        outputs: IndexMap::from([
            (
                "iteration".to_owned(),
                "${{ steps.s1.outputs.iteration }}".to_owned(),
            ),
            ("state".to_owned(), "${{ steps.s1.outputs.state }}".to_owned()),
        ]),
        steps: vec![restore, hydrate],
        ..JobIr::default()
    }
}

/// Appends the contribution write/upload tail to a body job that
/// produces state.
fn push_contribution_steps(ir: &mut JobIr, cycle_name: &str, hydrate_name: &str, job_name: &str) {
    let next = ir.steps.len();
    ir.steps.push(StepIr {
        name: Some("write contribution".into()),
        id: Some(format!("s{next}")),
        run: Some("printf '%s' '${{ toJSON(steps) }}' > contribution.json\n".into()),
        ..StepIr::default()
    });
    ir.steps.push(StepIr {
        name: Some("upload contribution".into()),
        id: Some(format!("s{}", next + 1)),
        uses: Some(UPLOAD_ARTIFACT_ACTION.into()),
        with: IndexMap::from([
            (
                "name".to_owned(),
                Scalar::from(format!(
                    "{cycle_name}-contrib-{job_name}-${{{{ needs.{hydrate_name}.outputs.iteration }}}}"
                )),
            ),
            ("path".to_owned(), Scalar::from("contribution.json")),
        ]),
        ..StepIr::default()
    });
}

fn decide_job(
    cycle: &CycleDecl,
    workflow_name: &str,
    key: &str,
    runner: &str,
    hydrate_name: &str,
    body_names: &[String],
) -> JobIr {
    let mut needs = vec![hydrate_name.to_owned()];
    needs.extend(body_names.iter().cloned());

    let download = StepIr {
        name: Some("collect contributions".into()),
        id: Some("s0".into()),
        uses: Some(DOWNLOAD_ARTIFACT_ACTION.into()),
        with: IndexMap::from([
            (
                "pattern".to_owned(),
                Scalar::from(format!(
                    "{cycle_name}-contrib-*-${{{{ needs.{hydrate_name}.outputs.iteration }}}}",
                    cycle_name = cycle.name.value
                )),
            ),
            ("path".to_owned(), Scalar::from("contributions")),
            ("merge-multiple".to_owned(), Scalar::Bool(true)),
        ]),
        continue_on_error: true,
        ..StepIr::default()
    };

    let decide = StepIr {
        name: Some("merge state and decide".into()),
        id: Some("s1".into()),
        run: Some(decide_script(cycle, hydrate_name)),
        ..StepIr::default()
    };

    let upload = StepIr {
        name: Some("upload state".into()),
        id: Some("s2".into()),
        uses: Some(UPLOAD_ARTIFACT_ACTION.into()),
        with: IndexMap::from([
            (
                "name".to_owned(),
                Scalar::from(format!(
                    "{workflow_name}-{key}-${{{{ steps.s1.outputs.iteration }}}}"
                )),
            ),
            ("path".to_owned(), Scalar::from("state.json")),
        ]),
        ..StepIr::default()
    };

    JobIr {
        runs_on: runner.into(),
        needs,
        condition: Some("${{ always() }}".into()),
        outputs: IndexMap::from([
            (
                "iteration".to_owned(),
                "${{ steps.s1.outputs.iteration }}".to_owned(),
            ),
            ("state".to_owned(), "${{ steps.s1.outputs.state }}".to_owned()),
            ("done".to_owned(), "${{ steps.s1.outputs.done }}".to_owned()),
        ]),
        steps: vec![download, decide, upload],
        ..JobIr::default()
    }
}

/// The decide job's shell script: merge contributions into the state,
/// apply the failure policy, evaluate the termination predicate, and
/// publish the next iteration.
fn decide_script(cycle: &CycleDecl, hydrate_name: &str) -> String {
    let bound = cycle
        .max_iters
        .as_ref()
        .map(|m| m.value)
        .unwrap_or(UNBOUNDED_CYCLE_CAP);
    let stop_on_failure = cycle
        .retry_policy
        .as_ref()
        .map(|p| p.value == crate::parser::ast::RetryPolicy::Stop)
        .unwrap_or(true);

    let mut script = format!(
        "ITER=\"${{{{ needs.{hydrate_name}.outputs.iteration }}}}\"\n\
         NEXT=$((ITER + 1))\n\
         STATE='${{{{ needs.{hydrate_name}.outputs.state }}}}'\n\
         if ls contributions/*.json >/dev/null 2>&1; then\n\
         \u{20} STATE=\"$(jq -c -s 'reduce .[] as $item ({{}}; . * $item)' <(printf '%s' \"$STATE\") contributions/*.json)\"\n\
         fi\n\
         FAILED=\"${{{{ contains(needs.*.result, 'failure') }}}}\"\n"
    );

    if !stop_on_failure {
        script.push_str(
            "STATE=\"$(printf '%s' \"$STATE\" | jq -c --argjson failed \"$FAILED\" '. + {failed: $failed}')\"\n",
        );
    }

    script.push_str(&format!(
        "DONE=false\n\
         if [ \"$NEXT\" -ge {bound} ]; then DONE=true; fi\n"
    ));

    if stop_on_failure {
        script.push_str("if [ \"$FAILED\" = \"true\" ]; then DONE=true; fi\n");
    }

    if let Some(guard) = &cycle.until {
        script.push_str(&format!(
            "cat > cycle-guard.js <<'WORKPIPE_GUARD'\n\
             const guard = function (state) {{\n\
             {code}\n\
             }};\n\
             const state = JSON.parse(process.env.CYCLE_STATE || \"{{}}\");\n\
             process.stdout.write(guard(state) ? \"true\" : \"false\");\n\
             WORKPIPE_GUARD\n\
             if [ \"$(CYCLE_STATE=\"$STATE\" node cycle-guard.js)\" = \"true\" ]; then DONE=true; fi\n",
            code = guard.value
        ));
    }

    script.push_str(
        "STATE=\"$(printf '%s' \"$STATE\" | jq -c --argjson iteration \"$NEXT\" '. + {iteration: $iteration}')\"\n\
         printf '%s' \"$STATE\" > state.json\n\
         echo \"iteration=$NEXT\" >> \"$GITHUB_OUTPUT\"\n\
         echo \"state=$STATE\" >> \"$GITHUB_OUTPUT\"\n\
         echo \"done=$DONE\" >> \"$GITHUB_OUTPUT\"\n",
    );

    script
}

fn dispatch_job(key: &str, runner: &str, decide_name: &str) -> JobIr {
    let dispatch = StepIr {
        name: Some("dispatch next iteration".into()),
        run: Some(format!(
            "gh workflow run \"$GITHUB_WORKFLOW\" --ref \"$GITHUB_REF_NAME\" \\\n\
             \u{20} -f cycle='{key}' \\\n\
             \u{20} -f iteration='${{{{ needs.{decide_name}.outputs.iteration }}}}' \\\n\
             \u{20} -f source_run_id=\"$GITHUB_RUN_ID\"\n"
        )),
        env: IndexMap::from([("GH_TOKEN".to_owned(), "${{ github.token }}".to_owned())]),
        ..StepIr::default()
    };

    JobIr {
        runs_on: runner.into(),
        needs: vec![decide_name.to_owned()],
        condition: Some(format!(
            "${{{{ always() && needs.{decide_name}.outputs.done == 'false' }}}}"
        )),
        permissions: IndexMap::from([("actions".to_owned(), "write".to_owned())]),
        steps: vec![dispatch],
        ..JobIr::default()
    }
}
