//! Lowers the concrete parse tree into the per-file AST.
//!
//! The reader is total over the grammar: any tree the grammar accepts
//! lowers without panicking. Structural problems the grammar cannot
//! express (duplicate fields, a second workflow, out-of-range numbers)
//! become `WP0002` diagnostics.

use pest::iterators::Pair;

use crate::diagnostic::{Code, Diagnostic, Diagnostics, Span};
use crate::parser::Rule;
use crate::parser::ast::*;

pub(super) fn lower_file(file: Pair<'_, Rule>, diagnostics: &mut Diagnostics) -> FileAst {
    let mut ast = FileAst::default();

    for decl in file.into_inner() {
        match decl.as_rule() {
            Rule::import_decl => ast.imports.push(lower_import(decl)),
            Rule::type_decl => {
                let mut inner = decl.into_inner();
                let name = spanned_text(&inner.next().expect("type name"));
                let body = inner.next().expect("type body");
                let span = span_of(&body);
                let fields = lower_object_fields(body, diagnostics);
                ast.types.push(TypeDecl {
                    name,
                    ty: TypeExpr {
                        kind: TypeKind::Object(fields),
                        span,
                    },
                });
            }
            Rule::job_fragment_decl => {
                let span = span_of(&decl);
                let mut inner = decl.into_inner();
                let name = spanned_text(&inner.next().expect("fragment name"));
                let (params, rest) = lower_params(inner, diagnostics);
                let body = lower_job_body(rest.expect("fragment body"), diagnostics);
                ast.job_fragments.push(JobFragmentDecl {
                    name,
                    params,
                    body,
                    span,
                });
            }
            Rule::steps_fragment_decl => {
                let span = span_of(&decl);
                let mut inner = decl.into_inner();
                let name = spanned_text(&inner.next().expect("fragment name"));
                let (params, rest) = lower_params(inner, diagnostics);
                let steps = lower_steps_block(rest.expect("fragment steps"), diagnostics);
                ast.steps_fragments.push(StepsFragmentDecl {
                    name,
                    params,
                    steps,
                    span,
                });
            }
            Rule::workflow_decl => {
                let workflow = lower_workflow(decl, diagnostics);
                if ast.workflow.is_some() {
                    diagnostics.push(Diagnostic::error(
                        Code::AstBuild,
                        "a file may declare at most one workflow",
                        workflow.name.span,
                    ));
                } else {
                    ast.workflow = Some(workflow);
                }
            }
            Rule::EOI => (),
            rule => unreachable!("unexpected top-level rule: {rule:?}"),
        }
    }

    ast
}

fn lower_import(decl: Pair<'_, Rule>) -> ImportDecl {
    let span = span_of(&decl);
    let mut items = vec![];
    let mut path = Spanned::new(String::new(), span);

    for pair in decl.into_inner() {
        match pair.as_rule() {
            Rule::import_item => {
                let mut inner = pair.into_inner();
                let name = spanned_text(&inner.next().expect("import name"));
                let alias = inner.next().map(|p| spanned_text(&p));
                items.push(ImportItem { name, alias });
            }
            Rule::string => path = string_text(pair),
            rule => unreachable!("unexpected import rule: {rule:?}"),
        }
    }

    ImportDecl { path, items, span }
}

fn lower_workflow(decl: Pair<'_, Rule>, diagnostics: &mut Diagnostics) -> WorkflowDecl {
    let span = span_of(&decl);
    let mut inner = decl.into_inner();
    let name = spanned_text(&inner.next().expect("workflow name"));

    let mut triggers: Vec<Spanned<String>> = vec![];
    let mut items = vec![];

    for pair in inner {
        match pair.as_rule() {
            Rule::on_field => {
                if !triggers.is_empty() {
                    diagnostics.push(Diagnostic::error(
                        Code::AstBuild,
                        "duplicate `on` field",
                        span_of(&pair),
                    ));
                    continue;
                }
                for trigger in pair.into_inner() {
                    match trigger.as_rule() {
                        Rule::name => triggers.push(spanned_text(&trigger)),
                        Rule::trigger_list => {
                            triggers.extend(trigger.into_inner().map(|p| spanned_text(&p)));
                        }
                        rule => unreachable!("unexpected trigger rule: {rule:?}"),
                    }
                }
            }
            Rule::job_decl => items.push(WorkflowItem::Job(lower_job(
                pair,
                JobKind::Plain,
                diagnostics,
            ))),
            Rule::agent_job_decl => items.push(WorkflowItem::Job(lower_job(
                pair,
                JobKind::Agent,
                diagnostics,
            ))),
            Rule::matrix_job_decl => items.push(WorkflowItem::Job(lower_job(
                pair,
                JobKind::Matrix,
                diagnostics,
            ))),
            Rule::cycle_decl => items.push(WorkflowItem::Cycle(lower_cycle(pair, diagnostics))),
            rule => unreachable!("unexpected workflow rule: {rule:?}"),
        }
    }

    WorkflowDecl {
        name,
        triggers,
        items,
        span,
    }
}

fn lower_job(decl: Pair<'_, Rule>, kind: JobKind, diagnostics: &mut Diagnostics) -> JobDecl {
    let span = span_of(&decl);
    let mut inner = decl.into_inner();
    let name = spanned_text(&inner.next().expect("job name"));

    let rest = inner.next().expect("job body or fragment call");
    match rest.as_rule() {
        Rule::job_body => JobDecl {
            name,
            kind,
            body: lower_job_body(rest, diagnostics),
            fragment: None,
            span,
        },
        Rule::fragment_call => {
            let call_span = span_of(&rest);
            let mut call = rest.into_inner();
            let fragment_name = spanned_text(&call.next().expect("fragment name"));
            let args = call
                .next()
                .map(|block| lower_obj_entries(block, diagnostics))
                .unwrap_or_default();

            JobDecl {
                name,
                kind,
                body: JobBody::default(),
                fragment: Some(FragmentCall {
                    name: fragment_name,
                    args,
                    span: call_span,
                }),
                span,
            }
        }
        rule => unreachable!("unexpected job rule: {rule:?}"),
    }
}

fn lower_job_body(body: Pair<'_, Rule>, diagnostics: &mut Diagnostics) -> JobBody {
    let mut out = JobBody::default();
    let mut matrix_span: Option<Span> = None;
    let mut include = vec![];
    let mut exclude = vec![];
    let mut axes = vec![];

    for field in body.into_inner() {
        let field_span = span_of(&field);
        match field.as_rule() {
            Rule::runs_on_field => {
                let value = scalar_text(field);
                set_once(&mut out.runs_on, value, "runs_on", field_span, diagnostics);
            }
            Rule::needs_field => {
                if !out.needs.is_empty() {
                    report_duplicate("needs", field_span, diagnostics);
                    continue;
                }
                out.needs = field.into_inner().map(|p| spanned_text(&p)).collect();
            }
            Rule::outputs_field => {
                if !out.outputs.is_empty() {
                    report_duplicate("outputs", field_span, diagnostics);
                    continue;
                }
                for output in field.into_inner() {
                    let mut inner = output.into_inner();
                    let name = spanned_text(&inner.next().expect("output name"));
                    let ty = lower_type_ref(inner.next().expect("output type"), diagnostics);
                    out.outputs.push(OutputDecl { name, ty });
                }
            }
            Rule::if_field => {
                let value = string_text(field.into_inner().next().expect("if expression"));
                set_once(&mut out.condition, value, "if", field_span, diagnostics);
            }
            Rule::environment_field => {
                let value = scalar_text(field);
                set_once(
                    &mut out.environment,
                    value,
                    "environment",
                    field_span,
                    diagnostics,
                );
            }
            Rule::axes_field => {
                if matrix_span.is_some() {
                    report_duplicate("axes", field_span, diagnostics);
                    continue;
                }
                matrix_span = Some(field_span);
                for axis in field.into_inner() {
                    let mut inner = axis.into_inner();
                    let name = spanned_text(&inner.next().expect("axis name"));
                    let list = inner.next().expect("axis values");
                    let list_span = span_of(&list);
                    let values = list.into_inner().map(lower_value).collect();
                    axes.push((name, Spanned::new(values, list_span)));
                }
            }
            Rule::include_field => {
                include = field
                    .into_inner()
                    .next()
                    .map(|list| list.into_inner().map(lower_value).collect())
                    .unwrap_or_default();
            }
            Rule::exclude_field => {
                exclude = field
                    .into_inner()
                    .next()
                    .map(|list| list.into_inner().map(lower_value).collect())
                    .unwrap_or_default();
            }
            Rule::steps_field => {
                if !out.steps.is_empty() {
                    report_duplicate("steps", field_span, diagnostics);
                    continue;
                }
                let block = field.into_inner().next().expect("steps block");
                out.steps = lower_steps_block(block, diagnostics);
            }
            rule => unreachable!("unexpected job field rule: {rule:?}"),
        }
    }

    if let Some(span) = matrix_span {
        out.matrix = Some(MatrixDecl {
            axes,
            include,
            exclude,
            span,
        });
    } else if !include.is_empty() || !exclude.is_empty() {
        diagnostics.push(Diagnostic::error(
            Code::AstBuild,
            "`include`/`exclude` require an `axes` field",
            Span::empty(),
        ));
    }

    out
}

fn lower_steps_block(block: Pair<'_, Rule>, diagnostics: &mut Diagnostics) -> Vec<Step> {
    block
        .into_inner()
        .map(|step| lower_step(step, diagnostics))
        .collect()
}

fn lower_step(step: Pair<'_, Rule>, diagnostics: &mut Diagnostics) -> Step {
    let span = span_of(&step);
    match step.as_rule() {
        Rule::uses_step => {
            let mut inner = step.into_inner();
            let action = scalar_pair_text(inner.next().expect("action reference"));
            let with = inner
                .next()
                .map(|block| lower_obj_entries(block, diagnostics))
                .unwrap_or_default();
            Step::Uses(UsesStep { action, with, span })
        }
        Rule::shell_step => {
            let script = string_text(step.into_inner().next().expect("shell script"));
            Step::Shell(ShellStep { script, span })
        }
        Rule::run_step => {
            let command = string_text(step.into_inner().next().expect("run command"));
            Step::Run(RunStep { command, span })
        }
        Rule::guard_step => {
            let mut inner = step.into_inner();
            let name = string_text(inner.next().expect("guard name"));
            let code = string_text(inner.next().expect("guard code"));
            Step::Guard(GuardStep { name, code, span })
        }
        Rule::agent_task_step => lower_agent_task(step, span, diagnostics),
        Rule::spread_step => {
            let mut inner = step.into_inner();
            let fragment = spanned_text(&inner.next().expect("fragment name"));
            let args = inner
                .next()
                .map(|block| lower_obj_entries(block, diagnostics))
                .unwrap_or_default();
            Step::Spread(SpreadStep {
                fragment,
                args,
                span,
            })
        }
        rule => unreachable!("unexpected step rule: {rule:?}"),
    }
}

fn lower_agent_task(step: Pair<'_, Rule>, span: Span, diagnostics: &mut Diagnostics) -> Step {
    let mut inner = step.into_inner();
    let prompt = string_text(inner.next().expect("agent prompt"));

    let mut task = AgentTaskStep {
        prompt,
        model: None,
        max_turns: None,
        tools: vec![],
        output_schema: None,
        output_artifact: None,
        span,
    };

    for field in inner {
        match field.as_rule() {
            Rule::agent_schema_field => {
                let ty = lower_type_ref(field.into_inner().next().expect("schema"), diagnostics);
                task.output_schema = Some(ty);
            }
            Rule::obj_entry => {
                let mut entry = field.into_inner();
                let key = spanned_text(&entry.next().expect("field name"));
                let value = lower_value(entry.next().expect("field value"));

                match key.value.as_str() {
                    "model" => task.model = expect_string(value, "model", diagnostics),
                    "max_turns" => {
                        task.max_turns = match value.kind {
                            ValueKind::Int(n) => Some(Spanned::new(n, value.span)),
                            _ => {
                                diagnostics.push(Diagnostic::error(
                                    Code::AstBuild,
                                    "`max_turns` must be an integer",
                                    value.span,
                                ));
                                None
                            }
                        }
                    }
                    "tools" => match value.kind {
                        ValueKind::List(values) => {
                            for value in values {
                                if let Some(tool) = expect_string(value, "tools", diagnostics) {
                                    task.tools.push(tool);
                                }
                            }
                        }
                        _ => diagnostics.push(Diagnostic::error(
                            Code::AstBuild,
                            "`tools` must be a list of strings",
                            value.span,
                        )),
                    },
                    "output_artifact" => {
                        task.output_artifact = expect_string(value, "output_artifact", diagnostics)
                    }
                    other => diagnostics.push(Diagnostic::error(
                        Code::AstBuild,
                        format!("unknown agent_task field `{other}`"),
                        key.span,
                    )),
                }
            }
            rule => unreachable!("unexpected agent field rule: {rule:?}"),
        }
    }

    Step::AgentTask(task)
}

fn lower_cycle(decl: Pair<'_, Rule>, diagnostics: &mut Diagnostics) -> CycleDecl {
    let span = span_of(&decl);
    let mut inner = decl.into_inner();
    let name = spanned_text(&inner.next().expect("cycle name"));

    let mut cycle = CycleDecl {
        name,
        max_iters: None,
        key: None,
        until: None,
        retry_policy: None,
        body: vec![],
        span,
    };

    for item in inner {
        let item_span = span_of(&item);
        match item.as_rule() {
            Rule::max_iters_field => {
                let number = item.into_inner().next().expect("max_iters value");
                let number_span = span_of(&number);
                match number.as_str().parse::<u32>() {
                    Ok(n) if n > 0 => cycle.max_iters = Some(Spanned::new(n, number_span)),
                    _ => diagnostics.push(Diagnostic::error(
                        Code::AstBuild,
                        "`max_iters` must be a positive integer",
                        number_span,
                    )),
                }
            }
            Rule::key_field => {
                let value = string_text(item.into_inner().next().expect("key value"));
                set_once(&mut cycle.key, value, "key", item_span, diagnostics);
            }
            Rule::until_field => {
                let code = string_text(item.into_inner().next().expect("guard code"));
                set_once(&mut cycle.until, code, "until", item_span, diagnostics);
            }
            Rule::retry_field => {
                let value = scalar_text(item);
                let policy = match value.value.as_str() {
                    "stop" => RetryPolicy::Stop,
                    "continue" => RetryPolicy::Continue,
                    other => {
                        diagnostics.push(
                            Diagnostic::error(
                                Code::CycleBadRetryPolicy,
                                format!("invalid retry_policy `{other}`"),
                                value.span,
                            )
                            .with_hint("expected `stop` or `continue`"),
                        );
                        RetryPolicy::Stop
                    }
                };
                cycle.retry_policy = Some(Spanned::new(policy, value.span));
            }
            Rule::cycle_body => {
                for body_item in item.into_inner() {
                    match body_item.as_rule() {
                        Rule::job_decl => cycle.body.push(CycleBodyItem::Job(lower_job(
                            body_item,
                            JobKind::Plain,
                            diagnostics,
                        ))),
                        Rule::agent_job_decl => cycle.body.push(CycleBodyItem::Job(lower_job(
                            body_item,
                            JobKind::Agent,
                            diagnostics,
                        ))),
                        Rule::matrix_job_decl => cycle.body.push(CycleBodyItem::Job(lower_job(
                            body_item,
                            JobKind::Matrix,
                            diagnostics,
                        ))),
                        Rule::cycle_decl => cycle
                            .body
                            .push(CycleBodyItem::Cycle(lower_cycle(body_item, diagnostics))),
                        rule => unreachable!("unexpected cycle body rule: {rule:?}"),
                    }
                }
            }
            rule => unreachable!("unexpected cycle item rule: {rule:?}"),
        }
    }

    cycle
}

fn lower_params<'i>(
    mut pairs: pest::iterators::Pairs<'i, Rule>,
    diagnostics: &mut Diagnostics,
) -> (Vec<ParamDecl>, Option<Pair<'i, Rule>>) {
    let next = pairs.next();
    let Some(pair) = next else {
        return (vec![], None);
    };

    if pair.as_rule() != Rule::params_block {
        return (vec![], Some(pair));
    }

    let mut params = vec![];
    for param in pair.into_inner() {
        let mut inner = param.into_inner();
        let name = spanned_text(&inner.next().expect("param name"));
        let ty_pair = inner.next().expect("param type");
        let ty = match ty_pair.clone().into_inner().next() {
            Some(p) if p.as_rule() == Rule::list_of_string => ParamType::StringList,
            _ => match ty_pair.as_str().trim() {
                "string" => ParamType::String,
                "int" => ParamType::Int,
                "bool" => ParamType::Bool,
                other => {
                    diagnostics.push(Diagnostic::error(
                        Code::AstBuild,
                        format!("unknown parameter type `{other}`"),
                        span_of(&ty_pair),
                    ));
                    ParamType::String
                }
            },
        };
        let default = inner.next().map(lower_value);
        params.push(ParamDecl { name, ty, default });
    }

    (params, pairs.next())
}

fn lower_type_ref(pair: Pair<'_, Rule>, diagnostics: &mut Diagnostics) -> TypeExpr {
    let span = span_of(&pair);
    let mut has_null = false;
    let mut literals: Vec<String> = vec![];
    let mut others: Vec<TypeExpr> = vec![];

    for atom in pair.into_inner() {
        let atom_span = span_of(&atom);
        match atom.as_rule() {
            Rule::null_ty => has_null = true,
            Rule::string => literals.push(string_text(atom).value),
            Rule::primitive => {
                let primitive = match atom.as_str() {
                    "string" => Primitive::String,
                    "int" => Primitive::Int,
                    "float" => Primitive::Float,
                    "bool" => Primitive::Bool,
                    "json" => Primitive::Json,
                    other => unreachable!("unexpected primitive: {other}"),
                };
                others.push(TypeExpr {
                    kind: TypeKind::Primitive(primitive),
                    span: atom_span,
                });
            }
            Rule::ident => others.push(TypeExpr {
                kind: TypeKind::Named(atom.as_str().into()),
                span: atom_span,
            }),
            Rule::list_type => {
                let element = lower_type_ref(atom.into_inner().next().expect("element"), diagnostics);
                others.push(TypeExpr {
                    kind: TypeKind::List(element.into()),
                    span: atom_span,
                });
            }
            Rule::object_type => {
                let fields = lower_object_fields(atom, diagnostics);
                others.push(TypeExpr {
                    kind: TypeKind::Object(fields),
                    span: atom_span,
                });
            }
            rule => unreachable!("unexpected type atom rule: {rule:?}"),
        }
    }

    let base = if !literals.is_empty() {
        if !others.is_empty() {
            diagnostics.push(Diagnostic::error(
                Code::AstBuild,
                "a union may mix string literals with `null` only",
                span,
            ));
        }
        TypeExpr {
            kind: TypeKind::LiteralUnion(literals),
            span,
        }
    } else if others.len() == 1 {
        others.remove(0)
    } else if others.is_empty() {
        // `null` on its own.
        diagnostics.push(Diagnostic::error(
            Code::AstBuild,
            "`null` must be part of a union",
            span,
        ));
        TypeExpr {
            kind: TypeKind::Primitive(Primitive::Json),
            span,
        }
    } else {
        diagnostics.push(Diagnostic::error(
            Code::AstBuild,
            "unions of non-literal types are not supported",
            span,
        ));
        others.remove(0)
    };

    if has_null {
        TypeExpr {
            kind: TypeKind::Nullable(base.into()),
            span,
        }
    } else {
        base
    }
}

fn lower_object_fields(pair: Pair<'_, Rule>, diagnostics: &mut Diagnostics) -> Vec<FieldDecl> {
    pair.into_inner()
        .map(|field| {
            let mut inner = field.into_inner();
            let name = spanned_text(&inner.next().expect("field name"));
            let ty = lower_type_ref(inner.next().expect("field type"), diagnostics);
            FieldDecl { name, ty }
        })
        .collect()
}

fn lower_obj_entries(
    block: Pair<'_, Rule>,
    _diagnostics: &mut Diagnostics,
) -> Vec<(Spanned<String>, Value)> {
    block
        .into_inner()
        .map(|entry| {
            let mut inner = entry.into_inner();
            let key = spanned_text(&inner.next().expect("entry key"));
            let value = lower_value(inner.next().expect("entry value"));
            (key, value)
        })
        .collect()
}

fn lower_value(pair: Pair<'_, Rule>) -> Value {
    let span = span_of(&pair);
    match pair.as_rule() {
        Rule::value => lower_value(pair.into_inner().next().expect("value body")),
        Rule::string | Rule::triple_string => {
            let text = string_text(pair);
            Value {
                kind: ValueKind::String(text.value),
                span,
            }
        }
        Rule::boolean => Value {
            kind: ValueKind::Bool(pair.as_str() == "true"),
            span,
        },
        Rule::number => {
            let raw = pair.as_str();
            let kind = match raw.parse::<i64>() {
                Ok(n) => ValueKind::Int(n),
                Err(_) => ValueKind::Float(raw.parse().unwrap_or(0.0)),
            };
            Value { kind, span }
        }
        Rule::value_list => Value {
            kind: ValueKind::List(pair.into_inner().map(lower_value).collect()),
            span,
        },
        Rule::value_obj => Value {
            kind: ValueKind::Object(
                pair.into_inner()
                    .map(|entry| {
                        let mut inner = entry.into_inner();
                        let key = spanned_text(&inner.next().expect("entry key"));
                        let value = lower_value(inner.next().expect("entry value"));
                        (key, value)
                    })
                    .collect(),
            ),
            span,
        },
        Rule::name => Value {
            kind: ValueKind::String(pair.as_str().into()),
            span,
        },
        rule => unreachable!("unexpected value rule: {rule:?}"),
    }
}

// Helpers

fn span_of(pair: &Pair<'_, Rule>) -> Span {
    let span = pair.as_span();
    Span::new(span.start(), span.end())
}

fn spanned_text(pair: &Pair<'_, Rule>) -> Spanned<String> {
    Spanned::new(pair.as_str().into(), span_of(pair))
}

/// The text of a `string` or `triple_string` pair, with escapes
/// resolved for the former. The span covers the quotes.
fn string_text(pair: Pair<'_, Rule>) -> Spanned<String> {
    let span = span_of(&pair);
    let value = match pair.as_rule() {
        Rule::string => {
            let raw = pair
                .into_inner()
                .next()
                .map(|p| p.as_str())
                .unwrap_or_default();
            unescape(raw)
        }
        Rule::triple_string => pair
            .into_inner()
            .next()
            .map(|p| p.as_str())
            .unwrap_or_default()
            .into(),
        rule => unreachable!("not a string rule: {rule:?}"),
    };
    Spanned::new(value, span)
}

/// The value of a field whose payload is a quoted string or bare name.
fn scalar_text(field: Pair<'_, Rule>) -> Spanned<String> {
    scalar_pair_text(field.into_inner().next().expect("scalar payload"))
}

fn scalar_pair_text(pair: Pair<'_, Rule>) -> Spanned<String> {
    match pair.as_rule() {
        Rule::string | Rule::triple_string => string_text(pair),
        _ => spanned_text(&pair),
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn expect_string(
    value: Value,
    field: &str,
    diagnostics: &mut Diagnostics,
) -> Option<Spanned<String>> {
    match value.kind {
        ValueKind::String(s) => Some(Spanned::new(s, value.span)),
        _ => {
            diagnostics.push(Diagnostic::error(
                Code::AstBuild,
                format!("`{field}` must be a string"),
                value.span,
            ));
            None
        }
    }
}

fn set_once<T>(
    slot: &mut Option<Spanned<T>>,
    value: Spanned<T>,
    field: &str,
    span: Span,
    diagnostics: &mut Diagnostics,
) {
    if slot.is_some() {
        report_duplicate(field, span, diagnostics);
    } else {
        *slot = Some(value);
    }
}

fn report_duplicate(field: &str, span: Span, diagnostics: &mut Diagnostics) {
    diagnostics.push(Diagnostic::error(
        Code::AstBuild,
        format!("duplicate `{field}` field"),
        span,
    ));
}
