//! End-to-end compiler tests: source in, YAML (or diagnostics) out.

use camino::Utf8Path;
use pretty_assertions::assert_eq;

use workpipe::diagnostic::{Code, Severity};
use workpipe::{CancelToken, ImportContext, MemoryResolver, compile, compile_with_imports};

#[test]
fn minimal_workflow_emits_expected_yaml() {
    let result = compile(
        r#"workflow w { on: push  job j { runs_on: ubuntu-latest  steps: [ run("echo hi") ] } }"#,
    );
    assert!(result.success(), "{:?}", result.diagnostics);

    assert_eq!(
        result.yaml.as_deref(),
        Some(
            "name: w\n\
             on: push\n\
             jobs:\n\
            \u{20} j:\n\
            \u{20}   runs-on: ubuntu-latest\n\
            \u{20}   steps:\n\
            \u{20}     - run: echo hi\n"
        )
    );
}

#[test]
fn missing_runner_fails_at_the_job() {
    let source = r#"workflow w { on: push  job j { steps: [ run("echo hi") ] } }"#;
    let result = compile(source);

    assert!(!result.success());
    assert!(result.yaml.is_none());

    let diag = &result.diagnostics[0].diagnostic;
    assert_eq!(diag.code, Code::MissingRunner);
    assert!(diag.hint.as_deref().unwrap().contains("runner"));

    // The span points at the offending job, inside the source.
    let job_offset = source.find("job j").unwrap();
    assert!(diag.span.start >= job_offset);
    assert!(diag.span.end <= source.len());
}

#[test]
fn unknown_property_names_field_and_lists_present() {
    let result = compile(
        r#"
        type T { x: string }
        workflow w {
          on: push
          job a { runs_on: X  outputs: { o: T }  steps: [ run("") ] }
          job b { runs_on: X  needs: [a]  steps: [ run("${{ fromJSON(needs.a.outputs.o).y }}") ] }
        }
        "#,
    );

    assert!(!result.success());
    let diag = &result.diagnostics[0].diagnostic;
    assert_eq!(diag.code, Code::UnknownProperty);
    assert!(diag.message.contains("`y`"));
    assert!(diag.hint.as_deref().unwrap().contains("x"));
}

#[test]
fn imported_type_compiles_across_files() {
    let mut resolver = MemoryResolver::new();
    resolver.add_file("/p/lib.workpipe", "type U { v: int }");
    let mut context = ImportContext::new(resolver, "/p");

    let result = compile_with_imports(
        r#"
        import { U } from "./lib.workpipe"
        workflow w {
          on: push
          job a { runs_on: X  outputs: { o: U }  steps: [ run("") ] }
        }
        "#,
        Utf8Path::new("/p/main.workpipe"),
        &mut context,
        &CancelToken::new(),
    );

    assert!(result.success(), "{:?}", result.diagnostics);
    assert!(result.yaml.is_some());
}

#[test]
fn circular_imports_fail_with_ring() {
    let mut resolver = MemoryResolver::new();
    resolver.add_file(
        "/p/a.workpipe",
        r#"import { B } from "./b.workpipe"  type A { v: int }"#,
    );
    resolver.add_file(
        "/p/b.workpipe",
        r#"import { A } from "./a.workpipe"  type B { v: int }"#,
    );
    let mut context = ImportContext::new(resolver, "/p");

    let result = compile_with_imports(
        r#"import { A } from "./a.workpipe""#,
        Utf8Path::new("/p/main.workpipe"),
        &mut context,
        &CancelToken::new(),
    );

    assert!(!result.success());
    assert!(result.yaml.is_none());

    let cycle = result
        .diagnostics
        .iter()
        .find(|d| d.diagnostic.code == Code::CircularImport)
        .expect("cycle diagnostic");
    assert!(cycle.diagnostic.message.contains("a.workpipe"));
    assert!(cycle.diagnostic.message.contains("b.workpipe"));
    assert!(cycle.diagnostic.message.contains("→"));
}

#[test]
fn cycle_lowers_to_the_four_part_skeleton() {
    let result = compile(
        r#"
        workflow w {
          on: push
          cycle refine {
            max_iters = 3
            key = "r"
            until guard_js """return state.done"""
            body {
              job inner { runs_on: X  steps: [ run("") ] }
            }
          }
        }
        "#,
    );
    assert!(result.success(), "{:?}", result.diagnostics);

    let yaml = result.yaml.expect("yaml");
    let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("parses");
    assert_eq!(parsed["jobs"].as_mapping().expect("jobs mapping").len(), 4);

    for name in ["refine_hydrate", "inner", "refine_decide", "refine_dispatch"] {
        assert!(!parsed["jobs"][name].is_null(), "missing job {name}");
    }

    // inner depends on hydrate; decide on inner; dispatch on decide.
    assert_eq!(parsed["jobs"]["inner"]["needs"][0], "refine_hydrate");
    let decide_needs: Vec<&str> = parsed["jobs"]["refine_decide"]["needs"]
        .as_sequence()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(decide_needs.contains(&"inner"));
    assert!(decide_needs.contains(&"refine_hydrate"));
    assert_eq!(parsed["jobs"]["refine_dispatch"]["needs"][0], "refine_decide");

    // Dispatch only continues an unfinished cycle, with write
    // credentials scoped to it alone.
    let dispatch_if = parsed["jobs"]["refine_dispatch"]["if"].as_str().unwrap();
    assert!(dispatch_if.contains("needs.refine_decide.outputs.done == 'false'"));
    assert_eq!(parsed["jobs"]["refine_dispatch"]["permissions"]["actions"], "write");
    assert!(parsed["jobs"]["refine_hydrate"]["permissions"].is_null());

    // State artifacts are keyed and iteration-indexed.
    assert!(yaml.contains("w-r-"));
    assert!(yaml.contains("iteration"));

    // The guard body rides inside the decide script.
    let decide_yaml = serde_yaml::to_string(&parsed["jobs"]["refine_decide"]).unwrap();
    assert!(decide_yaml.contains("return state.done"));
}

#[test]
fn fragment_instantiations_differ_only_in_substituted_scalars() {
    let result = compile(
        r#"
        job_fragment deploy params(env: string) {
          runs_on: ubuntu-latest
          steps: [ run("deploy to ${{ params.env }}") ]
        }
        workflow w {
          on: push
          job staging = deploy { env: "staging" }
          job production = deploy { env: "production" }
        }
        "#,
    );
    assert!(result.success(), "{:?}", result.diagnostics);

    let yaml = result.yaml.expect("yaml");
    let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

    let staging = serde_yaml::to_string(&parsed["jobs"]["staging"]).unwrap();
    let production = serde_yaml::to_string(&parsed["jobs"]["production"]).unwrap();
    assert_eq!(staging.replace("staging", "X"), production.replace("production", "X"));
    assert!(staging.contains("deploy to staging"));
    assert!(production.contains("deploy to production"));
}

#[test]
fn compilation_is_deterministic_and_reparse_stable() {
    let source = r#"
        workflow w {
          on: [push, pull_request]
          job a {
            runs_on: ubuntu-latest
            outputs: { log: string }
            steps: [
              uses(actions/checkout@v4) { fetch-depth: 0 },
              shell { """
set -eu
make build
make test
""" }
            ]
          }
          job b { runs_on: ubuntu-latest  needs: [a]  steps: [ run("echo ${{ needs.a.outputs.log }}") ] }
        }
    "#;

    let first = compile(source);
    let second = compile(source);
    assert!(first.success(), "{:?}", first.diagnostics);
    assert_eq!(first.yaml, second.yaml);

    // Re-parsing the emitted document twice yields the same value
    // tree: nothing in the output depends on emission order quirks.
    let yaml = first.yaml.expect("yaml");
    let a: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
    let b: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(a, b);

    // The shell block survives with its internal line breaks intact.
    assert_eq!(
        a["jobs"]["a"]["steps"][1]["run"].as_str().unwrap(),
        "\nset -eu\nmake build\nmake test\n"
    );
}

#[test]
fn imports_are_not_transitive() {
    let mut resolver = MemoryResolver::new();
    resolver.add_file("/p/a.workpipe", "type T { v: int }");
    resolver.add_file("/p/b.workpipe", r#"import { T } from "./a.workpipe""#);
    let mut context = ImportContext::new(resolver, "/p");

    let result = compile_with_imports(
        r#"
        import { T } from "./b.workpipe"
        workflow w {
          on: push
          job j { runs_on: X  outputs: { o: T }  steps: [ run("") ] }
        }
        "#,
        Utf8Path::new("/p/c.workpipe"),
        &mut context,
        &CancelToken::new(),
    );

    assert!(!result.success());
    assert!(
        result
            .diagnostics
            .iter()
            .any(|d| d.diagnostic.code == Code::ImportUnknownName)
    );
}

#[test]
fn reserved_cycle_names_are_enforced() {
    let result = compile(
        r#"
        workflow w {
          on: push
          job refine_decide { runs_on: X  steps: [ run("") ] }
          cycle refine {
            max_iters = 2
            key = "k"
            body { job step1 { runs_on: X  steps: [ run("") ] } }
          }
        }
        "#,
    );

    assert!(!result.success());
    assert_eq!(
        result.diagnostics[0].diagnostic.code,
        Code::CycleReservedName
    );
}

#[test]
fn diagnostics_stay_within_source_bounds() {
    let sources = [
        "workflow",
        "workflow w {",
        r#"workflow w { on: push  job j { runs_on: X  steps: [ run("${{ needs.a.outputs.x }}") ] } }"#,
        "type T { x: Missing }",
        "",
    ];

    for source in sources {
        let result = compile(source);
        for fd in &result.diagnostics {
            let span = fd.diagnostic.span;
            assert!(span.start <= span.end, "span inverted for {source:?}");
            assert!(
                span.end <= source.len(),
                "span out of bounds for {source:?}: {span:?}"
            );
        }
    }
}

#[test]
fn warnings_surface_but_do_not_fail() {
    let result = compile(
        r#"
        workflow w {
          on: push
          cycle c {
            key = "k"
            until guard_js "return state.ok"
            body { job b { runs_on: X  steps: [ run("") ] } }
          }
        }
        "#,
    );

    assert!(result.success());
    let warning = result
        .diagnostics
        .iter()
        .find(|d| d.diagnostic.code == Code::CycleNoMaxIters)
        .expect("warning");
    assert_eq!(warning.diagnostic.severity, Severity::Warning);
}
