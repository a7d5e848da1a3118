//! The `workpipe` batch CLI: compile `.workpipe` files to GitHub
//! Actions workflow YAML.

use std::io::IsTerminal as _;
use std::process::ExitCode;

use anstream::{eprintln, println};
use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use workpipe::diagnostic::{FileDiagnostic, Severity, render};
use workpipe::{CancelToken, CompileResult, FsResolver, ImportContext, compile_with_imports};

/// Compiles WorkPipe pipelines to GitHub Actions workflows.
#[derive(Parser)]
#[command(about, version)]
struct App {
    /// The `.workpipe` files to compile.
    #[arg(required = true)]
    inputs: Vec<Utf8PathBuf>,

    /// Write generated YAML into this directory instead of next to
    /// each input.
    #[arg(long)]
    out_dir: Option<Utf8PathBuf>,

    /// Print generated YAML to stdout instead of writing files.
    #[arg(long)]
    stdout: bool,

    /// The diagnostic output format.
    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,

    /// The project root imports may not escape. Defaults to the
    /// current directory.
    #[arg(long)]
    project_root: Option<Utf8PathBuf>,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Debug, Default, Copy, Clone, ValueEnum)]
enum OutputFormat {
    /// Terminal diagnostics with source excerpts.
    #[default]
    Plain,
    /// A JSON array of diagnostics with resolved positions.
    Json,
}

fn main() -> ExitCode {
    let app = App::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(app.verbose.tracing_level_filter().into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&app) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            eprintln!("{}: {err:#}", "fatal".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(app: &App) -> anyhow::Result<bool> {
    let cwd = Utf8PathBuf::from_path_buf(std::env::current_dir()?)
        .map_err(|p| anyhow::anyhow!("current directory is not UTF-8: {}", p.display()))?;

    let project_root = match &app.project_root {
        Some(root) => absolutize(root, &cwd),
        None => cwd.clone(),
    };

    let mut context = ImportContext::new(FsResolver, &project_root);
    let cancel = CancelToken::new();

    let mut errors = 0usize;
    let mut warnings = 0usize;

    for input in &app.inputs {
        let path = absolutize(input, &cwd);
        let source = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {path}"))?;

        let result = compile_with_imports(&source, &path, &mut context, &cancel);

        match app.format {
            OutputFormat::Plain => {
                report_plain(&result.diagnostics, &path, &source, &context);
            }
            OutputFormat::Json => report_json(&result.diagnostics, &path, &source, &context)?,
        }

        errors += count(&result, Severity::Error);
        warnings += count(&result, Severity::Warning);

        if let Some(yaml) = &result.yaml {
            emit_output(app, &path, yaml)?;
        }
    }

    if matches!(app.format, OutputFormat::Plain) && (errors > 0 || warnings > 0) {
        eprintln!(
            "{nerrors} error{es}, {nwarnings} warning{ws}",
            nerrors = errors.red(),
            es = if errors == 1 { "" } else { "s" },
            nwarnings = warnings.yellow(),
            ws = if warnings == 1 { "" } else { "s" },
        );
    }

    Ok(errors == 0)
}

fn count(result: &CompileResult, severity: Severity) -> usize {
    result
        .diagnostics
        .iter()
        .filter(|d| d.diagnostic.severity == severity)
        .count()
}

fn report_plain(
    diagnostics: &[FileDiagnostic],
    entry: &Utf8Path,
    entry_source: &str,
    context: &ImportContext,
) {
    let color = std::io::stderr().is_terminal();

    for fd in diagnostics {
        let source = if fd.path == entry {
            Some(entry_source.to_owned())
        } else {
            context
                .source(&fd.path)
                .map(str::to_owned)
                .or_else(|| std::fs::read_to_string(&fd.path).ok())
        };

        eprintln!(
            "{}",
            render::render(
                &fd.diagnostic,
                source.as_deref().unwrap_or(""),
                fd.path.as_str(),
                color,
            )
        );
    }
}

fn report_json(
    diagnostics: &[FileDiagnostic],
    entry: &Utf8Path,
    entry_source: &str,
    context: &ImportContext,
) -> anyhow::Result<()> {
    let mut merged = vec![];
    for fd in diagnostics {
        let source = if fd.path == entry {
            entry_source.to_owned()
        } else {
            context
                .source(&fd.path)
                .map(str::to_owned)
                .or_else(|| std::fs::read_to_string(&fd.path).ok())
                .unwrap_or_default()
        };

        let rendered = render::render_json(
            std::slice::from_ref(&fd.diagnostic),
            &source,
            fd.path.as_str(),
        );
        let mut entries: Vec<serde_json::Value> = serde_json::from_str(&rendered)?;
        merged.append(&mut entries);
    }

    println!("{}", serde_json::to_string_pretty(&merged)?);
    Ok(())
}

fn emit_output(app: &App, input: &Utf8Path, yaml: &str) -> anyhow::Result<()> {
    if app.stdout {
        println!("{yaml}");
        return Ok(());
    }

    let stem = input.file_stem().unwrap_or("workflow");
    let out_path = match &app.out_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {dir}"))?;
            dir.join(format!("{stem}.yml"))
        }
        None => input.with_file_name(format!("{stem}.yml")),
    };

    std::fs::write(&out_path, yaml).with_context(|| format!("cannot write {out_path}"))?;
    tracing::info!(path = %out_path, "wrote workflow");
    Ok(())
}

fn absolutize(path: &Utf8Path, cwd: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        workpipe::resolver::normalize_path(path)
    } else {
        workpipe::resolver::normalize_path(&cwd.join(path))
    }
}
