//! Structured, span-tagged diagnostics with stable `WPxxxx` codes.

use serde::Serialize;

pub mod render;

/// A half-open byte range `[start, end)` into a single file's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// A zero-width span, used when no better position is known.
    pub fn empty() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(range: std::ops::Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Stable diagnostic codes, partitioned by subsystem:
/// `WP0xxx` parse/AST, `WP5xxx` types, `WP6xxx` cycles, `WP70xx`
/// structural, `WP71xx` imports, `WP72xx` matrix, `WP73xx` fragments,
/// `WP74xx` agent tasks, `WP9999` internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// Syntax error from the surface parser.
    Parse,
    /// Structurally invalid parse tree (duplicate fields, second workflow).
    AstBuild,
    /// Duplicate type declaration in one file.
    DuplicateType,
    /// Reference to an unknown type.
    UnknownType,
    /// Property access names a field the type does not have.
    UnknownProperty,
    /// Cycle specifies neither `max_iters` nor `until`.
    CycleMissingBound,
    /// User job name collides with a reserved cycle job name.
    CycleReservedName,
    /// Cycle body contains a nested cycle.
    CycleNested,
    /// Cycle body job `needs` something outside the cycle body.
    CycleBodyNeeds,
    /// Cycle has `until` but no `max_iters` safety limit.
    CycleNoMaxIters,
    /// Cycle `retry_policy` is neither `stop` nor `continue`.
    CycleBadRetryPolicy,
    /// Cycle declares no `key`; parallel cycles would collide.
    CycleMissingKey,
    /// Plain job missing a runner.
    MissingRunner,
    /// Agent job missing a runner.
    AgentMissingRunner,
    /// `needs` targets a job that does not exist.
    UnknownNeeds,
    /// Duplicate job name within one workflow.
    DuplicateJob,
    /// The import graph contains a cycle.
    CircularImport,
    /// Imported file does not exist.
    ImportNotFound,
    /// Imported name is not exported by the source file.
    ImportUnknownName,
    /// The same name is imported twice from the same path.
    DuplicateImport,
    /// An import collides with a local declaration or another import.
    ImportCollision,
    /// Import path is absolute or not `./`/`../`-relative.
    InvalidImportPath,
    /// Resolved import path lies outside the project root.
    ImportEscapesRoot,
    /// Matrix axis is empty.
    MatrixEmptyAxis,
    /// Matrix cartesian product exceeds the limit.
    MatrixTooLarge,
    /// Matrix `include`/`exclude` entries conflict.
    MatrixConflict,
    /// Fragment instantiation misses a required parameter.
    FragmentMissingParam,
    /// Fragment instantiation supplies an unrecognized parameter.
    FragmentUnknownParam,
    /// Fragment parameter value does not match the declared type.
    FragmentParamType,
    /// Reference to an unknown fragment.
    UnknownFragment,
    /// Agent task missing `model`.
    AgentMissingModel,
    /// Agent task missing `max_turns`.
    AgentMissingMaxTurns,
    /// Agent task output schema is malformed.
    AgentBadSchema,
    /// Internal compiler error.
    Internal,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Parse => "WP0001",
            Code::AstBuild => "WP0002",
            Code::DuplicateType => "WP5001",
            Code::UnknownType => "WP5002",
            Code::UnknownProperty => "WP5003",
            Code::CycleMissingBound => "WP6001",
            Code::CycleReservedName => "WP6002",
            Code::CycleNested => "WP6003",
            Code::CycleBodyNeeds => "WP6004",
            Code::CycleNoMaxIters => "WP6005",
            Code::CycleBadRetryPolicy => "WP6006",
            Code::CycleMissingKey => "WP6007",
            Code::MissingRunner => "WP7001",
            Code::AgentMissingRunner => "WP7002",
            Code::UnknownNeeds => "WP7003",
            Code::DuplicateJob => "WP7004",
            Code::CircularImport => "WP7101",
            Code::ImportNotFound => "WP7102",
            Code::ImportUnknownName => "WP7103",
            Code::DuplicateImport => "WP7104",
            Code::ImportCollision => "WP7105",
            Code::InvalidImportPath => "WP7106",
            Code::ImportEscapesRoot => "WP7107",
            Code::MatrixEmptyAxis => "WP7201",
            Code::MatrixTooLarge => "WP7202",
            Code::MatrixConflict => "WP7203",
            Code::FragmentMissingParam => "WP7301",
            Code::FragmentUnknownParam => "WP7302",
            Code::FragmentParamType => "WP7303",
            Code::UnknownFragment => "WP7304",
            Code::AgentMissingModel => "WP7401",
            Code::AgentMissingMaxTurns => "WP7402",
            Code::AgentBadSchema => "WP7403",
            Code::Internal => "WP9999",
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Code {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A single diagnostic: code, severity, message, span, optional hint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub code: Code,
    pub severity: Severity,
    pub message: String,
    pub span: Span,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn error(code: Code, message: impl Into<String>, span: Span) -> Self {
        Self {
            code,
            severity: Severity::Error,
            message: message.into(),
            span,
            hint: None,
        }
    }

    pub fn warning(code: Code, message: impl Into<String>, span: Span) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(code, message, span)
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// A diagnostic attributed to a file in a multi-file batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileDiagnostic {
    pub path: camino::Utf8PathBuf,
    #[serde(flatten)]
    pub diagnostic: Diagnostic,
}

impl FileDiagnostic {
    pub fn new(path: impl Into<camino::Utf8PathBuf>, diagnostic: Diagnostic) -> Self {
        Self {
            path: path.into(),
            diagnostic,
        }
    }
}

/// Accumulates diagnostics across compiler passes.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Diagnostic>) {
        self.items.extend(other);
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(Diagnostic::is_error)
    }

    pub fn items(&self) -> &[Diagnostic] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}
