//! The canonical intermediate representation the emitter serializes.
//!
//! Shapes mirror the generated YAML: a workflow is a name, triggers,
//! optional permissions, and an ordered job map. All maps are
//! insertion-ordered so emission is deterministic.

use indexmap::IndexMap;

use crate::parser::ast::{Value, ValueKind};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowIr {
    pub name: String,
    pub on: TriggerIr,
    pub permissions: IndexMap<String, String>,
    pub jobs: IndexMap<String, JobIr>,
}

/// Workflow triggers. Cycles add a `workflow_dispatch` trigger with
/// the self-dispatch inputs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TriggerIr {
    pub events: Vec<String>,
    pub dispatch_inputs: IndexMap<String, DispatchInputIr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchInputIr {
    pub description: String,
    pub default: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobIr {
    pub name: Option<String>,
    pub runs_on: String,
    pub needs: Vec<String>,
    pub condition: Option<String>,
    pub environment: Option<String>,
    pub permissions: IndexMap<String, String>,
    pub strategy: Option<StrategyIr>,
    pub outputs: IndexMap<String, String>,
    pub steps: Vec<StepIr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyIr {
    pub matrix: MatrixIr,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatrixIr {
    pub axes: IndexMap<String, Vec<Scalar>>,
    pub include: Vec<IndexMap<String, Scalar>>,
    pub exclude: Vec<IndexMap<String, Scalar>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepIr {
    pub name: Option<String>,
    pub id: Option<String>,
    pub condition: Option<String>,
    pub uses: Option<String>,
    pub with: IndexMap<String, Scalar>,
    pub run: Option<String>,
    pub env: IndexMap<String, String>,
    pub continue_on_error: bool,
}

/// A YAML scalar leaf. Booleans and integers emit unquoted; strings
/// go through the quoting rules.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&Value> for Scalar {
    fn from(value: &Value) -> Self {
        match &value.kind {
            ValueKind::String(s) => Scalar::Str(s.clone()),
            ValueKind::Int(n) => Scalar::Int(*n),
            ValueKind::Float(f) => Scalar::Float(*f),
            ValueKind::Bool(b) => Scalar::Bool(*b),
            // Nested collections do not occur in scalar positions;
            // the reader accepts them only where the lowerer consumes
            // them structurally.
            ValueKind::List(_) | ValueKind::Object(_) => Scalar::Str(String::new()),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}
