#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use dets_domain::{ensure_non_empty, hash_bytes, hash_json, PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of a pipeline definition file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepDeclaration {
    pub step_number: i64,
    pub name: String,
    pub data_transformation_class: String,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn empty_parameters() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionFormat {
    Json,
    Yaml,
}

impl DefinitionFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

/// A validated, ordered definition plus the hashes used to detect changed reloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineDefinitionEnvelope {
    pub source_format: DefinitionFormat,
    pub source_hash: String,
    pub definition_hash: String,
    pub steps: Vec<StepDeclaration>,
}

impl PipelineDefinitionEnvelope {
    #[must_use]
    pub fn class_names(&self) -> BTreeSet<&str> {
        self.steps
            .iter()
            .map(|step| step.data_transformation_class.as_str())
            .collect()
    }
}

/// Read a definition file, picking the parser from the extension (`.json`, `.yaml`, `.yml`).
///
/// # Errors
/// Returns `Io` when the file cannot be read and `Configuration` when it cannot be
/// parsed or fails validation.
pub fn load_definition_from_path(path: &Path) -> PipelineResult<PipelineDefinitionEnvelope> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    let format = match extension.as_deref() {
        Some("json") => DefinitionFormat::Json,
        Some("yaml" | "yml") => DefinitionFormat::Yaml,
        other => {
            return Err(PipelineError::configuration(format!(
                "unsupported pipeline definition file type {other:?} for {}",
                path.display()
            )))
        }
    };
    let content = fs::read_to_string(path).map_err(|err| {
        PipelineError::io(format!(
            "failed to read pipeline definition {}: {err}",
            path.display()
        ))
    })?;
    match format {
        DefinitionFormat::Json => parse_definition_json(&content),
        DefinitionFormat::Yaml => parse_definition_yaml(&content),
    }
}

/// # Errors
/// Returns `Configuration` when the JSON is malformed or fails validation.
pub fn parse_definition_json(json: &str) -> PipelineResult<PipelineDefinitionEnvelope> {
    let steps: Vec<StepDeclaration> = serde_json::from_str(json).map_err(|err| {
        PipelineError::configuration(format!("invalid pipeline definition JSON: {err}"))
    })?;
    normalize_definition(DefinitionFormat::Json, hash_bytes(json.as_bytes()), steps)
}

/// # Errors
/// Returns `Configuration` when the YAML is malformed or fails validation.
pub fn parse_definition_yaml(yaml: &str) -> PipelineResult<PipelineDefinitionEnvelope> {
    let steps: Vec<StepDeclaration> = serde_yaml::from_str(yaml).map_err(|err| {
        PipelineError::configuration(format!("invalid pipeline definition YAML: {err}"))
    })?;
    normalize_definition(DefinitionFormat::Yaml, hash_bytes(yaml.as_bytes()), steps)
}

/// Validate, order by `(step_number, name)` and hash an already-parsed step list.
///
/// # Errors
/// Returns `Configuration` when a declaration is invalid.
pub fn normalize_definition(
    source_format: DefinitionFormat,
    source_hash: String,
    mut steps: Vec<StepDeclaration>,
) -> PipelineResult<PipelineDefinitionEnvelope> {
    validate_steps(&steps)?;
    for step in &mut steps {
        step.name = step.name.trim().to_string();
        step.data_transformation_class = step.data_transformation_class.trim().to_string();
    }
    steps.sort_by(|lhs, rhs| {
        lhs.step_number
            .cmp(&rhs.step_number)
            .then_with(|| lhs.name.cmp(&rhs.name))
    });
    validate_steps(&steps)?;

    let canonical = serde_json::to_value(&steps)
        .map_err(|err| PipelineError::configuration(format!("unserializable definition: {err}")))?;
    let definition_hash = hash_json(&canonical)
        .map_err(|err| PipelineError::configuration(format!("failed to hash definition: {err}")))?;

    Ok(PipelineDefinitionEnvelope {
        source_format,
        source_hash,
        definition_hash,
        steps,
    })
}

fn validate_steps(steps: &[StepDeclaration]) -> PipelineResult<()> {
    if steps.is_empty() {
        return Err(PipelineError::configuration(
            "pipeline definition declares no steps",
        ));
    }
    let mut keys = BTreeSet::new();
    for step in steps {
        ensure_non_empty("name", &step.name)?;
        ensure_non_empty("data_transformation_class", &step.data_transformation_class)?;
        if step.step_number < 0 {
            return Err(PipelineError::configuration(format!(
                "step {} has negative step_number {}",
                step.name, step.step_number
            )));
        }
        if !step.parameters.is_object() {
            return Err(PipelineError::configuration(format!(
                "parameters of step {} must be a mapping",
                step.name
            )));
        }
        if !keys.insert((step.step_number, step.name.trim().to_string())) {
            return Err(PipelineError::configuration(format!(
                "duplicate step declaration ({}, {})",
                step.step_number, step.name
            )));
        }
    }
    Ok(())
}
