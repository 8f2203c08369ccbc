use std::fs;

use dets_domain::{value_as_key, NewRecord, PipelineError, PipelineResult};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    nest, parse_parameters, Catalog, DataTransformation, StepRuntime, StepSummary,
    MAP_DATA_WITH_DICT, TRANSFORM_INDICATOR_LIST_TO_DICT,
};

/// One-hot encodes a list payload: every element becomes a key mapped to 1.0.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformIndicatorListToDict {
    pub step_number: i64,
    #[serde(default)]
    pub source_field: Option<String>,
    #[serde(default)]
    pub field_name: Option<String>,
}

pub(crate) fn build_indicator(
    parameters: &Value,
    _: &Catalog,
) -> PipelineResult<Box<dyn DataTransformation>> {
    Ok(Box::new(parse_parameters::<TransformIndicatorListToDict>(
        TRANSFORM_INDICATOR_LIST_TO_DICT,
        parameters,
    )?))
}

fn as_elements(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

impl TransformIndicatorListToDict {
    fn indicators(&self, data: &Value) -> PipelineResult<Value> {
        let source = match &self.source_field {
            Some(field) => data.get(field).unwrap_or(&Value::Null),
            None => data,
        };
        let mut indicators = Map::new();
        for element in as_elements(source) {
            let key = value_as_key(element).ok_or_else(|| {
                PipelineError::upstream(format!("indicator element is not a scalar: {element}"))
            })?;
            indicators.insert(key, json!(1.0));
        }
        Ok(Value::Object(indicators))
    }
}

impl DataTransformation for TransformIndicatorListToDict {
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary> {
        let upstream = runtime.upstream(self.step_number)?;
        let mut records = Vec::with_capacity(upstream.len());
        for row in &upstream {
            let indicators = self.indicators(&row.data)?;
            records.push(NewRecord::new(
                nest(indicators, self.field_name.as_deref()),
                row.meta.clone(),
                row.common_id.clone(),
            ));
        }
        let written = runtime.emit(&records)?;
        Ok(StepSummary::new(upstream.len(), written))
    }
}

/// Looks up the values found at `path` in a mapping table.
///
/// Unmapped values are dropped. Records whose data does not contain the full path
/// produce no output.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapDataWithDict {
    pub step_number: i64,
    pub path: Vec<String>,
    #[serde(default)]
    pub mapping: Option<Map<String, Value>>,
    #[serde(default)]
    pub mapping_file: Option<String>,
    #[serde(default)]
    pub field_name: Option<String>,
}

pub(crate) fn build_map(
    parameters: &Value,
    _: &Catalog,
) -> PipelineResult<Box<dyn DataTransformation>> {
    let step: MapDataWithDict = parse_parameters(MAP_DATA_WITH_DICT, parameters)?;
    if step.path.is_empty() {
        return Err(PipelineError::configuration(
            "MapDataWithDict requires a non-empty path",
        ));
    }
    match (&step.mapping, &step.mapping_file) {
        (Some(_), None) | (None, Some(_)) => Ok(Box::new(step)),
        _ => Err(PipelineError::configuration(
            "MapDataWithDict requires exactly one of mapping or mapping_file",
        )),
    }
}

impl MapDataWithDict {
    fn load_mapping(&self, runtime: &StepRuntime<'_>) -> PipelineResult<Map<String, Value>> {
        if let Some(mapping) = &self.mapping {
            return Ok(mapping.clone());
        }
        let Some(file_name) = &self.mapping_file else {
            return Err(PipelineError::configuration(
                "MapDataWithDict has no mapping source",
            ));
        };
        let path = runtime.resolve_path(file_name);
        let content = fs::read_to_string(&path).map_err(|err| {
            PipelineError::io(format!("failed to read mapping file {}: {err}", path.display()))
        })?;
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(mapping)) => Ok(mapping),
            Ok(_) => Err(PipelineError::upstream(format!(
                "mapping file {} must contain a JSON object",
                path.display()
            ))),
            Err(err) => Err(PipelineError::upstream(format!(
                "malformed mapping file {}: {err}",
                path.display()
            ))),
        }
    }

    fn descend<'v>(&self, data: &'v Value) -> Option<&'v Value> {
        self.path
            .iter()
            .try_fold(data, |current, key| current.as_object()?.get(key))
    }
}

impl DataTransformation for MapDataWithDict {
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary> {
        let mapping = self.load_mapping(runtime)?;
        let upstream = runtime.upstream(self.step_number)?;
        let mut records = Vec::with_capacity(upstream.len());
        for row in &upstream {
            let Some(terminal) = self.descend(&row.data) else {
                tracing::debug!(record_id = %row.id, path = ?self.path, "path not found, record skipped");
                continue;
            };
            let mut mapped = Vec::new();
            let mut pairs = Vec::new();
            for element in as_elements(terminal) {
                let Some(target) = value_as_key(element).and_then(|key| mapping.get(&key)) else {
                    continue;
                };
                mapped.push(target.clone());
                pairs.push(json!([element, target]));
            }
            records.push(NewRecord::new(
                nest(Value::Array(mapped), self.field_name.as_deref()),
                Some(Value::Array(pairs)),
                row.common_id.clone(),
            ));
        }
        let written = runtime.emit(&records)?;
        tracing::debug!(
            rows = upstream.len(),
            written,
            "mapped records through lookup table"
        );
        Ok(StepSummary::new(upstream.len(), written))
    }
}
