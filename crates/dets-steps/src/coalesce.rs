use std::collections::BTreeMap;

use dets_domain::{NewRecord, PipelineResult, RecordId, RecordRow};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    nest, parse_parameters, Catalog, DataTransformation, StepRuntime, StepSummary, COALESCE,
};

/// Groups upstream records by common id; one output record per distinct id.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Coalesce {
    pub step_number: i64,
    #[serde(default)]
    pub field_name: Option<String>,
}

pub(crate) fn build(parameters: &Value, _: &Catalog) -> PipelineResult<Box<dyn DataTransformation>> {
    Ok(Box::new(parse_parameters::<Coalesce>(COALESCE, parameters)?))
}

/// Group rows by common id.
///
/// Groups are ordered by their lowest record id and each group's data and meta lists
/// follow record id order, so the result does not depend on the order of `rows`.
#[must_use]
pub fn coalesce_records(rows: &[RecordRow], field_name: Option<&str>) -> Vec<NewRecord> {
    let mut groups: BTreeMap<Option<&str>, Vec<&RecordRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.common_id.as_deref()).or_default().push(row);
    }

    let mut ordered: Vec<(RecordId, Option<&str>, Vec<&RecordRow>)> = groups
        .into_iter()
        .map(|(common_id, mut members)| {
            members.sort_by_key(|row| row.id);
            let first = members.first().map_or(RecordId(i64::MAX), |row| row.id);
            (first, common_id, members)
        })
        .collect();
    ordered.sort_by_key(|(first, _, _)| *first);

    ordered
        .into_iter()
        .map(|(_, common_id, members)| {
            let data = Value::Array(members.iter().map(|row| row.data.clone()).collect());
            let meta = Value::Array(
                members
                    .iter()
                    .map(|row| row.meta.clone().unwrap_or(Value::Null))
                    .collect(),
            );
            NewRecord::new(nest(data, field_name), Some(meta), common_id.map(str::to_string))
        })
        .collect()
}

impl DataTransformation for Coalesce {
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary> {
        let upstream = runtime.required_upstream(self.step_number)?;
        let records = coalesce_records(&upstream, self.field_name.as_deref());
        let written = runtime.emit(&records)?;
        tracing::debug!(groups = written, rows = upstream.len(), "coalesced records");
        Ok(StepSummary::new(upstream.len(), written))
    }
}
