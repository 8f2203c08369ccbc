use std::collections::BTreeMap;

use dets_domain::{NewRecord, PipelineError, PipelineResult, RecordRow};
use serde::Deserialize;
use serde_json::Value;

use crate::{nest, parse_parameters, Catalog, DataTransformation, StepRuntime, StepSummary, MERGE};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MergeInput {
    pub step_number: i64,
    #[serde(default)]
    pub field_name: Option<String>,
}

/// Left outer join on common id. The first input is the anchor; every anchor record
/// yields exactly one output record.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Merge {
    pub inputs: Vec<MergeInput>,
}

pub(crate) fn build(parameters: &Value, _: &Catalog) -> PipelineResult<Box<dyn DataTransformation>> {
    let step: Merge = parse_parameters(MERGE, parameters)?;
    if step.inputs.len() < 2 {
        return Err(PipelineError::configuration(
            "Merge requires at least two inputs",
        ));
    }
    Ok(Box::new(step))
}

struct Joined {
    data: Value,
    contributors: Vec<Value>,
    common_id: Option<String>,
}

fn shallow_union(target: &mut Value, addition: Value, step_number: i64) -> PipelineResult<()> {
    match (target, addition) {
        (Value::Object(fields), Value::Object(extra)) => {
            fields.extend(extra);
            Ok(())
        }
        _ => Err(PipelineError::upstream(format!(
            "cannot merge non-object data from step {step_number}; set a field_name"
        ))),
    }
}

impl DataTransformation for Merge {
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary> {
        let Some((anchor_input, secondary_inputs)) = self.inputs.split_first() else {
            return Err(PipelineError::configuration(
                "Merge requires at least two inputs",
            ));
        };
        let anchor = runtime.required_upstream(anchor_input.step_number)?;
        let mut records_read = anchor.len();
        let mut joined: Vec<Joined> = anchor
            .into_iter()
            .map(|row| Joined {
                data: nest(row.data, anchor_input.field_name.as_deref()),
                contributors: vec![Value::from(row.id.0)],
                common_id: row.common_id,
            })
            .collect();

        for input in secondary_inputs {
            let rows = runtime.upstream(input.step_number)?;
            records_read += rows.len();
            let mut first_by_id: BTreeMap<&str, &RecordRow> = BTreeMap::new();
            for row in &rows {
                if let Some(common_id) = row.common_id.as_deref() {
                    first_by_id.entry(common_id).or_insert(row);
                }
            }
            for target in &mut joined {
                let Some(matched) = target
                    .common_id
                    .as_deref()
                    .and_then(|common_id| first_by_id.get(common_id))
                else {
                    continue;
                };
                let addition = nest(matched.data.clone(), input.field_name.as_deref());
                shallow_union(&mut target.data, addition, input.step_number)?;
                target.contributors.push(Value::from(matched.id.0));
            }
        }

        let records: Vec<NewRecord> = joined
            .into_iter()
            .map(|row| NewRecord::new(row.data, Some(Value::Array(row.contributors)), row.common_id))
            .collect();
        let written = runtime.emit(&records)?;
        tracing::debug!(rows = written, inputs = self.inputs.len(), "merged records");
        Ok(StepSummary::new(records_read, written))
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{must, Harness};
    use crate::MERGE;
    use dets_domain::PipelineError;
    use serde_json::json;

    #[test]
    fn anchor_rows_all_survive_with_matches_unioned() {
        let harness = Harness::new();
        harness.seed_values(
            1,
            &[
                (json!({"id": "1", "name": "ada"}), Some("1")),
                (json!({"id": "2", "name": "bob"}), Some("2")),
                (json!({"id": "3", "name": "cy"}), Some("3")),
            ],
        );
        harness.seed_values(
            2,
            &[
                (json!({"balance": 10}), Some("2")),
                (json!({"balance": 99}), Some("2")),
                (json!({"balance": 5}), Some("9")),
            ],
        );
        harness.seed_values(3, &[(json!(["vip"]), Some("1"))]);

        let summary = must(harness.run(
            4,
            MERGE,
            &json!({"inputs": [
                {"step_number": 1},
                {"step_number": 2},
                {"step_number": 3, "field_name": "tags"}
            ]}),
            None,
        ));
        assert_eq!(summary.records_read, 7);
        assert_eq!(summary.records_written, 3);

        let anchor = harness.output(1);
        let balances = harness.output(2);
        let tags = harness.output(3);
        let rows = harness.output(4);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].data, json!({"id": "1", "name": "ada", "tags": ["vip"]}));
        assert_eq!(rows[0].meta, Some(json!([anchor[0].id.0, tags[0].id.0])));
        assert_eq!(rows[1].data, json!({"id": "2", "name": "bob", "balance": 10}));
        assert_eq!(rows[1].meta, Some(json!([anchor[1].id.0, balances[0].id.0])));
        assert_eq!(rows[2].data, json!({"id": "3", "name": "cy"}));
        assert_eq!(rows[2].meta, Some(json!([anchor[2].id.0])));
        assert_eq!(rows[2].common_id.as_deref(), Some("3"));
    }

    #[test]
    fn non_object_payload_without_field_name_fails() {
        let harness = Harness::new();
        harness.seed_values(1, &[(json!({"id": "1"}), Some("1"))]);
        harness.seed_values(2, &[(json!([1, 2]), Some("1"))]);
        let result = harness.run(
            3,
            MERGE,
            &json!({"inputs": [{"step_number": 1}, {"step_number": 2}]}),
            None,
        );
        assert!(matches!(result, Err(PipelineError::UpstreamData(_))));
    }

    #[test]
    fn empty_anchor_fails_the_step() {
        let harness = Harness::new();
        harness.seed_values(2, &[(json!({"balance": 10}), Some("1"))]);
        let result = harness.run(
            3,
            MERGE,
            &json!({"inputs": [{"step_number": 1}, {"step_number": 2, "field_name": "x"}]}),
            None,
        );
        assert!(matches!(result, Err(PipelineError::UpstreamData(_))));
        assert!(harness.output(3).is_empty());
    }

    #[test]
    fn empty_secondary_keeps_anchor_rows() {
        let harness = Harness::new();
        harness.seed_values(1, &[(json!({"id": "1"}), Some("1"))]);
        let summary = must(harness.run(
            3,
            MERGE,
            &json!({"inputs": [{"step_number": 1}, {"step_number": 2, "field_name": "x"}]}),
            None,
        ));
        assert_eq!(summary.records_written, 1);
        assert_eq!(harness.output(3)[0].data, json!({"id": "1"}));
    }

    #[test]
    fn single_input_is_configuration_error() {
        let harness = Harness::new();
        let result = harness.run(2, MERGE, &json!({"inputs": [{"step_number": 1}]}), None);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }
}
