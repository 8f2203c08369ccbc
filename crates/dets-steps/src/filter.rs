use std::cmp::Ordering;

use dets_domain::{NewRecord, PipelineError, PipelineResult, RecordRow};
use serde::Deserialize;
use serde_json::Value;

use crate::{nest, parse_parameters, Catalog, DataTransformation, StepRuntime, StepSummary, FILTER};

/// Declarative record predicate.
///
/// Paths start at `"data"` or `"meta"` and descend through object keys; a numeric
/// segment indexes into an array.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Exists {
        path: Vec<String>,
    },
    Compare {
        path: Vec<String>,
        op: CompareOp,
        value: Value,
    },
    In {
        path: Vec<String>,
        values: Vec<Value>,
    },
}

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Predicate {
    fn validate(&self) -> PipelineResult<()> {
        match self {
            Self::All(children) | Self::Any(children) => {
                children.iter().try_for_each(Self::validate)
            }
            Self::Not(child) => child.validate(),
            Self::Exists { path } | Self::Compare { path, .. } | Self::In { path, .. } => {
                match path.first().map(String::as_str) {
                    Some("data" | "meta") => Ok(()),
                    _ => Err(PipelineError::configuration(format!(
                        "predicate path must start with \"data\" or \"meta\", got {path:?}"
                    ))),
                }
            }
        }
    }

    #[must_use]
    pub fn matches(&self, record: &RecordRow) -> bool {
        match self {
            Self::All(children) => children.iter().all(|child| child.matches(record)),
            Self::Any(children) => children.iter().any(|child| child.matches(record)),
            Self::Not(child) => !child.matches(record),
            Self::Exists { path } => lookup(record, path).is_some_and(|value| !value.is_null()),
            Self::Compare { path, op, value } => {
                lookup(record, path).is_some_and(|found| compare(found, *op, value))
            }
            Self::In { path, values } => lookup(record, path)
                .is_some_and(|found| values.iter().any(|candidate| loosely_equal(found, candidate))),
        }
    }
}

fn lookup<'r>(record: &'r RecordRow, path: &[String]) -> Option<&'r Value> {
    let (root, rest) = path.split_first()?;
    let mut current = match root.as_str() {
        "data" => &record.data,
        "meta" => record.meta.as_ref()?,
        _ => return None,
    };
    for segment in rest {
        current = match current {
            Value::Object(fields) => fields.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn loosely_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(left), Some(right)) => left.total_cmp(&right) == Ordering::Equal,
        _ => lhs == rhs,
    }
}

fn order(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(left), Value::Number(right)) => left.as_f64()?.partial_cmp(&right.as_f64()?),
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

fn compare(found: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => loosely_equal(found, expected),
        CompareOp::Ne => !loosely_equal(found, expected),
        CompareOp::Gt => order(found, expected) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(
            order(found, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => order(found, expected) == Some(Ordering::Less),
        CompareOp::Le => matches!(
            order(found, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

/// Re-emits the upstream records that satisfy `predicate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    pub step_number: i64,
    pub predicate: Predicate,
    #[serde(default)]
    pub field_name: Option<String>,
}

pub(crate) fn build(parameters: &Value, _: &Catalog) -> PipelineResult<Box<dyn DataTransformation>> {
    let step: Filter = parse_parameters(FILTER, parameters)?;
    step.predicate.validate()?;
    Ok(Box::new(step))
}

impl DataTransformation for Filter {
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary> {
        let upstream = runtime.upstream(self.step_number)?;
        let records: Vec<NewRecord> = upstream
            .iter()
            .filter(|record| self.predicate.matches(record))
            .map(|record| {
                NewRecord::new(
                    nest(record.data.clone(), self.field_name.as_deref()),
                    record.meta.clone(),
                    record.common_id.clone(),
                )
            })
            .collect();
        let written = runtime.emit(&records)?;
        Ok(StepSummary::new(upstream.len(), written))
    }
}

#[cfg(test)]
mod tests {
    use super::Predicate;
    use crate::test_support::{must, Harness};
    use crate::FILTER;
    use dets_domain::{NewRecord, PipelineError};
    use serde_json::json;

    #[test]
    fn keeps_matching_records_and_nests_them() {
        let harness = Harness::new();
        harness.seed(
            1,
            &[
                NewRecord::new(json!({"age": 30, "state": "NY"}), Some(json!({"row": 0})), Some("a".into())),
                NewRecord::new(json!({"age": 17, "state": "NY"}), Some(json!({"row": 1})), Some("b".into())),
                NewRecord::new(json!({"age": 45, "state": "CA"}), Some(json!({"row": 2})), Some("c".into())),
            ],
        );
        let summary = must(harness.run(
            2,
            FILTER,
            &json!({
                "step_number": 1,
                "field_name": "adult",
                "predicate": {"all": [
                    {"compare": {"path": ["data", "age"], "op": "ge", "value": 18}},
                    {"in": {"path": ["data", "state"], "values": ["NY", "NJ"]}}
                ]}
            }),
            None,
        ));
        assert_eq!(summary.records_read, 3);
        assert_eq!(summary.records_written, 1);

        let rows = harness.output(2);
        assert_eq!(rows[0].data, json!({"adult": {"age": 30, "state": "NY"}}));
        assert_eq!(rows[0].meta, Some(json!({"row": 0})));
        assert_eq!(rows[0].common_id.as_deref(), Some("a"));
    }

    #[test]
    fn meta_paths_and_negation() {
        let harness = Harness::new();
        harness.seed(
            1,
            &[
                NewRecord::new(json!({"v": 1}), Some(json!({"flags": ["x"]})), None),
                NewRecord::new(json!({"v": 2}), None, None),
            ],
        );
        must(harness.run(
            2,
            FILTER,
            &json!({"step_number": 1,
                    "predicate": {"not": {"exists": {"path": ["meta", "flags", "0"]}}}}),
            None,
        ));
        let rows = harness.output(2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, json!({"v": 2}));
    }

    #[test]
    fn path_must_start_at_data_or_meta() {
        let harness = Harness::new();
        let result = harness.run(
            2,
            FILTER,
            &json!({"step_number": 1, "predicate": {"exists": {"path": ["age"]}}}),
            None,
        );
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn mismatched_types_never_order() {
        let predicate: Predicate = must(serde_json::from_value(json!(
            {"compare": {"path": ["data", "x"], "op": "gt", "value": 1}}
        )));
        let harness = Harness::new();
        harness.seed_values(1, &[(json!({"x": "9"}), None)]);
        let rows = harness.output(1);
        assert!(!predicate.matches(&rows[0]));
    }
}
