use dets_domain::{NewRecord, PipelineResult};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    parse_parameters, Catalog, DataTransformation, StepRuntime, StepSummary, SWAP_META_TO_DATA,
    TRANSFORM_DATA_WITH_FUNCTION,
};

/// What a transformation function returns for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionOutput {
    pub data: Value,
    pub meta: Option<Value>,
}

pub type TransformFunction = fn(&Value) -> PipelineResult<FunctionOutput>;

#[allow(clippy::unnecessary_wraps)]
pub(crate) fn identity(data: &Value) -> PipelineResult<FunctionOutput> {
    Ok(FunctionOutput {
        data: data.clone(),
        meta: None,
    })
}

/// Promotes each upstream record's meta to data.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwapMetaToData {
    pub step_number: i64,
}

pub(crate) fn build_swap(
    parameters: &Value,
    _: &Catalog,
) -> PipelineResult<Box<dyn DataTransformation>> {
    Ok(Box::new(parse_parameters::<SwapMetaToData>(
        SWAP_META_TO_DATA,
        parameters,
    )?))
}

impl DataTransformation for SwapMetaToData {
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary> {
        let upstream = runtime.upstream(self.step_number)?;
        let records: Vec<NewRecord> = upstream
            .iter()
            .map(|row| {
                NewRecord::new(
                    row.meta.clone().unwrap_or(Value::Null),
                    None,
                    row.common_id.clone(),
                )
            })
            .collect();
        let written = runtime.emit(&records)?;
        Ok(StepSummary::new(upstream.len(), written))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransformParameters {
    step_number: i64,
    function_name: String,
}

/// Applies a registered function to every upstream record, one output per input.
#[derive(Clone)]
pub struct TransformDataWithFunction {
    pub step_number: i64,
    pub function_name: String,
    function: TransformFunction,
}

impl std::fmt::Debug for TransformDataWithFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformDataWithFunction")
            .field("step_number", &self.step_number)
            .field("function_name", &self.function_name)
            .finish_non_exhaustive()
    }
}

pub(crate) fn build_transform(
    parameters: &Value,
    catalog: &Catalog,
) -> PipelineResult<Box<dyn DataTransformation>> {
    let TransformParameters {
        step_number,
        function_name,
    } = parse_parameters(TRANSFORM_DATA_WITH_FUNCTION, parameters)?;
    let function = catalog.function(&function_name)?;
    Ok(Box::new(TransformDataWithFunction {
        step_number,
        function_name,
        function,
    }))
}

impl DataTransformation for TransformDataWithFunction {
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary> {
        let upstream = runtime.upstream(self.step_number)?;
        let mut records = Vec::with_capacity(upstream.len());
        for row in &upstream {
            let output = (self.function)(&row.data)?;
            records.push(NewRecord::new(
                output.data,
                output.meta,
                row.common_id.clone(),
            ));
        }
        let written = runtime.emit(&records)?;
        tracing::debug!(function = %self.function_name, rows = written, "applied function");
        Ok(StepSummary::new(upstream.len(), written))
    }
}

#[cfg(test)]
mod tests {
    use super::FunctionOutput;
    use crate::test_support::{must, Harness};
    use crate::{
        Catalog, LocalExtensions, TransformFunction, IDENTITY, SWAP_META_TO_DATA,
        TRANSFORM_DATA_WITH_FUNCTION,
    };
    use dets_domain::{NewRecord, PipelineError, PipelineResult};
    use serde_json::{json, Value};

    fn lower_case(data: &Value) -> PipelineResult<FunctionOutput> {
        let mut data = data.clone();
        let mut touched = 0;
        if let Value::Object(fields) = &mut data {
            for value in fields.values_mut() {
                let Value::Array(items) = value else { continue };
                for item in items {
                    if let Some(Value::String(code)) = item.get_mut("code") {
                        *code = code.to_lowercase();
                        touched += 1;
                    }
                }
            }
        }
        Ok(FunctionOutput {
            data,
            meta: Some(json!({"lowered": touched})),
        })
    }

    fn reject(_: &Value) -> PipelineResult<FunctionOutput> {
        Err(PipelineError::upstream("unusable record"))
    }

    fn catalog() -> Catalog {
        Catalog::with_local_extensions(LocalExtensions {
            functions: vec![
                ("lower_case".to_string(), lower_case as TransformFunction),
                ("reject".to_string(), reject as TransformFunction),
            ],
            ..LocalExtensions::default()
        })
    }

    #[test]
    fn meta_becomes_data() {
        let harness = Harness::new();
        harness.seed(
            1,
            &[
                NewRecord::new(json!({"v": 1}), Some(json!({"source": "a"})), Some("x".into())),
                NewRecord::new(json!({"v": 2}), None, None),
            ],
        );
        must(harness.run(2, SWAP_META_TO_DATA, &json!({"step_number": 1}), None));
        let rows = harness.output(2);
        assert_eq!(rows[0].data, json!({"source": "a"}));
        assert_eq!(rows[0].meta, None);
        assert_eq!(rows[0].common_id.as_deref(), Some("x"));
        assert_eq!(rows[1].data, Value::Null);
    }

    #[test]
    fn identity_preserves_data_and_common_id() {
        let harness = Harness::new();
        harness.seed_values(1, &[(json!({"k": [1, 2]}), Some("c1"))]);
        must(harness.run(
            2,
            TRANSFORM_DATA_WITH_FUNCTION,
            &json!({"step_number": 1, "function_name": IDENTITY}),
            None,
        ));
        let rows = harness.output(2);
        assert_eq!(rows[0].data, json!({"k": [1, 2]}));
        assert_eq!(rows[0].common_id.as_deref(), Some("c1"));
    }

    #[test]
    fn local_function_rewrites_codes() {
        let harness = Harness::new();
        harness.seed_values(
            1,
            &[(json!({"dx": [{"code": "E11"}, {"code": "I10"}]}), Some("p"))],
        );
        must(harness.run_with(
            &catalog(),
            2,
            TRANSFORM_DATA_WITH_FUNCTION,
            &json!({"step_number": 1, "function_name": "lower_case"}),
            None,
        ));
        let rows = harness.output(2);
        assert_eq!(rows[0].data, json!({"dx": [{"code": "e11"}, {"code": "i10"}]}));
        assert_eq!(rows[0].meta, Some(json!({"lowered": 2})));
    }

    #[test]
    fn function_errors_propagate() {
        let harness = Harness::new();
        harness.seed_values(1, &[(json!({}), None)]);
        let result = harness.run_with(
            &catalog(),
            2,
            TRANSFORM_DATA_WITH_FUNCTION,
            &json!({"step_number": 1, "function_name": "reject"}),
            None,
        );
        assert!(matches!(result, Err(PipelineError::UpstreamData(_))));
    }

    #[test]
    fn unknown_function_fails_at_instantiation() {
        let result = Catalog::with_builtins().instantiate(
            TRANSFORM_DATA_WITH_FUNCTION,
            &json!({"step_number": 1, "function_name": "nope"}),
        );
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }
}
