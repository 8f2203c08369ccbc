use dets_domain::{NewRecord, PipelineResult};
use dets_models::{annotate_meta, PredictiveModel};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{parse_parameters, Catalog, DataTransformation, StepRuntime, StepSummary, SCORE};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScoreParameters {
    step_number: i64,
    model_name: String,
    #[serde(default)]
    model_parameters: Value,
}

/// Scores each upstream record with a registered predictive model.
///
/// Output data is `{"score": result}`; the model's explanation lands in meta tagged
/// with the model name.
pub struct Score {
    pub step_number: i64,
    pub model_name: String,
    model: Box<dyn PredictiveModel>,
}

impl std::fmt::Debug for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Score")
            .field("step_number", &self.step_number)
            .field("model_name", &self.model_name)
            .finish_non_exhaustive()
    }
}

pub(crate) fn build(parameters: &Value, catalog: &Catalog) -> PipelineResult<Box<dyn DataTransformation>> {
    let ScoreParameters {
        step_number,
        model_name,
        model_parameters,
    } = parse_parameters(SCORE, parameters)?;
    let model = catalog.models().instantiate(&model_name, &model_parameters)?;
    Ok(Box::new(Score {
        step_number,
        model_name,
        model,
    }))
}

impl DataTransformation for Score {
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary> {
        let upstream = runtime.required_upstream(self.step_number)?;
        let mut records = Vec::with_capacity(upstream.len());
        for row in &upstream {
            let scored = self.model.score(&row.data)?;
            records.push(NewRecord::new(
                json!({"score": scored.result}),
                Some(annotate_meta(&self.model_name, scored.meta)),
                row.common_id.clone(),
            ));
        }
        let written = runtime.emit(&records)?;
        tracing::debug!(model = %self.model_name, rows = written, "scored records");
        Ok(StepSummary::new(upstream.len(), written))
    }
}
