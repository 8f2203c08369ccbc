#![forbid(unsafe_code)]

use std::cell::OnceCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use dets_domain::{value_as_key, PipelineError, PipelineResult, Registry};
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use ulid::Ulid;

pub const LOGISTIC_REGRESSION: &str = "Logistic regression";
pub const LINEAR_REGRESSION: &str = "Linear regression";
pub const LOG_LINEAR_REGRESSION: &str = "Log-linear regression";
pub const KEYED_MODELS: &str = "Keyed models";
pub const HTTP_REST: &str = "HTTP REST";
pub const OPENSCORING_REST: &str = "OpenScoring REST";

const INTERCEPT: &str = "intercept";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Result of scoring one record: the score itself plus explanatory metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelScore {
    pub result: Value,
    pub meta: Value,
}

pub trait PredictiveModel {
    #[allow(clippy::missing_errors_doc)]
    fn score(&self, data: &Value) -> PipelineResult<ModelScore>;
}

pub type ModelFactory = fn(&Value, &ModelRegistry) -> PipelineResult<Box<dyn PredictiveModel>>;

/// Name-keyed model constructors.
#[derive(Clone)]
pub struct ModelRegistry {
    factories: Registry<ModelFactory>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.names()).finish()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ModelRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: Registry::new("model"),
        }
    }

    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(LOGISTIC_REGRESSION, build_logistic);
        registry.register(LINEAR_REGRESSION, build_linear);
        registry.register(LOG_LINEAR_REGRESSION, build_log_linear);
        registry.register(KEYED_MODELS, build_keyed);
        registry.register(HTTP_REST, build_http_rest);
        registry.register(OPENSCORING_REST, build_openscoring);
        registry
    }

    /// Returns `true` when an earlier registration under `name` was replaced.
    pub fn register(&mut self, name: impl Into<String>, factory: ModelFactory) -> bool {
        self.factories.register(name, factory)
    }

    /// Build a model from its registered name and persisted parameters.
    ///
    /// # Errors
    /// Returns `Configuration` for unknown names or invalid parameters.
    pub fn instantiate(
        &self,
        name: &str,
        parameters: &Value,
    ) -> PipelineResult<Box<dyn PredictiveModel>> {
        let factory = self.factories.resolve(name)?;
        factory(parameters, self)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.names()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkFunction {
    Logistic,
    Linear,
    LogLinear,
}

impl LinkFunction {
    fn apply(self, linear_predictor: f64, correction_factor: f64) -> f64 {
        match self {
            Self::Logistic => 1.0 / (1.0 + (-linear_predictor).exp()),
            Self::Linear => linear_predictor,
            Self::LogLinear => linear_predictor.exp() * correction_factor,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GlmParameters {
    Detailed(DetailedGlmParameters),
    Flat(BTreeMap<String, f64>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetailedGlmParameters {
    coefficients: BTreeMap<String, f64>,
    #[serde(default)]
    correction_factor: Option<f64>,
}

/// Weighted sum of the input features passed through a link function.
///
/// The input always carries an implicit `intercept` feature fixed at 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralizedLinearModel {
    link: LinkFunction,
    coefficients: BTreeMap<String, f64>,
    correction_factor: f64,
}

impl GeneralizedLinearModel {
    #[must_use]
    pub fn new(link: LinkFunction, coefficients: BTreeMap<String, f64>) -> Self {
        Self {
            link,
            coefficients,
            correction_factor: 1.0,
        }
    }

    /// # Errors
    /// Returns `Configuration` when the parameters are not a coefficient map, or when a
    /// correction factor is supplied for a link other than log-linear.
    pub fn from_parameters(link: LinkFunction, parameters: &Value) -> PipelineResult<Self> {
        let parsed: GlmParameters = serde_json::from_value(parameters.clone()).map_err(|err| {
            PipelineError::configuration(format!(
                "model parameters must map feature names to numbers: {err}"
            ))
        })?;
        let (coefficients, correction_factor) = match parsed {
            GlmParameters::Detailed(detailed) => {
                (detailed.coefficients, detailed.correction_factor)
            }
            GlmParameters::Flat(coefficients) => (coefficients, None),
        };
        if correction_factor.is_some() && link != LinkFunction::LogLinear {
            return Err(PipelineError::configuration(
                "correction_factor only applies to log-linear models",
            ));
        }
        Ok(Self {
            link,
            coefficients,
            correction_factor: correction_factor.unwrap_or(1.0),
        })
    }
}

impl PredictiveModel for GeneralizedLinearModel {
    fn score(&self, data: &Value) -> PipelineResult<ModelScore> {
        let mut features = data
            .as_object()
            .cloned()
            .ok_or_else(|| PipelineError::upstream("model input must be a JSON object"))?;
        features.insert(INTERCEPT.to_string(), json!(1.0));

        let mut included = Vec::new();
        for (name, value) in &features {
            let Some(coefficient) = self.coefficients.get(name) else {
                continue;
            };
            let value = value.as_f64().ok_or_else(|| {
                PipelineError::upstream(format!("feature '{name}' is not numeric: {value}"))
            })?;
            included.push((name.clone(), coefficient * value));
        }
        let mut not_included: Vec<(String, f64)> = self
            .coefficients
            .iter()
            .filter(|(name, _)| !features.contains_key(name.as_str()))
            .map(|(name, coefficient)| (name.clone(), *coefficient))
            .collect();

        let linear_predictor: f64 = included.iter().map(|(_, contribution)| contribution).sum();
        let score = self.link.apply(linear_predictor, self.correction_factor);
        let result = Number::from_f64(score)
            .map(Value::Number)
            .ok_or_else(|| PipelineError::upstream(format!("score is not finite: {score}")))?;

        sort_descending(&mut included);
        sort_descending(&mut not_included);
        Ok(ModelScore {
            result,
            meta: json!({
                "coefficients_included": pairs_to_json(&included),
                "coefficients_not_included": pairs_to_json(&not_included),
            }),
        })
    }
}

fn sort_descending(pairs: &mut [(String, f64)]) {
    pairs.sort_by(|lhs, rhs| match rhs.1.total_cmp(&lhs.1) {
        Ordering::Equal => lhs.0.cmp(&rhs.0),
        other => other,
    });
}

fn pairs_to_json(pairs: &[(String, f64)]) -> Value {
    Value::Array(pairs.iter().map(|(name, value)| json!([name, value])).collect())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelSpec {
    model_name: String,
    #[serde(default)]
    model_parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyedParameters {
    key_field: String,
    models: BTreeMap<String, ModelSpec>,
    #[serde(default)]
    default: Option<ModelSpec>,
}

/// Picks a sub-model by the value of one input field.
pub struct KeyedModels {
    key_field: String,
    models: BTreeMap<String, Box<dyn PredictiveModel>>,
    default: Option<Box<dyn PredictiveModel>>,
}

impl std::fmt::Debug for KeyedModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedModels")
            .field("key_field", &self.key_field)
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

impl PredictiveModel for KeyedModels {
    fn score(&self, data: &Value) -> PipelineResult<ModelScore> {
        let key = data
            .get(&self.key_field)
            .and_then(value_as_key)
            .ok_or_else(|| {
                PipelineError::upstream(format!(
                    "model key field '{}' is missing or not a scalar",
                    self.key_field
                ))
            })?;
        let model = match self.models.get(&key) {
            Some(model) => model,
            None => self.default.as_ref().ok_or_else(|| {
                PipelineError::upstream(format!("no model registered for key '{key}'"))
            })?,
        };
        let scored = model.score(data)?;
        Ok(ModelScore {
            result: scored.result,
            meta: json!({"model_key": key, "model": scored.meta}),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RestParameters {
    url: String,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    id_field: Option<String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl RestParameters {
    fn parse(parameters: &Value, model_name: &str) -> PipelineResult<Self> {
        let parsed: Self = serde_json::from_value(parameters.clone()).map_err(|err| {
            PipelineError::configuration(format!("invalid {model_name} parameters: {err}"))
        })?;
        if parsed.url.trim().is_empty() {
            return Err(PipelineError::configuration(format!(
                "{model_name} requires a url"
            )));
        }
        Ok(parsed)
    }

    fn agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build()
    }

    fn with_headers(&self, mut request: ureq::Request) -> ureq::Request {
        for (header, value) in &self.headers {
            request = request.set(header, value);
        }
        request
    }
}

fn read_json_response(
    outcome: Result<ureq::Response, ureq::Error>,
    url: &str,
) -> PipelineResult<Value> {
    match outcome {
        Ok(response) => response.into_json::<Value>().map_err(|err| {
            PipelineError::external(format!("non-JSON response from {url}: {err}"))
        }),
        Err(ureq::Error::Status(code, _)) => Err(PipelineError::external(format!(
            "{url} answered http status {code}"
        ))),
        Err(ureq::Error::Transport(err)) => Err(PipelineError::external(format!(
            "http transport failure calling {url}: {err}"
        ))),
    }
}

/// Posts the record as JSON and treats the response body as the score.
///
/// A two-element array response is read as `[result, meta]`.
#[derive(Debug, Clone)]
pub struct HttpRestModel {
    parameters: RestParameters,
    agent: ureq::Agent,
}

impl HttpRestModel {
    /// # Errors
    /// Returns `Configuration` when the parameters lack a url or carry unknown keys.
    pub fn from_parameters(parameters: &Value) -> PipelineResult<Self> {
        let parameters = RestParameters::parse(parameters, HTTP_REST)?;
        let agent = parameters.agent();
        Ok(Self { parameters, agent })
    }
}

impl PredictiveModel for HttpRestModel {
    fn score(&self, data: &Value) -> PipelineResult<ModelScore> {
        let url = &self.parameters.url;
        let request = self
            .parameters
            .with_headers(self.agent.post(url).set("content-type", "application/json"));
        let body = read_json_response(request.send_json(data), url)?;
        tracing::debug!(url = %url, "scored record over http");
        match body {
            Value::Array(mut pair) if pair.len() == 2 => {
                let meta = pair.pop().unwrap_or(Value::Null);
                let result = pair.pop().unwrap_or(Value::Null);
                Ok(ModelScore { result, meta })
            }
            other => Ok(ModelScore {
                result: other,
                meta: Value::Null,
            }),
        }
    }
}

/// Scores against an OpenScoring deployment: `GET {url}` once for the model summary,
/// then `POST {url}` with `{"id", "arguments"}` per record.
#[derive(Debug)]
pub struct OpenScoringRestModel {
    parameters: RestParameters,
    agent: ureq::Agent,
    summary: OnceCell<Value>,
}

impl OpenScoringRestModel {
    /// # Errors
    /// Returns `Configuration` when the parameters lack a url or carry unknown keys.
    pub fn from_parameters(parameters: &Value) -> PipelineResult<Self> {
        let parameters = RestParameters::parse(parameters, OPENSCORING_REST)?;
        let agent = parameters.agent();
        Ok(Self {
            parameters,
            agent,
            summary: OnceCell::new(),
        })
    }

    fn summary(&self) -> PipelineResult<&Value> {
        if let Some(summary) = self.summary.get() {
            return Ok(summary);
        }
        let url = &self.parameters.url;
        let request = self.parameters.with_headers(self.agent.get(url));
        let fetched = read_json_response(request.call(), url)?;
        tracing::info!(url = %url, "fetched openscoring model summary");
        Ok(self.summary.get_or_init(|| fetched))
    }

    fn request_id(&self, data: &Value) -> String {
        self.parameters
            .id_field
            .as_ref()
            .and_then(|field| data.get(field))
            .and_then(value_as_key)
            .unwrap_or_else(|| Ulid::new().to_string())
    }
}

impl PredictiveModel for OpenScoringRestModel {
    fn score(&self, data: &Value) -> PipelineResult<ModelScore> {
        let summary = self.summary()?.clone();
        let url = &self.parameters.url;
        let payload = json!({"id": self.request_id(data), "arguments": data});
        let request = self
            .parameters
            .with_headers(self.agent.post(url).set("content-type", "application/json"));
        let body = read_json_response(request.send_json(&payload), url)?;
        let result = body.get("result").cloned().ok_or_else(|| {
            PipelineError::external(format!("response from {url} has no 'result' field"))
        })?;
        Ok(ModelScore {
            result,
            meta: summary,
        })
    }
}

fn build_logistic(parameters: &Value, _: &ModelRegistry) -> PipelineResult<Box<dyn PredictiveModel>> {
    Ok(Box::new(GeneralizedLinearModel::from_parameters(
        LinkFunction::Logistic,
        parameters,
    )?))
}

fn build_linear(parameters: &Value, _: &ModelRegistry) -> PipelineResult<Box<dyn PredictiveModel>> {
    Ok(Box::new(GeneralizedLinearModel::from_parameters(
        LinkFunction::Linear,
        parameters,
    )?))
}

fn build_log_linear(
    parameters: &Value,
    _: &ModelRegistry,
) -> PipelineResult<Box<dyn PredictiveModel>> {
    Ok(Box::new(GeneralizedLinearModel::from_parameters(
        LinkFunction::LogLinear,
        parameters,
    )?))
}

fn build_keyed(
    parameters: &Value,
    registry: &ModelRegistry,
) -> PipelineResult<Box<dyn PredictiveModel>> {
    let parsed: KeyedParameters = serde_json::from_value(parameters.clone()).map_err(|err| {
        PipelineError::configuration(format!("invalid {KEYED_MODELS} parameters: {err}"))
    })?;
    let mut models = BTreeMap::new();
    for (key, spec) in parsed.models {
        let model = registry.instantiate(&spec.model_name, &spec.model_parameters)?;
        models.insert(key, model);
    }
    let default = parsed
        .default
        .map(|spec| registry.instantiate(&spec.model_name, &spec.model_parameters))
        .transpose()?;
    Ok(Box::new(KeyedModels {
        key_field: parsed.key_field,
        models,
        default,
    }))
}

fn build_http_rest(
    parameters: &Value,
    _: &ModelRegistry,
) -> PipelineResult<Box<dyn PredictiveModel>> {
    Ok(Box::new(HttpRestModel::from_parameters(parameters)?))
}

fn build_openscoring(
    parameters: &Value,
    _: &ModelRegistry,
) -> PipelineResult<Box<dyn PredictiveModel>> {
    Ok(Box::new(OpenScoringRestModel::from_parameters(parameters)?))
}

/// Folds the model name into the model's metadata for storage next to a score.
#[must_use]
pub fn annotate_meta(model_name: &str, meta: Value) -> Value {
    match meta {
        Value::Object(mut fields) => {
            fields.insert("model_name".to_string(), json!(model_name));
            Value::Object(fields)
        }
        Value::Null => {
            let mut fields = Map::new();
            fields.insert("model_name".to_string(), json!(model_name));
            Value::Object(fields)
        }
        other => json!({"model_name": model_name, "model_meta": other}),
    }
}
