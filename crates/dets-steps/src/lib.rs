#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use dets_domain::{
    ExternalConnections, NewRecord, PipelineError, PipelineResult, RecordRow, Registry,
    StepCategory, StepContext,
};
use dets_models::{ModelFactory, ModelRegistry};
use dets_store_core::PipelineStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

mod coalesce;
mod filter;
mod function;
mod load;
mod mapping;
mod merge;
mod score;
mod write;

pub use coalesce::{coalesce_records, Coalesce};
pub use filter::{CompareOp, Filter, Predicate};
pub use function::{FunctionOutput, SwapMetaToData, TransformDataWithFunction, TransformFunction};
pub use load::{Load, LoadQuery};
pub use mapping::{MapDataWithDict, TransformIndicatorListToDict};
pub use merge::{Merge, MergeInput};
pub use score::Score;
pub use write::{sort_keys, write_json_file, OutputFormat, Write};

pub const LOAD: &str = "Load";
pub const LOAD_QUERY: &str = "LoadQuery";
pub const FILTER: &str = "Filter";
pub const COALESCE: &str = "Coalesce";
pub const SWAP_META_TO_DATA: &str = "SwapMetaToData";
pub const MERGE: &str = "Merge";
pub const TRANSFORM_INDICATOR_LIST_TO_DICT: &str = "TransformIndicatorListToDict";
pub const MAP_DATA_WITH_DICT: &str = "MapDataWithDict";
pub const TRANSFORM_DATA_WITH_FUNCTION: &str = "TransformDataWithFunction";
pub const SCORE: &str = "Score";
pub const WRITE: &str = "Write";

pub const IDENTITY: &str = "Identity";

/// Counts reported by a finished step.
#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct StepSummary {
    pub records_read: usize,
    pub records_written: usize,
}

impl StepSummary {
    #[must_use]
    pub fn new(records_read: usize, records_written: usize) -> Self {
        Self {
            records_read,
            records_written,
        }
    }
}

/// Everything a configured step can reach while it runs.
pub struct StepRuntime<'a> {
    pub store: &'a dyn PipelineStore,
    pub context: &'a StepContext,
    pub working_directory: &'a Path,
    pub external_connections: &'a ExternalConnections,
}

impl StepRuntime<'_> {
    /// Records produced by `step_number` in the current pipeline job, ordered by id.
    ///
    /// # Errors
    /// Returns `Store` when the lookup fails.
    pub fn upstream(&self, step_number: i64) -> PipelineResult<Vec<RecordRow>> {
        let rows = self
            .store
            .fetch_step_records(self.context.pipeline_job_id, step_number)?;
        tracing::debug!(
            step_execution_id = %self.context.step_execution_id,
            upstream_step = step_number,
            rows = rows.len(),
            "fetched upstream records"
        );
        Ok(rows)
    }

    /// Like [`StepRuntime::upstream`], for steps that cannot run without input.
    ///
    /// # Errors
    /// Returns `UpstreamData` when `step_number` produced no records in this pipeline
    /// job, `Store` when the lookup fails.
    pub fn required_upstream(&self, step_number: i64) -> PipelineResult<Vec<RecordRow>> {
        let rows = self.upstream(step_number)?;
        if rows.is_empty() {
            return Err(PipelineError::upstream(format!(
                "step {} requires records from step {step_number}, which produced none",
                self.context.step_number
            )));
        }
        Ok(rows)
    }

    /// Append records stamped with the current step execution.
    ///
    /// # Errors
    /// Returns `Store` when the insert fails.
    pub fn emit(&self, records: &[NewRecord]) -> PipelineResult<usize> {
        Ok(self
            .store
            .insert_records(self.context.step_execution_id, records)?)
    }

    #[must_use]
    pub fn resolve_path(&self, file_name: &str) -> PathBuf {
        let path = Path::new(file_name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_directory.join(path)
        }
    }
}

pub trait DataTransformation {
    #[allow(clippy::missing_errors_doc)]
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary>;
}

/// A resolved step plus the handles injected by the job runner before `run`.
pub struct StepInstance<'a> {
    class_name: String,
    transformation: Box<dyn DataTransformation>,
    binding: Option<(&'a dyn PipelineStore, StepContext)>,
    working_directory: PathBuf,
    external_connections: ExternalConnections,
}

impl<'a> StepInstance<'a> {
    #[must_use]
    pub fn new(class_name: impl Into<String>, transformation: Box<dyn DataTransformation>) -> Self {
        Self {
            class_name: class_name.into(),
            transformation,
            binding: None,
            working_directory: PathBuf::from("."),
            external_connections: ExternalConnections::new(),
        }
    }

    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn configure(&mut self, store: &'a dyn PipelineStore, context: StepContext) {
        self.binding = Some((store, context));
    }

    pub fn set_working_directory(&mut self, path: impl Into<PathBuf>) {
        self.working_directory = path.into();
    }

    pub fn set_external_connections(&mut self, connections: ExternalConnections) {
        self.external_connections = connections;
    }

    /// # Errors
    /// Returns `Configuration` when `configure` was never called, otherwise whatever the
    /// step itself raises.
    pub fn run(&self) -> PipelineResult<StepSummary> {
        let Some((store, context)) = &self.binding else {
            return Err(PipelineError::configuration(format!(
                "step class {} ran before configure",
                self.class_name
            )));
        };
        let runtime = StepRuntime {
            store: *store,
            context,
            working_directory: &self.working_directory,
            external_connections: &self.external_connections,
        };
        self.transformation.run(&runtime)
    }
}

pub type StepFactory = fn(&Value, &Catalog) -> PipelineResult<Box<dyn DataTransformation>>;

/// A registered step class: its taxonomy category and its constructor.
#[derive(Clone, Copy)]
pub struct StepClass {
    pub category: StepCategory,
    pub factory: StepFactory,
}

impl std::fmt::Debug for StepClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepClass")
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

/// Step classes, models and functions contributed by the caller on top of the built-ins.
#[derive(Default)]
pub struct LocalExtensions {
    pub steps: Vec<(String, StepClass)>,
    pub models: Vec<(String, ModelFactory)>,
    pub functions: Vec<(String, TransformFunction)>,
}

/// The three name registries a job needs, built once and passed by reference.
///
/// Later registrations replace earlier ones under the same name.
#[derive(Clone)]
pub struct Catalog {
    steps: Registry<StepClass>,
    models: ModelRegistry,
    functions: Registry<TransformFunction>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl Catalog {
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut catalog = Self {
            steps: Registry::new("step class"),
            models: ModelRegistry::with_builtins(),
            functions: Registry::new("transformation function"),
        };
        let builtins: [(&str, StepCategory, StepFactory); 11] = [
            (LOAD, StepCategory::Load, load::build_load),
            (LOAD_QUERY, StepCategory::Load, load::build_load_query),
            (FILTER, StepCategory::Transform, filter::build),
            (COALESCE, StepCategory::Coalesce, coalesce::build),
            (SWAP_META_TO_DATA, StepCategory::Transform, function::build_swap),
            (MERGE, StepCategory::Merge, merge::build),
            (
                TRANSFORM_INDICATOR_LIST_TO_DICT,
                StepCategory::Transform,
                mapping::build_indicator,
            ),
            (MAP_DATA_WITH_DICT, StepCategory::Transform, mapping::build_map),
            (
                TRANSFORM_DATA_WITH_FUNCTION,
                StepCategory::Transform,
                function::build_transform,
            ),
            (SCORE, StepCategory::Score, score::build),
            (WRITE, StepCategory::Output, write::build),
        ];
        for (name, category, factory) in builtins {
            catalog.register_step(name, StepClass { category, factory });
        }
        catalog.register_function(IDENTITY, function::identity);
        catalog
    }

    #[must_use]
    pub fn with_local_extensions(extensions: LocalExtensions) -> Self {
        let mut catalog = Self::with_builtins();
        for (name, class) in extensions.steps {
            catalog.register_step(name, class);
        }
        for (name, factory) in extensions.models {
            catalog.register_model(name, factory);
        }
        for (name, function) in extensions.functions {
            catalog.register_function(name, function);
        }
        catalog
    }

    pub fn register_step(&mut self, name: impl Into<String>, class: StepClass) -> bool {
        self.steps.register(name, class)
    }

    pub fn register_model(&mut self, name: impl Into<String>, factory: ModelFactory) -> bool {
        self.models.register(name, factory)
    }

    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        function: TransformFunction,
    ) -> bool {
        self.functions.register(name, function)
    }

    /// # Errors
    /// Returns `Configuration` for unregistered class names.
    pub fn step_class(&self, class_name: &str) -> PipelineResult<&StepClass> {
        self.steps.resolve(class_name)
    }

    /// Build a step from its class name and persisted parameters.
    ///
    /// # Errors
    /// Returns `Configuration` for unknown classes and invalid parameters.
    pub fn instantiate(
        &self,
        class_name: &str,
        parameters: &Value,
    ) -> PipelineResult<Box<dyn DataTransformation>> {
        let class = self.steps.resolve(class_name)?;
        (class.factory)(parameters, self)
    }

    /// # Errors
    /// Returns `Configuration` for unregistered function names.
    pub fn function(&self, name: &str) -> PipelineResult<TransformFunction> {
        self.functions.resolve(name).copied()
    }

    #[must_use]
    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn step_class_names(&self) -> impl Iterator<Item = &str> {
        self.steps.names()
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("steps", &self.steps.names().collect::<Vec<_>>())
            .field("models", &self.models)
            .field("functions", &self.functions.names().collect::<Vec<_>>())
            .finish()
    }
}

pub(crate) fn parse_parameters<T: DeserializeOwned>(
    class_name: &str,
    parameters: &Value,
) -> PipelineResult<T> {
    serde_json::from_value(parameters.clone()).map_err(|err| {
        PipelineError::configuration(format!("invalid parameters for {class_name}: {err}"))
    })
}

/// Wraps `value` as `{field_name: value}` when a field name is configured.
pub(crate) fn nest(value: Value, field_name: Option<&str>) -> Value {
    match field_name {
        Some(field) => {
            let mut fields = serde_json::Map::new();
            fields.insert(field.to_string(), value);
            Value::Object(fields)
        }
        None => value,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use dets_domain::{
        ExecutionStatus, NewRecord, NewStepDef, PipelineId, PipelineJobId, RecordRow, StepContext,
        StepDefId,
    };
    use dets_store_core::PipelineStore;
    use dets_store_sqlite::SqlitePipelineStore;
    use serde_json::{json, Value};

    use super::{Catalog, StepInstance, StepSummary};
    use dets_domain::PipelineResult;

    pub fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    /// One pipeline job over an in-memory store with step definitions numbered 1..=9.
    pub struct Harness {
        pub store: SqlitePipelineStore,
        pub pipeline_id: PipelineId,
        pub pipeline_job_id: PipelineJobId,
        pub job_id: dets_domain::JobId,
        step_defs: BTreeMap<i64, StepDefId>,
    }

    impl Harness {
        pub fn new() -> Self {
            let store = must(SqlitePipelineStore::open_in_memory());
            let class_id = must(store.upsert_step_class("Transform", None));
            let pipeline = must(store.insert_pipeline("harness", None));
            let mut step_defs = BTreeMap::new();
            for step_number in 1..=9 {
                let id = must(store.insert_step_def(&NewStepDef {
                    pipeline_id: pipeline.id,
                    step_number,
                    name: format!("step {step_number}"),
                    class_id,
                    parameters: json!({}),
                    description: None,
                }));
                step_defs.insert(step_number, id);
            }
            let job = must(store.insert_job("harness"));
            let pipeline_job_id = must(store.insert_pipeline_job(job.id, pipeline.id));
            must(store.update_pipeline_job_status(pipeline_job_id, ExecutionStatus::Started));
            Self {
                store,
                pipeline_id: pipeline.id,
                pipeline_job_id,
                job_id: job.id,
                step_defs,
            }
        }

        pub fn context(&self, step_number: i64) -> StepContext {
            let step_def = self.step_defs[&step_number];
            let step_execution_id =
                must(self.store.insert_step_execution(self.pipeline_job_id, step_def));
            StepContext {
                job_id: self.job_id,
                pipeline_job_id: self.pipeline_job_id,
                step_execution_id,
                pipeline_name: "harness".to_string(),
                step_number,
                step_name: format!("step {step_number}"),
            }
        }

        pub fn seed(&self, step_number: i64, records: &[NewRecord]) {
            let context = self.context(step_number);
            must(self.store.insert_records(context.step_execution_id, records));
        }

        pub fn seed_values(&self, step_number: i64, values: &[(Value, Option<&str>)]) {
            let records: Vec<NewRecord> = values
                .iter()
                .map(|(data, common_id)| {
                    NewRecord::new(data.clone(), None, common_id.map(str::to_string))
                })
                .collect();
            self.seed(step_number, &records);
        }

        pub fn run(
            &self,
            step_number: i64,
            class_name: &str,
            parameters: &Value,
            working_directory: Option<&std::path::Path>,
        ) -> PipelineResult<StepSummary> {
            self.run_with(&Catalog::with_builtins(), step_number, class_name, parameters, working_directory)
        }

        pub fn run_with(
            &self,
            catalog: &Catalog,
            step_number: i64,
            class_name: &str,
            parameters: &Value,
            working_directory: Option<&std::path::Path>,
        ) -> PipelineResult<StepSummary> {
            let transformation = catalog.instantiate(class_name, parameters)?;
            let mut instance = StepInstance::new(class_name, transformation);
            instance.configure(&self.store, self.context(step_number));
            if let Some(directory) = working_directory {
                instance.set_working_directory(directory);
            }
            instance.run()
        }

        pub fn output(&self, step_number: i64) -> Vec<RecordRow> {
            must(self.store.fetch_step_records(self.pipeline_job_id, step_number))
        }
    }

    pub fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("dets-steps-{name}-{}", ulid::Ulid::new()));
        must(std::fs::create_dir_all(&dir));
        dir
    }
}
