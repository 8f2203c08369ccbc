#![forbid(unsafe_code)]

//! Pipeline registration, job execution, archival and export on top of a
//! [`PipelineStore`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use dets_domain::{
    ensure_non_empty, format_rfc3339, now_utc, ExecutionStatus, ExternalConnections, JobId,
    NewStepDef, PipelineError, PipelineJobId, PipelineRecord, PipelineResult, StepClassId,
    StepContext, StepDefRecord, StepExecutionId,
};
use dets_pipeline::PipelineDefinitionEnvelope;
use dets_steps::{write_json_file, Catalog, OutputFormat, StepInstance, StepSummary};
use dets_store_core::PipelineStore;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

fn in_transaction<T>(
    store: &dyn PipelineStore,
    work: impl FnOnce() -> PipelineResult<T>,
) -> PipelineResult<T> {
    store.begin_transaction()?;
    match work() {
        Ok(value) => {
            store.commit_transaction()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = store.rollback_transaction() {
                warn!(error = %format!("{rollback:#}"), "rollback failed");
            }
            Err(err)
        }
    }
}

fn record_failure<E: std::fmt::Display>(result: Result<(), E>, entity: &str) {
    if let Err(err) = result {
        warn!(entity, error = %format!("{err:#}"), "failed to record failed status");
    }
}

fn find_pipeline(store: &dyn PipelineStore, name: &str) -> PipelineResult<PipelineRecord> {
    store
        .find_pipeline(name)?
        .ok_or_else(|| PipelineError::configuration(format!("unknown pipeline '{name}'")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedPipeline {
    pub pipeline: PipelineRecord,
    pub step_count: usize,
    /// Historical name given to the version this load replaced.
    pub retired_as: Option<String>,
}

/// Registers pipeline definitions and their step classes.
pub struct PipelineLoader<'a> {
    store: &'a dyn PipelineStore,
    catalog: &'a Catalog,
}

impl<'a> PipelineLoader<'a> {
    #[must_use]
    pub fn new(store: &'a dyn PipelineStore, catalog: &'a Catalog) -> Self {
        Self { store, catalog }
    }

    /// Register `definition` under a new pipeline name.
    ///
    /// # Errors
    /// Returns `Configuration` when the name is taken or a step does not resolve, and
    /// `Store` when persistence fails. Nothing is written on error.
    pub fn load_pipeline(
        &self,
        name: &str,
        definition: &PipelineDefinitionEnvelope,
    ) -> PipelineResult<LoadedPipeline> {
        ensure_non_empty("pipeline name", name)?;
        self.validate(definition)?;
        in_transaction(self.store, || {
            if self.store.find_pipeline(name)?.is_some() {
                return Err(PipelineError::configuration(format!(
                    "pipeline '{name}' already exists"
                )));
            }
            self.register(name, definition)
        })
    }

    /// Replace the pipeline called `name`. The current version, if any, keeps its steps
    /// and job history under `"{name}__{timestamp}"`.
    ///
    /// # Errors
    /// Same as [`PipelineLoader::load_pipeline`], minus the name collision.
    pub fn update_pipeline(
        &self,
        name: &str,
        definition: &PipelineDefinitionEnvelope,
    ) -> PipelineResult<LoadedPipeline> {
        ensure_non_empty("pipeline name", name)?;
        self.validate(definition)?;
        in_transaction(self.store, || {
            let retired_as = match self.store.find_pipeline(name)? {
                Some(existing) => {
                    let historical = format!("{name}__{}", format_rfc3339(now_utc())?);
                    self.store.rename_pipeline(existing.id, &historical)?;
                    info!(pipeline = name, renamed_to = %historical, "retired previous pipeline version");
                    Some(historical)
                }
                None => None,
            };
            let mut loaded = self.register(name, definition)?;
            loaded.retired_as = retired_as;
            Ok(loaded)
        })
    }

    fn validate(&self, definition: &PipelineDefinitionEnvelope) -> PipelineResult<()> {
        for step in &definition.steps {
            if let Err(err) = self
                .catalog
                .instantiate(&step.data_transformation_class, &step.parameters)
            {
                error!(
                    step_number = step.step_number,
                    step_name = %step.name,
                    class_name = %step.data_transformation_class,
                    error = %err,
                    "step declaration does not resolve"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    fn register(
        &self,
        name: &str,
        definition: &PipelineDefinitionEnvelope,
    ) -> PipelineResult<LoadedPipeline> {
        let mut class_ids: BTreeMap<&str, StepClassId> = BTreeMap::new();
        for class_name in definition.class_names() {
            let category = self.catalog.step_class(class_name)?.category;
            let class_id = self
                .store
                .upsert_step_class(class_name, Some(category.as_str()))?;
            class_ids.insert(class_name, class_id);
        }

        let pipeline = self
            .store
            .insert_pipeline(name, Some(&definition.definition_hash))?;
        for step in &definition.steps {
            let class_id = class_ids
                .get(step.data_transformation_class.as_str())
                .copied()
                .ok_or_else(|| {
                    PipelineError::configuration(format!(
                        "step class {} was not registered",
                        step.data_transformation_class
                    ))
                })?;
            self.store.insert_step_def(&NewStepDef {
                pipeline_id: pipeline.id,
                step_number: step.step_number,
                name: step.name.clone(),
                class_id,
                parameters: step.parameters.clone(),
                description: step.description.clone(),
            })?;
        }
        info!(
            pipeline = name,
            steps = definition.steps.len(),
            definition_hash = %definition.definition_hash,
            "loaded pipeline"
        );
        Ok(LoadedPipeline {
            pipeline,
            step_count: definition.steps.len(),
            retired_as: None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Defaults to the pipeline names joined with commas.
    pub job_name: Option<String>,
    pub working_directory: PathBuf,
    pub external_connections: ExternalConnections,
    /// Commit even when a step fails so the partial state can be inspected.
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepRunReport {
    pub step_number: i64,
    pub step_name: String,
    pub class_name: String,
    pub step_execution_id: StepExecutionId,
    pub summary: StepSummary,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PipelineRunReport {
    pub pipeline: String,
    pub pipeline_job_id: PipelineJobId,
    pub steps: Vec<StepRunReport>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: JobId,
    pub job_name: String,
    pub status: ExecutionStatus,
    pub pipelines: Vec<PipelineRunReport>,
}

struct PlannedStep<'a> {
    def: StepDefRecord,
    instance: StepInstance<'a>,
}

struct PlannedPipeline<'a> {
    pipeline: PipelineRecord,
    steps: Vec<PlannedStep<'a>>,
}

/// Executes jobs: one or more pipelines, each step in step-number order, inside one
/// transaction.
pub struct JobRunner<'a> {
    store: &'a dyn PipelineStore,
    catalog: &'a Catalog,
}

impl<'a> JobRunner<'a> {
    #[must_use]
    pub fn new(store: &'a dyn PipelineStore, catalog: &'a Catalog) -> Self {
        Self { store, catalog }
    }

    /// Run `pipeline_names` as one job.
    ///
    /// Every step is resolved and instantiated before the job row is created, so
    /// configuration errors leave no trace. The first failing step aborts the job; the
    /// transaction is rolled back unless `options.debug` is set.
    ///
    /// # Errors
    /// `Configuration` for unknown pipelines or unresolvable steps, `StepExecution`
    /// wrapping the cause when a step fails, `Store` on persistence failures.
    pub fn run_job(
        &self,
        pipeline_names: &[String],
        options: &JobOptions,
    ) -> PipelineResult<JobReport> {
        if pipeline_names.is_empty() {
            return Err(PipelineError::configuration(
                "a job needs at least one pipeline",
            ));
        }
        let plan = self.plan(pipeline_names)?;
        let job_name = options
            .job_name
            .clone()
            .unwrap_or_else(|| pipeline_names.join(","));

        self.store.begin_transaction()?;
        match self.execute(&job_name, plan, options) {
            Ok(report) => {
                self.store.commit_transaction()?;
                info!(job_id = %report.job_id, job = %job_name, "job finished");
                Ok(report)
            }
            Err(err) => {
                let settled = if options.debug {
                    self.store.commit_transaction()
                } else {
                    self.store.rollback_transaction()
                };
                if let Err(settle_err) = settled {
                    error!(error = %format!("{settle_err:#}"), "failed to close job transaction");
                }
                error!(job = %job_name, debug = options.debug, error = %err, "job failed");
                Err(err)
            }
        }
    }

    fn plan(&self, pipeline_names: &[String]) -> PipelineResult<Vec<PlannedPipeline<'a>>> {
        let mut plan = Vec::with_capacity(pipeline_names.len());
        for name in pipeline_names {
            let pipeline = find_pipeline(self.store, name)?;
            let defs = self.store.list_step_defs(pipeline.id)?;
            if defs.is_empty() {
                return Err(PipelineError::configuration(format!(
                    "pipeline '{name}' has no steps"
                )));
            }
            let mut steps = Vec::with_capacity(defs.len());
            for def in defs {
                let transformation = self
                    .catalog
                    .instantiate(&def.class_name, &def.parameters)
                    .map_err(|err| {
                        error!(
                            pipeline = %name,
                            step_number = def.step_number,
                            class_name = %def.class_name,
                            error = %err,
                            "cannot instantiate step"
                        );
                        err
                    })?;
                let instance = StepInstance::new(def.class_name.clone(), transformation);
                steps.push(PlannedStep { def, instance });
            }
            plan.push(PlannedPipeline { pipeline, steps });
        }
        Ok(plan)
    }

    fn execute(
        &self,
        job_name: &str,
        plan: Vec<PlannedPipeline<'a>>,
        options: &JobOptions,
    ) -> PipelineResult<JobReport> {
        let job = self.store.insert_job(job_name)?;
        self.store
            .update_job_status(job.id, ExecutionStatus::Started)?;
        info!(job_id = %job.id, job = job_name, pipelines = plan.len(), "job started");

        let mut pipelines = Vec::with_capacity(plan.len());
        for planned in plan {
            match self.run_pipeline(job.id, planned, options) {
                Ok(report) => pipelines.push(report),
                Err(err) => {
                    record_failure(
                        self.store.update_job_status(job.id, ExecutionStatus::Failed),
                        "job",
                    );
                    return Err(err);
                }
            }
        }

        self.store
            .update_job_status(job.id, ExecutionStatus::Finished)?;
        self.store.mark_job_latest(job.id)?;
        Ok(JobReport {
            job_id: job.id,
            job_name: job.name,
            status: ExecutionStatus::Finished,
            pipelines,
        })
    }

    fn run_pipeline(
        &self,
        job_id: JobId,
        planned: PlannedPipeline<'a>,
        options: &JobOptions,
    ) -> PipelineResult<PipelineRunReport> {
        let PlannedPipeline { pipeline, steps } = planned;
        let pipeline_job_id = self.store.insert_pipeline_job(job_id, pipeline.id)?;
        self.store
            .update_pipeline_job_status(pipeline_job_id, ExecutionStatus::Started)?;
        info!(pipeline = %pipeline.name, pipeline_job_id = %pipeline_job_id, "pipeline started");

        let mut reports = Vec::with_capacity(steps.len());
        for PlannedStep { def, mut instance } in steps {
            let step_execution_id = match self.start_step(pipeline_job_id, &def) {
                Ok(id) => id,
                Err(err) => {
                    record_failure(
                        self.store
                            .update_pipeline_job_status(pipeline_job_id, ExecutionStatus::Failed),
                        "pipeline job",
                    );
                    return Err(err);
                }
            };
            instance.configure(
                self.store,
                StepContext {
                    job_id,
                    pipeline_job_id,
                    step_execution_id,
                    pipeline_name: pipeline.name.clone(),
                    step_number: def.step_number,
                    step_name: def.name.clone(),
                },
            );
            instance.set_working_directory(options.working_directory.clone());
            instance.set_external_connections(options.external_connections.clone());

            let outcome = instance.run().and_then(|summary| {
                self.store
                    .update_step_execution_status(step_execution_id, ExecutionStatus::Finished)?;
                Ok(summary)
            });
            match outcome {
                Ok(summary) => {
                    info!(
                        pipeline = %pipeline.name,
                        step_number = def.step_number,
                        step_name = %def.name,
                        records_read = summary.records_read,
                        records_written = summary.records_written,
                        "step finished"
                    );
                    reports.push(StepRunReport {
                        step_number: def.step_number,
                        step_name: def.name,
                        class_name: def.class_name,
                        step_execution_id,
                        summary,
                    });
                }
                Err(source) => {
                    error!(
                        pipeline = %pipeline.name,
                        step_number = def.step_number,
                        step_name = %def.name,
                        class_name = %def.class_name,
                        error = %source,
                        "step failed"
                    );
                    record_failure(
                        self.store
                            .update_step_execution_status(step_execution_id, ExecutionStatus::Failed),
                        "step execution",
                    );
                    record_failure(
                        self.store
                            .update_pipeline_job_status(pipeline_job_id, ExecutionStatus::Failed),
                        "pipeline job",
                    );
                    return Err(PipelineError::StepExecution {
                        pipeline: pipeline.name,
                        step_number: def.step_number,
                        step_name: def.name,
                        class_name: def.class_name,
                        source: Box::new(source),
                    });
                }
            }
        }

        self.store
            .update_pipeline_job_status(pipeline_job_id, ExecutionStatus::Finished)?;
        Ok(PipelineRunReport {
            pipeline: pipeline.name,
            pipeline_job_id,
            steps: reports,
        })
    }

    fn start_step(
        &self,
        pipeline_job_id: PipelineJobId,
        def: &StepDefRecord,
    ) -> PipelineResult<StepExecutionId> {
        let step_execution_id = self.store.insert_step_execution(pipeline_job_id, def.id)?;
        self.store
            .update_step_execution_status(step_execution_id, ExecutionStatus::Started)?;
        debug!(
            step_execution_id = %step_execution_id,
            step_number = def.step_number,
            class_name = %def.class_name,
            "step started"
        );
        Ok(step_execution_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ArchiveReport {
    pub pipeline: String,
    pub step_executions: usize,
    pub records: usize,
}

/// Moves the output of finished pipeline jobs into the archive table.
pub struct ArchivalManager<'a> {
    store: &'a dyn PipelineStore,
}

impl<'a> ArchivalManager<'a> {
    #[must_use]
    pub fn new(store: &'a dyn PipelineStore) -> Self {
        Self { store }
    }

    /// Archive every not-yet-archived step execution of the named pipeline's finished
    /// pipeline jobs, optionally only those whose step number is in `step_numbers`.
    ///
    /// # Errors
    /// `Configuration` for unknown pipelines, `Store` when a move fails (nothing is
    /// archived in that case).
    pub fn archive_steps(
        &self,
        pipeline_name: &str,
        step_numbers: Option<&BTreeSet<i64>>,
    ) -> PipelineResult<ArchiveReport> {
        let pipeline = find_pipeline(self.store, pipeline_name)?;
        in_transaction(self.store, || {
            let candidates = self
                .store
                .archivable_step_executions(pipeline.id, step_numbers)?;
            let mut report = ArchiveReport {
                pipeline: pipeline.name.clone(),
                ..ArchiveReport::default()
            };
            for candidate in &candidates {
                let moved = self
                    .store
                    .archive_step_execution(candidate.step_execution_id)?;
                debug!(
                    step_execution_id = %candidate.step_execution_id,
                    step_number = candidate.step_number,
                    records = moved,
                    "archived step execution"
                );
                report.step_executions += 1;
                report.records += moved;
            }
            info!(
                pipeline = %pipeline.name,
                step_executions = report.step_executions,
                records = report.records,
                "archived pipeline output"
            );
            Ok(report)
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub pipeline_name: String,
    /// Defaults to the most recent finished job of the pipeline.
    pub job_id: Option<JobId>,
    /// Defaults to the pipeline's last step.
    pub step_number: Option<i64>,
    pub directory: PathBuf,
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportReport {
    pub path: PathBuf,
    pub job_id: JobId,
    pub step_number: i64,
    pub records: usize,
}

/// Write the data of one step's live records to
/// `{directory}/{pipeline}__{step_number}__{job_id}.json`.
///
/// # Errors
/// `Configuration` when the pipeline, job or step cannot be found, `Io` when the file
/// cannot be written.
pub fn export_step_records(
    store: &dyn PipelineStore,
    request: &ExportRequest,
) -> PipelineResult<ExportReport> {
    let pipeline = find_pipeline(store, &request.pipeline_name)?;
    let pipeline_job = match request.job_id {
        Some(job_id) => store.latest_pipeline_job(pipeline.id, Some(job_id))?,
        None => store.latest_finished_pipeline_job(pipeline.id)?,
    };
    let pipeline_job = pipeline_job.ok_or_else(|| {
        PipelineError::configuration(format!(
            "pipeline '{}' has no matching job",
            pipeline.name
        ))
    })?;
    let step_number = match request.step_number {
        Some(step_number) => step_number,
        None => store
            .list_step_defs(pipeline.id)?
            .iter()
            .map(|def| def.step_number)
            .max()
            .ok_or_else(|| {
                PipelineError::configuration(format!("pipeline '{}' has no steps", pipeline.name))
            })?,
    };

    let values: Vec<Value> = store
        .fetch_step_records(pipeline_job.id, step_number)?
        .into_iter()
        .map(|row| row.data)
        .collect();
    let path = request.directory.join(format!(
        "{}__{}__{}.json",
        pipeline.name, step_number, pipeline_job.job_id
    ));
    write_json_file(&path, &values, request.format)?;
    info!(file = %path.display(), records = values.len(), "exported step records");
    Ok(ExportReport {
        path,
        job_id: pipeline_job.job_id,
        step_number,
        records: values.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dets_domain::{ExternalConnection, PipelineId, StepCategory};
    use dets_pipeline::parse_definition_json;
    use dets_steps::{LocalExtensions, StepClass, COALESCE, LOAD};
    use dets_store_sqlite::SqlitePipelineStore;
    use serde_json::json;
    use std::fs;
    use std::path::Path;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dets-runner-{name}-{}", ulid::Ulid::new()));
        must(fs::create_dir_all(&dir));
        dir
    }

    fn definition(steps: &Value) -> PipelineDefinitionEnvelope {
        must(parse_definition_json(&steps.to_string()))
    }

    fn load_coalesce() -> PipelineDefinitionEnvelope {
        definition(&json!([
            {"step_number": 1, "name": "load", "data_transformation_class": LOAD,
             "parameters": {"file_name": "input.csv", "file_type": "csv", "common_id_field_name": "id"}},
            {"step_number": 2, "name": "group", "data_transformation_class": COALESCE,
             "parameters": {"step_number": 1}}
        ]))
    }

    fn options(dir: &Path) -> JobOptions {
        JobOptions {
            working_directory: dir.to_path_buf(),
            ..JobOptions::default()
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn step_output(
        store: &SqlitePipelineStore,
        pipeline_id: PipelineId,
        step_number: i64,
    ) -> Vec<dets_domain::RecordRow> {
        let pipeline_job = must(store.latest_pipeline_job(pipeline_id, None))
            .unwrap_or_else(|| unreachable!("pipeline has a job"));
        must(store.fetch_step_records(pipeline_job.id, step_number))
    }

    #[test]
    fn csv_rows_with_distinct_ids_stay_separate_groups() {
        let dir = temp_dir("scenario");
        must(fs::write(dir.join("input.csv"), "id,val\n1,a\n2,b\n"));
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        let loaded = must(PipelineLoader::new(&store, &catalog).load_pipeline("csv", &load_coalesce()));
        assert_eq!(loaded.step_count, 2);

        let report = must(JobRunner::new(&store, &catalog).run_job(&names(&["csv"]), &options(&dir)));
        assert_eq!(report.status, ExecutionStatus::Finished);
        assert_eq!(report.job_name, "csv");
        assert_eq!(report.pipelines[0].steps[0].summary, StepSummary::new(2, 2));

        let rows = step_output(&store, loaded.pipeline.id, 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].data, json!([{"id": "1", "val": "a"}]));
        assert_eq!(rows[1].data, json!([{"id": "2", "val": "b"}]));

        let job = must(store.get_job(report.job_id)).unwrap_or_else(|| unreachable!("job row"));
        assert_eq!(job.status, ExecutionStatus::Finished);
        assert!(job.is_latest);
        let executions = must(store.list_step_executions(report.pipelines[0].pipeline_job_id));
        assert!(executions
            .iter()
            .all(|execution| execution.status == ExecutionStatus::Finished));
    }

    #[test]
    fn merge_keeps_every_anchor_row() {
        let dir = temp_dir("merge");
        must(fs::write(dir.join("people.csv"), "id,name\n1,ada\n2,bob\n3,cy\n"));
        must(fs::write(dir.join("balances.csv"), "id,balance\n2,10\n9,5\n"));
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        let loaded = must(PipelineLoader::new(&store, &catalog).load_pipeline(
            "merge",
            &definition(&json!([
                {"step_number": 1, "name": "people", "data_transformation_class": "Load",
                 "parameters": {"file_name": "people.csv", "common_id_field_name": "id"}},
                {"step_number": 2, "name": "balances", "data_transformation_class": "Load",
                 "parameters": {"file_name": "balances.csv", "common_id_field_name": "id"}},
                {"step_number": 3, "name": "join", "data_transformation_class": "Merge",
                 "parameters": {"inputs": [{"step_number": 1},
                                           {"step_number": 2, "field_name": "account"}]}}
            ])),
        ));
        must(JobRunner::new(&store, &catalog).run_job(&names(&["merge"]), &options(&dir)));

        let rows = step_output(&store, loaded.pipeline.id, 3);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].data, json!({"id": "1", "name": "ada"}));
        assert_eq!(
            rows[1].data,
            json!({"id": "2", "name": "bob", "account": {"id": "2", "balance": "10"}})
        );
        assert_eq!(rows[2].data, json!({"id": "3", "name": "cy"}));
    }

    #[test]
    fn failed_step_rolls_back_the_whole_job() {
        let dir = temp_dir("rollback");
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        must(PipelineLoader::new(&store, &catalog).load_pipeline("csv", &load_coalesce()));

        let result = JobRunner::new(&store, &catalog).run_job(&names(&["csv"]), &options(&dir));
        match result {
            Err(PipelineError::StepExecution {
                step_number,
                class_name,
                source,
                ..
            }) => {
                assert_eq!(step_number, 1);
                assert_eq!(class_name, LOAD);
                assert!(matches!(*source, PipelineError::Io(_)));
            }
            other => panic!("expected step failure, got {other:?}"),
        }
        assert!(must(store.list_jobs()).is_empty());
    }

    #[test]
    fn debug_mode_commits_failed_state() {
        let dir = temp_dir("debug");
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        let loaded = must(PipelineLoader::new(&store, &catalog).load_pipeline("csv", &load_coalesce()));

        let mut debug = options(&dir);
        debug.debug = true;
        assert!(JobRunner::new(&store, &catalog)
            .run_job(&names(&["csv"]), &debug)
            .is_err());

        let jobs = must(store.list_jobs());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, ExecutionStatus::Failed);
        assert!(!jobs[0].is_latest);
        let pipeline_job = must(store.latest_pipeline_job(loaded.pipeline.id, None))
            .unwrap_or_else(|| unreachable!("pipeline job row"));
        assert_eq!(pipeline_job.status, ExecutionStatus::Failed);
        let executions = must(store.list_step_executions(pipeline_job.id));
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
    }

    #[test]
    fn unresolvable_steps_never_create_a_job() {
        fn refuse(_: &Value, _: &Catalog) -> PipelineResult<Box<dyn dets_steps::DataTransformation>> {
            Err(PipelineError::upstream("not runnable here"))
        }

        let store = must(SqlitePipelineStore::open_in_memory());
        let builtins = Catalog::with_builtins();
        let unknown = PipelineLoader::new(&store, &builtins).load_pipeline(
            "bad",
            &definition(&json!([{"step_number": 1, "name": "x",
                                 "data_transformation_class": "Teleport"}])),
        );
        assert!(matches!(unknown, Err(PipelineError::Configuration(_))));
        assert!(must(store.list_pipelines()).is_empty());

        let extended = Catalog::with_local_extensions(LocalExtensions {
            steps: vec![(
                "Custom".to_string(),
                StepClass {
                    category: StepCategory::Transform,
                    factory: refuse,
                },
            )],
            ..LocalExtensions::default()
        });
        let stored = PipelineLoader::new(&store, &extended).load_pipeline(
            "custom",
            &definition(&json!([{"step_number": 1, "name": "x",
                                 "data_transformation_class": "Custom"}])),
        );
        assert!(matches!(stored, Err(PipelineError::UpstreamData(_))));

        let missing = JobRunner::new(&store, &builtins).run_job(&names(&["absent"]), &JobOptions::default());
        assert!(matches!(missing, Err(PipelineError::Configuration(_))));
        assert!(must(store.list_jobs()).is_empty());
    }

    #[test]
    fn reload_under_fresh_name_matches_step_defs_and_hash() {
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        let loader = PipelineLoader::new(&store, &catalog);
        let first = must(loader.load_pipeline("first", &load_coalesce()));
        let second = must(loader.load_pipeline("second", &load_coalesce()));
        assert_eq!(first.pipeline.definition_hash, second.pipeline.definition_hash);

        let strip = |pipeline_id: PipelineId| -> Vec<(i64, String, String, Value)> {
            must(store.list_step_defs(pipeline_id))
                .into_iter()
                .map(|def| (def.step_number, def.name, def.class_name, def.parameters))
                .collect()
        };
        assert_eq!(strip(first.pipeline.id), strip(second.pipeline.id));
        assert_eq!(strip(first.pipeline.id).len(), 2);

        let duplicate = loader.load_pipeline("first", &load_coalesce());
        assert!(matches!(duplicate, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn update_retires_previous_version_under_timestamped_name() {
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        let loader = PipelineLoader::new(&store, &catalog);
        let original = must(loader.load_pipeline("scores", &load_coalesce()));

        let updated = must(loader.update_pipeline(
            "scores",
            &definition(&json!([{"step_number": 1, "name": "load",
                                 "data_transformation_class": "Load",
                                 "parameters": {"file_name": "other.csv", "common_id_field_name": "id"}}])),
        ));
        let retired = updated
            .retired_as
            .clone()
            .unwrap_or_else(|| unreachable!("previous version existed"));
        assert!(retired.starts_with("scores__"));
        assert_ne!(updated.pipeline.id, original.pipeline.id);

        let old = must(store.find_pipeline(&retired)).unwrap_or_else(|| unreachable!("renamed"));
        assert_eq!(old.id, original.pipeline.id);
        assert_eq!(must(store.list_step_defs(old.id)).len(), 2);
        assert_eq!(must(store.list_step_defs(updated.pipeline.id)).len(), 1);
    }

    #[test]
    fn archive_then_rerun_never_duplicates() {
        let dir = temp_dir("archive");
        must(fs::write(dir.join("input.csv"), "id,val\n1,a\n2,b\n1,c\n"));
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        let loaded = must(PipelineLoader::new(&store, &catalog).load_pipeline("csv", &load_coalesce()));
        let runner = JobRunner::new(&store, &catalog);
        let archival = ArchivalManager::new(&store);

        must(runner.run_job(&names(&["csv"]), &options(&dir)));
        let live = must(store.count_records(loaded.pipeline.id));
        assert_eq!(live, 5);

        let only_loads = BTreeSet::from([1]);
        let partial = must(archival.archive_steps("csv", Some(&only_loads)));
        assert_eq!(partial.records, 3);
        assert_eq!(must(store.count_records(loaded.pipeline.id)), 2);

        let rest = must(archival.archive_steps("csv", None));
        assert_eq!(rest.step_executions, 1);
        assert_eq!(must(store.count_records(loaded.pipeline.id)), 0);
        assert_eq!(must(store.count_archived_records(loaded.pipeline.id)), live);

        must(runner.run_job(&names(&["csv"]), &options(&dir)));
        must(archival.archive_steps("csv", None));
        assert_eq!(must(archival.archive_steps("csv", None)).records, 0);
        assert_eq!(must(store.count_archived_records(loaded.pipeline.id)), live * 2);
    }

    #[test]
    fn latest_flag_follows_the_newest_run_of_a_job_name() {
        let dir = temp_dir("latest");
        must(fs::write(dir.join("input.csv"), "id,val\n1,a\n"));
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        must(PipelineLoader::new(&store, &catalog).load_pipeline("csv", &load_coalesce()));
        let runner = JobRunner::new(&store, &catalog);
        let mut nightly = options(&dir);
        nightly.job_name = Some("nightly".to_string());

        let first = must(runner.run_job(&names(&["csv"]), &nightly));
        let second = must(runner.run_job(&names(&["csv"]), &nightly));
        let first_job = must(store.get_job(first.job_id)).unwrap_or_else(|| unreachable!("job"));
        let second_job = must(store.get_job(second.job_id)).unwrap_or_else(|| unreachable!("job"));
        assert!(!first_job.is_latest);
        assert!(second_job.is_latest);
    }

    #[test]
    fn one_job_spans_several_pipelines() {
        let dir = temp_dir("multi");
        must(fs::write(dir.join("input.csv"), "id,val\n1,a\n"));
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        let loader = PipelineLoader::new(&store, &catalog);
        must(loader.load_pipeline("a", &load_coalesce()));
        must(loader.load_pipeline("b", &load_coalesce()));

        let report = must(JobRunner::new(&store, &catalog).run_job(&names(&["a", "b"]), &options(&dir)));
        assert_eq!(report.job_name, "a,b");
        let pipeline_jobs = must(store.list_pipeline_jobs(report.job_id));
        assert_eq!(pipeline_jobs.len(), 2);
        assert!(pipeline_jobs
            .iter()
            .all(|pipeline_job| pipeline_job.status == ExecutionStatus::Finished));
    }

    #[test]
    fn load_query_reads_injected_connection() {
        let dir = temp_dir("query");
        {
            let warehouse = must(SqlitePipelineStore::open(&dir.join("warehouse.sqlite3")));
            must(warehouse.migrate());
            must(warehouse.insert_pipeline("seeded", None));
        }
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        let loaded = must(PipelineLoader::new(&store, &catalog).load_pipeline(
            "query",
            &definition(&json!([{"step_number": 1, "name": "pull",
                                 "data_transformation_class": "LoadQuery",
                                 "parameters": {"connection": "warehouse",
                                                "query": "SELECT name FROM pipelines ORDER BY id",
                                                "common_id_field_name": "name"}}])),
        ));
        let mut query_options = options(&dir);
        query_options.external_connections.insert(
            "warehouse".to_string(),
            ExternalConnection::Sqlite {
                path: "warehouse.sqlite3".into(),
            },
        );
        must(JobRunner::new(&store, &catalog).run_job(&names(&["query"]), &query_options));
        let rows = step_output(&store, loaded.pipeline.id, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].common_id.as_deref(), Some("seeded"));
        assert_eq!(rows[0].data, json!({"name": "seeded"}));
    }

    #[test]
    fn empty_upstream_fails_the_job() {
        let dir = temp_dir("empty-upstream");
        must(fs::write(dir.join("input.csv"), "id,val\n"));
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        let loaded = must(PipelineLoader::new(&store, &catalog).load_pipeline("csv", &load_coalesce()));

        let result = JobRunner::new(&store, &catalog).run_job(&names(&["csv"]), &options(&dir));
        match result {
            Err(PipelineError::StepExecution {
                step_number,
                class_name,
                source,
                ..
            }) => {
                assert_eq!(step_number, 2);
                assert_eq!(class_name, COALESCE);
                assert!(matches!(*source, PipelineError::UpstreamData(_)));
            }
            other => panic!("expected step failure, got {other:?}"),
        }
        assert!(must(store.list_jobs()).is_empty());

        let mut debug = options(&dir);
        debug.debug = true;
        assert!(JobRunner::new(&store, &catalog)
            .run_job(&names(&["csv"]), &debug)
            .is_err());
        let jobs = must(store.list_jobs());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, ExecutionStatus::Failed);
        let pipeline_job = must(store.latest_pipeline_job(loaded.pipeline.id, None))
            .unwrap_or_else(|| unreachable!("pipeline job row"));
        let executions = must(store.list_step_executions(pipeline_job.id));
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].status, ExecutionStatus::Finished);
        assert_eq!(executions[1].status, ExecutionStatus::Failed);
    }

    #[test]
    fn export_skips_failed_debug_runs() {
        let dir = temp_dir("export-failed");
        must(fs::write(dir.join("input.csv"), "id,val\n1,a\n2,b\n"));
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        must(PipelineLoader::new(&store, &catalog).load_pipeline("csv", &load_coalesce()));
        let finished = must(JobRunner::new(&store, &catalog).run_job(&names(&["csv"]), &options(&dir)));

        must(fs::write(dir.join("input.csv"), "id,val\n"));
        let mut debug = options(&dir);
        debug.debug = true;
        assert!(JobRunner::new(&store, &catalog)
            .run_job(&names(&["csv"]), &debug)
            .is_err());

        let exported = must(export_step_records(
            &store,
            &ExportRequest {
                pipeline_name: "csv".to_string(),
                job_id: None,
                step_number: None,
                directory: dir.clone(),
                format: OutputFormat::JsonArray,
            },
        ));
        assert_eq!(exported.job_id, finished.job_id);
        assert_eq!(exported.records, 2);
    }

    #[test]
    fn export_defaults_to_latest_job_and_last_step() {
        let dir = temp_dir("export");
        must(fs::write(dir.join("input.csv"), "id,val\n1,a\n2,b\n"));
        let store = must(SqlitePipelineStore::open_in_memory());
        let catalog = Catalog::with_builtins();
        must(PipelineLoader::new(&store, &catalog).load_pipeline("csv", &load_coalesce()));
        let report = must(JobRunner::new(&store, &catalog).run_job(&names(&["csv"]), &options(&dir)));

        let exported = must(export_step_records(
            &store,
            &ExportRequest {
                pipeline_name: "csv".to_string(),
                job_id: None,
                step_number: None,
                directory: dir.clone(),
                format: OutputFormat::JsonLines,
            },
        ));
        assert_eq!(exported.step_number, 2);
        assert_eq!(exported.job_id, report.job_id);
        assert_eq!(exported.records, 2);
        assert_eq!(
            exported.path,
            dir.join(format!("csv__2__{}.json", report.job_id))
        );
        let content = must(fs::read_to_string(&exported.path));
        assert_eq!(content.lines().count(), 2);
    }
}
