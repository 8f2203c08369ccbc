#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use anyhow::Result;
use dets_domain::{
    ArchivedRecordRow, ExecutionStatus, JobId, JobRecord, NewRecord, NewStepDef, PipelineId,
    PipelineJobId, PipelineJobRecord, PipelineRecord, RecordRow, StepClassId, StepDefId,
    StepDefRecord, StepExecutionId, StepExecutionRecord,
};
use serde::{Deserialize, Serialize};

/// A finished step execution that still holds live records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivableStep {
    pub step_execution_id: StepExecutionId,
    pub pipeline_job_id: PipelineJobId,
    pub step_number: i64,
    pub step_name: String,
}

/// Persistence for pipelines, jobs, step executions and the records they produce.
///
/// Records are append-only; the only way they leave the live table is
/// [`PipelineStore::archive_step_execution`].
pub trait PipelineStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn begin_transaction(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn commit_transaction(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn rollback_transaction(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn upsert_step_class(&self, name: &str, parent: Option<&str>) -> Result<StepClassId>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_pipeline(&self, name: &str, definition_hash: Option<&str>)
        -> Result<PipelineRecord>;

    #[allow(clippy::missing_errors_doc)]
    fn find_pipeline(&self, name: &str) -> Result<Option<PipelineRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn rename_pipeline(&self, pipeline_id: PipelineId, new_name: &str) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_pipelines(&self) -> Result<Vec<PipelineRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_step_def(&self, step_def: &NewStepDef) -> Result<StepDefId>;

    /// Step definitions of one pipeline ordered by `(step_number, name)`.
    #[allow(clippy::missing_errors_doc)]
    fn list_step_defs(&self, pipeline_id: PipelineId) -> Result<Vec<StepDefRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_job(&self, name: &str) -> Result<JobRecord>;

    /// Moves a job to `status`. Terminal jobs reject further transitions.
    #[allow(clippy::missing_errors_doc)]
    fn update_job_status(&self, job_id: JobId, status: ExecutionStatus) -> Result<()>;

    /// Flags `job_id` as latest and clears the flag on other jobs with the same name.
    #[allow(clippy::missing_errors_doc)]
    fn mark_job_latest(&self, job_id: JobId) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_jobs(&self) -> Result<Vec<JobRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_pipeline_job(
        &self,
        job_id: JobId,
        pipeline_id: PipelineId,
    ) -> Result<PipelineJobId>;

    #[allow(clippy::missing_errors_doc)]
    fn update_pipeline_job_status(
        &self,
        pipeline_job_id: PipelineJobId,
        status: ExecutionStatus,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_pipeline_jobs(&self, job_id: JobId) -> Result<Vec<PipelineJobRecord>>;

    /// Most recent pipeline job of a pipeline, optionally restricted to one job.
    #[allow(clippy::missing_errors_doc)]
    fn latest_pipeline_job(
        &self,
        pipeline_id: PipelineId,
        job_id: Option<JobId>,
    ) -> Result<Option<PipelineJobRecord>>;

    /// Most recent pipeline job of a pipeline that reached `Finished`.
    #[allow(clippy::missing_errors_doc)]
    fn latest_finished_pipeline_job(
        &self,
        pipeline_id: PipelineId,
    ) -> Result<Option<PipelineJobRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_step_execution(
        &self,
        pipeline_job_id: PipelineJobId,
        step_def_id: StepDefId,
    ) -> Result<StepExecutionId>;

    #[allow(clippy::missing_errors_doc)]
    fn update_step_execution_status(
        &self,
        step_execution_id: StepExecutionId,
        status: ExecutionStatus,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_step_executions(
        &self,
        pipeline_job_id: PipelineJobId,
    ) -> Result<Vec<StepExecutionRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_records(
        &self,
        step_execution_id: StepExecutionId,
        records: &[NewRecord],
    ) -> Result<usize>;

    /// All live records produced by `step_number` within one pipeline job, ordered by id.
    #[allow(clippy::missing_errors_doc)]
    fn fetch_step_records(
        &self,
        pipeline_job_id: PipelineJobId,
        step_number: i64,
    ) -> Result<Vec<RecordRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn fetch_step_execution_records(
        &self,
        step_execution_id: StepExecutionId,
    ) -> Result<Vec<RecordRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn fetch_archived_records(
        &self,
        step_execution_id: StepExecutionId,
    ) -> Result<Vec<ArchivedRecordRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn count_records(&self, pipeline_id: PipelineId) -> Result<u64>;

    #[allow(clippy::missing_errors_doc)]
    fn count_archived_records(&self, pipeline_id: PipelineId) -> Result<u64>;

    /// Step executions of finished pipeline jobs that are neither archived nor deleted.
    #[allow(clippy::missing_errors_doc)]
    fn archivable_step_executions(
        &self,
        pipeline_id: PipelineId,
        step_numbers: Option<&BTreeSet<i64>>,
    ) -> Result<Vec<ArchivableStep>>;

    /// Copies the records of one step execution into the archive, deletes them from the
    /// live table and flags the execution archived and deleted, all or nothing.
    /// Returns the number of records moved.
    #[allow(clippy::missing_errors_doc)]
    fn archive_step_execution(&self, step_execution_id: StepExecutionId) -> Result<usize>;
}
