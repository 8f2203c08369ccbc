#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use dets_domain::{
    format_rfc3339, now_utc, parse_rfc3339, ArchivedRecordRow, ExecutionStatus, JobId, JobRecord,
    NewRecord, NewStepDef, PipelineId, PipelineJobId, PipelineJobRecord, PipelineRecord, RecordId,
    RecordRow, StepCategory, StepClassId, StepDefId, StepDefRecord, StepExecutionId,
    StepExecutionRecord,
};
use dets_store_core::{ArchivableStep, PipelineStore};
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;

const STORE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_statuses (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE
);

INSERT OR IGNORE INTO job_statuses(id, name) VALUES
  (1, 'Started'),
  (2, 'Finished'),
  (3, 'Not started'),
  (4, 'Failed');

CREATE TABLE IF NOT EXISTS jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  status_id INTEGER NOT NULL,
  start_time TEXT,
  end_time TEXT,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0,1)),
  is_latest INTEGER NOT NULL DEFAULT 0 CHECK (is_latest IN (0,1)),
  FOREIGN KEY (status_id) REFERENCES job_statuses(id)
);

CREATE TABLE IF NOT EXISTS pipelines (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  definition_hash TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  job_id INTEGER NOT NULL,
  pipeline_id INTEGER NOT NULL,
  status_id INTEGER NOT NULL,
  start_time TEXT,
  end_time TEXT,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0,1)),
  UNIQUE(job_id, pipeline_id),
  FOREIGN KEY (job_id) REFERENCES jobs(id),
  FOREIGN KEY (pipeline_id) REFERENCES pipelines(id),
  FOREIGN KEY (status_id) REFERENCES job_statuses(id)
);

CREATE TABLE IF NOT EXISTS data_transformation_step_classes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  parent_id INTEGER,
  FOREIGN KEY (parent_id) REFERENCES data_transformation_step_classes(id)
);

CREATE TABLE IF NOT EXISTS data_transformation_steps (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  pipeline_id INTEGER NOT NULL,
  step_number INTEGER NOT NULL,
  name TEXT NOT NULL,
  class_id INTEGER NOT NULL,
  parameters TEXT NOT NULL,
  description TEXT,
  UNIQUE(pipeline_id, step_number, name),
  FOREIGN KEY (pipeline_id) REFERENCES pipelines(id),
  FOREIGN KEY (class_id) REFERENCES data_transformation_step_classes(id)
);

CREATE TABLE IF NOT EXISTS pipeline_jobs_data_transformation_steps (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  pipeline_job_id INTEGER NOT NULL,
  data_transformation_step_id INTEGER NOT NULL,
  status_id INTEGER NOT NULL,
  start_time TEXT,
  end_time TEXT,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0,1)),
  is_archived INTEGER NOT NULL DEFAULT 0 CHECK (is_archived IN (0,1)),
  is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0,1)),
  FOREIGN KEY (pipeline_job_id) REFERENCES pipeline_jobs(id),
  FOREIGN KEY (data_transformation_step_id) REFERENCES data_transformation_steps(id),
  FOREIGN KEY (status_id) REFERENCES job_statuses(id)
);

CREATE TABLE IF NOT EXISTS data_transformations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  data TEXT NOT NULL,
  meta TEXT,
  common_id TEXT,
  pipeline_job_data_transformation_step_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (pipeline_job_data_transformation_step_id)
    REFERENCES pipeline_jobs_data_transformation_steps(id)
);

CREATE INDEX IF NOT EXISTS idx_data_transformations_step_execution
  ON data_transformations(pipeline_job_data_transformation_step_id);

CREATE TABLE IF NOT EXISTS archived_data_transformations (
  id INTEGER PRIMARY KEY,
  data TEXT NOT NULL,
  meta TEXT,
  common_id TEXT,
  pipeline_job_data_transformation_step_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  archived_at TEXT NOT NULL,
  FOREIGN KEY (pipeline_job_data_transformation_step_id)
    REFERENCES pipeline_jobs_data_transformation_steps(id)
);

CREATE INDEX IF NOT EXISTS idx_archived_data_transformations_step_execution
  ON archived_data_transformations(pipeline_job_data_transformation_step_id);

CREATE TRIGGER IF NOT EXISTS trg_data_transformations_no_update
BEFORE UPDATE ON data_transformations
BEGIN
  SELECT RAISE(FAIL, 'data_transformations is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_archived_data_transformations_no_update
BEFORE UPDATE ON archived_data_transformations
BEGIN
  SELECT RAISE(FAIL, 'archived_data_transformations is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_archived_data_transformations_no_delete
BEFORE DELETE ON archived_data_transformations
BEGIN
  SELECT RAISE(FAIL, 'archived_data_transformations is append-only');
END;
";

const RECORD_COLUMNS: &str = "dt.id, dt.data, dt.meta, dt.common_id,
    dt.pipeline_job_data_transformation_step_id, dt.created_at";

/// Tables whose rows follow the job status lifecycle.
#[derive(Debug, Clone, Copy)]
enum StatusTable {
    Jobs,
    PipelineJobs,
    StepExecutions,
}

impl StatusTable {
    fn table(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::PipelineJobs => "pipeline_jobs",
            Self::StepExecutions => "pipeline_jobs_data_transformation_steps",
        }
    }
}

pub struct SqlitePipelineStore {
    conn: Connection,
}

impl SqlitePipelineStore {
    /// Open or create a `SQLite` pipeline database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open a private in-memory database, already migrated.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to configure sqlite pragmas")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn transition(&self, table: StatusTable, id: i64, status: ExecutionStatus) -> Result<()> {
        let now = format_rfc3339(now_utc())?;
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE {table} SET
                        status_id = ?2,
                        start_time = CASE WHEN ?2 = 1 AND start_time IS NULL THEN ?3 ELSE start_time END,
                        end_time = CASE WHEN ?2 IN (2, 4) THEN ?3 ELSE end_time END
                     WHERE id = ?1 AND status_id NOT IN (2, 4)",
                    table = table.table()
                ),
                params![id, status.status_id(), now],
            )
            .with_context(|| format!("failed to update {} status", table.table()))?;
        if changed > 0 {
            return Ok(());
        }

        let current: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT status_id FROM {} WHERE id = ?1", table.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {} status", table.table()))?;
        match current {
            None => Err(anyhow!("{} row {id} does not exist", table.table())),
            Some(current) => Err(anyhow!(
                "{} row {id} is already {} and cannot move to {}",
                table.table(),
                parse_status(current)?.as_str(),
                status.as_str()
            )),
        }
    }

    fn copy_and_delete_records(&self, step_execution_id: StepExecutionId) -> Result<usize> {
        let archived_at = format_rfc3339(now_utc())?;
        let copied = self
            .conn
            .execute(
                "INSERT INTO archived_data_transformations(
                    id, data, meta, common_id,
                    pipeline_job_data_transformation_step_id, created_at, archived_at
                 )
                 SELECT id, data, meta, common_id,
                        pipeline_job_data_transformation_step_id, created_at, ?2
                 FROM data_transformations
                 WHERE pipeline_job_data_transformation_step_id = ?1",
                params![step_execution_id.0, archived_at],
            )
            .context("failed to copy records into archive")?;

        let deleted = self
            .conn
            .execute(
                "DELETE FROM data_transformations
                 WHERE pipeline_job_data_transformation_step_id = ?1",
                params![step_execution_id.0],
            )
            .context("failed to delete archived records")?;
        if copied != deleted {
            return Err(anyhow!(
                "archive of step execution {step_execution_id} copied {copied} rows but deleted {deleted}"
            ));
        }

        self.conn
            .execute(
                "UPDATE pipeline_jobs_data_transformation_steps
                 SET is_archived = 1, is_deleted = 1
                 WHERE id = ?1",
                params![step_execution_id.0],
            )
            .context("failed to flag step execution archived")?;
        Ok(copied)
    }

    fn query_records(&self, sql: &str, id: i64, extra: Option<i64>) -> Result<Vec<RecordRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = match extra {
            Some(extra) => stmt.query(params![id, extra])?,
            None => stmt.query(params![id])?,
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(record_from_row(row)?);
        }
        Ok(out)
    }

    fn count(&self, sql: &str, pipeline_id: PipelineId) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(sql, params![pipeline_id.0], |row| row.get(0))
            .context("failed to count records")?;
        Ok(u64::try_from(count)?)
    }
}

impl PipelineStore for SqlitePipelineStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply pipeline schema")?;

        for category in StepCategory::ALL {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO data_transformation_step_classes(name, parent_id)
                     VALUES (?1, NULL)",
                    params![category.as_str()],
                )
                .context("failed to seed step class taxonomy")?;
        }

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STORE_SCHEMA_VERSION, now],
            )
            .context("failed to record pipeline store migration")?;

        Ok(())
    }

    fn begin_transaction(&self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN")
            .context("failed to begin transaction")
    }

    fn commit_transaction(&self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .context("failed to commit transaction")
    }

    fn rollback_transaction(&self) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .context("failed to roll back transaction")
    }

    fn upsert_step_class(&self, name: &str, parent: Option<&str>) -> Result<StepClassId> {
        let parent_id = match parent {
            Some(parent) if parent != name => Some(self.upsert_step_class(parent, None)?.0),
            _ => None,
        };
        self.conn
            .execute(
                "INSERT INTO data_transformation_step_classes(name, parent_id) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET
                    parent_id = COALESCE(excluded.parent_id, parent_id)",
                params![name, parent_id],
            )
            .with_context(|| format!("failed to upsert step class {name}"))?;
        let id: i64 = self
            .conn
            .query_row(
                "SELECT id FROM data_transformation_step_classes WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .context("failed to read step class id")?;
        Ok(StepClassId(id))
    }

    fn insert_pipeline(
        &self,
        name: &str,
        definition_hash: Option<&str>,
    ) -> Result<PipelineRecord> {
        let created_at = now_utc();
        self.conn
            .execute(
                "INSERT INTO pipelines(name, definition_hash, created_at) VALUES (?1, ?2, ?3)",
                params![name, definition_hash, format_rfc3339(created_at)?],
            )
            .with_context(|| format!("failed to insert pipeline {name}"))?;
        Ok(PipelineRecord {
            id: PipelineId(self.conn.last_insert_rowid()),
            name: name.to_string(),
            definition_hash: definition_hash.map(str::to_string),
            created_at,
        })
    }

    fn find_pipeline(&self, name: &str) -> Result<Option<PipelineRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, definition_hash, created_at FROM pipelines WHERE name = ?1",
        )?;
        let mut rows = stmt.query(params![name])?;
        match rows.next()? {
            Some(row) => Ok(Some(pipeline_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn rename_pipeline(&self, pipeline_id: PipelineId, new_name: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE pipelines SET name = ?2 WHERE id = ?1",
                params![pipeline_id.0, new_name],
            )
            .with_context(|| format!("failed to rename pipeline {pipeline_id} to {new_name}"))?;
        if changed == 0 {
            return Err(anyhow!("pipeline {pipeline_id} does not exist"));
        }
        Ok(())
    }

    fn list_pipelines(&self) -> Result<Vec<PipelineRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, definition_hash, created_at FROM pipelines ORDER BY name ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(pipeline_from_row(row)?);
        }
        Ok(out)
    }

    fn insert_step_def(&self, step_def: &NewStepDef) -> Result<StepDefId> {
        self.conn
            .execute(
                "INSERT INTO data_transformation_steps(
                    pipeline_id, step_number, name, class_id, parameters, description
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    step_def.pipeline_id.0,
                    step_def.step_number,
                    step_def.name,
                    step_def.class_id.0,
                    serde_json::to_string(&step_def.parameters)?,
                    step_def.description,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert step definition ({}, {})",
                    step_def.step_number, step_def.name
                )
            })?;
        Ok(StepDefId(self.conn.last_insert_rowid()))
    }

    fn list_step_defs(&self, pipeline_id: PipelineId) -> Result<Vec<StepDefRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT dts.id, dts.pipeline_id, dts.step_number, dts.name, c.name,
                    dts.parameters, dts.description
             FROM data_transformation_steps dts
             JOIN data_transformation_step_classes c ON c.id = dts.class_id
             WHERE dts.pipeline_id = ?1
             ORDER BY dts.step_number ASC, dts.name ASC",
        )?;
        let mut rows = stmt.query(params![pipeline_id.0])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let parameters: String = row.get(5)?;
            out.push(StepDefRecord {
                id: StepDefId(row.get(0)?),
                pipeline_id: PipelineId(row.get(1)?),
                step_number: row.get(2)?,
                name: row.get(3)?,
                class_name: row.get(4)?,
                parameters: serde_json::from_str(&parameters)
                    .context("invalid step parameters JSON")?,
                description: row.get(6)?,
            });
        }
        Ok(out)
    }

    fn insert_job(&self, name: &str) -> Result<JobRecord> {
        self.conn
            .execute(
                "INSERT INTO jobs(name, status_id, is_active, is_latest) VALUES (?1, ?2, 1, 0)",
                params![name, ExecutionStatus::NotStarted.status_id()],
            )
            .with_context(|| format!("failed to insert job {name}"))?;
        Ok(JobRecord {
            id: JobId(self.conn.last_insert_rowid()),
            name: name.to_string(),
            status: ExecutionStatus::NotStarted,
            started_at: None,
            ended_at: None,
            is_active: true,
            is_latest: false,
        })
    }

    fn update_job_status(&self, job_id: JobId, status: ExecutionStatus) -> Result<()> {
        self.transition(StatusTable::Jobs, job_id.0, status)
    }

    fn mark_job_latest(&self, job_id: JobId) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs
                 SET is_latest = CASE WHEN id = ?1 THEN 1 ELSE 0 END
                 WHERE name = (SELECT name FROM jobs WHERE id = ?1)",
                params![job_id.0],
            )
            .context("failed to mark job latest")?;
        if changed == 0 {
            return Err(anyhow!("job {job_id} does not exist"));
        }
        Ok(())
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, status_id, start_time, end_time, is_active, is_latest
             FROM jobs WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![job_id.0])?;
        match rows.next()? {
            Some(row) => Ok(Some(job_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, status_id, start_time, end_time, is_active, is_latest
             FROM jobs ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(job_from_row(row)?);
        }
        Ok(out)
    }

    fn insert_pipeline_job(
        &self,
        job_id: JobId,
        pipeline_id: PipelineId,
    ) -> Result<PipelineJobId> {
        self.conn
            .execute(
                "INSERT INTO pipeline_jobs(job_id, pipeline_id, status_id, is_active)
                 VALUES (?1, ?2, ?3, 1)",
                params![
                    job_id.0,
                    pipeline_id.0,
                    ExecutionStatus::NotStarted.status_id()
                ],
            )
            .with_context(|| {
                format!("failed to insert pipeline job for job {job_id} pipeline {pipeline_id}")
            })?;
        Ok(PipelineJobId(self.conn.last_insert_rowid()))
    }

    fn update_pipeline_job_status(
        &self,
        pipeline_job_id: PipelineJobId,
        status: ExecutionStatus,
    ) -> Result<()> {
        self.transition(StatusTable::PipelineJobs, pipeline_job_id.0, status)
    }

    fn list_pipeline_jobs(&self, job_id: JobId) -> Result<Vec<PipelineJobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_id, pipeline_id, status_id, start_time, end_time, is_active
             FROM pipeline_jobs WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![job_id.0])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(pipeline_job_from_row(row)?);
        }
        Ok(out)
    }

    fn latest_pipeline_job(
        &self,
        pipeline_id: PipelineId,
        job_id: Option<JobId>,
    ) -> Result<Option<PipelineJobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_id, pipeline_id, status_id, start_time, end_time, is_active
             FROM pipeline_jobs
             WHERE pipeline_id = ?1 AND (?2 IS NULL OR job_id = ?2)
             ORDER BY id DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query(params![pipeline_id.0, job_id.map(|id| id.0)])?;
        match rows.next()? {
            Some(row) => Ok(Some(pipeline_job_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn latest_finished_pipeline_job(
        &self,
        pipeline_id: PipelineId,
    ) -> Result<Option<PipelineJobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_id, pipeline_id, status_id, start_time, end_time, is_active
             FROM pipeline_jobs
             WHERE pipeline_id = ?1 AND status_id = ?2
             ORDER BY id DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query(params![
            pipeline_id.0,
            ExecutionStatus::Finished.status_id()
        ])?;
        match rows.next()? {
            Some(row) => Ok(Some(pipeline_job_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn insert_step_execution(
        &self,
        pipeline_job_id: PipelineJobId,
        step_def_id: StepDefId,
    ) -> Result<StepExecutionId> {
        self.conn
            .execute(
                "INSERT INTO pipeline_jobs_data_transformation_steps(
                    pipeline_job_id, data_transformation_step_id, status_id,
                    is_active, is_archived, is_deleted
                 ) VALUES (?1, ?2, ?3, 1, 0, 0)",
                params![
                    pipeline_job_id.0,
                    step_def_id.0,
                    ExecutionStatus::NotStarted.status_id()
                ],
            )
            .context("failed to insert step execution")?;
        Ok(StepExecutionId(self.conn.last_insert_rowid()))
    }

    fn update_step_execution_status(
        &self,
        step_execution_id: StepExecutionId,
        status: ExecutionStatus,
    ) -> Result<()> {
        self.transition(StatusTable::StepExecutions, step_execution_id.0, status)
    }

    fn list_step_executions(
        &self,
        pipeline_job_id: PipelineJobId,
    ) -> Result<Vec<StepExecutionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, pipeline_job_id, data_transformation_step_id, status_id,
                    start_time, end_time, is_active, is_archived, is_deleted
             FROM pipeline_jobs_data_transformation_steps
             WHERE pipeline_job_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![pipeline_job_id.0])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(StepExecutionRecord {
                id: StepExecutionId(row.get(0)?),
                pipeline_job_id: PipelineJobId(row.get(1)?),
                step_def_id: StepDefId(row.get(2)?),
                status: parse_status(row.get(3)?)?,
                started_at: optional_time(row.get(4)?)?,
                ended_at: optional_time(row.get(5)?)?,
                is_active: sql_to_bool(row.get(6)?),
                is_archived: sql_to_bool(row.get(7)?),
                is_deleted: sql_to_bool(row.get(8)?),
            });
        }
        Ok(out)
    }

    fn insert_records(
        &self,
        step_execution_id: StepExecutionId,
        records: &[NewRecord],
    ) -> Result<usize> {
        let created_at = format_rfc3339(now_utc())?;
        let mut stmt = self
            .conn
            .prepare(
                "INSERT INTO data_transformations(
                    data, meta, common_id, pipeline_job_data_transformation_step_id, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .context("failed to prepare record insert")?;
        for record in records {
            let meta = record.meta.as_ref().map(serde_json::to_string).transpose()?;
            stmt.execute(params![
                serde_json::to_string(&record.data)?,
                meta,
                record.common_id,
                step_execution_id.0,
                created_at,
            ])
            .with_context(|| format!("failed to insert record for step execution {step_execution_id}"))?;
        }
        Ok(records.len())
    }

    fn fetch_step_records(
        &self,
        pipeline_job_id: PipelineJobId,
        step_number: i64,
    ) -> Result<Vec<RecordRow>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS}
             FROM data_transformations dt
             JOIN pipeline_jobs_data_transformation_steps pjdts
               ON pjdts.id = dt.pipeline_job_data_transformation_step_id
             JOIN data_transformation_steps dts
               ON dts.id = pjdts.data_transformation_step_id
             WHERE pjdts.pipeline_job_id = ?1 AND dts.step_number = ?2
             ORDER BY dt.id ASC"
        );
        self.query_records(&sql, pipeline_job_id.0, Some(step_number))
            .with_context(|| {
                format!("failed to fetch records of step {step_number} in pipeline job {pipeline_job_id}")
            })
    }

    fn fetch_step_execution_records(
        &self,
        step_execution_id: StepExecutionId,
    ) -> Result<Vec<RecordRow>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS}
             FROM data_transformations dt
             WHERE dt.pipeline_job_data_transformation_step_id = ?1
             ORDER BY dt.id ASC"
        );
        self.query_records(&sql, step_execution_id.0, None)
            .with_context(|| format!("failed to fetch records of step execution {step_execution_id}"))
    }

    fn fetch_archived_records(
        &self,
        step_execution_id: StepExecutionId,
    ) -> Result<Vec<ArchivedRecordRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, data, meta, common_id, pipeline_job_data_transformation_step_id,
                    created_at, archived_at
             FROM archived_data_transformations
             WHERE pipeline_job_data_transformation_step_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![step_execution_id.0])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ArchivedRecordRow {
                record: record_from_row(row)?,
                archived_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
            });
        }
        Ok(out)
    }

    fn count_records(&self, pipeline_id: PipelineId) -> Result<u64> {
        self.count(
            "SELECT COUNT(*)
             FROM data_transformations dt
             JOIN pipeline_jobs_data_transformation_steps pjdts
               ON pjdts.id = dt.pipeline_job_data_transformation_step_id
             JOIN pipeline_jobs pj ON pj.id = pjdts.pipeline_job_id
             WHERE pj.pipeline_id = ?1",
            pipeline_id,
        )
    }

    fn count_archived_records(&self, pipeline_id: PipelineId) -> Result<u64> {
        self.count(
            "SELECT COUNT(*)
             FROM archived_data_transformations adt
             JOIN pipeline_jobs_data_transformation_steps pjdts
               ON pjdts.id = adt.pipeline_job_data_transformation_step_id
             JOIN pipeline_jobs pj ON pj.id = pjdts.pipeline_job_id
             WHERE pj.pipeline_id = ?1",
            pipeline_id,
        )
    }

    fn archivable_step_executions(
        &self,
        pipeline_id: PipelineId,
        step_numbers: Option<&BTreeSet<i64>>,
    ) -> Result<Vec<ArchivableStep>> {
        let mut stmt = self.conn.prepare(
            "SELECT pjdts.id, pjdts.pipeline_job_id, dts.step_number, dts.name
             FROM pipeline_jobs_data_transformation_steps pjdts
             JOIN pipeline_jobs pj ON pj.id = pjdts.pipeline_job_id
             JOIN data_transformation_steps dts ON dts.id = pjdts.data_transformation_step_id
             WHERE pj.pipeline_id = ?1
               AND pj.status_id = ?2
               AND pjdts.is_archived = 0
               AND pjdts.is_deleted = 0
             ORDER BY pjdts.id ASC",
        )?;
        let mut rows = stmt.query(params![
            pipeline_id.0,
            ExecutionStatus::Finished.status_id()
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let step_number: i64 = row.get(2)?;
            if step_numbers.is_some_and(|selected| !selected.contains(&step_number)) {
                continue;
            }
            out.push(ArchivableStep {
                step_execution_id: StepExecutionId(row.get(0)?),
                pipeline_job_id: PipelineJobId(row.get(1)?),
                step_number,
                step_name: row.get(3)?,
            });
        }
        Ok(out)
    }

    fn archive_step_execution(&self, step_execution_id: StepExecutionId) -> Result<usize> {
        self.conn
            .execute_batch("SAVEPOINT archive_step_execution")
            .context("failed to open archive savepoint")?;
        match self.copy_and_delete_records(step_execution_id) {
            Ok(moved) => {
                self.conn
                    .execute_batch("RELEASE SAVEPOINT archive_step_execution")
                    .context("failed to release archive savepoint")?;
                Ok(moved)
            }
            Err(err) => {
                if let Err(rollback_err) = self.conn.execute_batch(
                    "ROLLBACK TO SAVEPOINT archive_step_execution;
                     RELEASE SAVEPOINT archive_step_execution;",
                ) {
                    return Err(err.context(format!("archive rollback failed: {rollback_err}")));
                }
                Err(err)
            }
        }
    }
}

fn pipeline_from_row(row: &Row<'_>) -> Result<PipelineRecord> {
    Ok(PipelineRecord {
        id: PipelineId(row.get(0)?),
        name: row.get(1)?,
        definition_hash: row.get(2)?,
        created_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
    })
}

fn job_from_row(row: &Row<'_>) -> Result<JobRecord> {
    Ok(JobRecord {
        id: JobId(row.get(0)?),
        name: row.get(1)?,
        status: parse_status(row.get(2)?)?,
        started_at: optional_time(row.get(3)?)?,
        ended_at: optional_time(row.get(4)?)?,
        is_active: sql_to_bool(row.get(5)?),
        is_latest: sql_to_bool(row.get(6)?),
    })
}

fn pipeline_job_from_row(row: &Row<'_>) -> Result<PipelineJobRecord> {
    Ok(PipelineJobRecord {
        id: PipelineJobId(row.get(0)?),
        job_id: JobId(row.get(1)?),
        pipeline_id: PipelineId(row.get(2)?),
        status: parse_status(row.get(3)?)?,
        started_at: optional_time(row.get(4)?)?,
        ended_at: optional_time(row.get(5)?)?,
        is_active: sql_to_bool(row.get(6)?),
    })
}

fn record_from_row(row: &Row<'_>) -> Result<RecordRow> {
    let data: String = row.get(1)?;
    let meta: Option<String> = row.get(2)?;
    Ok(RecordRow {
        id: RecordId(row.get(0)?),
        data: serde_json::from_str(&data).context("invalid record data JSON")?,
        meta: meta
            .map(|value| serde_json::from_str(&value))
            .transpose()
            .context("invalid record meta JSON")?,
        common_id: row.get(3)?,
        step_execution_id: StepExecutionId(row.get(4)?),
        created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
    })
}

fn parse_status(value: i64) -> Result<ExecutionStatus> {
    ExecutionStatus::from_status_id(value).ok_or_else(|| anyhow!("unknown job status id: {value}"))
}

fn optional_time(value: Option<String>) -> Result<Option<OffsetDateTime>> {
    value.map(|raw| parse_rfc3339(&raw)).transpose()
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}
