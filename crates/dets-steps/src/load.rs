use std::fs::File;

use dets_domain::{ExternalConnection, NewRecord, PipelineError, PipelineResult};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};

use crate::{
    parse_parameters, Catalog, DataTransformation, StepRuntime, StepSummary, LOAD, LOAD_QUERY,
};

/// Reads a delimited text file with a header row; one record per row.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Load {
    pub file_name: String,
    #[serde(default = "default_file_type")]
    pub file_type: String,
    pub common_id_field_name: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_file_type() -> String {
    "csv".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

pub(crate) fn build_load(
    parameters: &Value,
    _: &Catalog,
) -> PipelineResult<Box<dyn DataTransformation>> {
    let step: Load = parse_parameters(LOAD, parameters)?;
    step.delimiter_byte()?;
    Ok(Box::new(step))
}

impl Load {
    fn delimiter_byte(&self) -> PipelineResult<u8> {
        match self.delimiter.as_bytes() {
            [byte] => Ok(*byte),
            _ => Err(PipelineError::configuration(format!(
                "delimiter must be a single byte, got {:?}",
                self.delimiter
            ))),
        }
    }

    fn effective_delimiter(&self) -> PipelineResult<u8> {
        match self.file_type.to_ascii_lowercase().as_str() {
            "csv" | "txt" => self.delimiter_byte(),
            "tsv" => Ok(b'\t'),
            other => Err(PipelineError::upstream(format!(
                "unsupported file type '{other}' for {}",
                self.file_name
            ))),
        }
    }
}

impl DataTransformation for Load {
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary> {
        let delimiter = self.effective_delimiter()?;
        let path = runtime.resolve_path(&self.file_name);
        let file = File::open(&path).map_err(|err| {
            PipelineError::io(format!("failed to open {}: {err}", path.display()))
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(file);
        let headers = reader
            .headers()
            .map_err(|err| PipelineError::io(format!("failed to read header row: {err}")))?
            .clone();
        let key_index = headers
            .iter()
            .position(|header| header == self.common_id_field_name)
            .ok_or_else(|| {
                PipelineError::upstream(format!(
                    "common id field '{}' is not a column of {}",
                    self.common_id_field_name,
                    path.display()
                ))
            })?;

        let mut records = Vec::new();
        for (row, result) in reader.records().enumerate() {
            let row_values = result.map_err(|err| {
                PipelineError::io(format!("failed to read row {row} of {}: {err}", path.display()))
            })?;
            let mut data = Map::new();
            for (header, value) in headers.iter().zip(row_values.iter()) {
                data.insert(header.to_string(), Value::String(value.to_string()));
            }
            let common_id = row_values.get(key_index).map(str::to_string);
            records.push(NewRecord::new(
                Value::Object(data),
                Some(json!({"row": row})),
                common_id,
            ));
        }

        let written = runtime.emit(&records)?;
        tracing::debug!(file = %path.display(), rows = written, "loaded delimited file");
        Ok(StepSummary::new(records.len(), written))
    }
}

/// Runs a query against a named external `SQLite` connection; one record per row.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadQuery {
    pub connection: String,
    pub query: String,
    #[serde(default)]
    pub common_id_field_name: Option<String>,
}

pub(crate) fn build_load_query(
    parameters: &Value,
    _: &Catalog,
) -> PipelineResult<Box<dyn DataTransformation>> {
    let step: LoadQuery = parse_parameters(LOAD_QUERY, parameters)?;
    if step.query.trim().is_empty() {
        return Err(PipelineError::configuration("LoadQuery requires a query"));
    }
    Ok(Box::new(step))
}

impl DataTransformation for LoadQuery {
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary> {
        let connection = runtime
            .external_connections
            .get(&self.connection)
            .ok_or_else(|| {
                PipelineError::configuration(format!(
                    "external connection '{}' is not configured",
                    self.connection
                ))
            })?;
        let ExternalConnection::Sqlite { path } = connection;
        let path = if path.is_absolute() {
            path.clone()
        } else {
            runtime.working_directory.join(path)
        };
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|err| {
                PipelineError::io(format!(
                    "failed to open external connection '{}' at {}: {err}",
                    self.connection,
                    path.display()
                ))
            })?;

        let records = self.query_records(&conn)?;
        let written = runtime.emit(&records)?;
        tracing::debug!(connection = %self.connection, rows = written, "loaded query rows");
        Ok(StepSummary::new(records.len(), written))
    }
}

impl LoadQuery {
    fn query_records(&self, conn: &Connection) -> PipelineResult<Vec<NewRecord>> {
        let io_error = |err: rusqlite::Error| {
            PipelineError::io(format!(
                "query against '{}' failed: {err}",
                self.connection
            ))
        };
        let mut stmt = conn.prepare(&self.query).map_err(io_error)?;
        let columns: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
        if let Some(field) = &self.common_id_field_name {
            if !columns.iter().any(|column| column == field) {
                return Err(PipelineError::upstream(format!(
                    "common id field '{field}' is not a column of the query result"
                )));
            }
        }

        let mut rows = stmt.query([]).map_err(io_error)?;
        let mut records = Vec::new();
        let mut row_index = 0usize;
        while let Some(row) = rows.next().map_err(io_error)? {
            let mut data = Map::new();
            for (index, column) in columns.iter().enumerate() {
                let value = row.get_ref(index).map_err(io_error)?;
                data.insert(column.clone(), sql_value_to_json(value));
            }
            let common_id = self
                .common_id_field_name
                .as_ref()
                .and_then(|field| data.get(field))
                .and_then(dets_domain::value_as_key);
            records.push(NewRecord::new(
                Value::Object(data),
                Some(json!({"row": row_index, "connection": self.connection})),
                common_id,
            ));
            row_index += 1;
        }
        Ok(records)
    }
}

fn sql_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::Number(number.into()),
        ValueRef::Real(number) => Number::from_f64(number).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).to_string()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}
