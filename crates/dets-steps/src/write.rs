use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;

use dets_domain::{PipelineError, PipelineResult};
use serde::Deserialize;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{parse_parameters, Catalog, DataTransformation, StepRuntime, StepSummary, WRITE};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OutputFormat {
    /// One pretty-printed array, keys sorted, four-space indent.
    JsonArray,
    /// One compact object per line.
    JsonLines,
}

impl OutputFormat {
    /// # Errors
    /// Returns `UpstreamData` for formats that have no writer.
    pub fn parse(file_type: &str) -> PipelineResult<Self> {
        match file_type.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::JsonArray),
            "json_lines" | "jsonl" | "ndjson" => Ok(Self::JsonLines),
            other => Err(PipelineError::upstream(format!(
                "unsupported output file type '{other}'"
            ))),
        }
    }
}

/// Recursively orders object keys.
#[must_use]
pub fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut entries: Vec<(String, Value)> = fields.into_iter().collect();
            entries.sort_by(|lhs, rhs| lhs.0.cmp(&rhs.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, sort_keys(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Serialize `values` to `path`, replacing any existing file.
///
/// # Errors
/// Returns `Io` when the file cannot be created or written.
pub fn write_json_file(path: &Path, values: &[Value], format: OutputFormat) -> PipelineResult<()> {
    let io_error =
        |err: std::io::Error| PipelineError::io(format!("failed to write {}: {err}", path.display()));
    let file = File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    match format {
        OutputFormat::JsonArray => {
            let sorted = Value::Array(values.iter().cloned().map(sort_keys).collect());
            let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
            let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
            sorted.serialize(&mut serializer).map_err(|err| {
                PipelineError::io(format!("failed to serialize {}: {err}", path.display()))
            })?;
            writer.write_all(b"\n").map_err(io_error)?;
        }
        OutputFormat::JsonLines => {
            for value in values {
                serde_json::to_writer(&mut writer, value).map_err(|err| {
                    PipelineError::io(format!("failed to serialize {}: {err}", path.display()))
                })?;
                writer.write_all(b"\n").map_err(io_error)?;
            }
        }
    }
    writer.flush().map_err(io_error)
}

/// Writes the data of every upstream record to a file under the working directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Write {
    pub step_number: i64,
    pub file_name: String,
    #[serde(default = "default_file_type")]
    pub file_type: String,
}

fn default_file_type() -> String {
    "json".to_string()
}

pub(crate) fn build(parameters: &Value, _: &Catalog) -> PipelineResult<Box<dyn DataTransformation>> {
    Ok(Box::new(parse_parameters::<Write>(WRITE, parameters)?))
}

impl DataTransformation for Write {
    fn run(&self, runtime: &StepRuntime<'_>) -> PipelineResult<StepSummary> {
        let format = OutputFormat::parse(&self.file_type)?;
        let upstream = runtime.upstream(self.step_number)?;
        let values: Vec<Value> = upstream.into_iter().map(|row| row.data).collect();
        let path = runtime.resolve_path(&self.file_name);
        write_json_file(&path, &values, format)?;
        tracing::info!(file = %path.display(), rows = values.len(), "wrote step output");
        Ok(StepSummary::new(values.len(), 0))
    }
}

#[cfg(test)]
mod tests {
    use super::{sort_keys, write_json_file, OutputFormat};
    use crate::test_support::{must, temp_dir, Harness};
    use crate::WRITE;
    use dets_domain::PipelineError;
    use serde_json::{json, Value};
    use std::fs;

    #[test]
    fn pretty_array_sorts_keys_with_four_space_indent() {
        let dir = temp_dir("write-array");
        let path = dir.join("out.json");
        must(write_json_file(
            &path,
            &[json!({"b": 1, "a": {"z": true, "y": null}})],
            OutputFormat::JsonArray,
        ));
        let content = must(fs::read_to_string(&path));
        assert_eq!(
            content,
            "[\n    {\n        \"a\": {\n            \"y\": null,\n            \"z\": true\n        },\n        \"b\": 1\n    }\n]\n"
        );
    }

    #[test]
    fn step_writes_json_lines_and_reports_no_records() {
        let dir = temp_dir("write-lines");
        let harness = Harness::new();
        harness.seed_values(1, &[(json!({"id": "1"}), Some("1")), (json!({"id": "2"}), Some("2"))]);
        let summary = must(harness.run(
            2,
            WRITE,
            &json!({"step_number": 1, "file_name": "out.jsonl", "file_type": "json_lines"}),
            Some(dir.as_path()),
        ));
        assert_eq!(summary.records_read, 2);
        assert_eq!(summary.records_written, 0);
        assert!(harness.output(2).is_empty());

        let content = must(fs::read_to_string(dir.join("out.jsonl")));
        let lines: Vec<Value> = content
            .lines()
            .map(|line| must(serde_json::from_str(line)))
            .collect();
        assert_eq!(lines, vec![json!({"id": "1"}), json!({"id": "2"})]);
    }

    #[test]
    fn unsupported_format_fails_before_writing() {
        let dir = temp_dir("write-xml");
        let harness = Harness::new();
        let result = harness.run(
            2,
            WRITE,
            &json!({"step_number": 1, "file_name": "out.xml", "file_type": "xml"}),
            Some(dir.as_path()),
        );
        assert!(matches!(result, Err(PipelineError::UpstreamData(_))));
        assert!(!dir.join("out.xml").exists());
    }

    #[test]
    fn sort_keys_reaches_into_arrays() {
        let sorted = sort_keys(json!([{"b": 1, "a": 2}]));
        let keys: Vec<&String> = sorted[0]
            .as_object()
            .map(|fields| fields.keys().collect())
            .unwrap_or_default();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
