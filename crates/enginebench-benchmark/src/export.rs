use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use enginebench_core::metrics::unix_now;
use enginebench_core::{CollectionExport, EngineError, MetricsCollection, ParsedMetrics, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const CSV_COLUMNS: [&str; 18] = [
    "request_id",
    "engine_name",
    "engine_type",
    "model_name",
    "timestamp",
    "success",
    "total_duration",
    "load_duration",
    "prompt_eval_count",
    "prompt_eval_duration",
    "prompt_token_rate",
    "eval_count",
    "eval_duration",
    "response_token_rate",
    "first_token_latency",
    "inter_token_latency",
    "queueing_time",
    "error_message",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "json"),
            ExportFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(EngineError::Config(format!("unknown export format '{}'", other))),
        }
    }
}

/// Which lists go into a JSON export. CSV always covers parsed metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSelection {
    pub raw: bool,
    pub parsed: bool,
    pub aggregate: bool,
}

impl Default for ExportSelection {
    fn default() -> Self {
        Self {
            raw: true,
            parsed: true,
            aggregate: true,
        }
    }
}

pub fn write_collection(
    collection: &MetricsCollection,
    path: &Path,
    format: ExportFormat,
    selection: ExportSelection,
) -> Result<()> {
    let contents = match format {
        ExportFormat::Json => serde_json::to_string_pretty(&to_export(collection, selection))?,
        ExportFormat::Csv => to_csv(&collection.parsed_metrics)?,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;

    info!(
        path = %path.display(),
        format = %format,
        collection_id = %collection.collection_id,
        "Exported metrics collection"
    );
    Ok(())
}

/// Unselected lists are left empty; `collection_info` always describes the
/// whole collection.
pub fn to_export(collection: &MetricsCollection, selection: ExportSelection) -> CollectionExport {
    CollectionExport {
        collection_info: collection.summary(),
        export_timestamp: unix_now(),
        raw_metrics: match selection.raw {
            true => collection.raw_metrics.clone(),
            false => Vec::new(),
        },
        parsed_metrics: match selection.parsed {
            true => collection.parsed_metrics.clone(),
            false => Vec::new(),
        },
        aggregate_metrics: match selection.aggregate {
            true => collection.aggregate_metrics.clone(),
            false => Vec::new(),
        },
    }
}

pub fn read_export(path: &Path) -> Result<CollectionExport> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Parsed metrics as CSV with a header row. Missing values are empty cells.
pub fn to_csv(metrics: &[ParsedMetrics]) -> Result<String> {
    if metrics.is_empty() {
        return Err(EngineError::Export("no parsed metrics to export as CSV".into()));
    }

    let mut out = CSV_COLUMNS.join(",");
    out.push('\n');

    for m in metrics {
        let row = [
            escape(&m.request_id),
            escape(&m.engine_name),
            m.engine_type.label().to_string(),
            escape(&m.model_name),
            m.timestamp.to_string(),
            m.success.to_string(),
            opt(m.total_duration),
            opt(m.load_duration),
            opt(m.prompt_eval_count),
            opt(m.prompt_eval_duration),
            opt(m.prompt_token_rate),
            opt(m.eval_count),
            opt(m.eval_duration),
            opt(m.response_token_rate),
            opt(m.first_token_latency),
            opt(m.inter_token_latency),
            opt(m.queueing_time),
            m.error_message.as_deref().map(escape).unwrap_or_default(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }

    Ok(out)
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        return format!("\"{}\"", field.replace('"', "\"\""));
    }
    field.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use enginebench_core::{AggregateMetrics, EngineKind, ErrorKind};

    fn collection() -> MetricsCollection {
        let mut collection = MetricsCollection::new(Some("export test".into()));

        let mut ok = ParsedMetrics::new("r1", "ollama", EngineKind::Ollama, "llama3", 1_700_000_000.0);
        ok.total_duration = Some(1.25);
        ok.eval_count = Some(40);
        ok.eval_duration = Some(1.0);
        ok.derive();

        let mut failed = ParsedMetrics::new("r2", "tgi", EngineKind::Tgi, "mistral", 1_700_000_001.0);
        failed.mark_failed(ErrorKind::Http, "HTTP 500: boom, \"really\"");

        let aggregate = AggregateMetrics::from_metrics("ollama", [&ok]);
        collection.parsed_metrics = vec![ok, failed];
        collection.aggregate_metrics = vec![aggregate];
        collection
    }

    #[test]
    fn test_csv_header_and_empty_cells() {
        let csv = to_csv(&collection().parsed_metrics).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_COLUMNS.join(","));
        assert!(lines[1].starts_with("r1,ollama,ollama,llama3,"));
        assert!(lines[1].contains(",40,1,40,"));
        assert!(lines[1].ends_with(','));
        assert!(lines[2].ends_with("\"HTTP 500: boom, \"\"really\"\"\""));
        assert!(lines[2].contains(",false,,,,"));
    }

    #[test]
    fn test_csv_requires_parsed_metrics() {
        let err = to_csv(&[]).unwrap_err();
        assert!(matches!(err, EngineError::Export(_)));
    }

    #[test]
    fn test_json_round_trip_preserves_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/run.json");
        let collection = collection();

        write_collection(&collection, &path, ExportFormat::Json, ExportSelection::default()).unwrap();
        let loaded = read_export(&path).unwrap();

        assert_eq!(loaded.collection_info.total_parsed_metrics, 2);
        assert_eq!(loaded.collection_info.success_rate, 0.5);
        assert_eq!(loaded.parsed_metrics.len(), 2);
        assert_eq!(loaded.aggregate_metrics.len(), 1);
        assert_eq!(loaded.parsed_metrics[1].error_kind, Some(ErrorKind::Http));
    }

    #[test]
    fn test_selection_empties_unselected_lists() {
        let selection = ExportSelection {
            raw: false,
            parsed: false,
            aggregate: true,
        };
        let export = to_export(&collection(), selection);
        assert!(export.parsed_metrics.is_empty());
        assert_eq!(export.aggregate_metrics.len(), 1);
        assert_eq!(export.collection_info.total_parsed_metrics, 2);
    }

    #[test]
    fn test_csv_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parsed.csv");
        write_collection(&collection(), &path, ExportFormat::Csv, ExportSelection::default()).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("request_id,engine_name"));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
