//! Dataset export.
//!
//! Two gzip JSONL datasets are derived from the held traces: supervised
//! fine-tuning rows and preference pairs. Files are written to a temporary
//! sibling and renamed into place, so a reader never sees a partial dataset.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{NaiveDate, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{ExecutionError, TracesError, TracesResult, ValidationError};
use crate::trace::AssistTrace;

/// Row deduplication applied before writing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    /// Keep every row.
    #[default]
    None,
    /// Drop rows whose content, ignoring `trace_id`, was already written.
    #[serde(alias = "simhash", alias = "hash")]
    ContentHash,
}

impl FromStr for DedupMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "content_hash" | "simhash" | "hash" => Ok(Self::ContentHash),
            other => Err(ValidationError::InvalidOption {
                option: "dedup".to_string(),
                reason: format!("unknown mode '{other}'"),
            }),
        }
    }
}

/// Which dataset to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    /// Instruction/output rows.
    Sft,
    /// Chosen/rejected pairs.
    Prefs,
}

impl DatasetKind {
    fn file_prefix(self) -> &'static str {
        match self {
            Self::Sft => "sft",
            Self::Prefs => "prefs",
        }
    }
}

/// Where an SFT output label came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    /// A user-supplied corrected action.
    Gold,
    /// The model's own parsed action.
    ImplicitSuccess,
}

/// One supervised fine-tuning row.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftRow {
    pub instruction: String,
    pub context: Map<String, Value>,
    pub output: Option<Value>,
    pub source: LabelSource,
    pub trace_id: String,
}

/// One preference pair.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefRow {
    pub prompt: String,
    pub context: Map<String, Value>,
    pub chosen: Option<Value>,
    pub rejected: Option<Value>,
    pub trace_id: String,
}

/// Result of one export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    /// File written.
    pub path: PathBuf,
    /// Rows written after deduplication.
    pub rows: usize,
}

/// Keeps the scalar top-level entries of a context mapping.
#[must_use]
pub fn summarize_context(context: &Map<String, Value>) -> Map<String, Value> {
    context
        .iter()
        .filter(|(_, v)| matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// Null and empty containers do not count as a label.
fn label(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| match v {
        Value::Null => false,
        Value::Object(m) => !m.is_empty(),
        Value::Array(a) => !a.is_empty(),
        _ => true,
    })
}

/// Builds SFT rows, one per trace.
#[must_use]
pub fn sft_rows(traces: &[AssistTrace]) -> Vec<SftRow> {
    traces
        .iter()
        .map(|t| {
            let gold = label(t.gold_action.as_ref());
            SftRow {
                instruction: t.user_text.clone().unwrap_or_default(),
                context: summarize_context(&t.context),
                output: gold.or_else(|| label(t.parsed_action.as_ref())).cloned(),
                source: if gold.is_some() {
                    LabelSource::Gold
                } else {
                    LabelSource::ImplicitSuccess
                },
                trace_id: t.trace_id.clone(),
            }
        })
        .collect()
}

/// Builds preference rows, one per trace.
#[must_use]
pub fn pref_rows(traces: &[AssistTrace]) -> Vec<PrefRow> {
    traces
        .iter()
        .map(|t| {
            let parsed = label(t.parsed_action.as_ref());
            PrefRow {
                prompt: t.user_text.clone().unwrap_or_default(),
                context: summarize_context(&t.context),
                chosen: label(t.gold_action.as_ref()).or(parsed).cloned(),
                rejected: parsed.cloned(),
                trace_id: t.trace_id.clone(),
            }
        })
        .collect()
}

/// Drops rows whose content digest was already seen, keeping first
/// occurrences in order.
///
/// The digest covers instruction, context, output and source. `trace_id` is
/// unique per held trace and is left out, otherwise no row would ever repeat.
///
/// # Errors
///
/// Returns a serialization error if a row cannot be encoded.
pub fn dedup_sft_rows(rows: Vec<SftRow>) -> TracesResult<Vec<SftRow>> {
    let mut seen: HashSet<[u8; 32]> = HashSet::with_capacity(rows.len());
    let mut kept = Vec::with_capacity(rows.len());
    for row in rows {
        let content = serde_json::to_vec(&(&row.instruction, &row.context, &row.output, row.source))?;
        if seen.insert(*blake3::hash(&content).as_bytes()) {
            kept.push(row);
        }
    }
    Ok(kept)
}

/// `<dir>/<kind>-YYYYMMDD.jsonl.gz`.
#[must_use]
pub fn default_export_path(dir: &Path, kind: DatasetKind, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}-{}.jsonl.gz", kind.file_prefix(), date.format("%Y%m%d")))
}

/// Exports SFT rows for `traces`.
///
/// # Errors
///
/// Returns an error if a row cannot be serialized or the file cannot be written.
pub fn export_sft(
    traces: &[AssistTrace],
    output: Option<&Path>,
    dataset_dir: &Path,
    dedup: DedupMode,
) -> TracesResult<ExportSummary> {
    let mut rows = sft_rows(traces);
    if dedup == DedupMode::ContentHash {
        rows = dedup_sft_rows(rows)?;
    }
    let lines = to_lines(&rows)?;
    let path = resolve_path(output, dataset_dir, DatasetKind::Sft);
    write_dataset(&path, &lines)?;
    info!(path = %path.display(), rows = lines.len(), "exported sft dataset");
    Ok(ExportSummary { path, rows: lines.len() })
}

/// Exports preference rows for `traces`.
///
/// # Errors
///
/// Returns an error if a row cannot be serialized or the file cannot be written.
pub fn export_prefs(traces: &[AssistTrace], output: Option<&Path>, dataset_dir: &Path) -> TracesResult<ExportSummary> {
    let lines = to_lines(&pref_rows(traces))?;
    let path = resolve_path(output, dataset_dir, DatasetKind::Prefs);
    write_dataset(&path, &lines)?;
    info!(path = %path.display(), rows = lines.len(), "exported preference dataset");
    Ok(ExportSummary { path, rows: lines.len() })
}

fn resolve_path(output: Option<&Path>, dataset_dir: &Path, kind: DatasetKind) -> PathBuf {
    match output {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => default_export_path(dataset_dir, kind, Utc::now().date_naive()),
    }
}

fn to_lines<T: Serialize>(rows: &[T]) -> TracesResult<Vec<String>> {
    rows.iter()
        .map(|r| serde_json::to_string(r).map_err(TracesError::from))
        .collect()
}

/// Writes `lines` as gzip JSONL to `path`, replacing it atomically.
///
/// # Errors
///
/// Returns `ExecutionError::Export` if any filesystem step fails; the
/// temporary file is removed in that case.
pub fn write_dataset(path: &Path, lines: &[String]) -> TracesResult<()> {
    let export_err = |e: std::io::Error| -> TracesError {
        ExecutionError::Export {
            path: path.display().to_string(),
            message: e.to_string(),
        }
        .into()
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(export_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            TracesError::from(ValidationError::InvalidField {
                field: "output_path".to_string(),
                reason: format!("'{}' does not name a file", path.display()),
            })
        })?;
    let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let written = (|| -> std::io::Result<()> {
        let file = File::create(&tmp)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        for line in lines {
            encoder.write_all(line.as_bytes())?;
            encoder.write_all(b"\n")?;
        }
        let mut inner = encoder.finish()?;
        inner.flush()?;
        inner.get_ref().sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(export_err(e));
    }
    Ok(())
}
