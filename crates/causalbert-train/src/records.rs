//! Tabular record loading for the CLI.
//!
//! Accepted layouts:
//!
//! | Layout | Shape |
//! |--------|-------|
//! | JSON array | `[{"text": .., "T": .., ..}, ..]` |
//! | JSON object of objects | `{"id1": {..}, "id2": {..}}`, ordered by key |
//! | JSON Lines | one object per line, blank lines ignored |
//! | CSV | header row of column names; empty cells are missing |
//!
//! Each record carries a `split` column with `train`, `dev` or `test`.
//! A treatment or outcome of `-1` marks the label as unknown.

use std::path::Path;

use causalbert_core::{CausalBertError, Example, Result};
use serde_json::{Map, Value};

type Record = Map<String, Value>;

/// Tabular marker for a latent treatment or outcome.
const UNKNOWN_LABEL: f64 = -1.0;

/// Column names and the treatment derivation rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub text: String,
    pub treatment: String,
    pub outcome: String,
    /// Confounder column; every confounder is 0 when absent.
    pub confounder: Option<String>,
    /// Derive `T = score > cutoff` from a numeric treatment column.
    pub sentiment_cutoff: Option<f64>,
    pub split: String,
}

impl Default for ColumnSpec {
    fn default() -> Self {
        Self {
            text: "text".to_string(),
            treatment: "T".to_string(),
            outcome: "Y".to_string(),
            confounder: None,
            sentiment_cutoff: None,
            split: "split".to_string(),
        }
    }
}

/// Examples partitioned by the split column.
#[derive(Debug, Clone, Default)]
pub struct SplitExamples {
    pub train: Vec<Example>,
    pub dev: Vec<Example>,
    pub test: Vec<Example>,
}

/// Read and split a CSV, JSON or JSONL file.
///
/// The format is chosen by extension: `.csv` is CSV, `.jsonl`/`.ndjson` are
/// JSON Lines, anything else is parsed as a JSON document.
pub fn load_split_examples(path: &Path, columns: &ColumnSpec) -> Result<SplitExamples> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CausalBertError::Data(format!("Failed to read {}: {e}", path.display()))
    })?;
    let records = match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => parse_csv(&content)?,
        Some("jsonl" | "ndjson") => parse_json_lines(&content)?,
        _ => parse_json_document(&content)?,
    };
    tracing::info!(path = %path.display(), records = records.len(), "Read records");
    split_examples(&records, columns)
}

pub fn parse_json_document(content: &str) -> Result<Vec<Record>> {
    match serde_json::from_str::<Value>(content)? {
        Value::Array(items) => items.into_iter().map(into_record).collect(),
        Value::Object(by_id) => {
            let mut entries: Vec<(String, Value)> = by_id.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries.into_iter().map(|(_, v)| into_record(v)).collect()
        }
        other => Err(CausalBertError::Data(format!(
            "Expected a JSON array or object of records, found {}",
            kind(&other)
        ))),
    }
}

pub fn parse_json_lines(content: &str) -> Result<Vec<Record>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let value: Value = serde_json::from_str(line).map_err(|e| {
                CausalBertError::Data(format!("Line {}: invalid JSON: {e}", i + 1))
            })?;
            into_record(value)
        })
        .collect()
}

/// CSV with a header row. Cells stay strings (numeric columns are parsed on
/// use); empty cells become `null`.
pub fn parse_csv(content: &str) -> Result<Vec<Record>> {
    let mut reader = csv::Reader::from_reader(content.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| CausalBertError::Data(format!("Invalid CSV header: {e}")))?
        .clone();

    reader
        .records()
        .enumerate()
        .map(|(i, row)| {
            let row = row.map_err(|e| CausalBertError::Data(format!("CSV row {}: {e}", i + 1)))?;
            Ok(headers
                .iter()
                .zip(row.iter())
                .map(|(name, cell)| {
                    let value = if cell.is_empty() {
                        Value::Null
                    } else {
                        Value::String(cell.to_string())
                    };
                    (name.to_string(), value)
                })
                .collect())
        })
        .collect()
}

fn into_record(value: Value) -> Result<Record> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CausalBertError::Data(format!(
            "Expected a record object, found {}",
            kind(&other)
        ))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Convert records to examples and route them by split.
///
/// Records with an unrecognised split value are skipped with a warning.
pub fn split_examples(records: &[Record], columns: &ColumnSpec) -> Result<SplitExamples> {
    let mut out = SplitExamples::default();
    let mut skipped = 0usize;
    for (i, record) in records.iter().enumerate() {
        let example = to_example(record, columns)
            .map_err(|e| CausalBertError::Data(format!("Record {i}: {e}")))?;
        match record.get(&columns.split).and_then(Value::as_str) {
            Some("train") => out.train.push(example),
            Some("dev") => out.dev.push(example),
            Some("test") => out.test.push(example),
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!(skipped, column = %columns.split, "Records without a train/dev/test split");
    }
    tracing::info!(
        train = out.train.len(),
        dev = out.dev.len(),
        test = out.test.len(),
        "Split records"
    );
    Ok(out)
}

/// One record as an [`Example`].
pub fn to_example(record: &Record, columns: &ColumnSpec) -> Result<Example> {
    let text = match record.get(&columns.text) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(CausalBertError::Data(format!(
                "column '{}' is {}, expected text",
                columns.text,
                kind(other)
            )))
        }
        None => {
            return Err(CausalBertError::Data(format!(
                "missing text column '{}'",
                columns.text
            )))
        }
    };

    let confounder = match &columns.confounder {
        Some(name) => number(record, name)?
            .map(|v| v as i64)
            .ok_or_else(|| CausalBertError::Data(format!("missing confounder column '{name}'")))?,
        None => 0,
    };

    let treatment = match columns.sentiment_cutoff {
        Some(cutoff) => number(record, &columns.treatment)?.map(|v| i64::from(v > cutoff)),
        None => label(record, &columns.treatment)?.map(|v| v as i64),
    };
    let outcome = label(record, &columns.outcome)?;

    Ok(Example {
        text,
        confounder,
        treatment,
        outcome,
    })
}

/// Label cell: like [`number`], with the `-1` sentinel read as unknown.
fn label(record: &Record, column: &str) -> Result<Option<f64>> {
    Ok(number(record, column)?.filter(|&v| v != UNKNOWN_LABEL))
}

/// Numeric cell; booleans read as 0/1 and numeric strings are parsed.
/// Missing or null cells are `None`.
fn number(record: &Record, column: &str) -> Result<Option<f64>> {
    match record.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(f64::from(u8::from(*b)))),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| {
            CausalBertError::Data(format!("column '{column}' holds non-numeric '{s}'"))
        }),
        Some(other) => Err(CausalBertError::Data(format!(
            "column '{column}' is {}, expected a number",
            kind(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn write(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut f = Builder::new().suffix(suffix).tempfile().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_object_of_objects_ordered_by_key() {
        let f = write(
            ".json",
            r#"{
                "b": {"text": "second", "T": 1, "Y": 0, "split": "train"},
                "a": {"text": "first", "T": 0, "Y": 1, "split": "train"},
                "c": {"text": "held out", "T": 1, "Y": 1, "split": "test"}
            }"#,
        );
        let split = load_split_examples(f.path(), &ColumnSpec::default()).unwrap();
        assert_eq!(split.train.len(), 2);
        assert_eq!(split.train[0].text, "first");
        assert_eq!(split.train[0].treatment, Some(0));
        assert_eq!(split.train[0].outcome, Some(1.0));
        assert_eq!(split.train[0].confounder, 0);
        assert_eq!(split.test.len(), 1);
        assert!(split.dev.is_empty());
    }

    #[test]
    fn test_json_lines_with_custom_columns() {
        let f = write(
            ".jsonl",
            concat!(
                r#"{"review": "ok", "stars": 4.5, "bought": true, "cat": 1, "split": "dev"}"#,
                "\n\n",
                r#"{"review": "bad", "stars": 1.0, "bought": false, "cat": 0, "split": "dev"}"#,
                "\n",
            ),
        );
        let columns = ColumnSpec {
            text: "review".to_string(),
            treatment: "stars".to_string(),
            outcome: "bought".to_string(),
            confounder: Some("cat".to_string()),
            sentiment_cutoff: Some(3.0),
            ..ColumnSpec::default()
        };
        let split = load_split_examples(f.path(), &columns).unwrap();
        assert_eq!(split.dev.len(), 2);
        assert_eq!(split.dev[0].treatment, Some(1));
        assert_eq!(split.dev[1].treatment, Some(0));
        assert_eq!(split.dev[0].outcome, Some(1.0));
        assert_eq!(split.dev[0].confounder, 1);
    }

    #[test]
    fn test_missing_labels_are_none() {
        let records = parse_json_document(r#"[{"text": "x", "split": "test"}]"#).unwrap();
        let split = split_examples(&records, &ColumnSpec::default()).unwrap();
        assert_eq!(split.test[0].treatment, None);
        assert_eq!(split.test[0].outcome, None);
    }

    #[test]
    fn test_minus_one_labels_are_unknown() {
        let records = parse_json_document(
            r#"[
                {"text": "latent", "T": -1, "Y": -1, "split": "test"},
                {"text": "seen", "T": 1, "Y": 0, "split": "test"}
            ]"#,
        )
        .unwrap();
        let split = split_examples(&records, &ColumnSpec::default()).unwrap();
        assert_eq!(split.test[0].treatment, None);
        assert_eq!(split.test[0].outcome, None);
        assert_eq!(split.test[1].treatment, Some(1));
        assert_eq!(split.test[1].outcome, Some(0.0));
    }

    #[test]
    fn test_unknown_outcome_keeps_recalibration() {
        use crate::estimate::recalibrate;
        use causalbert_core::Prediction;

        let records = parse_json_document(
            r#"[
                {"text": "a", "T": -1, "Y": -1, "split": "test"},
                {"text": "b", "T": 0, "Y": 0, "split": "test"},
                {"text": "c", "T": 1, "Y": 1, "split": "test"}
            ]"#,
        )
        .unwrap();
        let split = split_examples(&records, &ColumnSpec::default()).unwrap();
        let preds: Vec<Prediction> = split
            .test
            .iter()
            .zip([0.4, 0.2, 0.8])
            .map(|(e, q)| Prediction {
                q0: q,
                q1: q,
                propensity: 0.5,
                outcome: e.outcome,
            })
            .collect();
        let (_, recalibrated) = recalibrate(preds);
        assert!(recalibrated);
    }

    #[test]
    fn test_csv_with_header_and_empty_cells() {
        let f = write(
            ".csv",
            "text,T,Y,C,split\n\
             \"tasty, cheap\",1,1,1,train\n\
             bland,0,,0,train\n\
             unknown arm,-1,0,0,dev\n\
             meh,0,1,1,test\n",
        );
        let columns = ColumnSpec {
            confounder: Some("C".to_string()),
            ..ColumnSpec::default()
        };
        let split = load_split_examples(f.path(), &columns).unwrap();
        assert_eq!(split.train.len(), 2);
        assert_eq!(split.train[0].text, "tasty, cheap");
        assert_eq!(split.train[0].treatment, Some(1));
        assert_eq!(split.train[0].confounder, 1);
        assert_eq!(split.train[1].outcome, None);
        assert_eq!(split.dev[0].treatment, None);
        assert_eq!(split.test[0].outcome, Some(1.0));
    }

    #[test]
    fn test_csv_sentiment_cutoff() {
        let records =
            parse_csv("text,score,Y,split\ngood,4.5,1,train\nbad,-1,0,train\n").unwrap();
        let columns = ColumnSpec {
            treatment: "score".to_string(),
            sentiment_cutoff: Some(0.0),
            ..ColumnSpec::default()
        };
        let split = split_examples(&records, &columns).unwrap();
        assert_eq!(split.train[0].treatment, Some(1));
        // A score of -1 is a sentiment value here, not a missing label.
        assert_eq!(split.train[1].treatment, Some(0));
    }

    #[test]
    fn test_unknown_split_is_skipped() {
        let records =
            parse_json_document(r#"[{"text": "x", "T": 0, "Y": 0, "split": "holdout"}]"#).unwrap();
        let split = split_examples(&records, &ColumnSpec::default()).unwrap();
        assert!(split.train.is_empty() && split.dev.is_empty() && split.test.is_empty());
    }

    #[test]
    fn test_malformed_input() {
        assert!(parse_json_document("42").is_err());
        assert!(parse_json_lines("{\"text\": 1}\nnot json").is_err());

        let records = parse_json_document(r#"[{"text": 3, "split": "train"}]"#).unwrap();
        assert!(split_examples(&records, &ColumnSpec::default()).is_err());

        let columns = ColumnSpec {
            confounder: Some("C".to_string()),
            ..ColumnSpec::default()
        };
        let records = parse_json_document(r#"[{"text": "x", "split": "train"}]"#).unwrap();
        assert!(split_examples(&records, &columns).is_err());
    }
}
