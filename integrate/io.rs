//! # Tabular Input and Output
//!
//! The only module that touches the filesystem for data. Everything is TSV with a
//! header row:
//!
//! - Matrices: first column `feature`, then one column per sample id; one feature
//!   per row.
//! - Covariates: columns `sample` and `label`.
//! - Embeddings: `sample`, `dim1..dimK` and, when labels are known, `label`.
//! - Loadings: `feature`, `dim1..dimK`; one file per block.
//!
//! Provenance records and convergence reports are written as TOML.
//!
//! Failures are assumed to be user-input errors, so `DataError` names the file,
//! the line and the offending cell wherever it can.

use crate::evaluate::SeparatorEvaluation;
use crate::types::{BlockLoadings, CovariateTable, Embedding, EngineKind, OmicMatrix, OmicsError};
use csv::{ReaderBuilder, StringRecord, Writer, WriterBuilder};
use ndarray::{Array2, ArrayView2};
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error on '{path}': {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed TSV in '{path}': {source}")]
    CsvError {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("'{0}' has no header row.")]
    MissingHeader(PathBuf),
    #[error("'{path}' must have at least {required} columns; found {found}.")]
    TooFewColumns {
        path: PathBuf,
        required: usize,
        found: usize,
    },
    #[error("'{path}' line {line}: expected {expected} fields, found {found}.")]
    RaggedRow {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("'{path}' line {line}, column '{column}': '{value}' is not a number.")]
    NotANumber {
        path: PathBuf,
        line: u64,
        column: String,
        value: String,
    },
    #[error("'{0}' contains no data rows.")]
    NoDataRows(PathBuf),
    #[error("Invalid data in '{path}': {source}")]
    InvalidData {
        path: PathBuf,
        #[source]
        source: OmicsError,
    },
    #[error("Failed to serialize '{path}' to TOML: {source}")]
    TomlSerializeError {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
}

/// An embedding read back from disk, without provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    pub sample_ids: Vec<String>,
    pub scores: Array2<f64>,
    pub labels: Option<Vec<String>>,
}

fn tsv_reader(path: &Path) -> Result<csv::Reader<File>, DataError> {
    let file = File::open(path).map_err(|source| DataError::IoError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_reader(file))
}

fn tsv_writer(path: &Path) -> Result<Writer<File>, DataError> {
    let file = File::create(path).map_err(|source| DataError::IoError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(WriterBuilder::new().delimiter(b'\t').from_writer(file))
}

fn csv_error(path: &Path) -> impl Fn(csv::Error) -> DataError + '_ {
    move |source| DataError::CsvError {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads the header and every record, checking each row has the header's width.
fn read_table(path: &Path, min_columns: usize) -> Result<(StringRecord, Vec<(u64, StringRecord)>), DataError> {
    let mut reader = tsv_reader(path)?;
    let header = reader.headers().map_err(csv_error(path))?.clone();
    if header.is_empty() {
        return Err(DataError::MissingHeader(path.to_path_buf()));
    }
    if header.len() < min_columns {
        return Err(DataError::TooFewColumns {
            path: path.to_path_buf(),
            required: min_columns,
            found: header.len(),
        });
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error(path))?;
        let line = record.position().map_or(0, |p| p.line());
        if record.len() != header.len() {
            return Err(DataError::RaggedRow {
                path: path.to_path_buf(),
                line,
                expected: header.len(),
                found: record.len(),
            });
        }
        rows.push((line, record));
    }
    if rows.is_empty() {
        return Err(DataError::NoDataRows(path.to_path_buf()));
    }
    Ok((header, rows))
}

fn parse_number(path: &Path, line: u64, column: &str, value: &str) -> Result<f64, DataError> {
    value.trim().parse::<f64>().map_err(|_| DataError::NotANumber {
        path: path.to_path_buf(),
        line,
        column: column.to_string(),
        value: value.to_string(),
    })
}

/// Reads a features x samples matrix.
pub fn read_matrix(path: &Path) -> Result<OmicMatrix, DataError> {
    let (header, rows) = read_table(path, 2)?;
    let sample_ids: Vec<String> = header.iter().skip(1).map(str::to_string).collect();

    let mut feature_ids = Vec::with_capacity(rows.len());
    let mut values = Array2::zeros((rows.len(), sample_ids.len()));
    for (row_index, (line, record)) in rows.iter().enumerate() {
        feature_ids.push(record[0].to_string());
        for (col_index, cell) in record.iter().skip(1).enumerate() {
            values[[row_index, col_index]] = parse_number(path, *line, &sample_ids[col_index], cell)?;
        }
    }

    let matrix = OmicMatrix::new(values, feature_ids, sample_ids).map_err(|source| {
        DataError::InvalidData {
            path: path.to_path_buf(),
            source,
        }
    })?;
    log::info!(
        "Read {} features x {} samples from '{}'",
        matrix.n_features(),
        matrix.n_samples(),
        path.display()
    );
    Ok(matrix)
}

pub fn write_matrix(path: &Path, matrix: &OmicMatrix) -> Result<(), DataError> {
    let mut writer = tsv_writer(path)?;
    let header = std::iter::once("feature").chain(matrix.sample_ids().iter().map(String::as_str));
    writer.write_record(header).map_err(csv_error(path))?;
    for (feature, row) in matrix.feature_ids().iter().zip(matrix.values().rows()) {
        let record = std::iter::once(feature.clone()).chain(row.iter().map(|v| v.to_string()));
        writer.write_record(record).map_err(csv_error(path))?;
    }
    finish(path, writer)
}

/// Reads a `sample<TAB>label` table.
pub fn read_covariates(path: &Path) -> Result<CovariateTable, DataError> {
    let (_, rows) = read_table(path, 2)?;
    let entries = rows
        .into_iter()
        .map(|(_, record)| (record[0].to_string(), record[1].to_string()))
        .collect();
    CovariateTable::new(entries).map_err(|source| DataError::InvalidData {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_covariates(path: &Path, table: &CovariateTable) -> Result<(), DataError> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["sample", "label"]).map_err(csv_error(path))?;
    for (sample, label) in table.entries() {
        writer.write_record([sample, label]).map_err(csv_error(path))?;
    }
    finish(path, writer)
}

fn dimension_header(first: &str, dims: usize) -> Vec<String> {
    std::iter::once(first.to_string())
        .chain((1..=dims).map(|d| format!("dim{d}")))
        .collect()
}

pub fn write_embedding(path: &Path, embedding: &Embedding, labels: Option<&[String]>) -> Result<(), DataError> {
    let mut writer = tsv_writer(path)?;
    let mut header = dimension_header("sample", embedding.n_dims());
    if labels.is_some() {
        header.push("label".to_string());
    }
    writer.write_record(&header).map_err(csv_error(path))?;

    for (i, (sample, row)) in embedding
        .sample_ids()
        .iter()
        .zip(embedding.scores().rows())
        .enumerate()
    {
        let mut record: Vec<String> = std::iter::once(sample.clone())
            .chain(row.iter().map(|v| v.to_string()))
            .collect();
        if let Some(labels) = labels {
            record.push(labels.get(i).cloned().unwrap_or_default());
        }
        writer.write_record(&record).map_err(csv_error(path))?;
    }
    finish(path, writer)
}

/// Reads an embedding TSV; a trailing `label` column is returned separately.
pub fn read_embedding(path: &Path) -> Result<EmbeddingTable, DataError> {
    let (header, rows) = read_table(path, 2)?;
    let has_labels = header.iter().last() == Some("label");
    let dims = header.len() - 1 - usize::from(has_labels);
    if dims == 0 {
        return Err(DataError::TooFewColumns {
            path: path.to_path_buf(),
            required: 2 + usize::from(has_labels),
            found: header.len(),
        });
    }

    let mut sample_ids = Vec::with_capacity(rows.len());
    let mut labels = Vec::new();
    let mut scores = Array2::zeros((rows.len(), dims));
    for (i, (line, record)) in rows.iter().enumerate() {
        sample_ids.push(record[0].to_string());
        for d in 0..dims {
            scores[[i, d]] = parse_number(path, *line, &header[d + 1], &record[d + 1])?;
        }
        if has_labels {
            labels.push(record[dims + 1].to_string());
        }
    }
    Ok(EmbeddingTable {
        sample_ids,
        scores,
        labels: has_labels.then_some(labels),
    })
}

pub fn write_loadings(path: &Path, loadings: &BlockLoadings) -> Result<(), DataError> {
    let mut writer = tsv_writer(path)?;
    let values: ArrayView2<f64> = loadings.values();
    writer
        .write_record(dimension_header("feature", values.ncols()))
        .map_err(csv_error(path))?;
    for (label, row) in loadings.row_labels().iter().zip(values.rows()) {
        let record = std::iter::once(label.clone()).chain(row.iter().map(|v| v.to_string()));
        writer.write_record(record).map_err(csv_error(path))?;
    }
    finish(path, writer)
}

/// One row per (engine, class): the grid-searched separator and its error counts.
pub fn write_evaluations(path: &Path, rows: &[(EngineKind, SeparatorEvaluation)]) -> Result<(), DataError> {
    let mut writer = tsv_writer(path)?;
    writer
        .write_record([
            "engine",
            "positive_class",
            "dim_x",
            "dim_y",
            "false_positives",
            "false_negatives",
            "misclassification_rate",
            "normal_x",
            "normal_y",
            "offset",
        ])
        .map_err(csv_error(path))?;
    for (engine, evaluation) in rows {
        writer
            .write_record([
                engine.to_string(),
                evaluation.positive_class.clone(),
                evaluation.dims.0.to_string(),
                evaluation.dims.1.to_string(),
                evaluation.false_positives.to_string(),
                evaluation.false_negatives.to_string(),
                format!("{:.4}", evaluation.misclassification_rate()),
                evaluation.separator.normal[0].to_string(),
                evaluation.separator.normal[1].to_string(),
                evaluation.separator.offset.to_string(),
            ])
            .map_err(csv_error(path))?;
    }
    finish(path, writer)
}

/// Serializes any record (provenance, convergence report) to a TOML file.
pub fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), DataError> {
    let text = toml::to_string_pretty(value).map_err(|source| DataError::TomlSerializeError {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(|source| DataError::IoError {
        path: path.to_path_buf(),
        source,
    })
}

fn finish(path: &Path, mut writer: Writer<File>) -> Result<(), DataError> {
    writer.flush().map_err(|source| DataError::IoError {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::{ConvergenceReport, ConvergenceState};
    use crate::types::Provenance;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn matrix_survives_a_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("expr.tsv");
        let matrix = OmicMatrix::new(
            array![[1.5, -2.0, 0.0], [3.25, 4.0, 1e-3]],
            vec!["TP53".to_string(), "BRCA1".to_string()],
            vec!["s1".to_string(), "s2".to_string(), "s3".to_string()],
        )
        .unwrap();
        write_matrix(&path, &matrix).unwrap();
        assert_eq!(read_matrix(&path).unwrap(), matrix);
    }

    #[test]
    fn non_numeric_cell_is_reported_with_its_location() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.tsv");
        fs::write(&path, "feature\ts1\ts2\ng1\t1.0\tNA?\n").unwrap();
        match read_matrix(&path) {
            Err(DataError::NotANumber { line, column, value, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(column, "s2");
                assert_eq!(value, "NA?");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ragged.tsv");
        fs::write(&path, "feature\ts1\ts2\ng1\t1.0\n").unwrap();
        assert!(matches!(
            read_matrix(&path),
            Err(DataError::RaggedRow { expected: 3, found: 2, .. })
        ));
    }

    #[test]
    fn header_only_file_has_no_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.tsv");
        fs::write(&path, "feature\ts1\n").unwrap();
        assert!(matches!(read_matrix(&path), Err(DataError::NoDataRows(_))));
    }

    #[test]
    fn covariates_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("labels.tsv");
        let table = CovariateTable::new(vec![
            ("s1".to_string(), "LumA".to_string()),
            ("s2".to_string(), "Basal".to_string()),
        ])
        .unwrap();
        write_covariates(&path, &table).unwrap();
        let read = read_covariates(&path).unwrap();
        assert_eq!(read.label("s2"), Some("Basal"));
        assert_eq!(read.len(), 2);
    }

    #[test]
    fn embedding_with_labels_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mfa_embedding.tsv");
        let embedding = Embedding::new(
            array![[0.5, -1.0], [2.0, 0.25]],
            vec!["s1".to_string(), "s2".to_string()],
            Provenance::new(EngineKind::Mfa),
        )
        .unwrap();
        let labels = vec!["A".to_string(), "B".to_string()];
        write_embedding(&path, &embedding, Some(labels.as_slice())).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("sample\tdim1\tdim2\tlabel\n"));

        let table = read_embedding(&path).unwrap();
        assert_eq!(table.sample_ids, ["s1", "s2"]);
        assert_eq!(table.scores, array![[0.5, -1.0], [2.0, 0.25]]);
        assert_eq!(table.labels, Some(labels));
    }

    #[test]
    fn loadings_and_reports_are_written() {
        let dir = tempdir().unwrap();
        let loadings = BlockLoadings::new(
            "cnv",
            vec!["c1:1".to_string(), "c1:2".to_string()],
            array![[0.1, 0.0], [0.0, -0.3]],
        )
        .unwrap();
        let loadings_path = dir.path().join("cnv.tsv");
        write_loadings(&loadings_path, &loadings).unwrap();
        let text = fs::read_to_string(&loadings_path).unwrap();
        assert_eq!(text.lines().next(), Some("feature\tdim1\tdim2"));
        assert_eq!(text.lines().count(), 3);

        let report = ConvergenceReport {
            state: ConvergenceState::MaxIterReached,
            iterations: 3,
            tolerance: 1e-4,
            max_iterations: 3,
            best_objective: 0.5,
            objective_trace: vec![1.0, 0.7, 0.6, 0.5],
        };
        let report_path = dir.path().join("convergence.toml");
        write_toml(&report_path, &report).unwrap();
        let parsed: ConvergenceReport = toml::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(parsed, report);
    }
}
