//! Persistence collaborator for measurement tables.

use std::fs;
use std::path::{Path, PathBuf};

use ivcore_types::{IvError, Sample};
use serde::Serialize;
use tracing::info;

/// A rectangular table of measurement rows.  Missing values are empty cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl DataTable {
    /// `set_value, voltage, current` rows; overload readings become empty
    /// cells.
    pub fn from_samples(samples: &[Sample]) -> Self {
        let cell = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
        Self {
            columns: vec!["set_value".into(), "voltage".into(), "current".into()],
            rows: samples
                .iter()
                .map(|s| vec![s.set_value.to_string(), cell(s.voltage), cell(s.current)])
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Where and how much was written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedFile {
    pub path: PathBuf,
    pub rows_written: usize,
}

/// Writes measurement tables somewhere durable.
pub trait DataSink: Send + Sync {
    /// Persist `table` as `filename` inside `folder`.
    ///
    /// # Errors
    ///
    /// Returns [`IvError::Persistence`] on any I/O failure and
    /// [`IvError::InvalidArgument`] for unusable file names.
    fn save(&self, table: &DataTable, folder: &Path, filename: &str) -> Result<SavedFile, IvError>;
}

/// CSV files via the `csv` crate.  The folder is created on demand and
/// `.csv` is appended to the file name.
#[derive(Debug, Clone, Default)]
pub struct CsvSink {
    append_timestamp: bool,
}

impl CsvSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suffix file names with `_YYYYmmdd_HHMMSS` so repeated runs never
    /// overwrite each other.
    pub fn with_timestamp(mut self, enabled: bool) -> Self {
        self.append_timestamp = enabled;
        self
    }

    fn file_path(&self, folder: &Path, filename: &str) -> Result<PathBuf, IvError> {
        let base = filename.trim().trim_end_matches(".csv");
        if base.is_empty() || base.contains(['/', '\\']) || base.contains("..") {
            return Err(IvError::InvalidArgument(format!(
                "invalid data file name '{filename}'"
            )));
        }
        let name = if self.append_timestamp {
            format!("{base}_{}.csv", chrono::Local::now().format("%Y%m%d_%H%M%S"))
        } else {
            format!("{base}.csv")
        };
        Ok(folder.join(name))
    }
}

impl DataSink for CsvSink {
    fn save(&self, table: &DataTable, folder: &Path, filename: &str) -> Result<SavedFile, IvError> {
        let path = self.file_path(folder, filename)?;
        fs::create_dir_all(folder).map_err(|e| {
            IvError::Persistence(format!("cannot create {}: {e}", folder.display()))
        })?;

        let persist = |e: csv::Error| IvError::Persistence(format!("{}: {e}", path.display()));
        let mut writer = csv::Writer::from_path(&path).map_err(persist)?;
        writer.write_record(&table.columns).map_err(persist)?;
        for row in &table.rows {
            writer.write_record(row).map_err(persist)?;
        }
        writer
            .flush()
            .map_err(|e| IvError::Persistence(format!("{}: {e}", path.display())))?;

        info!(path = %path.display(), rows = table.len(), "saved data");
        Ok(SavedFile {
            path,
            rows_written: table.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ivcore_types::Reading;

    #[test]
    fn writes_samples_with_empty_overload_cells() {
        let dir = tempfile::tempdir().unwrap();
        let samples = vec![
            Sample::new(0.0, Reading::from_raw(0.0, 1e-9)),
            Sample::new(1.0, Reading::from_raw(1.0, 9.91e37)),
        ];
        let saved = CsvSink::new()
            .save(&DataTable::from_samples(&samples), &dir.path().join("run1"), "iv")
            .unwrap();

        assert_eq!(saved.rows_written, 2);
        assert!(saved.path.ends_with("run1/iv.csv"));
        let text = std::fs::read_to_string(&saved.path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "set_value,voltage,current");
        assert_eq!(lines[2], "1,1,");
    }

    #[test]
    fn timestamp_suffix_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let saved = CsvSink::new()
            .with_timestamp(true)
            .save(&DataTable::default(), dir.path(), "dark.csv")
            .unwrap();
        let name = saved.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("dark_"));
        assert!(name.ends_with(".csv"));
    }

    #[test]
    fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = CsvSink::new()
            .save(&DataTable::default(), dir.path(), "../escape")
            .unwrap_err();
        assert!(matches!(err, IvError::InvalidArgument(_)));
    }
}
