//! Results files: the on-disk record of one job.
//!
//! A results file is append-only and line oriented:
//!
//! ```text
//! #Procedure: Voltage sweep
//! #Parameters:
//! #Loop count: 5
//! #Delay: 0.01 s
//! #Metadata:
//! #Start time: 2024-05-01T12:00:00Z
//! #Data:
//! Iteration,Voltage (V)
//! 0,0.1235
//! 1,0.1301
//! ```
//!
//! The parameter block is written when the [`Results`] is created, the metadata
//! block once `startup()` has succeeded, and data rows as the recorder receives them.
//! Every row is flushed before [`Results::append`] returns, so a job that dies
//! leaves whatever it managed to record.
//!
//! [`Results::load`] reads a file back without re-running the procedure.

use crate::error::{AppResult, DaqError};
use crate::messages::{FieldValue, Row};
use crate::metadata::MetadataSet;
use crate::parameter::ParameterSet;
use crate::procedure::{validate_row, Column, ColumnCheck, Procedure};
use crate::units::{Quantity, Unit};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PROCEDURE_KEY: &str = "Procedure";
const PARAMETERS_MARKER: &str = "#Parameters:";
const METADATA_MARKER: &str = "#Metadata:";
const DATA_MARKER: &str = "#Data:";

/// Pick `<dir>/<prefix><n>.csv` with the smallest unused `n`, creating `dir`.
pub fn unique_filename(dir: impl AsRef<Path>, prefix: &str) -> AppResult<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let mut index = 1usize;
    loop {
        let candidate = dir.join(format!("{prefix}{index}.csv"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        index += 1;
    }
}

enum Sink {
    /// Still writing `#` lines.
    Header(Box<dyn Write + Send>),
    /// Column row written; appending CSV records.
    Data(csv::Writer<Box<dyn Write + Send>>),
    /// A write failed; nothing more will be written.
    Poisoned,
}

/// Writable results file for one procedure run.
pub struct Results {
    label: String,
    path: Option<PathBuf>,
    columns: Vec<Column>,
    sink: Sink,
    rows: usize,
}

impl std::fmt::Debug for Results {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Results")
            .field("label", &self.label)
            .field("columns", &self.columns)
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

impl Results {
    /// Create `path` (and its parent directory) and write the parameter header.
    ///
    /// Fails without touching the filesystem when the procedure name or a column
    /// label could not be read back by [`Results::load`].
    pub fn create(path: impl AsRef<Path>, procedure: &dyn Procedure) -> AppResult<Self> {
        let path = path.as_ref();
        check_readable(
            &path.display().to_string(),
            procedure.name(),
            &procedure.columns(),
        )?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path).map_err(|e| {
            DaqError::Persistence(format!("cannot create {}: {e}", path.display()))
        })?;
        let mut results = Self::from_writer(
            path.display().to_string(),
            procedure,
            BufWriter::new(file),
        )?;
        results.path = Some(path.to_path_buf());
        info!("Results file created at '{}'", path.display());
        Ok(results)
    }

    /// Write the header to an arbitrary sink. `label` names it in messages.
    pub fn from_writer(
        label: impl Into<String>,
        procedure: &dyn Procedure,
        writer: impl Write + Send + 'static,
    ) -> AppResult<Self> {
        let label = label.into();
        let columns = procedure.columns();
        check_readable(&label, procedure.name(), &columns)?;
        let mut results = Self {
            label,
            path: None,
            columns,
            sink: Sink::Header(Box::new(writer)),
            rows: 0,
        };
        let mut header = vec![
            format!("#{PROCEDURE_KEY}: {}", procedure.name()),
            PARAMETERS_MARKER.to_string(),
        ];
        header.extend(
            procedure
                .parameters()
                .iter()
                .map(|p| format!("#{}: {}", p.name(), p.serialized())),
        );
        results.write_header_lines(&header)?;
        Ok(results)
    }

    /// File path, when backed by a file.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Declared columns in file order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Rows appended so far.
    pub fn row_count(&self) -> usize {
        self.rows
    }

    /// Whether a write has failed.
    pub fn is_poisoned(&self) -> bool {
        matches!(self.sink, Sink::Poisoned)
    }

    /// Append the metadata block and open the data section.
    ///
    /// Must be called before the first row; metadata cannot follow data.
    pub fn store_metadata(&mut self, metadata: &MetadataSet) -> AppResult<()> {
        if !matches!(self.sink, Sink::Header(_)) {
            return Err(DaqError::Persistence(format!(
                "{}: metadata must be stored before the data section",
                self.label
            )));
        }
        let mut lines = vec![METADATA_MARKER.to_string()];
        lines.extend(metadata.iter().filter_map(|field| {
            field
                .serialized()
                .map(|value| format!("#{}: {value}", field.name()))
        }));
        self.write_header_lines(&lines)?;
        self.open_data()
    }

    /// Append one row, returning a warning per field that was stored as NaN.
    ///
    /// Unknown or missing columns are rejected without writing anything.
    pub fn append(&mut self, row: &Row) -> AppResult<Vec<String>> {
        validate_row(&self.columns, row)?;
        self.open_data()?;

        let mut warnings = Vec::new();
        let record: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let value = row.get(column.name()).unwrap_or(&FieldValue::Empty);
                let (text, warning) = render_field(column, value);
                if let Some(warning) = warning {
                    warnings.push(warning);
                }
                text
            })
            .collect();

        let Sink::Data(writer) = &mut self.sink else {
            return Err(self.poisoned_error());
        };
        let written = writer
            .write_record(&record)
            .map_err(DaqError::from)
            .and_then(|()| writer.flush().map_err(DaqError::from));
        if let Err(e) = written {
            self.sink = Sink::Poisoned;
            return Err(DaqError::Persistence(format!(
                "{}: failed to append row: {e}",
                self.label
            )));
        }
        self.rows += 1;
        Ok(warnings)
    }

    /// Make sure the data section exists and everything is on disk.
    pub fn finish(&mut self) -> AppResult<()> {
        self.open_data()?;
        if let Sink::Data(writer) = &mut self.sink {
            writer.flush()?;
        }
        debug!("{}: {} row(s) recorded", self.label, self.rows);
        Ok(())
    }

    fn write_header_lines(&mut self, lines: &[String]) -> AppResult<()> {
        let Sink::Header(writer) = &mut self.sink else {
            return Err(self.poisoned_error());
        };
        let written = lines
            .iter()
            .try_for_each(|line| writeln!(writer, "{line}"))
            .and_then(|()| writer.flush());
        if let Err(e) = written {
            self.sink = Sink::Poisoned;
            return Err(DaqError::Persistence(format!(
                "{}: failed to write header: {e}",
                self.label
            )));
        }
        Ok(())
    }

    fn open_data(&mut self) -> AppResult<()> {
        match std::mem::replace(&mut self.sink, Sink::Poisoned) {
            Sink::Header(mut writer) => {
                if let Err(e) = writeln!(writer, "{DATA_MARKER}") {
                    return Err(DaqError::Persistence(format!(
                        "{}: failed to write data marker: {e}",
                        self.label
                    )));
                }
                let mut csv_writer = csv::Writer::from_writer(writer);
                let labels: Vec<String> = self.columns.iter().map(Column::label).collect();
                csv_writer
                    .write_record(&labels)
                    .and_then(|()| csv_writer.flush().map_err(csv::Error::from))
                    .map_err(|e| {
                        DaqError::Persistence(format!(
                            "{}: failed to write column row: {e}",
                            self.label
                        ))
                    })?;
                self.sink = Sink::Data(csv_writer);
                Ok(())
            }
            Sink::Data(writer) => {
                self.sink = Sink::Data(writer);
                Ok(())
            }
            Sink::Poisoned => Err(self.poisoned_error()),
        }
    }

    fn poisoned_error(&self) -> DaqError {
        DaqError::Persistence(format!("{}: file is unusable after a failed write", self.label))
    }

    /// Read a results file back.
    pub fn load(path: impl AsRef<Path>) -> AppResult<LoadedResults> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut loaded = LoadedResults::parse(&text)?;
        loaded.path = Some(path.to_path_buf());
        Ok(loaded)
    }
}

/// Refuse a procedure name or column schema that [`Results::load`] would not give back.
fn check_readable(label: &str, name: &str, columns: &[Column]) -> AppResult<()> {
    if name.contains(['\n', '\r']) {
        return Err(DaqError::Persistence(format!(
            "{label}: procedure name {name:?} must fit on one line"
        )));
    }
    for (index, column) in columns.iter().enumerate() {
        if Column::parse(&column.label()) != *column {
            return Err(DaqError::Persistence(format!(
                "{label}: column {:?} would read back as {:?}",
                column.name(),
                Column::parse(&column.label()).label()
            )));
        }
        if columns[..index].iter().any(|c| c.name() == column.name()) {
            return Err(DaqError::Persistence(format!(
                "{label}: duplicate column {:?}",
                column.name()
            )));
        }
    }
    Ok(())
}

/// Text stored for `value` in `column`, plus a warning when it became NaN.
fn render_field(column: &Column, value: &FieldValue) -> (String, Option<String>) {
    let nan = |reason: String| {
        (
            f64::NAN.to_string(),
            Some(format!("column '{}': {reason}; stored NaN", column.name())),
        )
    };
    match (column.check(), value) {
        (_, FieldValue::Empty) => nan("no value".to_string()),
        (ColumnCheck::Unchecked, FieldValue::Number(v)) => (v.to_string(), None),
        (ColumnCheck::Unchecked, FieldValue::Quantity(q)) => (q.to_string(), None),
        (ColumnCheck::Unchecked, FieldValue::Text(t)) => (t.clone(), None),
        (ColumnCheck::Checked(_), FieldValue::Number(v)) => (v.to_string(), None),
        (ColumnCheck::Checked(unit), FieldValue::Quantity(q)) => convert(unit, q, nan),
        (ColumnCheck::Checked(unit), FieldValue::Text(t)) => {
            if let Ok(v) = t.trim().parse::<f64>() {
                return (v.to_string(), None);
            }
            match Quantity::parse(t) {
                Some(q) => convert(unit, &q, nan),
                None => nan(format!("'{t}' is not numeric")),
            }
        }
    }
}

fn convert(
    unit: &Unit,
    quantity: &Quantity,
    nan: impl Fn(String) -> (String, Option<String>),
) -> (String, Option<String>) {
    match quantity.to_unit(unit) {
        Some(v) => (v.to_string(), None),
        None => nan(format!("unit '{}' is not compatible with '{unit}'", quantity.unit)),
    }
}

// =============================================================================
// Loading
// =============================================================================

/// One stored field.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// Numeric field (including NaN).
    Number(f64),
    /// Anything else.
    Text(String),
}

impl Cell {
    fn parse(raw: &str) -> Self {
        raw.trim()
            .parse::<f64>()
            .map_or_else(|_| Cell::Text(raw.to_string()), Cell::Number)
    }

    /// Numeric value, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(v) => Some(*v),
            Cell::Text(_) => None,
        }
    }
}

/// Read-only reconstruction of a results file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedResults {
    /// Source file, when loaded from disk.
    pub path: Option<PathBuf>,
    /// Procedure name from the header.
    pub procedure: String,
    /// `(name, serialized value)` in file order.
    pub parameters: Vec<(String, String)>,
    /// `(name, serialized value)` in file order.
    pub metadata: Vec<(String, String)>,
    /// Columns from the column row.
    pub columns: Vec<Column>,
    /// Data rows.
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Parameters,
    Metadata,
}

impl LoadedResults {
    /// Parse the full text of a results file.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut loaded = LoadedResults::default();
        let mut section = Section::Parameters;
        let mut data_start = None;
        let mut offset = 0;

        for (index, line) in text.split_inclusive('\n').enumerate() {
            offset += line.len();
            let line_no = index + 1;
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }
            match trimmed {
                PARAMETERS_MARKER => section = Section::Parameters,
                METADATA_MARKER => section = Section::Metadata,
                DATA_MARKER => {
                    data_start = Some((offset, line_no));
                    break;
                }
                _ => {
                    let entry = trimmed.strip_prefix('#').ok_or_else(|| DaqError::HeaderParse {
                        line: line_no,
                        reason: "expected a '#' line before the data marker".to_string(),
                    })?;
                    let (name, value) =
                        entry.split_once(": ").ok_or_else(|| DaqError::HeaderParse {
                            line: line_no,
                            reason: format!("expected '#<name>: <value>', got '{trimmed}'"),
                        })?;
                    if name == PROCEDURE_KEY && loaded.procedure.is_empty() {
                        loaded.procedure = value.to_string();
                        continue;
                    }
                    let pair = (name.to_string(), value.to_string());
                    match section {
                        Section::Parameters => loaded.parameters.push(pair),
                        Section::Metadata => loaded.metadata.push(pair),
                    }
                }
            }
        }

        if let Some((start, marker_line)) = data_start {
            loaded.read_data(&text[start..], marker_line)?;
        }
        Ok(loaded)
    }

    fn read_data(&mut self, data: &str, marker_line: usize) -> AppResult<()> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(data.as_bytes());
        self.columns = reader.headers()?.iter().map(Column::parse).collect();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|e| DaqError::HeaderParse {
                line: marker_line + index + 2,
                reason: e.to_string(),
            })?;
            self.rows.push(record.iter().map(Cell::parse).collect());
        }
        Ok(())
    }

    /// Serialized value of a parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        lookup(&self.parameters, name)
    }

    /// Serialized value of a metadata field.
    pub fn metadata_value(&self, name: &str) -> Option<&str> {
        lookup(&self.metadata, name)
    }

    /// Number of data rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Every value of a column as a number (NaN for text), by column name.
    pub fn numeric_column(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.columns.iter().position(|c| c.name() == name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(index).and_then(Cell::as_f64).unwrap_or(f64::NAN))
                .collect(),
        )
    }

    /// Bind the loaded parameter values into `parameters`.
    ///
    /// Every stored parameter must be declared in `parameters`.
    pub fn restore_into(&self, parameters: &mut ParameterSet) -> AppResult<()> {
        for (name, raw) in &self.parameters {
            parameters.bind_str(name, raw)?;
        }
        Ok(())
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}
