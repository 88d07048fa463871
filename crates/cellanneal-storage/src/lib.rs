//! Cell tables on disk: reading initial cell parameters and writing fitted lineages.
//!
//! Tables are plain comma-separated text with a header row. Rod tables use
//! `file,name,x,y,width,length,rotation,split_alpha,opacity`; sphere tables
//! use `file,name,x,y,z,r,split_alpha,opacity`. Optional values may be
//! written as `None`. Unknown columns are ignored on read.

use cellanneal_core::{Bacilli, Cell, CellType, Lineage, Sphere};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Header written for rod tables.
pub const BACILLI_COLUMNS: &[&str] = &[
    "file",
    "name",
    "x",
    "y",
    "width",
    "length",
    "rotation",
    "split_alpha",
    "opacity",
];

/// Header written for sphere tables.
pub const SPHERE_COLUMNS: &[&str] = &["file", "name", "x", "y", "z", "r", "split_alpha", "opacity"];

const NONE_TOKEN: &str = "None";

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("table is missing required column `{0}`")]
    MissingColumn(&'static str),
    #[error("storage worker error: {0}")]
    Worker(String),
}

/// One table row: the image a cell belongs to and the cell itself.
#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    pub file: String,
    pub cell: Cell,
}

/// Column positions resolved from a header row.
struct Columns {
    cell_type: CellType,
    index: HashMap<String, usize>,
}

impl Columns {
    fn from_header(header: &str) -> Result<Self, StorageError> {
        let index: HashMap<String, usize> = header
            .split(',')
            .enumerate()
            .map(|(i, name)| (name.trim().to_string(), i))
            .collect();
        let cell_type = if index.contains_key("r") || index.contains_key("radius") {
            CellType::Sphere
        } else {
            CellType::Bacilli
        };
        let required: &[&'static str] = match cell_type {
            CellType::Bacilli => &["file", "name", "x", "y", "width", "length", "rotation"],
            CellType::Sphere => &["file", "name", "x", "y", "z"],
        };
        if let Some(missing) = required.iter().find(|name| !index.contains_key(**name)) {
            return Err(StorageError::MissingColumn(*missing));
        }
        Ok(Self { cell_type, index })
    }

    fn field<'a>(&self, fields: &[&'a str], name: &str) -> Option<&'a str> {
        self.index
            .get(name)
            .and_then(|i| fields.get(*i))
            .map(|value| value.trim())
    }

    fn text(&self, fields: &[&str], name: &'static str, line: usize) -> Result<String, StorageError> {
        self.field(fields, name)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Parse {
                line,
                message: format!("empty `{name}`"),
            })
    }

    fn number(&self, fields: &[&str], name: &'static str, line: usize) -> Result<f64, StorageError> {
        self.optional(fields, name, line)?
            .ok_or_else(|| StorageError::Parse {
                line,
                message: format!("`{name}` is required"),
            })
    }

    fn optional(
        &self,
        fields: &[&str],
        name: &str,
        line: usize,
    ) -> Result<Option<f64>, StorageError> {
        match self.field(fields, name) {
            None | Some("") | Some(NONE_TOKEN) => Ok(None),
            Some(value) => value.parse::<f64>().map(Some).map_err(|err| StorageError::Parse {
                line,
                message: format!("`{name}` = {value:?}: {err}"),
            }),
        }
    }

    fn record(&self, fields: &[&str], line: usize) -> Result<CellRecord, StorageError> {
        let file = self.text(fields, "file", line)?;
        let name = self.text(fields, "name", line)?;
        let x = self.number(fields, "x", line)?;
        let y = self.number(fields, "y", line)?;
        let split_alpha = self.optional(fields, "split_alpha", line)?;
        let opacity = self.optional(fields, "opacity", line)?;
        let cell = match self.cell_type {
            CellType::Bacilli => {
                let mut rod = Bacilli::new(
                    name,
                    x,
                    y,
                    self.number(fields, "width", line)?,
                    self.number(fields, "length", line)?,
                    self.number(fields, "rotation", line)?,
                );
                rod.split_alpha = split_alpha;
                rod.opacity = opacity;
                Cell::Bacilli(rod)
            }
            CellType::Sphere => {
                let radius = match self.optional(fields, "r", line)? {
                    Some(radius) => radius,
                    None => self.number(fields, "radius", line)?,
                };
                let mut sphere = Sphere::new(name, x, y, self.number(fields, "z", line)?, radius);
                sphere.split_alpha = split_alpha;
                sphere.opacity = opacity;
                Cell::Sphere(sphere)
            }
        };
        Ok(CellRecord { file, cell })
    }
}

/// Parses a cell table from `reader`. Blank lines are skipped.
pub fn parse_cell_table<R: BufRead>(reader: R) -> Result<(CellType, Vec<CellRecord>), StorageError> {
    let mut lines = reader.lines().enumerate();
    let header = loop {
        match lines.next() {
            Some((_, line)) => {
                let line = line?;
                if !line.trim().is_empty() {
                    break line;
                }
            }
            None => {
                return Err(StorageError::Parse {
                    line: 1,
                    message: "table has no header".into(),
                });
            }
        }
    };
    let columns = Columns::from_header(header.trim_start_matches('\u{feff}'))?;
    let mut records = Vec::new();
    for (index, line) in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        records.push(columns.record(&fields, index + 1)?);
    }
    debug!(rows = records.len(), cell_type = %columns.cell_type, "parsed cell table");
    Ok((columns.cell_type, records))
}

/// Reads a cell table from disk.
pub fn read_cell_table(path: &Path) -> Result<(CellType, Vec<CellRecord>), StorageError> {
    let file = File::open(path)?;
    parse_cell_table(BufReader::new(file))
}

/// Groups records by image file, keeping the order in which files first appear.
#[must_use]
pub fn group_by_file(records: Vec<CellRecord>) -> Vec<(String, Vec<Cell>)> {
    let mut groups: Vec<(String, Vec<Cell>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for CellRecord { file, cell } in records {
        match positions.get(&file) {
            Some(&index) => groups[index].1.push(cell),
            None => {
                positions.insert(file.clone(), groups.len());
                groups.push((file, vec![cell]));
            }
        }
    }
    groups
}

fn optional_value(value: Option<f64>) -> String {
    value.map_or_else(|| NONE_TOKEN.to_string(), |v| v.to_string())
}

/// Column names for tables of `cell_type`.
#[must_use]
pub const fn columns_for(cell_type: CellType) -> &'static [&'static str] {
    match cell_type {
        CellType::Bacilli => BACILLI_COLUMNS,
        CellType::Sphere => SPHERE_COLUMNS,
    }
}

/// Writes the header row for `cell_type`.
pub fn write_header<W: Write>(writer: &mut W, cell_type: CellType) -> io::Result<()> {
    writeln!(writer, "{}", columns_for(cell_type).join(","))
}

/// Writes one row.
pub fn write_record<W: Write>(writer: &mut W, file: &str, cell: &Cell) -> io::Result<()> {
    match cell {
        Cell::Bacilli(rod) => writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{}",
            file,
            rod.name,
            rod.position.x,
            rod.position.y,
            rod.width,
            rod.length,
            rod.rotation,
            optional_value(rod.split_alpha),
            optional_value(rod.opacity),
        ),
        Cell::Sphere(sphere) => writeln!(
            writer,
            "{},{},{},{},{},{},{},{}",
            file,
            sphere.name,
            sphere.position.x,
            sphere.position.y,
            sphere.z,
            sphere.radius,
            optional_value(sphere.split_alpha),
            optional_value(sphere.opacity),
        ),
    }
}

/// Writes a complete table, header included.
pub fn write_cell_table<'a, W: Write>(
    writer: &mut W,
    cell_type: CellType,
    rows: impl IntoIterator<Item = (&'a str, &'a Cell)>,
) -> io::Result<()> {
    write_header(writer, cell_type)?;
    for (file, cell) in rows {
        write_record(writer, file, cell)?;
    }
    Ok(())
}

/// Rows for `frames` of a lineage, sorted by file and then cell name.
#[must_use]
pub fn lineage_rows(lineage: &Lineage, files: &[String], frames: usize) -> Vec<CellRecord> {
    let mut rows: Vec<CellRecord> = files
        .iter()
        .take(frames.min(lineage.len()))
        .enumerate()
        .flat_map(|(index, file)| {
            lineage.cells(index).into_iter().map(move |cell| CellRecord {
                file: file.clone(),
                cell,
            })
        })
        .collect();
    rows.sort_by(|a, b| a.file.cmp(&b.file).then_with(|| a.cell.name().cmp(b.cell.name())));
    rows
}

/// Append-only table file with buffered writes.
pub struct TableWriter {
    cell_type: CellType,
    writer: BufWriter<File>,
}

impl TableWriter {
    /// Creates (or truncates) `path` and writes the header.
    pub fn create(path: &Path, cell_type: CellType) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        write_header(&mut writer, cell_type)?;
        Ok(Self { cell_type, writer })
    }

    /// Appends the cells of one frame and returns the number of rows written.
    pub fn append(&mut self, file: &str, cells: &[Cell]) -> Result<usize, StorageError> {
        let mut sorted: Vec<&Cell> = cells.iter().collect();
        sorted.sort_by(|a, b| a.name().cmp(b.name()));
        let mut written = 0;
        for cell in sorted {
            if cell.cell_type() != self.cell_type {
                warn!(cell = cell.name(), "skipping cell of a different type than the table");
                continue;
            }
            write_record(&mut self.writer, file, cell)?;
            written += 1;
        }
        Ok(written)
    }

    pub fn flush(&mut self) -> Result<(), StorageError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug)]
enum TableCommand {
    Append { file: String, cells: Vec<Cell> },
    Flush,
    Shutdown,
}

/// Writes finished frames on a background thread.
pub struct TablePipeline {
    tx: mpsc::Sender<TableCommand>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TablePipeline {
    /// Creates the table at `path` and starts the writer thread.
    pub fn new(path: &Path, cell_type: CellType) -> Result<Self, StorageError> {
        Self::from_writer(TableWriter::create(path, cell_type)?)
    }

    fn from_writer(mut writer: TableWriter) -> Result<Self, StorageError> {
        let (tx, rx) = mpsc::channel::<TableCommand>();
        let handle = thread::Builder::new()
            .name("cellanneal-table-writer".into())
            .spawn(move || {
                let mut rows = 0;
                while let Ok(command) = rx.recv() {
                    match command {
                        TableCommand::Append { file, cells } => match writer.append(&file, &cells) {
                            Ok(written) => rows += written,
                            Err(err) => error!(%file, %err, "failed to write frame rows"),
                        },
                        TableCommand::Flush => {
                            if let Err(err) = writer.flush() {
                                error!(%err, "failed to flush cell table");
                            }
                        }
                        TableCommand::Shutdown => break,
                    }
                }
                if let Err(err) = writer.flush() {
                    error!(%err, "failed to flush cell table");
                }
                debug!(rows, "cell table closed");
            })
            .map_err(|err| {
                StorageError::Worker(format!("failed to spawn table writer thread: {err}"))
            })?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Queues the cells of one finished frame.
    pub fn append(&self, file: impl Into<String>, cells: Vec<Cell>) {
        let file = file.into();
        if let Err(err) = self.tx.send(TableCommand::Append { file, cells }) {
            warn!(%err, "table writer channel closed; frame dropped");
        }
    }

    /// Request an immediate flush of buffered rows.
    pub fn flush(&self) {
        let _ = self.tx.send(TableCommand::Flush);
    }
}

impl Drop for TablePipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(TableCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.join()
        {
            error!("table writer thread panicked: {err:?}");
        }
    }
}
