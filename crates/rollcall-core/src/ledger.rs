//! Append-only attendance ledger backed by a headerless CSV file.
//!
//! Each row is `name,YYYY-MM-DD HH:MM:SS`. A person counts as marked for a
//! day when any row carries their name and a timestamp starting with that
//! date. Uniqueness is enforced by checking before writing, not by the file.

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance ledger {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One attendance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub name: String,
    pub timestamp: NaiveDateTime,
}

impl AttendanceRecord {
    fn to_row(&self) -> String {
        format!(
            "{},{}\n",
            quote_field(&self.name),
            self.timestamp.format(TIMESTAMP_FORMAT)
        )
    }
}

/// Handle to the ledger file. Holds no open descriptor between calls.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `name` already has a row dated `day`. A missing file means no.
    pub fn is_marked(&self, name: &str, day: NaiveDate) -> Result<bool, LedgerError> {
        let prefix = day.format(DATE_FORMAT).to_string();
        Ok(self
            .rows()?
            .iter()
            .any(|row| row[0] == name && row[1].starts_with(&prefix)))
    }

    /// [`is_marked`](Self::is_marked) for the local calendar day.
    pub fn is_marked_today(&self, name: &str) -> Result<bool, LedgerError> {
        self.is_marked(name, Local::now().date_naive())
    }

    /// Append a row for `name` at `at`, creating the file if needed.
    pub fn mark(&self, name: &str, at: NaiveDateTime) -> Result<AttendanceRecord, LedgerError> {
        let record = AttendanceRecord {
            name: name.to_string(),
            timestamp: at,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;

        let mut row = String::new();
        if !ends_with_newline(&mut file).map_err(|source| self.io_error(source))? {
            row.push('\n');
        }
        row.push_str(&record.to_row());
        file.write_all(row.as_bytes())
            .map_err(|source| self.io_error(source))?;

        tracing::info!(
            name,
            timestamp = %record.timestamp.format(TIMESTAMP_FORMAT),
            ledger = %self.path.display(),
            "attendance marked"
        );
        Ok(record)
    }

    /// [`mark`](Self::mark) with the current local time, truncated to seconds.
    pub fn mark_now(&self, name: &str) -> Result<AttendanceRecord, LedgerError> {
        let now = Local::now().naive_local();
        let at = now.with_nanosecond(0).unwrap_or(now);
        self.mark(name, at)
    }

    /// Every parseable record dated `day`, in file order.
    pub fn records_on(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let prefix = day.format(DATE_FORMAT).to_string();
        let records = self
            .rows()?
            .into_iter()
            .filter(|row| row[1].starts_with(&prefix))
            .filter_map(|row| {
                match NaiveDateTime::parse_from_str(row[1].trim(), TIMESTAMP_FORMAT) {
                    Ok(timestamp) => Some(AttendanceRecord {
                        name: row[0].clone(),
                        timestamp,
                    }),
                    Err(e) => {
                        tracing::warn!(row = ?row, error = %e, "unparseable attendance timestamp");
                        None
                    }
                }
            })
            .collect();
        Ok(records)
    }

    /// All rows with at least two fields.
    fn rows(&self) -> Result<Vec<Vec<String>>, LedgerError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };

        Ok(parse_rows(&content)
            .into_iter()
            .filter(|row| match row.len() {
                0 => false,
                1 if row[0].is_empty() => false,
                1 => {
                    tracing::warn!(row = ?row, "skipping attendance row without timestamp");
                    false
                }
                _ => true,
            })
            .collect())
    }

    fn io_error(&self, source: io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split CSV content into rows of fields. Handles quoted fields with doubled
/// quotes and embedded newlines; tolerates CRLF line endings.
fn parse_rows(content: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

/// Whether the file is empty or its last byte is `\n`.
fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
