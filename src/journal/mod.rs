//! Append-only command journals.
//!
//! Every durable entity writes one journal: the database itself and each
//! cube. A journal is line-oriented text, one record per mutating command:
//!
//! ```text
//! timestamp;user;event;command;field;field;...
//! ```
//!
//! Timestamps are `epoch_seconds.micros`. Fields are escaped CSV-style
//! (quoted when they contain `;`, `"`, or a newline, embedded quotes
//! doubled). Multi-value fields are comma-separated sub-lists. The first
//! record of every journal is a `VERSION` pseudo-record carrying
//! `(release, service_release, build)`; anything older than the minimum
//! supported release is unreadable and fails the load.
//!
//! Journal writing and model mutation are deliberately not atomic with
//! each other; the replay pass at load time (see [`replay`]) is what
//! restores consistency after a crash between the two.

pub mod replay;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::context::TransactionContext;
use crate::error::{EngineError, Result};

/// Current journal format version.
pub const JOURNAL_RELEASE: u32 = 1;
pub const JOURNAL_SERVICE_RELEASE: u32 = 0;
pub const JOURNAL_BUILD: u32 = 1;

/// Journals written before this release cannot be replayed.
pub const MIN_SUPPORTED_RELEASE: u32 = 1;

/// Extension of the archived (already folded into a snapshot) journal.
pub const ARCHIVE_SUFFIX: &str = "archived";

/// Every mutating command a journal can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Version,
    CreateDimension,
    RenameDimension,
    DeleteDimension,
    CreateElement,
    RenameElement,
    ChangeElementType,
    AppendChildren,
    RemoveChildren,
    MoveElement,
    DeleteElements,
    ClearElements,
    CreateCube,
    DeleteCube,
    BulkStart,
    BulkStop,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => return "VERSION",
            Command::CreateDimension => return "CREATE_DIMENSION",
            Command::RenameDimension => return "RENAME_DIMENSION",
            Command::DeleteDimension => return "DELETE_DIMENSION",
            Command::CreateElement => return "CREATE_ELEMENT",
            Command::RenameElement => return "RENAME_ELEMENT",
            Command::ChangeElementType => return "CHANGE_ELEMENT_TYPE",
            Command::AppendChildren => return "APPEND_CHILDREN",
            Command::RemoveChildren => return "REMOVE_CHILDREN",
            Command::MoveElement => return "MOVE_ELEMENT",
            Command::DeleteElements => return "DELETE_ELEMENTS",
            Command::ClearElements => return "CLEAR_ELEMENTS",
            Command::CreateCube => return "CREATE_CUBE",
            Command::DeleteCube => return "DELETE_CUBE",
            Command::BulkStart => return "BULK_START",
            Command::BulkStop => return "BULK_STOP",
        }
    }

    pub fn from_name(name: &str) -> Option<Command> {
        match name {
            "VERSION" => return Some(Command::Version),
            "CREATE_DIMENSION" => return Some(Command::CreateDimension),
            "RENAME_DIMENSION" => return Some(Command::RenameDimension),
            "DELETE_DIMENSION" => return Some(Command::DeleteDimension),
            "CREATE_ELEMENT" => return Some(Command::CreateElement),
            "RENAME_ELEMENT" => return Some(Command::RenameElement),
            "CHANGE_ELEMENT_TYPE" => return Some(Command::ChangeElementType),
            "APPEND_CHILDREN" => return Some(Command::AppendChildren),
            "REMOVE_CHILDREN" => return Some(Command::RemoveChildren),
            "MOVE_ELEMENT" => return Some(Command::MoveElement),
            "DELETE_ELEMENTS" => return Some(Command::DeleteElements),
            "CLEAR_ELEMENTS" => return Some(Command::ClearElements),
            "CREATE_CUBE" => return Some(Command::CreateCube),
            "DELETE_CUBE" => return Some(Command::DeleteCube),
            "BULK_START" => return Some(Command::BulkStart),
            "BULK_STOP" => return Some(Command::BulkStop),
            _ => return None,
        }
    }
}

/// One journal record: when, who, what.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub time: DateTime<Utc>,
    pub user: String,
    pub event: String,
    pub command: Command,
    pub fields: Vec<String>,
}

impl Record {
    pub fn new(ctx: &TransactionContext, command: Command, fields: Vec<String>) -> Record {
        return Record {
            time: Utc::now(),
            user: ctx.user.clone(),
            event: ctx.event.clone(),
            command,
            fields,
        };
    }

    fn version(ctx: &TransactionContext) -> Record {
        return Record::new(
            ctx,
            Command::Version,
            vec![
                JOURNAL_RELEASE.to_string(),
                JOURNAL_SERVICE_RELEASE.to_string(),
                JOURNAL_BUILD.to_string(),
            ],
        );
    }

    pub fn to_line(&self) -> String {
        let mut parts = vec![
            format!("{}.{:06}", self.time.timestamp(), self.time.timestamp_subsec_micros()),
            escape(&self.user),
            escape(&self.event),
            self.command.name().to_string(),
        ];
        parts.extend(self.fields.iter().map(|field| escape(field)));
        return parts.join(";");
    }

    pub fn parse(line: &str) -> Result<Record> {
        let parts = split_line(line)
            .map_err(|err| EngineError::CorruptFile(format!("bad journal line: {err}")))?;
        if parts.len() < 4 {
            return Err(EngineError::CorruptFile(format!("short journal line: {line}")));
        }
        let time = parse_timestamp(&parts[0])?;
        let command = Command::from_name(&parts[3]).ok_or_else(|| {
            EngineError::CorruptFile(format!("unknown journal command: {}", parts[3]))
        })?;
        return Ok(Record {
            time,
            user: parts[1].clone(),
            event: parts[2].clone(),
            command,
            fields: parts[4..].to_vec(),
        });
    }

    // Typed field accessors. Out-of-range or malformed fields are corrupt
    // journal data, never a panic.

    pub fn field(&self, i: usize) -> Result<&str> {
        return self
            .fields
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| EngineError::CorruptFile(format!("missing journal field {i}")));
    }

    pub fn field_u64(&self, i: usize) -> Result<u64> {
        return self
            .field(i)?
            .parse()
            .map_err(|_| EngineError::CorruptFile(format!("bad number in journal field {i}")));
    }

    pub fn field_u32(&self, i: usize) -> Result<u32> {
        return self
            .field(i)?
            .parse()
            .map_err(|_| EngineError::CorruptFile(format!("bad number in journal field {i}")));
    }

    /// Parse a comma-separated id sub-list.
    pub fn field_u64s(&self, i: usize) -> Result<Vec<u64>> {
        let raw = self.field(i)?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        return raw
            .split(',')
            .map(|part| {
                part.parse()
                    .map_err(|_| EngineError::CorruptFile(format!("bad id list in journal field {i}")))
            })
            .collect();
    }

    /// Parse a comma-separated weight sub-list.
    pub fn field_f64s(&self, i: usize) -> Result<Vec<f64>> {
        let raw = self.field(i)?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        return raw
            .split(',')
            .map(|part| {
                part.parse().map_err(|_| {
                    EngineError::CorruptFile(format!("bad weight list in journal field {i}"))
                })
            })
            .collect();
    }
}

/// Join numbers into a comma-separated sub-list field.
pub fn join_list<T: std::fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    return items.into_iter().map(|item| item.to_string()).collect::<Vec<_>>().join(",");
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let corrupt = || EngineError::CorruptFile(format!("bad journal timestamp: {raw}"));
    let (seconds, micros) = raw.split_once('.').ok_or_else(corrupt)?;
    let seconds: i64 = seconds.parse().map_err(|_| corrupt())?;
    let micros: u32 = micros.parse().ok().filter(|m| *m <= 999_999).ok_or_else(corrupt)?;
    return Utc.timestamp_opt(seconds, micros * 1000).single().ok_or_else(corrupt);
}

/// Quote a field if it contains the delimiter, a quote, or a newline.
pub(crate) fn escape(field: &str) -> String {
    if field.contains(';') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        return format!("\"{}\"", field.replace('"', "\"\""));
    }
    return field.to_string();
}

/// Split a journal line on `;`, honoring quoted fields. The snapshot file
/// format shares this dialect.
pub(crate) fn split_line(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        if quoted {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    quoted = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' && current.is_empty() {
            quoted = true;
        } else if c == ';' {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if quoted {
        return Err("unterminated quote".to_string());
    }
    fields.push(current);
    return Ok(fields);
}

/// Append side of one journal file.
pub struct JournalWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

impl JournalWriter {
    /// Open (or create) the journal at `path`. A freshly created journal
    /// gets its `VERSION` record immediately.
    pub fn open(path: impl Into<PathBuf>) -> Result<JournalWriter> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| EngineError::CorruptFile(format!("open journal {}: {err}", path.display())))?;
        let fresh = file
            .metadata()
            .map(|meta| meta.len() == 0)
            .map_err(|err| EngineError::CorruptFile(format!("stat journal: {err}")))?;
        let mut writer = JournalWriter { path, file: BufWriter::new(file) };
        if fresh {
            let ctx = TransactionContext::system("journal-open");
            writer.append(&Record::version(&ctx))?;
            writer.flush()?;
        }
        return Ok(writer);
    }

    pub fn path(&self) -> &Path {
        return &self.path;
    }

    pub fn append(&mut self, record: &Record) -> Result<()> {
        let line = record.to_line();
        writeln!(self.file, "{line}")
            .map_err(|err| EngineError::Internal(format!("journal append failed: {err}")))?;
        return Ok(());
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .map_err(|err| EngineError::Internal(format!("journal flush failed: {err}")))?;
        return Ok(());
    }

    /// Move everything written so far into the archive file and truncate
    /// the live journal. Called after the journal has been folded into a
    /// saved snapshot; replay must never see these records again.
    pub fn archive(&mut self) -> Result<()> {
        self.flush()?;
        let mut contents = String::new();
        File::open(&self.path)
            .and_then(|mut file| file.read_to_string(&mut contents))
            .map_err(|err| EngineError::CorruptFile(format!("read journal for archive: {err}")))?;
        let archive_path = archive_path(&self.path);
        let mut archive = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&archive_path)
            .map_err(|err| EngineError::CorruptFile(format!("open archive: {err}")))?;
        archive
            .write_all(contents.as_bytes())
            .map_err(|err| EngineError::Internal(format!("archive write failed: {err}")))?;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|err| EngineError::Internal(format!("truncate journal failed: {err}")))?;
        self.file = BufWriter::new(file);
        debug!(journal = %self.path.display(), "journal archived");
        // The truncated journal starts over with a fresh VERSION record.
        let ctx = TransactionContext::system("journal-archive");
        self.append(&Record::version(&ctx))?;
        self.flush()?;
        return Ok(());
    }
}

pub fn archive_path(journal: &Path) -> PathBuf {
    let mut path = journal.to_path_buf();
    let extension = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!("{ext}.{ARCHIVE_SUFFIX}"),
        None => ARCHIVE_SUFFIX.to_string(),
    };
    path.set_extension(extension);
    return path;
}

/// Read all pending (non-archived) records of one journal. Validates the
/// leading `VERSION` record and strips it from the result.
pub fn read_journal(path: &Path) -> Result<Vec<Record>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut contents = String::new();
    File::open(path)
        .and_then(|mut file| file.read_to_string(&mut contents))
        .map_err(|err| EngineError::CorruptFile(format!("read journal {}: {err}", path.display())))?;
    let mut records = Vec::new();
    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }
        records.push(Record::parse(line)?);
    }
    if let Some(first) = records.first() {
        if first.command != Command::Version {
            return Err(EngineError::CorruptFile(format!(
                "journal {} does not start with a VERSION record",
                path.display()
            )));
        }
        let release = first.field_u32(0)?;
        if release < MIN_SUPPORTED_RELEASE {
            return Err(EngineError::InvalidVersion {
                found: release,
                minimum: MIN_SUPPORTED_RELEASE,
            });
        }
    }
    records.retain(|record| record.command != Command::Version);
    return Ok(records);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TransactionContext {
        return TransactionContext::new("alice", "test");
    }

    #[test]
    fn record_lines_round_trip() {
        let record = Record::new(
            &ctx(),
            Command::CreateElement,
            vec!["5".to_string(), "Total; \"2024\"".to_string(), "1".to_string()],
        );
        let parsed = Record::parse(&record.to_line()).unwrap();
        assert_eq!(parsed.command, Command::CreateElement);
        assert_eq!(parsed.user, "alice");
        assert_eq!(parsed.fields[1], "Total; \"2024\"");
        // Timestamps survive at microsecond precision.
        assert_eq!(
            parsed.time.timestamp_subsec_micros(),
            record.time.timestamp_subsec_micros()
        );
    }

    #[test]
    fn sub_lists_round_trip() {
        let record = Record::new(
            &ctx(),
            Command::AppendChildren,
            vec!["1".to_string(), join_list([5u64, 6, 7]), join_list([1.5f64, -2.0, 0.25])],
        );
        let parsed = Record::parse(&record.to_line()).unwrap();
        assert_eq!(parsed.field_u64s(1).unwrap(), vec![5, 6, 7]);
        assert_eq!(parsed.field_f64s(2).unwrap(), vec![1.5, -2.0, 0.25]);
    }

    #[test]
    fn empty_sub_list_parses_empty() {
        let record = Record::new(&ctx(), Command::DeleteElements, vec![String::new()]);
        let parsed = Record::parse(&record.to_line()).unwrap();
        assert_eq!(parsed.field_u64s(0).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn unknown_command_is_corrupt() {
        let line = "100.000001;u;e;FROBNICATE;1";
        assert!(matches!(Record::parse(line), Err(EngineError::CorruptFile(_))));
    }

    #[test]
    fn oversized_timestamp_fraction_is_corrupt() {
        // A fraction above 999999 is not microseconds; it must fail the
        // parse, not wrap in the nanosecond conversion.
        let line = "100.4294968;u;e;CREATE_ELEMENT;1;5;X;1";
        assert!(matches!(Record::parse(line), Err(EngineError::CorruptFile(_))));
    }

    #[test]
    fn writer_creates_version_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.log");
        let mut writer = JournalWriter::open(&path).unwrap();
        writer.append(&Record::new(&ctx(), Command::CreateDimension, vec!["1".into(), "d".into()])).unwrap();
        writer.flush().unwrap();

        let records = read_journal(&path).unwrap();
        // VERSION validated and stripped; our record remains.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command, Command::CreateDimension);
    }

    #[test]
    fn too_old_journal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.log");
        std::fs::write(&path, "100.000000;#system;open;VERSION;0;0;1\n").unwrap();
        let err = read_journal(&path).unwrap_err();
        assert_eq!(err, EngineError::InvalidVersion { found: 0, minimum: MIN_SUPPORTED_RELEASE });
    }

    #[test]
    fn archive_truncates_and_preserves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.log");
        let mut writer = JournalWriter::open(&path).unwrap();
        writer.append(&Record::new(&ctx(), Command::CreateDimension, vec!["1".into(), "d".into()])).unwrap();
        writer.archive().unwrap();

        assert!(read_journal(&path).unwrap().is_empty());
        let archived = std::fs::read_to_string(archive_path(&path)).unwrap();
        assert!(archived.contains("CREATE_DIMENSION"));
    }
}
