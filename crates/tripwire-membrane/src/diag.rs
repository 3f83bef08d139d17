//! Diagnostic records and the append-only sink they are written to.
//!
//! Every finding becomes a [`Report`]. The sink renders it as a text line
//! (`category - site - detail`) or as one JSON object per line, and keeps a
//! bounded tail of records in memory so callers can inspect what was said.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};

use serde::Serialize;

use crate::config::{Destination, LogFormat};
use crate::error::MembraneError;

/// Classification of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Null or otherwise invalid arguments.
    Usage,
    /// An operation exceeded a known capacity and was clamped.
    Overrun,
    /// The source could overflow the destination; nothing was changed.
    PotentialOverrun,
    /// Double release, bad close, handle reuse, wrong-class release.
    Lifecycle,
    /// A guard sentinel no longer holds its value.
    Corruption,
    /// A table or allocator ran out of room.
    Exhaustion,
    /// Banners, trace lines and leak listings.
    Info,
}

/// One diagnostic record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub seq: u64,
    pub kind: ReportKind,
    /// The wrapped operation, e.g. `free` or `strcpy`.
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub detail: String,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.site, self.kind) {
            (Some(site), _) => write!(f, "{} - {} - {}", self.category, site, self.detail),
            (None, ReportKind::Info) => f.write_str(&self.detail),
            (None, _) => write!(f, "{} - {}", self.category, self.detail),
        }
    }
}

enum Sink {
    Stderr,
    File(BufWriter<File>),
    Memory,
}

/// Single append-only diagnostic destination.
pub struct Diagnostics {
    sink: Sink,
    format: LogFormat,
    retained: VecDeque<Report>,
    capacity: usize,
    next_seq: u64,
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("format", &self.format)
            .field("retained", &self.retained.len())
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

impl Diagnostics {
    /// Open `destination`. Files are created if missing and appended to.
    pub fn open(
        destination: &Destination,
        format: LogFormat,
        capacity: usize,
    ) -> Result<Self, MembraneError> {
        let sink = match destination {
            Destination::Stderr => Sink::Stderr,
            Destination::Memory => Sink::Memory,
            Destination::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| MembraneError::Destination {
                        path: path.clone(),
                        source,
                    })?;
                Sink::File(BufWriter::new(file))
            }
        };
        Ok(Self {
            sink,
            format,
            retained: VecDeque::new(),
            capacity,
            next_seq: 0,
        })
    }

    /// In-memory sink retaining up to `capacity` records.
    #[must_use]
    pub fn memory(capacity: usize) -> Self {
        Self {
            sink: Sink::Memory,
            format: LogFormat::Text,
            retained: VecDeque::new(),
            capacity,
            next_seq: 0,
        }
    }

    /// Record and write one report. Returns its sequence number.
    pub fn emit(
        &mut self,
        kind: ReportKind,
        category: &str,
        site: Option<String>,
        detail: String,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let report = Report {
            seq,
            kind,
            category: category.to_string(),
            site,
            detail,
        };
        // A failing sink cannot be reported anywhere else.
        let _ = self.write(&report);
        if self.capacity > 0 {
            if self.retained.len() == self.capacity {
                self.retained.pop_front();
            }
            self.retained.push_back(report);
        }
        seq
    }

    fn write(&mut self, report: &Report) -> io::Result<()> {
        let line = match self.format {
            LogFormat::Text => report.to_string(),
            LogFormat::Jsonl => serde_json::to_string(report).map_err(io::Error::other)?,
        };
        match &mut self.sink {
            Sink::Stderr => writeln!(io::stderr().lock(), "{line}"),
            Sink::File(writer) => writeln!(writer, "{line}"),
            Sink::Memory => Ok(()),
        }
    }

    /// Retained records, oldest first.
    pub fn reports(&self) -> impl Iterator<Item = &Report> {
        self.retained.iter()
    }

    /// Retained records of one kind.
    #[must_use]
    pub fn count(&self, kind: ReportKind) -> usize {
        self.retained.iter().filter(|r| r.kind == kind).count()
    }

    /// Remove and return every retained record.
    pub fn drain(&mut self) -> Vec<Report> {
        self.retained.drain(..).collect()
    }

    /// Total records emitted, retained or not.
    #[must_use]
    pub const fn emitted(&self) -> u64 {
        self.next_seq
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Stderr => io::stderr().flush(),
            Sink::File(writer) => writer.flush(),
            Sink::Memory => Ok(()),
        }
    }
}
