//! Runtime configuration.
//!
//! The process-wide session reads its configuration from the environment on
//! first use:
//! - `TRIPWIRE_MODE`: `guarded` (default) checks every buffer primitive;
//!   `off` turns the buffer guard into a pure passthrough for baseline
//!   measurements. Allocation and file tracking stay active in both modes.
//! - `TRIPWIRE_LOG`: path of the diagnostic log. Unset means stderr.
//! - `TRIPWIRE_FORMAT`: `text` (default) or `jsonl`.
//! - `TRIPWIRE_TRACE`: any truthy value logs every open, close and dup.
//!
//! Unknown values fall back to the defaults.

use std::path::PathBuf;

/// Buffer guard operating mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardMode {
    /// Validate, clamp and report.
    #[default]
    Guarded,
    /// No validation. Delegates straight to the underlying primitive.
    Off,
}

impl GuardMode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" | "passthrough" => Self::Off,
            _ => Self::Guarded,
        }
    }

    /// Returns true if buffer primitives are checked.
    #[must_use]
    pub const fn checks_enabled(self) -> bool {
        matches!(self, Self::Guarded)
    }
}

/// Encoding of diagnostic records.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogFormat {
    /// `category - site - detail` lines.
    #[default]
    Text,
    /// One JSON object per line.
    Jsonl,
}

impl LogFormat {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" | "json" | "ndjson" => Self::Jsonl,
            _ => Self::Text,
        }
    }
}

/// Where diagnostic records go.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum Destination {
    #[default]
    Stderr,
    /// Append to the named file.
    File(PathBuf),
    /// Keep records in memory only.
    Memory,
}

/// Full configuration for a [`crate::Membrane`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembraneConfig {
    pub mode: GuardMode,
    pub destination: Destination,
    pub format: LogFormat,
    /// Log every open, close and duplicate.
    pub trace_files: bool,
    pub name_capacity: usize,
    pub name_max_len: usize,
    /// Highest handle number the file tracker records, exclusive.
    pub handle_capacity: usize,
    /// Released blocks remembered for double-release diagnosis.
    pub release_ledger: usize,
    /// Records kept in memory for inspection.
    pub retained_reports: usize,
}

impl Default for MembraneConfig {
    fn default() -> Self {
        Self {
            mode: GuardMode::Guarded,
            destination: Destination::Stderr,
            format: LogFormat::Text,
            trace_files: false,
            name_capacity: 256,
            name_max_len: 64,
            handle_capacity: 64,
            release_ledger: 1024,
            retained_reports: 4096,
        }
    }
}

impl MembraneConfig {
    /// Configuration that only records in memory, for tests and embedding.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            destination: Destination::Memory,
            ..Self::default()
        }
    }

    /// Read `TRIPWIRE_*` variables from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(mode) = lookup("TRIPWIRE_MODE") {
            config.mode = GuardMode::from_str_loose(&mode);
        }
        if let Some(path) = lookup("TRIPWIRE_LOG").filter(|p| !p.trim().is_empty()) {
            config.destination = Destination::File(PathBuf::from(path));
        }
        if let Some(format) = lookup("TRIPWIRE_FORMAT") {
            config.format = LogFormat::from_str_loose(&format);
        }
        if let Some(trace) = lookup("TRIPWIRE_TRACE") {
            config.trace_files = is_truthy(&trace);
        }
        config
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_guard_modes() {
        assert_eq!(GuardMode::from_str_loose("guarded"), GuardMode::Guarded);
        assert_eq!(GuardMode::from_str_loose("OFF"), GuardMode::Off);
        assert_eq!(GuardMode::from_str_loose("passthrough"), GuardMode::Off);
        assert_eq!(GuardMode::from_str_loose("garbage"), GuardMode::Guarded);
        assert!(GuardMode::Guarded.checks_enabled());
        assert!(!GuardMode::Off.checks_enabled());
    }

    #[test]
    fn parse_formats() {
        assert_eq!(LogFormat::from_str_loose("jsonl"), LogFormat::Jsonl);
        assert_eq!(LogFormat::from_str_loose("JSON"), LogFormat::Jsonl);
        assert_eq!(LogFormat::from_str_loose("text"), LogFormat::Text);
        assert_eq!(LogFormat::from_str_loose(""), LogFormat::Text);
    }

    #[test]
    fn lookup_without_variables_gives_defaults() {
        assert_eq!(MembraneConfig::from_lookup(|_| None), MembraneConfig::default());
    }

    #[test]
    fn lookup_applies_every_variable() {
        let config = MembraneConfig::from_lookup(|key| {
            let value = match key {
                "TRIPWIRE_MODE" => "off",
                "TRIPWIRE_LOG" => "/tmp/tripwire.log",
                "TRIPWIRE_FORMAT" => "jsonl",
                "TRIPWIRE_TRACE" => "yes",
                _ => return None,
            };
            Some(value.to_string())
        });
        assert_eq!(config.mode, GuardMode::Off);
        assert_eq!(
            config.destination,
            Destination::File(PathBuf::from("/tmp/tripwire.log"))
        );
        assert_eq!(config.format, LogFormat::Jsonl);
        assert!(config.trace_files);
    }

    #[test]
    fn empty_log_path_keeps_stderr() {
        let config = MembraneConfig::from_lookup(|key| (key == "TRIPWIRE_LOG").then(String::new));
        assert_eq!(config.destination, Destination::Stderr);
    }
}
