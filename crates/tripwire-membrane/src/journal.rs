//! Shared reporting context handed to each tracker.

use crate::config::MembraneConfig;
use crate::diag::{Diagnostics, ReportKind};
use crate::error::MembraneError;
use crate::intern::{NameId, NameTable};
use crate::metrics::MembraneMetrics;
use crate::site::{CallSite, StoredSite};

/// Name table, diagnostic sink and counters.
#[derive(Debug)]
pub struct Journal {
    pub(crate) names: NameTable,
    pub(crate) diag: Diagnostics,
    pub(crate) metrics: MembraneMetrics,
    names_exhausted: bool,
}

impl Journal {
    pub(crate) fn new(config: &MembraneConfig) -> Result<Self, MembraneError> {
        Ok(Self {
            names: NameTable::new(config.name_capacity, config.name_max_len),
            diag: Diagnostics::open(&config.destination, config.format, config.retained_reports)?,
            metrics: MembraneMetrics::new(),
            names_exhausted: false,
        })
    }

    /// Intern a name, reporting table exhaustion the first time it happens.
    pub(crate) fn name_id(&mut self, name: &str) -> Option<NameId> {
        match self.names.intern(name) {
            Ok(id) => Some(id),
            Err(err) => {
                if !self.names_exhausted {
                    self.names_exhausted = true;
                    MembraneMetrics::inc(&self.metrics.exhaustions);
                    self.diag.emit(
                        ReportKind::Exhaustion,
                        "names",
                        None,
                        format!("{err}; further names are recorded as `?'"),
                    );
                }
                None
            }
        }
    }

    /// Retain a call site in interned form.
    pub(crate) fn stamp(&mut self, site: CallSite<'_>) -> StoredSite {
        StoredSite {
            file: self.name_id(site.file),
            line: site.line,
        }
    }

    pub(crate) fn name(&self, id: Option<NameId>) -> &str {
        id.map_or("?", |id| self.names.resolve(id))
    }

    /// `file, line N` for a retained site.
    pub(crate) fn describe(&self, site: StoredSite) -> String {
        format!("{}, line {}", self.name(site.file), site.line)
    }

    pub(crate) fn report(
        &mut self,
        kind: ReportKind,
        category: &str,
        site: CallSite<'_>,
        detail: impl Into<String>,
    ) {
        self.diag
            .emit(kind, category, Some(site.to_string()), detail.into());
    }

    /// Site-less informational line.
    pub(crate) fn note(&mut self, category: &str, detail: impl Into<String>) {
        self.diag.emit(ReportKind::Info, category, None, detail.into());
    }
}
