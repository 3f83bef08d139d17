//! Call-site metadata.

use std::fmt;
use std::panic::Location;

use crate::intern::NameId;

/// Source location of a wrapped call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite<'a> {
    pub file: &'a str,
    pub line: u32,
}

impl<'a> CallSite<'a> {
    #[must_use]
    pub const fn new(file: &'a str, line: u32) -> Self {
        Self { file, line }
    }
}

impl CallSite<'static> {
    /// The location of the caller of the function this is called from.
    #[must_use]
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for CallSite<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, line {}", self.file, self.line)
    }
}

/// [`CallSite`] for the line this macro is expanded on.
#[macro_export]
macro_rules! site {
    () => {
        $crate::CallSite::new(file!(), line!())
    };
}

/// A call site retained in a record. The file is `None` when the name
/// table was full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredSite {
    pub file: Option<NameId>,
    pub line: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_file_and_line() {
        assert_eq!(CallSite::new("io.c", 42).to_string(), "io.c, line 42");
    }

    #[test]
    fn macro_captures_this_file() {
        let here = crate::site!();
        assert!(here.file.ends_with("site.rs"));
        assert!(here.line > 0);
    }

    #[track_caller]
    fn callee() -> CallSite<'static> {
        CallSite::caller()
    }

    #[test]
    fn caller_reports_the_calling_line() {
        let expected = line!() + 1;
        let site = callee();
        assert_eq!(site.line, expected);
        assert!(site.file.ends_with("site.rs"));
    }
}
