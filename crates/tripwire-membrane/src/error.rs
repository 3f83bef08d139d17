//! Error types.
//!
//! Wrapped primitives never surface these to their callers: misuse is
//! reported through the diagnostic sink and degraded to a neutral result.
//! Errors here are for setup and for the typed building blocks.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The name table refused a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InternError {
    #[error("name table full ({capacity} names)")]
    TableFull { capacity: usize },
}

/// Setup and boundary failures.
#[derive(Debug, Error)]
pub enum MembraneError {
    #[error("cannot open diagnostic log {}: {source}", path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid open mode {0:?}")]
    OpenMode(String),
    #[error("no valid layout for a {size}-byte block")]
    Layout { size: usize },
    #[error(transparent)]
    Heap(#[from] tripwire_heap::HeapError),
}
