//! Diagnostic memory and resource-safety layer.
//!
//! `tripwire-membrane` sits between a program and its allocation, string and
//! file primitives. Each wrapped call carries the [`CallSite`] it came from,
//! so every finding can name the lines involved.
//!
//! # Architecture
//!
//! - **Name interner** (`intern`): bounded table of file names shared by every record
//! - **Allocation tracker** (`tracker`): guarded blocks in a most-recent-first registry
//! - **Buffer guard** (`guard`): capacity-aware copy, fill, compare and scan primitives
//! - **File tracker** (`files`): provenance of every handle number
//! - **Diagnostics** (`diag`): structured reports to stderr, a file or memory
//! - **Configuration** (`config`): environment-driven settings
//! - **Metrics** (`metrics`): atomic counters for observability
//! - **Session** (`session`): the process-wide membrane and its exit report
//!
//! [`Membrane`] ties them together. Misuse is never returned to the caller
//! as an error; it is reported and the call degrades to a neutral result.

#![deny(unsafe_code)]

pub mod config;
pub mod diag;
pub mod error;
pub mod files;
pub mod fs;
pub mod guard;
pub mod intern;
mod journal;
pub mod membrane;
pub mod metrics;
pub mod raw;
pub mod session;
pub mod site;
pub mod tracker;

pub use config::{Destination, GuardMode, LogFormat, MembraneConfig};
pub use diag::{Diagnostics, Report, ReportKind};
pub use error::{InternError, MembraneError};
pub use files::{FileSlot, FileTracker, HandleState};
pub use fs::{FileSystem, MemoryFileSystem, OpenMode, PosixFileSystem};
pub use guard::{Capacity, CopyDecision, Disposition, decide_copy};
pub use intern::{NameId, NameTable};
pub use membrane::Membrane;
pub use metrics::{MembraneMetrics, MetricsSnapshot};
pub use raw::{HeapAllocator, HostAllocator, RawAllocator};
pub use site::{CallSite, StoredSite};
pub use tracker::{AllocationClass, AllocationTracker, BlockRecord};
