//! Retention Archiver
//!
//! Policy-driven jobs that move aged rows out of the backing store into
//! compressed archive records.

mod archiver;
mod job;

pub use archiver::{ArchiveConfig, Archiver, ArchiverStats};
pub use job::{ArchiveJob, ArchivePolicy, ArchiveRecord, JobStatus, JobStep};
