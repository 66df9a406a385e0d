//! Set of module Error
pub mod disk;

pub use disk::{DiskError, JobError, Operation};
