//! Types shared between the diskattach library and its command-line front end.

pub mod errors;

pub use errors::{DiskError, DiskResult};
