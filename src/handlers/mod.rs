//! HTTP handlers for package export and import.

pub mod package;
pub use package::*;
