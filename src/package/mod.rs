//! Package archive format: container access, document types, codec and validation.

pub mod archive;
pub mod codec;
pub mod types;
pub mod validator;

pub use archive::{Backing, PackageArchive, PACKAGE_EXTENSION};
pub use types::*;
