//! Configuration module
//!
//! Loads and validates `knockgate` gate configuration files and resolves
//! the immutable [`SequenceConfig`](crate::knock::SequenceConfig) the core
//! runs on.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{ConfigLoader, LoadResult, LoadWarning, LoaderOptions};
pub use schema::*;
pub use validation::{ValidationResult, Validator};
