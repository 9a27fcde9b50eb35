//! Typed configuration: schema, file/env discovery, and validation diagnostics.

mod env_subst;
mod loader;
mod schema;
mod validate;

pub use env_subst::substitute_env;
pub use loader::{discover_config_path, load};
pub use schema::{Config, IdentityState, ModelCatalog};
pub use validate::{Diagnostic, Severity, ValidationResult, validate};
