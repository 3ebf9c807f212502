//! Validation and tenant-scoping rewrite for model-authored SQL.
//!
//! [`guard`] accepts exactly one read-only query over the tables in a
//! [`SchemaCatalog`], binds every table reference to the caller's tenant and
//! caps the number of returned rows. Anything else is refused with a
//! [`GuardViolation`].

mod ast;
mod catalog;
mod error;
mod guard;
mod lexer;
mod parser;
mod render;
mod token;

pub use catalog::{SchemaCatalog, TableDef, DEFAULT_TENANT_COLUMN};
pub use error::GuardViolation;
pub use guard::{guard, GuardOptions, GuardResult, MAX_SQL_CHARS};
