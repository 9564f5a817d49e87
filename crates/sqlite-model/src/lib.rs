//! Typed data-access layer over SQLite.
//!
//! The connection manager ([`Db`]) owns one live connection, introspects
//! the schema once, and exposes a [`Model`] per table. Models turn raw
//! query results into validated in-memory rows and reconcile a desired
//! row set against a prior one with minimal inserts, updates and deletes.

pub mod core;
pub mod error;

pub use crate::core::column::{Column, ColumnType, RowError, RuleKind, SizeCriterion};
pub use crate::core::connection::{Db, DbParameter};
pub use crate::core::model::Model;
pub use crate::core::row::{ResultRow, ResultTable, Schema};
pub use crate::core::schema::{LikePosition, Sqlite, Vendor};
pub use crate::error::{DbError, DbResult};

pub use rusqlite::types::Value;

