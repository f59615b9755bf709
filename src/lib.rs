//! Safe SQLite virtual tables over a pluggable SQLite3 C API provider.
//!
//! Implement [`vtab::Module`], wrap it in a [`vtab::ModuleHost`] and register
//! it with [`Connection::create_module`]. The host translates every engine
//! callback into a safe call and keeps engine handles and Rust objects in
//! step.

#[cfg(test)]
extern crate self as sqlite_vtab;

mod connection;
mod context;
mod error;
mod provider;
mod row;
mod statement;
mod value;
pub mod vtab;

pub use crate::connection::Connection;
pub use crate::context::Context;
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::provider::{
    ApiVersion, FeatureSet, OpenFlags, OpenOptions, Prepared, RawBytes, ScalarFn, Sqlite3Api,
    StepResult, ValueType,
};
pub use crate::row::Row;
pub use crate::statement::Statement;
pub use crate::value::{SqlValue, Value, ValueRef};
pub use crate::vtab::{
    FunctionOverload, IndexConstraint, IndexConstraintOp, IndexInfo, IndexOrderBy, Module,
    ModuleArgs, ModuleHost, TableDeclaration, UpdateKind, VirtualTable, VirtualTableCursor,
};
