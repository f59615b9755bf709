use core::ptr::NonNull;

use crate::connection::Connection;
use crate::error::Result;
use crate::provider::{Sqlite3Api, StepResult};
use crate::row::Row;
use crate::value::Value;

/// Prepared statement; finalized on drop.
pub struct Statement<'c, 'p, P: Sqlite3Api> {
    pub(crate) conn: &'c Connection<'p, P>,
    pub(crate) stmt: NonNull<P::Stmt>,
}

impl<'c, 'p, P: Sqlite3Api> Statement<'c, 'p, P> {
    pub(crate) fn new(conn: &'c Connection<'p, P>, stmt: NonNull<P::Stmt>) -> Self {
        Self { conn, stmt }
    }

    pub fn reset(&mut self) -> Result<()> {
        unsafe { self.conn.api.reset(self.stmt) }
    }

    /// Step the statement; returns `Some(Row)` while rows are available.
    pub fn step(&mut self) -> Result<Option<Row<'_, 'c, 'p, P>>> {
        match unsafe { self.conn.api.step(self.stmt)? } {
            StepResult::Row => Ok(Some(Row::new(self))),
            StepResult::Done => Ok(None),
        }
    }

    /// Bind an owned value at 1-based parameter `idx`.
    pub fn bind(&mut self, idx: i32, value: &Value) -> Result<()> {
        let api = self.conn.api;
        unsafe {
            match value {
                Value::Null => api.bind_null(self.stmt, idx),
                Value::Integer(v) => api.bind_int64(self.stmt, idx, *v),
                Value::Float(v) => api.bind_double(self.stmt, idx, *v),
                Value::Text(v) => api.bind_text(self.stmt, idx, v),
                Value::Blob(v) => api.bind_blob(self.stmt, idx, v),
            }
        }
    }

    /// Bind `values` to parameters `1..=values.len()`.
    pub fn bind_all(&mut self, values: &[Value]) -> Result<()> {
        for (i, value) in values.iter().enumerate() {
            self.bind(i as i32 + 1, value)?;
        }
        Ok(())
    }

    /// Drain the remaining rows into owned values.
    pub fn collect_rows(&mut self) -> Result<Vec<Vec<Value>>> {
        let mut out = Vec::new();
        while let Some(row) = self.step()? {
            out.push(row.values());
        }
        Ok(out)
    }

    pub fn column_count(&self) -> i32 {
        unsafe { self.conn.api.column_count(self.stmt) }
    }

    pub fn raw_handle(&self) -> NonNull<P::Stmt> {
        self.stmt
    }
}

impl<'c, 'p, P: Sqlite3Api> Drop for Statement<'c, 'p, P> {
    fn drop(&mut self) {
        let _ = unsafe { self.conn.api.finalize(self.stmt) };
    }
}
