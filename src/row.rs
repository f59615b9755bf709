use crate::provider::{Sqlite3Api, ValueType};
use crate::statement::Statement;
use crate::value::{Value, ValueRef};

/// Current row of a stepping [`Statement`].
pub struct Row<'s, 'c, 'p, P: Sqlite3Api> {
    stmt: &'s Statement<'c, 'p, P>,
}

impl<'s, 'c, 'p, P: Sqlite3Api> Row<'s, 'c, 'p, P> {
    pub(crate) fn new(stmt: &'s Statement<'c, 'p, P>) -> Self {
        Self { stmt }
    }

    pub fn column_count(&self) -> i32 {
        self.stmt.column_count()
    }

    pub fn column_type(&self, col: i32) -> ValueType {
        unsafe { self.stmt.conn.api.column_type(self.stmt.stmt, col) }
    }

    /// Borrowed view, valid until the statement steps again.
    pub fn column_value_ref(&self, col: i32) -> ValueRef<'_> {
        let api = self.stmt.conn.api;
        let stmt = self.stmt.stmt;
        unsafe {
            match api.column_type(stmt, col) {
                ValueType::Null => ValueRef::Null,
                ValueType::Integer => ValueRef::Integer(api.column_int64(stmt, col)),
                ValueType::Float => ValueRef::Float(api.column_double(stmt, col)),
                ValueType::Text => ValueRef::from_raw_text(api.column_text(stmt, col)),
                ValueType::Blob => ValueRef::from_raw_blob(api.column_blob(stmt, col)),
            }
        }
    }

    pub fn column_value(&self, col: i32) -> Value {
        self.column_value_ref(col).to_owned()
    }

    /// Every column of the row as owned values.
    pub fn values(&self) -> Vec<Value> {
        (0..self.column_count()).map(|c| self.column_value(c)).collect()
    }
}
