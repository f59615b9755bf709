use core::ffi::CStr;
use core::ptr::NonNull;

use crate::error::{Error, Result};
use crate::provider::{FeatureSet, OpenOptions, Prepared, Sqlite3Api};
use crate::statement::Statement;

/// Safe wrapper around a `sqlite3*` connection.
pub struct Connection<'p, P: Sqlite3Api> {
    pub(crate) api: &'p P,
    pub(crate) db: NonNull<P::Db>,
}

impl<'p, P: Sqlite3Api> Connection<'p, P> {
    /// Open a connection using the provider SPI.
    pub fn open(api: &'p P, filename: &str, options: OpenOptions<'_>) -> Result<Self> {
        let db = unsafe { api.open(filename, options)? };
        Ok(Self { api, db })
    }

    /// Prepare a statement, using prepare_v3 when available.
    ///
    /// Text after the first statement is ignored.
    pub fn prepare(&self, sql: &str) -> Result<Statement<'_, 'p, P>> {
        let prepared = self.prepare_first(sql)?;
        let stmt = prepared
            .stmt
            .ok_or_else(|| Error::misuse("no statement in SQL"))?;
        Ok(Statement::new(self, stmt))
    }

    /// Prepare a statement with flags (requires prepare_v3 support).
    pub fn prepare_with_flags(&self, sql: &str, flags: u32) -> Result<Statement<'_, 'p, P>> {
        if !self.api.feature_set().contains(FeatureSet::PREPARE_V3) {
            return Err(Error::feature_unavailable("prepare_v3 unsupported"));
        }
        let prepared = unsafe { self.api.prepare_v3(self.db, sql, flags)? };
        let stmt = prepared
            .stmt
            .ok_or_else(|| Error::misuse("no statement in SQL"))?;
        Ok(Statement::new(self, stmt))
    }

    /// Run every statement in `sql` to completion, discarding any rows.
    ///
    /// Stops at the first failing statement; earlier ones stay applied.
    pub fn execute(&self, sql: &str) -> Result<()> {
        let mut rest = sql;
        loop {
            let prepared = self.prepare_first(rest)?;
            if let Some(stmt) = prepared.stmt {
                let mut stmt = Statement::new(self, stmt);
                while stmt.step()?.is_some() {}
            }
            if prepared.tail == 0 || prepared.tail >= rest.len() {
                return Ok(());
            }
            rest = rest
                .get(prepared.tail..)
                .ok_or_else(|| Error::internal("statement tail splits a character"))?;
        }
    }

    fn prepare_first(&self, sql: &str) -> Result<Prepared<P::Stmt>> {
        unsafe {
            if self.api.feature_set().contains(FeatureSet::PREPARE_V3) {
                self.api.prepare_v3(self.db, sql, 0)
            } else {
                self.api.prepare_v2(self.db, sql)
            }
        }
    }

    /// Most recent error reported by the engine for this connection.
    pub fn last_error(&self) -> Error {
        unsafe {
            let code = self.api.errcode(self.db);
            let msg = self.api.errmsg(self.db);
            let message =
                (!msg.is_null()).then(|| CStr::from_ptr(msg).to_string_lossy().into_owned());
            Error::from_code(code, message, self.api.extended_errcode(self.db))
        }
    }

    pub fn api(&self) -> &'p P {
        self.api
    }

    /// Expose the raw database handle.
    pub fn raw_handle(&self) -> NonNull<P::Db> {
        self.db
    }
}

impl<'p, P: Sqlite3Api> Drop for Connection<'p, P> {
    fn drop(&mut self) {
        let _ = unsafe { self.api.close(self.db) };
    }
}
