use core::cell::Cell;
use core::ptr::NonNull;

use crate::error::{Error, Result};
use crate::provider::Sqlite3Api;
use crate::value::Value;

/// Result sink for one xColumn call.
///
/// The engine honors only the last result set on a context, so each
/// `Context` accepts exactly one; a second `set_*` returns `Misuse` without
/// touching the engine.
pub struct Context<'p, P: Sqlite3Api> {
    api: &'p P,
    ctx: NonNull<P::Context>,
    done: Cell<bool>,
}

impl<'p, P: Sqlite3Api> Context<'p, P> {
    /// # Safety
    /// `ctx` must be the live `sqlite3_context` of the current callback.
    pub unsafe fn from_raw(api: &'p P, ctx: NonNull<P::Context>) -> Self {
        Self {
            api,
            ctx,
            done: Cell::new(false),
        }
    }

    /// Whether a result has already been set.
    pub fn is_set(&self) -> bool {
        self.done.get()
    }

    fn claim(&self) -> Result<()> {
        if self.done.replace(true) {
            return Err(Error::misuse("column result already set"));
        }
        Ok(())
    }

    /// Set NULL result.
    pub fn set_null(&self) -> Result<()> {
        self.claim()?;
        unsafe { self.api.result_null(self.ctx) };
        Ok(())
    }

    /// Set a 32-bit integer result.
    pub fn set_int(&self, v: i32) -> Result<()> {
        self.set_int64(i64::from(v))
    }

    /// Set integer result.
    pub fn set_int64(&self, v: i64) -> Result<()> {
        self.claim()?;
        unsafe { self.api.result_int64(self.ctx, v) };
        Ok(())
    }

    /// Set floating result.
    pub fn set_double(&self, v: f64) -> Result<()> {
        self.claim()?;
        unsafe { self.api.result_double(self.ctx, v) };
        Ok(())
    }

    /// Set text result (provider must copy or retain the bytes as needed).
    pub fn set_string(&self, v: &str) -> Result<()> {
        self.claim()?;
        unsafe { self.api.result_text(self.ctx, v) };
        Ok(())
    }

    /// Set blob result (provider must copy or retain the bytes as needed).
    pub fn set_blob(&self, v: &[u8]) -> Result<()> {
        self.claim()?;
        unsafe { self.api.result_blob(self.ctx, v) };
        Ok(())
    }

    /// Set a zero-filled blob of `len` bytes.
    pub fn set_zero_blob(&self, len: usize) -> Result<()> {
        self.claim()?;
        unsafe { self.api.result_zeroblob(self.ctx, len) };
        Ok(())
    }

    /// Report an error message as the result.
    pub fn set_error(&self, msg: &str) -> Result<()> {
        self.claim()?;
        unsafe { self.api.result_error(self.ctx, msg) };
        Ok(())
    }

    /// Report an error carrying a specific result code.
    pub fn set_error_code(&self, code: i32) -> Result<()> {
        self.claim()?;
        unsafe { self.api.result_error_code(self.ctx, code) };
        Ok(())
    }

    /// Report `SQLITE_TOOBIG`.
    pub fn set_error_too_big(&self) -> Result<()> {
        self.claim()?;
        unsafe { self.api.result_error_toobig(self.ctx) };
        Ok(())
    }

    /// Report `SQLITE_NOMEM`.
    pub fn set_error_no_memory(&self) -> Result<()> {
        self.claim()?;
        unsafe { self.api.result_error_nomem(self.ctx) };
        Ok(())
    }

    /// Set result from an owned `Value`.
    pub fn set_value(&self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.set_null(),
            Value::Integer(v) => self.set_int64(*v),
            Value::Float(v) => self.set_double(*v),
            Value::Text(v) => self.set_string(v),
            Value::Blob(v) => self.set_blob(v),
        }
    }

    /// Error path used by the dispatcher; overrides whatever was set before.
    pub(crate) fn report_error(&self, err: &Error) {
        self.done.set(true);
        let msg = err.to_string();
        unsafe {
            self.api.result_error(self.ctx, &msg);
            if let Some(code) = err.code.code().filter(|code| *code != 0 && *code != 1) {
                self.api.result_error_code(self.ctx, code);
            }
        }
    }
}
