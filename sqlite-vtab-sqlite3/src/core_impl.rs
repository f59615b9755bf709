use super::*;

use sqlite_vtab::vtab::ffi::{sqlite3_index_info, sqlite3_module};
use sqlite_vtab::{OpenOptions, Prepared, RawBytes, Sqlite3Api, StepResult, ValueType};
use std::ffi::{CStr, CString};
use std::ptr::null;

fn drop_registration_user_data(
    user_data: *mut c_void,
    drop_user_data: Option<extern "C" fn(*mut c_void)>,
) {
    if let Some(drop_user_data) = drop_user_data {
        drop_user_data(user_data);
    }
}

fn registration_name_or_drop(
    name: &str,
    user_data: *mut c_void,
    drop_user_data: Option<extern "C" fn(*mut c_void)>,
) -> Result<CString> {
    match CString::new(name) {
        Ok(name) => Ok(name),
        Err(_) => {
            drop_registration_user_data(user_data, drop_user_data);
            Err(Error::with_message(
                ErrorCode::Misuse,
                "module name contains NUL",
            ))
        }
    }
}

/// Byte offset of the engine's `pzTail` within `sql`.
fn tail_offset(sql: &str, tail: *const c_char) -> usize {
    if tail.is_null() {
        return sql.len();
    }
    let offset = (tail as usize).saturating_sub(sql.as_ptr() as usize);
    let mut offset = offset.min(sql.len());
    while !sql.is_char_boundary(offset) {
        offset += 1;
    }
    offset
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Api for LibSqlite3 {
    type Db = sqlite3;
    type Stmt = sqlite3_stmt;
    type Value = sqlite3_value;
    type Context = sqlite3_context;

    fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    fn feature_set(&self) -> FeatureSet {
        self.features
    }

    fn backend_name(&self) -> &'static str {
        "libsqlite3"
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        if size > i32::MAX as usize {
            return null_mut();
        }
        (self.fns.malloc)(size as c_int)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        (self.fns.free)(ptr);
    }

    unsafe fn open(&self, filename: &str, options: OpenOptions<'_>) -> Result<NonNull<Self::Db>> {
        let filename = CString::new(filename)
            .map_err(|_| Error::with_message(ErrorCode::Misuse, "filename contains NUL"))?;
        let vfs = match options.vfs {
            Some(vfs) => Some(
                CString::new(vfs)
                    .map_err(|_| Error::with_message(ErrorCode::Misuse, "vfs contains NUL"))?,
            ),
            None => None,
        };
        let mut db = null_mut();
        let flags = map_open_flags(options.flags);
        let vfs_ptr = vfs.as_ref().map(|s| s.as_ptr()).unwrap_or(null());
        let rc = (self.fns.open_v2)(filename.as_ptr(), &mut db, flags, vfs_ptr);
        if rc != SQLITE_OK {
            let err = self.error_from_rc(rc, NonNull::new(db));
            if !db.is_null() {
                let _ = (self.fns.close)(db);
            }
            return Err(err);
        }
        NonNull::new(db).ok_or_else(Error::no_memory)
    }

    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()> {
        let rc = (self.fns.close)(db.as_ptr());
        self.check(rc, Some(db))
    }

    unsafe fn prepare_v2(
        &self,
        db: NonNull<Self::Db>,
        sql: &str,
    ) -> Result<Prepared<Self::Stmt>> {
        let mut stmt = null_mut();
        let mut tail = null();
        let rc = (self.fns.prepare_v2)(
            db.as_ptr(),
            sql.as_ptr() as *const c_char,
            clamp_len(sql.len()),
            &mut stmt,
            &mut tail,
        );
        self.check(rc, Some(db))?;
        Ok(Prepared {
            stmt: NonNull::new(stmt),
            tail: tail_offset(sql, tail),
        })
    }

    unsafe fn prepare_v3(
        &self,
        db: NonNull<Self::Db>,
        sql: &str,
        flags: u32,
    ) -> Result<Prepared<Self::Stmt>> {
        let prepare = match self.fns.prepare_v3 {
            Some(prepare) => prepare,
            None => return Err(Error::feature_unavailable("prepare_v3 not available")),
        };
        let mut stmt = null_mut();
        let mut tail = null();
        let rc = prepare(
            db.as_ptr(),
            sql.as_ptr() as *const c_char,
            clamp_len(sql.len()),
            flags,
            &mut stmt,
            &mut tail,
        );
        self.check(rc, Some(db))?;
        Ok(Prepared {
            stmt: NonNull::new(stmt),
            tail: tail_offset(sql, tail),
        })
    }

    unsafe fn step(&self, stmt: NonNull<Self::Stmt>) -> Result<StepResult> {
        match (self.fns.step)(stmt.as_ptr()) {
            SQLITE_ROW => Ok(StepResult::Row),
            SQLITE_DONE => Ok(StepResult::Done),
            rc => Err(self.error_from_rc(rc, None)),
        }
    }

    unsafe fn reset(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        self.check((self.fns.reset)(stmt.as_ptr()), None)
    }

    unsafe fn finalize(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        self.check((self.fns.finalize)(stmt.as_ptr()), None)
    }

    unsafe fn bind_null(&self, stmt: NonNull<Self::Stmt>, idx: i32) -> Result<()> {
        self.check((self.fns.bind_null)(stmt.as_ptr(), idx), None)
    }

    unsafe fn bind_int64(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i64) -> Result<()> {
        self.check((self.fns.bind_int64)(stmt.as_ptr(), idx, v), None)
    }

    unsafe fn bind_double(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: f64) -> Result<()> {
        self.check((self.fns.bind_double)(stmt.as_ptr(), idx, v), None)
    }

    unsafe fn bind_text(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &str) -> Result<()> {
        let (ptr, dtor) = self.alloc_copy(v.as_bytes())?;
        // SQLite invokes the destructor itself when binding fails.
        let rc = (self.fns.bind_text)(
            stmt.as_ptr(),
            idx,
            ptr as *const c_char,
            clamp_len(v.len()),
            dtor,
        );
        self.check(rc, None)
    }

    unsafe fn bind_blob(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()> {
        let (ptr, dtor) = self.alloc_copy(v)?;
        let rc = (self.fns.bind_blob)(stmt.as_ptr(), idx, ptr, clamp_len(v.len()), dtor);
        self.check(rc, None)
    }

    unsafe fn column_count(&self, stmt: NonNull<Self::Stmt>) -> i32 {
        (self.fns.column_count)(stmt.as_ptr())
    }

    unsafe fn column_type(&self, stmt: NonNull<Self::Stmt>, col: i32) -> ValueType {
        ValueType::from_code((self.fns.column_type)(stmt.as_ptr(), col))
    }

    unsafe fn column_int64(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i64 {
        (self.fns.column_int64)(stmt.as_ptr(), col)
    }

    unsafe fn column_double(&self, stmt: NonNull<Self::Stmt>, col: i32) -> f64 {
        (self.fns.column_double)(stmt.as_ptr(), col)
    }

    unsafe fn column_text(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        let ptr = (self.fns.column_text)(stmt.as_ptr(), col) as *const u8;
        if ptr.is_null() {
            return RawBytes::empty();
        }
        let len = (self.fns.column_bytes)(stmt.as_ptr(), col);
        RawBytes {
            ptr,
            len: len as usize,
        }
    }

    unsafe fn column_blob(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        let ptr = (self.fns.column_blob)(stmt.as_ptr(), col) as *const u8;
        if ptr.is_null() {
            return RawBytes::empty();
        }
        let len = (self.fns.column_bytes)(stmt.as_ptr(), col);
        RawBytes {
            ptr,
            len: len as usize,
        }
    }

    unsafe fn errcode(&self, db: NonNull<Self::Db>) -> i32 {
        (self.fns.errcode)(db.as_ptr())
    }

    unsafe fn errmsg(&self, db: NonNull<Self::Db>) -> *const c_char {
        (self.fns.errmsg)(db.as_ptr())
    }

    unsafe fn extended_errcode(&self, db: NonNull<Self::Db>) -> Option<i32> {
        self.fns.extended_errcode.map(|f| f(db.as_ptr()))
    }

    unsafe fn result_null(&self, ctx: NonNull<Self::Context>) {
        (self.fns.result_null)(ctx.as_ptr());
    }

    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64) {
        (self.fns.result_int64)(ctx.as_ptr(), v);
    }

    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64) {
        (self.fns.result_double)(ctx.as_ptr(), v);
    }

    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &str) {
        match self.alloc_copy(v.as_bytes()) {
            Ok((ptr, dtor)) => {
                (self.fns.result_text)(
                    ctx.as_ptr(),
                    ptr as *const c_char,
                    clamp_len(v.len()),
                    dtor,
                );
            }
            Err(_) => self.result_error_nomem(ctx),
        }
    }

    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        match self.alloc_copy(v) {
            Ok((ptr, dtor)) => {
                (self.fns.result_blob)(ctx.as_ptr(), ptr, clamp_len(v.len()), dtor);
            }
            Err(_) => self.result_error_nomem(ctx),
        }
    }

    unsafe fn result_zeroblob(&self, ctx: NonNull<Self::Context>, len: usize) {
        match self.fns.result_zeroblob {
            Some(zeroblob) => zeroblob(ctx.as_ptr(), clamp_len(len)),
            None => self.result_blob(ctx, &vec![0u8; len]),
        }
    }

    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &str) {
        (self.fns.result_error)(
            ctx.as_ptr(),
            msg.as_ptr() as *const c_char,
            clamp_len(msg.len()),
        );
    }

    unsafe fn result_error_code(&self, ctx: NonNull<Self::Context>, code: i32) {
        match self.fns.result_error_code {
            Some(error_code) => error_code(ctx.as_ptr(), code),
            None => {
                let msg = Error::new(ErrorCode::from_code(code)).to_string();
                self.result_error(ctx, &msg);
            }
        }
    }

    unsafe fn result_error_toobig(&self, ctx: NonNull<Self::Context>) {
        match self.fns.result_error_toobig {
            Some(toobig) => toobig(ctx.as_ptr()),
            None => self.result_error(ctx, "string or blob too big"),
        }
    }

    unsafe fn result_error_nomem(&self, ctx: NonNull<Self::Context>) {
        match self.fns.result_error_nomem {
            Some(nomem) => nomem(ctx.as_ptr()),
            None => self.result_error(ctx, "out of memory"),
        }
    }

    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType {
        ValueType::from_code((self.fns.value_type)(v.as_ptr()))
    }

    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64 {
        (self.fns.value_int64)(v.as_ptr())
    }

    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64 {
        (self.fns.value_double)(v.as_ptr())
    }

    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes {
        let ptr = (self.fns.value_text)(v.as_ptr()) as *const u8;
        if ptr.is_null() {
            return RawBytes::empty();
        }
        let len = (self.fns.value_bytes)(v.as_ptr());
        RawBytes {
            ptr,
            len: len as usize,
        }
    }

    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes {
        let ptr = (self.fns.value_blob)(v.as_ptr()) as *const u8;
        if ptr.is_null() {
            return RawBytes::empty();
        }
        let len = (self.fns.value_bytes)(v.as_ptr());
        RawBytes {
            ptr,
            len: len as usize,
        }
    }

    unsafe fn value_bytes(&self, v: NonNull<Self::Value>) -> usize {
        (self.fns.value_bytes)(v.as_ptr()).max(0) as usize
    }

    unsafe fn vtab_collation(
        &self,
        info: NonNull<sqlite3_index_info>,
        constraint: usize,
    ) -> Option<String> {
        let collation = self.fns.vtab_collation?;
        let index = c_int::try_from(constraint).ok()?;
        let name = collation(info.as_ptr(), index);
        if name.is_null() {
            return None;
        }
        Some(CStr::from_ptr(name).to_string_lossy().into_owned())
    }

    unsafe fn declare_vtab(&self, db: NonNull<Self::Db>, schema: &str) -> Result<()> {
        let declare = match self.fns.declare_vtab {
            Some(declare) => declare,
            None => return Err(Error::feature_unavailable("declare_vtab not available")),
        };
        let schema = CString::new(schema)
            .map_err(|_| Error::with_message(ErrorCode::Misuse, "schema contains NUL"))?;
        let rc = declare(db.as_ptr(), schema.as_ptr());
        self.check(rc, Some(db))
    }

    unsafe fn create_module_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        module: *const sqlite3_module<Self>,
        user_data: *mut c_void,
        drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        let create = match self.fns.create_module_v2 {
            Some(create) => create,
            None => {
                drop_registration_user_data(user_data, drop_user_data);
                return Err(Error::feature_unavailable("create_module_v2 not available"));
            }
        };
        let name = registration_name_or_drop(name, user_data, drop_user_data)?;
        // On failure SQLite runs `drop_user_data` before returning.
        let rc = create(
            db.as_ptr(),
            name.as_ptr(),
            module as *const c_void,
            user_data,
            drop_user_data,
        );
        self.check(rc, Some(db))
    }
}

#[cfg(test)]
mod tests {
    use super::{drop_registration_user_data, registration_name_or_drop, tail_offset};
    use sqlite_vtab::ErrorCode;
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    static DROP_CALLS: AtomicUsize = AtomicUsize::new(0);
    static DROP_TEST_LOCK: Mutex<()> = Mutex::new(());

    extern "C" fn drop_counting_box(ptr: *mut c_void) {
        DROP_CALLS.fetch_add(1, Ordering::SeqCst);
        if !ptr.is_null() {
            unsafe { drop(Box::from_raw(ptr as *mut usize)) };
        }
    }

    #[test]
    fn interior_nul_in_module_name_drops_user_data() {
        let _guard = DROP_TEST_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        DROP_CALLS.store(0, Ordering::SeqCst);
        let user_data = Box::into_raw(Box::new(7usize)) as *mut c_void;
        let err = registration_name_or_drop("bad\0name", user_data, Some(drop_counting_box))
            .expect_err("interior NUL should fail");
        assert_eq!(err.code, ErrorCode::Misuse);
        assert_eq!(DROP_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn valid_module_name_keeps_user_data() {
        let _guard = DROP_TEST_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        DROP_CALLS.store(0, Ordering::SeqCst);
        let user_data = Box::into_raw(Box::new(9usize)) as *mut c_void;
        let name = registration_name_or_drop("series", user_data, Some(drop_counting_box))
            .expect("valid name should pass");
        assert_eq!(name.to_str().unwrap(), "series");
        assert_eq!(DROP_CALLS.load(Ordering::SeqCst), 0);
        drop_registration_user_data(user_data, Some(drop_counting_box));
        assert_eq!(DROP_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_without_callback_is_noop() {
        let _guard = DROP_TEST_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        drop_registration_user_data(std::ptr::null_mut(), None);
    }

    #[test]
    fn tail_offset_is_relative_to_input() {
        let sql = "SELECT 1; SELECT 2";
        let after_first = unsafe { sql.as_ptr().add(9) } as *const libc::c_char;
        assert_eq!(tail_offset(sql, after_first), 9);
        assert_eq!(tail_offset(sql, std::ptr::null()), sql.len());
        let past_end = unsafe { sql.as_ptr().add(64) } as *const libc::c_char;
        assert_eq!(tail_offset(sql, past_end), sql.len());
    }
}
