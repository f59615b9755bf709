//! Dynamic `libsqlite3` backend adapter for `sqlite-vtab`.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_uchar, c_void};
use sqlite_vtab::vtab::ffi::sqlite3_index_info;
use sqlite_vtab::{ApiVersion, Error, ErrorCode, FeatureSet, OpenFlags, Result};
use std::ffi::CStr;
use std::ptr::{null_mut, NonNull};

mod core_impl;

#[cfg(target_os = "linux")]
#[link(name = "dl")]
extern "C" {}

const SQLITE_OK: i32 = 0;
const SQLITE_ROW: i32 = 100;
const SQLITE_DONE: i32 = 101;

const SQLITE_OPEN_READONLY: i32 = 0x0000_0001;
const SQLITE_OPEN_READWRITE: i32 = 0x0000_0002;
const SQLITE_OPEN_CREATE: i32 = 0x0000_0004;
const SQLITE_OPEN_URI: i32 = 0x0000_0040;
const SQLITE_OPEN_NOMUTEX: i32 = 0x0000_8000;
const SQLITE_OPEN_FULLMUTEX: i32 = 0x0001_0000;
const SQLITE_OPEN_EXRESCODE: i32 = 0x0200_0000;

const EMPTY_BYTE: u8 = 0;

type sqlite3 = c_void;
type sqlite3_stmt = c_void;
type sqlite3_value = c_void;
type sqlite3_context = c_void;

type sqlite3_destructor_type = Option<unsafe extern "C" fn(*mut c_void)>;

type OpenV2 =
    unsafe extern "C" fn(*const c_char, *mut *mut sqlite3, c_int, *const c_char) -> c_int;
type Close = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type PrepareV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    *mut *mut sqlite3_stmt,
    *mut *const c_char,
) -> c_int;
type PrepareV3 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    u32,
    *mut *mut sqlite3_stmt,
    *mut *const c_char,
) -> c_int;
type Step = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;
type Reset = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;
type Finalize = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;

type BindNull = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
type BindInt64 = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, i64) -> c_int;
type BindDouble = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, f64) -> c_int;
type BindText = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *const c_char,
    c_int,
    sqlite3_destructor_type,
) -> c_int;
type BindBlob = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *const c_void,
    c_int,
    sqlite3_destructor_type,
) -> c_int;

type ColumnCount = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;
type ColumnType = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
type ColumnInt64 = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> i64;
type ColumnDouble = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> f64;
type ColumnText = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_uchar;
type ColumnBlob = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_void;
type ColumnBytes = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;

type ErrCode = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type ErrMsg = unsafe extern "C" fn(*mut sqlite3) -> *const c_char;
type ExtendedErrCode = unsafe extern "C" fn(*mut sqlite3) -> c_int;

type ResultNull = unsafe extern "C" fn(*mut sqlite3_context);
type ResultInt64 = unsafe extern "C" fn(*mut sqlite3_context, i64);
type ResultDouble = unsafe extern "C" fn(*mut sqlite3_context, f64);
type ResultText =
    unsafe extern "C" fn(*mut sqlite3_context, *const c_char, c_int, sqlite3_destructor_type);
type ResultBlob =
    unsafe extern "C" fn(*mut sqlite3_context, *const c_void, c_int, sqlite3_destructor_type);
type ResultZeroblob = unsafe extern "C" fn(*mut sqlite3_context, c_int);
type ResultError = unsafe extern "C" fn(*mut sqlite3_context, *const c_char, c_int);
type ResultErrorCode = unsafe extern "C" fn(*mut sqlite3_context, c_int);
type ResultErrorToobig = unsafe extern "C" fn(*mut sqlite3_context);
type ResultErrorNomem = unsafe extern "C" fn(*mut sqlite3_context);

type ValueTypeFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;
type ValueInt64Fn = unsafe extern "C" fn(*mut sqlite3_value) -> i64;
type ValueDoubleFn = unsafe extern "C" fn(*mut sqlite3_value) -> f64;
type ValueTextFn = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_uchar;
type ValueBlobFn = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_void;
type ValueBytesFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;

type VTabCollation = unsafe extern "C" fn(*mut sqlite3_index_info, c_int) -> *const c_char;
type DeclareVTab = unsafe extern "C" fn(*mut sqlite3, *const c_char) -> c_int;
type CreateModuleV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    *const c_void,
    *mut c_void,
    Option<extern "C" fn(*mut c_void)>,
) -> c_int;

type LibversionNumber = unsafe extern "C" fn() -> c_int;

type Malloc = unsafe extern "C" fn(c_int) -> *mut c_void;
type Free = unsafe extern "C" fn(*mut c_void);

struct LibHandle {
    handle: *mut c_void,
}

unsafe impl Send for LibHandle {}
unsafe impl Sync for LibHandle {}

impl LibHandle {
    unsafe fn open() -> Option<Self> {
        let mut handle = null_mut();
        for name in lib_names() {
            let cstr = CStr::from_bytes_with_nul_unchecked(name);
            handle = libc::dlopen(cstr.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL);
            if !handle.is_null() {
                break;
            }
        }
        if handle.is_null() {
            None
        } else {
            Some(Self { handle })
        }
    }

    unsafe fn symbol<T>(&self, name: &'static [u8]) -> Option<T>
    where
        T: Copy,
    {
        let sym = libc::dlsym(self.handle, name.as_ptr() as *const c_char);
        if sym.is_null() {
            None
        } else {
            debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<*mut c_void>());
            Some(std::mem::transmute_copy(&sym))
        }
    }
}

struct LibSqlite3Fns {
    open_v2: OpenV2,
    close: Close,
    prepare_v2: PrepareV2,
    prepare_v3: Option<PrepareV3>,
    step: Step,
    reset: Reset,
    finalize: Finalize,
    bind_null: BindNull,
    bind_int64: BindInt64,
    bind_double: BindDouble,
    bind_text: BindText,
    bind_blob: BindBlob,
    column_count: ColumnCount,
    column_type: ColumnType,
    column_int64: ColumnInt64,
    column_double: ColumnDouble,
    column_text: ColumnText,
    column_blob: ColumnBlob,
    column_bytes: ColumnBytes,
    errcode: ErrCode,
    errmsg: ErrMsg,
    extended_errcode: Option<ExtendedErrCode>,
    result_null: ResultNull,
    result_int64: ResultInt64,
    result_double: ResultDouble,
    result_text: ResultText,
    result_blob: ResultBlob,
    result_zeroblob: Option<ResultZeroblob>,
    result_error: ResultError,
    result_error_code: Option<ResultErrorCode>,
    result_error_toobig: Option<ResultErrorToobig>,
    result_error_nomem: Option<ResultErrorNomem>,
    value_type: ValueTypeFn,
    value_int64: ValueInt64Fn,
    value_double: ValueDoubleFn,
    value_text: ValueTextFn,
    value_blob: ValueBlobFn,
    value_bytes: ValueBytesFn,
    declare_vtab: Option<DeclareVTab>,
    vtab_collation: Option<VTabCollation>,
    create_module_v2: Option<CreateModuleV2>,
    libversion_number: LibversionNumber,
    malloc: Malloc,
    free: Free,
}

impl LibSqlite3Fns {
    unsafe fn load(lib: &LibHandle) -> Option<Self> {
        Some(Self {
            open_v2: lib.symbol(b"sqlite3_open_v2\0")?,
            close: lib.symbol(b"sqlite3_close\0")?,
            prepare_v2: lib.symbol(b"sqlite3_prepare_v2\0")?,
            prepare_v3: lib.symbol(b"sqlite3_prepare_v3\0"),
            step: lib.symbol(b"sqlite3_step\0")?,
            reset: lib.symbol(b"sqlite3_reset\0")?,
            finalize: lib.symbol(b"sqlite3_finalize\0")?,
            bind_null: lib.symbol(b"sqlite3_bind_null\0")?,
            bind_int64: lib.symbol(b"sqlite3_bind_int64\0")?,
            bind_double: lib.symbol(b"sqlite3_bind_double\0")?,
            bind_text: lib.symbol(b"sqlite3_bind_text\0")?,
            bind_blob: lib.symbol(b"sqlite3_bind_blob\0")?,
            column_count: lib.symbol(b"sqlite3_column_count\0")?,
            column_type: lib.symbol(b"sqlite3_column_type\0")?,
            column_int64: lib.symbol(b"sqlite3_column_int64\0")?,
            column_double: lib.symbol(b"sqlite3_column_double\0")?,
            column_text: lib.symbol(b"sqlite3_column_text\0")?,
            column_blob: lib.symbol(b"sqlite3_column_blob\0")?,
            column_bytes: lib.symbol(b"sqlite3_column_bytes\0")?,
            errcode: lib.symbol(b"sqlite3_errcode\0")?,
            errmsg: lib.symbol(b"sqlite3_errmsg\0")?,
            extended_errcode: lib.symbol(b"sqlite3_extended_errcode\0"),
            result_null: lib.symbol(b"sqlite3_result_null\0")?,
            result_int64: lib.symbol(b"sqlite3_result_int64\0")?,
            result_double: lib.symbol(b"sqlite3_result_double\0")?,
            result_text: lib.symbol(b"sqlite3_result_text\0")?,
            result_blob: lib.symbol(b"sqlite3_result_blob\0")?,
            result_zeroblob: lib.symbol(b"sqlite3_result_zeroblob\0"),
            result_error: lib.symbol(b"sqlite3_result_error\0")?,
            result_error_code: lib.symbol(b"sqlite3_result_error_code\0"),
            result_error_toobig: lib.symbol(b"sqlite3_result_error_toobig\0"),
            result_error_nomem: lib.symbol(b"sqlite3_result_error_nomem\0"),
            value_type: lib.symbol(b"sqlite3_value_type\0")?,
            value_int64: lib.symbol(b"sqlite3_value_int64\0")?,
            value_double: lib.symbol(b"sqlite3_value_double\0")?,
            value_text: lib.symbol(b"sqlite3_value_text\0")?,
            value_blob: lib.symbol(b"sqlite3_value_blob\0")?,
            value_bytes: lib.symbol(b"sqlite3_value_bytes\0")?,
            declare_vtab: lib.symbol(b"sqlite3_declare_vtab\0"),
            vtab_collation: lib.symbol(b"sqlite3_vtab_collation\0"),
            create_module_v2: lib.symbol(b"sqlite3_create_module_v2\0"),
            libversion_number: lib.symbol(b"sqlite3_libversion_number\0")?,
            malloc: lib.symbol(b"sqlite3_malloc\0")?,
            free: lib.symbol(b"sqlite3_free\0")?,
        })
    }
}

/// Dynamic `libsqlite3` backend adapter loaded via `dlopen`.
pub struct LibSqlite3 {
    fns: LibSqlite3Fns,
    features: FeatureSet,
    api_version: ApiVersion,
    _lib: LibHandle,
}

impl LibSqlite3 {
    /// Load `libsqlite3` and return a process-wide adapter instance.
    ///
    /// Returns `None` if the library or required symbols are unavailable.
    pub fn load() -> Option<&'static LibSqlite3> {
        unsafe {
            let lib = LibHandle::open()?;
            let fns = LibSqlite3Fns::load(&lib)?;
            let api_version = ApiVersion::from_number((fns.libversion_number)());
            let mut features = FeatureSet::empty();
            if fns.prepare_v3.is_some() {
                features |= FeatureSet::PREPARE_V3;
            }
            if fns.extended_errcode.is_some() {
                features |= FeatureSet::EXTENDED_ERRCODES;
            }
            if fns.create_module_v2.is_some() && fns.declare_vtab.is_some() {
                features |= FeatureSet::VIRTUAL_TABLES;
            }
            let adapter = LibSqlite3 {
                fns,
                features,
                api_version,
                _lib: lib,
            };
            Some(Box::leak(Box::new(adapter)))
        }
    }

    fn error_from_rc(&self, rc: i32, db: Option<NonNull<sqlite3>>) -> Error {
        let message = db
            .and_then(|db| unsafe { raw_cstr((self.fns.errmsg)(db.as_ptr())) })
            .map(|c| c.to_string_lossy().into_owned());
        let extended =
            db.and_then(|db| self.fns.extended_errcode.map(|f| unsafe { f(db.as_ptr()) }));
        Error::from_code(rc, message, extended)
    }

    fn check(&self, rc: i32, db: Option<NonNull<sqlite3>>) -> Result<()> {
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error_from_rc(rc, db))
        }
    }

    // Allocate with sqlite3_malloc so SQLite can free via sqlite3_free.
    fn alloc_copy(&self, bytes: &[u8]) -> Result<(*const c_void, sqlite3_destructor_type)> {
        if bytes.is_empty() {
            return Ok((&EMPTY_BYTE as *const u8 as *const c_void, None));
        }
        if bytes.len() > i32::MAX as usize {
            return Err(Error::with_message(ErrorCode::TooBig, "value too large"));
        }
        let ptr = unsafe { (self.fns.malloc)(bytes.len() as i32) };
        if ptr.is_null() {
            return Err(Error::no_memory());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        }
        Ok((ptr, Some(self.fns.free)))
    }
}

fn map_open_flags(flags: OpenFlags) -> i32 {
    let mut out = 0;
    if flags.contains(OpenFlags::READ_ONLY) {
        out |= SQLITE_OPEN_READONLY;
    }
    if flags.contains(OpenFlags::READ_WRITE) {
        out |= SQLITE_OPEN_READWRITE;
    }
    if flags.contains(OpenFlags::CREATE) {
        out |= SQLITE_OPEN_CREATE;
    }
    if flags.contains(OpenFlags::URI) {
        out |= SQLITE_OPEN_URI;
    }
    if flags.contains(OpenFlags::NO_MUTEX) {
        out |= SQLITE_OPEN_NOMUTEX;
    }
    if flags.contains(OpenFlags::FULL_MUTEX) {
        out |= SQLITE_OPEN_FULLMUTEX;
    }
    if flags.contains(OpenFlags::EXRESCODE) {
        out |= SQLITE_OPEN_EXRESCODE;
    }
    out
}

fn clamp_len(len: usize) -> i32 {
    if len > i32::MAX as usize {
        i32::MAX
    } else {
        len as i32
    }
}

unsafe fn raw_cstr<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr))
    }
}

fn lib_names() -> &'static [&'static [u8]] {
    #[cfg(target_os = "macos")]
    const NAMES: [&[u8]; 3] = [
        b"libsqlite3.dylib\0",
        b"libsqlite3.so.0\0",
        b"libsqlite3.so\0",
    ];
    #[cfg(not(target_os = "macos"))]
    const NAMES: [&[u8]; 2] = [b"libsqlite3.so.0\0", b"libsqlite3.so\0"];
    &NAMES
}
