use core::ffi::{c_char, c_void};
use core::ptr::NonNull;

use crate::error::{Error, ErrorCode, Result};
use crate::vtab::ffi::{sqlite3_index_info, sqlite3_module};

/// SQLite API version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    /// Major version component (X in X.Y.Z).
    pub major: u16,
    /// Minor version component (Y in X.Y.Z).
    pub minor: u16,
    /// Patch version component (Z in X.Y.Z).
    pub patch: u16,
}

impl ApiVersion {
    /// Build an API version from major/minor/patch components.
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Decode `sqlite3_libversion_number()` style `X*1000000 + Y*1000 + Z`.
    pub const fn from_number(number: i32) -> Self {
        Self {
            major: (number / 1_000_000) as u16,
            minor: ((number / 1_000) % 1_000) as u16,
            patch: (number % 1_000) as u16,
        }
    }

    /// Encode back into `sqlite3_libversion_number()` form.
    pub const fn to_number(self) -> i32 {
        self.major as i32 * 1_000_000 + self.minor as i32 * 1_000 + self.patch as i32
    }

    /// Return whether this version is at least `major.minor.patch`.
    pub fn at_least(self, major: u16, minor: u16, patch: u16) -> bool {
        self >= ApiVersion::new(major, minor, patch)
    }
}

/// Backend feature flags exposed by the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureSet {
    bits: u64,
}

impl FeatureSet {
    /// `prepare_v3` is available.
    pub const PREPARE_V3: FeatureSet = FeatureSet { bits: 1 << 0 };
    /// Virtual table APIs (`create_module_v2`, `declare_vtab`) are available.
    pub const VIRTUAL_TABLES: FeatureSet = FeatureSet { bits: 1 << 2 };
    /// Extended error code APIs are available.
    pub const EXTENDED_ERRCODES: FeatureSet = FeatureSet { bits: 1 << 3 };

    /// Build an empty flag set.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Build a flag set from raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    /// Return the raw bit representation.
    pub const fn bits(self) -> u64 {
        self.bits
    }

    /// Return whether `other` is fully contained in this set.
    pub const fn contains(self, other: FeatureSet) -> bool {
        (self.bits & other.bits) == other.bits
    }
}

impl core::ops::BitOr for FeatureSet {
    type Output = FeatureSet;

    fn bitor(self, rhs: FeatureSet) -> FeatureSet {
        FeatureSet {
            bits: self.bits | rhs.bits,
        }
    }
}

impl core::ops::BitOrAssign for FeatureSet {
    fn bitor_assign(&mut self, rhs: FeatureSet) {
        self.bits |= rhs.bits;
    }
}

/// Flags for opening a database connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFlags {
    bits: u32,
}

impl OpenFlags {
    /// Open database in read-only mode.
    pub const READ_ONLY: OpenFlags = OpenFlags { bits: 1 << 0 };
    /// Open database in read-write mode.
    pub const READ_WRITE: OpenFlags = OpenFlags { bits: 1 << 1 };
    /// Create database file when missing.
    pub const CREATE: OpenFlags = OpenFlags { bits: 1 << 2 };
    /// Treat filename as URI when supported.
    pub const URI: OpenFlags = OpenFlags { bits: 1 << 3 };
    /// Use connection-private mutex mode.
    pub const NO_MUTEX: OpenFlags = OpenFlags { bits: 1 << 4 };
    /// Use fully serialized mutex mode.
    pub const FULL_MUTEX: OpenFlags = OpenFlags { bits: 1 << 5 };
    /// Request extended result codes.
    pub const EXRESCODE: OpenFlags = OpenFlags { bits: 1 << 8 };

    /// Build an empty flag set.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Return the raw bit representation.
    pub const fn bits(self) -> u32 {
        self.bits
    }

    /// Return whether `other` is fully contained in this set.
    pub const fn contains(self, other: OpenFlags) -> bool {
        (self.bits & other.bits) == other.bits
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags {
            bits: self.bits | rhs.bits,
        }
    }
}

/// Options passed to `Sqlite3Api::open`.
pub struct OpenOptions<'a> {
    /// Backend-open flags translated from caller intent.
    pub flags: OpenFlags,
    /// Optional VFS name passed through to backend open.
    pub vfs: Option<&'a str>,
}

impl OpenOptions<'_> {
    /// Read-write, create-if-missing, default VFS.
    pub fn read_write_create() -> Self {
        OpenOptions {
            flags: OpenFlags::READ_WRITE | OpenFlags::CREATE,
            vfs: None,
        }
    }
}

/// Result of a `step` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// The statement produced a row.
    Row,
    /// The statement has finished.
    Done,
}

/// Outcome of preparing the first statement in a SQL string.
#[derive(Debug)]
pub struct Prepared<S> {
    /// Compiled statement, or `None` when the text held only whitespace or comments.
    pub stmt: Option<NonNull<S>>,
    /// Byte offset into the input where the unparsed remainder starts.
    pub tail: usize,
}

/// SQLite storage class for a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer,
    /// 64-bit floating value.
    Float,
    /// UTF-8 text.
    Text,
    /// Binary blob.
    Blob,
}

impl ValueType {
    /// Decode SQLite's integer storage-class code.
    pub const fn from_code(code: i32) -> ValueType {
        match code {
            1 => ValueType::Integer,
            2 => ValueType::Float,
            3 => ValueType::Text,
            4 => ValueType::Blob,
            _ => ValueType::Null,
        }
    }

    /// Encode this storage class into SQLite's integer code.
    pub const fn to_code(self) -> i32 {
        match self {
            ValueType::Null => 5,
            ValueType::Integer => 1,
            ValueType::Float => 2,
            ValueType::Text => 3,
            ValueType::Blob => 4,
        }
    }
}

/// Raw view into SQLite-managed bytes.
///
/// The pointer/length are tied to the lifetime of the current SQLite
/// row/value snapshot and are invalidated by lifecycle transitions such as
/// `step`, `reset`, or `finalize` on the owning statement, or by the return
/// of the callback that supplied a `sqlite3_value`. Callers that need
/// longer-lived data must copy the bytes.
#[derive(Clone, Copy, Debug)]
pub struct RawBytes {
    /// Pointer to backend-owned bytes.
    pub ptr: *const u8,
    /// Byte length of `ptr`.
    pub len: usize,
}

impl RawBytes {
    /// Empty byte view.
    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null(),
            len: 0,
        }
    }

    /// # Safety
    /// Caller must ensure the pointer/length remain valid for the returned slice.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// # Safety
    /// Caller must ensure the bytes remain valid for `'a`.
    pub unsafe fn as_str<'a>(self) -> Option<&'a str> {
        core::str::from_utf8(unsafe { self.as_slice() }).ok()
    }
}

/// Scalar callback signature used for overloaded functions (`xFindFunction`).
pub type ScalarFn<P> =
    extern "C" fn(*mut <P as Sqlite3Api>::Context, i32, *mut *mut <P as Sqlite3Api>::Value);

/// Provider SPI over a SQLite C API backend.
///
/// # Safety
/// Implementations must uphold the SQLite C ABI contracts.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Sqlite3Api: Send + Sync + 'static {
    /// Backend's opaque `sqlite3*` type.
    type Db;
    /// Backend's opaque `sqlite3_stmt*` type.
    type Stmt;
    /// Backend's opaque `sqlite3_value*` type.
    type Value;
    /// Backend's opaque `sqlite3_context*` type.
    type Context;

    /// Declared SQLite API version supported by this provider implementation.
    fn api_version(&self) -> ApiVersion;
    /// Compile/runtime capability flags available through this provider.
    fn feature_set(&self) -> FeatureSet;
    /// Stable backend identifier (for diagnostics and capability routing).
    fn backend_name(&self) -> &'static str;

    /// Return SQLite allocator-compatible memory for cross-FFI ownership.
    ///
    /// Every block the engine may later release itself (vtab and cursor
    /// handles, `zErrMsg`, `idxStr`) must come from here.
    unsafe fn malloc(&self, size: usize) -> *mut c_void;
    /// Free memory allocated through `malloc`. Null is a no-op.
    unsafe fn free(&self, ptr: *mut c_void);

    /// Open a database connection using backend-specific `open_v2` semantics.
    unsafe fn open(&self, filename: &str, options: OpenOptions<'_>) -> Result<NonNull<Self::Db>>;
    /// Close a database connection handle.
    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()>;

    /// Prepare the first statement of `sql` using legacy `prepare_v2` behavior.
    ///
    /// `tail` must lie on a char boundary of `sql`.
    unsafe fn prepare_v2(
        &self,
        db: NonNull<Self::Db>,
        sql: &str,
    ) -> Result<Prepared<Self::Stmt>>;
    /// Prepare the first statement of `sql` with `prepare_v3` flags.
    unsafe fn prepare_v3(
        &self,
        db: NonNull<Self::Db>,
        sql: &str,
        flags: u32,
    ) -> Result<Prepared<Self::Stmt>>;

    /// Execute one step of the virtual machine.
    unsafe fn step(&self, stmt: NonNull<Self::Stmt>) -> Result<StepResult>;
    /// Reset a prepared statement to run again.
    unsafe fn reset(&self, stmt: NonNull<Self::Stmt>) -> Result<()>;
    /// Finalize a prepared statement and release backend resources.
    unsafe fn finalize(&self, stmt: NonNull<Self::Stmt>) -> Result<()>;

    /// Bind SQL NULL at parameter index `idx` (1-based).
    unsafe fn bind_null(&self, stmt: NonNull<Self::Stmt>, idx: i32) -> Result<()>;
    /// Bind 64-bit integer at parameter index `idx` (1-based).
    unsafe fn bind_int64(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i64) -> Result<()>;
    /// Bind floating value at parameter index `idx` (1-based).
    unsafe fn bind_double(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: f64) -> Result<()>;
    /// Bind UTF-8 text at parameter index `idx` (1-based).
    ///
    /// Implementations must copy `v` or retain it safely per SQLite lifetime rules.
    unsafe fn bind_text(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &str) -> Result<()>;
    /// Bind bytes at parameter index `idx` (1-based).
    ///
    /// Implementations must copy `v` or retain it safely per SQLite lifetime rules.
    unsafe fn bind_blob(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()>;

    /// Number of columns in the current result row.
    unsafe fn column_count(&self, stmt: NonNull<Self::Stmt>) -> i32;
    /// SQLite storage class for `col` in the current row.
    unsafe fn column_type(&self, stmt: NonNull<Self::Stmt>, col: i32) -> ValueType;
    /// Integer value for `col` in the current row.
    unsafe fn column_int64(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i64;
    /// Floating value for `col` in the current row.
    unsafe fn column_double(&self, stmt: NonNull<Self::Stmt>, col: i32) -> f64;
    /// Raw text bytes for `col` in the current row snapshot.
    unsafe fn column_text(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;
    /// Raw blob bytes for `col` in the current row snapshot.
    unsafe fn column_blob(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;

    /// Primary SQLite result code for a connection.
    unsafe fn errcode(&self, db: NonNull<Self::Db>) -> i32;
    /// Backend-provided UTF-8 error message pointer for a connection.
    unsafe fn errmsg(&self, db: NonNull<Self::Db>) -> *const c_char;
    /// Extended SQLite result code, if supported.
    unsafe fn extended_errcode(&self, db: NonNull<Self::Db>) -> Option<i32>;

    /// Set current result to NULL.
    unsafe fn result_null(&self, ctx: NonNull<Self::Context>);
    /// Set current result to integer.
    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64);
    /// Set current result to floating value.
    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64);
    /// Providers must ensure SQLite copies or retains the buffer for `v`.
    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &str);
    /// Providers must ensure SQLite copies or retains the buffer for `v`.
    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]);
    /// Set current result to a zero-filled blob of `len` bytes.
    unsafe fn result_zeroblob(&self, ctx: NonNull<Self::Context>, len: usize) {
        let zeros = vec![0u8; len];
        unsafe { self.result_blob(ctx, &zeros) }
    }
    /// Set current result to an error message.
    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &str);
    /// Override the result code of an error already reported on `ctx`.
    unsafe fn result_error_code(&self, ctx: NonNull<Self::Context>, code: i32) {
        let msg = Error::new(ErrorCode::from_code(code)).to_string();
        unsafe { self.result_error(ctx, &msg) }
    }
    /// Report `SQLITE_TOOBIG` on `ctx`.
    unsafe fn result_error_toobig(&self, ctx: NonNull<Self::Context>) {
        unsafe { self.result_error(ctx, "string or blob too big") }
    }
    /// Report `SQLITE_NOMEM` on `ctx`.
    unsafe fn result_error_nomem(&self, ctx: NonNull<Self::Context>) {
        unsafe { self.result_error(ctx, "out of memory") }
    }

    /// SQLite storage class of an argument value.
    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType;
    /// Integer view of an argument value (with SQLite affinity conversion).
    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64;
    /// Floating view of an argument value (with SQLite affinity conversion).
    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64;
    /// Raw text bytes view of an argument value.
    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes;
    /// Raw blob bytes view of an argument value.
    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes;
    /// Byte length of the value in its current representation.
    unsafe fn value_bytes(&self, v: NonNull<Self::Value>) -> usize {
        match unsafe { self.value_type(v) } {
            ValueType::Blob => unsafe { self.value_blob(v) }.len,
            ValueType::Null => 0,
            _ => unsafe { self.value_text(v) }.len,
        }
    }

    /// Collation sequence of constraint `constraint` during xBestIndex.
    ///
    /// `None` when the backend cannot tell; callers then treat the
    /// comparison as unknown.
    unsafe fn vtab_collation(
        &self,
        info: NonNull<sqlite3_index_info>,
        constraint: usize,
    ) -> Option<String> {
        let _ = (info, constraint);
        None
    }

    /// Declare a virtual table schema during xCreate/xConnect.
    unsafe fn declare_vtab(&self, db: NonNull<Self::Db>, schema: &str) -> Result<()>;

    /// Register a virtual table module.
    ///
    /// `module` must stay valid until `drop_user_data` has been invoked.
    /// Ownership of `user_data` passes to the provider: on success the
    /// backend invokes `drop_user_data` when the module is replaced or the
    /// connection closes; on failure it must invoke it before returning.
    unsafe fn create_module_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        module: *const sqlite3_module<Self>,
        user_data: *mut c_void,
        drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::{ApiVersion, FeatureSet, ValueType};

    #[test]
    fn api_version_number_round_trip_and_ordering() {
        let v = ApiVersion::from_number(3_044_002);
        assert_eq!(v, ApiVersion::new(3, 44, 2));
        assert_eq!(v.to_number(), 3_044_002);
        assert!(v.at_least(3, 10, 0));
        assert!(!ApiVersion::new(3, 8, 1).at_least(3, 8, 2));
    }

    #[test]
    fn feature_set_contains() {
        let set = FeatureSet::VIRTUAL_TABLES | FeatureSet::PREPARE_V3;
        assert!(set.contains(FeatureSet::VIRTUAL_TABLES));
        assert!(!set.contains(FeatureSet::EXTENDED_ERRCODES));
    }

    #[test]
    fn value_type_codes() {
        assert_eq!(ValueType::from_code(1), ValueType::Integer);
        assert_eq!(ValueType::from_code(5), ValueType::Null);
        assert_eq!(ValueType::Blob.to_code(), 4);
    }
}
