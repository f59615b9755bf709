//! Fixed-layout records shared with the engine's virtual-table ABI.
//!
//! Every struct here mirrors `sqlite3.h` field for field. The index-info
//! envelope grew over releases, so trailing fields must only be touched
//! through raw place expressions after checking the engine version; never
//! form a `&sqlite3_index_info` over memory an older engine allocated.
#![allow(non_camel_case_types)]

use core::ffi::{c_char, c_void};

use crate::provider::{ScalarFn, Sqlite3Api};

/// Base of every virtual table handle (`sqlite3_vtab`).
#[repr(C)]
pub struct sqlite3_vtab {
    /// Module that created this table; set by the engine after xCreate/xConnect.
    pub p_module: *const c_void,
    /// Reserved for the engine.
    pub n_ref: i32,
    /// Error message, allocated with the engine allocator.
    pub z_err_msg: *mut c_char,
}

/// Base of every cursor handle (`sqlite3_vtab_cursor`).
#[repr(C)]
pub struct sqlite3_vtab_cursor {
    /// Table this cursor was opened on.
    pub p_vtab: *mut sqlite3_vtab,
}

/// One WHERE-clause term offered to xBestIndex.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct sqlite3_index_constraint {
    /// Constrained column; -1 for rowid.
    pub i_column: i32,
    /// Constraint operator (`SQLITE_INDEX_CONSTRAINT_*`).
    pub op: u8,
    /// Non-zero when the constraint can be used.
    pub usable: u8,
    /// Used internally by the engine.
    pub i_term_offset: i32,
}

/// One ORDER BY term offered to xBestIndex.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct sqlite3_index_orderby {
    /// Column number.
    pub i_column: i32,
    /// Non-zero for DESC.
    pub desc: u8,
}

/// Per-constraint output of xBestIndex.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct sqlite3_index_constraint_usage {
    /// 1-based position in xFilter's argv; 0 leaves the value out.
    pub argv_index: i32,
    /// Non-zero tells the engine it need not re-check the constraint.
    pub omit: u8,
}

/// The xBestIndex envelope: inputs first, outputs after.
#[repr(C)]
pub struct sqlite3_index_info {
    pub n_constraint: i32,
    pub a_constraint: *mut sqlite3_index_constraint,
    pub n_order_by: i32,
    pub a_order_by: *mut sqlite3_index_orderby,
    pub a_constraint_usage: *mut sqlite3_index_constraint_usage,
    pub idx_num: i32,
    pub idx_str: *mut c_char,
    pub need_to_free_idx_str: i32,
    pub order_by_consumed: i32,
    pub estimated_cost: f64,
    /// Since 3.8.2.
    pub estimated_rows: i64,
    /// Since 3.9.0.
    pub idx_flags: i32,
    /// Since 3.10.0.
    pub col_used: u64,
}

pub const SQLITE_INDEX_SCAN_UNIQUE: i32 = 1;

pub const SQLITE_INDEX_CONSTRAINT_EQ: u8 = 2;
pub const SQLITE_INDEX_CONSTRAINT_GT: u8 = 4;
pub const SQLITE_INDEX_CONSTRAINT_LE: u8 = 8;
pub const SQLITE_INDEX_CONSTRAINT_LT: u8 = 16;
pub const SQLITE_INDEX_CONSTRAINT_GE: u8 = 32;
pub const SQLITE_INDEX_CONSTRAINT_MATCH: u8 = 64;
pub const SQLITE_INDEX_CONSTRAINT_LIKE: u8 = 65;
pub const SQLITE_INDEX_CONSTRAINT_GLOB: u8 = 66;
pub const SQLITE_INDEX_CONSTRAINT_REGEXP: u8 = 67;
pub const SQLITE_INDEX_CONSTRAINT_NE: u8 = 68;
pub const SQLITE_INDEX_CONSTRAINT_ISNOT: u8 = 69;
pub const SQLITE_INDEX_CONSTRAINT_ISNOTNULL: u8 = 70;
pub const SQLITE_INDEX_CONSTRAINT_ISNULL: u8 = 71;
pub const SQLITE_INDEX_CONSTRAINT_IS: u8 = 72;
pub const SQLITE_INDEX_CONSTRAINT_LIMIT: u8 = 73;
pub const SQLITE_INDEX_CONSTRAINT_OFFSET: u8 = 74;
pub const SQLITE_INDEX_CONSTRAINT_FUNCTION: u8 = 150;

/// `xCreate`/`xConnect` signature.
pub type CreateFn<P> = extern "C" fn(
    *mut <P as Sqlite3Api>::Db,
    *mut c_void,
    i32,
    *const *const c_char,
    *mut *mut sqlite3_vtab,
    *mut *mut c_char,
) -> i32;

/// `xFindFunction` signature.
pub type FindFunctionFn<P> = extern "C" fn(
    *mut sqlite3_vtab,
    i32,
    *const c_char,
    *mut Option<ScalarFn<P>>,
    *mut *mut c_void,
) -> i32;

/// Module dispatch table (`sqlite3_module`), versions 1 through 4.
///
/// Version 3 and 4 slots are carried so the struct has the size newer
/// engines expect; they stay `None` for the versions advertised here.
#[repr(C)]
pub struct sqlite3_module<P: Sqlite3Api> {
    pub i_version: i32,
    pub x_create: Option<CreateFn<P>>,
    pub x_connect: Option<CreateFn<P>>,
    pub x_best_index: Option<extern "C" fn(*mut sqlite3_vtab, *mut sqlite3_index_info) -> i32>,
    pub x_disconnect: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    pub x_destroy: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    pub x_open: Option<extern "C" fn(*mut sqlite3_vtab, *mut *mut sqlite3_vtab_cursor) -> i32>,
    pub x_close: Option<extern "C" fn(*mut sqlite3_vtab_cursor) -> i32>,
    pub x_filter: Option<
        extern "C" fn(
            *mut sqlite3_vtab_cursor,
            i32,
            *const c_char,
            i32,
            *mut *mut <P as Sqlite3Api>::Value,
        ) -> i32,
    >,
    pub x_next: Option<extern "C" fn(*mut sqlite3_vtab_cursor) -> i32>,
    pub x_eof: Option<extern "C" fn(*mut sqlite3_vtab_cursor) -> i32>,
    pub x_column: Option<
        extern "C" fn(*mut sqlite3_vtab_cursor, *mut <P as Sqlite3Api>::Context, i32) -> i32,
    >,
    pub x_rowid: Option<extern "C" fn(*mut sqlite3_vtab_cursor, *mut i64) -> i32>,
    pub x_update: Option<
        extern "C" fn(*mut sqlite3_vtab, i32, *mut *mut <P as Sqlite3Api>::Value, *mut i64) -> i32,
    >,
    pub x_begin: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    pub x_sync: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    pub x_commit: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    pub x_rollback: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    pub x_find_function: Option<FindFunctionFn<P>>,
    pub x_rename: Option<extern "C" fn(*mut sqlite3_vtab, *const c_char) -> i32>,
    // Version 2.
    pub x_savepoint: Option<extern "C" fn(*mut sqlite3_vtab, i32) -> i32>,
    pub x_release: Option<extern "C" fn(*mut sqlite3_vtab, i32) -> i32>,
    pub x_rollback_to: Option<extern "C" fn(*mut sqlite3_vtab, i32) -> i32>,
    // Version 3.
    pub x_shadow_name: Option<extern "C" fn(*const c_char) -> i32>,
    // Version 4.
    pub x_integrity: Option<
        extern "C" fn(*mut sqlite3_vtab, *const c_char, *const c_char, i32, *mut *mut c_char) -> i32,
    >,
}

/// Address of the `n`th element of a native array.
///
/// # Safety
/// `base` must point to an array of at least `n + 1` elements.
#[inline]
pub(crate) unsafe fn element<T>(base: *mut T, n: usize) -> *mut T {
    unsafe { base.add(n) }
}
