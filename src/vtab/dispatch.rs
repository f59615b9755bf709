//! `extern "C"` entry points the engine calls through `sqlite3_module`.
//!
//! Every trampoline resolves its handles, runs the module under
//! `catch_unwind`, and turns failures into a result code plus a message on
//! the table (`zErrMsg`), the create error out-pointer, or the column
//! context. Nothing unwinds across the boundary.

use core::ffi::{c_char, c_void, CStr};
use core::ptr::NonNull;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::error::{Error, ErrorCode, Result};
use crate::provider::{ScalarFn, Sqlite3Api};
use crate::value::SqlValue;
use crate::vtab::args::ModuleArgs;
use crate::vtab::ffi::{sqlite3_index_info, sqlite3_module, sqlite3_vtab, sqlite3_vtab_cursor};
use crate::vtab::index::{copy_to_engine, read_index_info, replace_engine_string, write_index_info};
use crate::vtab::registry::VTabBlock;
use crate::vtab::{Module, ModuleHost, TableDeclaration, VirtualTable, VirtualTableCursor};

const SQLITE_OK: i32 = 0;
const SQLITE_ERROR: i32 = 1;

fn guarded<R>(op: &'static str, f: impl FnOnce() -> Result<R>) -> Result<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => Err(Error::with_message(
            ErrorCode::Error,
            format!("panic in virtual table {}", op),
        )),
    }
}

/// Module host recorded in a table block.
///
/// # Safety
/// The host pointer is read from `vtab` before any registry lookup, so
/// `vtab` must point at live memory. Registry checks afterwards reject a
/// live block that is not ours; they cannot make a freed block safe to read.
unsafe fn host_of<'h, P, M>(vtab: *mut sqlite3_vtab) -> Result<&'h ModuleHost<P, M>>
where
    P: Sqlite3Api,
    M: Module<P>,
{
    if vtab.is_null() {
        return Err(Error::internal("null virtual table handle"));
    }
    let host = unsafe { (*(vtab as *mut VTabBlock)).host };
    if host.is_null() {
        return Err(Error::internal("virtual table handle has no module"));
    }
    Ok(unsafe { &*(host as *const ModuleHost<P, M>) })
}

/// # Safety
/// Same as [`host_of`]: `cursor` is dereferenced before it is resolved.
unsafe fn table_of_cursor(cursor: *mut sqlite3_vtab_cursor) -> Result<*mut sqlite3_vtab> {
    if cursor.is_null() {
        return Err(Error::internal("null cursor handle"));
    }
    Ok(unsafe { (*cursor).p_vtab })
}

unsafe fn decode_str<'a>(ptr: *const c_char, what: &str) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(Some)
        .map_err(|_| Error::with_message(ErrorCode::Error, format!("{} is not valid UTF-8", what)))
}

unsafe fn collect_args<'a, P: Sqlite3Api>(
    api: &'a P,
    argc: i32,
    argv: *mut *mut P::Value,
) -> Vec<SqlValue<'a, P>> {
    let argc = argc.max(0) as usize;
    if argc == 0 || argv.is_null() {
        return Vec::new();
    }
    let raw = unsafe { core::slice::from_raw_parts(argv, argc) };
    raw.iter()
        .map(|value| unsafe { SqlValue::from_raw(api, *value) })
        .collect()
}

impl<P: Sqlite3Api, M: Module<P>> ModuleHost<P, M> {
    fn set_table_error(&self, vtab: *mut sqlite3_vtab, err: &Error) {
        if vtab.is_null() {
            return;
        }
        let msg = err.to_string();
        unsafe { replace_engine_string(self.api, &mut (*vtab).z_err_msg, &msg) };
    }

    fn finish(&self, vtab: *mut sqlite3_vtab, op: &'static str, result: Result<()>) -> i32 {
        match result {
            Ok(()) => SQLITE_OK,
            Err(err) => {
                warn!(
                    target: "sqlite_vtab",
                    module = %self.name,
                    op,
                    error = %err,
                    "virtual table callback failed"
                );
                self.set_table_error(vtab, &err);
                err.native_code()
            }
        }
    }

    fn with_table(
        &self,
        vtab: *mut sqlite3_vtab,
        op: &'static str,
        f: impl FnOnce(&Arc<VirtualTable<M::Table>>) -> Result<()>,
    ) -> i32 {
        let result = guarded(op, || {
            let table = self.tables.resolve(vtab as *const VTabBlock)?;
            f(&table)
        });
        self.finish(vtab, op, result)
    }

    fn with_cursor<R>(
        &self,
        cursor: *mut sqlite3_vtab_cursor,
        op: &'static str,
        f: impl FnOnce(&mut VirtualTableCursor<M::Table, M::Cursor>) -> Result<R>,
    ) -> Result<R> {
        guarded(op, || {
            let slot = self.cursors.resolve(cursor)?;
            let mut cursor = slot
                .try_lock()
                .ok_or_else(|| Error::internal("cursor re-entered while in use"))?;
            f(&mut cursor)
        })
    }
}

/// Run `f` with the host behind a table handle, or log and fail.
fn on_table<P, M>(
    vtab: *mut sqlite3_vtab,
    op: &'static str,
    f: impl FnOnce(&ModuleHost<P, M>, &Arc<VirtualTable<M::Table>>) -> Result<()>,
) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    match unsafe { host_of::<P, M>(vtab) } {
        Ok(host) => host.with_table(vtab, op, |table| f(host, table)),
        Err(err) => {
            warn!(target: "sqlite_vtab", op, error = %err, "unresolvable table handle");
            err.native_code()
        }
    }
}

/// Run `f` on a locked cursor; errors land on the cursor's table.
fn on_cursor<P, M>(
    cursor: *mut sqlite3_vtab_cursor,
    op: &'static str,
    f: impl FnOnce(&ModuleHost<P, M>, &mut VirtualTableCursor<M::Table, M::Cursor>) -> Result<()>,
) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    let vtab = match unsafe { table_of_cursor(cursor) } {
        Ok(vtab) => vtab,
        Err(err) => return err.native_code(),
    };
    match unsafe { host_of::<P, M>(vtab) } {
        Ok(host) => {
            let result = host.with_cursor(cursor, op, |c| f(host, c));
            host.finish(vtab, op, result)
        }
        Err(err) => {
            warn!(target: "sqlite_vtab", op, error = %err, "unresolvable cursor handle");
            err.native_code()
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn construct<P, M>(
    op: &'static str,
    create: bool,
    db: *mut P::Db,
    aux: *mut c_void,
    argc: i32,
    argv: *const *const c_char,
    pp_vtab: *mut *mut sqlite3_vtab,
    pz_err: *mut *mut c_char,
) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    if !pz_err.is_null() {
        unsafe { *pz_err = core::ptr::null_mut() };
    }
    if aux.is_null() {
        warn!(target: "sqlite_vtab", op, "module client data is missing");
        return SQLITE_ERROR;
    }
    let host = unsafe { &*(aux as *const ModuleHost<P, M>) };
    let result = guarded(op, || {
        let db = NonNull::new(db).ok_or_else(|| Error::internal("null database handle"))?;
        if pp_vtab.is_null() {
            return Err(Error::internal("null table out-pointer"));
        }
        let args = unsafe { ModuleArgs::from_raw(argc, argv) }?;
        // Allocate first so that no module state exists if the engine is out of memory.
        let block = host.tables.allocate(host.api)?;
        let decl = TableDeclaration::new(host.api, db);
        let built = guarded(op, || {
            if create {
                host.module.create(&decl, &args)
            } else {
                host.module.connect(&decl, &args)
            }
        });
        let table = match built {
            Ok(table) => VirtualTable {
                handle: block.as_ptr() as usize,
                args,
                table,
            },
            Err(err) => {
                unsafe { host.tables.abandon(host.api, block) };
                return Err(err);
            }
        };
        if !decl.is_declared() {
            let err = Error::with_message(
                ErrorCode::Error,
                format!("virtual table \"{}\" schema was not declared", table.name()),
            );
            undo_construct(host, op, create, &table);
            unsafe { host.tables.abandon(host.api, block) };
            return Err(err);
        }
        debug!(
            target: "sqlite_vtab",
            module = %host.name,
            database = %table.args.database_name,
            table = %table.name(),
            op,
            "virtual table attached"
        );
        host.tables.bind(host.api, block, table)?;
        unsafe {
            (*block.as_ptr()).host = host as *const ModuleHost<P, M> as *const c_void;
            *pp_vtab = block.as_ptr() as *mut sqlite3_vtab;
        }
        Ok(())
    });
    match result {
        Ok(()) => SQLITE_OK,
        Err(err) => {
            warn!(
                target: "sqlite_vtab",
                module = %host.name,
                op,
                error = %err,
                "virtual table construction failed"
            );
            if !pz_err.is_null() {
                let msg = err.to_string();
                if let Ok(raw) = unsafe { copy_to_engine(host.api, &msg) } {
                    unsafe { *pz_err = raw };
                }
            }
            err.native_code()
        }
    }
}

/// Tear down a table the engine never saw.
fn undo_construct<P, M>(
    host: &ModuleHost<P, M>,
    op: &'static str,
    create: bool,
    table: &VirtualTable<M::Table>,
) where
    P: Sqlite3Api,
    M: Module<P>,
{
    let undone = guarded(op, || {
        if create {
            host.module.destroy(table)
        } else {
            host.module.disconnect(table)
        }
    });
    if let Err(err) = undone {
        error!(
            target: "sqlite_vtab",
            module = %host.name,
            table = %table.name(),
            op,
            error = %err,
            "teardown of unattached table failed"
        );
    }
}

extern "C" fn x_create<P, M>(
    db: *mut P::Db,
    aux: *mut c_void,
    argc: i32,
    argv: *const *const c_char,
    pp_vtab: *mut *mut sqlite3_vtab,
    pz_err: *mut *mut c_char,
) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    construct::<P, M>("create", true, db, aux, argc, argv, pp_vtab, pz_err)
}

extern "C" fn x_connect<P, M>(
    db: *mut P::Db,
    aux: *mut c_void,
    argc: i32,
    argv: *const *const c_char,
    pp_vtab: *mut *mut sqlite3_vtab,
    pz_err: *mut *mut c_char,
) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    construct::<P, M>("connect", false, db, aux, argc, argv, pp_vtab, pz_err)
}

extern "C" fn x_best_index<P, M>(vtab: *mut sqlite3_vtab, info: *mut sqlite3_index_info) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    on_table::<P, M>(vtab, "best_index", |host, table| {
        if info.is_null() {
            return Err(Error::internal("null index info"));
        }
        let mut index = unsafe { read_index_info(host.api, info) };
        host.module.best_index(table, &mut index)?;
        unsafe { write_index_info(host.api, info, &index) }
    })
}

fn teardown<P, M>(vtab: *mut sqlite3_vtab, op: &'static str, destroy: bool) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    let host = match unsafe { host_of::<P, M>(vtab) } {
        Ok(host) => host,
        Err(err) => {
            error!(target: "sqlite_vtab", op, error = %err, "unresolvable table handle");
            return err.native_code();
        }
    };
    let result = guarded(op, || {
        let table = host.tables.resolve(vtab as *const VTabBlock)?;
        if destroy {
            host.module.destroy(&table)
        } else {
            host.module.disconnect(&table)
        }
    });
    if let Err(err) = &result {
        error!(
            target: "sqlite_vtab",
            module = %host.name,
            op,
            error = %err,
            "virtual table teardown failed"
        );
        if destroy {
            // The engine keeps the table connected after a failed xDestroy.
            return err.native_code();
        }
    }
    let Some(block) = NonNull::new(vtab as *mut VTabBlock) else {
        return SQLITE_ERROR;
    };
    match host.tables.release(host.api, block) {
        Ok(table) => {
            debug!(
                target: "sqlite_vtab",
                module = %host.name,
                table = %table.name(),
                op,
                "virtual table released"
            );
        }
        Err(err) => {
            error!(target: "sqlite_vtab", op, error = %err, "virtual table release failed");
            return err.native_code();
        }
    }
    match result {
        Ok(()) => SQLITE_OK,
        Err(err) => err.native_code(),
    }
}

extern "C" fn x_disconnect<P, M>(vtab: *mut sqlite3_vtab) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    teardown::<P, M>(vtab, "disconnect", false)
}

extern "C" fn x_destroy<P, M>(vtab: *mut sqlite3_vtab) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    teardown::<P, M>(vtab, "destroy", true)
}

extern "C" fn x_open<P, M>(vtab: *mut sqlite3_vtab, pp_cursor: *mut *mut sqlite3_vtab_cursor) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    on_table::<P, M>(vtab, "open", |host, table| {
        if pp_cursor.is_null() {
            return Err(Error::internal("null cursor out-pointer"));
        }
        let block = host.cursors.allocate(host.api)?;
        let state = match guarded("open", || host.module.open(table)) {
            Ok(state) => state,
            Err(err) => {
                unsafe { host.cursors.abandon(host.api, block) };
                return Err(err);
            }
        };
        let cursor = VirtualTableCursor::new(block.as_ptr() as usize, Arc::clone(table), state);
        host.cursors.bind(host.api, block, Mutex::new(cursor))?;
        unsafe {
            (*block.as_ptr()).p_vtab = vtab;
            *pp_cursor = block.as_ptr();
        }
        let handle = block.as_ptr() as usize;
        debug!(target: "sqlite_vtab", table = %table.name(), handle, "cursor opened");
        Ok(())
    })
}

extern "C" fn x_close<P, M>(cursor: *mut sqlite3_vtab_cursor) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    let vtab = match unsafe { table_of_cursor(cursor) } {
        Ok(vtab) => vtab,
        Err(err) => return err.native_code(),
    };
    let host = match unsafe { host_of::<P, M>(vtab) } {
        Ok(host) => host,
        Err(err) => {
            warn!(target: "sqlite_vtab", op = "close", error = %err, "unresolvable cursor handle");
            return err.native_code();
        }
    };
    let result = host.with_cursor(cursor, "close", |c| host.module.close(c));
    let released = match NonNull::new(cursor) {
        Some(block) => host.cursors.release(host.api, block).map(drop),
        None => Err(Error::internal("null cursor handle")),
    };
    if released.is_ok() {
        let handle = cursor as usize;
        debug!(target: "sqlite_vtab", handle, "cursor closed");
    }
    host.finish(vtab, "close", result.and(released))
}

extern "C" fn x_filter<P, M>(
    cursor: *mut sqlite3_vtab_cursor,
    idx_num: i32,
    idx_str: *const c_char,
    argc: i32,
    argv: *mut *mut P::Value,
) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    on_cursor::<P, M>(cursor, "filter", |host, cursor| {
        let idx_str = unsafe { decode_str(idx_str, "index string") }?;
        let args = unsafe { collect_args(host.api, argc, argv) };
        cursor.select_index(idx_num, idx_str);
        host.module.filter(cursor, idx_num, idx_str, &args)
    })
}

extern "C" fn x_next<P, M>(cursor: *mut sqlite3_vtab_cursor) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    on_cursor::<P, M>(cursor, "next", |host, cursor| host.module.next(cursor))
}

extern "C" fn x_eof<P, M>(cursor: *mut sqlite3_vtab_cursor) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    let mut eof = true;
    // A failed eof check ends the scan.
    on_cursor::<P, M>(cursor, "eof", |host, cursor| {
        eof = host.module.eof(cursor);
        Ok(())
    });
    i32::from(eof)
}

extern "C" fn x_column<P, M>(
    cursor: *mut sqlite3_vtab_cursor,
    ctx: *mut P::Context,
    col: i32,
) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    on_cursor::<P, M>(cursor, "column", |host, cursor| {
        let ctx = NonNull::new(ctx).ok_or_else(|| Error::internal("null result context"))?;
        let context = unsafe { Context::from_raw(host.api, ctx) };
        let result = host.module.column(cursor, &context, col);
        if let Err(err) = &result {
            context.report_error(err);
        }
        result
    })
}

extern "C" fn x_rowid<P, M>(cursor: *mut sqlite3_vtab_cursor, p_rowid: *mut i64) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    on_cursor::<P, M>(cursor, "rowid", |host, cursor| {
        if p_rowid.is_null() {
            return Err(Error::internal("null rowid out-pointer"));
        }
        let rowid = host.module.rowid(cursor)?;
        unsafe { *p_rowid = rowid };
        Ok(())
    })
}

extern "C" fn x_update<P, M>(
    vtab: *mut sqlite3_vtab,
    argc: i32,
    argv: *mut *mut P::Value,
    p_rowid: *mut i64,
) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    on_table::<P, M>(vtab, "update", |host, table| {
        let args = unsafe { collect_args(host.api, argc, argv) };
        let rowid = host.module.update(table, &args)?;
        if !p_rowid.is_null() {
            unsafe { *p_rowid = rowid };
        }
        Ok(())
    })
}

extern "C" fn x_begin<P: Sqlite3Api, M: Module<P>>(vtab: *mut sqlite3_vtab) -> i32 {
    on_table::<P, M>(vtab, "begin", |host, table| host.module.begin(table))
}

extern "C" fn x_sync<P: Sqlite3Api, M: Module<P>>(vtab: *mut sqlite3_vtab) -> i32 {
    on_table::<P, M>(vtab, "sync", |host, table| host.module.sync(table))
}

extern "C" fn x_commit<P: Sqlite3Api, M: Module<P>>(vtab: *mut sqlite3_vtab) -> i32 {
    on_table::<P, M>(vtab, "commit", |host, table| host.module.commit(table))
}

extern "C" fn x_rollback<P: Sqlite3Api, M: Module<P>>(vtab: *mut sqlite3_vtab) -> i32 {
    on_table::<P, M>(vtab, "rollback", |host, table| host.module.rollback(table))
}

extern "C" fn x_find_function<P, M>(
    vtab: *mut sqlite3_vtab,
    n_arg: i32,
    name: *const c_char,
    p_xfunc: *mut Option<ScalarFn<P>>,
    pp_arg: *mut *mut c_void,
) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    let host = match unsafe { host_of::<P, M>(vtab) } {
        Ok(host) => host,
        Err(_) => return 0,
    };
    let found = guarded("find_function", || {
        let table = host.tables.resolve(vtab as *const VTabBlock)?;
        let name = unsafe { decode_str(name, "function name") }?.unwrap_or("");
        Ok(host.module.find_function(&table, n_arg, name))
    });
    match found {
        Ok(Some(overload)) if !p_xfunc.is_null() && !pp_arg.is_null() => {
            unsafe {
                *p_xfunc = Some(overload.func);
                *pp_arg = overload.user_data;
            }
            1
        }
        Ok(_) => 0,
        Err(err) => {
            warn!(target: "sqlite_vtab", op = "find_function", error = %err, "lookup failed");
            0
        }
    }
}

extern "C" fn x_rename<P, M>(vtab: *mut sqlite3_vtab, new_name: *const c_char) -> i32
where
    P: Sqlite3Api,
    M: Module<P>,
{
    on_table::<P, M>(vtab, "rename", |host, table| {
        let new_name = unsafe { decode_str(new_name, "table name") }?
            .ok_or_else(|| Error::internal("null table name"))?;
        host.module.rename(table, new_name)
    })
}

extern "C" fn x_savepoint<P: Sqlite3Api, M: Module<P>>(vtab: *mut sqlite3_vtab, n: i32) -> i32 {
    on_table::<P, M>(vtab, "savepoint", |host, table| host.module.savepoint(table, n))
}

extern "C" fn x_release<P: Sqlite3Api, M: Module<P>>(vtab: *mut sqlite3_vtab, n: i32) -> i32 {
    on_table::<P, M>(vtab, "release", |host, table| host.module.release(table, n))
}

extern "C" fn x_rollback_to<P: Sqlite3Api, M: Module<P>>(vtab: *mut sqlite3_vtab, n: i32) -> i32 {
    on_table::<P, M>(vtab, "rollback_to", |host, table| host.module.rollback_to(table, n))
}

/// Dispatch table for module ABI `version` (1 or 2).
pub(crate) fn module_table<P, M>(version: i32) -> sqlite3_module<P>
where
    P: Sqlite3Api,
    M: Module<P>,
{
    let v2 = version >= 2;
    sqlite3_module {
        i_version: version,
        x_create: Some(x_create::<P, M>),
        x_connect: Some(x_connect::<P, M>),
        x_best_index: Some(x_best_index::<P, M>),
        x_disconnect: Some(x_disconnect::<P, M>),
        x_destroy: Some(x_destroy::<P, M>),
        x_open: Some(x_open::<P, M>),
        x_close: Some(x_close::<P, M>),
        x_filter: Some(x_filter::<P, M>),
        x_next: Some(x_next::<P, M>),
        x_eof: Some(x_eof::<P, M>),
        x_column: Some(x_column::<P, M>),
        x_rowid: Some(x_rowid::<P, M>),
        x_update: Some(x_update::<P, M>),
        x_begin: Some(x_begin::<P, M>),
        x_sync: Some(x_sync::<P, M>),
        x_commit: Some(x_commit::<P, M>),
        x_rollback: Some(x_rollback::<P, M>),
        x_find_function: Some(x_find_function::<P, M>),
        x_rename: Some(x_rename::<P, M>),
        x_savepoint: if v2 { Some(x_savepoint::<P, M>) } else { None },
        x_release: if v2 { Some(x_release::<P, M>) } else { None },
        x_rollback_to: if v2 { Some(x_rollback_to::<P, M>) } else { None },
        x_shadow_name: None,
        x_integrity: None,
    }
}
