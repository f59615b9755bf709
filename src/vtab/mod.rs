//! Virtual table bridge.
//!
//! A [`Module`] implementation is wrapped in a [`ModuleHost`], which owns the
//! dispatch table handed to the engine and the registries mapping engine
//! handles back to [`VirtualTable`] and [`VirtualTableCursor`] objects.

use core::cell::Cell;
use core::ffi::c_void;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::provider::{ScalarFn, Sqlite3Api, ValueType};
use crate::value::SqlValue;

mod args;
mod dispatch;
pub mod enumerable;
pub mod ffi;
mod index;
#[cfg(test)]
#[path = "../../tests/support/mock.rs"]
pub(crate) mod mock;
mod registry;

pub use self::args::{dequote, escape_double_quote, parameter, ModuleArgs};
pub use self::index::{
    ConstraintUsage, IndexConstraint, IndexConstraintOp, IndexInfo, IndexOrderBy,
    DEFAULT_ESTIMATED_COST,
};
pub use self::registry::{HandleRegistry, NativeBlock, VTabBlock};

use self::ffi::{sqlite3_module, sqlite3_vtab_cursor};

/// A virtual table implementation.
///
/// Tables are shared between cursors and receive `&`; cursors are owned by
/// one scan at a time and receive `&mut`. Only the scan callbacks and
/// [`Module::best_index`] are required; everything else defaults to a
/// read-only table without transactions.
pub trait Module<P: Sqlite3Api>: Send + Sync + 'static {
    /// Per-table state.
    type Table: Send + Sync + 'static;
    /// Per-scan state.
    type Cursor: Send + 'static;

    /// `CREATE VIRTUAL TABLE`. Must call [`TableDeclaration::declare`].
    fn create(&self, decl: &TableDeclaration<'_, P>, args: &ModuleArgs) -> Result<Self::Table>;

    /// Attach to a table created earlier. Must call [`TableDeclaration::declare`].
    fn connect(&self, decl: &TableDeclaration<'_, P>, args: &ModuleArgs) -> Result<Self::Table> {
        self.create(decl, args)
    }

    fn best_index(&self, table: &VirtualTable<Self::Table>, index: &mut IndexInfo) -> Result<()>;

    /// The engine ignores failures here; they are only logged.
    fn disconnect(&self, _table: &VirtualTable<Self::Table>) -> Result<()> {
        Ok(())
    }

    /// `DROP TABLE`. On failure the table stays connected.
    fn destroy(&self, table: &VirtualTable<Self::Table>) -> Result<()> {
        self.disconnect(table)
    }

    fn open(&self, table: &VirtualTable<Self::Table>) -> Result<Self::Cursor>;

    fn close(&self, _cursor: &mut VirtualTableCursor<Self::Table, Self::Cursor>) -> Result<()> {
        Ok(())
    }

    /// Start (or restart) a scan. Position state must be reset, not extended.
    fn filter(
        &self,
        cursor: &mut VirtualTableCursor<Self::Table, Self::Cursor>,
        idx_num: i32,
        idx_str: Option<&str>,
        args: &[SqlValue<'_, P>],
    ) -> Result<()>;

    fn next(&self, cursor: &mut VirtualTableCursor<Self::Table, Self::Cursor>) -> Result<()>;

    /// True exactly when no further `column`/`rowid` call is valid.
    fn eof(&self, cursor: &VirtualTableCursor<Self::Table, Self::Cursor>) -> bool;

    /// Write exactly one result into `ctx`.
    fn column(
        &self,
        cursor: &VirtualTableCursor<Self::Table, Self::Cursor>,
        ctx: &Context<'_, P>,
        col: i32,
    ) -> Result<()>;

    fn rowid(&self, cursor: &VirtualTableCursor<Self::Table, Self::Cursor>) -> Result<i64>;

    /// INSERT, UPDATE or DELETE; see [`UpdateKind::of`]. Returns the rowid of
    /// an inserted row.
    fn update(&self, table: &VirtualTable<Self::Table>, _args: &[SqlValue<'_, P>]) -> Result<i64> {
        Err(Error::read_only(table.name()))
    }

    fn begin(&self, _table: &VirtualTable<Self::Table>) -> Result<()> {
        Ok(())
    }

    fn sync(&self, _table: &VirtualTable<Self::Table>) -> Result<()> {
        Ok(())
    }

    fn commit(&self, _table: &VirtualTable<Self::Table>) -> Result<()> {
        Ok(())
    }

    fn rollback(&self, _table: &VirtualTable<Self::Table>) -> Result<()> {
        Ok(())
    }

    /// Overload a SQL function when its first argument is a column of this table.
    fn find_function(
        &self,
        _table: &VirtualTable<Self::Table>,
        _n_arg: i32,
        _name: &str,
    ) -> Option<FunctionOverload<P>> {
        None
    }

    fn rename(&self, _table: &VirtualTable<Self::Table>, _new_name: &str) -> Result<()> {
        Ok(())
    }

    fn savepoint(&self, _table: &VirtualTable<Self::Table>, _savepoint: i32) -> Result<()> {
        Ok(())
    }

    fn release(&self, _table: &VirtualTable<Self::Table>, _savepoint: i32) -> Result<()> {
        Ok(())
    }

    fn rollback_to(&self, _table: &VirtualTable<Self::Table>, _savepoint: i32) -> Result<()> {
        Ok(())
    }
}

/// Replacement implementation returned from [`Module::find_function`].
pub struct FunctionOverload<P: Sqlite3Api> {
    pub func: ScalarFn<P>,
    pub user_data: *mut c_void,
}

/// Shape of an xUpdate call, decoded from its argument list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
    /// `args[0]` is the rowid to delete.
    Delete,
    /// `args[1]` is the requested rowid (or NULL), `args[2..]` the columns.
    Insert,
    /// `args[0]` is the old rowid, `args[1]` the new one, `args[2..]` the columns.
    Update,
}

impl UpdateKind {
    pub fn of<P: Sqlite3Api>(args: &[SqlValue<'_, P>]) -> UpdateKind {
        match args {
            [_] => UpdateKind::Delete,
            [first, ..] if first.value_type() == ValueType::Null => UpdateKind::Insert,
            _ => UpdateKind::Update,
        }
    }
}

/// Table-declaration service available during create/connect.
pub struct TableDeclaration<'a, P: Sqlite3Api> {
    api: &'a P,
    db: NonNull<P::Db>,
    declared: Cell<bool>,
}

impl<'a, P: Sqlite3Api> TableDeclaration<'a, P> {
    pub(crate) fn new(api: &'a P, db: NonNull<P::Db>) -> Self {
        Self {
            api,
            db,
            declared: Cell::new(false),
        }
    }

    /// Register the column schema, e.g. `CREATE TABLE x(a, b HIDDEN)`.
    pub fn declare(&self, schema: &str) -> Result<()> {
        unsafe { self.api.declare_vtab(self.db, schema) }?;
        self.declared.set(true);
        Ok(())
    }

    pub fn is_declared(&self) -> bool {
        self.declared.get()
    }

    pub fn api(&self) -> &'a P {
        self.api
    }

    /// Connection the table is being created on.
    pub fn db(&self) -> NonNull<P::Db> {
        self.db
    }
}

/// One live table instance.
pub struct VirtualTable<T> {
    handle: usize,
    args: ModuleArgs,
    table: T,
}

impl<T> VirtualTable<T> {
    /// Address of the engine handle; stable for the table's lifetime.
    pub fn handle(&self) -> usize {
        self.handle
    }

    pub fn args(&self) -> &ModuleArgs {
        &self.args
    }

    pub fn name(&self) -> &str {
        &self.args.table_name
    }

    pub fn get(&self) -> &T {
        &self.table
    }
}

impl<T> Deref for VirtualTable<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.table
    }
}

/// One scan over a table.
pub struct VirtualTableCursor<T, C> {
    handle: usize,
    table: Arc<VirtualTable<T>>,
    idx_num: i32,
    idx_str: Option<String>,
    state: C,
}

impl<T, C> VirtualTableCursor<T, C> {
    fn new(handle: usize, table: Arc<VirtualTable<T>>, state: C) -> Self {
        Self {
            handle,
            table,
            idx_num: 0,
            idx_str: None,
            state,
        }
    }

    pub fn handle(&self) -> usize {
        self.handle
    }

    pub fn table(&self) -> &VirtualTable<T> {
        &self.table
    }

    /// Index number chosen by the most recent filter.
    pub fn idx_num(&self) -> i32 {
        self.idx_num
    }

    pub fn idx_str(&self) -> Option<&str> {
        self.idx_str.as_deref()
    }

    pub fn state(&self) -> &C {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut C {
        &mut self.state
    }

    fn select_index(&mut self, idx_num: i32, idx_str: Option<&str>) {
        self.idx_num = idx_num;
        self.idx_str = idx_str.map(str::to_owned);
    }
}

impl<T, C> Deref for VirtualTableCursor<T, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.state
    }
}

impl<T, C> DerefMut for VirtualTableCursor<T, C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.state
    }
}

type CursorSlot<M, P> =
    Mutex<VirtualTableCursor<<M as Module<P>>::Table, <M as Module<P>>::Cursor>>;

/// Registered form of a [`Module`].
///
/// The host must outlive every table and cursor it issued; the engine keeps
/// it alive through the reference taken in [`Connection::create_module`].
///
/// [`Connection::create_module`]: crate::Connection::create_module
pub struct ModuleHost<P: Sqlite3Api, M: Module<P>> {
    api: &'static P,
    name: String,
    declared: AtomicBool,
    dispatch: sqlite3_module<P>,
    module: M,
    tables: HandleRegistry<VTabBlock, VirtualTable<M::Table>>,
    cursors: HandleRegistry<sqlite3_vtab_cursor, CursorSlot<M, P>>,
}

/// Module ABI version advertised by default (adds savepoint callbacks).
pub const DEFAULT_MODULE_VERSION: i32 = 2;

impl<P: Sqlite3Api, M: Module<P>> ModuleHost<P, M> {
    pub fn new(api: &'static P, name: impl Into<String>, module: M) -> Self {
        Self {
            api,
            name: name.into(),
            declared: AtomicBool::new(false),
            dispatch: dispatch::module_table::<P, M>(DEFAULT_MODULE_VERSION),
            module,
            tables: HandleRegistry::new(),
            cursors: HandleRegistry::new(),
        }
    }

    /// Advertise module ABI version 1 or 2.
    pub fn with_version(mut self, version: i32) -> Result<Self> {
        if !(1..=2).contains(&version) {
            return Err(Error::misuse(format!(
                "unsupported virtual table module version {}",
                version
            )));
        }
        self.dispatch = dispatch::module_table::<P, M>(version);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> &'static P {
        self.api
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    /// Whether the module has been registered with an engine connection.
    pub fn is_declared(&self) -> bool {
        self.declared.load(Ordering::Acquire)
    }

    pub(crate) fn mark_declared(&self) {
        self.declared.store(true, Ordering::Release);
    }

    /// The dispatch table handed to the engine.
    pub fn dispatch(&self) -> &sqlite3_module<P> {
        &self.dispatch
    }

    /// Live table handles.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Live cursor handles.
    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    /// Pointer passed to the engine as the module's client data.
    ///
    /// Takes a strong reference that [`ModuleHost::release_raw`] gives back.
    pub fn into_raw(host: Arc<Self>) -> *mut c_void {
        Arc::into_raw(host) as *mut c_void
    }

    /// Drop the reference taken by [`ModuleHost::into_raw`].
    pub extern "C" fn release_raw(ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        drop(unsafe { Arc::from_raw(ptr as *const Self) });
    }
}
