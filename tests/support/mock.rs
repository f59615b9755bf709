//! Engine double shared by the unit tests and the bridge integration tests.
//!
//! Allocations go through a tracked heap so tests can assert that every
//! engine-visible block comes back. Statements replay rows queued with
//! [`MockEngine::set_rows`].

#![allow(dead_code)]

use std::alloc::Layout;
use std::collections::HashMap;
use std::ffi::{c_char, c_void};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sqlite_vtab::vtab::ffi::{sqlite3_index_info, sqlite3_module};
use sqlite_vtab::{
    ApiVersion, Error, ErrorCode, FeatureSet, OpenOptions, Prepared, RawBytes, Result, Sqlite3Api,
    StepResult, ValueType,
};

#[derive(Clone, Debug, PartialEq)]
pub enum MockValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum MockResult {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Error(String),
    ErrorCode(i32),
}

#[derive(Default)]
pub struct MockContext {
    pub results: Vec<MockResult>,
}

pub struct MockStmt {
    pub sql: String,
    pub rows: Vec<Vec<MockValue>>,
    pub row_index: usize,
    pub current_row: Option<usize>,
    pub binds: Vec<(i32, MockValue)>,
}

impl MockStmt {
    fn current_value(&self, col: i32) -> Option<&MockValue> {
        let row = self.current_row?;
        self.rows.get(row)?.get(usize::try_from(col).ok()?)
    }
}

pub struct RegisteredModule {
    pub name: String,
    pub user_data: *mut c_void,
    pub drop_user_data: Option<extern "C" fn(*mut c_void)>,
}

#[derive(Default)]
pub struct MockDb {
    pub declared: Mutex<Vec<String>>,
    pub reject_declare: AtomicBool,
    pub modules: Mutex<Vec<RegisteredModule>>,
}

impl Drop for MockDb {
    fn drop(&mut self) {
        for module in self.modules.lock().drain(..) {
            if let Some(drop_user_data) = module.drop_user_data {
                drop_user_data(module.user_data);
            }
        }
    }
}

pub struct MockEngine {
    version: ApiVersion,
    features: FeatureSet,
    allocations: Mutex<HashMap<usize, Layout>>,
    fail_alloc: AtomicBool,
    next_rows: Mutex<Vec<Vec<MockValue>>>,
    prepared: Mutex<Vec<String>>,
    collations: Mutex<HashMap<usize, String>>,
    pub prepare_v2_calls: AtomicUsize,
    pub prepare_v3_calls: AtomicUsize,
    pub create_module_calls: AtomicUsize,
}

impl MockEngine {
    /// Engine with virtual table support only.
    pub fn leak(version: ApiVersion) -> &'static MockEngine {
        Self::leak_with(version, FeatureSet::VIRTUAL_TABLES)
    }

    pub fn leak_with(version: ApiVersion, features: FeatureSet) -> &'static MockEngine {
        Box::leak(Box::new(MockEngine {
            version,
            features,
            allocations: Mutex::new(HashMap::new()),
            fail_alloc: AtomicBool::new(false),
            next_rows: Mutex::new(Vec::new()),
            prepared: Mutex::new(Vec::new()),
            collations: Mutex::new(HashMap::new()),
            prepare_v2_calls: AtomicUsize::new(0),
            prepare_v3_calls: AtomicUsize::new(0),
            create_module_calls: AtomicUsize::new(0),
        }))
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().len()
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::SeqCst);
    }

    /// Rows the next prepared statement will yield.
    pub fn set_rows(&self, rows: Vec<Vec<MockValue>>) {
        *self.next_rows.lock() = rows;
    }

    /// Text of every statement compiled so far, trimmed.
    pub fn prepared_sql(&self) -> Vec<String> {
        self.prepared.lock().clone()
    }

    /// Collation reported for constraint `constraint`; unset ones are `BINARY`.
    pub fn set_collation(&self, constraint: usize, name: &str) {
        self.collations.lock().insert(constraint, name.to_owned());
    }

    pub fn alloc_c_string(&self, text: &str) -> *mut c_char {
        let raw = unsafe { self.malloc(text.len() + 1) } as *mut u8;
        assert!(!raw.is_null(), "mock allocation failed");
        unsafe {
            std::ptr::copy_nonoverlapping(text.as_ptr(), raw, text.len());
            *raw.add(text.len()) = 0;
        }
        raw as *mut c_char
    }

    /// Compile the text up to the first `;`.
    fn compile(&self, sql: &str) -> Prepared<MockStmt> {
        let (head, tail) = match sql.find(';') {
            Some(end) => (&sql[..end], end + 1),
            None => (sql, sql.len()),
        };
        let head = head.trim();
        if head.is_empty() {
            return Prepared { stmt: None, tail };
        }
        self.prepared.lock().push(head.to_owned());
        let rows = std::mem::take(&mut *self.next_rows.lock());
        let stmt = Box::new(MockStmt {
            sql: head.to_owned(),
            rows,
            row_index: 0,
            current_row: None,
            binds: Vec::new(),
        });
        Prepared {
            stmt: Some(NonNull::from(Box::leak(stmt))),
            tail,
        }
    }
}

fn value_of<'a>(v: NonNull<MockValue>) -> &'a MockValue {
    unsafe { &*v.as_ptr() }
}

fn push_result(ctx: NonNull<MockContext>, result: MockResult) {
    unsafe { (*ctx.as_ptr()).results.push(result) }
}

fn raw_bytes(bytes: &[u8]) -> RawBytes {
    RawBytes {
        ptr: bytes.as_ptr(),
        len: bytes.len(),
    }
}

unsafe impl Sqlite3Api for MockEngine {
    type Db = MockDb;
    type Stmt = MockStmt;
    type Value = MockValue;
    type Context = MockContext;

    fn api_version(&self) -> ApiVersion {
        self.version
    }

    fn feature_set(&self) -> FeatureSet {
        self.features
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return std::ptr::null_mut();
        }
        let layout = match Layout::from_size_align(size.max(1), 16) {
            Ok(layout) => layout,
            Err(_) => return std::ptr::null_mut(),
        };
        let ptr = unsafe { std::alloc::alloc(layout) };
        if !ptr.is_null() {
            self.allocations.lock().insert(ptr as usize, layout);
        }
        ptr as *mut c_void
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        let layout = self.allocations.lock().remove(&(ptr as usize));
        let layout = layout.unwrap_or_else(|| panic!("free of unknown block {:p}", ptr));
        unsafe { std::alloc::dealloc(ptr as *mut u8, layout) }
    }

    unsafe fn open(&self, _filename: &str, _options: OpenOptions<'_>) -> Result<NonNull<MockDb>> {
        Ok(NonNull::from(Box::leak(Box::<MockDb>::default())))
    }

    unsafe fn close(&self, db: NonNull<MockDb>) -> Result<()> {
        drop(unsafe { Box::from_raw(db.as_ptr()) });
        Ok(())
    }

    unsafe fn prepare_v2(&self, _db: NonNull<MockDb>, sql: &str) -> Result<Prepared<MockStmt>> {
        self.prepare_v2_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.compile(sql))
    }

    unsafe fn prepare_v3(
        &self,
        _db: NonNull<MockDb>,
        sql: &str,
        _flags: u32,
    ) -> Result<Prepared<MockStmt>> {
        self.prepare_v3_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.compile(sql))
    }

    unsafe fn step(&self, stmt: NonNull<MockStmt>) -> Result<StepResult> {
        let stmt = unsafe { &mut *stmt.as_ptr() };
        if stmt.row_index < stmt.rows.len() {
            stmt.current_row = Some(stmt.row_index);
            stmt.row_index += 1;
            return Ok(StepResult::Row);
        }
        stmt.current_row = None;
        Ok(StepResult::Done)
    }

    unsafe fn reset(&self, stmt: NonNull<MockStmt>) -> Result<()> {
        let stmt = unsafe { &mut *stmt.as_ptr() };
        stmt.row_index = 0;
        stmt.current_row = None;
        Ok(())
    }

    unsafe fn finalize(&self, stmt: NonNull<MockStmt>) -> Result<()> {
        drop(unsafe { Box::from_raw(stmt.as_ptr()) });
        Ok(())
    }

    unsafe fn bind_null(&self, stmt: NonNull<MockStmt>, idx: i32) -> Result<()> {
        unsafe { (*stmt.as_ptr()).binds.push((idx, MockValue::Null)) };
        Ok(())
    }

    unsafe fn bind_int64(&self, stmt: NonNull<MockStmt>, idx: i32, v: i64) -> Result<()> {
        unsafe { (*stmt.as_ptr()).binds.push((idx, MockValue::Integer(v))) };
        Ok(())
    }

    unsafe fn bind_double(&self, stmt: NonNull<MockStmt>, idx: i32, v: f64) -> Result<()> {
        unsafe { (*stmt.as_ptr()).binds.push((idx, MockValue::Float(v))) };
        Ok(())
    }

    unsafe fn bind_text(&self, stmt: NonNull<MockStmt>, idx: i32, v: &str) -> Result<()> {
        unsafe { (*stmt.as_ptr()).binds.push((idx, MockValue::Text(v.to_owned()))) };
        Ok(())
    }

    unsafe fn bind_blob(&self, stmt: NonNull<MockStmt>, idx: i32, v: &[u8]) -> Result<()> {
        unsafe { (*stmt.as_ptr()).binds.push((idx, MockValue::Blob(v.to_vec()))) };
        Ok(())
    }

    unsafe fn column_count(&self, stmt: NonNull<MockStmt>) -> i32 {
        let stmt = unsafe { &*stmt.as_ptr() };
        stmt.rows.first().map_or(0, |row| row.len() as i32)
    }

    unsafe fn column_type(&self, stmt: NonNull<MockStmt>, col: i32) -> ValueType {
        match unsafe { (*stmt.as_ptr()).current_value(col) } {
            Some(MockValue::Null) | None => ValueType::Null,
            Some(MockValue::Integer(_)) => ValueType::Integer,
            Some(MockValue::Float(_)) => ValueType::Float,
            Some(MockValue::Text(_)) => ValueType::Text,
            Some(MockValue::Blob(_)) => ValueType::Blob,
        }
    }

    unsafe fn column_int64(&self, stmt: NonNull<MockStmt>, col: i32) -> i64 {
        match unsafe { (*stmt.as_ptr()).current_value(col) } {
            Some(MockValue::Integer(v)) => *v,
            _ => 0,
        }
    }

    unsafe fn column_double(&self, stmt: NonNull<MockStmt>, col: i32) -> f64 {
        match unsafe { (*stmt.as_ptr()).current_value(col) } {
            Some(MockValue::Float(v)) => *v,
            _ => 0.0,
        }
    }

    unsafe fn column_text(&self, stmt: NonNull<MockStmt>, col: i32) -> RawBytes {
        match unsafe { (*stmt.as_ptr()).current_value(col) } {
            Some(MockValue::Text(v)) => raw_bytes(v.as_bytes()),
            _ => RawBytes::empty(),
        }
    }

    unsafe fn column_blob(&self, stmt: NonNull<MockStmt>, col: i32) -> RawBytes {
        match unsafe { (*stmt.as_ptr()).current_value(col) } {
            Some(MockValue::Blob(v)) => raw_bytes(v),
            _ => RawBytes::empty(),
        }
    }

    unsafe fn errcode(&self, _db: NonNull<MockDb>) -> i32 {
        0
    }

    unsafe fn errmsg(&self, _db: NonNull<MockDb>) -> *const c_char {
        std::ptr::null()
    }

    unsafe fn extended_errcode(&self, _db: NonNull<MockDb>) -> Option<i32> {
        None
    }

    unsafe fn result_null(&self, ctx: NonNull<MockContext>) {
        push_result(ctx, MockResult::Null)
    }

    unsafe fn result_int64(&self, ctx: NonNull<MockContext>, v: i64) {
        push_result(ctx, MockResult::Integer(v))
    }

    unsafe fn result_double(&self, ctx: NonNull<MockContext>, v: f64) {
        push_result(ctx, MockResult::Float(v))
    }

    unsafe fn result_text(&self, ctx: NonNull<MockContext>, v: &str) {
        push_result(ctx, MockResult::Text(v.to_owned()))
    }

    unsafe fn result_blob(&self, ctx: NonNull<MockContext>, v: &[u8]) {
        push_result(ctx, MockResult::Blob(v.to_vec()))
    }

    unsafe fn result_error(&self, ctx: NonNull<MockContext>, msg: &str) {
        push_result(ctx, MockResult::Error(msg.to_owned()))
    }

    unsafe fn result_error_code(&self, ctx: NonNull<MockContext>, code: i32) {
        push_result(ctx, MockResult::ErrorCode(code))
    }

    unsafe fn value_type(&self, v: NonNull<MockValue>) -> ValueType {
        match value_of(v) {
            MockValue::Null => ValueType::Null,
            MockValue::Integer(_) => ValueType::Integer,
            MockValue::Float(_) => ValueType::Float,
            MockValue::Text(_) => ValueType::Text,
            MockValue::Blob(_) => ValueType::Blob,
        }
    }

    unsafe fn value_int64(&self, v: NonNull<MockValue>) -> i64 {
        match value_of(v) {
            MockValue::Integer(i) => *i,
            MockValue::Float(f) => *f as i64,
            MockValue::Text(t) => t.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    unsafe fn value_double(&self, v: NonNull<MockValue>) -> f64 {
        match value_of(v) {
            MockValue::Integer(i) => *i as f64,
            MockValue::Float(f) => *f,
            MockValue::Text(t) => t.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    unsafe fn value_text(&self, v: NonNull<MockValue>) -> RawBytes {
        match value_of(v) {
            MockValue::Text(t) => raw_bytes(t.as_bytes()),
            MockValue::Blob(b) => raw_bytes(b),
            _ => RawBytes::empty(),
        }
    }

    unsafe fn value_blob(&self, v: NonNull<MockValue>) -> RawBytes {
        unsafe { self.value_text(v) }
    }

    unsafe fn vtab_collation(
        &self,
        _info: NonNull<sqlite3_index_info>,
        constraint: usize,
    ) -> Option<String> {
        let collations = self.collations.lock();
        Some(
            collations
                .get(&constraint)
                .cloned()
                .unwrap_or_else(|| "BINARY".to_owned()),
        )
    }

    unsafe fn declare_vtab(&self, db: NonNull<MockDb>, schema: &str) -> Result<()> {
        let db = unsafe { &*db.as_ptr() };
        if db.reject_declare.load(Ordering::SeqCst) {
            return Err(Error::with_message(
                ErrorCode::Error,
                format!("malformed schema: {}", schema),
            ));
        }
        db.declared.lock().push(schema.to_owned());
        Ok(())
    }

    unsafe fn create_module_v2(
        &self,
        db: NonNull<MockDb>,
        name: &str,
        _module: *const sqlite3_module<Self>,
        user_data: *mut c_void,
        drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        self.create_module_calls.fetch_add(1, Ordering::SeqCst);
        unsafe { &*db.as_ptr() }.modules.lock().push(RegisteredModule {
            name: name.to_owned(),
            user_data,
            drop_user_data,
        });
        Ok(())
    }
}
