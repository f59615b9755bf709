use core::ffi::c_void;
use core::marker::PhantomData;
use core::ptr::NonNull;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::provider::Sqlite3Api;
use crate::vtab::ffi::{sqlite3_vtab, sqlite3_vtab_cursor};

/// Engine-visible memory block backing one handle.
///
/// # Safety
/// Implementors must be `#[repr(C)]` and valid when zero-initialized.
pub unsafe trait NativeBlock {
    /// Release engine-owned resources hanging off the block before it is freed.
    ///
    /// # Safety
    /// `block` must be a live block allocated through `api`.
    unsafe fn clear<P: Sqlite3Api>(_block: NonNull<Self>, _api: &P) {}
}

/// Table handle: the engine's `sqlite3_vtab` header plus the owning module host.
#[repr(C)]
pub struct VTabBlock {
    pub(crate) base: sqlite3_vtab,
    pub(crate) host: *const c_void,
}

unsafe impl NativeBlock for VTabBlock {
    unsafe fn clear<P: Sqlite3Api>(block: NonNull<Self>, api: &P) {
        let base = unsafe { &mut (*block.as_ptr()).base };
        if !base.z_err_msg.is_null() {
            unsafe { api.free(base.z_err_msg as *mut c_void) };
            base.z_err_msg = core::ptr::null_mut();
        }
    }
}

unsafe impl NativeBlock for sqlite3_vtab_cursor {}

/// Arena mapping native handles to the objects they stand for.
///
/// Keys are block addresses. A key is removed before its block is freed, so
/// an address reused by the allocator never resolves to a released object.
pub struct HandleRegistry<B, T> {
    entries: Mutex<HashMap<usize, Arc<T>>>,
    _block: PhantomData<fn() -> B>,
}

impl<B: NativeBlock, T> HandleRegistry<B, T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            _block: PhantomData,
        }
    }

    /// First half of registering a handle: a zeroed block from the engine
    /// allocator.
    ///
    /// The block is not resolvable until handed to [`bind`](Self::bind); a
    /// block that never gets bound goes back through [`abandon`](Self::abandon).
    pub fn allocate<P: Sqlite3Api>(&self, api: &P) -> Result<NonNull<B>> {
        let size = core::mem::size_of::<B>();
        let raw = unsafe { api.malloc(size) } as *mut B;
        let block = NonNull::new(raw).ok_or_else(Error::no_memory)?;
        unsafe { core::ptr::write_bytes(raw as *mut u8, 0, size) };
        Ok(block)
    }

    /// Map an allocated block to `obj`.
    ///
    /// On failure the block is freed and `obj` dropped.
    pub fn bind<P: Sqlite3Api>(&self, api: &P, block: NonNull<B>, obj: T) -> Result<Arc<T>> {
        let key = block.as_ptr() as usize;
        let obj = Arc::new(obj);
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            drop(entries);
            unsafe { self.abandon(api, block) };
            return Err(Error::internal(format!(
                "handle {:#x} is already registered",
                key
            )));
        }
        entries.insert(key, Arc::clone(&obj));
        Ok(obj)
    }

    /// Free a block that was never bound.
    ///
    /// # Safety
    /// `block` must come from [`allocate`](Self::allocate) on this registry
    /// and must not be reachable by the engine.
    pub unsafe fn abandon<P: Sqlite3Api>(&self, api: &P, block: NonNull<B>) {
        unsafe {
            B::clear(block, api);
            api.free(block.as_ptr() as *mut c_void);
        }
    }

    /// Look up the object behind a handle.
    pub fn resolve(&self, block: *const B) -> Result<Arc<T>> {
        if block.is_null() {
            return Err(Error::internal("null virtual table handle"));
        }
        self.entries
            .lock()
            .get(&(block as usize))
            .cloned()
            .ok_or_else(|| Error::internal(format!("unknown handle {:p}", block)))
    }

    /// Drop the mapping and free the block.
    ///
    /// Only call once the engine can no longer reference `block`.
    pub fn release<P: Sqlite3Api>(&self, api: &P, block: NonNull<B>) -> Result<Arc<T>> {
        let key = block.as_ptr() as usize;
        let obj = self
            .entries
            .lock()
            .remove(&key)
            .ok_or_else(|| Error::internal(format!("release of unknown handle {:#x}", key)))?;
        unsafe {
            B::clear(block, api);
            api.free(block.as_ptr() as *mut c_void);
        }
        Ok(obj)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: NativeBlock, T> Default for HandleRegistry<B, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{HandleRegistry, VTabBlock};
    use crate::error::ErrorCode;
    use crate::provider::ApiVersion;
    use crate::vtab::ffi::sqlite3_vtab_cursor;
    use crate::vtab::mock::MockEngine;

    #[test]
    fn allocate_bind_resolve_release() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let registry: HandleRegistry<sqlite3_vtab_cursor, String> = HandleRegistry::new();
        let block = registry.allocate(api).unwrap();
        assert!(registry.resolve(block.as_ptr()).is_err());
        let obj = registry.bind(api, block, "first".to_owned()).unwrap();
        assert_eq!(obj.as_str(), "first");
        assert!(unsafe { (*block.as_ptr()).p_vtab.is_null() });
        assert_eq!(registry.len(), 1);

        let resolved = registry.resolve(block.as_ptr()).unwrap();
        assert!(std::sync::Arc::ptr_eq(&resolved, &obj));

        registry.release(api, block).unwrap();
        assert!(registry.is_empty());
        assert_eq!(api.live_allocations(), 0);
    }

    #[test]
    fn resolve_after_release_is_internal_error() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let registry: HandleRegistry<sqlite3_vtab_cursor, u32> = HandleRegistry::new();
        let block = registry.allocate(api).unwrap();
        registry.bind(api, block, 7).unwrap();
        let stale = block.as_ptr() as usize;
        registry.release(api, block).unwrap();
        let err = registry.resolve(stale as *const sqlite3_vtab_cursor).unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
        let err = registry.release(api, block).unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
    }

    #[test]
    fn null_handle_is_internal_error() {
        let registry: HandleRegistry<VTabBlock, u32> = HandleRegistry::new();
        let err = registry.resolve(core::ptr::null()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
    }

    #[test]
    fn allocation_failure_is_no_memory() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        api.fail_allocations(true);
        let registry: HandleRegistry<VTabBlock, u32> = HandleRegistry::new();
        let err = registry.allocate(api).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoMem);
        assert!(registry.is_empty());
    }

    #[test]
    fn abandoned_block_is_freed_unbound() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let registry: HandleRegistry<VTabBlock, u32> = HandleRegistry::new();
        let block = registry.allocate(api).unwrap();
        unsafe { (*block.as_ptr()).base.z_err_msg = api.alloc_c_string("never seen") };
        unsafe { registry.abandon(api, block) };
        assert!(registry.is_empty());
        assert_eq!(api.live_allocations(), 0);
    }

    #[test]
    fn release_frees_pending_error_message() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let registry: HandleRegistry<VTabBlock, u32> = HandleRegistry::new();
        let block = registry.allocate(api).unwrap();
        registry.bind(api, block, 1).unwrap();
        unsafe { (*block.as_ptr()).base.z_err_msg = api.alloc_c_string("boom") };
        assert_eq!(api.live_allocations(), 2);
        registry.release(api, block).unwrap();
        assert_eq!(api.live_allocations(), 0);
    }
}
