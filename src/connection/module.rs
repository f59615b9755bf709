use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::provider::{FeatureSet, Sqlite3Api};
use crate::vtab::{Module, ModuleHost};

use super::Connection;

impl<'p, P: Sqlite3Api> Connection<'p, P> {
    /// Register a virtual table module under `host.name()`.
    ///
    /// The engine holds a strong reference to `host` until the module is
    /// replaced or the connection closes.
    pub fn create_module<M: Module<P>>(&self, host: &Arc<ModuleHost<P, M>>) -> Result<()> {
        if !self.api.feature_set().contains(FeatureSet::VIRTUAL_TABLES) {
            return Err(Error::feature_unavailable("virtual tables unsupported"));
        }
        let user_data = ModuleHost::into_raw(Arc::clone(host));
        unsafe {
            self.api.create_module_v2(
                self.db,
                host.name(),
                host.dispatch(),
                user_data,
                Some(ModuleHost::<P, M>::release_raw),
            )?;
        }
        host.mark_declared();
        debug!(
            target: "sqlite_vtab",
            module = host.name(),
            backend = self.api.backend_name(),
            "module registered"
        );
        Ok(())
    }
}
