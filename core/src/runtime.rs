//! Reference-counted runtime lifecycle.
//!
//! The process carries at most one I/O runtime. Every client call core and
//! server holds a [`Runtime`] handle; the first acquire boots the tokio
//! runtime and the last drop tears it down. This replaces a hidden
//! init-once global with an ownership relation the borrow checker enforces.

use crate::error::CoreError;

use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};
use tokio::task::JoinHandle;

fn current() -> &'static Mutex<Weak<Inner>> {
    static CURRENT: OnceLock<Mutex<Weak<Inner>>> = OnceLock::new();
    CURRENT.get_or_init(|| Mutex::new(Weak::new()))
}

struct Inner {
    // Taken in drop so shutdown can run without blocking the caller.
    runtime: Option<tokio::runtime::Runtime>,
    handle: tokio::runtime::Handle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            tracing::debug!("last runtime handle dropped, shutting down i/o runtime");
            runtime.shutdown_background();
        }
    }
}

/// Shared handle to the process I/O runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// Get a handle, booting the runtime if this is the first holder.
    pub fn acquire() -> Result<Runtime, CoreError> {
        let mut current = current().lock();
        if let Some(inner) = current.upgrade() {
            return Ok(Runtime { inner });
        }
        tracing::debug!("starting i/o runtime");
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("rpc-io")
            .enable_all()
            .build()
            .map_err(CoreError::Runtime)?;
        let handle = runtime.handle().clone();
        let inner = Arc::new(Inner {
            runtime: Some(runtime),
            handle,
        });
        *current = Arc::downgrade(&inner);
        Ok(Runtime { inner })
    }

    /// Spawn a future onto the runtime.
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }
}
