//! Shared worker pool for enqueued calls
//!
//! A [`Dispatcher`] is an async runtime plus a concurrency limit. It is meant
//! to be shared by every service derived from one another, which is why its
//! lifetime is tracked with explicit [`Lease`]s: each service holds one, and
//! the owned runtime is torn down when the last lease is released.
//!
//! Closing a dispatcher is global. Once [`Dispatcher::close`] ran, every
//! holder sees new work rejected with [`StateError::Shutdown`].

use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder as RuntimeBuilder, Handle, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, ApiResult, StateError};

/// Default number of calls allowed to run concurrently.
pub const DEFAULT_MAX_REQUESTS: usize = 64;

/// Bounded executor for asynchronous calls
pub struct Dispatcher {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    permits: Arc<Semaphore>,
    max_requests: usize,
    closed: CancellationToken,
    leases: AtomicUsize,
}

impl Dispatcher {
    /// Dispatcher with its own multi-threaded runtime.
    pub fn new() -> io::Result<Arc<Self>> {
        Self::with_max_requests(DEFAULT_MAX_REQUESTS)
    }

    pub fn with_max_requests(max_requests: usize) -> io::Result<Arc<Self>> {
        let runtime = RuntimeBuilder::new_multi_thread()
            .enable_all()
            .thread_name("cirrus-dispatcher")
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Arc::new(Self::assemble(handle, Some(runtime), max_requests)))
    }

    /// Dispatcher running on a runtime owned by the caller.
    pub fn from_handle(handle: Handle, max_requests: usize) -> Arc<Self> {
        Arc::new(Self::assemble(handle, None, max_requests))
    }

    fn assemble(handle: Handle, runtime: Option<Runtime>, max_requests: usize) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            handle,
            runtime: Mutex::new(runtime),
            permits: Arc::new(Semaphore::new(max_requests)),
            max_requests,
            closed: CancellationToken::new(),
            leases: AtomicUsize::new(0),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Calls currently holding a concurrency permit.
    pub fn running_calls(&self) -> usize {
        self.max_requests - self.permits.available_permits()
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    /// Register a new holder.
    pub fn lease(self: &Arc<Self>) -> Lease {
        self.leases.fetch_add(1, Ordering::AcqRel);
        Lease {
            dispatcher: Some(self.clone()),
        }
    }

    /// Stop accepting work. Queued calls waiting for a permit fail with
    /// [`StateError::Shutdown`]; calls already running are left alone.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!("dispatcher closed");
        }
        self.closed.cancel();
        self.permits.close();
    }

    /// Spawn a task on the pool. The task is expected to take a permit via
    /// [`acquire`](Self::acquire) before doing real work, which is where a
    /// closed dispatcher reports itself.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        drop(self.handle.spawn(task));
    }

    /// Wait for a concurrency slot.
    pub async fn acquire(&self) -> ApiResult<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ApiError::State(StateError::Shutdown))
    }

    /// Fails if the calling thread may not block on this dispatcher.
    pub fn check_blocking(&self) -> ApiResult<()> {
        if Handle::try_current().is_ok() {
            return Err(StateError::BlockingInAsyncContext.into());
        }
        if self.is_shutdown() {
            return Err(StateError::Shutdown.into());
        }
        Ok(())
    }

    /// Drive `future` to completion on the calling thread.
    pub fn block_on<F: Future>(&self, future: F) -> ApiResult<F::Output> {
        self.check_blocking()?;
        Ok(self.handle.block_on(future))
    }

    fn release(&self) {
        let previous = self.leases.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            tracing::debug!("last dispatcher lease released, tearing down");
            self.close();
            self.teardown();
        }
    }

    fn teardown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_requests", &self.max_requests)
            .field("running", &self.running_calls())
            .field("leases", &self.lease_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// A holder's share of a [`Dispatcher`]. Released explicitly or on drop.
#[derive(Debug)]
pub struct Lease {
    dispatcher: Option<Arc<Dispatcher>>,
}

impl Lease {
    pub fn dispatcher(&self) -> Option<&Arc<Dispatcher>> {
        self.dispatcher.as_ref()
    }

    /// Give the share back. Later calls are no-ops.
    pub fn release(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.release();
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}
