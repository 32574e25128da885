//! Asynchronous completion contract and callback execution contexts

use std::sync::mpsc;

use crate::error::{ApiError, ApiResult};

/// Unit of work handed to an [`Executor`]
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Completion handler for [`Call::enqueue`](crate::Call::enqueue).
///
/// Both methods consume the callback, so at most one of them can ever run.
/// Any `FnOnce(ApiResult<T>)` closure is a callback.
pub trait Callback<T>: Send + 'static {
    fn on_complete(self, value: T);
    fn on_failure(self, error: ApiError);
}

impl<T, F> Callback<T> for F
where
    F: FnOnce(ApiResult<T>) + Send + 'static,
{
    fn on_complete(self, value: T) {
        self(Ok(value))
    }

    fn on_failure(self, error: ApiError) {
        self(Err(error))
    }
}

/// Where callbacks run.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs the task on the thread that produced the result.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task()
    }
}

/// Hands tasks to a tokio runtime's blocking pool.
impl Executor for tokio::runtime::Handle {
    fn execute(&self, task: Task) {
        drop(self.spawn_blocking(task));
    }
}

/// Queues tasks for a thread that drains the receiving end, e.g. a UI loop.
/// Tasks sent after the receiver is gone are dropped.
impl Executor for mpsc::Sender<Task> {
    fn execute(&self, task: Task) {
        if self.send(task).is_err() {
            tracing::warn!("callback executor receiver dropped, discarding callback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_closure_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let cb = move |result: ApiResult<u32>| {
            assert_eq!(result.unwrap(), 7);
            seen.fetch_add(1, Ordering::SeqCst);
        };
        Callback::on_complete(cb, 7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_executor_delivers_on_receiver_thread() {
        let (tx, rx) = mpsc::channel::<Task>();
        let caller = std::thread::current().id();
        let ran_on = Arc::new(parking_lot::Mutex::new(None));
        let slot = ran_on.clone();

        let worker = std::thread::spawn(move || {
            tx.execute(Box::new(move || {
                *slot.lock() = Some(std::thread::current().id());
            }));
        });
        worker.join().unwrap();

        let task = rx.recv().unwrap();
        task();
        assert_eq!(*ran_on.lock(), Some(caller));
    }
}
