//! Single-shot, cancellable units of work
//!
//! A [`Call`] wraps one remote operation. It can be run exactly once, in one
//! of three ways that share the same state machine:
//!
//! - [`Call::execute`] blocks the calling thread,
//! - [`Call::execute_async`] runs on the caller's task,
//! - [`Call::enqueue`] schedules it on the [`Dispatcher`] and reports to a
//!   [`Callback`] through the configured [`Executor`].
//!
//! State moves `Idle -> Running -> {Completed, Failed, Cancelled}` (or
//! straight `Idle -> Cancelled`). A single `started` flag guards against a
//! second execution; a compare-and-swap on the state decides whether a
//! result or a concurrent cancellation wins. An enqueued call cancelled
//! after its result was settled but before the callback ran ends up
//! `Cancelled` too.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::callback::{Callback, Executor, InlineExecutor};
use crate::dispatcher::Dispatcher;
use crate::error::{ApiError, ApiResult, StateError};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque call identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    fn next() -> Self {
        Self(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Call lifecycle state
///
/// Once `Completed` or `Failed` is reached and the outcome was handed out,
/// cancelling has no further effect on the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallState {
    Idle = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl CallState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CallState::Idle,
            1 => CallState::Running,
            2 => CallState::Completed,
            3 => CallState::Failed,
            _ => CallState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Completed | CallState::Failed | CallState::Cancelled
        )
    }
}

/// What the work closure of a call gets to see
#[derive(Debug, Clone)]
pub struct CallContext {
    pub id: CallId,
    pub operation: &'static str,
    /// Fires when the call is cancelled, directly or through its service.
    pub cancellation: CancellationToken,
}

/// Shared resources every call of one service runs with
#[derive(Clone)]
pub struct CallEnv {
    pub dispatcher: Arc<Dispatcher>,
    pub executor: Arc<dyn Executor>,
    /// Parent of every call token; cancelling it cancels them all.
    pub token: CancellationToken,
    /// Kept alive for as long as any call exists.
    pub owner: Option<Arc<dyn Any + Send + Sync>>,
}

impl CallEnv {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            executor: Arc::new(InlineExecutor),
            token: CancellationToken::new(),
            owner: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_owner(mut self, owner: Arc<dyn Any + Send + Sync>) -> Self {
        self.owner = Some(owner);
        self
    }
}

impl fmt::Debug for CallEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallEnv")
            .field("dispatcher", &self.dispatcher)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

type Work<T> = Box<dyn FnOnce(CallContext) -> BoxFuture<'static, ApiResult<T>> + Send>;

/// Lifecycle flags, shared with [`CallHandle`]s
struct CallStatus {
    id: CallId,
    operation: &'static str,
    started: AtomicBool,
    state: AtomicU8,
    token: CancellationToken,
    service_token: CancellationToken,
}

impl CallStatus {
    fn state(&self) -> CallState {
        CallState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CallState, to: CallState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancelled, or asked to cancel before reaching another final state.
    fn is_cancelled(&self) -> bool {
        match self.state() {
            CallState::Cancelled => true,
            CallState::Completed | CallState::Failed => false,
            CallState::Idle | CallState::Running => self.token.is_cancelled(),
        }
    }

    fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!(call = %self.id, operation = self.operation, "cancel requested");
        }
        self.token.cancel();
        let _ = self.transition(CallState::Idle, CallState::Cancelled)
            || self.transition(CallState::Running, CallState::Cancelled);
    }

    /// Decide the fate of a finished run. `None` means cancellation won.
    fn settle<T>(&self, result: ApiResult<T>) -> Option<ApiResult<T>> {
        let target = match &result {
            Ok(_) => CallState::Completed,
            Err(ApiError::Cancelled) => {
                self.transition(CallState::Running, CallState::Cancelled);
                return None;
            }
            Err(_) => CallState::Failed,
        };
        if self.transition(CallState::Running, target) {
            Some(result)
        } else {
            None
        }
    }
}

struct CallInner<T> {
    status: Arc<CallStatus>,
    work: Mutex<Option<Work<T>>>,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<dyn Executor>,
    _owner: Option<Arc<dyn Any + Send + Sync>>,
}

/// A pending or in-flight remote operation producing `T`
pub struct Call<T> {
    inner: Arc<CallInner<T>>,
}

impl<T: Send + 'static> Call<T> {
    /// Wrap `work` into an idle call. Nothing runs until one of the
    /// execution methods is invoked.
    pub fn new<F, Fut>(operation: &'static str, env: &CallEnv, work: F) -> Self
    where
        F: FnOnce(CallContext) -> Fut + Send + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
    {
        let status = Arc::new(CallStatus {
            id: CallId::next(),
            operation,
            started: AtomicBool::new(false),
            state: AtomicU8::new(CallState::Idle as u8),
            token: env.token.child_token(),
            service_token: env.token.clone(),
        });
        let work: Work<T> = Box::new(move |ctx| Box::pin(work(ctx)));
        Self {
            inner: Arc::new(CallInner {
                status,
                work: Mutex::new(Some(work)),
                dispatcher: env.dispatcher.clone(),
                executor: env.executor.clone(),
                _owner: env.owner.clone(),
            }),
        }
    }

    /// Call that fails with `error` once executed. Used for errors that can
    /// only be detected when the work would start.
    pub fn failed(operation: &'static str, env: &CallEnv, error: ApiError) -> Self {
        Self::new(operation, env, move |_| async move { Err(error) })
    }

    pub fn id(&self) -> CallId {
        self.inner.status.id
    }

    pub fn operation(&self) -> &'static str {
        self.inner.status.operation
    }

    pub fn state(&self) -> CallState {
        self.inner.status.state()
    }

    pub fn is_executed(&self) -> bool {
        self.inner.status.started.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.status.is_cancelled()
    }

    /// Cancel the call. Safe from any thread, any number of times.
    pub fn cancel(&self) {
        self.inner.status.cancel();
    }

    /// Detached handle for cancelling or observing from elsewhere.
    pub fn handle(&self) -> CallHandle {
        CallHandle {
            status: self.inner.status.clone(),
        }
    }

    /// Run the call on the current thread and wait for the outcome.
    ///
    /// Must not be called from inside an async runtime, use
    /// [`execute_async`](Self::execute_async) there.
    pub fn execute(&self) -> ApiResult<T> {
        self.inner.dispatcher.check_blocking()?;
        let work = self.start()?;
        let inner = self.inner.clone();
        let raw = match self.inner.dispatcher.block_on(Self::drive(inner, work)) {
            Ok(raw) => raw,
            Err(e) => Err(e),
        };
        self.inner
            .status
            .settle(raw)
            .unwrap_or(Err(ApiError::Cancelled))
    }

    /// Run the call on the current task.
    pub async fn execute_async(&self) -> ApiResult<T> {
        if self.inner.dispatcher.is_shutdown() {
            return Err(StateError::Shutdown.into());
        }
        let work = self.start()?;
        let raw = Self::drive(self.inner.clone(), work).await;
        self.inner
            .status
            .settle(raw)
            .unwrap_or(Err(ApiError::Cancelled))
    }

    /// Schedule the call on the dispatcher and return immediately.
    ///
    /// `callback` receives exactly one outcome unless the call is cancelled
    /// first, in which case it is dropped without being invoked.
    pub fn enqueue<C: Callback<T>>(&self, callback: C) {
        let work = match self.start() {
            Ok(work) => work,
            Err(ApiError::Cancelled) => {
                tracing::debug!(call = %self.id(), "enqueue on cancelled call, nothing to deliver");
                return;
            }
            Err(e) => {
                Self::hand_over(&self.inner, Err(e), callback, false);
                return;
            }
        };

        let inner = self.inner.clone();
        self.inner.dispatcher.spawn(async move {
            let status = inner.status.clone();
            let permit = tokio::select! {
                biased;
                _ = status.token.cancelled() => {
                    status.transition(CallState::Running, CallState::Cancelled);
                    return;
                }
                permit = inner.dispatcher.acquire() => permit,
            };
            let raw = match permit {
                Ok(_permit) => Self::drive(inner.clone(), work).await,
                Err(e) => Err(e),
            };
            Self::deliver(&inner, raw, callback);
        });
    }

    /// Flip the started flag and take the work out.
    fn start(&self) -> ApiResult<Work<T>> {
        let status = &self.inner.status;
        if status.started.swap(true, Ordering::AcqRel) {
            return Err(StateError::AlreadyExecuted.into());
        }

        let work = self.inner.work.lock().take();
        let Some(work) = work else {
            return Err(StateError::AlreadyExecuted.into());
        };

        if status.token.is_cancelled() || !status.transition(CallState::Idle, CallState::Running) {
            status.transition(CallState::Idle, CallState::Cancelled);
            drop(work);
            if status.service_token.is_cancelled() {
                return Err(StateError::Shutdown.into());
            }
            return Err(ApiError::Cancelled);
        }

        tracing::debug!(call = %status.id, operation = status.operation, "call started");
        Ok(work)
    }

    async fn drive(inner: Arc<CallInner<T>>, work: Work<T>) -> ApiResult<T> {
        let status = &inner.status;
        let ctx = CallContext {
            id: status.id,
            operation: status.operation,
            cancellation: status.token.clone(),
        };
        let future = work(ctx);
        tokio::select! {
            biased;
            _ = status.token.cancelled() => Err(ApiError::Cancelled),
            result = future => result,
        }
    }

    fn deliver<C: Callback<T>>(inner: &Arc<CallInner<T>>, raw: ApiResult<T>, callback: C) {
        match inner.status.settle(raw) {
            Some(result) => Self::hand_over(inner, result, callback, true),
            None => {
                tracing::debug!(call = %inner.status.id, "call cancelled, result discarded");
            }
        }
    }

    /// Run the callback on the executor. With `guarded` set, a cancellation
    /// that lands between settling and the executor picking the task up
    /// still suppresses delivery.
    fn hand_over<C: Callback<T>>(
        inner: &Arc<CallInner<T>>,
        result: ApiResult<T>,
        callback: C,
        guarded: bool,
    ) {
        let status = inner.status.clone();
        inner.executor.execute(Box::new(move || {
            if guarded && status.token.is_cancelled() {
                let _ = status.transition(CallState::Completed, CallState::Cancelled)
                    || status.transition(CallState::Failed, CallState::Cancelled);
                tracing::debug!(call = %status.id, "cancelled before delivery, result discarded");
                return;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || match result {
                Ok(value) => callback.on_complete(value),
                Err(error) => callback.on_failure(error),
            }));
            if let Err(payload) = outcome {
                tracing::error!(
                    call = %status.id,
                    operation = status.operation,
                    "callback panicked: {}",
                    panic_message(&*payload)
                );
            }
        }));
    }
}

impl<T> fmt::Debug for Call<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = &self.inner.status;
        f.debug_struct("Call")
            .field("id", &status.id)
            .field("operation", &status.operation)
            .field("state", &status.state())
            .finish()
    }
}

/// Cancel-and-observe handle detached from the call's result type
#[derive(Clone)]
pub struct CallHandle {
    status: Arc<CallStatus>,
}

impl CallHandle {
    pub fn id(&self) -> CallId {
        self.status.id
    }

    pub fn state(&self) -> CallState {
        self.status.state()
    }

    pub fn is_executed(&self) -> bool {
        self.status.started.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.is_cancelled()
    }

    pub fn cancel(&self) {
        self.status.cancel();
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.status.id)
            .field("state", &self.status.state())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Task;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn env() -> CallEnv {
        CallEnv::new(Dispatcher::new().unwrap())
    }

    fn counting(env: &CallEnv, runs: Arc<AtomicUsize>, value: u32) -> Call<u32> {
        Call::new("test", env, move |_| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
    }

    #[test]
    fn test_execute_runs_once() {
        let env = env();
        let runs = Arc::new(AtomicUsize::new(0));
        let call = counting(&env, runs.clone(), 5);

        assert_eq!(call.state(), CallState::Idle);
        assert_eq!(call.execute().unwrap(), 5);
        assert_eq!(call.state(), CallState::Completed);
        assert!(call.is_executed());

        assert!(matches!(
            call.execute(),
            Err(ApiError::State(StateError::AlreadyExecuted))
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_work_marks_failed() {
        let env = env();
        let call: Call<()> = Call::failed("test", &env, ApiError::api(2005, "Directory does not exist."));
        let err = call.execute().unwrap_err();
        assert_eq!(err.api_code(), Some(2005));
        assert_eq!(call.state(), CallState::Failed);
    }

    #[test]
    fn test_cancel_before_execute_skips_work() {
        let env = env();
        let runs = Arc::new(AtomicUsize::new(0));
        let call = counting(&env, runs.clone(), 1);

        call.cancel();
        call.cancel();
        assert!(call.is_cancelled());
        assert!(matches!(call.execute(), Err(ApiError::Cancelled)));
        assert_eq!(call.state(), CallState::Cancelled);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_enqueue_delivers_exactly_once() {
        let env = env();
        let runs = Arc::new(AtomicUsize::new(0));
        let call = counting(&env, runs.clone(), 9);
        let (tx, rx) = mpsc::channel();

        call.enqueue(move |result: ApiResult<u32>| {
            tx.send(result.unwrap()).unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 9);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(call.state(), CallState::Completed);
    }

    #[test]
    fn test_enqueue_twice_reports_already_executed() {
        let env = env();
        let call = counting(&env, Arc::new(AtomicUsize::new(0)), 1);
        let (tx, rx) = mpsc::channel();

        let first = tx.clone();
        call.enqueue(move |result: ApiResult<u32>| {
            first.send(result.is_ok()).unwrap();
        });
        call.enqueue(move |result: ApiResult<u32>| {
            let rejected = matches!(result, Err(ApiError::State(StateError::AlreadyExecuted)));
            tx.send(!rejected).unwrap();
        });

        let mut outcomes = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        outcomes.sort();
        assert_eq!(outcomes, vec![false, true]);
    }

    #[test]
    fn test_cancelled_enqueue_never_calls_back() {
        let env = env();
        let runs = Arc::new(AtomicUsize::new(0));
        let call = counting(&env, runs.clone(), 1);
        let (tx, rx) = mpsc::channel::<ApiResult<u32>>();

        call.cancel();
        call.enqueue(move |result: ApiResult<u32>| {
            let _ = tx.send(result);
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_in_flight_suppresses_callback() {
        let env = env();
        let (started_tx, started_rx) = mpsc::channel();
        let call: Call<u32> = Call::new("slow", &env, move |ctx| async move {
            let _ = started_tx.send(());
            ctx.cancellation.cancelled().await;
            Ok(1)
        });
        let (tx, rx) = mpsc::channel::<ApiResult<u32>>();

        call.enqueue(move |result: ApiResult<u32>| {
            let _ = tx.send(result);
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        call.handle().cancel();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(call.state(), CallState::Cancelled);
    }

    #[test]
    fn test_cancel_between_result_and_delivery() {
        let (tasks, queue) = mpsc::channel::<Task>();
        let env = env().with_executor(Arc::new(tasks));
        let call = counting(&env, Arc::new(AtomicUsize::new(0)), 1);
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();

        call.enqueue(move |_: ApiResult<u32>| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        let task = queue.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(call.state(), CallState::Completed);
        assert!(!call.is_cancelled());

        call.cancel();
        task();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(call.state(), CallState::Cancelled);
        assert!(call.is_cancelled());
    }

    #[test]
    fn test_cancel_after_completion_keeps_outcome() {
        let env = env();
        let call = counting(&env, Arc::new(AtomicUsize::new(0)), 2);
        assert_eq!(call.execute().unwrap(), 2);

        call.cancel();
        assert_eq!(call.state(), CallState::Completed);
        assert!(!call.is_cancelled());
        assert!(!call.handle().is_cancelled());
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let env = env();
        let call = counting(&env, Arc::new(AtomicUsize::new(0)), 1);
        call.enqueue(|_: ApiResult<u32>| panic!("boom"));

        let next = counting(&env, Arc::new(AtomicUsize::new(0)), 2);
        let (tx, rx) = mpsc::channel();
        next.enqueue(move |result: ApiResult<u32>| {
            tx.send(result.unwrap()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    }

    #[test]
    fn test_service_cancellation_reports_shutdown() {
        let token = CancellationToken::new();
        let env = env().with_token(token.clone());
        let call = counting(&env, Arc::new(AtomicUsize::new(0)), 1);

        token.cancel();
        assert!(call.is_cancelled());
        assert!(matches!(
            call.execute(),
            Err(ApiError::State(StateError::Shutdown))
        ));
    }

    #[test]
    fn test_concurrent_execute_runs_once() {
        let env = env();
        let runs = Arc::new(AtomicUsize::new(0));
        let call = Arc::new(counting(&env, runs.clone(), 3));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let call = call.clone();
                std::thread::spawn(move || call.execute())
            })
            .collect();
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(ApiError::State(StateError::AlreadyExecuted))))
                .count(),
            7
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocking_execute_refused_in_runtime() {
        let env = CallEnv::new(Dispatcher::from_handle(tokio::runtime::Handle::current(), 4));
        let call = counting(&env, Arc::new(AtomicUsize::new(0)), 4);

        assert!(matches!(
            call.execute(),
            Err(ApiError::State(StateError::BlockingInAsyncContext))
        ));
        assert!(!call.is_executed());
        assert_eq!(call.execute_async().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_execute_async_observes_cancel() {
        let env = CallEnv::new(Dispatcher::from_handle(tokio::runtime::Handle::current(), 4));
        let call: Arc<Call<u32>> = Arc::new(Call::new("slow", &env, |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(0)
        }));

        let handle = call.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        assert!(matches!(call.execute_async().await, Err(ApiError::Cancelled)));
        assert_eq!(call.state(), CallState::Cancelled);
    }
}
