use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::channel::Channel;
use crate::error::Error;

/// Result value carried by a completed [`Future`].
pub type FutureResult = Arc<dyn Any + Send + Sync>;

/// Callback invoked exactly once when a [`Future`] reaches a terminal state.
pub type FutureListener = Box<dyn FnOnce(&Future) + Send>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Running,
    Success,
    Cancelled,
}

struct Inner {
    state: State,
    result: Option<FutureResult>,
    err: Option<Arc<Error>>,
    listeners: Vec<FutureListener>,
}

struct Shared {
    inner: Mutex<Inner>,
    done: Condvar,
    // (channel id, channel) fixed at construction; used by the future
    // normalization check and by `channel()`.
    binding: Option<(u64, Weak<dyn Channel>)>,
}

/// One-shot completion object returned by every asynchronous operation.
///
/// A future starts running and makes exactly one terminal transition, to
/// either success or cancelled. Listeners fire exactly once, in registration
/// order, on the completing caller's thread; a listener added after
/// completion is invoked synchronously at add time. [`Future::get`] and
/// [`Future::wait`] block until the transition happens.
///
/// Handles are cheap to clone; all clones observe the same state.
#[derive(Clone)]
pub struct Future {
    shared: Arc<Shared>,
}

impl Future {
    /// Creates a running future bound to no channel.
    pub fn new() -> Self {
        Self::build(State::Running, None)
    }

    /// Creates a running future bound to `channel` and registered with the
    /// channel's cancel token.
    pub fn bound(channel: &Arc<dyn Channel>) -> Self {
        let future = Self::build(
            State::Running,
            Some((channel.core().id(), Arc::downgrade(channel))),
        );
        channel.core().cancel_token().watch(&future);
        future
    }

    /// Creates an already-successful future.
    pub fn succeeded() -> Self {
        Self::build(State::Success, None)
    }

    /// Creates an already-cancelled future.
    pub fn cancelled() -> Self {
        Self::build(State::Cancelled, None)
    }

    /// Runs `f` on a background thread, records its return value as the
    /// result and transitions to success. A panic inside `f` is recorded as
    /// the error and the future is cancelled instead.
    pub fn from_fn(f: impl FnOnce(&Future) -> Option<FutureResult> + Send + 'static) -> Self {
        let future = Self::new();
        let handle = future.clone();
        thread::spawn(move || match catch_unwind(AssertUnwindSafe(|| f(&handle))) {
            Ok(result) => handle.complete(result),
            Err(payload) => {
                handle.transition(
                    State::Cancelled,
                    Some(Arc::new(Error::HandlerPanic(panic_message(payload)))),
                );
            }
        });
        future
    }

    fn build(state: State, binding: Option<(u64, Weak<dyn Channel>)>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state,
                    result: None,
                    err: None,
                    listeners: Vec::new(),
                }),
                done: Condvar::new(),
                binding,
            }),
        }
    }

    /// Blocks until the future is done and returns its result.
    pub fn get(&self) -> Option<FutureResult> {
        let mut inner = self.shared.inner.lock();
        while inner.state == State::Running {
            self.shared.done.wait(&mut inner);
        }
        inner.result.clone()
    }

    /// Blocks until the future is done, returning `self` for chaining.
    pub fn wait(&self) -> &Self {
        self.get();
        self
    }

    /// Blocks until the future is done or `timeout` elapses. Returns whether
    /// the future is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut inner = self.shared.inner.lock();
        while inner.state == State::Running {
            if self.shared.done.wait_for(&mut inner, timeout).timed_out() {
                return inner.state != State::Running;
            }
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.shared.inner.lock().state != State::Running
    }

    pub fn is_success(&self) -> bool {
        self.shared.inner.lock().state == State::Success
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.inner.lock().state == State::Cancelled
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.shared.inner.lock().err.clone()
    }

    /// The channel this future is bound to, when created by a pipeline.
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.shared
            .binding
            .as_ref()
            .and_then(|(_, weak)| weak.upgrade())
    }

    pub(crate) fn is_bound_to(&self, channel: &Arc<dyn Channel>) -> bool {
        matches!(&self.shared.binding, Some((id, _)) if *id == channel.core().id())
    }

    /// Idempotent transition to success. The first terminal transition wins;
    /// later calls are no-ops.
    pub fn success(&self) {
        self.transition(State::Success, None);
    }

    /// Idempotent transition to cancelled.
    pub fn cancel(&self) {
        self.transition(State::Cancelled, Some(Arc::new(Error::Cancelled)));
    }

    /// Idempotent transition to cancelled, recording `err` as the cause.
    pub fn cancel_with(&self, err: Error) {
        self.transition(State::Cancelled, Some(Arc::new(err)));
    }

    /// Records `result` and transitions to success.
    pub(crate) fn complete(&self, result: Option<FutureResult>) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == State::Running {
                inner.result = result;
            }
        }
        self.transition(State::Success, None);
    }

    /// Appends a listener, or invokes it synchronously when the future is
    /// already done.
    pub fn add_listener(&self, listener: impl FnOnce(&Future) + Send + 'static) -> &Self {
        let mut inner = self.shared.inner.lock();
        if inner.state == State::Running {
            inner.listeners.push(Box::new(listener));
        } else {
            drop(inner);
            listener(self);
        }
        self
    }

    /// Appends several listeners at once.
    pub fn add_listeners(
        &self,
        listeners: impl IntoIterator<Item = FutureListener>,
    ) -> &Self {
        for listener in listeners {
            let mut inner = self.shared.inner.lock();
            if inner.state == State::Running {
                inner.listeners.push(listener);
            } else {
                drop(inner);
                listener(self);
            }
        }
        self
    }

    fn transition(&self, to: State, err: Option<Arc<Error>>) {
        let listeners = {
            let mut inner = self.shared.inner.lock();
            if inner.state != State::Running {
                return;
            }
            inner.state = to;
            if inner.err.is_none() {
                inner.err = err;
            }
            std::mem::take(&mut inner.listeners)
        };
        self.shared.done.notify_all();
        for listener in listeners {
            listener(self);
        }
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }
}

impl Default for Future {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// External cancellation signal shared by a channel and its futures.
///
/// Futures created through a channel's pipeline register themselves here;
/// cancelling the token cancels every registered future that is still
/// running. A future created after the token was cancelled is not touched —
/// the operation that carries it decides its terminal state.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    watchers: Mutex<Vec<Weak<Shared>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancels every registered, still-running future. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let watchers = std::mem::take(&mut *self.inner.watchers.lock());
        for weak in watchers {
            if let Some(shared) = weak.upgrade() {
                Future { shared }.cancel();
            }
        }
    }

    pub(crate) fn watch(&self, future: &Future) {
        if self.is_cancelled() {
            return;
        }
        self.inner.watchers.lock().push(future.downgrade());
    }
}
