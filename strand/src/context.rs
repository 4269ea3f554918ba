use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use log::error;
use parking_lot::RwLock;

use crate::channel::Channel;
use crate::error::Error;
use crate::future::{panic_message, Future};
use crate::handler::{Handler, Message};

pub(crate) struct ContextInner {
    name: String,
    channel: Weak<dyn Channel>,
    handler: Arc<dyn Handler>,
    // Forward links are strong, backward links weak: the pipeline keeps the
    // chain alive through head, and dropping head releases every node.
    next: RwLock<Option<HandlerContext>>,
    prev: RwLock<Option<Weak<ContextInner>>>,
}

/// A node in the pipeline holding a handler and its neighbor links.
///
/// Inbound events propagate to the next context, outbound operations to the
/// previous one. Every neighbor invocation runs inside a panic guard: a
/// panic raised by a handler method is converted into
/// [`Error::HandlerPanic`] and delivered to that same handler's
/// `error_caught`.
///
/// Contexts are created by [`Pipeline`](crate::pipeline::Pipeline) only;
/// handles are cheap to clone.
#[derive(Clone)]
pub struct HandlerContext {
    inner: Arc<ContextInner>,
}

impl HandlerContext {
    pub(crate) fn new(
        name: &str,
        channel: Weak<dyn Channel>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name: name.to_owned(),
                channel,
                handler,
                next: RwLock::new(None),
                prev: RwLock::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The channel this context belongs to, while it is still alive.
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.inner.channel.upgrade()
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler> {
        &self.inner.handler
    }

    pub(crate) fn next(&self) -> Option<HandlerContext> {
        self.inner.next.read().clone()
    }

    pub(crate) fn prev(&self) -> Option<HandlerContext> {
        self.inner
            .prev
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| HandlerContext { inner })
    }

    pub(crate) fn set_next(&self, next: Option<HandlerContext>) {
        *self.inner.next.write() = next;
    }

    pub(crate) fn set_prev(&self, prev: Option<&HandlerContext>) {
        *self.inner.prev.write() = prev.map(|ctx| Arc::downgrade(&ctx.inner));
    }

    pub(crate) fn same_node(&self, other: &HandlerContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- inbound propagation, next → next ----

    pub fn fire_registered(&self) {
        if let Some(next) = self.next() {
            invoke(&next, |h, ctx| h.registered(ctx));
        }
    }

    pub fn fire_unregistered(&self) {
        if let Some(next) = self.next() {
            invoke(&next, |h, ctx| h.unregistered(ctx));
        }
    }

    pub fn fire_active(&self) {
        if let Some(next) = self.next() {
            invoke(&next, |h, ctx| h.active(ctx));
        }
    }

    pub fn fire_inactive(&self) {
        if let Some(next) = self.next() {
            invoke(&next, |h, ctx| h.inactive(ctx));
        }
    }

    pub fn fire_read(&self, msg: Message) {
        if let Some(next) = self.next() {
            invoke(&next, move |h, ctx| h.read(ctx, msg));
        }
    }

    pub fn fire_read_completed(&self) {
        if let Some(next) = self.next() {
            invoke(&next, |h, ctx| h.read_completed(ctx));
        }
    }

    /// Errors travel toward head, against the inbound direction.
    pub fn fire_error_caught(&self, err: Error) {
        if let Some(prev) = self.prev() {
            invoke(&prev, move |h, ctx| h.error_caught(ctx, err));
        }
    }

    // ---- outbound propagation, prev → prev ----

    pub fn write(&self, msg: Option<Message>, future: Option<Future>) -> Future {
        let future = self.check_future(future);
        if let Some(prev) = self.prev() {
            let f = future.clone();
            invoke(&prev, move |h, ctx| h.write(ctx, msg, f));
        }
        future
    }

    pub fn bind(&self, addr: Option<SocketAddr>, future: Option<Future>) -> Future {
        let future = self.check_future(future);
        if let Some(prev) = self.prev() {
            let f = future.clone();
            invoke(&prev, move |h, ctx| h.bind(ctx, addr, f));
        }
        future
    }

    pub fn connect(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        future: Option<Future>,
    ) -> Future {
        let future = self.check_future(future);
        if let Some(prev) = self.prev() {
            let f = future.clone();
            invoke(&prev, move |h, ctx| h.connect(ctx, local, remote, f));
        }
        future
    }

    pub fn close(&self, future: Option<Future>) -> Future {
        let future = self.check_future(future);
        if let Some(prev) = self.prev() {
            let f = future.clone();
            invoke(&prev, move |h, ctx| h.close(ctx, f));
        }
        future
    }

    pub fn disconnect(&self, future: Option<Future>) -> Future {
        let future = self.check_future(future);
        if let Some(prev) = self.prev() {
            let f = future.clone();
            invoke(&prev, move |h, ctx| h.disconnect(ctx, f));
        }
        future
    }

    /// Deregistration is an inbound-style event: it walks forward and the
    /// tail sentinel terminates it.
    pub fn deregister(&self, future: Option<Future>) -> Future {
        let future = self.check_future(future);
        if let Some(next) = self.next() {
            let f = future.clone();
            invoke(&next, move |h, ctx| h.deregister(ctx, f));
        }
        future
    }

    /// Every outbound operation carries a future bound to this context's
    /// channel; an absent or foreign future is replaced with a fresh one.
    fn check_future(&self, future: Option<Future>) -> Future {
        match (future, self.channel()) {
            (Some(future), Some(channel)) if future.is_bound_to(&channel) => future,
            (Some(future), None) => future,
            (_, Some(channel)) => Future::bound(&channel),
            (None, None) => Future::new(),
        }
    }
}

/// Runs a handler method on `target` inside the panic guard. A caught panic
/// is routed to the same handler's `error_caught`; a second panic from the
/// error path is only logged.
fn invoke(target: &HandlerContext, f: impl FnOnce(&dyn Handler, &HandlerContext)) {
    let handler = target.handler().clone();
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(handler.as_ref(), target))) {
        let message = panic_message(payload);
        error!("handler {} panicked: {}", target.name(), message);
        let caught = Error::HandlerPanic(message);
        if let Err(payload) =
            catch_unwind(AssertUnwindSafe(|| handler.error_caught(target, caught)))
        {
            error!(
                "handler {} panicked in error_caught: {}",
                target.name(),
                panic_message(payload)
            );
        }
    }
}
