use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use log::{error, warn};
use parking_lot::Mutex;

use crate::channel::{inactive_channel, Channel};
use crate::context::HandlerContext;
use crate::error::Error;
use crate::future::Future;
use crate::handler::{Handler, Message};
use crate::params::{ParamKey, ParamValue};

/// Reserved name of the head sentinel context.
pub const HEAD_CONTEXT_NAME: &str = "DEFAULT_HEAD_HANDLER_CONTEXT";
/// Reserved name of the tail sentinel context.
pub const TAIL_CONTEXT_NAME: &str = "DEFAULT_TAIL_HANDLER_CONTEXT";

/// Doubly-linked chain of handler contexts between two permanent sentinels.
///
/// The head sentinel terminates outbound operations by handing them to the
/// channel's serializer; the tail sentinel terminates inbound events and
/// reports unhandled reads. User contexts live between the two and cannot
/// displace them.
///
/// Structural mutation (`add_last`, `remove_*`) is meant to happen during
/// pipeline setup — before `fire_registered` — or from within a handler
/// callback; the chain is not designed for mutation concurrent with event
/// propagation.
pub struct Pipeline {
    head: HandlerContext,
    tail: HandlerContext,
    channel: Weak<dyn Channel>,
    mutation: Mutex<()>,
}

impl Pipeline {
    pub(crate) fn new(channel: Weak<dyn Channel>) -> Arc<Self> {
        let head = HandlerContext::new(HEAD_CONTEXT_NAME, channel.clone(), Arc::new(HeadHandler));
        let tail = HandlerContext::new(TAIL_CONTEXT_NAME, channel.clone(), Arc::new(TailHandler));
        head.set_next(Some(tail.clone()));
        tail.set_prev(Some(&head));
        Arc::new(Self {
            head,
            tail,
            channel,
            mutation: Mutex::new(()),
        })
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.upgrade()
    }

    /// Splices a new context just before the tail sentinel, then calls the
    /// handler's `added`. The sentinel names are reserved.
    pub fn add_last(&self, name: &str, handler: Arc<dyn Handler>) -> &Self {
        if name == HEAD_CONTEXT_NAME || name == TAIL_CONTEXT_NAME {
            warn!("handler name {} is reserved", name);
            return self;
        }

        let ctx = {
            let _guard = self.mutation.lock();
            let Some(prev) = self.tail.prev() else {
                warn!("pipeline is cleared, dropping handler {}", name);
                return self;
            };
            let ctx = HandlerContext::new(name, self.channel.clone(), handler);
            ctx.set_next(Some(self.tail.clone()));
            ctx.set_prev(Some(&prev));
            self.tail.set_prev(Some(&ctx));
            prev.set_next(Some(ctx.clone()));
            ctx
        };
        ctx.handler().clone().added(&ctx);
        self
    }

    /// Unlinks the first user context, if any, and calls its handler's
    /// `removed`.
    pub fn remove_first(&self) -> &Self {
        let removed = {
            let _guard = self.mutation.lock();
            match self.head.next() {
                Some(first) if !first.same_node(&self.tail) => {
                    unlink(&first);
                    Some(first)
                }
                _ => None,
            }
        };
        if let Some(ctx) = removed {
            ctx.handler().clone().removed(&ctx);
        }
        self
    }

    /// Unlinks the first user context named `name`. The sentinel names are
    /// protected.
    pub fn remove_by_name(&self, name: &str) -> &Self {
        if name == HEAD_CONTEXT_NAME || name == TAIL_CONTEXT_NAME {
            return self;
        }

        let removed = {
            let _guard = self.mutation.lock();
            let mut cursor = self.head.next();
            let mut found = None;
            while let Some(ctx) = cursor {
                if ctx.same_node(&self.tail) {
                    break;
                }
                if ctx.name() == name {
                    unlink(&ctx);
                    found = Some(ctx);
                    break;
                }
                cursor = ctx.next();
            }
            found
        };
        if let Some(ctx) = removed {
            ctx.handler().clone().removed(&ctx);
        }
        self
    }

    /// Unlinks the given context. Identity-based counterpart of removal by
    /// name; the sentinels cannot be removed.
    pub fn remove_context(&self, target: &HandlerContext) -> &Self {
        if target.same_node(&self.head) || target.same_node(&self.tail) {
            return self;
        }

        let removed = {
            let _guard = self.mutation.lock();
            let mut cursor = self.head.next();
            let mut found = None;
            while let Some(ctx) = cursor {
                if ctx.same_node(&self.tail) {
                    break;
                }
                if ctx.same_node(target) {
                    unlink(&ctx);
                    found = Some(ctx);
                    break;
                }
                cursor = ctx.next();
            }
            found
        };
        if let Some(ctx) = removed {
            ctx.handler().clone().removed(&ctx);
        }
        self
    }

    /// Detaches the whole chain from both sentinels.
    pub fn clear(&self) -> &Self {
        let _guard = self.mutation.lock();
        self.head.set_next(None);
        self.tail.set_prev(None);
        self
    }

    /// Looks up a parameter on the owning channel's bag.
    pub fn param(&self, key: ParamKey) -> Option<ParamValue> {
        self.channel().and_then(|channel| channel.params().load(key))
    }

    /// Stores a parameter on the owning channel's bag.
    pub fn set_param(&self, key: ParamKey, value: ParamValue) -> &Self {
        if let Some(channel) = self.channel() {
            channel.params().store_value(key, value);
        }
        self
    }

    /// Creates a fresh future bound to this pipeline's channel.
    pub fn new_future(&self) -> Future {
        match self.channel() {
            Some(channel) => Future::bound(&channel),
            None => Future::new(),
        }
    }

    // ---- inbound entry points, invoked on the head ----

    pub fn fire_registered(&self) -> &Self {
        self.head.fire_registered();
        self
    }

    pub fn fire_unregistered(&self) -> &Self {
        self.head.fire_unregistered();
        self
    }

    pub fn fire_active(&self) -> &Self {
        self.head.fire_active();
        self
    }

    pub fn fire_inactive(&self) -> &Self {
        self.head.fire_inactive();
        self
    }

    pub fn fire_read(&self, msg: Message) -> &Self {
        self.head.fire_read(msg);
        self
    }

    pub fn fire_read_completed(&self) -> &Self {
        self.head.fire_read_completed();
        self
    }

    pub fn fire_error_caught(&self, err: Error) -> &Self {
        self.head.fire_error_caught(err);
        self
    }

    // ---- outbound entry points, invoked on the tail ----

    /// Requests a read pump start on the channel's serializer. Dropped
    /// silently when a pump is already running.
    pub fn read(&self) -> &Self {
        if let Some(channel) = self.channel() {
            if let Some(serializer) = channel.core().channel_unsafe() {
                serializer.read();
            }
        }
        self
    }

    pub fn write(&self, msg: Option<Message>) -> Future {
        self.tail.write(msg, Some(self.new_future()))
    }

    pub fn bind(&self, addr: Option<SocketAddr>) -> Future {
        self.tail.bind(addr, Some(self.new_future()))
    }

    pub fn connect(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Future {
        self.tail.connect(local, remote, Some(self.new_future()))
    }

    pub fn close(&self) -> Future {
        self.tail.close(Some(self.new_future()))
    }

    pub fn disconnect(&self) -> Future {
        self.tail.disconnect(Some(self.new_future()))
    }

    /// Deregistration walks forward from the head; the tail terminates it.
    pub fn deregister(&self) -> Future {
        self.head.deregister(Some(self.new_future()))
    }
}

fn unlink(ctx: &HandlerContext) {
    let prev = ctx.prev();
    let next = ctx.next();
    if let (Some(prev), Some(next)) = (&prev, &next) {
        prev.set_next(Some(next.clone()));
        next.set_prev(Some(prev));
    }
    ctx.set_next(None);
    ctx.set_prev(None);
}

/// Sentinel terminating outbound operations: every op is handed to the
/// channel's serializer, which owns ordering, failure handling and future
/// completion. Errors that travel all the way back inbound end here, logged.
struct HeadHandler;

impl HeadHandler {
    fn with_serializer(
        ctx: &HandlerContext,
        future: &Future,
        f: impl FnOnce(&crate::unsafe_internal::ChannelUnsafe),
    ) {
        match ctx.channel() {
            Some(channel) => match channel.core().channel_unsafe() {
                Some(serializer) => f(serializer),
                None => {
                    warn!("channel {} has no serializer installed", channel.core().id());
                    future.cancel();
                }
            },
            None => future.cancel(),
        }
    }
}

impl Handler for HeadHandler {
    fn write(&self, ctx: &HandlerContext, msg: Option<Message>, future: Future) {
        Self::with_serializer(ctx, &future, |s| s.write(msg, future.clone()));
    }

    fn bind(&self, ctx: &HandlerContext, addr: Option<SocketAddr>, future: Future) {
        Self::with_serializer(ctx, &future, |s| s.bind(addr, future.clone()));
    }

    fn connect(
        &self,
        ctx: &HandlerContext,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        future: Future,
    ) {
        Self::with_serializer(ctx, &future, |s| s.connect(local, remote, future.clone()));
    }

    fn close(&self, ctx: &HandlerContext, future: Future) {
        Self::with_serializer(ctx, &future, |s| s.close(future.clone()));
    }

    fn disconnect(&self, ctx: &HandlerContext, future: Future) {
        Self::with_serializer(ctx, &future, |s| s.disconnect(future.clone()));
    }

    fn error_caught(&self, ctx: &HandlerContext, err: Error) {
        error!("pipeline error reached head of {}: {}", ctx.name(), err);
    }
}

/// Sentinel terminating inbound events. An unhandled read raises
/// [`Error::UnhandledRead`] back toward the head; deregistration detaches
/// the channel without touching the transport.
struct TailHandler;

impl Handler for TailHandler {
    fn read(&self, ctx: &HandlerContext, _msg: Message) {
        ctx.fire_error_caught(Error::UnhandledRead);
    }

    fn deregister(&self, ctx: &HandlerContext, future: Future) {
        if let Some(channel) = ctx.channel() {
            inactive_channel(&channel);
        }
        future.success();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::assemble_channel;
    use crate::channel::ChannelCore;
    use crate::params::Params;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct NoopChannel {
        core: ChannelCore,
    }

    impl Channel for NoopChannel {
        fn core(&self) -> &ChannelCore {
            &self.core
        }
    }

    fn new_channel() -> Arc<dyn Channel> {
        let channel: Arc<dyn Channel> = Arc::new(NoopChannel::default());
        assemble_channel(&channel, None, &Params::new());
        channel
    }

    #[derive(Default)]
    struct Recording {
        added: AtomicUsize,
        removed: AtomicUsize,
        reads: AtomicUsize,
        errors: Mutex<Vec<String>>,
    }

    struct RecordingHandler {
        stats: Arc<Recording>,
        consume_reads: bool,
        panic_on_read: bool,
    }

    impl RecordingHandler {
        fn new(stats: Arc<Recording>) -> Self {
            Self {
                stats,
                consume_reads: true,
                panic_on_read: false,
            }
        }
    }

    impl Handler for RecordingHandler {
        fn added(&self, _ctx: &HandlerContext) {
            self.stats.added.fetch_add(1, Ordering::SeqCst);
        }

        fn removed(&self, _ctx: &HandlerContext) {
            self.stats.removed.fetch_add(1, Ordering::SeqCst);
        }

        fn read(&self, ctx: &HandlerContext, msg: Message) {
            if self.panic_on_read {
                panic!("recording handler exploded");
            }
            self.stats.reads.fetch_add(1, Ordering::SeqCst);
            if !self.consume_reads {
                ctx.fire_read(msg);
            }
        }

        fn error_caught(&self, _ctx: &HandlerContext, err: Error) {
            self.stats.errors.lock().push(err.to_string());
        }
    }

    #[test]
    fn add_last_invokes_added_and_read_flows() {
        let channel = new_channel();
        let pipeline = channel.pipeline();
        let stats = Arc::new(Recording::default());
        pipeline.add_last("REC", Arc::new(RecordingHandler::new(stats.clone())));

        assert_eq!(stats.added.load(Ordering::SeqCst), 1);

        pipeline.fire_read(Box::new(7u32));
        assert_eq!(stats.reads.load(Ordering::SeqCst), 1);
        assert!(stats.errors.lock().is_empty());
    }

    #[test]
    fn remove_invokes_removed_exactly_once() {
        let channel = new_channel();
        let pipeline = channel.pipeline();
        let stats = Arc::new(Recording::default());
        pipeline.add_last("REC", Arc::new(RecordingHandler::new(stats.clone())));

        pipeline.remove_by_name("REC");
        pipeline.remove_by_name("REC");
        assert_eq!(stats.removed.load(Ordering::SeqCst), 1);

        // With the handler gone, reads fall through to the tail.
        pipeline.fire_read(Box::new(7u32));
        assert_eq!(stats.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_first_skips_sentinels() {
        let channel = new_channel();
        let pipeline = channel.pipeline();
        let stats = Arc::new(Recording::default());

        // No user handlers: nothing to remove, sentinels untouched.
        pipeline.remove_first();

        pipeline.add_last("REC", Arc::new(RecordingHandler::new(stats.clone())));
        pipeline.remove_first();
        assert_eq!(stats.removed.load(Ordering::SeqCst), 1);

        // Sentinels still wired together: an inbound read reaches the tail
        // and bounces back as an error toward the head without panicking.
        pipeline.fire_read(Box::new(7u32));
    }

    #[test]
    fn sentinel_names_cannot_be_removed_or_taken() {
        let channel = new_channel();
        let pipeline = channel.pipeline();
        let stats = Arc::new(Recording::default());

        pipeline.remove_by_name(HEAD_CONTEXT_NAME);
        pipeline.remove_by_name(TAIL_CONTEXT_NAME);
        pipeline.add_last(HEAD_CONTEXT_NAME, Arc::new(RecordingHandler::new(stats.clone())));
        assert_eq!(stats.added.load(Ordering::SeqCst), 0);

        // Chain is intact: user handler added afterwards still sees reads.
        pipeline.add_last("REC", Arc::new(RecordingHandler::new(stats.clone())));
        pipeline.fire_read(Box::new(1u8));
        assert_eq!(stats.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unhandled_read_raises_one_error_inbound() {
        let channel = new_channel();
        let pipeline = channel.pipeline();
        let stats = Arc::new(Recording::default());
        let mut handler = RecordingHandler::new(stats.clone());
        handler.consume_reads = false;
        pipeline.add_last("REC", Arc::new(handler));

        pipeline.fire_read(Box::new(7u32));

        let errors = stats.errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0], Error::UnhandledRead.to_string());
    }

    #[test]
    fn handler_panic_routes_to_its_own_error_caught() {
        let channel = new_channel();
        let pipeline = channel.pipeline();
        let stats = Arc::new(Recording::default());
        let mut handler = RecordingHandler::new(stats.clone());
        handler.panic_on_read = true;
        pipeline.add_last("REC", Arc::new(handler));

        pipeline.fire_read(Box::new(7u32));

        let errors = stats.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("recording handler exploded"));
        drop(errors);

        // The pipeline keeps operating after the panic.
        pipeline.fire_read_completed();
    }

    #[test]
    fn write_on_never_active_channel_completes_success() {
        let channel = new_channel();
        let pipeline = channel.pipeline();

        let future = pipeline.write(Some(Box::new(1u8)));
        assert!(future.wait_timeout(std::time::Duration::from_secs(1)));
        assert!(future.is_success());

        let nil = pipeline.write(None);
        assert!(nil.wait_timeout(std::time::Duration::from_secs(1)));
        assert!(nil.is_success());
    }

    #[test]
    fn deregister_runs_inactivation_protocol() {
        let channel = new_channel();
        let pipeline = channel.pipeline();

        let future = pipeline.deregister();
        assert!(future.wait_timeout(std::time::Duration::from_secs(1)));
        assert!(future.is_success());
        assert!(channel.close_future().is_done());
        assert!(!channel.is_active());
    }
}
