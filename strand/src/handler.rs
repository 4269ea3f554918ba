use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::context::HandlerContext;
use crate::error::Error;
use crate::future::Future;

/// Type-erased payload flowing through a pipeline.
///
/// Handlers downcast to the concrete types they understand and pass
/// everything else along.
pub type Message = Box<dyn Any + Send>;

/// User code reacting to inbound events and issuing outbound operations.
///
/// Every method has a default implementation that propagates the event to
/// the neighboring handler, so implementors override only what they care
/// about. Inbound events arrive head→tail; outbound operations travel
/// tail→head.
///
/// Handlers take `&self` because dispatch is reentrant on a single thread
/// (an unhandled read raises an error that travels back through the
/// handlers currently on the stack) and because one handler instance may be
/// shared by every child channel a server accepts. Keep mutable state in
/// interior-mutability types.
#[allow(unused_variables)]
pub trait Handler: Send + Sync {
    /// Called once when the handler is spliced into a pipeline.
    fn added(&self, ctx: &HandlerContext) {}

    /// Called once when the handler is unlinked from a pipeline.
    fn removed(&self, ctx: &HandlerContext) {}

    fn registered(&self, ctx: &HandlerContext) {
        ctx.fire_registered();
    }

    fn unregistered(&self, ctx: &HandlerContext) {
        ctx.fire_unregistered();
    }

    fn active(&self, ctx: &HandlerContext) {
        ctx.fire_active();
    }

    fn inactive(&self, ctx: &HandlerContext) {
        ctx.fire_inactive();
    }

    fn read(&self, ctx: &HandlerContext, msg: Message) {
        ctx.fire_read(msg);
    }

    fn read_completed(&self, ctx: &HandlerContext) {
        ctx.fire_read_completed();
    }

    /// Receives an error raised further down the pipeline, or a converted
    /// panic from this handler's own invocation.
    fn error_caught(&self, ctx: &HandlerContext, err: Error) {
        ctx.fire_error_caught(err);
    }

    fn write(&self, ctx: &HandlerContext, msg: Option<Message>, future: Future) {
        ctx.write(msg, Some(future));
    }

    fn bind(&self, ctx: &HandlerContext, addr: Option<SocketAddr>, future: Future) {
        ctx.bind(addr, Some(future));
    }

    fn connect(
        &self,
        ctx: &HandlerContext,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        future: Future,
    ) {
        ctx.connect(local, remote, Some(future));
    }

    fn close(&self, ctx: &HandlerContext, future: Future) {
        ctx.close(Some(future));
    }

    fn disconnect(&self, ctx: &HandlerContext, future: Future) {
        ctx.disconnect(Some(future));
    }

    fn deregister(&self, ctx: &HandlerContext, future: Future) {
        ctx.deregister(Some(future));
    }
}

/// Handler that assembles a pipeline when it is added.
///
/// Lets a bootstrap install a single root handler that, on `added`, builds
/// the real handler chain against the channel:
///
/// ```ignore
/// bootstrap.handler(Arc::new(Initializer::new(|channel| {
///     let pipeline = channel.pipeline();
///     pipeline.add_last("DECODER", Arc::new(Decoder::new()));
///     pipeline.add_last("APP", Arc::new(AppHandler::new()));
/// })));
/// ```
pub struct Initializer {
    init: Mutex<Option<Box<dyn FnOnce(&Arc<dyn Channel>) + Send>>>,
}

impl Initializer {
    pub fn new(init: impl FnOnce(&Arc<dyn Channel>) + Send + 'static) -> Self {
        Self {
            init: Mutex::new(Some(Box::new(init))),
        }
    }
}

impl Handler for Initializer {
    fn added(&self, ctx: &HandlerContext) {
        let init = self.init.lock().take();
        if let (Some(init), Some(channel)) = (init, ctx.channel()) {
            init(&channel);
        }
    }
}
