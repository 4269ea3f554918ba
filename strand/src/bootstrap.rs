use std::net::SocketAddr;
use std::sync::Arc;

use log::warn;

use crate::channel::Channel;
use crate::future::Future;
use crate::handler::Handler;
use crate::params::{ParamKey, Params, PARAM_WRITE_QUEUE_CAPACITY};

/// Default capacity of the per-channel outbound write queue.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 64;

/// Name under which the bootstrap's root handler is installed.
pub const ROOT_HANDLER_NAME: &str = "ROOT";

/// Constructs a channel of the configured variant.
pub type ChannelFactoryFn = Box<dyn Fn() -> Arc<dyn Channel> + Send + Sync>;

/// Factory that constructs a client channel, installs its pipeline, root
/// handler and parameters, and triggers the connect.
///
/// ```ignore
/// let mut bootstrap = Bootstrap::new();
/// bootstrap
///     .channel::<TcpChannel>()
///     .handler(Arc::new(MyHandler::new()));
/// let future = bootstrap.connect(None, Some(remote));
/// let channel = future.wait().channel().unwrap();
/// ```
#[derive(Default)]
pub struct Bootstrap {
    factory: Option<ChannelFactoryFn>,
    handler: Option<Arc<dyn Handler>>,
    params: Params,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the channel variant to construct.
    pub fn channel<C: Channel + Default>(&mut self) -> &mut Self {
        self.factory = Some(Box::new(|| Arc::new(C::default()) as Arc<dyn Channel>));
        self
    }

    /// Selects the channel variant through an explicit factory, for
    /// variants without a `Default` construction.
    pub fn channel_factory(&mut self, factory: ChannelFactoryFn) -> &mut Self {
        self.factory = Some(factory);
        self
    }

    /// Installs the root handler added as `"ROOT"` on every constructed
    /// channel.
    pub fn handler(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        self.handler = Some(handler);
        self
    }

    pub fn set_param(&mut self, key: ParamKey, value: impl std::any::Any + Send + Sync) -> &mut Self {
        self.params.store(key, value);
        self
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Builds a channel and connects it. The returned future completes when
    /// the channel is active or the connect failed; its `channel()` yields
    /// the new channel.
    pub fn connect(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Future {
        let Some(factory) = &self.factory else {
            warn!("bootstrap has no channel type configured");
            return Future::cancelled();
        };
        let channel = factory();
        assemble_channel(&channel, self.handler.clone(), &self.params);
        channel.connect(local, remote)
    }
}

/// [`Bootstrap`] variant for servers: carries a child handler and child
/// params applied to every accepted child channel instead of the server
/// channel itself.
#[derive(Default)]
pub struct ServerBootstrap {
    inner: Bootstrap,
    child_handler: Option<Arc<dyn Handler>>,
    child_params: Params,
}

impl ServerBootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel<C: Channel + Default>(&mut self) -> &mut Self {
        self.inner.channel::<C>();
        self
    }

    pub fn channel_factory(&mut self, factory: ChannelFactoryFn) -> &mut Self {
        self.inner.channel_factory(factory);
        self
    }

    /// Installs the handler for the server channel itself.
    pub fn handler(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        self.inner.handler(handler);
        self
    }

    /// Installs the root handler for every accepted child channel.
    pub fn child_handler(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        self.child_handler = Some(handler);
        self
    }

    pub fn set_param(&mut self, key: ParamKey, value: impl std::any::Any + Send + Sync) -> &mut Self {
        self.inner.set_param(key, value);
        self
    }

    /// Parameter applied to every accepted child channel.
    pub fn set_child_param(
        &mut self,
        key: ParamKey,
        value: impl std::any::Any + Send + Sync,
    ) -> &mut Self {
        self.child_params.store(key, value);
        self
    }

    pub fn child_params(&self) -> &Params {
        &self.child_params
    }

    /// Builds the server channel and binds it. The returned future
    /// completes when the channel is active (accept loop running) or the
    /// bind failed.
    pub fn bind(&self, addr: Option<SocketAddr>) -> Future {
        let Some(factory) = &self.inner.factory else {
            warn!("server bootstrap has no channel type configured");
            return Future::cancelled();
        };
        let channel = factory();
        channel.core().set_child_handler(self.child_handler.clone());
        self.child_params.range(|key, value| {
            channel.core().child_params().store_value(key, value.clone());
            true
        });
        channel.core().set_local_addr(addr);
        assemble_channel(&channel, self.inner.handler.clone(), &self.inner.params);
        channel.bind(addr)
    }
}

/// The common channel assembly sequence: hooks, pipeline and serializer
/// install, parameter copy, init, root handler, close-future, registration.
pub(crate) fn assemble_channel(
    channel: &Arc<dyn Channel>,
    root: Option<Arc<dyn Handler>>,
    params: &Params,
) {
    channel.pre_init();
    let capacity = params.usize_or(PARAM_WRITE_QUEUE_CAPACITY, DEFAULT_WRITE_QUEUE_CAPACITY);
    channel.core().install(channel, capacity);
    params.range(|key, value| {
        channel.core().params().store_value(key, value.clone());
        true
    });
    channel.init();
    if let Some(handler) = root {
        channel.pipeline().add_last(ROOT_HANDLER_NAME, handler);
    }
    channel.post_init();
    channel.core().set_close_future(channel.pipeline().new_future());
    channel.pipeline().fire_registered();
}

/// Constructs a child channel accepted by `parent`: seeds its params from
/// the parent's child-params, installs a pipeline rooted at the parent's
/// child handler and links the parent. The caller fires `Registered` and
/// activates the child once it is ready to serve.
pub fn derive_child_channel(
    child: Arc<dyn Channel>,
    parent: &Arc<dyn Channel>,
) -> Arc<dyn Channel> {
    let parent_core = parent.core();
    child.core().set_parent(parent);
    child.pre_init();
    let child_params = parent_core.child_params();
    let capacity = child_params.usize_or(PARAM_WRITE_QUEUE_CAPACITY, DEFAULT_WRITE_QUEUE_CAPACITY);
    child.core().install(&child, capacity);
    child_params.range(|key, value| {
        child.core().params().store_value(key, value.clone());
        true
    });
    child.init();
    if let Some(handler) = parent_core.child_handler() {
        child.pipeline().add_last(ROOT_HANDLER_NAME, handler);
    }
    child.post_init();
    child.core().set_close_future(child.pipeline().new_future());
    child
}
