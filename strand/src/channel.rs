use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::warn;
use parking_lot::Mutex;

use crate::error::Error;
use crate::future::{CancelToken, Future};
use crate::handler::{Handler, Message};
use crate::params::{ParamKey, ParamValue, Params};
use crate::pipeline::Pipeline;
use crate::unsafe_internal::ChannelUnsafe;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

// ---- capability interfaces a concrete channel opts into ----

/// Inbound pump. Expected to loop internally, firing reads into the
/// pipeline, and to return only when the connection dies (`Err`) or the
/// channel went inactive (`Ok`). Deadline expiry on a live connection is
/// swallowed inside the loop.
pub trait UnsafeRead: Send + Sync {
    fn unsafe_read(&self) -> Result<(), Error>;
}

/// Transport write for one opaque payload.
pub trait UnsafeWrite: Send + Sync {
    fn unsafe_write(&self, msg: Message) -> Result<(), Error>;
}

/// Binds the transport to a local address.
pub trait UnsafeBind: Send + Sync {
    fn unsafe_bind(&self, addr: SocketAddr) -> Result<(), Error>;
}

/// Accepts the next child channel; `None` means the listener closed.
pub trait UnsafeAccept: Send + Sync {
    fn unsafe_accept(&self) -> Option<Arc<dyn Channel>>;
}

/// Dials the remote address.
pub trait UnsafeConnect: Send + Sync {
    fn unsafe_connect(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<(), Error>;
}

/// Closes the transport.
pub trait UnsafeClose: Send + Sync {
    fn unsafe_close(&self) -> Result<(), Error>;
}

/// Gracefully disconnects the transport.
pub trait UnsafeDisconnect: Send + Sync {
    fn unsafe_disconnect(&self) -> Result<(), Error>;
}

/// Per-connection object owning a pipeline, a params bag, a close-future
/// and the serializer that orders its transport calls.
///
/// Concrete channels embed a [`ChannelCore`] and opt into transport
/// capabilities by overriding the `as_unsafe_*` accessors to return
/// themselves. Everything else — the observable operations, lifecycle state
/// and parameters — is provided.
#[allow(unused_variables)]
pub trait Channel: Send + Sync + 'static {
    /// The core state shared by every channel variant.
    fn core(&self) -> &ChannelCore;

    /// Reads defaults out of the params bag. Called by the bootstrap after
    /// parameters are copied in.
    fn init(&self) {}

    /// Hook running before the pipeline is installed.
    fn pre_init(&self) {}

    /// Hook running after the root handler is installed.
    fn post_init(&self) {}

    // Capability discovery: a concrete channel returns `Some(self)` for the
    // transport operations it supports.

    fn as_unsafe_read(&self) -> Option<&dyn UnsafeRead> {
        None
    }

    fn as_unsafe_write(&self) -> Option<&dyn UnsafeWrite> {
        None
    }

    fn as_unsafe_bind(&self) -> Option<&dyn UnsafeBind> {
        None
    }

    fn as_unsafe_accept(&self) -> Option<&dyn UnsafeAccept> {
        None
    }

    fn as_unsafe_connect(&self) -> Option<&dyn UnsafeConnect> {
        None
    }

    fn as_unsafe_close(&self) -> Option<&dyn UnsafeClose> {
        None
    }

    fn as_unsafe_disconnect(&self) -> Option<&dyn UnsafeDisconnect> {
        None
    }

    // ---- observable operations ----

    fn id(&self) -> u64 {
        self.core().id()
    }

    fn pipeline(&self) -> Arc<Pipeline> {
        self.core().pipeline()
    }

    /// Completes after the inactivation protocol finished; awaiting it is
    /// the canonical way to block until the channel fully tore down.
    fn close_future(&self) -> Future {
        self.core().close_future()
    }

    fn is_active(&self) -> bool {
        self.core().is_active()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.core().local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.core().remote_addr()
    }

    /// The server channel this channel was accepted by, if any.
    fn parent(&self) -> Option<Arc<dyn Channel>> {
        self.core().parent()
    }

    fn params(&self) -> &Params {
        self.core().params()
    }

    fn param(&self, key: ParamKey) -> Option<ParamValue> {
        self.core().params().load(key)
    }

    fn set_param(&self, key: ParamKey, value: ParamValue) {
        self.core().params().store_value(key, value);
    }

    fn write(&self, msg: Option<Message>) -> Future {
        self.pipeline().write(msg)
    }

    fn read(&self) {
        self.pipeline().read();
    }

    fn bind(&self, addr: Option<SocketAddr>) -> Future {
        self.pipeline().bind(addr)
    }

    fn connect(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Future {
        self.pipeline().connect(local, remote)
    }

    fn close(&self) -> Future {
        self.pipeline().close()
    }

    fn disconnect(&self) -> Future {
        self.pipeline().disconnect()
    }

    fn deregister(&self) -> Future {
        self.pipeline().deregister()
    }
}

/// State shared by every channel variant: identity, pipeline, params,
/// close-future, active flag, serializer, cancel token and the optional
/// parent link.
pub struct ChannelCore {
    id: u64,
    self_ref: OnceLock<Weak<dyn Channel>>,
    pipeline: OnceLock<Arc<Pipeline>>,
    serializer: OnceLock<ChannelUnsafe>,
    params: Params,
    close_future: OnceLock<Future>,
    token: CancelToken,
    active: AtomicBool,
    activated: AtomicBool,
    inactivated: AtomicBool,
    parent: OnceLock<Weak<dyn Channel>>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    // Server-side only: applied to accepted children, not to this channel.
    child_handler: Mutex<Option<Arc<dyn Handler>>>,
    child_params: Params,
}

impl Default for ChannelCore {
    fn default() -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            self_ref: OnceLock::new(),
            pipeline: OnceLock::new(),
            serializer: OnceLock::new(),
            params: Params::new(),
            close_future: OnceLock::new(),
            token: CancelToken::new(),
            active: AtomicBool::new(false),
            activated: AtomicBool::new(false),
            inactivated: AtomicBool::new(false),
            parent: OnceLock::new(),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
            child_handler: Mutex::new(None),
            child_params: Params::new(),
        }
    }
}

impl ChannelCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The channel owning this core, while it is alive. Transports use this
    /// to hand themselves out as a parent for derived children.
    pub fn channel_ref(&self) -> Option<Arc<dyn Channel>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    /// Cancellation context established at bootstrap; cancelling it cancels
    /// every still-running future created through the pipeline.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock() = addr;
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    pub fn set_remote_addr(&self, addr: Option<SocketAddr>) {
        *self.remote_addr.lock() = addr;
    }

    pub fn parent(&self) -> Option<Arc<dyn Channel>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    pub(crate) fn set_parent(&self, parent: &Arc<dyn Channel>) {
        let _ = self.parent.set(Arc::downgrade(parent));
    }

    pub(crate) fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline
            .get()
            .expect("channel is not bootstrapped: pipeline missing")
            .clone()
    }

    pub(crate) fn close_future(&self) -> Future {
        self.close_future.get().cloned().unwrap_or_default()
    }

    pub(crate) fn channel_unsafe(&self) -> Option<&ChannelUnsafe> {
        self.serializer.get()
    }

    pub(crate) fn child_handler(&self) -> Option<Arc<dyn Handler>> {
        self.child_handler.lock().clone()
    }

    pub(crate) fn set_child_handler(&self, handler: Option<Arc<dyn Handler>>) {
        *self.child_handler.lock() = handler;
    }

    pub(crate) fn child_params(&self) -> &Params {
        &self.child_params
    }

    /// Wires pipeline and serializer to the owning `Arc`. Runs once, during
    /// bootstrap or child derivation.
    pub(crate) fn install(&self, channel: &Arc<dyn Channel>, write_queue_capacity: usize) {
        if self.self_ref.set(Arc::downgrade(channel)).is_err() {
            warn!("channel {} installed twice", self.id);
            return;
        }
        let _ = self.pipeline.set(Pipeline::new(Arc::downgrade(channel)));
        let _ = self
            .serializer
            .set(ChannelUnsafe::new(Arc::downgrade(channel), write_queue_capacity));
    }

    pub(crate) fn set_close_future(&self, future: Future) {
        let _ = self.close_future.set(future);
    }
}

/// Activation protocol: flips the active flag, fires `Active` through the
/// pipeline and starts the read pump. Only the first attempt takes effect.
pub(crate) fn active_channel(channel: &Arc<dyn Channel>) {
    let core = channel.core();
    if core
        .activated
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    core.active.store(true, Ordering::Release);
    core.pipeline().fire_active();
    if let Some(serializer) = core.channel_unsafe() {
        serializer.read();
    }
}

/// Inactivation protocol, in this exact order: clear the active flag, fire
/// `Inactive`, fire `Unregistered`, complete the close-future, destroy the
/// serializer. Only the first attempt takes effect.
pub(crate) fn inactive_channel(channel: &Arc<dyn Channel>) {
    let core = channel.core();
    if core
        .inactivated
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    core.active.store(false, Ordering::Release);
    let pipeline = core.pipeline();
    pipeline.fire_inactive();
    pipeline.fire_unregistered();
    if let Some(future) = core.close_future.get() {
        future.success();
    }
    if let Some(serializer) = core.channel_unsafe() {
        serializer.destroy();
    }
}
