//! # Strand - Channel/Pipeline/Handler Networking Framework
//!
//! `strand` lets applications compose network servers and clients from a
//! chain of pluggable handlers that see events as they flow inbound (reads,
//! activations, errors) and outbound (writes, binds, connects, closes),
//! with a uniform [`Future`] contract for asynchronous completion and
//! per-handler failure isolation.
//!
//! ## Core concepts
//!
//! - **[`Channel`]**: a per-connection object owning a [`Pipeline`], a
//!   [`Params`] bag, a close-future, an active flag and a serializer that
//!   turns concurrent outbound requests into ordered transport calls.
//! - **[`Pipeline`]**: a doubly-linked chain of [`HandlerContext`]s between
//!   two permanent sentinels. The head terminates outbound operations by
//!   calling the transport; the tail terminates inbound events and reports
//!   unhandled reads.
//! - **[`Handler`]**: user code reacting to inbound events and issuing
//!   outbound operations. Every method defaults to propagation, so a
//!   handler overrides only what it cares about.
//! - **[`Future`]**: the one-shot completion object every asynchronous
//!   operation returns — success or cancelled, exactly once, with
//!   listeners and blocking await.
//! - **[`Bootstrap`] / [`ServerBootstrap`]**: factories wiring a channel's
//!   pipeline, root handler and parameters, then triggering connect/bind.
//!
//! ## Event flow
//!
//! ```text
//!  Bootstrap.connect → new Channel → Pipeline installed → fire_registered →
//!  serializer connect → (on success) Active → read pump →
//!  pipeline fire_read(bytes) → handlers → tail
//!          ↑                                  ↓
//!  outbound handlers ← pipeline write/close ←─┘
//! ```
//!
//! Inbound events travel head→tail; outbound operations travel tail→head
//! and terminate at the head, which hands them to the channel's serializer.
//! A panic inside any handler method is caught, converted into
//! [`Error::HandlerPanic`] and delivered to that same handler's
//! `error_caught`; the channel itself stays up.
//!
//! ## Example: echo handler
//!
//! ```ignore
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn read(&self, ctx: &HandlerContext, msg: Message) {
//!         // Send every inbound payload straight back out.
//!         ctx.write(Some(msg), None);
//!     }
//! }
//!
//! let mut bootstrap = ServerBootstrap::new();
//! bootstrap
//!     .channel::<TcpServerChannel>()
//!     .child_handler(Arc::new(Echo));
//! bootstrap.bind(Some("127.0.0.1:8080".parse()?)).wait();
//! ```
//!
//! Transport adapters opt into capabilities by implementing any subset of
//! the `Unsafe*` traits and returning themselves from the matching
//! `as_unsafe_*` accessor on [`Channel`]; see the `strand-tcp` crate for
//! the TCP adapter.

#![warn(rust_2018_idioms)]

/// Bootstrap factories for clients and servers.
pub(crate) mod bootstrap;

/// Channel trait, core state and transport capability interfaces.
pub(crate) mod channel;

/// Pipeline node dispatch machinery.
pub(crate) mod context;

/// Error taxonomy.
pub(crate) mod error;

/// One-shot completion futures.
pub(crate) mod future;

/// Handler trait and helpers.
pub(crate) mod handler;

/// Concurrent parameter bags.
pub(crate) mod params;

/// Pipeline and its sentinel handlers.
pub(crate) mod pipeline;

/// Per-channel serializer (not part of the public API).
pub(crate) mod unsafe_internal;

pub use bootstrap::{
    derive_child_channel, Bootstrap, ChannelFactoryFn, ServerBootstrap,
    DEFAULT_WRITE_QUEUE_CAPACITY, ROOT_HANDLER_NAME,
};
pub use channel::{
    Channel, ChannelCore, UnsafeAccept, UnsafeBind, UnsafeClose, UnsafeConnect, UnsafeDisconnect,
    UnsafeRead, UnsafeWrite,
};
pub use context::HandlerContext;
pub use error::Error;
pub use future::{CancelToken, Future, FutureListener, FutureResult};
pub use handler::{Handler, Initializer, Message};
pub use params::{
    ParamKey, ParamValue, Params, PARAM_READ_BUFFER_SIZE, PARAM_READ_TIMEOUT,
    PARAM_WRITE_QUEUE_CAPACITY, PARAM_WRITE_TIMEOUT,
};
pub use pipeline::{Pipeline, HEAD_CONTEXT_NAME, TAIL_CONTEXT_NAME};
