//! TCP transport adapter for the `strand` framework.
//!
//! [`TcpChannel`] is the stream channel used both for outbound connects and
//! for connections accepted by a [`TcpServerChannel`]. The read pump fires
//! [`bytes::BytesMut`] payloads into the pipeline; writes accept `BytesMut`,
//! `Bytes` and `Vec<u8>` payloads.
//!
//! ```ignore
//! let mut bootstrap = ServerBootstrap::new();
//! bootstrap
//!     .channel::<TcpServerChannel>()
//!     .child_handler(Arc::new(Echo));
//! let bound = bootstrap.bind(Some("127.0.0.1:0".parse()?));
//! let server = bound.wait().channel().unwrap();
//! println!("listening on {:?}", server.local_addr());
//! ```

#![warn(rust_2018_idioms)]

pub(crate) mod channel;
pub(crate) mod server;

pub use channel::TcpChannel;
pub use server::TcpServerChannel;
