use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::warn;
use parking_lot::Mutex;

use strand::{
    Channel, ChannelCore, Error, Message, UnsafeClose, UnsafeConnect, UnsafeDisconnect,
    UnsafeRead, UnsafeWrite, PARAM_READ_BUFFER_SIZE, PARAM_READ_TIMEOUT, PARAM_WRITE_TIMEOUT,
};

const DEFAULT_READ_BUFFER_SIZE: usize = 1024;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 100;

/// TCP stream channel: dialed by a [`Bootstrap`](strand::Bootstrap) or
/// derived from an accepted connection by a
/// [`TcpServerChannel`](crate::TcpServerChannel).
///
/// The read pump loops on one background thread, firing a `BytesMut` per
/// chunk into the pipeline; a read deadline on a live connection only
/// re-checks the active flag. Writes accept `BytesMut`, `Bytes` and
/// `Vec<u8>` payloads.
pub struct TcpChannel {
    core: ChannelCore,
    conn: Mutex<Option<TcpStream>>,
    buffer_size: AtomicUsize,
    read_timeout_ms: AtomicU64,
    write_timeout_ms: AtomicU64,
}

impl Default for TcpChannel {
    fn default() -> Self {
        Self {
            core: ChannelCore::new(),
            conn: Mutex::new(None),
            buffer_size: AtomicUsize::new(DEFAULT_READ_BUFFER_SIZE),
            read_timeout_ms: AtomicU64::new(DEFAULT_READ_TIMEOUT_MS),
            write_timeout_ms: AtomicU64::new(DEFAULT_WRITE_TIMEOUT_MS),
        }
    }
}

impl TcpChannel {
    /// Wraps an accepted connection. Used by the server accept path before
    /// the child is derived into the framework.
    pub fn from_stream(stream: TcpStream) -> Self {
        let channel = Self::default();
        channel.core.set_local_addr(stream.local_addr().ok());
        channel.core.set_remote_addr(stream.peer_addr().ok());
        *channel.conn.lock() = Some(stream);
        channel
    }

    fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn write_timeout(&self) -> Option<Duration> {
        match self.write_timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn write_all(&self, stream: &TcpStream, data: &[u8]) -> Result<(), Error> {
        stream.set_write_timeout(self.write_timeout())?;
        let mut stream = stream;
        stream.write_all(data)?;
        Ok(())
    }
}

impl Channel for TcpChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn init(&self) {
        let params = self.core.params();
        self.buffer_size.store(
            params.usize_or(PARAM_READ_BUFFER_SIZE, DEFAULT_READ_BUFFER_SIZE),
            Ordering::Relaxed,
        );
        self.read_timeout_ms.store(
            params.u64_or(PARAM_READ_TIMEOUT, DEFAULT_READ_TIMEOUT_MS),
            Ordering::Relaxed,
        );
        self.write_timeout_ms.store(
            params.u64_or(PARAM_WRITE_TIMEOUT, DEFAULT_WRITE_TIMEOUT_MS),
            Ordering::Relaxed,
        );
    }

    fn as_unsafe_read(&self) -> Option<&dyn UnsafeRead> {
        Some(self)
    }

    fn as_unsafe_write(&self) -> Option<&dyn UnsafeWrite> {
        Some(self)
    }

    fn as_unsafe_connect(&self) -> Option<&dyn UnsafeConnect> {
        Some(self)
    }

    fn as_unsafe_close(&self) -> Option<&dyn UnsafeClose> {
        Some(self)
    }

    fn as_unsafe_disconnect(&self) -> Option<&dyn UnsafeDisconnect> {
        Some(self)
    }
}

impl UnsafeConnect for TcpChannel {
    fn unsafe_connect(
        &self,
        _local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<(), Error> {
        let stream = TcpStream::connect(remote)?;
        self.core.set_local_addr(stream.local_addr().ok());
        self.core.set_remote_addr(stream.peer_addr().ok());
        *self.conn.lock() = Some(stream);
        Ok(())
    }
}

impl UnsafeRead for TcpChannel {
    fn unsafe_read(&self) -> Result<(), Error> {
        let stream = {
            let guard = self.conn.lock();
            guard.as_ref().ok_or(Error::NilObject)?.try_clone()?
        };
        stream.set_read_timeout(self.read_timeout())?;

        let pipeline = self.pipeline();
        let mut buf = vec![0u8; self.buffer_size.load(Ordering::Relaxed).max(1)];
        loop {
            if !self.is_active() {
                return Ok(());
            }
            match (&stream).read(&mut buf) {
                // Remote shut the stream down; a graceful local close has
                // already flipped the active flag and is caught above.
                Ok(0) => return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into()),
                Ok(n) => {
                    pipeline.fire_read(Box::new(BytesMut::from(&buf[..n])));
                    pipeline.fire_read_completed();
                }
                // Deadline fired on a live connection: keep looping.
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl UnsafeWrite for TcpChannel {
    fn unsafe_write(&self, msg: Message) -> Result<(), Error> {
        let guard = self.conn.lock();
        let stream = guard.as_ref().ok_or(Error::NilObject)?;

        let msg = match msg.downcast::<BytesMut>() {
            Ok(data) => return self.write_all(stream, &data),
            Err(msg) => msg,
        };
        let msg = match msg.downcast::<Bytes>() {
            Ok(data) => return self.write_all(stream, &data),
            Err(msg) => msg,
        };
        match msg.downcast::<Vec<u8>>() {
            Ok(data) => self.write_all(stream, &data),
            Err(_) => {
                warn!("channel {} got unwritable payload type", self.id());
                Err(Error::UnknownObjectType)
            }
        }
    }
}

impl UnsafeClose for TcpChannel {
    fn unsafe_close(&self) -> Result<(), Error> {
        shutdown_stream(self.conn.lock().take())
    }
}

impl UnsafeDisconnect for TcpChannel {
    fn unsafe_disconnect(&self) -> Result<(), Error> {
        shutdown_stream(self.conn.lock().take())
    }
}

fn shutdown_stream(stream: Option<TcpStream>) -> Result<(), Error> {
    let Some(stream) = stream else {
        return Err(Error::NilObject);
    };
    match stream.shutdown(Shutdown::Both) {
        // The peer may already be gone; that is still a successful close.
        Err(err) if err.kind() != ErrorKind::NotConnected => Err(err.into()),
        _ => Ok(()),
    }
}
