use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{trace, warn};
use parking_lot::Mutex;

use strand::{
    derive_child_channel, Channel, ChannelCore, Error, UnsafeAccept, UnsafeBind, UnsafeClose,
};

use crate::channel::TcpChannel;

/// How often the accept loop re-checks the listener and the active flag.
/// Closing a `TcpListener` does not unblock a blocked `accept`, so the
/// listener runs non-blocking and is polled on this cadence.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// TCP server channel: binds a listener and derives a [`TcpChannel`] child
/// for every accepted connection, rooted at the server bootstrap's child
/// handler.
pub struct TcpServerChannel {
    core: ChannelCore,
    listener: Mutex<Option<TcpListener>>,
}

impl Default for TcpServerChannel {
    fn default() -> Self {
        Self {
            core: ChannelCore::new(),
            listener: Mutex::new(None),
        }
    }
}

impl Channel for TcpServerChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn as_unsafe_bind(&self) -> Option<&dyn UnsafeBind> {
        Some(self)
    }

    fn as_unsafe_accept(&self) -> Option<&dyn UnsafeAccept> {
        Some(self)
    }

    fn as_unsafe_close(&self) -> Option<&dyn UnsafeClose> {
        Some(self)
    }
}

impl UnsafeBind for TcpServerChannel {
    fn unsafe_bind(&self, addr: SocketAddr) -> Result<(), Error> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        self.core.set_local_addr(listener.local_addr().ok());
        *self.listener.lock() = Some(listener);
        Ok(())
    }
}

impl UnsafeAccept for TcpServerChannel {
    fn unsafe_accept(&self) -> Option<Arc<dyn Channel>> {
        loop {
            if !self.is_active() {
                return None;
            }
            let accepted = {
                let guard = self.listener.lock();
                guard.as_ref()?.accept()
            };
            match accepted {
                Ok((stream, peer)) => {
                    // The accepted fd may inherit the listener's
                    // non-blocking mode on some platforms.
                    if let Err(err) = stream.set_nonblocking(false) {
                        warn!("channel {} cannot unset nonblocking: {}", self.id(), err);
                        continue;
                    }
                    let parent = self.core.channel_ref()?;
                    trace!("channel {} accepted connection from {}", self.id(), peer);
                    let child: Arc<dyn Channel> = Arc::new(TcpChannel::from_stream(stream));
                    return Some(derive_child_channel(child, &parent));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    if self.is_active() {
                        warn!("channel {} accept error: {}", self.id(), err);
                    }
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }
}

impl UnsafeClose for TcpServerChannel {
    fn unsafe_close(&self) -> Result<(), Error> {
        match self.listener.lock().take() {
            Some(listener) => {
                drop(listener);
                Ok(())
            }
            None => Err(Error::NilObject),
        }
    }
}
