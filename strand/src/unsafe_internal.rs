use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{error, warn};
use parking_lot::Mutex;

use crate::channel::{active_channel, inactive_channel, Channel};
use crate::future::Future;
use crate::handler::Message;

/// Idle timeout of the write drainer: how long it waits on an empty queue
/// before giving its slot back.
const WRITE_IDLE: Duration = Duration::from_millis(100);

struct WriteElem {
    msg: Message,
    future: Future,
}

/// Per-channel serializer between concurrent pipeline requests and the
/// single transport underneath.
///
/// Every operation kind carries one atomic in-flight flag: the first caller
/// claims it with a compare-and-swap and runs the operation on a background
/// thread; concurrent callers coalesce with the in-flight operation (their
/// futures are cancelled) and a concurrent read request is dropped silently
/// because a pump is already running.
///
/// Writes go through a bounded queue drained by at most one thread at a
/// time, which guarantees transport delivery in enqueue order.
pub(crate) struct ChannelUnsafe {
    channel: Weak<dyn Channel>,
    read_flag: AtomicBool,
    write_flag: AtomicBool,
    bind_flag: AtomicBool,
    close_flag: AtomicBool,
    connect_flag: AtomicBool,
    disconnect_flag: AtomicBool,
    write_tx: Mutex<Option<Sender<WriteElem>>>,
    write_rx: Receiver<WriteElem>,
    destroy_once: Once,
}

impl ChannelUnsafe {
    pub(crate) fn new(channel: Weak<dyn Channel>, write_queue_capacity: usize) -> Self {
        let (tx, rx) = bounded(write_queue_capacity.max(1));
        Self {
            channel,
            read_flag: AtomicBool::new(false),
            write_flag: AtomicBool::new(false),
            bind_flag: AtomicBool::new(false),
            close_flag: AtomicBool::new(false),
            connect_flag: AtomicBool::new(false),
            disconnect_flag: AtomicBool::new(false),
            write_tx: Mutex::new(Some(tx)),
            write_rx: rx,
            destroy_once: Once::new(),
        }
    }

    fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.upgrade()
    }

    fn mark(flag: &AtomicBool) -> bool {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn reset(flag: &AtomicBool) {
        flag.store(false, Ordering::Release);
    }

    /// Starts the read pump unless one is already running. The pump calls
    /// the channel's `unsafe_read`, which loops internally; a returned error
    /// drives the channel inactive.
    pub(crate) fn read(&self) {
        let Some(channel) = self.channel() else {
            return;
        };
        if channel.as_unsafe_read().is_none() || !channel.is_active() {
            return;
        }
        if !Self::mark(&self.read_flag) {
            return;
        }

        thread::spawn(move || {
            if let Some(reader) = channel.as_unsafe_read() {
                if let Err(err) = reader.unsafe_read() {
                    warn!("channel {} read pump stopped: {}", channel.id(), err);
                    inactive_channel(&channel);
                }
            }
            if let Some(serializer) = channel.core().channel_unsafe() {
                Self::reset(&serializer.read_flag);
            }
        });
    }

    /// Enqueues one write and makes sure a drainer is running.
    ///
    /// A `None` payload, or any payload on an inactive channel, completes
    /// its future successfully without touching the transport; `None` is
    /// also the sentinel the drainer relaunch uses to wake a fresh drainer
    /// for elements that raced in while the previous one was exiting.
    pub(crate) fn write(&self, msg: Option<Message>, future: Future) {
        let Some(channel) = self.channel() else {
            future.cancel();
            return;
        };

        match msg {
            Some(msg) if channel.is_active() => {
                let tx = { self.write_tx.lock().as_ref().cloned() };
                let sent = match tx {
                    // May block when the queue is full; the lock is released
                    // so teardown cannot stall behind a blocked producer.
                    Some(tx) => tx
                        .send(WriteElem {
                            msg,
                            future: future.clone(),
                        })
                        .is_ok(),
                    None => false,
                };
                if !sent {
                    future.success();
                } else if !channel.is_active() {
                    // The channel went inactive while we were enqueuing; the
                    // drainer may already be gone, so finish stragglers here.
                    self.drain_cancel();
                }
            }
            _ => future.success(),
        }

        if channel.as_unsafe_write().is_none() || !channel.is_active() {
            return;
        }
        if !Self::mark(&self.write_flag) {
            return;
        }

        thread::spawn(move || {
            let Some(serializer) = channel.core().channel_unsafe() else {
                return;
            };
            if let Some(writer) = channel.as_unsafe_write() {
                while channel.is_active() {
                    match serializer.write_rx.recv_timeout(WRITE_IDLE) {
                        Ok(elem) => match writer.unsafe_write(elem.msg) {
                            Ok(()) => elem.future.success(),
                            Err(err) => {
                                warn!("channel {} write failed: {}", channel.id(), err);
                                inactive_channel(&channel);
                                elem.future.cancel();
                            }
                        },
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
            Self::reset(&serializer.write_flag);
            if !serializer.write_rx.is_empty() && channel.is_active() {
                serializer.write(None, channel.pipeline().new_future());
            }
        });
    }

    pub(crate) fn bind(&self, addr: Option<SocketAddr>, future: Future) {
        let Some(channel) = self.channel() else {
            future.cancel();
            return;
        };
        let Some(addr) = addr else {
            future.cancel();
            return;
        };
        if channel.as_unsafe_bind().is_none()
            || channel.close_future().is_done()
            || !Self::mark(&self.bind_flag)
        {
            future.cancel();
            return;
        }

        thread::spawn(move || {
            let result = channel
                .as_unsafe_bind()
                .map(|binder| binder.unsafe_bind(addr));
            match result {
                Some(Ok(())) => {
                    active_channel(&channel);
                    if channel.as_unsafe_accept().is_some() {
                        let acceptor = channel.clone();
                        thread::spawn(move || accept_loop(acceptor));
                    }
                    future.success();
                }
                _ => {
                    if let Some(Err(err)) = result {
                        warn!("channel {} bind failed: {}", channel.id(), err);
                    }
                    inactive_channel(&channel);
                    future.cancel();
                }
            }
            if let Some(serializer) = channel.core().channel_unsafe() {
                Self::reset(&serializer.bind_flag);
            }
        });
    }

    pub(crate) fn connect(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        future: Future,
    ) {
        let Some(channel) = self.channel() else {
            future.cancel();
            return;
        };
        let Some(remote) = remote else {
            future.cancel();
            return;
        };
        if channel.as_unsafe_connect().is_none()
            || channel.close_future().is_done()
            || !Self::mark(&self.connect_flag)
        {
            future.cancel();
            return;
        }

        thread::spawn(move || {
            let result = channel
                .as_unsafe_connect()
                .map(|dialer| dialer.unsafe_connect(local, remote));
            match result {
                Some(Ok(())) => {
                    active_channel(&channel);
                    future.success();
                }
                _ => {
                    if let Some(Err(err)) = result {
                        error!("channel {} connect failed: {}", channel.id(), err);
                    }
                    inactive_channel(&channel);
                    future.cancel();
                }
            }
            if let Some(serializer) = channel.core().channel_unsafe() {
                Self::reset(&serializer.connect_flag);
            }
        });
    }

    /// Inactivates first, then closes the transport, so observers of
    /// `Inactive` are guaranteed the channel accepts no further operations.
    pub(crate) fn close(&self, future: Future) {
        let Some(channel) = self.channel() else {
            future.cancel();
            return;
        };
        if channel.as_unsafe_close().is_none()
            || channel.close_future().is_done()
            || !Self::mark(&self.close_flag)
        {
            future.cancel();
            return;
        }

        thread::spawn(move || {
            inactive_channel(&channel);
            if let Some(closer) = channel.as_unsafe_close() {
                if let Err(err) = closer.unsafe_close() {
                    error!("channel {} close failed: {}", channel.id(), err);
                }
            }
            future.success();
            if let Some(serializer) = channel.core().channel_unsafe() {
                Self::reset(&serializer.close_flag);
            }
        });
    }

    pub(crate) fn disconnect(&self, future: Future) {
        let Some(channel) = self.channel() else {
            future.cancel();
            return;
        };
        if channel.as_unsafe_disconnect().is_none()
            || channel.close_future().is_done()
            || !Self::mark(&self.disconnect_flag)
        {
            future.cancel();
            return;
        }

        thread::spawn(move || {
            inactive_channel(&channel);
            if let Some(transport) = channel.as_unsafe_disconnect() {
                if let Err(err) = transport.unsafe_disconnect() {
                    error!("channel {} disconnect failed: {}", channel.id(), err);
                }
            }
            future.success();
            if let Some(serializer) = channel.core().channel_unsafe() {
                Self::reset(&serializer.disconnect_flag);
            }
        });
    }

    /// Closes the write queue. Runs once; queued elements that no drainer
    /// will ever see are cancelled so every accepted write still reaches a
    /// terminal state.
    pub(crate) fn destroy(&self) {
        self.destroy_once.call_once(|| {
            *self.write_tx.lock() = None;
            self.drain_cancel();
        });
    }

    fn drain_cancel(&self) {
        while let Ok(elem) = self.write_rx.try_recv() {
            elem.future.cancel();
        }
    }
}

/// Accept loop for channels that also listen: each accepted child is fired
/// `Registered` and activated. Exits when the acceptor reports closure or
/// the server channel goes inactive.
fn accept_loop(channel: Arc<dyn Channel>) {
    while channel.is_active() {
        let Some(acceptor) = channel.as_unsafe_accept() else {
            return;
        };
        match acceptor.unsafe_accept() {
            Some(child) => {
                child.pipeline().fire_registered();
                active_channel(&child);
            }
            None => {
                if channel.is_active() {
                    warn!("channel {} accept loop got no child", channel.id());
                }
                return;
            }
        }
    }
}
