use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use strand::{Bootstrap, Channel, Handler, HandlerContext, Message, ServerBootstrap};
use strand_tcp::{TcpChannel, TcpServerChannel};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn loopback() -> Option<SocketAddr> {
    Some("127.0.0.1:0".parse().unwrap())
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Forwards every inbound payload straight back out.
struct Echo;

impl Handler for Echo {
    fn read(&self, ctx: &HandlerContext, msg: Message) {
        if let Ok(data) = msg.downcast::<BytesMut>() {
            ctx.write(Some(data), None);
        }
    }
}

/// Appends every inbound byte to a shared buffer.
struct Collect {
    data: Arc<Mutex<Vec<u8>>>,
}

impl Handler for Collect {
    fn read(&self, _ctx: &HandlerContext, msg: Message) {
        if let Ok(data) = msg.downcast::<BytesMut>() {
            self.data.lock().extend_from_slice(&data);
        }
    }
}

/// Records lifecycle events in arrival order.
struct Trace {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl Handler for Trace {
    fn registered(&self, ctx: &HandlerContext) {
        self.events.lock().push("registered");
        ctx.fire_registered();
    }

    fn active(&self, ctx: &HandlerContext) {
        self.events.lock().push("active");
        ctx.fire_active();
    }

    fn inactive(&self, ctx: &HandlerContext) {
        self.events.lock().push("inactive");
        ctx.fire_inactive();
    }

    fn unregistered(&self, ctx: &HandlerContext) {
        self.events.lock().push("unregistered");
        ctx.fire_unregistered();
    }
}

fn start_echo_server() -> Arc<dyn Channel> {
    let mut bootstrap = ServerBootstrap::new();
    bootstrap
        .channel::<TcpServerChannel>()
        .child_handler(Arc::new(Echo));
    let bound = bootstrap.bind(loopback());
    assert!(bound.wait_timeout(TIMEOUT), "bind did not complete");
    assert!(bound.is_success(), "bind failed: {:?}", bound.error());
    bound.channel().expect("server channel gone")
}

fn connect_client(addr: SocketAddr, handler: Arc<dyn Handler>) -> Arc<dyn Channel> {
    let mut bootstrap = Bootstrap::new();
    bootstrap.channel::<TcpChannel>().handler(handler);
    let connected = bootstrap.connect(None, Some(addr));
    assert!(connected.wait_timeout(TIMEOUT), "connect did not complete");
    assert!(
        connected.is_success(),
        "connect failed: {:?}",
        connected.error()
    );
    connected.channel().expect("client channel gone")
}

#[test]
fn echo_round_trip() {
    init_logs();
    let server = start_echo_server();
    let addr = server.local_addr().expect("server has no local addr");

    let collected = Arc::new(Mutex::new(Vec::new()));
    let client = connect_client(
        addr,
        Arc::new(Collect {
            data: collected.clone(),
        }),
    );
    assert!(client.is_active());

    let write = client.write(Some(Box::new(Bytes::from_static(&[0x01, 0x02, 0x03]))));
    assert!(write.wait_timeout(TIMEOUT));
    assert!(write.is_success());

    assert!(
        wait_for(|| collected.lock().as_slice() == [0x01, 0x02, 0x03]),
        "echo never arrived: {:?}",
        collected.lock()
    );

    let close = client.close();
    assert!(close.wait_timeout(TIMEOUT));
    assert!(close.is_success());
    assert!(client.close_future().wait_timeout(TIMEOUT));
    assert!(server.close().wait_timeout(TIMEOUT));
}

#[test]
fn orderly_close_fires_lifecycle_in_order() {
    init_logs();
    let server = start_echo_server();
    let addr = server.local_addr().unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let client = connect_client(
        addr,
        Arc::new(Trace {
            events: events.clone(),
        }),
    );

    assert!(client.close().wait_timeout(TIMEOUT));
    assert!(client.close_future().wait_timeout(TIMEOUT));

    assert_eq!(
        *events.lock(),
        vec!["registered", "active", "inactive", "unregistered"]
    );
    assert!(server.close().wait_timeout(TIMEOUT));
}

#[test]
fn write_after_disconnect_completes_without_transport() {
    init_logs();
    let server = start_echo_server();
    let addr = server.local_addr().unwrap();
    let client = connect_client(addr, Arc::new(Echo));

    assert!(client.disconnect().wait_timeout(TIMEOUT));
    assert!(client.close_future().wait_timeout(TIMEOUT));
    assert!(!client.is_active());

    // The payload is silently dropped: success without a transport call.
    let write = client.write(Some(Box::new(Bytes::from_static(&[0xFF]))));
    assert!(write.wait_timeout(TIMEOUT));
    assert!(write.is_success());

    assert!(server.close().wait_timeout(TIMEOUT));
}

#[test]
fn nil_write_completes_success_immediately() {
    init_logs();
    let server = start_echo_server();
    let addr = server.local_addr().unwrap();
    let client = connect_client(addr, Arc::new(Echo));

    let write = client.write(None);
    assert!(write.wait_timeout(TIMEOUT));
    assert!(write.is_success());

    assert!(client.close().wait_timeout(TIMEOUT));
    assert!(server.close().wait_timeout(TIMEOUT));
}

#[test]
fn connect_without_remote_addr_cancels() {
    init_logs();
    let mut bootstrap = Bootstrap::new();
    bootstrap.channel::<TcpChannel>();
    let connected = bootstrap.connect(None, None);
    assert!(connected.wait_timeout(TIMEOUT));
    assert!(connected.is_cancelled());
}

/// Panics on the first read, collects afterwards.
struct PanicOnce {
    panicked: AtomicBool,
    data: Arc<Mutex<Vec<u8>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl Handler for PanicOnce {
    fn read(&self, _ctx: &HandlerContext, msg: Message) {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("read exploded");
        }
        if let Ok(data) = msg.downcast::<BytesMut>() {
            self.data.lock().extend_from_slice(&data);
        }
    }

    fn error_caught(&self, _ctx: &HandlerContext, err: strand::Error) {
        self.errors.lock().push(err.to_string());
    }
}

#[test]
fn handler_panic_is_isolated() {
    init_logs();
    let server = start_echo_server();
    let addr = server.local_addr().unwrap();

    let data = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let client = connect_client(
        addr,
        Arc::new(PanicOnce {
            panicked: AtomicBool::new(false),
            data: data.clone(),
            errors: errors.clone(),
        }),
    );

    // First echo blows up inside the handler...
    let first = client.write(Some(Box::new(Bytes::from_static(b"boom"))));
    assert!(first.wait_timeout(TIMEOUT));
    assert!(wait_for(|| !errors.lock().is_empty()));
    {
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("read exploded"), "got: {}", errors[0]);
    }

    // ...but the channel stays up and the next round trip succeeds.
    assert!(client.is_active());
    let second = client.write(Some(Box::new(Bytes::from_static(b"fine"))));
    assert!(second.wait_timeout(TIMEOUT));
    assert!(wait_for(|| data.lock().as_slice() == b"fine"));

    assert!(client.close().wait_timeout(TIMEOUT));
    assert!(server.close().wait_timeout(TIMEOUT));
}

/// Shared child handler recording (channel id, event) pairs.
struct ChildTracker {
    events: Arc<Mutex<Vec<(u64, &'static str)>>>,
}

impl Handler for ChildTracker {
    fn registered(&self, ctx: &HandlerContext) {
        if let Some(channel) = ctx.channel() {
            self.events.lock().push((channel.id(), "registered"));
        }
        ctx.fire_registered();
    }

    fn active(&self, ctx: &HandlerContext) {
        if let Some(channel) = ctx.channel() {
            self.events.lock().push((channel.id(), "active"));
        }
        ctx.fire_active();
    }
}

#[test]
fn accept_loop_derives_distinct_children() {
    init_logs();
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut bootstrap = ServerBootstrap::new();
    bootstrap
        .channel::<TcpServerChannel>()
        .child_handler(Arc::new(ChildTracker {
            events: events.clone(),
        }));
    let bound = bootstrap.bind(loopback());
    assert!(bound.wait_timeout(TIMEOUT));
    let server = bound.channel().unwrap();
    let addr = server.local_addr().unwrap();

    let clients: Vec<_> = (0..2)
        .map(|_| {
            thread::spawn(move || {
                let mut bootstrap = Bootstrap::new();
                bootstrap.channel::<TcpChannel>().handler(Arc::new(Echo));
                let connected = bootstrap.connect(None, Some(addr));
                assert!(connected.wait_timeout(TIMEOUT));
                assert!(connected.is_success());
                connected.channel().unwrap()
            })
        })
        .collect();
    let clients: Vec<_> = clients.into_iter().map(|c| c.join().unwrap()).collect();

    assert!(wait_for(|| events.lock().len() >= 4));

    let events = events.lock().clone();
    let mut ids: Vec<u64> = events.iter().map(|(id, _)| *id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 2, "expected two distinct children: {:?}", events);
    for id in ids {
        let per_child: Vec<&str> = events
            .iter()
            .filter(|(eid, _)| *eid == id)
            .map(|(_, ev)| *ev)
            .collect();
        assert_eq!(per_child, vec!["registered", "active"]);
    }

    for client in clients {
        assert!(client.close().wait_timeout(TIMEOUT));
    }
    assert!(server.close().wait_timeout(TIMEOUT));
}

#[test]
fn writes_reach_transport_in_enqueue_order() {
    init_logs();
    let collected = Arc::new(Mutex::new(Vec::new()));
    let mut bootstrap = ServerBootstrap::new();
    bootstrap
        .channel::<TcpServerChannel>()
        .child_handler(Arc::new(Collect {
            data: collected.clone(),
        }));
    let bound = bootstrap.bind(loopback());
    assert!(bound.wait_timeout(TIMEOUT));
    let server = bound.channel().unwrap();
    let addr = server.local_addr().unwrap();

    let client = connect_client(addr, Arc::new(Echo));
    let futures: Vec<_> = (0u8..10)
        .map(|i| client.write(Some(Box::new(vec![i]))))
        .collect();
    for future in &futures {
        assert!(future.wait_timeout(TIMEOUT));
        assert!(future.is_success());
    }

    let expected: Vec<u8> = (0u8..10).collect();
    assert!(
        wait_for(|| collected.lock().as_slice() == expected.as_slice()),
        "out of order or incomplete: {:?}",
        collected.lock()
    );

    assert!(client.close().wait_timeout(TIMEOUT));
    assert!(server.close().wait_timeout(TIMEOUT));
}

#[test]
fn read_timeout_keeps_channel_alive() {
    init_logs();
    let server = start_echo_server();
    let addr = server.local_addr().unwrap();

    let collected = Arc::new(Mutex::new(Vec::new()));
    let mut bootstrap = Bootstrap::new();
    bootstrap
        .channel::<TcpChannel>()
        .handler(Arc::new(Collect {
            data: collected.clone(),
        }))
        .set_param(strand::PARAM_READ_TIMEOUT, 50u64);
    let connected = bootstrap.connect(None, Some(addr));
    assert!(connected.wait_timeout(TIMEOUT));
    assert!(connected.is_success());
    let client = connected.channel().unwrap();

    // Several read deadlines fire with nothing inbound; none of them may
    // tear the channel down.
    thread::sleep(Duration::from_millis(300));
    assert!(client.is_active());

    let write = client.write(Some(Box::new(Bytes::from_static(b"still here"))));
    assert!(write.wait_timeout(TIMEOUT));
    assert!(wait_for(|| collected.lock().as_slice() == b"still here"));

    assert!(client.close().wait_timeout(TIMEOUT));
    assert!(server.close().wait_timeout(TIMEOUT));
}

#[test]
fn initializer_builds_pipeline() {
    init_logs();
    let server = start_echo_server();
    let addr = server.local_addr().unwrap();

    let collected = Arc::new(Mutex::new(Vec::new()));
    let data = collected.clone();
    let mut bootstrap = Bootstrap::new();
    bootstrap
        .channel::<TcpChannel>()
        .handler(Arc::new(strand::Initializer::new(move |channel| {
            channel
                .pipeline()
                .add_last("SINK", Arc::new(Collect { data }));
        })));
    let connected = bootstrap.connect(None, Some(addr));
    assert!(connected.wait_timeout(TIMEOUT));
    assert!(connected.is_success());
    let client = connected.channel().unwrap();

    let write = client.write(Some(Box::new(Bytes::from_static(b"via init"))));
    assert!(write.wait_timeout(TIMEOUT));
    assert!(wait_for(|| collected.lock().as_slice() == b"via init"));

    assert!(client.close().wait_timeout(TIMEOUT));
    assert!(server.close().wait_timeout(TIMEOUT));
}

#[test]
fn repeated_close_is_idempotent() {
    init_logs();
    let server = start_echo_server();
    let addr = server.local_addr().unwrap();
    let client = connect_client(addr, Arc::new(Echo));

    let first = client.close();
    assert!(first.wait_timeout(TIMEOUT));
    assert!(first.is_success());
    assert!(client.close_future().is_done());
    assert!(!client.is_active());

    // A later close finds the close-future done and performs nothing; its
    // future is finished off as cancelled.
    let second = client.close();
    assert!(second.wait_timeout(TIMEOUT));
    assert!(second.is_cancelled());
    assert!(client.close_future().is_done());

    assert!(server.close().wait_timeout(TIMEOUT));
}
