//! Integration tests for nodes and routers over real TCP.
//!
//! Every endpoint binds to 127.0.0.1:0 inside the test process. Where a test
//! needs to watch raw traffic, a bare `TcpListener` plays the upstream peer
//! using the public frame codec.

use fieldmesh_types::{keys, Address, ArrayData, Message, NdArray, NodeConfig, RouterConfig, UpstreamConfig, Value};
use fieldmesh_wire::frame::{read_frame, write_frame, Frame};
use fieldmesh_wire::{Agent, Coordinator, Listens, Node, RouteTable, Router, SendOptions};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(5);

fn upstream(id: &str, addr: SocketAddr) -> Option<UpstreamConfig> {
    Some(UpstreamConfig {
        id: id.to_string(),
        addr: addr.to_string(),
    })
}

fn router_config(id: &str, parent: Option<UpstreamConfig>) -> RouterConfig {
    RouterConfig {
        id: id.to_string(),
        listen: "127.0.0.1:0".parse().unwrap(),
        parent,
        repeat_interval_ms: 100,
        heartbeat_interval_ms: 0,
        ..RouterConfig::default()
    }
}

fn node_config(id: &str, up: Option<UpstreamConfig>) -> NodeConfig {
    NodeConfig {
        id: id.to_string(),
        upstream: up,
        repeat_interval_ms: 100,
        ..NodeConfig::default()
    }
}

/// Listens that forward every value received under `key` into a channel.
fn capture(key: &str) -> (Listens, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listens = Listens::new().on(key, move |v: Value| {
        let _ = tx.send(v);
    });
    (listens, rx)
}

fn capture_route(key: &str) -> (RouteTable, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let routes = RouteTable::new().on_value(key, move |v: Value| {
        let _ = tx.send(v);
    });
    (routes, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a value")
        .expect("channel closed")
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held: {what}");
}

/// Log output captured for the current thread's subscriber.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    fn count(&self, needles: &[&str]) -> usize {
        let text = String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned();
        text.lines()
            .filter(|line| needles.iter().all(|n| line.contains(n)))
            .count()
    }
}

/// Route this thread's tracing output into a buffer. Tokio tests run on a
/// current-thread runtime, so spawned loops log through it too.
fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let logs = LogCapture::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

/// Read frames until `deadline`, returning the message id of each.
async fn drain_ids(stream: &mut tokio::net::TcpStream, deadline: Instant) -> Vec<String> {
    let mut ids = Vec::new();
    while let Ok(Ok(frame)) = tokio::time::timeout_at(deadline.into(), read_frame(stream)).await {
        let msg = Message::deserialize(frame.body, false).unwrap();
        ids.push(msg.id().to_string());
    }
    ids
}

/// Accept one dialer and return its stream after reading its identity.
async fn accept_raw(listener: &TcpListener) -> (tokio::net::TcpStream, String) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let hello = read_frame(&mut stream).await.unwrap();
    (stream, hello.as_identity().unwrap())
}

// ---------------------------------------------------------------------------
// Node ↔ node
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_node_pair_exchange_gotit() {
    let (listens_a, mut got_a) = capture("GOTIT");
    let mut config_a = node_config("a", None);
    config_a.listen = Some("127.0.0.1:0".parse().unwrap());
    let a = Node::start(config_a, listens_a).await.unwrap();

    let (listens_b, mut got_b) = capture("GOTIT");
    let b = Node::start(node_config("b", upstream("a", a.local_addr().unwrap())), listens_b)
        .await
        .unwrap();

    let sent = b.send(None, "GOTIT", "node2").unwrap();
    assert_eq!(recv(&mut got_a).await, Value::from("node2"));

    a.send(Some("b"), "GOTIT", "node1").unwrap();
    assert_eq!(recv(&mut got_b).await, Value::from("node1"));

    eventually("b's message confirmed", || !b.pending().contains(&sent)).await;
    eventually("a's message confirmed", || a.pending().is_empty()).await;
    assert_eq!(a.known_peers(), vec!["b".to_string()]);

    b.release();
    a.release();
}

#[tokio::test]
async fn test_receiver_confirms_unless_norepeat() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (listens, mut got) = capture("DATA");
    let (node, accepted) = tokio::join!(
        Node::start(node_config("rig", upstream("raw", addr)), listens),
        accept_raw(&listener)
    );
    let node = node.unwrap();
    let (mut stream, identity) = accepted;
    assert_eq!(identity, "rig");

    let quiet = Message::new("raw_0", "rig", "raw", "DATA", 1i64)
        .with_flag(fieldmesh_types::Flag::NoRepeat);
    write_frame(&mut stream, &Frame::new(quiet.serialize().unwrap())).await.unwrap();
    assert_eq!(recv(&mut got).await, Value::Int(1));
    let nothing = tokio::time::timeout(Duration::from_millis(300), read_frame(&mut stream)).await;
    assert!(nothing.is_err(), "NOREPEAT message must not be confirmed");

    let loud = Message::new("raw_1", "rig", "raw", "DATA", 2i64);
    write_frame(&mut stream, &Frame::new(loud.serialize().unwrap())).await.unwrap();
    assert_eq!(recv(&mut got).await, Value::Int(2));
    let reply = tokio::time::timeout(WAIT, read_frame(&mut stream)).await.unwrap().unwrap();
    let confirm = Message::deserialize(reply.body, true).unwrap();
    assert_eq!(confirm.key(), keys::CONFIRM);
    assert_eq!(confirm.value(), &Value::from("raw_1"));
    assert_eq!(confirm.recipient(), "raw");

    node.release();
}

#[tokio::test]
async fn test_norepeat_send_leaves_no_outbox_entry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (node, accepted) = tokio::join!(
        Node::start(node_config("rig", upstream("raw", addr)), Listens::new()),
        accept_raw(&listener)
    );
    let node = node.unwrap();
    let (mut stream, _) = accepted;

    let id = node
        .send_opts(None, "DATA", 5i64, SendOptions::no_repeat())
        .unwrap();
    let frame = tokio::time::timeout(WAIT, read_frame(&mut stream)).await.unwrap().unwrap();
    let msg = Message::deserialize(frame.body, true).unwrap();
    assert_eq!(msg.id(), id);
    assert!(msg.has_flag(fieldmesh_types::Flag::NoRepeat));
    assert!(node.pending().is_empty());

    node.release();
}

#[tokio::test]
async fn test_unconfirmed_message_retried_ttl_times_then_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = node_config("rig", upstream("raw", addr));
    config.repeat_interval_ms = 50;
    config.ttl = 2;
    let (logs, _guard) = capture_logs();
    let (node, accepted) = tokio::join!(Node::start(config, Listens::new()), accept_raw(&listener));
    let node = node.unwrap();
    let (mut stream, _) = accepted;

    let id = node.send(None, "DATA", "hello").unwrap();
    assert_eq!(node.pending(), vec![id.clone()]);

    let mut bodies = Vec::new();
    let deadline = Instant::now() + Duration::from_millis(1200);
    while let Ok(Ok(frame)) =
        tokio::time::timeout_at(deadline.into(), read_frame(&mut stream)).await
    {
        bodies.push(frame.body);
    }

    assert_eq!(bodies.len(), 3, "one send plus ttl retries");
    assert!(bodies.iter().all(|b| b == &bodies[0]), "retries resend the original bytes");
    assert!(node.pending().is_empty());
    assert_eq!(logs.count(&["Delivery failed", &id]), 1);

    node.release();
}

// ---------------------------------------------------------------------------
// Router tree
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_leaf_agent_coordinator_data_chain() {
    let (routes, mut data) = capture_route(keys::DATA);
    let mut root_config = router_config("coordinator", None);
    root_config.expand_arrays = true;
    let coordinator = Coordinator::start(root_config, routes).await.unwrap();

    let agent = Agent::start(
        router_config("rig-1", upstream("coordinator", coordinator.router().local_addr())),
        RouteTable::new(),
    )
    .await
    .unwrap();
    let leaf = Node::start(
        node_config("leaf", upstream("rig-1", agent.router().local_addr())),
        Listens::new(),
    )
    .await
    .unwrap();

    let samples = NdArray::new(vec![2, 3], ArrayData::F64(vec![0.5, 1.5, 2.5, 3.5, 4.5, 5.5])).unwrap();
    let value = Value::map([
        ("trial_num", Value::Int(12)),
        ("correct", Value::Bool(true)),
        ("lick_trace", Value::Array(samples)),
    ]);
    let id = leaf.send(Some("coordinator"), keys::DATA, value.clone()).unwrap();

    assert_eq!(recv(&mut data).await, value);
    eventually("leaf message confirmed through the agent", || {
        !leaf.pending().contains(&id)
    })
    .await;
    assert_eq!(
        coordinator.router().registry().next_hop("leaf").as_deref(),
        Some("rig-1")
    );

    leaf.release();
    agent.release();
    coordinator.release();
}

#[tokio::test]
async fn test_explicit_path_reaches_leaf() {
    let coordinator = Coordinator::start(router_config("coordinator", None), RouteTable::new())
        .await
        .unwrap();
    let agent = Agent::start(
        router_config("rig-1", upstream("coordinator", coordinator.router().local_addr())),
        RouteTable::new(),
    )
    .await
    .unwrap();

    let (listens, mut got) = capture("GOTIT");
    let leaf = Node::start(
        node_config("leaf", upstream("rig-1", agent.router().local_addr())),
        listens,
    )
    .await
    .unwrap();
    eventually("agent registered", || {
        coordinator.router().registry().is_connected("rig-1")
    })
    .await;
    eventually("leaf registered", || agent.router().registry().is_connected("leaf")).await;

    let path = Address::Path(vec!["rig-1".to_string(), "leaf".to_string()]);
    let id = coordinator
        .router()
        .send_opts(path, "GOTIT", "via path", SendOptions::default())
        .unwrap();

    assert_eq!(recv(&mut got).await, Value::from("via path"));
    eventually("path message confirmed", || {
        !coordinator.router().pending().contains(&id)
    })
    .await;

    leaf.release();
    agent.release();
    coordinator.release();
}

#[tokio::test]
async fn test_router_retries_each_channel_then_drops() {
    let parent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = router_config("rig-1", upstream("raw-parent", parent.local_addr().unwrap()));
    config.repeat_interval_ms = 50;
    config.ttl = 2;
    let (logs, _guard) = capture_logs();
    let (router, accepted) = tokio::join!(Router::start(config, RouteTable::new()), accept_raw(&parent));
    let router = router.unwrap();
    let (mut parent_stream, identity) = accepted;
    assert_eq!(identity, "rig-1");

    let mut child = tokio::net::TcpStream::connect(router.local_addr()).await.unwrap();
    write_frame(&mut child, &Frame::identity("raw-child")).await.unwrap();
    eventually("child registered", || router.registry().is_connected("raw-child")).await;

    let pushed = router.push(keys::STATE, "IDLE").unwrap();
    let sent = router.send("raw-child", keys::DATA, 7i64).unwrap();
    let mut expected = vec![pushed.clone(), sent.clone()];
    expected.sort();
    assert_eq!(router.pending(), expected);

    let deadline = Instant::now() + Duration::from_millis(1200);
    let (up, down) = tokio::join!(
        drain_ids(&mut parent_stream, deadline),
        drain_ids(&mut child, deadline)
    );
    assert_eq!(up, vec![pushed.clone(); 3], "parent channel carries only the push");
    assert_eq!(down, vec![sent.clone(); 3], "listener channel carries only the send");
    assert!(router.pending().is_empty());
    assert_eq!(logs.count(&["Delivery failed", &pushed, "parent"]), 1);
    assert_eq!(logs.count(&["Delivery failed", &sent, "listener"]), 1);

    router.release();
}

#[tokio::test]
async fn test_relay_through_two_routers_keeps_bytes() {
    let root = Router::start(router_config("root", None), RouteTable::new()).await.unwrap();
    let r1 = Router::start(router_config("r1", upstream("root", root.local_addr())), RouteTable::new())
        .await
        .unwrap();
    let r2 = Router::start(router_config("r2", upstream("r1", r1.local_addr())), RouteTable::new())
        .await
        .unwrap();

    let mut sink = tokio::net::TcpStream::connect(root.local_addr()).await.unwrap();
    write_frame(&mut sink, &Frame::identity("sink")).await.unwrap();
    let mut source = tokio::net::TcpStream::connect(r2.local_addr()).await.unwrap();
    write_frame(&mut source, &Frame::identity("source")).await.unwrap();
    eventually("sink registered", || root.registry().is_connected("sink")).await;
    eventually("source registered", || r2.registry().is_connected("source")).await;

    let samples = NdArray::new(
        vec![2, 3],
        ArrayData::F64(vec![0.25, -1.5, 3.0, f64::MIN_POSITIVE, 1e12, -0.0]),
    )
    .unwrap();
    let msg = Message::new("source_0", "sink", "source", keys::DATA, Value::map([("samples", Value::Array(samples))]))
        .with_flag(fieldmesh_types::Flag::NoRepeat);
    let bytes = msg.serialize().unwrap();
    write_frame(&mut source, &Frame::new(bytes.clone())).await.unwrap();

    let frame = tokio::time::timeout(WAIT, read_frame(&mut sink))
        .await
        .expect("timed out waiting for the relayed frame")
        .unwrap();
    assert!(frame.hops.is_empty());
    assert_eq!(frame.body, bytes, "relays forward the original bytes");
    assert_eq!(Message::deserialize(frame.body, true).unwrap(), msg);

    r2.release();
    r1.release();
    root.release();
}

#[tokio::test]
async fn test_unroutable_message_is_dropped() {
    let (routes, mut data) = capture_route(keys::DATA);
    let coordinator = Coordinator::start(router_config("coordinator", None), routes)
        .await
        .unwrap();
    let node = Node::start(
        node_config("rig", upstream("coordinator", coordinator.router().local_addr())),
        Listens::new(),
    )
    .await
    .unwrap();

    node.send_opts(Some(Address::from("ghost")), keys::DATA, 1i64, SendOptions::no_repeat());
    node.send(None, keys::DATA, 2i64);
    assert_eq!(recv(&mut data).await, Value::Int(2));
    assert!(!coordinator.router().is_closing());

    node.release();
    coordinator.release();
}

#[tokio::test]
async fn test_continuous_relay_is_rate_limited() {
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let routes = RouteTable::new().on_value(keys::CONTINUOUS, move |_v: Value| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let coordinator = Coordinator::start(router_config("coordinator", None), routes)
        .await
        .unwrap();

    let mut agent_config = router_config("rig-1", upstream("coordinator", coordinator.router().local_addr()));
    agent_config.continuous_hz = Some(10.0);
    let agent = Agent::start(agent_config, RouteTable::new()).await.unwrap();
    assert_eq!(agent.relay_consumers(), vec!["coordinator".to_string()]);

    let leaf = Node::start(
        node_config("imu", upstream("rig-1", agent.router().local_addr())),
        Listens::new(),
    )
    .await
    .unwrap();

    let start = Instant::now();
    for i in 0..150i64 {
        leaf.send_opts(None, keys::CONTINUOUS, i, SendOptions::no_repeat());
        tokio::time::sleep(Duration::from_millis(4)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    let elapsed = start.elapsed().as_secs_f64();

    let delivered = received.load(Ordering::SeqCst);
    let cap = (elapsed * 10.0).ceil() as usize + 2;
    assert!(delivered >= 1, "some samples should be relayed");
    assert!(delivered <= cap, "delivered {delivered} exceeds cap {cap}");
    assert!(delivered < 150);

    leaf.release();
    agent.release();
    coordinator.release();
}

#[tokio::test]
async fn test_stream_batches_unwrap_at_router() {
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let routes = RouteTable::new().on_value("IMU", move |_v: Value| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let coordinator = Coordinator::start(router_config("coordinator", None), routes)
        .await
        .unwrap();
    let node = Node::start(
        node_config("rig", upstream("coordinator", coordinator.router().local_addr())),
        Listens::new(),
    )
    .await
    .unwrap();

    let stream = node.get_stream("IMU", 5, None);
    for i in 0..10i64 {
        stream.put(Value::List(vec![Value::Int(i), Value::Float(0.25)]));
    }
    eventually("all samples dispatched", || received.load(Ordering::SeqCst) == 10).await;
    assert!(node.pending().is_empty());

    node.release();
    coordinator.release();
}

#[tokio::test]
async fn test_kill_closes_router() {
    let router = Router::start(router_config("hub", None), RouteTable::new())
        .await
        .unwrap();
    let node = Node::start(node_config("rig", upstream("hub", router.local_addr())), Listens::new())
        .await
        .unwrap();

    node.send_opts(None, keys::KILL, Value::Null, SendOptions::no_repeat());
    tokio::time::timeout(WAIT, router.closed()).await.unwrap();
    assert!(router.is_closing());

    node.release();
}

// ---------------------------------------------------------------------------
// Coordinator / agent behaviours
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_check_and_handshake() {
    let coordinator = Coordinator::start(router_config("coordinator", None), RouteTable::new())
        .await
        .unwrap();
    let agent = Agent::start(
        router_config("rig-1", upstream("coordinator", coordinator.router().local_addr())),
        RouteTable::new(),
    )
    .await
    .unwrap();

    eventually("handshake recorded", || {
        coordinator
            .device("rig-1")
            .and_then(|d| d.listen)
            .is_some()
    })
    .await;
    assert_eq!(coordinator.check_health(), 1);
    eventually("agent answered the probe with its state", || {
        coordinator.device("rig-1").and_then(|d| d.state).as_deref() == Some("IDLE")
    })
    .await;

    agent.release();
    coordinator.release();
}

#[tokio::test]
async fn test_agent_forwards_state() {
    let coordinator = Coordinator::start(router_config("coordinator", None), RouteTable::new())
        .await
        .unwrap();
    let agent = Agent::start(
        router_config("rig-1", upstream("coordinator", coordinator.router().local_addr())),
        RouteTable::new(),
    )
    .await
    .unwrap();
    let task = Node::start(
        node_config("task", upstream("rig-1", agent.router().local_addr())),
        Listens::new(),
    )
    .await
    .unwrap();

    task.send(None, keys::STATE, "RUNNING");
    eventually("agent state updated", || agent.state() == "RUNNING").await;
    eventually("coordinator saw the new state", || {
        coordinator.device("rig-1").and_then(|d| d.state).as_deref() == Some("RUNNING")
    })
    .await;

    task.release();
    agent.release();
    coordinator.release();
}

#[tokio::test]
async fn test_nested_agents_keep_their_own_state() {
    let coordinator = Coordinator::start(router_config("coordinator", None), RouteTable::new())
        .await
        .unwrap();
    let mut mid_config = router_config("mid", upstream("coordinator", coordinator.router().local_addr()));
    mid_config.heartbeat_interval_ms = 50;
    let mid = Agent::start(mid_config, RouteTable::new()).await.unwrap();
    let mut leaf_config = router_config("leafagent", upstream("mid", mid.router().local_addr()));
    leaf_config.heartbeat_interval_ms = 50;
    let leaf = Agent::start(leaf_config, RouteTable::new()).await.unwrap();

    eventually("nested handshake reached the coordinator", || {
        coordinator
            .device("leafagent")
            .and_then(|d| d.listen)
            .is_some()
    })
    .await;

    leaf.set_state("RUNNING");
    eventually("coordinator booked the nested state", || {
        coordinator.device("leafagent").and_then(|d| d.state).as_deref() == Some("RUNNING")
    })
    .await;
    assert_eq!(mid.state(), "IDLE");

    mid.set_state("PAUSED");
    eventually("coordinator booked the middle state", || {
        coordinator.device("mid").and_then(|d| d.state).as_deref() == Some("PAUSED")
    })
    .await;
    // Several heartbeats in both directions.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(leaf.state(), "RUNNING");
    assert_eq!(mid.state(), "PAUSED");
    assert_eq!(
        coordinator.device("leafagent").and_then(|d| d.state).as_deref(),
        Some("RUNNING")
    );

    leaf.release();
    mid.release();
    coordinator.release();
}

#[tokio::test]
async fn test_file_transfer_to_agent() {
    let served = tempfile::tempdir().unwrap();
    let saved = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(served.path().join("protocols")).unwrap();
    std::fs::write(served.path().join("protocols/free_water.json"), br#"{"reward": 20}"#).unwrap();

    let mut root_config = router_config("coordinator", None);
    root_config.file_root = Some(served.path().to_path_buf());
    let coordinator = Coordinator::start(root_config, RouteTable::new()).await.unwrap();

    let mut agent_config = router_config("rig-1", upstream("coordinator", coordinator.router().local_addr()));
    agent_config.file_root = Some(saved.path().to_path_buf());
    let agent = Agent::start(agent_config, RouteTable::new()).await.unwrap();

    assert!(agent.request_file("protocols/free_water.json").is_some());
    let target = saved.path().join("protocols/free_water.json");
    eventually("file saved", || target.exists()).await;
    eventually("file complete", || {
        std::fs::read(&target).map(|b| b == br#"{"reward": 20}"#).unwrap_or(false)
    })
    .await;

    agent.release();
    coordinator.release();
}
