//! End-to-end scenarios driven against `engine::mock`, exercising the whole
//! `Controller` — connect, subscribe, send, RPC round-trip, reconnect — the
//! way a real broker would from the other end of the wire. Placed here
//! rather than as `#[cfg(test)]` modules because each one spins up the I/O
//! thread and drives it across several `select!` iterations.

use std::time::{Duration, Instant};

use bus::{Config, Controller, DeliveryFailureKind, DriverError, Retry, Service, Target};
use engine::mock::{DefaultDisposition, MockEngine};
use engine::LinkId;

/// Surfaces the Controller's `tracing` output under `cargo test -- --nocapture`
/// without requiring every scenario to wire up its own subscriber.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config(hosts: &[&str]) -> Config {
    Config {
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        link_retry_delay: Duration::from_millis(20),
        connection_retry_interval: Duration::from_millis(20),
        connection_retry_interval_max: Duration::from_millis(100),
        ..Default::default()
    }
}

/// Polls `cond` until it's true or `timeout` elapses, sleeping briefly
/// between attempts. Everything the mock engine does happens in-process
/// with no real I/O, so a generous timeout never makes a passing test slow.
fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Like `Receiver::try_recv`, but retried for up to `timeout` instead of
/// failing immediately — used where a test can't tell in advance which of
/// two receivers a delivery should land on.
fn try_recv_within(rx: &mut tokio::sync::mpsc::Receiver<bus::Delivery>, timeout: Duration) -> Option<bus::Delivery> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(d) = rx.try_recv() {
            return Some(d);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn simple_cast_delivers_one_message() {
    init_tracing();
    let (engine, broker) = MockEngine::new();
    let controller = Controller::new(test_config(&["broker.test:5672"]), Box::new(engine));

    let target = Target::new("t");
    // Subscribed before connect() so the very first attach pass (on the
    // Idle -> ReplyPending transition) picks it up deterministically.
    let (mut inbound, sub_handle) = controller.subscribe(target.clone(), Service::Notify, "listener-1", 10);
    controller.connect();
    sub_handle.wait().expect("subscribe completes immediately");

    assert!(
        wait_until(Duration::from_secs(1), || !broker.opened_receivers().is_empty()),
        "subscription never opened its receiver link"
    );
    let receivers = broker.opened_receivers();
    assert_eq!(receivers.len(), 1, "a Notify subscription opens exactly one anycast receiver");
    let (link_id, _address) = receivers[0].clone();

    // Let the connection finish its ReplyPending -> Active transition before
    // sending: a send issued while still ReplyPending would just sit queued
    // on a sender link nothing attaches until the next reconnect.
    assert!(
        wait_until(Duration::from_secs(1), || broker
            .opened_receivers()
            .iter()
            .any(|(id, _)| id.0 == "rpc-response")),
        "reply receiver link was never opened"
    );
    std::thread::sleep(Duration::from_millis(50));

    let send_handle = controller.send(
        target,
        Service::Notify,
        b"value".to_vec(),
        None,
        false,
        Retry::new(Some(0)),
        false,
    );
    send_handle.wait().expect("fire-and-forget send completes once dispatched");

    broker.deliver(link_id, None, None, b"value".to_vec());

    let delivery = inbound.blocking_recv().expect("listener receives the forwarded message");
    assert_eq!(delivery.body, b"value");

    controller.shutdown(Duration::from_secs(1));
}

#[test]
fn rpc_call_completes_from_echoed_reply() {
    init_tracing();
    let (engine, broker) = MockEngine::new();
    let controller = Controller::new(test_config(&["broker.test:5672"]), Box::new(engine));
    controller.connect();

    // Give the connect -> ReplyPending -> Active chain a moment to finish
    // before issuing the call, so it isn't stuck pending on a link that
    // the (by-then-past) ReplyPending->Active attach pass never reached.
    assert!(
        wait_until(Duration::from_secs(1), || broker
            .opened_receivers()
            .iter()
            .any(|(id, _)| id.0 == "rpc-response")),
        "reply receiver link was never opened"
    );
    std::thread::sleep(Duration::from_millis(50));

    let deadline = Instant::now() + Duration::from_secs(5);
    let handle = controller.rpc_call(
        Target::new("echo").with_server("worker-1"),
        b"ping".to_vec(),
        deadline,
        Retry::new(Some(0)),
    );

    let sent = {
        let mut sent = Vec::new();
        assert!(
            wait_until(Duration::from_secs(1), || {
                sent = broker.take_sent();
                !sent.is_empty()
            }),
            "rpc call was never dispatched to the mock sender"
        );
        sent
    };
    assert_eq!(sent.len(), 1);
    let (_link, outbound) = &sent[0];
    assert_eq!(outbound.body, b"ping");
    let correlation_id = outbound.correlation_id.clone().expect("rpc sends carry a correlation id");

    broker.deliver(
        LinkId("rpc-response".to_string()),
        Some(correlation_id.clone()),
        None,
        b"pong".to_vec(),
    );

    let reply = handle.wait().expect("echoed reply completes the call");
    assert_eq!(reply.correlation_id, Some(correlation_id));
    assert_eq!(reply.body, b"pong");

    controller.shutdown(Duration::from_secs(1));
}

#[test]
fn fanout_reaches_every_listener_but_anycast_reaches_one() {
    init_tracing();
    let (engine, broker) = MockEngine::new();
    let controller = Controller::new(test_config(&["broker.test:5672"]), Box::new(engine));

    let target_a = Target::new("work").with_server("s1");
    let target_b = Target::new("work").with_server("s2");
    let (mut inbound_a, sub_a) = controller.subscribe(target_a, Service::Rpc, "listener-a", 10);
    let (mut inbound_b, sub_b) = controller.subscribe(target_b, Service::Rpc, "listener-b", 10);
    controller.connect();
    sub_a.wait().expect("listener-a subscribe completes");
    sub_b.wait().expect("listener-b subscribe completes");

    assert!(
        wait_until(Duration::from_secs(1), || broker.opened_receivers().len() >= 6),
        "both RPC subscriptions should open 3 receiver links each (unicast/multicast/anycast)"
    );

    let receivers = broker.opened_receivers();
    let multicast: Vec<LinkId> = receivers
        .iter()
        .filter(|(_, addr)| addr.starts_with("broadcast"))
        .map(|(id, _)| id.clone())
        .collect();
    let anycast: Vec<LinkId> = receivers
        .iter()
        .filter(|(_, addr)| addr.starts_with("unicast"))
        .map(|(id, _)| id.clone())
        .collect();
    assert_eq!(multicast.len(), 2, "both listeners open their own multicast link for the shared address");
    assert_eq!(anycast.len(), 2, "both listeners open their own anycast link for the shared address");

    // Fanout: the broker routes a multicast message to every listener's
    // multicast receiver link.
    for link in &multicast {
        broker.deliver(link.clone(), None, None, b"fanout".to_vec());
    }
    let a_fanout = inbound_a.blocking_recv().expect("listener-a gets the fanout copy");
    let b_fanout = inbound_b.blocking_recv().expect("listener-b gets the fanout copy");
    assert_eq!(a_fanout.body, b"fanout");
    assert_eq!(b_fanout.body, b"fanout");

    // Anycast: the broker picks exactly one competing consumer — delivering
    // to a single anycast receiver link must not fan out to both listeners.
    broker.deliver(anycast[0].clone(), None, None, b"anycast".to_vec());
    let a_got_it = try_recv_within(&mut inbound_a, Duration::from_millis(300));
    let b_got_it = try_recv_within(&mut inbound_b, Duration::from_millis(300));
    assert!(
        a_got_it.is_some() ^ b_got_it.is_some(),
        "exactly one listener should receive a single anycast delivery, got a={a_got_it:?} b={b_got_it:?}"
    );

    controller.shutdown(Duration::from_secs(1));
}

#[test]
fn black_holed_receiver_times_out() {
    init_tracing();
    let (engine, broker) = MockEngine::new();
    broker.set_default_disposition(DefaultDisposition::BlackHole);
    let controller = Controller::new(test_config(&["broker.test:5672"]), Box::new(engine));
    controller.connect();
    std::thread::sleep(Duration::from_millis(100));

    let deadline = Instant::now() + Duration::from_millis(200);
    let handle = controller.send(
        Target::new("sink"),
        Service::Notify,
        b"nobody acks this".to_vec(),
        Some(deadline),
        true,
        Retry::new(Some(0)),
        true,
    );

    let started = Instant::now();
    let result = handle.wait();
    let elapsed = started.elapsed();

    assert_eq!(result, Err(DriverError::Timeout));
    assert!(elapsed < Duration::from_secs(2), "timeout fired long after its deadline: {elapsed:?}");

    controller.shutdown(Duration::from_secs(1));
}

#[test]
fn rpc_call_accepted_with_no_reply_times_out() {
    init_tracing();
    let (engine, broker) = MockEngine::new();
    let controller = Controller::new(test_config(&["broker.test:5672"]), Box::new(engine));
    controller.connect();

    assert!(
        wait_until(Duration::from_secs(1), || broker
            .opened_receivers()
            .iter()
            .any(|(id, _)| id.0 == "rpc-response")),
        "reply receiver link was never opened"
    );
    std::thread::sleep(Duration::from_millis(50));

    // The mock broker's default disposition is AutoAccept, so this send is
    // ACCEPTED on the wire immediately. Nothing ever calls `broker.deliver`
    // with the reply's correlation id, simulating a responder that took the
    // request and then never answered. The call must still fail with
    // `Timeout` at its deadline rather than hang (spec §4.2/§8).
    let deadline = Instant::now() + Duration::from_millis(200);
    let handle = controller.rpc_call(
        Target::new("echo").with_server("worker-1"),
        b"ping".to_vec(),
        deadline,
        Retry::new(Some(0)),
    );

    let started = Instant::now();
    let result = handle.wait();
    let elapsed = started.elapsed();

    assert_eq!(result, Err(DriverError::Timeout));
    assert!(elapsed < Duration::from_secs(2), "timeout fired long after its deadline: {elapsed:?}");

    controller.shutdown(Duration::from_secs(1));
}

#[test]
fn reconnect_backoff_grows_then_caps() {
    init_tracing();
    let (engine, broker) = MockEngine::new();
    let engine = engine.fail_next_connects(4);
    let mut cfg = test_config(&["broker.test:5672"]);
    cfg.connection_retry_interval = Duration::from_millis(20);
    cfg.connection_retry_backoff = 2;
    cfg.connection_retry_interval_max = Duration::from_millis(80);
    let controller = Controller::new(cfg, Box::new(engine));
    controller.connect();

    // Four scripted connect failures in a row force five total connect
    // attempts (the initial one plus four retries), each gated behind the
    // doubling-then-capped delay from spec §4.7/§8. Sample a timestamp each
    // time `take_connects()` reports a new attempt so the gaps between them
    // can be checked against that shape without waiting out the real
    // (production-sized) back-off.
    // Samples are taken from when this test *observes* each connect via
    // polling, not from when `controller.connect()` was called: the I/O
    // thread's startup plus its first `engine.connect()` call is an
    // unpredictable delay that has nothing to do with back-off, and
    // folding it into the first gap would bias that gap high relative to
    // the later ones. Polling every 2ms against gaps of 20ms+ keeps that
    // observation lag small and uniform across every attempt.
    let mut timestamps: Vec<Instant> = Vec::new();
    let mut seen = 0usize;
    let deadline = Instant::now() + Duration::from_secs(3);
    while seen < 5 && Instant::now() < deadline {
        let connects = broker.take_connects();
        for _ in &connects {
            timestamps.push(Instant::now());
        }
        seen += connects.len();
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(
        seen >= 5,
        "expected 5 connect attempts (1 initial + 4 retries), saw {seen}"
    );

    let gaps: Vec<Duration> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();
    // Expected shape (cfg above): ~20, ~40, ~80, ~80ms. Generous slack
    // accounts for scheduling jitter on the dedicated I/O thread; the
    // property under test is growth-then-cap, not exact timing.
    assert!(
        gaps[1] > gaps[0],
        "second gap should be longer than the first (still doubling), got {gaps:?}"
    );
    assert!(
        gaps.iter().skip(2).all(|g| *g + Duration::from_millis(10) >= Duration::from_millis(80)),
        "later gaps should have reached the configured cap, got {gaps:?}"
    );

    controller.shutdown(Duration::from_secs(1));
}

#[test]
fn send_survives_retries_within_budget() {
    init_tracing();
    let (engine, broker) = MockEngine::new();
    broker.reject_next_sender_opens(2);
    let controller = Controller::new(test_config(&["broker.test:5672"]), Box::new(engine));
    controller.connect();
    std::thread::sleep(Duration::from_millis(100));

    // Two scripted rejections, a retry budget of exactly 2: the task
    // survives both resets (Retry::Remaining(2) only fails on a *third*
    // reset) and dispatches successfully once the broker stops rejecting.
    let handle = controller.send(
        Target::new("flaky"),
        Service::Notify,
        b"eventually-sent".to_vec(),
        None,
        false,
        Retry::new(Some(2)),
        true,
    );

    handle.wait().expect("send survives exactly as many resets as its retry budget allows");

    controller.shutdown(Duration::from_secs(1));
}

#[test]
fn send_fails_once_retries_exhausted() {
    init_tracing();
    let (engine, broker) = MockEngine::new();
    broker.reject_next_sender_opens(3);
    let controller = Controller::new(test_config(&["broker.test:5672"]), Box::new(engine));
    controller.connect();
    std::thread::sleep(Duration::from_millis(100));

    // Three scripted rejections against a budget of 2: the third reset
    // finds the counter already at zero and fails the task outright.
    let handle = controller.send(
        Target::new("flaky"),
        Service::Notify,
        b"never-sent".to_vec(),
        None,
        false,
        Retry::new(Some(2)),
        true,
    );

    let result = handle.wait();
    assert_eq!(
        result,
        Err(DriverError::DeliveryFailure(DeliveryFailureKind::RetriesExhausted))
    );

    controller.shutdown(Duration::from_secs(1));
}

#[test]
fn failover_advances_to_the_next_host_and_keeps_working() {
    init_tracing();
    let (engine, broker) = MockEngine::new();
    let engine = engine.fail_next_connects(1);
    let controller = Controller::new(
        test_config(&["host-a.test:5672", "host-b.test:5672"]),
        Box::new(engine),
    );
    controller.connect();

    // `start_connect` runs synchronously before the I/O thread's first
    // `select!` iteration, and the scripted failure/retry chain after it is
    // all in-process — 150ms is ample for the failed connect, the
    // `connection_retry_interval` backoff (20ms in `test_config`), and the
    // successful reconnect to land.
    std::thread::sleep(Duration::from_millis(150));

    let connects = broker.take_connects();
    assert!(connects.len() >= 2, "expected a failed connect followed by a retry, got {connects:?}");
    // HostList starts at a random cursor, so the exact first host isn't
    // predictable, but the retry must land on the *other* configured host.
    assert_ne!(
        connects[0].0, connects[1].0,
        "HostList should advance to the other host after the first connect fails, got {connects:?}"
    );

    // The driver should be fully usable after failing over.
    assert!(
        wait_until(Duration::from_secs(1), || broker
            .opened_receivers()
            .iter()
            .any(|(id, _)| id.0 == "rpc-response")),
        "reply receiver never attached after failover"
    );
    std::thread::sleep(Duration::from_millis(50));

    let deadline = Instant::now() + Duration::from_secs(5);
    let handle = controller.rpc_call(
        Target::new("after-failover"),
        b"ping".to_vec(),
        deadline,
        Retry::new(Some(0)),
    );
    let mut sent = Vec::new();
    assert!(
        wait_until(Duration::from_secs(1), || {
            sent = broker.take_sent();
            !sent.is_empty()
        }),
        "post-failover rpc call was never dispatched"
    );
    let correlation_id = sent[0].1.correlation_id.clone().expect("rpc sends carry a correlation id");
    broker.deliver(LinkId("rpc-response".to_string()), Some(correlation_id), None, b"pong".to_vec());
    let reply = handle.wait().expect("post-failover rpc call completes");
    assert_eq!(reply.body, b"pong");

    controller.shutdown(Duration::from_secs(1));
}
