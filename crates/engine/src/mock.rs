//! An in-memory stand-in for a real AMQP 1.0 engine, used by `bus`'s own
//! tests. A test drives the "broker side" directly through `MockBroker`
//! while the Controller only ever sees the `Engine`/`Connection`/
//! `SenderHandle`/`ReceiverHandle` trait objects — the same shape a real
//! proton-backed engine would present.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use domain::{DeliveryState, DriverError};
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::conn::{
    Connection, ConnectionProps, DeliveryHandle, Engine, EngineEvent, EventStream,
    InboundMessage, LinkId, OutboundMessage, PeerProperties, ReceiverHandle, ReceiverProps,
    SenderHandle,
};

struct EventReceiver(mpsc::UnboundedReceiver<EngineEvent>);

impl Stream for EventReceiver {
    type Item = EngineEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

/// How a `MockBroker` resolves an outbound send it has not been given
/// explicit instructions for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultDisposition {
    AutoAccept,
    /// Never dispositions the send; only a per-task timeout will end it.
    BlackHole,
}

struct BrokerInner {
    events: mpsc::UnboundedSender<EngineEvent>,
    next_delivery: u64,
    peer_properties: PeerProperties,
    default_disposition: DefaultDisposition,
    reject_link_opens: HashMap<LinkId, u32>,
    reject_next_sender_opens: u32,
    sent: Vec<(LinkId, OutboundMessage)>,
    receivers_opened: Vec<(LinkId, String)>,
    connects: Vec<(String, u16)>,
}

/// A handle a test holds to script and inspect the "other end" of a
/// connection: accept/reject sends, push inbound messages, fail links, etc.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MockBroker {
    pub fn peer_properties(&self) -> PeerProperties {
        self.inner.lock().unwrap().peer_properties.clone()
    }

    pub fn set_peer_properties(&self, properties: PeerProperties) {
        self.inner.lock().unwrap().peer_properties = properties;
    }

    pub fn set_default_disposition(&self, d: DefaultDisposition) {
        self.inner.lock().unwrap().default_disposition = d;
    }

    /// Make the next `n` attempts to open the named link fail immediately
    /// after becoming active, simulating the broker closing new links.
    pub fn reject_link_opens(&self, link: LinkId, n: u32) {
        self.inner.lock().unwrap().reject_link_opens.insert(link, n);
    }

    /// Make the next `n` sender-link opens fail regardless of which
    /// destination they're for, simulating a broker that is closing every
    /// new sending link for a while (e.g. while failing over).
    pub fn reject_next_sender_opens(&self, n: u32) {
        self.inner.lock().unwrap().reject_next_sender_opens = n;
    }

    /// Every `(host, port)` pair the engine was asked to connect to, in
    /// order — lets a test confirm the `HostList` cursor actually advanced
    /// across a reconnect.
    pub fn take_connects(&self) -> Vec<(String, u16)> {
        std::mem::take(&mut self.inner.lock().unwrap().connects)
    }

    pub fn push_event(&self, event: EngineEvent) {
        let _ = self.inner.lock().unwrap().events.send(event);
    }

    /// Simulate an inbound message arriving on a receiver link, as if
    /// forwarded by the broker after a send elsewhere reached it.
    pub fn deliver(&self, link: LinkId, correlation_id: Option<String>, reply_to: Option<String>, body: Vec<u8>) {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_delivery += 1;
            DeliveryHandle(inner.next_delivery)
        };
        self.push_event(EngineEvent::MessageReceived(
            link,
            InboundMessage {
                correlation_id,
                reply_to,
                body,
                handle,
            },
        ));
    }

    pub fn fail_connection(&self, reason: impl Into<String>) {
        self.push_event(EngineEvent::ConnectionFailed(reason.into()));
    }

    pub fn close_connection(&self) {
        self.push_event(EngineEvent::ConnectionClosed);
    }

    /// Drains every message handed to `SenderHandle::send` since the last
    /// call, letting a test read back the `correlation_id`/`reply_to` the
    /// Controller stamped on an outbound request before scripting a reply.
    pub fn take_sent(&self) -> Vec<(LinkId, OutboundMessage)> {
        std::mem::take(&mut self.inner.lock().unwrap().sent)
    }

    /// Every receiver link opened so far, as `(link_id, source_address)` —
    /// lets a test discover the `LinkId` a `SubscriptionServer` assigned a
    /// given address without depending on the Controller's internal key
    /// format.
    pub fn opened_receivers(&self) -> Vec<(LinkId, String)> {
        self.inner.lock().unwrap().receivers_opened.clone()
    }
}

/// A mock `Engine`. Every `connect()` call shares state with the
/// `MockBroker` it was built from, so a test can act as the remote peer
/// across reconnects.
pub struct MockEngine {
    broker: Arc<Mutex<BrokerInner>>,
    peer_properties: PeerProperties,
    default_disposition: DefaultDisposition,
    connect_failures_remaining: u32,
}

impl MockEngine {
    pub fn new() -> (Self, MockBroker) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Mutex::new(BrokerInner {
            events: tx,
            next_delivery: 0,
            peer_properties: PeerProperties::default(),
            default_disposition: DefaultDisposition::AutoAccept,
            reject_link_opens: HashMap::new(),
            reject_next_sender_opens: 0,
            sent: Vec::new(),
            receivers_opened: Vec::new(),
            connects: Vec::new(),
        }));
        let broker = MockBroker {
            inner: inner.clone(),
        };
        (
            MockEngine {
                broker: inner,
                peer_properties: PeerProperties::default(),
                default_disposition: DefaultDisposition::AutoAccept,
                connect_failures_remaining: 0,
            },
            broker,
        )
    }

    /// Fail the next `n` connect attempts with `ConnectionFailed`, exercising
    /// HostList failover without needing real sockets.
    pub fn fail_next_connects(mut self, n: u32) -> Self {
        self.connect_failures_remaining = n;
        self
    }
}

impl Engine for MockEngine {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        _props: ConnectionProps,
    ) -> Result<(Box<dyn Connection>, EventStream), DriverError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.broker.lock().unwrap();
            inner.events = tx.clone();
            inner.connects.push((host.to_string(), port));
            self.peer_properties = inner.peer_properties.clone();
            self.default_disposition = inner.default_disposition;
        }

        if self.connect_failures_remaining > 0 {
            self.connect_failures_remaining -= 1;
            let _ = tx.send(EngineEvent::ConnectionFailed(
                "mock: scripted connect failure".to_string(),
            ));
        } else {
            let _ = tx.send(EngineEvent::ConnectionActive);
        }

        let conn = MockConnection {
            broker: self.broker.clone(),
            events: tx,
            peer_properties: self.peer_properties.clone(),
            default_disposition: self.default_disposition,
            active: true,
        };
        let stream: EventStream = Box::pin(EventReceiver(rx));
        Ok((Box::new(conn), stream))
    }
}

pub struct MockConnection {
    broker: Arc<Mutex<BrokerInner>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    peer_properties: PeerProperties,
    default_disposition: DefaultDisposition,
    active: bool,
}

impl Connection for MockConnection {
    fn create_sender(
        &mut self,
        name: &str,
        _source: &str,
        _target: &str,
    ) -> Result<Box<dyn SenderHandle>, DriverError> {
        let link = LinkId(name.to_string());
        let rejected = {
            let mut inner = self.broker.lock().unwrap();
            let rejected_by_name = match inner.reject_link_opens.get_mut(&link) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            let rejected_global = if inner.reject_next_sender_opens > 0 {
                inner.reject_next_sender_opens -= 1;
                true
            } else {
                false
            };
            rejected_by_name || rejected_global
        };
        if rejected {
            let _ = self
                .events
                .send(EngineEvent::SenderClosed(link.clone()));
        } else {
            let _ = self.events.send(EngineEvent::SenderActive(link.clone()));
            let _ = self.events.send(EngineEvent::CreditGranted(link.clone(), 100));
        }
        Ok(Box::new(MockSenderHandle {
            link,
            broker: self.broker.clone(),
            events: self.events.clone(),
            default_disposition: self.default_disposition,
            credit: 100,
            next_delivery: Arc::new(AtomicU64::new(1)),
            active: !rejected,
        }))
    }

    fn create_receiver(
        &mut self,
        name: &str,
        source: &str,
        target: &str,
        _props: ReceiverProps,
    ) -> Result<Box<dyn ReceiverHandle>, DriverError> {
        let link = LinkId(name.to_string());
        self.broker
            .lock()
            .unwrap()
            .receivers_opened
            .push((link.clone(), source.to_string()));
        let _ = self.events.send(EngineEvent::ReceiverActive(link.clone()));
        Ok(Box::new(MockReceiverHandle {
            link,
            source: source.to_string(),
            target: target.to_string(),
            capacity: 0,
            active: true,
            closed: false,
        }))
    }

    fn remote_properties(&self) -> &PeerProperties {
        &self.peer_properties
    }

    fn active(&self) -> bool {
        self.active
    }

    fn close(&mut self) {
        self.active = false;
        let _ = self.events.send(EngineEvent::ConnectionClosed);
    }
}

pub struct MockSenderHandle {
    link: LinkId,
    broker: Arc<Mutex<BrokerInner>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    default_disposition: DefaultDisposition,
    credit: u32,
    next_delivery: Arc<AtomicU64>,
    active: bool,
}

impl SenderHandle for MockSenderHandle {
    fn send(&mut self, msg: OutboundMessage, _deadline: Option<Instant>) -> DeliveryHandle {
        let id = self.next_delivery.fetch_add(1, Ordering::Relaxed);
        let handle = DeliveryHandle(id);
        if self.credit > 0 {
            self.credit -= 1;
        }
        self.broker
            .lock()
            .unwrap()
            .sent
            .push((self.link.clone(), msg));
        match self.default_disposition {
            DefaultDisposition::AutoAccept => {
                let _ = self.events.send(EngineEvent::Disposition(
                    self.link.clone(),
                    handle,
                    DeliveryState::Accepted,
                ));
            }
            DefaultDisposition::BlackHole => {}
        }
        handle
    }

    fn credit(&self) -> u32 {
        self.credit
    }

    fn active(&self) -> bool {
        self.active
    }

    fn close(&mut self) {
        self.active = false;
        let _ = self.events.send(EngineEvent::SenderClosed(self.link.clone()));
    }

    fn destroy(self: Box<Self>) {}
}

pub struct MockReceiverHandle {
    link: LinkId,
    source: String,
    target: String,
    capacity: u32,
    active: bool,
    closed: bool,
}

impl ReceiverHandle for MockReceiverHandle {
    fn add_capacity(&mut self, n: u32) {
        self.capacity += n;
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn message_accepted(&mut self, _handle: DeliveryHandle) {
        self.capacity = self.capacity.saturating_sub(1);
    }

    fn message_released(&mut self, _handle: DeliveryHandle) {
        self.capacity = self.capacity.saturating_sub(1);
    }

    fn message_modified(&mut self, _handle: DeliveryHandle, _delivered: bool, _undeliverable: bool) {
        self.capacity = self.capacity.saturating_sub(1);
    }

    fn source_address(&self) -> &str {
        &self.source
    }

    fn target_address(&self) -> &str {
        &self.target
    }

    fn active(&self) -> bool {
        self.active
    }

    fn closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.active = false;
        self.closed = true;
    }

    fn destroy(self: Box<Self>) {}
}
