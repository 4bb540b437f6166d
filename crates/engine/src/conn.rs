use std::collections::HashMap;
use std::pin::Pin;
use std::time::{Duration, Instant};

use domain::{DeliveryState, DriverError};
use futures_util::Stream;

/// Identifies a sender or receiver link by the name the Controller assigned
/// it at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkId(pub String);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token correlating a `SenderHandle::send` call, or a received
/// message, with a later disposition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryHandle(pub u64);

/// Peer-advertised connection properties, used by `dynamic` addressing to
/// pick between legacy and routable address forms.
#[derive(Debug, Clone, Default)]
pub struct PeerProperties {
    pub properties: HashMap<String, String>,
}

impl PeerProperties {
    pub fn supports_routable_addresses(&self) -> bool {
        self.properties
            .get("x-routable-addresses")
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

/// Connection-properties bag built from `Config` at connect time: idle
/// timeout, SSL paths, SASL mechanisms/config, protocol trace flag, process
/// identity (container name).
#[derive(Debug, Clone, Default)]
pub struct ConnectionProps {
    pub container_name: String,
    pub idle_timeout: Duration,
    pub trace: bool,
    pub ssl_ca_file: Option<String>,
    pub ssl_cert_file: Option<String>,
    pub ssl_key_file: Option<String>,
    pub ssl_key_password: Option<String>,
    pub allow_insecure_clients: bool,
    pub sasl_mechanisms: Option<String>,
    pub sasl_config_dir: Option<String>,
    pub sasl_config_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SndSettleMode {
    Mixed,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiverProps {
    pub snd_settle_mode: Option<SndSettleMode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslOutcome {
    Ok,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub ttl: Option<Duration>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub body: Vec<u8>,
    pub handle: DeliveryHandle,
}

/// Every callback the spec's §6 protocol engine surface delivers, folded
/// into a single event stream the Controller consumes from its `select!`
/// loop.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConnectionActive,
    ConnectionClosed,
    ConnectionRemoteClosed(String),
    ConnectionFailed(String),
    SaslDone(SaslOutcome),
    SocketError(String),

    SenderActive(LinkId),
    SenderRemoteClosed(LinkId, String),
    SenderClosed(LinkId),
    SenderFailed(LinkId, String),
    CreditGranted(LinkId, u32),
    Disposition(LinkId, DeliveryHandle, DeliveryState),

    ReceiverActive(LinkId),
    ReceiverRemoteClosed(LinkId, String),
    ReceiverClosed(LinkId),
    ReceiverFailed(LinkId, String),
    MessageReceived(LinkId, InboundMessage),
}

pub type EventStream = Pin<Box<dyn Stream<Item = EngineEvent> + Send>>;

pub trait Connection: Send {
    fn create_sender(
        &mut self,
        name: &str,
        source: &str,
        target: &str,
    ) -> Result<Box<dyn SenderHandle>, DriverError>;

    fn create_receiver(
        &mut self,
        name: &str,
        source: &str,
        target: &str,
        props: ReceiverProps,
    ) -> Result<Box<dyn ReceiverHandle>, DriverError>;

    fn remote_properties(&self) -> &PeerProperties;
    fn active(&self) -> bool;
    fn close(&mut self);
}

pub trait SenderHandle: Send {
    fn send(&mut self, msg: OutboundMessage, deadline: Option<Instant>) -> DeliveryHandle;
    fn credit(&self) -> u32;
    fn active(&self) -> bool;
    fn close(&mut self);
    fn destroy(self: Box<Self>);
}

pub trait ReceiverHandle: Send {
    fn add_capacity(&mut self, n: u32);
    fn capacity(&self) -> u32;
    fn message_accepted(&mut self, handle: DeliveryHandle);
    fn message_released(&mut self, handle: DeliveryHandle);
    fn message_modified(&mut self, handle: DeliveryHandle, delivered: bool, undeliverable: bool);
    fn source_address(&self) -> &str;
    fn target_address(&self) -> &str;
    fn active(&self) -> bool;
    fn closed(&self) -> bool;
    fn close(&mut self);
    fn destroy(self: Box<Self>);
}

/// Entry point: establishes a connection to one host and returns it along
/// with the event stream the Controller will select over for its lifetime.
pub trait Engine: Send {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        props: ConnectionProps,
    ) -> Result<(Box<dyn Connection>, EventStream), DriverError>;
}
