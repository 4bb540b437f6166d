//! The external protocol-engine collaborator surface.
//!
//! A real implementation wraps an AMQP 1.0 library (link/session mechanics,
//! SASL/TLS) behind these traits. `mock` provides an in-memory stand-in used
//! by `bus`'s own tests, in the same spirit as this workspace's `bus::rpc`
//! in-process request registry standing in for a transport-backed one.

mod addresser;
mod conn;
pub mod mock;

pub use addresser::{
    AddresserFactory, AddressingMode, LegacyAddresser, LegacyPrefixes, RoutableAddresser,
    RoutablePrefixes,
};
pub use conn::{
    Connection, ConnectionProps, DeliveryHandle, Engine, EngineEvent, EventStream,
    InboundMessage, LinkId, OutboundMessage, PeerProperties, ReceiverHandle, ReceiverProps,
    SaslOutcome, SenderHandle, SndSettleMode,
};

/// Given a Target and Service, the common unicast/multicast/anycast selection
/// rule every `Addresser` implementation shares (only prefix construction
/// differs between legacy and routable addressing).
pub trait Addresser: Send + Sync {
    fn resolve(&self, target: &domain::Target, service: domain::Service) -> domain::Address {
        if target.fanout {
            self.multicast_address(target, service)
        } else if target.server.is_some() {
            self.unicast_address(target, service)
        } else {
            self.anycast_address(target, service)
        }
    }

    fn unicast_address(&self, target: &domain::Target, service: domain::Service) -> domain::Address;
    fn multicast_address(&self, target: &domain::Target, service: domain::Service) -> domain::Address;
    fn anycast_address(&self, target: &domain::Target, service: domain::Service) -> domain::Address;
    fn is_multicast(&self, address: &domain::Address) -> bool;
    fn is_anycast(&self, address: &domain::Address) -> bool;
}
